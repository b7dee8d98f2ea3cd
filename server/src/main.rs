use clap::Parser;
use log::{error, info};
use server::config::ServerConfig;
use server::network::Server;
use server::shutdown::Shutdown;
use shared::{ACTION_COOLDOWN_MS, DEFAULT_MAP_HEIGHT, DEFAULT_MAP_WIDTH, TICK_RATE};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "3000")]
    port: u16,

    /// Tick rate (updates per second)
    #[arg(short, long, default_value_t = TICK_RATE)]
    tick_rate: u32,

    /// Map width in tiles
    #[arg(long, default_value_t = DEFAULT_MAP_WIDTH)]
    map_width: i64,

    /// Map height in tiles
    #[arg(long, default_value_t = DEFAULT_MAP_HEIGHT)]
    map_height: i64,

    /// Minimum milliseconds between two accepted actions of one player
    #[arg(long, default_value_t = ACTION_COOLDOWN_MS)]
    cooldown_ms: u64,

    /// Events buffered between the simulation and delivery
    #[arg(long, default_value = "1024")]
    event_buffer: usize,

    /// Undelivered events a single session may hold before it is dropped
    #[arg(long, default_value = "256")]
    session_buffer: usize,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            host: args.host,
            port: args.port,
            tick_rate: args.tick_rate,
            map_width: args.map_width,
            map_height: args.map_height,
            cooldown_ms: args.cooldown_ms,
            event_buffer: args.event_buffer,
            session_buffer: args.session_buffer,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from(Args::parse());
    info!(
        "Starting server on {} at {}Hz",
        config.address(),
        config.tick_rate
    );

    // Config or map failures abort before any task starts
    let server = Server::bind(config).await?;
    let shutdown = Shutdown::new();

    let mut server_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { server.run(shutdown).await })
    };

    tokio::select! {
        result = &mut server_handle => {
            match result {
                Ok(Err(e)) => error!("Server stopped with error: {}", e),
                Err(e) => error!("Server task panicked: {}", e),
                Ok(Ok(())) => {}
            }
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    shutdown.trigger();
    if let Ok(Err(e)) = server_handle.await {
        error!("Server stopped with error: {}", e);
    }
    Ok(())
}
