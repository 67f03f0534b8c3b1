use std::{
    error::Error,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use clap::Parser;
use log::info;
use voxlink::{MemorySceneHost, Server, ServerConfig};

#[derive(Debug, Parser)]
#[command(version, about = "Headless voxlink session server", long_about = None)]
struct Cli {
    /// Interface address to listen on
    #[arg(short, long, default_value = voxlink::config::DEFAULT_INTERFACE)]
    interface: String,
    /// Port to listen on
    #[arg(short, long, default_value_t = voxlink::config::DEFAULT_PORT)]
    port: u16,
    /// Session password clients must present
    #[arg(long, default_value = "")]
    password: String,
    /// Password for remote console commands
    #[arg(long, default_value = voxlink::config::DEFAULT_RCON_PASSWORD)]
    rcon_password: String,
    /// Maximum number of connected clients
    #[arg(long, default_value_t = voxlink::config::DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,
    /// Additional key=value settings
    #[arg(short = 's', long = "set")]
    settings: Vec<String>,
    /// Milliseconds between two ticks
    #[arg(long, default_value_t = 10)]
    tick_ms: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut config = ServerConfig {
        interface: cli.interface,
        port: cli.port,
        password: cli.password,
        rcon_password: cli.rcon_password,
        max_connections: cli.max_connections,
        ..ServerConfig::default()
    };
    for setting in &cli.settings {
        config.apply(setting)?;
    }

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst))?;

    let mut server = Server::new(config, MemorySceneHost::new())?;
    server.start()?;

    let started = Instant::now();
    let tick = Duration::from_millis(cli.tick_ms);
    while running.load(Ordering::SeqCst) {
        server.update(started.elapsed().as_secs_f64());
        thread::sleep(tick);
    }

    info!("shutting down");
    server.stop();
    Ok(())
}
