use std::{
    error::Error,
    io,
    sync::mpsc::{self, TryRecvError},
    thread,
    time::{Duration, Instant},
};

use clap::Parser;
use voxlink::{
    Client, ClientConfig, MemorySceneHost, SceneHost,
    cli::{Command, CommandError, prompt},
    network::ConnectionState,
};

#[derive(Parser)]
#[command(version, about = "Headless voxlink client with a remote console", long_about = None)]
struct Cli {
    /// Server host name or address
    #[arg(default_value = "127.0.0.1")]
    host: String,
    /// Server port
    #[arg(short, long, default_value_t = voxlink::config::DEFAULT_PORT)]
    port: u16,
    /// Name shown to other session members
    #[arg(short, long, default_value = "anonymous")]
    username: String,
    /// Session password
    #[arg(long, default_value = "")]
    password: String,
    /// Password for remote console commands
    #[arg(long, default_value = voxlink::config::DEFAULT_RCON_PASSWORD)]
    rcon_password: String,
    /// Additional key=value settings
    #[arg(short = 's', long = "set")]
    settings: Vec<String>,
}

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize env_logger; server log messages are printed through it
    env_logger::init();

    let cli = Cli::parse();
    let mut config = ClientConfig {
        host: cli.host,
        port: cli.port,
        username: cli.username,
        password: cli.password,
        ..ClientConfig::default()
    };
    for setting in &cli.settings {
        config.apply(setting)?;
    }

    let mut client = Client::new(config, MemorySceneHost::new())?;
    client.connect()?;

    // Reading stdin blocks, so it lives on its own thread.
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        loop {
            let result = prompt(io::stdin().lock(), io::stdout().lock());
            let done = matches!(
                result,
                Ok(Command::Exit) | Err(CommandError::EndOfInput) | Err(CommandError::Io(_))
            );
            if tx.send(result).is_err() || done {
                break;
            }
        }
    });

    let started = Instant::now();
    let mut was_connected = false;
    loop {
        client.update(started.elapsed().as_secs_f64());

        match client.state() {
            ConnectionState::Connected => was_connected = true,
            ConnectionState::Disconnected => {
                eprintln!(
                    "{}",
                    if was_connected {
                        "connection closed"
                    } else {
                        "could not connect"
                    }
                );
                break;
            }
            ConnectionState::Connecting => {}
        }

        match rx.try_recv() {
            Ok(Ok(Command::Exit)) => {
                client.disconnect();
                client.update(started.elapsed().as_secs_f64());
                break;
            }
            Ok(Ok(Command::Status)) => {
                let host = client.session().host();
                println!(
                    "{:?}, scene: {} bytes, pending changes: {}, server scripts: {}",
                    client.state(),
                    host.scene_state().map_or(0, |s| s.len()),
                    host.changes().len(),
                    host.remote_scripts().join(", ")
                );
            }
            Ok(Ok(Command::Scripts)) => {
                client.request_scripts();
            }
            Ok(Ok(Command::CreateScript { name, source })) => {
                client.create_script(&name, &source);
            }
            Ok(Ok(Command::Rcon(line))) => {
                client.execute_command(&cli.rcon_password, &line);
            }
            Ok(Err(CommandError::EndOfInput)) | Err(TryRecvError::Disconnected) => {
                client.disconnect();
                client.update(started.elapsed().as_secs_f64());
                break;
            }
            Ok(Err(e)) => eprintln!("error: {e}"),
            Err(TryRecvError::Empty) => {}
        }

        thread::sleep(Duration::from_millis(10));
    }

    Ok(())
}
