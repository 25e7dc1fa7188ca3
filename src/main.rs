//! castline - Low-latency peer-to-peer remote display sessions

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use castline::config::{default_data_dir, EngineConfig, HostConfig};
use castline::{Engine, StatsSnapshot};

#[derive(Parser)]
#[command(name = "castline")]
#[command(about = "Low-latency peer-to-peer remote display sessions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or create the local identity
    Identity {
        /// Identity storage directory
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Host a session streaming the display
    Host {
        /// UDP port to listen on
        #[arg(short, long, default_value = "5600")]
        port: u16,

        /// Stream width in pixels
        #[arg(long)]
        width: Option<u32>,

        /// Stream height in pixels
        #[arg(long)]
        height: Option<u32>,

        /// Frames per second
        #[arg(long)]
        fps: Option<u32>,

        /// Target bitrate in kbps
        #[arg(long)]
        bitrate: Option<u32>,

        /// Identity storage directory
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Join a host directly
    Join {
        /// Host address (IP or name)
        host: String,

        /// Host UDP port
        #[arg(short, long, default_value = "5600")]
        port: u16,
    },

    /// Ask a user on the signaling server for a session
    Call {
        /// Username to call
        target: String,

        /// Signaling token
        #[arg(short, long, env = "CASTLINE_TOKEN")]
        token: String,

        /// Signaling server URL (overrides the config file)
        #[arg(short, long)]
        server: Option<String>,

        /// Identity storage directory
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Stay reachable on the signaling server and host incoming calls
    Listen {
        /// Signaling token
        #[arg(short, long, env = "CASTLINE_TOKEN")]
        token: String,

        /// Signaling server URL (overrides the config file)
        #[arg(short, long)]
        server: Option<String>,

        /// UDP port to host on
        #[arg(short, long, default_value = "5600")]
        port: u16,

        /// Identity storage directory
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("tracing subscriber already set");
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => Ok(EngineConfig::load_from(path)?),
        None => match EngineConfig::load() {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!("Using default config: {}", e);
                Ok(EngineConfig::default())
            }
        },
    }
}

fn identity_dir(dir: Option<PathBuf>) -> Result<PathBuf> {
    dir.or_else(default_data_dir)
        .ok_or_else(|| anyhow!("no data directory; pass --dir"))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn print_stats(stats: &StatsSnapshot) {
    println!(
        "{} fps={:>3} rtt={:>4}ms bitrate={:>6}kbps enc={} dec={} dropped={} lost={}",
        if stats.connected { "connected " } else { "waiting   " },
        stats.fps,
        stats.rtt_ms,
        stats.bitrate_kbps,
        stats.frames_encoded,
        stats.frames_decoded,
        stats.frames_dropped,
        stats.packets_lost,
    );
}

/// Print stats once a second until Enter is pressed or the session ends
fn monitor(engine: &Engine, session_required: bool) {
    let (enter_tx, enter_rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut line = String::new();
        let _ = std::io::stdin().lock().read_line(&mut line);
        let _ = enter_tx.send(());
    });

    println!("Press Enter to stop.\n");
    loop {
        match enter_rx.recv_timeout(Duration::from_secs(1)) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
        print_stats(&engine.stats());

        if session_required && !engine.is_active() {
            let error = engine.last_error();
            if !error.is_empty() {
                println!("Session ended: {}", error);
            } else {
                println!("Session ended");
            }
            break;
        }
    }
}

fn wait_for_signaling(engine: &Engine, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if engine.signaling_state().is_connected() {
            println!("{}", engine.last_cloud_status());
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    bail!("signaling: {}", engine.last_cloud_status())
}

fn run_identity(engine: &Engine, dir: Option<PathBuf>) -> Result<()> {
    let dir = identity_dir(dir)?;
    let key = engine
        .init_identity(&dir)
        .with_context(|| format!("identity in {}", dir.display()))?;
    println!("Identity: {}", dir.display());
    println!("Public key: {}", hex(&key));
    Ok(())
}

fn run_host(engine: &Engine, port: u16, host: HostConfig, dir: Option<PathBuf>) -> Result<()> {
    run_identity(engine, dir)?;
    engine.start_host_with_config(port, host)?;
    info!("Hosting on UDP port {}", port);
    monitor(engine, true);
    Ok(())
}

fn run_join(engine: &Engine, host: &str, port: u16) -> Result<()> {
    engine.start_client(host, port)?;
    info!("Joining {}:{}", host, port);
    monitor(engine, true);
    Ok(())
}

fn connect(engine: &Engine, server: Option<String>, token: &str) -> Result<()> {
    match server {
        Some(url) => engine.connect_signaling_with_url(&url, token)?,
        None => engine.connect_signaling(token)?,
    }
    let timeout = Duration::from_millis(engine.config().signaling_timeout_ms) + Duration::from_secs(1);
    wait_for_signaling(engine, timeout)
}

fn run_call(
    engine: &Engine,
    target: &str,
    token: &str,
    server: Option<String>,
    dir: Option<PathBuf>,
) -> Result<()> {
    run_identity(engine, dir)?;
    connect(engine, server, token)?;
    engine.send_connect_request(target)?;
    println!("Calling {}...", target);

    let deadline = Instant::now()
        + Duration::from_millis(engine.config().request_timeout_ms)
        + Duration::from_secs(1);
    while !engine.is_active() {
        if Instant::now() > deadline {
            bail!("{}", engine.last_cloud_status());
        }
        let status = engine.last_cloud_status();
        if status.starts_with("Cloud request") {
            bail!("{}", status);
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    monitor(engine, true);
    Ok(())
}

fn run_listen(
    engine: &Engine,
    token: &str,
    server: Option<String>,
    port: u16,
    dir: Option<PathBuf>,
) -> Result<()> {
    run_identity(engine, dir)?;
    engine.start_host(port)?;
    connect(engine, server, token)?;
    monitor(engine, false);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = load_config(cli.config.as_ref())?;
    let engine = Engine::new(config)?;
    engine.init();

    let result = match cli.command {
        Commands::Identity { dir } => run_identity(&engine, dir),
        Commands::Host {
            port,
            width,
            height,
            fps,
            bitrate,
            dir,
        } => {
            let defaults = engine.config().host;
            let host = HostConfig {
                width: width.unwrap_or(defaults.width),
                height: height.unwrap_or(defaults.height),
                fps: fps.unwrap_or(defaults.fps),
                bitrate_kbps: bitrate.unwrap_or(defaults.bitrate_kbps),
                ..defaults
            };
            run_host(&engine, port, host, dir)
        }
        Commands::Join { host, port } => run_join(&engine, &host, port),
        Commands::Call {
            target,
            token,
            server,
            dir,
        } => run_call(&engine, &target, &token, server, dir),
        Commands::Listen {
            token,
            server,
            port,
            dir,
        } => run_listen(&engine, &token, server, port, dir),
    };

    engine.stop();
    result
}
