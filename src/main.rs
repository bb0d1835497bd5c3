//! forkserve CLI - runs a prefork TCP server with a built-in demo application.
//!
//! This is the main binary entry point. See the `forkserve` library for the
//! server itself.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use forkserve::{Server, ServerConfig};
use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "forkserve")]
#[command(about = "Prefork TCP server with supervised worker processes", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every command that resolves a configuration.
#[derive(clap::Args)]
struct ConfigArgs {
    /// JSON configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Number of worker processes (overrides config and environment)
    #[arg(long, short)]
    workers: Option<usize>,
    /// Directory for worker endpoint sockets
    #[arg(long)]
    runtime_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a demo application
    Serve {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Port to bind (0 picks a free port)
        #[arg(long, short, default_value_t = 9501)]
        port: u16,
        /// Application handlers to install
        #[arg(long, value_enum, default_value_t = App::Echo)]
        app: App,
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Print the effective configuration as JSON
    Config {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

/// Built-in demo applications.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum App {
    /// Send every payload back
    Echo,
    /// Answer `ping` with `pong`, echo anything else
    Pingpong,
    /// Answer every payload with `worker_id:pid:ppid`
    Whoami,
}

fn main() -> Result<()> {
    init_logging()?;

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("PANIC: {panic_info}");
        default_hook(panic_info);
    }));

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { host, port, app, config } => {
            let config = resolve_config(&config)?;
            let mut server = Server::with_config(host, port, config);
            install_app(&mut server, app);
            server.start()?;
        }
        Commands::Config { config } => {
            let config = resolve_config(&config)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Log to stderr, or to `FORKSERVE_LOG_FILE` when set.
///
/// All processes share the file in append mode, so worker lines interleave
/// with listener lines in one log.
fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    if let Ok(path) = std::env::var("FORKSERVE_LOG_FILE") {
        let log_file = open_log_file(Path::new(&path))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.init();
    Ok(())
}

fn open_log_file(path: &Path) -> Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file at {}", path.display()))
}

/// Defaults, then the config file, then environment, then flags.
fn resolve_config(args: &ConfigArgs) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load_from_file(path)?,
        None => ServerConfig::default(),
    };
    config.apply_env_overrides()?;
    if let Some(workers) = args.workers {
        config.worker_num = workers;
    }
    if let Some(dir) = &args.runtime_dir {
        config.runtime_dir = Some(dir.clone());
    }
    Ok(config)
}

fn install_app(server: &mut Server, app: App) {
    server
        .on_worker_start(|worker_id| {
            log::info!("[app] worker {worker_id} ready (pid {})", std::process::id());
            Ok(())
        })
        .on_connect(|ctx, peer| {
            log::info!("[app] {peer} connected to worker {}", ctx.worker_id());
            Ok(())
        })
        .on_close(|ctx, peer| {
            log::info!("[app] {peer} left worker {}", ctx.worker_id());
            Ok(())
        });

    match app {
        App::Echo => {
            server.on_receive(|ctx, peer, payload| {
                ctx.send(peer, payload);
                Ok(())
            });
        }
        App::Pingpong => {
            server.on_receive(|ctx, peer, payload| {
                if payload == b"ping" {
                    ctx.send(peer, "pong");
                } else {
                    ctx.send(peer, payload);
                }
                Ok(())
            });
        }
        App::Whoami => {
            server.on_receive(|ctx, peer, _| {
                // SAFETY: getppid has no preconditions and cannot fail.
                let ppid = unsafe { libc::getppid() };
                let reply = format!("{}:{}:{ppid}\n", ctx.worker_id(), std::process::id());
                ctx.send(peer, reply);
                Ok(())
            });
        }
    }
}
