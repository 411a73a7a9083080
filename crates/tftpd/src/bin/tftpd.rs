use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use tftpd::config::{load_config, validate_config, write_config};
use tftpd::{LogFormat, LoggingConfig, Scheduler, TftpConfig};

#[derive(Parser, Debug)]
#[command(name = "tftpd", about = "Minimal RFC 1350 TFTP server (read-only, octet mode)")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "/etc/tftpd/tftpd.toml")]
    config: PathBuf,

    /// Write a default TOML configuration file and exit
    #[arg(long)]
    init_config: bool,

    /// Validate the configuration and exit (no socket bind)
    #[arg(long)]
    check_config: bool,

    /// Root directory to serve files from
    #[arg(long)]
    root_dir: Option<PathBuf>,

    /// Host or address to bind
    #[arg(long)]
    bind: Option<String>,

    /// UDP port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Write the process id to this file
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Detach from the terminal
    #[arg(long)]
    daemon: bool,

    /// Confine the process to the root directory
    #[arg(long)]
    chroot: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        TftpConfig::default()
    };

    if let Some(root_dir) = cli.root_dir {
        config.root_dir = root_dir;
    }
    if let Some(bind) = cli.bind {
        config.bind_host = Some(bind);
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(log_file) = cli.log_file {
        config.logging.file = Some(log_file);
    }
    if let Some(pid_file) = cli.pid_file {
        config.process.pid_file = Some(pid_file);
    }
    if cli.daemon {
        config.process.daemonize = true;
    }
    if cli.chroot {
        config.process.chroot = true;
    }

    if cli.init_config {
        write_config(&cli.config, &config)?;
        println!("Wrote config to {}", cli.config.display());
        return Ok(());
    }

    if cli.check_config {
        validate_config(&config, false)?;
        println!("Config OK: {}", cli.config.display());
        return Ok(());
    }

    validate_config(&config, true)?;

    // before logging and the runtime: both start threads that fork drops
    if config.process.daemonize {
        nix::unistd::daemon(false, true).context("daemon() failed")?;
    }

    let _log_guard = init_logging(&config.logging)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("cannot build runtime")?;

    let result = runtime.block_on(serve(config));
    if let Err(ref e) = result {
        error!("tftpd stopped: {:#}", e);
    }
    result
}

async fn serve(config: TftpConfig) -> Result<()> {
    let mut scheduler = Scheduler::init(&config);
    scheduler
        .open_portal()
        .context("unable to start service")?;

    if config.process.chroot {
        enter_chroot(&config.root_dir)?;
        scheduler.set_root_dir(PathBuf::from("/"));
    }

    if let Some(ref pid_file) = config.process.pid_file {
        std::fs::write(pid_file, format!("{}\n", std::process::id()))
            .with_context(|| format!("cannot write pid file {}", pid_file.display()))?;
    }

    info!(
        "Serving {} with up to {} sessions",
        config.root_dir.display(),
        config.session.max_sessions
    );

    scheduler.run().await.context("scheduler returned")?;
    bail!("scheduler returned")
}

fn enter_chroot(root_dir: &Path) -> Result<()> {
    nix::unistd::chdir(root_dir)
        .with_context(|| format!("chdir({}) failed", root_dir.display()))?;
    nix::unistd::chroot(root_dir)
        .with_context(|| format!("chroot({}) failed", root_dir.display()))?;
    info!("Chrooted into {}", root_dir.display());
    Ok(())
}

fn init_logging(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = || EnvFilter::new(logging.level.clone());

    let Some(ref log_file) = logging.file else {
        match logging.format {
            LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter()).init(),
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter())
                .init(),
        }
        return Ok(None);
    };

    let dir = match log_file.parent() {
        Some(path) => path,
        None => Path::new("."),
    };
    let file_name = log_file
        .file_name()
        .and_then(|name| name.to_str())
        .context("logging.file must include a file name")?;
    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    match logging.format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_writer(non_blocking)
            .with_ansi(false)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter())
            .with_writer(non_blocking)
            .init(),
    }

    Ok(Some(guard))
}
