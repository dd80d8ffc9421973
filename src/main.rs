use anyhow::Context;
use cgi_prefork::cli::{Cli, Command};
use cgi_prefork::config::{CgiConfig, Config};
use cgi_prefork::daemon::{self, PidFile};
use cgi_prefork::server::{self, Server};
use cgi_prefork::worker::{self, RequestHandler};
use cgi_prefork::{PKG_NAME, VERSION};
use clap::Parser;
use std::io::Read;
use std::os::unix::io::RawFd;
use std::path::Path;
use tracing::{error, info};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cgi_prefork=info".parse()?),
        )
        .init();

    match cli.command.clone() {
        Some(Command::Worker {
            listen_fd,
            channel_fd,
        }) => run_worker(listen_fd, channel_fd),
        None => run_dispatcher(&cli),
    }
}

fn run_dispatcher(cli: &Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path).map_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to load configuration");
            e
        })?,
        None => Config::default(),
    };
    cli.apply(&mut config);
    config.validate()?;

    print_startup_banner(&config);

    // fork must happen before any runtime threads exist
    if config.server.daemon {
        daemon::daemonize(Path::new(&config.server.working_dir))
            .context("Failed to daemonize")?;
    }

    let pid_file = match &config.server.pid_file {
        Some(path) => {
            let pid_file = PidFile::create(Path::new(path))?;
            info!(path = %pid_file.path().display(), "PID file written and locked");
            Some(pid_file)
        }
        None => None,
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(async move {
        let shutdown = server::shutdown_on_signal()?;
        let server = Server::bind(config).await?;
        server.run(shutdown).await
    });

    if let Some(pid_file) = pid_file {
        pid_file.remove();
    }
    if let Err(e) = &result {
        error!(error = %e, "Dispatcher stopped");
    }
    result
}

fn run_worker(listen_fd: RawFd, channel_fd: RawFd) -> anyhow::Result<()> {
    let mut encoded = String::new();
    std::io::stdin()
        .read_to_string(&mut encoded)
        .context("Failed to read worker configuration from stdin")?;
    let cgi: CgiConfig = toml::from_str(&encoded).context("Invalid worker configuration")?;
    let handler = RequestHandler::from_config(&cgi)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime
        .block_on(worker::run_inherited(listen_fd, channel_fd, handler))
        .map_err(|e| {
            error!(pid = std::process::id(), error = %e, "Worker failed");
            e.into()
        })
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting dispatcher");
    info!(
        listen = %config.server.listen,
        daemon = config.server.daemon,
        pid_file = ?config.server.pid_file,
        "Server configuration"
    );
    info!(
        workers = config.pool.workers,
        max_requests = config.pool.max_requests,
        ack_timeout_ms = config.pool.ack_timeout_ms,
        shutdown_grace_period_secs = config.pool.shutdown_grace_period_secs,
        mode = ?config.pool.mode,
        "Pool settings"
    );
    info!(
        command = %config.cgi.command,
        shell = config.cgi.shell,
        request_timeout_secs = ?config.cgi.request_timeout_secs,
        "Command settings"
    );
}
