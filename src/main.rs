use std::env;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use log::{info, warn, LevelFilter};
use tokio::net::TcpListener;

use voxrelay::api::{self, AppState};
use voxrelay::bridge::{listener, registry, BridgeRegistry};
use voxrelay::notify::NotificationHub;
use voxrelay::push::PushGateway;
use voxrelay::settings::Settings;
use voxrelay::stt::SttProxy;

const APP_NAME: &str = "voxrelay";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let config_file = resolve_config_file(cli.common.config.clone())?;
    init_logging(&cli.common)?;

    let settings = Settings::load(config_file.as_deref())?;

    match cli.command {
        Command::Serve(cmd) => async_serve(settings, cmd),
        Command::Config { command } => handle_config(&settings, command, config_file.as_deref()),
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
            Ok(())
        }
    }
}

#[tokio::main]
async fn async_serve(settings: Settings, cmd: ServeCommand) -> Result<()> {
    handle_serve(settings, cmd).await
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "voxrelay - relay server for mobile clients and bridge agents.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output logs as machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true)]
    no_color: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the relay server
    Serve(ServeCommand),
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Override the HTTP listen port
    #[arg(short, long)]
    port: Option<u16>,
    /// Override the bridge TCP listen port
    #[arg(long)]
    bridge_port: Option<u16>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show,
    /// Print the config file path in use
    Path,
}

fn effective_log_level(common: &CommonOpts) -> LevelFilter {
    if common.trace {
        LevelFilter::Trace
    } else if common.debug {
        LevelFilter::Debug
    } else {
        match common.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

fn init_logging(common: &CommonOpts) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    if common.quiet {
        log::set_max_level(LevelFilter::Off);
        return Ok(());
    }

    let level = match effective_log_level(common) {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={level},tower_http={level}")));

    if common.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .ok();
    } else {
        let disable_color =
            common.no_color || env::var_os("NO_COLOR").is_some() || !io::stderr().is_terminal();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_ansi(!disable_color))
            .try_init()
            .ok();
    }

    // Also init env_logger for compatibility with log crate users
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.filter_level(effective_log_level(common));
    builder.try_init().ok();

    Ok(())
}

/// Expand the `--config` override, or fall back to the XDG location.
fn resolve_config_file(override_path: Option<PathBuf>) -> Result<Option<PathBuf>> {
    if let Some(path) = override_path {
        let text = path
            .to_str()
            .ok_or_else(|| anyhow!("config path is not valid UTF-8"))?;
        let expanded = shellexpand::full(text).context("expanding config path")?;
        return Ok(Some(PathBuf::from(expanded.to_string())));
    }

    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(Some(PathBuf::from(dir).join(APP_NAME).join("config.toml")));
    }

    Ok(dirs::config_dir().map(|dir| dir.join(APP_NAME).join("config.toml")))
}

fn handle_config(
    settings: &Settings,
    command: ConfigCommand,
    config_file: Option<&std::path::Path>,
) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let rendered =
                toml::to_string_pretty(settings).context("serializing configuration")?;
            print!("{rendered}");
            Ok(())
        }
        ConfigCommand::Path => {
            match config_file {
                Some(path) => println!("{}", path.display()),
                None => println!("(no config file)"),
            }
            Ok(())
        }
    }
}

async fn handle_serve(mut settings: Settings, cmd: ServeCommand) -> Result<()> {
    if let Some(port) = cmd.port {
        settings.http.port = port;
    }
    if let Some(port) = cmd.bridge_port {
        settings.bridge.port = port;
    }

    settings.validate()?;
    fs::create_dir_all(&settings.data_dir).with_context(|| {
        format!("creating data directory {}", settings.data_dir.display())
    })?;

    if settings.tls.enabled {
        info!("TLS material validated; termination handled by the fronting listener");
    }

    let settings = Arc::new(settings);
    let bridges = Arc::new(BridgeRegistry::new());
    let notifications = Arc::new(NotificationHub::new());
    let push = Arc::new(PushGateway::new(
        &settings.data_dir,
        settings.push.service_account.as_deref(),
    ));
    let stt = Arc::new(SttProxy::new(
        settings.stt.upstream_url.clone(),
        settings.stt.filler_phrases.clone(),
    ));

    // Bridge TCP listener; a bind failure is fatal.
    let bridge_listener = listener::bind(&settings.bridge_addr()).await?;
    tokio::spawn(listener::run(
        bridge_listener,
        bridges.clone(),
        settings.bridge.token.clone(),
    ));
    registry::spawn_heartbeat_supervisor(bridges.clone());

    let state = AppState::new(
        settings.clone(),
        bridges.clone(),
        notifications,
        push,
        stt,
    );
    let app = api::create_router(state);

    let addr: SocketAddr = settings
        .http_addr()
        .parse()
        .context("invalid HTTP listen address")?;
    let http_listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding HTTP listener on {addr}"))?;
    info!("HTTP API listening on http://{addr}");

    let shutdown_bridges = bridges.clone();
    let shutdown_signal = async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        info!("shutdown signal received, closing bridge sessions");
        shutdown_bridges.close_all();
    };

    axum::serve(
        http_listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await
    .context("running server")?;

    if !bridges.is_empty() {
        warn!("{} bridge session(s) still registered at exit", bridges.len());
    }
    info!("shutdown complete");
    Ok(())
}
