use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, info};
use serde::Deserialize;

use reqbouncer::client::{self, Agent, AgentConfig};
use reqbouncer::github::GitHubUserProvider;
use reqbouncer::server::{self, ServerConfig};

const DEFAULT_SERVER: &str = "reqbouncer.dev:443";
const WEBSOCKET_PATH: &str = "/_websocket";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common);

    match cli.command {
        Command::Serve(cmd) => run_serve(cmd),
        Command::Forward(cmd) => run_forward(cmd),
        Command::Login(cmd) => run_login(cmd),
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Hijack and bounce requests to a different server",
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
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
    /// Reduce output to only errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a reqbouncer rendezvous server
    #[command(alias = "server")]
    Serve(ServeCommand),
    /// Start a forwarding agent
    Forward(ForwardCommand),
    /// Log in with GitHub and store credentials
    Login(LoginCommand),
    /// Print the version
    Version,
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Port to listen on; the PORT environment variable wins over the flag
    #[arg(short, long, default_value_t = 8080)]
    port: u16,
}

#[derive(Debug, Clone, Args)]
struct ForwardCommand {
    /// Port or host:port to tunnel requests to
    target: String,
    /// reqbouncer server to connect to
    #[arg(short, long)]
    server: Option<String>,
    /// Opaque client identifier sent at connect time
    #[arg(long)]
    client_id: Option<String>,
    /// Bearer token; falls back to REQBOUNCER_SECRET_TOKEN and the config file
    #[arg(long)]
    access_token: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct LoginCommand {
    /// Server to log in against
    #[arg(short, long, default_value = DEFAULT_SERVER)]
    server: String,
}

fn init_logging(common: &CommonOpts) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let level = if common.quiet {
        "error"
    } else if common.debug {
        "debug"
    } else {
        "info"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("reqbouncer={level},tower_http={level}")));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(io::stderr().is_terminal())
                .with_target(false),
        )
        .try_init()
        .ok();

    // log-crate modules share the same verbosity.
    let filter = match level {
        "error" => LevelFilter::Error,
        "debug" => LevelFilter::Debug,
        _ => LevelFilter::Info,
    };
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
    builder.filter_level(filter);
    builder.try_init().ok();
}

#[derive(Debug, Deserialize)]
struct ServerSettings {
    github_client_id: String,
    forward_timeout_secs: u64,
}

/// Loads server settings from an optional `config.toml` next to the working
/// directory, overridden by `REQBOUNCER_*` environment variables.
fn load_server_settings() -> Result<ServerSettings> {
    let built = Config::builder()
        .set_default("github_client_id", "")?
        .set_default("forward_timeout_secs", 60_i64)?
        .add_source(File::new("config", FileFormat::Toml).required(false))
        .add_source(Environment::with_prefix("REQBOUNCER"))
        .build()
        .context("loading server configuration")?;

    built
        .try_deserialize()
        .context("invalid server configuration")
}

#[tokio::main]
async fn run_serve(cmd: ServeCommand) -> Result<()> {
    let settings = load_server_settings()?;
    let port = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(cmd.port);

    let cfg = ServerConfig {
        port,
        github_client_id: settings.github_client_id,
        forward_timeout: Duration::from_secs(settings.forward_timeout_secs),
    };
    server::run(cfg, Arc::new(GitHubUserProvider::new())).await
}

#[tokio::main]
async fn run_forward(cmd: ForwardCommand) -> Result<()> {
    let config_path = client::config_file_path().unwrap_or_else(|_| PathBuf::new());

    let target = if cmd.target.chars().all(|c| c.is_ascii_digit()) && !cmd.target.is_empty() {
        format!("localhost:{}", cmd.target)
    } else {
        cmd.target
    };

    let server = match cmd.server {
        Some(server) => server,
        None => client::read_key(&config_path, "server_host")?
            .context("no server configured; pass --server or run `reqbouncer login`")?,
    };

    let access_token = match cmd.access_token {
        Some(token) => token,
        None => match std::env::var(client::SECRET_TOKEN_ENV) {
            Ok(token) => token,
            Err(_) => client::read_key(&config_path, "access_token")?.unwrap_or_default(),
        },
    };

    let client_id = match cmd.client_id {
        Some(id) => Some(id),
        None => client::read_key(&config_path, "client_id")?,
    };

    let agent = Agent::new(AgentConfig {
        target,
        server,
        path: WEBSOCKET_PATH.to_string(),
        access_token,
        client_id,
    })?;

    tokio::select! {
        result = agent.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt signal");
            Ok(())
        }
    }
}

#[tokio::main]
async fn run_login(cmd: LoginCommand) -> Result<()> {
    client::login(&cmd.server).await
}
