use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};
use pingora_core::server::configuration::Opt;
use pingora_core::server::Server;
use std::path::PathBuf;

use shashin::config::Config;
use shashin::edge::signer::{encode_payload, sign_url};
use shashin::edge::EdgeAuthenticator;
use shashin::proxy::{EdgeProxy, OriginService};
use shashin::secrets::SecretAccessor;

/// Shashin - signed on-demand image transformation built on Pingora
#[derive(Parser, Debug)]
#[command(name = "shashin")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the origin image service
    Origin(ServerArgs),
    /// Run the edge signature gate
    Edge(ServerArgs),
    /// Print a signed URL for a path or request payload
    Sign(SignArgs),
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Daemon mode
    #[arg(short = 'd', long)]
    daemon: bool,

    /// Test configuration and exit
    #[arg(long)]
    test: bool,

    /// Upgrade workers gracefully
    #[arg(long)]
    upgrade: bool,
}

#[derive(Args, Debug)]
struct SignArgs {
    /// Signing secret
    #[arg(long, env = "SHASHIN_SIGNING_SECRET", hide_env_values = true)]
    secret: String,

    /// Request path, e.g. /photos/cat.jpg
    #[arg(long, conflicts_with = "payload", required_unless_present = "payload")]
    path: Option<String>,

    /// JSON request payload, base64 encoded into the path
    #[arg(long)]
    payload: Option<String>,

    /// Query parameter as key=value (repeatable)
    #[arg(short, long = "query")]
    query: Vec<String>,

    /// Seconds until the signature expires
    #[arg(long)]
    expires_in: Option<i64>,
}

fn load_config(path: &PathBuf) -> anyhow::Result<Config> {
    let config = Config::from_file(path).map_err(|e| anyhow!(e))?;
    config.validate().map_err(|e| anyhow!(e))?;
    shashin::logging::init_subscriber(&config.logging)
        .map_err(|e| anyhow!("Failed to initialize logging subsystem: {}", e))?;
    Ok(config)
}

fn build_server(args: &ServerArgs) -> anyhow::Result<Server> {
    let opt = Opt {
        daemon: args.daemon,
        test: args.test,
        upgrade: args.upgrade,
        ..Default::default()
    };
    let mut server = Server::new(Some(opt)).context("Failed to create Pingora server")?;
    server.bootstrap();
    Ok(server)
}

fn run_origin(args: ServerArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)?;
    tracing::info!(
        config_file = %args.config.display(),
        source_buckets = ?config.images.source_buckets,
        auto_webp = config.images.auto_webp,
        tenants_enabled = config.tenants.enabled,
        detection_enabled = config.detection.is_some(),
        "Configuration loaded successfully"
    );

    let mut server = build_server(&args)?;
    let listen_addr = format!("{}:{}", config.origin.address, config.origin.port);
    let mut service =
        pingora_proxy::http_proxy_service(&server.configuration, OriginService::new(config));
    service.add_tcp(&listen_addr);

    tracing::info!(address = %listen_addr, "Starting Shashin origin");
    server.add_service(service);
    server.run_forever();
}

fn run_edge(args: ServerArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)?;
    let secret = SecretAccessor::from_config(&config.secret)?;
    let authenticator = EdgeAuthenticator::new(secret, config.edge.environment);
    tracing::info!(
        config_file = %args.config.display(),
        origin = %config.edge.origin,
        environment = ?config.edge.environment,
        "Configuration loaded successfully"
    );

    let mut server = build_server(&args)?;
    let listen_addr = format!("{}:{}", config.edge.address, config.edge.port);
    let mut service = pingora_proxy::http_proxy_service(
        &server.configuration,
        EdgeProxy::new(config.edge.clone(), authenticator),
    );
    service.add_tcp(&listen_addr);

    tracing::info!(address = %listen_addr, "Starting Shashin edge");
    server.add_service(service);
    server.run_forever();
}

fn run_sign(args: SignArgs) -> anyhow::Result<()> {
    let path = match (&args.path, &args.payload) {
        (Some(path), _) => path.clone(),
        (None, Some(payload)) => {
            let value: serde_json::Value =
                serde_json::from_str(payload).context("Payload is not valid JSON")?;
            encode_payload(&value)
        }
        (None, None) => return Err(anyhow!("Either --path or --payload is required")),
    };

    let query = args
        .query
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.clone(), String::new()),
        })
        .collect::<Vec<_>>();
    let expires_at = args
        .expires_in
        .map(|seconds| chrono::Utc::now().timestamp() + seconds);

    let signed = sign_url(&args.secret, &path, &query, expires_at)?;
    println!("{}", serde_json::to_string_pretty(&signed)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Origin(args) => run_origin(args),
        Command::Edge(args) => run_edge(args),
        Command::Sign(args) => run_sign(args),
    }
}
