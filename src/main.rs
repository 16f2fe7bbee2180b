//! ACK RAM Authenticator - RAM authentication for ACK/Kubernetes clusters

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ack_ram_authenticator::config::{BackendMode, ClusterConfig};
use ack_ram_authenticator::credentials::{
    current_profile, ChainProvider, CredentialProvider, FileCacheProvider,
};
use ack_ram_authenticator::mapper::crd::{CrdMapper, RAMIdentityMapping};
use ack_ram_authenticator::mapper::dynamicfile::DynamicFileMapper;
use ack_ram_authenticator::mapper::file::StaticMapper;
use ack_ram_authenticator::mapper::{AggregateMapper, Mapper};
use ack_ram_authenticator::server::{router, ServerState};
use ack_ram_authenticator::token::{format_json, Generator, GetTokenOptions, Verifier};

/// RAM authenticator for ACK clusters
#[derive(Parser, Debug)]
#[command(name = "ack-ram-authenticator", version, about, long_about = None)]
struct Cli {
    /// Generate the RAMIdentityMapping CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the verification webhook server
    Server(ServerArgs),

    /// Generate a bearer token for a cluster
    Token(TokenArgs),

    /// Verify a token and print the resolved identity
    Verify(VerifyArgs),
}

/// Server mode arguments
#[derive(Parser, Debug)]
struct ServerArgs {
    /// Path to the authenticator config file
    #[arg(long, default_value = "/etc/ack-ram-authenticator/config.yaml")]
    config: PathBuf,
}

/// Token generation arguments
#[derive(Parser, Debug)]
struct TokenArgs {
    /// Cluster id to bind the token to
    #[arg(long, env = "ACK_CLUSTER_ID")]
    cluster_id: String,

    /// Region for the STS VPC endpoint
    #[arg(long)]
    region: Option<String>,

    /// RAM role to assume before signing
    #[arg(long)]
    role: Option<String>,

    /// Cache credentials in a short-lived file under ~/.acs/
    #[arg(long)]
    cache: bool,
}

/// Token verification arguments
#[derive(Parser, Debug)]
struct VerifyArgs {
    /// The bearer token to verify
    #[arg(long)]
    token: String,

    /// Cluster id the token must be bound to
    #[arg(long, env = "ACK_CLUSTER_ID")]
    cluster_id: String,

    /// Region selecting the trusted STS endpoint
    #[arg(long)]
    region: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&RAMIdentityMapping::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Server(args)) => run_server(args).await,
        Some(Commands::Token(args)) => run_token(args).await,
        Some(Commands::Verify(args)) => run_verify(args).await,
        None => {
            run_server(ServerArgs {
                config: PathBuf::from("/etc/ack-ram-authenticator/config.yaml"),
            })
            .await
        }
    }
}

/// Run the webhook server with the configured mapper backends
async fn run_server(args: ServerArgs) -> anyhow::Result<()> {
    let config = ClusterConfig::load(&args.config)?;
    tracing::info!(
        cluster_id = %config.cluster_id,
        backends = ?config.backend_mode,
        "ack-ram-authenticator starting"
    );

    let mut mappers: Vec<Arc<dyn Mapper>> = Vec::new();
    for mode in &config.backend_mode {
        match mode {
            BackendMode::ConfigMap => {
                mappers.push(Arc::new(StaticMapper::new(&config)));
            }
            BackendMode::DynamicFile => {
                let path = config
                    .dynamic_file_path
                    .as_ref()
                    .expect("config validation requires dynamicFilePath");
                mappers.push(Arc::new(DynamicFileMapper::new(path)));
            }
            BackendMode::Crd => {
                let client = Client::try_default().await.map_err(|e| {
                    anyhow::anyhow!("Failed to create Kubernetes client: {}", e)
                })?;
                mappers.push(Arc::new(CrdMapper::new(client)));
            }
        }
    }

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let mappers = AggregateMapper::new(mappers);
    mappers.start(stop_rx).await?;

    let verifier = Verifier::new(config.region.as_deref(), &config.cluster_id)?;
    let state = Arc::new(ServerState::new(verifier, mappers));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", config.listen_addr, e))?;
    tracing::info!(addr = %config.listen_addr, "webhook server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    // unwind mapper watchers and controller workers
    let _ = stop_tx.send(true);
    tracing::info!("ack-ram-authenticator shutting down");
    Ok(())
}

/// Generate a token and print the ExecCredential envelope
async fn run_token(args: TokenArgs) -> anyhow::Result<()> {
    let mut provider: Arc<dyn CredentialProvider> = Arc::new(ChainProvider::default_chain()?);
    if args.cache {
        provider = Arc::new(FileCacheProvider::new(
            provider,
            &args.cluster_id,
            &current_profile(),
            args.role.as_deref(),
        )?);
    }

    let generator = Generator::new(provider)?;
    let token = generator
        .get_with_options(&GetTokenOptions {
            cluster_id: args.cluster_id,
            region: args.region,
            assume_role_arn: args.role,
        })
        .await?;

    println!("{}", format_json(&token));
    Ok(())
}

/// Verify a token and print the identity STS reports for it
async fn run_verify(args: VerifyArgs) -> anyhow::Result<()> {
    let verifier = Verifier::new(args.region.as_deref(), &args.cluster_id)?;
    let identity = verifier.verify(&args.token).await?;
    println!("{identity:#?}");
    Ok(())
}
