//! Bridge Node CLI
//!
//! Command-line interface for one bridge participant:
//! - Distributed Key Generation (keygen)
//! - Ad-hoc threshold signing of a message (sign)
//! - Key share and roster info (info)
//! - The long-running participant service with its status API (run)
//! - Transport identity generation (gen-transport-key)

mod api;
mod chain_client;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use msg_relay_client::{peer_keys, RelayOptions, RelayTransport};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use xmr_bridge_core::bridge::{BridgeService, ParticipantNode};
use xmr_bridge_core::config::BridgeConfig;
use xmr_bridge_core::keygen::{run_dkg, CeremonySlot, DkgParams};
use xmr_bridge_core::keystore::Keystore;
use xmr_bridge_core::mpc::Transport;
use xmr_bridge_core::registry::ParticipantRegistry;
use xmr_bridge_core::request::RequestBook;
use xmr_bridge_core::sign::FixedMessage;
use xmr_bridge_core::SessionId;

use crate::api::ApiState;
use crate::chain_client::HttpBroadcaster;

/// Bridge Node - threshold signing participant
#[derive(Parser)]
#[command(name = "bridge-node")]
#[command(about = "Monero bridge threshold signing participant")]
#[command(version)]
struct Cli {
    /// Participant configuration file
    #[arg(short, long, env = "BRIDGE_CONFIG", default_value = "bridge.toml")]
    config: PathBuf,

    /// Override the relay URL from the configuration
    #[arg(long, env = "RELAY_URL")]
    relay: Option<String>,

    /// Keystore passphrase
    #[arg(long, env = "BRIDGE_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run distributed key generation with every configured peer
    Keygen {
        /// Ceremony label agreed by all participants
        #[arg(long)]
        ceremony: String,

        /// Per-round timeout in seconds
        #[arg(long, default_value = "120")]
        round_timeout: u64,
    },

    /// Threshold-sign a message
    Sign {
        /// Reference the message is signed for
        #[arg(long)]
        chain_ref: String,

        /// Message to sign (hex)
        #[arg(short, long)]
        message: String,

        /// Attempt number; selects the coordinator
        #[arg(long, default_value = "0")]
        attempt: u32,
    },

    /// Show key share and roster info
    Info,

    /// Run the participant service
    Run {
        /// Override the API listen address
        #[arg(long, env = "API_LISTEN")]
        listen: Option<String>,

        /// Override the chain client URL
        #[arg(long, env = "BROADCASTER_URL")]
        broadcaster: Option<String>,
    },

    /// Generate an Ed25519 transport key
    GenTransportKey {
        /// Output file; defaults to transport_key_path from the configuration
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter =
        tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into());
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    if let Commands::GenTransportKey { ref out } = cli.command {
        let path = match out {
            Some(path) => path.clone(),
            None => load_config(&cli)?.transport_key_path,
        };
        return gen_transport_key(&path);
    }

    let config = load_config(&cli)?;
    match cli.command {
        Commands::Keygen {
            ref ceremony,
            round_timeout,
        } => run_keygen(&cli, &config, ceremony, Duration::from_secs(round_timeout)).await,
        Commands::Sign {
            ref chain_ref,
            ref message,
            attempt,
        } => run_sign(&cli, config, chain_ref, message, attempt).await,
        Commands::Info => show_info(&config),
        Commands::Run {
            ref listen,
            ref broadcaster,
        } => {
            let mut config = config;
            if let Some(listen) = listen {
                config.api_listen = listen.clone();
            }
            if let Some(url) = broadcaster {
                config.broadcaster_url = Some(url.clone());
            }
            run_service(&cli, config).await
        }
        Commands::GenTransportKey { .. } => Ok(()),
    }
}

fn load_config(cli: &Cli) -> Result<BridgeConfig> {
    let mut config = BridgeConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(relay) = &cli.relay {
        config.relay_url = Some(relay.clone());
    }
    Ok(config)
}

fn passphrase(cli: &Cli) -> Result<&str> {
    cli.passphrase
        .as_deref()
        .context("keystore passphrase required (--passphrase or BRIDGE_PASSPHRASE)")
}

fn gen_transport_key(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    let key = SigningKey::generate(&mut OsRng);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, hex::encode(key.to_bytes()))?;

    info!(path = %path.display(), "Transport key written");
    println!(
        "Network identity: {}",
        hex::encode(key.verifying_key().to_bytes())
    );
    Ok(())
}

fn connect_relay(config: &BridgeConfig, registry: &ParticipantRegistry) -> Result<RelayTransport> {
    let url = config
        .relay_url
        .as_deref()
        .context("relay_url is not configured")?;
    let raw = std::fs::read_to_string(&config.transport_key_path)
        .with_context(|| format!("reading {}", config.transport_key_path.display()))?;
    let signing_key = msg_relay::parse_signing_key(&raw)?;
    let transport = RelayTransport::connect(
        url,
        config.participant_id,
        signing_key,
        peer_keys(registry)?,
        RelayOptions::default(),
    )?;
    info!(relay = url, participant_id = config.participant_id, "Connected to relay");
    Ok(transport)
}

async fn run_keygen(
    cli: &Cli,
    config: &BridgeConfig,
    ceremony: &str,
    round_timeout: Duration,
) -> Result<()> {
    let passphrase = passphrase(cli)?;
    let keystore = Keystore::new(&config.keystore_path);
    if keystore.exists() {
        bail!(
            "a key share already exists at {}",
            keystore.path().display()
        );
    }

    let registry = ParticipantRegistry::from_config(config)?;
    let transport = connect_relay(config, &registry)?;
    let ceremony_id: SessionId = Sha256::digest(ceremony.as_bytes()).into();

    info!(
        participant_id = config.participant_id,
        n_parties = config.total_participants,
        threshold = config.threshold,
        ceremony,
        "Starting DKG"
    );

    let params = DkgParams::new(
        ceremony_id,
        config.participant_id,
        config.threshold,
        config.total_participants,
    )?;
    let key_share = run_dkg(&params, &CeremonySlot::new(), &transport, round_timeout).await?;
    keystore.save(&key_share, passphrase)?;

    info!(
        group_public_key = %hex::encode(key_share.group_public_key),
        path = %keystore.path().display(),
        "DKG completed, key share saved"
    );
    println!(
        "Group Public Key: {}",
        hex::encode(key_share.group_public_key)
    );
    Ok(())
}

async fn run_sign(
    cli: &Cli,
    config: BridgeConfig,
    chain_ref: &str,
    message: &str,
    attempt: u32,
) -> Result<()> {
    let message = hex::decode(message).context("message must be hex")?;
    let key_share = Keystore::new(&config.keystore_path).load(passphrase(cli)?)?;
    let registry = ParticipantRegistry::from_config(&config)?;
    let transport: Arc<dyn Transport> = Arc::new(connect_relay(&config, &registry)?);
    let node = Arc::new(ParticipantNode::with_approval(
        config,
        registry,
        key_share,
        transport,
        Arc::new(FixedMessage(message.clone())),
    )?);

    let me = node.participant_id();
    let coordinator = node.coordinator_for(chain_ref, attempt)?;
    info!(
        participant_id = me,
        coordinator,
        chain_ref,
        attempt,
        "Starting signing"
    );

    let mut outcomes = node.subscribe_outcomes();
    let inbound = tokio::spawn(Arc::clone(&node).run_inbound());

    let signature = if coordinator == me {
        let (_, signature) = node.coordinator().sign(chain_ref, attempt, &message).await?;
        signature
    } else {
        // Participate until the coordinator announces the aggregate
        let wait = node.remote_wait();
        tokio::time::timeout(wait, async {
            loop {
                let outcome = outcomes.recv().await?;
                if outcome.chain_reference == chain_ref && outcome.message == message {
                    return Ok::<_, anyhow::Error>(outcome.signature);
                }
            }
        })
        .await
        .context("coordinator did not announce a signature in time")??
    };
    inbound.abort();

    println!("Signature: {}", hex::encode(signature.to_bytes()));
    Ok(())
}

fn show_info(config: &BridgeConfig) -> Result<()> {
    println!("Participant: {}", config.participant_id);
    println!(
        "Threshold: {}-of-{}",
        config.threshold, config.total_participants
    );
    println!("Monero network: {}", config.monero_network);

    let keystore = Keystore::new(&config.keystore_path);
    if keystore.exists() {
        let info = keystore.info()?;
        println!("Key share: {}", keystore.path().display());
        println!(
            "Group Public Key: {}",
            hex::encode(info.group_public_key)
        );
    } else {
        println!("Key share: none (run keygen)");
    }

    println!("Processed ledger: {}", config.processed_path.display());

    println!("Roster:");
    for peer in &config.peers {
        println!("  {}: {}", peer.id, peer.network_identity);
    }
    Ok(())
}

async fn run_service(cli: &Cli, config: BridgeConfig) -> Result<()> {
    let key_share = Keystore::new(&config.keystore_path).load(passphrase(cli)?)?;
    let registry = ParticipantRegistry::from_config(&config)?;
    let transport: Arc<dyn Transport> = Arc::new(connect_relay(&config, &registry)?);

    let broadcaster_url = config
        .broadcaster_url
        .clone()
        .context("broadcaster_url is not configured")?;
    let broadcaster = Arc::new(HttpBroadcaster::new(
        &broadcaster_url,
        config.round_timeout(),
    )?);

    let listen = config.api_listen.clone();
    let requests = Arc::new(RequestBook::open(&config)?);
    let node = Arc::new(ParticipantNode::with_request_book(
        config, registry, key_share, transport, requests,
    )?);
    let service = BridgeService::new(Arc::clone(&node), broadcaster);

    let state = Arc::new(ApiState {
        node: Arc::clone(&node),
        events: service.sender(),
    });
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!(address = %listen, "API listening");
    let api = tokio::spawn(async move { axum::serve(listener, api::router(state)).await });

    service
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    api.abort();
    Ok(())
}
