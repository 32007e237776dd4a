use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use oracle::store::{read_json, write_json};
use oracle::{
    JsonFileStore, NoopNotifier, Notifier, OracleConfig, PaymentRequest, ReconciliationEngine,
    SolanaRpcSource, WebhookNotifier,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zk::{ProofConfig, ProofOptions, ProofService, ServiceState, ZkProof};

const PAYMENTS_FILE: &str = "payments.json";
const PROOF_STATE_FILE: &str = "proof-state.json";

/// zkoracle - private payment verification for Solana merchants
#[derive(Parser)]
#[command(name = "zkoracle")]
#[command(about = "Commitment proofs and payment reconciliation", long_about = None)]
struct Cli {
    /// Data directory (default: ~/.zkoracle)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Oracle configuration as JSON
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new signing seed
    Keygen {
        /// Output path (default: <data-dir>/signing.seed)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the proof signing public key
    Pubkey,

    /// Generate a proof for a transaction
    Prove {
        /// Transaction signature
        #[arg(long)]
        tx: String,
        /// Amount actually paid
        #[arg(long)]
        amount: f64,
        /// Amount the merchant expected (default: amount)
        #[arg(long)]
        expected: Option<f64>,
        /// Print the witness-free form
        #[arg(long)]
        public: bool,
    },

    /// Verify a proof file
    Verify {
        /// Path to proof JSON
        proof: PathBuf,
    },

    /// Strip the witness from a proof file
    Disclose {
        /// Path to proof JSON
        proof: PathBuf,
        /// Include the paid amount
        #[arg(long)]
        reveal_amount: bool,
    },

    /// Summarize several proof files
    Aggregate {
        /// Proof JSON files
        #[arg(required = true)]
        proofs: Vec<PathBuf>,
    },

    /// Create a payment request
    Request {
        /// Merchant address receiving the payment
        #[arg(long)]
        merchant: String,
        /// Expected amount in SOL
        #[arg(long)]
        sol: f64,
        /// Order identifier
        #[arg(long)]
        order: Option<String>,
        /// SPL mint to settle in instead of SOL
        #[arg(long, requires = "token_amount")]
        token: Option<String>,
        /// Expected amount in token units
        #[arg(long)]
        token_amount: Option<f64>,
    },

    /// List payments
    List,

    /// Bind a transaction signature to a payment and verify it
    Confirm {
        /// Payment id
        id: String,
        /// Transaction signature
        signature: String,
        #[arg(long, default_value = oracle::rpc::MAINNET_URL)]
        rpc: String,
    },

    /// Refund a verified payment
    Refund {
        /// Payment id
        id: String,
    },

    /// Poll for incoming payments until interrupted
    Watch {
        #[arg(long, default_value = oracle::rpc::MAINNET_URL)]
        rpc: String,
        /// POST payment events to this URL
        #[arg(long)]
        webhook: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let data_dir = cli.data_dir.clone().unwrap_or_else(crypto::default_data_dir);
    let config = load_config(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Keygen { output } => keygen(&data_dir, output.as_deref())?,
        Commands::Pubkey => {
            let proofs = open_proofs(&data_dir).await?;
            println!("{}", proofs.public_key_hex());
        }
        Commands::Prove {
            tx,
            amount,
            expected,
            public,
        } => prove(&data_dir, &tx, amount, expected.unwrap_or(amount), public).await?,
        Commands::Verify { proof } => verify(&data_dir, &proof).await?,
        Commands::Disclose {
            proof,
            reveal_amount,
        } => {
            let proof = read_proof(&proof).await?;
            print_json(&zk::selective_disclosure(&proof, reveal_amount))?;
        }
        Commands::Aggregate { proofs } => {
            let mut loaded = Vec::with_capacity(proofs.len());
            for path in &proofs {
                loaded.push(read_proof(path).await?);
            }
            print_json(&zk::aggregate_proofs(&loaded))?;
        }
        Commands::Request {
            merchant,
            sol,
            order,
            token,
            token_amount,
        } => {
            let engine = open_engine(&data_dir, config, oracle::rpc::MAINNET_URL, None).await?;
            let mut request = PaymentRequest::sol(merchant, sol);
            if let Some(order) = order {
                request = request.with_order(order);
            }
            if let (Some(mint), Some(amount)) = (token, token_amount) {
                request = request.with_token(mint, amount);
            }
            let record = engine.create_payment(request).await?;
            print_json(&record)?;
        }
        Commands::List => {
            let engine = open_engine(&data_dir, config, oracle::rpc::MAINNET_URL, None).await?;
            for record in engine.records().await {
                println!(
                    "{}  {:<9} {:>12} {:<5} order={} sig={}",
                    record.id,
                    record.status,
                    record.expected_amount(),
                    if record.is_native() { "SOL" } else { "SPL" },
                    record.order_id.as_deref().unwrap_or("-"),
                    record.transaction_signature.as_deref().unwrap_or("-"),
                );
            }
        }
        Commands::Confirm { id, signature, rpc } => {
            let engine = open_engine(&data_dir, config, &rpc, None).await?;
            let record = engine.verify_payment(&id, &signature).await?;
            save_proof_state(&data_dir, engine.proofs()).await?;
            println!("Payment {} is {}", record.id, record.status);
        }
        Commands::Refund { id } => {
            let engine = open_engine(&data_dir, config, oracle::rpc::MAINNET_URL, None).await?;
            let record = engine.refund(&id).await?;
            println!("Payment {} is {}", record.id, record.status);
        }
        Commands::Watch { rpc, webhook } => watch(&data_dir, config, &rpc, webhook).await?,
    }

    Ok(())
}

async fn load_config(path: Option<&Path>) -> anyhow::Result<OracleConfig> {
    let Some(path) = path else {
        return Ok(OracleConfig::default());
    };
    let config: OracleConfig = read_json(path)
        .await
        .with_context(|| format!("reading config {}", path.display()))?
        .with_context(|| format!("config file {} not found", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

fn keygen(data_dir: &Path, output: Option<&Path>) -> anyhow::Result<()> {
    let path = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| data_dir.join(crypto::storage::SEED_FILE_NAME));
    if path.exists() {
        bail!("{} already exists, refusing to overwrite", path.display());
    }

    let keypair = crypto::ServiceKeypair::generate()?;
    let saved = crypto::save_keypair(&keypair, Some(path.as_path()))?;

    println!("Signing seed saved to {}", saved.display());
    println!("Public key: {}", keypair.public_key_hex());
    Ok(())
}

/// Proof service with the persisted seed and accumulator state
async fn open_proofs(data_dir: &Path) -> anyhow::Result<Arc<ProofService>> {
    let seed_path = data_dir.join(crypto::storage::SEED_FILE_NAME);
    let (keypair, from_disk) = crypto::load_or_ephemeral(Some(seed_path.as_path()))?;
    if !from_disk {
        tracing::warn!(
            "No signing seed at {}, using an ephemeral key (run `zkoracle keygen`)",
            seed_path.display()
        );
    }

    let proofs = ProofService::new(keypair, ProofConfig::default());
    let state_path = data_dir.join(PROOF_STATE_FILE);
    if let Some(state) = read_json::<ServiceState>(&state_path)
        .await
        .context("reading proof state")?
    {
        proofs.import_state(state).await?;
    }

    Ok(Arc::new(proofs))
}

async fn save_proof_state(data_dir: &Path, proofs: &ProofService) -> anyhow::Result<()> {
    let state = proofs.export_state().await;
    write_json(&data_dir.join(PROOF_STATE_FILE), &state)
        .await
        .context("saving proof state")
}

async fn open_engine(
    data_dir: &Path,
    config: OracleConfig,
    rpc: &str,
    webhook: Option<String>,
) -> anyhow::Result<Arc<ReconciliationEngine>> {
    let proofs = open_proofs(data_dir).await?;
    let source = SolanaRpcSource::new(rpc, config.rpc_timeout())?;
    let store = JsonFileStore::new(data_dir.join(PAYMENTS_FILE));
    let notifier: Arc<dyn Notifier> = match webhook {
        Some(url) => Arc::new(WebhookNotifier::new(url, config.rpc_timeout())?),
        None => Arc::new(NoopNotifier),
    };

    let engine =
        ReconciliationEngine::new(config, proofs, Arc::new(source), Arc::new(store), notifier)?;
    engine.load().await.context("loading payments")?;
    Ok(Arc::new(engine))
}

async fn prove(
    data_dir: &Path,
    tx: &str,
    amount: f64,
    expected: f64,
    public: bool,
) -> anyhow::Result<()> {
    let proofs = open_proofs(data_dir).await?;
    let proof = proofs
        .generate_proof(tx, amount, expected, ProofOptions::default())
        .await?;
    save_proof_state(data_dir, &proofs).await?;

    if public {
        print_json(&zk::selective_disclosure(&proof, false))
    } else {
        print_json(&proof)
    }
}

async fn verify(data_dir: &Path, path: &Path) -> anyhow::Result<()> {
    let proof = read_proof(path).await?;
    let proofs = open_proofs(data_dir).await?;

    let valid = proofs.verify_proof(&proof).await?;
    save_proof_state(data_dir, &proofs).await?;

    if proof.witness.is_some() {
        println!("witness: {}", proofs.verify_witness(&proof));
    }
    println!("valid: {}", valid);
    if !valid {
        bail!("proof {} failed verification", proof.id);
    }
    Ok(())
}

async fn watch(
    data_dir: &Path,
    config: OracleConfig,
    rpc: &str,
    webhook: Option<String>,
) -> anyhow::Result<()> {
    let engine = open_engine(data_dir, config, rpc, webhook).await?;
    println!(
        "Watching {} pending payments via {} (Ctrl+C to stop)",
        engine.pending().await.len(),
        rpc
    );

    let poller = engine.clone().start();
    tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;

    poller.stop().await;
    save_proof_state(data_dir, engine.proofs()).await?;
    println!("Stopped");
    Ok(())
}

async fn read_proof(path: &Path) -> anyhow::Result<ZkProof> {
    read_json(path)
        .await
        .with_context(|| format!("reading proof {}", path.display()))?
        .with_context(|| format!("proof file {} not found", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
