//! `quorumctl`: operator CLI for a threshold-unsealed vault cluster.
//!
//! Initializes the cluster with one encrypted share per operator, unseals
//! every node with an operator's share, rolls gossip/TLS material out to the
//! nodes, and sequences a full bootstrap. Nodes are reached over HTTP, the
//! consensus store through the Consul API, and node processes through Docker.

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod config;
mod docker;
mod remote;

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use quorum_core::backend::{ConsensusBackend, NodeChannel, RootCredential, SecretEngine};
use quorum_core::bootstrap::{BootstrapPlan, BootstrapSequencer, BootstrapSummary};
use quorum_core::cluster::{ClusterConfig, SealState};
use quorum_core::distribution::{
    ArtifactOutcome, DistributionReport, KeyDistributor, PENDING_KEY, PendingDistribution,
    ROOT_CREDENTIAL_KEY,
};
use quorum_core::error::{BootstrapError, DistributionError, RolloutError, UnsealError};
use quorum_core::identity::{IdentityKeypair, RecipientIdentity};
use quorum_core::local::LocalCluster;
use quorum_core::policy::Policy;
use quorum_core::rollout::{
    RolloutReport, RolloutStatus, SecureMaterial, SecureRolloutManager, StepOutcome,
};
use quorum_core::splitter::ThresholdSplitter;
use quorum_core::tls::generate_cluster_material;
use quorum_core::unseal::{NodeOutcome, ShareDecryptor, UnsealCoordinator, UnsealReport};
use quorum_storage::{FileBackend, StorageBackend};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use crate::config::{CliConfig, LogFormat};
use crate::docker::DockerChannel;
use crate::remote::{ConsulBackend, HttpVaultNode};

// ── ANSI color helpers ───────────────────────────────────────────────

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const WHITE: &str = "\x1b[37m";
const BG_RED: &str = "\x1b[41m";
const BG_GREEN: &str = "\x1b[42m";

// ── CLI structure ────────────────────────────────────────────────────

/// quorumctl: threshold unseal and secure rollout for an HA vault cluster.
#[derive(Parser)]
#[command(
    name = "quorumctl",
    version,
    about = "Threshold unseal, secure rollout, and bootstrap for an HA vault cluster",
    long_about = None,
    after_help = format!(
        "{DIM}Environment variables:{RESET}\n  \
         QUORUM_NODES          Node list as name=url pairs (default: vault1..vault3)\n  \
         QUORUM_CONSUL_ADDR    Consul HTTP API (default: http://127.0.0.1:8500)\n  \
         QUORUM_ARTIFACT_DIR   Share artifact directory (default: ./quorum-artifacts)\n  \
         QUORUM_LOG_LEVEL      Log filter (default: warn)\n\n\
         {DIM}Examples:{RESET}\n  \
         quorumctl keygen alice --out keys/\n  \
         quorumctl init --keys keys/alice.pub.json,keys/bob.pub.json,keys/carol.pub.json --threshold 2\n  \
         quorumctl unseal quorum-artifacts/unseal-keys/alice-0a1b2c3d4e5f6a7b.share --identity keys/alice.key.json\n  \
         quorumctl secure --tls-key server.key --tls-cert server.crt --ca-cert ca.crt"
    ),
)]
struct Cli {
    /// Consul HTTP API address.
    #[arg(long, env = "QUORUM_CONSUL_ADDR")]
    consul_addr: Option<String>,

    /// Cluster nodes as comma-separated name=url pairs.
    #[arg(long, env = "QUORUM_NODES")]
    nodes: Option<String>,

    /// Directory holding share artifacts and the sealed root credential.
    #[arg(long, env = "QUORUM_ARTIFACT_DIR")]
    artifact_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an operator identity keypair.
    Keygen {
        /// Operator label, used in artifact names.
        label: String,
        /// Directory for the `.key.json` and `.pub.json` files.
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Initialize the cluster and distribute one encrypted share per operator.
    Init {
        /// Operator public identity files, comma separated. The first one
        /// receives the sealed root credential.
        #[arg(long, required = true, value_delimiter = ',')]
        keys: Vec<PathBuf>,
        /// Shares required to unseal (default: 1 for one operator, else 2).
        #[arg(long)]
        threshold: Option<u8>,
        /// Print the root credential in clear.
        #[arg(long)]
        show_root_credential: bool,
    },
    /// Decrypt a share artifact and submit it to every node.
    Unseal {
        /// Encrypted share artifact.
        share: PathBuf,
        /// Secret identity file of the share's owner.
        #[arg(long, env = "QUORUM_IDENTITY")]
        identity: PathBuf,
    },
    /// Roll gossip encryption and TLS out to every node.
    Secure(SecureArgs),
    /// Write an access-control policy.
    Policy {
        /// Policy name.
        name: String,
        /// Path to the policy document.
        document: PathBuf,
        /// Root credential in clear.
        #[arg(long, env = "QUORUM_ROOT_CREDENTIAL", hide_env_values = true)]
        root_credential: Option<String>,
        /// Bootstrap identity used to open the sealed root credential.
        #[arg(long)]
        identity: Option<PathBuf>,
    },
    /// Show seal state of every node and consensus health.
    Status,
    /// Check that every node runs the current secure bundle.
    Verify,
    /// Wait until the consensus store reports full quorum.
    Wait,
    /// Generate a demo CA and server certificate for the cluster.
    TlsGen {
        /// Output directory for `ca.crt`, `server.crt`, and `server.key`.
        #[arg(long)]
        out: PathBuf,
    },
    /// Launch, secure, initialize, distribute, unseal, and apply policies.
    Bootstrap(BootstrapArgs),
}

#[derive(Args)]
struct SecureArgs {
    /// PEM private key for the node certificate.
    #[arg(long)]
    tls_key: Option<PathBuf>,
    /// PEM node certificate.
    #[arg(long)]
    tls_cert: Option<PathBuf>,
    /// PEM CA certificate.
    #[arg(long)]
    ca_cert: Option<PathBuf>,
    /// Base64 gossip key; generated on a node when omitted.
    #[arg(long, env = "QUORUM_GOSSIP_KEY", hide_env_values = true)]
    gossip: Option<String>,
}

#[derive(Args)]
struct BootstrapArgs {
    /// Operator public identity files, comma separated.
    #[arg(long, required = true, value_delimiter = ',')]
    keys: Vec<PathBuf>,
    /// Shares required to unseal.
    #[arg(long)]
    threshold: Option<u8>,
    #[command(flatten)]
    secure: SecureArgs,
    /// Generate demo TLS material instead of passing `--tls-key`/`--tls-cert`.
    #[arg(long, conflicts_with_all = ["tls_key", "tls_cert", "ca_cert"])]
    generate_tls: bool,
    /// Secret identity files used to unseal right after init, comma separated.
    #[arg(long, value_delimiter = ',')]
    unseal_with: Vec<PathBuf>,
    /// Initial policies as name=path, repeatable.
    #[arg(long = "policy")]
    policies: Vec<String>,
    /// Run against an in-process cluster instead of Docker and HTTP.
    #[arg(long)]
    local: bool,
    /// Print the root credential in clear.
    #[arg(long)]
    show_root_credential: bool,
}

// ── Pretty output helpers ────────────────────────────────────────────

fn header(icon: &str, title: &str) {
    println!("{BOLD}{CYAN}{icon} {title}{RESET}");
    println!("{DIM}─────────────────────────────────────────{RESET}");
}

fn kv_line(key: &str, value: &str) {
    println!("  {DIM}{key:<20}{RESET} {WHITE}{value}{RESET}");
}

fn success(msg: &str) {
    println!("{GREEN}{BOLD}✓{RESET} {msg}");
}

fn info_line(msg: &str) {
    println!("{CYAN}{BOLD}ℹ{RESET} {msg}");
}

fn warning(msg: &str) {
    println!("{YELLOW}{BOLD}⚠{RESET} {YELLOW}{msg}{RESET}");
}

fn progress_bar(current: u8, total: u8) -> String {
    let width = 20usize;
    let filled = if total > 0 {
        (usize::from(current.min(total)) * width) / usize::from(total)
    } else {
        0
    };
    format!(
        "{CYAN}[{}{DIM}{}]{RESET}",
        "█".repeat(filled),
        "░".repeat(width - filled)
    )
}

fn seal_badge(state: SealState) -> String {
    match state {
        SealState::Sealed => format!("{BG_RED}{WHITE}{BOLD} SEALED {RESET}"),
        SealState::Unsealed => format!("{BG_GREEN}{WHITE}{BOLD} UNSEALED {RESET}"),
        SealState::Unknown => format!("{DIM} UNKNOWN {RESET}"),
    }
}

fn step_label(step: StepOutcome) -> String {
    match step {
        StepOutcome::Done => format!("{GREEN}done{RESET}"),
        StepOutcome::Skipped => format!("{DIM}skipped{RESET}"),
        StepOutcome::Pending => format!("{YELLOW}pending{RESET}"),
    }
}

fn print_distribution(report: &DistributionReport, share_count: usize, threshold: u8) {
    header("🔑", "Cluster Initialized");
    kv_line("Shares", &share_count.to_string());
    kv_line("Threshold", &threshold.to_string());
    println!();
    for artifact in &report.artifacts {
        let state = match artifact.outcome {
            ArtifactOutcome::Written => format!("{GREEN}written{RESET}"),
            ArtifactOutcome::AlreadyPresent => format!("{DIM}already present{RESET}"),
        };
        kv_line(&artifact.recipient, &format!("{} {state}", artifact.key));
    }
    println!();
}

fn print_root_credential(credential: Option<&RootCredential>, show: bool, bootstrap: &str) {
    if let Some(credential) = credential.filter(|_| show) {
        kv_line("Root Credential", credential.expose());
        warning("Store the root credential securely. It is not shown again.");
    } else {
        kv_line(
            "Root Credential",
            &format!("sealed to {bootstrap} in {ROOT_CREDENTIAL_KEY}"),
        );
    }
}

fn print_unseal_report(report: &UnsealReport) {
    header("🔓", "Unseal Progress");
    for node in &report.nodes {
        let outcome = match node.outcome {
            NodeOutcome::Applied => format!("{GREEN}applied{RESET}"),
            NodeOutcome::Duplicate => format!("{DIM}duplicate{RESET}"),
            NodeOutcome::AlreadyUnsealed => format!("{DIM}already unsealed{RESET}"),
        };
        let mut line = format!("{} {outcome}", seal_badge(node.seal_state));
        if node.seal_state == SealState::Sealed {
            line.push_str(&format!(
                " {} {}/{}",
                progress_bar(node.progress, node.threshold),
                node.progress,
                node.threshold
            ));
        }
        kv_line(&format!("{} {}", node.ordinal, node.name), &line);
    }
    println!();
    if report.complete {
        success("Every node is unsealed.");
    } else {
        warning("More shares are needed. Ask the next operator to run `quorumctl unseal`.");
    }
}

fn print_rollout_report(report: &RolloutReport) {
    header("🛡", "Secure Rollout");
    kv_line("Config Version", &report.version.to_string());
    kv_line("Bundle Digest", report.digest.get(..16).unwrap_or(report.digest.as_str()));
    kv_line(
        "Bundle Changed",
        if report.changed { "yes" } else { "no" },
    );
    println!();
    for node in &report.nodes {
        kv_line(
            &format!("{} {}", node.ordinal, node.name),
            &format!(
                "deliver {}  restart {}",
                step_label(node.delivery),
                step_label(node.restart)
            ),
        );
    }
    println!();
    if let Some(key) = &report.generated_gossip_key {
        kv_line("Gossip Key", key.expose());
        warning("The gossip key was generated on a node. Pass it with --gossip on re-runs.");
    }
}

fn print_rollout_status(status: &RolloutStatus) {
    header("🛡", "Secure Rollout Status");
    match &status.target {
        Some(target) => {
            kv_line("Target Version", &target.version.to_string());
            kv_line("Updated", &target.updated_at.to_rfc3339());
        }
        None => kv_line("Target Version", "none"),
    }
    println!();
    for node in &status.nodes {
        let version = node
            .config_version
            .map_or_else(|| "none".to_owned(), |v| v.to_string());
        let mark = if status.lagging.contains(&node.ordinal()) {
            format!("{RED}lagging{RESET}")
        } else {
            format!("{GREEN}current{RESET}")
        };
        kv_line(
            &format!("{} {}", node.ordinal(), node.spec.name),
            &format!("v{version} {mark}"),
        );
    }
    println!();
}

fn print_summary(summary: &BootstrapSummary, show_root: bool, bootstrap: &str) {
    if let Some(rollout) = &summary.rollout {
        print_rollout_report(rollout);
    }
    if summary.resumed {
        info_line("Finished the distribution staged by an earlier run.");
    }
    print_distribution(&summary.distribution, summary.share_count, summary.threshold);
    print_root_credential(summary.root_credential.as_ref(), show_root, bootstrap);
    println!();
    if let Some(unseal) = &summary.unseal {
        print_unseal_report(unseal);
    }
    for name in &summary.policies_applied {
        success(&format!("Policy '{name}' applied."));
    }
    for name in &summary.policies_pending {
        warning(&format!(
            "Policy '{name}' pending: cluster is still sealed or the root credential is unknown."
        ));
    }
    println!();
    success(&format!("Bootstrap complete ({} peers).", summary.peers));
}

// ── Cluster wiring ───────────────────────────────────────────────────

/// Collaborators for one command invocation.
struct Cluster {
    config: Arc<ClusterConfig>,
    engines: Vec<Arc<dyn SecretEngine>>,
    consensus: Arc<dyn ConsensusBackend>,
    channel: Arc<dyn NodeChannel>,
    artifacts: Arc<dyn StorageBackend>,
    staging_dir: PathBuf,
}

impl Cluster {
    /// Nodes over HTTP, Consul for consensus, Docker for node processes.
    async fn remote(config: &CliConfig) -> Result<Self> {
        let cluster = Arc::new(config.cluster_config().context("invalid cluster config")?);
        let http = reqwest::Client::new();
        let engines = cluster
            .nodes()
            .iter()
            .map(|spec| {
                Arc::new(HttpVaultNode::new(spec.clone(), http.clone())) as Arc<dyn SecretEngine>
            })
            .collect();
        let consensus = Arc::new(ConsulBackend::new(
            config.consul_addr.clone(),
            config.consul_token.clone(),
            http,
        ));
        let channel = Arc::new(DockerChannel::new(config.compose_file.clone()));
        Ok(Self {
            config: cluster,
            engines,
            consensus,
            channel,
            artifacts: open_artifacts(config).await?,
            staging_dir: config.staging_dir.clone(),
        })
    }

    /// An in-process cluster that lives for this invocation only.
    async fn local(config: &CliConfig) -> Result<Self> {
        let cluster = Arc::new(config.cluster_config().context("invalid cluster config")?);
        let local = Arc::new(LocalCluster::new(&cluster));
        Ok(Self {
            engines: local.engines(),
            consensus: Arc::clone(&local) as Arc<dyn ConsensusBackend>,
            channel: local as Arc<dyn NodeChannel>,
            config: cluster,
            artifacts: open_artifacts(config).await?,
            staging_dir: config.staging_dir.clone(),
        })
    }

    fn first_engine(&self) -> Result<Arc<dyn SecretEngine>> {
        self.engines
            .first()
            .cloned()
            .context("cluster has no nodes")
    }

    fn rollout_manager(&self) -> SecureRolloutManager {
        SecureRolloutManager::new(
            Arc::clone(&self.config),
            Arc::clone(&self.channel),
            Arc::clone(&self.consensus),
            self.staging_dir.clone(),
        )
    }

    fn sequencer(&self) -> BootstrapSequencer {
        BootstrapSequencer::new(
            Arc::clone(&self.config),
            Arc::clone(&self.channel),
            Arc::clone(&self.consensus),
            self.engines.clone(),
            Arc::clone(&self.artifacts),
            self.staging_dir.clone(),
        )
    }
}

async fn open_artifacts(config: &CliConfig) -> Result<Arc<dyn StorageBackend>> {
    let backend = FileBackend::open(config.artifact_dir.clone())
        .await
        .with_context(|| {
            format!(
                "failed to open artifact directory {}",
                config.artifact_dir.display()
            )
        })?;
    Ok(Arc::new(backend))
}

// ── File helpers ─────────────────────────────────────────────────────

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

/// Create `path` readable only by the owner. Refuses to overwrite.
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("failed to write {}", path.display()))
}

/// A public identity file, or the public half of a secret identity file.
fn load_recipient(path: &Path) -> Result<RecipientIdentity> {
    let text = Zeroizing::new(read_text(path)?);
    match RecipientIdentity::from_json(&text) {
        Ok(identity) => Ok(identity),
        Err(public_err) => IdentityKeypair::from_json(&text)
            .map(|keypair| keypair.identity())
            .map_err(|_| public_err)
            .with_context(|| format!("invalid identity file {}", path.display())),
    }
}

fn load_keypair(path: &Path) -> Result<IdentityKeypair> {
    let text = Zeroizing::new(read_text(path)?);
    IdentityKeypair::from_json(&text)
        .with_context(|| format!("invalid secret identity file {}", path.display()))
}

fn load_material(args: SecureArgs) -> Result<SecureMaterial> {
    Ok(SecureMaterial {
        tls_key: args
            .tls_key
            .as_deref()
            .map(read_text)
            .transpose()?
            .map(Zeroizing::new),
        tls_cert: args.tls_cert.as_deref().map(read_text).transpose()?,
        ca_cert: args.ca_cert.as_deref().map(read_text).transpose()?,
        gossip_key: args.gossip,
    })
}

/// Open the sealed root credential with the bootstrap identity.
async fn open_root_credential(
    artifacts: Arc<dyn StorageBackend>,
    keypair: &IdentityKeypair,
) -> Result<RootCredential> {
    KeyDistributor::new(artifacts)
        .open_root_credential(keypair)
        .await
        .context("failed to open the sealed root credential")?
        .context("no sealed root credential in the artifact directory")
}

/// Print a staged distribution that could not be stored, so the operator
/// can put it back under the artifact directory and re-run.
fn print_unstored_record(pending: &PendingDistribution) {
    match pending.to_json() {
        Ok(json) => {
            warning(&format!(
                "The cluster is initialized but the staged record could not be stored. \
                 Save the record below as {PENDING_KEY} in the artifact directory and re-run."
            ));
            println!("{json}");
        }
        Err(e) => tracing::error!(error = %e, "staged distribution could not be printed"),
    }
}

fn parse_policy_arg(arg: &str) -> Result<(String, String)> {
    let (name, path) = arg
        .split_once('=')
        .with_context(|| format!("expected --policy name=path, got '{arg}'"))?;
    let document = read_text(Path::new(path))?;
    Policy::parse(name, &document).with_context(|| format!("invalid policy '{name}'"))?;
    Ok((name.to_owned(), document))
}

// ── Logging and signals ──────────────────────────────────────────────

fn init_logging(config: &CliConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// A receiver that flips to `true` on Ctrl-C or SIGTERM.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c().await.ok();
        };

        #[cfg(unix)]
        let terminate = async {
            if let Ok(mut sig) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            {
                sig.recv().await;
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {},
            () = terminate => {},
        }

        info!("interrupt received, cancelling");
        let _ = tx.send(true);
    });
    rx
}

// ── Command dispatch ─────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let Cli {
        consul_addr,
        nodes,
        artifact_dir,
        command,
    } = Cli::parse();

    let mut config = CliConfig::from_env();
    if let Some(addr) = consul_addr {
        config.consul_addr = addr;
    }
    if nodes.is_some() {
        config.nodes = nodes;
    }
    if let Some(dir) = artifact_dir {
        config.artifact_dir = dir;
    }
    init_logging(&config);

    match run(&config, command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("  {RED}{BOLD}✗ Error:{RESET} {e:#}");
            eprintln!();
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &CliConfig, cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Keygen { label, out } => cmd_keygen(&label, &out),
        Commands::TlsGen { out } => cmd_tls_gen(config, &out),
        Commands::Init {
            keys,
            threshold,
            show_root_credential,
        } => {
            let cluster = Cluster::remote(config).await?;
            cmd_init(&cluster, &keys, threshold, show_root_credential).await
        }
        Commands::Unseal { share, identity } => {
            let cluster = Cluster::remote(config).await?;
            cmd_unseal(&cluster, &share, &identity).await
        }
        Commands::Secure(args) => {
            let cluster = Cluster::remote(config).await?;
            cmd_secure(&cluster, args).await
        }
        Commands::Policy {
            name,
            document,
            root_credential,
            identity,
        } => {
            let cluster = Cluster::remote(config).await?;
            cmd_policy(&cluster, &name, &document, root_credential, identity.as_deref()).await
        }
        Commands::Status => cmd_status(&Cluster::remote(config).await?).await,
        Commands::Verify => cmd_verify(&Cluster::remote(config).await?).await,
        Commands::Wait => cmd_wait(&Cluster::remote(config).await?).await,
        Commands::Bootstrap(args) => {
            let cluster = if args.local {
                Cluster::local(config).await?
            } else {
                Cluster::remote(config).await?
            };
            cmd_bootstrap(&cluster, args).await
        }
    }
}

fn cmd_keygen(label: &str, out: &Path) -> Result<()> {
    let keypair = IdentityKeypair::generate(label).context("cannot create identity")?;
    std::fs::create_dir_all(out)
        .with_context(|| format!("failed to create {}", out.display()))?;

    let secret_path = out.join(format!("{label}.key.json"));
    let public_path = out.join(format!("{label}.pub.json"));
    if public_path.exists() {
        bail!("{} already exists", public_path.display());
    }
    let secret = keypair.to_json().context("failed to encode secret identity")?;
    write_private(&secret_path, secret.as_bytes())?;
    let identity = keypair.identity();
    let public = identity.to_json().context("failed to encode public identity")?;
    std::fs::write(&public_path, public)
        .with_context(|| format!("failed to write {}", public_path.display()))?;

    header("🔑", "Identity Generated");
    kv_line("Label", identity.label());
    kv_line("Fingerprint", &identity.fingerprint());
    kv_line("Secret Key", &secret_path.display().to_string());
    kv_line("Public Key", &public_path.display().to_string());
    println!();
    warning("Keep the secret key file private. Hand out only the .pub.json file.");
    Ok(())
}

fn cmd_tls_gen(config: &CliConfig, out: &Path) -> Result<()> {
    let cluster = config.cluster_config().context("invalid cluster config")?;
    let material = generate_cluster_material(&cluster).context("certificate generation failed")?;
    std::fs::create_dir_all(out)
        .with_context(|| format!("failed to create {}", out.display()))?;

    let ca = out.join("ca.crt");
    let cert = out.join("server.crt");
    let key = out.join("server.key");
    std::fs::write(&ca, &material.ca_cert_pem)
        .with_context(|| format!("failed to write {}", ca.display()))?;
    std::fs::write(&cert, &material.server_cert_pem)
        .with_context(|| format!("failed to write {}", cert.display()))?;
    write_private(&key, material.server_key_pem.as_bytes())?;

    header("📜", "TLS Material Generated");
    kv_line("CA Certificate", &ca.display().to_string());
    kv_line("Server Certificate", &cert.display().to_string());
    kv_line("Server Key", &key.display().to_string());
    kv_line("Nodes Covered", &cluster.node_count().to_string());
    println!();
    warning("Self-signed demo material. Use your own CA in production.");
    Ok(())
}

async fn cmd_init(
    cluster: &Cluster,
    keys: &[PathBuf],
    threshold: Option<u8>,
    show_root: bool,
) -> Result<()> {
    let identities = keys
        .iter()
        .map(|path| load_recipient(path))
        .collect::<Result<Vec<_>>>()?;
    let bootstrap = identities.first().context("at least one --keys file is required")?;

    let distributor = KeyDistributor::new(Arc::clone(&cluster.artifacts));
    let staged = distributor
        .pending()
        .await
        .context("failed to read the staged distribution")?;
    let (pending, root_credential) = if let Some(pending) = staged {
        info_line("Finishing the distribution staged by an earlier run.");
        (pending, None)
    } else {
        let splitter =
            ThresholdSplitter::new(cluster.first_engine()?, Arc::clone(&cluster.consensus));
        let secret = splitter
            .initialize(&identities, threshold)
            .await
            .context("initialize failed")?;
        let pending = match distributor.stage(&identities, &secret).await {
            Ok(pending) => pending,
            Err(DistributionError::Stage { pending, source }) => {
                print_unstored_record(&pending);
                return Err(source).context("failed to stage the distribution");
            }
            Err(e) => return Err(e).context("failed to stage the distribution"),
        };
        (pending, Some(secret.root_credential().clone()))
    };
    let share_count = pending.shares.len();
    let threshold = pending.threshold;

    let report = distributor
        .finish(&identities, &pending)
        .await
        .context("share distribution failed; the staged record is kept, re-run `quorumctl init`")?;

    print_distribution(&report, share_count, threshold);
    print_root_credential(root_credential.as_ref(), show_root, bootstrap.label());
    println!();
    success(&format!(
        "Hand each operator their artifact. {threshold} of {share_count} are needed to unseal."
    ));
    Ok(())
}

async fn cmd_unseal(cluster: &Cluster, share: &Path, identity: &Path) -> Result<()> {
    let artifact = read_text(share)?;
    let keypair: Arc<dyn ShareDecryptor> = Arc::new(load_keypair(identity)?);
    let coordinator = UnsealCoordinator::new(Arc::clone(&cluster.config), cluster.engines.clone())?;

    match coordinator.unseal(&artifact, keypair).await {
        Ok(report) => {
            print_unseal_report(&report);
            Ok(())
        }
        Err(e) => {
            if let UnsealError::Node { report, .. } = &e {
                print_unseal_report(report);
            }
            Err(e).context("unseal failed")
        }
    }
}

async fn cmd_secure(cluster: &Cluster, args: SecureArgs) -> Result<()> {
    let material = load_material(args)?;
    match cluster.rollout_manager().secure(&material).await {
        Ok(report) => {
            print_rollout_report(&report);
            success(&format!(
                "Secure bundle v{} rolled out ({} restarts).",
                report.version,
                report.restarts()
            ));
            Ok(())
        }
        Err(e) => {
            if let RolloutError::Delivery { report, .. } | RolloutError::Restart { report, .. } =
                &e
            {
                print_rollout_report(report);
            }
            Err(e).context("secure rollout failed; re-run to continue")
        }
    }
}

async fn cmd_policy(
    cluster: &Cluster,
    name: &str,
    document: &Path,
    root_credential: Option<String>,
    identity: Option<&Path>,
) -> Result<()> {
    let document = read_text(document)?;
    Policy::parse(name, &document).context("invalid policy document")?;

    let credential = match (root_credential, identity) {
        (Some(value), _) => RootCredential::new(value),
        (None, Some(path)) => {
            let keypair = load_keypair(path)?;
            open_root_credential(Arc::clone(&cluster.artifacts), &keypair).await?
        }
        (None, None) => bail!(
            "a root credential is required: pass --root-credential or the bootstrap --identity"
        ),
    };

    cluster
        .first_engine()?
        .write_policy(&credential, name, &document)
        .await
        .with_context(|| format!("failed to write policy '{name}'"))?;
    success(&format!("Policy '{name}' written."));
    Ok(())
}

async fn cmd_status(cluster: &Cluster) -> Result<()> {
    header("🔐", "Cluster Status");
    for (spec, engine) in cluster.config.nodes().iter().zip(&cluster.engines) {
        let label = format!("{} {}", spec.ordinal, spec.name);
        match engine.seal_status().await {
            Ok(status) => {
                let mut line = seal_badge(status.state());
                if !status.initialized {
                    line.push_str(&format!(" {DIM}uninitialized{RESET}"));
                } else if status.sealed {
                    line.push_str(&format!(
                        " {} {}/{}",
                        progress_bar(status.progress, status.threshold),
                        status.progress,
                        status.threshold
                    ));
                }
                kv_line(&label, &line);
            }
            Err(e) => kv_line(
                &label,
                &format!("{} {RED}{e}{RESET}", seal_badge(SealState::Unknown)),
            ),
        }
    }
    println!();
    match cluster.consensus.status().await {
        Ok(status) => {
            kv_line(
                "Consensus Peers",
                &format!("{} of {}", status.peers, cluster.config.required_peers()),
            );
            kv_line("Leader", status.leader.as_deref().unwrap_or("none"));
        }
        Err(e) => kv_line("Consensus", &format!("{RED}{e}{RESET}")),
    }
    println!();
    Ok(())
}

async fn cmd_verify(cluster: &Cluster) -> Result<()> {
    let status = cluster
        .rollout_manager()
        .verify()
        .await
        .context("failed to read rollout ledger")?;
    print_rollout_status(&status);
    if status.target.is_none() {
        warning("No secure rollout has been recorded.");
        return Ok(());
    }
    if !status.converged {
        bail!(
            "{} node(s) not on the target bundle; re-run `quorumctl secure`",
            status.lagging.len()
        );
    }
    success("Every node runs the target bundle.");
    Ok(())
}

async fn cmd_wait(cluster: &Cluster) -> Result<()> {
    let mut shutdown = shutdown_signal();
    let peers = cluster
        .sequencer()
        .wait_for_quorum(&mut shutdown)
        .await
        .context("quorum wait failed")?;
    success(&format!("Quorum formed ({peers} peers)."));
    Ok(())
}

async fn cmd_bootstrap(cluster: &Cluster, args: BootstrapArgs) -> Result<()> {
    let identities = args
        .keys
        .iter()
        .map(|path| load_recipient(path))
        .collect::<Result<Vec<_>>>()?;
    let bootstrap = identities
        .first()
        .map(|i| i.label().to_owned())
        .context("at least one --keys file is required")?;

    let secure = if args.generate_tls {
        let material =
            generate_cluster_material(&cluster.config).context("certificate generation failed")?;
        Some(material.into_secure_material(args.secure.gossip))
    } else if args.secure.tls_key.is_some() || args.secure.tls_cert.is_some() {
        Some(load_material(args.secure)?)
    } else {
        None
    };

    let unseal_with = args
        .unseal_with
        .iter()
        .map(|path| load_keypair(path).map(Arc::new))
        .collect::<Result<Vec<_>>>()?;
    let policies = args
        .policies
        .iter()
        .map(|arg| parse_policy_arg(arg))
        .collect::<Result<Vec<_>>>()?;

    let plan = BootstrapPlan {
        identities,
        threshold: args.threshold,
        secure,
        unseal_with,
        policies,
    };
    let summary = match cluster.sequencer().run(plan, shutdown_signal()).await {
        Ok(summary) => summary,
        Err(BootstrapError::Distribution(DistributionError::Stage { pending, source })) => {
            print_unstored_record(&pending);
            return Err(source).context("bootstrap failed while staging the distribution");
        }
        Err(e) => {
            return Err(e).context(
                "bootstrap failed; completed steps and any staged distribution are kept, \
                 re-run to continue",
            );
        }
    };
    print_summary(&summary, args.show_root_credential, &bootstrap);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use quorum_core::identity::EnvelopePurpose;

    use super::*;

    #[test]
    fn progress_bar_fills_proportionally() {
        let bar = progress_bar(1, 2);
        assert_eq!(bar.matches('█').count(), 10);
        assert_eq!(bar.matches('░').count(), 10);
        assert_eq!(progress_bar(0, 0).matches('░').count(), 20);
        assert_eq!(progress_bar(5, 3).matches('█').count(), 20);
    }

    #[test]
    fn policy_arg_requires_name_and_path() {
        assert!(parse_policy_arg("no-separator").is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ops.json");
        std::fs::write(
            &path,
            r#"{"rules":[{"path":"secret/*","capabilities":["read"]}]}"#,
        )
        .unwrap();
        let (name, document) = parse_policy_arg(&format!("ops={}", path.display())).unwrap();
        assert_eq!(name, "ops");
        assert!(document.contains("secret/*"));
    }

    #[test]
    fn recipient_loads_from_secret_file_too() {
        let dir = tempfile::tempdir().unwrap();
        let keypair = IdentityKeypair::generate("alice").unwrap();
        let secret = dir.path().join("alice.key.json");
        let public = dir.path().join("alice.pub.json");
        std::fs::write(&secret, keypair.to_json().unwrap().as_bytes()).unwrap();
        std::fs::write(&public, keypair.identity().to_json().unwrap()).unwrap();

        assert_eq!(load_recipient(&public).unwrap(), keypair.identity());
        assert_eq!(load_recipient(&secret).unwrap(), keypair.identity());
        assert!(load_keypair(&public).is_err());
    }

    #[test]
    fn private_files_are_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.key");
        write_private(&path, b"one").unwrap();
        assert!(write_private(&path, b"two").is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"one");
    }

    #[tokio::test]
    async fn root_credential_opens_with_bootstrap_identity() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = FileBackend::open(dir.path()).await.unwrap();
        let alice = IdentityKeypair::generate("alice").unwrap();
        let bob = IdentityKeypair::generate("bob").unwrap();

        let artifacts: Arc<dyn StorageBackend> = Arc::new(artifacts);
        assert!(open_root_credential(Arc::clone(&artifacts), &alice).await.is_err());

        let sealed = alice
            .identity()
            .seal(EnvelopePurpose::RootCredential, b"q.root")
            .unwrap();
        artifacts
            .put(ROOT_CREDENTIAL_KEY, hex::encode(sealed).as_bytes())
            .await
            .unwrap();

        let opened = open_root_credential(Arc::clone(&artifacts), &alice).await.unwrap();
        assert_eq!(opened.expose(), "q.root");
        assert!(open_root_credential(artifacts, &bob).await.is_err());
    }
}
