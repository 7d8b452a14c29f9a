//! atriumadm - Atrium server administration
//!
//! Usage:
//!   atriumadm install --fqdn srv.example.com ...   # fresh install
//!   atriumadm upgrade                              # converge on a new image
//!   atriumadm migrate old.example.com              # pull data, then finalize
//!   atriumadm status                               # probe only

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use console::style;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use atrium_core::backend::kubectl::KubectlBackend;
use atrium_core::components::Component;
use atrium_core::config::{Credentials, MigrationConfig, ServerConfig};
use atrium_core::migrate::collect_ssh_material;
use atrium_core::plan::Waiter;
use atrium_core::reconcile::ReconciliationPlanner;
use atrium_core::ssl::{CertSubject, SslConfig};

#[derive(Parser)]
#[command(name = "atriumadm")]
#[command(about = "Install, upgrade and migrate the Atrium server", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install the server on the target cluster
    Install(Box<DeployArgs>),
    /// Upgrade an existing installation to the configured image
    ///
    /// Re-running after a failed run is safe: every step re-derives its
    /// work from the environment.
    Upgrade(Box<DeployArgs>),
    /// Migrate a remote server's data onto the target cluster, then
    /// finalize it here
    Migrate {
        /// FQDN of the source server; its SSH configuration must be
        /// complete and an ssh agent holding the key must be running
        source_fqdn: String,

        /// User connecting to the source server
        #[arg(long, default_value = "root")]
        ssh_user: String,

        /// SSH private key file (defaults to ~/.ssh/id_rsa)
        #[arg(long)]
        ssh_key: Option<PathBuf>,

        #[command(flatten)]
        args: DeployArgs,
    },
    /// Show the probed deployment state without changing anything
    Status {
        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Target namespace
    #[arg(short, long)]
    namespace: Option<String>,

    /// Image registry host
    #[arg(long)]
    registry: Option<String>,

    /// Server image tag
    #[arg(long)]
    tag: Option<String>,
}

#[derive(Args)]
struct DeployArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Fully qualified name the server answers on
    #[arg(long)]
    fqdn: Option<String>,

    /// Server timezone
    #[arg(long)]
    timezone: Option<String>,

    /// Database account
    #[arg(long)]
    db_user: Option<String>,
    #[arg(long)]
    db_password: Option<String>,

    /// Database administrator account (local database bootstrap)
    #[arg(long)]
    db_admin_user: Option<String>,
    #[arg(long)]
    db_admin_password: Option<String>,

    /// Report database account
    #[arg(long)]
    reportdb_user: Option<String>,
    #[arg(long)]
    reportdb_password: Option<String>,

    /// First administrator account
    #[arg(long)]
    admin_user: Option<String>,
    #[arg(long)]
    admin_password: Option<String>,

    /// Replicas of the attestation service (omit to preserve the deployed
    /// count; 0 disables it)
    #[arg(long)]
    attestation_replicas: Option<u32>,

    /// Replicas of the hub API bridge
    #[arg(long)]
    hub_api_replicas: Option<u32>,

    /// Replicas of the event processor
    #[arg(long)]
    event_processor_replicas: Option<u32>,

    /// Provided server certificate (with --ssl-key and --ssl-ca-chain)
    #[arg(long)]
    ssl_cert: Option<PathBuf>,
    #[arg(long)]
    ssl_key: Option<PathBuf>,
    #[arg(long)]
    ssl_ca_chain: Option<PathBuf>,

    /// Existing CA to issue certificates from (with --ssl-ca-key)
    #[arg(long)]
    ssl_ca_cert: Option<PathBuf>,
    #[arg(long)]
    ssl_ca_key: Option<PathBuf>,

    /// Subject fields for a generated CA
    #[arg(long)]
    ssl_country: Option<String>,
    #[arg(long)]
    ssl_org: Option<String>,
    #[arg(long)]
    ssl_email: Option<String>,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "atriumadm=debug,atrium_core=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Install(args) | Commands::Upgrade(args) => run_reconcile(*args),
        Commands::Migrate {
            source_fqdn,
            ssh_user,
            ssh_key,
            args,
        } => run_migrate(source_fqdn, ssh_user, ssh_key, args),
        Commands::Status { common } => run_status(common),
    }
}

fn run_reconcile(args: DeployArgs) -> Result<()> {
    let config = build_config(args)?;
    let backend = KubectlBackend::new()?;
    let waiter = Waiter::default();
    let planner = ReconciliationPlanner::new(&backend, &config, &waiter);
    planner.reconcile()?;
    println!(
        "{} server converged in namespace {}",
        style("✓").green().bold(),
        style(&config.namespace).cyan()
    );
    Ok(())
}

fn run_migrate(
    source_fqdn: String,
    ssh_user: String,
    ssh_key: Option<PathBuf>,
    args: DeployArgs,
) -> Result<()> {
    let mut config = build_config(args)?;
    config.migration = Some(MigrationConfig {
        source_fqdn,
        user: ssh_user,
    });

    let auth_sock = std::env::var("SSH_AUTH_SOCK").ok();
    let home = dirs::home_dir()
        .ok_or_else(|| anyhow::anyhow!("could not determine the home directory"))?;
    let material = collect_ssh_material(auth_sock.as_deref(), &home, ssh_key.as_deref())?;

    let backend = KubectlBackend::new()?;
    let waiter = Waiter::default();
    let planner = ReconciliationPlanner::new(&backend, &config, &waiter);
    planner.migrate(&material)?;
    println!(
        "{} migration complete, server running in namespace {}",
        style("✓").green().bold(),
        style(&config.namespace).cyan()
    );
    Ok(())
}

fn run_status(common: CommonArgs) -> Result<()> {
    let mut config = ServerConfig::load(common.config.as_deref())?;
    apply_common(&mut config, &common);
    config.validate()?;

    let backend = KubectlBackend::new()?;
    let waiter = Waiter::default();
    let planner = ReconciliationPlanner::new(&backend, &config, &waiter);
    let state = planner.probe_state()?;

    println!("{}", style("Deployment state").bold());
    println!("  namespace:      {}", config.namespace);
    println!("  classification: {}", style(state.classify()).cyan());
    println!("  deployment:     {}", yes_no(state.has_running_deployment));
    println!("  database data:  {}", yes_no(state.has_bound_db_volume));
    if let Some(image) = &state.running_image {
        println!("  running image:  {image}");
    }
    if let (Some(installed), Some(target)) = (state.installed_schema, state.target_schema) {
        println!("  schema:         {installed} installed, {target} in target image");
    }
    for (component, replicas) in &state.component_replicas {
        println!("  {}: {replicas} replicas", component.deploy_name());
    }
    Ok(())
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

fn build_config(args: DeployArgs) -> Result<ServerConfig> {
    let mut config = ServerConfig::load(args.common.config.as_deref())?;
    apply_common(&mut config, &args.common);

    if args.fqdn.is_some() {
        config.fqdn = args.fqdn;
    }
    if args.timezone.is_some() {
        config.timezone = args.timezone;
    }
    apply_credentials(&mut config.database.credentials, args.db_user, args.db_password);
    apply_credentials(
        &mut config.database.admin,
        args.db_admin_user,
        args.db_admin_password,
    );
    apply_credentials(
        &mut config.database.report,
        args.reportdb_user,
        args.reportdb_password,
    );
    apply_credentials(&mut config.admin, args.admin_user, args.admin_password);

    // Only set when the flag was actually given, so an explicit 0 stays
    // distinguishable from "preserve the deployed count".
    for (component, replicas) in [
        (Component::Attestation, args.attestation_replicas),
        (Component::HubApi, args.hub_api_replicas),
        (Component::EventProcessor, args.event_processor_replicas),
    ] {
        if replicas.is_some() {
            config.components.get_mut(component).replicas = replicas;
        }
    }

    if let (Some(certificate), Some(key), Some(ca_chain)) =
        (&args.ssl_cert, &args.ssl_key, &args.ssl_ca_chain)
    {
        config.ssl = SslConfig::Provided {
            certificate: certificate.clone(),
            key: key.clone(),
            ca_chain: ca_chain.clone(),
        };
    } else if let (Some(ca_certificate), Some(ca_key)) = (&args.ssl_ca_cert, &args.ssl_ca_key) {
        config.ssl = SslConfig::ReuseCa {
            ca_certificate: ca_certificate.clone(),
            ca_key: ca_key.clone(),
        };
    } else if args.ssl_country.is_some() || args.ssl_org.is_some() || args.ssl_email.is_some() {
        config.ssl = SslConfig::Generate {
            subject: CertSubject {
                country: args.ssl_country,
                organization: args.ssl_org,
                email: args.ssl_email,
                ..Default::default()
            },
        };
    }

    config.validate()?;
    Ok(config)
}

fn apply_credentials(credentials: &mut Credentials, user: Option<String>, password: Option<String>) {
    if user.is_some() {
        credentials.user = user;
    }
    if password.is_some() {
        credentials.password = password;
    }
}

fn apply_common(config: &mut ServerConfig, common: &CommonArgs) {
    if let Some(namespace) = &common.namespace {
        config.namespace = namespace.clone();
    }
    if let Some(registry) = &common.registry {
        config.registry.host = registry.clone();
    }
    if let Some(tag) = &common.tag {
        config.image.tag = tag.clone();
    }
}
