//! Trust Plane CLI
//!
//! Generates CA, server, key-exchange and OpenPGP material for a domain and
//! exports it as DNS records.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use trustplane::configs::{AppConfig, DEFAULT_CONFIG_PATH};
use trustplane::error::TrustError;
use trustplane::generate_server_cert::{IssuanceDecision, IssuanceMode};
use trustplane::rotation::{RotationScope, RotationStep};
use trustplane::trust_plane::TrustPlane;

/// Exit status when a multi-target rotation stopped after rotating something
const EXIT_PARTIAL_ROTATION: i32 = 2;

/// Trust Plane - DNS-anchored certificates and keys
#[derive(Parser, Debug)]
#[command(name = "trustplane")]
#[command(about = "Generate explicit trust material and export it as DNS records")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ./trustplane.toml when present)
    #[arg(long, global = true, env = "TRUSTPLANE_CONFIG")]
    config: Option<PathBuf>,

    /// Artifact store directory, overriding `store_path`
    #[arg(long, global = true, env = "TRUSTPLANE_STORE")]
    store: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the root and intermediate CA with configured defaults
    InitCa,

    /// Create or replace the Ed448 root CA
    RootCa {
        #[arg(long)]
        common_name: Option<String>,
        #[arg(long)]
        days: Option<u32>,
    },

    /// Create or replace the intermediate CA under the existing root
    IntermediateCa {
        #[arg(long)]
        common_name: Option<String>,
        #[arg(long)]
        days: Option<u32>,
    },

    /// Issue the Ed25519 server certificate for a domain
    Issue {
        #[arg(long)]
        domain: Option<String>,
        #[arg(long)]
        days: Option<u32>,
        /// Sign with the certificate's own key instead of the intermediate CA
        #[arg(long)]
        self_signed: bool,
    },

    /// Generate the X25519 key-exchange key for a domain
    Kex {
        #[arg(long)]
        domain: Option<String>,
    },

    /// Generate an OpenPGP key for an email identity
    Pgp {
        #[arg(long)]
        identity: String,
        /// Expiry in GnuPG syntax: 2y, 6m, 30d, never
        #[arg(long)]
        expiry: Option<String>,
    },

    /// Render the zone records for a domain
    Export {
        #[arg(long)]
        domain: Option<String>,
        /// Also write the Web Key Directory tree
        #[arg(long)]
        wkd: bool,
        /// Print the zone instead of writing it to the store
        #[arg(long)]
        stdout: bool,
    },

    /// Replace artifacts after backing up the current ones
    Rotate {
        /// cert, kex or all
        scope: String,
        #[arg(long)]
        domain: Option<String>,
    },

    /// Show recorded artifacts and check them against each other
    Status {
        #[arg(long)]
        domain: Option<String>,
    },
}

fn init_logging(verbose: bool) {
    let log_level = if verbose {
        "debug".to_string()
    } else {
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string())
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn print_downgrade(step: &RotationStep) {
    if let Some(decision) = step.decision.filter(IssuanceDecision::is_downgraded) {
        println!("! {}", decision);
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => AppConfig::load().with_context(|| format!("Failed to load {}", DEFAULT_CONFIG_PATH))?,
    };
    if let Some(store) = &cli.store {
        config.store_path = store.clone();
    }
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli)?;
    let plane = TrustPlane::open(config.clone())
        .with_context(|| format!("Failed to open store {}", config.store_path.display()))?;
    let defaults = &config.defaults;
    let domain_or_default = |domain: Option<String>| domain.unwrap_or_else(|| defaults.domain.clone());

    match cli.command {
        Commands::InitCa => {
            let (root, intermediate) = plane.init_ca().context("Failed to initialise CA")?;
            println!("✓ Root CA {} ({})", root.name, root.fingerprint);
            println!("✓ Intermediate CA {} ({})", intermediate.name, intermediate.fingerprint);
        }
        Commands::RootCa { common_name, days } => {
            let record = plane
                .create_root_ca(
                    &common_name.unwrap_or_else(|| config.ca.root_common_name.clone()),
                    days.unwrap_or(defaults.root_ca_validity_days),
                )
                .context("Failed to create root CA")?;
            println!("✓ Root CA {} ({})", record.name, record.fingerprint);
        }
        Commands::IntermediateCa { common_name, days } => {
            let record = plane
                .create_intermediate_ca(
                    &common_name.unwrap_or_else(|| config.ca.intermediate_common_name.clone()),
                    days.unwrap_or(defaults.intermediate_ca_validity_days),
                )
                .context("Failed to create intermediate CA")?;
            println!("✓ Intermediate CA {} ({})", record.name, record.fingerprint);
        }
        Commands::Issue {
            domain,
            days,
            self_signed,
        } => {
            let domain = domain_or_default(domain);
            let mode = if self_signed {
                IssuanceMode::SelfSigned
            } else {
                IssuanceMode::CaSigned
            };
            let issued = plane
                .issue_certificate(&domain, days.unwrap_or(defaults.cert_validity_days), mode)
                .with_context(|| format!("Failed to issue certificate for {}", domain))?;
            if issued.decision.is_downgraded() {
                println!("! {}", issued.decision);
            }
            println!(
                "✓ Server certificate for {} ({}), SPKI SHA-256 {}",
                issued.record.name,
                issued.decision.effective_mode(),
                issued.record.fingerprint
            );
        }
        Commands::Kex { domain } => {
            let domain = domain_or_default(domain);
            let record = plane
                .generate_kex(&domain)
                .with_context(|| format!("Failed to generate key-exchange key for {}", domain))?;
            println!("✓ X25519 key for {} ({})", record.name, record.fingerprint);
        }
        Commands::Pgp { identity, expiry } => {
            let expiry = expiry.unwrap_or_else(|| defaults.pgp_expiry.clone());
            let record = plane
                .generate_pgp_key(&identity, &expiry)
                .with_context(|| format!("Failed to generate OpenPGP key for {}", identity))?;
            println!("✓ OpenPGP key for {} ({})", record.name, record.fingerprint);
        }
        Commands::Export {
            domain,
            wkd,
            stdout,
        } => {
            let domain = domain_or_default(domain);
            if stdout {
                print!(
                    "{}",
                    plane
                        .export_zone(&domain)
                        .with_context(|| format!("Failed to export zone for {}", domain))?
                );
            } else {
                let path = plane
                    .write_zone(&domain)
                    .with_context(|| format!("Failed to write zone for {}", domain))?;
                println!("✓ Zone written to {}", path.display());
            }
            if wkd {
                let path = plane
                    .export_wkd(&domain)
                    .with_context(|| format!("Failed to export WKD for {}", domain))?;
                info!(path = %path.display(), "WKD tree ready");
                if !stdout {
                    println!("✓ WKD tree written to {}", path.display());
                }
            }
        }
        Commands::Rotate { scope, domain } => {
            let domain = domain_or_default(domain);
            let scope: RotationScope = scope.parse().context("Invalid rotation scope")?;
            match plane.rotate(&domain, scope) {
                Ok(report) => {
                    for step in &report.steps {
                        print_downgrade(step);
                        match &step.backup {
                            Some(backup) => println!(
                                "✓ Rotated {} ({}), previous kept at {}",
                                step.target,
                                step.fingerprint,
                                backup.display()
                            ),
                            None => println!("✓ Generated {} ({})", step.target, step.fingerprint),
                        }
                    }
                }
                Err(TrustError::Rotation(failure)) if failure.is_partial() => {
                    for step in &failure.completed {
                        print_downgrade(step);
                        println!("✓ Rotated {} ({})", step.target, step.fingerprint);
                    }
                    eprintln!("✗ Rotation incomplete: {}", failure);
                    std::process::exit(EXIT_PARTIAL_ROTATION);
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to rotate {} for {}", scope, domain))
                }
            }
        }
        Commands::Status { domain } => {
            let domain = domain_or_default(domain);
            let report = plane
                .status(&domain)
                .with_context(|| format!("Failed to read status for {}", domain))?;
            print!("{}", report);
            if !report.is_consistent() {
                anyhow::bail!("{} finding(s) for {}", report.findings.len(), domain);
            }
        }
    }

    Ok(())
}
