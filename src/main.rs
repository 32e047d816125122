use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use proxynaut::cli::{HostSelector, IssueCommand};
use proxynaut::config::CONFIG_FILE_NAME;
use proxynaut::lifecycle::SweepOutcome;
use proxynaut::model::{CertificateId, CertificateUpdate};
use proxynaut::{CRATE_NAME, Proxynaut, config};
use serde::Serialize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

const ENV_FILTER_NAME: &str = "PROXYNAUT_LOG";

#[derive(Debug, Parser)]
#[command(version, about, long_about = "")]
struct CommandLineArguments {
    /// Path to configuration directory
    #[arg(short, long, env = "PROXYNAUT_CONFIG", default_value_os_t = config::get_default_config_directory())]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
    /// Shorthand option to enable debug logging (logging can be fine-tuned via `PROXYNAUT_LOG` environment variable)
    #[clap(long, short, action)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Render the nginx configuration of one host, then reload nginx
    Render(HostSelector),
    /// Remove the nginx configuration of one host, then reload nginx
    Remove(HostSelector),
    /// Test the nginx configuration tree
    Test,
    /// Test, then reload nginx
    Reload,
    /// Show subject, issuer and validity of a PEM certificate file
    Inspect {
        file: PathBuf,
        /// Fail if the certificate has expired
        #[clap(long, action)]
        enforce_not_expired: bool,
    },
    /// Check that a PEM private key file is valid
    CheckKey { file: PathBuf },
    /// Obtain a new certificate
    Issue(IssueCommand),
    /// Renew one certificate now, regardless of its expiry date
    Renew { id: CertificateId },
    /// Rename a certificate or change its ACME settings
    Update {
        id: CertificateId,
        /// New display name
        #[clap(long)]
        name: Option<String>,
        /// New contact address registered with Let's Encrypt
        #[clap(short, long)]
        email: Option<String>,
        /// Seconds to wait for DNS propagation (DNS provider only)
        #[clap(long)]
        propagation_seconds: Option<u32>,
    },
    /// Pack the live PEM files of a Let's Encrypt certificate into a tarball
    Download { id: CertificateId },
    /// Renew every certificate close to expiry
    Sweep,
    /// Check whether domains reach the ACME webroot over plain HTTP
    CheckHttp {
        #[clap(value_delimiter = ',', num_args = 1.., required = true)]
        domains: Vec<String>,
    },
    /// Run the periodic renewal timer until interrupted
    Run,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn process_cli_command(cmd: Command, client: Proxynaut) -> anyhow::Result<()> {
    match cmd {
        Command::Render(host) => {
            let host = client.hosts.reapply(host.host_type, host.id).await?;
            if let Some(err) = host.meta.nginx_err {
                bail!("nginx rejected the configuration, the host is offline: {err}");
            }
            let path = client
                .nginx
                .generator
                .config_path_for(host.host_type(), host.id);
            println!("{}", path.display());
        }
        Command::Remove(host) => client.hosts.withdraw(host.host_type, host.id).await?,
        Command::Test => {
            client.nginx.daemon.test().await?;
            println!("nginx configuration is valid");
        }
        Command::Reload => client.nginx.daemon.reload().await?,
        Command::Inspect {
            file,
            enforce_not_expired,
        } => {
            let info = client
                .validator
                .inspect_certificate_file(&file, enforce_not_expired)
                .await?;
            print_json(&info)?;
        }
        Command::CheckKey { file } => {
            let pem = std::fs::read_to_string(&file)
                .with_context(|| format!("Reading {}", file.display()))?;
            client.validator.check_private_key(&pem).await?;
            println!("Key is valid");
        }
        Command::Issue(issue) => {
            let certificate = issue
                .into_certificate()
                .context("Reading DNS credentials file")?;
            let certificate = client.certificates.create(certificate).await?;
            print_json(&certificate.public_view())?;
        }
        Command::Renew { id } => {
            let certificate = client.certificates.renew(id).await?;
            print_json(&certificate.public_view())?;
        }
        Command::Update {
            id,
            name,
            email,
            propagation_seconds,
        } => {
            let certificate = client
                .certificates
                .update(CertificateUpdate {
                    id,
                    nice_name: name,
                    letsencrypt_email: email,
                    propagation_seconds,
                })
                .await?;
            print_json(&certificate.public_view())?;
        }
        Command::Download { id } => {
            let archive = client.certificates.download(id).await?;
            println!("{}", archive.display());
        }
        Command::Sweep => match client.certificates.process_expiring_hosts().await {
            SweepOutcome::Completed(report) => print_json(&report)?,
            SweepOutcome::AlreadyRunning => bail!("A renewal sweep is already running"),
            SweepOutcome::Failed(err) => return Err(err).context("Renewal sweep failed"),
        },
        Command::CheckHttp { domains } => {
            let results = client.certificates.test_http_challenge(&domains).await?;
            print_json(&results)?;
        }
        Command::Run => {
            let cancel = CancellationToken::new();
            let timer = {
                let certificates = client.certificates.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { certificates.run_renewal_timer(cancel).await })
            };
            info!("{CRATE_NAME} is running, press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("Waiting for shutdown signal")?;
            cancel.cancel();
            timer.await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CommandLineArguments::parse();
    let filter = EnvFilter::try_from_env(ENV_FILTER_NAME).unwrap_or_else(|_| {
        EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| {
            EnvFilter::new(if cli.verbose {
                "proxynaut=debug,info"
            } else {
                "info"
            })
        })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let config_file = cli.config.join(CONFIG_FILE_NAME);
    let config = config::load(&config_file)
        .with_context(|| format!("Loading configuration from {}", config_file.display()))?;
    let client = Proxynaut::try_new(config).context("Loading configuration failed")?;
    process_cli_command(cli.command, client).await
}
