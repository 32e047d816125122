use crate::cmd_runner::{CommandRunner, CommandSpec};
use crate::config::Configuration;
use crate::error::{Error, IoContext, Result};
use crate::model::{CertificateId, CertificateProvider};
use crate::util;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tracing::{info, warn};

static DOMAIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w\-.*]+$").expect("static regex"));

const ROOT_CA_CERTIFICATE: &str = "rootCA.pem";
const ROOT_CA_KEY: &str = "rootCA-key.pem";
const FULLCHAIN: &str = "fullchain.pem";
const PRIVATE_KEY: &str = "privkey.pem";

/// Rejects anything that could escape the argument list or the certificate directory.
pub fn validate_domains(domains: &[String]) -> Result<()> {
    if domains.is_empty() {
        return Err(Error::validation("At least one domain name is required"));
    }
    for domain in domains {
        if !DOMAIN.is_match(domain)
            || domain.contains("..")
            || domain.contains('/')
            || domain.contains('\\')
        {
            return Err(Error::validation(format!("Invalid domain name: {domain}")));
        }
    }
    Ok(())
}

/// Locally trusted development certificates, issued by a local CA through `mkcert`.
pub struct Mkcert {
    runner: Arc<dyn CommandRunner>,
    config: Arc<Configuration>,
}

impl Mkcert {
    pub fn new(runner: Arc<dyn CommandRunner>, config: Arc<Configuration>) -> Self {
        Self { runner, config }
    }

    fn certificate_directory(&self, id: CertificateId) -> PathBuf {
        self.config
            .certificate_directory(CertificateProvider::Mkcert, id)
    }

    fn command(&self) -> CommandSpec {
        CommandSpec::new(&self.config.mkcert.binary).env("CAROOT", &self.config.mkcert.ca_root)
    }

    pub fn ca_exists(&self) -> bool {
        let ca_root = &self.config.mkcert.ca_root;
        ca_root.join(ROOT_CA_CERTIFICATE).is_file() && ca_root.join(ROOT_CA_KEY).is_file()
    }

    /// Creates the local CA unless it already exists.
    pub async fn ensure_ca(&self) -> Result<()> {
        if self.ca_exists() {
            return Ok(());
        }
        let ca_root = &self.config.mkcert.ca_root;
        info!("Creating mkcert CA in {}", ca_root.display());
        std::fs::create_dir_all(ca_root).with_path(ca_root)?;
        self.runner
            .run_checked(&self.command().arg("-install"), self.config.timeouts.command)
            .await?;
        Ok(())
    }

    /// Where a run writes before its output replaces the live material.
    fn staging_directory(&self, id: CertificateId) -> PathBuf {
        self.config
            .mkcert
            .cert_dir
            .join(format!(".{}.new", self.config.certificate_name(id)))
    }

    /// Issues `fullchain.pem` and `privkey.pem` for `domains`. Output goes to a staging directory
    /// first and only replaces the current material once mkcert succeeded, so a failed run leaves
    /// an existing certificate untouched.
    pub async fn generate(&self, id: CertificateId, domains: &[String]) -> Result<PathBuf> {
        validate_domains(domains)?;
        self.ensure_ca().await?;
        let dir = self.certificate_directory(id);
        let staging = self.staging_directory(id);
        // Leftover of an interrupted run
        util::remove_dir_all(&staging)?;
        std::fs::create_dir_all(&staging).with_path(&staging)?;
        util::set_mode(&staging, 0o700)?;
        let fullchain = staging.join(FULLCHAIN);
        let private_key = staging.join(PRIVATE_KEY);
        let command = self
            .command()
            .arg("-cert-file")
            .arg(&fullchain)
            .arg("-key-file")
            .arg(&private_key)
            .args(domains);
        info!("Generating mkcert certificate {id} for {}", domains.join(", "));
        let result = async {
            self.runner
                .run_checked(&command, self.config.timeouts.command)
                .await?;
            util::set_mode(&fullchain, 0o644)?;
            util::set_mode(&private_key, 0o600)?;
            install(&staging, &dir)
        }
        .await;
        if let Err(err) = result {
            if let Err(cleanup) = util::remove_dir_all(&staging) {
                warn!("Could not clean up {}: {cleanup}", staging.display());
            }
            return Err(err);
        }
        Ok(dir)
    }

    pub fn delete(&self, id: CertificateId) -> Result<bool> {
        util::remove_dir_all(self.certificate_directory(id))
    }
}

/// Moves freshly generated files over the live ones, one rename per file.
fn install(staging: &Path, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_path(dir)?;
    util::set_mode(dir, 0o700)?;
    for name in [FULLCHAIN, PRIVATE_KEY] {
        let target = dir.join(name);
        std::fs::rename(staging.join(name), &target).with_path(&target)?;
    }
    util::remove_dir_all(staging)?;
    Ok(())
}
