use crate::acme::AcmeClient;
use crate::acme::dns_plugins::{self, DnsPlugin};
use crate::cmd_runner::{CommandRunner, CommandSpec};
use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::model::{Certificate, CertificateId, CertificateProvider};
use crate::util;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

const PREFERRED_CHALLENGES: &str = "dns,http";

/// Drives the `certbot` command line client.
pub struct Certbot {
    runner: Arc<dyn CommandRunner>,
    config: Arc<Configuration>,
    installed_plugins: Mutex<HashSet<&'static str>>,
}

impl Certbot {
    pub fn new(runner: Arc<dyn CommandRunner>, config: Arc<Configuration>) -> Self {
        Self {
            runner,
            config,
            installed_plugins: Mutex::default(),
        }
    }

    pub fn credentials_path(&self, id: CertificateId) -> PathBuf {
        self.config
            .certbot
            .credentials_dir
            .join(format!("credentials-{id}"))
    }

    fn command(&self, subcommand: &str) -> CommandSpec {
        let mut command = CommandSpec::new(&self.config.certbot.binary).arg(subcommand);
        if let Some(config_file) = &self.config.certbot.config_file {
            command = command.arg("--config").arg(config_file);
        }
        command
    }

    fn with_staging(&self, command: CommandSpec) -> CommandSpec {
        if self.config.certbot.staging {
            command.arg("--staging")
        } else {
            command
        }
    }

    fn email(certificate: &Certificate) -> Result<&str> {
        if !certificate.meta.letsencrypt_agree {
            return Err(Error::validation(
                "The Let's Encrypt terms of service must be agreed to",
            ));
        }
        certificate
            .meta
            .letsencrypt_email
            .as_deref()
            .filter(|email| !email.trim().is_empty())
            .ok_or_else(|| Error::validation("An email address is required for Let's Encrypt"))
    }

    pub(crate) fn dns_plugin(certificate: &Certificate) -> Result<&'static DnsPlugin> {
        let id = certificate
            .meta
            .dns_provider
            .as_deref()
            .ok_or_else(|| Error::validation("A DNS provider is required for DNS challenges"))?;
        dns_plugins::find(id).ok_or_else(|| {
            Error::validation(format!(
                "Unknown DNS provider '{id}', expected one of: {}",
                dns_plugins::known_ids()
            ))
        })
    }

    pub(crate) fn http_request_command(&self, certificate: &Certificate) -> Result<CommandSpec> {
        let email = Self::email(certificate)?;
        let command = self
            .command("certonly")
            .arg("--cert-name")
            .arg(self.config.certificate_name(certificate.id))
            .args(["--agree-tos", "--authenticator", "webroot", "--email"])
            .arg(email)
            .args(["--preferred-challenges", PREFERRED_CHALLENGES, "--domains"])
            .arg(certificate.domain_names.join(","));
        Ok(self.with_staging(command))
    }

    pub(crate) fn dns_request_command(
        &self,
        certificate: &Certificate,
        plugin: &DnsPlugin,
    ) -> Result<CommandSpec> {
        let email = Self::email(certificate)?;
        let credentials = self.credentials_path(certificate.id);
        let mut command = self
            .command("certonly")
            .arg("--cert-name")
            .arg(self.config.certificate_name(certificate.id))
            .args(["--agree-tos", "--email"])
            .arg(email)
            .arg("--domains")
            .arg(certificate.domain_names.join(","))
            .arg("--authenticator")
            .arg(plugin.full_plugin_name);
        if plugin.uses_aws_config() {
            command = command.env("AWS_CONFIG_FILE", &credentials);
        } else {
            command = command.arg(plugin.credentials_flag()).arg(&credentials);
        }
        if let Some(seconds) = certificate.meta.propagation_seconds {
            command = command
                .arg(plugin.propagation_flag())
                .arg(seconds.to_string());
        }
        Ok(self.with_staging(command))
    }

    pub(crate) fn renew_command(&self, certificate: &Certificate) -> Result<CommandSpec> {
        let mut command = self
            .command("renew")
            .arg("--force-renewal")
            .arg("--cert-name")
            .arg(self.config.certificate_name(certificate.id));
        if certificate.provider == CertificateProvider::LetsEncryptDns {
            if Self::dns_plugin(certificate)?.uses_aws_config() {
                command = command.env("AWS_CONFIG_FILE", self.credentials_path(certificate.id));
            }
        } else {
            command = command.args(["--preferred-challenges", PREFERRED_CHALLENGES]);
        }
        let command = command.args(["--no-random-sleep-on-renew", "--disable-hook-validation"]);
        Ok(self.with_staging(command))
    }

    pub(crate) fn revoke_command(&self, certificate: &Certificate) -> CommandSpec {
        let command = self
            .command("revoke")
            .arg("--cert-path")
            .arg(
                self.config
                    .fullchain_path(certificate.provider, certificate.id),
            )
            .arg("--delete-after-revoke");
        self.with_staging(command)
    }

    async fn ensure_plugin_installed(&self, plugin: &'static DnsPlugin) -> Result<()> {
        let Some(pip) = &self.config.certbot.pip else {
            return Ok(());
        };
        if self.installed_plugins.lock().contains(plugin.id) {
            return Ok(());
        }
        info!("Installing certbot plugin {}", plugin.package_name);
        let command = CommandSpec::new(pip)
            .args(["install", "--no-cache-dir"])
            .args(plugin.pip_requirements());
        self.runner
            .run_checked(&command, self.config.timeouts.acme)
            .await?;
        self.installed_plugins.lock().insert(plugin.id);
        Ok(())
    }

    fn write_credentials(&self, certificate: &Certificate) -> Result<PathBuf> {
        let credentials = certificate
            .meta
            .dns_provider_credentials
            .as_deref()
            .ok_or_else(|| Error::validation("DNS provider credentials are required"))?;
        let path = self.credentials_path(certificate.id);
        util::write_atomic_with_mode(&path, credentials.as_bytes(), 0o600)?;
        debug!("Wrote DNS credentials to {}", path.display());
        Ok(path)
    }

    async fn request_with_dns(&self, certificate: &Certificate) -> Result<()> {
        let plugin = Self::dns_plugin(certificate)?;
        let command = self.dns_request_command(certificate, plugin)?;
        let credentials = self.write_credentials(certificate)?;
        let result = async {
            self.ensure_plugin_installed(plugin).await?;
            info!(
                "Requesting certificate {} via {} for {}",
                certificate.id,
                plugin.display_name,
                certificate.domain_names.join(", ")
            );
            self.runner
                .run_checked(&command, self.config.timeouts.acme)
                .await
        }
        .await;
        if let Err(err) = result {
            util::remove_file(&credentials, false)?;
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl AcmeClient for Certbot {
    async fn request(&self, certificate: &Certificate) -> Result<()> {
        match certificate.provider {
            CertificateProvider::LetsEncryptHttp => {
                let command = self.http_request_command(certificate)?;
                info!(
                    "Requesting certificate {} for {}",
                    certificate.id,
                    certificate.domain_names.join(", ")
                );
                self.runner
                    .run_checked(&command, self.config.timeouts.acme)
                    .await?;
                Ok(())
            }
            CertificateProvider::LetsEncryptDns => self.request_with_dns(certificate).await,
            other => Err(Error::InternalConsistency(format!(
                "certbot cannot issue {other} certificates"
            ))),
        }
    }

    async fn renew(&self, certificate: &Certificate) -> Result<()> {
        let command = self.renew_command(certificate)?;
        info!("Renewing certificate {}", certificate.id);
        self.runner
            .run_checked(&command, self.config.timeouts.acme)
            .await?;
        Ok(())
    }

    async fn revoke(&self, certificate: &Certificate) -> Result<()> {
        let command = self.revoke_command(certificate);
        info!("Revoking certificate {}", certificate.id);
        let result = self
            .runner
            .run_checked(&command, self.config.timeouts.acme)
            .await;
        // Credentials go regardless of the revoke outcome
        util::remove_file(self.credentials_path(certificate.id), false)?;
        if let Err(err) = &result {
            warn!("Revoking certificate {} failed: {err}", certificate.id);
        }
        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd_runner::CommandOutput;
    use crate::cmd_runner::testing::RecordingRunner;
    use tempfile::{TempDir, tempdir};

    fn certbot(runner: RecordingRunner) -> (TempDir, Certbot) {
        let dir = tempdir().unwrap();
        let mut config = Configuration::rooted_at(dir.path());
        config.certbot.config_file = None;
        config.certbot.pip = Some(PathBuf::from("pip"));
        let certbot = Certbot::new(Arc::new(runner), Arc::new(config));
        (dir, certbot)
    }

    fn letsencrypt(provider: CertificateProvider) -> Certificate {
        let mut certificate = Certificate::new(
            provider,
            vec!["a.example.com".into(), "b.example.com".into()],
        );
        certificate.id = 5;
        certificate.meta.letsencrypt_email = Some("ops@example.com".into());
        certificate.meta.letsencrypt_agree = true;
        certificate
    }

    fn dns(provider: &str) -> Certificate {
        let mut certificate = letsencrypt(CertificateProvider::LetsEncryptDns);
        certificate.meta.dns_provider = Some(provider.into());
        certificate.meta.dns_provider_credentials = Some("secret = 1".into());
        certificate.meta.propagation_seconds = Some(120);
        certificate
    }

    #[tokio::test]
    async fn test_http_request() {
        let runner = RecordingRunner::succeeding();
        let (_dir, certbot) = certbot(runner.clone());

        certbot
            .request(&letsencrypt(CertificateProvider::LetsEncryptHttp))
            .await
            .unwrap();

        assert_eq!(
            runner.command_lines(),
            vec![
                "certbot certonly --cert-name proxynaut-5 --agree-tos --authenticator webroot \
                 --email ops@example.com --preferred-challenges dns,http \
                 --domains a.example.com,b.example.com"
            ]
        );
    }

    #[test]
    fn test_config_file_and_staging() {
        let dir = tempdir().unwrap();
        let mut config = Configuration::rooted_at(dir.path());
        config.certbot.config_file = Some(PathBuf::from("/etc/letsencrypt.ini"));
        config.certbot.staging = true;
        let certbot = Certbot::new(Arc::new(RecordingRunner::succeeding()), Arc::new(config));

        let command = certbot
            .http_request_command(&letsencrypt(CertificateProvider::LetsEncryptHttp))
            .unwrap();

        let line = command.to_string();
        assert!(line.starts_with("certbot certonly --config /etc/letsencrypt.ini "), "{line}");
        assert!(line.ends_with(" --staging"), "{line}");
    }

    #[tokio::test]
    async fn test_missing_email_or_agreement() {
        let (_dir, certbot) = certbot(RecordingRunner::succeeding());
        let mut certificate = letsencrypt(CertificateProvider::LetsEncryptHttp);
        certificate.meta.letsencrypt_email = None;
        assert!(matches!(
            certbot.request(&certificate).await,
            Err(Error::Validation(_))
        ));

        let mut certificate = letsencrypt(CertificateProvider::LetsEncryptHttp);
        certificate.meta.letsencrypt_agree = false;
        assert!(matches!(
            certbot.request(&certificate).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_dns_request() {
        let runner = RecordingRunner::succeeding();
        let (dir, certbot) = certbot(runner.clone());

        certbot.request(&dns("cloudflare")).await.unwrap();

        let credentials = dir.path().join("letsencrypt/credentials/credentials-5");
        assert_eq!(std::fs::read_to_string(&credentials).unwrap(), "secret = 1");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&credentials).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        let lines = runner.command_lines();
        assert_eq!(
            lines[0],
            "pip install --no-cache-dir certbot-dns-cloudflare==1.8.0 cloudflare"
        );
        assert_eq!(
            lines[1],
            format!(
                "certbot certonly --cert-name proxynaut-5 --agree-tos --email ops@example.com \
                 --domains a.example.com,b.example.com --authenticator dns-cloudflare \
                 --dns-cloudflare-credentials {} --dns-cloudflare-propagation-seconds 120",
                credentials.display()
            )
        );

        // The plugin is only installed once
        certbot.request(&dns("cloudflare")).await.unwrap();
        assert_eq!(runner.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_route53_uses_environment() {
        let runner = RecordingRunner::succeeding();
        let (dir, certbot) = certbot(runner.clone());

        certbot.request(&dns("route53")).await.unwrap();

        let call = runner.calls().pop().unwrap();
        let credentials = dir.path().join("letsencrypt/credentials/credentials-5");
        assert_eq!(
            call.env,
            vec![("AWS_CONFIG_FILE".into(), credentials.into_os_string())]
        );
        assert!(!call.to_string().contains("-credentials"));
    }

    #[tokio::test]
    async fn test_unknown_dns_provider() {
        let runner = RecordingRunner::succeeding();
        let (_dir, certbot) = certbot(runner.clone());

        let err = certbot.request(&dns("carrier-pigeon")).await.unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("carrier-pigeon"));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_dns_request_removes_credentials() {
        let runner = RecordingRunner::new(|cmd| {
            if cmd.program_name() == "certbot" {
                Ok(CommandOutput::failed(1, "DNS problem: NXDOMAIN"))
            } else {
                Ok(CommandOutput::ok(""))
            }
        });
        let (dir, certbot) = certbot(runner);

        let err = certbot.request(&dns("cloudflare")).await.unwrap_err();

        assert!(err.to_string().contains("NXDOMAIN"));
        assert!(!dir.path().join("letsencrypt/credentials/credentials-5").exists());
    }

    #[test]
    fn test_renew_command() {
        let (_dir, certbot) = certbot(RecordingRunner::succeeding());

        let http = certbot
            .renew_command(&letsencrypt(CertificateProvider::LetsEncryptHttp))
            .unwrap();
        assert_eq!(
            http.to_string(),
            "certbot renew --force-renewal --cert-name proxynaut-5 --preferred-challenges dns,http \
             --no-random-sleep-on-renew --disable-hook-validation"
        );

        let dns = certbot.renew_command(&dns("cloudflare")).unwrap();
        assert_eq!(
            dns.to_string(),
            "certbot renew --force-renewal --cert-name proxynaut-5 \
             --no-random-sleep-on-renew --disable-hook-validation"
        );
    }

    #[tokio::test]
    async fn test_revoke_removes_credentials() {
        let runner = RecordingRunner::succeeding();
        let (dir, certbot) = certbot(runner.clone());
        let credentials = dir.path().join("letsencrypt/credentials/credentials-5");
        std::fs::create_dir_all(credentials.parent().unwrap()).unwrap();
        std::fs::write(&credentials, "secret").unwrap();

        certbot
            .revoke(&letsencrypt(CertificateProvider::LetsEncryptHttp))
            .await
            .unwrap();

        let fullchain = dir.path().join("letsencrypt/live/proxynaut-5/fullchain.pem");
        assert_eq!(
            runner.command_lines(),
            vec![format!(
                "certbot revoke --cert-path {} --delete-after-revoke",
                fullchain.display()
            )]
        );
        assert!(!credentials.exists());
    }
}
