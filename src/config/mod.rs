use crate::config::default::DefaultConfig;
use crate::config::toml::TomlConfiguration;
use crate::model::{CertificateId, CertificateProvider};
use crate::time::human_duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod default;
mod toml;

pub const CONFIG_FILE_NAME: &str = "proxynaut.toml";

pub fn get_default_config_directory() -> PathBuf {
    PathBuf::from("/data/proxynaut")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Configuration {
    pub nginx: NginxConfiguration,
    pub openssl: OpensslConfiguration,
    pub certbot: CertbotConfiguration,
    pub mkcert: MkcertConfiguration,
    pub storage: StorageConfiguration,
    pub renewal: RenewalConfiguration,
    pub timeouts: TimeoutConfiguration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NginxConfiguration {
    pub binary: PathBuf,
    /// Root of the generated configuration tree (`{root}/{host_type}/{id}.conf`).
    pub config_root: PathBuf,
    pub template_dir: PathBuf,
    /// Where rendered hosts write their access and error logs.
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpensslConfiguration {
    pub binary: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CertbotConfiguration {
    pub binary: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    pub live_dir: PathBuf,
    pub credentials_dir: PathBuf,
    /// If set, DNS plugins are installed through this pip binary before first use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pip: Option<PathBuf>,
    #[serde(default)]
    pub staging: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MkcertConfiguration {
    pub binary: PathBuf,
    pub ca_root: PathBuf,
    pub cert_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfiguration {
    pub custom_ssl_dir: PathBuf,
    /// Webroot nginx serves `/.well-known/acme-challenge/` from.
    pub challenge_webroot: PathBuf,
    /// Directory for transient key/certificate files handed to openssl and for certificate
    /// downloads. System default if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
    /// Directory holding htpasswd files for access lists.
    pub access_dir: PathBuf,
    pub state_file: PathBuf,
    /// Prefix of per-certificate names and directories (`{prefix}{id}`).
    pub certificate_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenewalConfiguration {
    #[serde(with = "human_duration")]
    pub interval: Duration,
    /// Certificates expiring within this window are renewed by the sweep.
    #[serde(with = "human_duration")]
    pub window: Duration,
    /// Pause between publishing the HTTP-01 request config and asking the CA to validate.
    #[serde(with = "human_duration")]
    pub challenge_settle_delay: Duration,
    /// Upper bound of the random delay before the first sweep after startup.
    #[serde(with = "human_duration")]
    pub startup_jitter: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutConfiguration {
    #[serde(with = "human_duration")]
    pub command: Duration,
    #[serde(with = "human_duration")]
    pub key_check: Duration,
    #[serde(with = "human_duration")]
    pub acme: Duration,
}

impl Default for Configuration {
    fn default() -> Self {
        DefaultConfig::default().get_config()
    }
}

impl Configuration {
    /// A configuration whose every path lives under `root`, for tests and throwaway setups.
    pub fn rooted_at<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        let mut config = Self::default();
        config.nginx.config_root = root.join("nginx");
        config.nginx.log_dir = root.join("logs");
        config.certbot.live_dir = root.join("letsencrypt/live");
        config.certbot.credentials_dir = root.join("letsencrypt/credentials");
        config.mkcert.ca_root = root.join("mkcert_ca");
        config.mkcert.cert_dir = root.join("mkcert_ssl");
        config.storage.custom_ssl_dir = root.join("custom_ssl");
        config.storage.challenge_webroot = root.join("letsencrypt-acme-challenge");
        config.storage.access_dir = root.join("access");
        config.storage.state_file = root.join("state.json");
        config.storage.temp_dir = Some(root.join("tmp"));
        config.renewal.challenge_settle_delay = Duration::ZERO;
        config.renewal.startup_jitter = Duration::ZERO;
        config
    }

    /// `{prefix}{id}`, the name certbot, mkcert and the custom store all know a certificate by.
    pub fn temp_directory(&self) -> PathBuf {
        self.storage
            .temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    pub fn certificate_name(&self, id: CertificateId) -> String {
        format!("{}{id}", self.storage.certificate_prefix)
    }

    /// Directory holding `fullchain.pem` and `privkey.pem` of a certificate.
    pub fn certificate_directory(&self, provider: CertificateProvider, id: CertificateId) -> PathBuf {
        let base = match provider {
            CertificateProvider::LetsEncryptHttp | CertificateProvider::LetsEncryptDns => {
                &self.certbot.live_dir
            }
            CertificateProvider::Custom => &self.storage.custom_ssl_dir,
            CertificateProvider::Mkcert => &self.mkcert.cert_dir,
        };
        base.join(self.certificate_name(id))
    }

    pub fn fullchain_path(&self, provider: CertificateProvider, id: CertificateId) -> PathBuf {
        self.certificate_directory(provider, id).join("fullchain.pem")
    }

    pub fn private_key_path(&self, provider: CertificateProvider, id: CertificateId) -> PathBuf {
        self.certificate_directory(provider, id).join("privkey.pem")
    }
}

pub trait ConfigBackend {
    fn load<P: AsRef<Path>>(file: P) -> Result<Configuration, anyhow::Error>;
    fn save<P: AsRef<Path>>(config: &Configuration, file: P) -> Result<(), anyhow::Error>;
}

pub fn load<P: AsRef<Path>>(file: P) -> Result<Configuration, anyhow::Error> {
    if file.as_ref().exists() {
        TomlConfiguration::load(file)
    } else {
        let default = DefaultConfig::load(&file)?;
        TomlConfiguration::save(&default, &file)?;
        Ok(default)
    }
}

pub fn save<P: AsRef<Path>>(config: &Configuration, file: P) -> Result<(), anyhow::Error> {
    TomlConfiguration::save(config, file)
}
