use crate::config::{
    CertbotConfiguration, ConfigBackend, Configuration, MkcertConfiguration, NginxConfiguration,
    OpensslConfiguration, RenewalConfiguration, StorageConfiguration, TimeoutConfiguration,
};
use anyhow::Error;
use std::path::{Path, PathBuf};
use std::time::Duration;

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

#[derive(Debug, Clone, Default)]
pub struct DefaultConfig {}

impl DefaultConfig {
    pub fn get_config(&self) -> Configuration {
        Configuration {
            nginx: NginxConfiguration {
                binary: PathBuf::from("/usr/sbin/nginx"),
                config_root: PathBuf::from("/data/nginx"),
                template_dir: PathBuf::from("/app/templates"),
                log_dir: PathBuf::from("/data/logs"),
            },
            openssl: OpensslConfiguration {
                binary: PathBuf::from("openssl"),
            },
            certbot: CertbotConfiguration {
                binary: PathBuf::from("certbot"),
                config_file: Some(PathBuf::from("/etc/letsencrypt.ini")),
                live_dir: PathBuf::from("/etc/letsencrypt/live"),
                credentials_dir: PathBuf::from("/etc/letsencrypt/credentials"),
                pip: None,
                staging: false,
            },
            mkcert: MkcertConfiguration {
                binary: PathBuf::from("/usr/local/bin/mkcert"),
                ca_root: PathBuf::from("/data/mkcert_ca"),
                cert_dir: PathBuf::from("/data/mkcert_ssl"),
            },
            storage: StorageConfiguration {
                custom_ssl_dir: PathBuf::from("/data/custom_ssl"),
                challenge_webroot: PathBuf::from("/data/letsencrypt-acme-challenge"),
                temp_dir: None,
                access_dir: PathBuf::from("/data/access"),
                state_file: PathBuf::from("/data/proxynaut/state.json"),
                certificate_prefix: "proxynaut-".to_string(),
            },
            renewal: RenewalConfiguration {
                interval: Duration::from_secs(12 * HOUR),
                window: Duration::from_secs(30 * DAY),
                challenge_settle_delay: Duration::from_secs(5),
                startup_jitter: Duration::from_secs(60),
            },
            timeouts: TimeoutConfiguration {
                command: Duration::from_secs(60),
                key_check: Duration::from_secs(10),
                acme: Duration::from_secs(10 * 60),
            },
        }
    }
}

impl ConfigBackend for DefaultConfig {
    fn load<P: AsRef<Path>>(_file: P) -> Result<Configuration, Error> {
        Ok(Self::default().get_config())
    }

    fn save<P: AsRef<Path>>(_config: &Configuration, _file: P) -> Result<(), Error> {
        unimplemented!("default backend cannot save to file")
    }
}
