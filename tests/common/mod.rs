#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use proxynaut::Proxynaut;
use proxynaut::challenge::NameResolver;
use proxynaut::cmd_runner::{CommandOutput, CommandRunner, CommandSpec};
use proxynaut::config::Configuration;
use proxynaut::error::Result;
use proxynaut::model::host::{ForwardScheme, ProxyHost};
use proxynaut::model::{Certificate, CertificateProvider, Host, HostVariant};
use proxynaut::state::MemoryStore;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{TempDir, tempdir};

pub const NOT_AFTER: &str = "Jan  1 00:00:00 2099 GMT";

type Failure = dyn Fn(&CommandSpec) -> Option<String> + Send + Sync;

/// Stands in for nginx, openssl, certbot and mkcert. Records every invocation, optionally
/// sleeps in each, and fails the invocations `fail_when` picks.
#[derive(Clone, Default)]
pub struct StubTools {
    calls: Arc<Mutex<Vec<String>>>,
    delay: Duration,
    fail_when: Option<Arc<Failure>>,
}

impl StubTools {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CommandSpec) -> Option<String> + Send + Sync + 'static,
    {
        self.fail_when = Some(Arc::new(predicate));
        self
    }

    /// Invocations as `program arg arg ...`, program reduced to its file name.
    pub fn lines(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn lines_of(&self, program: &str) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|line| line.split(' ').next() == Some(program))
            .collect()
    }

    fn respond(command: &CommandSpec) -> String {
        let args: Vec<String> = command
            .args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let has = |flag: &str| args.iter().any(|a| a == flag);
        match command.program_name().as_str() {
            "openssl" if has("-subject") => "subject=CN = a.example.com\n".to_string(),
            "openssl" if has("-issuer") => "issuer=C = US, O = Let's Encrypt, CN = R3\n".to_string(),
            "openssl" if has("-dates") => {
                format!("notBefore=Jan  1 00:00:00 2020 GMT\nnotAfter={NOT_AFTER}\n")
            }
            "openssl" => "Key is valid\n".to_string(),
            _ => String::new(),
        }
    }
}

#[async_trait]
impl CommandRunner for StubTools {
    async fn run(&self, command: &CommandSpec, _timeout: Duration) -> Result<CommandOutput> {
        let line = std::iter::once(command.program_name())
            .chain(command.args.iter().map(|a| a.to_string_lossy().into_owned()))
            .collect::<Vec<_>>()
            .join(" ");
        self.calls.lock().push(line);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(message) = self.fail_when.as_ref().and_then(|f| f(command)) {
            return Ok(CommandOutput::failed(1, message));
        }
        if command.program_name() == "mkcert" {
            write_mkcert_outputs(command);
        }
        Ok(CommandOutput::ok(Self::respond(command)))
    }
}

/// mkcert writes the files named after `-cert-file` and `-key-file`.
fn write_mkcert_outputs(command: &CommandSpec) {
    for pair in command.args.windows(2) {
        if pair[0] == "-cert-file" || pair[0] == "-key-file" {
            std::fs::write(&pair[1], "-----BEGIN STUB-----\n").unwrap();
        }
    }
}

/// Every name resolves to localhost.
pub struct LocalResolver;

#[async_trait]
impl NameResolver for LocalResolver {
    async fn resolve(&self, _host: &str) -> std::result::Result<Vec<IpAddr>, String> {
        Ok(vec![IpAddr::from([127, 0, 0, 1])])
    }
}

pub fn test_config(root: &Path) -> Configuration {
    let mut config = Configuration::rooted_at(root);
    config.nginx.template_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("templates");
    config.certbot.config_file = None;
    config
}

pub struct TestSetup {
    pub dir: TempDir,
    pub tools: StubTools,
    pub client: Proxynaut,
}

impl TestSetup {
    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    pub fn read(&self, relative: &str) -> String {
        std::fs::read_to_string(self.path(relative)).unwrap()
    }
}

pub fn setup(tools: StubTools) -> TestSetup {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let store = Arc::new(MemoryStore::open(&config.storage.state_file).unwrap());
    let client = Proxynaut::with_parts(
        config,
        store,
        Arc::new(tools.clone()),
        Arc::new(LocalResolver),
    )
    .unwrap();
    TestSetup { dir, tools, client }
}

pub fn proxy_host(domain: &str) -> Host {
    Host::new(HostVariant::ProxyHost(ProxyHost {
        domain_names: vec![domain.to_string()],
        forward_scheme: ForwardScheme::Http,
        forward_host: "10.0.0.5".to_string(),
        forward_port: 8080,
        allow_websocket_upgrade: true,
        caching_enabled: false,
        block_exploits: true,
        locations: Vec::new(),
    }))
}

pub fn http_certificate(domains: &[&str]) -> Certificate {
    let mut certificate = Certificate::new(
        CertificateProvider::LetsEncryptHttp,
        domains.iter().map(|d| d.to_string()).collect(),
    );
    certificate.meta.letsencrypt_email = Some("ops@example.com".to_string());
    certificate.meta.letsencrypt_agree = true;
    certificate
}
