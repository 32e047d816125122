use crate::error::{Error, IoContext, Result};
use crate::util;
use async_trait::async_trait;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

const CHALLENGE_PATH: &str = ".well-known/acme-challenge";
const TEST_FILE_PREFIX: &str = "test-challenge-";
const TEST_CONTENT: &str = "Success";
const USER_AGENT: &str = concat!(
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
    " ( +",
    env!("CARGO_PKG_REPOSITORY"),
    " )"
);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of probing one domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeOutcome {
    Ok,
    WrongData,
    NotFound,
    NoHost,
    Failed,
    Other(u16),
}

impl Display for ChallengeOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ChallengeOutcome::Ok => f.write_str("ok"),
            ChallengeOutcome::WrongData => f.write_str("wrong-data"),
            ChallengeOutcome::NotFound => f.write_str("404"),
            ChallengeOutcome::NoHost => f.write_str("no-host"),
            ChallengeOutcome::Failed => f.write_str("failed"),
            ChallengeOutcome::Other(code) => write!(f, "other:{code}"),
        }
    }
}

impl Serialize for ChallengeOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[async_trait]
pub trait NameResolver: Send + Sync {
    /// Addresses for `host`; an error string if the name does not resolve.
    async fn resolve(&self, host: &str) -> std::result::Result<Vec<IpAddr>, String>;
}

/// Resolves through the system configuration, falling back to public resolvers.
pub struct SystemResolver {
    resolver: hickory_resolver::Resolver<TokioConnectionProvider>,
}

impl SystemResolver {
    pub fn new() -> Self {
        let resolver = hickory_resolver::Resolver::builder_tokio()
            .unwrap_or_else(|e| {
                warn!("Failed to create DNS resolver using system configuration, using default servers instead: {e:#}");
                hickory_resolver::Resolver::builder_with_config(
                    ResolverConfig::cloudflare(),
                    TokioConnectionProvider::default(),
                )
            })
            .build();
        Self { resolver }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NameResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> std::result::Result<Vec<IpAddr>, String> {
        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| e.to_string())?;
        Ok(lookup.iter().collect())
    }
}

/// Checks from this machine whether each domain serves our ACME webroot over plain HTTP, the way
/// the CA will when validating an HTTP-01 challenge.
pub struct HttpChallengeChecker {
    webroot: PathBuf,
    resolver: Arc<dyn NameResolver>,
    client: reqwest::Client,
    port: u16,
}

impl HttpChallengeChecker {
    pub fn new(webroot: PathBuf, resolver: Arc<dyn NameResolver>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::configuration(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            webroot,
            resolver,
            client,
            port: 80,
        })
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Checks every domain concurrently. Each call serves its own uniquely named file, so
    /// overlapping checks do not interfere.
    pub async fn check(&self, domains: &[String]) -> Result<BTreeMap<String, ChallengeOutcome>> {
        if domains.is_empty() {
            return Err(Error::validation("No domains provided"));
        }
        let test_file = TestFile::create(&self.webroot.join(CHALLENGE_PATH))?;
        let name = test_file.name();
        let outcomes = futures::future::join_all(domains.iter().map(|domain| async move {
            (domain.clone(), self.check_domain(domain, name).await)
        }))
        .await;
        Ok(outcomes.into_iter().collect())
    }

    /// The test file `name` on `address` directly; the domain travels in the `Host` header.
    fn test_url(&self, address: IpAddr, name: &str) -> std::result::Result<Url, url::ParseError> {
        let authority = SocketAddr::new(address, self.port);
        Url::parse(&format!("http://{authority}/"))?.join(&format!("{CHALLENGE_PATH}/{name}"))
    }

    async fn check_domain(&self, domain: &str, name: &str) -> ChallengeOutcome {
        info!("Testing HTTP challenge for {domain}");
        let address = match domain.parse::<IpAddr>() {
            Ok(address) => address,
            Err(_) => match self.resolver.resolve(domain).await {
                Ok(addresses) if !addresses.is_empty() => addresses[0],
                Ok(_) => {
                    info!("HTTP challenge test for {domain}: no addresses");
                    return ChallengeOutcome::NoHost;
                }
                Err(e) => {
                    info!("HTTP challenge test for {domain}: host not found ({e})");
                    return ChallengeOutcome::NoHost;
                }
            },
        };
        let url = match self.test_url(address, name) {
            Ok(url) => url,
            Err(e) => {
                warn!("Cannot build test URL for {domain} at {address}: {e}");
                return ChallengeOutcome::Failed;
            }
        };
        let response = match self
            .client
            .get(url)
            .header(reqwest::header::HOST, domain)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Failed to test HTTP challenge for {domain}: {e}");
                return ChallengeOutcome::Failed;
            }
        };
        let status = response.status();
        match status.as_u16() {
            200 => match response.text().await {
                Ok(body) if body.trim() == TEST_CONTENT => ChallengeOutcome::Ok,
                Ok(body) => {
                    info!("HTTP challenge test for {domain} returned unexpected data: {body:.64}");
                    ChallengeOutcome::WrongData
                }
                Err(e) => {
                    warn!("Failed to read HTTP challenge response for {domain}: {e}");
                    ChallengeOutcome::Failed
                }
            },
            404 => ChallengeOutcome::NotFound,
            code => {
                info!("HTTP challenge test for {domain} returned status {code}");
                ChallengeOutcome::Other(code)
            }
        }
    }
}

/// A uniquely named file holding [`TEST_CONTENT`], removed again on drop.
struct TestFile {
    file: tempfile::NamedTempFile,
}

impl TestFile {
    fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).with_path(dir)?;
        let mut file = tempfile::Builder::new()
            .prefix(TEST_FILE_PREFIX)
            .rand_bytes(16)
            .tempfile_in(dir)
            .with_path(dir)?;
        file.write_all(TEST_CONTENT.as_bytes())
            .with_path(file.path().to_path_buf())?;
        // nginx serves it, possibly as another user
        util::set_mode(file.path(), 0o644)?;
        Ok(Self { file })
    }

    fn name(&self) -> &str {
        self.file
            .path()
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(TEST_FILE_PREFIX)
    }
}
