use crate::error::{Error, Result};
use crate::model::certificate::{Certificate, CertificateId};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

pub type HostId = i64;

/// The on-disk and template name of each kind of host.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HostType {
    ProxyHost,
    RedirectionHost,
    DeadHost,
    Stream,
    SslPassthroughHost,
    /// The catch-all site nginx serves for unknown names.
    Default,
}

impl HostType {
    /// Parses a host type, accepting both `proxy-host` and `proxy_host` spellings.
    pub fn parse(input: &str) -> Result<Self> {
        let normalized = input.trim().replace('-', "_");
        HostType::from_str(&normalized)
            .map_err(|_| Error::validation(format!("Unknown host type '{input}'")))
    }

    pub fn as_str(self) -> &'static str {
        self.into()
    }

    pub fn template_name(self) -> String {
        format!("{}.conf", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardScheme {
    #[default]
    Http,
    Https,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedirectScheme {
    /// Keep whatever scheme the client used.
    #[default]
    Auto,
    Http,
    Https,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub path: String,
    #[serde(default)]
    pub forward_scheme: ForwardScheme,
    pub forward_host: String,
    pub forward_port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub forward_path: String,
    #[serde(default)]
    pub advanced_config: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyHost {
    pub domain_names: Vec<String>,
    #[serde(default)]
    pub forward_scheme: ForwardScheme,
    pub forward_host: String,
    pub forward_port: u16,
    #[serde(default)]
    pub allow_websocket_upgrade: bool,
    #[serde(default)]
    pub caching_enabled: bool,
    #[serde(default)]
    pub block_exploits: bool,
    #[serde(default)]
    pub locations: Vec<Location>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectionHost {
    pub domain_names: Vec<String>,
    #[serde(default = "default_redirect_code")]
    pub forward_http_code: u16,
    #[serde(default)]
    pub forward_scheme: RedirectScheme,
    pub forward_domain_name: String,
    #[serde(default)]
    pub preserve_path: bool,
    #[serde(default)]
    pub block_exploits: bool,
}

fn default_redirect_code() -> u16 {
    301
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadHost {
    pub domain_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
    pub incoming_port: u16,
    pub forwarding_host: String,
    pub forwarding_port: u16,
    #[serde(default = "default_true")]
    pub tcp_forwarding: bool,
    #[serde(default)]
    pub udp_forwarding: bool,
    #[serde(default)]
    pub proxy_protocol: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SslPassthroughHost {
    pub domain_name: String,
    pub forwarding_host: String,
    pub forwarding_port: u16,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "host_type", rename_all = "snake_case")]
pub enum HostVariant {
    ProxyHost(ProxyHost),
    RedirectionHost(RedirectionHost),
    DeadHost(DeadHost),
    Stream(Stream),
    SslPassthroughHost(SslPassthroughHost),
}

impl HostVariant {
    pub fn host_type(&self) -> HostType {
        match self {
            HostVariant::ProxyHost(_) => HostType::ProxyHost,
            HostVariant::RedirectionHost(_) => HostType::RedirectionHost,
            HostVariant::DeadHost(_) => HostType::DeadHost,
            HostVariant::Stream(_) => HostType::Stream,
            HostVariant::SslPassthroughHost(_) => HostType::SslPassthroughHost,
        }
    }

    pub fn domain_names(&self) -> Vec<&str> {
        match self {
            HostVariant::ProxyHost(h) => h.domain_names.iter().map(String::as_str).collect(),
            HostVariant::RedirectionHost(h) => h.domain_names.iter().map(String::as_str).collect(),
            HostVariant::DeadHost(h) => h.domain_names.iter().map(String::as_str).collect(),
            HostVariant::Stream(_) => Vec::new(),
            HostVariant::SslPassthroughHost(h) => vec![h.domain_name.as_str()],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SslSettings {
    pub ssl_forced: bool,
    pub http2_support: bool,
    pub hsts_enabled: bool,
    pub hsts_subdomains: bool,
}

/// Result of the last apply, as recorded by [`crate::nginx::Nginx::configure`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nginx_online: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nginx_err: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessDirective {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessListClient {
    pub address: String,
    pub directive: AccessDirective,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessListAuth {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessList {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub satisfy_any: bool,
    #[serde(default)]
    pub pass_auth: bool,
    #[serde(default)]
    pub items: Vec<AccessListAuth>,
    #[serde(default)]
    pub clients: Vec<AccessListClient>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    #[serde(default)]
    pub id: HostId,
    #[serde(default)]
    pub owner_user_id: i64,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 0 means no certificate.
    #[serde(default)]
    pub certificate_id: CertificateId,
    #[serde(flatten)]
    pub ssl: SslSettings,
    #[serde(default)]
    pub advanced_config: String,
    #[serde(default)]
    pub meta: HostMeta,
    /// Eagerly attached by the caller before rendering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<Certificate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_list: Option<AccessList>,
    #[serde(flatten)]
    pub variant: HostVariant,
}

impl Host {
    pub fn new(variant: HostVariant) -> Self {
        Self {
            id: 0,
            owner_user_id: 0,
            is_deleted: false,
            enabled: true,
            certificate_id: 0,
            ssl: SslSettings::default(),
            advanced_config: String::new(),
            meta: HostMeta::default(),
            certificate: None,
            access_list: None,
            variant,
        }
    }

    pub fn host_type(&self) -> HostType {
        self.variant.host_type()
    }

    pub fn domain_names(&self) -> Vec<&str> {
        self.variant.domain_names()
    }

    pub fn is_active(&self) -> bool {
        self.enabled && !self.is_deleted
    }

    pub fn has_certificate(&self) -> bool {
        self.certificate_id != 0
    }

    /// Keeps the TLS flags consistent: no certificate means no forced TLS or HTTP/2, no forced TLS
    /// means no HSTS, and no HSTS means no HSTS for subdomains.
    pub fn normalize_ssl(&mut self) {
        if !self.has_certificate() {
            self.ssl.ssl_forced = false;
            self.ssl.http2_support = false;
        }
        if !self.ssl.ssl_forced {
            self.ssl.hsts_enabled = false;
        }
        if !self.ssl.hsts_enabled {
            self.ssl.hsts_subdomains = false;
        }
    }

    /// Drops the certificate reference and everything that depends on it.
    pub fn detach_certificate(&mut self) {
        self.certificate_id = 0;
        self.certificate = None;
        self.normalize_ssl();
    }
}

/// Whether `hostname` is used by any enabled, non-deleted host other than `ignore`.
pub fn is_hostname_taken<'a, I>(hosts: I, hostname: &str, ignore: Option<(HostType, HostId)>) -> bool
where
    I: IntoIterator<Item = &'a Host>,
{
    hosts.into_iter().any(|host| {
        host.is_active()
            && ignore != Some((host.host_type(), host.id))
            && host
                .domain_names()
                .iter()
                .any(|existing| existing.eq_ignore_ascii_case(hostname))
    })
}

/// Rejects `candidate` if any of its domain names is already served by another host. When the
/// candidate is being updated (non-zero id), its own stored record is ignored.
pub fn ensure_hostnames_available(hosts: &[Host], candidate: &Host) -> Result<()> {
    let ignore = (candidate.id != 0).then(|| (candidate.host_type(), candidate.id));
    for hostname in candidate.domain_names() {
        if is_hostname_taken(hosts, hostname, ignore) {
            return Err(Error::validation(format!("{hostname} is already in use")));
        }
    }
    Ok(())
}

/// All non-deleted hosts that serve at least one of `domain_names`.
pub fn hosts_with_domains<'a>(hosts: &'a [Host], domain_names: &[String]) -> Vec<&'a Host> {
    hosts
        .iter()
        .filter(|host| !host.is_deleted)
        .filter(|host| {
            host.domain_names().iter().any(|existing| {
                domain_names
                    .iter()
                    .any(|wanted| wanted.eq_ignore_ascii_case(existing))
            })
        })
        .collect()
}
