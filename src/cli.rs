use crate::model::{Certificate, CertificateProvider, HostId, HostType};
use clap::{Args, ValueEnum};
use std::path::PathBuf;

/// A host addressed by type and id.
#[derive(Debug, Clone, Args)]
pub struct HostSelector {
    /// Host type, e.g. `proxy-host` or `stream`
    #[clap(value_parser = parse_host_type)]
    pub host_type: HostType,
    /// Host id (scoped per host type)
    pub id: HostId,
}

fn parse_host_type(input: &str) -> Result<HostType, String> {
    HostType::parse(input).map_err(|e| e.to_string())
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum CommandLineProvider {
    /// Let's Encrypt, HTTP-01 challenge through the shared webroot
    #[default]
    Http,
    /// Let's Encrypt, DNS-01 challenge through a certbot DNS plugin
    Dns,
    /// Locally trusted certificate from mkcert
    Mkcert,
    /// Placeholder for uploaded material
    Custom,
}

impl From<CommandLineProvider> for CertificateProvider {
    fn from(provider: CommandLineProvider) -> Self {
        match provider {
            CommandLineProvider::Http => CertificateProvider::LetsEncryptHttp,
            CommandLineProvider::Dns => CertificateProvider::LetsEncryptDns,
            CommandLineProvider::Mkcert => CertificateProvider::Mkcert,
            CommandLineProvider::Custom => CertificateProvider::Custom,
        }
    }
}

#[derive(Debug, Args, Default)]
pub struct IssueCommand {
    /// How to obtain the certificate
    #[clap(short, long, default_value = "http")]
    pub provider: CommandLineProvider,
    /// Domain names to include in the certificate
    #[clap(short, long, value_delimiter = ',', num_args = 1.., required = true)]
    pub domains: Vec<String>,
    /// The display name of the new certificate
    #[clap(long)]
    pub name: Option<String>,
    /// Contact address registered with Let's Encrypt
    #[clap(short, long)]
    pub email: Option<String>,
    /// Agree to the Let's Encrypt terms of service
    #[clap(long, action)]
    pub agree_tos: bool,
    /// DNS plugin id, e.g. `cloudflare` (DNS provider only)
    #[clap(long)]
    pub dns_provider: Option<String>,
    /// File holding the DNS plugin credentials (DNS provider only)
    #[clap(long)]
    pub credentials_file: Option<PathBuf>,
    /// Seconds to wait for DNS propagation (DNS provider only)
    #[clap(long)]
    pub propagation_seconds: Option<u32>,
}

impl IssueCommand {
    pub fn into_certificate(self) -> std::io::Result<Certificate> {
        let mut certificate = Certificate::new(self.provider.into(), self.domains);
        certificate.nice_name = self.name.unwrap_or_default();
        certificate.meta.letsencrypt_email = self.email;
        certificate.meta.letsencrypt_agree = self.agree_tos;
        certificate.meta.dns_provider = self.dns_provider;
        certificate.meta.propagation_seconds = self.propagation_seconds;
        if let Some(file) = self.credentials_file {
            certificate.meta.dns_provider_credentials = Some(std::fs::read_to_string(file)?);
        }
        Ok(certificate)
    }
}
