use crate::error::Result;
use crate::model::Certificate;
use async_trait::async_trait;

mod certbot;
pub mod dns_plugins;

pub use certbot::Certbot;
pub use dns_plugins::DnsPlugin;

/// The external ACME client. Implementations leave `fullchain.pem` and `privkey.pem` in the
/// certificate's live directory (see [`crate::config::Configuration::certificate_directory`]).
#[async_trait]
pub trait AcmeClient: Send + Sync {
    /// Obtains a new certificate, using the HTTP-01 or DNS-01 flow depending on the provider.
    async fn request(&self, certificate: &Certificate) -> Result<()>;

    /// Forces renewal of an existing certificate.
    async fn renew(&self, certificate: &Certificate) -> Result<()>;

    /// Revokes the certificate and deletes its material, including stored DNS credentials.
    async fn revoke(&self, certificate: &Certificate) -> Result<()>;
}
