use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use strum::{Display, EnumString};
use time::OffsetDateTime;

pub type CertificateId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
pub enum CertificateProvider {
    #[serde(rename = "letsencrypt-http")]
    #[strum(serialize = "letsencrypt-http")]
    LetsEncryptHttp,
    #[serde(rename = "letsencrypt-dns")]
    #[strum(serialize = "letsencrypt-dns")]
    LetsEncryptDns,
    /// Operator-uploaded material.
    #[serde(rename = "other", alias = "custom")]
    #[strum(to_string = "other", serialize = "custom")]
    Custom,
    #[serde(rename = "mkcert")]
    #[strum(serialize = "mkcert")]
    Mkcert,
}

impl CertificateProvider {
    pub fn is_acme(self) -> bool {
        matches!(
            self,
            CertificateProvider::LetsEncryptHttp | CertificateProvider::LetsEncryptDns
        )
    }

    /// Whether the material is produced by a tool this crate drives, and can therefore be renewed.
    pub fn is_renewable(self) -> bool {
        self.is_acme() || self == CertificateProvider::Mkcert
    }
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub letsencrypt_email: Option<String>,
    #[serde(default)]
    pub letsencrypt_agree: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_provider_credentials: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub propagation_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediate_certificate: Option<String>,
}

impl Debug for CertificateMeta {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateMeta")
            .field("letsencrypt_email", &self.letsencrypt_email)
            .field("letsencrypt_agree", &self.letsencrypt_agree)
            .field("dns_provider", &self.dns_provider)
            .field(
                "dns_provider_credentials",
                &self.dns_provider_credentials.as_ref().map(|_| "<redacted>"),
            )
            .field("propagation_seconds", &self.propagation_seconds)
            .field("certificate", &self.certificate.is_some())
            .field("certificate_key", &self.certificate_key.as_ref().map(|_| "<redacted>"))
            .field(
                "intermediate_certificate",
                &self.intermediate_certificate.is_some(),
            )
            .finish()
    }
}

/// What callers get to see of [`CertificateMeta`]: stored PEM material collapses to a flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskedCertificateMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub letsencrypt_email: Option<String>,
    pub letsencrypt_agree: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub propagation_seconds: Option<u32>,
    pub certificate: bool,
    pub certificate_key: bool,
    pub intermediate_certificate: bool,
}

impl CertificateMeta {
    pub fn masked(&self) -> MaskedCertificateMeta {
        MaskedCertificateMeta {
            letsencrypt_email: self.letsencrypt_email.clone(),
            letsencrypt_agree: self.letsencrypt_agree,
            dns_provider: self.dns_provider.clone(),
            propagation_seconds: self.propagation_seconds,
            certificate: present(&self.certificate),
            certificate_key: present(&self.certificate_key),
            intermediate_certificate: present(&self.intermediate_certificate),
        }
    }
}

fn present(value: &Option<String>) -> bool {
    value.as_ref().is_some_and(|v| !v.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    #[serde(default)]
    pub id: CertificateId,
    #[serde(default)]
    pub owner_user_id: i64,
    #[serde(default)]
    pub is_deleted: bool,
    pub provider: CertificateProvider,
    #[serde(default)]
    pub nice_name: String,
    pub domain_names: Vec<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_on: Option<OffsetDateTime>,
    #[serde(default)]
    pub meta: CertificateMeta,
}

impl Certificate {
    pub fn new(provider: CertificateProvider, domain_names: Vec<String>) -> Self {
        Self {
            id: 0,
            owner_user_id: 0,
            is_deleted: false,
            provider,
            nice_name: String::new(),
            domain_names,
            expires_on: None,
            meta: CertificateMeta::default(),
        }
    }

    pub fn public_view(&self) -> CertificateView {
        CertificateView {
            id: self.id,
            owner_user_id: self.owner_user_id,
            provider: self.provider,
            nice_name: self.nice_name.clone(),
            domain_names: self.domain_names.clone(),
            expires_on: self.expires_on,
            meta: self.meta.masked(),
        }
    }

    pub fn expires_within(&self, now: OffsetDateTime, window: time::Duration) -> bool {
        match self.expires_on {
            Some(expires_on) => expires_on - now <= window,
            None => true,
        }
    }
}

/// Settings of a certificate that may change after creation. `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateUpdate {
    pub id: CertificateId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nice_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub letsencrypt_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub propagation_seconds: Option<u32>,
}

impl CertificateUpdate {
    pub fn apply_to(&self, certificate: &mut Certificate) {
        if let Some(name) = &self.nice_name {
            certificate.nice_name = name.trim().to_string();
        }
        if let Some(email) = &self.letsencrypt_email {
            certificate.meta.letsencrypt_email = Some(email.clone());
        }
        if let Some(seconds) = self.propagation_seconds {
            certificate.meta.propagation_seconds = Some(seconds);
        }
    }
}

/// The caller-facing form of a [`Certificate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateView {
    pub id: CertificateId,
    pub owner_user_id: i64,
    pub provider: CertificateProvider,
    pub nice_name: String,
    pub domain_names: Vec<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_on: Option<OffsetDateTime>,
    pub meta: MaskedCertificateMeta,
}
