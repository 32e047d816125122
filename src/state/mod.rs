use crate::error::{Error, Result};
use crate::model::{Certificate, CertificateId, Host, HostId, HostType};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

mod lock;

pub type SweepLock = lock::SweepLock;

/// Persistence collaborator. Host ids are scoped per [`HostType`]; certificate ids are global.
/// Saving a record with id 0 assigns the next free id.
#[async_trait]
pub trait Store: Send + Sync {
    async fn hosts(&self) -> Result<Vec<Host>>;
    async fn host(&self, host_type: HostType, id: HostId) -> Result<Option<Host>>;
    async fn save_host(&self, host: Host) -> Result<Host>;
    async fn certificates(&self) -> Result<Vec<Certificate>>;
    async fn certificate(&self, id: CertificateId) -> Result<Option<Certificate>>;
    async fn save_certificate(&self, certificate: Certificate) -> Result<Certificate>;
    /// Removes the record outright. Only used to roll back a creation that never completed.
    async fn purge_certificate(&self, id: CertificateId) -> Result<bool>;

    /// Non-deleted hosts referencing `certificate_id`.
    async fn hosts_using_certificate(&self, certificate_id: CertificateId) -> Result<Vec<Host>> {
        Ok(self
            .hosts()
            .await?
            .into_iter()
            .filter(|host| !host.is_deleted && host.certificate_id == certificate_id)
            .collect())
    }

    /// Attaches the host's certificate, unless it is missing or deleted.
    async fn with_relations(&self, mut host: Host) -> Result<Host> {
        host.certificate = match host.certificate_id {
            0 => None,
            id => self.certificate(id).await?.filter(|c| !c.is_deleted),
        };
        Ok(host)
    }

    /// Like [`Store::certificate`], but a missing or deleted certificate is [`Error::NotFound`].
    async fn existing_certificate(&self, id: CertificateId) -> Result<Certificate> {
        match self.certificate(id).await? {
            Some(certificate) if !certificate.is_deleted => Ok(certificate),
            _ => Err(Error::not_found(id)),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    hosts: Vec<Host>,
    #[serde(default)]
    certificates: Vec<Certificate>,
}

/// Store keeping everything in memory, optionally mirrored to a JSON file after every write.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<StoreData>,
    file: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens (or starts) a store persisted at `file`.
    pub fn open<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref().to_path_buf();
        let data = match std::fs::read_to_string(&file) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                Error::configuration(format!("state file {} is corrupt: {e}", file.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => return Err(Error::io(&file, e)),
        };
        debug!("Opened state file {}", file.display());
        Ok(Self {
            data: RwLock::new(data),
            file: Some(file),
        })
    }

    fn persist(&self, data: &StoreData) -> Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(data)
            .map_err(|e| Error::InternalConsistency(format!("state not serializable: {e}")))?;
        // Holds uploaded keys and DNS credentials
        crate::util::write_atomic_with_mode(file, &json, 0o600)
    }

    pub fn directory(&self) -> Option<&Path> {
        self.file.as_deref().and_then(Path::parent)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn hosts(&self) -> Result<Vec<Host>> {
        Ok(self.data.read().hosts.clone())
    }

    async fn host(&self, host_type: HostType, id: HostId) -> Result<Option<Host>> {
        Ok(self
            .data
            .read()
            .hosts
            .iter()
            .find(|host| host.host_type() == host_type && host.id == id)
            .cloned())
    }

    async fn save_host(&self, mut host: Host) -> Result<Host> {
        // Relations are attached on read, never stored
        host.certificate = None;
        let mut data = self.data.write();
        let host_type = host.host_type();
        if host.id == 0 {
            host.id = data
                .hosts
                .iter()
                .filter(|h| h.host_type() == host_type)
                .map(|h| h.id)
                .max()
                .unwrap_or(0)
                + 1;
            data.hosts.push(host.clone());
        } else {
            match data
                .hosts
                .iter_mut()
                .find(|h| h.host_type() == host_type && h.id == host.id)
            {
                Some(existing) => *existing = host.clone(),
                None => data.hosts.push(host.clone()),
            }
        }
        self.persist(&data)?;
        Ok(host)
    }

    async fn certificates(&self) -> Result<Vec<Certificate>> {
        Ok(self.data.read().certificates.clone())
    }

    async fn certificate(&self, id: CertificateId) -> Result<Option<Certificate>> {
        Ok(self
            .data
            .read()
            .certificates
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }

    async fn save_certificate(&self, mut certificate: Certificate) -> Result<Certificate> {
        let mut data = self.data.write();
        if certificate.id == 0 {
            certificate.id = data.certificates.iter().map(|c| c.id).max().unwrap_or(0) + 1;
            data.certificates.push(certificate.clone());
        } else {
            match data.certificates.iter_mut().find(|c| c.id == certificate.id) {
                Some(existing) => *existing = certificate.clone(),
                None => data.certificates.push(certificate.clone()),
            }
        }
        self.persist(&data)?;
        Ok(certificate)
    }

    async fn purge_certificate(&self, id: CertificateId) -> Result<bool> {
        let mut data = self.data.write();
        let before = data.certificates.len();
        data.certificates.retain(|c| c.id != id);
        let removed = data.certificates.len() != before;
        if removed {
            self.persist(&data)?;
        }
        Ok(removed)
    }
}
