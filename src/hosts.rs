use crate::error::{Error, Result};
use crate::model::host::ensure_hostnames_available;
use crate::model::{Host, HostId, HostMeta, HostType, HostVariant};
use crate::nginx::Nginx;
use crate::state::Store;
use std::sync::Arc;
use tracing::info;

/// Host CRUD on top of the store, applying every change to nginx.
pub struct HostService {
    store: Arc<dyn Store>,
    nginx: Arc<Nginx>,
}

fn validate(host: &Host) -> Result<()> {
    match &host.variant {
        HostVariant::Stream(stream) => {
            if !stream.tcp_forwarding && !stream.udp_forwarding {
                return Err(Error::validation(
                    "A stream must forward TCP, UDP, or both",
                ));
            }
        }
        _ if host.domain_names().iter().all(|d| d.trim().is_empty()) => {
            return Err(Error::validation("At least one domain name is required"));
        }
        _ => {}
    }
    Ok(())
}

impl HostService {
    pub fn new(store: Arc<dyn Store>, nginx: Arc<Nginx>) -> Self {
        Self { store, nginx }
    }

    /// A non-deleted host with its certificate attached.
    pub async fn get(&self, host_type: HostType, id: HostId) -> Result<Host> {
        match self.store.host(host_type, id).await? {
            Some(host) if !host.is_deleted => self.store.with_relations(host).await,
            _ => Err(Error::not_found(format!("{host_type} {id}"))),
        }
    }

    async fn check(&self, host: &mut Host) -> Result<()> {
        validate(host)?;
        if host.is_active() {
            ensure_hostnames_available(&self.store.hosts().await?, host)?;
        }
        if host.has_certificate() {
            self.store.existing_certificate(host.certificate_id).await?;
        }
        host.normalize_ssl();
        Ok(())
    }

    pub async fn create(&self, mut host: Host) -> Result<Host> {
        host.id = 0;
        host.is_deleted = false;
        host.meta = HostMeta::default();
        self.check(&mut host).await?;
        let host = self.store.save_host(host).await?;
        info!("Created {} {}", host.host_type(), host.id);
        self.apply(host).await
    }

    /// Replaces a host's settings. Ownership and deletion state stay as stored.
    pub async fn update(&self, mut host: Host) -> Result<Host> {
        let existing = self.get(host.host_type(), host.id).await?;
        host.owner_user_id = existing.owner_user_id;
        host.is_deleted = false;
        self.check(&mut host).await?;
        let host = self.store.save_host(host).await?;
        info!("Updated {} {}", host.host_type(), host.id);
        self.apply(host).await
    }

    pub async fn delete(&self, host_type: HostType, id: HostId) -> Result<()> {
        let mut host = self.get(host_type, id).await?;
        host.is_deleted = true;
        self.store.save_host(host).await?;
        self.nginx.generator.remove(host_type, id, false)?;
        self.nginx.daemon.reload().await?;
        info!("Deleted {host_type} {id}");
        Ok(())
    }

    pub async fn enable(&self, host_type: HostType, id: HostId) -> Result<Host> {
        let mut host = self.get(host_type, id).await?;
        if host.enabled {
            return Err(Error::validation("Host is already enabled"));
        }
        host.enabled = true;
        ensure_hostnames_available(&self.store.hosts().await?, &host)?;
        let host = self.store.save_host(host).await?;
        info!("Enabled {host_type} {id}");
        self.apply(host).await
    }

    pub async fn disable(&self, host_type: HostType, id: HostId) -> Result<Host> {
        let mut host = self.get(host_type, id).await?;
        if !host.enabled {
            return Err(Error::validation("Host is already disabled"));
        }
        host.enabled = false;
        host.meta = HostMeta::default();
        let host = self.store.save_host(host).await?;
        self.nginx.generator.remove(host_type, id, false)?;
        self.nginx.daemon.reload().await?;
        info!("Disabled {host_type} {id}");
        self.store.with_relations(host).await
    }

    /// Renders a stored host again, reloading nginx.
    pub async fn reapply(&self, host_type: HostType, id: HostId) -> Result<Host> {
        let host = self.get(host_type, id).await?;
        self.apply(host).await
    }

    /// Takes a host's configuration out of nginx and reloads. The stored record is left alone.
    pub async fn withdraw(&self, host_type: HostType, id: HostId) -> Result<()> {
        self.nginx.generator.remove(host_type, id, true)?;
        self.nginx.daemon.reload().await?;
        info!("Withdrew {host_type} {id} from nginx");
        Ok(())
    }

    /// Renders an active host and records whether nginx accepted it.
    async fn apply(&self, host: Host) -> Result<Host> {
        let mut host = self.store.with_relations(host).await?;
        if !host.is_active() {
            self.nginx
                .generator
                .remove(host.host_type(), host.id, false)?;
            self.nginx.daemon.reload().await?;
            return Ok(host);
        }
        host.meta = self.nginx.configure(&host).await?;
        let host = self.store.save_host(host).await?;
        self.store.with_relations(host).await
    }
}
