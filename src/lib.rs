use crate::acme::{AcmeClient, Certbot};
use crate::challenge::{NameResolver, SystemResolver};
use crate::cmd_runner::{CommandRunner, SystemCommandRunner};
use crate::config::Configuration;
use crate::error::Result;
use crate::hosts::HostService;
use crate::lifecycle::CertificateManager;
use crate::nginx::Nginx;
use crate::state::{MemoryStore, Store};
use crate::validator::Validator;
use std::sync::Arc;

pub mod acme;
pub mod challenge;
pub mod cli;
pub mod cmd_runner;
pub mod config;
pub mod error;
pub mod hosts;
pub mod lifecycle;
pub mod mkcert;
pub mod model;
pub mod nginx;
pub mod state;
pub mod time;
pub mod util;
pub mod validator;

pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");

/// Every component, wired to one configuration, store and command runner.
pub struct Proxynaut {
    pub config: Arc<Configuration>,
    pub store: Arc<dyn Store>,
    pub nginx: Arc<Nginx>,
    pub validator: Validator,
    pub certificates: Arc<CertificateManager>,
    pub hosts: HostService,
}

impl Proxynaut {
    /// Production wiring: real tools, the system resolver, and the state file from `config`.
    pub fn try_new(config: Configuration) -> Result<Self> {
        let store = Arc::new(MemoryStore::open(&config.storage.state_file)?);
        Self::with_parts(
            config,
            store,
            Arc::new(SystemCommandRunner),
            Arc::new(SystemResolver::new()),
        )
    }

    pub fn with_parts(
        config: Configuration,
        store: Arc<dyn Store>,
        runner: Arc<dyn CommandRunner>,
        resolver: Arc<dyn NameResolver>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let acme: Arc<dyn AcmeClient> = Arc::new(Certbot::new(runner.clone(), config.clone()));
        Self::with_acme(config, store, runner, resolver, acme)
    }

    /// Like [`Proxynaut::with_parts`], with a custom ACME client.
    pub fn with_acme(
        config: Arc<Configuration>,
        store: Arc<dyn Store>,
        runner: Arc<dyn CommandRunner>,
        resolver: Arc<dyn NameResolver>,
        acme: Arc<dyn AcmeClient>,
    ) -> Result<Self> {
        let nginx = Arc::new(Nginx::new(config.clone(), runner.clone()));
        let certificates = Arc::new(CertificateManager::new(
            config.clone(),
            store.clone(),
            nginx.clone(),
            acme,
            runner.clone(),
            resolver,
        )?);
        Ok(Self {
            validator: Validator::new(runner, &config),
            hosts: HostService::new(store.clone(), nginx.clone()),
            config,
            store,
            nginx,
            certificates,
        })
    }
}
