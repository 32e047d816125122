use crate::acme::{AcmeClient, dns_plugins};
use crate::challenge::{ChallengeOutcome, HttpChallengeChecker, NameResolver};
use crate::cmd_runner::CommandRunner;
use crate::config::Configuration;
use crate::error::{Error, IoContext, Result};
use crate::mkcert::{self, Mkcert};
use crate::model::certificate::MaskedCertificateMeta;
use crate::model::host::hosts_with_domains;
use crate::model::{Certificate, CertificateId, CertificateProvider, CertificateUpdate, Host};
use crate::nginx::Nginx;
use crate::state::{Store, SweepLock};
use crate::util;
use crate::validator::{UploadedFiles, Validator};
use flate2::Compression;
use flate2::write::GzEncoder;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use strum::Display;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CertificateState {
    /// No material yet.
    None,
    Requested,
    Valid,
    Expiring,
    Renewing,
    Failed,
    Deleted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub checked: usize,
    pub renewed: Vec<CertificateId>,
    pub failed: Vec<(CertificateId, String)>,
    /// Due, but another operation held the certificate.
    pub skipped: Vec<CertificateId>,
    pub reloaded: bool,
}

#[derive(Debug)]
pub enum SweepOutcome {
    AlreadyRunning,
    Completed(SweepReport),
    Failed(Error),
}

/// Owns the life of every certificate: issuance, upload, renewal, deletion and the periodic
/// renewal sweep. At most one operation runs per certificate at a time.
pub struct CertificateManager {
    config: Arc<Configuration>,
    store: Arc<dyn Store>,
    nginx: Arc<Nginx>,
    acme: Arc<dyn AcmeClient>,
    mkcert: Mkcert,
    validator: Validator,
    challenge: HttpChallengeChecker,
    states: Mutex<HashMap<CertificateId, CertificateState>>,
    in_flight: Arc<Mutex<HashSet<CertificateId>>>,
    sweep_running: AtomicBool,
}

/// Holds a certificate id in the in-flight set until dropped.
struct InFlight {
    set: Arc<Mutex<HashSet<CertificateId>>>,
    id: CertificateId,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

/// Releases `guard` once `result` is known. When a tool timed out but is still running, the id
/// stays reserved until that process exits, so no second run for the certificate can overlap it.
fn release_when_idle<T>(guard: InFlight, result: Result<T>) -> Result<T> {
    if let Err(Error::Timeout { program, child, .. }) = &result {
        if !child.has_exited() {
            warn!(
                "{program} is still running for certificate {}, keeping it reserved until it exits",
                guard.id
            );
            let child = child.clone();
            tokio::spawn(async move {
                child.wait().await;
                debug!("Certificate {} is free again", guard.id);
                drop(guard);
            });
        }
    }
    result
}

struct SweepFlag<'a>(&'a AtomicBool);

impl Drop for SweepFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl CertificateManager {
    pub fn new(
        config: Arc<Configuration>,
        store: Arc<dyn Store>,
        nginx: Arc<Nginx>,
        acme: Arc<dyn AcmeClient>,
        runner: Arc<dyn CommandRunner>,
        resolver: Arc<dyn NameResolver>,
    ) -> Result<Self> {
        let challenge =
            HttpChallengeChecker::new(config.storage.challenge_webroot.clone(), resolver)?;
        Ok(Self {
            mkcert: Mkcert::new(runner.clone(), config.clone()),
            validator: Validator::new(runner, &config),
            challenge,
            config,
            store,
            nginx,
            acme,
            states: Mutex::default(),
            in_flight: Arc::default(),
            sweep_running: AtomicBool::new(false),
        })
    }

    pub fn state_of(&self, id: CertificateId) -> CertificateState {
        self.states
            .lock()
            .get(&id)
            .copied()
            .unwrap_or(CertificateState::None)
    }

    fn set_state(&self, id: CertificateId, state: CertificateState) {
        debug!("Certificate {id} is now {state}");
        self.states.lock().insert(id, state);
    }

    fn begin(&self, id: CertificateId) -> Result<InFlight> {
        if !self.in_flight.lock().insert(id) {
            return Err(Error::Busy(id));
        }
        Ok(InFlight {
            set: self.in_flight.clone(),
            id,
        })
    }

    /// A due certificate becomes `Expiring`, unless an operation currently owns its state.
    fn mark_expiring(&self, id: CertificateId) {
        let mut states = self.states.lock();
        match states.get(&id) {
            Some(
                CertificateState::Requested | CertificateState::Renewing | CertificateState::Deleted,
            ) => {}
            _ => {
                debug!("Certificate {id} is now {}", CertificateState::Expiring);
                states.insert(id, CertificateState::Expiring);
            }
        }
    }

    fn renewal_window(&self) -> time::Duration {
        time::Duration::try_from(self.config.renewal.window).unwrap_or(time::Duration::MAX)
    }

    fn state_for_expiry(&self, certificate: &Certificate) -> CertificateState {
        if certificate.expires_within(OffsetDateTime::now_utc(), self.renewal_window()) {
            CertificateState::Expiring
        } else {
            CertificateState::Valid
        }
    }

    /// Persists a new certificate and, for every provider but custom uploads, obtains its
    /// material. A failed issuance leaves no record behind; its state stays `Failed`.
    pub async fn create(&self, mut certificate: Certificate) -> Result<Certificate> {
        certificate.id = 0;
        certificate.is_deleted = false;
        certificate.expires_on = None;
        match certificate.provider {
            CertificateProvider::LetsEncryptHttp | CertificateProvider::LetsEncryptDns => {
                if certificate.domain_names.is_empty() {
                    return Err(Error::validation("At least one domain name is required"));
                }
                if certificate.nice_name.is_empty() {
                    certificate.nice_name = certificate.domain_names.join(", ");
                }
            }
            CertificateProvider::Mkcert => mkcert::validate_domains(&certificate.domain_names)?,
            CertificateProvider::Custom => {}
        }
        if certificate.provider == CertificateProvider::LetsEncryptDns {
            let provider = certificate.meta.dns_provider.as_deref().unwrap_or_default();
            if dns_plugins::find(provider).is_none() {
                return Err(Error::validation(format!(
                    "Unknown DNS provider '{provider}', expected one of: {}",
                    dns_plugins::known_ids()
                )));
            }
        }

        let certificate = self.store.save_certificate(certificate).await?;
        let id = certificate.id;
        let guard = self.begin(id)?;
        let issued = match certificate.provider {
            CertificateProvider::Custom => return Ok(certificate),
            CertificateProvider::Mkcert => {
                self.set_state(id, CertificateState::Requested);
                self.issue_mkcert(certificate).await
            }
            _ => {
                self.set_state(id, CertificateState::Requested);
                self.issue_acme(certificate).await
            }
        };
        let result = match issued {
            Ok(certificate) => self.store.save_certificate(certificate).await.inspect(|certificate| {
                self.set_state(id, self.state_for_expiry(certificate));
                info!("Certificate {id} issued, expires {:?}", certificate.expires_on);
            }),
            Err(err) => {
                error!("Issuing certificate {id} failed: {err}");
                self.set_state(id, CertificateState::Failed);
                if let Err(purge) = self.store.purge_certificate(id).await {
                    error!("Could not remove the record of certificate {id}: {purge}");
                }
                Err(err)
            }
        };
        release_when_idle(guard, result)
    }

    /// Changes the name or ACME settings of a certificate. Material and domains stay as they are.
    pub async fn update(&self, update: CertificateUpdate) -> Result<Certificate> {
        let id = update.id;
        if update.nice_name.as_deref().is_some_and(|name| name.trim().is_empty()) {
            return Err(Error::validation("The certificate name must not be empty"));
        }
        let _guard = self.begin(id)?;
        let mut certificate = self.store.existing_certificate(id).await?;
        if certificate.id != id {
            return Err(Error::InternalConsistency(format!(
                "Certificate could not be updated, IDs do not match: {} != {id}",
                certificate.id
            )));
        }
        update.apply_to(&mut certificate);
        let certificate = self.store.save_certificate(certificate).await?;
        info!("Updated certificate {id}");
        Ok(certificate)
    }

    /// Packs the live PEM files of an ACME certificate into a gzipped tarball under
    /// the temporary directory and returns its path. Removing the archive is up to the caller.
    pub async fn download(&self, id: CertificateId) -> Result<PathBuf> {
        let certificate = self.store.existing_certificate(id).await?;
        if !certificate.provider.is_acme() {
            return Err(Error::validation(
                "Only Let's Encrypt certificates can be downloaded",
            ));
        }
        let dir = self.config.certificate_directory(certificate.provider, id);
        if !dir.is_dir() {
            return Err(Error::not_found(format!(
                "Certificate {} does not exist",
                certificate.nice_name
            )));
        }
        let mut names: Vec<String> = std::fs::read_dir(&dir)
            .with_path(&dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.ends_with(".pem"))
            .collect();
        names.sort();
        let stamp = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        let archive = self
            .config
            .temp_directory()
            .join(format!("{}-{stamp}.tar.gz", self.config.certificate_name(id)));
        if let Err(err) = write_archive(&dir, &names, &archive) {
            util::remove_file(&archive, false)?;
            return Err(err);
        }
        debug!("Packed {} file(s) of certificate {id} into {}", names.len(), archive.display());
        Ok(archive)
    }

    /// ACME issuance. Hosts already serving the domains are taken out of nginx for the duration;
    /// they come back on every path.
    async fn issue_acme(&self, mut certificate: Certificate) -> Result<Certificate> {
        let id = certificate.id;
        let http = certificate.provider == CertificateProvider::LetsEncryptHttp;
        let all_hosts = self.store.hosts().await?;
        let in_use: Vec<Host> = hosts_with_domains(&all_hosts, &certificate.domain_names)
            .into_iter()
            .filter(|host| host.is_active())
            .cloned()
            .collect();
        if !in_use.is_empty() {
            info!("Temporarily disabling {} host(s) using the requested domains", in_use.len());
        }
        self.nginx.generator.remove_all(&in_use, false)?;

        let requested = async {
            if http {
                self.nginx.generator.render_letsencrypt_request(&certificate)?;
            }
            self.nginx.daemon.reload().await?;
            if http && !self.config.renewal.challenge_settle_delay.is_zero() {
                tokio::time::sleep(self.config.renewal.challenge_settle_delay).await;
            }
            self.acme.request(&certificate).await
        }
        .await;

        let restored = self.restore(id, in_use, http).await;
        requested?;
        restored?;

        let fullchain = self.config.fullchain_path(certificate.provider, id);
        let info = self
            .validator
            .inspect_certificate_file(&fullchain, false)
            .await?;
        certificate.expires_on = Some(info.valid_to);
        Ok(certificate)
    }

    async fn restore(&self, id: CertificateId, hosts: Vec<Host>, http: bool) -> Result<()> {
        if http {
            self.nginx.generator.remove_letsencrypt_request(id, false)?;
        }
        for host in hosts {
            let host = self.store.with_relations(host).await?;
            self.nginx.generator.render(&host)?;
        }
        self.nginx.daemon.reload().await
    }

    async fn issue_mkcert(&self, mut certificate: Certificate) -> Result<Certificate> {
        let dir = self
            .mkcert
            .generate(certificate.id, &certificate.domain_names)
            .await?;
        let info = self
            .validator
            .inspect_certificate_file(&dir.join("fullchain.pem"), false)
            .await?;
        certificate.expires_on = Some(info.valid_to);
        Ok(certificate)
    }

    /// Attaches uploaded material to a custom certificate. Returns the masked meta.
    pub async fn upload(
        &self,
        id: CertificateId,
        files: UploadedFiles,
    ) -> Result<MaskedCertificateMeta> {
        let _guard = self.begin(id)?;
        let mut certificate = self.store.existing_certificate(id).await?;
        if certificate.provider != CertificateProvider::Custom {
            return Err(Error::validation(
                "Only custom certificates accept uploaded material",
            ));
        }
        let validation = self.validator.validate_upload(&files).await?;

        let dir = self.config.certificate_directory(CertificateProvider::Custom, id);
        let mut fullchain = files.certificate.trim_end().to_string();
        if let Some(intermediate) = files
            .intermediate_certificate
            .as_deref()
            .filter(|pem| !pem.trim().is_empty())
        {
            fullchain.push('\n');
            fullchain.push_str(intermediate.trim_end());
        }
        fullchain.push('\n');
        util::write_atomic(dir.join("fullchain.pem"), fullchain.as_bytes())?;
        util::write_atomic_with_mode(dir.join("privkey.pem"), files.certificate_key.as_bytes(), 0o600)?;

        certificate.domain_names = vec![validation.certificate.common_name.clone()];
        certificate.expires_on = Some(validation.certificate.valid_to);
        certificate.meta.certificate = Some(files.certificate);
        certificate.meta.certificate_key = Some(files.certificate_key);
        certificate.meta.intermediate_certificate = files.intermediate_certificate;
        let certificate = self.store.save_certificate(certificate).await?;
        self.set_state(id, self.state_for_expiry(&certificate));
        info!("Uploaded material for certificate {id} ({})", validation.certificate.common_name);

        self.rerender_and_reload(&[id]).await?;
        Ok(certificate.meta.masked())
    }

    /// Renews now, whatever the expiry date, then re-renders the hosts using the certificate.
    /// A failed renewal leaves the current material in place.
    pub async fn renew(&self, id: CertificateId) -> Result<Certificate> {
        let guard = self.begin(id)?;
        let result = async {
            let certificate = self.store.existing_certificate(id).await?;
            let renewed = self.renew_material(certificate).await?;
            self.rerender_and_reload(&[id]).await?;
            Ok(renewed)
        }
        .await;
        release_when_idle(guard, result)
    }

    async fn renew_material(&self, mut certificate: Certificate) -> Result<Certificate> {
        let id = certificate.id;
        if !certificate.provider.is_renewable() {
            return Err(Error::validation(
                "Only ACME or mkcert certificates can be renewed",
            ));
        }
        self.set_state(id, CertificateState::Renewing);
        let renewed = async {
            let fullchain = if certificate.provider == CertificateProvider::Mkcert {
                self.mkcert
                    .generate(id, &certificate.domain_names)
                    .await?
                    .join("fullchain.pem")
            } else {
                self.acme.renew(&certificate).await?;
                self.config.fullchain_path(certificate.provider, id)
            };
            self.validator
                .inspect_certificate_file(&fullchain, false)
                .await
        }
        .await;
        match renewed {
            Ok(info) => {
                certificate.expires_on = Some(info.valid_to);
                let certificate = self.store.save_certificate(certificate).await?;
                self.set_state(id, self.state_for_expiry(&certificate));
                info!("Certificate {id} renewed, expires {}", info.valid_to);
                Ok(certificate)
            }
            Err(err) => {
                self.set_state(id, CertificateState::Failed);
                Err(err)
            }
        }
    }

    /// Re-renders active hosts using any of `ids`; reloads once if there were any.
    async fn rerender_and_reload(&self, ids: &[CertificateId]) -> Result<bool> {
        let hosts: Vec<Host> = self
            .store
            .hosts()
            .await?
            .into_iter()
            .filter(|host| host.is_active() && ids.contains(&host.certificate_id))
            .collect();
        if hosts.is_empty() {
            return Ok(false);
        }
        for host in hosts {
            let host = self.store.with_relations(host).await?;
            self.nginx.generator.render(&host)?;
        }
        self.nginx.daemon.reload().await?;
        Ok(true)
    }

    /// Soft-deletes the certificate, removes its material, and detaches it from every host. Hosts
    /// are detached even when removing the material fails; that error is returned afterwards.
    pub async fn delete(&self, id: CertificateId) -> Result<()> {
        let _guard = self.begin(id)?;
        let mut certificate = self.store.existing_certificate(id).await?;
        certificate.is_deleted = true;
        let certificate = self.store.save_certificate(certificate).await?;

        let removed = match certificate.provider {
            CertificateProvider::LetsEncryptHttp | CertificateProvider::LetsEncryptDns => {
                if let Err(err) = self.acme.revoke(&certificate).await {
                    warn!("Certificate {id} was deleted, but revoking it failed: {err}");
                }
                Ok(())
            }
            CertificateProvider::Mkcert => self.mkcert.delete(id).map(|_| ()),
            CertificateProvider::Custom => {
                util::remove_dir_all(self.config.certificate_directory(CertificateProvider::Custom, id))
                    .map(|_| ())
            }
        };
        if let Err(err) = &removed {
            error!("Could not remove the material of certificate {id}: {err}");
        }

        let hosts = self.store.hosts_using_certificate(id).await?;
        let mut reload = false;
        for mut host in hosts {
            host.detach_certificate();
            let host = self.store.save_host(host).await?;
            if host.is_active() {
                let host = self.store.with_relations(host).await?;
                self.nginx.generator.render(&host)?;
                reload = true;
            }
        }
        if reload {
            self.nginx.daemon.reload().await?;
        }
        self.set_state(id, CertificateState::Deleted);
        info!("Certificate {id} deleted");
        removed
    }

    /// Renews every certificate due within the renewal window. Only one sweep runs at a time; a
    /// concurrent call returns [`SweepOutcome::AlreadyRunning`] immediately.
    pub async fn process_expiring_hosts(&self) -> SweepOutcome {
        if self
            .sweep_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Renewal sweep already in progress");
            return SweepOutcome::AlreadyRunning;
        }
        let _flag = SweepFlag(&self.sweep_running);
        info!("Renewing certificates close to expiry");
        match self.sweep().await {
            Ok(report) => {
                info!(
                    "Renewal sweep complete: {} renewed, {} failed, {} skipped",
                    report.renewed.len(),
                    report.failed.len(),
                    report.skipped.len()
                );
                SweepOutcome::Completed(report)
            }
            Err(err) => {
                error!("Renewal sweep failed: {err}");
                SweepOutcome::Failed(err)
            }
        }
    }

    async fn sweep(&self) -> Result<SweepReport> {
        // Serializes with sweeps of other processes sharing the state directory
        let _lock = match self.config.storage.state_file.parent() {
            Some(dir) => Some(SweepLock::exclusive_lock(dir).await.with_path(dir)?),
            None => None,
        };
        let now = OffsetDateTime::now_utc();
        let window = self.renewal_window();
        let mut report = SweepReport::default();
        for certificate in self.store.certificates().await? {
            if certificate.is_deleted || !certificate.provider.is_renewable() {
                continue;
            }
            report.checked += 1;
            let id = certificate.id;
            if !certificate.expires_within(now, window) {
                if let Some(expires_on) = certificate.expires_on {
                    debug!(
                        "Certificate {id} is not due for renewal for {}",
                        crate::time::humanize_duration(expires_on - now - window)
                    );
                }
                continue;
            }
            self.mark_expiring(id);
            let Ok(guard) = self.begin(id) else {
                warn!("Certificate {id} is busy, skipping renewal");
                report.skipped.push(id);
                continue;
            };
            let renewed = self.renew_material(certificate).await;
            match release_when_idle(guard, renewed) {
                Ok(_) => report.renewed.push(id),
                Err(err) => {
                    error!("Renewing certificate {id} failed: {err}");
                    report.failed.push((id, err.to_string()));
                }
            }
        }
        if !report.renewed.is_empty() {
            match self.rerender_and_reload(&report.renewed).await {
                Ok(reloaded) => report.reloaded = reloaded,
                Err(err) => error!("Applying renewed certificates failed: {err}"),
            }
        }
        Ok(report)
    }

    /// Sweeps right away and then every `renewal.interval` until cancelled, after a random start
    /// delay of up to `renewal.startup_jitter`.
    pub async fn run_renewal_timer(&self, cancel: CancellationToken) {
        let jitter = self.config.renewal.startup_jitter.as_millis() as u64;
        let delay = Duration::from_millis(rand::rng().random_range(0..=jitter));
        if !delay.is_zero() {
            debug!("Delaying first renewal sweep by {}", crate::time::humanize_std_duration(&delay));
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
        let period = self.config.renewal.interval.max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let SweepOutcome::AlreadyRunning = self.process_expiring_hosts().await {
                        debug!("Skipped timer tick, a sweep is still running");
                    }
                }
            }
        }
        info!("Renewal timer stopped");
    }

    /// Whether each domain reaches our ACME webroot over HTTP. Informational only.
    pub async fn test_http_challenge(
        &self,
        domains: &[String],
    ) -> Result<BTreeMap<String, ChallengeOutcome>> {
        self.challenge.check(domains).await
    }
}

fn write_archive(dir: &Path, names: &[String], archive: &Path) -> Result<()> {
    let parent = archive.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent).with_path(parent)?;
    let file = std::fs::File::create(archive).with_path(archive)?;
    // Carries the private key
    util::set_mode(archive, 0o600)?;
    let mut builder = tar::Builder::new(GzEncoder::new(BufWriter::new(file), Compression::best()));
    for name in names {
        // Follows the symlinks certbot keeps in its live directory
        builder
            .append_path_with_name(dir.join(name), name)
            .with_path(dir.join(name))?;
    }
    builder
        .into_inner()
        .and_then(GzEncoder::finish)
        .and_then(|mut writer| writer.flush())
        .with_path(archive)
}
