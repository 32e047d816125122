use crate::cmd_runner::{CommandOutput, CommandRunner, CommandSpec};
use crate::config::Configuration;
use crate::error::{Error, IoContext, Result};
use regex::Regex;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tempfile::NamedTempFile;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use tracing::debug;

static COMMON_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)\bCN\s*=\s*([^,/\n]+)").expect("static regex")
});
static FIRST_ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^(?:subject=)?[^=]+=\s*(\S+)").expect("static regex")
});
static ISSUER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^(?:issuer=)\s*(.+)$").expect("static regex"));
static DATE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\S+?)=(.*)$").expect("static regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));

/// What openssl reports about a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateInfo {
    pub common_name: String,
    pub issuer: String,
    #[serde(with = "time::serde::rfc3339")]
    pub valid_from: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub valid_to: OffsetDateTime,
}

/// PEM material uploaded for a custom certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadedFiles {
    pub certificate: String,
    pub certificate_key: String,
    pub intermediate_certificate: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadValidation {
    pub certificate: CertificateInfo,
    pub certificate_key: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intermediate_certificate: Option<CertificateInfo>,
}

#[derive(Clone)]
pub struct Validator {
    runner: Arc<dyn CommandRunner>,
    openssl: PathBuf,
    temp_dir: Option<PathBuf>,
    timeout: Duration,
    key_check_timeout: Duration,
}

impl Validator {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &Configuration) -> Self {
        Self {
            runner,
            openssl: config.openssl.binary.clone(),
            temp_dir: config.storage.temp_dir.clone(),
            timeout: config.timeouts.command,
            key_check_timeout: config.timeouts.key_check,
        }
    }

    /// Writes `contents` to a transient file that is removed when the handle drops.
    fn transient_file(&self, contents: &str) -> Result<NamedTempFile> {
        let mut file = match &self.temp_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).with_path(dir)?;
                NamedTempFile::new_in(dir).with_path(dir)?
            }
            None => NamedTempFile::new().with_path(std::env::temp_dir())?,
        };
        file.write_all(contents.as_bytes())
            .with_path(file.path().to_path_buf())?;
        file.flush().with_path(file.path().to_path_buf())?;
        Ok(file)
    }

    pub async fn check_private_key(&self, pem: &str) -> Result<()> {
        require_pem(pem, "PRIVATE KEY")
            .map_err(|e| Error::validation(format!("Certificate Key is not valid ({e})")))?;
        let file = self.transient_file(pem)?;
        let command = CommandSpec::new(&self.openssl)
            .args(["pkey", "-in"])
            .arg(file.path())
            .args(["-check", "-noout"]);
        let result = self.runner.run(&command, self.key_check_timeout).await;
        drop(file);
        match result {
            Ok(output) if output.success => {
                let text = output.combined();
                if text.to_lowercase().contains("key is valid") {
                    Ok(())
                } else {
                    Err(Error::validation(format!("Result Validation Error: {text}")))
                }
            }
            Ok(output) => Err(Error::validation(format!(
                "Certificate Key is not valid ({})",
                output.combined()
            ))),
            Err(Error::Timeout { after, .. }) => Err(Error::validation(format!(
                "Checking the certificate key took longer than {}; the key may be protected by a passphrase, which is not supported",
                crate::time::humanize_std_duration(&after)
            ))),
            Err(e) => Err(Error::validation(format!("Certificate Key is not valid ({e})"))),
        }
    }

    pub async fn inspect_certificate(
        &self,
        pem: &str,
        enforce_not_expired: bool,
    ) -> Result<CertificateInfo> {
        require_pem(pem, "CERTIFICATE")
            .map_err(|e| Error::validation(format!("Certificate is not valid ({e})")))?;
        let file = self.transient_file(pem)?;
        let info = self
            .inspect_certificate_file(file.path(), enforce_not_expired)
            .await;
        drop(file);
        info
    }

    pub async fn inspect_certificate_file(
        &self,
        path: &Path,
        enforce_not_expired: bool,
    ) -> Result<CertificateInfo> {
        let (subject, issuer, dates) = futures::try_join!(
            self.x509(path, "-subject"),
            self.x509(path, "-issuer"),
            self.x509(path, "-dates"),
        )?;
        let common_name = parse_subject(&subject.stdout)?;
        let issuer = parse_issuer(&issuer.stdout)?;
        let (valid_from, valid_to) = parse_dates(&dates.stdout)?;
        if enforce_not_expired && valid_to < OffsetDateTime::now_utc() {
            return Err(Error::validation("Certificate has expired"));
        }
        debug!("Certificate {} for {common_name} is valid until {valid_to}", path.display());
        Ok(CertificateInfo {
            common_name,
            issuer,
            valid_from,
            valid_to,
        })
    }

    async fn x509(&self, path: &Path, field: &str) -> Result<CommandOutput> {
        let command = CommandSpec::new(&self.openssl)
            .args(["x509", "-in"])
            .arg(path)
            .args([field, "-noout"]);
        self.runner
            .run_checked(&command, self.timeout)
            .await
            .map_err(|e| match e {
                Error::ExternalTool { output, .. } => {
                    Error::validation(format!("Certificate is not valid ({output})"))
                }
                other => other,
            })
    }

    /// Checks every part of an upload: the key, the certificate (which must not be expired), and
    /// the optional intermediate certificate.
    pub async fn validate_upload(&self, files: &UploadedFiles) -> Result<UploadValidation> {
        self.check_private_key(&files.certificate_key).await?;
        let certificate = self.inspect_certificate(&files.certificate, true).await?;
        let intermediate_certificate = match files.intermediate_certificate.as_deref() {
            Some(pem) if !pem.trim().is_empty() => Some(self.inspect_certificate(pem, false).await?),
            _ => None,
        };
        Ok(UploadValidation {
            certificate,
            certificate_key: true,
            intermediate_certificate,
        })
    }
}

/// Cheap framing check so obviously wrong input never reaches openssl.
fn require_pem(text: &str, tag_suffix: &str) -> std::result::Result<(), String> {
    let block = pem::parse(text.trim()).map_err(|e| format!("no PEM data found: {e}"))?;
    if block.tag().ends_with(tag_suffix) {
        Ok(())
    } else {
        Err(format!(
            "expected a {tag_suffix} PEM block, found {}",
            block.tag()
        ))
    }
}

fn parse_subject(output: &str) -> Result<String> {
    COMMON_NAME
        .captures(output)
        .or_else(|| FIRST_ATTRIBUTE.captures(output))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|cn| !cn.is_empty())
        .ok_or_else(|| {
            Error::validation(format!(
                "Certificate is not valid (Could not determine subject from certificate: {})",
                output.trim()
            ))
        })
}

fn parse_issuer(output: &str) -> Result<String> {
    ISSUER
        .captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|issuer| !issuer.is_empty())
        .ok_or_else(|| {
            Error::validation(format!(
                "Certificate is not valid (Could not determine issuer from certificate: {})",
                output.trim()
            ))
        })
}

/// Parses the `notBefore=` / `notAfter=` lines of `openssl x509 -dates`. The date format is fixed
/// by openssl (`Oct 12 04:04:29 2018 GMT`) and does not depend on the locale.
fn parse_dates(output: &str) -> Result<(OffsetDateTime, OffsetDateTime)> {
    let mut valid_from = None;
    let mut valid_to = None;
    for line in output.lines() {
        let Some(captures) = DATE_LINE.captures(line.trim()) else {
            continue;
        };
        let Some(date) = parse_openssl_date(&captures[2]) else {
            continue;
        };
        match captures[1].to_lowercase().as_str() {
            "notbefore" => valid_from = Some(date),
            "notafter" => valid_to = Some(date),
            _ => {}
        }
    }
    match (valid_from, valid_to) {
        (Some(from), Some(to)) => Ok((from, to)),
        _ => Err(Error::validation(format!(
            "Certificate is not valid (Could not determine dates from certificate: {})",
            output.trim()
        ))),
    }
}

fn parse_openssl_date(text: &str) -> Option<OffsetDateTime> {
    let format = format_description!(
        "[month repr:short] [day padding:none] [hour]:[minute]:[second] [year] GMT"
    );
    let normalized = WHITESPACE.replace_all(text.trim(), " ");
    PrimitiveDateTime::parse(&normalized, format)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}
