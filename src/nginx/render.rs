use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::model::host::{ForwardScheme, Location};
use crate::model::{Certificate, CertificateId, Host, HostId, HostType, HostVariant};
use crate::util;
use minijinja::{AutoEscape, Environment, UndefinedBehavior};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use strum::{Display, EnumString};
use tracing::{debug, warn};

static DEFAULT_LOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^(?:.*;)?\s*?location\s*?/\s*?\{").expect("static regex")
});

const LETSENCRYPT_REQUEST_TEMPLATE: &str = "letsencrypt_request.conf";

/// Whether custom nginx directives already declare a `location /` block.
pub fn advanced_config_has_default_location(advanced_config: &str) -> bool {
    DEFAULT_LOCATION.is_match(advanced_config)
}

/// What nginx serves for names no host claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DefaultSiteMode {
    #[default]
    Congratulations,
    #[serde(rename = "404")]
    #[strum(serialize = "404")]
    NotFound,
    #[serde(rename = "444")]
    #[strum(serialize = "444")]
    NoResponse,
    Redirect,
    Html,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultSite {
    pub value: DefaultSiteMode,
    #[serde(default)]
    pub redirect: String,
    #[serde(default)]
    pub html: String,
    #[serde(default)]
    pub advanced_config: String,
}

/// A custom location as the templates see it: `forward_host` never contains a path.
#[derive(Debug, Serialize)]
struct LocationContext<'a> {
    path: &'a str,
    forward_scheme: ForwardScheme,
    forward_host: &'a str,
    forward_port: u16,
    forward_path: String,
    advanced_config: &'a str,
}

impl<'a> From<&'a Location> for LocationContext<'a> {
    fn from(location: &'a Location) -> Self {
        match location.forward_host.split_once('/') {
            Some((host, path)) => LocationContext {
                path: &location.path,
                forward_scheme: location.forward_scheme,
                forward_host: host,
                forward_port: location.forward_port,
                forward_path: format!("/{path}"),
                advanced_config: &location.advanced_config,
            },
            None => LocationContext {
                path: &location.path,
                forward_scheme: location.forward_scheme,
                forward_host: &location.forward_host,
                forward_port: location.forward_port,
                forward_path: location.forward_path.clone(),
                advanced_config: &location.advanced_config,
            },
        }
    }
}

/// Renders hosts into nginx configuration files.
pub struct ConfigGenerator {
    env: Environment<'static>,
    config: Arc<Configuration>,
}

impl ConfigGenerator {
    pub fn new(config: Arc<Configuration>) -> Self {
        let mut env = Environment::new();
        env.set_loader(minijinja::path_loader(&config.nginx.template_dir));
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_auto_escape_callback(|_| AutoEscape::None);
        Self { env, config }
    }

    /// `{root}/{host_type}/{id}.conf`, or the fixed default-site path.
    pub fn config_path_for(&self, host_type: HostType, host_id: HostId) -> PathBuf {
        let root = &self.config.nginx.config_root;
        match host_type {
            HostType::Default => root.join("default_host").join("site.conf"),
            other => root.join(other.as_str()).join(format!("{host_id}.conf")),
        }
    }

    pub fn letsencrypt_request_path(&self, certificate_id: CertificateId) -> PathBuf {
        self.config
            .nginx
            .config_root
            .join("temp")
            .join(format!("letsencrypt_{certificate_id}.conf"))
    }

    fn common_context(&self) -> serde_json::Map<String, Value> {
        let mut context = serde_json::Map::new();
        context.insert(
            "config_root".into(),
            json!(self.config.nginx.config_root.display().to_string()),
        );
        context.insert(
            "log_dir".into(),
            json!(self.config.nginx.log_dir.display().to_string()),
        );
        context
    }

    fn host_context(&self, host: &Host) -> Result<Value> {
        let Value::Object(fields) = serde_json::to_value(host)
            .map_err(|e| Error::InternalConsistency(format!("host is not serializable: {e}")))?
        else {
            return Err(Error::InternalConsistency(
                "host did not serialize to an object".to_string(),
            ));
        };
        let mut context = self.common_context();
        context.extend(fields);

        let mut use_default_location = !advanced_config_has_default_location(&host.advanced_config);
        let mut custom_locations = Vec::new();
        if let HostVariant::ProxyHost(proxy) = &host.variant {
            if proxy.locations.iter().any(|location| location.path == "/") {
                use_default_location = false;
            }
            custom_locations = proxy.locations.iter().map(LocationContext::from).collect();
        }
        context.insert("use_default_location".into(), json!(use_default_location));
        context.insert("custom_locations".into(), json!(custom_locations));

        let certificate = host
            .certificate
            .as_ref()
            .filter(|certificate| host.has_certificate() && certificate.id == host.certificate_id);
        if host.has_certificate() && certificate.is_none() {
            warn!(
                "{} {} references certificate {} but it was not attached, rendering without TLS",
                host.host_type(),
                host.id,
                host.certificate_id
            );
        }
        context.insert("has_certificate".into(), json!(certificate.is_some()));
        context.insert("certificate".into(), json!(certificate));
        let (certificate_file, certificate_key_file) = match certificate {
            Some(certificate) => (
                json!(self.certificate_file(certificate)),
                json!(self.certificate_key_file(certificate)),
            ),
            None => (Value::Null, Value::Null),
        };
        context.insert("certificate_file".into(), certificate_file);
        context.insert("certificate_key_file".into(), certificate_key_file);

        context.insert("access_list".into(), json!(host.access_list));
        let access_list_file = host.access_list.as_ref().map(|list| {
            self.config
                .storage
                .access_dir
                .join(list.id.to_string())
                .display()
                .to_string()
        });
        context.insert("access_list_file".into(), json!(access_list_file));
        Ok(Value::Object(context))
    }

    fn certificate_file(&self, certificate: &Certificate) -> String {
        self.config
            .fullchain_path(certificate.provider, certificate.id)
            .display()
            .to_string()
    }

    fn certificate_key_file(&self, certificate: &Certificate) -> String {
        self.config
            .private_key_path(certificate.provider, certificate.id)
            .display()
            .to_string()
    }

    fn render_template(&self, name: &str, context: &Value) -> Result<String> {
        let template = self.env.get_template(name)?;
        Ok(template.render(context)?)
    }

    /// Renders the configuration of `host` and atomically replaces its file.
    pub fn render(&self, host: &Host) -> Result<PathBuf> {
        let host_type = host.host_type();
        let context = self.host_context(host)?;
        let text = self.render_template(&host_type.template_name(), &context)?;
        let path = self.config_path_for(host_type, host.id);
        util::write_atomic(&path, text.as_bytes())?;
        debug!("Wrote {host_type} {} config to {}", host.id, path.display());
        Ok(path)
    }

    pub fn render_default_site(&self, site: &DefaultSite) -> Result<PathBuf> {
        let html_root = self.config.nginx.config_root.join("default_www");
        if site.value == DefaultSiteMode::Html {
            util::write_atomic(html_root.join("index.html"), site.html.as_bytes())?;
        }
        let mut context = self.common_context();
        context.insert("value".into(), json!(site.value.to_string()));
        context.insert("redirect".into(), json!(site.redirect));
        context.insert("advanced_config".into(), json!(site.advanced_config));
        context.insert("html_root".into(), json!(html_root.display().to_string()));
        let text =
            self.render_template(&HostType::Default.template_name(), &Value::Object(context))?;
        let path = self.config_path_for(HostType::Default, 0);
        util::write_atomic(&path, text.as_bytes())?;
        debug!("Wrote default site config to {}", path.display());
        Ok(path)
    }

    /// Deletes a host's file. Missing files are ignored unless `throw_on_missing` is set.
    pub fn remove(&self, host_type: HostType, host_id: HostId, throw_on_missing: bool) -> Result<()> {
        let path = self.config_path_for(host_type, host_id);
        if util::remove_file(&path, throw_on_missing)? {
            debug!("Deleted nginx config {}", path.display());
        }
        Ok(())
    }

    /// Temporary port-80 server answering HTTP-01 challenges for the certificate's domains.
    pub fn render_letsencrypt_request(&self, certificate: &Certificate) -> Result<PathBuf> {
        let mut context = self.common_context();
        context.insert("id".into(), json!(certificate.id));
        context.insert("domain_names".into(), json!(certificate.domain_names));
        context.insert(
            "challenge_webroot".into(),
            json!(self.config.storage.challenge_webroot.display().to_string()),
        );
        let text = self.render_template(LETSENCRYPT_REQUEST_TEMPLATE, &Value::Object(context))?;
        let path = self.letsencrypt_request_path(certificate.id);
        util::write_atomic(&path, text.as_bytes())?;
        debug!("Wrote HTTP-01 request config to {}", path.display());
        Ok(path)
    }

    pub fn remove_letsencrypt_request(
        &self,
        certificate_id: CertificateId,
        throw_on_missing: bool,
    ) -> Result<()> {
        let path = self.letsencrypt_request_path(certificate_id);
        if util::remove_file(&path, throw_on_missing)? {
            debug!("Deleted HTTP-01 request config {}", path.display());
        }
        Ok(())
    }

    pub fn render_all(&self, hosts: &[Host]) -> Result<()> {
        for host in hosts {
            self.render(host)?;
        }
        Ok(())
    }

    pub fn remove_all(&self, hosts: &[Host], throw_on_missing: bool) -> Result<()> {
        for host in hosts {
            self.remove(host.host_type(), host.id, throw_on_missing)?;
        }
        Ok(())
    }
}
