use crate::cmd_runner::CommandRunner;
use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::model::{Host, HostMeta};
use std::sync::Arc;
use tracing::{error, info};

pub mod daemon;
pub mod render;

pub use daemon::Daemon;
pub use render::{ConfigGenerator, DefaultSite, DefaultSiteMode, advanced_config_has_default_location};

/// nginx cannot open its default error log inside containers; that line is noise, not a failure.
const IGNORED_ERROR_LINE: &str = "/var/log/nginx/error.log";

/// Configuration generator and daemon controller, used together.
pub struct Nginx {
    pub generator: ConfigGenerator,
    pub daemon: Daemon,
}

impl Nginx {
    pub fn new(config: Arc<Configuration>, runner: Arc<dyn CommandRunner>) -> Self {
        let daemon = Daemon::new(
            runner,
            config.nginx.binary.clone(),
            config.timeouts.command,
        );
        Self {
            generator: ConfigGenerator::new(config),
            daemon,
        }
    }

    /// Applies one host: checks the current tree, replaces the host's file, checks again and
    /// records the outcome. A host whose file breaks the tree is taken offline (its file removed)
    /// instead of failing the call. The daemon is reloaded either way.
    ///
    /// Returns the host's new meta; persisting it is up to the caller.
    pub async fn configure(&self, host: &Host) -> Result<HostMeta> {
        let host_type = host.host_type();
        self.daemon.test().await?;
        self.generator.remove(host_type, host.id, false)?;
        self.generator.render(host)?;
        let meta = match self.daemon.test().await {
            Ok(()) => {
                info!("{host_type} {} is online", host.id);
                HostMeta {
                    nginx_online: Some(true),
                    nginx_err: None,
                }
            }
            Err(err) => {
                let message = match &err {
                    Error::ExternalTool { output, .. } => filter_error_output(output),
                    other => other.to_string(),
                };
                error!("nginx rejected {host_type} {}: {message}", host.id);
                self.generator.remove(host_type, host.id, true)?;
                HostMeta {
                    nginx_online: Some(false),
                    nginx_err: Some(message),
                }
            }
        };
        self.daemon.reload().await?;
        Ok(meta)
    }
}

fn filter_error_output(output: &str) -> String {
    output
        .lines()
        .filter(|line| !line.contains(IGNORED_ERROR_LINE))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd_runner::CommandOutput;
    use crate::cmd_runner::testing::RecordingRunner;
    use crate::model::HostType;
    use crate::model::host::testing::proxy_host;
    use crate::nginx::render::testing::test_config;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_configure_online() {
        let dir = tempdir().unwrap();
        let runner = RecordingRunner::succeeding();
        let nginx = Nginx::new(Arc::new(test_config(dir.path())), Arc::new(runner.clone()));
        let host = proxy_host(1, "a.example.com", "10.0.0.5", 8080);

        let meta = nginx.configure(&host).await.unwrap();

        assert_eq!(meta.nginx_online, Some(true));
        assert_eq!(meta.nginx_err, None);
        assert!(nginx.generator.config_path_for(HostType::ProxyHost, 1).exists());
        assert_eq!(
            runner.command_lines(),
            vec![
                "nginx -t -g error_log off;",
                "nginx -t -g error_log off;",
                "nginx -t -g error_log off;",
                "nginx -s reload",
            ]
        );
    }

    #[tokio::test]
    async fn test_configure_offline_removes_file() {
        let dir = tempdir().unwrap();
        // The second test (right after rendering) fails, all others pass
        let tests = Arc::new(AtomicUsize::new(0));
        let counter = tests.clone();
        let runner = RecordingRunner::new(move |cmd| {
            if cmd.args.iter().any(|a| a == "-t")
                && counter.fetch_add(1, Ordering::SeqCst) == 1
            {
                return Ok(CommandOutput::failed(
                    1,
                    "nginx: [alert] could not open error log file: open() \"/var/log/nginx/error.log\" failed (6: No such device or address)\n\
                     nginx: [emerg] host not found in upstream \"nowhere\"",
                ));
            }
            Ok(CommandOutput::ok(""))
        });
        let nginx = Nginx::new(Arc::new(test_config(dir.path())), Arc::new(runner.clone()));
        let host = proxy_host(1, "a.example.com", "nowhere", 8080);

        let meta = nginx.configure(&host).await.unwrap();

        assert_eq!(meta.nginx_online, Some(false));
        assert_eq!(
            meta.nginx_err.as_deref(),
            Some("nginx: [emerg] host not found in upstream \"nowhere\"")
        );
        assert!(!nginx.generator.config_path_for(HostType::ProxyHost, 1).exists());
        assert_eq!(runner.command_lines().last().unwrap(), "nginx -s reload");
    }

    #[tokio::test]
    async fn test_configure_refuses_broken_tree() {
        let dir = tempdir().unwrap();
        let runner = RecordingRunner::new(|_| Ok(CommandOutput::failed(1, "broken")));
        let nginx = Nginx::new(Arc::new(test_config(dir.path())), Arc::new(runner.clone()));

        let err = nginx
            .configure(&proxy_host(1, "a.example.com", "10.0.0.5", 8080))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ExternalTool { .. }));
        assert!(!nginx.generator.config_path_for(HostType::ProxyHost, 1).exists());
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn test_filter_error_output() {
        let output = "line one\nnginx: [alert] open() \"/var/log/nginx/error.log\" failed\nline two";
        assert_eq!(filter_error_output(output), "line one\nline two");
    }
}
