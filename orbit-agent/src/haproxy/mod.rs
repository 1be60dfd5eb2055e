//! Load-balancer reconciler
//!
//! A hard converge renders the desired configuration, validates it with the
//! HAProxy binary, backs up and atomically replaces the live file, syncs
//! backends over the admin socket and reloads when it has to. A soft sync
//! only touches server states over the admin socket.

mod admin;
mod render;

use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{error, info};

use orbit_core::config::HAProxyConfig;
use orbit_core::model::{HAProxyConfiguration, IntegrityError};

pub use admin::{AdminSocket, SoftUpdate, sync_backends};
#[cfg(test)]
pub(crate) use admin::mock;
pub use render::render;

const CONFIG_MODE: u32 = 0o664;

#[derive(Debug, thiserror::Error)]
pub enum HaproxyError {
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error("invalid haproxy configuration: {stderr}")]
    InvalidConfiguration { stderr: String },
    #[error("failed to back up {path}: {source}")]
    Backup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("reload command `{command}` failed: {stderr}")]
    Reload { command: String, stderr: String },
    #[error("admin socket: {0}")]
    Socket(#[from] io::Error),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ConvergeOutcome {
    /// The live file was replaced
    pub written: bool,
    pub reloaded: bool,
    pub soft: SoftUpdate,
}

#[derive(Default)]
struct Applied {
    // last configuration a hard converge fully applied
    config: Option<HAProxyConfiguration>,
    // a reload was due but has not succeeded yet
    reload_pending: bool,
}

pub struct HaproxyReconciler {
    settings: HAProxyConfig,
    socket: AdminSocket,
    // serializes converges
    applied: Mutex<Applied>,
}

impl HaproxyReconciler {
    pub fn new(settings: HAProxyConfig) -> Self {
        let socket = AdminSocket::new(&settings.socket_path);
        Self {
            settings,
            socket,
            applied: Mutex::new(Applied::default()),
        }
    }

    pub fn settings(&self) -> &HAProxyConfig {
        &self.settings
    }

    pub async fn soft_sync(&self, desired: &HAProxyConfiguration) -> Result<SoftUpdate, HaproxyError> {
        Ok(sync_backends(&self.socket, desired).await?)
    }

    pub async fn converge(
        &self,
        desired: &HAProxyConfiguration,
    ) -> Result<ConvergeOutcome, HaproxyError> {
        let mut applied = self.applied.lock().await;
        let rendered = render(desired)?;
        let path = self.settings.config_file();

        let current = match tokio::fs::read(&path).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(source) => return Err(HaproxyError::Write { path, source }),
        };

        let mut outcome = ConvergeOutcome::default();
        if current.as_deref() != Some(rendered.as_bytes()) {
            self.validate(&rendered).await?;
            backup(&path).await?;
            write_atomically(&path, &rendered).await?;
            info!(path = %path.display(), "wrote haproxy configuration");
            outcome.written = true;
        }

        let global_changed = match applied.config.as_ref() {
            Some(previous) => previous.global_section != desired.global_section,
            None => outcome.written,
        };
        if global_changed {
            applied.reload_pending = true;
        }

        outcome.soft = self.soft_sync(desired).await?;
        if applied.reload_pending || outcome.soft.restart_required {
            self.reload().await?;
            applied.reload_pending = false;
            outcome.reloaded = true;
        }

        applied.config = Some(desired.clone());
        Ok(outcome)
    }

    async fn validate(&self, rendered: &str) -> Result<(), HaproxyError> {
        let content = rendered.to_string();
        let candidate = blocking(move || {
            let mut file = tempfile::Builder::new()
                .prefix("haproxy-")
                .suffix(".cfg")
                .tempfile()?;
            file.write_all(content.as_bytes())?;
            file.flush()?;
            Ok(file)
        })
        .await
        .map_err(|source| HaproxyError::Write {
            path: std::env::temp_dir(),
            source,
        })?;

        let output = Command::new(&self.settings.binary)
            .arg("-c")
            .arg("-f")
            .arg(candidate.path())
            .output()
            .await
            .map_err(|source| HaproxyError::Spawn {
                command: self.settings.binary.display().to_string(),
                source,
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        error!(config = %rendered, %stderr, "haproxy rejected configuration");
        Err(HaproxyError::InvalidConfiguration { stderr })
    }

    async fn reload(&self) -> Result<(), HaproxyError> {
        let command = &self.settings.reload_command;
        info!(%command, "reloading haproxy");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|source| HaproxyError::Spawn {
                command: command.clone(),
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(HaproxyError::Reload {
                command: command.clone(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }
}

/// Hard-links the live file to `<path>-<RFC3339>`; nothing to back up is fine
async fn backup(path: &Path) -> Result<(), HaproxyError> {
    let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
    let target = PathBuf::from(format!("{}-{}", path.display(), stamp));
    match tokio::fs::hard_link(path, &target).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(HaproxyError::Backup {
            path: path.to_path_buf(),
            source,
        }),
    }
}

async fn blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .unwrap_or_else(|e| Err(io::Error::other(e)))
}

async fn write_atomically(path: &Path, content: &str) -> Result<(), HaproxyError> {
    let target = path.to_path_buf();
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let content = content.to_string();

    blocking(move || {
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(content.as_bytes())?;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(CONFIG_MODE))?;
        file.as_file().sync_all()?;
        file.persist(&target).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|source| HaproxyError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use orbit_core::model::{EndpointInfo, HAProxyEndpoint};

    use super::admin::mock::{MockSocket, stat_csv};
    use super::*;

    struct Fixture {
        dir: tempfile::TempDir,
        mock: MockSocket,
    }

    impl Fixture {
        fn new(rows: &[(&str, &str, &str)]) -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                mock: MockSocket::start(stat_csv(rows)),
            }
        }

        fn settings(&self, binary: &str) -> HAProxyConfig {
            HAProxyConfig {
                binary: PathBuf::from(binary),
                config_path: self.dir.path().to_path_buf(),
                config_name: "haproxy.cfg".into(),
                socket_path: self.mock.path.clone(),
                reload_command: format!("touch {}", self.reload_marker().display()),
                no_updates_delay_window_secs: 5,
                max_delay_secs: 60,
            }
        }

        fn reload_marker(&self) -> PathBuf {
            self.dir.path().join("reloaded")
        }

        fn config_file(&self) -> PathBuf {
            self.dir.path().join("haproxy.cfg")
        }

        fn backups(&self) -> usize {
            std::fs::read_dir(self.dir.path())
                .unwrap()
                .filter(|e| {
                    e.as_ref()
                        .unwrap()
                        .file_name()
                        .to_string_lossy()
                        .starts_with("haproxy.cfg-")
                })
                .count()
        }
    }

    fn desired(global: &str) -> HAProxyConfiguration {
        let mut web = HAProxyEndpoint::listen("web", "0.0.0.0:80", "mode http");
        web.backend_servers
            .insert("10.0.0.1:8080".into(), EndpointInfo::default());
        HAProxyConfiguration {
            global_section: global.into(),
            endpoints: BTreeMap::from([("web".to_string(), web)]),
        }
    }

    #[tokio::test]
    async fn test_second_converge_changes_nothing() {
        let fixture = Fixture::new(&[("web", "web-10.0.0.1:8080", "UP")]);
        let reconciler = HaproxyReconciler::new(fixture.settings("true"));

        let first = reconciler.converge(&desired("global\n")).await.unwrap();
        assert!(first.written);
        assert!(first.reloaded);
        let content = std::fs::read(fixture.config_file()).unwrap();
        let mode = std::fs::metadata(fixture.config_file()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, CONFIG_MODE);

        std::fs::remove_file(fixture.reload_marker()).unwrap();
        let second = reconciler.converge(&desired("global\n")).await.unwrap();
        assert_eq!(second, ConvergeOutcome::default());
        assert_eq!(std::fs::read(fixture.config_file()).unwrap(), content);
        assert!(!fixture.reload_marker().exists());
        assert!(fixture.mock.commands().is_empty());
    }

    #[tokio::test]
    async fn test_global_change_backs_up_and_reloads() {
        let fixture = Fixture::new(&[("web", "web-10.0.0.1:8080", "UP")]);
        let reconciler = HaproxyReconciler::new(fixture.settings("true"));

        reconciler.converge(&desired("global\n")).await.unwrap();
        assert_eq!(fixture.backups(), 0);

        let outcome = reconciler
            .converge(&desired("global\n\tmaxconn 100\n"))
            .await
            .unwrap();
        assert!(outcome.written);
        assert!(outcome.reloaded);
        assert_eq!(fixture.backups(), 1);
        let content = std::fs::read_to_string(fixture.config_file()).unwrap();
        assert!(content.starts_with("global\n\tmaxconn 100\n"));
    }

    #[tokio::test]
    async fn test_rejected_configuration_leaves_file_untouched() {
        let fixture = Fixture::new(&[]);
        std::fs::write(fixture.config_file(), "previous").unwrap();
        let reconciler = HaproxyReconciler::new(fixture.settings("false"));

        let err = reconciler.converge(&desired("global\n")).await.unwrap_err();
        assert!(matches!(err, HaproxyError::InvalidConfiguration { .. }));
        assert_eq!(
            std::fs::read_to_string(fixture.config_file()).unwrap(),
            "previous"
        );
        assert!(!fixture.reload_marker().exists());
    }

    #[tokio::test]
    async fn test_missing_server_forces_reload() {
        let fixture = Fixture::new(&[("web", "web-10.0.0.9:8080", "UP")]);
        let settings = fixture.settings("true");
        std::fs::write(fixture.config_file(), render(&desired("g")).unwrap()).unwrap();
        let reconciler = HaproxyReconciler::new(settings);

        let outcome = reconciler.converge(&desired("g")).await.unwrap();
        assert!(!outcome.written);
        assert!(outcome.soft.restart_required);
        assert!(outcome.reloaded);
        assert!(fixture.reload_marker().exists());
        assert_eq!(fixture.mock.commands(), vec!["disable server web/web-10.0.0.9:8080"]);
    }

    #[tokio::test]
    async fn test_failed_reload_is_retried() {
        let fixture = Fixture::new(&[("web", "web-10.0.0.1:8080", "UP")]);
        let mut settings = fixture.settings("true");
        let armed = fixture.dir.path().join("armed");
        // fails the first time only
        settings.reload_command = format!(
            "test -e {armed} || {{ touch {armed}; exit 1; }}; touch {marker}",
            armed = armed.display(),
            marker = fixture.reload_marker().display()
        );
        let reconciler = HaproxyReconciler::new(settings);

        let err = reconciler.converge(&desired("global\n")).await.unwrap_err();
        assert!(matches!(err, HaproxyError::Reload { .. }));
        assert!(!fixture.reload_marker().exists());

        let retry = reconciler.converge(&desired("global\n")).await.unwrap();
        assert!(!retry.written);
        assert!(retry.reloaded);
        assert!(fixture.reload_marker().exists());

        std::fs::remove_file(fixture.reload_marker()).unwrap();
        let settled = reconciler.converge(&desired("global\n")).await.unwrap();
        assert!(!settled.reloaded);
        assert!(!fixture.reload_marker().exists());
    }
}
