//! HAProxy admin socket: one connection per command

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{info, warn};

use orbit_core::model::HAProxyConfiguration;

const COL_SECTION: usize = 0;
const COL_SERVER: usize = 1;
const COL_STATUS: usize = 17;

/// `section -> server -> status` as reported by `show stat`
pub type StatTable = BTreeMap<String, BTreeMap<String, String>>;

pub fn parse_stat(csv: &str) -> StatTable {
    let mut table = StatTable::new();
    for line in csv.lines() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let columns: Vec<&str> = line.split(',').collect();
        let (Some(section), Some(server), Some(status)) = (
            columns.get(COL_SECTION),
            columns.get(COL_SERVER),
            columns.get(COL_STATUS),
        ) else {
            continue;
        };
        if *server == "FRONTEND" || *server == "BACKEND" {
            continue;
        }
        table
            .entry(section.to_string())
            .or_default()
            .insert(server.to_string(), status.to_string());
    }
    table
}

#[derive(Clone, Debug)]
pub struct AdminSocket {
    path: PathBuf,
}

impl AdminSocket {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn connect(&self) -> io::Result<UnixStream> {
        UnixStream::connect(&self.path).await
    }

    async fn dialog(mut stream: UnixStream, command: &str) -> io::Result<String> {
        stream.write_all(command.as_bytes()).await?;
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await?;
        Ok(reply)
    }

    pub async fn show_stat(&self) -> io::Result<StatTable> {
        let reply = Self::dialog(self.connect().await?, "show stat\n").await?;
        Ok(parse_stat(&reply))
    }

    pub async fn enable_server(&self, section: &str, server: &str) -> io::Result<()> {
        let command = format!("enable server {}/{}\n", section, server);
        Self::dialog(self.connect().await?, &command).await.map(|_| ())
    }

    pub async fn disable_server(&self, section: &str, server: &str) -> io::Result<()> {
        let command = format!("disable server {}/{}\n", section, server);
        Self::dialog(self.connect().await?, &command).await.map(|_| ())
    }
}

/// Outcome of a live backend sync
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SoftUpdate {
    /// The running process lacks a section or server; only a reload fixes it
    pub restart_required: bool,
    /// `section/server` pairs taken out of maintenance
    pub enabled: Vec<String>,
    /// `section/server` pairs put into maintenance
    pub disabled: Vec<String>,
}

fn desired_servers(config: &HAProxyConfiguration) -> BTreeMap<String, BTreeSet<String>> {
    config
        .endpoints
        .values()
        .map(|endpoint| {
            let servers = endpoint
                .backend_servers
                .keys()
                .map(|address| endpoint.server_name(address))
                .collect();
            (endpoint.name.clone(), servers)
        })
        .collect()
}

/// Enables desired servers in maintenance and disables live servers that
/// are no longer desired. Sections the running process lacks get no edits.
pub async fn sync_backends(
    socket: &AdminSocket,
    config: &HAProxyConfiguration,
) -> io::Result<SoftUpdate> {
    let current = match socket.show_stat().await {
        Ok(current) => current,
        Err(e) => {
            warn!(socket = %socket.path().display(), error = %e, "admin socket unavailable");
            return Ok(SoftUpdate {
                restart_required: true,
                ..Default::default()
            });
        }
    };

    let mut update = SoftUpdate::default();
    for (section, wanted) in desired_servers(config) {
        let Some(servers) = current.get(&section) else {
            update.restart_required = true;
            continue;
        };
        if wanted.iter().any(|server| !servers.contains_key(server)) {
            update.restart_required = true;
        }

        for (server, status) in servers {
            let in_maintenance = status.starts_with("MAINT");
            if wanted.contains(server) && in_maintenance {
                socket.enable_server(&section, server).await?;
                info!(%section, %server, "enabled server");
                update.enabled.push(format!("{}/{}", section, server));
            } else if !wanted.contains(server) && !in_maintenance {
                socket.disable_server(&section, server).await?;
                info!(%section, %server, "disabled server");
                update.disabled.push(format!("{}/{}", section, server));
            }
        }
    }
    Ok(update)
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    /// Fake admin socket: answers `show stat` from a fixed table and
    /// records every other command.
    pub struct MockSocket {
        pub commands: Arc<Mutex<Vec<String>>>,
        _dir: tempfile::TempDir,
        pub path: std::path::PathBuf,
    }

    pub fn stat_csv(rows: &[(&str, &str, &str)]) -> String {
        let mut csv = String::from("# pxname,svname,qcur,qmax,scur,smax,slim,stot,bin,bout,dreq,dresp,ereq,econ,eresp,wretr,wredis,status\n");
        for (section, server, status) in rows {
            csv.push_str(&format!(
                "{},{},0,0,0,0,,0,0,0,,0,,0,0,0,0,{},\n",
                section, server, status
            ));
        }
        csv
    }

    impl MockSocket {
        pub fn start(stat: String) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("haproxy.sock");
            let listener = UnixListener::bind(&path).unwrap();
            let commands = Arc::new(Mutex::new(Vec::new()));

            let recorded = commands.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let (read, mut write) = stream.into_split();
                    let mut line = String::new();
                    if BufReader::new(read).read_line(&mut line).await.is_err() {
                        continue;
                    }
                    let reply = if line == "show stat\n" {
                        stat.clone()
                    } else {
                        recorded.lock().unwrap().push(line.trim_end().to_string());
                        "\n".to_string()
                    };
                    let _ = write.write_all(reply.as_bytes()).await;
                }
            });

            Self {
                commands,
                _dir: dir,
                path,
            }
        }

        pub fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use orbit_core::model::{EndpointInfo, HAProxyEndpoint};

    use super::mock::{MockSocket, stat_csv};
    use super::*;

    fn desired(addresses: &[&str]) -> HAProxyConfiguration {
        let mut endpoint = HAProxyEndpoint::backend("svc", "balance roundrobin");
        for address in addresses {
            endpoint
                .backend_servers
                .insert(address.to_string(), EndpointInfo::default());
        }
        HAProxyConfiguration {
            global_section: String::new(),
            endpoints: BTreeMap::from([("svc".to_string(), endpoint)]),
        }
    }

    #[test]
    fn test_parse_skips_comments_and_aggregates() {
        let csv = stat_csv(&[
            ("stats", "FRONTEND", "OPEN"),
            ("svc", "svc-1.1.1.1:80", "MAINT"),
            ("svc", "svc-2.2.2.2:80", "UP"),
            ("svc", "BACKEND", "UP"),
        ]);
        let table = parse_stat(&csv);
        assert_eq!(table.len(), 1);
        assert_eq!(table["svc"]["svc-1.1.1.1:80"], "MAINT");
        assert_eq!(table["svc"]["svc-2.2.2.2:80"], "UP");
    }

    #[tokio::test]
    async fn test_soft_update_enables_disables_and_requests_restart() {
        let mock = MockSocket::start(stat_csv(&[
            ("svc", "svc-1.1.1.1:80", "MAINT"),
            ("svc", "svc-2.2.2.2:80", "UP"),
        ]));
        let socket = AdminSocket::new(&mock.path);

        let update = sync_backends(&socket, &desired(&["1.1.1.1:80", "3.3.3.3:80"]))
            .await
            .unwrap();

        assert!(update.restart_required);
        assert_eq!(
            mock.commands(),
            vec![
                "enable server svc/svc-1.1.1.1:80",
                "disable server svc/svc-2.2.2.2:80"
            ]
        );
    }

    #[tokio::test]
    async fn test_in_sync_backends_send_nothing() {
        let mock = MockSocket::start(stat_csv(&[
            ("svc", "svc-1.1.1.1:80", "UP"),
            ("svc", "svc-2.2.2.2:80", "MAINT (via svc/x)"),
        ]));
        let socket = AdminSocket::new(&mock.path);

        let update = sync_backends(&socket, &desired(&["1.1.1.1:80"])).await.unwrap();
        assert_eq!(update, SoftUpdate::default());
        assert!(mock.commands().is_empty());
    }

    #[tokio::test]
    async fn test_missing_socket_requires_restart() {
        let dir = tempfile::tempdir().unwrap();
        let socket = AdminSocket::new(dir.path().join("absent.sock"));
        let update = sync_backends(&socket, &desired(&[])).await.unwrap();
        assert!(update.restart_required);
    }
}
