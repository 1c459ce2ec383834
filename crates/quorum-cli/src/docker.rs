//! Artifact delivery channel backed by the Docker CLI.
//!
//! Nodes are containers named after their [`NodeSpec`]. Launch goes through
//! `docker compose up -d`, delivery through `docker cp`, restart through
//! `docker restart`, and gossip keys come from `consul keygen` run inside a
//! node.

use std::path::{Path, PathBuf};
use std::process::Output;

use quorum_core::backend::NodeChannel;
use quorum_core::cluster::NodeSpec;
use quorum_core::error::ChannelError;
use tokio::process::Command;
use tracing::debug;

/// Drives node containers with the `docker` binary.
#[derive(Debug, Clone)]
pub struct DockerChannel {
    docker: PathBuf,
    compose_file: PathBuf,
}

impl DockerChannel {
    #[must_use]
    pub fn new(compose_file: impl Into<PathBuf>) -> Self {
        Self {
            docker: PathBuf::from("docker"),
            compose_file: compose_file.into(),
        }
    }

    /// Use a different `docker`-compatible binary.
    #[must_use]
    pub fn with_binary(mut self, docker: impl Into<PathBuf>) -> Self {
        self.docker = docker.into();
        self
    }

    /// Run `docker <args>` and return its trimmed stdout.
    async fn docker(&self, args: &[&str]) -> Result<String, String> {
        debug!(args = ?args, "docker");
        let output = Command::new(&self.docker)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {e}", self.docker.display()))?;
        check(&output)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }
}

fn check(output: &Output) -> Result<(), String> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(match output.status.code() {
        Some(code) => format!("exit code {code}: {}", stderr.trim()),
        None => format!("terminated by signal: {}", stderr.trim()),
    })
}

/// Parent directory of a path on the node, if it has one.
fn remote_parent(remote: &str) -> Option<&str> {
    remote
        .rsplit_once('/')
        .map(|(parent, _)| parent)
        .filter(|p| !p.is_empty())
}

#[async_trait::async_trait]
impl NodeChannel for DockerChannel {
    async fn launch(&self, node: &NodeSpec) -> Result<(), ChannelError> {
        let compose = self.compose_file.to_string_lossy().into_owned();
        let result = if self.compose_file.exists() {
            self.docker(&["compose", "-f", compose.as_str(), "up", "-d", node.name.as_str()])
                .await
        } else {
            self.docker(&["start", node.name.as_str()]).await
        };
        result
            .map(|_| ())
            .map_err(|reason| ChannelError::LaunchFailed {
                node: node.name.clone(),
                reason,
            })
    }

    async fn deliver(
        &self,
        node: &NodeSpec,
        local: &Path,
        remote: &str,
    ) -> Result<(), ChannelError> {
        let failed = |reason: String| ChannelError::DeliveryFailed {
            node: node.name.clone(),
            remote_path: remote.to_owned(),
            reason,
        };
        if let Some(parent) = remote_parent(remote) {
            self.docker(&["exec", node.name.as_str(), "mkdir", "-p", parent])
                .await
                .map_err(failed)?;
        }
        let source = local.to_string_lossy().into_owned();
        let target = format!("{}:{remote}", node.name);
        self.docker(&["cp", source.as_str(), target.as_str()])
            .await
            .map(|_| ())
            .map_err(failed)
    }

    async fn restart(&self, node: &NodeSpec) -> Result<(), ChannelError> {
        self.docker(&["restart", node.name.as_str()])
            .await
            .map(|_| ())
            .map_err(|reason| ChannelError::RestartFailed {
                node: node.name.clone(),
                reason,
            })
    }

    async fn generate_gossip_key(&self, node: &NodeSpec) -> Result<String, ChannelError> {
        let key = self
            .docker(&["exec", node.name.as_str(), "consul", "keygen"])
            .await
            .map_err(|reason| ChannelError::KeygenFailed {
                node: node.name.clone(),
                reason,
            })?;
        if key.is_empty() {
            return Err(ChannelError::KeygenFailed {
                node: node.name.clone(),
                reason: "consul keygen printed nothing".to_owned(),
            });
        }
        Ok(key)
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn spec() -> NodeSpec {
        NodeSpec {
            ordinal: 1,
            name: "vault1".to_owned(),
            address: "http://vault1:8200".to_owned(),
        }
    }

    /// A fake `docker` that logs its arguments and runs `body`.
    fn fake_docker(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("docker");
        let log = dir.join("calls.log");
        let script = format!(
            "#!/bin/sh\necho \"$@\" >> '{}'\n{body}\n",
            log.display()
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn calls(dir: &Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    #[test]
    fn remote_parent_is_directory_part() {
        assert_eq!(remote_parent("/consul/config/tls/ca.crt"), Some("/consul/config/tls"));
        assert_eq!(remote_parent("/secure.json"), None);
        assert_eq!(remote_parent("secure.json"), None);
    }

    #[tokio::test]
    async fn deliver_creates_parent_then_copies() {
        let dir = tempfile::tempdir().unwrap();
        let channel = DockerChannel::new(dir.path().join("missing.yml"))
            .with_binary(fake_docker(dir.path(), "exit 0"));

        channel
            .deliver(&spec(), Path::new("/tmp/ca.crt"), "/consul/config/tls/ca.crt")
            .await
            .unwrap();

        assert_eq!(
            calls(dir.path()),
            vec![
                "exec vault1 mkdir -p /consul/config/tls".to_owned(),
                "cp /tmp/ca.crt vault1:/consul/config/tls/ca.crt".to_owned(),
            ]
        );
    }

    #[tokio::test]
    async fn launch_without_compose_file_starts_container() {
        let dir = tempfile::tempdir().unwrap();
        let channel = DockerChannel::new(dir.path().join("missing.yml"))
            .with_binary(fake_docker(dir.path(), "exit 0"));
        channel.launch(&spec()).await.unwrap();
        assert_eq!(calls(dir.path()), vec!["start vault1".to_owned()]);
    }

    #[tokio::test]
    async fn failing_restart_reports_node_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let channel = DockerChannel::new("docker-compose.yml")
            .with_binary(fake_docker(dir.path(), "echo 'no such container' >&2\nexit 1"));

        let err = channel.restart(&spec()).await.unwrap_err();
        match err {
            ChannelError::RestartFailed { node, reason } => {
                assert_eq!(node, "vault1");
                assert!(reason.contains("no such container"));
            }
            other => unreachable!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn gossip_key_is_trimmed_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let channel = DockerChannel::new("docker-compose.yml").with_binary(fake_docker(
            dir.path(),
            "echo 'pUqJrVyVRj5jsiYEkM/tFQYfWyJIv4s3XkvDwy7Cu5s='",
        ));
        let key = channel.generate_gossip_key(&spec()).await.unwrap();
        assert_eq!(key, "pUqJrVyVRj5jsiYEkM/tFQYfWyJIv4s3XkvDwy7Cu5s=");
    }
}
