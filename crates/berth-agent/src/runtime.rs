use std::{io, process::Output, process::Stdio, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use tokio::process::Command;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub user: String,
    pub host_port: u16,
    pub container_port: u16,
    /// Caller-supplied volume/env flags, passed through untouched.
    pub extra_args: Vec<String>,
}

/// Narrow view of the container runtime. The orchestrator only relies on exact-name
/// discovery of running containers and on `run` being observable after a short delay.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// `Ok(false)` when the binary is missing or refuses `--version`.
    async fn is_installed(&self) -> anyhow::Result<bool>;
    async fn is_daemon_up(&self) -> anyhow::Result<bool>;
    async fn is_running(&self, name: &str) -> anyhow::Result<bool>;
    async fn published_port(&self, name: &str, container_port: u16)
    -> anyhow::Result<Option<u16>>;
    async fn run(&self, spec: &RunSpec) -> anyhow::Result<()>;
    /// Succeeds when the container is already gone.
    async fn stop(&self, name: &str) -> anyhow::Result<()>;
    /// Succeeds when the container is already gone.
    async fn remove(&self, name: &str) -> anyhow::Result<()>;
}

/// Shells out to a docker-compatible CLI (`docker`, `podman`).
#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
}

impl DockerCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn output(&self, args: &[String]) -> io::Result<Output> {
        let mut cmd = Command::new(&self.bin);
        cmd.env_remove("DOCKER_API_VERSION")
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(COMMAND_TIMEOUT, cmd.output()).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} {} timed out", self.bin, args.join(" ")),
            )),
        }
    }

    async fn checked(&self, args: &[String]) -> anyhow::Result<Output> {
        let out = self
            .output(args)
            .await
            .with_context(|| format!("invoke {} {}", self.bin, args.join(" ")))?;
        if !out.status.success() {
            anyhow::bail!(
                "{} {} failed: {}",
                self.bin,
                args.first().map(String::as_str).unwrap_or_default(),
                stderr_of(&out)
            );
        }
        Ok(out)
    }
}

fn stderr_of(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).trim().to_string()
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn is_missing_container(stderr: &str) -> bool {
    let s = stderr.to_ascii_lowercase();
    s.contains("no such container") || s.contains("no container with name")
}

pub fn run_args(spec: &RunSpec) -> Vec<String> {
    let mut out = strings(&["run", "-d", "--name"]);
    out.push(spec.name.clone());
    out.push("--user".to_string());
    out.push(spec.user.clone());
    out.push("-p".to_string());
    out.push(format!("{}:{}", spec.host_port, spec.container_port));
    out.extend(spec.extra_args.iter().cloned());
    out.push(spec.image.clone());
    out
}

/// Parses `docker port` output such as `0.0.0.0:5001` / `[::]:5001`.
pub fn parse_published_port(stdout: &str) -> Option<u16> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .find_map(|l| l.rsplit(':').next()?.parse::<u16>().ok())
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn is_installed(&self) -> anyhow::Result<bool> {
        match self.output(&strings(&["--version"])).await {
            Ok(out) => Ok(out.status.success()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("invoke {} --version", self.bin)),
        }
    }

    async fn is_daemon_up(&self) -> anyhow::Result<bool> {
        let out = self
            .output(&strings(&["info"]))
            .await
            .with_context(|| format!("invoke {} info", self.bin))?;
        Ok(out.status.success())
    }

    async fn is_running(&self, name: &str) -> anyhow::Result<bool> {
        let args = vec![
            "ps".to_string(),
            "--filter".to_string(),
            format!("name={name}"),
            "--filter".to_string(),
            "status=running".to_string(),
            "--format".to_string(),
            "{{.Names}}".to_string(),
        ];
        let out = self.checked(&args).await?;
        // The name filter is a substring match; require an exact hit.
        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .any(|l| l.trim() == name))
    }

    async fn published_port(
        &self,
        name: &str,
        container_port: u16,
    ) -> anyhow::Result<Option<u16>> {
        let args = vec![
            "port".to_string(),
            name.to_string(),
            format!("{container_port}/tcp"),
        ];
        let out = self
            .output(&args)
            .await
            .with_context(|| format!("invoke {} port {name}", self.bin))?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(parse_published_port(&String::from_utf8_lossy(&out.stdout)))
    }

    async fn run(&self, spec: &RunSpec) -> anyhow::Result<()> {
        self.checked(&run_args(spec))
            .await
            .with_context(|| format!("start container {}", spec.name))?;
        Ok(())
    }

    async fn stop(&self, name: &str) -> anyhow::Result<()> {
        let out = self
            .output(&strings(&["stop", name]))
            .await
            .with_context(|| format!("invoke {} stop {name}", self.bin))?;
        if out.status.success() || is_missing_container(&stderr_of(&out)) {
            return Ok(());
        }
        anyhow::bail!("{} stop {name} failed: {}", self.bin, stderr_of(&out));
    }

    async fn remove(&self, name: &str) -> anyhow::Result<()> {
        let out = self
            .output(&strings(&["rm", "-f", name]))
            .await
            .with_context(|| format!("invoke {} rm {name}", self.bin))?;
        if out.status.success() || is_missing_container(&stderr_of(&out)) {
            return Ok(());
        }
        anyhow::bail!("{} rm {name} failed: {}", self.bin, stderr_of(&out));
    }
}
