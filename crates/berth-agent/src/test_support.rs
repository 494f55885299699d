//! In-process fakes for the runtime and port seams, plus a tiny HTTP service harness.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;

use crate::port_alloc::PortProbe;
use crate::runtime::{ContainerRuntime, RunSpec};

#[derive(Debug)]
pub struct FakeState {
    pub installed: bool,
    pub daemon_up: bool,
    pub fail_probe: Option<String>,
    pub fail_ps: bool,
    pub fail_run: bool,
    /// `run` exits 0 but the container never shows up as running.
    pub crash_on_start: bool,
    /// `stop`/`rm` succeed but the container keeps running.
    pub sticky: bool,
    pub report_ports: bool,
    pub run_delay: Option<Duration>,
    /// name -> published host port
    pub running: BTreeMap<String, u16>,
    pub runs: Vec<RunSpec>,
    pub calls: Vec<String>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            installed: true,
            daemon_up: true,
            fail_probe: None,
            fail_ps: false,
            fail_run: false,
            crash_on_start: false,
            sticky: false,
            report_ports: true,
            run_delay: None,
            running: BTreeMap::new(),
            runs: Vec::new(),
            calls: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeRuntime {
    inner: Arc<Mutex<FakeState>>,
}

impl FakeRuntime {
    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.inner.lock().unwrap()
    }

    pub fn calls_of(&self, verb: &str) -> usize {
        self.state().calls.iter().filter(|c| c.as_str() == verb).count()
    }

    fn record(&self, verb: &str) {
        self.state().calls.push(verb.to_string());
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn is_installed(&self) -> anyhow::Result<bool> {
        self.record("version");
        let st = self.state();
        if let Some(msg) = &st.fail_probe {
            anyhow::bail!("{msg}");
        }
        Ok(st.installed)
    }

    async fn is_daemon_up(&self) -> anyhow::Result<bool> {
        self.record("info");
        Ok(self.state().daemon_up)
    }

    async fn is_running(&self, name: &str) -> anyhow::Result<bool> {
        self.record("ps");
        let st = self.state();
        if st.fail_ps {
            anyhow::bail!("ps failed");
        }
        Ok(st.running.contains_key(name))
    }

    async fn published_port(
        &self,
        name: &str,
        _container_port: u16,
    ) -> anyhow::Result<Option<u16>> {
        self.record("port");
        let st = self.state();
        if !st.report_ports {
            return Ok(None);
        }
        Ok(st.running.get(name).copied())
    }

    async fn run(&self, spec: &RunSpec) -> anyhow::Result<()> {
        self.record("run");
        let delay = self.state().run_delay;
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let mut st = self.state();
        st.runs.push(spec.clone());
        if st.fail_run {
            anyhow::bail!("run failed: image not found");
        }
        if !st.crash_on_start {
            st.running.insert(spec.name.clone(), spec.host_port);
        }
        Ok(())
    }

    async fn stop(&self, name: &str) -> anyhow::Result<()> {
        self.record("stop");
        let mut st = self.state();
        if !st.sticky {
            st.running.remove(name);
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> anyhow::Result<()> {
        self.record("rm");
        let mut st = self.state();
        if !st.sticky {
            st.running.remove(name);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakePorts {
    occupied: Arc<Mutex<BTreeSet<u16>>>,
}

impl FakePorts {
    pub fn occupied(ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            occupied: Arc::new(Mutex::new(ports.into_iter().collect())),
        }
    }
}

#[async_trait]
impl PortProbe for FakePorts {
    async fn is_port_available(&self, port: u16) -> bool {
        port != 0 && !self.occupied.lock().unwrap().contains(&port)
    }
}

/// Serves `router` on an ephemeral loopback port and returns its address.
pub async fn serve(router: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

pub fn temp_dir_for(test_name: &str) -> std::path::PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let mut dir = std::env::temp_dir();
    dir.push(format!(
        "berth-agent-{test_name}-{}-{n}-{ts}",
        std::process::id()
    ));
    dir
}
