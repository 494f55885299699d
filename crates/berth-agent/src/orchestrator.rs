use std::{collections::HashMap, sync::Arc, time::Duration};

use berth_model::{ContainerHandle, RuntimeReason, RuntimeStatus};
use tokio::sync::Mutex;

use crate::error::BerthError;
use crate::port_alloc::{self, PortProbe};
use crate::runtime::{ContainerRuntime, RunSpec};

const CONTAINER_SUFFIX: &str = "-mcp-container";

/// `acme/svc:1.2` -> `acme-svc-mcp-container`. The tag is everything after the first `:`.
pub fn container_identity(image: &str) -> String {
    let base = image.split(':').next().unwrap_or(image);
    format!("{}{CONTAINER_SUFFIX}", base.replace('/', "-"))
}

#[derive(Clone)]
pub struct ContainerOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    runtime_bin: String,
    ports: Arc<dyn PortProbe>,
    host: String,
    container_port: u16,
    settle: Duration,
    // One gate per container identity; concurrent callers queue behind the in-flight attempt.
    inflight: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ContainerOrchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        runtime_bin: impl Into<String>,
        ports: Arc<dyn PortProbe>,
        host: impl Into<String>,
        container_port: u16,
        settle: Duration,
    ) -> Self {
        Self {
            runtime,
            runtime_bin: runtime_bin.into(),
            ports,
            host: host.into(),
            container_port,
            settle,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn runtime(&self) -> &dyn ContainerRuntime {
        self.runtime.as_ref()
    }

    fn start_failed(&self, name: String) -> BerthError {
        BerthError::StartFailed {
            name,
            runtime: self.runtime_bin.clone(),
        }
    }

    async fn gate(&self, name: &str) -> Arc<Mutex<()>> {
        let mut map = self.inflight.lock().await;
        map.entry(name.to_string()).or_default().clone()
    }

    fn handle(&self, name: &str, port: u16) -> ContainerHandle {
        ContainerHandle {
            name: name.to_string(),
            port,
            host: self.host.clone(),
        }
    }

    /// Handle for an already-running container, using the port the runtime actually
    /// published. Falls back to `assumed_port` only when the runtime cannot tell.
    async fn running_handle(&self, name: &str, assumed_port: u16) -> ContainerHandle {
        let port = match self.runtime.published_port(name, self.container_port).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                tracing::warn!(container = %name, assumed_port, "published port unknown; assuming requested port");
                assumed_port
            }
            Err(e) => {
                tracing::warn!(container = %name, assumed_port, error = %format!("{e:#}"), "port lookup failed; assuming requested port");
                assumed_port
            }
        };
        self.handle(name, port)
    }

    async fn select_port(&self, preferred: u16) -> Option<u16> {
        if self.ports.is_port_available(preferred).await {
            return Some(preferred);
        }
        let next = preferred.checked_add(1)?;
        port_alloc::find_available_port(self.ports.as_ref(), next, u16::MAX).await
    }

    /// Read-only lookup: the handle of the running container for `image`, if any.
    pub async fn current(&self, image: &str, assumed_port: u16) -> Option<ContainerHandle> {
        let name = container_identity(image);
        match self.runtime.is_running(&name).await {
            Ok(true) => Some(self.running_handle(&name, assumed_port).await),
            Ok(false) => None,
            Err(e) => {
                tracing::warn!(container = %name, error = %format!("{e:#}"), "running check failed");
                None
            }
        }
    }

    /// Ensures the container for `image` is running and returns its handle. Every failure
    /// is logged and returned as a value: runtime errors never escape as anything else.
    pub async fn ensure_running(
        &self,
        image: &str,
        preferred_port: u16,
        runtime_extra_args: &[String],
        user: &str,
    ) -> Result<ContainerHandle, BerthError> {
        let name = container_identity(image);
        let gate = self.gate(&name).await;
        let _guard = gate.lock().await;

        match self.runtime.is_running(&name).await {
            Ok(true) => {
                let handle = self.running_handle(&name, preferred_port).await;
                tracing::debug!(container = %name, port = handle.port, "container already running");
                return Ok(handle);
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(container = %name, error = %format!("{e:#}"), "running check failed");
                return Err(BerthError::RuntimeUnavailable(RuntimeStatus::failed(
                    RuntimeReason::Unexpected,
                    format!("{e:#}"),
                )));
            }
        }

        let Some(port) = self.select_port(preferred_port).await else {
            tracing::warn!(container = %name, preferred_port, "no free port available");
            return Err(BerthError::PortExhausted {
                start: preferred_port,
            });
        };
        if port != preferred_port {
            tracing::info!(container = %name, preferred_port, port, "preferred port busy; using fallback");
        }

        // Free the name from any exited container left behind by an earlier run.
        if let Err(e) = self.runtime.remove(&name).await {
            tracing::debug!(container = %name, error = %format!("{e:#}"), "stale container cleanup failed");
        }

        let spec = RunSpec {
            name: name.clone(),
            image: image.to_string(),
            user: user.to_string(),
            host_port: port,
            container_port: self.container_port,
            extra_args: runtime_extra_args.to_vec(),
        };
        tracing::info!(container = %name, image, port, "starting container");
        if let Err(e) = self.runtime.run(&spec).await {
            tracing::error!(container = %name, error = %format!("{e:#}"), "container start failed");
            return Err(self.start_failed(name));
        }

        // `run` can exit 0 while the container crash-loops; confirm after settling.
        tokio::time::sleep(self.settle).await;
        match self.runtime.is_running(&name).await {
            Ok(true) => {
                tracing::info!(container = %name, port, "container running");
                Ok(self.handle(&name, port))
            }
            Ok(false) => {
                tracing::error!(container = %name, "container exited right after start");
                Err(self.start_failed(name))
            }
            Err(e) => {
                tracing::error!(container = %name, error = %format!("{e:#}"), "post-start verification failed");
                Err(self.start_failed(name))
            }
        }
    }

    /// Stops and removes the container for `image`. Returns whether it is confirmed gone.
    pub async fn stop_and_remove(&self, image: &str) -> bool {
        let name = container_identity(image);
        let gate = self.gate(&name).await;
        let _guard = gate.lock().await;

        match self.runtime.is_running(&name).await {
            Ok(false) => return true,
            Ok(true) => {}
            Err(e) => {
                tracing::error!(container = %name, error = %format!("{e:#}"), "running check failed");
                return false;
            }
        }

        tracing::info!(container = %name, "stopping container");
        if let Err(e) = self.runtime.stop(&name).await {
            tracing::warn!(container = %name, error = %format!("{e:#}"), "stop failed");
        }
        if let Err(e) = self.runtime.remove(&name).await {
            tracing::warn!(container = %name, error = %format!("{e:#}"), "remove failed");
        }

        match self.runtime.is_running(&name).await {
            Ok(false) => {
                tracing::info!(container = %name, "container stopped");
                true
            }
            Ok(true) => {
                tracing::error!(container = %name, "container still running after stop");
                false
            }
            Err(e) => {
                tracing::error!(container = %name, error = %format!("{e:#}"), "post-stop verification failed");
                false
            }
        }
    }
}
