use std::sync::Arc;

use berth_model::{Agent, ContainerHandle, RuntimeStatus, Task, TaskStatus};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::AgentConfig;
use crate::error::BerthError;
use crate::gateway::ResilientHttpGateway;
use crate::logs::LogBuffer;
use crate::orchestrator::ContainerOrchestrator;
use crate::port_alloc::PortProbe;
use crate::runtime::ContainerRuntime;
use crate::runtime_probe::check_runtime_status;
use crate::ttl_store::TtlStore;

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupHealth {
    pub runtime: RuntimeStatus,
    pub container: Option<ContainerHandle>,
    pub service_up: bool,
    pub endpoint: Option<String>,
    pub store_entries: usize,
}

/// Entry points behind the tool surface. Every remote operation first makes sure the
/// backing container is running and answering.
pub struct Backend {
    cfg: AgentConfig,
    orchestrator: ContainerOrchestrator,
    store: Arc<Mutex<TtlStore>>,
    logs: LogBuffer,
}

impl Backend {
    pub fn new(
        cfg: AgentConfig,
        runtime: Arc<dyn ContainerRuntime>,
        ports: Arc<dyn PortProbe>,
        store: TtlStore,
        logs: LogBuffer,
    ) -> Self {
        let orchestrator = ContainerOrchestrator::new(
            runtime,
            cfg.runtime_bin.clone(),
            ports,
            cfg.host.clone(),
            cfg.container_port,
            cfg.settle,
        );
        Self {
            cfg,
            orchestrator,
            store: Arc::new(Mutex::new(store)),
            logs,
        }
    }

    pub async fn open(
        cfg: AgentConfig,
        runtime: Arc<dyn ContainerRuntime>,
        ports: Arc<dyn PortProbe>,
        logs: LogBuffer,
    ) -> anyhow::Result<Self> {
        let store = TtlStore::open(&cfg.store_dir, cfg.task_ttl).await?;
        tracing::info!(
            path = %store.path().display(),
            tasks = store.len(),
            ttl_secs = cfg.task_ttl.as_secs(),
            "task store ready"
        );
        Ok(Self::new(cfg, runtime, ports, store, logs))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.cfg
    }

    fn gateway_for(&self, handle: &ContainerHandle) -> Result<ResilientHttpGateway, BerthError> {
        let gw = ResilientHttpGateway::new(&handle.endpoint())
            .map_err(|e| BerthError::InvalidArgument(format!("{e:#}")))?;
        Ok(gw
            .with_health_path(self.cfg.health_path.clone())
            .with_retry(self.cfg.retries, self.cfg.retry_interval))
    }

    /// Runtime check, then start-or-reuse the container, then wait for the service to answer.
    pub async fn ensure_backing_service(&self) -> Result<ResilientHttpGateway, BerthError> {
        let status = check_runtime_status(self.orchestrator.runtime(), &self.cfg.runtime_bin).await;
        if !status.ok {
            tracing::warn!(reason = ?status.reason, "container runtime unavailable");
            return Err(BerthError::RuntimeUnavailable(status));
        }

        let handle = self
            .orchestrator
            .ensure_running(
                &self.cfg.image,
                self.cfg.preferred_port,
                &self.cfg.runtime_args,
                &self.cfg.user,
            )
            .await?;

        let gw = self.gateway_for(&handle)?;
        let timeout_secs = i64::try_from(self.cfg.ready_timeout_secs).unwrap_or(i64::MAX);
        if !gw.is_up(timeout_secs).await? {
            return Err(BerthError::ServiceUnreachable {
                endpoint: handle.endpoint(),
                timeout_secs: self.cfg.ready_timeout_secs,
            });
        }
        Ok(gw)
    }

    pub async fn list_agents(&self, tag: Option<&str>) -> Result<Vec<String>, BerthError> {
        let gw = self.ensure_backing_service().await?;
        gw.get_agent_names(tag).await
    }

    pub async fn get_agent_config(&self, name: &str) -> Result<Agent, BerthError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(BerthError::InvalidArgument("agent name is required".to_string()));
        }
        let gw = self.ensure_backing_service().await?;
        gw.get_agent_config(name).await
    }

    /// Submits `config`, remembers the new id with its config, and echoes a `PENDING` task.
    /// A store write failure is logged, not returned.
    pub async fn create_task(&self, config: Value) -> Result<Task, BerthError> {
        if !config.is_object() {
            return Err(BerthError::InvalidArgument(
                "task config must be a JSON object".to_string(),
            ));
        }
        let gw = self.ensure_backing_service().await?;
        let id = gw.create_task(&config).await?;

        let agents = config
            .get("agents")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        // The task exists remotely either way; the caller must still learn its id.
        if let Err(e) = self.store.lock().await.set(id.clone(), config).await {
            tracing::warn!(
                task_id = %id,
                error = %format!("{e:#}"),
                "task created but not remembered; get_task will report it stale"
            );
        } else {
            tracing::info!(task_id = %id, "task created");
        }
        Ok(Task::pending(id, agents))
    }

    pub async fn get_task(&self, id: &str) -> Result<Task, BerthError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(BerthError::InvalidArgument("task id is required".to_string()));
        }
        if !self.store.lock().await.contains(id).await {
            return Err(BerthError::StaleReference { id: id.to_string() });
        }
        let gw = self.ensure_backing_service().await?;
        match gw.get_task(id).await {
            Err(e @ BerthError::Remote { status: Some(404), .. }) => {
                // The service no longer knows it; stop treating it as ours.
                if let Err(del_err) = self.store.lock().await.del(id).await {
                    tracing::warn!(task_id = %id, error = %format!("{del_err:#}"), "failed to forget task");
                }
                Err(e)
            }
            other => other,
        }
    }

    /// Remote tasks this process created and still remembers, optionally narrowed by status.
    pub async fn list_tasks(&self, status: Option<&str>) -> Result<Vec<Task>, BerthError> {
        let wanted = match status.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => Some(
                raw.parse::<TaskStatus>()
                    .map_err(|e| BerthError::InvalidArgument(e.to_string()))?,
            ),
            None => None,
        };

        let gw = self.ensure_backing_service().await?;
        let tasks = gw.get_tasks().await?;

        let mut store = self.store.lock().await;
        let mut out = Vec::new();
        for task in tasks {
            if wanted.is_some_and(|w| w != task.status) {
                continue;
            }
            if store.contains(&task.id).await {
                out.push(task);
            }
        }
        Ok(out)
    }

    pub fn recent_logs(&self, limit: usize) -> Vec<String> {
        self.logs.recent(limit)
    }

    /// Lines after `cursor` (0 = most recent) and the cursor to continue from.
    pub fn log_tail(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        self.logs.tail_after(cursor, limit)
    }

    /// Read-only snapshot: never starts the container.
    pub async fn setup_health(&self) -> SetupHealth {
        let runtime = check_runtime_status(self.orchestrator.runtime(), &self.cfg.runtime_bin).await;
        let container = if runtime.ok {
            self.orchestrator
                .current(&self.cfg.image, self.cfg.preferred_port)
                .await
        } else {
            None
        };

        let service_up = match &container {
            Some(handle) => match self.gateway_for(handle) {
                Ok(gw) => gw.is_up(0).await.unwrap_or(false),
                Err(_) => false,
            },
            None => false,
        };

        SetupHealth {
            runtime,
            endpoint: container.as_ref().map(ContainerHandle::endpoint),
            container,
            service_up,
            store_entries: self.store.lock().await.len(),
        }
    }

    pub async fn stop_backing_service(&self) -> bool {
        self.orchestrator.stop_and_remove(&self.cfg.image).await
    }
}
