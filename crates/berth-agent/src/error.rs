use berth_model::RuntimeStatus;

#[derive(Debug, thiserror::Error)]
pub enum BerthError {
    #[error("container runtime unavailable: {}", .0.message)]
    RuntimeUnavailable(RuntimeStatus),

    #[error("no free port found at or above {start}")]
    PortExhausted { start: u16 },

    #[error("container {name} did not start")]
    StartFailed { name: String, runtime: String },

    #[error("backing service at {endpoint} did not become ready within {timeout_secs}s")]
    ServiceUnreachable { endpoint: String, timeout_secs: u64 },

    #[error("remote error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Remote { message: String, status: Option<u16> },

    #[error("task {id} is unknown or expired")]
    StaleReference { id: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl BerthError {
    pub fn code(&self) -> &'static str {
        match self {
            BerthError::RuntimeUnavailable(_) => "RUNTIME_UNAVAILABLE",
            BerthError::PortExhausted { .. } => "PORT_EXHAUSTED",
            BerthError::StartFailed { .. } => "START_FAILED",
            BerthError::ServiceUnreachable { .. } => "SERVICE_UNREACHABLE",
            BerthError::Remote { .. } => "REMOTE_ERROR",
            BerthError::StaleReference { .. } => "STALE_REFERENCE",
            BerthError::InvalidArgument(_) => "INVALID_ARGUMENT",
        }
    }

    /// Remediation shown next to the message at the tool boundary.
    pub fn hint(&self) -> Option<String> {
        match self {
            BerthError::RuntimeUnavailable(st) => Some(format!("{:?}: {}", st.reason, st.message)),
            BerthError::PortExhausted { .. } => {
                Some("free a local port or set BERTH_PORT to another range".to_string())
            }
            BerthError::StartFailed { name, runtime } => Some(format!(
                "inspect the container output with `{runtime} logs {name}`"
            )),
            BerthError::ServiceUnreachable { .. } => Some(
                "the container is up but the service is not answering; raise BERTH_READY_TIMEOUT_SECS"
                    .to_string(),
            ),
            BerthError::StaleReference { .. } => {
                Some("only tasks created by this agent within the TTL can be queried".to_string())
            }
            BerthError::Remote { .. } | BerthError::InvalidArgument(_) => None,
        }
    }

    /// Orchestration failures that may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BerthError::PortExhausted { .. }
                | BerthError::StartFailed { .. }
                | BerthError::ServiceUnreachable { .. }
        )
    }
}
