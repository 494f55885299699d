mod entity;

pub use entity::{Agent, Task, TaskStatus, UnknownTaskStatus};

/// A container the orchestrator believes is running and serving on `host:port`.
///
/// NOTE: Never persisted. The container runtime is the source of truth and the handle is
/// re-derived on every orchestration request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ContainerHandle {
    pub name: String,
    pub port: u16,
    pub host: String,
}

impl ContainerHandle {
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeReason {
    NotInstalled,
    NotRunning,
    Ok,
    Unexpected,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RuntimeStatus {
    pub ok: bool,
    pub reason: RuntimeReason,
    pub message: String,
}

impl RuntimeStatus {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            reason: RuntimeReason::Ok,
            message: message.into(),
        }
    }

    pub fn failed(reason: RuntimeReason, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason,
            message: message.into(),
        }
    }
}

/// Normalized outcome of one outbound HTTP call, before entity mapping.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl GatewayResponse {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            status_code: None,
        }
    }

    /// Looks up a top-level field of an object body.
    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.as_ref().and_then(|d| d.get(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_endpoint_uses_host_and_port() {
        let h = ContainerHandle {
            name: "acme-svc-mcp-container".to_string(),
            port: 5000,
            host: "127.0.0.1".to_string(),
        };
        assert_eq!(h.endpoint(), "http://127.0.0.1:5000");
    }

    #[test]
    fn runtime_reason_serializes_screaming_case() {
        let st = RuntimeStatus::failed(RuntimeReason::NotInstalled, "install docker");
        let v = serde_json::to_value(&st).unwrap();
        assert_eq!(v["reason"], "NOT_INSTALLED");
        assert_eq!(v["ok"], false);
    }

    #[test]
    fn gateway_response_skips_absent_fields() {
        let r = GatewayResponse::failure("boom");
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v, serde_json::json!({ "success": false, "error": "boom" }));
    }
}
