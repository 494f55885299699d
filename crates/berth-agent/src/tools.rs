use serde_json::{Value, json};

use crate::backend::Backend;
use crate::error::BerthError;
use crate::error_payload;

const RECENT_LOG_LINES: usize = 20;
const DEFAULT_LOG_LIMIT: u64 = 100;
const MAX_LOG_LIMIT: u64 = 1000;

pub const TOOL_NAMES: &[&str] = &[
    "list_agents",
    "get_agent_config",
    "create_task",
    "get_task",
    "list_tasks",
    "get_logs",
    "check_setup",
    "stop_backing_service",
];

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub text: String,
    pub is_error: bool,
}

#[derive(Debug, serde::Deserialize)]
struct ToolRequest {
    #[serde(default)]
    id: Value,
    tool: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, serde::Serialize)]
struct TextContent {
    #[serde(rename = "type")]
    kind: &'static str,
    text: String,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolResponse {
    id: Value,
    content: Vec<TextContent>,
    is_error: bool,
}

fn arguments(args: &Value) -> Result<serde_json::Map<String, Value>, BerthError> {
    match args {
        Value::Null => Ok(serde_json::Map::new()),
        Value::Object(m) => Ok(m.clone()),
        _ => Err(BerthError::InvalidArgument(
            "arguments must be a JSON object".to_string(),
        )),
    }
}

fn opt_str<'a>(
    args: &'a serde_json::Map<String, Value>,
    key: &str,
) -> Result<Option<&'a str>, BerthError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(BerthError::InvalidArgument(format!("`{key}` must be a string"))),
    }
}

fn req_str<'a>(args: &'a serde_json::Map<String, Value>, key: &str) -> Result<&'a str, BerthError> {
    opt_str(args, key)?
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| BerthError::InvalidArgument(format!("`{key}` is required")))
}

async fn run(backend: &Backend, tool: &str, args: &Value) -> Result<Value, BerthError> {
    let args = arguments(args)?;
    match tool {
        "list_agents" => {
            let agents = backend.list_agents(opt_str(&args, "tag")?).await?;
            Ok(json!({ "agents": agents }))
        }
        "get_agent_config" => {
            let agent = backend.get_agent_config(req_str(&args, "name")?).await?;
            Ok(json!({ "agent": agent }))
        }
        "create_task" => {
            let config = args
                .get("config")
                .cloned()
                .ok_or_else(|| BerthError::InvalidArgument("`config` is required".to_string()))?;
            let task = backend.create_task(config).await?;
            Ok(json!(task))
        }
        "get_task" => {
            let task = backend.get_task(req_str(&args, "id")?).await?;
            Ok(json!(task))
        }
        "list_tasks" => {
            let tasks = backend.list_tasks(opt_str(&args, "status")?).await?;
            Ok(json!({ "tasks": tasks }))
        }
        "get_logs" => {
            let limit = match args.get("limit") {
                None | Some(Value::Null) => DEFAULT_LOG_LIMIT,
                Some(v) => v.as_u64().ok_or_else(|| {
                    BerthError::InvalidArgument("`limit` must be a non-negative integer".to_string())
                })?,
            };
            let after = match args.get("after") {
                None | Some(Value::Null) => 0,
                Some(v) => v.as_u64().ok_or_else(|| {
                    BerthError::InvalidArgument("`after` must be a log cursor".to_string())
                })?,
            };
            let (lines, cursor) =
                backend.log_tail(after, limit.clamp(1, MAX_LOG_LIMIT) as usize);
            Ok(json!({ "lines": lines, "cursor": cursor }))
        }
        "check_setup" => Ok(json!(backend.setup_health().await)),
        "stop_backing_service" => {
            let stopped = backend.stop_backing_service().await;
            Ok(json!({ "stopped": stopped }))
        }
        other => Err(BerthError::InvalidArgument(format!(
            "unknown tool `{other}`; expected one of {}",
            TOOL_NAMES.join(", ")
        ))),
    }
}

fn pretty(v: &Value) -> String {
    serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())
}

fn failure(backend: &Backend, tool: &str, err: &BerthError) -> ToolOutput {
    tracing::warn!(
        tool,
        code = err.code(),
        retryable = err.is_retryable(),
        error = %err,
        "tool call failed"
    );
    ToolOutput {
        text: error_payload::from_error(err, backend.recent_logs(RECENT_LOG_LINES)),
        is_error: true,
    }
}

pub async fn dispatch(backend: &Backend, tool: &str, args: &Value) -> ToolOutput {
    tracing::debug!(tool, "tool call");
    match run(backend, tool, args).await {
        Ok(v) => ToolOutput {
            text: pretty(&v),
            is_error: false,
        },
        Err(e) => failure(backend, tool, &e),
    }
}

/// One request line in, one response line out. Malformed input still yields a response.
pub async fn handle_line(backend: &Backend, line: &str) -> String {
    let (id, out) = match serde_json::from_str::<ToolRequest>(line) {
        Ok(req) => {
            let out = dispatch(backend, &req.tool, &req.arguments).await;
            (req.id, out)
        }
        Err(e) => {
            let err = BerthError::InvalidArgument(format!("malformed request: {e}"));
            (Value::Null, failure(backend, "", &err))
        }
    };

    let resp = ToolResponse {
        id,
        content: vec![TextContent {
            kind: "text",
            text: out.text,
        }],
        is_error: out.is_error,
    };
    serde_json::to_string(&resp).unwrap_or_else(|_| {
        r#"{"id":null,"content":[{"type":"text","text":"serialize_failed"}],"isError":true}"#
            .to_string()
    })
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use crate::config::AgentConfig;
    use crate::logs::LogBuffer;
    use crate::test_support::{FakePorts, FakeRuntime, temp_dir_for};

    use super::*;

    async fn backend(test_name: &str, rt: &FakeRuntime, logs: LogBuffer) -> Backend {
        let cfg = AgentConfig {
            store_dir: temp_dir_for(test_name),
            settle: Duration::ZERO,
            ready_timeout_secs: 0,
            ..AgentConfig::default()
        };
        Backend::open(cfg, Arc::new(rt.clone()), Arc::new(FakePorts::default()), logs)
            .await
            .unwrap()
    }

    fn payload(out: &ToolOutput) -> Value {
        serde_json::from_str(&out.text).unwrap()
    }

    #[tokio::test]
    async fn unknown_tool_is_an_invalid_argument() {
        let b = backend("tools_unknown", &FakeRuntime::default(), LogBuffer::new(100)).await;
        let out = dispatch(&b, "launch_rockets", &Value::Null).await;
        assert!(out.is_error);
        let v = payload(&out);
        assert_eq!(v["code"], "INVALID_ARGUMENT");
        assert!(v["message"].as_str().unwrap().contains("list_agents"));
        let _ = std::fs::remove_dir_all(&b.config().store_dir);
    }

    #[tokio::test]
    async fn stale_task_error_carries_recent_logs() {
        let logs = LogBuffer::new(100);
        logs.push_line("INFO berth-agent starting");
        let rt = FakeRuntime::default();
        let b = backend("tools_stale", &rt, logs).await;

        let out = dispatch(&b, "get_task", &json!({ "id": "nope" })).await;
        assert!(out.is_error);
        let v = payload(&out);
        assert_eq!(v["code"], "STALE_REFERENCE");
        assert_eq!(v["recentLogs"][0], "INFO berth-agent starting");
        assert!(rt.state().calls.is_empty());
        let _ = std::fs::remove_dir_all(&b.config().store_dir);
    }

    #[tokio::test]
    async fn argument_types_are_checked() {
        let b = backend("tools_args", &FakeRuntime::default(), LogBuffer::new(100)).await;

        let out = dispatch(&b, "get_agent_config", &json!({})).await;
        assert_eq!(payload(&out)["message"], "invalid argument: `name` is required");

        let out = dispatch(&b, "list_agents", &json!({ "tag": 3 })).await;
        assert_eq!(payload(&out)["code"], "INVALID_ARGUMENT");

        let out = dispatch(&b, "list_tasks", &json!("status")).await;
        assert_eq!(payload(&out)["code"], "INVALID_ARGUMENT");
        let _ = std::fs::remove_dir_all(&b.config().store_dir);
    }

    #[tokio::test]
    async fn get_logs_returns_most_recent_lines() {
        let logs = LogBuffer::new(100);
        for i in 0..5 {
            logs.push_line(format!("line {i}"));
        }
        let b = backend("tools_logs", &FakeRuntime::default(), logs).await;

        let out = dispatch(&b, "get_logs", &json!({ "limit": 2 })).await;
        assert!(!out.is_error);
        assert_eq!(
            payload(&out),
            json!({ "lines": ["line 3", "line 4"], "cursor": 5 })
        );

        let out = dispatch(&b, "get_logs", &json!({ "after": 2, "limit": 2 })).await;
        assert_eq!(
            payload(&out),
            json!({ "lines": ["line 2", "line 3"], "cursor": 4 })
        );
        let _ = std::fs::remove_dir_all(&b.config().store_dir);
    }

    #[tokio::test]
    async fn check_setup_reports_missing_runtime_without_failing() {
        let rt = FakeRuntime::default();
        rt.state().installed = false;
        let b = backend("tools_setup", &rt, LogBuffer::new(100)).await;

        let out = dispatch(&b, "check_setup", &json!({})).await;
        assert!(!out.is_error);
        let v = payload(&out);
        assert_eq!(v["runtime"]["reason"], "NOT_INSTALLED");
        assert_eq!(v["container"], Value::Null);
        assert_eq!(v["serviceUp"], false);
        let _ = std::fs::remove_dir_all(&b.config().store_dir);
    }

    #[tokio::test]
    async fn handle_line_wraps_results_and_echoes_id() {
        let b = backend("tools_line", &FakeRuntime::default(), LogBuffer::new(100)).await;

        let line = handle_line(
            &b,
            r#"{"id":7,"tool":"stop_backing_service","arguments":{}}"#,
        )
        .await;
        let v: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["id"], 7);
        assert_eq!(v["isError"], false);
        assert_eq!(v["content"][0]["type"], "text");
        let inner: Value = serde_json::from_str(v["content"][0]["text"].as_str().unwrap()).unwrap();
        assert_eq!(inner, json!({ "stopped": true }));
        let _ = std::fs::remove_dir_all(&b.config().store_dir);
    }

    #[tokio::test]
    async fn malformed_line_yields_error_response() {
        let b = backend("tools_malformed", &FakeRuntime::default(), LogBuffer::new(100)).await;

        let line = handle_line(&b, "{not json").await;
        let v: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["id"], Value::Null);
        assert_eq!(v["isError"], true);
        let inner: Value = serde_json::from_str(v["content"][0]["text"].as_str().unwrap()).unwrap();
        assert_eq!(inner["code"], "INVALID_ARGUMENT");
        assert!(!line.contains('\n'));
        let _ = std::fs::remove_dir_all(&b.config().store_dir);
    }
}
