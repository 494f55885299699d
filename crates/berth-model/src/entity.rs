//! Entities sourced from the backing service.
//!
//! The remote schema is not guaranteed to be field-complete, so every entity is built with
//! a `from_loose` routine that accepts arbitrary JSON and defaults each expected field
//! instead of failing:
//!
//! | Entity | Field       | Default   |
//! |--------|-------------|-----------|
//! | Agent  | `type`      | `""`      |
//! | Agent  | `tags`      | `""`      |
//! | Agent  | `sortOrder` | `0`       |
//! | Agent  | `stages`    | `{}`      |
//! | Task   | `id`        | `""`      |
//! | Task   | `agents`    | `[]`      |
//! | Task   | `links`     | `{}`      |
//! | Task   | `progress`  | `{}`      |
//! | Task   | `status`    | `PENDING` |

use std::{fmt, str::FromStr};

use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Pending,
    Skipped,
    Loading,
    Running,
    Success,
    Failure,
    Stopped,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Skipped,
        TaskStatus::Loading,
        TaskStatus::Running,
        TaskStatus::Success,
        TaskStatus::Failure,
        TaskStatus::Stopped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Skipped => "SKIPPED",
            TaskStatus::Loading => "LOADING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
            TaskStatus::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status: {0}")]
pub struct UnknownTaskStatus(pub String);

impl FromStr for TaskStatus {
    type Err = UnknownTaskStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        TaskStatus::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(needle))
            .ok_or_else(|| UnknownTaskStatus(needle.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    #[serde(rename = "type")]
    pub kind: String,
    pub tags: String,
    pub sort_order: i64,
    pub stages: Map<String, Value>,
}

impl Agent {
    pub fn from_loose(v: &Value) -> Self {
        let Some(obj) = v.as_object() else {
            return Self::default();
        };

        let tags = match obj.get("tags") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(","),
            other => loose_string(other).unwrap_or_default(),
        };

        Self {
            kind: loose_string(obj.get("type")).unwrap_or_default(),
            tags,
            sort_order: loose_i64(obj.get("sortOrder")).unwrap_or(0),
            stages: loose_map(obj.get("stages")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Task {
    pub id: String,
    pub agents: Vec<String>,
    pub links: Map<String, Value>,
    pub progress: Map<String, Value>,
    pub status: TaskStatus,
}

impl Task {
    /// Echo of a freshly created task. The only status ever produced locally.
    pub fn pending(id: impl Into<String>, agents: Vec<String>) -> Self {
        Self {
            id: id.into(),
            agents,
            ..Self::default()
        }
    }

    pub fn from_loose(v: &Value) -> Self {
        let Some(obj) = v.as_object() else {
            return Self::default();
        };

        let agents = obj
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

        let status = obj
            .get("status")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        Self {
            id: loose_string(obj.get("id")).unwrap_or_default(),
            agents,
            links: loose_map(obj.get("links")),
            progress: loose_map(obj.get("progress")),
            status,
        }
    }
}

fn loose_string(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn loose_i64(v: Option<&Value>) -> Option<i64> {
    match v? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn loose_map(v: Option<&Value>) -> Map<String, Value> {
    v.and_then(Value::as_object).cloned().unwrap_or_default()
}
