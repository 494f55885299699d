use std::time::Duration;

use anyhow::Context;
use berth_model::{Agent, GatewayResponse, Task};
use reqwest::{Method, Url};
use serde_json::Value;

use crate::error::BerthError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client for the service exposed by the backing container. Every call is bounded:
/// readiness polling by a seconds budget, requests by a retry count.
#[derive(Debug, Clone)]
pub struct ResilientHttpGateway {
    client: reqwest::Client,
    base: Url,
    health_path: String,
    retries: u32,
    retry_interval: Duration,
    poll_interval: Duration,
}

impl ResilientHttpGateway {
    pub fn new(endpoint: &str) -> anyhow::Result<Self> {
        let base = Url::parse(endpoint).with_context(|| format!("invalid endpoint {endpoint}"))?;
        let client = reqwest::Client::builder()
            .user_agent("berth-agent")
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            base,
            health_path: "/".to_string(),
            retries: 2,
            retry_interval: Duration::from_millis(5000),
            poll_interval: Duration::from_secs(1),
        })
    }

    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = path.into();
        self
    }

    pub fn with_retry(mut self, retries: u32, interval: Duration) -> Self {
        self.retries = retries;
        self.retry_interval = interval;
        self
    }

    #[cfg(test)]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// `base` + percent-encoded path segments.
    pub fn url_for(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn health_url(&self) -> Url {
        let segments: Vec<&str> = self
            .health_path
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        let mut url = self.url_for(&segments);
        if segments.is_empty() {
            url.set_path("/");
        }
        url
    }

    async fn probe(&self, url: &Url) -> bool {
        match self
            .client
            .get(url.clone())
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "health probe failed");
                false
            }
        }
    }

    /// Polls the health path once per poll interval until a 2xx arrives or the budget of
    /// `timeout_secs` sleeps is spent. `is_up(0)` probes exactly once.
    pub async fn is_up(&self, timeout_secs: i64) -> Result<bool, BerthError> {
        if timeout_secs < 0 {
            return Err(BerthError::InvalidArgument(format!(
                "timeout must be non-negative, got {timeout_secs}"
            )));
        }

        let url = self.health_url();
        let mut remaining = timeout_secs;
        loop {
            if self.probe(&url).await {
                tracing::debug!(url = %url, "backing service is up");
                return Ok(true);
            }
            if remaining <= 0 {
                tracing::debug!(url = %url, timeout_secs, "backing service did not answer");
                return Ok(false);
            }
            remaining -= 1;
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn attempt(&self, method: &Method, url: &Url, body: Option<&Value>) -> GatewayResponse {
        let mut req = self.client.request(method.clone(), url.clone());
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => return GatewayResponse::failure(e.to_string()),
        };
        let status = resp.status();
        let text = match resp.text().await {
            Ok(t) => t,
            Err(e) => {
                return GatewayResponse {
                    status_code: Some(status.as_u16()),
                    ..GatewayResponse::failure(format!("read response body: {e}"))
                };
            }
        };
        let data = parse_body(&text);

        if !status.is_success() {
            return GatewayResponse {
                success: false,
                error: Some(error_message(status, data.as_ref())),
                status_code: Some(status.as_u16()),
                data,
            };
        }
        if data.is_none() {
            return GatewayResponse {
                status_code: Some(status.as_u16()),
                ..GatewayResponse::failure("empty response body")
            };
        }
        GatewayResponse {
            success: true,
            data,
            error: None,
            status_code: Some(status.as_u16()),
        }
    }

    pub async fn request(&self, method: Method, url: Url, body: Option<&Value>) -> GatewayResponse {
        self.request_with(method, url, body, self.retries, self.retry_interval)
            .await
    }

    /// One attempt plus up to `retries` more, sleeping `interval` between attempts. Returns
    /// the first success or the last failure.
    pub async fn request_with(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        retries: u32,
        interval: Duration,
    ) -> GatewayResponse {
        let mut last = GatewayResponse::failure("no attempt made");
        for attempt in 0..=retries {
            if attempt > 0 {
                tokio::time::sleep(interval).await;
            }
            let resp = self.attempt(&method, &url, body).await;
            if resp.success {
                return resp;
            }
            tracing::warn!(
                %method,
                url = %url,
                attempt = attempt + 1,
                status = resp.status_code,
                error = resp.error.as_deref().unwrap_or_default(),
                "request failed"
            );
            last = resp;
        }
        last
    }

    async fn call(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<GatewayResponse, BerthError> {
        let resp = self.request(method, url, body).await;
        if resp.success {
            Ok(resp)
        } else {
            Err(remote_error(resp))
        }
    }

    pub async fn get_agent_names(&self, tag: Option<&str>) -> Result<Vec<String>, BerthError> {
        let mut url = self.url_for(&["api", "agents"]);
        if let Some(tag) = tag.map(str::trim).filter(|t| !t.is_empty()) {
            url.query_pairs_mut().append_pair("tag", tag);
        }
        let resp = self.call(Method::GET, url, None).await?;
        Ok(resp
            .field("agents")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn get_agent_config(&self, name: &str) -> Result<Agent, BerthError> {
        let url = self.url_for(&["api", "agents", name]);
        let resp = self.call(Method::GET, url, None).await?;
        Ok(Agent::from_loose(resp.field("agent").unwrap_or(&Value::Null)))
    }

    pub async fn create_task(&self, config: &Value) -> Result<String, BerthError> {
        let url = self.url_for(&["api", "tasks"]);
        let resp = self.call(Method::POST, url, Some(config)).await?;
        let id = match resp.field("id") {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        };
        if id.is_empty() {
            return Err(BerthError::Remote {
                message: "task created but the response carried no id".to_string(),
                status: resp.status_code,
            });
        }
        Ok(id)
    }

    pub async fn get_tasks(&self) -> Result<Vec<Task>, BerthError> {
        let url = self.url_for(&["api", "tasks"]);
        let resp = self.call(Method::GET, url, None).await?;
        Ok(resp
            .field("tasks")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(Task::from_loose).collect())
            .unwrap_or_default())
    }

    pub async fn get_task(&self, id: &str) -> Result<Task, BerthError> {
        let url = self.url_for(&["api", "tasks", id]);
        let resp = self.call(Method::GET, url, None).await?;
        Ok(Task::from_loose(resp.data.as_ref().unwrap_or(&Value::Null)))
    }
}

/// JSON when it parses, otherwise the raw text. Blank bodies yield `None`.
fn parse_body(text: &str) -> Option<Value> {
    if text.trim().is_empty() {
        return None;
    }
    Some(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())))
}

fn error_message(status: reqwest::StatusCode, data: Option<&Value>) -> String {
    let from_body = match data {
        Some(Value::Object(obj)) => ["error", "message", "detail"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .map(str::to_string),
        Some(Value::String(s)) => Some(s.trim().to_string()),
        _ => None,
    };
    from_body
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("HTTP {status}"))
}

fn remote_error(resp: GatewayResponse) -> BerthError {
    BerthError::Remote {
        message: resp.error.unwrap_or_else(|| "request failed".to_string()),
        status: resp.status_code,
    }
}
