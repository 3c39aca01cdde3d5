use crate::http_auth::ACCESS_KEY_HEADER;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use wa_sandbox::{Sandbox, SandboxAction, SandboxError, SandboxResponse};

pub type ActionOutcome = std::result::Result<serde_json::Value, SandboxError>;

/// Runs approved actions somewhere: in-process or on the site over HTTP.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &SandboxAction) -> ActionOutcome;

    fn describe(&self) -> String;
}

pub struct LocalExecutor {
    sandbox: Arc<Sandbox>,
}

impl LocalExecutor {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl ActionExecutor for LocalExecutor {
    async fn execute(&self, action: &SandboxAction) -> ActionOutcome {
        self.sandbox.execute(action).await
    }

    fn describe(&self) -> String {
        format!("local sandbox at {}", self.sandbox.site().root().display())
    }
}

/// Posts `{action, payload}` to a site's execute endpoint.
pub struct RemoteExecutor {
    http: reqwest::Client,
    url: String,
    access_key: String,
}

impl RemoteExecutor {
    pub fn new(url: &str, access_key: &str, timeout: Duration) -> anyhow::Result<Self> {
        let url = url.trim();
        if url.is_empty() {
            return Err(anyhow::anyhow!("remote sandbox url is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("http client build failed: {e}"))?;
        Ok(Self {
            http,
            url: url.to_string(),
            access_key: access_key.to_string(),
        })
    }
}

#[async_trait]
impl ActionExecutor for RemoteExecutor {
    #[tracing::instrument(level = "info", skip_all, fields(action = action.name()))]
    async fn execute(&self, action: &SandboxAction) -> ActionOutcome {
        let started = Instant::now();
        let response = self
            .http
            .post(&self.url)
            .header(ACCESS_KEY_HEADER, &self.access_key)
            .json(&action.to_request())
            .send()
            .await
            .map_err(|e| SandboxError::execution(format!("sandbox unreachable: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SandboxError::execution(format!("sandbox response read failed: {e}")))?;
        tracing::debug!(
            status = status.as_u16(),
            latency_ms = started.elapsed().as_millis() as u64,
            body_len = body.len(),
            "remote sandbox replied"
        );
        let envelope: SandboxResponse = serde_json::from_str(&body).map_err(|e| {
            SandboxError::execution(format!(
                "sandbox returned status {} with an unreadable body: {e}",
                status.as_u16()
            ))
        })?;
        envelope.into_result()
    }

    fn describe(&self) -> String {
        format!("remote sandbox at {}", self.url)
    }
}
