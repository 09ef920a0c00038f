use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use super::actions::{ActionContext, ActionHandler};

/// Forwards a signal to an external collaborator over HTTP and returns its JSON reply.
///
/// Used to hand `pdca.slice.requested` to the planning service, which executes the
/// slice and reports back through the task store.
pub struct WebhookAction {
    client: reqwest::Client,
    url: String,
}

impl WebhookAction {
    pub fn new(url: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        let url = url.into();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(anyhow!("webhook url must start with http:// or https://"));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("pdca-runtime/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ActionHandler for WebhookAction {
    async fn handle(&self, ctx: ActionContext<'_>) -> Result<Value> {
        let body = json!({
            "signal": ctx.signal,
            "state": ctx.current_state.key,
        });

        let response = self
            .client
            .post(&self.url)
            .header("x-correlation-id", ctx.signal.correlation_id())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!("webhook returned {}: {}", status, text));
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}
