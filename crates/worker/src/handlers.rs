//! Built-in handlers for the two most common task shapes: running a local
//! command and calling an HTTP endpoint. Applications register their own
//! handlers alongside these.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use conveyor_core::{ConveyorError, Result, TaskContext, TaskHandler};

/// Runs a local command. Positional args: the program, then its arguments.
/// A non-zero exit status is a retryable handler error carrying stderr.
pub struct ShellHandler;

#[async_trait]
impl TaskHandler for ShellHandler {
    async fn run(&self, ctx: &TaskContext) -> Result<Value> {
        let program = ctx
            .arg(0)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ConveyorError::HandlerError("shell task needs a program as its first argument".to_string())
            })?;
        let args: Vec<&str> = ctx
            .envelope()
            .args
            .iter()
            .skip(1)
            .filter_map(Value::as_str)
            .collect();

        let output = Command::new(program)
            .args(&args)
            .output()
            .await
            .map_err(|e| ConveyorError::HandlerError(format!("failed to spawn {program}: {e}")))?;

        if !output.status.success() {
            return Err(ConveyorError::HandlerError(format!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(json!({
            "stdout": String::from_utf8_lossy(&output.stdout),
        }))
    }
}

/// Calls an HTTP endpoint. Kwargs: `url` (required), `method` (default
/// GET), `json` (optional request body). Non-2xx responses are retryable
/// handler errors.
pub struct HttpHandler {
    client: reqwest::Client,
}

impl HttpHandler {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskHandler for HttpHandler {
    async fn run(&self, ctx: &TaskContext) -> Result<Value> {
        let url = ctx
            .kwarg("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ConveyorError::HandlerError("http task needs a `url` kwarg".to_string()))?;
        let method = ctx
            .kwarg("method")
            .and_then(Value::as_str)
            .unwrap_or("GET");
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| ConveyorError::HandlerError(format!("invalid http method {method}")))?;

        // Last chance to bail out before the side effect.
        ctx.checkpoint().await?;

        let mut request = self.client.request(method, url);
        if let Some(body) = ctx.kwarg("json") {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ConveyorError::HandlerError(format!("http request failed: {e}")))?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(ConveyorError::HandlerError(format!(
                "http status {status} from {url}"
            )));
        }
        Ok(json!({
            "status": status.as_u16(),
            "body": body,
        }))
    }
}
