//! Outbound HTTP request tool.

use std::time::Duration;

use async_trait::async_trait;

use crate::context::ExecutionContext;
use crate::models::preview;
use crate::tools::{Tool, ToolError, ToolOutput};

const MAX_BODY_CHARS: usize = 10_000;

/// Performs an HTTP request and returns status plus a truncated body.
pub struct HttpRequestTool {
    client: reqwest::Client,
}

impl HttpRequestTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client"),
        }
    }
}

impl Default for HttpRequestTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for HttpRequestTool {
    fn name(&self) -> &str {
        "http_request"
    }

    fn description(&self) -> &str {
        "Make an HTTP request to a URL. Supports GET and POST with an optional JSON body."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "Target URL (http or https)"},
                "method": {"type": "string", "enum": ["GET", "POST"], "default": "GET"},
                "body": {"type": "object", "description": "JSON body for POST requests"}
            },
            "required": ["url"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ExecutionContext,
    ) -> Result<ToolOutput, ToolError> {
        let url = params
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidParameters("missing 'url' parameter".to_string()))?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ToolError::InvalidParameters(format!(
                "url must be http(s), got: {url}"
            )));
        }
        let method = params
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_ascii_uppercase();

        let request = match method.as_str() {
            "GET" => self.client.get(url),
            "POST" => {
                let mut builder = self.client.post(url);
                if let Some(body) = params.get("body") {
                    builder = builder.json(body);
                }
                builder
            }
            other => {
                return Err(ToolError::InvalidParameters(format!(
                    "unsupported method: {other}"
                )));
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| ToolError::ExternalService(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ToolError::ExternalService(e.to_string()))?;

        Ok(ToolOutput::value(serde_json::json!({
            "status": status,
            "body": preview(&body, MAX_BODY_CHARS),
        })))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::db::MemoryDatabase;

    #[tokio::test]
    async fn rejects_non_http_urls() {
        let tool = HttpRequestTool::new();
        let ctx = ExecutionContext::new(Arc::new(MemoryDatabase::new()), 1);
        let err = tool
            .execute(serde_json::json!({"url": "file:///etc/passwd"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn rejects_unsupported_methods() {
        let tool = HttpRequestTool::new();
        let ctx = ExecutionContext::new(Arc::new(MemoryDatabase::new()), 1);
        let err = tool
            .execute(
                serde_json::json!({"url": "https://example.com", "method": "DELETE"}),
                &ctx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }
}
