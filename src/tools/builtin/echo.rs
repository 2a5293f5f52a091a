//! Echo tool for wiring tests.

use async_trait::async_trait;

use crate::context::ExecutionContext;
use crate::tools::{Tool, ToolError, ToolOutput};

/// Echoes back the input message.
#[derive(Debug)]
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes back the input message. Useful for testing."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The message to echo back"
                }
            },
            "required": ["message"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ExecutionContext,
    ) -> Result<ToolOutput, ToolError> {
        let message = params
            .get("message")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ToolError::InvalidParameters("missing 'message' parameter".to_string())
            })?;

        Ok(ToolOutput::text(message))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::db::MemoryDatabase;

    #[tokio::test]
    async fn test_echo_tool() {
        let tool = EchoTool;
        let ctx = ExecutionContext::new(Arc::new(MemoryDatabase::new()), 1);

        let result = tool
            .execute(serde_json::json!({"message": "hello"}), &ctx)
            .await
            .unwrap();

        assert_eq!(result.result, serde_json::json!("hello"));
        assert!(result.interrupt.is_none());
    }

    #[tokio::test]
    async fn missing_message_is_invalid_parameters() {
        let tool = EchoTool;
        let ctx = ExecutionContext::new(Arc::new(MemoryDatabase::new()), 1);
        let err = tool.execute(serde_json::json!({}), &ctx).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }
}
