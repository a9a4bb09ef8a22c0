// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `submit_result` — the tool a dispatched subagent must call to hand its
//! structured or textual result back to the batch dispatcher.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Captured payload of a `submit_result` call: the free-form `output` text,
/// an optional `status` (e.g. `"aborted"`), and — when the batch declared an
/// `output_schema` — the structured `data` object validated against it.
#[derive(Debug, Clone)]
pub struct SubmittedResult {
    pub output: String,
    pub status: Option<String>,
    pub data: Option<Value>,
}

/// Lets a subagent conclude its run with a structured result instead of
/// trailing off in free text. The dispatcher inspects `captured` after the
/// agent's turn completes; a `None` means the contract was not honored and
/// the reminder/fallback machinery kicks in.
pub struct SubmitResultTool {
    schema: Option<Value>,
    captured: Arc<Mutex<Option<SubmittedResult>>>,
}

impl SubmitResultTool {
    pub fn new(schema: Option<Value>) -> (Self, Arc<Mutex<Option<SubmittedResult>>>) {
        let captured = Arc::new(Mutex::new(None));
        (Self { schema, captured: captured.clone() }, captured)
    }
}

#[async_trait]
impl Tool for SubmitResultTool {
    fn name(&self) -> &str {
        "submit_result"
    }

    fn description(&self) -> &str {
        "Call this exactly once, as your final action, to hand back the result of the task \
         you were assigned. Always provide `output`, a human-readable summary of what you did \
         and found. If the task cannot be completed, set `status` to \"aborted\" and explain \
         why in `output`."
    }

    fn parameters_schema(&self) -> Value {
        let mut properties = json!({
            "output": {
                "type": "string",
                "description": "Human-readable summary of the work performed and its outcome"
            },
            "status": {
                "type": "string",
                "enum": ["completed", "aborted"],
                "description": "Defaults to \"completed\"; use \"aborted\" if the task could not be finished"
            }
        });
        if let Some(schema) = &self.schema {
            properties["data"] = json!({
                "description": "Structured result matching the batch's requested schema",
                // The caller's schema is surfaced verbatim as a hint; additional
                // validation of `data` against it happens after the call returns.
                "schema_hint": schema,
            });
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": ["output"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let output = match call.args.get("output").and_then(|v| v.as_str()) {
            Some(s) => s.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'output'"),
        };
        let status = call.args.get("status").and_then(|v| v.as_str()).map(str::to_string);
        let data = call.args.get("data").cloned();

        *self.captured.lock().await = Some(SubmittedResult { output: output.clone(), status, data });

        ToolOutput::ok(&call.id, format!("result recorded: {output}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(args: Value) -> ToolCall {
        ToolCall { id: "t1".into(), name: "submit_result".into(), args }
    }

    #[tokio::test]
    async fn captures_output_and_status() {
        let (tool, captured) = SubmitResultTool::new(None);
        let out = tool.execute(&call(json!({"output": "done", "status": "aborted"}))).await;
        assert!(!out.is_error);
        let captured = captured.lock().await;
        let result = captured.as_ref().expect("result must be captured");
        assert_eq!(result.output, "done");
        assert_eq!(result.status.as_deref(), Some("aborted"));
    }

    #[tokio::test]
    async fn defaults_status_to_none() {
        let (tool, captured) = SubmitResultTool::new(None);
        tool.execute(&call(json!({"output": "ok"}))).await;
        assert!(captured.lock().await.as_ref().unwrap().status.is_none());
    }

    #[tokio::test]
    async fn missing_output_is_error() {
        let (tool, _captured) = SubmitResultTool::new(None);
        let out = tool.execute(&call(json!({}))).await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn captures_structured_data_when_schema_present() {
        let (tool, captured) = SubmitResultTool::new(Some(json!({"type": "object"})));
        tool.execute(&call(json!({"output": "ok", "data": {"score": 5}}))).await;
        let captured = captured.lock().await;
        assert_eq!(captured.as_ref().unwrap().data, Some(json!({"score": 5})));
    }
}
