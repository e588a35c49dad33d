//! Serving Endpoint 代理 (知识助手、多代理主管)
//!
//! 同步调用 `/serving-endpoints/{name}/invocations`，把完整对话历史
//! 作为 `input` 发送。阻塞请求无法中途打断，取消在请求前后检查，
//! 请求期间被取消的回复会被丢弃。

use super::{
    http_client, send_json, AgentError, AgentKind, AgentReply, CancelToken, ChatMessage,
    ConversationalAgent,
};
use crate::config::{AppConfig, WorkspaceSettings};
use serde_json::{json, Value};
use std::time::Duration;

pub const APOLOGY_REPLY: &str =
    "I apologize, but I couldn't generate a response. Please try again.";

pub struct ServingAgent {
    kind: AgentKind,
    client: reqwest::blocking::Client,
    workspace: Option<WorkspaceSettings>,
    endpoint: String,
    timeout: Duration,
}

impl ServingAgent {
    pub fn new(
        kind: AgentKind,
        workspace: Option<WorkspaceSettings>,
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AgentError> {
        Ok(Self {
            kind,
            client: http_client(timeout)?,
            workspace,
            endpoint: endpoint.into(),
            timeout,
        })
    }

    pub fn knowledge_assistant(config: &AppConfig) -> Result<Self, AgentError> {
        Self::new(
            AgentKind::KnowledgeAssistant,
            config.workspace.clone(),
            config.knowledge_assistant_endpoint.clone(),
            config.assistant_timeout,
        )
    }

    pub fn supervisor(config: &AppConfig) -> Result<Self, AgentError> {
        Self::new(
            AgentKind::Supervisor,
            config.workspace.clone(),
            config.supervisor_endpoint.clone(),
            config.supervisor_timeout,
        )
    }
}

impl ConversationalAgent for ServingAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn endpoint(&self) -> Option<&str> {
        Some(&self.endpoint)
    }

    fn send(
        &self,
        history: &[ChatMessage],
        message: &str,
        cancel: &CancelToken,
    ) -> Result<AgentReply, AgentError> {
        let workspace = self
            .workspace
            .as_ref()
            .ok_or_else(|| AgentError::NotConfigured("Databricks workspace".to_string()))?;

        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let url = workspace.api_url(&format!("/serving-endpoints/{}/invocations", self.endpoint));
        tracing::info!(
            agent = self.kind.as_str(),
            endpoint = %self.endpoint,
            history = history.len(),
            "invoking serving endpoint"
        );

        let response = send_json(
            self.client.post(url).json(&invocation_body(history, message)),
            workspace,
            self.timeout,
        )?;

        if cancel.is_cancelled() {
            tracing::debug!(agent = self.kind.as_str(), "discarding reply for cancelled request");
            return Err(AgentError::Cancelled);
        }

        let text = extract_output_text(&response).unwrap_or_else(|| {
            tracing::warn!(agent = self.kind.as_str(), "serving endpoint returned no text");
            APOLOGY_REPLY.to_string()
        });

        Ok(AgentReply {
            text,
            ..AgentReply::default()
        })
    }
}

/// 请求体：历史 + 本条用户消息
pub fn invocation_body(history: &[ChatMessage], message: &str) -> Value {
    let mut input: Vec<Value> = history
        .iter()
        .map(|m| json!({ "role": m.role, "content": m.content }))
        .collect();
    input.push(json!({ "role": "user", "content": message }));

    json!({
        "input": input,
        "databricks_options": { "return_trace": true },
    })
}

/// 从代理响应中提取文本
///
/// 依次尝试：assistant 消息的 output_text、字符串形式的 output、
/// output 条目上的 text 字段、顶层 content。
pub fn extract_output_text(response: &Value) -> Option<String> {
    let output = response.get("output");
    let non_empty = |s: String| if s.is_empty() { None } else { Some(s) };

    if let Some(items) = output.and_then(Value::as_array) {
        let primary: String = items
            .iter()
            .filter(|item| {
                item.get("type").and_then(Value::as_str) == Some("message")
                    && item.get("role").and_then(Value::as_str) == Some("assistant")
            })
            .filter_map(|item| item.get("content").and_then(Value::as_array))
            .flatten()
            .filter(|c| c.get("type").and_then(Value::as_str) == Some("output_text"))
            .filter_map(|c| c.get("text").and_then(Value::as_str))
            .collect();
        if let Some(text) = non_empty(primary) {
            return Some(text);
        }

        let loose: String = items
            .iter()
            .filter_map(|item| item.get("text"))
            .map(value_text)
            .collect();
        if let Some(text) = non_empty(loose) {
            return Some(text);
        }
    }

    if let Some(text) = output.and_then(Value::as_str) {
        if let Some(text) = non_empty(text.to_string()) {
            return Some(text);
        }
    }

    response.get("content").map(value_text).and_then(non_empty)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
