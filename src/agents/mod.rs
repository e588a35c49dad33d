//! 对话代理
//!
//! 三个后端 AI 服务共用一个接口：
//! - `genie`：自然语言转 SQL (Genie Space API，异步轮询)
//! - `serving`：知识助手与多代理主管 (Serving Endpoint，同步调用)
//!
//! 代理内部行为不在本 crate 范围内，这里只负责请求、等待与解析。

pub mod genie;
pub mod poll;
pub mod serving;

use crate::config::WorkspaceSettings;
use crate::polygon_store::ContextKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub use poll::{CancelToken, PollPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// 代理种类，同时对应一个对话标签页
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    Genie,
    KnowledgeAssistant,
    Supervisor,
}

impl AgentKind {
    pub const ALL: [AgentKind; 3] = [
        AgentKind::Genie,
        AgentKind::KnowledgeAssistant,
        AgentKind::Supervisor,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentKind::Genie => "genie",
            AgentKind::KnowledgeAssistant => "knowledge-assistant",
            AgentKind::Supervisor => "supervisor",
        }
    }

    /// 该标签页绑定的地图上下文 (知识助手没有地图)
    pub fn map_context(self) -> Option<ContextKey> {
        match self {
            AgentKind::Genie => Some(ContextKey::ChatPrimary),
            AgentKind::Supervisor => Some(ContextKey::ChatSecondary),
            AgentKind::KnowledgeAssistant => None,
        }
    }
}

/// 查询结果中可以上图的点
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapPoint {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    /// 其余列 (列名, 值)
    pub attributes: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentReply {
    /// Markdown 文本
    pub text: String,
    pub sql: Option<String>,
    pub map_points: Vec<MapPoint>,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("{0} is not configured")]
    NotConfigured(String),
    #[error("service unreachable: {0}")]
    Unreachable(String),
    #[error("access denied (HTTP {0})")]
    Unauthorized(u16),
    #[error("{message}")]
    Failed { message: String },
    #[error("no response after {0:?}")]
    TimedOut(Duration),
    #[error("request cancelled")]
    Cancelled,
    #[error("unexpected response: {0}")]
    Malformed(String),
}

impl AgentError {
    /// 是否像是权限问题 (用于给出处理建议)
    pub fn looks_like_permission_issue(&self) -> bool {
        match self {
            AgentError::Unauthorized(_) => true,
            AgentError::Failed { message } => {
                let lower = message.to_lowercase();
                lower.contains("does not exist")
                    || lower.contains("permission")
                    || lower.contains("unauthorized")
            }
            _ => false,
        }
    }
}

pub trait ConversationalAgent: Send + Sync {
    fn kind(&self) -> AgentKind;

    /// 服务端点名称 (出错提示用)
    fn endpoint(&self) -> Option<&str> {
        None
    }

    /// 发送一条消息。`history` 是此前已完成的对话，不含本条。
    fn send(
        &self,
        history: &[ChatMessage],
        message: &str,
        cancel: &CancelToken,
    ) -> Result<AgentReply, AgentError>;
}

/// 构建带超时的阻塞 HTTP 客户端
pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::blocking::Client, AgentError> {
    reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AgentError::Unreachable(format!("failed to build http client: {e}")))
}

/// 发送请求并解析 JSON 响应
pub(crate) fn send_json(
    request: reqwest::blocking::RequestBuilder,
    workspace: &WorkspaceSettings,
    timeout: Duration,
) -> Result<Value, AgentError> {
    let response = request
        .bearer_auth(&workspace.token)
        .send()
        .map_err(|e| {
            if e.is_timeout() {
                AgentError::TimedOut(timeout)
            } else {
                AgentError::Unreachable(e.to_string())
            }
        })?;

    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(AgentError::Unauthorized(status.as_u16()));
    }
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(AgentError::Failed {
            message: format!("HTTP {}: {}", status.as_u16(), error_message(&body)),
        });
    }

    response
        .json::<Value>()
        .map_err(|e| AgentError::Malformed(e.to_string()))
}

/// 从错误响应体中取出 `message` 字段，没有就返回原文
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}
