//! 对话标签页
//!
//! 一轮对话分三步，只有第一步和第三步需要持有会话锁：
//! 1. `prepare_turn`：快照历史，按地图上下文拼接地理指令
//! 2. `run_turn`：调用代理 (网络 IO)，失败转成带处理建议的回复
//! 3. `ChatHistory::record`：把用户原始输入和回复成对写入历史
//!
//! 历史中永远保存用户原始输入，地理指令只出现在发给代理的消息里。

use crate::agents::{
    AgentError, AgentKind, CancelToken, ChatMessage, ConversationalAgent, MapPoint,
};
use crate::polygon_store::{PolygonStore, SelectionCount};
use crate::spatial_format;
use serde::Serialize;

pub const GENIE_TIMEOUT_REPLY: &str = "Query is taking longer than expected. Please try again.";
pub const CANCELLED_REPLY: &str = "Request cancelled.";

/// 单个标签页的对话历史 (只含已完成的问答)
#[derive(Debug, Clone, Default)]
pub struct ChatHistory {
    messages: Vec<ChatMessage>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// 写入一轮问答；被取消的轮次不记录
    pub fn record(&mut self, prompt: &str, outcome: &ChatOutcome) {
        if outcome.cancelled {
            return;
        }
        self.messages.push(ChatMessage::user(prompt));
        self.messages.push(ChatMessage::assistant(outcome.reply.clone()));
    }
}

/// 发给代理前的快照
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub kind: AgentKind,
    pub prompt: String,
    /// 实际发送的消息 (可能附带地理指令)
    pub message: String,
    pub history: Vec<ChatMessage>,
    pub caption: Option<String>,
}

/// 一轮对话的结果
#[derive(Debug, Clone, Serialize)]
pub struct ChatOutcome {
    pub kind: AgentKind,
    pub reply: String,
    pub sql: Option<String>,
    pub map_points: Vec<MapPoint>,
    /// 出错时的错误文本 (与 reply 相同)
    pub error: Option<String>,
    /// 出错时给用户的处理建议
    pub remediation: Option<String>,
    pub caption: Option<String>,
    pub cancelled: bool,
}

/// 选择计数说明文字
pub fn polygon_caption(count: Option<SelectionCount>) -> String {
    match count {
        Some(SelectionCount::Count(n)) => format!("Query includes {n} sites from selected polygon"),
        _ => "Query includes sites from selected polygon (count unavailable)".to_string(),
    }
}

/// 快照历史并拼接地理指令
pub fn prepare_turn(kind: AgentKind, history: &ChatHistory, store: &PolygonStore, prompt: &str) -> TurnRequest {
    let polygon = kind.map_context().and_then(|ctx| store.get(ctx).map(|p| (ctx, p)));

    let (message, caption) = match polygon {
        Some((ctx, polygon)) => (
            spatial_format::enhance_prompt(prompt, Some(polygon)),
            Some(polygon_caption(store.result(ctx).map(|r| r.count))),
        ),
        None => (prompt.to_string(), None),
    };

    TurnRequest {
        kind,
        prompt: prompt.to_string(),
        message,
        history: history.messages().to_vec(),
        caption,
    }
}

/// 调用代理 (不持有任何锁)
pub fn run_turn(agent: &dyn ConversationalAgent, request: &TurnRequest, cancel: &CancelToken) -> ChatOutcome {
    match agent.send(&request.history, &request.message, cancel) {
        Ok(reply) => ChatOutcome {
            kind: request.kind,
            reply: reply.text,
            sql: reply.sql,
            map_points: reply.map_points,
            error: None,
            remediation: None,
            caption: request.caption.clone(),
            cancelled: false,
        },
        Err(e) => {
            tracing::warn!(agent = request.kind.as_str(), error = %e, "chat turn failed");
            let reply = error_reply(request.kind, &e);
            ChatOutcome {
                kind: request.kind,
                error: Some(reply.clone()),
                reply,
                sql: None,
                map_points: Vec::new(),
                remediation: remediation(request.kind, agent.endpoint(), &e),
                caption: request.caption.clone(),
                cancelled: matches!(e, AgentError::Cancelled),
            }
        }
    }
}

/// 失败时写入历史的回复文本
pub fn error_reply(kind: AgentKind, error: &AgentError) -> String {
    if let AgentError::Cancelled = error {
        return CANCELLED_REPLY.to_string();
    }
    match kind {
        AgentKind::Genie => match error {
            AgentError::Failed { message } if !message.starts_with("HTTP ") => format!("❌ Error: {message}"),
            AgentError::TimedOut(_) => GENIE_TIMEOUT_REPLY.to_string(),
            other => format!("Error communicating with Genie Space: {other}"),
        },
        AgentKind::KnowledgeAssistant => format!("Error: {error}"),
        AgentKind::Supervisor => format!("Error calling Multi-Agent Supervisor: {error}"),
    }
}

fn remediation(kind: AgentKind, endpoint: Option<&str>, error: &AgentError) -> Option<String> {
    match error {
        AgentError::Cancelled => None,
        AgentError::NotConfigured(what) => Some(format!(
            "Set {what} in the environment and restart the application."
        )),
        _ => match kind {
            AgentKind::Genie if error.looks_like_permission_issue() => Some(
                "This is likely a permissions issue. Open the Genie Space, choose \"Share\", \
                 and grant the app's service principal \"Can Use\" permission. \
                 The Knowledge Assistant and Multi-Agent Supervisor tabs remain available."
                    .to_string(),
            ),
            AgentKind::Genie => match error {
                AgentError::Failed { .. } => Some(
                    "The app may not have permission to access this Genie Space. \
                     Share the Genie Space with the app's service principal, \
                     or use the Knowledge Assistant or Multi-Agent Supervisor tabs instead."
                        .to_string(),
                ),
                _ => None,
            },
            AgentKind::Supervisor => Some(format!(
                "Make sure the '{}' endpoint is available and the app has permissions.",
                endpoint.unwrap_or("supervisor")
            )),
            AgentKind::KnowledgeAssistant => None,
        },
    }
}
