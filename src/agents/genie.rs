//! Genie Space 代理
//!
//! 流程：start-conversation → 轮询消息状态 → 完成后收集文本附件、
//! SQL 和语句结果，渲染为 Markdown。每次提问都开启新会话。

use super::poll::{poll_until, PollError, PollStep};
use super::{
    http_client, send_json, AgentError, AgentKind, AgentReply, CancelToken, ChatMessage,
    ConversationalAgent, MapPoint, PollPolicy,
};
use crate::config::{AppConfig, WorkspaceSettings};
use crate::warehouse::{cell_f64, cell_string, parse_statement_response, ExecutorError, QueryResult};
use serde_json::{json, Value};
use std::time::Duration;

/// 结果表格最多显示的行数
const MAX_TABLE_ROWS: usize = 20;
/// 单个 HTTP 请求超时
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub const EMPTY_REPLY: &str = "Query completed successfully!";

pub struct GenieAgent {
    client: reqwest::blocking::Client,
    workspace: Option<WorkspaceSettings>,
    space_id: Option<String>,
    policy: PollPolicy,
}

impl GenieAgent {
    pub fn new(
        workspace: Option<WorkspaceSettings>,
        space_id: Option<String>,
        policy: PollPolicy,
    ) -> Result<Self, AgentError> {
        Ok(Self {
            client: http_client(REQUEST_TIMEOUT)?,
            workspace,
            space_id,
            policy,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, AgentError> {
        Self::new(
            config.workspace.clone(),
            config.genie_space_id.clone(),
            PollPolicy::with_timeout(config.genie_timeout),
        )
    }

    fn start(&self, workspace: &WorkspaceSettings, space_id: &str, content: &str) -> Result<(String, String), AgentError> {
        let url = workspace.api_url(&format!("/api/2.0/genie/spaces/{space_id}/start-conversation"));
        let response = send_json(
            self.client.post(url).json(&json!({ "content": content })),
            workspace,
            REQUEST_TIMEOUT,
        )?;
        conversation_ids(&response)
    }

    fn fetch_statement(&self, workspace: &WorkspaceSettings, statement_id: &str) -> Result<QueryResult, String> {
        let url = workspace.api_url(&format!("/api/2.0/sql/statements/{statement_id}"));
        let body = send_json(self.client.get(url), workspace, REQUEST_TIMEOUT).map_err(|e| e.to_string())?;
        let fetch_chunk = |link: &str| {
            send_json(self.client.get(workspace.api_url(link)), workspace, REQUEST_TIMEOUT)
                .map_err(|e| ExecutorError::Connectivity(e.to_string()))
        };
        parse_statement_response(body, REQUEST_TIMEOUT, fetch_chunk).map_err(|e| match e {
            // 语句未成功：没有可展示的结果，不算错误
            ExecutorError::Timeout(_) | ExecutorError::Rejected { .. } => String::new(),
            other => other.to_string(),
        })
    }
}

impl ConversationalAgent for GenieAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Genie
    }

    fn send(
        &self,
        _history: &[ChatMessage],
        message: &str,
        cancel: &CancelToken,
    ) -> Result<AgentReply, AgentError> {
        let workspace = self
            .workspace
            .as_ref()
            .ok_or_else(|| AgentError::NotConfigured("Databricks workspace".to_string()))?;
        let space_id = self
            .space_id
            .as_deref()
            .ok_or_else(|| AgentError::NotConfigured("GENIE_SPACE_ID".to_string()))?;

        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let (conversation_id, message_id) = self.start(workspace, space_id, message)?;
        tracing::info!(%conversation_id, %message_id, "genie conversation started");

        let url = workspace.api_url(&format!(
            "/api/2.0/genie/spaces/{space_id}/conversations/{conversation_id}/messages/{message_id}"
        ));

        let completed = poll_until(&self.policy, cancel, |_| {
            let status = send_json(self.client.get(&url), workspace, REQUEST_TIMEOUT)?;
            message_step(status)
        })
        .map_err(|e| match e {
            PollError::TimedOut(d) => AgentError::TimedOut(d),
            PollError::Cancelled => AgentError::Cancelled,
            PollError::Step(inner) => inner,
        })?;

        Ok(compose_reply(&completed, |id| self.fetch_statement(workspace, id)))
    }
}

/// 从 start-conversation 响应中取出会话和消息 ID
pub fn conversation_ids(response: &Value) -> Result<(String, String), AgentError> {
    let conversation = response
        .pointer("/conversation/id")
        .or_else(|| response.get("conversation_id"))
        .and_then(Value::as_str);
    let message = response
        .pointer("/message/id")
        .or_else(|| response.get("message_id"))
        .and_then(Value::as_str);

    match (conversation, message) {
        (Some(c), Some(m)) => Ok((c.to_string(), m.to_string())),
        _ => Err(AgentError::Malformed(
            "start-conversation response without conversation/message id".to_string(),
        )),
    }
}

/// 根据消息状态决定是否继续轮询
pub fn message_step(status: Value) -> Result<PollStep<Value>, AgentError> {
    match status.get("status").and_then(Value::as_str) {
        Some("COMPLETED") => Ok(PollStep::Done(status)),
        Some("FAILED") | Some("CANCELLED") => {
            let message = status
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("Query failed")
                .to_string();
            Err(AgentError::Failed { message })
        }
        _ => Ok(PollStep::Pending),
    }
}

/// 把完成的消息渲染成回复
///
/// `fetch` 读取语句结果；返回空串错误表示没有可展示的结果。
pub fn compose_reply<F>(message: &Value, mut fetch: F) -> AgentReply
where
    F: FnMut(&str) -> Result<QueryResult, String>,
{
    let mut parts: Vec<String> = Vec::new();
    let mut sql = None;
    let mut map_points = Vec::new();

    let message_statement = message
        .pointer("/query_result/statement_id")
        .and_then(Value::as_str);

    let attachments = message
        .get("attachments")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    for attachment in attachments {
        if let Some(text) = attachment.pointer("/text/content").and_then(Value::as_str) {
            parts.push(text.to_string());
        }

        let Some(query) = attachment.get("query") else {
            continue;
        };
        if let Some(q) = query.get("query").and_then(Value::as_str) {
            sql = Some(q.to_string());
        }

        let statement_id = query
            .pointer("/query_result_metadata/statement_id")
            .and_then(Value::as_str)
            .or(message_statement);
        let Some(statement_id) = statement_id else {
            continue;
        };

        match fetch(statement_id) {
            Ok(result) if !result.rows.is_empty() => {
                render_result(&result, &mut parts, &mut map_points);
            }
            Ok(_) => {}
            Err(e) if e.is_empty() => {}
            Err(e) => {
                tracing::warn!(%statement_id, error = %e, "could not fetch genie query results");
                parts.push(format!("\n_Could not fetch query results: {e}_"));
            }
        }
    }

    if parts.is_empty() {
        parts.push(EMPTY_REPLY.to_string());
    }

    AgentReply {
        text: parts.join("\n"),
        sql,
        map_points,
    }
}

/// 坐标列和名称列的位置 (按列名子串匹配，后出现的优先)
fn locate_columns(columns: &[String]) -> (Option<usize>, Option<usize>, Option<usize>) {
    let mut lat = None;
    let mut lon = None;
    let mut name = None;
    for (i, col) in columns.iter().enumerate() {
        let lower = col.to_lowercase();
        if lower.contains("lat") {
            lat = Some(i);
        }
        if lower.contains("lon") || lower.contains("lng") {
            lon = Some(i);
        }
        if lower.contains("name") || lower.contains("site") {
            name = Some(i);
        }
    }
    (lat, lon, name)
}

fn render_result(result: &QueryResult, parts: &mut Vec<String>, map_points: &mut Vec<MapPoint>) {
    let (lat_col, lon_col, name_col) = locate_columns(&result.columns);

    if let (Some(lat_col), Some(lon_col)) = (lat_col, lon_col) {
        parts.push("\n**📍 Map View:**\n".to_string());
        map_points.extend(result.rows.iter().filter_map(|row| {
            let lat = row.get(lat_col).and_then(cell_f64)?;
            let lon = row.get(lon_col).and_then(cell_f64)?;
            if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                return None;
            }
            let name = name_col
                .and_then(|i| row.get(i))
                .and_then(cell_string)
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "Site".to_string());
            let attributes = result
                .columns
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != lat_col && *j != lon_col)
                .map(|(j, col)| {
                    let value = row.get(j).and_then(cell_string).unwrap_or_default();
                    (col.clone(), value)
                })
                .collect();
            Some(MapPoint {
                name,
                lat,
                lon,
                attributes,
            })
        }));
    }

    parts.push("\n**Query Results:**\n".to_string());
    if !result.columns.is_empty() {
        parts.push(markdown_table(result));
        if result.rows.len() > MAX_TABLE_ROWS {
            parts.push(format!("\n*({} more rows...)*", result.rows.len() - MAX_TABLE_ROWS));
        }
    }
}

/// Markdown 表格 (最多 20 行)
pub fn markdown_table(result: &QueryResult) -> String {
    let mut lines = Vec::with_capacity(MAX_TABLE_ROWS + 2);
    lines.push(format!("| {} |", result.columns.join(" | ")));
    lines.push(format!("| {} |", vec!["---"; result.columns.len()].join(" | ")));
    for row in result.rows.iter().take(MAX_TABLE_ROWS) {
        let cells: Vec<String> = row
            .iter()
            .map(|cell| cell_string(cell).unwrap_or_default())
            .collect();
        lines.push(format!("| {} |", cells.join(" | ")));
    }
    lines.join("\n")
}
