//! 数据仓库查询执行器
//!
//! 职责：
//! - `QueryExecutor` trait：核心逻辑只依赖这个接口
//! - `DatabricksSqlExecutor`：基于 SQL Statement Execution API 的阻塞实现
//! - 错误分类：区分可回退的远程故障与程序/配置错误
//!
//! 每次调用都有明确的超时上限 (wait_timeout + on_wait_timeout=CANCEL，
//! 外加 HTTP 客户端超时)，远程挂起时本地回退最终一定能拿到控制权。

use crate::config::{AppConfig, WorkspaceSettings};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// 查询结果 (列名 + 行，单元格保持 JSON 值)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    /// 按列名查找下标 (不区分大小写)
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    /// 读取首行首列的非负整数 (COUNT 查询)
    pub fn scalar_u64(&self) -> Result<u64, ExecutorError> {
        let cell = self
            .rows
            .first()
            .and_then(|row| row.first())
            .ok_or_else(|| ExecutorError::Malformed("empty result for scalar query".to_string()))?;

        cell_f64(cell)
            .filter(|v| *v >= 0.0 && v.fract() == 0.0)
            .map(|v| v as u64)
            .ok_or_else(|| ExecutorError::Malformed(format!("not a count: {cell}")))
    }
}

/// 单元格转数值 (JSON_ARRAY 格式下数值以字符串返回)
pub fn cell_f64(cell: &Value) -> Option<f64> {
    match cell {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

/// 单元格转字符串 (null 返回 None)
pub fn cell_string(cell: &Value) -> Option<String> {
    match cell {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// 执行器错误
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
    #[error("warehouse unreachable: {0}")]
    Connectivity(String),
    #[error("warehouse rejected credentials (HTTP {0})")]
    Unauthorized(u16),
    #[error("statement {state}: {message}")]
    Rejected { state: String, message: String },
    #[error("malformed warehouse response: {0}")]
    Malformed(String),
    /// 部署未配置仓库：远程路径不可用，但不是程序错误
    #[error("warehouse not configured: {0}")]
    NotConfigured(String),
    #[error("executor misconfigured: {0}")]
    Config(String),
    #[error("internal executor error: {0}")]
    Internal(String),
}

impl ExecutorError {
    /// 远程空间计数可以回退到本地计算的故障类别
    ///
    /// 配置错误和内部错误是程序问题，不在此列。
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ExecutorError::Timeout(_)
                | ExecutorError::Connectivity(_)
                | ExecutorError::Unauthorized(_)
                | ExecutorError::Rejected { .. }
                | ExecutorError::Malformed(_)
                | ExecutorError::NotConfigured(_)
        )
    }

    pub fn category(&self) -> &'static str {
        match self {
            ExecutorError::Timeout(_) => "timeout",
            ExecutorError::Connectivity(_) => "connectivity",
            ExecutorError::Unauthorized(_) => "unauthorized",
            ExecutorError::Rejected { .. } => "rejected",
            ExecutorError::Malformed(_) => "malformed",
            ExecutorError::NotConfigured(_) => "not_configured",
            ExecutorError::Config(_) => "config",
            ExecutorError::Internal(_) => "internal",
        }
    }
}

/// 查询执行器接口
pub trait QueryExecutor: Send + Sync {
    fn execute(&self, sql: &str) -> Result<QueryResult, ExecutorError>;
}

// ============================================================================
// Databricks SQL Statement Execution API
// ============================================================================

#[derive(Debug, Deserialize)]
struct StatementResponse {
    statement_id: Option<String>,
    status: Option<StatementStatus>,
    manifest: Option<Manifest>,
    result: Option<ResultData>,
}

#[derive(Debug, Deserialize)]
struct StatementStatus {
    state: String,
    error: Option<ServiceError>,
}

#[derive(Debug, Deserialize)]
struct ServiceError {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    schema: Option<Schema>,
    total_chunk_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Schema {
    #[serde(default)]
    columns: Vec<ColumnInfo>,
}

#[derive(Debug, Deserialize)]
struct ColumnInfo {
    name: String,
}

/// 结果分块 (语句响应的 `result` 字段，或分块接口的响应体)
#[derive(Debug, Deserialize)]
struct ResultData {
    data_array: Option<Vec<Vec<Value>>>,
    next_chunk_internal_link: Option<String>,
}

/// 单条语句最多跟随的分块数
const MAX_RESULT_CHUNKS: u64 = 10_000;

/// 解析语句响应体，并沿 `next_chunk_internal_link` 取回剩余分块
///
/// 兼容被 `statement_response` 包裹的返回形式。`fetch_chunk` 收到
/// 内部链接 (以 `/api/2.0/` 开头的路径)，返回该分块的 JSON。
/// 拿到的分块数少于 `total_chunk_count` 时视为响应不完整。
pub fn parse_statement_response<F>(
    body: Value,
    waited: Duration,
    mut fetch_chunk: F,
) -> Result<QueryResult, ExecutorError>
where
    F: FnMut(&str) -> Result<Value, ExecutorError>,
{
    let body = match body {
        Value::Object(mut map) if map.contains_key("statement_response") => map
            .remove("statement_response")
            .unwrap_or(Value::Null),
        other => other,
    };

    let response: StatementResponse = serde_json::from_value(body)
        .map_err(|e| ExecutorError::Malformed(e.to_string()))?;

    let status = response
        .status
        .ok_or_else(|| ExecutorError::Malformed("missing statement status".to_string()))?;

    match status.state.as_str() {
        "SUCCEEDED" => {
            let (schema, total_chunks) = match response.manifest {
                Some(m) => (m.schema, m.total_chunk_count),
                None => (None, None),
            };
            let columns = schema
                .map(|s| s.columns.into_iter().map(|c| c.name).collect())
                .unwrap_or_default();

            let (mut rows, mut next) = match response.result {
                Some(r) => (r.data_array.unwrap_or_default(), r.next_chunk_internal_link),
                None => (Vec::new(), None),
            };
            let mut chunks = 1u64;
            while let Some(link) = next.take() {
                if chunks >= MAX_RESULT_CHUNKS {
                    return Err(ExecutorError::Malformed(format!(
                        "result exceeds {MAX_RESULT_CHUNKS} chunks"
                    )));
                }
                let chunk: ResultData = serde_json::from_value(fetch_chunk(&link)?)
                    .map_err(|e| ExecutorError::Malformed(format!("result chunk: {e}")))?;
                rows.extend(chunk.data_array.unwrap_or_default());
                next = chunk.next_chunk_internal_link;
                chunks += 1;
            }

            if let Some(total) = total_chunks.filter(|&t| t > chunks) {
                return Err(ExecutorError::Malformed(format!(
                    "received {chunks} of {total} result chunks"
                )));
            }
            if chunks > 1 {
                tracing::debug!(chunks, rows = rows.len(), "statement result assembled from chunks");
            }
            Ok(QueryResult { columns, rows })
        }
        "PENDING" | "RUNNING" | "CANCELED" => {
            tracing::debug!(
                statement_id = response.statement_id.as_deref().unwrap_or("?"),
                state = %status.state,
                "statement did not finish within wait timeout"
            );
            Err(ExecutorError::Timeout(waited))
        }
        state => Err(ExecutorError::Rejected {
            state: state.to_string(),
            message: status
                .error
                .and_then(|e| e.message)
                .unwrap_or_else(|| "no error message".to_string()),
        }),
    }
}

/// 基于 Statement Execution API 的执行器
pub struct DatabricksSqlExecutor {
    client: reqwest::blocking::Client,
    workspace: WorkspaceSettings,
    warehouse_id: String,
    wait_timeout: Duration,
    max_attempts: u32,
}

impl DatabricksSqlExecutor {
    pub fn new(
        workspace: WorkspaceSettings,
        warehouse_id: String,
        wait_timeout: Duration,
    ) -> Result<Self, ExecutorError> {
        if warehouse_id.trim().is_empty() {
            return Err(ExecutorError::Config("empty warehouse id".to_string()));
        }

        // HTTP 超时略大于服务端等待时间，服务端先取消语句
        let client = reqwest::blocking::Client::builder()
            .timeout(wait_timeout + Duration::from_secs(10))
            .build()
            .map_err(|e| ExecutorError::Internal(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            workspace,
            warehouse_id,
            wait_timeout,
            max_attempts: 2,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ExecutorError> {
        let workspace = config
            .workspace
            .clone()
            .ok_or_else(|| ExecutorError::NotConfigured("DATABRICKS_HOST / DATABRICKS_TOKEN not set".to_string()))?;
        let warehouse_id = config
            .warehouse_id
            .clone()
            .ok_or_else(|| ExecutorError::NotConfigured("DATABRICKS_WAREHOUSE_ID not set".to_string()))?;
        Self::new(workspace, warehouse_id, config.query_timeout)
    }

    fn send(&self, request: reqwest::blocking::RequestBuilder) -> Result<Value, ExecutorError> {
        let response = request
            .bearer_auth(&self.workspace.token)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    ExecutorError::Timeout(self.wait_timeout)
                } else {
                    ExecutorError::Connectivity(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ExecutorError::Unauthorized(status.as_u16()));
        }
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(ExecutorError::Rejected {
                state: format!("HTTP {}", status.as_u16()),
                message: text,
            });
        }

        response
            .json::<Value>()
            .map_err(|e| ExecutorError::Malformed(e.to_string()))
    }

    fn submit(&self, sql: &str) -> Result<QueryResult, ExecutorError> {
        let body = json!({
            "warehouse_id": self.warehouse_id,
            "statement": sql,
            "wait_timeout": format!("{}s", self.wait_timeout.as_secs()),
            "on_wait_timeout": "CANCEL",
            "format": "JSON_ARRAY",
            "disposition": "INLINE",
        });

        let request = self
            .client
            .post(self.workspace.api_url("/api/2.0/sql/statements"))
            .json(&body);
        let value = self.send(request)?;
        parse_statement_response(value, self.wait_timeout, |link| {
            self.send(self.client.get(self.workspace.api_url(link)))
        })
    }
}

impl QueryExecutor for DatabricksSqlExecutor {
    fn execute(&self, sql: &str) -> Result<QueryResult, ExecutorError> {
        let mut attempt = 1;
        loop {
            match self.submit(sql) {
                // 只重试连接类瞬时故障
                Err(ExecutorError::Connectivity(reason)) if attempt < self.max_attempts => {
                    tracing::warn!(attempt, %reason, "warehouse connection failed, retrying");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(30);

    fn no_chunks(link: &str) -> Result<Value, ExecutorError> {
        panic!("unexpected chunk fetch: {link}")
    }

    #[test]
    fn test_parse_succeeded() {
        let body = json!({
            "statement_id": "01ef",
            "status": {"state": "SUCCEEDED"},
            "manifest": {"schema": {"columns": [{"name": "cnt", "position": 0}]}},
            "result": {"data_array": [["42"]]}
        });
        let result = parse_statement_response(body, WAIT, no_chunks).unwrap();
        assert_eq!(result.columns, vec!["cnt"]);
        assert_eq!(result.scalar_u64().unwrap(), 42);
        assert_eq!(result.column_index("CNT"), Some(0));
    }

    #[test]
    fn test_parse_wrapped_and_empty() {
        let body = json!({
            "statement_response": {
                "status": {"state": "SUCCEEDED"},
                "manifest": {"schema": {"columns": [{"name": "site_name"}]}}
            }
        });
        let result = parse_statement_response(body, WAIT, no_chunks).unwrap();
        assert!(result.rows.is_empty());
        assert!(matches!(result.scalar_u64(), Err(ExecutorError::Malformed(_))));
    }

    #[test]
    fn test_follows_result_chunks() {
        let body = json!({
            "statement_id": "01ef",
            "status": {"state": "SUCCEEDED"},
            "manifest": {
                "schema": {"columns": [{"name": "site_name"}]},
                "total_chunk_count": 3,
                "total_row_count": 4
            },
            "result": {
                "chunk_index": 0,
                "data_array": [["Wichita"], ["Tulsa"]],
                "next_chunk_internal_link": "/api/2.0/sql/statements/01ef/result/chunks/1"
            }
        });

        let mut fetched = Vec::new();
        let result = parse_statement_response(body, WAIT, |link| {
            fetched.push(link.to_string());
            Ok(match link {
                "/api/2.0/sql/statements/01ef/result/chunks/1" => json!({
                    "chunk_index": 1,
                    "data_array": [["Denver"]],
                    "next_chunk_internal_link": "/api/2.0/sql/statements/01ef/result/chunks/2"
                }),
                _ => json!({"chunk_index": 2, "data_array": [["Omaha"]]}),
            })
        })
        .unwrap();

        assert_eq!(fetched.len(), 2);
        let names: Vec<&str> = result.rows.iter().filter_map(|r| r[0].as_str()).collect();
        assert_eq!(names, ["Wichita", "Tulsa", "Denver", "Omaha"]);
    }

    #[test]
    fn test_missing_chunks_are_an_error() {
        let body = json!({
            "status": {"state": "SUCCEEDED"},
            "manifest": {"schema": {"columns": [{"name": "site_name"}]}, "total_chunk_count": 2},
            "result": {"data_array": [["Wichita"]]}
        });
        assert!(matches!(
            parse_statement_response(body, WAIT, no_chunks),
            Err(ExecutorError::Malformed(_))
        ));

        let body = json!({
            "status": {"state": "SUCCEEDED"},
            "manifest": {"schema": {"columns": [{"name": "site_name"}]}, "total_chunk_count": 2},
            "result": {
                "data_array": [["Wichita"]],
                "next_chunk_internal_link": "/api/2.0/sql/statements/01ef/result/chunks/1"
            }
        });
        let result = parse_statement_response(body, WAIT, |_| {
            Err(ExecutorError::Connectivity("reset".into()))
        });
        assert!(matches!(result, Err(ExecutorError::Connectivity(_))));
    }

    #[test]
    fn test_parse_failed_and_timeout() {
        let failed = json!({
            "status": {"state": "FAILED", "error": {"message": "ST_Intersects not found"}}
        });
        match parse_statement_response(failed, WAIT, no_chunks) {
            Err(ExecutorError::Rejected { state, message }) => {
                assert_eq!(state, "FAILED");
                assert!(message.contains("ST_Intersects"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let canceled = json!({"status": {"state": "CANCELED"}});
        assert!(matches!(
            parse_statement_response(canceled, WAIT, no_chunks),
            Err(ExecutorError::Timeout(d)) if d == WAIT
        ));

        assert!(matches!(
            parse_statement_response(json!({"foo": 1}), WAIT, no_chunks),
            Err(ExecutorError::Malformed(_))
        ));
    }

    #[test]
    fn test_scalar_rejects_non_counts() {
        let result = QueryResult {
            columns: vec!["cnt".into()],
            rows: vec![vec![json!("-1")]],
        };
        assert!(result.scalar_u64().is_err());

        let result = QueryResult {
            columns: vec!["cnt".into()],
            rows: vec![vec![json!(7)]],
        };
        assert_eq!(result.scalar_u64().unwrap(), 7);
    }

    #[test]
    fn test_cells() {
        assert_eq!(cell_f64(&json!("37.5")), Some(37.5));
        assert_eq!(cell_f64(&json!(-95)), Some(-95.0));
        assert_eq!(cell_f64(&json!("n/a")), None);
        assert_eq!(cell_f64(&json!("NaN")), None);
        assert_eq!(cell_f64(&Value::Null), None);
        assert_eq!(cell_string(&json!("TX")), Some("TX".to_string()));
        assert_eq!(cell_string(&Value::Null), None);
    }

    #[test]
    fn test_recoverable_categories() {
        assert!(ExecutorError::Timeout(WAIT).is_recoverable());
        assert!(ExecutorError::Connectivity("reset".into()).is_recoverable());
        assert!(ExecutorError::Malformed("x".into()).is_recoverable());
        assert!(ExecutorError::NotConfigured("x".into()).is_recoverable());
        assert!(!ExecutorError::Config("x".into()).is_recoverable());
        assert!(!ExecutorError::Internal("x".into()).is_recoverable());
    }

    #[test]
    fn test_executor_requires_warehouse() {
        let workspace = WorkspaceSettings::new("example.cloud.databricks.com", "t");
        assert!(matches!(
            DatabricksSqlExecutor::new(workspace, " ".into(), WAIT),
            Err(ExecutorError::Config(_))
        ));
    }
}
