//! 运行配置
//!
//! 全部来自环境变量。凭证只是透传给 HTTP 客户端，不在这里管理。

use anyhow::{anyhow, bail, Result};
use std::time::Duration;

pub const DEFAULT_TABLE: &str = "bricks_demo.crown_demo.synth_data";
pub const DEFAULT_KNOWLEDGE_ASSISTANT_ENDPOINT: &str = "ka-870aa40a-endpoint";
pub const DEFAULT_SUPERVISOR_ENDPOINT: &str = "mas-5b54bbfa-endpoint";

/// Databricks 工作区地址与令牌
#[derive(Clone)]
pub struct WorkspaceSettings {
    /// 规范化后的基础地址 (https://host，无结尾斜杠)
    pub host: String,
    pub token: String,
}

impl std::fmt::Debug for WorkspaceSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceSettings")
            .field("host", &self.host)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl WorkspaceSettings {
    pub fn new(host: &str, token: &str) -> Self {
        Self {
            host: normalize_host(host),
            token: token.to_string(),
        }
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("{}/{}", self.host, path.trim_start_matches('/'))
    }
}

/// 统一为 `https://host` 形式
pub fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    let bare = host
        .strip_prefix("https://")
        .or_else(|| host.strip_prefix("http://"))
        .unwrap_or(host);
    format!("https://{bare}")
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub workspace: Option<WorkspaceSettings>,
    pub warehouse_id: Option<String>,
    pub genie_space_id: Option<String>,
    pub table: String,
    pub knowledge_assistant_endpoint: String,
    pub supervisor_endpoint: String,
    /// 语句执行 API 的 wait_timeout (5..=50 秒)
    pub query_timeout: Duration,
    pub genie_timeout: Duration,
    pub assistant_timeout: Duration,
    pub supervisor_timeout: Duration,
    pub site_cache_ttl: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let workspace = match (get("DATABRICKS_HOST"), get("DATABRICKS_TOKEN")) {
            (Some(host), Some(token)) => Some(WorkspaceSettings::new(&host, &token)),
            _ => None,
        };

        let table = get("CROWN_LEASE_TABLE").unwrap_or_else(|| DEFAULT_TABLE.to_string());
        validate_table_name(&table)?;

        Ok(Self {
            workspace,
            warehouse_id: get("DATABRICKS_WAREHOUSE_ID"),
            genie_space_id: get("GENIE_SPACE_ID"),
            table,
            knowledge_assistant_endpoint: get("KNOWLEDGE_ASSISTANT_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_KNOWLEDGE_ASSISTANT_ENDPOINT.to_string()),
            supervisor_endpoint: get("SUPERVISOR_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_SUPERVISOR_ENDPOINT.to_string()),
            query_timeout: env_secs(&get, "CROWN_LEASE_QUERY_TIMEOUT_SECS", 30, 5, 50)?,
            genie_timeout: env_secs(&get, "CROWN_LEASE_GENIE_TIMEOUT_SECS", 120, 1, 3600)?,
            assistant_timeout: env_secs(&get, "CROWN_LEASE_ASSISTANT_TIMEOUT_SECS", 120, 1, 3600)?,
            supervisor_timeout: env_secs(&get, "CROWN_LEASE_SUPERVISOR_TIMEOUT_SECS", 600, 1, 3600)?,
            site_cache_ttl: env_secs(&get, "CROWN_LEASE_SITE_CACHE_TTL_SECS", 60, 0, 86_400)?,
        })
    }
}

fn env_secs<G>(get: &G, name: &str, default: u64, min: u64, max: u64) -> Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    let secs = match get(name) {
        None => default,
        Some(v) => v
            .parse::<u64>()
            .map_err(|_| anyhow!("invalid {name}={v:?} (expected integer seconds)"))?,
    };
    if secs < min || secs > max {
        bail!("{name}={secs} out of range ({min}..={max})");
    }
    Ok(Duration::from_secs(secs))
}

/// 表名会直接拼进 SQL，只允许 `catalog.schema.table` 形式的标识符
fn validate_table_name(table: &str) -> Result<()> {
    let valid = table
        .split('.')
        .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    if !valid {
        bail!("invalid CROWN_LEASE_TABLE={table:?}");
    }
    Ok(())
}
