//! 日志初始化
//!
//! 过滤规则优先取 `CROWN_LEASE_LOG`，其次 `RUST_LOG`，默认 `info`。

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "CROWN_LEASE_LOG";

/// 按给定的环境变量值构建过滤器，非法规则退回默认级别
pub fn build_filter(crate_filter: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    crate_filter
        .or(rust_log)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// 安装全局订阅者 (重复调用无副作用)
pub fn init_tracing() {
    let crate_filter = std::env::var(LOG_ENV).ok();
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = build_filter(crate_filter.as_deref(), rust_log.as_deref());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
