//! Crown Lease - 租约组合空间选择引擎
//!
//! 仪表盘与对话前端的 Rust 后端：在地图上画多边形，
//! 远程 (仓库 ST_Intersects) 与本地 (射线法) 双路径计数，
//! 并把地理过滤指令注入给 SQL 生成代理。
//!
//! # 模块结构
//!
//! - `geometry`: 点在多边形内判定 (边界包含)
//! - `polygon_store`: 按上下文划分的多边形存储
//! - `spatial_format`: WKT / ST_Intersects 谓词与提示指令
//! - `reconciler`: 绘制事件 → 选择状态机，远程优先本地回退
//! - `site_catalog`: 站点目录 (R-Tree 预筛)
//! - `warehouse`: 查询执行器 (Databricks SQL Statement API)
//! - `agents`: Genie / 知识助手 / 多代理主管
//! - `chat`: 对话标签页
//! - `dashboard`: 租约筛选与指标
//! - `session`: 会话控制器与注册表
//! - `config`: 环境变量配置
//! - `telemetry`: 日志初始化
//! - `types`: 公共类型定义
//! - `commands`: Tauri IPC 命令处理器 (`desktop` feature)

pub mod agents;
pub mod chat;
pub mod config;
pub mod dashboard;
pub mod geometry;
pub mod polygon_store;
pub mod reconciler;
pub mod session;
pub mod site_catalog;
pub mod spatial_format;
pub mod telemetry;
pub mod types;
pub mod warehouse;

#[cfg(feature = "desktop")]
mod commands;

use config::AppConfig;
use session::{Services, SessionRegistry};
use std::sync::Arc;

/// 应用状态：会话注册表 + 共享协作者
pub struct AppState {
    pub registry: SessionRegistry,
    pub services: Arc<Services>,
}

impl AppState {
    pub fn new(services: Services) -> Self {
        Self {
            registry: SessionRegistry::new(),
            services: Arc::new(services),
        }
    }

    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        Ok(Self::new(Services::from_config(config)?))
    }
}

#[cfg(feature = "desktop")]
#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    telemetry::init_tracing();

    let state = match AppConfig::from_env().and_then(|config| AppState::from_config(&config)) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "failed to start");
            std::process::exit(1);
        }
    };

    let result = tauri::Builder::default()
        .plugin(tauri_plugin_opener::init())
        .manage(state)
        .invoke_handler(tauri::generate_handler![
            // 会话命令
            commands::open_session,
            commands::close_session,
            // 选择命令
            commands::submit_drawings,
            commands::clear_selection,
            commands::get_selection,
            commands::get_map_view,
            // 对话命令
            commands::send_chat,
            commands::cancel_chat,
            commands::get_chat_history,
            commands::clear_chat_history,
            // 仪表盘命令
            commands::get_filter_options,
            commands::set_dashboard_filters,
            commands::toggle_site,
            commands::clear_site,
            commands::get_dashboard,
        ])
        .run(tauri::generate_context!());

    if let Err(e) = result {
        tracing::error!(error = %e, "error while running tauri application");
    }
}
