//! 选择命令
//!
//! 绘制事件需要访问仓库，放到阻塞线程池执行；查询期间不持有会话锁

use crate::polygon_store::ContextKey;
use crate::reconciler::DrawEvent;
use crate::session::{self, lock};
use crate::types::{MapView, SelectionSummary};
use crate::AppState;
use serde_json::Value;
use std::sync::Arc;
use tauri::State;

/// 提交地图绘制数据，返回更新后的地图视图
#[tauri::command]
pub async fn submit_drawings(
    session_id: String,
    context: ContextKey,
    map_data: Value,
    state: State<'_, AppState>,
) -> Result<MapView, String> {
    let session = state.registry.open(&session_id);
    let services = Arc::clone(&state.services);
    let event = DrawEvent::from_map_data(&map_data);

    tokio::task::spawn_blocking(move || {
        session::submit_draw(&session, &services, context, event).map_err(|e| e.to_string())
    })
    .await
    .map_err(|e| e.to_string())?
}

/// 清除某个上下文的选择
#[tauri::command]
pub fn clear_selection(
    session_id: String,
    context: ContextKey,
    state: State<AppState>,
) -> SelectionSummary {
    let session = state.registry.open(&session_id);
    let mut session = lock(&session);
    session.clear_selection(context);
    session.selection_summary(context)
}

#[tauri::command]
pub fn get_selection(
    session_id: String,
    context: ContextKey,
    state: State<AppState>,
) -> SelectionSummary {
    lock(&state.registry.open(&session_id)).selection_summary(context)
}

/// 获取地图视图 (可能需要刷新站点目录)
#[tauri::command]
pub async fn get_map_view(
    session_id: String,
    context: ContextKey,
    state: State<'_, AppState>,
) -> Result<MapView, String> {
    let session = state.registry.open(&session_id);
    let services = Arc::clone(&state.services);

    tokio::task::spawn_blocking(move || session::map_view(&session, &services, context))
        .await
        .map_err(|e| e.to_string())
}
