//! 仪表盘命令

use crate::dashboard::{FilterOptions, LeaseFilters};
use crate::session::{self, lock, DashboardView};
use crate::AppState;
use std::sync::Arc;
use tauri::State;

/// 获取筛选下拉框选项
#[tauri::command]
pub async fn get_filter_options(state: State<'_, AppState>) -> Result<FilterOptions, String> {
    let services = Arc::clone(&state.services);

    tokio::task::spawn_blocking(move || {
        session::filter_options(&services).map_err(|e| format!("{e:#}"))
    })
    .await
    .map_err(|e| e.to_string())?
}

#[tauri::command]
pub fn set_dashboard_filters(session_id: String, filters: LeaseFilters, state: State<AppState>) {
    let session = state.registry.open(&session_id);
    lock(&session).set_filters(filters);
}

/// 点击站点标记：再次点击同一站点取消选中
#[tauri::command]
pub fn toggle_site(session_id: String, site: String, state: State<AppState>) -> Option<String> {
    lock(&state.registry.open(&session_id))
        .toggle_site(&site)
        .map(str::to_string)
}

#[tauri::command]
pub fn clear_site(session_id: String, state: State<AppState>) {
    let session = state.registry.open(&session_id);
    lock(&session).clear_site();
}

/// 重新计算仪表盘 (指标、明细、标记)
#[tauri::command]
pub async fn get_dashboard(
    session_id: String,
    state: State<'_, AppState>,
) -> Result<DashboardView, String> {
    let session = state.registry.open(&session_id);
    let services = Arc::clone(&state.services);

    tokio::task::spawn_blocking(move || {
        session::dashboard_view(&session, &services).map_err(|e| format!("{e:#}"))
    })
    .await
    .map_err(|e| e.to_string())?
}
