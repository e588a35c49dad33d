//! 会话命令
//!
//! 每个窗口一个会话，由前端传入会话 ID

use crate::types::SelectionSummary;
use crate::polygon_store::ContextKey;
use crate::session::lock;
use crate::AppState;
use tauri::State;

/// 打开 (或复用) 会话，返回各上下文的选择摘要
#[tauri::command]
pub fn open_session(session_id: String, state: State<AppState>) -> Vec<SelectionSummary> {
    let session = state.registry.open(&session_id);
    let session = lock(&session);
    ContextKey::ALL
        .iter()
        .map(|&context| session.selection_summary(context))
        .collect()
}

/// 关闭会话 (取消进行中的对话请求)
#[tauri::command]
pub fn close_session(session_id: String, state: State<AppState>) -> bool {
    state.registry.close(&session_id)
}
