//! 对话命令
//!
//! 发送消息会阻塞直到代理回复、超时或被取消

use crate::agents::{AgentKind, ChatMessage};
use crate::chat::ChatOutcome;
use crate::session::{self, lock};
use crate::AppState;
use std::sync::Arc;
use tauri::State;

/// 发送一条消息 (异步命令)
#[tauri::command]
pub async fn send_chat(
    session_id: String,
    agent: AgentKind,
    prompt: String,
    state: State<'_, AppState>,
) -> Result<ChatOutcome, String> {
    let session = state.registry.open(&session_id);
    let services = Arc::clone(&state.services);

    tokio::task::spawn_blocking(move || {
        session::chat_turn(&session, &services, agent, &prompt).map_err(|e| format!("{e:#}"))
    })
    .await
    .map_err(|e| e.to_string())?
}

/// 取消进行中的请求
#[tauri::command]
pub fn cancel_chat(session_id: String, agent: AgentKind, state: State<AppState>) -> bool {
    match state.registry.get(&session_id) {
        Some(session) => lock(&session).cancel_turn(agent),
        None => false,
    }
}

#[tauri::command]
pub fn get_chat_history(
    session_id: String,
    agent: AgentKind,
    state: State<AppState>,
) -> Vec<ChatMessage> {
    match state.registry.get(&session_id) {
        Some(session) => lock(&session).history(agent).to_vec(),
        None => Vec::new(),
    }
}

#[tauri::command]
pub fn clear_chat_history(session_id: String, agent: AgentKind, state: State<AppState>) {
    if let Some(session) = state.registry.get(&session_id) {
        lock(&session).clear_history(agent);
    }
}
