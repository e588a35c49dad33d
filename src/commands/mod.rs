//! Tauri IPC 命令处理器
//!
//! 按功能分组：
//! - `session`: 会话打开与关闭
//! - `selection`: 多边形选择与地图视图
//! - `chat`: 对话标签页
//! - `dashboard`: 租约仪表盘

mod chat;
mod dashboard;
mod selection;
mod session;

pub use chat::*;
pub use dashboard::*;
pub use selection::*;
pub use session::*;
