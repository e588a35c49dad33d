//! 公共类型定义
//!
//! 集中管理跨 IPC 边界的数据传输对象 (DTO)

use crate::polygon_store::{ContextKey, Provenance, SelectionCount, SelectionState};
use serde::Serialize;

/// 选中站点标记颜色
pub const SELECTED_COLOR: &str = "#e63946";
/// 未选中站点标记颜色
pub const UNSELECTED_COLOR: &str = "#2196F3";
pub const SELECTED_RADIUS: u8 = 8;
pub const UNSELECTED_RADIUS: u8 = 6;

/// 地图上一个站点标记的显示状态
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MarkerState {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub state: Option<String>,
    pub tenant: Option<String>,
    pub monthly_revenue: Option<f64>,
    pub selected: bool,
    pub color: &'static str,
    pub radius: u8,
}

/// 地图中心点
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct MapCenter {
    pub lat: f64,
    pub lon: f64,
}

impl Default for MapCenter {
    /// 美国本土地理中心
    fn default() -> Self {
        Self {
            lat: 39.8283,
            lon: -98.5795,
        }
    }
}

/// 某个上下文当前的选择概况
#[derive(Debug, Clone, Serialize)]
pub struct SelectionSummary {
    pub context: ContextKey,
    pub state: SelectionState,
    /// 没有多边形时为 None
    pub count: Option<SelectionCount>,
    pub provenance: Option<Provenance>,
    /// 当前多边形的 WKT (调试用)
    pub wkt: Option<String>,
    /// 显示在对话输入框下方的说明文字
    pub caption: Option<String>,
}

/// 地图视图：标记 + 中心 + 选择概况
#[derive(Debug, Clone, Serialize)]
pub struct MapView {
    pub center: MapCenter,
    pub markers: Vec<MarkerState>,
    pub selection: SelectionSummary,
}
