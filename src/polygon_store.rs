//! 多边形存储
//!
//! 每个上下文 (仪表盘地图、两个对话地图) 各自持有一个当前多边形
//! 和最近一次计算出的选择结果。三个槽位互相独立，从不共享。

use crate::geometry::Polygon;
use serde::{Deserialize, Serialize};

/// 逻辑上下文 (固定的封闭集合)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextKey {
    Dashboard,
    ChatPrimary,
    ChatSecondary,
}

impl ContextKey {
    pub const ALL: [ContextKey; 3] = [
        ContextKey::Dashboard,
        ContextKey::ChatPrimary,
        ContextKey::ChatSecondary,
    ];

    fn slot(self) -> usize {
        match self {
            ContextKey::Dashboard => 0,
            ContextKey::ChatPrimary => 1,
            ContextKey::ChatSecondary => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContextKey::Dashboard => "dashboard",
            ContextKey::ChatPrimary => "chat-primary",
            ContextKey::ChatSecondary => "chat-secondary",
        }
    }
}

/// 计数来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// 仓库端 ST_Intersects 计数 (权威)
    Remote,
    /// 远程失败后本地点在多边形内判定
    LocalFallback,
}

/// 选择计数
///
/// `Unavailable` 表示两条路径都拿不到结果，与 "选中 0 个站点" 区分开。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SelectionCount {
    Count(u64),
    Unavailable,
}

impl SelectionCount {
    pub fn value(&self) -> Option<u64> {
        match self {
            SelectionCount::Count(n) => Some(*n),
            SelectionCount::Unavailable => None,
        }
    }
}

/// 多边形对应的选择结果 (瞬态，不持久化)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SelectionResult {
    pub count: SelectionCount,
    pub provenance: Provenance,
}

/// 上下文状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionState {
    NoSelection,
    SelectionActive,
}

#[derive(Debug, Default, Clone)]
struct Slot {
    polygon: Option<Polygon>,
    result: Option<SelectionResult>,
}

/// 按上下文划分的多边形存储
#[derive(Debug, Default, Clone)]
pub struct PolygonStore {
    slots: [Slot; 3],
}

impl PolygonStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 替换多边形，同时丢弃旧的选择结果 (调用方负责重新计算)
    pub fn set(&mut self, context: ContextKey, polygon: Polygon) {
        let slot = &mut self.slots[context.slot()];
        slot.polygon = Some(polygon);
        slot.result = None;
    }

    /// 清除多边形和选择结果
    pub fn clear(&mut self, context: ContextKey) {
        self.slots[context.slot()] = Slot::default();
    }

    pub fn get(&self, context: ContextKey) -> Option<&Polygon> {
        self.slots[context.slot()].polygon.as_ref()
    }

    pub fn result(&self, context: ContextKey) -> Option<SelectionResult> {
        self.slots[context.slot()].result
    }

    /// 记录计算结果 (没有多边形时忽略)
    pub fn record_result(&mut self, context: ContextKey, result: SelectionResult) {
        let slot = &mut self.slots[context.slot()];
        if slot.polygon.is_some() {
            slot.result = Some(result);
        }
    }

    pub fn state(&self, context: ContextKey) -> SelectionState {
        if self.get(context).is_some() {
            SelectionState::SelectionActive
        } else {
            SelectionState::NoSelection
        }
    }
}
