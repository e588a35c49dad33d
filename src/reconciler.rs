//! 选择协调器
//!
//! 职责：
//! - 解析绘制层的 `all_drawings` 负载
//! - 驱动每个上下文的 NoSelection / SelectionActive 状态机
//! - 远程计数优先，可恢复的远程故障回退到本地判定
//!
//! 所有上下文共用同一套逻辑，差别只在 `ContextKey`。

use crate::geometry::{parse_json_ring, LonLat, Polygon};
use crate::polygon_store::{
    ContextKey, PolygonStore, Provenance, SelectionCount, SelectionState,
};
use crate::site_catalog::SiteCatalog;
use crate::spatial_format;
use crate::warehouse::{ExecutorError, QueryExecutor};
use serde::Serialize;
use serde_json::Value;
use std::time::Instant;

pub use crate::polygon_store::SelectionResult;

/// 绘制层事件
#[derive(Debug, Clone, PartialEq)]
pub enum DrawEvent {
    /// 最后一个图形是多边形或矩形
    Drawn(Vec<LonLat>),
    /// 图形全部被删除
    AllRemoved,
    /// 无变化 (或最后一个图形不是面)
    Unchanged,
}

impl DrawEvent {
    /// 从 `{ "all_drawings": [...] }` 形式的地图回传数据解析
    pub fn from_map_data(map_data: &Value) -> Self {
        Self::from_drawings(map_data.get("all_drawings").unwrap_or(&Value::Null))
    }

    /// 解析 `all_drawings` 列表，最后一个图形生效
    pub fn from_drawings(drawings: &Value) -> Self {
        let Some(items) = drawings.as_array() else {
            return DrawEvent::Unchanged;
        };
        let Some(last) = items.last() else {
            return DrawEvent::AllRemoved;
        };

        let geometry = last.get("geometry");
        let kind = geometry.and_then(|g| g.get("type")).and_then(Value::as_str);
        if !matches!(kind, Some("Polygon") | Some("Rectangle")) {
            return DrawEvent::Unchanged;
        }

        // 外环 (GeoJSON coordinates[0])
        let outer = geometry
            .and_then(|g| g.get("coordinates"))
            .and_then(|c| c.get(0));
        match outer.map(parse_json_ring) {
            Some(Ok(ring)) => DrawEvent::Drawn(ring),
            Some(Err(e)) => {
                tracing::debug!(error = %e, "ignoring drawing with malformed coordinates");
                DrawEvent::Unchanged
            }
            None => DrawEvent::Unchanged,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("spatial count failed: {0}")]
    Executor(#[from] ExecutorError),
}

/// 一次协调的结果
#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub context: ContextKey,
    pub from: SelectionState,
    pub to: SelectionState,
    /// 本次是否修改了存储
    pub changed: bool,
    pub result: Option<SelectionResult>,
}

/// 已完成计数、尚未提交的变化
#[derive(Debug, Clone, PartialEq)]
pub enum PendingChange {
    Keep,
    Clear,
    Replace {
        polygon: Polygon,
        result: SelectionResult,
    },
}

pub struct Reconciler {
    table: String,
}

impl Reconciler {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    /// 处理一个绘制事件 (计数后立即提交到存储)
    ///
    /// 不可恢复的执行器错误 (配置、内部错误) 原样返回，
    /// 该上下文保持原来的多边形和结果。
    pub fn apply(
        &self,
        store: &mut PolygonStore,
        context: ContextKey,
        event: DrawEvent,
        executor: &dyn QueryExecutor,
        catalog: Option<&SiteCatalog>,
    ) -> Result<Transition, ReconcileError> {
        let change = self.evaluate(context, event, executor, catalog)?;
        Ok(self.commit(store, context, change))
    }

    /// 计算绘制事件带来的变化，不触碰存储
    ///
    /// 远程计数在这里完成，调用方可以在不持有会话锁的情况下调用。
    pub fn evaluate(
        &self,
        context: ContextKey,
        event: DrawEvent,
        executor: &dyn QueryExecutor,
        catalog: Option<&SiteCatalog>,
    ) -> Result<PendingChange, ReconcileError> {
        match event {
            DrawEvent::Unchanged => Ok(PendingChange::Keep),
            DrawEvent::AllRemoved => Ok(PendingChange::Clear),
            DrawEvent::Drawn(ring) => {
                let polygon = match Polygon::from_ring(ring) {
                    Ok(p) => p,
                    Err(e) => {
                        // 退化图形：保留原选择
                        tracing::debug!(context = context.as_str(), error = %e, "ignoring degenerate drawing");
                        return Ok(PendingChange::Keep);
                    }
                };
                let result = self.count(context, &polygon, executor, catalog)?;
                Ok(PendingChange::Replace { polygon, result })
            }
        }
    }

    /// 把计算好的变化写入存储
    pub fn commit(&self, store: &mut PolygonStore, context: ContextKey, change: PendingChange) -> Transition {
        let from = store.state(context);

        match change {
            PendingChange::Keep => self.unchanged(store, context, from),
            PendingChange::Clear => {
                store.clear(context);
                if from == SelectionState::SelectionActive {
                    tracing::info!(context = context.as_str(), "selection cleared");
                }
                Transition {
                    context,
                    from,
                    to: SelectionState::NoSelection,
                    changed: from == SelectionState::SelectionActive,
                    result: None,
                }
            }
            PendingChange::Replace { polygon, result } => {
                store.set(context, polygon);
                store.record_result(context, result);
                Transition {
                    context,
                    from,
                    to: SelectionState::SelectionActive,
                    changed: true,
                    result: Some(result),
                }
            }
        }
    }

    fn unchanged(&self, store: &PolygonStore, context: ContextKey, from: SelectionState) -> Transition {
        Transition {
            context,
            from,
            to: from,
            changed: false,
            result: store.result(context),
        }
    }

    /// 远程计数，可恢复故障时本地回退
    pub fn count(
        &self,
        context: ContextKey,
        polygon: &Polygon,
        executor: &dyn QueryExecutor,
        catalog: Option<&SiteCatalog>,
    ) -> Result<SelectionResult, ReconcileError> {
        let sql = spatial_format::count_query(&self.table, polygon.ring());
        let start = Instant::now();

        let remote = executor.execute(&sql).and_then(|r| r.scalar_u64());
        match remote {
            Ok(n) => {
                tracing::info!(
                    context = context.as_str(),
                    count = n,
                    provenance = "remote",
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "selection counted"
                );
                Ok(SelectionResult {
                    count: SelectionCount::Count(n),
                    provenance: Provenance::Remote,
                })
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!(
                    context = context.as_str(),
                    category = e.category(),
                    error = %e,
                    "remote spatial count failed, falling back to local evaluation"
                );
                let count = match catalog {
                    Some(catalog) => SelectionCount::Count(catalog.count_within(polygon)),
                    None => SelectionCount::Unavailable,
                };
                tracing::info!(
                    context = context.as_str(),
                    count = ?count,
                    provenance = "local_fallback",
                    "selection counted"
                );
                Ok(SelectionResult {
                    count,
                    provenance: Provenance::LocalFallback,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site_catalog::Site;
    use crate::warehouse::QueryResult;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// 可编排的执行器：按顺序返回预设结果，并记录调用
    struct FakeExecutor {
        responses: Mutex<Vec<Result<QueryResult, ExecutorError>>>,
        calls: AtomicUsize,
        last_sql: Mutex<Option<String>>,
    }

    impl FakeExecutor {
        fn new(responses: Vec<Result<QueryResult, ExecutorError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
                last_sql: Mutex::new(None),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl QueryExecutor for FakeExecutor {
        fn execute(&self, sql: &str) -> Result<QueryResult, ExecutorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_sql.lock().unwrap() = Some(sql.to_string());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(ExecutorError::Connectivity("no scripted response".into()));
            }
            responses.remove(0)
        }
    }

    fn count_result(n: u64) -> Result<QueryResult, ExecutorError> {
        Ok(QueryResult {
            columns: vec!["cnt".into()],
            rows: vec![vec![json!(n.to_string())]],
        })
    }

    fn site(name: &str, lon: f64, lat: f64) -> Site {
        Site {
            name: name.to_string(),
            lat,
            lon,
            state: None,
            tenant: None,
            monthly_revenue: None,
        }
    }

    fn catalog() -> SiteCatalog {
        SiteCatalog::new(vec![
            site("Wichita", -97.3, 37.7),
            site("Tulsa", -95.9, 36.15),
            site("Omaha", -95.9, 41.25),
            site("Edge", -100.0, 38.0),
            site("Denver", -104.99, 39.74),
        ])
    }

    fn central_us_box() -> Vec<LonLat> {
        vec![
            LonLat::new(-100.0, 40.0),
            LonLat::new(-90.0, 40.0),
            LonLat::new(-90.0, 35.0),
            LonLat::new(-100.0, 35.0),
        ]
    }

    fn rocky_box() -> Vec<LonLat> {
        vec![
            LonLat::new(-106.0, 38.0),
            LonLat::new(-104.0, 38.0),
            LonLat::new(-104.0, 41.0),
            LonLat::new(-106.0, 41.0),
        ]
    }

    #[test]
    fn test_remote_count_success() {
        let executor = FakeExecutor::new(vec![count_result(3)]);
        let reconciler = Reconciler::new("t");
        let mut store = PolygonStore::new();

        let t = reconciler
            .apply(
                &mut store,
                ContextKey::ChatPrimary,
                DrawEvent::Drawn(central_us_box()),
                &executor,
                Some(&catalog()),
            )
            .unwrap();

        assert_eq!(t.from, SelectionState::NoSelection);
        assert_eq!(t.to, SelectionState::SelectionActive);
        let result = t.result.unwrap();
        assert_eq!(result.count, SelectionCount::Count(3));
        assert_eq!(result.provenance, Provenance::Remote);
        assert_eq!(store.result(ContextKey::ChatPrimary), Some(result));

        let sql = executor.last_sql.lock().unwrap().clone().unwrap();
        assert!(sql.contains("ST_Intersects"));
        assert!(sql.contains("FROM t"));
    }

    #[test]
    fn test_fallback_matches_local_evaluator() {
        let catalog = catalog();
        let polygon = Polygon::from_ring(central_us_box()).unwrap();
        let expected = catalog
            .sites()
            .iter()
            .filter(|s| crate::geometry::contains(s.location(), polygon.ring()))
            .count() as u64;
        assert_eq!(expected, 3);

        for error in [
            ExecutorError::Timeout(Duration::from_secs(30)),
            ExecutorError::Connectivity("reset".into()),
            ExecutorError::Unauthorized(403),
            ExecutorError::Rejected {
                state: "FAILED".into(),
                message: "unknown function".into(),
            },
            ExecutorError::Malformed("bad json".into()),
        ] {
            let executor = FakeExecutor::new(vec![Err(error)]);
            let mut store = PolygonStore::new();
            let t = Reconciler::new("t")
                .apply(
                    &mut store,
                    ContextKey::Dashboard,
                    DrawEvent::Drawn(central_us_box()),
                    &executor,
                    Some(&catalog),
                )
                .unwrap();
            let result = t.result.unwrap();
            assert_eq!(result.count, SelectionCount::Count(expected));
            assert_eq!(result.provenance, Provenance::LocalFallback);
        }
    }

    #[test]
    fn test_unparseable_count_falls_back() {
        let executor = FakeExecutor::new(vec![Ok(QueryResult::default())]);
        let mut store = PolygonStore::new();
        let t = Reconciler::new("t")
            .apply(
                &mut store,
                ContextKey::Dashboard,
                DrawEvent::Drawn(central_us_box()),
                &executor,
                Some(&catalog()),
            )
            .unwrap();
        assert_eq!(t.result.unwrap().provenance, Provenance::LocalFallback);
    }

    #[test]
    fn test_fallback_without_catalog_is_unavailable() {
        let executor = FakeExecutor::new(vec![Err(ExecutorError::Connectivity("down".into()))]);
        let mut store = PolygonStore::new();
        let t = Reconciler::new("t")
            .apply(
                &mut store,
                ContextKey::ChatSecondary,
                DrawEvent::Drawn(central_us_box()),
                &executor,
                None,
            )
            .unwrap();
        let result = t.result.unwrap();
        assert_eq!(result.count, SelectionCount::Unavailable);
        assert_eq!(result.count.value(), None);
        assert_eq!(store.state(ContextKey::ChatSecondary), SelectionState::SelectionActive);
    }

    #[test]
    fn test_non_recoverable_error_keeps_previous_selection() {
        let executor = FakeExecutor::new(vec![
            count_result(3),
            Err(ExecutorError::Internal("bad client".into())),
        ]);
        let reconciler = Reconciler::new("t");
        let mut store = PolygonStore::new();
        let ctx = ContextKey::Dashboard;

        reconciler
            .apply(&mut store, ctx, DrawEvent::Drawn(central_us_box()), &executor, Some(&catalog()))
            .unwrap();
        let err = reconciler
            .apply(&mut store, ctx, DrawEvent::Drawn(rocky_box()), &executor, Some(&catalog()))
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Executor(ExecutorError::Internal(_))));

        assert_eq!(store.state(ctx), SelectionState::SelectionActive);
        assert_eq!(store.get(ctx).unwrap().ring(), central_us_box().as_slice());
        assert_eq!(store.result(ctx).unwrap().count, SelectionCount::Count(3));
    }

    #[test]
    fn test_non_recoverable_error_on_first_draw_stays_empty() {
        let executor = FakeExecutor::new(vec![Err(ExecutorError::Config("empty warehouse id".into()))]);
        let mut store = PolygonStore::new();
        let err = Reconciler::new("t")
            .apply(
                &mut store,
                ContextKey::Dashboard,
                DrawEvent::Drawn(central_us_box()),
                &executor,
                Some(&catalog()),
            )
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Executor(ExecutorError::Config(_))));
        assert_eq!(store.state(ContextKey::Dashboard), SelectionState::NoSelection);
        assert!(store.result(ContextKey::Dashboard).is_none());
    }

    #[test]
    fn test_unconfigured_warehouse_falls_back() {
        let executor = FakeExecutor::new(vec![Err(ExecutorError::NotConfigured("no warehouse".into()))]);
        let mut store = PolygonStore::new();
        let t = Reconciler::new("t")
            .apply(
                &mut store,
                ContextKey::Dashboard,
                DrawEvent::Drawn(central_us_box()),
                &executor,
                Some(&catalog()),
            )
            .unwrap();
        let result = t.result.unwrap();
        assert_eq!(result.provenance, Provenance::LocalFallback);
        assert_eq!(result.count, SelectionCount::Count(3));
    }

    #[test]
    fn test_redraw_replaces_selection() {
        let catalog = catalog();
        let executor = FakeExecutor::new(vec![
            Err(ExecutorError::Timeout(Duration::from_secs(30))),
            Err(ExecutorError::Timeout(Duration::from_secs(30))),
        ]);
        let reconciler = Reconciler::new("t");
        let mut store = PolygonStore::new();
        let ctx = ContextKey::ChatPrimary;

        reconciler
            .apply(&mut store, ctx, DrawEvent::Drawn(central_us_box()), &executor, Some(&catalog))
            .unwrap();
        let first: Vec<String> = catalog
            .markers(store.get(ctx))
            .into_iter()
            .filter(|m| m.selected)
            .map(|m| m.name)
            .collect();
        assert_eq!(first, vec!["Wichita", "Tulsa", "Edge"]);

        let t = reconciler
            .apply(&mut store, ctx, DrawEvent::Drawn(rocky_box()), &executor, Some(&catalog))
            .unwrap();
        assert_eq!(t.from, SelectionState::SelectionActive);
        assert_eq!(t.to, SelectionState::SelectionActive);
        assert_eq!(t.result.unwrap().count, SelectionCount::Count(1));

        let second: Vec<String> = catalog
            .markers(store.get(ctx))
            .into_iter()
            .filter(|m| m.selected)
            .map(|m| m.name)
            .collect();
        assert_eq!(second, vec!["Denver"]);
    }

    #[test]
    fn test_clear_makes_no_executor_call() {
        let executor = FakeExecutor::new(vec![count_result(3)]);
        let reconciler = Reconciler::new("t");
        let mut store = PolygonStore::new();
        let ctx = ContextKey::Dashboard;

        reconciler
            .apply(&mut store, ctx, DrawEvent::Drawn(central_us_box()), &executor, None)
            .unwrap();
        assert_eq!(executor.calls(), 1);

        let t = reconciler
            .apply(&mut store, ctx, DrawEvent::AllRemoved, &executor, None)
            .unwrap();
        assert_eq!(executor.calls(), 1);
        assert_eq!(t.to, SelectionState::NoSelection);
        assert!(t.changed);
        assert!(store.get(ctx).is_none());
        assert!(store.result(ctx).is_none());
    }

    #[test]
    fn test_degenerate_drawing_is_ignored() {
        let executor = FakeExecutor::new(vec![count_result(3)]);
        let reconciler = Reconciler::new("t");
        let mut store = PolygonStore::new();
        let ctx = ContextKey::ChatPrimary;

        reconciler
            .apply(&mut store, ctx, DrawEvent::Drawn(central_us_box()), &executor, None)
            .unwrap();

        let line = vec![LonLat::new(0.0, 0.0), LonLat::new(1.0, 1.0), LonLat::new(0.0, 0.0)];
        let t = reconciler
            .apply(&mut store, ctx, DrawEvent::Drawn(line), &executor, None)
            .unwrap();
        assert!(!t.changed);
        assert_eq!(executor.calls(), 1);
        assert_eq!(store.get(ctx).map(|p| p.ring().len()), Some(4));
        assert_eq!(t.result.unwrap().count, SelectionCount::Count(3));
    }

    #[test]
    fn test_contexts_do_not_interfere() {
        let executor = FakeExecutor::new(vec![count_result(3)]);
        let reconciler = Reconciler::new("t");
        let mut store = PolygonStore::new();

        reconciler
            .apply(
                &mut store,
                ContextKey::ChatPrimary,
                DrawEvent::Drawn(central_us_box()),
                &executor,
                None,
            )
            .unwrap();
        reconciler
            .apply(&mut store, ContextKey::ChatSecondary, DrawEvent::AllRemoved, &executor, None)
            .unwrap();

        assert!(store.get(ContextKey::ChatPrimary).is_some());
        assert!(store.get(ContextKey::Dashboard).is_none());
    }

    #[test]
    fn test_parse_drawings() {
        assert_eq!(DrawEvent::from_drawings(&Value::Null), DrawEvent::Unchanged);
        assert_eq!(DrawEvent::from_drawings(&json!([])), DrawEvent::AllRemoved);
        assert_eq!(DrawEvent::from_map_data(&json!({})), DrawEvent::Unchanged);

        let polygon = json!({
            "type": "Feature",
            "geometry": {"type": "Polygon", "coordinates": [[[-100, 40], [-90, 40], [-90, 35], [-100, 40]]]}
        });
        let line = json!({
            "type": "Feature",
            "geometry": {"type": "LineString", "coordinates": [[-100, 40], [-90, 40]]}
        });
        let rectangle = json!({
            "type": "Feature",
            "geometry": {"type": "Rectangle", "coordinates": [[[1, 1], [2, 1], [2, 2], [1, 2], [1, 1]]]}
        });

        match DrawEvent::from_map_data(&json!({ "all_drawings": [line.clone(), polygon.clone()] })) {
            DrawEvent::Drawn(ring) => {
                assert_eq!(ring.len(), 4);
                assert_eq!(ring[0], LonLat::new(-100.0, 40.0));
            }
            other => panic!("unexpected {other:?}"),
        }

        // 最后一个是线：不改变选择
        assert_eq!(
            DrawEvent::from_drawings(&json!([polygon, line])),
            DrawEvent::Unchanged
        );

        assert!(matches!(
            DrawEvent::from_drawings(&json!([rectangle])),
            DrawEvent::Drawn(ring) if ring.len() == 5
        ));

        let broken = json!([{ "geometry": {"type": "Polygon", "coordinates": [[["a", 1]]]} }]);
        assert_eq!(DrawEvent::from_drawings(&broken), DrawEvent::Unchanged);
    }
}
