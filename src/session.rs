//! 会话控制器
//!
//! 每个窗口 (或浏览器会话) 一个 `Session`，持有：
//! - 三个上下文的多边形存储
//! - 三个对话标签页的历史和进行中的取消令牌
//! - 仪表盘筛选与单站点选择
//! - 带 TTL 的站点目录缓存
//!
//! 会话由 `SessionRegistry` 创建和销毁，进程内没有全局可变状态。
//! 共享的只有无状态协作者 (`Services`)。

use crate::agents::genie::GenieAgent;
use crate::agents::serving::ServingAgent;
use crate::agents::{AgentKind, CancelToken, ChatMessage, ConversationalAgent};
use crate::chat::{self, ChatHistory, ChatOutcome};
use crate::config::AppConfig;
use crate::dashboard::{self, FilterOptions, LeaseFilters, LeaseRecord, PortfolioMetrics};
use crate::geometry::Polygon;
use crate::polygon_store::{ContextKey, PolygonStore};
use crate::reconciler::{DrawEvent, ReconcileError, Reconciler, Transition};
use crate::site_catalog::SiteCatalog;
use crate::spatial_format;
use crate::types::{MapCenter, MapView, MarkerState, SelectionSummary};
use crate::warehouse::{DatabricksSqlExecutor, ExecutorError, QueryExecutor, QueryResult};
use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// 所有会话共享的协作者
pub struct Services {
    pub table: String,
    pub site_cache_ttl: Duration,
    pub reconciler: Reconciler,
    pub executor: Arc<dyn QueryExecutor>,
    agents: HashMap<AgentKind, Arc<dyn ConversationalAgent>>,
}

/// 未配置仓库时使用的执行器
struct UnconfiguredExecutor(String);

impl QueryExecutor for UnconfiguredExecutor {
    fn execute(&self, _sql: &str) -> Result<QueryResult, ExecutorError> {
        Err(ExecutorError::NotConfigured(self.0.clone()))
    }
}

impl Services {
    pub fn new(
        table: impl Into<String>,
        site_cache_ttl: Duration,
        executor: Arc<dyn QueryExecutor>,
        agents: Vec<Arc<dyn ConversationalAgent>>,
    ) -> Self {
        let table = table.into();
        Self {
            reconciler: Reconciler::new(table.clone()),
            table,
            site_cache_ttl,
            executor,
            agents: agents.into_iter().map(|a| (a.kind(), a)).collect(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let executor: Arc<dyn QueryExecutor> = match DatabricksSqlExecutor::from_config(config) {
            Ok(executor) => Arc::new(executor),
            Err(ExecutorError::NotConfigured(reason)) => {
                tracing::warn!(%reason, "warehouse not configured, remote queries disabled");
                Arc::new(UnconfiguredExecutor(reason))
            }
            Err(e) => return Err(e).context("failed to create warehouse executor"),
        };

        let agents: Vec<Arc<dyn ConversationalAgent>> = vec![
            Arc::new(GenieAgent::from_config(config).context("failed to create Genie agent")?),
            Arc::new(
                ServingAgent::knowledge_assistant(config)
                    .context("failed to create Knowledge Assistant agent")?,
            ),
            Arc::new(ServingAgent::supervisor(config).context("failed to create supervisor agent")?),
        ];

        Ok(Self::new(config.table.clone(), config.site_cache_ttl, executor, agents))
    }

    pub fn agent(&self, kind: AgentKind) -> Option<Arc<dyn ConversationalAgent>> {
        self.agents.get(&kind).cloned()
    }
}

/// 仪表盘视图
#[derive(Debug, Clone, Serialize)]
pub struct DashboardView {
    pub filters: LeaseFilters,
    pub selected_site: Option<String>,
    pub metrics: PortfolioMetrics,
    /// 按月收入降序的明细 (最多 50 条)
    pub rows: Vec<LeaseRecord>,
    pub markers: Vec<MarkerState>,
    pub center: MapCenter,
    /// 仪表盘多边形内、符合筛选条件的在租站点数 (与高亮一致)
    ///
    /// `selection.count` 统计的是整张站点表，与对话代理查询的范围相同。
    pub polygon_sites: Option<usize>,
    pub selection: SelectionSummary,
}

#[derive(Default)]
pub struct Session {
    store: PolygonStore,
    histories: HashMap<AgentKind, ChatHistory>,
    in_flight: HashMap<AgentKind, CancelToken>,
    filters: LeaseFilters,
    selected_site: Option<String>,
    catalog: Option<Arc<SiteCatalog>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> &PolygonStore {
        &self.store
    }

    /// 返回可用的站点目录，过期或缺失时尝试刷新；刷新失败保留旧目录
    pub fn ensure_catalog(&mut self, services: &Services) -> Option<Arc<SiteCatalog>> {
        if !catalog_is_fresh(self.catalog.as_ref(), services.site_cache_ttl) {
            if let Some(catalog) = load_catalog(services, self.catalog.is_some()) {
                self.catalog = Some(catalog);
            }
        }
        self.catalog.clone()
    }

    /// 处理绘制事件 (只有新图形才需要站点目录)
    pub fn apply_draw(
        &mut self,
        services: &Services,
        context: ContextKey,
        event: DrawEvent,
    ) -> Result<Transition, ReconcileError> {
        let catalog = match event {
            DrawEvent::Drawn(_) => self.ensure_catalog(services),
            _ => None,
        };
        services.reconciler.apply(
            &mut self.store,
            context,
            event,
            services.executor.as_ref(),
            catalog.as_deref(),
        )
    }

    pub fn clear_selection(&mut self, context: ContextKey) {
        self.store.clear(context);
    }

    pub fn selection_summary(&self, context: ContextKey) -> SelectionSummary {
        let polygon = self.store.get(context);
        let result = self.store.result(context);
        SelectionSummary {
            context,
            state: self.store.state(context),
            count: result.map(|r| r.count),
            provenance: result.map(|r| r.provenance),
            wkt: polygon.map(|p| spatial_format::wkt_polygon(p.ring())),
            caption: polygon.map(|_| chat::polygon_caption(result.map(|r| r.count))),
        }
    }

    /// 对话地图视图：全部站点 + 当前多边形高亮
    pub fn map_view(&mut self, services: &Services, context: ContextKey) -> MapView {
        let catalog = self.ensure_catalog(services);
        self.view_with(context, catalog.as_deref())
    }

    fn view_with(&self, context: ContextKey, catalog: Option<&SiteCatalog>) -> MapView {
        let polygon = self.store.get(context);
        MapView {
            center: catalog.map(SiteCatalog::center).unwrap_or_default(),
            markers: catalog.map(|c| c.markers(polygon)).unwrap_or_default(),
            selection: self.selection_summary(context),
        }
    }

    // ========================================================================
    // 对话
    // ========================================================================

    pub fn history(&self, kind: AgentKind) -> &[ChatMessage] {
        self.histories
            .get(&kind)
            .map(ChatHistory::messages)
            .unwrap_or(&[])
    }

    pub fn clear_history(&mut self, kind: AgentKind) {
        self.histories.entry(kind).or_default().clear();
    }

    /// 开始一轮对话：快照请求并登记取消令牌 (同一标签页的旧请求被取消)
    pub fn begin_turn(&mut self, kind: AgentKind, prompt: &str) -> (chat::TurnRequest, CancelToken) {
        let history = self.histories.entry(kind).or_default();
        let request = chat::prepare_turn(kind, history, &self.store, prompt);

        let cancel = CancelToken::new();
        if let Some(previous) = self.in_flight.insert(kind, cancel.clone()) {
            previous.cancel();
        }
        (request, cancel)
    }

    /// 结束一轮对话：写入历史，清理令牌
    pub fn finish_turn(&mut self, prompt: &str, outcome: &ChatOutcome, cancel: &CancelToken) {
        let kind = outcome.kind;
        // 只清理自己的令牌，后发起的请求可能已经替换了它
        if self
            .in_flight
            .get(&kind)
            .is_some_and(|t| t.same_as(cancel))
        {
            self.in_flight.remove(&kind);
        }
        self.histories.entry(kind).or_default().record(prompt, outcome);
    }

    pub fn cancel_turn(&mut self, kind: AgentKind) -> bool {
        match self.in_flight.remove(&kind) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn cancel_all(&mut self) {
        for (_, token) in self.in_flight.drain() {
            token.cancel();
        }
    }

    // ========================================================================
    // 仪表盘
    // ========================================================================

    pub fn set_filters(&mut self, filters: LeaseFilters) {
        self.filters = filters;
    }

    pub fn filters(&self) -> &LeaseFilters {
        &self.filters
    }

    pub fn toggle_site(&mut self, site: &str) -> Option<&str> {
        self.selected_site = dashboard::toggle_site(self.selected_site.as_deref(), site);
        self.selected_site.as_deref()
    }

    pub fn clear_site(&mut self) {
        self.selected_site = None;
    }

    pub fn selected_site(&self) -> Option<&str> {
        self.selected_site.as_deref()
    }

    /// 查询在租租约并计算仪表盘视图
    ///
    /// 地图显示筛选后的全部站点；指标和明细再叠加多边形与单站点过滤。
    pub fn dashboard_view(&self, services: &Services) -> Result<DashboardView> {
        self.dashboard_snapshot().load(services)
    }

    fn dashboard_snapshot(&self) -> DashboardSnapshot {
        DashboardSnapshot {
            filters: self.filters.clone(),
            selected_site: self.selected_site.clone(),
            polygon: self.store.get(ContextKey::Dashboard).cloned(),
            selection: self.selection_summary(ContextKey::Dashboard),
        }
    }
}

/// 计算仪表盘所需的会话状态副本
struct DashboardSnapshot {
    filters: LeaseFilters,
    selected_site: Option<String>,
    polygon: Option<Polygon>,
    selection: SelectionSummary,
}

impl DashboardSnapshot {
    fn load(self, services: &Services) -> Result<DashboardView> {
        let records = dashboard::load_leases(services.executor.as_ref(), &services.table, &self.filters)
            .context("failed to load active leases")?;

        let polygon = self.polygon.as_ref();
        let selected_site = self.selected_site.as_deref();

        let markers = dashboard::lease_markers(&records, selected_site, polygon);
        let center = lease_center(&records);
        let polygon_sites = polygon.map(|p| dashboard::sites_in_polygon(&records, p));

        let mut selection = self.selection;
        if let Some(sites) = polygon_sites {
            selection.caption = Some(dashboard::polygon_caption(sites));
        }

        let scoped = dashboard::filter_by_site(dashboard::filter_by_polygon(records, polygon), selected_site);
        let metrics = dashboard::compute_metrics(&scoped, selected_site);
        let rows = dashboard::detail_rows(&scoped);

        Ok(DashboardView {
            filters: self.filters,
            selected_site: self.selected_site,
            metrics,
            rows,
            markers,
            center,
            polygon_sites,
            selection,
        })
    }
}

fn catalog_is_fresh(catalog: Option<&Arc<SiteCatalog>>, ttl: Duration) -> bool {
    catalog.is_some_and(|c| !c.is_stale(ttl))
}

fn load_catalog(services: &Services, cached: bool) -> Option<Arc<SiteCatalog>> {
    match SiteCatalog::load(services.executor.as_ref(), &services.table) {
        Ok(catalog) => Some(Arc::new(catalog)),
        Err(e) => {
            tracing::warn!(
                category = e.category(),
                error = %e,
                cached,
                "site catalog refresh failed"
            );
            None
        }
    }
}

fn lease_center(records: &[LeaseRecord]) -> MapCenter {
    if records.is_empty() {
        return MapCenter::default();
    }
    let n = records.len() as f64;
    MapCenter {
        lat: records.iter().map(|r| r.lat).sum::<f64>() / n,
        lon: records.iter().map(|r| r.lon).sum::<f64>() / n,
    }
}

pub fn filter_options(services: &Services) -> Result<FilterOptions> {
    dashboard::load_filter_options(services.executor.as_ref(), &services.table)
        .context("failed to load filter options")
}

/// 加锁；持锁线程 panic 后继续使用内部数据
pub fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// 跨线程入口：仓库与代理调用期间都不持有会话锁
// ============================================================================

/// 刷新站点目录 (加载期间不持锁)
pub fn refresh_catalog(session: &Mutex<Session>, services: &Services) -> Option<Arc<SiteCatalog>> {
    let cached = lock(session).catalog.clone();
    if catalog_is_fresh(cached.as_ref(), services.site_cache_ttl) {
        return cached;
    }

    let loaded = load_catalog(services, cached.is_some());
    let mut guard = lock(session);
    if let Some(catalog) = loaded {
        guard.catalog = Some(catalog);
    }
    guard.catalog.clone()
}

/// 处理绘制事件并返回地图视图
///
/// 计数在锁外完成，提交时重新加锁；同一上下文的并发绘制以最后提交的为准。
pub fn submit_draw(
    session: &Mutex<Session>,
    services: &Services,
    context: ContextKey,
    event: DrawEvent,
) -> Result<MapView, ReconcileError> {
    let catalog = refresh_catalog(session, services);
    let change = services.reconciler.evaluate(
        context,
        event,
        services.executor.as_ref(),
        catalog.as_deref(),
    )?;

    let mut guard = lock(session);
    services.reconciler.commit(&mut guard.store, context, change);
    Ok(guard.view_with(context, catalog.as_deref()))
}

pub fn map_view(session: &Mutex<Session>, services: &Services, context: ContextKey) -> MapView {
    let catalog = refresh_catalog(session, services);
    lock(session).view_with(context, catalog.as_deref())
}

/// 计算仪表盘视图 (租约查询期间不持锁)
pub fn dashboard_view(session: &Mutex<Session>, services: &Services) -> Result<DashboardView> {
    let snapshot = lock(session).dashboard_snapshot();
    snapshot.load(services)
}

/// 完整的一轮对话：网络调用期间不持有会话锁
pub fn chat_turn(
    session: &Mutex<Session>,
    services: &Services,
    kind: AgentKind,
    prompt: &str,
) -> Result<ChatOutcome> {
    let prompt = prompt.trim();
    if prompt.is_empty() {
        return Err(anyhow!("empty prompt"));
    }
    let agent = services
        .agent(kind)
        .ok_or_else(|| anyhow!("no agent registered for {}", kind.as_str()))?;

    let (request, cancel) = lock(session).begin_turn(kind, prompt);
    let outcome = chat::run_turn(agent.as_ref(), &request, &cancel);
    lock(session).finish_turn(prompt, &outcome, &cancel);

    Ok(outcome)
}

/// 会话注册表
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Mutex<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 打开 (或复用) 会话
    pub fn open(&self, id: &str) -> Arc<Mutex<Session>> {
        self.sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                tracing::info!(session = id, "session opened");
                Arc::new(Mutex::new(Session::new()))
            })
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.get(id).map(|s| s.clone())
    }

    /// 关闭会话并取消其进行中的请求
    pub fn close(&self, id: &str) -> bool {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                lock(&session).cancel_all();
                tracing::info!(session = id, "session closed");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
