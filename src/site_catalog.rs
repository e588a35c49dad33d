//! 站点目录
//!
//! 架构设计：
//! - Vec 存储站点行 (同一站点名可能对应多条租约记录)
//! - R-Tree 存储点索引，多边形判定前先用包围盒预筛
//! - 整体加载、整体替换，不做增量更新
//!
//! 本地回退计数、地图高亮都基于这里，和远程计数一样按站点名去重。

use crate::geometry::{LonLat, Polygon};
use crate::types::{
    MapCenter, MarkerState, SELECTED_COLOR, SELECTED_RADIUS, UNSELECTED_COLOR, UNSELECTED_RADIUS,
};
use crate::warehouse::{cell_f64, cell_string, ExecutorError, QueryExecutor, QueryResult};
use rstar::{RTree, RTreeObject, AABB};
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// 站点 (只读，来自仓库)
#[derive(Debug, Clone, PartialEq)]
pub struct Site {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub state: Option<String>,
    pub tenant: Option<String>,
    pub monthly_revenue: Option<f64>,
}

impl Site {
    #[inline]
    pub fn location(&self) -> LonLat {
        LonLat::new(self.lon, self.lat)
    }
}

/// R-Tree 中的索引项 (只存下标和坐标)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SiteEntry {
    pub index: usize,
    pub lon: f64,
    pub lat: f64,
}

impl RTreeObject for SiteEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.lon, self.lat])
    }
}

/// 站点位置查询 (仓库侧已过滤空坐标)
pub fn site_locations_query(table: &str) -> String {
    format!(
        "SELECT\n    site_name,\n    latitude,\n    longitude,\n    state,\n    tenant_name,\n    total_monthly_revenue\n\
         FROM {table}\n\
         WHERE latitude IS NOT NULL\n    AND longitude IS NOT NULL"
    )
}

pub struct SiteCatalog {
    sites: Vec<Site>,
    index: RTree<SiteEntry>,
    loaded_at: Instant,
}

impl SiteCatalog {
    pub fn new(sites: Vec<Site>) -> Self {
        let entries: Vec<SiteEntry> = sites
            .iter()
            .enumerate()
            .map(|(index, s)| SiteEntry {
                index,
                lon: s.lon,
                lat: s.lat,
            })
            .collect();

        Self {
            sites,
            index: RTree::bulk_load(entries),
            loaded_at: Instant::now(),
        }
    }

    /// 从查询结果构建，坐标缺失或非法的行跳过
    pub fn from_query_result(result: &QueryResult) -> Result<Self, ExecutorError> {
        let col = |name: &str| {
            result
                .column_index(name)
                .ok_or_else(|| ExecutorError::Malformed(format!("missing column {name}")))
        };
        let name_col = col("site_name")?;
        let lat_col = col("latitude")?;
        let lon_col = col("longitude")?;
        let state_col = result.column_index("state");
        let tenant_col = result.column_index("tenant_name");
        let revenue_col = result.column_index("total_monthly_revenue");

        let mut sites = Vec::with_capacity(result.rows.len());
        let mut skipped = 0usize;

        for row in &result.rows {
            let cell = |i: usize| row.get(i);
            let name = cell(name_col).and_then(cell_string);
            let lat = cell(lat_col).and_then(cell_f64);
            let lon = cell(lon_col).and_then(cell_f64);

            let (Some(name), Some(lat), Some(lon)) = (name, lat, lon) else {
                skipped += 1;
                continue;
            };
            if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                skipped += 1;
                continue;
            }

            sites.push(Site {
                name,
                lat,
                lon,
                state: state_col.and_then(cell).and_then(cell_string),
                tenant: tenant_col.and_then(cell).and_then(cell_string),
                monthly_revenue: revenue_col.and_then(cell).and_then(cell_f64),
            });
        }

        if skipped > 0 {
            tracing::warn!(skipped, kept = sites.len(), "skipped site rows with invalid coordinates");
        }

        Ok(Self::new(sites))
    }

    /// 从仓库加载
    pub fn load(executor: &dyn QueryExecutor, table: &str) -> Result<Self, ExecutorError> {
        let start = Instant::now();
        let result = executor.execute(&site_locations_query(table))?;
        let catalog = Self::from_query_result(&result)?;
        tracing::info!(
            sites = catalog.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "site catalog loaded"
        );
        Ok(catalog)
    }

    pub fn sites(&self) -> &[Site] {
        &self.sites
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.loaded_at.elapsed() >= ttl
    }

    /// 多边形内的站点 (包围盒预筛 + 精确判定)
    pub fn sites_within(&self, polygon: &Polygon) -> Vec<&Site> {
        self.indices_within(polygon)
            .into_iter()
            .map(|i| &self.sites[i])
            .collect()
    }

    fn indices_within(&self, polygon: &Polygon) -> Vec<usize> {
        let b = polygon.bounds();
        let query_box = AABB::from_corners([b.min_lon, b.min_lat], [b.max_lon, b.max_lat]);

        self.index
            .locate_in_envelope_intersecting(&query_box)
            .filter(|e| polygon.contains(LonLat::new(e.lon, e.lat)))
            .map(|e| e.index)
            .collect()
    }

    /// 多边形内的不同站点名数量
    pub fn count_within(&self, polygon: &Polygon) -> u64 {
        let names: HashSet<&str> = self
            .sites_within(polygon)
            .into_iter()
            .map(|s| s.name.as_str())
            .collect();
        names.len() as u64
    }

    /// 每个站点的标记状态 (选中与否只看本地判定)
    pub fn markers(&self, polygon: Option<&Polygon>) -> Vec<MarkerState> {
        let selected: HashSet<usize> = polygon
            .map(|p| self.indices_within(p).into_iter().collect())
            .unwrap_or_default();

        self.sites
            .iter()
            .enumerate()
            .map(|(i, site)| {
                let is_selected = selected.contains(&i);
                MarkerState {
                    name: site.name.clone(),
                    lat: site.lat,
                    lon: site.lon,
                    state: site.state.clone(),
                    tenant: site.tenant.clone(),
                    monthly_revenue: site.monthly_revenue,
                    selected: is_selected,
                    color: if is_selected { SELECTED_COLOR } else { UNSELECTED_COLOR },
                    radius: if is_selected { SELECTED_RADIUS } else { UNSELECTED_RADIUS },
                }
            })
            .collect()
    }

    /// 站点坐标均值，空目录返回默认中心
    pub fn center(&self) -> MapCenter {
        if self.sites.is_empty() {
            return MapCenter::default();
        }
        let n = self.sites.len() as f64;
        let (lat, lon) = self
            .sites
            .iter()
            .fold((0.0, 0.0), |(lat, lon), s| (lat + s.lat, lon + s.lon));
        MapCenter {
            lat: lat / n,
            lon: lon / n,
        }
    }
}
