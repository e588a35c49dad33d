//! 租约仪表盘
//!
//! 职责：
//! - 筛选项 (州、文档类型、租户) 与在租租约查询
//! - 组合指标：月收入、租约数、平均剩余天数、每平方英尺收入、合规情况
//! - 地图点击切换单站点过滤，仪表盘多边形过滤
//!
//! 数值列统一宽松解析，无法解析的按缺失处理。

use crate::geometry::{LonLat, Polygon};
use crate::types::{
    MarkerState, SELECTED_COLOR, SELECTED_RADIUS, UNSELECTED_COLOR, UNSELECTED_RADIUS,
};
use crate::warehouse::{cell_f64, cell_string, ExecutorError, QueryExecutor, QueryResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

/// 筛选项中表示 "不过滤" 的值
pub const ALL: &str = "All";
/// 明细表最多显示的行数
pub const DETAIL_ROW_LIMIT: usize = 50;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeaseFilters {
    pub state: Option<String>,
    pub document_type: Option<String>,
    pub tenant: Option<String>,
}

fn active_filter(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty() && *v != ALL)
}

/// SQL 字符串字面量 (单引号转义)
pub fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub fn active_leases_query(table: &str, filters: &LeaseFilters) -> String {
    let mut sql = format!(
        "SELECT\n    site_name,\n    state,\n    document_type,\n    tenant_name,\n    latitude,\n    longitude,\n    \
         total_monthly_revenue,\n    lease_status,\n    days_until_expiration,\n    revenue_per_sqft,\n    \
         insurance_liability_min_usd,\n    equipment_space_sqft,\n    compliance_status\n\
         FROM {table}\n\
         WHERE latitude IS NOT NULL\n    AND longitude IS NOT NULL\n    AND lease_status = 'Active'"
    );

    for (column, value) in [
        ("state", &filters.state),
        ("document_type", &filters.document_type),
        ("tenant_name", &filters.tenant),
    ] {
        if let Some(v) = active_filter(value) {
            sql.push_str(&format!("\n    AND {column} = {}", sql_literal(v)));
        }
    }
    sql
}

pub fn distinct_values_query(table: &str, column: &str) -> String {
    format!("SELECT DISTINCT {column} FROM {table} WHERE {column} IS NOT NULL ORDER BY {column}")
}

/// 下拉筛选项 (第一项总是 "All")
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterOptions {
    pub states: Vec<String>,
    pub document_types: Vec<String>,
    pub tenants: Vec<String>,
}

pub fn load_filter_options(executor: &dyn QueryExecutor, table: &str) -> Result<FilterOptions, ExecutorError> {
    let options = |column: &str| -> Result<Vec<String>, ExecutorError> {
        let result = executor.execute(&distinct_values_query(table, column))?;
        Ok(std::iter::once(ALL.to_string())
            .chain(
                result
                    .rows
                    .iter()
                    .filter_map(|row| row.first().and_then(cell_string)),
            )
            .collect())
    };

    Ok(FilterOptions {
        states: options("state")?,
        document_types: options("document_type")?,
        tenants: options("tenant_name")?,
    })
}

/// 一条在租租约
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaseRecord {
    pub site_name: String,
    pub state: Option<String>,
    pub document_type: Option<String>,
    pub tenant_name: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub total_monthly_revenue: Option<f64>,
    pub lease_status: Option<String>,
    pub days_until_expiration: Option<f64>,
    pub revenue_per_sqft: Option<f64>,
    pub insurance_liability_min_usd: Option<f64>,
    pub equipment_space_sqft: Option<f64>,
    pub compliance_status: Option<String>,
}

/// 解析租约行，缺少站点名或坐标的行跳过
pub fn parse_leases(result: &QueryResult) -> Result<Vec<LeaseRecord>, ExecutorError> {
    let required = |name: &str| {
        result
            .column_index(name)
            .ok_or_else(|| ExecutorError::Malformed(format!("missing column {name}")))
    };
    let name_col = required("site_name")?;
    let lat_col = required("latitude")?;
    let lon_col = required("longitude")?;

    let idx = |name: &str| result.column_index(name);
    let state = idx("state");
    let document_type = idx("document_type");
    let tenant = idx("tenant_name");
    let revenue = idx("total_monthly_revenue");
    let status = idx("lease_status");
    let days = idx("days_until_expiration");
    let per_sqft = idx("revenue_per_sqft");
    let insurance = idx("insurance_liability_min_usd");
    let space = idx("equipment_space_sqft");
    let compliance = idx("compliance_status");

    let mut skipped = 0usize;
    let records: Vec<LeaseRecord> = result
        .rows
        .iter()
        .filter_map(|row| {
            let text = |col: Option<usize>| col.and_then(|i| row.get(i)).and_then(cell_string);
            let number = |col: Option<usize>| col.and_then(|i| row.get(i)).and_then(cell_f64);

            let parsed = (|| {
                Some(LeaseRecord {
                    site_name: text(Some(name_col))?,
                    lat: number(Some(lat_col))?,
                    lon: number(Some(lon_col))?,
                    state: text(state),
                    document_type: text(document_type),
                    tenant_name: text(tenant),
                    total_monthly_revenue: number(revenue),
                    lease_status: text(status),
                    days_until_expiration: number(days),
                    revenue_per_sqft: number(per_sqft),
                    insurance_liability_min_usd: number(insurance),
                    equipment_space_sqft: number(space),
                    compliance_status: text(compliance),
                })
            })();
            if parsed.is_none() {
                skipped += 1;
            }
            parsed
        })
        .collect();

    if skipped > 0 {
        tracing::warn!(skipped, kept = records.len(), "skipped lease rows without site or coordinates");
    }
    Ok(records)
}

pub fn load_leases(
    executor: &dyn QueryExecutor,
    table: &str,
    filters: &LeaseFilters,
) -> Result<Vec<LeaseRecord>, ExecutorError> {
    let result = executor.execute(&active_leases_query(table, filters))?;
    parse_leases(&result)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplianceLevel {
    Green,
    Orange,
    Red,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComplianceSummary {
    /// 选中单个站点时显示其状态原文
    Site { status: String, level: ComplianceLevel },
    /// 多个站点时显示合规比例 (百分比)
    Rate { percent: f64, level: ComplianceLevel },
}

pub fn is_compliant(status: &str) -> bool {
    let lower = status.to_lowercase();
    lower.contains("compliant") && !lower.contains("non")
}

pub fn status_level(status: &str) -> ComplianceLevel {
    if is_compliant(status) {
        ComplianceLevel::Green
    } else if status.to_lowercase().contains("pending") {
        ComplianceLevel::Orange
    } else {
        ComplianceLevel::Red
    }
}

pub fn rate_level(percent: f64) -> ComplianceLevel {
    if percent >= 80.0 {
        ComplianceLevel::Green
    } else if percent >= 50.0 {
        ComplianceLevel::Orange
    } else {
        ComplianceLevel::Red
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioMetrics {
    pub total_monthly_revenue: f64,
    pub active_leases: usize,
    pub avg_days_remaining: f64,
    pub avg_revenue_per_sqft: f64,
    pub compliance: ComplianceSummary,
}

fn mean<I: Iterator<Item = f64>>(values: I) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// 计算指标 (`records` 已经过所有过滤)
pub fn compute_metrics(records: &[LeaseRecord], selected_site: Option<&str>) -> PortfolioMetrics {
    let count = records.len();

    let compliance = match (selected_site, records) {
        (Some(_), [only]) => {
            let status = only
                .compliance_status
                .clone()
                .unwrap_or_else(|| "Unknown".to_string());
            let level = status_level(&status);
            ComplianceSummary::Site { status, level }
        }
        _ => {
            let compliant = records
                .iter()
                .filter(|r| r.compliance_status.as_deref().is_some_and(is_compliant))
                .count();
            let percent = if count > 0 {
                compliant as f64 / count as f64 * 100.0
            } else {
                0.0
            };
            ComplianceSummary::Rate {
                percent,
                level: rate_level(percent),
            }
        }
    };

    PortfolioMetrics {
        total_monthly_revenue: records.iter().filter_map(|r| r.total_monthly_revenue).sum(),
        active_leases: count,
        avg_days_remaining: mean(records.iter().filter_map(|r| r.days_until_expiration)),
        avg_revenue_per_sqft: mean(records.iter().filter_map(|r| r.revenue_per_sqft)),
        compliance,
    }
}

/// 按月收入降序取前 50 条 (缺失收入排最后)
pub fn detail_rows(records: &[LeaseRecord]) -> Vec<LeaseRecord> {
    let mut rows = records.to_vec();
    rows.sort_by(|a, b| match (a.total_monthly_revenue, b.total_monthly_revenue) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    rows.truncate(DETAIL_ROW_LIMIT);
    rows
}

/// 地图点击：再次点击同一站点取消选择
pub fn toggle_site(current: Option<&str>, clicked: &str) -> Option<String> {
    match current {
        Some(site) if site == clicked => None,
        _ => Some(clicked.to_string()),
    }
}

pub fn filter_by_site(records: Vec<LeaseRecord>, site: Option<&str>) -> Vec<LeaseRecord> {
    match site {
        Some(site) => records.into_iter().filter(|r| r.site_name == site).collect(),
        None => records,
    }
}

/// 仪表盘多边形过滤 (本地判定，边界包含)
pub fn filter_by_polygon(records: Vec<LeaseRecord>, polygon: Option<&Polygon>) -> Vec<LeaseRecord> {
    match polygon {
        Some(polygon) => records
            .into_iter()
            .filter(|r| polygon.contains(LonLat::new(r.lon, r.lat)))
            .collect(),
        None => records,
    }
}

/// 仪表盘地图标记：选中站点或落在多边形内的站点高亮
///
/// 没有月收入的记录不上图。
/// 多边形内的不同站点数 (与 `lease_markers` 的多边形高亮一致)
pub fn sites_in_polygon(records: &[LeaseRecord], polygon: &Polygon) -> usize {
    records
        .iter()
        .filter(|r| r.total_monthly_revenue.is_some())
        .filter(|r| polygon.contains(LonLat::new(r.lon, r.lat)))
        .map(|r| r.site_name.as_str())
        .collect::<HashSet<_>>()
        .len()
}

/// 仪表盘多边形说明：按筛选后的在租站点计数
pub fn polygon_caption(sites: usize) -> String {
    format!("Polygon includes {sites} active sites matching the current filters")
}

pub fn lease_markers(
    records: &[LeaseRecord],
    selected_site: Option<&str>,
    polygon: Option<&Polygon>,
) -> Vec<MarkerState> {
    records
        .iter()
        .filter(|r| r.total_monthly_revenue.is_some())
        .map(|r| {
            let selected = selected_site == Some(r.site_name.as_str())
                || polygon.is_some_and(|p| p.contains(LonLat::new(r.lon, r.lat)));
            MarkerState {
                name: r.site_name.clone(),
                lat: r.lat,
                lon: r.lon,
                state: r.state.clone(),
                tenant: r.tenant_name.clone(),
                monthly_revenue: r.total_monthly_revenue,
                selected,
                color: if selected { SELECTED_COLOR } else { UNSELECTED_COLOR },
                radius: if selected { SELECTED_RADIUS } else { UNSELECTED_RADIUS },
            }
        })
        .collect()
}
