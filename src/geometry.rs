//! 几何计算：点与多边形关系判定
//!
//! 职责：
//! - 多边形环 (Ring) 的构造与校验
//! - 点在多边形内判定 (射线法，边界包含)
//! - 包围盒计算 (供 R-Tree 预过滤)
//!
//! 判定语义必须与仓库端 `ST_Intersects` 一致：落在边或顶点上的点算作命中。
//! 远程计数与本地回退会被交替使用，两边语义不一致会导致高亮与计数对不上。

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// 边界判定容差 (叉积，单位：度²)
const BOUNDARY_EPS: f64 = 1e-12;

/// 多边形顶点保留的小数位 (与 WKT 输出一致，约 0.1 米)
pub const COORD_DECIMALS: usize = 6;
const COORD_SCALE: f64 = 1e6;

/// 把坐标量化到 `COORD_DECIMALS` 位小数
pub fn quantize(value: f64) -> f64 {
    (value * COORD_SCALE).round() / COORD_SCALE
}

/// 经纬度坐标 (WGS84，经度在前，与 WKT / GeoJSON 顺序一致)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LonLat {
    pub lon: f64,
    pub lat: f64,
}

impl LonLat {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    pub fn is_finite(&self) -> bool {
        self.lon.is_finite() && self.lat.is_finite()
    }
}

/// 几何输入错误
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GeometryError {
    #[error("polygon needs at least 3 distinct vertices, got {0}")]
    TooFewVertices(usize),
    #[error("malformed coordinate at index {index}: {reason}")]
    Malformed { index: usize, reason: String },
}

/// 经纬度包围盒
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bounds {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl Bounds {
    /// 计算点集的包围盒 (空集返回 None)
    pub fn of(points: &[LonLat]) -> Option<Self> {
        let first = points.first()?;
        let mut bounds = Bounds {
            min_lon: first.lon,
            min_lat: first.lat,
            max_lon: first.lon,
            max_lat: first.lat,
        };
        for p in &points[1..] {
            bounds.min_lon = bounds.min_lon.min(p.lon);
            bounds.min_lat = bounds.min_lat.min(p.lat);
            bounds.max_lon = bounds.max_lon.max(p.lon);
            bounds.max_lat = bounds.max_lat.max(p.lat);
        }
        Some(bounds)
    }

    pub fn contains(&self, p: LonLat) -> bool {
        p.lon >= self.min_lon && p.lon <= self.max_lon && p.lat >= self.min_lat && p.lat <= self.max_lat
    }
}

/// 用户绘制的多边形
///
/// 构造时顶点量化到 6 位小数，并保证至少 3 个互不相同的有限顶点。
/// 本地判定、WKT 和提示指令因此看到的是同一组顶点。
/// 环不强制闭合，所有下游消费者都按闭合环处理。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Polygon {
    ring: Vec<LonLat>,
}

impl Polygon {
    pub fn from_ring(ring: Vec<LonLat>) -> Result<Self, GeometryError> {
        if let Some(index) = ring.iter().position(|p| !p.is_finite()) {
            return Err(GeometryError::Malformed {
                index,
                reason: "non-finite coordinate".to_string(),
            });
        }

        let ring: Vec<LonLat> = ring
            .into_iter()
            .map(|p| LonLat::new(quantize(p.lon), quantize(p.lat)))
            .collect();

        let distinct = distinct_vertex_count(&ring);
        if distinct < 3 {
            return Err(GeometryError::TooFewVertices(distinct));
        }

        Ok(Self { ring })
    }

    /// 从绘制层的 `[[lon, lat], ...]` JSON 数组解析
    pub fn from_json_ring(value: &serde_json::Value) -> Result<Self, GeometryError> {
        Self::from_ring(parse_json_ring(value)?)
    }

    pub fn ring(&self) -> &[LonLat] {
        &self.ring
    }

    pub fn contains(&self, point: LonLat) -> bool {
        contains(point, &self.ring)
    }

    pub fn bounds(&self) -> Bounds {
        // from_ring 保证非空
        Bounds::of(&self.ring).unwrap_or(Bounds {
            min_lon: 0.0,
            min_lat: 0.0,
            max_lon: 0.0,
            max_lat: 0.0,
        })
    }
}

/// 解析 `[[lon, lat], ...]` 坐标数组
pub fn parse_json_ring(value: &serde_json::Value) -> Result<Vec<LonLat>, GeometryError> {
    let items = value.as_array().ok_or_else(|| GeometryError::Malformed {
        index: 0,
        reason: "ring is not an array".to_string(),
    })?;

    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let pair = item.as_array().filter(|p| p.len() >= 2).ok_or_else(|| {
                GeometryError::Malformed {
                    index,
                    reason: "expected [lon, lat]".to_string(),
                }
            })?;
            match (pair[0].as_f64(), pair[1].as_f64()) {
                (Some(lon), Some(lat)) => Ok(LonLat::new(lon, lat)),
                _ => Err(GeometryError::Malformed {
                    index,
                    reason: "non-numeric coordinate".to_string(),
                }),
            }
        })
        .collect()
}

/// 统计互不相同的顶点数 (精确匹配，-0.0 与 0.0 视为相同)
pub fn distinct_vertex_count(ring: &[LonLat]) -> usize {
    ring.iter()
        .map(|p| ((p.lon + 0.0).to_bits(), (p.lat + 0.0).to_bits()))
        .collect::<HashSet<_>>()
        .len()
}

/// 按 (lat, lon) 字典序规范化边的端点
///
/// 正向与反向遍历得到同一组浮点运算，保证判定结果与方向无关。
#[inline]
fn canonical_edge(a: LonLat, b: LonLat) -> (LonLat, LonLat) {
    if (a.lat, a.lon) <= (b.lat, b.lon) {
        (a, b)
    } else {
        (b, a)
    }
}

/// 点是否落在线段上 (含端点)
fn point_on_segment(p: LonLat, lo: LonLat, hi: LonLat) -> bool {
    let cross = (hi.lon - lo.lon) * (p.lat - lo.lat) - (hi.lat - lo.lat) * (p.lon - lo.lon);
    if cross.abs() > BOUNDARY_EPS {
        return false;
    }

    p.lon >= lo.lon.min(hi.lon)
        && p.lon <= lo.lon.max(hi.lon)
        && p.lat >= lo.lat
        && p.lat <= hi.lat
}

/// 点在多边形内判定 (平面射线法，边界包含)
///
/// 退化输入 (少于 3 个不同顶点、非有限坐标) 直接返回 false，不会 panic，
/// 调用方的批量循环可以放心逐点调用。
pub fn contains(point: LonLat, ring: &[LonLat]) -> bool {
    if !point.is_finite() || ring.iter().any(|p| !p.is_finite()) {
        return false;
    }
    if distinct_vertex_count(ring) < 3 {
        return false;
    }

    let n = ring.len();
    let mut inside = false;

    for i in 0..n {
        let a = ring[i];
        let b = ring[(i + 1) % n];
        if a == b {
            // 显式闭合点产生的零长度边
            continue;
        }

        let (lo, hi) = canonical_edge(a, b);

        if point_on_segment(point, lo, hi) {
            return true;
        }

        // 半开区间 (lo.lat, hi.lat]，水平边自然跳过
        if (lo.lat > point.lat) != (hi.lat > point.lat) {
            let x = lo.lon + (point.lat - lo.lat) * (hi.lon - lo.lon) / (hi.lat - lo.lat);
            if point.lon < x {
                inside = !inside;
            }
        }
    }

    inside
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn central_us_box() -> Vec<LonLat> {
        vec![
            LonLat::new(-100.0, 40.0),
            LonLat::new(-90.0, 40.0),
            LonLat::new(-90.0, 35.0),
            LonLat::new(-100.0, 35.0),
        ]
    }

    fn concave() -> Vec<LonLat> {
        // U 形
        vec![
            LonLat::new(0.0, 0.0),
            LonLat::new(6.0, 0.0),
            LonLat::new(6.0, 6.0),
            LonLat::new(4.0, 6.0),
            LonLat::new(4.0, 2.0),
            LonLat::new(2.0, 2.0),
            LonLat::new(2.0, 6.0),
            LonLat::new(0.0, 6.0),
        ]
    }

    fn sample_points() -> Vec<LonLat> {
        let mut out = Vec::new();
        for i in -2..=16 {
            for j in -2..=16 {
                out.push(LonLat::new(i as f64 * 0.5, j as f64 * 0.5));
            }
        }
        out
    }

    #[test]
    fn test_central_us_scenario() {
        let ring = central_us_box();
        assert!(contains(LonLat::new(-95.0, 37.5), &ring));
        assert!(!contains(LonLat::new(-80.0, 37.5), &ring));
    }

    #[test]
    fn test_boundary_is_inside() {
        let ring = central_us_box();
        // 边上
        assert!(contains(LonLat::new(-95.0, 40.0), &ring));
        assert!(contains(LonLat::new(-90.0, 37.0), &ring));
        assert!(contains(LonLat::new(-100.0, 36.0), &ring));
        assert!(contains(LonLat::new(-92.5, 35.0), &ring));
        // 顶点
        assert!(contains(LonLat::new(-100.0, 40.0), &ring));
        assert!(contains(LonLat::new(-90.0, 35.0), &ring));
    }

    #[test]
    fn test_boundary_of_diagonal_edge() {
        let triangle = vec![
            LonLat::new(0.0, 0.0),
            LonLat::new(4.0, 0.0),
            LonLat::new(0.0, 4.0),
        ];
        assert!(contains(LonLat::new(2.0, 2.0), &triangle));
        assert!(contains(LonLat::new(1.0, 3.0), &triangle));
        assert!(!contains(LonLat::new(2.5, 2.5), &triangle));
    }

    #[test]
    fn test_concave_notch_is_outside() {
        let ring = concave();
        assert!(contains(LonLat::new(1.0, 4.0), &ring));
        assert!(contains(LonLat::new(5.0, 4.0), &ring));
        assert!(!contains(LonLat::new(3.0, 4.0), &ring));
        assert!(contains(LonLat::new(3.0, 2.0), &ring));
    }

    #[test]
    fn test_rotation_invariance() {
        for ring in [central_us_box(), concave()] {
            let baseline: Vec<bool> = sample_points().iter().map(|p| contains(*p, &ring)).collect();
            for shift in 1..ring.len() {
                let mut rotated = ring.clone();
                rotated.rotate_left(shift);
                let got: Vec<bool> = sample_points().iter().map(|p| contains(*p, &rotated)).collect();
                assert_eq!(baseline, got, "rotation by {shift}");
            }
        }
    }

    #[test]
    fn test_direction_invariance() {
        for ring in [central_us_box(), concave()] {
            let mut reversed = ring.clone();
            reversed.reverse();
            for p in sample_points() {
                assert_eq!(contains(p, &ring), contains(p, &reversed), "point {p:?}");
            }
        }
    }

    #[test]
    fn test_explicit_closure_is_equivalent() {
        let open = concave();
        let mut closed = open.clone();
        closed.push(open[0]);
        for p in sample_points() {
            assert_eq!(contains(p, &open), contains(p, &closed));
        }
    }

    #[test]
    fn test_degenerate_input_fails_closed() {
        let two = vec![LonLat::new(0.0, 0.0), LonLat::new(1.0, 1.0)];
        assert!(!contains(LonLat::new(0.0, 0.0), &two));

        let repeated = vec![LonLat::new(1.0, 1.0); 5];
        assert!(!contains(LonLat::new(1.0, 1.0), &repeated));

        assert!(!contains(LonLat::new(0.0, 0.0), &[]));

        let mut with_nan = central_us_box();
        with_nan[1].lon = f64::NAN;
        assert!(!contains(LonLat::new(-95.0, 37.5), &with_nan));

        assert!(!contains(LonLat::new(f64::NAN, 37.5), &central_us_box()));
        assert!(!contains(LonLat::new(f64::INFINITY, 37.5), &central_us_box()));
    }

    #[test]
    fn test_from_ring_validation() {
        assert!(Polygon::from_ring(central_us_box()).is_ok());

        let err = Polygon::from_ring(vec![
            LonLat::new(0.0, 0.0),
            LonLat::new(1.0, 1.0),
            LonLat::new(0.0, 0.0),
        ])
        .unwrap_err();
        assert_eq!(err, GeometryError::TooFewVertices(2));

        let err = Polygon::from_ring(vec![
            LonLat::new(0.0, 0.0),
            LonLat::new(f64::NAN, 1.0),
            LonLat::new(2.0, 0.0),
        ])
        .unwrap_err();
        assert!(matches!(err, GeometryError::Malformed { index: 1, .. }));
    }

    #[test]
    fn test_from_ring_quantizes_vertices() {
        let polygon = Polygon::from_ring(vec![
            LonLat::new(-95.0000004, 35.0),
            LonLat::new(-90.00000049, 35.0),
            LonLat::new(-90.0, 40.00000051),
            LonLat::new(-95.0000004, 40.0),
        ])
        .unwrap();
        assert_eq!(polygon.ring()[0].lon, -95.0);
        assert_eq!(polygon.ring()[1].lon, -90.0);
        assert_eq!(polygon.ring()[2].lat, 40.000001);

        // 原始环包含该点，量化后的边在它右侧
        assert!(!polygon.contains(LonLat::new(-95.0000002, 37.5)));
        assert!(polygon.contains(LonLat::new(-95.0, 37.5)));

        // 只在第 7 位小数上不同的顶点量化后重合
        let err = Polygon::from_ring(vec![
            LonLat::new(0.0, 0.0),
            LonLat::new(0.0000001, 0.0),
            LonLat::new(1.0, 1.0),
        ])
        .unwrap_err();
        assert_eq!(err, GeometryError::TooFewVertices(2));
    }

    #[test]
    fn test_from_json_ring() {
        let value = json!([[-100.0, 40.0], [-90.0, 40.0], [-90.0, 35.0], [-100.0, 35.0], [-100.0, 40.0]]);
        let polygon = Polygon::from_json_ring(&value).unwrap();
        assert_eq!(polygon.ring().len(), 5);
        assert!(polygon.contains(LonLat::new(-95.0, 37.5)));

        let bad = json!([[-100.0, 40.0], ["x", 40.0], [-90.0, 35.0]]);
        assert!(matches!(
            Polygon::from_json_ring(&bad),
            Err(GeometryError::Malformed { index: 1, .. })
        ));

        assert!(Polygon::from_json_ring(&json!({"type": "Polygon"})).is_err());
    }

    #[test]
    fn test_bounds() {
        let polygon = Polygon::from_ring(central_us_box()).unwrap();
        let b = polygon.bounds();
        assert_eq!(b.min_lon, -100.0);
        assert_eq!(b.max_lon, -90.0);
        assert_eq!(b.min_lat, 35.0);
        assert_eq!(b.max_lat, 40.0);
        assert!(b.contains(LonLat::new(-100.0, 35.0)));
        assert!(Bounds::of(&[]).is_none());
    }
}
