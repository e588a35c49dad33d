//! 空间查询格式化
//!
//! 同一个多边形产出两类文本：
//! - 远程谓词：WKT POLYGON 字面量 + `ST_Intersects` 过滤条件，交给查询执行器
//! - 提示指令：追加在用户问题之后的自然语言块，告诉 SQL 生成代理如何过滤
//!
//! 两者都是纯文本，便于运维直接阅读调试。

use crate::geometry::{LonLat, Polygon, COORD_DECIMALS};

/// 站点表中的点坐标列
pub const LON_COLUMN: &str = "longitude";
pub const LAT_COLUMN: &str = "latitude";

#[inline]
fn fmt_coord(p: &LonLat) -> String {
    format!("{:.prec$} {:.prec$}", p.lon, p.lat, prec = COORD_DECIMALS)
}

/// 渲染 WKT POLYGON 字面量 (经度在前，6 位小数)
///
/// 首尾顶点按精确坐标比较，不同才追加闭合点。空环返回空串。
pub fn wkt_polygon(ring: &[LonLat]) -> String {
    let (Some(first), Some(last)) = (ring.first(), ring.last()) else {
        return String::new();
    };

    let mut coords: Vec<String> = ring.iter().map(fmt_coord).collect();
    if first.lon != last.lon || first.lat != last.lat {
        coords.push(fmt_coord(first));
    }

    format!("POLYGON(({}))", coords.join(", "))
}

/// 渲染 `ST_Intersects` 谓词 (边界包含)
pub fn intersects_predicate(ring: &[LonLat], lon_column: &str, lat_column: &str) -> String {
    let wkt = wkt_polygon(ring);
    if wkt.is_empty() {
        return String::new();
    }

    format!(
        "ST_Intersects(\n    ST_GeomFromWKT('{wkt}'),\n    ST_Point({lon_column}, {lat_column})\n)"
    )
}

/// 远程计数查询：多边形内的不同站点数
pub fn count_query(table: &str, ring: &[LonLat]) -> String {
    let predicate = intersects_predicate(ring, LON_COLUMN, LAT_COLUMN);
    if predicate.is_empty() {
        return String::new();
    }

    format!(
        "SELECT COUNT(DISTINCT site_name) AS cnt\n\
         FROM {table}\n\
         WHERE {LAT_COLUMN} IS NOT NULL\n    \
         AND {LON_COLUMN} IS NOT NULL\n    \
         AND {predicate}"
    )
}

/// 渲染追加给 SQL 生成代理的地理过滤指令
///
/// 代理没有其他渠道获知地理意图，这段文本就是全部信息。
pub fn prompt_directive(polygon: Option<&Polygon>) -> String {
    let Some(polygon) = polygon else {
        return String::new();
    };
    let wkt = wkt_polygon(polygon.ring());
    if wkt.is_empty() {
        return String::new();
    }
    let predicate = intersects_predicate(polygon.ring(), LON_COLUMN, LAT_COLUMN);

    format!(
        "[GEOGRAPHIC FILTER ACTIVE - USE DATABRICKS ST FUNCTIONS]\n\
The user has drawn a polygon on the map. You MUST filter results to only include sites within this polygon.\n\
\n\
Use this exact WHERE clause filter:\n\
```sql\n\
WHERE {predicate}\n\
```\n\
\n\
The polygon WKT: {wkt}\n\
\n\
IMPORTANT:\n\
- Use ST_Intersects (not ST_Contains) to include points on the polygon boundary\n\
- ST_GeomFromWKT creates the polygon geometry from WKT format\n\
- ST_Point(longitude, latitude) creates a point - longitude is first, latitude is second\n\
- Include this filter in your SQL query to get only sites within the drawn polygon\n"
    )
}

/// 用户问题 + 地理指令 (无多边形时原样返回)
pub fn enhance_prompt(question: &str, polygon: Option<&Polygon>) -> String {
    let directive = prompt_directive(polygon);
    if directive.is_empty() {
        question.to_string()
    } else {
        format!("{question}\n\n{directive}")
    }
}

/// 解析 `POLYGON((lon lat, ...))` 字面量的坐标列表
pub fn parse_wkt_ring(wkt: &str) -> Option<Vec<LonLat>> {
    let body = wkt
        .trim()
        .strip_prefix("POLYGON((")?
        .strip_suffix("))")?;

    body.split(',')
        .map(|pair| {
            let mut parts = pair.split_whitespace();
            let lon = parts.next()?.parse::<f64>().ok()?;
            let lat = parts.next()?.parse::<f64>().ok()?;
            if parts.next().is_some() {
                return None;
            }
            Some(LonLat::new(lon, lat))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn central_us_box() -> Vec<LonLat> {
        vec![
            LonLat::new(-100.0, 40.0),
            LonLat::new(-90.0, 40.0),
            LonLat::new(-90.0, 35.0),
            LonLat::new(-100.0, 35.0),
        ]
    }

    #[test]
    fn test_wkt_auto_closes() {
        assert_eq!(
            wkt_polygon(&central_us_box()),
            "POLYGON((-100.000000 40.000000, -90.000000 40.000000, -90.000000 35.000000, -100.000000 35.000000, -100.000000 40.000000))"
        );
    }

    #[test]
    fn test_wkt_does_not_duplicate_closing_vertex() {
        let mut closed = central_us_box();
        closed.push(closed[0]);
        let wkt = wkt_polygon(&closed);
        assert_eq!(wkt, wkt_polygon(&central_us_box()));
        assert_eq!(wkt.matches("-100.000000 40.000000").count(), 2);
    }

    #[test]
    fn test_close_uses_exact_match() {
        // 差异小于输出精度也要追加闭合点
        let ring = vec![
            LonLat::new(1.0, 1.0),
            LonLat::new(2.0, 1.0),
            LonLat::new(2.0, 2.0),
            LonLat::new(1.0000000001, 1.0),
        ];
        let parsed = parse_wkt_ring(&wkt_polygon(&ring)).unwrap();
        assert_eq!(parsed.len(), 5);
    }

    #[test]
    fn test_single_repeated_vertex_passes_through() {
        let ring = vec![LonLat::new(1.0, 1.0)];
        assert_eq!(wkt_polygon(&ring), "POLYGON((1.000000 1.000000))");
    }

    #[test]
    fn test_empty_ring_is_noop() {
        assert_eq!(wkt_polygon(&[]), "");
        assert_eq!(intersects_predicate(&[], LON_COLUMN, LAT_COLUMN), "");
        assert_eq!(count_query("t", &[]), "");
        assert_eq!(prompt_directive(None), "");
        assert_eq!(enhance_prompt("How many sites?", None), "How many sites?");
    }

    #[test]
    fn test_round_trip_minus_closing_vertex() {
        let ring = vec![
            LonLat::new(-97.123456, 30.5),
            LonLat::new(-96.0, 31.654321),
            LonLat::new(-95.25, 29.75),
            LonLat::new(-97.0, 29.000001),
        ];
        let parsed = parse_wkt_ring(&wkt_polygon(&ring)).unwrap();
        assert_eq!(parsed.len(), ring.len() + 1);
        assert_eq!(&parsed[..ring.len()], &ring[..]);
        assert_eq!(parsed[ring.len()], ring[0]);
    }

    #[test]
    fn test_local_and_remote_polygons_agree_near_edges() {
        let polygon = Polygon::from_ring(vec![
            LonLat::new(-95.0000004, 35.00000049),
            LonLat::new(-89.99999951, 35.0000005),
            LonLat::new(-90.1234567, 40.7654321),
            LonLat::new(-95.0000004, 39.9999996),
        ])
        .unwrap();
        let remote = parse_wkt_ring(&wkt_polygon(polygon.ring())).unwrap();
        assert_eq!(&remote[..polygon.ring().len()], polygon.ring());

        let mut points = vec![LonLat::new(-95.0000002, 37.5), LonLat::new(-92.5, 35.0000003)];
        for step in -5..=5 {
            let d = step as f64 * 1e-7;
            points.push(LonLat::new(-95.0 + d, 37.5));
            points.push(LonLat::new(-92.5, 35.0 + d));
            points.push(LonLat::new(-90.1234567 + d, 40.0));
            points.push(LonLat::new(-90.0 + d, 36.0));
        }
        for p in points {
            assert_eq!(
                polygon.contains(p),
                crate::geometry::contains(p, &remote),
                "point {p:?}"
            );
        }
    }

    #[test]
    fn test_parse_wkt_rejects_garbage() {
        assert!(parse_wkt_ring("POINT(1 2)").is_none());
        assert!(parse_wkt_ring("POLYGON((1 2, x 3))").is_none());
        assert!(parse_wkt_ring("POLYGON((1 2 3))").is_none());
    }

    #[test]
    fn test_intersects_predicate_is_longitude_first() {
        let predicate = intersects_predicate(&central_us_box(), "lng", "lat");
        assert!(predicate.starts_with("ST_Intersects("));
        assert!(predicate.contains("ST_GeomFromWKT('POLYGON((-100.000000 40.000000"));
        assert!(predicate.contains("ST_Point(lng, lat)"));
    }

    #[test]
    fn test_count_query() {
        let sql = count_query("bricks_demo.crown_demo.synth_data", &central_us_box());
        assert!(sql.starts_with("SELECT COUNT(DISTINCT site_name) AS cnt"));
        assert!(sql.contains("FROM bricks_demo.crown_demo.synth_data"));
        assert!(sql.contains("latitude IS NOT NULL"));
        assert!(sql.contains("AND ST_Intersects("));
    }

    #[test]
    fn test_prompt_directive_content() {
        let polygon = Polygon::from_ring(central_us_box()).unwrap();
        let directive = prompt_directive(Some(&polygon));
        let wkt = wkt_polygon(polygon.ring());

        assert!(directive.starts_with("[GEOGRAPHIC FILTER ACTIVE"));
        assert!(directive.contains(&format!("The polygon WKT: {wkt}")));
        assert!(directive.contains("WHERE ST_Intersects("));
        assert!(directive.contains("not ST_Contains"));
        assert!(directive.contains("Include this filter in your SQL query"));
    }

    #[test]
    fn test_enhance_prompt_appends_after_question() {
        let polygon = Polygon::from_ring(central_us_box()).unwrap();
        let enhanced = enhance_prompt("What's the total revenue in this region?", Some(&polygon));
        assert!(enhanced.starts_with("What's the total revenue in this region?\n\n[GEOGRAPHIC"));
    }
}
