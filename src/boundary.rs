use geo::{Area, BooleanOps, BoundingRect, Contains, ConvexHull, LineString, MultiPoint, MultiPolygon, Point, Polygon, Rect};
use json::JsonValue;
use log::{debug, info};
use spade::{DelaunayTriangulation, Point2, Triangulation};
use std::fs::File;
use std::io::Write;

// Number of vertices used to approximate the round cap around each triangle corner.
const BUFFER_SEGMENTS: usize = 32;

pub type Triangle = [(f64, f64); 3];

#[derive(Clone, Copy, Debug)]
pub struct BoundaryParams {
    // triangles with an edge at least this long are dropped
    pub max_edge_len: f64,
    pub buffer: f64,
    // components with area at most this are dropped; <= 0 keeps everything
    pub min_polygon_area: f64,
}

pub fn delaunay_triangles(points: &[(f64, f64)]) -> anyhow::Result<Vec<Triangle>> {
    let vertices: Vec<Point2<f64>> = points.iter().map(|&(x, y)| Point2::new(x, y)).collect();
    let triangulation: DelaunayTriangulation<Point2<f64>> =
        DelaunayTriangulation::bulk_load(vertices)
            .map_err(|e| anyhow::anyhow!("Delaunay triangulation failed: {:?}", e))?;

    Ok(triangulation
        .inner_faces()
        .map(|face| {
            face.vertices().map(|v| {
                let p = v.position();
                (p.x, p.y)
            })
        })
        .collect())
}

pub fn longest_edge(tri: &Triangle) -> f64 {
    (0..3)
        .map(|i| {
            let (u, v) = (tri[i], tri[(i + 2) % 3]);
            ((u.0 - v.0).powi(2) + (u.1 - v.1).powi(2)).sqrt()
        })
        .fold(0.0, f64::max)
}

// A triangle is convex, so its round buffer is the convex hull of circles
// around its corners.
pub fn buffer_triangle(tri: &Triangle, buffer: f64) -> Polygon<f64> {
    let mut points: Vec<Point<f64>> = Vec::with_capacity(3 * BUFFER_SEGMENTS);
    for &(x, y) in tri {
        for k in 0..BUFFER_SEGMENTS {
            let θ = 2.0 * std::f64::consts::PI * (k as f64) / (BUFFER_SEGMENTS as f64);
            points.push(Point::new(x + buffer * θ.cos(), y + buffer * θ.sin()));
        }
    }
    MultiPoint::from(points).convex_hull()
}

// Cascaded pairwise union, much cheaper than folding polygons in one at a time.
pub fn union_all(polygons: Vec<Polygon<f64>>) -> MultiPolygon<f64> {
    let mut layer: Vec<MultiPolygon<f64>> = polygons
        .into_iter()
        .map(|p| MultiPolygon::new(vec![p]))
        .collect();

    if layer.is_empty() {
        return MultiPolygon::new(Vec::new());
    }

    while layer.len() > 1 {
        let mut next = Vec::with_capacity((layer.len() + 1) / 2);
        let mut iter = layer.into_iter();
        while let Some(lhs) = iter.next() {
            match iter.next() {
                Some(rhs) => next.push(lhs.union(&rhs)),
                None => next.push(lhs),
            }
        }
        layer = next;
    }

    layer.pop().unwrap_or_else(|| MultiPolygon::new(Vec::new()))
}

/// Triangulate the points, drop triangles spanning gaps, buffer and union the
/// rest, then remove small components.
pub fn build_boundary(points: &[(f64, f64)], params: &BoundaryParams) -> anyhow::Result<MultiPolygon<f64>> {
    let triangles = delaunay_triangles(points)?;
    let ntriangles = triangles.len();

    let buffered: Vec<Polygon<f64>> = triangles
        .iter()
        .filter(|tri| longest_edge(tri) < params.max_edge_len)
        .map(|tri| buffer_triangle(tri, params.buffer))
        .collect();

    debug!("Kept {} of {} triangles", buffered.len(), ntriangles);

    let merged = union_all(buffered);
    let merged = if params.min_polygon_area > 0.0 {
        MultiPolygon::new(
            merged
                .into_iter()
                .filter(|p| p.unsigned_area() > params.min_polygon_area)
                .collect(),
        )
    } else {
        merged
    };

    info!(
        "Boundary from {} points: {} polygon(s), total area {:.1}",
        points.len(),
        merged.0.len(),
        merged.unsigned_area()
    );

    Ok(merged)
}

/// Boundary prepared for many containment queries: each part carries its
/// bounding box so most points are rejected without a full polygon test.
pub struct PreparedBoundary {
    parts: Vec<(Rect<f64>, Polygon<f64>)>,
}

impl PreparedBoundary {
    pub fn new(boundary: &MultiPolygon<f64>) -> PreparedBoundary {
        let parts = boundary
            .iter()
            .filter_map(|p| p.bounding_rect().map(|r| (r, p.clone())))
            .collect();
        PreparedBoundary { parts }
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        let point = Point::new(x, y);
        self.parts.iter().any(|(r, p)| {
            x >= r.min().x && x <= r.max().x && y >= r.min().y && y <= r.max().y && p.contains(&point)
        })
    }
}

fn ring_json(ring: &LineString<f64>) -> anyhow::Result<JsonValue> {
    let mut coords = JsonValue::new_array();
    for coord in ring.coords() {
        coords.push(json::array![coord.x, coord.y])?;
    }
    Ok(coords)
}

fn polygon_json(polygon: &Polygon<f64>) -> anyhow::Result<JsonValue> {
    let mut rings = JsonValue::new_array();
    rings.push(ring_json(polygon.exterior())?)?;
    for interior in polygon.interiors() {
        rings.push(ring_json(interior)?)?;
    }
    Ok(rings)
}

pub fn boundary_geojson(boundary: &MultiPolygon<f64>) -> anyhow::Result<JsonValue> {
    let mut geometry = JsonValue::new_object();
    if boundary.0.len() == 1 {
        geometry.insert("type", "Polygon")?;
        geometry.insert("coordinates", polygon_json(&boundary.0[0])?)?;
    } else {
        let mut coordinates = JsonValue::new_array();
        for polygon in boundary {
            coordinates.push(polygon_json(polygon)?)?;
        }
        geometry.insert("type", "MultiPolygon")?;
        geometry.insert("coordinates", coordinates)?;
    }
    Ok(geometry)
}

pub fn write_boundary_geojson(path: &str, boundary: &MultiPolygon<f64>) -> anyhow::Result<()> {
    let geometry = boundary_geojson(boundary)?;
    let mut output = File::create(path)?;
    output.write_all(geometry.dump().as_bytes())?;
    Ok(())
}

// Writes xmin/xmax/ymin/ymax of the boundary, one key-value pair per line.
pub fn write_coordinate_minmax(path: &str, boundary: &MultiPolygon<f64>) -> anyhow::Result<()> {
    let rect = boundary
        .bounding_rect()
        .ok_or_else(|| anyhow::anyhow!("Boundary is empty, no coordinate range to report"))?;
    let mut output = File::create(path)?;
    writeln!(output, "xmin\t{}", rect.min().x)?;
    writeln!(output, "xmax\t{}", rect.max().x)?;
    writeln!(output, "ymin\t{}", rect.min().y)?;
    writeln!(output, "ymax\t{}", rect.max().y)?;
    Ok(())
}
