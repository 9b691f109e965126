//! Geometry engine: sanitization, unions, bounds and the random
//! reference-plan polygons used by the overlay scorer.

pub mod reproject;
pub mod wkb;

use geo::algorithm::orient::{Direction, Orient};
use geo::{
    coord, Area, BooleanOps, BoundingRect, Coord, LineString, MultiPolygon, Polygon, Rect,
    Simplify, Validation,
};
use rand::Rng;

use wkb::DecodedGeometry;

/// Douglas-Peucker tolerance applied before conversion, in degrees.
pub const SIMPLIFY_TOLERANCE: f64 = 0.000_1;

/// Attempts to repair and validate one evaluation polygon.
///
/// Rings wound the wrong way are reoriented; anything still invalid or
/// without area is rejected so a single bad feature never poisons a union.
pub fn sanitize(polygon: &Polygon<f64>) -> Option<Polygon<f64>> {
    if polygon.exterior().0.len() < 4 {
        return None;
    }
    let oriented = polygon.orient(Direction::Default);
    if !oriented.is_valid() {
        return None;
    }
    if oriented.unsigned_area() == 0.0 {
        return None;
    }
    Some(oriented)
}

/// Splits a decoded geometry into single-part polygons.
pub fn singleparts(geometry: &DecodedGeometry) -> Vec<Polygon<f64>> {
    match geometry {
        DecodedGeometry::Polygon(polygon) => vec![polygon.clone()],
        DecodedGeometry::MultiPolygon(multipolygon) => multipolygon.0.clone(),
        DecodedGeometry::Empty | DecodedGeometry::Unsupported(_) => Vec::new(),
    }
}

/// Unions a set of polygons into one multipolygon. `None` when the input is
/// empty or the union comes out empty.
pub fn union(polygons: &[Polygon<f64>]) -> Option<MultiPolygon<f64>> {
    let mut parts = polygons.iter();
    let first = MultiPolygon(vec![parts.next()?.clone()]);
    let unioned = parts.fold(first, |accum, polygon| {
        accum.union(&MultiPolygon(vec![polygon.clone()]))
    });
    if unioned.0.is_empty() {
        None
    } else {
        Some(unioned)
    }
}

/// Overlap between the reference plan and one category union.
pub fn intersection(
    plan: &MultiPolygon<f64>,
    shapes: &MultiPolygon<f64>,
) -> MultiPolygon<f64> {
    plan.intersection(shapes)
}

/// Simplifies one polygon with the fixed tolerance.
pub fn simplify(polygon: &Polygon<f64>) -> Polygon<f64> {
    polygon.simplify(&SIMPLIFY_TOLERANCE)
}

/// Smallest rectangle covering both inputs.
pub fn merge_rects(a: Rect<f64>, b: Rect<f64>) -> Rect<f64> {
    Rect::new(
        coord! { x: a.min().x.min(b.min().x), y: a.min().y.min(b.min().y) },
        coord! { x: a.max().x.max(b.max().x), y: a.max().y.max(b.max().y) },
    )
}

/// Envelope of a collection of bounding boxes.
pub fn envelope(bounds: &[Rect<f64>]) -> Option<Rect<f64>> {
    bounds.iter().copied().reduce(merge_rects)
}

/// One random polygon with `vertices` corners inside `bounds`.
///
/// Vertices sit on sorted angles around a random center, which keeps the
/// ring star-shaped so candidates rarely self-intersect.
pub fn random_polygon<R: Rng>(bounds: &Rect<f64>, vertices: usize, rng: &mut R) -> Polygon<f64> {
    let max_radius = bounds.width().min(bounds.height()) / 4.0;
    let center = coord! {
        x: rng.gen_range(bounds.min().x + max_radius..=bounds.max().x - max_radius),
        y: rng.gen_range(bounds.min().y + max_radius..=bounds.max().y - max_radius),
    };

    let mut angles: Vec<f64> = (0..vertices)
        .map(|_| rng.gen_range(0.0..std::f64::consts::TAU))
        .collect();
    angles.sort_by(f64::total_cmp);

    let ring: Vec<Coord<f64>> = angles
        .iter()
        .map(|angle| {
            let radius = rng.gen_range(max_radius * 0.25..=max_radius.max(f64::MIN_POSITIVE));
            coord! {
                x: center.x + radius * angle.cos(),
                y: center.y + radius * angle.sin(),
            }
        })
        .collect();
    Polygon::new(LineString::from(ring), Vec::new())
}

/// Generates `count` random polygons and keeps the valid ones.
pub fn random_polygons<R: Rng>(
    bounds: &Rect<f64>,
    count: usize,
    vertices: usize,
    rng: &mut R,
) -> Vec<Polygon<f64>> {
    (0..count)
        .map(|_| random_polygon(bounds, vertices, rng))
        .filter(|polygon| polygon.is_valid() && polygon.unsigned_area() > 0.0)
        .collect()
}

/// GeoJSON geometry for a multipolygon.
pub fn to_geojson_geometry(multipolygon: &MultiPolygon<f64>) -> geojson::Geometry {
    geojson::Geometry::new(geojson::Value::from(multipolygon))
}

/// Polygons carried by one GeoJSON geometry value.
pub fn polygons_of_geojson(value: &geojson::Value) -> Vec<Polygon<f64>> {
    match geo::Geometry::<f64>::try_from(value.clone()) {
        Ok(geo::Geometry::Polygon(polygon)) => vec![polygon],
        Ok(geo::Geometry::MultiPolygon(multipolygon)) => multipolygon.0,
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, Winding};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn square(x: f64, y: f64, size: f64) -> Polygon<f64> {
        polygon![
            (x: x, y: y),
            (x: x + size, y: y),
            (x: x + size, y: y + size),
            (x: x, y: y + size),
        ]
    }

    // ── Sanitization ──

    #[test]
    fn test_sanitize_accepts_simple_polygon() {
        assert!(sanitize(&square(0.0, 0.0, 1.0)).is_some());
    }

    #[test]
    fn test_sanitize_reorients_backwards_ring() {
        let backwards = polygon![
            (x: 0.0, y: 0.0),
            (x: 0.0, y: 1.0),
            (x: 1.0, y: 1.0),
            (x: 1.0, y: 0.0),
        ];
        let fixed = sanitize(&backwards).unwrap();
        assert!(fixed.exterior().is_ccw());
    }

    #[test]
    fn test_sanitize_rejects_bowtie() {
        let bowtie = polygon![
            (x: 0.0, y: 0.0),
            (x: 1.0, y: 1.0),
            (x: 1.0, y: 0.0),
            (x: 0.0, y: 1.0),
        ];
        assert!(sanitize(&bowtie).is_none());
    }

    #[test]
    fn test_sanitize_rejects_degenerate_ring() {
        let line = Polygon::new(
            LineString::from(vec![(0.0, 0.0), (1.0, 0.0), (0.0, 0.0)]),
            Vec::new(),
        );
        assert!(sanitize(&line).is_none());
    }

    // ── Union & intersection ──

    #[test]
    fn test_union_of_disjoint_squares() {
        let unioned = union(&[square(0.0, 0.0, 1.0), square(5.0, 0.0, 1.0)]).unwrap();
        assert_eq!(unioned.0.len(), 2);
        assert!((unioned.unsigned_area() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_union_of_overlapping_squares_merges() {
        let unioned = union(&[square(0.0, 0.0, 2.0), square(1.0, 0.0, 2.0)]).unwrap();
        assert_eq!(unioned.0.len(), 1);
        assert!((unioned.unsigned_area() - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_union_of_nothing_is_none() {
        assert!(union(&[]).is_none());
    }

    #[test]
    fn test_intersection_of_contained_shape() {
        let plan = MultiPolygon(vec![square(0.0, 0.0, 10.0)]);
        let inner = MultiPolygon(vec![square(2.0, 2.0, 1.0)]);
        let overlap = intersection(&plan, &inner);
        assert!(!overlap.0.is_empty());
        assert!((overlap.unsigned_area() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_intersection_of_disjoint_shapes_is_empty() {
        let plan = MultiPolygon(vec![square(0.0, 0.0, 1.0)]);
        let far = MultiPolygon(vec![square(100.0, 100.0, 1.0)]);
        assert!(intersection(&plan, &far).0.is_empty());
    }

    // ── Bounds ──

    #[test]
    fn test_envelope_merges_rects() {
        let a = square(0.0, 0.0, 1.0).bounding_rect().unwrap();
        let b = square(4.0, 4.0, 1.0).bounding_rect().unwrap();
        let merged = envelope(&[a, b]).unwrap();
        assert_eq!(merged.min(), coord! { x: 0.0, y: 0.0 });
        assert_eq!(merged.max(), coord! { x: 5.0, y: 5.0 });
    }

    #[test]
    fn test_envelope_of_nothing_is_none() {
        assert!(envelope(&[]).is_none());
    }

    // ── Simplification ──

    #[test]
    fn test_simplify_drops_redundant_vertices() {
        let dense = Polygon::new(
            LineString::from(vec![
                (0.0, 0.0),
                (0.5, 0.000_001),
                (1.0, 0.0),
                (1.0, 1.0),
                (0.0, 1.0),
                (0.0, 0.0),
            ]),
            Vec::new(),
        );
        let simplified = simplify(&dense);
        assert!(simplified.exterior().0.len() < dense.exterior().0.len());
    }

    // ── Random reference polygons ──

    #[test]
    fn test_random_polygons_stay_in_bounds_and_are_valid() {
        let bounds = Rect::new(coord! { x: 0.0, y: 0.0 }, coord! { x: 10.0, y: 6.0 });
        let mut rng = StdRng::seed_from_u64(42);
        let polygons = random_polygons(&bounds, 5, 4, &mut rng);
        assert!(!polygons.is_empty());
        for polygon in &polygons {
            assert!(polygon.is_valid());
            // closed ring: 4 corners plus the closing coordinate
            assert_eq!(polygon.exterior().0.len(), 5);
            let rect = polygon.bounding_rect().unwrap();
            assert!(rect.min().x >= 0.0 && rect.max().x <= 10.0);
            assert!(rect.min().y >= 0.0 && rect.max().y <= 6.0);
        }
    }

    #[test]
    fn test_random_polygons_are_deterministic_for_a_seed() {
        let bounds = Rect::new(coord! { x: 0.0, y: 0.0 }, coord! { x: 1.0, y: 1.0 });
        let first = random_polygons(&bounds, 5, 4, &mut StdRng::seed_from_u64(7));
        let second = random_polygons(&bounds, 5, 4, &mut StdRng::seed_from_u64(7));
        assert_eq!(first, second);
    }

    // ── GeoJSON bridging ──

    #[test]
    fn test_geojson_geometry_round_trip() {
        let multipolygon = MultiPolygon(vec![square(0.0, 0.0, 1.0)]);
        let geometry = to_geojson_geometry(&multipolygon);
        let polygons = polygons_of_geojson(&geometry.value);
        assert_eq!(polygons.len(), 1);
        assert!((polygons[0].unsigned_area() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_polygons_of_non_polygonal_geojson_is_empty() {
        let point = geojson::Value::Point(vec![1.0, 2.0]);
        assert!(polygons_of_geojson(&point).is_empty());
    }
}
