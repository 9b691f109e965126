//! Overlay scoring, the last pipeline stage.
//!
//! A randomly generated reference plan is intersected with the per-category
//! unions of every converted evaluation file. Unions come from the cache
//! where possible; timing of the union step feeds the performance verdict.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use geo::{Area, MultiPolygon, Polygon, Rect};
use geojson::{Feature, FeatureCollection, JsonObject};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info_span, warn};

use crate::cache::{CacheKey, UnionCache};
use crate::category::Category;
use crate::geometry;
use crate::package::CATEGORY_COLUMN;
use crate::status::{Stage, StageStatus, StatusTracker};
use crate::storage::{file_name, Workspace};

/// Processing slower than this marks the whole upload as too slow.
const SLOW_THRESHOLD: Duration = Duration::from_secs(4);

/// Number of random polygons in the reference plan.
const REFERENCE_POLYGON_COUNT: usize = 5;

/// Vertices per random reference polygon.
const REFERENCE_POLYGON_VERTICES: usize = 4;

/// Diagnostics for one category against the reference plan.
#[derive(Debug, Serialize)]
pub struct IntersectionReport {
    pub category: Category,
    pub success: bool,
    pub intersects: bool,
    pub area: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry: Option<geojson::Geometry>,
}

/// What the scorer measured, for callers that want more than the report.
#[derive(Debug, Default)]
pub struct ScoreSummary {
    /// Union-step duration per processed evaluation file, in seconds.
    pub timings: Vec<f64>,
    pub successful_intersections: u32,
    pub reference_polygons: usize,
}

pub struct OverlayScorer {
    slow_threshold: Duration,
}

impl OverlayScorer {
    pub fn new() -> Self {
        Self {
            slow_threshold: SLOW_THRESHOLD,
        }
    }

    /// Constructor for tests that need verdicts to fire at a custom
    /// threshold.
    pub fn with_slow_threshold(slow_threshold: Duration) -> Self {
        Self { slow_threshold }
    }

    /// Scores every evaluation file in the working area against a fresh
    /// random reference plan. Failures are recorded on stage 7, never raised.
    pub fn score<R: Rng>(
        &self,
        workspace: &Workspace,
        bounds: &[Rect<f64>],
        status: &mut StatusTracker,
        rng: &mut R,
    ) -> ScoreSummary {
        let _span = info_span!("pipeline.score").entered();
        let mut summary = ScoreSummary::default();

        status.add_info(
            Stage::Performance,
            "Generating random features within the evaluation feature bounds",
        );
        let reference = match geometry::envelope(bounds) {
            Some(env) => geometry::random_polygons(
                &env,
                REFERENCE_POLYGON_COUNT,
                REFERENCE_POLYGON_VERTICES,
                rng,
            ),
            None => Vec::new(),
        };
        summary.reference_polygons = reference.len();
        let plan = geometry::union(&reference).unwrap_or_else(|| MultiPolygon(Vec::new()));
        debug!("reference plan has {} polygon(s)", summary.reference_polygons);

        let mut cache = match UnionCache::open(&workspace.cache_path()) {
            Ok(cache) => cache,
            Err(e) => {
                warn!("could not open union cache: {}", e);
                status.add_error(
                    Stage::Performance,
                    format!("Could not open the union cache: {e}"),
                );
                status.set_status(Stage::Performance, StageStatus::Error);
                status.set_status_text(Stage::Performance, "Performance testing failed");
                return summary;
            }
        };

        let evaluations = match workspace.scan_evaluations() {
            Ok(files) => files,
            Err(e) => {
                warn!("could not scan the working area: {}", e);
                status.add_error(
                    Stage::Performance,
                    format!("Could not read the converted evaluation files: {e}"),
                );
                status.set_status(Stage::Performance, StageStatus::Error);
                status.set_status_text(Stage::Performance, "Performance testing failed");
                return summary;
            }
        };

        for path in &evaluations {
            let name = file_name(path);
            status.add_info(Stage::Performance, format!("Currently processing: {name}"));

            let collection = match workspace.read_geojson(path) {
                Ok(collection) => collection,
                Err(e) => {
                    warn!("skipping {}: {}", name, e);
                    status.add_error(
                        Stage::Performance,
                        format!("Could not read evaluation file {name}: {e}"),
                    );
                    continue;
                }
            };

            let (groups, dropped) = group_features(&collection);
            status.add_info(
                Stage::Performance,
                format!(
                    "Geometry errors in {} features.",
                    format_counts(dropped.iter().map(|(c, n)| (*c, *n)))
                ),
            );
            status.add_info(
                Stage::Performance,
                format!(
                    "Processed {} features.",
                    format_counts(groups.iter().map(|(c, g)| (*c, g.len())))
                ),
            );

            let timer = Instant::now();
            for (category, polygons) in &groups {
                if polygons.is_empty() {
                    continue;
                }
                let key = CacheKey::new(&name, *category);
                if let Err(e) = cache.get_or_compute(&key, || geometry::union(polygons)) {
                    warn!("union of {} failed: {}", key, e);
                    status.add_error(
                        Stage::Performance,
                        format!("Could not compute the {category} union: {e}"),
                    );
                }
            }
            if let Err(e) = cache.commit() {
                status.add_error(
                    Stage::Performance,
                    format!("Could not store computed unions: {e}"),
                );
            }
            let elapsed = timer.elapsed().as_secs_f64();
            summary.timings.push(elapsed);
            status.set_status_text(
                Stage::Performance,
                format!("Processing took {elapsed:.4} seconds"),
            );

            summary.successful_intersections +=
                self.write_results(workspace, &mut cache, &plan, &name, status);
        }

        self.apply_verdict(&summary, status);
        summary
    }

    /// Reads each category union back from the cache and writes the union
    /// and intersection documents. Returns the number of intersections that
    /// were computed.
    fn write_results(
        &self,
        workspace: &Workspace,
        cache: &mut UnionCache,
        plan: &MultiPolygon<f64>,
        name: &str,
        status: &mut StatusTracker,
    ) -> u32 {
        let mut successes = 0;
        for category in Category::ALL {
            let key = CacheKey::new(name, category);
            let union = match cache.try_get(&key) {
                Ok(Some(union)) => union,
                Ok(None) => {
                    status.add_info(
                        Stage::Performance,
                        format!("No {category} features in evaluation file."),
                    );
                    continue;
                }
                Err(e) => {
                    status.add_error(
                        Stage::Performance,
                        format!("Could not read the {category} union back: {e}"),
                    );
                    continue;
                }
            };

            let union_path = workspace.output_path(&category.union_filename());
            if let Err(e) = workspace.write_json(&union_path, &union_document(&union, category)) {
                status.add_error(
                    Stage::Performance,
                    format!("Could not write the {category} union file: {e}"),
                );
                continue;
            }

            let overlap = geometry::intersection(plan, &union);
            let intersects = !overlap.0.is_empty();
            let report = IntersectionReport {
                category,
                success: true,
                intersects,
                area: overlap.unsigned_area(),
                geometry: intersects.then(|| geometry::to_geojson_geometry(&overlap)),
            };
            let intersect_path = workspace.output_path(&category.intersect_filename());
            match workspace.write_json(&intersect_path, &report) {
                Ok(()) => successes += 1,
                Err(e) => {
                    status.add_error(
                        Stage::Performance,
                        format!("Could not write the {category} intersection file: {e}"),
                    );
                }
            }
        }
        successes
    }

    fn apply_verdict(&self, summary: &ScoreSummary, status: &mut StatusTracker) {
        let slowest = summary.timings.iter().copied().fold(0.0, f64::max);
        if slowest > self.slow_threshold.as_secs_f64() {
            status.add_error(
                Stage::Performance,
                "Your file is either too large or is taking too much time to process, \
                 it is recommended that you reduce the features or simplify them.",
            );
            status.set_status(Stage::Performance, StageStatus::Error);
            status.set_status_text(
                Stage::Performance,
                "Your file is either too large or is taking too much time to process, \
                 it is recommended that you reduce the features or simplify them.",
            );
        } else if summary.successful_intersections == 0 {
            status.add_error(
                Stage::Performance,
                "Your file has topology and geometry errors. Please fix them and try again.",
            );
            status.set_status(Stage::Performance, StageStatus::Error);
            status.set_status_text(
                Stage::Performance,
                "Your file has topology and geometry errors. Please fix them and try again.",
            );
        } else {
            // Leaves the timing status text in place.
            status.add_success(Stage::Performance, "Performance is ok");
            status.set_status(Stage::Performance, StageStatus::Success);
        }
    }
}

impl Default for OverlayScorer {
    fn default() -> Self {
        Self::new()
    }
}

/// Sorts sanitized polygons into per-category buckets, counting the features
/// that had to be dropped.
fn group_features(
    collection: &FeatureCollection,
) -> (
    BTreeMap<Category, Vec<Polygon<f64>>>,
    BTreeMap<Category, usize>,
) {
    let mut groups: BTreeMap<Category, Vec<Polygon<f64>>> =
        Category::ALL.iter().map(|c| (*c, Vec::new())).collect();
    let mut dropped: BTreeMap<Category, usize> =
        Category::ALL.iter().map(|c| (*c, 0)).collect();

    for feature in &collection.features {
        let category = feature
            .properties
            .as_ref()
            .and_then(|properties| properties.get(CATEGORY_COLUMN))
            .and_then(|value| value.as_str())
            .and_then(Category::parse);
        let Some(category) = category else { continue };
        let Some(geojson_geometry) = feature.geometry.as_ref() else {
            continue;
        };
        for polygon in geometry::polygons_of_geojson(&geojson_geometry.value) {
            match geometry::sanitize(&polygon) {
                Some(clean) => groups.entry(category).or_default().push(clean),
                None => *dropped.entry(category).or_default() += 1,
            }
        }
    }
    (groups, dropped)
}

/// "2 red2, 0 red, ... and 1 constraints", in canonical category order.
fn format_counts(counts: impl Iterator<Item = (Category, usize)>) -> String {
    let parts: Vec<String> = counts
        .map(|(category, count)| format!("{count} {category}"))
        .collect();
    match parts.split_last() {
        Some((last, rest)) if !rest.is_empty() => {
            format!("{} and {}", rest.join(", "), last)
        }
        Some((only, _)) => only.clone(),
        None => String::new(),
    }
}

/// Feature collection holding one union feature tagged with its category.
fn union_document(union: &MultiPolygon<f64>, category: Category) -> FeatureCollection {
    let mut properties = JsonObject::new();
    properties.insert(
        CATEGORY_COLUMN.to_string(),
        serde_json::Value::String(category.to_string()),
    );
    FeatureCollection {
        bbox: None,
        features: vec![Feature {
            bbox: None,
            geometry: Some(geometry::to_geojson_geometry(union)),
            id: None,
            properties: Some(properties),
            foreign_members: None,
        }],
        foreign_members: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;
    use tempfile::TempDir;

    fn square(x: f64, y: f64, size: f64) -> Polygon<f64> {
        polygon![
            (x: x, y: y),
            (x: x + size, y: y),
            (x: x + size, y: y + size),
            (x: x, y: y + size),
            (x: x, y: y),
        ]
    }

    fn workspace(temp: &TempDir) -> Workspace {
        let ws = Workspace::new(
            &temp.path().join("source"),
            &temp.path().join("working"),
            &temp.path().join("output"),
        );
        ws.ensure_areas().unwrap();
        ws
    }

    fn write_evaluation(ws: &Workspace, name: &str, features: &[(Category, Polygon<f64>)]) {
        let features = features
            .iter()
            .map(|(category, polygon)| {
                let mut properties = JsonObject::new();
                properties.insert(
                    CATEGORY_COLUMN.to_string(),
                    serde_json::Value::String(category.to_string()),
                );
                Feature {
                    bbox: None,
                    geometry: Some(geojson::Geometry::new(geojson::Value::from(polygon))),
                    id: None,
                    properties: Some(properties),
                    foreign_members: None,
                }
            })
            .collect();
        let collection = FeatureCollection {
            bbox: None,
            features,
            foreign_members: None,
        };
        ws.write_json(&ws.working_path(name), &collection).unwrap();
    }

    fn seeded_rng() -> rand::rngs::StdRng {
        use rand::SeedableRng;
        rand::rngs::StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_happy_path_scores_and_writes_results() {
        let temp = TempDir::new().unwrap();
        let ws = workspace(&temp);
        write_evaluation(
            &ws,
            "site.geojson",
            &[
                (Category::Red, square(0.0, 0.0, 10.0)),
                (Category::Green, square(2.0, 2.0, 10.0)),
            ],
        );

        let bounds = [Rect::new((0.0, 0.0), (12.0, 12.0))];
        let mut status = StatusTracker::new();
        let summary = OverlayScorer::new().score(&ws, &bounds, &mut status, &mut seeded_rng());

        assert_eq!(status.status(Stage::Performance), StageStatus::Success);
        assert_eq!(summary.timings.len(), 1);
        assert_eq!(summary.successful_intersections, 2);
        assert!(ws.output_path("red.json").is_file());
        assert!(ws.output_path("red-intersect.json").is_file());
        assert!(ws.output_path("green.json").is_file());
        assert!(ws.output_path("green-intersect.json").is_file());
        assert!(!ws.output_path("yellow.json").exists());
        assert!(status
            .record(Stage::Performance)
            .status_text
            .starts_with("Processing took"));
    }

    #[test]
    fn test_intersection_report_contents() {
        let temp = TempDir::new().unwrap();
        let ws = workspace(&temp);

        let mut cache = UnionCache::open(&ws.cache_path()).unwrap();
        let key = CacheKey::new("site.geojson", Category::Red);
        cache.put(&key, &MultiPolygon(vec![square(0.0, 0.0, 10.0)]));
        cache.commit().unwrap();

        // A plan fully inside the cached union intersects it.
        let plan = MultiPolygon(vec![square(1.0, 1.0, 2.0)]);
        let mut status = StatusTracker::new();
        let successes = OverlayScorer::new().write_results(
            &ws,
            &mut cache,
            &plan,
            "site.geojson",
            &mut status,
        );
        assert_eq!(successes, 1);

        let raw = std::fs::read_to_string(ws.output_path("red-intersect.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["category"], "red");
        assert_eq!(parsed["success"], true);
        assert_eq!(parsed["intersects"], true);
        assert!((parsed["area"].as_f64().unwrap() - 4.0).abs() < 1e-9);
        assert_eq!(parsed["geometry"]["type"], "MultiPolygon");
    }

    #[test]
    fn test_disjoint_plan_reports_no_overlap() {
        let temp = TempDir::new().unwrap();
        let ws = workspace(&temp);

        let mut cache = UnionCache::open(&ws.cache_path()).unwrap();
        let key = CacheKey::new("site.geojson", Category::Red);
        cache.put(&key, &MultiPolygon(vec![square(0.0, 0.0, 1.0)]));
        cache.commit().unwrap();

        let plan = MultiPolygon(vec![square(50.0, 50.0, 1.0)]);
        let mut status = StatusTracker::new();
        OverlayScorer::new().write_results(&ws, &mut cache, &plan, "site.geojson", &mut status);

        let raw = std::fs::read_to_string(ws.output_path("red-intersect.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["intersects"], false);
        assert_eq!(parsed["area"], 0.0);
        assert!(parsed.get("geometry").is_none());
    }

    #[test]
    fn test_zero_second_threshold_turns_slow_verdict() {
        let temp = TempDir::new().unwrap();
        let ws = workspace(&temp);
        write_evaluation(&ws, "site.geojson", &[(Category::Red, square(0.0, 0.0, 10.0))]);

        let bounds = [Rect::new((0.0, 0.0), (10.0, 10.0))];
        let mut status = StatusTracker::new();
        let scorer = OverlayScorer::with_slow_threshold(Duration::ZERO);
        scorer.score(&ws, &bounds, &mut status, &mut seeded_rng());

        assert_eq!(status.status(Stage::Performance), StageStatus::Error);
        assert!(status
            .record(Stage::Performance)
            .status_text
            .contains("too large"));
    }

    #[test]
    fn test_no_evaluations_is_a_geometry_error() {
        let temp = TempDir::new().unwrap();
        let ws = workspace(&temp);

        let mut status = StatusTracker::new();
        let summary = OverlayScorer::new().score(&ws, &[], &mut status, &mut seeded_rng());

        assert_eq!(summary.successful_intersections, 0);
        assert_eq!(status.status(Stage::Performance), StageStatus::Error);
        assert!(status
            .record(Stage::Performance)
            .status_text
            .contains("topology and geometry"));
    }

    #[test]
    fn test_unreadable_evaluation_is_contained() {
        let temp = TempDir::new().unwrap();
        let ws = workspace(&temp);
        std::fs::write(ws.working_path("bad.geojson"), b"not geojson").unwrap();
        write_evaluation(&ws, "site.geojson", &[(Category::Red, square(0.0, 0.0, 10.0))]);

        let bounds = [Rect::new((0.0, 0.0), (10.0, 10.0))];
        let mut status = StatusTracker::new();
        let summary = OverlayScorer::new().score(&ws, &bounds, &mut status, &mut seeded_rng());

        // The good file still scores.
        assert_eq!(summary.successful_intersections, 1);
        assert_eq!(status.status(Stage::Performance), StageStatus::Success);
        assert!(!status.record(Stage::Performance).errors.is_empty());
    }

    #[test]
    fn test_empty_categories_reported_as_info() {
        let temp = TempDir::new().unwrap();
        let ws = workspace(&temp);
        write_evaluation(&ws, "site.geojson", &[(Category::Red, square(0.0, 0.0, 10.0))]);

        let bounds = [Rect::new((0.0, 0.0), (10.0, 10.0))];
        let mut status = StatusTracker::new();
        OverlayScorer::new().score(&ws, &bounds, &mut status, &mut seeded_rng());

        let infos: Vec<&str> = status
            .record(Stage::Performance)
            .info
            .iter()
            .map(|m| m.msg.as_str())
            .collect();
        assert!(infos.contains(&"No green features in evaluation file."));
        assert!(!infos.contains(&"No red features in evaluation file."));
    }

    #[test]
    fn test_format_counts() {
        let counts = Category::ALL.iter().map(|c| (*c, 1usize));
        let text = format_counts(counts);
        assert_eq!(
            text,
            "1 red2, 1 red, 1 yellow, 1 green, 1 green2, 1 green3 and 1 constraints"
        );
    }
}
