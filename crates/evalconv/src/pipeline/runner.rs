//! Orchestrates the seven stages for one batch of uploaded packages.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use geo::{BoundingRect, Rect};
use geojson::{Feature, FeatureCollection, JsonObject};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info_span, warn};

use crate::category::Category;
use crate::config::Config;
use crate::error::{PackageError, StorageError};
use crate::geometry::{self, reproject};
use crate::package::{
    self, EvalFeature, GeopackageReader, PackageSchema, RawFeature, CATEGORY_COLUMN,
};
use crate::status::{Stage, StageStatus, StatusReport, StatusTracker};
use crate::storage::{file_name, Workspace};

use super::scorer::OverlayScorer;

/// Everything a run produces: converted payloads plus the stage report.
pub struct PipelineOutcome {
    /// Parsed GeoJSON per source package file name.
    pub payloads: BTreeMap<String, FeatureCollection>,
    pub report: StatusReport,
}

pub struct EvaluationPipeline {
    workspace: Workspace,
    scorer: OverlayScorer,
    rng: StdRng,
}

impl EvaluationPipeline {
    /// Production constructor.
    pub fn from_config(config: &Config) -> Self {
        Self {
            workspace: Workspace::from_config(config),
            scorer: OverlayScorer::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic constructor, used when the reference plan must be
    /// reproducible.
    pub fn with_seed(config: &Config, seed: u64) -> Self {
        Self {
            workspace: Workspace::from_config(config),
            scorer: OverlayScorer::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Empties the source, working and output areas, keeping README
    /// sentinel files.
    pub fn clean(&self) -> Result<(), StorageError> {
        self.workspace.clean()
    }

    /// Runs the full pipeline. Never fails: every problem ends up in the
    /// returned report instead.
    pub fn run(&mut self) -> PipelineOutcome {
        let _pipeline_span = info_span!("pipeline").entered();
        let mut status = StatusTracker::new();
        let mut payloads = BTreeMap::new();
        let mut all_bounds = Vec::new();

        if let Err(e) = self.workspace.ensure_areas() {
            warn!("could not prepare the working areas: {}", e);
            status.add_error(
                Stage::ArchiveIntegrity,
                format!("Could not prepare the working areas: {e}"),
            );
            status.set_status(Stage::ArchiveIntegrity, StageStatus::Error);
            status.set_status_text(Stage::ArchiveIntegrity, "Could not prepare the working areas");
            short_circuit(&mut status, &STAGES_AFTER_INTEGRITY);
            self.finish(&mut status, &all_bounds);
            return PipelineOutcome {
                payloads,
                report: status.report(),
            };
        }

        // Stage 1: every upload must be a readable GeoPackage container
        let packages = {
            let _step = info_span!("pipeline.archive_check").entered();
            self.step_check_archives(&mut status)
        };

        // Stage 2: exactly one package
        let package = {
            let _step = info_span!("pipeline.select_package").entered();
            self.step_select_package(&mut status, &packages)
        };

        // Stages 3-6: validate, reproject, simplify, convert
        if let Some(path) = package {
            let _step = info_span!("pipeline.process_package").entered();
            self.step_process_package(&path, &mut status, &mut payloads, &mut all_bounds);
        }

        // Stage 7: gate on earlier errors, then score
        self.finish(&mut status, &all_bounds);

        PipelineOutcome {
            payloads,
            report: status.report(),
        }
    }

    fn step_check_archives(&self, status: &mut StatusTracker) -> Vec<PathBuf> {
        let packages = match self.workspace.scan_packages() {
            Ok(packages) => packages,
            Err(e) => {
                warn!("could not scan the source area: {}", e);
                status.add_error(
                    Stage::ArchiveIntegrity,
                    format!("Could not scan the source area: {e}"),
                );
                status.set_status(Stage::ArchiveIntegrity, StageStatus::Error);
                status.set_status_text(
                    Stage::ArchiveIntegrity,
                    "Problem with opening and reading gpkg file contents.",
                );
                return Vec::new();
            }
        };

        let mut all_readable = true;
        for package in &packages {
            let name = file_name(package);
            if package::is_package_container(package) {
                status.add_success(
                    Stage::ArchiveIntegrity,
                    format!("{name} read without problems"),
                );
            } else {
                all_readable = false;
                status.add_error(
                    Stage::ArchiveIntegrity,
                    format!("Problems with your gpkg file {name}, please make sure that it is not corrupt."),
                );
            }
        }

        if all_readable {
            status.set_status(Stage::ArchiveIntegrity, StageStatus::Success);
            status.set_status_text(Stage::ArchiveIntegrity, "gpkg file read without problems");
            status.add_success(Stage::ArchiveIntegrity, "File contents read successfully");
        } else {
            status.set_status(Stage::ArchiveIntegrity, StageStatus::Error);
            status.set_status_text(
                Stage::ArchiveIntegrity,
                "Problem with opening and reading gpkg file contents.",
            );
        }
        packages
    }

    fn step_select_package(
        &self,
        status: &mut StatusTracker,
        packages: &[PathBuf],
    ) -> Option<PathBuf> {
        if status.status(Stage::ArchiveIntegrity) == StageStatus::Success && packages.len() == 1 {
            status.set_status(Stage::PackagePresence, StageStatus::Success);
            status.set_status_text(Stage::PackagePresence, "GeoPackage was found in the archive");
            status.add_success(
                Stage::PackagePresence,
                "Geopackage extracted successfully and contents read",
            );
            return Some(packages[0].clone());
        }

        warn!("could not select a package: {} candidate(s)", packages.len());
        match packages.len() {
            0 => status.add_error(
                Stage::PackagePresence,
                "Please ensure that you upload a Geopackage file with a .gpkg extension.",
            ),
            1 => status.add_error(
                Stage::PackagePresence,
                "The uploaded Geopackage could not be read, see the previous stage.",
            ),
            n => status.add_error(
                Stage::PackagePresence,
                format!("Only one Geopackage can be processed per upload, found {n}."),
            ),
        }
        status.set_status(Stage::PackagePresence, StageStatus::Error);
        status.set_status_text(Stage::PackagePresence, "Could not find .gpkg file.");
        short_circuit(status, &STAGES_AFTER_PRESENCE);
        None
    }

    fn step_process_package(
        &self,
        path: &Path,
        status: &mut StatusTracker,
        payloads: &mut BTreeMap<String, FeatureCollection>,
        all_bounds: &mut Vec<Rect<f64>>,
    ) {
        let name = file_name(path);

        let Some((schema, raw_features)) = self.step_validate(path, status) else {
            return;
        };
        let features = self.step_normalize(&schema, &raw_features, status);
        let simplified = self.step_simplify(features, status, all_bounds);
        self.step_convert(&name, &simplified, status, payloads);
    }

    /// Stage 3: both validation gates must pass; otherwise stages 4-7 are
    /// failed in one sweep.
    fn step_validate(
        &self,
        path: &Path,
        status: &mut StatusTracker,
    ) -> Option<(PackageSchema, Vec<RawFeature>)> {
        let loaded = (|| -> Result<_, PackageError> {
            let reader = GeopackageReader::open(path)?;
            let schema = reader.schema()?;
            let features = reader.read_features(&schema)?;
            Ok((schema, features))
        })();

        let (schema, features) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("could not read {}: {}", path.display(), e);
                status.add_error(
                    Stage::FeatureValidation,
                    format!("Could not read the package: {e}"),
                );
                fail_validation(status);
                return None;
            }
        };

        let geometry_ok = package::validate_geometry(&schema, &features);
        if geometry_ok {
            status.add_info(Stage::FeatureValidation, "Every feature is a polygon");
        } else {
            status.add_error(
                Stage::FeatureValidation,
                "The package must contain only 2D polygon geometries. \
                 Please remove points, lines and 3D shapes.",
            );
        }

        let categories_ok = package::validate_categories(&features);
        if categories_ok {
            status.add_info(
                Stage::FeatureValidation,
                "Every feature has a recognized areatype value",
            );
        } else {
            status.add_error(
                Stage::FeatureValidation,
                "Every feature needs an areatype attribute set to one of the \
                 recognized category values.",
            );
        }

        if geometry_ok && categories_ok {
            status.set_status(Stage::FeatureValidation, StageStatus::Success);
            status.set_status_text(
                Stage::FeatureValidation,
                "Attribute table and geometries are valid",
            );
            status.add_success(
                Stage::FeatureValidation,
                "Geopackage has the areatype column and correct values in the attribute table",
            );
            Some((schema, features))
        } else {
            fail_validation(status);
            None
        }
    }

    /// Stage 4: explode multiparts and reproject each part to WGS84.
    /// Features that cannot be reprojected are dropped, not fatal.
    fn step_normalize(
        &self,
        schema: &PackageSchema,
        raw: &[RawFeature],
        status: &mut StatusTracker,
    ) -> Vec<EvalFeature> {
        let mut features = Vec::new();
        let mut dropped = 0u32;
        for feature in raw {
            let Some(category) = feature.category.as_deref().and_then(Category::parse) else {
                continue;
            };
            for part in geometry::singleparts(&feature.geometry) {
                match reproject::to_wgs84(&part, schema.srs_id) {
                    Ok(polygon) => features.push(EvalFeature { category, polygon }),
                    Err(e) => {
                        debug!("dropping feature {}: {}", feature.fid, e);
                        dropped += 1;
                    }
                }
            }
        }

        if dropped > 0 {
            status.add_info(
                Stage::Reprojection,
                format!("{dropped} feature(s) could not be reprojected and were removed from the output."),
            );
            status.set_status(Stage::Reprojection, StageStatus::Information);
            status.set_status_text(
                Stage::Reprojection,
                "There were errors in reprojecting some features, they are removed from output.",
            );
        } else {
            status.set_status(Stage::Reprojection, StageStatus::Success);
            status.set_status_text(Stage::Reprojection, "Geopackage reprojected successfully");
        }
        status.add_success(Stage::Reprojection, "Reprojected feature set prepared");
        features
    }

    /// Stage 5: simplify every polygon and record the combined bounds for
    /// the overlay scorer.
    fn step_simplify(
        &self,
        features: Vec<EvalFeature>,
        status: &mut StatusTracker,
        all_bounds: &mut Vec<Rect<f64>>,
    ) -> Vec<EvalFeature> {
        let simplified: Vec<EvalFeature> = features
            .into_iter()
            .map(|feature| EvalFeature {
                category: feature.category,
                polygon: geometry::simplify(&feature.polygon),
            })
            .collect();

        let bounds = simplified
            .iter()
            .filter_map(|feature| feature.polygon.bounding_rect())
            .reduce(geometry::merge_rects);
        match bounds {
            Some(rect) => {
                all_bounds.push(rect);
                status.add_success(
                    Stage::Simplification,
                    "Features simplified and bounds recorded",
                );
            }
            None => {
                status.add_info(Stage::Simplification, "No geometries left to simplify.");
            }
        }
        status.set_status(Stage::Simplification, StageStatus::Success);
        status.set_status_text(Stage::Simplification, "Geometries simplified");
        simplified
    }

    /// Stage 6: stage the converted file in the working area and read it
    /// back as the payload. The scorer consumes the staged file, so the
    /// payload must come from disk, not from memory.
    fn step_convert(
        &self,
        name: &str,
        features: &[EvalFeature],
        status: &mut StatusTracker,
        payloads: &mut BTreeMap<String, FeatureCollection>,
    ) {
        let stem = Path::new(name)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string());
        let working = self.workspace.working_path(&format!("{stem}.geojson"));

        let converted = self
            .workspace
            .write_json(&working, &feature_collection(features))
            .and_then(|()| self.workspace.read_geojson(&working));

        match converted {
            Ok(payload) => {
                payloads.insert(name.to_string(), payload);
                status.set_status(Stage::Conversion, StageStatus::Success);
                status.set_status_text(Stage::Conversion, "Converted to GeoJSON");
                status.add_success(
                    Stage::Conversion,
                    format!("{stem}.geojson written to the working area"),
                );
            }
            Err(e) => {
                warn!("conversion of {} failed: {}", name, e);
                status.set_status(Stage::Conversion, StageStatus::Error);
                status.set_status_text(Stage::Conversion, "Error in converting Geopackage to GeoJSON");
                status.add_error(
                    Stage::Conversion,
                    format!("Error in converting Geopackage to GeoJSON: {e}"),
                );
            }
        }
    }

    /// Stage 7: an Error anywhere in stages 1-6 blocks scoring outright.
    fn finish(&mut self, status: &mut StatusTracker, all_bounds: &[Rect<f64>]) {
        let _step = info_span!("pipeline.performance").entered();
        if status.has_error() {
            status.add_error(
                Stage::Performance,
                "There were errors in previous stages, performance testing was not started.",
            );
            status.set_status(Stage::Performance, StageStatus::Error);
            status.set_status_text(
                Stage::Performance,
                "There were errors in previous stages, performance testing was not started.",
            );
        } else {
            self.scorer
                .score(&self.workspace, all_bounds, status, &mut self.rng);
        }
    }
}

const STAGES_AFTER_INTEGRITY: [(Stage, &str); 5] = [
    (Stage::PackagePresence, "Package selection not started"),
    (Stage::FeatureValidation, "Validation not started"),
    (Stage::Reprojection, "Reprojection not started"),
    (Stage::Simplification, "Simplification not started"),
    (Stage::Conversion, "Conversion not started"),
];

const STAGES_AFTER_PRESENCE: [(Stage, &str); 4] = [
    (Stage::FeatureValidation, "Validation not started"),
    (Stage::Reprojection, "Reprojection not started"),
    (Stage::Simplification, "Simplification not started"),
    (Stage::Conversion, "Conversion not started"),
];

/// Records an explicit Error for every listed stage. The report must spell
/// out why a stage did not run, a missing record is not enough.
fn short_circuit(status: &mut StatusTracker, stages: &[(Stage, &str)]) {
    for (stage, text) in stages {
        status.add_error(*stage, "Not started due to earlier errors.");
        status.set_status(*stage, StageStatus::Error);
        status.set_status_text(*stage, *text);
    }
}

/// Fails stage 3 and cascades stage-specific errors through stages 4-7.
fn fail_validation(status: &mut StatusTracker) {
    status.set_status(Stage::FeatureValidation, StageStatus::Error);
    status.set_status_text(
        Stage::FeatureValidation,
        "Problems with the attribute table or geometries",
    );

    status.set_status(Stage::Reprojection, StageStatus::Error);
    status.set_status_text(
        Stage::Reprojection,
        "There are errors in file attribute table, reprojection not started",
    );
    status.add_error(
        Stage::Reprojection,
        "Check the attribute table for areatype column and correct areatype value.",
    );

    status.set_status(Stage::Simplification, StageStatus::Error);
    status.set_status_text(
        Stage::Simplification,
        "File attribute table does not validate, therefore will not simplify",
    );
    status.add_error(
        Stage::Simplification,
        "Check the attribute table for areatype column and correct areatype value",
    );

    status.set_status(Stage::Conversion, StageStatus::Error);
    status.set_status_text(Stage::Conversion, "Geopackage not converted to GeoJSON.");
    status.add_error(
        Stage::Conversion,
        "File will not be converted to GeoJSON, see earlier errors",
    );

    status.set_status(Stage::Performance, StageStatus::Error);
    status.set_status_text(
        Stage::Performance,
        "Performance testing not started, please upload the correct file",
    );
    status.add_error(
        Stage::Performance,
        "File performance will not be checked, please review earlier errors",
    );
}

/// Converted features as a GeoJSON feature collection, one feature per
/// polygon with its category in the `areatype` property.
fn feature_collection(features: &[EvalFeature]) -> FeatureCollection {
    let features = features
        .iter()
        .map(|feature| {
            let mut properties = JsonObject::new();
            properties.insert(
                CATEGORY_COLUMN.to_string(),
                serde_json::Value::String(feature.category.to_string()),
            );
            Feature {
                bbox: None,
                geometry: Some(geojson::Geometry::new(geojson::Value::from(&feature.polygon))),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();
    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}
