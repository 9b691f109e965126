//! Test harness for isolated pipeline runs.
//!
//! The `TestHarness` struct provides a throwaway workspace with the three
//! pipeline areas plus builders for well-formed (and deliberately broken)
//! GeoPackage fixtures.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use geo::polygon;
use rusqlite::Connection;
use tempfile::TempDir;

use evalconv::geometry::wkb::encode_wkb_polygon;
use evalconv::{Config, EvaluationPipeline};

/// Isolated execution environment for integration tests.
pub struct TestHarness {
    /// Temporary directory containing the source/working/output areas.
    temp_dir: TempDir,
    /// Path to the source area, where upload fixtures are placed.
    pub source_dir: PathBuf,
    /// Path to the working area used for staged GeoJSON and the union cache.
    pub working_dir: PathBuf,
    /// Path to the output area holding union and intersection documents.
    pub output_dir: PathBuf,
}

impl TestHarness {
    /// Creates the harness with an existing source area. The working and
    /// output areas are left for the pipeline to create.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let source_dir = temp_dir.path().join("source");
        let working_dir = temp_dir.path().join("working");
        let output_dir = temp_dir.path().join("output");
        fs::create_dir_all(&source_dir).expect("Failed to create source directory");
        Self {
            temp_dir,
            source_dir,
            working_dir,
            output_dir,
        }
    }

    pub fn config(&self) -> Config {
        Config {
            source_directory: self.source_dir.clone(),
            working_directory: self.working_dir.clone(),
            output_directory: self.output_dir.clone(),
        }
    }

    /// Builds a pipeline over this workspace with a fixed scorer seed.
    pub fn pipeline(&self, seed: u64) -> EvaluationPipeline {
        EvaluationPipeline::with_seed(&self.config(), seed)
    }

    /// Writes a WGS84 polygon package into the source area.
    pub fn write_package(&self, name: &str, features: &[(&str, geo::Polygon<f64>)]) -> PathBuf {
        self.write_package_with(name, 4326, "POLYGON", features)
    }

    /// Writes a polygon package with a caller-chosen SRS and declared
    /// geometry type.
    pub fn write_package_with(
        &self,
        name: &str,
        srs: i32,
        geometry_type: &str,
        features: &[(&str, geo::Polygon<f64>)],
    ) -> PathBuf {
        let rows: Vec<(Option<String>, Vec<u8>)> = features
            .iter()
            .map(|(category, polygon)| (Some(category.to_string()), gpkg_blob(polygon, srs)))
            .collect();
        self.write_package_rows(name, srs, geometry_type, &rows)
    }

    /// Writes a package from raw feature rows, for fixtures the typed
    /// builders cannot express (unknown categories, non-polygon blobs).
    pub fn write_package_rows(
        &self,
        name: &str,
        srs: i32,
        geometry_type: &str,
        rows: &[(Option<String>, Vec<u8>)],
    ) -> PathBuf {
        let path = self.source_dir.join(name);
        write_geopackage(&path, srs, geometry_type, rows);
        path
    }

    /// Drops arbitrary bytes into the source area under the given name.
    pub fn write_raw(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.source_dir.join(name);
        fs::write(&path, bytes).expect("Failed to write fixture file");
        path
    }

    pub fn working_file(&self, name: &str) -> PathBuf {
        self.working_dir.join(name)
    }

    pub fn output_file(&self, name: &str) -> PathBuf {
        self.output_dir.join(name)
    }

    /// Sorted file names currently present in the output area.
    pub fn output_files(&self) -> Vec<String> {
        let mut names: Vec<String> = match fs::read_dir(&self.output_dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }
}

/// Creates a minimal but well-formed GeoPackage: the two `gpkg_*` metadata
/// tables plus one `evaluation` feature table.
pub fn write_geopackage(
    path: &Path,
    srs: i32,
    geometry_type: &str,
    rows: &[(Option<String>, Vec<u8>)],
) {
    let conn = Connection::open(path).expect("Failed to create package");
    conn.execute_batch(
        "CREATE TABLE gpkg_contents (
            table_name TEXT PRIMARY KEY,
            data_type TEXT NOT NULL,
            identifier TEXT
        );
        CREATE TABLE gpkg_geometry_columns (
            table_name TEXT NOT NULL,
            column_name TEXT NOT NULL,
            geometry_type_name TEXT NOT NULL,
            srs_id INTEGER NOT NULL
        );
        CREATE TABLE evaluation (
            fid INTEGER PRIMARY KEY AUTOINCREMENT,
            geom BLOB,
            areatype TEXT
        );",
    )
    .expect("Failed to create package schema");
    conn.execute(
        "INSERT INTO gpkg_contents (table_name, data_type, identifier) \
         VALUES ('evaluation', 'features', 'evaluation')",
        [],
    )
    .expect("Failed to register feature table");
    conn.execute(
        "INSERT INTO gpkg_geometry_columns \
         (table_name, column_name, geometry_type_name, srs_id) \
         VALUES ('evaluation', 'geom', ?1, ?2)",
        rusqlite::params![geometry_type, srs],
    )
    .expect("Failed to register geometry column");
    for (category, blob) in rows {
        conn.execute(
            "INSERT INTO evaluation (geom, areatype) VALUES (?1, ?2)",
            rusqlite::params![blob, category],
        )
        .expect("Failed to insert feature row");
    }
}

/// GeoPackage binary header (no envelope) followed by the WKB body.
pub fn gpkg_blob(polygon: &geo::Polygon<f64>, srs: i32) -> Vec<u8> {
    let mut blob = vec![0x47, 0x50, 0x00, 0x01];
    blob.extend_from_slice(&srs.to_le_bytes());
    blob.extend_from_slice(&encode_wkb_polygon(polygon));
    blob
}

/// Little-endian WKB for a 2D point, wrapped in a GeoPackage header.
pub fn gpkg_point_blob(x: f64, y: f64, srs: i32) -> Vec<u8> {
    let mut blob = vec![0x47, 0x50, 0x00, 0x01];
    blob.extend_from_slice(&srs.to_le_bytes());
    blob.push(0x01);
    blob.extend_from_slice(&1u32.to_le_bytes());
    blob.extend_from_slice(&x.to_le_bytes());
    blob.extend_from_slice(&y.to_le_bytes());
    blob
}

/// Axis-aligned square with the given lower-left corner and edge length.
pub fn square(x: f64, y: f64, size: f64) -> geo::Polygon<f64> {
    polygon![
        (x: x, y: y),
        (x: x + size, y: y),
        (x: x + size, y: y + size),
        (x: x, y: y + size),
        (x: x, y: y),
    ]
}
