use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

#[derive(Error, Debug)]
pub enum PackageError {
    #[error("Failed to open package '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Package query failed: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("Package '{0}' has no feature table registered in gpkg_contents")]
    NoFeatureTable(PathBuf),

    #[error("Feature table '{table}' is missing from gpkg_geometry_columns")]
    NoGeometryColumn { table: String },

    #[error("Layer name '{0}' is not a plain identifier")]
    BadIdentifier(String),

    #[error("Invalid geometry blob on feature {fid}: {source}")]
    Geometry {
        fid: i64,
        #[source]
        source: crate::geometry::wkb::WkbError,
    },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove '{path}': {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Directory scan failed for '{path}': {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("Failed to serialize '{path}': {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to parse '{path}' as GeoJSON: {source}")]
    ParseGeoJson {
        path: PathBuf,
        #[source]
        source: Box<geojson::Error>,
    },
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create cache directory '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum GeometryError {
    #[error("Unsupported spatial reference system {0}")]
    UnsupportedSrs(i64),

    #[error("Coordinate ({x}, {y}) is out of range for spatial reference {srs}")]
    CoordinateOutOfRange { srs: i64, x: f64, y: f64 },
}
