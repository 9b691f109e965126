//! Filesystem layout of the converter: the source, working and output areas.

use std::fs;
use std::path::{Path, PathBuf};

use geojson::{FeatureCollection, GeoJson};
use serde::Serialize;
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::StorageError;

/// Files with this name survive [`Workspace::clean`].
const KEEP_FILE: &str = "README";

/// Display name of a path: its final component, or the whole path if it has
/// none.
pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Name of the union cache database inside the working area.
const CACHE_FILE: &str = "unions.db";

/// Resolved directory layout the pipeline operates on.
#[derive(Debug, Clone)]
pub struct Workspace {
    source_dir: PathBuf,
    working_dir: PathBuf,
    output_dir: PathBuf,
}

impl Workspace {
    pub fn new(source_dir: &Path, working_dir: &Path, output_dir: &Path) -> Self {
        Self {
            source_dir: source_dir.to_path_buf(),
            working_dir: working_dir.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.source_directory,
            &config.working_directory,
            &config.output_directory,
        )
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Creates the working and output areas if they do not exist yet.
    ///
    /// The source area is not created here; it is owned by the upload side.
    pub fn ensure_areas(&self) -> Result<(), StorageError> {
        for dir in [&self.working_dir, &self.output_dir] {
            fs::create_dir_all(dir).map_err(|e| StorageError::CreateDirectory {
                path: dir.clone(),
                source: e,
            })?;
        }
        log::debug!(
            "workspace ready: working={} output={}",
            self.working_dir.display(),
            self.output_dir.display()
        );
        Ok(())
    }

    /// Lists the evaluation packages waiting in the source area.
    pub fn scan_packages(&self) -> Result<Vec<PathBuf>, StorageError> {
        self.scan(&self.source_dir, "gpkg")
    }

    /// Lists the converted evaluation files in the working area.
    pub fn scan_evaluations(&self) -> Result<Vec<PathBuf>, StorageError> {
        self.scan(&self.working_dir, "geojson")
    }

    fn scan(&self, dir: &Path, extension: &str) -> Result<Vec<PathBuf>, StorageError> {
        let mut files = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| StorageError::Scan {
                path: dir.to_path_buf(),
                source: e,
            })?;
            let path = entry.path();
            if !entry.file_type().is_file() {
                continue;
            }
            if path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
            {
                files.push(path.to_path_buf());
            }
        }
        files.sort();
        log::debug!("found {} .{} file(s) in {}", files.len(), extension, dir.display());
        Ok(files)
    }

    /// Path of the union cache database.
    pub fn cache_path(&self) -> PathBuf {
        self.working_dir.join(CACHE_FILE)
    }

    pub fn working_path(&self, name: &str) -> PathBuf {
        self.working_dir.join(name)
    }

    pub fn output_path(&self, name: &str) -> PathBuf {
        self.output_dir.join(name)
    }

    /// Serializes a value as JSON into the given file.
    pub fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StorageError> {
        let content = serde_json::to_string(value).map_err(|e| StorageError::Serialize {
            path: path.to_path_buf(),
            source: e,
        })?;
        fs::write(path, content).map_err(|e| StorageError::WriteFile {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Reads a GeoJSON file back as a feature collection.
    pub fn read_geojson(&self, path: &Path) -> Result<FeatureCollection, StorageError> {
        let content = fs::read_to_string(path).map_err(|e| StorageError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        let geojson: GeoJson = content.parse().map_err(|e| StorageError::ParseGeoJson {
            path: path.to_path_buf(),
            source: Box::new(e),
        })?;
        match geojson {
            GeoJson::FeatureCollection(collection) => Ok(collection),
            GeoJson::Feature(feature) => Ok(FeatureCollection {
                bbox: None,
                features: vec![feature],
                foreign_members: None,
            }),
            GeoJson::Geometry(_) => Err(StorageError::ParseGeoJson {
                path: path.to_path_buf(),
                source: Box::new(geojson::Error::ExpectedType {
                    expected: "FeatureCollection".to_string(),
                    actual: "Geometry".to_string(),
                }),
            }),
        }
    }

    /// Empties all three areas, keeping the directories themselves and any
    /// README sentinel files.
    pub fn clean(&self) -> Result<(), StorageError> {
        for dir in [&self.source_dir, &self.working_dir, &self.output_dir] {
            if !dir.is_dir() {
                continue;
            }
            for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
                let entry = entry.map_err(|e| StorageError::Scan {
                    path: dir.to_path_buf(),
                    source: e,
                })?;
                let path = entry.path();
                if entry.file_type().is_dir() {
                    fs::remove_dir_all(path).map_err(|e| StorageError::Remove {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                } else if path.file_name().is_some_and(|n| n != KEEP_FILE) {
                    fs::remove_file(path).map_err(|e| StorageError::Remove {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                }
            }
            log::info!("cleaned {}", dir.display());
        }
        Ok(())
    }
}
