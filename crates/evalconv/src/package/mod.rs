//! Reading uploaded evaluation packages.
//!
//! An evaluation package is a GeoPackage: a SQLite container whose
//! `gpkg_contents` table names the feature tables it carries. We read it
//! directly over rusqlite instead of going through a GIS stack, since all the
//! converter needs is the first feature table, its geometry column and the
//! `areatype` attribute.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags, OptionalExtension};

use crate::category::Category;
use crate::error::PackageError;
use crate::geometry::wkb::{decode_gpkg, DecodedGeometry};

/// Attribute column carrying the category value of a feature.
pub const CATEGORY_COLUMN: &str = "areatype";

/// Layout of the feature table inside a package.
#[derive(Debug, Clone)]
pub struct PackageSchema {
    /// Name of the first feature table listed in `gpkg_contents`.
    pub table: String,
    /// Name of the geometry column of that table.
    pub geometry_column: String,
    /// Declared geometry type, e.g. `POLYGON`.
    pub geometry_type: String,
    /// Spatial reference system the geometries are stored in.
    pub srs_id: i64,
    /// Whether the table carries an `areatype` column.
    pub has_category_column: bool,
}

/// A feature as stored in the package, before validation.
#[derive(Debug, Clone)]
pub struct RawFeature {
    pub fid: i64,
    pub category: Option<String>,
    pub geometry: DecodedGeometry,
}

/// A validated feature: recognized category, polygonal geometry.
#[derive(Debug, Clone)]
pub struct EvalFeature {
    pub category: Category,
    pub polygon: geo::Polygon<f64>,
}

/// Quick integrity probe: is this file a readable GeoPackage container?
///
/// Checks that the file is non-empty, opens as SQLite and carries the
/// `gpkg_contents` table. Used by the first pipeline stage, which must not
/// fail hard on arbitrary uploaded bytes.
pub fn is_package_container(path: &Path) -> bool {
    let readable = match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.len() > 0,
        Err(_) => false,
    };
    if !readable {
        log::debug!("{} is not a readable file", path.display());
        return false;
    }

    let probe = || -> Result<bool, rusqlite::Error> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        let tables: u32 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'gpkg_contents'",
            [],
            |row| row.get(0),
        )?;
        Ok(tables > 0)
    };
    match probe() {
        Ok(true) => true,
        Ok(false) => {
            log::debug!("{} has no gpkg_contents table", path.display());
            false
        }
        Err(e) => {
            log::debug!("{} is not a SQLite container: {}", path.display(), e);
            false
        }
    }
}

/// Read-only access to one evaluation package.
pub struct GeopackageReader {
    conn: Connection,
    path: PathBuf,
}

impl GeopackageReader {
    pub fn open(path: &Path) -> Result<Self, PackageError> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY).map_err(
            |e| PackageError::Open {
                path: path.to_path_buf(),
                source: e,
            },
        )?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolves the feature table layout from the package metadata tables.
    pub fn schema(&self) -> Result<PackageSchema, PackageError> {
        let table: Option<String> = self
            .conn
            .query_row(
                "SELECT table_name FROM gpkg_contents \
                 WHERE data_type = 'features' ORDER BY table_name LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let table = table.ok_or_else(|| PackageError::NoFeatureTable(self.path.clone()))?;

        let geometry: Option<(String, String, i64)> = self
            .conn
            .query_row(
                "SELECT column_name, geometry_type_name, srs_id \
                 FROM gpkg_geometry_columns WHERE table_name = ?1",
                [&table],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let (geometry_column, geometry_type, srs_id) =
            geometry.ok_or_else(|| PackageError::NoGeometryColumn {
                table: table.clone(),
            })?;

        let has_category_column = self.column_exists(&table, CATEGORY_COLUMN)?;
        log::debug!(
            "package {}: table={} geometry={} type={} srs={} areatype={}",
            self.path.display(),
            table,
            geometry_column,
            geometry_type,
            srs_id,
            has_category_column
        );

        Ok(PackageSchema {
            table,
            geometry_column,
            geometry_type,
            srs_id,
            has_category_column,
        })
    }

    /// Checks whether a column exists on a table using `PRAGMA table_info`.
    fn column_exists(&self, table: &str, column: &str) -> Result<bool, PackageError> {
        valid_identifier(table)?;
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", table))?;
        let exists = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .any(|r| r.map(|name| name.eq_ignore_ascii_case(column)).unwrap_or(false));
        Ok(exists)
    }

    /// Reads every feature of the table described by `schema`.
    pub fn read_features(&self, schema: &PackageSchema) -> Result<Vec<RawFeature>, PackageError> {
        valid_identifier(&schema.table)?;
        valid_identifier(&schema.geometry_column)?;

        let category_select = if schema.has_category_column {
            CATEGORY_COLUMN.to_string()
        } else {
            "NULL".to_string()
        };
        let sql = format!(
            "SELECT rowid, {}, {} FROM {}",
            schema.geometry_column, category_select, schema.table
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            let fid: i64 = row.get(0)?;
            let blob: Option<Vec<u8>> = row.get(1)?;
            let category: Option<String> = row.get(2)?;
            Ok((fid, blob, category))
        })?;

        let mut features = Vec::new();
        for row in rows {
            let (fid, blob, category) = row?;
            let geometry = match blob {
                Some(bytes) => {
                    decode_gpkg(&bytes).map_err(|e| PackageError::Geometry { fid, source: e })?
                }
                None => DecodedGeometry::Empty,
            };
            features.push(RawFeature {
                fid,
                category,
                geometry,
            });
        }
        log::debug!(
            "read {} feature(s) from {}",
            features.len(),
            self.path.display()
        );
        Ok(features)
    }
}

/// Table and column names are spliced into SQL directly; only plain
/// identifiers are allowed through.
fn valid_identifier(name: &str) -> Result<(), PackageError> {
    let ok = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if ok {
        Ok(())
    } else {
        Err(PackageError::BadIdentifier(name.to_string()))
    }
}

/// First validation gate: the package must declare polygon geometry and every
/// decoded feature must actually be a flat polygon or multipolygon.
pub fn validate_geometry(schema: &PackageSchema, features: &[RawFeature]) -> bool {
    if !schema.geometry_type.eq_ignore_ascii_case("POLYGON") {
        log::warn!(
            "feature table {} declares geometry type {}",
            schema.table,
            schema.geometry_type
        );
        return false;
    }
    let mut valid = true;
    for feature in features {
        if !feature.geometry.is_polygonal() {
            log::warn!(
                "feature {} has non-polygonal geometry: {}",
                feature.fid,
                feature.geometry.type_name()
            );
            valid = false;
        }
    }
    valid
}

/// Second validation gate: every feature must carry a recognized category.
pub fn validate_categories(features: &[RawFeature]) -> bool {
    let mut valid = true;
    for feature in features {
        let recognized = feature
            .category
            .as_deref()
            .and_then(Category::parse)
            .is_some();
        if !recognized {
            log::warn!(
                "feature {} has unrecognized {} value {:?}",
                feature.fid,
                CATEGORY_COLUMN,
                feature.category
            );
            valid = false;
        }
    }
    valid
}
