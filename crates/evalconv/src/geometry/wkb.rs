//! GeoPackage geometry blob codec.
//!
//! A GeoPackage feature geometry is a small binary header (magic `GP`,
//! version, flags, spatial reference id, optional envelope) followed by a
//! standard WKB body. The converter only admits polygonal features, so this
//! codec decodes Polygon and MultiPolygon bodies and reports every other
//! type by name; Z/M variants come back as unsupported instead of being
//! silently flattened. The encoder writes plain little-endian WKB and is
//! used for cache values.

use geo::{Coord, LineString, MultiPolygon, Polygon};
use thiserror::Error;

const GPKG_MAGIC: [u8; 2] = [0x47, 0x50];
const GPKG_HEADER_LEN: usize = 8;

const WKB_POLYGON: u32 = 3;
const WKB_MULTIPOLYGON: u32 = 6;

#[derive(Error, Debug)]
pub enum WkbError {
    #[error("Geometry blob truncated at byte {0}")]
    Truncated(usize),

    #[error("Not a GeoPackage geometry blob (bad magic)")]
    BadMagic,

    #[error("Unsupported envelope indicator {0}")]
    BadEnvelope(u8),

    #[error("Invalid byte order marker {0}")]
    BadByteOrder(u8),
}

/// A decoded feature geometry.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedGeometry {
    Polygon(Polygon<f64>),
    MultiPolygon(MultiPolygon<f64>),
    /// Flagged empty in the GeoPackage header.
    Empty,
    /// A well-formed geometry the pipeline does not admit; carries the WKB
    /// type name for validation messages.
    Unsupported(String),
}

impl DecodedGeometry {
    pub fn is_polygonal(&self) -> bool {
        matches!(self, DecodedGeometry::Polygon(_) | DecodedGeometry::MultiPolygon(_))
    }

    pub fn type_name(&self) -> &str {
        match self {
            DecodedGeometry::Polygon(_) => "Polygon",
            DecodedGeometry::MultiPolygon(_) => "MultiPolygon",
            DecodedGeometry::Empty => "empty",
            DecodedGeometry::Unsupported(name) => name,
        }
    }
}

/// Decodes one GeoPackage geometry blob (header plus WKB body).
pub fn decode_gpkg(blob: &[u8]) -> Result<DecodedGeometry, WkbError> {
    if blob.len() < GPKG_HEADER_LEN {
        return Err(WkbError::Truncated(blob.len()));
    }
    if blob[0..2] != GPKG_MAGIC {
        return Err(WkbError::BadMagic);
    }

    let flags = blob[3];
    let envelope_len = match (flags >> 1) & 0x07 {
        0 => 0,
        1 => 32,
        2 | 3 => 48,
        4 => 64,
        other => return Err(WkbError::BadEnvelope(other)),
    };
    if flags & 0x10 != 0 {
        return Ok(DecodedGeometry::Empty);
    }

    let body_start = GPKG_HEADER_LEN + envelope_len;
    if blob.len() <= body_start {
        return Err(WkbError::Truncated(blob.len()));
    }
    decode_wkb(&blob[body_start..])
}

/// Decodes a bare WKB geometry.
pub fn decode_wkb(buf: &[u8]) -> Result<DecodedGeometry, WkbError> {
    let mut reader = Reader::new(buf);
    reader.set_byte_order()?;
    let type_code = reader.read_u32()?;
    match type_code {
        WKB_POLYGON => Ok(DecodedGeometry::Polygon(read_polygon(&mut reader)?)),
        WKB_MULTIPOLYGON => {
            // Counts come from the blob; allocation must track actual bytes.
            let count = reader.read_u32()? as usize;
            let mut polygons = Vec::new();
            for _ in 0..count {
                reader.set_byte_order()?;
                let inner_type = reader.read_u32()?;
                if inner_type != WKB_POLYGON {
                    return Ok(DecodedGeometry::Unsupported(type_name(inner_type)));
                }
                polygons.push(read_polygon(&mut reader)?);
            }
            Ok(DecodedGeometry::MultiPolygon(MultiPolygon(polygons)))
        }
        other => Ok(DecodedGeometry::Unsupported(type_name(other))),
    }
}

/// Encodes a polygon as little-endian WKB.
pub fn encode_wkb_polygon(polygon: &Polygon<f64>) -> Vec<u8> {
    let mut out = Vec::new();
    write_polygon(&mut out, polygon);
    out
}

/// Encodes a multipolygon as little-endian WKB.
pub fn encode_wkb_multipolygon(multipolygon: &MultiPolygon<f64>) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(1);
    out.extend_from_slice(&WKB_MULTIPOLYGON.to_le_bytes());
    out.extend_from_slice(&(multipolygon.0.len() as u32).to_le_bytes());
    for polygon in &multipolygon.0 {
        write_polygon(&mut out, polygon);
    }
    out
}

fn write_polygon(out: &mut Vec<u8>, polygon: &Polygon<f64>) {
    out.push(1);
    out.extend_from_slice(&WKB_POLYGON.to_le_bytes());
    let ring_count = 1 + polygon.interiors().len() as u32;
    out.extend_from_slice(&ring_count.to_le_bytes());
    write_ring(out, polygon.exterior());
    for interior in polygon.interiors() {
        write_ring(out, interior);
    }
}

fn write_ring(out: &mut Vec<u8>, ring: &LineString<f64>) {
    out.extend_from_slice(&(ring.0.len() as u32).to_le_bytes());
    for coord in &ring.0 {
        out.extend_from_slice(&coord.x.to_le_bytes());
        out.extend_from_slice(&coord.y.to_le_bytes());
    }
}

fn read_polygon(reader: &mut Reader<'_>) -> Result<Polygon<f64>, WkbError> {
    let ring_count = reader.read_u32()? as usize;
    let mut rings = Vec::new();
    for _ in 0..ring_count {
        let point_count = reader.read_u32()? as usize;
        let mut coords = Vec::new();
        for _ in 0..point_count {
            let x = reader.read_f64()?;
            let y = reader.read_f64()?;
            coords.push(Coord { x, y });
        }
        rings.push(LineString::from(coords));
    }
    let mut rings = rings.into_iter();
    let exterior = rings.next().unwrap_or_else(|| LineString::new(Vec::new()));
    Ok(Polygon::new(exterior, rings.collect()))
}

fn type_name(code: u32) -> String {
    let ewkb_z = code & 0x8000_0000 != 0;
    let ewkb_m = code & 0x4000_0000 != 0;
    let base_code = code & 0x0FFF_FFFF;
    let iso_dim = base_code / 1000;
    let base = match base_code % 1000 {
        1 => "Point",
        2 => "LineString",
        3 => "Polygon",
        4 => "MultiPoint",
        5 => "MultiLineString",
        6 => "MultiPolygon",
        7 => "GeometryCollection",
        _ => return format!("unknown type {code}"),
    };
    let suffix = match (iso_dim, ewkb_z, ewkb_m) {
        (1, _, _) | (_, true, false) => " Z",
        (2, _, _) | (_, false, true) => " M",
        (3, _, _) | (_, true, true) => " ZM",
        _ => "",
    };
    format!("{base}{suffix}")
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    little: bool,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            little: true,
        }
    }

    /// Reads a WKB byte-order marker and switches the reader to it.
    fn set_byte_order(&mut self) -> Result<(), WkbError> {
        match self.read_u8()? {
            0 => self.little = false,
            1 => self.little = true,
            other => return Err(WkbError::BadByteOrder(other)),
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, WkbError> {
        let byte = *self.buf.get(self.pos).ok_or(WkbError::Truncated(self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_u32(&mut self) -> Result<u32, WkbError> {
        let bytes: [u8; 4] = self.take()?;
        Ok(if self.little {
            u32::from_le_bytes(bytes)
        } else {
            u32::from_be_bytes(bytes)
        })
    }

    fn read_f64(&mut self) -> Result<f64, WkbError> {
        let bytes: [u8; 8] = self.take()?;
        Ok(if self.little {
            f64::from_le_bytes(bytes)
        } else {
            f64::from_be_bytes(bytes)
        })
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], WkbError> {
        let end = self.pos + N;
        if end > self.buf.len() {
            return Err(WkbError::Truncated(self.pos));
        }
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(bytes)
    }
}
