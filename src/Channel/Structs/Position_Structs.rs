// Position records carried by Position channels
// Fixed 96-byte little-endian encoding, so every slot holds exactly one record

use crate::error::{Error, Result};
use serde::Serialize;

pub const POSITION_RECORD_SIZE: usize = 96;

/// Logical fields: label, unit, position, velocity, heading, region.
pub const POSITION_FIELDS: u32 = 6;

const LABEL_LEN: usize = 16;

const FLAG_POSITION: u32 = 1 << 0;
const FLAG_VELOCITY: u32 = 1 << 1;
const FLAG_HEADING: u32 = 1 << 2;
const FLAG_REGION: u32 = 1 << 3;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitOfLength {
    #[default]
    Pixels,
    Worldunits,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
pub struct Point2D {
    pub x: f64,
    pub y: f64,
}

impl Point2D {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// One 2-D position sample.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Position2D {
    pub label: String,
    pub unit: UnitOfLength,
    pub position: Option<Point2D>,
    pub velocity: Option<Point2D>,
    pub heading: Option<Point2D>,
    pub region: Option<String>,
}

impl Position2D {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_owned(),
            ..Default::default()
        }
    }

    /// Encode into `buf`, which must hold at least `POSITION_RECORD_SIZE` bytes.
    /// Labels longer than 15 bytes are truncated.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize> {
        let rec = buf
            .get_mut(..POSITION_RECORD_SIZE)
            .ok_or_else(|| Error::invalid_descriptor("buffer too small for a position record"))?;
        rec.fill(0);

        put_label(&mut rec[0..LABEL_LEN], &self.label);
        let unit = match self.unit {
            UnitOfLength::Pixels => 0u32,
            UnitOfLength::Worldunits => 1u32,
        };
        rec[16..20].copy_from_slice(&unit.to_le_bytes());

        let mut flags = 0u32;
        for (flag, point, off) in [
            (FLAG_POSITION, self.position, 24),
            (FLAG_VELOCITY, self.velocity, 40),
            (FLAG_HEADING, self.heading, 56),
        ] {
            if let Some(p) = point {
                flags |= flag;
                rec[off..off + 8].copy_from_slice(&p.x.to_le_bytes());
                rec[off + 8..off + 16].copy_from_slice(&p.y.to_le_bytes());
            }
        }
        if let Some(region) = &self.region {
            flags |= FLAG_REGION;
            put_label(&mut rec[72..72 + LABEL_LEN], region);
        }
        rec[20..24].copy_from_slice(&flags.to_le_bytes());

        Ok(POSITION_RECORD_SIZE)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let rec = buf
            .get(..POSITION_RECORD_SIZE)
            .ok_or_else(|| Error::invalid_descriptor("position record truncated"))?;

        let unit = match u32_at(rec, 16) {
            0 => UnitOfLength::Pixels,
            1 => UnitOfLength::Worldunits,
            other => {
                return Err(Error::invalid_descriptor(format!(
                    "unknown unit of length {}",
                    other
                )))
            }
        };
        let flags = u32_at(rec, 20);
        let point = |flag: u32, off: usize| {
            (flags & flag != 0).then(|| Point2D::new(f64_at(rec, off), f64_at(rec, off + 8)))
        };

        Ok(Self {
            label: get_label(&rec[0..LABEL_LEN]),
            unit,
            position: point(FLAG_POSITION, 24),
            velocity: point(FLAG_VELOCITY, 40),
            heading: point(FLAG_HEADING, 56),
            region: (flags & FLAG_REGION != 0).then(|| get_label(&rec[72..72 + LABEL_LEN])),
        })
    }
}

fn put_label(dst: &mut [u8], label: &str) {
    // Keep one NUL terminator and never split a UTF-8 sequence
    let mut end = label.len().min(dst.len() - 1);
    while !label.is_char_boundary(end) {
        end -= 1;
    }
    dst[..end].copy_from_slice(&label.as_bytes()[..end]);
}

fn get_label(src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}

fn u32_at(rec: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&rec[off..off + 4]);
    u32::from_le_bytes(b)
}

fn f64_at(rec: &[u8], off: usize) -> f64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&rec[off..off + 8]);
    f64::from_le_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_record_survives_encoding() {
        let pos = Position2D {
            label: "rpos".into(),
            unit: UnitOfLength::Worldunits,
            position: Some(Point2D::new(12.5, -3.0)),
            velocity: None,
            heading: Some(Point2D::new(0.0, 1.0)),
            region: Some("north".into()),
        };
        let mut buf = [0u8; POSITION_RECORD_SIZE];
        assert_eq!(pos.encode_into(&mut buf).unwrap(), POSITION_RECORD_SIZE);
        assert_eq!(Position2D::decode(&buf).unwrap(), pos);
    }

    #[test]
    fn long_labels_are_truncated_on_char_boundary() {
        let pos = Position2D::new("ééééééééééé");
        let mut buf = [0u8; POSITION_RECORD_SIZE];
        pos.encode_into(&mut buf).unwrap();
        let back = Position2D::decode(&buf).unwrap();
        assert_eq!(back.label, "ééééééé");
    }

    #[test]
    fn short_buffers_are_rejected() {
        let mut buf = [0u8; 10];
        assert!(Position2D::new("x").encode_into(&mut buf).is_err());
        assert!(Position2D::decode(&buf).is_err());
    }
}
