// Payload descriptors: what one sample on a channel looks like

use crate::error::{Error, Result};
use std::fmt;

/// Upper bound on a single slot's payload (1 GiB).
pub const MAX_PAYLOAD_SIZE: u64 = 1 << 30;

/// Size of the encoded descriptor record inside the segment header.
pub const DESCRIPTOR_RECORD_SIZE: usize = 64;

/// Kind of message carried by a channel.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Raw = 0,
    Frame = 1,
    Position = 2,
}

impl ElementKind {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(ElementKind::Raw),
            1 => Some(ElementKind::Frame),
            2 => Some(ElementKind::Position),
            _ => None,
        }
    }
}

/// Pixel layout of a frame.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Gray8 = 1,
    Bgr8 = 2,
    Rgb8 = 3,
    Bgra8 = 4,
}

impl PixelFormat {
    pub fn channels(self) -> u32 {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Bgr8 | PixelFormat::Rgb8 => 3,
            PixelFormat::Bgra8 => 4,
        }
    }

    fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(PixelFormat::Gray8),
            2 => Some(PixelFormat::Bgr8),
            3 => Some(PixelFormat::Rgb8),
            4 => Some(PixelFormat::Bgra8),
            _ => None,
        }
    }
}

/// Shape metadata for one payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Shape {
    /// Opaque bytes
    Bytes,
    /// Row-major image; `stride` is bytes per row and may include padding
    Frame {
        rows: u32,
        cols: u32,
        channels: u32,
        stride: u32,
        pixel_format: PixelFormat,
    },
    /// Fixed record with `fields` logical fields
    Position { fields: u32 },
}

/// Fixed description of the payload a channel carries. Immutable for the life of the Sink.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PayloadDescriptor {
    pub kind: ElementKind,
    pub fixed_header_size: u32,
    pub variable_payload_size: u64,
    pub shape: Shape,
}

impl PayloadDescriptor {
    /// Densely packed frame.
    pub fn frame(rows: u32, cols: u32, pixel_format: PixelFormat) -> Result<Self> {
        let stride = cols
            .checked_mul(pixel_format.channels())
            .ok_or_else(|| Error::invalid_descriptor("frame row size overflows"))?;
        Self::frame_with_stride(rows, cols, pixel_format, stride)
    }

    /// Frame whose rows are `stride` bytes apart.
    pub fn frame_with_stride(
        rows: u32,
        cols: u32,
        pixel_format: PixelFormat,
        stride: u32,
    ) -> Result<Self> {
        let desc = Self {
            kind: ElementKind::Frame,
            fixed_header_size: 0,
            variable_payload_size: rows as u64 * stride as u64,
            shape: Shape::Frame {
                rows,
                cols,
                channels: pixel_format.channels(),
                stride,
                pixel_format,
            },
        };
        desc.validate()?;
        Ok(desc)
    }

    /// One encoded position record per sample.
    pub fn position() -> Self {
        Self {
            kind: ElementKind::Position,
            fixed_header_size: super::Position_Structs::POSITION_RECORD_SIZE as u32,
            variable_payload_size: 0,
            shape: Shape::Position {
                fields: super::Position_Structs::POSITION_FIELDS,
            },
        }
    }

    /// Opaque payload of at most `max_size` bytes.
    pub fn bytes(max_size: u64) -> Result<Self> {
        let desc = Self {
            kind: ElementKind::Raw,
            fixed_header_size: 0,
            variable_payload_size: max_size,
            shape: Shape::Bytes,
        };
        desc.validate()?;
        Ok(desc)
    }

    /// Largest payload a slot on this channel can hold.
    pub fn max_payload_size(&self) -> u64 {
        self.fixed_header_size as u64 + self.variable_payload_size
    }

    /// Reject zero-sized, overflowing and self-contradictory shapes.
    pub fn validate(&self) -> Result<()> {
        let total = (self.fixed_header_size as u64)
            .checked_add(self.variable_payload_size)
            .ok_or_else(|| Error::invalid_descriptor("payload size overflows"))?;
        if total == 0 {
            return Err(Error::invalid_descriptor("payload size is zero"));
        }
        if total > MAX_PAYLOAD_SIZE {
            return Err(Error::invalid_descriptor(format!(
                "payload size {} exceeds maximum {}",
                total, MAX_PAYLOAD_SIZE
            )));
        }

        match (self.kind, self.shape) {
            (ElementKind::Raw, Shape::Bytes) => Ok(()),
            (ElementKind::Position, Shape::Position { fields }) => {
                if fields == 0 {
                    return Err(Error::invalid_descriptor("position record has no fields"));
                }
                Ok(())
            }
            (
                ElementKind::Frame,
                Shape::Frame {
                    rows,
                    cols,
                    channels,
                    stride,
                    pixel_format,
                },
            ) => {
                if rows == 0 || cols == 0 {
                    return Err(Error::invalid_descriptor("frame has zero rows or cols"));
                }
                if channels != pixel_format.channels() {
                    return Err(Error::invalid_descriptor(format!(
                        "{:?} has {} channels, shape says {}",
                        pixel_format,
                        pixel_format.channels(),
                        channels
                    )));
                }
                if (stride as u64) < cols as u64 * channels as u64 {
                    return Err(Error::invalid_descriptor("frame stride shorter than a row"));
                }
                if self.variable_payload_size != rows as u64 * stride as u64 {
                    return Err(Error::invalid_descriptor(
                        "frame payload size does not match rows * stride",
                    ));
                }
                Ok(())
            }
            (kind, shape) => Err(Error::invalid_descriptor(format!(
                "shape {:?} does not describe a {:?} payload",
                shape, kind
            ))),
        }
    }

    /// Fixed little-endian record stored in the segment header.
    pub fn encode(&self) -> [u8; DESCRIPTOR_RECORD_SIZE] {
        let mut rec = [0u8; DESCRIPTOR_RECORD_SIZE];
        put_u32(&mut rec, 0, self.kind as u32);
        put_u32(&mut rec, 8, self.fixed_header_size);
        put_u64(&mut rec, 16, self.variable_payload_size);
        match self.shape {
            Shape::Bytes => put_u32(&mut rec, 4, 0),
            Shape::Frame {
                rows,
                cols,
                channels,
                stride,
                pixel_format,
            } => {
                put_u32(&mut rec, 4, 1);
                put_u32(&mut rec, 24, rows);
                put_u32(&mut rec, 28, cols);
                put_u32(&mut rec, 32, channels);
                put_u32(&mut rec, 36, stride);
                put_u32(&mut rec, 40, pixel_format as u32);
            }
            Shape::Position { fields } => {
                put_u32(&mut rec, 4, 2);
                put_u32(&mut rec, 44, fields);
            }
        }
        rec
    }

    pub fn decode(rec: &[u8]) -> Result<Self> {
        if rec.len() < DESCRIPTOR_RECORD_SIZE {
            return Err(Error::invalid_descriptor("descriptor record truncated"));
        }
        let kind = ElementKind::from_u32(get_u32(rec, 0))
            .ok_or_else(|| Error::invalid_descriptor("unknown element kind"))?;
        let shape = match get_u32(rec, 4) {
            0 => Shape::Bytes,
            1 => Shape::Frame {
                rows: get_u32(rec, 24),
                cols: get_u32(rec, 28),
                channels: get_u32(rec, 32),
                stride: get_u32(rec, 36),
                pixel_format: PixelFormat::from_u32(get_u32(rec, 40))
                    .ok_or_else(|| Error::invalid_descriptor("unknown pixel format"))?,
            },
            2 => Shape::Position {
                fields: get_u32(rec, 44),
            },
            other => {
                return Err(Error::invalid_descriptor(format!(
                    "unknown shape tag {}",
                    other
                )))
            }
        };
        let desc = Self {
            kind,
            fixed_header_size: get_u32(rec, 8),
            variable_payload_size: get_u64(rec, 16),
            shape,
        };
        desc.validate()?;
        Ok(desc)
    }
}

impl fmt::Display for PayloadDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shape {
            Shape::Bytes => write!(f, "raw payload of {} bytes", self.max_payload_size()),
            Shape::Frame {
                rows,
                cols,
                pixel_format,
                stride,
                ..
            } => write!(
                f,
                "frame {}x{} {:?} (stride {})",
                cols, rows, pixel_format, stride
            ),
            Shape::Position { fields } => write!(f, "position record ({} fields)", fields),
        }
    }
}

// Bounds are checked by the slice indexing; offsets are compile-time constants above.
fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

/// What a Source is willing to connect to.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DescriptorExpectation {
    #[default]
    Any,
    Kind(ElementKind),
    Exact(PayloadDescriptor),
}

impl DescriptorExpectation {
    pub fn accepts(&self, found: &PayloadDescriptor) -> bool {
        match self {
            DescriptorExpectation::Any => true,
            DescriptorExpectation::Kind(kind) => found.kind == *kind,
            DescriptorExpectation::Exact(desc) => desc == found,
        }
    }
}

impl fmt::Display for DescriptorExpectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptorExpectation::Any => write!(f, "any payload"),
            DescriptorExpectation::Kind(kind) => write!(f, "a {:?} payload", kind),
            DescriptorExpectation::Exact(desc) => write!(f, "{}", desc),
        }
    }
}

/// Producer-side metadata for one publish.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SampleMeta {
    /// Bytes of the slot that carry payload
    pub len: usize,
    /// Capture or generation time, ns since the Unix epoch
    pub timestamp_ns: u64,
}

impl SampleMeta {
    pub fn now(len: usize) -> Self {
        Self {
            len,
            timestamp_ns: crate::Core::process::wall_clock_ns(),
        }
    }

    pub fn with_timestamp(len: usize, timestamp_ns: u64) -> Self {
        Self { len, timestamp_ns }
    }
}
