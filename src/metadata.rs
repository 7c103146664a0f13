//! Metadata codec — the 16-byte file header at offset 0.
//!
//! # On-disk layout (16 bytes, all fields big-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   aggregation      (BE u32) 1=average 2=sum 3=last 4=max 5=min
//!    4      4   max_retention    (BE u32) seconds; must equal the largest
//!                                 archive's spp * points_count
//!    8      4   x_files_factor   (BE f32) in [0.0, 1.0]
//!   12      4   archives_count   (BE u32)
//! ```

use crate::error::{Result, WhisperError};

pub const METADATA_SIZE: usize = 16;

/// The closed, tagged set of aggregation functions. Never exposed as a
/// pluggable callback — every consumer matches on this exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Average = 1,
    Sum = 2,
    Last = 3,
    Max = 4,
    Min = 5,
}

impl Aggregation {
    pub fn from_u32(v: u32) -> Result<Self> {
        match v {
            1 => Ok(Aggregation::Average),
            2 => Ok(Aggregation::Sum),
            3 => Ok(Aggregation::Last),
            4 => Ok(Aggregation::Max),
            5 => Ok(Aggregation::Min),
            other => Err(WhisperError::UnknownAggregation { value: other }),
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Reduce a window of known (non-gap) values to a single aggregate.
    /// `values` must be non-empty — callers check the x-files-factor
    /// threshold before calling this.
    pub fn aggregate(self, values: &[f64]) -> f64 {
        debug_assert!(!values.is_empty());
        match self {
            Aggregation::Average => values.iter().sum::<f64>() / values.len() as f64,
            Aggregation::Sum => values.iter().sum(),
            Aggregation::Last => *values.last().unwrap(),
            Aggregation::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            Aggregation::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metadata {
    pub aggregation: Aggregation,
    pub max_retention: u32,
    pub x_files_factor: f32,
    pub archives_count: u32,
}

/// Parse the metadata block from an exact 16-byte big-endian buffer.
pub fn parse_metadata(buf: &[u8]) -> Result<Metadata> {
    debug_assert_eq!(buf.len(), METADATA_SIZE);
    let aggregation_raw = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let max_retention = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    let x_files_factor = f32::from_be_bytes(buf[8..12].try_into().unwrap());
    let archives_count = u32::from_be_bytes(buf[12..16].try_into().unwrap());
    Ok(Metadata {
        aggregation: Aggregation::from_u32(aggregation_raw)?,
        max_retention,
        x_files_factor,
        archives_count,
    })
}

/// Serialize the metadata block into an exact 16-byte big-endian buffer.
pub fn dump_metadata(m: &Metadata, buf: &mut [u8]) {
    debug_assert_eq!(buf.len(), METADATA_SIZE);
    buf[0..4].copy_from_slice(&m.aggregation.as_u32().to_be_bytes());
    buf[4..8].copy_from_slice(&m.max_retention.to_be_bytes());
    buf[8..12].copy_from_slice(&m.x_files_factor.to_be_bytes());
    buf[12..16].copy_from_slice(&m.archives_count.to_be_bytes());
}
