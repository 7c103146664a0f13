//! # whisperdb — fixed-format, ring-buffered time-series file library
//!
//! Format guarantees:
//! - Every numeric field on disk is big-endian; never negotiated
//! - A file is three flat regions with no padding: metadata (16 B), archive
//!   table (12 B per archive), then each archive's body in declared order
//! - Archives are ordered by strictly ascending resolution; each coarser
//!   archive's interval is an integer multiple of the next finer one
//! - A point slot with a zero timestamp is logically empty
//! - `aggregation` is a closed, five-member enum; an unrecognized value
//!   fails `open`/`create` rather than being silently accepted
//! - The mapped and streamed backends are interchangeable at every public
//!   operation — a read through either must return identical bytes

pub mod archive;
pub mod backend;
pub mod error;
pub mod handle;
pub mod metadata;
pub mod point;
pub mod time;

// Flat re-exports for the most common types.
pub use archive::{ArchiveDescriptor, ArchiveSpec};
pub use backend::{Backend, ReadBuf};
pub use error::{Result, WhisperError};
pub use handle::{Mapping, WhisperHandle};
pub use metadata::{Aggregation, Metadata};
pub use point::Point;
