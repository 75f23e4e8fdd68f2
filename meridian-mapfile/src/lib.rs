//! # Meridian map files
//!
//! Core building blocks for offline map databases:
//! tile arithmetic over magnification levels,
//! compact binary index files (varint + delta encoded),
//! a generic spatial grid index for bounding-box queries,
//! and the water/coastline classification engine.
//!
//! The import side of this crate produces files that the query side
//! (and the `meridian-router` crate) read back byte-for-byte.

pub mod area_index;
pub mod import;
mod io;
pub mod progress;
mod tile;
pub mod water;

pub use io::{FileScanner, FileWriter, bytes_needed, varint_len};
pub use tile::{MagnificationLevel, TileId, TileIdBox};

/// A position within a data file.
///
/// Offsets are stored with the minimal number of bytes required
/// in most file formats; see [`FileWriter::write_offset_sized`].
pub type FileOffset = u64;

/// Identifier of an object type from the type registry of a database.
pub type TypeId = u32;

/// Identifier of an imported object (way, area or node) within a database.
pub type ObjectId = u64;
