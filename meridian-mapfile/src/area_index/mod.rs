//! # Spatial grid index
//!
//! Maps a bounding box and a set of object types to the file offsets of
//! matching objects, without loading the objects themselves.
//!
//! Each indexed type gets its own magnification level, chosen during
//! import so that cells are neither mostly empty nor overfull (see
//! [`generator::AreaIndexGenerator`]). The index file layout is:
//!
//! ```text
//! u32    number of indexed types with data
//! per type:
//!   varint  type id
//!   u64     bitmap offset (backpatched)
//!   u8      offset byte width used in the bitmap
//!   varint  magnification level
//!   varint  min x, max x, min y, max y of the covered cell box
//! per type, later in the file:
//!   bitmap  one offset slot per cell, row-major, zero = empty cell
//!   data    per non-empty cell: varint object count,
//!           then delta-encoded varint object offsets
//! ```
//!
//! Bitmap slots store `1 + (cell data position - data section start)` so
//! that zero remains available as the empty-cell sentinel.

mod generator;
mod reader;

pub use generator::{AreaIndexGenerator, GridIndexParameter, TypeData};
pub use reader::AreaIndexReader;

use geo::Rect;
use thiserror::Error;

use crate::{FileOffset, TypeId};

#[derive(Debug, Error)]
pub enum AreaIndexError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("object offsets are not strictly increasing (offset {0} after {1})")]
    UnsortedObjects(FileOffset, FileOffset),
    #[error("index does not cover magnification level {0}")]
    LevelOutOfRange(u32),
}

/// A named object type from the database's type registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    pub id: TypeId,
    pub name: String,
}

impl TypeInfo {
    pub fn new(id: TypeId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// A source of indexable objects.
///
/// The generator never interprets object payloads; it only needs each
/// object's file offset, type, and bounding box. Sources must yield
/// objects in strictly increasing offset order and produce the same
/// sequence on every call (the generator scans multiple times: once per
/// candidate level and once more while writing).
pub trait GridObjectSource {
    /// Invokes `visit` once per object.
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying storage.
    fn scan(
        &mut self,
        visit: &mut dyn FnMut(FileOffset, TypeId, &Rect<f64>),
    ) -> Result<(), AreaIndexError>;
}
