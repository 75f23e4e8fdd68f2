//! # Meridian routing
//!
//! Minimum-cost routing over a precomputed route-node graph, spanning
//! one or more independently imported region databases.
//!
//! The graph lives in binary files produced at import time
//! (see `meridian-mapfile`); this crate reads them back, resolves start
//! and target coordinates to graph nodes through the grid index, runs a
//! profile-parameterized A* search, and shapes the result into a
//! turn-by-turn route description.
//!
//! Databases are independent: node ids may collide across regions, so
//! every graph-level identity is qualified with a [`DatabaseId`]. Nodes
//! present in more than one database ("twins", common along region
//! borders) are transfer points the search crosses at no cost.

pub mod description;
pub mod node;
pub mod profile;
pub mod service;
pub mod way;

use meridian_mapfile::area_index::AreaIndexError;
use meridian_mapfile::{FileOffset, ObjectId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    AreaIndex(#[from] AreaIndexError),
    #[error("route node {0} is referenced but not stored")]
    MissingNode(DBId),
    #[error("unknown database {0}")]
    UnknownDatabase(DatabaseId),
    #[error("way {0} has no node in the routing graph")]
    NoRoutableNode(DBFileOffset),
    #[error("lock poisoned: {0}")]
    PoisonedLock(String),
}

/// Identifies one region database within a multi-database router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatabaseId(pub u32);

impl std::fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A route node id qualified with its database.
///
/// Node ids are only unique within one database; all routing state is
/// keyed by this composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DBId {
    pub database: DatabaseId,
    pub id: ObjectId,
}

impl DBId {
    pub const fn new(database: DatabaseId, id: ObjectId) -> Self {
        Self { database, id }
    }
}

impl std::fmt::Display for DBId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.database, self.id)
    }
}

/// A file offset qualified with its database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DBFileOffset {
    pub database: DatabaseId,
    pub offset: FileOffset,
}

impl DBFileOffset {
    pub const fn new(database: DatabaseId, offset: FileOffset) -> Self {
        Self { database, offset }
    }
}

impl std::fmt::Display for DBFileOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.database, self.offset)
    }
}
