//! Domain module - notices, their records and the rows emitted for them
//!
//! Each module is its own file in the domain/ directory; the public
//! exports are collected here for convenience.

pub mod item;
pub mod records;

pub use item::{ErrorKind, ItemId, ItemRecord, ItemStatus, PageKind, PageUrls};
pub use records::{AttributeEntry, FileEntry, FileHandle, FileRef, FileStatus};
