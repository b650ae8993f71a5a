#![allow(clippy::cast_possible_truncation)]
//! A log-structured write-deferral engine for multidimensional array I/O.
//!
//! Instead of writing every selection to its final place in a dense dataset, a [`LogFile`]
//! stages the payload and, at flush time, appends the payloads of every rank to one shared log
//! segment with a single collective write. A compact [`MetadataEntry`] per write records where
//! the bytes logically belong. Reads consult the persisted [`MetadataIndex`], gather the
//! intersecting fragments from every log segment with a single collective read, and assemble
//! the requested region, later writes winning over earlier ones.
//!
//! All operations on a [`LogFile`] that touch storage are collective: every rank of the
//! communicator must issue them in the same order.

mod file;
pub mod metadata;
mod options;
mod ptype;
mod reader;
mod registry;
mod request;
pub mod selection;
mod staging;
#[cfg(test)]
mod tests;
mod writer;

pub use file::*;
pub use forever_constant::*;
pub use metadata::{IndexCursor, MetadataEntry, MetadataIndex, PartialIndex};
pub use options::*;
pub use ptype::*;
pub use registry::*;
pub use request::ReadTicket;
pub use selection::{Block, Selection};
pub use staging::*;

/// The current version of the metadata blob layout.
pub const METADATA_VERSION: u16 = 1;

/// Identifies a dataset of a log file. Ids are dense and assigned in definition order.
pub type DatasetId = u32;

/// Constants that will never change (i.e., doing so would break backwards compatibility)
mod forever_constant {
    /// The maximum dimensionality of a dataset or selection.
    pub const MAX_DIMS: usize = 8;

    /// Prefix of every blob the engine creates in the underlying container.
    pub const LOG_GROUP: &str = "__logvol/";

    /// The magic bytes opening every metadata blob.
    pub const METADATA_MAGIC: [u8; 4] = *b"LVMD";
    /// The size of a metadata blob header in bytes.
    pub const METADATA_HEADER_SIZE: usize = 16;
    /// The size of one serialized metadata entry in bytes.
    pub const METADATA_ENTRY_SIZE: usize = 160;

    /// Attribute holding `[ndset, nldset, nmdset, config_flags, ngroup]`.
    pub const SUMMARY_ATTR: &str = "__logvol_summary";
    /// Prefix of the per-dataset attribute holding `[ptype, ndim, dims...]`.
    pub const DATASET_ATTR_PREFIX: &str = "__logvol_dataset.";
    /// Prefix of the per-name attribute holding `[id]`.
    pub const NAME_ATTR_PREFIX: &str = "__logvol_name.";

    #[cfg(test)]
    mod test {
        use super::*;

        #[test]
        fn never_change_these_constants() {
            assert_eq!(MAX_DIMS, 8);
            assert_eq!(LOG_GROUP, "__logvol/");
            assert_eq!(METADATA_MAGIC, *b"LVMD");
            assert_eq!(METADATA_HEADER_SIZE, 16);
            assert_eq!(METADATA_ENTRY_SIZE, 160);
            assert_eq!(SUMMARY_ATTR, "__logvol_summary");
        }
    }
}

static_assertions::const_assert_eq!(
    METADATA_ENTRY_SIZE,
    4 + 4 + 8 * MAX_DIMS + 8 * MAX_DIMS + 4 + 4 + 8 + 8
);

/// Name of the log segment written by flush generation `seq`.
pub fn log_segment_name(seq: u64) -> String {
    format!("{LOG_GROUP}log.{seq}")
}

/// Name of the metadata blob written by metadata generation `seq`.
pub fn metadata_blob_name(seq: u64) -> String {
    format!("{LOG_GROUP}meta.{seq}")
}
