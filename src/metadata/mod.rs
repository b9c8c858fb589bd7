//! メタデータ層: レコード定義、マージオペランド、ストア、識別子アロケータ

pub mod merge;
pub mod store;
pub mod types;
pub mod uid;

pub use merge::{MergeOperand, MetadataMergeOperator, OperandError};
pub use store::{DirEntry, MetadataError, MetadataResult, MetadataStore};
pub use types::{FileKind, Metadata, MetadataFormatError, METADATA_SEPARATOR};
pub use uid::{UidAllocator, UidError, UidResult};
