//! caseio Storage - Locating and moving case objects
//!
//! This crate provides:
//! - Path resolution over undecomposed, per-rank and grouped layouts
//! - A per-rank directory listing cache and time-instant index
//! - Stored object framing and the block container codec
//! - Object store strategies built on the collectives in `caseio-comm`

pub mod container;
pub mod dir_cache;
pub mod object;
pub mod processor;
pub mod resolver;
pub mod store;
pub mod time_index;

pub use container::{BlockCodec, BlockContainer, ContainerHeader};
pub use dir_cache::{CachedDirectoryListing, DirectoryCache, DirectoryCacheStats};
pub use object::{CONTAINER_CLASS, ObjectHeader, StoredObject};
pub use processor::{
    ProcessorPath, detect_case_rank, detect_processor_path, parse_group_dir, split_case_path,
    split_processor_path,
};
pub use resolver::{EntryKind, ObjectListing, PathResolver, ResolveOptions};
pub use store::{CaseStore, ReadStage, open_store};
pub use time_index::TimeIndex;
