//! Core consistency-checking and rebuilding library, independent of the
//! CLI's argument parsing and progress reporting glue. See the module-level
//! docs on each submodule for its slice of the on-disk format.

pub mod key;
pub mod bitmap;
pub mod objectid;
pub mod hash;
pub mod node;
pub mod item;
pub mod block_io;
pub mod error;
pub mod rollback;
pub mod reporter;
pub mod ctx;
pub mod tree_ops;
pub mod checker;
pub mod semantic;
pub mod stage;
pub mod superblock;
pub mod rebuilder;

pub use block_io::{BlockDevice, BlockIo, FileDevice, MemDevice};
pub use checker::{run_check, CheckMode, CheckReport, Checker};
pub use ctx::{Corruptions, FsckCtx, NO_BLOCK};
pub use error::{CoreError, CoreResult};
pub use rebuilder::{rebuild_tree, RebuildReport};
pub use reporter::{NullReporter, Reporter, TermReporter};
pub use rollback::Rollback;
pub use superblock::Superblock;
