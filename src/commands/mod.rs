//! One file per subcommand, following the teacher's
//! `src/commands/fsck.rs`-style convention: each module exposes a
//! `XCli` clap struct plus a `pub fn cmd_x(argv) -> Result<()>` that
//! `main.rs` dispatches to by name.

pub mod check;
pub mod clean_attributes;
pub mod opts;
pub mod rebuild;
pub mod rebuild_sb;
pub mod rollback_cmd;

pub use check::cmd_check;
pub use clean_attributes::cmd_clean_attributes;
pub use rebuild::cmd_rebuild_tree;
pub use rebuild_sb::cmd_rebuild_sb;
pub use rollback_cmd::cmd_rollback;

/// Command names grouped for the top-level usage printout, in the order
/// the teacher groups its own `bcachefs_usage` output.
pub const COMMAND_GROUPS: &[(&str, &[&str])] = &[
    ("Check and repair:", &["check", "fix-fixable", "rebuild-tree"]),
    ("Maintenance:", &["clean-attributes", "rollback"]),
    ("Superblock:", &["rebuild-sb"]),
];
