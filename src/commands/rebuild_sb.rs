//! `rebuild-sb`: stub. Superblock reconstruction is out of scope for this
//! core — it's addressed only by the interfaces the core consumes (the
//! block device it's handed already has a valid superblock by the time
//! any other command runs) — so this reports that explicitly instead of
//! silently doing nothing, matching the teacher's pattern of CLI stubs for
//! commands whose real implementation lives outside what got ported here.

use anyhow::{bail, Result};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(about = "Rebuild the superblock (not implemented)")]
pub struct RebuildSbCli {
    #[arg(required = true)]
    device: std::path::PathBuf,
}

pub fn cmd_rebuild_sb(argv: Vec<String>) -> Result<()> {
    let cli = RebuildSbCli::parse_from(argv);
    bail!("rebuild-sb is not implemented in core; {} was not modified", cli.device.display());
}
