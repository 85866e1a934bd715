//! `rebuild-tree`: runs the full five-pass rebuilder over a device whose
//! tree is presumed unreliable, writing stage dumps along the way so an
//! interrupted run can be resumed.

use anyhow::Result;
use clap::Parser;
use log::info;

use crate::core::rebuilder::rebuild_tree;
use crate::util::fmt_num_human;

use super::opts::{open_ctx, scan_bitmap, CommonArgs, FsckConfig};

#[derive(Parser, Debug)]
#[command(about = "Discard the existing tree and rebuild it from surviving leaves")]
pub struct RebuildTreeCli {
    #[command(flatten)]
    common: CommonArgs,
}

pub fn cmd_rebuild_tree(argv: Vec<String>) -> Result<()> {
    let cli = RebuildTreeCli::parse_from(argv);
    let config = FsckConfig::from_args(&cli.common);
    let (mut ctx, _sb) = open_ctx(&config)?;

    let scan = scan_bitmap(&config, ctx.block_count)?;
    let report = rebuild_tree(&mut ctx, scan, config.pass_dump.as_deref())?;

    if let Some(rb) = ctx.io.rollback_mut() {
        rb.flush()?;
    }

    info!(
        "rebuild complete: {} leaves recovered, {} relocated, {} lost+found entries, {} merged leaves",
        report.leaves_recovered, report.relocated_objects, report.lost_found_entries, report.merged_leaves
    );
    println!("leaves recovered:     {}", fmt_num_human(report.leaves_recovered));
    println!("items inserted loose: {}", fmt_num_human(report.uninsertable_blocks));
    println!("objects relocated:    {}", fmt_num_human(report.relocated_objects));
    println!("lost+found entries:   {}", fmt_num_human(report.lost_found_entries));
    println!("unreachable deleted:  {}", fmt_num_human(report.deleted_unreachable));
    println!("leaves merged:        {}", fmt_num_human(report.merged_leaves));
    Ok(())
}
