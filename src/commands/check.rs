//! `check` / `fix-fixable`: single-pass validation, with or without
//! repairing fixable corruptions in place.

use anyhow::Result;
use clap::Parser;
use log::info;

use crate::core::checker::run_check;
use crate::core::superblock::Superblock;

use super::opts::{bitmap_layout, open_ctx, read_superblock_at, CommonArgs, FsckConfig};

#[derive(Parser, Debug)]
#[command(about = "Check a filesystem image for corruption")]
pub struct CheckCli {
    #[command(flatten)]
    common: CommonArgs,
}

pub fn cmd_check(argv: Vec<String>, fix: bool) -> Result<()> {
    let cli = CheckCli::parse_from(argv);
    let config = FsckConfig::from_args(&cli.common);
    let (mut ctx, sb) = open_ctx(&config)?;

    if sb.is_clean() && !config.force && !fix {
        info!("filesystem was cleanly unmounted, skipping check (use --force to override)");
        println!("clean, 0 corruptions");
        return Ok(());
    }

    let report = run_check(&mut ctx, fix, Some(sb.free_blocks))?;
    let corruptions = report.corruptions;

    if fix && report.computed_free_blocks != sb.free_blocks {
        let (_, sb_offset) = read_superblock_at(&config.device)?;
        let layout = bitmap_layout(&sb, sb_offset);
        for (block, buf) in ctx.source.to_device_blocks(layout, sb.blocksize as u64) {
            ctx.write_block(block, &buf)?;
        }
        persist_free_block_count(&config.device, &sb, sb_offset, report.computed_free_blocks)?;
        info!(
            "superblock free-block counter corrected: {} -> {}",
            sb.free_blocks, report.computed_free_blocks
        );
    }

    ctx.io.flush()?;
    if fix {
        if let Some(rb) = ctx.io.rollback_mut() {
            rb.truncate()?;
        }
    }

    info!("check complete: {} fatal, {} fixable", corruptions.fatal, corruptions.fixable);
    println!("{} fatal, {} fixable corruptions", corruptions.fatal, corruptions.fixable);

    if corruptions.fatal > 0 {
        anyhow::bail!("filesystem has fatal corruptions; run rebuild-tree");
    }
    Ok(())
}

/// Rewrites just the superblock's `free_blocks` field in place, leaving
/// every other field untouched.
fn persist_free_block_count(device: &std::path::Path, sb: &Superblock, sb_offset: u64, free_blocks: u64) -> Result<()> {
    let mut corrected = sb.clone();
    corrected.free_blocks = free_blocks;
    let mut buf = vec![0u8; 256];
    corrected.serialize(&mut buf);

    use std::io::{Seek, SeekFrom, Write};
    let mut file = std::fs::OpenOptions::new().write(true).open(device)?;
    file.seek(SeekFrom::Start(sb_offset))?;
    file.write_all(&buf)?;
    file.flush()?;
    Ok(())
}
