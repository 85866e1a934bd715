//! Shared CLI option set: every subcommand flattens [`CommonArgs`] and
//! turns it into an [`FsckConfig`], mirroring how the teacher's
//! `src/commands/fsck.rs::FsckCli` turns its own fields into a mount-option
//! string before handing off to the FS layer.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::Args;

use crate::core::bitmap::{Bitmap, BitmapLayout};
use crate::core::block_io::{BlockIo, FileDevice};
use crate::core::ctx::FsckCtx;
use crate::core::hash::HashKind;
use crate::core::reporter::TermReporter;
use crate::core::rollback::Rollback;
use crate::core::superblock::{Superblock, NEW_OFFSET, OLD_OFFSET};

#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Device or image file to operate on
    pub device: PathBuf,

    /// Rollback log path (defaults to `<device>.rollback`)
    #[arg(long)]
    pub rollback_file: Option<PathBuf>,

    /// Bitmap of known-bad blocks, merged permanently into the reserved set
    #[arg(long)]
    pub badblocks_file: Option<PathBuf>,

    /// Restrict pass 0's scan to the blocks set in this file's bitmap
    #[arg(long)]
    pub bitmap_file: Option<PathBuf>,

    /// Ignore --bitmap-file and scan every non-reserved block
    #[arg(long)]
    pub scan_whole_partition: bool,

    /// Hash function hint, used when the directory corpus doesn't settle a majority
    #[arg(long, value_parser = ["r5", "tea", "rupasov"])]
    pub hash: Option<String>,

    /// Directory to write stage-dump files into after each rebuild pass
    #[arg(long)]
    pub pass_dump: Option<PathBuf>,

    /// Assume "yes" to every confirmation prompt
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// Don't repair anything, only report
    #[arg(short = 'n')]
    pub no_repair: bool,

    /// Run even if the superblock reports a clean unmount
    #[arg(short = 'f', long)]
    pub force: bool,

    /// Suppress progress output
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

pub struct FsckConfig {
    pub device: PathBuf,
    pub rollback_file: PathBuf,
    pub badblocks_file: Option<PathBuf>,
    pub bitmap_file: Option<PathBuf>,
    pub scan_whole_partition: bool,
    pub hash_hint: Option<HashKind>,
    pub pass_dump: Option<PathBuf>,
    pub yes: bool,
    pub no_repair: bool,
    pub force: bool,
    pub quiet: bool,
}

impl FsckConfig {
    pub fn from_args(a: &CommonArgs) -> Self {
        let rollback_file = a.rollback_file.clone().unwrap_or_else(|| {
            let mut p = a.device.clone().into_os_string();
            p.push(".rollback");
            PathBuf::from(p)
        });
        let hash_hint = a.hash.as_deref().map(|h| match h {
            "tea" => HashKind::Tea,
            "rupasov" => HashKind::Rupasov,
            _ => HashKind::R5,
        });
        FsckConfig {
            device: a.device.clone(),
            rollback_file,
            badblocks_file: a.badblocks_file.clone(),
            bitmap_file: a.bitmap_file.clone(),
            scan_whole_partition: a.scan_whole_partition,
            hash_hint,
            pass_dump: a.pass_dump.clone(),
            yes: a.yes,
            no_repair: a.no_repair,
            force: a.force,
            quiet: a.quiet,
        }
    }
}

/// Parses the superblock from `path`, also returning the byte offset it was
/// found at, so a repair can write it back to the same spot rather than
/// guessing between the new and legacy layouts.
pub fn read_superblock_at(path: &Path) -> Result<(Superblock, u64)> {
    let bytes = std::fs::read(path)?;
    for &offset in &[NEW_OFFSET, OLD_OFFSET] {
        let off = offset as usize;
        if bytes.len() >= off + 256 {
            if let Ok(sb) = Superblock::parse(&bytes[off..]) {
                return Ok((sb, offset));
            }
        }
    }
    bail!("no valid superblock found on {}", path.display())
}

/// The on-disk bitmap's layout for a given superblock: one bitmap block
/// immediately following the block the superblock itself lives in, matching
/// the original on-disk convention this superblock offset was drawn from.
pub fn bitmap_layout(sb: &Superblock, sb_offset: u64) -> BitmapLayout {
    let sb_block = sb_offset / sb.blocksize as u64;
    BitmapLayout::Contiguous { first_bitmap_block: sb_block + 1 }
}

/// Loads a bare RLE-encoded bitmap dump (same wire format as a stage dump's
/// single entry) used for `--bitmap-file`/`--badblocks-file`.
fn read_bitmap_file(path: &Path, block_count: u64) -> Result<Bitmap> {
    let bytes = std::fs::read(path)?;
    let mut bm = Bitmap::new(block_count);
    let mut cursor = 0usize;
    let mut set = false;
    let mut pos = 0u64;
    while cursor + 4 <= bytes.len() {
        let run = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap()) as u64;
        cursor += 4;
        if set {
            bm.set_range(pos, (pos + run).min(block_count));
        }
        pos += run;
        set = !set;
    }
    Ok(bm)
}

/// Opens the device, parses its superblock, and assembles an `FsckCtx`
/// ready for a pass to run against, folding in badblocks/hash-hint/force
/// overrides from `config`. Returns the parsed superblock too, since
/// `check` needs `umount_state_clean` for its clean-FS short circuit.
pub fn open_ctx(config: &FsckConfig) -> Result<(FsckCtx<FileDevice, TermReporter>, Superblock)> {
    let (sb, sb_offset) = read_superblock_at(&config.device)?;
    let mut device = FileDevice::open(&config.device, sb.blocksize as u64)?;

    let layout = bitmap_layout(&sb, sb_offset);
    let source = Bitmap::read_from_device(&mut device, layout, sb.block_count)?;

    let rollback = if config.no_repair {
        None
    } else {
        Some(Rollback::create(&config.rollback_file, sb.blocksize)?)
    };
    let io = match rollback {
        Some(rb) => BlockIo::with_rollback(device, rb),
        None => BlockIo::new(device),
    };

    let reporter = TermReporter::new(config.yes, config.quiet);
    let mut ctx = FsckCtx::new(io, reporter);
    ctx.root_block = sb.root_block;
    ctx.tree_height = sb.tree_height;
    ctx.hash = config.hash_hint.unwrap_or(sb.hash);
    ctx.source = source;

    let sb_block = sb_offset / sb.blocksize as u64;
    ctx.reserved.set(sb_block);
    for block in layout.bitmap_block_numbers(sb.block_count, sb.blocksize as u64) {
        ctx.reserved.set(block);
    }

    if let Some(bb_path) = &config.badblocks_file {
        let bb = read_bitmap_file(bb_path, ctx.block_count)?;
        ctx.reserved.union_with(&bb);
    }

    Ok((ctx, sb))
}

/// Builds pass 0's scan bitmap from `--bitmap-file`, unless
/// `--scan-whole-partition` overrides it. `None` tells the rebuilder to
/// scan every non-reserved block.
pub fn scan_bitmap(config: &FsckConfig, block_count: u64) -> Result<Option<Bitmap>> {
    if config.scan_whole_partition {
        return Ok(None);
    }
    match &config.bitmap_file {
        Some(path) => Ok(Some(read_bitmap_file(path, block_count)?)),
        None => Ok(None),
    }
}
