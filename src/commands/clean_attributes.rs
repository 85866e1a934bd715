//! `clean-attributes`: walks every stat-data item in the tree clearing the
//! deprecated immutable/append-only/no-packing bits (original `pass0.c`'s
//! attribute-clearing pass; not excluded by any Non-goal, since it's a
//! one-shot repair over existing items rather than new functionality).

use std::collections::HashSet;

use anyhow::Result;
use clap::Parser;
use log::info;

use crate::core::block_io::BlockDevice;
use crate::core::ctx::{FsckCtx, NO_BLOCK};
use crate::core::item::{StatData, DEPRECATED_ATTRS};
use crate::core::node::{BlockHeader, InternalView, LeafView};
use crate::core::reporter::Reporter;

use super::opts::{open_ctx, CommonArgs, FsckConfig};

#[derive(Parser, Debug)]
#[command(about = "Clear deprecated attribute bits from every stat-data item")]
pub struct CleanAttributesCli {
    #[command(flatten)]
    common: CommonArgs,
}

pub fn cmd_clean_attributes(argv: Vec<String>) -> Result<()> {
    let cli = CleanAttributesCli::parse_from(argv);
    let config = FsckConfig::from_args(&cli.common);
    let (mut ctx, _sb) = open_ctx(&config)?;

    let cleaned = clean_attributes(&mut ctx)?;
    ctx.io.flush()?;

    info!("clean-attributes cleared {cleaned} stat-data item(s)");
    println!("cleared attributes on {cleaned} item(s)");
    Ok(())
}

fn clean_attributes<D: BlockDevice, R: Reporter>(ctx: &mut FsckCtx<D, R>) -> Result<u64> {
    let mut cleaned = 0u64;
    if ctx.root_block == NO_BLOCK {
        return Ok(cleaned);
    }
    let bs = ctx.blocksize as usize;
    let mut stack = vec![ctx.root_block];
    let mut seen = HashSet::new();
    while let Some(block) = stack.pop() {
        if !seen.insert(block) {
            continue;
        }
        let buf = ctx.read_block(block)?;
        let head = BlockHeader::read(&buf);
        if !head.is_leaf() {
            let view = InternalView::new(&buf, bs);
            for i in 0..=view.nr_items() {
                stack.push(view.child(i).block);
            }
            continue;
        }

        let nr = LeafView::new(&buf, bs).nr_items();
        let mut owned = buf;
        let mut touched = false;
        for i in 0..nr {
            let view = LeafView::new(&owned, bs);
            let ih = view.item_header(i);
            if !ih.key.is_stat_data() || view.item_body(i).len() < 4 {
                continue;
            }
            let mut sd = StatData::read(view.item_body(i));
            if sd.attrs & DEPRECATED_ATTRS == 0 {
                continue;
            }
            sd.attrs &= !DEPRECATED_ATTRS;
            let loc = ih.item_location as usize;
            let len = ih.item_len as usize;
            drop(view);
            let mut body = owned[loc..loc + len].to_vec();
            sd.write(&mut body);
            owned[loc..loc + len].copy_from_slice(&body);
            touched = true;
            cleaned += 1;
        }
        if touched {
            ctx.write_block(block, &owned)?;
        }
    }
    Ok(cleaned)
}
