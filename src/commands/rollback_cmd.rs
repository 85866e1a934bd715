//! `rollback`: replays a rollback log in reverse against a device, undoing
//! every write a prior run made (spec §5/§6's rollback file).

use anyhow::Result;
use clap::Parser;
use log::info;

use crate::core::block_io::FileDevice;
use crate::core::rollback::Rollback;

#[derive(Parser, Debug)]
#[command(about = "Undo a prior run by replaying its rollback log in reverse")]
pub struct RollbackCli {
    /// Device the rollback log was recorded against
    device: std::path::PathBuf,

    /// Rollback log path (defaults to `<device>.rollback`)
    #[arg(long)]
    rollback_file: Option<std::path::PathBuf>,
}

pub fn cmd_rollback(argv: Vec<String>) -> Result<()> {
    let cli = RollbackCli::parse_from(argv);
    let rollback_file = cli.rollback_file.unwrap_or_else(|| {
        let mut p = cli.device.clone().into_os_string();
        p.push(".rollback");
        p.into()
    });

    let (blocksize, records) = Rollback::read_records(&rollback_file)?;
    let mut device = FileDevice::open(&cli.device, blocksize as u64)?;
    Rollback::replay(&rollback_file, &mut device)?;

    info!("rollback replayed {} record(s) from {}", records.len(), rollback_file.display());
    println!("restored {} block(s) from {}", records.len(), rollback_file.display());
    Ok(())
}
