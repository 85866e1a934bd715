//! Append-only rollback log: `(block#, pre-image)` records that can be
//! replayed in reverse to fully undo a run. See spec §5 ("Rollback
//! ordering") and §6 ("Rollback file").

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::block_io::BlockDevice;
use super::error::{CoreError, CoreResult};

const MAGIC: u32 = 0x524f_4c4c; // "ROLL"
const HEADER_SIZE: u64 = 16; // magic:u32 + blocksize:u32 + count:u64

pub struct Rollback {
    file: File,
    blocksize: u32,
    count: u64,
}

fn io_err(e: std::io::Error) -> CoreError {
    CoreError::Io { block: u64::MAX, source: e }
}

impl Rollback {
    /// Creates a fresh rollback file at `path`, truncating any existing one.
    pub fn create(path: &Path, blocksize: u32) -> CoreResult<Self> {
        let mut file =
            OpenOptions::new().create(true).write(true).read(true).truncate(true).open(path).map_err(io_err)?;
        let mut rb = Rollback { file: File::try_clone(&mut file).map_err(io_err)?, blocksize, count: 0 };
        rb.write_header()?;
        Ok(rb)
    }

    fn write_header(&mut self) -> CoreResult<()> {
        self.file.seek(SeekFrom::Start(0)).map_err(io_err)?;
        self.file.write_all(&MAGIC.to_le_bytes()).map_err(io_err)?;
        self.file.write_all(&self.blocksize.to_le_bytes()).map_err(io_err)?;
        self.file.write_all(&self.count.to_le_bytes()).map_err(io_err)?;
        Ok(())
    }

    /// Appends one `(block, pre-image)` record and bumps the header's
    /// record count. Pre-image must be exactly `blocksize` bytes.
    pub fn record(&mut self, block: u64, pre_image: &[u8]) -> CoreResult<()> {
        assert_eq!(pre_image.len(), self.blocksize as usize);
        let record_size = 4 + self.blocksize as u64;
        let offset = HEADER_SIZE + self.count * record_size;
        self.file.seek(SeekFrom::Start(offset)).map_err(io_err)?;
        self.file.write_all(&(block as u32).to_le_bytes()).map_err(io_err)?;
        self.file.write_all(pre_image).map_err(io_err)?;
        self.count += 1;
        self.write_header()
    }

    pub fn record_count(&self) -> u64 {
        self.count
    }

    pub fn flush(&mut self) -> CoreResult<()> {
        self.file.flush().map_err(io_err)
    }

    /// Truncates the log to empty, used once the run completes
    /// successfully (spec §6: "append-only; truncated on completion").
    pub fn truncate(&mut self) -> CoreResult<()> {
        self.file.set_len(0).map_err(io_err)?;
        self.count = 0;
        self.write_header()
    }

    /// Reads every record in forward (append) order.
    pub fn read_records(path: &Path) -> CoreResult<(u32, Vec<(u64, Vec<u8>)>)> {
        let mut file = File::open(path).map_err(io_err)?;
        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header).map_err(io_err)?;
        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(CoreError::StageDump("bad rollback magic"));
        }
        let blocksize = u32::from_le_bytes(header[4..8].try_into().unwrap());
        let count = u64::from_le_bytes(header[8..16].try_into().unwrap());

        let mut records = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut blk_buf = [0u8; 4];
            file.read_exact(&mut blk_buf).map_err(io_err)?;
            let block = u32::from_le_bytes(blk_buf) as u64;
            let mut pre_image = vec![0u8; blocksize as usize];
            file.read_exact(&mut pre_image).map_err(io_err)?;
            records.push((block, pre_image));
        }
        Ok((blocksize, records))
    }

    /// Replays the log in reverse onto `device`, restoring it to the state
    /// it was in before the run started.
    pub fn replay<D: BlockDevice>(path: &Path, device: &mut D) -> CoreResult<()> {
        let (_blocksize, mut records) = Self::read_records(path)?;
        records.reverse();
        for (block, pre_image) in records {
            device.write_block(block, &pre_image)?;
        }
        device.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block_io::MemDevice;

    #[test]
    fn record_and_replay_restores_device() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut dev = MemDevice::new(16, 4);
        dev.write_block(0, &[1u8; 16]).unwrap();
        dev.write_block(1, &[2u8; 16]).unwrap();
        let original_0 = dev.read_block(0).unwrap();
        let original_1 = dev.read_block(1).unwrap();

        let mut rb = Rollback::create(tmp.path(), 16).unwrap();
        rb.record(0, &original_0).unwrap();
        dev.write_block(0, &[9u8; 16]).unwrap();
        rb.record(1, &original_1).unwrap();
        dev.write_block(1, &[8u8; 16]).unwrap();
        rb.flush().unwrap();

        assert_eq!(rb.record_count(), 2);
        Rollback::replay(tmp.path(), &mut dev).unwrap();
        assert_eq!(dev.read_block(0).unwrap(), original_0);
        assert_eq!(dev.read_block(1).unwrap(), original_1);
    }

    #[test]
    fn truncate_empties_log() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut rb = Rollback::create(tmp.path(), 16).unwrap();
        rb.record(0, &[0u8; 16]).unwrap();
        rb.truncate().unwrap();
        assert_eq!(rb.record_count(), 0);
        let (_, records) = Rollback::read_records(tmp.path()).unwrap();
        assert!(records.is_empty());
    }
}
