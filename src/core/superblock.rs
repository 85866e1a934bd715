//! On-disk superblock: fixed fields at a well-known byte offset. Spec §6:
//! "must match bit-exact" — block_count, free_blocks, root_block,
//! tree_height, bitmap_count, hash_code, journal params, uuid, label, magic.

use byteorder::{ByteOrder, LittleEndian};

use super::error::{CoreError, CoreResult};
use super::hash::HashKind;

/// Byte offset of the superblock on a device using the new (post-3.6)
/// layout; `OLD_OFFSET` is kept for images formatted by older tooling.
pub const NEW_OFFSET: u64 = 64 * 1024;
pub const OLD_OFFSET: u64 = 8 * 1024;

pub const MAGIC_V1: &[u8; 8] = b"ReIsErFs";
pub const MAGIC_V2: &[u8; 9] = b"ReIsEr2Fs";
pub const MAGIC_JR: &[u8; 9] = b"ReIsEr3Fs";

const SB_SIZE: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Superblock {
    pub block_count: u64,
    pub free_blocks: u64,
    pub root_block: u64,
    pub tree_height: u16,
    pub blocksize: u32,
    pub bitmap_count: u32,
    pub hash: HashKind,
    pub journal_block: u64,
    pub journal_size: u32,
    pub journal_dev_id: u32,
    pub uuid: [u8; 16],
    pub label: [u8; 16],
    pub magic: [u8; 9],
    pub umount_state_clean: bool,
}

impl Superblock {
    pub fn parse(buf: &[u8]) -> CoreResult<Self> {
        if buf.len() < SB_SIZE {
            return Err(CoreError::CorruptBlock { block: u64::MAX, reason: "superblock buffer too short" });
        }
        let mut magic = [0u8; 9];
        magic.copy_from_slice(&buf[52..61]);
        if !(&magic[..8] == b"ReIsErFs" || &magic == b"ReIsEr2Fs" || &magic == b"ReIsEr3Fs") {
            return Err(CoreError::CorruptBlock { block: u64::MAX, reason: "bad superblock magic" });
        }

        let hash = match LittleEndian::read_u32(&buf[44..48]) {
            0 => HashKind::Tea,
            1 => HashKind::Rupasov,
            _ => HashKind::R5,
        };

        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&buf[61..77]);
        let mut label = [0u8; 16];
        label.copy_from_slice(&buf[77..93]);

        Ok(Superblock {
            block_count: LittleEndian::read_u32(&buf[0..4]) as u64,
            free_blocks: LittleEndian::read_u32(&buf[4..8]) as u64,
            root_block: LittleEndian::read_u32(&buf[8..12]) as u64,
            tree_height: LittleEndian::read_u16(&buf[12..14]),
            blocksize: LittleEndian::read_u32(&buf[16..20]),
            bitmap_count: LittleEndian::read_u32(&buf[20..24]),
            journal_block: LittleEndian::read_u32(&buf[24..28]) as u64,
            journal_size: LittleEndian::read_u32(&buf[28..32]),
            journal_dev_id: LittleEndian::read_u32(&buf[32..36]),
            hash,
            uuid,
            label,
            magic,
            umount_state_clean: buf[93] == 1,
        })
    }

    pub fn serialize(&self, buf: &mut [u8]) {
        assert!(buf.len() >= SB_SIZE);
        for b in buf.iter_mut() {
            *b = 0;
        }
        LittleEndian::write_u32(&mut buf[0..4], self.block_count as u32);
        LittleEndian::write_u32(&mut buf[4..8], self.free_blocks as u32);
        LittleEndian::write_u32(&mut buf[8..12], self.root_block as u32);
        LittleEndian::write_u16(&mut buf[12..14], self.tree_height);
        LittleEndian::write_u32(&mut buf[16..20], self.blocksize);
        LittleEndian::write_u32(&mut buf[20..24], self.bitmap_count);
        LittleEndian::write_u32(&mut buf[24..28], self.journal_block as u32);
        LittleEndian::write_u32(&mut buf[28..32], self.journal_size);
        LittleEndian::write_u32(&mut buf[32..36], self.journal_dev_id);
        let hash_code = match self.hash {
            HashKind::Tea => 0u32,
            HashKind::Rupasov => 1,
            HashKind::R5 => 2,
        };
        LittleEndian::write_u32(&mut buf[44..48], hash_code);
        buf[52..61].copy_from_slice(&self.magic);
        buf[61..77].copy_from_slice(&self.uuid);
        buf[77..93].copy_from_slice(&self.label);
        buf[93] = self.umount_state_clean as u8;
    }

    pub fn is_clean(&self) -> bool {
        self.umount_state_clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_serialize_and_parse() {
        let sb = Superblock {
            block_count: 4096,
            free_blocks: 100,
            root_block: 42,
            tree_height: 3,
            blocksize: 4096,
            bitmap_count: 2,
            hash: HashKind::R5,
            journal_block: 18,
            journal_size: 8192,
            journal_dev_id: 0,
            uuid: [7u8; 16],
            label: *b"test-label\0\0\0\0\0\0",
            magic: *b"ReIsEr2Fs",
            umount_state_clean: true,
        };
        let mut buf = vec![0u8; SB_SIZE];
        sb.serialize(&mut buf);
        let back = Superblock::parse(&buf).unwrap();
        assert_eq!(back, sb);
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = vec![0u8; SB_SIZE];
        assert!(Superblock::parse(&buf).is_err());
    }
}
