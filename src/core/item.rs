//! Typed views over item bodies: stat-data, extent, direct, directory.
//! Parsers return owned structs (items are small; the copy is cheap and
//! keeps callers free of the buffer's lifetime, per spec §9).

use byteorder::{ByteOrder, LittleEndian};

use super::key::Key;

pub const DEH_HEADER_SIZE: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatData {
    pub mode: u16,
    /// v2 only: immutable/append-only/nopack-style attribute bits, stored
    /// right after `mode`. Zero on v1 stat-data (no room for it there).
    pub attrs: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub blocks: u32,
    /// v2: rdev for device files. v1: overloaded with `first_direct_byte`
    /// for regular files with a tail; treated as advisory only per spec §9.
    pub rdev_or_first_direct: u32,
}

pub const S_IFDIR: u16 = 0o040000;
pub const S_IFREG: u16 = 0o100000;

/// Deprecated reiserfs attribute bits (`sd_attrs`): immutable, append-only,
/// and no-tail-packing. `clean-attributes` clears these on every stat-data
/// item it visits (original `pass0.c`'s attribute-clearing pass).
pub const ATTR_IMMUTABLE: u16 = 1 << 0;
pub const ATTR_APPEND: u16 = 1 << 1;
pub const ATTR_NOPACK: u16 = 1 << 2;
pub const DEPRECATED_ATTRS: u16 = ATTR_IMMUTABLE | ATTR_APPEND | ATTR_NOPACK;

impl StatData {
    pub const SIZE: usize = 40;

    pub fn read(buf: &[u8]) -> Self {
        StatData {
            mode: LittleEndian::read_u16(&buf[0..2]),
            attrs: if buf.len() >= 4 { LittleEndian::read_u16(&buf[2..4]) } else { 0 },
            nlink: LittleEndian::read_u32(&buf[4..8]),
            uid: LittleEndian::read_u32(&buf[8..12]),
            gid: LittleEndian::read_u32(&buf[12..16]),
            size: LittleEndian::read_u64(&buf[16..24]),
            atime: LittleEndian::read_u32(&buf[24..28]),
            mtime: LittleEndian::read_u32(&buf[28..32]),
            ctime: LittleEndian::read_u32(&buf[32..36]),
            blocks: 0,
            rdev_or_first_direct: LittleEndian::read_u32(&buf[36..40]),
        }
        .with_blocks_field(buf)
    }

    fn with_blocks_field(mut self, buf: &[u8]) -> Self {
        if buf.len() >= 44 {
            self.blocks = LittleEndian::read_u32(&buf[40..44]);
        }
        self
    }

    pub fn write(&self, buf: &mut [u8]) {
        LittleEndian::write_u16(&mut buf[0..2], self.mode);
        if buf.len() >= 4 {
            LittleEndian::write_u16(&mut buf[2..4], self.attrs);
        }
        LittleEndian::write_u32(&mut buf[4..8], self.nlink);
        LittleEndian::write_u32(&mut buf[8..12], self.uid);
        LittleEndian::write_u32(&mut buf[12..16], self.gid);
        LittleEndian::write_u64(&mut buf[16..24], self.size);
        LittleEndian::write_u32(&mut buf[24..28], self.atime);
        LittleEndian::write_u32(&mut buf[28..32], self.mtime);
        LittleEndian::write_u32(&mut buf[32..36], self.ctime);
        LittleEndian::write_u32(&mut buf[36..40], self.rdev_or_first_direct);
        if buf.len() >= 44 {
            LittleEndian::write_u32(&mut buf[40..44], self.blocks);
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & 0o170000 == S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        self.mode & 0o170000 == S_IFREG
    }
}

/// Array of block pointers; `0` is a hole.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Extent {
    pub pointers: Vec<u32>,
}

impl Extent {
    pub fn read(buf: &[u8]) -> Option<Self> {
        if buf.len() % 4 != 0 {
            return None;
        }
        Some(Extent { pointers: buf.chunks(4).map(LittleEndian::read_u32).collect() })
    }

    pub fn write(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.pointers.len() * 4];
        for (i, p) in self.pointers.iter().enumerate() {
            LittleEndian::write_u32(&mut out[i * 4..i * 4 + 4], *p);
        }
        out
    }

    pub fn byte_len(&self) -> usize {
        self.pointers.len() * 4
    }
}

/// Directory entry header: `{offset (hash+generation), target_key,
/// location, state}`. Entries are stored descending by `location`; names
/// are packed from the end of the item body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirEntryHeader {
    pub deh_offset: u32,
    pub target: Key,
    /// Offset from item start to the name bytes (descending across
    /// entries).
    pub location: u16,
    pub state: u16,
}

pub const DEH_STATE_VISIBLE: u16 = 1 << 0;

impl DirEntryHeader {
    pub fn read(buf: &[u8]) -> Self {
        DirEntryHeader {
            deh_offset: LittleEndian::read_u32(&buf[0..4]),
            target: Key {
                dir_id: LittleEndian::read_u32(&buf[4..8]),
                object_id: LittleEndian::read_u32(&buf[8..12]),
                offset_and_type: 0,
            },
            location: LittleEndian::read_u16(&buf[12..14]),
            state: LittleEndian::read_u16(&buf[14..16]),
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.deh_offset);
        LittleEndian::write_u32(&mut buf[4..8], self.target.dir_id);
        LittleEndian::write_u32(&mut buf[8..12], self.target.object_id);
        LittleEndian::write_u16(&mut buf[12..14], self.location);
        LittleEndian::write_u16(&mut buf[14..16], self.state);
    }

    pub fn is_visible(&self) -> bool {
        self.state == DEH_STATE_VISIBLE
    }
}

/// A directory item: an array of entry headers plus packed name bytes.
#[derive(Clone, Debug, Default)]
pub struct DirectoryItem {
    pub entries: Vec<(DirEntryHeader, Vec<u8>)>,
}

impl DirectoryItem {
    /// Parses entry headers out of `buf`, clamping `entry_count` to what
    /// fits and reconstructing name lengths by walking descending
    /// locations (spec §4.5 / §4.9: names have no explicit length field,
    /// only the start location of the next entry down bounds them).
    pub fn parse(buf: &[u8], entry_count: usize) -> Option<Self> {
        let max_entries = buf.len() / DEH_HEADER_SIZE;
        let entry_count = entry_count.min(max_entries);
        if entry_count == 0 {
            return Some(DirectoryItem { entries: Vec::new() });
        }
        let mut headers = Vec::with_capacity(entry_count);
        for i in 0..entry_count {
            headers.push(DirEntryHeader::read(&buf[i * DEH_HEADER_SIZE..(i + 1) * DEH_HEADER_SIZE]));
        }
        let headers_end = entry_count * DEH_HEADER_SIZE;
        let mut entries = Vec::with_capacity(entry_count);
        for (i, h) in headers.iter().enumerate() {
            let start = h.location as usize;
            if start < headers_end || start > buf.len() {
                return None;
            }
            let end = if i == 0 { buf.len() } else { headers[i - 1].location as usize };
            if end < start || end > buf.len() {
                return None;
            }
            entries.push((*h, buf[start..end].to_vec()));
        }
        Some(DirectoryItem { entries })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let headers_len = self.entries.len() * DEH_HEADER_SIZE;
        let names_len: usize = self.entries.iter().map(|(_, n)| n.len()).sum();
        let mut out = vec![0u8; headers_len + names_len];
        // names packed from the end, descending location order matching
        // entry order (entries are kept sorted by descending location by
        // callers, mirroring the on-disk layout)
        let mut cursor = out.len();
        for (i, (h, name)) in self.entries.iter().enumerate() {
            cursor -= name.len();
            out[cursor..cursor + name.len()].copy_from_slice(name);
            let mut h = *h;
            h.location = cursor as u16;
            h.write(&mut out[i * DEH_HEADER_SIZE..(i + 1) * DEH_HEADER_SIZE]);
        }
        out
    }

    pub fn name(&self, i: usize) -> &[u8] {
        &self.entries[i].1
    }
}
