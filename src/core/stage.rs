//! Persistable stage-dump file: lets a rebuilder run be resumed after each
//! pass boundary. Spec §6: start magic, a stage tag, RLE-serialized
//! bitmaps, end magic; written atomically via rename-over.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use super::bitmap::Bitmap;
use super::error::{CoreError, CoreResult};

const START_MAGIC: u32 = 374_033;
const END_MAGIC: u32 = 7_786_470;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Pass0Done,
    Pass1Done,
    TreeIsBuilt,
    SemanticDone,
    LostFoundDone,
}

impl Stage {
    fn tag(self) -> u32 {
        match self {
            Stage::Pass0Done => 0,
            Stage::Pass1Done => 1,
            Stage::TreeIsBuilt => 2,
            Stage::SemanticDone => 3,
            Stage::LostFoundDone => 4,
        }
    }

    fn from_tag(tag: u32) -> CoreResult<Self> {
        Ok(match tag {
            0 => Stage::Pass0Done,
            1 => Stage::Pass1Done,
            2 => Stage::TreeIsBuilt,
            3 => Stage::SemanticDone,
            4 => Stage::LostFoundDone,
            _ => return Err(CoreError::StageDump("unknown stage tag")),
        })
    }
}

/// A named bitmap plus its bit length, as persisted in the dump.
pub struct StageDump {
    pub stage: Stage,
    pub bitmaps: Vec<(String, Bitmap)>,
}

fn io_err(e: std::io::Error) -> CoreError {
    CoreError::Io { block: u64::MAX, source: e }
}

impl StageDump {
    pub fn new(stage: Stage) -> Self {
        StageDump { stage, bitmaps: Vec::new() }
    }

    pub fn add(&mut self, name: &str, bitmap: &Bitmap) {
        self.bitmaps.push((name.to_string(), bitmap.clone()));
    }

    pub fn get(&self, name: &str) -> Option<&Bitmap> {
        self.bitmaps.iter().find(|(n, _)| n == name).map(|(_, b)| b)
    }

    fn write_u32<W: Write>(w: &mut W, v: u32) -> std::io::Result<()> {
        w.write_all(&v.to_le_bytes())
    }

    fn write_string<W: Write>(w: &mut W, s: &str) -> std::io::Result<()> {
        Self::write_u32(w, s.len() as u32)?;
        w.write_all(s.as_bytes())
    }

    fn read_u32<R: Read>(r: &mut R) -> std::io::Result<u32> {
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_string<R: Read>(r: &mut R) -> std::io::Result<String> {
        let len = Self::read_u32(r)? as usize;
        let mut buf = vec![0u8; len];
        r.read_exact(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut out = Vec::new();
        Self::write_u32(&mut out, START_MAGIC).map_err(io_err)?;
        Self::write_u32(&mut out, self.stage.tag()).map_err(io_err)?;
        Self::write_u32(&mut out, self.bitmaps.len() as u32).map_err(io_err)?;
        for (name, bitmap) in &self.bitmaps {
            Self::write_string(&mut out, name).map_err(io_err)?;
            Self::write_u32(&mut out, bitmap.len() as u32).map_err(io_err)?;
            let runs = bitmap.to_rle();
            Self::write_u32(&mut out, runs.len() as u32).map_err(io_err)?;
            for run in runs {
                Self::write_u32(&mut out, run).map_err(io_err)?;
            }
        }
        Self::write_u32(&mut out, END_MAGIC).map_err(io_err)?;
        Ok(out)
    }

    fn decode(buf: &[u8]) -> CoreResult<Self> {
        let mut cursor = std::io::Cursor::new(buf);
        let start = Self::read_u32(&mut cursor).map_err(io_err)?;
        if start != START_MAGIC {
            return Err(CoreError::StageDump("bad start magic"));
        }
        let stage = Stage::from_tag(Self::read_u32(&mut cursor).map_err(io_err)?)?;
        let nr_bitmaps = Self::read_u32(&mut cursor).map_err(io_err)?;
        let mut bitmaps = Vec::with_capacity(nr_bitmaps as usize);
        for _ in 0..nr_bitmaps {
            let name = Self::read_string(&mut cursor).map_err(io_err)?;
            let len = Self::read_u32(&mut cursor).map_err(io_err)? as u64;
            let nr_runs = Self::read_u32(&mut cursor).map_err(io_err)?;
            let mut runs = Vec::with_capacity(nr_runs as usize);
            for _ in 0..nr_runs {
                runs.push(Self::read_u32(&mut cursor).map_err(io_err)?);
            }
            bitmaps.push((name, Bitmap::from_rle(len, &runs)));
        }
        let end = Self::read_u32(&mut cursor).map_err(io_err)?;
        if end != END_MAGIC {
            return Err(CoreError::StageDump("bad end magic"));
        }
        Ok(StageDump { stage, bitmaps })
    }

    /// Writes the dump atomically: serialize to a sibling temp file, then
    /// rename over the target (spec §6: "writes the dump atomically via
    /// rename-over").
    pub fn write_atomic(&self, path: &Path) -> CoreResult<()> {
        let bytes = self.encode()?;
        let tmp_path = path.with_extension("tmp");
        {
            let mut f = File::create(&tmp_path).map_err(io_err)?;
            f.write_all(&bytes).map_err(io_err)?;
            f.flush().map_err(io_err)?;
            f.sync_all().map_err(io_err)?;
        }
        fs::rename(&tmp_path, path).map_err(io_err)
    }

    pub fn read(path: &Path) -> CoreResult<Self> {
        let mut f = File::open(path).map_err(io_err)?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf).map_err(io_err)?;
        Self::decode(&buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_disk() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut leaves = Bitmap::new(40);
        leaves.set_range(3, 9);
        leaves.set(30);

        let mut dump = StageDump::new(Stage::Pass0Done);
        dump.add("leaves", &leaves);
        dump.write_atomic(tmp.path()).unwrap();

        let back = StageDump::read(tmp.path()).unwrap();
        assert_eq!(back.stage, Stage::Pass0Done);
        let back_leaves = back.get("leaves").unwrap();
        for i in 0..40 {
            assert_eq!(leaves.test(i), back_leaves.test(i), "bit {i}");
        }
    }

    #[test]
    fn rejects_truncated_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        fs::write(tmp.path(), [1u8, 2, 3]).unwrap();
        assert!(StageDump::read(tmp.path()).is_err());
    }
}
