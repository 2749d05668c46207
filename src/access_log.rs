//! The access log: an on-disk hint file of hot keys.
//!
//! One log is kept per shard. Each append is a block of keys for one
//! vBucket; warmup replays the blocks through `get_multi` to prime the
//! cache with the working set before traffic is admitted.
//!
//! The format is little-endian: a fixed header (magic + version)
//! followed by blocks of `[vbid:u16][count:u32][len:u16 key]...[sum:u32]`
//! where `sum` is a wrapping byte sum of the block payload. A block that
//! fails validation poisons the rest of the file; the reader reports the
//! error and warmup falls back to the plain data load.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::key::DocKey;
use crate::vbucket::Vbid;

const MAGIC: [u8; 4] = *b"ALOG";
const VERSION: u32 = 1;

/// Errors surfaced while reading an access log.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// The file does not begin with the expected magic.
    #[error("bad magic")]
    BadMagic,
    /// The file was written by an unsupported version.
    #[error("unsupported version {0}")]
    UnsupportedVersion(u32),
    /// A block checksum did not validate.
    #[error("checksum mismatch in block {0}")]
    BadChecksum(usize),
    /// The file ended inside a block.
    #[error("truncated block {0}")]
    Truncated(usize),
    /// A key failed to decode.
    #[error("undecodable key in block {0}")]
    BadKey(usize),
}

/// Derive the per-shard log path: `<base>.<shard>`.
pub fn shard_log_path(base: &Path, shard: usize) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!(".{shard}"));
    PathBuf::from(name)
}

/// The `.old` sibling left by the previous rotation.
pub fn old_log_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".old");
    PathBuf::from(name)
}

/// Rotate `path` to its `.old` sibling, if it exists.
pub fn rotate(path: &Path) -> io::Result<()> {
    if path.exists() {
        fs::rename(path, old_log_path(path))?;
    }
    Ok(())
}

fn block_sum(payload: &[u8]) -> u32 {
    payload
        .iter()
        .fold(0u32, |sum, byte| sum.wrapping_add(u32::from(*byte)))
}

/// Writer appending key batches to a fresh log file.
pub struct AccessLogWriter {
    out: BufWriter<File>,
}

impl AccessLogWriter {
    /// Create (truncating) the log at `path` and write the header.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);
        out.write_all(&MAGIC)?;
        out.write_all(&VERSION.to_le_bytes())?;
        Ok(Self { out })
    }

    /// Append one batch of keys for `vbid`.
    pub fn write_batch(&mut self, vbid: Vbid, keys: &[DocKey]) -> io::Result<()> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&vbid.0.to_le_bytes());
        payload.extend_from_slice(&(keys.len() as u32).to_le_bytes());
        for key in keys {
            let encoded = key.encoded();
            payload.extend_from_slice(&(encoded.len() as u16).to_le_bytes());
            payload.extend_from_slice(encoded);
        }
        self.out.write_all(&payload)?;
        self.out.write_all(&block_sum(&payload).to_le_bytes())?;
        Ok(())
    }

    /// Flush and sync the log to disk.
    pub fn finish(mut self) -> io::Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_all()
    }
}

/// One replayed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessLogBatch {
    /// vBucket the keys belong to
    pub vbid: Vbid,
    /// The keys, in append order
    pub keys: Vec<DocKey>,
}

/// Read every batch from the log at `path`.
pub fn read_all(path: &Path) -> Result<Vec<AccessLogBatch>, ReadError> {
    let file = File::open(path)?;
    let mut input = BufReader::new(file);

    let mut magic = [0u8; 4];
    input.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(ReadError::BadMagic);
    }
    let mut version = [0u8; 4];
    input.read_exact(&mut version)?;
    let version = u32::from_le_bytes(version);
    if version != VERSION {
        return Err(ReadError::UnsupportedVersion(version));
    }

    let mut batches = Vec::new();
    let mut block = 0usize;
    loop {
        let mut vbid = [0u8; 2];
        match input.read_exact(&mut vbid) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let mut payload = vbid.to_vec();

        let mut count = [0u8; 4];
        input
            .read_exact(&mut count)
            .map_err(|_| ReadError::Truncated(block))?;
        payload.extend_from_slice(&count);
        let count = u32::from_le_bytes(count);

        let mut keys = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut len = [0u8; 2];
            input
                .read_exact(&mut len)
                .map_err(|_| ReadError::Truncated(block))?;
            payload.extend_from_slice(&len);
            let len = u16::from_le_bytes(len) as usize;

            let mut encoded = vec![0u8; len];
            input
                .read_exact(&mut encoded)
                .map_err(|_| ReadError::Truncated(block))?;
            payload.extend_from_slice(&encoded);
            keys.push(DocKey::from_encoded(encoded).map_err(|_| ReadError::BadKey(block))?);
        }

        let mut sum = [0u8; 4];
        input
            .read_exact(&mut sum)
            .map_err(|_| ReadError::Truncated(block))?;
        if u32::from_le_bytes(sum) != block_sum(&payload) {
            return Err(ReadError::BadChecksum(block));
        }

        batches.push(AccessLogBatch {
            vbid: Vbid(u16::from_le_bytes(vbid)),
            keys,
        });
        block += 1;
    }
    Ok(batches)
}
