//! Append-only write-ahead log.
//!
//! Frame layout: `[4-byte CRC32][4-byte length][JSON WalEntry]\n`, integers
//! little-endian. Replay returns every intact frame in order and stops at
//! the first torn or corrupt one.

use crate::entry::WalEntry;
use crc32fast::Hasher;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("WAL serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Fsync policy for the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// Fsync after every append.
    Always,
    /// Fsync when the owner calls [`Wal::sync`].
    Batch,
    /// Leave flushing to the OS.
    None,
}

impl FsyncPolicy {
    pub fn from_str_config(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "always" => Self::Always,
            "none" => Self::None,
            _ => Self::Batch,
        }
    }
}

#[derive(Debug)]
pub struct Wal {
    writer: BufWriter<File>,
    fsync: FsyncPolicy,
    entries_written: u64,
}

impl Wal {
    /// Open or create a WAL file for appending.
    pub fn open(path: &Path, fsync: FsyncPolicy) -> Result<Self, WalError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            fsync,
            entries_written: 0,
        })
    }

    pub fn append(&mut self, entry: &WalEntry) -> Result<(), WalError> {
        let payload = serde_json::to_vec(entry)?;
        let crc = checksum(&payload);

        self.writer.write_all(&crc.to_le_bytes())?;
        self.writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.writer.write_all(&payload)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;

        if self.fsync == FsyncPolicy::Always {
            self.writer.get_ref().sync_all()?;
        }

        self.entries_written += 1;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Number of entries appended since open.
    pub fn entries_written(&self) -> u64 {
        self.entries_written
    }

    /// Read back every intact entry of a WAL file. A missing file is empty.
    pub fn replay(path: &Path) -> Result<Vec<WalEntry>, WalError> {
        Ok(Self::scan(path)?.0)
    }

    /// Replay, then cut the file back to its last intact frame so later
    /// appends are not stranded behind a damaged tail.
    pub fn recover(path: &Path) -> Result<Vec<WalEntry>, WalError> {
        let (entries, intact) = Self::scan(path)?;
        if let Ok(meta) = std::fs::metadata(path) {
            if meta.len() > intact {
                tracing::warn!(
                    "truncating WAL {:?} from {} to {} bytes",
                    path,
                    meta.len(),
                    intact
                );
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(intact)?;
                file.sync_all()?;
            }
        }
        Ok(entries)
    }

    /// Intact entries plus the byte length they occupy.
    fn scan(path: &Path) -> Result<(Vec<WalEntry>, u64), WalError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((vec![], 0)),
            Err(e) => return Err(WalError::Io(e)),
        };

        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        let mut intact = 0u64;

        while let Some(payload) = read_frame(&mut reader, entries.len())? {
            entries.push(serde_json::from_slice(&payload)?);
            intact += FRAME_OVERHEAD + payload.len() as u64;
        }
        Ok((entries, intact))
    }
}

/// Header plus trailing newline.
const FRAME_OVERHEAD: u64 = 9;

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Read one frame. `Ok(None)` means clean EOF or a damaged tail.
fn read_frame<R: Read>(reader: &mut R, index: usize) -> Result<Option<Vec<u8>>, WalError> {
    let mut header = [0u8; 8];
    match read_exact_or_eof(reader, &mut header)? {
        Fill::Full => {}
        Fill::Empty => return Ok(None),
        Fill::Partial => {
            tracing::warn!("WAL header torn at entry {}; stopping replay", index);
            return Ok(None);
        }
    }
    let expected_crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

    // payload + trailing newline
    let mut body = vec![0u8; len + 1];
    if read_exact_or_eof(reader, &mut body)? != Fill::Full {
        tracing::warn!("WAL truncated mid-entry at entry {}; stopping replay", index);
        return Ok(None);
    }
    body.truncate(len);

    let actual_crc = checksum(&body);
    if actual_crc != expected_crc {
        tracing::warn!(
            "WAL CRC mismatch at entry {}: expected {:#010x}, got {:#010x}; stopping replay",
            index,
            expected_crc,
            actual_crc
        );
        return Ok(None);
    }
    Ok(Some(body))
}

#[derive(Debug, PartialEq, Eq)]
enum Fill {
    Full,
    Empty,
    Partial,
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<Fill> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(match filled {
        0 => Fill::Empty,
        n if n == buf.len() => Fill::Full,
        _ => Fill::Partial,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_wal_write_and_replay() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("test.wal");

        {
            let mut wal = Wal::open(&wal_path, FsyncPolicy::Always).unwrap();
            wal.append(&WalEntry::set("k1", "v1")).unwrap();
            wal.append(&WalEntry::set("k2", "v2")).unwrap();
            wal.append(&WalEntry::delete("k1")).unwrap();
            assert_eq!(wal.entries_written(), 3);
        }

        let entries = Wal::replay(&wal_path).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].key(), "k1");
        assert_eq!(entries[1].key(), "k2");
        assert!(matches!(entries[2], WalEntry::Delete { .. }));
        match &entries[1] {
            WalEntry::Set { value, .. } => assert_eq!(value, "v2"),
            other => panic!("unexpected entry {:?}", other),
        }
    }

    #[test]
    fn test_wal_replay_missing_file() {
        let dir = TempDir::new().unwrap();
        let entries = Wal::replay(&dir.path().join("absent.wal")).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_wal_replay_truncated_tail() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("trunc.wal");

        {
            let mut wal = Wal::open(&wal_path, FsyncPolicy::Always).unwrap();
            wal.append(&WalEntry::set("k1", "v1")).unwrap();
            wal.append(&WalEntry::set("k2", "v2")).unwrap();
            wal.append(&WalEntry::set("k3", "v3")).unwrap();
        }
        {
            let file = OpenOptions::new().write(true).open(&wal_path).unwrap();
            let len = file.metadata().unwrap().len();
            file.set_len(len - 5).unwrap();
        }

        let entries = Wal::replay(&wal_path).unwrap();
        assert_eq!(entries.len(), 2, "torn third entry should be dropped");
        assert_eq!(entries[1].key(), "k2");
    }

    #[test]
    fn test_recover_truncates_so_appends_survive() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("recover.wal");

        {
            let mut wal = Wal::open(&wal_path, FsyncPolicy::Always).unwrap();
            wal.append(&WalEntry::set("k1", "v1")).unwrap();
            wal.append(&WalEntry::set("k2", "v2")).unwrap();
        }
        {
            let file = OpenOptions::new().write(true).open(&wal_path).unwrap();
            let len = file.metadata().unwrap().len();
            file.set_len(len - 4).unwrap();
        }

        assert_eq!(Wal::recover(&wal_path).unwrap().len(), 1);
        {
            let mut wal = Wal::open(&wal_path, FsyncPolicy::Always).unwrap();
            wal.append(&WalEntry::set("k3", "v3")).unwrap();
        }

        let entries = Wal::replay(&wal_path).unwrap();
        let keys: Vec<&str> = entries.iter().map(|e| e.key()).collect();
        assert_eq!(keys, vec!["k1", "k3"]);
    }

    #[test]
    fn test_wal_replay_stops_at_corrupt_payload() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("crc.wal");

        {
            let mut wal = Wal::open(&wal_path, FsyncPolicy::Always).unwrap();
            wal.append(&WalEntry::set("k1", "v1")).unwrap();
            wal.append(&WalEntry::set("k2", "v2")).unwrap();
        }
        // Flip a byte inside the second payload.
        let mut bytes = std::fs::read(&wal_path).unwrap();
        let last_payload_byte = bytes.len() - 3;
        bytes[last_payload_byte] ^= 0xFF;
        std::fs::write(&wal_path, bytes).unwrap();

        let entries = Wal::replay(&wal_path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key(), "k1");
    }

    #[test]
    fn test_fsync_policy_from_config() {
        assert_eq!(FsyncPolicy::from_str_config("ALWAYS"), FsyncPolicy::Always);
        assert_eq!(FsyncPolicy::from_str_config("none"), FsyncPolicy::None);
        assert_eq!(FsyncPolicy::from_str_config("whatever"), FsyncPolicy::Batch);
    }
}
