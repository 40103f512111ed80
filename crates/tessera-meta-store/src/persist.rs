//! Snapshot persistence
//!
//! A stored snapshot is a directory with three files:
//!
//! ```text
//! snapshot/
//!   inode    [u32 BE len][record] ...   records in inode order
//!   dentry   [u32 BE len][record] ...   records in (parent, name) order
//!   meta     fixed-size SnapshotHeader, written last
//! ```
//!
//! Records are encoded with the codec named in the header, so loading
//! never depends on the loader's configured marshal version.
//!
//! Stores are atomic: files are written and synced under `.snapshot_tmp/`,
//! the current `snapshot/` is moved aside to `.snapshot_backup/`, the new
//! directory is renamed into place and the backup is removed. A crash at
//! any step leaves one complete snapshot that [`load_snapshot`] can find.

use crate::codec::{MarshalCodec, Record, codec, codec_for_tag};
use crate::error::{MetaStoreError, MetaStoreResult};
use crate::snapshot::PartitionSnapshot;
use bytes::Buf;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tessera_common::{Dentry, Inode, MarshalVersion};
use tracing::{debug, warn};

pub const SNAPSHOT_DIR: &str = "snapshot";
pub const SNAPSHOT_TMP_DIR: &str = ".snapshot_tmp";
pub const SNAPSHOT_BACKUP_DIR: &str = ".snapshot_backup";
pub const HEADER_FILE: &str = "meta";
pub const INODE_FILE: &str = "inode";
pub const DENTRY_FILE: &str = "dentry";

/// Upper bound on a single encoded record
const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

/// Header of a stored snapshot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotHeader {
    /// Magic number for validation
    pub magic: u32,
    /// Header layout version
    pub version: u32,
    /// Marshal version tag of the data files
    pub marshal_version: u32,
    /// Index of the last command reflected in the snapshot
    pub apply_index: u64,
    pub inode_count: u64,
    pub dentry_count: u64,
    /// CRC32C of the inode file
    pub inode_crc: u32,
    /// CRC32C of the dentry file
    pub dentry_crc: u32,
    /// Creation time, milliseconds since the Unix epoch
    pub created_at: u64,
}

impl SnapshotHeader {
    pub const MAGIC: u32 = 0x5453_4E50; // "TSNP"
    pub const VERSION: u32 = 1;
    pub const SIZE: usize = 56;

    #[must_use]
    pub fn new(marshal_version: MarshalVersion, apply_index: u64) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            marshal_version: marshal_version.tag(),
            apply_index,
            inode_count: 0,
            dentry_count: 0,
            inode_crc: 0,
            dentry_crc: 0,
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        }
    }

    /// Serialize; the last four bytes are a CRC32C over the rest
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.marshal_version.to_le_bytes());
        buf[12..20].copy_from_slice(&self.apply_index.to_le_bytes());
        buf[20..28].copy_from_slice(&self.inode_count.to_le_bytes());
        buf[28..36].copy_from_slice(&self.dentry_count.to_le_bytes());
        buf[36..40].copy_from_slice(&self.inode_crc.to_le_bytes());
        buf[40..44].copy_from_slice(&self.dentry_crc.to_le_bytes());
        buf[44..52].copy_from_slice(&self.created_at.to_le_bytes());
        let crc = crc32c::crc32c(&buf[..52]);
        buf[52..56].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> MetaStoreResult<Self> {
        if data.len() != Self::SIZE {
            return Err(MetaStoreError::corrupt(format!(
                "header is {} bytes, expected {}",
                data.len(),
                Self::SIZE
            )));
        }
        let u32_at = |at: usize| (&data[at..at + 4]).get_u32_le();
        let u64_at = |at: usize| (&data[at..at + 8]).get_u64_le();

        let magic = u32_at(0);
        if magic != Self::MAGIC {
            return Err(MetaStoreError::corrupt(format!("bad header magic {magic:#010x}")));
        }
        let stored_crc = u32_at(52);
        let computed_crc = crc32c::crc32c(&data[..52]);
        if stored_crc != computed_crc {
            return Err(MetaStoreError::corrupt(format!(
                "header checksum mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"
            )));
        }
        let version = u32_at(4);
        if version != Self::VERSION {
            return Err(MetaStoreError::corrupt(format!("unknown header layout version {version}")));
        }

        Ok(Self {
            magic,
            version,
            marshal_version: u32_at(8),
            apply_index: u64_at(12),
            inode_count: u64_at(20),
            dentry_count: u64_at(28),
            inode_crc: u32_at(36),
            dentry_crc: u32_at(40),
            created_at: u64_at(44),
        })
    }
}

/// Length-prefixed record file writer tracking count and checksum
struct RecordWriter {
    writer: BufWriter<File>,
    buf: Vec<u8>,
    crc: u32,
    count: u64,
}

impl RecordWriter {
    fn create(path: &Path) -> MetaStoreResult<Self> {
        let file = OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            buf: Vec::with_capacity(256),
            crc: 0,
            count: 0,
        })
    }

    fn append<R: Record>(&mut self, codec: &MarshalCodec, record: &R) -> MetaStoreResult<()> {
        self.buf.clear();
        record.marshal(codec, &mut self.buf)?;
        if self.buf.len() > MAX_RECORD_LEN {
            return Err(MetaStoreError::decode(format!(
                "record of {} bytes is too large",
                self.buf.len()
            )));
        }
        let len = u32::try_from(self.buf.len())
            .map_err(|_| MetaStoreError::decode("record length overflow"))?
            .to_be_bytes();
        self.writer.write_all(&len)?;
        self.writer.write_all(&self.buf)?;
        self.crc = crc32c::crc32c_append(self.crc, &len);
        self.crc = crc32c::crc32c_append(self.crc, &self.buf);
        self.count += 1;
        Ok(())
    }

    /// Flush and fsync; returns `(record count, crc)`
    fn finish(mut self) -> MetaStoreResult<(u64, u32)> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok((self.count, self.crc))
    }
}

/// Read into `buf` until it is full or the reader is exhausted
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Stream the records of a data file; returns `(record count, crc)`
fn read_records(
    path: &Path,
    mut on_record: impl FnMut(&[u8]) -> MetaStoreResult<()>,
) -> MetaStoreResult<(u64, u32)> {
    let name = path.file_name().map_or_else(String::new, |n| n.to_string_lossy().into_owned());
    let mut reader = BufReader::new(File::open(path)?);
    let mut buf = Vec::new();
    let mut crc = 0;
    let mut count = 0;

    loop {
        let mut len_buf = [0u8; 4];
        match read_full(&mut reader, &mut len_buf)? {
            0 => break,
            4 => {}
            n => {
                return Err(MetaStoreError::corrupt(format!(
                    "{name}: {n} trailing bytes after record {count}"
                )));
            }
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_RECORD_LEN {
            return Err(MetaStoreError::corrupt(format!(
                "{name}: record {count} claims {len} bytes"
            )));
        }
        buf.resize(len, 0);
        reader.read_exact(&mut buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                MetaStoreError::corrupt(format!("{name}: record {count} is truncated"))
            } else {
                MetaStoreError::Io(e)
            }
        })?;
        crc = crc32c::crc32c_append(crc, &len_buf);
        crc = crc32c::crc32c_append(crc, &buf);
        on_record(&buf)?;
        count += 1;
    }
    Ok((count, crc))
}

fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

/// Write the snapshot's contents under `root` with the given marshal
/// version and atomically make them the current snapshot.
pub fn store_snapshot(
    root: &Path,
    snapshot: &PartitionSnapshot,
    version: MarshalVersion,
) -> MetaStoreResult<SnapshotHeader> {
    let started = Instant::now();
    let tmp = root.join(SNAPSHOT_TMP_DIR);
    if tmp.exists() {
        warn!("removing stale {}", tmp.display());
        fs::remove_dir_all(&tmp)?;
    }
    fs::create_dir_all(&tmp)?;

    let header = match write_snapshot_files(&tmp, snapshot, version) {
        Ok(header) => header,
        Err(e) => {
            if let Err(cleanup) = fs::remove_dir_all(&tmp) {
                warn!("failed to remove {}: {}", tmp.display(), cleanup);
            }
            return Err(e);
        }
    };

    publish(root, &tmp)?;
    debug!(
        "stored snapshot at index {} ({} inodes, {} dentries, {}) in {:?}",
        header.apply_index,
        header.inode_count,
        header.dentry_count,
        version,
        started.elapsed()
    );
    Ok(header)
}

fn write_snapshot_files(
    dir: &Path,
    snapshot: &PartitionSnapshot,
    version: MarshalVersion,
) -> MetaStoreResult<SnapshotHeader> {
    let codec = codec(version);
    let mut header = SnapshotHeader::new(version, snapshot.apply_index());

    let mut inodes = RecordWriter::create(&dir.join(INODE_FILE))?;
    snapshot.inodes().range(None, None, &mut |ino: Inode| {
        inodes.append(codec, &ino)?;
        Ok(true)
    })?;
    (header.inode_count, header.inode_crc) = inodes.finish()?;

    let mut dentries = RecordWriter::create(&dir.join(DENTRY_FILE))?;
    snapshot.dentries().range(None, None, &mut |dentry: Dentry| {
        dentries.append(codec, &dentry)?;
        Ok(true)
    })?;
    (header.dentry_count, header.dentry_crc) = dentries.finish()?;

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(dir.join(HEADER_FILE))?;
    file.write_all(&header.to_bytes())?;
    file.sync_all()?;
    sync_dir(dir)?;
    Ok(header)
}

/// Swap the freshly written directory into place
fn publish(root: &Path, tmp: &Path) -> MetaStoreResult<()> {
    let current = root.join(SNAPSHOT_DIR);
    let backup = root.join(SNAPSHOT_BACKUP_DIR);

    if current.exists() {
        if backup.exists() {
            fs::remove_dir_all(&backup)?;
        }
        fs::rename(&current, &backup)?;
    }
    fs::rename(tmp, &current)?;
    sync_dir(root)?;

    if backup.exists()
        && let Err(e) = fs::remove_dir_all(&backup)
    {
        warn!("failed to remove {}: {}", backup.display(), e);
    }
    Ok(())
}

/// Directory holding the snapshot to load, if any
fn locate(root: &Path) -> Option<PathBuf> {
    let current = root.join(SNAPSHOT_DIR);
    if current.exists() {
        return Some(current);
    }
    let backup = root.join(SNAPSHOT_BACKUP_DIR);
    if backup.exists() {
        warn!("{} missing, loading {}", current.display(), backup.display());
        return Some(backup);
    }
    None
}

/// Read and verify just the header of the current snapshot
pub fn read_header(root: &Path) -> MetaStoreResult<Option<SnapshotHeader>> {
    let Some(dir) = locate(root) else {
        return Ok(None);
    };
    read_header_in(&dir).map(Some)
}

fn read_header_in(dir: &Path) -> MetaStoreResult<SnapshotHeader> {
    let path = dir.join(HEADER_FILE);
    let data = fs::read(&path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            MetaStoreError::corrupt(format!("{} is missing", path.display()))
        } else {
            MetaStoreError::Io(e)
        }
    })?;
    SnapshotHeader::from_bytes(&data)
}

/// Load the current snapshot under `root`, feeding every record to the
/// callbacks in key order. Returns `Ok(None)` if no snapshot was stored.
///
/// The records are decoded with the codec named by the header. Record
/// counts and checksums are verified against the header; a mismatch is
/// reported after the records have been delivered, so callers must treat
/// any error as invalidating everything they received.
pub fn load_snapshot(
    root: &Path,
    mut on_inode: impl FnMut(Inode) -> MetaStoreResult<()>,
    mut on_dentry: impl FnMut(Dentry) -> MetaStoreResult<()>,
) -> MetaStoreResult<Option<SnapshotHeader>> {
    let Some(dir) = locate(root) else {
        return Ok(None);
    };
    let header = read_header_in(&dir)?;
    let codec = codec_for_tag(header.marshal_version)?;

    let (count, crc) =
        read_records(&dir.join(INODE_FILE), |data| on_inode(Inode::unmarshal(codec, data)?))?;
    verify("inode", count, crc, header.inode_count, header.inode_crc)?;

    let (count, crc) =
        read_records(&dir.join(DENTRY_FILE), |data| on_dentry(Dentry::unmarshal(codec, data)?))?;
    verify("dentry", count, crc, header.dentry_count, header.dentry_crc)?;

    debug!(
        "loaded snapshot at index {} ({} inodes, {} dentries, v{})",
        header.apply_index, header.inode_count, header.dentry_count, header.marshal_version
    );
    Ok(Some(header))
}

fn verify(
    what: &str,
    count: u64,
    crc: u32,
    expected_count: u64,
    expected_crc: u32,
) -> MetaStoreResult<()> {
    if crc != expected_crc {
        return Err(MetaStoreError::corrupt(format!(
            "{what} file checksum mismatch: stored {expected_crc:#010x}, computed {crc:#010x}"
        )));
    }
    if count != expected_count {
        return Err(MetaStoreError::corrupt(format!(
            "{what} file holds {count} records, header says {expected_count}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{MemIndex, OrderedIndex};
    use tempfile::tempdir;
    use tessera_common::{DentryKey, ExtentKey, MODE_DIR, MODE_REGULAR};

    struct Fixture {
        inodes: MemIndex<Inode>,
        dentries: MemIndex<Dentry>,
    }

    impl Fixture {
        fn new(n: u64) -> Self {
            let inodes = MemIndex::new();
            let dentries = MemIndex::new();
            inodes.put(Inode::new(1, MODE_DIR | 0o755)).unwrap();
            for id in 2..n + 2 {
                let mut ino = Inode::new(id, MODE_REGULAR | 0o644).with_time(id as i64);
                ino.append_extent(ExtentKey {
                    file_offset: 0,
                    partition_id: 3,
                    extent_id: id,
                    extent_offset: 0,
                    size: 4096,
                    crc: 0,
                });
                inodes.put(ino).unwrap();
                dentries.put(Dentry::new(1, format!("file-{id}"), id, MODE_REGULAR)).unwrap();
            }
            Self { inodes, dentries }
        }

        fn snapshot(&self, apply_index: u64) -> PartitionSnapshot {
            PartitionSnapshot::new(
                apply_index,
                self.inodes.snapshot().unwrap(),
                self.dentries.snapshot().unwrap(),
            )
        }
    }

    fn load_all(root: &Path) -> MetaStoreResult<Option<(SnapshotHeader, Vec<Inode>, Vec<Dentry>)>> {
        let mut inodes = Vec::new();
        let mut dentries = Vec::new();
        let header = load_snapshot(
            root,
            |i| {
                inodes.push(i);
                Ok(())
            },
            |d| {
                dentries.push(d);
                Ok(())
            },
        )?;
        Ok(header.map(|h| (h, inodes, dentries)))
    }

    #[test]
    fn test_header_bytes() {
        let mut header = SnapshotHeader::new(MarshalVersion::V1, 1000);
        header.inode_count = 500;
        header.dentry_crc = 0xabcd;
        let parsed = SnapshotHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.magic, SnapshotHeader::MAGIC);
    }

    #[test]
    fn test_header_checksum_detects_flip() {
        let mut bytes = SnapshotHeader::new(MarshalVersion::V2, 7).to_bytes();
        bytes[14] ^= 0x01;
        assert!(matches!(SnapshotHeader::from_bytes(&bytes), Err(MetaStoreError::Corrupt(_))));
    }

    #[test]
    fn test_no_snapshot() {
        let dir = tempdir().unwrap();
        assert!(load_all(dir.path()).unwrap().is_none());
        assert!(read_header(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_store_and_load_each_version() {
        let fixture = Fixture::new(50);
        for version in [MarshalVersion::V1, MarshalVersion::V2] {
            let dir = tempdir().unwrap();
            let snap = fixture.snapshot(42);
            let stored = store_snapshot(dir.path(), &snap, version).unwrap();
            assert_eq!(stored.inode_count, 51);
            assert_eq!(stored.dentry_count, 50);
            assert_eq!(stored.marshal_version, version.tag());

            let (header, inodes, dentries) = load_all(dir.path()).unwrap().unwrap();
            assert_eq!(header, stored);
            assert_eq!(header.apply_index, 42);
            assert_eq!(inodes.len(), 51);
            assert_eq!(inodes[1], fixture.inodes.get(&2).unwrap().unwrap());
            assert_eq!(
                dentries[0],
                fixture.dentries.get(&DentryKey::new(1, "file-10")).unwrap().unwrap()
            );
            assert!(!dir.path().join(SNAPSHOT_TMP_DIR).exists());
            assert!(!dir.path().join(SNAPSHOT_BACKUP_DIR).exists());
        }
    }

    #[test]
    fn test_second_store_replaces_first() {
        let dir = tempdir().unwrap();
        let fixture = Fixture::new(3);
        store_snapshot(dir.path(), &fixture.snapshot(1), MarshalVersion::V1).unwrap();
        fixture.inodes.delete(&2).unwrap();
        store_snapshot(dir.path(), &fixture.snapshot(2), MarshalVersion::V2).unwrap();

        let (header, inodes, _) = load_all(dir.path()).unwrap().unwrap();
        assert_eq!(header.apply_index, 2);
        assert_eq!(header.marshal_version, 2);
        assert_eq!(inodes.len(), 3);
        assert!(!dir.path().join(SNAPSHOT_BACKUP_DIR).exists());
    }

    #[test]
    fn test_load_falls_back_to_backup() {
        let dir = tempdir().unwrap();
        let fixture = Fixture::new(4);
        store_snapshot(dir.path(), &fixture.snapshot(8), MarshalVersion::V2).unwrap();
        // Crash between moving the old snapshot aside and publishing the new one
        fs::rename(dir.path().join(SNAPSHOT_DIR), dir.path().join(SNAPSHOT_BACKUP_DIR)).unwrap();
        fs::create_dir_all(dir.path().join(SNAPSHOT_TMP_DIR)).unwrap();

        let (header, inodes, _) = load_all(dir.path()).unwrap().unwrap();
        assert_eq!(header.apply_index, 8);
        assert_eq!(inodes.len(), 5);

        // The next store clears both leftovers
        store_snapshot(dir.path(), &fixture.snapshot(9), MarshalVersion::V2).unwrap();
        assert!(!dir.path().join(SNAPSHOT_TMP_DIR).exists());
        assert!(!dir.path().join(SNAPSHOT_BACKUP_DIR).exists());
    }

    #[test]
    fn test_store_from_released_snapshot_fails_cleanly() {
        let dir = tempdir().unwrap();
        let fixture = Fixture::new(2);
        let snap = fixture.snapshot(1);
        snap.close();
        let err = store_snapshot(dir.path(), &snap, MarshalVersion::V2).unwrap_err();
        assert!(matches!(err, MetaStoreError::SnapshotReleased));
        assert!(!dir.path().join(SNAPSHOT_TMP_DIR).exists());
        assert!(!dir.path().join(SNAPSHOT_DIR).exists());
    }

    #[test]
    fn test_corrupt_data_file_detected() {
        let dir = tempdir().unwrap();
        let fixture = Fixture::new(10);
        store_snapshot(dir.path(), &fixture.snapshot(3), MarshalVersion::V2).unwrap();

        let path = dir.path().join(SNAPSHOT_DIR).join(DENTRY_FILE);
        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        fs::write(&path, &data).unwrap();

        let err = load_all(dir.path()).unwrap_err();
        assert!(err.is_data_error(), "unexpected error: {err}");
    }

    #[test]
    fn test_truncated_data_file_detected() {
        let dir = tempdir().unwrap();
        let fixture = Fixture::new(10);
        store_snapshot(dir.path(), &fixture.snapshot(3), MarshalVersion::V1).unwrap();

        let path = dir.path().join(SNAPSHOT_DIR).join(INODE_FILE);
        let data = fs::read(&path).unwrap();
        fs::write(&path, &data[..data.len() - 2]).unwrap();
        assert!(matches!(load_all(dir.path()), Err(MetaStoreError::Corrupt(_))));

        fs::write(&path, [data.as_slice(), &[0u8, 0][..]].concat()).unwrap();
        assert!(matches!(load_all(dir.path()), Err(MetaStoreError::Corrupt(_))));
    }

    #[test]
    fn test_unknown_marshal_tag_rejected() {
        let dir = tempdir().unwrap();
        let fixture = Fixture::new(1);
        let mut header =
            store_snapshot(dir.path(), &fixture.snapshot(1), MarshalVersion::V2).unwrap();
        header.marshal_version = 9;
        fs::write(dir.path().join(SNAPSHOT_DIR).join(HEADER_FILE), header.to_bytes()).unwrap();
        assert!(matches!(load_all(dir.path()), Err(MetaStoreError::UnsupportedVersion(9))));
    }
}
