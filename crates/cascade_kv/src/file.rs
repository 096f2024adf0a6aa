//! File-backed engine: per-table append-only logs replayed on open.

use crate::engine::{BatchOp, KvEngine, KvEntry, KvTable, ScanRange};
use crate::error::{KvError, KvResult};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Magic bytes at the start of every log frame.
const FRAME_MAGIC: [u8; 4] = *b"CKVF";

/// Current log format version.
const FRAME_VERSION: u16 = 1;

/// Fixed bytes before the payload: magic (4) + version (2) + op (1) +
/// key length (4) + value length (4).
const FRAME_HEADER: usize = 15;

/// CRC trailer size.
const CRC_SIZE: usize = 4;

const OP_PUT: u8 = 1;
const OP_DEL: u8 = 2;
const OP_COMMIT: u8 = 3;

/// Advisory lock file inside the engine directory.
const LOCK_FILE: &str = "LOCK";

/// A file-backed KV engine.
///
/// Each table is one append-only log file. Mutations are framed records;
/// a batch is its operations followed by a commit frame, and replay only
/// applies operations whose commit frame made it to disk, so a torn tail
/// is discarded whole. The directory carries an advisory lock to keep
/// the single-writer assumption honest across processes.
pub struct FileEngine {
    dir: PathBuf,
    tables: RwLock<HashMap<String, Arc<FileTable>>>,
    _lock_file: File,
}

impl FileEngine {
    /// Opens (creating if needed) an engine rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::Locked`] if another process holds the engine
    /// lock, or an I/O error if the directory cannot be prepared.
    pub fn open(dir: &Path) -> KvResult<Self> {
        fs::create_dir_all(dir)?;
        let lock_path = dir.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(KvError::Locked {
                path: dir.display().to_string(),
            });
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            tables: RwLock::new(HashMap::new()),
            _lock_file: lock_file,
        })
    }
}

impl std::fmt::Debug for FileEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileEngine")
            .field("dir", &self.dir)
            .field("tables", &self.tables.read().len())
            .finish_non_exhaustive()
    }
}

impl KvEngine for FileEngine {
    fn open(&self, name: &str) -> KvResult<Arc<dyn KvTable>> {
        if let Some(table) = self.tables.read().get(name) {
            return Ok(Arc::clone(table) as Arc<dyn KvTable>);
        }
        let mut tables = self.tables.write();
        if let Some(table) = tables.get(name) {
            return Ok(Arc::clone(table) as Arc<dyn KvTable>);
        }
        let path = self.dir.join(format!("{name}.log"));
        let table = Arc::new(FileTable::open(name, &path)?);
        tables.insert(name.to_string(), Arc::clone(&table));
        Ok(table)
    }
}

struct FileTable {
    name: String,
    path: PathBuf,
    rows: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    log: Mutex<File>,
}

impl FileTable {
    fn open(name: &str, path: &Path) -> KvResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        let mut data = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut data)?;

        let (rows, durable_len) = replay(&data);
        if durable_len < data.len() as u64 {
            // Torn or corrupt tail from an interrupted write; drop it so
            // the next append starts at a frame boundary.
            file.set_len(durable_len)?;
            file.seek(SeekFrom::End(0))?;
        }

        Ok(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            rows: RwLock::new(rows),
            log: Mutex::new(file),
        })
    }

    fn append_frames(&self, ops: &[BatchOp], flush: bool) -> KvResult<()> {
        let mut buf = Vec::new();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => encode_frame(&mut buf, OP_PUT, key, value),
                BatchOp::Del { key } => encode_frame(&mut buf, OP_DEL, key, &[]),
            }
        }
        encode_frame(&mut buf, OP_COMMIT, &[], &[]);

        let mut log = self.log.lock();
        log.write_all(&buf)?;
        if flush {
            log.flush()?;
            log.sync_data()?;
        }
        Ok(())
    }

    fn apply(&self, ops: &[BatchOp]) {
        let mut rows = self.rows.write();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    rows.insert(key.clone(), value.clone());
                }
                BatchOp::Del { key } => {
                    rows.remove(key);
                }
            }
        }
    }
}

impl KvTable for FileTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        Ok(self.rows.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> KvResult<()> {
        let ops = [BatchOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        }];
        self.append_frames(&ops, false)?;
        self.apply(&ops);
        Ok(())
    }

    fn remove_sync(&self, key: &[u8]) -> KvResult<()> {
        let ops = [BatchOp::Del { key: key.to_vec() }];
        self.append_frames(&ops, true)?;
        self.apply(&ops);
        Ok(())
    }

    fn batch(&self, ops: Vec<BatchOp>) -> KvResult<()> {
        self.append_frames(&ops, true)?;
        self.apply(&ops);
        Ok(())
    }

    fn scan(&self, range: &ScanRange) -> KvResult<Vec<KvEntry>> {
        let (start, end) = range.bounds();
        let rows = self.rows.read();
        Ok(rows
            .range((start, end))
            .map(|(k, v)| KvEntry {
                key: k.clone(),
                value: if range.values { v.clone() } else { Vec::new() },
            })
            .collect())
    }

    fn clear(&self) -> KvResult<()> {
        let mut rows = self.rows.write();
        let log = self.log.lock();
        log.set_len(0)?;
        log.sync_data()?;
        rows.clear();
        Ok(())
    }

    fn wait_for_all_writes(&self) -> KvResult<()> {
        let mut log = self.log.lock();
        log.flush()?;
        log.sync_data()?;
        Ok(())
    }
}

impl std::fmt::Debug for FileTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTable")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn encode_frame(buf: &mut Vec<u8>, op: u8, key: &[u8], value: &[u8]) {
    let start = buf.len();
    buf.extend_from_slice(&FRAME_MAGIC);
    buf.extend_from_slice(&FRAME_VERSION.to_le_bytes());
    buf.push(op);
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    let crc = crc32(&buf[start..]);
    buf.extend_from_slice(&crc.to_le_bytes());
}

/// Replays the log, returning the rows and the byte length of the last
/// fully committed batch. Frames after the last commit, and any torn or
/// corrupt frame, are ignored.
fn replay(data: &[u8]) -> (BTreeMap<Vec<u8>, Vec<u8>>, u64) {
    let mut rows = BTreeMap::new();
    let mut staged: Vec<BatchOp> = Vec::new();
    let mut offset = 0usize;
    let mut durable = 0usize;

    while let Some((op, key, value, next)) = decode_frame(data, offset) {
        match op {
            OP_PUT => staged.push(BatchOp::Put { key, value }),
            OP_DEL => staged.push(BatchOp::Del { key }),
            OP_COMMIT => {
                for op in staged.drain(..) {
                    match op {
                        BatchOp::Put { key, value } => {
                            rows.insert(key, value);
                        }
                        BatchOp::Del { key } => {
                            rows.remove(&key);
                        }
                    }
                }
                durable = next;
            }
            _ => break,
        }
        offset = next;
    }

    (rows, durable as u64)
}

fn decode_frame(data: &[u8], offset: usize) -> Option<(u8, Vec<u8>, Vec<u8>, usize)> {
    let header_end = offset.checked_add(FRAME_HEADER)?;
    if header_end > data.len() {
        return None;
    }
    if data[offset..offset + 4] != FRAME_MAGIC {
        return None;
    }
    let version = u16::from_le_bytes([data[offset + 4], data[offset + 5]]);
    if version != FRAME_VERSION {
        return None;
    }
    let op = data[offset + 6];
    let key_len = u32::from_le_bytes(data[offset + 7..offset + 11].try_into().ok()?) as usize;
    let value_len = u32::from_le_bytes(data[offset + 11..offset + 15].try_into().ok()?) as usize;
    let payload_end = header_end.checked_add(key_len)?.checked_add(value_len)?;
    let frame_end = payload_end.checked_add(CRC_SIZE)?;
    if frame_end > data.len() {
        return None;
    }
    let expected = u32::from_le_bytes(data[payload_end..frame_end].try_into().ok()?);
    if crc32(&data[offset..payload_end]) != expected {
        return None;
    }
    let key = data[header_end..header_end + key_len].to_vec();
    let value = data[header_end + key_len..payload_end].to_vec();
    Some((op, key, value, frame_end))
}

/// CRC-32 (IEEE) over `data`.
fn crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut bit = 0;
            while bit < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn put(key: &[u8], value: &[u8]) -> BatchOp {
        BatchOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        }
    }

    #[test]
    fn reopen_recovers_rows() {
        let dir = tempdir().unwrap();
        {
            let engine = FileEngine::open(dir.path()).unwrap();
            let table = KvEngine::open(&engine, "t").unwrap();
            table.batch(vec![put(b"a", b"1"), put(b"b", b"2")]).unwrap();
            table
                .batch(vec![BatchOp::Del { key: b"a".to_vec() }])
                .unwrap();
        }
        let engine = FileEngine::open(dir.path()).unwrap();
        let table = KvEngine::open(&engine, "t").unwrap();
        assert_eq!(table.get(b"a").unwrap(), None);
        assert_eq!(table.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn lock_excludes_second_engine() {
        let dir = tempdir().unwrap();
        let _engine = FileEngine::open(dir.path()).unwrap();
        assert!(matches!(
            FileEngine::open(dir.path()),
            Err(KvError::Locked { .. })
        ));
    }

    #[test]
    fn torn_tail_is_discarded_whole() {
        let dir = tempdir().unwrap();
        let log_path = {
            let engine = FileEngine::open(dir.path()).unwrap();
            let table = KvEngine::open(&engine, "t").unwrap();
            table.batch(vec![put(b"a", b"1")]).unwrap();
            table.batch(vec![put(b"b", b"2")]).unwrap();
            dir.path().join("t.log")
        };

        // Chop bytes off the second batch's tail.
        let data = fs::read(&log_path).unwrap();
        fs::write(&log_path, &data[..data.len() - 3]).unwrap();

        let engine = FileEngine::open(dir.path()).unwrap();
        let table = KvEngine::open(&engine, "t").unwrap();
        assert_eq!(table.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(table.get(b"b").unwrap(), None, "torn batch must not apply");
    }

    #[test]
    fn clear_truncates_log() {
        let dir = tempdir().unwrap();
        {
            let engine = FileEngine::open(dir.path()).unwrap();
            let table = KvEngine::open(&engine, "t").unwrap();
            table.batch(vec![put(b"a", b"1")]).unwrap();
            table.clear().unwrap();
        }
        let engine = FileEngine::open(dir.path()).unwrap();
        let table = KvEngine::open(&engine, "t").unwrap();
        assert_eq!(table.get(b"a").unwrap(), None);
        assert!(table.scan(&ScanRange::all()).unwrap().is_empty());
    }
}
