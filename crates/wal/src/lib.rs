//! Write-ahead log for the storage layer.
//!
//! Records are appended to an in-memory buffer and flushed to disk by a
//! background thread; `flush(lsn)` blocks until everything up to `lsn` is
//! durable. An LSN is a byte offset into the log file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, mpsc};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

pub type Lsn = u64;
pub type TxnId = u64;
pub type PageId = u64;

const INVALID_LSN: Lsn = u64::MAX;
const DEFAULT_LOG_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("wal io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wal corruption: {0}")]
    Corrupt(String),
    #[error("wal channel closed")]
    ChannelClosed,
}

pub type WalResult<T> = Result<T, WalError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRecordType {
    Begin,
    Commit,
    Abort,
    PageUpdate,
}

impl LogRecordType {
    fn to_byte(self) -> u8 {
        match self {
            LogRecordType::Begin => 1,
            LogRecordType::Commit => 2,
            LogRecordType::Abort => 3,
            LogRecordType::PageUpdate => 4,
        }
    }

    fn from_byte(value: u8) -> WalResult<Self> {
        match value {
            1 => Ok(LogRecordType::Begin),
            2 => Ok(LogRecordType::Commit),
            3 => Ok(LogRecordType::Abort),
            4 => Ok(LogRecordType::PageUpdate),
            _ => Err(WalError::Corrupt(format!(
                "invalid log record type {}",
                value
            ))),
        }
    }
}

/// Payload carried by a log record.
#[derive(Debug, Clone)]
pub enum LogPayload {
    None,
    PageUpdate {
        page_id: PageId,
        offset: u32,
        before: Vec<u8>,
        after: Vec<u8>,
    },
}

/// A single log record. The `lsn` field is assigned by the log manager on
/// append; the value passed in is ignored.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub prev_lsn: Option<Lsn>,
    pub record_type: LogRecordType,
    pub payload: LogPayload,
}

impl LogRecord {
    pub fn begin(txn_id: TxnId) -> Self {
        Self::control(txn_id, None, LogRecordType::Begin)
    }

    pub fn commit(txn_id: TxnId, prev_lsn: Option<Lsn>) -> Self {
        Self::control(txn_id, prev_lsn, LogRecordType::Commit)
    }

    pub fn abort(txn_id: TxnId, prev_lsn: Option<Lsn>) -> Self {
        Self::control(txn_id, prev_lsn, LogRecordType::Abort)
    }

    fn control(txn_id: TxnId, prev_lsn: Option<Lsn>, record_type: LogRecordType) -> Self {
        Self {
            lsn: 0,
            txn_id,
            prev_lsn,
            record_type,
            payload: LogPayload::None,
        }
    }

    pub fn page_update(
        txn_id: TxnId,
        prev_lsn: Option<Lsn>,
        page_id: PageId,
        offset: u32,
        before: Vec<u8>,
        after: Vec<u8>,
    ) -> Self {
        Self {
            lsn: 0,
            txn_id,
            prev_lsn,
            record_type: LogRecordType::PageUpdate,
            payload: LogPayload::PageUpdate {
                page_id,
                offset,
                before,
                after,
            },
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(self.record_type.to_byte());
        body.extend_from_slice(&self.lsn.to_le_bytes());
        body.extend_from_slice(&self.txn_id.to_le_bytes());
        body.extend_from_slice(&self.prev_lsn.unwrap_or(INVALID_LSN).to_le_bytes());
        if let LogPayload::PageUpdate {
            page_id,
            offset,
            before,
            after,
        } = &self.payload
        {
            body.extend_from_slice(&page_id.to_le_bytes());
            body.extend_from_slice(&offset.to_le_bytes());
            body.extend_from_slice(&(before.len() as u32).to_le_bytes());
            body.extend_from_slice(&(after.len() as u32).to_le_bytes());
            body.extend_from_slice(before);
            body.extend_from_slice(after);
        }
        let mut buffer = Vec::with_capacity(4 + body.len());
        buffer.extend_from_slice(&((4 + body.len()) as u32).to_le_bytes());
        buffer.extend_from_slice(&body);
        buffer
    }

    /// Decodes a record body (the bytes following the length prefix).
    pub fn from_bytes(bytes: &[u8]) -> WalResult<Self> {
        if bytes.len() < 1 + 8 + 8 + 8 {
            return Err(WalError::Corrupt("log record too small".to_string()));
        }
        let record_type = LogRecordType::from_byte(bytes[0])?;
        let lsn = read_u64(&bytes[1..9]);
        let txn_id = read_u64(&bytes[9..17]);
        let prev_raw = read_u64(&bytes[17..25]);
        let prev_lsn = (prev_raw != INVALID_LSN).then_some(prev_raw);
        let payload = match record_type {
            LogRecordType::PageUpdate => {
                let mut offset = 25;
                if bytes.len() < offset + 8 + 4 + 4 + 4 {
                    return Err(WalError::Corrupt(
                        "page update record truncated".to_string(),
                    ));
                }
                let page_id = read_u64(&bytes[offset..offset + 8]);
                offset += 8;
                let write_offset = read_u32(&bytes[offset..offset + 4]);
                offset += 4;
                let before_len = read_u32(&bytes[offset..offset + 4]) as usize;
                offset += 4;
                let after_len = read_u32(&bytes[offset..offset + 4]) as usize;
                offset += 4;
                if bytes.len() < offset + before_len + after_len {
                    return Err(WalError::Corrupt("page update bytes truncated".to_string()));
                }
                let before = bytes[offset..offset + before_len].to_vec();
                offset += before_len;
                let after = bytes[offset..offset + after_len].to_vec();
                LogPayload::PageUpdate {
                    page_id,
                    offset: write_offset,
                    before,
                    after,
                }
            }
            _ => LogPayload::None,
        };
        Ok(LogRecord {
            lsn,
            txn_id,
            prev_lsn,
            record_type,
            payload,
        })
    }
}

/// Append/flush interface shared by every writer of the log.
#[derive(Clone)]
pub struct LogManager {
    state: Arc<Mutex<LogState>>,
    condvar: Arc<Condvar>,
    sender: mpsc::Sender<FlushRequest>,
}

struct FlushRequest {
    start_lsn: Lsn,
    end_lsn: Lsn,
    bytes: Vec<u8>,
}

struct LogState {
    active: Vec<u8>,
    flushing: Vec<u8>,
    active_start_lsn: Lsn,
    next_lsn: Lsn,
    flushed_lsn: Lsn,
    flushing_in_progress: bool,
    buffer_size: usize,
    last_error: Option<WalError>,
}

impl LogState {
    fn ensure_ok(&self) -> WalResult<()> {
        if let Some(error) = &self.last_error {
            return Err(WalError::Corrupt(error.to_string()));
        }
        Ok(())
    }
}

impl LogManager {
    pub fn open(path: impl AsRef<Path>) -> WalResult<Self> {
        Self::open_with_buffer(path, DEFAULT_LOG_BUFFER_SIZE)
    }

    pub fn open_with_buffer(path: impl AsRef<Path>, buffer_size: usize) -> WalResult<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        file.seek(SeekFrom::End(0))?;
        let state = Arc::new(Mutex::new(LogState {
            active: Vec::with_capacity(buffer_size),
            flushing: Vec::with_capacity(buffer_size),
            active_start_lsn: len,
            next_lsn: len,
            flushed_lsn: len,
            flushing_in_progress: false,
            buffer_size,
            last_error: None,
        }));
        let condvar = Arc::new(Condvar::new());
        let (sender, receiver) = mpsc::channel();
        let flusher_state = Arc::clone(&state);
        let flusher_condvar = Arc::clone(&condvar);
        std::thread::spawn(move || {
            for request in receiver {
                let result = write_flush_request(&mut file, &request);
                let mut state = flusher_state.lock();
                if let Err(error) = result {
                    state.last_error = Some(error);
                } else {
                    state.flushed_lsn = state.flushed_lsn.max(request.end_lsn);
                }
                state.flushing.clear();
                state.flushing_in_progress = false;
                flusher_condvar.notify_all();
            }
        });
        Ok(Self {
            state,
            condvar,
            sender,
        })
    }

    /// Appends a record and returns its assigned LSN. The record is only
    /// buffered; call `flush` to make it durable.
    pub fn append(&self, mut record: LogRecord) -> WalResult<Lsn> {
        let mut state = self.state.lock();
        state.ensure_ok()?;
        record.lsn = state.next_lsn;
        let bytes = record.to_bytes();
        if state.active.len() + bytes.len() > state.buffer_size {
            self.flush_active_locked(&mut state)?;
        }
        let lsn = record.lsn;
        state.active.extend_from_slice(&bytes);
        state.next_lsn += bytes.len() as u64;
        Ok(lsn)
    }

    /// Blocks until every record up to `lsn` is durable on disk.
    pub fn flush(&self, lsn: Lsn) -> WalResult<()> {
        let mut state = self.state.lock();
        state.ensure_ok()?;
        if lsn <= state.flushed_lsn {
            return Ok(());
        }
        if lsn >= state.active_start_lsn {
            self.flush_active_locked(&mut state)?;
        }
        while state.flushed_lsn < lsn {
            self.condvar.wait(&mut state);
            state.ensure_ok()?;
        }
        Ok(())
    }

    pub fn flushed_lsn(&self) -> Lsn {
        self.state.lock().flushed_lsn
    }

    fn flush_active_locked(
        &self,
        state: &mut parking_lot::MutexGuard<'_, LogState>,
    ) -> WalResult<()> {
        if state.active.is_empty() {
            return Ok(());
        }
        while state.flushing_in_progress {
            self.condvar.wait(state);
            state.ensure_ok()?;
        }
        let start_lsn = state.active_start_lsn;
        // Swap the buffers so appends can continue while the flusher works.
        let mut recycled = std::mem::take(&mut state.active);
        std::mem::swap(&mut recycled, &mut state.flushing);
        recycled.clear();
        state.active = recycled;
        let end_lsn = start_lsn + state.flushing.len() as u64;
        state.active_start_lsn = end_lsn;
        state.flushing_in_progress = true;
        let bytes = state.flushing.clone();
        self.sender
            .send(FlushRequest {
                start_lsn,
                end_lsn,
                bytes,
            })
            .map_err(|_| WalError::ChannelClosed)?;
        Ok(())
    }
}

fn write_flush_request(file: &mut File, request: &FlushRequest) -> WalResult<()> {
    file.seek(SeekFrom::Start(request.start_lsn))?;
    file.write_all(&request.bytes)?;
    file.sync_data()?;
    Ok(())
}

/// Sequential reader over a log file, for recovery scans.
pub struct LogReader {
    file: File,
    offset: u64,
}

impl LogReader {
    pub fn open(path: impl AsRef<Path>) -> WalResult<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self { file, offset: 0 })
    }

    pub fn seek(&mut self, lsn: Lsn) -> WalResult<()> {
        self.offset = lsn;
        self.file.seek(SeekFrom::Start(lsn))?;
        Ok(())
    }

    pub fn next_record(&mut self) -> WalResult<Option<LogRecord>> {
        let mut len_bytes = [0u8; 4];
        let bytes_read = self.file.read(&mut len_bytes)?;
        if bytes_read == 0 {
            return Ok(None);
        }
        if bytes_read < 4 {
            return Err(WalError::Corrupt("log record length truncated".to_string()));
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len < 4 {
            return Err(WalError::Corrupt("invalid log record length".to_string()));
        }
        let mut body = vec![0u8; len - 4];
        self.file.read_exact(&mut body)?;
        self.offset += len as u64;
        let record = LogRecord::from_bytes(&body)?;
        Ok(Some(record))
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut array = [0u8; 8];
    array.copy_from_slice(bytes);
    u64::from_le_bytes(array)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut array = [0u8; 4];
    array.copy_from_slice(bytes);
    u32::from_le_bytes(array)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    struct TestContext {
        path: PathBuf,
    }

    impl TestContext {
        fn new(test_name: &str) -> Self {
            let path = std::env::temp_dir().join(format!("tidepool_wal_{}.log", test_name));
            if path.exists() {
                let _ = fs::remove_file(&path);
            }
            Self { path }
        }
    }

    impl Drop for TestContext {
        fn drop(&mut self) {
            let _ = fs::remove_file(&self.path);
        }
    }

    #[test]
    fn append_assigns_increasing_lsns() {
        let ctx = TestContext::new("lsn_order");
        let manager = LogManager::open(&ctx.path).unwrap();
        let first = manager.append(LogRecord::begin(1)).unwrap();
        let second = manager.append(LogRecord::commit(1, Some(first))).unwrap();
        assert!(second > first);
    }

    #[test]
    fn flush_makes_records_readable() {
        let ctx = TestContext::new("round_trip");
        let manager = LogManager::open_with_buffer(&ctx.path, 128).unwrap();
        let begin_lsn = manager.append(LogRecord::begin(7)).unwrap();
        let update_lsn = manager
            .append(LogRecord::page_update(
                7,
                Some(begin_lsn),
                42,
                12,
                vec![1, 2],
                vec![3, 4],
            ))
            .unwrap();
        let commit_lsn = manager
            .append(LogRecord::commit(7, Some(update_lsn)))
            .unwrap();
        manager.flush(commit_lsn).unwrap();
        assert!(manager.flushed_lsn() > commit_lsn);

        let mut reader = LogReader::open(&ctx.path).unwrap();
        let mut seen = Vec::new();
        while let Some(record) = reader.next_record().unwrap() {
            seen.push((record.lsn, record.record_type));
        }
        assert_eq!(
            seen,
            vec![
                (begin_lsn, LogRecordType::Begin),
                (update_lsn, LogRecordType::PageUpdate),
                (commit_lsn, LogRecordType::Commit),
            ]
        );
    }

    #[test]
    fn page_update_payload_survives_round_trip() {
        let ctx = TestContext::new("payload");
        let manager = LogManager::open(&ctx.path).unwrap();
        let lsn = manager
            .append(LogRecord::page_update(
                3,
                None,
                9,
                128,
                vec![0xAA; 16],
                vec![0xBB; 16],
            ))
            .unwrap();
        manager.flush(lsn).unwrap();

        let mut reader = LogReader::open(&ctx.path).unwrap();
        let record = reader.next_record().unwrap().expect("missing record");
        assert_eq!(record.txn_id, 3);
        assert_eq!(record.prev_lsn, None);
        match record.payload {
            LogPayload::PageUpdate {
                page_id,
                offset,
                before,
                after,
            } => {
                assert_eq!(page_id, 9);
                assert_eq!(offset, 128);
                assert_eq!(before, vec![0xAA; 16]);
                assert_eq!(after, vec![0xBB; 16]);
            }
            _ => panic!("expected page update payload"),
        }
    }

    #[test]
    fn small_buffer_rolls_over_to_flusher() {
        let ctx = TestContext::new("rollover");
        // Buffer far smaller than the record volume forces mid-append flushes.
        let manager = LogManager::open_with_buffer(&ctx.path, 64).unwrap();
        let mut last = 0;
        for txn in 0..32u64 {
            last = manager.append(LogRecord::begin(txn)).unwrap();
        }
        manager.flush(last).unwrap();

        let mut reader = LogReader::open(&ctx.path).unwrap();
        let mut count = 0;
        while let Some(record) = reader.next_record().unwrap() {
            assert_eq!(record.record_type, LogRecordType::Begin);
            count += 1;
        }
        assert_eq!(count, 32);
    }

    #[test]
    fn reopen_continues_after_existing_records() {
        let ctx = TestContext::new("reopen");
        let first_lsn;
        {
            let manager = LogManager::open(&ctx.path).unwrap();
            first_lsn = manager.append(LogRecord::begin(1)).unwrap();
            manager.flush(first_lsn).unwrap();
        }
        let manager = LogManager::open(&ctx.path).unwrap();
        let next_lsn = manager
            .append(LogRecord::commit(1, Some(first_lsn)))
            .unwrap();
        assert!(next_lsn > first_lsn);
        manager.flush(next_lsn).unwrap();

        let mut reader = LogReader::open(&ctx.path).unwrap();
        let mut types = Vec::new();
        while let Some(record) = reader.next_record().unwrap() {
            types.push(record.record_type);
        }
        assert_eq!(types, vec![LogRecordType::Begin, LogRecordType::Commit]);
    }
}
