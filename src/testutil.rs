//! Test doubles shared by the unit tests: a self-describing fixed-width key,
//! an in-memory log, a canned recovery handler, and a scheduler that runs
//! tasks on demand.

use std::fmt;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt};

use crate::error::Result;
use crate::scheduler::{PeriodicTask, Scheduler};
use crate::store::key::{StoreKey, StoreKeyFactory};
use crate::store::log::Log;
use crate::store::message::MessageInfo;
use crate::store::recovery::MessageStoreRecovery;

/// A length-prefixed opaque key: `len:u16 | bytes`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct TestKey {
    bytes: Vec<u8>,
}

impl TestKey {
    pub(crate) fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }
}

impl fmt::Display for TestKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in &self.bytes {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl StoreKey for TestKey {
    fn size_in_bytes(&self) -> usize {
        2 + self.bytes.len()
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size_in_bytes());
        buf.extend_from_slice(&(self.bytes.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.bytes);
        buf
    }
}

pub(crate) struct TestKeyFactory;

impl StoreKeyFactory for TestKeyFactory {
    type Key = TestKey;

    fn get_store_key(&self, stream: &mut dyn Read) -> Result<TestKey> {
        let len = stream.read_u16::<BigEndian>()? as usize;
        let mut bytes = vec![0u8; len];
        stream.read_exact(&mut bytes)?;
        Ok(TestKey { bytes })
    }
}

/// In-memory stand-in for the append-only log. Only offsets matter to the
/// index, so no actual bytes are retained.
pub(crate) struct MemoryLog {
    size_in_bytes: AtomicU64,
    end_offset: AtomicU64,
    flushes: AtomicU64,
}

impl MemoryLog {
    pub(crate) fn new() -> Self {
        Self {
            size_in_bytes: AtomicU64::new(0),
            end_offset: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    /// Pretend `len` bytes were appended, returning the covered span.
    pub(crate) fn append_blob(&self, len: u64) -> crate::store::value::FileSpan {
        let start = self.end_offset.fetch_add(len, Ordering::SeqCst);
        self.size_in_bytes.fetch_max(start + len, Ordering::SeqCst);
        crate::store::value::FileSpan::new(start, start + len).unwrap()
    }

    /// Grow the backing size without moving the write pointer, simulating
    /// bytes that reached the log but were never indexed (crash tail).
    pub(crate) fn set_size_in_bytes(&self, size: u64) {
        self.size_in_bytes.store(size, Ordering::SeqCst);
    }

    pub(crate) fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl Log for MemoryLog {
    fn append(&self, bytes: &[u8]) -> Result<u64> {
        Ok(self.append_blob(bytes.len() as u64).start_offset())
    }

    fn read(&self, _offset: u64, len: u64) -> Result<Vec<u8>> {
        Ok(vec![0u8; len as usize])
    }

    fn log_end_offset(&self) -> u64 {
        self.end_offset.load(Ordering::SeqCst)
    }

    fn set_log_end_offset(&self, offset: u64) -> Result<()> {
        self.end_offset.store(offset, Ordering::SeqCst);
        self.size_in_bytes.fetch_max(offset, Ordering::SeqCst);
        Ok(())
    }

    fn size_in_bytes(&self) -> u64 {
        self.size_in_bytes.load(Ordering::SeqCst)
    }

    fn flush(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Recovery handler that answers queued expectations by exact range and
/// returns nothing otherwise.
pub(crate) struct ListRecovery {
    expectations: Mutex<Vec<(u64, u64, Vec<MessageInfo<TestKey>>)>>,
}

impl ListRecovery {
    pub(crate) fn empty() -> Self {
        Self {
            expectations: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn expect(self, start: u64, end: u64, messages: Vec<MessageInfo<TestKey>>) -> Self {
        self.expectations.lock().unwrap().push((start, end, messages));
        self
    }
}

impl MessageStoreRecovery<TestKeyFactory> for ListRecovery {
    fn recover(
        &self,
        _log: &dyn Log,
        start_offset: u64,
        end_offset: u64,
        _factory: &TestKeyFactory,
    ) -> Result<Vec<MessageInfo<TestKey>>> {
        let mut expectations = self.expectations.lock().unwrap();
        if let Some(pos) = expectations
            .iter()
            .position(|(start, end, _)| *start == start_offset && *end == end_offset)
        {
            let (_, _, messages) = expectations.remove(pos);
            return Ok(messages);
        }
        Ok(Vec::new())
    }
}

/// Scheduler that records registrations and runs them only when asked.
pub(crate) struct ManualScheduler {
    tasks: Mutex<Vec<Arc<dyn PeriodicTask>>>,
}

impl ManualScheduler {
    pub(crate) fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn run_all(&self) {
        let tasks: Vec<_> = self.tasks.lock().unwrap().clone();
        for task in tasks {
            task.run();
        }
    }

    pub(crate) fn task_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(
        &self,
        task: Arc<dyn PeriodicTask>,
        _initial_delay: Duration,
        _period: Duration,
    ) {
        self.tasks.lock().unwrap().push(task);
    }

    fn shutdown(&self) {}
}
