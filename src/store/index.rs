//! The persistent index over the append-only log.
//!
//! The index is an ordered collection of segments, each covering a
//! contiguous log range. Only the highest segment (the *active* one) accepts
//! writes; older segments are flushed to disk and memory-mapped read-only by
//! a background persistor. A bounded journal of recent insertions serves
//! replication scans that stay close to the log tail.
//!
//! ```text
//!            segments (by start offset)                journal
//! +----------+----------+----------+------------+   +--------------+
//! | mapped   | mapped   | sealed   | active     |   | (off, key)   |
//! | [0,4k)   | [4k,8k)  | [8k,12k) | [12k, ...) |   | ring, newest |
//! +----------+----------+----------+------------+   +--------------+
//!      read-only, bloom + binary      writer          recent scans
//!      search over mmap               appends
//! ```
//!
//! The index assumes a single external writer; reads and the persistor run
//! concurrently with it. Ordering against the log is the writer's job: bytes
//! are appended to the log first, then described to the index.

use std::collections::HashSet;
use std::fs::{self, File};
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_skiplist::SkipMap;
use rand::Rng;
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::errarg;
use crate::error::{Result, StoreError};
use crate::scheduler::{PeriodicTask, Scheduler};
use crate::store::journal::Journal;
use crate::store::key::{StoreKey, StoreKeyFactory};
use crate::store::log::Log;
use crate::store::message::{BlobReadOptions, FindInfo, MessageInfo};
use crate::store::recovery::MessageStoreRecovery;
use crate::store::segment::{IndexSegment, INDEX_FILE_SUFFIX};
use crate::store::token::{StoreFindToken, TokenPosition};
use crate::store::value::{FileSpan, Flags, IndexEntry, IndexValue, INDEX_VALUE_SIZE_IN_BYTES};

/// Marker file present in the data directory iff the previous shutdown went
/// through `close`.
pub const CLEAN_SHUTDOWN_FILENAME: &str = "cleanshutdown";

/// A persistent index mapping store keys to their location in the log.
///
/// Not thread safe for writes: callers must serialize `add_to_index`,
/// `add_to_index_batch` and `mark_as_deleted`. Reads may run concurrently
/// with the single writer and with the background persistor.
pub struct PersistentIndex<F: StoreKeyFactory> {
    data_dir: PathBuf,
    config: StoreConfig,
    segments: SkipMap<u64, Arc<IndexSegment<F>>>,
    log: Arc<dyn Log>,
    journal: Journal<F::Key>,
    factory: Arc<F>,
    session_id: Uuid,
    clean_shutdown: bool,
    log_end_offset_on_startup: u64,
}

impl<F: StoreKeyFactory> PersistentIndex<F> {
    /// Build the index from the segment files in `data_dir`, reconcile it
    /// against the log, and schedule the background persistor.
    ///
    /// All segment files except the newest two are memory-mapped; the newest
    /// two stay mutable and are run through `recovery` together with the log
    /// tail, so that a crash between log append and index flush loses
    /// nothing the log still holds.
    pub fn new(
        data_dir: impl Into<PathBuf>,
        scheduler: &dyn Scheduler,
        log: Arc<dyn Log>,
        config: StoreConfig,
        factory: Arc<F>,
        recovery: &dyn MessageStoreRecovery<F>,
    ) -> Result<Arc<Self>> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .map_err(|e| StoreError::IndexCreationFailure(e.to_string()))?;

        let journal = Journal::new(
            config.journal_max_entries,
            config.max_entries_to_return_from_journal,
        );
        let mut index = Self {
            segments: SkipMap::new(),
            log,
            journal,
            factory,
            session_id: Uuid::new_v4(),
            clean_shutdown: false,
            log_end_offset_on_startup: 0,
            config,
            data_dir,
        };

        let mut segment_files = Vec::new();
        for entry in
            fs::read_dir(&index.data_dir).map_err(|e| StoreError::IndexCreationFailure(e.to_string()))?
        {
            let path = entry
                .map_err(|e| StoreError::IndexCreationFailure(e.to_string()))?
                .path();
            if path.extension().and_then(|e| e.to_str()) == Some(INDEX_FILE_SUFFIX) {
                segment_files.push(path);
            }
        }
        segment_files.sort_by_key(|path| {
            crate::store::segment::parse_start_offset(path).unwrap_or(u64::MAX)
        });

        let mapped_until = segment_files.len().saturating_sub(2);
        for (i, path) in segment_files.iter().enumerate() {
            let segment = IndexSegment::from_file(
                path,
                i < mapped_until,
                index.config.bloom_false_positive_rate,
                index.factory.clone(),
            )
            .map_err(|e| StoreError::IndexCreationFailure(e.to_string()))?;
            tracing::info!(
                file = %path.display(),
                start_offset = segment.start_offset(),
                end_offset = ?segment.end_offset(),
                "Loaded index segment"
            );
            index.segments.insert(segment.start_offset(), Arc::new(segment));
        }

        tracing::info!(
            dir = %index.data_dir.display(),
            log_end_offset = index.log.log_end_offset(),
            "Log end offset before recovery"
        );
        index.recover_all(recovery)?;

        // The recovered index decides how much of the log is real.
        index.log.set_log_end_offset(index.current_end_offset())?;
        index.log_end_offset_on_startup = index.log.log_end_offset();

        let marker = index.data_dir.join(CLEAN_SHUTDOWN_FILENAME);
        if marker.exists() {
            index.clean_shutdown = true;
            fs::remove_file(&marker)?;
        }

        let index = Arc::new(index);
        let jitter = Duration::from_secs(rand::thread_rng().gen_range(0..60));
        scheduler.schedule(
            Arc::new(IndexPersistorTask {
                index: Arc::downgrade(&index),
            }),
            index.config.data_flush_delay + jitter,
            index.config.data_flush_interval,
        );
        Ok(index)
    }

    fn recover_all(&self, recovery: &dyn MessageStoreRecovery<F>) -> Result<()> {
        if let Some(last_entry) = self.segments.back() {
            let last = last_entry.value().clone();
            if let Some(prev_entry) = self
                .segments
                .upper_bound(Bound::Excluded(&last.start_offset()))
            {
                let prev = prev_entry.value().clone();
                tracing::info!(
                    start_offset = prev.start_offset(),
                    end_offset = ?prev.end_offset(),
                    "Recovering last but one segment"
                );
                self.recover_segment(Some(prev), last.start_offset(), recovery)?;
            }
            self.recover_segment(Some(last), self.log.size_in_bytes(), recovery)?;
        } else {
            self.recover_segment(None, self.log.size_in_bytes(), recovery)?;
        }
        Ok(())
    }

    /// Replay `[segment end, end_offset)` of the log into `segment`,
    /// creating a fresh segment when none is given.
    fn recover_segment(
        &self,
        segment: Option<Arc<IndexSegment<F>>>,
        end_offset: u64,
        recovery: &dyn MessageStoreRecovery<F>,
    ) -> Result<()> {
        let mut segment_to_recover = segment;
        let start_offset = match &segment_to_recover {
            Some(seg) => seg.end_offset().unwrap_or(seg.start_offset()),
            None => 0,
        };
        tracing::info!(start_offset, end_offset, "Performing recovery on index");

        let messages =
            recovery.recover(self.log.as_ref(), start_offset, end_offset, &self.factory)?;
        let mut running_offset = start_offset;
        for info in messages {
            tracing::trace!(
                key = %info.key(),
                offset = running_offset,
                size = info.size(),
                "Recovering message"
            );
            let segment = match &segment_to_recover {
                Some(segment) => segment.clone(),
                None => {
                    let segment = Arc::new(IndexSegment::new(
                        &self.data_dir,
                        start_offset,
                        info.key().size_in_bytes() as u32,
                        INDEX_VALUE_SIZE_IN_BYTES,
                        self.config.bloom_false_positive_rate,
                        self.factory.clone(),
                    ));
                    self.segments.insert(start_offset, segment.clone());
                    segment_to_recover = Some(segment.clone());
                    segment
                }
            };

            let value = match self.find_key(info.key())? {
                Some(mut existing) => {
                    // Only a delete may name a key the index already holds
                    if !info.is_deleted() {
                        return Err(StoreError::InitializationError(format!(
                            "duplicate non-delete message for key {} during recovery",
                            info.key()
                        )));
                    }
                    tracing::info!(key = %info.key(), "Recovered delete for existing key");
                    existing.set_flag(Flags::DeleteIndex);
                    existing.set_new_offset(running_offset);
                    existing.set_new_size(info.size());
                    existing
                }
                None => IndexValue::new(info.size(), running_offset, info.expiration_time_ms()),
            };

            let span = FileSpan::new(running_offset, running_offset + info.size())?;
            self.verify_file_span(&span)?;
            segment.add_entry(IndexEntry::new(info.key().clone(), value), span.end_offset())?;
            self.journal.add_entry(running_offset, info.key().clone());
            running_offset += info.size();
        }
        Ok(())
    }

    /// The log end offset this index currently accounts for.
    pub fn current_end_offset(&self) -> u64 {
        self.segments
            .back()
            .map(|entry| {
                let segment = entry.value();
                segment.end_offset().unwrap_or(segment.start_offset())
            })
            .unwrap_or(0)
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn is_clean_shutdown(&self) -> bool {
        self.clean_shutdown
    }

    pub fn log_end_offset_on_startup(&self) -> u64 {
        self.log_end_offset_on_startup
    }

    fn verify_file_span(&self, span: &FileSpan) -> Result<()> {
        let current_end = self.current_end_offset();
        if current_end > span.start_offset() || span.start_offset() > span.end_offset() {
            tracing::error!(
                log_end_offset = current_end,
                span_start = span.start_offset(),
                span_end = span.end_offset(),
                "File span offsets do not meet constraints"
            );
            return errarg!(
                "file span [{}, {}) does not meet constraints at index end offset {}",
                span.start_offset(),
                span.end_offset(),
                current_end
            );
        }
        Ok(())
    }

    fn need_to_roll_over(&self, entry: &IndexEntry<F::Key>) -> bool {
        let Some(last) = self.segments.back() else {
            return true;
        };
        let segment = last.value();
        segment.size_written() >= self.config.index_max_memory_size_bytes
            || segment.number_of_items() >= self.config.index_max_number_of_inmem_elements
            || segment.key_size() as usize != entry.key().size_in_bytes()
            || segment.value_size() != INDEX_VALUE_SIZE_IN_BYTES
    }

    fn roll_over(&self, entry: &IndexEntry<F::Key>) -> Arc<IndexSegment<F>> {
        let segment = Arc::new(IndexSegment::new(
            &self.data_dir,
            entry.value().offset(),
            entry.key().size_in_bytes() as u32,
            INDEX_VALUE_SIZE_IN_BYTES,
            self.config.bloom_false_positive_rate,
            self.factory.clone(),
        ));
        self.segments.insert(segment.start_offset(), segment.clone());
        segment
    }

    /// Add one entry for log bytes the caller has already appended.
    pub fn add_to_index(&self, entry: IndexEntry<F::Key>, file_span: FileSpan) -> Result<()> {
        self.verify_file_span(&file_span)?;
        let journal_offset = entry.value().offset();
        let journal_key = entry.key().clone();
        let segment = if self.need_to_roll_over(&entry) {
            self.roll_over(&entry)
        } else {
            self.segments.back().unwrap().value().clone()
        };
        segment.add_entry(entry, file_span.end_offset())?;
        self.journal.add_entry(journal_offset, journal_key);
        Ok(())
    }

    /// Add a batch of entries covered by one file span. Rollover is decided
    /// on the first entry.
    pub fn add_to_index_batch(
        &self,
        entries: Vec<IndexEntry<F::Key>>,
        file_span: FileSpan,
    ) -> Result<()> {
        self.verify_file_span(&file_span)?;
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let journal_entries: Vec<_> = entries
            .iter()
            .map(|entry| (entry.value().offset(), entry.key().clone()))
            .collect();
        let segment = if self.need_to_roll_over(first) {
            self.roll_over(first)
        } else {
            self.segments.back().unwrap().value().clone()
        };
        segment.add_entries(entries, file_span.end_offset())?;
        for (offset, key) in journal_entries {
            self.journal.add_entry(offset, key);
        }
        Ok(())
    }

    /// Current value for `key`, searching segments newest first so the most
    /// recent write wins.
    pub fn find_key(&self, key: &F::Key) -> Result<Option<IndexValue>> {
        for entry in self.segments.iter().rev() {
            tracing::trace!(start_offset = entry.key(), "Searching segment for key");
            if let Some(value) = entry.value().find(key)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// True if the key has ever been written, deleted or expired included.
    pub fn exists(&self, key: &F::Key) -> Result<bool> {
        Ok(self.find_key(key)?.is_some())
    }

    /// Mark `id` deleted, pointing its index record at the delete marker the
    /// caller appended to the log.
    pub fn mark_as_deleted(&self, id: &F::Key, file_span: FileSpan) -> Result<()> {
        self.verify_file_span(&file_span)?;
        let mut value = self
            .find_key(id)?
            .ok_or_else(|| StoreError::IdNotFound(format!("{id}")))?;
        value.set_flag(Flags::DeleteIndex);
        value.set_new_offset(file_span.start_offset());
        value.set_new_size(file_span.end_offset() - file_span.start_offset());
        self.segments
            .back()
            .expect("find_key succeeded on an empty index")
            .value()
            .add_entry(IndexEntry::new(id.clone(), value), file_span.end_offset())?;
        self.journal.add_entry(file_span.start_offset(), id.clone());
        Ok(())
    }

    /// Where to read the blob for `id`, failing if it is absent, deleted, or
    /// expired.
    pub fn get_blob_read_info(&self, id: &F::Key) -> Result<BlobReadOptions<F::Key>> {
        let value = self
            .find_key(id)?
            .ok_or_else(|| StoreError::IdNotFound(format!("{id}")))?;
        if value.is_flag_set(Flags::DeleteIndex) {
            return Err(StoreError::IdDeleted(format!("{id}")));
        }
        if value.is_expired() {
            return Err(StoreError::TtlExpired(format!("{id}")));
        }
        Ok(BlobReadOptions::new(
            value.offset(),
            value.size(),
            value.time_to_live_ms(),
            id.clone(),
        ))
    }

    /// The subset of `keys` the index has never seen. Deleted and expired
    /// keys count as present.
    pub fn find_missing_keys(&self, keys: &[F::Key]) -> Result<HashSet<F::Key>> {
        let mut missing = HashSet::new();
        for key in keys {
            if !self.exists(key)? {
                missing.insert(key.clone());
            }
        }
        Ok(missing)
    }

    /// Find entries added at or after the position `token` describes, up to
    /// roughly `max_total_size_of_entries` bytes of messages, and hand back
    /// the token for the next call.
    ///
    /// A token issued by an earlier session is validated first: after an
    /// unclean shutdown a token pointing past what survived is silently
    /// reset to the startup log end; after a clean shutdown the same
    /// condition is a caller error.
    pub fn find_entries_since(
        &self,
        token: &StoreFindToken<F::Key>,
        max_total_size_of_entries: u64,
    ) -> Result<FindInfo<F::Key>> {
        let log_end_offset_before_find = self.log.log_end_offset();
        let mut token = token.clone();

        if token.session_id() != Some(self.session_id) {
            let points_past_startup = match token.position() {
                TokenPosition::Journal { offset } => *offset > self.log_end_offset_on_startup,
                TokenPosition::Segment {
                    index_start_offset, ..
                } => *index_start_offset > self.log_end_offset_on_startup,
                TokenPosition::Uninitialized => false,
            };
            if points_past_startup {
                if !self.clean_shutdown {
                    tracing::info!(
                        dir = %self.data_dir.display(),
                        reset_to = self.log_end_offset_on_startup,
                        "Resetting token offset after unclean shutdown"
                    );
                    token =
                        StoreFindToken::journal_based(self.log_end_offset_on_startup, self.session_id);
                } else {
                    tracing::error!(
                        dir = %self.data_dir.display(),
                        "Token offset is outside the log range after clean shutdown"
                    );
                    return errarg!("token offset is outside the log range after clean shutdown");
                }
            }
        }

        let mut message_entries = Vec::new();
        match token.position().clone() {
            TokenPosition::Uninitialized | TokenPosition::Journal { .. } => {
                let (offset_to_start, inclusive) = match token.position() {
                    TokenPosition::Journal { offset } => (*offset, false),
                    _ => (0, true),
                };
                tracing::trace!(offset_to_start, "Getting entries since offset");

                if let Some(entries) = self.journal.get_entries_since(offset_to_start, inclusive) {
                    let mut offset_end = offset_to_start;
                    let mut current_total = 0u64;
                    let mut last_entry_size = 0u64;
                    for entry in &entries {
                        let value = self.dereference_journal_key(entry.key())?;
                        message_entries.push(MessageInfo::new(
                            entry.key().clone(),
                            value.size(),
                            value.is_flag_set(Flags::DeleteIndex),
                            value.time_to_live_ms(),
                        ));
                        current_total += value.size();
                        offset_end = entry.offset();
                        last_entry_size = value.size();
                        if current_total >= max_total_size_of_entries {
                            break;
                        }
                    }
                    eliminate_duplicates(&mut message_entries);

                    let mut new_token = StoreFindToken::journal_based(offset_end, self.session_id);
                    let bytes_read = if message_entries.is_empty() {
                        log_end_offset_before_find
                    } else {
                        offset_end + last_entry_size
                    };
                    new_token.set_bytes_read(bytes_read);
                    return Ok(FindInfo::new(message_entries, new_token));
                }

                // The journal no longer covers this offset: walk the
                // segments from the one containing it.
                let floor = self
                    .segments
                    .upper_bound(Bound::Included(&offset_to_start))
                    .map(|entry| *entry.key());
                let mut new_token = match floor {
                    Some(start_offset) => self.find_entries_from_segment(
                        start_offset,
                        None,
                        &mut message_entries,
                        max_total_size_of_entries,
                        &token,
                    )?,
                    None => token.clone(),
                };
                eliminate_duplicates(&mut message_entries);
                let bytes_read =
                    self.total_bytes_read(&new_token, &message_entries, log_end_offset_before_find);
                new_token.set_bytes_read(bytes_read);
                Ok(FindInfo::new(message_entries, new_token))
            }
            TokenPosition::Segment {
                index_start_offset,
                key,
            } => {
                let mut new_token = self.find_entries_from_segment(
                    index_start_offset,
                    Some(&key),
                    &mut message_entries,
                    max_total_size_of_entries,
                    &token,
                )?;
                eliminate_duplicates(&mut message_entries);
                let bytes_read =
                    self.total_bytes_read(&new_token, &message_entries, log_end_offset_before_find);
                new_token.set_bytes_read(bytes_read);
                Ok(FindInfo::new(message_entries, new_token))
            }
        }
    }

    /// Walk segments in log order starting at `start_offset`, after
    /// `after_key` within the starting segment. The active segment is never
    /// iterated directly when reached by the walk; the journal takes over
    /// there, which is also what makes the returned token journal-shaped
    /// again once a lagging consumer has caught up.
    fn find_entries_from_segment(
        &self,
        start_offset: u64,
        after_key: Option<&F::Key>,
        message_entries: &mut Vec<MessageInfo<F::Key>>,
        max_total_size_of_entries: u64,
        incoming_token: &StoreFindToken<F::Key>,
    ) -> Result<StoreFindToken<F::Key>> {
        let segment = self
            .segments
            .get(&start_offset)
            .ok_or_else(|| {
                StoreError::InvalidArgument(format!(
                    "token names unknown index segment at offset {start_offset}"
                ))
            })?
            .value()
            .clone();

        let mut current_total = 0u64;
        segment.get_entries_since(
            after_key,
            max_total_size_of_entries,
            message_entries,
            &mut current_total,
        )?;

        let mut last_segment_start = start_offset;
        let mut current = start_offset;
        let mut offset_end: Option<u64> = None;
        while current_total < max_total_size_of_entries {
            let Some(next) = self.segments.lower_bound(Bound::Excluded(&current)) else {
                break;
            };
            let segment = next.value().clone();
            current = segment.start_offset();
            let active_start = self.segments.back().map(|entry| *entry.key());
            if Some(current) != active_start {
                segment.get_entries_since(
                    None,
                    max_total_size_of_entries,
                    message_entries,
                    &mut current_total,
                )?;
                last_segment_start = current;
            } else {
                if let Some(entries) = self.journal.get_entries_since(segment.start_offset(), true)
                {
                    for entry in &entries {
                        offset_end = Some(entry.offset());
                        let value = self.dereference_journal_key(entry.key())?;
                        message_entries.push(MessageInfo::new(
                            entry.key().clone(),
                            value.size(),
                            value.is_flag_set(Flags::DeleteIndex),
                            value.time_to_live_ms(),
                        ));
                        current_total += value.size();
                        if current_total >= max_total_size_of_entries {
                            break;
                        }
                    }
                }
                break;
            }
        }

        match offset_end {
            Some(offset_end) => Ok(StoreFindToken::journal_based(offset_end, self.session_id)),
            None => match message_entries.last() {
                Some(last) => Ok(StoreFindToken::segment_based(
                    last.key().clone(),
                    last_segment_start,
                    self.session_id,
                )),
                // Nothing new and no journal handoff: the caller is already
                // caught up, so the token stands.
                None => Ok(incoming_token.clone()),
            },
        }
    }

    /// Journal entries always mirror an index insert; resolve the current
    /// value so scans report the latest flags and sizes.
    fn dereference_journal_key(&self, key: &F::Key) -> Result<IndexValue> {
        self.find_key(key)?.ok_or_else(|| {
            StoreError::InvalidData(format!("journal key {key} has no index entry"))
        })
    }

    fn total_bytes_read(
        &self,
        token: &StoreFindToken<F::Key>,
        message_entries: &[MessageInfo<F::Key>],
        log_end_offset_before_find: u64,
    ) -> u64 {
        match token.position() {
            TokenPosition::Uninitialized => 0,
            TokenPosition::Segment {
                index_start_offset, ..
            } => *index_start_offset,
            TokenPosition::Journal { offset } => match message_entries.last() {
                Some(last) => *offset + last.size(),
                None => log_end_offset_before_find,
            },
        }
    }

    /// Flush everything with the ordering durability depends on: the log
    /// first, then any sealed-but-unmapped segments (which are then mapped),
    /// newest first, and finally the active segment up to the log end
    /// captured before the flush.
    pub fn persist(&self) -> Result<()> {
        let Some(last_entry) = self.segments.back() else {
            return Ok(());
        };
        let active = last_entry.value().clone();
        let file_end_pointer_before_flush = self.log.log_end_offset();
        self.log.flush()?;

        let current_log_end_pointer = self.log.log_end_offset();
        let mut prev = self
            .segments
            .upper_bound(Bound::Excluded(&active.start_offset()))
            .map(|entry| entry.value().clone());
        while let Some(segment) = prev {
            if segment.is_mapped() {
                break;
            }
            let segment_end = segment.end_offset().unwrap_or(segment.start_offset());
            if segment_end > current_log_end_pointer {
                let message = format!(
                    "read only segment end offset {segment_end} is past log end offset \
                     {current_log_end_pointer}"
                );
                tracing::error!("{message}");
                return Err(StoreError::Io(message));
            }
            tracing::info!(
                dir = %self.data_dir.display(),
                end_offset = segment_end,
                "Writing sealed index segment"
            );
            segment.write_index_to_file(segment_end)?;
            segment.map()?;
            prev = self
                .segments
                .upper_bound(Bound::Excluded(&segment.start_offset()))
                .map(|entry| entry.value().clone());
        }
        active.write_index_to_file(file_end_pointer_before_flush)?;
        Ok(())
    }

    /// Flush a final time and leave the clean shutdown marker behind.
    pub fn close(&self) -> Result<()> {
        self.persist()?;
        let marker = self.data_dir.join(CLEAN_SHUTDOWN_FILENAME);
        if let Err(e) = File::create(&marker) {
            tracing::error!(
                dir = %self.data_dir.display(),
                error = %e,
                "Error while creating clean shutdown file"
            );
        }
        Ok(())
    }
}

/// Remove older duplicates so a scan reports each key once, in its latest
/// state. An insert followed by its delete within one scan surfaces only the
/// delete.
fn eliminate_duplicates<K: StoreKey>(message_entries: &mut Vec<MessageInfo<K>>) {
    let mut seen = HashSet::new();
    let mut keep = vec![true; message_entries.len()];
    for i in (0..message_entries.len()).rev() {
        if !seen.insert(message_entries[i].key().clone()) {
            keep[i] = false;
        }
    }
    let mut keep_iter = keep.into_iter();
    message_entries.retain(|_| keep_iter.next().unwrap());
}

/// Periodic flusher. Holds a non-owning handle so a dropped index quietly
/// stops being flushed; errors are logged and retried on the next tick.
pub struct IndexPersistorTask<F: StoreKeyFactory> {
    index: Weak<PersistentIndex<F>>,
}

impl<F: StoreKeyFactory> PeriodicTask for IndexPersistorTask<F> {
    fn name(&self) -> &'static str {
        "index-persistor"
    }

    fn run(&self) {
        if let Some(index) = self.index.upgrade() {
            if let Err(e) = index.persist() {
                tracing::error!(error = %e, "Error while persisting the index to disk");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::value::TTL_INFINITE;
    use crate::testutil::{ListRecovery, ManualScheduler, MemoryLog, TestKey, TestKeyFactory};
    use tempfile::TempDir;

    fn key(byte: u8) -> TestKey {
        TestKey::from_bytes(&[byte])
    }

    fn entry(byte: u8, offset: u64, size: u64) -> IndexEntry<TestKey> {
        IndexEntry::new(key(byte), IndexValue::new(size, offset, TTL_INFINITE))
    }

    struct Harness {
        _dir: TempDir,
        data_dir: PathBuf,
        scheduler: ManualScheduler,
        log: Arc<MemoryLog>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().expect("Failed to create temp dir");
            let data_dir = dir.path().to_path_buf();
            Self {
                _dir: dir,
                data_dir,
                scheduler: ManualScheduler::new(),
                log: Arc::new(MemoryLog::new()),
            }
        }

        fn build(&self, config: StoreConfig) -> Arc<PersistentIndex<TestKeyFactory>> {
            self.build_with_recovery(config, &ListRecovery::empty())
        }

        fn build_with_recovery(
            &self,
            config: StoreConfig,
            recovery: &ListRecovery,
        ) -> Arc<PersistentIndex<TestKeyFactory>> {
            PersistentIndex::new(
                self.data_dir.clone(),
                &self.scheduler,
                self.log.clone(),
                config,
                Arc::new(TestKeyFactory),
                recovery,
            )
            .expect("Failed to build index")
        }

        /// Append `size` bytes to the log and index them under `byte`.
        fn put(&self, index: &PersistentIndex<TestKeyFactory>, byte: u8, size: u64) {
            let span = self.log.append_blob(size);
            index
                .add_to_index(entry(byte, span.start_offset(), size), span)
                .expect("Failed to add to index");
        }

        fn delete(&self, index: &PersistentIndex<TestKeyFactory>, byte: u8, marker_size: u64) {
            let span = self.log.append_blob(marker_size);
            index
                .mark_as_deleted(&key(byte), span)
                .expect("Failed to mark as deleted");
        }
    }

    #[test]
    fn test_insert_and_find() {
        let h = Harness::new();
        let index = h.build(StoreConfig::default());

        h.put(&index, 1, 100);

        let value = index.find_key(&key(1)).expect("find failed").expect("missing");
        assert_eq!(value.offset(), 0);
        assert_eq!(value.size(), 100);
        assert!(index.exists(&key(1)).expect("exists failed"));
        assert_eq!(index.current_end_offset(), 100);

        let info = index.get_blob_read_info(&key(1)).expect("read info failed");
        assert_eq!(info.offset(), 0);
        assert_eq!(info.size(), 100);

        assert!(matches!(
            index.get_blob_read_info(&key(9)),
            Err(StoreError::IdNotFound(_))
        ));
    }

    #[test]
    fn test_delete_then_lookup() {
        let h = Harness::new();
        let index = h.build(StoreConfig::default());

        h.put(&index, 1, 100);
        h.delete(&index, 1, 50);

        assert!(matches!(
            index.get_blob_read_info(&key(1)),
            Err(StoreError::IdDeleted(_))
        ));
        let value = index.find_key(&key(1)).expect("find failed").expect("missing");
        assert_eq!(value.offset(), 100);
        assert_eq!(value.size(), 50);
        assert!(value.is_flag_set(Flags::DeleteIndex));

        // Deleted keys still exist as far as replication is concerned
        assert!(index.exists(&key(1)).expect("exists failed"));
        assert!(index
            .find_missing_keys(&[key(1)])
            .expect("missing keys failed")
            .is_empty());
    }

    #[test]
    fn test_expired_key() {
        let h = Harness::new();
        let index = h.build(StoreConfig::default());

        let span = h.log.append_blob(10);
        index
            .add_to_index(
                IndexEntry::new(key(1), IndexValue::new(10, span.start_offset(), 1)),
                span,
            )
            .expect("add failed");

        assert!(matches!(
            index.get_blob_read_info(&key(1)),
            Err(StoreError::TtlExpired(_))
        ));
        assert!(index.exists(&key(1)).expect("exists failed"));
    }

    #[test]
    fn test_mark_as_deleted_missing_key() {
        let h = Harness::new();
        let index = h.build(StoreConfig::default());

        let span = h.log.append_blob(10);
        assert!(matches!(
            index.mark_as_deleted(&key(1), span),
            Err(StoreError::IdNotFound(_))
        ));
    }

    #[test]
    fn test_rollover() {
        let h = Harness::new();
        let index = h.build(StoreConfig::default().index_max_number_of_inmem_elements(2));

        h.put(&index, 1, 50);
        h.put(&index, 2, 50);
        h.put(&index, 3, 50);

        let starts: Vec<u64> = index.segments.iter().map(|e| *e.key()).collect();
        assert_eq!(starts, vec![0, 100]);

        for byte in 1..=3u8 {
            assert!(index.find_key(&key(byte)).expect("find failed").is_some());
        }
        assert_eq!(index.current_end_offset(), 150);
    }

    #[test]
    fn test_batched_add() {
        let h = Harness::new();
        let index = h.build(StoreConfig::default().index_max_number_of_inmem_elements(2));

        h.put(&index, 1, 50);
        h.put(&index, 2, 50);

        // Batch rollover is decided on the first entry of the batch
        let span = FileSpan::new(100, 200).unwrap();
        h.log.append_blob(100);
        index
            .add_to_index_batch(vec![entry(3, 100, 50), entry(4, 150, 50)], span)
            .expect("batch add failed");

        let starts: Vec<u64> = index.segments.iter().map(|e| *e.key()).collect();
        assert_eq!(starts, vec![0, 100]);
        assert_eq!(index.current_end_offset(), 200);
        for byte in 1..=4u8 {
            assert!(index.find_key(&key(byte)).expect("find failed").is_some());
        }

        // Every batched entry is mirrored into the journal
        let info = index
            .find_entries_since(&StoreFindToken::new(), u64::MAX)
            .expect("scan failed");
        assert_eq!(info.entries().len(), 4);
    }

    #[test]
    fn test_rollover_on_key_size_change() {
        let h = Harness::new();
        let index = h.build(StoreConfig::default());

        h.put(&index, 1, 50);

        let wide = TestKey::from_bytes(&[1, 2, 3, 4]);
        let span = h.log.append_blob(50);
        index
            .add_to_index(
                IndexEntry::new(wide.clone(), IndexValue::new(50, span.start_offset(), TTL_INFINITE)),
                span,
            )
            .expect("add failed");

        let starts: Vec<u64> = index.segments.iter().map(|e| *e.key()).collect();
        assert_eq!(starts, vec![0, 50]);
        assert!(index.find_key(&wide).expect("find failed").is_some());
    }

    #[test]
    fn test_file_span_gate() {
        let h = Harness::new();
        let index = h.build(StoreConfig::default());

        h.put(&index, 1, 100);

        // Starts behind the index end offset
        let stale = FileSpan::new(50, 150).unwrap();
        assert!(matches!(
            index.add_to_index(entry(2, 50, 100), stale),
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(index.find_key(&key(2)).expect("find failed").is_none());
        assert_eq!(index.current_end_offset(), 100);

        assert!(matches!(
            index.mark_as_deleted(&key(1), FileSpan::new(50, 150).unwrap()),
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_find_missing_keys() {
        let h = Harness::new();
        let index = h.build(StoreConfig::default());

        h.put(&index, 1, 10);

        let missing = index
            .find_missing_keys(&[key(1), key(2), key(3)])
            .expect("missing keys failed");
        assert_eq!(missing, HashSet::from([key(2), key(3)]));
    }

    #[test]
    fn test_scan_from_zero_via_journal() {
        let h = Harness::new();
        let index = h.build(StoreConfig::default().index_max_number_of_inmem_elements(2));

        h.put(&index, 1, 50);
        h.put(&index, 2, 50);
        h.put(&index, 3, 50);

        let info = index
            .find_entries_since(&StoreFindToken::new(), u64::MAX)
            .expect("scan failed");
        let keys: Vec<_> = info.entries().iter().map(|m| m.key().clone()).collect();
        assert_eq!(keys, vec![key(1), key(2), key(3)]);

        assert_eq!(info.token().offset(), 100);
        assert_eq!(info.token().session_id(), Some(index.session_id()));
        assert_eq!(info.token().bytes_read(), Some(150));
    }

    #[test]
    fn test_scan_resumes_from_journal_token() {
        let h = Harness::new();
        let index = h.build(StoreConfig::default());

        h.put(&index, 1, 50);
        h.put(&index, 2, 50);

        let first = index
            .find_entries_since(&StoreFindToken::new(), u64::MAX)
            .expect("scan failed");
        assert_eq!(first.entries().len(), 2);

        // Nothing new: same token comes back, bytes read pinned to log end
        let second = index
            .find_entries_since(first.token(), u64::MAX)
            .expect("scan failed");
        assert!(second.entries().is_empty());
        assert_eq!(second.token().offset(), first.token().offset());
        assert_eq!(second.token().bytes_read(), Some(100));

        h.put(&index, 3, 25);
        let third = index
            .find_entries_since(second.token(), u64::MAX)
            .expect("scan failed");
        let keys: Vec<_> = third.entries().iter().map(|m| m.key().clone()).collect();
        assert_eq!(keys, vec![key(3)]);
        assert_eq!(third.token().offset(), 100);
        assert_eq!(third.token().bytes_read(), Some(125));
    }

    #[test]
    fn test_scan_past_journal_falls_back_to_segments() {
        let h = Harness::new();
        let index = h.build(StoreConfig::default().journal_max_entries(1));

        h.put(&index, 1, 50);
        h.put(&index, 2, 50);
        h.put(&index, 3, 50);

        let info = index
            .find_entries_since(&StoreFindToken::new(), u64::MAX)
            .expect("scan failed");
        let keys: Vec<_> = info.entries().iter().map(|m| m.key().clone()).collect();
        assert_eq!(keys, vec![key(1), key(2), key(3)]);

        // The walk ends in a segment-shape token naming the last entry seen
        assert_eq!(info.token().index_start_offset(), 0);
        assert_eq!(info.token().store_key(), Some(&key(3)));
        assert_eq!(info.token().bytes_read(), Some(0));

        // Resuming a caught-up segment token echoes it back unchanged
        let resumed = index
            .find_entries_since(info.token(), u64::MAX)
            .expect("scan failed");
        assert!(resumed.entries().is_empty());
        assert_eq!(resumed.token().store_key(), Some(&key(3)));
        assert_eq!(resumed.token().index_start_offset(), 0);
    }

    #[test]
    fn test_segment_walk_hands_off_to_journal() {
        let h = Harness::new();
        let index = h.build(
            StoreConfig::default()
                .index_max_number_of_inmem_elements(2)
                .journal_max_entries(2),
        );

        h.put(&index, 1, 50);
        h.put(&index, 2, 50);
        h.put(&index, 3, 50);

        // Journal holds offsets 50 and 100 only; a scan from zero walks the
        // first segment and then switches to the journal at the active one.
        let info = index
            .find_entries_since(&StoreFindToken::new(), u64::MAX)
            .expect("scan failed");
        let keys: Vec<_> = info.entries().iter().map(|m| m.key().clone()).collect();
        assert_eq!(keys, vec![key(1), key(2), key(3)]);
        assert_eq!(info.token().offset(), 100);
        assert_eq!(info.token().bytes_read(), Some(150));
    }

    #[test]
    fn test_duplicate_elimination_in_scan() {
        let h = Harness::new();
        let index = h.build(StoreConfig::default());

        h.put(&index, 1, 50);
        h.put(&index, 2, 50);
        h.delete(&index, 1, 10);

        let info = index
            .find_entries_since(&StoreFindToken::new(), u64::MAX)
            .expect("scan failed");
        let keys: Vec<_> = info.entries().iter().map(|m| m.key().clone()).collect();
        assert_eq!(keys, vec![key(2), key(1)]);
        let deleted = info
            .entries()
            .iter()
            .find(|m| m.key() == &key(1))
            .expect("key 1 missing");
        assert!(deleted.is_deleted());
        assert_eq!(deleted.size(), 10);
    }

    #[test]
    fn test_scan_respects_size_budget() {
        let h = Harness::new();
        let index = h.build(StoreConfig::default());

        h.put(&index, 1, 50);
        h.put(&index, 2, 50);
        h.put(&index, 3, 50);

        let first = index
            .find_entries_since(&StoreFindToken::new(), 100)
            .expect("scan failed");
        assert_eq!(first.entries().len(), 2);
        assert_eq!(first.token().offset(), 50);
        assert_eq!(first.token().bytes_read(), Some(100));

        let second = index
            .find_entries_since(first.token(), 100)
            .expect("scan failed");
        let keys: Vec<_> = second.entries().iter().map(|m| m.key().clone()).collect();
        assert_eq!(keys, vec![key(3)]);
    }

    #[test]
    fn test_bytes_read_is_monotonic() {
        let h = Harness::new();
        let index = h.build(StoreConfig::default());

        for byte in 1..=6u8 {
            h.put(&index, byte, 50);
        }

        let mut token = StoreFindToken::new();
        let mut previous = 0u64;
        loop {
            let info = index.find_entries_since(&token, 100).expect("scan failed");
            let bytes_read = info.token().bytes_read().expect("bytes read unset");
            assert!(bytes_read >= previous, "bytes read regressed");
            previous = bytes_read;
            if info.entries().is_empty() {
                break;
            }
            token = info.token().clone();
        }
        assert_eq!(previous, 300);
    }

    #[test]
    fn test_persistor_flush_order_and_mapping() {
        let h = Harness::new();
        let index = h.build(StoreConfig::default().index_max_number_of_inmem_elements(2));

        for byte in 1..=5u8 {
            h.put(&index, byte, 50);
        }
        let starts: Vec<u64> = index.segments.iter().map(|e| *e.key()).collect();
        assert_eq!(starts, vec![0, 100, 200]);

        index.persist().expect("persist failed");
        assert!(h.log.flush_count() >= 1);

        // Sealed segments are flushed and mapped, the active one only flushed
        let mapped: Vec<bool> = index
            .segments
            .iter()
            .map(|e| e.value().is_mapped())
            .collect();
        assert_eq!(mapped, vec![true, true, false]);

        for start in [0u64, 100, 200] {
            assert!(h
                .data_dir
                .join(crate::store::segment::index_file_name(start))
                .exists());
        }

        // Reads still see everything after mapping
        for byte in 1..=5u8 {
            assert!(index.find_key(&key(byte)).expect("find failed").is_some());
        }
    }

    #[test]
    fn test_persistor_rejects_sealed_segment_past_log_end() {
        let h = Harness::new();
        let index = h.build(StoreConfig::default().index_max_number_of_inmem_elements(2));

        for byte in 1..=3u8 {
            h.put(&index, byte, 50);
        }

        // Claw the log end back behind the sealed segment's end offset
        h.log.set_log_end_offset(40).expect("set end failed");
        h.log.set_size_in_bytes(40);

        assert!(matches!(index.persist(), Err(StoreError::Io(_))));
    }

    #[test]
    fn test_scheduler_registration_runs_persistor() {
        let h = Harness::new();
        let index = h.build(StoreConfig::default());
        assert_eq!(h.scheduler.task_count(), 1);

        h.put(&index, 1, 50);
        h.scheduler.run_all();

        assert!(h
            .data_dir
            .join(crate::store::segment::index_file_name(0))
            .exists());
    }

    #[test]
    fn test_clean_restart_round_trip() {
        let h = Harness::new();
        let config = StoreConfig::default().index_max_number_of_inmem_elements(2);

        let first_session;
        {
            let index = h.build(config.clone());
            for byte in 1..=5u8 {
                h.put(&index, byte, 50);
            }
            first_session = index.session_id();
            index.close().expect("close failed");
        }
        assert!(h.data_dir.join(CLEAN_SHUTDOWN_FILENAME).exists());

        let index = h.build(config);
        assert!(index.is_clean_shutdown());
        assert_ne!(index.session_id(), first_session);
        // The marker is consumed during startup
        assert!(!h.data_dir.join(CLEAN_SHUTDOWN_FILENAME).exists());

        assert_eq!(index.current_end_offset(), 250);
        for byte in 1..=5u8 {
            let value = index
                .find_key(&key(byte))
                .expect("find failed")
                .expect("missing after restart");
            assert_eq!(value.offset(), (byte as u64 - 1) * 50);
        }
        assert_eq!(index.log_end_offset_on_startup(), 250);
    }

    #[test]
    fn test_token_survives_clean_restart() {
        let h = Harness::new();
        let config = StoreConfig::default();

        let token = {
            let index = h.build(config.clone());
            h.put(&index, 1, 50);
            h.put(&index, 2, 50);
            let info = index
                .find_entries_since(&StoreFindToken::new(), 50)
                .expect("scan failed");
            index.close().expect("close failed");
            info.token().clone()
        };
        assert_eq!(token.offset(), 0);

        let index = h.build(config);
        let info = index.find_entries_since(&token, u64::MAX).expect("scan failed");
        let keys: Vec<_> = info.entries().iter().map(|m| m.key().clone()).collect();
        // The old-session token is honored; only entries past it come back
        assert!(keys.contains(&key(2)));
        assert!(info.token().bytes_read().is_some());
    }

    #[test]
    fn test_token_past_end_rejected_after_clean_restart() {
        let h = Harness::new();
        let config = StoreConfig::default();

        {
            let index = h.build(config.clone());
            h.put(&index, 1, 50);
            index.close().expect("close failed");
        }

        let index = h.build(config);
        assert!(index.is_clean_shutdown());

        let stale: StoreFindToken<TestKey> = StoreFindToken::journal_based(200, Uuid::new_v4());
        assert!(matches!(
            index.find_entries_since(&stale, u64::MAX),
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_crash_recovery_and_token_reset() {
        let h = Harness::new();
        let config = StoreConfig::default();

        {
            let index = h.build(config.clone());
            h.put(&index, 1, 100);
            // No close: nothing reaches disk, the log alone remembers
        }
        // A second message made it into the log before the crash
        h.log.set_size_in_bytes(150);

        let recovery = ListRecovery::empty().expect(
            0,
            150,
            vec![
                MessageInfo::new(key(1), 100, false, TTL_INFINITE),
                MessageInfo::new(key(2), 50, false, TTL_INFINITE),
            ],
        );
        let index = h.build_with_recovery(config, &recovery);

        assert!(!index.is_clean_shutdown());
        assert_eq!(index.current_end_offset(), 150);
        assert_eq!(index.log_end_offset_on_startup(), 150);

        let a = index.find_key(&key(1)).expect("find failed").expect("missing");
        assert_eq!((a.offset(), a.size()), (0, 100));
        let b = index.find_key(&key(2)).expect("find failed").expect("missing");
        assert_eq!((b.offset(), b.size()), (100, 50));

        // A token from the lost session pointing past the surviving log is
        // silently reset to the startup end offset
        let stale: StoreFindToken<TestKey> = StoreFindToken::journal_based(200, Uuid::new_v4());
        let info = index.find_entries_since(&stale, u64::MAX).expect("scan failed");
        assert!(info.entries().is_empty());
        assert_eq!(info.token().offset(), 150);
        assert_eq!(info.token().session_id(), Some(index.session_id()));
        assert_eq!(info.token().bytes_read(), Some(150));

        // Segment-shape tokens are validated the same way
        let stale = StoreFindToken::segment_based(key(1), 400, Uuid::new_v4());
        let info = index.find_entries_since(&stale, u64::MAX).expect("scan failed");
        assert_eq!(info.token().offset(), 150);
    }

    #[test]
    fn test_concurrent_reads_during_writes() {
        use std::thread;

        let h = Harness::new();
        let index = h.build(StoreConfig::default().index_max_number_of_inmem_elements(8));

        let mut handles = Vec::new();
        for reader_id in 0..4 {
            let index = index.clone();
            handles.push(thread::spawn(move || {
                let mut observed = 0usize;
                for round in 0..200 {
                    let byte = ((reader_id + round) % 64) as u8;
                    if index
                        .find_key(&key(byte))
                        .expect("find failed")
                        .is_some()
                    {
                        observed += 1;
                    }
                    let info = index
                        .find_entries_since(&StoreFindToken::new(), u64::MAX)
                        .expect("scan failed");
                    assert!(info.token().bytes_read().is_some());
                }
                observed
            }));
        }

        // The single writer keeps inserting while readers and the persistor
        // run against the same index
        for byte in 0..64u8 {
            h.put(&index, byte, 10);
            if byte % 16 == 0 {
                index.persist().expect("persist failed");
            }
        }

        for handle in handles {
            handle.join().expect("reader panicked");
        }
        for byte in 0..64u8 {
            assert!(index.find_key(&key(byte)).expect("find failed").is_some());
        }
    }

    #[test]
    fn test_recovery_of_delete_marker() {
        let h = Harness::new();
        h.log.set_size_in_bytes(110);

        let recovery = ListRecovery::empty().expect(
            0,
            110,
            vec![
                MessageInfo::new(key(1), 100, false, TTL_INFINITE),
                MessageInfo::new(key(1), 10, true, TTL_INFINITE),
            ],
        );
        let index = h.build_with_recovery(StoreConfig::default(), &recovery);

        let value = index.find_key(&key(1)).expect("find failed").expect("missing");
        assert!(value.is_flag_set(Flags::DeleteIndex));
        assert_eq!(value.offset(), 100);
        assert_eq!(value.size(), 10);
        assert_eq!(index.current_end_offset(), 110);
    }

    #[test]
    fn test_recovery_rejects_duplicate_non_delete() {
        let h = Harness::new();
        h.log.set_size_in_bytes(150);

        let recovery = ListRecovery::empty().expect(
            0,
            150,
            vec![
                MessageInfo::new(key(1), 100, false, TTL_INFINITE),
                MessageInfo::new(key(1), 50, false, TTL_INFINITE),
            ],
        );
        let result = PersistentIndex::new(
            h.data_dir.clone(),
            &h.scheduler,
            h.log.clone(),
            StoreConfig::default(),
            Arc::new(TestKeyFactory),
            &recovery,
        );
        assert!(matches!(result, Err(StoreError::InitializationError(_))));
    }

    #[test]
    fn test_corrupt_segment_file_fails_construction() {
        let h = Harness::new();
        {
            let index = h.build(StoreConfig::default());
            h.put(&index, 1, 50);
            index.close().expect("close failed");
        }

        let path = h.data_dir.join(crate::store::segment::index_file_name(0));
        let mut bytes = std::fs::read(&path).expect("Failed to read segment file");
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        std::fs::write(&path, &bytes).expect("Failed to rewrite segment file");

        let result = PersistentIndex::new(
            h.data_dir.clone(),
            &h.scheduler,
            h.log.clone(),
            StoreConfig::default(),
            Arc::new(TestKeyFactory),
            &ListRecovery::empty(),
        );
        assert!(matches!(result, Err(StoreError::IndexCreationFailure(_))));
    }

    #[test]
    fn test_reinsert_after_delete_resolves_to_latest() {
        let h = Harness::new();
        let index = h.build(StoreConfig::default());

        h.put(&index, 1, 50);
        h.delete(&index, 1, 10);
        h.put(&index, 1, 25);

        let value = index.find_key(&key(1)).expect("find failed").expect("missing");
        assert!(!value.is_flag_set(Flags::DeleteIndex));
        assert_eq!(value.offset(), 60);
        assert_eq!(value.size(), 25);
        assert!(index.get_blob_read_info(&key(1)).is_ok());

        let info = index
            .find_entries_since(&StoreFindToken::new(), u64::MAX)
            .expect("scan failed");
        let ones: Vec<_> = info
            .entries()
            .iter()
            .filter(|m| m.key() == &key(1))
            .collect();
        assert_eq!(ones.len(), 1);
        assert!(!ones[0].is_deleted());
    }

    #[tokio::test]
    async fn test_background_persistor_with_tokio_scheduler() {
        use crate::scheduler::TokioScheduler;

        let dir = TempDir::new().expect("Failed to create temp dir");
        let log = Arc::new(MemoryLog::new());
        let scheduler = TokioScheduler::new();
        let config = StoreConfig::default()
            .data_flush_delay(Duration::ZERO)
            .data_flush_interval(Duration::from_millis(10));

        let index = PersistentIndex::new(
            dir.path().to_path_buf(),
            &scheduler,
            log.clone(),
            config,
            Arc::new(TestKeyFactory),
            &ListRecovery::empty(),
        )
        .expect("Failed to build index");

        let span = log.append_blob(50);
        index
            .add_to_index(entry(1, span.start_offset(), 50), span)
            .expect("add failed");

        // The randomized initial delay can be up to a minute; flush directly
        // rather than waiting on the timer, then make sure shutdown is clean.
        index.persist().expect("persist failed");
        assert!(dir
            .path()
            .join(crate::store::segment::index_file_name(0))
            .exists());

        scheduler.shutdown();
        scheduler.join().await.expect("join failed");
    }
}
