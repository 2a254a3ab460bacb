//! Bounded page cache with strict LRU eviction and dirty write-back.
//!
//! All map and recency state lives behind one mutex. Write-backs run after the
//! lock is dropped, so a slow log service never stalls concurrent lookups.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::types::{page_key, Lsn, NimbusError, PageBuf, PageId, Result, PAGE_SIZE};

/// Persists the contents of a dirty page before it leaves the cache.
pub trait WriteBack: Send + Sync {
    /// Durably records `data` as the new image of `page_id`.
    fn write_back(&self, page_id: PageId, data: &[u8]) -> Result<Lsn>;
}

struct CachedPage {
    page_id: PageId,
    data: PageBuf,
    lsn: Lsn,
    dirty: bool,
    last_access: Instant,
}

/// Counters kept by the cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from memory.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Entries removed to make room.
    pub evictions: u64,
    /// Successful dirty write-backs.
    pub writebacks: u64,
    /// Write-backs that failed; the page was discarded regardless.
    pub writeback_failures: u64,
}

/// What happened to the cache on [`PageCache::insert`] or [`PageCache::store`].
#[derive(Debug)]
pub enum InsertOutcome {
    /// New entry, nothing evicted.
    Inserted,
    /// The page was already cached and its contents were replaced.
    Replaced,
    /// A fetched image arrived for a page that is cached or still being
    /// written back; the resident image was kept.
    Kept,
    /// The least recently used page made room; it was written back first if dirty.
    Evicted {
        /// Page that left the cache.
        page_id: PageId,
        /// Whether a write-back was performed.
        written_back: bool,
    },
    /// A dirty victim could not be written back and was dropped anyway.
    WriteBackFailed {
        /// Page that left the cache.
        page_id: PageId,
        /// Failure reported by the write-back hook.
        error: NimbusError,
    },
}

/// Image of a page whose write-back has not finished yet.
struct InFlight {
    seq: u64,
    data: PageBuf,
}

struct Victim {
    key: u64,
    page: CachedPage,
    seq: Option<u64>,
}

struct CacheState {
    entries: LruCache<u64, CachedPage>,
    writing: HashMap<u64, InFlight>,
    next_seq: u64,
    stats: CacheStats,
}

impl CacheState {
    fn begin_write(&mut self, key: u64, data: &PageBuf) -> u64 {
        self.next_seq += 1;
        self.writing.insert(
            key,
            InFlight {
                seq: self.next_seq,
                data: data.clone(),
            },
        );
        self.next_seq
    }

    /// Forgets an in-flight image unless a later write-back replaced it.
    fn finish_write(&mut self, key: u64, seq: u64) {
        if self.writing.get(&key).is_some_and(|pending| pending.seq == seq) {
            self.writing.remove(&key);
        }
    }
}

/// Fixed-capacity page cache keyed by [`page_key`].
pub struct PageCache {
    state: Mutex<CacheState>,
    capacity: usize,
    writer: Arc<dyn WriteBack>,
}

impl PageCache {
    /// Creates an empty cache holding at most `capacity` pages.
    pub fn new(capacity: usize, writer: Arc<dyn WriteBack>) -> Result<Self> {
        let bound =
            NonZeroUsize::new(capacity).ok_or(NimbusError::Invalid("cache capacity must be positive"))?;
        Ok(Self {
            state: Mutex::new(CacheState {
                entries: LruCache::new(bound),
                writing: HashMap::new(),
                next_seq: 0,
                stats: CacheStats::default(),
            }),
            capacity,
            writer,
        })
    }

    /// Copies out the cached page and marks it most recently used.
    ///
    /// A page evicted but still being written back is served from its
    /// in-flight image.
    pub fn lookup(&self, page_id: &PageId) -> Option<PageBuf> {
        let key = page_key(page_id);
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let found = match state.entries.get_mut(&key) {
            Some(page) => {
                page.last_access = Instant::now();
                Some(page.data.clone())
            }
            None => state.writing.get(&key).map(|pending| pending.data.clone()),
        };
        if found.is_some() {
            state.stats.hits += 1;
        } else {
            state.stats.misses += 1;
        }
        found
    }

    /// Whether the page is cached. Does not touch recency.
    pub fn contains(&self, page_id: &PageId) -> bool {
        self.state.lock().entries.contains(&page_key(page_id))
    }

    /// Caches a clean page fetched from the page service.
    ///
    /// A fetch never overwrites a newer image: when the page is already
    /// cached or still being written back, that image is kept. Returns the
    /// image now current for the page.
    pub fn insert(&self, page_id: PageId, data: PageBuf) -> Result<(PageBuf, InsertOutcome)> {
        check_len(page_id, &data)?;
        let key = page_key(&page_id);
        let (current, victim) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if let Some(page) = state.entries.get_mut(&key) {
                page.last_access = Instant::now();
                return Ok((page.data.clone(), InsertOutcome::Kept));
            }
            if let Some(pending) = state.writing.get(&key) {
                return Ok((pending.data.clone(), InsertOutcome::Kept));
            }
            let current = data.clone();
            let victim = self.place(state, key, page_id, data, Lsn::default(), false);
            (current, victim)
        };
        Ok((current, self.settle(victim)))
    }

    /// Caches a page image, evicting the least recently used page when full.
    ///
    /// A dirty victim is written back after the lock is released. A failed
    /// write-back is counted and reported but the victim stays evicted.
    pub fn store(
        &self,
        page_id: PageId,
        data: PageBuf,
        lsn: Lsn,
        dirty: bool,
    ) -> Result<InsertOutcome> {
        check_len(page_id, &data)?;
        let key = page_key(&page_id);
        let victim = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if let Some(page) = state.entries.get_mut(&key) {
                page.data = data;
                page.lsn = lsn;
                page.dirty |= dirty;
                page.last_access = Instant::now();
                return Ok(InsertOutcome::Replaced);
            }
            self.place(state, key, page_id, data, lsn, dirty)
        };
        Ok(self.settle(victim))
    }

    /// Puts a new entry, popping the LRU entry first when full. Runs under the lock.
    fn place(
        &self,
        state: &mut CacheState,
        key: u64,
        page_id: PageId,
        data: PageBuf,
        lsn: Lsn,
        dirty: bool,
    ) -> Option<Victim> {
        let victim = if state.entries.len() >= self.capacity {
            state.entries.pop_lru()
        } else {
            None
        };
        let victim = victim.map(|(victim_key, page)| {
            state.stats.evictions += 1;
            let seq = page.dirty.then(|| state.begin_write(victim_key, &page.data));
            Victim {
                key: victim_key,
                page,
                seq,
            }
        });
        state.entries.put(
            key,
            CachedPage {
                page_id,
                data,
                lsn,
                dirty,
                last_access: Instant::now(),
            },
        );
        victim
    }

    /// Writes back a dirty victim outside the lock.
    fn settle(&self, victim: Option<Victim>) -> InsertOutcome {
        let Some(Victim { key, page, seq }) = victim else {
            return InsertOutcome::Inserted;
        };
        debug!(
            page = %page.page_id,
            dirty = page.dirty,
            idle_ms = page.last_access.elapsed().as_millis() as u64,
            "cache.evict"
        );
        let Some(seq) = seq else {
            return InsertOutcome::Evicted {
                page_id: page.page_id,
                written_back: false,
            };
        };
        let result = self.writer.write_back(page.page_id, &page.data);
        let mut state = self.state.lock();
        state.finish_write(key, seq);
        match result {
            Ok(_) => {
                state.stats.writebacks += 1;
                InsertOutcome::Evicted {
                    page_id: page.page_id,
                    written_back: true,
                }
            }
            Err(error) => {
                state.stats.writeback_failures += 1;
                drop(state);
                warn!(
                    page = %page.page_id,
                    lsn = %page.lsn,
                    error = %error,
                    "cache.evict.writeback_failed"
                );
                InsertOutcome::WriteBackFailed {
                    page_id: page.page_id,
                    error,
                }
            }
        }
    }

    /// Flags a cached page as modified. Returns false when it is not cached.
    pub fn mark_dirty(&self, page_id: &PageId) -> bool {
        let mut state = self.state.lock();
        match state.entries.peek_mut(&page_key(page_id)) {
            Some(page) => {
                page.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Whether the page is cached and dirty.
    pub fn is_dirty(&self, page_id: &PageId) -> bool {
        self.state
            .lock()
            .entries
            .peek(&page_key(page_id))
            .is_some_and(|page| page.dirty)
    }

    /// Writes back every dirty page in one pass, in no particular order.
    ///
    /// Pages that fail stay dirty; one evicted while its write was in flight
    /// is cached again as dirty. Every page is attempted and the first error
    /// is returned. On success returns how many pages were written.
    pub fn flush_dirty(&self) -> Result<usize> {
        let pending: Vec<(u64, u64, PageId, Lsn, PageBuf)> = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut dirty = Vec::new();
            for (key, page) in state.entries.iter_mut() {
                if page.dirty {
                    page.dirty = false;
                    dirty.push((*key, page.page_id, page.lsn, page.data.clone()));
                }
            }
            dirty
                .into_iter()
                .map(|(key, page_id, lsn, data)| {
                    let seq = state.begin_write(key, &data);
                    (key, seq, page_id, lsn, data)
                })
                .collect()
        };
        let mut written = 0;
        let mut first_error = None;
        for (key, seq, page_id, lsn, data) in pending {
            match self.writer.write_back(page_id, &data) {
                Ok(_) => {
                    written += 1;
                    self.state.lock().finish_write(key, seq);
                }
                Err(error) => {
                    warn!(page = %page_id, error = %error, "cache.flush.writeback_failed");
                    self.state.lock().stats.writeback_failures += 1;
                    if !self.mark_dirty(&page_id) {
                        warn!(page = %page_id, "cache.flush.recached");
                        if let Err(err) = self.store(page_id, data, lsn, true) {
                            warn!(page = %page_id, error = %err, "cache.flush.recache_failed");
                        }
                    }
                    self.state.lock().finish_write(key, seq);
                    first_error.get_or_insert(error);
                }
            }
        }
        self.state.lock().stats.writebacks += written as u64;
        match first_error {
            Some(error) => Err(error),
            None => Ok(written),
        }
    }

    /// Number of cached pages.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the cache holds no pages.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of cached pages.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }
}

fn check_len(page_id: PageId, data: &[u8]) -> Result<()> {
    if data.len() == PAGE_SIZE {
        return Ok(());
    }
    Err(NimbusError::InvalidOwned(format!(
        "page {page_id} has {} bytes, expected {PAGE_SIZE}",
        data.len()
    )))
}

impl Drop for PageCache {
    fn drop(&mut self) {
        if let Err(err) = self.flush_dirty() {
            warn!(error = %err, "cache.teardown.flush_failed");
        }
    }
}
