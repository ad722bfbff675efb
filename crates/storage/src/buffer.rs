use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::page::Page;
use crate::replacer::{FrameId, Replacer, ReplacerPolicy};
use crate::{DiskManager, PageId};
use wal::LogManager;

/// Errors returned by the buffer pool manager.
#[derive(Debug, Error)]
pub enum BufferPoolError {
    /// The buffer pool lock was poisoned.
    #[error("buffer pool lock poisoned")]
    LockPoisoned,
    /// The underlying disk manager failed.
    #[error("disk manager error: {0}")]
    Io(#[from] std::io::Error),
    /// WAL flush failed.
    #[error("wal error: {0}")]
    Wal(#[from] wal::WalError),
}

/// Convenience alias for buffer pool results.
pub type BufferPoolResult<T> = Result<T, BufferPoolError>;

/// Guard that provides access to a pinned page while holding the pool lock.
///
/// Dropping the guard releases the lock but not the pin; the page stays
/// resident and in place until `unpin_page` brings its pin count to zero.
pub struct PageGuard<'a> {
    state: MutexGuard<'a, BufferPoolState>,
    frame_id: FrameId,
}

impl<'a> PageGuard<'a> {
    /// Returns the frame id backing this guard.
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }
}

impl Deref for PageGuard<'_> {
    type Target = Page;

    fn deref(&self) -> &Self::Target {
        &self.state.pages[self.frame_id]
    }
}

impl DerefMut for PageGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.state.pages[self.frame_id]
    }
}

struct BufferPoolState {
    disk_manager: DiskManager,
    replacer: Box<dyn Replacer + Send>,
    // Frames are allocated once here and the vector is never resized, so a
    // pinned page keeps its address for the life of the pool.
    pages: Vec<Page>,
    page_table: HashMap<PageId, FrameId>,
    free_list: Vec<FrameId>,
    log_manager: Option<Arc<LogManager>>,
}

#[derive(Default)]
struct BufferPoolMetrics {
    fetch_count: AtomicUsize,
}

/// Buffer pool manager for caching pages between disk and memory.
///
/// A single mutex guards the page table, free list, and every frame; disk
/// I/O happens under it. Handles are cheap to clone and share one pool.
#[derive(Clone)]
pub struct BufferPoolManager {
    inner: Arc<Mutex<BufferPoolState>>,
    metrics: Arc<BufferPoolMetrics>,
}

/// Flush mode for buffer pool writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Defer disk sync to later (default behavior).
    Lazy,
    /// Force the disk write to be synced.
    Force,
}

impl BufferPoolManager {
    /// Creates a new buffer pool manager with a fixed number of frames and
    /// LRU replacement.
    pub fn new(disk_manager: DiskManager, pool_size: usize) -> Self {
        Self::with_policy_and_log(disk_manager, pool_size, ReplacerPolicy::Lru, None)
    }

    /// Creates a pool with the given replacement policy.
    pub fn with_policy(disk_manager: DiskManager, pool_size: usize, policy: ReplacerPolicy) -> Self {
        Self::with_policy_and_log(disk_manager, pool_size, policy, None)
    }

    /// Creates an LRU pool coupled to a write-ahead log.
    pub fn new_with_log(
        disk_manager: DiskManager,
        pool_size: usize,
        log_manager: Option<Arc<LogManager>>,
    ) -> Self {
        Self::with_policy_and_log(disk_manager, pool_size, ReplacerPolicy::Lru, log_manager)
    }

    pub fn with_policy_and_log(
        disk_manager: DiskManager,
        pool_size: usize,
        policy: ReplacerPolicy,
        log_manager: Option<Arc<LogManager>>,
    ) -> Self {
        let pages = vec![Page::new(); pool_size];
        let free_list = (0..pool_size).rev().collect();
        let state = BufferPoolState {
            disk_manager,
            replacer: policy.build(pool_size),
            pages,
            page_table: HashMap::new(),
            free_list,
            log_manager,
        };
        Self {
            inner: Arc::new(Mutex::new(state)),
            metrics: Arc::new(BufferPoolMetrics::default()),
        }
    }

    fn lock_state(&self) -> BufferPoolResult<MutexGuard<'_, BufferPoolState>> {
        self.inner.lock().map_err(|_| BufferPoolError::LockPoisoned)
    }

    /// Returns the number of page fetches since last reset.
    pub fn fetch_count(&self) -> usize {
        self.metrics.fetch_count.load(Ordering::Relaxed)
    }

    /// Resets the fetch counter to zero.
    pub fn reset_fetch_count(&self) {
        self.metrics.fetch_count.store(0, Ordering::Relaxed)
    }

    /// Takes a frame for a new resident: the free list first, so a cold
    /// pool warms every frame before evicting anything, then a replacer
    /// victim, written back if dirty. `None` means every frame is pinned.
    fn take_frame(state: &mut BufferPoolState) -> BufferPoolResult<Option<FrameId>> {
        if let Some(frame_id) = state.free_list.pop() {
            return Ok(Some(frame_id));
        }
        let Some(frame_id) = state.replacer.victim() else {
            return Ok(None);
        };
        if let Err(error) = Self::evict_resident(state, frame_id) {
            // The frame still holds its page; re-track it so it cannot leak.
            state.replacer.unpin(frame_id);
            return Err(error);
        }
        Ok(Some(frame_id))
    }

    fn evict_resident(state: &mut BufferPoolState, frame_id: FrameId) -> BufferPoolResult<()> {
        let (disk_manager, pages, page_table) = (
            &mut state.disk_manager,
            &mut state.pages,
            &mut state.page_table,
        );
        if let Some(old_page_id) = pages[frame_id].page_id {
            if pages[frame_id].is_dirty {
                if let Some(log_manager) = &state.log_manager {
                    log_manager.flush(pages[frame_id].lsn())?;
                }
                let data = pages[frame_id].data();
                disk_manager.write_page(old_page_id, data)?;
            }
            page_table.remove(&old_page_id);
        }
        Ok(())
    }

    fn flush_page_data(
        state: &mut BufferPoolState,
        page_id: PageId,
        data: &[u8; crate::PAGE_SIZE],
        lsn: u64,
        force_disk: bool,
    ) -> BufferPoolResult<()> {
        if let Some(log_manager) = &state.log_manager {
            log_manager.flush(lsn)?;
        }
        state.disk_manager.write_page(page_id, data)?;
        if force_disk {
            state.disk_manager.sync_data()?;
        }
        Ok(())
    }

    /// Allocates a new page on disk and pins it in the buffer pool.
    ///
    /// Returns `None` when the free list is empty and every resident frame
    /// is pinned. The new page is zeroed, clean, and pinned once; fetching
    /// it is a guaranteed hit until it is unpinned and evicted.
    pub fn new_page(&self) -> BufferPoolResult<Option<PageId>> {
        let mut state = self.lock_state()?;
        let Some(frame_id) = Self::take_frame(&mut state)? else {
            return Ok(None);
        };

        let page_id = match state.disk_manager.allocate_page() {
            Ok(page_id) => page_id,
            Err(error) => {
                // Allocation failed after the frame was already vacated;
                // hand the frame back rather than leaking it.
                state.pages[frame_id].reset_memory();
                state.free_list.push(frame_id);
                return Err(error.into());
            }
        };
        {
            let page = &mut state.pages[frame_id];
            page.reset_memory();
            page.page_id = Some(page_id);
            page.pin_count = 1;
        }
        state.page_table.insert(page_id, frame_id);
        state.replacer.pin(frame_id);
        Ok(Some(page_id))
    }

    /// Fetches a page into memory and pins it, returning a guarded
    /// reference. Every hit increments the pin count; every miss reads the
    /// page from disk. `None` means no frame could be vacated.
    pub fn fetch_page(&self, page_id: PageId) -> BufferPoolResult<Option<PageGuard<'_>>> {
        self.metrics.fetch_count.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock_state()?;
        if let Some(&frame_id) = state.page_table.get(&page_id) {
            let page = &mut state.pages[frame_id];
            page.pin_count += 1;
            state.replacer.pin(frame_id);
            return Ok(Some(PageGuard { state, frame_id }));
        }

        let Some(frame_id) = Self::take_frame(&mut state)? else {
            return Ok(None);
        };
        {
            let state = &mut *state;
            let (disk_manager, pages) = (&mut state.disk_manager, &mut state.pages);
            let page = &mut pages[frame_id];
            page.reset_memory();
            if let Err(error) = disk_manager.read_page(page_id, page.data_mut()) {
                // Nothing was installed yet; the frame goes back to the
                // free list so the pool stays consistent.
                state.free_list.push(frame_id);
                return Err(error.into());
            }
            page.page_id = Some(page_id);
            page.pin_count = 1;
        }
        state.page_table.insert(page_id, frame_id);
        state.replacer.pin(frame_id);
        Ok(Some(PageGuard { state, frame_id }))
    }

    /// Unpins a page and optionally marks it dirty.
    ///
    /// Returns false when the page is not resident or its pin count is
    /// already zero; the count never goes negative.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> BufferPoolResult<bool> {
        let mut state = self.lock_state()?;
        let frame_id = match state.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return Ok(false),
        };
        let page = &mut state.pages[frame_id];
        if page.pin_count == 0 {
            return Ok(false);
        }
        if is_dirty {
            page.is_dirty = true;
        }
        page.pin_count -= 1;
        if page.pin_count == 0 {
            state.replacer.unpin(frame_id);
        }
        Ok(true)
    }

    /// Flushes a page to disk, if present. Pin state is ignored.
    pub fn flush_page(&self, page_id: PageId) -> BufferPoolResult<bool> {
        self.flush_page_with_mode(page_id, FlushMode::Lazy)
    }

    pub fn flush_page_with_mode(&self, page_id: PageId, mode: FlushMode) -> BufferPoolResult<bool> {
        let mut state = self.lock_state()?;
        let frame_id = match state.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return Ok(false),
        };
        let (data, lsn) = {
            let page = &state.pages[frame_id];
            (*page.data(), page.lsn())
        };
        Self::flush_page_data(&mut state, page_id, &data, lsn, mode == FlushMode::Force)?;
        state.pages[frame_id].is_dirty = false;
        Ok(true)
    }

    /// Flushes all dirty resident pages to disk.
    pub fn flush_all_pages(&self) -> BufferPoolResult<()> {
        self.flush_all_pages_with_mode(FlushMode::Lazy)
    }

    pub fn flush_all_pages_with_mode(&self, mode: FlushMode) -> BufferPoolResult<()> {
        let mut state = self.lock_state()?;
        let page_ids = state
            .pages
            .iter()
            .filter_map(|page| page.page_id)
            .collect::<Vec<_>>();
        for page_id in page_ids {
            let frame_id = match state.page_table.get(&page_id) {
                Some(&frame_id) => frame_id,
                None => continue,
            };
            let (data, lsn, is_dirty) = {
                let page = &state.pages[frame_id];
                (*page.data(), page.lsn(), page.is_dirty)
            };
            if !is_dirty {
                continue;
            }
            Self::flush_page_data(&mut state, page_id, &data, lsn, mode == FlushMode::Force)?;
            state.pages[frame_id].is_dirty = false;
        }
        Ok(())
    }

    /// Deletes a page from the pool and deallocates it on disk.
    ///
    /// Returns false when the page is not resident or still pinned. On
    /// success the frame is reset and returned to the free list.
    pub fn delete_page(&self, page_id: PageId) -> BufferPoolResult<bool> {
        let mut state = self.lock_state()?;
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(false);
        };
        if state.pages[frame_id].pin_count > 0 {
            return Ok(false);
        }
        state.page_table.remove(&page_id);
        state.replacer.pin(frame_id);
        state.pages[frame_id].reset_memory();
        state.free_list.push(frame_id);
        state.disk_manager.deallocate_page(page_id)?;
        Ok(true)
    }
}
