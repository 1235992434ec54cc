// =============================================================================
// Ferrox — Block Buffer Cache
// =============================================================================
//
// An in-memory mirror of disk blocks with at-most-one-resident-copy
// semantics: for any (device, block) pair there is never more than one
// valid cache entry, no matter how many tasks ask for it at once.
//
// MEMORY:
//   All buffers live in one fixed arena. Headers are carved from one end,
//   1 KiB data blocks from the other; when the two meet, the cache is at
//   capacity and existing buffers are recycled in place forever - the
//   struct survives, only its (device, block) identity changes.
//
// EVICTION:
//   The free list doubles as an LRU: buffers are reinserted at the tail
//   when claimed, so the head end holds the coldest entries. A scan skips
//   pinned buffers and scores the rest by eviction *cost*, not recency:
//
//       score = locked + 2 * dirty
//
//   0 = reuse now, 1 = must wait for an unlock, 2 = must write back,
//   3 = both. The first zero-score candidate wins immediately; otherwise
//   the first global minimum does.
//
// CONTENTION:
//   Single core, no atomics: every claim sequence runs under the
//   preemption mask, and every suspension point (lock wait, write-back,
//   exhaustion) is followed by re-validation and, if the world changed, a
//   retry from the top. Races are resolved by retrying, not by locking
//   harder.
//
// =============================================================================

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::arch::irq::IrqSave;
use crate::drivers::block::{BlockDevice, DevId, DeviceError, Dir, ReqFlags, SECTOR_SIZE};
use crate::sync::Mutex;
use crate::task::{Scheduler, TaskState, WaitChannel};
use crate::util::list::{List, ListNode};

/// Bytes per cache block (two sectors, the Minix block size).
pub const BLOCK_SIZE: usize = 1024;

/// Sectors per cache block.
pub const SECTORS_PER_BLOCK: usize = BLOCK_SIZE / SECTOR_SIZE;

/// Hash buckets; a prime spreads dev^block reasonably.
const HASH_BUCKETS: usize = 31;

/// Default arena reserved for the cache.
pub const BUFFER_ARENA_SIZE: usize = 512 * 1024;

/// Handle to a cache entry. Indexes are stable: buffers are recycled, never
/// deallocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufId(pub(crate) usize);

impl BufId {
    #[inline]
    pub fn index(&self) -> usize {
        self.0
    }
}

/// One cache line: a block-sized window onto a device.
pub(crate) struct Buffer {
    dev: DevId,
    blknr: u32,
    /// Offset of this buffer's data block in the arena.
    data_off: usize,
    /// Out of sync with the disk; must be written back before the identity
    /// can change.
    dirty: bool,
    /// Holds the block's current on-disk contents.
    valid: bool,
    /// Pin count. Non-zero means some task is using the buffer and it must
    /// not be recycled.
    count: u32,
    /// Exclusive-access lock, the buffer's one and only exclusion
    /// primitive.
    lock: Mutex,
    /// How many tasks are parked on the contention queue for this buffer.
    /// A buffer somebody is already waiting for is not offered to eviction.
    waiters: u16,
    /// Membership in `hash[hash(dev, blknr)]` while the identity is live.
    hash_node: ListNode,
    /// Membership in the free/LRU list.
    free_node: ListNode,
}

impl Buffer {
    fn new(slot: usize, data_off: usize) -> Self {
        Self {
            dev: DevId::MAX,
            blknr: 0,
            data_off,
            dirty: false,
            valid: false,
            count: 0,
            lock: Mutex::new(),
            waiters: 0,
            hash_node: ListNode::new(slot),
            free_node: ListNode::new(slot),
        }
    }

    /// Eviction cost: `locked + 2 * dirty`.
    #[inline]
    fn score(&self) -> u32 {
        self.lock.is_locked() as u32 + ((self.dirty as u32) << 1)
    }
}

pub struct BufferCache {
    /// The fixed memory region data blocks are carved from (tail end);
    /// header accounting grows from the front.
    arena: Box<[u8]>,
    /// Carved headers. Capacity is reserved up front so entries never
    /// move; the embedded list nodes depend on stable addresses.
    bufs: Vec<Buffer>,
    /// Free/LRU list: every carved buffer, coldest at the head.
    free: Box<List>,
    /// Hash index over live identities, keyed by dev ^ block.
    hash: Vec<Box<List>>,
    /// Tasks waiting for *any* buffer to become reusable.
    exhausted: Box<List>,
    /// Tasks waiting for one *specific* locked buffer, matched by the
    /// task's wait channel.
    contended: Box<List>,
}

impl BufferCache {
    /// Build a cache over `arena_size` bytes of storage.
    pub fn new(arena_size: usize) -> Self {
        let max_buffers = arena_size / (core::mem::size_of::<Buffer>() + BLOCK_SIZE);
        let mut hash = Vec::with_capacity(HASH_BUCKETS);
        for _ in 0..HASH_BUCKETS {
            hash.push(List::new());
        }
        Self {
            arena: vec![0u8; arena_size].into_boxed_slice(),
            bufs: Vec::with_capacity(max_buffers),
            free: List::new(),
            hash,
            exhausted: List::new(),
            contended: List::new(),
        }
    }

    #[inline]
    fn bucket(dev: DevId, blknr: u32) -> usize {
        ((dev ^ blknr) as usize) % HASH_BUCKETS
    }

    /// Number of carved buffers.
    pub fn resident(&self) -> usize {
        self.bufs.len()
    }

    // ── Data access ─────────────────────────────────────────────

    pub fn data(&self, id: BufId) -> &[u8] {
        let off = self.bufs[id.0].data_off;
        &self.arena[off..off + BLOCK_SIZE]
    }

    pub fn data_mut(&mut self, id: BufId) -> &mut [u8] {
        let off = self.bufs[id.0].data_off;
        &mut self.arena[off..off + BLOCK_SIZE]
    }

    pub fn dev(&self, id: BufId) -> DevId {
        self.bufs[id.0].dev
    }

    pub fn block(&self, id: BufId) -> u32 {
        self.bufs[id.0].blknr
    }

    pub fn is_dirty(&self, id: BufId) -> bool {
        self.bufs[id.0].dirty
    }

    pub fn is_valid(&self, id: BufId) -> bool {
        self.bufs[id.0].valid
    }

    pub fn ref_count(&self, id: BufId) -> u32 {
        self.bufs[id.0].count
    }

    /// Mark a buffer's contents newer than the disk. Callers do this after
    /// writing into `data_mut`.
    pub fn mark_dirty(&mut self, id: BufId) {
        self.bufs[id.0].dirty = true;
    }

    // ── Acquisition ─────────────────────────────────────────────

    /// Pin the buffer for `(dev, blknr)`, creating or recycling one if the
    /// block is not resident.
    ///
    /// Never fails for lack of resources: when every buffer is pinned the
    /// caller sleeps on the exhaustion queue and retries once something is
    /// released. The device only gets involved when a dirty victim must be
    /// flushed, which is the one way this can error.
    pub fn acquire(
        &mut self,
        sched: &mut Scheduler,
        disk: &mut dyn BlockDevice,
        dev: DevId,
        blknr: u32,
    ) -> Result<BufId, DeviceError> {
        let _irq = IrqSave::masked();
        loop {
            // Resident? Pin and go.
            if let Some(id) = self.find(dev, blknr) {
                self.bufs[id.0].count += 1;
                return Ok(id);
            }

            // Room to carve a brand-new buffer?
            if let Some(id) = self.carve() {
                self.claim(id, dev, blknr);
                return Ok(id);
            }

            // Hunt for the cheapest victim on the LRU.
            let Some(id) = self.scan_candidate() else {
                // Nothing reusable at all: sleep until a release, then
                // start over.
                log::debug!("buffer cache exhausted, task {} waits", sched.getpid());
                sched.block(Some(&mut self.exhausted), None, TaskState::Blocked);
                continue;
            };

            // A locked victim means waiting for its holder; afterwards the
            // world may have moved on, so re-validate.
            if self.bufs[id.0].lock.is_locked() {
                self.bufs[id.0].waiters += 1;
                sched.current_task_mut().wait_on = Some(WaitChannel::BufferSlot(id.0));
                sched.block(Some(&mut self.contended), None, TaskState::Blocked);
                if self.bufs[id.0].count > 0 {
                    continue;
                }
            }

            // A dirty victim is flushed first; the write suspends us, so
            // re-validate again.
            if self.bufs[id.0].dirty {
                self.write_back(disk, id)?;
                if self.bufs[id.0].count > 0 {
                    continue;
                }
            }

            // Someone may have raced this exact block into the cache while
            // we slept; the hash table has the final word.
            if self.find(dev, blknr).is_some() {
                continue;
            }

            self.claim(id, dev, blknr);
            return Ok(id);
        }
    }

    /// Pin the buffer for `(dev, blknr)` and make sure it holds the
    /// on-disk contents, reading it in if necessary.
    pub fn read(
        &mut self,
        sched: &mut Scheduler,
        disk: &mut dyn BlockDevice,
        dev: DevId,
        blknr: u32,
    ) -> Result<BufId, DeviceError> {
        let id = self.acquire(sched, disk, dev, blknr)?;
        if self.bufs[id.0].valid {
            return Ok(id);
        }

        let off = self.bufs[id.0].data_off;
        disk.request(
            &mut self.arena[off..off + BLOCK_SIZE],
            SECTORS_PER_BLOCK,
            blknr as u64 * SECTORS_PER_BLOCK as u64,
            ReqFlags::empty(),
            Dir::Read,
        )?;

        let _irq = IrqSave::masked();
        let b = &mut self.bufs[id.0];
        b.valid = true;
        b.dirty = false;
        Ok(id)
    }

    /// Flush a dirty buffer to disk. Clean buffers are a no-op.
    pub fn write_back(
        &mut self,
        disk: &mut dyn BlockDevice,
        id: BufId,
    ) -> Result<(), DeviceError> {
        if !self.bufs[id.0].dirty {
            return Ok(());
        }
        let off = self.bufs[id.0].data_off;
        let blknr = self.bufs[id.0].blknr;
        disk.request(
            &mut self.arena[off..off + BLOCK_SIZE],
            SECTORS_PER_BLOCK,
            blknr as u64 * SECTORS_PER_BLOCK as u64,
            ReqFlags::empty(),
            Dir::Write,
        )?;
        let _irq = IrqSave::masked();
        self.bufs[id.0].dirty = false;
        Ok(())
    }

    /// Drop one pin. The final release flushes a dirty buffer and gives
    /// the exhaustion queue a chance: one reusable slot means one waiter
    /// can make progress.
    pub fn release(&mut self, sched: &mut Scheduler, disk: &mut dyn BlockDevice, id: BufId) {
        let _irq = IrqSave::masked();
        {
            let b = &mut self.bufs[id.0];
            assert!(b.count > 0, "releasing a buffer with no references");
            b.count -= 1;
            if b.count > 0 {
                return;
            }
        }

        if self.bufs[id.0].dirty {
            // Keep the dirty bit on failure; the block stays eligible for
            // a later flush instead of silently losing data.
            if let Err(e) = self.write_back(disk, id) {
                log::error!(
                    "write-back of ({}, {}) failed: {}",
                    self.bufs[id.0].dev,
                    self.bufs[id.0].blknr,
                    e
                );
            }
        }

        // SAFETY: exhaustion-queue nodes belong to resident tasks.
        let oldest = unsafe { self.exhausted.pop_front() };
        if let Some(node) = oldest {
            let slot = unsafe { (*node).owner() };
            sched.unblock(Some(slot));
        }
    }

    // ── Exclusive access ────────────────────────────────────────

    /// Take the buffer's exclusive lock (sleeping if held).
    pub fn lock(&mut self, sched: &mut Scheduler, id: BufId) {
        self.bufs[id.0].lock.lock(sched);
    }

    /// Release the exclusive lock and wake every task that was waiting for
    /// this specific buffer on the contention queue.
    pub fn unlock(&mut self, sched: &mut Scheduler, id: BufId) {
        let _irq = IrqSave::masked();
        self.bufs[id.0].lock.unlock(sched);

        // Match waiters by their wait channel (the queue is shared by all
        // buffers), collect first, then wake.
        let mut woken: Vec<usize> = Vec::new();
        for node in self.contended.iter() {
            let task_slot = unsafe { (*node).owner() };
            let waits_here = sched
                .task(task_slot)
                .map(|t| t.wait_on == Some(WaitChannel::BufferSlot(id.0)))
                .unwrap_or(false);
            if waits_here {
                woken.push(task_slot);
            }
        }
        for task_slot in woken {
            self.bufs[id.0].waiters -= 1;
            sched.unblock(Some(task_slot));
        }
    }

    /// Whether the buffer's exclusive lock is currently held.
    pub fn is_locked(&self, id: BufId) -> bool {
        self.bufs[id.0].lock.is_locked()
    }

    /// Write back every dirty buffer belonging to `dev`.
    pub fn sync(&mut self, disk: &mut dyn BlockDevice, dev: DevId) -> Result<(), DeviceError> {
        for i in 0..self.bufs.len() {
            if self.bufs[i].dirty && self.bufs[i].dev == dev {
                self.write_back(disk, BufId(i))?;
            }
        }
        Ok(())
    }

    // ── Internals ───────────────────────────────────────────────

    /// Hash lookup, no pin.
    fn find(&self, dev: DevId, blknr: u32) -> Option<BufId> {
        let bucket = &self.hash[Self::bucket(dev, blknr)];
        for node in bucket.iter() {
            let idx = unsafe { (*node).owner() };
            let b = &self.bufs[idx];
            if b.dev == dev && b.blknr == blknr {
                return Some(BufId(idx));
            }
        }
        None
    }

    /// Carve a fresh buffer if the header and data ends of the arena have
    /// not met yet.
    fn carve(&mut self) -> Option<BufId> {
        debug_assert!(!crate::arch::irq::enabled());
        let next = self.bufs.len() + 1;
        if next * core::mem::size_of::<Buffer>() + next * BLOCK_SIZE > self.arena.len() {
            return None;
        }
        let slot = self.bufs.len();
        let data_off = self.arena.len() - next * BLOCK_SIZE;
        self.bufs.push(Buffer::new(slot, data_off));
        log::trace!("carved buffer {} (data at {:#x})", slot, data_off);
        Some(BufId(slot))
    }

    /// LRU scan for the cheapest eviction victim.
    ///
    /// Pinned buffers and buffers with a registered waiter are untouchable.
    /// Among the rest, the first zero-score candidate short-circuits;
    /// otherwise the first buffer with the minimal score wins. The formula
    /// is a cost proxy, deliberately not a strict LRU.
    fn scan_candidate(&self) -> Option<BufId> {
        let mut best: Option<BufId> = None;
        for node in self.free.iter() {
            let idx = unsafe { (*node).owner() };
            let b = &self.bufs[idx];
            if b.count > 0 || b.waiters > 0 {
                continue;
            }
            if best.is_none() {
                best = Some(BufId(idx));
            }
            let best_idx = best.map(|i| i.0).unwrap_or(idx);
            if self.bufs[best_idx].score() == 0 {
                break;
            }
            if b.score() < self.bufs[best_idx].score() {
                best = Some(BufId(idx));
            }
        }
        best
    }

    /// Give a buffer its new identity and move it to the right chains:
    /// hash bucket for the new (dev, block), tail of the LRU.
    fn claim(&mut self, id: BufId, dev: DevId, blknr: u32) {
        let (hash_node, free_node) = {
            let b = &mut self.bufs[id.0];
            b.count = 1;
            b.dirty = false;
            b.valid = false;
            b.dev = dev;
            b.blknr = blknr;
            (
                &mut b.hash_node as *mut ListNode,
                &mut b.free_node as *mut ListNode,
            )
        };
        // SAFETY: nodes live in the header vec, whose entries never move;
        // no list borrow is active across the unlink calls.
        unsafe {
            if (*hash_node).is_linked() {
                List::unlink(hash_node);
            }
            if (*free_node).is_linked() {
                List::unlink(free_node);
            }
            self.free.push_back(free_node);
            self.hash[Self::bucket(dev, blknr)].push_front(hash_node);
        }
    }
}

// SAFETY: single-core kernel; all mutation happens under the preemption
// mask. The embedded list links never leave the cache.
unsafe impl Send for BufferCache {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::ramdisk::RamDisk;
    use crate::task::task::DEFAULT_PRIORITY;
    use crate::task::Scheduler;

    fn noop_entry() {}

    /// Arena sized for exactly `n` buffers.
    fn arena_for(n: usize) -> usize {
        n * (core::mem::size_of::<Buffer>() + BLOCK_SIZE)
    }

    /// RamDisk wrapper that counts transfers per direction.
    struct CountingDisk {
        inner: RamDisk,
        reads: usize,
        writes: usize,
    }

    impl CountingDisk {
        fn new(sectors: usize) -> Self {
            Self {
                inner: RamDisk::new(sectors),
                reads: 0,
                writes: 0,
            }
        }
    }

    impl BlockDevice for CountingDisk {
        fn request(
            &mut self,
            data: &mut [u8],
            sector_count: usize,
            sector_offset: u64,
            flags: ReqFlags,
            dir: Dir,
        ) -> Result<(), DeviceError> {
            match dir {
                Dir::Read => self.reads += 1,
                Dir::Write => self.writes += 1,
            }
            self.inner
                .request(data, sector_count, sector_offset, flags, dir)
        }
    }

    fn setup(bufs: usize) -> (Scheduler, BufferCache, CountingDisk) {
        (
            Scheduler::new(),
            BufferCache::new(arena_for(bufs)),
            CountingDisk::new(256),
        )
    }

    /// Two acquires of the same block return the same buffer, pinned
    /// twice, and only the first read touches the device.
    #[test]
    fn repeat_acquire_shares_one_buffer() {
        let (mut sched, mut cache, mut disk) = setup(4);

        let a = cache.read(&mut sched, &mut disk, 1, 5).unwrap();
        let b = cache.read(&mut sched, &mut disk, 1, 5).unwrap();

        assert_eq!(a, b);
        assert_eq!(cache.ref_count(a), 2);
        assert_eq!(disk.reads, 1, "second read must be served from cache");
    }

    #[test]
    fn distinct_blocks_get_distinct_buffers() {
        let (mut sched, mut cache, mut disk) = setup(4);
        let a = cache.acquire(&mut sched, &mut disk, 1, 5).unwrap();
        let b = cache.acquire(&mut sched, &mut disk, 1, 6).unwrap();
        let c = cache.acquire(&mut sched, &mut disk, 2, 5).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(cache.resident(), 3);
    }

    #[test]
    fn hash_collisions_coexist() {
        let (mut sched, mut cache, mut disk) = setup(4);
        // dev ^ blknr identical modulo bucket count for both pairs.
        let a = cache.acquire(&mut sched, &mut disk, 0, 7).unwrap();
        let b = cache
            .acquire(&mut sched, &mut disk, 0, 7 + HASH_BUCKETS as u32)
            .unwrap();
        assert_ne!(a, b);
        // Both still resolvable.
        assert_eq!(cache.find(0, 7), Some(a));
        assert_eq!(cache.find(0, 7 + HASH_BUCKETS as u32), Some(b));
    }

    #[test]
    fn carve_stops_at_arena_capacity() {
        let (mut sched, mut cache, mut disk) = setup(2);
        let a = cache.acquire(&mut sched, &mut disk, 1, 1).unwrap();
        let _b = cache.acquire(&mut sched, &mut disk, 1, 2).unwrap();
        assert_eq!(cache.resident(), 2);
        {
            let _irq = IrqSave::masked();
            assert!(cache.carve().is_none(), "arena ends met");
        }

        // Releasing one makes recycling possible without growing.
        cache.release(&mut sched, &mut disk, a);
        let c = cache.acquire(&mut sched, &mut disk, 1, 3).unwrap();
        assert_eq!(cache.resident(), 2);
        assert_eq!(c, a, "coldest free buffer recycled in place");
        assert_eq!(cache.find(1, 1), None, "old identity evicted");
    }

    #[test]
    #[should_panic(expected = "no references")]
    fn release_below_zero_panics() {
        let (mut sched, mut cache, mut disk) = setup(2);
        let a = cache.acquire(&mut sched, &mut disk, 1, 1).unwrap();
        cache.release(&mut sched, &mut disk, a);
        cache.release(&mut sched, &mut disk, a);
    }

    #[test]
    fn pinned_buffers_are_never_eviction_candidates() {
        let (mut sched, mut cache, mut disk) = setup(2);
        let _a = cache.acquire(&mut sched, &mut disk, 1, 1).unwrap();
        let _b = cache.acquire(&mut sched, &mut disk, 1, 2).unwrap();
        // Everything pinned: no candidate, even though both are clean and
        // unlocked.
        assert_eq!(cache.scan_candidate(), None);
    }

    #[test]
    fn awaited_buffers_are_skipped_by_the_scan() {
        let (mut sched, mut cache, mut disk) = setup(2);
        let a = cache.acquire(&mut sched, &mut disk, 1, 1).unwrap();
        let b = cache.acquire(&mut sched, &mut disk, 1, 2).unwrap();
        cache.release(&mut sched, &mut disk, a);
        cache.release(&mut sched, &mut disk, b);
        cache.bufs[a.0].waiters = 1;
        assert_eq!(cache.scan_candidate(), Some(b));
    }

    #[test]
    fn eviction_prefers_the_cheapest_victim() {
        let (mut sched, mut cache, mut disk) = setup(3);
        let a = cache.acquire(&mut sched, &mut disk, 1, 1).unwrap();
        let b = cache.acquire(&mut sched, &mut disk, 1, 2).unwrap();
        let c = cache.acquire(&mut sched, &mut disk, 1, 3).unwrap();
        cache.release(&mut sched, &mut disk, a);
        cache.release(&mut sched, &mut disk, b);
        cache.release(&mut sched, &mut disk, c);

        // a: dirty (score 2), b: locked (score 1), c: clean (score 0).
        cache.mark_dirty(a);
        cache.lock(&mut sched, b);

        assert_eq!(cache.scan_candidate(), Some(c));
    }

    #[test]
    fn eviction_takes_first_minimum_when_no_zero_exists() {
        let (mut sched, mut cache, mut disk) = setup(3);
        let a = cache.acquire(&mut sched, &mut disk, 1, 1).unwrap();
        let b = cache.acquire(&mut sched, &mut disk, 1, 2).unwrap();
        let c = cache.acquire(&mut sched, &mut disk, 1, 3).unwrap();
        cache.release(&mut sched, &mut disk, a);
        cache.release(&mut sched, &mut disk, b);
        cache.release(&mut sched, &mut disk, c);

        // a: dirty (2), b: locked (1), c: locked (1). First minimum is b.
        cache.mark_dirty(a);
        cache.lock(&mut sched, b);
        cache.lock(&mut sched, c);
        assert_eq!(cache.scan_candidate(), Some(b));
    }

    /// A dirty victim is flushed before its identity changes; nothing is
    /// lost.
    #[test]
    fn dirty_victims_are_written_back_before_reuse() {
        let (mut sched, mut cache, mut disk) = setup(1);
        let a = cache.read(&mut sched, &mut disk, 1, 4).unwrap();
        cache.data_mut(a).fill(0x5a);
        cache.release(&mut sched, &mut disk, a);
        // Re-dirty after the release flush to force the eviction path.
        cache.data_mut(a).fill(0x77);
        cache.mark_dirty(a);

        let b = cache.acquire(&mut sched, &mut disk, 1, 9).unwrap();
        assert_eq!(b, a, "only one buffer exists");
        assert!(!cache.is_dirty(b));
        // Block 4 starts at sector 8; the eviction flush must have landed.
        assert_eq!(disk.inner.sector(8)[0], 0x77);
        assert_eq!(disk.inner.sector(9)[0], 0x77);
    }

    #[test]
    fn release_of_last_pin_flushes_dirty_data() {
        let (mut sched, mut cache, mut disk) = setup(2);
        let a = cache.read(&mut sched, &mut disk, 1, 2).unwrap();
        cache.data_mut(a).fill(0xc3);
        cache.mark_dirty(a);
        cache.release(&mut sched, &mut disk, a);
        assert!(!cache.is_dirty(a));
        assert_eq!(disk.writes, 1);
        assert_eq!(disk.inner.sector(4)[0], 0xc3);
    }

    /// Exhaustion: with every buffer pinned a would-be acquirer parks on
    /// the exhaustion queue; the first release wakes the oldest waiter.
    #[test]
    fn release_wakes_exhaustion_waiters_fifo() {
        let (mut sched, mut cache, mut disk) = setup(1);
        sched.spawn("w1", noop_entry, DEFAULT_PRIORITY);
        sched.spawn("w2", noop_entry, DEFAULT_PRIORITY);

        let a = cache.acquire(&mut sched, &mut disk, 1, 1).unwrap();
        assert_eq!(cache.scan_candidate(), None, "the only buffer is pinned");

        // Tasks 0 and 1 queue up exactly as the acquire loop would park
        // them when the scan comes back empty.
        sched.block(Some(&mut cache.exhausted), None, TaskState::Blocked);
        assert_eq!(sched.current_slot(), 1);
        sched.block(Some(&mut cache.exhausted), None, TaskState::Blocked);
        assert_eq!(sched.current_slot(), 2);
        assert_eq!(cache.exhausted.len(), 2);

        cache.release(&mut sched, &mut disk, a);
        assert_eq!(sched.task(0).unwrap().state, TaskState::Ready);
        assert_eq!(
            sched.task(1).unwrap().state,
            TaskState::Blocked,
            "one release, one wake"
        );
    }

    /// Unlock wakes exactly the tasks whose wait channel names this
    /// buffer.
    #[test]
    fn unlock_wakes_matching_contention_waiters() {
        let (mut sched, mut cache, mut disk) = setup(2);
        sched.spawn("waiter", noop_entry, DEFAULT_PRIORITY);
        sched.spawn("bystander", noop_entry, DEFAULT_PRIORITY);

        let a = cache.acquire(&mut sched, &mut disk, 1, 1).unwrap();
        let b = cache.acquire(&mut sched, &mut disk, 1, 2).unwrap();
        cache.lock(&mut sched, a);
        cache.lock(&mut sched, b);

        // Task 0 waits for `a`, task 1 waits for `b`, task 2 runs.
        cache.bufs[a.0].waiters += 1;
        sched.current_task_mut().wait_on = Some(WaitChannel::BufferSlot(a.0));
        sched.block(Some(&mut cache.contended), None, TaskState::Blocked);

        cache.bufs[b.0].waiters += 1;
        sched.current_task_mut().wait_on = Some(WaitChannel::BufferSlot(b.0));
        sched.block(Some(&mut cache.contended), None, TaskState::Blocked);
        assert_eq!(sched.current_slot(), 2);

        cache.unlock(&mut sched, a);
        assert_eq!(sched.task(0).unwrap().state, TaskState::Ready);
        assert_eq!(sched.task(1).unwrap().state, TaskState::Blocked);
        assert_eq!(cache.bufs[a.0].waiters, 0);
        assert_eq!(cache.bufs[b.0].waiters, 1);
        assert!(sched.task(0).unwrap().wait_on.is_none());

        cache.unlock(&mut sched, b);
        assert_eq!(sched.task(1).unwrap().state, TaskState::Ready);
    }

    #[test]
    fn sync_flushes_only_the_given_device() {
        let (mut sched, mut cache, mut disk) = setup(4);
        let a = cache.acquire(&mut sched, &mut disk, 1, 1).unwrap();
        let b = cache.acquire(&mut sched, &mut disk, 2, 1).unwrap();
        cache.data_mut(a).fill(1);
        cache.data_mut(b).fill(2);
        cache.mark_dirty(a);
        cache.mark_dirty(b);

        cache.sync(&mut disk, 1).unwrap();
        assert!(!cache.is_dirty(a));
        assert!(cache.is_dirty(b), "other device untouched");
        assert_eq!(disk.writes, 1);
    }

    #[test]
    fn read_validates_and_subsequent_reads_skip_the_device() {
        let (mut sched, mut cache, mut disk) = setup(2);
        // Prime the disk image.
        let mut img = [9u8; BLOCK_SIZE];
        disk.inner
            .request(&mut img, SECTORS_PER_BLOCK, 6, ReqFlags::empty(), Dir::Write)
            .unwrap();

        let a = cache.read(&mut sched, &mut disk, 1, 3).unwrap();
        assert!(cache.is_valid(a));
        assert_eq!(cache.data(a)[0], 9);
        assert_eq!(disk.reads, 1);

        cache.release(&mut sched, &mut disk, a);
        let b = cache.read(&mut sched, &mut disk, 1, 3).unwrap();
        assert_eq!(a, b);
        assert_eq!(disk.reads, 1, "still valid, no second device read");
    }

    #[test]
    fn recycling_a_buffer_rehashes_it() {
        let (mut sched, mut cache, mut disk) = setup(1);
        let a = cache.acquire(&mut sched, &mut disk, 1, 1).unwrap();
        cache.release(&mut sched, &mut disk, a);

        let b = cache.acquire(&mut sched, &mut disk, 3, 9).unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.find(1, 1), None);
        assert_eq!(cache.find(3, 9), Some(b));
        assert_eq!(cache.dev(b), 3);
        assert_eq!(cache.block(b), 9);
        assert!(!cache.is_valid(b), "recycled identity must be re-read");
    }
}
