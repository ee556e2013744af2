//! Per-device request queue
//!
//! A bounded set of queue slots, each owning one pending command and its
//! I/O buffer for the whole in-flight lifetime. Adjacent requests may be
//! coalesced into one slot while they are still unsubmitted and younger
//! than the device merge window; every constituent keeps its own tag and
//! range so completion can answer each initiator frame exactly once.

use crate::protocol::{AtaFlags, SECTOR_SIZE};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::time::{Duration, Instant};

/// O_DIRECT wants page-aligned buffers; 4096 also covers 4Kn disks.
const BUF_ALIGN: usize = 4096;

/// A heap buffer aligned for direct I/O.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
}

impl AlignedBuf {
    pub fn zeroed(len: usize) -> Self {
        let layout = Layout::from_size_align(len.max(BUF_ALIGN), BUF_ALIGN)
            .expect("buffer layout");
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).expect("buffer allocation failed");
        Self { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len.max(BUF_ALIGN), BUF_ALIGN)
            .expect("buffer layout");
        unsafe { dealloc(self.ptr.as_ptr(), layout) };
    }
}

// The buffer is exclusively owned; the raw pointer never aliases.
unsafe impl Send for AlignedBuf {}

impl std::fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AlignedBuf({} bytes)", self.len)
    }
}

/// Direction of the kernel I/O a slot stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDir {
    Read,
    Write,
    Flush,
}

/// Lifecycle of one queue slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Enqueued,
    Submitted,
}

/// One initiator frame folded into a slot.
#[derive(Debug, Clone, Copy)]
pub struct Constituent {
    pub tag: u32,
    pub src: [u8; 6],
    pub lba: u64,
    pub count: u32,
    pub aflags: AtaFlags,
}

/// One pending command owned by a device.
#[derive(Debug)]
pub struct QueueSlot {
    pub netif: usize,
    pub dir: IoDir,
    pub lba: u64,
    pub count: u32,
    pub buf: AlignedBuf,
    pub arrived: Instant,
    pub state: SlotState,
    /// Write-through divergence blocks merging
    pub async_write: bool,
    pub constituents: Vec<Constituent>,
}

impl QueueSlot {
    pub fn byte_len(&self) -> usize {
        self.count as usize * SECTOR_SIZE
    }
}

/// Bounded FIFO of queue slots.
pub struct RequestQueue {
    slots: Vec<Option<QueueSlot>>,
    /// Enqueued (not yet submitted) slot indices in arrival order
    order: VecDeque<usize>,
    inflight: usize,
}

/// Raised when all slots are taken.
#[derive(Debug, PartialEq, Eq)]
pub struct QueueFull;

impl RequestQueue {
    pub fn new(queue_length: usize) -> Self {
        Self {
            slots: (0..queue_length).map(|_| None).collect(),
            order: VecDeque::with_capacity(queue_length),
            inflight: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Requests currently held: pending plus in-flight.
    pub fn outstanding(&self) -> usize {
        self.order.len() + self.inflight
    }

    pub fn inflight(&self) -> usize {
        self.inflight
    }

    pub fn is_full(&self) -> bool {
        self.outstanding() >= self.slots.len()
    }

    /// Arrival time of the oldest pending request.
    pub fn head_arrived(&self) -> Option<Instant> {
        self.order
            .front()
            .and_then(|&idx| self.slots[idx].as_ref())
            .map(|slot| slot.arrived)
    }

    pub fn get(&self, idx: usize) -> Option<&QueueSlot> {
        self.slots.get(idx).and_then(|slot| slot.as_ref())
    }

    /// Try to fold a request into a pending slot. Returns true when merged.
    #[allow(clippy::too_many_arguments)]
    pub fn try_merge(
        &mut self,
        dir: IoDir,
        lba: u64,
        count: u32,
        data: &[u8],
        constituent: Constituent,
        netif: usize,
        async_write: bool,
        now: Instant,
        merge_window: Duration,
        max_bytes: usize,
    ) -> bool {
        if merge_window.is_zero() || dir == IoDir::Flush {
            return false;
        }
        for &idx in &self.order {
            let slot = match self.slots[idx].as_mut() {
                Some(slot) => slot,
                None => continue,
            };
            if slot.dir != dir
                || slot.netif != netif
                || slot.async_write != async_write
                || slot.state != SlotState::Enqueued
            {
                continue;
            }
            if now.duration_since(slot.arrived) > merge_window {
                continue;
            }

            let identical = slot.lba == lba && slot.count == count;
            let appends = slot.lba + slot.count as u64 == lba;
            let prepends = lba + count as u64 == slot.lba;
            if identical {
                if dir == IoDir::Write {
                    // Last writer wins over the shared range
                    slot.buf.as_mut_slice()[..data.len()].copy_from_slice(data);
                }
                slot.constituents.push(constituent);
                return true;
            }
            if appends || prepends {
                let combined = (slot.count + count) as usize * SECTOR_SIZE;
                if combined > max_bytes {
                    continue;
                }
                if appends {
                    if dir == IoDir::Write {
                        let offset = slot.count as usize * SECTOR_SIZE;
                        slot.buf.as_mut_slice()[offset..offset + data.len()]
                            .copy_from_slice(data);
                    }
                } else {
                    // The new fragment goes in front; shift the queued data
                    if dir == IoDir::Write {
                        let old_len = slot.count as usize * SECTOR_SIZE;
                        let shift = count as usize * SECTOR_SIZE;
                        slot.buf.as_mut_slice().copy_within(0..old_len, shift);
                        slot.buf.as_mut_slice()[..data.len()].copy_from_slice(data);
                    }
                    slot.lba = lba;
                }
                slot.count += count;
                slot.constituents.push(constituent);
                return true;
            }
        }
        false
    }

    /// Enqueue a request into a free slot.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue(
        &mut self,
        dir: IoDir,
        lba: u64,
        count: u32,
        data: &[u8],
        constituent: Constituent,
        netif: usize,
        async_write: bool,
        now: Instant,
        max_bytes: usize,
    ) -> Result<usize, QueueFull> {
        if self.is_full() {
            return Err(QueueFull);
        }
        let idx = self
            .slots
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(QueueFull)?;

        let mut buf = AlignedBuf::zeroed(max_bytes.max(count as usize * SECTOR_SIZE));
        if dir == IoDir::Write {
            buf.as_mut_slice()[..data.len()].copy_from_slice(data);
        }

        self.slots[idx] = Some(QueueSlot {
            netif,
            dir,
            lba,
            count,
            buf,
            arrived: now,
            state: SlotState::Enqueued,
            async_write,
            constituents: vec![constituent],
        });
        self.order.push_back(idx);
        Ok(idx)
    }

    /// Pop the oldest pending slot once its merge window has expired.
    /// Pending order means the front is always the oldest candidate.
    pub fn pop_submittable(&mut self, now: Instant, merge_window: Duration) -> Option<usize> {
        let &idx = self.order.front()?;
        let slot = self.slots[idx].as_ref()?;
        if now.duration_since(slot.arrived) < merge_window {
            return None;
        }
        self.order.pop_front();
        if let Some(slot) = self.slots[idx].as_mut() {
            slot.state = SlotState::Submitted;
        }
        self.inflight += 1;
        Some(idx)
    }

    /// Remove pending slots that waited longer than `max_delay` without
    /// submission; they are answered with a device-unavailable error.
    pub fn expire(&mut self, now: Instant, max_delay: Duration) -> Vec<QueueSlot> {
        let mut expired = Vec::new();
        while let Some(&idx) = self.order.front() {
            let overdue = self.slots[idx]
                .as_ref()
                .map(|slot| now.duration_since(slot.arrived) > max_delay)
                .unwrap_or(false);
            if !overdue {
                break;
            }
            self.order.pop_front();
            if let Some(slot) = self.slots[idx].take() {
                expired.push(slot);
            }
        }
        expired
    }

    /// Return a completed in-flight slot and free its index.
    pub fn complete(&mut self, idx: usize) -> Option<QueueSlot> {
        let slot = self.slots.get_mut(idx)?.take()?;
        debug_assert_eq!(slot.state, SlotState::Submitted);
        self.inflight -= 1;
        Some(slot)
    }

    /// The earliest instant at which a pending slot hits the merge window
    /// or the max delay; drives the deadline timer.
    pub fn next_deadline(
        &self,
        merge_window: Duration,
        max_delay: Duration,
    ) -> Option<Instant> {
        let arrived = self.head_arrived()?;
        let submit_at = arrived + merge_window;
        let expire_at = arrived + max_delay;
        Some(submit_at.min(expire_at))
    }

    /// Drain every slot (shutdown path).
    pub fn drain(&mut self) -> Vec<QueueSlot> {
        self.order.clear();
        self.inflight = 0;
        self.slots.iter_mut().filter_map(|slot| slot.take()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_BYTES: usize = 16 * SECTOR_SIZE;

    fn constituent(tag: u32, lba: u64, count: u32) -> Constituent {
        Constituent {
            tag,
            src: [0xAA; 6],
            lba,
            count,
            aflags: AtaFlags::default(),
        }
    }

    fn enqueue_write(
        queue: &mut RequestQueue,
        tag: u32,
        lba: u64,
        count: u32,
        now: Instant,
    ) -> Result<usize, QueueFull> {
        let data = vec![tag as u8; count as usize * SECTOR_SIZE];
        queue.enqueue(
            IoDir::Write,
            lba,
            count,
            &data,
            constituent(tag, lba, count),
            0,
            false,
            now,
            MAX_BYTES,
        )
    }

    #[test]
    fn test_queue_bound() {
        let now = Instant::now();
        let mut queue = RequestQueue::new(2);
        enqueue_write(&mut queue, 1, 0, 1, now).unwrap();
        enqueue_write(&mut queue, 2, 100, 1, now).unwrap();
        assert_eq!(enqueue_write(&mut queue, 3, 200, 1, now), Err(QueueFull));
        assert_eq!(queue.outstanding(), 2);

        // Submitting does not free the slot; completion does.
        let idx = queue.pop_submittable(now, Duration::ZERO).unwrap();
        assert_eq!(enqueue_write(&mut queue, 3, 200, 1, now), Err(QueueFull));
        queue.complete(idx).unwrap();
        enqueue_write(&mut queue, 3, 200, 1, now).unwrap();
    }

    #[test]
    fn test_merge_appends_write() {
        let now = Instant::now();
        let mut queue = RequestQueue::new(4);
        enqueue_write(&mut queue, 1, 100, 8, now).unwrap();

        let data = vec![2u8; 8 * SECTOR_SIZE];
        let merged = queue.try_merge(
            IoDir::Write,
            108,
            8,
            &data,
            constituent(2, 108, 8),
            0,
            false,
            now,
            Duration::from_millis(1),
            MAX_BYTES,
        );
        assert!(merged);
        assert_eq!(queue.outstanding(), 1);

        let idx = queue.pop_submittable(now, Duration::ZERO).unwrap();
        let slot = queue.complete(idx).unwrap();
        // The merged super-request covers exactly the union of the ranges
        assert_eq!(slot.lba, 100);
        assert_eq!(slot.count, 16);
        assert_eq!(slot.constituents.len(), 2);
        assert_eq!(slot.buf.as_slice()[0], 1);
        assert_eq!(slot.buf.as_slice()[8 * SECTOR_SIZE], 2);
    }

    #[test]
    fn test_merge_prepends_write() {
        // The higher-LBA request arrives first; the later, lower-LBA one
        // still coalesces into the same slot.
        let now = Instant::now();
        let mut queue = RequestQueue::new(4);
        enqueue_write(&mut queue, 1, 108, 8, now).unwrap();

        let data = vec![2u8; 8 * SECTOR_SIZE];
        let merged = queue.try_merge(
            IoDir::Write,
            100,
            8,
            &data,
            constituent(2, 100, 8),
            0,
            false,
            now,
            Duration::from_millis(1),
            MAX_BYTES,
        );
        assert!(merged);
        assert_eq!(queue.outstanding(), 1);

        let idx = queue.pop_submittable(now, Duration::ZERO).unwrap();
        let slot = queue.complete(idx).unwrap();
        assert_eq!(slot.lba, 100);
        assert_eq!(slot.count, 16);
        assert_eq!(slot.constituents.len(), 2);
        // New fragment at the front, the queued one shifted behind it
        assert_eq!(slot.buf.as_slice()[0], 2);
        assert_eq!(slot.buf.as_slice()[8 * SECTOR_SIZE], 1);
    }

    #[test]
    fn test_merge_identical_read() {
        let now = Instant::now();
        let mut queue = RequestQueue::new(4);
        queue
            .enqueue(
                IoDir::Read,
                50,
                4,
                &[],
                constituent(1, 50, 4),
                0,
                false,
                now,
                MAX_BYTES,
            )
            .unwrap();
        assert!(queue.try_merge(
            IoDir::Read,
            50,
            4,
            &[],
            constituent(2, 50, 4),
            0,
            false,
            now,
            Duration::from_millis(1),
            MAX_BYTES,
        ));
        let idx = queue.pop_submittable(now, Duration::ZERO).unwrap();
        let slot = queue.complete(idx).unwrap();
        assert_eq!(slot.count, 4);
        assert_eq!(slot.constituents.len(), 2);
    }

    #[test]
    fn test_merge_respects_direction_flags_and_size() {
        let now = Instant::now();
        let window = Duration::from_millis(1);
        let mut queue = RequestQueue::new(8);
        enqueue_write(&mut queue, 1, 0, 8, now).unwrap();

        // Opposite direction
        assert!(!queue.try_merge(
            IoDir::Read,
            8,
            8,
            &[],
            constituent(2, 8, 8),
            0,
            false,
            now,
            window,
            MAX_BYTES,
        ));
        // Write-through divergence
        let data = vec![0u8; 8 * SECTOR_SIZE];
        assert!(!queue.try_merge(
            IoDir::Write,
            8,
            8,
            &data,
            constituent(3, 8, 8),
            0,
            true,
            now,
            window,
            MAX_BYTES,
        ));
        // Non-contiguous
        assert!(!queue.try_merge(
            IoDir::Write,
            9,
            8,
            &data,
            constituent(4, 9, 8),
            0,
            false,
            now,
            window,
            MAX_BYTES,
        ));
        // Combined size above the payload bound
        let big = vec![0u8; 16 * SECTOR_SIZE];
        assert!(!queue.try_merge(
            IoDir::Write,
            8,
            16,
            &big,
            constituent(5, 8, 16),
            0,
            false,
            now,
            window,
            MAX_BYTES,
        ));
    }

    #[test]
    fn test_merge_window_expires() {
        let now = Instant::now();
        let mut queue = RequestQueue::new(4);
        enqueue_write(&mut queue, 1, 0, 8, now).unwrap();

        let later = now + Duration::from_millis(5);
        let data = vec![0u8; 8 * SECTOR_SIZE];
        assert!(!queue.try_merge(
            IoDir::Write,
            8,
            8,
            &data,
            constituent(2, 8, 8),
            0,
            false,
            later,
            Duration::from_millis(1),
            MAX_BYTES,
        ));
    }

    #[test]
    fn test_submitted_slots_do_not_merge() {
        let now = Instant::now();
        let mut queue = RequestQueue::new(4);
        enqueue_write(&mut queue, 1, 0, 8, now).unwrap();
        queue.pop_submittable(now, Duration::ZERO).unwrap();

        let data = vec![0u8; 8 * SECTOR_SIZE];
        assert!(!queue.try_merge(
            IoDir::Write,
            8,
            8,
            &data,
            constituent(2, 8, 8),
            0,
            false,
            now,
            Duration::from_millis(1),
            MAX_BYTES,
        ));
    }

    #[test]
    fn test_merge_window_holds_submission() {
        let now = Instant::now();
        let window = Duration::from_millis(2);
        let mut queue = RequestQueue::new(4);
        enqueue_write(&mut queue, 1, 0, 8, now).unwrap();

        assert_eq!(queue.pop_submittable(now, window), None);
        let later = now + window;
        assert!(queue.pop_submittable(later, window).is_some());
    }

    #[test]
    fn test_expire_overdue_requests() {
        let now = Instant::now();
        let mut queue = RequestQueue::new(4);
        enqueue_write(&mut queue, 1, 0, 1, now).unwrap();
        enqueue_write(&mut queue, 2, 10, 1, now + Duration::from_millis(5)).unwrap();

        let expired = queue.expire(now + Duration::from_millis(8), Duration::from_millis(4));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].constituents[0].tag, 1);
        assert_eq!(queue.outstanding(), 1);
    }

    #[test]
    fn test_next_deadline_tracks_head() {
        let now = Instant::now();
        let mut queue = RequestQueue::new(4);
        assert!(queue
            .next_deadline(Duration::from_millis(1), Duration::from_millis(10))
            .is_none());

        enqueue_write(&mut queue, 1, 0, 1, now).unwrap();
        let deadline = queue
            .next_deadline(Duration::from_millis(1), Duration::from_millis(10))
            .unwrap();
        assert_eq!(deadline, now + Duration::from_millis(1));
    }
}
