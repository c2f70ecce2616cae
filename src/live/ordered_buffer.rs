//! Live ordered buffer (§4.10): the consumer-side concurrency core. One
//! reader thread pushes decoded entries from however many tracebuffer files
//! it polls; one writer thread drains them once they're old enough, relative
//! to a watermark, that no later-arriving entry could still beat them into
//! order.
//!
//! Only two threads ever touch this: a `parking_lot::Mutex` guards the heap,
//! watermark, and counters, and a `parking_lot::Condvar` wakes the drain
//! side. `finished` is a separate atomic so the writer's "are we done?"
//! check on the hot path costs no lock.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// One decoded trace entry as it flows through the ordered buffer. The
/// decoder is responsible for filling `payload` in whatever form downstream
/// formatting needs (already-decoded args, a pre-rendered string, ...); the
/// buffer itself only ever looks at `timestamp_ns`.
#[derive(Debug, Clone)]
pub struct Entry<T> {
    pub timestamp_ns: u64,
    pub payload: T,
}

struct HeapItem<T>(Entry<T>);

impl<T> PartialEq for HeapItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0.timestamp_ns == other.0.timestamp_ns
    }
}
impl<T> Eq for HeapItem<T> {}
impl<T> PartialOrd for HeapItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for HeapItem<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so `BinaryHeap` (a max-heap) pops the smallest timestamp.
        other.0.timestamp_ns.cmp(&self.0.timestamp_ns)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Counters {
    pub pushed: u64,
    pub popped: u64,
    pub dropped: u64,
    pub high_water_mark: usize,
}

struct Inner<T> {
    heap: BinaryHeap<HeapItem<T>>,
    watermark_ns: u64,
    counters: Counters,
}

pub struct OrderedBuffer<T> {
    inner: Mutex<Inner<T>>,
    ready: Condvar,
    finished: AtomicBool,
    max_size: usize,
    order_delay_ns: u64,
}

impl<T> OrderedBuffer<T> {
    /// `max_size == 0` means unbounded.
    pub fn new(max_size: usize, order_delay_ns: u64) -> Self {
        OrderedBuffer {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                watermark_ns: 0,
                counters: Counters::default(),
            }),
            ready: Condvar::new(),
            finished: AtomicBool::new(false),
            max_size,
            order_delay_ns,
        }
    }

    /// Pushes a new entry, thread-safe. Under pressure (heap at `max_size`)
    /// the current oldest (smallest-timestamp) entry is evicted first,
    /// prioritizing fresh data (§4.10).
    pub fn push(&self, entry: Entry<T>) {
        let mut inner = self.inner.lock();
        if self.max_size != 0 && inner.heap.len() >= self.max_size {
            inner.heap.pop();
            inner.counters.dropped += 1;
        }
        inner.heap.push(HeapItem(entry));
        inner.counters.pushed += 1;
        inner.counters.high_water_mark = inner.counters.high_water_mark.max(inner.heap.len());
        self.ready.notify_all();
    }

    /// Advances the watermark (callers only ever move it forward) and wakes
    /// the drain side so it can re-check readiness.
    pub fn update_watermark(&self, ts_ns: u64) {
        let mut inner = self.inner.lock();
        if ts_ns > inner.watermark_ns {
            inner.watermark_ns = ts_ns;
        }
        self.ready.notify_all();
    }

    /// Signals that no further `push` calls will arrive; every entry still
    /// in the heap becomes immediately ready.
    pub fn finish(&self) {
        let _inner = self.inner.lock();
        self.finished.store(true, Ordering::SeqCst);
        self.ready.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn ready_threshold(watermark_ns: u64, order_delay_ns: u64) -> u64 {
        watermark_ns.saturating_sub(order_delay_ns)
    }

    fn pop_if_ready(inner: &mut Inner<T>, finished: bool, order_delay_ns: u64) -> Option<Entry<T>> {
        let threshold = Self::ready_threshold(inner.watermark_ns, order_delay_ns);
        match inner.heap.peek() {
            Some(top) if finished || top.0.timestamp_ns <= threshold => {
                let item = inner.heap.pop().unwrap();
                inner.counters.popped += 1;
                Some(item.0)
            }
            _ => None,
        }
    }

    /// Waits up to `timeout` for the root entry to become ready, returning
    /// it, or `None` on timeout/empty-and-finished.
    pub fn pop(&self, timeout: Duration) -> Option<Entry<T>> {
        let mut inner = self.inner.lock();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(e) =
                Self::pop_if_ready(&mut inner, self.finished.load(Ordering::SeqCst), self.order_delay_ns)
            {
                return Some(e);
            }
            if self.finished.load(Ordering::SeqCst) && inner.heap.is_empty() {
                return None;
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let result = self.ready.wait_for(&mut inner, remaining);
            if result.timed_out() {
                return None;
            }
        }
    }

    /// Non-blocking: drains every currently-ready entry, in timestamp order.
    pub fn pop_all_ready(&self) -> Vec<Entry<T>> {
        let mut inner = self.inner.lock();
        let finished = self.finished.load(Ordering::SeqCst);
        let mut out = Vec::new();
        while let Some(e) = Self::pop_if_ready(&mut inner, finished, self.order_delay_ns) {
            out.push(e);
        }
        out
    }

    pub fn counters(&self) -> Counters {
        self.inner.lock().counters
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ts: u64) -> Entry<u64> {
        Entry {
            timestamp_ns: ts,
            payload: ts,
        }
    }

    #[test]
    fn interleaved_sources_drain_in_timestamp_order() {
        let buf: OrderedBuffer<u64> = OrderedBuffer::new(0, 0);
        buf.push(entry(1));
        buf.push(entry(3));
        buf.push(entry(2));
        buf.push(entry(4));
        buf.update_watermark(4);
        let ready = buf.pop_all_ready();
        let ts: Vec<u64> = ready.iter().map(|e| e.timestamp_ns).collect();
        assert_eq!(ts, vec![1, 2, 3, 4]);
    }

    #[test]
    fn order_delay_holds_back_entries_near_the_watermark() {
        let buf: OrderedBuffer<u64> = OrderedBuffer::new(0, 5);
        buf.push(entry(10));
        buf.update_watermark(12);
        // threshold = 12 - 5 = 7; entry at 10 is not yet safe to emit.
        assert!(buf.pop_all_ready().is_empty());
        buf.update_watermark(20);
        // threshold = 15, now past 10.
        assert_eq!(buf.pop_all_ready().len(), 1);
    }

    #[test]
    fn full_heap_drops_oldest_before_inserting() {
        let buf: OrderedBuffer<u64> = OrderedBuffer::new(2, 0);
        buf.push(entry(5));
        buf.push(entry(10));
        buf.push(entry(1)); // should evict ts=5 (the current oldest)
        assert_eq!(buf.counters().dropped, 1);
        buf.update_watermark(10);
        let ts: Vec<u64> = buf.pop_all_ready().iter().map(|e| e.timestamp_ns).collect();
        assert_eq!(ts, vec![1, 10]);
    }

    #[test]
    fn finish_makes_everything_ready_regardless_of_watermark() {
        let buf: OrderedBuffer<u64> = OrderedBuffer::new(0, 1_000_000);
        buf.push(entry(999));
        buf.finish();
        assert_eq!(buf.pop(Duration::from_millis(50)).map(|e| e.timestamp_ns), Some(999));
    }
}
