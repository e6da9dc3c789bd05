//! Bounded ring of decompression buffers shared between one producer and
//! the worker parsers.
//!
//! The producer writes sequential chunks into slots identified by a
//! monotonically increasing write index; worker `k` publishes the buffer
//! index it is currently reading in `read_index[k]`. The producer may only
//! fill a slot when no published read index maps onto it, so a slot is
//! never written and read at the same time. Both sides poll in 1 ms steps
//! when blocked.

use crate::error::{Result, SheetError};
use log::warn;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default number of ring slots
pub(crate) const NUM_BUFFERS: usize = 1024;

/// Default payload bytes per slot; slots carry one extra byte for the
/// trailing NUL that marks end-of-chunk for the workers
pub(crate) const CHUNK_SIZE: usize = 32 * 1024;

/// Poll interval for both producer and workers
pub(crate) const POLL: Duration = Duration::from_millis(1);

/// Source of sequential chunks for [`BufferRing::produce`].
///
/// Abstacted from the archive part reader so the pipeline can be driven
/// from plain byte slices in tests.
pub(crate) trait ChunkSource {
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Whether stream integrity checks passed; only meaningful after
    /// `read_chunk` returned zero
    fn integrity_ok(&self) -> bool {
        true
    }
}

impl ChunkSource for crate::archive::PartReader<'_> {
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read(buf)
    }

    fn integrity_ok(&self) -> bool {
        self.crc_matches()
    }
}

impl ChunkSource for std::io::Cursor<Vec<u8>> {
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        use std::io::Read;
        Ok(self.read(buf)?)
    }
}

/// Outcome of waiting for a buffer to become readable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotWait {
    Ready,
    Exhausted,
    Terminated,
}

/// The shared buffer ring.
///
/// Slot payloads live in `UnsafeCell`s; exclusivity is guaranteed by the
/// index protocol, not by locks:
/// - the producer writes slot `i % num_buffers` only while no
///   `read_index[k]` equals `i` modulo `num_buffers`, and publishes the
///   slot by storing `write_index = i + 1` with release ordering;
/// - worker `k` stores `read_index[k] = i` (release) before touching the
///   slot and only reads slots with `i < write_index` (acquire), so the
///   producer's writes are visible and no concurrent write can start.
pub(crate) struct BufferRing {
    slots: Box<[UnsafeCell<Box<[u8]>>]>,
    num_buffers: usize,
    chunk_size: usize,
    write_index: AtomicUsize,
    read_index: Box<[AtomicUsize]>,
    finished_writing: AtomicBool,
    failed: AtomicBool,
    crc_mismatch: AtomicBool,
    terminate: Arc<AtomicBool>,
}

// Safety: see the struct-level invariant; slots are only accessed under
// the write_index/read_index protocol.
unsafe impl Sync for BufferRing {}

impl BufferRing {
    pub(crate) fn new(
        workers: usize,
        num_buffers: usize,
        chunk_size: usize,
        terminate: Arc<AtomicBool>,
    ) -> Self {
        // workers park on slots 0..workers at start; the producer begins
        // past them, so the ring must be strictly larger
        assert!(num_buffers > workers);
        let slots = (0..num_buffers)
            .map(|_| UnsafeCell::new(vec![0u8; chunk_size + 1].into_boxed_slice()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let read_index = (0..workers)
            .map(|k| AtomicUsize::new(k))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        BufferRing {
            slots,
            num_buffers,
            chunk_size,
            write_index: AtomicUsize::new(0),
            read_index,
            finished_writing: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            crc_mismatch: AtomicBool::new(false),
            terminate,
        }
    }

    pub(crate) fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub(crate) fn workers(&self) -> usize {
        self.read_index.len()
    }

    pub(crate) fn terminated(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    pub(crate) fn request_terminate(&self) {
        self.terminate.store(true, Ordering::Release);
    }

    pub(crate) fn terminate_handle(&self) -> &AtomicBool {
        &self.terminate
    }

    /// Producer hard failure: workers must stop consuming
    pub(crate) fn failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub(crate) fn crc_mismatch(&self) -> bool {
        self.crc_mismatch.load(Ordering::Acquire)
    }

    fn any_reader_on(&self, index: usize) -> bool {
        let slot = index % self.num_buffers;
        self.read_index
            .iter()
            .any(|r| r.load(Ordering::Acquire) % self.num_buffers == slot)
    }

    /// Run the producer: decompress `source` chunk by chunk into the ring.
    ///
    /// On a decompressor error the write index is reset to zero so
    /// consumers can distinguish a hard failure from an empty stream. A
    /// CRC mismatch at end of stream is recorded as a warning, not a
    /// failure.
    pub(crate) fn produce<S: ChunkSource>(&self, source: &mut S) -> Result<()> {
        // slots below `workers` are the parking positions of the readers
        // and stay empty; data begins at buffer index `workers`
        let mut index = self.workers();
        loop {
            if self.terminated() {
                self.finished_writing.store(true, Ordering::Release);
                return Err(SheetError::Canceled);
            }
            while self.any_reader_on(index) {
                std::thread::sleep(POLL);
                if self.terminated() {
                    self.finished_writing.store(true, Ordering::Release);
                    return Err(SheetError::Canceled);
                }
            }

            // Safety: no published read index maps onto this slot (checked
            // above) and the producer is the only writer.
            let slot = unsafe { &mut *self.slots[index % self.num_buffers].get() };
            let read = match source.read_chunk(&mut slot[..self.chunk_size]) {
                Ok(n) => n,
                Err(e) => {
                    self.write_index.store(0, Ordering::Release);
                    self.failed.store(true, Ordering::Release);
                    self.finished_writing.store(true, Ordering::Release);
                    return Err(e);
                }
            };
            slot[read] = 0;
            if read == 0 {
                break;
            }
            index += 1;
            self.write_index.store(index, Ordering::Release);
        }
        self.finished_writing.store(true, Ordering::Release);

        if !source.integrity_ok() {
            warn!("worksheet stream CRC-32 mismatch, output may be inconsistent");
            self.crc_mismatch.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Publish that worker `k` is now reading buffer `index`
    pub(crate) fn claim(&self, worker: usize, index: usize) {
        self.read_index[worker].store(index, Ordering::Release);
    }

    /// Block until buffer `index` is readable, the stream ends before it,
    /// or termination is requested
    pub(crate) fn wait_readable(&self, index: usize) -> SlotWait {
        loop {
            if self.terminated() {
                return SlotWait::Terminated;
            }
            let finished = self.finished_writing.load(Ordering::Acquire);
            if index < self.write_index.load(Ordering::Acquire) {
                return SlotWait::Ready;
            }
            if finished {
                return SlotWait::Exhausted;
            }
            std::thread::sleep(POLL);
        }
    }

    /// Borrow the payload of buffer `index`.
    ///
    /// Safety contract (checked by callers, not the compiler): the caller
    /// must have published `index` through [`claim`](Self::claim) for its
    /// own worker slot and observed it readable via
    /// [`wait_readable`](Self::wait_readable).
    pub(crate) unsafe fn slot(&self, index: usize) -> &[u8] {
        &*self.slots[index % self.num_buffers].get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn ring(workers: usize, buffers: usize, chunk: usize) -> BufferRing {
        BufferRing::new(workers, buffers, chunk, Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn test_producer_fills_and_terminates_chunks() {
        let ring = ring(1, 8, 4);
        let mut source = Cursor::new(b"abcdefghij".to_vec());
        ring.produce(&mut source).unwrap();
        // data begins past the single parking slot: buffers 1..4
        assert_eq!(ring.write_index.load(Ordering::Acquire), 4);
        unsafe {
            assert_eq!(ring.slot(0)[0], 0);
            assert_eq!(&ring.slot(1)[..5], b"abcd\0");
            assert_eq!(&ring.slot(2)[..5], b"efgh\0");
            assert_eq!(&ring.slot(3)[..3], b"ij\0");
        }
    }

    #[test]
    fn test_wait_readable_reports_exhaustion() {
        let ring = ring(1, 8, 4);
        let mut source = Cursor::new(b"abcd".to_vec());
        ring.produce(&mut source).unwrap();
        assert_eq!(ring.wait_readable(0), SlotWait::Ready);
        assert_eq!(ring.wait_readable(1), SlotWait::Ready);
        assert_eq!(ring.wait_readable(2), SlotWait::Exhausted);
    }

    #[test]
    fn test_producer_blocks_on_claimed_slot() {
        // 2 slots, reader parked on slot 0: the producer fills slot 1 and
        // must stall before wrapping onto slot 0 until the reader moves
        let ring = Arc::new(ring(1, 2, 2));
        let producer = Arc::clone(&ring);
        let handle = std::thread::spawn(move || {
            let mut source = Cursor::new(b"aabbcc".to_vec());
            producer.produce(&mut source).unwrap();
        });
        for index in 1..4 {
            assert_eq!(ring.wait_readable(index), SlotWait::Ready);
            std::thread::sleep(Duration::from_millis(2));
            ring.claim(0, index);
        }
        handle.join().unwrap();
        assert_eq!(ring.write_index.load(Ordering::Acquire), 4);
    }

    #[test]
    fn test_terminate_stops_producer() {
        let flag = Arc::new(AtomicBool::new(false));
        let ring = BufferRing::new(1, 2, 2, Arc::clone(&flag));
        // reader never moves off slot 0, producer can fill slot 1 and then
        // stalls until the terminate flag flips
        let big = vec![b'x'; 64];
        flag.store(true, Ordering::Release);
        let mut source = Cursor::new(big);
        assert!(matches!(
            ring.produce(&mut source),
            Err(SheetError::Canceled)
        ));
    }

    struct FailingSource;
    impl ChunkSource for FailingSource {
        fn read_chunk(&mut self, _buf: &mut [u8]) -> Result<usize> {
            Err(SheetError::Decompression("boom".into()))
        }
    }

    #[test]
    fn test_decompressor_error_resets_write_index() {
        let ring = ring(1, 4, 4);
        assert!(ring.produce(&mut FailingSource).is_err());
        assert!(ring.failed());
        assert_eq!(ring.write_index.load(Ordering::Acquire), 0);
        assert_eq!(ring.wait_readable(0), SlotWait::Exhausted);
    }
}
