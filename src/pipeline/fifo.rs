//! Bounded single-producer/single-consumer queue of reusable byte buffers.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

/// A FIFO of byte buffers backed by a fixed pool.
///
/// All buffers are allocated up front. The producer takes an empty buffer
/// with [`Fifo::try_acquire`], fills it and [`Fifo::push`]es it; the consumer
/// [`Fifo::pop_timeout`]s it and hands it back with [`Fifo::recycle`]. The
/// pool holds two more buffers than the queue so each side can hold one while
/// the queue is full.
///
/// Clones share the same queue and pool.
#[derive(Clone)]
pub struct Fifo {
    filled_tx: Sender<Vec<u8>>,
    filled_rx: Receiver<Vec<u8>>,
    free_tx: Sender<Vec<u8>>,
    free_rx: Receiver<Vec<u8>>,
    capacity: usize,
}

impl Fifo {
    /// Allocates `capacity + 2` buffers of `buffer_size` bytes.
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        let (filled_tx, filled_rx) = bounded(capacity);
        let (free_tx, free_rx) = bounded(capacity + 2);
        for _ in 0..capacity + 2 {
            // the free queue is sized for the whole pool
            let _ = free_tx.try_send(Vec::with_capacity(buffer_size));
        }
        Self {
            filled_tx,
            filled_rx,
            free_tx,
            free_rx,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of filled buffers waiting for the consumer.
    pub fn len(&self) -> usize {
        self.filled_rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filled_rx.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.filled_rx.is_full()
    }

    /// Takes an empty buffer from the pool.
    pub fn try_acquire(&self) -> Option<Vec<u8>> {
        let mut buf = self.free_rx.try_recv().ok()?;
        buf.clear();
        Some(buf)
    }

    /// Enqueues a filled buffer, handing it back when the queue is full.
    pub fn push(&self, buf: Vec<u8>) -> Result<(), Vec<u8>> {
        self.filled_tx.try_send(buf).map_err(TrySendError::into_inner)
    }

    pub fn try_pop(&self) -> Option<Vec<u8>> {
        self.filled_rx.try_recv().ok()
    }

    /// Waits up to `timeout` for a filled buffer.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.filled_rx.recv_timeout(timeout).ok()
    }

    /// Returns a buffer to the pool.
    pub fn recycle(&self, buf: Vec<u8>) {
        let _ = self.free_tx.try_send(buf);
    }

    /// Drops every queued buffer back into the pool. Returns how many.
    pub fn reset(&self) -> usize {
        let mut dropped = 0;
        while let Some(buf) = self.try_pop() {
            self.recycle(buf);
            dropped += 1;
        }
        dropped
    }
}
