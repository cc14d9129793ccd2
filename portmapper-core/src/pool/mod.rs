//! Reusable datagram buffers.
//!
//! Every [`PacketBuf`] handed out by [`BufferPool::acquire`] goes back to its pool
//! exactly once: either through [`BufferPool::release`] / [`PacketBuf::release`] or
//! implicitly when it is dropped, which also covers relay tasks being cancelled
//! while they still hold a datagram.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;

struct Shared {
    queue: ArrayQueue<BytesMut>,
    buf_capacity: usize,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<Shared>,
}

impl BufferPool {
    /// `capacity` bounds how many idle buffers are kept for reuse,
    /// `buf_capacity` is the size of every buffer handed out.
    pub fn new(capacity: usize, buf_capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: ArrayQueue::new(capacity.max(1)),
                buf_capacity,
                acquired: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
            }),
        }
    }
    pub fn acquire(&self) -> PacketBuf {
        let data = if let Some(mut data) = self.shared.queue.pop() {
            data.clear();
            data
        } else {
            BytesMut::with_capacity(self.shared.buf_capacity)
        };
        self.shared.acquired.fetch_add(1, Ordering::Relaxed);
        PacketBuf {
            shared: self.shared.clone(),
            data: std::mem::ManuallyDrop::new(data),
        }
    }
    pub fn release(&self, buf: PacketBuf) {
        drop(buf)
    }
    pub fn buf_capacity(&self) -> usize {
        self.shared.buf_capacity
    }
    pub fn acquired(&self) -> usize {
        self.shared.acquired.load(Ordering::Acquire)
    }
    pub fn released(&self) -> usize {
        self.shared.released.load(Ordering::Acquire)
    }
    /// Buffers currently held outside the pool.
    pub fn outstanding(&self) -> usize {
        self.acquired().saturating_sub(self.released())
    }
    /// Buffers waiting in the pool for reuse.
    pub fn idle(&self) -> usize {
        self.shared.queue.len()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buf_capacity", &self.shared.buf_capacity)
            .field("acquired", &self.acquired())
            .field("released", &self.released())
            .field("idle", &self.idle())
            .finish()
    }
}

/// A datagram payload. `len()` is the valid length of the datagram it holds.
pub struct PacketBuf {
    shared: Arc<Shared>,
    data: std::mem::ManuallyDrop<BytesMut>,
}

impl PacketBuf {
    /// Returns the buffer to the pool it was acquired from.
    pub fn release(self) {
        drop(self)
    }
}

impl Drop for PacketBuf {
    fn drop(&mut self) {
        let mut data = unsafe { std::mem::ManuallyDrop::take(&mut self.data) };
        self.shared.released.fetch_add(1, Ordering::Release);
        // a buffer that was grown or split is not reused
        if data.capacity() >= self.shared.buf_capacity {
            data.clear();
            let _ = self.shared.queue.push(data);
        }
    }
}

impl Deref for PacketBuf {
    type Target = BytesMut;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.data.deref()
    }
}

impl DerefMut for PacketBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data.deref_mut()
    }
}

impl AsRef<[u8]> for PacketBuf {
    fn as_ref(&self) -> &[u8] {
        &self.data[..]
    }
}

impl fmt::Debug for PacketBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuf")
            .field("len", &self.data.len())
            .field("capacity", &self.data.capacity())
            .finish()
    }
}
