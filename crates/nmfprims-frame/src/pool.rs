//! Reusable buffers and per-message decoder state.
//!
//! A [`Pool`] is the only thing sessions share with each other. Every item
//! is handed to exactly one borrower at a time and recycled when the
//! [`Pooled`] guard drops, so no buffer is ever visible to two sessions.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::BytesMut;

use crate::duplex::ClientDuplexDecoder;
use crate::decoder::FramingDecoder;
use crate::singleton::{ClientSingletonDecoder, SingletonEnvelopeDecoder};
use crate::string::QuotaStringDecoder;

/// Default number of idle items a pool keeps.
pub const DEFAULT_MAX_IDLE: usize = 32;

/// Return an item to its freshly-created state without freeing its
/// allocations.
pub trait Recycle {
    fn recycle(&mut self);
}

impl Recycle for BytesMut {
    fn recycle(&mut self) {
        self.clear();
    }
}

impl Recycle for Vec<u8> {
    fn recycle(&mut self) {
        self.clear();
    }
}

impl Recycle for QuotaStringDecoder {
    fn recycle(&mut self) {
        self.reset();
    }
}

impl Recycle for ClientDuplexDecoder {
    fn recycle(&mut self) {
        self.reset();
    }
}

impl Recycle for ClientSingletonDecoder {
    fn recycle(&mut self) {
        self.reset();
    }
}

impl Recycle for SingletonEnvelopeDecoder {
    fn recycle(&mut self) {
        self.reset();
    }
}

impl<A: Recycle, B: Recycle> Recycle for (A, B) {
    fn recycle(&mut self) {
        self.0.recycle();
        self.1.recycle();
    }
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

/// Bounded pool of recyclable items.
pub struct Pool<T> {
    idle: Mutex<Vec<T>>,
    max_idle: usize,
    factory: Factory<T>,
}

impl<T: Recycle> Pool<T> {
    /// Create a pool that builds new items with `factory` and keeps at most
    /// `max_idle` of them between uses.
    pub fn new(max_idle: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
            factory: Box::new(factory),
        }
    }

    /// Borrow an item, building one if none is idle.
    pub fn take(self: &Arc<Self>) -> Pooled<T> {
        let item = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| (self.factory)());
        Pooled {
            item: Some(item),
            pool: Arc::clone(self),
        }
    }

    fn give_back(&self, mut item: T) {
        item.recycle();
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.max_idle {
            idle.push(item);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn max_idle(&self) -> usize {
        self.max_idle
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let idle = self.idle.lock().map(|idle| idle.len()).unwrap_or(0);
        f.debug_struct("Pool")
            .field("idle", &idle)
            .field("max_idle", &self.max_idle)
            .finish()
    }
}

/// Pool of receive/send buffers with a fixed initial capacity.
pub type BufferPool = Pool<BytesMut>;

impl Pool<BytesMut> {
    pub fn with_buffer_size(buffer_size: usize, max_idle: usize) -> Self {
        Self::new(max_idle, move || BytesMut::with_capacity(buffer_size))
    }
}

/// An item borrowed from a [`Pool`]. Recycled and returned on drop.
pub struct Pooled<T: Recycle> {
    item: Option<T>,
    pool: Arc<Pool<T>>,
}

impl<T: Recycle> Pooled<T> {
    /// Keep the item instead of returning it to the pool.
    pub fn detach(mut self) -> Option<T> {
        self.item.take()
    }
}

impl<T: Recycle> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.item {
            Some(item) => item,
            None => unreachable!("pooled item is only taken on drop or detach"),
        }
    }
}

impl<T: Recycle> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.item {
            Some(item) => item,
            None => unreachable!("pooled item is only taken on drop or detach"),
        }
    }
}

impl<T: Recycle + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&self.item).finish()
    }
}

impl<T: Recycle> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.give_back(item);
        }
    }
}
