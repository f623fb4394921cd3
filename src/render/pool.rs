//! Bounded pooling of renderer instances.
//!
//! A pool is a semaphore-gated queue: `min` instances are built up front,
//! further instances are created lazily up to `max`, and a leased instance
//! returns to the queue when its guard drops. Release on every path,
//! including render failures, is therefore guaranteed by the guard.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{RenderServerError, Result};

/// Instance count bounds for one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolBounds {
    pub min: usize,
    pub max: usize,
}

impl PoolBounds {
    /// Bounds for pixel ratio `scale`, indexing the configured ladders at
    /// `scale - 1` and clamping to their last entry. `max` never drops
    /// below `min`.
    pub fn for_scale(min_ladder: &[usize], max_ladder: &[usize], scale: u8) -> Self {
        let idx = usize::from(scale.max(1)) - 1;
        let pick = |ladder: &[usize], fallback: usize| {
            ladder
                .get(idx)
                .or_else(|| ladder.last())
                .copied()
                .unwrap_or(fallback)
        };
        let min = pick(min_ladder, 1);
        let max = pick(max_ladder, min).max(min);
        Self { min, max }
    }
}

struct Inner<T: Send + 'static> {
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<T>>,
    live: AtomicUsize,
    closed: AtomicBool,
    create: Box<dyn Fn() -> Result<T> + Send + Sync>,
    destroy: Box<dyn Fn(T) + Send + Sync>,
}

/// Semaphore-gated instance pool.
pub struct Pool<T: Send + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Pool<T> {
    pub fn new(
        bounds: PoolBounds,
        create: impl Fn() -> Result<T> + Send + Sync + 'static,
        destroy: impl Fn(T) + Send + Sync + 'static,
    ) -> Result<Self> {
        let max = bounds.max.max(1);
        let min = bounds.min.min(max);

        let mut idle = Vec::with_capacity(max);
        for _ in 0..min {
            idle.push(create()?);
        }

        let inner = Arc::new(Inner {
            semaphore: Arc::new(Semaphore::new(max)),
            live: AtomicUsize::new(idle.len()),
            idle: Mutex::new(idle),
            closed: AtomicBool::new(false),
            create: Box::new(create),
            destroy: Box::new(destroy),
        });

        Ok(Self { inner })
    }

    /// Reserve an instance. Fails once the pool is closed; waiting callers
    /// are released by dropping the returned future (outer request timeout).
    pub async fn acquire(&self) -> Result<Lease<T>> {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| RenderServerError::Render("renderer pool is closed".into()))?;

        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RenderServerError::Render("renderer pool is closed".into()));
        }

        let existing = self
            .inner
            .idle
            .lock()
            .map_err(|_| RenderServerError::Render("renderer pool poisoned".into()))?
            .pop();

        let value = match existing {
            Some(v) => v,
            None => {
                // Lazily grow toward `max`; the permit releases on error.
                let v = (self.inner.create)()?;
                self.inner.live.fetch_add(1, Ordering::Relaxed);
                v
            }
        };

        Ok(Lease {
            value: Some(value),
            inner: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Close the pool: fail future acquires and destroy idle instances.
    /// Instances currently leased are destroyed when their guard drops.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.semaphore.close();

        let drained: Vec<T> = match self.inner.idle.lock() {
            Ok(mut idle) => idle.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for value in drained {
            self.inner.live.fetch_sub(1, Ordering::Relaxed);
            (self.inner.destroy)(value);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Instances alive (idle + leased).
    pub fn live_count(&self) -> usize {
        self.inner.live.load(Ordering::Relaxed)
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }
}

/// Exclusive lease on one pooled instance; dropping it is the release.
pub struct Lease<T: Send + 'static> {
    value: Option<T>,
    inner: Arc<Inner<T>>,
    _permit: OwnedSemaphorePermit,
}

impl<T: Send + 'static> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("lease already released")
    }
}

impl<T: Send + 'static> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("lease already released")
    }
}

impl<T: Send + 'static> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            if self.inner.closed.load(Ordering::Acquire) {
                self.inner.live.fetch_sub(1, Ordering::Relaxed);
                (self.inner.destroy)(value);
            } else if let Ok(mut idle) = self.inner.idle.lock() {
                idle.push(value);
            }
        }
    }
}
