//! Pooling for units with per-call scratch state.
//!
//! Most units are stateless and shared by every dispatch. A unit that keeps
//! scratch buffers between calls implements [`Poolable`] and is registered
//! through [`PooledMiddleware`]: each dispatch rents an instance, which is
//! moved out of the pool for the duration of the call and returned afterwards.

use crate::context::PipelineContext;
use crate::middleware::{invoke_with_hooks, Middleware, Next};
use crate::pipeline::Stage;
use dispatch_core::{BoxFuture, DispatchResult, Message, MessageKind};
use parking_lot::Mutex;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

/// A unit instance that can be reused across dispatches.
pub trait Poolable: Send + 'static {
    /// Clears per-call state before the instance goes back to the pool.
    fn reset(&mut self);

    /// Returns `false` once the instance must not be reused.
    fn is_reusable(&self) -> bool {
        true
    }
}

/// A bounded pool of instances built by a factory.
pub struct MiddlewarePool<M> {
    idle: Mutex<Vec<M>>,
    factory: Box<dyn Fn() -> M + Send + Sync>,
    max_idle: usize,
    created: AtomicUsize,
    in_use: AtomicUsize,
}

impl<M: Poolable> MiddlewarePool<M> {
    /// Creates an empty pool keeping at most `max_idle` returned instances.
    pub fn new(max_idle: usize, factory: impl Fn() -> M + Send + Sync + 'static) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(max_idle)),
            factory: Box::new(factory),
            max_idle,
            created: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
        }
    }

    /// Rents an instance, reusing an idle one when available.
    pub fn rent(&self) -> Rented<'_, M> {
        let instance = self.idle.lock().pop().unwrap_or_else(|| {
            self.created.fetch_add(1, Ordering::Relaxed);
            (self.factory)()
        });
        self.in_use.fetch_add(1, Ordering::Relaxed);
        Rented {
            pool: self,
            instance: Some(instance),
        }
    }

    fn give_back(&self, mut instance: M) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        if !instance.is_reusable() {
            return;
        }
        instance.reset();
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(instance);
        }
    }

    /// Returns the number of idle instances.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    /// Returns the number of rented instances.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Returns the number of instances the factory has built.
    #[must_use]
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

impl<M> fmt::Debug for MiddlewarePool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewarePool")
            .field("idle", &self.idle.lock().len())
            .field("max_idle", &self.max_idle)
            .field("created", &self.created.load(Ordering::Relaxed))
            .field("in_use", &self.in_use.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// An instance rented from a [`MiddlewarePool`], returned on drop.
pub struct Rented<'p, M: Poolable> {
    pool: &'p MiddlewarePool<M>,
    instance: Option<M>,
}

impl<M: Poolable> Deref for Rented<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        // Only `Drop` takes the instance.
        self.instance.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<M: Poolable> DerefMut for Rented<'_, M> {
    fn deref_mut(&mut self) -> &mut M {
        self.instance.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<M: Poolable> Drop for Rented<'_, M> {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            self.pool.give_back(instance);
        }
    }
}

/// Registers a pooled unit in a pipeline.
///
/// Stage, kinds and features are read from a sample instance at construction.
pub struct PooledMiddleware<M> {
    pool: MiddlewarePool<M>,
    name: &'static str,
    stage: Stage,
    kinds: MessageKind,
    features: Vec<String>,
}

impl<M: Middleware + Poolable> PooledMiddleware<M> {
    /// Creates a pooled unit.
    pub fn new(max_idle: usize, factory: impl Fn() -> M + Send + Sync + 'static) -> Self {
        let pool = MiddlewarePool::new(max_idle, factory);
        let (name, stage, kinds, features) = {
            let sample = pool.rent();
            (
                sample.name(),
                sample.stage(),
                sample.applicable_kinds(),
                sample.required_features().to_vec(),
            )
        };
        Self {
            pool,
            name,
            stage,
            kinds,
            features,
        }
    }

    /// Returns the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &MiddlewarePool<M> {
        &self.pool
    }
}

impl<M> fmt::Debug for PooledMiddleware<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledMiddleware")
            .field("name", &self.name)
            .field("stage", &self.stage)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl<M: Middleware + Poolable> Middleware for PooledMiddleware<M> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn stage(&self) -> Stage {
        self.stage
    }

    fn applicable_kinds(&self) -> MessageKind {
        self.kinds
    }

    fn required_features(&self) -> &[String] {
        &self.features
    }

    fn invoke<'a>(
        &'a self,
        message: &'a Message,
        ctx: &'a mut PipelineContext,
        next: Next<'a>,
        token: CancellationToken,
    ) -> BoxFuture<'a, DispatchResult> {
        Box::pin(async move {
            let instance = self.pool.rent();
            invoke_with_hooks(&*instance, message, ctx, next, token).await
        })
    }
}
