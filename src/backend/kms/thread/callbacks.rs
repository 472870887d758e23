// SPDX-License-Identifier: GPL-3.0-only

use anyhow::{Context, Result};
use calloop::{
    LoopHandle, RegistrationToken,
    ping::{Ping, make_ping},
};
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};
use tracing::{trace, warn};

pub type Callback = Box<dyn FnOnce() + Send>;

/// A place callbacks are delivered to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackContext(u32);

impl CallbackContext {
    /// The thread that owns the `Kms` instance
    pub const MAIN: CallbackContext = CallbackContext(0);
    /// The KMS impl context
    pub const IMPL: CallbackContext = CallbackContext(1);
}

impl fmt::Display for CallbackContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            CallbackContext::MAIN => write!(f, "main"),
            CallbackContext::IMPL => write!(f, "impl"),
            CallbackContext(id) => write!(f, "context{id}"),
        }
    }
}

#[derive(Default)]
struct QueueState {
    callbacks: VecDeque<Callback>,
    needs_flush: bool,
    waker: Option<Ping>,
}

#[derive(Default)]
struct CallbackQueue {
    state: Mutex<QueueState>,
    flushed: Condvar,
}

impl CallbackQueue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registry of callback contexts and their queues
#[derive(Clone)]
pub struct Callbacks {
    queues: Arc<Mutex<HashMap<CallbackContext, Arc<CallbackQueue>>>>,
    next_id: Arc<AtomicU32>,
}

impl Default for Callbacks {
    fn default() -> Self {
        Self::new()
    }
}

impl Callbacks {
    pub fn new() -> Self {
        let queues = [CallbackContext::MAIN, CallbackContext::IMPL]
            .into_iter()
            .map(|ctx| (ctx, Arc::new(CallbackQueue::default())))
            .collect();
        Callbacks {
            queues: Arc::new(Mutex::new(queues)),
            next_id: Arc::new(AtomicU32::new(2)),
        }
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<CallbackContext, Arc<CallbackQueue>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue_for(&self, ctx: CallbackContext) -> Option<Arc<CallbackQueue>> {
        self.queues().get(&ctx).cloned()
    }

    /// Register a new delivery context
    pub fn register(&self) -> CallbackContext {
        let ctx = CallbackContext(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.queues().insert(ctx, Arc::new(CallbackQueue::default()));
        ctx
    }

    /// Remove a context; whatever is still queued moves to the main context
    pub fn unregister(&self, ctx: CallbackContext) {
        if ctx == CallbackContext::MAIN || ctx == CallbackContext::IMPL {
            return;
        }
        let Some(queue) = self.queues().remove(&ctx) else {
            return;
        };
        let leftovers = std::mem::take(&mut queue.lock().callbacks);
        queue.flushed.notify_all();
        for callback in leftovers {
            self.queue_boxed(CallbackContext::MAIN, callback);
        }
    }

    pub fn contexts(&self) -> Vec<CallbackContext> {
        let mut contexts: Vec<_> = self.queues().keys().copied().collect();
        contexts.sort();
        contexts
    }

    /// Append a callback to `ctx` and mark it ready
    pub fn queue(&self, ctx: CallbackContext, callback: impl FnOnce() + Send + 'static) {
        self.queue_boxed(ctx, Box::new(callback));
    }

    fn queue_boxed(&self, ctx: CallbackContext, callback: Callback) {
        let queue = match self.queue_for(ctx) {
            Some(queue) => queue,
            None => {
                warn!(%ctx, "Queueing callback on unregistered context, using main");
                match self.queue_for(CallbackContext::MAIN) {
                    Some(queue) => queue,
                    None => return,
                }
            }
        };
        let mut state = queue.lock();
        state.callbacks.push_back(callback);
        state.needs_flush = true;
        if let Some(waker) = &state.waker {
            waker.ping();
        }
        queue.flushed.notify_all();
    }

    /// Queue dropping `value` on `ctx`
    pub fn queue_release<T: Send + 'static>(&self, ctx: CallbackContext, value: T) {
        self.queue(ctx, move || drop(value));
    }

    pub fn has_pending(&self, ctx: CallbackContext) -> bool {
        self.queue_for(ctx)
            .is_some_and(|queue| !queue.lock().callbacks.is_empty())
    }

    /// Run everything queued on `ctx`, including callbacks queued while
    /// dispatching. Returns how many ran.
    pub fn dispatch(&self, ctx: CallbackContext) -> usize {
        let Some(queue) = self.queue_for(ctx) else {
            return 0;
        };

        let mut count = 0;
        loop {
            let next = {
                let mut state = queue.lock();
                let next = state.callbacks.pop_front();
                if next.is_none() {
                    state.needs_flush = false;
                    queue.flushed.notify_all();
                }
                next
            };
            match next {
                Some(callback) => {
                    callback();
                    count += 1;
                }
                None => break,
            }
        }
        if count > 0 {
            trace!(%ctx, count, "Dispatched callbacks");
        }
        count
    }

    /// Whether `ctx` has callbacks queued or still running
    pub fn needs_flush(&self, ctx: CallbackContext) -> bool {
        self.queue_for(ctx).is_some_and(|queue| queue.lock().needs_flush)
    }

    /// Wait up to `timeout` for something to be queued on `ctx`
    pub fn wait_pending(&self, ctx: CallbackContext, timeout: Duration) -> bool {
        let Some(queue) = self.queue_for(ctx) else {
            return false;
        };
        let state = queue.lock();
        let (state, _) = queue
            .flushed
            .wait_timeout_while(state, timeout, |state| state.callbacks.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        !state.callbacks.is_empty()
    }

    /// Block until the owner of `ctx` has drained its queue
    pub fn wait_flushed(&self, ctx: CallbackContext) {
        let Some(queue) = self.queue_for(ctx) else {
            return;
        };
        let mut state = queue.lock();
        while state.needs_flush {
            state = queue
                .flushed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn is_attached(&self, ctx: CallbackContext) -> bool {
        self.queue_for(ctx)
            .is_some_and(|queue| queue.lock().waker.is_some())
    }

    /// Drain `ctx` from an event loop: every queued callback wakes the loop
    pub fn attach<D: 'static>(
        &self,
        ctx: CallbackContext,
        handle: &LoopHandle<'static, D>,
    ) -> Result<RegistrationToken> {
        let queue = self
            .queue_for(ctx)
            .with_context(|| format!("Callback context {ctx} is not registered"))?;
        let (ping, source) = make_ping().context("Failed to create callback ping")?;

        let callbacks = self.clone();
        let token = handle
            .insert_source(source, move |_, _, _| {
                callbacks.dispatch(ctx);
            })
            .map_err(|err| err.error)
            .context("Failed to insert callback source")?;

        let mut state = queue.lock();
        if !state.callbacks.is_empty() {
            ping.ping();
        }
        state.waker = Some(ping);
        Ok(token)
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("contexts", &self.contexts())
            .finish()
    }
}
