// SPDX-License-Identifier: GPL-3.0-only

//! Execution context for everything that touches the kernel.
//!
//! In [`ThreadType::Kernel`] mode the impl state lives on a dedicated thread
//! running its own calloop loop. In [`ThreadType::User`] mode it lives next to
//! the caller and only makes progress when the caller pumps it, either through
//! [`Thread::dispatch`] or while blocked in [`Thread::run_sync`].

mod callbacks;

pub use self::callbacks::{Callback, CallbackContext, Callbacks};

use anyhow::{Context, Result};
use calloop::{
    EventLoop, LoopHandle, LoopSignal,
    channel::{Channel, Event, Sender, channel},
};
use std::{
    cell::{Cell, RefCell},
    fmt,
    sync::mpsc,
    thread::JoinHandle,
    time::Duration,
};
use tracing::{debug, error, info, warn};

use super::error::{KmsError, KmsResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadType {
    /// Impl runs inline on the owning thread
    User,
    /// Impl runs on its own OS thread
    Kernel,
}

type Task<I> = Box<dyn FnOnce(&mut I) + Send>;

/// Messages sent to the impl context
enum ImplMessage<I> {
    Task(Task<I>),
    Terminate,
}

thread_local! {
    static IN_IMPL: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current code runs inside an impl context
pub fn is_in_impl() -> bool {
    IN_IMPL.with(Cell::get)
}

struct ImplGuard(bool);

impl ImplGuard {
    fn enter() -> Self {
        ImplGuard(IN_IMPL.with(|flag| flag.replace(true)))
    }
}

impl Drop for ImplGuard {
    fn drop(&mut self) {
        IN_IMPL.with(|flag| flag.set(self.0));
    }
}

struct UserImpl<I: 'static> {
    event_loop: RefCell<EventLoop<'static, I>>,
    state: RefCell<I>,
}

impl<I: 'static> UserImpl<I> {
    fn dispatch(&self, timeout: Option<Duration>) -> KmsResult<()> {
        let (Ok(mut event_loop), Ok(mut state)) =
            (self.event_loop.try_borrow_mut(), self.state.try_borrow_mut())
        else {
            error!("Impl context re-entered while dispatching");
            return Err(KmsError::failed("impl context is busy"));
        };
        let _guard = ImplGuard::enter();
        event_loop
            .dispatch(timeout, &mut *state)
            .map_err(|err| KmsError::failed(format!("Failed to dispatch impl loop: {err}")))
    }
}

/// Sending half usable from any thread
pub struct ThreadHandle<I: 'static> {
    sender: Sender<ImplMessage<I>>,
    callbacks: Callbacks,
}

impl<I: 'static> Clone for ThreadHandle<I> {
    fn clone(&self) -> Self {
        ThreadHandle {
            sender: self.sender.clone(),
            callbacks: self.callbacks.clone(),
        }
    }
}

impl<I: 'static> ThreadHandle<I> {
    /// Fire and forget
    pub fn post(&self, task: impl FnOnce(&mut I) + Send + 'static) -> KmsResult<()> {
        self.sender
            .send(ImplMessage::Task(Box::new(task)))
            .map_err(|_| KmsError::Terminated)
    }

    /// Block until `task` has run on the impl context. Only valid when
    /// somebody else drives the impl (kernel mode, or user mode from
    /// another thread than the owner).
    pub fn run_sync<R: Send + 'static>(
        &self,
        task: impl FnOnce(&mut I) -> R + Send + 'static,
    ) -> KmsResult<R> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.post(move |state| {
            let _ = tx.send(task(state));
        })?;
        rx.recv().map_err(|_| KmsError::Terminated)
    }

    pub fn callbacks(&self) -> &Callbacks {
        &self.callbacks
    }
}

/// The task/callback engine
pub struct Thread<I: 'static> {
    name: String,
    thread_type: ThreadType,
    handle: ThreadHandle<I>,
    user: Option<UserImpl<I>>,
    join: Option<JoinHandle<()>>,
}

impl<I: 'static> fmt::Debug for Thread<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("name", &self.name)
            .field("thread_type", &self.thread_type)
            .field("callbacks", &self.handle.callbacks)
            .finish()
    }
}

fn insert_task_source<I: 'static>(
    handle: &LoopHandle<'static, I>,
    receiver: Channel<ImplMessage<I>>,
    signal: Option<LoopSignal>,
) -> Result<()> {
    handle
        .insert_source(receiver, move |event, _, state| match event {
            Event::Msg(ImplMessage::Task(task)) => task(state),
            Event::Msg(ImplMessage::Terminate) | Event::Closed => {
                if let Some(signal) = &signal {
                    signal.stop();
                    signal.wakeup();
                }
            }
        })
        .map_err(|err| err.error)
        .context("Failed to insert impl task source")?;
    Ok(())
}

impl<I: 'static> Thread<I> {
    /// Create the engine; `init` builds the impl state inside the impl context
    pub fn new<F>(name: &str, thread_type: ThreadType, init: F) -> Result<Self>
    where
        F: FnOnce(LoopHandle<'static, I>, Callbacks) -> I + Send + 'static,
    {
        let callbacks = Callbacks::new();
        let (sender, receiver) = channel::<ImplMessage<I>>();
        let handle = ThreadHandle {
            sender,
            callbacks: callbacks.clone(),
        };

        match thread_type {
            ThreadType::User => {
                let event_loop =
                    EventLoop::try_new().context("Failed to initialize impl event loop")?;
                let loop_handle = event_loop.handle();
                insert_task_source(&loop_handle, receiver, None)?;
                callbacks.attach(CallbackContext::IMPL, &loop_handle)?;
                let state = {
                    let _guard = ImplGuard::enter();
                    init(loop_handle, callbacks)
                };
                info!(name, "Running KMS impl inline");
                Ok(Thread {
                    name: name.to_string(),
                    thread_type,
                    handle,
                    user: Some(UserImpl {
                        event_loop: RefCell::new(event_loop),
                        state: RefCell::new(state),
                    }),
                    join: None,
                })
            }
            ThreadType::Kernel => {
                let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<()>>(1);
                let join = std::thread::Builder::new()
                    .name(name.to_string())
                    .spawn(move || impl_thread(receiver, callbacks, init, ready_tx))
                    .context("Failed to spawn KMS thread")?;
                ready_rx
                    .recv()
                    .context("KMS thread exited during startup")??;
                info!(name, "Started KMS impl thread");
                Ok(Thread {
                    name: name.to_string(),
                    thread_type,
                    handle,
                    user: None,
                    join: Some(join),
                })
            }
        }
    }

    pub fn thread_type(&self) -> ThreadType {
        self.thread_type
    }

    pub fn handle(&self) -> ThreadHandle<I> {
        self.handle.clone()
    }

    pub fn callbacks(&self) -> &Callbacks {
        &self.handle.callbacks
    }

    /// Run `task` in the impl context and wait for its result
    pub fn run_sync<R: Send + 'static>(
        &self,
        task: impl FnOnce(&mut I) -> R + Send + 'static,
    ) -> KmsResult<R> {
        let Some(user) = &self.user else {
            return self.handle.run_sync(task);
        };

        let (tx, rx) = mpsc::sync_channel(1);
        self.handle.post(move |state| {
            let _ = tx.send(task(state));
        })?;
        loop {
            match rx.try_recv() {
                Ok(result) => return Ok(result),
                Err(mpsc::TryRecvError::Disconnected) => return Err(KmsError::Terminated),
                Err(mpsc::TryRecvError::Empty) => user.dispatch(None)?,
            }
        }
    }

    /// Queue `task` without waiting
    pub fn post(&self, task: impl FnOnce(&mut I) + Send + 'static) -> KmsResult<()> {
        self.handle.post(task)
    }

    pub fn queue_callback(&self, ctx: CallbackContext, callback: impl FnOnce() + Send + 'static) {
        self.handle.callbacks.queue(ctx, callback);
    }

    /// Pump the inline impl (user mode) and run main-context callbacks
    pub fn dispatch(&self, timeout: Option<Duration>) -> KmsResult<usize> {
        if let Some(user) = &self.user {
            user.dispatch(timeout)?;
        } else if let Some(timeout) = timeout {
            self.handle
                .callbacks
                .wait_pending(CallbackContext::MAIN, timeout);
        }
        Ok(self.handle.callbacks.dispatch(CallbackContext::MAIN))
    }

    /// Drain every context until nothing is queued anywhere
    pub fn flush_callbacks(&self) -> usize {
        let callbacks = &self.handle.callbacks;
        let mut total = 0;
        loop {
            let mut progress = callbacks.dispatch(CallbackContext::MAIN);

            if let Some(user) = &self.user {
                // the impl context is drained by its ping source
                if callbacks.has_pending(CallbackContext::IMPL) {
                    if let Err(err) = user.dispatch(Some(Duration::ZERO)) {
                        warn!(?err, "Failed to flush impl callbacks");
                        progress += callbacks.dispatch(CallbackContext::IMPL);
                    } else {
                        progress += 1;
                    }
                }
            }

            for ctx in callbacks.contexts() {
                if ctx == CallbackContext::MAIN || !callbacks.needs_flush(ctx) {
                    continue;
                }
                if ctx == CallbackContext::IMPL && self.user.is_some() {
                    continue;
                }
                if callbacks.is_attached(ctx) {
                    callbacks.wait_flushed(ctx);
                    progress += 1;
                } else {
                    progress += callbacks.dispatch(ctx);
                }
            }

            if progress == 0 {
                break;
            }
            total += progress;
        }
        debug!(total, "Flushed callbacks");
        total
    }
}

impl<I: 'static> Drop for Thread<I> {
    fn drop(&mut self) {
        let _ = self.handle.sender.send(ImplMessage::Terminate);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!(name = self.name, "KMS thread panicked");
            }
        }
    }
}

fn impl_thread<I: 'static, F>(
    receiver: Channel<ImplMessage<I>>,
    callbacks: Callbacks,
    init: F,
    ready: mpsc::SyncSender<Result<()>>,
) where
    F: FnOnce(LoopHandle<'static, I>, Callbacks) -> I,
{
    let _guard = ImplGuard::enter();

    let setup = || -> Result<(EventLoop<'static, I>, I)> {
        let event_loop = EventLoop::try_new().context("Failed to initialize impl event loop")?;
        let handle = event_loop.handle();
        insert_task_source(&handle, receiver, Some(event_loop.get_signal()))?;
        callbacks.attach(CallbackContext::IMPL, &handle)?;
        let state = init(handle, callbacks.clone());
        Ok((event_loop, state))
    };

    let (mut event_loop, mut state) = match setup() {
        Ok(setup) => {
            let _ = ready.send(Ok(()));
            setup
        }
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };

    if let Err(err) = event_loop.run(None, &mut state, |_| {}) {
        error!(?err, "KMS impl loop failed");
    }

    // nothing else will drain the impl context
    callbacks.dispatch(CallbackContext::IMPL);
    debug!("KMS impl thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    #[derive(Default)]
    struct Counter {
        value: usize,
        in_impl: bool,
    }

    fn counter(thread_type: ThreadType) -> Thread<Counter> {
        Thread::new("test-kms", thread_type, |_, _| Counter::default()).unwrap()
    }

    #[test]
    fn run_sync_returns_task_result_in_both_modes() {
        for thread_type in [ThreadType::User, ThreadType::Kernel] {
            let thread = counter(thread_type);
            let value = thread
                .run_sync(|state: &mut Counter| {
                    state.value += 41;
                    state.in_impl = is_in_impl();
                    state.value + 1
                })
                .unwrap();
            assert_eq!(value, 42);
            assert!(thread.run_sync(|state: &mut Counter| state.in_impl).unwrap());
            assert!(!is_in_impl());
        }
    }

    #[test]
    fn kernel_mode_runs_on_a_different_thread() {
        let thread = counter(ThreadType::Kernel);
        let caller = std::thread::current().id();
        let impl_id = thread.run_sync(|_| std::thread::current().id()).unwrap();
        assert_ne!(caller, impl_id);

        let thread = counter(ThreadType::User);
        let impl_id = thread.run_sync(|_| std::thread::current().id()).unwrap();
        assert_eq!(caller, impl_id);
    }

    #[test]
    fn posted_tasks_keep_submission_order() {
        for thread_type in [ThreadType::User, ThreadType::Kernel] {
            let thread = counter(thread_type);
            let log = Arc::new(Mutex::new(Vec::new()));
            for i in 0..10 {
                let log = log.clone();
                thread
                    .post(move |_: &mut Counter| log.lock().unwrap().push(i))
                    .unwrap();
            }
            thread.run_sync(|_| ()).unwrap();
            assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
        }
    }

    #[test]
    fn impl_callbacks_reach_main_context() {
        for thread_type in [ThreadType::User, ThreadType::Kernel] {
            let thread: Thread<Callbacks> =
                Thread::new("test-kms", thread_type, |_, callbacks| callbacks).unwrap();
            let hits = Arc::new(AtomicUsize::new(0));
            let h = hits.clone();
            thread
                .run_sync(move |callbacks: &mut Callbacks| {
                    callbacks.queue(CallbackContext::MAIN, move || {
                        h.fetch_add(1, Ordering::SeqCst);
                    });
                })
                .unwrap();
            assert_eq!(hits.load(Ordering::SeqCst), 0);
            assert_eq!(thread.flush_callbacks(), 1);
            assert_eq!(hits.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn flush_follows_callbacks_across_contexts() {
        let thread: Thread<Callbacks> =
            Thread::new("test-kms", ThreadType::Kernel, |_, callbacks| callbacks).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let callbacks = thread.callbacks().clone();
        // main -> impl -> main
        thread.queue_callback(CallbackContext::MAIN, move || {
            let h2 = h.clone();
            let callbacks2 = callbacks.clone();
            callbacks.queue(CallbackContext::IMPL, move || {
                h2.fetch_add(1, Ordering::SeqCst);
                let h3 = h2.clone();
                callbacks2.queue(CallbackContext::MAIN, move || {
                    h3.fetch_add(1, Ordering::SeqCst);
                });
            });
        });
        thread.flush_callbacks();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn handle_can_post_from_other_threads() {
        let thread = counter(ThreadType::Kernel);
        let handle = thread.handle();
        std::thread::spawn(move || {
            handle.run_sync(|state: &mut Counter| state.value = 7).unwrap();
        })
        .join()
        .unwrap();
        assert_eq!(thread.run_sync(|state: &mut Counter| state.value).unwrap(), 7);
    }

    #[test]
    fn terminated_thread_reports_error() {
        let thread = counter(ThreadType::Kernel);
        let handle = thread.handle();
        drop(thread);
        assert_eq!(handle.run_sync(|_| ()), Err(KmsError::Terminated));
    }
}
