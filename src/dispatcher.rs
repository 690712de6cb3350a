//! Schedules asynchronous calls under global and per-host limits.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::call::{Call, Callback, RealCall};
use crate::error::Error;

/// Runs dispatcher tasks. The default spawns onto the current tokio
/// runtime; a rejection fails the call with an I/O error.
pub trait Executor: Send + Sync {
    /// Returns false when the task cannot be accepted.
    fn execute(&self, task: Pin<Box<dyn Future<Output = ()> + Send + 'static>>) -> bool;
}

/// Spawns onto the ambient tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioExecutor;

impl Executor for TokioExecutor {
    fn execute(&self, task: Pin<Box<dyn Future<Output = ()> + Send + 'static>>) -> bool {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(task);
                true
            }
            Err(_) => false,
        }
    }
}

/// An enqueued asynchronous call. All async calls to one host share a
/// single in-flight counter so the per-host limit holds across the ready
/// and running queues.
pub(crate) struct AsyncCall {
    pub call: Arc<RealCall>,
    pub callback: Arc<dyn Callback>,
    pub host: String,
    pub calls_per_host: Arc<AtomicUsize>,
}

struct DispatchState {
    ready_async: VecDeque<Arc<AsyncCall>>,
    running_async: Vec<Arc<AsyncCall>>,
    running_sync: Vec<Arc<RealCall>>,
}

struct DispatcherInner {
    max_requests: AtomicUsize,
    max_requests_per_host: AtomicUsize,
    state: Mutex<DispatchState>,
    idle_callback: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    executor: Box<dyn Executor>,
}

/// Policy on when asynchronous calls run: at most `max_requests` overall
/// and `max_requests_per_host` per host, in enqueue order.
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Defaults: 64 concurrent requests, 5 per host.
    pub fn new() -> Self {
        Self::with_executor(Box::new(TokioExecutor))
    }

    pub fn with_executor(executor: Box<dyn Executor>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                max_requests: AtomicUsize::new(64),
                max_requests_per_host: AtomicUsize::new(5),
                state: Mutex::new(DispatchState {
                    ready_async: VecDeque::new(),
                    running_async: Vec::new(),
                    running_sync: Vec::new(),
                }),
                idle_callback: Mutex::new(None),
                executor,
            }),
        }
    }

    pub fn max_requests(&self) -> usize {
        self.inner.max_requests.load(Ordering::Acquire)
    }

    pub fn set_max_requests(&self, max: usize) {
        assert!(max >= 1, "max_requests must be positive");
        self.inner.max_requests.store(max, Ordering::Release);
        self.promote_and_execute();
    }

    pub fn max_requests_per_host(&self) -> usize {
        self.inner.max_requests_per_host.load(Ordering::Acquire)
    }

    pub fn set_max_requests_per_host(&self, max: usize) {
        assert!(max >= 1, "max_requests_per_host must be positive");
        self.inner
            .max_requests_per_host
            .store(max, Ordering::Release);
        self.promote_and_execute();
    }

    /// Invoked each time the dispatcher goes idle (no running calls).
    pub fn set_idle_callback(&self, callback: Option<Arc<dyn Fn() + Send + Sync>>) {
        *self
            .inner
            .idle_callback
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = callback;
    }

    pub fn running_count(&self) -> usize {
        let state = self.lock_state();
        state.running_async.len() + state.running_sync.len()
    }

    pub fn queued_count(&self) -> usize {
        self.lock_state().ready_async.len()
    }

    fn lock_state(&self) -> MutexGuard<'_, DispatchState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue an asynchronous call; it runs when the limits allow.
    pub(crate) fn enqueue(&self, call: Arc<RealCall>, callback: Arc<dyn Callback>) {
        let host = call
            .request()
            .url()
            .host_str()
            .unwrap_or_default()
            .to_ascii_lowercase();
        {
            let mut state = self.lock_state();
            // Share the in-flight counter with any other call to this host.
            let calls_per_host = state
                .running_async
                .iter()
                .chain(state.ready_async.iter())
                .find(|existing| existing.host == host)
                .map(|existing| Arc::clone(&existing.calls_per_host))
                .unwrap_or_default();
            state.ready_async.push_back(Arc::new(AsyncCall {
                call,
                callback,
                host,
                calls_per_host,
            }));
        }
        self.promote_and_execute();
    }

    /// Record a synchronous call for accounting and cancel fan-out.
    pub(crate) fn executed(&self, call: &Arc<RealCall>) {
        self.lock_state().running_sync.push(Arc::clone(call));
    }

    pub(crate) fn finished_sync(&self, call: &Arc<RealCall>) {
        {
            let mut state = self.lock_state();
            state
                .running_sync
                .retain(|running| !Arc::ptr_eq(running, call));
        }
        self.after_finished();
    }

    fn finished_async(&self, async_call: &Arc<AsyncCall>) {
        async_call.calls_per_host.fetch_sub(1, Ordering::AcqRel);
        {
            let mut state = self.lock_state();
            state
                .running_async
                .retain(|running| !Arc::ptr_eq(running, async_call));
        }
        self.after_finished();
    }

    fn after_finished(&self) {
        let is_running = self.promote_and_execute();
        if !is_running {
            let idle_callback = self
                .inner
                .idle_callback
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            if let Some(idle_callback) = idle_callback {
                idle_callback();
            }
        }
    }

    /// Move ready calls into the running queue until a limit is hit, then
    /// hand them to the executor. Never invoked with a lock held and never
    /// from within an application callback.
    fn promote_and_execute(&self) -> bool {
        let max_requests = self.max_requests();
        let max_per_host = self.max_requests_per_host();
        let mut executable: Vec<Arc<AsyncCall>> = Vec::new();
        let is_running;
        {
            let mut state = self.lock_state();
            let mut i = 0;
            while i < state.ready_async.len() {
                // The global limit is order-independent: nothing later in
                // the queue could start either.
                if state.running_async.len() >= max_requests {
                    break;
                }
                let candidate = &state.ready_async[i];
                // The per-host limit is not: a later call to another host
                // may still be admissible.
                if candidate.calls_per_host.load(Ordering::Acquire) >= max_per_host {
                    i += 1;
                    continue;
                }
                let async_call = state
                    .ready_async
                    .remove(i)
                    .unwrap_or_else(|| unreachable!("index checked above"));
                async_call.calls_per_host.fetch_add(1, Ordering::AcqRel);
                state.running_async.push(Arc::clone(&async_call));
                executable.push(async_call);
            }
            is_running = state.running_async.len() + state.running_sync.len() > 0;
        }

        for async_call in executable {
            let dispatcher = self.clone();
            let task_call = Arc::clone(&async_call);
            let accepted = self.inner.executor.execute(Box::pin(async move {
                let result = RealCall::run(&task_call.call).await;
                let handle = Call::from_inner(Arc::clone(&task_call.call));
                match result {
                    Ok(response) => task_call.callback.on_response(&handle, response),
                    Err(error) => task_call.callback.on_failure(&handle, error),
                }
                dispatcher.finished_async(&task_call);
            }));
            if !accepted {
                tracing::warn!(host = %async_call.host, "executor rejected call");
                let handle = Call::from_inner(Arc::clone(&async_call.call));
                async_call
                    .callback
                    .on_failure(&handle, Error::io("executor rejected the call"));
                self.finished_async(&async_call);
            }
        }
        is_running
    }

    /// Cancel every call: queued, running async, and running sync.
    pub fn cancel_all(&self) {
        let calls: Vec<Arc<RealCall>> = {
            let state = self.lock_state();
            state
                .ready_async
                .iter()
                .chain(state.running_async.iter())
                .map(|async_call| Arc::clone(&async_call.call))
                .chain(state.running_sync.iter().cloned())
                .collect()
        };
        for call in calls {
            call.cancel();
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Dispatcher {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("running", &self.running_count())
            .field("queued", &self.queued_count())
            .finish()
    }
}
