// Copyright 2026 The Capsule Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

use std::collections::HashMap;
use std::env;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::FutureExt;
use itertools::Itertools;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::{Id, JoinError, JoinHandle, JoinSet};

///
/// Executors come in two flavors:
/// * "borrowed"
///     * Created with `Self::new()`, or `self.to_borrowed()`.
///     * A borrowed Executor will not be shut down when all handles are dropped, and shutdown
///       methods will have no impact.
///     * Used in unit tests, and anywhere else a Runtime is owned by a caller higher up the
///       stack (e.g. the `#[tokio::main]`-managed Runtime of the `cli` binary).
/// * "owned"
///     * Created with `Self::new_owned()`.
///     * When all handles of an owned Executor are dropped, its Runtime will be shut down.
///       Additionally, the explicit shutdown methods can be used to shut down the Executor for
///       all clones.
///
#[derive(Debug, Clone)]
pub struct Executor {
    runtime: Arc<Mutex<Option<Runtime>>>,
    handle: Handle,
}

impl Executor {
    ///
    /// Creates an Executor for an existing tokio::Runtime (generally provided by tokio's macros).
    ///
    /// The returned Executor will have a lifecycle independent of the Runtime, meaning that
    /// dropping all clones of the Executor will not cause the Runtime to be shut down. Likewise,
    /// the owner of the Runtime must ensure that it is kept alive longer than all Executor
    /// instances, because existence of a Handle does not prevent a Runtime from shutting down.
    /// This is guaranteed by the scope of the tokio::{test, main} macros.
    ///
    pub fn new() -> Executor {
        Self {
            runtime: Arc::new(Mutex::new(None)),
            handle: Handle::current(),
        }
    }

    ///
    /// Creates an Executor which owns its own tokio::Runtime, initialized with the given thread
    /// configuration.
    ///
    pub fn new_owned<F>(
        num_worker_threads: usize,
        max_threads: usize,
        on_thread_start: F,
    ) -> Result<Executor, String>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut runtime_builder = Builder::new_multi_thread();

        runtime_builder
            .worker_threads(num_worker_threads)
            .max_blocking_threads(max_threads - num_worker_threads)
            .enable_all();

        if env::var("CAPSULE_DEBUG").is_ok() {
            runtime_builder.on_thread_start(on_thread_start);
        };

        let runtime = runtime_builder
            .build()
            .map_err(|e| format!("Failed to start the runtime: {e}"))?;

        let handle = runtime.handle().clone();
        Ok(Executor {
            runtime: Arc::new(Mutex::new(Some(runtime))),
            handle,
        })
    }

    ///
    /// Creates a clone of this Executor which is disconnected from shutdown events. See the
    /// `Executor` rustdoc.
    ///
    pub fn to_borrowed(&self) -> Executor {
        Self {
            runtime: Arc::new(Mutex::new(None)),
            handle: self.handle.clone(),
        }
    }

    ///
    /// Enter the runtime context associated with this Executor. This should be used in
    /// situations where threads not started by the runtime need access to it via task-local
    /// variables.
    ///
    pub fn enter<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _context = self.handle.enter();
        f()
    }

    ///
    /// Run a Future on a tokio Runtime as a new Task, and return a Future handle to it.
    ///
    /// If the background Task exits abnormally, the given closure will be called to recover:
    /// usually it should convert the resulting Error to a relevant error type.
    ///
    /// If the returned Future is dropped, the computation will still continue to completion: see
    /// <https://docs.rs/tokio/latest/tokio/task/struct.JoinHandle.html>
    ///
    pub fn spawn<O: Send + 'static, F: Future<Output = O> + Send + 'static>(
        &self,
        future: F,
        rescue_join_error: impl FnOnce(JoinError) -> O,
    ) -> impl Future<Output = O> {
        self.native_spawn(future).map(|res| match res {
            Ok(o) => o,
            Err(e) => rescue_join_error(e),
        })
    }

    ///
    /// Run a Future on a tokio Runtime as a new Task, and return a JoinHandle.
    ///
    pub fn native_spawn<O: Send + 'static, F: Future<Output = O> + Send + 'static>(
        &self,
        future: F,
    ) -> JoinHandle<O> {
        self.handle.spawn(future)
    }

    ///
    /// Run a Future and return its resolved Result.
    ///
    /// This should never be called from in a Future context, and should only ever be called in
    /// something that resembles a main method.
    ///
    /// Even after this method returns, work `spawn`ed into the background may continue to run on
    /// the threads owned by this Executor.
    ///
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    ///
    /// Spawn a blocking closure on threads specifically reserved for work that is allowed to be
    /// long-running, and return a Future handle to it.
    ///
    /// If the background Task exits abnormally, the given closure will be called to recover:
    /// usually it should convert the resulting Error to a relevant error type.
    ///
    pub fn spawn_blocking<F: FnOnce() -> R + Send + 'static, R: Send + 'static>(
        &self,
        f: F,
        rescue_join_error: impl FnOnce(JoinError) -> R,
    ) -> impl Future<Output = R> {
        self.native_spawn_blocking(f).map(|res| match res {
            Ok(o) => o,
            Err(e) => rescue_join_error(e),
        })
    }

    ///
    /// Spawn a blocking closure on threads specifically reserved for work that is allowed to be
    /// long-running, and return a JoinHandle.
    ///
    pub fn native_spawn_blocking<F: FnOnce() -> R + Send + 'static, R: Send + 'static>(
        &self,
        f: F,
    ) -> JoinHandle<R> {
        self.handle.spawn_blocking(f)
    }

    /// Return a reference to this executor's runtime handle.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    ///
    /// A blocking call to shut down the Runtime associated with this "owned" Executor. If tasks
    /// do not shut down within the given timeout, they are leaked.
    ///
    /// This method has no effect for "borrowed" Executors: see the `Executor` rustdoc.
    ///
    pub fn shutdown(&self, timeout: Duration) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };

        let start = Instant::now();
        runtime.shutdown_timeout(timeout + Duration::from_millis(250));
        if start.elapsed() > timeout {
            log::warn!("Executor shutdown took unexpectedly long: tasks were likely leaked!");
        }
    }

    /// Returns true if `shutdown` has been called for this Executor. Always returns true for
    /// borrowed Executors.
    pub fn is_shutdown(&self) -> bool {
        self.runtime.lock().is_none()
    }
}

/// Tracks "tail" tasks: async tasks that run concurrently with a bridge session or remote
/// facade call, and which the caller wants to give a bounded grace period to finish (for
/// example, log readers draining their final lines) without blocking the session's own
/// teardown indefinitely.
#[derive(Clone)]
pub struct TailTasks {
    inner: Arc<Mutex<Option<TailTasksInner>>>,
}

struct TailTasksInner {
    id_to_name: HashMap<Id, String>,
    task_set: JoinSet<()>,
}

impl TailTasks {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(TailTasksInner {
                id_to_name: HashMap::new(),
                task_set: JoinSet::new(),
            }))),
        }
    }

    /// Spawn a tail task with the given name.
    pub fn spawn_on<F>(&self, name: &str, handle: &Handle, task: F)
    where
        F: Future<Output = ()>,
        F: Send + 'static,
    {
        let mut guard = self.inner.lock();
        let inner = match &mut *guard {
            Some(inner) => inner,
            None => {
                log::warn!("Tail task `{name}` submitted after its group completed.");
                return;
            }
        };

        let h = inner.task_set.spawn_on(task, handle);
        inner.id_to_name.insert(h.id(), name.to_string());
    }

    /// Wait for all tail tasks to complete subject to the given timeout. If tasks fail or do not
    /// complete, log that fact.
    pub async fn wait(self, timeout: Duration) {
        let mut inner = match self.inner.lock().take() {
            Some(inner) => inner,
            None => {
                log::debug!("Tail tasks awaited multiple times!");
                return;
            }
        };

        if inner.task_set.is_empty() {
            return;
        }

        log::debug!("waiting for {} tail task(s) to complete", inner.task_set.len());

        let mut timeout = tokio::time::sleep(timeout).boxed();

        loop {
            tokio::select! {
              // Use biased mode to prefer an expired timeout over joining on remaining tasks.
              biased;

              _ = &mut timeout => break,

              next_result = inner.task_set.join_next_with_id() => {
                match next_result {
                  Some(Ok((id, _))) => {
                    if let Some(name) = inner.id_to_name.get(&id) {
                      log::trace!("Tail task `{name}` completed successfully");
                    } else {
                      log::debug!("Tail task completed successfully but name not found.");
                    }
                    inner.id_to_name.remove(&id);
                  },
                  Some(Err(err)) => {
                    let name = inner.id_to_name.get(&err.id());
                    log::error!("Tail task `{name:?}` failed: {err:?}");
                  }
                  None => break,
                }
              }
            }
        }

        if inner.task_set.is_empty() {
            log::debug!("all tail tasks completed successfully");
        } else {
            log::debug!(
                "{} tail task(s) failed to complete within timeout: {}",
                inner.task_set.len(),
                inner.id_to_name.values().join(", "),
            );
            inner.task_set.abort_all();
        }
    }
}
