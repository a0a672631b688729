//! Deferred-task queue.
//!
//! The server must never free a channel from inside that channel's own
//! close notification, so removal is pushed onto a [`TaskQueue`] and runs
//! on a later turn of the loop.

use core::future::Future;

use edge_executor::LocalExecutor;

pub trait TaskQueue {
    /// Run `task` after the current call stack has unwound.
    fn defer(&self, task: Box<dyn FnOnce()>);
}

/// Single-threaded loop backed by `edge_executor::LocalExecutor`.
///
/// The run queue is unbounded, so any number of removals may be pending.
pub struct EventLoop {
    executor: LocalExecutor<'static>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            executor: LocalExecutor::new(),
        }
    }

    /// Spawn a long-lived future (accept/read loops).
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.executor.spawn(fut).detach();
    }

    /// Run every task that is ready right now. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while self.executor.try_tick() {
            ran += 1;
        }
        ran
    }

    /// Drive the executor until `fut` completes.
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        futures_lite::future::block_on(self.executor.run(fut))
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue for EventLoop {
    fn defer(&self, task: Box<dyn FnOnce()>) {
        self.spawn(async move { task() });
    }
}
