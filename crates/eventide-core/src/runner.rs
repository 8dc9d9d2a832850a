//! Event runner: the consumer loop of an event queue.
//!
//! An [`EventRunner`] owns an [`EventQueue`] and repeatedly takes due events
//! from it, handing each to its owning handler. It either spawns a dedicated
//! named thread or is driven by the caller through [`EventRunner::run`].
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use eventide_core::{EventRunner, Handler, HandlerExt, Priority};
//!
//! let runner = EventRunner::new().unwrap();
//! let handler = Handler::new(runner.queue().clone());
//!
//! handler
//!     .post_task("greet", Duration::ZERO, Priority::Low, || println!("hello from the runner"))
//!     .unwrap();
//!
//! let answer = handler.post_sync_task("answer", Priority::High, || 42);
//! assert_eq!(answer, Some(42));
//!
//! runner.stop_and_join();
//! ```

use std::cell::RefCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::config::QueueConfig;
use crate::error::RunnerError;
use crate::event::Event;
use crate::handler::distribute_event;
use crate::logging::targets;
use crate::queue::EventQueue;

thread_local! {
    /// Queue driven by the current thread, if any.
    static CURRENT_QUEUE: RefCell<Option<Weak<EventQueue>>> = const { RefCell::new(None) };
}

/// Marks the current thread as the consumer of a queue until dropped.
struct CurrentQueueGuard {
    previous: Option<Weak<EventQueue>>,
}

impl CurrentQueueGuard {
    fn enter(queue: &Arc<EventQueue>) -> Self {
        let previous = CURRENT_QUEUE.with(|current| current.replace(Some(Arc::downgrade(queue))));
        Self { previous }
    }
}

impl Drop for CurrentQueueGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_QUEUE.with(|current| *current.borrow_mut() = previous);
    }
}

/// Configuration for creating an EventRunner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Name for the runner thread.
    pub name: String,
    /// Stack size for the runner thread in bytes. `None` uses the default.
    pub stack_size: Option<usize>,
    /// Configuration of the runner's queue.
    pub queue: QueueConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            name: "eventide-runner".to_string(),
            stack_size: None,
            queue: QueueConfig::default(),
        }
    }
}

impl RunnerConfig {
    /// Create a new configuration with the given thread name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Builder for creating EventRunners with custom configuration.
#[derive(Debug, Default)]
pub struct EventRunnerBuilder {
    config: RunnerConfig,
}

impl EventRunnerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the thread name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the stack size for the runner thread.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    /// Set the queue configuration.
    pub fn queue_config(mut self, config: QueueConfig) -> Self {
        self.config.queue = config;
        self
    }

    /// Build the runner and start its thread.
    pub fn build(self) -> Result<EventRunner, RunnerError> {
        EventRunner::with_config(self.config)
    }

    /// Build a runner to be driven by the caller's thread.
    pub fn build_current_thread(self) -> EventRunner {
        EventRunner::current_thread_with_config(self.config)
    }
}

/// Consumer loop for an [`EventQueue`].
///
/// # Thread Safety
///
/// `EventRunner` is `Send + Sync`; any thread may post to its queue or stop it.
pub struct EventRunner {
    name: String,
    queue: Arc<EventQueue>,
    /// Thread handle for joining, if the runner owns a thread.
    handle: Mutex<Option<JoinHandle<()>>>,
    owns_thread: bool,
    running: Arc<AtomicBool>,
}

impl EventRunner {
    /// Create a runner with its own thread and default configuration.
    pub fn new() -> Result<Self, RunnerError> {
        Self::with_config(RunnerConfig::default())
    }

    /// Create a runner with its own thread.
    ///
    /// The thread starts immediately and waits for events.
    pub fn with_config(config: RunnerConfig) -> Result<Self, RunnerError> {
        let queue = EventQueue::with_config(&config.queue);
        let running = Arc::new(AtomicBool::new(true));
        queue.prepare();

        let thread_queue = queue.clone();
        let thread_running = running.clone();
        let mut builder = thread::Builder::new().name(config.name.clone());
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }
        let handle = builder.spawn(move || {
            run_loop(&thread_queue);
            thread_running.store(false, Ordering::Release);
        })?;

        tracing::debug!(target: targets::RUNNER, name = %config.name, "runner thread started");
        Ok(Self {
            name: config.name,
            queue,
            handle: Mutex::new(Some(handle)),
            owns_thread: true,
            running,
        })
    }

    /// Create a runner driven by [`run`](Self::run) on the caller's thread.
    pub fn current_thread() -> Self {
        Self::current_thread_with_config(RunnerConfig::default())
    }

    pub fn current_thread_with_config(config: RunnerConfig) -> Self {
        Self {
            queue: EventQueue::with_config(&config.queue),
            name: config.name,
            handle: Mutex::new(None),
            owns_thread: false,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    /// Whether the loop is currently being driven.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Drive the loop on the calling thread until [`stop`](Self::stop).
    pub fn run(&self) -> Result<(), RunnerError> {
        if self.owns_thread {
            return Err(RunnerError::OwnsThread);
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(RunnerError::AlreadyRunning);
        }
        self.queue.prepare();
        run_loop(&self.queue);
        self.running.store(false, Ordering::Release);
        Ok(())
    }

    /// Ask the loop to return. Pending events stay queued.
    pub fn stop(&self) {
        self.queue.finish();
    }

    /// Wait for the runner thread to finish.
    ///
    /// Returns `true` if the thread was joined, `false` if there is no thread,
    /// it was already joined, or it panicked.
    pub fn join(&self) -> bool {
        let handle = self.handle.lock().take();
        match handle {
            Some(handle) => handle.join().is_ok(),
            None => false,
        }
    }

    /// Stop the runner and wait for its thread.
    pub fn stop_and_join(&self) -> bool {
        self.stop();
        self.join()
    }

    /// Whether the calling thread is currently driving `queue`.
    pub fn is_current(queue: &Arc<EventQueue>) -> bool {
        CURRENT_QUEUE.with(|current| {
            current
                .borrow()
                .as_ref()
                .is_some_and(|weak| ptr::eq(weak.as_ptr(), Arc::as_ptr(queue)))
        })
    }
}

impl Drop for EventRunner {
    fn drop(&mut self) {
        // Don't block in drop, the thread holds its own queue reference.
        self.stop();
    }
}

/// Take events until the queue is finished.
fn run_loop(queue: &Arc<EventQueue>) {
    let _current = CurrentQueueGuard::enter(queue);
    while let Some(event) = queue.get_event() {
        distribute(queue, event);
    }
    tracing::debug!(target: targets::RUNNER, "runner loop exited");
}

/// Hand one event to its owner, recording it in the history.
fn distribute(queue: &EventQueue, event: Event) {
    queue.push_history_before_distribute(&event);
    match event.owner() {
        Some(owner) => {
            let _span = tracing::trace_span!(
                target: "eventide_core::runner",
                "distribute",
                name = %event.name()
            )
            .entered();
            distribute_event(&owner, event);
        }
        None => {
            tracing::warn!(
                target: targets::RUNNER,
                name = %event.name(),
                "owner is gone, event discarded"
            );
        }
    }
    queue.push_history_after_distribute();
}
