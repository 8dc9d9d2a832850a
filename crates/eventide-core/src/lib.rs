//! Core of the Eventide event loop.
//!
//! This crate provides the pieces a single-threaded event loop is built from:
//!
//! - **Event Queue**: Five priority buckets with time ordering and starvation avoidance
//! - **I/O Waiter**: Condition variable or epoll based blocking between events
//! - **File Descriptor Listeners**: Readiness callbacks posted as ordinary tasks
//! - **History**: Ring of the most recent distributions for diagnostics
//! - **Observers**: Callbacks around the consumer's waits and VIP transitions
//! - **Runner**: The consumer loop, on its own thread or the caller's
//!
//! # Queue Example
//!
//! ```
//! use std::time::Duration;
//! use eventide_core::{Event, EventQueue, Expired, InsertType, Priority};
//!
//! let queue = EventQueue::new();
//! queue.prepare();
//!
//! queue
//!     .insert(Event::new(7u32).delayed(Duration::from_secs(60)), Priority::High, InsertType::AtEnd)
//!     .unwrap();
//! queue.insert(Event::new("ping"), Priority::Idle, InsertType::AtEnd).unwrap();
//!
//! // The delayed event is not due yet, so the idle event is handed out.
//! match queue.get_expired_event() {
//!     Expired::Ready(event) => assert_eq!(event.name(), "ping"),
//!     Expired::Pending(_) => unreachable!(),
//! }
//! assert!(matches!(queue.get_expired_event(), Expired::Pending(Some(_))));
//! ```
//!
//! # Runner Example
//!
//! ```no_run
//! use std::time::Duration;
//! use eventide_core::{EventRunnerBuilder, Handler, HandlerExt, Priority};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runner = EventRunnerBuilder::new().name("main-loop").build()?;
//!     let handler = Handler::new(runner.queue().clone());
//!
//!     handler.post_task("tick", Duration::from_millis(100), Priority::Low, || {
//!         println!("tick");
//!     })?;
//!
//!     let sum = handler.post_sync_task("sum", Priority::High, || 1 + 2);
//!     assert_eq!(sum, Some(3));
//!
//!     runner.stop_and_join();
//!     Ok(())
//! }
//! ```

mod config;
mod error;
mod event;
mod handler;
mod history;
pub mod io_waiter;
mod listener;
pub mod logging;
mod observer;
mod queue;
mod runner;
mod task;

pub use config::{DEFAULT_MAX_HANDLED_EVENTS, DEFAULT_VSYNC_DELAY, QueueConfig};
pub use error::{QueueError, Result, RunnerError};
pub use event::{Event, EventId, InsertType, Priority};
pub use handler::{EventHandler, Handler, HandlerExt};
pub use history::{Dumper, HISTORY_CAPACITY, HistoryEvent, RunningEvent, StringDumper, format_instant};
#[cfg(target_os = "linux")]
pub use io_waiter::EpollIoWaiter;
pub use io_waiter::{FdEventCallback, IoWaiter, NoneIoWaiter};
pub use listener::{CallbackListener, FdEvents, FileDescriptorListener};
pub use observer::{RunnerStage, StageCallback, StageInfo, StageMask};
pub use queue::{EventQueue, Expired};
pub use runner::{EventRunner, EventRunnerBuilder, RunnerConfig};
pub use task::Task;
