//! Named units of work carried by events.

use std::fmt;

/// A boxed task closure.
type BoxedTask = Box<dyn FnOnce() + Send + 'static>;

/// An opaque, named piece of work.
///
/// The queue never looks inside a task; it only moves it around and hands it
/// back to the runner, which calls [`Task::run`] exactly once.
pub struct Task {
    name: String,
    func: BoxedTask,
}

impl Task {
    /// Create a task from a closure.
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }

    /// The display name of the task. May be empty.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Consume the task and run it.
    pub fn run(self) {
        (self.func)()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("name", &self.name).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_task_runs_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let task = Task::new("count", move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(task.name(), "count");
        task.run();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_debug_shows_name() {
        let task = Task::new("render", || {});
        assert!(format!("{task:?}").contains("render"));
    }
}
