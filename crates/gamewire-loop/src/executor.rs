use crate::error::Result;

/// A plain task: no loop context.
pub type Runnable = Box<dyn FnOnce() + Send + 'static>;

/// Anything that can run plain tasks, typically an event loop.
pub trait Executor: Send + Sync {
    /// Submit a task. Rejections are reported, never dropped silently.
    fn execute(&self, task: Runnable) -> Result<()>;

    /// Whether the calling thread is this executor's worker thread.
    fn in_event_loop(&self) -> bool;
}

/// Runs every task inline on the submitting thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateExecutor;

impl Executor for ImmediateExecutor {
    fn execute(&self, task: Runnable) -> Result<()> {
        task();
        Ok(())
    }

    fn in_event_loop(&self) -> bool {
        true
    }
}
