use std::future::Future;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// A group of spawned tasks that tear down together.
///
/// Heartbeat loops, dispatch loops, and grace timers all land here so that
/// leaving the session or shutting down cancels them as a unit.
#[derive(Default)]
pub struct TaskGroup {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskGroup {
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut handles = self.handles.lock();

        handles.retain(|h| !h.is_finished());
        handles.push(tokio::spawn(future));
    }

    /// Aborts every task in the group. In-flight work is abandoned, not awaited.
    pub fn abort_all(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}
