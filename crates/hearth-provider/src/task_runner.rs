use std::time::Duration;
use tokio::runtime::Handle;

use crate::traits::TaskRunner;

/// Task runner backed by the host's tokio runtime.
pub struct TokioTaskRunner {
    handle: Handle,
}

impl TokioTaskRunner {
    /// Capture the current runtime. Must be called from within one.
    pub fn new() -> Self {
        TokioTaskRunner {
            handle: Handle::current(),
        }
    }

    pub fn with_handle(handle: Handle) -> Self {
        TokioTaskRunner { handle }
    }
}

impl Default for TokioTaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRunner for TokioTaskRunner {
    fn post_delayed(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) {
        self.handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            task();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::TaskRunnerExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn posts_run() {
        let runner = TokioTaskRunner::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        runner.post(move || {
            ran2.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_posts_respect_the_delay() {
        let runner = TokioTaskRunner::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        runner.post_after(Duration::from_secs(60), move || {
            ran2.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!ran.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(ran.load(Ordering::SeqCst));
    }
}
