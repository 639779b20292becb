//! Graceful shutdown coordination.
//!
//! Components register a teardown action with the [`ShutdownCoordinator`]
//! while the process starts up. On termination every action is launched
//! concurrently under one deadline. A failing action never prevents the
//! others from running, and the total time spent is bounded by the deadline
//! no matter how slow individual actions are.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use message_relay::shutdown::ShutdownCoordinator;
//!
//! # async fn example() -> message_relay::Result<()> {
//! let coordinator = ShutdownCoordinator::new();
//! coordinator.register("cache", |_deadline| async move {
//!     println!("cache flushed");
//!     Ok(())
//! });
//!
//! coordinator.shutdown(Duration::from_secs(5), 0).await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Error, Result};

type TeardownFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type TeardownFn = Box<dyn FnOnce(CancellationToken) -> TeardownFuture + Send>;

struct ShutdownTask {
    name: String,
    action: TeardownFn,
}

/// Registry of teardown actions, run once on shutdown.
///
/// The coordinator is passed explicitly to every component that needs to
/// release something; there is no global instance.
#[derive(Default)]
pub struct ShutdownCoordinator {
    tasks: Mutex<Vec<ShutdownTask>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a teardown action. The action receives a token that is
    /// cancelled when the shutdown deadline expires.
    pub fn register<F, Fut>(&self, name: impl Into<String>, action: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let task = ShutdownTask {
            name: name.into(),
            action: Box::new(move |deadline| Box::pin(action(deadline))),
        };
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every registered action concurrently, at most `limit` at a time
    /// (`0` means no limit), and waits for them up to `timeout`.
    ///
    /// Registered actions are consumed: a second call only runs actions
    /// registered after the first one.
    ///
    /// # Errors
    ///
    /// - [`Error::ShutdownTimeout`] if the deadline fires before every action
    ///   returned. Actions still running are abandoned, not aborted.
    /// - [`Error::Shutdown`] carrying every action error otherwise.
    pub async fn shutdown(&self, timeout: Duration, limit: usize) -> Result<()> {
        let tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );

        info!(
            actions = tasks.len(),
            timeout_ms = timeout.as_millis() as u64,
            "shutting down app gracefully"
        );

        let deadline = CancellationToken::new();
        let permits = (limit > 0).then(|| Arc::new(Semaphore::new(limit)));

        let mut running = JoinSet::new();

        for ShutdownTask { name, action } in tasks {
            let token = deadline.clone();
            let permits = permits.clone();

            running.spawn(async move {
                let _permit = match permits {
                    Some(semaphore) => semaphore.acquire_owned().await.ok(),
                    None => None,
                };
                debug!(action = %name, "running teardown action");
                let result = AssertUnwindSafe(action(token))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(Error::TeardownPanicked { name: name.clone() }));
                (name, result)
            });
        }

        let collect = async {
            let mut errors = Vec::new();
            while let Some(joined) = running.join_next().await {
                if let Some(e) = action_error(joined) {
                    errors.push(e);
                }
            }
            errors
        };

        let outcome = tokio::time::timeout(timeout, collect).await;

        match outcome {
            Ok(errors) if errors.is_empty() => Ok(()),
            Ok(errors) => Err(Error::Shutdown { errors }),
            Err(_elapsed) => {
                deadline.cancel();
                running.detach_all();
                Err(Error::ShutdownTimeout { timeout })
            }
        }
    }
}

/// Error reported by one finished teardown task, if any.
fn action_error(joined: std::result::Result<(String, Result<()>), JoinError>) -> Option<Error> {
    match joined {
        Ok((name, Ok(()))) => {
            debug!(action = %name, "teardown action finished");
            None
        }
        Ok((name, Err(e))) => {
            warn!(action = %name, error = %e, "teardown action failed");
            Some(e)
        }
        Err(join_error) => {
            warn!(error = %join_error, "teardown task did not complete");
            Some(Error::Join(join_error))
        }
    }
}
