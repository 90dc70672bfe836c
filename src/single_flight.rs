use std::future::Future;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;

/// Collapses concurrent callers of one async operation into a single
/// in-flight future. While a call is pending, later callers await the same
/// shared future instead of starting a second one; the slot is cleared once
/// the call completes so the next caller starts fresh.
pub struct SingleFlight<T: Clone> {
    slot: Mutex<Option<Shared<BoxFuture<'static, T>>>>,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Run `make()` unless a previous call is still in flight, in which case
    /// await that call's result instead.
    pub async fn run<F>(&self, make: impl FnOnce() -> F) -> T
    where
        F: Future<Output = T> + Send + 'static,
    {
        let fut = {
            let mut slot = self.slot.lock().await;
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let fut = make().boxed().shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };

        let out = fut.await;

        // Clear the slot only once the shared future has completed, so a
        // caller racing ahead of the cleanup never evicts a live attempt.
        let mut slot = self.slot.lock().await;
        if slot.as_ref().map(|f| f.peek().is_some()).unwrap_or(false) {
            *slot = None;
        }

        out
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
