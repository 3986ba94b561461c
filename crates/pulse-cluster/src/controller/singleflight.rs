/// Singleflight: at most one in-flight execution per key.
///
/// The first caller for a key becomes the leader and runs the operation
/// under a child of the parent cancellation token; callers arriving while
/// the marker exists join and wait for the leader to finish. The marker
/// stays until [`Singleflight::reset`] removes it.
use std::collections::HashMap;
use std::future::Future;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

struct Call {
    /// Cancels the leader's operation.
    cancel: CancellationToken,
    /// Cancelled when the leader's future finishes or is dropped.
    done: CancellationToken,
}

/// Outcome of [`Singleflight::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flight<T> {
    /// This caller ran the operation.
    Executed(T),
    /// Another caller held the key; this one waited for it.
    Joined,
}

#[derive(Default)]
pub struct Singleflight {
    calls: Mutex<HashMap<String, Call>>,
}

impl Singleflight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` as leader for `key`, or join the call already registered.
    pub async fn run<F, Fut, T>(&self, key: &str, parent: &CancellationToken, f: F) -> Flight<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T>,
    {
        let registered = {
            let mut calls = self.calls.lock();
            match calls.get(key) {
                Some(call) => Err(call.done.clone()),
                None => {
                    let call = Call {
                        cancel: parent.child_token(),
                        done: CancellationToken::new(),
                    };
                    let tokens = (call.cancel.clone(), call.done.clone());
                    calls.insert(key.to_string(), call);
                    Ok(tokens)
                }
            }
        };

        match registered {
            Ok((cancel, done)) => {
                let _done = done.drop_guard();
                Flight::Executed(f(cancel).await)
            }
            Err(done) => {
                done.cancelled().await;
                Flight::Joined
            }
        }
    }

    /// Remove the marker for `key` so the next caller runs again.
    pub fn reset(&self, key: &str) {
        self.calls.lock().remove(key);
    }

    /// Cancel the operation registered under `key`. Returns false if none
    /// is running.
    pub fn cancel(&self, key: &str) -> bool {
        match self.calls.lock().get(key) {
            Some(call) if !call.done.is_cancelled() => {
                call.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Whether an operation for `key` is currently running.
    pub fn in_flight(&self, key: &str) -> bool {
        self.calls
            .lock()
            .get(key)
            .is_some_and(|call| !call.done.is_cancelled())
    }
}

impl std::fmt::Debug for Singleflight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let calls = self.calls.lock();
        f.debug_struct("Singleflight")
            .field("keys", &calls.keys().collect::<Vec<_>>())
            .finish()
    }
}
