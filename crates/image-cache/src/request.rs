//! Caller-side handles for in-flight requests
//!
//! A handle owns its cancellation token and the receiving end of a oneshot
//! channel. The background job only keeps a [`Waiter`]: the sending end plus
//! a clone of the token, which it checks before delivering, so a cancelled
//! request never sees a result and a result is delivered at most once.

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{CacheError, Result};
use crate::types::{LoadedImage, VariantReady};

type CancelHook = Box<dyn Fn() + Send + Sync>;

/// Background side of a request
pub(crate) struct Waiter<T> {
    token: CancellationToken,
    tx: oneshot::Sender<Result<T>>,
}

impl<T> Waiter<T> {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Send the outcome unless the caller has cancelled; true if delivered
    pub(crate) fn deliver(self, outcome: Result<T>) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.tx.send(outcome).is_ok()
    }
}

/// Handle to an outstanding request
///
/// Dropping an unfinished handle cancels it.
pub struct RequestHandle<T> {
    key: String,
    token: CancellationToken,
    rx: Option<oneshot::Receiver<Result<T>>>,
    on_cancel: Option<CancelHook>,
    finished: bool,
}

/// Handle for an original image request
pub type ImageRequest = RequestHandle<LoadedImage>;

/// Handle for a scheduled rounded variant
pub type VariantRequest = RequestHandle<VariantReady>;

impl<T> RequestHandle<T> {
    pub(crate) fn new(key: String) -> (Waiter<T>, Self) {
        let token = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter {
            token: token.clone(),
            tx,
        };
        let handle = Self {
            key,
            token,
            rx: Some(rx),
            on_cancel: None,
            finished: false,
        };
        (waiter, handle)
    }

    pub(crate) fn with_cancel_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_cancel = Some(Box::new(hook));
        self
    }

    /// Cache key the request resolves
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Withdraw interest; no result will be delivered afterwards
    pub fn cancel(&self) {
        if self.token.is_cancelled() {
            return;
        }
        self.token.cancel();
        if let Some(hook) = &self.on_cancel {
            hook();
        }
    }

    /// Take the outcome if it has already been delivered
    pub fn try_outcome(&mut self) -> Option<Result<T>> {
        let rx = self.rx.as_mut()?;
        match rx.try_recv() {
            Ok(outcome) => {
                self.rx = None;
                self.finished = true;
                Some(outcome)
            }
            Err(_) => None,
        }
    }

    /// Wait for the single terminal outcome
    pub async fn wait(mut self) -> Result<T> {
        let Some(rx) = self.rx.take() else {
            return Err(CacheError::Cancelled);
        };

        let outcome = tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(CacheError::Cancelled),
            received = rx => received.unwrap_or(Err(CacheError::Cancelled)),
        };
        self.finished = true;
        outcome
    }
}

impl<T> Drop for RequestHandle<T> {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel();
        }
    }
}

impl<T> std::fmt::Debug for RequestHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("key", &self.key)
            .field("cancelled", &self.token.is_cancelled())
            .field("finished", &self.finished)
            .finish()
    }
}
