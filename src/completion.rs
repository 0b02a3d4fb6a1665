//! Single completion path behind the callback and deferred conventions.
//!
//! Every public operation is written once against [`Completion`]. The call
//! boundary picks the adapter: a supplied callback becomes
//! `Completion::Callback`, otherwise a `Completion::Deferred` is created and
//! its [`Deferred`] receiving end is handed back to the caller. A completion
//! is consumed by value, so a result can be delivered at most once.
//!
//! # Example
//!
//! ```ignore
//! // deferred
//! let result = client.invoke("STFC_CONNECTION", params, CallOptions::default()).await?;
//!
//! // callback
//! client.invoke_with("STFC_CONNECTION", params, CallOptions::default(), |result| {
//!     println!("{:?}", result);
//! });
//! ```

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{Result, RfcError};

/// Boxed completion callback.
pub type Callback<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// Where the outcome of one operation goes.
pub enum Completion<T> {
    /// Invoke the caller's function.
    Callback(Callback<T>),
    /// Settle the caller's [`Deferred`].
    Deferred(oneshot::Sender<Result<T>>),
}

impl<T: Send + 'static> Completion<T> {
    /// Wrap a callback.
    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        Completion::Callback(Box::new(f))
    }

    /// Create a deferred completion and the value the caller awaits.
    pub fn deferred() -> (Self, Deferred<T>) {
        let (tx, rx) = oneshot::channel();
        (Completion::Deferred(tx), Deferred { rx })
    }

    /// Deliver the outcome.
    pub fn complete(self, result: Result<T>) {
        if self.try_complete(result).is_some() {
            tracing::debug!("Deferred result dropped by caller");
        }
    }

    /// Deliver the outcome, or hand it back when the [`Deferred`] was dropped.
    ///
    /// A callback always receives the outcome.
    pub fn try_complete(self, result: Result<T>) -> Option<Result<T>> {
        match self {
            Completion::Callback(f) => {
                f(result);
                None
            }
            Completion::Deferred(tx) => tx.send(result).err(),
        }
    }

    /// Drive `fut` on the runtime and deliver its output here.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(self, fut: F)
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        tokio::spawn(async move {
            let result = fut.await;
            self.complete(result);
        });
    }
}

/// A value that resolves or rejects exactly once.
///
/// Awaiting it yields the operation's result.
#[must_use = "a Deferred does nothing unless awaited"]
pub struct Deferred<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T: Send + 'static> Deferred<T> {
    /// A deferred that is already settled.
    pub fn ready(result: Result<T>) -> Self {
        let (completion, deferred) = Completion::deferred();
        completion.complete(result);
        deferred
    }
}

impl<T> Future for Deferred<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(RfcError::CompletionDropped)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_deferred_resolves() {
        let (completion, deferred) = Completion::deferred();
        completion.spawn(async { Ok(42) });
        assert_eq!(deferred.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_boxed_callback() {
        let (tx, rx) = oneshot::channel();
        let cb: Callback<i32> = Box::new(move |r| {
            let _ = tx.send(r);
        });
        Completion::Callback(cb).spawn(async { Ok(7) });

        assert_eq!(rx.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_callback_fires_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let (tx, rx) = oneshot::channel::<()>();

        Completion::callback(move |_: Result<()>| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        })
        .spawn(async { Err(RfcError::NotConnected("1".into())) });

        rx.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ready_deferred() {
        let deferred: Deferred<()> = Deferred::ready(Err(RfcError::InvalidArgument("x".into())));
        assert!(matches!(deferred.await, Err(RfcError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_dropped_completion() {
        let (completion, deferred) = Completion::<()>::deferred();
        drop(completion);
        assert!(matches!(deferred.await, Err(RfcError::CompletionDropped)));
    }

    #[test]
    fn test_undelivered_result_is_handed_back() {
        let (completion, deferred) = Completion::<i32>::deferred();
        drop(deferred);
        assert!(matches!(completion.try_complete(Ok(3)), Some(Ok(3))));

        let (completion, _deferred) = Completion::<i32>::deferred();
        assert!(completion.try_complete(Ok(4)).is_none());

        let callback = Completion::callback(|_: Result<i32>| {});
        assert!(callback.try_complete(Ok(5)).is_none());
    }
}
