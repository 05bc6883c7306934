use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    /// The signaling side was dropped without ever completing.
    #[error("completion signal dropped without a value")]
    Abandoned,
}

/// Create a linked single-assignment completion pair.
///
/// Exactly one writer (the session driver's terminal transition) and one
/// waiter (the process's top-level wait loop). Completing consumes the
/// signal, so a second assignment is unrepresentable.
pub fn completion<T>() -> (CompletionSignal<T>, CompletionWait<T>) {
    let (tx, rx) = oneshot::channel();
    (CompletionSignal { tx }, CompletionWait { rx })
}

/// Writer half of the completion pair.
pub struct CompletionSignal<T> {
    tx: oneshot::Sender<T>,
}

impl<T> CompletionSignal<T> {
    /// Release the waiter with `value`. A waiter that already went away is
    /// fine; the session is over either way.
    pub fn complete(self, value: T) {
        let _ = self.tx.send(value);
    }
}

/// Waiter half of the completion pair.
pub struct CompletionWait<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> CompletionWait<T> {
    /// Suspend until the signal is completed.
    pub async fn wait(self) -> Result<T, SignalError> {
        self.rx.await.map_err(|_| SignalError::Abandoned)
    }
}
