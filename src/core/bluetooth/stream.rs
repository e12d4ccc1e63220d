//! Cancellable outcome streams
//! `connect` and `send` hand their results back on an [`OutcomeStream`].
//! Dropping the stream cancels the operation that feeds it.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Stream of outcomes produced by a background operation
pub struct OutcomeStream<T> {
    rx: mpsc::Receiver<T>,
    guard: Option<DropGuard>,
}

impl<T> OutcomeStream<T> {
    /// Wraps a receiver; dropping the stream cancels `token`
    pub fn new(rx: mpsc::Receiver<T>, token: CancellationToken) -> Self {
        Self {
            rx,
            guard: Some(token.drop_guard()),
        }
    }

    /// A stream that ends without yielding anything
    pub fn closed() -> Self {
        let (_, rx) = mpsc::channel(1);
        Self { rx, guard: None }
    }

    /// A stream that yields a single outcome and ends
    pub fn ready(item: T) -> Self {
        let (tx, rx) = mpsc::channel(1);
        // capacity 1 and a fresh channel, cannot fail
        let _ = tx.try_send(item);
        Self { rx, guard: None }
    }

    /// Receives the next outcome, `None` once the operation is over
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Keeps the operation running after the stream is dropped
    pub fn detach(&mut self) {
        if let Some(guard) = self.guard.take() {
            guard.disarm();
        }
    }
}

impl<T> Stream for OutcomeStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}
