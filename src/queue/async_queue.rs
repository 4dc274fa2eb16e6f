use std::{
    fmt::Debug,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures::task::AtomicWaker;

use crate::error::ConfigError;

use super::ConcurrentQueue;

/// A [`ConcurrentQueue`] whose Consumer can wait for Values asynchronously
///
/// Any Number of Threads may push into the Queue, but only one Task should be
/// waiting on [`pop`](AsyncQueue::pop) at a Time, as only the most recently
/// registered Waker is woken up.
pub struct AsyncQueue<T> {
    queue: ConcurrentQueue<T>,
    waker: AtomicWaker,
}

impl<T> AsyncQueue<T> {
    /// Creates a new empty Queue with room for `capacity` Values
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        Ok(Self {
            queue: ConcurrentQueue::new(capacity)?,
            waker: AtomicWaker::new(),
        })
    }

    /// Appends the Value and wakes up the waiting Consumer, if any
    pub fn push(&self, value: T) -> Result<(), T> {
        self.queue.push(value)?;
        self.waker.wake();

        Ok(())
    }

    /// Attempts to remove the Value at the Front, without waiting
    pub fn try_pop(&self) -> Option<T> {
        self.queue.try_pop()
    }

    /// Returns a Future that resolves to the next Value in the Queue
    pub fn pop(&self) -> PopFuture<'_, T> {
        PopFuture { queue: self }
    }

    /// Checks if the Queue is currently empty
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<T> Debug for AsyncQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Async{:?}", self.queue)
    }
}

/// The Future returned by [`AsyncQueue::pop`]
pub struct PopFuture<'q, T> {
    queue: &'q AsyncQueue<T>,
}

impl<'q, T> Future for PopFuture<'q, T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(value) = self.queue.try_pop() {
            return Poll::Ready(value);
        }

        self.queue.waker.register(cx.waker());

        // A Value may have been pushed before the Waker was registered
        match self.queue.try_pop() {
            Some(value) => Poll::Ready(value),
            None => Poll::Pending,
        }
    }
}

impl<'q, T> Debug for PopFuture<'q, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PopFuture<{}> ()", std::any::type_name::<T>())
    }
}
