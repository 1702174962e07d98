//! Bounded hand-off from submitting tasks to the single writer task.
//!
//! Any number of [`DispatchQueue`] clones may enqueue; exactly one
//! [`DispatchReceiver`] takes items off. A capacity of zero behaves as a
//! rendezvous: an item is only accepted while the receiver is parked waiting
//! for one.

use crate::error::ClientError;
use crate::token::{Completion, Token};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// An encoded packet on its way to the transport
#[derive(Debug)]
pub struct QueuedWrite {
    /// Encoded packet
    pub bytes: Bytes,
    /// Caller's token
    pub token: Token,
    /// Message identifier held by the operation, if any
    pub id: Option<u16>,
    /// Resolve the token with this once written (no acknowledgement follows)
    pub on_write: Option<Completion>,
    /// Latest instant at which the write may still be attempted
    pub deadline: Option<Instant>,
}

impl QueuedWrite {
    /// Create a write that completes on acknowledgement
    pub fn new(bytes: Bytes, token: Token, id: Option<u16>) -> Self {
        Self {
            bytes,
            token,
            id,
            on_write: None,
            deadline: None,
        }
    }

    /// Resolve the token with `completion` as soon as the bytes are written
    pub fn complete_on_write(mut self, completion: Completion) -> Self {
        self.on_write = Some(completion);
        self
    }

    /// Whether the deadline has passed
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() > deadline)
    }
}

#[derive(Debug)]
struct QueueState {
    items: VecDeque<QueuedWrite>,
    capacity: usize,
    receiver_waiting: bool,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<QueueState>,
    item_ready: Notify,
    space_ready: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Submitting side of the dispatch queue
#[derive(Debug, Clone)]
pub struct DispatchQueue {
    shared: Arc<Shared>,
}

/// Writer side of the dispatch queue
#[derive(Debug)]
pub struct DispatchReceiver {
    shared: Arc<Shared>,
}

/// Create a dispatch queue holding at most `capacity` items
pub fn channel(capacity: usize) -> (DispatchQueue, DispatchReceiver) {
    let shared = Arc::new(Shared {
        state: Mutex::new(QueueState {
            items: VecDeque::with_capacity(capacity),
            capacity,
            receiver_waiting: false,
            closed: false,
        }),
        item_ready: Notify::new(),
        space_ready: Notify::new(),
    });

    (
        DispatchQueue {
            shared: shared.clone(),
        },
        DispatchReceiver { shared },
    )
}

impl DispatchQueue {
    /// Enqueue `item`, waiting up to `timeout` for room.
    ///
    /// A zero `timeout` waits without bound. On failure the item is dropped;
    /// the caller still holds the token and identifier to clean up.
    pub async fn enqueue(&self, mut item: QueuedWrite, timeout: Duration) -> Result<(), ClientError> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        item.deadline = deadline;

        loop {
            let space = self.shared.space_ready.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                let mut state = self.shared.lock();
                if state.closed {
                    return Err(ClientError::ConnectionLost);
                }
                let room = state.capacity + state.receiver_waiting as usize;
                if state.items.len() < room {
                    state.items.push_back(item);
                    state.receiver_waiting = false;
                    drop(state);
                    self.shared.item_ready.notify_one();
                    return Ok(());
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, space).await.is_err() {
                        return Err(ClientError::DispatchTimeout(timeout));
                    }
                }
                None => space.await,
            }
        }
    }

    /// Remove every queued item
    pub fn drain(&self) -> Vec<QueuedWrite> {
        let drained: Vec<QueuedWrite> = {
            let mut state = self.shared.lock();
            state.receiver_waiting = false;
            state.items.drain(..).collect()
        };
        self.shared.space_ready.notify_waiters();
        drained
    }

    /// Refuse further items and return the ones still queued
    pub fn close(&self) -> Vec<QueuedWrite> {
        let drained: Vec<QueuedWrite> = {
            let mut state = self.shared.lock();
            state.closed = true;
            state.receiver_waiting = false;
            state.items.drain(..).collect()
        };
        self.shared.item_ready.notify_one();
        self.shared.space_ready.notify_waiters();
        drained
    }

    /// Accept items again after [`close`](Self::close)
    pub fn reopen(&self) {
        self.shared.lock().closed = false;
    }

    /// Whether the queue currently refuses items
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.shared.lock().items.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.shared.lock().capacity
    }
}

impl DispatchReceiver {
    /// Take the next item, waiting for one; `None` once the queue is closed
    pub async fn recv(&mut self) -> Option<QueuedWrite> {
        loop {
            let ready = self.shared.item_ready.notified();

            {
                let mut state = self.shared.lock();
                if let Some(item) = state.items.pop_front() {
                    state.receiver_waiting = false;
                    drop(state);
                    self.shared.space_ready.notify_waiters();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
                state.receiver_waiting = true;
            }

            self.shared.space_ready.notify_waiters();
            ready.await;
        }
    }
}

/// Fail every drained item with `cause`
pub fn fail_all(items: Vec<QueuedWrite>, cause: &ClientError) -> usize {
    let count = items.len();
    for item in items {
        item.token.fail(cause.clone());
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OperationKind;

    fn write(tag: u8) -> QueuedWrite {
        QueuedWrite::new(
            Bytes::from(vec![tag]),
            Token::new(OperationKind::Publish),
            None,
        )
    }

    #[tokio::test]
    async fn test_rendezvous_times_out_without_receiver() {
        let (queue, _receiver) = channel(0);
        let started = std::time::Instant::now();

        let result = queue.enqueue(write(1), Duration::from_millis(1)).await;
        assert_eq!(result, Err(ClientError::DispatchTimeout(Duration::from_millis(1))));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_rendezvous_with_parked_receiver() {
        let (queue, mut receiver) = channel(0);
        let reader = tokio::spawn(async move { receiver.recv().await.map(|item| item.bytes) });

        queue.enqueue(write(7), Duration::from_secs(5)).await.unwrap();
        assert_eq!(reader.await.unwrap(), Some(Bytes::from_static(&[7])));
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (queue, mut receiver) = channel(3);
        for tag in 0..3 {
            queue.enqueue(write(tag), Duration::ZERO).await.unwrap();
        }
        assert_eq!(queue.len(), 3);

        for tag in 0..3 {
            assert_eq!(receiver.recv().await.unwrap().bytes[0], tag);
        }
    }

    #[tokio::test]
    async fn test_full_queue_times_out_then_accepts_after_recv() {
        let (queue, mut receiver) = channel(1);
        queue.enqueue(write(1), Duration::ZERO).await.unwrap();
        assert!(matches!(
            queue.enqueue(write(2), Duration::from_millis(5)).await,
            Err(ClientError::DispatchTimeout(_))
        ));

        let blocked = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(write(3), Duration::ZERO).await })
        };
        assert_eq!(receiver.recv().await.unwrap().bytes[0], 1);
        blocked.await.unwrap().unwrap();
        assert_eq!(receiver.recv().await.unwrap().bytes[0], 3);
    }

    #[tokio::test]
    async fn test_drain_and_close() {
        let (queue, mut receiver) = channel(4);
        queue.enqueue(write(1), Duration::ZERO).await.unwrap();
        queue.enqueue(write(2), Duration::ZERO).await.unwrap();

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        let tokens: Vec<Token> = drained.iter().map(|item| item.token.clone()).collect();
        assert_eq!(fail_all(drained, &ClientError::ConnectionLost), 2);
        assert!(tokens.iter().all(|token| token.error().is_some()));

        assert!(queue.close().is_empty());
        assert_eq!(
            queue.enqueue(write(3), Duration::ZERO).await,
            Err(ClientError::ConnectionLost)
        );
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_enqueue_and_reopen_accepts() {
        let (queue, mut receiver) = channel(1);
        queue.enqueue(write(1), Duration::ZERO).await.unwrap();

        let blocked = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(write(2), Duration::ZERO).await })
        };
        tokio::task::yield_now().await;

        assert_eq!(fail_all(queue.close(), &ClientError::ConnectionLost), 1);
        assert_eq!(blocked.await.unwrap(), Err(ClientError::ConnectionLost));
        assert!(queue.is_closed());
        assert!(receiver.recv().await.is_none());

        queue.reopen();
        assert!(!queue.is_closed());
        queue.enqueue(write(3), Duration::ZERO).await.unwrap();
        assert_eq!(receiver.recv().await.unwrap().bytes[0], 3);
    }

    #[test]
    fn test_expiry() {
        let mut item = write(1);
        assert!(!item.is_expired());
        item.deadline = Some(Instant::now() - Duration::from_millis(1));
        assert!(item.is_expired());
    }
}
