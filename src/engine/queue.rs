//! Single-consumer async queue.
//!
//! Producers push from any task; exactly one consumer pulls with
//! [`PendingQueue::next`]. Once ended (or failed), further pushes are
//! dropped, buffered items still drain, and then the consumer sees the end
//! (or the stored failure) forever.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::stream::{self, Stream};
use parking_lot::Mutex;
use tokio::sync::Notify;

struct QueueState<T, E> {
    items: VecDeque<T>,
    ended: bool,
    failure: Option<E>,
}

pub struct PendingQueue<T, E> {
    state: Mutex<QueueState<T, E>>,
    wake: Notify,
}

impl<T, E: Clone> PendingQueue<T, E> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                ended: false,
                failure: None,
            }),
            wake: Notify::new(),
        }
    }

    /// Push an item. Returns `false` (and drops the item) once the queue has ended.
    pub fn enqueue(&self, item: T) -> bool {
        {
            let mut state = self.state.lock();
            if state.ended {
                return false;
            }
            state.items.push_back(item);
        }
        // notify_one stores a permit when nobody waits yet, so a consumer
        // between its empty check and its await still wakes.
        self.wake.notify_one();
        true
    }

    pub fn end(&self) {
        {
            let mut state = self.state.lock();
            if state.ended {
                return;
            }
            state.ended = true;
        }
        self.wake.notify_one();
    }

    pub fn fail(&self, error: E) {
        {
            let mut state = self.state.lock();
            if state.ended {
                return;
            }
            state.ended = true;
            state.failure = Some(error);
        }
        self.wake.notify_one();
    }

    pub fn is_ended(&self) -> bool {
        self.state.lock().ended
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next item, `Ok(None)` once ended, or the stored failure.
    pub async fn next(&self) -> Result<Option<T>, E> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    return Ok(Some(item));
                }
                if state.ended {
                    return match &state.failure {
                        Some(error) => Err(error.clone()),
                        None => Ok(None),
                    };
                }
            }
            self.wake.notified().await;
        }
    }

    /// Consume the queue as a stream. The stream stops after yielding a failure.
    pub fn into_stream(self: Arc<Self>) -> impl Stream<Item = Result<T, E>> + Send + 'static
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        stream::unfold(Some(self), |queue| async move {
            let queue = queue?;
            match queue.next().await {
                Ok(Some(item)) => Some((Ok(item), Some(queue))),
                Ok(None) => None,
                Err(error) => Some((Err(error), None)),
            }
        })
    }
}

impl<T, E: Clone> Default for PendingQueue<T, E> {
    fn default() -> Self {
        Self::new()
    }
}
