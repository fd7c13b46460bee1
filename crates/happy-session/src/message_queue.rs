//! Mode-aware batching queue feeding one agent loop.
//!
//! Remote turns arrive as `(message, mode)` pairs. The consumer takes one
//! batch at a time: the head item plus every directly following item whose
//! mode hash matches, joined with `\n`. Items are never reordered and never
//! merged across a hash change, so a mode switch always starts a new turn.
//!
//! ## Waiting
//!
//! Exactly one waiter is supported. A second concurrent
//! [`MessageQueue::wait_for_messages_and_get_as_string`] displaces the first,
//! which then resolves `None`. The wait also resolves `None` on
//! [`MessageQueue::close`] or when its abort token fires; an aborted wait is
//! never revived by a later push, and the pushed items stay queued.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Errors returned by queue mutations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("message queue is closed")]
    Closed,
}

/// One queued message.
#[derive(Debug, Clone)]
pub struct QueueItem<T> {
    pub message: String,
    pub mode: T,
    pub mode_hash: String,
    /// Delivered alone, never merged with neighbours
    pub isolate: bool,
}

/// One coalesced turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBatch<T> {
    pub message: String,
    pub mode: T,
    pub hash: String,
    pub isolate: bool,
}

type ModeHasher<T> = Arc<dyn Fn(&T) -> String + Send + Sync>;

struct Waiter {
    id: u64,
    wake: oneshot::Sender<()>,
}

struct Inner<T> {
    items: VecDeque<QueueItem<T>>,
    closed: bool,
    waiter: Option<Waiter>,
    next_waiter_id: u64,
}

/// Batching queue generic over the mode type.
pub struct MessageQueue<T> {
    inner: Mutex<Inner<T>>,
    hasher: ModeHasher<T>,
}

impl<T> MessageQueue<T> {
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T> std::fmt::Debug for MessageQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("MessageQueue")
            .field("size", &inner.items.len())
            .field("closed", &inner.closed)
            .field("waiting", &inner.waiter.is_some())
            .finish()
    }
}

impl<T: Clone> MessageQueue<T> {
    /// Create a queue comparing modes with `hasher`, which must be pure.
    pub fn new(hasher: impl Fn(&T) -> String + Send + Sync + 'static) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
                waiter: None,
                next_waiter_id: 0,
            }),
            hasher: Arc::new(hasher),
        }
    }

    /// Append a message and wake the waiter.
    pub fn push(&self, message: impl Into<String>, mode: T) -> Result<(), QueueError> {
        let item = self.item(message.into(), mode, false);
        let mut inner = self.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        inner.items.push_back(item);
        Self::wake(&mut inner);
        Ok(())
    }

    /// Prepend a message and wake the waiter.
    pub fn unshift(&self, message: impl Into<String>, mode: T) -> Result<(), QueueError> {
        let item = self.item(message.into(), mode, false);
        let mut inner = self.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        inner.items.push_front(item);
        Self::wake(&mut inner);
        Ok(())
    }

    /// Drop everything queued and enqueue `message` as a standalone turn.
    ///
    /// Used for control messages (e.g. a slash command) that must not be
    /// merged with leftover input.
    pub fn push_isolate_and_clear(&self, message: impl Into<String>, mode: T) -> Result<(), QueueError> {
        let item = self.item(message.into(), mode, true);
        let mut inner = self.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        let dropped = inner.items.len();
        inner.items.clear();
        inner.items.push_back(item);
        if dropped > 0 {
            debug!(dropped, "cleared queue for isolated message");
        }
        Self::wake(&mut inner);
        Ok(())
    }

    /// Forbid further pushes and release the waiter with `None`.
    ///
    /// Items already queued can still be drained.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        Self::wake(&mut inner);
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn size(&self) -> usize {
        self.lock().items.len()
    }

    /// Take the next batch, waiting if the queue is empty.
    ///
    /// Resolves `None` when the queue is closed and empty, when `abort`
    /// fires, or when another waiter takes this one's place.
    pub async fn wait_for_messages_and_get_as_string(
        &self,
        abort: Option<&CancellationToken>,
    ) -> Option<QueueBatch<T>> {
        let (id, woken) = {
            let mut inner = self.lock();
            if abort.is_some_and(|t| t.is_cancelled()) {
                return None;
            }
            if !inner.items.is_empty() {
                return self.collect_batch(&mut inner);
            }
            if inner.closed {
                return None;
            }
            let (wake, woken) = oneshot::channel();
            inner.next_waiter_id += 1;
            let id = inner.next_waiter_id;
            if inner.waiter.replace(Waiter { id, wake }).is_some() {
                debug!("displacing previous queue waiter");
            }
            (id, woken)
        };

        let signalled = match abort {
            Some(token) => tokio::select! {
                r = woken => r.is_ok(),
                _ = token.cancelled() => false,
            },
            None => woken.await.is_ok(),
        };

        let mut inner = self.lock();
        if inner.waiter.as_ref().is_some_and(|w| w.id == id) {
            inner.waiter = None;
        }
        if !signalled {
            return None;
        }
        self.collect_batch(&mut inner)
    }

    fn item(&self, message: String, mode: T, isolate: bool) -> QueueItem<T> {
        let mode_hash = (self.hasher)(&mode);
        QueueItem {
            message,
            mode,
            mode_hash,
            isolate,
        }
    }

    fn collect_batch(&self, inner: &mut Inner<T>) -> Option<QueueBatch<T>> {
        let head = inner.items.pop_front()?;
        let mut batch = QueueBatch {
            message: head.message,
            mode: head.mode,
            hash: head.mode_hash,
            isolate: head.isolate,
        };
        if batch.isolate {
            return Some(batch);
        }
        while let Some(next) = inner.items.front() {
            if next.isolate || next.mode_hash != batch.hash {
                break;
            }
            if let Some(next) = inner.items.pop_front() {
                batch.message.push('\n');
                batch.message.push_str(&next.message);
            }
        }
        Some(batch)
    }

    fn wake(inner: &mut Inner<T>) {
        if let Some(waiter) = inner.waiter.take() {
            let _ = waiter.wake.send(());
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn queue() -> Arc<MessageQueue<&'static str>> {
        Arc::new(MessageQueue::new(|m: &&str| m.to_string()))
    }

    #[tokio::test]
    async fn test_same_mode_pushes_join_in_order() {
        let q = queue();
        q.push("one", "A").unwrap();
        q.push("two", "A").unwrap();
        q.push("three", "A").unwrap();

        let batch = q.wait_for_messages_and_get_as_string(None).await.unwrap();
        assert_eq!(batch.message, "one\ntwo\nthree");
        assert_eq!(batch.mode, "A");
        assert_eq!(q.size(), 0);
    }

    #[tokio::test]
    async fn test_mode_change_splits_batches() {
        let q = queue();
        q.push("a1", "A").unwrap();
        q.push("a2", "A").unwrap();
        q.push("b1", "B").unwrap();
        q.push("b2", "B").unwrap();

        let first = q.wait_for_messages_and_get_as_string(None).await.unwrap();
        assert_eq!((first.message.as_str(), first.mode), ("a1\na2", "A"));
        let second = q.wait_for_messages_and_get_as_string(None).await.unwrap();
        assert_eq!((second.message.as_str(), second.mode), ("b1\nb2", "B"));
        assert_eq!(q.size(), 0);
    }

    #[tokio::test]
    async fn test_no_merge_across_interleaved_modes() {
        let q = queue();
        q.push("a1", "A").unwrap();
        q.push("b1", "B").unwrap();
        q.push("a2", "A").unwrap();

        let msgs: Vec<String> = vec![
            q.wait_for_messages_and_get_as_string(None).await.unwrap().message,
            q.wait_for_messages_and_get_as_string(None).await.unwrap().message,
            q.wait_for_messages_and_get_as_string(None).await.unwrap().message,
        ];
        assert_eq!(msgs, vec!["a1", "b1", "a2"]);
    }

    #[tokio::test]
    async fn test_unshift_goes_first() {
        let q = queue();
        q.push("second", "A").unwrap();
        q.unshift("first", "A").unwrap();
        let batch = q.wait_for_messages_and_get_as_string(None).await.unwrap();
        assert_eq!(batch.message, "first\nsecond");
    }

    #[tokio::test]
    async fn test_push_wakes_blocked_waiter() {
        let q = queue();
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.wait_for_messages_and_get_as_string(None).await })
        };
        tokio::task::yield_now().await;

        q.push("hello", "A").unwrap();
        let batch = waiter.await.unwrap().unwrap();
        assert_eq!(batch.message, "hello");
    }

    #[tokio::test]
    async fn test_close_releases_waiter_once() {
        let q = queue();
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.wait_for_messages_and_get_as_string(None).await })
        };
        tokio::task::yield_now().await;

        q.close();
        assert!(waiter.await.unwrap().is_none());
        assert!(q.wait_for_messages_and_get_as_string(None).await.is_none());
    }

    #[tokio::test]
    async fn test_push_after_close_fails() {
        let q = queue();
        q.close();
        assert_eq!(q.push("late", "A"), Err(QueueError::Closed));
        assert_eq!(q.unshift("late", "A"), Err(QueueError::Closed));
        assert!(q.is_closed());
    }

    #[tokio::test]
    async fn test_items_queued_before_close_still_drain() {
        let q = queue();
        q.push("kept", "A").unwrap();
        q.close();
        let batch = q.wait_for_messages_and_get_as_string(None).await.unwrap();
        assert_eq!(batch.message, "kept");
        assert!(q.wait_for_messages_and_get_as_string(None).await.is_none());
    }

    #[tokio::test]
    async fn test_abort_resolves_none_and_is_not_revived() {
        let q = queue();
        let token = CancellationToken::new();
        let waiter = {
            let q = Arc::clone(&q);
            let token = token.clone();
            tokio::spawn(async move { q.wait_for_messages_and_get_as_string(Some(&token)).await })
        };
        tokio::task::yield_now().await;

        token.cancel();
        assert!(waiter.await.unwrap().is_none());

        q.push("after", "A").unwrap();
        assert_eq!(q.size(), 1, "pushed item must stay queued");
        let batch = q.wait_for_messages_and_get_as_string(None).await.unwrap();
        assert_eq!(batch.message, "after");
    }

    #[tokio::test]
    async fn test_already_aborted_token_returns_none_even_with_items() {
        let q = queue();
        q.push("x", "A").unwrap();
        let token = CancellationToken::new();
        token.cancel();
        assert!(q.wait_for_messages_and_get_as_string(Some(&token)).await.is_none());
        assert_eq!(q.size(), 1);
    }

    #[tokio::test]
    async fn test_second_waiter_displaces_first() {
        let q = queue();
        let first = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.wait_for_messages_and_get_as_string(None).await })
        };
        tokio::task::yield_now().await;
        let second = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.wait_for_messages_and_get_as_string(None).await })
        };
        tokio::task::yield_now().await;

        assert!(first.await.unwrap().is_none());
        q.push("only", "A").unwrap();
        let batch = tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(batch.message, "only");
    }

    #[tokio::test]
    async fn test_isolate_clears_and_stands_alone() {
        let q = queue();
        q.push("stale1", "A").unwrap();
        q.push("stale2", "A").unwrap();
        q.push_isolate_and_clear("/clear", "A").unwrap();
        q.push("next", "A").unwrap();

        let first = q.wait_for_messages_and_get_as_string(None).await.unwrap();
        assert_eq!(first.message, "/clear");
        assert!(first.isolate);

        let second = q.wait_for_messages_and_get_as_string(None).await.unwrap();
        assert_eq!(second.message, "next");
    }

    #[tokio::test]
    async fn test_batch_reports_hash() {
        let q = Arc::new(MessageQueue::new(|m: &u8| format!("mode-{m}")));
        q.push("x", 7).unwrap();
        let batch = q.wait_for_messages_and_get_as_string(None).await.unwrap();
        assert_eq!(batch.hash, "mode-7");
    }
}
