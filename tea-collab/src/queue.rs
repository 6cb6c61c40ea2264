//! In-order, non-overlapping processing of inbound messages.
//!
//! A single worker task pops the head of the buffer and awaits the
//! processor before popping the next one, so processing of message N+1
//! never starts before processing of message N has finished, even though
//! both are asynchronous.
//!
//! ```text
//! enqueue() ──► VecDeque ──► worker ──► processor(msg).await ──► next
//!                  ▲
//!               clear()  (drops buffered items, never the in-flight one)
//! ```

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::error::{CollabError, Result};
use crate::protocol::Message;

/// What the worker does when the processor rejects a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop draining; buffered messages stay queued and `enqueue` fails.
    #[default]
    Halt,
    /// Log the failure and continue with the next message.
    Skip,
}

/// Worker status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueStatus {
    Idle,
    Draining,
    Halted(String),
}

struct QueueInner {
    buffer: Mutex<VecDeque<Message>>,
    status: watch::Sender<QueueStatus>,
    wakeup: Notify,
    processed: AtomicU64,
    skipped: AtomicU64,
}

/// FIFO queue drained by one asynchronous processor.
pub struct MessageQueue {
    inner: Arc<QueueInner>,
    worker: JoinHandle<()>,
}

impl MessageQueue {
    /// Spawn the worker task with the given processor.
    pub fn spawn<F, Fut>(processor: F, policy: FailurePolicy) -> Self
    where
        F: FnMut(Message) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (status, _) = watch::channel(QueueStatus::Idle);
        let inner = Arc::new(QueueInner {
            buffer: Mutex::new(VecDeque::new()),
            status,
            wakeup: Notify::new(),
            processed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        });
        let worker = tokio::spawn(drain(inner.clone(), processor, policy));
        Self { inner, worker }
    }

    /// Append a message to the tail and wake the worker.
    pub async fn enqueue(&self, message: Message) -> Result<()> {
        {
            let mut buffer = self.inner.buffer.lock().await;
            if let QueueStatus::Halted(reason) = &*self.inner.status.borrow() {
                return Err(CollabError::QueueHalted(reason.clone()));
            }
            buffer.push_back(message);
            self.inner.status.send_replace(QueueStatus::Draining);
        }
        self.inner.wakeup.notify_one();
        Ok(())
    }

    /// Number of messages waiting (excluding the one being processed).
    pub async fn size(&self) -> usize {
        self.inner.buffer.lock().await.len()
    }

    /// Discard every waiting message. Returns how many were dropped.
    ///
    /// A processing call already in flight runs to completion.
    pub async fn clear(&self) -> usize {
        let mut buffer = self.inner.buffer.lock().await;
        let dropped = buffer.len();
        buffer.clear();
        dropped
    }

    pub fn status(&self) -> QueueStatus {
        self.inner.status.borrow().clone()
    }

    /// Wait until the buffer is empty and nothing is in flight.
    ///
    /// Fails with [`CollabError::QueueHalted`] if draining stopped.
    pub async fn wait_idle(&self) -> Result<()> {
        let mut rx = self.inner.status.subscribe();
        let status = rx
            .wait_for(|s| *s != QueueStatus::Draining)
            .await
            .map_err(|_| CollabError::QueueHalted("worker stopped".into()))?
            .clone();
        match status {
            QueueStatus::Halted(reason) => Err(CollabError::QueueHalted(reason)),
            _ => Ok(()),
        }
    }

    /// Messages processed successfully.
    pub fn processed(&self) -> u64 {
        self.inner.processed.load(Ordering::Relaxed)
    }

    /// Messages whose processing failed under [`FailurePolicy::Skip`].
    pub fn skipped(&self) -> u64 {
        self.inner.skipped.load(Ordering::Relaxed)
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn drain<F, Fut>(inner: Arc<QueueInner>, mut processor: F, policy: FailurePolicy)
where
    F: FnMut(Message) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    loop {
        let next = {
            let mut buffer = inner.buffer.lock().await;
            let next = buffer.pop_front();
            if next.is_none() {
                inner.status.send_if_modified(|s| {
                    if *s == QueueStatus::Draining {
                        *s = QueueStatus::Idle;
                        true
                    } else {
                        false
                    }
                });
            }
            next
        };

        let Some(message) = next else {
            inner.wakeup.notified().await;
            continue;
        };

        let msg_type = message.msg_type;
        match processor(message).await {
            Ok(()) => {
                inner.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => match policy {
                FailurePolicy::Halt => {
                    log::error!("Message queue halted while processing {msg_type}: {e}");
                    let _buffer = inner.buffer.lock().await;
                    inner.status.send_replace(QueueStatus::Halted(e.to_string()));
                    return;
                }
                FailurePolicy::Skip => {
                    log::warn!("Skipping {msg_type} message after processing error: {e}");
                    inner.skipped.fetch_add(1, Ordering::Relaxed);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::time::timeout;

    fn ping(ts: i64) -> Message {
        let mut msg = Message::ping();
        msg.timestamp = Some(ts);
        msg
    }

    #[tokio::test]
    async fn test_fifo_without_overlap() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let (l, f) = (log.clone(), in_flight.clone());
        let queue = MessageQueue::spawn(
            move |msg: Message| {
                let (l, f) = (l.clone(), f.clone());
                async move {
                    let ts = msg.timestamp.unwrap_or_default();
                    assert_eq!(f.fetch_add(1, Ordering::SeqCst), 0, "overlapping processing");
                    l.lock().unwrap().push(format!("start:{ts}"));
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    l.lock().unwrap().push(format!("end:{ts}"));
                    f.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), CollabError>(())
                }
            },
            FailurePolicy::Halt,
        );

        for ts in 1..=5 {
            queue.enqueue(ping(ts)).await.unwrap();
        }
        timeout(Duration::from_secs(2), queue.wait_idle()).await.unwrap().unwrap();

        let expected: Vec<String> = (1..=5)
            .flat_map(|ts| [format!("start:{ts}"), format!("end:{ts}")])
            .collect();
        assert_eq!(*log.lock().unwrap(), expected);
        assert_eq!(queue.processed(), 5);
        assert_eq!(queue.status(), QueueStatus::Idle);
    }

    #[tokio::test]
    async fn test_second_waits_for_first() {
        let release = Arc::new(Notify::new());
        let calls = Arc::new(StdMutex::new(Vec::new()));

        let (r, c) = (release.clone(), calls.clone());
        let queue = MessageQueue::spawn(
            move |msg: Message| {
                let (r, c) = (r.clone(), c.clone());
                async move {
                    c.lock().unwrap().push(msg.msg_type);
                    if msg.msg_type == MessageType::Ping {
                        r.notified().await;
                    }
                    Ok::<(), CollabError>(())
                }
            },
            FailurePolicy::Halt,
        );

        queue.enqueue(ping(1)).await.unwrap();
        queue
            .enqueue(Message::case_message(json!({"name": "X"})))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*calls.lock().unwrap(), vec![MessageType::Ping]);
        assert_eq!(queue.size().await, 1);

        release.notify_one();
        timeout(Duration::from_secs(2), queue.wait_idle()).await.unwrap().unwrap();
        assert_eq!(
            *calls.lock().unwrap(),
            vec![MessageType::Ping, MessageType::CaseMessage]
        );
    }

    #[tokio::test]
    async fn test_clear_keeps_in_flight() {
        let release = Arc::new(Notify::new());
        let r = release.clone();
        let queue = MessageQueue::spawn(
            move |_msg: Message| {
                let r = r.clone();
                async move {
                    r.notified().await;
                    Ok::<(), CollabError>(())
                }
            },
            FailurePolicy::Halt,
        );

        for ts in 1..=4 {
            queue.enqueue(ping(ts)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(queue.clear().await, 3);
        assert_eq!(queue.size().await, 0);

        release.notify_one();
        timeout(Duration::from_secs(2), queue.wait_idle()).await.unwrap().unwrap();
        assert_eq!(queue.processed(), 1);
    }

    #[tokio::test]
    async fn test_halt_policy_stops_draining() {
        let queue = MessageQueue::spawn(
            |msg: Message| async move {
                if msg.timestamp == Some(2) {
                    Err(CollabError::Processing("bad case payload".into()))
                } else {
                    Ok(())
                }
            },
            FailurePolicy::Halt,
        );

        for ts in 1..=3 {
            queue.enqueue(ping(ts)).await.unwrap();
        }
        let err = timeout(Duration::from_secs(2), queue.wait_idle())
            .await
            .unwrap()
            .unwrap_err();

        assert!(matches!(err, CollabError::QueueHalted(_)));
        assert_eq!(queue.processed(), 1);
        assert_eq!(queue.size().await, 1);
        assert!(matches!(queue.status(), QueueStatus::Halted(_)));
        assert!(matches!(
            queue.enqueue(ping(4)).await,
            Err(CollabError::QueueHalted(_))
        ));
    }

    #[tokio::test]
    async fn test_skip_policy_continues() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let s = seen.clone();
        let queue = MessageQueue::spawn(
            move |msg: Message| {
                let s = s.clone();
                async move {
                    s.lock().unwrap().push(msg.timestamp);
                    if msg.timestamp == Some(2) {
                        return Err(CollabError::Processing("boom".into()));
                    }
                    Ok(())
                }
            },
            FailurePolicy::Skip,
        );

        for ts in 1..=3 {
            queue.enqueue(ping(ts)).await.unwrap();
        }
        timeout(Duration::from_secs(2), queue.wait_idle()).await.unwrap().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![Some(1), Some(2), Some(3)]);
        assert_eq!(queue.processed(), 2);
        assert_eq!(queue.skipped(), 1);
    }

    #[tokio::test]
    async fn test_idle_when_empty() {
        let queue = MessageQueue::spawn(
            |_msg: Message| async { Ok::<(), CollabError>(()) },
            FailurePolicy::default(),
        );
        assert_eq!(queue.size().await, 0);
        queue.wait_idle().await.unwrap();
    }
}
