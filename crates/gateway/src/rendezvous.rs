//! Ask-user rendezvous: a bounded wait for an external answer that pauses
//! a running task without unwinding it.
//!
//! Classic single-producer-single-consumer with a cache for the race
//! window: if the answer arrives before the kernel starts waiting, it is
//! cached and the wait returns immediately. Cancellation wakes the waiter
//! with no answer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Default)]
pub struct AnswerWaiters {
    notifiers: Mutex<HashMap<Uuid, Arc<Notify>>>,
    answers: Mutex<HashMap<Uuid, String>>,
}

impl AnswerWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an answer and wake the waiter, if any. Returns true when a
    /// waiter was actually blocked on it.
    pub fn deliver(&self, task_id: Uuid, answer: String) -> bool {
        self.answers.lock().insert(task_id, answer);
        match self.notifiers.lock().get(&task_id) {
            Some(notify) => {
                notify.notify_one();
                true
            }
            None => {
                tracing::debug!(task_id = %task_id, "answer cached before the waiter arrived");
                false
            }
        }
    }

    /// Wake the waiter without an answer (cancellation path).
    pub fn abort(&self, task_id: &Uuid) {
        if let Some(notify) = self.notifiers.lock().get(task_id) {
            notify.notify_one();
        }
    }

    /// Block until an answer arrives or `timeout` elapses. A cached answer
    /// returns immediately.
    pub async fn wait(&self, task_id: Uuid, timeout: Duration) -> Option<String> {
        if let Some(answer) = self.answers.lock().remove(&task_id) {
            return Some(answer);
        }

        let notify = Arc::new(Notify::new());
        self.notifiers.lock().insert(task_id, notify.clone());

        let result = match tokio::time::timeout(timeout, notify.notified()).await {
            // Woken: either an answer landed or this is an abort.
            Ok(()) => self.answers.lock().remove(&task_id),
            Err(_) => None,
        };

        self.notifiers.lock().remove(&task_id);
        self.answers.lock().remove(&task_id);
        result
    }

    /// Drop any state for a finished task.
    pub fn forget(&self, task_id: &Uuid) {
        self.notifiers.lock().remove(task_id);
        self.answers.lock().remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn answer_wakes_waiter() {
        let waiters = Arc::new(AnswerWaiters::new());
        let id = Uuid::new_v4();

        let waiter = {
            let waiters = waiters.clone();
            tokio::spawn(async move { waiters.wait(id, Duration::from_secs(5)).await })
        };
        // Give the waiter a moment to park.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(waiters.deliver(id, "123456".into()));

        assert_eq!(waiter.await.unwrap().as_deref(), Some("123456"));
    }

    #[tokio::test]
    async fn cached_answer_returns_immediately() {
        let waiters = AnswerWaiters::new();
        let id = Uuid::new_v4();
        // Answer lands before the kernel starts waiting (race window).
        assert!(!waiters.deliver(id, "early".into()));
        let answer = waiters.wait(id, Duration::from_millis(10)).await;
        assert_eq!(answer.as_deref(), Some("early"));
    }

    #[tokio::test]
    async fn timeout_returns_none() {
        let waiters = AnswerWaiters::new();
        let id = Uuid::new_v4();
        let answer = waiters.wait(id, Duration::from_millis(30)).await;
        assert!(answer.is_none());
    }

    #[tokio::test]
    async fn abort_wakes_without_answer() {
        let waiters = Arc::new(AnswerWaiters::new());
        let id = Uuid::new_v4();

        let waiter = {
            let waiters = waiters.clone();
            tokio::spawn(async move { waiters.wait(id, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiters.abort(&id);

        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn forget_clears_state() {
        let waiters = AnswerWaiters::new();
        let id = Uuid::new_v4();
        waiters.deliver(id, "stale".into());
        waiters.forget(&id);
        let answer = waiters.wait(id, Duration::from_millis(10)).await;
        assert!(answer.is_none());
    }
}
