//! Bounded three-lane work queue (§4.C12 "Worker pool"). Generalizes the
//! teacher's `PromptPriorityQueue` — a `BinaryHeap` ordered purely by an
//! `Ord` priority tag — from two lanes (`High`/`Low`) to three
//! (`Priority`/`Normal`/`Retry`), and adds the bound + async wakeup the
//! teacher's queue never needed since it was never backpressured.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Mutex;

use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::domain::company::Company;
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lane {
    Retry,
    Normal,
    Priority,
}

#[derive(Debug, Clone)]
pub struct WorkItem {
    pub company: Company,
    pub lane: Lane,
}

impl PartialEq for WorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.lane == other.lane
    }
}
impl Eq for WorkItem {}

impl PartialOrd for WorkItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WorkItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.lane.cmp(&other.lane)
    }
}

/// Workers pop the highest non-empty lane first (`BinaryHeap`'s own
/// ordering does this for free). Bounded: `push` blocks until a slot frees
/// up, honoring cancellation. `close` lets a drained producer wake every
/// parked popper so they observe an empty, closed queue and exit.
pub struct PriorityQueue {
    heap: Mutex<BinaryHeap<WorkItem>>,
    capacity: Semaphore,
    item_available: Notify,
    closed: AtomicBool,
}

impl PriorityQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            capacity: Semaphore::new(capacity.max(1)),
            item_available: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn push(&self, company: Company, lane: Lane, cancel: &CancellationToken) -> Result<(), AppError> {
        if self.closed.load(Relaxed) {
            return Err(AppError::Permanent("queue is closed".into()));
        }
        let permit = tokio::select! {
            permit = self.capacity.acquire() => permit.map_err(|_| AppError::Permanent("queue closed".into()))?,
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
        };
        permit.forget();
        self.heap.lock().unwrap().push(WorkItem { company, lane });
        self.item_available.notify_one();
        Ok(())
    }

    /// Returns `None` once the queue is closed and drained — the signal a
    /// worker uses to exit its pop loop.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<WorkItem> {
        loop {
            if let Some(item) = self.heap.lock().unwrap().pop() {
                self.capacity.add_permits(1);
                return Some(item);
            }
            if self.closed.load(Relaxed) {
                return None;
            }
            tokio::select! {
                _ = self.item_available.notified() => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Relaxed);
        self.item_available.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn company(name: &str) -> Company {
        Company {
            name: name.into(),
            domain: None,
            product_url: None,
            description: None,
            launch_timestamp: None,
        }
    }

    #[tokio::test]
    async fn pops_priority_lane_before_normal_before_retry() {
        let q = PriorityQueue::new(10);
        let cancel = CancellationToken::new();
        q.push(company("normal-co"), Lane::Normal, &cancel).await.unwrap();
        q.push(company("retry-co"), Lane::Retry, &cancel).await.unwrap();
        q.push(company("priority-co"), Lane::Priority, &cancel).await.unwrap();

        assert_eq!(q.pop(&cancel).await.unwrap().company.name, "priority-co");
        assert_eq!(q.pop(&cancel).await.unwrap().company.name, "normal-co");
        assert_eq!(q.pop(&cancel).await.unwrap().company.name, "retry-co");
    }

    #[tokio::test]
    async fn pop_returns_none_once_closed_and_drained() {
        let q = PriorityQueue::new(10);
        let cancel = CancellationToken::new();
        q.push(company("only-one"), Lane::Normal, &cancel).await.unwrap();
        q.close();
        assert!(q.pop(&cancel).await.is_some());
        assert!(q.pop(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn push_after_close_is_rejected() {
        let q = PriorityQueue::new(10);
        let cancel = CancellationToken::new();
        q.close();
        let result = q.push(company("late"), Lane::Normal, &cancel).await;
        assert!(matches!(result, Err(AppError::Permanent(_))));
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_waiting_pop() {
        let q = PriorityQueue::new(10);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(q.pop(&cancel).await.is_none());
    }
}
