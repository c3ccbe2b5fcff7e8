//! Deduplicating, rate limited work queue.
//!
//! An item is at most once in the queue and at most once in processing. Adding an item while it
//! is processed marks it dirty, and `done` puts it back so the change is not lost.

pub mod rate_limiter;

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use self::rate_limiter::{RateLimiter, default_controller_rate_limiter};

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

impl<T> Default for State<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            shutting_down: false,
        }
    }
}

struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    rate_limiter: Box<dyn RateLimiter<T>>,
}

pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for WorkQueue<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(default_controller_rate_limiter())
    }
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new(rate_limiter: impl RateLimiter<T> + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                rate_limiter: Box::new(rate_limiter),
            }),
        }
    }

    pub fn add(&self, item: T) {
        let mut state = self.inner.state.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Waits for the next item. Returns `None` once the queue is shut down.
    ///
    /// Every item returned must be released with [`WorkQueue::done`] (or a [`DoneGuard`]).
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // register before checking the state so a concurrent add or shut_down is not missed
            notified.as_mut().enable();
            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    pub fn done(&self, item: &T) {
        let mut state = self.inner.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Calls [`WorkQueue::done`] for `item` when the guard goes out of scope.
    pub fn done_guard(&self, item: T) -> DoneGuard<T> {
        DoneGuard {
            queue: self.clone(),
            item,
        }
    }

    pub fn forget(&self, item: &T) {
        self.inner.rate_limiter.forget(item);
    }

    pub fn add_rate_limited(&self, item: T) {
        let delay = self.inner.rate_limiter.when(&item);
        self.add_after(item, delay);
    }

    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.inner.rate_limiter.num_requeues(item)
    }

    /// Items waiting to be handed out. Items in processing are not counted.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }
}

pub struct DoneGuard<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    queue: WorkQueue<T>,
    item: T,
}

impl<T> DoneGuard<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn item(&self) -> &T {
        &self.item
    }
}

impl<T> Drop for DoneGuard<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.queue.done(&self.item);
    }
}
