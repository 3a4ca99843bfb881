//! Blocking multi-producer/multi-consumer event queue
//!
//! The hand-off point between the discovery task, the bus polling loop and
//! consumer threads. Any number of handles may put and get concurrently;
//! closing the queue wakes every blocked caller.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("event queue is closed")]
pub struct QueueClosed;

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: Option<usize>,
}

/// FIFO shared by all clones of the handle
pub struct EventQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for EventQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for EventQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("EventQueue")
            .field("len", &state.items.len())
            .field("capacity", &self.shared.capacity)
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T> EventQueue<T> {
    /// Create an unbounded queue
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Create a queue holding at most `capacity` items
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    items: VecDeque::new(),
                    closed: false,
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                capacity,
            }),
        }
    }

    fn is_full(&self, state: &State<T>) -> bool {
        self.shared
            .capacity
            .map(|cap| state.items.len() >= cap)
            .unwrap_or(false)
    }

    /// Append an item, blocking while a bounded queue is full
    pub fn put(&self, item: T) -> Result<(), QueueClosed> {
        let mut state = self.shared.state.lock();
        loop {
            if state.closed {
                return Err(QueueClosed);
            }
            if !self.is_full(&state) {
                break;
            }
            self.shared.not_full.wait(&mut state);
        }
        state.items.push_back(item);
        drop(state);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Append an item without blocking; false if full or closed
    pub fn try_put(&self, item: T) -> bool {
        let mut state = self.shared.state.lock();
        if state.closed || self.is_full(&state) {
            return false;
        }
        state.items.push_back(item);
        drop(state);
        self.shared.not_empty.notify_one();
        true
    }

    /// Take the oldest item, blocking until one arrives.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub fn get(&self) -> Option<T> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.shared.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.shared.not_empty.wait(&mut state);
        }
    }

    /// Take the oldest item if one is queued
    pub fn try_get(&self) -> Option<T> {
        let item = self.shared.state.lock().items.pop_front();
        if item.is_some() {
            self.shared.not_full.notify_one();
        }
        item
    }

    /// Like `get`, giving up after `timeout`
    pub fn get_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.shared.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            if self
                .shared
                .not_empty
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                let item = state.items.pop_front();
                if item.is_some() {
                    drop(state);
                    self.shared.not_full.notify_one();
                }
                return item;
            }
        }
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse further puts and wake every blocked caller.
    ///
    /// Items already queued can still be taken.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Blocking iterator that ends when the queue is closed and drained
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { queue: self }
    }
}

pub struct Iter<'a, T> {
    queue: &'a EventQueue<T>,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.queue.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = EventQueue::new();
        for i in 0..5 {
            queue.put(i).unwrap();
        }

        assert_eq!(queue.len(), 5);
        let drained: Vec<_> = (0..5).filter_map(|_| queue.try_get()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(queue.try_get().is_none());
    }

    #[test]
    fn test_bounded_try_put() {
        let queue = EventQueue::bounded(2);
        assert!(queue.try_put("a"));
        assert!(queue.try_put("b"));
        assert!(!queue.try_put("c"));

        assert_eq!(queue.get(), Some("a"));
        assert!(queue.try_put("c"));
    }

    #[test]
    fn test_blocking_put_waits_for_room() {
        let queue = EventQueue::bounded(1);
        queue.put(1).unwrap();

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.put(2))
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.get(), Some(1));
        producer.join().unwrap().unwrap();
        assert_eq!(queue.get(), Some(2));
    }

    #[test]
    fn test_close_wakes_blocked_consumer() {
        let queue: EventQueue<u32> = EventQueue::new();
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.get())
        };

        thread::sleep(Duration::from_millis(20));
        queue.close();

        assert_eq!(consumer.join().unwrap(), None);
        assert_eq!(queue.put(7), Err(QueueClosed));
        assert!(!queue.try_put(7));
    }

    #[test]
    fn test_close_keeps_queued_items() {
        let queue = EventQueue::new();
        queue.put("left").unwrap();
        queue.close();

        assert!(queue.is_closed());
        let rest: Vec<_> = queue.iter().collect();
        assert_eq!(rest, vec!["left"]);
    }

    #[test]
    fn test_get_timeout_expires() {
        let queue: EventQueue<u32> = EventQueue::new();
        let start = Instant::now();

        assert_eq!(queue.get_timeout(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_many_producers_many_consumers() {
        let queue = EventQueue::new();
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        queue.put(p * 1000 + i).unwrap();
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || queue.iter().count())
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        queue.close();

        let received: usize = consumers.into_iter().map(|c| c.join().unwrap()).sum();
        assert_eq!(received, 1000);
    }
}
