//! Single-runner task queue.
//!
//! Any thread may push; at most one thread drains at a time. The pusher that
//! flips the `running` flag from false to true owns the next drain and must
//! schedule it. Tasks for one queue therefore run strictly one after another
//! and in push order, while distinct queues drain in parallel on a shared
//! worker pool.

use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub struct TaskQueue<T> {
    tasks: SegQueue<T>,
    running: AtomicBool,
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            tasks: SegQueue::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Enqueue a task. Returns true if the caller must schedule [`drain`](Self::drain).
    pub fn push(&self, task: T) -> bool {
        self.tasks.push(task);
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Run queued tasks until the queue is empty or `stop` reports true.
    ///
    /// Must only be called by the pusher that won the running flag. Tasks
    /// still queued when `stop` fires are dropped unrun.
    pub fn drain<S, F>(&self, stop: S, mut run: F)
    where
        S: Fn() -> bool,
        F: FnMut(T),
    {
        loop {
            while !stop() {
                match self.tasks.pop() {
                    Some(task) => run(task),
                    None => break,
                }
            }
            if stop() {
                while self.tasks.pop().is_some() {}
            }
            self.running.store(false, Ordering::Release);
            // A push between the last pop and the store above saw the flag
            // still set and did not schedule a drain; take it over here.
            if self.tasks.is_empty() || stop() {
                return;
            }
            if self
                .running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[test]
    fn test_first_push_wins_runner() {
        let queue = TaskQueue::new();
        assert!(queue.push(1));
        assert!(!queue.push(2));
        let mut seen = Vec::new();
        queue.drain(|| false, |t| seen.push(t));
        assert_eq!(seen, vec![1, 2]);
        assert!(!queue.is_running());
        assert!(queue.push(3));
    }

    #[test]
    fn test_stop_drops_remaining() {
        let queue = TaskQueue::new();
        let stopped = AtomicBool::new(false);
        queue.push(1);
        queue.push(2);
        let mut seen = Vec::new();
        queue.drain(
            || stopped.load(Ordering::SeqCst),
            |t| {
                seen.push(t);
                stopped.store(true, Ordering::SeqCst);
            },
        );
        assert_eq!(seen, vec![1]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_concurrent_producers_serialized() {
        let queue = Arc::new(TaskQueue::new());
        let active = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicBool::new(false));
        let log = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..4)
            .map(|producer| {
                let queue = Arc::clone(&queue);
                let active = Arc::clone(&active);
                let overlap = Arc::clone(&overlap);
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    for seq in 0..500 {
                        if queue.push((producer, seq)) {
                            queue.drain(
                                || false,
                                |task| {
                                    if active.fetch_add(1, Ordering::SeqCst) != 0 {
                                        overlap.store(true, Ordering::SeqCst);
                                    }
                                    log.lock().unwrap().push(task);
                                    active.fetch_sub(1, Ordering::SeqCst);
                                },
                            );
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(!overlap.load(Ordering::SeqCst));
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2000);
        for producer in 0..4 {
            let seqs: Vec<_> = log
                .iter()
                .filter(|(p, _)| *p == producer)
                .map(|(_, s)| *s)
                .collect();
            assert_eq!(seqs, (0..500).collect::<Vec<_>>());
        }
    }
}
