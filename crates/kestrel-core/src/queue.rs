use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::feedback::FeedbackLoop;
use crate::models::ScrapeMode;

/// Number of URLs not yet completed, per mode, across every active stream
/// and batch.
#[derive(Debug, Default)]
pub struct ModeQueues {
    depths: [AtomicUsize; 3],
}

impl ModeQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self, mode: ScrapeMode) -> usize {
        self.depths[mode.index()].load(Ordering::Relaxed)
    }

    fn add(&self, mode: ScrapeMode, n: usize) -> usize {
        self.depths[mode.index()].fetch_add(n, Ordering::Relaxed) + n
    }

    fn sub(&self, mode: ScrapeMode, n: usize) -> usize {
        let depth = &self.depths[mode.index()];
        let mut current = depth.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(n);
            match depth.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Handed out for every URL taken off a [`Backlog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueTicket {
    /// Time the URL spent queued.
    pub wait: Duration,
    /// Mode queue depth when the URL started.
    pub depth: usize,
}

/// A group of URLs enqueued together.
///
/// A URL stays counted in its mode's depth until [`complete`] is called
/// for it, so in-flight work keeps the scaler's view of the queue honest.
/// Dropping the backlog removes whatever is still counted.
///
/// [`complete`]: Backlog::complete
pub struct Backlog<'a> {
    queues: &'a ModeQueues,
    feedback: &'a FeedbackLoop,
    mode: ScrapeMode,
    enqueued_at: Instant,
    outstanding: AtomicUsize,
}

impl<'a> Backlog<'a> {
    pub fn enqueue(
        queues: &'a ModeQueues,
        feedback: &'a FeedbackLoop,
        mode: ScrapeMode,
        count: usize,
    ) -> Self {
        let depth = queues.add(mode, count);
        feedback.observe_queue_length(depth, mode);
        tracing::debug!(mode = %mode, count, depth, "URLs enqueued");
        Self {
            queues,
            feedback,
            mode,
            enqueued_at: Instant::now(),
            outstanding: AtomicUsize::new(count),
        }
    }

    /// URLs still counted against the mode.
    pub fn remaining(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Record that one URL has started, with its queue wait.
    ///
    /// The URL stays counted until [`complete`](Self::complete).
    pub fn dequeue(&self) -> QueueTicket {
        let wait = self.enqueued_at.elapsed();
        let depth = self.queues.depth(self.mode);
        self.feedback.observe_queue_wait(wait, self.mode);
        QueueTicket { wait, depth }
    }

    /// Record that one URL has finished. Returns the new mode depth.
    pub fn complete(&self) -> usize {
        self.release(1)
    }

    /// Stop counting up to `n` URLs, e.g. once another backlog has taken
    /// them over. Returns the new mode depth.
    pub fn release(&self, n: usize) -> usize {
        let taken = self.take(n);
        let depth = if taken > 0 {
            self.queues.sub(self.mode, taken)
        } else {
            self.queues.depth(self.mode)
        };
        self.feedback.observe_queue_length(depth, self.mode);
        depth
    }

    fn take(&self, n: usize) -> usize {
        match self
            .outstanding
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| {
                Some(left.saturating_sub(n))
            }) {
            Ok(previous) | Err(previous) => previous.min(n),
        }
    }
}

impl Drop for Backlog<'_> {
    fn drop(&mut self) {
        let left = std::mem::take(self.outstanding.get_mut());
        if left > 0 {
            let depth = self.queues.sub(self.mode, left);
            self.feedback.observe_queue_length(depth, self.mode);
        }
    }
}
