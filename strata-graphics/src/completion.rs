//! Deferred callback delivery.
//!
//! Asynchronous operations never invoke their callback from the registering
//! call. They enqueue a job that is run by the next [`crate::Device::tick`]
//! (or [`crate::Instance::process_events`]) in registration order.

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll, Waker},
};

/// How a queued job is finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Ready,
    /// The owner went away before the work completed.
    Lost,
}

pub(crate) type Job = Box<dyn FnOnce(Outcome) + Send>;

/// FIFO of jobs waiting for submitted work.
///
/// Submissions execute when they are made, so every queued job is ready by
/// the next tick. Jobs queued while a tick runs wait for the one after.
#[derive(Default)]
pub(crate) struct CompletionQueue {
    pending: VecDeque<Job>,
    /// Serial of the latest submission.
    submitted: u64,
}

impl CompletionQueue {
    pub fn push(&mut self, job: Job) {
        self.pending.push_back(job);
    }

    /// Records a new submission and returns its serial.
    pub fn advance(&mut self) -> u64 {
        self.submitted += 1;
        self.submitted
    }

    /// Takes every queued job, oldest first.
    pub fn take_all(&mut self) -> Vec<Job> {
        self.pending.drain(..).collect()
    }
}

//=============================================================================
// Oneshot
//=============================================================================

struct OneshotState<T> {
    value: Option<T>,
    waker: Option<Waker>,
}

/// Future resolved by the callback half of [`oneshot`].
///
/// The value only arrives when the owner of the operation is ticked, so pump
/// `Device::tick` before awaiting.
pub struct Completion<T> {
    state: Arc<Mutex<OneshotState<T>>>,
}

impl<T> Completion<T> {
    pub fn is_ready(&self) -> bool {
        self.state.lock().unwrap().value.is_some()
    }

    /// Takes the value without waiting.
    pub fn try_take(&self) -> Option<T> {
        self.state.lock().unwrap().value.take()
    }
}

impl<T> Future for Completion<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut state = self.state.lock().unwrap();
        match state.value.take() {
            Some(value) => Poll::Ready(value),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Creates a callback and the future it resolves.
///
/// ```ignore
/// let (callback, done) = strata_graphics::oneshot();
/// queue.on_submitted_work_done(callback);
/// device.tick();
/// pollster::block_on(done).unwrap();
/// ```
pub fn oneshot<T: Send + 'static>() -> (impl FnOnce(T) + Send + 'static, Completion<T>) {
    let state = Arc::new(Mutex::new(OneshotState {
        value: None,
        waker: None,
    }));
    let sender = Arc::clone(&state);
    let callback = move |value: T| {
        let waker = {
            let mut state = sender.lock().unwrap();
            state.value = Some(value);
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    };
    (callback, Completion { state })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_run_in_fifo_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = CompletionQueue::default();
        for i in 0..3 {
            let log = Arc::clone(&log);
            queue.push(Box::new(move |outcome| {
                log.lock().unwrap().push((i, outcome));
            }));
            assert_eq!(queue.advance(), i as u64 + 1);
        }
        let jobs = queue.take_all();
        assert_eq!(jobs.len(), 3);
        assert!(queue.take_all().is_empty());
        for job in jobs {
            job(Outcome::Ready);
        }
        assert_eq!(
            *log.lock().unwrap(),
            vec![(0, Outcome::Ready), (1, Outcome::Ready), (2, Outcome::Ready)]
        );
    }

    #[test]
    fn oneshot_resolves_after_callback() {
        let (callback, done) = oneshot::<u32>();
        assert!(!done.is_ready());
        callback(7);
        assert!(done.is_ready());
        assert_eq!(pollster::block_on(done), 7);
    }
}
