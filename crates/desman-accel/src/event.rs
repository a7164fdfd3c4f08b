use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

// Event — completion handle for one asynchronous device operation
//
// An Event is created at enqueue time and signaled exactly once, by the
// device worker, when the operation finishes. After the signal its
// wall-clock span is queryable. Events are attached to later commands as
// dependencies; the worker waits on them before starting a kernel.

#[derive(Default)]
struct EventState {
    signaled: bool,
    start: Option<Instant>,
    end: Option<Instant>,
}

struct EventInner {
    state: Mutex<EventState>,
    cond: Condvar,
}

/// Completion handle of an asynchronous device operation.
///
/// Cloning produces another handle to the same underlying operation; all
/// clones observe the same signal.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    /// A fresh, unsignaled event.
    pub fn new() -> Self {
        Event {
            inner: Arc::new(EventInner {
                state: Mutex::new(EventState::default()),
                cond: Condvar::new(),
            }),
        }
    }

    /// An event that is already signaled with a zero span. Used for tensors
    /// whose contents require no device work (identity crossings, freshly
    /// bound results before their write is enqueued).
    pub fn ready() -> Self {
        let now = Instant::now();
        Event {
            inner: Arc::new(EventInner {
                state: Mutex::new(EventState {
                    signaled: true,
                    start: Some(now),
                    end: Some(now),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Whether the operation has completed.
    pub fn is_signaled(&self) -> bool {
        self.inner.state.lock().unwrap().signaled
    }

    /// Block the calling thread until the operation completes. Returns
    /// immediately if it already has.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock().unwrap();
        while !state.signaled {
            state = self.inner.cond.wait(state).unwrap();
        }
    }

    /// Wall-clock span of the device-side execution. `None` until signaled.
    pub fn span(&self) -> Option<Duration> {
        let state = self.inner.state.lock().unwrap();
        match (state.signaled, state.start, state.end) {
            (true, Some(s), Some(e)) => Some(e.duration_since(s)),
            _ => None,
        }
    }

    /// Whether two handles refer to the same underlying operation.
    pub fn same_event(&self, other: &Event) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Stamp the execution start. Called by the worker just before the
    /// kernel runs.
    pub(crate) fn mark_start(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.start = Some(Instant::now());
    }

    /// Stamp the execution end and signal. Signaling twice is a logic error.
    pub(crate) fn complete(&self) {
        let mut state = self.inner.state.lock().unwrap();
        debug_assert!(!state.signaled, "event signaled twice");
        state.end = Some(Instant::now());
        state.signaled = true;
        self.inner.cond.notify_all();
    }
}

impl Default for Event {
    fn default() -> Self {
        Event::new()
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_signal_once() {
        let ev = Event::new();
        assert!(!ev.is_signaled());
        assert!(ev.span().is_none());
        ev.mark_start();
        ev.complete();
        assert!(ev.is_signaled());
        assert!(ev.span().is_some());
    }

    #[test]
    fn test_ready_is_signaled() {
        let ev = Event::ready();
        assert!(ev.is_signaled());
        assert_eq!(ev.span(), Some(Duration::ZERO));
        ev.wait(); // must not block
    }

    #[test]
    fn test_wait_across_threads() {
        let ev = Event::new();
        let signaler = ev.clone();
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signaler.mark_start();
            signaler.complete();
        });
        ev.wait();
        assert!(ev.is_signaled());
        h.join().unwrap();
    }

    #[test]
    fn test_clone_identity() {
        let a = Event::new();
        let b = a.clone();
        assert!(a.same_event(&b));
        assert!(!a.same_event(&Event::new()));
    }
}
