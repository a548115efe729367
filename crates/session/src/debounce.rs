//! Trailing-edge debounce on the tokio timer.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct DebounceState {
    deadline: Option<Instant>,
    task_running: bool,
}

/// Runs an action once a quiet period has passed since the last trigger.
///
/// Repeated triggers push the deadline out; a single timer task serves all
/// of them. Outside a tokio runtime the action runs synchronously.
pub struct Debouncer {
    delay: Duration,
    state: Arc<Mutex<DebounceState>>,
    action: Arc<dyn Fn() + Send + Sync>,
}

impl std::fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer")
            .field("delay", &self.delay)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl Debouncer {
    pub fn new(delay: Duration, action: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            delay,
            state: Arc::new(Mutex::new(DebounceState::default())),
            action: Arc::new(action),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn trigger(&self) {
        let Ok(handle) = Handle::try_current() else {
            self.state.lock().deadline = None;
            (self.action)();
            return;
        };

        let mut state = self.state.lock();
        state.deadline = Some(Instant::now() + self.delay);
        if state.task_running {
            return;
        }
        state.task_running = true;
        drop(state);

        let state = Arc::clone(&self.state);
        let action = Arc::clone(&self.action);
        handle.spawn(async move {
            loop {
                let next = {
                    let mut st = state.lock();
                    match st.deadline {
                        None => {
                            st.task_running = false;
                            return;
                        }
                        Some(deadline) if deadline <= Instant::now() => {
                            st.deadline = None;
                            st.task_running = false;
                            break;
                        }
                        Some(deadline) => deadline,
                    }
                };
                tokio::time::sleep_until(next).await;
            }
            action();
        });
    }

    /// Drops a pending run, if any.
    pub fn cancel(&self) {
        self.state.lock().deadline = None;
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().deadline.is_some()
    }
}
