//! Thread-backed implementation of the [`Scheduler`] port.
//!
//! Each scheduled task gets one timer thread that sleeps on a condvar
//! until the deadline or cancellation. Cancellation succeeds only while
//! the task has not started; the cancel/fire race is decided under the
//! task's state lock.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use ports::secondary::scheduler::{ScheduledTask, Scheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Pending,
    Cancelled,
    Running,
    Done,
}

struct TaskShared {
    state: Mutex<TaskState>,
    wakeup: Condvar,
}

pub struct ThreadScheduler;

impl Scheduler for ThreadScheduler {
    fn schedule(
        &self,
        delay: Duration,
        task: Box<dyn FnOnce() + Send>,
    ) -> Box<dyn ScheduledTask> {
        let shared = Arc::new(TaskShared {
            state: Mutex::new(TaskState::Pending),
            wakeup: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let spawned = std::thread::Builder::new()
            .name("audit-signature-timer".to_string())
            .spawn(move || run_timer(&thread_shared, delay, task));

        if let Err(e) = spawned {
            tracing::error!(error = %e, "cannot spawn signature timer thread");
            // The task is lost; report it as done so the writer re-arms
            // on its next write instead of waiting forever.
            if let Ok(mut state) = shared.state.lock() {
                *state = TaskState::Done;
            }
        }

        Box::new(ThreadTaskHandle(shared))
    }
}

fn run_timer(shared: &TaskShared, delay: Duration, task: Box<dyn FnOnce() + Send>) {
    let deadline = Instant::now() + delay;
    {
        let Ok(mut state) = shared.state.lock() else {
            return;
        };
        loop {
            match *state {
                TaskState::Cancelled => return,
                TaskState::Pending => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    state = match shared.wakeup.wait_timeout(state, deadline - now) {
                        Ok((state, _)) => state,
                        Err(_) => return,
                    };
                }
                TaskState::Running | TaskState::Done => return,
            }
        }
        *state = TaskState::Running;
    }

    task();

    if let Ok(mut state) = shared.state.lock() {
        *state = TaskState::Done;
    }
}

struct ThreadTaskHandle(Arc<TaskShared>);

impl ScheduledTask for ThreadTaskHandle {
    fn cancel(&self) -> bool {
        let Ok(mut state) = self.0.state.lock() else {
            return false;
        };
        if *state == TaskState::Pending {
            *state = TaskState::Cancelled;
            self.0.wakeup.notify_all();
            true
        } else {
            false
        }
    }

    fn is_done(&self) -> bool {
        self.0
            .state
            .lock()
            .map(|state| matches!(*state, TaskState::Done | TaskState::Cancelled))
            .unwrap_or(true)
    }
}
