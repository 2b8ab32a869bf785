//! Cooperative discrete-event kernel on a virtual clock.
//!
//! Activities are plain `async` blocks driven by a single-threaded executor.
//! The clock only advances when no activity is runnable, jumping straight to
//! the earliest pending timer. Activities suspend exclusively at explicit
//! points (timed wait, resource acquisition, blocking channel receive), so no
//! two activities ever observe a partial mutation of shared state.
//!
//! Determinism: timers are ordered by `(deadline, registration sequence)` and
//! runnable activities resume in FIFO submission order, so two runs with the
//! same seed interleave identically.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

pub(crate) type TaskId = usize;

/// Timer queue entry. Field order matters: the derived `Ord` compares the
/// deadline first and breaks ties by registration sequence (FIFO).
#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct TimerEntry {
    at: Duration,
    seq: u64,
    task: TaskId,
}

struct SimInner {
    now: Duration,
    horizon: Duration,
    next_task_id: TaskId,
    // Suspended activities, keyed by task id. An entry is removed while its
    // future is being polled and re-inserted only if it stays pending.
    tasks: HashMap<TaskId, Pin<Box<dyn Future<Output = ()>>>>,
    ready: VecDeque<TaskId>,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    timer_seq: u64,
    // Task currently being polled; kernel futures read this to learn who to
    // wake later.
    current: Option<TaskId>,
}

/// Handle to the simulation kernel. Cheap to clone; all clones share one
/// virtual clock and scheduler state.
#[derive(Clone)]
pub(crate) struct Sim {
    inner: Rc<RefCell<SimInner>>,
}

impl Sim {
    pub(crate) fn new(horizon: Duration) -> Self {
        Sim {
            inner: Rc::new(RefCell::new(SimInner {
                now: Duration::ZERO,
                horizon,
                next_task_id: 0,
                tasks: HashMap::new(),
                ready: VecDeque::new(),
                timers: BinaryHeap::new(),
                timer_seq: 0,
                current: None,
            })),
        }
    }

    /// Current virtual time, measured from run start.
    pub(crate) fn now(&self) -> Duration {
        self.inner.borrow().now
    }

    pub(crate) fn horizon(&self) -> Duration {
        self.inner.borrow().horizon
    }

    /// Submit a concurrent activity. It first runs when the scheduler next
    /// drains its ready queue, after activities submitted before it.
    pub(crate) fn spawn(&self, activity: impl Future<Output = ()> + 'static) {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_task_id;
        inner.next_task_id += 1;
        inner.tasks.insert(id, Box::pin(activity));
        inner.ready.push_back(id);
    }

    /// Suspend the calling activity for `duration` of virtual time.
    pub(crate) fn sleep(&self, duration: Duration) -> Sleep {
        Sleep {
            sim: self.clone(),
            duration,
            deadline: None,
        }
    }

    /// Drive the simulation until the next timer would fire at or past the
    /// horizon, or no work remains.
    pub(crate) fn run(&self) {
        loop {
            loop {
                let next = self.inner.borrow_mut().ready.pop_front();
                match next {
                    Some(task) => self.poll_task(task),
                    None => break,
                }
            }
            let due = {
                let mut inner = self.inner.borrow_mut();
                match inner.timers.pop() {
                    Some(Reverse(entry)) => {
                        if entry.at >= inner.horizon {
                            break;
                        }
                        inner.now = entry.at;
                        inner.ready.push_back(entry.task);
                        true
                    }
                    None => break,
                }
            };
            if !due {
                break;
            }
        }
        // Drop leftover activities outside the borrow: their futures hold
        // kernel handles, and freeing them here breaks the reference cycle
        // with the task map.
        let leftover = {
            let mut inner = self.inner.borrow_mut();
            mem::take(&mut inner.tasks)
        };
        drop(leftover);
    }

    fn poll_task(&self, task: TaskId) {
        // A timer may outlive its activity; ignore wakes for finished tasks.
        let Some(mut future) = self.inner.borrow_mut().tasks.remove(&task) else {
            return;
        };
        self.inner.borrow_mut().current = Some(task);
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        if future.as_mut().poll(&mut cx).is_pending() {
            self.inner.borrow_mut().tasks.insert(task, future);
        }
        self.inner.borrow_mut().current = None;
    }

    /// Id of the activity currently being polled. Kernel-style futures in
    /// sibling modules use this to register who to wake.
    pub(crate) fn current_task(&self) -> TaskId {
        self.inner
            .borrow()
            .current
            .expect("kernel future polled outside a spawned activity")
    }

    fn register_timer(&self, at: Duration, task: TaskId) {
        let mut inner = self.inner.borrow_mut();
        let seq = inner.timer_seq;
        inner.timer_seq += 1;
        inner.timers.push(Reverse(TimerEntry { at, seq, task }));
    }

    pub(crate) fn make_ready(&self, task: TaskId) {
        self.inner.borrow_mut().ready.push_back(task);
    }
}

/// Timed suspension. Registers a timer on first poll and completes once the
/// clock has reached the deadline.
pub(crate) struct Sleep {
    sim: Sim,
    duration: Duration,
    deadline: Option<Duration>,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        match this.deadline {
            None => {
                let at = this.sim.now() + this.duration;
                let task = this.sim.current_task();
                this.sim.register_timer(at, task);
                this.deadline = Some(at);
                Poll::Pending
            }
            Some(at) => {
                if this.sim.now() >= at {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            }
        }
    }
}

struct ResourceState {
    busy: bool,
    waiters: VecDeque<TaskId>,
}

/// Capacity-1 exclusive resource with FIFO-queued acquisition. Models a
/// node's own transmitter: it serializes that node's concurrent send
/// attempts and nothing else.
#[derive(Clone)]
pub(crate) struct Resource {
    sim: Sim,
    state: Rc<RefCell<ResourceState>>,
}

impl Resource {
    pub(crate) fn new(sim: &Sim) -> Self {
        Resource {
            sim: sim.clone(),
            state: Rc::new(RefCell::new(ResourceState {
                busy: false,
                waiters: VecDeque::new(),
            })),
        }
    }

    pub(crate) fn acquire(&self) -> Acquire {
        Acquire {
            resource: self.clone(),
            queued: false,
        }
    }
}

pub(crate) struct Acquire {
    resource: Resource,
    queued: bool,
}

impl Future for Acquire {
    type Output = ResourceGuard;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<ResourceGuard> {
        let this = self.get_mut();
        let me = this.resource.sim.current_task();
        let mut state = this.resource.state.borrow_mut();
        if !this.queued {
            if !state.busy && state.waiters.is_empty() {
                state.busy = true;
                drop(state);
                return Poll::Ready(ResourceGuard {
                    resource: this.resource.clone(),
                });
            }
            state.waiters.push_back(me);
            this.queued = true;
            return Poll::Pending;
        }
        // Only the head of the queue may take a freed resource, so later
        // arrivals cannot overtake earlier ones.
        if !state.busy && state.waiters.front() == Some(&me) {
            state.waiters.pop_front();
            state.busy = true;
            drop(state);
            return Poll::Ready(ResourceGuard {
                resource: this.resource.clone(),
            });
        }
        Poll::Pending
    }
}

/// Releases the resource on drop and wakes the next queued waiter.
pub(crate) struct ResourceGuard {
    resource: Resource,
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        let mut state = self.resource.state.borrow_mut();
        state.busy = false;
        let next = state.waiters.front().copied();
        drop(state);
        if let Some(task) = next {
            self.resource.sim.make_ready(task);
        }
    }
}
