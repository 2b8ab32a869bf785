//! Ordered broadcast channel carrying packets to every node.
//!
//! One logical channel, one shared append-only log, N independent read
//! cursors: a `put` appends once and wakes every blocked subscriber, rather
//! than copying the payload per receiver. Every subscriber observes every
//! packet in global put order, with no loss and no per-subscriber
//! reordering.
//!
//! A transmission is delivered twice: immediately at `put` (start of
//! reception) and again after its time-on-air (end of reception). Both
//! deliveries carry the same shared record, so outcome flags set at the
//! start are visible at the end.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use super::kernel::{Sim, TaskId};
use super::types::MeshPacket;

struct Cursor {
    pos: usize,
    waiting: Option<TaskId>,
}

struct PipeState {
    log: Vec<Rc<MeshPacket>>,
    cursors: Vec<Cursor>,
}

#[derive(Clone)]
pub(crate) struct BroadcastPipe {
    sim: Sim,
    state: Rc<RefCell<PipeState>>,
}

impl BroadcastPipe {
    pub(crate) fn new(sim: &Sim) -> Self {
        BroadcastPipe {
            sim: sim.clone(),
            state: Rc::new(RefCell::new(PipeState {
                log: Vec::new(),
                cursors: Vec::new(),
            })),
        }
    }

    /// Open a new read cursor. Established at node creation and live for
    /// the whole run; only packets put after subscription are observed.
    pub(crate) fn subscribe(&self) -> PipeReceiver {
        let mut state = self.state.borrow_mut();
        let index = state.cursors.len();
        let pos = state.log.len();
        state.cursors.push(Cursor { pos, waiting: None });
        PipeReceiver {
            pipe: self.clone(),
            index,
        }
    }

    /// Publish a transmission: deliver its start-of-reception now and
    /// schedule the end-of-reception delivery after its time-on-air.
    pub(crate) fn put(&self, packet: Rc<MeshPacket>) {
        self.deliver(packet.clone());
        let pipe = self.clone();
        let time_on_air = packet.time_on_air;
        self.sim.spawn(async move {
            pipe.sim.sleep(time_on_air).await;
            pipe.deliver(packet);
        });
    }

    fn deliver(&self, packet: Rc<MeshPacket>) {
        let wakes: Vec<TaskId> = {
            let mut state = self.state.borrow_mut();
            state.log.push(packet);
            state
                .cursors
                .iter_mut()
                .filter_map(|cursor| cursor.waiting.take())
                .collect()
        };
        for task in wakes {
            self.sim.make_ready(task);
        }
    }
}

pub(crate) struct PipeReceiver {
    pipe: BroadcastPipe,
    index: usize,
}

impl PipeReceiver {
    /// Next packet on this cursor; suspends the calling activity until one
    /// is available.
    pub(crate) fn get(&self) -> PipeGet {
        PipeGet {
            pipe: self.pipe.clone(),
            index: self.index,
        }
    }
}

pub(crate) struct PipeGet {
    pipe: BroadcastPipe,
    index: usize,
}

impl Future for PipeGet {
    type Output = Rc<MeshPacket>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Rc<MeshPacket>> {
        let this = self.get_mut();
        let mut state = this.pipe.state.borrow_mut();
        let pos = state.cursors[this.index].pos;
        if pos < state.log.len() {
            let item = state.log[pos].clone();
            state.cursors[this.index].pos = pos + 1;
            Poll::Ready(item)
        } else {
            let task = this.pipe.sim.current_task();
            state.cursors[this.index].waiting = Some(task);
            Poll::Pending
        }
    }
}
