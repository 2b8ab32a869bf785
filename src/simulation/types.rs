//! Data model for one simulation run.
//!
//! Contains the message and packet records shared across node engines, the
//! per-node state bundle, and the per-run statistics handed to the batch
//! driver. Packet records are immutable after construction except for the
//! designated outcome cells; all sharing is `Rc` under the single-threaded
//! kernel, so no locking is involved.

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::Duration;

use rand::rngs::StdRng;

use super::geometry::{self, Position};
use super::signal_calculations::{
    LoraParameters, PathLossParameters, calculate_air_time, calculate_rssi, receiver_sensitivity,
};

/// Unicast target or the flood-to-everyone sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Destination {
    Broadcast,
    Node(usize),
}

/// Single-owner monotonic sequence counter, shared by handle with every
/// node engine. Safe without locks under cooperative scheduling.
#[derive(Default)]
pub(crate) struct SequenceCounter(Cell<u32>);

impl SequenceCounter {
    pub(crate) fn next(&self) -> u32 {
        let seq = self.0.get() + 1;
        self.0.set(seq);
        seq
    }

    /// Number of sequence numbers handed out so far.
    pub(crate) fn issued(&self) -> u32 {
        self.0.get()
    }
}

/// An application-level message as generated at its origin. One record per
/// sequence number; the transmission attempts are separate [`MeshPacket`]s.
#[derive(Debug, Clone)]
pub(crate) struct MeshMessage {
    pub(crate) seq: u32,
    pub(crate) origin: usize,
    pub(crate) dest: Destination,
    pub(crate) gen_time: Duration,
}

/// Reliability bookkeeping for one originated message, shared by handle
/// with every attempt of its flood. A relay overhearing a rebroadcast marks
/// the acknowledged flag here, which the originator's retry loop observes
/// directly.
pub(crate) struct RetryState {
    pub(crate) min_remaining: Cell<u32>,
    pub(crate) acknowledged: Cell<bool>,
}

impl RetryState {
    pub(crate) fn new(max_retransmission: u32) -> Self {
        RetryState {
            min_remaining: Cell::new(max_retransmission),
            acknowledged: Cell::new(false),
        }
    }
}

/// Immutable per-node facts fixed at placement time.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NodeProfile {
    pub(crate) id: usize,
    pub(crate) position: Position,
    pub(crate) tx_power_dbm: f32,
    pub(crate) antenna_gain_dbi: f32,
    pub(crate) is_router: bool,
    pub(crate) is_repeater: bool,
    pub(crate) hop_limit: u32,
}

/// Constructor arguments for one transmission attempt.
pub(crate) struct PacketSpec {
    pub(crate) origin: usize,
    pub(crate) relayer: usize,
    pub(crate) dest: Destination,
    pub(crate) payload_size: usize,
    pub(crate) seq: u32,
    pub(crate) gen_time: Duration,
    pub(crate) want_ack: bool,
    pub(crate) is_ack: bool,
    pub(crate) request_id: Option<u32>,
    pub(crate) hop_limit: u32,
    pub(crate) retransmissions: u32,
    pub(crate) retry_state: Rc<RetryState>,
}

/// One transmission attempt. Retries and rebroadcasts of the same message
/// are new records sharing the sequence number and retry state.
///
/// The per-node outcome arrays are sized from the live node count at
/// construction and indexed by node id:
/// - `sensed_by`: the transmission reaches this receiver at all
/// - `collided_at`: reached it but overlapped undecodably (implies sensed)
/// - `on_air_to`: start-of-reception still pending at this receiver
/// - `received_at`: successfully decoded
pub(crate) struct MeshPacket {
    pub(crate) seq: u32,
    pub(crate) origin: usize,
    pub(crate) relayer: usize,
    pub(crate) dest: Destination,
    pub(crate) payload_size: usize,
    pub(crate) gen_time: Duration,
    pub(crate) want_ack: bool,
    pub(crate) is_ack: bool,
    pub(crate) request_id: Option<u32>,
    pub(crate) hop_limit: u32,
    pub(crate) retransmissions: u32,
    pub(crate) retry_state: Rc<RetryState>,

    pub(crate) time_on_air: Duration,
    pub(crate) start_time: Cell<Option<Duration>>,
    pub(crate) end_time: Cell<Option<Duration>>,
    pub(crate) acknowledged: Cell<bool>,

    pub(crate) sensed_by: Box<[Cell<bool>]>,
    pub(crate) collided_at: Box<[Cell<bool>]>,
    pub(crate) on_air_to: Box<[Cell<bool>]>,
    pub(crate) received_at: Box<[Cell<bool>]>,
    /// RSSI stamped per receiver at construction, including antenna gains
    /// and a fresh shadowing sample per attempt.
    pub(crate) rssi_at: Box<[f32]>,
}

impl MeshPacket {
    /// Build an attempt and stamp its propagation outcome: for every node,
    /// sample the link RSSI from the relaying node's position and mark the
    /// receiver sensed when it reaches the receiver sensitivity.
    pub(crate) fn new(
        spec: PacketSpec,
        nodes: &[NodeProfile],
        lora: &LoraParameters,
        path_loss: &PathLossParameters,
        rng: &mut StdRng,
    ) -> Rc<MeshPacket> {
        let count = nodes.len();
        let tx = &nodes[spec.relayer];
        let sensitivity = receiver_sensitivity(lora, path_loss);

        let mut sensed = Vec::with_capacity(count);
        let mut rssi_at = Vec::with_capacity(count);
        for rx in nodes {
            let dist = geometry::distance(&tx.position, &rx.position);
            let tx_dbm = tx.tx_power_dbm + tx.antenna_gain_dbi + rx.antenna_gain_dbi;
            let rssi = calculate_rssi(dist, tx_dbm, path_loss, rng);
            sensed.push(Cell::new(rssi >= sensitivity));
            rssi_at.push(rssi);
        }

        Rc::new(MeshPacket {
            time_on_air: Duration::from_secs_f32(calculate_air_time(lora, spec.payload_size)),
            start_time: Cell::new(None),
            end_time: Cell::new(None),
            acknowledged: Cell::new(false),
            sensed_by: sensed.into_boxed_slice(),
            collided_at: vec![Cell::new(false); count].into_boxed_slice(),
            on_air_to: vec![Cell::new(true); count].into_boxed_slice(),
            received_at: vec![Cell::new(false); count].into_boxed_slice(),
            rssi_at: rssi_at.into_boxed_slice(),
            seq: spec.seq,
            origin: spec.origin,
            relayer: spec.relayer,
            dest: spec.dest,
            payload_size: spec.payload_size,
            gen_time: spec.gen_time,
            want_ack: spec.want_ack,
            is_ack: spec.is_ack,
            request_id: spec.request_id,
            hop_limit: spec.hop_limit,
            retransmissions: spec.retransmissions,
            retry_state: spec.retry_state,
        })
    }
}

/// Mutable per-node runtime state shared between the node's generator,
/// transmit, and receive activities.
pub(crate) struct NodeState {
    pub(crate) profile: NodeProfile,
    /// Lowest hop limit observed per sequence number; non-increasing for a
    /// fixed sequence over the node's lifetime. Seeded at `hop_limit + 1`
    /// when first touched by the node's own transmit path.
    pub(crate) least_received_hop_limit: HashMap<u32, u32>,
    /// Receptions currently in progress. Decrements saturate at zero; a
    /// missing marker is deliberately ignored rather than recovered from.
    pub(crate) active_receptions: u32,
    pub(crate) transmitting: bool,
    /// Attempts this node created (originated, relayed, or ACKs). Aborted
    /// attempts are removed again.
    pub(crate) attempts: Vec<Rc<MeshPacket>>,
    /// Sequence numbers this node already answered with an explicit ACK.
    pub(crate) acked_seqs: HashSet<u32>,
    pub(crate) packets_sent: u64,
    pub(crate) useful_packets: u64,
    pub(crate) tx_air_utilization: Duration,
    pub(crate) air_utilization: Duration,
}

impl NodeState {
    pub(crate) fn new(profile: NodeProfile) -> Self {
        NodeState {
            profile,
            least_received_hop_limit: HashMap::new(),
            active_receptions: 0,
            transmitting: false,
            attempts: Vec::new(),
            acked_seqs: HashSet::new(),
            packets_sent: 0,
            useful_packets: 0,
            tx_air_utilization: Duration::ZERO,
            air_utilization: Duration::ZERO,
        }
    }
}

/// Read-only outcome of one repetition, reduced from the packet/message
/// logs and per-node counters once the horizon is reached.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RunStats {
    pub(crate) nr_nodes: usize,
    pub(crate) nr_messages: u32,
    pub(crate) nr_packets_sent: u64,
    pub(crate) nr_sensed: u64,
    pub(crate) nr_collisions: u64,
    pub(crate) nr_received: u64,
    pub(crate) nr_useful: u64,
    pub(crate) delays_ms: Vec<f64>,
    pub(crate) tx_air_ms_per_node: Vec<f64>,
    pub(crate) air_ms_per_node: Vec<f64>,
}
