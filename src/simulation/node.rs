//! Per-node protocol engine.
//!
//! Each node runs as a bundle of concurrent activities on the shared
//! virtual clock:
//! - a message generator with the reliable-delivery retry loop,
//! - one transmit activity per packet attempt, contending on the node's
//!   own transmitter gate with listen-before-talk,
//! - a perpetual receive loop consuming the broadcast channel and deciding
//!   between ACK synthesis and flooding rebroadcast.
//!
//! Shared state is handed around by `Rc`; borrows are never held across a
//! suspension point.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use log::debug;
use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::Exp;

use super::broadcast::{BroadcastPipe, PipeReceiver};
use super::kernel::{Resource, Sim};
use super::signal_calculations::{
    LoraParameters, PathLossParameters, calculate_air_time, check_collision, is_channel_active,
    retransmission_timeout, transmit_backoff,
};
use super::types::{
    Destination, MeshMessage, MeshPacket, NodeProfile, NodeState, PacketSpec, RetryState,
    SequenceCounter,
};

/// Protocol parameters shared by every node engine in one run.
pub(crate) struct RunParams {
    pub(crate) lora: LoraParameters,
    pub(crate) path_loss: PathLossParameters,
    /// Mean message inter-arrival time per node, in milliseconds.
    pub(crate) period_ms: f64,
    pub(crate) payload_size: usize,
    pub(crate) ack_size: usize,
    pub(crate) max_retransmission: u32,
    /// Unicast mode picks a uniformly random other node per message;
    /// otherwise every message floods to the broadcast sentinel.
    pub(crate) unicast: bool,
    pub(crate) interference_level: f64,
    pub(crate) collision_due_to_interference: bool,
}

/// Shared handles of one simulation run: the kernel, the seeded RNG, the
/// broadcast channel, and the global logs every engine appends to.
#[derive(Clone)]
pub(crate) struct World {
    pub(crate) sim: Sim,
    pub(crate) params: Rc<RunParams>,
    pub(crate) rng: Rc<RefCell<StdRng>>,
    pub(crate) seq: Rc<SequenceCounter>,
    pub(crate) pipe: BroadcastPipe,
    pub(crate) profiles: Rc<Vec<NodeProfile>>,
    /// Global log of every attempt that was created and not aborted.
    pub(crate) packets: Rc<RefCell<Vec<Rc<MeshPacket>>>>,
    /// Per-receiver log of transmissions that survived the collision check
    /// there; later arrivals are judged against these.
    pub(crate) packets_at: Rc<Vec<RefCell<Vec<Rc<MeshPacket>>>>>,
    pub(crate) messages: Rc<RefCell<Vec<MeshMessage>>>,
    pub(crate) delays: Rc<RefCell<Vec<Duration>>>,
}

impl World {
    fn build_packet(&self, spec: PacketSpec) -> Rc<MeshPacket> {
        let mut rng = self.rng.borrow_mut();
        MeshPacket::new(
            spec,
            &self.profiles,
            &self.params.lora,
            &self.params.path_loss,
            &mut rng,
        )
    }

    /// Log a fresh attempt and hand it to its own transmit activity.
    fn log_and_transmit(
        &self,
        state: &Rc<RefCell<NodeState>>,
        transmitter: &Resource,
        packet: Rc<MeshPacket>,
    ) {
        self.packets.borrow_mut().push(packet.clone());
        state.borrow_mut().attempts.push(packet.clone());
        self.sim.spawn(transmit(
            self.clone(),
            state.clone(),
            transmitter.clone(),
            packet,
        ));
    }
}

/// Create a node's state and spawn its activities. Repeaters do not
/// generate traffic of their own; everyone receives.
pub(crate) fn start_node(world: &World, profile: NodeProfile) -> Rc<RefCell<NodeState>> {
    let state = Rc::new(RefCell::new(NodeState::new(profile)));
    let transmitter = Resource::new(&world.sim);
    let receiver = world.pipe.subscribe();
    if !profile.is_repeater {
        world.sim.spawn(generate_messages(
            world.clone(),
            state.clone(),
            transmitter.clone(),
        ));
    }
    world.sim.spawn(receive_loop(
        world.clone(),
        state.clone(),
        transmitter,
        receiver,
    ));
    state
}

/// Message generator plus the reliable-delivery loop. Generation stops
/// permanently once the next message could not drain its worst-case flood
/// before the horizon; the retry loop of the current message still runs to
/// completion.
async fn generate_messages(world: World, state: Rc<RefCell<NodeState>>, transmitter: Resource) {
    let profile = state.borrow().profile;
    let node_id = profile.id;
    let flood_drain = Duration::from_secs_f32(
        profile.hop_limit as f32 * calculate_air_time(&world.params.lora, world.params.payload_size),
    );
    let inter_arrival = Exp::new(1.0 / world.params.period_ms).expect("validated period");

    loop {
        let next_gen_ms = world.rng.borrow_mut().sample(inter_arrival);
        let next_gen = Duration::from_secs_f64(next_gen_ms / 1000.0);
        if world.sim.now() + next_gen + flood_drain >= world.sim.horizon() {
            // A flood started now could not finish in time.
            break;
        }
        world.sim.sleep(next_gen).await;

        let dest = if world.params.unicast {
            let others = world.profiles.len() - 1;
            let mut pick = world.rng.borrow_mut().gen_range(0..others);
            if pick >= node_id {
                pick += 1;
            }
            Destination::Node(pick)
        } else {
            Destination::Broadcast
        };

        let seq = world.seq.next();
        let gen_time = world.sim.now();
        let retry_state = Rc::new(RetryState::new(world.params.max_retransmission));
        world.messages.borrow_mut().push(MeshMessage {
            seq,
            origin: node_id,
            dest,
            gen_time,
        });
        let packet = world.build_packet(PacketSpec {
            origin: node_id,
            relayer: node_id,
            dest,
            payload_size: world.params.payload_size,
            seq,
            gen_time,
            want_ack: true,
            is_ack: false,
            request_id: None,
            hop_limit: profile.hop_limit,
            retransmissions: world.params.max_retransmission,
            retry_state: retry_state.clone(),
        });
        debug!(
            "t={}ms node {} generated message {} to {:?}",
            gen_time.as_millis(),
            node_id,
            seq,
            dest
        );
        world.log_and_transmit(&state, &transmitter, packet);

        // Reliable delivery: re-send with the same sequence number until an
        // acknowledgment is observed or the budget runs out.
        loop {
            let timeout = {
                let mut rng = world.rng.borrow_mut();
                retransmission_timeout(
                    &mut rng,
                    &world.params.lora,
                    world.params.payload_size,
                    retry_state.min_remaining.get(),
                    world.params.max_retransmission,
                )
            };
            world.sim.sleep(timeout).await;

            if retry_state.acknowledged.get() {
                debug!("node {} received ACK on message {}", node_id, seq);
                break;
            }
            let remaining = retry_state.min_remaining.get();
            if remaining == 0 {
                debug!(
                    "t={}ms node {} reliable send of {} failed",
                    world.sim.now().as_millis(),
                    node_id,
                    seq
                );
                break;
            }
            retry_state.min_remaining.set(remaining - 1);
            let retry = world.build_packet(PacketSpec {
                origin: node_id,
                relayer: node_id,
                dest,
                payload_size: world.params.payload_size,
                seq,
                gen_time,
                want_ack: true,
                is_ack: false,
                request_id: None,
                hop_limit: profile.hop_limit,
                retransmissions: remaining - 1,
                retry_state: retry_state.clone(),
            });
            debug!(
                "t={}ms node {} retransmits {} ({} budget left)",
                world.sim.now().as_millis(),
                node_id,
                seq,
                remaining - 1
            );
            world.log_and_transmit(&state, &transmitter, retry);
        }
    }
}

/// One transmission attempt: acquire the node's own transmitter gate, wait
/// out listen-before-talk, then either broadcast or silently abort when the
/// attempt was superseded by an observed acknowledgment.
pub(crate) async fn transmit(
    world: World,
    state: Rc<RefCell<NodeState>>,
    transmitter: Resource,
    packet: Rc<MeshPacket>,
) {
    let profile = state.borrow().profile;
    let node_id = profile.id;
    let _gate = transmitter.acquire().await;

    // Listen-before-talk: redraw the backoff while this node is receiving,
    // transmitting, or the channel is sensed busy. Bounded only by the
    // simulation horizon.
    loop {
        let wait = {
            let mut rng = world.rng.borrow_mut();
            transmit_backoff(&mut rng, profile.is_router, &world.params.lora)
        };
        world.sim.sleep(wait).await;
        let engaged = {
            let st = state.borrow();
            st.active_receptions > 0 || st.transmitting
        };
        let busy = engaged || {
            let mut rng = world.rng.borrow_mut();
            let packets = world.packets.borrow();
            is_channel_active(
                node_id,
                world.sim.now(),
                &packets,
                world.params.interference_level,
                &mut rng,
            )
        };
        if !busy {
            break;
        }
        debug!(
            "t={}ms node {} found the channel busy, backing off",
            world.sim.now().as_millis(),
            node_id
        );
    }

    // A copy of this sequence with an equal-or-lower hop limit was already
    // overheard: the flood moved on without us, drop the attempt.
    let superseded = {
        let mut st = state.borrow_mut();
        let least = st
            .least_received_hop_limit
            .entry(packet.seq)
            .or_insert(packet.hop_limit + 1);
        *least <= packet.hop_limit
    };
    if superseded {
        debug!(
            "t={}ms node {} observed an ACK meanwhile, aborting {}",
            world.sim.now().as_millis(),
            node_id,
            packet.seq
        );
        world.packets.borrow_mut().retain(|p| !Rc::ptr_eq(p, &packet));
        state.borrow_mut().attempts.retain(|p| !Rc::ptr_eq(p, &packet));
        return;
    }

    let now = world.sim.now();
    packet.start_time.set(Some(now));
    packet.end_time.set(Some(now + packet.time_on_air));
    debug!(
        "t={}ms node {} started low level send {} hop_limit {} budget {} original tx {}",
        now.as_millis(),
        node_id,
        packet.seq,
        packet.hop_limit,
        packet.retransmissions,
        packet.origin
    );
    {
        let mut st = state.borrow_mut();
        st.packets_sent += 1;
        st.tx_air_utilization += packet.time_on_air;
        st.air_utilization += packet.time_on_air;
    }

    // Propagation stamping: judge the collision outcome at every receiver
    // that senses this transmission, then put it on the channel.
    for rx in 0..world.profiles.len() {
        if !packet.sensed_by[rx].get() {
            continue;
        }
        let survived = {
            let mut rng = world.rng.borrow_mut();
            let in_flight = world.packets_at[rx].borrow();
            check_collision(
                &packet,
                rx,
                now,
                &in_flight,
                world.params.collision_due_to_interference,
                world.params.interference_level,
                &mut rng,
            )
        };
        if survived {
            world.packets_at[rx].borrow_mut().push(packet.clone());
        }
    }
    world.pipe.put(packet.clone());

    state.borrow_mut().transmitting = true;
    world.sim.sleep(packet.time_on_air).await;
    state.borrow_mut().transmitting = false;
}

/// Perpetual receive loop: every packet on the channel is delivered twice,
/// once at transmission start and once at its end.
async fn receive_loop(
    world: World,
    state: Rc<RefCell<NodeState>>,
    transmitter: Resource,
    receiver: PipeReceiver,
) {
    let node_id = state.borrow().profile.id;
    loop {
        let p = receiver.get().await;

        if p.sensed_by[node_id].get() && !p.collided_at[node_id].get() && p.on_air_to[node_id].get()
        {
            // Start of reception.
            let mut st = state.borrow_mut();
            if !st.transmitting {
                p.on_air_to[node_id].set(false);
                st.active_receptions += 1;
                debug!(
                    "t={}ms node {} started receiving {} from {}",
                    world.sim.now().as_millis(),
                    node_id,
                    p.seq,
                    p.relayer
                );
            } else {
                // Half-duplex: a node cannot sense the channel while its own
                // transmitter is keyed.
                p.sensed_by[node_id].set(false);
                p.on_air_to[node_id].set(false);
                debug!(
                    "t={}ms node {} was transmitting, could not sense {}",
                    world.sim.now().as_millis(),
                    node_id,
                    p.seq
                );
            }
            continue;
        }

        if !(p.sensed_by[node_id].get() && !p.on_air_to[node_id].get()) {
            continue;
        }

        // End of reception. Airtime counts against the channel whatever the
        // outcome; the decrement saturates rather than assuming the start
        // marker was ever set.
        {
            let mut st = state.borrow_mut();
            st.active_receptions = st.active_receptions.saturating_sub(1);
            st.air_utilization += p.time_on_air;
        }
        if p.collided_at[node_id].get() {
            debug!(
                "t={}ms node {} could not decode {}",
                world.sim.now().as_millis(),
                node_id,
                p.seq
            );
            continue;
        }

        p.received_at[node_id].set(true);
        let now = world.sim.now();
        world.delays.borrow_mut().push(now - p.gen_time);
        debug!(
            "t={}ms node {} received {} with delay {}ms",
            now.as_millis(),
            node_id,
            p.seq,
            (now - p.gen_time).as_millis()
        );

        {
            let mut st = state.borrow_mut();
            match st.least_received_hop_limit.get(&p.seq).copied() {
                None => {
                    // First copy of this sequence that reached us at all.
                    st.useful_packets += 1;
                    st.least_received_hop_limit.insert(p.seq, p.hop_limit);
                }
                Some(least) if p.hop_limit < least => {
                    st.least_received_hop_limit.insert(p.seq, p.hop_limit);
                }
                Some(_) => {}
            }
        }

        if p.origin == node_id {
            // Our own flood came back: the message is acknowledged, and we
            // neither forward it nor ACK ourselves.
            if p.is_ack {
                debug!("node {} received real ACK on generated message", node_id);
            } else {
                debug!("node {} received implicit ACK on message sent", node_id);
            }
            p.acknowledged.set(true);
            p.retry_state.acknowledged.set(true);
            continue;
        }

        // Overheard acknowledgments for attempts we created ourselves:
        // hearing our sequence again is an implicit ACK for a copy we are
        // relaying; a matching request id on an ACK packet is the explicit
        // ACK for a message we originated. Marking the shared retry state
        // is what stops the originator's retry loop.
        let mut ack_seen = false;
        let mut real_ack_seen = false;
        {
            let st = state.borrow();
            for attempt in &st.attempts {
                if attempt.seq == p.seq {
                    debug!(
                        "t={}ms node {} received implicit ACK for queued {}",
                        now.as_millis(),
                        node_id,
                        p.seq
                    );
                    ack_seen = true;
                    attempt.acknowledged.set(true);
                    attempt.retry_state.acknowledged.set(true);
                }
                if p.is_ack && attempt.origin == node_id && p.request_id == Some(attempt.seq) {
                    debug!("t={}ms node {} received real ACK", now.as_millis(), node_id);
                    real_ack_seen = true;
                    attempt.acknowledged.set(true);
                    attempt.retry_state.acknowledged.set(true);
                }
            }
        }

        let is_destination = p.dest == Destination::Node(node_id);
        if p.want_ack && is_destination && !state.borrow().acked_seqs.contains(&p.seq) {
            // We are the addressee: answer with a short explicit ACK, once
            // per sequence number.
            state.borrow_mut().acked_seqs.insert(p.seq);
            let ack_seq = world.seq.next();
            world.messages.borrow_mut().push(MeshMessage {
                seq: ack_seq,
                origin: node_id,
                dest: Destination::Node(p.origin),
                gen_time: now,
            });
            let ack = world.build_packet(PacketSpec {
                origin: node_id,
                relayer: node_id,
                dest: Destination::Node(p.origin),
                payload_size: world.params.ack_size,
                seq: ack_seq,
                gen_time: now,
                want_ack: false,
                is_ack: true,
                request_id: Some(p.seq),
                hop_limit: profile_hop_limit(&state),
                retransmissions: world.params.max_retransmission,
                retry_state: Rc::new(RetryState::new(world.params.max_retransmission)),
            });
            debug!(
                "t={}ms node {} sends a flooding ACK for {}",
                now.as_millis(),
                node_id,
                p.seq
            );
            world.log_and_transmit(&state, &transmitter, ack);
        } else if !is_destination && !ack_seen && !real_ack_seen && p.hop_limit > 0 {
            // Flooding router: forward with a decremented hop limit. The
            // copy is a plain flood packet even when relaying an ACK.
            let copy = world.build_packet(PacketSpec {
                origin: p.origin,
                relayer: node_id,
                dest: p.dest,
                payload_size: p.payload_size,
                seq: p.seq,
                gen_time: p.gen_time,
                want_ack: p.want_ack,
                is_ack: false,
                request_id: None,
                hop_limit: p.hop_limit - 1,
                retransmissions: world.params.max_retransmission,
                retry_state: p.retry_state.clone(),
            });
            debug!(
                "t={}ms node {} rebroadcasts {}",
                now.as_millis(),
                node_id,
                p.seq
            );
            world.log_and_transmit(&state, &transmitter, copy);
        }
    }
}

fn profile_hop_limit(state: &Rc<RefCell<NodeState>>) -> u32 {
    state.borrow().profile.hop_limit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::geometry::Position;
    use rand::SeedableRng;

    fn test_world(sim: &Sim, profiles: Vec<NodeProfile>) -> World {
        let node_count = profiles.len();
        World {
            sim: sim.clone(),
            params: Rc::new(RunParams {
                lora: LoraParameters::default(),
                path_loss: PathLossParameters::default(),
                period_ms: 100_000.0,
                payload_size: 40,
                ack_size: 12,
                max_retransmission: 3,
                unicast: false,
                interference_level: 0.0,
                collision_due_to_interference: false,
            }),
            rng: Rc::new(RefCell::new(StdRng::seed_from_u64(1))),
            seq: Rc::new(SequenceCounter::default()),
            pipe: BroadcastPipe::new(sim),
            profiles: Rc::new(profiles),
            packets: Rc::new(RefCell::new(Vec::new())),
            packets_at: Rc::new((0..node_count).map(|_| RefCell::new(Vec::new())).collect()),
            messages: Rc::new(RefCell::new(Vec::new())),
            delays: Rc::new(RefCell::new(Vec::new())),
        }
    }

    fn two_profiles() -> Vec<NodeProfile> {
        (0..2)
            .map(|id| NodeProfile {
                id,
                position: Position { x: 500.0 * id as f32, y: 0.0, z: 2.0 },
                tx_power_dbm: 14.0,
                antenna_gain_dbi: 0.0,
                is_router: false,
                is_repeater: true,
                hop_limit: 3,
            })
            .collect()
    }

    #[test]
    fn half_duplex_clears_sensed_while_transmitting() {
        let sim = Sim::new(Duration::from_secs(60));
        let world = test_world(&sim, two_profiles());

        // Node 1 runs only its receive loop and is marked mid-transmission.
        let state = start_node(&world, world.profiles[1]);
        state.borrow_mut().transmitting = true;

        let packet = world.build_packet(PacketSpec {
            origin: 0,
            relayer: 0,
            dest: Destination::Broadcast,
            payload_size: 40,
            seq: 1,
            gen_time: Duration::ZERO,
            want_ack: false,
            is_ack: false,
            request_id: None,
            hop_limit: 3,
            retransmissions: 3,
            retry_state: Rc::new(RetryState::new(3)),
        });
        assert!(packet.sensed_by[1].get());
        world.pipe.put(packet.clone());
        sim.run();

        // The transmitting node must retroactively clear both flags and
        // never count the packet as received.
        assert!(!packet.sensed_by[1].get());
        assert!(!packet.on_air_to[1].get());
        assert!(!packet.received_at[1].get());
        assert_eq!(state.borrow().active_receptions, 0);
    }

    #[test]
    fn clean_reception_updates_hop_tracking_and_usefulness() {
        let sim = Sim::new(Duration::from_secs(60));
        let world = test_world(&sim, two_profiles());
        let state = start_node(&world, world.profiles[1]);

        for (attempt, hop_limit) in [(1u32, 3u32), (2, 1), (3, 2)] {
            let packet = world.build_packet(PacketSpec {
                origin: 0,
                relayer: 0,
                dest: Destination::Broadcast,
                payload_size: 40,
                seq: 7,
                gen_time: Duration::ZERO,
                want_ack: false,
                is_ack: false,
                request_id: None,
                hop_limit,
                retransmissions: 3,
                retry_state: Rc::new(RetryState::new(3)),
            });
            let _ = attempt;
            world.pipe.put(packet);
        }
        sim.run();

        let st = state.borrow();
        // Only the first copy of the sequence was useful, and the tracked
        // hop limit never increased again.
        assert_eq!(st.useful_packets, 1);
        assert_eq!(st.least_received_hop_limit.get(&7).copied(), Some(1));
    }
}
