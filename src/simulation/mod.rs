//! Discrete-event simulation of a flooding LoRa-style mesh.
//!
//! One call to [`run_repetition`] builds a fresh node set, runs every node
//! engine on a shared virtual clock until the configured horizon, and
//! reduces the packet/message logs into per-run statistics. Nothing
//! persists between repetitions except the seed-derived outcome.
//!
//! Module layout:
//! - `kernel`: cooperative scheduler and virtual clock
//! - `broadcast`: ordered multicast channel with per-node cursors
//! - `types`: message/packet/node data model
//! - `node`: per-node protocol engine (generate / transmit / receive)
//! - `signal_calculations`: physical layer and channel-access model
//! - `geometry`: placement and distances

pub(crate) mod broadcast;
pub(crate) mod geometry;
pub(crate) mod kernel;
pub(crate) mod node;
pub(crate) mod signal_calculations;
pub(crate) mod types;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Result, bail};
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::config::Config;
use broadcast::BroadcastPipe;
use geometry::{Position, find_random_position};
use kernel::Sim;
use node::{RunParams, World, start_node};
use types::{MeshMessage, MeshPacket, NodeProfile, RunStats, SequenceCounter};

/// Node-set layouts tried before placement escalates to a configuration
/// error instead of looping forever.
const NODE_SET_REBUILD_ATTEMPTS: usize = 100;

/// Everything one repetition leaves behind. The full logs stay available
/// for inspection; the batch driver only consumes `stats`.
pub(crate) struct RunOutcome {
    pub(crate) stats: RunStats,
    pub(crate) packets: Vec<Rc<MeshPacket>>,
    pub(crate) messages: Vec<MeshMessage>,
}

/// Run one repetition and reduce it to its statistics.
pub(crate) fn run_repetition(config: &Config, nr_nodes: usize, seed: u64) -> Result<RunStats> {
    Ok(execute(config, nr_nodes, seed)?.stats)
}

/// Run one repetition to the horizon. `nr_nodes` selects the density for
/// random placement and is ignored when the config places nodes explicitly.
pub(crate) fn execute(config: &Config, nr_nodes: usize, seed: u64) -> Result<RunOutcome> {
    let mut rng = StdRng::seed_from_u64(seed);
    let profiles = build_node_set(config, nr_nodes, &mut rng)?;
    let node_count = profiles.len();

    let sim = Sim::new(Duration::from_millis(config.sim_time_ms));
    let world = World {
        sim: sim.clone(),
        params: Rc::new(RunParams {
            lora: config.lora.clone(),
            path_loss: config.path_loss.clone(),
            period_ms: config.period_ms,
            payload_size: config.packet_length,
            ack_size: config.ack_length,
            max_retransmission: config.max_retransmission,
            unicast: config.unicast,
            interference_level: config.interference_level,
            collision_due_to_interference: config.collision_due_to_interference,
        }),
        rng: Rc::new(RefCell::new(rng)),
        seq: Rc::new(SequenceCounter::default()),
        pipe: BroadcastPipe::new(&sim),
        profiles: Rc::new(profiles.clone()),
        packets: Rc::new(RefCell::new(Vec::new())),
        packets_at: Rc::new((0..node_count).map(|_| RefCell::new(Vec::new())).collect()),
        messages: Rc::new(RefCell::new(Vec::new())),
        delays: Rc::new(RefCell::new(Vec::new())),
    };

    let states: Vec<_> = profiles
        .iter()
        .map(|profile| start_node(&world, *profile))
        .collect();
    sim.run();

    let packets = world.packets.borrow().clone();
    let mut nr_sensed = 0u64;
    let mut nr_collisions = 0u64;
    let mut nr_received = 0u64;
    for packet in &packets {
        for n in 0..node_count {
            if packet.sensed_by[n].get() {
                nr_sensed += 1;
            }
            if packet.collided_at[n].get() {
                nr_collisions += 1;
            }
            if packet.received_at[n].get() {
                nr_received += 1;
            }
        }
    }

    let mut nr_useful = 0u64;
    let mut nr_packets_sent = 0u64;
    let mut tx_air_ms_per_node = Vec::with_capacity(node_count);
    let mut air_ms_per_node = Vec::with_capacity(node_count);
    for state in &states {
        let st = state.borrow();
        nr_useful += st.useful_packets;
        nr_packets_sent += st.packets_sent;
        tx_air_ms_per_node.push(st.tx_air_utilization.as_secs_f64() * 1_000.0);
        air_ms_per_node.push(st.air_utilization.as_secs_f64() * 1_000.0);
    }
    let delays_ms = world
        .delays
        .borrow()
        .iter()
        .map(|d| d.as_secs_f64() * 1_000.0)
        .collect();

    Ok(RunOutcome {
        stats: RunStats {
            nr_nodes: node_count,
            nr_messages: world.seq.issued(),
            nr_packets_sent,
            nr_sensed,
            nr_collisions,
            nr_received,
            nr_useful,
            delays_ms,
            tx_air_ms_per_node,
            air_ms_per_node,
        },
        packets,
        messages: world.messages.borrow().clone(),
    })
}

/// Build the node set: either the explicit layout from the config, or
/// random placement under the minimum-distance constraint. A layout that
/// cannot be completed is thrown away and rebuilt from scratch, a bounded
/// number of times.
fn build_node_set(config: &Config, nr_nodes: usize, rng: &mut StdRng) -> Result<Vec<NodeProfile>> {
    if !config.nodes.is_empty() {
        return Ok(config
            .nodes
            .iter()
            .enumerate()
            .map(|(id, spec)| NodeProfile {
                id,
                position: Position {
                    x: spec.x,
                    y: spec.y,
                    z: spec.z.unwrap_or(config.antenna_height_m),
                },
                tx_power_dbm: spec.tx_power_dbm.unwrap_or(config.tx_power_dbm),
                antenna_gain_dbi: spec.antenna_gain_dbi.unwrap_or(config.antenna_gain_dbi),
                is_router: spec.is_router.unwrap_or(config.router),
                is_repeater: spec.is_repeater.unwrap_or(false),
                hop_limit: spec.hop_limit.unwrap_or(config.hop_limit),
            })
            .collect());
    }

    for _ in 0..NODE_SET_REBUILD_ATTEMPTS {
        let mut positions: Vec<Position> = Vec::with_capacity(nr_nodes);
        while positions.len() < nr_nodes {
            match find_random_position(
                rng,
                &positions,
                config.area_width_m,
                config.area_height_m,
                config.antenna_height_m,
                config.min_distance_m,
            ) {
                Some(position) => positions.push(position),
                None => break,
            }
        }
        if positions.len() == nr_nodes {
            return Ok(positions
                .into_iter()
                .enumerate()
                .map(|(id, position)| NodeProfile {
                    id,
                    position,
                    tx_power_dbm: config.tx_power_dbm,
                    antenna_gain_dbi: config.antenna_gain_dbi,
                    is_router: config.router,
                    is_repeater: false,
                    hop_limit: config.hop_limit,
                })
                .collect());
        }
    }
    bail!(
        "could not place {nr_nodes} nodes at {} m spacing in a {} m x {} m area \
         after {NODE_SET_REBUILD_ATTEMPTS} rebuilds",
        config.min_distance_m,
        config.area_width_m,
        config.area_height_m
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeSpec;
    use crate::simulation::kernel::Resource;
    use crate::simulation::types::{Destination, NodeState, PacketSpec, RetryState};
    use std::collections::HashMap;

    fn node_at(x: f32, y: f32) -> NodeSpec {
        NodeSpec {
            x,
            y,
            z: None,
            is_router: None,
            is_repeater: None,
            hop_limit: None,
            antenna_gain_dbi: None,
            tx_power_dbm: None,
        }
    }

    fn repeater_at(x: f32, y: f32) -> NodeSpec {
        NodeSpec {
            is_repeater: Some(true),
            ..node_at(x, y)
        }
    }

    /// Nodes 500 m apart sense each other under the default link budget
    /// (about 790 m of range); 1000 m apart they do not.
    fn scenario_config(nodes: Vec<NodeSpec>) -> Config {
        Config {
            nodes,
            repetitions: 1,
            sim_time_ms: 1_000_000,
            period_ms: 100_000.0,
            ..Config::default()
        }
    }

    #[test]
    fn scenario_a_reliable_unicast_acknowledges_on_first_check() {
        // Node 1 is a repeater, so node 0 is the only traffic source and no
        // two transmissions ever overlap.
        let config = Config {
            unicast: true,
            ..scenario_config(vec![node_at(0.0, 0.0), repeater_at(500.0, 0.0)])
        };
        let outcome = execute(&config, 2, 0).expect("run succeeds");

        let mut by_seq: HashMap<u32, Vec<&Rc<MeshPacket>>> = HashMap::new();
        for packet in outcome.packets.iter().filter(|p| !p.is_ack) {
            by_seq.entry(packet.seq).or_default().push(packet);
        }
        assert!(!by_seq.is_empty(), "the run generated traffic");

        for (seq, attempts) in &by_seq {
            // The ACK arrives well before the first retransmission check,
            // so a single attempt per message suffices.
            assert_eq!(attempts.len(), 1, "seq {seq} needed no retransmission");
            let packet = attempts[0];
            assert!(packet.received_at[1].get(), "receiver decoded seq {seq}");
            assert!(packet.retry_state.acknowledged.get());

            let acks: Vec<_> = outcome
                .packets
                .iter()
                .filter(|a| a.is_ack && a.request_id == Some(*seq))
                .collect();
            assert_eq!(acks.len(), 1, "exactly one explicit ACK for seq {seq}");
            assert!(acks[0].received_at[0].get(), "originator heard the ACK");
        }
    }

    #[test]
    fn scenario_b_flood_stops_at_the_hop_limit() {
        // Line 0 - 1 - 2; the ends are out of range of each other, so node
        // 2 is only reachable through node 1's single permitted relay.
        let config = Config {
            hop_limit: 1,
            ..scenario_config(vec![
                node_at(0.0, 0.0),
                repeater_at(500.0, 0.0),
                repeater_at(1000.0, 0.0),
            ])
        };
        let outcome = execute(&config, 3, 0).expect("run succeeds");

        let originated: Vec<_> = outcome
            .packets
            .iter()
            .filter(|p| p.origin == 0 && p.relayer == 0)
            .collect();
        assert!(!originated.is_empty());

        for packet in &originated {
            let relays: Vec<_> = outcome
                .packets
                .iter()
                .filter(|p| p.relayer == 1 && p.seq == packet.seq)
                .collect();
            assert_eq!(relays.len(), 1, "node 1 rebroadcast seq {} once", packet.seq);
            assert_eq!(relays[0].hop_limit, 0);
            assert!(relays[0].received_at[2].get(), "node 2 got seq {}", packet.seq);
        }
        // A hop limit of zero is the floor: node 2 never relays anything.
        assert!(outcome.packets.iter().all(|p| p.relayer != 2));
        assert!(outcome.packets.iter().all(|p| p.hop_limit <= 1));
    }

    #[test]
    fn scenario_c_hidden_terminals_collide_at_the_middle_node() {
        // Nodes 0 and 2 cannot sense each other (1200 m apart) but both
        // reach node 1 (600 m). Their listen-before-talk windows are under
        // one time-on-air, so the two transmissions always overlap.
        let config = scenario_config(vec![
            node_at(0.0, 0.0),
            repeater_at(600.0, 0.0),
            node_at(1200.0, 0.0),
        ]);
        let sim = Sim::new(Duration::from_millis(config.sim_time_ms));
        let mut rng = StdRng::seed_from_u64(0);
        let profiles = build_node_set(&config, 3, &mut rng).expect("explicit layout");
        let world = World {
            sim: sim.clone(),
            params: Rc::new(RunParams {
                lora: config.lora.clone(),
                path_loss: config.path_loss.clone(),
                period_ms: config.period_ms,
                payload_size: config.packet_length,
                ack_size: config.ack_length,
                max_retransmission: config.max_retransmission,
                unicast: false,
                interference_level: 0.0,
                collision_due_to_interference: false,
            }),
            rng: Rc::new(RefCell::new(rng)),
            seq: Rc::new(SequenceCounter::default()),
            pipe: BroadcastPipe::new(&sim),
            profiles: Rc::new(profiles.clone()),
            packets: Rc::new(RefCell::new(Vec::new())),
            packets_at: Rc::new((0..3).map(|_| RefCell::new(Vec::new())).collect()),
            messages: Rc::new(RefCell::new(Vec::new())),
            delays: Rc::new(RefCell::new(Vec::new())),
        };

        // Only the middle node runs an engine; the outer nodes get one
        // hand-started transmit attempt each at t=0.
        let middle = start_node(&world, profiles[1]);
        let mut packets = Vec::new();
        for &id in &[0usize, 2] {
            let packet = {
                let mut rng = world.rng.borrow_mut();
                MeshPacket::new(
                    PacketSpec {
                        origin: id,
                        relayer: id,
                        dest: Destination::Broadcast,
                        payload_size: config.packet_length,
                        seq: world.seq.next(),
                        gen_time: Duration::ZERO,
                        want_ack: false,
                        is_ack: false,
                        request_id: None,
                        hop_limit: 3,
                        retransmissions: config.max_retransmission,
                        retry_state: Rc::new(RetryState::new(config.max_retransmission)),
                    },
                    &world.profiles,
                    &world.params.lora,
                    &world.params.path_loss,
                    &mut rng,
                )
            };
            world.packets.borrow_mut().push(packet.clone());
            let state = Rc::new(RefCell::new(NodeState::new(profiles[id])));
            state.borrow_mut().attempts.push(packet.clone());
            let gate = Resource::new(&sim);
            world.sim.spawn(node::transmit(
                world.clone(),
                state,
                gate,
                packet.clone(),
            ));
            packets.push(packet);
        }
        sim.run();

        for packet in &packets {
            assert!(packet.start_time.get().is_some(), "both attempts went out");
            assert!(packet.sensed_by[1].get());
            assert!(packet.collided_at[1].get(), "copy collided at the middle");
            assert!(!packet.received_at[1].get());
        }
        // Overlap actually happened.
        let (a, b) = (&packets[0], &packets[1]);
        assert!(
            a.start_time.get() < b.end_time.get() && b.start_time.get() < a.end_time.get(),
            "transmissions overlapped in time"
        );
        assert_eq!(middle.borrow().useful_packets, 0);
    }

    #[test]
    fn exhausted_budget_stops_retransmitting_permanently() {
        // The destination sits far outside radio range: no copy is ever
        // sensed anywhere, so no acknowledgment can arrive.
        let config = Config {
            unicast: true,
            sim_time_ms: 1_200_000,
            period_ms: 120_000.0,
            ..scenario_config(vec![node_at(0.0, 0.0), repeater_at(5000.0, 0.0)])
        };
        let outcome = execute(&config, 2, 0).expect("run succeeds");

        // Only judge messages whose full retry chain fits before the
        // horizon; the chain takes a few seconds at most.
        let cutoff = Duration::from_millis(config.sim_time_ms - 30_000);
        let settled: Vec<_> = outcome
            .messages
            .iter()
            .filter(|m| m.origin == 0 && m.gen_time < cutoff)
            .collect();
        assert!(!settled.is_empty(), "at least one settled message");

        for message in settled {
            assert_eq!(message.dest, Destination::Node(1));
            let mut budgets: Vec<u32> = outcome
                .packets
                .iter()
                .filter(|p| p.seq == message.seq)
                .map(|p| {
                    assert!(!p.acknowledged.get());
                    assert!(!p.retry_state.acknowledged.get());
                    assert!(p.received_at.iter().all(|r| !r.get()));
                    p.retransmissions
                })
                .collect();
            budgets.sort_unstable();
            // One original attempt plus exactly max_retransmission retries,
            // then the sequence goes quiet for good.
            assert_eq!(budgets, vec![0, 1, 2, 3], "seq {}", message.seq);
        }
    }

    #[test]
    fn identical_seeds_reproduce_identical_runs() {
        let config = Config {
            node_counts: vec![6],
            repetitions: 1,
            sim_time_ms: 600_000,
            period_ms: 60_000.0,
            area_width_m: 2_000.0,
            area_height_m: 2_000.0,
            ..Config::default()
        };
        let first = execute(&config, 6, 3).expect("run succeeds");
        let second = execute(&config, 6, 3).expect("run succeeds");

        assert_eq!(first.stats, second.stats);
        assert_eq!(first.packets.len(), second.packets.len());
        for (p, q) in first.packets.iter().zip(&second.packets) {
            assert_eq!(p.seq, q.seq);
            assert_eq!(p.relayer, q.relayer);
            assert_eq!(p.start_time.get(), q.start_time.get());
            for n in 0..first.stats.nr_nodes {
                assert_eq!(p.sensed_by[n].get(), q.sensed_by[n].get());
                assert_eq!(p.collided_at[n].get(), q.collided_at[n].get());
                assert_eq!(p.received_at[n].get(), q.received_at[n].get());
            }
        }
        assert_eq!(first.messages.len(), second.messages.len());
    }

    #[test]
    fn dense_traffic_upholds_protocol_invariants() {
        let config = Config {
            node_counts: vec![8],
            repetitions: 1,
            unicast: true,
            sim_time_ms: 600_000,
            period_ms: 20_000.0,
            area_width_m: 2_000.0,
            area_height_m: 2_000.0,
            ..Config::default()
        };
        let outcome = execute(&config, 8, 1).expect("run succeeds");
        assert!(outcome.stats.nr_messages > 0);
        assert!(outcome.stats.nr_packets_sent > 0);

        // Collided implies sensed, for every packet at every node.
        for packet in &outcome.packets {
            for n in 0..outcome.stats.nr_nodes {
                if packet.collided_at[n].get() {
                    assert!(packet.sensed_by[n].get());
                }
            }
        }
        assert!(outcome.stats.nr_collisions <= outcome.stats.nr_sensed);
        assert!(outcome.stats.nr_received <= outcome.stats.nr_sensed);

        // Relayed ACK copies lose their marking, so every ACK packet is an
        // original, and no node ever ACKs the same sequence twice.
        let mut acks_per_node: HashMap<(usize, u32), u32> = HashMap::new();
        for packet in outcome.packets.iter().filter(|p| p.is_ack) {
            assert_eq!(packet.relayer, packet.origin);
            let request = packet.request_id.expect("ACK carries a request id");
            *acks_per_node.entry((packet.origin, request)).or_default() += 1;
        }
        for ((node, request), count) in acks_per_node {
            assert_eq!(count, 1, "node {node} acked seq {request} once");
        }
    }

    #[test]
    fn impossible_placement_escalates_to_an_error() {
        let config = Config {
            area_width_m: 100.0,
            area_height_m: 100.0,
            min_distance_m: 90.0,
            ..Config::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        assert!(build_node_set(&config, 5, &mut rng).is_err());
    }
}
