//! Radio signal, timing, and channel-access calculations.
//!
//! This is the physical/MAC layer the protocol engine consumes:
//! - LoRa airtime from modem parameters and payload length
//! - Log-distance path loss with optional log-normal shadowing, RSSI
//! - Per-SF SNR demodulation floor and receiver sensitivity
//! - Listen-before-talk backoff and retransmission timeouts
//! - Collision determination with a capture margin, plus external
//!   interference
//!
//! Units: power in dBm, time in seconds (f32) inside formulas and
//! `Duration` at the API boundary, distance in meters.

use std::rc::Rc;
use std::time::Duration;

use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::Deserialize;

use super::types::MeshPacket;

/// Minimum RSSI dominance (dB) for the capture effect: a packet this much
/// stronger than an overlapping one survives while the weaker one is
/// destroyed. Overlaps inside the margin destroy both.
pub(crate) const CAPTURE_THRESHOLD: f32 = 6.0;

/// Contention window bounds for the listen-before-talk backoff, in slots.
const CW_MIN: u32 = 2;
const CW_MAX: u32 = 8;

/// LoRa-like modem parameters used for airtime and sensitivity.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct LoraParameters {
    pub(crate) bandwidth: u32,
    pub(crate) spreading_factor: u8,
    /// Coding rate 1..=4, representing 4/5..4/8.
    pub(crate) coding_rate: u32,
    pub(crate) preamble_symbols: f32,
    pub(crate) crc_enabled: bool,
    pub(crate) low_data_rate_optimization: bool,
}

impl Default for LoraParameters {
    fn default() -> Self {
        LoraParameters {
            bandwidth: 125_000,
            spreading_factor: 7,
            coding_rate: 1,
            preamble_symbols: 8.0,
            crc_enabled: true,
            low_data_rate_optimization: false,
        }
    }
}

/// Log-distance path loss model parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct PathLossParameters {
    /// Path loss exponent; 2.0 is free space, 2.7–3.5 urban.
    pub(crate) path_loss_exponent: f32,
    /// Standard deviation (dB) of the log-normal shadowing term. 0 disables
    /// shadowing.
    pub(crate) shadowing_sigma: f32,
    /// Path loss (dB) at the 1 m reference distance.
    pub(crate) path_loss_at_reference_distance: f32,
    /// Thermal noise floor of the receiver (dBm).
    pub(crate) noise_floor: f32,
}

impl Default for PathLossParameters {
    fn default() -> Self {
        PathLossParameters {
            path_loss_exponent: 3.5,
            shadowing_sigma: 0.0,
            path_loss_at_reference_distance: 40.0,
            noise_floor: -120.0,
        }
    }
}

/// LoRa symbol duration in seconds: 2^SF / BW.
fn symbol_time(lora: &LoraParameters) -> f32 {
    2.0_f32.powi(lora.spreading_factor as i32) / lora.bandwidth as f32
}

/// Time-on-air in seconds for a payload of `payload_size` bytes, per the
/// SX127x formula with explicit header:
/// preamble = (N_preamble + 4.25) × T_sym,
/// N_payload = 8 + max(ceil((8·PL − 4·SF + 28 + 16·CRC) / (4·(SF − 2·DE))) × (CR + 4), 0).
pub(crate) fn calculate_air_time(lora: &LoraParameters, payload_size: usize) -> f32 {
    let t_sym = symbol_time(lora);
    let preamble_time = (lora.preamble_symbols + 4.25) * t_sym;

    let sf = lora.spreading_factor as f32;
    let pl = payload_size as f32;
    let crc = if lora.crc_enabled { 1.0 } else { 0.0 };
    let de = if lora.low_data_rate_optimization { 1.0 } else { 0.0 };
    let cr = lora.coding_rate as f32;

    let numerator = 8.0 * pl - 4.0 * sf + 28.0 + 16.0 * crc;
    let denominator = 4.0 * (sf - 2.0 * de);
    let payload_symbols = 8.0 + ((numerator / denominator).ceil() * (cr + 4.0)).max(0.0);

    preamble_time + payload_symbols * t_sym
}

/// Path loss (dB) at `distance` meters: PL(d) = PL(d0) + 10·n·log10(d) plus
/// a Normal(0, σ) shadowing sample. Every call resamples shadowing, so two
/// attempts over the same link may see different losses.
pub(crate) fn calculate_path_loss(
    distance: f32,
    params: &PathLossParameters,
    rng: &mut StdRng,
) -> f32 {
    if distance < 1.0 {
        return params.path_loss_at_reference_distance;
    }
    let path_loss =
        params.path_loss_at_reference_distance + 10.0 * params.path_loss_exponent * distance.log10();
    let shadowing = if params.shadowing_sigma > 0.0 {
        let normal = Normal::new(0.0_f32, params.shadowing_sigma).expect("invalid shadowing sigma");
        normal.sample(rng)
    } else {
        0.0
    };
    path_loss + shadowing
}

/// RSSI (dBm) at a receiver: transmit power plus antenna gains minus a
/// sampled path loss.
pub(crate) fn calculate_rssi(
    distance: f32,
    tx_dbm: f32,
    params: &PathLossParameters,
    rng: &mut StdRng,
) -> f32 {
    tx_dbm - calculate_path_loss(distance, params, rng)
}

/// Minimum SNR (dB) at which the given spreading factor still demodulates.
pub(crate) fn calculate_snr_limit(lora: &LoraParameters) -> f32 {
    match lora.spreading_factor {
        5 => -2.5,
        6 => -5.0,
        7 => -7.5,
        8 => -10.0,
        9 => -12.5,
        10 => -15.0,
        11 => -17.5,
        _ => -20.0,
    }
}

/// Receiver sensitivity (dBm): noise floor plus the SNR demodulation floor.
/// A transmission is sensed at a receiver iff its RSSI reaches this level.
pub(crate) fn receiver_sensitivity(lora: &LoraParameters, params: &PathLossParameters) -> f32 {
    params.noise_floor + calculate_snr_limit(lora)
}

/// Backoff slot duration: the two-symbol channel-activity-detection window
/// plus half a symbol of turnaround.
pub(crate) fn slot_time(lora: &LoraParameters) -> Duration {
    Duration::from_secs_f32(2.5 * symbol_time(lora))
}

/// Stochastic listen-before-talk wait: a uniform number of contention
/// slots. Routers draw from the front half of the window so relays win
/// contention more often.
pub(crate) fn transmit_backoff(
    rng: &mut StdRng,
    is_router: bool,
    lora: &LoraParameters,
) -> Duration {
    let upper = if is_router { CW_MAX / 2 } else { CW_MAX };
    let slots = rng.gen_range(CW_MIN..=upper);
    slot_time(lora) * slots
}

/// Wait before checking for an acknowledgment: a jittered multiple of the
/// packet airtime, doubled for every retry already consumed out of the
/// budget (capped to keep the wait bounded).
pub(crate) fn retransmission_timeout(
    rng: &mut StdRng,
    lora: &LoraParameters,
    payload_size: usize,
    min_remaining: u32,
    max_retransmission: u32,
) -> Duration {
    let airtime = calculate_air_time(lora, payload_size);
    let consumed = max_retransmission.saturating_sub(min_remaining).min(4);
    let factor = (1u32 << consumed) as f32;
    let wait = rng.gen_range(9.0_f32..11.0) * airtime * factor;
    Duration::from_secs_f32(wait)
}

/// Listen-before-talk carrier sense: the channel at `rx` is busy while any
/// transmission it can sense is on the air, or with the configured
/// probability due to external interference.
pub(crate) fn is_channel_active(
    rx: usize,
    now: Duration,
    packets: &[Rc<MeshPacket>],
    interference_level: f64,
    rng: &mut StdRng,
) -> bool {
    for packet in packets {
        if let (Some(start), Some(end)) = (packet.start_time.get(), packet.end_time.get()) {
            if packet.sensed_by[rx].get() && start <= now && now < end {
                return true;
            }
        }
    }
    interference_level > 0.0 && rng.gen_bool(interference_level)
}

/// Collision outcome for `packet` starting transmission at `now`, judged at
/// receiver `rx` against every earlier transmission still on the air there.
/// A packet stronger by [`CAPTURE_THRESHOLD`] survives the overlap and
/// destroys the other, including retroactively destroying a reception
/// already in progress; overlaps inside the margin destroy both copies.
/// With `collision_due_to_interference`, external interference can destroy
/// the reception outright.
///
/// Returns whether `packet` survives at `rx` and should join the receiver's
/// in-flight log. Collided packets never join it, so they cannot destroy
/// later arrivals. `collided_at` is only ever set for receivers that sensed
/// the transmission.
pub(crate) fn check_collision(
    packet: &MeshPacket,
    rx: usize,
    now: Duration,
    in_flight: &[Rc<MeshPacket>],
    collision_due_to_interference: bool,
    interference_level: f64,
    rng: &mut StdRng,
) -> bool {
    let mut collided = false;
    if collision_due_to_interference && interference_level > 0.0 && rng.gen_bool(interference_level)
    {
        packet.collided_at[rx].set(true);
        collided = true;
    }
    for other in in_flight {
        let Some(end) = other.end_time.get() else {
            continue;
        };
        if end <= now {
            continue;
        }
        let margin = packet.rssi_at[rx] - other.rssi_at[rx];
        if margin >= CAPTURE_THRESHOLD {
            other.collided_at[rx].set(true);
        } else if margin <= -CAPTURE_THRESHOLD {
            packet.collided_at[rx].set(true);
            collided = true;
        } else {
            other.collided_at[rx].set(true);
            packet.collided_at[rx].set(true);
            collided = true;
        }
    }
    !collided
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::geometry::Position;
    use crate::simulation::types::{Destination, MeshPacket, NodeProfile, PacketSpec, RetryState};
    use rand::SeedableRng;

    fn params_sf_bw(sf: u8, bw: u32) -> LoraParameters {
        LoraParameters {
            bandwidth: bw,
            spreading_factor: sf,
            ..LoraParameters::default()
        }
    }

    fn line_profiles(spacing: f32, count: usize) -> Vec<NodeProfile> {
        (0..count)
            .map(|id| NodeProfile {
                id,
                position: Position { x: spacing * id as f32, y: 0.0, z: 2.0 },
                tx_power_dbm: 14.0,
                antenna_gain_dbi: 0.0,
                is_router: false,
                is_repeater: false,
                hop_limit: 3,
            })
            .collect()
    }

    fn stamp(
        relayer: usize,
        seq: u32,
        nodes: &[NodeProfile],
        rng: &mut StdRng,
    ) -> Rc<MeshPacket> {
        let spec = PacketSpec {
            origin: relayer,
            relayer,
            dest: Destination::Broadcast,
            payload_size: 40,
            seq,
            gen_time: Duration::ZERO,
            want_ack: false,
            is_ack: false,
            request_id: None,
            hop_limit: 3,
            retransmissions: 3,
            retry_state: Rc::new(RetryState::new(3)),
        };
        MeshPacket::new(
            spec,
            nodes,
            &LoraParameters::default(),
            &PathLossParameters::default(),
            rng,
        )
    }

    #[test]
    fn airtime_increases_with_payload_and_sf() {
        let mut lora = params_sf_bw(7, 125_000);
        let t_small = calculate_air_time(&lora, 10);
        let t_big = calculate_air_time(&lora, 100);
        assert!(t_big > t_small);

        lora.spreading_factor = 9;
        let t_sf9 = calculate_air_time(&lora, 10);
        assert!(t_sf9 > t_small);
    }

    #[test]
    fn snr_limits_match_expectations() {
        for (sf, expect) in [(7, -7.5), (8, -10.0), (9, -12.5), (10, -15.0), (11, -17.5)] {
            let lora = params_sf_bw(sf, 125_000);
            assert!((calculate_snr_limit(&lora) - expect).abs() < f32::EPSILON);
        }
    }

    #[test]
    fn path_loss_grows_with_distance() {
        let params = PathLossParameters::default();
        let mut rng = StdRng::seed_from_u64(1);
        let near = calculate_path_loss(10.0, &params, &mut rng);
        let far = calculate_path_loss(1000.0, &params, &mut rng);
        assert!(far > near);
        // Below the reference distance the reference loss applies.
        assert_eq!(
            calculate_path_loss(0.5, &params, &mut rng),
            params.path_loss_at_reference_distance
        );
    }

    #[test]
    fn backoff_stays_inside_contention_window() {
        let lora = params_sf_bw(7, 125_000);
        let slot = slot_time(&lora);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let wait = transmit_backoff(&mut rng, false, &lora);
            assert!(wait >= slot * CW_MIN && wait <= slot * CW_MAX);
            let router_wait = transmit_backoff(&mut rng, true, &lora);
            assert!(router_wait >= slot * CW_MIN && router_wait <= slot * (CW_MAX / 2));
        }
    }

    #[test]
    fn retransmission_timeout_backs_off_per_consumed_retry() {
        let lora = params_sf_bw(7, 125_000);
        let mut rng = StdRng::seed_from_u64(4);
        let fresh = retransmission_timeout(&mut rng, &lora, 40, 3, 3);
        let exhausted = retransmission_timeout(&mut rng, &lora, 40, 0, 3);
        // Worst jitter ratio is 11/9, far below the 8x budget factor.
        assert!(exhausted > fresh * 4);
    }

    #[test]
    fn comparable_powers_destroy_both_copies() {
        let nodes = line_profiles(500.0, 3);
        let mut rng = StdRng::seed_from_u64(5);
        let first = stamp(0, 1, &nodes, &mut rng);
        let second = stamp(2, 2, &nodes, &mut rng);

        // Node 1 sits midway, same distance to both transmitters.
        assert!(first.sensed_by[1].get() && second.sensed_by[1].get());
        let now = Duration::from_millis(10);
        first.start_time.set(Some(now));
        first.end_time.set(Some(now + first.time_on_air));
        let survived = check_collision(&second, 1, now, &[first.clone()], false, 0.0, &mut rng);
        assert!(!survived);
        assert!(first.collided_at[1].get());
        assert!(second.collided_at[1].get());
    }

    #[test]
    fn capture_lets_the_stronger_packet_survive() {
        // Receiver is node 1; node 0 is close, node 2 far away.
        let mut nodes = line_profiles(100.0, 3);
        nodes[2].position.x = 700.0;
        let mut rng = StdRng::seed_from_u64(6);
        let weak = stamp(2, 1, &nodes, &mut rng);
        let strong = stamp(0, 2, &nodes, &mut rng);
        assert!(strong.rssi_at[1] - weak.rssi_at[1] >= CAPTURE_THRESHOLD);

        let now = Duration::from_millis(10);
        weak.start_time.set(Some(now));
        weak.end_time.set(Some(now + weak.time_on_air));
        let survived = check_collision(&strong, 1, now, &[weak.clone()], false, 0.0, &mut rng);
        assert!(survived);
        assert!(weak.collided_at[1].get());
        assert!(!strong.collided_at[1].get());
    }

    #[test]
    fn ended_transmissions_do_not_collide() {
        let nodes = line_profiles(500.0, 3);
        let mut rng = StdRng::seed_from_u64(7);
        let first = stamp(0, 1, &nodes, &mut rng);
        first.start_time.set(Some(Duration::ZERO));
        first.end_time.set(Some(Duration::from_millis(50)));
        let second = stamp(2, 2, &nodes, &mut rng);
        let survived = check_collision(
            &second,
            1,
            Duration::from_millis(50),
            &[first.clone()],
            false,
            0.0,
            &mut rng,
        );
        assert!(survived);
        assert!(!first.collided_at[1].get());
    }

    #[test]
    fn channel_sense_tracks_on_air_packets() {
        let nodes = line_profiles(500.0, 2);
        let mut rng = StdRng::seed_from_u64(8);
        let packet = stamp(0, 1, &nodes, &mut rng);
        let packets = vec![packet.clone()];
        // Not transmitted yet: channel idle.
        assert!(!is_channel_active(1, Duration::ZERO, &packets, 0.0, &mut rng));
        packet.start_time.set(Some(Duration::from_millis(10)));
        packet.end_time.set(Some(Duration::from_millis(60)));
        assert!(is_channel_active(1, Duration::from_millis(10), &packets, 0.0, &mut rng));
        assert!(is_channel_active(1, Duration::from_millis(59), &packets, 0.0, &mut rng));
        assert!(!is_channel_active(1, Duration::from_millis(60), &packets, 0.0, &mut rng));
    }
}
