//! Call tracker: aggregates voice bursts into call records.
//!
//! A call is a logically contiguous sequence of bursts sharing a stream id
//! on one repeater. Finalized records are persisted through the registry
//! and are the source of truth for lastheard queries.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::protocol::{DmrPacket, FrameType};
use crate::registry::Registry;

/// A finalized (or in-progress) call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub stream_id: u32,
    pub repeater_id: u32,
    pub source_id: u32,
    pub destination_id: u32,
    pub group_call: bool,
    /// Timeslot number (1 or 2).
    pub timeslot: u8,
    /// Call start, unix milliseconds.
    pub start_time_ms: u64,
    pub duration_ms: u64,
    pub total_packets: u32,
    /// Packets inferred lost from sequence gaps.
    pub lost_packets: u32,
    /// Mean bit error rate, percent.
    pub ber: f32,
    /// Mean signal strength, dBm (0 when the stream carried no RSSI).
    pub rssi: f32,
    pub active: bool,
    /// The stream ended without a voice terminator.
    pub lost_terminator: bool,
}

/// Accumulator for an in-progress call.
struct ActiveCall {
    source_id: u32,
    destination_id: u32,
    group_call: bool,
    timeslot: u8,
    started: Instant,
    started_wall: SystemTime,
    last_burst: Instant,
    total: u32,
    lost: u32,
    last_seq: u8,
    ber_sum: f64,
    rssi_sum: f64,
    rssi_count: u32,
}

impl ActiveCall {
    fn new(packet: &DmrPacket, now: Instant) -> Self {
        let mut call = Self {
            source_id: packet.src,
            destination_id: packet.dst,
            group_call: packet.group_call,
            timeslot: packet.slot.number(),
            started: now,
            started_wall: SystemTime::now(),
            last_burst: now,
            total: 0,
            lost: 0,
            last_seq: packet.sequence.wrapping_sub(1),
            ber_sum: 0.0,
            rssi_sum: 0.0,
            rssi_count: 0,
        };
        call.update(packet, now);
        call
    }

    fn update(&mut self, packet: &DmrPacket, now: Instant) {
        self.last_burst = now;
        self.total += 1;

        let expected = self.last_seq.wrapping_add(1);
        if packet.sequence != expected {
            self.lost += u32::from(packet.sequence.wrapping_sub(expected));
        }
        self.last_seq = packet.sequence;

        self.ber_sum += f64::from(packet.ber) / 2.55;
        if packet.rssi != 0 {
            self.rssi_sum -= f64::from(packet.rssi);
            self.rssi_count += 1;
        }
    }

    fn into_record(self, stream_id: u32, repeater_id: u32, terminator_seen: bool) -> CallRecord {
        let duration = self.last_burst.duration_since(self.started);
        CallRecord {
            stream_id,
            repeater_id,
            source_id: self.source_id,
            destination_id: self.destination_id,
            group_call: self.group_call,
            timeslot: self.timeslot,
            start_time_ms: self
                .started_wall
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            duration_ms: duration.as_millis() as u64,
            total_packets: self.total,
            lost_packets: self.lost,
            ber: (self.ber_sum / f64::from(self.total.max(1))) as f32,
            rssi: if self.rssi_count > 0 {
                (self.rssi_sum / f64::from(self.rssi_count)) as f32
            } else {
                0.0
            },
            active: false,
            lost_terminator: !terminator_seen,
        }
    }
}

/// The call tracker.
pub struct CallTracker {
    active: DashMap<(u32, u32), ActiveCall>,
    registry: Arc<Registry>,
    inactivity: Duration,
}

impl CallTracker {
    /// Create a tracker persisting through the given registry.
    pub fn new(registry: Arc<Registry>, inactivity: Duration) -> Self {
        Self {
            active: DashMap::new(),
            registry,
            inactivity,
        }
    }

    /// Feed one burst into the tracker.
    pub fn observe(&self, packet: &DmrPacket) {
        let key = (packet.stream_id, packet.repeater);
        let now = Instant::now();

        if !self.active.contains_key(&key) {
            let starts_call = packet.is_voice_header()
                || matches!(packet.frame_type, FrameType::Voice | FrameType::VoiceSync);
            if !starts_call {
                // Stray terminator or data frame without a call in progress.
                return;
            }

            // At most one active call per (repeater, timeslot): a fresh
            // stream supersedes whatever was left on that slot.
            let superseded: Vec<_> = self
                .active
                .iter()
                .filter(|e| e.key().1 == packet.repeater && e.value().timeslot == packet.slot.number())
                .map(|e| *e.key())
                .collect();
            for old_key in superseded {
                if let Some((k, call)) = self.active.remove(&old_key) {
                    self.finalize(k, call, false);
                }
            }

            debug!(
                "Call started: stream {:08x} {} -> {} on repeater {} {}",
                packet.stream_id, packet.src, packet.dst, packet.repeater, packet.slot
            );
            self.active.insert(key, ActiveCall::new(packet, now));
            return;
        }

        let terminated = packet.is_voice_terminator();
        if let Some(mut call) = self.active.get_mut(&key) {
            call.update(packet, now);
        }

        if terminated {
            if let Some((k, call)) = self.active.remove(&key) {
                self.finalize(k, call, true);
            }
        }
    }

    /// Finalize calls whose stream went silent.
    pub fn sweep(&self) {
        let stale: Vec<_> = self
            .active
            .iter()
            .filter(|e| e.value().last_burst.elapsed() > self.inactivity)
            .map(|e| *e.key())
            .collect();

        for key in stale {
            if let Some((k, call)) = self.active.remove(&key) {
                self.finalize(k, call, false);
            }
        }
    }

    /// Number of calls currently in progress.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn finalize(&self, key: (u32, u32), call: ActiveCall, terminator_seen: bool) {
        let record = call.into_record(key.0, key.1, terminator_seen);

        info!(
            "Call ended: {} -> {} on repeater {} TS{}, {} ms, {} packets ({} lost){}",
            record.source_id,
            record.destination_id,
            record.repeater_id,
            record.timeslot,
            record.duration_ms,
            record.total_packets,
            record.lost_packets,
            if record.lost_terminator { ", no terminator" } else { "" },
        );

        if let Err(e) = self.registry.persist_call(&record) {
            error!("Failed to persist call record: {e}");
        }
    }
}
