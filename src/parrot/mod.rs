//! Parrot echo service: records a caller's transmission and plays it back.
//!
//! Each stream addressed to the reserved parrot id is buffered in order.
//! When the terminator arrives (or the stream goes silent) the recording
//! is replayed to the originating repeater with source and destination
//! rewritten, preserving the DMR voice frame period between bursts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::bus::PacketBus;
use crate::protocol::DmrPacket;

/// DMR voice frame period; replayed bursts are paced at this interval.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(60);

/// Recordings older than this are discarded unplayed.
pub const RECORDING_TTL: Duration = Duration::from_secs(60);

/// An in-progress recording for one stream.
struct Recording {
    source_id: u32,
    bursts: Vec<DmrPacket>,
    started: Instant,
    last_burst: Instant,
}

/// The parrot echo service.
pub struct Parrot {
    recordings: DashMap<u32, Recording>,
    bus: Arc<PacketBus>,
    parrot_id: u32,
    inactivity: Duration,
}

impl Parrot {
    /// Create a parrot publishing playback through the given bus.
    pub fn new(bus: Arc<PacketBus>, parrot_id: u32, inactivity: Duration) -> Self {
        Self {
            recordings: DashMap::new(),
            bus,
            parrot_id,
            inactivity,
        }
    }

    /// The reserved id this parrot answers on.
    pub fn parrot_id(&self) -> u32 {
        self.parrot_id
    }

    /// Feed one burst addressed to the parrot.
    pub fn handle(&self, packet: &DmrPacket) {
        let now = Instant::now();
        let stream_id = packet.stream_id;

        {
            let mut recording = self.recordings.entry(stream_id).or_insert_with(|| {
                debug!(
                    "Parrot recording stream {:08x} from {} via repeater {}",
                    stream_id, packet.src, packet.repeater
                );
                Recording {
                    source_id: packet.src,
                    bursts: Vec::new(),
                    started: now,
                    last_burst: now,
                }
            });
            recording.bursts.push(packet.clone());
            recording.last_burst = now;
        }

        if packet.is_voice_terminator() {
            if let Some((_, recording)) = self.recordings.remove(&stream_id) {
                self.start_playback(stream_id, recording);
            }
        }
    }

    /// Close out silent or expired recordings.
    pub fn sweep(&self) {
        let now = Instant::now();

        let expired: Vec<_> = self
            .recordings
            .iter()
            .filter(|e| now.duration_since(e.value().started) > RECORDING_TTL)
            .map(|e| *e.key())
            .collect();
        for stream_id in expired {
            if self.recordings.remove(&stream_id).is_some() {
                warn!("Parrot recording for stream {stream_id:08x} expired unplayed");
            }
        }

        let silent: Vec<_> = self
            .recordings
            .iter()
            .filter(|e| now.duration_since(e.value().last_burst) > self.inactivity)
            .map(|e| *e.key())
            .collect();
        for stream_id in silent {
            if let Some((_, recording)) = self.recordings.remove(&stream_id) {
                self.start_playback(stream_id, recording);
            }
        }
    }

    /// Number of streams currently being recorded.
    pub fn recording_count(&self) -> usize {
        self.recordings.len()
    }

    fn start_playback(&self, stream_id: u32, recording: Recording) {
        info!(
            "Parrot replaying {} bursts of stream {:08x} to {}",
            recording.bursts.len(),
            stream_id,
            recording.source_id
        );

        let bus = Arc::clone(&self.bus);
        let parrot_id = self.parrot_id;

        tokio::spawn(async move {
            for burst in recording.bursts {
                let mut echo = burst;
                echo.dst = echo.src;
                echo.src = parrot_id;
                echo.group_call = false;
                bus.publish_unaddressed(echo);
                sleep(FRAME_INTERVAL).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameType, Timeslot, DTYPE_VOICE_TERMINATOR};
    use crate::DEFAULT_PARROT_ID;

    fn burst(stream_id: u32, sequence: u8) -> DmrPacket {
        DmrPacket {
            sequence,
            src: 3107001,
            dst: DEFAULT_PARROT_ID,
            repeater: 1234567,
            slot: Timeslot::One,
            group_call: false,
            frame_type: FrameType::Voice,
            dtype_vseq: 0,
            stream_id,
            payload: [sequence; 33],
            ber: 0,
            rssi: 0,
        }
    }

    fn terminator(stream_id: u32, sequence: u8) -> DmrPacket {
        let mut p = burst(stream_id, sequence);
        p.frame_type = FrameType::DataSync;
        p.dtype_vseq = DTYPE_VOICE_TERMINATOR;
        p
    }

    #[tokio::test]
    async fn test_playback_preserves_order_and_rewrites_ids() {
        let bus = Arc::new(PacketBus::default());
        let mut rx = bus.subscribe_unaddressed();
        let parrot = Parrot::new(Arc::clone(&bus), DEFAULT_PARROT_ID, Duration::from_secs(1));

        for seq in 0..5 {
            parrot.handle(&burst(0xcafe, seq));
        }
        parrot.handle(&terminator(0xcafe, 5));

        assert_eq!(parrot.recording_count(), 0);

        for seq in 0..=5u8 {
            let echo = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("playback burst expected")
                .unwrap();
            assert_eq!(echo.sequence, seq);
            assert_eq!(echo.src, DEFAULT_PARROT_ID);
            assert_eq!(echo.dst, 3107001);
            assert_eq!(echo.repeater, 1234567);
            assert_eq!(echo.payload, [seq; 33]);
        }
    }

    #[tokio::test]
    async fn test_silent_stream_plays_back_on_sweep() {
        let bus = Arc::new(PacketBus::default());
        let mut rx = bus.subscribe_unaddressed();
        let parrot = Parrot::new(Arc::clone(&bus), DEFAULT_PARROT_ID, Duration::from_millis(10));

        parrot.handle(&burst(0xcafe, 0));
        parrot.handle(&burst(0xcafe, 1));
        assert_eq!(parrot.recording_count(), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        parrot.sweep();
        assert_eq!(parrot.recording_count(), 0);

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("playback burst expected")
            .unwrap();
        assert_eq!(first.sequence, 0);
    }

    #[tokio::test]
    async fn test_streams_are_recorded_independently() {
        let bus = Arc::new(PacketBus::default());
        let parrot = Parrot::new(Arc::clone(&bus), DEFAULT_PARROT_ID, Duration::from_secs(1));

        parrot.handle(&burst(0x1111, 0));
        parrot.handle(&burst(0x2222, 0));

        assert_eq!(parrot.recording_count(), 2);
    }
}
