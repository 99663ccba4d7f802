//! Routing of voice bursts to subscribed peers.
//!
//! Given a burst from an online repeater, the router computes the set of
//! peer repeaters that want a copy and on which timeslot, rewrites the
//! slot bit and repeater field per target, and publishes the copies to the
//! `outgoing-noaddr` topic.
//!
//! Subscription precedence, first match wins:
//!
//! 1. destination is the peer's radio id (original slot)
//! 2. destination is the peer's owner id (original slot)
//! 3. destination is the peer's dynamic talkgroup on TS2 (force TS2)
//! 4. destination is the peer's dynamic talkgroup on TS1 (force TS1)
//! 5. destination is static on the peer's TS2 (force TS2)
//! 6. destination is static on the peer's TS1 (force TS1)
//!
//! The sender and a receiver may subscribe to the same talkgroup on
//! different physical slots; the router is authoritative about which slot
//! a peer hears a talkgroup on. The precedence order guarantees a burst is
//! never duplicated to one peer.

use std::sync::Arc;

use tracing::{debug, info};

use crate::bus::PacketBus;
use crate::calls::CallTracker;
use crate::parrot::Parrot;
use crate::protocol::{DmrPacket, Timeslot};
use crate::store::{RoutingView, SessionStore};

/// The packet router.
pub struct Router {
    store: Arc<SessionStore>,
    tracker: Arc<CallTracker>,
    parrot: Arc<Parrot>,
    bus: Arc<PacketBus>,
}

impl Router {
    pub fn new(
        store: Arc<SessionStore>,
        tracker: Arc<CallTracker>,
        parrot: Arc<Parrot>,
        bus: Arc<PacketBus>,
    ) -> Self {
        Self {
            store,
            tracker,
            parrot,
            bus,
        }
    }

    /// Route one inbound burst.
    pub fn route(&self, packet: DmrPacket) {
        // Bursts from sessions that are not online are dropped silently.
        let Some(source) = self.store.get(packet.repeater) else {
            debug!("Dropping burst from unknown repeater {}", packet.repeater);
            return;
        };
        if !source.state().is_routable() {
            debug!(
                "Dropping burst from repeater {} in state {}",
                packet.repeater,
                source.state()
            );
            return;
        }

        self.tracker.observe(&packet);

        if packet.dst == self.parrot.parrot_id() {
            self.parrot.handle(&packet);
            return;
        }

        if !packet.group_call {
            // A unit call whose destination is itself a connected repeater
            // goes straight to that session.
            if let Some(target) = self.store.get(packet.dst) {
                if target.state().is_routable() {
                    self.emit(&packet, packet.dst, packet.slot);
                } else {
                    debug!(
                        "Dropping unit call to offline repeater {} from {}",
                        packet.dst, packet.src
                    );
                }
                return;
            }
            // Otherwise the destination is a user id; fall through so the
            // subscription scan can deliver to the repeaters they own.
        } else {
            self.update_dynamic(&source.view(), &packet);
        }

        for peer in self.store.online() {
            if peer.radio_id == packet.repeater {
                continue;
            }
            if let Some(slot) = want_rx(&peer.view(), peer.radio_id, &packet) {
                self.emit(&packet, peer.radio_id, slot);
            }
        }
    }

    /// Replace the source slot's dynamic subscription when a group call
    /// lands on a talkgroup the repeater is not already listening to there.
    fn update_dynamic(&self, view: &RoutingView, packet: &DmrPacket) {
        let already = view.static_for(packet.slot).contains(&packet.dst)
            || view.dynamic_for(packet.slot) == Some(packet.dst);
        if already {
            return;
        }

        if let Some(session) = self.store.get(packet.repeater) {
            session.set_dynamic(packet.slot, Some(packet.dst));
            info!(
                "Repeater {} now dynamically subscribed to TG {} on {}",
                packet.repeater, packet.dst, packet.slot
            );
        }
    }

    fn emit(&self, packet: &DmrPacket, target: u32, slot: Timeslot) {
        let mut copy = packet.clone();
        copy.repeater = target;
        copy.slot = slot;
        self.bus.publish_unaddressed(copy);
    }
}

/// Decide whether a peer wants a copy of a burst, and on which slot.
pub fn want_rx(view: &RoutingView, radio_id: u32, packet: &DmrPacket) -> Option<Timeslot> {
    if packet.dst == radio_id {
        return Some(packet.slot);
    }

    if packet.dst == view.owner_id {
        return Some(packet.slot);
    }

    if view.dynamic_ts2 == Some(packet.dst) {
        return Some(Timeslot::Two);
    }

    if view.dynamic_ts1 == Some(packet.dst) {
        return Some(Timeslot::One);
    }

    if view.static_ts2.contains(&packet.dst) {
        return Some(Timeslot::Two);
    }

    if view.static_ts1.contains(&packet.dst) {
        return Some(Timeslot::One);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::CallTracker;
    use crate::protocol::FrameType;
    use crate::registry::Registry;
    use crate::store::{ConnectionState, RepeaterSession};
    use crate::DEFAULT_PARROT_ID;
    use std::collections::HashSet;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn burst(repeater: u32, src: u32, dst: u32, group: bool, slot: Timeslot) -> DmrPacket {
        DmrPacket {
            sequence: 0,
            src,
            dst,
            repeater,
            slot,
            group_call: group,
            frame_type: FrameType::Voice,
            dtype_vseq: 0,
            stream_id: 0xbeef,
            payload: [0u8; 33],
            ber: 0,
            rssi: 0,
        }
    }

    struct Fixture {
        store: Arc<SessionStore>,
        bus: Arc<PacketBus>,
        router: Router,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SessionStore::new());
        let bus = Arc::new(PacketBus::default());
        let registry = Arc::new(Registry::in_memory().unwrap());
        let tracker = Arc::new(CallTracker::new(registry, Duration::from_secs(2)));
        let parrot = Arc::new(Parrot::new(
            Arc::clone(&bus),
            DEFAULT_PARROT_ID,
            Duration::from_secs(1),
        ));
        let router = Router::new(
            Arc::clone(&store),
            tracker,
            parrot,
            Arc::clone(&bus),
        );
        Fixture { store, bus, router }
    }

    fn online(store: &SessionStore, radio_id: u32, port: u16) -> Arc<RepeaterSession> {
        let session = Arc::new(RepeaterSession::new(radio_id, addr(port), 0));
        store.store(Arc::clone(&session));
        store.update_connection(radio_id, ConnectionState::Online);
        session
    }

    #[test]
    fn test_want_rx_precedence() {
        let view = RoutingView {
            owner_id: 3107001,
            static_ts1: HashSet::from([91]),
            static_ts2: HashSet::from([91]),
            dynamic_ts1: Some(91),
            dynamic_ts2: None,
        };
        let packet = burst(1001, 3100999, 1002, false, Timeslot::One);

        // Destination matching the radio id wins over every talkgroup rule.
        assert_eq!(want_rx(&view, 1002, &packet), Some(Timeslot::One));

        // Owner id keeps the original slot.
        let packet = burst(1001, 3100999, 3107001, false, Timeslot::Two);
        assert_eq!(want_rx(&view, 1002, &packet), Some(Timeslot::Two));

        // Dynamic TS1 outranks static TS2 for the same talkgroup.
        let packet = burst(1001, 3100999, 91, true, Timeslot::Two);
        assert_eq!(want_rx(&view, 1002, &packet), Some(Timeslot::One));

        // Static TS2 outranks static TS1 when only statics match.
        let view = RoutingView {
            owner_id: 0,
            static_ts1: HashSet::from([91]),
            static_ts2: HashSet::from([91]),
            dynamic_ts1: None,
            dynamic_ts2: None,
        };
        assert_eq!(want_rx(&view, 1002, &packet), Some(Timeslot::Two));

        // No subscription, no copy.
        let view = RoutingView::default();
        assert_eq!(want_rx(&view, 1002, &packet), None);
    }

    #[tokio::test]
    async fn test_offline_source_is_dropped() {
        let f = fixture();
        let mut rx = f.bus.subscribe_unaddressed();

        let session = Arc::new(RepeaterSession::new(1001, addr(1), 0));
        f.store.store(session);
        f.store.update_connection(1001, ConnectionState::Configured);
        online(&f.store, 1002, 2);

        f.router.route(burst(1001, 3107001, 1002, false, Timeslot::One));

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_unit_call_to_online_repeater() {
        let f = fixture();
        let mut rx = f.bus.subscribe_unaddressed();

        online(&f.store, 1001, 1);
        online(&f.store, 1002, 2);

        f.router.route(burst(1001, 3107001, 1002, false, Timeslot::One));

        let copy = rx.try_recv().unwrap();
        assert_eq!(copy.repeater, 1002);
        assert_eq!(copy.slot, Timeslot::One);
        // Exactly one copy
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_unit_call_to_offline_repeater_is_dropped() {
        let f = fixture();
        let mut rx = f.bus.subscribe_unaddressed();

        online(&f.store, 1001, 1);
        let target = Arc::new(RepeaterSession::new(1002, addr(2), 0));
        f.store.store(target);

        f.router.route(burst(1001, 3107001, 1002, false, Timeslot::One));

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_unit_call_to_owner_reaches_their_repeater() {
        let f = fixture();
        let mut rx = f.bus.subscribe_unaddressed();

        online(&f.store, 1001, 1);
        let peer = online(&f.store, 1002, 2);
        peer.set_view(RoutingView {
            owner_id: 3107001,
            ..Default::default()
        });

        f.router.route(burst(1001, 3100999, 3107001, false, Timeslot::Two));

        let copy = rx.try_recv().unwrap();
        assert_eq!(copy.repeater, 1002);
        assert_eq!(copy.slot, Timeslot::Two);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_group_call_fan_out_with_slot_override() {
        let f = fixture();
        let mut rx = f.bus.subscribe_unaddressed();

        // Sender
        online(&f.store, 1001, 1);
        // Peer statically subscribed on TS2
        let b = online(&f.store, 1002, 2);
        b.set_static(Timeslot::Two, HashSet::from([91]));
        // Peer dynamically subscribed on TS1
        let c = online(&f.store, 1003, 3);
        c.set_dynamic(Timeslot::One, Some(91));
        // Peer with no subscription
        online(&f.store, 1004, 4);

        f.router.route(burst(1001, 3107001, 91, true, Timeslot::One));

        let mut copies = Vec::new();
        while let Ok(copy) = rx.try_recv() {
            copies.push(copy);
        }
        copies.sort_by_key(|c| c.repeater);

        assert_eq!(copies.len(), 2);
        assert_eq!(copies[0].repeater, 1002);
        assert_eq!(copies[0].slot, Timeslot::Two);
        assert_eq!(copies[1].repeater, 1003);
        assert_eq!(copies[1].slot, Timeslot::One);
    }

    #[tokio::test]
    async fn test_group_call_updates_dynamic_subscription() {
        let f = fixture();

        let sender = online(&f.store, 1001, 1);
        f.router.route(burst(1001, 3107001, 91, true, Timeslot::Two));

        assert_eq!(sender.view().dynamic_for(Timeslot::Two), Some(91));
        assert_eq!(sender.view().dynamic_for(Timeslot::One), None);

        // A different talkgroup on the same slot replaces it.
        f.router.route(burst(1001, 3107001, 3100, true, Timeslot::Two));
        assert_eq!(sender.view().dynamic_for(Timeslot::Two), Some(3100));
    }

    #[tokio::test]
    async fn test_static_subscription_suppresses_dynamic_update() {
        let f = fixture();

        let sender = online(&f.store, 1001, 1);
        sender.set_static(Timeslot::One, HashSet::from([91]));

        f.router.route(burst(1001, 3107001, 91, true, Timeslot::One));

        assert_eq!(sender.view().dynamic_for(Timeslot::One), None);
    }

    #[tokio::test]
    async fn test_parrot_destination_short_circuits() {
        let f = fixture();
        let mut rx = f.bus.subscribe_unaddressed();

        online(&f.store, 1001, 1);
        let peer = online(&f.store, 1002, 2);
        peer.set_static(Timeslot::One, HashSet::from([DEFAULT_PARROT_ID]));

        f.router.route(burst(
            1001,
            3107001,
            DEFAULT_PARROT_ID,
            false,
            Timeslot::One,
        ));

        // No fan-out copies; the burst went to the parrot recorder.
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }
}
