//! The seven inbound command handlers.
//!
//! Each handler validates the layout, checks the session state, mutates
//! the session store, and queues its reply on the `outgoing` topic. No
//! handler ever returns an error to the dispatch loop: per-packet failures
//! are logged and answered on the wire.

use std::net::SocketAddr;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::bus::RawPacket;
use crate::error::ProtocolError;
use crate::protocol::{ack, nak, pong, radio_id_at, DmrPacket, RptcConfig, Timeslot};
use crate::store::{ConnectionState, RepeaterSession, RoutingView};

use super::DmrServer;

impl DmrServer {
    fn reply(&self, addr: SocketAddr, data: Vec<u8>) {
        self.bus.publish_outgoing(RawPacket { addr, data });
    }

    /// `RPTL`: admission and challenge.
    pub(super) fn handle_rptl(&self, raw: &RawPacket) {
        let Ok(radio_id) = radio_id_at(&raw.data, 4) else {
            warn!("Malformed RPTL from {}", raw.addr);
            return;
        };

        if !self.registry.repeater_exists(radio_id) {
            warn!(
                "Dropping login from {}: {}",
                raw.addr,
                ProtocolError::UnknownRepeater(radio_id)
            );
            self.reply(raw.addr, nak(radio_id));
            return;
        }

        // A login always mints a fresh salt; a second login from a
        // different address supersedes the first session.
        let salt: u32 = rand::random();
        self.store
            .store(Arc::new(RepeaterSession::new(radio_id, raw.addr, salt)));
        self.reply(raw.addr, ack(&salt.to_be_bytes()));
        self.store
            .update_connection(radio_id, ConnectionState::AuthSent);

        info!("Repeater {radio_id} logging in from {}", raw.addr);
    }

    /// `RPTK`: verify the challenge digest.
    pub(super) fn handle_rptk(&self, raw: &RawPacket) {
        let Ok(radio_id) = radio_id_at(&raw.data, 4) else {
            warn!("Malformed RPTK from {}", raw.addr);
            return;
        };

        if raw.data.len() < 40 {
            warn!("Malformed RPTK from {} ({} bytes)", raw.addr, raw.data.len());
            return;
        }

        let Some(session) = self.store.get(radio_id) else {
            warn!("RPTK for {radio_id} without a session");
            self.reply(raw.addr, nak(radio_id));
            return;
        };

        let authenticated = session.state().is_login_pending()
            && match (session.salt(), self.registry.get(radio_id)) {
                (Some(salt), Some(record)) => {
                    let mut hasher = Sha256::new();
                    hasher.update(salt.to_be_bytes());
                    hasher.update(record.password.as_bytes());
                    hasher.finalize().as_slice() == &raw.data[8..40]
                }
                _ => false,
            };

        if !authenticated {
            warn!("{}", ProtocolError::BadCredential(radio_id));
            self.reply(raw.addr, nak(radio_id));
            self.store
                .update_connection(radio_id, ConnectionState::Disconnected);
            self.store.delete(radio_id);
            return;
        }

        session.clear_salt();
        self.store
            .update_connection(radio_id, ConnectionState::Authed);
        self.reply(raw.addr, ack(&radio_id.to_be_bytes()));

        info!("Repeater {radio_id} authenticated");
    }

    /// `RPTC`: parse and persist the station configuration.
    pub(super) fn handle_rptc(&self, raw: &RawPacket) {
        let Ok(radio_id) = radio_id_at(&raw.data, 4) else {
            warn!("Malformed RPTC from {}", raw.addr);
            return;
        };

        let Some(session) = self.store.get(radio_id) else {
            warn!("RPTC for {radio_id} without a session");
            self.reply(raw.addr, nak(radio_id));
            return;
        };

        if !matches!(
            session.state(),
            ConnectionState::Authed | ConnectionState::Configured | ConnectionState::Online
        ) {
            warn!(
                "{}",
                ProtocolError::WrongState {
                    id: radio_id,
                    state: session.state().to_string(),
                    command: "RPTC".into(),
                }
            );
            self.reply(raw.addr, nak(radio_id));
            return;
        }

        let config = match RptcConfig::parse(&raw.data) {
            Ok(config) => config,
            Err(e) => {
                warn!("Bad RPTC from repeater {radio_id}: {e}");
                self.reply(raw.addr, nak(radio_id));
                return;
            }
        };

        // Hotspots announce their owner's callsign; an id that the identity
        // snapshot knows must present the matching callsign.
        if self.identdb.is_valid_user(radio_id)
            && !self.identdb.callsign_matches(radio_id, &config.callsign)
        {
            warn!(
                "Repeater {radio_id} claimed callsign {:?} that is not theirs",
                config.callsign
            );
            self.reply(raw.addr, nak(radio_id));
            self.store
                .update_connection(radio_id, ConnectionState::Disconnected);
            self.store.delete(radio_id);
            return;
        }

        if let Err(e) = self.registry.persist_repeater_config(radio_id, &config) {
            tracing::error!("Failed to persist config for repeater {radio_id}: {e}");
            return;
        }

        // Rebuild the routing view from the registry; dynamics start empty
        // on a fresh configuration.
        let mut view = RoutingView::default();
        if let Some(record) = self.registry.get(radio_id) {
            view.owner_id = record.owner_id;
            view.static_ts1 = record.static_ts1.iter().copied().collect();
            view.static_ts2 = record.static_ts2.iter().copied().collect();
        }
        session.set_view(view);
        session.set_addr(raw.addr);

        self.store
            .update_connection(radio_id, ConnectionState::Configured);
        self.reply(raw.addr, ack(&radio_id.to_be_bytes()));

        info!(
            "Repeater {radio_id} ({}) configured at {}, {}",
            config.callsign, config.location, config.description
        );
    }

    /// `RPTO`: static talkgroup registration via the options string.
    pub(super) fn handle_rpto(&self, raw: &RawPacket) {
        let Ok(radio_id) = radio_id_at(&raw.data, 4) else {
            warn!("Malformed RPTO from {}", raw.addr);
            return;
        };

        let Some(session) = self.store.get(radio_id) else {
            self.reply(raw.addr, nak(radio_id));
            return;
        };

        if !session.state().can_ping() {
            warn!(
                "{}",
                ProtocolError::WrongState {
                    id: radio_id,
                    state: session.state().to_string(),
                    command: "RPTO".into(),
                }
            );
            self.reply(raw.addr, nak(radio_id));
            return;
        }

        let options = String::from_utf8_lossy(&raw.data[8..]).into_owned();
        for pair in options.trim_matches(char::from(0)).trim().split(';') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let slot = match key.trim() {
                "TS1" => Timeslot::One,
                "TS2" => Timeslot::Two,
                other => {
                    debug!("Ignoring unknown option {other:?} from repeater {radio_id}");
                    continue;
                }
            };
            let talkgroups: Vec<u32> = value
                .split(',')
                .filter_map(|tg| tg.trim().parse().ok())
                .collect();

            if let Err(e) = self
                .registry
                .set_static_talkgroups(radio_id, slot, &talkgroups)
            {
                tracing::error!("Failed to persist talkgroups for {radio_id}: {e}");
                continue;
            }
            info!(
                "Repeater {radio_id} static {slot} talkgroups set to {talkgroups:?}"
            );
            session.set_static(slot, talkgroups.into_iter().collect());
        }

        self.reply(raw.addr, ack(&radio_id.to_be_bytes()));
    }

    /// `RPTPING`: heartbeat.
    pub(super) fn handle_rptping(&self, raw: &RawPacket) {
        let Ok(radio_id) = radio_id_at(&raw.data, 7) else {
            warn!("Malformed RPTPING from {}", raw.addr);
            return;
        };

        let Some(session) = self.store.get(radio_id) else {
            self.reply(raw.addr, nak(radio_id));
            return;
        };

        if !session.state().can_ping() {
            debug!(
                "{}",
                ProtocolError::WrongState {
                    id: radio_id,
                    state: session.state().to_string(),
                    command: "RPTPING".into(),
                }
            );
            self.reply(raw.addr, nak(radio_id));
            return;
        }

        // Follow the repeater across NAT rebinds.
        session.set_addr(raw.addr);
        self.store.update_ping(radio_id);
        self.store
            .update_connection(radio_id, ConnectionState::Online);
        self.reply(raw.addr, pong(radio_id));
    }

    /// `RPTCL`: the repeater is closing its connection.
    pub(super) fn handle_rptcl(&self, raw: &RawPacket) {
        let Ok(radio_id) = radio_id_at(&raw.data, 5) else {
            warn!("Malformed RPTCL from {}", raw.addr);
            return;
        };

        self.store
            .update_connection(radio_id, ConnectionState::Disconnected);
        self.store.delete(radio_id);

        info!("Repeater {radio_id} closed its connection");
    }

    /// `DMRA`: talker alias announcement.
    pub(super) fn handle_dmra(&self, raw: &RawPacket) {
        let Ok(radio_id) = radio_id_at(&raw.data, 4) else {
            warn!("Malformed DMRA from {}", raw.addr);
            return;
        };

        if raw.data.len() <= 8 {
            return;
        }

        let alias = String::from_utf8_lossy(&raw.data[8..])
            .trim_matches(|c: char| c == ' ' || c == '\0')
            .to_string();

        if let Some(session) = self.store.get(radio_id) {
            debug!("Repeater {radio_id} announced talker alias {alias:?}");
            session.set_talker_alias(alias);
        }
    }

    /// `DMRD`: voice burst, handed to the router.
    pub(super) fn handle_dmrd(&self, raw: &RawPacket) {
        match DmrPacket::decode(&raw.data) {
            Ok(packet) => {
                if self.config.server.debug {
                    debug!("Burst from {}: {packet}", raw.addr);
                }
                self.router.route(packet);
            }
            Err(e) => warn!("Dropping burst from {}: {e}", raw.addr),
        }
    }
}
