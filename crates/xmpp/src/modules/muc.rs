//! XEP-0045 room membership.

use std::collections::HashMap;

use {
    anyhow::Result,
    jid::BareJid,
    tracing::{debug, info, warn},
};

use crate::{
    core::{Core, Deferred, UserData},
    engine::StanzaHandler,
    events::EventKind,
    minidom::Element,
    modules::{Module, NamedModule, StanzaOutcome},
    stanza::{PresenceContent, build_iq, new_id, ns, parse_bare, resource_str},
    state::ClientState,
    xep::{disco, muc},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Joining,
    Joined,
}

#[derive(Debug, Clone)]
struct Room {
    nick: String,
    state: RoomState,
    mam: bool,
}

#[derive(Debug)]
struct RoomDisco(BareJid);

#[derive(Debug, Default)]
pub struct Muc {
    rooms: HashMap<BareJid, Room>,
}

impl NamedModule for Muc {
    const NAME: &'static str = "MUC";
}

impl Muc {
    pub fn join(&mut self, core: &mut Core, room: &BareJid, nick: &str, presence: &PresenceContent<'_>) {
        if self.rooms.contains_key(room) {
            debug!(account = %core.account(), %room, "already in room");
            return;
        }
        info!(account = %core.account(), %room, nick, "joining room");
        let occupant = format!("{room}/{nick}");
        core.send_stanza(muc::build_join_presence(&occupant, presence));
        self.rooms.insert(room.clone(), Room {
            nick: nick.to_string(),
            state: RoomState::Joining,
            mam: false,
        });
    }

    pub fn leave(&mut self, core: &mut Core, room: &BareJid) {
        if let Some(state) = self.rooms.remove(room) {
            core.send_stanza(muc::build_leave_presence(&format!("{room}/{}", state.nick)));
            core.defer(Deferred::MucLeft(room.clone()));
        }
    }

    /// Resend our presence to every joined room.
    pub fn update_presence(&mut self, core: &mut Core, presence: &PresenceContent<'_>) {
        let targets: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, r)| r.state == RoomState::Joined)
            .map(|(room, r)| format!("{room}/{}", r.nick))
            .collect();
        for occupant in targets {
            core.send_stanza(crate::stanza::build_presence(&PresenceContent {
                to: Some(&occupant),
                ..presence.clone()
            }));
        }
    }

    pub fn room_state(&self, room: &BareJid) -> Option<RoomState> {
        self.rooms.get(room).map(|r| r.state)
    }

    pub fn joined_rooms(&self) -> Vec<BareJid> {
        self.rooms
            .iter()
            .filter(|(_, r)| r.state == RoomState::Joined)
            .map(|(room, _)| room.clone())
            .collect()
    }

    /// Whether the room advertised an archive.
    pub fn supports_mam(&self, room: &BareJid) -> bool {
        self.rooms.get(room).is_some_and(|r| r.mam)
    }

    fn on_presence(&mut self, core: &mut Core, stanza: &Element) {
        let Some(from) = stanza.attr("from") else {
            return;
        };
        let Some(room_jid) = parse_bare(from) else {
            return;
        };
        let Some(room) = self.rooms.get_mut(&room_jid) else {
            return;
        };
        let is_self =
            muc::is_self_presence(stanza) || resource_str(from) == Some(room.nick.as_str());
        if !is_self {
            return;
        }

        match stanza.attr("type") {
            Some("unavailable") => {
                info!(account = %core.account(), room = %room_jid, "left room");
                self.rooms.remove(&room_jid);
                core.defer(Deferred::MucLeft(room_jid));
            },
            Some("error") => {
                warn!(account = %core.account(), room = %room_jid, "failed to join room");
                self.rooms.remove(&room_jid);
                core.defer(Deferred::MucLeft(room_jid));
            },
            _ if room.state == RoomState::Joining => {
                room.state = RoomState::Joined;
                if let Some(nick) = resource_str(from) {
                    room.nick = nick.to_string();
                }
                let nick = room.nick.clone();
                info!(account = %core.account(), room = %room_jid, nick, "joined room");
                core.raise(EventKind::MucJoined {
                    room: room_jid.clone(),
                    nick,
                });
                let iq = build_iq(
                    &new_id(),
                    "get",
                    Some(&room_jid.to_string()),
                    Some(disco::build_info_query()),
                );
                core.send_iq(Self::NAME, iq, Box::new(RoomDisco(room_jid)));
            },
            _ => {},
        }
    }
}

impl Module for Muc {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn handlers(&self) -> Vec<StanzaHandler> {
        vec![
            StanzaHandler::new("presence", Self::NAME, "presence")
                .ns(ns::MUC_USER)
                .priority(49),
        ]
    }

    fn handle_stanza(
        &mut self,
        core: &mut Core,
        _tag: &'static str,
        stanza: &Element,
    ) -> Result<StanzaOutcome> {
        self.on_presence(core, stanza);
        Ok(StanzaOutcome::Continue)
    }

    fn on_iq_response(&mut self, core: &mut Core, response: &Element, user_data: UserData) -> Result<()> {
        let Ok(request) = user_data.downcast::<RoomDisco>() else {
            anyhow::bail!("unexpected room disco context");
        };
        let RoomDisco(room) = *request;
        if response.attr("type") == Some("error") {
            warn!(account = %core.account(), %room, "room disco failed");
            return Ok(());
        }
        let Some(info) = disco::parse_info(response, &room.to_string()) else {
            return Ok(());
        };
        if info.supports(ns::MAM_2)
            && let Some(state) = self.rooms.get_mut(&room)
        {
            state.mam = true;
            core.defer(Deferred::RequestMucArchive(room));
        }
        Ok(())
    }

    fn on_state_changed(&mut self, _core: &mut Core, state: ClientState) {
        if state.is_disconnected() {
            self.rooms.clear();
        }
    }
}
