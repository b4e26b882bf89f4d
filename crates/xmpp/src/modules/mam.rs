//! XEP-0313 Message Archive Management catch-up.
//!
//! One query may be in flight per archive. Starting a new query for an
//! archive replaces the tracked query id, so pages and messages of the
//! superseded query are dropped when they arrive. Multi-page results are
//! followed with `after=<last>` until the archive reports completion, and
//! only then is the cursor persisted.

use std::collections::{HashMap, HashSet};

use {
    anyhow::Result,
    chrono::{DateTime, Duration, Utc},
    gajim_config::SyncThreshold,
    jid::BareJid,
    tracing::{debug, info, warn},
};

use crate::{
    core::{Core, UserData},
    engine::StanzaHandler,
    events::EventKind,
    minidom::Element,
    modules::{Module, NamedModule, StanzaOutcome},
    stanza::{bare_str, build_iq, error_condition, new_id, ns, parse_bare, resource_str},
    storage::{ArchiveUpdate, LogEntry, MessageKind},
    xep::{
        disco::DiscoInfo,
        mam::{self, MamQuery},
        muc, oob,
    },
};

/// History fetched on the very first sign-in.
pub const SIGNIN_BOOTSTRAP_DAYS: i64 = 7;
/// History fetched when joining a room for the first time.
pub const MUC_FIRST_JOIN_DAYS: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    CatchUp { groupchat: bool },
    Interval,
}

#[derive(Debug, Clone)]
struct MamRequest {
    archive: BareJid,
    query_id: String,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    kind: RequestKind,
}

#[derive(Debug, Default)]
pub struct Mam {
    available: bool,
    query_ids: HashMap<BareJid, String>,
    /// Archives whose catch-up completed in this session.
    catch_up_finished: HashSet<BareJid>,
    /// Joined rooms that advertise an archive.
    muc_archives: HashSet<BareJid>,
}

impl NamedModule for Mam {
    const NAME: &'static str = "MAM";
}

impl Mam {
    pub fn available(&self) -> bool {
        self.available
    }

    pub fn is_catch_up_finished(&self, archive: &BareJid) -> bool {
        self.catch_up_finished.contains(archive)
    }

    /// Query id currently accepted for `archive`.
    pub fn query_id(&self, archive: &BareJid) -> Option<&str> {
        self.query_ids.get(archive).map(String::as_str)
    }

    /// Forget the previous session. Rooms are added again when rejoined.
    pub fn reset_state(&mut self) {
        self.query_ids.clear();
        self.catch_up_finished.clear();
        self.muc_archives.clear();
    }

    pub fn add_muc_archive(&mut self, room: &BareJid) {
        self.muc_archives.insert(room.clone());
    }

    pub fn remove_muc_archive(&mut self, room: &BareJid) {
        if self.muc_archives.remove(room) {
            debug!(%room, "room archive no longer tracked");
        }
        self.catch_up_finished.remove(room);
    }

    pub fn has_muc_archive(&self, room: &BareJid) -> bool {
        self.muc_archives.contains(room)
    }

    fn new_query_id(&mut self, archive: &BareJid) -> String {
        let query_id = new_id();
        if let Some(previous) = self.query_ids.insert(archive.clone(), query_id.clone()) {
            warn!(%archive, previous, "superseding running archive request");
        }
        query_id
    }

    fn make_query(&mut self, core: &mut Core, request: MamRequest, after: Option<String>) {
        let query = mam::build_query(&MamQuery {
            query_id: request.query_id.clone(),
            after,
            start: request.start,
            end: request.end,
            max: None,
        });
        let iq = build_iq(&new_id(), "set", Some(&request.archive.to_string()), Some(query));
        if core.send_iq(Self::NAME, iq, Box::new(request.clone())).is_none() {
            warn!(account = %core.account(), archive = %request.archive, "archive request not sent");
        }
    }

    /// Catch up with our own archive after sign-in.
    pub fn request_archive_on_signin(&mut self, core: &mut Core) {
        let own = core.own_jid().clone();

        let mam_id = match core.archive().get_archive_infos(&own) {
            Some(info) => info.last_mam_id,
            // Cursor stored by older versions in the account config.
            None => core.config.last_mam_id.take(),
        };

        let start = if let Some(mam_id) = &mam_id {
            info!(account = %core.account(), archive = %own, mam_id, "request archive after id");
            None
        } else {
            let start = core.now_utc() - Duration::days(SIGNIN_BOOTSTRAP_DAYS);
            info!(account = %core.account(), archive = %own, %start, "request archive after date");
            Some(start)
        };

        let query_id = self.new_query_id(&own);
        self.catch_up_finished.remove(&own);
        self.make_query(
            core,
            MamRequest {
                archive: own,
                query_id,
                start,
                end: None,
                kind: RequestKind::CatchUp { groupchat: false },
            },
            mam_id,
        );
    }

    /// Catch up with a room archive after joining it.
    pub fn request_archive_on_muc_join(&mut self, core: &mut Core, room: &BareJid) {
        let archive = core.archive().get_archive_infos(room);
        let threshold = core.config().sync_threshold(&room.to_string());
        debug!(account = %core.account(), %room, ?threshold, "sync threshold");
        let now = core.now_utc();

        let mut mam_id = None;
        let mut start = None;
        match archive {
            Some(info) if info.last_mam_id.is_some() => match threshold {
                SyncThreshold::NoThreshold => {
                    mam_id = info.last_mam_id;
                },
                SyncThreshold::Days(days) => {
                    let last = info.last_muc_timestamp.unwrap_or_else(|| {
                        info!(account = %core.account(), %room, "no last room timestamp");
                        0
                    });
                    let days = i64::from(days);
                    if now.timestamp() - last > days * 86_400 {
                        start = Some(now - Duration::days(days));
                        info!(account = %core.account(), %room, days, "absent too long, applying threshold");
                    } else {
                        mam_id = info.last_mam_id;
                    }
                },
            },
            _ => {
                start = Some(now - Duration::days(MUC_FIRST_JOIN_DAYS));
            },
        }
        info!(account = %core.account(), %room, ?mam_id, ?start, "request room archive");

        self.catch_up_finished.remove(room);
        let query_id = self.new_query_id(room);
        self.make_query(
            core,
            MamRequest {
                archive: room.clone(),
                query_id,
                start,
                end: None,
                kind: RequestKind::CatchUp { groupchat: true },
            },
            mam_id,
        );
    }

    /// Fetch an explicit range of our own archive. Returns the query id that
    /// `archiving-interval-finished` will carry.
    pub fn request_archive_interval(
        &mut self,
        core: &mut Core,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> String {
        let own = core.own_jid().clone();
        info!(account = %core.account(), archive = %own, ?start, ?end, "request interval");
        let query_id = self.new_query_id(&own);
        self.make_query(
            core,
            MamRequest {
                archive: own,
                query_id: query_id.clone(),
                start,
                end,
                kind: RequestKind::Interval,
            },
            None,
        );
        query_id
    }

    fn result_finished(&mut self, core: &mut Core, request: MamRequest, response: &Element) {
        let archive = request.archive.clone();
        if self.query_ids.get(&archive) != Some(&request.query_id) {
            debug!(account = %core.account(), %archive, query_id = request.query_id, "dropping superseded archive result");
            return;
        }
        self.query_ids.remove(&archive);
        let RequestKind::CatchUp { groupchat } = request.kind else {
            return;
        };

        if response.attr("type") == Some("error") {
            let condition = error_condition(response);
            warn!(account = %core.account(), %archive, ?condition, "archive request failed");
            if condition.as_deref() == Some("item-not-found") {
                if let Err(e) = core.archive().reset_archive_infos(&archive) {
                    warn!(account = %core.account(), %archive, "failed to reset cursor: {e}");
                }
                if groupchat {
                    self.request_archive_on_muc_join(core, &archive);
                } else {
                    self.request_archive_on_signin(core);
                }
            }
            return;
        }

        let Some(fin) = mam::parse_fin(response) else {
            warn!(account = %core.account(), %archive, "archive result without fin");
            return;
        };

        if !fin.complete {
            if let Some(last) = fin.last.clone() {
                let query_id = self.new_query_id(&archive);
                debug!(account = %core.account(), %archive, last, "requesting next page");
                self.make_query(core, MamRequest { query_id, ..request }, Some(last));
                return;
            }
            warn!(account = %core.account(), %archive, "incomplete page without last id");
        }

        self.catch_up_finished.insert(archive.clone());
        info!(account = %core.account(), %archive, last = ?fin.last, "archive request finished");

        // No <last> means the page was empty, the cursor stays.
        if let Some(last) = fin.last {
            let update = ArchiveUpdate {
                last_mam_id: Some(last),
                last_muc_timestamp: Some(core.now_utc().timestamp()),
                ..Default::default()
            };
            if let Err(e) = core.archive().set_archive_infos(&archive, update) {
                warn!(account = %core.account(), %archive, "failed to store cursor: {e}");
            }
        }
        if let Some(start) = request.start
            && !groupchat
        {
            let update = ArchiveUpdate {
                oldest_mam_timestamp: Some(start.timestamp()),
                ..Default::default()
            };
            if let Err(e) = core.archive().set_archive_infos(&archive, update) {
                warn!(account = %core.account(), %archive, "failed to store oldest timestamp: {e}");
            }
        }
    }

    fn interval_finished(&mut self, core: &mut Core, request: MamRequest, response: &Element) {
        let archive = request.archive.clone();
        if self.query_ids.get(&archive) != Some(&request.query_id) {
            debug!(account = %core.account(), %archive, "dropping superseded interval result");
            return;
        }
        self.query_ids.remove(&archive);
        if response.attr("type") == Some("error") {
            warn!(account = %core.account(), %archive, "interval request failed");
            return;
        }
        let Some(fin) = mam::parse_fin(response) else {
            return;
        };

        if !fin.complete
            && let Some(last) = fin.last
        {
            // Keep the query id so listeners can match the final event.
            self.query_ids
                .insert(archive.clone(), request.query_id.clone());
            self.make_query(core, request, Some(last));
            return;
        }

        let oldest = request.start.map_or(0, |s| s.timestamp());
        if let Err(e) = core.archive().set_archive_infos(&archive, ArchiveUpdate {
            oldest_mam_timestamp: Some(oldest),
            ..Default::default()
        }) {
            warn!(account = %core.account(), %archive, "failed to store oldest timestamp: {e}");
        }
        core.raise(EventKind::ArchivingIntervalFinished {
            query_id: request.query_id,
        });
    }

    /// Advance the cursor with live messages once catch-up is done.
    fn set_message_archive_info(&mut self, core: &mut Core, stanza: &Element) {
        let has_body = stanza.get_child("body", ns::JABBER_CLIENT).is_some();
        let is_subject = stanza.get_child("subject", ns::JABBER_CLIENT).is_some() && !has_body;
        if stanza.get_child("result", ns::MAM_2).is_some()
            || stanza.get_child("event", ns::PUBSUB_EVENT).is_some()
            || is_subject
        {
            return;
        }

        let (archive, timestamp) = if stanza.attr("type") == Some("groupchat") {
            let Some(room) = stanza.attr("from").and_then(parse_bare) else {
                return;
            };
            if !self.muc_archives.contains(&room) {
                return;
            }
            (room, Some(core.now_utc().timestamp()))
        } else {
            if !self.available {
                return;
            }
            (core.own_jid().clone(), None)
        };

        let archive_str = archive.to_string();
        let Some((stanza_id, _)) = mam::parse_stanza_ids(stanza)
            .into_iter()
            .find(|(_, by)| *by == archive_str)
        else {
            return;
        };
        if !self.is_catch_up_finished(&archive) {
            return;
        }
        if let Err(e) = core.archive().set_archive_infos(&archive, ArchiveUpdate {
            last_mam_id: Some(stanza_id),
            last_muc_timestamp: timestamp,
            ..Default::default()
        }) {
            warn!(account = %core.account(), %archive, "failed to store cursor: {e}");
        }
    }

    fn mam_message_received(&mut self, core: &mut Core, stanza: &Element) -> StanzaOutcome {
        let Some(archived) = mam::parse_archived(stanza) else {
            return StanzaOutcome::Continue;
        };
        let own = core.own_jid().clone();
        let own_str = own.to_string();
        let archive = match stanza.attr("from") {
            Some(from) => match parse_bare(from) {
                Some(jid) => jid,
                None => {
                    warn!(account = %core.account(), from, "archive message with invalid sender");
                    return StanzaOutcome::Processed;
                },
            },
            None => own.clone(),
        };

        core.raise(EventKind::MamMessageReceived {
            archive: archive.clone(),
            query_id: archived.query_id.clone(),
        });

        let message = &archived.message;
        let msg_from = message.attr("from").unwrap_or_default();
        let msg_to = message.attr("to").unwrap_or_default();
        let is_groupchat = message.attr("type") == Some("groupchat");

        let expected_archive = if is_groupchat {
            parse_bare(msg_from)
        } else {
            Some(own.clone())
        };
        if expected_archive.as_ref() != Some(&archive) {
            warn!(account = %core.account(), %archive, "message from invalid archive");
            return StanzaOutcome::Processed;
        }

        if self.query_ids.get(&archive).map(String::as_str) != archived.query_id.as_deref() {
            warn!(account = %core.account(), %archive, query_id = ?archived.query_id, "unknown query id");
            return StanzaOutcome::Processed;
        }
        info!(account = %core.account(), %archive, "received message from archive");

        let sent = bare_str(msg_from) == own_str;
        let kind = if is_groupchat {
            MessageKind::GcMsg
        } else if sent {
            MessageKind::ChatMsgSent
        } else {
            MessageKind::ChatMsgRecv
        };
        let is_self_message = !is_groupchat && sent && bare_str(msg_to) == own_str;
        let is_muc_pm = !is_groupchat && muc::has_muc_user(message);
        let message_id = message.attr("id").map(String::from);

        let (mut stanza_id, unique_message_id) = if is_groupchat {
            (archived.id.clone(), None)
        } else if is_self_message {
            (None, message_id.clone())
        } else if is_muc_pm || sent {
            (archived.id.clone(), message_id.clone())
        } else {
            (archived.id.clone(), None)
        };

        if core.archive().find_stanza_id(
            core.account(),
            &archive,
            stanza_id.as_deref(),
            unique_message_id.as_deref(),
            is_groupchat,
        ) {
            info!(account = %core.account(), ?stanza_id, message_id = ?unique_message_id, "found duplicate");
            return StanzaOutcome::Processed;
        }

        let Some(body) = message
            .get_child("body", ns::JABBER_CLIENT)
            .map(|b| b.text())
            .filter(|b| !b.is_empty())
        else {
            // Chat states, receipts and markers carry no body.
            debug!(account = %core.account(), "archived message without body");
            return StanzaOutcome::Processed;
        };

        let contact = if sent { msg_to } else { msg_from };
        let with = if is_groupchat || !is_muc_pm {
            bare_str(contact).to_string()
        } else {
            contact.to_string()
        };

        if is_self_message {
            // Self messages can only be deduplicated by their message id.
            if unique_message_id.is_none() {
                warn!(account = %core.account(), "self message without id");
                return StanzaOutcome::Processed;
            }
            stanza_id = unique_message_id;
        }

        let contact_name = if is_groupchat || is_muc_pm {
            resource_str(msg_from).map(String::from)
        } else {
            None
        };
        let timestamp = archived.timestamp.unwrap_or_else(|| core.now_utc()).timestamp();
        let entry = LogEntry {
            account: core.account().to_string(),
            jid: with,
            timestamp,
            kind,
            message: body,
            contact_name,
            stanza_id,
            message_id,
            archive: archive.to_string(),
            oob_url: oob::parse_oob_url(message),
        };
        if let Err(e) = core.archive().insert_into_logs(entry.clone()) {
            warn!(account = %core.account(), "failed to store archived message: {e}");
        }
        core.raise(EventKind::MamDecryptedMessageReceived {
            archive,
            kind,
            entry,
        });
        StanzaOutcome::Processed
    }
}

impl Module for Mam {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn handlers(&self) -> Vec<StanzaHandler> {
        vec![
            StanzaHandler::new("message", Self::NAME, "archive-info").priority(41),
            StanzaHandler::new("message", Self::NAME, "archived")
                .ns(ns::MAM_2)
                .priority(51),
        ]
    }

    fn handle_stanza(
        &mut self,
        core: &mut Core,
        tag: &'static str,
        stanza: &Element,
    ) -> Result<StanzaOutcome> {
        match tag {
            "archive-info" => {
                self.set_message_archive_info(core, stanza);
                Ok(StanzaOutcome::Continue)
            },
            _ => Ok(self.mam_message_received(core, stanza)),
        }
    }

    fn on_iq_response(&mut self, core: &mut Core, response: &Element, user_data: UserData) -> Result<()> {
        let Ok(request) = user_data.downcast::<MamRequest>() else {
            anyhow::bail!("unexpected archive request context");
        };
        match request.kind {
            RequestKind::CatchUp { .. } => self.result_finished(core, *request, response),
            RequestKind::Interval => self.interval_finished(core, *request, response),
        }
        Ok(())
    }

    fn pass_disco(&mut self, core: &mut Core, info: &DiscoInfo) {
        if !info.supports(ns::MAM_2) || info.jid != core.own_jid().to_string() {
            return;
        }
        self.available = true;
        info!(account = %core.account(), jid = %info.jid, "discovered MAM");
        core.raise(EventKind::FeatureDiscovered {
            feature: ns::MAM_2.to_string(),
        });
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use gajim_config::MucRoomConfig;

    use super::*;
    use crate::{
        engine::EngineSignal,
        stanza::{format_timestamp, ncname},
        storage::ArchiveStore,
        test_support::{Harness, OWN_JID, account_config},
        xep::mam::{build_fin, build_result_message},
    };

    const ROOM: &str = "garden@chat.capulet.lit";

    fn room() -> BareJid {
        ROOM.parse().unwrap()
    }

    fn own() -> BareJid {
        OWN_JID.parse().unwrap()
    }

    fn field(iq: &Element, var: &str) -> Option<String> {
        iq.get_child("query", ns::MAM_2)?
            .get_child("x", ns::DATA_FORMS)?
            .children()
            .find(|f| f.attr("var") == Some(var))
            .and_then(|f| f.get_child("value", ns::DATA_FORMS))
            .map(|v| v.text())
    }

    fn after(iq: &Element) -> Option<String> {
        iq.get_child("query", ns::MAM_2)?
            .get_child("set", ns::RSM)?
            .get_child("after", ns::RSM)
            .map(|a| a.text())
    }

    fn query_id_of(iq: &Element) -> Option<String> {
        iq.get_child("query", ns::MAM_2)?
            .attr("queryid")
            .map(String::from)
    }

    fn store_room_cursor(h: &Harness, mam_id: &str, days_ago: i64) {
        let visited = h.clock_utc() - Duration::days(days_ago);
        h.store
            .set_archive_infos(&room(), ArchiveUpdate {
                last_mam_id: Some(mam_id.into()),
                last_muc_timestamp: Some(visited.timestamp()),
                ..Default::default()
            })
            .unwrap();
    }

    fn join_query(h: &mut Harness) -> Element {
        let room = room();
        h.client
            .with_module::<Mam, _>(|mam, core| mam.request_archive_on_muc_join(core, &room))
            .unwrap();
        h.find_iq_to(ns::MAM_2, Some(ROOM)).unwrap()
    }

    fn with_room_threshold(days: u32) -> Harness {
        let mut config = account_config();
        config.muc_rooms.insert(ROOM.into(), MucRoomConfig {
            sync_threshold: Some(days),
            ..Default::default()
        });
        let mut h = Harness::with_config(config);
        h.connect_and_sign_in(&[]);
        h
    }

    fn chat_from_romeo(id: &str, body: &str) -> Element {
        Element::builder("message", ns::JABBER_CLIENT)
            .attr(ncname("from"), "romeo@montague.lit/orchard")
            .attr(ncname("to"), OWN_JID)
            .attr(ncname("type"), "chat")
            .attr(ncname("id"), id)
            .append(Element::builder("body", ns::JABBER_CLIENT).append(body).build())
            .build()
    }

    /// Start a catch-up of our own archive and return its query id.
    fn own_catch_up(h: &mut Harness) -> String {
        h.client
            .with_module::<Mam, _>(|mam, core| mam.request_archive_on_signin(core))
            .unwrap();
        h.client.module::<Mam>().unwrap().query_id(&own()).unwrap().to_string()
    }

    fn deliver(h: &mut Harness, query_id: &str, archive_id: &str, message: Element) {
        let stamp = h.clock_utc() - Duration::hours(2);
        let wrapped = build_result_message(None, query_id, archive_id, stamp, message);
        h.signal(EngineSignal::StanzaReceived(wrapped));
    }

    fn count(h: &Harness, name: &str) -> usize {
        h.event_names().iter().filter(|n| **n == name).count()
    }

    #[test]
    fn first_room_join_fetches_one_day() {
        let mut h = Harness::new();
        h.connect_and_sign_in(&[]);
        let query = join_query(&mut h);

        let expected = format_timestamp(h.clock_utc() - Duration::days(MUC_FIRST_JOIN_DAYS));
        assert_eq!(field(&query, "start"), Some(expected));
        assert_eq!(after(&query), None);
    }

    #[test]
    fn no_threshold_resumes_from_cursor() {
        let mut h = with_room_threshold(0);
        store_room_cursor(&h, "room-42", 60);
        let query = join_query(&mut h);

        assert_eq!(after(&query).as_deref(), Some("room-42"));
        assert_eq!(field(&query, "start"), None);
    }

    #[test]
    fn threshold_limits_long_absences() {
        let mut h = with_room_threshold(2);
        store_room_cursor(&h, "room-42", 3);
        let query = join_query(&mut h);

        let expected = format_timestamp(h.clock_utc() - Duration::days(2));
        assert_eq!(field(&query, "start"), Some(expected));
        assert_eq!(after(&query), None);
    }

    #[test]
    fn threshold_resumes_after_short_absences() {
        let mut h = with_room_threshold(2);
        store_room_cursor(&h, "room-42", 1);
        let query = join_query(&mut h);

        assert_eq!(after(&query).as_deref(), Some("room-42"));
        assert_eq!(field(&query, "start"), None);
    }

    #[test]
    fn archived_message_is_logged_once() {
        let mut h = Harness::new();
        h.connect_and_sign_in(&[]);
        let query_id = own_catch_up(&mut h);

        deliver(&mut h, &query_id, "arch-1", chat_from_romeo("m-1", "hello"));
        let logs = h.store.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, MessageKind::ChatMsgRecv);
        assert_eq!(logs[0].jid, "romeo@montague.lit");
        assert_eq!(logs[0].stanza_id.as_deref(), Some("arch-1"));

        deliver(&mut h, &query_id, "arch-1", chat_from_romeo("m-1", "hello"));
        assert_eq!(h.store.logs().len(), 1);
        assert_eq!(count(&h, "mam-message-received"), 2);
        assert_eq!(count(&h, "mam-decrypted-message-received"), 1);
    }

    #[test]
    fn live_message_is_not_logged_again_from_archive() {
        let mut h = Harness::new();
        h.connect_and_sign_in(&[]);
        h.store
            .insert_into_logs(LogEntry {
                account: h.client.account().to_string(),
                jid: "romeo@montague.lit".into(),
                timestamp: h.clock_utc().timestamp(),
                kind: MessageKind::ChatMsgRecv,
                message: "hello".into(),
                contact_name: None,
                stanza_id: Some("arch-7".into()),
                message_id: None,
                archive: OWN_JID.into(),
                oob_url: None,
            })
            .unwrap();
        let query_id = own_catch_up(&mut h);

        deliver(&mut h, &query_id, "arch-7", chat_from_romeo("m-7", "hello"));
        assert_eq!(h.store.logs().len(), 1);
        assert_eq!(count(&h, "mam-decrypted-message-received"), 0);
    }

    #[test]
    fn superseded_query_results_are_dropped() {
        let mut h = Harness::new();
        h.connect_and_sign_in(&[]);
        let stale = own_catch_up(&mut h);
        let current = own_catch_up(&mut h);
        assert_ne!(stale, current);

        deliver(&mut h, &stale, "arch-1", chat_from_romeo("m-1", "old page"));
        assert!(h.store.logs().is_empty());

        deliver(&mut h, &current, "arch-2", chat_from_romeo("m-2", "new page"));
        let logs = h.store.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "new page");
    }

    #[test]
    fn interval_pages_until_complete() {
        let mut h = Harness::new();
        h.connect_and_sign_in(&[]);
        let end = h.clock_utc() - Duration::days(7);
        let start = end - Duration::days(7);
        let query_id = h
            .client
            .with_module::<Mam, _>(|mam, core| {
                mam.request_archive_interval(core, Some(start), Some(end))
            })
            .unwrap();

        let first = h.find_iq(ns::MAM_2).unwrap();
        assert_eq!(query_id_of(&first).as_deref(), Some(query_id.as_str()));
        assert_eq!(field(&first, "start"), Some(format_timestamp(start)));
        assert_eq!(field(&first, "end"), Some(format_timestamp(end)));

        h.reply(&first, Some(build_fin(false, Some("page-1"))));
        assert_eq!(count(&h, "archiving-interval-finished"), 0);
        let second = h.find_iq(ns::MAM_2).unwrap();
        assert_ne!(second.attr("id"), first.attr("id"));
        assert_eq!(after(&second).as_deref(), Some("page-1"));
        assert_eq!(query_id_of(&second).as_deref(), Some(query_id.as_str()));

        h.reply(&second, Some(build_fin(true, Some("page-2"))));
        let finished: Vec<String> = h
            .events()
            .into_iter()
            .filter_map(|e| match e.kind {
                EventKind::ArchivingIntervalFinished { query_id } => Some(query_id),
                _ => None,
            })
            .collect();
        assert_eq!(finished, vec![query_id]);
        let info = h.store.get_archive_infos(&own()).unwrap();
        assert_eq!(info.oldest_mam_timestamp, Some(start.timestamp()));
        assert!(h.client.module::<Mam>().unwrap().query_id(&own()).is_none());
    }

    #[test]
    fn leaving_a_room_stops_tracking_its_archive() {
        let mut h = Harness::new();
        h.connect_and_sign_in(&[]);
        let room = room();
        h.client.join_muc(&room, Some("jules".into())).unwrap();
        h.client
            .with_module::<Mam, _>(|mam, _| mam.add_muc_archive(&room))
            .unwrap();
        assert!(h.client.module::<Mam>().unwrap().has_muc_archive(&room));

        h.client
            .with_module::<crate::modules::muc::Muc, _>(|muc, core| muc.leave(core, &room))
            .unwrap();
        assert!(!h.client.module::<Mam>().unwrap().has_muc_archive(&room));
    }

    #[test]
    fn reset_forgets_room_archives() {
        let mut mam = Mam::default();
        mam.add_muc_archive(&room());
        mam.reset_state();
        assert!(!mam.has_muc_archive(&room()));
    }
}
