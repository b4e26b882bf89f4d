//! XEP-0030: server and account discovery.

use {anyhow::Result, tracing::{debug, error, warn}};

use crate::{
    core::{Core, Deferred, UserData},
    engine::StanzaHandler,
    events::EventKind,
    minidom::Element,
    modules::{Module, NamedModule, StanzaOutcome},
    stanza::{build_iq, ncname, new_id, ns},
    state::ClientState,
    xep::disco::{self, DiscoInfo},
};

/// Features we answer `disco#info` queries with.
const CLIENT_FEATURES: &[&str] = &[
    ns::DISCO_INFO,
    ns::CHAT_STATES,
    ns::RECEIPTS,
    ns::MUC,
    ns::OOB,
];

#[derive(Debug, Clone, Copy)]
enum Request {
    ServerInfo,
    AccountInfo,
    ServerItems,
}

#[derive(Debug, Default)]
pub struct Discovery {
    server_info: Option<DiscoInfo>,
    account_info: Option<DiscoInfo>,
    server_items: Vec<String>,
}

impl NamedModule for Discovery {
    const NAME: &'static str = "Discovery";
}

impl Discovery {
    pub fn server_info(&self) -> Option<&DiscoInfo> {
        self.server_info.as_ref()
    }

    pub fn account_info(&self) -> Option<&DiscoInfo> {
        self.account_info.as_ref()
    }

    pub fn server_items(&self) -> &[String] {
        &self.server_items
    }

    fn query(core: &mut Core, to: &str, payload: Element, request: Request) {
        let iq = build_iq(&new_id(), "get", Some(to), Some(payload));
        core.send_iq(Self::NAME, iq, Box::new(request));
    }

    pub fn discover_server_info(&mut self, core: &mut Core) {
        let domain = core.domain().to_string();
        Self::query(core, &domain, disco::build_info_query(), Request::ServerInfo);
    }

    pub fn discover_account_info(&mut self, core: &mut Core) {
        let own = core.own_jid().to_string();
        Self::query(core, &own, disco::build_info_query(), Request::AccountInfo);
    }

    pub fn discover_server_items(&mut self, core: &mut Core) {
        let domain = core.domain().to_string();
        Self::query(core, &domain, disco::build_items_query(), Request::ServerItems);
    }

    fn answer_info_query(core: &mut Core, request: &Element) {
        let mut query = Element::builder("query", ns::DISCO_INFO).append(
            Element::builder("identity", ns::DISCO_INFO)
                .attr(ncname("category"), "client")
                .attr(ncname("type"), "pc")
                .attr(ncname("name"), "Gajim")
                .build(),
        );
        for feature in CLIENT_FEATURES {
            query = query.append(
                Element::builder("feature", ns::DISCO_INFO)
                    .attr(ncname("var"), *feature)
                    .build(),
            );
        }
        let id = request.attr("id").unwrap_or_default();
        core.send_stanza(build_iq(id, "result", request.attr("from"), Some(query.build())));
    }
}

impl Module for Discovery {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn handlers(&self) -> Vec<StanzaHandler> {
        vec![
            StanzaHandler::new("iq", Self::NAME, "info-query")
                .ns(ns::DISCO_INFO)
                .typ("get"),
        ]
    }

    fn handle_stanza(
        &mut self,
        core: &mut Core,
        _tag: &'static str,
        stanza: &Element,
    ) -> Result<StanzaOutcome> {
        Self::answer_info_query(core, stanza);
        Ok(StanzaOutcome::Processed)
    }

    fn on_iq_response(&mut self, core: &mut Core, response: &Element, user_data: UserData) -> Result<()> {
        let Ok(request) = user_data.downcast::<Request>() else {
            anyhow::bail!("unexpected disco context");
        };
        let is_error = response.attr("type") == Some("error");

        match *request {
            Request::ServerInfo => {
                if is_error {
                    error!(account = %core.account(), "server disco failed, sign-in stalls");
                    return Ok(());
                }
                let domain = core.domain().to_string();
                let Some(info) = disco::parse_info(response, &domain) else {
                    anyhow::bail!("server disco result without query");
                };
                debug!(account = %core.account(), features = info.features.len(), "server disco received");
                self.server_info = Some(info.clone());
                core.raise(EventKind::ServerDiscoReceived);
                core.defer(Deferred::PassDisco(info));
                core.defer(Deferred::ConnectMachine { restart: true });
            },
            Request::AccountInfo => {
                if is_error {
                    warn!(account = %core.account(), "account disco failed");
                    return Ok(());
                }
                let own = core.own_jid().to_string();
                if let Some(info) = disco::parse_info(response, &own) {
                    self.account_info = Some(info.clone());
                    core.defer(Deferred::PassDisco(info));
                }
            },
            Request::ServerItems => {
                if is_error {
                    warn!(account = %core.account(), "server items disco failed");
                    return Ok(());
                }
                self.server_items = disco::parse_items(response);
            },
        }
        Ok(())
    }

    fn on_state_changed(&mut self, _core: &mut Core, state: ClientState) {
        if state.is_disconnected() {
            self.server_info = None;
            self.account_info = None;
            self.server_items.clear();
        }
    }
}
