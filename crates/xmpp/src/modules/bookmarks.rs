//! XEP-0048 bookmarks in private storage.

use {anyhow::Result, tracing::{info, warn}};

use crate::{
    core::{Core, Deferred, UserData},
    events::EventKind,
    minidom::Element,
    modules::{Module, NamedModule},
    stanza::{build_iq, new_id, ns, parse_bare},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bookmark {
    pub jid: String,
    pub name: Option<String>,
    pub autojoin: bool,
    pub nick: Option<String>,
}

impl Bookmark {
    fn parse(conference: &Element) -> Option<Self> {
        Some(Self {
            jid: conference.attr("jid")?.to_string(),
            name: conference.attr("name").map(String::from),
            autojoin: matches!(conference.attr("autojoin"), Some("true" | "1")),
            nick: conference
                .get_child("nick", ns::BOOKMARKS)
                .map(|n| n.text())
                .filter(|n| !n.is_empty()),
        })
    }
}

#[derive(Debug, Default)]
pub struct Bookmarks {
    bookmarks: Vec<Bookmark>,
}

impl NamedModule for Bookmarks {
    const NAME: &'static str = "Bookmarks";
}

impl Bookmarks {
    pub fn bookmarks(&self) -> &[Bookmark] {
        &self.bookmarks
    }

    /// Ask the server for the stored bookmarks. Returns the IQ id if it was sent.
    pub fn request_bookmarks(&mut self, core: &mut Core) -> Option<String> {
        let query = Element::builder("query", ns::PRIVATE)
            .append(Element::builder("storage", ns::BOOKMARKS).build())
            .build();
        let iq = build_iq(&new_id(), "get", None, Some(query));
        let id = core.send_iq(Self::NAME, iq, Box::new(()));
        if id.is_none() {
            warn!(account = %core.account(), "bookmark request not sent");
        }
        id
    }
}

impl Module for Bookmarks {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_iq_response(&mut self, core: &mut Core, response: &Element, _user_data: UserData) -> Result<()> {
        if response.attr("type") == Some("error") {
            warn!(account = %core.account(), "bookmark request failed");
            return Ok(());
        }
        self.bookmarks = response
            .get_child("query", ns::PRIVATE)
            .and_then(|q| q.get_child("storage", ns::BOOKMARKS))
            .map(|storage| {
                storage
                    .children()
                    .filter(|c| c.name() == "conference")
                    .filter_map(Bookmark::parse)
                    .collect()
            })
            .unwrap_or_default();
        info!(account = %core.account(), count = self.bookmarks.len(), "bookmarks received");

        for bookmark in self.bookmarks.iter().filter(|b| b.autojoin) {
            match parse_bare(&bookmark.jid) {
                Some(room) => core.defer(Deferred::JoinMuc {
                    room,
                    nick: bookmark.nick.clone(),
                }),
                None => warn!(account = %core.account(), jid = %bookmark.jid, "invalid bookmark JID"),
            }
        }
        core.raise(EventKind::BookmarksReceived {
            bookmarks: self.bookmarks.clone(),
        });
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{engine::EngineSignal, stanza::ncname, test_support::Harness};

    fn storage(conferences: Vec<Element>) -> Element {
        Element::builder("query", ns::PRIVATE)
            .append(
                Element::builder("storage", ns::BOOKMARKS)
                    .append_all(conferences)
                    .build(),
            )
            .build()
    }

    fn conference(jid: &str, autojoin: &str, nick: Option<&str>) -> Element {
        let mut builder = Element::builder("conference", ns::BOOKMARKS)
            .attr(ncname("jid"), jid)
            .attr(ncname("autojoin"), autojoin);
        if let Some(nick) = nick {
            builder = builder.append(Element::builder("nick", ns::BOOKMARKS).append(nick).build());
        }
        builder.build()
    }

    #[test]
    fn failed_send_is_reported() {
        let mut h = Harness::new();
        h.client.connect(false);
        h.signal(EngineSignal::Connected);
        let pending = h.client.core().pending_iq_count();

        h.mock().refuse_sends = true;
        let id = h
            .client
            .with_module::<Bookmarks, _>(|m, core| m.request_bookmarks(core))
            .unwrap();
        assert!(id.is_none());
        assert_eq!(h.client.core().pending_iq_count(), pending);
    }

    #[test]
    fn parses_storage_and_reports_it() {
        let mut h = Harness::new();
        h.client.connect(false);
        h.signal(EngineSignal::Connected);
        let id = h
            .client
            .with_module::<Bookmarks, _>(|m, core| m.request_bookmarks(core))
            .unwrap()
            .unwrap();
        let request = h
            .sent()
            .into_iter()
            .find(|s| s.attr("id") == Some(id.as_str()))
            .unwrap();

        h.reply(&request, Some(storage(vec![
            conference("garden@chat.capulet.lit", "false", Some("jules")),
            conference("", "true", None),
        ])));

        let bookmarks = h.client.module::<Bookmarks>().unwrap().bookmarks().to_vec();
        assert_eq!(bookmarks.len(), 2);
        assert_eq!(bookmarks[0].jid, "garden@chat.capulet.lit");
        assert!(!bookmarks[0].autojoin);
        assert_eq!(bookmarks[0].nick.as_deref(), Some("jules"));
        assert!(h.event_names().contains(&"bookmarks-received"));
    }

    #[test]
    fn error_response_keeps_bookmarks_empty() {
        let mut h = Harness::new();
        h.client.connect(false);
        h.signal(EngineSignal::Connected);
        let id = h
            .client
            .with_module::<Bookmarks, _>(|m, core| m.request_bookmarks(core))
            .unwrap()
            .unwrap();
        let request = h
            .sent()
            .into_iter()
            .find(|s| s.attr("id") == Some(id.as_str()))
            .unwrap();

        h.reply_error(&request, "item-not-found");
        assert!(h.client.module::<Bookmarks>().unwrap().bookmarks().is_empty());
    }
}
