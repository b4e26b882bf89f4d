//! Nested roster group delimiter (XEP-0083).

use {anyhow::Result, tracing::{debug, info}};

use crate::{
    core::{Core, Deferred, UserData},
    minidom::Element,
    modules::{Module, NamedModule},
    stanza::{build_iq, new_id, ns},
};

pub const DEFAULT_DELIMITER: &str = "::";

#[derive(Debug, Clone, Copy)]
enum Request {
    Get,
    SetDefault,
}

#[derive(Debug, Default)]
pub struct Delimiter {
    delimiter: Option<String>,
    available: bool,
}

impl NamedModule for Delimiter {
    const NAME: &'static str = "Delimiter";
}

fn payload(delimiter: Option<&str>) -> Element {
    let mut roster = Element::builder("roster", ns::ROSTER_DELIMITER);
    if let Some(delimiter) = delimiter {
        roster = roster.append(delimiter);
    }
    Element::builder("query", ns::PRIVATE)
        .append(roster.build())
        .build()
}

impl Delimiter {
    pub fn delimiter(&self) -> &str {
        self.delimiter.as_deref().unwrap_or(DEFAULT_DELIMITER)
    }

    pub fn available(&self) -> bool {
        self.available
    }

    pub fn get_roster_delimiter(&mut self, core: &mut Core) {
        let iq = build_iq(&new_id(), "get", None, Some(payload(None)));
        core.send_iq(Self::NAME, iq, Box::new(Request::Get));
    }

    fn set_default(&mut self, core: &mut Core) {
        let iq = build_iq(&new_id(), "set", None, Some(payload(Some(DEFAULT_DELIMITER))));
        core.send_iq(Self::NAME, iq, Box::new(Request::SetDefault));
    }
}

impl Module for Delimiter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_iq_response(&mut self, core: &mut Core, response: &Element, user_data: UserData) -> Result<()> {
        let Ok(request) = user_data.downcast::<Request>() else {
            anyhow::bail!("unexpected delimiter context");
        };
        let is_error = response.attr("type") == Some("error");
        match *request {
            Request::Get => {
                let delimiter = response
                    .get_child("query", ns::PRIVATE)
                    .and_then(|q| q.get_child("roster", ns::ROSTER_DELIMITER))
                    .map(|r| r.text())
                    .filter(|d| !d.is_empty());
                match delimiter {
                    Some(delimiter) if !is_error => {
                        debug!(account = %core.account(), delimiter, "roster delimiter received");
                        self.delimiter = Some(delimiter);
                        self.available = true;
                    },
                    _ if is_error => {
                        info!(account = %core.account(), "private storage not available");
                    },
                    _ => {
                        // Nothing stored yet.
                        self.set_default(core);
                        return Ok(());
                    },
                }
            },
            Request::SetDefault => {
                if !is_error {
                    self.delimiter = Some(DEFAULT_DELIMITER.to_string());
                    self.available = true;
                }
            },
        }
        core.defer(Deferred::ConnectMachine { restart: false });
        Ok(())
    }
}
