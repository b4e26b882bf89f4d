//! XEP-0313: Message Archive Management query and result payloads.

use chrono::{DateTime, Utc};

use crate::minidom::Element;

use crate::stanza::{format_timestamp, ncname, ns, parse_timestamp};

/// Page size requested from archives.
pub const PAGE_SIZE: u32 = 70;

/// Parameters of one archive page request.
#[derive(Debug, Clone, Default)]
pub struct MamQuery {
    pub query_id: String,
    /// Continue after this archive id.
    pub after: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub max: Option<u32>,
}

fn form_field(var: &str, value: &str, hidden: bool) -> Element {
    let mut field = Element::builder("field", ns::DATA_FORMS).attr(ncname("var"), var);
    if hidden {
        field = field.attr(ncname("type"), "hidden");
    }
    field
        .append(Element::builder("value", ns::DATA_FORMS).append(value).build())
        .build()
}

/// Build the `<query xmlns="urn:xmpp:mam:2">` payload.
pub fn build_query(query: &MamQuery) -> Element {
    let mut form = Element::builder("x", ns::DATA_FORMS)
        .attr(ncname("type"), "submit")
        .append(form_field("FORM_TYPE", ns::MAM_2, true));
    if let Some(start) = query.start {
        form = form.append(form_field("start", &format_timestamp(start), false));
    }
    if let Some(end) = query.end {
        form = form.append(form_field("end", &format_timestamp(end), false));
    }

    let mut set = Element::builder("set", ns::RSM).append(
        Element::builder("max", ns::RSM)
            .append(query.max.unwrap_or(PAGE_SIZE).to_string())
            .build(),
    );
    if let Some(after) = &query.after {
        set = set.append(Element::builder("after", ns::RSM).append(after.as_str()).build());
    }

    Element::builder("query", ns::MAM_2)
        .attr(ncname("queryid"), query.query_id.as_str())
        .append(form.build())
        .append(set.build())
        .build()
}

/// The `<fin>` element closing a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MamFin {
    pub complete: bool,
    pub first: Option<String>,
    pub last: Option<String>,
}

pub fn parse_fin(iq: &Element) -> Option<MamFin> {
    let fin = iq.get_child("fin", ns::MAM_2)?;
    let complete = matches!(fin.attr("complete"), Some("true" | "1"));
    let set = fin.get_child("set", ns::RSM);
    let rsm_text = |name: &str| {
        set.and_then(|s| s.get_child(name, ns::RSM))
            .map(|e| e.text())
            .filter(|t| !t.is_empty())
    };
    Some(MamFin {
        complete,
        first: rsm_text("first"),
        last: rsm_text("last"),
    })
}

/// A message forwarded from an archive.
#[derive(Debug, Clone)]
pub struct ArchivedMessage {
    pub query_id: Option<String>,
    /// Archive id of the message.
    pub id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// The original `<message>`.
    pub message: Element,
}

pub fn parse_archived(stanza: &Element) -> Option<ArchivedMessage> {
    let result = stanza.get_child("result", ns::MAM_2)?;
    let forwarded = result.get_child("forwarded", ns::FORWARD)?;
    let message = forwarded.get_child("message", ns::JABBER_CLIENT)?;
    let timestamp = forwarded
        .get_child("delay", ns::DELAY)
        .and_then(|d| d.attr("stamp"))
        .and_then(parse_timestamp);
    Some(ArchivedMessage {
        query_id: result.attr("queryid").map(String::from),
        id: result.attr("id").map(String::from),
        timestamp,
        message: message.clone(),
    })
}

/// `(id, by)` pairs of XEP-0359 `<stanza-id>` elements.
pub fn parse_stanza_ids(message: &Element) -> Vec<(String, String)> {
    message
        .children()
        .filter(|c| c.name() == "stanza-id" && c.ns() == ns::STANZA_ID)
        .filter_map(|c| Some((c.attr("id")?.to_string(), c.attr("by")?.to_string())))
        .collect()
}

/// XEP-0359 `<origin-id>`.
pub fn parse_origin_id(message: &Element) -> Option<String> {
    message
        .get_child("origin-id", ns::STANZA_ID)
        .and_then(|c| c.attr("id"))
        .map(String::from)
}

/// Wrap `message` the way an archive delivers it. Used by tests and fake servers.
pub fn build_result_message(
    archive: Option<&str>,
    query_id: &str,
    archive_id: &str,
    stamp: DateTime<Utc>,
    message: Element,
) -> Element {
    let forwarded = Element::builder("forwarded", ns::FORWARD)
        .append(
            Element::builder("delay", ns::DELAY)
                .attr(ncname("stamp"), format_timestamp(stamp))
                .build(),
        )
        .append(message)
        .build();
    let result = Element::builder("result", ns::MAM_2)
        .attr(ncname("queryid"), query_id)
        .attr(ncname("id"), archive_id)
        .append(forwarded)
        .build();
    let mut outer = Element::builder("message", ns::JABBER_CLIENT);
    if let Some(archive) = archive {
        outer = outer.attr(ncname("from"), archive);
    }
    outer.append(result).build()
}

/// Build a `<fin>` payload. Used by tests and fake servers.
pub fn build_fin(complete: bool, last: Option<&str>) -> Element {
    let mut set = Element::builder("set", ns::RSM);
    if let Some(last) = last {
        set = set.append(Element::builder("last", ns::RSM).append(last).build());
    }
    let mut fin = Element::builder("fin", ns::MAM_2);
    if complete {
        fin = fin.attr(ncname("complete"), "true");
    }
    fin.append(set.build()).build()
}
