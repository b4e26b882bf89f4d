//! XEP-0030: Service Discovery.

use crate::minidom::Element;

use crate::stanza::{ncname, ns};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub category: String,
    pub kind: String,
    pub name: Option<String>,
}

/// Parsed `disco#info` result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoInfo {
    pub jid: String,
    pub identities: Vec<Identity>,
    pub features: Vec<String>,
}

impl DiscoInfo {
    pub fn supports(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }

    pub fn has_identity(&self, category: &str, kind: &str) -> bool {
        self.identities
            .iter()
            .any(|i| i.category == category && i.kind == kind)
    }

    pub fn is_muc(&self) -> bool {
        self.has_identity("conference", "text")
    }
}

pub fn build_info_query() -> Element {
    Element::builder("query", ns::DISCO_INFO).build()
}

pub fn build_items_query() -> Element {
    Element::builder("query", ns::DISCO_ITEMS).build()
}

/// Parse a `disco#info` IQ result. `default_jid` is used when the result
/// carries no `from` (answers from our own account).
pub fn parse_info(iq: &Element, default_jid: &str) -> Option<DiscoInfo> {
    let query = iq.get_child("query", ns::DISCO_INFO)?;
    let identities = query
        .children()
        .filter(|c| c.name() == "identity")
        .filter_map(|c| {
            Some(Identity {
                category: c.attr("category")?.to_string(),
                kind: c.attr("type")?.to_string(),
                name: c.attr("name").map(String::from),
            })
        })
        .collect();
    let features = query
        .children()
        .filter(|c| c.name() == "feature")
        .filter_map(|c| c.attr("var").map(String::from))
        .collect();
    Some(DiscoInfo {
        jid: iq.attr("from").unwrap_or(default_jid).to_string(),
        identities,
        features,
    })
}

/// JIDs listed in a `disco#items` IQ result.
pub fn parse_items(iq: &Element) -> Vec<String> {
    iq.get_child("query", ns::DISCO_ITEMS)
        .map(|query| {
            query
                .children()
                .filter(|c| c.name() == "item")
                .filter_map(|c| c.attr("jid").map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

/// Build a `disco#info` result payload, used by tests and fake servers.
pub fn build_info_result(identities: &[(&str, &str)], features: &[&str]) -> Element {
    let mut query = Element::builder("query", ns::DISCO_INFO);
    for (category, kind) in identities {
        query = query.append(
            Element::builder("identity", ns::DISCO_INFO)
                .attr(ncname("category"), *category)
                .attr(ncname("type"), *kind)
                .build(),
        );
    }
    for feature in features {
        query = query.append(
            Element::builder("feature", ns::DISCO_INFO)
                .attr(ncname("var"), *feature)
                .build(),
        );
    }
    query.build()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::build_iq;

    #[test]
    fn parse_server_info() {
        let payload = build_info_result(&[("server", "im")], &[ns::MAM_2, ns::BLOCKING]);
        let iq = build_iq("d1", "result", None, Some(payload));
        let info = parse_info(&iq, "capulet.lit").unwrap();
        assert_eq!(info.jid, "capulet.lit");
        assert!(info.supports(ns::MAM_2));
        assert!(!info.supports(ns::CARBONS));
        assert!(info.has_identity("server", "im"));
        assert!(!info.is_muc());
    }

    #[test]
    fn parse_missing_query() {
        let iq = build_iq("d2", "result", None, None);
        assert!(parse_info(&iq, "capulet.lit").is_none());
        assert!(parse_items(&iq).is_empty());
    }

    #[test]
    fn parse_item_list() {
        let query = Element::builder("query", ns::DISCO_ITEMS)
            .append(
                Element::builder("item", ns::DISCO_ITEMS)
                    .attr(ncname("jid"), "conference.capulet.lit")
                    .build(),
            )
            .append(
                Element::builder("item", ns::DISCO_ITEMS)
                    .attr(ncname("jid"), "upload.capulet.lit")
                    .build(),
            )
            .build();
        let iq = build_iq("d3", "result", None, Some(query));
        assert_eq!(parse_items(&iq), vec![
            "conference.capulet.lit",
            "upload.capulet.lit"
        ]);
    }
}
