//! XEP-0066: Out of Band Data (media URL attachments).

use crate::{minidom::Element, stanza::ns};

/// Build the `<x xmlns="jabber:x:oob">` payload for a URL attachment.
pub fn build_oob(url: &str, description: Option<&str>) -> Element {
    let mut oob =
        Element::builder("x", ns::OOB).append(Element::builder("url", ns::OOB).append(url).build());

    if let Some(desc) = description {
        oob = oob.append(Element::builder("desc", ns::OOB).append(desc).build());
    }
    oob.build()
}

/// Extract an OOB URL from a message element, if present.
pub fn parse_oob_url(element: &Element) -> Option<String> {
    element
        .get_child("x", ns::OOB)
        .and_then(|x| x.get_child("url", ns::OOB))
        .map(|url| url.text())
        .filter(|url| !url.is_empty())
}
