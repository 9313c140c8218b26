//! HTML helpers behind the `parse_html` capability.
//!
//! Scripts hold HTML as plain strings; these helpers parse on demand and
//! return JSON strings that the bootstrap wrapper turns back into objects.
//! `scraper`'s parsed documents are not `Send`, so nothing parsed ever
//! crosses the host/script bridge — only strings do.

use std::collections::BTreeMap;

use scraper::{Html, Selector};

/// Run a CSS selector over an HTML document, returning a JSON array of
/// matches. Each match carries its outer HTML, whitespace-normalized text,
/// and attribute map.
pub fn select(html: &str, selector: &str) -> Result<String, String> {
    let parsed =
        Selector::parse(selector).map_err(|e| format!("invalid selector '{selector}': {e}"))?;
    let document = Html::parse_document(html);

    let matches: Vec<serde_json::Value> = document
        .select(&parsed)
        .map(|element| {
            let attributes: BTreeMap<String, String> = element
                .value()
                .attrs()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            serde_json::json!({
                "html": element.html(),
                "text": normalize_whitespace(&element.text().collect::<String>()),
                "attributes": attributes,
            })
        })
        .collect();

    Ok(serde_json::Value::Array(matches).to_string())
}

/// Whole-document text content, whitespace-normalized.
pub fn text(html: &str) -> String {
    let document = Html::parse_document(html);
    normalize_whitespace(&document.root_element().text().collect::<String>())
}

fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}
