//! Pulls `(item_id, published_at)` pairs out of a rendered result page.
//!
//! Each result in the page carries an item-id attribute followed, somewhere
//! later in the markup, by its timestamp attribute (epoch seconds). Pairs are
//! returned in document order, which the source delivers newest-first.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use harvest_common::Item;

static ITEM_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"data-tweet-id="([^"]*)""#).expect("valid regex"));
static ITEM_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"data-time="([^"]*)""#).expect("valid regex"));

pub fn extract_items(html: &str) -> Vec<Item> {
    let mut items = Vec::new();
    let mut pos = 0;

    while let Some(id) = ITEM_ID.captures_at(html, pos) {
        let id_match = id.get(0).map(|m| m.end()).unwrap_or(html.len());
        let item_id = id[1].to_string();

        let Some(time) = ITEM_TIME.captures_at(html, id_match) else {
            break;
        };
        pos = time.get(0).map(|m| m.end()).unwrap_or(html.len());

        match parse_epoch(&time[1]) {
            Some(published_at) if !item_id.is_empty() => items.push(Item {
                item_id,
                published_at,
            }),
            _ => tracing::debug!(item_id, raw = &time[1], "skipping unparseable result"),
        }
    }

    items
}

fn parse_epoch(raw: &str) -> Option<DateTime<Utc>> {
    let secs: i64 = raw.trim().parse().ok()?;
    DateTime::from_timestamp(secs, 0)
}
