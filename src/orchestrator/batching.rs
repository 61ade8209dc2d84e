//! Normalization, item ids and greedy batch packing

use crate::core::config::BucketCaps;

/// Collapse runs of whitespace to one space and trim
pub fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Stable id of a normalized text in a target language
pub fn item_id(normalized: &str, target_lang: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(target_lang.as_bytes());
    hasher.update(b"|");
    hasher.update(normalized.as_bytes());
    let hex = hasher.finalize().to_hex();
    hex.as_str()[..32].to_string()
}

/// Greedily pack `items` in order.
///
/// A batch is flushed before an item that would exceed either cap. An item
/// larger than `max_chars` still goes out, alone.
pub fn pack<T>(items: Vec<T>, caps: BucketCaps, weight: impl Fn(&T) -> usize) -> Vec<Vec<T>> {
    let max_items = caps.max_items.max(1);
    let mut batches = Vec::new();
    let mut current: Vec<T> = Vec::new();
    let mut chars = 0usize;

    for item in items {
        let w = weight(&item);
        let overflows = current.len() + 1 > max_items || chars + w > caps.max_chars;
        if overflows && !current.is_empty() {
            batches.push(std::mem::take(&mut current));
            chars = 0;
        }
        chars += w;
        current.push(item);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
