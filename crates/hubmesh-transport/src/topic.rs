//! Topic naming helpers.
//!
//! Topics are `/`-delimited strings. A trailing `/*` makes a subscription a
//! prefix wildcard, the bare topic `*` matches every publication, and a
//! leading `~` marks the topic ephemeral (forgotten after inactivity).

/// The catch-all topic, matching every publication.
pub const CATCH_ALL: &str = "*";

/// True for ephemeral topics (`~` prefix).
pub fn is_ephemeral(topic: &str) -> bool {
    topic.starts_with('~')
}

/// True for prefix-wildcard subscription keys (`/*` suffix).
pub fn is_wildcard(topic: &str) -> bool {
    topic.ends_with("/*")
}

/// The matching prefix of a wildcard key, trailing slash included:
/// `"org/app/*"` → `Some("org/app/")`.
pub fn wildcard_stem(key: &str) -> Option<&str> {
    if is_wildcard(key) {
        Some(&key[..key.len() - 1])
    } else {
        None
    }
}

/// True when a publication to `topic` should reach subscribers of the
/// wildcard `key`.
pub fn wildcard_matches(key: &str, topic: &str) -> bool {
    wildcard_stem(key).is_some_and(|stem| topic.starts_with(stem))
}
