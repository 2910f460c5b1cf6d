/// Nested key/value tree operations used on network connection profiles.
///
/// A connection profile is a two-level map (`setting → property → value`)
/// and secrets are fetched separately per setting, so the public profile is
/// overlaid with each secrets tree and then scrubbed before it leaves the
/// session.
use serde_json::{Map, Value};

/// Dotted paths that must never be transmitted.
pub const SECRET_PATHS: &[&str] = &[
    "connection.permissions",
    "vpn.data.secrets.Xauth password",
    "vpn.data.secrets.password",
    "vpn.secrets.Xauth password",
    "vpn.secrets.password",
    "802-1x.password",
    "802-11-wireless-security.leap-password",
];

/// Recursively merges `overlay` onto `base`.
///
/// Keys present on one side only are kept. When both sides hold an object the
/// merge recurses; in every other case, including an object/scalar mismatch,
/// the overlay value replaces the base value.
pub fn merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(a), Value::Object(b)) => {
            let mut merged = a.clone();
            for (key, value_b) in b {
                let value = match a.get(key) {
                    Some(value_a) => merge(value_a, value_b),
                    None => value_b.clone(),
                };
                merged.insert(key.clone(), value);
            }
            Value::Object(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}

/// Returns a copy of `tree` with every dotted path in `paths` removed.
/// Paths that do not exist are ignored.
pub fn redact(tree: &Value, paths: &[&str]) -> Value {
    let mut out = tree.clone();
    for path in paths {
        let segments: Vec<&str> = path.split('.').collect();
        if let Value::Object(map) = &mut out {
            remove_path(map, &segments);
        }
    }
    out
}

fn remove_path(map: &mut Map<String, Value>, segments: &[&str]) {
    match segments {
        [] => {}
        [last] => {
            map.remove(*last);
        }
        [head, rest @ ..] => {
            if let Some(Value::Object(child)) = map.get_mut(*head) {
                remove_path(child, rest);
            }
        }
    }
}

/// Looks up a string at `section.key`, the way connection identity fields are
/// stored.
pub fn lookup_str<'a>(tree: &'a Value, section: &str, key: &str) -> Option<&'a str> {
    tree.get(section)?.get(key)?.as_str()
}
