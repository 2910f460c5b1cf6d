/// Receiving side: keeps the latest change per logical key in each namespace.
///
/// Every namespace decides how a change is keyed and how it is shown to an
/// operator. Storage is last-write-wins with no history, which also absorbs
/// duplicate deliveries from the agent's whole-batch retry.
use std::collections::BTreeMap;

use serde_json::Value;

use crate::event::{ChangeEvent, Namespace};

const ACCOUNTS_KEY: &str = "accounts";

/// One stored change, kept both raw and parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredChange {
    pub raw: String,
    pub parsed: Value,
}

/// Logical key of a change, or `None` when the payload carries none.
pub fn extract_key(namespace: Namespace, payload: &Value) -> Option<String> {
    let key = match namespace {
        Namespace::NetworkManager => payload.get("uuid"),
        Namespace::FirefoxBookmarks => payload.get("value").and_then(|v| v.get("URL")),
        Namespace::OnlineAccounts => {
            return payload.is_object().then(|| ACCOUNTS_KEY.to_string());
        }
        _ => payload.get("key"),
    }?;
    match key {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Value shown next to the key when an operator reviews changes.
pub fn display_value(namespace: Namespace, payload: &Value) -> Value {
    let field = |v: &Value, name: &str| -> String {
        match v.get(name) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    };
    match namespace {
        Namespace::NetworkManager => {
            Value::String(format!("{} - {}", field(payload, "type"), field(payload, "id")))
        }
        Namespace::FirefoxBookmarks => {
            let bookmark = payload.get("value").unwrap_or(&Value::Null);
            Value::String(format!("{} - {}", field(bookmark, "URL"), field(bookmark, "Title")))
        }
        Namespace::OnlineAccounts => payload.clone(),
        _ => payload.get("value").cloned().unwrap_or(Value::Null),
    }
}

#[derive(Debug, Default)]
pub struct Collector {
    stores: BTreeMap<Namespace, BTreeMap<String, StoredChange>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `event` under its logical key. Returns the key, or `None` if the
    /// event was dropped because no key could be extracted.
    pub fn handle(&mut self, event: &ChangeEvent) -> Option<String> {
        let namespace = event.namespace();
        let parsed: Value = match serde_json::from_str(event.payload()) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(%namespace, "dropping undecodable change: {e}");
                return None;
            }
        };
        let Some(key) = extract_key(namespace, &parsed) else {
            tracing::debug!(%namespace, "dropping change without a key");
            return None;
        };
        self.stores.entry(namespace).or_default().insert(
            key.clone(),
            StoredChange {
                raw: event.payload().to_string(),
                parsed,
            },
        );
        Some(key)
    }

    /// Raw payloads stored for `keys`, in the order given. Unknown keys are
    /// skipped.
    pub fn select_subset(&self, namespace: Namespace, keys: &[&str]) -> Vec<String> {
        let Some(store) = self.stores.get(&namespace) else {
            return Vec::new();
        };
        keys.iter()
            .filter_map(|k| store.get(*k))
            .map(|c| c.raw.clone())
            .collect()
    }

    /// Every stored `(key, display)` pair of `namespace`, sorted by key.
    pub fn dump_all(&self, namespace: Namespace) -> Vec<(String, Value)> {
        self.stores
            .get(&namespace)
            .map(|store| {
                store
                    .iter()
                    .map(|(k, c)| (k.clone(), display_value(namespace, &c.parsed)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Builds a deployable changeset from an operator selection: for each
    /// namespace, the parsed payloads of the selected keys.
    pub fn changeset(
        &self,
        selection: &BTreeMap<Namespace, Vec<String>>,
    ) -> BTreeMap<Namespace, Vec<Value>> {
        let mut out = BTreeMap::new();
        for (namespace, keys) in selection {
            let Some(store) = self.stores.get(namespace) else {
                continue;
            };
            let values: Vec<Value> = keys
                .iter()
                .filter_map(|k| store.get(k))
                .map(|c| c.parsed.clone())
                .collect();
            if !values.is_empty() {
                out.insert(*namespace, values);
            }
        }
        out
    }

    /// Namespaces holding at least one change.
    pub fn namespaces(&self) -> impl Iterator<Item = Namespace> + '_ {
        self.stores.keys().copied()
    }

    pub fn len(&self, namespace: Namespace) -> usize {
        self.stores.get(&namespace).map_or(0, |s| s.len())
    }
}
