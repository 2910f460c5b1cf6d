/// Schema lookup for dconf change notifications.
///
/// Fixed-path schemas can be mapped up front. Relocatable schemas can live at
/// any path, so the only evidence available is the set of keys that changed:
/// a schema is a candidate for a path when it declares every key seen there.
use std::collections::{BTreeSet, HashMap};

/// A relocatable schema and the keys it declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocatableSchema {
    pub id: String,
    pub keys: BTreeSet<String>,
}

impl RelocatableSchema {
    pub fn new<I, S>(id: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

/// Everything known about installed schemas at startup.
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    /// Path → schema id for schemas with a fixed path.
    pub fixed: HashMap<String, String>,
    pub relocatable: Vec<RelocatableSchema>,
}

/// Stateful path → schema resolver.
///
/// Once a path resolves the answer is cached and returned for every later
/// call regardless of the keys passed. Until then the keys seen for the path
/// accumulate, so the candidate set can only shrink.
#[derive(Debug, Default)]
pub struct SchemaResolver {
    known_schema_for_path: HashMap<String, String>,
    relocatable: Vec<RelocatableSchema>,
    pending_keys_for_path: HashMap<String, BTreeSet<String>>,
    resolved_for_path: HashMap<String, String>,
}

impl SchemaResolver {
    pub fn new(catalog: SchemaCatalog) -> Self {
        Self {
            known_schema_for_path: catalog.fixed,
            relocatable: catalog.relocatable,
            pending_keys_for_path: HashMap::new(),
            resolved_for_path: HashMap::new(),
        }
    }

    /// Schema id of a fixed-path schema mounted at exactly `path`.
    pub fn fixed_schema(&self, path: &str) -> Option<&str> {
        self.known_schema_for_path.get(path).map(String::as_str)
    }

    /// Guesses the relocatable schema behind a change at `path` touching
    /// `keys`. Returns `None` while zero or several schemas match.
    pub fn resolve(&mut self, path: &str, keys: &[String]) -> Option<String> {
        if let Some(schema) = self.resolved_for_path.get(path) {
            tracing::debug!(path, schema = %schema, "schema already resolved");
            return Some(schema.clone());
        }

        let mut merged = self.pending_keys_for_path.remove(path).unwrap_or_default();
        merged.extend(keys.iter().cloned());

        let candidates: Vec<&RelocatableSchema> = self
            .relocatable
            .iter()
            .filter(|schema| merged.is_subset(&schema.keys))
            .collect();

        if let [only] = candidates.as_slice() {
            let id = only.id.clone();
            tracing::debug!(path, schema = %id, "schema resolved");
            self.resolved_for_path.insert(path.to_string(), id.clone());
            return Some(id);
        }

        if candidates.is_empty() {
            tracing::debug!(path, keys = ?merged, "no schema declares this key set");
        } else {
            let ids: Vec<&str> = candidates.iter().map(|s| s.id.as_str()).collect();
            tracing::debug!(path, candidates = ?ids, "too many schemas match this key set");
        }
        self.pending_keys_for_path.insert(path.to_string(), merged);
        None
    }

    /// Keys accumulated for a path that has not resolved yet.
    pub fn pending_keys(&self, path: &str) -> Option<&BTreeSet<String>> {
        self.pending_keys_for_path.get(path)
    }
}
