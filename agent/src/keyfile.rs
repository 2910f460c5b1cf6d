//! Minimal reader for desktop key-file documents (`accounts.conf`,
//! `installs.ini`). Values are kept as raw strings.

use anyhow::{bail, Result};
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KeyFile {
    /// Groups in file order, each with its entries in file order.
    groups: Vec<(String, Vec<(String, String)>)>,
}

impl KeyFile {
    pub fn parse(text: &str) -> Result<Self> {
        let mut kf = KeyFile::default();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(rest) = line.strip_prefix('[') {
                let Some(name) = rest.strip_suffix(']') else {
                    bail!("line {}: unterminated group header", idx + 1);
                };
                kf.groups.push((name.to_string(), Vec::new()));
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                bail!("line {}: expected key=value", idx + 1);
            };
            let Some((_, entries)) = kf.groups.last_mut() else {
                bail!("line {}: entry outside of any group", idx + 1);
            };
            entries.push((key.trim().to_string(), value.trim().to_string()));
        }
        Ok(kf)
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|(name, _)| name.as_str())
    }

    /// Last value of `key` in `group`, matching the usual override semantics.
    pub fn get(&self, group: &str, key: &str) -> Option<&str> {
        self.groups
            .iter()
            .filter(|(name, _)| name == group)
            .flat_map(|(_, entries)| entries.iter())
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .last()
    }

    /// All entries of `group` as a map. Duplicate keys keep the last value.
    pub fn entries(&self, group: &str) -> BTreeMap<String, String> {
        self.groups
            .iter()
            .filter(|(name, _)| name == group)
            .flat_map(|(_, entries)| entries.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# comment
[Account account_1]
Provider=google
Identity = user@example.com

[Install4F96D1932A9F858E]
Default=abc.default-release
Locked=1
";

    #[test]
    fn parses_groups_in_order() {
        let kf = KeyFile::parse(SAMPLE).unwrap();
        let groups: Vec<&str> = kf.groups().collect();
        assert_eq!(groups, vec!["Account account_1", "Install4F96D1932A9F858E"]);
    }

    #[test]
    fn values_are_trimmed() {
        let kf = KeyFile::parse(SAMPLE).unwrap();
        assert_eq!(kf.get("Account account_1", "Identity"), Some("user@example.com"));
        assert_eq!(kf.get("Account account_1", "Missing"), None);
        assert_eq!(kf.entries("Account account_1").len(), 2);
    }

    #[test]
    fn later_duplicate_wins() {
        let kf = KeyFile::parse("[g]\nk=1\nk=2\n").unwrap();
        assert_eq!(kf.get("g", "k"), Some("2"));
        assert_eq!(kf.entries("g")["k"], "2");
    }

    #[test]
    fn value_may_contain_equals() {
        let kf = KeyFile::parse("[g]\nurl=http://x/?a=b\n").unwrap();
        assert_eq!(kf.get("g", "url"), Some("http://x/?a=b"));
    }

    #[test]
    fn malformed_lines_are_errors() {
        assert!(KeyFile::parse("k=v\n").is_err());
        assert!(KeyFile::parse("[g\n").is_err());
        assert!(KeyFile::parse("[g]\njunk\n").is_err());
    }
}
