/// Chromium bookmark snapshot diffing.
///
/// The browser offers no change notifications for bookmarks, only a JSON file
/// rewritten on every edit. Each snapshot is flattened into one record per
/// URL leaf; a record that changes in any field (move, rename, new URL) shows
/// up as a new record. Removed bookmarks are never reported: they simply stop
/// appearing in later snapshots.
use serde::Serialize;
use serde_json::{json, Value};

/// One flattened bookmark leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookmarkRecord {
    /// Folder names from the root folder down to the leaf's parent.
    pub path: Vec<String>,
    pub id: String,
    pub url: String,
    pub title: String,
}

/// Flattens a parsed `Bookmarks` document. Every entry under `roots` is
/// walked depth-first; non-object roots (e.g. sync metadata) are skipped.
pub fn flatten(document: &Value) -> Vec<BookmarkRecord> {
    let mut records = Vec::new();
    if let Some(roots) = document.get("roots").and_then(Value::as_object) {
        for root in roots.values() {
            walk(root, &mut Vec::new(), &mut records);
        }
    }
    records
}

fn walk(node: &Value, path: &mut Vec<String>, out: &mut Vec<BookmarkRecord>) {
    match node.get("type").and_then(Value::as_str) {
        Some("folder") => {
            path.push(str_field(node, "name"));
            if let Some(children) = node.get("children").and_then(Value::as_array) {
                for child in children {
                    walk(child, path, out);
                }
            }
            path.pop();
        }
        Some("url") => out.push(BookmarkRecord {
            path: path.clone(),
            id: str_field(node, "id"),
            url: str_field(node, "url"),
            title: str_field(node, "name"),
        }),
        _ => {}
    }
}

fn str_field(node: &Value, field: &str) -> String {
    node.get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Multiset difference `new − old`: every record of `new` without a matching
/// unused record in `old`.
pub fn diff(old: &[BookmarkRecord], new: &[BookmarkRecord]) -> Vec<BookmarkRecord> {
    let mut remaining = new.to_vec();
    for record in old {
        if let Some(pos) = remaining.iter().position(|r| r == record) {
            remaining.remove(pos);
        }
    }
    remaining
}

/// Nests flat records back into `{name, children}` folders. The first path
/// element (the browser's root folder such as "Bookmarks bar") is dropped;
/// leaves become `{name, url}`.
pub fn rebuild_tree(records: &[BookmarkRecord]) -> Vec<Value> {
    let mut tree: Vec<Value> = Vec::new();
    for record in records {
        let folders = record.path.get(1..).unwrap_or_default();
        insert(&mut tree, folders, record);
    }
    tree
}

fn insert(children: &mut Vec<Value>, folders: &[String], record: &BookmarkRecord) {
    let Some((head, rest)) = folders.split_first() else {
        children.push(json!({ "name": record.title, "url": record.url }));
        return;
    };

    let existing = children.iter().position(|child| {
        child.get("children").is_some() && child.get("name").and_then(Value::as_str) == Some(head.as_str())
    });
    let index = match existing {
        Some(i) => i,
        None => {
            children.push(json!({ "name": head, "children": [] }));
            children.len() - 1
        }
    };
    if let Some(Value::Array(nested)) = children[index].get_mut("children") {
        insert(nested, rest, record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(id: &str, name: &str, url: &str) -> Value {
        json!({"type": "url", "id": id, "name": name, "url": url})
    }

    fn folder(name: &str, children: Vec<Value>) -> Value {
        json!({"type": "folder", "name": name, "children": children})
    }

    fn document(bar: Vec<Value>, other: Vec<Value>) -> Value {
        json!({
            "checksum": "abc",
            "roots": {
                "bookmark_bar": folder("Bookmarks bar", bar),
                "other": folder("Other bookmarks", other),
                "sync_transaction_version": "1"
            },
            "version": 1
        })
    }

    fn base_tree() -> Value {
        document(
            vec![
                url("1", "Rust", "https://rust-lang.org"),
                folder("Work", vec![url("2", "Wiki", "https://wiki.example")]),
            ],
            vec![url("3", "News", "https://news.example")],
        )
    }

    // ── flatten ───────────────────────────────────────────────────────────────

    #[test]
    fn flatten_collects_every_leaf_with_folder_path() {
        let flat = flatten(&base_tree());
        assert_eq!(flat.len(), 3);
        let wiki = flat.iter().find(|r| r.id == "2").unwrap();
        assert_eq!(wiki.path, vec!["Bookmarks bar", "Work"]);
        assert_eq!(wiki.url, "https://wiki.example");
        assert_eq!(wiki.title, "Wiki");
        let news = flat.iter().find(|r| r.id == "3").unwrap();
        assert_eq!(news.path, vec!["Other bookmarks"]);
    }

    #[test]
    fn flatten_without_roots_is_empty() {
        assert!(flatten(&json!({})).is_empty());
        assert!(flatten(&json!({"roots": []})).is_empty());
    }

    #[test]
    fn flatten_ignores_unknown_node_types() {
        let doc = document(vec![json!({"type": "separator"}), url("9", "A", "a")], vec![]);
        assert_eq!(flatten(&doc).len(), 1);
    }

    // ── diff ──────────────────────────────────────────────────────────────────

    #[test]
    fn diff_of_identical_snapshots_is_empty() {
        let flat = flatten(&base_tree());
        assert!(diff(&flat, &flat).is_empty());
    }

    #[test]
    fn diff_reports_added_bookmark() {
        let old = flatten(&base_tree());
        let new = flatten(&document(
            vec![
                url("1", "Rust", "https://rust-lang.org"),
                folder("Work", vec![url("2", "Wiki", "https://wiki.example")]),
                url("4", "Docs", "https://docs.rs"),
            ],
            vec![url("3", "News", "https://news.example")],
        ));
        let added = diff(&old, &new);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].id, "4");
    }

    #[test]
    fn diff_reports_moved_bookmark() {
        let old = flatten(&base_tree());
        let new = flatten(&document(
            vec![
                url("1", "Rust", "https://rust-lang.org"),
                folder("Work", vec![]),
                url("2", "Wiki", "https://wiki.example"),
            ],
            vec![url("3", "News", "https://news.example")],
        ));
        let changed = diff(&old, &new);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].path, vec!["Bookmarks bar"]);
    }

    #[test]
    fn diff_does_not_report_removals() {
        let old = flatten(&base_tree());
        let new = flatten(&document(vec![], vec![]));
        assert!(diff(&old, &new).is_empty());
    }

    #[test]
    fn diff_is_a_multiset_difference() {
        let record = BookmarkRecord {
            path: vec!["Bookmarks bar".into()],
            id: "7".into(),
            url: "u".into(),
            title: "t".into(),
        };
        let old = vec![record.clone()];
        let new = vec![record.clone(), record.clone()];
        assert_eq!(diff(&old, &new), vec![record]);
    }

    // ── rebuild_tree ──────────────────────────────────────────────────────────

    #[test]
    fn rebuild_tree_nests_by_folder_without_root() {
        let flat = flatten(&base_tree());
        let tree = rebuild_tree(&flat);
        assert_eq!(
            tree,
            vec![
                json!({"name": "Rust", "url": "https://rust-lang.org"}),
                json!({"name": "Work", "children": [{"name": "Wiki", "url": "https://wiki.example"}]}),
                json!({"name": "News", "url": "https://news.example"}),
            ]
        );
    }

    #[test]
    fn rebuild_tree_shares_existing_folders() {
        let doc = document(
            vec![folder(
                "Work",
                vec![url("1", "A", "a"), folder("Deep", vec![url("2", "B", "b")])],
            )],
            vec![],
        );
        let tree = rebuild_tree(&flatten(&doc));
        assert_eq!(tree.len(), 1);
        assert_eq!(
            tree[0],
            json!({"name": "Work", "children": [
                {"name": "A", "url": "a"},
                {"name": "Deep", "children": [{"name": "B", "url": "b"}]}
            ]})
        );
    }

    #[test]
    fn rebuild_of_diff_contains_exactly_new_leaves() {
        let t1 = base_tree();
        let t2 = document(
            vec![
                url("1", "Rust", "https://rust-lang.org"),
                folder(
                    "Work",
                    vec![
                        url("2", "Wiki", "https://wiki.example"),
                        url("5", "CI", "https://ci.example"),
                    ],
                ),
            ],
            vec![url("6", "Blog", "https://blog.example")],
        );
        let tree = rebuild_tree(&diff(&flatten(&t1), &flatten(&t2)));

        fn leaves(nodes: &[Value], out: &mut Vec<String>) {
            for node in nodes {
                if let Some(u) = node.get("url").and_then(Value::as_str) {
                    out.push(u.to_string());
                }
                if let Some(children) = node.get("children").and_then(Value::as_array) {
                    leaves(children, out);
                }
            }
        }
        let mut urls = Vec::new();
        leaves(&tree, &mut urls);
        urls.sort();
        assert_eq!(urls, vec!["https://blog.example", "https://ci.example"]);
    }
}
