//! ✂️ Source filtering — include/exclude field lists for captured snapshots.
//!
//! Patterns are dotted field paths (`user.name`) and may contain `*`
//! wildcards, which match any run of characters, dots included. Excludes
//! always win. An empty include list means "everything".

use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct SourceFilter {
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
}

impl SourceFilter {
    pub fn new(includes: Vec<String>, excludes: Vec<String>) -> Self {
        Self { includes, excludes }
    }

    pub fn is_noop(&self) -> bool {
        self.includes.is_empty() && self.excludes.is_empty()
    }

    pub fn apply(&self, source: &Map<String, Value>) -> Map<String, Value> {
        if self.is_noop() {
            return source.clone();
        }
        self.filter_object(source, "", self.includes.is_empty())
    }

    fn filter_object(&self, object: &Map<String, Value>, prefix: &str, included: bool) -> Map<String, Value> {
        let mut filtered = Map::new();
        for (key, value) in object {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };
            if self.excludes.iter().any(|pattern| glob_match(pattern, &path)) {
                continue;
            }
            let included_here = included || self.includes.iter().any(|pattern| glob_match(pattern, &path));
            match value {
                Value::Object(child) => {
                    let might_match_below = included_here
                        || self.includes.iter().any(|pattern| could_match_descendant(pattern, &path));
                    let has_excludes_below = self
                        .excludes
                        .iter()
                        .any(|pattern| could_match_descendant(pattern, &path));
                    if included_here && !has_excludes_below {
                        filtered.insert(key.clone(), value.clone());
                    } else if might_match_below {
                        let child = self.filter_object(child, &path, included_here);
                        // -- 🫥 a fully-pruned object only survives if it was asked for by name
                        if !child.is_empty() || included_here {
                            filtered.insert(key.clone(), Value::Object(child));
                        }
                    }
                }
                _ if included_here => {
                    filtered.insert(key.clone(), value.clone());
                }
                _ => {}
            }
        }
        filtered
    }
}

/// `*` matches any run of characters. Everything else matches itself.
fn glob_match(pattern: &str, text: &str) -> bool {
    let (p, t) = (pattern.as_bytes(), text.as_bytes());
    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && p[pi] == b'*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            ti = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == b'*')
}

/// Could `pattern` match some field strictly below `path`?
fn could_match_descendant(pattern: &str, path: &str) -> bool {
    let literal = pattern.split('*').next().unwrap_or_default();
    let below = format!("{path}.");
    if pattern.contains('*') {
        below.starts_with(literal) || literal.starts_with(&below)
    } else {
        pattern.starts_with(&below)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source() -> Map<String, Value> {
        json!({
            "title": "Dune",
            "author": {"name": "Herbert", "born": 1920},
            "stats": {"pages": 412, "reads": 9001},
            "secret": "spice"
        })
        .as_object()
        .cloned()
        .unwrap_or_default()
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn the_one_where_no_filter_means_no_change() {
        assert_eq!(SourceFilter::default().apply(&source()), source());
    }

    #[test]
    fn the_one_where_includes_pick_fields_and_subfields() {
        let filter = SourceFilter::new(strings(&["title", "author.name"]), vec![]);
        assert_eq!(
            Value::Object(filter.apply(&source())),
            json!({"title": "Dune", "author": {"name": "Herbert"}})
        );
    }

    #[test]
    fn the_one_where_excludes_win_even_inside_included_objects() {
        let filter = SourceFilter::new(strings(&["author", "stats"]), strings(&["stats.reads"]));
        assert_eq!(
            Value::Object(filter.apply(&source())),
            json!({"author": {"name": "Herbert", "born": 1920}, "stats": {"pages": 412}})
        );
    }

    #[test]
    fn the_one_where_wildcards_do_wildcard_things() {
        let filter = SourceFilter::new(vec![], strings(&["sec*", "*.born"]));
        let filtered = filter.apply(&source());
        assert!(!filtered.contains_key("secret"));
        assert_eq!(filtered["author"], json!({"name": "Herbert"}));
        assert_eq!(filtered["title"], "Dune");
    }

    #[test]
    fn the_one_where_glob_matching_backtracks_correctly() {
        assert!(glob_match("a*c", "abbbc"));
        assert!(glob_match("*", "anything.at.all"));
        assert!(!glob_match("a*c", "abbbd"));
        assert!(glob_match("a**", "a"));
    }
}
