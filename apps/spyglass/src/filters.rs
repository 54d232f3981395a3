use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One filter entry: an operator plus the candidate values. `is` means
/// case-insensitive equality; any other operator means case-insensitive
/// containment. Absent `values` never matches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterEntry {
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub values: Option<Vec<String>>,
}

pub type FilterMap = HashMap<String, FilterEntry>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Search payload accepted by every discovery endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchPayload {
    #[serde(default)]
    pub filter: FilterMap,
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub order: Option<SortOrder>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub page: Option<usize>,
}

impl SearchPayload {
    pub fn has_filter(&self) -> bool {
        !self.filter.is_empty()
    }

    fn skip(&self) -> usize {
        match (self.page, self.limit) {
            (Some(page), Some(limit)) => page.saturating_sub(1).saturating_mul(limit),
            _ => 0,
        }
    }
}

/// Does the bag satisfy every entry of the filter? An empty filter matches
/// anything; callers treat that as "no filter supplied".
pub fn matches(bag: &Map<String, Value>, filter: &FilterMap) -> bool {
    filter.iter().all(|(key, entry)| entry_matches(bag, key, entry))
}

/// One entry is satisfied by the first attribute that matches; nested bags
/// are searched recursively, so a filter key addresses a leaf attribute at
/// any depth.
fn entry_matches(bag: &Map<String, Value>, key: &str, entry: &FilterEntry) -> bool {
    let Some(values) = entry.values.as_ref() else {
        return false;
    };
    for (attr, value) in bag {
        match value {
            Value::Null => {}
            Value::Object(nested) => {
                if entry_matches(nested, key, entry) {
                    return true;
                }
            }
            leaf => {
                if attr.eq_ignore_ascii_case(key)
                    && leaf_matches(leaf, entry.operator.as_deref(), values)
                {
                    return true;
                }
            }
        }
    }
    false
}

fn leaf_matches(leaf: &Value, operator: Option<&str>, values: &[String]) -> bool {
    let text = leaf_text(leaf).to_lowercase();
    values.iter().any(|candidate| {
        let needle = candidate.to_lowercase();
        match operator {
            Some("is") => text == needle,
            _ => text.contains(&needle),
        }
    })
}

fn leaf_text(leaf: &Value) -> String {
    match leaf {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Collect leaf values under attribute names containing any of the query
/// needles. Feeds autocomplete; the caller dedupes with [`unique`].
pub fn extract_values(bag: &Map<String, Value>, query: &HashMap<String, String>) -> Vec<String> {
    let mut out = Vec::new();
    collect_values(bag, query, &mut out);
    out
}

fn collect_values(bag: &Map<String, Value>, query: &HashMap<String, String>, out: &mut Vec<String>) {
    for (attr, value) in bag {
        match value {
            Value::Null => {}
            Value::Object(nested) => collect_values(nested, query, out),
            leaf => {
                let attr_lower = attr.to_lowercase();
                let hit = query
                    .values()
                    .any(|needle| !needle.is_empty() && attr_lower.contains(&needle.to_lowercase()));
                if hit {
                    out.push(leaf_text(leaf));
                }
            }
        }
    }
}

/// First-seen-wins dedup that keeps discovery order.
pub fn unique(values: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .filter(|value| seen.insert(value.clone()))
        .collect()
}

/// Order by the requested sort key (discovery order when none) and slice
/// the requested page. A skip past the end yields an empty list, never an
/// error.
pub fn sort_paginate(mut items: Vec<Value>, payload: &SearchPayload) -> Vec<Value> {
    if let Some(sort_key) = payload.sort.as_deref() {
        items.sort_by(|a, b| sort_text(a, sort_key).cmp(&sort_text(b, sort_key)));
        if payload.order == Some(SortOrder::Desc) {
            items.reverse();
        }
    }
    paginate(items, payload.skip(), payload.limit)
}

pub fn paginate<T>(items: Vec<T>, skip: usize, limit: Option<usize>) -> Vec<T> {
    items
        .into_iter()
        .skip(skip)
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

fn sort_text(item: &Value, key: &str) -> String {
    item.get(key).map(leaf_text).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bag(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected an object, got {other}"),
        }
    }

    fn entry(operator: &str, values: &[&str]) -> FilterEntry {
        FilterEntry {
            operator: Some(operator.to_string()),
            values: Some(values.iter().map(|v| v.to_string()).collect()),
        }
    }

    #[test_guard::timeout]
    fn empty_filter_matches_everything() {
        let info = bag(json!({"browser": "firefox"}));
        assert!(matches(&info, &FilterMap::new()));
    }

    #[test_guard::timeout]
    fn absent_values_never_match() {
        let info = bag(json!({"browser": "firefox"}));
        let filter = FilterMap::from([(
            "browser".to_string(),
            FilterEntry {
                operator: Some("is".to_string()),
                values: None,
            },
        )]);
        assert!(!matches(&info, &filter));
    }

    #[test_guard::timeout]
    fn is_operator_requires_exact_equality() {
        let info = bag(json!({"browser": "Firefox"}));
        let exact = FilterMap::from([("BROWSER".to_string(), entry("is", &["firefox"]))]);
        let partial = FilterMap::from([("browser".to_string(), entry("is", &["fire"]))]);
        assert!(matches(&info, &exact));
        assert!(!matches(&info, &partial));
    }

    #[test_guard::timeout]
    fn other_operators_use_containment() {
        let info = bag(json!({"userAgent": "Mozilla/5.0 (Macintosh)"}));
        let filter = FilterMap::from([("useragent".to_string(), entry("contains", &["macintosh"]))]);
        assert!(matches(&info, &filter));
    }

    #[test_guard::timeout]
    fn any_listed_value_suffices() {
        let info = bag(json!({"country": "DE"}));
        let filter = FilterMap::from([("country".to_string(), entry("is", &["fr", "de"]))]);
        assert!(matches(&info, &filter));
    }

    #[test_guard::timeout]
    fn nested_bags_are_searched_recursively() {
        let info = bag(json!({"device": {"os": "mac"}, "browser": "safari"}));
        let filter = FilterMap::from([("os".to_string(), entry("is", &["mac"]))]);
        assert!(matches(&info, &filter));

        let miss = FilterMap::from([("os".to_string(), entry("is", &["linux"]))]);
        assert!(!matches(&info, &miss));
    }

    #[test_guard::timeout]
    fn all_entries_must_be_satisfied() {
        let info = bag(json!({"browser": "firefox", "country": "DE"}));
        let filter = FilterMap::from([
            ("browser".to_string(), entry("is", &["firefox"])),
            ("country".to_string(), entry("is", &["FR"])),
        ]);
        assert!(!matches(&info, &filter));
    }

    #[test_guard::timeout]
    fn extract_values_walks_nested_bags() {
        let info = bag(json!({
            "pageTitle": "Checkout",
            "device": {"os": "mac", "osVersion": "14.2"},
            "count": 3
        }));
        let query = HashMap::from([("key".to_string(), "os".to_string())]);
        let mut values = extract_values(&info, &query);
        values.sort();
        assert_eq!(values, vec!["14.2", "mac"]);
    }

    #[test_guard::timeout]
    fn unique_keeps_first_occurrence_order() {
        let values = vec!["b".to_string(), "a".to_string(), "b".to_string()];
        assert_eq!(unique(values), vec!["b", "a"]);
    }

    #[test_guard::timeout]
    fn sorts_by_key_and_order() {
        let items = vec![json!({"n": "b"}), json!({"n": "a"}), json!({"n": "c"})];
        let payload = SearchPayload {
            sort: Some("n".to_string()),
            order: Some(SortOrder::Desc),
            ..SearchPayload::default()
        };
        let sorted = sort_paginate(items, &payload);
        assert_eq!(sorted, vec![json!({"n": "c"}), json!({"n": "b"}), json!({"n": "a"})]);
    }

    #[test_guard::timeout]
    fn pagination_beyond_the_end_is_empty() {
        let items: Vec<Value> = (0..3).map(|n| json!(n)).collect();
        assert!(paginate(items.clone(), 10, Some(5)).is_empty());

        let payload = SearchPayload {
            limit: Some(2),
            page: Some(2),
            ..SearchPayload::default()
        };
        assert_eq!(sort_paginate(items, &payload), vec![json!(2)]);
    }
}
