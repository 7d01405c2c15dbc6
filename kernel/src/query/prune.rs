//! Zone-map pruning: decide from an `Add`'s per-column min/max/null-count
//! whether a file can possibly contain a matching row. Always conservative;
//! a file is only skipped when the statistics prove no row can match.

use std::cmp::Ordering;

use serde_json::Value;

use crate::actions::{Add, Stats};
use crate::query::filter::{compare_values, Filter, Node, Op};

/// `false` means every row in the file is provably excluded by `filter`.
pub(crate) fn file_may_match(filter: &Filter, add: &Add) -> bool {
    let Some(stats) = add.parsed_stats() else {
        return true;
    };
    match filter.root() {
        None => true,
        Some(node) => node_may_match(node, &stats),
    }
}

fn node_may_match(node: &Node, stats: &Stats) -> bool {
    match node {
        Node::And(children) => children.iter().all(|c| node_may_match(c, stats)),
        Node::Or(children) => {
            children.is_empty() || children.iter().any(|c| node_may_match(c, stats))
        }
        // Negations cannot be refuted from bounds alone.
        Node::Not(_) => true,
        Node::Field { path, ops } => {
            // Only top-level columns carry statistics.
            let [column] = path.as_slice() else {
                return true;
            };
            ops.iter().all(|op| op_may_match(op, column, stats))
        }
    }
}

fn op_may_match(op: &Op, column: &str, stats: &Stats) -> bool {
    let min = stats.min_values.get(column).filter(|v| !v.is_null());
    let max = stats.max_values.get(column).filter(|v| !v.is_null());
    let nulls = stats.null_count.get(column).copied();
    // A column whose every value is null (or that never appears) can only
    // satisfy null-tolerant predicates.
    let all_null = nulls == Some(stats.num_records) && stats.num_records > 0;
    let column_tracked = min.is_some() || max.is_some() || nulls.is_some();

    match op {
        Op::Eq(target) => {
            if all_null {
                return target.is_null();
            }
            within_bounds(target, min, max)
        }
        Op::In(items) => {
            if all_null {
                return items.iter().any(Value::is_null);
            }
            items.is_empty() || items.iter().any(|item| within_bounds(item, min, max))
        }
        Op::Gt(target) => {
            !all_null && max.map_or(true, |m| cmp(m, target) == Some(Ordering::Greater))
        }
        Op::Gte(target) => {
            !all_null && max.map_or(true, |m| cmp(m, target) != Some(Ordering::Less))
        }
        Op::Lt(target) => {
            !all_null && min.map_or(true, |m| cmp(m, target) == Some(Ordering::Less))
        }
        Op::Lte(target) => {
            !all_null && min.map_or(true, |m| cmp(m, target) != Some(Ordering::Greater))
        }
        Op::Exists(true) => !(column_tracked && all_null),
        Op::Exists(false) => nulls.map_or(true, |n| n > 0) || !column_tracked,
        // No pruning power.
        Op::Ne(_) | Op::Nin(_) | Op::Regex(_) | Op::Not(_) => true,
    }
}

/// Comparison that only prunes when both sides are comparable scalars; any
/// uncertainty keeps the file.
fn cmp(a: &Value, b: &Value) -> Option<Ordering> {
    compare_values(a, b)
}

fn within_bounds(target: &Value, min: Option<&Value>, max: Option<&Value>) -> bool {
    if let Some(min) = min {
        match cmp(target, min) {
            Some(Ordering::Less) => return false,
            Some(_) => {}
            None => return true,
        }
    }
    if let Some(max) = max {
        match cmp(target, max) {
            Some(Ordering::Greater) => return false,
            Some(_) => {}
            None => return true,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn add_with_stats(min: Value, max: Value, nulls: u64, records: u64) -> Add {
        let stats = Stats {
            num_records: records,
            min_values: HashMap::from([("v".to_string(), min)]),
            max_values: HashMap::from([("v".to_string(), max)]),
            null_count: HashMap::from([("v".to_string(), nulls)]),
        };
        Add {
            path: "part-x.parquet".to_string(),
            partition_values: HashMap::new(),
            size: 1,
            modification_time: 0,
            data_change: true,
            stats: Some(serde_json::to_string(&stats).unwrap()),
        }
    }

    fn filter(v: Value) -> Filter {
        Filter::new(v).unwrap()
    }

    #[test]
    fn eq_outside_bounds_prunes() {
        let add = add_with_stats(json!(10), json!(20), 0, 5);
        assert!(!file_may_match(&filter(json!({"v": 5})), &add));
        assert!(!file_may_match(&filter(json!({"v": 25})), &add));
        assert!(file_may_match(&filter(json!({"v": 15})), &add));
    }

    #[test]
    fn range_operators_prune() {
        let add = add_with_stats(json!(10), json!(20), 0, 5);
        assert!(!file_may_match(&filter(json!({"v": {"$gt": 20}})), &add));
        assert!(file_may_match(&filter(json!({"v": {"$gte": 20}})), &add));
        assert!(!file_may_match(&filter(json!({"v": {"$lt": 10}})), &add));
        assert!(file_may_match(&filter(json!({"v": {"$lte": 10}})), &add));
    }

    #[test]
    fn in_prunes_only_when_every_member_is_out() {
        let add = add_with_stats(json!(10), json!(20), 0, 5);
        assert!(!file_may_match(&filter(json!({"v": {"$in": [1, 2]}})), &add));
        assert!(file_may_match(&filter(json!({"v": {"$in": [1, 15]}})), &add));
    }

    #[test]
    fn missing_stats_never_prune() {
        let add = Add {
            path: "p".to_string(),
            partition_values: HashMap::new(),
            size: 1,
            modification_time: 0,
            data_change: true,
            stats: None,
        };
        assert!(file_may_match(&filter(json!({"v": 999})), &add));
    }

    #[test]
    fn or_needs_every_branch_refuted() {
        let add = add_with_stats(json!(10), json!(20), 0, 5);
        assert!(!file_may_match(
            &filter(json!({"$or": [{"v": 1}, {"v": 2}]})),
            &add
        ));
        assert!(file_may_match(
            &filter(json!({"$or": [{"v": 1}, {"v": 15}]})),
            &add
        ));
    }

    #[test]
    fn string_bounds() {
        let add = add_with_stats(json!("alice"), json!("carol"), 0, 3);
        assert!(!file_may_match(&filter(json!({"v": "zed"})), &add));
        assert!(file_may_match(&filter(json!({"v": "bob"})), &add));
        // cross-type target keeps the file
        assert!(file_may_match(&filter(json!({"v": 42})), &add));
    }

    #[test]
    fn all_null_columns() {
        let add = add_with_stats(json!(null), json!(null), 4, 4);
        assert!(!file_may_match(&filter(json!({"v": 7})), &add));
        assert!(!file_may_match(&filter(json!({"v": {"$exists": true}})), &add));
        assert!(file_may_match(&filter(json!({"v": {"$exists": false}})), &add));
    }
}
