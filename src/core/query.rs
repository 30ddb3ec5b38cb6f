//! Purpose: Client-side filtering, membership matching, ordering, and limiting of records.
//! Exports: `Op`, `Predicate`, `Query`, `filter`, `filter_by_membership`, `order_and_limit`.
//! Role: Everything between `normalize` and the caller on the read path.
//! Invariants: Filters return order-preserving subsequences of their input.
//! Invariants: Ordering predicates on absent, null, or incomparable values exclude the record.
//! Invariants: Sorting is stable; a limit of zero means "no limit".
use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use super::error::{Error, ErrorKind};
use super::record::Record;
use super::value::{compare_values, sort_order, values_equal};

pub const MEMBERS_FIELD: &str = "users";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Op {
    pub fn symbol(self) -> &'static str {
        match self {
            Op::Eq => "==",
            Op::Ne => "!=",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
        }
    }
}

impl FromStr for Op {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "==" => Ok(Op::Eq),
            "!=" => Ok(Op::Ne),
            "<" => Ok(Op::Lt),
            "<=" => Ok(Op::Le),
            ">" => Ok(Op::Gt),
            ">=" => Ok(Op::Ge),
            other => Err(Error::new(ErrorKind::Usage)
                .with_message(format!("unknown comparison operator `{other}`"))
                .with_hint("Use one of ==, !=, <, <=, >, >=.")),
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Predicate {
    pub field: String,
    pub op: Op,
    pub value: Value,
}

impl Predicate {
    pub fn new(field: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Parses `field<op>value`. The value is JSON when it parses as JSON, else a string.
    pub fn parse(expr: &str) -> Result<Self, Error> {
        let Some((idx, op)) = find_operator(expr) else {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("missing comparison operator in `{expr}`"))
                .with_hint("Example: --where 'sender==user123' or --where 't>=2'"));
        };
        let field = expr[..idx].trim();
        if field.is_empty() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("missing field name in `{expr}`")));
        }
        let raw = expr[idx + op.symbol().len()..].trim();
        let value =
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        Ok(Self::new(field, op, value))
    }

    pub fn matches(&self, record: &Record) -> bool {
        let field = record.get(&self.field);
        match self.op {
            Op::Eq => values_equal(field.unwrap_or(&Value::Null), &self.value),
            Op::Ne => !values_equal(field.unwrap_or(&Value::Null), &self.value),
            Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                let Some(actual) = field.filter(|value| !value.is_null()) else {
                    return false;
                };
                let Some(ordering) = compare_values(actual, &self.value) else {
                    return false;
                };
                match self.op {
                    Op::Lt => ordering.is_lt(),
                    Op::Le => ordering.is_le(),
                    Op::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                }
            }
        }
    }
}

fn find_operator(expr: &str) -> Option<(usize, Op)> {
    for (idx, ch) in expr.char_indices() {
        let op = match (ch, expr[idx + ch.len_utf8()..].chars().next()) {
            ('=', Some('=')) => Op::Eq,
            ('!', Some('=')) => Op::Ne,
            ('<', Some('=')) => Op::Le,
            ('>', Some('=')) => Op::Ge,
            ('<', _) => Op::Lt,
            ('>', _) => Op::Gt,
            _ => continue,
        };
        return Some((idx, op));
    }
    None
}

/// Keeps records satisfying every predicate; an empty list keeps everything.
pub fn filter(records: Vec<Record>, predicates: &[Predicate]) -> Vec<Record> {
    if predicates.is_empty() {
        return records;
    }
    records
        .into_iter()
        .filter(|record| predicates.iter().all(|predicate| predicate.matches(record)))
        .collect()
}

pub fn is_member(record: &Record, identifier: &str) -> bool {
    let needle = Value::String(identifier.to_string());
    match record.get(MEMBERS_FIELD) {
        None | Some(Value::Null) => false,
        Some(Value::Array(members)) => members.iter().any(|member| values_equal(member, &needle)),
        Some(other) => values_equal(other, &needle),
    }
}

pub fn filter_by_membership(records: Vec<Record>, identifier: Option<&str>) -> Vec<Record> {
    match identifier {
        Some(identifier) if !identifier.is_empty() => records
            .into_iter()
            .filter(|record| is_member(record, identifier))
            .collect(),
        _ => records,
    }
}

pub fn order_and_limit(
    mut records: Vec<Record>,
    order_by: Option<&str>,
    limit: Option<usize>,
) -> Vec<Record> {
    if let Some(field) = order_by {
        let missing = Value::String(String::new());
        records.sort_by(|a, b| {
            sort_order(
                a.get(field).unwrap_or(&missing),
                b.get(field).unwrap_or(&missing),
            )
        });
    }
    if let Some(limit) = limit.filter(|limit| *limit > 0) {
        records.truncate(limit);
    }
    records
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Predicate>,
    pub member: Option<String>,
    pub order_by: Option<String>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, predicate: Predicate) -> Self {
        self.filters.push(predicate);
        self
    }

    pub fn with_member(mut self, identifier: impl Into<String>) -> Self {
        self.member = Some(identifier.into());
        self
    }

    pub fn with_order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(field.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn apply(&self, records: Vec<Record>) -> Vec<Record> {
        let records = filter(records, &self.filters);
        let records = filter_by_membership(records, self.member.as_deref());
        order_and_limit(records, self.order_by.as_deref(), self.limit)
    }
}

#[cfg(test)]
mod tests {
    use super::{Op, Predicate, Query, filter, filter_by_membership, order_and_limit};
    use crate::core::record::Record;
    use serde_json::{Value, json};

    fn records(items: &[(&str, Value)]) -> Vec<Record> {
        items
            .iter()
            .map(|(key, value)| Record::from_value(*key, value.clone()))
            .collect()
    }

    fn keys(records: &[Record]) -> Vec<String> {
        records.iter().map(|record| record.key().to_string()).collect()
    }

    #[test]
    fn empty_predicates_are_identity() {
        let input = records(&[("a", json!({"n": 1})), ("b", json!(2))]);
        assert_eq!(filter(input.clone(), &[]), input);
    }

    #[test]
    fn predicates_are_conjunctive() {
        let input = records(&[
            ("a", json!({"sender": "u1", "n": 1})),
            ("b", json!({"sender": "u1", "n": 5})),
            ("c", json!({"sender": "u2", "n": 5})),
        ]);
        let preds = [
            Predicate::new("sender", Op::Eq, "u1"),
            Predicate::new("n", Op::Gt, 2),
        ];
        assert_eq!(keys(&filter(input, &preds)), ["b"]);
    }

    #[test]
    fn equality_treats_missing_field_as_null() {
        let input = records(&[("a", json!({"x": 1})), ("b", json!({"y": 1}))]);
        let missing = filter(input.clone(), &[Predicate::new("x", Op::Eq, Value::Null)]);
        assert_eq!(keys(&missing), ["b"]);
        let present = filter(input, &[Predicate::new("x", Op::Ne, Value::Null)]);
        assert_eq!(keys(&present), ["a"]);
    }

    #[test]
    fn ordering_excludes_missing_null_and_mismatched() {
        let input = records(&[
            ("missing", json!({})),
            ("null", json!({"t": null})),
            ("text", json!({"t": "late"})),
            ("low", json!({"t": 1})),
            ("high", json!({"t": 9.5})),
        ]);
        let kept = filter(input.clone(), &[Predicate::new("t", Op::Ge, 1)]);
        assert_eq!(keys(&kept), ["low", "high"]);
        let kept = filter(input, &[Predicate::new("t", Op::Lt, 5)]);
        assert_eq!(keys(&kept), ["low"]);
    }

    #[test]
    fn filter_can_target_synthesized_key() {
        let input = records(&[("a", json!({})), ("b", json!({}))]);
        let kept = filter(input, &[Predicate::new("key", Op::Eq, "b")]);
        assert_eq!(keys(&kept), ["b"]);
    }

    #[test]
    fn membership_checks_sequences_and_scalars() {
        let input = records(&[
            ("list", json!({"users": ["u1", "u2"]})),
            ("other", json!({"users": ["u3"]})),
            ("scalar", json!({"users": "u1"})),
            ("null", json!({"users": null})),
            ("absent", json!({"title": "x"})),
        ]);
        let kept = filter_by_membership(input, Some("u1"));
        assert_eq!(keys(&kept), ["list", "scalar"]);
    }

    #[test]
    fn membership_without_identifier_is_identity() {
        let input = records(&[("a", json!({})), ("b", json!({"users": []}))]);
        assert_eq!(filter_by_membership(input.clone(), None), input);
        assert_eq!(filter_by_membership(input.clone(), Some("")), input);
    }

    #[test]
    fn ordering_is_stable_and_missing_sorts_as_empty_string() {
        let input = records(&[
            ("b1", json!({"name": "b"})),
            ("none", json!({})),
            ("a", json!({"name": "a"})),
            ("b2", json!({"name": "b"})),
        ]);
        let sorted = order_and_limit(input, Some("name"), None);
        assert_eq!(keys(&sorted), ["none", "a", "b1", "b2"]);
    }

    #[test]
    fn limit_returns_sorted_prefix() {
        let input = records(&[("x", json!({"t": 3})), ("y", json!({"t": 1})), ("z", json!({"t": 2}))]);
        let limited = order_and_limit(input.clone(), Some("t"), Some(2));
        assert_eq!(keys(&limited), ["y", "z"]);
        let all = order_and_limit(input.clone(), None, Some(10));
        assert_eq!(all.len(), 3);
        let zero = order_and_limit(input, None, Some(0));
        assert_eq!(zero.len(), 3);
    }

    #[test]
    fn parse_predicate_expressions() {
        let pred = Predicate::parse("sender==user123").expect("eq");
        assert_eq!(pred, Predicate::new("sender", Op::Eq, "user123"));
        let pred = Predicate::parse("t >= 2").expect("ge");
        assert_eq!(pred, Predicate::new("t", Op::Ge, 2));
        let pred = Predicate::parse("done!=true").expect("ne");
        assert_eq!(pred, Predicate::new("done", Op::Ne, true));
        let pred = Predicate::parse("t<\"b\"").expect("lt");
        assert_eq!(pred, Predicate::new("t", Op::Lt, "b"));
        assert!(Predicate::parse("sender").is_err());
        assert!(Predicate::parse("==x").is_err());
    }

    #[test]
    fn query_applies_every_stage() {
        let input = records(&[
            ("a", json!({"users": ["u1", "u2"], "t": 2})),
            ("b", json!({"users": ["u3"], "t": 1})),
            ("c", json!({"users": ["u1"], "t": 0})),
        ]);
        let query = Query::new()
            .with_member("u1")
            .with_filter(Predicate::new("t", Op::Ge, 0))
            .with_order_by("t")
            .with_limit(1);
        assert_eq!(keys(&query.apply(input)), ["c"]);
    }
}
