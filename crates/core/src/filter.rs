//! Audience filter compilation.
//!
//! A filter map `{column: "v1,v2"}` selects rows whose column equals any of
//! the listed values. A `NOT` prefix on the column negates the whole list:
//! `{"NOTregion": "US,CA"}` keeps rows whose region is neither value.
//! Conditions on different columns are ANDed in column order.

use std::collections::BTreeMap;

use crate::user::User;

const NEGATION_PREFIX: &str = "NOT";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Condition<'a> {
    column: &'a str,
    negated: bool,
    values: Vec<&'a str>,
}

fn conditions(filters: &BTreeMap<String, String>) -> impl Iterator<Item = Condition<'_>> {
    filters.iter().map(|(key, raw)| {
        let (column, negated) = match key.strip_prefix(NEGATION_PREFIX) {
            Some(rest) if !rest.is_empty() => (rest, true),
            _ => (key.as_str(), false),
        };
        Condition {
            column,
            negated,
            values: raw.split(',').map(str::trim).collect(),
        }
    })
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Compile a filter map to a SQL boolean predicate.
///
/// An empty map compiles to an empty string.
pub fn compile(filters: &BTreeMap<String, String>) -> String {
    conditions(filters)
        .map(|cond| {
            let (op, joiner) = if cond.negated { ("!=", " AND ") } else { ("=", " OR ") };
            let column = quote_ident(cond.column);
            let parts: Vec<String> = cond
                .values
                .iter()
                .map(|v| format!("{column}{op}{}", quote_literal(v)))
                .collect();
            format!("({})", parts.join(joiner))
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Evaluate a filter map against a row in memory.
///
/// Unknown columns never match a positive condition and always pass a
/// negated one.
pub fn matches(filters: &BTreeMap<String, String>, user: &User) -> bool {
    conditions(filters).all(|cond| {
        let hit = user
            .field(cond.column)
            .is_some_and(|actual| cond.values.iter().any(|v| *v == actual));
        hit != cond.negated
    })
}
