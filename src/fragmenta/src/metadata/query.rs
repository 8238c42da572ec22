use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Instant;

use crate::constants::{Logic, Operator, SortOrder};
use crate::error::{FragmentaError, Result};
use crate::tlv::{self, TlvValue};

/// One predicate in a [`MetadataQuery`] (§4.6).
#[derive(Debug, Clone)]
pub struct Condition {
    pub tag: u16,
    pub operator: Operator,
    pub value: Vec<u8>,
}

/// A metadata search: the conditions to combine, how to combine them, and
/// how to page/sort the result (§4.6).
#[derive(Debug, Clone)]
pub struct MetadataQuery {
    pub conditions: Vec<Condition>,
    pub logic: Logic,
    pub limit: u32,
    pub offset: u32,
    pub sort_by: Option<u16>,
    pub sort_order: SortOrder,
}

impl Default for MetadataQuery {
    fn default() -> Self {
        MetadataQuery {
            conditions: Vec::new(),
            logic: Logic::And,
            limit: 0,
            offset: 0,
            sort_by: None,
            sort_order: SortOrder::Asc,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryResultEntry {
    pub tag: u16,
    pub value: Vec<u8>,
    /// Best-effort typed view of `value`, populated when it happens to
    /// decode as a complete, self-describing TLV item.
    pub extra: Option<TlvValue>,
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub entries: Vec<QueryResultEntry>,
    pub total_count: u32,
    pub return_count: u32,
    pub has_more: bool,
    pub query_time_ms: u64,
}

/// Evaluates `query` against `map` (§4.6).
pub fn evaluate(query: &MetadataQuery, map: &HashMap<u16, Vec<u8>>) -> Result<QueryResult> {
    if query.conditions.is_empty() {
        return Err(FragmentaError::InvalidQuery("query has no conditions".into()));
    }

    let started = Instant::now();

    let mut selected: Vec<(u16, Vec<u8>)> = map
        .iter()
        .filter(|(tag, value)| matches_entry(**tag, value, query))
        .map(|(tag, value)| (*tag, value.clone()))
        .collect();

    // Stable order before pagination: by tag, so repeated queries over an
    // unordered map are deterministic.
    selected.sort_by_key(|(tag, _)| *tag);

    let total_count = selected.len() as u32;

    let start = query.offset as usize;
    let page: Vec<(u16, Vec<u8>)> = if query.limit == 0 {
        selected.into_iter().skip(start).collect()
    } else {
        selected.into_iter().skip(start).take(query.limit as usize).collect()
    };

    let mut page = page;
    if query.sort_by.is_some() {
        page.sort_by(|(_, a), (_, b)| {
            let ord = compare_bytes(a, b);
            match query.sort_order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });
    }

    let entries: Vec<QueryResultEntry> = page
        .into_iter()
        .map(|(tag, value)| {
            let extra = tlv::decode(&value).ok().and_then(|(v, consumed)| {
                (consumed == value.len()).then_some(v)
            });
            QueryResultEntry { tag, value, extra }
        })
        .collect();

    let return_count = entries.len() as u32;
    let has_more = total_count > query.offset + return_count;

    Ok(QueryResult {
        entries,
        total_count,
        return_count,
        has_more,
        query_time_ms: started.elapsed().as_millis() as u64,
    })
}

fn matches_entry(tag: u16, value: &[u8], query: &MetadataQuery) -> bool {
    let mut any = false;
    let mut all = true;
    for condition in &query.conditions {
        let matched = tag == condition.tag && operator_matches(condition.operator, value, &condition.value);
        any |= matched;
        all &= matched;
    }
    match query.logic {
        Logic::And => all,
        Logic::Or => any,
    }
}

fn operator_matches(operator: Operator, entry_value: &[u8], operand: &[u8]) -> bool {
    match operator {
        Operator::Eq => entry_value == operand,
        Operator::Ne => entry_value != operand,
        Operator::Gt => compare_bytes(entry_value, operand) == Ordering::Greater,
        Operator::Lt => compare_bytes(entry_value, operand) == Ordering::Less,
        Operator::Contains => contains_subslice(entry_value, operand),
    }
}

/// §4.6: if both operands are at least 8 bytes, compare as big-endian
/// signed 64-bit integers; otherwise compare the first byte.
fn compare_bytes(a: &[u8], b: &[u8]) -> Ordering {
    if a.len() >= 8 && b.len() >= 8 {
        let a_int = i64::from_be_bytes(a[..8].try_into().unwrap());
        let b_int = i64::from_be_bytes(b[..8].try_into().unwrap());
        a_int.cmp(&b_int)
    } else {
        let a_byte = a.first().copied().unwrap_or(0);
        let b_byte = b.first().copied().unwrap_or(0);
        a_byte.cmp(&b_byte)
    }
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.windows(needle.len()).any(|window| window == needle)
}
