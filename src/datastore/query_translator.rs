//! Turns a [`Query`] into the pair the data store needs: a predicate evaluated
//! against cached entities and the Mongo-style query parameters sent to the
//! backend. Both sides share one semantics; anything the local evaluator cannot
//! reproduce is rejected with `kinvey/unsupported-query` before any I/O happens.

use std::cmp::Ordering;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::{json, Map, Value};

use crate::datastore::entity::{json_key_for, Entity, FieldMapping, ENTITY_ID_KEY};
use crate::datastore::query::{
    is_regex_meta, ComparisonOperator, Predicate, Query, SortDescriptor, SortDirection,
};
use crate::error::{invalid_argument, unsupported_query, KinveyResult};

const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Filter expressed over JSON keys, evaluated against cached entities.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocalPredicate {
    predicate: Option<Predicate>,
}

impl LocalPredicate {
    pub fn match_all() -> Self {
        Self::default()
    }

    pub fn is_match_all(&self) -> bool {
        self.predicate.is_none()
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        match &self.predicate {
            Some(predicate) => evaluate(predicate, entity),
            None => true,
        }
    }
}

/// Local half of a translated query: predicate, ordering and window.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocalQuery {
    pub predicate: LocalPredicate,
    pub sort: Vec<SortDescriptor>,
    pub limit: Option<usize>,
    pub skip: Option<usize>,
}

impl LocalQuery {
    /// Filters, sorts, then applies skip and limit. `entities` must be in cache
    /// insertion order, which breaks ties between equal sort keys.
    pub fn apply(&self, entities: Vec<Entity>) -> Vec<Entity> {
        let mut matched: Vec<Entity> = entities
            .into_iter()
            .filter(|entity| self.predicate.matches(entity))
            .collect();

        if !self.sort.is_empty() {
            matched.sort_by(|left, right| compare_entities(left, right, &self.sort));
        }

        let skip = self.skip.unwrap_or(0);
        let iter = matched.into_iter().skip(skip);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }

    pub fn is_windowed(&self) -> bool {
        self.limit.is_some() || self.skip.is_some()
    }
}

/// Remote half of a translated query, ready to be sent as URL parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteQuery {
    filter: Option<String>,
    sort: Option<String>,
    limit: Option<usize>,
    skip: Option<usize>,
    local: LocalQuery,
}

impl RemoteQuery {
    pub fn match_all() -> Self {
        Self {
            filter: None,
            sort: None,
            limit: None,
            skip: None,
            local: LocalQuery::default(),
        }
    }

    /// Mongo JSON filter (`query=` parameter); `None` matches everything.
    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    /// Mongo JSON sort document (`sort=` parameter).
    pub fn sort(&self) -> Option<&str> {
        self.sort.as_deref()
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn skip(&self) -> Option<usize> {
        self.skip
    }

    /// Key under which sync marks for this query are stored.
    pub fn sync_mark_key(&self) -> String {
        self.filter.clone().unwrap_or_else(|| "{}".to_owned())
    }

    /// Name/value pairs in the order the backend documents them.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(filter) = &self.filter {
            pairs.push(("query", filter.clone()));
        }
        if let Some(sort) = &self.sort {
            pairs.push(("sort", sort.clone()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit", limit.to_string()));
        }
        if let Some(skip) = self.skip {
            pairs.push(("skip", skip.to_string()));
        }
        pairs
    }

    /// Percent-encoded `query=..&sort=..&limit=..&skip=..` string.
    pub fn query_string(&self) -> String {
        self.query_pairs()
            .into_iter()
            .map(|(name, value)| format!("{name}={}", utf8_percent_encode(&value, QUERY_VALUE)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// The same filter and ordering restricted to one page. `_id` is appended as
    /// a final sort key so consecutive pages never overlap.
    pub fn page(&self, skip: usize, limit: usize) -> RemoteQuery {
        let mut sort = self.local.sort.clone();
        if !sort.iter().any(|descriptor| descriptor.field == ENTITY_ID_KEY) {
            sort.push(SortDescriptor::ascending(ENTITY_ID_KEY));
        }
        RemoteQuery {
            filter: self.filter.clone(),
            sort: render_sort(&sort),
            limit: Some(limit),
            skip: Some(skip),
            local: LocalQuery {
                predicate: self.local.predicate.clone(),
                sort,
                limit: Some(limit),
                skip: Some(skip),
            },
        }
    }

    /// The filter only, without ordering or window (used for counts and delta sets).
    pub fn unwindowed(&self) -> RemoteQuery {
        RemoteQuery {
            filter: self.filter.clone(),
            sort: None,
            limit: None,
            skip: None,
            local: LocalQuery {
                predicate: self.local.predicate.clone(),
                ..Default::default()
            },
        }
    }

    /// Local evaluation of exactly what the backend is asked for.
    pub fn local_query(&self) -> &LocalQuery {
        &self.local
    }
}

impl Default for RemoteQuery {
    fn default() -> Self {
        Self::match_all()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TranslatedQuery {
    pub local: LocalQuery,
    pub remote: RemoteQuery,
}

/// Translates `query` for an entity shape described by `mappings`.
pub fn translate(query: &Query, mappings: &[FieldMapping]) -> KinveyResult<TranslatedQuery> {
    let predicate = query
        .predicate()
        .map(|predicate| map_predicate(predicate, mappings))
        .transpose()?
        .flatten();

    let filter = predicate
        .as_ref()
        .map(|predicate| serde_json::to_string(&to_mongo(predicate)))
        .transpose()?;

    let sort = query
        .sort_descriptors()
        .iter()
        .map(|descriptor| {
            validate_field(&descriptor.field)?;
            Ok(SortDescriptor {
                field: json_key_for(mappings, &descriptor.field),
                direction: descriptor.direction,
            })
        })
        .collect::<KinveyResult<Vec<_>>>()?;

    let local = LocalQuery {
        predicate: LocalPredicate { predicate },
        sort,
        limit: query.limit_value(),
        skip: query.skip_value(),
    };
    let remote = RemoteQuery {
        filter,
        sort: render_sort(&local.sort),
        limit: local.limit,
        skip: local.skip,
        local: local.clone(),
    };
    Ok(TranslatedQuery { local, remote })
}

fn validate_field(field: &str) -> KinveyResult<()> {
    if field.is_empty() || field.split('.').any(str::is_empty) {
        return Err(invalid_argument(format!("'{field}' is not a valid field path")));
    }
    if field.starts_with('$') {
        return Err(unsupported_query(format!(
            "Operator-like field name '{field}' is not supported"
        )));
    }
    Ok(())
}

/// Maps field names onto JSON keys and validates operators. Empty conjunctions
/// collapse to `None` (match everything).
fn map_predicate(predicate: &Predicate, mappings: &[FieldMapping]) -> KinveyResult<Option<Predicate>> {
    let key = |field: &str| -> KinveyResult<String> {
        validate_field(field)?;
        Ok(json_key_for(mappings, field))
    };
    let mapped = match predicate {
        Predicate::Comparison {
            field,
            operator,
            value,
        } => {
            if *operator != ComparisonOperator::Equal
                && *operator != ComparisonOperator::NotEqual
                && (value.is_array() || value.is_object() || value.is_null())
            {
                return Err(unsupported_query(format!(
                    "Ordering comparison on '{field}' requires a scalar value"
                )));
            }
            Predicate::Comparison {
                field: key(field)?,
                operator: *operator,
                value: value.clone(),
            }
        }
        Predicate::In { field, values } => Predicate::In {
            field: key(field)?,
            values: values.clone(),
        },
        Predicate::NotIn { field, values } => Predicate::NotIn {
            field: key(field)?,
            values: values.clone(),
        },
        Predicate::Exists { field, exists } => Predicate::Exists {
            field: key(field)?,
            exists: *exists,
        },
        Predicate::Regex { field, pattern } => {
            if regex_prefix(pattern).is_none() {
                return Err(unsupported_query(format!(
                    "Regular expression '{pattern}' is not supported; only anchored literal prefixes such as '^abc' are"
                )));
            }
            Predicate::Regex {
                field: key(field)?,
                pattern: pattern.clone(),
            }
        }
        Predicate::And(clauses) => {
            let mapped = clauses
                .iter()
                .map(|clause| map_predicate(clause, mappings))
                .collect::<KinveyResult<Vec<_>>>()?;
            let mapped: Vec<Predicate> = mapped.into_iter().flatten().collect();
            if mapped.is_empty() {
                return Ok(None);
            }
            Predicate::And(mapped)
        }
        Predicate::Or(clauses) => {
            if clauses.is_empty() {
                return Err(invalid_argument("OR requires at least one clause"));
            }
            let mut mapped = Vec::with_capacity(clauses.len());
            for clause in clauses {
                match map_predicate(clause, mappings)? {
                    Some(clause) => mapped.push(clause),
                    // A match-all branch makes the whole disjunction match-all.
                    None => return Ok(None),
                }
            }
            Predicate::Or(mapped)
        }
        Predicate::Not(inner) => match inner.as_ref() {
            Predicate::Not(double) => return map_predicate(double, mappings),
            Predicate::And(_) | Predicate::Or(_) => {
                return Err(unsupported_query(
                    "Negation is only supported on single-field predicates",
                ))
            }
            field_level => match map_predicate(field_level, mappings)? {
                Some(mapped) => Predicate::Not(Box::new(mapped)),
                None => return Err(unsupported_query("Negation of a match-all predicate")),
            },
        },
    };
    Ok(Some(mapped))
}

/// Literal prefix of an anchored pattern such as `^abc` or `^a\.b`.
pub(crate) fn regex_prefix(pattern: &str) -> Option<String> {
    let body = pattern.strip_prefix('^')?;
    let mut prefix = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            let escaped = chars.next()?;
            if !is_regex_meta(escaped) {
                return None;
            }
            prefix.push(escaped);
        } else if is_regex_meta(ch) {
            return None;
        } else {
            prefix.push(ch);
        }
    }
    Some(prefix)
}

fn operator_key(operator: ComparisonOperator) -> &'static str {
    match operator {
        ComparisonOperator::Equal => "$eq",
        ComparisonOperator::NotEqual => "$ne",
        ComparisonOperator::LessThan => "$lt",
        ComparisonOperator::LessThanOrEqual => "$lte",
        ComparisonOperator::GreaterThan => "$gt",
        ComparisonOperator::GreaterThanOrEqual => "$gte",
    }
}

fn to_mongo(predicate: &Predicate) -> Value {
    match predicate {
        Predicate::Comparison {
            field,
            operator: ComparisonOperator::Equal,
            value,
        } if !value.is_object() => json!({ field: value }),
        Predicate::Comparison { field, .. }
        | Predicate::In { field, .. }
        | Predicate::NotIn { field, .. }
        | Predicate::Exists { field, .. }
        | Predicate::Regex { field, .. } => {
            json!({ field: operator_document(predicate) })
        }
        Predicate::And(clauses) => {
            json!({ "$and": clauses.iter().map(to_mongo).collect::<Vec<_>>() })
        }
        Predicate::Or(clauses) => {
            json!({ "$or": clauses.iter().map(to_mongo).collect::<Vec<_>>() })
        }
        Predicate::Not(inner) => match inner.as_ref() {
            Predicate::Comparison {
                field,
                operator: ComparisonOperator::Equal,
                value,
            } => json!({ field: { "$ne": value } }),
            Predicate::Exists { field, exists } => json!({ field: { "$exists": !exists } }),
            Predicate::Comparison { field, .. }
            | Predicate::In { field, .. }
            | Predicate::NotIn { field, .. }
            | Predicate::Regex { field, .. } => {
                json!({ field: { "$not": operator_document(inner) } })
            }
            // Compound negations are rejected during mapping.
            other => json!({ "$nor": [to_mongo(other)] }),
        },
    }
}

fn operator_document(predicate: &Predicate) -> Value {
    let mut document = Map::new();
    match predicate {
        Predicate::Comparison {
            operator, value, ..
        } => {
            document.insert(operator_key(*operator).to_owned(), value.clone());
        }
        Predicate::In { values, .. } => {
            document.insert("$in".to_owned(), Value::Array(values.clone()));
        }
        Predicate::NotIn { values, .. } => {
            document.insert("$nin".to_owned(), Value::Array(values.clone()));
        }
        Predicate::Exists { exists, .. } => {
            document.insert("$exists".to_owned(), Value::Bool(*exists));
        }
        Predicate::Regex { pattern, .. } => {
            document.insert("$regex".to_owned(), Value::String(pattern.clone()));
        }
        Predicate::And(_) | Predicate::Or(_) | Predicate::Not(_) => {}
    }
    Value::Object(document)
}

/// Renders the sort document by hand so key order is preserved.
fn render_sort(sort: &[SortDescriptor]) -> Option<String> {
    if sort.is_empty() {
        return None;
    }
    let entries: Vec<String> = sort
        .iter()
        .map(|descriptor| {
            let direction = match descriptor.direction {
                SortDirection::Ascending => 1,
                SortDirection::Descending => -1,
            };
            format!("{}:{direction}", Value::String(descriptor.field.clone()))
        })
        .collect();
    Some(format!("{{{}}}", entries.join(",")))
}

fn evaluate(predicate: &Predicate, entity: &Entity) -> bool {
    match predicate {
        Predicate::Comparison {
            field,
            operator,
            value,
        } => {
            let actual = entity.value_at(field);
            match operator {
                ComparisonOperator::Equal => matches_equal(actual.as_ref(), value),
                ComparisonOperator::NotEqual => !matches_equal(actual.as_ref(), value),
                ordering => match actual {
                    Some(Value::Array(items)) => items
                        .iter()
                        .any(|item| satisfies_ordering(item, *ordering, value)),
                    Some(actual) => satisfies_ordering(&actual, *ordering, value),
                    None => false,
                },
            }
        }
        Predicate::In { field, values } => {
            let actual = entity.value_at(field);
            values
                .iter()
                .any(|candidate| matches_equal(actual.as_ref(), candidate))
        }
        Predicate::NotIn { field, values } => {
            let actual = entity.value_at(field);
            !values
                .iter()
                .any(|candidate| matches_equal(actual.as_ref(), candidate))
        }
        Predicate::Exists { field, exists } => entity.value_at(field).is_some() == *exists,
        Predicate::Regex { field, pattern } => {
            let Some(prefix) = regex_prefix(pattern) else {
                return false;
            };
            match entity.value_at(field) {
                Some(Value::String(actual)) => actual.starts_with(&prefix),
                Some(Value::Array(items)) => items
                    .iter()
                    .any(|item| item.as_str().is_some_and(|item| item.starts_with(&prefix))),
                _ => false,
            }
        }
        Predicate::And(clauses) => clauses.iter().all(|clause| evaluate(clause, entity)),
        Predicate::Or(clauses) => clauses.iter().any(|clause| evaluate(clause, entity)),
        Predicate::Not(inner) => !evaluate(inner, entity),
    }
}

/// Equality with the backend's conventions: a missing field equals `null`, and an
/// array field matches when any element does.
fn matches_equal(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|item| json_equal(item, expected))
        }
        Some(actual) => json_equal(actual, expected),
    }
}

fn json_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(left), Value::Number(right)) => match (left.as_f64(), right.as_f64()) {
            (Some(left), Some(right)) => left == right,
            _ => left == right,
        },
        _ => left == right,
    }
}

fn satisfies_ordering(actual: &Value, operator: ComparisonOperator, expected: &Value) -> bool {
    let Some(ordering) = compare_same_type(actual, expected) else {
        return false;
    };
    match operator {
        ComparisonOperator::LessThan => ordering == Ordering::Less,
        ComparisonOperator::LessThanOrEqual => ordering != Ordering::Greater,
        ComparisonOperator::GreaterThan => ordering == Ordering::Greater,
        ComparisonOperator::GreaterThanOrEqual => ordering != Ordering::Less,
        ComparisonOperator::Equal => ordering == Ordering::Equal,
        ComparisonOperator::NotEqual => ordering != Ordering::Equal,
    }
}

/// Ordering between values of the same type; values of different types never compare.
fn compare_same_type(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(left), Value::Number(right)) => left.as_f64()?.partial_cmp(&right.as_f64()?),
        (Value::String(left), Value::String(right)) => Some(left.cmp(right)),
        (Value::Bool(left), Value::Bool(right)) => Some(left.cmp(right)),
        _ => None,
    }
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

fn compare_for_sort(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    let rank = type_rank(left).cmp(&type_rank(right));
    if rank != Ordering::Equal {
        return rank;
    }
    match (left, right) {
        (Some(left @ (Value::Object(_) | Value::Array(_))), Some(right)) => {
            left.to_string().cmp(&right.to_string())
        }
        (Some(left), Some(right)) => compare_same_type(left, right).unwrap_or(Ordering::Equal),
        _ => Ordering::Equal,
    }
}

fn compare_entities(left: &Entity, right: &Entity, sort: &[SortDescriptor]) -> Ordering {
    for descriptor in sort {
        let left_value = left.value_at(&descriptor.field);
        let right_value = right.value_at(&descriptor.field);
        let mut ordering = compare_for_sort(left_value.as_ref(), right_value.as_ref());
        if descriptor.direction == SortDirection::Descending {
            ordering = ordering.reverse();
        }
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}
