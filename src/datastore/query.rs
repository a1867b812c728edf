use serde_json::Value;

/// Comparison operators understood by both the local evaluator and the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComparisonOperator {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

/// Filter tree of a [`Query`]. Field names are Rust field names of the entity
/// shape (or dotted paths into nested objects); the translator maps them onto
/// JSON keys.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Comparison {
        field: String,
        operator: ComparisonOperator,
        value: Value,
    },
    In {
        field: String,
        values: Vec<Value>,
    },
    NotIn {
        field: String,
        values: Vec<Value>,
    },
    Exists {
        field: String,
        exists: bool,
    },
    /// Only anchored literal prefixes (`^abc`) are supported.
    Regex {
        field: String,
        pattern: String,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    fn comparison(field: impl Into<String>, operator: ComparisonOperator, value: impl Into<Value>) -> Self {
        Predicate::Comparison {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::comparison(field, ComparisonOperator::Equal, value)
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::comparison(field, ComparisonOperator::NotEqual, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::comparison(field, ComparisonOperator::LessThan, value)
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::comparison(field, ComparisonOperator::LessThanOrEqual, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::comparison(field, ComparisonOperator::GreaterThan, value)
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::comparison(field, ComparisonOperator::GreaterThanOrEqual, value)
    }

    pub fn is_in<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Predicate::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn not_in<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Predicate::NotIn {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn exists(field: impl Into<String>, exists: bool) -> Self {
        Predicate::Exists {
            field: field.into(),
            exists,
        }
    }

    pub fn regex(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Predicate::Regex {
            field: field.into(),
            pattern: pattern.into(),
        }
    }

    /// Convenience for `regex(field, "^<escaped prefix>")`.
    pub fn starts_with(field: impl Into<String>, prefix: &str) -> Self {
        let mut pattern = String::with_capacity(prefix.len() + 1);
        pattern.push('^');
        for ch in prefix.chars() {
            if is_regex_meta(ch) {
                pattern.push('\\');
            }
            pattern.push(ch);
        }
        Self::regex(field, pattern)
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::And(mut clauses) => {
                clauses.push(other);
                Predicate::And(clauses)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Predicate::Or(mut clauses) => {
                clauses.push(other);
                Predicate::Or(clauses)
            }
            first => Predicate::Or(vec![first, other]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Predicate::Not(Box::new(self))
    }
}

pub(crate) fn is_regex_meta(ch: char) -> bool {
    matches!(
        ch,
        '.' | '*' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '^' | '$' | '\\'
    )
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortDescriptor {
    pub field: String,
    pub direction: SortDirection,
}

impl SortDescriptor {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Descending,
        }
    }
}

/// A filter with optional ordering and paging, evaluated against the cache and the
/// backend with the same semantics.
///
/// ```
/// use kinvey_rs_sdk::datastore::{Predicate, Query};
///
/// let query = Query::new()
///     .filter(Predicate::gt("age", 15))
///     .ascending("name")
///     .limit(20);
/// assert_eq!(query.limit_value(), Some(20));
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Query {
    predicate: Option<Predicate>,
    sort: Vec<SortDescriptor>,
    limit: Option<usize>,
    skip: Option<usize>,
}

impl Query {
    /// A query matching every entity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a filter; repeated calls are combined with AND.
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(match self.predicate.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        self
    }

    pub fn ascending(mut self, field: impl Into<String>) -> Self {
        self.sort.push(SortDescriptor::ascending(field));
        self
    }

    pub fn descending(mut self, field: impl Into<String>) -> Self {
        self.sort.push(SortDescriptor::descending(field));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn predicate(&self) -> Option<&Predicate> {
        self.predicate.as_ref()
    }

    pub fn sort_descriptors(&self) -> &[SortDescriptor] {
        &self.sort
    }

    pub fn limit_value(&self) -> Option<usize> {
        self.limit
    }

    pub fn skip_value(&self) -> Option<usize> {
        self.skip
    }

    /// Whether the query restricts the result window with a limit or skip.
    pub fn is_windowed(&self) -> bool {
        self.limit.is_some() || self.skip.is_some()
    }
}
