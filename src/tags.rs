//! Boolean tag filters.
//!
//! Callers describe a filter as a nested JSON-like value:
//!
//! ```text
//! expr   := null | atom | [clause, ...]     outer list: AND of clauses
//! clause := atom | [atom, ...]              inner list: OR of atoms
//! atom   := true | false | "name" | "-name"
//! ```
//!
//! `true` matches resources with at least one tag, `false` resources with
//! none, `"name"` resources tagged `name`, `"-name"` resources not tagged
//! `name`. Empty lists (outer or inner) impose no condition.
//!
//! The value is compiled once into a [`TagFilter`], which can then be
//! evaluated in memory against a tag set or lowered into an SQL predicate
//! over the `tags` table. Both forms give the same answer.

use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::str::FromStr;

use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid tag filter: {0}")]
pub struct TagFilterError(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagAtom {
    /// `true`
    AnyTag,
    /// `false`
    NoTags,
    Has(String),
    Lacks(String),
}

impl TagAtom {
    fn from_value(value: &Value) -> Result<Self, TagFilterError> {
        match value {
            Value::Bool(true) => Ok(TagAtom::AnyTag),
            Value::Bool(false) => Ok(TagAtom::NoTags),
            Value::String(s) => s.parse(),
            other => Err(TagFilterError(format!(
                "expected a bool or a tag name, got {}",
                other
            ))),
        }
    }

    pub fn matches<S: Borrow<str> + Ord>(&self, tags: &BTreeSet<S>) -> bool {
        match self {
            TagAtom::AnyTag => !tags.is_empty(),
            TagAtom::NoTags => tags.is_empty(),
            TagAtom::Has(name) => tags.contains(name.as_str()),
            TagAtom::Lacks(name) => !tags.contains(name.as_str()),
        }
    }

    fn push_sql(&self, qb: &mut QueryBuilder<'_, Sqlite>, subject: TagSubject<'_>) {
        let (negated, name) = match self {
            TagAtom::AnyTag => (false, None),
            TagAtom::NoTags => (true, None),
            TagAtom::Has(name) => (false, Some(name)),
            TagAtom::Lacks(name) => (true, Some(name)),
        };
        qb.push(if negated { "NOT EXISTS (" } else { "EXISTS (" });
        subject.push_subquery(qb);
        if let Some(name) = name {
            qb.push(" AND t.name = ");
            qb.push_bind(name.clone());
        }
        qb.push(")");
    }
}

impl FromStr for TagAtom {
    type Err = TagFilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (negated, name) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        if name.is_empty() {
            return Err(TagFilterError(format!("empty tag name in {:?}", s)));
        }
        Ok(if negated {
            TagAtom::Lacks(name.to_owned())
        } else {
            TagAtom::Has(name.to_owned())
        })
    }
}

/// Where the tags of the filtered resource live, as SQL column expressions
/// of the outer query.
#[derive(Debug, Clone, Copy)]
pub(crate) enum TagSubject<'a> {
    Feed { url: &'a str },
    Entry { feed_url: &'a str, id: &'a str },
}

impl TagSubject<'_> {
    fn push_subquery(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        match self {
            TagSubject::Feed { url } => {
                qb.push("SELECT 1 FROM tags t WHERE t.resource_kind = 'feed' AND t.feed_url = ");
                qb.push(*url);
                qb.push(" AND t.entry_id = ''");
            }
            TagSubject::Entry { feed_url, id } => {
                qb.push("SELECT 1 FROM tags t WHERE t.resource_kind = 'entry' AND t.feed_url = ");
                qb.push(*feed_url);
                qb.push(" AND t.entry_id = ");
                qb.push(*id);
            }
        }
    }
}

/// A compiled filter: a conjunction of disjunctions of [`TagAtom`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagFilter {
    clauses: Vec<Vec<TagAtom>>,
}

impl TagFilter {
    /// The filter that matches everything.
    pub fn any() -> Self {
        Self::default()
    }

    /// Build from already-typed clauses. Empty clauses are dropped.
    pub fn from_clauses(clauses: impl IntoIterator<Item = Vec<TagAtom>>) -> Self {
        Self {
            clauses: clauses.into_iter().filter(|c| !c.is_empty()).collect(),
        }
    }

    /// Compile the caller-supplied nested shape.
    pub fn from_value(value: &Value) -> Result<Self, TagFilterError> {
        let clauses = match value {
            Value::Null => Vec::new(),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::Array(atoms) => atoms
                        .iter()
                        .map(|atom| match atom {
                            Value::Array(_) => Err(TagFilterError(
                                "lists cannot be nested more than two levels deep".into(),
                            )),
                            _ => TagAtom::from_value(atom),
                        })
                        .collect::<Result<Vec<_>, _>>(),
                    _ => TagAtom::from_value(item).map(|atom| vec![atom]),
                })
                .collect::<Result<Vec<_>, _>>()?,
            atom => vec![vec![TagAtom::from_value(atom)?]],
        };
        Ok(Self::from_clauses(clauses))
    }

    pub fn clauses(&self) -> &[Vec<TagAtom>] {
        &self.clauses
    }

    /// True when the filter imposes no condition at all.
    pub fn is_unconditional(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn matches<S: Borrow<str> + Ord>(&self, tags: &BTreeSet<S>) -> bool {
        self.clauses
            .iter()
            .all(|clause| clause.iter().any(|atom| atom.matches(tags)))
    }

    /// Append an SQL boolean expression equivalent to [`TagFilter::matches`]
    /// over the subject's rows in the `tags` table.
    pub(crate) fn push_sql(&self, qb: &mut QueryBuilder<'_, Sqlite>, subject: TagSubject<'_>) {
        if self.clauses.is_empty() {
            qb.push("1");
            return;
        }
        qb.push("(");
        for (i, clause) in self.clauses.iter().enumerate() {
            if i > 0 {
                qb.push(" AND ");
            }
            qb.push("(");
            for (j, atom) in clause.iter().enumerate() {
                if j > 0 {
                    qb.push(" OR ");
                }
                atom.push_sql(qb, subject);
            }
            qb.push(")");
        }
        qb.push(")");
    }
}

impl TryFrom<&Value> for TagFilter {
    type Error = TagFilterError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl TryFrom<Value> for TagFilter {
    type Error = TagFilterError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(&value)
    }
}

/// Parses JSON (`'[["a", "b"], "-c"]'`). Input that does not look like JSON
/// is taken as a single tag atom (`first`, `-first`); malformed JSON is an error.
impl FromStr for TagFilter {
    type Err = TagFilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if !looks_like_json(s) {
            return Ok(Self::from_clauses([vec![s.parse()?]]));
        }
        let value: Value = serde_json::from_str(s)
            .map_err(|e| TagFilterError(format!("invalid JSON expression: {}", e)))?;
        Self::from_value(&value)
    }
}

fn looks_like_json(s: &str) -> bool {
    matches!(s, "null" | "true" | "false")
        || s
            .chars()
            .next()
            .is_some_and(|c| matches!(c, '[' | '{' | '"') || c.is_ascii_digit())
}

/// Compile `expr` and evaluate it against `tags` in one step.
pub fn evaluate<S: Borrow<str> + Ord>(
    expr: &Value,
    tags: &BTreeSet<S>,
) -> Result<bool, TagFilterError> {
    Ok(TagFilter::from_value(expr)?.matches(tags))
}
