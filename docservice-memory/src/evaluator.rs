//! Filter document evaluation for in-memory collections.
//!
//! This module evaluates MongoDB filter documents against stored BSON documents, and
//! implements the sorting and projection rules used by `find`.
//!
//! # Supported operators
//!
//! - Top level: `$and`, `$or`, `$nor`, `$expr` (boolean literals only)
//! - Comparison: `$eq`, `$ne`, `$gt`, `$gte`, `$lt`, `$lte`, `$in`, `$nin`
//! - Element: `$exists`, `$type`
//! - Evaluation: `$regex` with `$options`
//! - Array: `$all`, `$size`, `$elemMatch`
//! - Negation: `$not`
//!
//! Field paths may be dotted (`address.city`); numeric segments index into arrays.
//! Equality against an array field matches when any element is equal, and `null`
//! matches missing fields, as on a MongoDB server.

use std::{cmp::Ordering, collections::HashMap};
use bson::{Bson, Document, datetime::DateTime, oid::ObjectId, spec::ElementType};
use regex::{Regex, RegexBuilder};

use docservice_core::error::{ServiceError, ServiceResult};


/// Type-erased, comparable representation of BSON values.
///
/// Numeric types are normalized to `f64` so that `1_i32 == 1.0_f64`, as on the server.
#[derive(Debug)]
pub(crate) enum Comparable<'a> {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// Numeric value (all integers and floats normalized to f64)
    Number(f64),
    /// DateTime value
    DateTime(DateTime),
    /// String value
    String(&'a str),
    /// ObjectId value
    ObjectId(ObjectId),
    /// Binary value (including UUIDs)
    Binary(&'a [u8]),
    /// Array of comparable values
    Array(Vec<Comparable<'a>>),
    /// Map/Object of comparable values
    Map(HashMap<&'a str, Comparable<'a>>),
    /// Values this evaluator does not compare (never equal to anything)
    Other,
}

impl<'a> From<&'a Bson> for Comparable<'a> {
    fn from(bson: &'a Bson) -> Self {
        match bson {
            Bson::Null => Comparable::Null,
            Bson::Boolean(value) => Comparable::Bool(*value),
            Bson::Int32(value) => Comparable::Number(*value as f64),
            Bson::Int64(value) => Comparable::Number(*value as f64),
            Bson::Double(value) => Comparable::Number(*value),
            Bson::DateTime(value) => Comparable::DateTime(*value),
            Bson::String(value) => Comparable::String(value),
            Bson::ObjectId(value) => Comparable::ObjectId(*value),
            Bson::Binary(value) => Comparable::Binary(&value.bytes),
            Bson::Array(arr) => Comparable::Array(
                arr
                    .iter()
                    .map(Comparable::from)
                    .collect::<Vec<_>>()
            ),
            Bson::Document(doc) => Comparable::Map(
                doc
                    .iter()
                    .map(|(k, v)| (k.as_str(), Comparable::from(v)))
                    .collect::<HashMap<_, _>>()
            ),
            _ => Comparable::Other,
        }
    }
}

impl<'a> Comparable<'a> {
    /// Position in the server's cross-type sort order.
    fn rank(&self) -> u8 {
        match self {
            Comparable::Null => 1,
            Comparable::Number(_) => 2,
            Comparable::String(_) => 3,
            Comparable::Map(_) => 4,
            Comparable::Array(_) => 5,
            Comparable::Binary(_) => 6,
            Comparable::ObjectId(_) => 7,
            Comparable::Bool(_) => 8,
            Comparable::DateTime(_) => 9,
            Comparable::Other => 10,
        }
    }

    /// Total order used for sorting: by type rank first, then by value.
    pub(crate) fn sort_cmp(&self, other: &Self) -> Ordering {
        self.rank()
            .cmp(&other.rank())
            .then_with(|| self.partial_cmp(other).unwrap_or(Ordering::Equal))
    }
}

impl<'a> PartialEq for Comparable<'a> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Comparable::Null, Comparable::Null) => true,
            (Comparable::Bool(a), Comparable::Bool(b)) => a == b,
            (Comparable::Number(a), Comparable::Number(b)) => a == b,
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a == b,
            (Comparable::String(a), Comparable::String(b)) => a == b,
            (Comparable::ObjectId(a), Comparable::ObjectId(b)) => a == b,
            (Comparable::Binary(a), Comparable::Binary(b)) => a == b,
            (Comparable::Array(a), Comparable::Array(b)) => a == b,
            (Comparable::Map(a), Comparable::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl<'a> PartialOrd for Comparable<'a> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Comparable::Bool(a), Comparable::Bool(b)) => a.partial_cmp(b),
            (Comparable::Number(a), Comparable::Number(b)) => a.partial_cmp(b),
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a.partial_cmp(b),
            (Comparable::String(a), Comparable::String(b)) => a.partial_cmp(b),
            (Comparable::ObjectId(a), Comparable::ObjectId(b)) => a.partial_cmp(b),
            (Comparable::Binary(a), Comparable::Binary(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}


/// Resolves a dotted path inside a document.
pub(crate) fn lookup<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;

    for segment in segments {
        current = match current {
            Bson::Document(inner) => inner.get(segment)?,
            Bson::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}


pub(crate) struct DocumentEvaluator<'a> {
    document: &'a Document,
}

impl<'a> DocumentEvaluator<'a> {
    pub fn new(document: &'a Document) -> Self {
        Self { document }
    }

    /// Whether the document matches `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InvalidQuery`] for malformed filters and unsupported operators.
    pub fn evaluate(&self, filter: &Document) -> ServiceResult<bool> {
        for (key, condition) in filter {
            let matched = match key.as_str() {
                "$and" => {
                    let mut all = true;
                    for clause in clauses(key, condition)? {
                        if !self.evaluate(clause)? {
                            all = false;
                            break;
                        }
                    }
                    all
                },
                "$or" => self.any(key, condition)?,
                "$nor" => !self.any(key, condition)?,
                "$expr" => match condition {
                    Bson::Boolean(value) => *value,
                    _ => return Err(ServiceError::InvalidQuery(
                        "only boolean literals are supported in $expr".to_string()
                    )),
                },
                "$comment" => true,
                operator if operator.starts_with('$') => {
                    return Err(ServiceError::InvalidQuery(format!(
                        "unsupported top-level operator {operator}"
                    )));
                },
                path => matches_condition(lookup(self.document, path), condition)?,
            };

            if !matched {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn any(&self, key: &str, condition: &Bson) -> ServiceResult<bool> {
        for clause in clauses(key, condition)? {
            if self.evaluate(clause)? {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Returns the indices of the documents matching `filter`, in storage order.
    pub fn matching_positions(
        documents: &[Document],
        filter: &Document,
    ) -> ServiceResult<Vec<usize>> {
        let mut positions = Vec::new();

        for (position, document) in documents.iter().enumerate() {
            if DocumentEvaluator::new(document).evaluate(filter)? {
                positions.push(position);
            }
        }

        Ok(positions)
    }
}

fn clauses<'b>(key: &str, condition: &'b Bson) -> ServiceResult<Vec<&'b Document>> {
    let invalid = || ServiceError::InvalidQuery(format!("{key} requires an array of documents"));

    match condition {
        Bson::Array(items) => items
            .iter()
            .map(|item| item.as_document().ok_or_else(invalid))
            .collect(),
        _ => Err(invalid()),
    }
}

fn is_operator_document(document: &Document) -> bool {
    document
        .keys()
        .next()
        .is_some_and(|key| key.starts_with('$'))
}

fn matches_condition(value: Option<&Bson>, condition: &Bson) -> ServiceResult<bool> {
    match condition {
        Bson::Document(operators) if is_operator_document(operators) => {
            for (operator, argument) in operators {
                if !matches_operator(value, operator, argument, operators)? {
                    return Ok(false);
                }
            }
            Ok(true)
        },
        Bson::RegularExpression(regex) => {
            let regex = compile_regex(regex.pattern.as_str(), regex.options.as_str())?;
            Ok(any_value(value, |candidate| regex_matches(&regex, candidate)))
        },
        target => Ok(equals(value, target)),
    }
}

fn matches_operator(
    value: Option<&Bson>,
    operator: &str,
    argument: &Bson,
    siblings: &Document,
) -> ServiceResult<bool> {
    match operator {
        "$eq" => Ok(equals(value, argument)),
        "$ne" => Ok(!equals(value, argument)),
        "$gt" => Ok(compares(value, argument, |ordering| ordering == Ordering::Greater)),
        "$gte" => Ok(compares(value, argument, |ordering| ordering != Ordering::Less)),
        "$lt" => Ok(compares(value, argument, |ordering| ordering == Ordering::Less)),
        "$lte" => Ok(compares(value, argument, |ordering| ordering != Ordering::Greater)),
        "$in" => is_member(value, operator, argument),
        "$nin" => Ok(!is_member(value, operator, argument)?),
        "$exists" => Ok(truthy(argument) == value.is_some()),
        "$regex" => {
            let (pattern, inline_options) = match argument {
                Bson::String(pattern) => (pattern.as_str(), ""),
                Bson::RegularExpression(regex) => (regex.pattern.as_str(), regex.options.as_str()),
                _ => return Err(ServiceError::InvalidQuery("$regex requires a string".to_string())),
            };
            let options = siblings.get_str("$options").unwrap_or(inline_options);
            let regex = compile_regex(pattern, options)?;
            Ok(any_value(value, |candidate| regex_matches(&regex, candidate)))
        },
        "$options" if siblings.contains_key("$regex") => Ok(true),
        "$all" => {
            let targets = sequence(operator, argument)?;
            Ok(!targets.is_empty() && targets.iter().all(|target| equals(value, target)))
        },
        "$size" => {
            let expected = integer(operator, argument)?;
            Ok(matches!(value, Some(Bson::Array(items)) if items.len() as i64 == expected))
        },
        "$type" => {
            let aliases = match argument {
                Bson::Array(aliases) => aliases.iter().collect::<Vec<_>>(),
                alias => vec![alias],
            };
            match value {
                Some(value) => {
                    for alias in aliases {
                        if has_type(value, alias)? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                },
                None => Ok(false),
            }
        },
        "$elemMatch" => {
            let filter = argument
                .as_document()
                .ok_or_else(|| ServiceError::InvalidQuery("$elemMatch requires a document".to_string()))?;
            let Some(Bson::Array(items)) = value else {
                return Ok(false);
            };
            for item in items {
                let matched = if is_operator_document(filter) {
                    matches_condition(Some(item), argument)?
                } else {
                    match item {
                        Bson::Document(inner) => DocumentEvaluator::new(inner).evaluate(filter)?,
                        _ => false,
                    }
                };
                if matched {
                    return Ok(true);
                }
            }
            Ok(false)
        },
        "$not" => match argument {
            Bson::Document(_) | Bson::RegularExpression(_) => Ok(!matches_condition(value, argument)?),
            _ => Err(ServiceError::InvalidQuery("$not requires an operator document or a regex".to_string())),
        },
        _ => Err(ServiceError::InvalidQuery(format!("unsupported operator {operator}"))),
    }
}

/// Equality with the server's array and null semantics.
fn equals(value: Option<&Bson>, target: &Bson) -> bool {
    match value {
        None => matches!(target, Bson::Null),
        Some(value) => {
            let target = Comparable::from(target);
            if Comparable::from(value) == target {
                return true;
            }
            match value {
                Bson::Array(items) => items
                    .iter()
                    .any(|item| Comparable::from(item) == target),
                _ => false,
            }
        },
    }
}

fn compares(value: Option<&Bson>, target: &Bson, accept: impl Fn(Ordering) -> bool) -> bool {
    let target = Comparable::from(target);
    let check = |candidate: &Bson| {
        Comparable::from(candidate)
            .partial_cmp(&target)
            .is_some_and(&accept)
    };

    match value {
        Some(Bson::Array(items)) => items.iter().any(check),
        Some(value) => check(value),
        None => false,
    }
}

fn is_member(value: Option<&Bson>, operator: &str, argument: &Bson) -> ServiceResult<bool> {
    for target in sequence(operator, argument)? {
        let matched = match target {
            Bson::RegularExpression(regex) => {
                let regex = compile_regex(regex.pattern.as_str(), regex.options.as_str())?;
                any_value(value, |candidate| regex_matches(&regex, candidate))
            },
            target => equals(value, target),
        };
        if matched {
            return Ok(true);
        }
    }

    Ok(false)
}

fn any_value(value: Option<&Bson>, predicate: impl Fn(&Bson) -> bool) -> bool {
    match value {
        Some(Bson::Array(items)) => items.iter().any(&predicate),
        Some(value) => predicate(value),
        None => false,
    }
}

fn regex_matches(regex: &Regex, candidate: &Bson) -> bool {
    matches!(candidate, Bson::String(text) if regex.is_match(text))
}

fn compile_regex(pattern: &str, options: &str) -> ServiceResult<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .ignore_whitespace(options.contains('x'))
        .build()
        .map_err(|e| ServiceError::InvalidQuery(format!("invalid regular expression: {e}")))
}

fn sequence<'b>(operator: &str, argument: &'b Bson) -> ServiceResult<&'b Vec<Bson>> {
    argument
        .as_array()
        .ok_or_else(|| ServiceError::InvalidQuery(format!("{operator} requires an array")))
}

pub(crate) fn integer(operator: &str, argument: &Bson) -> ServiceResult<i64> {
    match argument {
        Bson::Int32(value) => Ok(i64::from(*value)),
        Bson::Int64(value) => Ok(*value),
        Bson::Double(value) if value.fract() == 0.0 => Ok(*value as i64),
        _ => Err(ServiceError::InvalidQuery(format!("{operator} requires an integer"))),
    }
}

fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(value) => *value,
        Bson::Int32(value) => *value != 0,
        Bson::Int64(value) => *value != 0,
        Bson::Double(value) => *value != 0.0,
        Bson::Null => false,
        _ => true,
    }
}

fn type_alias(element_type: ElementType) -> &'static str {
    match element_type {
        ElementType::Double => "double",
        ElementType::String => "string",
        ElementType::EmbeddedDocument => "object",
        ElementType::Array => "array",
        ElementType::Binary => "binData",
        ElementType::Undefined => "undefined",
        ElementType::ObjectId => "objectId",
        ElementType::Boolean => "bool",
        ElementType::DateTime => "date",
        ElementType::Null => "null",
        ElementType::RegularExpression => "regex",
        ElementType::DbPointer => "dbPointer",
        ElementType::JavaScriptCode => "javascript",
        ElementType::Symbol => "symbol",
        ElementType::JavaScriptCodeWithScope => "javascriptWithScope",
        ElementType::Int32 => "int",
        ElementType::Timestamp => "timestamp",
        ElementType::Int64 => "long",
        ElementType::Decimal128 => "decimal",
        ElementType::MaxKey => "maxKey",
        ElementType::MinKey => "minKey",
    }
}

fn has_type(value: &Bson, alias: &Bson) -> ServiceResult<bool> {
    let element_type = value.element_type();

    match alias {
        Bson::String(alias) if alias == "number" => Ok(matches!(
            element_type,
            ElementType::Double | ElementType::Int32 | ElementType::Int64 | ElementType::Decimal128
        )),
        Bson::String(alias) => Ok(type_alias(element_type) == alias),
        code @ (Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)) => {
            Ok(integer("$type", code)? == i64::from(element_type as u8))
        },
        _ => Err(ServiceError::InvalidQuery("$type requires a type alias or code".to_string())),
    }
}


/// Sorts documents by a sort document such as `{ "name": 1, "age": -1 }`.
pub(crate) fn sort_documents(documents: &mut [Document], sort: &Document) {
    documents.sort_by(|a, b| {
        for (field, direction) in sort {
            let left = lookup(a, field)
                .map(Comparable::from)
                .unwrap_or(Comparable::Null);
            let right = lookup(b, field)
                .map(Comparable::from)
                .unwrap_or(Comparable::Null);

            let ordering = if truthy(direction) && !is_negative(direction) {
                left.sort_cmp(&right)
            } else {
                right.sort_cmp(&left)
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }

        Ordering::Equal
    });
}

fn is_negative(value: &Bson) -> bool {
    match value {
        Bson::Int32(value) => *value < 0,
        Bson::Int64(value) => *value < 0,
        Bson::Double(value) => *value < 0.0,
        _ => false,
    }
}

/// Applies an inclusion or exclusion projection to the top-level fields of a document.
pub(crate) fn project(document: Document, projection: &Document) -> Document {
    let include_id = projection.get("_id").is_none_or(truthy);
    let inclusive = projection.values().any(truthy);

    if inclusive {
        document
            .into_iter()
            .filter(|(key, _)| {
                if key == "_id" {
                    include_id
                } else {
                    projection.get(key).is_some_and(truthy)
                }
            })
            .collect()
    } else {
        document
            .into_iter()
            .filter(|(key, _)| {
                if key == "_id" {
                    include_id
                } else {
                    projection.get(key).is_none_or(truthy)
                }
            })
            .collect()
    }
}
