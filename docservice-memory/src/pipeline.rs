//! Aggregation pipelines over in-memory documents.
//!
//! Expressions are limited to literals, `$literal` and `"$field.path"` references.
//! Stages and accumulators outside that subset are rejected rather than approximated.

use std::cmp::Ordering;

use bson::{Bson, Document, doc};

use docservice_core::error::{ServiceError, ServiceResult};

use crate::{
    evaluator::{Comparable, DocumentEvaluator, integer, lookup, project, sort_documents},
    update::{set_path, unset_path},
};


/// Runs `pipeline` over `documents`, stage by stage.
pub(crate) fn run_pipeline(mut documents: Vec<Document>, pipeline: &[Document]) -> ServiceResult<Vec<Document>> {
    for stage in pipeline {
        let mut entries = stage.iter();
        let (Some((operator, argument)), None) = (entries.next(), entries.next()) else {
            return Err(ServiceError::InvalidQuery(
                "an aggregation stage must have exactly one operator".to_string()
            ));
        };

        documents = match operator.as_str() {
            "$match" => {
                let filter = stage_document(operator, argument)?;
                let mut matched = Vec::with_capacity(documents.len());
                for document in documents {
                    if DocumentEvaluator::new(&document).evaluate(filter)? {
                        matched.push(document);
                    }
                }
                matched
            },
            "$sort" => {
                sort_documents(&mut documents, stage_document(operator, argument)?);
                documents
            },
            "$skip" => {
                let count = usize::try_from(integer(operator, argument)?).unwrap_or(0);
                documents.into_iter().skip(count).collect()
            },
            "$limit" => {
                let count = usize::try_from(integer(operator, argument)?).unwrap_or(0);
                documents.truncate(count);
                documents
            },
            "$project" => {
                let projection = stage_document(operator, argument)?;
                documents
                    .into_iter()
                    .map(|document| project(document, projection))
                    .collect()
            },
            "$set" | "$addFields" => {
                let fields = stage_document(operator, argument)?;
                for document in &mut documents {
                    for (path, expression) in fields {
                        if let Some(value) = evaluate(document, expression)? {
                            set_path(document, path, value)?;
                        }
                    }
                }
                documents
            },
            "$unset" => {
                let paths = match argument {
                    Bson::String(path) => vec![path.as_str()],
                    Bson::Array(paths) => paths
                        .iter()
                        .map(|path| path.as_str().ok_or_else(|| invalid("$unset requires field names")))
                        .collect::<ServiceResult<Vec<_>>>()?,
                    _ => return Err(invalid("$unset requires a field name or a list of them")),
                };
                for document in &mut documents {
                    for path in &paths {
                        unset_path(document, path);
                    }
                }
                documents
            },
            "$count" => {
                let field = argument
                    .as_str()
                    .filter(|field| !field.is_empty() && !field.starts_with('$'))
                    .ok_or_else(|| invalid("$count requires a field name"))?;
                if documents.is_empty() {
                    Vec::new()
                } else {
                    let mut counted = Document::new();
                    counted.insert(field, integer_bson(documents.len() as i64));
                    vec![counted]
                }
            },
            "$group" => group(&documents, stage_document(operator, argument)?)?,
            "$sortByCount" => {
                let spec = doc! { "_id": argument.clone(), "count": { "$sum": 1 } };
                let mut grouped = group(&documents, &spec)?;
                sort_documents(&mut grouped, &doc! { "count": -1 });
                grouped
            },
            other => {
                return Err(ServiceError::InvalidQuery(format!(
                    "aggregation stage {other} is not supported by the in-memory driver"
                )));
            },
        };
    }

    Ok(documents)
}

fn invalid(message: &str) -> ServiceError {
    ServiceError::InvalidQuery(message.to_string())
}

fn stage_document<'b>(operator: &str, argument: &'b Bson) -> ServiceResult<&'b Document> {
    argument
        .as_document()
        .ok_or_else(|| ServiceError::InvalidQuery(format!("{operator} requires a document")))
}

fn integer_bson(value: i64) -> Bson {
    match i32::try_from(value) {
        Ok(value) => Bson::Int32(value),
        Err(_) => Bson::Int64(value),
    }
}

/// Evaluates an expression against a document. `None` stands for a missing value.
fn evaluate(document: &Document, expression: &Bson) -> ServiceResult<Option<Bson>> {
    match expression {
        Bson::String(reference) if reference.starts_with("$$") => Err(ServiceError::InvalidQuery(
            format!("variable {reference} is not supported by the in-memory driver")
        )),
        Bson::String(reference) if reference.starts_with('$') => {
            Ok(lookup(document, &reference[1..]).cloned())
        },
        Bson::Document(fields) => {
            if let Some(literal) = fields.get("$literal")
                && fields.len() == 1
            {
                return Ok(Some(literal.clone()));
            }
            let mut evaluated = Document::new();
            for (key, value) in fields {
                if key.starts_with('$') {
                    return Err(ServiceError::InvalidQuery(format!(
                        "expression operator {key} is not supported by the in-memory driver"
                    )));
                }
                if let Some(value) = evaluate(document, value)? {
                    evaluated.insert(key, value);
                }
            }
            Ok(Some(Bson::Document(evaluated)))
        },
        Bson::Array(items) => {
            let mut evaluated = Vec::with_capacity(items.len());
            for item in items {
                evaluated.push(evaluate(document, item)?.unwrap_or(Bson::Null));
            }
            Ok(Some(Bson::Array(evaluated)))
        },
        literal => Ok(Some(literal.clone())),
    }
}

#[derive(Debug, Clone, Copy)]
enum Accumulator {
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
    Push,
    AddToSet,
    Count,
}

impl Accumulator {
    fn parse(field: &str, spec: &Bson) -> ServiceResult<(Self, Bson)> {
        let spec = spec
            .as_document()
            .filter(|spec| spec.len() == 1)
            .ok_or_else(|| ServiceError::InvalidQuery(format!(
                "$group field '{field}' must be a single accumulator"
            )))?;
        let Some((operator, argument)) = spec.iter().next() else {
            return Err(invalid("empty accumulator"));
        };

        let accumulator = match operator.as_str() {
            "$sum" => Accumulator::Sum,
            "$avg" => Accumulator::Avg,
            "$min" => Accumulator::Min,
            "$max" => Accumulator::Max,
            "$first" => Accumulator::First,
            "$last" => Accumulator::Last,
            "$push" => Accumulator::Push,
            "$addToSet" => Accumulator::AddToSet,
            "$count" => Accumulator::Count,
            other => {
                return Err(ServiceError::InvalidQuery(format!(
                    "accumulator {other} is not supported by the in-memory driver"
                )));
            },
        };
        Ok((accumulator, argument.clone()))
    }

    fn fold(self, values: &[Option<Bson>]) -> Bson {
        let present = values.iter().flatten().filter(|value| !matches!(value, Bson::Null));
        match self {
            Accumulator::Sum | Accumulator::Avg => {
                let mut integers = 0i64;
                let mut doubles = 0f64;
                let mut is_double = false;
                let mut count = 0usize;
                for value in present {
                    match value {
                        Bson::Int32(value) => integers = integers.saturating_add(i64::from(*value)),
                        Bson::Int64(value) => integers = integers.saturating_add(*value),
                        Bson::Double(value) => {
                            doubles += value;
                            is_double = true;
                        },
                        _ => continue,
                    }
                    count += 1;
                }
                match self {
                    Accumulator::Avg if count == 0 => Bson::Null,
                    Accumulator::Avg => Bson::Double((integers as f64 + doubles) / count as f64),
                    _ if is_double => Bson::Double(integers as f64 + doubles),
                    _ => integer_bson(integers),
                }
            },
            Accumulator::Min | Accumulator::Max => {
                let wanted = match self {
                    Accumulator::Min => Ordering::Less,
                    _ => Ordering::Greater,
                };
                present
                    .fold(None::<&Bson>, |best, value| match best {
                        Some(best)
                            if Comparable::from(value).sort_cmp(&Comparable::from(best)) != wanted =>
                        {
                            Some(best)
                        },
                        _ => Some(value),
                    })
                    .cloned()
                    .unwrap_or(Bson::Null)
            },
            Accumulator::First => values.first().cloned().flatten().unwrap_or(Bson::Null),
            Accumulator::Last => values.last().cloned().flatten().unwrap_or(Bson::Null),
            Accumulator::Push => Bson::Array(values.iter().flatten().cloned().collect()),
            Accumulator::AddToSet => {
                let mut unique: Vec<Bson> = Vec::new();
                for value in values.iter().flatten() {
                    if !unique.contains(value) {
                        unique.push(value.clone());
                    }
                }
                Bson::Array(unique)
            },
            Accumulator::Count => integer_bson(values.len() as i64),
        }
    }
}

/// Groups documents by the `_id` expression of `spec`, in order of first appearance.
fn group(documents: &[Document], spec: &Document) -> ServiceResult<Vec<Document>> {
    let key_expression = spec
        .get("_id")
        .ok_or_else(|| invalid("$group requires an _id expression"))?;
    let accumulators = spec
        .iter()
        .filter(|(field, _)| field.as_str() != "_id")
        .map(|(field, accumulator)| {
            let (accumulator, argument) = Accumulator::parse(field, accumulator)?;
            Ok((field.as_str(), accumulator, argument))
        })
        .collect::<ServiceResult<Vec<_>>>()?;

    // (key, values collected per accumulator)
    let mut groups: Vec<(Bson, Vec<Vec<Option<Bson>>>)> = Vec::new();
    for document in documents {
        let key = evaluate(document, key_expression)?.unwrap_or(Bson::Null);
        let position = match groups.iter().position(|(existing, _)| *existing == key) {
            Some(position) => position,
            None => {
                groups.push((key, vec![Vec::new(); accumulators.len()]));
                groups.len() - 1
            },
        };
        for (slot, (_, _, argument)) in accumulators.iter().enumerate() {
            let value = evaluate(document, argument)?;
            groups[position].1[slot].push(value);
        }
    }

    Ok(groups
        .into_iter()
        .map(|(key, collected)| {
            let mut grouped = doc! { "_id": key };
            for ((field, accumulator, _), values) in accumulators.iter().zip(&collected) {
                grouped.insert(*field, accumulator.fold(values));
            }
            grouped
        })
        .collect())
}
