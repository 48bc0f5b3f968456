//! Update operators for in-memory documents.
//!
//! Supports `$set`, `$unset` and `$inc` with dotted paths. Replacement-style updates are
//! rejected, as they are by the server's `update_one`/`update_many`.

use bson::{Bson, Document};

use docservice_core::error::{ServiceError, ServiceResult};


const OPERATORS: [&str; 3] = ["$set", "$unset", "$inc"];

/// Checks the shape of an update document before it is applied to anything.
pub(crate) fn check_update(update: &Document) -> ServiceResult<()> {
    if update.is_empty() {
        return Err(ServiceError::InvalidQuery("update document must not be empty".to_string()));
    }

    for (operator, fields) in update {
        if !OPERATORS.contains(&operator.as_str()) {
            return Err(ServiceError::InvalidQuery(format!(
                "unsupported update operator {operator}"
            )));
        }
        if !matches!(fields, Bson::Document(_)) {
            return Err(ServiceError::InvalidQuery(format!(
                "{operator} requires a document of fields"
            )));
        }
    }

    Ok(())
}

/// Applies a checked update document, returning whether the document changed.
pub(crate) fn apply_update(document: &mut Document, update: &Document) -> ServiceResult<bool> {
    let before = document.clone();

    for (operator, fields) in update {
        let Bson::Document(fields) = fields else {
            continue;
        };

        for (path, value) in fields {
            if path == "_id" && document.get("_id") != Some(value) {
                return Err(ServiceError::InvalidQuery("the _id field is immutable".to_string()));
            }

            match operator.as_str() {
                "$set" => set_path(document, path, value.clone())?,
                "$unset" => unset_path(document, path),
                "$inc" => {
                    let current = get_path(document, path).cloned().unwrap_or(Bson::Int32(0));
                    set_path(document, path, increment(path, &current, value)?)?;
                },
                _ => {},
            }
        }
    }

    Ok(*document != before)
}

fn get_path<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    match path.split_once('.') {
        Some((head, rest)) => match document.get(head)? {
            Bson::Document(inner) => get_path(inner, rest),
            _ => None,
        },
        None => document.get(path),
    }
}

pub(crate) fn set_path(document: &mut Document, path: &str, value: Bson) -> ServiceResult<()> {
    match path.split_once('.') {
        Some((head, rest)) => {
            if !document.contains_key(head) {
                document.insert(head, Document::new());
            }
            match document.get_mut(head) {
                Some(Bson::Document(inner)) => set_path(inner, rest, value),
                _ => Err(ServiceError::InvalidQuery(format!(
                    "cannot create field '{rest}' in non-document field '{head}'"
                ))),
            }
        },
        None => {
            document.insert(path, value);
            Ok(())
        },
    }
}

pub(crate) fn unset_path(document: &mut Document, path: &str) {
    match path.split_once('.') {
        Some((head, rest)) => {
            if let Some(Bson::Document(inner)) = document.get_mut(head) {
                unset_path(inner, rest);
            }
        },
        None => {
            document.remove(path);
        },
    }
}

fn increment(path: &str, current: &Bson, by: &Bson) -> ServiceResult<Bson> {
    let sum = match (current, by) {
        (Bson::Int32(a), Bson::Int32(b)) => a.checked_add(*b).map(Bson::Int32),
        (Bson::Int32(a), Bson::Int64(b)) => i64::from(*a).checked_add(*b).map(Bson::Int64),
        (Bson::Int64(a), Bson::Int32(b)) => a.checked_add(i64::from(*b)).map(Bson::Int64),
        (Bson::Int64(a), Bson::Int64(b)) => a.checked_add(*b).map(Bson::Int64),
        (Bson::Double(a), Bson::Double(b)) => Some(Bson::Double(a + b)),
        (Bson::Double(a), Bson::Int32(b)) => Some(Bson::Double(a + f64::from(*b))),
        (Bson::Double(a), Bson::Int64(b)) => Some(Bson::Double(a + *b as f64)),
        (Bson::Int32(a), Bson::Double(b)) => Some(Bson::Double(f64::from(*a) + b)),
        (Bson::Int64(a), Bson::Double(b)) => Some(Bson::Double(*a as f64 + b)),
        _ => None,
    };

    sum.ok_or_else(|| ServiceError::InvalidQuery(format!(
        "cannot apply $inc to non-numeric or overflowing field '{path}'"
    )))
}


#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    #[test]
    fn set_unset_and_inc_follow_dotted_paths() {
        let mut document = doc! { "_id": 1, "name": "a", "stats": { "views": 1 } };
        let update = doc! {
            "$set": { "name": "b", "address.city": "Budapest" },
            "$unset": { "stats.views": "" },
            "$inc": { "count": 2 },
        };

        check_update(&update).unwrap();
        assert!(apply_update(&mut document, &update).unwrap());
        assert_eq!(
            document,
            doc! { "_id": 1, "name": "b", "stats": {}, "address": { "city": "Budapest" }, "count": 2 }
        );
    }

    #[test]
    fn unchanged_documents_are_reported() {
        let mut document = doc! { "name": "a" };

        assert!(!apply_update(&mut document, &doc! { "$set": { "name": "a" } }).unwrap());
    }

    #[test]
    fn invalid_updates_are_rejected() {
        assert!(check_update(&doc! { "name": "a" }).is_err());
        assert!(check_update(&doc! { "$push": { "tags": "a" } }).is_err());
        assert!(check_update(&doc! {}).is_err());

        let mut document = doc! { "_id": 1 };
        assert!(apply_update(&mut document, &doc! { "$set": { "_id": 2 } }).is_err());
        assert!(apply_update(&mut document, &doc! { "$inc": { "_id.x": "a" } }).is_err());
    }
}
