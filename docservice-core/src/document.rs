//! Conversion between typed models and stored BSON documents.
//!
//! Services never hand typed values to a driver directly. Inserts and updates are turned into
//! storage mappings with [`ToStorageMapping`], and documents read back from the database are
//! turned into models with [`FromStorageMapping`]. Both traits are implemented for every
//! `serde` type, so a model only has to derive `Serialize`/`Deserialize`.

use bson::{Bson, Document, de::deserialize_from_bson, oid::ObjectId, ser::serialize_to_bson};
use serde::{Serialize, de::DeserializeOwned};
use std::fmt::Debug;

use crate::error::{ServiceError, ServiceResult};

/// The name of the primary key field in every stored document.
pub const ID_FIELD: &str = "_id";

/// Converts a value into the document that is written to the database.
///
/// Optional fields serialize to `null` unless the model skips them with
/// `#[serde(skip_serializing_if = "Option::is_none")]`; see
/// [`ServiceConfig::exclude_null_on_insert`](crate::config::ServiceConfig::exclude_null_on_insert)
/// for dropping them on insert instead.
pub trait ToStorageMapping {
    /// Serializes `self` into a BSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Serialization`] if serialization fails and
    /// [`ServiceError::InvalidDocument`] if the value does not serialize to a document.
    fn to_storage_mapping(&self) -> ServiceResult<Document>;
}

impl<T: Serialize + ?Sized> ToStorageMapping for T {
    fn to_storage_mapping(&self) -> ServiceResult<Document> {
        match serialize_to_bson(self)? {
            Bson::Document(document) => Ok(document),
            other => Err(ServiceError::InvalidDocument(format!(
                "expected a document, found {:?}",
                other.element_type()
            ))),
        }
    }
}

/// Converts a stored document back into a typed model.
pub trait FromStorageMapping: Sized {
    /// Deserializes a model from a stored document.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InvalidDocument`] if the document does not match the model.
    fn from_storage_mapping(document: Document) -> ServiceResult<Self>;
}

impl<T: DeserializeOwned> FromStorageMapping for T {
    fn from_storage_mapping(document: Document) -> ServiceResult<Self> {
        deserialize_from_bson(Bson::Document(document))
            .map_err(|e| ServiceError::InvalidDocument(e.to_string()))
    }
}

/// A type that can be used as the `_id` of a stored document.
pub trait PrimaryKey: Clone + Debug + PartialEq + Send + Sync + 'static {
    /// Converts the key into its stored representation.
    fn to_bson(&self) -> Bson;

    /// Parses a key from its stored representation.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InvalidDocument`] if the value is not a key of this type.
    fn from_bson(value: Bson) -> ServiceResult<Self>;
}

fn unexpected_key<T>(expected: &str, value: &Bson) -> ServiceResult<T> {
    Err(ServiceError::InvalidDocument(format!(
        "expected {expected} primary key, found {:?}",
        value.element_type()
    )))
}

impl PrimaryKey for ObjectId {
    fn to_bson(&self) -> Bson {
        Bson::ObjectId(*self)
    }

    fn from_bson(value: Bson) -> ServiceResult<Self> {
        match value {
            Bson::ObjectId(id) => Ok(id),
            other => unexpected_key("an ObjectId", &other),
        }
    }
}

impl PrimaryKey for bson::Uuid {
    fn to_bson(&self) -> Bson {
        Bson::from(*self)
    }

    fn from_bson(value: Bson) -> ServiceResult<Self> {
        match value {
            Bson::Binary(binary) => binary
                .to_uuid()
                .map_err(|e| ServiceError::InvalidDocument(e.to_string())),
            other => unexpected_key("a UUID", &other),
        }
    }
}

impl PrimaryKey for uuid::Uuid {
    fn to_bson(&self) -> Bson {
        bson::Uuid::from(*self).to_bson()
    }

    fn from_bson(value: Bson) -> ServiceResult<Self> {
        <bson::Uuid as PrimaryKey>::from_bson(value).map(uuid::Uuid::from)
    }
}

impl PrimaryKey for String {
    fn to_bson(&self) -> Bson {
        Bson::String(self.clone())
    }

    fn from_bson(value: Bson) -> ServiceResult<Self> {
        match value {
            Bson::String(id) => Ok(id),
            other => unexpected_key("a string", &other),
        }
    }
}

impl PrimaryKey for i64 {
    fn to_bson(&self) -> Bson {
        Bson::Int64(*self)
    }

    fn from_bson(value: Bson) -> ServiceResult<Self> {
        match value {
            Bson::Int64(id) => Ok(id),
            Bson::Int32(id) => Ok(i64::from(id)),
            other => unexpected_key("an integer", &other),
        }
    }
}

/// Reads the primary key of a stored document.
pub fn document_id<K: PrimaryKey>(document: &Document) -> ServiceResult<K> {
    match document.get(ID_FIELD) {
        Some(id) => K::from_bson(id.clone()),
        None => Err(ServiceError::InvalidDocument(format!(
            "document has no {ID_FIELD} field"
        ))),
    }
}
