//! Index declarations.

use bson::{Bson, Document};

use crate::query::{Field, SortDirection};

/// The declaration of a single collection index.
///
/// Services list their indexes in
/// [`ServiceSpec::indexes`](crate::service::ServiceSpec::indexes) and create them with
/// [`Service::create_indexes`](crate::service::Service::create_indexes).
///
/// ```ignore
/// IndexSpec::new(doc! { "name": 1 }).with_unique(true)
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexSpec {
    /// The key document, e.g. `{ "name": 1, "created_at": -1 }`.
    pub keys: Document,
    /// Whether the index enforces uniqueness.
    pub unique: bool,
    /// Whether documents missing the indexed fields are skipped.
    pub sparse: bool,
    /// Whether the index is built in the background (ignored by servers that no longer support it).
    pub background: bool,
    /// Optional collation document.
    pub collation: Option<Document>,
    /// Further driver-specific index options, passed through as-is.
    pub extra: Document,
}

impl IndexSpec {
    /// Creates an index over the given key document.
    pub fn new(keys: Document) -> Self {
        IndexSpec { keys, ..IndexSpec::default() }
    }

    /// Creates a single-field index.
    pub fn on(field: &Field, direction: SortDirection) -> Self {
        let mut keys = Document::new();
        keys.insert(field.path(), direction.as_i32());
        IndexSpec::new(keys)
    }

    pub fn with_unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    pub fn with_sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }

    pub fn with_background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    pub fn with_collation(mut self, collation: Document) -> Self {
        self.collation = Some(collation);
        self
    }

    /// Adds a driver-specific option such as `expireAfterSeconds`.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Returns the option document understood by the server (`unique`, `sparse`, ...).
    pub fn options_document(&self, name: &str) -> Document {
        let mut options = Document::new();
        options.insert("name", name);
        if self.unique {
            options.insert("unique", true);
        }
        if self.sparse {
            options.insert("sparse", true);
        }
        if self.background {
            options.insert("background", true);
        }
        if let Some(collation) = &self.collation {
            options.insert("collation", collation.clone());
        }
        for (key, value) in &self.extra {
            options.insert(key.clone(), value.clone());
        }
        options
    }
}
