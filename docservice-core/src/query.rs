//! Query expression construction and compilation into MongoDB filter documents.
//!
//! Filters are built from typed [`Field`] descriptors. Every comparison method checks the
//! right-hand side against the field's declared [`ValueKind`] and fails with
//! [`ServiceError::TypeMismatch`] before any database call is made. The resulting [`Clause`]
//! trees are combined with `and`/`or`/`not` and compiled into plain BSON documents by
//! [`FilterCompiler`].
//!
//! # Building filters
//!
//! ```ignore
//! use docservice_core::query::{Field, Filter, ValueKind};
//!
//! const NAME: Field = Field::new("name", ValueKind::String);
//! const PARENT: Field = Field::nullable("parent", ValueKind::ObjectId);
//!
//! let filter = Filter::and([NAME.eq("root")?, PARENT.eq(None::<ObjectId>)?]);
//! let document: bson::Document = filter.into();
//! // { "$and": [{ "name": "root" }, { "parent": null }] }
//! ```
//!
//! # Compilation rules
//!
//! - Equality against an array or document value compiles to `{"$eq": value}` so the value is
//!   matched as a whole; scalars and `null` compile to the bare value.
//! - Every other comparison compiles to `{field: {"$op": value}}`.
//! - `and`/`or` with a single child compile to that child; an empty `and` matches everything
//!   (`{}`) and an empty `or` matches nothing (`{"$expr": false}`).
//! - `not` compiles to `{"$nor": [child]}`, which is valid for any child clause.

use std::borrow::Cow;
use std::convert::Infallible;
use std::fmt;

use bson::spec::BinarySubtype;
use bson::{Bson, Document, doc};

use crate::error::{ServiceError, ServiceResult};

/// The declared type of a field's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Any BSON value is accepted.
    Any,
    /// Booleans.
    Bool,
    /// 32/64-bit integers, doubles and decimals.
    Number,
    /// UTF-8 strings.
    String,
    /// MongoDB object IDs.
    ObjectId,
    /// UUIDs stored as binary subtype 4.
    Uuid,
    /// UTC date-times.
    DateTime,
    /// Arrays. Element-wise operators accept any element value.
    Array,
    /// Embedded documents.
    Document,
}

impl ValueKind {
    /// Returns whether a non-null value has this kind.
    pub fn admits(&self, value: &Bson) -> bool {
        match (self, value) {
            (ValueKind::Any, _) => true,
            (ValueKind::Bool, Bson::Boolean(_)) => true,
            (
                ValueKind::Number,
                Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_),
            ) => true,
            (ValueKind::String, Bson::String(_)) => true,
            (ValueKind::ObjectId, Bson::ObjectId(_)) => true,
            (ValueKind::Uuid, Bson::Binary(binary)) => binary.subtype == BinarySubtype::Uuid,
            (ValueKind::DateTime, Bson::DateTime(_)) => true,
            (ValueKind::Array, Bson::Array(_)) => true,
            (ValueKind::Document, Bson::Document(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Any => "any",
            ValueKind::Bool => "bool",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::ObjectId => "objectId",
            ValueKind::Uuid => "uuid",
            ValueKind::DateTime => "date",
            ValueKind::Array => "array",
            ValueKind::Document => "object",
        };
        f.write_str(name)
    }
}

/// Sort direction for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Ascending order (A to Z, 0 to 9, earliest to latest).
    Asc,
    /// Descending order (Z to A, 9 to 0, latest to earliest).
    Desc,
}

impl SortDirection {
    /// The direction as it appears in sort and index documents.
    pub fn as_i32(self) -> i32 {
        match self {
            SortDirection::Asc => 1,
            SortDirection::Desc => -1,
        }
    }
}

/// Sort specification for query results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    /// The field path to sort by.
    pub field: String,
    /// The sort direction.
    pub direction: SortDirection,
}

/// Comparison operators supported by [`Clause::Comparison`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    /// Equal to.
    Eq,
    /// Not equal to.
    Ne,
    /// Greater than.
    Gt,
    /// Greater than or equal to.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal to.
    Lte,
    /// Member of a sequence.
    In,
    /// Not a member of a sequence.
    Nin,
    /// Field presence.
    Exists,
    /// Regular expression match.
    Regex,
    /// Array contains every listed value.
    All,
    /// Array has the given length.
    Size,
    /// BSON type check by alias.
    Type,
    /// Some array element matches a sub-filter.
    ElemMatch,
}

impl ComparisonOp {
    /// The MongoDB operator key for this comparison.
    pub fn operator(&self) -> &'static str {
        match self {
            ComparisonOp::Eq => "$eq",
            ComparisonOp::Ne => "$ne",
            ComparisonOp::Gt => "$gt",
            ComparisonOp::Gte => "$gte",
            ComparisonOp::Lt => "$lt",
            ComparisonOp::Lte => "$lte",
            ComparisonOp::In => "$in",
            ComparisonOp::Nin => "$nin",
            ComparisonOp::Exists => "$exists",
            ComparisonOp::Regex => "$regex",
            ComparisonOp::All => "$all",
            ComparisonOp::Size => "$size",
            ComparisonOp::Type => "$type",
            ComparisonOp::ElemMatch => "$elemMatch",
        }
    }
}

/// A typed descriptor of a document field.
///
/// Fields are usually declared as constants next to the model they describe. Nested
/// attributes are addressed with dotted paths, either written directly or built with
/// [`Field::nested`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    path: Cow<'static, str>,
    kind: ValueKind,
    nullable: bool,
}

impl Field {
    /// The primary key field. Accepts any key type.
    pub const ID: Field = Field::new("_id", ValueKind::Any);

    /// Declares a non-nullable field.
    pub const fn new(path: &'static str, kind: ValueKind) -> Self {
        Field { path: Cow::Borrowed(path), kind, nullable: false }
    }

    /// Declares a field whose value may be `null`.
    pub const fn nullable(path: &'static str, kind: ValueKind) -> Self {
        Field { path: Cow::Borrowed(path), kind, nullable: true }
    }

    /// Declares a field whose path is only known at runtime.
    pub fn dynamic(path: impl Into<String>, kind: ValueKind, nullable: bool) -> Self {
        Field { path: Cow::Owned(path.into()), kind, nullable }
    }

    /// Addresses `child` inside this (embedded document) field.
    pub fn nested(&self, child: &Field) -> Field {
        Field {
            path: Cow::Owned(format!("{}.{}", self.path, child.path)),
            kind: child.kind,
            nullable: self.nullable || child.nullable,
        }
    }

    /// The dotted path of this field.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The declared value kind.
    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Whether `null` is an accepted value.
    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// Matches documents where the field equals `value`. `None` matches null or missing.
    pub fn eq(&self, value: impl Into<Bson>) -> ServiceResult<Clause> {
        self.compare(ComparisonOp::Eq, value.into(), true)
    }

    /// Matches documents where the field does not equal `value`.
    pub fn ne(&self, value: impl Into<Bson>) -> ServiceResult<Clause> {
        self.compare(ComparisonOp::Ne, value.into(), true)
    }

    /// Matches documents where the field is greater than `value`.
    pub fn gt(&self, value: impl Into<Bson>) -> ServiceResult<Clause> {
        self.compare(ComparisonOp::Gt, value.into(), false)
    }

    /// Matches documents where the field is greater than or equal to `value`.
    pub fn gte(&self, value: impl Into<Bson>) -> ServiceResult<Clause> {
        self.compare(ComparisonOp::Gte, value.into(), false)
    }

    /// Matches documents where the field is less than `value`.
    pub fn lt(&self, value: impl Into<Bson>) -> ServiceResult<Clause> {
        self.compare(ComparisonOp::Lt, value.into(), false)
    }

    /// Matches documents where the field is less than or equal to `value`.
    pub fn lte(&self, value: impl Into<Bson>) -> ServiceResult<Clause> {
        self.compare(ComparisonOp::Lte, value.into(), false)
    }

    /// Matches documents where the field equals any element of `values`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InvalidQuery`] if `values` does not convert to an array and
    /// [`ServiceError::TypeMismatch`] if an element does not fit the field.
    pub fn is_in(&self, values: impl Into<Bson>) -> ServiceResult<Clause> {
        let values = self.sequence(ComparisonOp::In, values.into(), true)?;
        Ok(self.clause(ComparisonOp::In, values))
    }

    /// Matches documents where the field equals no element of `values`.
    pub fn not_in(&self, values: impl Into<Bson>) -> ServiceResult<Clause> {
        let values = self.sequence(ComparisonOp::Nin, values.into(), true)?;
        Ok(self.clause(ComparisonOp::Nin, values))
    }

    /// Matches documents where the field is present (`true`) or absent (`false`).
    pub fn exists(&self, present: bool) -> Clause {
        self.clause(ComparisonOp::Exists, Bson::Boolean(present))
    }

    /// Matches string fields against a regular expression.
    pub fn regex(&self, pattern: impl Into<String>) -> ServiceResult<Clause> {
        self.require_kind(&[ValueKind::String], "$regex")?;
        Ok(self.clause(ComparisonOp::Regex, Bson::String(pattern.into())))
    }

    /// Matches array fields containing every element of `values`.
    pub fn all(&self, values: impl Into<Bson>) -> ServiceResult<Clause> {
        self.require_kind(&[ValueKind::Array], "$all")?;
        let values = self.sequence(ComparisonOp::All, values.into(), false)?;
        Ok(self.clause(ComparisonOp::All, values))
    }

    /// Matches array fields with exactly `len` elements.
    pub fn size(&self, len: i64) -> ServiceResult<Clause> {
        self.require_kind(&[ValueKind::Array], "$size")?;
        if len < 0 {
            return Err(ServiceError::InvalidQuery(format!(
                "$size on '{}' requires a non-negative length, got {len}",
                self.path
            )));
        }
        Ok(self.clause(ComparisonOp::Size, Bson::Int64(len)))
    }

    /// Matches documents where the field has the given BSON type alias (e.g. `"string"`).
    pub fn has_type(&self, alias: impl Into<String>) -> Clause {
        self.clause(ComparisonOp::Type, Bson::String(alias.into()))
    }

    /// Matches array fields where at least one element satisfies `filter`.
    pub fn elem_match(&self, filter: impl Into<Document>) -> ServiceResult<Clause> {
        self.require_kind(&[ValueKind::Array], "$elemMatch")?;
        Ok(self.clause(ComparisonOp::ElemMatch, Bson::Document(filter.into())))
    }

    fn clause(&self, op: ComparisonOp, value: Bson) -> Clause {
        Clause::Comparison { field: self.path.to_string(), op, value }
    }

    fn compare(&self, op: ComparisonOp, value: Bson, allow_null: bool) -> ServiceResult<Clause> {
        self.check_value(&value, allow_null)?;
        Ok(self.clause(op, value))
    }

    fn check_value(&self, value: &Bson, allow_null: bool) -> ServiceResult<()> {
        let admitted = match value {
            Bson::Null => allow_null && (self.nullable || self.kind == ValueKind::Any),
            _ if self.kind == ValueKind::Array => true,
            other => self.kind.admits(other),
        };
        if admitted {
            Ok(())
        } else {
            Err(self.mismatch(value))
        }
    }

    fn sequence(&self, op: ComparisonOp, values: Bson, allow_null: bool) -> ServiceResult<Bson> {
        match values {
            Bson::Array(items) => {
                for item in &items {
                    self.check_value(item, allow_null)?;
                }
                Ok(Bson::Array(items))
            }
            other => Err(ServiceError::InvalidQuery(format!(
                "{} on '{}' requires a sequence, got {:?}",
                op.operator(),
                self.path,
                other.element_type()
            ))),
        }
    }

    fn require_kind(&self, kinds: &[ValueKind], operator: &str) -> ServiceResult<()> {
        if self.kind == ValueKind::Any || kinds.contains(&self.kind) {
            return Ok(());
        }
        Err(ServiceError::TypeMismatch {
            field: self.path.to_string(),
            expected: kinds
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" or "),
            found: format!("{} field used with {operator}", self.kind),
        })
    }

    fn mismatch(&self, value: &Bson) -> ServiceError {
        let expected = if self.nullable {
            format!("{} or null", self.kind)
        } else {
            self.kind.to_string()
        };
        ServiceError::TypeMismatch {
            field: self.path.to_string(),
            expected,
            found: format!("{:?}", value.element_type()),
        }
    }
}

/// A filter clause.
///
/// Clauses are immutable values; combining them produces new clauses. A clause can be
/// reused in several queries and compiles to the same document every time.
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    /// A single field comparison.
    Comparison {
        /// The dotted field path.
        field: String,
        /// The comparison operator.
        op: ComparisonOp,
        /// The right-hand side.
        value: Bson,
    },
    /// Logical AND of multiple clauses (all must match).
    And(Vec<Clause>),
    /// Logical OR of multiple clauses (any must match).
    Or(Vec<Clause>),
    /// Logical NOR of multiple clauses (none may match).
    Nor(Vec<Clause>),
    /// Logical NOT of a clause.
    Not(Box<Clause>),
    /// A filter document passed through verbatim.
    Raw(Document),
}

impl Clause {
    /// Combines this clause with another using logical AND.
    ///
    /// If this clause is already an AND, the other clause is appended to the list.
    pub fn and(self, other: Clause) -> Self {
        match self {
            Clause::And(mut list) => {
                list.push(other);
                Clause::And(list)
            }
            _ => Clause::And(vec![self, other]),
        }
    }

    /// Combines this clause with another using logical OR.
    ///
    /// If this clause is already an OR, the other clause is appended to the list.
    pub fn or(self, other: Clause) -> Self {
        match self {
            Clause::Or(mut list) => {
                list.push(other);
                Clause::Or(list)
            }
            _ => Clause::Or(vec![self, other]),
        }
    }

    /// Negates this clause.
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Clause::Not(Box::new(self))
    }

    /// Compiles this clause into a filter document.
    pub fn compile(&self) -> Document {
        match FilterCompiler.visit_clause(self) {
            Ok(document) => document,
            Err(never) => match never {},
        }
    }
}

impl From<Clause> for Document {
    fn from(clause: Clause) -> Self {
        clause.compile()
    }
}

impl From<&Clause> for Document {
    fn from(clause: &Clause) -> Self {
        clause.compile()
    }
}

/// Helper struct for combining clauses.
///
/// ```ignore
/// let filter = Filter::or([NAME.eq("a")?, NAME.eq("b")?]);
/// ```
pub struct Filter;

impl Filter {
    /// All clauses must match. An empty list matches every document.
    pub fn and(clauses: impl IntoIterator<Item = Clause>) -> Clause {
        Clause::And(clauses.into_iter().collect())
    }

    /// Any clause must match. An empty list matches no document.
    pub fn or(clauses: impl IntoIterator<Item = Clause>) -> Clause {
        Clause::Or(clauses.into_iter().collect())
    }

    /// No clause may match. An empty list matches every document.
    pub fn nor(clauses: impl IntoIterator<Item = Clause>) -> Clause {
        Clause::Nor(clauses.into_iter().collect())
    }

    /// Negates a clause.
    pub fn not(clause: Clause) -> Clause {
        clause.not()
    }

    /// Wraps a hand-written filter document.
    pub fn raw(document: Document) -> Clause {
        Clause::Raw(document)
    }

    /// Matches every document.
    pub fn everything() -> Clause {
        Clause::And(Vec::new())
    }
}

/// A structured query for retrieving documents.
///
/// ```ignore
/// let query = Query::builder()
///     .filter(AGE.gte(18)?)
///     .sort("name", SortDirection::Asc)
///     .limit(10)
///     .build();
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// Optional filter clause. `None` matches every document.
    pub filter: Option<Clause>,
    /// Maximum number of documents to return.
    pub limit: Option<i64>,
    /// Number of documents to skip.
    pub offset: Option<u64>,
    /// Sort keys, applied in order.
    pub sort: Vec<Sort>,
    /// Projection document.
    pub projection: Option<Document>,
}

impl Query {
    /// Creates a new query matching every document.
    pub fn new() -> Self {
        Query::default()
    }

    /// Creates a new query builder for fluent construction.
    pub fn builder() -> QueryBuilder {
        QueryBuilder::new()
    }

    /// The compiled filter document.
    pub fn filter_document(&self) -> Document {
        self.filter.as_ref().map(Clause::compile).unwrap_or_default()
    }

    /// The compiled sort document, if any sort keys are set.
    pub fn sort_document(&self) -> Option<Document> {
        if self.sort.is_empty() {
            return None;
        }
        let mut document = Document::new();
        for sort in &self.sort {
            document.insert(sort.field.clone(), sort.direction.as_i32());
        }
        Some(document)
    }
}

impl From<Clause> for Query {
    fn from(clause: Clause) -> Self {
        Query { filter: Some(clause), ..Query::default() }
    }
}

impl From<Document> for Query {
    fn from(document: Document) -> Self {
        Query { filter: Some(Clause::Raw(document)), ..Query::default() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    query: Query,
}

impl QueryBuilder {
    /// Creates a new query builder.
    pub fn new() -> Self {
        QueryBuilder { query: Query::default() }
    }

    /// Sets the filter clause for this query.
    pub fn filter(mut self, filter: Clause) -> Self {
        self.query.filter = Some(filter);
        self
    }

    /// Sets the maximum number of documents to return.
    pub fn limit(mut self, limit: i64) -> Self {
        self.query.limit = Some(limit);
        self
    }

    /// Sets the number of documents to skip.
    pub fn offset(mut self, offset: u64) -> Self {
        self.query.offset = Some(offset);
        self
    }

    /// Appends a sort key.
    ///
    /// # Arguments
    ///
    /// * `field` - The field path to sort by
    /// * `direction` - The sort direction (ascending or descending)
    pub fn sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.query.sort.push(Sort { field: field.into(), direction });
        self
    }

    /// Sets the projection document.
    pub fn projection(mut self, projection: Document) -> Self {
        self.query.projection = Some(projection);
        self
    }

    /// Builds and returns the final query.
    pub fn build(self) -> Query {
        self.query
    }
}

pub trait QueryVisitor {
    type Output;
    type Error: Into<ServiceError>;

    fn visit_and(&mut self, clauses: &[Clause]) -> Result<Self::Output, Self::Error>;
    fn visit_or(&mut self, clauses: &[Clause]) -> Result<Self::Output, Self::Error>;
    fn visit_nor(&mut self, clauses: &[Clause]) -> Result<Self::Output, Self::Error>;
    fn visit_not(&mut self, clause: &Clause) -> Result<Self::Output, Self::Error>;
    fn visit_raw(&mut self, document: &Document) -> Result<Self::Output, Self::Error>;
    fn visit_comparison(
        &mut self,
        field: &str,
        op: ComparisonOp,
        value: &Bson,
    ) -> Result<Self::Output, Self::Error>;

    fn visit_clause(&mut self, clause: &Clause) -> Result<Self::Output, Self::Error> {
        match clause {
            Clause::And(clauses) => self.visit_and(clauses),
            Clause::Or(clauses) => self.visit_or(clauses),
            Clause::Nor(clauses) => self.visit_nor(clauses),
            Clause::Not(clause) => self.visit_not(clause),
            Clause::Raw(document) => self.visit_raw(document),
            Clause::Comparison { field, op, value } => self.visit_comparison(field, *op, value),
        }
    }
}

/// Compiles clauses into MongoDB filter documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterCompiler;

impl FilterCompiler {
    fn children(&mut self, clauses: &[Clause]) -> Vec<Bson> {
        clauses
            .iter()
            .map(|clause| Bson::Document(clause.compile()))
            .collect()
    }
}

impl QueryVisitor for FilterCompiler {
    type Output = Document;
    type Error = Infallible;

    fn visit_and(&mut self, clauses: &[Clause]) -> Result<Document, Infallible> {
        match clauses {
            [] => Ok(Document::new()),
            [single] => self.visit_clause(single),
            _ => Ok(doc! { "$and": self.children(clauses) }),
        }
    }

    fn visit_or(&mut self, clauses: &[Clause]) -> Result<Document, Infallible> {
        match clauses {
            [] => Ok(doc! { "$expr": false }),
            [single] => self.visit_clause(single),
            _ => Ok(doc! { "$or": self.children(clauses) }),
        }
    }

    fn visit_nor(&mut self, clauses: &[Clause]) -> Result<Document, Infallible> {
        if clauses.is_empty() {
            return Ok(Document::new());
        }
        Ok(doc! { "$nor": self.children(clauses) })
    }

    fn visit_not(&mut self, clause: &Clause) -> Result<Document, Infallible> {
        Ok(doc! { "$nor": [self.visit_clause(clause)?] })
    }

    fn visit_raw(&mut self, document: &Document) -> Result<Document, Infallible> {
        Ok(document.clone())
    }

    fn visit_comparison(
        &mut self,
        field: &str,
        op: ComparisonOp,
        value: &Bson,
    ) -> Result<Document, Infallible> {
        let condition = match (op, value) {
            (ComparisonOp::Eq, Bson::Array(_) | Bson::Document(_)) => {
                Bson::Document(doc! { "$eq": value.clone() })
            }
            (ComparisonOp::Eq, _) => value.clone(),
            _ => {
                let mut operator = Document::new();
                operator.insert(op.operator(), value.clone());
                Bson::Document(operator)
            }
        };
        let mut document = Document::new();
        document.insert(field, condition);
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use bson::oid::ObjectId;

    use super::*;

    const NAME: Field = Field::new("name", ValueKind::String);
    const AGE: Field = Field::new("age", ValueKind::Number);
    const PARENT: Field = Field::nullable("parent", ValueKind::ObjectId);
    const TAGS: Field = Field::new("tags", ValueKind::Array);
    const ADDRESS: Field = Field::new("address", ValueKind::Document);
    const CITY: Field = Field::new("city", ValueKind::String);

    #[test]
    fn equality_compiles_scalars_bare_and_composites_with_eq() {
        assert_eq!(NAME.eq("root").unwrap().compile(), doc! { "name": "root" });
        assert_eq!(
            TAGS.eq(vec!["a", "b"]).unwrap().compile(),
            doc! { "tags": { "$eq": ["a", "b"] } }
        );
        assert_eq!(
            ADDRESS.eq(doc! { "city": "Budapest" }).unwrap().compile(),
            doc! { "address": { "$eq": { "city": "Budapest" } } }
        );
    }

    #[test]
    fn null_equality_compiles_to_explicit_null() {
        let clause = PARENT.eq(None::<ObjectId>).unwrap();

        assert_eq!(clause.compile(), doc! { "parent": null });
    }

    #[test]
    fn null_is_rejected_for_non_nullable_fields() {
        let error = NAME.eq(Bson::Null).unwrap_err();

        assert!(matches!(error, ServiceError::TypeMismatch { field, .. } if field == "name"));
    }

    #[test]
    fn mismatched_values_fail_before_compilation() {
        assert!(matches!(AGE.gt("ten"), Err(ServiceError::TypeMismatch { .. })));
        assert!(matches!(NAME.size(3), Err(ServiceError::TypeMismatch { .. })));
        assert!(matches!(AGE.regex("^1"), Err(ServiceError::TypeMismatch { .. })));
        assert!(matches!(PARENT.gt(Bson::Null), Err(ServiceError::TypeMismatch { .. })));
    }

    #[test]
    fn membership_requires_a_sequence() {
        assert!(matches!(NAME.is_in("root"), Err(ServiceError::InvalidQuery(_))));
        assert!(matches!(NAME.is_in(vec![1, 2]), Err(ServiceError::TypeMismatch { .. })));

        let ids = vec![ObjectId::new(), ObjectId::new()];
        let clause = PARENT.is_in(ids.clone()).unwrap();

        assert_eq!(clause.compile(), doc! { "parent": { "$in": [ids[0], ids[1]] } });
    }

    #[test]
    fn operators_compile_to_operator_documents() {
        assert_eq!(AGE.gte(18).unwrap().compile(), doc! { "age": { "$gte": 18 } });
        assert_eq!(AGE.ne(3).unwrap().compile(), doc! { "age": { "$ne": 3 } });
        assert_eq!(NAME.exists(false).compile(), doc! { "name": { "$exists": false } });
        assert_eq!(
            NAME.regex("^ro").unwrap().compile(),
            doc! { "name": { "$regex": "^ro" } }
        );
        assert_eq!(TAGS.size(2).unwrap().compile(), doc! { "tags": { "$size": 2_i64 } });
        assert_eq!(
            TAGS.all(vec!["a"]).unwrap().compile(),
            doc! { "tags": { "$all": ["a"] } }
        );
        assert_eq!(NAME.has_type("string").compile(), doc! { "name": { "$type": "string" } });
    }

    #[test]
    fn nested_fields_use_dotted_paths() {
        let clause = ADDRESS.nested(&CITY).eq("Budapest").unwrap();

        assert_eq!(clause.compile(), doc! { "address.city": "Budapest" });
    }

    #[test]
    fn empty_and_single_junctions() {
        assert_eq!(Filter::and([]).compile(), doc! {});
        assert_eq!(Filter::or([]).compile(), doc! { "$expr": false });

        let single = NAME.eq("root").unwrap();
        assert_eq!(Filter::and([single.clone()]).compile(), single.compile());
        assert_eq!(Filter::or([single.clone()]).compile(), single.compile());
    }

    #[test]
    fn junctions_and_negation_nest() {
        let clause = NAME
            .eq("a")
            .unwrap()
            .or(NAME.eq("b").unwrap())
            .and(AGE.lt(30).unwrap())
            .not();

        assert_eq!(
            clause.compile(),
            doc! {
                "$nor": [{
                    "$and": [
                        { "$or": [{ "name": "a" }, { "name": "b" }] },
                        { "age": { "$lt": 30 } },
                    ]
                }]
            }
        );
    }

    #[test]
    fn nor_lists_every_child() {
        let clause = Filter::nor([NAME.eq("a").unwrap(), AGE.lt(3).unwrap()]);

        assert_eq!(
            clause.compile(),
            doc! { "$nor": [{ "name": "a" }, { "age": { "$lt": 3 } }] }
        );
        assert_eq!(Filter::nor([]).compile(), doc! {});
    }

    #[test]
    fn compilation_is_repeatable() {
        let clause = Filter::and([NAME.eq("a").unwrap(), AGE.gt(1).unwrap()]);

        assert_eq!(clause.compile(), clause.compile());
        assert_eq!(Document::from(&clause), clause.compile());
    }

    #[test]
    fn query_builder_collects_options() {
        let query = Query::builder()
            .filter(NAME.eq("a").unwrap())
            .sort("name", SortDirection::Asc)
            .sort("age", SortDirection::Desc)
            .limit(5)
            .offset(10)
            .build();

        assert_eq!(query.filter_document(), doc! { "name": "a" });
        assert_eq!(query.sort_document(), Some(doc! { "name": 1, "age": -1 }));
        assert_eq!(query.limit, Some(5));
        assert_eq!(query.offset, Some(10));
        assert_eq!(Query::new().filter_document(), doc! {});
    }
}
