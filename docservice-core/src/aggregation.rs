//! Aggregation pipelines.
//!
//! An [`Aggregation`] is an ordered list of stage documents. Stages are added with
//! [`Aggregation::stage`], which takes the stage operator as an [`AggregationStage`] so that
//! typos in operator names are caught by the compiler, or with one of the shorthands for the
//! common stages.
//!
//! ```ignore
//! let pipeline = Aggregation::new()
//!     .filter(&PARENT.eq(Bson::Null)?)
//!     .stage(AggregationStage::Group, doc! { "_id": null, "roots": { "$sum": 1 } });
//! let counts = nodes.aggregate(pipeline, None).await?;
//! ```

use bson::{Bson, Document};

use crate::query::{Clause, SortDirection};

/// Aggregation pipeline stage operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregationStage {
    AddFields,
    Bucket,
    BucketAuto,
    ChangeStream,
    ChangeStreamSplitLargeEvent,
    CollStats,
    Count,
    CurrentOp,
    Densify,
    Documents,
    Facet,
    Fill,
    GeoNear,
    GraphLookup,
    Group,
    IndexStats,
    Limit,
    ListLocalSessions,
    ListSampledQueries,
    ListSearchIndexes,
    ListSessions,
    Lookup,
    Match,
    Merge,
    Out,
    PlanCacheStats,
    Project,
    QuerySettings,
    Redact,
    ReplaceRoot,
    ReplaceWith,
    Sample,
    Search,
    SearchMeta,
    Set,
    SetWindowFields,
    ShardedDataDistribution,
    Skip,
    Sort,
    SortByCount,
    UnionWith,
    Unset,
    Unwind,
    VectorSearch,
}

impl AggregationStage {
    /// The operator key of the stage document, e.g. `$match`.
    pub fn operator(&self) -> &'static str {
        match self {
            AggregationStage::AddFields => "$addFields",
            AggregationStage::Bucket => "$bucket",
            AggregationStage::BucketAuto => "$bucketAuto",
            AggregationStage::ChangeStream => "$changeStream",
            AggregationStage::ChangeStreamSplitLargeEvent => "$changeStreamSplitLargeEvent",
            AggregationStage::CollStats => "$collStats",
            AggregationStage::Count => "$count",
            AggregationStage::CurrentOp => "$currentOp",
            AggregationStage::Densify => "$densify",
            AggregationStage::Documents => "$documents",
            AggregationStage::Facet => "$facet",
            AggregationStage::Fill => "$fill",
            AggregationStage::GeoNear => "$geoNear",
            AggregationStage::GraphLookup => "$graphLookup",
            AggregationStage::Group => "$group",
            AggregationStage::IndexStats => "$indexStats",
            AggregationStage::Limit => "$limit",
            AggregationStage::ListLocalSessions => "$listLocalSessions",
            AggregationStage::ListSampledQueries => "$listSampledQueries",
            AggregationStage::ListSearchIndexes => "$listSearchIndexes",
            AggregationStage::ListSessions => "$listSessions",
            AggregationStage::Lookup => "$lookup",
            AggregationStage::Match => "$match",
            AggregationStage::Merge => "$merge",
            AggregationStage::Out => "$out",
            AggregationStage::PlanCacheStats => "$planCacheStats",
            AggregationStage::Project => "$project",
            AggregationStage::QuerySettings => "$querySettings",
            AggregationStage::Redact => "$redact",
            AggregationStage::ReplaceRoot => "$replaceRoot",
            AggregationStage::ReplaceWith => "$replaceWith",
            AggregationStage::Sample => "$sample",
            AggregationStage::Search => "$search",
            AggregationStage::SearchMeta => "$searchMeta",
            AggregationStage::Set => "$set",
            AggregationStage::SetWindowFields => "$setWindowFields",
            AggregationStage::ShardedDataDistribution => "$shardedDataDistribution",
            AggregationStage::Skip => "$skip",
            AggregationStage::Sort => "$sort",
            AggregationStage::SortByCount => "$sortByCount",
            AggregationStage::UnionWith => "$unionWith",
            AggregationStage::Unset => "$unset",
            AggregationStage::Unwind => "$unwind",
            AggregationStage::VectorSearch => "$vectorSearch",
        }
    }

    /// Builds the stage document `{ <operator>: value }`.
    pub fn with(self, value: impl Into<Bson>) -> Document {
        let mut stage = Document::new();
        stage.insert(self.operator(), value.into());
        stage
    }
}

/// An aggregation pipeline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregation {
    stages: Vec<Document>,
}

impl Aggregation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage.
    pub fn stage(mut self, stage: AggregationStage, value: impl Into<Bson>) -> Self {
        self.stages.push(stage.with(value));
        self
    }

    /// Appends a `$match` stage with the compiled clause.
    pub fn filter(self, clause: &Clause) -> Self {
        self.stage(AggregationStage::Match, clause.compile())
    }

    /// Appends a `$sort` stage on a single field.
    pub fn sort(self, field: &str, direction: SortDirection) -> Self {
        let mut sort = Document::new();
        sort.insert(field, direction.as_i32());
        self.stage(AggregationStage::Sort, sort)
    }

    pub fn skip(self, count: i64) -> Self {
        self.stage(AggregationStage::Skip, count)
    }

    pub fn limit(self, count: i64) -> Self {
        self.stage(AggregationStage::Limit, count)
    }

    /// The stages in pipeline order.
    pub fn stages(&self) -> &[Document] {
        &self.stages
    }

    pub fn into_stages(self) -> Vec<Document> {
        self.stages
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl From<Vec<Document>> for Aggregation {
    fn from(stages: Vec<Document>) -> Self {
        Self { stages }
    }
}

impl FromIterator<Document> for Aggregation {
    fn from_iter<I: IntoIterator<Item = Document>>(stages: I) -> Self {
        Self { stages: stages.into_iter().collect() }
    }
}
