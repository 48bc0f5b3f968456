mod common;

use docservice::prelude::*;

use common::{AGE, NAME, NICKNAME, PersonCreate, PersonService, TAGS, database, person};

async fn seeded() -> Service<PersonService, docservice::memory::InMemoryDriver> {
    let people = database().service::<PersonService>();
    people
        .insert_many(
            &[
                PersonCreate { nickname: Some("Countess".into()), tags: vec!["math".into(), "poetry".into()], ..person("Ada", 36) },
                PersonCreate { tags: vec!["math".into()], ..person("Alan", 41) },
                person("Bob", 20),
                PersonCreate { nickname: Some("Gracie".into()), tags: vec!["navy".into()], ..person("Grace", 85) },
            ],
            None,
        )
        .await
        .unwrap();
    people
}

async fn names(people: &Service<PersonService, docservice::memory::InMemoryDriver>, query: impl Into<Query>) -> Vec<String> {
    people
        .find(query, None)
        .await
        .unwrap()
        .into_iter()
        .map(|person| person.name)
        .collect()
}

#[tokio::test]
async fn empty_conjunctions_match_everything_and_empty_disjunctions_nothing() {
    let people = seeded().await;

    assert_eq!(names(&people, Filter::and([])).await.len(), 4);
    assert!(names(&people, Filter::or([])).await.is_empty());
}

#[tokio::test]
async fn null_equality_matches_missing_fields() {
    let people = seeded().await;

    assert_eq!(names(&people, NICKNAME.eq(Bson::Null).unwrap()).await, vec!["Alan", "Bob"]);
    assert_eq!(names(&people, NICKNAME.ne(Bson::Null).unwrap()).await, vec!["Ada", "Grace"]);
    assert_eq!(names(&people, NICKNAME.exists(false)).await, vec!["Alan", "Bob"]);
}

#[tokio::test]
async fn combinators_compose() {
    let people = seeded().await;

    let filter = AGE.gt(30).unwrap().and(NAME.regex("^A").unwrap());
    assert_eq!(names(&people, filter.clone()).await, vec!["Ada", "Alan"]);
    assert_eq!(names(&people, filter.not()).await, vec!["Bob", "Grace"]);

    let filter = AGE.lt(25).unwrap().or(AGE.gte(80).unwrap());
    assert_eq!(names(&people, filter).await, vec!["Bob", "Grace"]);

    let filter = NAME.is_in(vec!["Bob", "Grace", "Nobody"]).unwrap();
    assert_eq!(names(&people, filter).await, vec!["Bob", "Grace"]);

    let filter = NAME.not_in(vec!["Bob", "Grace"]).unwrap();
    assert_eq!(names(&people, filter).await, vec!["Ada", "Alan"]);
}

#[tokio::test]
async fn array_operators() {
    let people = seeded().await;

    assert_eq!(names(&people, TAGS.eq("math").unwrap()).await, vec!["Ada", "Alan"]);
    assert_eq!(names(&people, TAGS.all(vec!["math", "poetry"]).unwrap()).await, vec!["Ada"]);
    assert_eq!(names(&people, TAGS.size(0).unwrap()).await, vec!["Bob"]);
    assert_eq!(
        names(&people, TAGS.elem_match(doc! { "$regex": "^na" }).unwrap()).await,
        vec!["Grace"]
    );
}

#[tokio::test]
async fn raw_clauses_pass_through() {
    let people = seeded().await;

    let filter = Filter::raw(doc! { "age": { "$gte": 40, "$lt": 50 } });
    assert_eq!(names(&people, filter).await, vec!["Alan"]);
}

#[tokio::test]
async fn queries_sort_skip_limit_and_project() {
    let people = seeded().await;

    let query = Query::builder()
        .filter(AGE.gte(20).unwrap())
        .sort(AGE.path(), SortDirection::Desc)
        .offset(1)
        .limit(2)
        .build();
    assert_eq!(names(&people, query).await, vec!["Alan", "Ada"]);

    let query = Query::builder()
        .sort(NAME.path(), SortDirection::Asc)
        .projection(doc! { "name": 1, "_id": 0 })
        .limit(1)
        .build();
    let documents = people.find_documents(query, None).await.unwrap();
    assert_eq!(documents, vec![doc! { "name": "Ada" }]);
}

#[tokio::test]
async fn type_mismatches_are_rejected_before_reaching_the_driver() {
    assert!(matches!(AGE.eq("old"), Err(ServiceError::TypeMismatch { .. })));
    assert!(matches!(NAME.eq(Bson::Null), Err(ServiceError::TypeMismatch { .. })));
    assert!(matches!(NAME.is_in("Ada"), Err(ServiceError::InvalidQuery(_))));
}

#[tokio::test]
async fn reads_by_id() {
    let people = seeded().await;
    let ids = people.find_ids(NAME.eq("Grace").unwrap(), None).await.unwrap();

    let grace = people.get_by_id(&ids[0], None).await.unwrap().unwrap();
    assert_eq!(grace.nickname.as_deref(), Some("Gracie"));
    assert!(people.get_by_id(&ObjectId::new(), None).await.unwrap().is_none());
    assert!(people.find_one(NAME.eq("Nobody").unwrap(), None).await.unwrap().is_none());
}

#[tokio::test]
async fn type_checks_match_stored_types() {
    let people = seeded().await;

    assert_eq!(names(&people, NICKNAME.has_type("string")).await, vec!["Ada", "Grace"]);
    assert_eq!(names(&people, AGE.has_type("int")).await.len(), 4);
    assert!(names(&people, AGE.has_type("double")).await.is_empty());
}

#[tokio::test]
async fn nor_excludes_every_listed_match() {
    let people = seeded().await;

    let filter = Filter::nor([AGE.gte(80).unwrap(), NAME.eq("Bob").unwrap()]);
    assert_eq!(names(&people, filter).await, vec!["Ada", "Alan"]);
    assert_eq!(names(&people, Filter::nor([])).await.len(), 4);
}

#[derive(Debug, PartialEq, serde::Deserialize)]
struct AgeSummary {
    total: i32,
    oldest: i32,
}

#[tokio::test]
async fn aggregations_run_against_the_collection() {
    let people = seeded().await;

    let names_by_age = Aggregation::new()
        .filter(&AGE.gt(30).unwrap())
        .sort("age", SortDirection::Desc)
        .stage(AggregationStage::Project, doc! { "_id": 0, "name": 1 });
    assert_eq!(
        people.aggregate(names_by_age, None).await.unwrap(),
        vec![doc! { "name": "Grace" }, doc! { "name": "Alan" }, doc! { "name": "Ada" }]
    );

    let summary = Aggregation::new().stage(
        AggregationStage::Group,
        doc! { "_id": null, "total": { "$sum": "$age" }, "oldest": { "$max": "$age" } },
    );
    assert_eq!(
        people.aggregate_as::<AgeSummary>(summary, None).await.unwrap(),
        vec![AgeSummary { total: 182, oldest: 85 }]
    );

    let unsupported = Aggregation::new().stage(AggregationStage::Lookup, doc! { "from": "elsewhere" });
    assert!(matches!(people.aggregate(unsupported, None).await, Err(ServiceError::InvalidQuery(_))));
}
