mod common;

use docservice::{bson, memory::InMemoryDriver, prelude::*};

use common::{
    AGE, ArchiveService, NAME, PersonService, PersonUpdate, StrictPersonService, database, person,
};

#[tokio::test]
async fn validators_reject_before_anything_is_written() {
    let database = database();
    let people = database.service::<PersonService>();

    let error = people.insert_one(&person("Kid", 12), None).await.unwrap_err();
    match &error {
        ServiceError::ValidationFailed { rule, .. } => assert_eq!(rule, "PersonService.adult"),
        other => panic!("unexpected error: {other:?}"),
    }

    let error = people
        .insert_many(&[person("Ada", 36), person(" ", 40)], None)
        .await
        .unwrap_err();
    match &error {
        ServiceError::ValidationFailed { rule, .. } => assert_eq!(rule, "PersonService.name_not_blank"),
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(people.count_documents(Filter::everything(), None).await.unwrap(), 0);
}

#[tokio::test]
async fn update_validators_see_only_the_changes() {
    let database = database();
    let people = database.service::<PersonService>();
    let ada = people.create(&person("Ada", 36), None).await.unwrap();

    let error = people
        .update(&ada.id, &PersonUpdate { name: Some(String::new()), ..Default::default() }, None)
        .await
        .unwrap_err();
    assert!(matches!(error, ServiceError::ValidationFailed { .. }));

    // the insert-only age check does not apply to updates
    let younger = people
        .update(&ada.id, &PersonUpdate { age: Some(10), ..Default::default() }, None)
        .await
        .unwrap();
    assert_eq!(younger.age, 10);
    assert_eq!(younger.name, "Ada");
}

#[tokio::test]
async fn empty_updates_write_nothing() {
    let database = database();
    let people = database.service::<PersonService>();
    people.insert_many(&[person("Ada", 36), person("Bob", 40)], None).await.unwrap();

    let outcome = people
        .update_many(Filter::everything(), &PersonUpdate::default(), None)
        .await
        .unwrap();

    assert_eq!(outcome, UpdateOutcome { matched_count: 2, modified_count: 0 });
}

#[tokio::test]
async fn updating_a_missing_document_is_not_found() {
    let database = database();
    let people = database.service::<PersonService>();

    let error = people
        .update(&ObjectId::new(), &PersonUpdate { age: Some(1), ..Default::default() }, None)
        .await
        .unwrap_err();

    assert!(matches!(error, ServiceError::NotFound { .. }));
}

#[tokio::test]
async fn deletes_run_pre_rules_in_the_same_transaction() {
    let database = database();
    let people = database.service::<PersonService>();
    let archive = database.service::<ArchiveService>();

    let ada = people.insert_one(&person("Ada", 36), None).await.unwrap();
    people.insert_one(&person("Bob", 40), None).await.unwrap();

    people.delete_by_id(&ada, None).await.unwrap();

    let entries = archive.find(Filter::everything(), None).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].person, ada);
    assert!(!people.exists(&ada, None).await.unwrap());
    assert_eq!(database.driver().committed_transactions(), 1);
}

#[tokio::test]
async fn a_failing_pre_rule_rolls_back_earlier_rules() {
    let database = database();
    let people = database.service::<PersonService>();
    let archive = database.service::<ArchiveService>();

    people.insert_one(&person("Ada", 36), None).await.unwrap();
    people.insert_one(&person("locked", 50), None).await.unwrap();

    let error = people.delete_many(Filter::everything(), None).await.unwrap_err();

    match &error {
        ServiceError::DeleteRuleFailed { rule, source } => {
            assert_eq!(rule, "PersonService.not_locked");
            assert_eq!(source.to_string(), "locked people cannot be deleted");
        },
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(people.count_documents(Filter::everything(), None).await.unwrap(), 2);
    assert_eq!(archive.count_documents(Filter::everything(), None).await.unwrap(), 0);
    assert_eq!(database.driver().aborted_transactions(), 1);
}

#[tokio::test]
async fn without_transactions_rules_run_without_atomicity() {
    let driver = InMemoryDriver::builder()
        .with_transactions(false)
        .build()
        .await
        .unwrap();
    let database = Database::new(driver);
    let people = database.service::<PersonService>();
    let archive = database.service::<ArchiveService>();

    people.insert_one(&person("locked", 50), None).await.unwrap();

    let error = people.delete_many(Filter::everything(), None).await.unwrap_err();

    assert!(matches!(error, ServiceError::DeleteRuleFailed { .. }));
    assert_eq!(people.count_documents(Filter::everything(), None).await.unwrap(), 1);
    // the archive entry written by the first rule stays
    assert_eq!(archive.count_documents(Filter::everything(), None).await.unwrap(), 1);
}

#[tokio::test]
async fn delete_one_with_rules_refuses_ambiguous_filters() {
    let database = database();
    let people = database.service::<PersonService>();
    people.insert_many(&[person("Ada", 36), person("Bob", 40)], None).await.unwrap();

    let error = people
        .delete_one(AGE.gt(18).unwrap(), None)
        .await
        .unwrap_err();

    assert!(matches!(error, ServiceError::InvalidQuery(_)));
    assert_eq!(people.count_documents(Filter::everything(), None).await.unwrap(), 2);
}

#[tokio::test]
async fn overriding_a_rule_keeps_its_position() {
    let database = database();
    let strict = database.service::<StrictPersonService>();

    let names = strict
        .rules()
        .validators(ValidatorKind::Insert)
        .map(|validator| validator.name().to_string())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["name_not_blank", "adult"]);

    let error = strict.insert_one(&person("Young", 19), None).await.unwrap_err();
    assert_eq!(error.root_cause().to_string(), "must be at least 21");

    // the base service keeps its own rule
    let people = database.service::<PersonService>();
    people.insert_one(&person("Young", 19), None).await.unwrap();
}

#[tokio::test]
async fn explicit_rule_sets_replace_registered_rules() {
    let database = database();
    let rules = RuleSet::<PersonService, InMemoryDriver>::builder().build();
    let people = Service::with_rules(database.clone(), rules.into());

    people.insert_one(&person("Kid", 12), None).await.unwrap();
    people.delete_many(NAME.eq("Kid").unwrap(), None).await.unwrap();

    assert_eq!(database.driver().committed_transactions(), 0);
    assert_eq!(people.count_documents(Filter::everything(), None).await.unwrap(), 0);
}

#[tokio::test]
async fn indexes_are_created_from_declarations() {
    let database = database();
    let people = database.service::<PersonService>();

    let names = people.create_indexes(None).await.unwrap();
    assert_eq!(names, vec!["name_unique", "age_desc"]);
    assert_eq!(
        people.list_index_names().await.unwrap(),
        vec!["_id_", "name_unique", "age_desc"]
    );

    people.drop_index("age_desc", None).await.unwrap();
    assert_eq!(people.list_index_names().await.unwrap(), vec!["_id_", "name_unique"]);

    people.create_indexes(None).await.unwrap();
    people.drop_indexes(None).await.unwrap();
    assert_eq!(people.list_index_names().await.unwrap(), vec!["_id_"]);
}

/// Stamps every stored person with its creation time.
struct StampedPersonService;

impl ServiceSpec for StampedPersonService {
    type Insert = common::PersonCreate;
    type Update = PersonUpdate;
    type Model = Document;
    type Id = ObjectId;

    const COLLECTION: &'static str = "stamped_people";

    fn prepare_insert(data: &Self::Insert, config: &ServiceConfig) -> ServiceResult<Document> {
        let mut document = data.to_storage_mapping()?;
        if config.exclude_null_on_insert {
            document.remove("nickname");
        }
        document.insert("created_at", bson::DateTime::from_chrono(chrono::Utc::now()));
        Ok(document)
    }
}

#[tokio::test]
async fn prepare_insert_customises_the_stored_document() {
    let database = database();
    let people = database
        .service::<StampedPersonService>()
        .with_config(ServiceConfig::default().with_exclude_null_on_insert(true));
    let before = chrono::Utc::now() - chrono::Duration::seconds(1);

    let stored = people.create(&person("Ada", 36), None).await.unwrap();

    assert!(!stored.contains_key("nickname"));
    let created_at = stored.get_datetime("created_at").unwrap().to_chrono();
    assert!(created_at >= before);
}
