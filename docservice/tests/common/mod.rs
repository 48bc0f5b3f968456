#![allow(dead_code)]

use docservice::{memory::InMemoryDriver, prelude::*};
use serde::{Deserialize, Serialize};

pub fn database() -> Database<InMemoryDriver> {
    Database::new(InMemoryDriver::new())
}

// Tree nodes: a parent must exist, deleting a node deletes its subtree, roots cannot be deleted.

pub const PARENT: Field = Field::nullable("parent", ValueKind::ObjectId);
pub const NODE_NAME: Field = Field::new("name", ValueKind::String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub name: String,
    pub parent: Option<ObjectId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeNodeCreate {
    pub name: String,
    pub parent: Option<ObjectId>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TreeNodeUpdate {
    pub name: Option<String>,
    pub parent: Option<ObjectId>,
}

/// Rules shared by every tree-shaped service.
pub fn register_tree_rules<S, D>(rules: &mut RuleSetBuilder<S, D>)
where
    S: ServiceSpec<Insert = TreeNodeCreate, Update = TreeNodeUpdate, Id = ObjectId>,
    D: Driver,
{
    rules
        .validator("parent_exists", ValidatorKind::InsertUpdate, |service, payload, _, session| {
            Box::pin(async move {
                let parent = match payload {
                    Payload::Insert(data) => data.parent,
                    Payload::Update(changes) => changes.parent,
                };
                if let Some(parent) = parent
                    && !service.exists(&parent, session).await?
                {
                    return Err(ServiceError::rejected(format!("parent {parent} does not exist")));
                }
                Ok(())
            })
        })
        .validator("not_own_parent", ValidatorKind::Update, |service, payload, filter, session| {
            Box::pin(async move {
                let (Payload::Update(changes), Some(filter)) = (payload, filter) else {
                    return Ok(());
                };
                let Some(parent) = changes.parent else {
                    return Ok(());
                };
                if service.find_ids(filter.clone(), session).await?.contains(&parent) {
                    return Err(ServiceError::rejected("a node cannot be its own parent"));
                }
                Ok(())
            })
        })
        .delete_rule("deny_root", DeletePhase::Deny, |service, session, ids| {
            Box::pin(async move {
                let roots = Filter::and([Field::ID.is_in(ids.to_vec())?, PARENT.eq(Bson::Null)?]);
                if service.count_documents(roots, Some(session)).await? > 0 {
                    return Err(ServiceError::rejected("root nodes cannot be deleted"));
                }
                Ok(())
            })
        })
        .delete_rule("delete_children", DeletePhase::Pre, |service, session, ids| {
            Box::pin(async move {
                service.delete_many(PARENT.is_in(ids.to_vec())?, Some(session)).await?;
                Ok(())
            })
        });
}

pub struct TreeNodeService;

impl ServiceSpec for TreeNodeService {
    type Insert = TreeNodeCreate;
    type Update = TreeNodeUpdate;
    type Model = TreeNode;
    type Id = ObjectId;

    const COLLECTION: &'static str = "tree_nodes";

    fn register_rules<D: Driver>(rules: &mut RuleSetBuilder<Self, D>) {
        register_tree_rules(rules);
    }
}

pub fn node(name: &str, parent: Option<ObjectId>) -> TreeNodeCreate {
    TreeNodeCreate { name: name.to_string(), parent }
}

// People: validated on insert and update, archived on delete.

pub const NAME: Field = Field::new("name", ValueKind::String);
pub const AGE: Field = Field::new("age", ValueKind::Number);
pub const NICKNAME: Field = Field::nullable("nickname", ValueKind::String);
pub const TAGS: Field = Field::new("tags", ValueKind::Array);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub name: String,
    pub age: i32,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PersonCreate {
    pub name: String,
    pub age: i32,
    pub nickname: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PersonUpdate {
    pub name: Option<String>,
    pub age: Option<i32>,
}

pub fn person(name: &str, age: i32) -> PersonCreate {
    PersonCreate { name: name.to_string(), age, nickname: None, tags: Vec::new() }
}

/// Rules shared by every person-like service.
pub fn register_person_rules<S, D>(rules: &mut RuleSetBuilder<S, D>)
where
    S: ServiceSpec<Insert = PersonCreate, Update = PersonUpdate>,
    D: Driver,
{
    rules
        .validator("name_not_blank", ValidatorKind::InsertUpdate, |_, payload, _, _| {
            Box::pin(async move {
                let name = match payload {
                    Payload::Insert(data) => Some(data.name.as_str()),
                    Payload::Update(changes) => changes.name.as_deref(),
                };
                match name {
                    Some(name) if name.trim().is_empty() => Err(ServiceError::rejected("name must not be blank")),
                    _ => Ok(()),
                }
            })
        })
        .validator("adult", ValidatorKind::Insert, |_, payload, _, _| {
            Box::pin(async move {
                match payload {
                    Payload::Insert(data) if data.age < 18 => Err(ServiceError::rejected("must be at least 18")),
                    _ => Ok(()),
                }
            })
        });
}

pub struct PersonService;

impl ServiceSpec for PersonService {
    type Insert = PersonCreate;
    type Update = PersonUpdate;
    type Model = Person;
    type Id = ObjectId;

    const COLLECTION: &'static str = "people";

    fn config() -> ServiceConfig {
        ServiceConfig::default().with_exclude_null_on_insert(true)
    }

    fn indexes() -> Vec<(&'static str, IndexSpec)> {
        vec![
            ("name_unique", IndexSpec::on(&NAME, SortDirection::Asc).with_unique(true)),
            ("age_desc", IndexSpec::on(&AGE, SortDirection::Desc)),
        ]
    }

    fn register_rules<D: Driver>(rules: &mut RuleSetBuilder<Self, D>) {
        register_person_rules(rules);
        rules
            .delete_rule("archive", DeletePhase::Pre, |service, session, ids| {
                Box::pin(async move {
                    let archive = service.database().service::<ArchiveService>();
                    for id in ids {
                        archive.insert_one(&ArchiveEntry { person: *id }, Some(&mut *session)).await?;
                    }
                    Ok(())
                })
            })
            .delete_rule("not_locked", DeletePhase::Pre, |service, session, ids| {
                Box::pin(async move {
                    let locked = Filter::and([Field::ID.is_in(ids.to_vec())?, NAME.eq("locked")?]);
                    if service.count_documents(locked, Some(session)).await? > 0 {
                        return Err(ServiceError::rejected("locked people cannot be deleted"));
                    }
                    Ok(())
                })
            })
            .delete_rule("gone", DeletePhase::Post, |service, session, ids| {
                Box::pin(async move {
                    let left = service.count_documents(Field::ID.is_in(ids.to_vec())?, Some(session)).await?;
                    if left > 0 {
                        return Err(ServiceError::rejected(format!("{left} people survived their deletion")));
                    }
                    Ok(())
                })
            });
    }
}

/// Same people, stricter age limit.
pub struct StrictPersonService;

impl ServiceSpec for StrictPersonService {
    type Insert = PersonCreate;
    type Update = PersonUpdate;
    type Model = Person;
    type Id = ObjectId;

    const COLLECTION: &'static str = "strict_people";

    fn register_rules<D: Driver>(rules: &mut RuleSetBuilder<Self, D>) {
        register_person_rules(rules);
        rules.validator("adult", ValidatorKind::Insert, |_, payload, _, _| {
            Box::pin(async move {
                match payload {
                    Payload::Insert(data) if data.age < 21 => Err(ServiceError::rejected("must be at least 21")),
                    _ => Ok(()),
                }
            })
        });
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub person: ObjectId,
}

pub struct ArchiveService;

impl ServiceSpec for ArchiveService {
    type Insert = ArchiveEntry;
    type Update = Document;
    type Model = ArchiveEntry;
    type Id = ObjectId;

    const COLLECTION: &'static str = "archive";
}
