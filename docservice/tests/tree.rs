mod common;

use docservice::prelude::*;

use common::{
    NODE_NAME, PARENT, TreeNode, TreeNodeCreate, TreeNodeService, TreeNodeUpdate, database, node,
    register_tree_rules,
};

/// The tree rules plus two rules that fail late, after the children are already gone.
struct FragileTreeService;

impl ServiceSpec for FragileTreeService {
    type Insert = TreeNodeCreate;
    type Update = TreeNodeUpdate;
    type Model = TreeNode;
    type Id = ObjectId;

    const COLLECTION: &'static str = "tree_nodes";

    fn register_rules<D: Driver>(rules: &mut RuleSetBuilder<Self, D>) {
        register_tree_rules(rules);
        rules
            .delete_rule("refuse_marked", DeletePhase::Pre, |service, session, ids| {
                Box::pin(async move {
                    let marked = Filter::and([Field::ID.is_in(ids.to_vec())?, NODE_NAME.eq("marked")?]);
                    if service.count_documents(marked, Some(&mut *session)).await? == 0 {
                        return Ok(());
                    }
                    let children = service.count_documents(PARENT.is_in(ids.to_vec())?, Some(session)).await?;
                    Err(ServiceError::rejected(format!("marked node refused with {children} children left")))
                })
            })
            .delete_rule("keep_sealed", DeletePhase::Post, |service, session, _| {
                Box::pin(async move {
                    if service.count_documents(NODE_NAME.eq("sealed")?, Some(session)).await? == 0 {
                        return Err(ServiceError::rejected("sealed nodes must survive"));
                    }
                    Ok(())
                })
            });
    }
}

#[tokio::test]
async fn deleting_a_node_deletes_its_subtree() {
    let database = database();
    let nodes = database.service::<TreeNodeService>();

    let root = nodes.insert_one(&node("root", None), None).await.unwrap();
    let a = nodes.insert_one(&node("a", Some(root)), None).await.unwrap();
    let b = nodes.insert_one(&node("b", Some(a)), None).await.unwrap();
    nodes.insert_one(&node("c", Some(b)), None).await.unwrap();
    let sibling = nodes.insert_one(&node("sibling", Some(root)), None).await.unwrap();

    let outcome = nodes.delete_by_id(&a, None).await.unwrap();

    assert_eq!(outcome.deleted_count, 1);
    let remaining = nodes.find_ids(Filter::everything(), None).await.unwrap();
    assert_eq!(remaining, vec![root, sibling]);
}

#[tokio::test]
async fn roots_cannot_be_deleted() {
    let database = database();
    let nodes = database.service::<TreeNodeService>();

    let root = nodes.insert_one(&node("root", None), None).await.unwrap();
    nodes.insert_one(&node("child", Some(root)), None).await.unwrap();

    let error = nodes.delete_by_id(&root, None).await.unwrap_err();

    match &error {
        ServiceError::DeleteDenied { rule, source } => {
            assert_eq!(rule, "TreeNodeService.deny_root");
            assert!(matches!(**source, ServiceError::Rejected(_)));
        },
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(nodes.count_documents(Filter::everything(), None).await.unwrap(), 2);
    assert_eq!(database.driver().committed_transactions(), 0);
}

#[tokio::test]
async fn a_denied_child_denies_the_whole_cascade() {
    let database = database();
    let nodes = database.service::<TreeNodeService>();

    let root = nodes.insert_one(&node("root", None), None).await.unwrap();
    nodes.insert_one(&node("child", Some(root)), None).await.unwrap();
    nodes.insert_one(&node("other root", None), None).await.unwrap();

    let error = nodes.delete_many(Filter::everything(), None).await.unwrap_err();

    assert!(matches!(error, ServiceError::DeleteDenied { .. }));
    assert_eq!(nodes.count_documents(Filter::everything(), None).await.unwrap(), 3);
}

#[tokio::test]
async fn parents_must_exist() {
    let database = database();
    let nodes = database.service::<TreeNodeService>();

    let error = nodes
        .insert_one(&node("orphan", Some(ObjectId::new())), None)
        .await
        .unwrap_err();

    match error {
        ServiceError::ValidationFailed { rule, .. } => assert_eq!(rule, "TreeNodeService.parent_exists"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(nodes.count_documents(Filter::everything(), None).await.unwrap(), 0);
}

#[tokio::test]
async fn a_node_cannot_become_its_own_parent() {
    let database = database();
    let nodes = database.service::<TreeNodeService>();

    let root = nodes.insert_one(&node("root", None), None).await.unwrap();
    let a = nodes.insert_one(&node("a", Some(root)), None).await.unwrap();

    let changes = TreeNodeUpdate { parent: Some(a), ..Default::default() };
    let error = nodes.update(&a, &changes, None).await.unwrap_err();

    match error {
        ServiceError::ValidationFailed { rule, source } => {
            assert_eq!(rule, "TreeNodeService.not_own_parent");
            assert_eq!(source.to_string(), "a node cannot be its own parent");
        },
        other => panic!("unexpected error: {other:?}"),
    }

    let renamed = nodes
        .update(&a, &TreeNodeUpdate { name: Some("renamed".into()), ..Default::default() }, None)
        .await
        .unwrap();
    assert_eq!(renamed.name, "renamed");
    assert_eq!(renamed.parent, Some(root));
}

#[tokio::test]
async fn moving_a_node_keeps_its_children() {
    let database = database();
    let nodes = database.service::<TreeNodeService>();

    let root = nodes.insert_one(&node("root", None), None).await.unwrap();
    let a = nodes.insert_one(&node("a", Some(root)), None).await.unwrap();
    let b = nodes.insert_one(&node("b", Some(root)), None).await.unwrap();
    nodes.insert_one(&node("a1", Some(a)), None).await.unwrap();

    nodes
        .update(&a, &TreeNodeUpdate { parent: Some(b), ..Default::default() }, None)
        .await
        .unwrap();
    nodes.delete_by_id(&b, None).await.unwrap();

    let remaining = nodes.find(PARENT.eq(Bson::Null).unwrap(), None).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(nodes.count_documents(Filter::everything(), None).await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_cascades_both_complete() {
    let database = database();
    let nodes = database.service::<TreeNodeService>();

    let root = nodes.insert_one(&node("root", None), None).await.unwrap();
    let mut branches = Vec::new();
    for name in ["left", "right"] {
        let branch = nodes.insert_one(&node(name, Some(root)), None).await.unwrap();
        for leaf in 0..5 {
            nodes
                .insert_one(&node(&format!("{name}-{leaf}"), Some(branch)), None)
                .await
                .unwrap();
        }
        branches.push(branch);
    }

    let (left, right) = tokio::join!(
        nodes.delete_by_id(&branches[0], None),
        nodes.delete_by_id(&branches[1], None),
    );

    left.unwrap();
    right.unwrap();
    assert_eq!(nodes.find_ids(Filter::everything(), None).await.unwrap(), vec![root]);
}

#[tokio::test]
async fn a_later_failure_restores_a_cascaded_subtree() {
    let database = database();
    let nodes = database.service::<TreeNodeService>();

    let root = nodes.insert_one(&node("root", None), None).await.unwrap();
    let a = nodes.insert_one(&node("a", Some(root)), None).await.unwrap();
    nodes.insert_one(&node("b", Some(a)), None).await.unwrap();

    let result = database
        .transactions(RetryConfig::no_retry())
        .run(None, |session| {
            let nodes = nodes.clone();
            Box::pin(async move {
                nodes.delete_by_id(&a, Some(&mut *session)).await?;
                assert_eq!(nodes.count_documents(Filter::everything(), Some(&mut *session)).await?, 1);
                Err::<(), _>(ServiceError::rejected("abandon"))
            })
        })
        .await;

    assert!(result.is_err());
    assert_eq!(nodes.count_documents(Filter::everything(), None).await.unwrap(), 3);
}

#[tokio::test]
async fn cascades_over_a_cycle_are_bounded() {
    let database = database();
    let nodes = database.service::<TreeNodeService>();

    let root = nodes.insert_one(&node("root", None), None).await.unwrap();
    let a = nodes.insert_one(&node("a", Some(root)), None).await.unwrap();
    let b = nodes.insert_one(&node("b", Some(a)), None).await.unwrap();
    nodes
        .update(&a, &TreeNodeUpdate { parent: Some(b), ..Default::default() }, None)
        .await
        .unwrap();

    let error = nodes.delete_by_id(&a, None).await.unwrap_err();

    match error.root_cause() {
        ServiceError::CascadeTooDeep { collection, depth } => {
            assert_eq!(collection, "tree_nodes");
            assert_eq!(*depth, ServiceConfig::default().max_cascade_depth);
        },
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(matches!(error, ServiceError::DeleteRuleFailed { ref rule, .. } if rule == "TreeNodeService.delete_children"));
    assert_eq!(nodes.count_documents(Filter::everything(), None).await.unwrap(), 3);
    assert_eq!(nodes.get_by_id(&a, None).await.unwrap().unwrap().parent, Some(b));
    assert_eq!(database.driver().committed_transactions(), 0);
}

#[tokio::test]
async fn cascade_depth_is_configurable() {
    let database = database();
    let nodes = database.service::<TreeNodeService>();

    let root = nodes.insert_one(&node("root", None), None).await.unwrap();
    let a = nodes.insert_one(&node("a", Some(root)), None).await.unwrap();
    let b = nodes.insert_one(&node("b", Some(a)), None).await.unwrap();
    let c = nodes.insert_one(&node("c", Some(b)), None).await.unwrap();

    let shallow = nodes.clone().with_config(ServiceConfig::default().with_max_cascade_depth(1));
    let error = shallow.delete_by_id(&a, None).await.unwrap_err();
    assert!(matches!(error.root_cause(), ServiceError::CascadeTooDeep { depth: 1, .. }));
    assert_eq!(nodes.count_documents(Filter::everything(), None).await.unwrap(), 4);

    // a leaf cascades into nothing
    shallow.delete_by_id(&c, None).await.unwrap();

    let deeper = nodes.with_config(ServiceConfig::default().with_max_cascade_depth(2));
    deeper.delete_by_id(&a, None).await.unwrap();
    assert_eq!(deeper.find_ids(Filter::everything(), None).await.unwrap(), vec![root]);
}

#[tokio::test]
async fn a_failing_pre_rule_after_the_cascade_restores_parent_and_children() {
    let database = database();
    let nodes = database.service::<FragileTreeService>();

    let root = nodes.insert_one(&node("root", None), None).await.unwrap();
    let marked = nodes.insert_one(&node("marked", Some(root)), None).await.unwrap();
    let child = nodes.insert_one(&node("child", Some(marked)), None).await.unwrap();
    nodes.insert_one(&node("grandchild", Some(child)), None).await.unwrap();
    nodes.insert_one(&node("sealed", Some(root)), None).await.unwrap();

    let error = nodes.delete_by_id(&marked, None).await.unwrap_err();

    match &error {
        ServiceError::DeleteRuleFailed { rule, source } => {
            assert_eq!(rule, "FragileTreeService.refuse_marked");
            // delete_children ran first and had removed the whole subtree
            assert_eq!(source.to_string(), "marked node refused with 0 children left");
        },
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(nodes.count_documents(Filter::everything(), None).await.unwrap(), 5);
    assert!(nodes.exists(&child, None).await.unwrap());
    assert_eq!(database.driver().aborted_transactions(), 1);
}

#[tokio::test]
async fn a_failing_post_rule_restores_the_deleted_subtree() {
    let database = database();
    let nodes = database.service::<FragileTreeService>();

    let root = nodes.insert_one(&node("root", None), None).await.unwrap();
    let a = nodes.insert_one(&node("a", Some(root)), None).await.unwrap();
    nodes.insert_one(&node("sealed", Some(a)), None).await.unwrap();
    nodes.insert_one(&node("other", Some(a)), None).await.unwrap();

    let error = nodes.delete_by_id(&a, None).await.unwrap_err();

    assert!(matches!(error, ServiceError::DeleteRuleFailed { .. }));
    assert_eq!(error.root_cause().to_string(), "sealed nodes must survive");
    assert_eq!(nodes.count_documents(Filter::everything(), None).await.unwrap(), 4);
    assert_eq!(nodes.count_documents(NODE_NAME.eq("sealed").unwrap(), None).await.unwrap(), 1);
    assert_eq!(database.driver().committed_transactions(), 0);
}
