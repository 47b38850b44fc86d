mod common;

use common::{scope_factory, MemoryStore, RecordSession};
use dbscope::prelude::*;

#[tokio::test]
async fn parallel_branches_never_share_a_session() {
    let store = MemoryStore::new();
    let factory = scope_factory(&store);

    flow(async {
        let mut outer = factory.create(JoinPolicy::JoinExisting).unwrap();
        let outer_users = outer.injected_handle::<RecordSession>().unwrap();
        let outer_instance = outer_users.with(|s| s.instance).unwrap();

        let mut guard = factory.suppress_ambient();

        let mut branches = Vec::new();
        for i in 0..4u32 {
            let branch_factory = factory.clone();
            branches.push(tokio::spawn(flow(async move {
                let mut scope = branch_factory.create(JoinPolicy::JoinExisting).unwrap();
                // No ambient scope leaked into this branch.
                assert!(!scope.is_nested());

                let users = scope.injected_handle::<RecordSession>().unwrap();
                let instance = users.with(|s| s.instance).unwrap();
                users
                    .with(|s| s.add(&format!("user:{i}"), &format!("Branch {i}")))
                    .unwrap();
                scope.complete().unwrap();
                instance
            })));
        }

        let mut instances = Vec::new();
        for branch in branches {
            instances.push(branch.await.unwrap());
        }

        // Every branch worked on its own session instance.
        instances.sort_unstable();
        let mut deduped = instances.clone();
        deduped.dedup();
        assert_eq!(instances.len(), deduped.len());
        assert!(!instances.contains(&outer_instance));

        guard.release();

        // The outer scope is ambient again and completes normally.
        outer_users.with(|s| s.add("user:outer", "Outer")).unwrap();
        outer.complete().unwrap();
    })
    .await;

    for i in 0..4u32 {
        assert!(store.contains(&format!("user:{i}")));
    }
    assert!(store.contains("user:outer"));
}

#[tokio::test]
async fn spawned_branch_sees_no_ambient_scope() {
    let store = MemoryStore::new();
    let factory = scope_factory(&store);
    let locator = AmbientHandleLocator::new();

    flow(async {
        let scope = factory.create(JoinPolicy::ForceNew).unwrap();
        let _guard = factory.suppress_ambient();

        let observed = tokio::spawn(flow(async move {
            AmbientHandleLocator::new()
                .handle::<RecordSession>()
                .is_ok()
        }))
        .await
        .unwrap();
        assert!(!observed);

        drop(_guard);
        assert!(locator.handle::<RecordSession>().is_ok());
        drop(scope);
    })
    .await;
}

#[tokio::test]
async fn suppressing_an_empty_flow_is_harmless() {
    flow(async {
        let factory = DbScopeFactory::new();
        let mut guard = factory.suppress_ambient();
        guard.release();
        guard.release();
    })
    .await;
}

#[tokio::test]
async fn guard_restores_on_drop_mid_flow() {
    let store = MemoryStore::new();
    let factory = scope_factory(&store);

    flow(async {
        let mut scope = factory.create(JoinPolicy::JoinExisting).unwrap();
        {
            let _guard = factory.suppress_ambient();
            let standalone = factory.create(JoinPolicy::JoinExisting).unwrap();
            assert!(!standalone.is_nested());
            drop(standalone);
        }

        // Back under the original scope: joins nest again.
        let nested = factory.create(JoinPolicy::JoinExisting).unwrap();
        assert!(nested.is_nested());
        drop(nested);

        scope.complete().unwrap();
    })
    .await;
}
