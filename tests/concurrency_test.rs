use std::collections::BTreeSet;
use std::sync::Arc;

use flagvault_lib::{
    Action, Caller, FlagService, FlagStore, FlagType, MemoryStore, NewFlag, RevisionId,
    SledStore, TransitionPolicy,
};

fn caller() -> Caller {
    Caller::new(
        uuid::Uuid::from_u128(11).into(),
        uuid::Uuid::from_u128(22).into(),
    )
}

fn new_flag() -> NewFlag {
    NewFlag {
        name: "pricing-page".to_string(),
        flag_type: FlagType::Number,
        default_value: "10".to_string(),
        rules: vec![],
        environment: "production".to_string(),
        project: None,
        tags: vec![],
    }
}

/// Race one approve per draft and check that every accepted write is
/// accounted for exactly once.
async fn racing_approvals<S: FlagStore + 'static>(store: S) {
    let service = Arc::new(FlagService::new(Arc::new(store), TransitionPolicy::Strict));
    let mut flag = service.create_flag(caller(), &new_flag()).await.unwrap();

    let mut drafts: Vec<RevisionId> = Vec::new();
    for value in 1..=8 {
        flag = service
            .propose(caller(), flag.id, &value.to_string(), vec![])
            .await
            .unwrap();
        drafts.push(flag.revisions.iter().last().unwrap().id);
    }

    let mut handles = Vec::new();
    for draft in drafts {
        let service = service.clone();
        let id = flag.id;
        handles.push(tokio::spawn(async move {
            service.approve(caller(), id, draft).await
        }));
    }

    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(e) => assert!(e.is_conflict(), "unexpected error: {}", e),
        }
    }
    assert!(accepted >= 1);

    let stored = service.get(caller(), flag.id).await.unwrap();
    assert_eq!(stored.version, 1 + accepted as i64);
    assert_eq!(stored.revisions.live_count(), 1);

    let approvals = service
        .timeline(caller(), flag.id)
        .await
        .unwrap()
        .entries
        .iter()
        .filter(|e| e.action == Action::RevisionApproved)
        .count();
    assert_eq!(approvals, accepted);
}

/// Race tag merges. Organization tags must match exactly the tags that made it
/// onto the flag; a rejected merge leaves no trace anywhere.
async fn racing_tag_merges<S: FlagStore + 'static>(store: S) {
    let service = Arc::new(FlagService::new(Arc::new(store), TransitionPolicy::Strict));
    let flag = service.create_flag(caller(), &new_flag()).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..32 {
        let service = service.clone();
        let id = flag.id;
        handles.push(tokio::spawn(async move {
            service.patch_tags(caller(), id, &[format!("t{}", i)]).await
        }));
    }

    let mut accepted = BTreeSet::new();
    for (i, handle) in handles.into_iter().enumerate() {
        match handle.await.unwrap() {
            Ok(_) => {
                accepted.insert(format!("t{}", i));
            }
            Err(e) => assert!(e.is_conflict(), "unexpected error: {}", e),
        }
    }
    assert!(!accepted.is_empty());

    let stored = service.get(caller(), flag.id).await.unwrap();
    assert_eq!(stored.tags, accepted);
    assert_eq!(service.org_tags(caller()).await.unwrap(), accepted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_store_racing_tag_merges() {
    racing_tag_merges(MemoryStore::new()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sled_store_racing_tag_merges() {
    racing_tag_merges(SledStore::temporary().unwrap()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_store_racing_approvals() {
    racing_approvals(MemoryStore::new()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sled_store_racing_approvals() {
    racing_approvals(SledStore::temporary().unwrap()).await;
}
