//! Local edits travelling from notification to the sink

use tidemark_core::domain::{ChangeId, ChangeKind};

use crate::common::{path, Pipeline};

#[tokio::test]
async fn test_new_folder_and_file_dispatch_as_one_tree() {
    let mut pipeline = Pipeline::with_tree(&[], &[]).await;
    std::fs::create_dir(pipeline.abs("docs")).unwrap();
    std::fs::write(pipeline.abs("docs/notes.txt"), b"hello").unwrap();
    pipeline.notify(ChangeKind::Created, "docs").await;
    pipeline.notify(ChangeKind::Created, "docs/notes.txt").await;

    let units = pipeline.flush().await;
    assert_eq!(units.len(), 1);
    let order: Vec<_> = units[0]
        .execution_order()
        .iter()
        .map(|c| c.path.clone())
        .collect();
    assert_eq!(order, vec![path("docs"), path("docs/notes.txt")]);

    let root = units[0].change.id;
    assert!(pipeline.log.contains(root).await);
    assert!(pipeline.engine.report_completed(root).await);
    assert!(pipeline.log.entries().await.is_empty());
}

#[tokio::test]
async fn test_delete_and_create_pair_becomes_rename() {
    let mut pipeline = Pipeline::with_tree(&[], &[("a.txt", b"content")]).await;
    std::fs::rename(pipeline.abs("a.txt"), pipeline.abs("b.txt")).unwrap();
    pipeline.notify(ChangeKind::Deleted, "a.txt").await;
    pipeline.notify(ChangeKind::Created, "b.txt").await;

    let units = pipeline.flush().await;
    assert_eq!(units.len(), 1);
    let change = &units[0].change;
    assert_eq!(change.kind, ChangeKind::Renamed);
    assert_eq!(change.old_path, Some(path("a.txt")));
    assert_eq!(change.path, path("b.txt"));
}

#[tokio::test]
async fn test_short_lived_file_never_dispatches() {
    let mut pipeline = Pipeline::with_tree(&[], &[]).await;
    std::fs::write(pipeline.abs("scratch.tmp"), b"x").unwrap();
    pipeline.notify(ChangeKind::Created, "scratch.tmp").await;
    std::fs::remove_file(pipeline.abs("scratch.tmp")).unwrap();
    pipeline.notify(ChangeKind::Deleted, "scratch.tmp").await;

    assert!(pipeline.flush().await.is_empty());
    assert!(pipeline.log.entries().await.is_empty());
}

#[tokio::test]
async fn test_modification_storm_dispatches_once() {
    let mut pipeline = Pipeline::with_tree(&[], &[("x.txt", b"v1")]).await;
    std::fs::write(pipeline.abs("x.txt"), b"version two").unwrap();
    for _ in 0..600 {
        pipeline.notify(ChangeKind::Modified, "x.txt").await;
    }

    let units = pipeline.flush().await;
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].change.kind, ChangeKind::Modified);
    assert_eq!(units[0].change.metadata.size, Some(11));
}

#[tokio::test]
async fn test_failed_unit_is_dispatched_again() {
    let mut pipeline = Pipeline::with_tree(&[], &[]).await;
    std::fs::write(pipeline.abs("a.txt"), b"a").unwrap();
    pipeline.notify(ChangeKind::Created, "a.txt").await;
    let first = pipeline.flush().await;
    let id = first[0].change.id;

    assert!(pipeline.engine.report_failed(id, "upload rejected").await);
    let retried = pipeline.flush().await;
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].change.id, id);
    assert_eq!(pipeline.log.entries().await.len(), 1);
    assert!(!pipeline.engine.report_failed(ChangeId::new(999), "unknown").await);
}
