//! Server changes applied to the disk without echoing back

use chrono::{TimeZone, Utc};
use tidemark_core::domain::{ChangeKind, EntryMetadata, RemoteChange};
use tidemark_core::ports::{ITransferHandle, TransferDirection, TransferTarget};

use crate::common::{path, Pipeline};

fn folder() -> EntryMetadata {
    let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    EntryMetadata::folder(t, t)
}

#[tokio::test]
async fn test_applied_folder_does_not_echo() {
    let mut pipeline = Pipeline::with_tree(&[], &[]).await;
    pipeline
        .engine
        .apply_remote(&RemoteChange::created(path("shared/photos"), folder()))
        .await
        .unwrap();
    assert!(pipeline.abs("shared/photos").is_dir());

    // The watcher reports the applier's own mkdirs
    pipeline.notify(ChangeKind::Created, "shared").await;
    pipeline.notify(ChangeKind::Created, "shared/photos").await;
    assert!(pipeline.flush().await.is_empty());
}

#[tokio::test]
async fn test_remote_rename_twice_is_harmless() {
    let mut pipeline = Pipeline::with_tree(&["old"], &[("old/a.txt", b"a")]).await;
    let rename = RemoteChange::renamed(path("old"), path("new"), folder());

    pipeline.engine.apply_remote(&rename).await.unwrap();
    pipeline.engine.apply_remote(&rename).await.unwrap();
    assert!(pipeline.abs("new/a.txt").is_file());

    pipeline.notify(ChangeKind::Deleted, "old").await;
    pipeline.notify(ChangeKind::Created, "new").await;
    assert!(pipeline.flush().await.is_empty());
}

#[tokio::test]
async fn test_remote_delete_cancels_download_below() {
    let pipeline = Pipeline::with_tree(&["d"], &[("d/e.txt", b"partial")]).await;
    let download = pipeline
        .transfers
        .register(TransferDirection::Download, path("d/e.txt"));

    pipeline
        .engine
        .apply_remote(&RemoteChange::deleted(path("d"), folder()))
        .await
        .unwrap();

    assert!(!pipeline.abs("d").exists());
    assert_eq!(download.target(), TransferTarget::Cancelled);
    assert_eq!(download.checkpoint().await, None);
}
