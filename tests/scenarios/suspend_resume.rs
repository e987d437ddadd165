//! Suspend/restore scenarios on file-backed devices, including resuming
//! on a byte-copied second device.

use std::sync::Arc;

use quarry::{FileDevice, IndexSession, OpenMode, RequestKind, SessionParams};

use crate::helpers::{meta_of, name_of, tiny_geometry};

async fn file_session(
    dir: &std::path::Path,
    file: &str,
    mode: OpenMode,
) -> (IndexSession, std::path::PathBuf) {
    let geometry = tiny_geometry();
    let path = dir.join(file);
    let device = Arc::new(
        FileDevice::open(&path, geometry.bytes_per_page)
            .await
            .expect("device opens"),
    );
    let mut params = SessionParams::new(geometry, 0x7e57);
    params.zone_count = 2;
    let session = IndexSession::open(params, device as _, mode)
        .await
        .expect("session opens");
    (session, path)
}

#[tokio::test]
async fn suspend_with_save_then_resume_on_copied_device() {
    let geometry = tiny_geometry();
    let dir = tempfile::tempdir().unwrap();
    let (session, path) = file_session(dir.path(), "first", OpenMode::Create).await;

    // Two and a half chapters of names.
    let total = geometry.records_per_chapter() * 5 / 2;
    for i in 0..total {
        session.execute(RequestKind::Post, name_of(i), meta_of(i)).await;
    }
    session.suspend(true).await.unwrap();

    // Byte-copy the device, then resume on the copy.
    let copy_path = dir.path().join("second");
    std::fs::copy(&path, &copy_path).unwrap();
    let copy = Arc::new(
        FileDevice::open(&copy_path, geometry.bytes_per_page)
            .await
            .unwrap(),
    );
    session.resume(Some(copy as _)).await.unwrap();

    for i in 0..total {
        let response = session.execute(RequestKind::Post, name_of(i), meta_of(i)).await;
        assert!(response.found, "repost {i} must dedupe on the copy");
    }
    assert_eq!(session.stats().posts_found, u64::from(total));
    session.close(false).await.unwrap();
}

#[tokio::test]
async fn unsaved_copy_loads_by_replay() {
    let geometry = tiny_geometry();
    let dir = tempfile::tempdir().unwrap();
    let (session, path) = file_session(dir.path(), "first", OpenMode::Create).await;

    // Exactly two chapters, so everything lands on disk; then shut down
    // without saving.
    let total = geometry.records_per_chapter() * 2;
    for i in 0..total {
        session.execute(RequestKind::Post, name_of(i), meta_of(i)).await;
    }
    session.close(false).await.unwrap();

    // The copy must come up via chapter replay.
    let copy_path = dir.path().join("second");
    std::fs::copy(&path, &copy_path).unwrap();
    let (session, _) = file_session(dir.path(), "second", OpenMode::Load).await;
    for i in 0..total {
        let response = session.execute(RequestKind::Post, name_of(i), meta_of(i)).await;
        assert!(response.found, "record {i} must be rebuilt from chapters");
    }
    session.close(false).await.unwrap();
}
