//! Dedup index contract scenarios: post/repost counters, round-trip
//! retrieval, aging, and the biased-name collision flood.

use quarry::{OpenMode, RequestKind, Status};
use quarry_index::name::RecordName;

use crate::helpers::{
    biased_geometry, memory_device, meta_of, name_of, open_session, tiny_geometry,
};

#[tokio::test]
async fn post_101_then_repost_53() {
    let geometry = tiny_geometry();
    let device = memory_device(&geometry);
    let session = open_session(geometry, device, OpenMode::Create).await;

    for i in 0..101 {
        let response = session.execute(RequestKind::Post, name_of(i), meta_of(i)).await;
        assert_eq!(response.status, Status::Success);
        assert!(!response.found, "post {i} must be new");
    }
    for i in 0..53 {
        let response = session.execute(RequestKind::Post, name_of(i), meta_of(i)).await;
        assert!(response.found, "repost {i} must dedupe");
        assert_eq!(response.old_metadata, Some(meta_of(i)));
    }

    let stats = session.stats();
    assert_eq!(stats.posts_not_found, 101);
    assert_eq!(stats.posts_found, 53);
    assert_eq!(stats.entries_indexed, 101);
    session.close(false).await.unwrap();
}

#[tokio::test]
async fn round_trip_below_volume_capacity() {
    let geometry = tiny_geometry();
    let capacity = geometry.records_per_volume() as u32;
    let device = memory_device(&geometry);
    let session = open_session(geometry, device, OpenMode::Create).await;

    // Stay below one full volume so nothing ages out.
    let count = capacity - geometry_margin(capacity);
    for i in 0..count {
        session.execute(RequestKind::Post, name_of(i), meta_of(i)).await;
    }
    for i in 0..count {
        let response = session
            .execute(RequestKind::QueryNoUpdate, name_of(i), [0u8; 16])
            .await;
        assert!(response.found, "record {i}");
        assert_eq!(response.old_metadata, Some(meta_of(i)));
    }
    session.close(false).await.unwrap();
}

fn geometry_margin(capacity: u32) -> u32 {
    capacity / 8
}

#[tokio::test]
async fn aging_keeps_exactly_the_recent_window() {
    let geometry = tiny_geometry();
    let per_chapter = geometry.records_per_chapter();
    let window = geometry.records_per_volume() as u32;
    let device = memory_device(&geometry);
    let session = open_session(geometry, device, OpenMode::Create).await;

    // Three chapters beyond a full volume.
    let total = window + 3 * per_chapter;
    for i in 0..total {
        session.execute(RequestKind::Post, name_of(i), meta_of(i)).await;
    }

    // Everything older than the retained window is gone; the retained
    // closed chapters and the open chapter answer.
    let oldest_retained = total - window + per_chapter;
    for i in (0..total).step_by(per_chapter as usize / 2) {
        let response = session
            .execute(RequestKind::QueryNoUpdate, name_of(i), [0u8; 16])
            .await;
        if i < total - window {
            assert!(!response.found, "record {i} must have aged out");
        } else if i >= oldest_retained {
            assert!(response.found, "record {i} must be retained");
        }
    }
    session.close(false).await.unwrap();
}

#[tokio::test]
async fn biased_names_collide_without_failure() {
    let geometry = biased_geometry();
    let device = memory_device(&geometry);
    let session = open_session(geometry, device, OpenMode::Create).await;

    // Names whose volume-index bytes are all zero: every one lands on
    // the same delta list at the same address, entering as full-name
    // collision entries. The flood count is scaled to the miniature
    // geometry's whole-volume entry budget.
    let names: Vec<RecordName> = (0..2000u32)
        .map(|i| {
            let mut bytes = [0u8; 16];
            bytes[8..12].copy_from_slice(&i.to_le_bytes());
            RecordName(bytes)
        })
        .collect();

    for (i, name) in names.iter().enumerate() {
        let response = session
            .execute(RequestKind::Post, *name, meta_of(i as u32))
            .await;
        assert_eq!(response.status, Status::Success);
    }
    for (i, name) in names.iter().enumerate() {
        let response = session
            .execute(RequestKind::QueryNoUpdate, *name, [0u8; 16])
            .await;
        assert!(response.found, "biased record {i} must be queryable");
        assert_eq!(response.old_metadata, Some(meta_of(i as u32)));
    }
    session.close(false).await.unwrap();
}
