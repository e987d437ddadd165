//! LVM conversion scenarios: moving the index past LVM headroom and
//! continuing to fill, save, and reload the reduced volume.

use quarry::{IndexSession, OpenMode, RequestKind, SessionParams};

use crate::helpers::{memory_device, meta_of, name_of, tiny_geometry};

#[tokio::test]
async fn convert_then_verify_and_wrap() {
    let geometry = tiny_geometry();
    let per_chapter = geometry.records_per_chapter();
    let device = memory_device(&geometry);

    // Fill chapters_per_volume - 2 chapters, then save cleanly.
    let filled_chapters = geometry.chapters_per_volume - 2;
    {
        let mut params = SessionParams::new(geometry.clone(), 0xc0de);
        params.zone_count = 2;
        let session = IndexSession::open(params, device.clone() as _, OpenMode::Create)
            .await
            .unwrap();
        for i in 0..filled_chapters * per_chapter {
            session.execute(RequestKind::Post, name_of(i), meta_of(i)).await;
        }
        session.close(true).await.unwrap();
    }

    // Convert: the index moves past the headroom and loses one chapter
    // of capacity.
    let headroom = 4 * geometry.bytes_per_page as u64;
    let offset = IndexSession::convert_to_lvm(device.clone() as _, 0, headroom)
        .await
        .unwrap();
    assert!(offset >= headroom);

    let mut reduced = geometry.clone();
    reduced.chapters_per_volume -= 1;

    // Reopen at the new offset; every filled record is still live.
    {
        let mut params = SessionParams::new(reduced.clone(), 0xc0de);
        params.zone_count = 2;
        params.offset_bytes = offset;
        let session = IndexSession::open(params, device.clone() as _, OpenMode::Load)
            .await
            .unwrap();
        for i in 0..filled_chapters * per_chapter {
            let response = session
                .execute(RequestKind::QueryNoUpdate, name_of(i), [0u8; 16])
                .await;
            assert!(response.found, "record {i} must survive conversion");
        }
        session.close(true).await.unwrap();
    }

    // Keep filling one chapter at a time with a save/reload between
    // each, checking the aged-out and retained sets as the reduced ring
    // wraps.
    let mut next_name = filled_chapters * per_chapter;
    let mut chapters_written = u64::from(filled_chapters);
    for round in 0..geometry.chapters_per_volume - 3 {
        let mut params = SessionParams::new(reduced.clone(), 0xc0de);
        params.zone_count = 2;
        params.offset_bytes = offset;
        let session = IndexSession::open(params, device.clone() as _, OpenMode::Load)
            .await
            .unwrap();

        for _ in 0..per_chapter {
            session
                .execute(RequestKind::Post, name_of(next_name), meta_of(next_name))
                .await;
            next_name += 1;
        }
        chapters_written += 1;

        // Spot-check one name per written chapter.
        let window = u64::from(reduced.chapters_per_volume);
        for chapter in 0..chapters_written {
            let first_in_chapter = u32::try_from(chapter).unwrap() * per_chapter;
            let response = session
                .execute(RequestKind::QueryNoUpdate, name_of(first_in_chapter), [0u8; 16])
                .await;
            let retained = chapter + window > chapters_written;
            assert_eq!(
                response.found, retained,
                "round {round}: chapter {chapter} retained={retained}"
            );
        }
        session.close(true).await.unwrap();
    }
}
