//! Chapter-index packing scenarios: every record routes to its record
//! page through the packed pages, and an empty chapter packs into
//! consistent, empty pages.

use quarry_index::chapter_index::{ChapterIndexPage, OpenChapterIndex};
use quarry_index::open_chapter::OpenChapter;

use crate::helpers::{meta_of, name_of, tiny_geometry};

#[test]
fn packed_pages_route_every_record() {
    let geometry = tiny_geometry();
    let mut chapter = OpenChapter::new(&geometry);
    for i in 0..geometry.records_per_chapter() {
        chapter.put(name_of(i), meta_of(i));
    }
    let closed = chapter.close(&geometry);

    let mut index = OpenChapterIndex::new(&geometry, 11);
    for (i, (name, _)) in closed.records.iter().enumerate() {
        index.put(name, closed.page_of[i]).expect("tiny chapter fits");
    }
    let pages: Vec<ChapterIndexPage> = index
        .pack()
        .unwrap()
        .iter()
        .map(|bytes| ChapterIndexPage::parse(bytes, &geometry).unwrap())
        .collect();

    assert_eq!(pages.len(), geometry.index_pages_per_chapter as usize);
    let list_total: u32 = pages.iter().map(|p| p.list_count).sum();
    assert_eq!(list_total, geometry.delta_lists_per_chapter);

    for (i, (name, _)) in closed.records.iter().enumerate() {
        let list = name.chapter_delta_list(&geometry);
        let page = pages.iter().find(|p| p.covers(list)).expect("some page covers");
        assert_eq!(
            page.search(name, &geometry),
            Some(closed.page_of[i]),
            "record {i} must route to its record page"
        );
    }
}

#[test]
fn empty_chapter_packs_and_reloads_consistently() {
    let geometry = tiny_geometry();
    let index = OpenChapterIndex::new(&geometry, 0);
    let pages = index.pack().unwrap();
    assert_eq!(pages.len(), geometry.index_pages_per_chapter as usize);

    let mut next_list = 0;
    for bytes in &pages {
        let page = ChapterIndexPage::parse(bytes, &geometry).unwrap();
        // Page ranges tile the chapter's list numbering in order.
        assert_eq!(page.lowest_list, next_list);
        next_list += page.list_count;
        assert_eq!(page.entry_count(), 0, "every list must be empty");
    }
    assert_eq!(next_list, geometry.delta_lists_per_chapter);
}
