//! End-to-end exercise of the resource manager, table page, and page
//! cache working together, independent of the background buffer pool.

use relcore::cache::{ArcCache, PageWrapper};
use relcore::page::TablePage;
use relcore::resource::TableResourceManager;
use relcore::schema::{ColumnSchema, TableSchema};
use relcore::types::ColumnType;
use relcore::value::Value;

fn schema() -> TableSchema {
    TableSchema::new(
        vec![
            ColumnSchema::new("id", ColumnType::Int, false, true),
            ColumnSchema::new("name", ColumnType::Varchar(64), true, false),
        ],
        4096,
    )
    .unwrap()
}

#[test]
fn fill_a_page_delete_a_row_and_reread_through_a_fresh_manager() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("people.tbl");

    let mut manager = TableResourceManager::create(&path, schema()).unwrap();
    let mut buf = vec![0u8; 4096];
    let page_number = manager.reserve_new_page(&mut buf).unwrap();

    let mut inserted = 0;
    {
        let table_schema = schema();
        let mut page = TablePage::init(&table_schema, &mut buf, page_number).unwrap();
        loop {
            let row = vec![Value::Int(inserted), Value::Varchar(format!("row-{}", inserted))];
            if !page.insert_tuple(&row).unwrap() {
                break;
            }
            inserted += 1;
        }
        page.delete_tuple(0).unwrap();
    }
    assert!(inserted > 10);
    manager
        .write_page(&buf, &PageWrapper::new(page_number, true))
        .unwrap();
    manager.close().unwrap();

    let reopened = TableResourceManager::open(&path).unwrap();
    let mut read_buf = vec![0u8; 4096];
    reopened.read_page(&mut read_buf, page_number).unwrap();
    let table_schema = schema();
    let page = TablePage::open(&table_schema, &mut read_buf).unwrap();

    assert!(page.get_tuple(0, 0b11, 2).unwrap().is_none());
    let surviving = page.get_tuple(1, 0b11, 2).unwrap().unwrap();
    assert_eq!(surviving, vec![Value::Int(1), Value::Varchar("row-1".to_string())]);
}

#[test]
fn cache_admits_pages_and_evicted_dirty_pages_are_identified_for_flush() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("evicted.tbl");
    let schema = schema();
    let mut manager = TableResourceManager::create(&path, schema.clone()).unwrap();

    let cache = ArcCache::new(1, 4096);
    let resource_id = 7;

    let mut buf_a = vec![0u8; 4096];
    let page_a = manager.reserve_new_page(&mut buf_a).unwrap();
    cache
        .add_page(resource_id, buf_a, PageWrapper::new(page_a, true))
        .unwrap();
    assert!(cache.get_page(resource_id, page_a).is_some());

    let mut buf_b = vec![0u8; 4096];
    let page_b = manager.reserve_new_page(&mut buf_b).unwrap();
    let evicted = cache
        .add_page(resource_id, buf_b, PageWrapper::new(page_b, false))
        .unwrap();

    let evicted_wrapper = evicted.wrapper.expect("first page should have been evicted");
    assert_eq!(evicted_wrapper.page_number(), page_a);
    assert!(evicted_wrapper.is_modified());
    assert!(cache.get_page(resource_id, page_a).is_none());

    manager.close().unwrap();
}
