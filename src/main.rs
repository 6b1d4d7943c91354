use std::sync::Arc;

use keeldb::buffer::BufferPoolManager;
use keeldb::common::{PageId, RecordId, SlotId};
use keeldb::index::{BPlusTree, IntegerComparator};
use keeldb::storage::disk::DiskManager;

fn main() {
    println!("Keeldb - storage engine core demo");
    println!("=================================\n");

    let db_path = "demo.db";

    let disk_manager = Arc::new(DiskManager::new(db_path).expect("Failed to create disk manager"));
    println!("Created disk manager for: {}", db_path);

    let bpm = Arc::new(BufferPoolManager::new(16, 2, disk_manager));
    println!("Created buffer pool manager with 16 frames\n");

    // Page 0 holds the index header page.
    let header_page_id = bpm.new_page().expect("Failed to allocate header page");
    bpm.unpin_page(header_page_id, false);

    let tree = BPlusTree::new(Arc::clone(&bpm), header_page_id, IntegerComparator, 8, 8)
        .expect("Failed to create index");

    for key in [13u64, 7, 29, 1, 42, 18, 5, 33, 21, 9] {
        let rid = RecordId::new(PageId::new(key as u32), SlotId::new(0));
        tree.insert(key, rid).expect("Failed to insert");
        println!("Inserted key {}", key);
    }

    println!("\nTree structure:\n{}", tree.draw().expect("Failed to draw tree"));

    print!("Range scan: ");
    for entry in tree.begin().expect("Failed to create iterator") {
        let (key, _rid) = entry.expect("Iteration failed");
        print!("{} ", key);
    }
    println!();

    tree.remove(13).expect("Failed to remove");
    tree.remove(7).expect("Failed to remove");
    println!("\nAfter removing 13 and 7:\n{}", tree.draw().expect("Failed to draw tree"));

    bpm.flush_all_pages().expect("Failed to flush");
    println!("Flushed all pages to disk");

    std::fs::remove_file(db_path).ok();
    println!("\nDemo completed successfully!");
}
