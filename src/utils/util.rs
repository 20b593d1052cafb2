use std::collections::VecDeque;

use comfy_table::Cell;

use crate::buffer::INVALID_PAGE_ID;
use crate::error::CrabTreeResult;
use crate::storage::codec::{BPlusTreePageCodec, IndexKeyCodec};
use crate::storage::index::BPlusTreeIndex;
use crate::storage::page::BPlusTreePage;

const TABLE_PRESET: &str = "||--+-++|    ++++++";

fn format_key(key: &[u8]) -> String {
    if key.is_empty() {
        return "NULL".to_string();
    }
    if key.len() == 8 {
        if let Ok(value) = IndexKeyCodec::decode_i64(key) {
            return value.to_string();
        }
    }
    key.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Render the tree level by level, one table per level with a nested
/// table per page.
pub fn pretty_format_index_tree(index: &BPlusTreeIndex) -> CrabTreeResult<String> {
    let mut display = String::new();

    if index.is_empty() {
        display.push_str("Empty tree.");
        return Ok(display);
    }

    let mut curr_queue = VecDeque::new();
    curr_queue.push_back(index.root_page_id());

    let mut level_index = 1;
    loop {
        if curr_queue.is_empty() {
            return Ok(display);
        }
        let mut next_queue = VecDeque::new();

        display.push_str(&format!("B+ Tree Level No.{}:\n", level_index));

        let mut level_table = comfy_table::Table::new();
        level_table.load_preset(TABLE_PRESET);
        let mut level_header = Vec::new();
        let mut level_row = Vec::new();

        while let Some(page_id) = curr_queue.pop_front() {
            let guard = index.buffer_pool.fetch_page_read(page_id)?;
            let (page, _) = BPlusTreePageCodec::decode(guard.data())?;
            drop(guard);

            match page {
                BPlusTreePage::Internal(internal) => {
                    let mut page_table = comfy_table::Table::new();
                    page_table.load_preset(TABLE_PRESET);
                    let mut page_header = Vec::new();
                    let mut page_row = Vec::new();
                    for (key, child_id) in internal.array.iter() {
                        page_header.push(Cell::new(format_key(key)));
                        page_row.push(Cell::new(child_id));
                    }
                    page_table.set_header(page_header);
                    page_table.add_row(page_row);

                    level_header.push(Cell::new(format!(
                        "page_id={}, size: {}/{}",
                        page_id, internal.header.current_size, internal.header.max_size
                    )));
                    level_row.push(Cell::new(page_table));

                    next_queue.extend(internal.values());
                }
                BPlusTreePage::Leaf(leaf) => {
                    let mut page_table = comfy_table::Table::new();
                    page_table.load_preset(TABLE_PRESET);
                    let mut page_header = Vec::new();
                    let mut page_row = Vec::new();
                    for (key, rid) in leaf.array.iter() {
                        page_header.push(Cell::new(format_key(key)));
                        page_row.push(Cell::new(format!("{}", rid)));
                    }
                    page_table.set_header(page_header);
                    page_table.add_row(page_row);

                    level_header.push(Cell::new(format!(
                        "page_id={}, size: {}/{}, next_page_id={}",
                        page_id,
                        leaf.header.current_size,
                        leaf.header.max_size,
                        if leaf.header.next_page_id == INVALID_PAGE_ID {
                            0
                        } else {
                            leaf.header.next_page_id
                        }
                    )));
                    level_row.push(Cell::new(page_table));
                }
            }
        }

        level_table.set_header(level_header);
        level_table.add_row(level_row);
        display.push_str(&format!("{}\n", level_table));

        curr_queue = next_queue;
        level_index += 1;
    }
}
