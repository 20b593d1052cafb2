mod btree_index;
mod btree_iterator;
pub mod comparator;

pub use btree_index::BPlusTreeIndex;
pub use btree_iterator::TreeIndexIterator;
pub use comparator::{default_comparator, reverse_comparator, KeyComparator};
