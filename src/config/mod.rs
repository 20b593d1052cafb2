#[derive(Debug, Clone, Copy)]
pub struct BufferPoolConfig {
    pub buffer_pool_size: usize,
    /// K parameter of the LRU-K replacer.
    pub lru_k_k: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig {
            buffer_pool_size: 1000,
            lru_k_k: 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BTreeConfig {
    /// Max number of (key, rid) slots a leaf page may hold.
    pub leaf_max_size: u32,
    /// Max number of (key, child) slots an internal page may hold.
    pub internal_max_size: u32,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        BTreeConfig {
            leaf_max_size: 32,
            internal_max_size: 32,
        }
    }
}
