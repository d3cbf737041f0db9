/// Offset in the `.data` file where the end-of-file free position is stored.
pub const FREE_POS_POS: u64 = 16;

/// Offset where the head of the persisted free-list block is stored.
pub const FREE_LIST_HEAD_POS: u64 = 20;

/// Offset where the number of persisted free extents is stored.
pub const FREE_LIST_COUNT_POS: u64 = 24;

/// First offset available for rows; everything before it is header.
pub const INITIAL_FREE_POS: u32 = 32;

/// Magic tag at the start of every `.data` file.
pub const DATA_FILE_MAGIC: [u8; 4] = *b"RSDT";

/// Highest `.data` format version this build reads and writes.
pub const DATA_FORMAT_VERSION: u16 = 1;

/// Rows are padded to a multiple of this many bytes on disk.
pub const ROW_ALIGNMENT: u32 = 8;

/// Bytes of node-link data stored per index for every row.
pub const NODE_LINK_SIZE: u32 = 16;

/// Bytes taken by the size prefix of every row.
pub const ROW_SIZE_PREFIX: u32 = 4;

/// Hash bucket index is `(pos >> BUCKET_SHIFT) & mask`; rows are 8-byte aligned.
pub const BUCKET_SHIFT: u32 = 3;

/// Maximum resident rows is this multiple of the bucket table size.
pub const ROWS_PER_BUCKET: usize = 3;

/// The most recently accessed rows an eviction pass always leaves resident.
pub const MIN_RETAINED_ROWS: usize = 5;

/// Eviction removes an extra `resident / EVICTION_BIAS_DIVISOR` rows beyond
/// the 25th percentile to absorb counter ties.
pub const DEFAULT_EVICTION_BIAS_DIVISOR: usize = 512;

/// Upper bound on the free list before it is restarted.
pub const MAX_FREE_EXTENTS: usize = 1024;

/// Cache bucket-count exponent: range and default.
pub const CACHE_SCALE_RANGE: (u32, u32) = (8, 18);
pub const DEFAULT_CACHE_SCALE: u32 = 14;

/// Average-row-size exponent: range and default.
pub const CACHE_SIZE_SCALE_RANGE: (u32, u32) = (6, 20);
pub const DEFAULT_CACHE_SIZE_SCALE: u32 = 10;

/// Log size in megabytes that forces a checkpoint.
pub const DEFAULT_LOG_SIZE_MB: u32 = 200;

/// Seconds between forced log syncs.
pub const DEFAULT_WRITE_DELAY_SECS: u32 = 60;

/// Engine version written to the properties file.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Oldest engine version able to open files written by this build.
pub const COMPATIBLE_VERSION: &str = "0.1.0";
