mod access_list;
mod cached_row;
mod codec;
mod eviction;
mod row_cache;

pub use access_list::{AccessList, Walk};
pub use cached_row::{CachedRow, NodeLinks};
pub use codec::{BinaryRowCodec, RowCodec};
pub use eviction::{eviction_target, plan_eviction, EvictionCandidate, EvictionPlan};
pub use row_cache::{CacheLimits, CacheStats, RowCache};
