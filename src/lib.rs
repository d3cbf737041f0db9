//! Rowstore - persistence core for a disk-backed relational store
//!
//! This crate keeps table rows in a single `.data` file behind a bounded
//! in-memory row cache, and makes every committed change durable through an
//! append-only log that is folded into a checkpoint script from time to time.
//!
//! # Architecture
//!
//! The system is organized into several layers:
//!
//! - **Tuple** (`tuple`): column types and values with their binary encoding
//!
//! - **Storage** (`storage`): files on disk
//!   - `DataFile`: positioned reads and writes of the `.data` file and its header
//!   - `FreeSpaceAllocator`: first-fit reuse of space released by deleted rows
//!   - `DatabaseProperties`: tuning values and the modification state
//!   - `compress_file`/`decompress_file`: the `.backup` copy of the data file
//!
//! - **Cache** (`cache`): rows in memory
//!   - `RowCache`: offset-hashed buckets over a circular access list, with
//!     percentile eviction and dirty tracking
//!   - `RowCodec`: row layout on disk, including per-index node links
//!
//! - **Catalog** (`catalog`): tables, sequences and sessions
//!
//! - **Log** (`log`): the durability log and checkpoint script
//!   - `LogWriter`/`LogReader`: text or binary records with checksums
//!   - `LogSyncTimer`: background sync every `write_delay` seconds
//!
//! - **Database** (`database`): recovery, checkpoints and the operations
//!   sessions call
//!
//! # Example
//!
//! ```rust,no_run
//! use rowstore::database::{Database, DatabaseOptions};
//! use rowstore::tuple::{DataType, Value};
//!
//! let db = Database::open("data/test", DatabaseOptions::new()).unwrap();
//! let session = db.open_session().unwrap();
//!
//! let table = db
//!     .create_table(session, "people", vec![DataType::Integer, DataType::VarChar(64)], 1)
//!     .unwrap();
//! let pos = db
//!     .insert(session, table, vec![Value::Integer(1), Value::String("Ada".into())])
//!     .unwrap();
//! db.commit(session).unwrap();
//!
//! assert!(db.fetch(table, pos).unwrap().is_some());
//! db.close().unwrap();
//! ```

pub mod cache;
pub mod catalog;
pub mod common;
pub mod database;
pub mod log;
pub mod storage;
pub mod tuple;

// Re-export commonly used types at the crate root
pub use common::{Error, Result, RowPos, SessionId, TableId};
pub use database::{Database, DatabaseOptions};
