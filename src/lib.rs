//! An embedded, single-file, transactional key/value store.
//!
//! Data lives in named buckets (which nest) as ordered byte keys and
//! values, organized as a copy-on-write B+tree over a memory-mapped
//! file. One writer and any number of readers run concurrently; every
//! transaction sees a consistent snapshot, and commits are atomic via a
//! checksummed dual meta page.
//!
//! ```no_run
//! use burrow::DB;
//!
//! # fn main() -> burrow::Result<()> {
//! let db = DB::open("my.db")?;
//! db.update(|tx| {
//!     let b = tx.create_bucket_if_not_exists(b"widgets")?;
//!     b.put(b"answer", b"42")
//! })?;
//! db.view(|tx| {
//!     assert_eq!(tx.bucket(b"widgets")?.get(b"answer"), Some(&b"42"[..]));
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```

mod bucket;
mod cursor;
mod data;
mod db;
mod error;
mod free_list;
mod inode;
mod meta;
mod node;
mod page;
mod transaction;
mod utils;

pub use bucket::Bucket;
pub use cursor::{Buckets, Cursor};
pub use db::{OpenOptions, DB};
pub use error::{Error, Result};
pub use transaction::{Transaction, TxStats};
