//! StreamDb — embedded, single-file document store.
//!
//! Документы — непрозрачные байтовые потоки со стабильным 128-битным id
//! и произвольным числом строковых путей. Хранение — страницы по 4096
//! байт в одном растущем файле; crash safety — shadow paging через
//! трёхслотовые versioned links; много читателей, сериализованный
//! писатель.
//!
//! ```no_run
//! use streamdb::{Config, StreamDb};
//! use std::io::Cursor;
//!
//! # fn main() -> streamdb::Result<()> {
//! let db = StreamDb::create_with_config("data.sdb".as_ref(), Config::default())?;
//! let id = db.write_document("/greeting.txt", &mut Cursor::new(b"hello"))?;
//! assert_eq!(db.get("/greeting.txt")?.as_deref(), Some(&b"hello"[..]));
//! assert_eq!(db.get_id_by_path("/greeting.txt"), Some(id));
//! db.flush()?;
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod config;
pub mod consts;
pub mod db;
pub mod error;
pub mod freelist;
pub mod header;
pub mod index;
pub mod lock;
pub mod medium;
pub mod metrics;
pub mod page;
pub mod store;
pub mod trie;

// Удобные реэкспорты
pub use config::Config;
pub use db::{DocReader, PathIter, Stats, StreamDb};
pub use error::{Result, StreamDbError};
pub use medium::{FileMedium, Medium, MemoryMedium};
pub use metrics::{snapshot as metrics_snapshot, MetricsSnapshot};
pub use store::{quick_mode, set_quick_mode};
pub use uuid::Uuid;
