//! KeePass 1.x (KDB, format version 3) databases

pub mod binary;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod database;
pub mod date;
pub mod entry;
pub mod error;
pub mod format;
pub mod group;
pub mod io;
pub mod manager;
pub mod progress;
pub mod secret;
pub mod stats;

pub use self::config::{Config, PasswordEncoding, SearchOptions};
pub use self::database::{Database, EntryMut, GroupMut};
pub use self::date::{PackedDate, NEVER_EXPIRES};
pub use self::entry::{Entry, EntryId};
pub use self::error::{Error, Result};
pub use self::group::{Group, GroupId};
pub use self::io::{FileIo, FsIo};
pub use self::manager::Manager;
pub use self::progress::{CancelHandle, Outcome, Progress, ProgressMonitor, Ticker};
pub use self::stats::PerformanceStatistics;
