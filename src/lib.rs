mod bot;
pub use bot::Bot;

mod config;
pub use config::Config;

mod db;
pub use db::{CacheError, Db};

mod gapps;
pub use gapps::{Android, ParseError, Platform, Variant};

pub mod github;

mod net;
pub use net::DownloadQueue;

pub mod storage;

pub mod telegram;

/// The lookup key meaning "the newest known release".
pub const CURRENT_STORAGE_KEY: &str = "current";

pub type Result<T> = anyhow::Result<T>;
