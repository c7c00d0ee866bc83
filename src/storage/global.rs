//! The process-wide index of release storages.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::Db;
use crate::gapps::Platform;
use crate::github;
use crate::net::DownloadQueue;
use crate::CURRENT_STORAGE_KEY;

use super::Storage;

/// All known release storages keyed by date, plus which date is the newest.
///
/// The newest release is tracked as a plain date field instead of a reserved
/// map key, so persisting the map can never leak the alias into the cache.
pub struct GlobalStorage {
    cache: Arc<Db>,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    storages: BTreeMap<String, Arc<Storage>>,
    latest: Option<String>,
}

impl GlobalStorage {
    pub fn new(cache: Arc<Db>) -> Self {
        GlobalStorage {
            cache,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// The cache storages persist themselves into.
    pub fn cache(&self) -> &Db {
        &self.cache
    }

    /// Registers a storage under `date`. The empty date and the `current`
    /// alias both mean "this is the newest release": the storage is indexed
    /// under its own date and the latest pointer moves to it.
    pub fn add(&self, date: &str, storage: Arc<Storage>) {
        let mut inner = self.inner.write().unwrap();
        if date.is_empty() || date == CURRENT_STORAGE_KEY {
            let date = storage.date();
            if date.is_empty() {
                warn!("refusing to track a dateless storage as the newest release");
                return;
            }
            inner.storages.insert(date.clone(), storage);
            inner.latest = Some(date);
        } else {
            inner.storages.insert(date.to_string(), storage);
        }
    }

    /// Looks up a storage; `current` (or the empty date) resolves through
    /// the latest pointer.
    pub fn get(&self, date: &str) -> Option<Arc<Storage>> {
        let inner = self.inner.read().unwrap();
        let key = if date.is_empty() || date == CURRENT_STORAGE_KEY {
            inner.latest.as_deref()?
        } else {
            date
        };
        inner.storages.get(key).cloned()
    }

    fn set_latest(&self, date: &str) {
        self.inner.write().unwrap().latest = Some(date.to_string());
    }

    /// Loads every cached storage. Broken snapshots are skipped, so one bad
    /// entry cannot take down the whole index; only a failing key listing is
    /// fatal.
    pub fn load(&self) -> crate::Result<()> {
        let keys = self
            .cache
            .keys()
            .context("unable to load storage list from cache")?;
        debug!(?keys, "got the release keys");

        for key in keys {
            if key == CURRENT_STORAGE_KEY {
                continue;
            }
            let body = match self.cache.get(&key) {
                Ok(body) => body,
                Err(err) => {
                    warn!(%key, error = %err, "unable to get storage from cache");
                    continue;
                }
            };
            match Storage::from_json(&body) {
                Ok(storage) => self.add(&key, Arc::new(storage)),
                Err(err) => {
                    warn!(%key, error = %err, "unable to unmarshal storage from cache");
                }
            }
        }
        Ok(())
    }

    /// Saves every storage to the cache. The latest pointer is not a storage
    /// and is never written; per-storage failures are logged and do not stop
    /// the iteration.
    pub fn save(&self) {
        let storages: Vec<(String, Arc<Storage>)> = {
            let inner = self.inner.read().unwrap();
            inner
                .storages
                .iter()
                .map(|(date, storage)| (date.clone(), Arc::clone(storage)))
                .collect()
        };

        for (date, storage) in storages {
            if let Err(err) = storage.save(&self.cache) {
                warn!(%date, error = %err, "unable to save storage");
            }
        }
    }

    /// Resolves the newest release date and makes sure its storage is
    /// indexed, persisted and marked current.
    pub async fn add_latest(
        &self,
        gh: &github::Client,
        dq: &Arc<DownloadQueue>,
        cfg: &Arc<Config>,
    ) -> crate::Result<()> {
        let date = latest_release_date(gh, &cfg.github.repo)
            .await
            .context("unable to get latest release date")?;
        debug!(release_date = %date, "got the newest release date");

        if self.get(&date).is_none() {
            info!(release_date = %date, "storage not found, creating a new one");
            let storage = Storage::fetch(gh, dq, cfg, &date)
                .await
                .context("unable to get current package storage")?;
            storage
                .save(&self.cache)
                .context("unable to save new storage")?;
            self.add(&date, storage);
            debug!(release_date = %date, "storage added");
        }

        self.set_latest(&date);
        Ok(())
    }
}

/// The newest release date across every platform repository: the head of the
/// descending-sorted tag list.
async fn latest_release_date(gh: &github::Client, repo: &str) -> crate::Result<String> {
    let mut dates = Vec::with_capacity(Platform::VALUES.len());
    for platform in Platform::VALUES {
        match gh.latest_release(repo, platform.as_str()).await {
            Ok(release) => dates.push(release.tag_name),
            Err(err) => warn!(%platform, error = %err, "unable to get release"),
        }
    }

    dates.sort();
    dates.pop().context("no releases available")
}
