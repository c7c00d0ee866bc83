//! Per-release-date package storage.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tokio::task;
use tracing::warn;

use crate::config::Config;
use crate::db::Db;
use crate::gapps::{Android, Platform, Variant};
use crate::github::{self, ReleaseAsset};
use crate::net::DownloadQueue;
use crate::CURRENT_STORAGE_KEY;

use super::package::{form_package, Package};

type PackageMap = BTreeMap<Platform, BTreeMap<Android, BTreeMap<Variant, Package>>>;

/// All packages of one release date, indexed by the identifier triple.
///
/// One lock guards the whole index; critical sections never hold it across
/// an await.
pub struct Storage {
    inner: RwLock<Inner>,
}

#[derive(Default, Serialize, Deserialize)]
struct Inner {
    date: String,
    count: usize,
    packages: PackageMap,
}

impl Default for Storage {
    fn default() -> Self {
        Storage::new()
    }
}

impl Storage {
    pub fn new() -> Self {
        Storage {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Builds a storage for one release tag by indexing every platform's
    /// release. The `current` tag (or an empty one) targets the latest
    /// releases. Per-platform failures are logged and skipped, so the result
    /// holds whatever subset could be indexed.
    pub async fn fetch(
        gh: &github::Client,
        dq: &Arc<DownloadQueue>,
        cfg: &Arc<Config>,
        tag: &str,
    ) -> crate::Result<Arc<Storage>> {
        let storage = Arc::new(Storage::new());
        let tag = if tag.is_empty() { CURRENT_STORAGE_KEY } else { tag };

        for platform in Platform::VALUES {
            let release = if tag == CURRENT_STORAGE_KEY {
                gh.latest_release(&cfg.github.repo, platform.as_str()).await
            } else {
                gh.release_by_tag(&cfg.github.repo, platform.as_str(), tag)
                    .await
            };
            let release = match release {
                Ok(release) => release,
                Err(err) => {
                    warn!(%platform, tag, error = %err, "unable to get release");
                    continue;
                }
            };

            let (zips, md5s) = pair_assets(&release.assets);
            if zips.len() != md5s.len() {
                warn!(
                    %platform,
                    zips = zips.len(),
                    md5s = md5s.len(),
                    "release assets do not pair up, skipping the surplus"
                );
            }

            // Index the platform's packages concurrently; md5 downloads
            // dominate the time here.
            let mut jobs = Vec::with_capacity(zips.len().min(md5s.len()));
            for (zip, md5) in zips.into_iter().zip(md5s) {
                let storage = Arc::clone(&storage);
                let dq = Arc::clone(dq);
                let cfg = Arc::clone(cfg);
                jobs.push(task::spawn(async move {
                    match form_package(&dq, &cfg.gapps, &zip, &md5).await {
                        Ok(pkg) => storage.add(pkg),
                        Err(err) => warn!(error = %err, "unable to form package"),
                    }
                }));
            }
            for job in jobs {
                let _ = job.await;
            }
        }

        Ok(storage)
    }

    /// Adds a package. The first writer for a triple wins; later adds of the
    /// same triple are ignored. The storage date is set by the first package.
    pub fn add(&self, pkg: Package) {
        let mut inner = self.inner.write().unwrap();
        if inner.date.is_empty() {
            inner.date = pkg.date.clone();
        }

        let leaf = inner
            .packages
            .entry(pkg.platform)
            .or_default()
            .entry(pkg.android)
            .or_default();
        let inserted = if leaf.contains_key(&pkg.variant) {
            false
        } else {
            leaf.insert(pkg.variant, pkg);
            true
        };
        if inserted {
            inner.count += 1;
        }
    }

    /// Replaces the package at its triple; used to write mirror URLs back.
    pub fn update(&self, pkg: Package) {
        let mut inner = self.inner.write().unwrap();
        if inner.date.is_empty() {
            inner.date = pkg.date.clone();
        }

        let leaf = inner
            .packages
            .entry(pkg.platform)
            .or_default()
            .entry(pkg.android)
            .or_default();
        let inserted = leaf.insert(pkg.variant, pkg).is_none();
        if inserted {
            inner.count += 1;
        }
    }

    /// Looks up a package by its identifier triple.
    pub fn get(&self, platform: Platform, android: Android, variant: Variant) -> Option<Package> {
        let inner = self.inner.read().unwrap();
        inner
            .packages
            .get(&platform)?
            .get(&android)?
            .get(&variant)
            .cloned()
    }

    /// Removes the package's leaf entry. Empty intermediate maps stay, and
    /// `count` keeps its high-water value.
    pub fn delete(&self, pkg: &Package) {
        let mut inner = self.inner.write().unwrap();
        if let Some(leaf) = inner
            .packages
            .get_mut(&pkg.platform)
            .and_then(|m| m.get_mut(&pkg.android))
        {
            leaf.remove(&pkg.variant);
        }
    }

    /// Drops everything so the storage can be reused.
    pub fn clear(&self) {
        *self.inner.write().unwrap() = Inner::default();
    }

    /// Merges packages from `other`: new triples are inserted, triples
    /// already present keep their current record (which may hold mirror URLs
    /// the fresh copy lacks).
    pub fn merge_from(&self, other: &Storage) {
        let other = other.inner.read().unwrap();
        let mut inner = self.inner.write().unwrap();
        if inner.date.is_empty() {
            inner.date = other.date.clone();
        }

        for (platform, androids) in &other.packages {
            for (android, variants) in androids {
                for (variant, pkg) in variants {
                    let leaf = inner
                        .packages
                        .entry(*platform)
                        .or_default()
                        .entry(*android)
                        .or_default();
                    if leaf.contains_key(variant) {
                        continue;
                    }
                    leaf.insert(*variant, pkg.clone());
                    inner.count += 1;
                }
            }
        }
    }

    /// Serializes the storage and puts it into the cache under its date key.
    pub fn save(&self, cache: &Db) -> crate::Result<()> {
        let inner = self.inner.read().unwrap();
        if inner.date.is_empty() {
            bail!("storage has no date");
        }

        let body = serde_json::to_vec(&*inner)
            .with_context(|| format!("unable to marshal storage {}", inner.date))?;
        cache
            .put(&inner.date, &body)
            .with_context(|| format!("unable to save storage {} to cache", inner.date))
    }

    /// Rebuilds a storage from its JSON snapshot.
    pub fn from_json(body: &[u8]) -> crate::Result<Storage> {
        let inner: Inner = serde_json::from_slice(body)?;
        Ok(Storage {
            inner: RwLock::new(inner),
        })
    }

    pub fn date(&self) -> String {
        self.inner.read().unwrap().date.clone()
    }

    pub fn count(&self) -> usize {
        self.inner.read().unwrap().count
    }
}

/// Splits release assets into matched zip/md5 lists. Both sides are sorted
/// by their suffix-stripped name, so the pairing does not depend on the
/// order the catalog happens to return.
fn pair_assets(assets: &[ReleaseAsset]) -> (Vec<ReleaseAsset>, Vec<ReleaseAsset>) {
    let mut zips: Vec<ReleaseAsset> = assets
        .iter()
        .filter(|a| a.name.ends_with("zip"))
        .cloned()
        .collect();
    let mut md5s: Vec<ReleaseAsset> = assets
        .iter()
        .filter(|a| a.name.ends_with("md5"))
        .cloned()
        .collect();

    zips.sort_by(|a, b| zip_basename(&a.name).cmp(zip_basename(&b.name)));
    md5s.sort_by(|a, b| md5_basename(&a.name).cmp(md5_basename(&b.name)));

    (zips, md5s)
}

fn zip_basename(name: &str) -> &str {
    name.trim_end_matches(".zip")
}

/// md5 companions are named `<basename>.zip.md5`; both suffixes come off so
/// the sort key matches the zip side.
fn md5_basename(name: &str) -> &str {
    name.trim_end_matches(".md5").trim_end_matches(".zip")
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::gapps::{Android, Platform, Variant};

    pub(crate) fn test_package(
        platform: Platform,
        android: Android,
        variant: Variant,
        date: &str,
    ) -> Package {
        let name = format!("open_gapps-{platform}-{android}-{variant}-{date}.zip");
        Package {
            name: name.clone(),
            date: date.to_string(),
            origin_url: format!("https://example.com/{name}"),
            local_url: String::new(),
            remote_url: String::new(),
            md5: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            size: 1000,
            platform,
            android,
            variant,
        }
    }

    fn open_temp_db() -> (tempfile::TempDir, Db) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("cache.db"), Duration::from_secs(1)).unwrap();
        (dir, db)
    }

    #[test]
    fn first_writer_wins() {
        let storage = Storage::new();
        let first = test_package(Platform::Arm64, Android::V9_0, Variant::Nano, "20190101");
        let mut second = first.clone();
        second.origin_url = "https://example.com/other.zip".to_string();

        storage.add(first.clone());
        storage.add(second);

        let got = storage
            .get(Platform::Arm64, Android::V9_0, Variant::Nano)
            .unwrap();
        assert_eq!(got.origin_url, first.origin_url);
        assert_eq!(storage.count(), 1);
        assert_eq!(storage.date(), "20190101");
    }

    #[test]
    fn concurrent_adds_of_one_triple_insert_once() {
        let storage = Arc::new(Storage::new());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let storage = Arc::clone(&storage);
                thread::spawn(move || {
                    let mut pkg =
                        test_package(Platform::Arm, Android::V8_1, Variant::Aroma, "20181127");
                    pkg.origin_url = format!("https://example.com/{i}.zip");
                    storage.add(pkg);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(storage.count(), 1);
        assert!(storage
            .get(Platform::Arm, Android::V8_1, Variant::Aroma)
            .is_some());
    }

    #[test]
    fn delete_keeps_the_count_watermark() {
        let storage = Storage::new();
        let pkg = test_package(Platform::X86, Android::V7_1, Variant::Pico, "20190101");
        storage.add(pkg.clone());
        storage.add(test_package(
            Platform::X86,
            Android::V7_1,
            Variant::Micro,
            "20190101",
        ));

        storage.delete(&pkg);
        assert!(storage
            .get(Platform::X86, Android::V7_1, Variant::Pico)
            .is_none());
        assert_eq!(storage.count(), 2);
    }

    #[test]
    fn clear_resets_everything() {
        let storage = Storage::new();
        storage.add(test_package(
            Platform::Arm,
            Android::V4_4,
            Variant::Stock,
            "20180101",
        ));

        storage.clear();
        assert_eq!(storage.count(), 0);
        assert_eq!(storage.date(), "");
        assert!(storage
            .get(Platform::Arm, Android::V4_4, Variant::Stock)
            .is_none());
    }

    #[test]
    fn update_overwrites_in_place() {
        let storage = Storage::new();
        let mut pkg = test_package(Platform::Arm64, Android::V9_0, Variant::Nano, "20190101");
        storage.add(pkg.clone());

        pkg.local_url = "/g/arm64/20190101/pkg.zip".to_string();
        storage.update(pkg);

        let got = storage
            .get(Platform::Arm64, Android::V9_0, Variant::Nano)
            .unwrap();
        assert_eq!(got.local_url, "/g/arm64/20190101/pkg.zip");
        assert_eq!(storage.count(), 1);
    }

    #[test]
    fn merge_keeps_existing_records() {
        let storage = Storage::new();
        let mut mirrored = test_package(Platform::Arm64, Android::V9_0, Variant::Nano, "20190101");
        mirrored.local_url = "/g/arm64/20190101/pkg.zip".to_string();
        storage.add(mirrored.clone());

        let fresh = Storage::new();
        fresh.add(test_package(
            Platform::Arm64,
            Android::V9_0,
            Variant::Nano,
            "20190101",
        ));
        fresh.add(test_package(
            Platform::Arm64,
            Android::V9_0,
            Variant::Pico,
            "20190101",
        ));

        storage.merge_from(&fresh);

        let got = storage
            .get(Platform::Arm64, Android::V9_0, Variant::Nano)
            .unwrap();
        assert_eq!(got.local_url, mirrored.local_url);
        assert!(storage
            .get(Platform::Arm64, Android::V9_0, Variant::Pico)
            .is_some());
        assert_eq!(storage.count(), 2);
    }

    #[test]
    fn save_then_load_reproduces_the_storage() {
        let (_dir, db) = open_temp_db();
        let storage = Storage::new();
        storage.add(test_package(
            Platform::Arm64,
            Android::V9_0,
            Variant::Nano,
            "20190101",
        ));
        storage.add(test_package(
            Platform::Arm,
            Android::V8_1,
            Variant::Aroma,
            "20190101",
        ));

        storage.save(&db).unwrap();

        let body = db.get("20190101").unwrap();
        let loaded = Storage::from_json(&body).unwrap();
        assert_eq!(loaded.date(), "20190101");
        assert_eq!(loaded.count(), 2);
        for (platform, android, variant) in [
            (Platform::Arm64, Android::V9_0, Variant::Nano),
            (Platform::Arm, Android::V8_1, Variant::Aroma),
        ] {
            assert_eq!(
                loaded.get(platform, android, variant),
                storage.get(platform, android, variant)
            );
        }
    }

    #[test]
    fn save_requires_a_date() {
        let (_dir, db) = open_temp_db();
        let err = Storage::new().save(&db).unwrap_err();
        assert!(err.to_string().contains("no date"));
    }

    #[test]
    fn snapshot_keys_are_ordinals() {
        let storage = Storage::new();
        storage.add(test_package(
            Platform::Arm64,
            Android::V9_0,
            Variant::Nano,
            "20190101",
        ));

        let body = serde_json::to_value(&*storage.inner.read().unwrap()).unwrap();
        assert_eq!(body["date"], "20190101");
        assert_eq!(body["count"], 1);
        assert_eq!(
            body["packages"]["1"]["8"]["2"]["name"],
            "open_gapps-arm64-9.0-nano-20190101.zip"
        );
    }

    #[test]
    fn pairing_sorts_both_sides() {
        let assets = vec![
            ReleaseAsset {
                name: "open_gapps-arm64-9.0-pico-20190101.zip".into(),
                browser_download_url: "https://example.com/b.zip".into(),
                size: 2,
            },
            ReleaseAsset {
                name: "open_gapps-arm64-9.0-nano-20190101.zip.md5".into(),
                browser_download_url: "https://example.com/a.md5".into(),
                size: 0,
            },
            ReleaseAsset {
                name: "open_gapps-arm64-9.0-nano-20190101.zip".into(),
                browser_download_url: "https://example.com/a.zip".into(),
                size: 1,
            },
            ReleaseAsset {
                name: "open_gapps-arm64-9.0-pico-20190101.zip.md5".into(),
                browser_download_url: "https://example.com/b.md5".into(),
                size: 0,
            },
        ];

        let (zips, md5s) = pair_assets(&assets);
        assert_eq!(zips.len(), 2);
        assert_eq!(md5s.len(), 2);
        for (zip, md5) in zips.iter().zip(&md5s) {
            assert_eq!(format!("{}.md5", zip.name), md5.name);
        }
    }

    #[test]
    fn pairing_survives_basenames_that_prefix_each_other() {
        // With the `.zip` still attached to the md5 sort key, `pkg.zip` and
        // `pkg-extra.zip` would order differently on the two sides.
        let asset = |name: &str| ReleaseAsset {
            name: name.to_string(),
            browser_download_url: format!("https://example.com/{name}"),
            size: 0,
        };
        let assets = vec![
            asset("pkg.zip"),
            asset("pkg-extra.zip.md5"),
            asset("pkg-extra.zip"),
            asset("pkg.zip.md5"),
        ];

        let (zips, md5s) = pair_assets(&assets);
        assert_eq!(zips.len(), 2);
        assert_eq!(md5s.len(), 2);
        for (zip, md5) in zips.iter().zip(&md5s) {
            assert_eq!(format!("{}.md5", zip.name), md5.name);
        }
    }
}
