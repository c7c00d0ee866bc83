//! The package record and its mirror lifecycle.

use std::path::{Path, PathBuf};

use anyhow::{ensure, Context};
use chrono::NaiveDate;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::config::GappsConfig;
use crate::gapps::{self, Android, ParseError, Platform, Variant};
use crate::github::ReleaseAsset;
use crate::net::DownloadQueue;

const SEPARATOR: char = '-';

/// How many parallel ranges a package download is split into.
const DOWNLOAD_RANGES: u64 = 20;

/// One OpenGApps package: where it comes from and where its mirrors live.
///
/// `origin_url`, `md5` and `size` are fixed at parse time. `local_url` and
/// `remote_url` start empty and are filled by [`Package::create_mirror`];
/// a non-empty mirror URL doubles as the "already mirrored" marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub date: String,
    pub origin_url: String,
    #[serde(default)]
    pub local_url: String,
    #[serde(default)]
    pub remote_url: String,
    pub md5: String,
    #[serde(default)]
    pub size: u64,
    pub platform: Platform,
    pub android: Android,
    pub variant: Variant,
}

impl Package {
    /// Creates the configured mirrors for this package.
    ///
    /// A destination that already has its URL is left alone; once every
    /// configured destination is filled the call returns without touching
    /// the network.
    pub async fn create_mirror(
        &mut self,
        dq: &DownloadQueue,
        cfg: &GappsConfig,
    ) -> crate::Result<()> {
        let local_done = cfg.local_url.is_none() || !self.local_url.is_empty();
        let remote_done = cfg.remote_url.is_none() || !self.remote_url.is_empty();
        if local_done && remote_done {
            return Ok(());
        }

        // download the file
        let mut path = dq
            .add_multi(&self.origin_url, &self.md5, DOWNLOAD_RANGES, self.size)
            .await
            .context("unable to read file body")?;
        debug!(path = %path.display(), "package downloaded");

        // with a local root configured the file moves there for good,
        // otherwise the temp file goes away after the upload
        let mut delete_temp = true;
        if let Some(local_path) = &cfg.local_path {
            path = self
                .move_to(&path, local_path)
                .await
                .context("unable to move the file to storage")?;
            delete_temp = false;
            debug!(path = %path.display(), "package moved");

            if let Some(template) = &cfg.local_url {
                let rel = path.strip_prefix(local_path).unwrap_or(&path);
                self.local_url = render_template(template, &rel.to_string_lossy());
                debug!(url = %self.local_url, "local mirror ready");
            }
        }

        let result = self.upload(dq, cfg, &path).await;
        if delete_temp {
            let _ = tokio::fs::remove_file(&path).await;
        }
        result
    }

    /// Moves the downloaded file under `<root>/<platform>/<date>/<name>`.
    async fn move_to(&self, origin: &Path, root: &Path) -> crate::Result<PathBuf> {
        use std::os::unix::fs::PermissionsExt;

        let dir = root.join(self.platform.to_string()).join(&self.date);
        tokio::fs::create_dir_all(&dir)
            .await
            .context("unable to create folder")?;
        tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).await?;

        let dest = dir.join(&self.name);
        tokio::fs::rename(origin, &dest)
            .await
            .context("unable to move file")?;
        tokio::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o755))
            .await
            .context("unable to set file permissions")?;

        Ok(dest)
    }

    /// Streams the file to the remote host and records the published URL
    /// from the response body.
    async fn upload(
        &mut self,
        dq: &DownloadQueue,
        cfg: &GappsConfig,
        path: &Path,
    ) -> crate::Result<()> {
        let Some(template) = &cfg.remote_url else {
            return Ok(());
        };
        if !self.remote_url.is_empty() {
            return Ok(());
        }

        let file = tokio::fs::File::open(path)
            .await
            .context("unable to open the mirrored file")?;
        let res = dq
            .client()
            .put(render_template(template, &self.name))
            .header(CONTENT_TYPE, "application/zip")
            .header("Max-Days", "7")
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await
            .context("unable to make upload request")?;
        ensure!(
            res.status().is_success(),
            "unable to make upload request: {}",
            res.status()
        );

        self.remote_url = res
            .text()
            .await
            .context("unable to read mirror response body")?;
        debug!(url = %self.remote_url, "file uploaded");
        Ok(())
    }
}

/// Renders a `%s` template with a single argument.
pub(crate) fn render_template(template: &str, arg: &str) -> String {
    template.replacen("%s", arg, 1)
}

/// Downloads the `.md5` companion of `zip` and parses the pair into a
/// package.
pub(crate) async fn form_package(
    dq: &DownloadQueue,
    cfg: &GappsConfig,
    zip: &ReleaseAsset,
    md5: &ReleaseAsset,
) -> crate::Result<Package> {
    let md5sum = get_md5(dq, &md5.browser_download_url)
        .await
        .context("unable to download md5")?;
    let pkg = parse_asset(zip, md5sum, &cfg.prefix, &cfg.time_format)
        .context("unable to create package")?;
    Ok(pkg)
}

/// The digest is everything before the first double-space separator of the
/// `.md5` file body.
async fn get_md5(dq: &DownloadQueue, url: &str) -> crate::Result<String> {
    let path = dq
        .add_single(url)
        .await
        .context("unable to download MD5 file")?;
    let content = tokio::fs::read_to_string(&path)
        .await
        .context("unable to read MD5 file")?;
    let _ = tokio::fs::remove_file(&path).await;

    Ok(content.split("  ").next().unwrap_or_default().to_string())
}

/// Parses an artifact name into a package.
///
/// Names follow `<prefix>-<platform>-<android>-<variant>-<date>.zip`. The
/// Android version carries the single dot inside the name, so splitting on
/// dots yields exactly three pieces whose first two concatenate back into
/// the dash-separated identifier run.
pub fn parse_asset(
    asset: &ReleaseAsset,
    md5sum: String,
    prefix: &str,
    time_format: &str,
) -> Result<Package, ParseError> {
    let name = &asset.name;
    let trimmed = name
        .strip_prefix(&format!("{prefix}{SEPARATOR}"))
        .unwrap_or(name);

    let pieces: Vec<&str> = trimmed.split('.').collect();
    if pieces.len() != 3 {
        return Err(ParseError::Name(name.clone()));
    }

    let (path, ext) = (format!("{}{}", pieces[0], pieces[1]), pieces[2]);
    if ext != "zip" {
        return Err(ParseError::Extension(ext.to_string()));
    }

    let parts: Vec<&str> = path.split(SEPARATOR).collect();
    if parts.len() != 4 {
        return Err(ParseError::Name(name.clone()));
    }

    let (platform, android, variant) = gapps::parse_package_parts(&parts[..3])?;
    if NaiveDate::parse_from_str(parts[3], time_format).is_err() {
        return Err(ParseError::Date(parts[3].to_string()));
    }

    Ok(Package {
        name: name.clone(),
        date: parts[3].to_string(),
        origin_url: asset.browser_download_url.clone(),
        local_url: String::new(),
        remote_url: String::new(),
        md5: md5sum,
        size: asset.size,
        platform,
        android,
        variant,
    })
}

#[cfg(test)]
mod tests {
    use md5::{Digest, Md5};

    use super::*;
    use crate::net::testserver;

    const TIME_FORMAT: &str = "%Y%m%d";

    fn asset(name: &str) -> ReleaseAsset {
        ReleaseAsset {
            name: name.to_string(),
            browser_download_url: format!("https://example.com/{name}"),
            size: 1000,
        }
    }

    fn gapps_config(local_path: Option<PathBuf>) -> GappsConfig {
        GappsConfig {
            time_format: TIME_FORMAT.to_string(),
            prefix: "open_gapps".to_string(),
            renew_period: 60,
            local_path,
            local_url: Some("/g/%s".to_string()),
            local_host: Some("local.example.com".to_string()),
            remote_url: None,
            remote_host: None,
        }
    }

    #[test]
    fn parses_a_valid_asset() {
        let pkg = parse_asset(
            &asset("open_gapps-arm64-9.0-nano-20190101.zip"),
            "abc123".to_string(),
            "open_gapps",
            TIME_FORMAT,
        )
        .unwrap();

        assert_eq!(pkg.name, "open_gapps-arm64-9.0-nano-20190101.zip");
        assert_eq!(pkg.date, "20190101");
        assert_eq!(pkg.platform, Platform::Arm64);
        assert_eq!(pkg.android, Android::V9_0);
        assert_eq!(pkg.variant, Variant::Nano);
        assert_eq!(pkg.md5, "abc123");
        assert_eq!(pkg.size, 1000);
        assert!(pkg.local_url.is_empty());
        assert!(pkg.remote_url.is_empty());
    }

    #[test]
    fn format_then_parse_round_trips_every_identifier() {
        for platform in Platform::VALUES {
            for android in Android::VALUES {
                for variant in Variant::VALUES {
                    let name = format!(
                        "open_gapps-{platform}-{android}-{variant}-20190101.zip"
                    );
                    let pkg = parse_asset(
                        &asset(&name),
                        String::new(),
                        "open_gapps",
                        TIME_FORMAT,
                    )
                    .unwrap();
                    assert_eq!(
                        (pkg.platform, pkg.android, pkg.variant, pkg.date.as_str()),
                        (platform, android, variant, "20190101"),
                        "{name}"
                    );
                }
            }
        }
    }

    #[test]
    fn rejects_malformed_names() {
        let err = parse_asset(
            &asset("open_gapps-arm64-9.0-nano-20190101.tar"),
            String::new(),
            "open_gapps",
            TIME_FORMAT,
        )
        .unwrap_err();
        assert!(err.to_string().contains("incorrect package extension"));

        let err = parse_asset(
            &asset("open_gapps-arm64-nano-20190101.zip"),
            String::new(),
            "open_gapps",
            TIME_FORMAT,
        )
        .unwrap_err();
        assert!(err.to_string().contains("incorrect package name"));

        let err = parse_asset(
            &asset("open_gapps-arm64-9.0-nope-20190101.zip"),
            String::new(),
            "open_gapps",
            TIME_FORMAT,
        )
        .unwrap_err();
        assert!(err.to_string().contains("does not belong to Variant values"));

        let err = parse_asset(
            &asset("open_gapps-arm64-9.0-nano-2019.zip"),
            String::new(),
            "open_gapps",
            TIME_FORMAT,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unable to parse time"));
    }

    #[test]
    fn renders_templates() {
        assert_eq!(
            render_template("/g/%s", "arm64/20190101/pkg.zip"),
            "/g/arm64/20190101/pkg.zip"
        );
        assert_eq!(render_template("no placeholder", "x"), "no placeholder");
    }

    #[tokio::test]
    async fn mirror_is_idempotent_once_destinations_are_filled() {
        let dq = DownloadQueue::new(1);
        let cfg = gapps_config(Some(PathBuf::from("/nonexistent")));

        let mut pkg = parse_asset(
            &asset("open_gapps-arm64-9.0-nano-20190101.zip"),
            "ffffffffffffffffffffffffffffffff".to_string(),
            "open_gapps",
            TIME_FORMAT,
        )
        .unwrap();
        // An unreachable origin makes any download attempt fail loudly, so
        // success proves no work was done.
        pkg.origin_url = "http://127.0.0.1:1/unreachable.zip".to_string();
        pkg.local_url = "/g/arm64/20190101/pkg.zip".to_string();

        pkg.create_mirror(&dq, &cfg).await.unwrap();
        assert_eq!(pkg.local_url, "/g/arm64/20190101/pkg.zip");
    }

    #[tokio::test]
    async fn mirror_moves_the_file_and_renders_the_local_url() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 199) as u8).collect();
        let md5sum = hex::encode(Md5::digest(&data));
        let base = testserver::serve(data.clone()).await;

        let root = tempfile::tempdir().unwrap();
        let dq = DownloadQueue::new(2);
        let cfg = gapps_config(Some(root.path().to_path_buf()));

        let name = "open_gapps-arm64-9.0-nano-20190101.zip";
        let mut pkg = parse_asset(&asset(name), md5sum, "open_gapps", TIME_FORMAT).unwrap();
        pkg.origin_url = format!("{base}/{name}");

        pkg.create_mirror(&dq, &cfg).await.unwrap();

        let dest = root.path().join("arm64").join("20190101").join(name);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), data);
        assert_eq!(
            pkg.local_url,
            format!("/g/arm64/20190101/{name}")
        );
        assert!(pkg.remote_url.is_empty());
    }

    #[tokio::test]
    async fn mirror_fails_closed_on_checksum_mismatch() {
        let data = b"corrupted body".to_vec();
        let base = testserver::serve(data).await;

        let root = tempfile::tempdir().unwrap();
        let dq = DownloadQueue::new(2);
        let cfg = gapps_config(Some(root.path().to_path_buf()));

        let name = "open_gapps-arm64-9.0-nano-20190101.zip";
        let mut pkg = parse_asset(
            &asset(name),
            "00000000000000000000000000000000".to_string(),
            "open_gapps",
            TIME_FORMAT,
        )
        .unwrap();
        pkg.origin_url = format!("{base}/{name}");
        pkg.size = 14;

        let err = pkg.create_mirror(&dq, &cfg).await.unwrap_err();
        assert!(format!("{err:#}").contains("checksum mismatch"));
        assert!(pkg.local_url.is_empty());
        assert!(pkg.remote_url.is_empty());
    }
}
