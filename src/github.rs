//! Minimal client for the GitHub releases API.
//!
//! Only the two lookups the indexer needs: the latest release of a
//! repository and a release by tag. OpenGApps publishes one repository per
//! platform under a common owner, so `repo` in the calls below is the
//! platform name.

use anyhow::ensure;
use serde::Deserialize;
use tracing::trace;

const API_URL: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("gapps-mirror-bot/", env!("CARGO_PKG_VERSION"));

/// One release, reduced to the fields the indexer consumes.
#[derive(Debug, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

/// A file attached to a release.
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
}

pub struct Client {
    http: reqwest::Client,
    token: String,
}

impl Client {
    pub fn new(token: impl Into<String>) -> Self {
        Client {
            http: reqwest::Client::new(),
            token: token.into(),
        }
    }

    /// Fetches the latest release of `owner/repo`.
    pub async fn latest_release(&self, owner: &str, repo: &str) -> crate::Result<Release> {
        self.fetch(&format!("{API_URL}/repos/{owner}/{repo}/releases/latest"))
            .await
    }

    /// Fetches the release of `owner/repo` carrying `tag`.
    pub async fn release_by_tag(
        &self,
        owner: &str,
        repo: &str,
        tag: &str,
    ) -> crate::Result<Release> {
        self.fetch(&format!("{API_URL}/repos/{owner}/{repo}/releases/tags/{tag}"))
            .await
    }

    async fn fetch(&self, url: &str) -> crate::Result<Release> {
        trace!(GET = url);
        let mut req = self
            .http
            .get(url)
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github+json");
        if !self.token.is_empty() {
            req = req.bearer_auth(&self.token);
        }

        let res = req.send().await?;
        ensure!(
            res.status().is_success(),
            "unable to get release: {}",
            res.status()
        );

        Ok(serde_json::from_slice(&res.bytes().await?)?)
    }
}
