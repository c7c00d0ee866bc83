//! TOML configuration.
//!
//! The file `<name>.toml` is looked up in `$HOME/.config`, `/etc` and the
//! working directory, in that order. Durations are integer seconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub max_downloads: usize,
    #[serde(default)]
    pub db: DbConfig,
    pub gapps: GappsConfig,
    pub github: GithubConfig,
    pub telegram: TelegramConfig,
    pub commands: Commands,
    pub messages: Messages,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub path: PathBuf,
    pub timeout: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            path: PathBuf::from("./bolt.db"),
            timeout: 1,
        }
    }
}

impl DbConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

#[derive(Debug, Deserialize)]
pub struct GappsConfig {
    /// chrono format of release dates, e.g. `%Y%m%d`.
    pub time_format: String,
    /// Artifact name prefix, e.g. `open_gapps`.
    pub prefix: String,
    #[serde(default = "default_renew_period")]
    pub renew_period: u64,
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    /// `%s` template rendered with the path relative to `local_path`.
    #[serde(default)]
    pub local_url: Option<String>,
    #[serde(default)]
    pub local_host: Option<String>,
    /// `%s` template rendered with the package name, used as the PUT target.
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default)]
    pub remote_host: Option<String>,
}

impl GappsConfig {
    pub fn renew_period(&self) -> Duration {
        Duration::from_secs(self.renew_period)
    }
}

fn default_renew_period() -> u64 {
    60
}

#[derive(Debug, Deserialize)]
pub struct GithubConfig {
    /// Owner of the per-platform release repositories.
    pub repo: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct TelegramConfig {
    pub token: String,
    #[serde(default = "default_telegram_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub debug: bool,
}

fn default_telegram_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize)]
pub struct Commands {
    pub start: String,
    pub help: String,
    pub mirror: String,
}

#[derive(Debug, Deserialize)]
pub struct Messages {
    pub hello: String,
    pub help: String,
    pub mirror: MirrorMessages,
    pub errors: ErrorMessages,
}

#[derive(Debug, Deserialize)]
pub struct MirrorMessages {
    pub in_progress: String,
    pub found: String,
    pub not_found: String,
    pub missing: String,
    pub ok: String,
    pub fail: String,
}

#[derive(Debug, Deserialize)]
pub struct ErrorMessages {
    pub platform: String,
    pub android: String,
    pub variant: String,
    pub date: String,
    pub mirror: String,
    pub unknown: String,
}

impl Config {
    /// Loads `<name>.toml` from the first search path that has it.
    pub fn load(name: &str) -> crate::Result<Config> {
        if name.is_empty() {
            bail!("empty config name");
        }

        let file = format!("{name}.toml");
        let mut candidates = Vec::new();
        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join(".config").join(&file));
        }
        candidates.push(Path::new("/etc").join(&file));
        candidates.push(PathBuf::from(&file));

        let path = candidates
            .iter()
            .find(|p| p.is_file())
            .with_context(|| format!("config file '{file}' not found"))?;
        debug!(path = %path.display(), "reading config");

        let raw = std::fs::read_to_string(path).context("unable to read config")?;
        let cfg: Config = toml::from_str(&raw).context("unable to parse config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.max_downloads == 0 {
            bail!("'max_downloads' should be greater than 0");
        }
        if self.db.timeout == 0 {
            bail!("'db.timeout' should be greater than 0");
        }
        if self.gapps.renew_period == 0 {
            bail!("'gapps.renew_period' should be greater than 0");
        }
        if self.telegram.timeout == 0 {
            bail!("'telegram.timeout' should be greater than 0");
        }

        for (key, value) in [
            ("gapps.time_format", &self.gapps.time_format),
            ("gapps.prefix", &self.gapps.prefix),
            ("github.repo", &self.github.repo),
            ("telegram.token", &self.telegram.token),
            ("commands.start", &self.commands.start),
            ("commands.help", &self.commands.help),
            ("commands.mirror", &self.commands.mirror),
        ] {
            if value.is_empty() {
                bail!("empty config value '{key}'");
            }
        }

        let gapps = &self.gapps;
        if gapps.local_url.is_none() && gapps.remote_url.is_none() {
            bail!("at least one of 'gapps.local_url' and 'gapps.remote_url' must be set");
        }
        if gapps.local_url.is_some() && (gapps.local_path.is_none() || gapps.local_host.is_none()) {
            bail!("'gapps.local_url' requires 'gapps.local_path' and 'gapps.local_host'");
        }
        if gapps.remote_url.is_some() && gapps.remote_host.is_none() {
            bail!("'gapps.remote_url' requires 'gapps.remote_host'");
        }
        for (key, template) in [
            ("gapps.local_url", &gapps.local_url),
            ("gapps.remote_url", &gapps.remote_url),
        ] {
            if let Some(template) = template {
                if !template.contains("%s") {
                    bail!("'{key}' must contain a '%s' placeholder");
                }
            }
        }

        Ok(())
    }
}
