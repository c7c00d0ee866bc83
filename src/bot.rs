//! Bot command layer: dispatches chat commands onto the package index.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::NaiveDate;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::gapps::{self, Android, ParseError, Platform, Variant};
use crate::github;
use crate::net::DownloadQueue;
use crate::storage::{GlobalStorage, Storage};
use crate::telegram::{Api, Message, Update};
use crate::CURRENT_STORAGE_KEY;

/// A mirror job in flight, for deduping concurrent requests of one package.
type MirrorKey = (Platform, Android, Variant, String);

pub struct Bot {
    offset: i64,
    handler: Handler,
}

/// Everything a spawned command handler needs, cheap to clone.
#[derive(Clone)]
struct Handler {
    api: Arc<Api>,
    cfg: Arc<Config>,
    dq: Arc<DownloadQueue>,
    gs: Arc<GlobalStorage>,
    gh: Arc<github::Client>,
    mirroring: Arc<Mutex<HashSet<MirrorKey>>>,
}

impl Bot {
    pub async fn new(
        cfg: Arc<Config>,
        dq: Arc<DownloadQueue>,
        gs: Arc<GlobalStorage>,
        gh: Arc<github::Client>,
    ) -> crate::Result<Self> {
        let api = Arc::new(Api::new(
            &cfg.telegram.token,
            cfg.telegram.timeout,
            cfg.telegram.debug,
        )?);
        let me = api
            .get_me()
            .await
            .context("unable to connect to Telegram")?;
        info!(username = %me.username, "authorized");

        Ok(Bot {
            offset: 0,
            handler: Handler {
                api,
                cfg,
                dq,
                gs,
                gh,
                mirroring: Arc::new(Mutex::new(HashSet::new())),
            },
        })
    }

    /// One long-poll round; every received update is dispatched onto its own
    /// task so a slow mirror cannot stall the poll loop.
    pub async fn poll(&mut self) -> crate::Result<()> {
        let updates = self.handler.api.get_updates(self.offset).await?;
        for update in updates {
            self.offset = self.offset.max(update.update_id + 1);
            self.dispatch(update);
        }
        Ok(())
    }

    fn dispatch(&self, update: Update) {
        let Some(msg) = update.message else { return };
        if msg.text.is_empty() {
            return;
        }

        let commands = &self.handler.cfg.commands;
        let handler = self.handler.clone();
        if msg.text.starts_with(&commands.mirror) {
            debug!(chat_id = msg.chat.id, "got mirror request");
            tokio::spawn(async move { handler.mirror(msg).await });
        } else if msg.text.starts_with(&commands.help) {
            debug!(chat_id = msg.chat.id, "got help request");
            tokio::spawn(async move { handler.help(msg).await });
        } else if msg.text.starts_with(&commands.start) {
            tokio::spawn(async move { handler.hello(msg).await });
        }
    }
}

impl Handler {
    async fn hello(&self, msg: Message) {
        self.reply(msg.chat.id, Some(msg.message_id), &self.cfg.messages.hello)
            .await;
    }

    async fn help(&self, msg: Message) {
        self.reply(msg.chat.id, Some(msg.message_id), &self.cfg.messages.help)
            .await;
    }

    async fn mirror(&self, msg: Message) {
        let messages = &self.cfg.messages;

        // Dots are stripped up front so `9.0` and `90` parse alike.
        let cmd = msg.text.replace('.', "");
        let parts: Vec<&str> = cmd.split_whitespace().collect();
        if parts.len() < 2 {
            self.reply(msg.chat.id, Some(msg.message_id), &messages.errors.mirror)
                .await;
            return;
        }

        let (platform, android, variant, date) =
            match parse_cmd(&parts[1..], &self.cfg.gapps.time_format) {
                Ok(parsed) => parsed,
                Err(err) => {
                    let text = match err {
                        ParseError::Platform(_) => &messages.errors.platform,
                        ParseError::Android(_) => &messages.errors.android,
                        ParseError::Variant(_) => &messages.errors.variant,
                        ParseError::Date(_) => &messages.errors.date,
                        _ => &messages.errors.mirror,
                    };
                    self.reply(msg.chat.id, Some(msg.message_id), text).await;
                    return;
                }
            };

        // look up the package storage, building it on demand
        let storage = match self.gs.get(&date) {
            Some(storage) => storage,
            None => {
                self.reply(
                    msg.chat.id,
                    Some(msg.message_id),
                    &messages.mirror.in_progress,
                )
                .await;

                match Storage::fetch(&self.gh, &self.dq, &self.cfg, &date).await {
                    Ok(storage) => {
                        if !storage.date().is_empty() {
                            self.gs.add(&storage.date(), Arc::clone(&storage));
                        }
                        storage
                    }
                    Err(err) => {
                        error!(%date, error = %err, "no storage available");
                        self.reply(msg.chat.id, Some(msg.message_id), &messages.errors.unknown)
                            .await;
                        return;
                    }
                }
            }
        };

        // look up the package, refreshing the storage once if it is missing
        let pkg = match storage.get(platform, android, variant) {
            Some(pkg) => Some(pkg),
            None => match Storage::fetch(&self.gh, &self.dq, &self.cfg, &date).await {
                Ok(fresh) => {
                    storage.merge_from(&fresh);
                    if let Err(err) = storage.save(self.gs.cache()) {
                        warn!(error = %err, "unable to save the merged storage");
                    }
                    storage.get(platform, android, variant)
                }
                Err(err) => {
                    warn!(error = %err, "unable to refresh the storage");
                    None
                }
            },
        };
        let Some(mut pkg) = pkg else {
            self.reply(msg.chat.id, Some(msg.message_id), &messages.mirror.not_found)
                .await;
            return;
        };

        // create the mirrors unless some are already in place
        let text = if pkg.local_url.is_empty() && pkg.remote_url.is_empty() {
            let key = (platform, android, variant, date.clone());
            if !self.mirroring.lock().unwrap().insert(key.clone()) {
                // Another request is already mirroring this package.
                self.reply(
                    msg.chat.id,
                    Some(msg.message_id),
                    &messages.mirror.in_progress,
                )
                .await;
                return;
            }

            let found = render(
                &messages.mirror.found,
                &[
                    pkg.name.as_str(),
                    pkg.origin_url.as_str(),
                    pkg.md5.as_str(),
                    messages.mirror.missing.as_str(),
                ],
            );
            self.reply(msg.chat.id, None, &found).await;
            debug!(package = %pkg.name, "creating a mirror");

            let result = pkg.create_mirror(&self.dq, &self.cfg.gapps).await;
            self.mirroring.lock().unwrap().remove(&key);

            if let Err(err) = result {
                error!(package = %pkg.name, error = %format!("{err:#}"), "unable to create mirror");
                self.reply(msg.chat.id, Some(msg.message_id), &messages.mirror.fail)
                    .await;
                return;
            }

            storage.update(pkg.clone());
            if let Err(err) = storage.save(self.gs.cache()) {
                error!(error = %err, "unable to save storage");
            }
            messages.mirror.ok.clone()
        } else {
            render(
                &messages.mirror.found,
                &[
                    pkg.name.as_str(),
                    pkg.origin_url.as_str(),
                    pkg.md5.as_str(),
                    messages.mirror.ok.as_str(),
                ],
            )
        };

        let mut links = Vec::new();
        if !pkg.local_url.is_empty() {
            if let Some(host) = self.cfg.gapps.local_host.as_deref() {
                links.push((host, pkg.local_url.as_str()));
            }
        }
        if !pkg.remote_url.is_empty() {
            if let Some(host) = self.cfg.gapps.remote_host.as_deref() {
                links.push((host, pkg.remote_url.as_str()));
            }
        }

        self.reply(
            msg.chat.id,
            Some(msg.message_id),
            &render(&text, &[mirror_links(&links).as_str()]),
        )
        .await;
        info!(package = %pkg.name, "sent mirror");
    }

    async fn reply(&self, chat_id: i64, reply_to: Option<i64>, text: &str) {
        debug!(chat_id, "sending reply");
        if let Err(err) = self.api.send_message(chat_id, reply_to, text).await {
            error!(error = %err, "unable to send the message");
        }
    }
}

/// Parses `<platform> <android> <variant> [<date>]` tokens. Without a date
/// the lookup targets the newest known release.
fn parse_cmd(
    parts: &[&str],
    time_format: &str,
) -> Result<(Platform, Android, Variant, String), ParseError> {
    match parts.len() {
        3 => {
            let (platform, android, variant) = gapps::parse_package_parts(parts)?;
            Ok((platform, android, variant, CURRENT_STORAGE_KEY.to_string()))
        }
        4 => {
            if NaiveDate::parse_from_str(parts[3], time_format).is_err() {
                return Err(ParseError::Date(parts[3].to_string()));
            }
            let (platform, android, variant) = gapps::parse_package_parts(&parts[..3])?;
            Ok((platform, android, variant, parts[3].to_string()))
        }
        _ => Err(ParseError::Usage(parts.join(" "))),
    }
}

/// Renders `(host, url)` pairs as Markdown links joined by ` | `.
fn mirror_links(links: &[(&str, &str)]) -> String {
    links
        .iter()
        .map(|(host, url)| format!("[{host}]({url})"))
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Fills `%s` placeholders in a message template left to right. Surplus
/// placeholders stay empty; surplus arguments are dropped.
fn render(template: &str, args: &[&str]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut pieces = template.split("%s");
    if let Some(first) = pieces.next() {
        out.push_str(first);
    }

    let mut args = args.iter();
    for piece in pieces {
        if let Some(arg) = args.next() {
            out.push_str(arg);
        }
        out.push_str(piece);
    }
    out
}
