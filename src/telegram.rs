//! Minimal Telegram Bot API transport.
//!
//! Long-polls `getUpdates` and sends Markdown replies with `sendMessage`;
//! nothing else of the API surface is needed here.

use std::time::Duration;

use anyhow::{anyhow, ensure};
use serde::Deserialize;
use tracing::debug;

const API_URL: &str = "https://api.telegram.org";

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

/// One incoming update from the long poll.
#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
}

/// The bot account, as returned by `getMe`.
#[derive(Debug, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub username: String,
}

pub struct Api {
    http: reqwest::Client,
    base: String,
    poll_timeout: u64,
    debug: bool,
}

impl Api {
    pub fn new(token: &str, poll_timeout: u64, debug: bool) -> crate::Result<Self> {
        // The client timeout has to sit above the long-poll window, or every
        // empty poll turns into an error.
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(poll_timeout + 10))
            .build()?;

        Ok(Api {
            http,
            base: format!("{API_URL}/bot{token}"),
            poll_timeout,
            debug,
        })
    }

    /// Identifies the account behind the token.
    pub async fn get_me(&self) -> crate::Result<User> {
        self.call("getMe", &[]).await
    }

    /// Long-polls for updates with ids at or above `offset`.
    pub async fn get_updates(&self, offset: i64) -> crate::Result<Vec<Update>> {
        self.call(
            "getUpdates",
            &[
                ("offset", offset.to_string()),
                ("timeout", self.poll_timeout.to_string()),
            ],
        )
        .await
    }

    /// Sends a Markdown message, optionally as a reply.
    pub async fn send_message(
        &self,
        chat_id: i64,
        reply_to: Option<i64>,
        text: &str,
    ) -> crate::Result<()> {
        let mut params = vec![
            ("chat_id", chat_id.to_string()),
            ("text", text.to_string()),
            ("parse_mode", "Markdown".to_string()),
        ];
        if let Some(message_id) = reply_to {
            params.push(("reply_to_message_id", message_id.to_string()));
        }

        let _: Message = self.call("sendMessage", &params).await?;
        Ok(())
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: &[(&str, String)],
    ) -> crate::Result<T> {
        if self.debug {
            debug!(method, ?params, "telegram call");
        }

        let res = self
            .http
            .post(format!("{}/{method}", self.base))
            .form(params)
            .send()
            .await?;

        let body: ApiResponse<T> = serde_json::from_slice(&res.bytes().await?)?;
        ensure!(
            body.ok,
            "telegram error: {}",
            body.description.unwrap_or_default()
        );
        body.result
            .ok_or_else(|| anyhow!("telegram response is empty"))
    }
}
