use std::time::Duration;

use alert_engine::{AlertPayload, LoggingNotifier, NotificationDispatcher, NotificationError};
use async_trait::async_trait;
use domain::NotificationChannel;
use reqwest::{Client, Url};
use serde_json::json;
use tracing::debug;

#[derive(Clone, Debug)]
struct TelegramBot {
    api_base: String,
    token: String,
}

/// Delivers webhooks and Telegram messages over HTTP. Email goes to the log
/// stream, where the mail relay picks it up.
#[derive(Clone, Debug)]
pub struct HttpNotifier {
    client: Client,
    telegram: Option<TelegramBot>,
    fallback: LoggingNotifier,
}

impl HttpNotifier {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            telegram: None,
            fallback: LoggingNotifier,
        })
    }

    pub fn with_telegram(mut self, api_base: String, token: Option<String>) -> Self {
        self.telegram = token
            .filter(|t| !t.trim().is_empty())
            .map(|token| TelegramBot {
                api_base: api_base.trim_end_matches('/').to_string(),
                token,
            });
        self
    }

    async fn post(&self, url: &str, body: &serde_json::Value) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|err| NotificationError::Transport(err.without_url().to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotificationError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}

/// Accepts absolute http(s) URLs with a host.
fn webhook_url(destination: &str) -> Result<Url, NotificationError> {
    let invalid = || NotificationError::InvalidDestination(destination.to_string());
    let url = Url::parse(destination).map_err(|_| invalid())?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some_and(|h| !h.is_empty()) => Ok(url),
        _ => Err(invalid()),
    }
}

#[async_trait]
impl NotificationDispatcher for HttpNotifier {
    async fn send(
        &self,
        channel: NotificationChannel,
        destination: &str,
        payload: &AlertPayload,
    ) -> Result<(), NotificationError> {
        let destination = destination.trim();
        if destination.is_empty() {
            return Err(NotificationError::InvalidDestination("empty".to_string()));
        }
        match channel {
            NotificationChannel::Webhook => {
                let url = webhook_url(destination)?;
                let body = serde_json::to_value(payload)
                    .map_err(|err| NotificationError::Transport(err.to_string()))?;
                self.post(url.as_str(), &body).await?;
                debug!(alert_id = %payload.alert_id, "webhook delivered");
                Ok(())
            }
            NotificationChannel::Telegram => {
                let bot = self
                    .telegram
                    .as_ref()
                    .ok_or(NotificationError::ChannelUnavailable(channel))?;
                let url = format!("{}/bot{}/sendMessage", bot.api_base, bot.token);
                let body = json!({ "chat_id": destination, "text": payload.message });
                self.post(&url, &body).await?;
                debug!(alert_id = %payload.alert_id, "telegram message delivered");
                Ok(())
            }
            NotificationChannel::Email => self.fallback.send(channel, destination, payload).await,
        }
    }
}
