//! Telegram notices for motivations that reach their threshold.
//!
//! The bus subscriber only pushes onto a flume queue; a background task
//! drains it and calls the Bot API `sendMessage`, retrying transient
//! failures with backoff.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use tokio::task::JoinHandle;

use crate::config::TelegramConfig;
use crate::events::{DomainEvent, EventBus, EventKind};
use crate::needs::NeedType;
use crate::retry::{retry_with_backoff, RetryPolicy};

/// Telegram enforces a 4096-character limit per message.
pub const MAX_MESSAGE_CHARS: usize = 4096;

#[derive(Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MotivationNotice {
    pub character_id: i64,
    pub motivation_id: String,
    pub related_need: NeedType,
    pub value: f64,
    pub description: String,
}

impl MotivationNotice {
    pub fn from_event(event: &DomainEvent) -> Option<Self> {
        match event {
            DomainEvent::MotivationThresholdReached {
                character_id,
                motivation_id,
                related_need,
                value,
                description,
                ..
            } => Some(Self {
                character_id: *character_id,
                motivation_id: motivation_id.clone(),
                related_need: *related_need,
                value: *value,
                description: description.clone(),
            }),
            _ => None,
        }
    }

    pub fn render(&self) -> String {
        format!(
            "Character {} is motivated ({}, {:.0}/100)\n{}",
            self.character_id, self.related_need, self.value, self.description
        )
    }
}

/// Cut `text` to at most `max_chars` characters on a char boundary.
pub fn truncate_message(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}

pub struct TelegramNotifier {
    client: reqwest::Client,
    api_base: String,
    chat_id: i64,
    retry: RetryPolicy,
}

impl TelegramNotifier {
    /// Build a notifier, or `None` when no token or chat is configured.
    pub fn from_config(config: &TelegramConfig, retry: RetryPolicy) -> Result<Option<Self>> {
        let (Some(token), Some(chat_id)) = (config.bot_token.as_deref(), config.chat_id) else {
            return Ok(None);
        };
        let token = token.trim();
        if token.is_empty() {
            return Ok(None);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .context("Failed to build Telegram HTTP client")?;

        Ok(Some(Self {
            client,
            api_base: format!("{}/bot{}", config.api_base.trim_end_matches('/'), token),
            chat_id,
            retry,
        }))
    }

    pub async fn send_message(&self, text: &str) -> Result<()> {
        let url = format!("{}/sendMessage", self.api_base);
        let payload = serde_json::json!({
            "chat_id": self.chat_id,
            "text": truncate_message(text, MAX_MESSAGE_CHARS),
        });

        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .context("Telegram sendMessage request failed")?;
        let status = resp.status();
        if !status.is_success() {
            bail!("Telegram sendMessage failed: HTTP {}", status);
        }

        let body: TelegramResponse = resp
            .json()
            .await
            .context("Failed to parse Telegram sendMessage response")?;
        if !body.ok {
            bail!(
                "Telegram API returned ok=false: {}",
                body.description.unwrap_or_default()
            );
        }
        tracing::debug!("Telegram: sent notice to chat {}", self.chat_id);
        Ok(())
    }

    /// Subscribe to threshold events and start the delivery task.
    pub fn spawn(self, bus: &EventBus) -> JoinHandle<()> {
        let (tx, rx) = flume::unbounded::<MotivationNotice>();

        bus.subscribe(EventKind::MotivationThresholdReached, "telegram", move |event| {
            if let Some(notice) = MotivationNotice::from_event(event) {
                tx.send(notice)
                    .map_err(|_| anyhow!("Telegram notice queue is closed"))?;
            }
            Ok(())
        });

        tracing::info!("Telegram notifier active (chat {})", self.chat_id);
        tokio::spawn(async move {
            while let Ok(notice) = rx.recv_async().await {
                let text = notice.render();
                let sent = retry_with_backoff(&self.retry, "Telegram sendMessage", || {
                    self.send_message(&text)
                })
                .await;
                if let Err(e) = sent {
                    tracing::error!(
                        "Telegram: dropping notice for motivation {}: {:#}",
                        notice.motivation_id,
                        e
                    );
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn threshold_event() -> DomainEvent {
        DomainEvent::MotivationThresholdReached {
            character_id: 7,
            motivation_id: "social_connection_7_1700000000000_a1b2c3d4".to_string(),
            related_need: NeedType::SocialConnection,
            value: 72.4,
            threshold: 70.0,
            description: "Wants to reach out and talk to someone (need at 75%)".to_string(),
        }
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            factor: 2.0,
            max_delay: Duration::from_millis(5),
        }
    }

    /// Minimal HTTP/1.1 responder: answers each connection with the next
    /// scripted status and records request bodies.
    async fn scripted_server(statuses: Vec<u16>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let sink = bodies.clone();

        tokio::spawn(async move {
            for status in statuses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    let n = socket.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    let text = String::from_utf8_lossy(&buf).to_string();
                    if let Some(split) = text.find("\r\n\r\n") {
                        let length = text[..split]
                            .lines()
                            .find_map(|line| {
                                let lower = line.to_ascii_lowercase();
                                lower
                                    .strip_prefix("content-length:")
                                    .and_then(|v| v.trim().parse::<usize>().ok())
                            })
                            .unwrap_or(0);
                        if buf.len() >= split + 4 + length {
                            sink.lock().unwrap().push(text[split + 4..].to_string());
                            break;
                        }
                    }
                }

                let body = if status == 200 {
                    r#"{"ok":true,"result":{}}"#
                } else {
                    r#"{"ok":false,"description":"try later"}"#
                };
                let response = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{}", addr), bodies)
    }

    fn config_for(api_base: &str) -> TelegramConfig {
        TelegramConfig {
            bot_token: Some("123:abc".to_string()),
            chat_id: Some(42),
            api_base: api_base.to_string(),
            timeout_secs: 5,
        }
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_message("short", 10), "short");
        assert_eq!(truncate_message("héllo wörld", 5), "héllo");
        let long = "ж".repeat(MAX_MESSAGE_CHARS + 10);
        assert_eq!(
            truncate_message(&long, MAX_MESSAGE_CHARS).chars().count(),
            MAX_MESSAGE_CHARS
        );
    }

    #[test]
    fn notices_come_only_from_threshold_events() {
        let notice = MotivationNotice::from_event(&threshold_event()).expect("notice");
        assert_eq!(notice.character_id, 7);
        assert!(notice.render().contains("social_connection, 72/100"));

        let other = DomainEvent::NeedUnblocked {
            character_id: 7,
            need_type: NeedType::Fun,
        };
        assert!(MotivationNotice::from_event(&other).is_none());
    }

    #[test]
    fn notifier_requires_token_and_chat() {
        let mut config = TelegramConfig::default();
        assert!(TelegramNotifier::from_config(&config, quick_retry())
            .expect("build")
            .is_none());
        config.bot_token = Some("  ".to_string());
        config.chat_id = Some(1);
        assert!(TelegramNotifier::from_config(&config, quick_retry())
            .expect("build")
            .is_none());
    }

    #[tokio::test]
    async fn threshold_event_is_delivered_after_a_retry() {
        let (api_base, bodies) = scripted_server(vec![500, 200]).await;
        let notifier = TelegramNotifier::from_config(&config_for(&api_base), quick_retry())
            .expect("build")
            .expect("enabled");
        let bus = EventBus::new();
        let _task = notifier.spawn(&bus);

        assert_eq!(bus.publish(threshold_event()), 1);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while bodies.lock().unwrap().len() < 2 {
            assert!(tokio::time::Instant::now() < deadline, "notice not delivered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let bodies = bodies.lock().unwrap();
        let payload: serde_json::Value = serde_json::from_str(&bodies[1]).expect("json body");
        assert_eq!(payload["chat_id"], 42);
        assert!(payload["text"]
            .as_str()
            .unwrap_or_default()
            .contains("talk to someone"));
    }
}
