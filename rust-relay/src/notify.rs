//! Chat notifications for newly confirmed subscribers.
//!
//! Discord and Slack are posted to concurrently. Each channel logs its own
//! failure and never affects the other or the HTTP response.

use reqwest::Client;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::now_rfc3339;
use crate::event::{SubscriberEvent, SubscriberStatus};

const TITLE: &str = "🎉 New SparkLoop Subscriber!";
const DISCORD_BLURPLE: u32 = 0x5865F2;

/// Which chat channel a message is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Discord,
    Slack,
}

impl Channel {
    fn as_str(&self) -> &'static str {
        match self {
            Channel::Discord => "discord",
            Channel::Slack => "slack",
        }
    }
}

/// Posts confirmation messages to the configured chat webhooks.
#[derive(Clone)]
pub struct Notifier {
    client: Client,
    discord_webhook_url: Option<String>,
    slack_webhook_url: Option<String>,
}

impl Notifier {
    pub fn new(
        client: Client,
        discord_webhook_url: Option<String>,
        slack_webhook_url: Option<String>,
    ) -> Self {
        Self {
            client,
            discord_webhook_url,
            slack_webhook_url,
        }
    }

    /// Notify every configured channel about a confirmed subscriber.
    ///
    /// Other statuses are ignored. Never fails.
    pub async fn notify(&self, event: &SubscriberEvent, sync_result: &Value) {
        if event.status() != SubscriberStatus::Confirmed {
            return;
        }

        let discord = async {
            if let Some(url) = &self.discord_webhook_url {
                self.post(Channel::Discord, url, &discord_message(event, sync_result))
                    .await;
            }
        };
        let slack = async {
            if let Some(url) = &self.slack_webhook_url {
                self.post(Channel::Slack, url, &slack_message(event, sync_result))
                    .await;
            }
        };

        futures::join!(discord, slack);
    }

    async fn post(&self, channel: Channel, url: &str, message: &Value) {
        match self.client.post(url).json(message).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(channel = channel.as_str(), status_code = resp.status().as_u16(), "notification_sent");
            }
            Ok(resp) => {
                warn!(
                    channel = channel.as_str(),
                    status_code = resp.status().as_u16(),
                    "notification_rejected"
                );
            }
            Err(e) => {
                warn!(
                    channel = channel.as_str(),
                    error = %e,
                    is_timeout = e.is_timeout(),
                    "notification_failed"
                );
            }
        }
    }
}

fn subscriber_str<'a>(sync_result: &'a Value, field: &str) -> Option<&'a str> {
    sync_result
        .get("subscriber")
        .and_then(|s| s.get(field))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Discord embed payload.
pub fn discord_message(event: &SubscriberEvent, sync_result: &Value) -> Value {
    let mut fields = vec![
        json!({ "name": "Email", "value": event.email(), "inline": true }),
        json!({ "name": "Status", "value": "✅ Confirmed", "inline": true }),
        json!({
            "name": "Ref Code",
            "value": subscriber_str(sync_result, "ref_code").unwrap_or("N/A"),
            "inline": true
        }),
        json!({ "name": "Source", "value": event.source_label(), "inline": true }),
        json!({
            "name": "SparkLoop UUID",
            "value": subscriber_str(sync_result, "uuid").unwrap_or("N/A"),
            "inline": true
        }),
    ];

    if let Some(name) = subscriber_str(sync_result, "name") {
        fields.insert(0, json!({ "name": "Name", "value": name, "inline": true }));
    }

    json!({
        "embeds": [{
            "title": TITLE,
            "color": DISCORD_BLURPLE,
            "fields": fields,
            "timestamp": now_rfc3339(),
            "footer": { "text": "SparkLoop Integration" }
        }]
    })
}

/// Slack Block Kit payload.
pub fn slack_message(event: &SubscriberEvent, sync_result: &Value) -> Value {
    let mrkdwn = |label: &str, value: &str| json!({ "type": "mrkdwn", "text": format!("*{}:*\n{}", label, value) });

    let mut fields = vec![
        mrkdwn("Email", event.email()),
        mrkdwn("Status", "✅ Confirmed"),
        mrkdwn("Ref Code", subscriber_str(sync_result, "ref_code").unwrap_or("N/A")),
        mrkdwn("Source", event.source_label()),
    ];

    if let Some(name) = subscriber_str(sync_result, "name") {
        fields.insert(0, mrkdwn("Name", name));
    }

    json!({
        "text": TITLE,
        "blocks": [
            { "type": "header", "text": { "type": "plain_text", "text": TITLE } },
            { "type": "section", "fields": fields }
        ]
    })
}
