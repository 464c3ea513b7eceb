use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

/// Delivery timeout, failures never affect the core.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

// Discord embed colours.
const COLOR_GREEN: u32 = 0x2ecc71;
const COLOR_YELLOW: u32 = 0xf1c40f;
const COLOR_RED: u32 = 0xe74c3c;

/// Fire-and-forget webhook notifier for server lifecycle events.
///
/// Discord webhook URLs get a rich embed, anything else a generic JSON
/// document.
#[derive(Debug)]
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
    label: String,
    is_discord: bool,
}

impl WebhookNotifier {
    pub fn new(url: &str, label: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(SEND_TIMEOUT).build()?;
        Ok(Self {
            http,
            url: url.to_string(),
            label: label.to_string(),
            is_discord: is_discord_url(url),
        })
    }

    /// Notify that a server was started (wake-up).
    pub fn notify_started(self: &Arc<Self>, server: &str, player: Option<String>) {
        let mut description = format!("🚀 **{}** is starting up!", server);
        if let Some(player) = player {
            description.push_str(&format!("\nTriggered by player **{}**", player));
        }
        self.dispatch("Server Starting", description, COLOR_GREEN, server);
    }

    /// Notify that a server was stopped after sitting idle.
    pub fn notify_stopped(self: &Arc<Self>, server: &str, idle: Duration) {
        let mut description = format!("💤 **{}** was shut down due to inactivity.", server);
        if !idle.is_zero() {
            let minutes = idle.as_secs() / 60;
            description.push_str(&format!(
                "\nIdle for {} minute{}",
                minutes,
                if minutes == 1 { "" } else { "s" }
            ));
        }
        self.dispatch("Server Stopped", description, COLOR_YELLOW, server);
    }

    /// Notify that a server crashed.
    pub fn notify_crashed(self: &Arc<Self>, server: &str) {
        self.dispatch(
            "Server Crashed",
            format!("❌ **{}** has crashed!", server),
            COLOR_RED,
            server,
        );
    }

    /// Send from a spawned task so delivery never blocks the caller.
    fn dispatch(self: &Arc<Self>, title: &str, description: String, color: u32, server: &str) {
        let this = self.clone();
        let title = title.to_string();
        let server = server.to_string();

        tokio::spawn(async move {
            let payload = this.payload(&title, &description, color, &server);
            match this.send(&payload).await {
                Ok(()) => {
                    info!(
                        target: "craftnap::webhook",
                        "Webhook sent: {} for '{}'",
                        title,
                        server
                    );
                }
                Err(err) => {
                    warn!(
                        target: "craftnap::webhook",
                        "Failed to send webhook notification for '{}': {}",
                        server,
                        err
                    );
                }
            }
        });
    }

    fn payload(&self, title: &str, description: &str, color: u32, server: &str) -> Value {
        if self.is_discord {
            let mut embed = json!({
                "title": title,
                "description": description,
                "color": color,
                "timestamp": Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            });
            if !self.label.is_empty() {
                embed["footer"] = json!({ "text": self.label });
            }
            json!({ "embeds": [embed] })
        } else {
            json!({
                "event": title.to_lowercase().replace(' ', "_"),
                "server": server,
                "message": description,
                "timestamp": Utc::now().timestamp(),
            })
        }
    }

    async fn send(&self, payload: &Value) -> Result<(), reqwest::Error> {
        self.http
            .post(&self.url)
            .json(payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

fn is_discord_url(url: &str) -> bool {
    url.contains("discord.com/api/webhooks") || url.contains("discordapp.com/api/webhooks")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discord_url_detection() {
        assert!(is_discord_url("https://discord.com/api/webhooks/1/abc"));
        assert!(is_discord_url("https://discordapp.com/api/webhooks/1/abc"));
        assert!(!is_discord_url("https://hooks.example.org/notify"));
    }

    #[test]
    fn discord_payload_is_an_embed() {
        let notifier =
            WebhookNotifier::new("https://discord.com/api/webhooks/1/abc", "My Server").unwrap();
        let payload = notifier.payload("Server Starting", "desc", COLOR_GREEN, "survival");

        let embed = &payload["embeds"][0];
        assert_eq!(embed["title"], "Server Starting");
        assert_eq!(embed["color"], COLOR_GREEN);
        assert_eq!(embed["footer"]["text"], "My Server");
        assert!(embed["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn generic_payload_is_flat_json() {
        let notifier = WebhookNotifier::new("https://hooks.example.org/notify", "").unwrap();
        let payload = notifier.payload("Server Stopped", "desc", COLOR_YELLOW, "survival");

        assert_eq!(payload["event"], "server_stopped");
        assert_eq!(payload["server"], "survival");
        assert_eq!(payload["message"], "desc");
        assert!(payload["timestamp"].is_i64());
        assert!(payload.get("embeds").is_none());
    }

    #[test]
    fn discord_payload_without_label_has_no_footer() {
        let notifier =
            WebhookNotifier::new("https://discord.com/api/webhooks/1/abc", "").unwrap();
        let payload = notifier.payload("Server Crashed", "desc", COLOR_RED, "s");
        assert!(payload["embeds"][0].get("footer").is_none());
    }
}
