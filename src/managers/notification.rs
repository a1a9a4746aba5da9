//! Discord webhook notification manager
//!
//! Sends one embed per finished job, rate limited per job and event through a
//! small JSON cache file.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::{expand_tilde, NotificationConfig, NotifyEvent};
use crate::report::{JobReport, JobStatus};

/// Notification manager for sending Discord webhooks
pub struct NotificationManager {
    config: NotificationConfig,
    cache_path: PathBuf,
    client: reqwest::Client,
}

/// Discord embed color codes (decimal)
#[derive(Debug, Clone, Copy)]
pub enum NotificationColor {
    /// Red - for failures
    Failure = 15158332, // #E74C3C
    /// Orange - for partial failures
    Partial = 15105570, // #E67E22
    /// Green - for success
    Success = 3066993, // #2ECC71
}

impl NotificationColor {
    fn as_decimal(&self) -> u32 {
        *self as u32
    }
}

/// Discord webhook payload
#[derive(Debug, Serialize)]
struct DiscordPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    embeds: Vec<DiscordEmbed>,
}

#[derive(Debug, Serialize)]
struct DiscordEmbed {
    title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    color: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<DiscordField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<DiscordFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
}

#[derive(Debug, Serialize)]
struct DiscordField {
    name: String,
    value: String,
    inline: bool,
}

#[derive(Debug, Serialize)]
struct DiscordFooter {
    text: String,
}

/// Rate limit cache entry
#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    /// Unix timestamp of last notification
    last_sent: i64,
    /// Count of notifications sent in current window
    count: u32,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct NotificationCache {
    entries: HashMap<String, CacheEntry>,
}

/// Event a job outcome maps to
pub fn event_for(status: JobStatus) -> NotifyEvent {
    match status {
        JobStatus::AllSucceeded => NotifyEvent::Success,
        JobStatus::PartialFailure => NotifyEvent::Partial,
        JobStatus::AllFailed => NotifyEvent::Failure,
    }
}

impl NotificationManager {
    pub fn new(config: NotificationConfig) -> Result<Self> {
        let cache_path = expand_tilde(&config.cache_file);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            config,
            cache_path,
            client,
        })
    }

    /// Whether `event` should be sent, given the job's own event list
    /// (empty means use the global list)
    pub fn is_enabled(&self, event: NotifyEvent, job_events: &[NotifyEvent]) -> bool {
        if self.config.discord_webhook_url.is_empty() {
            return false;
        }
        if job_events.is_empty() {
            self.config.notify_on.contains(&event)
        } else {
            job_events.contains(&event)
        }
    }

    /// Send a notification for a finished job if enabled and not rate-limited
    pub async fn notify(&self, report: &JobReport, job_events: &[NotifyEvent]) -> Result<()> {
        let event = event_for(report.status);
        if !self.is_enabled(event, job_events) {
            debug!("Notification for {} not enabled, skipping", event.as_str());
            return Ok(());
        }

        let cache_key = format!("{}:{}", report.job, event.as_str());
        if self.is_rate_limited(&cache_key)? {
            debug!("Notification rate-limited for key: {}", cache_key);
            return Ok(());
        }

        let payload = build_payload(report);
        self.send_webhook(&payload).await?;
        self.update_cache(&cache_key)?;

        info!("Sent {} notification for job '{}'", event.as_str(), report.job);
        Ok(())
    }

    async fn send_webhook(&self, payload: &DiscordPayload) -> Result<()> {
        let response = self
            .client
            .post(&self.config.discord_webhook_url)
            .json(payload)
            .send()
            .await
            .context("Failed to send Discord webhook")?;

        let status = response.status();
        if status.is_success() {
            debug!("Discord webhook sent successfully");
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            error!("Discord webhook failed with status {}: {}", status, body);
            anyhow::bail!("Discord webhook failed with status {}: {}", status, body)
        }
    }

    fn is_rate_limited(&self, cache_key: &str) -> Result<bool> {
        let cache = self.load_cache()?;
        let window = (self.config.rate_limit_minutes * 60) as i64;

        Ok(cache
            .entries
            .get(cache_key)
            .map_or(false, |entry| Utc::now().timestamp() - entry.last_sent < window))
    }

    fn update_cache(&self, cache_key: &str) -> Result<()> {
        let mut cache = self.load_cache()?;
        let now = Utc::now().timestamp();

        let count = cache.entries.get(cache_key).map_or(1, |e| e.count + 1);
        cache.entries.insert(
            cache_key.to_string(),
            CacheEntry {
                last_sent: now,
                count,
            },
        );

        // entries older than a day are irrelevant to any window
        cache.entries.retain(|_, v| v.last_sent > now - 86_400);

        self.save_cache(&cache)
    }

    fn load_cache(&self) -> Result<NotificationCache> {
        if !self.cache_path.exists() {
            return Ok(NotificationCache::default());
        }

        let content = fs::read_to_string(&self.cache_path)
            .context("Failed to read notification cache")?;

        serde_json::from_str(&content).context("Failed to parse notification cache")
    }

    fn save_cache(&self, cache: &NotificationCache) -> Result<()> {
        if let Some(parent) = self.cache_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(cache)
            .context("Failed to serialize notification cache")?;

        fs::write(&self.cache_path, content).context("Failed to write notification cache")?;

        Ok(())
    }
}

fn build_payload(report: &JobReport) -> DiscordPayload {
    let (color, emoji) = match report.status {
        JobStatus::AllSucceeded => (NotificationColor::Success, "\u{2705}"),
        JobStatus::PartialFailure => (NotificationColor::Partial, "\u{26A0}\u{FE0F}"),
        JobStatus::AllFailed => (NotificationColor::Failure, "\u{274C}"),
    };

    let mut fields = vec![
        DiscordField {
            name: "Job".to_string(),
            value: report.job.clone(),
            inline: true,
        },
        DiscordField {
            name: "Duration".to_string(),
            value: format_duration(report.duration().num_seconds().max(0) as u64),
            inline: true,
        },
    ];

    if let Some(artifact) = &report.artifact {
        fields.push(DiscordField {
            name: "Artifact".to_string(),
            value: format!("{} ({} bytes)", artifact.name, artifact.size_bytes),
            inline: false,
        });
    }

    for result in &report.destinations {
        let value = match &result.error {
            Some(err) => format!("{}: {}", result.state, truncate(&err.to_string(), 500)),
            None => result.state.to_string(),
        };
        fields.push(DiscordField {
            name: result.destination.clone(),
            value,
            inline: false,
        });
    }

    let description = match &report.fatal_error {
        Some(err) => format!("Backup aborted: {}", truncate(&err.to_string(), 500)),
        None => format!("Backup finished: {}", report.status),
    };

    DiscordPayload {
        username: Some("db-backup".to_string()),
        embeds: vec![DiscordEmbed {
            title: format!("{} db-backup: {}", emoji, report.job),
            description: Some(description),
            color: color.as_decimal(),
            fields,
            footer: Some(DiscordFooter {
                text: "db-backup".to_string(),
            }),
            timestamp: Some(report.finished_at.format("%Y-%m-%dT%H:%M:%SZ").to_string()),
        }],
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", cut)
}

/// Format duration in human-readable form
fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        let minutes = seconds / 60;
        let secs = seconds % 60;
        if secs == 0 {
            format!("{}m", minutes)
        } else {
            format!("{}m {}s", minutes, secs)
        }
    } else {
        let hours = seconds / 3600;
        let minutes = (seconds % 3600) / 60;
        if minutes == 0 {
            format!("{}h", hours)
        } else {
            format!("{}h {}m", hours, minutes)
        }
    }
}
