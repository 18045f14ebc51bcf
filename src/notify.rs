use std::collections::BTreeMap;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{EmailConfig, HeartbeatConfig};

struct Mailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
    label: String,
}

#[derive(Debug, Clone)]
struct IssueState {
    first_seen: DateTime<Utc>,
    last_sent: Option<DateTime<Utc>>,
    message: String,
}

/// Rate-limited issue notification.
///
/// An issue keyed by (entity, kind) must persist for the configured delay
/// before the first email goes out, and no two emails for the same issue
/// are sent within one delay window. Clearing an issue that previously
/// emailed sends a short recovery note.
pub struct Notifier {
    mailer: Option<Mailer>,
    delay: Duration,
    issues: Mutex<BTreeMap<(String, String), IssueState>>,
}

impl Notifier {
    pub fn new(email: Option<&EmailConfig>, label: &str, delay_mins: u64) -> Result<Self> {
        let mailer = match email {
            Some(cfg) => Some(build_mailer(cfg, label)?),
            None => None,
        };
        Ok(Self {
            mailer,
            delay: Duration::minutes(delay_mins as i64),
            issues: Mutex::new(BTreeMap::new()),
        })
    }

    /// Record that an issue is (still) present. Sends at most one email per
    /// delay window once the issue has persisted that long.
    pub async fn report_issue(&self, entity: &str, kind: &str, message: &str) {
        let now = Utc::now();
        let key = (entity.to_string(), kind.to_string());
        let mut issues = self.issues.lock().await;
        let state = issues.entry(key).or_insert_with(|| IssueState {
            first_seen: now,
            last_sent: None,
            message: message.to_string(),
        });
        state.message = message.to_string();

        let persisted_long_enough = now - state.first_seen >= self.delay;
        let window_clear = state
            .last_sent
            .map(|sent| now - sent >= self.delay)
            .unwrap_or(true);
        if persisted_long_enough && window_clear {
            state.last_sent = Some(now);
            let subject = format!("{entity}: {kind}");
            let body = state.message.clone();
            drop(issues);
            self.send(&subject, &body).await;
        }
    }

    /// The condition is gone. If it had been notified, follow up.
    pub async fn clear_issue(&self, entity: &str, kind: &str) {
        let key = (entity.to_string(), kind.to_string());
        let removed = self.issues.lock().await.remove(&key);
        if let Some(state) = removed {
            if state.last_sent.is_some() {
                info!(entity, kind, "issue cleared");
                self.send(
                    &format!("{entity}: {kind} resolved"),
                    &format!("The condition reported for {entity} has cleared."),
                )
                .await;
            }
        }
    }

    /// Unconditional send, used for startup-recovery notices.
    pub async fn send(&self, subject: &str, body: &str) {
        let Some(mailer) = &self.mailer else {
            debug!(subject, "email disabled, notification suppressed");
            return;
        };
        let message = Message::builder()
            .from(mailer.from.clone())
            .to(mailer.to.clone())
            .subject(format!("[{}] {subject}", mailer.label))
            .body(body.to_string());
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, "failed to build notification email");
                return;
            }
        };
        if let Err(e) = mailer.transport.send(message).await {
            warn!(error = %e, subject, "failed to send notification email");
        }
    }
}

fn build_mailer(cfg: &EmailConfig, label: &str) -> Result<Mailer> {
    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.smtp_host)
        .context("invalid SMTP relay host")?
        .port(cfg.smtp_port);
    if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
        builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
    }
    Ok(Mailer {
        transport: builder.build(),
        from: cfg.from.parse().context("invalid From address")?,
        to: cfg.to.parse().context("invalid To address")?,
        label: label.to_string(),
    })
}

/// Periodic GET against an external liveness monitor.
pub async fn heartbeat_task(cfg: HeartbeatConfig) {
    let client = match reqwest::Client::builder()
        .timeout(StdDuration::from_secs(cfg.timeout_secs))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "heartbeat client build failed, heartbeats disabled");
            return;
        }
    };
    let mut ticker = tokio::time::interval(StdDuration::from_secs(cfg.frequency_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match client.get(&cfg.url).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!("heartbeat acknowledged");
            }
            Ok(resp) => warn!(status = %resp.status(), "heartbeat rejected"),
            Err(e) => warn!(error = %e, "heartbeat failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier() -> Notifier {
        // No mailer: send() is a no-op, which lets the rate-limit logic be
        // observed through the issue table alone.
        Notifier {
            mailer: None,
            delay: Duration::minutes(30),
            issues: Mutex::new(BTreeMap::new()),
        }
    }

    #[tokio::test]
    async fn issue_is_not_sent_before_the_delay() {
        let n = notifier();
        n.report_issue("Amber API", "Connection Error", "down").await;
        let issues = n.issues.lock().await;
        let state = issues
            .get(&("Amber API".to_string(), "Connection Error".to_string()))
            .unwrap();
        assert!(state.last_sent.is_none());
    }

    #[tokio::test]
    async fn persisted_issue_is_sent_once_per_window() {
        let n = notifier();
        n.report_issue("Amber API", "Connection Error", "down").await;
        {
            let mut issues = n.issues.lock().await;
            let state = issues
                .get_mut(&("Amber API".to_string(), "Connection Error".to_string()))
                .unwrap();
            // Backdate the first sighting past the delay.
            state.first_seen = Utc::now() - Duration::hours(1);
        }
        n.report_issue("Amber API", "Connection Error", "still down").await;
        {
            let issues = n.issues.lock().await;
            let state = issues
                .get(&("Amber API".to_string(), "Connection Error".to_string()))
                .unwrap();
            assert!(state.last_sent.is_some());
        }
        // A third report inside the window must not update last_sent.
        let sent_at = {
            let issues = n.issues.lock().await;
            issues
                .get(&("Amber API".to_string(), "Connection Error".to_string()))
                .unwrap()
                .last_sent
        };
        n.report_issue("Amber API", "Connection Error", "still down").await;
        let issues = n.issues.lock().await;
        let state = issues
            .get(&("Amber API".to_string(), "Connection Error".to_string()))
            .unwrap();
        assert_eq!(state.last_sent, sent_at);
    }

    #[tokio::test]
    async fn clear_forgets_the_issue() {
        let n = notifier();
        n.report_issue("Output Pump", "Action Request Failed", "boom").await;
        n.clear_issue("Output Pump", "Action Request Failed").await;
        assert!(n.issues.lock().await.is_empty());
    }
}
