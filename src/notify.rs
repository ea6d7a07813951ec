//! Notifications and the traffic watcher
//!
//! The watcher polls instance snapshots on an interval and hands a
//! notification to a [`Notifier`] the first time an instance's traffic
//! crosses the warning threshold.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::core::Notifier;
use crate::logger::log;
use crate::manager::{InstanceManager, InstanceSnapshot};

/// Outgoing mail routing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub from: String,
}

impl Default for SmtpSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 25,
            from: String::new(),
        }
    }
}

/// Node-wide settings snapshot, read-only to the core
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Bytes (upload + download) per instance, 0 = off
    pub traffic_warning_threshold: u64,
    pub recipients: Vec<String>,
    pub smtp: SmtpSettings,
    pub ssl_contact_email: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    TrafficWarning,
    InstanceFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    pub kind: NotificationKind,
}

impl Notification {
    pub fn traffic_warning(recipients: &[String], instance: &InstanceSnapshot, threshold: u64) -> Self {
        Self {
            recipients: recipients.to_vec(),
            subject: format!("Traffic warning for instance {}", instance.id),
            body: format!(
                "Instance {} ({}, port {}, user {}) has used {} (upload {}, download {}), above the {} threshold.",
                instance.id,
                instance.protocol,
                instance.port,
                instance.user_id,
                format_bytes(instance.total_traffic()),
                format_bytes(instance.upload),
                format_bytes(instance.download),
                format_bytes(threshold),
            ),
            kind: NotificationKind::TrafficWarning,
        }
    }

    pub fn instance_failure(recipients: &[String], instance_id: i64, reason: &str) -> Self {
        Self {
            recipients: recipients.to_vec(),
            subject: format!("Instance {} failed to start", instance_id),
            body: reason.to_string(),
            kind: NotificationKind::InstanceFailure,
        }
    }
}

/// Format bytes into human-readable string (KB, MB, GB)
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Notifier that writes notifications to the log instead of sending them
#[derive(Debug, Clone, Default)]
pub struct LogNotifier {
    smtp: SmtpSettings,
}

impl LogNotifier {
    pub fn new(settings: &Settings) -> Self {
        Self {
            smtp: settings.smtp.clone(),
        }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) -> anyhow::Result<()> {
        log::warn!(
            kind = ?notification.kind,
            to = %notification.recipients.join(","),
            via = %self.smtp.host,
            subject = %notification.subject,
            "{}",
            notification.body
        );
        Ok(())
    }
}

/// Periodic per-instance traffic threshold check
pub struct TrafficWatcher {
    settings: Settings,
    manager: Arc<InstanceManager>,
    notifier: Arc<dyn Notifier>,
    /// Instances already warned; cleared once they drop below the threshold
    warned: Mutex<HashSet<i64>>,
}

/// Handle for a running watcher
pub struct TrafficWatcherHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TrafficWatcherHandle {
    /// Stop the watcher and wait for it to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        match tokio::time::timeout(Duration::from_secs(5), self.handle).await {
            Ok(Ok(())) => log::debug!("Traffic watcher stopped"),
            Ok(Err(e)) => log::warn!(error = %e, "Traffic watcher panicked"),
            Err(_) => log::warn!("Traffic watcher shutdown timeout"),
        }
    }
}

impl TrafficWatcher {
    pub fn new(settings: Settings, manager: Arc<InstanceManager>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            settings,
            manager,
            notifier,
            warned: Mutex::new(HashSet::new()),
        }
    }

    pub fn threshold(&self) -> u64 {
        self.settings.traffic_warning_threshold
    }

    /// Run one check; returns how many notifications were produced
    pub async fn check_once(&self) -> usize {
        let threshold = self.threshold();
        if threshold == 0 {
            return 0;
        }

        let snapshots = self.manager.snapshots().await;
        let crossed: Vec<InstanceSnapshot> = {
            let mut warned = self.warned.lock();
            warned.retain(|id| snapshots.iter().any(|s| s.id == *id));
            snapshots
                .into_iter()
                .filter(|s| {
                    if s.total_traffic() >= threshold {
                        warned.insert(s.id)
                    } else {
                        warned.remove(&s.id);
                        false
                    }
                })
                .collect()
        };

        for instance in &crossed {
            let notification =
                Notification::traffic_warning(&self.settings.recipients, instance, threshold);
            if let Err(e) = self.notifier.notify(notification).await {
                log::warn!(instance = instance.id, error = %e, "Failed to deliver traffic warning");
            }
        }
        crossed.len()
    }

    /// Spawn the periodic check
    pub fn start(self, period: Duration) -> TrafficWatcherHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let watcher = self;

        let handle = tokio::spawn(async move {
            if watcher.threshold() == 0 {
                log::debug!("Traffic warning disabled");
                let _ = shutdown_rx.changed().await;
                return;
            }

            let mut interval = interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let sent = watcher.check_once().await;
                        if sent > 0 {
                            log::info!(count = sent, "Traffic warnings issued");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        log::debug!("Traffic watcher shutting down");
                        break;
                    }
                }
            }
        });

        TrafficWatcherHandle {
            shutdown_tx,
            handle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnConfig;
    use crate::core::Server;
    use crate::manager::InstanceDescriptor;
    use serde_json::Map;

    #[derive(Default)]
    struct Collecting {
        sent: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Notifier for Collecting {
        async fn notify(&self, notification: Notification) -> anyhow::Result<()> {
            self.sent.lock().push(notification);
            Ok(())
        }
    }

    async fn manager_with(ids: &[i64]) -> Arc<InstanceManager> {
        let server = Server::builder().conn_config(ConnConfig::loopback()).build();
        let manager = Arc::new(InstanceManager::new(Arc::new(server)));
        for &id in ids {
            manager
                .create(InstanceDescriptor {
                    id,
                    user_id: 0,
                    protocol: "http".to_string(),
                    port: 0,
                    settings: Map::new(),
                    enabled: false,
                })
                .await
                .unwrap();
        }
        manager
    }

    fn settings(threshold: u64) -> Settings {
        Settings {
            traffic_warning_threshold: threshold,
            recipients: vec!["ops@example.com".to_string()],
            ..Settings::default()
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(1536), "1.50KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00GB");
    }

    #[test]
    fn test_settings_defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.traffic_warning_threshold, 0);
        assert!(settings.recipients.is_empty());
        assert_eq!(settings.smtp.port, 25);
    }

    #[tokio::test]
    async fn test_one_notification_per_crossing() {
        let manager = manager_with(&[1, 2]).await;
        let collecting = Arc::new(Collecting::default());
        let watcher = TrafficWatcher::new(settings(1000), Arc::clone(&manager), collecting.clone());

        let ledger = manager.ledger(1).await.unwrap();
        ledger.update_traffic(600, 300);
        assert_eq!(watcher.check_once().await, 0);

        ledger.update_traffic(100, 0);
        assert_eq!(watcher.check_once().await, 1);
        ledger.update_traffic(5000, 5000);
        assert_eq!(watcher.check_once().await, 0);

        {
            let sent = collecting.sent.lock();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].kind, NotificationKind::TrafficWarning);
            assert_eq!(sent[0].recipients, vec!["ops@example.com".to_string()]);
            assert!(sent[0].subject.contains("instance 1"));
        }

        // A reset re-arms the warning
        manager.reset_traffic(1).await.unwrap();
        assert_eq!(watcher.check_once().await, 0);
        ledger.update_traffic(1000, 0);
        assert_eq!(watcher.check_once().await, 1);
        assert_eq!(collecting.sent.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_zero_threshold_disables() {
        let manager = manager_with(&[1]).await;
        let collecting = Arc::new(Collecting::default());
        let watcher = TrafficWatcher::new(settings(0), Arc::clone(&manager), collecting.clone());

        manager.ledger(1).await.unwrap().update_traffic(1 << 40, 0);
        assert_eq!(watcher.check_once().await, 0);
        assert!(collecting.sent.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_task_ticks_and_shuts_down() {
        let manager = manager_with(&[1]).await;
        let collecting = Arc::new(Collecting::default());
        let watcher = TrafficWatcher::new(settings(10), Arc::clone(&manager), collecting.clone());
        manager.ledger(1).await.unwrap().update_traffic(10, 0);

        let handle = watcher.start(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(collecting.sent.lock().len(), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(collecting.sent.lock().len(), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_log_notifier_accepts() {
        let notifier = LogNotifier::new(&settings(1));
        let notification = Notification::instance_failure(&[], 3, "address in use");
        assert_eq!(notification.kind, NotificationKind::InstanceFailure);
        notifier.notify(notification).await.unwrap();
    }
}
