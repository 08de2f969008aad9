//! Command telemetry.
//!
//! After each command an event describing it is offered to a `Monitor`.
//! Submission problems are logged and never change the command's outcome.

use crate::protocol::Monitoring;
use serde_json::json;
use tracing::{debug, info, warn};

pub const DATADOG_EVENTS_URL: &str = "https://api.datadoghq.com/api/v1/events";

/// Environment variable holding the fallback Datadog API key.
pub const DATADOG_KEY_ENV: &str = "DD_CLIENT_API_KEY";

/// Telemetry settings gathered from the config plugin during a command.
pub type MonitoringData = Monitoring;

/// What happened in one command run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandEvent {
    pub command: String,
    pub project: String,
    pub environment: String,
    pub team: String,
    /// Version of cdflow2 itself.
    pub version: String,
    /// Version of the component being released or deployed.
    pub release_version: String,
    pub status_code: u8,
    pub monitoring: MonitoringData,
}

impl CommandEvent {
    pub fn succeeded(&self) -> bool {
        self.status_code == 0
    }

    pub fn title(&self) -> String {
        format!(
            "'{}' command run in '{}' project",
            self.command, self.project
        )
    }

    pub fn text(&self) -> String {
        let status = if self.succeeded() {
            "was successful"
        } else {
            "failed"
        };
        format!("cdflow2 {} command {status}.", self.command)
    }

    pub fn tags(&self) -> Vec<String> {
        let mut tags = vec![
            format!("command:{}", self.command),
            format!("version:{}", self.version),
            format!("release_version:{}", self.release_version),
            format!("status_code:{}", self.status_code),
            if self.succeeded() {
                "status:successful".to_owned()
            } else {
                "status:failed".to_owned()
            },
        ];
        for (key, value) in [
            ("project", &self.project),
            ("env", &self.environment),
            ("team", &self.team),
        ] {
            if !value.is_empty() {
                tags.push(format!("{key}:{value}"));
            }
        }
        tags.extend(
            self.monitoring
                .data
                .iter()
                .map(|(key, value)| format!("{key}:{value}")),
        );
        tags
    }
}

pub trait Monitor: Send + Sync {
    fn name(&self) -> &str;

    fn submit(&self, event: &CommandEvent);
}

pub struct NoopMonitor;

impl Monitor for NoopMonitor {
    fn name(&self) -> &'static str {
        "none"
    }

    fn submit(&self, event: &CommandEvent) {
        debug!("telemetry disabled, not submitting '{}' event", event.command);
    }
}

/// Posts command events to the Datadog events API.
pub struct DatadogMonitor {
    agent: ureq::Agent,
    url: String,
    fallback_key: Option<String>,
}

impl DatadogMonitor {
    pub fn new(fallback_key: Option<String>) -> Self {
        Self {
            agent: ureq::Agent::new_with_defaults(),
            url: DATADOG_EVENTS_URL.to_owned(),
            fallback_key,
        }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var(DATADOG_KEY_ENV).ok().filter(|k| !k.is_empty()))
    }

    /// The key to submit with: the plugin's, else the fallback.
    pub fn api_key<'a>(&'a self, event: &'a CommandEvent) -> Option<&'a str> {
        if event.monitoring.api_key.is_empty() {
            self.fallback_key.as_deref()
        } else {
            Some(&event.monitoring.api_key)
        }
    }

    pub fn payload(event: &CommandEvent, host: &str, timestamp: i64) -> serde_json::Value {
        json!({
            "title": event.title(),
            "text": event.text(),
            "aggregation_key": "cdflow2",
            "date_happened": timestamp,
            "host": host,
            "alert_type": if event.succeeded() { "success" } else { "error" },
            "tags": event.tags(),
        })
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_owned())
        .unwrap_or_default()
}

impl Monitor for DatadogMonitor {
    fn name(&self) -> &'static str {
        "datadog"
    }

    fn submit(&self, event: &CommandEvent) {
        let Some(key) = self.api_key(event) else {
            debug!("Datadog API key not provided, skip sending event");
            return;
        };
        let payload = Self::payload(event, &hostname(), chrono::Utc::now().timestamp());
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(e) => {
                warn!("failed to encode Datadog event: {e}");
                return;
            }
        };
        let result = self
            .agent
            .post(&self.url)
            .header("DD-API-KEY", key)
            .header("Content-Type", "application/json")
            .send(body.as_slice());
        match result {
            Ok(_) => info!("Datadog event submitted"),
            Err(ureq::Error::StatusCode(code)) => {
                warn!("Datadog rejected event with HTTP {code}");
            }
            Err(e) => warn!("failed to submit Datadog event: {e}"),
        }
    }
}

/// Pick a monitor by name: `datadog` or `none`.
pub fn select_monitor(name: &str) -> Result<Box<dyn Monitor>, String> {
    match name {
        "datadog" => Ok(Box::new(DatadogMonitor::from_env())),
        "none" | "" => Ok(Box::new(NoopMonitor)),
        other => Err(format!("unknown monitoring backend '{other}'")),
    }
}

/// Merge monitoring settings from a later plugin response over earlier ones.
pub fn merge_monitoring(into: &mut MonitoringData, from: &MonitoringData) {
    if !from.api_key.is_empty() {
        into.api_key.clone_from(&from.api_key);
    }
    into.data
        .extend(from.data.iter().map(|(k, v)| (k.clone(), v.clone())));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn event(status_code: u8) -> CommandEvent {
        CommandEvent {
            command: "deploy".to_owned(),
            project: "svc".to_owned(),
            environment: "live".to_owned(),
            team: "platform".to_owned(),
            version: "0.1.0".to_owned(),
            release_version: "42".to_owned(),
            status_code,
            monitoring: MonitoringData {
                api_key: String::new(),
                data: BTreeMap::from([("account".to_owned(), "prod".to_owned())]),
            },
        }
    }

    #[test]
    fn successful_event_text() {
        let event = event(0);
        assert_eq!(event.title(), "'deploy' command run in 'svc' project");
        assert_eq!(event.text(), "cdflow2 deploy command was successful.");
        assert_eq!(
            event.tags(),
            vec![
                "command:deploy",
                "version:0.1.0",
                "release_version:42",
                "status_code:0",
                "status:successful",
                "project:svc",
                "env:live",
                "team:platform",
                "account:prod",
            ]
        );
    }

    #[test]
    fn failed_event_text() {
        let event = event(1);
        assert_eq!(event.text(), "cdflow2 deploy command failed.");
        assert!(event.tags().contains(&"status:failed".to_owned()));
        let payload = DatadogMonitor::payload(&event, "ci-runner", 1_700_000_000);
        assert_eq!(payload["alert_type"], "error");
        assert_eq!(payload["date_happened"], 1_700_000_000);
        assert_eq!(payload["host"], "ci-runner");
    }

    #[test]
    fn empty_optional_tags_are_skipped() {
        let mut event = event(0);
        event.environment.clear();
        event.team.clear();
        let tags = event.tags();
        assert!(!tags.iter().any(|t| t.starts_with("env:")));
        assert!(!tags.iter().any(|t| t.starts_with("team:")));
    }

    #[test]
    fn plugin_key_wins_over_fallback() {
        let monitor = DatadogMonitor::new(Some("fallback".to_owned()));
        let mut event = event(0);
        assert_eq!(monitor.api_key(&event), Some("fallback"));
        event.monitoring.api_key = "plugin".to_owned();
        assert_eq!(monitor.api_key(&event), Some("plugin"));
        assert_eq!(DatadogMonitor::new(None).api_key(&CommandEvent::default()), None);
    }

    #[test]
    fn merge_keeps_existing_key_when_empty() {
        let mut data = MonitoringData {
            api_key: "first".to_owned(),
            data: BTreeMap::from([("a".to_owned(), "1".to_owned())]),
        };
        merge_monitoring(
            &mut data,
            &MonitoringData {
                api_key: String::new(),
                data: BTreeMap::from([("b".to_owned(), "2".to_owned())]),
            },
        );
        assert_eq!(data.api_key, "first");
        assert_eq!(data.data.len(), 2);
    }

    #[test]
    fn select_monitors() {
        assert_eq!(select_monitor("none").unwrap().name(), "none");
        assert_eq!(select_monitor("datadog").unwrap().name(), "datadog");
        assert!(select_monitor("statsd").is_err());
    }
}
