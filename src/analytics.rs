//! Process-wide usage analytics.
//!
//! The tracker is started once at launch, optionally resuming from a JSON
//! snapshot written by a previous run, and stopped once at shutdown, when the
//! snapshot is flushed back to disk. Flushing requires the analytics password
//! to be present in the environment; without it the process refuses to exit
//! cleanly rather than silently dropping the numbers.
//!
//! Only counts are recorded. Widget values (in particular the API key) are
//! never stored.

use chrono::{DateTime, NaiveDate, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("analytics password is not set (expected in ${0})")]
    MissingSecret(String),
    #[error("failed to write analytics snapshot: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize analytics snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Interactive controls whose use is counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Widget {
    ApiKey,
    PdfUpload,
    ChatInput,
}

impl Widget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Widget::ApiKey => "api_key",
            Widget::PdfUpload => "pdf_upload",
            Widget::ChatInput => "chat_input",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DayCounts {
    pub pageviews: u64,
    pub script_runs: u64,
}

/// Persisted analytics state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    /// When tracking first started, across all resumed runs.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_pageviews: u64,
    #[serde(default)]
    pub total_script_runs: u64,
    #[serde(default)]
    pub total_time_seconds: f64,
    #[serde(default)]
    pub per_day: BTreeMap<NaiveDate, DayCounts>,
    #[serde(default)]
    pub widgets: BTreeMap<String, u64>,
}

struct Inner {
    snapshot: AnalyticsSnapshot,
    /// `None` once the tracker has been stopped.
    active_since: Option<Instant>,
}

pub struct Analytics {
    inner: Mutex<Inner>,
}

impl Analytics {
    /// Start tracking with an empty snapshot.
    pub fn fresh() -> Self {
        Self::from_snapshot(AnalyticsSnapshot::default())
    }

    /// Start tracking, resuming from `path` when it holds a valid snapshot.
    ///
    /// A missing or unparsable file is not an error: tracking starts fresh.
    pub fn start(path: &Path) -> Self {
        match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<AnalyticsSnapshot>(&bytes) {
                Ok(snapshot) => {
                    tracing::info!(path = %path.display(), "resuming analytics from snapshot");
                    Self::from_snapshot(snapshot)
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "analytics snapshot is corrupt, starting fresh");
                    Self::fresh()
                }
            },
            Err(e) => {
                tracing::info!(path = %path.display(), error = %e, "no analytics snapshot found, starting fresh");
                Self::fresh()
            }
        }
    }

    fn from_snapshot(mut snapshot: AnalyticsSnapshot) -> Self {
        snapshot.start_time.get_or_insert_with(Utc::now);
        Self {
            inner: Mutex::new(Inner {
                snapshot,
                active_since: Some(Instant::now()),
            }),
        }
    }

    pub fn record_pageview(&self) {
        self.with(|s| {
            s.total_pageviews += 1;
            s.per_day.entry(today()).or_default().pageviews += 1;
        });
    }

    /// One controller action (the equivalent of a page re-run).
    pub fn record_script_run(&self) {
        self.with(|s| {
            s.total_script_runs += 1;
            s.per_day.entry(today()).or_default().script_runs += 1;
        });
    }

    pub fn record_widget(&self, widget: Widget) {
        self.with(|s| {
            *s.widgets.entry(widget.as_str().to_string()).or_default() += 1;
        });
    }

    /// Current numbers, including time elapsed since start.
    pub fn snapshot(&self) -> AnalyticsSnapshot {
        match self.inner.lock() {
            Ok(inner) => {
                let mut snapshot = inner.snapshot.clone();
                if let Some(since) = inner.active_since {
                    snapshot.total_time_seconds += since.elapsed().as_secs_f64();
                }
                snapshot
            }
            Err(poisoned) => poisoned.into_inner().snapshot.clone(),
        }
    }

    /// Whether `supplied` equals the password held in `secret_env`.
    ///
    /// An unset password never matches.
    pub fn password_matches(secret_env: &str, supplied: &str) -> bool {
        match std::env::var(secret_env) {
            Ok(expected) if !expected.is_empty() => secrets_match(&expected, supplied),
            _ => false,
        }
    }

    /// Stop tracking and flush the snapshot to `path`.
    ///
    /// Fails with [`AnalyticsError::MissingSecret`] when `secret_env` is not
    /// set; nothing is written in that case.
    pub fn stop(&self, path: &Path, secret_env: &str) -> Result<(), AnalyticsError> {
        let secret = std::env::var(secret_env).ok();
        self.stop_with_secret(path, secret_env, secret.as_deref())
    }

    fn stop_with_secret(
        &self,
        path: &Path,
        secret_env: &str,
        secret: Option<&str>,
    ) -> Result<(), AnalyticsError> {
        if secret.map_or(true, str::is_empty) {
            return Err(AnalyticsError::MissingSecret(secret_env.to_string()));
        }

        let snapshot = {
            let mut inner = self
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(since) = inner.active_since.take() {
                inner.snapshot.total_time_seconds += since.elapsed().as_secs_f64();
            }
            inner.snapshot.clone()
        };

        write_snapshot(path, &snapshot)?;
        tracing::info!(path = %path.display(), "analytics saved");
        Ok(())
    }

    fn with(&self, f: impl FnOnce(&mut AnalyticsSnapshot)) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if inner.active_since.is_some() {
            f(&mut inner.snapshot);
        }
    }
}

/// Load a snapshot for display. Unlike [`Analytics::start`] this reports
/// errors.
pub fn read_snapshot(path: &Path) -> anyhow::Result<AnalyticsSnapshot> {
    use anyhow::Context;
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read analytics snapshot: {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| "Failed to parse analytics snapshot")
}

/// Write via a sibling temp file and rename, so a crash mid-write never
/// leaves a truncated snapshot behind.
fn write_snapshot(path: &Path, snapshot: &AnalyticsSnapshot) -> Result<(), AnalyticsError> {
    let json = serde_json::to_vec_pretty(snapshot)?;
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&json)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn secrets_match(expected: &str, supplied: &str) -> bool {
    type HmacSha256 = Hmac<Sha256>;
    const KEY: &[u8] = b"chat-agent/analytics";

    let Ok(mut mac) = HmacSha256::new_from_slice(KEY) else {
        return false;
    };
    mac.update(expected.as_bytes());
    let tag = mac.finalize().into_bytes();

    let Ok(mut mac) = HmacSha256::new_from_slice(KEY) else {
        return false;
    };
    mac.update(supplied.as_bytes());
    mac.verify_slice(&tag).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_snapshot_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let analytics = Analytics::start(&dir.path().join("analytics.json"));
        let snap = analytics.snapshot();
        assert_eq!(snap.total_pageviews, 0);
        assert!(snap.start_time.is_some());
    }

    #[test]
    fn test_corrupt_snapshot_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("analytics.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let analytics = Analytics::start(&path);
        assert_eq!(analytics.snapshot().total_script_runs, 0);
    }

    #[test]
    fn test_counts_are_recorded() {
        let analytics = Analytics::fresh();
        analytics.record_pageview();
        analytics.record_script_run();
        analytics.record_script_run();
        analytics.record_widget(Widget::ChatInput);
        analytics.record_widget(Widget::ChatInput);
        analytics.record_widget(Widget::PdfUpload);

        let snap = analytics.snapshot();
        assert_eq!(snap.total_pageviews, 1);
        assert_eq!(snap.total_script_runs, 2);
        assert_eq!(snap.widgets["chat_input"], 2);
        assert_eq!(snap.widgets["pdf_upload"], 1);
        assert_eq!(snap.per_day[&today()].script_runs, 2);
    }

    #[test]
    fn test_stop_without_secret_fails_and_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("analytics.json");
        let analytics = Analytics::fresh();
        let err = analytics
            .stop_with_secret(&path, "ANALYTICS_PASSWORD", None)
            .unwrap_err();
        assert!(matches!(err, AnalyticsError::MissingSecret(ref v) if v == "ANALYTICS_PASSWORD"));
        assert!(!path.exists());

        let err = analytics
            .stop_with_secret(&path, "ANALYTICS_PASSWORD", Some(""))
            .unwrap_err();
        assert!(matches!(err, AnalyticsError::MissingSecret(_)));
    }

    #[test]
    fn test_stop_reads_secret_from_environment() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("analytics.json");
        let analytics = Analytics::fresh();
        let err = analytics
            .stop(&path, "CHAT_AGENT_TEST_UNSET_ANALYTICS_SECRET")
            .unwrap_err();
        assert!(matches!(err, AnalyticsError::MissingSecret(_)));
    }

    #[test]
    fn test_stop_then_resume_round_trips_counts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("analytics.json");

        let first = Analytics::fresh();
        first.record_pageview();
        first.record_widget(Widget::ApiKey);
        first
            .stop_with_secret(&path, "ANALYTICS_PASSWORD", Some("s3cret"))
            .unwrap();

        // Stopped trackers ignore further events.
        first.record_pageview();
        assert_eq!(first.snapshot().total_pageviews, 1);

        let second = Analytics::start(&path);
        second.record_pageview();
        let snap = second.snapshot();
        assert_eq!(snap.total_pageviews, 2);
        assert_eq!(snap.widgets["api_key"], 1);
        assert_eq!(snap.start_time, read_snapshot(&path).unwrap().start_time);
    }

    #[test]
    fn test_secrets_compare_exactly() {
        assert!(secrets_match("hunter2", "hunter2"));
        assert!(!secrets_match("hunter2", "hunter3"));
        assert!(!secrets_match("hunter2", ""));
    }

    #[test]
    fn test_unset_password_never_matches() {
        assert!(!Analytics::password_matches(
            "CHAT_AGENT_TEST_UNSET_ANALYTICS_SECRET",
            ""
        ));
    }
}
