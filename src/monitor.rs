//! Passive observer of contract state transitions.
//!
//! The monitor keeps a short per-session history and global success/failure counters, and
//! raises a [`CorruptionAlert`] when one transition keeps repeating. It only logs and records;
//! callers get the alert back for inspection but nothing in the engine branches on it.
//!
//! Transitions recorded on a context reach the monitor through
//! [`TransitionMonitor::observe_history`]. Each session keeps a watermark (the timestamp of
//! the newest transition already seen) so a history fed repeatedly is only counted once.
//! Sessions idle for longer than the recency window are pruned.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use crate::model::Transition;
use std::collections::{BTreeMap, VecDeque};
use time::{Duration, OffsetDateTime};
use tracing::{debug, error};

/// Tunables for loop detection.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Transitions remembered per session.
    pub history_window: usize,
    /// Repetitions of one transition inside the window that count as a loop.
    pub loop_threshold: usize,
    /// Only transitions this close to the newest one are counted.
    pub recency_window: Duration,
    /// Alerts retained for [`TransitionMonitor::recent_alerts`].
    pub alert_history: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            history_window: 5,
            loop_threshold: 3,
            recency_window: Duration::minutes(5),
            alert_history: 100,
        }
    }
}

/// A transition attempt as seen by the monitor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TransitionEvent {
    pub session_id: String,
    pub from: String,
    pub to: String,
    pub success: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

impl TransitionEvent {
    /// Event stamped with the current time.
    pub fn new(
        session_id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        success: bool,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            from: from.into(),
            to: to.into(),
            success,
            at: OffsetDateTime::now_utc(),
        }
    }

    /// Overrides the timestamp.
    pub fn at(mut self, at: OffsetDateTime) -> Self {
        self.at = at;
        self
    }

    /// Counter key, `"{from}→{to}"`.
    pub fn key(&self) -> String {
        format!("{}→{}", self.from, self.to)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CorruptionKind {
    /// One transition repeated at least `loop_threshold` times inside the window.
    Loop { transition: String, occurrences: usize },
    /// A persisted or in-memory context broke the state/step-log invariant.
    StateMismatch { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CorruptionAlert {
    pub session_id: String,
    pub kind: CorruptionKind,
    pub recent: Vec<TransitionEvent>,
    #[serde(with = "time::serde::rfc3339")]
    pub raised_at: OffsetDateTime,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TransitionCounts {
    pub success: u64,
    pub failure: u64,
}

#[derive(Default)]
struct SessionTrack {
    events: VecDeque<TransitionEvent>,
    /// Timestamp of the newest context transition already observed.
    observed_through: Option<OffsetDateTime>,
}

impl SessionTrack {
    fn last_activity(&self) -> Option<OffsetDateTime> {
        let newest_event = self.events.back().map(|event| event.at);
        newest_event.max(self.observed_through)
    }
}

/// Loop and corruption detector shared by request handlers.
pub struct TransitionMonitor {
    config: MonitorConfig,
    histories: DashMap<String, SessionTrack>,
    counts: DashMap<String, TransitionCounts>,
    alerts: Mutex<VecDeque<CorruptionAlert>>,
    last_prune: Mutex<OffsetDateTime>,
}

impl Default for TransitionMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl TransitionMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            histories: DashMap::new(),
            counts: DashMap::new(),
            alerts: Mutex::new(VecDeque::new()),
            last_prune: Mutex::new(OffsetDateTime::now_utc()),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Records a transition attempt that happened now.
    pub fn record_transition(
        &self,
        session_id: &str,
        from: &str,
        to: &str,
        success: bool,
    ) -> Option<CorruptionAlert> {
        self.observe(TransitionEvent::new(session_id, from, to, success))
    }

    /// Records a transition applied to a context, unless it was already observed.
    pub fn observe_transition(
        &self,
        session_id: &str,
        transition: &Transition,
    ) -> Option<CorruptionAlert> {
        {
            let mut track = self.histories.entry(session_id.to_owned()).or_default();
            if track
                .observed_through
                .is_some_and(|seen| transition.at <= seen)
            {
                return None;
            }
            track.observed_through = Some(transition.at);
        }
        let event = TransitionEvent::new(
            session_id,
            transition.from.as_str(),
            transition.to.as_str(),
            true,
        )
        .at(transition.at);
        self.observe(event)
    }

    /// Feeds the unseen tail of a context's transition history, oldest first.
    ///
    /// For a session the monitor does not track, only transitions inside the recency window
    /// are taken, so a history replayed after a restart or a prune cannot raise stale alerts.
    pub fn observe_history(
        &self,
        session_id: &str,
        history: &[Transition],
    ) -> Vec<CorruptionAlert> {
        let watermark = self
            .histories
            .get(session_id)
            .and_then(|track| track.observed_through)
            .unwrap_or_else(|| OffsetDateTime::now_utc() - self.config.recency_window);
        history
            .iter()
            .filter(|transition| transition.at > watermark)
            .filter_map(|transition| self.observe_transition(session_id, transition))
            .collect()
    }

    /// Records a transition event and returns the alert it triggered, if any.
    pub fn observe(&self, event: TransitionEvent) -> Option<CorruptionAlert> {
        self.maybe_prune(event.at);
        let key = event.key();
        {
            let mut counts = self.counts.entry(key.clone()).or_default();
            if event.success {
                counts.success += 1;
            } else {
                counts.failure += 1;
            }
        }

        let (occurrences, recent) = {
            let mut track = self
                .histories
                .entry(event.session_id.clone())
                .or_default();
            let history = &mut track.events;
            history.push_back(event.clone());
            while history.len() > self.config.history_window {
                history.pop_front();
            }
            let cutoff = event.at - self.config.recency_window;
            let occurrences = history
                .iter()
                .filter(|seen| seen.at >= cutoff && seen.key() == key)
                .count();
            (occurrences, history.iter().cloned().collect::<Vec<_>>())
        };

        if occurrences < self.config.loop_threshold {
            return None;
        }

        error!(
            session_id = %event.session_id,
            transition = %key,
            occurrences,
            recent = ?recent.iter().map(TransitionEvent::key).collect::<Vec<_>>(),
            "contract workflow is looping between states"
        );
        Some(self.raise(CorruptionAlert {
            session_id: event.session_id,
            kind: CorruptionKind::Loop {
                transition: key,
                occurrences,
            },
            recent,
            raised_at: OffsetDateTime::now_utc(),
        }))
    }

    /// Records a broken state invariant detected elsewhere.
    pub fn report_state_corruption(&self, session_id: &str, reason: &str) -> CorruptionAlert {
        error!(session_id, reason, "contract session state is corrupted");
        let alert = CorruptionAlert {
            session_id: session_id.to_owned(),
            kind: CorruptionKind::StateMismatch {
                reason: reason.to_owned(),
            },
            recent: self.history(session_id),
            raised_at: OffsetDateTime::now_utc(),
        };
        self.raise(alert)
    }

    fn raise(&self, alert: CorruptionAlert) -> CorruptionAlert {
        let mut alerts = self.alerts.lock();
        alerts.push_back(alert.clone());
        while alerts.len() > self.config.alert_history {
            alerts.pop_front();
        }
        alert
    }

    /// The bounded transition history of a session, oldest first.
    pub fn history(&self, session_id: &str) -> Vec<TransitionEvent> {
        self.histories
            .get(session_id)
            .map(|track| track.events.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of sessions currently tracked.
    pub fn tracked_sessions(&self) -> usize {
        self.histories.len()
    }

    /// Drops sessions with no activity inside the recency window ending at `now`.
    /// Returns how many were removed.
    pub fn prune_idle(&self, now: OffsetDateTime) -> usize {
        let cutoff = now - self.config.recency_window;
        let before = self.histories.len();
        self.histories
            .retain(|_, track| track.last_activity().is_some_and(|at| at >= cutoff));
        let pruned = before.saturating_sub(self.histories.len());
        if pruned > 0 {
            debug!(pruned, "pruned idle transition histories");
        }
        pruned
    }

    /// Runs [`Self::prune_idle`] at most once per recency window.
    fn maybe_prune(&self, now: OffsetDateTime) {
        {
            let mut last = self.last_prune.lock();
            if now - *last < self.config.recency_window {
                return;
            }
            *last = now;
        }
        self.prune_idle(now);
    }

    /// Snapshot of the global counters keyed by `"{from}→{to}"`.
    pub fn transition_counts(&self) -> BTreeMap<String, TransitionCounts> {
        self.counts
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    pub fn recent_alerts(&self) -> Vec<CorruptionAlert> {
        self.alerts.lock().iter().cloned().collect()
    }

    /// Drops the history of a finished session.
    pub fn forget(&self, session_id: &str) {
        self.histories.remove(session_id);
    }
}
