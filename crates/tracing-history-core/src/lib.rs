use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime, UtcOffset};

pub const DEFAULT_RETENTION_DAYS: u32 = 14;
pub const DEFAULT_MINIMUM_ENABLED_HOURS: u32 = 48;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum HistoryError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExposureNotificationStatus {
    Active,
    Disabled,
    BluetoothOff,
    Restricted,
    Paused,
    Unknown,
}

impl ExposureNotificationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disabled => "disabled",
            Self::BluetoothOff => "bluetooth_off",
            Self::Restricted => "restricted",
            Self::Paused => "paused",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "disabled" => Some(Self::Disabled),
            "bluetooth_off" => Some(Self::BluetoothOff),
            "restricted" => Some(Self::Restricted),
            "paused" => Some(Self::Paused),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl Display for ExposureNotificationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Platform exposure-notification state as reported by the host OS.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExposureManagerState {
    pub authorized: bool,
    pub enabled: bool,
    pub status: ExposureNotificationStatus,
}

impl ExposureManagerState {
    /// Tracing only counts as enabled when the app is authorized, the
    /// framework is switched on and the radio is actively scanning.
    #[must_use]
    pub fn is_good(&self) -> bool {
        self.authorized && self.enabled && self.status == ExposureNotificationStatus::Active
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct TracingState {
    pub is_tracing_enabled: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl TracingState {
    #[must_use]
    pub fn new(is_tracing_enabled: bool, timestamp: OffsetDateTime) -> Self {
        Self {
            is_tracing_enabled,
            timestamp,
        }
    }

    #[must_use]
    pub fn observed_now(is_tracing_enabled: bool) -> Self {
        Self::new(is_tracing_enabled, now_utc())
    }

    #[must_use]
    pub fn from_manager_state(state: &ExposureManagerState, timestamp: OffsetDateTime) -> Self {
        Self::new(state.is_good(), timestamp)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistoryEntry {
    pub on: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistoryPolicy {
    pub policy_version: u32,
    pub retention_days: u32,
    pub minimum_enabled_hours: u32,
}

impl HistoryPolicy {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            policy_version: 1,
            retention_days: DEFAULT_RETENTION_DAYS,
            minimum_enabled_hours: DEFAULT_MINIMUM_ENABLED_HOURS,
        }
    }

    /// Validates policy bounds.
    ///
    /// # Errors
    /// Returns [`HistoryError::Configuration`] when a field is out of range.
    pub fn validate(&self) -> Result<(), HistoryError> {
        if self.policy_version == 0 {
            return Err(HistoryError::Configuration(
                "policy_version MUST be >= 1".to_string(),
            ));
        }

        if self.retention_days == 0 {
            return Err(HistoryError::Configuration(
                "retention_days MUST be >= 1".to_string(),
            ));
        }

        if self.minimum_enabled_hours == 0 {
            return Err(HistoryError::Configuration(
                "minimum_enabled_hours MUST be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a policy from JSON.
    ///
    /// # Errors
    /// Returns [`HistoryError::Configuration`] when JSON decoding fails
    /// or decoded values violate policy constraints.
    pub fn from_json(value: &Value) -> Result<Self, HistoryError> {
        let policy: Self = serde_json::from_value(value.clone()).map_err(|err| {
            HistoryError::Configuration(format!("invalid policy JSON payload: {err}"))
        })?;
        policy.validate()?;
        Ok(policy)
    }

    #[must_use]
    pub fn retention_horizon(&self) -> Duration {
        Duration::days(i64::from(self.retention_days))
    }

    #[must_use]
    pub fn minimum_enabled_duration(&self) -> Duration {
        Duration::hours(i64::from(self.minimum_enabled_hours))
    }
}

impl Default for HistoryPolicy {
    fn default() -> Self {
        Self::v1()
    }
}

/// Run-length encoded record of tracing on/off transitions, oldest first.
///
/// The log only grows on a state transition and is pruned against the
/// retention horizon on every consume, so it stays small. Serializes as a
/// plain JSON array of `{ "on": bool, "date": RFC3339 }` objects.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct TracingStatusHistory {
    entries: Vec<HistoryEntry>,
}

impl TracingStatusHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a history from previously persisted entries as-is.
    #[must_use]
    pub fn from_entries(entries: Vec<HistoryEntry>) -> Self {
        Self { entries }
    }

    /// Decodes a persisted history from its JSON array form.
    ///
    /// # Errors
    /// Returns [`HistoryError::Validation`] when the payload is not a valid
    /// entry list.
    pub fn from_json_str(value: &str) -> Result<Self, HistoryError> {
        serde_json::from_str(value).map_err(|err| {
            HistoryError::Validation(format!("invalid history JSON payload: {err}"))
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    #[must_use]
    pub fn first(&self) -> Option<&HistoryEntry> {
        self.entries.first()
    }

    #[must_use]
    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.last()
    }

    /// Returns the history after consuming `state` under the default policy.
    #[must_use]
    pub fn consuming_state(self, state: &TracingState) -> Self {
        self.consuming_state_with_policy(state, &HistoryPolicy::v1())
    }

    #[must_use]
    pub fn consuming_state_with_policy(
        mut self,
        state: &TracingState,
        policy: &HistoryPolicy,
    ) -> Self {
        self.consume_with_policy(state, policy);
        self
    }

    pub fn consume(&mut self, state: &TracingState) {
        self.consume_with_policy(state, &HistoryPolicy::v1());
    }

    /// Records `state` and prunes against `state.timestamp`.
    ///
    /// An observation equal to the latest stored state is not appended.
    /// Pruning then drops every entry older than the retention horizon,
    /// unless none lies within it, in which case only the newest one is
    /// kept. Finally a log holding nothing but one "off" entry is cleared.
    pub fn consume_with_policy(&mut self, state: &TracingState, policy: &HistoryPolicy) {
        let on = state.is_tracing_enabled;
        let now = state.timestamp;

        if self.last().is_some_and(|last| last.on == on) {
            tracing::debug!(on, "tracing state unchanged");
        } else {
            self.entries.push(HistoryEntry { on, date: now });
            tracing::debug!(on, date = %now, "tracing state transition recorded");
        }

        self.prune(now, policy.retention_horizon());
    }

    /// Cumulative time tracing was enabled up to `since`.
    ///
    /// Entries dated after `since` are ignored and a still-open "on" period
    /// runs until `since`.
    #[must_use]
    pub fn enabled_duration(&self, since: OffsetDateTime) -> Duration {
        let visible: Vec<&HistoryEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.date <= since)
            .collect();

        let mut total = Duration::ZERO;
        for (index, entry) in visible.iter().enumerate() {
            if !entry.on {
                continue;
            }
            let end = visible.get(index + 1).map_or(since, |next| next.date);
            let span = end - entry.date;
            if span.is_positive() {
                total = total.saturating_add(span);
            }
        }
        total
    }

    /// Whether tracing was enabled for at least `minimum_duration` in total
    /// as of `since`. Always false when no "on" entry exists by then.
    #[must_use]
    pub fn check_if_enabled(&self, since: OffsetDateTime, minimum_duration: Duration) -> bool {
        let has_enabled_entry = self
            .entries
            .iter()
            .any(|entry| entry.on && entry.date <= since);

        has_enabled_entry && self.enabled_duration(since) >= minimum_duration
    }

    /// [`Self::check_if_enabled`] against the policy's minimum enabled hours.
    #[must_use]
    pub fn check_if_enabled_with_policy(
        &self,
        since: OffsetDateTime,
        policy: &HistoryPolicy,
    ) -> bool {
        self.check_if_enabled(since, policy.minimum_enabled_duration())
    }

    /// Stricter variant of [`Self::check_if_enabled`]: only the latest entry
    /// at or before `since` counts, and it must be "on" for long enough.
    #[must_use]
    pub fn enabled_continuously_for(
        &self,
        since: OffsetDateTime,
        minimum_duration: Duration,
    ) -> bool {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.date <= since)
            .is_some_and(|entry| entry.on && since - entry.date >= minimum_duration)
    }

    /// Whole 24-hour days of cumulative enabled time; partial days truncate.
    #[must_use]
    pub fn count_enabled_days(&self, since: OffsetDateTime) -> u32 {
        u32::try_from(self.enabled_duration(since).whole_days()).unwrap_or(u32::MAX)
    }

    /// Whole hours of cumulative enabled time; partial hours truncate.
    #[must_use]
    pub fn count_enabled_hours(&self, since: OffsetDateTime) -> u32 {
        u32::try_from(self.enabled_duration(since).whole_hours()).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn summarize(&self, as_of: OffsetDateTime, policy: &HistoryPolicy) -> HistorySummary {
        HistorySummary {
            as_of,
            entry_count: self.len(),
            is_empty: self.is_empty(),
            minimum_enabled_hours: policy.minimum_enabled_hours,
            tracing_enabled_for_minimum: self.check_if_enabled_with_policy(as_of, policy),
            enabled_days: self.count_enabled_days(as_of),
            enabled_hours: self.count_enabled_hours(as_of),
        }
    }

    fn prune(&mut self, now: OffsetDateTime, retention: Duration) {
        let before = self.entries.len();

        // No representable horizon means nothing is old enough to drop.
        if let Some(horizon) = now.checked_sub(retention) {
            if self.entries.iter().any(|entry| entry.date >= horizon) {
                self.entries.retain(|entry| entry.date >= horizon);
            } else if let Some(newest) =
                self.entries.iter().copied().max_by_key(|entry| entry.date)
            {
                self.entries = vec![newest];
            }
        }

        if matches!(self.entries.as_slice(), [only] if !only.on) {
            self.entries.clear();
        }

        let removed = before - self.entries.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = self.entries.len(), "pruned tracing history");
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistorySummary {
    #[serde(with = "time::serde::rfc3339")]
    pub as_of: OffsetDateTime,
    pub entry_count: usize,
    pub is_empty: bool,
    pub minimum_enabled_hours: u32,
    pub tracing_enabled_for_minimum: bool,
    pub enabled_days: u32,
    pub enabled_hours: u32,
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`HistoryError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, HistoryError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| HistoryError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(HistoryError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`HistoryError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, HistoryError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            HistoryError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
