//! Common Types and Constants
//!
//! Wire types shared by the activity buffer (client) and the aggregation
//! endpoint (server).

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ==================== Constants ====================

/// Day key format (`YYYY-MM-DD`)
pub const DAY_KEY_FORMAT: &str = "%Y-%m-%d";

/// Largest time delta a single request may carry (one day)
pub const MAX_DELTA_SECONDS: u64 = 86_400;

/// Largest per-kind count a single request may carry
pub const MAX_DELTA_COUNT: u32 = 100_000;

// ==================== Activity Kinds ====================

/// Kind of countable study activity
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivityKind {
    PageView,
    AiInteraction,
    QuestionAttempt,
    QuestionCorrect,
    LessonCompleted,
    MockExamTaken,
}

impl ActivityKind {
    pub const ALL: [ActivityKind; 6] = [
        ActivityKind::PageView,
        ActivityKind::AiInteraction,
        ActivityKind::QuestionAttempt,
        ActivityKind::QuestionCorrect,
        ActivityKind::LessonCompleted,
        ActivityKind::MockExamTaken,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::PageView => "page-view",
            ActivityKind::AiInteraction => "ai-interaction",
            ActivityKind::QuestionAttempt => "question-attempt",
            ActivityKind::QuestionCorrect => "question-correct",
            ActivityKind::LessonCompleted => "lesson-completed",
            ActivityKind::MockExamTaken => "mock-exam-taken",
        }
    }

    /// Whether this kind counts towards `totalActivities`.
    ///
    /// A correct answer qualifies an attempt that was already counted.
    pub fn counts_as_activity(&self) -> bool {
        !matches!(self, ActivityKind::QuestionCorrect)
    }
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActivityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActivityKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown activity kind: {s}"))
    }
}

/// Per-kind activity counts
///
/// Absent kinds are zero; zero entries are never stored.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityCounts(BTreeMap<ActivityKind, u32>);

impl ActivityCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: ActivityKind) -> u32 {
        self.0.get(&kind).copied().unwrap_or(0)
    }

    pub fn add(&mut self, kind: ActivityKind, count: u32) {
        if count == 0 {
            return;
        }
        let entry = self.0.entry(kind).or_insert(0);
        *entry = entry.saturating_add(count);
    }

    /// Subtract counts that were acknowledged, keeping whatever accrued since.
    pub fn subtract(&mut self, acknowledged: &ActivityCounts) {
        for (kind, sent) in acknowledged.iter() {
            if let Some(current) = self.0.get_mut(&kind) {
                *current = current.saturating_sub(sent);
                if *current == 0 {
                    self.0.remove(&kind);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.0.values().map(|&v| v as u64).sum()
    }

    /// Sum of kinds that count towards `totalActivities`
    pub fn activity_total(&self) -> u64 {
        self.0
            .iter()
            .filter(|(k, _)| k.counts_as_activity())
            .map(|(_, &v)| v as u64)
            .sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ActivityKind, u32)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }
}

impl FromIterator<(ActivityKind, u32)> for ActivityCounts {
    fn from_iter<I: IntoIterator<Item = (ActivityKind, u32)>>(iter: I) -> Self {
        let mut counts = ActivityCounts::new();
        for (kind, count) in iter {
            counts.add(kind, count);
        }
        counts
    }
}

// ==================== Day Keys ====================

pub fn format_day_key(date: NaiveDate) -> String {
    date.format(DAY_KEY_FORMAT).to_string()
}

pub fn parse_day_key(raw: &str) -> Result<NaiveDate, DeltaValidationError> {
    NaiveDate::parse_from_str(raw.trim(), DAY_KEY_FORMAT)
        .map_err(|_| DeltaValidationError::InvalidDate(raw.to_string()))
}

// ==================== Wire Types ====================

/// One additive delta sent by a client for one (user, day)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyDeltaRequest {
    pub user_id: String,
    /// Independent writer identity; sequences are only comparable per client
    pub client_id: String,
    pub date: String,
    pub sequence: u64,
    pub delta_seconds: u64,
    #[serde(default)]
    pub delta_counts: ActivityCounts,
    #[serde(default)]
    pub delta_sessions: u32,
}

impl ApplyDeltaRequest {
    /// Validate the payload, returning the parsed day key.
    pub fn validate(&self) -> Result<NaiveDate, DeltaValidationError> {
        if self.user_id.trim().is_empty() {
            return Err(DeltaValidationError::MissingUserId);
        }
        if self.client_id.trim().is_empty() {
            return Err(DeltaValidationError::MissingClientId);
        }
        let date = parse_day_key(&self.date)?;
        if self.sequence == 0 {
            return Err(DeltaValidationError::ZeroSequence);
        }
        if self.delta_seconds > MAX_DELTA_SECONDS {
            return Err(DeltaValidationError::SecondsOutOfRange(self.delta_seconds));
        }
        if let Some((kind, count)) = self
            .delta_counts
            .iter()
            .find(|(_, count)| *count > MAX_DELTA_COUNT)
        {
            return Err(DeltaValidationError::CountOutOfRange { kind, count });
        }
        if self.delta_sessions > MAX_DELTA_COUNT {
            return Err(DeltaValidationError::SessionsOutOfRange(self.delta_sessions));
        }
        Ok(date)
    }

    pub fn is_empty(&self) -> bool {
        self.delta_seconds == 0 && self.delta_counts.is_empty() && self.delta_sessions == 0
    }
}

/// Endpoint acknowledgement
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyDeltaResponse {
    pub aggregate: DailyAggregate,
    /// `false` when the sequence was already applied (replay)
    pub applied: bool,
    /// Echo of the request sequence
    pub sequence: u64,
    /// Highest sequence applied for this (user, day, client)
    pub last_applied_sequence: u64,
}

/// Server-owned per-user-per-day aggregate
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyAggregate {
    pub user_id: String,
    pub date: String,
    pub total_time_spent: i64,
    pub total_activities: i64,
    pub questions_attempted: i64,
    pub questions_correct: i64,
    pub session_count: i64,
    pub dashboard_visits: i64,
    pub ai_tutor_interactions: i64,
    pub lessons_completed: i64,
    pub mock_exams_taken: i64,
    pub average_session_length: i64,
    pub productivity_score: f64,
}

// ==================== Errors ====================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeltaValidationError {
    #[error("userId 不能为空")]
    MissingUserId,
    #[error("clientId 不能为空")]
    MissingClientId,
    #[error("日期格式无效: {0}")]
    InvalidDate(String),
    #[error("sequence 必须从 1 开始")]
    ZeroSequence,
    #[error("deltaSeconds 超出范围: {0}")]
    SecondsOutOfRange(u64),
    #[error("{kind} 计数超出范围: {count}")]
    CountOutOfRange { kind: ActivityKind, count: u32 },
    #[error("deltaSessions 超出范围: {0}")]
    SessionsOutOfRange(u32),
}
