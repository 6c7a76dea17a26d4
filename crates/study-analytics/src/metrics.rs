//! Derived daily metrics
//!
//! `averageSessionLength` and `productivityScore` are always recomputed from
//! the stored totals after a delta lands, never accumulated themselves.

use crate::types::{ActivityCounts, ActivityKind, DailyAggregate};

/// Seconds of study that earn the full time component
const FULL_TIME_SECS: f64 = 3600.0;
/// Attempts needed before accuracy carries its full weight
const ACCURACY_VOLUME: f64 = 10.0;
/// Activities that earn the full engagement component
const FULL_ENGAGEMENT: f64 = 50.0;
/// Lesson-equivalents that earn the full milestone component
const FULL_MILESTONES: f64 = 5.0;

const TIME_WEIGHT: f64 = 40.0;
const ACCURACY_WEIGHT: f64 = 30.0;
const ENGAGEMENT_WEIGHT: f64 = 20.0;
const MILESTONE_WEIGHT: f64 = 10.0;

pub const MAX_PRODUCTIVITY_SCORE: f64 = 100.0;

pub fn average_session_length(total_time_spent: i64, session_count: i64) -> i64 {
    if session_count <= 0 {
        return 0;
    }
    (total_time_spent as f64 / session_count as f64).round() as i64
}

/// Weighted productivity score in `[0, 100]`, one decimal place.
///
/// Non-decreasing in time spent, and in accuracy for a fixed number of
/// attempts.
pub fn productivity_score(aggregate: &DailyAggregate) -> f64 {
    let time = (aggregate.total_time_spent.max(0) as f64 / FULL_TIME_SECS).min(1.0);

    let accuracy = if aggregate.questions_attempted > 0 {
        let ratio = aggregate.questions_correct.max(0) as f64
            / aggregate.questions_attempted as f64;
        let volume = (aggregate.questions_attempted as f64 / ACCURACY_VOLUME).min(1.0);
        ratio.clamp(0.0, 1.0) * volume
    } else {
        0.0
    };

    let engagement = (aggregate.total_activities.max(0) as f64 / FULL_ENGAGEMENT).min(1.0);

    // 模拟考试按两节课计
    let milestones = (aggregate.lessons_completed.max(0) as f64
        + 2.0 * aggregate.mock_exams_taken.max(0) as f64)
        / FULL_MILESTONES;

    let score = time * TIME_WEIGHT
        + accuracy * ACCURACY_WEIGHT
        + engagement * ENGAGEMENT_WEIGHT
        + milestones.min(1.0) * MILESTONE_WEIGHT;

    ((score * 10.0).round() / 10.0).min(MAX_PRODUCTIVITY_SCORE)
}

impl DailyAggregate {
    pub fn empty(user_id: impl Into<String>, date: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            date: date.into(),
            ..Default::default()
        }
    }

    /// Add a delta to the totals and recompute the derived metrics.
    pub fn apply_delta(&mut self, delta_seconds: u64, counts: &ActivityCounts, sessions: u32) {
        self.total_time_spent += delta_seconds as i64;
        self.total_activities += counts.activity_total() as i64;
        self.questions_attempted += counts.get(ActivityKind::QuestionAttempt) as i64;
        self.questions_correct += counts.get(ActivityKind::QuestionCorrect) as i64;
        self.dashboard_visits += counts.get(ActivityKind::PageView) as i64;
        self.ai_tutor_interactions += counts.get(ActivityKind::AiInteraction) as i64;
        self.lessons_completed += counts.get(ActivityKind::LessonCompleted) as i64;
        self.mock_exams_taken += counts.get(ActivityKind::MockExamTaken) as i64;
        self.session_count += sessions as i64;
        self.recompute_derived();
    }

    pub fn recompute_derived(&mut self) {
        self.average_session_length =
            average_session_length(self.total_time_spent, self.session_count);
        self.productivity_score = productivity_score(self);
    }

    /// Accuracy in `[0, 1]`, `None` before any attempt.
    pub fn accuracy(&self) -> Option<f64> {
        if self.questions_attempted <= 0 {
            return None;
        }
        Some((self.questions_correct as f64 / self.questions_attempted as f64).clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregate() -> DailyAggregate {
        DailyAggregate::empty("user-1", "2026-03-14")
    }

    #[test]
    fn test_average_session_length_rounds() {
        assert_eq!(average_session_length(100, 3), 33);
        assert_eq!(average_session_length(101, 2), 51);
        assert_eq!(average_session_length(500, 0), 0);
    }

    #[test]
    fn test_empty_aggregate_scores_zero() {
        let agg = aggregate();
        assert_eq!(productivity_score(&agg), 0.0);
        assert_eq!(agg.accuracy(), None);
    }

    #[test]
    fn test_score_is_capped() {
        let mut agg = aggregate();
        agg.total_time_spent = 10 * 3600;
        agg.questions_attempted = 200;
        agg.questions_correct = 200;
        agg.total_activities = 1000;
        agg.lessons_completed = 50;
        agg.mock_exams_taken = 5;
        assert_eq!(productivity_score(&agg), MAX_PRODUCTIVITY_SCORE);
    }

    #[test]
    fn test_score_monotonic_in_time() {
        let mut previous = 0.0;
        for minutes in (0..=90).step_by(5) {
            let mut agg = aggregate();
            agg.total_time_spent = minutes * 60;
            let score = productivity_score(&agg);
            assert!(score >= previous);
            previous = score;
        }
    }

    #[test]
    fn test_score_monotonic_in_accuracy() {
        let mut previous = 0.0;
        for correct in 0..=20 {
            let mut agg = aggregate();
            agg.questions_attempted = 20;
            agg.questions_correct = correct;
            let score = productivity_score(&agg);
            assert!(score >= previous);
            previous = score;
        }
    }

    #[test]
    fn test_apply_delta_maps_kinds_to_columns() {
        let mut agg = aggregate();
        let counts: ActivityCounts = [
            (ActivityKind::PageView, 1),
            (ActivityKind::AiInteraction, 2),
            (ActivityKind::QuestionAttempt, 4),
            (ActivityKind::QuestionCorrect, 3),
            (ActivityKind::LessonCompleted, 1),
            (ActivityKind::MockExamTaken, 1),
        ]
        .into_iter()
        .collect();

        agg.apply_delta(600, &counts, 2);

        assert_eq!(agg.total_time_spent, 600);
        assert_eq!(agg.dashboard_visits, 1);
        assert_eq!(agg.ai_tutor_interactions, 2);
        assert_eq!(agg.questions_attempted, 4);
        assert_eq!(agg.questions_correct, 3);
        assert_eq!(agg.lessons_completed, 1);
        assert_eq!(agg.mock_exams_taken, 1);
        assert_eq!(agg.total_activities, 9);
        assert_eq!(agg.session_count, 2);
        assert_eq!(agg.average_session_length, 300);
        assert!(agg.productivity_score > 0.0);
        assert_eq!(agg.accuracy(), Some(0.75));
    }
}
