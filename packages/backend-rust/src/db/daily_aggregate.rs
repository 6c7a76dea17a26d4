use chrono::{Duration, NaiveDate, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use study_analytics::{format_day_key, ApplyDeltaRequest, ApplyDeltaResponse, DailyAggregate};

use super::{AggregateError, AggregateStore};

const SELECT_AGGREGATE: &str = r#"
    SELECT "user_id", "date", "total_time_spent", "total_activities",
           "questions_attempted", "questions_correct", "session_count",
           "dashboard_visits", "ai_tutor_interactions", "lessons_completed",
           "mock_exams_taken", "average_session_length", "productivity_score"
    FROM "daily_aggregates"
    WHERE "user_id" = ? AND "date" = ?
"#;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerPruneReport {
    pub cutoff: String,
    pub removed: u64,
}

impl AggregateStore {
    /// 加法式 upsert：同一事务内插入零行、核对序号账本、累加并记录序号
    pub async fn apply_delta(
        &self,
        request: &ApplyDeltaRequest,
    ) -> Result<ApplyDeltaResponse, AggregateError> {
        let date = format_day_key(request.validate()?);
        let sequence = i64::try_from(request.sequence)
            .map_err(|_| AggregateError::SequenceOutOfRange(request.sequence))?;
        let now = now_iso();

        let mut tx = self.pool().begin().await?;

        // 第一条语句即写入，事务从这里开始持有写锁
        sqlx::query(
            r#"
            INSERT INTO "daily_aggregates" ("user_id", "date", "updated_at")
            VALUES (?, ?, ?)
            ON CONFLICT ("user_id", "date") DO NOTHING
            "#,
        )
        .bind(&request.user_id)
        .bind(&date)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        let mut aggregate = load_aggregate(&mut tx, &request.user_id, &date).await?;

        let last_applied: i64 = sqlx::query_scalar(
            r#"
            SELECT "last_sequence" FROM "daily_aggregate_sequences"
            WHERE "user_id" = ? AND "date" = ? AND "client_id" = ?
            "#,
        )
        .bind(&request.user_id)
        .bind(&date)
        .bind(&request.client_id)
        .fetch_optional(&mut *tx)
        .await?
        .unwrap_or(0);

        if sequence <= last_applied {
            tx.rollback().await?;
            tracing::debug!(
                user_id = %request.user_id,
                client_id = %request.client_id,
                date = %date,
                sequence,
                last_applied,
                "delta already applied, replaying aggregate"
            );
            return Ok(ApplyDeltaResponse {
                aggregate,
                applied: false,
                sequence: request.sequence,
                last_applied_sequence: last_applied as u64,
            });
        }

        aggregate.apply_delta(
            request.delta_seconds,
            &request.delta_counts,
            request.delta_sessions,
        );

        sqlx::query(
            r#"
            UPDATE "daily_aggregates" SET
                "total_time_spent" = ?,
                "total_activities" = ?,
                "questions_attempted" = ?,
                "questions_correct" = ?,
                "session_count" = ?,
                "dashboard_visits" = ?,
                "ai_tutor_interactions" = ?,
                "lessons_completed" = ?,
                "mock_exams_taken" = ?,
                "average_session_length" = ?,
                "productivity_score" = ?,
                "updated_at" = ?
            WHERE "user_id" = ? AND "date" = ?
            "#,
        )
        .bind(aggregate.total_time_spent)
        .bind(aggregate.total_activities)
        .bind(aggregate.questions_attempted)
        .bind(aggregate.questions_correct)
        .bind(aggregate.session_count)
        .bind(aggregate.dashboard_visits)
        .bind(aggregate.ai_tutor_interactions)
        .bind(aggregate.lessons_completed)
        .bind(aggregate.mock_exams_taken)
        .bind(aggregate.average_session_length)
        .bind(aggregate.productivity_score)
        .bind(&now)
        .bind(&request.user_id)
        .bind(&date)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO "daily_aggregate_sequences"
                ("user_id", "date", "client_id", "last_sequence", "updated_at")
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT ("user_id", "date", "client_id") DO UPDATE SET
                "last_sequence" = excluded."last_sequence",
                "updated_at" = excluded."updated_at"
            "#,
        )
        .bind(&request.user_id)
        .bind(&date)
        .bind(&request.client_id)
        .bind(sequence)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            user_id = %request.user_id,
            client_id = %request.client_id,
            date = %date,
            sequence,
            delta_seconds = request.delta_seconds,
            total_time_spent = aggregate.total_time_spent,
            "delta applied"
        );

        Ok(ApplyDeltaResponse {
            aggregate,
            applied: true,
            sequence: request.sequence,
            last_applied_sequence: request.sequence,
        })
    }

    pub async fn get_daily(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Option<DailyAggregate>, AggregateError> {
        let row = sqlx::query(SELECT_AGGREGATE)
            .bind(user_id)
            .bind(format_day_key(date))
            .fetch_optional(self.pool())
            .await?;

        row.as_ref().map(map_aggregate).transpose().map_err(Into::into)
    }

    pub async fn last_applied_sequence(
        &self,
        user_id: &str,
        date: NaiveDate,
        client_id: &str,
    ) -> Result<u64, AggregateError> {
        let last: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT "last_sequence" FROM "daily_aggregate_sequences"
            WHERE "user_id" = ? AND "date" = ? AND "client_id" = ?
            "#,
        )
        .bind(user_id)
        .bind(format_day_key(date))
        .bind(client_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(last.unwrap_or(0).max(0) as u64)
    }

    /// 删除早于保留期的序号账本行，汇总行本身保留
    pub async fn prune_ledger(
        &self,
        today: NaiveDate,
        retention_days: u32,
    ) -> Result<LedgerPruneReport, AggregateError> {
        let cutoff = format_day_key(today - Duration::days(i64::from(retention_days)));

        let result = sqlx::query(r#"DELETE FROM "daily_aggregate_sequences" WHERE "date" < ?"#)
            .bind(&cutoff)
            .execute(self.pool())
            .await?;

        Ok(LedgerPruneReport {
            cutoff,
            removed: result.rows_affected(),
        })
    }
}

async fn load_aggregate(
    tx: &mut Transaction<'_, Sqlite>,
    user_id: &str,
    date: &str,
) -> Result<DailyAggregate, sqlx::Error> {
    let row = sqlx::query(SELECT_AGGREGATE)
        .bind(user_id)
        .bind(date)
        .fetch_one(&mut **tx)
        .await?;
    map_aggregate(&row)
}

fn map_aggregate(row: &SqliteRow) -> Result<DailyAggregate, sqlx::Error> {
    Ok(DailyAggregate {
        user_id: row.try_get("user_id")?,
        date: row.try_get("date")?,
        total_time_spent: row.try_get("total_time_spent")?,
        total_activities: row.try_get("total_activities")?,
        questions_attempted: row.try_get("questions_attempted")?,
        questions_correct: row.try_get("questions_correct")?,
        session_count: row.try_get("session_count")?,
        dashboard_visits: row.try_get("dashboard_visits")?,
        ai_tutor_interactions: row.try_get("ai_tutor_interactions")?,
        lessons_completed: row.try_get("lessons_completed")?,
        mock_exams_taken: row.try_get("mock_exams_taken")?,
        average_session_length: row.try_get("average_session_length")?,
        productivity_score: row.try_get("productivity_score")?,
    })
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use study_analytics::{ActivityCounts, ActivityKind};

    use super::*;

    fn request(client_id: &str, sequence: u64, seconds: u64) -> ApplyDeltaRequest {
        ApplyDeltaRequest {
            user_id: "user-1".to_string(),
            client_id: client_id.to_string(),
            date: "2026-03-14".to_string(),
            sequence,
            delta_seconds: seconds,
            delta_counts: ActivityCounts::new(),
            delta_sessions: 0,
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 14).unwrap()
    }

    #[tokio::test]
    async fn test_first_delta_creates_row() {
        let store = AggregateStore::in_memory().await.unwrap();
        let mut req = request("client-a", 1, 45);
        req.delta_counts.add(ActivityKind::AiInteraction, 2);
        req.delta_sessions = 1;

        let resp = store.apply_delta(&req).await.unwrap();
        assert!(resp.applied);
        assert_eq!(resp.aggregate.total_time_spent, 45);
        assert_eq!(resp.aggregate.ai_tutor_interactions, 2);
        assert_eq!(resp.aggregate.session_count, 1);
        assert_eq!(resp.aggregate.average_session_length, 45);

        let stored = store.get_daily("user-1", day()).await.unwrap().unwrap();
        assert_eq!(stored, resp.aggregate);
    }

    #[tokio::test]
    async fn test_duplicate_sequence_is_replayed() {
        let store = AggregateStore::in_memory().await.unwrap();
        store.apply_delta(&request("client-a", 1, 30)).await.unwrap();

        let replay = store.apply_delta(&request("client-a", 1, 30)).await.unwrap();
        assert!(!replay.applied);
        assert_eq!(replay.last_applied_sequence, 1);
        assert_eq!(replay.aggregate.total_time_spent, 30);

        let older = store.apply_delta(&request("client-a", 3, 5)).await.unwrap();
        assert!(older.applied);
        let stale = store.apply_delta(&request("client-a", 2, 99)).await.unwrap();
        assert!(!stale.applied);
        assert_eq!(stale.last_applied_sequence, 3);
        assert_eq!(stale.aggregate.total_time_spent, 35);
    }

    #[tokio::test]
    async fn test_clients_have_independent_sequences() {
        let store = AggregateStore::in_memory().await.unwrap();
        store.apply_delta(&request("client-a", 1, 30)).await.unwrap();
        let resp = store.apply_delta(&request("client-b", 1, 30)).await.unwrap();

        assert!(resp.applied);
        assert_eq!(resp.aggregate.total_time_spent, 60);
        assert_eq!(
            store
                .last_applied_sequence("user-1", day(), "client-b")
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_invalid_request_touches_nothing() {
        let store = AggregateStore::in_memory().await.unwrap();
        let mut req = request("client-a", 1, 30);
        req.date = "14/03/2026".to_string();

        let err = store.apply_delta(&req).await.unwrap_err();
        assert!(err.is_client_error());

        let err = store
            .apply_delta(&request("client-a", u64::MAX, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, AggregateError::SequenceOutOfRange(_)));
        assert!(store.get_daily("user-1", day()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prune_ledger_keeps_recent_days() {
        let store = AggregateStore::in_memory().await.unwrap();
        let mut old = request("client-a", 1, 10);
        old.date = "2026-01-01".to_string();
        store.apply_delta(&old).await.unwrap();
        store.apply_delta(&request("client-a", 1, 10)).await.unwrap();

        let report = store.prune_ledger(day(), 30).await.unwrap();
        assert_eq!(report.cutoff, "2026-02-12");
        assert_eq!(report.removed, 1);
        assert_eq!(
            store
                .last_applied_sequence("user-1", day(), "client-a")
                .await
                .unwrap(),
            1
        );

        let jan = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        assert!(store.get_daily("user-1", jan).await.unwrap().is_some());
    }
}
