//! Append-only/update-in-place persistence of `calls` and `call_events`
//! (spec.md §4.3). Grounded on `app/services/call_recorder.py`: each
//! operation is one short transaction against a shared pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::RecorderError;

#[async_trait]
pub trait Recorder: Send + Sync {
    async fn ensure_call_row(
        &self,
        call_id: Uuid,
        caller_exten: Option<&str>,
        callee_exten: Option<&str>,
        caller_channel_id: Option<&str>,
    ) -> Result<(), RecorderError>;

    #[allow(clippy::too_many_arguments)]
    async fn add_event(
        &self,
        call_id: Option<Uuid>,
        ts: Option<DateTime<Utc>>,
        etype: Option<&str>,
        channel_id: Option<&str>,
        bridge_id: Option<&str>,
        raw: serde_json::Value,
    ) -> Result<(), RecorderError>;

    async fn mark_bridged(
        &self,
        call_id: Uuid,
        bridge_id: &str,
        caller_channel_id: &str,
        callee_channel_id: &str,
    ) -> Result<(), RecorderError>;

    async fn mark_failed(&self, call_id: Uuid, reason: &str) -> Result<(), RecorderError>;

    async fn mark_ended(
        &self,
        call_id: Uuid,
        ended_at: Option<DateTime<Utc>>,
        hangup_cause: Option<i32>,
        hangup_reason: Option<&str>,
    ) -> Result<(), RecorderError>;
}

pub struct CallRecorder {
    pool: PgPool,
}

impl CallRecorder {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Recorder for CallRecorder {
    async fn ensure_call_row(
        &self,
        call_id: Uuid,
        caller_exten: Option<&str>,
        callee_exten: Option<&str>,
        caller_channel_id: Option<&str>,
    ) -> Result<(), RecorderError> {
        let mut tx = self.pool.begin().await?;
        // ON CONFLICT DO NOTHING is the idempotent check-then-insert the
        // spec calls for: a second call for the same id is a harmless no-op,
        // and a race between two concurrent inserts for the same id never
        // produces a duplicate-key error.
        sqlx::query(
            r#"
            INSERT INTO calls (id, caller_exten, callee_exten, caller_channel_id, status, direction, started_at)
            VALUES ($1, $2, $3, $4, 'new', 'internal', now())
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(call_id)
        .bind(caller_exten)
        .bind(callee_exten)
        .bind(caller_channel_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn add_event(
        &self,
        call_id: Option<Uuid>,
        ts: Option<DateTime<Utc>>,
        etype: Option<&str>,
        channel_id: Option<&str>,
        bridge_id: Option<&str>,
        raw: serde_json::Value,
    ) -> Result<(), RecorderError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO call_events (call_id, ts, type, channel_id, bridge_id, raw)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(call_id)
        .bind(ts)
        .bind(etype)
        .bind(channel_id)
        .bind(bridge_id)
        .bind(raw)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn mark_bridged(
        &self,
        call_id: Uuid,
        bridge_id: &str,
        caller_channel_id: &str,
        callee_channel_id: &str,
    ) -> Result<(), RecorderError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE calls
            SET bridge_id = $2,
                caller_channel_id = $3,
                callee_channel_id = $4,
                status = 'up',
                answered_at = now()
            WHERE id = $1
            "#,
        )
        .bind(call_id)
        .bind(bridge_id)
        .bind(caller_channel_id)
        .bind(callee_channel_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn mark_failed(&self, call_id: Uuid, reason: &str) -> Result<(), RecorderError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE calls
            SET status = 'failed', hangup_reason = $2, ended_at = now()
            WHERE id = $1
            "#,
        )
        .bind(call_id)
        .bind(reason)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn mark_ended(
        &self,
        call_id: Uuid,
        ended_at: Option<DateTime<Utc>>,
        hangup_cause: Option<i32>,
        hangup_reason: Option<&str>,
    ) -> Result<(), RecorderError> {
        let mut tx = self.pool.begin().await?;
        // spec.md §4.3: "the provided cause/reason if non-null" — a null
        // argument leaves the existing column alone rather than clobbering
        // it, which is what makes the defensive second `mark_ended` call
        // (spec.md §9) harmless.
        sqlx::query(
            r#"
            UPDATE calls
            SET ended_at = COALESCE($2, now()),
                hangup_cause = COALESCE($3, hangup_cause),
                hangup_reason = COALESCE($4, hangup_reason),
                status = 'ended'
            WHERE id = $1
            "#,
        )
        .bind(call_id)
        .bind(ended_at)
        .bind(hangup_cause)
        .bind(hangup_reason)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}
