use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::errors::SessionResult;
use crate::ids::SessionId;
use crate::model::{CompleteSessionOptions, Sender, StoredMessage};

/// Persistence boundary (spec §6 "Persistence (store interface)"). Kept
/// narrow and trait-object friendly so the session controller can be
/// exercised in tests against an in-memory fake.
#[async_trait]
pub trait SessionRepo: Send + Sync {
    async fn create_session(
        &self,
        room_id: &str,
        primary_user_id: Option<Uuid>,
    ) -> SessionResult<SessionId>;

    async fn store_message(&self, message: &StoredMessage) -> SessionResult<()>;

    async fn complete_session(
        &self,
        session_id: SessionId,
        options: CompleteSessionOptions,
    ) -> SessionResult<()>;

    /// Idempotent: marks any session for `room_id` (or all rooms, if
    /// `None`) left open by a crashed prior process as completed.
    async fn cleanup_abandoned_sessions(&self, room_id: Option<&str>) -> SessionResult<()>;
}

#[derive(Clone)]
pub struct PgSessionRepo {
    pool: PgPool,
}

impl PgSessionRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn tx(&self) -> SessionResult<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }
}

#[async_trait]
impl SessionRepo for PgSessionRepo {
    async fn create_session(
        &self,
        room_id: &str,
        primary_user_id: Option<Uuid>,
    ) -> SessionResult<SessionId> {
        let mut tx = self.tx().await?;
        let id = SessionId::new();
        sqlx::query(
            r#"
            INSERT INTO coaching_sessions (id, room_id, primary_user_id, started_at)
            VALUES ($1, $2, $3, NOW())
            "#,
        )
        .bind(id.0)
        .bind(room_id)
        .bind(primary_user_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn store_message(&self, message: &StoredMessage) -> SessionResult<()> {
        let mut tx = self.tx().await?;
        sqlx::query(
            r#"
            INSERT INTO coaching_messages (id, session_id, content, sender, user_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(message.id.0)
        .bind(message.session_id.0)
        .bind(&message.content)
        .bind(sender_to_db(message.sender))
        .bind(message.user_id)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn complete_session(
        &self,
        session_id: SessionId,
        options: CompleteSessionOptions,
    ) -> SessionResult<()> {
        let mut tx = self.tx().await?;

        let transcript_concat: Option<String> = if options.generate_transcript {
            let rows: Vec<(String, String)> = sqlx::query_as(
                r#"
                SELECT sender, content
                FROM coaching_messages
                WHERE session_id = $1
                ORDER BY created_at ASC
                "#,
            )
            .bind(session_id.0)
            .fetch_all(&mut *tx)
            .await?;
            Some(
                rows.into_iter()
                    .map(|(sender, content)| format!("{sender}: {content}"))
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
        } else {
            None
        };

        sqlx::query(
            r#"
            UPDATE coaching_sessions
            SET completed_at = NOW(), ai_summary = $2, transcript_concat = $3
            WHERE id = $1 AND completed_at IS NULL
            "#,
        )
        .bind(session_id.0)
        .bind(options.ai_summary)
        .bind(transcript_concat)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn cleanup_abandoned_sessions(&self, room_id: Option<&str>) -> SessionResult<()> {
        let mut tx = self.tx().await?;
        sqlx::query(
            r#"
            UPDATE coaching_sessions
            SET completed_at = NOW()
            WHERE completed_at IS NULL
              AND ($1::text IS NULL OR room_id = $1)
            "#,
        )
        .bind(room_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

fn sender_to_db(sender: Sender) -> &'static str {
    match sender {
        Sender::Client => "client",
        Sender::Coach => "coach",
        Sender::Ai => "ai",
    }
}
