use colloquy_core::chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, Sqlite, Transaction};
use tracing::debug;

use colloquy_core::domain::agent::AgentId;
use colloquy_core::domain::conversation::{
    Conversation, ConversationId, MessageGroup, MessageGroupId,
};
use colloquy_core::domain::message::{ChatMessage, FinishReason};

use super::{ConversationRepository, RepositoryError};
use crate::DbPool;

pub struct SqlConversationRepository {
    pool: DbPool,
}

impl SqlConversationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ConversationRepository for SqlConversationRepository {
    async fn insert_conversation_with_message_group(
        &self,
        conversation: Conversation,
        group: MessageGroup,
    ) -> Result<(), RepositoryError> {
        if group.conversation_id != conversation.id {
            return Err(RepositoryError::Conflict(format!(
                "message group {} does not belong to conversation {}",
                group.id.0, conversation.id.0
            )));
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO conversation (id, agent_id, user_id, title, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&conversation.id.0)
        .bind(&conversation.agent_id.0)
        .bind(&conversation.user_id)
        .bind(conversation.title.as_deref())
        .bind(conversation.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|error| conflict_or_database(error, "conversation", &conversation.id.0))?;

        insert_group(&mut tx, &group).await?;

        // Dropping `tx` on any error above rolls both inserts back.
        tx.commit().await?;

        debug!(
            event_name = "db.conversation.created",
            conversation_id = %conversation.id.0,
            group_id = %group.id.0,
            "conversation header and first message group stored"
        );
        Ok(())
    }

    async fn insert_message_group(&self, group: MessageGroup) -> Result<(), RepositoryError> {
        let exists = sqlx::query("SELECT 1 FROM conversation WHERE id = ?")
            .bind(&group.conversation_id.0)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if !exists {
            return Err(RepositoryError::NotFound(format!(
                "conversation {}",
                group.conversation_id.0
            )));
        }

        let mut tx = self.pool.begin().await?;
        insert_group(&mut tx, &group).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_title(&self, id: &ConversationId, title: &str) -> Result<(), RepositoryError> {
        let updated = sqlx::query("UPDATE conversation SET title = ? WHERE id = ?")
            .bind(title)
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        if updated.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("conversation {}", id.0)));
        }
        Ok(())
    }

    async fn find_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, agent_id, user_id, title, created_at
             FROM conversation
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(conversation_from_row).transpose()
    }

    async fn list_message_groups(
        &self,
        id: &ConversationId,
    ) -> Result<Vec<MessageGroup>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                conversation_id,
                agent_id,
                configuration_version,
                finish_reason,
                messages_json,
                created_at
             FROM message_group
             WHERE conversation_id = ?
             ORDER BY created_at ASC, rowid ASC",
        )
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(group_from_row).collect()
    }
}

async fn insert_group(
    tx: &mut Transaction<'_, Sqlite>,
    group: &MessageGroup,
) -> Result<(), RepositoryError> {
    let messages_json = serde_json::to_string(&group.messages)
        .map_err(|error| RepositoryError::Decode(format!("encode messages: {error}")))?;

    sqlx::query(
        "INSERT INTO message_group (
            id,
            conversation_id,
            agent_id,
            configuration_version,
            finish_reason,
            messages_json,
            created_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&group.id.0)
    .bind(&group.conversation_id.0)
    .bind(&group.agent_id.0)
    .bind(i64::from(group.configuration_version))
    .bind(group.finish_reason.as_str())
    .bind(messages_json)
    .bind(group.created_at.to_rfc3339())
    .execute(&mut **tx)
    .await
    .map_err(|error| conflict_or_database(error, "message group", &group.id.0))?;

    Ok(())
}

fn conflict_or_database(error: sqlx::Error, entity: &str, id: &str) -> RepositoryError {
    let unique = error.as_database_error().is_some_and(|db_error| db_error.is_unique_violation());
    if unique {
        RepositoryError::Conflict(format!("{entity} {id} already exists"))
    } else {
        RepositoryError::Database(error)
    }
}

fn conversation_from_row(row: SqliteRow) -> Result<Conversation, RepositoryError> {
    Ok(Conversation {
        id: ConversationId(row.try_get("id")?),
        agent_id: AgentId(row.try_get("agent_id")?),
        user_id: row.try_get("user_id")?,
        title: row.try_get("title")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn group_from_row(row: SqliteRow) -> Result<MessageGroup, RepositoryError> {
    let messages_raw = row.try_get::<String, _>("messages_json")?;
    let messages = serde_json::from_str::<Vec<ChatMessage>>(&messages_raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid messages_json: {error}")))?;

    let version = row.try_get::<i64, _>("configuration_version")?;
    let configuration_version = u32::try_from(version).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `configuration_version` (expected non-negative u32): {version}"
        ))
    })?;

    Ok(MessageGroup {
        id: MessageGroupId(row.try_get("id")?),
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        agent_id: AgentId(row.try_get("agent_id")?),
        configuration_version,
        messages,
        finish_reason: FinishReason::parse(&row.try_get::<String, _>("finish_reason")?),
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}
