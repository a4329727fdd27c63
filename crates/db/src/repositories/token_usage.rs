use sqlx::{sqlite::SqliteRow, Row};

use colloquy_core::domain::usage::{TokenUsageRecord, UsageType};

use super::conversation::parse_timestamp;
use super::{RepositoryError, TokenUsageRepository};
use crate::DbPool;

pub struct SqlTokenUsageRepository {
    pool: DbPool,
}

impl SqlTokenUsageRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TokenUsageRepository for SqlTokenUsageRepository {
    async fn store(&self, record: TokenUsageRecord) -> Result<(), RepositoryError> {
        let amount = i64::try_from(record.amount).map_err(|_| {
            RepositoryError::Decode(format!("token amount {} exceeds i64", record.amount))
        })?;

        sqlx::query(
            "INSERT INTO token_usage (amount, usage_type, model, provider, recorded_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(amount)
        .bind(record.usage_type.as_str())
        .bind(&record.model)
        .bind(&record.provider)
        .bind(record.recorded_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list(&self) -> Result<Vec<TokenUsageRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT amount, usage_type, model, provider, recorded_at
             FROM token_usage
             ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: SqliteRow) -> Result<TokenUsageRecord, RepositoryError> {
    let amount = row.try_get::<i64, _>("amount")?;
    let usage_raw = row.try_get::<String, _>("usage_type")?;
    let usage_type = usage_raw
        .parse::<UsageType>()
        .map_err(|_| RepositoryError::Decode(format!("unknown usage type `{usage_raw}`")))?;

    Ok(TokenUsageRecord {
        amount: u64::try_from(amount).map_err(|_| {
            RepositoryError::Decode(format!("invalid value for `amount`: {amount}"))
        })?,
        usage_type,
        model: row.try_get("model")?,
        provider: row.try_get("provider")?,
        recorded_at: parse_timestamp("recorded_at", row.try_get("recorded_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use colloquy_core::domain::usage::{TokenUsageRecord, UsageType};

    use super::SqlTokenUsageRepository;
    use crate::repositories::TokenUsageRepository;
    use crate::{connect_with_settings, migrations};

    #[tokio::test]
    async fn sql_token_usage_repo_appends_and_lists() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let repo = SqlTokenUsageRepository::new(pool.clone());

        let embedding = TokenUsageRecord::new(8, UsageType::Embedding, "text-embed-3", "openai");
        let completion = TokenUsageRecord::new(40, UsageType::Completion, "gpt-4o", "openai");
        repo.store(embedding.clone()).await.expect("store embedding");
        repo.store(completion.clone()).await.expect("store completion");

        assert_eq!(repo.list().await.expect("list"), vec![embedding, completion]);

        pool.close().await;
    }
}
