use tracing::{debug, info};

use crate::GraphClient;

/// Postgres error codes meaning "someone else already created it".
const ALREADY_EXISTS: &[&str] = &["42P07", "42710", "23505"];

/// Quote a partition-derived identifier. Partition names are already limited
/// to `[a-z0-9_-]`, so quoting is enough to make them safe.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', ""))
}

/// Create one partition's table and indexes. Idempotent: concurrent callers
/// racing on the same partition both succeed.
pub async fn migrate(client: &GraphClient, partition: &str) -> Result<(), sqlx::Error> {
    let table = quote_ident(partition);

    info!(partition, "Ensuring graph partition");

    let statements = [
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                version BIGINT NOT NULL DEFAULT 1,
                doc JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        ),
        // doc @> filter lookups (tags, sources, edge targets, jobs, status)
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {table} USING GIN (doc jsonb_path_ops)",
            quote_ident(&format!("{partition}_doc_idx"))
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {table} ((doc->>'canonical_value'))",
            quote_ident(&format!("{partition}_canonical_idx"))
        ),
    ];

    for statement in &statements {
        run_ignoring_exists(client, statement).await?;
    }

    debug!(partition, "Graph partition ready");
    Ok(())
}

async fn run_ignoring_exists(client: &GraphClient, statement: &str) -> Result<(), sqlx::Error> {
    match sqlx::query(statement).execute(&client.pool).await {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(e))
            if e.code().is_some_and(|code| ALREADY_EXISTS.contains(&code.as_ref())) =>
        {
            debug!(statement, "Already exists, skipping");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_partition_names() {
        assert_eq!(quote_ident("graph-p1"), "\"graph-p1\"");
        assert_eq!(quote_ident("graph-\"x"), "\"graph-x\"");
    }
}
