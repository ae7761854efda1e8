//! Schema repair
//!
//! Brings an existing database up to the layout the PostgreSQL backend
//! expects. Runs only when asked to (CLI `repair` or `database.auto_repair`);
//! read paths never touch the schema.

use crate::store::TableNames;
use crate::Result;
use sqlx::PgPool;

/// Steps applied by one [`repair`] run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RepairReport {
    pub created_tables: Vec<String>,
    pub added_columns: Vec<String>,
    /// Legacy invitation rows given a `used_at`
    pub backfilled_invitations: u64,
}

impl RepairReport {
    pub fn is_noop(&self) -> bool {
        self.created_tables.is_empty()
            && self.added_columns.is_empty()
            && self.backfilled_invitations == 0
    }
}

fn table_ddl(tables: &TableNames) -> Vec<(&str, String)> {
    vec![
        (
            tables.users.as_str(),
            format!(
                "CREATE TABLE {} (
                    id BIGSERIAL PRIMARY KEY,
                    email TEXT NOT NULL UNIQUE,
                    password_hash TEXT NOT NULL,
                    role TEXT NOT NULL DEFAULT 'client',
                    verified BOOLEAN NOT NULL DEFAULT FALSE,
                    token_version BIGINT NOT NULL DEFAULT 0,
                    customer_id BIGINT,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )",
                tables.users
            ),
        ),
        (
            tables.issued_tokens.as_str(),
            format!(
                "CREATE TABLE {} (
                    user_id BIGINT PRIMARY KEY,
                    token_hash TEXT NOT NULL,
                    token_jti TEXT,
                    refresh_token_hash TEXT,
                    refresh_jti TEXT,
                    expires_at TIMESTAMPTZ NOT NULL,
                    refresh_expires_at TIMESTAMPTZ,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    revoked BOOLEAN NOT NULL DEFAULT FALSE,
                    revoked_at TIMESTAMPTZ,
                    revoked_reason TEXT,
                    last_used_at TIMESTAMPTZ
                )",
                tables.issued_tokens
            ),
        ),
        (
            tables.token_blacklist.as_str(),
            format!(
                "CREATE TABLE {} (
                    token_id TEXT PRIMARY KEY,
                    user_id BIGINT NOT NULL,
                    original_exp TIMESTAMPTZ NOT NULL,
                    blacklisted_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    reason TEXT NOT NULL
                )",
                tables.token_blacklist
            ),
        ),
        (
            tables.invitations.as_str(),
            format!(
                "CREATE TABLE {} (
                    token TEXT PRIMARY KEY,
                    email TEXT NOT NULL,
                    customer_id BIGINT NOT NULL,
                    used_at TIMESTAMPTZ,
                    used_by_user_id BIGINT,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    expires_at TIMESTAMPTZ NOT NULL
                )",
                tables.invitations
            ),
        ),
        (
            tables.rate_limits.as_str(),
            format!(
                "CREATE TABLE {} (
                    ip TEXT NOT NULL,
                    action TEXT NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    window_started_at TIMESTAMPTZ NOT NULL,
                    locked_until TIMESTAMPTZ,
                    PRIMARY KEY (ip, action)
                )",
                tables.rate_limits
            ),
        ),
    ]
}

/// Columns that older deployments may lack: (table, column, type)
fn late_columns(tables: &TableNames) -> Vec<(&str, &'static str, &'static str)> {
    vec![
        (
            tables.users.as_str(),
            "token_version",
            "BIGINT NOT NULL DEFAULT 0",
        ),
        (tables.issued_tokens.as_str(), "token_jti", "TEXT"),
        (tables.issued_tokens.as_str(), "refresh_jti", "TEXT"),
        (tables.issued_tokens.as_str(), "revoked_reason", "TEXT"),
        (tables.issued_tokens.as_str(), "last_used_at", "TIMESTAMPTZ"),
        (tables.invitations.as_str(), "used_at", "TIMESTAMPTZ"),
        (tables.invitations.as_str(), "used_by_user_id", "BIGINT"),
    ]
}

async fn table_exists(pool: &PgPool, table: &str) -> Result<bool> {
    Ok(sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
         WHERE table_schema = current_schema() AND table_name = $1)",
    )
    .bind(table)
    .fetch_one(pool)
    .await?)
}

async fn column_exists(pool: &PgPool, table: &str, column: &str) -> Result<bool> {
    Ok(sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (SELECT 1 FROM information_schema.columns \
         WHERE table_schema = current_schema() AND table_name = $1 AND column_name = $2)",
    )
    .bind(table)
    .bind(column)
    .fetch_one(pool)
    .await?)
}

/// Create missing tables, add missing columns and normalize legacy
/// invitation rows so that `used_at` is the only used indicator.
pub async fn repair(pool: &PgPool, prefix: &str) -> Result<RepairReport> {
    let tables = TableNames::new(prefix)?;
    let mut report = RepairReport::default();

    for (name, ddl) in table_ddl(&tables) {
        if !table_exists(pool, name).await? {
            sqlx::query(&ddl).execute(pool).await?;
            tracing::info!(table = name, "Created missing table");
            report.created_tables.push(name.to_string());
        }
    }

    for (table, column, ty) in late_columns(&tables) {
        if !column_exists(pool, table, column).await? {
            let sql = format!("ALTER TABLE {table} ADD COLUMN {column} {ty}");
            sqlx::query(&sql).execute(pool).await?;
            tracing::info!(table, column, "Added missing column");
            report.added_columns.push(format!("{table}.{column}"));
        }
    }

    // Rows written before used_at existed may only carry the old flag or the
    // redeemer id
    let legacy_flag = column_exists(pool, &tables.invitations, "used").await?;
    let condition = if legacy_flag {
        "used_at IS NULL AND (used_by_user_id IS NOT NULL OR used::int <> 0)"
    } else {
        "used_at IS NULL AND used_by_user_id IS NOT NULL"
    };
    let sql = format!(
        "UPDATE {} SET used_at = created_at WHERE {condition}",
        tables.invitations
    );
    report.backfilled_invitations = sqlx::query(&sql).execute(pool).await?.rows_affected();
    if report.backfilled_invitations > 0 {
        tracing::warn!(
            rows = report.backfilled_invitations,
            "Backfilled used_at on legacy invitation rows"
        );
    }

    let blacklist_index = format!(
        "CREATE INDEX IF NOT EXISTS {0}_original_exp_idx ON {0} (original_exp)",
        tables.token_blacklist
    );
    sqlx::query(&blacklist_index).execute(pool).await?;

    if report.is_noop() {
        tracing::info!(prefix, "Schema already up to date");
    } else {
        tracing::info!(
            prefix,
            tables = report.created_tables.len(),
            columns = report.added_columns.len(),
            backfilled = report.backfilled_invitations,
            "Schema repair complete"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_table_has_ddl() {
        let tables = TableNames::new("gh_").unwrap();
        let ddl = table_ddl(&tables);
        assert_eq!(ddl.len(), 5);
        for (name, sql) in &ddl {
            assert!(name.starts_with("gh_"));
            assert!(sql.contains(&format!("CREATE TABLE {name} (")));
        }
    }

    #[test]
    fn test_late_columns_exist_in_fresh_ddl() {
        let tables = TableNames::new("").unwrap();
        let ddl = table_ddl(&tables);
        for (table, column, _) in late_columns(&tables) {
            let (_, sql) = ddl.iter().find(|(name, _)| *name == table).unwrap();
            assert!(sql.contains(column), "{table} is missing {column}");
        }
    }

    #[test]
    fn test_empty_report_is_noop() {
        assert!(RepairReport::default().is_noop());
        let report = RepairReport {
            backfilled_invitations: 2,
            ..Default::default()
        };
        assert!(!report.is_noop());
    }
}
