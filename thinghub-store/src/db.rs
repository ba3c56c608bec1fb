use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job (
            job_id VARCHAR(64) PRIMARY KEY,
            operation VARCHAR(64) NOT NULL,
            target_config JSONB NOT NULL,
            job_doc JSONB,
            description TEXT NOT NULL DEFAULT '',
            scheduling_config JSONB,
            rollout_config JSONB,
            retry_config JSONB,
            timeout_config JSONB,
            status VARCHAR(20) NOT NULL,
            force_canceled BOOLEAN NOT NULL DEFAULT FALSE,
            comment TEXT NOT NULL DEFAULT '',
            reason_code VARCHAR(64) NOT NULL DEFAULT '',
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            version INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_task (
            task_id BIGSERIAL PRIMARY KEY,
            job_id VARCHAR(64) NOT NULL REFERENCES job(job_id) ON DELETE CASCADE,
            thing_id VARCHAR(128) NOT NULL,
            operation VARCHAR(64) NOT NULL,
            status VARCHAR(20) NOT NULL,
            progress SMALLINT NOT NULL DEFAULT 0,
            status_details JSONB NOT NULL DEFAULT '{}',
            force_canceled BOOLEAN NOT NULL DEFAULT FALSE,
            retry_attempt SMALLINT NOT NULL DEFAULT 0,
            queued_at TIMESTAMPTZ NOT NULL,
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            version INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_status ON job(status)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_created_at ON job(created_at DESC)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_task_job_status ON job_task(job_id, status)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_task_thing_id ON job_task(thing_id)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
