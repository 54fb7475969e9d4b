/// Migrating twice must be idempotent.
///
/// DB-backed test, skipped if CONVEYOR_DATABASE_URL is not set.
#[tokio::test]
async fn migrate_idempotent_on_clean_db() -> anyhow::Result<()> {
    if std::env::var(conveyor_db::ENV_DB_URL).is_err() {
        eprintln!("SKIP: CONVEYOR_DATABASE_URL not set");
        return Ok(());
    }

    let pool = conveyor_db::connect_from_env().await?;

    conveyor_db::migrate(&pool).await?;
    conveyor_db::migrate(&pool).await?;

    Ok(())
}
