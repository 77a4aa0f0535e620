//! Runs against a live Postgres when `DATABASE_URL` is set; otherwise each test returns early.
//! Every test owns a distinct far-past date and clears it before and after.

use chrono::NaiveDate;
use cpa_core::{derive_batch, parse_date, MetricRecord};
use cpa_storage::{PostgresRepository, Repository};
use tokio::sync::Mutex;

// Concurrent CREATE TABLE IF NOT EXISTS can race on a fresh database.
static SERIAL: Mutex<()> = Mutex::const_new(());

async fn connect_from_env() -> Option<PostgresRepository> {
    let database_url = std::env::var("DATABASE_URL").ok()?;
    Some(
        PostgresRepository::connect(&database_url, 2)
            .await
            .expect("connect and ensure schema"),
    )
}

fn day(s: &str) -> NaiveDate {
    parse_date(s).expect("date")
}

async fn clear(repo: &PostgresRepository, date: NaiveDate) {
    sqlx::query("DELETE FROM daily_stats WHERE date = $1")
        .bind(date)
        .execute(repo.pool())
        .await
        .expect("clear daily_stats");
    sqlx::query("DELETE FROM daily_stats_batches WHERE date = $1")
        .bind(date)
        .execute(repo.pool())
        .await
        .expect("clear daily_stats_batches");
}

type StoredRow = (NaiveDate, String, f64, i64, Option<f64>);

async fn rows_for(repo: &PostgresRepository, date: NaiveDate) -> Vec<StoredRow> {
    sqlx::query_as(
        "SELECT date, campaign_id, spend, conversions, cpa FROM daily_stats \
         WHERE date = $1 ORDER BY campaign_id",
    )
    .bind(date)
    .fetch_all(repo.pool())
    .await
    .expect("select rows")
}

async fn marker_for(repo: &PostgresRepository, date: NaiveDate) -> Option<(i64, String)> {
    sqlx::query_as("SELECT record_count, content_sha256 FROM daily_stats_batches WHERE date = $1")
        .bind(date)
        .fetch_optional(repo.pool())
        .await
        .expect("select marker")
}

#[tokio::test]
async fn postgres_upsert_twice_leaves_same_state() {
    let _serial = SERIAL.lock().await;
    let Some(repo) = connect_from_env().await else {
        return;
    };
    let date = day("1999-01-01");
    clear(&repo, date).await;

    let batch = derive_batch(vec![
        MetricRecord::new(date, "CAMP-123", 37.5, 14),
        MetricRecord::new(date, "CAMP-456", 0.0, 3),
        MetricRecord::new(date, "CAMP-789", 11.0, 0),
    ]);

    let first = repo.upsert(&batch).await.expect("first upsert");
    let rows_once = rows_for(&repo, date).await;
    let marker_once = marker_for(&repo, date).await;

    let second = repo.upsert(&batch).await.expect("second upsert");
    assert_eq!(first, second);
    assert_eq!(rows_for(&repo, date).await, rows_once);
    assert_eq!(marker_for(&repo, date).await, marker_once);

    assert_eq!(rows_once.len(), 3);
    assert_eq!(rows_once[1].4, Some(0.0));
    assert_eq!(rows_once[2].4, None);
    let (count, digest) = marker_once.expect("marker written");
    assert_eq!(count, 3);
    assert_eq!(digest, first.batches[0].content_sha256);

    clear(&repo, date).await;
}

#[tokio::test]
async fn postgres_upsert_overwrites_existing_key() {
    let _serial = SERIAL.lock().await;
    let Some(repo) = connect_from_env().await else {
        return;
    };
    let date = day("1999-01-02");
    clear(&repo, date).await;

    repo.upsert(&derive_batch(vec![MetricRecord::new(date, "CAMP-123", 10.0, 2)]))
        .await
        .expect("initial upsert");
    repo.upsert(&derive_batch(vec![MetricRecord::new(date, "CAMP-123", 42.0, 0)]))
        .await
        .expect("overwrite");

    assert_eq!(
        rows_for(&repo, date).await,
        vec![(date, "CAMP-123".to_string(), 42.0, 0, None)]
    );

    clear(&repo, date).await;
}

#[tokio::test]
async fn postgres_exists_tracks_stored_dates() {
    let _serial = SERIAL.lock().await;
    let Some(repo) = connect_from_env().await else {
        return;
    };
    let stored = day("1999-01-03");
    let missing = day("1999-01-04");
    clear(&repo, stored).await;
    clear(&repo, missing).await;

    assert!(!repo.exists(stored).await.expect("exists before"));
    repo.upsert(&derive_batch(vec![MetricRecord::new(stored, "CAMP-123", 1.0, 1)]))
        .await
        .expect("upsert");

    assert!(repo.exists(stored).await.expect("exists after"));
    assert!(!repo.exists(missing).await.expect("exists other day"));

    clear(&repo, stored).await;
}

#[tokio::test]
async fn postgres_schema_bootstrap_is_repeatable() {
    let _serial = SERIAL.lock().await;
    let Some(repo) = connect_from_env().await else {
        return;
    };
    repo.ensure_schema().await.expect("second ensure_schema");
    repo.ensure_schema().await.expect("third ensure_schema");
}
