//! PostgreSQL document store tests
//!
//! These run against a real database through `#[sqlx::test]`, which creates
//! a scratch database per test and applies the workspace migrations.
//! Run with `DATABASE_URL` set and `--ignored`.

use flarepipe_ingest::store::{DocumentStore, PgDocumentStore, UpsertOutcome};
use serde_json::json;
use sqlx::PgPool;

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_upsert_inserts_then_replaces(pool: PgPool) -> sqlx::Result<()> {
    let store = PgDocumentStore::new(pool.clone());

    let first = json!({"_id": "nvd_CVE-2024-0001", "description": "first"});
    let second = json!({"_id": "nvd_CVE-2024-0001", "description": "second"});

    let outcome = store.upsert("nvd_cves_raw", "nvd_CVE-2024-0001", &first).await.unwrap();
    assert_eq!(outcome, UpsertOutcome::Inserted);
    let outcome = store.upsert("nvd_cves_raw", "nvd_CVE-2024-0001", &second).await.unwrap();
    assert_eq!(outcome, UpsertOutcome::Replaced);

    let body: serde_json::Value =
        sqlx::query_scalar("SELECT body FROM documents WHERE collection = $1 AND id = $2")
            .bind("nvd_cves_raw")
            .bind("nvd_CVE-2024-0001")
            .fetch_one(&pool)
            .await?;
    assert_eq!(body["description"], "second");
    assert_eq!(store.count("nvd_cves_raw", &json!({})).await.unwrap(), 1);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_count_filters_by_containment(pool: PgPool) -> sqlx::Result<()> {
    let store = PgDocumentStore::new(pool);

    for (id, code) in [("a", "NOERROR"), ("b", "NXDOMAIN"), ("c", "NOERROR")] {
        store
            .upsert("cloudflare_doh_raw", id, &json!({"response_code": code}))
            .await
            .unwrap();
    }
    store
        .upsert("cloudflare_trace_raw", "a", &json!({"response_code": "NOERROR"}))
        .await
        .unwrap();

    let filter = json!({"response_code": "NOERROR"});
    assert_eq!(store.count("cloudflare_doh_raw", &filter).await.unwrap(), 2);
    assert_eq!(store.count("cloudflare_doh_raw", &json!({})).await.unwrap(), 3);
    assert_eq!(store.count("nvd_cves_raw", &json!({})).await.unwrap(), 0);

    Ok(())
}
