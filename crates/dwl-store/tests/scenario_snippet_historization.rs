//! Scenario: SqlSnippet historization.
//!
//! # Invariant under test
//! One current row per snippet code. An unchanged body (modulo trailing
//! semicolon and whitespace) returns the existing id; a changed body flips
//! the old row to N and inserts the new current row.

use dwl_store::{snippets, SqlValue};
use dwl_testkit::{sqlite_harness, TEST_ACTOR};

#[tokio::test]
async fn unchanged_body_is_idempotent_and_change_historizes() -> anyhow::Result<()> {
    let h = sqlite_harness().await?;

    let (first_id, changed) = snippets::upsert(
        &h.store,
        &h.ids,
        "CUSTOMER_QUERY",
        "SELECT * FROM customers",
        TEST_ACTOR,
    )
    .await?;
    assert!(changed);
    assert_eq!(first_id, 1);

    // Same body with a trailing semicolon and spaces: same row, same id.
    let (same_id, changed) = snippets::upsert(
        &h.store,
        &h.ids,
        "CUSTOMER_QUERY",
        "  SELECT * FROM customers ;  ",
        TEST_ACTOR,
    )
    .await?;
    assert!(!changed);
    assert_eq!(same_id, first_id);
    assert_eq!(
        h.count("select count(*) as n from dwl_sql_snippets").await?,
        1
    );

    // Changed body: prior row flips to N, a new current row appears.
    let (new_id, changed) = snippets::upsert(
        &h.store,
        &h.ids,
        "CUSTOMER_QUERY",
        "SELECT * FROM customers WHERE active=1",
        TEST_ACTOR,
    )
    .await?;
    assert!(changed);
    assert_eq!(new_id, 2);

    assert_eq!(
        h.count("select count(*) as n from dwl_sql_snippets").await?,
        2
    );
    assert_eq!(
        h.count(
            "select count(*) as n from dwl_sql_snippets \
             where code = 'CUSTOMER_QUERY' and current_flag = 'Y'"
        )
        .await?,
        1
    );

    let current = snippets::current(&h.store, "CUSTOMER_QUERY")
        .await?
        .expect("current row exists");
    assert_eq!(current.id, new_id);
    assert_eq!(current.body, "SELECT * FROM customers WHERE active=1");

    // The historized row is still readable under its old id.
    let row = h
        .store
        .query_one(
            "select current_flag from dwl_sql_snippets where id = :id",
            &[("id", SqlValue::from(first_id))],
        )
        .await?;
    assert_eq!(dwl_store::rows::text(&row, "current_flag")?, "N");

    Ok(())
}
