//! Scenario: SCD merge disciplines, end to end through the engine.
//!
//! # Invariants under test
//! - SCD-1 is absorptive: the same source row applied twice yields the
//!   same single target row;
//! - SCD-2 keeps exactly one current row per PK; each change expires the
//!   old row and inserts the new current one; an unchanged rerun writes
//!   nothing;
//! - two consecutive SCD-2 changes leave two expired rows and one current.

use std::sync::Arc;

use dwl_compiler::Compiler;
use dwl_engine::ExecutionEngine;
use dwl_schemas::codes::{RunStatus, ScdType};
use dwl_schemas::RunPayload;
use dwl_store::SqlValue;
use dwl_testkit::{detail_draft, mapping_draft, sqlite_harness, TestHarness, TEST_ACTOR};

const SOURCE_SQL: &str = "select id, name from customers";

struct Stack {
    compiler: Compiler,
    engine: ExecutionEngine,
}

fn stack(h: &TestHarness) -> Stack {
    Stack {
        compiler: Compiler::new(
            h.store.clone(),
            h.store.clone(),
            Arc::clone(&h.ids),
            TEST_ACTOR,
        ),
        engine: ExecutionEngine::new(
            h.config.clone(),
            h.store.clone(),
            Arc::clone(&h.ids),
            TEST_ACTOR,
        ),
    }
}

async fn compiled_mapping(h: &TestHarness, s: &Stack, reference: &str, scd: ScdType) -> anyhow::Result<()> {
    h.create_target("customer_dim", &[("cust_id", "integer"), ("cust_name", "text")])
        .await?;
    s.compiler
        .upsert_mapping(&mapping_draft(reference, "customer_dim"))
        .await?;
    s.compiler
        .upsert_mapping_detail(&detail_draft(
            reference, "cust_id", "id", SOURCE_SQL, Some(1), 1,
        ))
        .await?;
    let mut name = detail_draft(reference, "cust_name", "name", SOURCE_SQL, None, 2);
    name.scd_type = scd;
    s.compiler.upsert_mapping_detail(&name).await?;
    s.compiler.compile(reference).await?;
    Ok(())
}

async fn rename_customer(h: &TestHarness, id: i64, name: &str) -> anyhow::Result<()> {
    h.store
        .exec(
            "update customers set name = :name where id = :id",
            &[("name", SqlValue::from(name)), ("id", SqlValue::from(id))],
        )
        .await?;
    Ok(())
}

#[tokio::test]
async fn scd1_is_absorptive() -> anyhow::Result<()> {
    let h = sqlite_harness().await?;
    h.seed_source("customers", &[(7, "A"), (8, "B")]).await?;
    let s = stack(&h);
    compiled_mapping(&h, &s, "CUST_DIM", ScdType::Type1).await?;

    let first = s.engine.execute("CUST_DIM", &RunPayload::regular()).await?;
    assert_eq!(first.status, RunStatus::Complete);
    assert_eq!(first.rows_read, 2);
    assert_eq!(first.rows_written, 2);

    // Same source again: hash-equal rows are skipped, state unchanged.
    let second = s.engine.execute("CUST_DIM", &RunPayload::regular()).await?;
    assert_eq!(second.status, RunStatus::Complete);
    assert_eq!(second.rows_written, 0);
    assert_eq!(
        h.count("select count(*) as n from customer_dim").await?,
        2
    );

    // An SCD-1 change updates in place: still two rows, value replaced,
    // audit columns filled.
    rename_customer(&h, 7, "A2").await?;
    let third = s.engine.execute("CUST_DIM", &RunPayload::regular()).await?;
    assert_eq!(third.rows_written, 1);
    assert_eq!(
        h.count("select count(*) as n from customer_dim").await?,
        2
    );
    assert_eq!(
        h.count(
            "select count(*) as n from customer_dim \
             where cust_id = 7 and cust_name = 'A2' and updtby is not null"
        )
        .await?,
        1
    );

    Ok(())
}

#[tokio::test]
async fn scd2_expires_and_inserts_exactly_one_current_row() -> anyhow::Result<()> {
    let h = sqlite_harness().await?;
    h.seed_source("customers", &[(7, "A")]).await?;
    let s = stack(&h);
    compiled_mapping(&h, &s, "CUST_DIM", ScdType::Type2).await?;

    // Initial load: one current row.
    s.engine.execute("CUST_DIM", &RunPayload::regular()).await?;
    assert_eq!(
        h.count(
            "select count(*) as n from customer_dim \
             where cust_id = 7 and curr_flag = 'Y' and end_dt is null"
        )
        .await?,
        1
    );

    // Change: old row expires, new row becomes current.
    rename_customer(&h, 7, "B").await?;
    let run = s.engine.execute("CUST_DIM", &RunPayload::regular()).await?;
    assert_eq!(run.status, RunStatus::Complete);

    assert_eq!(
        h.count("select count(*) as n from customer_dim where cust_id = 7").await?,
        2
    );
    assert_eq!(
        h.count(
            "select count(*) as n from customer_dim \
             where cust_id = 7 and curr_flag = 'N' and cust_name = 'A' and end_dt is not null"
        )
        .await?,
        1
    );
    assert_eq!(
        h.count(
            "select count(*) as n from customer_dim \
             where cust_id = 7 and curr_flag = 'Y' and cust_name = 'B' and end_dt is null"
        )
        .await?,
        1
    );

    // Running the same source again yields no further rows (hash equal).
    let rerun = s.engine.execute("CUST_DIM", &RunPayload::regular()).await?;
    assert_eq!(rerun.rows_written, 0);
    assert_eq!(
        h.count("select count(*) as n from customer_dim where cust_id = 7").await?,
        2
    );

    Ok(())
}

#[tokio::test]
async fn scd2_is_additive_under_consecutive_changes() -> anyhow::Result<()> {
    let h = sqlite_harness().await?;
    h.seed_source("customers", &[(7, "v1")]).await?;
    let s = stack(&h);
    compiled_mapping(&h, &s, "CUST_DIM", ScdType::Type2).await?;

    s.engine.execute("CUST_DIM", &RunPayload::regular()).await?;
    rename_customer(&h, 7, "v2").await?;
    s.engine.execute("CUST_DIM", &RunPayload::regular()).await?;
    rename_customer(&h, 7, "v3").await?;
    s.engine.execute("CUST_DIM", &RunPayload::regular()).await?;

    // Two expired versions, exactly one current.
    assert_eq!(
        h.count(
            "select count(*) as n from customer_dim \
             where cust_id = 7 and curr_flag = 'N'"
        )
        .await?,
        2
    );
    assert_eq!(
        h.count(
            "select count(*) as n from customer_dim \
             where cust_id = 7 and curr_flag = 'Y' and cust_name = 'v3'"
        )
        .await?,
        1
    );

    Ok(())
}

#[tokio::test]
async fn scd3_keeps_the_previous_value_in_its_column() -> anyhow::Result<()> {
    let h = sqlite_harness().await?;
    h.seed_source("customers", &[(7, "old")]).await?;
    let s = stack(&h);

    // SCD-3 needs the declared previous column on the target.
    h.create_target(
        "customer_dim",
        &[
            ("cust_id", "integer"),
            ("cust_name", "text"),
            ("cust_name_prev", "text"),
        ],
    )
    .await?;
    s.compiler
        .upsert_mapping(&mapping_draft("CUST_DIM", "customer_dim"))
        .await?;
    s.compiler
        .upsert_mapping_detail(&detail_draft(
            "CUST_DIM", "cust_id", "id", SOURCE_SQL, Some(1), 1,
        ))
        .await?;
    let mut name = detail_draft("CUST_DIM", "cust_name", "name", SOURCE_SQL, None, 2);
    name.scd_type = ScdType::Type3;
    s.compiler.upsert_mapping_detail(&name).await?;
    s.compiler.compile("CUST_DIM").await?;

    s.engine.execute("CUST_DIM", &RunPayload::regular()).await?;
    rename_customer(&h, 7, "new").await?;
    s.engine.execute("CUST_DIM", &RunPayload::regular()).await?;

    assert_eq!(
        h.count(
            "select count(*) as n from customer_dim \
             where cust_id = 7 and cust_name = 'new' and cust_name_prev = 'old'"
        )
        .await?,
        1
    );
    assert_eq!(
        h.count("select count(*) as n from customer_dim").await?,
        1
    );

    Ok(())
}
