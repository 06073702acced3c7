//! SqlSnippet persistence. Historized: on body change the prior current row
//! flips to `N` and a new current row is inserted; an unchanged body (after
//! normalization) returns the existing id untouched.

use chrono::Utc;
use sqlx::any::AnyRow;

use dwl_schemas::SqlSnippet;

use crate::error::StoreError;
use crate::ids::{entity, IdProvider};
use crate::rows;
use crate::sql::SqlValue;
use crate::store::{tables, Store};

/// Trim, strip one trailing `;`, normalize line endings. Snippet bodies are
/// compared in this form only, and always as read-back text.
pub fn normalize_body(body: &str) -> String {
    let body = body.replace("\r\n", "\n");
    let trimmed = body.trim();
    trimmed.strip_suffix(';').map(str::trim_end).unwrap_or(trimmed).to_string()
}

pub async fn current(store: &Store, code: &str) -> Result<Option<SqlSnippet>, StoreError> {
    let t = store.meta_object(tables::SNIPPETS);
    let row = store
        .query_opt(
            &format!(
                "select id, code, body, current_flag, created_by, created_at \
                 from {t} where code = :code and current_flag = 'Y'"
            ),
            &[("code", SqlValue::from(code))],
        )
        .await?;
    row.map(|r| decode(&r)).transpose()
}

/// Insert-or-historize. Returns `(id, changed)`; `changed` is false when the
/// normalized body matched the existing current row.
pub async fn upsert(
    store: &Store,
    ids: &IdProvider,
    code: &str,
    body: &str,
    actor: &str,
) -> Result<(i64, bool), StoreError> {
    let normalized = normalize_body(body);

    if let Some(existing) = current(store, code).await? {
        if normalize_body(&existing.body) == normalized {
            return Ok((existing.id, false));
        }
        let id = ids.next_id(entity::SNIPPET).await?;
        let t = store.meta_object(tables::SNIPPETS);
        let mut tx = store.begin().await?;
        tx.exec(
            &format!("update {t} set current_flag = 'N' where id = :id"),
            &[("id", SqlValue::from(existing.id))],
        )
        .await?;
        tx.exec(
            &format!(
                "insert into {t} (id, code, body, current_flag, created_by, created_at) \
                 values (:id, :code, :body, 'Y', :actor, :now)"
            ),
            &[
                ("id", SqlValue::from(id)),
                ("code", SqlValue::from(code)),
                ("body", SqlValue::from(normalized.as_str())),
                ("actor", SqlValue::from(actor)),
                ("now", SqlValue::from(Utc::now())),
            ],
        )
        .await?;
        tx.commit().await?;
        return Ok((id, true));
    }

    let id = ids.next_id(entity::SNIPPET).await?;
    let t = store.meta_object(tables::SNIPPETS);
    store
        .exec(
            &format!(
                "insert into {t} (id, code, body, current_flag, created_by, created_at) \
                 values (:id, :code, :body, 'Y', :actor, :now)"
            ),
            &[
                ("id", SqlValue::from(id)),
                ("code", SqlValue::from(code)),
                ("body", SqlValue::from(normalized.as_str())),
                ("actor", SqlValue::from(actor)),
                ("now", SqlValue::from(Utc::now())),
            ],
        )
        .await?;
    Ok((id, true))
}

fn decode(row: &AnyRow) -> Result<SqlSnippet, StoreError> {
    Ok(SqlSnippet {
        id: rows::int(row, "id")?,
        code: rows::text(row, "code")?,
        body: crate::store::column_value(row, "body")?.read_large_text(),
        current_flag: rows::flag(row, "current_flag")?,
        created_by: rows::text(row, "created_by")?,
        created_at: rows::ts(row, "created_at")?,
    })
}
