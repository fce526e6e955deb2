use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use log::debug;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Row, Transaction};

use crate::error::LockConflict;
use crate::logic::audit::SelectionChangeSet;
use crate::model::{
    format_uid, AuditAction, AuditRecord, ChangeType, Id, LibraryItemStatus, LibraryVO, Page,
    ParentState, ReferenceKind, Revision, Selection, SelectionSnapshot,
    StudySelectionEndpointVO, StudySelectionObjectiveVO, VersionMetadata, VersionedValue,
};
use crate::store::traits::*;

const STUDY_ROOT_KIND: &str = "Study";

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Checks the token against the stored lock version and bumps it inside
    /// the caller's transaction.
    async fn commit_lock(tx: &mut Transaction<'_, Postgres>, lock: &LockToken) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE aggregate_roots
            SET lock_version = lock_version + 1
            WHERE uid = $1 AND lock_version = $2
            "#,
        )
        .bind(&lock.root_uid)
        .bind(lock.version)
        .execute(&mut **tx)
        .await
        .context("Failed to commit aggregate lock")?;

        if result.rows_affected() == 0 {
            return Err(LockConflict {
                parent_uid: lock.root_uid.clone(),
            }
            .into());
        }
        Ok(())
    }
}

fn snapshot_from_columns<S: Selection>(
    order: Option<i32>,
    payload: Option<serde_json::Value>,
) -> Result<Option<SelectionSnapshot<S>>> {
    match (order, payload) {
        (Some(order), Some(payload)) => Ok(Some(SelectionSnapshot {
            order: usize::try_from(order).context("Negative selection order")?,
            selection: serde_json::from_value(payload).context("Failed to decode selection snapshot")?,
        })),
        _ => Ok(None),
    }
}

fn snapshot_columns<S: Selection>(
    snapshot: &Option<SelectionSnapshot<S>>,
) -> Result<(Option<i32>, Option<serde_json::Value>)> {
    match snapshot {
        Some(snapshot) => Ok((
            Some(i32::try_from(snapshot.order).context("Selection order out of range")?),
            Some(serde_json::to_value(&snapshot.selection)?),
        )),
        None => Ok((None, None)),
    }
}

/// Replaces the stored collection and appends the audit records.
async fn write_selection_changes<S: Selection>(
    tx: &mut Transaction<'_, Postgres>,
    changes: &SelectionChangeSet<S>,
) -> Result<()> {
    sqlx::query("DELETE FROM study_selections WHERE parent_uid = $1 AND kind = $2")
        .bind(&changes.parent_uid)
        .bind(S::KIND)
        .execute(&mut **tx)
        .await
        .context("Failed to clear study selections")?;

    for (index, selection) in changes.selections.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO study_selections (parent_uid, kind, position, selection_uid, payload)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&changes.parent_uid)
        .bind(S::KIND)
        .bind(i32::try_from(index + 1).context("Selection order out of range")?)
        .bind(selection.study_selection_uid())
        .bind(serde_json::to_value(selection)?)
        .execute(&mut **tx)
        .await
        .context("Failed to insert study selection")?;
    }

    for record in &changes.records {
        let (before_order, before_payload) = snapshot_columns(&record.before)?;
        let (after_order, after_payload) = snapshot_columns(&record.after)?;
        sqlx::query(
            r#"
            INSERT INTO selection_audit (
                id, parent_uid, kind, selection_uid, change_type, author_id, date,
                before_order, before_payload, after_order, after_payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&record.action.id)
        .bind(&record.action.parent_uid)
        .bind(S::KIND)
        .bind(&record.selection_uid)
        .bind(record.action.change_type.as_str())
        .bind(&record.action.author_id)
        .bind(record.action.date)
        .bind(before_order)
        .bind(before_payload)
        .bind(after_order)
        .bind(after_payload)
        .execute(&mut **tx)
        .await
        .context("Failed to record audit action")?;
    }

    Ok(())
}

#[async_trait::async_trait]
impl AdvisoryLock for PostgresStore {
    async fn acquire_lock(&self, root_uid: &str) -> Result<LockToken> {
        let row = sqlx::query(
            "SELECT lock_version FROM aggregate_roots WHERE uid = $1",
        )
        .bind(root_uid)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to acquire aggregate lock")?;

        let Some(row) = row else {
            return Err(anyhow!("Aggregate root '{}' not found", root_uid));
        };
        let version: i64 = row.get("lock_version");
        debug!("Opened write window on {} at version {}", root_uid, version);
        Ok(LockToken {
            root_uid: root_uid.to_string(),
            version,
        })
    }
}

#[async_trait::async_trait]
impl ParentStore for PostgresStore {
    async fn parent_state(&self, parent_uid: &str) -> Result<Option<ParentState>> {
        let row = sqlx::query("SELECT state FROM aggregate_roots WHERE uid = $1 AND root_kind = $2")
            .bind(parent_uid)
            .bind(STUDY_ROOT_KIND)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch study state")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let state: String = row.get("state");
        ParentState::parse(&state)
            .map(Some)
            .ok_or_else(|| anyhow!("Unknown study state '{}'", state))
    }

    async fn upsert_parent(&self, parent_uid: &str, state: ParentState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO aggregate_roots (uid, root_kind, state)
            VALUES ($1, $2, $3)
            ON CONFLICT (uid) DO UPDATE SET state = EXCLUDED.state
            "#,
        )
        .bind(parent_uid)
        .bind(STUDY_ROOT_KIND)
        .bind(state.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to upsert study")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S: Selection> SelectionStore<S> for PostgresStore {
    async fn load_selections(&self, parent_uid: &str) -> Result<Vec<S>> {
        let rows = sqlx::query(
            "SELECT payload FROM study_selections WHERE parent_uid = $1 AND kind = $2 ORDER BY position",
        )
        .bind(parent_uid)
        .bind(S::KIND)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load study selections")?;

        rows.into_iter()
            .map(|row| {
                let payload: serde_json::Value = row.get("payload");
                serde_json::from_value(payload).context("Failed to decode study selection")
            })
            .collect()
    }

    async fn list_selection_parents(&self, page: Page) -> Result<Vec<(Id, Vec<S>)>> {
        let rows = sqlx::query(
            "SELECT parent_uid, payload FROM study_selections WHERE kind = $1 ORDER BY parent_uid, position",
        )
        .bind(S::KIND)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list study selections")?;

        let mut parents: Vec<(Id, Vec<S>)> = Vec::new();
        for row in rows {
            let parent_uid: String = row.get("parent_uid");
            let payload: serde_json::Value = row.get("payload");
            let selection: S = serde_json::from_value(payload).context("Failed to decode study selection")?;
            if let Some((uid, selections)) = parents.last_mut() {
                if *uid == parent_uid {
                    selections.push(selection);
                    continue;
                }
            }
            parents.push((parent_uid, vec![selection]));
        }
        Ok(page.apply(parents))
    }

    async fn apply_selection_changes(&self, lock: &LockToken, changes: SelectionChangeSet<S>) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        Self::commit_lock(&mut tx, lock).await?;
        write_selection_changes(&mut tx, &changes).await?;
        tx.commit().await.context("Failed to commit selection changes")?;
        Ok(())
    }

    async fn load_audit_records(&self, parent_uid: &str) -> Result<Vec<AuditRecord<S>>> {
        let rows = sqlx::query(
            r#"
            SELECT id, parent_uid, selection_uid, change_type, author_id, date,
                   before_order, before_payload, after_order, after_payload
            FROM selection_audit
            WHERE parent_uid = $1 AND kind = $2
            ORDER BY seq
            "#,
        )
        .bind(parent_uid)
        .bind(S::KIND)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load audit trail")?;

        rows.into_iter()
            .map(|row| {
                let change_type: String = row.get("change_type");
                Ok(AuditRecord {
                    action: AuditAction {
                        id: row.get("id"),
                        parent_uid: row.get("parent_uid"),
                        change_type: ChangeType::parse(&change_type)
                            .ok_or_else(|| anyhow!("Unknown change type '{}'", change_type))?,
                        author_id: row.get("author_id"),
                        date: row.get("date"),
                    },
                    selection_uid: row.get("selection_uid"),
                    before: snapshot_from_columns(row.get("before_order"), row.get("before_payload"))?,
                    after: snapshot_from_columns(row.get("after_order"), row.get("after_payload"))?,
                })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl StudySelectionBatch for PostgresStore {
    async fn apply_study_selection_batch(
        &self,
        objectives: PendingSelectionWrite<StudySelectionObjectiveVO>,
        endpoints: PendingSelectionWrite<StudySelectionEndpointVO>,
    ) -> Result<()> {
        objectives.lock.ensure_same_window(&endpoints.lock)?;
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        Self::commit_lock(&mut tx, &objectives.lock).await?;
        write_selection_changes(&mut tx, &objectives.changes).await?;
        write_selection_changes(&mut tx, &endpoints.changes).await?;
        tx.commit().await.context("Failed to commit study selection changes")?;
        Ok(())
    }
}

fn revision_from_row<V: VersionedValue>(row: &sqlx::postgres::PgRow) -> Result<Revision<V>> {
    let status: String = row.get("status");
    let major: i32 = row.get("major_version");
    let minor: i32 = row.get("minor_version");
    let metadata = VersionMetadata::from_repository_values(
        LibraryItemStatus::parse(&status).ok_or_else(|| anyhow!("Unknown item status '{}'", status))?,
        u32::try_from(major).context("Negative major version")?,
        u32::try_from(minor).context("Negative minor version")?,
        row.get("start_date"),
        row.get("end_date"),
        row.get("author_id"),
        row.get("change_description"),
    )?;
    let value: serde_json::Value = row.get("value");
    Ok(Revision {
        metadata,
        value: serde_json::from_value(value).context("Failed to decode item value")?,
    })
}

impl PostgresStore {
    async fn insert_revisions<V: VersionedValue>(
        tx: &mut Transaction<'_, Postgres>,
        uid: &str,
        revisions: &[Revision<V>],
    ) -> Result<()> {
        for revision in revisions {
            // the previously open revision ends where the new one starts
            sqlx::query(
                "UPDATE library_item_revisions SET end_date = $2 WHERE item_uid = $1 AND end_date IS NULL",
            )
            .bind(uid)
            .bind(revision.metadata.start_date)
            .execute(&mut **tx)
            .await
            .context("Failed to close previous revision")?;

            sqlx::query(
                r#"
                INSERT INTO library_item_revisions (
                    item_uid, status, major_version, minor_version, start_date, end_date,
                    author_id, change_description, value
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(uid)
            .bind(revision.metadata.status.as_str())
            .bind(i32::try_from(revision.metadata.major_version).context("Version out of range")?)
            .bind(i32::try_from(revision.metadata.minor_version).context("Version out of range")?)
            .bind(revision.metadata.start_date)
            .bind(revision.metadata.end_date)
            .bind(&revision.metadata.author_id)
            .bind(&revision.metadata.change_description)
            .bind(serde_json::to_value(&revision.value)?)
            .execute(&mut **tx)
            .await
            .context("Failed to insert revision")?;
        }
        Ok(())
    }

    async fn head_revision<V: VersionedValue>(&self, uid: &str) -> Result<Option<Revision<V>>> {
        let row = sqlx::query(
            r#"
            SELECT status, major_version, minor_version, start_date, end_date,
                   author_id, change_description, value
            FROM library_item_revisions
            WHERE item_uid = $1
            ORDER BY seq DESC
            LIMIT 1
            "#,
        )
        .bind(uid)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch head revision")?;

        row.as_ref().map(revision_from_row).transpose()
    }
}

#[async_trait::async_trait]
impl<V: VersionedValue> LibraryItemStore<V> for PostgresStore {
    async fn load_item(&self, uid: &str) -> Result<Option<StoredItem<V>>> {
        let row = sqlx::query(
            r#"
            SELECT i.deleted, l.name, l.is_editable
            FROM library_items i
            JOIN libraries l ON l.name = i.library_name
            WHERE i.uid = $1 AND i.kind = $2
            "#,
        )
        .bind(uid)
        .bind(V::KIND)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch library item")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let Some(head) = self.head_revision::<V>(uid).await? else {
            return Ok(None);
        };
        Ok(Some(StoredItem {
            uid: uid.to_string(),
            library: LibraryVO::new(row.get::<String, _>("name"), row.get::<bool, _>("is_editable")),
            metadata: head.metadata,
            value: head.value,
            deleted: row.get("deleted"),
        }))
    }

    async fn list_items(&self, library_name: Option<&str>, page: Page) -> Result<Vec<StoredItem<V>>> {
        let rows = sqlx::query(
            r#"
            SELECT i.uid
            FROM library_items i
            WHERE i.kind = $1 AND NOT i.deleted AND ($2::TEXT IS NULL OR i.library_name = $2)
            ORDER BY i.uid
            "#,
        )
        .bind(V::KIND)
        .bind(library_name)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list library items")?;

        let uids: Vec<String> = page.apply(rows.iter().map(|row| row.get("uid")).collect());
        let mut items = Vec::with_capacity(uids.len());
        for uid in uids {
            if let Some(item) = LibraryItemStore::<V>::load_item(self, &uid).await? {
                items.push(item);
            }
        }
        Ok(items)
    }

    async fn create_item(&self, uid: &str, library: &LibraryVO, revisions: Vec<Revision<V>>) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query("INSERT INTO aggregate_roots (uid, root_kind) VALUES ($1, $2)")
            .bind(uid)
            .bind(V::KIND)
            .execute(&mut *tx)
            .await
            .context("Failed to register library item root")?;

        sqlx::query("INSERT INTO library_items (uid, kind, library_name) VALUES ($1, $2, $3)")
            .bind(uid)
            .bind(V::KIND)
            .bind(&library.name)
            .execute(&mut *tx)
            .await
            .context("Failed to insert library item")?;

        Self::insert_revisions(&mut tx, uid, &revisions).await?;
        tx.commit().await.context("Failed to commit library item")?;
        Ok(())
    }

    async fn append_revisions(
        &self,
        lock: &LockToken,
        uid: &str,
        revisions: Vec<Revision<V>>,
        deleted: bool,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        Self::commit_lock(&mut tx, lock).await?;
        Self::insert_revisions(&mut tx, uid, &revisions).await?;

        if deleted {
            sqlx::query(
                "UPDATE library_item_revisions SET end_date = $2 WHERE item_uid = $1 AND end_date IS NULL",
            )
            .bind(uid)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .context("Failed to close deleted revision")?;

            sqlx::query("UPDATE library_items SET deleted = TRUE WHERE uid = $1")
                .bind(uid)
                .execute(&mut *tx)
                .await
                .context("Failed to mark library item deleted")?;
        }

        tx.commit().await.context("Failed to commit revisions")?;
        Ok(())
    }

    async fn load_revisions(&self, uid: &str) -> Result<Vec<Revision<V>>> {
        let rows = sqlx::query(
            r#"
            SELECT r.status, r.major_version, r.minor_version, r.start_date, r.end_date,
                   r.author_id, r.change_description, r.value
            FROM library_item_revisions r
            JOIN library_items i ON i.uid = r.item_uid
            WHERE r.item_uid = $1 AND i.kind = $2 AND NOT i.deleted
            ORDER BY r.seq
            "#,
        )
        .bind(uid)
        .bind(V::KIND)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load revisions")?;

        rows.iter().map(revision_from_row).collect()
    }
}

#[async_trait::async_trait]
impl LibraryStore for PostgresStore {
    async fn get_library(&self, name: &str) -> Result<Option<LibraryVO>> {
        let row = sqlx::query("SELECT name, is_editable FROM libraries WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch library")?;

        Ok(row.map(|row| LibraryVO::new(row.get::<String, _>("name"), row.get::<bool, _>("is_editable"))))
    }

    async fn upsert_library(&self, library: LibraryVO) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO libraries (name, is_editable)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET is_editable = EXCLUDED.is_editable
            "#,
        )
        .bind(&library.name)
        .bind(library.is_editable)
        .execute(&self.pool)
        .await
        .context("Failed to upsert library")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ReferenceLookup for PostgresStore {
    async fn reference_exists(&self, kind: ReferenceKind, uid: &str) -> Result<bool> {
        let query = if kind == ReferenceKind::StudyObjective {
            sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM study_selections WHERE kind = $1 AND selection_uid = $2)",
            )
            .bind(<StudySelectionObjectiveVO as Selection>::KIND)
        } else {
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM reference_terms WHERE kind = $1 AND uid = $2)")
                .bind(kind.as_str())
        };
        let exists: bool = query
            .bind(uid)
            .fetch_one(&self.pool)
            .await
            .context("Failed to check reference")?;
        Ok(exists)
    }

    async fn term_order(&self, term_uid: &str) -> Result<Option<u32>> {
        let order: Option<Option<i32>> =
            sqlx::query_scalar("SELECT term_order FROM reference_terms WHERE kind = $1 AND uid = $2")
                .bind(ReferenceKind::CtTerm.as_str())
                .bind(term_uid)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to fetch term order")?;

        order
            .flatten()
            .map(|order| u32::try_from(order).context("Negative term order"))
            .transpose()
    }

    async fn register_reference(&self, kind: ReferenceKind, uid: &str, order: Option<u32>) -> Result<()> {
        let order = order
            .map(|order| i32::try_from(order).context("Term order out of range"))
            .transpose()?;
        sqlx::query(
            r#"
            INSERT INTO reference_terms (kind, uid, term_order)
            VALUES ($1, $2, $3)
            ON CONFLICT (kind, uid) DO UPDATE SET term_order = EXCLUDED.term_order
            "#,
        )
        .bind(kind.as_str())
        .bind(uid)
        .bind(order)
        .execute(&self.pool)
        .await
        .context("Failed to register reference")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl UidGenerator for PostgresStore {
    async fn next_uid(&self, prefix: &str) -> Result<Id> {
        let counter: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO uid_counters (prefix, counter)
            VALUES ($1, 1)
            ON CONFLICT (prefix) DO UPDATE SET counter = uid_counters.counter + 1
            RETURNING counter
            "#,
        )
        .bind(prefix)
        .fetch_one(&self.pool)
        .await
        .context("Failed to allocate uid")?;

        Ok(format_uid(prefix, u64::try_from(counter).context("Negative uid counter")?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StudySelectionEndpointVO;

    fn objective(uid: &str) -> StudySelectionObjectiveVO {
        StudySelectionObjectiveVO {
            study_selection_uid: uid.to_string(),
            study_uid: Some("Study_000001".to_string()),
            objective_uid: Some("Objective_000001".to_string()),
            objective_version: None,
            objective_level_uid: None,
            objective_level_order: Some(1),
            start_date: Utc::now(),
            author_id: "author".to_string(),
            accepted_version: false,
        }
    }

    #[test]
    fn test_snapshot_columns_roundtrip() {
        let snapshot = Some(SelectionSnapshot {
            order: 3,
            selection: objective("StudyObjective_000001"),
        });
        let (order, payload) = snapshot_columns(&snapshot).unwrap();
        assert_eq!(order, Some(3));
        let decoded = snapshot_from_columns::<StudySelectionObjectiveVO>(order, payload).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn test_missing_snapshot_columns() {
        let decoded = snapshot_from_columns::<StudySelectionEndpointVO>(Some(1), None).unwrap();
        assert!(decoded.is_none());
        let (order, payload) = snapshot_columns::<StudySelectionEndpointVO>(&None).unwrap();
        assert!(order.is_none() && payload.is_none());
    }
}
