use crate::error::IndexError;
use crate::models::{CanonicalLabel, ContainerId, IndexRecord, OwnerId, StorageReference};
use crate::traits::MetadataIndex;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;

const SELECT_COLUMNS: &str = "SELECT id, owner, label, object_id, container_id, web_link, original_name, \
mime_type, checksum, created_at FROM index_records";

/// Append-only; `rowid` order decides which record a lookup returns.
pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub async fn connect(path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let index = Self { pool };
        index.migrate().await?;
        Ok(index)
    }

    /// Private in-memory database, one connection so every query sees it.
    pub async fn in_memory() -> Result<Self, IndexError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let index = Self { pool };
        index.migrate().await?;
        Ok(index)
    }

    async fn migrate(&self) -> Result<(), IndexError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS index_records (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                label TEXT NOT NULL,
                object_id TEXT NOT NULL,
                container_id TEXT NOT NULL,
                web_link TEXT NOT NULL,
                original_name TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                checksum TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Tables written before records carried an owner.
        let has_owner: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pragma_table_info('index_records') WHERE name = 'owner'",
        )
        .fetch_one(&self.pool)
        .await?;
        if has_owner == 0 {
            sqlx::query("ALTER TABLE index_records ADD COLUMN owner TEXT NOT NULL DEFAULT ''")
                .execute(&self.pool)
                .await?;
        }

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_index_records_owner_label ON index_records(owner, label)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_index_records_object_id ON index_records(object_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch_one_where(
        &self,
        owner: &OwnerId,
        clause: &str,
        value: &str,
    ) -> Result<Option<IndexRecord>, IndexError> {
        let sql = format!("{SELECT_COLUMNS} WHERE owner = ? AND {clause} ORDER BY rowid ASC LIMIT 1");
        let row = sqlx::query(&sql)
            .bind(&owner.0)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(record_from_row).transpose()
    }
}

fn record_from_row(row: &SqliteRow) -> Result<IndexRecord, IndexError> {
    let created_at: String = row.try_get("created_at")?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|error| IndexError::CorruptRow(format!("created_at {created_at:?}: {error}")))?
        .with_timezone(&Utc);

    Ok(IndexRecord {
        id: row.try_get("id")?,
        owner: OwnerId(row.try_get("owner")?),
        label: CanonicalLabel(row.try_get("label")?),
        storage_ref: StorageReference {
            object_id: row.try_get("object_id")?,
            web_link: row.try_get("web_link")?,
            container_id: ContainerId(row.try_get("container_id")?),
        },
        original_name: row.try_get("original_name")?,
        mime_type: row.try_get("mime_type")?,
        checksum: row.try_get("checksum")?,
        created_at,
    })
}

#[async_trait]
impl MetadataIndex for SqliteIndex {
    async fn insert(&self, record: &IndexRecord) -> Result<(), IndexError> {
        sqlx::query(
            r#"
            INSERT INTO index_records (id, owner, label, object_id, container_id, web_link,
                                       original_name, mime_type, checksum, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.owner.0)
        .bind(record.label.as_str())
        .bind(&record.storage_ref.object_id)
        .bind(&record.storage_ref.container_id.0)
        .bind(&record.storage_ref.web_link)
        .bind(&record.original_name)
        .bind(&record.mime_type)
        .bind(&record.checksum)
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_label(
        &self,
        owner: &OwnerId,
        label: &CanonicalLabel,
    ) -> Result<Option<IndexRecord>, IndexError> {
        self.fetch_one_where(owner, "label = ?", label.as_str()).await
    }

    async fn find_by_partial_label(
        &self,
        owner: &OwnerId,
        fragment: &str,
    ) -> Result<Option<IndexRecord>, IndexError> {
        self.fetch_one_where(owner, "instr(label, ?) > 0", fragment).await
    }

    async fn find_by_object_id(
        &self,
        owner: &OwnerId,
        object_id: &str,
    ) -> Result<Option<IndexRecord>, IndexError> {
        self.fetch_one_where(owner, "object_id = ?", object_id).await
    }

    async fn list(&self, owner: &OwnerId, limit: usize) -> Result<Vec<IndexRecord>, IndexError> {
        let sql = format!("{SELECT_COLUMNS} WHERE owner = ? ORDER BY rowid ASC LIMIT ?");
        let rows = sqlx::query(&sql)
            .bind(&owner.0)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(record_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::SqliteIndex;
    use crate::indexes::InMemoryIndex;
    use crate::models::{CanonicalLabel, ContainerId, IndexRecord, OwnerId, StorageReference};
    use crate::traits::MetadataIndex;
    use chrono::Utc;
    use tempfile::tempdir;

    fn owner(name: &str) -> OwnerId {
        OwnerId(name.to_string())
    }

    fn record(id: &str, owner_name: &str, label: &str, object_id: &str) -> IndexRecord {
        IndexRecord {
            id: id.to_string(),
            owner: owner(owner_name),
            label: CanonicalLabel(label.to_string()),
            storage_ref: StorageReference {
                object_id: object_id.to_string(),
                web_link: format!("https://drive.example/{object_id}"),
                container_id: ContainerId("folder-1".to_string()),
            },
            original_name: format!("{label}.pdf"),
            mime_type: "application/pdf".to_string(),
            checksum: "abc".to_string(),
            created_at: Utc::now(),
        }
    }

    async fn exercise_lookup_policy(index: &dyn MetadataIndex) {
        let alice = owner("alice");
        index.insert(&record("r0", "bob", "passport", "obj-0")).await.expect("insert");
        index.insert(&record("r1", "alice", "passport", "obj-1")).await.expect("insert");
        index.insert(&record("r2", "alice", "passportcopy", "obj-2")).await.expect("insert");
        index.insert(&record("r3", "alice", "passport", "obj-3")).await.expect("insert");

        let exact = index
            .find_by_label(&alice, &CanonicalLabel("passport".to_string()))
            .await
            .expect("lookup")
            .expect("exact match");
        assert_eq!(exact.id, "r1");

        let partial = index
            .find_by_partial_label(&alice, "copy")
            .await
            .expect("lookup")
            .expect("partial match");
        assert_eq!(partial.id, "r2");

        let first = index
            .find_by_partial_label(&alice, "pass")
            .await
            .expect("lookup")
            .expect("first match");
        assert_eq!(first.id, "r1");

        assert!(index
            .find_by_partial_label(&alice, "visa")
            .await
            .expect("lookup")
            .is_none());

        let by_object = index
            .find_by_object_id(&alice, "obj-3")
            .await
            .expect("lookup")
            .expect("object match");
        assert_eq!(by_object.id, "r3");

        assert_eq!(index.list(&alice, 2).await.expect("list").len(), 2);
        assert_eq!(index.list(&alice, 10).await.expect("list").len(), 3);
    }

    async fn exercise_owner_isolation(index: &dyn MetadataIndex) {
        index.insert(&record("r1", "alice", "passport", "obj-1")).await.expect("insert");

        let mallory = owner("mallory");
        assert!(index
            .find_by_partial_label(&mallory, "passport")
            .await
            .expect("lookup")
            .is_none());
        assert!(index
            .find_by_object_id(&mallory, "obj-1")
            .await
            .expect("lookup")
            .is_none());
        assert!(index.list(&mallory, 10).await.expect("list").is_empty());

        let own = index
            .find_by_object_id(&owner("alice"), "obj-1")
            .await
            .expect("lookup")
            .expect("own record");
        assert_eq!(own.owner, owner("alice"));
    }

    #[tokio::test]
    async fn sqlite_index_first_match_wins() {
        let index = SqliteIndex::in_memory().await.expect("index");
        exercise_lookup_policy(&index).await;
    }

    #[tokio::test]
    async fn memory_index_first_match_wins() {
        let index = InMemoryIndex::new();
        exercise_lookup_policy(&index).await;
    }

    #[tokio::test]
    async fn sqlite_index_hides_other_owners_records() {
        let index = SqliteIndex::in_memory().await.expect("index");
        exercise_owner_isolation(&index).await;
    }

    #[tokio::test]
    async fn memory_index_hides_other_owners_records() {
        let index = InMemoryIndex::new();
        exercise_owner_isolation(&index).await;
    }

    #[tokio::test]
    async fn sqlite_index_survives_reconnect() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("nested").join("index.db");

        {
            let index = SqliteIndex::connect(&path).await?;
            index.insert(&record("r1", "alice", "voterid", "obj-9")).await?;
        }

        let reopened = SqliteIndex::connect(&path).await?;
        let found = reopened
            .find_by_label(&owner("alice"), &CanonicalLabel("voterid".to_string()))
            .await?
            .expect("record persisted");
        assert_eq!(found.storage_ref.object_id, "obj-9");
        assert_eq!(found.original_name, "voterid.pdf");
        Ok(())
    }

    #[tokio::test]
    async fn path_with_query_and_fragment_characters_opens_that_file() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("we?ird#dir").join("index.db");

        {
            let index = SqliteIndex::connect(&path).await?;
            index.insert(&record("r1", "alice", "visa", "obj-4")).await?;
        }

        assert!(path.is_file());
        let reopened = SqliteIndex::connect(&path).await?;
        assert_eq!(reopened.list(&owner("alice"), 10).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn tables_without_an_owner_column_are_upgraded() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("old.db");

        {
            let index = SqliteIndex::connect(&path).await?;
            sqlx::query("DROP TABLE index_records").execute(&index.pool).await?;
            sqlx::query(
                "CREATE TABLE index_records (id TEXT PRIMARY KEY, label TEXT NOT NULL, \
                 object_id TEXT NOT NULL, container_id TEXT NOT NULL, web_link TEXT NOT NULL, \
                 original_name TEXT NOT NULL, mime_type TEXT NOT NULL, checksum TEXT NOT NULL, \
                 created_at TEXT NOT NULL)",
            )
            .execute(&index.pool)
            .await?;
        }

        let upgraded = SqliteIndex::connect(&path).await?;
        upgraded.insert(&record("r1", "alice", "visa", "obj-5")).await?;
        assert_eq!(upgraded.list(&owner("alice"), 10).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_inserts_are_all_kept() {
        let index = std::sync::Arc::new(SqliteIndex::in_memory().await.expect("index"));
        let mut handles = Vec::new();
        for n in 0..8 {
            let index = index.clone();
            handles.push(tokio::spawn(async move {
                index
                    .insert(&record(&format!("r{n}"), "alice", "marksheet", &format!("obj-{n}")))
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("insert");
        }

        assert_eq!(index.list(&owner("alice"), 100).await.expect("list").len(), 8);
    }
}
