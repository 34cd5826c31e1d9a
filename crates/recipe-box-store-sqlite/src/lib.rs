use std::path::Path;

use anyhow::{anyhow, Context, Result};
use recipe_box_core::{
    find_orphans, parse_created_at, FavoriteSet, FavoritesStore, RecipeDetails, RecipeId,
    RecipeRecord, ViewerId,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

// parent_id carries no foreign key: dangling lineage must stay storable.
const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS recipes (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  id TEXT NOT NULL UNIQUE,
  parent_id TEXT,
  author_id TEXT NOT NULL,
  created_at TEXT,
  title TEXT NOT NULL,
  details_json TEXT NOT NULL,
  CHECK (parent_id IS NULL OR parent_id <> id)
);

CREATE INDEX IF NOT EXISTS idx_recipes_parent_id ON recipes(parent_id);
CREATE INDEX IF NOT EXISTS idx_recipes_author_id ON recipes(author_id);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS favorites (
  viewer_id TEXT NOT NULL,
  recipe_id TEXT NOT NULL,
  created_at TEXT NOT NULL,
  PRIMARY KEY (viewer_id, recipe_id),
  FOREIGN KEY (recipe_id) REFERENCES recipes(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_favorites_recipe_id ON favorites(recipe_id);
";

const SELECT_RECIPE_COLUMNS: &str =
    "SELECT id, parent_id, author_id, created_at, title, details_json FROM recipes";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub orphaned_recipe_ids: Vec<RecipeId>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed recipe store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        debug!(path = %path.display(), "opened recipe store");
        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer than
    /// this build understands.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        if version < 1 {
            self.apply_migration(1, MIGRATION_001_SQL)?;
        }
        if version < 2 {
            self.apply_migration(2, MIGRATION_002_SQL)?;
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .with_context(|| format!("failed to start migration v{version} transaction"))?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        record_schema_version(&tx, version)?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        info!(version, "applied schema migration");
        Ok(())
    }

    /// Persist one validated recipe record.
    ///
    /// # Errors
    /// Returns an error when validation fails, the id already exists, or the insert fails.
    pub fn write_recipe(&mut self, record: &RecipeRecord) -> Result<()> {
        record.validate().map_err(|err| anyhow!("recipe validation failed: {err}"))?;

        let created_at = record.created_at.map(rfc3339).transpose()?;
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO recipes(id, parent_id, author_id, created_at, title, details_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id.as_str(),
                record.parent_id.as_ref().map(RecipeId::as_str),
                record.author_id.as_str(),
                created_at,
                record.title,
                serde_json::to_string(&record.details)
                    .context("failed to serialize recipe details")?,
            ],
        )
        .with_context(|| format!("failed to insert recipe {}", record.id))?;
        tx.commit().context("failed to commit write transaction")?;

        debug!(recipe_id = %record.id, parent_id = ?record.parent_id, "stored recipe");
        Ok(())
    }

    /// Load one recipe by id.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_recipe(&self, recipe_id: &RecipeId) -> Result<Option<RecipeRecord>> {
        let mut stmt = self.conn.prepare(&format!("{SELECT_RECIPE_COLUMNS} WHERE id = ?1"))?;
        let row = stmt.query_row(params![recipe_id.as_str()], RawRecipeRow::from_row).optional()?;
        row.map(RawRecipeRow::into_record).transpose()
    }

    /// Load every recipe in insertion order. This is the snapshot the grouping and
    /// ranking functions operate on.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn list_recipes(&self) -> Result<Vec<RecipeRecord>> {
        let mut stmt = self.conn.prepare(&format!("{SELECT_RECIPE_COLUMNS} ORDER BY seq ASC"))?;
        let rows = stmt.query_map([], RawRecipeRow::from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    /// Replace the editable content of a recipe. Identity, lineage, authorship and
    /// creation time never change. Returns `false` when the recipe does not exist.
    ///
    /// # Errors
    /// Returns an error when the title is blank or the update fails.
    pub fn update_recipe_content(
        &mut self,
        recipe_id: &RecipeId,
        title: &str,
        details: &RecipeDetails,
    ) -> Result<bool> {
        if title.trim().is_empty() {
            return Err(anyhow!("recipe validation failed: title MUST be non-empty"));
        }

        let tx = self.conn.transaction().context("failed to start transaction")?;
        let changed = tx
            .execute(
                "UPDATE recipes SET title = ?2, details_json = ?3 WHERE id = ?1",
                params![
                    recipe_id.as_str(),
                    title,
                    serde_json::to_string(details).context("failed to serialize recipe details")?,
                ],
            )
            .with_context(|| format!("failed to update recipe {recipe_id}"))?;
        tx.commit().context("failed to commit update transaction")?;
        Ok(changed > 0)
    }

    /// Delete one recipe and its favorite marks. Versions of a deleted original are kept
    /// and become orphans. Returns `false` when the recipe does not exist.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_recipe(&mut self, recipe_id: &RecipeId) -> Result<bool> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let orphaned_versions: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM recipes WHERE parent_id = ?1",
                params![recipe_id.as_str()],
                |row| row.get(0),
            )
            .context("failed to count versions of deleted recipe")?;
        let changed = tx
            .execute("DELETE FROM recipes WHERE id = ?1", params![recipe_id.as_str()])
            .with_context(|| format!("failed to delete recipe {recipe_id}"))?;
        tx.commit().context("failed to commit delete transaction")?;

        if changed > 0 && orphaned_versions > 0 {
            warn!(%recipe_id, orphaned_versions, "deleted original still has versions");
        }
        Ok(changed > 0)
    }

    /// Favorite recipe ids for one viewer, oldest mark first.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_favorite_ids(&self, viewer_id: &ViewerId) -> Result<Vec<RecipeId>> {
        let mut stmt = self.conn.prepare(
            "SELECT recipe_id FROM favorites
             WHERE viewer_id = ?1
             ORDER BY created_at ASC, recipe_id ASC",
        )?;
        let rows = stmt.query_map(params![viewer_id.as_str()], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(RecipeId(row?));
        }
        Ok(ids)
    }

    /// Run quick-check and foreign-key-check probes and list orphaned versions.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        let orphaned_recipe_ids = if schema_status.current_version >= 1 {
            let records = self.list_recipes()?;
            find_orphans(&records).into_iter().map(|record| record.id.clone()).collect()
        } else {
            Vec::new()
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            orphaned_recipe_ids,
            schema_status,
        })
    }

    fn favorite_exists(
        conn: &Connection,
        viewer_id: &ViewerId,
        recipe_id: &RecipeId,
    ) -> Result<bool> {
        let exists = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM favorites WHERE viewer_id = ?1 AND recipe_id = ?2)",
                params![viewer_id.as_str(), recipe_id.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to look up favorite")?;
        Ok(exists == 1)
    }

    fn write_favorite(
        conn: &Connection,
        viewer_id: &ViewerId,
        recipe_id: &RecipeId,
        favorite: bool,
    ) -> Result<()> {
        if favorite {
            conn.execute(
                "INSERT OR IGNORE INTO favorites(viewer_id, recipe_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![viewer_id.as_str(), recipe_id.as_str(), now_rfc3339()?],
            )
            .with_context(|| format!("failed to mark recipe {recipe_id} as favorite"))?;
        } else {
            conn.execute(
                "DELETE FROM favorites WHERE viewer_id = ?1 AND recipe_id = ?2",
                params![viewer_id.as_str(), recipe_id.as_str()],
            )
            .with_context(|| format!("failed to unmark favorite recipe {recipe_id}"))?;
        }
        Ok(())
    }
}

impl FavoritesStore for SqliteStore {
    type Error = anyhow::Error;

    fn favorite_set(&self, viewer_id: &ViewerId) -> Result<FavoriteSet> {
        let recipe_ids = self.list_favorite_ids(viewer_id)?.into_iter().collect();
        Ok(FavoriteSet { viewer_id: viewer_id.clone(), recipe_ids })
    }

    fn set_favorite(
        &mut self,
        viewer_id: &ViewerId,
        recipe_id: &RecipeId,
        favorite: bool,
    ) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        Self::write_favorite(&tx, viewer_id, recipe_id, favorite)?;
        tx.commit().context("failed to commit favorite transaction")?;
        Ok(())
    }

    // Read and flip inside one transaction so concurrent toggles cannot interleave.
    fn toggle_favorite(&mut self, viewer_id: &ViewerId, recipe_id: &RecipeId) -> Result<bool> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let next = !Self::favorite_exists(&tx, viewer_id, recipe_id)?;
        Self::write_favorite(&tx, viewer_id, recipe_id, next)?;
        tx.commit().context("failed to commit favorite toggle")?;

        debug!(%viewer_id, %recipe_id, favorite = next, "toggled favorite");
        Ok(next)
    }
}

struct RawRecipeRow {
    id: String,
    parent_id: Option<String>,
    author_id: String,
    created_at: Option<String>,
    title: String,
    details_json: String,
}

impl RawRecipeRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            parent_id: row.get(1)?,
            author_id: row.get(2)?,
            created_at: row.get(3)?,
            title: row.get(4)?,
            details_json: row.get(5)?,
        })
    }

    fn into_record(self) -> Result<RecipeRecord> {
        let details = serde_json::from_str(&self.details_json)
            .with_context(|| format!("failed to deserialize details of recipe {}", self.id))?;
        Ok(RecipeRecord {
            id: RecipeId(self.id),
            parent_id: self.parent_id.map(RecipeId),
            author_id: ViewerId(self.author_id),
            created_at: self.created_at.as_deref().and_then(parse_created_at),
            title: self.title,
            details,
        })
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
