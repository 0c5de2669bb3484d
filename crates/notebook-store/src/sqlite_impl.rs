use std::path::Path;

use notebook_protocol::{CellId, DocumentId, OutputRecord};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use serde_json::Map;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cell::{APPEND_INDEX, Cell, CellPatch, CellType};
use crate::change::CellChange;
use crate::error::StoreError;
use crate::outputs::merge_output;

const CURRENT_SCHEMA_VERSION: u32 = 1;

const CELL_COLUMNS: &str =
    "object_id, cell_id, cell_index, cell_type, source, metadata, outputs";

/// Ordered notebook cells persisted in SQLite.
///
/// Every mutating call runs inside one transaction and checks that the
/// document's `cell_index` values are exactly `0..N` before committing.
#[derive(Debug)]
pub struct SqliteCellStore {
    conn: Connection,
}

impl SqliteCellStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let mut store = Self { conn };
        store.bootstrap()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self { conn };
        store.bootstrap()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<u32, StoreError> {
        self.current_schema_version()
    }

    /// Makes `document_id` known to the local `objects` table so cells may
    /// reference it.
    pub fn register_document(&mut self, document_id: &DocumentId) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO objects (id) VALUES (?1)",
                params![document_id.as_str()],
            )
            .map_err(StoreError::from_write)?;
        Ok(())
    }

    /// Removes the document row; its cells go with it through the cascade.
    pub fn remove_document(&mut self, document_id: &DocumentId) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM objects WHERE id = ?1",
            params![document_id.as_str()],
        )?;
        Ok(())
    }

    pub fn document_exists(&self, document_id: &DocumentId) -> Result<bool, StoreError> {
        Self::document_exists_on(&self.conn, document_id)
    }

    pub fn modified_date(&self, document_id: &DocumentId) -> Result<Option<String>, StoreError> {
        self.conn
            .query_row(
                "SELECT modified_date FROM objects WHERE id = ?1",
                params![document_id.as_str()],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map(Option::flatten)
            .map_err(StoreError::from)
    }

    pub fn set_modified_date(
        &mut self,
        document_id: &DocumentId,
        date: &str,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE objects SET modified_date = ?1 WHERE id = ?2",
            params![date, document_id.as_str()],
        )?;
        Ok(())
    }

    /// Today's date in UTC as `YYYY-MM-DD`.
    pub fn current_utc_date(&self) -> Result<String, StoreError> {
        self.conn
            .query_row("SELECT date('now')", [], |row| row.get(0))
            .map_err(StoreError::from)
    }

    /// Applies a batch of creates, updates, moves, and deletes atomically.
    ///
    /// Any invalid entry rolls back the entire batch.
    pub fn apply_batch(
        &mut self,
        document_id: &DocumentId,
        patches: Vec<CellPatch>,
    ) -> Result<Vec<CellChange>, StoreError> {
        let tx = self.conn.transaction()?;
        if !Self::document_exists_on(&tx, document_id)? {
            return Err(StoreError::Validation(format!(
                "document '{document_id}' does not exist"
            )));
        }

        let mut changes = Vec::with_capacity(patches.len());
        for patch in patches {
            if patch.delete {
                let cell_id = patch.cell_id.ok_or_else(|| {
                    StoreError::Validation("cell delete requires a cell_id".to_owned())
                })?;
                changes.push(Self::delete_tx(&tx, document_id, &cell_id)?);
            } else {
                Self::upsert_tx(&tx, document_id, patch, &mut changes)?;
            }
        }

        Self::verify_dense_order(&tx, document_id)?;
        tx.commit()?;

        info!(
            document = %document_id,
            changes = changes.len(),
            "applied notebook cell batch"
        );
        Ok(changes)
    }

    pub fn upsert(
        &mut self,
        document_id: &DocumentId,
        patch: CellPatch,
    ) -> Result<Vec<CellChange>, StoreError> {
        self.apply_batch(document_id, vec![patch])
    }

    pub fn delete(
        &mut self,
        document_id: &DocumentId,
        cell_id: &CellId,
    ) -> Result<Vec<CellChange>, StoreError> {
        self.apply_batch(document_id, vec![CellPatch::delete(cell_id.clone())])
    }

    pub fn append_output(
        &mut self,
        document_id: &DocumentId,
        cell_id: &CellId,
        record: OutputRecord,
    ) -> Result<CellChange, StoreError> {
        let tx = self.conn.transaction()?;
        let mut outputs = Self::outputs_tx(&tx, document_id, cell_id)?;
        merge_output(&mut outputs, record);
        Self::write_outputs_tx(&tx, document_id, cell_id, &outputs)?;
        tx.commit()?;

        debug!(document = %document_id, cell = %cell_id, "merged kernel output");
        Ok(CellChange::Outputs {
            document_id: document_id.clone(),
            cell_id: cell_id.clone(),
            outputs,
        })
    }

    pub fn clear_outputs(
        &mut self,
        document_id: &DocumentId,
        cell_id: &CellId,
    ) -> Result<CellChange, StoreError> {
        let tx = self.conn.transaction()?;
        // Existence check so a missing cell is reported instead of a no-op.
        Self::outputs_tx(&tx, document_id, cell_id)?;
        Self::write_outputs_tx(&tx, document_id, cell_id, &[])?;
        tx.commit()?;

        Ok(CellChange::Outputs {
            document_id: document_id.clone(),
            cell_id: cell_id.clone(),
            outputs: Vec::new(),
        })
    }

    pub fn read(&self, document_id: &DocumentId) -> Result<Vec<Cell>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CELL_COLUMNS} FROM notebook_cells WHERE object_id = ?1 ORDER BY cell_index ASC"
        ))?;
        let rows = stmt.query_map(params![document_id.as_str()], Self::map_cell_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub fn read_cell(&self, document_id: &DocumentId, cell_id: &CellId) -> Result<Cell, StoreError> {
        Self::read_cell_on(&self.conn, document_id, cell_id)?.ok_or_else(|| {
            StoreError::CellNotFound {
                document_id: document_id.clone(),
                cell_id: cell_id.clone(),
            }
        })
    }

    pub fn cell_count(&self, document_id: &DocumentId) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM notebook_cells WHERE object_id = ?1",
            params![document_id.as_str()],
            |row| row.get(0),
        )?;
        usize::try_from(count).map_err(|_| {
            StoreError::Persistence(format!("cell count '{count}' cannot be represented as usize"))
        })
    }

    fn upsert_tx(
        tx: &Transaction<'_>,
        document_id: &DocumentId,
        patch: CellPatch,
        changes: &mut Vec<CellChange>,
    ) -> Result<(), StoreError> {
        let existing = match patch.cell_id.as_ref() {
            Some(cell_id) => Self::read_cell_on(tx, document_id, cell_id)?,
            None => None,
        };

        match existing {
            Some(cell) => Self::update_tx(tx, cell, patch, changes),
            None => Self::insert_tx(tx, document_id, patch, changes),
        }
    }

    fn insert_tx(
        tx: &Transaction<'_>,
        document_id: &DocumentId,
        mut patch: CellPatch,
        changes: &mut Vec<CellChange>,
    ) -> Result<(), StoreError> {
        let cell_id = patch
            .cell_id
            .take()
            .unwrap_or_else(|| CellId::new(Uuid::new_v4().simple().to_string()));
        let max_index = Self::max_index_tx(tx, document_id)?;

        let cell_index = match patch.cell_index {
            Some(index) if (0..=max_index).contains(&index) => {
                tx.execute(
                    "UPDATE notebook_cells SET cell_index = cell_index + 1 WHERE object_id = ?1 AND cell_index >= ?2",
                    params![document_id.as_str(), index],
                )?;
                index
            }
            _ => max_index + 1,
        };

        let mut cell = Cell {
            document_id: document_id.clone(),
            cell_id,
            cell_index,
            cell_type: CellType::default(),
            source: String::new(),
            metadata: Map::new(),
            outputs: Vec::new(),
        };
        patch.apply_fields(&mut cell);

        tx.execute(
            &format!("INSERT INTO notebook_cells ({CELL_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                cell.document_id.as_str(),
                cell.cell_id.as_str(),
                cell.cell_index,
                cell.cell_type.as_str(),
                cell.source,
                encode_json(&cell.metadata)?,
                encode_json(&cell.outputs)?,
            ],
        )
        .map_err(StoreError::from_write)?;

        debug!(
            document = %document_id,
            cell = %cell.cell_id,
            cell_index = cell.cell_index,
            "created notebook cell"
        );
        Self::push_cell_changes(cell, changes);
        Ok(())
    }

    fn update_tx(
        tx: &Transaction<'_>,
        mut cell: Cell,
        mut patch: CellPatch,
        changes: &mut Vec<CellChange>,
    ) -> Result<(), StoreError> {
        let outputs_replaced = patch.outputs.is_some();
        patch.apply_fields(&mut cell);

        let current = cell.cell_index;
        if let Some(requested) = patch.cell_index.filter(|requested| *requested != current) {
            let max_index = Self::max_index_tx(tx, &cell.document_id)?;
            let target = clamp_move_target(requested, max_index);
            if target > current {
                tx.execute(
                    "UPDATE notebook_cells SET cell_index = cell_index - 1 WHERE object_id = ?1 AND cell_index > ?2 AND cell_index <= ?3",
                    params![cell.document_id.as_str(), current, target],
                )?;
            } else if target < current {
                tx.execute(
                    "UPDATE notebook_cells SET cell_index = cell_index + 1 WHERE object_id = ?1 AND cell_index >= ?2 AND cell_index < ?3",
                    params![cell.document_id.as_str(), target, current],
                )?;
            }
            cell.cell_index = target;
        }

        tx.execute(
            "UPDATE notebook_cells SET cell_index = ?1, cell_type = ?2, source = ?3, metadata = ?4, outputs = ?5 WHERE object_id = ?6 AND cell_id = ?7",
            params![
                cell.cell_index,
                cell.cell_type.as_str(),
                cell.source,
                encode_json(&cell.metadata)?,
                encode_json(&cell.outputs)?,
                cell.document_id.as_str(),
                cell.cell_id.as_str(),
            ],
        )
        .map_err(StoreError::from_write)?;

        debug!(
            document = %cell.document_id,
            cell = %cell.cell_id,
            cell_index = cell.cell_index,
            "updated notebook cell"
        );
        if outputs_replaced {
            changes.push(CellChange::Updated(cell.clone()));
            changes.push(CellChange::Outputs {
                document_id: cell.document_id,
                cell_id: cell.cell_id,
                outputs: cell.outputs,
            });
        } else {
            changes.push(CellChange::Updated(cell));
        }
        Ok(())
    }

    fn delete_tx(
        tx: &Transaction<'_>,
        document_id: &DocumentId,
        cell_id: &CellId,
    ) -> Result<CellChange, StoreError> {
        let cell_index: i64 = tx
            .query_row(
                "SELECT cell_index FROM notebook_cells WHERE object_id = ?1 AND cell_id = ?2",
                params![document_id.as_str(), cell_id.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::CellNotFound {
                document_id: document_id.clone(),
                cell_id: cell_id.clone(),
            })?;

        tx.execute(
            "DELETE FROM notebook_cells WHERE object_id = ?1 AND cell_id = ?2",
            params![document_id.as_str(), cell_id.as_str()],
        )?;
        tx.execute(
            "UPDATE notebook_cells SET cell_index = cell_index - 1 WHERE object_id = ?1 AND cell_index > ?2",
            params![document_id.as_str(), cell_index],
        )?;

        debug!(document = %document_id, cell = %cell_id, cell_index, "deleted notebook cell");
        Ok(CellChange::Deleted {
            document_id: document_id.clone(),
            cell_id: cell_id.clone(),
            cell_index,
        })
    }

    fn push_cell_changes(cell: Cell, changes: &mut Vec<CellChange>) {
        if cell.outputs.is_empty() {
            changes.push(CellChange::Updated(cell));
            return;
        }
        changes.push(CellChange::Updated(cell.clone()));
        changes.push(CellChange::Outputs {
            document_id: cell.document_id,
            cell_id: cell.cell_id,
            outputs: cell.outputs,
        });
    }

    fn outputs_tx(
        tx: &Transaction<'_>,
        document_id: &DocumentId,
        cell_id: &CellId,
    ) -> Result<Vec<OutputRecord>, StoreError> {
        let raw: String = tx
            .query_row(
                "SELECT outputs FROM notebook_cells WHERE object_id = ?1 AND cell_id = ?2",
                params![document_id.as_str(), cell_id.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::CellNotFound {
                document_id: document_id.clone(),
                cell_id: cell_id.clone(),
            })?;
        serde_json::from_str(&raw).map_err(|err| StoreError::Persistence(err.to_string()))
    }

    fn write_outputs_tx(
        tx: &Transaction<'_>,
        document_id: &DocumentId,
        cell_id: &CellId,
        outputs: &[OutputRecord],
    ) -> Result<(), StoreError> {
        tx.execute(
            "UPDATE notebook_cells SET outputs = ?1 WHERE object_id = ?2 AND cell_id = ?3",
            params![encode_json(&outputs)?, document_id.as_str(), cell_id.as_str()],
        )
        .map_err(StoreError::from_write)?;
        Ok(())
    }

    /// Highest index in the document, `-1` when it has no cells.
    fn max_index_tx(tx: &Transaction<'_>, document_id: &DocumentId) -> Result<i64, StoreError> {
        tx.query_row(
            "SELECT COALESCE(MAX(cell_index), -1) FROM notebook_cells WHERE object_id = ?1",
            params![document_id.as_str()],
            |row| row.get(0),
        )
        .map_err(StoreError::from)
    }

    fn verify_dense_order(
        tx: &Transaction<'_>,
        document_id: &DocumentId,
    ) -> Result<(), StoreError> {
        let (count, distinct, min, max): (i64, i64, i64, i64) = tx.query_row(
            "
            SELECT COUNT(*), COUNT(DISTINCT cell_index), COALESCE(MIN(cell_index), 0), COALESCE(MAX(cell_index), -1)
            FROM notebook_cells
            WHERE object_id = ?1
            ",
            params![document_id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        if count != distinct || min != 0 || max != count - 1 {
            return Err(StoreError::Persistence(format!(
                "cell order for document '{document_id}' is not dense: {count} cells span {min}..={max}"
            )));
        }
        Ok(())
    }

    fn document_exists_on(conn: &Connection, document_id: &DocumentId) -> Result<bool, StoreError> {
        conn.query_row(
            "SELECT 1 FROM objects WHERE id = ?1 LIMIT 1",
            params![document_id.as_str()],
            |_| Ok(()),
        )
        .optional()
        .map(|found| found.is_some())
        .map_err(StoreError::from)
    }

    fn read_cell_on(
        conn: &Connection,
        document_id: &DocumentId,
        cell_id: &CellId,
    ) -> Result<Option<Cell>, StoreError> {
        conn.query_row(
            &format!(
                "SELECT {CELL_COLUMNS} FROM notebook_cells WHERE object_id = ?1 AND cell_id = ?2"
            ),
            params![document_id.as_str(), cell_id.as_str()],
            Self::map_cell_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    fn map_cell_row(row: &Row<'_>) -> rusqlite::Result<Cell> {
        let cell_type: String = row.get(3)?;
        let metadata: String = row.get(5)?;
        let outputs: String = row.get(6)?;
        Ok(Cell {
            document_id: DocumentId::new(row.get::<_, String>(0)?),
            cell_id: CellId::new(row.get::<_, String>(1)?),
            cell_index: row.get(2)?,
            cell_type: cell_type.parse().map_err(to_from_sql_error)?,
            source: row.get(4)?,
            metadata: serde_json::from_str(&metadata).map_err(to_from_sql_error)?,
            outputs: serde_json::from_str(&outputs).map_err(to_from_sql_error)?,
        })
    }

    fn bootstrap(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let current = self.current_schema_version()?;
        if current > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchemaVersion {
                supported: CURRENT_SCHEMA_VERSION,
                found: current,
            });
        }

        self.apply_pending_migrations(current)
    }

    fn table_exists(&self, name: &str) -> Result<bool, StoreError> {
        self.conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1 LIMIT 1",
                params![name],
                |_| Ok(()),
            )
            .optional()
            .map(|opt| opt.is_some())
            .map_err(StoreError::from)
    }

    fn current_schema_version(&self) -> Result<u32, StoreError> {
        if !self.table_exists("schema_migrations")? {
            return Ok(0);
        }

        self.conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .map_err(StoreError::from)
    }

    fn apply_pending_migrations(&mut self, current: u32) -> Result<(), StoreError> {
        for version in (current + 1)..=CURRENT_SCHEMA_VERSION {
            let tx = self.conn.transaction()?;
            Self::apply_migration(&tx, version)?;
            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))",
                params![version],
            )?;
            tx.commit()?;
            debug!(version, "applied notebook store migration");
        }

        Ok(())
    }

    fn apply_migration(tx: &Transaction<'_>, version: u32) -> Result<(), StoreError> {
        match version {
            1 => tx
                .execute_batch(
                    "
                    CREATE TABLE schema_migrations (
                        version INTEGER PRIMARY KEY,
                        applied_at TEXT NOT NULL
                    );

                    -- Hosts normally own this table; it is only created when absent.
                    CREATE TABLE IF NOT EXISTS objects (
                        id TEXT PRIMARY KEY,
                        modified_date TEXT
                    );

                    CREATE TABLE notebook_cells (
                        object_id TEXT NOT NULL,
                        cell_id TEXT NOT NULL,
                        cell_index INTEGER NOT NULL,
                        cell_type TEXT NOT NULL DEFAULT 'code',
                        source TEXT NOT NULL DEFAULT '',
                        outputs TEXT NOT NULL DEFAULT '[]',
                        metadata TEXT NOT NULL DEFAULT '{}',
                        PRIMARY KEY (object_id, cell_id),
                        CONSTRAINT valid_outputs CHECK (json_valid(outputs) AND json_type(outputs) = 'array'),
                        CONSTRAINT valid_metadata CHECK (json_valid(metadata) AND json_type(metadata) = 'object'),
                        FOREIGN KEY (object_id) REFERENCES objects(id) ON UPDATE CASCADE ON DELETE CASCADE
                    );

                    CREATE INDEX notebook_cells_order ON notebook_cells(object_id, cell_index);
                    ",
                )
                .map_err(StoreError::from),
            _ => Err(StoreError::UnsupportedSchemaVersion {
                supported: CURRENT_SCHEMA_VERSION,
                found: version,
            }),
        }
    }
}

/// Resolves a move request against the document's last index.
fn clamp_move_target(requested: i64, max_index: i64) -> i64 {
    if requested == APPEND_INDEX || requested > max_index {
        max_index
    } else {
        requested.max(0)
    }
}

fn encode_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|err| StoreError::Validation(err.to_string()))
}

fn to_from_sql_error<E>(err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}
