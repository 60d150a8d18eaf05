use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use sidecar_core::{AddonId, ResponseLocation, ResultMeta, StoredResult, TurnId};

use crate::database::Database;
use crate::error::StoreError;

const COLUMNS: &str = "turn_id, variant_index, addon_id, content, addon_name, timestamp, \
                       format_style, response_location, edited, revision";

/// Keyed storage of add-on results, one row per `(turn_id, variant_index, addon_id)`.
#[derive(Clone)]
pub struct ResultRepo {
    db: Database,
}

impl ResultRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Upsert a result produced by normal generation. Clears `edited`.
    pub fn save(
        &self,
        turn_id: &TurnId,
        variant_index: usize,
        addon_id: &AddonId,
        content: &str,
        meta: &ResultMeta,
    ) -> Result<StoredResult, StoreError> {
        self.upsert(turn_id, variant_index, addon_id, content, meta, false)
    }

    /// Upsert a result produced by a user edit. Sets `edited`.
    pub fn update(
        &self,
        turn_id: &TurnId,
        variant_index: usize,
        addon_id: &AddonId,
        content: &str,
        meta: &ResultMeta,
    ) -> Result<StoredResult, StoreError> {
        self.upsert(turn_id, variant_index, addon_id, content, meta, true)
    }

    fn upsert(
        &self,
        turn_id: &TurnId,
        variant_index: usize,
        addon_id: &AddonId,
        content: &str,
        meta: &ResultMeta,
        edited: bool,
    ) -> Result<StoredResult, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO addon_results (turn_id, variant_index, addon_id, content, addon_name,
                                            timestamp, format_style, response_location, edited, revision)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9,
                         (SELECT COALESCE(MAX(revision), 0) + 1 FROM addon_results))
                 ON CONFLICT (turn_id, variant_index, addon_id) DO UPDATE SET
                     content = excluded.content,
                     addon_name = excluded.addon_name,
                     timestamp = excluded.timestamp,
                     format_style = excluded.format_style,
                     response_location = excluded.response_location,
                     edited = excluded.edited,
                     revision = excluded.revision",
                params![
                    turn_id.as_str(),
                    variant_index as i64,
                    addon_id.as_str(),
                    content,
                    meta.addon_name,
                    now,
                    meta.format_style.to_string(),
                    location_to_str(meta.response_location),
                    edited,
                ],
            )?;
            debug!(turn_id = %turn_id, variant = variant_index, addon_id = %addon_id, edited, "result stored");
            fetch(conn, turn_id, variant_index, addon_id)?
                .ok_or_else(|| StoreError::NotFound(format!("result {turn_id}/{variant_index}/{addon_id}")))
        })
    }

    pub fn get(
        &self,
        turn_id: &TurnId,
        variant_index: usize,
        addon_id: &AddonId,
    ) -> Result<Option<StoredResult>, StoreError> {
        self.db
            .with_conn(|conn| fetch(conn, turn_id, variant_index, addon_id))
    }

    /// Every stored result of an add-on across all turns, most recent first.
    pub fn list_for_addon(&self, addon_id: &AddonId) -> Result<Vec<StoredResult>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM addon_results WHERE addon_id = ?1 ORDER BY revision DESC"
            ))?;
            let rows = stmt
                .query_map([addon_id.as_str()], |row| Ok(row_to_result(row)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().collect()
        })
    }

    /// Results for one variant of one turn, ordered by add-on id.
    pub fn list_for_turn(&self, turn_id: &TurnId, variant_index: usize) -> Result<Vec<StoredResult>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM addon_results
                 WHERE turn_id = ?1 AND variant_index = ?2
                 ORDER BY addon_id ASC"
            ))?;
            let rows = stmt
                .query_map(params![turn_id.as_str(), variant_index as i64], |row| {
                    Ok(row_to_result(row))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().collect()
        })
    }

    /// Remove one result. Returns whether a row existed.
    pub fn delete(&self, turn_id: &TurnId, variant_index: usize, addon_id: &AddonId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let rows = conn.execute(
                "DELETE FROM addon_results WHERE turn_id = ?1 AND variant_index = ?2 AND addon_id = ?3",
                params![turn_id.as_str(), variant_index as i64, addon_id.as_str()],
            )?;
            Ok(rows > 0)
        })
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM addon_results", [], |row| row.get(0))
                .map_err(StoreError::from)
        })
    }
}

fn fetch(
    conn: &rusqlite::Connection,
    turn_id: &TurnId,
    variant_index: usize,
    addon_id: &AddonId,
) -> Result<Option<StoredResult>, StoreError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {COLUMNS} FROM addon_results
                 WHERE turn_id = ?1 AND variant_index = ?2 AND addon_id = ?3"
            ),
            params![turn_id.as_str(), variant_index as i64, addon_id.as_str()],
            |row| Ok(row_to_result(row)),
        )
        .optional()?;
    row.transpose()
}

fn row_to_result(row: &Row<'_>) -> Result<StoredResult, StoreError> {
    let variant: i64 = row.get(1)?;
    let format_style: String = row.get(6)?;
    let location: String = row.get(7)?;
    Ok(StoredResult {
        turn_id: TurnId::from_raw(row.get::<_, String>(0)?),
        variant_index: usize::try_from(variant)
            .map_err(|_| StoreError::Corrupt(format!("negative variant index {variant}")))?,
        addon_id: AddonId::from_raw(row.get::<_, String>(2)?),
        content: row.get(3)?,
        addon_name: row.get(4)?,
        timestamp: row.get(5)?,
        format_style: format_style.parse().map_err(StoreError::Corrupt)?,
        response_location: location_from_str(&location)?,
        edited: row.get(8)?,
        revision: row.get(9)?,
    })
}

fn location_to_str(location: ResponseLocation) -> &'static str {
    match location {
        ResponseLocation::OutsideChatlog => "outside_chatlog",
        ResponseLocation::ChatHistory => "chat_history",
    }
}

fn location_from_str(s: &str) -> Result<ResponseLocation, StoreError> {
    match s {
        "outside_chatlog" => Ok(ResponseLocation::OutsideChatlog),
        "chat_history" => Ok(ResponseLocation::ChatHistory),
        other => Err(StoreError::Corrupt(format!("unknown response location: {other}"))),
    }
}
