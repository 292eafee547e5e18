use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Mutex;

use crate::characters::Character;
use crate::motivation::{Intensity, Motivation, MotivationStatus};
use crate::needs::{Need, NeedType};
use crate::store::{CharacterStore, MotivationStore, NeedStore};

const NEED_COLUMNS: &str = "id, character_id, need_type, current_value, max_value, growth_rate,
     decay_rate, priority, threshold, frustration_level, blocked_until, block_reason,
     is_active, last_updated";

const MOTIVATION_COLUMNS: &str = "motivation_id, character_id, related_need, description,
     current_value, threshold_value, accumulation_rate, status, priority, intensity,
     success_probability, resource_cost, created_at, last_updated, expires_at";

/// SQLite-backed store for characters, needs and motivations.
pub struct CompanionDatabase {
    conn: Mutex<Connection>,
}

impl CompanionDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;
        Self::with_connection(conn)
    }

    /// Private database that lives as long as this handle.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS characters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS needs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                character_id INTEGER NOT NULL,
                need_type TEXT NOT NULL,
                current_value REAL NOT NULL DEFAULT 0,
                max_value REAL NOT NULL DEFAULT 100,
                growth_rate REAL NOT NULL,
                decay_rate REAL NOT NULL,
                priority INTEGER NOT NULL,
                threshold REAL NOT NULL,
                frustration_level INTEGER NOT NULL DEFAULT 0,
                blocked_until TEXT,
                block_reason TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                last_updated TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS motivations (
                motivation_id TEXT PRIMARY KEY,
                character_id INTEGER NOT NULL,
                related_need TEXT NOT NULL,
                description TEXT NOT NULL,
                current_value REAL NOT NULL DEFAULT 0,
                threshold_value REAL NOT NULL,
                accumulation_rate REAL NOT NULL,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL,
                intensity TEXT NOT NULL,
                success_probability REAL NOT NULL,
                resource_cost REAL NOT NULL,
                created_at TEXT NOT NULL,
                last_updated TEXT NOT NULL,
                expires_at TEXT
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_needs_character_type ON needs(character_id, need_type)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_motivations_status_expires ON motivations(status, expires_at)",
            [],
        )?;
        // Backstop for the conditional insert: one active motivation per need.
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_motivations_one_active
             ON motivations(character_id, related_need) WHERE status = 'active'",
            [],
        )?;

        Ok(())
    }
}

// ========================================================================
// Needs
// ========================================================================

#[async_trait]
impl NeedStore for CompanionDatabase {
    async fn list_needs(&self, character_id: i64) -> Result<Vec<Need>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM needs
             WHERE character_id = ?1 AND is_active = 1
             ORDER BY id ASC",
            NEED_COLUMNS
        ))?;
        let needs = stmt
            .query_map([character_id], need_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(needs)
    }

    async fn get_active_need(
        &self,
        character_id: i64,
        need_type: NeedType,
    ) -> Result<Option<Need>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            &format!(
                "SELECT {} FROM needs
                 WHERE character_id = ?1 AND need_type = ?2 AND is_active = 1
                 ORDER BY id ASC
                 LIMIT 1",
                NEED_COLUMNS
            ),
            params![character_id, need_type.as_db_str()],
            need_from_row,
        );

        match result {
            Ok(need) => Ok(Some(need)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn insert_need(&self, need: &Need) -> Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO needs
             (character_id, need_type, current_value, max_value, growth_rate, decay_rate,
              priority, threshold, frustration_level, blocked_until, block_reason,
              is_active, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                need.character_id,
                need.need_type.as_db_str(),
                need.current_value,
                need.max_value,
                need.growth_rate,
                need.decay_rate,
                need.priority,
                need.threshold,
                need.frustration_level,
                need.blocked_until.map(to_db_time),
                need.block_reason,
                need.is_active,
                to_db_time(need.last_updated),
            ],
        )
        .with_context(|| {
            format!(
                "Failed to insert {} need for character {}",
                need.need_type, need.character_id
            )
        })?;
        Ok(conn.last_insert_rowid())
    }

    async fn save_need(&self, need: &Need) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE needs
             SET current_value = ?2, max_value = ?3, growth_rate = ?4, decay_rate = ?5,
                 priority = ?6, threshold = ?7, frustration_level = ?8, blocked_until = ?9,
                 block_reason = ?10, is_active = ?11, last_updated = ?12
             WHERE id = ?1",
            params![
                need.id,
                need.current_value,
                need.max_value,
                need.growth_rate,
                need.decay_rate,
                need.priority,
                need.threshold,
                need.frustration_level,
                need.blocked_until.map(to_db_time),
                need.block_reason,
                need.is_active,
                to_db_time(need.last_updated),
            ],
        )
        .with_context(|| format!("Failed to save need {}", need.id))?;
        Ok(())
    }
}

// ========================================================================
// Motivations
// ========================================================================

#[async_trait]
impl MotivationStore for CompanionDatabase {
    async fn get_motivation(&self, motivation_id: &str) -> Result<Option<Motivation>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            &format!(
                "SELECT {} FROM motivations WHERE motivation_id = ?1",
                MOTIVATION_COLUMNS
            ),
            [motivation_id],
            motivation_from_row,
        );

        match result {
            Ok(motivation) => Ok(Some(motivation)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_active_motivation(
        &self,
        character_id: i64,
        need_type: NeedType,
    ) -> Result<Option<Motivation>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            &format!(
                "SELECT {} FROM motivations
                 WHERE character_id = ?1 AND related_need = ?2 AND status = ?3
                 LIMIT 1",
                MOTIVATION_COLUMNS
            ),
            params![
                character_id,
                need_type.as_db_str(),
                MotivationStatus::Active.as_db_str()
            ],
            motivation_from_row,
        );

        match result {
            Ok(motivation) => Ok(Some(motivation)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn insert_motivation_if_absent(&self, motivation: &Motivation) -> Result<bool> {
        let conn = self.lock_conn()?;
        let inserted = conn
            .execute(
                "INSERT INTO motivations
                 (motivation_id, character_id, related_need, description, current_value,
                  threshold_value, accumulation_rate, status, priority, intensity,
                  success_probability, resource_cost, created_at, last_updated, expires_at)
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15
                 WHERE NOT EXISTS (
                     SELECT 1 FROM motivations
                     WHERE character_id = ?2 AND related_need = ?3 AND status = 'active'
                 )",
                params![
                    motivation.motivation_id,
                    motivation.character_id,
                    motivation.related_need.as_db_str(),
                    motivation.description,
                    motivation.current_value,
                    motivation.threshold_value,
                    motivation.accumulation_rate,
                    motivation.status.as_db_str(),
                    motivation.priority,
                    motivation.intensity.as_db_str(),
                    motivation.success_probability,
                    motivation.resource_cost,
                    to_db_time(motivation.created_at),
                    to_db_time(motivation.last_updated),
                    motivation.expires_at.map(to_db_time),
                ],
            )
            .with_context(|| format!("Failed to insert motivation {}", motivation.motivation_id))?;
        Ok(inserted > 0)
    }

    async fn save_motivation(&self, motivation: &Motivation) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE motivations
             SET description = ?2, current_value = ?3, threshold_value = ?4,
                 accumulation_rate = ?5, status = ?6, priority = ?7, intensity = ?8,
                 success_probability = ?9, resource_cost = ?10, last_updated = ?11,
                 expires_at = ?12
             WHERE motivation_id = ?1",
            params![
                motivation.motivation_id,
                motivation.description,
                motivation.current_value,
                motivation.threshold_value,
                motivation.accumulation_rate,
                motivation.status.as_db_str(),
                motivation.priority,
                motivation.intensity.as_db_str(),
                motivation.success_probability,
                motivation.resource_cost,
                to_db_time(motivation.last_updated),
                motivation.expires_at.map(to_db_time),
            ],
        )
        .with_context(|| format!("Failed to save motivation {}", motivation.motivation_id))?;
        Ok(())
    }

    async fn list_active_motivations(&self) -> Result<Vec<Motivation>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM motivations WHERE status = ?1 ORDER BY created_at ASC",
            MOTIVATION_COLUMNS
        ))?;
        let motivations = stmt
            .query_map(
                [MotivationStatus::Active.as_db_str()],
                motivation_from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(motivations)
    }

    async fn list_active_motivations_for(&self, character_id: i64) -> Result<Vec<Motivation>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM motivations
             WHERE character_id = ?1 AND status = ?2
             ORDER BY priority DESC, created_at ASC",
            MOTIVATION_COLUMNS
        ))?;
        let motivations = stmt
            .query_map(
                params![character_id, MotivationStatus::Active.as_db_str()],
                motivation_from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(motivations)
    }

    async fn expire_motivations(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock_conn()?;
        let now_raw = to_db_time(now);
        let changed = conn.execute(
            "UPDATE motivations
             SET status = ?1, last_updated = ?2
             WHERE status = ?3 AND expires_at IS NOT NULL AND expires_at < ?2",
            params![
                MotivationStatus::Expired.as_db_str(),
                now_raw,
                MotivationStatus::Active.as_db_str()
            ],
        )?;
        Ok(changed)
    }
}

// ========================================================================
// Characters
// ========================================================================

#[async_trait]
impl CharacterStore for CompanionDatabase {
    async fn insert_character(&self, name: &str) -> Result<Character> {
        let created_at = Utc::now();
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO characters (name, is_active, created_at) VALUES (?1, 1, ?2)",
            params![name, to_db_time(created_at)],
        )
        .with_context(|| format!("Failed to insert character '{}'", name))?;
        Ok(Character {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            is_active: true,
            created_at,
        })
    }

    async fn get_character(&self, character_id: i64) -> Result<Option<Character>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT id, name, is_active, created_at FROM characters WHERE id = ?1",
            [character_id],
            character_from_row,
        );

        match result {
            Ok(character) => Ok(Some(character)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_active_characters(&self) -> Result<Vec<Character>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, is_active, created_at FROM characters
             WHERE is_active = 1
             ORDER BY id ASC",
        )?;
        let characters = stmt
            .query_map([], character_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(characters)
    }

    async fn set_character_active(&self, character_id: i64, active: bool) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE characters SET is_active = ?2 WHERE id = ?1",
            params![character_id, active],
        )?;
        Ok(changed > 0)
    }
}

/// Fixed-width UTC timestamps so lexical order in SQL matches time order.
pub fn to_db_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_db_time(
    value: String,
    column: usize,
) -> std::result::Result<DateTime<Utc>, rusqlite::Error> {
    value.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_optional_db_time(
    value: Option<String>,
    column: usize,
) -> std::result::Result<Option<DateTime<Utc>>, rusqlite::Error> {
    value.map(|raw| parse_db_time(raw, column)).transpose()
}

fn parse_need_type(raw: String, column: usize) -> std::result::Result<NeedType, rusqlite::Error> {
    NeedType::from_db(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            Box::from(format!("unknown need type '{}'", raw)),
        )
    })
}

fn need_from_row(row: &Row<'_>) -> std::result::Result<Need, rusqlite::Error> {
    Ok(Need {
        id: row.get(0)?,
        character_id: row.get(1)?,
        need_type: parse_need_type(row.get(2)?, 2)?,
        current_value: row.get(3)?,
        max_value: row.get(4)?,
        growth_rate: row.get(5)?,
        decay_rate: row.get(6)?,
        priority: row.get(7)?,
        threshold: row.get(8)?,
        frustration_level: row.get(9)?,
        blocked_until: parse_optional_db_time(row.get(10)?, 10)?,
        block_reason: row.get(11)?,
        is_active: row.get(12)?,
        last_updated: parse_db_time(row.get(13)?, 13)?,
    })
}

fn motivation_from_row(row: &Row<'_>) -> std::result::Result<Motivation, rusqlite::Error> {
    let status_raw: String = row.get(7)?;
    let intensity_raw: String = row.get(9)?;
    Ok(Motivation {
        motivation_id: row.get(0)?,
        character_id: row.get(1)?,
        related_need: parse_need_type(row.get(2)?, 2)?,
        description: row.get(3)?,
        current_value: row.get(4)?,
        threshold_value: row.get(5)?,
        accumulation_rate: row.get(6)?,
        status: MotivationStatus::from_db(&status_raw),
        priority: row.get(8)?,
        intensity: Intensity::from_db(&intensity_raw),
        success_probability: row.get(10)?,
        resource_cost: row.get(11)?,
        created_at: parse_db_time(row.get(12)?, 12)?,
        last_updated: parse_db_time(row.get(13)?, 13)?,
        expires_at: parse_optional_db_time(row.get(14)?, 14)?,
    })
}

fn character_from_row(row: &Row<'_>) -> std::result::Result<Character, rusqlite::Error> {
    Ok(Character {
        id: row.get(0)?,
        name: row.get(1)?,
        is_active: row.get(2)?,
        created_at: parse_db_time(row.get(3)?, 3)?,
    })
}
