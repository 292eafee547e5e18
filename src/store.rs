//! Repository traits the engines persist through.
//!
//! [`crate::database::CompanionDatabase`] is the production implementation;
//! the engines only depend on these contracts.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::characters::Character;
use crate::motivation::Motivation;
use crate::needs::{Need, NeedType};

#[async_trait]
pub trait NeedStore: Send + Sync {
    /// Active needs of one character.
    async fn list_needs(&self, character_id: i64) -> Result<Vec<Need>>;

    /// The unique active need of `need_type` for the character, if any.
    async fn get_active_need(&self, character_id: i64, need_type: NeedType)
        -> Result<Option<Need>>;

    /// Insert a new row and return its id.
    async fn insert_need(&self, need: &Need) -> Result<i64>;

    /// Persist every mutable column of an existing row.
    async fn save_need(&self, need: &Need) -> Result<()>;
}

#[async_trait]
pub trait MotivationStore: Send + Sync {
    async fn get_motivation(&self, motivation_id: &str) -> Result<Option<Motivation>>;

    async fn find_active_motivation(
        &self,
        character_id: i64,
        need_type: NeedType,
    ) -> Result<Option<Motivation>>;

    /// Insert `motivation` unless an active one already exists for the same
    /// (character, need). The check and the insert are one atomic step.
    /// Returns `true` when the row was inserted.
    async fn insert_motivation_if_absent(&self, motivation: &Motivation) -> Result<bool>;

    async fn save_motivation(&self, motivation: &Motivation) -> Result<()>;

    async fn list_active_motivations(&self) -> Result<Vec<Motivation>>;

    async fn list_active_motivations_for(&self, character_id: i64) -> Result<Vec<Motivation>>;

    /// Move every active motivation with `expires_at < now` to expired.
    /// Returns the number of rows changed.
    async fn expire_motivations(&self, now: DateTime<Utc>) -> Result<usize>;
}

#[async_trait]
pub trait CharacterStore: Send + Sync {
    async fn insert_character(&self, name: &str) -> Result<Character>;

    async fn get_character(&self, character_id: i64) -> Result<Option<Character>>;

    async fn list_active_characters(&self) -> Result<Vec<Character>>;

    /// Returns `false` when no row matched.
    async fn set_character_active(&self, character_id: i64, active: bool) -> Result<bool>;
}
