use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::TtlCache;
use crate::error::CoreError;
use crate::needs::NeedsEngine;
use crate::store::CharacterStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Character {
    pub id: i64,
    pub name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Character lookup and initialisation.
pub struct CharacterDirectory {
    store: Arc<dyn CharacterStore>,
    needs: Arc<NeedsEngine>,
    cache: TtlCache<i64, Character>,
}

impl CharacterDirectory {
    pub fn new(store: Arc<dyn CharacterStore>, needs: Arc<NeedsEngine>, cache_ttl: Duration) -> Self {
        Self {
            store,
            needs,
            cache: TtlCache::new(cache_ttl),
        }
    }

    /// Insert a character and give it the default need set.
    pub async fn create_character(&self, name: &str) -> Result<Character> {
        let character = self.store.insert_character(name.trim()).await?;
        let created = self.needs.create_default_needs(character.id).await?;
        tracing::info!(
            "Created character '{}' (id {}) with {} need(s)",
            character.name,
            character.id,
            created.len()
        );
        self.cache.set(character.id, character.clone()).await;
        Ok(character)
    }

    pub async fn get_character(&self, character_id: i64) -> Result<Character> {
        if let Some(character) = self.cache.get(&character_id).await {
            return Ok(character);
        }
        let character = self
            .store
            .get_character(character_id)
            .await?
            .ok_or(CoreError::CharacterNotFound(character_id))?;
        self.cache.set(character_id, character.clone()).await;
        Ok(character)
    }

    pub async fn list_active_characters(&self) -> Result<Vec<Character>> {
        self.store.list_active_characters().await
    }

    pub async fn deactivate_character(&self, character_id: i64) -> Result<()> {
        if !self.store.set_character_active(character_id, false).await? {
            return Err(CoreError::CharacterNotFound(character_id).into());
        }
        self.cache.delete(&character_id).await;
        tracing::info!("Deactivated character {}", character_id);
        Ok(())
    }

    pub async fn purge_cache(&self) -> usize {
        self.cache.purge_expired().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::CompanionDatabase;
    use crate::events::EventBus;
    use crate::needs::NeedType;
    use crate::store::NeedStore;

    fn directory(db: Arc<CompanionDatabase>) -> CharacterDirectory {
        let needs = Arc::new(NeedsEngine::new(
            db.clone(),
            Arc::new(EventBus::new()),
            chrono::Duration::minutes(60),
        ));
        CharacterDirectory::new(db, needs, Duration::from_secs(300))
    }

    #[tokio::test]
    async fn creating_a_character_seeds_default_needs() {
        let db = Arc::new(CompanionDatabase::in_memory().expect("db"));
        let directory = directory(db.clone());

        let character = directory.create_character("  Mira ").await.expect("create");
        assert_eq!(character.name, "Mira");

        let needs = db.list_needs(character.id).await.expect("needs");
        assert_eq!(needs.len(), NeedType::ALL.len());

        let fetched = directory.get_character(character.id).await.expect("get");
        assert_eq!(fetched.id, character.id);
    }

    #[tokio::test]
    async fn missing_character_is_a_typed_error() {
        let db = Arc::new(CompanionDatabase::in_memory().expect("db"));
        let directory = directory(db);

        let err = directory.get_character(404).await.expect_err("missing");
        assert_eq!(
            err.downcast_ref::<CoreError>(),
            Some(&CoreError::CharacterNotFound(404))
        );

        let err = directory
            .deactivate_character(404)
            .await
            .expect_err("missing");
        assert!(err.downcast_ref::<CoreError>().is_some());
    }

    #[tokio::test]
    async fn deactivated_characters_leave_the_active_list() {
        let db = Arc::new(CompanionDatabase::in_memory().expect("db"));
        let directory = directory(db);
        let a = directory.create_character("A").await.expect("create");
        let b = directory.create_character("B").await.expect("create");

        directory.deactivate_character(a.id).await.expect("deactivate");
        let active = directory.list_active_characters().await.expect("list");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, b.id);

        let reloaded = directory.get_character(a.id).await.expect("still readable");
        assert!(!reloaded.is_active);
    }
}
