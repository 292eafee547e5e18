use thiserror::Error;

use crate::needs::NeedType;

/// Terminal lookup failures surfaced to the immediate caller.
///
/// These travel inside `anyhow::Error`; callers that need to branch on them
/// use `err.downcast_ref::<CoreError>()`. They are never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("need not found: {need_type} for character {character_id}")]
    NeedNotFound {
        character_id: i64,
        need_type: NeedType,
    },
    #[error("character not found: {0}")]
    CharacterNotFound(i64),
}
