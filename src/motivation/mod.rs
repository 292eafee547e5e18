pub mod engine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::needs::NeedType;

pub use engine::{ExecutionOutcome, MotivationEngine, MotivationOverrides, MotivationSettings};

pub const DEFAULT_ACCUMULATION_RATE: f64 = 1.0;
pub const DEFAULT_MOTIVATION_THRESHOLD: f64 = 70.0;

/// Per-need accumulation rates (value per minute). Hand-tuned; unmapped
/// need types fall back to [`DEFAULT_ACCUMULATION_RATE`].
pub const DEFAULT_ACCUMULATION_RATES: [(NeedType, f64); 8] = [
    (NeedType::Fun, 3.0),
    (NeedType::SocialConnection, 2.0),
    (NeedType::Affection, 1.8),
    (NeedType::Validation, 1.5),
    (NeedType::Hunger, 1.5),
    (NeedType::Rest, 1.2),
    (NeedType::Security, 0.8),
    (NeedType::Purpose, 0.5),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotivationStatus {
    Active,
    Fulfilled,
    Expired,
}

impl MotivationStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            MotivationStatus::Active => "active",
            MotivationStatus::Fulfilled => "fulfilled",
            MotivationStatus::Expired => "expired",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fulfilled" => MotivationStatus::Fulfilled,
            "expired" => MotivationStatus::Expired,
            _ => MotivationStatus::Active,
        }
    }
}

impl fmt::Display for MotivationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intensity {
    Low,
    Moderate,
    High,
    Critical,
}

impl Intensity {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Intensity::Low => "low",
            Intensity::Moderate => "moderate",
            Intensity::High => "high",
            Intensity::Critical => "critical",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "critical" => Intensity::Critical,
            "high" => Intensity::High,
            "moderate" => Intensity::Moderate,
            _ => Intensity::Low,
        }
    }
}

pub fn intensity_for_priority(priority: i32) -> Intensity {
    if priority >= 9 {
        Intensity::Critical
    } else if priority >= 7 {
        Intensity::High
    } else if priority >= 4 {
        Intensity::Moderate
    } else {
        Intensity::Low
    }
}

/// Resolve the accumulation rate for `need_type`: explicit overrides first,
/// then the compiled table, then [`DEFAULT_ACCUMULATION_RATE`].
pub fn accumulation_rate_for(need_type: NeedType, overrides: &HashMap<NeedType, f64>) -> f64 {
    if let Some(rate) = overrides.get(&need_type) {
        return *rate;
    }
    DEFAULT_ACCUMULATION_RATES
        .iter()
        .find(|(candidate, _)| *candidate == need_type)
        .map(|(_, rate)| *rate)
        .unwrap_or(DEFAULT_ACCUMULATION_RATE)
}

pub fn describe_motivation(need_type: NeedType, need_value: f64) -> String {
    let value = need_value.round();
    match need_type {
        NeedType::Hunger => format!("Wants to grab something to eat (hunger at {}%)", value),
        NeedType::Rest => format!("Feels worn out and wants to rest (fatigue at {}%)", value),
        NeedType::SocialConnection => format!(
            "Wants to reach out and talk to someone (need at {}%)",
            value
        ),
        NeedType::Validation => format!(
            "Hopes to hear that they are doing well (need at {}%)",
            value
        ),
        NeedType::Affection => format!("Longs for warmth and closeness (need at {}%)", value),
        NeedType::Fun => format!("Is bored and looking for something fun ({}%)", value),
        NeedType::Purpose => format!("Searches for something meaningful to do ({}%)", value),
        NeedType::Security => format!("Feels uneasy and wants reassurance ({}%)", value),
        NeedType::SelfExpression => {
            format!("Wants to share their own thoughts and ideas ({}%)", value)
        }
        NeedType::Growth => format!("Wants to learn or try something new ({}%)", value),
    }
}

pub fn motivation_id(need_type: NeedType, character_id: i64, created_at: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}_{}",
        need_type.as_db_str(),
        character_id,
        created_at.timestamp_millis(),
        &suffix[..8]
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Motivation {
    pub motivation_id: String,
    pub character_id: i64,
    pub related_need: NeedType,
    pub description: String,
    pub current_value: f64,
    pub threshold_value: f64,
    pub accumulation_rate: f64,
    pub status: MotivationStatus,
    pub priority: i32,
    pub intensity: Intensity,
    pub success_probability: f64,
    pub resource_cost: f64,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Motivation {
    pub fn is_active(&self) -> bool {
        self.status == MotivationStatus::Active
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| deadline < now)
    }
}
