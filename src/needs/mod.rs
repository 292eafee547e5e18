pub mod engine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use engine::{NeedUpdate, NeedsEngine};

pub const DEFAULT_NEED_MAX_VALUE: f64 = 100.0;
pub const DEFAULT_NEED_THRESHOLD: f64 = 70.0;
pub const MAX_FRUSTRATION_LEVEL: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeedType {
    Hunger,
    Rest,
    SocialConnection,
    Validation,
    Affection,
    Fun,
    Purpose,
    Security,
    SelfExpression,
    Growth,
}

impl NeedType {
    pub const ALL: [NeedType; 10] = [
        NeedType::Hunger,
        NeedType::Rest,
        NeedType::SocialConnection,
        NeedType::Validation,
        NeedType::Affection,
        NeedType::Fun,
        NeedType::Purpose,
        NeedType::Security,
        NeedType::SelfExpression,
        NeedType::Growth,
    ];

    pub fn as_db_str(self) -> &'static str {
        match self {
            NeedType::Hunger => "hunger",
            NeedType::Rest => "rest",
            NeedType::SocialConnection => "social_connection",
            NeedType::Validation => "validation",
            NeedType::Affection => "affection",
            NeedType::Fun => "fun",
            NeedType::Purpose => "purpose",
            NeedType::Security => "security",
            NeedType::SelfExpression => "self_expression",
            NeedType::Growth => "growth",
        }
    }

    pub fn from_db(raw: &str) -> Option<Self> {
        let raw = raw.trim().to_ascii_lowercase();
        NeedType::ALL
            .into_iter()
            .find(|need_type| need_type.as_db_str() == raw)
    }

    /// Fraction of `max_value` at which this need counts as critical.
    ///
    /// Bodily and safety needs turn critical first, relational needs next,
    /// everything else only when nearly saturated.
    pub fn critical_ratio(self) -> f64 {
        match self {
            NeedType::Hunger | NeedType::Rest | NeedType::Security => 0.80,
            NeedType::SocialConnection | NeedType::Affection | NeedType::Validation => 0.85,
            NeedType::Fun | NeedType::Purpose | NeedType::SelfExpression | NeedType::Growth => {
                0.95
            }
        }
    }
}

impl fmt::Display for NeedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// Initial parameters for one need type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeedDefaults {
    pub need_type: NeedType,
    pub growth_rate: f64,
    pub decay_rate: f64,
    pub priority: i32,
    pub threshold: f64,
}

/// Default need table. Hand-tuned values, kept as data.
pub const DEFAULT_NEEDS: [NeedDefaults; 10] = [
    NeedDefaults {
        need_type: NeedType::Hunger,
        growth_rate: 2.0,
        decay_rate: 10.0,
        priority: 8,
        threshold: DEFAULT_NEED_THRESHOLD,
    },
    NeedDefaults {
        need_type: NeedType::Rest,
        growth_rate: 1.5,
        decay_rate: 8.0,
        priority: 7,
        threshold: DEFAULT_NEED_THRESHOLD,
    },
    NeedDefaults {
        need_type: NeedType::SocialConnection,
        growth_rate: 3.0,
        decay_rate: 12.0,
        priority: 9,
        threshold: DEFAULT_NEED_THRESHOLD,
    },
    NeedDefaults {
        need_type: NeedType::Validation,
        growth_rate: 2.0,
        decay_rate: 10.0,
        priority: 6,
        threshold: DEFAULT_NEED_THRESHOLD,
    },
    NeedDefaults {
        need_type: NeedType::Affection,
        growth_rate: 2.5,
        decay_rate: 12.0,
        priority: 8,
        threshold: DEFAULT_NEED_THRESHOLD,
    },
    NeedDefaults {
        need_type: NeedType::Fun,
        growth_rate: 4.0,
        decay_rate: 15.0,
        priority: 5,
        threshold: DEFAULT_NEED_THRESHOLD,
    },
    NeedDefaults {
        need_type: NeedType::Purpose,
        growth_rate: 0.5,
        decay_rate: 5.0,
        priority: 4,
        threshold: DEFAULT_NEED_THRESHOLD,
    },
    NeedDefaults {
        need_type: NeedType::Security,
        growth_rate: 1.0,
        decay_rate: 6.0,
        priority: 10,
        threshold: DEFAULT_NEED_THRESHOLD,
    },
    NeedDefaults {
        need_type: NeedType::SelfExpression,
        growth_rate: 1.5,
        decay_rate: 8.0,
        priority: 5,
        threshold: DEFAULT_NEED_THRESHOLD,
    },
    NeedDefaults {
        need_type: NeedType::Growth,
        growth_rate: 0.8,
        decay_rate: 5.0,
        priority: 3,
        threshold: DEFAULT_NEED_THRESHOLD,
    },
];

pub fn default_for(need_type: NeedType) -> NeedDefaults {
    DEFAULT_NEEDS
        .iter()
        .copied()
        .find(|defaults| defaults.need_type == need_type)
        .unwrap_or(NeedDefaults {
            need_type,
            growth_rate: 1.0,
            decay_rate: 5.0,
            priority: 5,
            threshold: DEFAULT_NEED_THRESHOLD,
        })
}

/// One persisted need gauge. `id` is 0 until the row has been inserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Need {
    pub id: i64,
    pub character_id: i64,
    pub need_type: NeedType,
    pub current_value: f64,
    pub max_value: f64,
    pub growth_rate: f64,
    pub decay_rate: f64,
    pub priority: i32,
    pub threshold: f64,
    pub frustration_level: u8,
    pub blocked_until: Option<DateTime<Utc>>,
    pub block_reason: Option<String>,
    pub is_active: bool,
    pub last_updated: DateTime<Utc>,
}

impl Need {
    pub fn from_defaults(character_id: i64, defaults: NeedDefaults, now: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            character_id,
            need_type: defaults.need_type,
            current_value: 0.0,
            max_value: DEFAULT_NEED_MAX_VALUE,
            growth_rate: defaults.growth_rate,
            decay_rate: defaults.decay_rate,
            priority: defaults.priority,
            threshold: defaults.threshold,
            frustration_level: 0,
            blocked_until: None,
            block_reason: None,
            is_active: true,
            last_updated: now,
        }
    }

    pub fn is_blocked(&self, now: DateTime<Utc>) -> bool {
        self.blocked_until.is_some_and(|until| until > now)
    }

    pub fn can_grow(&self, now: DateTime<Utc>) -> bool {
        !self.is_blocked(now) && self.current_value < self.max_value
    }

    pub fn is_past_threshold(&self) -> bool {
        self.current_value >= self.threshold
    }

    pub fn is_critical(&self) -> bool {
        self.current_value >= self.need_type.critical_ratio() * self.max_value
    }

    /// Apply a signed change and clamp to `[0, max_value]`. Returns the new value.
    pub fn apply_change(&mut self, change: f64) -> f64 {
        self.current_value = clamp_value(self.current_value + change, self.max_value);
        self.current_value
    }
}

pub fn clamp_value(value: f64, max_value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, max_value.max(0.0))
}
