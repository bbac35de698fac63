use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::CuadraError;
use crate::models::{RawMovement, TransactionKind};

/// Confidence never reaches certainty.
pub const MAX_CONFIDENCE: f64 = 0.99;
pub const MAX_EXAMPLES: usize = 10;
pub const DEFAULT_TOLERANCE_DAYS: i64 = 3;
/// Longest recurrence a temporal pattern may describe.
pub const MAX_PERIODICITY_DAYS: i64 = 366;

pub(crate) fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, MAX_CONFIDENCE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    Reference,
    Amount,
    AmountRange,
    Temporal,
    Keywords,
}

impl PatternType {
    pub const ALL: [PatternType; 5] = [
        Self::Reference,
        Self::Amount,
        Self::AmountRange,
        Self::Temporal,
        Self::Keywords,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reference => "by_reference",
            Self::Amount => "by_amount",
            Self::AmountRange => "by_amount_range",
            Self::Temporal => "temporal",
            Self::Keywords => "by_keywords",
        }
    }
}

impl FromStr for PatternType {
    type Err = CuadraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "by_reference" | "reference" => Ok(Self::Reference),
            "by_amount" | "amount" => Ok(Self::Amount),
            "by_amount_range" | "amount_range" => Ok(Self::AmountRange),
            "temporal" => Ok(Self::Temporal),
            "by_keywords" | "keywords" => Ok(Self::Keywords),
            other => Err(CuadraError::Other(format!("Invalid pattern type: {other}"))),
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fingerprint a pattern matches on. Keywords are stored upper-cased.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PatternKey {
    Reference {
        reference: String,
    },
    Amount {
        amount: Decimal,
        #[serde(default)]
        description_hint: Option<String>,
    },
    AmountRange {
        min: Decimal,
        max: Decimal,
        keywords: Vec<String>,
    },
    Temporal {
        periodicity_days: i64,
        tolerance_days: i64,
        keywords: Vec<String>,
    },
    Keywords {
        keywords: Vec<String>,
    },
}

fn contains_all(upper_description: &str, keywords: &[String]) -> bool {
    !keywords.is_empty() && keywords.iter().all(|k| upper_description.contains(k.as_str()))
}

impl PatternKey {
    pub fn pattern_type(&self) -> PatternType {
        match self {
            Self::Reference { .. } => PatternType::Reference,
            Self::Amount { .. } => PatternType::Amount,
            Self::AmountRange { .. } => PatternType::AmountRange,
            Self::Temporal { .. } => PatternType::Temporal,
            Self::Keywords { .. } => PatternType::Keywords,
        }
    }

    /// Upper-case keywords and hints, drop blanks, order range bounds.
    pub fn normalized(self) -> Self {
        fn clean(keywords: Vec<String>) -> Vec<String> {
            let mut out: Vec<String> = keywords
                .into_iter()
                .map(|k| k.trim().to_uppercase())
                .filter(|k| !k.is_empty())
                .collect();
            out.dedup();
            out
        }
        match self {
            Self::Reference { reference } => Self::Reference {
                reference: reference.trim().to_uppercase(),
            },
            Self::Amount { amount, description_hint } => Self::Amount {
                amount: amount.normalize(),
                description_hint: description_hint
                    .map(|h| h.trim().to_uppercase())
                    .filter(|h| !h.is_empty()),
            },
            Self::AmountRange { min, max, keywords } => Self::AmountRange {
                min: min.min(max),
                max: min.max(max),
                keywords: clean(keywords),
            },
            Self::Temporal { periodicity_days, tolerance_days, keywords } => Self::Temporal {
                periodicity_days,
                tolerance_days: tolerance_days.max(0),
                keywords: clean(keywords),
            },
            Self::Keywords { keywords } => Self::Keywords { keywords: clean(keywords) },
        }
    }

    pub fn validate(&self) -> Result<(), CuadraError> {
        let invalid = |msg: &str| -> Result<(), CuadraError> {
            Err(CuadraError::Other(format!("Invalid pattern: {msg}")))
        };
        match self {
            Self::Reference { reference } if reference.is_empty() => invalid("empty reference"),
            Self::Amount { amount, .. } if amount.is_zero() => invalid("zero amount"),
            Self::AmountRange { keywords, .. } | Self::Keywords { keywords } if keywords.is_empty() => {
                invalid("no keywords")
            }
            Self::Temporal { periodicity_days, keywords, .. } => {
                if !(1..=MAX_PERIODICITY_DAYS).contains(periodicity_days) {
                    invalid(&format!("periodicity must be between 1 and {MAX_PERIODICITY_DAYS} days"))
                } else if keywords.is_empty() {
                    invalid("no keywords")
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    /// Exact value for reference and amount keys, `None` for the rest.
    pub fn natural_id(&self) -> Option<String> {
        match self {
            Self::Reference { reference } => Some(reference.clone()),
            Self::Amount { amount, .. } => Some(amount.normalize().to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedClassification {
    pub kind: TransactionKind,
    pub category: String,
    #[serde(default)]
    pub linked_account: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub date: NaiveDate,
    pub description: String,
    pub amount: Decimal,
}

impl From<&RawMovement> for Example {
    fn from(m: &RawMovement) -> Self {
        Self {
            date: m.date,
            description: m.description.clone(),
            amount: m.signed_amount(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Feedback {
    Confirmation,
    Correction(LearnedClassification),
    Rejection,
}

impl Feedback {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmation => "confirmation",
            Self::Correction(_) => "correction",
            Self::Rejection => "rejection",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub at: DateTime<Utc>,
    pub feedback: String,
    pub previous_confidence: f64,
    pub new_confidence: f64,
    #[serde(default)]
    pub corrected_to: Option<LearnedClassification>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub key: PatternKey,
    pub classification: LearnedClassification,
    pub frequency: u32,
    pub confidence: f64,
    pub last_seen: NaiveDate,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub examples: Vec<Example>,
    #[serde(default)]
    pub human_validated: bool,
    #[serde(default)]
    pub feedback_history: Vec<FeedbackEntry>,
    #[serde(default)]
    pub next_expected: Option<NaiveDate>,
}

impl Pattern {
    pub fn pattern_type(&self) -> PatternType {
        self.key.pattern_type()
    }

    pub(crate) fn push_example(&mut self, movement: &RawMovement) {
        self.examples.push(Example::from(movement));
        if self.examples.len() > MAX_EXAMPLES {
            let excess = self.examples.len() - MAX_EXAMPLES;
            self.examples.drain(..excess);
        }
    }

    pub(crate) fn refresh_next_expected(&mut self) {
        if let PatternKey::Temporal { periodicity_days, .. } = self.key {
            self.next_expected = Duration::try_days(periodicity_days)
                .and_then(|period| self.last_seen.checked_add_signed(period));
        }
    }

    /// Confidence this pattern lends to `movement`, or `None` if it does not
    /// apply. `upper` is the movement's upper-cased description.
    pub fn match_confidence(&self, movement: &RawMovement, upper: &str) -> Option<f64> {
        match &self.key {
            PatternKey::Reference { reference } => {
                let matched = movement
                    .reference
                    .as_deref()
                    .map(|r| r.eq_ignore_ascii_case(reference))
                    .unwrap_or(false);
                matched.then_some(self.confidence)
            }
            PatternKey::Amount { amount, description_hint } => {
                if movement.signed_amount() != *amount {
                    return None;
                }
                let boost = match description_hint {
                    Some(hint) if upper.contains(hint.as_str()) => 0.1,
                    _ => 0.0,
                };
                Some(clamp_confidence(self.confidence + boost))
            }
            PatternKey::AmountRange { min, max, keywords } => {
                let value = movement.signed_amount();
                (value >= *min && value <= *max && contains_all(upper, keywords))
                    .then_some(self.confidence)
            }
            PatternKey::Keywords { keywords } => contains_all(upper, keywords).then_some(self.confidence),
            PatternKey::Temporal { periodicity_days, tolerance_days, keywords } => {
                let expected = self
                    .last_seen
                    .checked_add_signed(Duration::try_days(*periodicity_days)?)?;
                let drift = (movement.date - expected).num_days().abs();
                (drift <= *tolerance_days && contains_all(upper, keywords)).then_some(self.confidence)
            }
        }
    }
}

/// What the caller wants learned: key, classification and starting confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternDefinition {
    pub key: PatternKey,
    pub classification: LearnedClassification,
    pub confidence: f64,
}

const STOPWORDS: &[&str] = &["DE", "DEL", "LA", "EL", "LOS", "LAS", "POR", "PARA", "CON", "SA", "CV"];

/// Significant words of a description: alphabetic, three letters or more.
pub fn significant_words(description: &str, limit: usize) -> Vec<String> {
    description
        .to_uppercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3 && w.chars().all(char::is_alphabetic))
        .filter(|w| !STOPWORDS.contains(w))
        .take(limit)
        .map(str::to_string)
        .collect()
}

impl PatternDefinition {
    /// Keyword pattern taken from the words of a reviewed movement.
    pub fn from_movement(
        movement: &RawMovement,
        classification: LearnedClassification,
        confidence: f64,
    ) -> Option<Self> {
        let keywords = significant_words(&movement.description, 3);
        if keywords.is_empty() {
            return None;
        }
        Some(Self {
            key: PatternKey::Keywords { keywords },
            classification,
            confidence,
        })
    }
}
