//! Learned classification patterns.
//!
//! The store is a single versioned JSON document holding one keyed table per
//! pattern type. Every mutation is written through to disk before returning,
//! and a corrupt or missing document starts a fresh store.

mod pattern;

pub use pattern::{
    significant_words, Example, Feedback, FeedbackEntry, LearnedClassification, Pattern,
    PatternDefinition, PatternKey, PatternType, DEFAULT_TOLERANCE_DAYS, MAX_CONFIDENCE,
    MAX_EXAMPLES, MAX_PERIODICITY_DAYS,
};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CuadraError, Result};
use crate::models::RawMovement;
use pattern::clamp_confidence;

pub const MEMORY_VERSION: u32 = 1;

const REINFORCE_STEP: f64 = 0.02;
const CONFIRMATION_STEP: f64 = 0.05;
const CORRECTION_STEP: f64 = 0.05;
const REJECTION_STEP: f64 = 0.10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub total_learned_transactions: u64,
    pub total_patterns: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternTables {
    #[serde(default)]
    pub by_reference: BTreeMap<String, Pattern>,
    #[serde(default)]
    pub by_amount: BTreeMap<String, Pattern>,
    #[serde(default)]
    pub by_amount_range: BTreeMap<String, Pattern>,
    #[serde(default)]
    pub temporal: BTreeMap<String, Pattern>,
    #[serde(default)]
    pub by_keywords: BTreeMap<String, Pattern>,
}

impl PatternTables {
    pub fn table(&self, ty: PatternType) -> &BTreeMap<String, Pattern> {
        match ty {
            PatternType::Reference => &self.by_reference,
            PatternType::Amount => &self.by_amount,
            PatternType::AmountRange => &self.by_amount_range,
            PatternType::Temporal => &self.temporal,
            PatternType::Keywords => &self.by_keywords,
        }
    }

    fn table_mut(&mut self, ty: PatternType) -> &mut BTreeMap<String, Pattern> {
        match ty {
            PatternType::Reference => &mut self.by_reference,
            PatternType::Amount => &mut self.by_amount,
            PatternType::AmountRange => &mut self.by_amount_range,
            PatternType::Temporal => &mut self.temporal,
            PatternType::Keywords => &mut self.by_keywords,
        }
    }

    fn len(&self) -> usize {
        PatternType::ALL.iter().map(|ty| self.table(*ty).len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryDocument {
    pub version: u32,
    pub metadata: Metadata,
    pub patterns: PatternTables,
}

impl MemoryDocument {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            version: MEMORY_VERSION,
            metadata: Metadata {
                created: now,
                last_updated: now,
                total_learned_transactions: 0,
                total_patterns: 0,
            },
            patterns: PatternTables::default(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let doc: Self = serde_json::from_str(json)?;
        if doc.version > MEMORY_VERSION {
            return Err(CuadraError::Other(format!(
                "pattern memory version {} is newer than supported version {MEMORY_VERSION}",
                doc.version
            )));
        }
        Ok(doc)
    }
}

impl Default for MemoryDocument {
    fn default() -> Self {
        Self::new()
    }
}

/// A candidate produced by [`PatternMemory::find_matches`].
#[derive(Debug, Clone, PartialEq)]
pub struct PatternMatch {
    pub pattern_type: PatternType,
    pub pattern_id: String,
    pub classification: LearnedClassification,
    /// Effective confidence for this movement (amount hints may boost it).
    pub confidence: f64,
    pub frequency: u32,
    pub human_validated: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryStats {
    pub per_type: Vec<(PatternType, usize)>,
    pub total_patterns: usize,
    pub human_validated: usize,
    pub average_confidence: f64,
    pub total_learned_transactions: u64,
}

pub struct PatternMemory {
    path: PathBuf,
    doc: MemoryDocument,
    backup_every: usize,
    processed_since_backup: usize,
}

impl PatternMemory {
    /// Load the store at `path`. Missing or unreadable documents yield an
    /// empty store; nothing is written until the first mutation.
    pub fn open(path: &Path, backup_every: usize) -> Self {
        let doc = match std::fs::read_to_string(path) {
            Ok(content) => MemoryDocument::from_json(&content).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "Pattern memory unreadable, starting fresh");
                MemoryDocument::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MemoryDocument::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Pattern memory unavailable, starting fresh");
                MemoryDocument::new()
            }
        };
        Self {
            path: path.to_path_buf(),
            doc,
            backup_every,
            processed_since_backup: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> &MemoryDocument {
        &self.doc
    }

    pub fn get(&self, ty: PatternType, id: &str) -> Option<&Pattern> {
        self.doc.patterns.table(ty).get(id)
    }

    pub fn patterns(&self) -> impl Iterator<Item = &Pattern> {
        PatternType::ALL
            .into_iter()
            .flat_map(move |ty| self.doc.patterns.table(ty).values())
    }

    /// Candidate patterns for `movement`, highest confidence first. Ties keep
    /// lookup order: reference, amount, range, keywords, temporal.
    pub fn find_matches(&self, movement: &RawMovement) -> Vec<PatternMatch> {
        const LOOKUP_ORDER: [PatternType; 5] = [
            PatternType::Reference,
            PatternType::Amount,
            PatternType::AmountRange,
            PatternType::Keywords,
            PatternType::Temporal,
        ];
        let upper = movement.description.to_uppercase();
        let mut out = Vec::new();

        for ty in LOOKUP_ORDER {
            let table = self.doc.patterns.table(ty);
            if ty == PatternType::Reference {
                // Keyed by the reference itself.
                if let Some(p) = movement
                    .reference
                    .as_deref()
                    .and_then(|r| table.get(&r.to_uppercase()))
                {
                    out.push(to_match(p, p.confidence));
                }
                continue;
            }
            for p in table.values() {
                if let Some(confidence) = p.match_confidence(movement, &upper) {
                    out.push(to_match(p, confidence));
                }
            }
        }

        out.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        out
    }

    /// Create a pattern from `definition`, seeded with `movement` as its first
    /// example, and persist. Registering an existing key reinforces it.
    pub fn register_new_pattern(
        &mut self,
        definition: PatternDefinition,
        movement: &RawMovement,
    ) -> Result<String> {
        let key = definition.key.normalized();
        key.validate()?;
        let ty = key.pattern_type();

        if let Some(existing) = self.find_by_key(ty, &key) {
            self.reinforce(ty, &existing, movement)?;
            return Ok(existing);
        }

        let id = self.allocate_id(ty, &key);
        let mut pattern = Pattern {
            id: id.clone(),
            key,
            classification: definition.classification,
            frequency: 1,
            confidence: clamp_confidence(definition.confidence),
            last_seen: movement.date,
            created_at: Utc::now(),
            examples: Vec::new(),
            human_validated: false,
            feedback_history: Vec::new(),
            next_expected: None,
        };
        pattern.push_example(movement);
        pattern.refresh_next_expected();

        let snapshot = self.doc.clone();
        self.doc.patterns.table_mut(ty).insert(id.clone(), pattern);
        self.doc.metadata.total_learned_transactions += 1;
        self.persist_or_restore(snapshot)?;
        tracing::info!(pattern_type = %ty, pattern_id = %id, "Registered pattern");
        Ok(id)
    }

    pub fn reinforce(&mut self, ty: PatternType, id: &str, movement: &RawMovement) -> Result<()> {
        let snapshot = self.doc.clone();
        let pattern = self.pattern_mut(ty, id)?;
        pattern.frequency += 1;
        if movement.date > pattern.last_seen {
            pattern.last_seen = movement.date;
        }
        pattern.confidence = clamp_confidence(pattern.confidence + REINFORCE_STEP);
        pattern.push_example(movement);
        pattern.refresh_next_expected();
        let confidence = pattern.confidence;

        self.doc.metadata.total_learned_transactions += 1;
        self.persist_or_restore(snapshot)?;
        tracing::debug!(pattern_type = %ty, pattern_id = %id, confidence, "Reinforced pattern");
        Ok(())
    }

    pub fn apply_human_feedback(&mut self, ty: PatternType, id: &str, feedback: Feedback) -> Result<()> {
        let snapshot = self.doc.clone();
        let pattern = self.pattern_mut(ty, id)?;
        let previous = pattern.confidence;
        let label = feedback.as_str();

        let corrected_to = match feedback {
            Feedback::Confirmation => {
                pattern.confidence = clamp_confidence(previous + CONFIRMATION_STEP);
                pattern.human_validated = true;
                None
            }
            Feedback::Correction(classification) => {
                pattern.classification = classification.clone();
                pattern.confidence = clamp_confidence(previous + CORRECTION_STEP);
                pattern.human_validated = true;
                Some(classification)
            }
            Feedback::Rejection => {
                pattern.confidence = clamp_confidence(previous - REJECTION_STEP);
                pattern.human_validated = false;
                None
            }
        };
        pattern.feedback_history.push(FeedbackEntry {
            at: Utc::now(),
            feedback: label.to_string(),
            previous_confidence: previous,
            new_confidence: pattern.confidence,
            corrected_to,
        });

        self.persist_or_restore(snapshot)?;
        tracing::info!(pattern_type = %ty, pattern_id = %id, feedback = label, "Applied feedback");
        Ok(())
    }

    /// Count one processed movement; writes a timestamped backup every
    /// `backup_every` movements.
    pub fn note_processed(&mut self) -> Result<Option<PathBuf>> {
        if self.backup_every == 0 {
            return Ok(None);
        }
        self.processed_since_backup += 1;
        if self.processed_since_backup < self.backup_every {
            return Ok(None);
        }
        self.processed_since_backup = 0;
        self.backup().map(Some)
    }

    pub fn backup(&self) -> Result<PathBuf> {
        let dir = self
            .path
            .parent()
            .map(|p| p.join("backups"))
            .unwrap_or_else(|| PathBuf::from("backups"));
        std::fs::create_dir_all(&dir)?;
        let stamp = Utc::now().format("%Y%m%d-%H%M%S%.3f");
        let dest = dir.join(format!("patterns-{stamp}.json"));
        std::fs::write(&dest, self.doc.to_json()?)?;
        tracing::info!(path = %dest.display(), "Pattern memory backed up");
        Ok(dest)
    }

    pub fn stats(&self) -> MemoryStats {
        let per_type: Vec<(PatternType, usize)> = PatternType::ALL
            .iter()
            .map(|ty| (*ty, self.doc.patterns.table(*ty).len()))
            .collect();
        let total = self.doc.patterns.len();
        let validated = self.patterns().filter(|p| p.human_validated).count();
        let average = if total == 0 {
            0.0
        } else {
            self.patterns().map(|p| p.confidence).sum::<f64>() / total as f64
        };
        MemoryStats {
            per_type,
            total_patterns: total,
            human_validated: validated,
            average_confidence: average,
            total_learned_transactions: self.doc.metadata.total_learned_transactions,
        }
    }

    fn pattern_mut(&mut self, ty: PatternType, id: &str) -> Result<&mut Pattern> {
        self.doc
            .patterns
            .table_mut(ty)
            .get_mut(id)
            .ok_or_else(|| CuadraError::Other(format!("No {ty} pattern with id '{id}'")))
    }

    fn find_by_key(&self, ty: PatternType, key: &PatternKey) -> Option<String> {
        let table = self.doc.patterns.table(ty);
        if let Some(id) = key.natural_id() {
            return table.contains_key(&id).then_some(id);
        }
        table.values().find(|p| &p.key == key).map(|p| p.id.clone())
    }

    fn allocate_id(&self, ty: PatternType, key: &PatternKey) -> String {
        if let Some(id) = key.natural_id() {
            return id;
        }
        let prefix = match ty {
            PatternType::AmountRange => "range",
            PatternType::Temporal => "temporal",
            _ => "keywords",
        };
        let base = format!("{prefix}_{}", Utc::now().format("%Y%m%d%H%M%S"));
        let table = self.doc.patterns.table(ty);
        if !table.contains_key(&base) {
            return base;
        }
        (2..)
            .map(|n| format!("{base}_{n}"))
            .find(|candidate| !table.contains_key(candidate))
            .unwrap_or(base)
    }

    /// Persist the current document, putting `snapshot` back if the write
    /// fails so memory never runs ahead of disk.
    fn persist_or_restore(&mut self, snapshot: MemoryDocument) -> Result<()> {
        self.persist().map_err(|e| {
            self.doc = snapshot;
            e
        })
    }

    /// Write through a temp file and rename so a crash never truncates the
    /// store.
    fn persist(&mut self) -> Result<()> {
        self.doc.metadata.last_updated = Utc::now();
        self.doc.metadata.total_patterns = self.doc.patterns.len() as u64;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, self.doc.to_json()?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn to_match(p: &Pattern, confidence: f64) -> PatternMatch {
    PatternMatch {
        pattern_type: p.pattern_type(),
        pattern_id: p.id.clone(),
        classification: p.classification.clone(),
        confidence,
        frequency: p.frequency,
        human_validated: p.human_validated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TransactionKind;
    use chrono::NaiveDate;

    fn movement(description: &str, amount: &str, day: u32) -> RawMovement {
        RawMovement {
            date: NaiveDate::from_ymd_opt(2025, 1, day).unwrap(),
            description: description.to_string(),
            is_debit: true,
            amount: amount.parse().unwrap(),
            running_balance: None,
            reference: None,
        }
    }

    fn learned(category: &str) -> LearnedClassification {
        LearnedClassification {
            kind: TransactionKind::Expense,
            category: category.to_string(),
            linked_account: None,
        }
    }

    fn keywords_def(words: &[&str], confidence: f64) -> PatternDefinition {
        PatternDefinition {
            key: PatternKey::Keywords {
                keywords: words.iter().map(|w| w.to_string()).collect(),
            },
            classification: learned("Telefonía e Internet"),
            confidence,
        }
    }

    fn test_memory() -> (tempfile::TempDir, PatternMemory) {
        let dir = tempfile::tempdir().unwrap();
        let mem = PatternMemory::open(&dir.path().join("memory").join("patterns.json"), 3);
        (dir, mem)
    }

    #[test]
    fn test_register_persists_immediately() {
        let (_dir, mut mem) = test_memory();
        let id = mem
            .register_new_pattern(keywords_def(&["telmex"], 0.6), &movement("PAGO TELMEX", "389", 3))
            .unwrap();
        assert!(id.starts_with("keywords_"));

        let reopened = PatternMemory::open(mem.path(), 3);
        let p = reopened.get(PatternType::Keywords, &id).unwrap();
        assert_eq!(p.frequency, 1);
        assert_eq!(p.confidence, 0.6);
        assert_eq!(p.examples.len(), 1);
        assert_eq!(reopened.document().metadata.total_patterns, 1);
    }

    #[test]
    fn test_reference_and_amount_ids_are_exact_values() {
        let (_dir, mut mem) = test_memory();
        let mut m = movement("SPEI", "200", 5);
        m.reference = Some("abc12345".into());
        let rid = mem
            .register_new_pattern(
                PatternDefinition {
                    key: PatternKey::Reference { reference: "abc12345".into() },
                    classification: learned("Transferencias"),
                    confidence: 0.7,
                },
                &m,
            )
            .unwrap();
        assert_eq!(rid, "ABC12345");
        let aid = mem
            .register_new_pattern(
                PatternDefinition {
                    key: PatternKey::Amount { amount: "-200.00".parse().unwrap(), description_hint: None },
                    classification: learned("Transferencias"),
                    confidence: 0.5,
                },
                &m,
            )
            .unwrap();
        assert_eq!(aid, "-200");
    }

    #[test]
    fn test_register_existing_key_reinforces() {
        let (_dir, mut mem) = test_memory();
        let m = movement("PAGO TELMEX", "389", 3);
        let a = mem.register_new_pattern(keywords_def(&["TELMEX"], 0.6), &m).unwrap();
        let b = mem.register_new_pattern(keywords_def(&["telmex"], 0.6), &m).unwrap();
        assert_eq!(a, b);
        assert_eq!(mem.get(PatternType::Keywords, &a).unwrap().frequency, 2);
    }

    #[test]
    fn test_find_matches_orders_by_confidence_and_does_not_mutate() {
        let (_dir, mut mem) = test_memory();
        let m = movement("PAGO TELMEX 123", "389", 3);
        mem.register_new_pattern(keywords_def(&["TELMEX"], 0.5), &m).unwrap();
        mem.register_new_pattern(
            PatternDefinition {
                key: PatternKey::Amount { amount: "-389".parse().unwrap(), description_hint: Some("TELMEX".into()) },
                classification: learned("Servicios"),
                confidence: 0.8,
            },
            &m,
        )
        .unwrap();
        let before = mem.document().clone();

        let matches = mem.find_matches(&movement("PAGO TELMEX 456", "389", 4));
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].pattern_type, PatternType::Amount);
        assert!((matches[0].confidence - 0.9).abs() < 1e-9);
        assert_eq!(matches[1].pattern_type, PatternType::Keywords);
        assert_eq!(mem.document(), &before);
    }

    #[test]
    fn test_reference_lookup() {
        let (_dir, mut mem) = test_memory();
        let mut m = movement("SPEI", "200", 5);
        m.reference = Some("MBAN0100".into());
        mem.register_new_pattern(
            PatternDefinition {
                key: PatternKey::Reference { reference: "MBAN0100".into() },
                classification: learned("Transferencias"),
                confidence: 0.7,
            },
            &m,
        )
        .unwrap();
        let mut other = movement("OTRO", "1", 6);
        other.reference = Some("mban0100".into());
        assert_eq!(mem.find_matches(&other).len(), 1);
        other.reference = None;
        assert!(mem.find_matches(&other).is_empty());
    }

    #[test]
    fn test_reinforce_steps_and_clamps() {
        let (_dir, mut mem) = test_memory();
        let m = movement("PAGO TELMEX", "389", 3);
        let id = mem.register_new_pattern(keywords_def(&["TELMEX"], 0.98), &m).unwrap();
        mem.reinforce(PatternType::Keywords, &id, &movement("PAGO TELMEX", "389", 20)).unwrap();
        mem.reinforce(PatternType::Keywords, &id, &movement("PAGO TELMEX", "389", 10)).unwrap();
        let p = mem.get(PatternType::Keywords, &id).unwrap();
        assert_eq!(p.confidence, MAX_CONFIDENCE);
        assert_eq!(p.frequency, 3);
        assert_eq!(p.last_seen, NaiveDate::from_ymd_opt(2025, 1, 20).unwrap());
        assert_eq!(p.examples.len(), 3);
    }

    #[test]
    fn test_temporal_reinforce_updates_next_expected() {
        let (_dir, mut mem) = test_memory();
        let id = mem
            .register_new_pattern(
                PatternDefinition {
                    key: PatternKey::Temporal {
                        periodicity_days: 7,
                        tolerance_days: DEFAULT_TOLERANCE_DAYS,
                        keywords: vec!["GIMNASIO".into()],
                    },
                    classification: learned("Salud"),
                    confidence: 0.5,
                },
                &movement("GIMNASIO", "300", 1),
            )
            .unwrap();
        assert_eq!(
            mem.get(PatternType::Temporal, &id).unwrap().next_expected,
            NaiveDate::from_ymd_opt(2025, 1, 8)
        );
        mem.reinforce(PatternType::Temporal, &id, &movement("GIMNASIO", "300", 8)).unwrap();
        assert_eq!(
            mem.get(PatternType::Temporal, &id).unwrap().next_expected,
            NaiveDate::from_ymd_opt(2025, 1, 15)
        );
    }

    #[test]
    fn test_feedback_kinds() {
        let (_dir, mut mem) = test_memory();
        let m = movement("PAGO TELMEX", "389", 3);
        let id = mem.register_new_pattern(keywords_def(&["TELMEX"], 0.5), &m).unwrap();

        mem.apply_human_feedback(PatternType::Keywords, &id, Feedback::Confirmation).unwrap();
        let p = mem.get(PatternType::Keywords, &id).unwrap();
        assert!((p.confidence - 0.55).abs() < 1e-9);
        assert!(p.human_validated);

        let corrected = LearnedClassification {
            kind: TransactionKind::Transfer,
            category: "Pago de Tarjeta".into(),
            linked_account: Some("TDC Oro".into()),
        };
        mem.apply_human_feedback(PatternType::Keywords, &id, Feedback::Correction(corrected.clone()))
            .unwrap();
        let p = mem.get(PatternType::Keywords, &id).unwrap();
        assert_eq!(p.classification, corrected);
        assert!((p.confidence - 0.60).abs() < 1e-9);

        mem.apply_human_feedback(PatternType::Keywords, &id, Feedback::Rejection).unwrap();
        let p = mem.get(PatternType::Keywords, &id).unwrap();
        assert!((p.confidence - 0.50).abs() < 1e-9);
        assert!(!p.human_validated);
        assert_eq!(p.feedback_history.len(), 3);
        assert_eq!(p.feedback_history[1].corrected_to.as_ref(), Some(&corrected));

        let reopened = PatternMemory::open(mem.path(), 3);
        assert_eq!(reopened.get(PatternType::Keywords, &id).unwrap().feedback_history.len(), 3);
    }

    #[test]
    fn test_confidence_bounds_hold_under_repeated_feedback() {
        let (_dir, mut mem) = test_memory();
        let m = movement("PAGO TELMEX", "389", 3);
        let id = mem.register_new_pattern(keywords_def(&["TELMEX"], 0.1), &m).unwrap();
        for _ in 0..5 {
            mem.apply_human_feedback(PatternType::Keywords, &id, Feedback::Rejection).unwrap();
        }
        assert_eq!(mem.get(PatternType::Keywords, &id).unwrap().confidence, 0.0);
        for _ in 0..30 {
            mem.apply_human_feedback(PatternType::Keywords, &id, Feedback::Confirmation).unwrap();
        }
        assert_eq!(mem.get(PatternType::Keywords, &id).unwrap().confidence, MAX_CONFIDENCE);
    }

    #[test]
    fn test_unknown_pattern_is_error() {
        let (_dir, mut mem) = test_memory();
        assert!(mem
            .reinforce(PatternType::Amount, "-1", &movement("X", "1", 1))
            .is_err());
    }

    #[test]
    fn test_failed_write_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let mut mem = PatternMemory::open(&blocker.join("patterns.json"), 3);

        let result = mem.register_new_pattern(keywords_def(&["TELMEX"], 0.6), &movement("PAGO TELMEX", "389", 3));
        assert!(result.is_err());
        assert_eq!(mem.stats().total_patterns, 0);
        assert_eq!(mem.document().metadata.total_learned_transactions, 0);
    }

    #[test]
    fn test_register_rejects_unbounded_periodicity() {
        let (_dir, mut mem) = test_memory();
        let definition = PatternDefinition {
            key: PatternKey::Temporal {
                periodicity_days: 200_000_000_000_000,
                tolerance_days: DEFAULT_TOLERANCE_DAYS,
                keywords: vec!["RENTA".into()],
            },
            classification: learned("Vivienda"),
            confidence: 0.5,
        };
        assert!(mem.register_new_pattern(definition, &movement("RENTA DEPTO", "8000", 1)).is_err());
        assert_eq!(mem.stats().total_patterns, 0);
    }

    #[test]
    fn test_corrupt_store_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patterns.json");
        std::fs::write(&path, "{ not json").unwrap();
        let mem = PatternMemory::open(&path, 3);
        assert_eq!(mem.stats().total_patterns, 0);
    }

    #[test]
    fn test_document_json_round_trip() {
        let (_dir, mut mem) = test_memory();
        let m = movement("PAGO TELMEX", "389.50", 3);
        let id = mem.register_new_pattern(keywords_def(&["TELMEX"], 0.61), &m).unwrap();
        mem.reinforce(PatternType::Keywords, &id, &m).unwrap();
        let json = mem.document().to_json().unwrap();
        let back = MemoryDocument::from_json(&json).unwrap();
        assert_eq!(&back, mem.document());
    }

    #[test]
    fn test_backup_every_n_processed() {
        let (dir, mut mem) = test_memory();
        assert!(mem.note_processed().unwrap().is_none());
        assert!(mem.note_processed().unwrap().is_none());
        let path = mem.note_processed().unwrap().unwrap();
        assert!(path.exists());
        assert!(path.starts_with(dir.path().join("memory").join("backups")));
    }

    #[test]
    fn test_stats() {
        let (_dir, mut mem) = test_memory();
        let m = movement("PAGO TELMEX", "389", 3);
        let id = mem.register_new_pattern(keywords_def(&["TELMEX"], 0.5), &m).unwrap();
        mem.register_new_pattern(keywords_def(&["CFE"], 0.7), &movement("CFE", "500", 4)).unwrap();
        mem.apply_human_feedback(PatternType::Keywords, &id, Feedback::Confirmation).unwrap();
        let stats = mem.stats();
        assert_eq!(stats.total_patterns, 2);
        assert_eq!(stats.human_validated, 1);
        assert!((stats.average_confidence - 0.625).abs() < 1e-9);
    }
}
