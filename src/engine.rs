use rusqlite::Connection;
use tracing::debug;

use crate::ai::AiClassifier;
use crate::categorizer;
use crate::error::Result;
use crate::memory::{PatternDefinition, PatternMatch, PatternMemory};
use crate::models::{Classification, ClassificationSource, RawMovement};
use crate::settings::Thresholds;

/// Result of classifying one movement.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub classification: Classification,
    /// Pattern worth learning if the operator accepts the classification.
    pub suggestion: Option<PatternDefinition>,
    pub matches: Vec<PatternMatch>,
}

/// Chooses between learned patterns, rules and the AI classifier.
///
/// Memory and rules are consulted first. The AI is only called when neither
/// reaches `thresholds.ai_below`, and the most confident candidate wins.
pub struct Engine<'a> {
    conn: &'a Connection,
    memory: &'a PatternMemory,
    ai: Option<&'a AiClassifier>,
    thresholds: Thresholds,
}

impl<'a> Engine<'a> {
    pub fn new(
        conn: &'a Connection,
        memory: &'a PatternMemory,
        ai: Option<&'a AiClassifier>,
        thresholds: Thresholds,
    ) -> Self {
        Self { conn, memory, ai, thresholds }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn classify(&self, movement: &RawMovement) -> Result<Outcome> {
        let flow = movement.signed_amount();
        let matches = self.memory.find_matches(movement);

        // Learned patterns whose kind contradicts the cash flow do not apply.
        let from_memory = matches
            .iter()
            .find(|m| m.classification.kind.accepts_amount(flow))
            .map(memory_classification);

        let rule = categorizer::classify(self.conn, movement)?;

        let mut best = match from_memory {
            Some(m) if m.confidence >= rule.confidence => m,
            _ => rule.clone(),
        };
        let mut suggestion = None;

        if best.confidence < self.thresholds.ai_below {
            if let Some(ai) = self.ai {
                let verdict = ai.classify(movement, Some(&rule));
                let candidate = verdict.classification;
                if !candidate.kind.accepts_amount(flow) {
                    debug!(
                        description = %movement.description,
                        kind = %candidate.kind,
                        "AI kind contradicts cash flow, ignoring"
                    );
                } else if candidate.confidence > best.confidence {
                    suggestion = verdict
                        .pattern
                        .as_ref()
                        .and_then(|p| p.to_definition(movement, &candidate));
                    best = candidate;
                }
            }
        }

        debug!(
            description = %movement.description,
            source = best.source.as_str(),
            confidence = best.confidence,
            "Classified movement"
        );
        Ok(Outcome {
            classification: best,
            suggestion,
            matches,
        })
    }
}

fn memory_classification(m: &PatternMatch) -> Classification {
    Classification {
        kind: m.classification.kind,
        category: m.classification.category.clone(),
        linked_account: m.classification.linked_account.clone(),
        confidence: m.confidence,
        source: ClassificationSource::Memory {
            pattern_type: m.pattern_type,
            pattern_id: m.pattern_id.clone(),
        },
        note: None,
    }
}
