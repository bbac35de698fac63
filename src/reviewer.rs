//! Review of staged movements: the per-movement state machine, turning
//! decisions into ledger postings, and feeding outcomes back into the
//! pattern memory.

use rusqlite::Connection;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::catalog;
use crate::dedupe::{self, DuplicateDecision, DuplicatePolicy};
use crate::error::{CuadraError, Result};
use crate::importer;
use crate::ledger::{self, PostedGroup, Posting};
use crate::memory::{
    Feedback, LearnedClassification, PatternDefinition, PatternMatch, PatternMemory, PatternType,
    MAX_CONFIDENCE,
};
use crate::models::{
    Account, Classification, ClassificationSource, RawMovement, ReviewState, StagedMovement,
    TransactionKind,
};

/// Starting confidence for patterns learned from a reviewed movement.
const REVIEWED_PATTERN_CONFIDENCE: f64 = 0.75;

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Confirm,
    Correct,
    Ignore,
    EditAgain,
}

const TRANSITIONS: &[(ReviewState, Action, ReviewState)] = &[
    (ReviewState::Pending, Action::Confirm, ReviewState::Confirmed),
    (ReviewState::Pending, Action::Correct, ReviewState::Corrected),
    (ReviewState::Pending, Action::Ignore, ReviewState::Ignored),
    (ReviewState::Confirmed, Action::EditAgain, ReviewState::Pending),
    (ReviewState::Corrected, Action::EditAgain, ReviewState::Pending),
    (ReviewState::Ignored, Action::EditAgain, ReviewState::Pending),
];

pub fn transition(from: ReviewState, action: Action) -> Result<ReviewState> {
    TRANSITIONS
        .iter()
        .find(|(state, a, _)| *state == from && *a == action)
        .map(|(_, _, to)| *to)
        .ok_or_else(|| CuadraError::Other(format!("cannot {action:?} a {} movement", from.as_str())))
}

/// Final answer for one movement.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub state: ReviewState,
    pub classification: Classification,
    /// Per-item duplicate decision; wins over the batch policy.
    pub duplicate: Option<DuplicateDecision>,
}

impl Resolution {
    pub fn confirm(staged: &StagedMovement) -> Self {
        Self {
            state: ReviewState::Confirmed,
            classification: staged.classification.clone(),
            duplicate: None,
        }
    }

    pub fn ignore(staged: &StagedMovement) -> Self {
        Self {
            state: ReviewState::Ignored,
            classification: staged.classification.clone(),
            duplicate: None,
        }
    }

    pub fn correct(classification: Classification) -> Self {
        Self {
            state: ReviewState::Corrected,
            classification,
            duplicate: None,
        }
    }

    pub fn with_duplicate(mut self, decision: DuplicateDecision) -> Self {
        self.duplicate = Some(decision);
        self
    }
}

/// Operator-corrected classification. The category is kept when `category`
/// is `None`.
pub fn corrected(
    base: &Classification,
    kind: TransactionKind,
    category: Option<&str>,
    linked_account: Option<String>,
) -> Classification {
    Classification {
        kind,
        category: category.map(str::to_string).unwrap_or_else(|| base.category.clone()),
        linked_account,
        confidence: MAX_CONFIDENCE,
        source: ClassificationSource::Human,
        note: base.note.clone(),
    }
}

/// Memory matches confident enough to be posted without asking.
pub fn auto_confirmable(staged: &StagedMovement, threshold: f64) -> bool {
    staged.duplicate_of.is_none()
        && staged.classification.memory_pattern().is_some()
        && staged.classification.confidence >= threshold
        && staged.classification.kind.accepts_amount(staged.movement.signed_amount())
}

// ---------------------------------------------------------------------------
// Batch report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct MovementError {
    pub date: chrono::NaiveDate,
    pub amount: Decimal,
    pub description_prefix: String,
    pub message: String,
}

impl MovementError {
    fn new(staged: &StagedMovement, err: &CuadraError) -> Self {
        Self {
            date: staged.movement.date,
            amount: staged.movement.signed_amount(),
            description_prefix: staged.movement.description.chars().take(40).collect(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub processed: usize,
    pub skipped: usize,
    pub errored: usize,
    pub errors: Vec<MovementError>,
    /// The operator left before every movement was resolved.
    pub exited_early: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MovementOutcome {
    Posted(PostedGroup),
    Skipped,
    Ignored,
    Failed(MovementError),
}

/// What the decision callback wants done with the movement in front of it.
pub enum Step {
    Resolve(Resolution),
    /// Leave the movement pending for a later session.
    Defer,
    Exit,
}

// ---------------------------------------------------------------------------
// Reviewer
// ---------------------------------------------------------------------------

pub struct Reviewer<'a> {
    conn: &'a Connection,
    memory: &'a mut PatternMemory,
    account: Account,
    policy: DuplicatePolicy,
}

impl<'a> Reviewer<'a> {
    pub fn for_batch(
        conn: &'a Connection,
        memory: &'a mut PatternMemory,
        batch_id: i64,
        policy: DuplicatePolicy,
    ) -> Result<Self> {
        let batch = importer::get_batch(conn, batch_id)?;
        let account = catalog::get_account(conn, batch.account_id)?;
        Ok(Self { conn, memory, account, policy })
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    pub fn memory(&self) -> &PatternMemory {
        &*self.memory
    }

    pub fn similar_patterns(&self, staged: &StagedMovement) -> Vec<PatternMatch> {
        self.memory.find_matches(&staged.movement)
    }

    /// Confirm or reject a pattern the operator looked at.
    pub fn pattern_feedback(&mut self, ty: PatternType, id: &str, feedback: Feedback) -> Result<()> {
        self.memory.apply_human_feedback(ty, id, feedback)
    }

    /// Walk every pending movement of the batch in order. `decide` is asked
    /// for each one that cannot be auto-confirmed. Movement-level failures
    /// are recorded and the batch carries on.
    pub fn run<F>(&mut self, batch_id: i64, auto_confirm: Option<f64>, mut decide: F) -> Result<BatchReport>
    where
        F: FnMut(&mut Self, &StagedMovement) -> Result<Step>,
    {
        let mut report = BatchReport::default();
        for mut staged in importer::pending_movements(self.conn, batch_id)? {
            self.recheck_duplicate(&mut staged)?;
            let step = match auto_confirm {
                Some(threshold) if auto_confirmable(&staged, threshold) => {
                    debug!(movement = %staged.movement.locator(), "Auto-confirmed from memory");
                    Step::Resolve(Resolution::confirm(&staged))
                }
                _ => decide(self, &staged)?,
            };
            match step {
                Step::Resolve(resolution) => {
                    match self.resolve(&staged, &resolution)? {
                        MovementOutcome::Posted(_) => report.processed += 1,
                        MovementOutcome::Skipped | MovementOutcome::Ignored => report.skipped += 1,
                        MovementOutcome::Failed(err) => {
                            report.errored += 1;
                            report.errors.push(err);
                        }
                    }
                }
                Step::Defer => {}
                Step::Exit => {
                    report.exited_early = true;
                    break;
                }
            }
        }
        importer::refresh_batch_stats(self.conn, batch_id)?;
        info!(
            batch = batch_id,
            processed = report.processed,
            skipped = report.skipped,
            errored = report.errored,
            "Review finished"
        );
        Ok(report)
    }

    /// Batches staged before an overlapping batch was posted were checked
    /// against a ledger that lacked those postings, so look again before
    /// anything is recorded.
    fn recheck_duplicate(&self, staged: &mut StagedMovement) -> Result<()> {
        if staged.duplicate_of.is_some() {
            return Ok(());
        }
        let claimed = dedupe::claimed_by_batch(self.conn, staged.batch_id, staged.id)?;
        let m = &staged.movement;
        if let Some(existing) = dedupe::find_duplicate(self.conn, m.date, m.amount, m.reference.as_deref(), &claimed)? {
            debug!(existing, movement = %m.locator(), "Duplicate found at review time");
            importer::set_duplicate_of(self.conn, staged.id, existing)?;
            staged.duplicate_of = Some(existing);
        }
        Ok(())
    }

    /// Apply one resolution. Movement-scoped failures come back as
    /// [`MovementOutcome::Failed`] and are recorded on the staged row;
    /// anything else is returned as an error.
    pub fn resolve(&mut self, staged: &StagedMovement, resolution: &Resolution) -> Result<MovementOutcome> {
        match self.try_resolve(staged, resolution) {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_movement_scoped() => {
                warn!(movement = %staged.movement.locator(), error = %e, "Movement failed");
                importer::set_state(self.conn, staged.id, ReviewState::Pending, Some(&e.to_string()), None)?;
                Ok(MovementOutcome::Failed(MovementError::new(staged, &e)))
            }
            Err(e) => Err(e),
        }
    }

    fn try_resolve(&mut self, staged: &StagedMovement, resolution: &Resolution) -> Result<MovementOutcome> {
        if staged.state.is_terminal() {
            return Err(CuadraError::Other(format!(
                "movement {} is already {}",
                staged.id,
                staged.state.as_str()
            )));
        }
        match resolution.state {
            ReviewState::Pending => {
                return Err(CuadraError::Other("a pending movement cannot be resolved".into()))
            }
            ReviewState::Ignored => {
                importer::set_state(self.conn, staged.id, ReviewState::Ignored, None, None)?;
                return Ok(MovementOutcome::Ignored);
            }
            ReviewState::Confirmed | ReviewState::Corrected => {}
        }

        let replaces = match staged.duplicate_of {
            None => None,
            Some(existing) => match self.policy.decide(resolution.duplicate) {
                Some(DuplicateDecision::Skip) => {
                    debug!(existing, movement = %staged.movement.locator(), "Skipped duplicate");
                    importer::set_state(self.conn, staged.id, ReviewState::Ignored, None, None)?;
                    return Ok(MovementOutcome::Skipped);
                }
                Some(DuplicateDecision::Overwrite) => Some(existing),
                Some(DuplicateDecision::Import) => None,
                None => {
                    return Err(CuadraError::DuplicateConflict {
                        existing_id: existing,
                        detail: "no duplicate decision was made".into(),
                    })
                }
            },
        };

        // The staged row changes in the same transaction as the legs, so a
        // crash can never leave a posting behind a row still marked pending.
        let classification = &resolution.classification;
        let state = resolution.state;
        let posted = ledger::post(
            self.conn,
            &Posting {
                account: &self.account,
                movement: &staged.movement,
                classification,
                batch_id: Some(staged.batch_id),
                replaces,
            },
            |tx, posted| {
                if state == ReviewState::Corrected {
                    importer::update_classification(tx, staged.id, classification)?;
                }
                importer::set_state(tx, staged.id, state, None, Some(&posted.group_id))
            },
        )?;

        self.learn(staged, resolution);
        if let Err(e) = self.memory.note_processed() {
            warn!(error = %e, "Pattern memory backup failed");
        }
        Ok(MovementOutcome::Posted(posted))
    }

    /// Feed the outcome into pattern memory. Memory is best-effort: failures
    /// are logged, the posting stands.
    fn learn(&mut self, staged: &StagedMovement, resolution: &Resolution) {
        let learned = learned_from(&resolution.classification);
        let movement = &staged.movement;
        let result = match (resolution.state, staged.classification.memory_pattern()) {
            (ReviewState::Confirmed, Some((ty, id))) => self.memory.reinforce(ty, id, movement),
            (ReviewState::Corrected, Some((ty, id))) => {
                self.memory.apply_human_feedback(ty, id, Feedback::Correction(learned))
            }
            (ReviewState::Confirmed | ReviewState::Corrected, None) => {
                let definition = match (&staged.suggestion, resolution.state) {
                    (Some(suggested), ReviewState::Confirmed) => Some(PatternDefinition {
                        classification: learned.clone(),
                        ..suggested.clone()
                    }),
                    _ => PatternDefinition::from_movement(movement, learned.clone(), REVIEWED_PATTERN_CONFIDENCE),
                };
                match definition {
                    Some(def) => self.register(def, movement, &learned),
                    None => Ok(()),
                }
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!(movement = %movement.locator(), error = %e, "Pattern memory update failed");
        }
    }

    /// Register `def`; an existing pattern under the same key that disagrees
    /// with the reviewed classification is corrected.
    fn register(
        &mut self,
        def: PatternDefinition,
        movement: &RawMovement,
        learned: &LearnedClassification,
    ) -> Result<()> {
        let ty = def.key.pattern_type();
        let id = self.memory.register_new_pattern(def, movement)?;
        let disagrees = self
            .memory
            .get(ty, &id)
            .map(|p| &p.classification != learned)
            .unwrap_or(false);
        if disagrees {
            self.memory.apply_human_feedback(ty, &id, Feedback::Correction(learned.clone()))?;
        }
        Ok(())
    }
}

fn learned_from(c: &Classification) -> LearnedClassification {
    LearnedClassification {
        kind: c.kind,
        category: c.category.clone(),
        linked_account: c.linked_account.clone(),
    }
}
