//! The sequential upload state machine.
//!
//! Units move `Pending -> InFlight -> {Committed, Rejected, Skipped}`. A unit
//! is dispatched only after the previous unit reached a terminal state: the
//! remote store's dependency integrity relies on upload order, so there is no
//! pipelining here by design. Rejections are recoverable per unit through an
//! injected decision capability; an abort ends the run without dispatching
//! anything further.

use crate::plan::UploadUnit;
use crate::store::{FhirStore, Rejection};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Per-unit lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Pending,
    InFlight,
    Committed,
    Rejected,
    Skipped,
}

/// What to do about a rejected unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryChoice {
    /// Transmit the same unit again.
    Retry,
    /// Record the rejection and continue with the next unit.
    Skip,
    /// End the run; nothing further is dispatched.
    Abort,
}

/// Why a run ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The operator chose to abort on a rejection.
    Operator,
    /// An external interrupt was raised.
    Interrupted,
}

/// Injected recovery protocol, decided per rejection.
///
/// A scripted implementation always skips; an interactive one blocks on
/// operator input. The seam keeps the state machine testable without a
/// console.
pub trait RecoveryDecider {
    /// Decide how to proceed after a rejection.
    fn decide(&mut self, unit: &UploadUnit, rejection: &Rejection) -> RecoveryChoice;
}

/// Non-interactive recovery: log and skip every rejected unit.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptedDecider;

impl RecoveryDecider for ScriptedDecider {
    fn decide(&mut self, unit: &UploadUnit, rejection: &Rejection) -> RecoveryChoice {
        tracing::warn!(unit = %unit.describe(), %rejection, "skipping rejected unit");
        RecoveryChoice::Skip
    }
}

/// A unit that was rejected and skipped, with enough context to re-run.
#[derive(Debug, Clone)]
pub struct SkippedUnit {
    pub file_name: String,
    pub resource_type: String,
    pub id: Option<String>,
    pub rejection: Rejection,
}

/// Outcome of a whole run.
#[derive(Debug)]
pub struct RunReport {
    /// Number of units the store accepted.
    pub committed: usize,
    /// Units rejected and skipped.
    pub skipped: Vec<SkippedUnit>,
    /// Set when the run ended before the queue was drained.
    pub aborted: Option<AbortReason>,
    /// Final state of every unit, in queue order.
    pub states: Vec<UnitState>,
}

impl RunReport {
    /// Process exit status: 0 all committed, 1 with skips, 2 aborted.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.aborted.is_some() {
            2
        } else if self.skipped.is_empty() {
            0
        } else {
            1
        }
    }
}

/// Drives the upload queue strictly in sequence.
pub struct Uploader<S, D> {
    store: S,
    decider: D,
    interrupt: Arc<AtomicBool>,
}

impl<S: FhirStore, D: RecoveryDecider> Uploader<S, D> {
    /// Create an uploader over a store and a recovery protocol.
    pub fn new(store: S, decider: D) -> Self {
        Self {
            store,
            decider,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share an interrupt flag; setting it aborts before the next dispatch.
    #[must_use]
    pub fn with_interrupt(mut self, interrupt: Arc<AtomicBool>) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Consume the queue. Committed units stay committed regardless of how
    /// the run ends; after an abort nothing further is dispatched.
    pub fn run(&mut self, units: &[UploadUnit]) -> RunReport {
        let total = units.len();
        let mut report = RunReport {
            committed: 0,
            skipped: Vec::new(),
            aborted: None,
            states: vec![UnitState::Pending; total],
        };

        'queue: for (index, unit) in units.iter().enumerate() {
            loop {
                if self.interrupt.load(Ordering::SeqCst) {
                    tracing::warn!("interrupted, aborting run");
                    report.aborted = Some(AbortReason::Interrupted);
                    break 'queue;
                }

                report.states[index] = UnitState::InFlight;
                tracing::info!(
                    unit = %unit.describe(),
                    package = %unit.package_name,
                    progress = format!("{}/{total}", index + 1),
                    method = %unit.method,
                    "uploading"
                );

                match self.store.transmit(unit) {
                    Ok(status) => {
                        tracing::debug!(unit = %unit.describe(), status, "committed");
                        report.states[index] = UnitState::Committed;
                        report.committed += 1;
                        break;
                    }
                    Err(rejection) => {
                        tracing::error!(unit = %unit.describe(), %rejection, "rejected by store");
                        report.states[index] = UnitState::Rejected;
                        match self.decider.decide(unit, &rejection) {
                            RecoveryChoice::Retry => {
                                tracing::warn!(unit = %unit.describe(), "retrying");
                            }
                            RecoveryChoice::Skip => {
                                report.states[index] = UnitState::Skipped;
                                report.skipped.push(SkippedUnit {
                                    file_name: unit.resource.file_name.clone(),
                                    resource_type: unit.resource.resource_type.clone(),
                                    id: unit.id.clone(),
                                    rejection,
                                });
                                break;
                            }
                            RecoveryChoice::Abort => {
                                report.aborted = Some(AbortReason::Operator);
                                break 'queue;
                            }
                        }
                    }
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{build_plan, Method, PackageResources, PlanOptions};
    use crate::resource::ResourceFile;
    use std::collections::VecDeque;
    use std::path::PathBuf;

    /// Store scripted with one result per transmission, recording dispatches.
    struct MockStore {
        results: VecDeque<Result<u16, Rejection>>,
        dispatched: Vec<String>,
    }

    impl MockStore {
        fn new(results: Vec<Result<u16, Rejection>>) -> Self {
            Self {
                results: results.into(),
                dispatched: Vec::new(),
            }
        }
    }

    impl FhirStore for MockStore {
        fn transmit(&mut self, unit: &UploadUnit) -> Result<u16, Rejection> {
            self.dispatched.push(unit.resource.file_name.clone());
            self.results.pop_front().unwrap_or(Ok(200))
        }
    }

    /// Decider scripted with a fixed sequence of choices.
    struct QueueDecider {
        choices: VecDeque<RecoveryChoice>,
        decisions: usize,
    }

    impl QueueDecider {
        fn new(choices: Vec<RecoveryChoice>) -> Self {
            Self {
                choices: choices.into(),
                decisions: 0,
            }
        }
    }

    impl RecoveryDecider for QueueDecider {
        fn decide(&mut self, _unit: &UploadUnit, _rejection: &Rejection) -> RecoveryChoice {
            self.decisions += 1;
            self.choices.pop_front().unwrap_or(RecoveryChoice::Skip)
        }
    }

    fn units(count: usize) -> Vec<UploadUnit> {
        let resources = (0..count)
            .map(|i| {
                ResourceFile::from_source(
                    PathBuf::from(format!("r{i}.json")),
                    format!("r{i}.json"),
                    r#"{"resourceType": "CodeSystem"}"#.to_string(),
                )
                .unwrap()
            })
            .collect();
        build_plan(
            vec![PackageResources {
                name: "pkg".to_string(),
                version: "1.0.0".to_string(),
                resources,
            }],
            &PlanOptions::default(),
        )
    }

    fn rejected(status: u16) -> Result<u16, Rejection> {
        Err(Rejection {
            status: Some(status),
            message: "declined".to_string(),
        })
    }

    #[test]
    fn test_all_committed() {
        let queue = units(3);
        let mut uploader = Uploader::new(MockStore::new(vec![Ok(201); 3]), ScriptedDecider);
        let report = uploader.run(&queue);
        assert_eq!(report.committed, 3);
        assert!(report.skipped.is_empty());
        assert_eq!(report.exit_code(), 0);
        assert!(report.states.iter().all(|s| *s == UnitState::Committed));
    }

    #[test]
    fn test_scripted_rejection_continues() {
        // unit 3 of 5 rejected with 422; 4 and 5 still dispatch; exit 1
        let queue = units(5);
        let store = MockStore::new(vec![Ok(200), Ok(200), rejected(422), Ok(200), Ok(200)]);
        let mut uploader = Uploader::new(store, ScriptedDecider);
        let report = uploader.run(&queue);

        assert_eq!(report.committed, 4);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].file_name, "r2.json");
        assert_eq!(report.skipped[0].rejection.status, Some(422));
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.states[2], UnitState::Skipped);
        assert_eq!(report.states[4], UnitState::Committed);
    }

    #[test]
    fn test_every_unit_dispatched_in_order() {
        let queue = units(4);
        let mut uploader = Uploader::new(MockStore::new(vec![]), ScriptedDecider);
        let report = uploader.run(&queue);
        assert_eq!(report.committed, 4);
        assert_eq!(
            uploader.store.dispatched,
            vec!["r0.json", "r1.json", "r2.json", "r3.json"]
        );
    }

    #[test]
    fn test_retry_loops_same_unit() {
        let queue = units(2);
        let store = MockStore::new(vec![rejected(500), Ok(200), Ok(200)]);
        let decider = QueueDecider::new(vec![RecoveryChoice::Retry]);
        let mut uploader = Uploader::new(store, decider);
        let report = uploader.run(&queue);

        assert_eq!(report.committed, 2);
        assert!(report.skipped.is_empty());
        assert_eq!(report.exit_code(), 0);
        assert_eq!(
            uploader.store.dispatched,
            vec!["r0.json", "r0.json", "r1.json"]
        );
        assert_eq!(uploader.decider.decisions, 1);
    }

    #[test]
    fn test_abort_stops_dispatch() {
        let queue = units(3);
        let store = MockStore::new(vec![Ok(200), rejected(400), Ok(200)]);
        let decider = QueueDecider::new(vec![RecoveryChoice::Abort]);
        let mut uploader = Uploader::new(store, decider);
        let report = uploader.run(&queue);

        assert_eq!(report.committed, 1);
        assert_eq!(report.aborted, Some(AbortReason::Operator));
        assert_eq!(report.exit_code(), 2);
        // unit 3 never reached the store
        assert_eq!(uploader.store.dispatched, vec!["r0.json", "r1.json"]);
        assert_eq!(report.states[1], UnitState::Rejected);
        assert_eq!(report.states[2], UnitState::Pending);
    }

    #[test]
    fn test_interrupt_aborts_before_dispatch() {
        let queue = units(3);
        let interrupt = Arc::new(AtomicBool::new(true));
        let mut uploader = Uploader::new(MockStore::new(vec![]), ScriptedDecider)
            .with_interrupt(Arc::clone(&interrupt));
        let report = uploader.run(&queue);

        assert_eq!(report.committed, 0);
        assert_eq!(report.aborted, Some(AbortReason::Interrupted));
        assert_eq!(report.exit_code(), 2);
        assert!(uploader.store.dispatched.is_empty());
        assert!(report.states.iter().all(|s| *s == UnitState::Pending));
    }

    /// Store that raises the interrupt flag during its first transmission,
    /// the way a signal handler would while a unit is in flight.
    struct InterruptingStore {
        inner: MockStore,
        flag: Arc<AtomicBool>,
    }

    impl FhirStore for InterruptingStore {
        fn transmit(&mut self, unit: &UploadUnit) -> Result<u16, Rejection> {
            self.flag.store(true, std::sync::atomic::Ordering::SeqCst);
            self.inner.transmit(unit)
        }
    }

    #[test]
    fn test_interrupt_while_in_flight_stops_later_dispatch() {
        let queue = units(3);
        let interrupt = Arc::new(AtomicBool::new(false));
        let store = InterruptingStore {
            inner: MockStore::new(vec![Ok(200)]),
            flag: Arc::clone(&interrupt),
        };
        let mut uploader =
            Uploader::new(store, ScriptedDecider).with_interrupt(Arc::clone(&interrupt));
        let report = uploader.run(&queue);

        // the in-flight unit commits, everything after stays pending
        assert_eq!(report.committed, 1);
        assert_eq!(report.aborted, Some(AbortReason::Interrupted));
        assert_eq!(report.exit_code(), 2);
        assert_eq!(uploader.store.inner.dispatched, vec!["r0.json"]);
        assert_eq!(report.states[0], UnitState::Committed);
        assert_eq!(report.states[1], UnitState::Pending);
        assert_eq!(report.states[2], UnitState::Pending);
    }

    #[test]
    fn test_method_assignment_survives_into_units() {
        let queue = units(1);
        assert_eq!(queue[0].method, Method::Post);
    }
}
