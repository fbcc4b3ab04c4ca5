//! Culprit Shared - data model for automation-culprit diagnosis.
//!
//! Pure types and pure functions only: events, rule trees, derived matches
//! and pattern signatures, the diagnosis record, errors and stage budgets.

pub mod budget;
pub mod diagnosis;
pub mod error;
pub mod event;
pub mod pattern;
pub mod rule;
pub mod rule_match;

pub use budget::{Stage, StageBudget, StageClock, StageTiming};
pub use diagnosis::{
    DegradedSource, Diagnosis, DiagnosisBasis, DiagnosisMetadata, DiagnosisState,
    EvidenceSource, IndexFreshness,
};
pub use error::{DiagnosisError, ProviderError, RuleError};
pub use event::{sort_events, DeviceEvent, TimeWindow};
pub use pattern::{PatternEvidence, PatternKind, PatternSignature};
pub use rule::{
    AutomationRule, CommandAction, Condition, DeviceCommand, DeviceOperand, EveryAction,
    IfAction, Operand, RuleAction, RuleStatus, Schedule,
};
pub use rule_match::{MatchRole, RuleMatch, DIRECT_MATCH_CONFIDENCE};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
