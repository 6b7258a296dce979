//! Stage results and the per-attempt diagnostics accumulator.

use serde::Serialize;

use crate::error::DeviceError;
use crate::state::StateReason;

/// Result of running one activation stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActStageReturn {
    /// The stage completed; advance to the next one.
    Success,
    /// Required resources are not available yet; re-enter this stage later
    /// without touching accumulated state.
    Postpone,
    /// The attempt failed with a caller-visible reason.
    Failure(StateReason),
}

impl ActStageReturn {
    /// Returns true if the stage completed.
    pub fn is_success(&self) -> bool {
        matches!(self, ActStageReturn::Success)
    }

    /// Returns true if the stage should be re-entered later.
    pub fn is_postponed(&self) -> bool {
        matches!(self, ActStageReturn::Postpone)
    }

    /// Returns the failure reason, if the stage failed.
    pub fn failure_reason(&self) -> Option<StateReason> {
        match self {
            ActStageReturn::Failure(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl From<&DeviceError> for ActStageReturn {
    fn from(err: &DeviceError) -> Self {
        ActStageReturn::Failure(err.reason())
    }
}

/// Category of a non-fatal diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiagnosticKind {
    /// The kernel refused an attribute write.
    KernelRejected,
    /// The attribute does not apply in the active mode and was not written.
    Unsupported,
    /// Bringing a link back up failed after a mutation.
    LinkUpFailed,
    /// Anything else worth surfacing.
    Warning,
}

/// One non-fatal problem observed during a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    /// Category.
    pub kind: DiagnosticKind,
    /// Attribute or subject the problem relates to.
    pub subject: String,
    /// Human-readable detail.
    pub message: String,
}

/// Accumulator of non-fatal diagnostics for one activation attempt.
///
/// Stages that apply configuration best-effort record what the kernel refused
/// here instead of aborting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a diagnostic.
    pub fn push(
        &mut self,
        kind: DiagnosticKind,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.entries.push(Diagnostic {
            kind,
            subject: subject.into(),
            message: message.into(),
        });
    }

    /// Records a rejected kernel write.
    pub fn kernel_rejected(&mut self, attribute: &str, value: &str, message: impl Into<String>) {
        let err = DeviceError::KernelRejected {
            attribute: attribute.to_string(),
            value: value.to_string(),
            message: message.into(),
        };
        self.push(DiagnosticKind::KernelRejected, attribute, err.to_string());
    }

    /// Returns all recorded diagnostics.
    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    /// Returns diagnostics of one kind.
    pub fn of_kind(&self, kind: DiagnosticKind) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().filter(move |d| d.kind == kind)
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of recorded diagnostics.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Appends all entries of `other`.
    pub fn extend(&mut self, other: Diagnostics) {
        self.entries.extend(other.entries);
    }
}
