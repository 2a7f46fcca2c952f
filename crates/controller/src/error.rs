use chop_apply::ApplyError;
use chop_core::LastAppliedError;
use chop_kubehub::StoreError;
use chop_render::RenderError;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("generating objects: {0}")]
    Render(#[from] RenderError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error("recording last-applied spec: {0}")]
    LastApplied(#[from] LastAppliedError),
    /// The stored record is corrupt or from an unknown version. Needs an operator:
    /// removing the annotation makes the next pass accept the current spec.
    #[error("reading last-applied spec: {0}")]
    UnreadableLastApplied(#[source] LastAppliedError),
}

impl ReconcileError {
    /// Short metric label for the failing stage.
    pub fn stage(&self) -> &'static str {
        match self {
            ReconcileError::Store(_) => "store",
            ReconcileError::Render(_) => "render",
            ReconcileError::Apply(_) => "apply",
            ReconcileError::LastApplied(_) => "last_applied",
            ReconcileError::UnreadableLastApplied(_) => "guard",
        }
    }
}
