//! Steps and flow definitions

use super::context::FlowContext;
use super::record::FlowStatus;
use crate::domain::events::OperationKind;
use crate::domain::ports::WriteOp;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// One reversible unit of work
///
/// `forward` may run more than once for the same context after a resume
/// and must be idempotent. `compensate` runs only for steps whose forward
/// committed, and must also be idempotent.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &'static str;

    async fn forward(&self, ctx: FlowContext) -> Result<FlowContext>;

    async fn compensate(&self, ctx: &FlowContext) -> Result<()>;
}

pub type StepRef = Arc<dyn Step>;

/// Ordered steps of a flow, addressed by index
#[derive(Clone)]
pub struct FlowDefinition {
    pub kind: OperationKind,
    pub steps: Vec<StepRef>,
}

impl FlowDefinition {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: StepRef) -> Self {
        self.steps.push(step);
        self
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl std::fmt::Debug for FlowDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowDefinition")
            .field("kind", &self.kind)
            .field("steps", &self.step_names())
            .finish()
    }
}

/// Rebuilds a definition from a persisted flow kind
pub trait FlowBuilder: Send + Sync {
    fn build(&self, kind: OperationKind) -> FlowDefinition;
}

/// Extra writes committed in the same atomic commit as a terminal status
///
/// Called again with fresh reads whenever that commit hits a `Conflict`
/// on one of the extra keys.
#[async_trait]
pub trait FlowCompletion: Send + Sync {
    async fn writes(&self, ctx: &FlowContext, status: FlowStatus) -> Result<Vec<WriteOp>>;
}
