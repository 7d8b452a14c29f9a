//! Declarative reconciliation plan model.
//!
//! A plan is an ordered list of [`Step`]s. Every operation the planner can
//! schedule, from "create a namespace if absent" to "just wait for a
//! secret", fits the same shape: an optional precondition over the probed
//! state, an optional idempotency check against the live environment, and
//! an action. The uniform shape keeps the planner declarative and lets
//! tests drive it with fake backends.

pub mod executor;

pub use executor::{TaskExecutor, Waiter};

use crate::backend::WaitTarget;
use crate::probe::DeploymentState;

type Predicate<'run> = Box<dyn Fn(&DeploymentState) -> bool + 'run>;
type Check<'run> = Box<dyn Fn() -> bool + 'run>;
type Execute<'run> = Box<dyn FnOnce() -> anyhow::Result<Option<WaitTarget>> + 'run>;

pub(crate) enum Action<'run> {
    /// Perform the operation; it may hand back a readiness gate to poll.
    Execute(Execute<'run>),
    /// No operation of our own, only readiness gates produced by earlier
    /// steps or by the cluster itself.
    Await(Vec<WaitTarget>),
}

/// One unit of a reconciliation plan.
pub struct Step<'run> {
    pub(crate) name: String,
    pub(crate) precondition: Option<Predicate<'run>>,
    pub(crate) idempotency: Option<Check<'run>>,
    pub(crate) action: Action<'run>,
}

impl std::fmt::Debug for Step<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let action = match self.action {
            Action::Execute(_) => "Execute",
            Action::Await(_) => "Await",
        };
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("precondition", &self.precondition.is_some())
            .field("idempotency", &self.idempotency.is_some())
            .field("action", &action)
            .finish()
    }
}

impl<'run> Step<'run> {
    /// Step performing an operation against the backend.
    pub fn run(
        name: impl Into<String>,
        execute: impl FnOnce() -> anyhow::Result<Option<WaitTarget>> + 'run,
    ) -> Self {
        Self {
            name: name.into(),
            precondition: None,
            idempotency: None,
            action: Action::Execute(Box::new(execute)),
        }
    }

    /// Pure wait step with no execute phase.
    pub fn awaiting(name: impl Into<String>, targets: Vec<WaitTarget>) -> Self {
        Self {
            name: name.into(),
            precondition: None,
            idempotency: None,
            action: Action::Await(targets),
        }
    }

    /// Skip the step (not an error) unless the predicate holds for the
    /// probed state.
    pub fn only_if(mut self, precondition: impl Fn(&DeploymentState) -> bool + 'run) -> Self {
        self.precondition = Some(Box::new(precondition));
        self
    }

    /// Skip execution when the step's effect already exists; the step still
    /// counts as satisfied for everything after it.
    pub fn skip_when(mut self, check: impl Fn() -> bool + 'run) -> Self {
        self.idempotency = Some(Box::new(check));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Ordered step list, executed top to bottom by [`TaskExecutor`].
#[derive(Default)]
pub struct ReconciliationPlan<'run> {
    pub(crate) steps: Vec<Step<'run>>,
}

impl<'run> ReconciliationPlan<'run> {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn push(&mut self, step: Step<'run>) {
        self.steps.push(step);
    }

    pub fn extend(&mut self, steps: impl IntoIterator<Item = Step<'run>>) {
        self.steps.extend(steps);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step names in execution order, for logs and tests.
    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.name()).collect()
    }
}
