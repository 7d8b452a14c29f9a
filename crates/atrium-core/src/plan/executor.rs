//! Step execution and wait polling.

use std::time::Duration;

use tracing::{debug, info};

use super::{Action, ReconciliationPlan};
use crate::backend::{Backend, PollStatus, Timeout, WaitTarget};
use crate::error::ReconcileError;
use crate::probe::DeploymentState;

/// Blocking poll primitive with an injectable sleep, so tests simulate
/// delayed readiness without real time passing.
pub struct Waiter {
    interval: Duration,
    sleep: Box<dyn Fn(Duration)>,
}

impl Default for Waiter {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            sleep: Box::new(std::thread::sleep),
        }
    }
}

impl Waiter {
    pub fn with_sleep(interval: Duration, sleep: impl Fn(Duration) + 'static) -> Self {
        Self {
            interval,
            sleep: Box::new(sleep),
        }
    }

    /// Waiter that never blocks, for tests.
    pub fn instant() -> Self {
        Self::with_sleep(Duration::from_secs(1), |_| {})
    }
}

/// Poll a wait target until it is ready, failed or out of time.
///
/// Bounded timeouts are measured in poll intervals, matching the 1 second
/// reference cadence.
pub(crate) fn wait_for(
    backend: &dyn Backend,
    namespace: &str,
    waiter: &Waiter,
    target: &WaitTarget,
) -> Result<(), ReconcileError> {
    debug!(resource = %target.name, "waiting for readiness");
    let mut elapsed = 0u64;
    loop {
        let status = backend
            .poll(namespace, target.kind, &target.name)
            .map_err(|err| ReconcileError::step(format!("wait for {}", target.name), err))?;
        match status {
            PollStatus::Ready => return Ok(()),
            PollStatus::Failed(reason) => {
                return Err(ReconcileError::WaitFailed {
                    resource: target.name.clone(),
                    reason,
                });
            }
            PollStatus::Pending => {}
        }
        if let Timeout::Bounded(limit) = target.timeout
            && elapsed >= limit
        {
            return Err(ReconcileError::WaitTimeout {
                resource: target.name.clone(),
                seconds: limit,
            });
        }
        (waiter.sleep)(waiter.interval);
        elapsed += waiter.interval.as_secs().max(1);
    }
}

/// Runs a plan top to bottom, aborting on the first hard failure.
///
/// Partially applied effects are not rolled back: the whole system is
/// re-entrant and recovery is re-running the command after remediation.
pub struct TaskExecutor<'a> {
    backend: &'a dyn Backend,
    namespace: &'a str,
    waiter: &'a Waiter,
}

impl<'a> TaskExecutor<'a> {
    pub fn new(backend: &'a dyn Backend, namespace: &'a str, waiter: &'a Waiter) -> Self {
        Self {
            backend,
            namespace,
            waiter,
        }
    }

    pub fn run(
        &self,
        state: &DeploymentState,
        plan: ReconciliationPlan<'_>,
    ) -> Result<(), ReconcileError> {
        for step in plan.steps {
            if let Some(precondition) = &step.precondition
                && !precondition(state)
            {
                debug!(step = %step.name, "precondition not met, skipping");
                continue;
            }
            if let Some(satisfied) = &step.idempotency
                && satisfied()
            {
                debug!(step = %step.name, "already satisfied, skipping");
                continue;
            }

            info!(step = %step.name, "executing");
            match step.action {
                Action::Execute(execute) => {
                    let gate =
                        execute().map_err(|err| ReconcileError::step(step.name.clone(), err))?;
                    if let Some(target) = gate {
                        wait_for(self.backend, self.namespace, self.waiter, &target)?;
                    }
                }
                Action::Await(targets) => {
                    for target in &targets {
                        wait_for(self.backend, self.namespace, self.waiter, target)?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::backend::fake::FakeBackend;
    use crate::plan::Step;

    fn empty_state() -> DeploymentState {
        DeploymentState::default()
    }

    fn marker_step<'run>(
        name: &str,
        log: &'run RefCell<Vec<String>>,
    ) -> Step<'run> {
        let name_owned = name.to_string();
        Step::run(name, move || {
            log.borrow_mut().push(name_owned);
            Ok(None)
        })
    }

    #[test]
    fn test_false_precondition_skips_execute_but_not_later_steps() {
        let backend = FakeBackend::new();
        let waiter = Waiter::instant();
        let log = RefCell::new(Vec::new());

        let mut plan = ReconciliationPlan::new();
        plan.push(marker_step("one", &log));
        plan.push(marker_step("two", &log).only_if(|_| false));
        plan.push(marker_step("three", &log));

        let executor = TaskExecutor::new(&backend, "svc", &waiter);
        executor.run(&empty_state(), plan).unwrap();
        assert_eq!(*log.borrow(), vec!["one", "three"]);
    }

    #[test]
    fn test_idempotency_check_skips_execute_and_run_succeeds() {
        let backend = FakeBackend::new();
        let waiter = Waiter::instant();
        let log = RefCell::new(Vec::new());

        let mut plan = ReconciliationPlan::new();
        plan.push(marker_step("guarded", &log).skip_when(|| true));
        plan.push(marker_step("after", &log));

        let executor = TaskExecutor::new(&backend, "svc", &waiter);
        executor.run(&empty_state(), plan).unwrap();
        assert_eq!(*log.borrow(), vec!["after"]);
    }

    #[test]
    fn test_failed_on_third_poll_aborts_after_exactly_three_polls() {
        let backend = FakeBackend::new();
        backend.script_polls([
            crate::backend::PollStatus::Pending,
            crate::backend::PollStatus::Pending,
            crate::backend::PollStatus::Failed("job failed".into()),
        ]);
        let waiter = Waiter::instant();
        let log = RefCell::new(Vec::new());

        let mut plan = ReconciliationPlan::new();
        plan.push(Step::awaiting(
            "wait for job",
            vec![WaitTarget::job("sync", Timeout::Infinite)],
        ));
        plan.push(marker_step("never", &log));

        let executor = TaskExecutor::new(&backend, "svc", &waiter);
        let err = executor.run(&empty_state(), plan).unwrap_err();
        assert!(matches!(err, ReconcileError::WaitFailed { .. }));
        assert_eq!(*backend.poll_count.borrow(), 3);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_bounded_wait_times_out_with_resource_name() {
        let backend = FakeBackend::new();
        backend.script_polls(std::iter::repeat_n(crate::backend::PollStatus::Pending, 10));
        let waiter = Waiter::instant();

        let mut plan = ReconciliationPlan::new();
        plan.push(Step::awaiting(
            "wait for secret",
            vec![WaitTarget {
                kind: crate::backend::WaitKind::Secret,
                name: "atrium-cert".into(),
                timeout: Timeout::Bounded(2),
            }],
        ));

        let executor = TaskExecutor::new(&backend, "svc", &waiter);
        match executor.run(&empty_state(), plan).unwrap_err() {
            ReconcileError::WaitTimeout { resource, seconds } => {
                assert_eq!(resource, "atrium-cert");
                assert_eq!(seconds, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_execute_error_aborts_with_step_name() {
        let backend = FakeBackend::new();
        let waiter = Waiter::instant();
        let log = RefCell::new(Vec::new());

        let mut plan = ReconciliationPlan::new();
        plan.push(Step::run("create ingress", || {
            anyhow::bail!("rejected")
        }));
        plan.push(marker_step("never", &log));

        let executor = TaskExecutor::new(&backend, "svc", &waiter);
        let err = executor.run(&empty_state(), plan).unwrap_err();
        assert!(err.to_string().contains("create ingress"));
        assert!(log.borrow().is_empty());
    }
}
