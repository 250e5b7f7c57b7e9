//! Execution engine
//!
//! The engine is responsible for:
//! - Continuous DAG dispatch: a step runs the instant its dependencies succeed
//! - Forward failure propagation: dependents of failed/skipped steps are skipped
//! - Per-step wrapping: class timeout, transient retry with backoff, circuit breaker
//! - A global cap on in-flight outbound calls
//! - Cooperative cancellation and the plan-level deadline

mod breaker;
mod progress;
mod signal;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitStatus};
pub use progress::{ExecutionProgressEvent, ExecutionProgressReporter};
pub use signal::StopSignal;

use crate::capability::{
    CapabilityDescriptor, CapabilityError, CapabilityRegistry, CredentialSet, ExecutionContext,
};
use crate::types::{
    ExecutionPlan, ExecutionStep, PlanId, PlanResult, SessionId, SkipReason, StepId, StepOutcome,
    StepResult, StepStatus,
};

const MAX_LOG_JSON_CHARS: usize = 2_000;
const DEFAULT_MAX_IN_FLIGHT: usize = 8;
const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 2;
const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(200);
const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_READ_ONLY_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MUTATING_TIMEOUT: Duration = Duration::from_secs(30);
const NO_DEADLINE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

pub(crate) fn truncate_for_log(input: &str, max_chars: usize) -> String {
    let char_count = input.chars().count();
    if char_count <= max_chars {
        return input.to_string();
    }
    let mut preview: String = input.chars().take(max_chars).collect();
    preview.push_str(&format!("... [truncated, total_chars={}]", char_count));
    preview
}

fn truncate_json_for_log(value: &Value, max_chars: usize) -> String {
    truncate_for_log(&value.to_string(), max_chars)
}

/// Per-run executor context
pub struct ExecutorContext {
    pub session_id: SessionId,
    pub user_id: Option<String>,
    /// Forwarded to handlers untouched
    pub credentials: CredentialSet,
    pub stop: StopSignal,
    /// Deadline covering the whole run; behaves like a cancel
    pub plan_timeout: Option<Duration>,
    pub progress_reporter: Option<Arc<dyn ExecutionProgressReporter>>,
}

impl ExecutorContext {
    pub fn new(session_id: impl Into<SessionId>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: None,
            credentials: CredentialSet::default(),
            stop: StopSignal::new(),
            plan_timeout: None,
            progress_reporter: None,
        }
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_credentials(mut self, credentials: CredentialSet) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_plan_timeout(mut self, plan_timeout: Duration) -> Self {
        self.plan_timeout = Some(plan_timeout);
        self
    }

    /// Attach a realtime execution progress reporter.
    pub fn with_progress_reporter(mut self, reporter: Arc<dyn ExecutionProgressReporter>) -> Self {
        self.progress_reporter = Some(reporter);
        self
    }
}

impl std::fmt::Debug for ExecutorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorContext")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("plan_timeout", &self.plan_timeout)
            .finish_non_exhaustive()
    }
}

/// Outcome of one dispatched step
struct StepRun {
    step_id: StepId,
    capability: String,
    outcome: StepOutcome,
    attempts: u32,
    duration_ms: u64,
}

/// The engine - walks one plan's DAG
pub struct ExecutionEngine {
    registry: Arc<CapabilityRegistry>,
    /// Global outbound-call cap, shared by every plan this engine runs
    outbound: Arc<Semaphore>,
    breaker: Arc<CircuitBreaker>,
    /// Max retries for transient errors (excluding the initial attempt).
    pub max_retry_attempts: u32,
    /// Base delay for exponential backoff when the error carries no retry_after.
    pub retry_base_delay: Duration,
    /// Cap for exponential backoff delay.
    pub retry_max_delay: Duration,
    pub read_only_timeout: Duration,
    pub mutating_timeout: Duration,
}

impl ExecutionEngine {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            registry,
            outbound: Arc::new(Semaphore::new(DEFAULT_MAX_IN_FLIGHT)),
            breaker: Arc::new(CircuitBreaker::default()),
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            retry_max_delay: DEFAULT_RETRY_MAX_DELAY,
            read_only_timeout: DEFAULT_READ_ONLY_TIMEOUT,
            mutating_timeout: DEFAULT_MUTATING_TIMEOUT,
        }
    }

    /// Set the global cap on simultaneously in-flight calls
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.outbound = Arc::new(Semaphore::new(max.max(1)));
        self
    }

    /// Configure retry policy for transient errors.
    pub fn with_retry_policy(
        mut self,
        max_retry_attempts: u32,
        retry_base_delay: Duration,
        retry_max_delay: Duration,
    ) -> Self {
        self.max_retry_attempts = max_retry_attempts;
        self.retry_base_delay = retry_base_delay;
        self.retry_max_delay = retry_max_delay.max(retry_base_delay);
        self
    }

    pub fn with_timeouts(mut self, read_only: Duration, mutating: Duration) -> Self {
        self.read_only_timeout = read_only;
        self.mutating_timeout = mutating;
        self
    }

    pub fn with_breaker(mut self, config: BreakerConfig) -> Self {
        self.breaker = Arc::new(CircuitBreaker::new(config));
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Timeout for one attempt: descriptor override, else by capability class
    pub fn timeout_for(&self, descriptor: &CapabilityDescriptor) -> Duration {
        descriptor.timeout().unwrap_or(if descriptor.mutates_external_state {
            self.mutating_timeout
        } else {
            self.read_only_timeout
        })
    }

    /// Run every dispatchable step of `plan`
    pub async fn run(&self, plan: &mut ExecutionPlan, ctx: &ExecutorContext) -> PlanResult {
        self.run_with(plan, &PlanResult::new(), ctx).await
    }

    /// Run `plan`, reading bound values from results of an earlier phase.
    /// Returns only the results produced by this run.
    pub async fn run_with(
        &self,
        plan: &mut ExecutionPlan,
        prior: &PlanResult,
        ctx: &ExecutorContext,
    ) -> PlanResult {
        let started = Instant::now();
        let deadline = started + ctx.plan_timeout.unwrap_or(NO_DEADLINE);
        let mut outputs: HashMap<StepId, Value> = prior
            .succeeded()
            .filter_map(|r| r.data().map(|d| (r.step_id.clone(), d.clone())))
            .collect();
        let mut result = PlanResult::new();
        let mut in_flight = FuturesUnordered::new();

        info!(
            plan_id = %plan.id,
            session_id = %ctx.session_id,
            steps = plan.steps.len(),
            "plan execution started"
        );

        loop {
            self.skip_poisoned(plan, ctx, &mut result).await;

            let stopped = ctx.stop.is_stopped();
            if !stopped {
                for step in ready_steps(plan) {
                    plan.set_status(step.id.as_str(), StepStatus::Ready);
                    let params = bind_parameters(&step, &outputs);
                    plan.set_status(step.id.as_str(), StepStatus::Running);
                    info!(
                        plan_id = %plan.id,
                        step_id = %step.id,
                        capability = %step.capability,
                        "step execution started"
                    );
                    if tracing::enabled!(tracing::Level::DEBUG) {
                        if let Ok(params) = &params {
                            debug!(
                                step_id = %step.id,
                                params = %truncate_json_for_log(params, MAX_LOG_JSON_CHARS),
                                "step parameters bound"
                            );
                        }
                    }
                    report_progress(
                        ctx,
                        ExecutionProgressEvent::new(
                            plan.id.clone(),
                            Some(step.id.clone()),
                            Some(step.capability.clone()),
                            "step_started",
                        ),
                    )
                    .await;
                    in_flight.push(self.execute_step(plan.id.clone(), step, params, ctx));
                }
            }

            if in_flight.is_empty() {
                break;
            }

            let run = tokio::select! {
                run = in_flight.next() => run,
                _ = ctx.stop.stopped(), if !stopped => continue,
                _ = sleep_until(deadline), if ctx.plan_timeout.is_some() && !stopped => {
                    warn!(plan_id = %plan.id, "plan timeout reached, stopping dispatch");
                    ctx.stop.stop(SkipReason::PlanTimeout);
                    continue;
                }
            };
            let Some(run) = run else {
                break;
            };
            self.record_run(plan, run, ctx, &mut outputs, &mut result)
                .await;
        }

        if ctx.stop.is_stopped() {
            let reason = ctx.stop.reason();
            let open: Vec<ExecutionStep> = plan
                .steps
                .iter()
                .filter(|s| !s.status.is_terminal())
                .cloned()
                .collect();
            for step in open {
                self.skip_step(plan, &step, reason.clone(), ctx, &mut result)
                    .await;
            }
        }

        let failed = result.failed().count();
        info!(
            plan_id = %plan.id,
            finished = result.len(),
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "plan execution finished"
        );
        report_progress(
            ctx,
            ExecutionProgressEvent::new(plan.id.clone(), None, None, "plan_finished").with_metadata(
                serde_json::json!({
                    "succeeded": result.succeeded().count(),
                    "failed": failed,
                    "skipped": result.skipped().count(),
                }),
            ),
        )
        .await;
        result
    }

    /// Skip every open step with a failed or skipped dependency, to a fixpoint
    async fn skip_poisoned(
        &self,
        plan: &mut ExecutionPlan,
        ctx: &ExecutorContext,
        result: &mut PlanResult,
    ) {
        loop {
            let poisoned = plan.steps.iter().find_map(|step| {
                if !matches!(
                    step.status,
                    StepStatus::Pending | StepStatus::Blocked | StepStatus::Ready
                ) {
                    return None;
                }
                step.depends_on
                    .iter()
                    .find(|dep| {
                        plan.status_of(dep.as_str())
                            .is_some_and(|s| s.poisons_dependents())
                    })
                    .map(|dep| (step.clone(), dep.clone()))
            });
            let Some((step, dependency)) = poisoned else {
                return;
            };
            self.skip_step(
                plan,
                &step,
                SkipReason::DependencyFailed { dependency },
                ctx,
                result,
            )
            .await;
        }
    }

    async fn skip_step(
        &self,
        plan: &mut ExecutionPlan,
        step: &ExecutionStep,
        reason: SkipReason,
        ctx: &ExecutorContext,
        result: &mut PlanResult,
    ) {
        plan.set_status(step.id.as_str(), StepStatus::Skipped);
        info!(
            plan_id = %plan.id,
            step_id = %step.id,
            capability = %step.capability,
            reason = ?reason,
            "step skipped"
        );
        report_progress(
            ctx,
            ExecutionProgressEvent::new(
                plan.id.clone(),
                Some(step.id.clone()),
                Some(step.capability.clone()),
                "step_skipped",
            )
            .with_metadata(serde_json::json!({ "reason": reason })),
        )
        .await;
        result.insert(StepResult::skipped(
            step.id.clone(),
            step.capability.clone(),
            reason,
        ));
    }

    async fn record_run(
        &self,
        plan: &mut ExecutionPlan,
        run: StepRun,
        ctx: &ExecutorContext,
        outputs: &mut HashMap<StepId, Value>,
        result: &mut PlanResult,
    ) {
        let (status, phase) = match &run.outcome {
            StepOutcome::Succeeded { data } => {
                outputs.insert(run.step_id.clone(), data.clone());
                info!(
                    plan_id = %plan.id,
                    step_id = %run.step_id,
                    capability = %run.capability,
                    attempts = run.attempts,
                    duration_ms = run.duration_ms,
                    "step execution succeeded"
                );
                (StepStatus::Succeeded, "step_succeeded")
            }
            StepOutcome::Failed { error: err } => {
                error!(
                    plan_id = %plan.id,
                    step_id = %run.step_id,
                    capability = %run.capability,
                    kind = err.kind(),
                    error = %err,
                    attempts = run.attempts,
                    "step execution failed"
                );
                (StepStatus::Failed, "step_failed")
            }
            StepOutcome::Skipped { reason } => {
                info!(
                    plan_id = %plan.id,
                    step_id = %run.step_id,
                    reason = ?reason,
                    "step skipped before dispatch"
                );
                (StepStatus::Skipped, "step_skipped")
            }
        };
        plan.set_status(run.step_id.as_str(), status);

        let mut event = ExecutionProgressEvent::new(
            plan.id.clone(),
            Some(run.step_id.clone()),
            Some(run.capability.clone()),
            phase,
        )
        .with_metadata(serde_json::json!({
            "attempts": run.attempts,
            "duration_ms": run.duration_ms,
        }));
        if let StepOutcome::Failed { error: err } = &run.outcome {
            event = event.with_message(err.to_string());
        }
        report_progress(ctx, event).await;

        result.insert(StepResult {
            step_id: run.step_id,
            capability: run.capability,
            outcome: run.outcome,
            duration_ms: run.duration_ms,
            attempts: run.attempts,
        });
    }

    async fn execute_step(
        &self,
        plan_id: PlanId,
        step: ExecutionStep,
        params: Result<Value, CapabilityError>,
        ctx: &ExecutorContext,
    ) -> StepRun {
        let started = Instant::now();
        let finish = |outcome: StepOutcome, attempts: u32| StepRun {
            step_id: step.id.clone(),
            capability: step.capability.clone(),
            outcome,
            attempts,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        let fail = |error: CapabilityError, attempts: u32| finish(StepOutcome::Failed { error }, attempts);

        let Some(descriptor) = self.registry.get(&step.capability) else {
            return fail(CapabilityError::unavailable(&step.capability), 0);
        };
        let params = match params {
            Ok(params) => params,
            Err(err) => return fail(err, 0),
        };
        if let Err(err) = descriptor.parameter_schema.validate(&params, &[]) {
            return fail(CapabilityError::validation(err.to_string()), 0);
        }
        if descriptor.requires_auth && !ctx.credentials.has(descriptor.credential_key()) {
            return fail(
                CapabilityError::auth(descriptor.credential_key(), "no credential available"),
                0,
            );
        }
        let Some(handler) = self.registry.handler(&step.capability) else {
            return fail(CapabilityError::unavailable(&step.capability), 0);
        };

        let attempt_timeout = self.timeout_for(&descriptor);
        let mut attempts: u32 = 0;
        let mut last_error: Option<CapabilityError> = None;

        loop {
            let permit = tokio::select! {
                biased;
                _ = ctx.stop.stopped() => {
                    return match last_error {
                        Some(err) => fail(err, attempts),
                        None => finish(StepOutcome::Skipped { reason: ctx.stop.reason() }, 0),
                    };
                }
                permit = self.outbound.clone().acquire_owned() => permit,
            };
            let Ok(permit) = permit else {
                return fail(CapabilityError::transient("outbound limiter closed"), attempts);
            };

            if !self.breaker.allow(&step.capability) {
                warn!(
                    plan_id = %plan_id,
                    step_id = %step.id,
                    capability = %step.capability,
                    "circuit open, short-circuiting step"
                );
                return fail(CapabilityError::unavailable(&step.capability), attempts);
            }

            attempts += 1;
            let exec_ctx = ExecutionContext {
                session_id: ctx.session_id.clone(),
                user_id: ctx.user_id.clone(),
                plan_id: plan_id.clone(),
                step_id: step.id.clone(),
                credentials: ctx.credentials.clone(),
                cancellation_token: ctx.stop.token().clone(),
            };
            let outcome = match timeout(attempt_timeout, handler.invoke(params.clone(), exec_ctx)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(CapabilityError::timeout(attempt_timeout)),
            };
            drop(permit);

            let err = match outcome {
                Ok(data) => {
                    self.breaker.record_success(&step.capability);
                    return finish(StepOutcome::Succeeded { data }, attempts);
                }
                Err(err) => err,
            };
            if err.trips_breaker() {
                self.breaker.record_failure(&step.capability);
            } else {
                self.breaker.record_success(&step.capability);
            }
            if !err.is_retryable() || attempts > self.max_retry_attempts {
                return fail(err, attempts);
            }

            let delay = self.retry_delay(&err, attempts - 1);
            warn!(
                plan_id = %plan_id,
                step_id = %step.id,
                capability = %step.capability,
                error = %err,
                retry_attempt = attempts,
                retry_in_ms = delay.as_millis() as u64,
                "retrying step after transient error"
            );
            report_progress(
                ctx,
                ExecutionProgressEvent::new(
                    plan_id.clone(),
                    Some(step.id.clone()),
                    Some(step.capability.clone()),
                    "step_retrying",
                )
                .with_message(err.to_string())
                .with_metadata(serde_json::json!({
                    "retry_attempt": attempts,
                    "retry_in_ms": delay.as_millis() as u64,
                    "max_retry_attempts": self.max_retry_attempts,
                })),
            )
            .await;
            last_error = Some(err);

            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = ctx.stop.stopped() => {
                        if let Some(err) = last_error {
                            return fail(err, attempts);
                        }
                    }
                    _ = sleep(delay) => {}
                }
            }
        }
    }

    /// A handler's retry hint wins over backoff but never exceeds the cap
    fn retry_delay(&self, err: &CapabilityError, retries_used: u32) -> Duration {
        match err.retry_after() {
            Some(hinted) => hinted.min(self.retry_max_delay),
            None => self.compute_retry_backoff(retries_used),
        }
    }

    fn compute_retry_backoff(&self, retries_used: u32) -> Duration {
        let base_ms = self.retry_base_delay.as_millis();
        if base_ms == 0 {
            return Duration::from_millis(0);
        }
        let max_ms = self.retry_max_delay.as_millis().max(base_ms);
        let shift = retries_used.min(20);
        let multiplier = 1u128 << shift;
        let backoff_ms = base_ms.saturating_mul(multiplier).min(max_ms);
        let millis = u64::try_from(backoff_ms).unwrap_or(u64::MAX);
        Duration::from_millis(millis)
    }
}

/// Pending steps whose dependencies all succeeded, in plan order
fn ready_steps(plan: &ExecutionPlan) -> Vec<ExecutionStep> {
    plan.steps
        .iter()
        .filter(|step| step.status == StepStatus::Pending)
        .filter(|step| {
            step.depends_on
                .iter()
                .all(|dep| plan.status_of(dep.as_str()) == Some(StepStatus::Succeeded))
        })
        .cloned()
        .collect()
}

/// Fill bound parameters from upstream result data
fn bind_parameters(
    step: &ExecutionStep,
    outputs: &HashMap<StepId, Value>,
) -> Result<Value, CapabilityError> {
    let mut params = match &step.parameters {
        Value::Object(map) => map.clone(),
        Value::Null => serde_json::Map::new(),
        _ => return Err(CapabilityError::validation("parameters must be an object")),
    };
    for binding in &step.bindings {
        let value = outputs
            .get(&binding.from_step)
            .and_then(|data| data.get(&binding.output_key))
            .cloned()
            .ok_or_else(|| {
                CapabilityError::validation(format!(
                    "step {} returned no '{}' for parameter '{}'",
                    binding.from_step, binding.output_key, binding.param
                ))
            })?;
        params.insert(binding.param.clone(), value);
    }
    Ok(Value::Object(params))
}

async fn report_progress(ctx: &ExecutorContext, event: ExecutionProgressEvent) {
    if let Some(reporter) = &ctx.progress_reporter {
        if let Err(err) = reporter.report(event).await {
            warn!("failed to report execution progress: {}", err);
        }
    }
}
