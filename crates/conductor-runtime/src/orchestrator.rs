//! Orchestrator - utterance → resolve → plan → gate → execute → reply
//!
//! Owns the caller-facing surface (submit / respond / cancel). Plans of one
//! session go through that session's lane one at a time; pending plans are
//! parked in the session store between the proposal and the decision, so no
//! task is held while a user makes up their mind.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use conductor_core::capability::{CapabilityRegistry, CredentialSet};
use conductor_core::executor::{
    ExecutionEngine, ExecutionProgressReporter, ExecutorContext, StopSignal,
};
use conductor_core::planner::{confirm_plan, terminate_plan, PlanBuilder, PlanError};
use conductor_core::resolver::IntentResolver;
use conductor_core::store::{ContextSource, SessionStore, StoreError};
use conductor_core::synthesizer::{
    ReplyStatus, Synthesis, SynthesisRequest, Synthesizer, TemplateSynthesizer,
};
use conductor_core::types::{
    ConversationEntry, ConversationSnippet, Decision, ExecutionPlan, PendingPlan, PlanId,
    PlanResult, PlanState, Proposal, SessionId, SkipReason,
};

use crate::concurrency::{ConcurrencyDecision, ConcurrencyPolicy, LaneState, SessionPolicy};

/// Orchestrator errors
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("plan not found or already decided: {0}")]
    PlanNotFound(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("plan error: {0}")]
    Plan(#[from] PlanError),
}

/// A new utterance for a session
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub session_id: SessionId,
    pub user_id: Option<String>,
    pub utterance: String,
    pub credentials: CredentialSet,
}

impl SubmitRequest {
    pub fn new(session_id: impl Into<SessionId>, utterance: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: None,
            utterance: utterance.into(),
            credentials: CredentialSet::new(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_credentials(mut self, credentials: CredentialSet) -> Self {
        self.credentials = credentials;
        self
    }
}

/// A decision on a pending proposal
#[derive(Debug, Clone)]
pub struct RespondRequest {
    pub plan_id: PlanId,
    pub decision: Decision,
    pub user_id: Option<String>,
    pub credentials: CredentialSet,
}

impl RespondRequest {
    pub fn new(plan_id: impl Into<PlanId>, decision: Decision) -> Self {
        Self {
            plan_id: plan_id.into(),
            decision,
            user_id: None,
            credentials: CredentialSet::new(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_credentials(mut self, credentials: CredentialSet) -> Self {
        self.credentials = credentials;
        self
    }
}

/// What the caller gets back: a reply, plus a proposal when the plan waits
/// for confirmation.
#[derive(Debug, Clone)]
pub struct Reply {
    pub session_id: SessionId,
    pub plan_id: Option<PlanId>,
    pub plan_state: Option<PlanState>,
    pub message: String,
    pub status: ReplyStatus,
    pub ran: Vec<String>,
    pub still_pending: Vec<String>,
    pub metadata: Value,
    pub proposal: Option<Proposal>,
    pub result: PlanResult,
    /// Earlier plans of this session closed while admitting this request
    pub displaced: Vec<Reply>,
}

impl Reply {
    fn new(
        session_id: &str,
        plan: Option<&ExecutionPlan>,
        synthesis: Synthesis,
        proposal: Option<Proposal>,
        result: PlanResult,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            plan_id: plan.map(|p| p.id.clone()),
            plan_state: plan.map(|p| p.state),
            message: synthesis.message,
            status: synthesis.status,
            ran: synthesis.ran,
            still_pending: synthesis.still_pending,
            metadata: synthesis.metadata,
            proposal,
            result,
            displaced: Vec::new(),
        }
    }

    pub fn needs_confirmation(&self) -> bool {
        self.proposal.is_some()
    }
}

/// Result of a cancel request
#[derive(Debug)]
pub enum CancelOutcome {
    /// The plan was running; it stops dispatching and its own reply reports the cancellation
    Signalled,
    /// The plan was awaiting confirmation and has been closed
    Cancelled(Reply),
}

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub session_policy: SessionPolicy,
    /// Deadline for one execution phase of a plan
    pub plan_timeout: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            session_policy: SessionPolicy::Supersede,
            plan_timeout: Some(Duration::from_secs(120)),
        }
    }
}

/// One admitted request of a session
#[derive(Debug, Clone)]
struct LaneClaim {
    ticket: u64,
    /// Set while the request's plan is executing steps
    plan_id: Option<PlanId>,
    stop: StopSignal,
}

#[derive(Default)]
struct SessionLane {
    /// Held for the whole pipeline of one plan phase
    gate: Mutex<()>,
    /// Admitted requests, oldest first; only the gate holder has a plan attached
    claims: StdMutex<Vec<LaneClaim>>,
    next_ticket: AtomicU64,
    /// Woken whenever a pending plan of the session is decided or expires
    settled: Notify,
}

impl SessionLane {
    fn with_claims<R>(&self, f: impl FnOnce(&mut Vec<LaneClaim>) -> R) -> R {
        let mut claims = self
            .claims
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut claims)
    }

    fn is_claimed(&self) -> bool {
        self.with_claims(|claims| !claims.is_empty())
    }

    fn claim(&self, stop: StopSignal) -> u64 {
        let ticket = self.next_ticket.fetch_add(1, AtomicOrdering::Relaxed);
        self.with_claims(|claims| {
            claims.push(LaneClaim {
                ticket,
                plan_id: None,
                stop,
            })
        });
        ticket
    }

    /// Stop every earlier request, then claim the lane; returns the stopped claims
    fn claim_superseding(&self, stop: StopSignal) -> (u64, Vec<LaneClaim>) {
        let ticket = self.next_ticket.fetch_add(1, AtomicOrdering::Relaxed);
        let earlier = self.with_claims(|claims| {
            let earlier = claims.clone();
            for claim in &earlier {
                claim.stop.stop(SkipReason::Superseded);
            }
            claims.push(LaneClaim {
                ticket,
                plan_id: None,
                stop,
            });
            earlier
        });
        (ticket, earlier)
    }

    fn set_plan(&self, ticket: u64, plan_id: Option<PlanId>) {
        self.with_claims(|claims| {
            if let Some(claim) = claims.iter_mut().find(|c| c.ticket == ticket) {
                claim.plan_id = plan_id;
            }
        });
    }

    fn release(&self, ticket: u64) {
        self.with_claims(|claims| claims.retain(|c| c.ticket != ticket));
    }

    fn running_plan(&self) -> Option<PlanId> {
        self.with_claims(|claims| claims.iter().find_map(|c| c.plan_id.clone()))
    }

    /// Signal the claim executing `plan_id`; false when it is not executing
    fn stop_plan(&self, plan_id: &str, reason: SkipReason) -> bool {
        self.with_claims(|claims| {
            match claims
                .iter()
                .find(|c| c.plan_id.as_deref() == Some(plan_id))
            {
                Some(claim) => {
                    claim.stop.stop(reason);
                    true
                }
                None => false,
            }
        })
    }
}

/// A request let into its session lane
struct Admission<'a> {
    guard: MutexGuard<'a, ()>,
    ticket: u64,
    stop: StopSignal,
    displaced: Vec<Reply>,
}

/// Orchestrator - wires resolver, plan builder, engine and synthesizer
pub struct Orchestrator {
    registry: Arc<CapabilityRegistry>,
    resolver: IntentResolver,
    builder: PlanBuilder,
    engine: ExecutionEngine,
    store: Arc<dyn SessionStore>,
    context_source: Option<Arc<dyn ContextSource>>,
    synthesizer: Arc<dyn Synthesizer>,
    templates: TemplateSynthesizer,
    progress_reporter: Option<Arc<dyn ExecutionProgressReporter>>,
    policy: Box<dyn ConcurrencyPolicy>,
    config: OrchestratorConfig,
    lanes: StdMutex<HashMap<SessionId, Arc<SessionLane>>>,
    /// Plans that are running or awaiting confirmation
    plans: StdMutex<HashMap<PlanId, SessionId>>,
}

impl Orchestrator {
    /// Create a new orchestrator
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        resolver: IntentResolver,
        builder: PlanBuilder,
        engine: ExecutionEngine,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let config = OrchestratorConfig::default();
        Self {
            synthesizer: Arc::new(TemplateSynthesizer::new(registry.clone())),
            templates: TemplateSynthesizer::new(registry.clone()),
            registry,
            resolver,
            builder,
            engine,
            store,
            context_source: None,
            progress_reporter: None,
            policy: config.session_policy.policy(),
            config,
            lanes: StdMutex::new(HashMap::new()),
            plans: StdMutex::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.policy = config.session_policy.policy();
        self.config = config;
        self
    }

    /// Attach a context source used when an utterance refers back to earlier turns
    pub fn with_context_source(mut self, source: Arc<dyn ContextSource>) -> Self {
        self.context_source = Some(source);
        self
    }

    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn Synthesizer>) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    pub fn with_progress_reporter(mut self, reporter: Arc<dyn ExecutionProgressReporter>) -> Self {
        self.progress_reporter = Some(reporter);
        self
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn resolver(&self) -> &IntentResolver {
        &self.resolver
    }

    pub fn builder(&self) -> &PlanBuilder {
        &self.builder
    }

    /// Plan currently executing steps for a session
    pub fn active_plan(&self, session_id: &str) -> Option<PlanId> {
        self.existing_lane(session_id)
            .and_then(|lane| lane.running_plan())
    }

    /// Handle a new utterance end-to-end
    pub async fn submit(&self, request: SubmitRequest) -> Result<Reply, OrchestratorError> {
        let session_id = request.session_id.clone();
        let lane = self.lane(&session_id);
        let Admission {
            guard: _guard,
            ticket,
            stop,
            displaced,
        } = self.admit(&lane, &session_id).await?;
        info!(
            session_id = %session_id,
            displaced = displaced.len(),
            "request admitted"
        );

        let processed = self.process(&lane, ticket, stop, request).await;
        lane.release(ticket);
        let mut reply = processed?;
        self.store
            .append_entry(&session_id, ConversationEntry::assistant(&reply.message))
            .await?;
        reply.displaced = displaced;
        Ok(reply)
    }

    /// Decide a pending proposal
    pub async fn respond(
        &self,
        plan_id: &str,
        decision: Decision,
    ) -> Result<Reply, OrchestratorError> {
        self.respond_with(RespondRequest::new(plan_id, decision))
            .await
    }

    /// Decide a pending proposal, forwarding the caller's credentials to the gated steps
    pub async fn respond_with(&self, request: RespondRequest) -> Result<Reply, OrchestratorError> {
        let RespondRequest {
            plan_id,
            decision,
            user_id,
            credentials,
        } = request;
        let session_id = self
            .session_of(&plan_id)
            .ok_or_else(|| OrchestratorError::PlanNotFound(plan_id.clone()))?;
        let lane = self.lane(&session_id);
        let _guard = lane.gate.lock().await;

        let Some(pending) = self.store.take_pending_plan(&session_id, &plan_id).await? else {
            self.forget_plan(&plan_id);
            return Err(OrchestratorError::PlanNotFound(plan_id));
        };

        if pending.proposal.is_expired() {
            info!(plan_id = %plan_id, "decision arrived after the confirmation window");
            return self
                .close_pending(&session_id, pending, PlanState::Expired, SkipReason::Expired)
                .await;
        }

        info!(plan_id = %plan_id, ?decision, "proposal decided");
        match decision {
            Decision::Cancel => {
                self.close_pending(&session_id, pending, PlanState::Cancelled, SkipReason::Cancelled)
                    .await
            }
            Decision::Confirm => {
                self.run_confirmed(&lane, &session_id, pending, user_id, credentials)
                    .await
            }
        }
    }

    /// Cancel a running or pending plan
    pub async fn cancel(&self, plan_id: &str) -> Result<CancelOutcome, OrchestratorError> {
        let session_id = self
            .session_of(plan_id)
            .ok_or_else(|| OrchestratorError::PlanNotFound(plan_id.to_string()))?;
        if self.lane(&session_id).stop_plan(plan_id, SkipReason::Cancelled) {
            info!(plan_id = %plan_id, "cancelling running plan");
            return Ok(CancelOutcome::Signalled);
        }
        let reply = self
            .respond_with(RespondRequest::new(plan_id, Decision::Cancel))
            .await?;
        Ok(CancelOutcome::Cancelled(reply))
    }

    /// Close every pending proposal whose window has passed
    pub async fn expire_due(&self) -> Result<Vec<Reply>, OrchestratorError> {
        let tracked: Vec<(PlanId, SessionId)> = self
            .plans
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(plan, session)| (plan.clone(), session.clone()))
            .collect();

        let mut replies = Vec::new();
        for (plan_id, session_id) in tracked {
            let lane = self.lane(&session_id);
            // A busy lane is revisited on the next sweep.
            let Ok(_guard) = lane.gate.try_lock() else {
                continue;
            };
            match self.pending_plan(&session_id).await? {
                Some(pending) if pending.plan.id == plan_id => {
                    if !pending.proposal.is_expired() {
                        continue;
                    }
                    if let Some(pending) =
                        self.store.take_pending_plan(&session_id, &plan_id).await?
                    {
                        info!(plan_id = %plan_id, session_id = %session_id, "proposal expired");
                        replies.push(
                            self.close_pending(
                                &session_id,
                                pending,
                                PlanState::Expired,
                                SkipReason::Expired,
                            )
                            .await?,
                        );
                    }
                }
                _ => {
                    debug!(plan_id = %plan_id, "dropping stale plan entry");
                    self.forget_plan(&plan_id);
                }
            }
        }

        self.prune_lanes();
        Ok(replies)
    }

    /// Run `expire_due` periodically until `shutdown` fires
    pub fn spawn_expiry_sweeper(
        self: &Arc<Self>,
        every: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        match orchestrator.expire_due().await {
                            Ok(expired) if !expired.is_empty() => {
                                info!(count = expired.len(), "expired pending proposals");
                            }
                            Ok(_) => {}
                            Err(err) => warn!(error = %err, "proposal expiry sweep failed"),
                        }
                    }
                }
            }
        })
    }

    async fn admit<'a>(
        &self,
        lane: &'a SessionLane,
        session_id: &str,
    ) -> Result<Admission<'a>, OrchestratorError> {
        loop {
            let state = LaneState {
                is_running: lane.is_claimed(),
                has_pending: self.pending_plan(session_id).await?.is_some(),
            };
            match self.policy.decide(&state) {
                ConcurrencyDecision::Start => {
                    let guard = lane.gate.lock().await;
                    // Another request may have parked a plan while we waited.
                    if self.pending_plan(session_id).await?.is_none() {
                        let stop = StopSignal::new();
                        let ticket = lane.claim(stop.clone());
                        return Ok(Admission {
                            guard,
                            ticket,
                            stop,
                            displaced: Vec::new(),
                        });
                    }
                }
                ConcurrencyDecision::SupersedeAndStart => {
                    // Claim before waiting for the gate so a still-resolving
                    // predecessor is stopped too, and a later request can stop us.
                    let stop = StopSignal::new();
                    let (ticket, earlier) = lane.claim_superseding(stop.clone());
                    for claim in &earlier {
                        info!(
                            session_id = %session_id,
                            plan_id = ?claim.plan_id,
                            "superseding earlier request"
                        );
                    }
                    let guard = lane.gate.lock().await;
                    let displaced = match self.close_superseded(session_id).await {
                        Ok(displaced) => displaced,
                        Err(err) => {
                            lane.release(ticket);
                            return Err(err);
                        }
                    };
                    return Ok(Admission {
                        guard,
                        ticket,
                        stop,
                        displaced,
                    });
                }
                ConcurrencyDecision::WaitForIdle => {
                    let settled = lane.settled.notified();
                    let guard = lane.gate.lock().await;
                    let displaced = match self.pending_plan(session_id).await? {
                        None => Vec::new(),
                        Some(pending) if pending.proposal.is_expired() => {
                            let mut displaced = Vec::new();
                            if let Some(pending) = self
                                .store
                                .take_pending_plan(session_id, &pending.plan.id)
                                .await?
                            {
                                displaced.push(
                                    self.close_pending(
                                        session_id,
                                        pending,
                                        PlanState::Expired,
                                        SkipReason::Expired,
                                    )
                                    .await?,
                                );
                            }
                            displaced
                        }
                        Some(pending) => {
                            drop(guard);
                            let wait = (pending.proposal.expires_at - Utc::now())
                                .to_std()
                                .unwrap_or(Duration::ZERO);
                            debug!(
                                session_id = %session_id,
                                plan_id = %pending.plan.id,
                                wait_ms = wait.as_millis() as u64,
                                "queued behind pending proposal"
                            );
                            let _ = tokio::time::timeout(wait, settled).await;
                            continue;
                        }
                    };
                    let stop = StopSignal::new();
                    let ticket = lane.claim(stop.clone());
                    return Ok(Admission {
                        guard,
                        ticket,
                        stop,
                        displaced,
                    });
                }
            }
        }
    }

    /// Cancel the session's parked plan on behalf of a newer request
    async fn close_superseded(&self, session_id: &str) -> Result<Vec<Reply>, OrchestratorError> {
        let Some(pending) = self.store.clear_pending_plan(session_id).await? else {
            return Ok(Vec::new());
        };
        info!(
            session_id = %session_id,
            plan_id = %pending.plan.id,
            "superseding pending plan"
        );
        let reply = self
            .close_pending(
                session_id,
                pending,
                PlanState::Cancelled,
                SkipReason::Superseded,
            )
            .await?;
        Ok(vec![reply])
    }

    async fn process(
        &self,
        lane: &SessionLane,
        ticket: u64,
        stop: StopSignal,
        request: SubmitRequest,
    ) -> Result<Reply, OrchestratorError> {
        let SubmitRequest {
            session_id,
            user_id,
            utterance,
            credentials,
        } = request;

        let context = self.gather_context(&session_id, &utterance).await;
        self.store
            .append_entry(&session_id, ConversationEntry::user(&utterance))
            .await?;

        let resolved = self.resolver.resolve(&utterance, &context).await;
        if resolved.clarification_needed {
            return Ok(Reply::new(
                &session_id,
                None,
                self.templates.clarification(&utterance),
                None,
                PlanResult::new(),
            ));
        }

        let outcome = match self.builder.build(&resolved, Some(&session_id)) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "plan rejected");
                return Ok(Reply::new(
                    &session_id,
                    None,
                    self.templates.rejected(&utterance, &err),
                    None,
                    PlanResult::new(),
                ));
            }
        };
        let (mut plan, proposal) = outcome.into_parts();
        transition(&mut plan, PlanState::AutoStepsRunning)?;

        if stop.is_stopped() {
            debug!(session_id = %session_id, plan_id = %plan.id, "superseded before dispatch");
        }
        let ctx = self.executor_context(&session_id, user_id, credentials, stop);
        self.track_plan(&plan.id, &session_id);
        lane.set_plan(ticket, Some(plan.id.clone()));
        let results = self.engine.run(&mut plan, &ctx).await;
        lane.set_plan(ticket, None);

        match proposal {
            Some(proposal) if !plan.open_gated_steps().is_empty() => {
                let proposal = self.builder.refresh_proposal(&plan, &proposal, &results);
                transition(&mut plan, PlanState::AwaitingConfirmation)?;
                let reply = self
                    .reply_for(
                        &session_id,
                        &utterance,
                        plan.clone(),
                        results.clone(),
                        Some(proposal.clone()),
                    )
                    .await;
                info!(
                    session_id = %session_id,
                    plan_id = %plan.id,
                    gated = proposal.items.len(),
                    "plan awaiting confirmation"
                );
                let pending = PendingPlan {
                    plan,
                    proposal,
                    results,
                    utterance,
                };
                if let Some(displaced) = self.store.save_pending_plan(&session_id, pending).await? {
                    warn!(plan_id = %displaced.plan.id, "pending plan overwritten");
                    self.forget_plan(&displaced.plan.id);
                }
                Ok(reply)
            }
            _ => {
                self.forget_plan(&plan.id);
                transition(&mut plan, PlanState::Completed)?;
                info!(
                    session_id = %session_id,
                    plan_id = %plan.id,
                    steps = plan.steps.len(),
                    "plan completed"
                );
                Ok(self
                    .reply_for(&session_id, &utterance, plan, results, None)
                    .await)
            }
        }
    }

    async fn run_confirmed(
        &self,
        lane: &SessionLane,
        session_id: &str,
        pending: PendingPlan,
        user_id: Option<String>,
        credentials: CredentialSet,
    ) -> Result<Reply, OrchestratorError> {
        let PendingPlan {
            mut plan,
            mut results,
            utterance,
            ..
        } = pending;
        confirm_plan(&mut plan)?;

        let stop = StopSignal::new();
        let ctx = self.executor_context(session_id, user_id, credentials, stop.clone());
        let ticket = lane.claim(stop);
        lane.set_plan(ticket, Some(plan.id.clone()));
        let confirmed = self.engine.run_with(&mut plan, &results, &ctx).await;
        lane.release(ticket);
        results.merge(confirmed);

        transition(&mut plan, PlanState::Completed)?;
        self.forget_plan(&plan.id);
        info!(session_id = %session_id, plan_id = %plan.id, "confirmed plan completed");

        let reply = self
            .reply_for(session_id, &utterance, plan, results, None)
            .await;
        self.store
            .append_entry(session_id, ConversationEntry::assistant(&reply.message))
            .await?;
        lane.settled.notify_waiters();
        Ok(reply)
    }

    /// Terminate a parked plan and record the outcome in the conversation
    async fn close_pending(
        &self,
        session_id: &str,
        pending: PendingPlan,
        state: PlanState,
        reason: SkipReason,
    ) -> Result<Reply, OrchestratorError> {
        let PendingPlan {
            mut plan,
            mut results,
            utterance,
            ..
        } = pending;
        self.forget_plan(&plan.id);
        let skipped = terminate_plan(&mut plan, state, reason)?;
        debug!(plan_id = %plan.id, skipped = skipped.len(), ?state, "pending plan closed");
        results.merge(skipped);

        let reply = self
            .reply_for(session_id, &utterance, plan, results, None)
            .await;
        self.store
            .append_entry(session_id, ConversationEntry::assistant(&reply.message))
            .await?;
        self.lane(session_id).settled.notify_waiters();
        Ok(reply)
    }

    async fn reply_for(
        &self,
        session_id: &str,
        utterance: &str,
        plan: ExecutionPlan,
        results: PlanResult,
        proposal: Option<Proposal>,
    ) -> Reply {
        let mut request = SynthesisRequest::new(utterance, plan, results);
        if let Some(proposal) = &proposal {
            request = request.with_proposal(proposal.clone());
        }
        let synthesis = match self.synthesizer.synthesize(request.clone()).await {
            Ok(synthesis) => synthesis,
            Err(err) => {
                warn!(error = %err, "synthesizer failed, using template reply");
                self.templates.compose(&request)
            }
        };
        let SynthesisRequest { plan, result, .. } = request;
        Reply::new(session_id, Some(&plan), synthesis, proposal, result)
    }

    async fn gather_context(&self, session_id: &str, utterance: &str) -> Vec<ConversationSnippet> {
        let Some(source) = &self.context_source else {
            return Vec::new();
        };
        let Some(hint) = self.resolver.detect_ambiguity(utterance) else {
            return Vec::new();
        };
        match source.fetch_recent_context(session_id, &hint).await {
            Ok(snippets) => {
                debug!(
                    session_id = %session_id,
                    references = ?hint.references,
                    snippets = snippets.len(),
                    "context gathered"
                );
                snippets
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "context unavailable, resolving without it");
                Vec::new()
            }
        }
    }

    fn executor_context(
        &self,
        session_id: &str,
        user_id: Option<String>,
        credentials: CredentialSet,
        stop: StopSignal,
    ) -> ExecutorContext {
        let mut ctx = ExecutorContext::new(session_id)
            .with_user(user_id)
            .with_credentials(credentials)
            .with_stop_signal(stop);
        if let Some(timeout) = self.config.plan_timeout {
            ctx = ctx.with_plan_timeout(timeout);
        }
        if let Some(reporter) = &self.progress_reporter {
            ctx = ctx.with_progress_reporter(reporter.clone());
        }
        ctx
    }

    async fn pending_plan(&self, session_id: &str) -> Result<Option<PendingPlan>, StoreError> {
        Ok(self
            .store
            .get(session_id)
            .await?
            .and_then(|session| session.pending_plan))
    }

    fn lane(&self, session_id: &str) -> Arc<SessionLane> {
        self.lanes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    fn existing_lane(&self, session_id: &str) -> Option<Arc<SessionLane>> {
        self.lanes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(session_id)
            .cloned()
    }

    /// Drop lanes nobody is using; they carry no state worth keeping
    fn prune_lanes(&self) {
        self.lanes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|_, lane| {
                Arc::strong_count(lane) > 1 || lane.gate.try_lock().is_err() || lane.is_claimed()
            });
    }

    fn session_of(&self, plan_id: &str) -> Option<SessionId> {
        self.plans
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(plan_id)
            .cloned()
    }

    fn track_plan(&self, plan_id: &str, session_id: &str) {
        self.plans
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(plan_id.to_string(), session_id.to_string());
    }

    fn forget_plan(&self, plan_id: &str) {
        self.plans
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(plan_id);
    }
}

fn transition(plan: &mut ExecutionPlan, next: PlanState) -> Result<(), PlanError> {
    plan.transition(next)
        .map_err(|(from, to)| PlanError::InvalidTransition { from, to })
}
