//! Confirmation gate
//!
//! Proposal text is derived mechanically from capability labels and step
//! parameters, never from free-form result data.

use serde_json::Value;

use crate::capability::{CapabilityDescriptor, CapabilityRegistry};
use crate::types::{
    ExecutionPlan, ExecutionStep, ParamBinding, PlanResult, PlanState, SkipReason, StepOutcome,
    StepResult, StepStatus,
};

use super::PlanError;

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{}\"", s),
        other => other.to_string(),
    }
}

/// What a bound parameter refers to, before or after the lookup ran
fn describe_binding(
    registry: &CapabilityRegistry,
    plan: &ExecutionPlan,
    binding: &ParamBinding,
    results: Option<&PlanResult>,
) -> String {
    let Some(source) = plan.get_step(binding.from_step.as_str()) else {
        return format!("the {} from step {}", binding.output_key, binding.from_step);
    };
    let lookup = registry
        .get(&source.capability)
        .and_then(|d| d.identity_provider.clone());
    let what = lookup
        .as_ref()
        .map(|p| p.kind.as_str().to_string())
        .unwrap_or_else(|| binding.output_key.clone());
    let input = lookup
        .as_ref()
        .and_then(|p| source.parameter(&p.input_param))
        .map(render_value);

    let outcome = results.and_then(|r| r.get(&binding.from_step));
    match (outcome.map(|r| &r.outcome), input) {
        (Some(StepOutcome::Succeeded { data }), Some(input)) => {
            match data.get(&binding.output_key) {
                Some(found) => format!(
                    "{} (found for {} via {})",
                    render_value(found),
                    input,
                    source.capability
                ),
                None => format!("no {} found for {} via {}", what, input, source.capability),
            }
        }
        (Some(StepOutcome::Succeeded { data }), None) => match data.get(&binding.output_key) {
            Some(found) => render_value(found),
            None => format!("no {} returned by {}", what, source.capability),
        },
        (Some(StepOutcome::Failed { .. }), Some(input)) => format!(
            "no {} found for {} ({} failed)",
            what, input, source.capability
        ),
        (Some(StepOutcome::Failed { .. }), None) => {
            format!("no {} ({} failed)", what, source.capability)
        }
        (Some(StepOutcome::Skipped { .. }), _) => {
            format!("no {} ({} did not run)", what, source.capability)
        }
        (None, Some(input)) => format!(
            "the {} found for {} via {}",
            what, input, source.capability
        ),
        (None, None) => format!("the {} from {}", what, source.capability),
    }
}

/// One-line human description of a step
pub fn describe_step(
    registry: &CapabilityRegistry,
    plan: &ExecutionPlan,
    step: &ExecutionStep,
    results: Option<&PlanResult>,
) -> String {
    let descriptor = registry.get(&step.capability);
    let label = descriptor
        .as_ref()
        .map(|d| d.label.clone())
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| step.capability.replace('_', " "));

    let mut parts: Vec<String> = Vec::new();
    let names = parameter_order(descriptor.as_deref(), step);
    for name in names {
        if let Some(binding) = step.binding_for(&name) {
            parts.push(format!(
                "{}: {}",
                name,
                describe_binding(registry, plan, binding, results)
            ));
        } else if let Some(value) = step.parameter(&name).filter(|v| !v.is_null()) {
            parts.push(format!("{}: {}", name, render_value(value)));
        }
    }

    if parts.is_empty() {
        label
    } else {
        format!("{} ({})", label, parts.join("; "))
    }
}

/// Schema order first, then anything else the step carries
fn parameter_order(descriptor: Option<&CapabilityDescriptor>, step: &ExecutionStep) -> Vec<String> {
    let mut names: Vec<String> = descriptor
        .map(|d| {
            d.parameter_schema
                .params
                .iter()
                .map(|p| p.name.clone())
                .collect()
        })
        .unwrap_or_default();
    if let Some(map) = step.parameters.as_object() {
        for key in map.keys() {
            if !names.contains(key) {
                names.push(key.clone());
            }
        }
    }
    for binding in &step.bindings {
        if !names.contains(&binding.param) {
            names.push(binding.param.clone());
        }
    }
    names
}

/// Release held steps after a confirm decision
pub fn confirm_plan(plan: &mut ExecutionPlan) -> Result<(), PlanError> {
    plan.transition(PlanState::Confirmed)
        .map_err(|(from, to)| PlanError::InvalidTransition { from, to })?;
    let blocked: Vec<_> = plan.blocked_steps().iter().map(|s| s.id.clone()).collect();
    for id in blocked {
        plan.set_status(id.as_str(), StepStatus::Pending);
    }
    Ok(())
}

/// Terminate an awaiting plan: every unfinished step becomes `Skipped`
pub fn terminate_plan(
    plan: &mut ExecutionPlan,
    state: PlanState,
    reason: SkipReason,
) -> Result<PlanResult, PlanError> {
    plan.transition(state)
        .map_err(|(from, to)| PlanError::InvalidTransition { from, to })?;
    let mut result = PlanResult::new();
    let open: Vec<(crate::types::StepId, String)> = plan
        .steps
        .iter()
        .filter(|s| !s.status.is_terminal())
        .map(|s| (s.id.clone(), s.capability.clone()))
        .collect();
    for (id, capability) in open {
        plan.set_status(id.as_str(), StepStatus::Skipped);
        result.insert(StepResult::skipped(id, capability, reason.clone()));
    }
    plan.transition(PlanState::Completed)
        .map_err(|(from, to)| PlanError::InvalidTransition { from, to })?;
    Ok(result)
}
