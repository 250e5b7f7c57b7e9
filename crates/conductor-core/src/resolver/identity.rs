//! Identity dependency rule
//!
//! Any invocation consuming a person-identity parameter whose value is not
//! already canonical depends on an identity-resolution invocation, and the
//! parameter is bound to that invocation's output. Applied to every
//! classification regardless of which classifier produced it.

use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::capability::CapabilityRegistry;
use crate::types::{DependencyEdge, Invocation, ParamBinding, StepId};

/// Insert lookup invocations, then renumber everything `s1..sN` in order
pub(crate) fn apply_identity_rule(
    registry: &CapabilityRegistry,
    invocations: Vec<Invocation>,
    edges: Vec<DependencyEdge>,
) -> (Vec<Invocation>, Vec<DependencyEdge>) {
    let mut ordered: Vec<Invocation> = Vec::with_capacity(invocations.len());
    let mut edges = edges;
    // (provider, lowercased name) -> lookup invocation id
    let mut lookups: HashMap<(String, String), StepId> = HashMap::new();
    // Lookup ids must not collide with the classifier's own ids before renumbering.
    let mut taken: HashSet<StepId> = invocations.iter().map(|inv| inv.id.clone()).collect();

    for mut invocation in invocations {
        let Some(descriptor) = registry.get(&invocation.capability) else {
            ordered.push(invocation);
            continue;
        };

        for (spec, kind) in descriptor.parameter_schema.identity_params() {
            if invocation.bindings.iter().any(|b| b.param == spec.name) {
                continue;
            }
            let Some(name) = invocation
                .raw_parameters
                .get(&spec.name)
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
            else {
                continue;
            };
            if kind.is_canonical(&name) {
                continue;
            }
            let Some(provider) = registry.identity_provider_for(kind) else {
                continue;
            };
            if provider.name == invocation.capability {
                continue;
            }
            let Some(lookup) = provider.identity_provider.as_ref() else {
                continue;
            };

            let key = (provider.name.clone(), name.to_lowercase());
            let lookup_id = match lookups.get(&key) {
                Some(id) => id.clone(),
                None => {
                    let id = fresh_lookup_id(&mut taken);
                    let mut params = serde_json::Map::new();
                    params.insert(lookup.input_param.clone(), Value::String(name.clone()));
                    ordered.push(Invocation::new(
                        id.clone(),
                        provider.name.clone(),
                        Value::Object(params),
                    ));
                    lookups.insert(key, id.clone());
                    id
                }
            };

            if let Some(map) = invocation.raw_parameters.as_object_mut() {
                map.remove(&spec.name);
            }
            invocation.bindings.push(ParamBinding::new(
                spec.name.clone(),
                lookup_id.clone(),
                lookup.output_key.clone(),
            ));
            edges.push(DependencyEdge::new(lookup_id, invocation.id.clone()));
        }
        ordered.push(invocation);
    }

    renumber(ordered, edges)
}

fn fresh_lookup_id(taken: &mut HashSet<StepId>) -> StepId {
    let mut n = 1;
    loop {
        let id = StepId::new(format!("identity-{}", n));
        if taken.insert(id.clone()) {
            return id;
        }
        n += 1;
    }
}

fn renumber(
    mut invocations: Vec<Invocation>,
    edges: Vec<DependencyEdge>,
) -> (Vec<Invocation>, Vec<DependencyEdge>) {
    let mapping: HashMap<StepId, StepId> = invocations
        .iter()
        .enumerate()
        .map(|(i, inv)| (inv.id.clone(), StepId::ordinal(i)))
        .collect();
    let rename = |id: &StepId| mapping.get(id).cloned().unwrap_or_else(|| id.clone());

    for invocation in &mut invocations {
        invocation.id = rename(&invocation.id);
        for binding in &mut invocation.bindings {
            binding.from_step = rename(&binding.from_step);
        }
    }

    let mut renamed: Vec<DependencyEdge> = Vec::with_capacity(edges.len());
    for edge in edges {
        let edge = DependencyEdge::new(rename(&edge.from), rename(&edge.to));
        if !renamed.contains(&edge) {
            renamed.push(edge);
        }
    }
    (invocations, renamed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::sample_registry;
    use serde_json::json;

    #[test]
    fn test_bare_name_gets_lookup_step() {
        let registry = sample_registry();
        let (invocations, edges) = apply_identity_rule(
            &registry,
            vec![Invocation::new(
                "s1",
                "send_email",
                json!({"to": "John", "subject": "the deck"}),
            )],
            Vec::new(),
        );

        assert_eq!(invocations.len(), 2);
        assert_eq!(invocations[0].id, "s1");
        assert_eq!(invocations[0].capability, "resolve_contact");
        assert_eq!(invocations[0].raw_parameters, json!({"query": "John"}));
        assert_eq!(invocations[1].id, "s2");
        assert_eq!(invocations[1].raw_parameters, json!({"subject": "the deck"}));
        assert_eq!(
            invocations[1].bindings,
            vec![ParamBinding::new("to", "s1", "email")]
        );
        assert_eq!(edges, vec![DependencyEdge::new("s1", "s2")]);
    }

    #[test]
    fn test_canonical_identity_needs_no_lookup() {
        let registry = sample_registry();
        let (invocations, edges) = apply_identity_rule(
            &registry,
            vec![Invocation::new(
                "s1",
                "send_email",
                json!({"to": "john@co.com", "subject": "the deck"}),
            )],
            Vec::new(),
        );
        assert_eq!(invocations.len(), 1);
        assert!(invocations[0].bindings.is_empty());
        assert!(edges.is_empty());
    }

    #[test]
    fn test_same_name_shares_one_lookup_and_edges_are_remapped() {
        let registry = sample_registry();
        let (invocations, edges) = apply_identity_rule(
            &registry,
            vec![
                Invocation::new("a", "send_email", json!({"to": "Sue", "subject": "hi"})),
                Invocation::new(
                    "b",
                    "create_event",
                    json!({"attendee": "sue", "title": "sync"}),
                ),
            ],
            vec![DependencyEdge::new("a", "b")],
        );
        let caps: Vec<&str> = invocations.iter().map(|i| i.capability.as_str()).collect();
        assert_eq!(caps, vec!["resolve_contact", "send_email", "create_event"]);
        assert_eq!(
            edges,
            vec![
                DependencyEdge::new("s2", "s3"),
                DependencyEdge::new("s1", "s2"),
                DependencyEdge::new("s1", "s3"),
            ]
        );
    }

    #[test]
    fn test_lookup_id_never_merges_with_classifier_id() {
        let registry = sample_registry();
        let (invocations, edges) = apply_identity_rule(
            &registry,
            vec![
                Invocation::new("identity-1", "web_search", json!({"query": "flights"})),
                Invocation::new("b", "send_email", json!({"to": "John", "subject": "fares"})),
            ],
            vec![DependencyEdge::new("identity-1", "b")],
        );

        let ids: Vec<&str> = invocations.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2", "s3"]);
        let caps: Vec<&str> = invocations.iter().map(|i| i.capability.as_str()).collect();
        assert_eq!(caps, vec!["web_search", "resolve_contact", "send_email"]);
        assert_eq!(
            invocations[2].bindings,
            vec![ParamBinding::new("to", "s2", "email")]
        );
        assert_eq!(
            edges,
            vec![DependencyEdge::new("s1", "s3"), DependencyEdge::new("s2", "s3")]
        );
    }
}
