//! Intent & dependency resolver
//!
//! Turns an utterance (plus optional conversation context) into capability
//! invocations with explicit dependency edges. The resolver never fails:
//! classifier errors degrade to keyword matching, and low confidence or an
//! empty utterance yield an empty result flagged for clarification.

mod identity;
mod keyword;

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use keyword::KeywordClassifier;

use crate::capability::{CapabilityDescriptor, CapabilityRegistry};
use crate::types::{
    ContextHint, ConversationSnippet, DependencyEdge, Invocation, ResolutionSource,
    ResolvedIntent, StepId,
};

/// Words that refer back to earlier conversation
const BACK_REFERENCES: [&str; 9] = [
    "him", "her", "them", "again", "same", "reply", "previous", "earlier", "last",
];

/// Classifier errors; never user-visible unless the fallback also fails
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("classifier unavailable: {0}")]
    Unavailable(String),

    #[error("classifier returned invalid output: {0}")]
    InvalidOutput(String),
}

/// Raw classifier output
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    pub invocations: Vec<Invocation>,
    pub edges: Vec<DependencyEdge>,
    pub confidence: f32,
}

/// Classifier interface (rule-based or model-backed)
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        utterance: &str,
        context: &[ConversationSnippet],
        capabilities: &[Arc<CapabilityDescriptor>],
    ) -> Result<Classification, ResolveError>;
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Below this confidence the resolver asks for clarification
    pub confidence_threshold: f32,
    /// Snippets requested from the context source on ambiguity
    pub context_limit: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            context_limit: 6,
        }
    }
}

pub struct IntentResolver {
    registry: Arc<CapabilityRegistry>,
    classifier: Option<Arc<dyn Classifier>>,
    keyword: KeywordClassifier,
    config: RwLock<ResolverConfig>,
}

impl IntentResolver {
    pub fn new(registry: Arc<CapabilityRegistry>, config: ResolverConfig) -> Self {
        Self {
            registry,
            classifier: None,
            keyword: KeywordClassifier::new(),
            config: RwLock::new(config),
        }
    }

    /// Use a model-backed classifier first, keyword matching as fallback
    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn config(&self) -> ResolverConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap thresholds for requests resolved from now on
    pub fn update_config(&self, config: ResolverConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Context hint when the utterance refers back to earlier turns
    pub fn detect_ambiguity(&self, utterance: &str) -> Option<ContextHint> {
        let mut references: Vec<String> = Vec::new();
        for word in utterance.split_whitespace() {
            let word = word
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            if BACK_REFERENCES.contains(&word.as_str()) && !references.contains(&word) {
                references.push(word);
            }
        }
        if references.is_empty() {
            None
        } else {
            Some(ContextHint::new(references, self.config().context_limit))
        }
    }

    pub async fn resolve(
        &self,
        utterance: &str,
        context: &[ConversationSnippet],
    ) -> ResolvedIntent {
        let utterance = utterance.trim();
        if utterance.is_empty() {
            return ResolvedIntent::clarification(0.0, ResolutionSource::Keyword);
        }

        let capabilities = self.registry.descriptors();
        let (classification, source) = match &self.classifier {
            Some(classifier) => match classifier.classify(utterance, context, capabilities).await {
                Ok(classification) => match self.check_classification(&classification) {
                    Ok(()) => (classification, ResolutionSource::Classifier),
                    Err(err) => {
                        warn!(error = %err, "classifier output rejected, using keyword fallback");
                        (
                            self.keyword.classify_utterance(utterance, context, capabilities),
                            ResolutionSource::KeywordFallback,
                        )
                    }
                },
                Err(err) => {
                    warn!(error = %err, "classifier failed, using keyword fallback");
                    (
                        self.keyword.classify_utterance(utterance, context, capabilities),
                        ResolutionSource::KeywordFallback,
                    )
                }
            },
            None => (
                self.keyword.classify_utterance(utterance, context, capabilities),
                ResolutionSource::Keyword,
            ),
        };

        let threshold = self.config().confidence_threshold;
        if classification.invocations.is_empty() || classification.confidence < threshold {
            info!(
                confidence = classification.confidence,
                threshold,
                "resolver needs clarification"
            );
            return ResolvedIntent::clarification(classification.confidence, source);
        }

        let (invocations, edges) =
            identity::apply_identity_rule(&self.registry, classification.invocations, classification.edges);
        debug!(
            invocations = invocations.len(),
            edges = edges.len(),
            ?source,
            "intent resolved"
        );

        ResolvedIntent {
            invocations,
            edges,
            clarification_needed: false,
            confidence: classification.confidence,
            source,
        }
    }

    fn check_classification(&self, classification: &Classification) -> Result<(), ResolveError> {
        let mut ids = HashSet::new();
        for invocation in &classification.invocations {
            if !self.registry.contains(&invocation.capability) {
                return Err(ResolveError::InvalidOutput(format!(
                    "unknown capability '{}'",
                    invocation.capability
                )));
            }
            if !ids.insert(invocation.id.clone()) {
                return Err(ResolveError::InvalidOutput(format!(
                    "duplicate invocation id '{}'",
                    invocation.id
                )));
            }
        }
        if !(0.0..=1.0).contains(&classification.confidence) {
            return Err(ResolveError::InvalidOutput(format!(
                "confidence {} out of range",
                classification.confidence
            )));
        }
        check_dependencies(classification, &ids)
    }
}

/// Edges and bindings must stay inside the classification and form a DAG
fn check_dependencies(
    classification: &Classification,
    ids: &HashSet<StepId>,
) -> Result<(), ResolveError> {
    let mut pairs: Vec<(&StepId, &StepId)> = classification
        .edges
        .iter()
        .map(|edge| (&edge.from, &edge.to))
        .collect();
    for invocation in &classification.invocations {
        for binding in &invocation.bindings {
            pairs.push((&binding.from_step, &invocation.id));
        }
    }

    let mut indegree: HashMap<&StepId, usize> = ids.iter().map(|id| (id, 0)).collect();
    let mut downstream: HashMap<&StepId, Vec<&StepId>> = HashMap::new();
    let mut seen = HashSet::new();
    for (from, to) in pairs {
        for endpoint in [from, to] {
            if !ids.contains(endpoint) {
                return Err(ResolveError::InvalidOutput(format!(
                    "dependency on unknown invocation '{}'",
                    endpoint
                )));
            }
        }
        if from == to {
            return Err(ResolveError::InvalidOutput(format!(
                "invocation '{}' depends on itself",
                from
            )));
        }
        if seen.insert((from, to)) {
            downstream.entry(from).or_default().push(to);
            *indegree.entry(to).or_default() += 1;
        }
    }

    let mut ready: VecDeque<&StepId> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0;
    while let Some(id) = ready.pop_front() {
        visited += 1;
        for next in downstream.get(id).into_iter().flatten() {
            if let Some(degree) = indegree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(*next);
                }
            }
        }
    }
    if visited < ids.len() {
        return Err(ResolveError::InvalidOutput(
            "dependency edges form a cycle".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::sample_registry;
    use crate::types::ParamBinding;
    use serde_json::json;

    struct FailingClassifier;

    #[async_trait]
    impl Classifier for FailingClassifier {
        async fn classify(
            &self,
            _utterance: &str,
            _context: &[ConversationSnippet],
            _capabilities: &[Arc<CapabilityDescriptor>],
        ) -> Result<Classification, ResolveError> {
            Err(ResolveError::Unavailable("connection refused".into()))
        }
    }

    struct FixedClassifier(Classification);

    #[async_trait]
    impl Classifier for FixedClassifier {
        async fn classify(
            &self,
            _utterance: &str,
            _context: &[ConversationSnippet],
            _capabilities: &[Arc<CapabilityDescriptor>],
        ) -> Result<Classification, ResolveError> {
            Ok(self.0.clone())
        }
    }

    fn resolver() -> IntentResolver {
        IntentResolver::new(Arc::new(sample_registry()), ResolverConfig::default())
    }

    #[test]
    fn test_bare_name_inserts_contact_lookup() {
        tokio_test::block_on(async {
            let resolved = resolver().resolve("email John about the deck", &[]).await;
            assert!(!resolved.clarification_needed);
            assert_eq!(resolved.capabilities(), vec!["resolve_contact", "send_email"]);
            assert_eq!(resolved.edges, vec![DependencyEdge::new("s1", "s2")]);
            assert_eq!(
                resolved.invocations[1].bindings,
                vec![ParamBinding::new("to", "s1", "email")]
            );
        });
    }

    #[test]
    fn test_canonical_address_skips_lookup() {
        tokio_test::block_on(async {
            let resolved = resolver().resolve("email john@co.com about the deck", &[]).await;
            assert_eq!(resolved.capabilities(), vec!["send_email"]);
            assert!(resolved.edges.is_empty());
        });
    }

    #[test]
    fn test_empty_utterance_is_not_an_error() {
        tokio_test::block_on(async {
            let resolved = resolver().resolve("   ", &[]).await;
            assert!(resolved.is_empty());
            assert!(resolved.clarification_needed);
        });
    }

    #[test]
    fn test_low_confidence_asks_for_clarification() {
        tokio_test::block_on(async {
            let resolver = IntentResolver::new(
                Arc::new(sample_registry()),
                ResolverConfig {
                    confidence_threshold: 0.9,
                    ..ResolverConfig::default()
                },
            );
            let resolved = resolver.resolve("what's the weather", &[]).await;
            assert!(resolved.is_empty());
            assert!(resolved.clarification_needed);
            assert!(resolved.confidence > 0.0);
        });
    }

    #[test]
    fn test_classifier_failure_falls_back_to_keywords() {
        tokio_test::block_on(async {
            let resolved = resolver()
                .with_classifier(Arc::new(FailingClassifier))
                .resolve("what's the weather", &[])
                .await;
            assert_eq!(resolved.source, ResolutionSource::KeywordFallback);
            assert_eq!(resolved.capabilities(), vec!["web_search"]);
        });
    }

    #[test]
    fn test_classifier_output_still_gets_identity_rule() {
        tokio_test::block_on(async {
            let classification = Classification {
                invocations: vec![Invocation::new(
                    "email-1",
                    "send_email",
                    json!({"to": "Ann", "subject": "lunch"}),
                )],
                edges: Vec::new(),
                confidence: 0.95,
            };
            let resolved = resolver()
                .with_classifier(Arc::new(FixedClassifier(classification)))
                .resolve("drop Ann a line about lunch", &[])
                .await;
            assert_eq!(resolved.source, ResolutionSource::Classifier);
            assert_eq!(resolved.capabilities(), vec!["resolve_contact", "send_email"]);
            assert_eq!(resolved.invocations[1].id, StepId::from("s2"));
        });
    }

    #[test]
    fn test_classifier_with_unknown_capability_falls_back() {
        tokio_test::block_on(async {
            let classification = Classification {
                invocations: vec![Invocation::new("x", "teleport", json!({}))],
                edges: Vec::new(),
                confidence: 0.99,
            };
            let resolved = resolver()
                .with_classifier(Arc::new(FixedClassifier(classification)))
                .resolve("search contacts for Sue", &[])
                .await;
            assert_eq!(resolved.source, ResolutionSource::KeywordFallback);
            assert_eq!(resolved.capabilities(), vec!["search_contacts"]);
        });
    }

    #[test]
    fn test_classifier_with_dangling_edge_falls_back() {
        tokio_test::block_on(async {
            let classification = Classification {
                invocations: vec![Invocation::new(
                    "c1",
                    "search_contacts",
                    json!({"query": "Sue"}),
                )],
                edges: vec![DependencyEdge::new("c0", "c1")],
                confidence: 0.97,
            };
            let resolved = resolver()
                .with_classifier(Arc::new(FixedClassifier(classification)))
                .resolve("search contacts for Sue", &[])
                .await;
            assert_eq!(resolved.source, ResolutionSource::KeywordFallback);
            assert_eq!(resolved.capabilities(), vec!["search_contacts"]);
            assert!(resolved.edges.is_empty());
        });
    }

    #[test]
    fn test_classifier_with_cycle_falls_back() {
        tokio_test::block_on(async {
            let classification = Classification {
                invocations: vec![
                    Invocation::new("a", "web_search", json!({"query": "weather"})),
                    Invocation::new("b", "search_contacts", json!({"query": "Sue"})),
                ],
                edges: vec![DependencyEdge::new("a", "b"), DependencyEdge::new("b", "a")],
                confidence: 0.97,
            };
            let resolved = resolver()
                .with_classifier(Arc::new(FixedClassifier(classification)))
                .resolve("what's the weather", &[])
                .await;
            assert_eq!(resolved.source, ResolutionSource::KeywordFallback);
            assert_eq!(resolved.capabilities(), vec!["web_search"]);
        });
    }

    #[test]
    fn test_classifier_binding_to_unknown_step_is_rejected() {
        let classification = Classification {
            invocations: vec![Invocation::new("a", "send_email", json!({"subject": "hi"}))
                .with_binding(ParamBinding::new("to", "ghost", "email"))],
            edges: Vec::new(),
            confidence: 0.9,
        };
        let err = resolver()
            .check_classification(&classification)
            .expect_err("dangling binding");
        assert!(matches!(err, ResolveError::InvalidOutput(_)));
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_resolution_is_deterministic() {
        tokio_test::block_on(async {
            let resolver = resolver();
            let utterance = "search contacts for Sue and what's the weather then email Bob about it";
            let first = resolver.resolve(utterance, &[]).await;
            let second = resolver.resolve(utterance, &[]).await;
            assert_eq!(first, second);
        });
    }

    #[test]
    fn test_detect_ambiguity() {
        let resolver = resolver();
        let hint = resolver.detect_ambiguity("send her the same file again").unwrap();
        assert_eq!(hint.references, vec!["her", "same", "again"]);
        assert!(resolver.detect_ambiguity("what's the weather").is_none());
    }
}
