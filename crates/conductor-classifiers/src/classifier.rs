//! LLM-backed intent classifier

use std::collections::HashSet;
use std::fmt::Write;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use conductor_core::capability::CapabilityDescriptor;
use conductor_core::resolver::{Classification, Classifier, ResolveError};
use conductor_core::types::{ConversationSnippet, DependencyEdge, EntryRole, Invocation};

use crate::llm::{extract_json, LlmClient, LlmRequest};

const MAX_PROMPT_LOG_CHARS: usize = 4_000;
const MAX_LLM_OUTPUT_LOG_CHARS: usize = 8_000;

/// Classifier config for LLM
#[derive(Debug, Clone)]
pub struct LlmClassifierConfig {
    pub model: String,
    pub temperature: f32,
    /// Conversation snippets included in the user prompt
    pub max_context: usize,
    pub system_prompt: String,
}

impl Default for LlmClassifierConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            max_context: 6,
            system_prompt: "You map a user request onto capability invocations. \
                            Return ONLY valid JSON."
                .to_string(),
        }
    }
}

/// LLM-based classifier
pub struct LlmClassifier<C: LlmClient> {
    pub client: C,
    pub config: LlmClassifierConfig,
}

impl<C: LlmClient> LlmClassifier<C> {
    pub fn new(client: C, config: LlmClassifierConfig) -> Self {
        Self { client, config }
    }

    fn build_prompt(
        &self,
        utterance: &str,
        context: &[ConversationSnippet],
        capabilities: &[Arc<CapabilityDescriptor>],
    ) -> (String, String) {
        let system = build_system_prompt(&self.config.system_prompt, capabilities);
        let mut user = String::new();
        let skip = context.len().saturating_sub(self.config.max_context);
        if skip < context.len() {
            user.push_str("Recent conversation:\n");
            for snippet in &context[skip..] {
                let role = match snippet.role {
                    EntryRole::User => "user",
                    EntryRole::Assistant => "assistant",
                };
                let _ = writeln!(user, "- {}: {}", role, snippet.content);
            }
            user.push('\n');
        }
        let _ = writeln!(user, "Request:\n{}", utterance);
        (system, user)
    }
}

fn build_system_prompt(base: &str, capabilities: &[Arc<CapabilityDescriptor>]) -> String {
    let mut system = String::new();
    system.push_str(base);
    system.push_str("\n\nRules:\n");
    system.push_str("1) Use only capabilities from the catalog below, by exact name.\n");
    system.push_str("2) One invocation per distinct action the user asks for; ids are s1, s2, ... in request order.\n");
    system.push_str("3) Add an edge {\"from\", \"to\"} when one invocation must finish before another starts.\n");
    system.push_str("4) Copy parameter values from the request; leave person names as written, never invent addresses.\n");
    system.push_str("5) confidence is a number in [0, 1]; use a low value when the request is unclear.\n");
    system.push_str(
        "\nOutput shape:\n{\"invocations\":[{\"id\":\"s1\",\"capability\":\"...\",\"parameters\":{}}],\
         \"edges\":[{\"from\":\"s1\",\"to\":\"s2\"}],\"confidence\":0.9}\n",
    );
    system.push_str("\nCapability Catalog:\n");
    for descriptor in capabilities {
        append_catalog_entry(&mut system, descriptor);
    }
    system
}

fn append_catalog_entry(buf: &mut String, descriptor: &CapabilityDescriptor) {
    let _ = writeln!(buf, "- name: {}", descriptor.name);
    let _ = writeln!(buf, "  label: {}", descriptor.label);
    if !descriptor.description.is_empty() {
        let _ = writeln!(buf, "  description: {}", descriptor.description);
    }
    if !descriptor.keywords.is_empty() {
        let _ = writeln!(buf, "  keywords: {}", descriptor.keywords.join(", "));
    }
    if descriptor.parameter_schema.params.is_empty() {
        let _ = writeln!(buf, "  parameters: []");
        return;
    }
    let _ = writeln!(buf, "  parameters:");
    for param in &descriptor.parameter_schema.params {
        let required = if param.required { "required" } else { "optional" };
        let _ = write!(buf, "    - {} ({}, {})", param.name, param.kind, required);
        if !param.description.is_empty() {
            let _ = write!(buf, " desc={}", param.description);
        }
        buf.push('\n');
    }
}

fn truncate_for_log(input: &str, max_chars: usize) -> String {
    let char_count = input.chars().count();
    if char_count <= max_chars {
        return input.to_string();
    }
    let mut preview: String = input.chars().take(max_chars).collect();
    preview.push_str(&format!("... [truncated, total_chars={}]", char_count));
    preview
}

#[derive(Debug, Deserialize)]
struct ClassifierOutput {
    #[serde(default)]
    invocations: Vec<WireInvocation>,
    #[serde(default)]
    edges: Vec<WireEdge>,
    #[serde(default)]
    confidence: f32,
}

#[derive(Debug, Deserialize)]
struct WireInvocation {
    id: String,
    capability: String,
    #[serde(default)]
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct WireEdge {
    from: String,
    to: String,
}

fn parse_output(json: &str) -> Result<Classification, ResolveError> {
    let output: ClassifierOutput = serde_json::from_str(json)
        .map_err(|e| ResolveError::InvalidOutput(format!("invalid classification JSON: {}", e)))?;

    let ids: HashSet<&str> = output.invocations.iter().map(|i| i.id.as_str()).collect();
    for edge in &output.edges {
        if !ids.contains(edge.from.as_str()) || !ids.contains(edge.to.as_str()) {
            return Err(ResolveError::InvalidOutput(format!(
                "edge {} -> {} references an unknown invocation",
                edge.from, edge.to
            )));
        }
    }

    let invocations = output
        .invocations
        .into_iter()
        .map(|i| {
            let parameters = if i.parameters.is_null() {
                Value::Object(serde_json::Map::new())
            } else {
                i.parameters
            };
            Invocation::new(i.id, i.capability, parameters)
        })
        .collect();
    let edges = output
        .edges
        .into_iter()
        .map(|e| DependencyEdge::new(e.from, e.to))
        .collect();
    Ok(Classification {
        invocations,
        edges,
        confidence: output.confidence,
    })
}

#[async_trait]
impl<C: LlmClient> Classifier for LlmClassifier<C> {
    async fn classify(
        &self,
        utterance: &str,
        context: &[ConversationSnippet],
        capabilities: &[Arc<CapabilityDescriptor>],
    ) -> Result<Classification, ResolveError> {
        let (system, user) = self.build_prompt(utterance, context, capabilities);
        info!(
            model = %self.config.model,
            temperature = self.config.temperature,
            utterance_len = utterance.len(),
            capability_count = capabilities.len(),
            context_count = context.len(),
            "classifier request prepared"
        );
        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!(
                system_prompt = %truncate_for_log(&system, MAX_PROMPT_LOG_CHARS),
                user_prompt = %truncate_for_log(&user, MAX_PROMPT_LOG_CHARS),
                "classifier prompts"
            );
        }

        let request = LlmRequest {
            system,
            user,
            model: self.config.model.clone(),
            temperature: self.config.temperature,
            json_mode: true,
        };
        let output = self
            .client
            .complete(request)
            .await
            .map_err(|e| ResolveError::Unavailable(e.to_string()))?;
        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!(
                llm_output = %truncate_for_log(&output, MAX_LLM_OUTPUT_LOG_CHARS),
                "classifier raw llm output"
            );
        }

        let json = extract_json(&output).ok_or_else(|| {
            ResolveError::InvalidOutput("LLM output did not contain JSON".to_string())
        })?;
        let classification = parse_output(json)?;
        info!(
            invocation_count = classification.invocations.len(),
            edge_count = classification.edges.len(),
            confidence = classification.confidence,
            "classifier parsed output"
        );
        Ok(classification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use conductor_core::capability::{IdentityKind, ParamKind, ParamSpec};
    use conductor_core::types::{ConversationEntry, StepId};
    use serde_json::json;

    fn catalog() -> Vec<Arc<CapabilityDescriptor>> {
        vec![
            Arc::new(
                CapabilityDescriptor::new("send_email")
                    .with_label("send an email")
                    .with_keywords(&["email", "send"])
                    .with_params(vec![
                        ParamSpec::new("to", ParamKind::Identity(IdentityKind::Email))
                            .required()
                            .with_description("recipient"),
                        ParamSpec::new("subject", ParamKind::Text).required(),
                    ])
                    .mutating(),
            ),
            Arc::new(CapabilityDescriptor::new("web_search").with_label("search the web")),
        ]
    }

    fn classifier(reply: &str) -> LlmClassifier<MockLlmClient> {
        LlmClassifier::new(MockLlmClient::replying(reply), LlmClassifierConfig::default())
    }

    #[test]
    fn test_system_prompt_contains_catalog_with_parameter_hints() {
        let classifier = classifier("{}");
        let context = vec![ConversationSnippet::from(&ConversationEntry::user(
            "who is John?",
        ))];
        let (system, user) = classifier.build_prompt("email him", &context, &catalog());

        assert!(system.contains("Capability Catalog"));
        assert!(system.contains("- name: send_email"));
        assert!(system.contains("label: send an email"));
        assert!(system.contains("to (identity:email, required) desc=recipient"));
        assert!(system.contains("- name: web_search"));
        assert!(system.contains("parameters: []"));
        assert!(user.contains("- user: who is John?"));
        assert!(user.ends_with("Request:\nemail him\n"));
    }

    #[test]
    fn test_classify_parses_fenced_reply() {
        tokio_test::block_on(async {
            let reply = r#"Here you go:
```json
{"invocations":[
  {"id":"s1","capability":"web_search","parameters":{"query":"weather"}},
  {"id":"s2","capability":"send_email","parameters":{"to":"John","subject":"weather"}}
 ],
 "edges":[{"from":"s1","to":"s2"}],
 "confidence":0.82}
```"#;
            let result = classifier(reply)
                .classify("look up the weather then email John", &[], &catalog())
                .await
                .expect("classify");

            assert_eq!(result.invocations.len(), 2);
            assert_eq!(result.invocations[1].capability, "send_email");
            assert_eq!(
                result.invocations[0].raw_parameters,
                json!({"query": "weather"})
            );
            assert_eq!(result.edges, vec![DependencyEdge::new("s1", "s2")]);
            assert!((result.confidence - 0.82).abs() < f32::EPSILON);
            assert_eq!(result.invocations[0].id, StepId::from("s1"));
        });
    }

    #[test]
    fn test_missing_parameters_become_empty_object() {
        let result = parse_output(
            r#"{"invocations":[{"id":"s1","capability":"web_search"}],"confidence":1}"#,
        )
        .expect("parse");
        assert_eq!(result.invocations[0].raw_parameters, json!({}));
        assert!(result.edges.is_empty());
    }

    #[test]
    fn test_invalid_outputs_are_reported() {
        tokio_test::block_on(async {
            let err = classifier("I cannot help with that")
                .classify("hmm", &[], &catalog())
                .await
                .expect_err("no json");
            assert!(matches!(err, ResolveError::InvalidOutput(_)));

            let err = classifier(r#"{"invocations":[{"id":"s1","capability":"web_search"}],"edges":[{"from":"s1","to":"s9"}]}"#)
                .classify("hmm", &[], &catalog())
                .await
                .expect_err("dangling edge");
            assert!(err.to_string().contains("s9"));
        });
    }

    #[test]
    fn test_client_failure_is_unavailable() {
        tokio_test::block_on(async {
            let classifier = LlmClassifier::new(
                MockLlmClient::failing("timeout"),
                LlmClassifierConfig::default(),
            );
            let err = classifier
                .classify("email John", &[], &catalog())
                .await
                .expect_err("unavailable");
            assert!(matches!(err, ResolveError::Unavailable(_)));
        });
    }
}
