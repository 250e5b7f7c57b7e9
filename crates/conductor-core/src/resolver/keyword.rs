//! Keyword classifier
//!
//! Rule-based classification against capability keyword sets. Used on its
//! own and as the fallback whenever a model-backed classifier fails.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

use super::{Classification, Classifier, ResolveError};
use crate::capability::{CapabilityDescriptor, IdentityKind, ParamKind, ParamSpec};
use crate::types::{ConversationSnippet, DependencyEdge, Invocation, StepId};

const PRONOUNS: [&str; 3] = ["him", "her", "them"];
const FILLER: [&str; 7] = ["a", "an", "the", "to", "my", "me", "please"];

/// Confidence of a clause matched by `hits` keywords
fn clause_confidence(hits: usize) -> f32 {
    (0.6 + 0.2 * hits.saturating_sub(1) as f32).min(1.0)
}

fn normalize_token(token: &str) -> String {
    token
        .trim_matches(|c: char| !(c.is_alphanumeric() || c == '@' || c == '+'))
        .to_lowercase()
}

fn phrase_tokens(phrase: &str) -> Vec<String> {
    phrase
        .split_whitespace()
        .map(normalize_token)
        .filter(|t| !t.is_empty())
        .collect()
}

fn find_phrase(haystack: &[String], phrase: &[String], from: usize) -> Option<usize> {
    if phrase.is_empty() || haystack.len() < phrase.len() {
        return None;
    }
    (from..=haystack.len() - phrase.len()).find(|&i| haystack[i..i + phrase.len()] == *phrase)
}

fn clean_value(tokens: &[String]) -> String {
    tokens
        .join(" ")
        .trim_matches(|c: char| ",.!?;:\"".contains(c))
        .trim()
        .to_string()
}

#[derive(Debug, Clone)]
struct Clause {
    tokens: Vec<String>,
    /// Connective that introduced this clause
    joiner: Option<String>,
    after_then: bool,
}

/// Split on `and`, `then`, `also` and `;`
fn split_clauses(utterance: &str) -> Vec<Clause> {
    let mut clauses = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut joiner: Option<String> = None;
    let mut after_then = false;

    let mut flush = |current: &mut Vec<String>, joiner: &mut Option<String>, after_then: &mut bool| {
        if !current.is_empty() {
            clauses.push(Clause {
                tokens: std::mem::take(current),
                joiner: joiner.take(),
                after_then: *after_then,
            });
            *after_then = false;
        }
    };

    for raw in utterance.split_whitespace() {
        let (word, ends_clause) = match raw.strip_suffix(';') {
            Some(word) => (word, true),
            None => (raw, false),
        };
        let lowered = normalize_token(word);
        match lowered.as_str() {
            "and" | "also" | "then" => {
                flush(&mut current, &mut joiner, &mut after_then);
                if joiner.is_none() {
                    joiner = Some(lowered.clone());
                }
                if lowered == "then" {
                    after_then = true;
                }
            }
            _ if !word.is_empty() => current.push(word.to_string()),
            _ => {}
        }
        if ends_clause {
            flush(&mut current, &mut joiner, &mut after_then);
            joiner = Some(";".to_string());
        }
    }
    flush(&mut current, &mut joiner, &mut after_then);
    clauses
}

/// Keyword hits of one capability in a normalized clause, plus the token
/// index right after the earliest hit
fn score(descriptor: &CapabilityDescriptor, normalized: &[String]) -> (usize, usize) {
    let mut hits = 0;
    let mut earliest: Option<(usize, usize)> = None;
    for keyword in &descriptor.keywords {
        let phrase = phrase_tokens(keyword);
        if let Some(pos) = find_phrase(normalized, &phrase, 0) {
            hits += 1;
            if earliest.map_or(true, |(start, _)| pos < start) {
                earliest = Some((pos, pos + phrase.len()));
            }
        }
    }
    (hits, earliest.map(|(_, end)| end).unwrap_or(0))
}

struct Matched {
    capability: usize,
    hits: usize,
    keyword_end: usize,
    tokens: Vec<String>,
    after_then: bool,
}

/// Deterministic keyword/regex classifier
#[derive(Debug, Clone, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify_utterance(
        &self,
        utterance: &str,
        context: &[ConversationSnippet],
        capabilities: &[Arc<CapabilityDescriptor>],
    ) -> Classification {
        let mut matched: Vec<Matched> = Vec::new();
        for clause in split_clauses(utterance) {
            let normalized: Vec<String> = clause.tokens.iter().map(|t| normalize_token(t)).collect();
            let mut best: Option<(usize, usize, usize)> = None;
            for (idx, descriptor) in capabilities.iter().enumerate() {
                let (hits, end) = score(descriptor, &normalized);
                // strict comparison keeps the earlier declaration on ties
                if hits > 0 && best.map_or(true, |(_, top, _)| hits > top) {
                    best = Some((idx, hits, end));
                }
            }
            match best {
                Some((capability, hits, keyword_end)) => matched.push(Matched {
                    capability,
                    hits,
                    keyword_end,
                    tokens: clause.tokens,
                    after_then: clause.after_then,
                }),
                None => {
                    // unmatched clauses belong to the previous one ("about sales and marketing")
                    if let Some(previous) = matched.last_mut() {
                        if let Some(joiner) = clause.joiner {
                            previous.tokens.push(joiner);
                        }
                        previous.tokens.extend(clause.tokens);
                    }
                }
            }
        }

        let mut invocations = Vec::with_capacity(matched.len());
        let mut edges = Vec::new();
        let mut confidence: f32 = 1.0;
        for (index, m) in matched.iter().enumerate() {
            let descriptor = &capabilities[m.capability];
            let id = StepId::ordinal(index);
            if m.after_then && index > 0 {
                edges.push(DependencyEdge::new(StepId::ordinal(index - 1), id.clone()));
            }
            confidence = confidence.min(clause_confidence(m.hits));
            let parameters = extract_parameters(descriptor, &m.tokens, m.keyword_end, context);
            invocations.push(Invocation::new(id, descriptor.name.clone(), parameters));
        }
        if invocations.is_empty() {
            confidence = 0.0;
        }

        Classification {
            invocations,
            edges,
            confidence,
        }
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(
        &self,
        utterance: &str,
        context: &[ConversationSnippet],
        capabilities: &[Arc<CapabilityDescriptor>],
    ) -> Result<Classification, ResolveError> {
        Ok(self.classify_utterance(utterance, context, capabilities))
    }
}

/// Pull parameter values out of one clause using the schema's cue words
fn extract_parameters(
    descriptor: &CapabilityDescriptor,
    tokens: &[String],
    keyword_end: usize,
    context: &[ConversationSnippet],
) -> Value {
    let normalized: Vec<String> = tokens.iter().map(|t| normalize_token(t)).collect();
    let schema = &descriptor.parameter_schema;

    // (param index, cue start, value start)
    let mut cue_hits: Vec<(usize, usize, usize)> = Vec::new();
    let mut cue_words: Vec<String> = Vec::new();
    for (param_index, spec) in schema.params.iter().enumerate() {
        let mut earliest: Option<(usize, usize)> = None;
        for cue in &spec.cues {
            let phrase = phrase_tokens(cue);
            cue_words.extend(phrase.iter().cloned());
            if let Some(pos) = find_phrase(&normalized, &phrase, keyword_end) {
                if earliest.map_or(true, |(start, _)| pos < start) {
                    earliest = Some((pos, pos + phrase.len()));
                }
            }
        }
        if let Some((start, value_start)) = earliest {
            cue_hits.push((param_index, start, value_start));
        }
    }

    let mut values = Map::new();
    for &(param_index, start, value_start) in &cue_hits {
        let end = cue_hits
            .iter()
            .map(|&(_, other, _)| other)
            .filter(|&other| other > start)
            .min()
            .unwrap_or(tokens.len());
        if value_start >= end {
            continue;
        }
        let spec = &schema.params[param_index];
        if let Some(value) = value_for(spec, &tokens[value_start..end], context) {
            values.insert(spec.name.clone(), value);
        }
    }

    for (spec, kind) in schema.identity_params() {
        if values.contains_key(&spec.name) {
            continue;
        }
        if let Some(found) = kind.find_in(&tokens.join(" ")) {
            values.insert(spec.name.clone(), Value::String(found));
            continue;
        }
        if let Some(name) = name_after(tokens, &normalized, keyword_end, &cue_words) {
            if let Some(value) = identity_value(kind, name, context) {
                values.insert(spec.name.clone(), Value::String(value));
            }
        }
    }

    // a required free-text parameter with no cue takes the whole clause
    if let Some(spec) = schema.params.iter().find(|p| {
        p.required
            && matches!(p.kind, ParamKind::Text | ParamKind::String)
            && !values.contains_key(&p.name)
    }) {
        let text = clean_value(tokens);
        if !text.is_empty() {
            values.insert(spec.name.clone(), Value::String(text));
        }
    }

    Value::Object(values)
}

fn value_for(spec: &ParamSpec, segment: &[String], context: &[ConversationSnippet]) -> Option<Value> {
    match spec.kind {
        ParamKind::Identity(kind) => {
            if let Some(found) = kind.find_in(&segment.join(" ")) {
                return Some(Value::String(found));
            }
            let name = leading_name(segment);
            identity_value(kind, name, context).map(Value::String)
        }
        ParamKind::String | ParamKind::Text => {
            let text = clean_value(segment);
            (!text.is_empty()).then_some(Value::String(text))
        }
        ParamKind::Integer => segment
            .first()
            .and_then(|t| normalize_token(t).parse::<i64>().ok())
            .map(Value::from),
        ParamKind::Boolean => match segment.first().map(|t| normalize_token(t)).as_deref() {
            Some("yes") | Some("true") => Some(Value::Bool(true)),
            Some("no") | Some("false") => Some(Value::Bool(false)),
            _ => None,
        },
        ParamKind::Array | ParamKind::Object => None,
    }
}

/// Bare name: first token plus any capitalized tokens that follow
fn leading_name(segment: &[String]) -> String {
    let mut parts: Vec<String> = Vec::new();
    for (i, token) in segment.iter().enumerate() {
        let cleaned = token.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'' && c != '-');
        if cleaned.is_empty() {
            break;
        }
        if i > 0 && !cleaned.chars().next().is_some_and(char::is_uppercase) {
            break;
        }
        parts.push(cleaned.to_string());
        if token.ends_with(|c: char| ",.;!?".contains(c)) {
            break;
        }
    }
    parts.join(" ")
}

/// Name token following the matched keyword ("email John ...")
fn name_after(
    tokens: &[String],
    normalized: &[String],
    keyword_end: usize,
    cue_words: &[String],
) -> Option<String> {
    let mut start = keyword_end;
    while start < tokens.len() && FILLER.contains(&normalized[start].as_str()) {
        start += 1;
    }
    if start >= tokens.len() || cue_words.contains(&normalized[start]) {
        return None;
    }
    let end = (start..tokens.len())
        .find(|&i| cue_words.contains(&normalized[i]))
        .unwrap_or(tokens.len());
    let name = leading_name(&tokens[start..end]);
    (!name.is_empty()).then_some(name)
}

/// Pronouns resolve against the most recent identifier in context
fn identity_value(kind: IdentityKind, name: String, context: &[ConversationSnippet]) -> Option<String> {
    if name.is_empty() {
        return None;
    }
    if PRONOUNS.contains(&name.to_lowercase().as_str()) {
        return context
            .iter()
            .rev()
            .find_map(|snippet| kind.find_in(&snippet.content));
    }
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::sample_registry;
    use crate::types::{ConversationEntry, ConversationSnippet};
    use serde_json::json;

    fn classify(utterance: &str) -> Classification {
        let registry = sample_registry();
        KeywordClassifier::new().classify_utterance(utterance, &[], registry.descriptors())
    }

    #[test]
    fn test_split_clauses_tracks_then() {
        let clauses = split_clauses("look up Sue; email her and then schedule a meeting also search");
        let texts: Vec<String> = clauses.iter().map(|c| c.tokens.join(" ")).collect();
        assert_eq!(
            texts,
            vec!["look up Sue", "email her", "schedule a meeting", "search"]
        );
        assert!(!clauses[1].after_then);
        assert!(clauses[2].after_then);
        assert!(!clauses[3].after_then);
    }

    #[test]
    fn test_email_to_bare_name_extracts_recipient_and_subject() {
        let result = classify("email John about the deck");
        assert_eq!(result.invocations.len(), 1);
        let inv = &result.invocations[0];
        assert_eq!(inv.capability, "send_email");
        assert_eq!(inv.raw_parameters, json!({"to": "John", "subject": "the deck"}));
        assert!((result.confidence - 0.6).abs() < f32::EPSILON);
    }

    #[test]
    fn test_canonical_email_is_taken_verbatim() {
        let result = classify("email john@co.com about the deck");
        assert_eq!(
            result.invocations[0].raw_parameters,
            json!({"to": "john@co.com", "subject": "the deck"})
        );
    }

    #[test]
    fn test_two_independent_clauses() {
        let result = classify("search contacts for Sue and what's the weather");
        let caps: Vec<&str> = result.invocations.iter().map(|i| i.capability.as_str()).collect();
        assert_eq!(caps, vec!["search_contacts", "web_search"]);
        assert!(result.edges.is_empty());
        assert_eq!(result.invocations[0].raw_parameters, json!({"query": "Sue"}));
        assert_eq!(
            result.invocations[1].raw_parameters,
            json!({"query": "what's the weather"})
        );
    }

    #[test]
    fn test_then_clause_depends_on_previous() {
        let result = classify("search the web for flights then email john@co.com about it");
        assert_eq!(result.invocations.len(), 2);
        assert_eq!(result.edges, vec![DependencyEdge::new("s1", "s2")]);
    }

    #[test]
    fn test_unmatched_clause_merges_into_previous() {
        let result = classify("email john@co.com about sales and marketing");
        assert_eq!(result.invocations.len(), 1);
        assert_eq!(
            result.invocations[0].raw_parameters["subject"],
            json!("sales and marketing")
        );
    }

    #[test]
    fn test_no_match_has_zero_confidence() {
        let result = classify("hmm");
        assert!(result.invocations.is_empty());
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_pronoun_resolves_from_context() {
        let registry = sample_registry();
        let context = vec![ConversationSnippet::from(&ConversationEntry::assistant(
            "Sent the notes to sue@co.com",
        ))];
        let result = KeywordClassifier::new().classify_utterance(
            "email her about the follow-up",
            &context,
            registry.descriptors(),
        );
        assert_eq!(result.invocations[0].raw_parameters["to"], json!("sue@co.com"));
    }
}
