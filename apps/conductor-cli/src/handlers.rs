//! Simulated capability handlers
//!
//! Stand-ins for the real integrations so a plan can be driven end to end
//! from the command line. Nothing leaves the process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use conductor_core::capability::{Capability, CapabilityError, ExecutionContext};

const CONTACTS: &[(&str, &str)] = &[
    ("Ann", "ann@example.com"),
    ("John", "john@example.com"),
    ("Maria", "maria@example.com"),
    ("Sue", "sue@example.com"),
];

/// Deterministic contact directory backing `resolve_contact` and `search_contacts`
pub struct ContactDirectory {
    exact: bool,
}

impl ContactDirectory {
    fn matches(&self, query: &str) -> Vec<(&'static str, &'static str)> {
        let query = query.trim().to_lowercase();
        CONTACTS
            .iter()
            .filter(|(name, _)| {
                let name = name.to_lowercase();
                if self.exact {
                    name == query
                } else {
                    name.contains(&query)
                }
            })
            .copied()
            .collect()
    }
}

#[async_trait]
impl Capability for ContactDirectory {
    async fn invoke(&self, params: Value, _ctx: ExecutionContext) -> Result<Value, CapabilityError> {
        let query = params
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| CapabilityError::validation("a contact name is required"))?;
        let found = self.matches(query);

        if self.exact {
            let Some((name, email)) = found.first() else {
                return Err(CapabilityError::validation(format!(
                    "no contact named {}",
                    query
                )));
            };
            return Ok(json!({ "name": name, "email": email }));
        }

        let contacts: Vec<Value> = found
            .iter()
            .map(|(name, email)| json!({ "name": name, "email": email }))
            .collect();
        Ok(json!({
            "contacts": contacts,
            "summary": format!("{} contact(s) match \"{}\".", contacts.len(), query),
        }))
    }
}

/// Echoes its parameters back with a short summary
pub struct Echo {
    summary: &'static str,
}

#[async_trait]
impl Capability for Echo {
    async fn invoke(&self, params: Value, ctx: ExecutionContext) -> Result<Value, CapabilityError> {
        Ok(json!({
            "echo": params,
            "step_id": ctx.step_id,
            "summary": self.summary,
        }))
    }
}

/// Handlers for the shipped catalog, keyed by capability name
pub fn simulated() -> HashMap<String, Arc<dyn Capability>> {
    let mut handlers: HashMap<String, Arc<dyn Capability>> = HashMap::new();
    handlers.insert(
        "resolve_contact".to_string(),
        Arc::new(ContactDirectory { exact: true }),
    );
    handlers.insert(
        "search_contacts".to_string(),
        Arc::new(ContactDirectory { exact: false }),
    );
    for (name, summary) in [
        ("send_email", "(simulated) The email is on its way."),
        ("create_event", "(simulated) The event is on your calendar."),
        ("list_events", "(simulated) Your calendar is clear."),
        ("web_search", "(simulated) Top result: example.com."),
        ("generate_content", "(simulated) Draft ready."),
    ] {
        handlers.insert(name.to_string(), Arc::new(Echo { summary }));
    }
    handlers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("cli", "p1", "s1")
    }

    #[test]
    fn test_exact_lookup_is_case_insensitive() {
        tokio_test::block_on(async {
            let directory = ContactDirectory { exact: true };
            let found = directory
                .invoke(json!({"query": "john"}), ctx())
                .await
                .unwrap();
            assert_eq!(found["email"], "john@example.com");

            let missing = directory.invoke(json!({"query": "Zed"}), ctx()).await;
            assert_eq!(
                missing,
                Err(CapabilityError::validation("no contact named Zed"))
            );
        });
    }

    #[test]
    fn test_search_returns_every_partial_match() {
        tokio_test::block_on(async {
            let directory = ContactDirectory { exact: false };
            let found = directory.invoke(json!({"query": "a"}), ctx()).await.unwrap();
            assert_eq!(found["contacts"].as_array().unwrap().len(), 2);
        });
    }

    #[test]
    fn test_simulated_covers_shipped_catalog() {
        let handlers = simulated();
        for name in [
            "resolve_contact",
            "search_contacts",
            "send_email",
            "create_event",
            "list_events",
            "web_search",
            "generate_content",
        ] {
            assert!(handlers.contains_key(name), "{}", name);
        }
    }
}
