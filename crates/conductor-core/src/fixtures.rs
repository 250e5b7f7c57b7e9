//! Shared test catalog

use std::time::Duration;

use crate::capability::{
    CapabilityDescriptor, CapabilityRegistry, IdentityKind, ParamKind, ParamSpec,
};

pub(crate) fn resolve_contact() -> CapabilityDescriptor {
    CapabilityDescriptor::new("resolve_contact")
        .with_label("look up a contact")
        .with_keywords(&["who is", "resolve contact", "contact for"])
        .with_params(vec![ParamSpec::new("query", ParamKind::String)
            .required()
            .with_cues(&["for"])])
        .with_identity_provider(IdentityKind::Email, "query", "email")
}

pub(crate) fn search_contacts() -> CapabilityDescriptor {
    CapabilityDescriptor::new("search_contacts")
        .with_label("search your contacts")
        .with_keywords(&["search contacts", "contacts", "find contact", "phone number"])
        .with_params(vec![ParamSpec::new("query", ParamKind::String)
            .required()
            .with_cues(&["for", "named"])])
}

pub(crate) fn send_email() -> CapabilityDescriptor {
    CapabilityDescriptor::new("send_email")
        .with_label("send an email")
        .with_keywords(&["email", "send", "mail", "write to"])
        .with_params(vec![
            ParamSpec::new("to", ParamKind::Identity(IdentityKind::Email))
                .required()
                .with_cues(&["to"]),
            ParamSpec::new("subject", ParamKind::Text)
                .required()
                .with_cues(&["about", "regarding"]),
            ParamSpec::new("body", ParamKind::Text).with_cues(&["saying"]),
        ])
        .mutating()
        .with_auth("google")
        .with_timeout(Duration::from_secs(20))
}

pub(crate) fn create_event() -> CapabilityDescriptor {
    CapabilityDescriptor::new("create_event")
        .with_label("create a calendar event")
        .with_keywords(&["schedule", "meeting", "calendar event", "book", "invite"])
        .with_params(vec![
            ParamSpec::new("title", ParamKind::Text)
                .required()
                .with_cues(&["called", "titled"]),
            ParamSpec::new("attendee", ParamKind::Identity(IdentityKind::Email))
                .with_cues(&["with"]),
            ParamSpec::new("when", ParamKind::String).with_cues(&["on", "at"]),
        ])
        .mutating()
        .with_auth("google")
}

pub(crate) fn list_events() -> CapabilityDescriptor {
    CapabilityDescriptor::new("list_events")
        .with_label("check your calendar")
        .with_keywords(&["my calendar", "what's on", "agenda", "events"])
        .with_params(vec![ParamSpec::new("when", ParamKind::String).with_cues(&["on", "for"])])
        .with_auth("google")
}

pub(crate) fn web_search() -> CapabilityDescriptor {
    CapabilityDescriptor::new("web_search")
        .with_label("search the web")
        .with_keywords(&["search the web", "look up", "weather", "news", "google"])
        .with_params(vec![ParamSpec::new("query", ParamKind::Text)
            .required()
            .with_cues(&["for", "about"])])
}

pub(crate) fn generate_content() -> CapabilityDescriptor {
    CapabilityDescriptor::new("generate_content")
        .with_label("draft some content")
        .with_keywords(&["write", "draft", "compose", "summarize", "generate"])
        .with_params(vec![ParamSpec::new("prompt", ParamKind::Text)
            .required()
            .with_cues(&["about"])])
}

/// The default catalog, declared without handlers
pub(crate) fn sample_registry() -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    for descriptor in [
        resolve_contact(),
        search_contacts(),
        send_email(),
        create_event(),
        list_events(),
        web_search(),
        generate_content(),
    ] {
        if let Err(err) = registry.declare(descriptor) {
            panic!("fixture catalog is invalid: {err}");
        }
    }
    registry
}
