//! Pure formatters turning events into sink-ready messages.

use coda_domain::{Event, Severity};

/// A sink-agnostic rich message: sinks map it onto embeds or blocks,
/// falling back to `plain` when they cannot.
#[derive(Debug, Clone)]
pub struct RichMessage {
    pub title: String,
    pub body: String,
    /// Hex color keyed on severity.
    pub color: &'static str,
    pub fields: Vec<(String, String)>,
    pub plain: String,
}

pub fn severity_color(severity: Severity) -> &'static str {
    match severity {
        Severity::High => "#FF0000",
        Severity::Medium => "#FF8C00",
        Severity::Low => "#3498DB",
    }
}

/// Format an event for delivery. Known event types get a tailored shape,
/// everything else the generic one.
pub fn format_event(event: &Event) -> RichMessage {
    match event.event_type.as_str() {
        "alert.system.dead_letter" => dead_letter_format(event),
        "alert.system.abuse" => abuse_format(event),
        _ => default_format(event),
    }
}

fn payload_str<'a>(event: &'a Event, key: &str) -> Option<&'a str> {
    event.payload.get(key).and_then(|v| v.as_str())
}

fn title_from_type(event_type: &str) -> String {
    // "alert.email.urgent" reads as "Email urgent".
    let rest = event_type.strip_prefix("alert.").unwrap_or(event_type);
    let text = rest.replace(['.', '_'], " ");
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => text,
    }
}

fn default_format(event: &Event) -> RichMessage {
    let title = title_from_type(&event.event_type);
    let body = payload_str(event, "message")
        .or_else(|| payload_str(event, "summary"))
        .map(str::to_string)
        .unwrap_or_else(|| serde_json::to_string(&event.payload).unwrap_or_default());
    let fields = vec![("Source".to_string(), event.source_skill.clone())];
    let plain = format!("[{}] {title}: {body}", event.source_skill);
    RichMessage {
        title,
        body,
        color: severity_color(event.severity),
        fields,
        plain,
    }
}

fn dead_letter_format(event: &Event) -> RichMessage {
    let handler = payload_str(event, "handler").unwrap_or("?");
    let error = payload_str(event, "error").unwrap_or("?");
    let original = payload_str(event, "event_type").unwrap_or("?");
    let plain = format!("Dead letter: {original} handler {handler} exhausted retries ({error})");
    RichMessage {
        title: "Event dead-lettered".into(),
        body: format!("Handler `{handler}` exhausted its retries for `{original}`."),
        color: severity_color(event.severity),
        fields: vec![
            ("Handler".to_string(), handler.to_string()),
            ("Error".to_string(), error.to_string()),
        ],
        plain,
    }
}

fn abuse_format(event: &Event) -> RichMessage {
    let user = payload_str(event, "user_id").unwrap_or("?");
    let plain = format!("Confirmation abuse detected for user {user}");
    RichMessage {
        title: "Confirmation abuse detected".into(),
        body: format!("User `{user}` exceeded the invalid-confirmation threshold."),
        color: severity_color(event.severity),
        fields: vec![("User".to_string(), user.to_string())],
        plain,
    }
}
