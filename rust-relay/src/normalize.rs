//! Inbound payload classification and normalization.
//!
//! Two body shapes are accepted on the POST endpoint:
//!
//! ```text
//! Ghost webhook:  {"member": {"current": {...}, "previous": {...}}}  or  {"member": {...}}
//! Direct call:    {"email": "...", "status": "...", ...extra}
//! ```
//!
//! Both end up as a [`SubscriberEvent`].

use axum::http::HeaderMap;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::RelayError;
use crate::event::{invalid_status, Metadata, SubscriberEvent, SubscriberStatus};

/// Header Ghost uses to name the webhook event.
pub const GHOST_EVENT_HEADER: &str = "x-ghost-event";

/// Source tag attached to events that came from a Ghost webhook.
pub const GHOST_SOURCE: &str = "ghost-webhook";

const MISSING_EMAIL: &str =
    "Missing email. Expected either \"email\" field or \"member.email\" field";

const INVALID_EMAIL: &str = "Invalid email format";

/// The two recognised body shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundPayload {
    Webhook(GhostMember),
    Direct(DirectCall),
}

/// Member fields pulled out of a Ghost webhook body.
#[derive(Debug, Clone, PartialEq)]
pub struct GhostMember {
    pub email: String,
    pub name: Value,
    /// Raw Ghost lifecycle state (`free`, `paid`, `comped`, ...)
    pub status: Value,
    pub deleted: bool,
    pub subscribed: Value,
    pub uuid: Value,
    pub id: Value,
}

/// A flat `{email, status?, ...}` call.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectCall {
    pub email: String,
    pub status: Option<Value>,
    pub extra: Metadata,
}

/// Decide which shape a parsed body has.
pub fn classify(body: &Value) -> Result<InboundPayload, RelayError> {
    if let Some(member) = member_object(body) {
        if let Some(email) = email_field(member.get("email"))? {
            return Ok(InboundPayload::Webhook(GhostMember {
                email: email.to_string(),
                name: field(member, "name"),
                status: field(member, "status"),
                deleted: member.get("deleted").map(is_truthy).unwrap_or(false),
                subscribed: field(member, "subscribed"),
                uuid: field(member, "uuid"),
                id: field(member, "id"),
            }));
        }
    }

    let Some(object) = body.as_object() else {
        return Err(RelayError::validation(MISSING_EMAIL));
    };

    let Some(email) = email_field(object.get("email"))? else {
        return Err(RelayError::validation(MISSING_EMAIL));
    };

    let mut extra = object.clone();
    extra.remove("email");
    let status = extra.remove("status").filter(|s| !s.is_null());

    Ok(InboundPayload::Direct(DirectCall {
        email: email.to_string(),
        status,
        extra,
    }))
}

/// Turn a parsed request body into a validated [`SubscriberEvent`].
pub fn normalize(body: &Value, headers: &HeaderMap) -> Result<SubscriberEvent, RelayError> {
    let ghost_event = headers
        .get(GHOST_EVENT_HEADER)
        .and_then(|v| v.to_str().ok());

    let event = match classify(body)? {
        InboundPayload::Webhook(member) => {
            let status = derive_webhook_status(&member, ghost_event);
            info!(
                ghost_event = ghost_event.unwrap_or(""),
                email = %member.email,
                status = %status,
                "ghost_webhook_normalized"
            );
            let metadata = webhook_metadata(&member, ghost_event);
            validate_email(&member.email)?;
            SubscriberEvent::new(member.email, status, metadata)
        }
        InboundPayload::Direct(call) => {
            let status = match &call.status {
                None => SubscriberStatus::Confirmed,
                Some(Value::String(s)) => s.parse()?,
                Some(_) => return Err(invalid_status()),
            };
            info!(email = %call.email, status = %status, "direct_call_normalized");
            validate_email(&call.email)?;
            SubscriberEvent::new(call.email, status, call.extra)
        }
    };

    Ok(event)
}

/// Derive the SparkLoop status for a Ghost member.
///
/// The member's lifecycle state sets the base status. A delete/unsubscribe
/// event always wins. For add/update events an explicit `subscribed: false`
/// forces `unsubscribed`; otherwise the base status stands.
pub fn derive_webhook_status(member: &GhostMember, ghost_event: Option<&str>) -> SubscriberStatus {
    let base = match member.status.as_str() {
        Some("free") | Some("paid") | Some("comped") => SubscriberStatus::Confirmed,
        Some("cancelled") => SubscriberStatus::Unsubscribed,
        _ if member.deleted => SubscriberStatus::Unsubscribed,
        _ => SubscriberStatus::Confirmed,
    };

    match ghost_event {
        Some("member.deleted") | Some("member.unsubscribed") => SubscriberStatus::Unsubscribed,
        Some("member.added") | Some("member.updated") => {
            if member.subscribed == Value::Bool(false) {
                SubscriberStatus::Unsubscribed
            } else {
                debug!(base = %base, "ghost_add_update_keeps_base_status");
                base
            }
        }
        _ => base,
    }
}

fn webhook_metadata(member: &GhostMember, ghost_event: Option<&str>) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("name".into(), member.name.clone());
    metadata.insert("ghost_status".into(), member.status.clone());
    metadata.insert(
        "ghost_event".into(),
        ghost_event.map(|e| Value::String(e.to_string())).unwrap_or(Value::Null),
    );
    metadata.insert("subscribed".into(), member.subscribed.clone());
    metadata.insert("source".into(), Value::String(GHOST_SOURCE.to_string()));
    metadata.insert("ghost_uuid".into(), member.uuid.clone());
    metadata.insert("ghost_id".into(), member.id.clone());
    metadata
}

/// Basic `local@domain.tld` shape check.
pub fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };

    let clean = |s: &str| !s.is_empty() && !s.chars().any(|c| c.is_whitespace() || c == '@');
    if !clean(local) || !clean(domain) {
        return false;
    }

    // Needs a non-empty label on both sides of some dot.
    domain
        .char_indices()
        .filter(|&(_, c)| c == '.')
        .any(|(i, _)| i > 0 && i + 1 < domain.len())
}

fn validate_email(email: &str) -> Result<(), RelayError> {
    if is_valid_email(email) {
        Ok(())
    } else {
        Err(RelayError::validation(INVALID_EMAIL))
    }
}

/// `member.current` when it is an object, else `member` itself.
fn member_object(body: &Value) -> Option<&Map<String, Value>> {
    let member = body.get("member")?;
    match member.get("current") {
        Some(Value::Object(current)) => Some(current),
        _ => member.as_object(),
    }
}

fn field(object: &Map<String, Value>, key: &str) -> Value {
    object.get(key).cloned().unwrap_or(Value::Null)
}

/// A present `email` field. Falsy values count as absent; any other
/// non-string value is a malformed address.
fn email_field(value: Option<&Value>) -> Result<Option<&str>, RelayError> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Ok(Some(s.as_str())),
        Some(other) if is_truthy(other) => Err(RelayError::validation(INVALID_EMAIL)),
        _ => Ok(None),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
