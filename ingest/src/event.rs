use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MAX_EVENT_NAME_LEN: usize = 128;
pub const MAX_USER_ID_LEN: usize = 128;
pub const MAX_CHANNEL_LEN: usize = 64;
pub const MAX_CAMPAIGN_ID_LEN: usize = 64;
pub const MAX_TAG_LEN: usize = 64;
pub const MAX_TAGS_COUNT: usize = 50;

/// An event as submitted by clients. Immutable once it enters the pipeline,
/// where it is assumed to have passed `validate_event`.
///
/// Missing fields decode to their empty value so that `validate_event`
/// reports them per field.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Event {
    #[serde(rename = "event_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "event_name")]
    pub name: String,
    pub user_id: String,
    /// Epoch seconds, UTC
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

/// Treats empty strings the same as missing values for optional fields.
pub(crate) fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Checks an event against field limits. `now` is epoch seconds and `skew`
/// is how far in the future a timestamp may be.
pub fn validate_event(event: &Event, now: i64, skew: Duration) -> Vec<FieldError> {
    let mut errors = Vec::new();

    check_required(&mut errors, "event_name", &event.name, MAX_EVENT_NAME_LEN);
    check_required(&mut errors, "user_id", &event.user_id, MAX_USER_ID_LEN);

    if event.timestamp == 0 {
        errors.push(FieldError::new(
            "timestamp",
            "required epoch seconds (UTC)",
        ));
    } else if event.timestamp > now.saturating_add(skew.as_secs() as i64) {
        errors.push(FieldError::new(
            "timestamp",
            "must not be in the future (beyond allowed skew)",
        ));
    }

    if let Some(channel) = non_empty(&event.channel) {
        check_max_len(&mut errors, "channel", channel, MAX_CHANNEL_LEN);
    }
    if let Some(campaign_id) = non_empty(&event.campaign_id) {
        check_max_len(&mut errors, "campaign_id", campaign_id, MAX_CAMPAIGN_ID_LEN);
    }

    if event.tags.len() > MAX_TAGS_COUNT {
        errors.push(FieldError::new(
            "tags",
            format!("max {MAX_TAGS_COUNT} items"),
        ));
    } else {
        for (i, tag) in event.tags.iter().enumerate() {
            let field = format!("tags[{i}]");
            if tag.is_empty() {
                errors.push(FieldError::new(field, "must be non-empty"));
            } else {
                check_max_len(&mut errors, &field, tag, MAX_TAG_LEN);
            }
        }
    }

    errors
}

fn check_required(errors: &mut Vec<FieldError>, field: &str, value: &str, max: usize) {
    if value.is_empty() {
        errors.push(FieldError::new(field, "required"));
    } else {
        check_max_len(errors, field, value, max);
    }
}

fn check_max_len(errors: &mut Vec<FieldError>, field: &str, value: &str, max: usize) {
    if value.len() > max {
        errors.push(FieldError::new(field, format!("max length {max}")));
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum BulkValidationError {
    Empty,
    TooMany(usize),
    /// Field errors keyed `events[i].field`
    Invalid(HashMap<String, Vec<String>>),
}

impl fmt::Display for BulkValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BulkValidationError::Empty => {
                write!(f, "events: required and must contain at least one item")
            }
            BulkValidationError::TooMany(max) => write!(f, "events: max {max} items"),
            BulkValidationError::Invalid(_) => write!(f, "one or more events failed validation"),
        }
    }
}

pub fn validate_bulk(
    events: &[Event],
    max_items: usize,
    now: i64,
    skew: Duration,
) -> Result<(), BulkValidationError> {
    if events.is_empty() {
        return Err(BulkValidationError::Empty);
    }
    if events.len() > max_items {
        return Err(BulkValidationError::TooMany(max_items));
    }

    let mut invalid: HashMap<String, Vec<String>> = HashMap::new();
    for (i, event) in events.iter().enumerate() {
        for error in validate_event(event, now, skew) {
            invalid
                .entry(format!("events[{i}].{}", error.field))
                .or_default()
                .push(error.message);
        }
    }

    match invalid.is_empty() {
        true => Ok(()),
        false => Err(BulkValidationError::Invalid(invalid)),
    }
}

/// Groups field errors by field name, the shape used in problem responses.
pub fn group_field_errors(errors: Vec<FieldError>) -> HashMap<String, Vec<String>> {
    let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
    for error in errors {
        grouped.entry(error.field).or_default().push(error.message);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: i64 = 1_750_000_000;
    const SKEW: Duration = Duration::from_secs(300);

    fn valid_event() -> Event {
        Event {
            name: "product_view".to_string(),
            user_id: "user_42".to_string(),
            timestamp: NOW - 10,
            channel: Some("web".to_string()),
            tags: vec!["promo".to_string()],
            ..Default::default()
        }
    }

    fn fields(errors: &[FieldError]) -> Vec<&str> {
        errors.iter().map(|e| e.field.as_str()).collect()
    }

    #[test]
    fn accepts_valid_event() {
        assert!(validate_event(&valid_event(), NOW, SKEW).is_empty());
    }

    #[test]
    fn requires_name_user_and_timestamp() {
        let event = Event::default();
        let errors = validate_event(&event, NOW, SKEW);
        assert_eq!(fields(&errors), vec!["event_name", "user_id", "timestamp"]);
    }

    #[test]
    fn rejects_future_timestamp_beyond_skew() {
        let mut event = valid_event();
        event.timestamp = NOW + 300;
        assert!(validate_event(&event, NOW, SKEW).is_empty());

        event.timestamp = NOW + 301;
        assert_eq!(fields(&validate_event(&event, NOW, SKEW)), vec!["timestamp"]);
    }

    #[test]
    fn enforces_length_limits() {
        let mut event = valid_event();
        event.name = "n".repeat(MAX_EVENT_NAME_LEN + 1);
        event.channel = Some("c".repeat(MAX_CHANNEL_LEN + 1));
        event.campaign_id = Some("x".repeat(MAX_CAMPAIGN_ID_LEN + 1));
        assert_eq!(
            fields(&validate_event(&event, NOW, SKEW)),
            vec!["event_name", "channel", "campaign_id"]
        );
    }

    #[test]
    fn empty_optional_fields_are_ignored() {
        let mut event = valid_event();
        event.channel = Some(String::new());
        event.campaign_id = Some(String::new());
        assert!(validate_event(&event, NOW, SKEW).is_empty());
    }

    #[test]
    fn checks_tags() {
        let mut event = valid_event();
        event.tags = vec![String::new(), "t".repeat(MAX_TAG_LEN + 1), "ok".to_string()];
        assert_eq!(
            fields(&validate_event(&event, NOW, SKEW)),
            vec!["tags[0]", "tags[1]"]
        );

        event.tags = vec!["t".to_string(); MAX_TAGS_COUNT + 1];
        assert_eq!(fields(&validate_event(&event, NOW, SKEW)), vec!["tags"]);
    }

    #[test]
    fn bulk_limits_and_indexes() {
        assert_eq!(
            validate_bulk(&[], 100, NOW, SKEW),
            Err(BulkValidationError::Empty)
        );
        assert_eq!(
            validate_bulk(&vec![valid_event(); 3], 2, NOW, SKEW),
            Err(BulkValidationError::TooMany(2))
        );

        let mut broken = valid_event();
        broken.user_id = String::new();
        match validate_bulk(&[valid_event(), broken], 100, NOW, SKEW) {
            Err(BulkValidationError::Invalid(errors)) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors["events[1].user_id"], vec!["required".to_string()]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn decodes_wire_names_and_rejects_unknown_fields() {
        let event: Event = serde_json::from_value(json!({
            "event_id": "evt-1",
            "event_name": "signup",
            "user_id": "u1",
            "timestamp": NOW,
            "metadata": {"plan": "pro", "seats": 3}
        }))
        .unwrap();
        assert_eq!(event.id.as_deref(), Some("evt-1"));
        assert_eq!(event.name, "signup");
        assert_eq!(event.metadata["seats"], json!(3));

        let unknown = serde_json::from_value::<Event>(json!({
            "event_name": "signup",
            "user_id": "u1",
            "timestamp": NOW,
            "surprise": true
        }));
        assert!(unknown.is_err());
    }
}
