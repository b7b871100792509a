//! Ticket payload shaping.
//!
//! Turns a template's field mappings plus a user profile into the
//! `requestFieldValues` object the Service Desk expects. Pure.

use serde_json::{Map, Value, json};
use tracing::debug;

use super::TicketRequest;
use crate::templates::model::{FieldMapping, MappingKind, TaskConfig};
use crate::users::model::UserProfile;

/// Build the full ticket request for an automated task, or `None` for any
/// other task kind.
pub fn build_ticket_request(config: &TaskConfig, profile: &UserProfile) -> Option<TicketRequest> {
    match config {
        TaskConfig::AutomatedAccessRequest {
            service_desk_id,
            request_type_id,
            field_mappings,
        } => Some(TicketRequest {
            service_desk_id: service_desk_id.clone(),
            request_type_id: request_type_id.clone(),
            request_field_values: format_payload(field_mappings, profile),
        }),
        _ => None,
    }
}

/// Resolve and shape every mapped field. Dynamic mappings that name a field
/// the profile does not have are left out.
pub fn format_payload<'a, I>(mappings: I, profile: &UserProfile) -> Map<String, Value>
where
    I: IntoIterator<Item = (&'a String, &'a FieldMapping)>,
{
    let mut values = Map::new();
    for (field_id, mapping) in mappings {
        let raw = match mapping.kind {
            MappingKind::Static => Some(mapping.value.clone()),
            MappingKind::Dynamic => mapping
                .value
                .as_str()
                .and_then(|key| profile.field(key)),
        };
        let Some(raw) = raw else {
            debug!(field = %field_id, "Profile has no value for dynamic field; skipped");
            continue;
        };
        values.insert(field_id.clone(), shape(mapping, raw));
    }
    values
}

fn shape(mapping: &FieldMapping, value: Value) -> Value {
    let Some(schema) = &mapping.jira_schema else {
        return value;
    };
    let items = schema.items.as_deref();
    match (schema.kind.as_str(), items) {
        ("array", Some("user")) => Value::Array(as_list(value).into_iter().map(user_ref).collect()),
        ("user", _) => user_ref(value),
        ("array", Some("option")) => {
            Value::Array(as_list(value).into_iter().map(option_ref).collect())
        }
        ("option", _) => option_ref(value),
        ("array", _) => Value::Array(as_list(value)),
        _ => value,
    }
}

fn as_list(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        other => vec![other],
    }
}

fn user_ref(value: Value) -> Value {
    json!({ "name": value })
}

/// Numeric values select an option by id, anything else by value.
fn option_ref(value: Value) -> Value {
    match numeric_text(&value) {
        Some(id) => json!({ "id": id }),
        None => json!({ "value": value }),
    }
}

fn numeric_text(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => {
            let trimmed = s.trim();
            let parsed: f64 = trimmed.parse().ok()?;
            parsed.is_finite().then(|| trimmed.to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::templates::model::FieldSchema;
    use crate::users::model::UserRole;

    fn mapping(kind: MappingKind, value: Value, schema: Option<(&str, Option<&str>)>) -> FieldMapping {
        FieldMapping {
            kind,
            value,
            jira_schema: schema.map(|(k, items)| FieldSchema {
                kind: k.to_string(),
                items: items.map(str::to_string),
            }),
        }
    }

    fn profile() -> UserProfile {
        UserProfile::new("ada@example.com", "Ada", UserRole::User)
            .with_attribute("username", json!("alovelace"))
            .with_attribute("groups", json!(["eng", "ops"]))
            .with_attribute("cost_center", json!(4100))
    }

    #[test]
    fn static_and_dynamic_values_without_schema_pass_through() {
        let mut mappings = BTreeMap::new();
        mappings.insert("summary".to_string(), mapping(MappingKind::Static, json!("New laptop"), None));
        mappings.insert("customfield_1".to_string(), mapping(MappingKind::Dynamic, json!("email"), None));

        let values = format_payload(&mappings, &profile());
        assert_eq!(values["summary"], json!("New laptop"));
        assert_eq!(values["customfield_1"], json!("ada@example.com"));
    }

    #[test]
    fn user_schemas_wrap_names() {
        let mut mappings = BTreeMap::new();
        mappings.insert(
            "reporter".to_string(),
            mapping(MappingKind::Dynamic, json!("username"), Some(("user", None))),
        );
        mappings.insert(
            "watchers".to_string(),
            mapping(MappingKind::Static, json!(["bob", "eve"]), Some(("array", Some("user")))),
        );
        mappings.insert(
            "approvers".to_string(),
            mapping(MappingKind::Dynamic, json!("username"), Some(("array", Some("user")))),
        );

        let values = format_payload(&mappings, &profile());
        assert_eq!(values["reporter"], json!({"name": "alovelace"}));
        assert_eq!(values["watchers"], json!([{"name": "bob"}, {"name": "eve"}]));
        assert_eq!(values["approvers"], json!([{"name": "alovelace"}]));
    }

    #[test]
    fn option_schemas_pick_id_or_value() {
        let mut mappings = BTreeMap::new();
        mappings.insert(
            "priority".to_string(),
            mapping(MappingKind::Static, json!("3"), Some(("option", None))),
        );
        mappings.insert(
            "site".to_string(),
            mapping(MappingKind::Static, json!("Berlin"), Some(("option", None))),
        );
        mappings.insert(
            "cost".to_string(),
            mapping(MappingKind::Dynamic, json!("cost_center"), Some(("option", None))),
        );
        mappings.insert(
            "tools".to_string(),
            mapping(MappingKind::Static, json!([10, "Slack"]), Some(("array", Some("option")))),
        );

        let values = format_payload(&mappings, &profile());
        assert_eq!(values["priority"], json!({"id": "3"}));
        assert_eq!(values["site"], json!({"value": "Berlin"}));
        assert_eq!(values["cost"], json!({"id": "4100"}));
        assert_eq!(values["tools"], json!([{"id": "10"}, {"value": "Slack"}]));
    }

    #[test]
    fn plain_arrays_wrap_scalars() {
        let mut mappings = BTreeMap::new();
        mappings.insert(
            "labels".to_string(),
            mapping(MappingKind::Static, json!("onboarding"), Some(("array", Some("string")))),
        );
        mappings.insert(
            "groups".to_string(),
            mapping(MappingKind::Dynamic, json!("groups"), Some(("array", Some("string")))),
        );
        mappings.insert(
            "due".to_string(),
            mapping(MappingKind::Static, json!("2026-01-01"), Some(("date", None))),
        );

        let values = format_payload(&mappings, &profile());
        assert_eq!(values["labels"], json!(["onboarding"]));
        assert_eq!(values["groups"], json!(["eng", "ops"]));
        assert_eq!(values["due"], json!("2026-01-01"));
    }

    #[test]
    fn missing_profile_fields_are_skipped() {
        let mut mappings = BTreeMap::new();
        mappings.insert(
            "manager".to_string(),
            mapping(MappingKind::Dynamic, json!("manager"), Some(("user", None))),
        );
        assert!(format_payload(&mappings, &profile()).is_empty());
    }

    #[test]
    fn ticket_request_only_for_automated_configs() {
        assert!(build_ticket_request(&TaskConfig::Manual, &profile()).is_none());

        let config = TaskConfig::AutomatedAccessRequest {
            service_desk_id: "4".into(),
            request_type_id: "17".into(),
            field_mappings: BTreeMap::new(),
        };
        let request = build_ticket_request(&config, &profile()).unwrap();
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["serviceDeskId"], "4");
        assert_eq!(json["requestTypeId"], "17");
        assert_eq!(json["requestFieldValues"], json!({}));
    }
}
