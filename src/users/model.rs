//! User directory model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of a directory user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    User,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::User => "user",
        }
    }
}

/// A person known to the directory, with free-form attributes used when
/// filling in ticket fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub name: String,
    pub role: UserRole,
    /// Arbitrary profile fields (department, manager, location, ...).
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn new(email: impl Into<String>, name: impl Into<String>, role: UserRole) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            email: email.into(),
            name: name.into(),
            role,
            attributes: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set one attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Look up a profile field by name. Core fields win over attributes.
    pub fn field(&self, key: &str) -> Option<serde_json::Value> {
        match key {
            "id" => Some(serde_json::Value::String(self.id.clone())),
            "email" => Some(serde_json::Value::String(self.email.clone())),
            "name" => Some(serde_json::Value::String(self.name.clone())),
            "role" => Some(serde_json::Value::String(self.role.as_str().to_string())),
            other => self.attributes.get(other).cloned(),
        }
    }
}

/// Body of `POST /users`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub name: String,
    #[serde(default = "default_role")]
    pub role: UserRole,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

fn default_role() -> UserRole {
    UserRole::User
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_fields_shadow_attributes() {
        let user = UserProfile::new("ada@example.com", "Ada", UserRole::User)
            .with_attribute("email", serde_json::json!("other@example.com"))
            .with_attribute("department", serde_json::json!("Platform"));
        assert_eq!(user.field("email"), Some(serde_json::json!("ada@example.com")));
        assert_eq!(user.field("department"), Some(serde_json::json!("Platform")));
        assert_eq!(user.field("manager"), None);
    }

    #[test]
    fn create_request_defaults_role() {
        let req: CreateUserRequest = serde_json::from_value(serde_json::json!({
            "email": "x@example.com",
            "name": "X"
        }))
        .unwrap();
        assert_eq!(req.role, UserRole::User);
        assert!(req.attributes.is_empty());
    }
}
