use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Staff roles known to the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Receptionist,
    Accountant,
    LabTechnician,
    InventoryManager,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Admin,
        Role::Receptionist,
        Role::Accountant,
        Role::LabTechnician,
        Role::InventoryManager,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Receptionist => "receptionist",
            Role::Accountant => "accountant",
            Role::LabTechnician => "lab_technician",
            Role::InventoryManager => "inventory_manager",
        }
    }

    /// `None` for role strings this build does not know
    pub fn parse(raw: &str) -> Option<Role> {
        let raw = raw.trim();
        Role::ALL.into_iter().find(|role| role.as_str() == raw)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimal identity kept on the device for offline sign-in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineIdentity {
    /// Identity provider user id
    pub id: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    /// Raw role string as issued by the identity provider
    pub role: String,
    pub last_updated: DateTime<Utc>,
}

impl OfflineIdentity {
    pub fn new(id: impl Into<String>, email: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            first_name: None,
            last_name: None,
            role: role.as_str().to_string(),
            last_updated: Utc::now(),
        }
    }

    pub fn with_name(mut self, first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        self.first_name = Some(first_name.into());
        self.last_name = Some(last_name.into());
        self
    }

    /// Parsed role; an unknown role means the identity grants nothing
    pub fn role(&self) -> Option<Role> {
        Role::parse(&self.role)
    }

    /// Lowercased part of the email before `@`
    pub fn email_local_part(&self) -> String {
        self.email
            .split('@')
            .next()
            .unwrap_or_default()
            .trim()
            .to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parsing() {
        for role in Role::ALL {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse(" lab_technician "), Some(Role::LabTechnician));
        assert_eq!(Role::parse("doctor"), None);
        assert_eq!(Role::parse(""), None);

        let json = serde_json::to_string(&Role::InventoryManager).unwrap();
        assert_eq!(json, "\"inventory_manager\"");
    }

    #[test]
    fn test_identity_helpers() {
        let identity = OfflineIdentity::new("user_1", "Reception.Desk@Example.com", Role::Receptionist);
        assert_eq!(identity.role(), Some(Role::Receptionist));
        assert_eq!(identity.email_local_part(), "reception.desk");

        let named = identity.with_name("Sadia", "Islam");
        assert_eq!(named.first_name.as_deref(), Some("Sadia"));
        assert_eq!(named.last_name.as_deref(), Some("Islam"));

        let mut unknown = named;
        unknown.role = "superuser".to_string();
        assert_eq!(unknown.role(), None);
    }
}
