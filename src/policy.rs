use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Category of a location. Gates which roles may book it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Regular,
    Lab,
    Special,
}

impl ResourceType {
    pub const ALL: [ResourceType; 3] = [ResourceType::Regular, ResourceType::Lab, ResourceType::Special];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::Regular => "regular",
            ResourceType::Lab => "lab",
            ResourceType::Special => "special",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "regular" => Ok(ResourceType::Regular),
            "lab" => Ok(ResourceType::Lab),
            "special" => Ok(ResourceType::Special),
            other => Err(format!("unknown resource type: {other}")),
        }
    }
}

/// Permission scope of a user, ordered from least to most privileged.
///
/// Deployment labels are mapped once, at the directory boundary, by
/// `Role::from_label`; an unrecognised or missing label is `Guest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    Guest,
    Student,
    Staff,
    Admin,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Guest, Role::Student, Role::Staff, Role::Admin];

    pub fn from_label(label: &str) -> Role {
        match label.trim().to_ascii_lowercase().as_str() {
            "student" => Role::Student,
            "staff" | "teacher" | "lecturer" => Role::Staff,
            "admin" => Role::Admin,
            _ => Role::Guest,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Guest => "guest",
            Role::Student => "student",
            Role::Staff => "staff",
            Role::Admin => "admin",
        }
    }
}

impl From<String> for Role {
    fn from(label: String) -> Self {
        Role::from_label(&label)
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who may book what, and who may resolve pending bookings.
///
/// Implementations must be pure: same inputs, same answer, no store access.
pub trait BookingPolicy: Send + Sync {
    fn available_resource_types(&self, role: Role) -> BTreeSet<ResourceType>;

    fn can_book(&self, role: Role, resource_type: ResourceType) -> bool {
        self.available_resource_types(role).contains(&resource_type)
    }

    /// Approve/reject is admin scope.
    fn can_resolve(&self, role: Role) -> bool {
        role == Role::Admin
    }
}

/// The default role → resource-type table.
#[derive(Debug, Clone, Copy, Default)]
pub struct RolePolicy;

impl BookingPolicy for RolePolicy {
    fn available_resource_types(&self, role: Role) -> BTreeSet<ResourceType> {
        use ResourceType::*;
        let allowed: &[ResourceType] = match role {
            Role::Guest | Role::Student => &[Regular],
            Role::Staff => &[Regular, Lab],
            Role::Admin => &[Regular, Lab, Special],
        };
        allowed.iter().copied().collect()
    }

    fn can_book(&self, role: Role, resource_type: ResourceType) -> bool {
        match (role, resource_type) {
            (Role::Admin, _) => true,
            (Role::Staff, ResourceType::Regular | ResourceType::Lab) => true,
            (Role::Guest | Role::Student, ResourceType::Regular) => true,
            _ => false,
        }
    }
}
