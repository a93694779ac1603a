use std::path::Path;

use dashmap::DashMap;
use serde::Deserialize;
use thiserror::Error;
use ulid::Ulid;

use crate::model::Location;
use crate::policy::Role;

/// Read model of the Building → Floor → Block → Location hierarchy.
pub trait LocationCatalog: Send + Sync {
    fn get_location(&self, id: &Ulid) -> Option<Location>;
}

/// Identity provider: acting user → permission scope.
pub trait RoleDirectory: Send + Sync {
    /// Unknown users resolve to `Role::Guest`.
    fn role(&self, user_id: &Ulid) -> Role;
}

#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    locations: DashMap<Ulid, Location>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, location: Location) {
        self.locations.insert(location.id, location);
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

impl LocationCatalog for InMemoryCatalog {
    fn get_location(&self, id: &Ulid) -> Option<Location> {
        self.locations.get(id).map(|e| e.value().clone())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    roles: DashMap<Ulid, Role>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user_id: Ulid, role: Role) {
        self.roles.insert(user_id, role);
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}

impl RoleDirectory for InMemoryDirectory {
    fn role(&self, user_id: &Ulid) -> Role {
        self.roles.get(user_id).map_or(Role::Guest, |r| *r.value())
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("cannot read seed file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed seed file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("location {0} has capacity 0")]
    ZeroCapacity(Ulid),
}

#[derive(Debug, Deserialize)]
struct UserSeed {
    id: Ulid,
    #[serde(default = "guest")]
    role: Role,
}

fn guest() -> Role {
    Role::Guest
}

/// Startup snapshot of the external catalog and directory.
#[derive(Debug, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    locations: Vec<Location>,
    #[serde(default)]
    users: Vec<UserSeed>,
}

impl Seed {
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let seed: Seed = serde_json::from_str(json)?;
        if let Some(loc) = seed.locations.iter().find(|l| l.capacity == Some(0)) {
            return Err(CatalogError::ZeroCapacity(loc.id));
        }
        Ok(seed)
    }

    /// Missing file → empty seed.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        match std::fs::read_to_string(path) {
            Ok(json) => Self::from_json(&json),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "seed file not found, starting with an empty catalog");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn into_parts(self) -> (InMemoryCatalog, InMemoryDirectory) {
        let catalog = InMemoryCatalog::new();
        for location in self.locations {
            catalog.insert(location);
        }
        let directory = InMemoryDirectory::new();
        for user in self.users {
            directory.insert(user.id, user.role);
        }
        (catalog, directory)
    }
}
