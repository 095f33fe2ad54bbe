use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A tenant (domain) namespace. Ids are only unique within one tenant.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(Arc<str>);

impl TenantId {
    /// Creates a tenant id from its name.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// Returns the tenant name.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TenantId({})", self.0)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Tenant-qualified identity of a contact or group.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    /// Owning tenant.
    pub tenant: TenantId,
    /// Id within the tenant.
    pub id: u64,
}

impl EntityKey {
    /// Creates a key from a tenant and id.
    pub fn new(tenant: impl Into<TenantId>, id: u64) -> Self {
        Self {
            tenant: tenant.into(),
            id,
        }
    }

    /// Returns a key for another entity in the same tenant.
    pub fn sibling(&self, id: u64) -> Self {
        Self {
            tenant: self.tenant.clone(),
            id,
        }
    }

    /// Returns the event topic addressed by this key.
    pub fn topic(&self) -> Topic {
        Topic(self.clone())
    }
}

impl fmt::Debug for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityKey({}_{})", self.id, self.tenant)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.id, self.tenant)
    }
}

/// Event bus address of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic(pub EntityKey);

impl Topic {
    /// Renders the topic for the transport (`"{id}_{tenant}"`).
    pub fn to_wire(&self) -> String {
        self.0.to_string()
    }

    /// Parses a wire topic. The id is numeric so the first `_` separates it
    /// from a tenant name that may itself contain underscores.
    pub fn from_wire(s: &str) -> Option<Self> {
        let (id, tenant) = s.split_once('_')?;
        if tenant.is_empty() {
            return None;
        }
        let id = id.parse().ok()?;
        Some(Self(EntityKey::new(tenant, id)))
    }

    /// Returns the key this topic addresses.
    pub fn key(&self) -> &EntityKey {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which slot of the cache an entry lives in. Contacts and groups draw ids
/// from separate sequences, so each has its own slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheKind {
    /// A contact snapshot.
    Contact,
    /// A group snapshot.
    Group,
    /// A group's appendix document.
    GroupAppendix,
}

/// Key of one cluster cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Slot kind.
    pub kind: CacheKind,
    /// Entity the entry belongs to.
    pub key: EntityKey,
}

impl CacheKey {
    /// Key of a contact snapshot.
    pub fn contact(key: &EntityKey) -> Self {
        Self {
            kind: CacheKind::Contact,
            key: key.clone(),
        }
    }

    /// Key of a group snapshot.
    pub fn group(key: &EntityKey) -> Self {
        Self {
            kind: CacheKind::Group,
            key: key.clone(),
        }
    }

    /// Key of a group's appendix.
    pub fn group_appendix(key: &EntityKey) -> Self {
        Self {
            kind: CacheKind::GroupAppendix,
            key: key.clone(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            CacheKind::Contact => write!(f, "contact_{}", self.key),
            CacheKind::Group => write!(f, "group_{}", self.key),
            CacheKind::GroupAppendix => write!(f, "group_appendix_{}", self.key),
        }
    }
}
