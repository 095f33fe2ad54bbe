use crate::core::{Document, EntityKey};
use serde::{Deserialize, Serialize};

/// Entity an appendix belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppendixOwner {
    /// A contact's appendix.
    Contact(EntityKey),
    /// A group's appendix.
    Group(EntityKey),
}

impl AppendixOwner {
    /// Key of the owning entity.
    pub fn key(&self) -> &EntityKey {
        match self {
            Self::Contact(key) | Self::Group(key) => key,
        }
    }
}

/// Auxiliary per-entity document, persisted apart from the entity itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appendix {
    /// Owning entity.
    pub owner: AppendixOwner,
    /// Appendix content.
    pub data: Document,
    /// Last update time.
    pub timestamp: u64,
}

impl Appendix {
    /// Creates an empty appendix for `owner`.
    pub fn empty(owner: AppendixOwner) -> Self {
        Self {
            owner,
            data: Document::new(),
            timestamp: 0,
        }
    }
}
