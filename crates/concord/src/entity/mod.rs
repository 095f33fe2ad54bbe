//! Domain aggregates: contacts with their devices, groups with their
//! memberships, and per-entity appendix documents.

mod appendix;
mod contact;
mod group;

pub use appendix::{Appendix, AppendixOwner};
pub use contact::{Contact, Device, SessionToken, TokenDevice};
pub use group::{Group, GroupBundle, GroupChanges, GroupMember, GroupState, NewGroup};
