//! Identity, document and encoding primitives shared by every layer.
//!
//! Everything in the presence core is addressed by an [`EntityKey`]: a
//! tenant namespace plus a numeric id. Keys are typed all the way down and
//! only rendered as strings at the transport boundary ([`Topic::to_wire`],
//! [`CacheKey`]'s `Display`).

mod codec;
mod document;
mod key;
mod time;

pub use codec::{decode, encode, CodecError, Snapshot};
pub use document::{DocValue, Document};
pub use key::{CacheKey, CacheKind, EntityKey, TenantId, Topic};
pub use time::now_ms;
