//! Per-user token cache.
//!
//! A [`TokenCacheStore`] keeps one opaque blob per user object identifier.
//! [`UserTokenCache`] is the confidential client's view of that blob: it is
//! loaded from the store before access and written back wholesale after
//! tokens change.

pub mod file;
pub mod store;
pub mod token_cache;

pub use file::FileTokenCacheStore;
pub use store::{MemoryTokenCacheStore, TokenCacheBlob, TokenCacheStore};
pub use token_cache::{CachedAccessToken, CachedAccount, TokenCacheData, UserTokenCache};
