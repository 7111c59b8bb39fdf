//! Access and refresh token handling

pub mod claims;
pub mod storage;
pub mod store;

pub use claims::{Claims, DecodeError, decode_claims};
pub use storage::{FileStorage, MemoryStorage, RefreshStorage, StorageError};
pub use store::TokenStore;
