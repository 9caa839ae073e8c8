//! Durable per-user state: records, roles, quotas, reminders.

pub mod error;
pub mod store;
pub mod user;

pub use error::StoreError;
pub use store::{ActivitySummary, NewUser, RoleCounts, UserStore};
pub use user::{Language, UserRecord, UserRole};
