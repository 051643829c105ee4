pub mod text_utils;
pub mod user_locks;

pub use text_utils::TextUtils;
pub use user_locks::{UserLockGuard, UserLocks};
