//! Authentication for the Tierlock API

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtManager};
pub use middleware::{require_auth, require_internal_secret, AuthError, AuthUser};
