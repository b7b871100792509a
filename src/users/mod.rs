//! User directory: the profiles automated tickets are filled in from.

pub mod model;
pub mod routes;

pub use model::{CreateUserRequest, UserProfile, UserRole};
pub use routes::{UserRouteState, user_routes};
