//! onboard-flow: employee onboarding workflows with dependency-aware task
//! tracking and automated access-request tickets.

pub mod api;
pub mod config;
pub mod error;
pub mod integration;
pub mod onboarding;
pub mod store;
pub mod templates;
pub mod users;
