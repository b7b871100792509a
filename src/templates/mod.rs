//! Template store: reusable task templates and the onboarding templates that
//! bundle them.

pub mod model;
pub mod routes;
pub mod service;

pub use model::{OnboardingTemplate, TaskConfig, TaskTemplate, TaskType};
pub use routes::{TemplateRouteState, template_routes};
pub use service::{OnboardingTemplateInput, TaskTemplateInput, TemplateService};
