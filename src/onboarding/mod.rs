//! Onboarding instances: creation from templates, task status transitions
//! with dependency cascades, and the automated ticket executor.

pub mod cascade;
pub mod engine;
pub mod executor;
pub mod graph;
pub mod model;
pub mod resolver;
pub mod routes;

pub use cascade::{CascadeEffect, TaskChange, TransitionPlan, plan_transition};
pub use engine::OnboardingEngine;
pub use executor::{DryRun, TaskExecutor};
pub use graph::DependencyGraph;
pub use model::{InstanceStatus, OnboardingInstance, TaskInstance, TaskStatus, TaskStatusUpdate};
pub use routes::{OnboardingRouteState, onboarding_routes};
