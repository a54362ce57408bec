//! Usage agent library
//!
//! This crate provides the core functionality for:
//! - Hourly usage collection from a Prometheus-compatible backend
//! - Packaging reports into size-bounded archives with a manifest
//! - Credential resolution and archive upload to the ingestion service
//! - Source registration with the sources API
//! - Health checks and observability

pub mod auth;
pub mod collector;
pub mod cycle;
pub mod dirconfig;
pub mod health;
pub mod http;
pub mod models;
pub mod observability;
pub mod packaging;
pub mod pipeline;
pub mod sources;
pub mod status;
pub mod upload;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{PipelineMetrics, StructuredLogger};
pub use pipeline::{PassOutcome, Pipeline, PipelineConfig, PipelineError};
pub use status::StatusStore;
