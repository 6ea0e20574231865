//! Logging setup and structured event helpers.

pub mod tracing_setup;

pub use tracing_setup::{OperationTimer, TracingConfig};

use crate::registry::ContainerId;

/// Log a container lifecycle event
pub fn log_container_event(container_id: &ContainerId, event: &str, name: &str) {
    tracing::info!(
        container_id = %container_id.short(),
        name = %name,
        event = %event,
        "Container lifecycle event"
    );
}

/// Log an image event
pub fn log_image_event(reference: &str, event: &str, details: Option<&str>) {
    tracing::info!(
        image = %reference,
        event = %event,
        details = ?details,
        "Image event"
    );
}
