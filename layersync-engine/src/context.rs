//! Per-call operation context.
//!
//! Everything a store or engine call would otherwise read from process-wide
//! settings travels here instead.

use std::path::PathBuf;

use layersync_core::LayerName;

/// Explicit configuration passed to every mutating store and engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpContext {
    /// Layer on whose behalf the call runs; used for log context.
    pub layer: LayerName,
    /// Scratch workspace for intermediate files.
    pub workspace: PathBuf,
    /// Geographic transformation for projections, if configured.
    pub transformation: Option<String>,
}

impl OpContext {
    pub fn new(layer: impl Into<LayerName>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            layer: layer.into(),
            workspace: workspace.into(),
            transformation: None,
        }
    }

    pub fn with_transformation(mut self, transformation: Option<String>) -> Self {
        self.transformation = transformation;
        self
    }
}
