//! Shared component container for the dispatch runtime.

use crate::{
    extension::ExtensionRegistry, regulation::RegulationLoop, stat::StatRegistry,
    transport::Transport,
};
use std::sync::Arc;

/// Components shared by every consumer of one runtime.
///
/// All components are wrapped in `Arc` and safe to clone and share across tasks.
#[derive(Clone)]
pub struct RuntimeComponents {
    extensions: Arc<ExtensionRegistry>,
    transport: Arc<dyn Transport>,
    stats: Arc<StatRegistry>,
    regulation: Option<Arc<RegulationLoop>>,
}

impl RuntimeComponents {
    /// Creates a new components container.
    ///
    /// Called by `DispatchRuntimeBuilder` during initialization.
    #[must_use]
    pub fn new(
        extensions: Arc<ExtensionRegistry>,
        transport: Arc<dyn Transport>,
        stats: Arc<StatRegistry>,
        regulation: Option<Arc<RegulationLoop>>,
    ) -> Self {
        Self { extensions, transport, stats, regulation }
    }

    #[must_use]
    pub fn extensions(&self) -> &Arc<ExtensionRegistry> {
        &self.extensions
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<StatRegistry> {
        &self.stats
    }

    /// Returns the regulation loop, if regulation is configured and enabled.
    #[must_use]
    pub fn regulation(&self) -> Option<&Arc<RegulationLoop>> {
        self.regulation.as_ref()
    }

    #[must_use]
    pub fn has_regulation(&self) -> bool {
        self.regulation.is_some()
    }

    /// Share of static weight given to recovering endpoints. Full weight without regulation.
    #[must_use]
    pub fn probe_share(&self) -> f64 {
        self.regulation.as_ref().map_or(1.0, |r| r.config().probe_share)
    }
}
