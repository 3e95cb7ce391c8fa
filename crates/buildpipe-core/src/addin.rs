//! Pluggable extension contract. Replaces the host's plugin-loading
//! machinery with an explicit registry the embedding application drives
//! directly: call [`Pipeline::register_addin`](crate::pipeline::Pipeline::register_addin)
//! once per addin at pipeline construction time, and
//! `unregister_addin` to tear one down (or let the pipeline's `Drop`
//! tripwire warn if you forget).

use async_trait::async_trait;
use std::sync::Mutex;

use crate::error::Result;
use crate::id::StageId;
use crate::pipeline::Pipeline;

/// An addin attaches one or more stages when loaded, and detaches exactly
/// those stages when unloaded.
#[async_trait]
pub trait PipelineAddin: Send + Sync {
    /// Attach this addin's stages to `pipeline`, recording their ids (via
    /// an embedded [`AddinTracker`], conventionally) so `unload` can
    /// detach them later.
    async fn load(&self, pipeline: &mut Pipeline) -> Result<()>;

    /// Detach every stage this addin attached.
    async fn unload(&self, pipeline: &mut Pipeline);
}

/// Reusable bookkeeping for the common case: an addin that just needs to
/// remember the ids it attached so `unload` can detach them.
#[derive(Default)]
pub struct AddinTracker {
    ids: Mutex<Vec<StageId>>,
}

impl AddinTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, id: StageId) {
        if id.is_valid() {
            self.ids.lock().unwrap().push(id);
        }
    }

    pub fn detach_all(&self, pipeline: &mut Pipeline) {
        for id in self.ids.lock().unwrap().drain(..) {
            pipeline.detach(id);
        }
    }
}
