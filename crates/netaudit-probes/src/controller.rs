//! Interception controller
//!
//! Tracks which probe categories are loaded and keeps the set of attached
//! interception points consistent with it. Every operation runs under one
//! mutex, so concurrent enable/disable calls never interleave.
//!
//! Hooks read the loaded categories through [`LoadedProbes`], which has its
//! own lock and is only written while the controller mutex is held.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::backend::ProbeBackend;
use crate::category::{ProbeCategory, ProbePoint, CLOSE_CATEGORIES, PLANT_ORDER};
use crate::error::{AttachError, ProbeError, ProbeResult};

/// Loaded categories as seen by hooks
#[derive(Debug, Default)]
pub struct LoadedProbes {
    mask: RwLock<ProbeCategory>,
}

impl LoadedProbes {
    pub fn get(&self) -> ProbeCategory {
        *self.mask.read()
    }

    pub(crate) fn set(&self, mask: ProbeCategory) {
        *self.mask.write() = mask;
    }
}

#[derive(Default)]
struct ControllerState {
    loaded: ProbeCategory,
    attached: HashSet<ProbePoint>,
}

pub struct ProbeController {
    backend: Arc<dyn ProbeBackend>,
    state: Mutex<ControllerState>,
    published: Arc<LoadedProbes>,
}

impl ProbeController {
    pub fn new(backend: Arc<dyn ProbeBackend>) -> Self {
        Self::with_loaded_probes(backend, Arc::new(LoadedProbes::default()))
    }

    /// Controller publishing its loaded categories into `published`, which
    /// hooks may already hold
    pub fn with_loaded_probes(backend: Arc<dyn ProbeBackend>, published: Arc<LoadedProbes>) -> Self {
        published.set(ProbeCategory::empty());
        Self {
            backend,
            state: Mutex::new(ControllerState::default()),
            published,
        }
    }

    /// Shared view of the loaded categories for hooks
    pub fn loaded_probes(&self) -> Arc<LoadedProbes> {
        Arc::clone(&self.published)
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Load the requested categories that are not loaded yet.
    ///
    /// Categories are planted in a fixed order. On failure the failing
    /// category's partial attachments are removed and its error returned;
    /// categories planted earlier in the same call stay loaded.
    pub fn enable(&self, requested: ProbeCategory) -> ProbeResult<()> {
        let mut state = self.state.lock();
        let pending = requested - state.loaded;
        if pending.is_empty() {
            debug!(requested = %requested, "probes already loaded");
            return Ok(());
        }

        let result = PLANT_ORDER
            .into_iter()
            .filter(|category| pending.contains(*category))
            .try_for_each(|category| self.plant(&mut state, category));
        self.published.set(state.loaded);
        result
    }

    /// Unload the requested categories that are loaded. Returns the
    /// categories actually removed.
    pub fn disable(&self, requested: ProbeCategory) -> ProbeCategory {
        let mut state = self.state.lock();
        let removed = state.loaded & requested;
        if removed.is_empty() {
            debug!(requested = %requested, "probes not loaded");
            return removed;
        }
        state.loaded ^= removed;

        for category in PLANT_ORDER.into_iter().filter(|c| removed.contains(*c)) {
            for point in category.own_points().iter().rev() {
                self.detach(&mut state, *point);
            }
        }
        if removed.intersects(CLOSE_CATEGORIES) && !state.loaded.intersects(CLOSE_CATEGORIES) {
            self.detach(&mut state, ProbePoint::CloseEntry);
        }

        self.published.set(state.loaded);
        info!(removed = %removed, loaded = %state.loaded, "probes removed");
        removed
    }

    /// Whether any of the given categories is loaded
    pub fn status(&self, categories: ProbeCategory) -> bool {
        self.state.lock().loaded.intersects(categories)
    }

    pub fn loaded(&self) -> ProbeCategory {
        self.state.lock().loaded
    }

    /// Interception points currently attached, in plant order
    pub fn attached_points(&self) -> Vec<ProbePoint> {
        let state = self.state.lock();
        ProbePoint::ALL
            .into_iter()
            .filter(|point| state.attached.contains(point))
            .collect()
    }

    /// Unload every category
    pub fn shutdown(&self) {
        self.disable(ProbeCategory::all());
    }

    fn plant(&self, state: &mut ControllerState, category: ProbeCategory) -> ProbeResult<()> {
        let mut planted = Vec::new();
        for point in category.own_points() {
            if let Err(e) = self.attach(state, *point) {
                for done in planted.iter().rev() {
                    self.detach(state, *done);
                }
                return Err(category_error(category, e));
            }
            planted.push(*point);
        }

        // The close point is shared: plant it only if the sibling close
        // category does not already hold it
        if CLOSE_CATEGORIES.contains(category) && !state.loaded.intersects(CLOSE_CATEGORIES) {
            self.attach(state, ProbePoint::CloseEntry)
                .map_err(ProbeError::CloseProbeFailed)?;
        }

        state.loaded |= category;
        info!(category = %category, "probe category loaded");
        Ok(())
    }

    fn attach(&self, state: &mut ControllerState, point: ProbePoint) -> Result<(), AttachError> {
        if state.attached.contains(&point) {
            return Err(AttachError::AlreadyAttached(point));
        }
        if !self.backend.is_available() {
            return Err(AttachError::Unavailable(self.backend.name().to_string()));
        }
        info!(point = %point, backend = self.backend.name(), "planting probe");
        match self.backend.attach(point) {
            Ok(()) => {
                state.attached.insert(point);
                info!(point = %point, "probe planted");
                Ok(())
            }
            Err(e) => {
                error!(point = %point, error = %e, "failed to plant probe");
                Err(e)
            }
        }
    }

    fn detach(&self, state: &mut ControllerState, point: ProbePoint) {
        if !state.attached.remove(&point) {
            debug!(point = %point, "probe not attached, skipping");
            return;
        }
        self.backend.detach(point);
        info!(point = %point, "probe removed");
    }
}

impl Drop for ProbeController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ProbeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeController")
            .field("backend", &self.backend.name())
            .field("loaded", &self.loaded())
            .finish()
    }
}

fn category_error(category: ProbeCategory, e: AttachError) -> ProbeError {
    if category.intersects(ProbeCategory::TCP_CONNECT | ProbeCategory::UDP_CONNECT) {
        ProbeError::ConnectProbeFailed(e)
    } else if category.contains(ProbeCategory::TCP_ACCEPT) {
        ProbeError::AcceptProbeFailed(e)
    } else if category.contains(ProbeCategory::UDP_BIND) {
        ProbeError::BindProbeFailed(e)
    } else {
        ProbeError::CloseProbeFailed(e)
    }
}
