//! Keeps what is drawn on the surface in line with what the user asked for.
//!
//! A layer has a rendered handle exactly when it is enabled, the surface has
//! its required capability, the active view is one it may appear in, and
//! fresh or cached data exists for it. Every async completion re-checks that
//! relation before touching the surface, so late results for layers the user
//! has since disabled or hidden are cached and otherwise dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use foundation::{Clock, LayerId, ViewId};
use futures_util::future::join_all;
use parking_lot::Mutex;
use resilience::{CircuitKey, Resilience, ResilienceError};
use session::SessionMemory;
use session::record::clamp_opacity;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::climate;
use crate::definition::{LayerCatalog, LayerDefinition};
use crate::error::LayerError;
use crate::payload::{CachedPayload, LayerPayload, PayloadCache};
use crate::source::LayerFetcher;
use crate::state::{DesiredLayerState, PanelCandidate, ReconcileSummary, RenderedLayerHandle};
use crate::status::{LayerStatus, LayerStatusReport};
use crate::surface::RenderSurface;
use crate::symbology::PrimitiveStyle;
use crate::template::{self, TemplateError};

/// Delays of the automatic retries after a failed load.
pub const DEFAULT_RETRY_SCHEDULE: [Duration; 3] = [
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(300),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Values for `{name}` placeholders in data source templates.
    pub template_vars: BTreeMap<String, String>,
    pub retry_schedule: Vec<Duration>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            template_vars: climate::default_template_vars(),
            retry_schedule: DEFAULT_RETRY_SCHEDULE.to_vec(),
        }
    }
}

impl ReconcilerConfig {
    pub fn with_template_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.template_vars.insert(name.into(), value.into());
        self
    }

    pub fn with_retry_schedule(mut self, schedule: Vec<Duration>) -> Self {
        self.retry_schedule = schedule;
        self
    }
}

/// Collaborators the reconciler drives.
#[derive(Clone)]
pub struct ReconcilerDeps {
    pub surface: Arc<dyn RenderSurface>,
    pub fetcher: Arc<dyn LayerFetcher>,
    pub resilience: Arc<Resilience>,
    pub session: SessionMemory,
    pub clock: Arc<dyn Clock>,
}

/// The last fetched data of the panel-owning layer picked for display.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivePanel {
    pub candidate: PanelCandidate,
    pub payload: Option<Arc<CachedPayload>>,
}

#[derive(Debug, Default)]
struct LayerRuntime {
    status: LayerStatus,
    last_error: Option<String>,
    retries_used: u32,
    retry_task: Option<JoinHandle<()>>,
    exhausted: bool,
    /// The surface refused this layer's primitives. No further loads start
    /// until the user re-enables it, retries it, or the surface resets.
    rejected: bool,
}

impl LayerRuntime {
    fn reset_retries(&mut self) {
        if let Some(task) = self.retry_task.take() {
            task.abort();
        }
        self.retries_used = 0;
        self.exhausted = false;
        self.rejected = false;
    }

    /// A retry is already scheduled, or automatic retries ran out.
    fn blocked(&self) -> bool {
        self.retry_task.is_some() || self.exhausted
    }
}

#[derive(Debug, Default)]
struct State {
    active_view: Option<ViewId>,
    desired: HashMap<LayerId, DesiredLayerState>,
    rendered: BTreeMap<LayerId, RenderedLayerHandle>,
    /// Completion signal of each running load.
    in_flight: HashMap<LayerId, watch::Receiver<bool>>,
    cache: PayloadCache,
    datasets: HashMap<LayerId, LayerPayload>,
    runtime: HashMap<LayerId, LayerRuntime>,
    interaction_seq: u64,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.interaction_seq += 1;
        self.interaction_seq
    }

    fn set_status(&mut self, id: &LayerId, status: LayerStatus) {
        self.runtime.entry(id.clone()).or_default().status = status;
    }

    fn is_enabled(&self, id: &LayerId) -> bool {
        self.desired.get(id).is_some_and(|d| d.enabled)
    }
}

enum AddOutcome {
    Rendered,
    Loading(watch::Receiver<bool>),
    /// A load started earlier is still running.
    Pending(watch::Receiver<bool>),
    Skipped,
}

struct Inner {
    catalog: LayerCatalog,
    urls: HashMap<LayerId, String>,
    config: ReconcilerConfig,
    surface: Arc<dyn RenderSurface>,
    fetcher: Arc<dyn LayerFetcher>,
    resilience: Arc<Resilience>,
    session: SessionMemory,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    /// Loads in flight plus surface-reset refreshes not yet finished.
    busy: watch::Sender<usize>,
}

#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("Reconciler")
            .field("layers", &self.inner.catalog.len())
            .field("active_view", &st.active_view)
            .field("rendered", &st.rendered.len())
            .field("in_flight", &st.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Builds the reconciler, expands data source templates and seeds desired
    /// state from the session (when the user's preferences allow it).
    pub fn new(
        catalog: LayerCatalog,
        config: ReconcilerConfig,
        deps: ReconcilerDeps,
    ) -> Result<Self, LayerError> {
        let mut urls = HashMap::new();
        for def in catalog.iter() {
            if let Some(policy) = &def.retry_policy {
                deps.resilience.set_layer_policy(def.id.clone(), policy.clone());
            }
            let Some(source) = &def.data_source else {
                continue;
            };
            let url = template::expand(source, &config.template_vars).map_err(|e| match e {
                TemplateError::UnknownPlaceholder(name) => LayerError::UnknownPlaceholder {
                    layer: def.id.clone(),
                    name,
                },
                TemplateError::Unterminated => LayerError::InvalidDefinition {
                    layer: def.id.clone(),
                    reason: "unterminated placeholder in data source".to_string(),
                },
            })?;
            urls.insert(def.id.clone(), url);
        }

        let mut state = State::default();
        let record = deps.session.read();
        let prefs = record.preferences;
        if prefs.auto_restore_session && prefs.remember_layer_states {
            for entry in &record.layer_states {
                if catalog.get(&entry.id).is_none() {
                    tracing::debug!(layer = %entry.id, "Ignoring saved state for unknown layer");
                    continue;
                }
                let seq = state.next_seq();
                state.desired.insert(
                    entry.id.clone(),
                    DesiredLayerState {
                        enabled: entry.enabled,
                        opacity: clamp_opacity(entry.opacity),
                        last_interacted_at: entry.last_viewed_at,
                        interaction_seq: seq,
                    },
                );
            }
            let enabled = state.desired.values().filter(|d| d.enabled).count();
            if enabled > 0 {
                tracing::info!(enabled, "Restored layer selection from session");
            }
        }

        let (busy, _) = watch::channel(0usize);
        let inner = Arc::new(Inner {
            catalog,
            urls,
            config,
            surface: deps.surface,
            fetcher: deps.fetcher,
            resilience: deps.resilience,
            session: deps.session,
            clock: deps.clock,
            state: Mutex::new(state),
            busy,
        });

        let weak = Arc::downgrade(&inner);
        inner
            .surface
            .on_surface_reset(Box::new(move || Reconciler::surface_was_reset(&weak)));

        Ok(Self { inner })
    }

    pub fn catalog(&self) -> &LayerCatalog {
        &self.inner.catalog
    }

    /// Expanded data source URL of a layer, if it has one.
    pub fn data_url(&self, layer: &LayerId) -> Option<&str> {
        self.inner.urls.get(layer).map(String::as_str)
    }

    pub fn active_view(&self) -> Option<ViewId> {
        self.inner.state.lock().active_view.clone()
    }

    /// Records whether `layer` should be shown and brings that one layer in line.
    ///
    /// Only acts on the surface when `view` is the active view (or no view is
    /// active yet, in which case `view` becomes active). Turning a disabled
    /// layer back on resets its circuit and retry schedule.
    pub fn set_enabled(&self, view: &ViewId, layer: &LayerId, enabled: bool) -> Result<(), LayerError> {
        let def = self.definition(layer)?;
        let now = self.inner.clock.now_ms();

        let (reenabled, opacity) = {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            let seq = st.next_seq();
            let desired = st
                .desired
                .entry(layer.clone())
                .or_insert_with(|| DesiredLayerState::new(def.default_opacity));
            let reenabled = enabled && !desired.enabled;
            desired.enabled = enabled;
            desired.last_interacted_at = now;
            desired.interaction_seq = seq;
            let opacity = desired.opacity;
            if reenabled {
                st.runtime.entry(layer.clone()).or_default().reset_retries();
            }
            (reenabled, opacity)
        };

        if reenabled {
            self.inner.resilience.reset_layer(layer);
        }
        if enabled && !self.capable(&def) {
            tracing::info!(
                layer = %layer,
                capability = def.requires_capability.as_deref().unwrap_or_default(),
                "Surface lacks required capability, layer will not render"
            );
        }
        tracing::debug!(layer = %layer, view = %view, enabled, "Layer toggled");

        self.inner.session.remember_layer(layer, enabled, opacity);
        self.sync_layer(view, &def);
        Ok(())
    }

    /// Clamps `value` to `[0, 1]`, records it, and pushes it to the surface if drawn.
    pub fn set_opacity(&self, view: &ViewId, layer: &LayerId, value: f64) -> Result<(), LayerError> {
        let def = self.definition(layer)?;
        let opacity = clamp_opacity(value);
        let now = self.inner.clock.now_ms();

        let enabled = {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            let seq = st.next_seq();
            let desired = st
                .desired
                .entry(layer.clone())
                .or_insert_with(|| DesiredLayerState::new(def.default_opacity));
            desired.opacity = opacity;
            desired.last_interacted_at = now;
            desired.interaction_seq = seq;
            let enabled = desired.enabled;
            if st.active_view.as_ref() == Some(view) {
                self.apply_update(st, &def);
            }
            enabled
        };

        self.inner.session.remember_layer(layer, enabled, opacity);
        Ok(())
    }

    /// Full pass for `view`: removals, then additions (loaded concurrently),
    /// then opacity/visibility updates. Resolves once the additions it
    /// started have settled. Switching views tears down the previous view's
    /// handles first.
    pub async fn reconcile(&self, view: &ViewId) -> ReconcileSummary {
        self.reconcile_pass(view, false).await
    }

    /// Forgets every handle (the surface already dropped them) and
    /// reconciles again, re-adding from cache where possible.
    pub async fn refresh_after_surface_reset(&self, view: &ViewId) -> ReconcileSummary {
        {
            let mut st = self.inner.state.lock();
            let dropped = st.rendered.len();
            st.rendered.clear();
            for runtime in st.runtime.values_mut() {
                runtime.rejected = false;
            }
            tracing::info!(dropped, view = %view, "Surface reset, re-adding layers");
        }
        self.reconcile_pass(view, true).await
    }

    /// Manual retry: clears the circuit and retry schedule and fetches again,
    /// even if cached data is already drawn.
    pub fn retry_now(&self, layer: &LayerId) -> Result<(), LayerError> {
        let def = self.definition(layer)?;
        self.inner.resilience.reset_layer(layer);

        let mut guard = self.inner.state.lock();
        let st = &mut *guard;
        st.runtime.entry(layer.clone()).or_default().reset_retries();
        if !self.should_render(st, &def) {
            tracing::debug!(layer = %layer, "Manual retry ignored, layer not shown");
            return Ok(());
        }
        match self.inner.urls.get(layer).cloned() {
            Some(url) => {
                tracing::info!(layer = %layer, "Manual retry");
                if self.spawn_load(st, &def, url).is_none() {
                    tracing::debug!(layer = %layer, "Manual retry started no new load");
                }
            }
            None => match self.begin_add(st, &def, true) {
                AddOutcome::Skipped => tracing::debug!(layer = %layer, "Manual retry found nothing to draw"),
                AddOutcome::Rendered | AddOutcome::Loading(_) | AddOutcome::Pending(_) => {}
            },
        }
        Ok(())
    }

    /// Supplies the dataset of a layer without a data source. Renders it at
    /// once if the layer is currently wanted.
    pub fn provide_dataset(&self, layer: &LayerId, payload: LayerPayload) -> Result<(), LayerError> {
        let def = self.definition(layer)?;
        if def.data_source.is_some() {
            return Err(LayerError::HasDataSource(layer.clone()));
        }
        let now = self.inner.clock.now_ms();

        let mut guard = self.inner.state.lock();
        let st = &mut *guard;
        st.datasets.insert(layer.clone(), payload.clone());
        let cached = st.cache.insert(layer.clone(), payload, now);
        tracing::debug!(layer = %layer, bytes = cached.payload.len(), "Dataset supplied");
        if self.should_render(st, &def) {
            self.render(st, &def, cached, false);
        }
        Ok(())
    }

    /// Desired, renderable layers with a detail panel, most recently touched first.
    pub fn layers_with_panel(&self, view: &ViewId) -> Vec<PanelCandidate> {
        let st = self.inner.state.lock();
        let mut found: Vec<(u64, PanelCandidate)> = self
            .inner
            .catalog
            .iter()
            .filter_map(|def| {
                let panel_kind = def.right_panel_kind.clone()?;
                if !self.renderable(&st, def, view) {
                    return None;
                }
                let desired = st.desired.get(&def.id)?;
                Some((
                    desired.interaction_seq,
                    PanelCandidate {
                        layer_id: def.id.clone(),
                        panel_kind,
                        last_interacted_at: desired.last_interacted_at,
                    },
                ))
            })
            .collect();
        found.sort_by(|a, b| {
            b.1.last_interacted_at
                .cmp(&a.1.last_interacted_at)
                .then_with(|| b.0.cmp(&a.0))
        });
        found.into_iter().map(|(_, c)| c).collect()
    }

    /// Single-panel policy: only the most recently touched panel layer is shown.
    pub fn active_panel(&self, view: &ViewId) -> Option<ActivePanel> {
        let candidate = self.layers_with_panel(view).into_iter().next()?;
        let payload = self.inner.state.lock().cache.get(&candidate.layer_id);
        Some(ActivePanel { candidate, payload })
    }

    pub fn status(&self, layer: &LayerId) -> Result<LayerStatusReport, LayerError> {
        self.definition(layer)?;
        let st = self.inner.state.lock();
        let runtime = st.runtime.get(layer);
        let handle = st.rendered.get(layer);
        let circuit = self
            .inner
            .urls
            .get(layer)
            .map(|url| self.inner.resilience.circuit_state(&CircuitKey::new(layer.clone(), url.clone())));
        Ok(LayerStatusReport {
            layer_id: layer.clone(),
            status: runtime.map(|r| r.status).unwrap_or_default(),
            degraded: handle.is_some_and(|h| h.degraded),
            data_version: handle.map(|h| h.data_version.clone()),
            last_error: runtime.and_then(|r| r.last_error.clone()),
            scheduled_retries: runtime.map(|r| r.retries_used).unwrap_or(0),
            retry_pending: runtime.is_some_and(|r| r.retry_task.is_some()),
            retries_exhausted: runtime.is_some_and(|r| r.exhausted),
            circuit,
        })
    }

    pub fn desired_state(&self, layer: &LayerId) -> Option<DesiredLayerState> {
        self.inner.state.lock().desired.get(layer).cloned()
    }

    pub fn rendered_layers(&self) -> Vec<RenderedLayerHandle> {
        self.inner.state.lock().rendered.values().cloned().collect()
    }

    pub fn is_rendered(&self, layer: &LayerId) -> bool {
        self.inner.state.lock().rendered.contains_key(layer)
    }

    /// Resolves once no load or surface-reset refresh is running.
    /// Scheduled retries that are still waiting do not count.
    pub async fn idle(&self) {
        let mut rx = self.inner.busy.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    fn definition(&self, layer: &LayerId) -> Result<Arc<LayerDefinition>, LayerError> {
        self.inner
            .catalog
            .get(layer)
            .cloned()
            .ok_or_else(|| LayerError::UnknownLayer(layer.clone()))
    }

    fn capable(&self, def: &LayerDefinition) -> bool {
        def.requires_capability
            .as_deref()
            .is_none_or(|tag| self.inner.surface.has_capability(tag))
    }

    fn renderable(&self, st: &State, def: &LayerDefinition, view: &ViewId) -> bool {
        st.is_enabled(&def.id) && def.visible_in_view(view) && self.capable(def)
    }

    fn should_render(&self, st: &State, def: &LayerDefinition) -> bool {
        st.active_view
            .as_ref()
            .is_some_and(|view| self.renderable(st, def, view))
    }

    /// Status of a layer that is not (or no longer) wanted on the surface.
    fn resting_status(&self, st: &State, def: &LayerDefinition) -> LayerStatus {
        if st.is_enabled(&def.id) && !self.capable(def) {
            LayerStatus::Unsupported
        } else {
            LayerStatus::Idle
        }
    }

    fn sync_layer(&self, view: &ViewId, def: &Arc<LayerDefinition>) {
        let mut guard = self.inner.state.lock();
        let st = &mut *guard;
        match &st.active_view {
            None => st.active_view = Some(view.clone()),
            Some(active) if active != view => {
                tracing::debug!(layer = %def.id, view = %view, active = %active, "Not the active view, surface untouched");
                return;
            }
            Some(_) => {}
        }

        let wanted = self.renderable(st, def, view);
        let rendered = st.rendered.contains_key(&def.id);
        match (wanted, rendered) {
            (true, false) => match self.begin_add(st, def, false) {
                // Loads finish in the background; `reconcile` and `idle` wait for them.
                AddOutcome::Loading(_) | AddOutcome::Pending(_) => {}
                AddOutcome::Rendered | AddOutcome::Skipped => {}
            },
            (true, true) => {
                self.apply_update(st, def);
            }
            (false, true) => {
                self.remove_handle(st, &def.id);
                let status = self.resting_status(st, def);
                st.set_status(&def.id, status);
            }
            (false, false) => {
                let status = self.resting_status(st, def);
                st.set_status(&def.id, status);
            }
        }
    }

    async fn reconcile_pass(&self, view: &ViewId, prefer_cache: bool) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        let waits = {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;

            if st.active_view.as_ref() != Some(view) {
                if let Some(previous) = st.active_view.replace(view.clone()) {
                    let ids: Vec<LayerId> = st.rendered.keys().cloned().collect();
                    for id in &ids {
                        self.remove_handle(st, id);
                    }
                    summary.removed += ids.len();
                    tracing::info!(from = %previous, to = %view, torn_down = ids.len(), "View switched");
                }
            }

            let snapshot: &State = st;
            let stale: Vec<LayerId> = snapshot
                .rendered
                .keys()
                .filter(|id| {
                    self.inner
                        .catalog
                        .get(id)
                        .is_none_or(|def| !self.renderable(snapshot, def, view))
                })
                .cloned()
                .collect();
            for id in &stale {
                self.remove_handle(st, id);
                if let Some(def) = self.inner.catalog.get(id) {
                    let status = self.resting_status(st, def);
                    st.set_status(id, status);
                }
            }
            summary.removed += stale.len();

            let mut waits = Vec::new();
            for def in self.inner.catalog.iter() {
                if st.rendered.contains_key(&def.id) {
                    continue;
                }
                if !self.renderable(st, def, view) {
                    if st.desired.contains_key(&def.id) {
                        let status = self.resting_status(st, def);
                        st.set_status(&def.id, status);
                    }
                    continue;
                }
                match self.begin_add(st, def, prefer_cache) {
                    AddOutcome::Rendered => summary.added += 1,
                    AddOutcome::Loading(done) => {
                        summary.added += 1;
                        waits.push(done);
                    }
                    AddOutcome::Pending(done) => waits.push(done),
                    AddOutcome::Skipped => {}
                }
            }

            for def in self.inner.catalog.iter() {
                if self.apply_update(st, def) {
                    summary.updated += 1;
                }
            }
            waits
        };

        join_all(waits.into_iter().map(|mut done| async move {
            if done.wait_for(|finished| *finished).await.is_err() {
                tracing::debug!("Load task ended before completing");
            }
        }))
        .await;
        tracing::debug!(
            view = %view,
            removed = summary.removed,
            added = summary.added,
            updated = summary.updated,
            "Reconcile pass complete"
        );
        summary
    }

    /// Starts showing a wanted layer that has no handle yet.
    fn begin_add(&self, st: &mut State, def: &Arc<LayerDefinition>, prefer_cache: bool) -> AddOutcome {
        let id = &def.id;
        if st.runtime.get(id).is_some_and(|r| r.rejected) {
            tracing::debug!(layer = %id, "Surface rejected layer earlier, not adding");
            return AddOutcome::Skipped;
        }
        let Some(url) = self.inner.urls.get(id).cloned() else {
            let Some(payload) = st.datasets.get(id).cloned() else {
                st.set_status(id, LayerStatus::AwaitingData);
                tracing::debug!(layer = %id, "Waiting for dataset");
                return AddOutcome::Skipped;
            };
            let cached = match st.cache.get(id) {
                Some(c) if c.payload == payload => c,
                _ => st.cache.insert(id.clone(), payload, self.inner.clock.now_ms()),
            };
            return if self.render(st, def, cached, false) {
                AddOutcome::Rendered
            } else {
                AddOutcome::Skipped
            };
        };

        let runtime = st.runtime.entry(id.clone()).or_default();
        let blocked = runtime.blocked();
        let degraded = blocked || runtime.status == LayerStatus::Degraded;
        if prefer_cache || blocked {
            if let Some(cached) = st.cache.get(id) {
                return if self.render(st, def, cached, degraded) {
                    AddOutcome::Rendered
                } else {
                    AddOutcome::Skipped
                };
            }
            if blocked {
                return AddOutcome::Skipped;
            }
        }

        if let Some(done) = st.in_flight.get(id) {
            tracing::debug!(layer = %id, "Load already in flight");
            return AddOutcome::Pending(done.clone());
        }
        match self.spawn_load(st, def, url) {
            Some(done) => AddOutcome::Loading(done),
            None => AddOutcome::Skipped,
        }
    }

    /// Marks the layer in flight and spawns its load. At most one load per layer.
    /// The returned receiver flips to true once the result has been applied.
    fn spawn_load(&self, st: &mut State, def: &Arc<LayerDefinition>, url: String) -> Option<watch::Receiver<bool>> {
        let id = &def.id;
        if st.in_flight.contains_key(id) {
            tracing::debug!(layer = %id, "Load already in flight");
            return None;
        }
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!(layer = %id, "No async runtime, cannot load layer");
            return None;
        };

        let (done_tx, done_rx) = watch::channel(false);
        st.in_flight.insert(id.clone(), done_rx.clone());
        self.inner.busy.send_modify(|n| *n += 1);
        if !st.rendered.contains_key(id) {
            st.set_status(id, LayerStatus::Loading);
        }
        tracing::debug!(layer = %id, url = %url, "Loading layer");

        let this = self.clone();
        let def = Arc::clone(def);
        runtime.spawn(async move { this.load(def, url, done_tx).await });
        Some(done_rx)
    }

    async fn load(self, def: Arc<LayerDefinition>, url: String, done: watch::Sender<bool>) {
        let key = CircuitKey::new(def.id.clone(), url.clone());
        let fetcher = Arc::clone(&self.inner.fetcher);
        let result = self
            .inner
            .resilience
            .execute(&key, || fetcher.fetch(&url))
            .await;
        self.complete_load(&def, result);
        done.send_replace(true);
        self.inner.busy.send_modify(|n| *n = n.saturating_sub(1));
    }

    fn complete_load(&self, def: &Arc<LayerDefinition>, result: Result<LayerPayload, ResilienceError>) {
        let now = self.inner.clock.now_ms();
        let mut guard = self.inner.state.lock();
        let st = &mut *guard;
        let id = &def.id;
        st.in_flight.remove(id);
        let wanted = self.should_render(st, def);

        match result {
            Ok(payload) => {
                let cached = st.cache.insert(id.clone(), payload, now);
                let runtime = st.runtime.entry(id.clone()).or_default();
                runtime.last_error = None;
                runtime.reset_retries();

                if !wanted {
                    tracing::debug!(layer = %id, "Layer no longer shown, result cached only");
                    let status = self.resting_status(st, def);
                    st.set_status(id, status);
                    return;
                }
                self.render(st, def, cached, false);
            }
            Err(err) => {
                if err.is_persistent() {
                    tracing::error!(layer = %id, error = %err, "Layer data request failed permanently");
                } else {
                    tracing::warn!(layer = %id, error = %err, "Layer data request failed");
                }
                st.runtime.entry(id.clone()).or_default().last_error = Some(err.to_string());

                if !wanted {
                    let status = self.resting_status(st, def);
                    st.set_status(id, status);
                    return;
                }

                if let Some(handle) = st.rendered.get_mut(id) {
                    handle.degraded = true;
                    st.set_status(id, LayerStatus::Degraded);
                    tracing::info!(layer = %id, "Keeping cached data on screen, marked degraded");
                } else if let Some(cached) = st.cache.get(id) {
                    self.render(st, def, cached, true);
                } else {
                    st.set_status(id, LayerStatus::Failed);
                }
                self.schedule_retry(st, def);
            }
        }
    }

    fn schedule_retry(&self, st: &mut State, def: &Arc<LayerDefinition>) {
        let id = &def.id;
        let runtime = st.runtime.entry(id.clone()).or_default();
        if runtime.blocked() {
            return;
        }
        let Some(&delay) = self.inner.config.retry_schedule.get(runtime.retries_used as usize) else {
            runtime.exhausted = true;
            tracing::warn!(
                layer = %id,
                retries = runtime.retries_used,
                "Automatic retries exhausted, waiting for manual retry"
            );
            return;
        };
        let Ok(handle) = Handle::try_current() else {
            return;
        };

        runtime.retries_used += 1;
        tracing::info!(
            layer = %id,
            retry = runtime.retries_used,
            delay_secs = delay.as_secs(),
            "Scheduled layer retry"
        );
        let this = self.clone();
        let def = Arc::clone(def);
        runtime.retry_task = Some(handle.spawn(async move {
            tokio::time::sleep(delay).await;
            this.run_scheduled_retry(&def);
        }));
    }

    fn run_scheduled_retry(&self, def: &Arc<LayerDefinition>) {
        let mut guard = self.inner.state.lock();
        let st = &mut *guard;
        if let Some(runtime) = st.runtime.get_mut(&def.id) {
            runtime.retry_task = None;
        }
        if !self.should_render(st, def) {
            tracing::debug!(layer = %def.id, "Scheduled retry skipped, layer not shown");
            return;
        }
        let Some(url) = self.inner.urls.get(&def.id).cloned() else {
            return;
        };
        tracing::debug!(layer = %def.id, "Running scheduled retry");
        if self.spawn_load(st, def, url).is_none() {
            tracing::debug!(layer = %def.id, "Scheduled retry started no new load");
        }
    }

    /// Draws `cached` for `def`, replacing primitives only when the data
    /// version changed. Returns false if the surface refused the primitives.
    fn render(&self, st: &mut State, def: &LayerDefinition, cached: Arc<CachedPayload>, degraded: bool) -> bool {
        let id = &def.id;
        let status = if degraded {
            LayerStatus::Degraded
        } else {
            LayerStatus::Ready
        };

        if let Some(handle) = st.rendered.get_mut(id) {
            if handle.data_version == cached.version {
                handle.degraded = degraded;
                st.set_status(id, status);
                return true;
            }
        }
        if let Some(old) = st.rendered.remove(id) {
            for handle in old.primitive_ids() {
                self.inner.surface.remove_primitive(handle);
            }
        }

        let opacity = st
            .desired
            .get(id)
            .map(|d| d.opacity)
            .unwrap_or(def.default_opacity);
        let mut primitives = Vec::with_capacity(def.render_kind.roles().len());
        for role in def.render_kind.roles() {
            let style = PrimitiveStyle::new(*role, opacity);
            let source_id = format!("{}-{}", id, role.as_str());
            match self
                .inner
                .surface
                .add_primitive(&source_id, def.render_kind, &cached.payload, &style)
            {
                Ok(handle) => primitives.push((*role, handle)),
                Err(e) => {
                    for (_, handle) in primitives {
                        self.inner.surface.remove_primitive(handle);
                    }
                    tracing::warn!(layer = %id, error = %e, "Surface rejected layer");
                    let runtime = st.runtime.entry(id.clone()).or_default();
                    runtime.status = LayerStatus::Failed;
                    runtime.last_error = Some(e.to_string());
                    runtime.rejected = true;
                    return false;
                }
            }
        }

        st.rendered.insert(
            id.clone(),
            RenderedLayerHandle {
                layer_id: id.clone(),
                primitives,
                data_version: cached.version.clone(),
                opacity,
                visible: opacity > 0.0,
                degraded,
            },
        );
        let runtime = st.runtime.entry(id.clone()).or_default();
        runtime.status = status;
        runtime.rejected = false;
        tracing::info!(layer = %id, version = cached.version.short(), degraded, "Layer rendered");
        true
    }

    /// Pushes desired opacity/visibility to an existing handle. Returns whether anything changed.
    fn apply_update(&self, st: &mut State, def: &LayerDefinition) -> bool {
        let Some(opacity) = st.desired.get(&def.id).map(|d| d.opacity) else {
            return false;
        };
        let Some(handle) = st.rendered.get_mut(&def.id) else {
            return false;
        };
        let visible = opacity > 0.0;
        let mut changed = false;
        if handle.opacity != opacity {
            for p in handle.primitive_ids() {
                self.inner.surface.set_opacity(p, opacity);
            }
            handle.opacity = opacity;
            changed = true;
        }
        if handle.visible != visible {
            for p in handle.primitive_ids() {
                self.inner.surface.set_visibility(p, visible);
            }
            handle.visible = visible;
            changed = true;
        }
        changed
    }

    fn remove_handle(&self, st: &mut State, id: &LayerId) {
        if let Some(handle) = st.rendered.remove(id) {
            for p in handle.primitive_ids() {
                self.inner.surface.remove_primitive(p);
            }
            tracing::debug!(layer = %id, "Layer removed from surface");
        }
    }

    fn surface_was_reset(weak: &Weak<Inner>) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let this = Reconciler { inner };
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!("Surface reset outside the async runtime; call refresh_after_surface_reset");
            return;
        };
        this.inner.busy.send_modify(|n| *n += 1);
        runtime.spawn(async move {
            let view = this.active_view();
            if let Some(view) = view {
                this.refresh_after_surface_reset(&view).await;
            }
            this.inner.busy.send_modify(|n| *n = n.saturating_sub(1));
        });
    }
}

