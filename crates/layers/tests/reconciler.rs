use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use foundation::{EpochMillis, LayerId, ManualClock, ViewId};
use layers::{
    DataVersion, LayerCatalog, LayerDefinition, LayerError, LayerFetcher, LayerPayload,
    LayerStatus, PrimitiveHandle, PrimitiveStyle, Reconciler, ReconcilerConfig, ReconcilerDeps,
    RenderKind, RenderSurface, ResetCallback, SurfaceError,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use resilience::{
    BoxFuture, CircuitKey, CircuitStatus, FetchError, NoJitter, Resilience, ResilienceConfig, RetryPolicy,
};
use session::{InMemoryStorage, SessionMemory, SessionMemoryConfig, StorageBackend};

const CLIMATE: &str = "climate";
const WATER: &str = "water";

#[derive(Debug, Clone)]
struct Drawn {
    source_id: String,
    version: DataVersion,
    opacity: f64,
    visible: bool,
}

#[derive(Default)]
struct SurfaceState {
    next: u64,
    live: BTreeMap<PrimitiveHandle, Drawn>,
    mutations: usize,
    adds: usize,
    capabilities: HashSet<String>,
    reject: HashSet<String>,
    callbacks: Vec<ResetCallback>,
}

#[derive(Default)]
struct RecordingSurface {
    state: Mutex<SurfaceState>,
}

impl RecordingSurface {
    fn with_capability(tag: &str) -> Self {
        let surface = Self::default();
        surface.state.lock().capabilities.insert(tag.to_string());
        surface
    }

    fn rejecting(source_id: &str) -> Self {
        let surface = Self::default();
        surface.state.lock().reject.insert(source_id.to_string());
        surface
    }

    fn sources(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .state
            .lock()
            .live
            .values()
            .map(|d| d.source_id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn drawn(&self, source_id: &str) -> Option<Drawn> {
        self.state
            .lock()
            .live
            .values()
            .find(|d| d.source_id == source_id)
            .cloned()
    }

    fn mutations(&self) -> usize {
        self.state.lock().mutations
    }

    fn adds(&self) -> usize {
        self.state.lock().adds
    }

    /// Drops every primitive, as a style reload would, then notifies listeners.
    fn fire_reset(&self) {
        let callbacks = {
            let mut st = self.state.lock();
            st.live.clear();
            std::mem::take(&mut st.callbacks)
        };
        for cb in &callbacks {
            cb();
        }
        self.state.lock().callbacks = callbacks;
    }
}

impl RenderSurface for RecordingSurface {
    fn add_primitive(
        &self,
        source_id: &str,
        _kind: RenderKind,
        payload: &LayerPayload,
        style: &PrimitiveStyle,
    ) -> Result<PrimitiveHandle, SurfaceError> {
        let mut st = self.state.lock();
        if st.reject.contains(source_id) {
            return Err(SurfaceError::Rejected {
                source_id: source_id.to_string(),
                reason: "unsupported geometry".to_string(),
            });
        }
        st.next += 1;
        st.mutations += 1;
        st.adds += 1;
        let handle = PrimitiveHandle(st.next);
        st.live.insert(
            handle,
            Drawn {
                source_id: source_id.to_string(),
                version: payload.version(),
                opacity: style.opacity,
                visible: style.visible,
            },
        );
        Ok(handle)
    }

    fn remove_primitive(&self, handle: PrimitiveHandle) {
        let mut st = self.state.lock();
        st.mutations += 1;
        st.live.remove(&handle);
    }

    fn set_opacity(&self, handle: PrimitiveHandle, opacity: f64) {
        let mut st = self.state.lock();
        st.mutations += 1;
        if let Some(d) = st.live.get_mut(&handle) {
            d.opacity = opacity;
        }
    }

    fn set_visibility(&self, handle: PrimitiveHandle, visible: bool) {
        let mut st = self.state.lock();
        st.mutations += 1;
        if let Some(d) = st.live.get_mut(&handle) {
            d.visible = visible;
        }
    }

    fn on_surface_reset(&self, callback: ResetCallback) {
        self.state.lock().callbacks.push(callback);
    }

    fn has_capability(&self, tag: &str) -> bool {
        self.state.lock().capabilities.contains(tag)
    }
}

/// Answers from per-URL scripts, falling back to a payload derived from the URL.
#[derive(Default)]
struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, VecDeque<Result<LayerPayload, FetchError>>>>,
    calls: Mutex<HashMap<String, u32>>,
    delay: Mutex<Duration>,
}

impl ScriptedFetcher {
    fn script(&self, url: &str, responses: impl IntoIterator<Item = Result<LayerPayload, FetchError>>) {
        self.scripts
            .lock()
            .entry(url.to_string())
            .or_default()
            .extend(responses);
    }

    fn calls(&self, url: &str) -> u32 {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }
}

impl LayerFetcher for ScriptedFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<LayerPayload, FetchError>> {
        Box::pin(async move {
            *self.calls.lock().entry(url.to_string()).or_default() += 1;
            let delay = *self.delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let next = self.scripts.lock().get_mut(url).and_then(VecDeque::pop_front);
            next.unwrap_or_else(|| Ok(LayerPayload::new(format!("{{\"url\":\"{url}\"}}"))))
        })
    }
}

fn catalog() -> LayerCatalog {
    LayerCatalog::new([
        LayerDefinition::new("heat", RenderKind::Raster)
            .with_data_source("{api_base}/api/heat?year={year}")
            .with_default_opacity(0.7)
            .visible_in([CLIMATE])
            .with_panel("heat-panel"),
        LayerDefinition::new("coast", RenderKind::Polygon)
            .with_data_source("{api_base}/api/coast?feet={slr_feet}")
            .visible_in([CLIMATE, WATER])
            .with_panel("coast-panel"),
        LayerDefinition::new("relief", RenderKind::Raster)
            .with_data_source("{api_base}/api/relief")
            .requires("advanced-3d"),
        LayerDefinition::new("dams", RenderKind::Point)
            .visible_in([WATER])
            .with_panel("dam"),
        LayerDefinition::new("gauges", RenderKind::Point)
            .with_data_source("{api_base}/api/gauges")
            .visible_in([WATER])
            .with_retry_policy(RetryPolicy::default().with_max_retries(1)),
    ])
    .unwrap()
}

struct Harness {
    reconciler: Reconciler,
    surface: Arc<RecordingSurface>,
    fetcher: Arc<ScriptedFetcher>,
    session: SessionMemory,
    resilience: Arc<Resilience>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new() -> Self {
        Self::build(RecordingSurface::default(), Arc::new(InMemoryStorage::new()))
    }

    fn build(surface: RecordingSurface, storage: Arc<InMemoryStorage>) -> Self {
        let clock = Arc::new(ManualClock::new(EpochMillis(1_000)));
        let surface = Arc::new(surface);
        let fetcher = Arc::new(ScriptedFetcher::default());
        let resilience = Arc::new(Resilience::with_parts(
            ResilienceConfig::default(),
            clock.clone(),
            Arc::new(NoJitter),
        ));
        let storage: Arc<dyn StorageBackend> = storage;
        let session = SessionMemory::with_clock(storage, SessionMemoryConfig::default(), clock.clone());
        let reconciler = Reconciler::new(
            catalog(),
            ReconcilerConfig::default(),
            ReconcilerDeps {
                surface: surface.clone(),
                fetcher: fetcher.clone(),
                resilience: resilience.clone(),
                session: session.clone(),
                clock: clock.clone(),
            },
        )
        .unwrap();
        Self {
            reconciler,
            surface,
            fetcher,
            session,
            resilience,
            clock,
        }
    }

    fn url(&self, layer: &str) -> String {
        self.reconciler.data_url(&id(layer)).unwrap().to_string()
    }

    fn enable(&self, view: &str, layer: &str) {
        self.reconciler
            .set_enabled(&ViewId::new(view), &id(layer), true)
            .unwrap();
    }

    fn disable(&self, view: &str, layer: &str) {
        self.reconciler
            .set_enabled(&ViewId::new(view), &id(layer), false)
            .unwrap();
    }

    fn status(&self, layer: &str) -> LayerStatus {
        self.reconciler.status(&id(layer)).unwrap().status
    }

    fn rendered(&self) -> Vec<String> {
        self.reconciler
            .rendered_layers()
            .into_iter()
            .map(|h| h.layer_id.to_string())
            .collect()
    }
}

fn id(layer: &str) -> LayerId {
    LayerId::new(layer)
}

fn payload(tag: &str) -> LayerPayload {
    LayerPayload::json(&serde_json::json!({ "type": "FeatureCollection", "tag": tag }))
}

fn refused() -> FetchError {
    FetchError::ConnectionRefused("127.0.0.1:5000".into())
}

#[tokio::test(start_paused = true)]
async fn enabling_a_layer_draws_one_primitive_per_role() {
    let h = Harness::new();
    h.enable(CLIMATE, "coast");
    h.reconciler.idle().await;

    assert_eq!(h.surface.sources(), vec!["coast-fill", "coast-outline"]);
    assert_eq!(h.status("coast"), LayerStatus::Ready);
    assert_eq!(h.fetcher.calls(&h.url("coast")), 1);
    assert_eq!(h.url("coast"), "http://127.0.0.1:5000/api/coast?feet=3");
}

#[tokio::test(start_paused = true)]
async fn reconcile_twice_is_a_noop() {
    let h = Harness::new();
    h.enable(CLIMATE, "heat");
    h.enable(CLIMATE, "coast");
    h.reconciler.idle().await;

    let before = h.surface.mutations();
    let summary = h.reconciler.reconcile(&ViewId::new(CLIMATE)).await;
    assert!(summary.is_noop(), "{summary:?}");
    assert_eq!(h.surface.mutations(), before);
    assert_eq!(h.fetcher.calls(&h.url("heat")), 1);
}

#[tokio::test(start_paused = true)]
async fn opacity_updates_in_place() {
    let h = Harness::new();
    let climate = ViewId::new(CLIMATE);
    h.enable(CLIMATE, "heat");
    h.reconciler.idle().await;
    assert_eq!(h.surface.drawn("heat-raster").unwrap().opacity, 0.7);

    h.reconciler.set_opacity(&climate, &id("heat"), 0.3).unwrap();
    let drawn = h.surface.drawn("heat-raster").unwrap();
    assert_eq!(drawn.opacity, 0.3);
    assert!(drawn.visible);

    h.reconciler.set_opacity(&climate, &id("heat"), 0.0).unwrap();
    assert!(!h.surface.drawn("heat-raster").unwrap().visible);

    h.reconciler.set_opacity(&climate, &id("heat"), 1.7).unwrap();
    assert_eq!(h.reconciler.desired_state(&id("heat")).unwrap().opacity, 1.0);
    assert_eq!(h.surface.adds(), 1);
    assert_eq!(h.session.read().layer_state(&id("heat")).unwrap().opacity, 1.0);
}

#[tokio::test(start_paused = true)]
async fn rendered_follows_desired_across_views() {
    let h = Harness::new();
    h.enable(CLIMATE, "heat");
    h.enable(CLIMATE, "coast");
    h.enable(CLIMATE, "dams");
    h.reconciler.idle().await;
    assert_eq!(h.rendered(), vec!["coast", "heat"]);
    assert_eq!(h.status("dams"), LayerStatus::Idle);

    let summary = h.reconciler.reconcile(&ViewId::new(WATER)).await;
    assert_eq!(summary.removed, 2);
    assert_eq!(h.rendered(), vec!["coast"]);
    assert_eq!(h.status("heat"), LayerStatus::Idle);
    assert_eq!(h.status("dams"), LayerStatus::AwaitingData);
    assert!(h.reconciler.desired_state(&id("heat")).unwrap().enabled);

    h.reconciler.provide_dataset(&id("dams"), payload("dams")).unwrap();
    assert_eq!(h.rendered(), vec!["coast", "dams"]);
    assert_eq!(h.surface.sources(), vec!["coast-fill", "coast-outline", "dams-points"]);

    h.reconciler.reconcile(&ViewId::new(CLIMATE)).await;
    assert_eq!(h.rendered(), vec!["coast", "heat"]);
    assert_eq!(h.surface.sources(), vec!["coast-fill", "coast-outline", "heat-raster"]);
}

#[tokio::test(start_paused = true)]
async fn surface_reset_readds_from_cache() {
    let h = Harness::new();
    h.enable(CLIMATE, "heat");
    h.enable(CLIMATE, "coast");
    h.reconciler.idle().await;

    h.surface.fire_reset();
    assert!(h.surface.sources().is_empty());
    tokio::task::yield_now().await;
    h.reconciler.idle().await;

    assert_eq!(h.surface.sources(), vec!["coast-fill", "coast-outline", "heat-raster"]);
    assert_eq!(h.fetcher.calls(&h.url("heat")), 1);
    assert_eq!(h.fetcher.calls(&h.url("coast")), 1);
}

#[tokio::test(start_paused = true)]
async fn duplicate_enable_while_loading_fetches_once() {
    let h = Harness::new();
    h.fetcher.set_delay(Duration::from_secs(2));
    h.enable(CLIMATE, "heat");
    h.enable(CLIMATE, "heat");
    assert_eq!(h.status("heat"), LayerStatus::Loading);
    h.reconciler.reconcile(&ViewId::new(CLIMATE)).await;
    h.reconciler.idle().await;

    assert_eq!(h.fetcher.calls(&h.url("heat")), 1);
    assert_eq!(h.surface.sources(), vec!["heat-raster"]);
}

#[tokio::test(start_paused = true)]
async fn disabling_during_load_drops_the_result() {
    let h = Harness::new();
    h.fetcher.set_delay(Duration::from_secs(2));
    h.enable(CLIMATE, "heat");
    tokio::time::sleep(Duration::from_millis(500)).await;
    h.disable(CLIMATE, "heat");
    h.reconciler.idle().await;

    assert!(h.surface.sources().is_empty());
    assert!(h.rendered().is_empty());
    assert_eq!(h.status("heat"), LayerStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn reconcile_waits_for_a_load_started_by_enable() {
    let h = Harness::new();
    let climate = ViewId::new(CLIMATE);
    h.enable(CLIMATE, "coast");
    h.reconciler.idle().await;
    h.disable(CLIMATE, "coast");
    h.reconciler.reconcile(&climate).await;
    assert!(h.rendered().is_empty());

    h.fetcher.set_delay(Duration::from_secs(5));
    h.enable(CLIMATE, "coast");
    assert_eq!(h.status("coast"), LayerStatus::Loading);
    h.reconciler.reconcile(&climate).await;

    assert_eq!(h.rendered(), vec!["coast"]);
    assert_eq!(h.status("coast"), LayerStatus::Ready);
    assert_eq!(h.surface.sources(), vec!["coast-fill", "coast-outline"]);
    assert_eq!(h.fetcher.calls(&h.url("coast")), 2);
}

#[tokio::test(start_paused = true)]
async fn switching_views_during_load_drops_the_result() {
    let h = Harness::new();
    h.fetcher.set_delay(Duration::from_secs(2));
    h.enable(CLIMATE, "heat");
    tokio::time::sleep(Duration::from_millis(500)).await;
    h.reconciler.reconcile(&ViewId::new(WATER)).await;
    h.reconciler.idle().await;

    assert!(h.rendered().is_empty());
    assert!(h.surface.sources().is_empty());
    assert_eq!(h.status("heat"), LayerStatus::Idle);
    assert!(h.reconciler.desired_state(&id("heat")).unwrap().enabled);

    h.reconciler.reconcile(&ViewId::new(CLIMATE)).await;
    assert_eq!(h.rendered(), vec!["heat"]);
    assert_eq!(h.surface.sources(), vec!["heat-raster"]);
}

#[tokio::test(start_paused = true)]
async fn layer_retry_policy_overrides_the_default() {
    let h = Harness::new();
    let gauges = h.url("gauges");
    let heat = h.url("heat");
    h.fetcher.script(&gauges, [Err(refused()), Err(refused())]);
    h.fetcher.script(&heat, [Err(refused()), Err(refused()), Err(refused())]);

    h.enable(WATER, "gauges");
    h.reconciler.idle().await;
    assert_eq!(h.fetcher.calls(&gauges), 1);
    assert_eq!(h.status("gauges"), LayerStatus::Failed);

    h.reconciler.reconcile(&ViewId::new(CLIMATE)).await;
    h.enable(CLIMATE, "heat");
    h.reconciler.idle().await;
    assert_eq!(h.fetcher.calls(&heat), 3);
    assert_eq!(h.status("heat"), LayerStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn open_circuit_falls_back_to_cached_data() {
    let h = Harness::new();
    let heat = h.url("heat");
    let v1 = payload("v1");
    h.fetcher.script(&heat, [Ok(v1.clone())]);
    h.enable(CLIMATE, "heat");
    h.reconciler.idle().await;

    h.reconciler.reconcile(&ViewId::new(WATER)).await;
    assert!(h.rendered().is_empty());
    let key = CircuitKey::new(id("heat"), heat.clone());
    for _ in 0..5 {
        h.resilience.circuits().record_failure(&key);
    }
    assert_eq!(h.resilience.circuit_state(&key).state, CircuitStatus::Open);

    h.reconciler.reconcile(&ViewId::new(CLIMATE)).await;

    let report = h.reconciler.status(&id("heat")).unwrap();
    assert_eq!(report.status, LayerStatus::Degraded);
    assert!(report.degraded);
    assert!(report.retry_pending);
    assert_eq!(report.data_version, Some(v1.version()));
    assert_eq!(report.circuit.map(|c| c.state), Some(CircuitStatus::Open));
    assert!(report.last_error.unwrap().contains("circuit open"));
    assert_eq!(h.surface.drawn("heat-raster").unwrap().version, v1.version());
    assert_eq!(h.fetcher.calls(&heat), 1);
}

#[tokio::test(start_paused = true)]
async fn degrade_then_recover() {
    let h = Harness::new();
    let heat = h.url("heat");
    let v1 = payload("v1");
    let v2 = payload("v2");
    h.fetcher.script(&heat, [Ok(v1.clone())]);
    h.enable(CLIMATE, "heat");
    h.reconciler.idle().await;
    assert_eq!(h.surface.drawn("heat-raster").unwrap().version, v1.version());

    h.fetcher
        .script(&heat, [Err(refused()), Err(refused()), Err(refused()), Ok(v2.clone())]);
    h.reconciler.retry_now(&id("heat")).unwrap();
    h.reconciler.idle().await;

    let report = h.reconciler.status(&id("heat")).unwrap();
    assert_eq!(report.status, LayerStatus::Degraded);
    assert!(report.degraded);
    assert!(report.retry_pending);
    assert_eq!(report.data_version, Some(v1.version()));
    assert_eq!(h.surface.drawn("heat-raster").unwrap().version, v1.version());
    assert_eq!(h.fetcher.calls(&heat), 4);

    tokio::time::sleep(Duration::from_secs(31)).await;
    h.reconciler.idle().await;

    let report = h.reconciler.status(&id("heat")).unwrap();
    assert_eq!(report.status, LayerStatus::Ready);
    assert!(!report.degraded);
    assert_eq!(report.data_version, Some(v2.version()));
    assert_eq!(h.surface.sources(), vec!["heat-raster"]);
    assert_eq!(h.surface.drawn("heat-raster").unwrap().version, v2.version());
    assert_eq!(h.fetcher.calls(&heat), 5);
}

#[tokio::test(start_paused = true)]
async fn scheduled_retries_stop_after_three() {
    let h = Harness::new();
    let heat = h.url("heat");
    h.fetcher
        .script(&heat, (0..4).map(|_| Err(FetchError::Malformed("truncated json".into()))));
    h.enable(CLIMATE, "heat");
    h.reconciler.idle().await;

    let report = h.reconciler.status(&id("heat")).unwrap();
    assert_eq!(report.status, LayerStatus::Failed);
    assert_eq!(report.scheduled_retries, 1);
    assert!(h.rendered().is_empty());
    assert!(h.reconciler.desired_state(&id("heat")).unwrap().enabled);

    for wait in [31, 61, 301] {
        tokio::time::sleep(Duration::from_secs(wait)).await;
        h.reconciler.idle().await;
    }
    let report = h.reconciler.status(&id("heat")).unwrap();
    assert!(report.retries_exhausted);
    assert!(!report.retry_pending);
    assert_eq!(h.fetcher.calls(&heat), 4);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.fetcher.calls(&heat), 4);

    h.reconciler.retry_now(&id("heat")).unwrap();
    h.reconciler.idle().await;
    assert_eq!(h.status("heat"), LayerStatus::Ready);
    assert_eq!(h.fetcher.calls(&heat), 5);
}

#[tokio::test(start_paused = true)]
async fn missing_capability_is_recorded_but_not_drawn() {
    let h = Harness::new();
    h.enable(CLIMATE, "relief");
    h.reconciler.idle().await;

    assert_eq!(h.status("relief"), LayerStatus::Unsupported);
    assert!(h.reconciler.desired_state(&id("relief")).unwrap().enabled);
    assert_eq!(h.fetcher.calls(&h.url("relief")), 0);

    let capable = Harness::build(
        RecordingSurface::with_capability("advanced-3d"),
        Arc::new(InMemoryStorage::new()),
    );
    capable.enable(CLIMATE, "relief");
    capable.reconciler.idle().await;
    assert_eq!(capable.surface.sources(), vec!["relief-raster"]);
}

#[tokio::test(start_paused = true)]
async fn panels_are_ordered_by_last_interaction() {
    let h = Harness::new();
    let climate = ViewId::new(CLIMATE);
    h.enable(CLIMATE, "heat");
    h.clock.set(EpochMillis(2_000));
    h.enable(CLIMATE, "coast");
    h.enable(CLIMATE, "dams");
    h.reconciler.idle().await;

    let order: Vec<String> = h
        .reconciler
        .layers_with_panel(&climate)
        .into_iter()
        .map(|c| c.layer_id.to_string())
        .collect();
    assert_eq!(order, vec!["coast", "heat"]);

    h.reconciler.set_opacity(&climate, &id("heat"), 0.5).unwrap();
    let active = h.reconciler.active_panel(&climate).unwrap();
    assert_eq!(active.candidate.layer_id, id("heat"));
    assert_eq!(active.candidate.panel_kind, "heat-panel");
    assert!(active.payload.is_some());
}

#[tokio::test(start_paused = true)]
async fn rejected_primitives_are_rolled_back() {
    let h = Harness::build(RecordingSurface::rejecting("coast-outline"), Arc::new(InMemoryStorage::new()));
    h.enable(CLIMATE, "coast");
    h.reconciler.idle().await;

    assert!(h.surface.sources().is_empty());
    let report = h.reconciler.status(&id("coast")).unwrap();
    assert_eq!(report.status, LayerStatus::Failed);
    assert!(report.last_error.unwrap().contains("coast-outline"));
}

#[tokio::test(start_paused = true)]
async fn rejected_layer_is_not_refetched_by_reconcile() {
    let h = Harness::build(RecordingSurface::rejecting("coast-outline"), Arc::new(InMemoryStorage::new()));
    let climate = ViewId::new(CLIMATE);
    let coast = h.url("coast");
    h.enable(CLIMATE, "coast");
    h.reconciler.idle().await;
    let mutations = h.surface.mutations();

    for _ in 0..3 {
        let summary = h.reconciler.reconcile(&climate).await;
        h.reconciler.idle().await;
        assert!(summary.is_noop(), "{summary:?}");
    }
    assert_eq!(h.fetcher.calls(&coast), 1);
    assert_eq!(h.surface.mutations(), mutations);
    assert_eq!(h.status("coast"), LayerStatus::Failed);

    h.reconciler.retry_now(&id("coast")).unwrap();
    h.reconciler.idle().await;
    assert_eq!(h.fetcher.calls(&coast), 2);
    assert_eq!(h.status("coast"), LayerStatus::Failed);

    h.disable(CLIMATE, "coast");
    h.enable(CLIMATE, "coast");
    h.reconciler.idle().await;
    assert_eq!(h.fetcher.calls(&coast), 3);
}

#[tokio::test(start_paused = true)]
async fn desired_state_is_restored_from_session() {
    let storage = Arc::new(InMemoryStorage::new());
    let first = Harness::build(RecordingSurface::default(), storage.clone());
    first.enable(CLIMATE, "coast");
    first
        .reconciler
        .set_opacity(&ViewId::new(CLIMATE), &id("coast"), 0.4)
        .unwrap();
    first.session.force_flush();

    let second = Harness::build(RecordingSurface::default(), storage);
    let restored = second.reconciler.desired_state(&id("coast")).unwrap();
    assert!(restored.enabled);
    assert_eq!(restored.opacity, 0.4);

    second.reconciler.reconcile(&ViewId::new(CLIMATE)).await;
    assert_eq!(second.surface.drawn("coast-fill").unwrap().opacity, 0.4);
}

#[test]
fn datasets_only_for_layers_without_a_source() {
    let h = Harness::new();
    assert_eq!(
        h.reconciler.provide_dataset(&id("heat"), payload("x")),
        Err(LayerError::HasDataSource(id("heat")))
    );
    assert_eq!(
        h.reconciler.set_enabled(&ViewId::new(CLIMATE), &id("glaciers"), true),
        Err(LayerError::UnknownLayer(id("glaciers")))
    );
}

#[test]
fn unknown_placeholder_is_rejected_at_construction() {
    let catalog = LayerCatalog::new([LayerDefinition::new("wind", RenderKind::Raster)
        .with_data_source("{api_base}/api/wind?region={region}")])
    .unwrap();
    let clock = Arc::new(ManualClock::new(EpochMillis(0)));
    let storage: Arc<dyn StorageBackend> = Arc::new(InMemoryStorage::new());
    let result = Reconciler::new(
        catalog,
        ReconcilerConfig::default(),
        ReconcilerDeps {
            surface: Arc::new(RecordingSurface::default()),
            fetcher: Arc::new(ScriptedFetcher::default()),
            resilience: Arc::new(Resilience::new(ResilienceConfig::default())),
            session: SessionMemory::with_clock(storage, SessionMemoryConfig::default(), clock.clone()),
            clock,
        },
    );
    assert_eq!(
        result.err(),
        Some(LayerError::UnknownPlaceholder {
            layer: id("wind"),
            name: "region".to_string(),
        })
    );
}
