use std::collections::{BTreeMap, HashSet};

use layers::{
    LayerPayload, PrimitiveHandle, PrimitiveStyle, RenderKind, RenderSurface, ResetCallback,
    SurfaceError,
};
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub struct LoggedPrimitive {
    pub source_id: String,
    pub kind: RenderKind,
    pub bytes: usize,
    pub opacity: f64,
    pub visible: bool,
}

#[derive(Default)]
struct State {
    next: u64,
    live: BTreeMap<PrimitiveHandle, LoggedPrimitive>,
    callbacks: Vec<ResetCallback>,
}

/// Headless surface that records primitives and logs every change.
#[derive(Default)]
pub struct LoggingSurface {
    capabilities: HashSet<String>,
    state: Mutex<State>,
}

impl LoggingSurface {
    pub fn new<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            state: Mutex::default(),
        }
    }

    pub fn live(&self) -> Vec<LoggedPrimitive> {
        self.state.lock().live.values().cloned().collect()
    }

    /// Drops everything drawn and notifies reset listeners.
    pub fn reset(&self) {
        let callbacks = {
            let mut st = self.state.lock();
            let dropped = st.live.len();
            st.live.clear();
            tracing::info!(dropped, "Surface reset");
            std::mem::take(&mut st.callbacks)
        };
        for cb in &callbacks {
            cb();
        }
        self.state.lock().callbacks.extend(callbacks);
    }
}

impl RenderSurface for LoggingSurface {
    fn add_primitive(
        &self,
        source_id: &str,
        kind: RenderKind,
        payload: &LayerPayload,
        style: &PrimitiveStyle,
    ) -> Result<PrimitiveHandle, SurfaceError> {
        let mut st = self.state.lock();
        st.next += 1;
        let handle = PrimitiveHandle(st.next);
        tracing::info!(
            source = source_id,
            handle = handle.0,
            bytes = payload.len(),
            opacity = style.opacity,
            "add primitive"
        );
        st.live.insert(
            handle,
            LoggedPrimitive {
                source_id: source_id.to_string(),
                kind,
                bytes: payload.len(),
                opacity: style.opacity,
                visible: style.visible,
            },
        );
        Ok(handle)
    }

    fn remove_primitive(&self, handle: PrimitiveHandle) {
        if let Some(p) = self.state.lock().live.remove(&handle) {
            tracing::info!(source = %p.source_id, handle = handle.0, "remove primitive");
        }
    }

    fn set_opacity(&self, handle: PrimitiveHandle, opacity: f64) {
        if let Some(p) = self.state.lock().live.get_mut(&handle) {
            p.opacity = opacity;
            tracing::debug!(source = %p.source_id, opacity, "set opacity");
        }
    }

    fn set_visibility(&self, handle: PrimitiveHandle, visible: bool) {
        if let Some(p) = self.state.lock().live.get_mut(&handle) {
            p.visible = visible;
            tracing::debug!(source = %p.source_id, visible, "set visibility");
        }
    }

    fn on_surface_reset(&self, callback: ResetCallback) {
        self.state.lock().callbacks.push(callback);
    }

    fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.contains(tag)
    }
}
