//! Request-scoped interception of the last convolutional stage.
//!
//! A [`CapturePoint`] sits on the backbone's final feature map. Hooks are
//! registered for the duration of one forward+backward sequence and are
//! released when the returned [`HookGuard`] drops, on every exit path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ndarray::Array3;
use tracing::trace;

/// Callbacks fired by a [`CapturePoint`]. Tensors are `[C, h, w]`.
pub trait CaptureHook: Send + Sync {
    fn on_forward(&self, activation: &Array3<f32>);
    fn on_backward(&self, gradient: &Array3<f32>);
}

/// Hook that appends every tensor it sees.
#[derive(Debug, Default)]
pub struct FeatureRecorder {
    activations: Mutex<Vec<Array3<f32>>>,
    gradients: Mutex<Vec<Array3<f32>>>,
}

impl FeatureRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activations(&self) -> Vec<Array3<f32>> {
        lock(&self.activations).clone()
    }

    pub fn gradients(&self) -> Vec<Array3<f32>> {
        lock(&self.gradients).clone()
    }

    pub fn activation_count(&self) -> usize {
        lock(&self.activations).len()
    }

    pub fn gradient_count(&self) -> usize {
        lock(&self.gradients).len()
    }
}

impl CaptureHook for FeatureRecorder {
    fn on_forward(&self, activation: &Array3<f32>) {
        lock(&self.activations).push(activation.clone());
    }

    fn on_backward(&self, gradient: &Array3<f32>) {
        lock(&self.gradients).push(gradient.clone());
    }
}

type HookEntry = (u64, Arc<dyn CaptureHook>);

pub struct CapturePoint {
    layer: String,
    hooks: Mutex<Vec<HookEntry>>,
    next_id: AtomicU64,
    requires_grad: AtomicBool,
}

impl std::fmt::Debug for CapturePoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturePoint")
            .field("layer", &self.layer)
            .field("registered", &self.registered_count())
            .field("requires_grad", &self.requires_grad())
            .finish()
    }
}

impl CapturePoint {
    pub fn new(layer: impl Into<String>) -> Self {
        Self {
            layer: layer.into(),
            hooks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            requires_grad: AtomicBool::new(true),
        }
    }

    pub fn layer(&self) -> &str {
        &self.layer
    }

    pub fn register(&self, hook: Arc<dyn CaptureHook>) -> HookGuard<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.hooks).push((id, hook));
        trace!(layer = %self.layer, hook_id = id, "Capture hook registered");
        HookGuard { point: self, id }
    }

    pub fn registered_count(&self) -> usize {
        lock(&self.hooks).len()
    }

    /// Attach or detach the capture point from the backward pass.
    pub fn set_requires_grad(&self, requires_grad: bool) {
        self.requires_grad.store(requires_grad, Ordering::SeqCst);
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad.load(Ordering::SeqCst)
    }

    pub(crate) fn emit_forward(&self, activation: &Array3<f32>) {
        for hook in self.snapshot() {
            hook.on_forward(activation);
        }
    }

    /// Deliver a gradient. Returns whether it reached the capture point.
    pub(crate) fn emit_backward(&self, gradient: &Array3<f32>) -> bool {
        if !self.requires_grad() {
            return false;
        }
        for hook in self.snapshot() {
            hook.on_backward(gradient);
        }
        true
    }

    // Hooks run outside the registry lock so a hook may inspect the point.
    fn snapshot(&self) -> Vec<Arc<dyn CaptureHook>> {
        lock(&self.hooks)
            .iter()
            .map(|(_, hook)| Arc::clone(hook))
            .collect()
    }

    fn release(&self, id: u64) {
        lock(&self.hooks).retain(|(hook_id, _)| *hook_id != id);
        trace!(layer = %self.layer, hook_id = id, "Capture hook released");
    }
}

/// Registration handle; dropping it deregisters the hook.
#[must_use = "dropping the guard releases the hook immediately"]
pub struct HookGuard<'a> {
    point: &'a CapturePoint,
    id: u64,
}

impl Drop for HookGuard<'_> {
    fn drop(&mut self) {
        self.point.release(self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
