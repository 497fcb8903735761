//! Tensor glue.
//!
//! A [`Glue`] adapts one family of tensor types to the dispatcher: it reports
//! element type and device, hands out raw data pointers, and optionally
//! fences pending work or accepts asynchronous kernel launches. Glues are
//! looked up by the runtime type of the argument.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::os::raw::c_void;
use std::sync::Arc;

use opforge_core::{Device, Element, OpforgeError, Result, ScalarType};

use crate::loader::{AsyncFn, ResolveFn};

/// Optional behaviour a glue provides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlueCapabilities {
    /// `wait_to_read` blocks until pending writes finish.
    pub read_fence: bool,
    /// `wait_to_write` blocks until pending reads and writes finish.
    pub write_fence: bool,
    /// `async_handle` returns backend handles.
    pub async_handle: bool,
    /// `submit_async` accepts kernel launches.
    pub async_call: bool,
}

impl GlueCapabilities {
    /// Plain synchronous memory.
    pub fn none() -> Self {
        Self::default()
    }

    /// Memory with pending work that must be fenced before a call.
    pub fn fenced() -> Self {
        Self {
            read_fence: true,
            write_fence: true,
            ..Self::default()
        }
    }

    /// Fencing plus an asynchronous execution engine.
    pub fn full() -> Self {
        Self {
            read_fence: true,
            write_fence: true,
            async_handle: true,
            async_call: true,
        }
    }

    /// Whether calls can be submitted asynchronously.
    pub fn supports_async(&self) -> bool {
        self.async_handle && self.async_call
    }
}

/// Raw data pointer of a tensor argument.
///
/// When the tensor cannot expose its storage directly, the glue copies it
/// into `staged` and points `ptr` into that copy. A staged copy of a mutable
/// argument is handed back to [`Glue::write_back`] after the call.
pub struct RawData {
    /// Pointer passed to native code.
    pub ptr: *mut c_void,
    /// Staging storage `ptr` points into.
    pub staged: Option<Box<dyn Any>>,
}

impl RawData {
    /// Pointer into the tensor's own storage.
    pub fn direct(ptr: *mut c_void) -> Self {
        Self { ptr, staged: None }
    }

    /// Pointer into a staging copy.
    pub fn staged(ptr: *mut c_void, staged: Box<dyn Any>) -> Self {
        Self {
            ptr,
            staged: Some(staged),
        }
    }
}

/// A kernel launch handed to a glue's asynchronous engine.
///
/// Pointer slots hold backend handles; scalar slots hold values in the
/// layout of [`Scalar::to_slot`](opforge_core::Scalar::to_slot).
#[derive(Debug, Clone)]
pub struct AsyncCall {
    /// Hashed symbol of the kernel.
    pub symbol: String,
    /// Async adapter to run.
    pub entry: AsyncFn,
    /// Native device id.
    pub device_id: i32,
    /// One slot per argument.
    pub slots: Vec<u64>,
    /// Positions of arguments the kernel only reads.
    pub const_positions: Vec<usize>,
    /// Positions of arguments the kernel writes.
    pub mutable_positions: Vec<usize>,
}

impl AsyncCall {
    fn is_handle(&self, position: usize) -> bool {
        self.const_positions.contains(&position) || self.mutable_positions.contains(&position)
    }

    /// Run the kernel.
    ///
    /// # Safety
    ///
    /// Every handle slot must be valid for `resolve`, and the buffers they
    /// resolve to must stay alive and unaliased for the duration of the call.
    pub unsafe fn invoke(&self, resolve: ResolveFn, resolve_ctx: *mut c_void) {
        let mut slots = self.slots.clone();
        let args: Vec<*mut c_void> = slots
            .iter_mut()
            .enumerate()
            .map(|(i, slot)| {
                if self.is_handle(i) {
                    *slot as usize as *mut c_void
                } else {
                    slot as *mut u64 as *mut c_void
                }
            })
            .collect();
        // SAFETY: upheld by the caller.
        unsafe { (self.entry)(self.device_id, args.as_ptr(), resolve, resolve_ctx) };
    }
}

/// Adapter between a tensor type and the dispatcher.
///
/// All methods receive the argument as `&dyn Any`; a glue is only asked
/// about values of the types it was registered for.
pub trait Glue: Send + Sync {
    /// Glue name, used in error messages.
    fn name(&self) -> &str;

    /// Optional behaviour this glue implements.
    fn capabilities(&self) -> GlueCapabilities {
        GlueCapabilities::none()
    }

    /// Element type of `value`.
    fn element_type(&self, value: &dyn Any) -> Option<ScalarType>;

    /// Device holding `value`.
    fn device(&self, value: &dyn Any) -> Option<Device>;

    /// Pointer for read-only access.
    fn data_ptr(&self, value: &dyn Any) -> Option<RawData>;

    /// Pointer for read-write access.
    fn data_ptr_mut(&self, value: &mut dyn Any) -> Option<RawData>;

    /// Copy a staged buffer back into `value` after the call.
    fn write_back(&self, value: &mut dyn Any, staged: Box<dyn Any>) {
        let _ = (value, staged);
    }

    /// Block until `value` can be read.
    fn wait_to_read(&self, value: &dyn Any) {
        let _ = value;
    }

    /// Block until `value` can be written.
    fn wait_to_write(&self, value: &dyn Any) {
        let _ = value;
    }

    /// Backend handle of `value` for asynchronous calls.
    fn async_handle(&self, value: &dyn Any) -> Option<*mut c_void> {
        let _ = value;
        None
    }

    /// Queue a kernel launch on the backend's engine.
    fn submit_async(&self, call: AsyncCall) -> Result<()> {
        Err(OpforgeError::Build(format!(
            "glue `{}` cannot run `{}` asynchronously",
            self.name(),
            call.symbol
        )))
    }
}

/// Glue for host vectors `Vec<T>`.
pub struct HostGlue<T> {
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Element> HostGlue<T> {
    /// Create the glue.
    pub fn new() -> Self {
        Self {
            name: format!("Vec<{}>", T::SCALAR),
            _marker: PhantomData,
        }
    }
}

impl<T: Element> Default for HostGlue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Element> Glue for HostGlue<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn element_type(&self, value: &dyn Any) -> Option<ScalarType> {
        value.is::<Vec<T>>().then_some(T::SCALAR)
    }

    fn device(&self, value: &dyn Any) -> Option<Device> {
        value.is::<Vec<T>>().then_some(Device::Host)
    }

    fn data_ptr(&self, value: &dyn Any) -> Option<RawData> {
        let v = value.downcast_ref::<Vec<T>>()?;
        Some(RawData::direct(v.as_ptr() as *mut c_void))
    }

    fn data_ptr_mut(&self, value: &mut dyn Any) -> Option<RawData> {
        let v = value.downcast_mut::<Vec<T>>()?;
        Some(RawData::direct(v.as_mut_ptr() as *mut c_void))
    }
}

/// Glues keyed by the tensor type they handle.
#[derive(Clone, Default)]
pub struct GlueRegistry {
    glues: HashMap<TypeId, Arc<dyn Glue>>,
}

impl std::fmt::Debug for GlueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlueRegistry")
            .field("glues", &self.names())
            .finish()
    }
}

impl GlueRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with [`HostGlue`] for `Vec<T>` of every element type.
    pub fn with_host_defaults() -> Self {
        let mut registry = Self::new();
        registry.register::<Vec<bool>>(HostGlue::<bool>::new());
        registry.register::<Vec<i8>>(HostGlue::<i8>::new());
        registry.register::<Vec<i16>>(HostGlue::<i16>::new());
        registry.register::<Vec<i32>>(HostGlue::<i32>::new());
        registry.register::<Vec<i64>>(HostGlue::<i64>::new());
        registry.register::<Vec<u8>>(HostGlue::<u8>::new());
        registry.register::<Vec<u16>>(HostGlue::<u16>::new());
        registry.register::<Vec<u32>>(HostGlue::<u32>::new());
        registry.register::<Vec<u64>>(HostGlue::<u64>::new());
        registry.register::<Vec<f32>>(HostGlue::<f32>::new());
        registry.register::<Vec<f64>>(HostGlue::<f64>::new());
        registry
    }

    /// Register `glue` for arguments of type `T`, replacing any previous glue.
    pub fn register<T: Any>(&mut self, glue: impl Glue + 'static) {
        self.register_arc(TypeId::of::<T>(), Arc::new(glue));
    }

    /// Register a shared glue for the type with id `type_id`.
    pub fn register_arc(&mut self, type_id: TypeId, glue: Arc<dyn Glue>) {
        self.glues.insert(type_id, glue);
    }

    /// Glue for the runtime type of `value`.
    pub fn find(&self, value: &dyn Any) -> Option<Arc<dyn Glue>> {
        // Dispatch through the vtable so the concrete type is used.
        let type_id = <dyn Any>::type_id(value);
        self.glues.get(&type_id).cloned()
    }

    /// Names of the registered glues, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.glues.values().map(|g| g.name().to_string()).collect();
        names.sort();
        names
    }
}
