//! Dispatch through hand-written packed entries and mock glues.

use std::any::Any;
use std::os::raw::{c_int, c_void};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use opforge_core::{
    parse_declarations, Declaration, Device, IdCode, OpforgeError, Scalar, ScalarType,
};
use opforge_runtime::{
    bind, invoke, AsyncCall, CallArgs, Glue, GlueCapabilities, GlueRegistry, NativeEntry, RawData,
};

fn decl(src: &str) -> Declaration {
    parse_declarations(src).unwrap().remove(0)
}

/// Read the pointer stored in slot `i`.
unsafe fn ptr_arg<T>(args: *const *mut c_void, i: usize) -> *mut T {
    unsafe { *(*args.add(i) as *const *mut T) }
}

/// Read the scalar stored in slot `i`.
unsafe fn value_arg<T: Copy>(args: *const *mut c_void, i: usize) -> T {
    unsafe { *(*args.add(i) as *const T) }
}

unsafe extern "C" fn add_packed(_device_id: c_int, args: *const *mut c_void, rtn: *mut c_void) {
    unsafe {
        let a = ptr_arg::<i32>(args, 0);
        let b = ptr_arg::<i32>(args, 1);
        let out = ptr_arg::<i32>(args, 2);
        let n: i32 = value_arg(args, 3);
        for i in 0..n as usize {
            *out.add(i) = *a.add(i) + *b.add(i);
        }
        *(rtn as *mut i32) = n;
    }
}

unsafe extern "C" fn dot_packed(_device_id: c_int, args: *const *mut c_void, rtn: *mut c_void) {
    unsafe {
        let x = ptr_arg::<f64>(args, 0);
        let y = ptr_arg::<f64>(args, 1);
        let n: i32 = value_arg(args, 2);
        let mut sum = 0.0;
        for i in 0..n as usize {
            sum += *x.add(i) * *y.add(i);
        }
        *(rtn as *mut f64) = sum;
    }
}

unsafe extern "C" fn scale_packed(_device_id: c_int, args: *const *mut c_void, _rtn: *mut c_void) {
    unsafe {
        let n: i32 = value_arg(args, 0);
        let a: f64 = value_arg(args, 1);
        let x = ptr_arg::<f64>(args, 2);
        for i in 0..n as usize {
            *x.add(i) *= a;
        }
    }
}

unsafe extern "C" fn fill_packed(device_id: c_int, args: *const *mut c_void, _rtn: *mut c_void) {
    unsafe {
        let n: i32 = value_arg(args, 0);
        let out = ptr_arg::<f32>(args, 1);
        for i in 0..n as usize {
            *out.add(i) = device_id as f32;
        }
    }
}

unsafe extern "C" fn fill_async(
    device_id: c_int,
    args: *const *mut c_void,
    resolve: opforge_runtime::ResolveFn,
    resolve_ctx: *mut c_void,
) {
    unsafe {
        let n: i32 = *(*args.add(0) as *const i32);
        let out = resolve(resolve_ctx, *args.add(1)) as *mut f32;
        for i in 0..n as usize {
            *out.add(i) = device_id as f32 + i as f32;
        }
    }
}

fn entry_for(decl: &Declaration, types: &str, packed: opforge_runtime::PackedFn) -> NativeEntry {
    let idcode = IdCode::parse(&format!("{}:{}", decl.name, types)).unwrap();
    // SAFETY: every packed function above matches the signature it is registered for.
    unsafe { NativeEntry::from_raw(idcode, packed, None) }
}

#[test]
fn test_add_writes_output_and_returns_count() {
    let d = decl("OPFORGE_FUNC int add(const int* a, const int* b, int* out, int n) {");
    let entry = entry_for(&d, "const int*,const int*,int*,int", add_packed);
    let glues = GlueRegistry::with_host_defaults();

    let a = vec![1, 2, 3];
    let b = vec![4, 5, 6];
    let mut out = vec![0; 3];
    let binding = bind(
        &d,
        CallArgs::new().tensor(&a).tensor(&b).tensor_mut(&mut out).scalar(3),
        &glues,
    )
    .unwrap();
    assert_eq!(binding.idcode(), *entry.idcode());

    let ret = invoke(&entry, &d, binding, false).unwrap();
    assert_eq!(ret, Some(Scalar::I32(3)));
    assert_eq!(out, vec![5, 7, 9]);
}

#[test]
fn test_floating_point_return() {
    let d = decl("OPFORGE_FUNC double dot(const double* x, const double* y, const int n) {");
    let entry = entry_for(&d, "const double*,const double*,const int", dot_packed);
    let glues = GlueRegistry::with_host_defaults();

    let x = vec![1.0, 2.0, 3.0];
    let y = vec![0.5, 0.25, 2.0];
    let binding = bind(&d, CallArgs::new().tensor(&x).tensor(&y).scalar(3), &glues).unwrap();
    let ret = invoke(&entry, &d, binding, false).unwrap();
    assert_eq!(ret, Some(Scalar::F64(7.0)));
}

#[test]
fn test_template_scalar_converted_to_tensor_type() {
    let d = decl("template <typename T>\nOPFORGE_FUNC void scale(const int n, const T a, T* x) {");
    let entry = entry_for(&d, "const int,const double,double*", scale_packed);
    let glues = GlueRegistry::with_host_defaults();

    let mut x = vec![1.0, 2.0];
    // An integer literal binds to the template type resolved from `x`.
    let binding = bind(&d, CallArgs::new().scalar(2).scalar(3).tensor_mut(&mut x), &glues).unwrap();
    assert_eq!(binding.idcode(), *entry.idcode());
    assert_eq!(invoke(&entry, &d, binding, false).unwrap(), None);
    assert_eq!(x, vec![3.0, 6.0]);
}

/// Device-resident buffer addressed by a handle.
struct DeviceBuf {
    handle: usize,
    len: usize,
    ordinal: u32,
}

/// Glue for [`DeviceBuf`] that records asynchronous submissions.
#[derive(Default)]
struct DeviceGlue {
    submitted: Mutex<Vec<AsyncCall>>,
}

impl Glue for DeviceGlue {
    fn name(&self) -> &str {
        "DeviceBuf"
    }

    fn capabilities(&self) -> GlueCapabilities {
        GlueCapabilities::full()
    }

    fn element_type(&self, value: &dyn Any) -> Option<ScalarType> {
        value.is::<DeviceBuf>().then_some(ScalarType::F32)
    }

    fn device(&self, value: &dyn Any) -> Option<Device> {
        value.downcast_ref::<DeviceBuf>().map(|b| Device::Gpu(b.ordinal))
    }

    fn data_ptr(&self, _value: &dyn Any) -> Option<RawData> {
        None
    }

    fn data_ptr_mut(&self, _value: &mut dyn Any) -> Option<RawData> {
        None
    }

    fn async_handle(&self, value: &dyn Any) -> Option<*mut c_void> {
        value
            .downcast_ref::<DeviceBuf>()
            .map(|b| b.handle as *mut c_void)
    }

    fn submit_async(&self, call: AsyncCall) -> opforge_core::Result<()> {
        self.submitted.lock().push(call);
        Ok(())
    }
}

/// Resolves a handle to the matching buffer of an arena.
unsafe extern "C" fn resolve_arena(ctx: *mut c_void, handle: *mut c_void) -> *mut c_void {
    let arena = unsafe { &mut *(ctx as *mut Vec<Vec<f32>>) };
    arena[handle as usize - 1].as_mut_ptr() as *mut c_void
}

#[test]
fn test_async_submission_passes_handles() {
    let d = decl("OPFORGE_KERNEL fill_kernel(const int n, float* out) {");
    assert!(d.has_async_adapter());
    let idcode = IdCode::parse("fill:const int,float*").unwrap();
    // SAFETY: both entries implement `fill(const int, float*)`.
    let entry = unsafe { NativeEntry::from_raw(idcode, fill_packed, Some(fill_async)) };

    let glue = Arc::new(DeviceGlue::default());
    let mut glues = GlueRegistry::new();
    glues.register_arc(std::any::TypeId::of::<DeviceBuf>(), glue.clone());

    let mut buf = DeviceBuf {
        handle: 1,
        len: 4,
        ordinal: 2,
    };
    let binding = bind(&d, CallArgs::new().scalar(4).tensor_mut(&mut buf), &glues).unwrap();
    assert_eq!(binding.device(), Device::Gpu(2));
    assert_eq!(invoke(&entry, &d, binding, true).unwrap(), None);

    let call = glue.submitted.lock().pop().unwrap();
    assert_eq!(call.symbol, entry.symbol());
    assert_eq!(call.device_id, 2);
    assert_eq!(call.slots[1], 1);
    assert!(call.const_positions.is_empty());
    assert_eq!(call.mutable_positions, vec![1]);

    let mut arena = vec![vec![0.0f32; buf.len]];
    // SAFETY: handle 1 resolves to the first arena buffer, which holds four floats.
    unsafe { call.invoke(resolve_arena, &mut arena as *mut Vec<Vec<f32>> as *mut c_void) };
    assert_eq!(arena[0], vec![2.0, 3.0, 4.0, 5.0]);
}

#[test]
fn test_sync_path_without_host_pointer_fails() {
    let d = decl("OPFORGE_KERNEL fill_kernel(const int n, float* out) {");
    let entry = entry_for(&d, "const int,float*", fill_packed);
    let glue = Arc::new(DeviceGlue::default());
    let mut glues = GlueRegistry::new();
    glues.register_arc(std::any::TypeId::of::<DeviceBuf>(), glue.clone());

    let mut buf = DeviceBuf {
        handle: 1,
        len: 4,
        ordinal: 0,
    };
    // No async adapter and no host pointer: the sync path has nothing to pass.
    let binding = bind(&d, CallArgs::new().scalar(4).tensor_mut(&mut buf), &glues).unwrap();
    let err = invoke(&entry, &d, binding, true).unwrap_err();
    assert!(matches!(err, OpforgeError::Load(_)), "{}", err);
    assert!(glue.submitted.lock().is_empty());
}

#[test]
fn test_mixed_devices_rejected_in_either_order() {
    let d = decl("OPFORGE_FUNC void copy(const float* x, float* y) {");
    let mut glues = GlueRegistry::with_host_defaults();
    glues.register::<DeviceBuf>(DeviceGlue::default());

    let host = vec![0.0f32; 4];
    let mut dev = DeviceBuf {
        handle: 1,
        len: 4,
        ordinal: 0,
    };
    let err = bind(&d, CallArgs::new().tensor(&host).tensor_mut(&mut dev), &glues)
        .err()
        .unwrap();
    match err {
        OpforgeError::MultiDevice { first, second, .. } => {
            assert_eq!(first, "host");
            assert_eq!(second, "gpu:0");
        }
        other => panic!("unexpected error: {}", other),
    }

    let src = DeviceBuf {
        handle: 2,
        len: 4,
        ordinal: 0,
    };
    let mut out = vec![0.0f32; 4];
    let err = bind(&d, CallArgs::new().tensor(&src).tensor_mut(&mut out), &glues)
        .err()
        .unwrap();
    assert!(matches!(err, OpforgeError::MultiDevice { .. }));

    let other = DeviceBuf {
        handle: 3,
        len: 4,
        ordinal: 1,
    };
    let err = bind(&d, CallArgs::new().tensor(&other).tensor_mut(&mut dev), &glues)
        .err()
        .unwrap();
    assert!(err.to_string().contains("gpu:1"), "{}", err);
}

/// Tensor whose storage is not contiguous, so calls go through a staging copy.
struct Chunked {
    chunks: Vec<Vec<f64>>,
}

#[derive(Default)]
struct ChunkedGlue {
    write_backs: Arc<AtomicUsize>,
}

impl ChunkedGlue {
    fn stage(value: &dyn Any) -> Option<Box<Vec<f64>>> {
        let t = value.downcast_ref::<Chunked>()?;
        Some(Box::new(t.chunks.concat()))
    }
}

impl Glue for ChunkedGlue {
    fn name(&self) -> &str {
        "Chunked"
    }

    fn element_type(&self, value: &dyn Any) -> Option<ScalarType> {
        value.is::<Chunked>().then_some(ScalarType::F64)
    }

    fn device(&self, value: &dyn Any) -> Option<Device> {
        value.is::<Chunked>().then_some(Device::Host)
    }

    fn data_ptr(&self, value: &dyn Any) -> Option<RawData> {
        let mut staged = Self::stage(value)?;
        Some(RawData::staged(staged.as_mut_ptr() as *mut c_void, staged))
    }

    fn data_ptr_mut(&self, value: &mut dyn Any) -> Option<RawData> {
        self.data_ptr(&*value)
    }

    fn write_back(&self, value: &mut dyn Any, staged: Box<dyn Any>) {
        let (Some(t), Ok(flat)) = (value.downcast_mut::<Chunked>(), staged.downcast::<Vec<f64>>())
        else {
            return;
        };
        let mut rest = flat.as_slice();
        for chunk in &mut t.chunks {
            let (head, tail) = rest.split_at(chunk.len());
            chunk.copy_from_slice(head);
            rest = tail;
        }
        self.write_backs.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_staged_arguments_are_written_back() {
    let d = decl("template <typename T>\nOPFORGE_FUNC void scale(const int n, const T a, T* x) {");
    let entry = entry_for(&d, "const int,const double,double*", scale_packed);
    let glue = ChunkedGlue::default();
    let write_backs = glue.write_backs.clone();
    let mut glues = GlueRegistry::new();
    glues.register::<Chunked>(glue);

    let mut x = Chunked {
        chunks: vec![vec![1.0, 2.0], vec![3.0]],
    };
    let binding = bind(&d, CallArgs::new().scalar(3).scalar(10.0).tensor_mut(&mut x), &glues).unwrap();
    invoke(&entry, &d, binding, false).unwrap();

    assert_eq!(write_backs.load(Ordering::SeqCst), 1);
    assert_eq!(x.chunks, vec![vec![10.0, 20.0], vec![30.0]]);
}

/// Host vector with pending work that must be fenced.
struct Pending(Vec<f64>);

#[derive(Default)]
struct FenceCounter {
    reads: AtomicUsize,
    writes: AtomicUsize,
}

struct FencedGlue(Arc<FenceCounter>);

impl Glue for FencedGlue {
    fn name(&self) -> &str {
        "Pending"
    }

    fn capabilities(&self) -> GlueCapabilities {
        GlueCapabilities::fenced()
    }

    fn element_type(&self, value: &dyn Any) -> Option<ScalarType> {
        value.is::<Pending>().then_some(ScalarType::F64)
    }

    fn device(&self, value: &dyn Any) -> Option<Device> {
        value.is::<Pending>().then_some(Device::Host)
    }

    fn data_ptr(&self, value: &dyn Any) -> Option<RawData> {
        let p = value.downcast_ref::<Pending>()?;
        Some(RawData::direct(p.0.as_ptr() as *mut c_void))
    }

    fn data_ptr_mut(&self, value: &mut dyn Any) -> Option<RawData> {
        let p = value.downcast_mut::<Pending>()?;
        Some(RawData::direct(p.0.as_mut_ptr() as *mut c_void))
    }

    fn wait_to_read(&self, _value: &dyn Any) {
        self.0.reads.fetch_add(1, Ordering::SeqCst);
    }

    fn wait_to_write(&self, _value: &dyn Any) {
        self.0.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_fences_follow_constness() {
    let d = decl("OPFORGE_FUNC double dot(const double* x, const double* y, const int n) {");
    let entry = entry_for(&d, "const double*,const double*,const int", dot_packed);
    let counter = Arc::new(FenceCounter::default());
    let mut glues = GlueRegistry::new();
    glues.register::<Pending>(FencedGlue(counter.clone()));

    let x = Pending(vec![1.0, 1.0]);
    let y = Pending(vec![2.0, 3.0]);
    let binding = bind(&d, CallArgs::new().tensor(&x).tensor(&y).scalar(2), &glues).unwrap();
    assert_eq!(invoke(&entry, &d, binding, true).unwrap(), Some(Scalar::F64(5.0)));
    assert_eq!(counter.reads.load(Ordering::SeqCst), 2);
    assert_eq!(counter.writes.load(Ordering::SeqCst), 0);

    let s = decl("template <typename T>\nOPFORGE_FUNC void scale(const int n, const T a, T* x) {");
    let entry = entry_for(&s, "const int,const double,double*", scale_packed);
    let mut z = Pending(vec![1.0]);
    let binding = bind(&s, CallArgs::new().scalar(1).scalar(4.0).tensor_mut(&mut z), &glues).unwrap();
    invoke(&entry, &s, binding, false).unwrap();
    assert_eq!(counter.writes.load(Ordering::SeqCst), 1);
    assert_eq!(z.0, vec![4.0]);
}
