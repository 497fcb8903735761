//! Call binding and marshaling.
//!
//! [`bind`] checks call arguments against a declaration, resolves template
//! parameters from tensor element types and determines the call-wide device.
//! [`invoke`] then fences the tensors, packs every argument into an 8-byte
//! slot and calls the entry's packed trampoline, or hands the call to the
//! glue's asynchronous engine.

use std::any::Any;
use std::collections::BTreeMap;
use std::os::raw::c_void;
use std::sync::Arc;

use tracing::debug;

use opforge_codegen::{const_positions, mutable_positions};
use opforge_core::{
    Context, DType, Declaration, Device, EngineConfig, FuncKind, IdCode, OpforgeError, ParamType,
    Result, Scalar, ScalarType,
};

use crate::glue::{AsyncCall, Glue, GlueRegistry};
use crate::registry::NativeEntry;

/// One call argument.
pub enum Arg<'a> {
    /// A tensor the callee only reads.
    Tensor(&'a dyn Any),
    /// A tensor the callee may write.
    TensorMut(&'a mut dyn Any),
    /// A scalar value.
    Scalar(Scalar),
}

impl<'a> Arg<'a> {
    /// Read-only tensor argument.
    pub fn tensor<T: Any>(value: &'a T) -> Self {
        Arg::Tensor(value)
    }

    /// Writable tensor argument.
    pub fn tensor_mut<T: Any>(value: &'a mut T) -> Self {
        Arg::TensorMut(value)
    }

    /// Scalar argument.
    pub fn scalar(value: impl Into<Scalar>) -> Self {
        Arg::Scalar(value.into())
    }
}

impl From<Scalar> for Arg<'_> {
    fn from(value: Scalar) -> Self {
        Arg::Scalar(value)
    }
}

/// Positional and named call arguments.
#[derive(Default)]
pub struct CallArgs<'a> {
    positional: Vec<Arg<'a>>,
    named: Vec<(String, Arg<'a>)>,
}

impl<'a> CallArgs<'a> {
    /// No arguments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn arg(mut self, arg: Arg<'a>) -> Self {
        self.positional.push(arg);
        self
    }

    /// Append a read-only tensor.
    pub fn tensor<T: Any>(self, value: &'a T) -> Self {
        self.arg(Arg::tensor(value))
    }

    /// Append a writable tensor.
    pub fn tensor_mut<T: Any>(self, value: &'a mut T) -> Self {
        self.arg(Arg::tensor_mut(value))
    }

    /// Append a scalar.
    pub fn scalar(self, value: impl Into<Scalar>) -> Self {
        self.arg(Arg::scalar(value))
    }

    /// Pass `arg` for the parameter called `name`.
    pub fn named(mut self, name: impl Into<String>, arg: Arg<'a>) -> Self {
        self.named.push((name.into(), arg));
        self
    }

    /// Total number of arguments.
    pub fn len(&self) -> usize {
        self.positional.len() + self.named.len()
    }

    /// Whether there are no arguments.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum TensorRef<'a> {
    Shared(&'a dyn Any),
    Mut(&'a mut dyn Any),
}

impl TensorRef<'_> {
    fn get(&self) -> &dyn Any {
        match self {
            TensorRef::Shared(v) => *v,
            TensorRef::Mut(v) => &**v,
        }
    }
}

enum BoundArg<'a> {
    Tensor {
        value: TensorRef<'a>,
        glue: Arc<dyn Glue>,
        writable: bool,
    },
    Scalar(Scalar),
}

/// Arguments checked against a declaration, ready to invoke.
pub struct CallBinding<'a> {
    function: String,
    args: Vec<BoundArg<'a>>,
    types: Vec<DType>,
    device: Option<Device>,
    mapping: BTreeMap<String, ScalarType>,
    ret: Option<ScalarType>,
}

fn describe(arg: &Arg<'_>, glues: &GlueRegistry) -> String {
    let tensor = |value: &dyn Any| match glues.find(value) {
        Some(glue) => match glue.device(value) {
            Some(device) => format!("{}@{}", glue.name(), device),
            None => glue.name().to_string(),
        },
        None => "<unregistered tensor>".to_string(),
    };
    match arg {
        Arg::Tensor(v) => tensor(*v),
        Arg::TensorMut(v) => format!("mut {}", tensor(&**v)),
        Arg::Scalar(s) => format!("{} {}", s.scalar_type(), s),
    }
}

/// Check `args` against `decl`.
pub fn bind<'a>(decl: &Declaration, args: CallArgs<'a>, glues: &GlueRegistry) -> Result<CallBinding<'a>> {
    let supplied = args
        .positional
        .iter()
        .map(|a| describe(a, glues))
        .chain(
            args.named
                .iter()
                .map(|(name, a)| format!("{}={}", name, describe(a, glues))),
        )
        .collect::<Vec<_>>()
        .join(", ");
    let mismatch = |reason: String| OpforgeError::TypeMismatch {
        function: decl.name.clone(),
        declared: decl.declared_types(),
        supplied: supplied.clone(),
        reason,
    };

    let n = decl.params.len();
    let CallArgs { positional, named } = args;
    if positional.len() > n {
        return Err(mismatch(format!(
            "expected at most {} arguments, got {}",
            n,
            positional.len()
        )));
    }
    let mut slots: Vec<Option<Arg<'a>>> = (0..n).map(|_| None).collect();
    for (slot, arg) in slots.iter_mut().zip(positional) {
        *slot = Some(arg);
    }
    for (name, arg) in named {
        let idx = decl
            .params
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| mismatch(format!("unknown argument `{}`", name)))?;
        if slots[idx].is_some() {
            return Err(mismatch(format!("multiple values for argument `{}`", name)));
        }
        slots[idx] = Some(arg);
    }

    let mut mapping: BTreeMap<String, ScalarType> = BTreeMap::new();
    let mut device: Option<Device> = None;
    let mut bound = Vec::with_capacity(n);
    let mut types: Vec<Option<DType>> = Vec::with_capacity(n);
    let mut deferred = Vec::new();

    for (param, slot) in decl.params.iter().zip(slots) {
        let arg = slot.ok_or_else(|| mismatch(format!("missing argument `{}`", param.name)))?;

        if !param.ty.is_pointer() {
            let Arg::Scalar(value) = arg else {
                return Err(mismatch(format!(
                    "argument `{}` expects a scalar, got a tensor",
                    param.name
                )));
            };
            match &param.ty {
                ParamType::Concrete(t) => {
                    let converted = value.convert(t.scalar).ok_or_else(|| {
                        mismatch(format!(
                            "argument `{}` expects {}, got {} {}",
                            param.name,
                            t,
                            value.scalar_type(),
                            value
                        ))
                    })?;
                    types.push(Some(*t));
                    bound.push(BoundArg::Scalar(converted));
                }
                ParamType::Template(t) => {
                    deferred.push((bound.len(), t.clone(), value));
                    types.push(None);
                    bound.push(BoundArg::Scalar(value));
                }
            }
            continue;
        }

        let (value, passed_mut) = match arg {
            Arg::Scalar(s) => {
                return Err(mismatch(format!(
                    "argument `{}` expects a tensor, got {} {}",
                    param.name,
                    s.scalar_type(),
                    s
                )))
            }
            Arg::Tensor(v) => (TensorRef::Shared(v), false),
            Arg::TensorMut(v) => (TensorRef::Mut(v), true),
        };
        let writable = !param.ty.is_const();
        if writable && !passed_mut {
            return Err(mismatch(format!(
                "argument `{}` is written by `{}`; pass it mutably",
                param.name, decl.name
            )));
        }
        let glue = glues
            .find(value.get())
            .ok_or_else(|| mismatch(format!("no glue registered for argument `{}`", param.name)))?;
        let (elem, dev) = match (glue.element_type(value.get()), glue.device(value.get())) {
            (Some(elem), Some(dev)) => (elem, dev),
            _ => {
                return Err(mismatch(format!(
                    "glue `{}` does not describe argument `{}`",
                    glue.name(),
                    param.name
                )))
            }
        };

        match device {
            None => device = Some(dev),
            Some(first) if first != dev => {
                return Err(OpforgeError::MultiDevice {
                    function: decl.name.clone(),
                    first: first.to_string(),
                    second: dev.to_string(),
                })
            }
            Some(_) => {}
        }

        let ty = match &param.ty {
            ParamType::Concrete(t) => {
                if t.scalar != ScalarType::Void && t.scalar != elem {
                    return Err(mismatch(format!(
                        "argument `{}` expects {}, got a tensor of {}",
                        param.name, t, elem
                    )));
                }
                *t
            }
            ParamType::Template(t) => {
                match mapping.get(&t.name) {
                    Some(bound_ty) if *bound_ty != elem => {
                        return Err(OpforgeError::template(
                            &decl.name,
                            format!(
                                "argument `{}` binds `{}` to {} but it is already {}",
                                param.name, t.name, elem, bound_ty
                            ),
                        ))
                    }
                    Some(_) => {}
                    None => {
                        mapping.insert(t.name.clone(), elem);
                    }
                }
                t.instantiate(elem)
            }
        };
        types.push(Some(ty));
        bound.push(BoundArg::Tensor {
            value,
            glue,
            writable,
        });
    }

    for (idx, t, value) in deferred {
        let target = mapping.get(&t.name).copied().ok_or_else(|| {
            OpforgeError::template(
                &decl.name,
                format!(
                    "template type `{}` of argument `{}` is not determined by any tensor",
                    t.name, decl.params[idx].name
                ),
            )
        })?;
        let converted = value.convert(target).ok_or_else(|| {
            mismatch(format!(
                "argument `{}` expects {}, got {} {}",
                decl.params[idx].name,
                target,
                value.scalar_type(),
                value
            ))
        })?;
        bound[idx] = BoundArg::Scalar(converted);
        types[idx] = Some(t.instantiate(target));
    }
    if let Some(missing) = decl.templates.iter().find(|t| !mapping.contains_key(*t)) {
        return Err(OpforgeError::template(
            &decl.name,
            format!("template parameter `{}` is not determined by any argument", missing),
        ));
    }

    let ret = decl.resolved_return(&mapping)?;
    Ok(CallBinding {
        function: decl.name.clone(),
        args: bound,
        types: types.into_iter().flatten().collect(),
        device,
        mapping,
        ret,
    })
}

impl CallBinding<'_> {
    /// Function name.
    pub fn function(&self) -> &str {
        &self.function
    }

    /// Concrete argument types.
    pub fn types(&self) -> &[DType] {
        &self.types
    }

    /// Signature of the call.
    pub fn idcode(&self) -> IdCode {
        IdCode::new(&self.function, &self.types)
    }

    /// Device of the tensor arguments (host when there are none).
    pub fn device(&self) -> Device {
        self.device.unwrap_or(Device::Host)
    }

    /// Native device id.
    pub fn device_id(&self) -> i32 {
        self.device().native_id()
    }

    /// Build context the call runs in.
    pub fn context(&self, config: &EngineConfig) -> Context {
        match self.device() {
            Device::Host => Context::Cpu,
            Device::Gpu(_) => Context::Gpu(config.gpu_backend.clone()),
        }
    }

    /// Template parameters resolved from the arguments.
    pub fn template_mapping(&self) -> &BTreeMap<String, ScalarType> {
        &self.mapping
    }

    /// Return type with templates substituted.
    pub fn return_type(&self) -> Option<ScalarType> {
        self.ret
    }

    /// The glue shared by every tensor argument, if there is exactly one.
    fn common_glue(&self) -> Option<Arc<dyn Glue>> {
        let mut common: Option<&Arc<dyn Glue>> = None;
        for arg in &self.args {
            if let BoundArg::Tensor { glue, .. } = arg {
                match common {
                    None => common = Some(glue),
                    Some(c) if Arc::as_ptr(c) as *const () == Arc::as_ptr(glue) as *const () => {}
                    Some(_) => return None,
                }
            }
        }
        common.cloned()
    }

    fn async_call(&self, entry: &NativeEntry) -> Option<(Arc<dyn Glue>, AsyncCall)> {
        let async_fn = entry.async_fn()?;
        let glue = self.common_glue()?;
        if !glue.capabilities().supports_async() {
            return None;
        }
        let mut slots = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            match arg {
                BoundArg::Tensor { value, .. } => {
                    slots.push(glue.async_handle(value.get())? as usize as u64)
                }
                BoundArg::Scalar(s) => slots.push(s.to_slot()),
            }
        }
        let call = AsyncCall {
            symbol: entry.symbol().to_string(),
            entry: async_fn,
            device_id: self.device_id(),
            slots,
            const_positions: const_positions(&self.types),
            mutable_positions: mutable_positions(&self.types),
        };
        Some((glue, call))
    }
}

/// Run `binding` through `entry`.
///
/// With `async_exec` set, kernels whose tensors all share one glue that can
/// run asynchronously are submitted to it without fencing. Every other call
/// fences its tensors, runs synchronously and returns the decoded result.
pub fn invoke(
    entry: &NativeEntry,
    decl: &Declaration,
    mut binding: CallBinding<'_>,
    async_exec: bool,
) -> Result<Option<Scalar>> {
    if async_exec && decl.kind == FuncKind::Kernel {
        if let Some((glue, call)) = binding.async_call(entry) {
            debug!(
                function = %binding.function,
                symbol = entry.symbol(),
                glue = glue.name(),
                "Submitting asynchronous call"
            );
            glue.submit_async(call)?;
            return Ok(None);
        }
    }

    let mut slots: Vec<u64> = Vec::with_capacity(binding.args.len());
    let mut staged: Vec<(usize, Box<dyn Any>)> = Vec::new();
    let mut keep_alive: Vec<Box<dyn Any>> = Vec::new();

    for (i, arg) in binding.args.iter_mut().enumerate() {
        let (value, glue, writable) = match arg {
            BoundArg::Scalar(s) => {
                slots.push(s.to_slot());
                continue;
            }
            BoundArg::Tensor {
                value,
                glue,
                writable,
            } => (value, glue, *writable),
        };
        let caps = glue.capabilities();
        let raw = if writable {
            if caps.write_fence {
                glue.wait_to_write(value.get());
            }
            match value {
                TensorRef::Mut(v) => glue.data_ptr_mut(&mut **v),
                TensorRef::Shared(_) => None,
            }
        } else {
            if caps.read_fence {
                glue.wait_to_read(value.get());
            }
            glue.data_ptr(value.get())
        };
        let raw = raw.ok_or_else(|| {
            OpforgeError::Load(format!(
                "glue `{}` returned no data pointer for argument {} of `{}`",
                glue.name(),
                i,
                binding.function
            ))
        })?;
        slots.push(raw.ptr as usize as u64);
        match raw.staged {
            Some(s) if writable => staged.push((i, s)),
            Some(s) => keep_alive.push(s),
            None => {}
        }
    }

    let args: Vec<*mut c_void> = slots
        .iter_mut()
        .map(|slot| slot as *mut u64 as *mut c_void)
        .collect();
    let mut rtn: u64 = 0;
    debug!(
        function = %binding.function,
        symbol = entry.symbol(),
        device = %binding.device(),
        "Invoking native entry"
    );
    // SAFETY: the entry was registered for exactly these argument types, and
    // every pointer slot refers to storage borrowed by `binding` or staged
    // above, all of which outlive the call.
    unsafe {
        (entry.packed())(
            binding.device_id(),
            args.as_ptr(),
            &mut rtn as *mut u64 as *mut c_void,
        )
    };

    for (i, s) in staged {
        if let BoundArg::Tensor {
            value: TensorRef::Mut(v),
            glue,
            ..
        } = &mut binding.args[i]
        {
            glue.write_back(&mut **v, s);
        }
    }
    drop(keep_alive);

    Ok(binding.ret.and_then(|t| Scalar::from_slot(t, rtn)))
}
