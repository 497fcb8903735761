//! Type model of declared kernel parameters.
//!
//! A parameter is either a [`DType`] (a primitive scalar, or a single-level
//! pointer to one) or a [`TemplateType`] whose element type is only known
//! once call arguments are bound.

use std::fmt;

/// Primitive element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScalarType {
    /// `bool`
    Bool,
    /// `int8_t`
    I8,
    /// `int16_t`
    I16,
    /// `int`
    I32,
    /// `int64_t`
    I64,
    /// `uint8_t`
    U8,
    /// `uint16_t`
    U16,
    /// `uint32_t`
    U32,
    /// `uint64_t`
    U64,
    /// `float`
    F32,
    /// `double`
    F64,
    /// `void`, only valid behind a pointer.
    Void,
}

impl ScalarType {
    /// Every scalar type, in declaration order.
    pub const ALL: [ScalarType; 12] = [
        ScalarType::Bool,
        ScalarType::I8,
        ScalarType::I16,
        ScalarType::I32,
        ScalarType::I64,
        ScalarType::U8,
        ScalarType::U16,
        ScalarType::U32,
        ScalarType::U64,
        ScalarType::F32,
        ScalarType::F64,
        ScalarType::Void,
    ];

    /// Canonical C name, used in IdCodes and generated code.
    pub fn cname(&self) -> &'static str {
        match self {
            ScalarType::Bool => "bool",
            ScalarType::I8 => "int8_t",
            ScalarType::I16 => "int16_t",
            ScalarType::I32 => "int",
            ScalarType::I64 => "int64_t",
            ScalarType::U8 => "uint8_t",
            ScalarType::U16 => "uint16_t",
            ScalarType::U32 => "uint32_t",
            ScalarType::U64 => "uint64_t",
            ScalarType::F32 => "float",
            ScalarType::F64 => "double",
            ScalarType::Void => "void",
        }
    }

    /// Look up a primitive by its C spelling.
    ///
    /// Accepts the canonical names plus typedef-equivalent aliases
    /// (`int32_t`, `short`, `unsigned`). Returns `None` for anything else,
    /// which the parser treats as a template name.
    pub fn from_cname(name: &str) -> Option<Self> {
        match name {
            "int32_t" => return Some(ScalarType::I32),
            "short" => return Some(ScalarType::I16),
            "unsigned" => return Some(ScalarType::U32),
            _ => {}
        }
        Self::ALL.iter().copied().find(|t| t.cname() == name)
    }

    /// Size in bytes of one element (`0` for `void`).
    pub fn size(&self) -> usize {
        match self {
            ScalarType::Void => 0,
            ScalarType::Bool | ScalarType::I8 | ScalarType::U8 => 1,
            ScalarType::I16 | ScalarType::U16 => 2,
            ScalarType::I32 | ScalarType::U32 | ScalarType::F32 => 4,
            ScalarType::I64 | ScalarType::U64 | ScalarType::F64 => 8,
        }
    }

    /// Whether this is an integer type (`bool` excluded).
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            ScalarType::I8
                | ScalarType::I16
                | ScalarType::I32
                | ScalarType::I64
                | ScalarType::U8
                | ScalarType::U16
                | ScalarType::U32
                | ScalarType::U64
        )
    }

    /// Whether this is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, ScalarType::F32 | ScalarType::F64)
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cname())
    }
}

/// A fully concrete parameter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DType {
    /// Element type.
    pub scalar: ScalarType,
    /// Single-level pointer.
    pub is_pointer: bool,
    /// `const` qualified.
    pub is_const: bool,
}

impl DType {
    /// A by-value scalar.
    pub const fn scalar(scalar: ScalarType) -> Self {
        Self {
            scalar,
            is_pointer: false,
            is_const: false,
        }
    }

    /// A mutable pointer to `scalar`.
    pub const fn pointer(scalar: ScalarType) -> Self {
        Self {
            scalar,
            is_pointer: true,
            is_const: false,
        }
    }

    /// A const pointer to `scalar`.
    pub const fn const_pointer(scalar: ScalarType) -> Self {
        Self {
            scalar,
            is_pointer: true,
            is_const: true,
        }
    }

    /// Same type with the const qualifier set.
    pub const fn with_const(mut self, is_const: bool) -> Self {
        self.is_const = is_const;
        self
    }

    /// Canonical C spelling, e.g. `const float*`.
    pub fn cname(&self) -> String {
        let mut s = String::new();
        if self.is_const {
            s.push_str("const ");
        }
        s.push_str(self.scalar.cname());
        if self.is_pointer {
            s.push('*');
        }
        s
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cname())
    }
}

/// A parameter type whose element is a template placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TemplateType {
    /// Template parameter name, e.g. `T`.
    pub name: String,
    /// Single-level pointer.
    pub is_pointer: bool,
    /// `const` qualified.
    pub is_const: bool,
}

impl TemplateType {
    /// Substitute a concrete element type.
    pub fn instantiate(&self, scalar: ScalarType) -> DType {
        DType {
            scalar,
            is_pointer: self.is_pointer,
            is_const: self.is_const,
        }
    }
}

impl fmt::Display for TemplateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_const {
            f.write_str("const ")?;
        }
        f.write_str(&self.name)?;
        if self.is_pointer {
            f.write_str("*")?;
        }
        Ok(())
    }
}

/// Declared type of one parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamType {
    /// Known primitive type.
    Concrete(DType),
    /// Template placeholder.
    Template(TemplateType),
}

impl ParamType {
    /// Whether the parameter is passed by pointer.
    pub fn is_pointer(&self) -> bool {
        match self {
            ParamType::Concrete(t) => t.is_pointer,
            ParamType::Template(t) => t.is_pointer,
        }
    }

    /// Whether the parameter is const qualified.
    pub fn is_const(&self) -> bool {
        match self {
            ParamType::Concrete(t) => t.is_const,
            ParamType::Template(t) => t.is_const,
        }
    }

    /// Template name, if any.
    pub fn template_name(&self) -> Option<&str> {
        match self {
            ParamType::Concrete(_) => None,
            ParamType::Template(t) => Some(&t.name),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Concrete(t) => t.fmt(f),
            ParamType::Template(t) => t.fmt(f),
        }
    }
}

/// Execution target selecting which artifact variant to build and load.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Context {
    /// Host code.
    Cpu,
    /// An accelerator backend, named e.g. `cuda` or `hip`.
    Gpu(String),
}

impl Context {
    /// Name embedded in artifact file names.
    pub fn name(&self) -> &str {
        match self {
            Context::Cpu => "cpu",
            Context::Gpu(backend) => backend,
        }
    }

    /// Whether this is the host context.
    pub fn is_host(&self) -> bool {
        matches!(self, Context::Cpu)
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Device a tensor argument lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    /// Host memory.
    Host,
    /// Accelerator with the given ordinal.
    Gpu(u32),
}

impl Device {
    /// Device id passed to native kernels (`-1` for host).
    pub fn native_id(&self) -> i32 {
        match self {
            Device::Host => -1,
            Device::Gpu(id) => *id as i32,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Host => f.write_str("host"),
            Device::Gpu(id) => write!(f, "gpu:{}", id),
        }
    }
}

/// Rust element types with a native counterpart.
pub trait Element: Copy + Send + Sync + 'static {
    /// Matching scalar type.
    const SCALAR: ScalarType;
}

macro_rules! impl_element {
    ($($ty:ty => $scalar:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const SCALAR: ScalarType = ScalarType::$scalar;
            }
        )*
    };
}

impl_element! {
    bool => Bool,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
}
