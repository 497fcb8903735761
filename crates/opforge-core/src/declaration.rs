//! Parsed kernel and function declarations.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{OpforgeError, Result};
use crate::types::{DType, ParamType, ScalarType};

/// Kind of an annotated declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FuncKind {
    /// Device-dispatched kernel; takes a device id and returns nothing.
    Kernel,
    /// Plain host function with an optional return value.
    Func,
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    /// Parameter name.
    pub name: String,
    /// Declared type.
    pub ty: ParamType,
}

/// Declared return type of a [`FuncKind::Func`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnType {
    /// Primitive scalar.
    Scalar(ScalarType),
    /// Template placeholder.
    Template(String),
}

/// Explicit template arguments for pre-building an instantiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateArgs {
    /// No template arguments (non-template declarations).
    None,
    /// Types consumed in order of first appearance of each template name.
    Positional(Vec<ScalarType>),
    /// Template name to type.
    Named(BTreeMap<String, ScalarType>),
}

/// A kernel or function declaration parsed from annotated source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    /// Public function name (kernel suffix stripped).
    pub name: String,
    /// Declaration kind.
    pub kind: FuncKind,
    /// Parameters in declared order.
    pub params: Vec<Param>,
    /// Return type; `None` for `void` and for kernels.
    pub ret: Option<ReturnType>,
    /// Template parameter names in header order; empty for ordinary functions.
    pub templates: Vec<String>,
    /// 1-based line of the marker.
    pub line: usize,
}

impl Declaration {
    /// Whether this declaration needs template instantiation.
    pub fn is_template(&self) -> bool {
        !self.templates.is_empty()
    }

    /// Name of the user-defined callee (`<name>_kernel` for kernels).
    pub fn callee_name(&self) -> String {
        match self.kind {
            FuncKind::Kernel => format!("{}{}", self.name, crate::parser::KERNEL_SUFFIX),
            FuncKind::Func => self.name.clone(),
        }
    }

    /// Parameter names in declared order.
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|p| p.name.as_str())
    }

    /// Declared parameter types, comma separated.
    pub fn declared_types(&self) -> String {
        self.params
            .iter()
            .map(|p| p.ty.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Concrete types of a non-template declaration.
    pub fn concrete_types(&self) -> Result<Vec<DType>> {
        self.params
            .iter()
            .map(|p| match &p.ty {
                ParamType::Concrete(t) => Ok(*t),
                ParamType::Template(t) => Err(OpforgeError::template(
                    &self.name,
                    format!("template parameter `{}` needs a concrete type", t.name),
                )),
            })
            .collect()
    }

    /// Whether a kernel gets an asynchronous adapter: every parameter is non-void.
    pub fn has_async_adapter(&self) -> bool {
        self.kind == FuncKind::Kernel
            && self.params.iter().all(|p| match &p.ty {
                ParamType::Concrete(t) => t.scalar != ScalarType::Void,
                ParamType::Template(_) => true,
            })
    }

    /// Check that `types` is a valid concrete type list for this declaration.
    pub fn check_types(&self, types: &[DType]) -> Result<()> {
        if types.len() != self.params.len() {
            return Err(self.mismatch(
                types,
                format!("expected {} arguments, got {}", self.params.len(), types.len()),
            ));
        }
        for (param, ty) in self.params.iter().zip(types) {
            let ok = match &param.ty {
                ParamType::Concrete(t) => t == ty,
                ParamType::Template(t) => {
                    t.is_pointer == ty.is_pointer
                        && t.is_const == ty.is_const
                        && ty.scalar != ScalarType::Void
                }
            };
            if !ok {
                return Err(self.mismatch(
                    types,
                    format!("argument `{}` expects {}, got {}", param.name, param.ty, ty),
                ));
            }
        }
        Ok(())
    }

    fn mismatch(&self, types: &[DType], reason: String) -> OpforgeError {
        OpforgeError::TypeMismatch {
            function: self.name.clone(),
            declared: self.declared_types(),
            supplied: types.iter().map(DType::cname).collect::<Vec<_>>().join(", "),
            reason,
        }
    }

    /// Derive the template binding implied by a concrete type list.
    ///
    /// Every listed template parameter must be bound exactly once.
    pub fn template_mapping(&self, types: &[DType]) -> Result<BTreeMap<String, ScalarType>> {
        self.check_types(types)?;
        let mut mapping = BTreeMap::new();
        for (param, ty) in self.params.iter().zip(types) {
            let Some(name) = param.ty.template_name() else {
                continue;
            };
            match mapping.get(name) {
                Some(bound) if *bound != ty.scalar => {
                    return Err(OpforgeError::template(
                        &self.name,
                        format!(
                            "expected template type {} instead of {} for `{}`",
                            bound, ty.scalar, name
                        ),
                    ));
                }
                Some(_) => {}
                None => {
                    mapping.insert(name.to_string(), ty.scalar);
                }
            }
        }
        if let Some(missing) = self.templates.iter().find(|t| !mapping.contains_key(*t)) {
            return Err(OpforgeError::template(
                &self.name,
                format!("template parameter `{}` is not determined by any argument", missing),
            ));
        }
        Ok(mapping)
    }

    /// Resolve the concrete type list from explicit template arguments.
    pub fn instantiate(&self, args: &TemplateArgs) -> Result<Vec<DType>> {
        let mut mapping: BTreeMap<String, ScalarType> = BTreeMap::new();
        match args {
            TemplateArgs::None => return self.concrete_types(),
            TemplateArgs::Positional(list) => {
                let mut remaining = list.iter();
                for param in &self.params {
                    let Some(name) = param.ty.template_name() else {
                        continue;
                    };
                    if mapping.contains_key(name) {
                        continue;
                    }
                    let ty = remaining.next().ok_or_else(|| {
                        OpforgeError::template(&self.name, format!("missing type for `{}`", name))
                    })?;
                    mapping.insert(name.to_string(), *ty);
                }
                if remaining.next().is_some() {
                    return Err(OpforgeError::template(&self.name, "redundant template type"));
                }
            }
            TemplateArgs::Named(named) => {
                for param in &self.params {
                    let Some(name) = param.ty.template_name() else {
                        continue;
                    };
                    let ty = named.get(name).ok_or_else(|| {
                        OpforgeError::template(
                            &self.name,
                            format!("unknown template type `{}`", name),
                        )
                    })?;
                    mapping.insert(name.to_string(), *ty);
                }
                if mapping.len() != named.len() {
                    return Err(OpforgeError::template(
                        &self.name,
                        format!(
                            "different template names: {:?} vs {:?}",
                            mapping.keys().collect::<Vec<_>>(),
                            named.keys().collect::<Vec<_>>()
                        ),
                    ));
                }
            }
        }
        let types = self
            .params
            .iter()
            .map(|p| match &p.ty {
                ParamType::Concrete(t) => *t,
                ParamType::Template(t) => t.instantiate(mapping[&t.name]),
            })
            .collect::<Vec<_>>();
        self.template_mapping(&types)?;
        Ok(types)
    }

    /// Return type with templates substituted.
    pub fn resolved_return(&self, mapping: &BTreeMap<String, ScalarType>) -> Result<Option<ScalarType>> {
        match &self.ret {
            None => Ok(None),
            Some(ReturnType::Scalar(t)) => Ok(Some(*t)),
            Some(ReturnType::Template(name)) => mapping.get(name).copied().map(Some).ok_or_else(|| {
                OpforgeError::template(
                    &self.name,
                    format!("return template type `{}` is not determined", name),
                )
            }),
        }
    }
}

impl fmt::Display for Declaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_template() {
            write!(f, "template <{}> ", self.templates.join(", "))?;
        }
        match &self.ret {
            None if self.kind == FuncKind::Func => f.write_str("void ")?,
            None => {}
            Some(ReturnType::Scalar(t)) => write!(f, "{} ", t)?,
            Some(ReturnType::Template(t)) => write!(f, "{} ", t)?,
        }
        write!(f, "{}(", self.callee_name())?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} {}", p.ty, p.name)?;
        }
        f.write_str(")")
    }
}
