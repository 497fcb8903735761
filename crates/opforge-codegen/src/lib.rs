//! Wrapper Code Generation for opforge
//!
//! Every function bound from an annotated source is reached through a small
//! set of generated C++ entry points, all named after the hashed symbol `h`
//! of its [`IdCode`]:
//!
//! - `h` - the typed direct entry (`device_id` first for kernels)
//! - `h_packed` - the uniform trampoline
//!   `void(int device_id, void* const* args, void* rtn)` the runtime calls
//! - `h_async` and `h_const_loc` - the asynchronous adapter of kernels whose
//!   parameters are all non-void
//!
//! The generated text is a pure function of its inputs.
//!
//! # Example
//!
//! ```
//! use opforge_codegen::CodeGenerator;
//! use opforge_core::parse_declarations;
//!
//! let decls = parse_declarations("OPFORGE_FUNC int twice(int x) {").unwrap();
//! let types = decls[0].concrete_types().unwrap();
//! let code = CodeGenerator::new().generate(&decls[0], &types).unwrap();
//! assert!(code.contains("_packed(const int device_id, void* const* args, void* rtn)"));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::path::{Path, PathBuf};

use opforge_core::{DType, Declaration, FuncKind, IdCode, Result, ScalarType};

/// Host definitions of the source markers and kernel-launch macros.
pub const HOST_PRELUDE: &str = include_str!("templates/host_prelude.h");

const WRAPPER_TEMPLATE: &str = include_str!("templates/wrapper.cpp.template");

/// Suffix of the uniform packed trampoline.
pub const PACKED_SUFFIX: &str = "_packed";
/// Suffix of the asynchronous adapter.
pub const ASYNC_SUFFIX: &str = "_async";
/// Suffix of the const-position table accessor.
pub const CONST_LOC_SUFFIX: &str = "_const_loc";

/// Entry-point generator.
#[derive(Debug, Clone, Default)]
pub struct CodeGenerator {
    _private: (),
}

impl CodeGenerator {
    /// Create a new code generator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate every entry point of `decl` instantiated at `types`.
    ///
    /// `types` must be a valid concrete list for the declaration; template
    /// parameters are resolved from it.
    pub fn generate(&self, decl: &Declaration, types: &[DType]) -> Result<String> {
        let mapping = decl.template_mapping(types)?;
        let ret = decl.resolved_return(&mapping)?;
        let symbol = IdCode::new(&decl.name, types).symbol();

        let callee = if decl.is_template() {
            let args = decl
                .templates
                .iter()
                .map(|t| mapping[t].cname())
                .collect::<Vec<_>>()
                .join(", ");
            format!("{}<{}>", decl.callee_name(), args)
        } else {
            decl.callee_name()
        };

        let params = decl
            .params
            .iter()
            .zip(types)
            .map(|(p, ty)| format!("{} {}", ty.cname(), p.name))
            .collect::<Vec<_>>();
        let names = decl.param_names().collect::<Vec<_>>().join(", ");

        let mut out = String::new();
        out.push_str(&format!("// {}\n", IdCode::new(&decl.name, types)));
        match decl.kind {
            FuncKind::Func => {
                let ret_name = ret.unwrap_or(ScalarType::Void).cname();
                let ret_kw = if ret.is_some() { "return " } else { "" };
                out.push_str(&format!(
                    "OPFORGE_DLL {} {}({}) {{\n  {}{}({});\n}}\n",
                    ret_name,
                    symbol,
                    params.join(", "),
                    ret_kw,
                    callee,
                    names
                ));
            }
            FuncKind::Kernel => {
                let mut full = vec!["const int device_id".to_string()];
                full.extend(params.iter().cloned());
                out.push_str(&format!(
                    "OPFORGE_DLL void {}({}) {{\n  KERNEL_RUN_BEGIN(device_id);\n  \
                     KERNEL_RUN(({}))({});\n  KERNEL_RUN_END();\n}}\n",
                    symbol,
                    full.join(", "),
                    callee,
                    names
                ));
            }
        }

        out.push_str(&packed_entry(&symbol, decl.kind, types, ret));
        if decl.has_async_adapter() {
            out.push_str(&async_entry(&symbol, types));
            out.push_str(&const_loc_entry(&symbol, types));
        }
        Ok(out)
    }
}

fn unpacked_args(types: &[DType]) -> String {
    types
        .iter()
        .enumerate()
        .map(|(i, ty)| format!("*static_cast<{}*>(args[{}])", ty.cname(), i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn packed_entry(symbol: &str, kind: FuncKind, types: &[DType], ret: Option<ScalarType>) -> String {
    let mut body = String::new();
    if types.is_empty() {
        body.push_str("  (void)args;\n");
    }
    if ret.is_none() {
        body.push_str("  (void)rtn;\n");
    }
    let call = match kind {
        FuncKind::Kernel if types.is_empty() => format!("{}(device_id)", symbol),
        FuncKind::Kernel => format!("{}(device_id, {})", symbol, unpacked_args(types)),
        FuncKind::Func => {
            body.push_str("  (void)device_id;\n");
            format!("{}({})", symbol, unpacked_args(types))
        }
    };
    match ret {
        Some(t) => body.push_str(&format!("  *static_cast<{}*>(rtn) = {};\n", t.cname(), call)),
        None => body.push_str(&format!("  {};\n", call)),
    }
    format!(
        "OPFORGE_DLL void {}{}(const int device_id, void* const* args, void* rtn) {{\n{}}}\n",
        symbol, PACKED_SUFFIX, body
    )
}

fn async_entry(symbol: &str, types: &[DType]) -> String {
    let mut body = String::new();
    if types.is_empty() {
        body.push_str("  (void)args;\n");
    }
    if !types.iter().any(|t| t.is_pointer) {
        body.push_str("  (void)resolve;\n  (void)resolve_ctx;\n");
    }
    let mut args = vec!["device_id".to_string()];
    args.extend(types.iter().enumerate().map(|(i, ty)| {
        if ty.is_pointer {
            // Pointer slots hold backend handles, not data pointers.
            format!("static_cast<{}>(resolve(resolve_ctx, args[{}]))", ty.cname(), i)
        } else {
            format!("*static_cast<{}*>(args[{}])", ty.cname(), i)
        }
    }));
    body.push_str(&format!("  {}({});\n", symbol, args.join(", ")));
    format!(
        "OPFORGE_DLL void {}{}(const int device_id, void* const* args, \
         opforge_resolve_fn resolve, void* resolve_ctx) {{\n{}}}\n",
        symbol, ASYNC_SUFFIX, body
    )
}

fn const_loc_entry(symbol: &str, types: &[DType]) -> String {
    let positions = const_positions(types);
    let body = if positions.is_empty() {
        "  *loc = nullptr;\n  return 0;\n".to_string()
    } else {
        let list = positions
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "  static const int positions[] = {{{}}};\n  *loc = positions;\n  return {};\n",
            list,
            positions.len()
        )
    };
    format!(
        "OPFORGE_DLL int {}{}(const int** loc) {{\n{}}}\n",
        symbol, CONST_LOC_SUFFIX, body
    )
}

/// Positions of const pointer arguments.
pub fn const_positions(types: &[DType]) -> Vec<usize> {
    types
        .iter()
        .enumerate()
        .filter(|(_, t)| t.is_pointer && t.is_const)
        .map(|(i, _)| i)
        .collect()
}

/// Positions of mutable pointer arguments.
pub fn mutable_positions(types: &[DType]) -> Vec<usize> {
    types
        .iter()
        .enumerate()
        .filter(|(_, t)| t.is_pointer && !t.is_const)
        .map(|(i, _)| i)
        .collect()
}

/// A complete wrapper translation unit.
#[derive(Debug, Clone)]
pub struct WrapperUnit {
    /// Context-specific definitions placed before the user source.
    pub prelude: String,
    /// Absolute path of the annotated source, included verbatim.
    pub source: PathBuf,
    /// Concatenated generated entry points.
    pub body: String,
}

impl WrapperUnit {
    /// Create a wrapper unit.
    pub fn new(prelude: impl Into<String>, source: impl AsRef<Path>, body: impl Into<String>) -> Self {
        Self {
            prelude: prelude.into(),
            source: source.as_ref().to_path_buf(),
            body: body.into(),
        }
    }

    /// Render the unit as C++ text.
    pub fn render(&self) -> String {
        let source = self.source.to_string_lossy().replace('\\', "/");
        WRAPPER_TEMPLATE
            .replace("{{PRELUDE}}", self.prelude.trim_end())
            .replace("{{SOURCE}}", &source)
            .replace("{{BODY}}", self.body.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opforge_core::parse_declarations;

    fn decl(src: &str) -> Declaration {
        parse_declarations(src).unwrap().remove(0)
    }

    #[test]
    fn test_func_entries() {
        let d = decl("OPFORGE_FUNC int add(const int* a, const int* b, int* out, int n) {");
        let types = d.concrete_types().unwrap();
        let sym = IdCode::new("add", &types).symbol();
        let code = CodeGenerator::new().generate(&d, &types).unwrap();

        assert!(code.contains(&format!(
            "OPFORGE_DLL int {}(const int* a, const int* b, int* out, int n) {{\n  return add(a, b, out, n);\n}}",
            sym
        )));
        assert!(code.contains(&format!("void {}_packed(", sym)));
        assert!(code.contains(&format!(
            "*static_cast<int*>(rtn) = {}(*static_cast<const int**>(args[0]), \
             *static_cast<const int**>(args[1]), *static_cast<int**>(args[2]), \
             *static_cast<int*>(args[3]));",
            sym
        )));
        assert!(code.contains("(void)device_id;"));
        assert!(!code.contains("_async"));
    }

    #[test]
    fn test_void_func_ignores_rtn() {
        let d = decl("OPFORGE_FUNC void reset() {");
        let code = CodeGenerator::new().generate(&d, &[]).unwrap();
        assert!(code.contains("(void)args;"));
        assert!(code.contains("(void)rtn;"));
        assert!(code.contains("OPFORGE_DLL void reset_"));
        assert!(code.contains("  reset();"));
    }

    #[test]
    fn test_template_kernel_entries() {
        let d = decl(
            "template <typename T>\nOPFORGE_KERNEL scale_kernel(const int n, const T* x, T* y) {",
        );
        let types = vec![
            DType::scalar(ScalarType::I32).with_const(true),
            DType::const_pointer(ScalarType::F32),
            DType::pointer(ScalarType::F32),
        ];
        let sym = IdCode::new("scale", &types).symbol();
        let code = CodeGenerator::new().generate(&d, &types).unwrap();

        assert!(code.contains(&format!(
            "OPFORGE_DLL void {}(const int device_id, const int n, const float* x, float* y)",
            sym
        )));
        assert!(code.contains("KERNEL_RUN((scale_kernel<float>))(n, x, y);"));
        assert!(code.contains(&format!(
            "void {}_async(const int device_id, void* const* args, opforge_resolve_fn resolve, void* resolve_ctx)",
            sym
        )));
        assert!(code.contains("static_cast<const float*>(resolve(resolve_ctx, args[1]))"));
        assert!(code.contains("*static_cast<const int*>(args[0])"));
        assert!(code.contains("static const int positions[] = {1};"));
        assert!(code.contains("return 1;"));
    }

    #[test]
    fn test_void_pointer_kernel_has_no_async_adapter() {
        let d = decl("OPFORGE_KERNEL copy_kernel(const int n, const void* src, void* dst) {");
        let types = d.concrete_types().unwrap();
        let code = CodeGenerator::new().generate(&d, &types).unwrap();
        assert!(code.contains("_packed("));
        assert!(!code.contains("_async("));
        assert!(!code.contains("_const_loc("));
    }

    #[test]
    fn test_const_loc_without_const_pointers() {
        let d = decl("OPFORGE_KERNEL fill_kernel(const int n, float* y) {");
        let types = d.concrete_types().unwrap();
        let code = CodeGenerator::new().generate(&d, &types).unwrap();
        assert!(code.contains("*loc = nullptr;\n  return 0;"));
    }

    #[test]
    fn test_rejects_bad_instantiation() {
        let d = decl("template <typename T>\nOPFORGE_FUNC void f(const T* a, T* b) {");
        let types = vec![DType::const_pointer(ScalarType::F32), DType::pointer(ScalarType::I32)];
        assert!(CodeGenerator::new().generate(&d, &types).is_err());
    }

    #[test]
    fn test_positions() {
        let types = vec![
            DType::const_pointer(ScalarType::F32),
            DType::scalar(ScalarType::I32),
            DType::pointer(ScalarType::F32),
        ];
        assert_eq!(const_positions(&types), vec![0]);
        assert_eq!(mutable_positions(&types), vec![2]);
    }

    #[test]
    fn test_render_unit() {
        let unit = WrapperUnit::new(HOST_PRELUDE, "/tmp/ops/add.cpp", "// body\n");
        let text = unit.render();
        assert!(text.starts_with("// Generated by opforge"));
        let prelude = text.find("#define OPFORGE_KERNEL void").unwrap();
        let include = text.find("#include \"/tmp/ops/add.cpp\"").unwrap();
        let body = text.find("// body").unwrap();
        assert!(prelude < include && include < body);
    }
}
