//! Declaration parser for annotated kernel sources.
//!
//! The parser does not understand C++. It recognizes a constrained
//! declaration grammar:
//!
//! ```text
//! template <typename T, typename U>              // optional, next declaration only
//! OPFORGE_KERNEL name_kernel(const int n, const T* x, U* y)
//! OPFORGE_FUNC [ret] name(params)
//! ```
//!
//! A declaration may wrap across lines; it ends when its parentheses balance.
//! Each parameter is `[const] type[*] name` with at most one `*`.

use std::collections::HashSet;

use crate::declaration::{Declaration, FuncKind, Param, ReturnType};
use crate::error::{OpforgeError, Result};
use crate::types::{DType, ParamType, ScalarType, TemplateType};

/// Marker introducing a kernel declaration.
pub const KERNEL_MARKER: &str = "OPFORGE_KERNEL";

/// Marker introducing a function declaration.
pub const FUNC_MARKER: &str = "OPFORGE_FUNC";

/// Required suffix of a kernel's head name.
pub const KERNEL_SUFFIX: &str = "_kernel";

/// Parse every annotated declaration in `source`.
///
/// Declarations are returned in source order; names are unique.
pub fn parse_declarations(source: &str) -> Result<Vec<Declaration>> {
    let mut decls: Vec<Declaration> = Vec::new();
    let mut pending_templates: Vec<String> = Vec::new();
    let mut open: Option<OpenDecl> = None;

    for (idx, line) in source.lines().enumerate() {
        let lineno = idx + 1;

        if open.is_none() {
            if let Some(list) = template_header(line) {
                pending_templates = list;
            }
            if let Some(kind) = marker(line) {
                open = Some(OpenDecl {
                    kind,
                    line: lineno,
                    text: String::new(),
                    depth: 0,
                    seen_paren: false,
                });
            }
        }

        let Some(decl) = open.as_mut() else {
            continue;
        };
        decl.depth += line.matches('(').count() as isize;
        decl.depth -= line.matches(')').count() as isize;
        decl.seen_paren |= line.contains('(');
        decl.text.push_str(line);
        decl.text.push(' ');

        if decl.depth < 0 {
            return Err(OpforgeError::parse(decl.line, "unbalanced parentheses"));
        }
        if decl.depth != 0 || !decl.seen_paren {
            continue;
        }
        if let Some(finished) = open.take() {
            let templates = std::mem::take(&mut pending_templates);
            let parsed = finished.parse(templates)?;
            if decls.iter().any(|d| d.name == parsed.name) {
                return Err(OpforgeError::parse(
                    parsed.line,
                    format!("duplicate declaration of `{}`", parsed.name),
                ));
            }
            decls.push(parsed);
        }
    }

    if let Some(decl) = open {
        return Err(OpforgeError::parse(
            decl.line,
            format!("unbalanced parentheses: {} unmatched", decl.depth),
        ));
    }
    Ok(decls)
}

struct OpenDecl {
    kind: FuncKind,
    line: usize,
    text: String,
    depth: isize,
    seen_paren: bool,
}

impl OpenDecl {
    fn parse(self, templates: Vec<String>) -> Result<Declaration> {
        let line = self.line;
        let err = |msg: String| OpforgeError::parse(line, msg);

        let mut seen = HashSet::new();
        if let Some(dup) = templates.iter().find(|t| !seen.insert(t.as_str())) {
            return Err(err(format!(
                "duplicated template name `{}` in <{}>",
                dup,
                templates.join(", ")
            )));
        }

        let marker_name = match self.kind {
            FuncKind::Kernel => KERNEL_MARKER,
            FuncKind::Func => FUNC_MARKER,
        };
        let text = self.text.trim_start();
        let text = text.strip_prefix(marker_name).unwrap_or(text);

        let open = text
            .find('(')
            .ok_or_else(|| err("missing parameter list".to_string()))?;
        let close = matching_paren(text, open)
            .ok_or_else(|| err("unbalanced parentheses".to_string()))?;
        let head: Vec<&str> = text[..open].split_whitespace().collect();
        let plist = &text[open + 1..close];

        let (ret_token, head_name) = match head.as_slice() {
            [name] => (None, *name),
            [ret, name] => (Some(*ret), *name),
            [] => return Err(err("missing function name".to_string())),
            _ => {
                return Err(err(format!(
                    "unsupported declaration head `{}`",
                    head.join(" ")
                )))
            }
        };

        let params = split_params(plist)
            .into_iter()
            .map(|decl| parse_param(decl, &templates).map_err(&err))
            .collect::<Result<Vec<_>>>()?;

        let ret = match (self.kind, ret_token) {
            (FuncKind::Kernel, Some(t)) => {
                return Err(err(format!("kernel declarations have no return type, found `{}`", t)))
            }
            (_, None) => None,
            (FuncKind::Func, Some(t)) if t.contains('*') => {
                return Err(err(format!("pointer return type `{}` is not supported", t)))
            }
            (FuncKind::Func, Some("void")) => None,
            (FuncKind::Func, Some(t)) => match ScalarType::from_cname(t) {
                Some(s) => Some(ReturnType::Scalar(s)),
                None if templates.iter().any(|n| n == t) => Some(ReturnType::Template(t.to_string())),
                None => return Err(err(format!("template name '{}' is not defined", t))),
            },
        };

        let name = match self.kind {
            FuncKind::Kernel => head_name
                .strip_suffix(KERNEL_SUFFIX)
                .filter(|n| !n.is_empty())
                .ok_or_else(|| {
                    err(format!(
                        "the name of a {} must end with `{}`, e.g. add_forward{}; found `{}`",
                        KERNEL_MARKER, KERNEL_SUFFIX, KERNEL_SUFFIX, head_name
                    ))
                })?,
            FuncKind::Func => head_name,
        };
        if !is_identifier(name) {
            return Err(err(format!("invalid function name `{}`", head_name)));
        }

        let uses_template = params.iter().any(|p| p.ty.template_name().is_some())
            || matches!(ret, Some(ReturnType::Template(_)));
        let templates = if uses_template { templates } else { Vec::new() };

        Ok(Declaration {
            name: name.to_string(),
            kind: self.kind,
            params,
            ret,
            templates,
            line,
        })
    }
}

/// Match a marker at the start of a line (leading whitespace allowed).
fn marker(line: &str) -> Option<FuncKind> {
    let rest = line.trim_start();
    let kind = if let Some(after) = rest.strip_prefix(KERNEL_MARKER) {
        (FuncKind::Kernel, after)
    } else if let Some(after) = rest.strip_prefix(FUNC_MARKER) {
        (FuncKind::Func, after)
    } else {
        return None;
    };
    // The marker must be a whole token.
    match kind.1.chars().next() {
        None => Some(kind.0),
        Some(c) if c.is_whitespace() || c == '(' => Some(kind.0),
        Some(_) => None,
    }
}

/// Parse `template <typename A, class B>` at the start of a line.
///
/// Non-type template parameters are skipped.
fn template_header(line: &str) -> Option<Vec<String>> {
    let rest = line.trim_start().strip_prefix("template")?;
    let rest = rest.trim_start().strip_prefix('<')?;
    let end = rest.find('>')?;
    let names = rest[..end]
        .split(',')
        .filter_map(|block| {
            let mut tokens = block.split_whitespace();
            match (tokens.next(), tokens.next(), tokens.next()) {
                (Some("typename" | "class"), Some(name), None) => Some(name.to_string()),
                _ => None,
            }
        })
        .collect();
    Some(names)
}

fn matching_paren(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in text[open..].char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split a parameter list on top-level commas.
fn split_params(plist: &str) -> Vec<&str> {
    let trimmed = plist.trim();
    if trimmed.is_empty() || trimmed == "void" {
        return Vec::new();
    }
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in plist.char_indices() {
        match c {
            '(' | '<' | '[' => depth += 1,
            ')' | '>' | ']' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(plist[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(plist[start..].trim());
    parts
}

fn parse_param(decl: &str, templates: &[String]) -> std::result::Result<Param, String> {
    let stars = decl.matches('*').count();
    if stars > 1 {
        return Err(format!(
            "only pass-by-value or pass-by-1-level-pointer is supported, found `{}`",
            decl
        ));
    }
    let is_pointer = stars == 1;
    let cleaned = decl.replace('*', " ");
    let mut tokens: Vec<&str> = cleaned.split_whitespace().collect();
    let is_const = tokens.first() == Some(&"const");
    if is_const {
        tokens.remove(0);
    }
    let [type_name, var_name] = tokens.as_slice() else {
        return Err(format!(
            "expected `[const] type[*] name`, found `{}`",
            decl.trim()
        ));
    };
    if !is_identifier(var_name) {
        return Err(format!("invalid parameter name in `{}`", decl.trim()));
    }

    let ty = match ScalarType::from_cname(type_name) {
        Some(ScalarType::Void) if !is_pointer => {
            return Err(format!("parameter `{}` cannot be void", var_name));
        }
        Some(scalar) => ParamType::Concrete(DType {
            scalar,
            is_pointer,
            is_const,
        }),
        None if templates.iter().any(|t| t == type_name) => ParamType::Template(TemplateType {
            name: type_name.to_string(),
            is_pointer,
            is_const,
        }),
        None => return Err(format!("template name '{}' is not defined", type_name)),
    };
    Ok(Param {
        name: var_name.to_string(),
        ty,
    })
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
