//! Deterministic textual encoding of lowered types.
//!
//! Used as an internal cache key in the rewriter, as the payload of unknown
//! type descriptors, and by the statistics collector. The encoding is
//! position-sensitive: a pointer in a by-value argument position drops its
//! `*` suffix, because the pointee is the semantic argument there.
//!
//! Named structs encode as `@% module::name %@` and their element encoding
//! is recorded once in a side table, which both keeps the output compact
//! and breaks cycles through self-referential aggregates.

use std::collections::{BTreeMap, HashMap};

use crate::ir::{Module, Ty};

/// Position context for one serialization request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SerContext {
    /// The type of the function being serialized; argument positions honor
    /// by-value flags.
    Function,
    /// A by-value argument position: the pointer suffix is dropped.
    ByvalArg,
    /// Anywhere else.
    Na,
}

/// Serializer with a memo table. One instance per pass invocation; the
/// named-struct side table accumulates across functions of a module.
#[derive(Default)]
pub struct TypeSerializer {
    cache: HashMap<(Ty, SerContext), String>,
    named_structs: BTreeMap<String, String>,
}

impl TypeSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize a function's own type, honoring per-parameter by-value
    /// flags.
    pub fn serialize_fn(&mut self, module: &Module, fn_ty: &crate::ir::FnTy) -> String {
        self.serialize(module, &Ty::Fn(Box::new(fn_ty.clone())), SerContext::Function)
    }

    pub fn serialize(&mut self, module: &Module, ty: &Ty, ctx: SerContext) -> String {
        // Function-level requests are never cached: the same lowered type
        // may serialize differently under different by-value attributes.
        let key = (ty.clone(), ctx);
        if ctx != SerContext::Function {
            if let Some(hit) = self.cache.get(&key) {
                return hit.clone();
            }
        }

        let text = match ty {
            Ty::Void => "void".to_string(),
            Ty::Int(bits @ (1 | 8 | 16 | 32 | 64)) => format!("i{bits}"),
            Ty::Float(32) => "f32".to_string(),
            Ty::Float(64) => "f64".to_string(),
            Ty::Ptr(elem) => {
                let mut text = self.serialize(module, elem, SerContext::Na);
                if ctx != SerContext::ByvalArg {
                    text.push('*');
                }
                text
            }
            Ty::Array(elem, n) => {
                format!("[ {n} x {} ]", self.serialize(module, elem, SerContext::Na))
            }
            Ty::Struct(fields) => self.serialize_struct_elements(module, fields),
            Ty::Named(name) => {
                let struct_name = format!("@% {}::{name} %@", module.name);
                // Record the name form before descending so self-references
                // terminate.
                self.cache.insert(key.clone(), struct_name.clone());
                let elements = match module.struct_body(name) {
                    Some(fields) => self.serialize_struct_elements(module, fields),
                    None => "opaque".to_string(),
                };
                self.named_structs.entry(struct_name.clone()).or_insert(elements);
                struct_name
            }
            Ty::Fn(fn_ty) => {
                let mut text = format!(
                    "@$ {}",
                    self.serialize(module, &fn_ty.ret, SerContext::Na)
                );
                for param in &fn_ty.params {
                    let arg_ctx = if ctx == SerContext::Function && param.byval {
                        SerContext::ByvalArg
                    } else {
                        SerContext::Na
                    };
                    text.push_str(", ");
                    text.push_str(&self.serialize(module, &param.ty, arg_ctx));
                }
                text.push_str(" $@");
                text
            }
            // Odd integer widths, vectors, and anything else the grammar
            // has no form for.
            other => format!("@U{other}U@"),
        };

        self.cache.insert(key, text.clone());
        text
    }

    fn serialize_struct_elements(&mut self, module: &Module, fields: &[Ty]) -> String {
        let mut text = String::from("{ ");
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                text.push_str(", ");
            }
            text.push_str(&self.serialize(module, field, SerContext::Na));
        }
        text.push_str(" }");
        text
    }

    /// Named-struct encodings recorded so far: name form → element form.
    pub fn named_structs(&self) -> &BTreeMap<String, String> {
        &self.named_structs
    }
}
