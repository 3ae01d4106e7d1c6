//! The instrumentation pass.
//!
//! Runs once per lowered module. Every eligible function `F` with type
//! `R(P0, …, Pn-1)` is turned into an extension point:
//!
//! - `F` itself keeps its symbol but its body becomes a single tail
//!   dispatch through a module-private function-pointer slot;
//! - `F_original` preserves the incoming body under private linkage;
//! - `F_reflect(ret, args)` unpacks an opaque argument array and calls
//!   `F_original` directly;
//! - `F_extended` has `F`'s signature, packages its arguments as opaque
//!   pointers and hands them to the runtime evaluator;
//! - `F_init`, appended to the module's global constructors, builds the
//!   function's type-descriptor tree and registers the extension point
//!   with the slot initialized to `F_original`.
//!
//! The function list is snapshotted before any rewriting so freshly
//! generated helpers are never reprocessed.

use std::collections::HashMap;
use std::path::Path;

use crate::gate::{can_instrument, CanInstrument, InstrumentPredicate};
use crate::ir::{
    BodyBuilder, Callee, Func, FuncId, FnTy, GlobalId, GlobalInit, Global, Linkage, Module,
    Param, Reg, Ty,
};
use crate::serialize::{SerContext, TypeSerializer};
use crate::stats::{sanitize_module_name, InstrumentationStats};

/// Opaque named struct standing in for the runtime's extension-point type
/// in generated IR.
const EXTENSION_POINT_STRUCT: &str = "augmentum.FnExtensionPoint";
/// Same, for type descriptors.
const TYPE_DESC_STRUCT: &str = "augmentum.TypeDesc";

// Runtime ABI symbols bound by the host at load time.
pub const SYM_VOID_TYPE: &str = "augmentum_void_type";
pub const SYM_INT_TYPE: &str = "augmentum_int_type";
pub const SYM_FLOAT_TYPE: &str = "augmentum_float_type";
pub const SYM_PTR_TYPE: &str = "augmentum_ptr_type";
pub const SYM_ARRAY_TYPE: &str = "augmentum_array_type";
pub const SYM_VECTOR_TYPE: &str = "augmentum_vector_type";
pub const SYM_ANON_STRUCT_TYPE: &str = "augmentum_anon_struct_type";
pub const SYM_FORWARD_STRUCT_TYPE: &str = "augmentum_forward_struct_type";
pub const SYM_SET_STRUCT_ELEMS: &str = "augmentum_set_struct_elems";
pub const SYM_FN_TYPE: &str = "augmentum_fn_type";
pub const SYM_UNKNOWN_TYPE: &str = "augmentum_unknown_type";
pub const SYM_CREATE_EXTENSION_POINT: &str = "augmentum_create_extension_point";
pub const SYM_EVAL: &str = "augmentum_eval";
pub const SYM_DEBUG_PRINT: &str = "augmentum_debug_print";

/// Configuration of one pass run, the analog of the host compiler driver's
/// command-line flags.
pub struct PassConfig {
    pub predicate: Box<dyn InstrumentPredicate>,
    /// Collect statistics, perform no rewriting.
    pub dry_run: bool,
    /// Where to append statistics CSV files, if anywhere.
    pub stats_dir: Option<std::path::PathBuf>,
    /// Where to write the textual IR of transformed modules, if anywhere.
    pub emit_ir_dir: Option<std::path::PathBuf>,
}

impl Default for PassConfig {
    fn default() -> Self {
        PassConfig {
            predicate: Box::new(crate::gate::AlwaysInstrument),
            dry_run: false,
            stats_dir: None,
            emit_ir_dir: None,
        }
    }
}

/// Run the pass over one module. Returns true if anything was transformed.
pub fn run_pass(module: &mut Module, config: &PassConfig) -> bool {
    let mut stats = InstrumentationStats::new();
    if config.dry_run {
        stats.collect_full_stats();
    }

    let transformed = if config.dry_run {
        collect_stats_only(module, config, &mut stats);
        false
    } else {
        run_instrumentation(module, config, &mut stats)
    };

    if let Some(dir) = &config.stats_dir {
        stats.emit(dir, &sanitize_module_name(&module.name));
    }

    if transformed {
        if let Some(dir) = &config.emit_ir_dir {
            emit_transformed_ir(module, dir);
        }
    }

    transformed
}

fn run_instrumentation(
    module: &mut Module,
    config: &PassConfig,
    stats: &mut InstrumentationStats,
) -> bool {
    if !config.predicate.module(module) {
        log::debug!("module {} not instrumented", module.name);
        return false;
    }

    // Snapshot before touching anything: the loop must not see the
    // helpers it generates.
    let funcs: Vec<FuncId> = module.funcs.ids().collect();

    let mut transformed = 0usize;
    for func in funcs {
        let can = can_instrument(&module.funcs[func]);
        if can != CanInstrument::Yes {
            log::debug!(
                "skipping {}::{}: {}",
                module.name,
                module.funcs[func].name,
                can.as_str()
            );
            continue;
        }
        if !config.predicate.function(module, &module.funcs[func]) {
            log::debug!(
                "skipping {}::{}: rejected by predicate",
                module.name,
                module.funcs[func].name
            );
            continue;
        }

        FunctionRewriter::new(module, func).transform();
        transformed += 1;
        if config.stats_dir.is_some() {
            stats.record_function(module, &module.funcs[func], can, "NA".to_string());
        }
    }

    log::debug!(
        "instrumented {transformed} function(s) in module {}",
        module.name
    );
    transformed > 0
}

/// Dry run: record the instrumentation decision for every function, touch
/// nothing.
fn collect_stats_only(module: &Module, config: &PassConfig, stats: &mut InstrumentationStats) {
    for (_, func) in module.funcs.iter() {
        let can = can_instrument(func);
        let should = config.predicate.decision_info(module, func);
        stats.record_function(module, func, can, should);
    }
    stats.record_named_structs(module);
}

fn emit_transformed_ir(module: &Module, dir: &Path) {
    if !dir.exists() {
        log::error!(
            "transformed-IR output directory not found: {}",
            dir.display()
        );
        return;
    }
    let path = dir.join(format!("{}.ir", sanitize_module_name(&module.name)));
    if let Err(err) = std::fs::write(&path, module.to_string()) {
        log::error!("failed to emit transformed IR to {}: {err}", path.display());
    }
}

/// `augmentum::<mid>__<suffix>__`
fn global_name(mid: &str, suffix: &str) -> String {
    format!("augmentum::{mid}__{suffix}__")
}

/// Per-function transformation state. `transform` drives the six steps in
/// order; each step leaves its product in the fields below for the later
/// ones.
struct FunctionRewriter<'m> {
    module: &'m mut Module,
    func: FuncId,
    name: String,
    fn_ty: FnTy,
    original: Option<FuncId>,
    extended: Option<FuncId>,
    reflect: Option<FuncId>,
    fn_ptr: Option<GlobalId>,
    ep_ptr: Option<GlobalId>,
}

impl<'m> FunctionRewriter<'m> {
    fn new(module: &'m mut Module, func: FuncId) -> Self {
        let name = module.funcs[func].name.clone();
        let fn_ty = module.funcs[func].ty.clone();
        FunctionRewriter {
            module,
            func,
            name,
            fn_ty,
            original: None,
            extended: None,
            reflect: None,
            fn_ptr: None,
            ep_ptr: None,
        }
    }

    fn transform(mut self) {
        self.make_original_clone();
        self.declare_globals();
        self.make_reflect();
        self.make_extended();
        self.rewrite_entry();
        self.make_init();
    }

    fn qualified(&self, suffix: &str) -> String {
        global_name(&self.name, suffix)
    }

    /// Step 1: preserve the incoming body verbatim under a private symbol.
    fn make_original_clone(&mut self) {
        assert!(self.original.is_none());
        let body = self.module.funcs[self.func]
            .body
            .clone()
            .expect("eligibility gate admits definitions only");
        let clone = Func {
            name: self.qualified("original"),
            ty: self.fn_ty.clone(),
            linkage: Linkage::Private,
            body: Some(body),
        };
        self.original = Some(self.module.funcs.push(clone));
    }

    /// Step 2: the extension-point handle pointer (null) and the function
    /// pointer slot (initialized to the clone).
    fn declare_globals(&mut self) {
        let original = self.original.expect("clone precedes globals");

        self.module
            .structs
            .entry(EXTENSION_POINT_STRUCT.to_string())
            .or_insert(None);
        self.module
            .structs
            .entry(TYPE_DESC_STRUCT.to_string())
            .or_insert(None);

        self.ep_ptr = Some(self.module.globals.push(Global {
            name: self.qualified("extension_point_ptr"),
            ty: Ty::Named(EXTENSION_POINT_STRUCT.into()).ptr_to(),
            init: GlobalInit::Zero,
        }));

        self.fn_ptr = Some(self.module.globals.push(Global {
            name: self.qualified("fn_ptr"),
            ty: Ty::Fn(Box::new(self.fn_ty.clone())).ptr_to(),
            init: GlobalInit::Func(original),
        }));
    }

    /// Step 3: `void F_reflect(void* ret, void** args)` — load each
    /// argument out of the opaque array, call the original, store the
    /// result through `ret`.
    fn make_reflect(&mut self) {
        let original = self.original.expect("clone precedes reflect");
        let mut b = BodyBuilder::new(2);
        let ret_ptr = b.param(0);
        let args_ptr = b.param(1);

        let mut arg_values: Vec<Reg> = Vec::new();
        for (i, param) in self.fn_ty.params.iter().enumerate() {
            let index = b.iconst(Ty::Int(64), i as i64);
            let slot = b.elem_addr(Ty::Int(8).ptr_to(), args_ptr, index);
            let value = if param.byval {
                // The slot holds the caller-owned aggregate's address
                // directly; one load fewer than the general case.
                b.load(param.ty.clone(), slot)
            } else {
                let cell = b.load(param.ty.clone().ptr_to(), slot);
                b.load(param.ty.clone(), cell)
            };
            arg_values.push(value);
        }

        let has_result = !self.fn_ty.ret.is_void();
        let result = b.call(Callee::Func(original), arg_values, has_result);
        if let Some(result) = result {
            b.store(self.fn_ty.ret.clone(), ret_ptr, result);
        }
        b.ret(None);

        let reflect = Func {
            name: self.qualified("reflect"),
            ty: reflect_fn_ty(),
            linkage: Linkage::Private,
            body: Some(b.finish()),
        };
        self.reflect = Some(self.module.funcs.push(reflect));
    }

    /// Step 4: `R F_extended(P0, …)` — spill arguments to stack cells,
    /// build the opaque pointer array, dispatch to the evaluator, reload
    /// the return value.
    fn make_extended(&mut self) {
        let ep_ptr = self.ep_ptr.expect("globals precede extended");
        let params = self.fn_ty.params.clone();
        let ret_ty = self.fn_ty.ret.clone();
        let n = params.len();

        let mut b = BodyBuilder::new(n as u32);

        let ret_cell = (!ret_ty.is_void()).then(|| b.alloca(ret_ty.clone()));
        let arg_cells: Vec<Option<Reg>> = params
            .iter()
            .map(|param| (!param.byval).then(|| b.alloca(param.ty.clone())))
            .collect();
        let args_array = b.alloca(Ty::Array(Box::new(Ty::Int(8).ptr_to()), n as u64));

        for (i, param) in params.iter().enumerate() {
            let index = b.iconst(Ty::Int(64), i as i64);
            let slot = b.elem_addr(Ty::Int(8).ptr_to(), args_array, index);
            match arg_cells[i] {
                // By-value aggregates: the argument is already the address
                // of caller-owned storage; record it directly.
                None => b.store(param.ty.clone(), slot, b.param(i)),
                Some(cell) => {
                    b.store(param.ty.clone(), cell, b.param(i));
                    b.store(param.ty.clone().ptr_to(), slot, cell);
                }
            }
        }

        let ep_addr = b.global_addr(ep_ptr);
        let ep = b.load(Ty::Named(EXTENSION_POINT_STRUCT.into()).ptr_to(), ep_addr);
        let ret_arg = match ret_cell {
            Some(cell) => cell,
            None => b.null(),
        };
        b.call_external(SYM_EVAL, vec![ep, ret_arg, args_array], false);

        match ret_cell {
            Some(cell) => {
                let value = b.load(ret_ty.clone(), cell);
                b.ret(Some(value));
            }
            None => b.ret(None),
        }

        let extended = Func {
            name: self.qualified("extended"),
            ty: self.fn_ty.clone(),
            linkage: Linkage::Private,
            body: Some(b.finish()),
        };
        self.extended = Some(self.module.funcs.push(extended));
    }

    /// Step 5: replace the public body with a single indirect tail
    /// dispatch through the slot.
    fn rewrite_entry(&mut self) {
        let fn_ptr = self.fn_ptr.expect("globals precede entry rewrite");
        let n = self.fn_ty.params.len();

        let mut b = BodyBuilder::new(n as u32);
        let slot_addr = b.global_addr(fn_ptr);
        let target = b.load(Ty::Fn(Box::new(self.fn_ty.clone())).ptr_to(), slot_addr);
        let args: Vec<Reg> = (0..n).map(|i| b.param(i)).collect();
        let has_result = !self.fn_ty.ret.is_void();
        let result = b.call_indirect(self.fn_ty.clone(), target, args, has_result);
        b.ret(result);

        self.module.funcs[self.func].body = Some(b.finish());
    }

    /// Step 6: the global constructor — build the descriptor tree, create
    /// and store the extension point.
    fn make_init(&mut self) {
        let fn_ptr = self.fn_ptr.expect("globals precede init");
        let ep_ptr = self.ep_ptr.expect("globals precede init");
        let original = self.original.expect("clone precedes init");
        let extended = self.extended.expect("extended precedes init");
        let reflect = self.reflect.expect("reflect precedes init");

        let mut b = BodyBuilder::new(0);
        let mut cache: TypeDescCache = HashMap::new();
        let mut serializer = TypeSerializer::new();

        let fn_ty = Ty::Fn(Box::new(self.fn_ty.clone()));
        let type_desc = emit_type_desc(self.module, &mut b, &fn_ty, &mut cache, &mut serializer);

        let module_name = b.str_addr(self.module.name.clone());
        let fn_name = b.str_addr(self.name.clone());
        let slot_addr = b.global_addr(fn_ptr);
        let original_addr = b.func_addr(original);
        let extended_addr = b.func_addr(extended);
        let reflect_addr = b.func_addr(reflect);

        let ep = b
            .call_external(
                SYM_CREATE_EXTENSION_POINT,
                vec![
                    module_name,
                    fn_name,
                    type_desc,
                    slot_addr,
                    original_addr,
                    extended_addr,
                    reflect_addr,
                ],
                true,
            )
            .expect("create_extension_point returns the point");
        let ep_addr = b.global_addr(ep_ptr);
        b.store(
            Ty::Named(EXTENSION_POINT_STRUCT.into()).ptr_to(),
            ep_addr,
            ep,
        );
        b.ret(None);

        let init = self.module.funcs.push(Func {
            name: self.qualified("init"),
            ty: FnTy::new(Ty::Void, vec![]),
            linkage: Linkage::Private,
            body: Some(b.finish()),
        });
        self.module.ctors.push(init);
    }
}

/// `void(void*, void**)`.
fn reflect_fn_ty() -> FnTy {
    FnTy::new(
        Ty::Void,
        vec![
            Param::new(Ty::Int(8).ptr_to()),
            Param::new(Ty::Int(8).ptr_to().ptr_to()),
        ],
    )
}

/// Local descriptor cache for one constructor body, keyed by the stable
/// serialized form of the type.
type TypeDescCache = HashMap<String, Reg>;

/// Emit the calls that build the runtime descriptor for `ty`, reusing
/// already-built subtrees. Named structs cache their forward descriptor
/// *before* recursing into element types; that is what keeps
/// self-referential aggregates finite.
fn emit_type_desc(
    module: &Module,
    b: &mut BodyBuilder,
    ty: &Ty,
    cache: &mut TypeDescCache,
    serializer: &mut TypeSerializer,
) -> Reg {
    let key = serializer.serialize(module, ty, SerContext::Na);
    if let Some(reg) = cache.get(&key) {
        return *reg;
    }

    let reg = match ty {
        Ty::Void => call_type_ctor(b, SYM_VOID_TYPE, vec![]),
        Ty::Int(bits @ (1 | 8 | 16 | 32 | 64)) => {
            let bits = b.iconst(Ty::Int(64), *bits as i64);
            call_type_ctor(b, SYM_INT_TYPE, vec![bits])
        }
        Ty::Float(bits @ (32 | 64)) => {
            let bits = b.iconst(Ty::Int(64), *bits as i64);
            call_type_ctor(b, SYM_FLOAT_TYPE, vec![bits])
        }
        Ty::Ptr(elem) => {
            let elem = emit_type_desc(module, b, elem, cache, serializer);
            call_type_ctor(b, SYM_PTR_TYPE, vec![elem])
        }
        Ty::Array(elem, n) => {
            let elem = emit_type_desc(module, b, elem, cache, serializer);
            let count = b.iconst(Ty::Int(64), *n as i64);
            call_type_ctor(b, SYM_ARRAY_TYPE, vec![elem, count])
        }
        Ty::Vector(elem, n) => {
            let elem = emit_type_desc(module, b, elem, cache, serializer);
            let count = b.iconst(Ty::Int(64), *n as i64);
            call_type_ctor(b, SYM_VECTOR_TYPE, vec![elem, count])
        }
        Ty::Named(name) => {
            let module_name = b.str_addr(module.name.clone());
            let struct_name = b.str_addr(name.clone());
            let forward =
                call_type_ctor(b, SYM_FORWARD_STRUCT_TYPE, vec![module_name, struct_name]);
            cache.insert(key, forward);

            if let Some(body) = module.struct_body(name) {
                let body: Vec<Ty> = body.to_vec();
                let count = b.iconst(Ty::Int(64), body.len() as i64);
                let mut args = vec![forward, count];
                for field in &body {
                    args.push(emit_type_desc(module, b, field, cache, serializer));
                }
                b.call_external(SYM_SET_STRUCT_ELEMS, args, false);
            }
            return forward;
        }
        Ty::Struct(fields) => {
            let elems: Vec<Reg> = fields
                .iter()
                .map(|field| emit_type_desc(module, b, field, cache, serializer))
                .collect();
            let count = b.iconst(Ty::Int(64), fields.len() as i64);
            let mut args = vec![count];
            args.extend(elems);
            call_type_ctor(b, SYM_ANON_STRUCT_TYPE, args)
        }
        Ty::Fn(fn_ty) => {
            let ret = emit_type_desc(module, b, &fn_ty.ret, cache, serializer);
            let arg_descs: Vec<Reg> = fn_ty
                .params
                .iter()
                .map(|param| emit_type_desc(module, b, &param.ty, cache, serializer))
                .collect();
            let count = b.iconst(Ty::Int(64), fn_ty.params.len() as i64);
            let mut args = vec![ret, count];
            args.extend(arg_descs);
            call_type_ctor(b, SYM_FN_TYPE, args)
        }
        // Widths and shapes outside the descriptor vocabulary degrade to
        // the opaque fallback rather than failing the build.
        other => {
            let module_name = b.str_addr(module.name.clone());
            let text = b.str_addr(other.to_string());
            call_type_ctor(b, SYM_UNKNOWN_TYPE, vec![module_name, text])
        }
    };

    cache.insert(key, reg);
    reg
}

fn call_type_ctor(b: &mut BodyBuilder, sym: &str, args: Vec<Reg>) -> Reg {
    b.call_external(sym, args, true)
        .expect("type constructors return a descriptor")
}
