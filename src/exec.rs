//! The host: loads transformed modules and executes them.
//!
//! `Program::load` is the link-and-load analog: it assigns every function
//! an opaque handle, allocates real storage for globals and interned
//! strings, binds declared external symbols to the runtime ABI intrinsics
//! by name, and runs global constructors — which is where the generated
//! `__init__` functions build descriptor trees and register extension
//! points against the program's own [`Runtime`].
//!
//! Execution uses real memory throughout: `alloca` cells and globals are
//! raw allocations, so the opaque pointer arrays the generated code builds
//! hold machine addresses that advice can read and write through. The
//! interpreter runs on the caller's thread and is re-entrant: advice
//! calling `call_previous` re-enters it through the reflect thunk
//! installed at load time.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::ffi::CStr;
use std::sync::Arc;

use thiserror::Error;

use crate::ir::{self, BinOp, Callee, CmpOp, FuncId, Inst, Ty};
use crate::rewrite;
use crate::runtime::{ArgVals, ExtensionPoint, FnSlot, RawFn, ReflectThunk, RetVal, Runtime};
use crate::types::TypeDesc;

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unknown external symbol `{symbol}` referenced by {module}::{func}")]
    UnknownExternal {
        module: String,
        func: String,
        symbol: String,
    },
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("no module named `{module}` is loaded")]
    UnknownModule { module: String },
    #[error("no function `{name}` in module `{module}`")]
    UnknownFunction { module: String, name: String },
    #[error("`{name}` is a declaration and cannot be called")]
    Declaration { name: String },
    #[error("`{name}` expects {expected} argument(s), got {given}")]
    ArityMismatch {
        name: String,
        expected: usize,
        given: usize,
    },
}

// ─── Values ─────────────────────────────────────────────────────────────────

/// A scalar crossing the host boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Ptr(*mut u8),
    Null,
}

impl Value {
    /// Convenience for passing addresses of host-owned storage.
    pub fn ptr<T>(p: *mut T) -> Value {
        Value::Ptr(p as *mut u8)
    }

    /// Canonical register form: integers sign-extended, floats as raw
    /// bits, pointers as addresses.
    fn to_raw(self) -> u64 {
        match self {
            Value::Bool(b) => b as u64,
            Value::I8(v) => v as i64 as u64,
            Value::I16(v) => v as i64 as u64,
            Value::I32(v) => v as i64 as u64,
            Value::I64(v) => v as u64,
            Value::F32(v) => v.to_bits() as u64,
            Value::F64(v) => v.to_bits(),
            Value::Ptr(p) => p as u64,
            Value::Null => 0,
        }
    }

    fn from_raw(ty: &Ty, raw: u64) -> Value {
        match ty {
            Ty::Int(1) => Value::Bool(raw & 1 != 0),
            Ty::Int(8) => Value::I8(raw as u8 as i8),
            Ty::Int(16) => Value::I16(raw as u16 as i16),
            Ty::Int(32) => Value::I32(raw as u32 as i32),
            Ty::Int(_) => Value::I64(raw as i64),
            Ty::Float(32) => Value::F32(f32::from_bits(raw as u32)),
            Ty::Float(_) => Value::F64(f64::from_bits(raw)),
            Ty::Ptr(_) | Ty::Fn(_) => {
                if raw == 0 {
                    Value::Null
                } else {
                    Value::Ptr(raw as *mut u8)
                }
            }
            other => panic!("cannot return aggregate type {other} by value"),
        }
    }
}

// ─── Raw memory ─────────────────────────────────────────────────────────────

/// One zero-initialized raw allocation; globals, string constants, and
/// stack cells live in these so generated code and advice share real
/// addresses.
struct MemBlock {
    ptr: *mut u8,
    layout: Layout,
}

impl MemBlock {
    fn new(size: u64, align: u64) -> MemBlock {
        let layout = Layout::from_size_align(size.max(1) as usize, align.max(1) as usize)
            .expect("valid allocation layout");
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "allocation failure");
        MemBlock { ptr, layout }
    }

    fn from_cstring(text: &str) -> MemBlock {
        let bytes = text.as_bytes();
        let block = MemBlock::new(bytes.len() as u64 + 1, 1);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), block.ptr, bytes.len());
        }
        block
    }
}

impl Drop for MemBlock {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

// ─── Intrinsics ─────────────────────────────────────────────────────────────

/// The runtime ABI: the stable symbols generated code may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intrinsic {
    VoidType,
    IntType,
    FloatType,
    PtrType,
    ArrayType,
    VectorType,
    AnonStructType,
    ForwardStructType,
    SetStructElems,
    FnType,
    UnknownType,
    CreateExtensionPoint,
    Eval,
    DebugPrint,
}

fn resolve_intrinsic(symbol: &str) -> Option<Intrinsic> {
    Some(match symbol {
        rewrite::SYM_VOID_TYPE => Intrinsic::VoidType,
        rewrite::SYM_INT_TYPE => Intrinsic::IntType,
        rewrite::SYM_FLOAT_TYPE => Intrinsic::FloatType,
        rewrite::SYM_PTR_TYPE => Intrinsic::PtrType,
        rewrite::SYM_ARRAY_TYPE => Intrinsic::ArrayType,
        rewrite::SYM_VECTOR_TYPE => Intrinsic::VectorType,
        rewrite::SYM_ANON_STRUCT_TYPE => Intrinsic::AnonStructType,
        rewrite::SYM_FORWARD_STRUCT_TYPE => Intrinsic::ForwardStructType,
        rewrite::SYM_SET_STRUCT_ELEMS => Intrinsic::SetStructElems,
        rewrite::SYM_FN_TYPE => Intrinsic::FnType,
        rewrite::SYM_UNKNOWN_TYPE => Intrinsic::UnknownType,
        rewrite::SYM_CREATE_EXTENSION_POINT => Intrinsic::CreateExtensionPoint,
        rewrite::SYM_EVAL => Intrinsic::Eval,
        rewrite::SYM_DEBUG_PRINT => Intrinsic::DebugPrint,
        _ => return None,
    })
}

// ─── Program ────────────────────────────────────────────────────────────────

struct LoadedModule {
    ir: ir::Module,
    /// Parallel to `ir.globals`.
    globals: Vec<MemBlock>,
    /// Interned NUL-terminated string constants.
    strings: HashMap<String, MemBlock>,
    /// Parallel to `ir.funcs`: program-wide handles.
    handles: Vec<RawFn>,
}

struct ProgramInner {
    runtime: Runtime,
    modules: Vec<LoadedModule>,
    /// Function table: `RawFn(i + 1)` names `table[i]`.
    table: Vec<(usize, FuncId)>,
}

/// A loaded program: one or more transformed modules plus their runtime.
///
/// Boxed internals keep the addresses the extension points captured stable
/// across moves of the `Program` value.
impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program").finish_non_exhaustive()
    }
}

pub struct Program {
    inner: Box<ProgramInner>,
}

// Raw pointers inside are either owned allocations or runtime-internal;
// concurrent use follows the lifecycle contract in the crate docs.
unsafe impl Send for Program {}
unsafe impl Sync for Program {}

impl Program {
    /// Load transformed modules: resolve externals, materialize storage,
    /// then run global constructors in order.
    pub fn load(modules: Vec<ir::Module>) -> Result<Program, LoadError> {
        // Link check before any storage exists.
        for module in &modules {
            for (_, func) in module.funcs.iter() {
                let Some(body) = &func.body else { continue };
                for (_, block) in body.blocks.iter() {
                    for inst in &block.insts {
                        if let Inst::Call {
                            callee: Callee::External(symbol),
                            ..
                        } = inst
                        {
                            if resolve_intrinsic(symbol).is_none() {
                                return Err(LoadError::UnknownExternal {
                                    module: module.name.clone(),
                                    func: func.name.clone(),
                                    symbol: symbol.clone(),
                                });
                            }
                        }
                    }
                }
            }
        }

        let mut table: Vec<(usize, FuncId)> = Vec::new();
        let mut loaded: Vec<LoadedModule> = Vec::new();
        for (module_idx, module) in modules.into_iter().enumerate() {
            let mut handles = Vec::with_capacity(module.funcs.len());
            for func in module.funcs.ids() {
                table.push((module_idx, func));
                handles.push(RawFn(table.len() as u64));
            }

            let mut strings: HashMap<String, MemBlock> = HashMap::new();
            for (_, func) in module.funcs.iter() {
                let Some(body) = &func.body else { continue };
                for (_, block) in body.blocks.iter() {
                    for inst in &block.insts {
                        if let Inst::Str { value, .. } = inst {
                            strings
                                .entry(value.clone())
                                .or_insert_with(|| MemBlock::from_cstring(value));
                        }
                    }
                }
            }

            let mut globals = Vec::with_capacity(module.globals.len());
            for (_, global) in module.globals.iter() {
                let block = MemBlock::new(
                    module.size_of(&global.ty),
                    module.align_of(&global.ty),
                );
                if let ir::GlobalInit::Func(func) = &global.init {
                    let handle = handles[func.index()];
                    unsafe { (block.ptr as *mut u64).write(handle.0) };
                }
                globals.push(block);
            }

            log::debug!(
                "loaded module {} ({} function(s), {} ctor(s))",
                module.name,
                module.funcs.len(),
                module.ctors.len()
            );
            loaded.push(LoadedModule {
                ir: module,
                globals,
                strings,
                handles,
            });
        }

        let program = Program {
            inner: Box::new(ProgramInner {
                runtime: Runtime::new(),
                modules: loaded,
                table,
            }),
        };

        for module_idx in 0..program.inner.modules.len() {
            let ctors = program.inner.modules[module_idx].ir.ctors.clone();
            for ctor in ctors {
                program.inner.exec_function(module_idx, ctor, &[]);
            }
        }

        Ok(program)
    }

    /// The runtime boundary: registry, listeners, extension points.
    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    /// Opaque handle of a loaded function, suitable for
    /// [`ExtensionPoint::replace`]. The replacement must match the
    /// original's signature.
    pub fn function_handle(&self, module_name: &str, name: &str) -> Option<RawFn> {
        let module = self
            .inner
            .modules
            .iter()
            .find(|m| m.ir.name == module_name)?;
        let func = module.ir.func_by_name(name)?;
        Some(module.handles[func.index()])
    }

    /// Call a function through its public entry.
    pub fn call(
        &self,
        module_name: &str,
        name: &str,
        args: &[Value],
    ) -> Result<Option<Value>, CallError> {
        let inner = &self.inner;
        let module_idx = inner
            .modules
            .iter()
            .position(|m| m.ir.name == module_name)
            .ok_or_else(|| CallError::UnknownModule {
                module: module_name.to_string(),
            })?;
        let module = &inner.modules[module_idx].ir;
        let func = module
            .func_by_name(name)
            .ok_or_else(|| CallError::UnknownFunction {
                module: module_name.to_string(),
                name: name.to_string(),
            })?;
        let decl = &module.funcs[func];
        if decl.is_declaration() {
            return Err(CallError::Declaration {
                name: name.to_string(),
            });
        }
        if decl.ty.params.len() != args.len() {
            return Err(CallError::ArityMismatch {
                name: name.to_string(),
                expected: decl.ty.params.len(),
                given: args.len(),
            });
        }
        let ret_ty = decl.ty.ret.clone();
        let raw_args: Vec<u64> = args.iter().map(|a| a.to_raw()).collect();
        let raw = inner.exec_function(module_idx, func, &raw_args);
        Ok(if ret_ty.is_void() {
            None
        } else {
            Some(Value::from_raw(&ret_ty, raw))
        })
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        // Teardown order: listeners are notified and fn slots restored
        // while global storage is still alive.
        self.inner.runtime.shutdown();
    }
}

// ─── Interpreter ────────────────────────────────────────────────────────────

fn sext(raw: u64, bytes: u64) -> u64 {
    match bytes {
        1 => raw as u8 as i8 as i64 as u64,
        2 => raw as u16 as i16 as i64 as u64,
        4 => raw as u32 as i32 as i64 as u64,
        _ => raw,
    }
}

impl ProgramInner {
    fn invoke_raw(&self, handle: RawFn, args: &[u64]) -> u64 {
        assert!(!handle.is_null(), "call through a null function pointer");
        let (module_idx, func) = *self
            .table
            .get(handle.0 as usize - 1)
            .unwrap_or_else(|| panic!("invalid function handle {:#x}", handle.0));
        self.exec_function(module_idx, func, args)
    }

    fn exec_function(&self, module_idx: usize, func: FuncId, args: &[u64]) -> u64 {
        let loaded = &self.modules[module_idx];
        let module = &loaded.ir;
        let decl = &module.funcs[func];
        let body = decl
            .body
            .as_ref()
            .unwrap_or_else(|| panic!("call to unresolved declaration `{}`", decl.name));
        assert_eq!(
            args.len(),
            decl.ty.params.len(),
            "arity mismatch calling `{}`",
            decl.name
        );

        let mut regs = vec![0u64; body.reg_count as usize];
        regs[..args.len()].copy_from_slice(args);
        // Stack cells live until the call returns; advice may hold
        // pointers into them for the duration of the evaluation.
        let mut cells: Vec<MemBlock> = Vec::new();

        let mut block = ir::Id::new(0);
        let mut pc = 0usize;
        loop {
            let inst = &body.blocks[block].insts[pc];
            pc += 1;
            match inst {
                Inst::IConst { dst, value, .. } => regs[dst.index()] = *value as u64,
                Inst::FConst { dst, ty, value } => {
                    regs[dst.index()] = match ty {
                        Ty::Float(32) => (*value as f32).to_bits() as u64,
                        _ => value.to_bits(),
                    }
                }
                Inst::Null { dst } => regs[dst.index()] = 0,
                Inst::Str { dst, value } => {
                    regs[dst.index()] = loaded.strings[value].ptr as u64;
                }
                Inst::GlobalAddr { dst, global } => {
                    regs[dst.index()] = loaded.globals[global.index()].ptr as u64;
                }
                Inst::FuncAddr { dst, func } => {
                    regs[dst.index()] = loaded.handles[func.index()].0;
                }
                Inst::Alloca { dst, ty } => {
                    let cell = MemBlock::new(module.size_of(ty), module.align_of(ty));
                    regs[dst.index()] = cell.ptr as u64;
                    cells.push(cell);
                }
                Inst::Load { dst, ty, addr } => {
                    regs[dst.index()] = unsafe { load_scalar(module, ty, regs[addr.index()]) };
                }
                Inst::Store { ty, addr, value } => unsafe {
                    store_scalar(module, ty, regs[addr.index()], regs[value.index()]);
                },
                Inst::FieldAddr {
                    dst,
                    agg,
                    base,
                    index,
                } => {
                    let offset = module.field_offset(module.agg_fields(agg), *index as usize);
                    regs[dst.index()] = regs[base.index()].wrapping_add(offset);
                }
                Inst::ElemAddr {
                    dst,
                    elem,
                    base,
                    index,
                } => {
                    let scale = module.size_of(elem);
                    let offset = (regs[index.index()] as i64).wrapping_mul(scale as i64);
                    regs[dst.index()] = regs[base.index()].wrapping_add(offset as u64);
                }
                Inst::Bin {
                    dst,
                    op,
                    ty,
                    lhs,
                    rhs,
                } => {
                    regs[dst.index()] = eval_bin(module, *op, ty, regs[lhs.index()], regs[rhs.index()]);
                }
                Inst::Cmp {
                    dst,
                    op,
                    ty,
                    lhs,
                    rhs,
                } => {
                    regs[dst.index()] =
                        eval_cmp(*op, ty, regs[lhs.index()], regs[rhs.index()]) as u64;
                }
                Inst::Call { dst, callee, args } => {
                    let raw_args: Vec<u64> = args.iter().map(|r| regs[r.index()]).collect();
                    let result = match callee {
                        Callee::Func(func) => self.exec_function(module_idx, *func, &raw_args),
                        Callee::External(symbol) => {
                            let intrinsic = resolve_intrinsic(symbol)
                                .unwrap_or_else(|| panic!("unbound external `{symbol}`"));
                            self.call_intrinsic(intrinsic, &raw_args)
                        }
                    };
                    if let Some(dst) = dst {
                        regs[dst.index()] = result;
                    }
                }
                Inst::CallIndirect {
                    dst, callee, args, ..
                } => {
                    let raw_args: Vec<u64> = args.iter().map(|r| regs[r.index()]).collect();
                    let result = self.invoke_raw(RawFn(regs[callee.index()]), &raw_args);
                    if let Some(dst) = dst {
                        regs[dst.index()] = result;
                    }
                }
                Inst::Jump { target } => {
                    block = *target;
                    pc = 0;
                }
                Inst::Branch {
                    cond,
                    then_to,
                    else_to,
                } => {
                    block = if regs[cond.index()] != 0 {
                        *then_to
                    } else {
                        *else_to
                    };
                    pc = 0;
                }
                Inst::Ret { value } => {
                    return value.map(|r| regs[r.index()]).unwrap_or(0);
                }
            }
        }
    }

    // ─── Runtime ABI dispatch ───────────────────────────────────────────

    fn call_intrinsic(&self, intrinsic: Intrinsic, args: &[u64]) -> u64 {
        match intrinsic {
            Intrinsic::VoidType => desc_addr(TypeDesc::void_type()),
            Intrinsic::IntType => desc_addr(TypeDesc::int(args[0] as u32)),
            Intrinsic::FloatType => desc_addr(TypeDesc::float(args[0] as u32)),
            Intrinsic::PtrType => desc_addr(TypeDesc::pointer(desc_from(args[0]))),
            Intrinsic::ArrayType => desc_addr(TypeDesc::array(desc_from(args[0]), args[1])),
            Intrinsic::VectorType => desc_addr(TypeDesc::vector(desc_from(args[0]), args[1])),
            Intrinsic::AnonStructType => {
                let n = args[0] as usize;
                let elems = args[1..1 + n].iter().map(|&a| desc_from(a)).collect();
                desc_addr(TypeDesc::anon_struct(elems))
            }
            Intrinsic::ForwardStructType => {
                let module = read_cstr(args[0]);
                let name = read_cstr(args[1]);
                desc_addr(TypeDesc::forward_struct(&module, &name))
            }
            Intrinsic::SetStructElems => {
                let desc = desc_from(args[0]);
                let n = args[1] as usize;
                let elems: Vec<&'static TypeDesc> =
                    args[2..2 + n].iter().map(|&a| desc_from(a)).collect();
                desc.as_struct()
                    .expect("set_struct_elems target is a struct descriptor")
                    .set_elem_types(elems);
                0
            }
            Intrinsic::FnType => {
                let ret = desc_from(args[0]);
                let n = args[1] as usize;
                let arg_descs = args[2..2 + n].iter().map(|&a| desc_from(a)).collect();
                desc_addr(TypeDesc::function(ret, arg_descs))
            }
            Intrinsic::UnknownType => {
                let module = read_cstr(args[0]);
                let signature = read_cstr(args[1]);
                desc_addr(TypeDesc::unknown(&module, &signature))
            }
            Intrinsic::CreateExtensionPoint => {
                let module = read_cstr(args[0]);
                let name = read_cstr(args[1]);
                let type_desc = desc_from(args[2]);
                let slot = FnSlot::new(args[3] as *mut u64);
                let original = RawFn(args[4]);
                let extended = RawFn(args[5]);
                let reflect = ReflectThunk::new(
                    self as *const ProgramInner as *const (),
                    RawFn(args[6]),
                    invoke_reflect_entry,
                );
                let pt = self.runtime.create_extension_point(
                    &module, &name, type_desc, slot, original, extended, reflect,
                );
                Arc::as_ptr(&pt) as u64
            }
            Intrinsic::Eval => {
                assert_ne!(args[0], 0, "eval on an uninitialised extension point");
                let pt = unsafe { &*(args[0] as *const ExtensionPoint) };
                unsafe { pt.eval(args[1] as RetVal, args[2] as ArgVals) };
                0
            }
            Intrinsic::DebugPrint => {
                log::debug!("{}", read_cstr(args[0]));
                0
            }
        }
    }
}

/// Re-entry path for [`ReflectThunk`]: called by the runtime when advice
/// (or the evaluator) invokes a generated reflect entry.
unsafe fn invoke_reflect_entry(ctx: *const (), func: RawFn, ret: RetVal, args: ArgVals) {
    let inner = unsafe { &*(ctx as *const ProgramInner) };
    inner.invoke_raw(func, &[ret as u64, args as u64]);
}

fn desc_addr(desc: &'static TypeDesc) -> u64 {
    desc as *const TypeDesc as u64
}

/// Descriptor handles crossing the ABI are interned `&'static` addresses.
fn desc_from(raw: u64) -> &'static TypeDesc {
    assert_ne!(raw, 0, "null type descriptor handle");
    unsafe { &*(raw as *const TypeDesc) }
}

fn read_cstr(raw: u64) -> String {
    assert_ne!(raw, 0, "null string argument");
    unsafe { CStr::from_ptr(raw as *const std::ffi::c_char) }
        .to_string_lossy()
        .into_owned()
}

unsafe fn load_scalar(module: &ir::Module, ty: &Ty, addr: u64) -> u64 {
    assert_ne!(addr, 0, "load through a null pointer");
    let ptr = addr as *const u8;
    let size = module.size_of(ty);
    let raw = match size {
        1 => unsafe { ptr.read_unaligned() as u64 },
        2 => unsafe { (ptr as *const u16).read_unaligned() as u64 },
        4 => unsafe { (ptr as *const u32).read_unaligned() as u64 },
        8 => unsafe { (ptr as *const u64).read_unaligned() },
        n => panic!("scalar load of {n}-byte type {ty}"),
    };
    match ty {
        Ty::Int(_) => sext(raw, size),
        _ => raw,
    }
}

unsafe fn store_scalar(module: &ir::Module, ty: &Ty, addr: u64, value: u64) {
    assert_ne!(addr, 0, "store through a null pointer");
    let ptr = addr as *mut u8;
    match module.size_of(ty) {
        1 => unsafe { ptr.write_unaligned(value as u8) },
        2 => unsafe { (ptr as *mut u16).write_unaligned(value as u16) },
        4 => unsafe { (ptr as *mut u32).write_unaligned(value as u32) },
        8 => unsafe { (ptr as *mut u64).write_unaligned(value) },
        n => panic!("scalar store of {n}-byte type {ty}"),
    }
}

fn eval_bin(module: &ir::Module, op: BinOp, ty: &Ty, lhs: u64, rhs: u64) -> u64 {
    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::SDiv => {
            let (a, b) = (lhs as i64, rhs as i64);
            let result = match op {
                BinOp::Add => a.wrapping_add(b),
                BinOp::Sub => a.wrapping_sub(b),
                BinOp::Mul => a.wrapping_mul(b),
                BinOp::SDiv => {
                    assert_ne!(b, 0, "integer division by zero");
                    a.wrapping_div(b)
                }
                _ => unreachable!(),
            };
            sext(result as u64, module.size_of(ty))
        }
        BinOp::FAdd | BinOp::FSub | BinOp::FMul | BinOp::FDiv => match ty {
            Ty::Float(32) => {
                let (a, b) = (f32::from_bits(lhs as u32), f32::from_bits(rhs as u32));
                let result = match op {
                    BinOp::FAdd => a + b,
                    BinOp::FSub => a - b,
                    BinOp::FMul => a * b,
                    _ => a / b,
                };
                result.to_bits() as u64
            }
            _ => {
                let (a, b) = (f64::from_bits(lhs), f64::from_bits(rhs));
                let result = match op {
                    BinOp::FAdd => a + b,
                    BinOp::FSub => a - b,
                    BinOp::FMul => a * b,
                    _ => a / b,
                };
                result.to_bits()
            }
        },
    }
}

fn eval_cmp(op: CmpOp, ty: &Ty, lhs: u64, rhs: u64) -> bool {
    match ty {
        Ty::Float(32) => {
            let (a, b) = (f32::from_bits(lhs as u32), f32::from_bits(rhs as u32));
            float_cmp(op, a as f64, b as f64)
        }
        Ty::Float(_) => float_cmp(op, f64::from_bits(lhs), f64::from_bits(rhs)),
        Ty::Ptr(_) | Ty::Fn(_) => match op {
            CmpOp::Eq => lhs == rhs,
            CmpOp::Ne => lhs != rhs,
            CmpOp::Slt => lhs < rhs,
            CmpOp::Sle => lhs <= rhs,
            CmpOp::Sgt => lhs > rhs,
            CmpOp::Sge => lhs >= rhs,
        },
        _ => {
            let (a, b) = (lhs as i64, rhs as i64);
            match op {
                CmpOp::Eq => a == b,
                CmpOp::Ne => a != b,
                CmpOp::Slt => a < b,
                CmpOp::Sle => a <= b,
                CmpOp::Sgt => a > b,
                CmpOp::Sge => a >= b,
            }
        }
    }
}

fn float_cmp(op: CmpOp, a: f64, b: f64) -> bool {
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Slt => a < b,
        CmpOp::Sle => a <= b,
        CmpOp::Sgt => a > b,
        CmpOp::Sge => a >= b,
    }
}
