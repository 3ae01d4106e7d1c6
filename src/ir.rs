//! Lowered typed IR for augmentum.
//!
//! This is the substrate the instrumentation pass rewrites and the host
//! executes: modules with named struct types, globals, and functions made of
//! basic blocks over an unlimited register file. The type vocabulary mirrors
//! what a C-family frontend lowers to — fixed-width integers, two float
//! widths, pointers, arrays, vectors, literal and named structs, and
//! function types with per-parameter by-value attributes.
//!
//! Registers hold scalars and pointers; aggregates always travel behind
//! pointers (by-value aggregates arrive as `byval` pointer parameters).
//! The textual form printed by [`Module`]'s `Display` is parsed back by
//! [`crate::ir_parse`].

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

// ─── Typed indices ──────────────────────────────────────────────────────────

/// Index into an [`Arena`], tagged with the element type so a register
/// index can never be handed to a block or function lookup.
pub struct Id<T> {
    raw: u32,
    tag: PhantomData<fn() -> T>,
}

impl<T> Id<T> {
    pub(crate) fn new(raw: u32) -> Self {
        Id {
            raw,
            tag: PhantomData,
        }
    }

    /// Position of the element within its arena.
    pub fn index(self) -> usize {
        self.raw as usize
    }
}

// An id is its raw index; deriving these would put the same bounds on T.
impl<T> Copy for Id<T> {}

impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for Id<T> {}

impl<T> std::hash::Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u32(self.raw);
    }
}

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id{}", self.raw)
    }
}

/// Append-only store of IR objects addressed by [`Id`]. Nothing is ever
/// removed, so an id stays valid for the arena's whole life.
pub struct Arena<T> {
    entries: Vec<T>,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Arena {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, entry: T) -> Id<T> {
        self.entries.push(entry);
        Id::new(self.entries.len() as u32 - 1)
    }

    /// Ids of all current entries, in insertion order. Borrows nothing, so
    /// a caller may snapshot the ids and then grow the arena.
    pub fn ids(&self) -> impl Iterator<Item = Id<T>> + use<T> {
        (0..self.entries.len() as u32).map(Id::new)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id<T>, &T)> {
        self.ids().zip(&self.entries)
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Clone for Arena<T> {
    fn clone(&self) -> Self {
        Arena {
            entries: self.entries.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Arena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<T> std::ops::Index<Id<T>> for Arena<T> {
    type Output = T;
    fn index(&self, id: Id<T>) -> &T {
        &self.entries[id.index()]
    }
}

impl<T> std::ops::IndexMut<Id<T>> for Arena<T> {
    fn index_mut(&mut self, id: Id<T>) -> &mut T {
        &mut self.entries[id.index()]
    }
}

// ─── Type aliases ───────────────────────────────────────────────────────────

/// Marker type for virtual register IDs.
pub struct RegMarker;
/// A virtual register — unlimited, scalar/pointer valued.
pub type Reg = Id<RegMarker>;

pub type FuncId = Id<Func>;
pub type GlobalId = Id<Global>;
pub type BlockId = Id<Block>;

// ─── Types ──────────────────────────────────────────────────────────────────

/// A lowered type.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Ty {
    Void,
    /// Integer of arbitrary bit width. Widths outside {1, 8, 16, 32, 64}
    /// are legal in the IR but have no descriptor; the rewriter degrades
    /// them to unknown descriptors.
    Int(u32),
    /// 32- or 64-bit IEEE float.
    Float(u32),
    Ptr(Box<Ty>),
    Array(Box<Ty>, u64),
    Vector(Box<Ty>, u64),
    /// Literal (anonymous) struct.
    Struct(Vec<Ty>),
    /// Reference to a named struct; the body lives in [`Module::structs`].
    Named(String),
    Fn(Box<FnTy>),
}

impl Ty {
    /// Pointer to this type.
    pub fn ptr_to(self) -> Ty {
        Ty::Ptr(Box::new(self))
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Ty::Void)
    }

    /// Aggregates cannot live in registers.
    pub fn is_aggregate(&self) -> bool {
        matches!(
            self,
            Ty::Array(..) | Ty::Vector(..) | Ty::Struct(..) | Ty::Named(..)
        )
    }
}

/// A function type. `byval` parameters have pointer type in the IR; the
/// flag marks that the pointee is the semantic argument.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct FnTy {
    pub ret: Ty,
    pub params: Vec<Param>,
    pub variadic: bool,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Param {
    pub ty: Ty,
    pub byval: bool,
}

impl Param {
    pub fn new(ty: Ty) -> Self {
        Param { ty, byval: false }
    }

    pub fn byval(ty: Ty) -> Self {
        Param { ty, byval: true }
    }
}

impl FnTy {
    pub fn new(ret: Ty, params: Vec<Param>) -> Self {
        FnTy {
            ret,
            params,
            variadic: false,
        }
    }
}

// ─── Instructions ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    SDiv,
    FAdd,
    FSub,
    FMul,
    FDiv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
}

/// The target of a direct call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callee {
    /// A function in the same module.
    Func(FuncId),
    /// A declared external symbol, bound by the host at load time.
    External(String),
}

/// One instruction. Operands are registers; types are carried inline where
/// execution needs them (memory widths, call signatures, address scaling).
#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    /// Integer constant, truncated to the width of `ty`.
    IConst { dst: Reg, ty: Ty, value: i64 },
    /// Float constant.
    FConst { dst: Reg, ty: Ty, value: f64 },
    /// Null pointer.
    Null { dst: Reg },
    /// Address of an interned NUL-terminated string.
    Str { dst: Reg, value: String },
    /// Address of a global's storage.
    GlobalAddr { dst: Reg, global: GlobalId },
    /// Opaque handle of a function in this module.
    FuncAddr { dst: Reg, func: FuncId },
    /// One stack cell of `ty`, live for the rest of the call.
    Alloca { dst: Reg, ty: Ty },
    /// Scalar/pointer load of `ty` from the address in `addr`.
    Load { dst: Reg, ty: Ty, addr: Reg },
    /// Scalar/pointer store of `ty` to the address in `addr`.
    Store { ty: Ty, addr: Reg, value: Reg },
    /// Address of field `index` of a struct of type `agg` based at `base`.
    FieldAddr {
        dst: Reg,
        agg: Ty,
        base: Reg,
        index: u32,
    },
    /// `base + index * size_of(elem)`.
    ElemAddr {
        dst: Reg,
        elem: Ty,
        base: Reg,
        index: Reg,
    },
    Bin {
        dst: Reg,
        op: BinOp,
        ty: Ty,
        lhs: Reg,
        rhs: Reg,
    },
    /// Signed comparison producing 0 or 1.
    Cmp {
        dst: Reg,
        op: CmpOp,
        ty: Ty,
        lhs: Reg,
        rhs: Reg,
    },
    Call {
        dst: Option<Reg>,
        callee: Callee,
        args: Vec<Reg>,
    },
    /// Call through a function handle in `callee`.
    CallIndirect {
        dst: Option<Reg>,
        ty: FnTy,
        callee: Reg,
        args: Vec<Reg>,
    },
    Jump { target: BlockId },
    Branch {
        cond: Reg,
        then_to: BlockId,
        else_to: BlockId,
    },
    Ret { value: Option<Reg> },
}

// ─── Functions, globals, modules ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    Public,
    Private,
}

#[derive(Debug, Default, Clone)]
pub struct Block {
    pub insts: Vec<Inst>,
}

/// A function body: blocks plus the size of the register file. Parameters
/// occupy registers `0..params.len()` on entry; block 0 is the entry block.
#[derive(Debug, Clone)]
pub struct FuncBody {
    pub blocks: Arena<Block>,
    pub reg_count: u32,
}

#[derive(Debug)]
pub struct Func {
    pub name: String,
    pub ty: FnTy,
    pub linkage: Linkage,
    /// `None` marks a declaration.
    pub body: Option<FuncBody>,
}

impl Func {
    pub fn is_declaration(&self) -> bool {
        self.body.is_none()
    }
}

/// Initializer for a global. All augmentum-generated globals are
/// pointer-sized, but arbitrary sized types are allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalInit {
    Zero,
    Func(FuncId),
}

#[derive(Debug)]
pub struct Global {
    pub name: String,
    pub ty: Ty,
    pub init: GlobalInit,
}

/// One translation unit. `name` is the module path as the frontend knew it.
#[derive(Debug)]
pub struct Module {
    pub name: String,
    /// Named struct bodies; `None` marks an opaque struct.
    pub structs: BTreeMap<String, Option<Vec<Ty>>>,
    pub globals: Arena<Global>,
    pub funcs: Arena<Func>,
    /// Global constructors, run by the host at load time in order.
    pub ctors: Vec<FuncId>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Module {
            name: name.into(),
            structs: BTreeMap::new(),
            globals: Arena::new(),
            funcs: Arena::new(),
            ctors: Vec::new(),
        }
    }

    pub fn func_by_name(&self, name: &str) -> Option<FuncId> {
        self.funcs.iter().find(|(_, f)| f.name == name).map(|(id, _)| id)
    }

    pub fn global_by_name(&self, name: &str) -> Option<GlobalId> {
        self.globals
            .iter()
            .find(|(_, g)| g.name == name)
            .map(|(id, _)| id)
    }

    pub fn define_struct(&mut self, name: impl Into<String>, body: Option<Vec<Ty>>) {
        self.structs.insert(name.into(), body);
    }

    /// Body of a named struct, if defined and non-opaque.
    pub fn struct_body(&self, name: &str) -> Option<&[Ty]> {
        match self.structs.get(name) {
            Some(Some(body)) => Some(body),
            _ => None,
        }
    }

    // ─── Layout ─────────────────────────────────────────────────────────

    /// Byte size of a sized type. Panics on void, opaque, and function
    /// types — those never have storage.
    pub fn size_of(&self, ty: &Ty) -> u64 {
        match ty {
            Ty::Void => panic!("size_of(void)"),
            Ty::Int(bits) => int_bytes(*bits),
            Ty::Float(32) => 4,
            Ty::Float(_) => 8,
            Ty::Ptr(_) | Ty::Fn(_) => 8,
            Ty::Array(elem, n) | Ty::Vector(elem, n) => self.size_of(elem) * n,
            Ty::Struct(fields) => self.struct_size(fields),
            Ty::Named(name) => {
                let body = self
                    .struct_body(name)
                    .unwrap_or_else(|| panic!("size_of(opaque struct %{name})"));
                self.struct_size(body)
            }
        }
    }

    pub fn align_of(&self, ty: &Ty) -> u64 {
        match ty {
            Ty::Void => panic!("align_of(void)"),
            Ty::Int(bits) => int_bytes(*bits),
            Ty::Float(32) => 4,
            Ty::Float(_) => 8,
            Ty::Ptr(_) | Ty::Fn(_) => 8,
            Ty::Array(elem, _) | Ty::Vector(elem, _) => self.align_of(elem),
            Ty::Struct(fields) => self.struct_align(fields),
            Ty::Named(name) => {
                let body = self
                    .struct_body(name)
                    .unwrap_or_else(|| panic!("align_of(opaque struct %{name})"));
                self.struct_align(body)
            }
        }
    }

    /// Byte offset of field `index` within a struct laid out C-style.
    pub fn field_offset(&self, fields: &[Ty], index: usize) -> u64 {
        let mut offset = 0u64;
        for (i, field) in fields.iter().enumerate() {
            let align = self.align_of(field);
            offset = round_up(offset, align);
            if i == index {
                return offset;
            }
            offset += self.size_of(field);
        }
        panic!("field index {index} out of range for {} fields", fields.len())
    }

    fn struct_size(&self, fields: &[Ty]) -> u64 {
        let mut offset = 0u64;
        let mut max_align = 1u64;
        for field in fields {
            let align = self.align_of(field);
            max_align = max_align.max(align);
            offset = round_up(offset, align) + self.size_of(field);
        }
        round_up(offset, max_align)
    }

    fn struct_align(&self, fields: &[Ty]) -> u64 {
        fields.iter().map(|f| self.align_of(f)).max().unwrap_or(1)
    }

    /// Resolve the fields of an aggregate type used by `FieldAddr`.
    pub fn agg_fields<'a>(&'a self, agg: &'a Ty) -> &'a [Ty] {
        match agg {
            Ty::Struct(fields) => fields,
            Ty::Named(name) => self
                .struct_body(name)
                .unwrap_or_else(|| panic!("field address into opaque struct %{name}")),
            other => panic!("field address into non-struct type {other:?}"),
        }
    }
}

fn int_bytes(bits: u32) -> u64 {
    match bits {
        0 => panic!("zero-width integer"),
        1..=8 => 1,
        9..=16 => 2,
        17..=32 => 4,
        _ => 8,
    }
}

fn round_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

// ─── Body builder ───────────────────────────────────────────────────────────

/// Builds a [`FuncBody`] one instruction at a time. Parameters are
/// pre-assigned registers `0..param_count`; `reg()` hands out fresh ones.
pub struct BodyBuilder {
    blocks: Arena<Block>,
    current: BlockId,
    next_reg: u32,
}

impl BodyBuilder {
    pub fn new(param_count: u32) -> Self {
        let mut blocks = Arena::new();
        let entry = blocks.push(Block::default());
        BodyBuilder {
            blocks,
            current: entry,
            next_reg: param_count,
        }
    }

    /// Register holding parameter `i`.
    pub fn param(&self, i: usize) -> Reg {
        Id::new(i as u32)
    }

    pub fn reg(&mut self) -> Reg {
        let reg = Id::new(self.next_reg);
        self.next_reg += 1;
        reg
    }

    pub fn new_block(&mut self) -> BlockId {
        self.blocks.push(Block::default())
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    pub fn push(&mut self, inst: Inst) {
        self.blocks[self.current].insts.push(inst);
    }

    pub fn finish(self) -> FuncBody {
        FuncBody {
            blocks: self.blocks,
            reg_count: self.next_reg,
        }
    }

    // Convenience emitters. Each returns the destination register.

    pub fn iconst(&mut self, ty: Ty, value: i64) -> Reg {
        let dst = self.reg();
        self.push(Inst::IConst { dst, ty, value });
        dst
    }

    pub fn fconst(&mut self, ty: Ty, value: f64) -> Reg {
        let dst = self.reg();
        self.push(Inst::FConst { dst, ty, value });
        dst
    }

    pub fn null(&mut self) -> Reg {
        let dst = self.reg();
        self.push(Inst::Null { dst });
        dst
    }

    pub fn str_addr(&mut self, value: impl Into<String>) -> Reg {
        let dst = self.reg();
        self.push(Inst::Str {
            dst,
            value: value.into(),
        });
        dst
    }

    pub fn global_addr(&mut self, global: GlobalId) -> Reg {
        let dst = self.reg();
        self.push(Inst::GlobalAddr { dst, global });
        dst
    }

    pub fn func_addr(&mut self, func: FuncId) -> Reg {
        let dst = self.reg();
        self.push(Inst::FuncAddr { dst, func });
        dst
    }

    pub fn alloca(&mut self, ty: Ty) -> Reg {
        let dst = self.reg();
        self.push(Inst::Alloca { dst, ty });
        dst
    }

    pub fn load(&mut self, ty: Ty, addr: Reg) -> Reg {
        let dst = self.reg();
        self.push(Inst::Load { dst, ty, addr });
        dst
    }

    pub fn store(&mut self, ty: Ty, addr: Reg, value: Reg) {
        self.push(Inst::Store { ty, addr, value });
    }

    pub fn field_addr(&mut self, agg: Ty, base: Reg, index: u32) -> Reg {
        let dst = self.reg();
        self.push(Inst::FieldAddr {
            dst,
            agg,
            base,
            index,
        });
        dst
    }

    pub fn elem_addr(&mut self, elem: Ty, base: Reg, index: Reg) -> Reg {
        let dst = self.reg();
        self.push(Inst::ElemAddr {
            dst,
            elem,
            base,
            index,
        });
        dst
    }

    pub fn bin(&mut self, op: BinOp, ty: Ty, lhs: Reg, rhs: Reg) -> Reg {
        let dst = self.reg();
        self.push(Inst::Bin {
            dst,
            op,
            ty,
            lhs,
            rhs,
        });
        dst
    }

    pub fn cmp(&mut self, op: CmpOp, ty: Ty, lhs: Reg, rhs: Reg) -> Reg {
        let dst = self.reg();
        self.push(Inst::Cmp {
            dst,
            op,
            ty,
            lhs,
            rhs,
        });
        dst
    }

    pub fn call(&mut self, callee: Callee, args: Vec<Reg>, has_result: bool) -> Option<Reg> {
        let dst = has_result.then(|| self.reg());
        self.push(Inst::Call { dst, callee, args });
        dst
    }

    pub fn call_external(&mut self, name: &str, args: Vec<Reg>, has_result: bool) -> Option<Reg> {
        self.call(Callee::External(name.to_string()), args, has_result)
    }

    pub fn call_indirect(
        &mut self,
        ty: FnTy,
        callee: Reg,
        args: Vec<Reg>,
        has_result: bool,
    ) -> Option<Reg> {
        let dst = has_result.then(|| self.reg());
        self.push(Inst::CallIndirect {
            dst,
            ty,
            callee,
            args,
        });
        dst
    }

    pub fn jump(&mut self, target: BlockId) {
        self.push(Inst::Jump { target });
    }

    pub fn branch(&mut self, cond: Reg, then_to: BlockId, else_to: BlockId) {
        self.push(Inst::Branch {
            cond,
            then_to,
            else_to,
        });
    }

    pub fn ret(&mut self, value: Option<Reg>) {
        self.push(Inst::Ret { value });
    }
}

// ─── Display ────────────────────────────────────────────────────────────────

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Void => write!(f, "void"),
            Ty::Int(bits) => write!(f, "i{bits}"),
            Ty::Float(bits) => write!(f, "f{bits}"),
            Ty::Ptr(elem) => write!(f, "{elem}*"),
            Ty::Array(elem, n) => write!(f, "[{n} x {elem}]"),
            Ty::Vector(elem, n) => write!(f, "<{n} x {elem}>"),
            Ty::Struct(fields) => {
                write!(f, "{{ ")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{field}")?;
                }
                write!(f, " }}")
            }
            Ty::Named(name) => write!(f, "%{name}"),
            Ty::Fn(fn_ty) => write!(f, "({fn_ty})"),
        }
    }
}

impl fmt::Display for FnTy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", param.ty)?;
            if param.byval {
                write!(f, " byval")?;
            }
        }
        if self.variadic {
            if !self.params.is_empty() {
                write!(f, ", ")?;
            }
            write!(f, "...")?;
        }
        write!(f, ") -> {}", self.ret)
    }
}

/// Quote a symbol name if it is not a plain identifier.
fn fmt_name(f: &mut fmt::Formatter<'_>, name: &str) -> fmt::Result {
    let plain = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if plain {
        write!(f, "@{name}")
    } else {
        write!(f, "@\"{name}\"")
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::SDiv => "sdiv",
            BinOp::FAdd => "fadd",
            BinOp::FSub => "fsub",
            BinOp::FMul => "fmul",
            BinOp::FDiv => "fdiv",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "eq",
            CmpOp::Ne => "ne",
            CmpOp::Slt => "slt",
            CmpOp::Sle => "sle",
            CmpOp::Sgt => "sgt",
            CmpOp::Sge => "sge",
        };
        write!(f, "{s}")
    }
}

struct InstDisplay<'a> {
    inst: &'a Inst,
    module: &'a Module,
}

impl fmt::Display for InstDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.module;
        match self.inst {
            Inst::IConst { dst, ty, value } => write!(f, "r{} = const.{ty} {value}", dst.index()),
            Inst::FConst { dst, ty, value } => {
                write!(f, "r{} = fconst.{ty} {value:?}", dst.index())
            }
            Inst::Null { dst } => write!(f, "r{} = null", dst.index()),
            Inst::Str { dst, value } => write!(f, "r{} = str {value:?}", dst.index()),
            Inst::GlobalAddr { dst, global } => {
                write!(f, "r{} = global ", dst.index())?;
                fmt_name(f, &m.globals[*global].name)
            }
            Inst::FuncAddr { dst, func } => {
                write!(f, "r{} = func ", dst.index())?;
                fmt_name(f, &m.funcs[*func].name)
            }
            Inst::Alloca { dst, ty } => write!(f, "r{} = alloca {ty}", dst.index()),
            Inst::Load { dst, ty, addr } => {
                write!(f, "r{} = load {ty}, r{}", dst.index(), addr.index())
            }
            Inst::Store { ty, addr, value } => {
                write!(f, "store {ty} r{} -> r{}", value.index(), addr.index())
            }
            Inst::FieldAddr {
                dst,
                agg,
                base,
                index,
            } => write!(f, "r{} = field {agg}, r{}, {index}", dst.index(), base.index()),
            Inst::ElemAddr {
                dst,
                elem,
                base,
                index,
            } => write!(
                f,
                "r{} = elem {elem}, r{}, r{}",
                dst.index(),
                base.index(),
                index.index()
            ),
            Inst::Bin {
                dst,
                op,
                ty,
                lhs,
                rhs,
            } => write!(
                f,
                "r{} = {op}.{ty} r{}, r{}",
                dst.index(),
                lhs.index(),
                rhs.index()
            ),
            Inst::Cmp {
                dst,
                op,
                ty,
                lhs,
                rhs,
            } => write!(
                f,
                "r{} = cmp.{op}.{ty} r{}, r{}",
                dst.index(),
                lhs.index(),
                rhs.index()
            ),
            Inst::Call { dst, callee, args } => {
                if let Some(dst) = dst {
                    write!(f, "r{} = ", dst.index())?;
                }
                write!(f, "call ")?;
                match callee {
                    Callee::Func(id) => fmt_name(f, &m.funcs[*id].name)?,
                    Callee::External(name) => write!(f, "!{name}")?,
                }
                write!(f, "(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "r{}", arg.index())?;
                }
                write!(f, ")")
            }
            Inst::CallIndirect {
                dst,
                ty,
                callee,
                args,
            } => {
                if let Some(dst) = dst {
                    write!(f, "r{} = ", dst.index())?;
                }
                write!(f, "calli ({ty}) r{}(", callee.index())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "r{}", arg.index())?;
                }
                write!(f, ")")
            }
            Inst::Jump { target } => write!(f, "jmp b{}", target.index()),
            Inst::Branch {
                cond,
                then_to,
                else_to,
            } => write!(
                f,
                "br r{}, b{}, b{}",
                cond.index(),
                then_to.index(),
                else_to.index()
            ),
            Inst::Ret { value: Some(v) } => write!(f, "ret r{}", v.index()),
            Inst::Ret { value: None } => write!(f, "ret"),
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module {:?} {{", self.name)?;
        for (name, body) in &self.structs {
            match body {
                Some(fields) => {
                    write!(f, "  struct %{name} = {{ ")?;
                    for (i, field) in fields.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{field}")?;
                    }
                    writeln!(f, " }}")?;
                }
                None => writeln!(f, "  struct %{name}")?,
            }
        }
        for (_, global) in self.globals.iter() {
            write!(f, "  global ")?;
            fmt_name(f, &global.name)?;
            write!(f, " : {} = ", global.ty)?;
            match &global.init {
                GlobalInit::Zero => writeln!(f, "zero")?,
                GlobalInit::Func(id) => {
                    fmt_name(f, &self.funcs[*id].name)?;
                    writeln!(f)?;
                }
            }
        }
        for (_, func) in self.funcs.iter() {
            match &func.body {
                None => {
                    write!(f, "  declare fn ")?;
                    fmt_name(f, &func.name)?;
                    writeln!(f, "{}", func.ty)?;
                }
                Some(body) => {
                    match func.linkage {
                        Linkage::Public => write!(f, "  fn ")?,
                        Linkage::Private => write!(f, "  private fn ")?,
                    }
                    fmt_name(f, &func.name)?;
                    writeln!(f, "{} {{", func.ty)?;
                    for (block_id, block) in body.blocks.iter() {
                        writeln!(f, "  b{}:", block_id.index())?;
                        for inst in &block.insts {
                            writeln!(
                                f,
                                "    {}",
                                InstDisplay {
                                    inst,
                                    module: self
                                }
                            )?;
                        }
                    }
                    writeln!(f, "  }}")?;
                }
            }
        }
        for ctor in &self.ctors {
            write!(f, "  ctor ")?;
            fmt_name(f, &self.funcs[*ctor].name)?;
            writeln!(f)?;
        }
        write!(f, "}}")
    }
}
