//! Textual parser for the lowered IR.
//!
//! Parses the format printed by [`Module`]'s `Display` back into a
//! [`Module`]. Two passes: parse text → AST, then resolve symbol references
//! (function names, global names, block labels) against the module under
//! construction. Test fixtures and `emit-transformed-ir` output both use
//! this format.

use std::collections::HashMap;

use chumsky::prelude::*;

use crate::ir::{
    Arena, BinOp, Block, BlockId, Callee, CmpOp, FnTy, Func, FuncBody, FuncId, Global, GlobalId,
    GlobalInit, Inst, Linkage, Module, Param, Reg, Ty,
};

// ─── AST types (first pass) ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum AstCallee {
    /// `@name` — a function in this module.
    Func(String),
    /// `!name` — an external symbol.
    External(String),
}

#[derive(Debug, Clone)]
enum AstRhs {
    IConst(Ty, i64),
    FConst(Ty, f64),
    Null,
    Str(String),
    Global(String),
    Func(String),
    Alloca(Ty),
    Load(Ty, u32),
    Field(Ty, u32, u32),
    Elem(Ty, u32, u32),
    Bin(BinOp, Ty, u32, u32),
    Cmp(CmpOp, Ty, u32, u32),
    Call(AstCallee, Vec<u32>),
    CallIndirect(FnTy, u32, Vec<u32>),
}

#[derive(Debug, Clone)]
enum AstInst {
    Assign { dst: u32, rhs: AstRhs },
    Store { ty: Ty, value: u32, addr: u32 },
    VoidCall { callee: AstCallee, args: Vec<u32> },
    VoidCallIndirect { ty: FnTy, callee: u32, args: Vec<u32> },
    Jump(u32),
    Branch { cond: u32, then_to: u32, else_to: u32 },
    Ret(Option<u32>),
}

#[derive(Debug, Clone)]
struct AstBlock {
    label: u32,
    insts: Vec<AstInst>,
}

#[derive(Debug, Clone)]
enum AstItem {
    Struct {
        name: String,
        body: Option<Vec<Ty>>,
    },
    Global {
        name: String,
        ty: Ty,
        init: Option<String>,
    },
    Func {
        name: String,
        linkage: Linkage,
        declaration: bool,
        ty: FnTy,
        blocks: Vec<AstBlock>,
    },
    Ctor(String),
}

#[derive(Debug, Clone)]
struct AstModule {
    name: String,
    items: Vec<AstItem>,
}

// ─── Parsers ────────────────────────────────────────────────────────────────

type Extra<'src> = extra::Err<Rich<'src, char>>;

fn ws<'src>() -> impl Parser<'src, &'src str, (), Extra<'src>> + Clone {
    any()
        .filter(|c: &char| c.is_whitespace())
        .repeated()
        .ignored()
}

/// Parse a u32 decimal number.
fn uint32<'src>() -> impl Parser<'src, &'src str, u32, Extra<'src>> + Clone {
    text::int::<_, Extra<'_>>(10).map(|s: &str| s.parse::<u32>().unwrap())
}

/// Parse a u64 decimal number.
fn uint64<'src>() -> impl Parser<'src, &'src str, u64, Extra<'src>> + Clone {
    text::int::<_, Extra<'_>>(10).map(|s: &str| s.parse::<u64>().unwrap())
}

/// Parse an i64 decimal number with optional sign.
fn int64<'src>() -> impl Parser<'src, &'src str, i64, Extra<'src>> + Clone {
    just('-')
        .or_not()
        .then(text::int::<_, Extra<'_>>(10))
        .map(|(sign, digits): (Option<char>, &str)| {
            let value = digits.parse::<i64>().unwrap();
            if sign.is_some() { -value } else { value }
        })
}

/// Parse a float literal as printed by `{:?}` on f64.
fn float64<'src>() -> impl Parser<'src, &'src str, f64, Extra<'src>> + Clone {
    any()
        .filter(|c: &char| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
        .repeated()
        .at_least(1)
        .to_slice()
        .map(|s: &str| s.parse::<f64>().unwrap())
}

/// Plain identifier: letters, digits, `_`, `.`.
fn ident<'src>() -> impl Parser<'src, &'src str, String, Extra<'src>> + Clone {
    any()
        .filter(|c: &char| c.is_ascii_alphanumeric() || *c == '_' || *c == '.')
        .repeated()
        .at_least(1)
        .to_slice()
        .map(|s: &str| s.to_string())
}

/// Double-quoted string with the escapes `Debug` formatting produces.
fn string_lit<'src>() -> impl Parser<'src, &'src str, String, Extra<'src>> + Clone {
    let escape = just('\\').ignore_then(choice((
        just('\\').to('\\'),
        just('"').to('"'),
        just('n').to('\n'),
        just('t').to('\t'),
        just('r').to('\r'),
        just('0').to('\0'),
    )));
    let plain = any().filter(|c: &char| *c != '"' && *c != '\\');
    escape
        .or(plain)
        .repeated()
        .collect::<String>()
        .delimited_by(just('"'), just('"'))
}

/// `@name` or `@"quoted name"`.
fn symbol<'src>() -> impl Parser<'src, &'src str, String, Extra<'src>> + Clone {
    just('@').ignore_then(string_lit().or(ident()))
}

/// `rN`.
fn reg<'src>() -> impl Parser<'src, &'src str, u32, Extra<'src>> + Clone {
    just('r').ignore_then(uint32())
}

/// `bN`.
fn block_ref<'src>() -> impl Parser<'src, &'src str, u32, Extra<'src>> + Clone {
    just('b').ignore_then(uint32())
}

fn comma_list<'src, T: 'src>(
    inner: impl Parser<'src, &'src str, T, Extra<'src>> + Clone,
) -> impl Parser<'src, &'src str, Vec<T>, Extra<'src>> + Clone {
    inner
        .separated_by(just(',').padded_by(ws()))
        .allow_trailing()
        .collect::<Vec<_>>()
}

/// One parameter of a function type, or the trailing `...`.
#[derive(Clone)]
enum AstParam {
    Param(Param),
    Ellipsis,
}

/// A type. Function types appear parenthesized: `((i32) -> void)*`.
fn ty<'src>() -> impl Parser<'src, &'src str, Ty, Extra<'src>> + Clone {
    recursive(|ty| {
        let array = just('[')
            .ignore_then(ws())
            .ignore_then(uint64())
            .then_ignore(ws().then(just('x')).then(ws()))
            .then(ty.clone())
            .then_ignore(ws().then(just(']')))
            .map(|(n, elem)| Ty::Array(Box::new(elem), n));

        let vector = just('<')
            .ignore_then(ws())
            .ignore_then(uint64())
            .then_ignore(ws().then(just('x')).then(ws()))
            .then(ty.clone())
            .then_ignore(ws().then(just('>')))
            .map(|(n, elem)| Ty::Vector(Box::new(elem), n));

        let literal_struct = comma_list(ty.clone())
            .delimited_by(just('{').then(ws()), ws().then(just('}')))
            .map(Ty::Struct);

        let named = just('%').ignore_then(ident()).map(Ty::Named);

        let function = fn_ty(ty.clone())
            .delimited_by(just('(').then(ws()), ws().then(just(')')))
            .map(|f| Ty::Fn(Box::new(f)));

        let base = choice((
            just("void").to(Ty::Void),
            just("f32").to(Ty::Float(32)),
            just("f64").to(Ty::Float(64)),
            just('i').ignore_then(uint32()).map(Ty::Int),
            array,
            vector,
            literal_struct,
            named,
            function,
        ));

        base.then(just('*').repeated().collect::<Vec<_>>())
            .map(|(base, stars)| {
                stars.into_iter().fold(base, |ty, _| ty.ptr_to())
            })
    })
}

/// `(P0, P1, ...) -> R`, with `byval` suffixes and a trailing `...` for
/// variadics.
fn fn_ty<'src>(
    ty: impl Parser<'src, &'src str, Ty, Extra<'src>> + Clone + 'src,
) -> impl Parser<'src, &'src str, FnTy, Extra<'src>> + Clone {
    let param = choice((
        just("...").to(AstParam::Ellipsis),
        ty.clone()
            .then(ws().then(just("byval")).or_not())
            .map(|(ty, byval)| {
                AstParam::Param(Param {
                    ty,
                    byval: byval.is_some(),
                })
            }),
    ));

    comma_list(param)
        .delimited_by(just('(').then(ws()), ws().then(just(')')))
        .then_ignore(ws().then(just("->")).then(ws()))
        .then(ty)
        .map(|(entries, ret)| {
            let mut params = Vec::new();
            let mut variadic = false;
            for entry in entries {
                match entry {
                    AstParam::Param(p) => params.push(p),
                    AstParam::Ellipsis => variadic = true,
                }
            }
            FnTy {
                ret,
                params,
                variadic,
            }
        })
}

fn callee<'src>() -> impl Parser<'src, &'src str, AstCallee, Extra<'src>> + Clone {
    let external = just('!').ignore_then(ident()).map(AstCallee::External);
    symbol().map(AstCallee::Func).or(external)
}

fn call_args<'src>() -> impl Parser<'src, &'src str, Vec<u32>, Extra<'src>> + Clone {
    comma_list(reg()).delimited_by(just('(').then(ws()), ws().then(just(')')))
}

/// Right-hand side of `rN = …`.
fn rhs<'src>() -> impl Parser<'src, &'src str, AstRhs, Extra<'src>> + Clone {
    let iconst = just("const.")
        .ignore_then(ty())
        .then_ignore(ws())
        .then(int64())
        .map(|(ty, v)| AstRhs::IConst(ty, v));

    let fconst = just("fconst.")
        .ignore_then(ty())
        .then_ignore(ws())
        .then(float64())
        .map(|(ty, v)| AstRhs::FConst(ty, v));

    let null = just("null").to(AstRhs::Null);

    let str_addr = just("str")
        .ignore_then(ws())
        .ignore_then(string_lit())
        .map(AstRhs::Str);

    let global_addr = just("global")
        .ignore_then(ws())
        .ignore_then(symbol())
        .map(AstRhs::Global);

    let func_addr = just("func")
        .ignore_then(ws())
        .ignore_then(symbol())
        .map(AstRhs::Func);

    let alloca = just("alloca")
        .ignore_then(ws())
        .ignore_then(ty())
        .map(AstRhs::Alloca);

    let load = just("load")
        .ignore_then(ws())
        .ignore_then(ty())
        .then_ignore(just(',').padded_by(ws()))
        .then(reg())
        .map(|(ty, addr)| AstRhs::Load(ty, addr));

    let field = just("field")
        .ignore_then(ws())
        .ignore_then(ty())
        .then_ignore(just(',').padded_by(ws()))
        .then(reg())
        .then_ignore(just(',').padded_by(ws()))
        .then(uint32())
        .map(|((agg, base), index)| AstRhs::Field(agg, base, index));

    let elem = just("elem")
        .ignore_then(ws())
        .ignore_then(ty())
        .then_ignore(just(',').padded_by(ws()))
        .then(reg())
        .then_ignore(just(',').padded_by(ws()))
        .then(reg())
        .map(|((elem, base), index)| AstRhs::Elem(elem, base, index));

    let bin_op = choice((
        just("add").to(BinOp::Add),
        just("sub").to(BinOp::Sub),
        just("mul").to(BinOp::Mul),
        just("sdiv").to(BinOp::SDiv),
        just("fadd").to(BinOp::FAdd),
        just("fsub").to(BinOp::FSub),
        just("fmul").to(BinOp::FMul),
        just("fdiv").to(BinOp::FDiv),
    ));
    let bin = bin_op
        .then_ignore(just('.'))
        .then(ty())
        .then_ignore(ws())
        .then(reg())
        .then_ignore(just(',').padded_by(ws()))
        .then(reg())
        .map(|(((op, ty), lhs), rhs)| AstRhs::Bin(op, ty, lhs, rhs));

    let cmp_op = choice((
        just("eq").to(CmpOp::Eq),
        just("ne").to(CmpOp::Ne),
        just("slt").to(CmpOp::Slt),
        just("sle").to(CmpOp::Sle),
        just("sgt").to(CmpOp::Sgt),
        just("sge").to(CmpOp::Sge),
    ));
    let cmp = just("cmp.")
        .ignore_then(cmp_op)
        .then_ignore(just('.'))
        .then(ty())
        .then_ignore(ws())
        .then(reg())
        .then_ignore(just(',').padded_by(ws()))
        .then(reg())
        .map(|(((op, ty), lhs), rhs)| AstRhs::Cmp(op, ty, lhs, rhs));

    let call_indirect = just("calli")
        .ignore_then(ws())
        .ignore_then(fn_ty(ty()).delimited_by(just('(').then(ws()), ws().then(just(')'))))
        .then_ignore(ws())
        .then(reg())
        .then(call_args())
        .map(|((ty, callee), args)| AstRhs::CallIndirect(ty, callee, args));

    let call = just("call")
        .ignore_then(ws())
        .ignore_then(callee())
        .then(call_args())
        .map(|(callee, args)| AstRhs::Call(callee, args));

    choice((
        fconst,
        iconst,
        cmp,
        call_indirect,
        call,
        null,
        str_addr,
        global_addr,
        func_addr,
        alloca,
        load,
        field,
        elem,
        bin,
    ))
}

fn inst<'src>() -> impl Parser<'src, &'src str, AstInst, Extra<'src>> + Clone {
    let assign = reg()
        .then_ignore(just('=').padded_by(ws()))
        .then(rhs())
        .map(|(dst, rhs)| AstInst::Assign { dst, rhs });

    let store = just("store")
        .ignore_then(ws())
        .ignore_then(ty())
        .then_ignore(ws())
        .then(reg())
        .then_ignore(just("->").padded_by(ws()))
        .then(reg())
        .map(|((ty, value), addr)| AstInst::Store { ty, value, addr });

    let void_calli = just("calli")
        .ignore_then(ws())
        .ignore_then(fn_ty(ty()).delimited_by(just('(').then(ws()), ws().then(just(')'))))
        .then_ignore(ws())
        .then(reg())
        .then(call_args())
        .map(|((ty, callee), args)| AstInst::VoidCallIndirect { ty, callee, args });

    let void_call = just("call")
        .ignore_then(ws())
        .ignore_then(callee())
        .then(call_args())
        .map(|(callee, args)| AstInst::VoidCall { callee, args });

    let jump = just("jmp")
        .ignore_then(ws())
        .ignore_then(block_ref())
        .map(AstInst::Jump);

    let branch = just("br")
        .ignore_then(ws())
        .ignore_then(reg())
        .then_ignore(just(',').padded_by(ws()))
        .then(block_ref())
        .then_ignore(just(',').padded_by(ws()))
        .then(block_ref())
        .map(|((cond, then_to), else_to)| AstInst::Branch {
            cond,
            then_to,
            else_to,
        });

    let ret = just("ret")
        .ignore_then(ws().ignore_then(reg()).or_not())
        .map(AstInst::Ret);

    choice((assign, store, void_calli, void_call, jump, branch, ret))
}

fn block<'src>() -> impl Parser<'src, &'src str, AstBlock, Extra<'src>> + Clone {
    block_ref()
        .then_ignore(just(':'))
        .then_ignore(ws())
        .then(
            inst()
                .then_ignore(ws())
                .repeated()
                .collect::<Vec<_>>(),
        )
        .map(|(label, insts)| AstBlock { label, insts })
}

fn item<'src>() -> impl Parser<'src, &'src str, AstItem, Extra<'src>> + Clone {
    let struct_item = just("struct")
        .ignore_then(ws())
        .ignore_then(just('%'))
        .ignore_then(ident())
        .then(
            just('=')
                .padded_by(ws())
                .ignore_then(
                    comma_list(ty())
                        .delimited_by(just('{').then(ws()), ws().then(just('}'))),
                )
                .or_not(),
        )
        .map(|(name, body)| AstItem::Struct { name, body });

    let global_item = just("global")
        .ignore_then(ws())
        .ignore_then(symbol())
        .then_ignore(just(':').padded_by(ws()))
        .then(ty())
        .then_ignore(just('=').padded_by(ws()))
        .then(just("zero").to(None).or(symbol().map(Some)))
        .map(|((name, ty), init)| AstItem::Global { name, ty, init });

    let declare_item = just("declare")
        .ignore_then(ws())
        .ignore_then(just("fn"))
        .ignore_then(ws())
        .ignore_then(symbol())
        .then(fn_ty(ty()))
        .map(|(name, ty)| AstItem::Func {
            name,
            linkage: Linkage::Public,
            declaration: true,
            ty,
            blocks: Vec::new(),
        });

    let fn_item = just("private")
        .then_ignore(ws())
        .or_not()
        .then_ignore(just("fn"))
        .then_ignore(ws())
        .then(symbol())
        .then(fn_ty(ty()))
        .then_ignore(ws())
        .then(
            block()
                .repeated()
                .collect::<Vec<_>>()
                .delimited_by(just('{').then(ws()), ws().then(just('}'))),
        )
        .map(|(((private, name), ty), blocks)| AstItem::Func {
            name,
            linkage: if private.is_some() {
                Linkage::Private
            } else {
                Linkage::Public
            },
            declaration: false,
            ty,
            blocks,
        });

    let ctor_item = just("ctor")
        .ignore_then(ws())
        .ignore_then(symbol())
        .map(AstItem::Ctor);

    choice((struct_item, global_item, declare_item, fn_item, ctor_item))
}

fn module<'src>() -> impl Parser<'src, &'src str, AstModule, Extra<'src>> + Clone {
    just("module")
        .padded_by(ws())
        .ignore_then(string_lit())
        .then_ignore(ws().then(just('{')))
        .then(
            item()
                .padded_by(ws())
                .repeated()
                .collect::<Vec<_>>(),
        )
        .then_ignore(just('}').padded_by(ws()))
        .then_ignore(end())
        .map(|(name, items)| AstModule { name, items })
}

// ─── Resolution (second pass) ───────────────────────────────────────────────

/// Parse error with context.
#[derive(Debug)]
pub struct ParseError {
    pub message: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseError {}

fn err(message: impl Into<String>) -> ParseError {
    ParseError {
        message: message.into(),
    }
}

/// Parse the textual IR form into a [`Module`].
pub fn parse_module(input: &str) -> Result<Module, ParseError> {
    let ast = module().parse(input).into_result().map_err(|errs| {
        let msgs: Vec<String> = errs.into_iter().map(|e| format!("{e}")).collect();
        err(msgs.join("\n"))
    })?;
    resolve(ast)
}

fn resolve(ast: AstModule) -> Result<Module, ParseError> {
    let mut result = Module::new(ast.name);

    // Headers first so bodies can reference any symbol in the module.
    let mut func_ids: HashMap<String, FuncId> = HashMap::new();
    let mut global_ids: HashMap<String, GlobalId> = HashMap::new();
    for item in &ast.items {
        match item {
            AstItem::Struct { name, body } => {
                result.define_struct(name.clone(), body.clone());
            }
            AstItem::Func { name, linkage, ty, .. } => {
                if func_ids.contains_key(name) {
                    return Err(err(format!("duplicate function `{name}`")));
                }
                let id = result.funcs.push(Func {
                    name: name.clone(),
                    ty: ty.clone(),
                    linkage: *linkage,
                    body: None,
                });
                func_ids.insert(name.clone(), id);
            }
            AstItem::Global { name, ty, .. } => {
                if global_ids.contains_key(name) {
                    return Err(err(format!("duplicate global `{name}`")));
                }
                let id = result.globals.push(Global {
                    name: name.clone(),
                    ty: ty.clone(),
                    init: GlobalInit::Zero,
                });
                global_ids.insert(name.clone(), id);
            }
            AstItem::Ctor(_) => {}
        }
    }

    // Global initializers and constructor list.
    for item in &ast.items {
        match item {
            AstItem::Global {
                name,
                init: Some(func),
                ..
            } => {
                let func = *func_ids
                    .get(func)
                    .ok_or_else(|| err(format!("global `{name}` references unknown function `{func}`")))?;
                result.globals[global_ids[name]].init = GlobalInit::Func(func);
            }
            AstItem::Ctor(name) => {
                let func = *func_ids
                    .get(name)
                    .ok_or_else(|| err(format!("ctor references unknown function `{name}`")))?;
                result.ctors.push(func);
            }
            _ => {}
        }
    }

    // Bodies.
    for item in &ast.items {
        let AstItem::Func {
            name,
            declaration: false,
            ty,
            blocks,
            ..
        } = item
        else {
            continue;
        };
        if blocks.is_empty() {
            return Err(err(format!("function `{name}` has no blocks")));
        }

        let mut arena: Arena<Block> = Arena::new();
        let mut max_reg = ty.params.len() as u32;
        for (ordinal, ast_block) in blocks.iter().enumerate() {
            if ast_block.label as usize != ordinal {
                return Err(err(format!(
                    "function `{name}`: block label b{} out of order (expected b{ordinal})",
                    ast_block.label
                )));
            }
            let mut insts = Vec::with_capacity(ast_block.insts.len());
            for ast_inst in &ast_block.insts {
                insts.push(resolve_inst(
                    ast_inst,
                    &func_ids,
                    &global_ids,
                    blocks.len() as u32,
                    name,
                    &mut max_reg,
                )?);
            }
            arena.push(Block { insts });
        }

        result.funcs[func_ids[name]].body = Some(FuncBody {
            blocks: arena,
            reg_count: max_reg,
        });
    }

    Ok(result)
}

fn resolve_inst(
    ast: &AstInst,
    func_ids: &HashMap<String, FuncId>,
    global_ids: &HashMap<String, GlobalId>,
    block_count: u32,
    func_name: &str,
    max_reg: &mut u32,
) -> Result<Inst, ParseError> {
    let mut reg = |index: u32| -> Reg {
        *max_reg = (*max_reg).max(index + 1);
        crate::ir::Id::new(index)
    };
    let block = |index: u32| -> Result<BlockId, ParseError> {
        if index >= block_count {
            return Err(err(format!(
                "function `{func_name}` references missing block b{index}"
            )));
        }
        Ok(crate::ir::Id::new(index))
    };
    let func = |name: &String| -> Result<FuncId, ParseError> {
        func_ids
            .get(name)
            .copied()
            .ok_or_else(|| err(format!("unknown function `{name}` in `{func_name}`")))
    };
    let callee = |ast: &AstCallee| -> Result<Callee, ParseError> {
        Ok(match ast {
            AstCallee::Func(name) => Callee::Func(func(name)?),
            AstCallee::External(name) => Callee::External(name.clone()),
        })
    };

    Ok(match ast {
        AstInst::Assign { dst, rhs } => {
            let dst = reg(*dst);
            match rhs {
                AstRhs::IConst(ty, value) => Inst::IConst {
                    dst,
                    ty: ty.clone(),
                    value: *value,
                },
                AstRhs::FConst(ty, value) => Inst::FConst {
                    dst,
                    ty: ty.clone(),
                    value: *value,
                },
                AstRhs::Null => Inst::Null { dst },
                AstRhs::Str(value) => Inst::Str {
                    dst,
                    value: value.clone(),
                },
                AstRhs::Global(name) => Inst::GlobalAddr {
                    dst,
                    global: *global_ids
                        .get(name)
                        .ok_or_else(|| err(format!("unknown global `{name}` in `{func_name}`")))?,
                },
                AstRhs::Func(name) => Inst::FuncAddr {
                    dst,
                    func: func(name)?,
                },
                AstRhs::Alloca(ty) => Inst::Alloca {
                    dst,
                    ty: ty.clone(),
                },
                AstRhs::Load(ty, addr) => Inst::Load {
                    dst,
                    ty: ty.clone(),
                    addr: reg(*addr),
                },
                AstRhs::Field(agg, base, index) => Inst::FieldAddr {
                    dst,
                    agg: agg.clone(),
                    base: reg(*base),
                    index: *index,
                },
                AstRhs::Elem(elem, base, index) => Inst::ElemAddr {
                    dst,
                    elem: elem.clone(),
                    base: reg(*base),
                    index: reg(*index),
                },
                AstRhs::Bin(op, ty, lhs, rhs) => Inst::Bin {
                    dst,
                    op: *op,
                    ty: ty.clone(),
                    lhs: reg(*lhs),
                    rhs: reg(*rhs),
                },
                AstRhs::Cmp(op, ty, lhs, rhs) => Inst::Cmp {
                    dst,
                    op: *op,
                    ty: ty.clone(),
                    lhs: reg(*lhs),
                    rhs: reg(*rhs),
                },
                AstRhs::Call(ast_callee, args) => Inst::Call {
                    dst: Some(dst),
                    callee: callee(ast_callee)?,
                    args: args.iter().map(|&a| reg(a)).collect(),
                },
                AstRhs::CallIndirect(ty, target, args) => Inst::CallIndirect {
                    dst: Some(dst),
                    ty: ty.clone(),
                    callee: reg(*target),
                    args: args.iter().map(|&a| reg(a)).collect(),
                },
            }
        }
        AstInst::Store { ty, value, addr } => Inst::Store {
            ty: ty.clone(),
            addr: reg(*addr),
            value: reg(*value),
        },
        AstInst::VoidCall { callee: c, args } => Inst::Call {
            dst: None,
            callee: callee(c)?,
            args: args.iter().map(|&a| reg(a)).collect(),
        },
        AstInst::VoidCallIndirect { ty, callee, args } => Inst::CallIndirect {
            dst: None,
            ty: ty.clone(),
            callee: reg(*callee),
            args: args.iter().map(|&a| reg(a)).collect(),
        },
        AstInst::Jump(target) => Inst::Jump {
            target: block(*target)?,
        },
        AstInst::Branch {
            cond,
            then_to,
            else_to,
        } => Inst::Branch {
            cond: reg(*cond),
            then_to: block(*then_to)?,
            else_to: block(*else_to)?,
        },
        AstInst::Ret(value) => Inst::Ret {
            value: value.map(&mut reg),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::{run_pass, PassConfig};

    #[test]
    fn parse_simple_function() {
        let input = r#"
module "test.c" {
  fn @add(i32, i32) -> i32 {
  b0:
    r2 = add.i32 r0, r1
    ret r2
  }
}
"#;
        let module = parse_module(input).unwrap();
        assert_eq!(module.name, "test.c");
        let add = module.func_by_name("add").unwrap();
        let body = module.funcs[add].body.as_ref().unwrap();
        assert_eq!(body.blocks.len(), 1);
        assert_eq!(body.reg_count, 3);
    }

    #[test]
    fn parse_structs_globals_and_ctors() {
        let input = r#"
module "m.c" {
  struct %Node = { i32, %Node* }
  struct %Opaque
  global @slot : ((i32) -> i32)* = @id
  fn @id(i32) -> i32 {
  b0:
    ret r0
  }
  private fn @setup() -> void {
  b0:
    ret
  }
  ctor @setup
}
"#;
        let module = parse_module(input).unwrap();
        assert_eq!(
            module.struct_body("Node"),
            Some(&[Ty::Int(32), Ty::Named("Node".into()).ptr_to()][..])
        );
        assert!(module.structs.contains_key("Opaque"));
        assert!(module.struct_body("Opaque").is_none());

        let slot = module.global_by_name("slot").unwrap();
        let id = module.func_by_name("id").unwrap();
        assert_eq!(module.globals[slot].init, GlobalInit::Func(id));

        let setup = module.func_by_name("setup").unwrap();
        assert_eq!(module.ctors, vec![setup]);
        assert_eq!(module.funcs[setup].linkage, Linkage::Private);
    }

    #[test]
    fn parse_control_flow_and_memory() {
        let input = r#"
module "m.c" {
  fn @f(i32*) -> i32 {
  b0:
    r1 = load i32, r0
    r2 = const.i32 0
    r3 = cmp.sgt.i32 r1, r2
    br r3, b1, b2
  b1:
    r4 = const.i32 1
    store i32 r4 -> r0
    jmp b2
  b2:
    r5 = load i32, r0
    ret r5
  }
}
"#;
        let module = parse_module(input).unwrap();
        let f = module.func_by_name("f").unwrap();
        assert_eq!(module.funcs[f].body.as_ref().unwrap().blocks.len(), 3);
    }

    #[test]
    fn parse_rejects_unknown_symbols() {
        let input = r#"
module "m.c" {
  fn @f() -> void {
  b0:
    call @missing()
    ret
  }
}
"#;
        let error = parse_module(input).unwrap_err();
        assert!(error.message.contains("unknown function `missing`"));
    }

    #[test]
    fn parse_rejects_out_of_order_blocks() {
        let input = r#"
module "m.c" {
  fn @f() -> void {
  b1:
    ret
  }
}
"#;
        let error = parse_module(input).unwrap_err();
        assert!(error.message.contains("out of order"));
    }

    #[test]
    fn round_trips_an_instrumented_module() {
        // The pass output exercises every construct: quoted symbols,
        // function-pointer globals, externals, indirect calls, ctors.
        let source = r#"
module "roundtrip.c" {
  struct %Node = { i32, %Node* }
  fn @list_append(%Node*, i32) -> %Node* {
  b0:
    ret r0
  }
}
"#;
        let mut module = parse_module(source).unwrap();
        run_pass(&mut module, &PassConfig::default());

        let printed = module.to_string();
        let reparsed = parse_module(&printed).unwrap();
        assert_eq!(reparsed.to_string(), printed);
    }

    #[test]
    fn parse_byval_and_variadic_signatures() {
        let input = r#"
module "m.c" {
  declare fn @printf_like(i8*, ...) -> i32
  fn @consume(%C* byval) -> void {
  b0:
    ret
  }
  struct %C = { i32 }
}
"#;
        let module = parse_module(input).unwrap();
        let printf = module.func_by_name("printf_like").unwrap();
        assert!(module.funcs[printf].ty.variadic);
        assert!(module.funcs[printf].is_declaration());

        let consume = module.func_by_name("consume").unwrap();
        assert!(module.funcs[consume].ty.params[0].byval);
    }
}
