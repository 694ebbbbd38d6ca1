//! Textual parser for the SSA IR dump format.
//!
//! Parses the block/instruction text produced by `Code`'s `Display` back
//! into a [`Module`], so tests and tools can write fixtures as text instead
//! of driving the builder. Two passes: chumsky parses each line into an
//! untyped statement, then a resolve pass interns payloads, creates arena
//! instructions, and patches value references (which may point forward, as
//! loop phis do).
//!
//! A fixture holds promises and functions in definition order:
//!
//! ```text
//! prom 0 {
//! bb0:
//!   ret nil
//! }
//! fun main(x) {
//! bb0:
//!   %0 = ldarg 0
//!   %1 = mkarg prom0 missing, env=baseenv
//!   ret %1
//! }
//! ```
//!
//! `promN`/`clsN` reference items by definition order; `@name` interns a
//! symbol; `env=` marks the environment operand; `: env`/`: void` override
//! the result type; `!N` attaches a source index.

use std::collections::HashMap;

use chumsky::prelude::*;
use smallvec::SmallVec;

use crate::bc::DispatchTable;
use crate::ir::{
    BasicBlock, BbId, Closure, Code, Id, Instr, InstrId, Module, Promise, PromiseId, Tag,
    Ty, TypeTag, Value,
};

// ─── AST types (first pass) ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum AstValue {
    /// `%N` — the fixture's name for an instruction result.
    Ref(u32),
    Nil,
    Missing,
    Base,
    NotClosed,
}

/// One operand-position token after the tag keyword.
#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Val(AstValue),
    EnvVal(AstValue),
    Name(String),
    Prom(u32),
    Cls(u32),
    Int(i64),
    Real(f64),
    Str(String),
    Ident(String),
    PhiInput(u32, AstValue),
}

#[derive(Debug, Clone)]
enum AstStmt {
    Instr {
        result: Option<u32>,
        tag: String,
        toks: Vec<Tok>,
        ty: Option<String>,
        src: Option<u32>,
    },
    Branch {
        cond: AstValue,
        then_bb: u32,
        else_bb: u32,
    },
    Goto(u32),
    Ret(AstValue),
    Deopt(Vec<AstValue>),
}

#[derive(Debug, Default)]
struct AstBody {
    blocks: Vec<Vec<AstStmt>>,
}

enum AstItem {
    Fun {
        name: String,
        formals: Vec<String>,
        body: AstBody,
    },
    Prom {
        body: AstBody,
    },
}

// ─── Line parsers ───────────────────────────────────────────────────────────

type Extra<'src> = extra::Err<Rich<'src, char>>;

fn ws<'src>() -> impl Parser<'src, &'src str, (), Extra<'src>> + Clone {
    any()
        .filter(|c: &char| c.is_whitespace())
        .repeated()
        .ignored()
}

fn ws1<'src>() -> impl Parser<'src, &'src str, (), Extra<'src>> + Clone {
    any()
        .filter(|c: &char| c.is_whitespace())
        .repeated()
        .at_least(1)
        .ignored()
}

fn uint32<'src>() -> impl Parser<'src, &'src str, u32, Extra<'src>> + Clone {
    text::int::<_, Extra<'_>>(10).map(|s: &str| s.parse::<u32>().unwrap())
}

/// `@`-prefixed symbol; digits alone are allowed so that re-parsing a dump
/// (which prints name indices) works.
fn at_name<'src>() -> impl Parser<'src, &'src str, String, Extra<'src>> + Clone {
    just("@").ignore_then(
        any()
            .filter(|c: &char| c.is_alphanumeric() || *c == '_' || *c == '.')
            .repeated()
            .at_least(1)
            .to_slice()
            .map(|s: &str| s.to_string()),
    )
}

fn value<'src>() -> impl Parser<'src, &'src str, AstValue, Extra<'src>> + Clone {
    choice((
        just("%").ignore_then(uint32()).map(AstValue::Ref),
        just("nil").to(AstValue::Nil),
        just("missing").to(AstValue::Missing),
        just("baseenv").to(AstValue::Base),
        just("notclosed").to(AstValue::NotClosed),
    ))
}

fn bb_ref<'src>() -> impl Parser<'src, &'src str, u32, Extra<'src>> + Clone {
    just("bb").ignore_then(uint32())
}

fn number<'src>() -> impl Parser<'src, &'src str, Tok, Extra<'src>> + Clone {
    just("-")
        .or_not()
        .then(text::int::<_, Extra<'_>>(10))
        .then(just(".").then(text::int::<_, Extra<'_>>(10)).or_not())
        .to_slice()
        .map(|s: &str| {
            if s.contains('.') {
                Tok::Real(s.parse::<f64>().unwrap())
            } else {
                Tok::Int(s.parse::<i64>().unwrap())
            }
        })
}

fn string_lit<'src>() -> impl Parser<'src, &'src str, String, Extra<'src>> + Clone {
    just("\"")
        .ignore_then(
            any()
                .filter(|c: &char| *c != '"')
                .repeated()
                .to_slice()
                .map(|s: &str| s.to_string()),
        )
        .then_ignore(just("\""))
}

fn raw_token<'src>() -> impl Parser<'src, &'src str, Tok, Extra<'src>> + Clone {
    choice((
        just("env=").ignore_then(value()).map(Tok::EnvVal),
        bb_ref()
            .then_ignore(just(":"))
            .then(value())
            .map(|(bb, v)| Tok::PhiInput(bb, v)),
        at_name().map(Tok::Name),
        just("prom").ignore_then(uint32()).map(Tok::Prom),
        just("cls").ignore_then(uint32()).map(Tok::Cls),
        string_lit().map(Tok::Str),
        number(),
        value().map(Tok::Val),
        text::ident().map(|s: &str| Tok::Ident(s.to_string())),
    ))
}

fn stmt<'src>() -> impl Parser<'src, &'src str, AstStmt, Extra<'src>> {
    let branch = just("branch")
        .then(ws1())
        .ignore_then(value())
        .then_ignore(ws1().then(just("then")).then(ws1()))
        .then(bb_ref())
        .then_ignore(ws1().then(just("else")).then(ws1()))
        .then(bb_ref())
        .map(|((cond, then_bb), else_bb)| AstStmt::Branch {
            cond,
            then_bb,
            else_bb,
        });

    let goto_ = just("goto")
        .then(ws1())
        .ignore_then(bb_ref())
        .map(AstStmt::Goto);

    let ret = just("ret")
        .then(ws1())
        .ignore_then(value())
        .map(AstStmt::Ret);

    let deopt_args = just(",")
        .then(ws())
        .or_not()
        .ignore_then(value())
        .then_ignore(ws())
        .repeated()
        .collect::<Vec<_>>();
    let deopt = just("deopt")
        .ignore_then(ws1().ignore_then(deopt_args).or_not())
        .map(|args| AstStmt::Deopt(args.unwrap_or_default()));

    let result = just("%")
        .ignore_then(uint32())
        .then_ignore(ws().then(just("=")).then(ws()))
        .or_not();
    let toks = just(",")
        .then(ws())
        .or_not()
        .ignore_then(raw_token())
        .then_ignore(ws())
        .repeated()
        .collect::<Vec<_>>();
    let ty_suffix = just(":")
        .then(ws())
        .ignore_then(text::ident())
        .map(|s: &str| s.to_string())
        .then_ignore(ws())
        .or_not();
    let src_suffix = just("!").ignore_then(uint32()).or_not();
    let instr = result
        .then(text::ident().map(|s: &str| s.to_string()))
        .then_ignore(ws())
        .then(toks)
        .then(ty_suffix)
        .then(src_suffix)
        .map(|((((result, tag), toks), ty), src)| AstStmt::Instr {
            result,
            tag,
            toks,
            ty,
            src,
        });

    choice((branch, goto_, ret, deopt, instr))
        .then_ignore(ws())
        .then_ignore(end())
}

fn fun_header<'src>() -> impl Parser<'src, &'src str, (String, Vec<String>), Extra<'src>> {
    let formals = text::ident()
        .map(|s: &str| s.to_string())
        .separated_by(just(",").padded_by(ws()))
        .allow_trailing()
        .collect::<Vec<_>>()
        .delimited_by(just("(").then(ws()), ws().then(just(")")));
    just("fun")
        .then(ws1())
        .ignore_then(text::ident().map(|s: &str| s.to_string()))
        .then_ignore(ws())
        .then(formals.or_not().map(|f| f.unwrap_or_default()))
        .then_ignore(ws().then(just("{")).then(ws()).then(end()))
}

fn prom_header<'src>() -> impl Parser<'src, &'src str, Option<u32>, Extra<'src>> {
    just("prom")
        .ignore_then(ws1().ignore_then(uint32()).or_not())
        .then_ignore(ws().then(just("{")).then(ws()).then(end()))
}

fn block_header<'src>() -> impl Parser<'src, &'src str, u32, Extra<'src>> {
    bb_ref().then_ignore(just(":")).then_ignore(ws().then(end()))
}

fn run<'src, T>(
    parser: impl Parser<'src, &'src str, T, Extra<'src>>,
    line: &'src str,
    lineno: usize,
) -> Result<T, String> {
    parser.parse(line).into_result().map_err(|errs| {
        let msgs: Vec<String> = errs.iter().map(|e| e.to_string()).collect();
        format!("line {}: {}", lineno + 1, msgs.join("; "))
    })
}

// ─── Resolution (second pass) ───────────────────────────────────────────────

/// A parsed fixture: the module plus its items in definition order.
#[derive(Debug)]
pub struct ParsedModule {
    pub module: Module,
    pub funs: Vec<crate::ir::ClosureId>,
    pub proms: Vec<PromiseId>,
}

impl ParsedModule {
    /// The function named `name`. Panics when the fixture has no such item.
    pub fn fun(&self, name: &str) -> crate::ir::ClosureId {
        *self
            .funs
            .iter()
            .find(|&&cls| self.module.closures[cls].name.as_deref() == Some(name))
            .unwrap_or_else(|| panic!("fixture has no function named {name:?}"))
    }
}

/// Parse a complete fixture into a fresh module.
pub fn parse_module(src: &str) -> Result<ParsedModule, String> {
    let items = collect_items(src)?;

    let mut module = Module::new();
    let mut funs = Vec::new();
    let mut proms = Vec::new();

    // Create the arena entries first so bodies can reference any item.
    for item in &items {
        match item {
            AstItem::Fun { name, formals, .. } => {
                let formals = formals.iter().map(|f| module.names.intern(f)).collect();
                funs.push(module.closures.push(Closure {
                    name: Some(name.clone()),
                    formals,
                    default_args: Vec::new(),
                    code: Code::new(),
                    dispatch: DispatchTable::default(),
                    src_idx: None,
                }));
            }
            AstItem::Prom { .. } => {
                proms.push(module.promises.push(Promise {
                    code: Code::new(),
                    src_idx: None,
                }));
            }
        }
    }

    let mut fun_i = 0;
    let mut prom_i = 0;
    for item in &items {
        match item {
            AstItem::Fun { body, .. } => {
                let code = resolve_body(&mut module, body, proms.len(), funs.len())?;
                module.closures[funs[fun_i]].code = code;
                fun_i += 1;
            }
            AstItem::Prom { body } => {
                let code = resolve_body(&mut module, body, proms.len(), funs.len())?;
                module.promises[proms[prom_i]].code = code;
                prom_i += 1;
            }
        }
    }

    Ok(ParsedModule {
        module,
        funs,
        proms,
    })
}

fn collect_items(src: &str) -> Result<Vec<AstItem>, String> {
    let mut items: Vec<AstItem> = Vec::new();
    let mut open: Option<AstItem> = None;

    for (lineno, raw) in src.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with("fun") && line.ends_with('{') {
            if open.is_some() {
                return Err(format!("line {}: item inside item", lineno + 1));
            }
            let (name, formals) = run(fun_header(), line, lineno)?;
            open = Some(AstItem::Fun {
                name,
                formals,
                body: AstBody::default(),
            });
        } else if line.starts_with("prom") && line.ends_with('{') {
            if open.is_some() {
                return Err(format!("line {}: item inside item", lineno + 1));
            }
            run(prom_header(), line, lineno)?;
            open = Some(AstItem::Prom {
                body: AstBody::default(),
            });
        } else if line == "}" {
            let item = open
                .take()
                .ok_or_else(|| format!("line {}: unmatched closing brace", lineno + 1))?;
            items.push(item);
        } else if line.starts_with("bb") && line.ends_with(':') {
            let id = run(block_header(), line, lineno)?;
            let body = open_body(&mut open, lineno)?;
            if id as usize != body.blocks.len() {
                return Err(format!(
                    "line {}: expected bb{}, found bb{}",
                    lineno + 1,
                    body.blocks.len(),
                    id
                ));
            }
            body.blocks.push(Vec::new());
        } else {
            let parsed = run(stmt(), line, lineno)?;
            let body = open_body(&mut open, lineno)?;
            let block = body
                .blocks
                .last_mut()
                .ok_or_else(|| format!("line {}: statement before any block", lineno + 1))?;
            block.push(parsed);
        }
    }
    if open.is_some() {
        return Err("unexpected end of input inside an item".to_string());
    }
    Ok(items)
}

fn open_body<'a>(open: &'a mut Option<AstItem>, lineno: usize) -> Result<&'a mut AstBody, String> {
    match open {
        Some(AstItem::Fun { body, .. }) | Some(AstItem::Prom { body }) => Ok(body),
        None => Err(format!("line {}: content outside any item", lineno + 1)),
    }
}

/// Split an instruction's tokens into payload and operand groups, build the
/// tag, and hand back the operand tokens for the patch pass.
fn build_tag(
    module: &mut Module,
    tag: &str,
    toks: &[Tok],
    n_proms: usize,
    n_funs: usize,
) -> Result<Tag, String> {
    let one_name = || -> Result<String, String> {
        match toks.first() {
            Some(Tok::Name(n)) => Ok(n.clone()),
            other => Err(format!("{tag} expects @name, found {other:?}")),
        }
    };

    Ok(match tag {
        "ldconst" => {
            let idx = match toks.first() {
                Some(Tok::Int(n)) => module.pool.int(
                    i32::try_from(*n).map_err(|_| format!("{tag}: constant out of range"))?,
                ),
                Some(Tok::Real(r)) => module.pool.real(*r),
                Some(Tok::Str(s)) => module.pool.str(s),
                Some(Tok::Val(AstValue::Nil)) => module.pool.nil(),
                other => return Err(format!("ldconst expects a literal, found {other:?}")),
            };
            Tag::LdConst { idx }
        }
        "ldvar" => Tag::LdVar {
            name: module.names.intern(&one_name()?),
        },
        "ldvarsuper" => Tag::LdVarSuper {
            name: module.names.intern(&one_name()?),
        },
        "ldfun" => Tag::LdFun {
            name: module.names.intern(&one_name()?),
        },
        "stvar" => Tag::StVar {
            name: module.names.intern(&one_name()?),
        },
        "stvarsuper" => Tag::StVarSuper {
            name: module.names.intern(&one_name()?),
        },
        "subassign2" => Tag::Subassign2 {
            name: module.names.intern(&one_name()?),
        },
        "callbuiltin" => Tag::CallBuiltin {
            builtin: module.names.intern(&one_name()?),
        },
        "ldarg" => match toks.first() {
            Some(Tok::Int(n)) if *n >= 0 => Tag::LdArg { index: *n as u32 },
            other => return Err(format!("ldarg expects an index, found {other:?}")),
        },
        "mkenv" => {
            let names = toks
                .iter()
                .filter_map(|t| match t {
                    Tok::Name(n) => Some(module.names.intern(n)),
                    _ => None,
                })
                .collect();
            Tag::MkEnv { names }
        }
        "mkarg" => match toks.first() {
            Some(Tok::Prom(n)) if (*n as usize) < n_proms => Tag::MkArg {
                promise: Id::new(*n),
            },
            other => return Err(format!("mkarg expects a valid promN, found {other:?}")),
        },
        "mkfuncls" => match toks.first() {
            Some(Tok::Cls(n)) if (*n as usize) < n_funs => Tag::MkFunCls {
                closure: Id::new(*n),
            },
            other => return Err(format!("mkfuncls expects a valid clsN, found {other:?}")),
        },
        "staticcall" => match toks.first() {
            Some(Tok::Cls(n)) if (*n as usize) < n_funs => Tag::StaticCall {
                target: Id::new(*n),
            },
            other => return Err(format!("staticcall expects a valid clsN, found {other:?}")),
        },
        "is" => match toks.first() {
            Some(Tok::Ident(t)) => Tag::Is {
                tag: type_tag(t).ok_or_else(|| format!("unknown type tag {t:?}"))?,
            },
            other => return Err(format!("is expects a type tag, found {other:?}")),
        },
        "phi" => Tag::Phi,
        other => bare_tag(other).ok_or_else(|| format!("unknown instruction tag {other:?}"))?,
    })
}

fn bare_tag(name: &str) -> Option<Tag> {
    Some(match name {
        "ldfunctionenv" => Tag::LdFunctionEnv,
        "mkcls" => Tag::MkCls,
        "copy" => Tag::Copy,
        "casttype" => Tag::CastType,
        "force" => Tag::Force,
        "inc" => Tag::Inc,
        "asbool" => Tag::AsBool,
        "length" => Tag::Length,
        "chkmissing" => Tag::ChkMissing,
        "chkclosure" => Tag::ChkClosure,
        "isobject" => Tag::IsObject,
        "forseqsize" => Tag::ForSeqSize,
        "aslogical" => Tag::AsLogical,
        "plus" => Tag::Plus,
        "minus" => Tag::Minus,
        "not" => Tag::Not,
        "identical" => Tag::Identical,
        "lglor" => Tag::LglOr,
        "lgland" => Tag::LglAnd,
        "add" => Tag::Add,
        "sub" => Tag::Sub,
        "mul" => Tag::Mul,
        "div" => Tag::Div,
        "idiv" => Tag::IDiv,
        "mod" => Tag::Mod,
        "pow" => Tag::Pow,
        "lt" => Tag::Lt,
        "gt" => Tag::Gt,
        "lte" => Tag::Lte,
        "gte" => Tag::Gte,
        "eq" => Tag::Eq,
        "neq" => Tag::Neq,
        "colon" => Tag::Colon,
        "seq" => Tag::Seq,
        "extract1" => Tag::Extract1_1D,
        "extract2" => Tag::Extract2_1D,
        "extract1m" => Tag::Extract1_2D,
        "extract2m" => Tag::Extract2_2D,
        "subassign1" => Tag::Subassign1,
        "call" => Tag::Call,
        _ => return None,
    })
}

fn type_tag(name: &str) -> Option<TypeTag> {
    Some(match name {
        "nil" => TypeTag::Nil,
        "logical" => TypeTag::Logical,
        "int" => TypeTag::Int,
        "real" => TypeTag::Real,
        "str" => TypeTag::Str,
        "vec" => TypeTag::Vec,
        "closure" => TypeTag::Closure,
        _ => return None,
    })
}

fn default_ty(tag: &Tag) -> Ty {
    match tag {
        Tag::MkEnv { .. } | Tag::LdFunctionEnv => Ty::Env,
        Tag::StVar { .. } | Tag::StVarSuper { .. } => Ty::Void,
        Tag::Branch | Tag::Return | Tag::Deopt => Ty::Void,
        _ => Ty::Val,
    }
}

fn parse_ty(name: &str) -> Result<Ty, String> {
    match name {
        "val" => Ok(Ty::Val),
        "env" => Ok(Ty::Env),
        "void" => Ok(Ty::Void),
        other => Err(format!("unknown result type {other:?}")),
    }
}

fn resolve_body(
    module: &mut Module,
    body: &AstBody,
    n_proms: usize,
    n_funs: usize,
) -> Result<Code, String> {
    if body.blocks.is_empty() {
        return Err("a body needs at least bb0".to_string());
    }

    let mut code = Code::new();
    for _ in 1..body.blocks.len() {
        code.blocks.push(BasicBlock::default());
    }
    let nblocks = body.blocks.len() as u32;
    let check_bb = |n: u32| -> Result<BbId, String> {
        if n < nblocks {
            Ok(Id::new(n))
        } else {
            Err(format!("reference to undefined block bb{n}"))
        }
    };

    // First pass: create the instructions (payloads resolved, operands
    // still empty) and name the results.
    let mut by_name: HashMap<u32, InstrId> = HashMap::new();
    let mut created: Vec<Vec<Option<InstrId>>> = Vec::new();
    for (bb_i, stmts) in body.blocks.iter().enumerate() {
        let bb: BbId = Id::new(bb_i as u32);
        let mut ids = Vec::with_capacity(stmts.len());
        for s in stmts {
            let id = match s {
                AstStmt::Instr {
                    result,
                    tag,
                    toks,
                    ty,
                    src,
                } => {
                    let tag = build_tag(module, tag, toks, n_proms, n_funs)?;
                    let ty = match ty {
                        Some(name) => parse_ty(name)?,
                        None => default_ty(&tag),
                    };
                    let src_idx = match src {
                        Some(n) => {
                            while module.src_pool.len() <= *n as usize {
                                let fill = format!("<src {}>", module.src_pool.len());
                                module.src_pool.push(fill);
                            }
                            Some(Id::new(*n))
                        }
                        None => None,
                    };
                    let id = code.append(
                        bb,
                        Instr {
                            tag,
                            ty,
                            args: SmallVec::new(),
                            phi_preds: Vec::new(),
                            env_slot: None,
                            src_idx,
                            bb,
                        },
                    );
                    if let Some(name) = result {
                        if by_name.insert(*name, id).is_some() {
                            return Err(format!("%{name} defined twice"));
                        }
                    }
                    Some(id)
                }
                AstStmt::Branch {
                    then_bb, else_bb, ..
                } => {
                    code.blocks[bb].next1 = Some(check_bb(*then_bb)?);
                    code.blocks[bb].next0 = Some(check_bb(*else_bb)?);
                    Some(code.append(bb, make_void(Tag::Branch, bb)))
                }
                AstStmt::Goto(n) => {
                    code.blocks[bb].next0 = Some(check_bb(*n)?);
                    None
                }
                AstStmt::Ret(_) => Some(code.append(bb, make_void(Tag::Return, bb))),
                AstStmt::Deopt(_) => Some(code.append(bb, make_void(Tag::Deopt, bb))),
            };
            ids.push(id);
        }
        created.push(ids);
    }

    // Second pass: patch operands now that every result is named.
    let resolve_value = |v: AstValue, by_name: &HashMap<u32, InstrId>| -> Result<Value, String> {
        Ok(match v {
            AstValue::Ref(n) => Value::Instr(
                *by_name
                    .get(&n)
                    .ok_or_else(|| format!("reference to undefined value %{n}"))?,
            ),
            AstValue::Nil => Value::Global(crate::ir::Global::Nil),
            AstValue::Missing => Value::Global(crate::ir::Global::Missing),
            AstValue::Base => Value::Global(crate::ir::Global::BaseEnv),
            AstValue::NotClosed => Value::Global(crate::ir::Global::NotClosed),
        })
    };

    for (bb_i, stmts) in body.blocks.iter().enumerate() {
        for (s_i, s) in stmts.iter().enumerate() {
            let Some(id) = created[bb_i][s_i] else { continue };
            match s {
                AstStmt::Instr { toks, .. } => {
                    let mut args: SmallVec<[Value; 2]> = SmallVec::new();
                    let mut preds = Vec::new();
                    let mut env_slot = None;
                    for t in toks {
                        match t {
                            Tok::Val(v) => args.push(resolve_value(*v, &by_name)?),
                            Tok::EnvVal(v) => {
                                args.push(resolve_value(*v, &by_name)?);
                                env_slot = Some(args.len() as u32 - 1);
                            }
                            Tok::PhiInput(bb, v) => {
                                preds.push(check_bb(*bb)?);
                                args.push(resolve_value(*v, &by_name)?);
                            }
                            // Payload tokens were consumed by build_tag.
                            Tok::Name(_)
                            | Tok::Prom(_)
                            | Tok::Cls(_)
                            | Tok::Int(_)
                            | Tok::Real(_)
                            | Tok::Str(_)
                            | Tok::Ident(_) => {}
                        }
                    }
                    if let Some(slot) = env_slot
                        && slot as usize != args.len() - 1
                    {
                        return Err("env= must be the last operand".to_string());
                    }
                    let instr = &mut code.instrs[id];
                    if instr.is_phi() && preds.len() != args.len() {
                        return Err("phi operands must all be bbN:value pairs".to_string());
                    }
                    instr.args = args;
                    instr.phi_preds = preds;
                    instr.env_slot = env_slot;
                }
                AstStmt::Branch { cond, .. } => {
                    code.instrs[id].args.push(resolve_value(*cond, &by_name)?);
                }
                AstStmt::Ret(v) => {
                    code.instrs[id].args.push(resolve_value(*v, &by_name)?);
                }
                AstStmt::Deopt(vs) => {
                    for v in vs {
                        code.instrs[id].args.push(resolve_value(*v, &by_name)?);
                    }
                }
                AstStmt::Goto(_) => {}
            }
        }
    }

    code.validate();
    Ok(code)
}

fn make_void(tag: Tag, bb: BbId) -> Instr {
    Instr {
        tag,
        ty: Ty::Void,
        args: SmallVec::new(),
        phi_preds: Vec::new(),
        env_slot: None,
        src_idx: None,
        bb,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_straight_line_function() {
        let parsed = parse_module(
            "fun main(a, b) {\n\
             bb0:\n\
             \x20 %0 = ldarg 0\n\
             \x20 %1 = ldarg 1\n\
             \x20 %2 = add %0 %1 !4\n\
             \x20 ret %2\n\
             }\n",
        )
        .expect("fixture parses");

        let cls = parsed.fun("main");
        let code = &parsed.module.closures[cls].code;
        assert_eq!(code.blocks.len(), 1);
        assert_eq!(code.instrs.len(), 4);
        let display = format!("{code}");
        assert!(display.contains("%2 = add %0, %1 !4"), "{display}");
        assert_eq!(parsed.module.closures[cls].formals.len(), 2);
    }

    #[test]
    fn parses_diamond_with_phi() {
        let parsed = parse_module(
            "fun main {\n\
             bb0:\n\
             \x20 %0 = ldarg 0\n\
             \x20 branch %0 then bb1 else bb2\n\
             bb1:\n\
             \x20 %1 = ldconst 1\n\
             \x20 goto bb3\n\
             bb2:\n\
             \x20 %2 = ldconst 2\n\
             \x20 goto bb3\n\
             bb3:\n\
             \x20 %3 = phi bb1:%1, bb2:%2\n\
             \x20 ret %3\n\
             }\n",
        )
        .expect("fixture parses");

        let cls = parsed.fun("main");
        let code = &parsed.module.closures[cls].code;
        assert_eq!(code.blocks.len(), 4);
        let entry = &code.blocks[code.entry];
        assert_eq!(entry.next1, Some(Id::new(1)));
        assert_eq!(entry.next0, Some(Id::new(2)));
        let phi = code
            .instrs
            .iter()
            .find(|(_, i)| i.is_phi())
            .map(|(_, i)| i)
            .expect("phi parsed");
        assert_eq!(phi.phi_preds, vec![Id::new(1), Id::new(2)]);
    }

    #[test]
    fn parses_forward_references_in_loops() {
        let parsed = parse_module(
            "fun main {\n\
             bb0:\n\
             \x20 %0 = ldarg 0\n\
             \x20 goto bb1\n\
             bb1:\n\
             \x20 %1 = phi bb0:%0, bb1:%2\n\
             \x20 %2 = inc %1\n\
             \x20 %3 = asbool %2\n\
             \x20 branch %3 then bb1 else bb2\n\
             bb2:\n\
             \x20 ret %2\n\
             }\n",
        )
        .expect("back references parse");

        let cls = parsed.fun("main");
        let code = &parsed.module.closures[cls].code;
        let phi = code
            .instrs
            .iter()
            .find(|(_, i)| i.is_phi())
            .map(|(_, i)| i)
            .unwrap();
        assert_eq!(phi.args.len(), 2);
    }

    #[test]
    fn parses_environments_and_promises() {
        let parsed = parse_module(
            "prom 0 {\n\
             bb0:\n\
             \x20 ret nil\n\
             }\n\
             fun main {\n\
             bb0:\n\
             \x20 %0 = mkarg prom0 missing, env=baseenv\n\
             \x20 %1 = ldvar @x, env=baseenv\n\
             \x20 ret %1\n\
             }\n",
        )
        .expect("fixture parses");

        assert_eq!(parsed.proms.len(), 1);
        let cls = parsed.fun("main");
        let code = &parsed.module.closures[cls].code;
        let mkarg = &code.instrs[Id::new(0)];
        assert!(matches!(mkarg.tag, Tag::MkArg { .. }));
        assert_eq!(mkarg.env_slot, Some(1));
        assert_eq!(mkarg.args[0], Value::Global(crate::ir::Global::Missing));
    }

    #[test]
    fn rejects_unknown_tags_and_bad_refs() {
        let err = parse_module("fun main {\nbb0:\n  %0 = warble\n  ret %0\n}\n")
            .expect_err("unknown tag");
        assert!(err.contains("unknown instruction tag"), "{err}");

        let err = parse_module("fun main {\nbb0:\n  ret %7\n}\n").expect_err("bad ref");
        assert!(err.contains("undefined value %7"), "{err}");

        let err = parse_module("fun main {\nbb0:\n  goto bb9\n}\n").expect_err("bad block");
        assert!(err.contains("undefined block bb9"), "{err}");
    }

    #[test]
    fn display_is_a_fixed_point_of_parsing() {
        let src = "fun main {\n\
                   bb0:\n\
                   \x20 %0 = ldarg 0\n\
                   \x20 branch %0 then bb1 else bb2\n\
                   bb1:\n\
                   \x20 %1 = ldarg 1\n\
                   \x20 goto bb3\n\
                   bb2:\n\
                   \x20 %2 = ldarg 2\n\
                   \x20 goto bb3\n\
                   bb3:\n\
                   \x20 %3 = phi bb1:%1, bb2:%2\n\
                   \x20 ret %3\n\
                   }\n";
        let parsed = parse_module(src).expect("fixture parses");
        let cls = parsed.fun("main");
        let once = format!("{}", parsed.module.closures[cls].code);

        let wrapped = format!("fun main {{\n{once}}}\n");
        let reparsed = parse_module(&wrapped).expect("dump reparses");
        let twice = format!("{}", reparsed.module.closures[reparsed.fun("main")].code);
        assert_eq!(once, twice);
    }
}
