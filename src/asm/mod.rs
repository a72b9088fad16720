//! The assembler: source text in, object module out.
//!
//! [`assemble_file`] and [`assemble_str`] drive the whole front half of
//! the toolchain: the lexer and its context stack, the directive engine,
//! the symbol table, the expression engine and the section builder, then
//! pack everything into an [`obj::Object`].

use std::fmt;
use std::mem;
use std::path::{Path, PathBuf};
use std::rc::Rc;

mod charmap;
mod context;
mod expr;
mod fixpoint;
mod instr;
mod lexer;
mod parser;
mod section;
mod symbol;

pub use charmap::{Charmap, Charmaps};
pub use context::{ContextStack, Loc};
pub use expr::Expr;
pub use lexer::{Keyword, LexOpts, Lexer, Tok, Token};
pub use section::{AsmSection, SectionSpec, Sections};
pub use symbol::{SymKind, Symbol, SymbolId, SymbolTable};

use crate::common::AssertKind;
use crate::diag::{Fatal, Reporter, WarningConfig};
use crate::obj;
use crate::rpn::{self, RpnOp};

/// Assembler configuration, the library-side view of the CLI flags.
#[derive(Debug, Clone)]
pub struct Options {
    /// Directories searched by INCLUDE and INCBIN.
    pub include_paths: Vec<PathBuf>,
    /// Context-stack depth limit (`-r`).
    pub max_depth: usize,
    /// Warning settings (`-W`).
    pub warnings: WarningConfig,
    /// Rewrite `ld a, [nn]` to `ldh` for provable high-page addresses.
    pub optimize_loads: bool,
    /// Byte used for DS fills and ALIGN padding.
    pub pad_byte: u8,
    /// Default fixed-point precision.
    pub fix_precision: u8,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            include_paths: Vec::new(),
            max_depth: 64,
            warnings: WarningConfig::default(),
            optimize_loads: false,
            pad_byte: 0,
            fix_precision: 16,
        }
    }
}

/// Options a source file can change and PUSHO/POPO can save.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RuntimeOpts {
    pub pad: u8,
    pub optimize_loads: bool,
}

/// An assertion waiting for the linker.
#[derive(Debug)]
pub(crate) struct PendingAssert {
    pub loc: Loc,
    pub pc_section: i32,
    pub pc_offset: u32,
    pub kind: AssertKind,
    pub ops: Vec<RpnOp>,
    pub message: String,
}

/// The result of a successful assembly.
#[derive(Debug)]
pub struct Output {
    /// The object module, ready for [`crate::write`].
    pub object: obj::Object,
    /// Files opened through INCLUDE/INCBIN, for dependency output.
    pub dependencies: Vec<PathBuf>,
    /// Number of warnings reported.
    pub warnings: usize,
}

/// Why an assembly produced no object.
#[derive(Debug)]
pub enum BuildError {
    /// An unrecoverable condition stopped the run.
    Fatal(Fatal),
    /// The run completed but reported errors.
    Errors(usize),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::Fatal(fatal) => write!(f, "fatal: {}", fatal),
            BuildError::Errors(count) => write!(f, "assembly failed with {} error(s)", count),
        }
    }
}

impl std::error::Error for BuildError {}

impl From<Fatal> for BuildError {
    fn from(fatal: Fatal) -> Self {
        BuildError::Fatal(fatal)
    }
}

/// All assembler state; one per translation unit.
#[derive(Debug)]
pub struct Assembler {
    pub(crate) opts: Options,
    pub(crate) diag: Reporter,
    pub(crate) lexer: Lexer,
    pub(crate) symbols: SymbolTable,
    pub(crate) sections: Sections,
    pub(crate) charmaps: Charmaps,
    pub(crate) runtime: RuntimeOpts,
    pub(crate) ifs: Vec<parser::IfLevel>,
    pub(crate) opt_stack: Vec<(LexOpts, RuntimeOpts)>,
    pub(crate) assertions: Vec<PendingAssert>,
    pub(crate) deps: Vec<PathBuf>,
    pub(crate) rs_counter: i32,
    pub(crate) for_unique: Option<u32>,
}

impl Assembler {
    fn new(opts: Options) -> Assembler {
        let mut lexer = Lexer::new(ContextStack::new(opts.max_depth));
        lexer.opts.fix_precision = opts.fix_precision;
        let runtime = RuntimeOpts {
            pad: opts.pad_byte,
            optimize_loads: opts.optimize_loads,
        };
        Assembler {
            diag: Reporter::new(opts.warnings.clone()),
            lexer,
            symbols: SymbolTable::new(),
            sections: Sections::default(),
            charmaps: Charmaps::default(),
            runtime,
            ifs: Vec::new(),
            opt_stack: Vec::new(),
            assertions: Vec::new(),
            deps: Vec::new(),
            rs_counter: 0,
            for_unique: None,
            opts,
        }
    }

    /// Pack the final state into an object module.
    fn finalize(mut self) -> (obj::Object, Reporter, Vec<PathBuf>) {
        let ctx = mem::replace(&mut self.lexer.ctx, ContextStack::new(1));
        let nodes = ctx.into_nodes();
        let mut object = obj::Object {
            nodes,
            ..obj::Object::default()
        };

        let mut index_map: Vec<Option<u32>> = vec![None; self.symbols.all().len()];
        for (i, symbol) in self.symbols.all().iter().enumerate() {
            if !symbol.alive {
                continue;
            }
            let def = |section: i32, value: i32| obj::SymbolDef {
                node: symbol.node,
                line: symbol.line,
                section,
                value,
            };
            let visibility = match &symbol.kind {
                SymKind::Label { section, offset } => {
                    let def = def(*section as i32, *offset as i32);
                    if symbol.exported {
                        obj::Visibility::Export(def)
                    } else {
                        obj::Visibility::Local(def)
                    }
                }
                SymKind::Equ(value) | SymKind::Var(value) => {
                    let def = def(obj::SECTION_NONE, *value);
                    if symbol.exported {
                        obj::Visibility::Export(def)
                    } else {
                        obj::Visibility::Local(def)
                    }
                }
                SymKind::Ref => {
                    let location = object.location(symbol.node, symbol.line);
                    if symbol.exported {
                        self.diag.error(
                            location,
                            format!("`{}` is exported but never defined", symbol.name),
                        );
                        continue;
                    }
                    if !symbol.referenced {
                        continue;
                    }
                    if symbol.name.starts_with('!') {
                        self.diag.error(
                            location,
                            "reference to an anonymous label that is never defined",
                        );
                        continue;
                    }
                    if symbol.name.contains('.') {
                        self.diag.error(
                            location,
                            format!("local label `{}` is never defined", symbol.name),
                        );
                        continue;
                    }
                    obj::Visibility::Import
                }
                SymKind::Equs(_) | SymKind::Macro { .. } | SymKind::Builtin => continue,
            };
            index_map[i] = Some(object.symbols.len() as u32);
            object.symbols.push(obj::Symbol {
                name: symbol.name.clone(),
                visibility,
            });
        }

        let remap = |ops: Vec<RpnOp>, index_map: &[Option<u32>]| -> Vec<u8> {
            let mapped: Vec<RpnOp> = ops
                .into_iter()
                .map(|op| match op {
                    RpnOp::Sym(id) => RpnOp::Sym(index_map[id as usize].unwrap_or(0)),
                    RpnOp::BankSym(id) => RpnOp::BankSym(index_map[id as usize].unwrap_or(0)),
                    other => other,
                })
                .collect();
            let mut bytes = Vec::new();
            rpn::serialize(&mapped, &mut bytes);
            bytes
        };

        for section in mem::take(&mut self.sections).into_list() {
            let patches = section
                .patches
                .into_iter()
                .map(|patch| obj::Patch {
                    node: patch.loc.node,
                    line: patch.loc.line,
                    offset: patch.offset,
                    pc_section: patch.pc_section as i32,
                    pc_offset: patch.pc_offset,
                    kind: patch.kind,
                    rpn: remap(patch.ops, &index_map),
                })
                .collect();
            object.sections.push(obj::Section {
                name: section.name,
                size: section.size,
                kind: section.kind,
                modifier: section.modifier,
                org: section.org,
                bank: section.bank,
                align_log2: section.align_log2,
                align_ofs: section.align_ofs,
                data: if section.kind.has_data() {
                    section.data
                } else {
                    Vec::new()
                },
                patches,
            });
        }

        for pending in mem::take(&mut self.assertions) {
            object.assertions.push(obj::Assertion {
                patch: obj::Patch {
                    node: pending.loc.node,
                    line: pending.loc.line,
                    offset: 0,
                    pc_section: pending.pc_section,
                    pc_offset: pending.pc_offset,
                    kind: crate::common::PatchKind::Byte,
                    rpn: remap(pending.ops, &index_map),
                },
                kind: pending.kind,
                message: pending.message,
            });
        }

        (object, self.diag, self.deps)
    }
}

/// Assemble a source file from disk.
pub fn assemble_file(path: impl AsRef<Path>, opts: &Options) -> Result<Output, BuildError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| Fatal::new(format!("cannot read `{}`: {}", path.display(), e)))?;
    assemble_text(path.to_path_buf(), text, opts)
}

/// Assemble in-memory source; `name` is used in diagnostics.
pub fn assemble_str(name: &str, source: &str, opts: &Options) -> Result<Output, BuildError> {
    assemble_text(PathBuf::from(name), source.to_owned(), opts)
}

fn assemble_text(path: PathBuf, text: String, opts: &Options) -> Result<Output, BuildError> {
    let mut asm = Assembler::new(opts.clone());
    asm.lexer
        .ctx
        .push_file(path, Rc::from(text.as_str()))
        .map_err(Fatal::new)?;
    asm.run()?;
    let (object, diag, dependencies) = asm.finalize();
    if diag.has_errors() {
        return Err(BuildError::Errors(diag.error_count()));
    }
    Ok(Output {
        object,
        dependencies,
        warnings: diag.warning_count(),
    })
}
