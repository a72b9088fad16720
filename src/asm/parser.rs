//! The directive engine: statement dispatch, symbol definitions,
//! conditional assembly, and expression parsing.
//!
//! Statements are parsed by recursive descent over the token stream. The
//! one ambiguity is a statement-leading identifier, which can open a label
//! definition, a symbol definition, or a macro invocation; it is resolved
//! with a one-token lookahead and a lexer rewind when the raw argument
//! capture has to restart from just after the name.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::asm::context::ForVar;
use crate::asm::expr::{warn_truncation, Expr};
use crate::asm::lexer::{CaptureKind, Keyword, SkipStop, Tok, Token};
use crate::asm::section::SectionSpec;
use crate::asm::symbol::{version_component, SymKind};
use crate::asm::Assembler;
use crate::common::{AssertKind, PatchKind, SectionKind, SectionModifier};
use crate::diag::{Fatal, Warning};
use crate::rpn::{BinOp, RpnOp, UnOp};

/// One open IF/ELIF/ELSE level whose taken branch is being assembled.
#[derive(Debug)]
pub(crate) struct IfLevel {
    saw_else: bool,
}

impl Assembler {
    // ---- token plumbing --------------------------------------------------

    pub(crate) fn next(&mut self) -> Result<Token, Fatal> {
        self.lexer.next_token(&self.symbols, &mut self.diag)
    }

    pub(crate) fn peek_tok(&mut self) -> Result<Tok, Fatal> {
        Ok(self
            .lexer
            .peek_token(&self.symbols, &mut self.diag)?
            .tok
            .clone())
    }

    /// Consume the next token if it matches.
    pub(crate) fn eat(&mut self, want: Tok) -> Result<bool, Fatal> {
        if self.peek_tok()? == want {
            self.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Consume the next token, reporting a diagnostic if it differs.
    pub(crate) fn expect(&mut self, want: Tok) -> Result<bool, Fatal> {
        let got = self.peek_tok()?;
        if got == want {
            self.next()?;
            return Ok(true);
        }
        self.err_here(format!(
            "expected {}, found {}",
            want.describe(),
            got.describe()
        ));
        Ok(false)
    }

    /// The statement must end here.
    pub(crate) fn expect_newline(&mut self) -> Result<(), Fatal> {
        match self.peek_tok()? {
            Tok::Newline | Tok::Eof => {
                self.next()?;
                Ok(())
            }
            other => {
                self.err_here(format!("trailing {} after statement", other.describe()));
                self.recover()
            }
        }
    }

    /// Discard tokens through the end of the line.
    pub(crate) fn recover(&mut self) -> Result<(), Fatal> {
        loop {
            match self.next()?.tok {
                Tok::Newline | Tok::Eof => return Ok(()),
                _ => {}
            }
        }
    }

    pub(crate) fn err_here(&mut self, message: impl std::fmt::Display) {
        self.diag.error(self.lexer.ctx.location(), message);
    }

    pub(crate) fn warn_here(&mut self, warning: Warning, message: impl std::fmt::Display) {
        self.diag
            .warning(warning, self.lexer.ctx.location(), message);
    }

    /// Read one identifier with EQUS expansion off, as definition sites do.
    fn capture_name(&mut self) -> Result<Option<String>, Fatal> {
        self.lexer.expand_idents = false;
        let token = self.next();
        self.lexer.expand_idents = true;
        match token?.tok {
            Tok::Ident(name) | Tok::LocalIdent(name) => Ok(Some(name)),
            other => {
                self.err_here(format!("expected a symbol name, found {}", other.describe()));
                Ok(None)
            }
        }
    }

    // ---- the statement loop ----------------------------------------------

    pub(crate) fn run(&mut self) -> Result<(), Fatal> {
        loop {
            self.sync_for_var();
            let token = self.next()?;
            match token.tok {
                Tok::Eof => break,
                Tok::Newline => {}
                Tok::Ident(name) => self.ident_statement(name)?,
                Tok::LocalIdent(name) => self.local_label(name)?,
                Tok::Colon => self.define_anon_label(),
                Tok::Kw(kw) => self.keyword_statement(kw)?,
                other => {
                    self.err_here(format!("unexpected {}", other.describe()));
                    self.recover()?;
                }
            }
        }
        if !self.ifs.is_empty() {
            self.err_here("IF block has no ENDC at end of input");
        }
        if let Err(error) = self.sections.check_closed() {
            self.err_here(error);
        }
        Ok(())
    }

    /// Re-sync the FOR loop variable when a new iteration has started.
    fn sync_for_var(&mut self) {
        let Some((name, value, unique)) = self.lexer.ctx.for_binding() else {
            return;
        };
        if self.for_unique == Some(unique) {
            return;
        }
        self.for_unique = Some(unique);
        let name = name.to_owned();
        let loc = self.lexer.ctx.loc();
        if let Err(error) = self
            .symbols
            .define(&name, SymKind::Var(value), false, false, loc)
        {
            self.err_here(error);
        }
    }

    /// A statement-leading identifier: label, definition, or macro call.
    fn ident_statement(&mut self, name: String) -> Result<(), Fatal> {
        let checkpoint = self.lexer.checkpoint();
        let token = self.next()?;
        match token.tok {
            Tok::Colon => self.define_label(&name, false),
            Tok::DoubleColon => self.define_label(&name, true),
            Tok::Kw(Keyword::Equ) => {
                self.warn_here(Warning::Obsolete, "prefer `DEF name EQU ...`");
                self.define_numeric(&name, false, false)?;
            }
            Tok::Kw(Keyword::Equs) => {
                self.warn_here(Warning::Obsolete, "prefer `DEF name EQUS ...`");
                self.define_string(&name, false)?;
            }
            Tok::Assign => {
                self.warn_here(Warning::Obsolete, "prefer `DEF name = ...`");
                self.define_numeric(&name, true, false)?;
            }
            Tok::Kw(kw @ (Keyword::Rb | Keyword::Rw | Keyword::Rl)) => {
                self.define_rs(&name, kw)?;
            }
            Tok::Newline | Tok::Eof => {
                // A bare name: a macro invocation without arguments.
                self.invoke_macro(&name, Vec::new())?;
            }
            _ => {
                if !self.lexer.rewind(checkpoint) {
                    self.err_here(format!("cannot parse statement after `{}`", name));
                    return self.recover();
                }
                let args = self.lexer.read_raw_args(&self.symbols, &mut self.diag)?;
                self.invoke_macro(&name, args)?;
            }
        }
        Ok(())
    }

    fn invoke_macro(&mut self, name: &str, args: Vec<Rc<str>>) -> Result<(), Fatal> {
        match self.symbols.get(name).map(|(_, s)| s.kind.clone()) {
            Some(SymKind::Macro { body, line }) => {
                if let Err(error) =
                    self.lexer
                        .ctx
                        .push_macro(name.to_owned(), body, line + 1, args)
                {
                    return Err(Fatal::new(error));
                }
                Ok(())
            }
            Some(_) => {
                self.err_here(format!(
                    "`{}` is not a macro; to define a label, write `{}:`",
                    name, name
                ));
                Ok(())
            }
            None => {
                self.err_here(format!("`{}` is neither a macro nor a directive", name));
                Ok(())
            }
        }
    }

    fn define_label(&mut self, name: &str, exported: bool) {
        let full = match self.symbols.full_name(name) {
            Ok(full) => full,
            Err(error) => {
                self.err_here(error);
                return;
            }
        };
        let (section, offset) = match self.sections.label_home() {
            Ok(home) => home,
            Err(error) => {
                self.err_here(format!("cannot define `{}`: {}", full, error));
                return;
            }
        };
        let loc = self.lexer.ctx.loc();
        if let Err(error) = self
            .symbols
            .define_label(&full, section, offset, exported, loc)
        {
            self.err_here(error);
        }
    }

    fn local_label(&mut self, name: String) -> Result<(), Fatal> {
        // The trailing colon is optional for scoped labels.
        let exported = match self.peek_tok()? {
            Tok::Colon => {
                self.next()?;
                false
            }
            Tok::DoubleColon => {
                self.next()?;
                true
            }
            _ => false,
        };
        self.define_label(&name, exported);
        Ok(())
    }

    fn define_anon_label(&mut self) {
        let (section, offset) = match self.sections.label_home() {
            Ok(home) => home,
            Err(error) => {
                self.err_here(format!("cannot define anonymous label: {}", error));
                return;
            }
        };
        let loc = self.lexer.ctx.loc();
        if let Err(error) = self.symbols.define_anon(section, offset, loc) {
            self.err_here(error);
        }
    }

    fn define_numeric(&mut self, name: &str, variable: bool, redef: bool) -> Result<(), Fatal> {
        let value = self.const_expr("symbol value")?;
        let kind = if variable {
            SymKind::Var(value)
        } else {
            SymKind::Equ(value)
        };
        let loc = self.lexer.ctx.loc();
        if let Err(error) = self.symbols.define(name, kind, false, redef, loc) {
            self.err_here(error);
        }
        Ok(())
    }

    fn define_string(&mut self, name: &str, redef: bool) -> Result<(), Fatal> {
        let text = self.parse_string()?;
        let loc = self.lexer.ctx.loc();
        if let Err(error) = self
            .symbols
            .define(name, SymKind::Equs(text.into()), false, redef, loc)
        {
            self.err_here(error);
        }
        Ok(())
    }

    /// `name RB/RW/RL count`: allocate from the running `_RS` offset.
    fn define_rs(&mut self, name: &str, kw: Keyword) -> Result<(), Fatal> {
        let width: i32 = match kw {
            Keyword::Rb => 1,
            Keyword::Rw => 2,
            _ => 4,
        };
        let count = match self.peek_tok()? {
            Tok::Newline | Tok::Eof => 1,
            _ => self.const_expr("RS count")?,
        };
        let loc = self.lexer.ctx.loc();
        if let Err(error) = self
            .symbols
            .define(name, SymKind::Equ(self.rs_counter), false, false, loc)
        {
            self.err_here(error);
        }
        self.rs_counter = self.rs_counter.wrapping_add(width.wrapping_mul(count));
        Ok(())
    }

    // ---- keyword statements ----------------------------------------------

    fn keyword_statement(&mut self, kw: Keyword) -> Result<(), Fatal> {
        use Keyword::*;
        match kw {
            Include => self.dir_include(),
            Incbin => self.dir_incbin(),
            If => self.dir_if(),
            Elif | Else => self.dir_elif_else(kw),
            Endc => {
                if self.ifs.pop().is_none() {
                    self.err_here("ENDC outside an IF block");
                }
                Ok(())
            }
            Rept => self.dir_rept(),
            For => self.dir_for(),
            Break => self.dir_break(),
            Endr => {
                self.err_here("ENDR outside a REPT/FOR block");
                Ok(())
            }
            Macro => self.dir_macro(),
            Endm => {
                self.err_here("ENDM outside a macro definition");
                Ok(())
            }
            Shift => self.dir_shift(),
            Def => self.dir_def(false),
            Redef => self.dir_def(true),
            Export => self.dir_export(),
            Purge => self.dir_purge(),
            Section => self.dir_section(),
            Pushs => {
                self.sections.push();
                Ok(())
            }
            Pops => {
                if let Err(error) = self.sections.pop() {
                    self.err_here(error);
                }
                Ok(())
            }
            Load => self.dir_load(),
            Endl => {
                if let Err(error) = self.sections.end_load() {
                    self.err_here(error);
                }
                Ok(())
            }
            Union => {
                if let Err(error) = self.sections.begin_union() {
                    self.err_here(error);
                }
                Ok(())
            }
            Nextu => {
                if let Err(error) = self.sections.next_union() {
                    self.err_here(error);
                }
                Ok(())
            }
            Endu => {
                if let Err(error) = self.sections.end_union() {
                    self.err_here(error);
                }
                Ok(())
            }
            Align => self.dir_align(),
            Ds => self.dir_ds(),
            Db => self.dir_data(PatchKind::Byte),
            Dw => self.dir_data(PatchKind::Word),
            Dl => self.dir_data(PatchKind::Long),
            Rsreset => {
                self.rs_counter = 0;
                Ok(())
            }
            Rsset => {
                self.rs_counter = self.const_expr("RS offset")?;
                Ok(())
            }
            Rb | Rw => {
                self.err_here("RB/RW need a symbol name in front");
                self.recover()
            }
            Charmap => self.dir_charmap(),
            Newcharmap => self.dir_newcharmap(),
            Setcharmap => {
                if let Some(name) = self.capture_name()? {
                    if let Err(error) = self.charmaps.set_active(&name) {
                        self.err_here(error);
                    }
                }
                Ok(())
            }
            Pushc => {
                self.charmaps.push();
                Ok(())
            }
            Popc => {
                if let Err(error) = self.charmaps.pop() {
                    self.err_here(error);
                }
                Ok(())
            }
            Opt => self.dir_opt(),
            Pusho => {
                self.opt_stack.push((self.lexer.opts, self.runtime));
                Ok(())
            }
            Popo => {
                match self.opt_stack.pop() {
                    Some((lex, runtime)) => {
                        self.lexer.opts = lex;
                        self.runtime = runtime;
                    }
                    None => self.err_here("no entries in the option stack"),
                }
                Ok(())
            }
            Println => self.dir_println(),
            Assert => self.dir_assert(false),
            StaticAssert => self.dir_assert(true),
            Fail => {
                let message = self.parse_string()?;
                self.err_here(message);
                Ok(())
            }
            Warn => {
                let message = self.parse_string()?;
                self.warn_here(Warning::User, message);
                Ok(())
            }
            // Anything else in statement position is an instruction, or a
            // keyword that cannot start a statement.
            _ => self.instruction(kw),
        }
    }

    // ---- file inclusion --------------------------------------------------

    fn find_file(&self, name: &str) -> Option<PathBuf> {
        let direct = PathBuf::from(name);
        if direct.exists() {
            return Some(direct);
        }
        if name.starts_with("./") || name.starts_with("../") || Path::new(name).is_absolute() {
            return None;
        }
        self.opts
            .include_paths
            .iter()
            .map(|dir| dir.join(name))
            .find(|p| p.exists())
    }

    fn dir_include(&mut self) -> Result<(), Fatal> {
        let name = self.parse_string()?;
        self.expect_newline()?;
        let path = self
            .find_file(&name)
            .ok_or_else(|| Fatal::new(format!("cannot find `{}` to include", name)))?;
        let text = std::fs::read_to_string(&path)
            .map_err(|e| Fatal::new(format!("cannot read `{}`: {}", path.display(), e)))?;
        self.deps.push(path.clone());
        self.lexer
            .ctx
            .push_file(path, text.into())
            .map_err(Fatal::new)
    }

    fn dir_incbin(&mut self) -> Result<(), Fatal> {
        let name = self.parse_string()?;
        let mut offset = 0usize;
        let mut length = None;
        if self.eat(Tok::Comma)? {
            offset = self.const_expr("INCBIN offset")? as u32 as usize;
            if self.eat(Tok::Comma)? {
                length = Some(self.const_expr("INCBIN length")? as u32 as usize);
            }
        }
        let Some(path) = self.find_file(&name) else {
            return Err(Fatal::new(format!("cannot find `{}` to include", name)));
        };
        let bytes = std::fs::read(&path)
            .map_err(|e| Fatal::new(format!("cannot read `{}`: {}", path.display(), e)))?;
        self.deps.push(path);
        let end = match length {
            Some(len) => offset.saturating_add(len),
            None => bytes.len(),
        };
        if offset > bytes.len() || end > bytes.len() {
            self.err_here(format!(
                "INCBIN range {}..{} is outside `{}` ({} bytes)",
                offset,
                end,
                name,
                bytes.len()
            ));
            return Ok(());
        }
        let slice = bytes[offset..end].to_vec();
        if let Err(error) = self.sections.emit_bytes(&slice) {
            self.err_here(error);
        }
        Ok(())
    }

    // ---- conditional assembly --------------------------------------------

    fn dir_if(&mut self) -> Result<(), Fatal> {
        let taken = self.const_expr("IF condition")? != 0;
        self.expect_newline()?;
        if taken {
            self.ifs.push(IfLevel { saw_else: false });
            return Ok(());
        }
        self.skip_untaken_branches()
    }

    /// After a false IF or exhausted ELIF: find the branch to run, if any.
    fn skip_untaken_branches(&mut self) -> Result<(), Fatal> {
        loop {
            match self.lexer.skip_conditional(true) {
                Ok(SkipStop::Elif) => {
                    let taken = self.const_expr("ELIF condition")? != 0;
                    self.expect_newline()?;
                    if taken {
                        self.ifs.push(IfLevel { saw_else: false });
                        return Ok(());
                    }
                }
                Ok(SkipStop::Else) => {
                    self.expect_newline()?;
                    self.ifs.push(IfLevel { saw_else: true });
                    return Ok(());
                }
                Ok(SkipStop::Endc) => {
                    return self.expect_newline();
                }
                Err(error) => return Err(Fatal::new(error)),
            }
        }
    }

    /// ELIF/ELSE reached from inside a taken branch: skip to the ENDC.
    fn dir_elif_else(&mut self, kw: Keyword) -> Result<(), Fatal> {
        match self.ifs.last() {
            None => {
                self.err_here(format!("`{:?}` outside an IF block", kw));
                self.recover()
            }
            Some(level) if level.saw_else => Err(Fatal::new(format!(
                "`{:?}` after the ELSE of the same IF block",
                kw
            ))),
            Some(_) => {
                match self.lexer.skip_conditional(false) {
                    Ok(SkipStop::Endc) => {
                        self.ifs.pop();
                        self.expect_newline()
                    }
                    Ok(_) => unreachable!("skip stops only at ENDC here"),
                    Err(error) => Err(Fatal::new(error)),
                }
            }
        }
    }

    // ---- loops and macros ------------------------------------------------

    fn dir_rept(&mut self) -> Result<(), Fatal> {
        let count = self.const_expr("REPT count")?;
        self.expect_newline()?;
        let (body, body_line) = match self.lexer.capture_body(CaptureKind::Rept) {
            Ok(captured) => captured,
            Err(error) => return Err(Fatal::new(error)),
        };
        if count <= 0 {
            return Ok(());
        }
        let if_base = self.ifs.len();
        self.lexer
            .ctx
            .push_rept(body, body_line, count as u32, None, if_base)
            .map_err(Fatal::new)
    }

    fn dir_for(&mut self) -> Result<(), Fatal> {
        let Some(name) = self.capture_name()? else {
            return self.recover();
        };
        self.expect(Tok::Comma)?;
        let first = self.const_expr("FOR bound")?;
        let (start, stop, step) = if self.eat(Tok::Comma)? {
            let second = self.const_expr("FOR bound")?;
            if self.eat(Tok::Comma)? {
                let third = self.const_expr("FOR step")?;
                (first, second, third)
            } else {
                (first, second, 1)
            }
        } else {
            (0, first, 1)
        };
        self.expect_newline()?;
        let (body, body_line) = match self.lexer.capture_body(CaptureKind::Rept) {
            Ok(captured) => captured,
            Err(error) => return Err(Fatal::new(error)),
        };
        let count = iteration_count(start, stop, step);
        if step == 0 {
            self.err_here("FOR step cannot be zero");
        }
        let loc = self.lexer.ctx.loc();
        if let Err(error) = self
            .symbols
            .define(&name, SymKind::Var(start), false, false, loc)
        {
            self.err_here(error);
        }
        if count == 0 || step == 0 {
            return Ok(());
        }
        self.for_unique = None;
        let if_base = self.ifs.len();
        self.lexer
            .ctx
            .push_rept(
                body,
                body_line,
                count,
                Some(ForVar {
                    name,
                    value: start,
                    step,
                }),
                if_base,
            )
            .map_err(Fatal::new)
    }

    fn dir_break(&mut self) -> Result<(), Fatal> {
        self.expect_newline()?;
        let if_base = self.lexer.ctx.rept_if_base();
        if !self.lexer.ctx.break_rept() {
            self.err_here("BREAK outside a REPT/FOR block");
        } else if let Some(base) = if_base {
            // Conditionals opened inside the abandoned body die with it.
            self.ifs.truncate(base);
        }
        Ok(())
    }

    fn dir_macro(&mut self) -> Result<(), Fatal> {
        let Some(name) = self.capture_name()? else {
            return self.recover();
        };
        let line = self.lexer.ctx.loc().line;
        self.expect_newline()?;
        let (body, _) = match self.lexer.capture_body(CaptureKind::Macro) {
            Ok(captured) => captured,
            Err(error) => return Err(Fatal::new(error)),
        };
        let loc = self.lexer.ctx.loc();
        if let Err(error) = self
            .symbols
            .define(&name, SymKind::Macro { body, line }, false, false, loc)
        {
            self.err_here(error);
        }
        Ok(())
    }

    fn dir_shift(&mut self) -> Result<(), Fatal> {
        let amount = match self.peek_tok()? {
            Tok::Newline | Tok::Eof => 1,
            _ => self.const_expr("SHIFT amount")?,
        };
        let Some(frame) = self.lexer.ctx.macro_frame_mut() else {
            self.err_here("SHIFT outside a macro");
            return Ok(());
        };
        let limit = frame.args.len() as i64;
        let target = frame.shift as i64 + i64::from(amount);
        let clamped = target.clamp(0, limit);
        frame.shift = clamped as usize;
        if target != clamped {
            self.warn_here(
                Warning::ShiftAmount,
                format!("cannot shift by {} with {} arguments", amount, limit),
            );
        }
        Ok(())
    }

    // ---- symbol directives -----------------------------------------------

    fn dir_def(&mut self, redef: bool) -> Result<(), Fatal> {
        let Some(name) = self.capture_name()? else {
            return self.recover();
        };
        match self.next()?.tok {
            Tok::Kw(Keyword::Equ) => self.define_numeric(&name, false, redef),
            Tok::Kw(Keyword::Equs) => self.define_string(&name, redef),
            Tok::Assign => self.define_numeric(&name, true, redef),
            Tok::Kw(kw @ (Keyword::Rb | Keyword::Rw | Keyword::Rl)) => self.define_rs(&name, kw),
            other => {
                self.err_here(format!(
                    "expected EQU, EQUS, `=` or RB/RW/RL, found {}",
                    other.describe()
                ));
                self.recover()
            }
        }
    }

    fn dir_export(&mut self) -> Result<(), Fatal> {
        loop {
            if let Some(name) = self.capture_name()? {
                let full = match self.symbols.full_name(&name) {
                    Ok(full) => full,
                    Err(error) => {
                        self.err_here(error);
                        continue;
                    }
                };
                let loc = self.lexer.ctx.loc();
                self.symbols.export(&full, loc);
            }
            if !self.eat(Tok::Comma)? {
                return Ok(());
            }
        }
    }

    fn dir_purge(&mut self) -> Result<(), Fatal> {
        loop {
            if let Some(name) = self.capture_name()? {
                let full = match self.symbols.full_name(&name) {
                    Ok(full) => full,
                    Err(error) => {
                        self.err_here(error);
                        continue;
                    }
                };
                if self.lexer.ctx.macro_is_active(&full) {
                    self.err_here(format!("cannot purge `{}` while it is expanding", full));
                } else {
                    let exported = self
                        .symbols
                        .get(&full)
                        .map(|(_, s)| s.exported)
                        .unwrap_or(false);
                    if exported {
                        self.warn_here(
                            Warning::Purge,
                            format!("purging exported symbol `{}`", full),
                        );
                    }
                    if let Err(error) = self.symbols.purge(&full) {
                        self.err_here(error);
                    }
                }
            }
            if !self.eat(Tok::Comma)? {
                return Ok(());
            }
        }
    }

    // ---- sections ---------------------------------------------------------

    fn section_kind(&mut self) -> Result<Option<SectionKind>, Fatal> {
        let kind = match self.peek_tok()? {
            Tok::Kw(Keyword::Rom0) => SectionKind::Rom0,
            Tok::Kw(Keyword::Romx) => SectionKind::Romx,
            Tok::Kw(Keyword::Vram) => SectionKind::Vram,
            Tok::Kw(Keyword::Sram) => SectionKind::Sram,
            Tok::Kw(Keyword::Wram0) => SectionKind::Wram0,
            Tok::Kw(Keyword::Wramx) => SectionKind::Wramx,
            Tok::Kw(Keyword::Oam) => SectionKind::Oam,
            Tok::Kw(Keyword::Hram) => SectionKind::Hram,
            other => {
                self.err_here(format!(
                    "expected a section type, found {}",
                    other.describe()
                ));
                return Ok(None);
            }
        };
        self.next()?;
        Ok(Some(kind))
    }

    /// `[UNION|FRAGMENT] "name", KIND[org][, BANK[n]][, ALIGN[n, ofs]]`
    fn section_arguments(&mut self) -> Result<Option<(String, SectionSpec)>, Fatal> {
        let modifier = if self.eat(Tok::Kw(Keyword::Union))? {
            SectionModifier::Union
        } else if self.eat(Tok::Kw(Keyword::Fragment))? {
            SectionModifier::Fragment
        } else {
            SectionModifier::Normal
        };
        let name = self.parse_string()?;
        self.expect(Tok::Comma)?;
        let Some(kind) = self.section_kind()? else {
            self.recover()?;
            return Ok(None);
        };
        let mut spec = SectionSpec {
            kind,
            modifier,
            org: None,
            bank: None,
            align_log2: 0,
            align_ofs: 0,
        };
        if self.eat(Tok::LBracket)? {
            let org = self.const_expr("section address")?;
            self.expect(Tok::RBracket)?;
            if !(0..=0xFFFF).contains(&org) {
                self.err_here(format!("${:X} is not a 16-bit address", org));
            } else {
                spec.org = Some(org as u16);
            }
        }
        while self.eat(Tok::Comma)? {
            match self.peek_tok()? {
                Tok::Kw(Keyword::Bank) => {
                    self.next()?;
                    self.expect(Tok::LBracket)?;
                    spec.bank = Some(self.const_expr("bank number")? as u32);
                    self.expect(Tok::RBracket)?;
                }
                Tok::Kw(Keyword::Align) => {
                    self.next()?;
                    self.expect(Tok::LBracket)?;
                    let log2 = self.const_expr("alignment")?;
                    if self.eat(Tok::Comma)? {
                        spec.align_ofs = self.const_expr("alignment offset")? as u16;
                    }
                    self.expect(Tok::RBracket)?;
                    if (0..=16).contains(&log2) {
                        spec.align_log2 = log2 as u8;
                    } else {
                        self.err_here(format!("alignment 2^{} is out of range", log2));
                    }
                }
                other => {
                    self.err_here(format!(
                        "expected BANK or ALIGN, found {}",
                        other.describe()
                    ));
                    self.recover()?;
                    return Ok(None);
                }
            }
        }
        Ok(Some((name, spec)))
    }

    fn dir_section(&mut self) -> Result<(), Fatal> {
        if let Some((name, spec)) = self.section_arguments()? {
            if let Err(error) = self.sections.begin(&name, spec) {
                self.err_here(error);
            }
        }
        Ok(())
    }

    fn dir_load(&mut self) -> Result<(), Fatal> {
        if let Some((name, spec)) = self.section_arguments()? {
            if let Err(error) = self.sections.begin_load(&name, spec) {
                self.err_here(error);
            }
        }
        Ok(())
    }

    fn dir_align(&mut self) -> Result<(), Fatal> {
        let log2 = self.const_expr("alignment")?;
        let offset = if self.eat(Tok::Comma)? {
            self.const_expr("alignment offset")?
        } else {
            0
        };
        if !(0..=16).contains(&log2) {
            self.err_here(format!("alignment 2^{} is out of range", log2));
            return Ok(());
        }
        let pad = self.runtime.pad;
        if let Err(error) = self.sections.align(log2 as u8, offset as u16, pad) {
            self.err_here(error);
        }
        Ok(())
    }

    fn dir_ds(&mut self) -> Result<(), Fatal> {
        let count = self.const_expr("DS size")?;
        if count < 0 {
            self.err_here(format!("cannot reserve {} bytes", count));
            return Ok(());
        }
        let mut fill = Vec::new();
        while self.eat(Tok::Comma)? {
            let value = self.const_expr("DS fill byte")?;
            let loc = self.lexer.ctx.location();
            warn_truncation(value, 8, &mut self.diag, &loc, "fill byte");
            fill.push(value as u8);
        }
        let pad = self.runtime.pad;
        if let Err(error) = self.sections.reserve(count as u32, &fill, pad) {
            self.err_here(error);
        }
        Ok(())
    }

    /// DB/DW/DL: expressions and (for DB) charmap-encoded strings.
    fn dir_data(&mut self, kind: PatchKind) -> Result<(), Fatal> {
        if matches!(self.peek_tok()?, Tok::Newline | Tok::Eof) {
            // Data directives with no arguments reserve one unit.
            let pad = self.runtime.pad;
            if let Err(error) = self.sections.reserve(kind.width() as u32, &[], pad) {
                self.err_here(error);
            }
            return Ok(());
        }
        loop {
            if kind == PatchKind::Byte && self.peek_is_string()? {
                let text = self.parse_string()?;
                if text.len() > 255 {
                    self.warn_here(
                        Warning::LongString,
                        format!("string of {} bytes in DB", text.len()),
                    );
                }
                let mut bytes = Vec::new();
                if let Err(ch) = self.charmaps.active().encode(&text, &mut bytes) {
                    self.err_here(format!("no charmap entry for `{}`", ch.escape_default()));
                }
                if let Err(error) = self.sections.emit_bytes(&bytes) {
                    self.err_here(error);
                }
            } else {
                let value = self.expr()?;
                self.emit_expr_width(kind, value);
            }
            if !self.eat(Tok::Comma)? {
                return Ok(());
            }
        }
    }

    // ---- charmaps ----------------------------------------------------------

    fn dir_charmap(&mut self) -> Result<(), Fatal> {
        let from = self.parse_string()?;
        if from.is_empty() {
            self.err_here("cannot map an empty string");
        }
        let mut to = Vec::new();
        while self.eat(Tok::Comma)? {
            let value = self.const_expr("charmap byte")?;
            let loc = self.lexer.ctx.location();
            warn_truncation(value, 8, &mut self.diag, &loc, "charmap byte");
            to.push(value as u8);
        }
        if to.is_empty() {
            self.err_here("CHARMAP needs at least one output byte");
            return Ok(());
        }
        if !from.is_empty() && !self.charmaps.active_mut().add(&from, to) {
            self.warn_here(
                Warning::BuiltinArg,
                format!("charmap entry for `{}` replaced", from.escape_default()),
            );
        }
        Ok(())
    }

    fn dir_newcharmap(&mut self) -> Result<(), Fatal> {
        let Some(name) = self.capture_name()? else {
            return self.recover();
        };
        let base = if self.eat(Tok::Comma)? {
            self.capture_name()?
        } else {
            None
        };
        if let Err(error) = self.charmaps.create(&name, base.as_deref()) {
            self.err_here(error);
        }
        Ok(())
    }

    // ---- options ----------------------------------------------------------

    fn dir_opt(&mut self) -> Result<(), Fatal> {
        let items = self.lexer.read_raw_args(&self.symbols, &mut self.diag)?;
        for item in items {
            self.apply_opt(&item);
        }
        Ok(())
    }

    fn apply_opt(&mut self, item: &str) {
        if let Some(rest) = item.strip_prefix('!') {
            if rest == "l" {
                self.runtime.optimize_loads = false;
            } else {
                self.err_here(format!("cannot negate option `{}`", rest));
            }
            return;
        }
        let mut chars = item.chars();
        match chars.next() {
            Some('b') => {
                let digits: Vec<char> = chars.collect();
                if digits.len() == 2 {
                    self.lexer.opts.binary_digits = [digits[0], digits[1]];
                } else {
                    self.err_here("option `b` needs exactly two characters");
                }
            }
            Some('g') => {
                let digits: Vec<char> = chars.collect();
                if digits.len() == 4 {
                    self.lexer.opts.gfx_digits = [digits[0], digits[1], digits[2], digits[3]];
                } else {
                    self.err_here("option `g` needs exactly four characters");
                }
            }
            Some('p') => match parse_number(chars.as_str()) {
                Some(value) if value <= 0xFF => self.runtime.pad = value as u8,
                _ => self.err_here("option `p` needs a byte value"),
            },
            Some('Q') => match parse_number(chars.as_str().trim_start_matches('.')) {
                Some(q @ 1..=31) => self.lexer.opts.fix_precision = q as u8,
                _ => self.err_here("option `Q` needs a precision between 1 and 31"),
            },
            Some('l') if chars.as_str().is_empty() => {
                self.runtime.optimize_loads = true;
            }
            _ => self.err_here(format!("unknown option `{}`", item)),
        }
    }

    // ---- output and assertions ---------------------------------------------

    fn dir_println(&mut self) -> Result<(), Fatal> {
        let mut out = String::new();
        if !matches!(self.peek_tok()?, Tok::Newline | Tok::Eof) {
            loop {
                if self.peek_is_string()? {
                    out.push_str(&self.parse_string()?);
                } else {
                    let value = self.const_expr("PRINTLN value")?;
                    out.push_str(&format!("${:X}", value));
                }
                if !self.eat(Tok::Comma)? {
                    break;
                }
            }
        }
        println!("{}", out);
        Ok(())
    }

    fn dir_assert(&mut self, static_only: bool) -> Result<(), Fatal> {
        let kind = match self.peek_tok()? {
            Tok::Kw(Keyword::Warn) => {
                self.next()?;
                self.expect(Tok::Comma)?;
                AssertKind::Warn
            }
            Tok::Kw(Keyword::Fail) => {
                self.next()?;
                self.expect(Tok::Comma)?;
                AssertKind::Error
            }
            Tok::Kw(Keyword::Fatal) => {
                self.next()?;
                self.expect(Tok::Comma)?;
                AssertKind::Fatal
            }
            _ => AssertKind::Error,
        };
        let condition = self.expr()?;
        let message = if self.eat(Tok::Comma)? {
            self.parse_string()?
        } else {
            String::new()
        };
        if let Some(error) = &condition.error {
            let error = error.clone();
            self.err_here(error);
            return Ok(());
        }
        if condition.is_known() {
            if condition.value() == 0 {
                let text = if message.is_empty() {
                    String::from("assertion failed")
                } else {
                    format!("assertion failed: {}", message)
                };
                match kind {
                    AssertKind::Warn => self.warn_here(Warning::Assert, text),
                    AssertKind::Error => self.err_here(text),
                    AssertKind::Fatal => {
                        return Err(Fatal::new(format!(
                            "{}: {}",
                            self.lexer.ctx.location(),
                            text
                        )))
                    }
                }
            }
            return Ok(());
        }
        if static_only {
            self.err_here("STATIC_ASSERT needs a constant condition");
            return Ok(());
        }
        for &id in &condition.refs {
            self.symbols.mark_referenced(id);
        }
        let (pc_section, pc_offset) = match self.sections.pc() {
            Ok((section, offset)) => (section as i32, offset),
            Err(_) => (crate::obj::SECTION_NONE, 0),
        };
        let loc = self.lexer.ctx.loc();
        self.assertions.push(crate::asm::PendingAssert {
            loc,
            pc_section,
            pc_offset,
            kind,
            ops: condition.into_ops(),
            message,
        });
        Ok(())
    }

    // ---- emission helpers --------------------------------------------------

    pub(crate) fn emit8(&mut self, byte: u8) {
        if let Err(error) = self.sections.emit_byte(byte) {
            self.err_here(error);
        }
    }

    pub(crate) fn emit_expr_width(&mut self, kind: PatchKind, expr: Expr) {
        for &id in &expr.refs {
            self.symbols.mark_referenced(id);
        }
        if let Err(error) = self
            .sections
            .emit_expr(kind, expr, &self.lexer.ctx, &mut self.diag)
        {
            self.err_here(error);
        }
    }

    pub(crate) fn emit_expr8(&mut self, expr: Expr) {
        self.emit_expr_width(PatchKind::Byte, expr);
    }

    pub(crate) fn emit_expr16(&mut self, expr: Expr) {
        self.emit_expr_width(PatchKind::Word, expr);
    }

    pub(crate) fn emit_jr(&mut self, expr: Expr) {
        self.emit_expr_width(PatchKind::Jr, expr);
    }

    /// The `ldh` operand: reduced to its low byte now when constant, or
    /// tagged for the link-time HRAM check.
    pub(crate) fn emit_hram(&mut self, expr: Expr) {
        if expr.is_known() {
            let value = expr.value();
            let full = value | 0xFF00;
            if !(0xFF00..=0xFFFE).contains(&full) || (value & !0xFFFF) != 0 {
                self.err_here(format!("${:04X} is not an HRAM address", value));
                self.emit8(0);
                return;
            }
            self.emit8((full & 0xFF) as u8);
            return;
        }
        let tagged = expr.with_check(RpnOp::HramCheck);
        self.emit_expr_width(PatchKind::Byte, tagged);
    }

    // ---- expressions -------------------------------------------------------

    pub(crate) fn const_expr(&mut self, what: &str) -> Result<i32, Fatal> {
        let expr = self.expr()?;
        match expr.get_const(what) {
            Ok(value) => Ok(value),
            Err(error) => {
                self.err_here(error);
                Ok(0)
            }
        }
    }

    pub(crate) fn expr(&mut self) -> Result<Expr, Fatal> {
        self.expr_logical_or()
    }

    fn expr_logical_or(&mut self) -> Result<Expr, Fatal> {
        let mut lhs = self.expr_logical_and()?;
        while self.eat(Tok::PipePipe)? {
            let rhs = self.expr_logical_and()?;
            lhs = Expr::binary(BinOp::LogOr, lhs, rhs);
        }
        Ok(lhs)
    }

    fn expr_logical_and(&mut self) -> Result<Expr, Fatal> {
        let mut lhs = self.expr_compare()?;
        while self.eat(Tok::AmpAmp)? {
            let rhs = self.expr_compare()?;
            lhs = Expr::binary(BinOp::LogAnd, lhs, rhs);
        }
        Ok(lhs)
    }

    fn expr_compare(&mut self) -> Result<Expr, Fatal> {
        let mut lhs = self.expr_add()?;
        loop {
            let op = match self.peek_tok()? {
                Tok::EqEq => BinOp::LogEq,
                Tok::Neq => BinOp::LogNe,
                Tok::Lt => BinOp::LogLt,
                Tok::Gt => BinOp::LogGt,
                Tok::Le => BinOp::LogLe,
                Tok::Ge => BinOp::LogGe,
                _ => return Ok(lhs),
            };
            self.next()?;
            let rhs = self.expr_add()?;
            lhs = Expr::binary(op, lhs, rhs);
        }
    }

    fn expr_add(&mut self) -> Result<Expr, Fatal> {
        let mut lhs = self.expr_bits()?;
        loop {
            let op = match self.peek_tok()? {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.next()?;
            let rhs = self.expr_bits()?;
            lhs = Expr::binary(op, lhs, rhs);
        }
    }

    fn expr_bits(&mut self) -> Result<Expr, Fatal> {
        let mut lhs = self.expr_shift()?;
        loop {
            let op = match self.peek_tok()? {
                Tok::Amp => BinOp::And,
                Tok::Pipe => BinOp::Or,
                Tok::Caret => BinOp::Xor,
                _ => return Ok(lhs),
            };
            self.next()?;
            let rhs = self.expr_shift()?;
            lhs = Expr::binary(op, lhs, rhs);
        }
    }

    fn expr_shift(&mut self) -> Result<Expr, Fatal> {
        let mut lhs = self.expr_mul()?;
        loop {
            let op = match self.peek_tok()? {
                Tok::Shl => BinOp::Shl,
                Tok::Shr => BinOp::Shr,
                Tok::Ushr => BinOp::Ushr,
                _ => return Ok(lhs),
            };
            self.next()?;
            let rhs = self.expr_mul()?;
            if rhs.is_known() && !(0..32).contains(&rhs.value()) {
                self.warn_here(
                    Warning::ShiftAmount,
                    format!("shifting by {}", rhs.value()),
                );
            }
            lhs = Expr::binary(op, lhs, rhs);
        }
    }

    fn expr_mul(&mut self) -> Result<Expr, Fatal> {
        let mut lhs = self.expr_unary()?;
        loop {
            let op = match self.peek_tok()? {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                Tok::Percent => BinOp::Mod,
                _ => return Ok(lhs),
            };
            self.next()?;
            let rhs = self.expr_unary()?;
            if op == BinOp::Div
                && lhs.is_known()
                && rhs.is_known()
                && lhs.value() == i32::MIN
                && rhs.value() == -1
            {
                self.warn_here(Warning::Div, "dividing the minimum value by -1 overflows");
            }
            lhs = Expr::binary(op, lhs, rhs);
        }
    }

    fn expr_unary(&mut self) -> Result<Expr, Fatal> {
        let op = match self.peek_tok()? {
            Tok::Minus => Some(UnOp::Neg),
            Tok::Tilde => Some(UnOp::Not),
            Tok::Bang => Some(UnOp::LogNot),
            Tok::Plus => {
                self.next()?;
                return self.expr_unary();
            }
            _ => None,
        };
        if let Some(op) = op {
            self.next()?;
            let inner = self.expr_unary()?;
            return Ok(Expr::unary(op, inner));
        }
        self.expr_power()
    }

    fn expr_power(&mut self) -> Result<Expr, Fatal> {
        let lhs = self.expr_primary()?;
        if self.eat(Tok::Exp)? {
            let rhs = self.expr_unary()?;
            return Ok(Expr::binary(BinOp::Exp, lhs, rhs));
        }
        Ok(lhs)
    }

    fn expr_primary(&mut self) -> Result<Expr, Fatal> {
        let token = self.next()?;
        match token.tok {
            Tok::Number(value) => Ok(Expr::konst(value as i32)),
            Tok::Str(text) => Ok(self.string_to_number(&text)),
            Tok::LParen => {
                let inner = self.expr()?;
                self.expect(Tok::RParen)?;
                Ok(inner)
            }
            Tok::Ident(name) => Ok(self.symbol_expr(&name)),
            Tok::LocalIdent(name) => Ok(self.scoped_symbol_expr(&name)),
            Tok::AnonRef(delta) => Ok(self.anon_expr(delta)),
            Tok::Kw(kw) => self.function_expr(kw),
            other => {
                self.err_here(format!("expected an expression, found {}", other.describe()));
                Ok(Expr::konst(0))
            }
        }
    }

    /// A string used where a number is expected: its charmap encoding read
    /// big-endian.
    fn string_to_number(&mut self, text: &str) -> Expr {
        let mut bytes = Vec::new();
        if let Err(ch) = self.charmaps.active().encode(text, &mut bytes) {
            self.err_here(format!("no charmap entry for `{}`", ch.escape_default()));
            return Expr::konst(0);
        }
        match bytes.len() {
            2..=4 => self.warn_here(
                Warning::NumericString1,
                format!("multi-character string \"{}\" used as a number", text),
            ),
            5.. => self.warn_here(
                Warning::NumericString2,
                format!("oversized string \"{}\" used as a number", text),
            ),
            _ => {}
        }
        let value = bytes
            .iter()
            .fold(0u32, |acc, &b| (acc << 8).wrapping_add(u32::from(b)));
        Expr::konst(value as i32)
    }

    fn pc_expr(&mut self) -> Expr {
        match self.sections.pc() {
            Ok((section, offset)) => {
                if let Some(org) = self.sections.get(section).org {
                    return Expr::konst(i32::from(org).wrapping_add(offset as i32));
                }
                let loc = self.lexer.ctx.loc();
                let id = self.symbols.insert_pc(section, offset, loc);
                Expr::sym(id)
            }
            Err(error) => {
                self.err_here(error);
                Expr::konst(0)
            }
        }
    }

    fn symbol_expr(&mut self, name: &str) -> Expr {
        match name {
            "@" => return self.pc_expr(),
            "_NARG" => {
                return match self.lexer.ctx.macro_frame() {
                    Some(frame) => {
                        Expr::konst((frame.args.len() - frame.shift.min(frame.args.len())) as i32)
                    }
                    None => {
                        self.err_here("_NARG is only defined inside a macro");
                        Expr::konst(0)
                    }
                };
            }
            "_RS" => return Expr::konst(self.rs_counter),
            "__LINE__" => return Expr::konst(self.lexer.ctx.loc().line as i32),
            "__RGBDS_MAJOR__" => return Expr::konst(version_component("major")),
            "__RGBDS_MINOR__" => return Expr::konst(version_component("minor")),
            "__RGBDS_PATCH__" => return Expr::konst(version_component("patch")),
            _ => {}
        }
        self.named_symbol_expr(name)
    }

    fn scoped_symbol_expr(&mut self, name: &str) -> Expr {
        match self.symbols.full_name(name) {
            Ok(full) => self.named_symbol_expr(&full),
            Err(error) => {
                self.err_here(error);
                Expr::konst(0)
            }
        }
    }

    fn named_symbol_expr(&mut self, name: &str) -> Expr {
        if let Some((id, symbol)) = self.symbols.get(name) {
            match &symbol.kind {
                SymKind::Equ(value) | SymKind::Var(value) => return Expr::konst(*value),
                SymKind::Label { section, offset } => {
                    let (section, offset) = (*section, *offset);
                    if let Some(org) = self.sections.get(section).org {
                        return Expr::konst(i32::from(org).wrapping_add(offset as i32));
                    }
                    return Expr::sym(id);
                }
                SymKind::Ref => return Expr::sym(id),
                SymKind::Equs(_) => {
                    self.err_here(format!("`{}` is a string constant", name));
                    return Expr::konst(0);
                }
                SymKind::Macro { .. } => {
                    self.err_here(format!("`{}` is a macro", name));
                    return Expr::konst(0);
                }
                SymKind::Builtin => {
                    self.err_here(format!("`{}` is not usable here", name));
                    return Expr::konst(0);
                }
            }
        }
        let loc = self.lexer.ctx.loc();
        let id = self.symbols.reference(name, loc);
        Expr::sym(id)
    }

    fn anon_expr(&mut self, delta: i32) -> Expr {
        match self.symbols.anon_name(delta) {
            Ok(name) => self.named_symbol_expr(&name),
            Err(error) => {
                self.err_here(error);
                Expr::konst(0)
            }
        }
    }

    // ---- built-in functions ------------------------------------------------

    fn function_expr(&mut self, kw: Keyword) -> Result<Expr, Fatal> {
        use Keyword::*;
        match kw {
            High => {
                let inner = self.paren_expr()?;
                let shifted = Expr::binary(BinOp::Shr, inner, Expr::konst(8));
                Ok(Expr::binary(BinOp::And, shifted, Expr::konst(0xFF)))
            }
            Low => {
                let inner = self.paren_expr()?;
                Ok(Expr::binary(BinOp::And, inner, Expr::konst(0xFF)))
            }
            Isconst => {
                let inner = self.paren_expr()?;
                Ok(Expr::konst(inner.is_known() as i32))
            }
            Def => {
                self.expect(Tok::LParen)?;
                let name = self.capture_name()?;
                self.expect(Tok::RParen)?;
                let defined = match name {
                    Some(name) => match self.symbols.full_name(&name) {
                        Ok(full) => self.symbols.get(&full).is_some(),
                        Err(_) => false,
                    },
                    None => false,
                };
                Ok(Expr::konst(defined as i32))
            }
            Bank => self.bank_expr(),
            Sizeof => {
                self.expect(Tok::LParen)?;
                let name = self.parse_string()?;
                self.expect(Tok::RParen)?;
                Ok(Expr::from_ops(vec![RpnOp::SizeofSect(name)], Vec::new()))
            }
            Startof => {
                self.expect(Tok::LParen)?;
                let name = self.parse_string()?;
                self.expect(Tok::RParen)?;
                Ok(Expr::from_ops(vec![RpnOp::StartofSect(name)], Vec::new()))
            }
            Strlen => {
                self.expect(Tok::LParen)?;
                let text = self.parse_string()?;
                self.expect(Tok::RParen)?;
                Ok(Expr::konst(text.chars().count() as i32))
            }
            Strcmp => {
                self.expect(Tok::LParen)?;
                let a = self.parse_string()?;
                self.expect(Tok::Comma)?;
                let b = self.parse_string()?;
                self.expect(Tok::RParen)?;
                Ok(Expr::konst(match a.cmp(&b) {
                    std::cmp::Ordering::Less => -1,
                    std::cmp::Ordering::Equal => 0,
                    std::cmp::Ordering::Greater => 1,
                }))
            }
            Strin => {
                self.expect(Tok::LParen)?;
                let haystack = self.parse_string()?;
                self.expect(Tok::Comma)?;
                let needle = self.parse_string()?;
                self.expect(Tok::RParen)?;
                let position = haystack
                    .find(&needle)
                    .map(|byte_pos| haystack[..byte_pos].chars().count() as i32 + 1)
                    .unwrap_or(0);
                Ok(Expr::konst(position))
            }
            Fdiv | Fmul | Fmod | Pow | Log | Atan2 => self.fix_binary(kw),
            Sin | Cos | Tan | Asin | Acos | Atan | Round | Ceil | Floor => self.fix_unary(kw),
            other => {
                self.err_here(format!("`{:?}` cannot start an expression", other));
                Ok(Expr::konst(0))
            }
        }
    }

    fn paren_expr(&mut self) -> Result<Expr, Fatal> {
        self.expect(Tok::LParen)?;
        let inner = self.expr()?;
        self.expect(Tok::RParen)?;
        Ok(inner)
    }

    fn bank_expr(&mut self) -> Result<Expr, Fatal> {
        self.expect(Tok::LParen)?;
        let result = match self.next()?.tok {
            Tok::Str(name) if name == "@" => self.bank_self(),
            Tok::Str(name) => Expr::from_ops(vec![RpnOp::BankSect(name)], Vec::new()),
            Tok::Ident(name) if name == "@" => self.bank_self(),
            Tok::Ident(name) => self.bank_of_symbol(&name),
            Tok::LocalIdent(name) => match self.symbols.full_name(&name) {
                Ok(full) => self.bank_of_symbol(&full),
                Err(error) => {
                    self.err_here(error);
                    Expr::konst(0)
                }
            },
            other => {
                self.err_here(format!(
                    "BANK needs a symbol, a section name, or \"@\", found {}",
                    other.describe()
                ));
                Expr::konst(0)
            }
        };
        self.expect(Tok::RParen)?;
        Ok(result)
    }

    fn bank_self(&mut self) -> Expr {
        match self.sections.pc() {
            Ok((section, _)) => {
                if let Some(bank) = self.sections.get(section).bank {
                    return Expr::konst(bank as i32);
                }
                Expr::from_ops(vec![RpnOp::BankSelf], Vec::new())
            }
            Err(error) => {
                self.err_here(error);
                Expr::konst(0)
            }
        }
    }

    fn bank_of_symbol(&mut self, name: &str) -> Expr {
        if let Some((id, symbol)) = self.symbols.get(name) {
            if let SymKind::Label { section, .. } = symbol.kind {
                if let Some(bank) = self.sections.get(section).bank {
                    return Expr::konst(bank as i32);
                }
            }
            let ops = vec![RpnOp::BankSym(id.0)];
            return Expr::from_ops(ops, vec![id]);
        }
        let loc = self.lexer.ctx.loc();
        let id = self.symbols.reference(name, loc);
        Expr::from_ops(vec![RpnOp::BankSym(id.0)], vec![id])
    }

    /// Two-operand fixed-point intrinsics, with an optional trailing
    /// precision argument.
    fn fix_binary(&mut self, kw: Keyword) -> Result<Expr, Fatal> {
        self.expect(Tok::LParen)?;
        let a = self.const_expr("fixed-point operand")?;
        self.expect(Tok::Comma)?;
        let b = self.const_expr("fixed-point operand")?;
        let q = self.opt_precision()?;
        self.expect(Tok::RParen)?;
        use crate::asm::fixpoint;
        let result = match kw {
            Keyword::Fdiv => fixpoint::div(a, b, q),
            Keyword::Fmul => Ok(fixpoint::mul(a, b, q)),
            Keyword::Fmod => fixpoint::rem(a, b, q),
            Keyword::Pow => fixpoint::pow(a, b, q),
            Keyword::Log => fixpoint::log(a, b, q),
            _ => fixpoint::atan2(a, b, q),
        };
        Ok(match result {
            Ok(value) => Expr::konst(value),
            Err(error) => {
                self.err_here(error);
                Expr::konst(0)
            }
        })
    }

    /// One-operand fixed-point intrinsics.
    fn fix_unary(&mut self, kw: Keyword) -> Result<Expr, Fatal> {
        self.expect(Tok::LParen)?;
        let a = self.const_expr("fixed-point operand")?;
        let q = self.opt_precision()?;
        self.expect(Tok::RParen)?;
        use crate::asm::fixpoint;
        let result = match kw {
            Keyword::Sin => fixpoint::sin(a, q),
            Keyword::Cos => fixpoint::cos(a, q),
            Keyword::Tan => fixpoint::tan(a, q),
            Keyword::Asin => fixpoint::asin(a, q),
            Keyword::Acos => fixpoint::acos(a, q),
            Keyword::Atan => fixpoint::atan(a, q),
            Keyword::Round => Ok(fixpoint::round(a, q)),
            Keyword::Ceil => Ok(fixpoint::ceil(a, q)),
            _ => Ok(fixpoint::floor(a, q)),
        };
        Ok(match result {
            Ok(value) => Expr::konst(value),
            Err(error) => {
                self.err_here(error);
                Expr::konst(0)
            }
        })
    }

    fn opt_precision(&mut self) -> Result<u8, Fatal> {
        if self.eat(Tok::Comma)? {
            let q = self.const_expr("precision")?;
            if (1..=31).contains(&q) {
                return Ok(q as u8);
            }
            self.err_here(format!("precision {} is out of range", q));
        }
        Ok(self.lexer.opts.fix_precision)
    }

    // ---- string expressions ------------------------------------------------

    fn peek_is_string(&mut self) -> Result<bool, Fatal> {
        Ok(match self.peek_tok()? {
            Tok::Str(_) => true,
            Tok::Ident(name) => name == "__FILE__",
            Tok::Kw(
                Keyword::Strcat
                | Keyword::Strsub
                | Keyword::Strupr
                | Keyword::Strlwr
                | Keyword::Strrpl,
            ) => true,
            _ => false,
        })
    }

    pub(crate) fn parse_string(&mut self) -> Result<String, Fatal> {
        let token = self.next()?;
        match token.tok {
            Tok::Str(text) => Ok(text),
            Tok::Ident(name) if name == "__FILE__" => Ok(self
                .lexer
                .ctx
                .file_frame()
                .map(|f| f.path.display().to_string())
                .unwrap_or_default()),
            Tok::Kw(Keyword::Strcat) => {
                self.expect(Tok::LParen)?;
                let mut out = String::new();
                if self.peek_tok()? != Tok::RParen {
                    loop {
                        out.push_str(&self.parse_string()?);
                        if !self.eat(Tok::Comma)? {
                            break;
                        }
                    }
                }
                self.expect(Tok::RParen)?;
                Ok(out)
            }
            Tok::Kw(Keyword::Strupr) => {
                self.expect(Tok::LParen)?;
                let text = self.parse_string()?;
                self.expect(Tok::RParen)?;
                Ok(text.to_uppercase())
            }
            Tok::Kw(Keyword::Strlwr) => {
                self.expect(Tok::LParen)?;
                let text = self.parse_string()?;
                self.expect(Tok::RParen)?;
                Ok(text.to_lowercase())
            }
            Tok::Kw(Keyword::Strsub) => {
                self.expect(Tok::LParen)?;
                let text = self.parse_string()?;
                self.expect(Tok::Comma)?;
                let position = self.const_expr("STRSUB position")?;
                let length = if self.eat(Tok::Comma)? {
                    Some(self.const_expr("STRSUB length")?)
                } else {
                    None
                };
                self.expect(Tok::RParen)?;
                Ok(self.strsub(&text, position, length))
            }
            Tok::Kw(Keyword::Strrpl) => {
                self.expect(Tok::LParen)?;
                let text = self.parse_string()?;
                self.expect(Tok::Comma)?;
                let from = self.parse_string()?;
                self.expect(Tok::Comma)?;
                let to = self.parse_string()?;
                self.expect(Tok::RParen)?;
                if from.is_empty() {
                    self.warn_here(Warning::EmptyStrrpl, "STRRPL with an empty search pattern");
                    return Ok(text);
                }
                Ok(text.replace(&from, &to))
            }
            other => {
                self.err_here(format!("expected a string, found {}", other.describe()));
                Ok(String::new())
            }
        }
    }

    /// STRSUB with 1-based character positions. A zero-length slice just
    /// past the end is silent; reaching further warns.
    fn strsub(&mut self, text: &str, position: i32, length: Option<i32>) -> String {
        let total = text.chars().count() as i32;
        let wanted = length.unwrap_or(i32::MAX);
        if position < 1 || (wanted > 0 && position > total + 1) {
            self.warn_here(
                Warning::BuiltinArg,
                format!("STRSUB position {} is outside the string", position),
            );
        }
        let start = (position.max(1) - 1).max(0);
        text.chars()
            .skip(start as usize)
            .take(wanted.max(0) as usize)
            .collect()
    }
}

/// Parse an OPT numeric argument in any of the literal radix notations.
fn parse_number(text: &str) -> Option<u32> {
    if let Some(hex) = text.strip_prefix('$') {
        return u32::from_str_radix(hex, 16).ok();
    }
    if let Some(bin) = text.strip_prefix('%') {
        return u32::from_str_radix(bin, 2).ok();
    }
    if let Some(oct) = text.strip_prefix('&') {
        return u32::from_str_radix(oct, 8).ok();
    }
    text.parse().ok()
}

/// How many iterations a FOR loop with these bounds runs.
fn iteration_count(start: i32, stop: i32, step: i32) -> u32 {
    if step > 0 {
        if stop <= start {
            0
        } else {
            ((i64::from(stop) - i64::from(start) + i64::from(step) - 1) / i64::from(step)) as u32
        }
    } else if step < 0 {
        if stop >= start {
            0
        } else {
            ((i64::from(start) - i64::from(stop) - i64::from(step) - 1) / -i64::from(step)) as u32
        }
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::iteration_count;

    #[test]
    fn for_iteration_counts() {
        assert_eq!(iteration_count(0, 5, 1), 5);
        assert_eq!(iteration_count(0, 5, 2), 3);
        assert_eq!(iteration_count(5, 0, -1), 5);
        assert_eq!(iteration_count(5, 0, -2), 3);
        assert_eq!(iteration_count(3, 3, 1), 0);
        assert_eq!(iteration_count(0, 5, 0), 0);
    }
}
