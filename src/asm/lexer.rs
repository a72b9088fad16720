//! The tokenizer.
//!
//! Tokens are drawn from the top of the context stack; on top of that sits
//! an expansion stack for EQUS symbols, `\1`-`\9` macro arguments, `\@`
//! unique ids, and `{sym}` interpolations, so expanded text is re-lexed
//! exactly as if it had been written in place. Body capture and
//! conditional skipping work on the raw frame text, line by line, without
//! expanding or evaluating anything.

use std::rc::Rc;

use memchr::memchr;

use crate::asm::context::{ContextStack, Frame, Loc};
use crate::asm::symbol::{SymKind, SymbolTable};
use crate::diag::{Fatal, Reporter};

/// Lexer options that directives can change mid-file.
#[derive(Debug, Clone, Copy)]
pub struct LexOpts {
    /// The two characters accepted as `%` binary digits.
    pub binary_digits: [char; 2],
    /// The four characters accepted as `` ` `` gfx digits.
    pub gfx_digits: [char; 4],
    /// Fractional bits of fixed-point literals.
    pub fix_precision: u8,
}

impl Default for LexOpts {
    fn default() -> Self {
        LexOpts {
            binary_digits: ['0', '1'],
            gfx_digits: ['0', '1', '2', '3'],
            fix_precision: 16,
        }
    }
}

/// A token with the position it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub loc: Loc,
}

/// Token payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Number(u32),
    Str(String),
    Ident(String),
    /// An identifier with a scope separator: `.loop` or `Main.loop`.
    LocalIdent(String),
    /// `:+`/`:-` chains; positive counts look forward.
    AnonRef(i32),
    Kw(Keyword),
    Newline,
    Colon,
    DoubleColon,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Bang,
    Shl,
    Shr,
    Ushr,
    Exp,
    AmpAmp,
    PipePipe,
    Assign,
    EqEq,
    Neq,
    Lt,
    Gt,
    Le,
    Ge,
    Eof,
}

impl Tok {
    /// A short rendering for "unexpected token" messages.
    pub fn describe(&self) -> String {
        match self {
            Tok::Number(n) => format!("number {}", n),
            Tok::Str(_) => String::from("string"),
            Tok::Ident(name) | Tok::LocalIdent(name) => format!("`{}`", name),
            Tok::AnonRef(_) => String::from("anonymous label reference"),
            Tok::Kw(kw) => format!("`{:?}`", kw),
            Tok::Newline => String::from("end of line"),
            Tok::Eof => String::from("end of input"),
            other => format!("`{:?}`", other),
        }
    }
}

/// Keywords: directives, functions, mnemonics, registers and section
/// kinds. Lookup is case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    // Directives.
    Include,
    Incbin,
    If,
    Elif,
    Else,
    Endc,
    Rept,
    For,
    Endr,
    Break,
    Macro,
    Endm,
    Shift,
    Def,
    Redef,
    Equ,
    Equs,
    Export,
    Purge,
    Section,
    Pushs,
    Pops,
    Load,
    Endl,
    Union,
    Nextu,
    Endu,
    Align,
    Ds,
    Db,
    Dw,
    Dl,
    Rsreset,
    Rsset,
    Rb,
    Rw,
    Rl,
    Charmap,
    Newcharmap,
    Setcharmap,
    Pushc,
    Popc,
    Opt,
    Pusho,
    Popo,
    Println,
    Assert,
    StaticAssert,
    Fail,
    Warn,
    Fatal,
    // Functions.
    High,
    Low,
    Bank,
    Sizeof,
    Startof,
    Isconst,
    Fdiv,
    Fmul,
    Fmod,
    Pow,
    Log,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Atan2,
    Round,
    Ceil,
    Floor,
    Strlen,
    Strcat,
    Strcmp,
    Strin,
    Strsub,
    Strupr,
    Strlwr,
    Strrpl,
    // Instructions.
    Adc,
    Add,
    And,
    Bit,
    Call,
    Ccf,
    Cp,
    Cpl,
    Daa,
    Dec,
    Di,
    Ei,
    Halt,
    Inc,
    Jp,
    Jr,
    Ld,
    Ldh,
    Ldi,
    Ldd,
    Nop,
    Or,
    Pop,
    Push,
    Res,
    Ret,
    Reti,
    Rla,
    Rlca,
    Rra,
    Rrca,
    Rst,
    Sbc,
    Scf,
    Set,
    Stop,
    Sub,
    Swap,
    Xor,
    Rlc,
    Rrc,
    Rr,
    Sla,
    Sra,
    Srl,
    // Registers and condition codes.
    A,
    B,
    C,
    D,
    E,
    H,
    L,
    Af,
    Bc,
    De,
    Hl,
    Sp,
    Hli,
    Hld,
    Nz,
    Z,
    Nc,
    // Section kinds and attributes.
    Rom0,
    Romx,
    Vram,
    Sram,
    Wram0,
    Wramx,
    Oam,
    Hram,
    Fragment,
}

fn keyword(name: &str) -> Option<Keyword> {
    let upper = name.to_ascii_uppercase();
    use Keyword::*;
    Some(match upper.as_str() {
        "INCLUDE" => Include,
        "INCBIN" => Incbin,
        "IF" => If,
        "ELIF" => Elif,
        "ELSE" => Else,
        "ENDC" => Endc,
        "REPT" => Rept,
        "FOR" => For,
        "ENDR" => Endr,
        "BREAK" => Break,
        "MACRO" => Macro,
        "ENDM" => Endm,
        "SHIFT" => Shift,
        "DEF" => Def,
        "REDEF" => Redef,
        "EQU" => Equ,
        "EQUS" => Equs,
        "EXPORT" => Export,
        "PURGE" => Purge,
        "SECTION" => Section,
        "PUSHS" => Pushs,
        "POPS" => Pops,
        "LOAD" => Load,
        "ENDL" => Endl,
        "UNION" => Union,
        "NEXTU" => Nextu,
        "ENDU" => Endu,
        "ALIGN" => Align,
        "DS" => Ds,
        "DB" => Db,
        "DW" => Dw,
        "DL" => Dl,
        "RSRESET" => Rsreset,
        "RSSET" => Rsset,
        "RB" => Rb,
        "RW" => Rw,
        "RL" => Rl,
        "CHARMAP" => Charmap,
        "NEWCHARMAP" => Newcharmap,
        "SETCHARMAP" => Setcharmap,
        "PUSHC" => Pushc,
        "POPC" => Popc,
        "OPT" => Opt,
        "PUSHO" => Pusho,
        "POPO" => Popo,
        "PRINTLN" => Println,
        "ASSERT" => Assert,
        "STATIC_ASSERT" => StaticAssert,
        "FAIL" => Fail,
        "WARN" => Warn,
        "FATAL" => Fatal,
        "HIGH" => High,
        "LOW" => Low,
        "BANK" => Bank,
        "SIZEOF" => Sizeof,
        "STARTOF" => Startof,
        "ISCONST" => Isconst,
        "FDIV" => Fdiv,
        "FMUL" => Fmul,
        "FMOD" => Fmod,
        "POW" => Pow,
        "LOG" => Log,
        "SIN" => Sin,
        "COS" => Cos,
        "TAN" => Tan,
        "ASIN" => Asin,
        "ACOS" => Acos,
        "ATAN" => Atan,
        "ATAN2" => Atan2,
        "ROUND" => Round,
        "CEIL" => Ceil,
        "FLOOR" => Floor,
        "STRLEN" => Strlen,
        "STRCAT" => Strcat,
        "STRCMP" => Strcmp,
        "STRIN" => Strin,
        "STRSUB" => Strsub,
        "STRUPR" => Strupr,
        "STRLWR" => Strlwr,
        "STRRPL" => Strrpl,
        "ADC" => Adc,
        "ADD" => Add,
        "AND" => And,
        "BIT" => Bit,
        "CALL" => Call,
        "CCF" => Ccf,
        "CP" => Cp,
        "CPL" => Cpl,
        "DAA" => Daa,
        "DEC" => Dec,
        "DI" => Di,
        "EI" => Ei,
        "HALT" => Halt,
        "INC" => Inc,
        "JP" => Jp,
        "JR" => Jr,
        "LD" => Ld,
        "LDH" => Ldh,
        "LDI" => Ldi,
        "LDD" => Ldd,
        "NOP" => Nop,
        "OR" => Or,
        "POP" => Pop,
        "PUSH" => Push,
        "RES" => Res,
        "RET" => Ret,
        "RETI" => Reti,
        "RLA" => Rla,
        "RLCA" => Rlca,
        "RRA" => Rra,
        "RRCA" => Rrca,
        "RST" => Rst,
        "SBC" => Sbc,
        "SCF" => Scf,
        "SET" => Set,
        "STOP" => Stop,
        "SUB" => Sub,
        "SWAP" => Swap,
        "XOR" => Xor,
        "RLC" => Rlc,
        "RRC" => Rrc,
        "RR" => Rr,
        "SLA" => Sla,
        "SRA" => Sra,
        "SRL" => Srl,
        "A" => A,
        "B" => B,
        "C" => C,
        "D" => D,
        "E" => E,
        "H" => H,
        "L" => L,
        "AF" => Af,
        "BC" => Bc,
        "DE" => De,
        "HL" => Hl,
        "SP" => Sp,
        "HLI" => Hli,
        "HLD" => Hld,
        "NZ" => Nz,
        "Z" => Z,
        "NC" => Nc,
        "ROM0" => Rom0,
        "ROMX" => Romx,
        "VRAM" => Vram,
        "SRAM" => Sram,
        "WRAM0" => Wram0,
        "WRAMX" => Wramx,
        "OAM" => Oam,
        "HRAM" => Hram,
        "FRAGMENT" => Fragment,
        _ => return None,
    })
}

/// One entry of the expansion stack.
#[derive(Debug, Clone)]
struct Expansion {
    /// The EQUS name being expanded, for recursion detection.
    name: Option<String>,
    text: Rc<str>,
    pos: usize,
}

/// A saved lexer position, for one-statement lookahead decisions. Only
/// valid while the context stack has not popped a frame since.
#[derive(Debug)]
pub struct Checkpoint {
    depth: usize,
    frame_pos: usize,
    frame_line: u32,
    exps: Vec<Expansion>,
}

/// Where a conditional skip stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipStop {
    Elif,
    Else,
    Endc,
}

/// What a body capture balances against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    /// REPT/FOR nest, ENDR terminates.
    Rept,
    /// MACRO nests, ENDM terminates.
    Macro,
}

/// The tokenizer over the context stack.
#[derive(Debug)]
pub struct Lexer {
    pub ctx: ContextStack,
    exps: Vec<Expansion>,
    /// EQUS expansion switch; identifier-capturing directives clear it.
    pub expand_idents: bool,
    pub opts: LexOpts,
    peeked: Option<Token>,
}

impl Lexer {
    pub fn new(ctx: ContextStack) -> Lexer {
        Lexer {
            ctx,
            exps: Vec::new(),
            expand_idents: true,
            opts: LexOpts::default(),
            peeked: None,
        }
    }

    // ---- character level -------------------------------------------------

    fn peek_char(&mut self) -> Option<char> {
        while let Some(exp) = self.exps.last() {
            if let Some(c) = exp.text[exp.pos..].chars().next() {
                return Some(c);
            }
            self.exps.pop();
        }
        let frame = self.ctx.top()?;
        frame.text()[frame.pos()..].chars().next()
    }

    /// Peek one character past the current one, within the same source
    /// text. Returns `None` at a source boundary.
    fn peek_second(&mut self) -> Option<char> {
        if let Some(exp) = self.exps.last() {
            let mut chars = exp.text[exp.pos..].chars();
            chars.next()?;
            return chars.next();
        }
        let frame = self.ctx.top()?;
        let mut chars = frame.text()[frame.pos()..].chars();
        chars.next()?;
        chars.next()
    }

    fn bump(&mut self) -> Option<char> {
        while let Some(exp) = self.exps.last_mut() {
            if let Some(c) = exp.text[exp.pos..].chars().next() {
                exp.pos += c.len_utf8();
                return Some(c);
            }
            self.exps.pop();
        }
        let frame = self.ctx.top_mut()?;
        let c = frame.text()[frame.pos()..].chars().next()?;
        *frame.pos_mut() += c.len_utf8();
        if c == '\n' {
            *frame.line_mut() += 1;
        }
        Some(c)
    }

    fn push_expansion(&mut self, name: Option<String>, text: Rc<str>) -> Result<(), Fatal> {
        if self.exps.len() + self.ctx.depth() >= self.ctx.max_depth() {
            return Err(Fatal::new(format!(
                "recursion limit ({}) exceeded while expanding",
                self.ctx.max_depth()
            )));
        }
        self.exps.push(Expansion { name, text, pos: 0 });
        Ok(())
    }

    fn expanding(&self, name: &str) -> bool {
        self.exps
            .iter()
            .any(|exp| exp.name.as_deref() == Some(name))
    }

    /// The text of macro argument `\n`, if any.
    fn macro_arg(&self, n: usize) -> Option<Rc<str>> {
        let frame = self.ctx.macro_frame()?;
        frame.args.get(frame.shift + n - 1).cloned()
    }

    // ---- token level -----------------------------------------------------

    /// Look at the next token without consuming it.
    pub fn peek_token(
        &mut self,
        syms: &SymbolTable,
        diag: &mut Reporter,
    ) -> Result<&Token, Fatal> {
        if self.peeked.is_none() {
            let token = self.scan_token(syms, diag)?;
            self.peeked = Some(token);
        }
        Ok(self.peeked.as_ref().unwrap())
    }

    /// Consume and return the next token.
    pub fn next_token(
        &mut self,
        syms: &SymbolTable,
        diag: &mut Reporter,
    ) -> Result<Token, Fatal> {
        if let Some(token) = self.peeked.take() {
            return Ok(token);
        }
        self.scan_token(syms, diag)
    }

    /// Push a token back; at most one can be pending.
    pub fn unget(&mut self, token: Token) {
        debug_assert!(self.peeked.is_none());
        self.peeked = Some(token);
    }

    /// Save the current position. The checkpoint is valid as long as no
    /// frame has been popped since.
    pub fn checkpoint(&self) -> Checkpoint {
        debug_assert!(self.peeked.is_none());
        let (frame_pos, frame_line) = match self.ctx.top() {
            Some(frame) => (frame.pos(), frame.line()),
            None => (0, 0),
        };
        Checkpoint {
            depth: self.ctx.depth(),
            frame_pos,
            frame_line,
            exps: self.exps.clone(),
        }
    }

    /// Rewind to a checkpoint. Returns `false` (and does nothing) if a
    /// frame boundary was crossed since the save.
    pub fn rewind(&mut self, checkpoint: Checkpoint) -> bool {
        if self.ctx.depth() != checkpoint.depth {
            return false;
        }
        self.peeked = None;
        self.exps = checkpoint.exps;
        if let Some(frame) = self.ctx.top_mut() {
            *frame.pos_mut() = checkpoint.frame_pos;
            *frame.line_mut() = checkpoint.frame_line;
        }
        true
    }

    fn end_of_source(&mut self) -> Token {
        let loc = self.ctx.loc();
        if self.ctx.is_empty() {
            return Token { tok: Tok::Eof, loc };
        }
        let is_rept = matches!(self.ctx.top(), Some(Frame::Rept(_)));
        if !is_rept || !self.ctx.advance_rept() {
            self.ctx.pop();
        }
        // A synthetic end-of-line keeps the last statement of the frame
        // well terminated.
        Token {
            tok: Tok::Newline,
            loc,
        }
    }

    fn scan_token(&mut self, syms: &SymbolTable, diag: &mut Reporter) -> Result<Token, Fatal> {
        loop {
            let loc = self.ctx.loc();
            let Some(c) = self.peek_char() else {
                return Ok(self.end_of_source());
            };
            let tok = match c {
                ' ' | '\t' | '\r' => {
                    self.bump();
                    continue;
                }
                '\n' => {
                    self.bump();
                    Tok::Newline
                }
                ';' => {
                    while let Some(c) = self.peek_char() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                    continue;
                }
                '/' if self.peek_second() == Some('*') => {
                    self.bump();
                    self.bump();
                    self.skip_block_comment(diag);
                    continue;
                }
                '\\' => {
                    self.escape_expansion(diag)?;
                    continue;
                }
                '{' => {
                    self.bump();
                    let text = self.interpolate(syms, diag)?;
                    self.push_expansion(None, text.into())?;
                    continue;
                }
                '"' => {
                    self.bump();
                    Tok::Str(self.scan_string(syms, diag)?)
                }
                '0'..='9' => self.scan_number(diag),
                '$' => {
                    self.bump();
                    self.scan_radix_number(16, diag)
                }
                '&' => {
                    self.bump();
                    match self.peek_char() {
                        Some('&') => {
                            self.bump();
                            Tok::AmpAmp
                        }
                        Some('0'..='7') => self.scan_radix_number(8, diag),
                        _ => Tok::Amp,
                    }
                }
                '%' => {
                    self.bump();
                    match self.peek_char() {
                        Some(c) if self.opts.binary_digits.contains(&c) => {
                            self.scan_binary_number()
                        }
                        _ => Tok::Percent,
                    }
                }
                '`' => {
                    self.bump();
                    self.scan_gfx_number(diag)
                }
                'a'..='z' | 'A'..='Z' | '_' | '.' | '@' | '#' => {
                    match self.scan_ident(syms, diag)? {
                        Some(tok) => tok,
                        None => continue,
                    }
                }
                ':' => {
                    self.bump();
                    match self.peek_char() {
                        Some(':') => {
                            self.bump();
                            Tok::DoubleColon
                        }
                        Some('+') => {
                            let mut n = 0;
                            while self.peek_char() == Some('+') {
                                self.bump();
                                n += 1;
                            }
                            Tok::AnonRef(n)
                        }
                        Some('-') => {
                            let mut n = 0;
                            while self.peek_char() == Some('-') {
                                self.bump();
                                n -= 1;
                            }
                            Tok::AnonRef(n)
                        }
                        _ => Tok::Colon,
                    }
                }
                '+' => {
                    self.bump();
                    Tok::Plus
                }
                '-' => {
                    self.bump();
                    Tok::Minus
                }
                '*' => {
                    self.bump();
                    if self.peek_char() == Some('*') {
                        self.bump();
                        Tok::Exp
                    } else {
                        Tok::Star
                    }
                }
                '/' => {
                    self.bump();
                    Tok::Slash
                }
                '~' => {
                    self.bump();
                    Tok::Tilde
                }
                '^' => {
                    self.bump();
                    Tok::Caret
                }
                '|' => {
                    self.bump();
                    if self.peek_char() == Some('|') {
                        self.bump();
                        Tok::PipePipe
                    } else {
                        Tok::Pipe
                    }
                }
                '!' => {
                    self.bump();
                    if self.peek_char() == Some('=') {
                        self.bump();
                        Tok::Neq
                    } else {
                        Tok::Bang
                    }
                }
                '=' => {
                    self.bump();
                    if self.peek_char() == Some('=') {
                        self.bump();
                        Tok::EqEq
                    } else {
                        Tok::Assign
                    }
                }
                '<' => {
                    self.bump();
                    match self.peek_char() {
                        Some('<') => {
                            self.bump();
                            Tok::Shl
                        }
                        Some('=') => {
                            self.bump();
                            Tok::Le
                        }
                        _ => Tok::Lt,
                    }
                }
                '>' => {
                    self.bump();
                    match self.peek_char() {
                        Some('>') => {
                            self.bump();
                            if self.peek_char() == Some('>') {
                                self.bump();
                                Tok::Ushr
                            } else {
                                Tok::Shr
                            }
                        }
                        Some('=') => {
                            self.bump();
                            Tok::Ge
                        }
                        _ => Tok::Gt,
                    }
                }
                '(' => {
                    self.bump();
                    Tok::LParen
                }
                ')' => {
                    self.bump();
                    Tok::RParen
                }
                '[' => {
                    self.bump();
                    Tok::LBracket
                }
                ']' => {
                    self.bump();
                    Tok::RBracket
                }
                ',' => {
                    self.bump();
                    Tok::Comma
                }
                other => {
                    self.bump();
                    diag.error(
                        self.ctx.location(),
                        format!("unexpected character `{}`", other.escape_default()),
                    );
                    continue;
                }
            };
            return Ok(Token { tok, loc });
        }
    }

    fn skip_block_comment(&mut self, diag: &mut Reporter) {
        loop {
            match self.bump() {
                None => {
                    diag.error(self.ctx.location(), "unterminated block comment");
                    return;
                }
                Some('*') if self.peek_char() == Some('/') => {
                    self.bump();
                    return;
                }
                Some(_) => {}
            }
        }
    }

    /// `\` outside a string: a macro argument, the unique id, or a line
    /// continuation.
    fn escape_expansion(&mut self, diag: &mut Reporter) -> Result<(), Fatal> {
        self.bump();
        match self.peek_char() {
            Some(d @ '1'..='9') => {
                self.bump();
                let n = d as usize - '0' as usize;
                match self.macro_arg(n) {
                    Some(text) => self.push_expansion(None, text)?,
                    None => diag.error(
                        self.ctx.location(),
                        format!("macro argument \\{} is not supplied", n),
                    ),
                }
            }
            Some('@') => {
                self.bump();
                match self.ctx.unique_id() {
                    Some(id) => self.push_expansion(None, id.to_string().into())?,
                    None => diag.error(
                        self.ctx.location(),
                        "\\@ is only meaningful inside a macro or loop",
                    ),
                }
            }
            Some('\n') => {
                self.bump();
            }
            other => {
                if let Some(c) = other {
                    self.bump();
                    diag.error(
                        self.ctx.location(),
                        format!("invalid escape `\\{}`", c.escape_default()),
                    );
                }
            }
        }
        Ok(())
    }

    /// `{sym}`: the text a symbol interpolates to.
    fn interpolate(
        &mut self,
        syms: &SymbolTable,
        diag: &mut Reporter,
    ) -> Result<String, Fatal> {
        let mut name = String::new();
        loop {
            match self.peek_char() {
                Some('}') => {
                    self.bump();
                    break;
                }
                Some('\n') | None => {
                    diag.error(self.ctx.location(), "unterminated `{` interpolation");
                    break;
                }
                Some('\\') => {
                    self.escape_expansion(diag)?;
                }
                Some(c) => {
                    self.bump();
                    name.push(c);
                }
            }
        }
        let full = match syms.full_name(&name) {
            Ok(full) => full,
            Err(error) => {
                diag.error(self.ctx.location(), error);
                return Ok(String::new());
            }
        };
        match syms.get(&full).map(|(_, s)| &s.kind) {
            Some(SymKind::Equs(text)) => Ok(text.to_string()),
            Some(SymKind::Equ(value)) | Some(SymKind::Var(value)) => {
                Ok(format!("${:X}", value))
            }
            Some(_) => {
                diag.error(
                    self.ctx.location(),
                    format!("`{}` cannot be interpolated", full),
                );
                Ok(String::new())
            }
            None => {
                diag.error(self.ctx.location(), format!("`{}` is not defined", full));
                Ok(String::new())
            }
        }
    }

    fn scan_string(&mut self, syms: &SymbolTable, diag: &mut Reporter) -> Result<String, Fatal> {
        let mut out = String::new();
        loop {
            match self.peek_char() {
                None | Some('\n') => {
                    diag.error(self.ctx.location(), "unterminated string");
                    break;
                }
                Some('"') => {
                    self.bump();
                    break;
                }
                Some('\\') => {
                    self.bump();
                    match self.peek_char() {
                        Some('n') => {
                            self.bump();
                            out.push('\n');
                        }
                        Some('r') => {
                            self.bump();
                            out.push('\r');
                        }
                        Some('t') => {
                            self.bump();
                            out.push('\t');
                        }
                        Some('"') => {
                            self.bump();
                            out.push('"');
                        }
                        Some('\\') => {
                            self.bump();
                            out.push('\\');
                        }
                        Some('\n') => {
                            self.bump();
                        }
                        Some('@') => {
                            self.bump();
                            match self.ctx.unique_id() {
                                Some(id) => out.push_str(&id.to_string()),
                                None => diag.error(
                                    self.ctx.location(),
                                    "\\@ is only meaningful inside a macro or loop",
                                ),
                            }
                        }
                        Some(d @ '1'..='9') => {
                            self.bump();
                            let n = d as usize - '0' as usize;
                            match self.macro_arg(n) {
                                Some(text) => out.push_str(&text),
                                None => diag.error(
                                    self.ctx.location(),
                                    format!("macro argument \\{} is not supplied", n),
                                ),
                            }
                        }
                        Some(c) => {
                            self.bump();
                            diag.error(
                                self.ctx.location(),
                                format!("invalid string escape `\\{}`", c.escape_default()),
                            );
                        }
                        None => {}
                    }
                }
                Some('{') => {
                    self.bump();
                    let text = self.interpolate(syms, diag)?;
                    out.push_str(&text);
                }
                Some(c) => {
                    self.bump();
                    out.push(c);
                }
            }
        }
        Ok(out)
    }

    fn scan_number(&mut self, diag: &mut Reporter) -> Tok {
        let mut value: u32 = 0;
        let mut digits = String::new();
        while let Some(c) = self.peek_char() {
            match c {
                '0'..='9' => {
                    self.bump();
                    digits.push(c);
                    value = value
                        .wrapping_mul(10)
                        .wrapping_add(c as u32 - '0' as u32);
                }
                '_' => {
                    self.bump();
                }
                _ => break,
            }
        }
        // A dot turns the literal into a fixed-point constant.
        if self.peek_char() == Some('.')
            && matches!(self.peek_second(), Some('0'..='9'))
        {
            self.bump();
            let mut frac = String::new();
            while let Some(c @ '0'..='9') = self.peek_char() {
                self.bump();
                frac.push(c);
            }
            let literal = format!("{}.{}", digits, frac);
            return match literal.parse::<f64>() {
                Ok(real) => {
                    let scaled = real * f64::from(1u32 << self.opts.fix_precision);
                    if scaled >= -(i32::MIN as f64) {
                        diag.error(
                            self.ctx.location(),
                            format!("fixed-point constant {} is out of range", literal),
                        );
                        Tok::Number(0)
                    } else {
                        Tok::Number(scaled.round() as i64 as u32)
                    }
                }
                Err(_) => Tok::Number(0),
            };
        }
        Tok::Number(value)
    }

    fn scan_radix_number(&mut self, radix: u32, diag: &mut Reporter) -> Tok {
        let mut value: u32 = 0;
        let mut any = false;
        while let Some(c) = self.peek_char() {
            if c == '_' {
                self.bump();
                continue;
            }
            match c.to_digit(radix) {
                Some(digit) => {
                    self.bump();
                    any = true;
                    value = value.wrapping_mul(radix).wrapping_add(digit);
                }
                None => break,
            }
        }
        if !any {
            diag.error(self.ctx.location(), "number constant has no digits");
        }
        Tok::Number(value)
    }

    fn scan_binary_number(&mut self) -> Tok {
        let mut value: u32 = 0;
        while let Some(c) = self.peek_char() {
            if c == '_' {
                self.bump();
                continue;
            }
            let Some(bit) = self.opts.binary_digits.iter().position(|&d| d == c) else {
                break;
            };
            self.bump();
            value = value.wrapping_mul(2).wrapping_add(bit as u32);
        }
        Tok::Number(value)
    }

    /// A gfx literal: up to eight quaternary pixels, split into the two
    /// bit planes of a 2bpp tile row.
    fn scan_gfx_number(&mut self, diag: &mut Reporter) -> Tok {
        let mut low: u32 = 0;
        let mut high: u32 = 0;
        let mut count = 0;
        while let Some(c) = self.peek_char() {
            let Some(pixel) = self.opts.gfx_digits.iter().position(|&d| d == c) else {
                break;
            };
            self.bump();
            count += 1;
            low = (low << 1) | (pixel as u32 & 1);
            high = (high << 1) | (pixel as u32 >> 1);
        }
        if count == 0 || count > 8 {
            diag.error(
                self.ctx.location(),
                "gfx constant needs between 1 and 8 pixels",
            );
        }
        Tok::Number((high << 8) | low)
    }

    /// Scan an identifier, expanding `\1`/`\@`/`{}` mid-name and whole
    /// EQUS symbols. Returns `None` when an expansion was pushed and the
    /// scan must restart.
    fn scan_ident(
        &mut self,
        syms: &SymbolTable,
        diag: &mut Reporter,
    ) -> Result<Option<Tok>, Fatal> {
        let mut name = String::new();
        loop {
            match self.peek_char() {
                Some(c @ ('a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '.' | '@' | '#')) => {
                    self.bump();
                    name.push(c);
                }
                Some('\\') if matches!(self.peek_second(), Some('1'..='9' | '@')) => {
                    self.escape_expansion(diag)?;
                }
                Some('{') => {
                    self.bump();
                    let text = self.interpolate(syms, diag)?;
                    self.push_expansion(None, text.into())?;
                }
                _ => break,
            }
        }
        if name == "@" {
            return Ok(Some(Tok::Ident(name)));
        }
        if let Some(kw) = keyword(&name) {
            return Ok(Some(Tok::Kw(kw)));
        }
        if self.expand_idents {
            if let Ok(full) = syms.full_name(&name) {
                if let Some((_, symbol)) = syms.get(&full) {
                    if let SymKind::Equs(text) = &symbol.kind {
                        if self.expanding(&full) {
                            diag.error(
                                self.ctx.location(),
                                format!("recursive expansion of `{}`", full),
                            );
                        } else {
                            self.push_expansion(Some(full), text.clone())?;
                            return Ok(None);
                        }
                    }
                }
            }
        }
        if name.contains('.') {
            Ok(Some(Tok::LocalIdent(name)))
        } else {
            Ok(Some(Tok::Ident(name)))
        }
    }

    // ---- raw capture -----------------------------------------------------

    /// Read the rest of the line as raw comma-separated arguments, with
    /// escapes and interpolations active. Consumes the terminating
    /// newline.
    pub fn read_raw_args(
        &mut self,
        syms: &SymbolTable,
        diag: &mut Reporter,
    ) -> Result<Vec<Rc<str>>, Fatal> {
        debug_assert!(self.peeked.is_none());
        let mut args: Vec<Rc<str>> = Vec::new();
        let mut current = String::new();
        let mut saw_comma = false;
        let mut in_string = false;
        loop {
            match self.peek_char() {
                None => break,
                Some('\n') => {
                    self.bump();
                    break;
                }
                Some('\\') => match self.peek_second() {
                    Some('1'..='9' | '@' | '\n') => {
                        self.escape_expansion(diag)?;
                    }
                    Some(c) if in_string => {
                        // String escapes stay verbatim for re-lexing.
                        self.bump();
                        self.bump();
                        current.push('\\');
                        current.push(c);
                    }
                    _ => {
                        self.bump();
                        current.push('\\');
                    }
                },
                Some(';') if !in_string => {
                    while let Some(c) = self.peek_char() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some('{') => {
                    self.bump();
                    let text = self.interpolate(syms, diag)?;
                    self.push_expansion(None, text.into())?;
                }
                Some('"') => {
                    self.bump();
                    in_string = !in_string;
                    current.push('"');
                }
                Some(',') if !in_string => {
                    self.bump();
                    saw_comma = true;
                    args.push(Rc::from(current.trim()));
                    current.clear();
                }
                Some(c) => {
                    self.bump();
                    current.push(c);
                }
            }
        }
        if in_string {
            diag.error(self.ctx.location(), "unterminated string");
        }
        let tail = current.trim();
        if saw_comma || !tail.is_empty() {
            args.push(Rc::from(tail));
        }
        Ok(args)
    }

    /// Capture a REPT/FOR/MACRO body verbatim, balancing nested openers of
    /// the same family. The cursor must sit at the start of the body's
    /// first line; on success it sits past the terminator line.
    pub fn capture_body(&mut self, kind: CaptureKind) -> Result<(Rc<str>, u32), String> {
        debug_assert!(self.peeked.is_none());
        if !self.exps.is_empty() {
            return Err(String::from("block must start on a source line"));
        }
        let Some(frame) = self.ctx.top_mut() else {
            return Err(String::from("no input to capture from"));
        };
        let text = frame.text().clone();
        let start = frame.pos();
        let first_line = frame.line();
        let mut pos = start;
        let mut line = first_line;
        let mut depth = 0usize;
        loop {
            if pos >= text.len() {
                let what = match kind {
                    CaptureKind::Rept => "REPT/FOR block has no ENDR",
                    CaptureKind::Macro => "macro definition has no ENDM",
                };
                return Err(String::from(what));
            }
            let line_end = match memchr(b'\n', text[pos..].as_bytes()) {
                Some(i) => pos + i,
                None => text.len(),
            };
            let word = first_word(&text[pos..line_end]);
            let upper = word.to_ascii_uppercase();
            let (openers, closer): (&[&str], &str) = match kind {
                CaptureKind::Rept => (&["REPT", "FOR"], "ENDR"),
                CaptureKind::Macro => (&["MACRO"], "ENDM"),
            };
            if openers.contains(&upper.as_str()) {
                depth += 1;
            } else if upper == closer {
                if depth == 0 {
                    let body = text[start..pos].to_owned();
                    let next = (line_end + 1).min(text.len());
                    let frame = self.ctx.top_mut().unwrap();
                    *frame.pos_mut() = next;
                    *frame.line_mut() = line + 1;
                    return Ok((Rc::from(body), first_line));
                }
                depth -= 1;
            }
            pos = (line_end + 1).min(text.len());
            if line_end < text.len() {
                line += 1;
            }
        }
    }

    /// Skip a false conditional branch without evaluating anything.
    /// `stop_at_branch` permits stopping at ELIF/ELSE; otherwise only the
    /// matching ENDC ends the skip. The cursor ends just after the
    /// stopping keyword.
    pub fn skip_conditional(&mut self, stop_at_branch: bool) -> Result<SkipStop, String> {
        debug_assert!(self.peeked.is_none());
        debug_assert!(self.exps.is_empty());
        let Some(frame) = self.ctx.top_mut() else {
            return Err(String::from("IF block has no ENDC"));
        };
        let text = frame.text().clone();
        let mut pos = frame.pos();
        let mut line = frame.line();
        let mut depth = 0usize;
        // The IF line itself may have trailing text already consumed up to
        // the newline; scanning starts wherever the cursor is.
        loop {
            if pos >= text.len() {
                return Err(String::from("IF block has no ENDC"));
            }
            let line_end = match memchr(b'\n', text[pos..].as_bytes()) {
                Some(i) => pos + i,
                None => text.len(),
            };
            let line_text = &text[pos..line_end];
            let word = first_word(line_text);
            let upper = word.to_ascii_uppercase();
            let word_end = pos + word_end_offset(line_text);
            let mut stop = None;
            match upper.as_str() {
                "IF" => depth += 1,
                "ENDC" => {
                    if depth == 0 {
                        stop = Some(SkipStop::Endc);
                    } else {
                        depth -= 1;
                    }
                }
                "ELIF" if depth == 0 && stop_at_branch => stop = Some(SkipStop::Elif),
                "ELSE" if depth == 0 && stop_at_branch => stop = Some(SkipStop::Else),
                _ => {}
            }
            if let Some(stop) = stop {
                let frame = self.ctx.top_mut().unwrap();
                *frame.pos_mut() = word_end;
                *frame.line_mut() = line;
                return Ok(stop);
            }
            pos = (line_end + 1).min(text.len());
            if line_end < text.len() {
                line += 1;
            }
        }
    }
}

/// The first blank-delimited word of a line, comments stripped.
fn first_word(line: &str) -> &str {
    let trimmed = line.trim_start_matches([' ', '\t']);
    let end = trimmed
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(trimmed.len());
    &trimmed[..end]
}

/// Byte offset just past the first word of `line`.
fn word_end_offset(line: &str) -> usize {
    let leading = line.len() - line.trim_start_matches([' ', '\t']).len();
    leading + first_word(line).len()
}
