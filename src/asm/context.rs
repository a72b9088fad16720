//! The lexical context stack: included files, macro expansions, and
//! REPT/FOR replays.
//!
//! Each frame owns a cursor into its text; captured bodies are shared
//! `Rc<str>`s, so a macro invoked recursively shares one body instead of
//! copying it. Every frame is mirrored by an entry in the node table that
//! the object module carries for link-time diagnostics.

use std::path::PathBuf;
use std::rc::Rc;

use crate::obj::{Node, NodeKind};

/// A source file pushed by INCLUDE (or the root file).
#[derive(Debug)]
pub struct IncludeFrame {
    pub path: PathBuf,
    pub text: Rc<str>,
    pub pos: usize,
    pub line: u32,
    pub node: u32,
}

/// A macro body being replayed.
#[derive(Debug)]
pub struct MacroFrame {
    pub name: String,
    pub body: Rc<str>,
    pub pos: usize,
    /// Current line, counted within the defining file.
    pub line: u32,
    pub node: u32,
    pub args: Vec<Rc<str>>,
    pub shift: usize,
    pub unique: u32,
}

/// A REPT or FOR body being replayed.
#[derive(Debug)]
pub struct ReptFrame {
    pub body: Rc<str>,
    pub pos: usize,
    pub line: u32,
    pub body_line: u32,
    pub node: u32,
    /// Iterations left after the current one.
    pub remaining: u32,
    /// Current iteration, starting at 1.
    pub iter: u32,
    pub unique: u32,
    /// FOR loop variable, if any: name and per-iteration step.
    pub for_var: Option<ForVar>,
    /// Conditional-stack depth on entry; BREAK unwinds back to it.
    pub if_base: usize,
}

/// The loop variable of a FOR frame.
#[derive(Debug)]
pub struct ForVar {
    pub name: String,
    pub value: i32,
    pub step: i32,
}

/// One frame of the context stack.
#[derive(Debug)]
pub enum Frame {
    Include(IncludeFrame),
    Macro(MacroFrame),
    Rept(ReptFrame),
}

impl Frame {
    pub fn text(&self) -> &Rc<str> {
        match self {
            Frame::Include(f) => &f.text,
            Frame::Macro(f) => &f.body,
            Frame::Rept(f) => &f.body,
        }
    }

    pub fn pos(&self) -> usize {
        match self {
            Frame::Include(f) => f.pos,
            Frame::Macro(f) => f.pos,
            Frame::Rept(f) => f.pos,
        }
    }

    pub fn pos_mut(&mut self) -> &mut usize {
        match self {
            Frame::Include(f) => &mut f.pos,
            Frame::Macro(f) => &mut f.pos,
            Frame::Rept(f) => &mut f.pos,
        }
    }

    pub fn line(&self) -> u32 {
        match self {
            Frame::Include(f) => f.line,
            Frame::Macro(f) => f.line,
            Frame::Rept(f) => f.line,
        }
    }

    pub fn line_mut(&mut self) -> &mut u32 {
        match self {
            Frame::Include(f) => &mut f.line,
            Frame::Macro(f) => &mut f.line,
            Frame::Rept(f) => &mut f.line,
        }
    }

    pub fn node(&self) -> u32 {
        match self {
            Frame::Include(f) => f.node,
            Frame::Macro(f) => f.node,
            Frame::Rept(f) => f.node,
        }
    }

    fn display_name(&self) -> String {
        match self {
            Frame::Include(f) => f.path.display().to_string(),
            Frame::Macro(f) => format!("macro {}", f.name),
            Frame::Rept(f) => format!("rept ({})", f.iter),
        }
    }
}

/// A source position: a node-table index plus a line number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Loc {
    pub node: u32,
    pub line: u32,
}

/// The stack of lexical contexts plus the node table they generate.
#[derive(Debug)]
pub struct ContextStack {
    frames: Vec<Frame>,
    nodes: Vec<Node>,
    unique: u32,
    max_depth: usize,
}

impl ContextStack {
    pub fn new(max_depth: usize) -> ContextStack {
        ContextStack {
            frames: Vec::new(),
            nodes: Vec::new(),
            unique: 0,
            max_depth,
        }
    }

    /// The frame tokens are currently read from.
    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// The finished node table, for the object module.
    pub fn into_nodes(self) -> Vec<Node> {
        self.nodes
    }

    /// The position of the statement being processed.
    pub fn loc(&self) -> Loc {
        match self.frames.last() {
            Some(frame) => Loc {
                node: frame.node(),
                line: frame.line(),
            },
            None => Loc { node: 0, line: 0 },
        }
    }

    /// Render the active context chain, outermost first.
    pub fn location(&self) -> String {
        if self.frames.is_empty() {
            return String::from("<end of input>");
        }
        let mut out = String::new();
        for (i, frame) in self.frames.iter().enumerate() {
            if i != 0 {
                out.push_str(" -> ");
            }
            out.push_str(&frame.display_name());
            out.push_str(&format!("({})", frame.line()));
        }
        out
    }

    /// Allocate the next `\@` unique id.
    pub fn next_unique(&mut self) -> u32 {
        self.unique += 1;
        self.unique
    }

    fn parent_link(&self) -> Option<(u32, u32)> {
        self.frames.last().map(|f| (f.node(), f.line()))
    }

    fn push_node(&mut self, kind: NodeKind) -> u32 {
        let node = Node {
            parent: self.parent_link(),
            kind,
        };
        self.nodes.push(node);
        (self.nodes.len() - 1) as u32
    }

    fn check_depth(&self) -> Result<(), String> {
        if self.frames.len() >= self.max_depth {
            Err(format!(
                "recursion limit ({}) exceeded",
                self.max_depth
            ))
        } else {
            Ok(())
        }
    }

    /// Push a file frame; used for the root file and INCLUDE.
    pub fn push_file(&mut self, path: PathBuf, text: Rc<str>) -> Result<(), String> {
        self.check_depth()?;
        let node = self.push_node(NodeKind::File(path.display().to_string()));
        self.frames.push(Frame::Include(IncludeFrame {
            path,
            text,
            pos: 0,
            line: 1,
            node,
        }));
        Ok(())
    }

    /// Push a macro frame. `line` is the line of the MACRO directive in its
    /// defining file; the body starts on the next line.
    pub fn push_macro(
        &mut self,
        name: String,
        body: Rc<str>,
        body_line: u32,
        args: Vec<Rc<str>>,
    ) -> Result<(), String> {
        self.check_depth()?;
        let node = self.push_node(NodeKind::Macro(name.clone()));
        let unique = self.next_unique();
        self.frames.push(Frame::Macro(MacroFrame {
            name,
            body,
            pos: 0,
            line: body_line,
            node,
            args,
            shift: 0,
            unique,
        }));
        Ok(())
    }

    /// Push a REPT or FOR frame with `count` total iterations. `if_base`
    /// is the caller's conditional-stack depth, restored by BREAK.
    pub fn push_rept(
        &mut self,
        body: Rc<str>,
        body_line: u32,
        count: u32,
        for_var: Option<ForVar>,
        if_base: usize,
    ) -> Result<(), String> {
        debug_assert!(count > 0);
        self.check_depth()?;
        let iters = self.rept_iters(1);
        let node = self.push_node(NodeKind::Rept(iters));
        let unique = self.next_unique();
        self.frames.push(Frame::Rept(ReptFrame {
            body,
            pos: 0,
            line: body_line,
            body_line,
            node,
            remaining: count - 1,
            iter: 1,
            unique,
            for_var,
            if_base,
        }));
        Ok(())
    }

    /// The conditional-stack depth saved by the innermost REPT frame.
    pub fn rept_if_base(&self) -> Option<usize> {
        self.frames.iter().rev().find_map(|f| match f {
            Frame::Rept(r) => Some(r.if_base),
            _ => None,
        })
    }

    /// The iteration-number path for a new REPT node, outermost loop first.
    fn rept_iters(&self, innermost: u32) -> Vec<u32> {
        let mut iters: Vec<u32> = self
            .frames
            .iter()
            .filter_map(|f| match f {
                Frame::Rept(r) => Some(r.iter),
                _ => None,
            })
            .collect();
        iters.push(innermost);
        iters
    }

    /// Advance the top REPT frame to its next iteration. Returns `false`
    /// when the loop is exhausted (the caller pops the frame).
    pub fn advance_rept(&mut self) -> bool {
        match self.frames.last() {
            Some(Frame::Rept(rept)) if rept.remaining > 0 => {}
            _ => return false,
        }
        let unique = self.next_unique();
        let parent = match self.frames.len() {
            0 | 1 => None,
            len => {
                let below = &self.frames[len - 2];
                Some((below.node(), below.line()))
            }
        };
        let Some(Frame::Rept(rept)) = self.frames.last_mut() else {
            return false;
        };
        rept.remaining -= 1;
        rept.iter += 1;
        rept.pos = 0;
        rept.line = rept.body_line;
        rept.unique = unique;
        if let Some(var) = &mut rept.for_var {
            var.value = var.value.wrapping_add(var.step);
        }
        // Each iteration gets its own node so that patches created in
        // different iterations stay distinguishable.
        let path: Vec<u32> = self
            .frames
            .iter()
            .filter_map(|f| match f {
                Frame::Rept(r) => Some(r.iter),
                _ => None,
            })
            .collect();
        self.nodes.push(Node {
            parent,
            kind: NodeKind::Rept(path),
        });
        let idx = (self.nodes.len() - 1) as u32;
        if let Some(Frame::Rept(rept)) = self.frames.last_mut() {
            rept.node = idx;
        }
        true
    }

    /// Pop the top frame.
    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    /// Pop frames until a REPT frame has been discarded. Returns `false`
    /// if there is no REPT frame to break out of.
    pub fn break_rept(&mut self) -> bool {
        let has_rept = self
            .frames
            .iter()
            .any(|f| matches!(f, Frame::Rept(_)));
        if !has_rept {
            return false;
        }
        while let Some(frame) = self.frames.pop() {
            if matches!(frame, Frame::Rept(_)) {
                return true;
            }
        }
        false
    }

    /// The innermost macro frame, if any.
    pub fn macro_frame(&self) -> Option<&MacroFrame> {
        self.frames.iter().rev().find_map(|f| match f {
            Frame::Macro(m) => Some(m),
            _ => None,
        })
    }

    pub fn macro_frame_mut(&mut self) -> Option<&mut MacroFrame> {
        self.frames.iter_mut().rev().find_map(|f| match f {
            Frame::Macro(m) => Some(m),
            _ => None,
        })
    }

    /// The unique id `\@` expands to: the innermost macro or REPT frame's.
    pub fn unique_id(&self) -> Option<u32> {
        self.frames.iter().rev().find_map(|f| match f {
            Frame::Macro(m) => Some(m.unique),
            Frame::Rept(r) => Some(r.unique),
            _ => None,
        })
    }

    /// The FOR variable binding of the innermost REPT frame, if any:
    /// name, current value, and the iteration's unique id.
    pub fn for_binding(&self) -> Option<(&str, i32, u32)> {
        self.frames.iter().rev().find_map(|f| match f {
            Frame::Rept(r) => r
                .for_var
                .as_ref()
                .map(|v| (v.name.as_str(), v.value, r.unique)),
            _ => None,
        })
    }

    /// The innermost file frame; `__FILE__` and include-relative paths use
    /// this.
    pub fn file_frame(&self) -> Option<&IncludeFrame> {
        self.frames.iter().rev().find_map(|f| match f {
            Frame::Include(inc) => Some(inc),
            _ => None,
        })
    }

    /// Whether a macro of the given name is currently expanding; PURGE of
    /// such a macro is refused.
    pub fn macro_is_active(&self, name: &str) -> bool {
        self.frames.iter().any(|f| match f {
            Frame::Macro(m) => m.name == name,
            _ => false,
        })
    }
}
