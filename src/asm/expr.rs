//! Symbolic expressions: eager folding plus an RPN tail for the linker.
//!
//! Every expression carries a knownness bit. Folding happens the moment a
//! binary operator sees two known operands; anything else materializes both
//! sides into postfix ops and appends the operator, so the linker evaluates
//! exactly what the assembler could not. Arithmetic faults (division by
//! zero and friends) are deferred: they surface only when the value is
//! actually used.

use crate::asm::symbol::SymbolId;
use crate::diag::{Reporter, Warning};
use crate::rpn::{BinOp, RpnOp, UnOp};

/// A (possibly partially) evaluated expression.
#[derive(Debug, Clone)]
pub struct Expr {
    value: i32,
    known: bool,
    ops: Vec<RpnOp>,
    /// Symbols referenced by the RPN tail; used to veto PURGE.
    pub refs: Vec<SymbolId>,
    /// A deferred arithmetic fault.
    pub error: Option<String>,
}

impl Expr {
    /// A known constant.
    pub fn konst(value: i32) -> Expr {
        Expr {
            value,
            known: true,
            ops: Vec::new(),
            refs: Vec::new(),
            error: None,
        }
    }

    /// An unresolved expression from raw ops.
    pub fn from_ops(ops: Vec<RpnOp>, refs: Vec<SymbolId>) -> Expr {
        Expr {
            value: 0,
            known: false,
            ops,
            refs,
            error: None,
        }
    }

    /// A reference to an unresolved symbol.
    pub fn sym(id: SymbolId) -> Expr {
        Expr::from_ops(vec![RpnOp::Sym(id.0)], vec![id])
    }

    /// An expression whose evaluation already failed.
    pub fn fault(message: impl Into<String>) -> Expr {
        Expr {
            value: 0,
            known: false,
            ops: Vec::new(),
            refs: Vec::new(),
            error: Some(message.into()),
        }
    }

    /// Whether the value is known now.
    #[inline]
    pub fn is_known(&self) -> bool {
        self.known && self.error.is_none()
    }

    /// The folded value; meaningful only when [`Expr::is_known`].
    #[inline]
    pub fn value(&self) -> i32 {
        self.value
    }

    /// The value, or an error naming `what` for diagnostics.
    pub fn get_const(&self, what: &str) -> Result<i32, String> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        if !self.known {
            return Err(format!("{} must be a constant expression", what));
        }
        Ok(self.value)
    }

    /// Turn the expression into postfix ops for serialization.
    pub fn into_ops(self) -> Vec<RpnOp> {
        if self.known {
            vec![RpnOp::Const(self.value)]
        } else {
            self.ops
        }
    }

    /// Apply a binary operator, folding when possible.
    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        if let Some(error) = lhs.error.clone().or_else(|| rhs.error.clone()) {
            return Expr::fault(error);
        }
        if lhs.known && rhs.known {
            return match op.eval(lhs.value, rhs.value) {
                Ok(value) => Expr::konst(value),
                Err(fault) => Expr::fault(fault.to_string()),
            };
        }
        let mut ops = lhs.ops;
        if lhs.known {
            ops.push(RpnOp::Const(lhs.value));
        }
        let mut refs = lhs.refs;
        if rhs.known {
            ops.push(RpnOp::Const(rhs.value));
        } else {
            ops.extend(rhs.ops);
            refs.extend(rhs.refs);
        }
        ops.push(RpnOp::Binary(op));
        Expr::from_ops(ops, refs)
    }

    /// Apply a unary operator, folding when possible.
    pub fn unary(op: UnOp, inner: Expr) -> Expr {
        if inner.error.is_some() {
            return inner;
        }
        if inner.known {
            return Expr::konst(op.eval(inner.value));
        }
        let mut ops = inner.ops;
        ops.push(RpnOp::Unary(op));
        Expr::from_ops(ops, inner.refs)
    }

    /// Append a bare opcode (the HRAM/RST check tags).
    pub fn with_check(self, check: RpnOp) -> Expr {
        if self.error.is_some() {
            return self;
        }
        let refs = self.refs.clone();
        let mut ops = self.into_ops();
        ops.push(check);
        Expr::from_ops(ops, refs)
    }
}

/// Warn when a known value does not fit `bits`, the way every sized
/// emission site does: values a touch below the signed minimum still
/// produce the expected low bits and warn at level 1, anything further out
/// warns at level 2.
pub fn warn_truncation(
    value: i32,
    bits: u32,
    diag: &mut Reporter,
    loc: &str,
    what: &str,
) {
    if bits >= 32 {
        return;
    }
    let signed_min = -(1i64 << (bits - 1));
    let unsigned_max = (1i64 << bits) - 1;
    let value = i64::from(value);
    if (signed_min..=unsigned_max).contains(&value) {
        return;
    }
    let warning = if value >= -(1i64 << bits) && value < 1i64 << (bits + 1) {
        Warning::Truncation1
    } else {
        Warning::Truncation2
    };
    diag.warning(
        warning,
        loc,
        format!("{} ${:X} does not fit in {} bits", what, value, bits),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folding_is_eager() {
        let e = Expr::binary(BinOp::Mul, Expr::konst(6), Expr::konst(7));
        assert!(e.is_known());
        assert_eq!(e.value(), 42);
        assert!(e.into_ops() == vec![RpnOp::Const(42)]);
    }

    #[test]
    fn unknown_operands_serialize() {
        let sym = Expr::sym(SymbolId(3));
        let e = Expr::binary(BinOp::Add, sym, Expr::konst(1));
        assert!(!e.is_known());
        assert_eq!(
            e.into_ops(),
            vec![RpnOp::Sym(3), RpnOp::Const(1), RpnOp::Binary(BinOp::Add)]
        );
    }

    #[test]
    fn faults_are_deferred() {
        let e = Expr::binary(BinOp::Div, Expr::konst(1), Expr::konst(0));
        assert!(e.get_const("operand").is_err());
        // The fault survives further arithmetic.
        let e = Expr::binary(BinOp::Add, e, Expr::konst(1));
        assert!(e.get_const("operand").is_err());
    }
}
