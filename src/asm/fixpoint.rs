//! Fixed-point arithmetic intrinsics.
//!
//! Values are signed 32-bit integers read as Q(n).(32-n) with `n` in
//! `1..=31` (default 16). Trigonometric functions measure angles in turns:
//! a full circle is 1.0, not 2π.

/// The default fractional precision.
pub const DEFAULT_PRECISION: u8 = 16;

fn one(q: u8) -> f64 {
    (1u64 << q) as f64
}

fn to_f64(value: i32, q: u8) -> f64 {
    f64::from(value) / one(q)
}

fn from_f64(value: f64, q: u8) -> Result<i32, &'static str> {
    let scaled = value * one(q);
    if !scaled.is_finite() {
        return Err("fixed-point result is not a number");
    }
    if scaled >= -(i32::MIN as f64) || scaled < i32::MIN as f64 {
        return Err("fixed-point result is out of range");
    }
    Ok(scaled.round() as i32)
}

/// Multiply two Q values.
pub fn mul(a: i32, b: i32, q: u8) -> i32 {
    ((i64::from(a) * i64::from(b)) >> q) as i32
}

/// Divide two Q values.
pub fn div(a: i32, b: i32, q: u8) -> Result<i32, &'static str> {
    if b == 0 {
        return Err("division by zero");
    }
    let wide = (i64::from(a) << q) / i64::from(b);
    Ok(wide as i32)
}

/// Remainder of two Q values.
pub fn rem(a: i32, b: i32, _q: u8) -> Result<i32, &'static str> {
    if b == 0 {
        return Err("division by zero");
    }
    Ok((i64::from(a) % i64::from(b)) as i32)
}

/// Raise a Q value to a Q power.
///
/// Whole-number exponents go through exponentiation by squaring on the Q
/// representation; fractional exponents fall back to floating point.
pub fn pow(a: i32, b: i32, q: u8) -> Result<i32, &'static str> {
    let frac_mask = (1i32 << q) - 1;
    if b & frac_mask == 0 {
        let mut exp = b >> q;
        if exp < 0 {
            if a == 0 {
                return Err("division by zero");
            }
            let inverted = pow(a, (-exp) << q, q)?;
            return div(1 << q, inverted, q);
        }
        let mut base = a;
        let mut acc = 1i32 << q;
        while exp > 0 {
            if exp & 1 != 0 {
                acc = mul(acc, base, q);
            }
            base = mul(base, base, q);
            exp >>= 1;
        }
        return Ok(acc);
    }
    from_f64(to_f64(a, q).powf(to_f64(b, q)), q)
}

/// Logarithm of a Q value in a Q base.
pub fn log(a: i32, b: i32, q: u8) -> Result<i32, &'static str> {
    let value = to_f64(a, q);
    let base = to_f64(b, q);
    if value <= 0.0 {
        return Err("logarithm of a non-positive value");
    }
    if base <= 0.0 || base == 1.0 {
        return Err("logarithm in an invalid base");
    }
    from_f64(value.ln() / base.ln(), q)
}

/// Sine of a turn-measured Q angle.
pub fn sin(a: i32, q: u8) -> Result<i32, &'static str> {
    from_f64((to_f64(a, q) * core::f64::consts::TAU).sin(), q)
}

/// Cosine of a turn-measured Q angle.
pub fn cos(a: i32, q: u8) -> Result<i32, &'static str> {
    from_f64((to_f64(a, q) * core::f64::consts::TAU).cos(), q)
}

/// Tangent of a turn-measured Q angle.
pub fn tan(a: i32, q: u8) -> Result<i32, &'static str> {
    from_f64((to_f64(a, q) * core::f64::consts::TAU).tan(), q)
}

/// Arcsine, in turns.
pub fn asin(a: i32, q: u8) -> Result<i32, &'static str> {
    from_f64(to_f64(a, q).asin() / core::f64::consts::TAU, q)
}

/// Arccosine, in turns.
pub fn acos(a: i32, q: u8) -> Result<i32, &'static str> {
    from_f64(to_f64(a, q).acos() / core::f64::consts::TAU, q)
}

/// Arctangent, in turns.
pub fn atan(a: i32, q: u8) -> Result<i32, &'static str> {
    from_f64(to_f64(a, q).atan() / core::f64::consts::TAU, q)
}

/// Two-argument arctangent, in turns.
pub fn atan2(y: i32, x: i32, q: u8) -> Result<i32, &'static str> {
    from_f64(to_f64(y, q).atan2(to_f64(x, q)) / core::f64::consts::TAU, q)
}

/// Round a Q value to the nearest whole number.
pub fn round(a: i32, q: u8) -> i32 {
    let half = 1i64 << (q - 1);
    let mask = !((1i64 << q) - 1);
    ((i64::from(a) + half) & mask) as i32
}

/// Round a Q value up to a whole number.
pub fn ceil(a: i32, q: u8) -> i32 {
    let frac = (1i64 << q) - 1;
    ((i64::from(a) + frac) & !frac) as i32
}

/// Round a Q value down to a whole number.
pub fn floor(a: i32, q: u8) -> i32 {
    let frac = (1i64 << q) - 1;
    (i64::from(a) & !frac) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    const Q: u8 = 16;
    const ONE: i32 = 1 << Q;

    #[test]
    fn mul_div() {
        assert_eq!(mul(2 * ONE, 3 * ONE, Q), 6 * ONE);
        assert_eq!(div(ONE, 2 * ONE, Q).unwrap(), ONE / 2);
        assert!(div(ONE, 0, Q).is_err());
    }

    #[test]
    fn whole_powers_are_exact() {
        assert_eq!(pow(2 * ONE, 10 * ONE, Q).unwrap(), 1024 * ONE);
        assert_eq!(pow(2 * ONE, -ONE, Q).unwrap(), ONE / 2);
    }

    #[test]
    fn trig_is_turn_based() {
        // sin(0.25 turns) == 1.0
        assert_eq!(sin(ONE / 4, Q).unwrap(), ONE);
        // cos(0.5 turns) == -1.0
        assert_eq!(cos(ONE / 2, Q).unwrap(), -ONE);
    }

    #[test]
    fn rounding() {
        let half = ONE / 2;
        assert_eq!(round(ONE + half, Q), 2 * ONE);
        assert_eq!(ceil(ONE + 1, Q), 2 * ONE);
        assert_eq!(floor(2 * ONE - 1, Q), ONE);
        assert_eq!(floor(-1, Q), -ONE);
    }
}
