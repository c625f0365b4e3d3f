//! Value semantics of arithmetic, logic and conversion instructions.
//!
//! Registers hold raw bit patterns zero-extended to 64 bits. Operations
//! interpret them according to the instruction type.

use ptx::{AtomOp, CmpOp, MulMode, Opcode, Type};

#[must_use]
pub fn truncate(value: u64, bits: u32) -> u64 {
    if bits >= 64 {
        value
    } else {
        value & ((1u64 << bits) - 1)
    }
}

#[must_use]
pub fn sign_extend(value: u64, bits: u32) -> i64 {
    if bits >= 64 {
        value as i64
    } else {
        let shift = 64 - bits;
        ((value << shift) as i64) >> shift
    }
}

fn f32_of(value: u64) -> f32 {
    f32::from_bits(value as u32)
}

fn f64_of(value: u64) -> f64 {
    f64::from_bits(value)
}

/// Width in bits of the value an instruction writes to its destination.
#[must_use]
pub fn result_bits(opcode: Opcode, ty: Type) -> u32 {
    match opcode {
        Opcode::Setp(_) => 1,
        Opcode::Mul(MulMode::Wide) | Opcode::Mad(MulMode::Wide) => (ty.bits() * 2).min(64),
        Opcode::Cvta { .. } => 64,
        _ => ty.bits(),
    }
}

macro_rules! float_op {
    ($ty:expr, $a:expr, $b:expr, |$x:ident, $y:ident| $body:expr) => {
        match $ty {
            Type::F32 => {
                let ($x, $y) = (f32_of($a), f32_of($b));
                u64::from(($body).to_bits())
            }
            _ => {
                let ($x, $y) = (f64_of($a), f64_of($b));
                ($body).to_bits()
            }
        }
    };
}

/// Two operand integer and floating point operations.
pub fn binary(opcode: Opcode, ty: Type, a: u64, b: u64) -> Result<u64, String> {
    let bits = ty.bits();
    if ty.is_float() {
        let value = match opcode {
            Opcode::Add => float_op!(ty, a, b, |x, y| x + y),
            Opcode::Sub => float_op!(ty, a, b, |x, y| x - y),
            Opcode::Mul(_) => float_op!(ty, a, b, |x, y| x * y),
            Opcode::Div => float_op!(ty, a, b, |x, y| x / y),
            Opcode::Rem => float_op!(ty, a, b, |x, y| x % y),
            Opcode::Min => float_op!(ty, a, b, |x, y| x.min(y)),
            Opcode::Max => float_op!(ty, a, b, |x, y| x.max(y)),
            other => return Err(format!("{other} is not defined for {ty}")),
        };
        return Ok(value);
    }

    let (sa, sb) = (sign_extend(a, bits), sign_extend(b, bits));
    let (ua, ub) = (truncate(a, bits), truncate(b, bits));
    let signed = ty.is_signed();
    let value = match opcode {
        Opcode::Add => ua.wrapping_add(ub),
        Opcode::Sub => ua.wrapping_sub(ub),
        Opcode::Mul(mode) => multiply(mode, ty, a, b)?,
        Opcode::Div | Opcode::Rem if ub == 0 => {
            return Err("integer division by zero".to_string());
        }
        Opcode::Div if signed => sa.wrapping_div(sb) as u64,
        Opcode::Div => ua / ub,
        Opcode::Rem if signed => sa.wrapping_rem(sb) as u64,
        Opcode::Rem => ua % ub,
        Opcode::Min if signed => sa.min(sb) as u64,
        Opcode::Min => ua.min(ub),
        Opcode::Max if signed => sa.max(sb) as u64,
        Opcode::Max => ua.max(ub),
        Opcode::And => ua & ub,
        Opcode::Or => ua | ub,
        Opcode::Xor => ua ^ ub,
        Opcode::Shl => {
            if ub >= u64::from(bits) {
                0
            } else {
                ua << ub
            }
        }
        Opcode::Shr if signed => {
            let amount = ub.min(u64::from(bits) - 1);
            (sa >> amount) as u64
        }
        Opcode::Shr => {
            if ub >= u64::from(bits) {
                0
            } else {
                ua >> ub
            }
        }
        other => return Err(format!("{other} is not a binary operation")),
    };
    Ok(truncate(value, result_bits(opcode, ty)))
}

fn multiply(mode: MulMode, ty: Type, a: u64, b: u64) -> Result<u64, String> {
    let bits = ty.bits();
    let product = if ty.is_signed() {
        i128::from(sign_extend(a, bits)) * i128::from(sign_extend(b, bits))
    } else {
        i128::from(truncate(a, bits)) * i128::from(truncate(b, bits))
    };
    let value = match mode {
        MulMode::Lo => product as u64,
        MulMode::Hi => (product >> bits) as u64,
        MulMode::Wide if bits > 32 => {
            return Err(format!("mul.wide is not defined for {ty}"));
        }
        MulMode::Wide => product as u64,
    };
    Ok(value)
}

/// `a * b + c`.
pub fn multiply_add(mode: MulMode, ty: Type, a: u64, b: u64, c: u64) -> Result<u64, String> {
    if ty.is_float() {
        let value = match ty {
            Type::F32 => u64::from(f32_of(a).mul_add(f32_of(b), f32_of(c)).to_bits()),
            _ => f64_of(a).mul_add(f64_of(b), f64_of(c)).to_bits(),
        };
        return Ok(value);
    }
    let product = multiply(mode, ty, a, b)?;
    let bits = result_bits(Opcode::Mad(mode), ty);
    Ok(truncate(product.wrapping_add(c), bits))
}

pub fn unary(opcode: Opcode, ty: Type, a: u64) -> Result<u64, String> {
    let bits = ty.bits();
    let value = match (opcode, ty) {
        (Opcode::Neg, Type::F32) => u64::from((-f32_of(a)).to_bits()),
        (Opcode::Neg, Type::F64) => (-f64_of(a)).to_bits(),
        (Opcode::Abs, Type::F32) => u64::from(f32_of(a).abs().to_bits()),
        (Opcode::Abs, Type::F64) => f64_of(a).abs().to_bits(),
        (Opcode::Not, ty) if ty.is_float() => {
            return Err(format!("not is not defined for {ty}"));
        }
        (Opcode::Neg, _) => (sign_extend(a, bits).wrapping_neg()) as u64,
        (Opcode::Abs, _) => sign_extend(a, bits).wrapping_abs() as u64,
        (Opcode::Not, Type::Pred) => u64::from(a & 1 == 0),
        (Opcode::Not, _) => !a,
        (other, _) => return Err(format!("{other} is not a unary operation")),
    };
    Ok(truncate(value, bits))
}

#[must_use]
pub fn compare(cmp: CmpOp, ty: Type, a: u64, b: u64) -> bool {
    use std::cmp::Ordering;
    let bits = ty.bits();
    let ordering = match ty {
        Type::F32 => f32_of(a).partial_cmp(&f32_of(b)),
        Type::F64 => f64_of(a).partial_cmp(&f64_of(b)),
        ty if ty.is_signed() => Some(sign_extend(a, bits).cmp(&sign_extend(b, bits))),
        _ => Some(truncate(a, bits).cmp(&truncate(b, bits))),
    };
    match (cmp, ordering) {
        // unordered operands only compare unequal
        (CmpOp::Ne, None) => true,
        (_, None) => false,
        (CmpOp::Eq, Some(ord)) => ord == Ordering::Equal,
        (CmpOp::Ne, Some(ord)) => ord != Ordering::Equal,
        (CmpOp::Lt, Some(ord)) => ord == Ordering::Less,
        (CmpOp::Le, Some(ord)) => ord != Ordering::Greater,
        (CmpOp::Gt, Some(ord)) => ord == Ordering::Greater,
        (CmpOp::Ge, Some(ord)) => ord != Ordering::Less,
    }
}

/// Convert `value` of type `from` into type `to`.
///
/// Float to integer conversions round towards zero and saturate.
#[must_use]
pub fn convert(to: Type, from: Type, value: u64) -> u64 {
    let bits = from.bits();
    let converted = match (from, to) {
        (Type::F32, Type::F32) | (Type::F64, Type::F64) => value,
        (Type::F32, Type::F64) => f64::from(f32_of(value)).to_bits(),
        (Type::F64, Type::F32) => u64::from((f64_of(value) as f32).to_bits()),
        (Type::F32 | Type::F64, to) => {
            let float = if from == Type::F32 {
                f64::from(f32_of(value))
            } else {
                f64_of(value)
            };
            if to.is_signed() {
                let (min, max) = signed_bounds(to.bits());
                (float.trunc().clamp(min as f64, max as f64) as i64) as u64
            } else {
                let max = truncate(u64::MAX, to.bits());
                float.trunc().clamp(0.0, max as f64) as u64
            }
        }
        (from, Type::F32) if from.is_signed() => {
            u64::from((sign_extend(value, bits) as f32).to_bits())
        }
        (from, Type::F64) if from.is_signed() => (sign_extend(value, bits) as f64).to_bits(),
        (_, Type::F32) => u64::from((truncate(value, bits) as f32).to_bits()),
        (_, Type::F64) => (truncate(value, bits) as f64).to_bits(),
        (from, _) if from.is_signed() => sign_extend(value, bits) as u64,
        _ => truncate(value, bits),
    };
    truncate(converted, to.bits())
}

fn signed_bounds(bits: u32) -> (i64, i64) {
    if bits >= 64 {
        (i64::MIN, i64::MAX)
    } else {
        let max = (1i64 << (bits - 1)) - 1;
        (-max - 1, max)
    }
}

/// New memory value of an atomic read-modify-write.
pub fn atomic(op: AtomOp, ty: Type, old: u64, b: u64, c: u64) -> Result<u64, String> {
    let bits = ty.bits();
    let value = match op {
        AtomOp::Add => binary(Opcode::Add, ty, old, b)?,
        AtomOp::Min => binary(Opcode::Min, ty, old, b)?,
        AtomOp::Max => binary(Opcode::Max, ty, old, b)?,
        AtomOp::Exch => b,
        AtomOp::Cas if truncate(old, bits) == truncate(b, bits) => c,
        AtomOp::Cas => old,
        AtomOp::And => old & b,
        AtomOp::Or => old | b,
        AtomOp::Xor => old ^ b,
    };
    Ok(truncate(value, bits))
}

#[cfg(test)]
mod tests {
    use super::*;
    use color_eyre::eyre;
    use similar_asserts as diff;

    fn f32_bits(value: f32) -> u64 {
        u64::from(value.to_bits())
    }

    #[test]
    fn test_integer_arithmetic_wraps() -> eyre::Result<()> {
        let add = binary(Opcode::Add, Type::U32, u64::from(u32::MAX), 2).map_err(eyre::Report::msg)?;
        diff::assert_eq!(have: add, want: 1);
        let sub = binary(Opcode::Sub, Type::S32, 0, 1).map_err(eyre::Report::msg)?;
        diff::assert_eq!(have: sub, want: u64::from(u32::MAX));
        diff::assert_eq!(have: sign_extend(sub, 32), want: -1);
        Ok(())
    }

    #[test]
    fn test_signed_division_and_shift() -> eyre::Result<()> {
        let minus_seven = truncate((-7i64) as u64, 32);
        let div = binary(Opcode::Div, Type::S32, minus_seven, 2).map_err(eyre::Report::msg)?;
        diff::assert_eq!(have: sign_extend(div, 32), want: -3);
        let rem = binary(Opcode::Rem, Type::S32, minus_seven, 2).map_err(eyre::Report::msg)?;
        diff::assert_eq!(have: sign_extend(rem, 32), want: -1);
        let shr = binary(Opcode::Shr, Type::S32, minus_seven, 40).map_err(eyre::Report::msg)?;
        diff::assert_eq!(have: sign_extend(shr, 32), want: -1);
        let shr = binary(Opcode::Shr, Type::U32, minus_seven, 40).map_err(eyre::Report::msg)?;
        diff::assert_eq!(have: shr, want: 0);
        Ok(())
    }

    #[test]
    fn test_division_by_zero() {
        assert!(binary(Opcode::Div, Type::U32, 1, 0).is_err());
        assert!(binary(Opcode::Rem, Type::S64, 1, 0).is_err());
        // floats follow IEEE semantics
        let inf = binary(Opcode::Div, Type::F32, f32_bits(1.0), f32_bits(0.0));
        diff::assert_eq!(have: inf, want: Ok(f32_bits(f32::INFINITY)));
    }

    #[test]
    fn test_multiply_modes() -> eyre::Result<()> {
        let a = u64::from(u32::MAX);
        let wide = binary(Opcode::Mul(MulMode::Wide), Type::U32, a, 2).map_err(eyre::Report::msg)?;
        diff::assert_eq!(have: wide, want: 2 * a);
        let lo = binary(Opcode::Mul(MulMode::Lo), Type::U32, a, 2).map_err(eyre::Report::msg)?;
        diff::assert_eq!(have: lo, want: a - 1);
        let hi = binary(Opcode::Mul(MulMode::Hi), Type::U32, a, 2).map_err(eyre::Report::msg)?;
        diff::assert_eq!(have: hi, want: 1);
        let mad = multiply_add(MulMode::Wide, Type::S32, truncate((-2i64) as u64, 32), 3, 10)
            .map_err(eyre::Report::msg)?;
        diff::assert_eq!(have: mad, want: 4);
        assert!(binary(Opcode::Mul(MulMode::Wide), Type::U64, 1, 1).is_err());
        Ok(())
    }

    #[test]
    fn test_compare() {
        let minus_one = truncate(u64::MAX, 32);
        assert!(compare(CmpOp::Lt, Type::S32, minus_one, 0));
        assert!(!compare(CmpOp::Lt, Type::U32, minus_one, 0));
        assert!(compare(CmpOp::Ge, Type::F32, f32_bits(2.5), f32_bits(2.5)));
        let nan = f32_bits(f32::NAN);
        assert!(!compare(CmpOp::Eq, Type::F32, nan, nan));
        assert!(compare(CmpOp::Ne, Type::F32, nan, nan));
    }

    #[test]
    fn test_convert() {
        diff::assert_eq!(have: convert(Type::S64, Type::S32, truncate(u64::MAX, 32)), want: u64::MAX);
        diff::assert_eq!(have: convert(Type::U64, Type::U32, truncate(u64::MAX, 32)), want: u64::from(u32::MAX));
        diff::assert_eq!(have: convert(Type::F32, Type::S32, truncate((-3i64) as u64, 32)), want: f32_bits(-3.0));
        diff::assert_eq!(have: convert(Type::S32, Type::F32, f32_bits(-3.7)), want: truncate((-3i64) as u64, 32));
        diff::assert_eq!(have: convert(Type::U8, Type::F32, f32_bits(300.0)), want: 255);
        diff::assert_eq!(have: convert(Type::F64, Type::F32, f32_bits(0.5)), want: 0.5f64.to_bits());
    }

    #[test]
    fn test_atomic_updates() -> eyre::Result<()> {
        let update = |op, old, b, c| atomic(op, Type::U32, old, b, c).map_err(eyre::Report::msg);
        diff::assert_eq!(have: update(AtomOp::Add, 5, 3, 0)?, want: 8);
        diff::assert_eq!(have: update(AtomOp::Cas, 5, 5, 9)?, want: 9);
        diff::assert_eq!(have: update(AtomOp::Cas, 5, 4, 9)?, want: 5);
        diff::assert_eq!(have: update(AtomOp::Exch, 5, 1, 0)?, want: 1);
        diff::assert_eq!(have: update(AtomOp::Max, 5, 7, 0)?, want: 7);
        let min = atomic(AtomOp::Min, Type::S32, 5, truncate((-1i64) as u64, 32), 0)
            .map_err(eyre::Report::msg)?;
        diff::assert_eq!(have: sign_extend(min, 32), want: -1);
        Ok(())
    }

    #[test]
    fn test_unary() -> eyre::Result<()> {
        let neg = unary(Opcode::Neg, Type::S32, 5).map_err(eyre::Report::msg)?;
        diff::assert_eq!(have: sign_extend(neg, 32), want: -5);
        diff::assert_eq!(have: unary(Opcode::Not, Type::Pred, 1), want: Ok(0));
        diff::assert_eq!(have: unary(Opcode::Not, Type::B8, 0x0f), want: Ok(0xf0));
        diff::assert_eq!(have: unary(Opcode::Abs, Type::F32, f32_bits(-2.0)), want: Ok(f32_bits(2.0)));
        Ok(())
    }
}
