//! Encodes the minimal Dalvik instruction sequence that loads a fixed
//! constant and returns it. Works entirely in 16-bit code units; the image
//! model splices the result into an existing code_item slot.

use thiserror::Error;

/* Dalvik opcodes emitted by the rewriter */
pub const OP_NOP: u16 = 0x00;
pub const OP_RETURN_VOID: u16 = 0x0e;
pub const OP_RETURN: u16 = 0x0f;
pub const OP_RETURN_WIDE: u16 = 0x10;
pub const OP_RETURN_OBJECT: u16 = 0x11;
pub const OP_CONST_4: u16 = 0x12;
pub const OP_CONST_16: u16 = 0x13;
pub const OP_CONST: u16 = 0x14;
pub const OP_CONST_HIGH16: u16 = 0x15;
pub const OP_CONST_WIDE_16: u16 = 0x16;
pub const OP_CONST_WIDE_32: u16 = 0x17;
pub const OP_CONST_WIDE: u16 = 0x18;
pub const OP_CONST_WIDE_HIGH16: u16 = 0x19;

/// Per-method patch failure. Non-fatal: the pipeline records these in the
/// outcome and moves on to the next matched method.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("unsupported return type '{0}'")]
    UnsupportedReturnType(String),
    #[error("instruction encoding failed: {0}")]
    Encoding(String),
}

/// Return-type class of a method, derived from its JNI return descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    Void,
    Boolean,
    Byte,
    Short,
    Char,
    Int,
    Long,
    Float,
    Double,
    Object,
    Array,
}

impl ReturnKind {
    pub fn from_descriptor(desc: &str) -> Result<ReturnKind, PatchError> {
        match desc.as_bytes().first() {
            Some(b'V') => Ok(ReturnKind::Void),
            Some(b'Z') => Ok(ReturnKind::Boolean),
            Some(b'B') => Ok(ReturnKind::Byte),
            Some(b'S') => Ok(ReturnKind::Short),
            Some(b'C') => Ok(ReturnKind::Char),
            Some(b'I') => Ok(ReturnKind::Int),
            Some(b'J') => Ok(ReturnKind::Long),
            Some(b'F') => Ok(ReturnKind::Float),
            Some(b'D') => Ok(ReturnKind::Double),
            Some(b'L') => Ok(ReturnKind::Object),
            Some(b'[') => Ok(ReturnKind::Array),
            _ => Err(PatchError::UnsupportedReturnType(desc.to_string())),
        }
    }

    /// Registers the replacement body needs: none for void, a pair for wides.
    pub fn register_demand(&self) -> u16 {
        match self {
            ReturnKind::Void => 0,
            ReturnKind::Long | ReturnKind::Double => 2,
            _ => 1,
        }
    }
}

/// Outcome a rewrite forces on the method: the category table decides which.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForcedValue {
    True,
    False,
}

impl ForcedValue {
    fn as_int(&self) -> i32 {
        match self {
            ForcedValue::True => 1,
            ForcedValue::False => 0,
        }
    }
}

/// Build the full replacement instruction stream for a method returning
/// `kind`, loading `forced` into register `reg` (and `reg + 1` for wides).
///
/// Constants are encoded with the narrowest opcode that fits and widened
/// automatically (`const/4` → `const/16` → `const`, and the wide family
/// likewise), so the value itself can never fail to encode.
pub fn encode_const_return(kind: ReturnKind, forced: ForcedValue, reg: u8) -> Result<Vec<u16>, PatchError> {
    let mut units = match kind {
        ReturnKind::Void => return Ok(vec![OP_RETURN_VOID]),
        ReturnKind::Boolean
        | ReturnKind::Byte
        | ReturnKind::Short
        | ReturnKind::Char
        | ReturnKind::Int => encode_const_narrow(reg, forced.as_int()),
        ReturnKind::Float => {
            let bits = match forced {
                ForcedValue::True => 1.0f32.to_bits() as i32,
                ForcedValue::False => 0,
            };
            encode_const_narrow(reg, bits)
        }
        ReturnKind::Long => encode_const_wide(reg, forced.as_int() as i64),
        ReturnKind::Double => {
            let bits = match forced {
                ForcedValue::True => 1.0f64.to_bits() as i64,
                ForcedValue::False => 0,
            };
            encode_const_wide(reg, bits)
        }
        // References cannot be conjured from a literal; null is the only
        // encodable constant for object and array returns.
        ReturnKind::Object | ReturnKind::Array => encode_const_narrow(reg, 0),
    };

    let ret_op = match kind {
        ReturnKind::Long | ReturnKind::Double => OP_RETURN_WIDE,
        ReturnKind::Object | ReturnKind::Array => OP_RETURN_OBJECT,
        _ => OP_RETURN,
    };
    units.push(ret_op | ((reg as u16) << 8));
    Ok(units)
}

/* format 11n: B|A|op */
fn encode_const_narrow(reg: u8, value: i32) -> Vec<u16> {
    if (-8..=7).contains(&value) {
        vec![OP_CONST_4 | ((reg as u16 & 0xF) << 8) | (((value as u16) & 0xF) << 12)]
    } else if (i16::MIN as i32..=i16::MAX as i32).contains(&value) {
        /* format 21s: AA|op BBBB */
        vec![OP_CONST_16 | ((reg as u16) << 8), value as u16]
    } else if value as u32 & 0xFFFF == 0 {
        /* format 21h: AA|op BBBB0000 */
        vec![OP_CONST_HIGH16 | ((reg as u16) << 8), ((value as u32) >> 16) as u16]
    } else {
        /* format 31i: AA|op BBBBlo BBBBhi */
        vec![
            OP_CONST | ((reg as u16) << 8),
            (value as u32 & 0xFFFF) as u16,
            ((value as u32) >> 16) as u16,
        ]
    }
}

fn encode_const_wide(reg: u8, value: i64) -> Vec<u16> {
    let aa = (reg as u16) << 8;
    if (i16::MIN as i64..=i16::MAX as i64).contains(&value) {
        /* format 21s */
        vec![OP_CONST_WIDE_16 | aa, value as u16]
    } else if (i32::MIN as i64..=i32::MAX as i64).contains(&value) {
        /* format 31i, sign-extended to 64 bits by the VM */
        vec![
            OP_CONST_WIDE_32 | aa,
            (value as u32 & 0xFFFF) as u16,
            ((value as u32) >> 16) as u16,
        ]
    } else if value as u64 & 0x0000_FFFF_FFFF_FFFF == 0 {
        /* format 21h: BBBB000000000000 */
        vec![OP_CONST_WIDE_HIGH16 | aa, ((value as u64) >> 48) as u16]
    } else {
        /* format 51l */
        let v = value as u64;
        vec![
            OP_CONST_WIDE | aa,
            (v & 0xFFFF) as u16,
            ((v >> 16) & 0xFFFF) as u16,
            ((v >> 32) & 0xFFFF) as u16,
            ((v >> 48) & 0xFFFF) as u16,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boolean_false_is_const4_return() {
        // const/4 v0, 0x0 ; return v0
        let units = encode_const_return(ReturnKind::Boolean, ForcedValue::False, 0).unwrap();
        assert_eq!(units, vec![0x0012, 0x000F]);
    }

    #[test]
    fn boolean_true_is_const4_return() {
        let units = encode_const_return(ReturnKind::Boolean, ForcedValue::True, 0).unwrap();
        assert_eq!(units, vec![0x1012, 0x000F]);
    }

    #[test]
    fn void_is_bare_return_void() {
        let units = encode_const_return(ReturnKind::Void, ForcedValue::True, 0).unwrap();
        assert_eq!(units, vec![0x000E]);
    }

    #[test]
    fn long_true_uses_wide_pair() {
        // const-wide/16 v0, 0x1 ; return-wide v0
        let units = encode_const_return(ReturnKind::Long, ForcedValue::True, 0).unwrap();
        assert_eq!(units, vec![0x0016, 0x0001, 0x0010]);
    }

    #[test]
    fn object_forces_null_reference() {
        let units = encode_const_return(ReturnKind::Object, ForcedValue::True, 0).unwrap();
        assert_eq!(units, vec![0x0012, 0x0011]);
    }

    #[test]
    fn float_true_is_high16_literal() {
        // 1.0f = 0x3F800000, low half zero, so const/high16 applies
        let units = encode_const_return(ReturnKind::Float, ForcedValue::True, 0).unwrap();
        assert_eq!(units, vec![0x0015, 0x3F80, 0x000F]);
    }

    #[test]
    fn double_true_is_wide_high16_literal() {
        // 1.0 = 0x3FF0000000000000
        let units = encode_const_return(ReturnKind::Double, ForcedValue::True, 0).unwrap();
        assert_eq!(units, vec![0x0019, 0x3FF0, 0x0010]);
    }

    #[test]
    fn narrow_widening_fallback() {
        assert_eq!(encode_const_narrow(1, 7), vec![0x7112]);
        assert_eq!(encode_const_narrow(1, 300), vec![0x0113, 300]);
        assert_eq!(encode_const_narrow(0, 0x0004_0001), vec![0x0014, 0x0001, 0x0004]);
        assert_eq!(encode_const_narrow(0, 0x7FFF_0000u32 as i32), vec![0x0015, 0x7FFF]);
    }

    #[test]
    fn wide_widening_fallback() {
        assert_eq!(encode_const_wide(0, 1), vec![0x0016, 1]);
        assert_eq!(encode_const_wide(0, 0x10_0000), vec![0x0017, 0x0000, 0x0010]);
        assert_eq!(
            encode_const_wide(0, 0x0001_0000_0001i64),
            vec![0x0018, 0x0001, 0x0000, 0x0001, 0x0000]
        );
    }

    #[test]
    fn descriptor_mapping() {
        assert_eq!(ReturnKind::from_descriptor("Z").unwrap(), ReturnKind::Boolean);
        assert_eq!(ReturnKind::from_descriptor("Ljava/lang/String;").unwrap(), ReturnKind::Object);
        assert_eq!(ReturnKind::from_descriptor("[[I").unwrap(), ReturnKind::Array);
        assert!(ReturnKind::from_descriptor("Q").is_err());
    }
}
