use core::fmt;

/// Wrap `value` to a two's complement integer of `bits` width, sign-extended to 64 bits
#[inline]
pub fn wrap(bits: u8, value: i128) -> i64 {
    match bits {
        8 => value as i8 as i64,
        16 => value as i16 as i64,
        32 => value as i32 as i64,
        _ => value as i64,
    }
}

/// The smallest signed value representable in `bits`
#[inline]
pub const fn min_value(bits: u8) -> i64 {
    if bits >= 64 { i64::MIN } else { -(1i64 << (bits - 1)) }
}

/// The largest signed value representable in `bits`
#[inline]
pub const fn max_value(bits: u8) -> i64 {
    if bits >= 64 { i64::MAX } else { (1i64 << (bits - 1)) - 1 }
}

/// The static type and value range of a node
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Stamp {
    /// The node does not produce a value
    Void,
    /// A boolean condition
    Logic,
    /// A reference, possibly proven non-null
    Object { non_null: bool },
    Int(IntegerStamp),
}

impl Stamp {
    /// An unrestricted integer of the given width
    #[inline]
    pub fn int(bits: u8) -> Self {
        Self::Int(IntegerStamp::full(bits))
    }

    #[inline]
    pub fn constant(bits: u8, value: i64) -> Self {
        Self::Int(IntegerStamp::constant(bits, value))
    }

    /// The stamp of an array length: a non-negative 32-bit integer
    #[inline]
    pub fn array_length() -> Self {
        Self::Int(IntegerStamp::new(32, 0, i32::MAX as i64))
    }

    #[inline]
    pub fn object() -> Self {
        Self::Object { non_null: false }
    }

    #[inline]
    pub fn as_int(&self) -> Option<&IntegerStamp> {
        match self {
            Self::Int(stamp) => Some(stamp),
            _ => None,
        }
    }

    #[inline]
    pub fn is_int(&self) -> bool {
        matches!(self, Self::Int(_))
    }

    /// The least upper bound of two stamps
    pub fn meet(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Self::Int(a.meet(b)),
            (Self::Object { non_null: a }, Self::Object { non_null: b }) => Self::Object {
                non_null: *a && *b,
            },
            (a, b) if a == b => *a,
            (a, _) => *a,
        }
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => f.write_str("void"),
            Self::Logic => f.write_str("logic"),
            Self::Object { non_null: true } => f.write_str("object!"),
            Self::Object { non_null: false } => f.write_str("object"),
            Self::Int(stamp) => fmt::Display::fmt(stamp, f),
        }
    }
}

/// A signed integer range `[lower, upper]` of a given bit width
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct IntegerStamp {
    bits: u8,
    lower: i64,
    upper: i64,
}

impl IntegerStamp {
    pub fn new(bits: u8, lower: i64, upper: i64) -> Self {
        debug_assert!(lower <= upper, "invalid integer stamp [{lower}, {upper}]");
        Self {
            bits,
            lower: lower.max(min_value(bits)),
            upper: upper.min(max_value(bits)),
        }
    }

    #[inline]
    pub fn full(bits: u8) -> Self {
        Self {
            bits,
            lower: min_value(bits),
            upper: max_value(bits),
        }
    }

    #[inline]
    pub fn constant(bits: u8, value: i64) -> Self {
        let value = wrap(bits, value as i128);
        Self {
            bits,
            lower: value,
            upper: value,
        }
    }

    #[inline(always)]
    pub const fn bits(&self) -> u8 {
        self.bits
    }

    #[inline(always)]
    pub const fn lower(&self) -> i64 {
        self.lower
    }

    #[inline(always)]
    pub const fn upper(&self) -> i64 {
        self.upper
    }

    #[inline]
    pub fn as_constant(&self) -> Option<i64> {
        (self.lower == self.upper).then_some(self.lower)
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.lower == min_value(self.bits) && self.upper == max_value(self.bits)
    }

    #[inline]
    pub fn contains(&self, value: i64) -> bool {
        self.lower <= value && value <= self.upper
    }

    #[inline]
    pub fn is_strictly_positive(&self) -> bool {
        self.lower > 0
    }

    #[inline]
    pub fn is_positive(&self) -> bool {
        self.lower >= 0
    }

    #[inline]
    pub fn is_strictly_negative(&self) -> bool {
        self.upper < 0
    }

    pub fn meet(&self, other: &Self) -> Self {
        let bits = self.bits.max(other.bits);
        Self {
            bits,
            lower: self.lower.min(other.lower),
            upper: self.upper.max(other.upper),
        }
    }

    /// Build a stamp from a wide range, falling back to the full range if it does not fit
    fn from_wide(bits: u8, lower: i128, upper: i128) -> Self {
        if lower < min_value(bits) as i128 || upper > max_value(bits) as i128 {
            Self::full(bits)
        } else {
            Self {
                bits,
                lower: lower as i64,
                upper: upper as i64,
            }
        }
    }

    pub fn add(&self, other: &Self) -> Self {
        Self::from_wide(
            self.bits,
            self.lower as i128 + other.lower as i128,
            self.upper as i128 + other.upper as i128,
        )
    }

    pub fn sub(&self, other: &Self) -> Self {
        Self::from_wide(
            self.bits,
            self.lower as i128 - other.upper as i128,
            self.upper as i128 - other.lower as i128,
        )
    }

    pub fn mul(&self, other: &Self) -> Self {
        let candidates = [
            self.lower as i128 * other.lower as i128,
            self.lower as i128 * other.upper as i128,
            self.upper as i128 * other.lower as i128,
            self.upper as i128 * other.upper as i128,
        ];
        let lower = candidates.iter().copied().min().unwrap_or(0);
        let upper = candidates.iter().copied().max().unwrap_or(0);
        Self::from_wide(self.bits, lower, upper)
    }

    pub fn neg(&self) -> Self {
        Self::from_wide(self.bits, -(self.upper as i128), -(self.lower as i128))
    }

    pub fn min(&self, other: &Self) -> Self {
        Self {
            bits: self.bits,
            lower: self.lower.min(other.lower),
            upper: self.upper.min(other.upper),
        }
    }

    pub fn max(&self, other: &Self) -> Self {
        Self {
            bits: self.bits,
            lower: self.lower.max(other.lower),
            upper: self.upper.max(other.upper),
        }
    }

    pub fn div(&self, other: &Self) -> Self {
        if other.lower > 0 && self.lower >= 0 {
            Self {
                bits: self.bits,
                lower: self.lower / other.upper,
                upper: self.upper / other.lower,
            }
        } else {
            Self::full(self.bits)
        }
    }

    /// Returns `Some(result)` if `self < other` is decided by the ranges alone
    pub fn fold_less_than(&self, other: &Self) -> Option<bool> {
        if self.upper < other.lower {
            Some(true)
        } else if self.lower >= other.upper {
            Some(false)
        } else {
            None
        }
    }

    /// Returns `Some(result)` if unsigned `self < other` is decided by the ranges alone
    pub fn fold_below(&self, other: &Self) -> Option<bool> {
        if self.is_positive() && other.is_positive() {
            return self.fold_less_than(other);
        }
        if other.is_positive() && self.is_strictly_negative() {
            // A negative value is a huge unsigned value, larger than any non-negative one
            return Some(false);
        }
        None
    }

    /// Returns `Some(result)` if `self == other` is decided by the ranges alone
    pub fn fold_equals(&self, other: &Self) -> Option<bool> {
        match (self.as_constant(), other.as_constant()) {
            (Some(x), Some(y)) => Some(x == y),
            _ if self.upper < other.lower || other.upper < self.lower => Some(false),
            _ => None,
        }
    }
}

impl fmt::Display for IntegerStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_full() {
            write!(f, "i{}", self.bits)
        } else if let Some(value) = self.as_constant() {
            write!(f, "i{} {value}", self.bits)
        } else {
            write!(f, "i{} [{}, {}]", self.bits, self.lower, self.upper)
        }
    }
}
