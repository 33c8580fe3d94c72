use std::fmt::{Display, Formatter};

/// Half the 16-bit sequence number space. A `relate` result below this means 'ahead', above
///  it 'behind'; it is also the width of the reliable acceptance window (any wider and the
///  wrap-around becomes ambiguous).
pub const SEQ_WINDOW: u16 = 1 << 15;

/// A 16-bit wrapping sequence number, scoped to one sequence channel.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct SeqNr(u16);

impl Display for SeqNr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNr {
    pub const ZERO: SeqNr = SeqNr(0);

    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    /// The following sequence number, wrapping after 0xFFFF.
    pub fn next(&self) -> SeqNr {
        SeqNr(self.0.wrapping_add(1))
    }

    /// `(self - other) mod 2^16`: 0 means equal, `1..SEQ_WINDOW` means `self` is ahead of
    ///  `other` by that many, anything above means `self` is (modularly) behind.
    ///
    /// All sequence comparisons go through this - raw comparison operators are meaningless
    ///  once the counter wraps.
    pub fn relate(&self, other: SeqNr) -> u16 {
        self.0.wrapping_sub(other.0)
    }

    /// strictly ahead of `other`, i.e. `relate` is in the 'ahead' half of the space
    pub fn is_ahead_of(&self, other: SeqNr) -> bool {
        let d = self.relate(other);
        d != 0 && d < SEQ_WINDOW
    }
}
