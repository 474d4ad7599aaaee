// SPDX-License-Identifier: MPL-2.0

//! Utilities.
mod bytes;

pub(crate) use self::bytes::{ByteReader, ByteWriter};

/// Divides `a` by `b`, rounding up.
pub(crate) const fn ceil_div(a: u64, b: u64) -> u64 {
    a.div_ceil(b)
}
