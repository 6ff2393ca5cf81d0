//! Rank keys — fractional indexing for draw order.
//!
//! DESIGN
//! ======
//! A rank is an integer part followed by an optional fractional part, both
//! spelled in the base-62 alphabet `0-9A-Za-z` whose ASCII order equals its
//! digit order. The head character of the integer part encodes the integer's
//! length (`a`..`z` are 2..27 chars and non-negative, `A`..`Z` are 27..2
//! chars and negative), so byte-wise string comparison is numeric comparison
//! and the derived `Ord` on [`Rank`] is the draw order.
//!
//! Appending at either end bumps the integer part, which keeps keys short
//! for the common "new object on top" case. Inserting between two keys
//! takes a midpoint of the fractional parts; a fractional part never ends in
//! `0`, which is what guarantees a key always exists strictly between two
//! distinct keys.
//!
//! Equal inputs to [`between`] are rejected. Breaking a tie between
//! duplicate keys is the caller's job.

use std::fmt;

use serde::{Deserialize, Serialize};

const DIGITS: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const BASE: usize = 62;
const ZERO: u8 = b'0';
const TOP_DIGIT: u8 = b'z';

/// `A` followed by 26 zeros: the smallest integer part. Not a valid key on
/// its own because nothing could be generated before it.
const SMALLEST_INTEGER: &str = "A00000000000000000000000000";

/// The first key handed out in an empty space.
const INITIAL: &str = "a0";

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RankError {
    #[error("invalid rank key: {0:?}")]
    Invalid(String),
    #[error("rank {lower} is not below {upper}")]
    NotOrdered { lower: String, upper: String },
    #[error("rank space exhausted next to {0}")]
    Exhausted(String),
}

/// Opaque, totally ordered draw-order key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rank(String);

impl Rank {
    /// Key used for the first object in an empty space.
    #[must_use]
    pub fn initial() -> Self {
        Self(INITIAL.to_owned())
    }

    /// Parse and validate a key, e.g. one read back from durable storage.
    ///
    /// # Errors
    ///
    /// Returns [`RankError::Invalid`] if the key is malformed.
    pub fn parse(key: &str) -> Result<Self, RankError> {
        validate(key.as_bytes()).map_err(|()| RankError::Invalid(key.to_owned()))?;
        Ok(Self(key.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn integer_part(&self) -> &[u8] {
        let bytes = self.0.as_bytes();
        let len = bytes
            .first()
            .and_then(|head| integer_length(*head))
            .unwrap_or(bytes.len());
        &bytes[..len.min(bytes.len())]
    }

    fn fraction_part(&self) -> &[u8] {
        &self.0.as_bytes()[self.integer_part().len()..]
    }

    fn from_bytes(bytes: Vec<u8>) -> Result<Self, RankError> {
        let key = String::from_utf8(bytes).map_err(|e| RankError::Invalid(e.to_string()))?;
        Self::parse(&key)
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Rank {
    type Error = RankError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Rank> for String {
    fn from(rank: Rank) -> Self {
        rank.0
    }
}

// =============================================================================
// GENERATION
// =============================================================================

/// Generate a key strictly between `lower` and `upper`.
///
/// # Errors
///
/// Returns [`RankError::NotOrdered`] unless `lower < upper`.
pub fn between(lower: &Rank, upper: &Rank) -> Result<Rank, RankError> {
    if lower >= upper {
        return Err(RankError::NotOrdered { lower: lower.to_string(), upper: upper.to_string() });
    }

    let (ia, fa) = (lower.integer_part(), lower.fraction_part());
    let (ib, fb) = (upper.integer_part(), upper.fraction_part());

    if ia == ib {
        return Rank::from_bytes(concat(ia, &midpoint(fa, Some(fb))));
    }

    let next = increment_integer(ia).ok_or_else(|| RankError::Exhausted(lower.to_string()))?;
    if next.as_slice() < upper.0.as_bytes() {
        return Rank::from_bytes(next);
    }
    Rank::from_bytes(concat(ia, &midpoint(fa, None)))
}

/// Generate a key strictly greater than `lower`.
///
/// # Errors
///
/// Only fails if `lower` was built around the validation in [`Rank::parse`].
pub fn after(lower: &Rank) -> Result<Rank, RankError> {
    let (ia, fa) = (lower.integer_part(), lower.fraction_part());
    match increment_integer(ia) {
        Some(next) => Rank::from_bytes(next),
        None => Rank::from_bytes(concat(ia, &midpoint(fa, None))),
    }
}

/// Generate a key strictly less than `upper`.
///
/// # Errors
///
/// Returns [`RankError::Exhausted`] if no integer part remains below `upper`.
pub fn before(upper: &Rank) -> Result<Rank, RankError> {
    let (ib, fb) = (upper.integer_part(), upper.fraction_part());

    if ib == SMALLEST_INTEGER.as_bytes() {
        return Rank::from_bytes(concat(ib, &midpoint(&[], Some(fb))));
    }
    if ib.len() < upper.0.len() {
        // Dropping the fraction lands just below `upper`.
        return Rank::from_bytes(ib.to_vec());
    }
    let prev = decrement_integer(ib).ok_or_else(|| RankError::Exhausted(upper.to_string()))?;
    Rank::from_bytes(prev)
}

/// Generate a key strictly between optional bounds. `None` means open-ended.
///
/// # Errors
///
/// Same as [`between`], [`after`] and [`before`].
pub fn between_bounds(lower: Option<&Rank>, upper: Option<&Rank>) -> Result<Rank, RankError> {
    match (lower, upper) {
        (None, None) => Ok(Rank::initial()),
        (Some(lower), None) => after(lower),
        (None, Some(upper)) => before(upper),
        (Some(lower), Some(upper)) => between(lower, upper),
    }
}

// =============================================================================
// DIGIT ARITHMETIC
// =============================================================================

fn digit_value(c: u8) -> Option<usize> {
    match c {
        b'0'..=b'9' => Some(usize::from(c - b'0')),
        b'A'..=b'Z' => Some(usize::from(c - b'A') + 10),
        b'a'..=b'z' => Some(usize::from(c - b'a') + 36),
        _ => None,
    }
}

fn integer_length(head: u8) -> Option<usize> {
    match head {
        b'a'..=b'z' => Some(usize::from(head - b'a') + 2),
        b'A'..=b'Z' => Some(usize::from(b'Z' - head) + 2),
        _ => None,
    }
}

fn validate(key: &[u8]) -> Result<(), ()> {
    let head = *key.first().ok_or(())?;
    let int_len = integer_length(head).ok_or(())?;
    if int_len > key.len() || key == SMALLEST_INTEGER.as_bytes() {
        return Err(());
    }
    if key[1..].iter().any(|c| digit_value(*c).is_none()) {
        return Err(());
    }
    if key.len() > int_len && key.last() == Some(&ZERO) {
        return Err(());
    }
    Ok(())
}

fn concat(integer: &[u8], fraction: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(integer.len() + fraction.len());
    out.extend_from_slice(integer);
    out.extend_from_slice(fraction);
    out
}

/// Midpoint of two fractional parts, `b = None` standing for 1.0.
///
/// Requires `a < b` and neither ending in `0`.
fn midpoint(a: &[u8], b: Option<&[u8]>) -> Vec<u8> {
    if let Some(b) = b {
        // Strip the common prefix, reading missing digits of `a` as zero.
        let shared = b
            .iter()
            .enumerate()
            .take_while(|(i, c)| a.get(*i).copied().unwrap_or(ZERO) == **c)
            .count();
        if shared > 0 {
            let rest_a = a.get(shared..).unwrap_or(&[]);
            return concat(&b[..shared], &midpoint(rest_a, Some(&b[shared..])));
        }
    }

    let digit_a = a.first().and_then(|c| digit_value(*c)).unwrap_or(0);
    let digit_b = b
        .and_then(|b| b.first())
        .and_then(|c| digit_value(*c))
        .unwrap_or(BASE);

    if digit_b > digit_a + 1 {
        return vec![DIGITS[(digit_a + digit_b).div_ceil(2)]];
    }

    // Consecutive leading digits.
    if let Some(b) = b
        && b.len() > 1
    {
        return vec![b[0]];
    }
    let mut out = vec![DIGITS[digit_a]];
    out.extend(midpoint(a.get(1..).unwrap_or(&[]), None));
    out
}

fn increment_integer(integer: &[u8]) -> Option<Vec<u8>> {
    let (&head, digits) = integer.split_first()?;
    let mut digits = digits.to_vec();

    let mut carry = true;
    for digit in digits.iter_mut().rev() {
        let next = digit_value(*digit)? + 1;
        if next == BASE {
            *digit = ZERO;
        } else {
            *digit = DIGITS[next];
            carry = false;
            break;
        }
    }

    if !carry {
        return Some(concat(&[head], &digits));
    }
    match head {
        b'Z' => Some(vec![b'a', ZERO]),
        b'z' => None,
        _ => {
            let next_head = head + 1;
            if next_head > b'a' {
                digits.push(ZERO);
            } else {
                digits.pop();
            }
            Some(concat(&[next_head], &digits))
        }
    }
}

fn decrement_integer(integer: &[u8]) -> Option<Vec<u8>> {
    let (&head, digits) = integer.split_first()?;
    let mut digits = digits.to_vec();

    let mut borrow = true;
    for digit in digits.iter_mut().rev() {
        match digit_value(*digit)? {
            0 => *digit = TOP_DIGIT,
            value => {
                *digit = DIGITS[value - 1];
                borrow = false;
                break;
            }
        }
    }

    if !borrow {
        return Some(concat(&[head], &digits));
    }
    match head {
        b'a' => Some(vec![b'Z', TOP_DIGIT]),
        b'A' => None,
        _ => {
            let prev_head = head - 1;
            if prev_head < b'Z' {
                digits.push(TOP_DIGIT);
            } else {
                digits.pop();
            }
            Some(concat(&[prev_head], &digits))
        }
    }
}

#[cfg(test)]
#[path = "rank_test.rs"]
mod tests;
