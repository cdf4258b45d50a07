//! Decoder for the TLCP textual diff format.
//!
//! A diff is a string over `[A-Za-z]` plus literal payload. It encodes a
//! repeating `(copy, add, delete)` triple of counts, each count written as an
//! alphabetic varint: uppercase letters are base-26 digits (`A`=0 … `Z`=25),
//! a lowercase letter is the last digit (`a`=0 … `z`=25) and ends the number.
//! After an `add` count, that many characters of the diff itself are the
//! payload to append.
//!
//! ```rust
//! use tlcp_core::diff::apply_diff;
//!
//! // copy 3 ("abc"), add 2 ("XY"), delete 1 ("d"), copy 2 ("ef")
//! assert_eq!(apply_diff("abcdef", "dcXYbc").unwrap(), "abcXYef");
//! ```

use crate::error::{ProtocolError, ProtocolResult};

/// Apply `diff` to `base`, returning the reconstructed string.
///
/// # Errors
///
/// Returns [`ProtocolError::DiffDecode`] when a count contains a character
/// outside `A-Z`/`a-z`, when a copy or delete runs past the end of the base,
/// or when an add payload runs past the end of the diff.
pub fn apply_diff(base: &str, diff: &str) -> ProtocolResult<String> {
    DiffDecoder::new(base, diff).decode()
}

struct DiffDecoder {
    base: Vec<char>,
    diff: Vec<char>,
    base_pos: usize,
    diff_pos: usize,
    out: String,
}

impl DiffDecoder {
    fn new(base: &str, diff: &str) -> Self {
        Self {
            base: base.chars().collect(),
            diff: diff.chars().collect(),
            base_pos: 0,
            diff_pos: 0,
            out: String::with_capacity(base.len() + diff.len()),
        }
    }

    fn done(&self) -> bool {
        self.diff_pos >= self.diff.len()
    }

    fn decode(mut self) -> ProtocolResult<String> {
        loop {
            if self.done() {
                break;
            }
            let copy = self.decode_count()?;
            self.apply_copy(copy)?;
            if self.done() {
                break;
            }
            let add = self.decode_count()?;
            self.apply_add(add)?;
            if self.done() {
                break;
            }
            let delete = self.decode_count()?;
            self.apply_delete(delete)?;
        }
        Ok(self.out)
    }

    fn decode_count(&mut self) -> ProtocolResult<usize> {
        let start = self.diff_pos;
        let mut n: usize = 0;
        while let Some(&c) = self.diff.get(self.diff_pos) {
            self.diff_pos += 1;
            let (digit, last) = match c {
                'A'..='Z' => (c as usize - 'A' as usize, false),
                'a'..='z' => (c as usize - 'a' as usize, true),
                _ => return Err(self.error(self.diff_pos - 1, format!("unexpected '{c}' in count"))),
            };
            n = n
                .checked_mul(26)
                .and_then(|n| n.checked_add(digit))
                .ok_or_else(|| self.error(start, "count overflow"))?;
            if last {
                return Ok(n);
            }
        }
        Err(self.error(start, "count not terminated by a lowercase letter"))
    }

    fn apply_copy(&mut self, count: usize) -> ProtocolResult<()> {
        let end = self.base_pos + count;
        if end > self.base.len() {
            return Err(self.error(self.diff_pos, format!("copy of {count} past end of base")));
        }
        self.out.extend(&self.base[self.base_pos..end]);
        self.base_pos = end;
        Ok(())
    }

    fn apply_add(&mut self, count: usize) -> ProtocolResult<()> {
        let end = self.diff_pos + count;
        if end > self.diff.len() {
            return Err(self.error(self.diff_pos, format!("add of {count} past end of diff")));
        }
        self.out.extend(&self.diff[self.diff_pos..end]);
        self.diff_pos = end;
        Ok(())
    }

    fn apply_delete(&mut self, count: usize) -> ProtocolResult<()> {
        let end = self.base_pos + count;
        if end > self.base.len() {
            return Err(self.error(self.diff_pos, format!("delete of {count} past end of base")));
        }
        self.base_pos = end;
        Ok(())
    }

    fn error(&self, offset: usize, reason: impl Into<String>) -> ProtocolError {
        ProtocolError::DiffDecode {
            offset,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn single_letter_counts() {
        // copy 5 of "hello", add 6 " world"
        assert_eq!(apply_diff("hello", "fg world").unwrap(), "hello world");
    }

    #[test]
    fn multi_digit_counts() {
        // "Bd" = 1 * 26 + 3 = 29
        let base = "x".repeat(40);
        let out = apply_diff(&base, "Bd").unwrap();
        assert_eq!(out.len(), 29);
    }

    #[test]
    fn delete_then_copy() {
        // copy 0, add 0, delete 2, copy 3
        assert_eq!(apply_diff("abcde", "aacd").unwrap(), "cde");
    }

    #[test]
    fn empty_diff_yields_empty_string() {
        assert_eq!(apply_diff("anything", "").unwrap(), "");
    }

    #[test]
    fn payload_may_contain_any_character() {
        // copy 1, add 3 "1|2"
        assert_eq!(apply_diff("a", "bd1|2").unwrap(), "a1|2");
    }

    #[test]
    fn non_alphabetic_count_is_an_error() {
        assert_matches!(
            apply_diff("abc", "1a"),
            Err(ProtocolError::DiffDecode { offset: 0, .. })
        );
    }

    #[test]
    fn unterminated_count_is_an_error() {
        assert_matches!(apply_diff("abc", "AB"), Err(ProtocolError::DiffDecode { .. }));
    }

    #[test]
    fn copy_past_base_is_an_error() {
        assert_matches!(apply_diff("ab", "d"), Err(ProtocolError::DiffDecode { .. }));
    }

    #[test]
    fn add_past_diff_is_an_error() {
        assert_matches!(apply_diff("ab", "azxy"), Err(ProtocolError::DiffDecode { .. }));
    }

    #[test]
    fn multibyte_characters() {
        // copy 2 "żó", add 1 "ł", delete 1, copy 1
        assert_eq!(apply_diff("żółw", "cbłbb").unwrap(), "żółw");
    }
}
