//! Partial-reveal masking for secrets that appear in diagnostics.
//!
//! Masked output is for humans reading logs. It must never feed a
//! security decision.

use std::fmt;

/// Mask a token, revealing a length-dependent prefix and suffix.
///
/// | length | output |
/// |---|---|
/// | 16+ | first 8 + `***` + last 5 |
/// | 13-15 | first 6 + `***` + last 4 |
/// | 11-12 | first 4 + `***` + last 4 |
/// | 9-10 | first 3 + `***` + last 3 |
/// | 8 | first 2 + `***` + last 3 |
/// | 5-7 | first 1 + `***` + last 1 |
/// | 4 | first 1 + `***` |
/// | 1-3 | `***` |
/// | 0 | `(empty)` |
///
/// Lengths are counted in characters, so multi-byte input never splits.
pub fn mask(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    let (head, tail) = match chars.len() {
        0 => return "(empty)".to_string(),
        1..=3 => return "***".to_string(),
        4 => (1, 0),
        5..=7 => (1, 1),
        8 => (2, 3),
        9..=10 => (3, 3),
        11..=12 => (4, 4),
        13..=15 => (6, 4),
        _ => (8, 5),
    };

    let mut out = String::with_capacity(head + tail + 3);
    out.extend(&chars[..head]);
    out.push_str("***");
    out.extend(&chars[chars.len() - tail..]);
    out
}

/// Display adapter that renders its value through [`mask`].
///
/// This is the only way secret text is allowed into a log message.
#[derive(Clone, Copy)]
pub struct Masked<'a>(&'a str);

impl<'a> Masked<'a> {
    pub fn new(value: &'a str) -> Self {
        Self(value)
    }
}

impl fmt::Display for Masked<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&mask(self.0))
    }
}

impl fmt::Debug for Masked<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Masked({})", mask(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_table() {
        assert_eq!(mask(""), "(empty)");
        assert_eq!(mask("a"), "***");
        assert_eq!(mask("abc"), "***");
        assert_eq!(mask("abcd"), "a***");
        assert_eq!(mask("abcde"), "a***e");
        assert_eq!(mask("abcdefg"), "a***g");
        assert_eq!(mask("abcdefgh"), "ab***fgh");
        assert_eq!(mask("abcdefghi"), "abc***ghi");
        assert_eq!(mask("abcdefghij"), "abc***hij");
        assert_eq!(mask("abcdefghijk"), "abcd***hijk");
        assert_eq!(mask("abcdefghijkl"), "abcd***ijkl");
        assert_eq!(mask("abcdefghijklm"), "abcdef***jklm");
        assert_eq!(mask("abcdefghijklmno"), "abcdef***lmno");
        assert_eq!(mask("abcdefghijklmnop"), "abcdefgh***lmnop");
    }

    #[test]
    fn test_mask_long_token_hides_middle() {
        let token = "vk1.a.0123456789abcdefghijklmnopqrstuvwxyz";
        let masked = mask(token);
        assert_eq!(masked, "vk1.a.01***vwxyz");
        assert!(!masked.contains("abcdefghijklmnop"));
    }

    #[test]
    fn test_mask_multibyte() {
        assert_eq!(mask("ключ"), "к***");
        assert_eq!(mask("секретик"), "се***тик");
    }

    #[test]
    fn test_masked_display() {
        assert_eq!(Masked::new("abcdefghijklmnop").to_string(), "abcdefgh***lmnop");
        assert_eq!(format!("{:?}", Masked::new("abcd")), "Masked(a***)");
    }
}
