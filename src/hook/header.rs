//! Parser for the one-line manifest at the top of every hook source.
//!
//! The header looks like `; HOOK <name> ROffset <offset>`, where `<offset>` is the absolute file
//! offset the assembled hook is written to, in decimal or `0x` hexadecimal. Parsing is strict:
//! a wrong offset would corrupt unrelated code, so anything unexpected is an error.

use std::path::{Path, PathBuf};

use thiserror::Error;

use super::HookDescriptor;

/// Literal expected in the second token
const HOOK_KEYWORD: &str = "HOOK";
/// Literal expected in the fourth token
const OFFSET_KEYWORD: &str = "ROffset";

/// Errors when parsing a hook header
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    /// The header ended before the named token
    #[error("{}: hook header is missing token {position} (expected {expected})", .path.display())]
    MissingToken {
        /// Hook source the header came from
        path: PathBuf,
        /// Zero-based token position
        position: usize,
        /// Description of the token that should have been there
        expected: &'static str,
    },
    /// A literal token didn't match
    #[error("{}: hook header token {position} is `{found}` (expected `{expected}`)", .path.display())]
    UnexpectedToken {
        /// Hook source the header came from
        path: PathBuf,
        /// Zero-based token position
        position: usize,
        /// The literal that should have been there
        expected: &'static str,
        /// What was actually there
        found: String,
    },
    /// Something follows the offset
    #[error("{}: unexpected `{found}` after the hook offset", .path.display())]
    TrailingToken {
        /// Hook source the header came from
        path: PathBuf,
        /// First extra token
        found: String,
    },
    /// The offset isn't a decimal or `0x` hexadecimal integer that fits in 64 bits
    #[error("{}: hook offset `{found}` is not a decimal or 0x-prefixed hexadecimal integer", .path.display())]
    InvalidOffset {
        /// Hook source the header came from
        path: PathBuf,
        /// The offending token
        found: String,
    },
    /// The first line isn't text
    #[error("{}: hook header is not valid UTF-8", .path.display())]
    NotUtf8 {
        /// Hook source the header came from
        path: PathBuf,
    },
}

/// Parses the first line of the hook source at `source`
pub fn parse_header(first_line: &str, source: &Path) -> Result<HookDescriptor, HeaderError> {
    let mut tokens = first_line.split_whitespace();
    let mut next = |position: usize, expected: &'static str| {
        tokens.next().ok_or_else(|| HeaderError::MissingToken {
            path: source.to_path_buf(),
            position,
            expected,
        })
    };

    // the comment marker is never looked at
    next(0, "comment marker")?;
    expect_literal(next(1, HOOK_KEYWORD)?, 1, HOOK_KEYWORD, source)?;
    let name = next(2, "hook name")?.to_owned();
    expect_literal(next(3, OFFSET_KEYWORD)?, 3, OFFSET_KEYWORD, source)?;
    let raw_offset = next(4, "hook offset")?;

    if let Some(extra) = tokens.next() {
        return Err(HeaderError::TrailingToken {
            path: source.to_path_buf(),
            found: extra.to_owned(),
        });
    }

    let target_offset = parse_offset(raw_offset).ok_or_else(|| HeaderError::InvalidOffset {
        path: source.to_path_buf(),
        found: raw_offset.to_owned(),
    })?;

    Ok(HookDescriptor {
        name,
        target_offset,
        source_path: source.to_path_buf(),
    })
}

/// Checks a token against the literal it must equal
fn expect_literal(
    found: &str,
    position: usize,
    expected: &'static str,
    source: &Path,
) -> Result<(), HeaderError> {
    if found == expected {
        Ok(())
    } else {
        Err(HeaderError::UnexpectedToken {
            path: source.to_path_buf(),
            position,
            expected,
            found: found.to_owned(),
        })
    }
}

/// Parses an unsigned decimal or `0x`/`0X` prefixed hexadecimal integer.
///
/// Signs, separators and other radix prefixes are rejected.
fn parse_offset(token: &str) -> Option<u64> {
    let (digits, radix) = match token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
    {
        Some(hex) => (hex, 16),
        None => (token, 10),
    };

    // `from_str_radix` would let a leading `+` through
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    u64::from_str_radix(digits, radix).ok()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use crate::hook::header::{parse_header, HeaderError};

    /// Path used for every header in these tests
    fn source() -> &'static Path {
        Path::new("hook_Test.s")
    }

    #[test]
    /// Test a well-formed hexadecimal header
    fn test_hex() {
        let hook = parse_header("; HOOK test ROffset 0x100", source()).unwrap();

        assert_eq!(hook.name, "test");
        assert_eq!(hook.target_offset, 0x100);
        assert_eq!(hook.source_path, source());
    }

    #[test]
    /// Test a well-formed decimal header, with extra whitespace and a line ending
    fn test_decimal() {
        let hook = parse_header(";\tHOOK  LoadSavedGame   ROffset 4096\r\n", source()).unwrap();

        assert_eq!(hook.name, "LoadSavedGame");
        assert_eq!(hook.target_offset, 4096);
    }

    #[test]
    /// Tests uppercase hex prefixes and digits
    fn test_upper_hex() {
        let hook = parse_header("; HOOK Walls ROffset 0X6A1F2C", source()).unwrap();

        assert_eq!(hook.target_offset, 0x6a1f2c);
    }

    #[test]
    /// Tests every truncation of a header reports the first missing token
    fn test_missing_tokens() {
        let full = ["; ", "HOOK ", "test ", "ROffset ", "0x100"];
        for missing in 0..full.len() {
            let line: String = full[..missing].concat();
            match parse_header(&line, source()).unwrap_err() {
                HeaderError::MissingToken { position, .. } => assert_eq!(position, missing),
                e => panic!("unexpected error for {:?}: {}", line, e),
            }
        }
    }

    #[test]
    /// Tests a file that isn't a hook is rejected on the keyword
    fn test_not_a_hook() {
        let err = parse_header("; ext_sector code", source()).unwrap_err();

        assert_eq!(
            err,
            HeaderError::UnexpectedToken {
                path: source().to_path_buf(),
                position: 1,
                expected: "HOOK",
                found: "ext_sector".into(),
            }
        );
    }

    #[test]
    /// Tests the offset keyword is matched exactly
    fn test_wrong_offset_keyword() {
        let err = parse_header("; HOOK test Roffset 0x100", source()).unwrap_err();

        assert!(matches!(
            err,
            HeaderError::UnexpectedToken { position: 3, expected: "ROffset", .. }
        ));
    }

    #[test]
    /// Tests anything after the offset is an error
    fn test_trailing() {
        let err = parse_header("; HOOK test ROffset = 0x100", source()).unwrap_err();

        // `=` is taken as the offset and the real offset is left over
        assert_eq!(
            err,
            HeaderError::TrailingToken {
                path: source().to_path_buf(),
                found: "0x100".into(),
            }
        );
    }

    #[test]
    /// Tests malformed integers are rejected
    fn test_invalid_offsets() {
        for bad in [
            "0x", "0xg1", "+16", "-16", "1_000", "0b101", "12ab", "0x+10",
            // one past u64::MAX
            "18446744073709551616",
            "0x10000000000000000",
        ] {
            let line = format!("; HOOK test ROffset {}", bad);
            let err = parse_header(&line, source()).unwrap_err();
            assert!(
                matches!(err, HeaderError::InvalidOffset { ref found, .. } if found == bad),
                "{} was accepted as {:?}",
                bad,
                err
            );
        }
    }

    #[test]
    /// Test the error message names the file and the expected token
    fn test_message() {
        let err = parse_header("; HOOK test", source()).unwrap_err();

        assert_eq!(
            err.to_string(),
            "hook_Test.s: hook header is missing token 3 (expected ROffset)"
        );
    }
}
