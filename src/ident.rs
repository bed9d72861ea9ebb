//! Identifier validation: node names, environment names/values, port ids.
//!
//! These are plain `String`/`u32` at the type level; validation is a
//! function applied at construction sites rather than a dedicated newtype
//! with its own parsing grammar (see `SPEC_FULL.md` Non-goals).

use crate::error::Error;

/// `A-Za-z0-9`, `-`, `_`, `+`. Mirrors the original's `name_chars_checker`.
fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '+'
}

/// A node name must be non-empty and every character must pass
/// [`is_name_char`].
pub fn validate_node_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || !name.chars().all(is_name_char) {
        return Err(Error::CharsetValidation {
            what: "node name",
            value: name.to_owned(),
        });
    }
    Ok(())
}

/// Environment variable names may not contain NUL or `=`.
pub fn validate_env_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.bytes().any(|b| b == 0 || b == b'=') {
        return Err(Error::CharsetValidation {
            what: "environment variable name",
            value: name.to_owned(),
        });
    }
    Ok(())
}

/// Environment variable values may not contain NUL.
pub fn validate_env_value(value: &str) -> Result<(), Error> {
    if value.bytes().any(|b| b == 0) {
        return Err(Error::CharsetValidation {
            what: "environment variable value",
            value: value.to_owned(),
        });
    }
    Ok(())
}

/// Port ids are small non-negative integers identifying a file descriptor
/// slot in a node's address space (0, 1, 2 are the conventional stdio
/// slots, but any `u32` is legal).
pub type PortId = u32;

pub const STDIN: PortId = 0;
pub const STDOUT: PortId = 1;
pub const STDERR: PortId = 2;
