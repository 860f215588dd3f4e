//! Service names for configure-by-name

use crate::error::{Result, SessionError};

/// Longest accepted name, NUL terminator excluded
pub const MAX_NAME_LEN: usize = 31;

/// A validated secure-world service name
///
/// 1 to 31 ASCII bytes, starting with a letter, made of letters, digits
/// and `,._+-`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceName(String);

impl ServiceName {
    pub fn new(name: &str) -> Result<Self> {
        let bytes = name.as_bytes();
        let first = *bytes.first().ok_or(SessionError::InvalidName { reason: "empty" })?;

        if bytes.len() > MAX_NAME_LEN {
            return Err(SessionError::InvalidName { reason: "too long" });
        }
        if !first.is_ascii_alphabetic() {
            return Err(SessionError::InvalidName {
                reason: "must start with a letter",
            });
        }
        if !bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || b",._+-".contains(b))
        {
            return Err(SessionError::InvalidName {
                reason: "invalid character",
            });
        }

        Ok(Self(name.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Bytes as written into shared memory
    pub fn to_bytes_with_nul(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.0.len() + 1);
        bytes.extend_from_slice(self.0.as_bytes());
        bytes.push(0);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        let longest = "k".repeat(MAX_NAME_LEN);
        for name in ["a", "crypto", "tee.storage-v2", "Key+Mgr,1_x", longest.as_str()] {
            assert!(ServiceName::new(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn test_invalid_names() {
        let too_long = "k".repeat(MAX_NAME_LEN + 1);
        for name in ["", "1abc", ".x", "has space", "slash/no", "é", too_long.as_str()] {
            assert!(
                matches!(ServiceName::new(name), Err(SessionError::InvalidName { .. })),
                "{name}"
            );
        }
    }

    #[test]
    fn test_nul_terminated() {
        let name = ServiceName::new("echo").unwrap();
        assert_eq!(name.to_bytes_with_nul(), b"echo\0");
        assert_eq!(name.as_str(), "echo");
    }
}
