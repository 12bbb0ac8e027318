//! Correlation tokens stamped on a request and echoed on its response.

use std::fmt;

use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};

/// Length of a generated token on the wire.
pub const TOKEN_LEN: usize = 64;

/// Opaque identifier matching a response to the request that produced it.
///
/// Generated from the thread-local CSPRNG, so collisions are improbable but
/// the value carries no authentication meaning. It is a routing key only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationToken(String);

impl CorrelationToken {
    /// Generate a fresh 64-character alphanumeric token.
    pub fn generate() -> Self {
        Self::generate_with_len(TOKEN_LEN)
    }

    pub fn generate_with_len(len: usize) -> Self {
        let token: String = rand::rng()
            .sample_iter(Alphanumeric)
            .take(len)
            .map(char::from)
            .collect();
        Self(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for log lines: the first eight characters.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for CorrelationToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_generated_token_shape() {
        let token = CorrelationToken::generate();
        assert_eq!(token.as_str().len(), TOKEN_LEN);
        assert!(token.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_generated_tokens_differ() {
        let tokens: HashSet<_> = (0..1000).map(|_| CorrelationToken::generate()).collect();
        assert_eq!(tokens.len(), 1000);
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let token = CorrelationToken::from("abc123");
        assert_eq!(serde_json::to_string(&token).unwrap(), r#""abc123""#);
        let back: CorrelationToken = serde_json::from_str(r#""abc123""#).unwrap();
        assert_eq!(back, token);
    }

    #[test]
    fn test_short_form() {
        assert_eq!(CorrelationToken::from("abcdefghijkl").short(), "abcdefgh");
        assert_eq!(CorrelationToken::from("abc").short(), "abc");
    }

    #[test]
    fn test_short_form_multibyte() {
        assert_eq!(CorrelationToken::from("aaaaaaa中").short(), "aaaaaaa中");
        assert_eq!(CorrelationToken::from("aaaaaaa中bc").short(), "aaaaaaa中");
        assert_eq!(CorrelationToken::from("令牌令牌令牌令牌令牌").short(), "令牌令牌令牌令牌");
    }
}
