//! Client Token Check
//!
//! Every tier accepts one shared token. Comparison runs over the full length
//! of both inputs so timing does not leak the matching prefix.

use crate::infrastructure::config::Secret;

/// Verifies tokens presented in client `auth` commands.
#[derive(Debug, Clone)]
pub struct TokenAuthenticator {
    token: Secret,
}

impl TokenAuthenticator {
    /// Accept clients presenting `token`.
    #[must_use]
    pub const fn new(token: Secret) -> Self {
        Self { token }
    }

    /// Whether `presented` matches the configured token.
    #[must_use]
    pub fn verify(&self, presented: &str) -> bool {
        let expected = self.token.expose().as_bytes();
        let presented = presented.as_bytes();
        let len = expected.len().max(presented.len());

        let mut diff = u8::from(expected.len() != presented.len());
        for i in 0..len {
            let a = expected.get(i).copied().unwrap_or(0);
            let b = presented.get(i).copied().unwrap_or(0);
            diff |= a ^ b;
        }
        diff == 0
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("secret", true ; "exact")]
    #[test_case("secreT", false ; "case differs")]
    #[test_case("secret2", false ; "longer")]
    #[test_case("secre", false ; "prefix")]
    #[test_case("", false ; "empty")]
    fn verifies_token(presented: &str, ok: bool) {
        let auth = TokenAuthenticator::new(Secret::new("secret"));
        assert_eq!(auth.verify(presented), ok);
    }
}
