//! Tokens correlate an outgoing connection request with the inbound or
//! outbound TCP connection that eventually results from it (spec.md §3.4
//! invariant 4: tokens are unique across all live connection-requests).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::{error::Error, DownloadType, HintedUser, Token};

/// A connection request we've made (or had made to us) and are waiting to
/// be matched up with a live TCP connection.
#[derive(Clone, Debug)]
pub struct ExpectedConnection {
    pub user: HintedUser,
    pub download_type: DownloadType,
    pub requested_at: Instant,
}

/// Tracks outstanding tokens so an inbound connection can be matched back
/// to the request that caused it, and expires entries that went
/// unanswered for too long.
#[derive(Default)]
pub struct TokenRegistry {
    expected: HashMap<Token, ExpectedConnection>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        token: Token,
        user: HintedUser,
        download_type: DownloadType,
        now: Instant,
    ) -> Result<(), Error> {
        if self.expected.contains_key(&token) {
            return Err(Error::DuplicateToken(token));
        }
        self.expected.insert(
            token,
            ExpectedConnection {
                user,
                download_type,
                requested_at: now,
            },
        );
        Ok(())
    }

    pub fn take(&mut self, token: &str) -> Option<ExpectedConnection> {
        self.expected.remove(token)
    }

    pub fn contains(&self, token: &str) -> bool {
        self.expected.contains_key(token)
    }

    /// Drops entries older than `ttl`, returning the tokens removed so
    /// the caller can log or notify on them.
    pub fn expire(&mut self, ttl: Duration, now: Instant) -> Vec<Token> {
        let expired: Vec<Token> = self
            .expected
            .iter()
            .filter(|(_, c)| now.duration_since(c.requested_at) > ttl)
            .map(|(t, _)| t.clone())
            .collect();
        for token in &expired {
            self.expected.remove(token);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.expected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expected.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> HintedUser {
        HintedUser {
            user: crate::User {
                cid: crate::Cid([0; 24]),
                nick: "alice".to_owned(),
            },
            hub_url: "adc://hub".to_owned(),
        }
    }

    #[test]
    fn test_register_and_take() {
        let mut reg = TokenRegistry::new();
        reg.register("tok1".to_owned(), user(), DownloadType::Any, Instant::now()).unwrap();
        assert!(reg.contains("tok1"));
        let taken = reg.take("tok1");
        assert!(taken.is_some());
        assert!(!reg.contains("tok1"));
    }

    #[test]
    fn test_duplicate_token_rejected() {
        let mut reg = TokenRegistry::new();
        let now = Instant::now();
        reg.register("tok1".to_owned(), user(), DownloadType::Any, now).unwrap();
        let err = reg.register("tok1".to_owned(), user(), DownloadType::Any, now);
        assert!(err.is_err());
    }

    #[test]
    fn test_expire_drops_stale_entries() {
        let mut reg = TokenRegistry::new();
        let start = Instant::now();
        reg.register("tok1".to_owned(), user(), DownloadType::Any, start).unwrap();
        let later = start + Duration::from_secs(60);
        let expired = reg.expire(Duration::from_secs(30), later);
        assert_eq!(expired, vec!["tok1".to_owned()]);
        assert!(reg.is_empty());
    }
}
