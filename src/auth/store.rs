use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::token::{Token, TokenKind, TokenSet};

/// Session lifecycle. `Failed` is terminal and requires a fresh login.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Unauthenticated,
    Authenticating,
    Authenticated,
    Refreshing,
    Failed,
}

/// A point-in-time view of the authenticated session. Cheap to clone; the
/// token set behind it is immutable and shared.
#[derive(Clone, Debug)]
pub struct Session {
    pub state: SessionState,
    tokens: Option<Arc<TokenSet>>,
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Authenticated && self.tokens.is_some()
    }

    pub fn token(&self, kind: TokenKind) -> Option<Token> {
        self.tokens.as_ref().map(|set| set.get(kind))
    }

    pub fn expires_at(&self, kind: TokenKind) -> Option<DateTime<Utc>> {
        self.token(kind).map(|token| token.expires_at)
    }

    pub(crate) fn tokens(&self) -> Option<Arc<TokenSet>> {
        self.tokens.clone()
    }
}

#[derive(Default)]
struct Inner {
    state: SessionState,
    tokens: Option<Arc<TokenSet>>,
}

/// Single source of truth for "am I authenticated". All writes swap whole
/// values under a short-lived lock, so readers either see the pre-refresh
/// set or the post-refresh set, never a mix. The lock is never held across
/// network I/O; joining an in-flight refresh is the refresher's job.
#[derive(Default)]
pub struct CredentialStore {
    inner: RwLock<Inner>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> Session {
        let inner = self.inner.read().expect("credential store lock poisoned");
        Session {
            state: inner.state,
            tokens: inner.tokens.clone(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner
            .read()
            .expect("credential store lock poisoned")
            .state
    }

    pub fn get(&self, kind: TokenKind) -> Option<Token> {
        self.session().token(kind)
    }

    /// Replaces a single bearer token, leaving the rest of the set intact.
    /// The access-key triple only ever arrives through [`Self::replace`],
    /// so it has no single-token path.
    pub fn put(&self, token: Token) {
        if token.kind == TokenKind::AccessKey {
            warn!("access keys are replaced as part of a full refresh; ignoring put");
            return;
        }
        let mut inner = self.inner.write().expect("credential store lock poisoned");
        if let Some(current) = inner.tokens.as_ref() {
            let mut set = TokenSet::clone(current);
            match token.kind {
                TokenKind::Sso => set.sso = token,
                TokenKind::Saas => set.saas = token,
                TokenKind::Cognito => set.cognito = token,
                TokenKind::AccessKey => unreachable!(),
            }
            inner.tokens = Some(Arc::new(set));
        } else {
            warn!(kind = %token.kind, "no session to put token into");
        }
    }

    /// True when any held credential expires within `margin`. An empty
    /// store has nothing to refresh and reports false.
    pub fn expiring_within(&self, margin: Duration) -> bool {
        self.inner
            .read()
            .expect("credential store lock poisoned")
            .tokens
            .as_ref()
            .is_some_and(|set| set.expiring_within(margin))
    }

    pub(crate) fn snapshot(&self) -> Option<Arc<TokenSet>> {
        self.inner
            .read()
            .expect("credential store lock poisoned")
            .tokens
            .clone()
    }

    pub(crate) fn begin(&self, state: SessionState) {
        let mut inner = self.inner.write().expect("credential store lock poisoned");
        inner.state = state;
    }

    /// Publishes the outcome of a completed login/refresh cycle. The whole
    /// set becomes visible at once.
    pub(crate) fn replace(&self, set: TokenSet) {
        let mut inner = self.inner.write().expect("credential store lock poisoned");
        inner.tokens = Some(Arc::new(set));
        inner.state = SessionState::Authenticated;
        debug!("session tokens replaced");
    }

    /// A failed login leaves nothing usable behind.
    pub(crate) fn login_failed(&self) {
        let mut inner = self.inner.write().expect("credential store lock poisoned");
        inner.tokens = None;
        inner.state = SessionState::Failed;
    }

    /// A failed refresh keeps serving still-valid tokens; the session only
    /// becomes `Failed` once every held credential has actually expired.
    pub(crate) fn refresh_failed(&self) {
        let mut inner = self.inner.write().expect("credential store lock poisoned");
        let all_expired = inner
            .tokens
            .as_ref()
            .map_or(true, |set| set.fully_expired());
        inner.state = if all_expired {
            SessionState::Failed
        } else {
            SessionState::Authenticated
        };
    }
}
