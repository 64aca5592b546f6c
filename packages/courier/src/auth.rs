//! One-shot authentication exchange run right after the socket opens.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::ProtocolError;
use crate::protocol::{AuthData, AuthResponseData, Envelope, Meta};
use crate::timer::ScheduledTimer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// No handshake on this connection yet.
    Idle,
    Pending,
    Authenticated,
    Rejected,
}

/// What `handle_response` concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated,
    Rejected { reason: String },
    /// No handshake was pending; the response changes nothing.
    Ignored,
}

#[derive(Debug)]
pub struct AuthHandshake {
    credentials: Credentials,
    state: AuthState,
    response_timeout: Option<Duration>,
    timer: ScheduledTimer,
}

impl AuthHandshake {
    pub fn new(credentials: Credentials, response_timeout: Option<Duration>) -> Self {
        Self {
            credentials,
            state: AuthState::Idle,
            response_timeout,
            timer: ScheduledTimer::new(),
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == AuthState::Authenticated
    }

    /// The `auth` envelope for the configured credentials.
    pub fn auth_message(&self) -> Envelope {
        Envelope::Auth(AuthData {
            token: self.credentials.token.clone(),
            user_id: self.credentials.user_id.clone(),
            meta: Meta::new("Authentication request"),
        })
    }

    /// Start the handshake for a new connection. Returns `None` while one is
    /// already outstanding.
    pub fn begin(&mut self) -> Option<Envelope> {
        if self.state == AuthState::Pending {
            debug!("auth handshake already pending");
            return None;
        }
        self.state = AuthState::Pending;
        if let Some(timeout) = self.response_timeout {
            self.timer.schedule_in(timeout);
        }
        debug!(user_id = %self.credentials.user_id, "auth handshake started");
        Some(self.auth_message())
    }

    pub fn handle_response(
        &mut self,
        response: &AuthResponseData,
    ) -> Result<AuthOutcome, ProtocolError> {
        if self.state != AuthState::Pending {
            debug!(state = ?self.state, "auth response with no handshake pending");
            return Ok(AuthOutcome::Ignored);
        }

        if response.success {
            self.timer.cancel();
            self.state = AuthState::Authenticated;
            info!(user_id = %self.credentials.user_id, "authenticated");
            return Ok(AuthOutcome::Authenticated);
        }

        let Some(reason) = response.error.clone() else {
            // Leave the handshake pending; the timeout, if any, still applies.
            return Err(ProtocolError::MalformedAuthResponse(
                "success is false but no error was given".to_string(),
            ));
        };
        self.timer.cancel();
        self.state = AuthState::Rejected;
        warn!(reason = %reason, "authentication rejected");
        Ok(AuthOutcome::Rejected { reason })
    }

    /// Forget the current cycle. Called when the connection goes away.
    pub fn reset(&mut self) {
        self.timer.cancel();
        self.state = AuthState::Idle;
    }

    /// Resolves when a pending handshake has waited too long for its response.
    pub async fn timed_out(&mut self) {
        self.timer.fired().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, task};

    fn handshake(timeout: Option<Duration>) -> AuthHandshake {
        AuthHandshake::new(
            Credentials {
                token: "secret".into(),
                user_id: "ada".into(),
            },
            timeout,
        )
    }

    fn response(success: bool, error: Option<&str>) -> AuthResponseData {
        AuthResponseData {
            success,
            error: error.map(str::to_string),
            meta: Meta::default(),
        }
    }

    #[test]
    fn auth_message_carries_credentials() {
        match handshake(None).auth_message() {
            Envelope::Auth(data) => {
                assert_eq!(data.token, "secret");
                assert_eq!(data.user_id, "ada");
                assert_eq!(data.meta.content, "Authentication request");
            }
            other => panic!("expected auth, got {other:?}"),
        }
    }

    #[test]
    fn only_one_handshake_outstanding() {
        let mut auth = handshake(None);
        assert!(auth.begin().is_some());
        assert!(auth.begin().is_none());
    }

    #[test]
    fn success_flips_once() {
        let mut auth = handshake(None);
        auth.begin();
        assert_eq!(
            auth.handle_response(&response(true, None)).unwrap(),
            AuthOutcome::Authenticated
        );
        assert!(auth.is_authenticated());
        assert_eq!(
            auth.handle_response(&response(false, Some("late"))).unwrap(),
            AuthOutcome::Ignored
        );
        assert!(auth.is_authenticated());
    }

    #[test]
    fn rejection_carries_reason() {
        let mut auth = handshake(None);
        auth.begin();
        assert_eq!(
            auth.handle_response(&response(false, Some("bad token")))
                .unwrap(),
            AuthOutcome::Rejected {
                reason: "bad token".into()
            }
        );
        assert_eq!(auth.state(), AuthState::Rejected);
    }

    #[test]
    fn failure_without_error_is_malformed() {
        let mut auth = handshake(None);
        auth.begin();
        let err = auth.handle_response(&response(false, None)).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedAuthResponse(_)));
        assert_eq!(auth.state(), AuthState::Pending);
    }

    #[test]
    fn response_without_handshake_is_ignored() {
        let mut auth = handshake(None);
        assert_eq!(
            auth.handle_response(&response(true, None)).unwrap(),
            AuthOutcome::Ignored
        );
        assert!(!auth.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_while_pending() {
        let mut auth = handshake(Some(Duration::from_secs(10)));
        auth.begin();
        auth.timed_out().await;
        assert_eq!(auth.state(), AuthState::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn success_disarms_timeout() {
        let mut auth = handshake(Some(Duration::from_secs(10)));
        auth.begin();
        auth.handle_response(&response(true, None)).unwrap();
        let mut fut = task::spawn(auth.timed_out());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_pending!(fut.poll());
    }
}
