//! Per-connection session state.

use crate::auth::AuthedUser;
use chrono::Utc;

/// Everything the namespace remembers about one authenticated socket.
#[derive(Debug, Clone)]
pub struct WsSession {
    pub user: AuthedUser,
    /// Request id assigned at connect; restored into the context for every
    /// event this socket triggers.
    pub request_id: String,
}

impl WsSession {
    pub fn new(user: AuthedUser) -> Self {
        Self {
            user,
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Token expiry is re-checked before every handler.
    pub fn token_expired(&self) -> bool {
        self.user.is_expired(Utc::now())
    }

    pub fn user_id(&self) -> i64 {
        self.user.user_id
    }

    pub fn user_name(&self) -> &str {
        &self.user.user_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn expiry_tracks_token_exp() {
        let live = WsSession::new(AuthedUser {
            user_id: 1,
            user_name: "ada".into(),
            expires_at: Utc::now() + Duration::hours(1),
        });
        assert!(!live.token_expired());

        let dead = WsSession::new(AuthedUser {
            user_id: 1,
            user_name: "ada".into(),
            expires_at: Utc::now() - Duration::seconds(1),
        });
        assert!(dead.token_expired());
    }
}
