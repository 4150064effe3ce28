//! Named mutual-exclusion locks with TTL and refresh.

use crate::store::{Database, StoreResult};
use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension};

/// Fencing token proving lock ownership. Extend/release are no-ops when
/// the token no longer matches (the lock expired and someone else won).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

#[derive(Clone)]
pub struct LockService {
    db: Database,
}

impl LockService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Try to take the named lock for `ttl`. Returns `None` when another
    /// holder's lease is still live.
    pub fn acquire(&self, name: &str, ttl: Duration) -> StoreResult<Option<LockToken>> {
        let token = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires_at = (now + ttl).to_rfc3339();

        self.db.with_conn(|conn| {
            // Reap an expired lease first so set-if-absent can win.
            conn.execute(
                "DELETE FROM locks WHERE name = ?1 AND expires_at < ?2",
                params![name, now.to_rfc3339()],
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO locks (name, token, expires_at) VALUES (?1, ?2, ?3)",
                params![name, token, expires_at],
            )?;
            let holder: Option<String> = conn
                .query_row(
                    "SELECT token FROM locks WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(holder.filter(|h| *h == token).map(LockToken))
        })
    }

    /// Renew the lease. Returns false if the token no longer holds the lock.
    pub fn extend(&self, name: &str, token: &LockToken, ttl: Duration) -> StoreResult<bool> {
        let expires_at = (Utc::now() + ttl).to_rfc3339();
        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE locks SET expires_at = ?1 WHERE name = ?2 AND token = ?3",
                params![expires_at, name, token.0],
            )?;
            Ok(updated == 1)
        })
    }

    /// Release the lock. No-op if not held by this token.
    pub fn release(&self, name: &str, token: &LockToken) -> StoreResult<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM locks WHERE name = ?1 AND token = ?2",
                params![name, token.0],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> LockService {
        LockService::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let locks = service();
        let token = locks.acquire("scan", Duration::seconds(60)).unwrap().unwrap();
        assert!(locks.acquire("scan", Duration::seconds(60)).unwrap().is_none());

        locks.release("scan", &token).unwrap();
        assert!(locks.acquire("scan", Duration::seconds(60)).unwrap().is_some());
    }

    #[test]
    fn expired_lease_can_be_stolen() {
        let locks = service();
        let stale = locks.acquire("scan", Duration::seconds(-5)).unwrap().unwrap();

        let fresh = locks.acquire("scan", Duration::seconds(60)).unwrap();
        assert!(fresh.is_some());

        // The old holder's token no longer extends or releases anything.
        assert!(!locks.extend("scan", &stale, Duration::seconds(60)).unwrap());
    }

    #[test]
    fn extend_renews_only_for_holder() {
        let locks = service();
        let token = locks.acquire("scan", Duration::seconds(60)).unwrap().unwrap();
        assert!(locks.extend("scan", &token, Duration::seconds(120)).unwrap());

        let other = LockToken("not-the-holder".into());
        assert!(!locks.extend("scan", &other, Duration::seconds(120)).unwrap());
    }

    #[test]
    fn locks_are_independent_by_name() {
        let locks = service();
        let _a = locks.acquire("a", Duration::seconds(60)).unwrap().unwrap();
        assert!(locks.acquire("b", Duration::seconds(60)).unwrap().is_some());
    }
}
