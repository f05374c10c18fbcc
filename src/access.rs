//! Access Control Engine
//!
//! A pure function from an identity, a roll snapshot and the identity's
//! quota record to a [`Verdict`]. Rules are evaluated in a fixed order and
//! the first match wins:
//!
//! 1. administrators are always allowed;
//! 2. a blacklisted user is denied, whitelist or not;
//! 3. inside a blacklisted group everyone but administrators is denied;
//! 4. a whitelisted user is allowed;
//! 5. an expired access window is denied;
//! 6. an exhausted quota is denied unless the group is whitelisted;
//! 7. everything else is allowed.

use crate::identity::Identity;
use crate::quota::{is_expired, QuotaRecord};
use crate::roll::RollSet;
use chrono::{DateTime, Utc};

/// Outcome of an access check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// Request may proceed
    Allow,
    /// Sender is on the user blacklist
    DenyBlacklistedUser,
    /// Message came from a blacklisted group
    DenyBlacklistedGroup,
    /// Access window has closed
    DenyExpired,
    /// No uses left today
    DenyQuotaExhausted,
}

impl Verdict {
    /// Whether the request may proceed
    #[must_use]
    pub const fn is_allowed(self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Stable key of the user-facing message
    #[must_use]
    pub const fn message_key(self) -> &'static str {
        match self {
            Self::Allow => "access.allow",
            Self::DenyBlacklistedUser => "access.deny.blacklisted_user",
            Self::DenyBlacklistedGroup => "access.deny.blacklisted_group",
            Self::DenyExpired => "access.deny.expired",
            Self::DenyQuotaExhausted => "access.deny.quota_exhausted",
        }
    }

    /// Fixed text shown to the user
    #[must_use]
    pub const fn user_message(self) -> &'static str {
        match self {
            Self::Allow => "",
            Self::DenyBlacklistedUser => "⛔️ You are blacklisted and cannot use this service.",
            Self::DenyBlacklistedGroup => {
                "⛔️ This group is blacklisted and cannot use this service."
            }
            Self::DenyExpired => {
                "⛔️ Your access period has ended. Ask an administrator to renew it."
            }
            Self::DenyQuotaExhausted => {
                "⛔️ You have used all of today's generations. Come back tomorrow."
            }
        }
    }
}

/// Decides whether `identity` may submit a job
#[must_use]
pub fn evaluate(
    identity: &Identity,
    roll: &RollSet,
    record: &QuotaRecord,
    now: DateTime<Utc>,
) -> Verdict {
    if roll.is_admin(&identity.user_id) {
        return Verdict::Allow;
    }
    if roll.is_user_blacklisted(identity) {
        return Verdict::DenyBlacklistedUser;
    }
    let group = identity.group.as_ref().map(|g| g.name.as_str());
    if group.is_some_and(|name| roll.is_group_blacklisted(name)) {
        return Verdict::DenyBlacklistedGroup;
    }
    if roll.is_user_whitelisted(identity) {
        return Verdict::Allow;
    }
    if is_expired(record, now) {
        return Verdict::DenyExpired;
    }
    if record.remaining == 0 {
        if group.is_some_and(|name| roll.is_group_whitelisted(name)) {
            return Verdict::Allow;
        }
        return Verdict::DenyQuotaExhausted;
    }
    Verdict::Allow
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roll::RosterEntry;
    use chrono::Duration;

    fn record(remaining: u32, expire_in_days: i64) -> QuotaRecord {
        let now = Utc::now();
        QuotaRecord {
            nickname: "alice".into(),
            is_group: false,
            group_name: "direct".into(),
            default_limit: 10,
            remaining,
            expire_at: now + Duration::days(expire_in_days),
            updated_at: now,
            rollover_day: None,
        }
    }

    fn alice_in(group: &str) -> Identity {
        Identity::in_group("1", "alice", "-100", group)
    }

    #[test]
    fn test_admin_beats_blacklist() {
        let roll = RollSet {
            admins: vec![RosterEntry::named("1", "alice")],
            user_blacklist: vec![RosterEntry::token("alice")],
            group_blacklist: vec![RosterEntry::token("Spam")],
            ..RollSet::default()
        };
        let verdict = evaluate(&alice_in("Spam"), &roll, &record(0, -1), Utc::now());
        assert_eq!(verdict, Verdict::Allow);
    }

    #[test]
    fn test_blacklisted_user_denied_even_if_whitelisted() {
        let roll = RollSet {
            user_whitelist: vec![RosterEntry::token("1")],
            user_blacklist: vec![RosterEntry::token("alice")],
            ..RollSet::default()
        };
        let verdict = evaluate(
            &Identity::direct("1", "alice"),
            &roll,
            &record(5, 30),
            Utc::now(),
        );
        assert_eq!(verdict, Verdict::DenyBlacklistedUser);
    }

    #[test]
    fn test_whitelisted_user_in_blacklisted_group_denied() {
        let roll = RollSet {
            user_whitelist: vec![RosterEntry::token("alice")],
            group_blacklist: vec![RosterEntry::token("Spam")],
            ..RollSet::default()
        };
        let verdict = evaluate(&alice_in("Spam"), &roll, &record(5, 30), Utc::now());
        assert_eq!(verdict, Verdict::DenyBlacklistedGroup);
    }

    #[test]
    fn test_whitelisted_user_skips_expiry_and_quota() {
        let roll = RollSet {
            user_whitelist: vec![RosterEntry::token("alice")],
            ..RollSet::default()
        };
        let verdict = evaluate(&alice_in("Artists"), &roll, &record(0, -1), Utc::now());
        assert_eq!(verdict, Verdict::Allow);
    }

    #[test]
    fn test_whitelisted_group_rescues_exhausted_quota_only() {
        let roll = RollSet {
            group_whitelist: vec![RosterEntry::token("Artists")],
            ..RollSet::default()
        };
        let now = Utc::now();
        assert_eq!(
            evaluate(&alice_in("Artists"), &roll, &record(0, 30), now),
            Verdict::Allow
        );
        assert_eq!(
            evaluate(&alice_in("Artists"), &roll, &record(3, -1), now),
            Verdict::DenyExpired
        );
    }

    #[test]
    fn test_exhausted_and_default_outcomes() {
        let roll = RollSet::default();
        let alice = Identity::direct("1", "alice");
        let now = Utc::now();
        assert_eq!(
            evaluate(&alice, &roll, &record(0, 30), now),
            Verdict::DenyQuotaExhausted
        );
        assert_eq!(evaluate(&alice, &roll, &record(1, 30), now), Verdict::Allow);
        assert_eq!(
            evaluate(&alice, &roll, &record(0, -1), now),
            Verdict::DenyExpired
        );
    }

    #[test]
    fn test_every_denial_has_a_message() {
        for verdict in [
            Verdict::DenyBlacklistedUser,
            Verdict::DenyBlacklistedGroup,
            Verdict::DenyExpired,
            Verdict::DenyQuotaExhausted,
        ] {
            assert!(!verdict.is_allowed());
            assert!(verdict.message_key().starts_with("access.deny."));
            assert!(!verdict.user_message().is_empty());
        }
    }
}
