//! Conversation key derivation.
//!
//! A conversation key addresses both the rolling cache entry and the
//! durable-log query for one thread. Direct keys are order-independent;
//! direct and group keys carry different tags so the two spaces never meet.

use std::fmt;

use crate::types::{GroupId, MessageView, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConversationKey {
    /// Two participants, stored lowest id first.
    Direct { low: UserId, high: UserId },
    Group(GroupId),
}

impl ConversationKey {
    pub fn direct(a: &UserId, b: &UserId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self::Direct {
            low: low.clone(),
            high: high.clone(),
        }
    }

    pub fn group(group: &GroupId) -> Self {
        Self::Group(group.clone())
    }

    /// Key of the thread a stored message belongs to.
    pub fn of(view: &MessageView) -> Option<Self> {
        match (&view.receiver_id, &view.group_id) {
            (None, Some(group)) => Some(Self::group(group)),
            (Some(receiver), None) => Some(Self::direct(&view.sender_id, receiver)),
            _ => None,
        }
    }

    /// Flat string form, e.g. `dm:alice:bob` or `group:g1`.
    ///
    /// Ids never contain `:`, so the encoding is unambiguous.
    pub fn encode(&self) -> String {
        match self {
            Self::Direct { low, high } => format!("dm:{low}:{high}"),
            Self::Group(group) => format!("group:{group}"),
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    #[test]
    fn test_direct_key_is_commutative() {
        let pairs = [("alice", "bob"), ("b", "a"), ("z9", "Z9"), ("same", "same")];
        for (a, b) in pairs {
            let (a, b) = (user(a), user(b));
            assert_eq!(ConversationKey::direct(&a, &b), ConversationKey::direct(&b, &a));
            assert_eq!(
                ConversationKey::direct(&a, &b).encode(),
                ConversationKey::direct(&b, &a).encode()
            );
        }
    }

    #[test]
    fn test_distinct_pairs_do_not_collide() {
        let k1 = ConversationKey::direct(&user("ab"), &user("c"));
        let k2 = ConversationKey::direct(&user("a"), &user("bc"));
        assert_ne!(k1.encode(), k2.encode());
    }

    #[test]
    fn test_group_and_direct_spaces_are_disjoint() {
        let group = ConversationKey::group(&GroupId::parse("dm").unwrap());
        let direct = ConversationKey::direct(&user("dm"), &user("dm"));
        assert_ne!(group.encode(), direct.encode());
        assert_eq!(group.encode(), "group:dm");
        assert!(direct.encode().starts_with("dm:"));
    }
}
