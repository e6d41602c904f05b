//! Accounts: the unit of ownership in the world state.
//!
//! Accounts reference each other (referrer) and topics by id/key, never by
//! pointer; the arenas live in `WorldState`.

use std::collections::HashSet;

use lib_crypto::b64_decode;

/// The special account (id 0) that receives orphan fees and funds the
/// per-block miner subsidy.
pub const RESERVE_FUND_ACCOUNT_ID: u64 = 0;

/// The root account created at genesis (id 1); the first referrer.
pub const ROOT_ACCOUNT_ID: u64 = 1;

/// Most topics an account may have open at once.
pub const MAX_OWNED_TOPICS: usize = 100;

/// Most foreign topics an account may participate in at once.
pub const MAX_JOINED_TOPICS: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub id: u64,
    pub name: String,
    pub pubkey: String,
    pub avatar: u64,
    pub balance: u64,
    /// Referrer account id; `None` marks a root account, whose fee share
    /// goes to the reserve fund instead.
    pub referrer: Option<u64>,
    /// Keys of topics this account created and that are still open.
    pub owned_topics: Vec<String>,
    /// Keys of foreign topics this account has replied in.
    pub joined_topics: HashSet<String>,
    /// Units reserved by admitted mempool transactions from this account.
    pub uv_spend: u64,
    /// Topic slots reserved by admitted mempool topic creations.
    pub uv_topic: u64,
    /// Join slots reserved by admitted mempool replies to foreign topics.
    pub uv_join_topic: u64,
}

impl Account {
    pub fn new(id: u64, name: String, pubkey: String, avatar: u64, referrer: Option<u64>) -> Self {
        Self {
            id,
            name,
            pubkey,
            avatar,
            balance: 0,
            referrer,
            owned_topics: Vec::new(),
            joined_topics: HashSet::new(),
            uv_spend: 0,
            uv_topic: 0,
            uv_join_topic: 0,
        }
    }

    /// Balance not claimed by mempool reservations.
    pub fn free_balance(&self) -> u64 {
        self.balance.saturating_sub(self.uv_spend)
    }
}

/// Account-name rule: 4–20 base64 characters whose decoded form is 1–15
/// bytes and contains no whitespace byte.
pub fn valid_account_name(name: &str) -> bool {
    if name.len() < 4 || name.len() > 20 || !lib_crypto::is_base64_string(name) {
        return false;
    }

    let Ok(decoded) = b64_decode(name) else {
        return false;
    };

    if decoded.is_empty() || decoded.len() > 15 {
        return false;
    }

    !decoded.iter().any(|b| b.is_ascii_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_crypto::b64_encode;

    #[test]
    fn name_rule() {
        assert!(valid_account_name(&b64_encode(b"alice")));
        assert!(valid_account_name(&b64_encode(b"bob1")));

        // decodes to bytes containing a space
        assert!(!valid_account_name(&b64_encode(b"a lice")));
        // too short / too long at the base64 level
        assert!(!valid_account_name("abc"));
        assert!(!valid_account_name(&"A".repeat(24)));
        // decoded form too long
        assert!(!valid_account_name(&b64_encode(&[b'x'; 16])));
        // not base64
        assert!(!valid_account_name("ali!ce"));
    }

    #[test]
    fn free_balance_accounts_for_reservations() {
        let mut account = Account::new(7, "bmFtZQ==".into(), String::new(), 1, None);
        account.balance = 100;
        account.uv_spend = 30;
        assert_eq!(account.free_balance(), 70);

        account.uv_spend = 200;
        assert_eq!(account.free_balance(), 0);
    }
}
