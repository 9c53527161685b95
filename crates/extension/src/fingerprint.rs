//! Message fingerprinting for externalization dedup.
//!
//! A fingerprint maps a host message to the store record that replaced
//! it. Tool results key on their tool-call id, timestamped messages on
//! role + timestamp, and everything else on a role-prefixed content hash
//! (the unreliable last resort; collisions there are tolerated).

use rlm_domain::message::Message;

/// Stable key identifying a message within a session.
pub fn fingerprint(message: &Message) -> String {
    if let Some(tool_call_id) = message.tool_result_id() {
        return format!("toolResult:{tool_call_id}");
    }
    if let Some(ts) = &message.timestamp {
        return format!("{}:{}", message.role.as_str(), ts.to_rfc3339());
    }
    let hash = fnv1a32(message.content.extract_all_text().as_bytes());
    format!("{}:{hash:08x}", message.role.as_str())
}

/// 32-bit FNV-1a.
fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rlm_domain::message::Message;

    #[test]
    fn stable_across_copies() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let msg = Message::user("hello").with_timestamp(ts);
        assert_eq!(fingerprint(&msg), fingerprint(&msg.clone()));
    }

    #[test]
    fn tool_results_key_on_call_id() {
        let a = Message::tool_result("call-1", "output A");
        let b = Message::tool_result("call-2", "output A");
        assert_eq!(fingerprint(&a), "toolResult:call-1");
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn timestamps_distinguish_messages() {
        let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 1).unwrap();
        let a = Message::user("same text").with_timestamp(t1);
        let b = Message::user("same text").with_timestamp(t2);
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn fallback_hash_is_role_prefixed() {
        let user = Message::user("identical");
        let assistant = Message::assistant("identical");
        assert!(fingerprint(&user).starts_with("user:"));
        assert!(fingerprint(&assistant).starts_with("assistant:"));
        assert_ne!(fingerprint(&user), fingerprint(&assistant));
    }

    #[test]
    fn tool_result_wins_over_timestamp() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let msg = Message::tool_result("call-9", "out").with_timestamp(ts);
        assert_eq!(fingerprint(&msg), "toolResult:call-9");
    }
}
