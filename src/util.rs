use std::time::{SystemTime, UNIX_EPOCH};

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const CHAT_ID_LEN: usize = 9;

#[inline]
pub(crate) fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}

/// Random 9-character base-36 identifier for a new chat.
#[must_use]
pub fn generate_chat_id() -> String {
    let mut out = String::with_capacity(CHAT_ID_LEN);
    for _ in 0..CHAT_ID_LEN {
        out.push(char::from(BASE36[fastrand::usize(..BASE36.len())]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_id_shape() {
        let id = generate_chat_id();
        assert_eq!(id.len(), 9);
        assert!(id
            .bytes()
            .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase()));
        assert_ne!(generate_chat_id(), generate_chat_id());
    }
}
