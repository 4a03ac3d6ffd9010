//! Login challenge/response digest
//!
//! The server hands each session a random 32-bit seed at version
//! negotiation. A client proves knowledge of the shared password by sending
//! the digest of (password, seed); the raw-mode handshake uses seed+1 for
//! the request and seed-1 for the reply so captured digests cannot be
//! replayed across the two paths.

use ring::hmac;

/// Length of the login digest carried on the wire.
pub const LOGIN_DIGEST_LEN: usize = 16;

/// HMAC-SHA256 over the seed, keyed by the password, truncated to 16 bytes.
pub fn login_digest(password: &str, seed: u32) -> [u8; LOGIN_DIGEST_LEN] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, password.as_bytes());
    let tag = hmac::sign(&key, &seed.to_be_bytes());
    let mut out = [0u8; LOGIN_DIGEST_LEN];
    out.copy_from_slice(&tag.as_ref()[..LOGIN_DIGEST_LEN]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_depends_on_seed_and_password() {
        let a = login_digest("hunter2", 0xDEAD_BEEF);
        let b = login_digest("hunter2", 0xDEAD_BEF0);
        let c = login_digest("hunter3", 0xDEAD_BEEF);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, login_digest("hunter2", 0xDEAD_BEEF));
    }

    #[test]
    fn raw_handshake_offsets_differ() {
        let seed = u32::MAX; // wrapping must not panic at the extremes
        let login = login_digest("pw", seed);
        let raw_req = login_digest("pw", seed.wrapping_add(1));
        let raw_reply = login_digest("pw", seed.wrapping_sub(1));
        assert_ne!(login, raw_req);
        assert_ne!(login, raw_reply);
        assert_ne!(raw_req, raw_reply);
    }
}
