//! Session-key generation and bootstrap-channel exchange.
//!
//! Grounded in `crypto.cpp`'s `generate_session_key` for the
//! PBKDF2-HMAC-SHA1 shape, and in `parcel.cpp`'s `init_parcel` for which
//! side generates the key and which side reads it: the spawned peer (this
//! crate's [`core::Role::Responder`], the original's "minion") derives the
//! key and writes it to its side of the bootstrap channel before opening
//! its transport; the side that did the spawning (`Role::Initiator`, the
//! original's "master") reads it back.
//!
//! The original derives its key with `PKCS5_PBKDF2_HMAC_SHA1(NULL, 0, NULL,
//! 0, ...)` — an empty password over an empty salt, which makes every
//! invocation produce the identical key regardless of machine or time, no
//! better than a hardcoded constant. This implementation keeps the
//! PBKDF2-HMAC-SHA1 construction but draws both the password material and
//! the salt from the OS random number generator, so the key actually varies
//! per session.

use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha1::Sha1;
use std::io::{Read, Write};

use core::Role;

/// Byte length of a session key (`KEY_BUFFER_LEN` in the original).
pub const SESSION_KEY_LEN: usize = 16;
/// PBKDF2 iteration count (the original's `NUM_ITERATIONS`, 1008; comfortably
/// above the documented 1000-iteration minimum).
const ITERATIONS: u32 = 1008;
const PASSWORD_LEN: usize = 24;
const SALT_LEN: usize = 16;

/// Derives a fresh [`SESSION_KEY_LEN`]-byte key from OS randomness.
#[must_use]
pub fn generate_session_key() -> [u8; SESSION_KEY_LEN] {
    let mut rng = rand::rngs::OsRng;
    let mut password = [0u8; PASSWORD_LEN];
    let mut salt = [0u8; SALT_LEN];
    rng.fill_bytes(&mut password);
    rng.fill_bytes(&mut salt);

    let mut key = [0u8; SESSION_KEY_LEN];
    pbkdf2_hmac::<Sha1>(&password, &salt, ITERATIONS, &mut key);
    key
}

/// Performs the bootstrap-channel half of the key exchange for `role`:
/// the responder generates a key and writes it; the initiator reads one
/// back. Both sides end up with the same [`SESSION_KEY_LEN`]-byte key.
pub fn exchange<R: Read, W: Write>(
    role: Role,
    reader: &mut R,
    writer: &mut W,
) -> std::io::Result<[u8; SESSION_KEY_LEN]> {
    match role {
        Role::Responder => {
            let key = generate_session_key();
            writer.write_all(&key)?;
            writer.flush()?;
            Ok(key)
        }
        Role::Initiator => {
            let mut key = [0u8; SESSION_KEY_LEN];
            reader.read_exact(&mut key)?;
            Ok(key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn generated_keys_are_not_all_zero_and_vary_between_calls() {
        let a = generate_session_key();
        let b = generate_session_key();
        assert_ne!(a, [0u8; SESSION_KEY_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn responder_writes_a_key_the_initiator_then_reads() {
        let mut channel = Vec::new();
        let responder_key = exchange(Role::Responder, &mut Cursor::new(Vec::new()), &mut channel).unwrap();

        let mut inbound = Cursor::new(channel);
        let initiator_key = exchange(Role::Initiator, &mut inbound, &mut Vec::new()).unwrap();

        assert_eq!(responder_key, initiator_key);
    }
}
