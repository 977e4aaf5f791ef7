//! Challenge/response authentication, password storage and the signed
//! session cookies.

use std::collections::HashMap;

use color_eyre::Result;
use color_eyre::eyre::eyre;
use rand::RngCore;
use serde::Deserialize;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use strum::{Display, EnumString};

use crate::protocol::basen::{basen, nesab};

/// Digests a client may be asked to respond with. The configured one is
/// advertised in the greeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Deserialize, Default)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Sha1,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl Algorithm {
    fn digest(self, parts: &[&[u8]]) -> Vec<u8> {
        fn run<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
            let mut d = D::new();
            for part in parts {
                d.update(part);
            }
            d.finalize().to_vec()
        }
        match self {
            Algorithm::Sha1 => run::<Sha1>(parts),
            Algorithm::Sha256 => run::<Sha256>(parts),
            Algorithm::Sha384 => run::<Sha384>(parts),
            Algorithm::Sha512 => run::<Sha512>(parts),
        }
    }
}

/// A fresh per-connection challenge.
pub fn new_challenge() -> [u8; 32] {
    let mut c = [0u8; 32];
    rand::rng().fill_bytes(&mut c);
    c
}

/// The response the client must send for `challenge`: the digest of the raw
/// challenge bytes followed by the password, in lowercase hex.
pub fn expected_response(algorithm: Algorithm, challenge: &[u8], password: &str) -> String {
    hex::encode(algorithm.digest(&[challenge, password.as_bytes()]))
}

/// Random hex nonce used for registration confirmation strings.
pub fn new_nonce() -> String {
    let mut nonce = [0u8; 16];
    rand::rng().fill_bytes(&mut nonce);
    hex::encode(nonce)
}

/// Usernames travel inside cookies and state files; keep them tame.
pub fn valid_username(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
}

struct SigningKey {
    bytes: [u8; 32],
    created: i64,
}

impl SigningKey {
    fn fresh(now: i64) -> SigningKey {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        SigningKey { bytes, created: now }
    }

    fn mac(&self, stamp: &str, user: &str) -> String {
        hex::encode(Algorithm::Sha256.digest(&[
            &self.bytes[..],
            stamp.as_bytes(),
            b"\n".as_slice(),
            user.as_bytes(),
        ]))
    }
}

/// Issues and validates bearer cookies of the form
/// `EXPIRY-BASE62/USERNAME/MAC-HEX`. Signing keys rotate on a timer; the
/// current and the previous key both validate, so a cookie survives one
/// rotation but not two. Revocations are remembered until the cookie would
/// have expired anyway.
pub struct CookieJar {
    current: SigningKey,
    previous: Option<SigningKey>,
    key_lifetime: i64,
    revoked: HashMap<String, i64>,
}

impl CookieJar {
    pub fn new(key_lifetime: i64, now: i64) -> CookieJar {
        CookieJar {
            current: SigningKey::fresh(now),
            previous: None,
            key_lifetime,
            revoked: HashMap::new(),
        }
    }

    fn rotate_if_due(&mut self, now: i64) {
        if now - self.current.created >= self.key_lifetime {
            let old = std::mem::replace(&mut self.current, SigningKey::fresh(now));
            self.previous = Some(old);
        }
        self.revoked.retain(|_, expiry| *expiry > now);
    }

    pub fn issue(&mut self, user: &str, now: i64, login_lifetime: i64) -> String {
        self.rotate_if_due(now);
        let expiry = now + login_lifetime;
        let stamp = basen(expiry as u64, 62);
        let mac = self.current.mac(&stamp, user);
        format!("{stamp}/{user}/{mac}")
    }

    /// Check signature, expiry and revocation; returns the username.
    pub fn validate(&mut self, cookie: &str, now: i64) -> Result<String> {
        self.rotate_if_due(now);
        let (user, expiry) = parse_cookie(cookie)?;
        if expiry <= now {
            return Err(eyre!("cookie has expired"));
        }
        if self.revoked.contains_key(cookie) {
            return Err(eyre!("cookie has been revoked"));
        }
        let (stamp, _) = cookie.split_once('/').expect("parse_cookie checked shape");
        let mac = cookie.rsplit_once('/').expect("parse_cookie checked shape").1;
        let genuine = self.current.mac(stamp, &user) == mac
            || self
                .previous
                .as_ref()
                .is_some_and(|k| k.mac(stamp, &user) == mac);
        if !genuine {
            return Err(eyre!("cookie signature is wrong"));
        }
        Ok(user)
    }

    pub fn revoke(&mut self, cookie: &str, now: i64) {
        let expiry = parse_cookie(cookie).map(|(_, e)| e).unwrap_or(now);
        if expiry > now {
            self.revoked.insert(cookie.to_owned(), expiry);
        }
    }

    #[cfg(test)]
    fn force_rotate(&mut self, now: i64) {
        let old = std::mem::replace(&mut self.current, SigningKey::fresh(now));
        self.previous = Some(old);
    }
}

/// Split a cookie into `(username, expiry)` without checking the signature.
pub fn parse_cookie(cookie: &str) -> Result<(String, i64)> {
    let mut parts = cookie.split('/');
    let (stamp, user, mac) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(s), Some(u), Some(m), None) => (s, u, m),
        _ => return Err(eyre!("malformed cookie")),
    };
    if user.is_empty() || mac.is_empty() {
        return Err(eyre!("malformed cookie"));
    }
    let expiry = nesab(stamp, 62)?;
    Ok((user.to_owned(), expiry as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responses_differ_by_algorithm_and_password() {
        let challenge = [7u8; 32];
        let a = expected_response(Algorithm::Sha1, &challenge, "sesame");
        let b = expected_response(Algorithm::Sha256, &challenge, "sesame");
        let c = expected_response(Algorithm::Sha256, &challenge, "sesamf");
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(a.len(), 40);
        assert_eq!(b.len(), 64);
        assert_eq!(
            expected_response(Algorithm::Sha512, &challenge, "sesame").len(),
            128
        );
    }

    #[test]
    fn cookie_round_trip() {
        let mut jar = CookieJar::new(3600, 1000);
        let cookie = jar.issue("alice", 1000, 600);
        assert_eq!(parse_cookie(&cookie).unwrap(), ("alice".to_string(), 1600));
        assert_eq!(jar.validate(&cookie, 1001).unwrap(), "alice");
        // expired
        assert!(jar.validate(&cookie, 1600).is_err());
    }

    #[test]
    fn tampering_is_caught() {
        let mut jar = CookieJar::new(3600, 1000);
        let cookie = jar.issue("alice", 1000, 600);
        let forged = cookie.replace("alice", "admin");
        assert!(jar.validate(&forged, 1001).is_err());
        assert!(jar.validate("rubbish", 1001).is_err());
        assert!(jar.validate("a/b", 1001).is_err());
    }

    #[test]
    fn survives_one_key_rotation_but_not_two() {
        let mut jar = CookieJar::new(1_000_000, 1000);
        let cookie = jar.issue("alice", 1000, 600);
        jar.force_rotate(1100);
        assert_eq!(jar.validate(&cookie, 1200).unwrap(), "alice");
        jar.force_rotate(1300);
        assert!(jar.validate(&cookie, 1400).is_err());
    }

    #[test]
    fn revocation_sticks_until_expiry() {
        let mut jar = CookieJar::new(3600, 1000);
        let cookie = jar.issue("alice", 1000, 600);
        jar.revoke(&cookie, 1001);
        assert!(jar.validate(&cookie, 1002).is_err());
        // a new cookie still works
        let fresh = jar.issue("alice", 1003, 600);
        assert_eq!(jar.validate(&fresh, 1004).unwrap(), "alice");
    }

    #[test]
    fn username_validation() {
        assert!(valid_username("alice"));
        assert!(valid_username("a.b-c_d@e"));
        assert!(!valid_username(""));
        assert!(!valid_username("a/b"));
        assert!(!valid_username("a b"));
    }
}
