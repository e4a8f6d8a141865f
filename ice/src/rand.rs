
use rand::{thread_rng, Rng};

pub const RUNES_ALPHANUMERIC: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub(crate) const LEN_UFRAG: usize = 8;
pub(crate) const LEN_PWD: usize = 24;

/// Draws `n` characters uniformly from `runes` using rejection sampling:
/// bytes at or above the largest multiple of the alphabet size (248 for
/// the 62-symbol alphabet) are discarded so no symbol is favoured.
pub fn generate_crypto_random_string(n: usize, runes: &[u8]) -> String {
    let limit = (256 / runes.len() * runes.len()) as u8;
    let mut rng = thread_rng();
    let mut out = String::with_capacity(n);
    while out.len() < n {
        let b: u8 = rng.gen();
        if limit != 0 && b >= limit {
            continue;
        }
        out.push(runes[b as usize % runes.len()] as char);
    }
    out
}

/// ICE user fragment, 8 characters (RFC 8445 requires at least 4).
pub fn generate_ufrag() -> String {
    generate_crypto_random_string(LEN_UFRAG, RUNES_ALPHANUMERIC)
}

/// ICE password, 24 characters (RFC 8445 requires at least 22).
pub fn generate_pwd() -> String {
    generate_crypto_random_string(LEN_PWD, RUNES_ALPHANUMERIC)
}
