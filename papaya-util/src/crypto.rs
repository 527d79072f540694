use rand::Rng;

/// All letters (both cases) and digits.
pub const ALPHA_NUM: &[u8; 62] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Returns a string of the given length made of characters pseudo-randomly
/// picked from `charset`.
pub fn pseudorandom_string(charset: impl AsRef<[u8]>, len: usize) -> String {
    let charset = charset.as_ref();
    let mut rng = rand::rng();
    (0..len)
        .map(|_| charset[rng.random_range(0..charset.len())] as char)
        .collect()
}
