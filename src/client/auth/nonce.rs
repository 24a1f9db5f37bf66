//! Client nonce generation for SCRAM (spec.md §4.3 step 1: "24-byte random client nonce").

use base64::{engine::general_purpose::STANDARD as base64, Engine as _};
use rand::RngCore;

pub(crate) fn generate_nonce() -> String {
    let mut bytes = [0u8; 24];
    rand::rng().fill_bytes(&mut bytes);
    base64.encode(bytes)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nonces_are_unlikely_to_collide() {
        let a = generate_nonce();
        let b = generate_nonce();
        assert_ne!(a, b);
        assert!(!a.is_empty());
    }
}
