//! Key derivation (§4.H "Derivation"): `derive(parent_id, path) ->
//! child_id` is HMAC-SHA-256 over the parent private key with `path` as
//! message; the 32-byte output becomes the child private key.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub fn derive_child_secret(parent_secret: &[u8; 32], path: &str) -> [u8; 32] {
  let mut mac = HmacSha256::new_from_slice(parent_secret).expect("HMAC accepts a key of any size");
  mac.update(path.as_bytes());
  let digest = mac.finalize().into_bytes();
  let mut out = [0u8; 32];
  out.copy_from_slice(&digest);
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  #[cfg(test)]
  use pretty_assertions::assert_eq;

  #[test]
  fn derivation_is_deterministic_and_path_sensitive() {
    let parent = [7u8; 32];
    let a = derive_child_secret(&parent, "m/0");
    let b = derive_child_secret(&parent, "m/0");
    let c = derive_child_secret(&parent, "m/1");
    assert_eq!(a, b);
    assert_ne!(a, c);
  }
}
