use base64::prelude::*;
use sha2::Digest;

use crate::error::{ErrorKind, HostError, HostResult};

/// Subresource-integrity hash algorithms, weakest first so `Ord` picks the
/// strongest present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SriAlg {
  Sha256,
  Sha384,
  Sha512,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntegrityMetadata {
  pub alg: SriAlg,
  pub digest: String,
}

/// Parse `alg-base64` entries, whitespace separated. Unknown algorithms
/// and malformed entries are skipped, per the integrity-metadata grammar.
pub fn parse(metadata: &str) -> Vec<IntegrityMetadata> {
  return metadata
    .split_ascii_whitespace()
    .filter_map(|entry| {
      let (alg, rest) = entry.split_once('-')?;
      let alg = match alg.to_ascii_lowercase().as_str() {
        "sha256" => SriAlg::Sha256,
        "sha384" => SriAlg::Sha384,
        "sha512" => SriAlg::Sha512,
        _ => return None,
      };
      // Options (`?opt`) are parsed and ignored.
      let digest = rest.split_once('?').map_or(rest, |(d, _)| d);
      if digest.is_empty() {
        return None;
      }
      return Some(IntegrityMetadata {
        alg,
        digest: digest.to_string(),
      });
    })
    .collect();
}

fn digest_base64(alg: SriAlg, body: &[u8]) -> String {
  let digest: Vec<u8> = match alg {
    SriAlg::Sha256 => sha2::Sha256::digest(body).to_vec(),
    SriAlg::Sha384 => sha2::Sha384::digest(body).to_vec(),
    SriAlg::Sha512 => sha2::Sha512::digest(body).to_vec(),
  };
  return BASE64_STANDARD.encode(digest);
}

/// Integrity metadata may use the url-safe alphabet; canonicalize before
/// comparing.
fn normalize(digest: &str) -> String {
  return digest.replace('-', "+").replace('_', "/");
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
  if a.len() != b.len() {
    return false;
  }
  let mut acc = 0u8;
  for (x, y) in a.iter().zip(b.iter()) {
    acc |= x ^ y;
  }
  return acc == 0;
}

/// True iff any metadata entry of the strongest present algorithm matches
/// the response body. Empty metadata always passes; an ineligible
/// (opaque) response never does.
pub fn verify(metadata: &str, eligible: bool, body: &[u8]) -> HostResult<()> {
  let entries = parse(metadata);
  if entries.is_empty() {
    return Ok(());
  }

  if !eligible {
    return Err(HostError::new(
      ErrorKind::IntegrityFailure,
      "response is not eligible for integrity validation",
    ));
  }

  let strongest = entries.iter().map(|e| e.alg).max().expect("non-empty");
  let actual = digest_base64(strongest, body);

  for entry in entries.iter().filter(|e| e.alg == strongest) {
    if constant_time_eq(actual.as_bytes(), normalize(&entry.digest).as_bytes()) {
      return Ok(());
    }
  }

  return Err(HostError::new(
    ErrorKind::IntegrityFailure,
    format!("no {strongest:?} digest matched the response body"),
  ));
}

#[cfg(test)]
mod tests {
  use super::*;

  const BODY: &[u8] = b"alert(1)";

  fn sha256_meta(body: &[u8]) -> String {
    return format!(
      "sha256-{}",
      BASE64_STANDARD.encode(sha2::Sha256::digest(body))
    );
  }

  #[test]
  fn test_matching_digest_passes() {
    verify(&sha256_meta(BODY), true, BODY).unwrap();
  }

  #[test]
  fn test_single_byte_change_fails() {
    let err = verify(&sha256_meta(BODY), true, b"alert(2)").unwrap_err();
    assert_eq!(ErrorKind::IntegrityFailure, err.kind);
  }

  #[test]
  fn test_empty_metadata_always_passes() {
    verify("", true, BODY).unwrap();
    verify("   ", false, BODY).unwrap();
    // Unknown algorithms only: treated as empty.
    verify("md5-AAAA", true, BODY).unwrap();
  }

  #[test]
  fn test_strongest_algorithm_wins() {
    // Correct sha256, bogus sha512: the strongest present decides.
    let meta = format!("{} sha512-AAAA", sha256_meta(BODY));
    assert!(verify(&meta, true, BODY).is_err());

    let meta = format!(
      "sha256-AAAA sha512-{}",
      BASE64_STANDARD.encode(sha2::Sha512::digest(BODY))
    );
    verify(&meta, true, BODY).unwrap();
  }

  #[test]
  fn test_any_entry_of_strongest_may_match() {
    let meta = format!("sha256-AAAA {}", sha256_meta(BODY));
    verify(&meta, true, BODY).unwrap();
  }

  #[test]
  fn test_opaque_response_ineligible() {
    let err = verify(&sha256_meta(BODY), false, BODY).unwrap_err();
    assert_eq!(ErrorKind::IntegrityFailure, err.kind);
  }

  #[test]
  fn test_empty_body_against_empty_digest() {
    verify(&sha256_meta(b""), true, b"").unwrap();
  }

  #[test]
  fn test_options_and_url_safe_alphabet() {
    let canonical = sha256_meta(BODY);
    let url_safe = canonical.replace('+', "-").replace('/', "_");
    verify(&format!("{url_safe}?foo"), true, BODY).unwrap();
  }
}
