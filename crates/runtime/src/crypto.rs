//! WebCrypto host surface. Primitives come from the RustCrypto crates;
//! nothing cryptographic is implemented here, only dispatch and key
//! handling. Key material is opaque to scripts and travels base64-coded.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher, block_padding::Pkcs7};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use hmac::Mac;
use rand::RngCore;
use sha2::Digest;
use std::sync::Arc;

use crate::error::{ErrorKind, HostError, HostResult};
use crate::host::{HostState, bytes_arg, encode_bytes, get_arg, opt_arg};
use crate::pool::CancellationFlag;

#[derive(Debug, Clone, Copy, PartialEq)]
enum HashAlg {
  Sha1,
  Sha256,
  Sha384,
  Sha512,
}

impl HashAlg {
  fn parse(name: &str) -> HostResult<Self> {
    return match name.to_ascii_uppercase().as_str() {
      "SHA-1" => Ok(HashAlg::Sha1),
      "SHA-256" => Ok(HashAlg::Sha256),
      "SHA-384" => Ok(HashAlg::Sha384),
      "SHA-512" => Ok(HashAlg::Sha512),
      other => Err(HostError::invalid_input(format!("unsupported hash '{other}'"))),
    };
  }

  fn digest(&self, data: &[u8]) -> Vec<u8> {
    return match self {
      HashAlg::Sha1 => sha1::Sha1::digest(data).to_vec(),
      HashAlg::Sha256 => sha2::Sha256::digest(data).to_vec(),
      HashAlg::Sha384 => sha2::Sha384::digest(data).to_vec(),
      HashAlg::Sha512 => sha2::Sha512::digest(data).to_vec(),
    };
  }

  fn output_len(&self) -> usize {
    return match self {
      HashAlg::Sha1 => 20,
      HashAlg::Sha256 => 32,
      HashAlg::Sha384 => 48,
      HashAlg::Sha512 => 64,
    };
  }
}

fn operation_error(message: impl Into<String>) -> HostError {
  return HostError::new(ErrorKind::InvalidInput, message);
}

fn hash_of(alg: &serde_json::Value) -> HostResult<HashAlg> {
  let name = alg
    .get("hash")
    .and_then(|h| h.as_str().or_else(|| h.get("name").and_then(|n| n.as_str())))
    .ok_or_else(|| operation_error("missing hash"))?;
  return HashAlg::parse(name);
}

fn alg_name(alg: &serde_json::Value) -> HostResult<String> {
  return alg
    .get("name")
    .and_then(|v| v.as_str())
    .map(|s| s.to_ascii_uppercase())
    .ok_or_else(|| operation_error("missing algorithm name"));
}

fn iv_of(alg: &serde_json::Value, field: &str) -> HostResult<Vec<u8>> {
  let value = alg
    .get(field)
    .ok_or_else(|| operation_error(format!("missing {field}")))?;
  return crate::host::decode_bytes(value);
}

fn check_aes_key(key: &[u8]) -> HostResult<()> {
  if key.len() != 16 && key.len() != 32 {
    return Err(operation_error("AES key must be 128 or 256 bits"));
  }
  return Ok(());
}

fn aes_gcm_seal(key: &[u8], iv: &[u8], aad: &[u8], data: &[u8], encrypt: bool) -> HostResult<Vec<u8>> {
  check_aes_key(key)?;
  if iv.len() != 12 {
    return Err(operation_error("AES-GCM iv must be 96 bits"));
  }
  let nonce = aes_gcm::Nonce::from_slice(iv);
  let payload = Payload { msg: data, aad };

  let result = if key.len() == 16 {
    let cipher = aes_gcm::Aes128Gcm::new_from_slice(key).expect("length checked");
    if encrypt {
      cipher.encrypt(nonce, payload)
    } else {
      cipher.decrypt(nonce, payload)
    }
  } else {
    let cipher = aes_gcm::Aes256Gcm::new_from_slice(key).expect("length checked");
    if encrypt {
      cipher.encrypt(nonce, payload)
    } else {
      cipher.decrypt(nonce, payload)
    }
  };
  return result.map_err(|_| operation_error("AES-GCM operation failed"));
}

fn aes_cbc_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> HostResult<Vec<u8>> {
  check_aes_key(key)?;
  if iv.len() != 16 {
    return Err(operation_error("AES-CBC iv must be 128 bits"));
  }
  return Ok(if key.len() == 16 {
    cbc::Encryptor::<aes::Aes128>::new_from_slices(key, iv)
      .expect("lengths checked")
      .encrypt_padded_vec_mut::<Pkcs7>(data)
  } else {
    cbc::Encryptor::<aes::Aes256>::new_from_slices(key, iv)
      .expect("lengths checked")
      .encrypt_padded_vec_mut::<Pkcs7>(data)
  });
}

fn aes_cbc_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> HostResult<Vec<u8>> {
  check_aes_key(key)?;
  if iv.len() != 16 {
    return Err(operation_error("AES-CBC iv must be 128 bits"));
  }
  let result = if key.len() == 16 {
    cbc::Decryptor::<aes::Aes128>::new_from_slices(key, iv)
      .expect("lengths checked")
      .decrypt_padded_vec_mut::<Pkcs7>(data)
  } else {
    cbc::Decryptor::<aes::Aes256>::new_from_slices(key, iv)
      .expect("lengths checked")
      .decrypt_padded_vec_mut::<Pkcs7>(data)
  };
  return result.map_err(|_| operation_error("AES-CBC decryption failed"));
}

fn aes_ctr_apply(key: &[u8], counter: &[u8], data: &[u8]) -> HostResult<Vec<u8>> {
  check_aes_key(key)?;
  if counter.len() != 16 {
    return Err(operation_error("AES-CTR counter must be 128 bits"));
  }
  let mut out = data.to_vec();
  if key.len() == 16 {
    let mut cipher = ctr::Ctr128BE::<aes::Aes128>::new_from_slices(key, counter)
      .expect("lengths checked");
    cipher.apply_keystream(&mut out);
  } else {
    let mut cipher = ctr::Ctr128BE::<aes::Aes256>::new_from_slices(key, counter)
      .expect("lengths checked");
    cipher.apply_keystream(&mut out);
  }
  return Ok(out);
}

fn hmac_sign(hash: HashAlg, key: &[u8], data: &[u8]) -> Vec<u8> {
  return match hash {
    HashAlg::Sha1 => {
      let mut mac =
        hmac::Hmac::<sha1::Sha1>::new_from_slice(key).expect("hmac accepts any key length");
      mac.update(data);
      mac.finalize().into_bytes().to_vec()
    }
    HashAlg::Sha256 => {
      let mut mac =
        hmac::Hmac::<sha2::Sha256>::new_from_slice(key).expect("hmac accepts any key length");
      mac.update(data);
      mac.finalize().into_bytes().to_vec()
    }
    HashAlg::Sha384 => {
      let mut mac =
        hmac::Hmac::<sha2::Sha384>::new_from_slice(key).expect("hmac accepts any key length");
      mac.update(data);
      mac.finalize().into_bytes().to_vec()
    }
    HashAlg::Sha512 => {
      let mut mac =
        hmac::Hmac::<sha2::Sha512>::new_from_slice(key).expect("hmac accepts any key length");
      mac.update(data);
      mac.finalize().into_bytes().to_vec()
    }
  };
}

fn hmac_verify(hash: HashAlg, key: &[u8], signature: &[u8], data: &[u8]) -> bool {
  let expected = hmac_sign(hash, key, data);
  if expected.len() != signature.len() {
    return false;
  }
  let mut acc = 0u8;
  for (a, b) in expected.iter().zip(signature.iter()) {
    acc |= a ^ b;
  }
  return acc == 0;
}

fn derive_bits(
  alg: &serde_json::Value,
  key_material: &[u8],
  bit_length: usize,
) -> HostResult<Vec<u8>> {
  if bit_length == 0 || bit_length % 8 != 0 {
    return Err(operation_error("bit length must be a positive multiple of 8"));
  }
  let mut out = vec![0u8; bit_length / 8];
  let hash = hash_of(alg)?;

  match alg_name(alg)?.as_str() {
    "PBKDF2" => {
      let salt = iv_of(alg, "salt")?;
      let iterations = alg
        .get("iterations")
        .and_then(|v| v.as_u64())
        .filter(|n| *n > 0)
        .ok_or_else(|| operation_error("missing iterations"))? as u32;

      match hash {
        HashAlg::Sha1 => pbkdf2::pbkdf2_hmac::<sha1::Sha1>(key_material, &salt, iterations, &mut out),
        HashAlg::Sha256 => {
          pbkdf2::pbkdf2_hmac::<sha2::Sha256>(key_material, &salt, iterations, &mut out)
        }
        HashAlg::Sha384 => {
          pbkdf2::pbkdf2_hmac::<sha2::Sha384>(key_material, &salt, iterations, &mut out)
        }
        HashAlg::Sha512 => {
          pbkdf2::pbkdf2_hmac::<sha2::Sha512>(key_material, &salt, iterations, &mut out)
        }
      };
    }
    "HKDF" => {
      let salt = iv_of(alg, "salt")?;
      let info = iv_of(alg, "info").unwrap_or_default();

      let expand_err = |_| operation_error("HKDF output too long");
      match hash {
        HashAlg::Sha1 => hkdf::Hkdf::<sha1::Sha1>::new(Some(&salt), key_material)
          .expand(&info, &mut out)
          .map_err(expand_err)?,
        HashAlg::Sha256 => hkdf::Hkdf::<sha2::Sha256>::new(Some(&salt), key_material)
          .expand(&info, &mut out)
          .map_err(expand_err)?,
        HashAlg::Sha384 => hkdf::Hkdf::<sha2::Sha384>::new(Some(&salt), key_material)
          .expand(&info, &mut out)
          .map_err(expand_err)?,
        HashAlg::Sha512 => hkdf::Hkdf::<sha2::Sha512>::new(Some(&salt), key_material)
          .expand(&info, &mut out)
          .map_err(expand_err)?,
      };
    }
    other => {
      return Err(operation_error(format!("unsupported derivation '{other}'")));
    }
  }
  return Ok(out);
}

fn encrypt(alg: &serde_json::Value, key: &[u8], data: &[u8]) -> HostResult<Vec<u8>> {
  return match alg_name(alg)?.as_str() {
    "AES-GCM" => {
      let iv = iv_of(alg, "iv")?;
      let aad = iv_of(alg, "additionalData").unwrap_or_default();
      aes_gcm_seal(key, &iv, &aad, data, true)
    }
    "AES-CBC" => aes_cbc_encrypt(key, &iv_of(alg, "iv")?, data),
    "AES-CTR" => aes_ctr_apply(key, &iv_of(alg, "counter")?, data),
    other => Err(operation_error(format!("unsupported cipher '{other}'"))),
  };
}

fn decrypt(alg: &serde_json::Value, key: &[u8], data: &[u8]) -> HostResult<Vec<u8>> {
  return match alg_name(alg)?.as_str() {
    "AES-GCM" => {
      let iv = iv_of(alg, "iv")?;
      let aad = iv_of(alg, "additionalData").unwrap_or_default();
      aes_gcm_seal(key, &iv, &aad, data, false)
    }
    "AES-CBC" => aes_cbc_decrypt(key, &iv_of(alg, "iv")?, data),
    "AES-CTR" => aes_ctr_apply(key, &iv_of(alg, "counter")?, data),
    other => Err(operation_error(format!("unsupported cipher '{other}'"))),
  };
}

fn generate_key(alg: &serde_json::Value) -> HostResult<Vec<u8>> {
  let name = alg_name(alg)?;
  let length = match name.as_str() {
    "AES-GCM" | "AES-CBC" | "AES-CTR" => {
      let bits = alg
        .get("length")
        .and_then(|v| v.as_u64())
        .unwrap_or(256);
      if bits != 128 && bits != 256 {
        return Err(operation_error("AES key length must be 128 or 256"));
      }
      (bits / 8) as usize
    }
    "HMAC" => hash_of(alg)?.output_len(),
    other => {
      return Err(operation_error(format!("unsupported key algorithm '{other}'")));
    }
  };

  let mut material = vec![0u8; length];
  rand::rng().fill_bytes(&mut material);
  return Ok(material);
}

pub(crate) fn register(
  runtime: &mut rustyscript::Runtime,
  state: &Arc<HostState>,
) -> Result<(), rustyscript::Error> {
  {
    runtime.register_function("crypto_get_random_values", move |args: &[serde_json::Value]| {
      let length: usize = get_arg(args, 0)?;
      if length > 65_536 {
        return Err(
          HostError::new(ErrorKind::InvalidInput, "requested too many random bytes").into(),
        );
      }
      let mut bytes = vec![0u8; length];
      rand::rng().fill_bytes(&mut bytes);
      return Ok(encode_bytes(&bytes).into());
    })?;
  }
  {
    runtime.register_function("crypto_random_uuid", move |_args: &[serde_json::Value]| {
      return Ok(uuid::Uuid::new_v4().to_string().into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("subtle_digest", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let alg: String = get_arg(&args, 0)?;
        let data = bytes_arg(&args, 1)?;

        let hash = HashAlg::parse(&alg)?;
        // Digests over large buffers are pool work, not loop work.
        let receiver = state
          .pool
          .submit(CancellationFlag::new(), move |_flag| Ok(hash.digest(&data)));
        let digest = crate::bridge::await_completion(receiver).await?;
        return Ok(encode_bytes(&digest).into());
      })
    })?;
  }
  {
    runtime.register_function("subtle_generate_key", move |args: &[serde_json::Value]| {
      let alg: serde_json::Value = get_arg(args, 0)?;
      let material = generate_key(&alg)?;
      return Ok(encode_bytes(&material).into());
    })?;
  }
  {
    runtime.register_function("subtle_import_key", move |args: &[serde_json::Value]| {
      let format: String = get_arg(args, 0)?;
      if format != "raw" {
        return Err(operation_error(format!("unsupported key format '{format}'")).into());
      }
      let material = bytes_arg(args, 1)?;
      let alg: serde_json::Value = get_arg(args, 2)?;

      // Validate the material against the algorithm's constraints.
      match alg_name(&alg)?.as_str() {
        "AES-GCM" | "AES-CBC" | "AES-CTR" => check_aes_key(&material)?,
        "HMAC" | "PBKDF2" | "HKDF" => {}
        other => {
          return Err(operation_error(format!("unsupported key algorithm '{other}'")).into());
        }
      }
      return Ok(encode_bytes(&material).into());
    })?;
  }
  {
    runtime.register_function("subtle_export_key", move |args: &[serde_json::Value]| {
      let format: String = get_arg(args, 0)?;
      if format != "raw" {
        return Err(operation_error(format!("unsupported key format '{format}'")).into());
      }
      let material = bytes_arg(args, 1)?;
      return Ok(encode_bytes(&material).into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("subtle_encrypt", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let alg: serde_json::Value = get_arg(&args, 0)?;
        let key = bytes_arg(&args, 1)?;
        let data = bytes_arg(&args, 2)?;

        let receiver = state
          .pool
          .submit(CancellationFlag::new(), move |_flag| encrypt(&alg, &key, &data));
        let out = crate::bridge::await_completion(receiver).await?;
        return Ok(encode_bytes(&out).into());
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("subtle_decrypt", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let alg: serde_json::Value = get_arg(&args, 0)?;
        let key = bytes_arg(&args, 1)?;
        let data = bytes_arg(&args, 2)?;

        let receiver = state
          .pool
          .submit(CancellationFlag::new(), move |_flag| decrypt(&alg, &key, &data));
        let out = crate::bridge::await_completion(receiver).await?;
        return Ok(encode_bytes(&out).into());
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("subtle_sign", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let alg: serde_json::Value = get_arg(&args, 0)?;
        let key = bytes_arg(&args, 1)?;
        let data = bytes_arg(&args, 2)?;

        if alg_name(&alg)? != "HMAC" {
          return Err(operation_error("only HMAC signing is supported").into());
        }
        let hash = hash_of(&alg)?;

        let receiver = state
          .pool
          .submit(CancellationFlag::new(), move |_flag| Ok(hmac_sign(hash, &key, &data)));
        let signature = crate::bridge::await_completion(receiver).await?;
        return Ok(encode_bytes(&signature).into());
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("subtle_verify", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let alg: serde_json::Value = get_arg(&args, 0)?;
        let key = bytes_arg(&args, 1)?;
        let signature = bytes_arg(&args, 2)?;
        let data = bytes_arg(&args, 3)?;

        if alg_name(&alg)? != "HMAC" {
          return Err(operation_error("only HMAC verification is supported").into());
        }
        let hash = hash_of(&alg)?;

        let receiver = state.pool.submit(CancellationFlag::new(), move |_flag| {
          return Ok(hmac_verify(hash, &key, &signature, &data));
        });
        let ok = crate::bridge::await_completion(receiver).await?;
        return Ok(ok.into());
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("subtle_derive_bits", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let alg: serde_json::Value = get_arg(&args, 0)?;
        let key = bytes_arg(&args, 1)?;
        let bit_length: usize = get_arg(&args, 2)?;

        let receiver = state.pool.submit(CancellationFlag::new(), move |_flag| {
          return derive_bits(&alg, &key, bit_length);
        });
        let bits = crate::bridge::await_completion(receiver).await?;
        return Ok(encode_bytes(&bits).into());
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("subtle_derive_key", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let alg: serde_json::Value = get_arg(&args, 0)?;
        let key = bytes_arg(&args, 1)?;
        let derived_alg: serde_json::Value = get_arg(&args, 2)?;

        // Derive exactly the bits the target algorithm needs.
        let bit_length = match alg_name(&derived_alg)?.as_str() {
          "AES-GCM" | "AES-CBC" | "AES-CTR" => derived_alg
            .get("length")
            .and_then(|v| v.as_u64())
            .unwrap_or(256) as usize,
          "HMAC" => hash_of(&derived_alg)?.output_len() * 8,
          other => {
            return Err(operation_error(format!("unsupported derived key '{other}'")).into());
          }
        };

        let receiver = state.pool.submit(CancellationFlag::new(), move |_flag| {
          return derive_bits(&alg, &key, bit_length);
        });
        let material = crate::bridge::await_completion(receiver).await?;
        return Ok(encode_bytes(&material).into());
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("subtle_wrap_key", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        // wrap = export (raw) + encrypt.
        let key = bytes_arg(&args, 0)?;
        let wrapping_key = bytes_arg(&args, 1)?;
        let alg: serde_json::Value = get_arg(&args, 2)?;

        let receiver = state.pool.submit(CancellationFlag::new(), move |_flag| {
          return encrypt(&alg, &wrapping_key, &key);
        });
        let wrapped = crate::bridge::await_completion(receiver).await?;
        return Ok(encode_bytes(&wrapped).into());
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("subtle_unwrap_key", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let wrapped = bytes_arg(&args, 0)?;
        let wrapping_key = bytes_arg(&args, 1)?;
        let alg: serde_json::Value = get_arg(&args, 2)?;
        let unwrapped_alg: Option<serde_json::Value> = opt_arg(&args, 3);

        let receiver = state.pool.submit(CancellationFlag::new(), move |_flag| {
          let material = decrypt(&alg, &wrapping_key, &wrapped)?;
          if let Some(unwrapped_alg) = &unwrapped_alg
            && matches!(
              alg_name(unwrapped_alg)?.as_str(),
              "AES-GCM" | "AES-CBC" | "AES-CTR"
            )
          {
            check_aes_key(&material)?;
          }
          return Ok(material);
        });
        let material = crate::bridge::await_completion(receiver).await?;
        return Ok(encode_bytes(&material).into());
      })
    })?;
  }

  return Ok(());
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_digest_known_vector() {
    // SHA-256 of "abc".
    let digest = HashAlg::Sha256.digest(b"abc");
    assert_eq!(
      "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
      digest.iter().map(|b| format!("{b:02x}")).collect::<String>()
    );
  }

  #[test]
  fn test_aes_gcm_round_trip_and_tamper() {
    let key = [7u8; 32];
    let iv = [1u8; 12];

    let sealed = aes_gcm_seal(&key, &iv, b"aad", b"secret", true).unwrap();
    let opened = aes_gcm_seal(&key, &iv, b"aad", &sealed, false).unwrap();
    assert_eq!(b"secret".to_vec(), opened);

    let mut tampered = sealed.clone();
    tampered[0] ^= 1;
    assert!(aes_gcm_seal(&key, &iv, b"aad", &tampered, false).is_err());
    // Wrong AAD also fails authentication.
    assert!(aes_gcm_seal(&key, &iv, b"other", &sealed, false).is_err());
  }

  #[test]
  fn test_aes_cbc_round_trip() {
    let key = [9u8; 16];
    let iv = [3u8; 16];

    let ciphertext = aes_cbc_encrypt(&key, &iv, b"block cipher test").unwrap();
    assert_ne!(b"block cipher test".to_vec(), ciphertext);
    let plaintext = aes_cbc_decrypt(&key, &iv, &ciphertext).unwrap();
    assert_eq!(b"block cipher test".to_vec(), plaintext);

    assert!(aes_cbc_encrypt(&[0u8; 7], &iv, b"x").is_err());
    assert!(aes_cbc_encrypt(&key, &[0u8; 3], b"x").is_err());
  }

  #[test]
  fn test_aes_ctr_is_symmetric() {
    let key = [4u8; 32];
    let counter = [0u8; 16];

    let ciphertext = aes_ctr_apply(&key, &counter, b"stream").unwrap();
    assert_eq!(
      b"stream".to_vec(),
      aes_ctr_apply(&key, &counter, &ciphertext).unwrap()
    );
  }

  #[test]
  fn test_hmac_sign_verify() {
    let signature = hmac_sign(HashAlg::Sha256, b"key", b"message");
    assert_eq!(32, signature.len());
    assert!(hmac_verify(HashAlg::Sha256, b"key", &signature, b"message"));
    assert!(!hmac_verify(HashAlg::Sha256, b"key", &signature, b"other"));
    assert!(!hmac_verify(HashAlg::Sha256, b"wrong", &signature, b"message"));
  }

  #[test]
  fn test_pbkdf2_derivation() {
    let alg = serde_json::json!({
      "name": "PBKDF2",
      "hash": "SHA-256",
      "salt": crate::host::encode_bytes(b"salt"),
      "iterations": 1000,
    });

    let bits = derive_bits(&alg, b"password", 256).unwrap();
    assert_eq!(32, bits.len());
    // Deterministic for identical inputs.
    assert_eq!(bits, derive_bits(&alg, b"password", 256).unwrap());
    assert_ne!(bits, derive_bits(&alg, b"other", 256).unwrap());

    assert!(derive_bits(&alg, b"password", 7).is_err());
  }

  #[test]
  fn test_hkdf_derivation() {
    let alg = serde_json::json!({
      "name": "HKDF",
      "hash": "SHA-256",
      "salt": crate::host::encode_bytes(b"salt"),
      "info": crate::host::encode_bytes(b"ctx"),
    });

    let bits = derive_bits(&alg, b"input keying material", 128).unwrap();
    assert_eq!(16, bits.len());
  }

  #[test]
  fn test_generate_key_lengths() {
    let aes = generate_key(&serde_json::json!({ "name": "AES-GCM", "length": 128 })).unwrap();
    assert_eq!(16, aes.len());

    let hmac = generate_key(&serde_json::json!({ "name": "HMAC", "hash": "SHA-512" })).unwrap();
    assert_eq!(64, hmac.len());

    assert!(generate_key(&serde_json::json!({ "name": "AES-GCM", "length": 192 })).is_err());
  }
}
