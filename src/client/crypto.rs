//! Long-term identities and the hybrid message codec.
//!
//! Every local username owns an RSA-2048 keypair persisted as PEM; peer
//! public keys learned through the key exchange are cached on disk next to
//! it. Message payloads are AES-256-GCM under a fresh key, with the key
//! wrapped by RSA-OAEP(SHA-256) for the recipient:
//! `u16_be(len(wrapped)) || wrapped || nonce || ciphertext`, base64-encoded.

use std::fs;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use rsa::pkcs8::{
	DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding,
};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use rookery_util::error::Error;

const RSA_BITS: usize = 2048;
const NONCE_LEN: usize = 12;

pub struct CryptoManager {
	contacts_dir: PathBuf,
	private_key: RsaPrivateKey,
	public_key: RsaPublicKey,
}

impl CryptoManager {
	/// Load the keypair persisted under `<keys_dir>/<username>/`, generating
	/// and persisting a fresh one on first use.
	pub fn new(keys_dir: &Path, username: &str) -> Result<Self, Error> {
		let key_dir = keys_dir.join(username);
		let contacts_dir = key_dir.join("contacts");
		fs::create_dir_all(&contacts_dir)?;

		let priv_path = key_dir.join("private.pem");
		let pub_path = key_dir.join("public.pem");

		let (private_key, public_key) = if priv_path.exists() && pub_path.exists() {
			let private_key = RsaPrivateKey::from_pkcs8_pem(&fs::read_to_string(&priv_path)?)
				.map_err(|e| Error::Crypto(format!("cannot load private key: {}", e)))?;
			let public_key = RsaPublicKey::from_public_key_pem(&fs::read_to_string(&pub_path)?)
				.map_err(|e| Error::Crypto(format!("cannot load public key: {}", e)))?;
			(private_key, public_key)
		} else {
			info!("Generating a new RSA keypair for '{}'", username);
			let private_key = RsaPrivateKey::new(&mut OsRng, RSA_BITS)
				.map_err(|e| Error::Crypto(format!("keypair generation failed: {}", e)))?;
			let public_key = RsaPublicKey::from(&private_key);
			let priv_pem = private_key
				.to_pkcs8_pem(LineEnding::LF)
				.map_err(|e| Error::Crypto(format!("cannot encode private key: {}", e)))?;
			fs::write(&priv_path, priv_pem.as_bytes())?;
			let pub_pem = public_key
				.to_public_key_pem(LineEnding::LF)
				.map_err(|e| Error::Crypto(format!("cannot encode public key: {}", e)))?;
			fs::write(&pub_path, pub_pem)?;
			(private_key, public_key)
		};

		info!(
			"Keypair for '{}' ready ({})",
			username,
			fingerprint(&public_key)
		);
		Ok(CryptoManager {
			contacts_dir,
			private_key,
			public_key,
		})
	}

	/// The local public key as base64-encoded PEM, the form PUBKEY_RES
	/// carries on the wire.
	pub fn public_key_b64(&self) -> Result<String, Error> {
		let pem = self
			.public_key
			.to_public_key_pem(LineEnding::LF)
			.map_err(|e| Error::Crypto(format!("cannot encode public key: {}", e)))?;
		Ok(B64.encode(pem.as_bytes()))
	}

	/// Validate and persist a peer key received through the key exchange.
	pub fn store_peer_key(&self, peer: &str, key_b64: &str) -> Result<(), Error> {
		if peer.contains('/') || peer.contains("..") {
			return Err(Error::Crypto(format!("unacceptable peer name: {}", peer)));
		}
		let pem = B64
			.decode(key_b64.trim())
			.map_err(|e| Error::Crypto(format!("bad base64 peer key: {}", e)))?;
		let pem = String::from_utf8(pem)
			.map_err(|e| Error::Crypto(format!("peer key is not UTF-8 PEM: {}", e)))?;
		RsaPublicKey::from_public_key_pem(&pem)
			.map_err(|e| Error::Crypto(format!("peer key does not parse: {}", e)))?;
		fs::write(self.peer_key_path(peer), pem)?;
		Ok(())
	}

	pub fn has_peer_key(&self, peer: &str) -> bool {
		self.peer_key_path(peer).exists()
	}

	fn peer_key_path(&self, peer: &str) -> PathBuf {
		self.contacts_dir.join(format!("{}.pem", peer))
	}

	fn peer_key(&self, peer: &str) -> Result<RsaPublicKey, Error> {
		let pem = fs::read_to_string(self.peer_key_path(peer))
			.map_err(|_| Error::Crypto(format!("no public key for {}", peer)))?;
		RsaPublicKey::from_public_key_pem(&pem)
			.map_err(|e| Error::Crypto(format!("stored key for {} does not parse: {}", peer, e)))
	}

	/// Encrypt `plaintext` for `peer` with a fresh symmetric key.
	pub fn encrypt_to(&self, peer: &str, plaintext: &str) -> Result<String, Error> {
		let peer_key = self.peer_key(peer)?;

		let aes_key = Aes256Gcm::generate_key(OsRng);
		let cipher = Aes256Gcm::new(&aes_key);
		let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
		let ciphertext = cipher
			.encrypt(&nonce, plaintext.as_bytes())
			.map_err(|_| Error::Crypto("payload encryption failed".into()))?;

		let wrapped = peer_key
			.encrypt(&mut OsRng, Oaep::new::<Sha256>(), aes_key.as_slice())
			.map_err(|e| Error::Crypto(format!("key wrap failed: {}", e)))?;

		let mut payload = Vec::with_capacity(2 + wrapped.len() + NONCE_LEN + ciphertext.len());
		payload.extend_from_slice(&(wrapped.len() as u16).to_be_bytes());
		payload.extend_from_slice(&wrapped);
		payload.extend_from_slice(&nonce);
		payload.extend_from_slice(&ciphertext);
		Ok(B64.encode(payload))
	}

	/// Decrypt a payload produced by `encrypt_to` for our keypair.
	pub fn decrypt(&self, payload_b64: &str) -> Result<String, Error> {
		let payload = B64
			.decode(payload_b64.trim())
			.map_err(|e| Error::Crypto(format!("bad base64 payload: {}", e)))?;
		if payload.len() < 2 {
			return Err(Error::Crypto("truncated payload".into()));
		}
		let key_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
		let nonce_start = 2 + key_len;
		let ct_start = nonce_start + NONCE_LEN;
		if payload.len() < ct_start {
			return Err(Error::Crypto("truncated payload".into()));
		}

		let aes_key = self
			.private_key
			.decrypt(Oaep::new::<Sha256>(), &payload[2..nonce_start])
			.map_err(|e| Error::Crypto(format!("key unwrap failed: {}", e)))?;
		if aes_key.len() != 32 {
			return Err(Error::Crypto("unwrapped key has the wrong size".into()));
		}

		let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&aes_key));
		let plaintext = cipher
			.decrypt(
				Nonce::from_slice(&payload[nonce_start..ct_start]),
				&payload[ct_start..],
			)
			.map_err(|_| Error::Crypto("payload decryption failed".into()))?;
		String::from_utf8(plaintext)
			.map_err(|e| Error::Crypto(format!("decrypted payload is not UTF-8: {}", e)))
	}
}

fn fingerprint(key: &RsaPublicKey) -> String {
	match key.to_public_key_der() {
		Ok(der) => hex::encode(&Sha256::digest(der.as_bytes())[..8]),
		Err(_) => "????????".to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn pair(dir: &Path) -> (CryptoManager, CryptoManager) {
		let ada = CryptoManager::new(dir, "ada").unwrap();
		let grace = CryptoManager::new(dir, "grace").unwrap();
		ada.store_peer_key("grace", &grace.public_key_b64().unwrap())
			.unwrap();
		grace
			.store_peer_key("ada", &ada.public_key_b64().unwrap())
			.unwrap();
		(ada, grace)
	}

	#[test]
	fn roundtrip_including_large_payloads() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let (ada, grace) = pair(dir.as_path());

		for text in [
			"hi".to_string(),
			"message with several words and unicode Ω≈ç".to_string(),
			"x".repeat(10 * 1024),
		] {
			let wire = ada.encrypt_to("grace", &text).unwrap();
			assert_eq!(grace.decrypt(&wire).unwrap(), text);
		}
	}

	#[test]
	fn fresh_keys_each_message() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let (ada, grace) = pair(dir.as_path());
		let a = ada.encrypt_to("grace", "same text").unwrap();
		let b = ada.encrypt_to("grace", "same text").unwrap();
		assert_ne!(a, b);
		assert_eq!(grace.decrypt(&a).unwrap(), "same text");
		assert_eq!(grace.decrypt(&b).unwrap(), "same text");
	}

	#[test]
	fn tampered_payload_is_rejected() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let (ada, grace) = pair(dir.as_path());
		let wire = ada.encrypt_to("grace", "do not touch").unwrap();
		let mut raw = B64.decode(wire.as_bytes()).unwrap();
		let last = raw.len() - 1;
		raw[last] ^= 0x01;
		assert!(grace.decrypt(&B64.encode(raw)).is_err());
	}

	#[test]
	fn wrong_recipient_cannot_decrypt() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let (ada, grace) = pair(dir.as_path());
		let linus = CryptoManager::new(dir.as_path(), "linus").unwrap();
		ada.store_peer_key("linus", &linus.public_key_b64().unwrap())
			.unwrap();
		let wire = ada.encrypt_to("grace", "for grace only").unwrap();
		assert!(linus.decrypt(&wire).is_err());
		assert_eq!(grace.decrypt(&wire).unwrap(), "for grace only");
	}

	#[test]
	fn keypair_persists_across_loads() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let first = CryptoManager::new(dir.as_path(), "ada").unwrap();
		let again = CryptoManager::new(dir.as_path(), "ada").unwrap();
		assert_eq!(
			first.public_key_b64().unwrap(),
			again.public_key_b64().unwrap()
		);
	}

	#[test]
	fn peer_keys_are_validated_before_storing() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let ada = CryptoManager::new(dir.as_path(), "ada").unwrap();
		assert!(ada.store_peer_key("grace", "bm90IGEga2V5").is_err());
		assert!(!ada.has_peer_key("grace"));
		assert!(ada.store_peer_key("../evil", "AAAA").is_err());
	}
}
