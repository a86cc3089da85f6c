// This file is part of TESSERA.
//
// Copyright (C) 2022 Affidaty Spa.
//
// TESSERA is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// TESSERA is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with TESSERA. If not, see <https://www.gnu.org/licenses/>.

//! Transaction payload encryption.
//!
//! Public groups share one AES-256-GCM key (the group `cipher_key`).
//! Private groups seal post payloads to the announced members: the payload is
//! encrypted once with a fresh content key and the content key is wrapped for
//! every recipient through an ephemeral x25519 agreement.

use crate::{Error, ErrorKind, Result};
use ring::rand::{SecureRandom, SystemRandom};
use ring::{aead, hkdf};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as XPublicKey, StaticSecret};

/// Symmetric key length (AES-256).
pub const SYMMETRIC_KEY_LEN: usize = 32;

/// Wrap-key derivation label.
const SEAL_INFO: &[u8] = b"tessera-seal-v1";

fn rng_fill(buf: &mut [u8]) -> Result<()> {
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| Error::new_ext(ErrorKind::CryptoFault, "rng failure"))
}

fn aead_key(key: &[u8]) -> Result<aead::LessSafeKey> {
    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, key)
        .map_err(|_| Error::new_ext(ErrorKind::CryptoFault, "bad symmetric key length"))?;
    Ok(aead::LessSafeKey::new(unbound))
}

/// Encrypt with AES-256-GCM. Output layout: nonce || ciphertext || tag.
pub fn aes_encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let key = aead_key(key)?;
    let mut nonce_bytes = [0u8; aead::NONCE_LEN];
    rng_fill(&mut nonce_bytes)?;
    let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(nonce, aead::Aad::empty(), &mut in_out)
        .map_err(|_| Error::new_ext(ErrorKind::CryptoFault, "seal failure"))?;

    let mut buf = nonce_bytes.to_vec();
    buf.append(&mut in_out);
    Ok(buf)
}

/// Decrypt an `aes_encrypt` buffer.
pub fn aes_decrypt(key: &[u8], buf: &[u8]) -> Result<Vec<u8>> {
    if buf.len() < aead::NONCE_LEN {
        return Err(Error::new(ErrorKind::MalformedData));
    }
    let key = aead_key(key)?;
    let (nonce_bytes, payload) = buf.split_at(aead::NONCE_LEN);
    let nonce = aead::Nonce::try_assume_unique_for_key(nonce_bytes)
        .map_err(|_| Error::new(ErrorKind::MalformedData))?;

    let mut in_out = payload.to_vec();
    let plaintext = key
        .open_in_place(nonce, aead::Aad::empty(), &mut in_out)
        .map_err(|_| Error::new_ext(ErrorKind::CryptoFault, "open failure"))?;
    Ok(plaintext.to_vec())
}

/// Static x25519 identity used to receive sealed payloads.
pub struct SealKeyPair {
    secret: StaticSecret,
    public: XPublicKey,
}

impl SealKeyPair {
    pub fn from_random() -> Result<SealKeyPair> {
        let mut bytes = [0u8; 32];
        rng_fill(&mut bytes)?;
        Ok(Self::from_secret_bytes(bytes))
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> SealKeyPair {
        let secret = StaticSecret::from(bytes);
        let public = XPublicKey::from(&secret);
        SealKeyPair { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }
}

/// One wrapped content key.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
struct SealedSlot {
    /// Recipient x25519 public key.
    #[serde(with = "serde_bytes")]
    recipient: Vec<u8>,
    /// Content key encrypted with the recipient wrap key.
    #[serde(with = "serde_bytes")]
    wrapped_key: Vec<u8>,
}

/// Multi-recipient sealed payload.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct SealedEnvelope {
    /// Ephemeral x25519 public key, one per envelope.
    #[serde(with = "serde_bytes")]
    ephemeral: Vec<u8>,
    /// One slot per recipient.
    slots: Vec<SealedSlot>,
    /// Payload encrypted with the content key.
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

fn derive_wrap_key(shared: &[u8], ephemeral: &[u8], recipient: &[u8]) -> Result<[u8; 32]> {
    let mut salt_bytes = ephemeral.to_vec();
    salt_bytes.extend_from_slice(recipient);
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &salt_bytes);
    let prk = salt.extract(shared);
    let okm = prk
        .expand(&[SEAL_INFO], hkdf::HKDF_SHA256)
        .map_err(|_| Error::new_ext(ErrorKind::CryptoFault, "hkdf expand failure"))?;
    let mut key = [0u8; 32];
    okm.fill(&mut key)
        .map_err(|_| Error::new_ext(ErrorKind::CryptoFault, "hkdf fill failure"))?;
    Ok(key)
}

fn x_public(bytes: &[u8]) -> Result<XPublicKey> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::new(ErrorKind::MalformedData))?;
    Ok(XPublicKey::from(arr))
}

impl SealedEnvelope {
    /// Seal `plaintext` for the given recipients (x25519 public keys).
    pub fn seal(recipients: &[Vec<u8>], plaintext: &[u8]) -> Result<SealedEnvelope> {
        if recipients.is_empty() {
            return Err(Error::new_ext(
                ErrorKind::CryptoFault,
                "sealed payload requires at least one recipient",
            ));
        }

        let mut eph_bytes = [0u8; 32];
        rng_fill(&mut eph_bytes)?;
        let eph_secret = StaticSecret::from(eph_bytes);
        let eph_public = XPublicKey::from(&eph_secret).to_bytes();

        let mut content_key = [0u8; SYMMETRIC_KEY_LEN];
        rng_fill(&mut content_key)?;

        let mut slots = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let their_public = x_public(recipient)?;
            let shared = eph_secret.diffie_hellman(&their_public);
            let wrap_key = derive_wrap_key(shared.as_bytes(), &eph_public, recipient)?;
            let wrapped_key = aes_encrypt(&wrap_key, &content_key)?;
            slots.push(SealedSlot {
                recipient: recipient.clone(),
                wrapped_key,
            });
        }

        let payload = aes_encrypt(&content_key, plaintext)?;
        Ok(SealedEnvelope {
            ephemeral: eph_public.to_vec(),
            slots,
            payload,
        })
    }

    /// Open the envelope with the receiver identity.
    ///
    /// # Errors
    ///
    /// `CryptoFault` when the receiver is not among the recipients or the
    /// payload has been tampered with.
    pub fn open(&self, identity: &SealKeyPair) -> Result<Vec<u8>> {
        let my_public = identity.public_bytes();
        let slot = self
            .slots
            .iter()
            .find(|slot| slot.recipient == my_public)
            .ok_or_else(|| Error::new_ext(ErrorKind::CryptoFault, "not a recipient"))?;

        let eph_public = x_public(&self.ephemeral)?;
        let shared = identity.secret.diffie_hellman(&eph_public);
        let wrap_key = derive_wrap_key(shared.as_bytes(), &self.ephemeral, &slot.recipient)?;
        let content_key = aes_decrypt(&wrap_key, &slot.wrapped_key)?;
        aes_decrypt(&content_key, &self.payload)
    }
}
