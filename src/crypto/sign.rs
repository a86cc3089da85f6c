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

//! Signing keys used for group identities.
//!
//! Group members and producers are ed25519 identities. The enumeration keeps
//! the serialized form tagged so other schemes can be added without breaking
//! the stored material.

use crate::{crypto::ed25519, Result};
use serde::{self, Deserialize, Serialize};

pub enum KeyPair {
    Ed25519(ed25519::KeyPair),
}

impl KeyPair {
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            KeyPair::Ed25519(keypair) => keypair.sign(data),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        match self {
            KeyPair::Ed25519(keypair) => PublicKey::Ed25519 {
                pb: keypair.public_key(),
            },
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(tag = "type")]
pub enum PublicKey {
    #[serde(rename = "ed25519")]
    Ed25519 { pb: ed25519::PublicKey },
}

impl PublicKey {
    pub fn verify(&self, data: &[u8], sig: &[u8]) -> bool {
        match self {
            PublicKey::Ed25519 { pb } => pb.verify(data, sig),
        }
    }

    pub fn to_account_id(&self) -> String {
        match self {
            PublicKey::Ed25519 { pb } => pb.to_account_id(),
        }
    }
}
