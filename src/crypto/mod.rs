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

//! Cryptographic primitives consumed by the chain core.

pub mod cipher;
pub mod ed25519;
pub mod hash;
pub mod sign;

pub use cipher::{SealKeyPair, SealedEnvelope};
pub use hash::{Hash, HashAlgorithm, Hashable};
pub use sign::{KeyPair, PublicKey};
