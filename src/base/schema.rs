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

//! Core data structures: groups, transactions, blocks and the wire envelope.

use crate::{
    base::serialize::MessagePack,
    crypto::{Hash, Hashable, KeyPair, PublicKey},
    Error, ErrorKind, Result,
};

/// Block identifier: hash of the signable block payload.
pub type BlockId = Hash;

/// Transaction identifier: hash of the signable transaction payload.
pub type TrxId = Hash;

/// Consensus flavors. Proof-of-authority with a single owner-producer is the
/// load-bearing path; the challenge scheme is an experimental alternate.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConsensusKind {
    #[serde(rename = "poa")]
    Poa,
    #[serde(rename = "challenge")]
    Challenge,
}

/// Payload encryption flavors.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub enum EncryptKind {
    #[serde(rename = "public")]
    Public,
    #[serde(rename = "private")]
    Private,
}

/// Per-ledger configuration record.
///
/// Mutated only by the producer or the syncer after a block has been applied
/// and persisted on every mutation.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct GroupItem {
    /// Stable group identifier.
    pub group_id: String,
    /// Group owner (the POA producer).
    pub owner_pubkey: PublicKey,
    /// This node's identity within the group. Equals `owner_pubkey` on the
    /// producing node.
    pub user_sign_pubkey: PublicKey,
    /// Consensus flavor.
    pub consensus_kind: ConsensusKind,
    /// Payload encryption flavor.
    pub encrypt_kind: EncryptKind,
    /// Hex encoded AES-256 group key.
    pub cipher_key: String,
    /// Canonical chain height.
    pub highest_height: i64,
    /// Tip set. More than one entry while competing branches of equal height
    /// coexist.
    pub highest_block_id: Vec<BlockId>,
    /// Group genesis block.
    pub genesis_block: Block,
    /// Timestamp of the last chain info update (ns).
    pub last_update: i64,
}

impl GroupItem {
    /// Producer channel identifier of this group.
    pub fn producer_channel_id(&self) -> String {
        format!("prod_{}", self.group_id)
    }

    /// User channel identifier of this group.
    pub fn user_channel_id(&self) -> String {
        format!("user_{}", self.group_id)
    }

    /// True when this node owns the group.
    pub fn is_owner(&self) -> bool {
        self.owner_pubkey == self.user_sign_pubkey
    }
}

/// Transaction kinds. Closed set: the apply table matches exhaustively.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum TrxKind {
    /// Application content post.
    #[serde(rename = "post")]
    Post,
    /// Deny-list update.
    #[serde(rename = "auth")]
    Auth,
    /// Producer-list update.
    #[serde(rename = "producer")]
    Producer,
    /// Member announcement (sign + encrypt keys).
    #[serde(rename = "announce")]
    Announce,
    /// Request the children of a block (forward sync).
    #[serde(rename = "req_fwd")]
    ReqBlockForward,
    /// Request the parent of a block (backward sync).
    #[serde(rename = "req_bwd")]
    ReqBlockBackward,
    /// Response to a block request.
    #[serde(rename = "req_resp")]
    ReqBlockResp,
    /// A freshly produced candidate block (producer channel).
    #[serde(rename = "produced")]
    BlockProduced,
    /// Block acceptance/rejection acknowledgment.
    #[serde(rename = "blk_resp")]
    NewBlockResp,
    /// Production-turn claim of the challenge policy.
    #[serde(rename = "challenge")]
    Challenge,
}

impl TrxKind {
    /// Kinds whose side effects are applied when a block is committed.
    /// The other kinds only drive the sync/produce machinery.
    pub fn is_appliable(&self) -> bool {
        matches!(
            self,
            TrxKind::Post | TrxKind::Auth | TrxKind::Producer | TrxKind::Announce
        )
    }
}

/// Signable transaction payload.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct TrxData {
    /// Owning group.
    pub group_id: String,
    /// Transaction kind.
    pub kind: TrxKind,
    /// Submitter public key.
    pub sender_pubkey: PublicKey,
    /// Strictly increasing per group.
    pub nonce: u64,
    /// Encrypted payload.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    /// Creation timestamp (ns).
    pub timestamp: i64,
    /// Expiration timestamp (ns). Always greater than `timestamp`.
    pub expired: i64,
}

/// Signed transaction.
///
/// Immutable once signed. `resend_count` sits outside the signed payload so a
/// resend keeps its identifier.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct Trx {
    /// Payload hash, doubles as the identifier.
    pub id: TrxId,
    /// Signable payload.
    pub data: TrxData,
    /// Payload hash signature, verifiable with `data.sender_pubkey`.
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
    /// Times this transaction has been re-published after losing a branch.
    pub resend_count: u32,
}

impl Trx {
    /// Payload integrity and signature verification. Never mutates.
    pub fn verify(&self) -> Result<()> {
        let hash = self.data.primary_hash();
        if hash != self.id {
            return Err(Error::new_ext(
                ErrorKind::MalformedData,
                "trx id does not match payload",
            ));
        }
        match self.data.sender_pubkey.verify(hash.as_bytes(), &self.signature) {
            true => Ok(()),
            false => Err(ErrorKind::InvalidSignature.into()),
        }
    }

    /// True when the transaction is past its expiration at time `now` (ns).
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.data.expired
    }
}

/// Signable block payload.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct BlockData {
    /// Owning group.
    pub group_id: String,
    /// Parent block identifier. Null hash for the genesis block.
    pub prev_block_id: BlockId,
    /// Producer public key.
    pub producer_pubkey: PublicKey,
    /// Production timestamp (ns).
    pub timestamp: i64,
    /// Packaged transactions, in the producer's packaging order.
    pub trxs: Vec<Trx>,
}

/// Signed block. Immutable once produced.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct Block {
    /// Payload hash, doubles as the identifier.
    pub id: BlockId,
    /// Signable payload.
    pub data: BlockData,
    /// Payload hash signature, verifiable with `data.producer_pubkey`.
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl Block {
    /// Build and sign a block on top of `parent`.
    pub fn build(
        parent: &Block,
        trxs: Vec<Trx>,
        keypair: &KeyPair,
        timestamp: i64,
    ) -> Result<Block> {
        let data = BlockData {
            group_id: parent.data.group_id.clone(),
            prev_block_id: parent.id,
            producer_pubkey: keypair.public_key(),
            timestamp,
            trxs,
        };
        Self::seal(data, keypair)
    }

    /// Build and sign the group genesis block.
    pub fn genesis(group_id: &str, keypair: &KeyPair, timestamp: i64) -> Result<Block> {
        let data = BlockData {
            group_id: group_id.to_owned(),
            prev_block_id: Hash::default(),
            producer_pubkey: keypair.public_key(),
            timestamp,
            trxs: vec![],
        };
        Self::seal(data, keypair)
    }

    fn seal(data: BlockData, keypair: &KeyPair) -> Result<Block> {
        let id = data.primary_hash();
        let signature = keypair.sign(id.as_bytes())?;
        Ok(Block {
            id,
            data,
            signature,
        })
    }

    /// True for the group genesis block.
    pub fn is_genesis(&self) -> bool {
        self.data.prev_block_id.is_null()
    }

    /// Validity with respect to a candidate parent: the parent link must
    /// match and the signature must verify against the producer key.
    pub fn verify_with_parent(&self, parent: &Block) -> Result<()> {
        if self.id != self.data.primary_hash() {
            return Err(Error::new_ext(
                ErrorKind::MalformedData,
                "block id does not match payload",
            ));
        }
        if self.data.prev_block_id != parent.id {
            return Err(Error::new_ext(
                ErrorKind::MalformedData,
                "parent block id mismatch",
            ));
        }
        match self
            .data
            .producer_pubkey
            .verify(self.id.as_bytes(), &self.signature)
        {
            true => Ok(()),
            false => Err(ErrorKind::InvalidSignature.into()),
        }
    }
}

/// Storage-layer wrapper adding the graph metadata not carried on the wire.
///
/// A cached chunk keeps the height sentinel (-1) and no parent link until the
/// full ancestor path shows up and the chunk is promoted.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct BlockDbChunk {
    /// Wrapped block.
    pub block: Block,
    /// Distance from genesis along the path used to store it. -1 while cached.
    pub height: i64,
    /// Parent chunk id. `None` while cached.
    pub parent_block_id: Option<BlockId>,
    /// Children ids, appended as children arrive.
    pub sub_block_ids: Vec<BlockId>,
}

impl BlockDbChunk {
    /// Wrap a block for the cache namespace.
    pub fn cached(block: Block) -> Self {
        BlockDbChunk {
            block,
            height: -1,
            parent_block_id: None,
            sub_block_ids: vec![],
        }
    }

    /// Wrap a block linked under `parent` at the given height.
    pub fn linked(block: Block, parent_id: BlockId, height: i64) -> Self {
        BlockDbChunk {
            block,
            height,
            parent_block_id: Some(parent_id),
            sub_block_ids: vec![],
        }
    }
}

/// Result tag of a block request response.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub enum ReqBlkResult {
    #[serde(rename = "in_trx")]
    BlockInTrx,
    #[serde(rename = "not_found")]
    BlockNotFound,
}

/// Block request payload ("give me the block after/before X").
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ReqBlockItem {
    pub group_id: String,
    /// Request anchor.
    pub block_id: BlockId,
    /// Requesting node identity, echoed back in the response.
    pub requester_pubkey: PublicKey,
}

/// Block request response payload.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ReqBlockRespItem {
    pub result: ReqBlkResult,
    pub provider_pubkey: PublicKey,
    pub requester_pubkey: PublicKey,
    pub group_id: String,
    /// Echo of the request anchor.
    pub block_id: BlockId,
    /// Packed block. Empty when `result` is `BlockNotFound`.
    #[serde(with = "serde_bytes")]
    pub block: Vec<u8>,
}

/// Block acknowledgment results.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub enum NewBlockRespResult {
    #[serde(rename = "accepted")]
    Accepted,
    #[serde(rename = "rejected")]
    Rejected,
}

/// Block acceptance/rejection acknowledgment payload.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct NewBlockRespItem {
    pub result: NewBlockRespResult,
    /// Acknowledging node.
    pub provider_pubkey: PublicKey,
    /// Producer of the acknowledged block.
    pub block_producer_pubkey: PublicKey,
    pub block_id: BlockId,
}

/// Challenge round claim payload (alternate production policy).
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ChallengeItem {
    pub challenger_pubkey: PublicKey,
    /// Random seed. Turn order is the ascending seed order.
    pub seed: u64,
}

/// Stored group content entry (applied `Post` transaction).
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ContentItem {
    pub trx_id: TrxId,
    pub publisher_pubkey: PublicKey,
    /// Decrypted payload when available, original ciphertext otherwise.
    #[serde(with = "serde_bytes")]
    pub content: Vec<u8>,
    pub timestamp: i64,
}

/// Table update actions.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub enum ActionKind {
    #[serde(rename = "add")]
    Add,
    #[serde(rename = "remove")]
    Remove,
}

/// Deny-list update payload (`Auth` transaction).
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct AuthItem {
    pub group_id: String,
    pub peer_pubkey: PublicKey,
    pub action: ActionKind,
    pub memo: String,
}

/// Producer-list update payload (`Producer` transaction).
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ProducerItem {
    pub group_id: String,
    pub producer_pubkey: PublicKey,
    pub action: ActionKind,
    pub memo: String,
}

/// Member announcement payload (`Announce` transaction).
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct AnnounceItem {
    pub group_id: String,
    pub sign_pubkey: PublicKey,
    /// x25519 key the member receives sealed payloads with.
    #[serde(with = "serde_bytes")]
    pub encrypt_pubkey: Vec<u8>,
    pub action: ActionKind,
    pub memo: String,
}

/// Wire envelope kind tag.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub enum PackageKind {
    #[serde(rename = "blk")]
    Block,
    #[serde(rename = "trx")]
    Trx,
}

/// Wire envelope: everything published to a channel is a tagged package of a
/// serialized block or a serialized transaction.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct Package {
    pub kind: PackageKind,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl Package {
    pub fn from_block(block: &Block) -> Package {
        Package {
            kind: PackageKind::Block,
            data: block.serialize(),
        }
    }

    pub fn from_trx(trx: &Trx) -> Package {
        Package {
            kind: PackageKind::Trx,
            data: trx.serialize(),
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::base::serialize::{rmp_deserialize, rmp_serialize};
    use crate::crypto::sign::tests::create_test_keypair;

    pub const TEST_GROUP_ID: &str = "b9c6ee02-7a32-4a7a-92b6-d1e0e7a82c7b";
    pub const TEST_TIMESTAMP: i64 = 1_651_052_800_000_000_000;

    pub fn create_test_genesis() -> Block {
        Block::genesis(TEST_GROUP_ID, &create_test_keypair(), TEST_TIMESTAMP).unwrap()
    }

    pub fn create_test_trx(nonce: u64) -> Trx {
        let keypair = create_test_keypair();
        let data = TrxData {
            group_id: TEST_GROUP_ID.to_owned(),
            kind: TrxKind::Post,
            sender_pubkey: keypair.public_key(),
            nonce,
            data: vec![0xde, 0xad, 0xbe, 0xef],
            timestamp: TEST_TIMESTAMP,
            expired: TEST_TIMESTAMP + 30_000_000_000,
        };
        let id = data.primary_hash();
        let signature = keypair.sign(id.as_bytes()).unwrap();
        Trx {
            id,
            data,
            signature,
            resend_count: 0,
        }
    }

    pub fn create_test_group_item() -> GroupItem {
        let keypair = create_test_keypair();
        let genesis = create_test_genesis();
        GroupItem {
            group_id: TEST_GROUP_ID.to_owned(),
            owner_pubkey: keypair.public_key(),
            user_sign_pubkey: keypair.public_key(),
            consensus_kind: ConsensusKind::Poa,
            encrypt_kind: EncryptKind::Public,
            cipher_key: hex::encode([0x7au8; 32]),
            highest_height: 0,
            highest_block_id: vec![genesis.id],
            genesis_block: genesis,
            last_update: TEST_TIMESTAMP,
        }
    }

    #[test]
    fn genesis_block_shape() {
        let genesis = create_test_genesis();

        assert!(genesis.is_genesis());
        assert!(genesis.data.trxs.is_empty());
        assert_eq!(genesis.id, genesis.data.primary_hash());
    }

    #[test]
    fn block_build_and_verify() {
        let keypair = create_test_keypair();
        let genesis = create_test_genesis();

        let block = Block::build(
            &genesis,
            vec![create_test_trx(1)],
            &keypair,
            TEST_TIMESTAMP + 1,
        )
        .unwrap();

        assert_eq!(block.data.prev_block_id, genesis.id);
        block.verify_with_parent(&genesis).unwrap();
    }

    #[test]
    fn block_wrong_parent_rejected() {
        let keypair = create_test_keypair();
        let genesis = create_test_genesis();
        let b1 = Block::build(&genesis, vec![], &keypair, TEST_TIMESTAMP + 1).unwrap();
        let b2 = Block::build(&b1, vec![], &keypair, TEST_TIMESTAMP + 2).unwrap();

        let err = b2.verify_with_parent(&genesis).unwrap_err();

        assert_eq!(err.kind, ErrorKind::MalformedData);
    }

    #[test]
    fn block_tampered_payload_rejected() {
        let keypair = create_test_keypair();
        let genesis = create_test_genesis();
        let mut block =
            Block::build(&genesis, vec![create_test_trx(1)], &keypair, TEST_TIMESTAMP).unwrap();

        block.data.trxs.clear();

        let err = block.verify_with_parent(&genesis).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedData);
    }

    #[test]
    fn block_tampered_signature_rejected() {
        let keypair = create_test_keypair();
        let genesis = create_test_genesis();
        let mut block = Block::build(&genesis, vec![], &keypair, TEST_TIMESTAMP).unwrap();

        block.signature[0] ^= 0xff;

        let err = block.verify_with_parent(&genesis).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidSignature);
    }

    #[test]
    fn trx_verify() {
        let trx = create_test_trx(7);

        trx.verify().unwrap();
    }

    #[test]
    fn trx_resend_keeps_id() {
        let mut trx = create_test_trx(7);
        let id = trx.id;

        trx.resend_count += 1;

        assert_eq!(trx.id, id);
        trx.verify().unwrap();
    }

    #[test]
    fn trx_tampered_nonce_rejected() {
        let mut trx = create_test_trx(7);

        trx.data.nonce = 8;

        let err = trx.verify().unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedData);
    }

    #[test]
    fn trx_expiration_window() {
        let trx = create_test_trx(1);

        assert!(trx.data.expired > trx.data.timestamp);
        assert!(!trx.is_expired(trx.data.timestamp));
        assert!(trx.is_expired(trx.data.expired + 1));
    }

    #[test]
    fn appliable_kinds() {
        assert!(TrxKind::Post.is_appliable());
        assert!(TrxKind::Auth.is_appliable());
        assert!(!TrxKind::ReqBlockForward.is_appliable());
        assert!(!TrxKind::BlockProduced.is_appliable());
    }

    #[test]
    fn package_roundtrip() {
        let genesis = create_test_genesis();
        let pkg = Package::from_block(&genesis);

        let buf = rmp_serialize(&pkg).unwrap();
        let back: Package = rmp_deserialize(&buf).unwrap();

        assert_eq!(back.kind, PackageKind::Block);
        let block: Block = rmp_deserialize(&back.data).unwrap();
        assert_eq!(block, genesis);
    }

    #[test]
    fn group_item_roundtrip() {
        let item = create_test_group_item();

        let buf = rmp_serialize(&item).unwrap();
        let back: GroupItem = rmp_deserialize(&buf).unwrap();

        assert_eq!(back, item);
        assert!(back.is_owner());
        assert_eq!(back.producer_channel_id(), format!("prod_{}", TEST_GROUP_ID));
    }

    #[test]
    fn cached_chunk_height_sentinel() {
        let chunk = BlockDbChunk::cached(create_test_genesis());

        assert_eq!(chunk.height, -1);
        assert!(chunk.parent_block_id.is_none());
        assert!(chunk.sub_block_ids.is_empty());
    }
}
