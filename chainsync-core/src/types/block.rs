use crate::error::ChainError;
use crate::hash::{hash256, hash_list, short_hex, Hash256, ZERO_HASH};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Add;

/// Work contributed by a block, or the accumulated work of a chain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockDifficulty(pub u128);

impl BlockDifficulty {
    pub const ZERO: BlockDifficulty = BlockDifficulty(0);

    pub fn new(value: u128) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u128 {
        self.0
    }

    pub fn checked_add(self, other: BlockDifficulty) -> Result<Self, ChainError> {
        self.0
            .checked_add(other.0)
            .map(BlockDifficulty)
            .ok_or(ChainError::DifficultyOverflow(other.0, self.0))
    }

    pub fn checked_sub(self, other: BlockDifficulty) -> Result<Self, ChainError> {
        self.0
            .checked_sub(other.0)
            .map(BlockDifficulty)
            .ok_or(ChainError::DifficultyUnderflow(other.0, self.0))
    }
}

impl Add for BlockDifficulty {
    type Output = BlockDifficulty;

    /// Saturating addition, for ranking and display only
    fn add(self, other: BlockDifficulty) -> BlockDifficulty {
        BlockDifficulty(self.0.saturating_add(other.0))
    }
}

impl fmt::Display for BlockDifficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque transaction payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    payload: Vec<u8>,
}

impl Transaction {
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn hash(&self) -> Hash256 {
        hash256(&self.payload)
    }
}

/// BlockHeader structure representing the header of a block in the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Hash of the parent block header
    pub parent_hash: Hash256,

    /// Height of this block in the chain
    pub number: u64,

    /// Work contributed by this block alone
    pub difficulty: BlockDifficulty,

    /// Hash over the transaction hashes of the body
    pub transactions_root: Hash256,

    /// Hash over the uncle header hashes of the body
    pub uncles_hash: Hash256,

    /// Timestamp of the block (seconds since Unix epoch)
    pub timestamp: u64,

    pub nonce: u64,
}

impl BlockHeader {
    /// Calculate the hash of this block header
    pub fn hash(&self) -> Hash256 {
        hash256(&self.serialize_for_hash())
    }

    fn serialize_for_hash(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(32 * 3 + 8 * 3 + 16);

        buffer.extend_from_slice(&self.parent_hash);
        buffer.extend_from_slice(&self.number.to_le_bytes());
        buffer.extend_from_slice(&self.difficulty.0.to_le_bytes());
        buffer.extend_from_slice(&self.transactions_root);
        buffer.extend_from_slice(&self.uncles_hash);
        buffer.extend_from_slice(&self.timestamp.to_le_bytes());
        buffer.extend_from_slice(&self.nonce.to_le_bytes());

        buffer
    }

    /// True when `child` names this header as its parent and sits one height above it
    pub fn is_parent_of(&self, child: &BlockHeader) -> bool {
        child.parent_hash == self.hash() && child.number == self.number.saturating_add(1)
    }

    pub fn is_genesis(&self) -> bool {
        self.number == 0
    }

    pub fn identifier(&self) -> BlockIdentifier {
        BlockIdentifier::new(self.number, self.hash())
    }
}

impl fmt::Display for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Header #{} {} (parent {}, difficulty {})",
            self.number,
            short_hex(&self.hash()),
            short_hex(&self.parent_hash),
            self.difficulty
        )
    }
}

/// Transactions and uncles of a block, delivered separately from its header
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBody {
    pub transactions: Vec<Transaction>,
    pub uncles: Vec<BlockHeader>,
}

impl BlockBody {
    pub fn new(transactions: Vec<Transaction>, uncles: Vec<BlockHeader>) -> Self {
        Self { transactions, uncles }
    }

    pub fn transactions_root(&self) -> Hash256 {
        let hashes: Vec<Hash256> = self.transactions.iter().map(Transaction::hash).collect();
        hash_list(hashes.iter())
    }

    pub fn uncles_hash(&self) -> Hash256 {
        let hashes: Vec<Hash256> = self.uncles.iter().map(BlockHeader::hash).collect();
        hash_list(hashes.iter())
    }

    /// Whether both roots committed to by `header` are reproduced by this body
    pub fn matches(&self, header: &BlockHeader) -> bool {
        self.transactions_root() == header.transactions_root && self.uncles_hash() == header.uncles_hash
    }
}

/// A sealed block: header plus body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    header: BlockHeader,
    body: BlockBody,
}

impl Block {
    /// Pair a header with a body. No consistency check is made here; see
    /// [`Block::try_new`] for the checked form.
    pub fn new(header: BlockHeader, body: BlockBody) -> Self {
        Self { header, body }
    }

    /// Pair a header with a body, rejecting a body whose roots differ
    pub fn try_new(header: BlockHeader, body: BlockBody) -> Result<Self, ChainError> {
        if !body.matches(&header) {
            return Err(ChainError::BodyMismatch { number: header.number });
        }
        Ok(Self { header, body })
    }

    /// Build a genesis block with an empty body
    pub fn genesis(difficulty: BlockDifficulty, timestamp: u64) -> Self {
        let body = BlockBody::default();
        let header = BlockHeader {
            parent_hash: ZERO_HASH,
            number: 0,
            difficulty,
            transactions_root: body.transactions_root(),
            uncles_hash: body.uncles_hash(),
            timestamp,
            nonce: 0,
        };
        Self { header, body }
    }

    /// Build a block extending `parent` with the given body
    pub fn child_of(
        parent: &BlockHeader,
        body: BlockBody,
        difficulty: BlockDifficulty,
        timestamp: u64,
        nonce: u64,
    ) -> Self {
        let header = BlockHeader {
            parent_hash: parent.hash(),
            number: parent.number + 1,
            difficulty,
            transactions_root: body.transactions_root(),
            uncles_hash: body.uncles_hash(),
            timestamp,
            nonce,
        };
        Self { header, body }
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn body(&self) -> &BlockBody {
        &self.body
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn parent_hash(&self) -> &Hash256 {
        &self.header.parent_hash
    }

    /// Work this block adds to its parent's total difficulty: its own
    /// difficulty plus that of every uncle it includes.
    pub fn cumulative_difficulty(&self) -> BlockDifficulty {
        self.body
            .uncles
            .iter()
            .fold(self.header.difficulty, |acc, uncle| acc + uncle.difficulty)
    }

    pub fn is_parent_of(&self, child: &Block) -> bool {
        self.header.is_parent_of(&child.header)
    }

    pub fn is_genesis(&self) -> bool {
        self.header.is_genesis()
    }

    pub fn into_parts(self) -> (BlockHeader, BlockBody) {
        (self.header, self.body)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block #{} {} ({} txs, {} uncles)",
            self.number(),
            short_hex(&self.hash()),
            self.body.transactions.len(),
            self.body.uncles.len()
        )
    }
}

/// A (height, hash) link of a skeleton
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockIdentifier {
    pub number: u64,
    pub hash: Hash256,
}

impl BlockIdentifier {
    pub fn new(number: u64, hash: Hash256) -> Self {
        Self { number, hash }
    }
}

impl fmt::Display for BlockIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.number, short_hex(&self.hash))
    }
}
