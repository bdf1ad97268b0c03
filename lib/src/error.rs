use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Invalid transaction: {reason}")]
    InvalidTransaction { reason: String },
    #[error("Invalid block: {reason}")]
    InvalidBlock { reason: String },
    #[error("Invalid block header: {reason}")]
    InvalidBlockHeader { reason: String },
    #[error("Invalid Merkle root: calculated root does not match block header")]
    InvalidMerkleRoot,
    #[error("Invalid signature: signature verification failed")]
    InvalidSignature,
    #[error("Invalid public key: {reason}")]
    InvalidPublicKey { reason: String },
    #[error("Invalid private key: {reason}")]
    InvalidPrivateKey { reason: String },
    #[error("Invalid hash: {reason}")]
    InvalidHash { reason: String },
    #[error("Unknown block: {0}")]
    UnknownBlock(String),
    #[error("Orphan block: parent {0} is not known")]
    OrphanBlock(String),
    #[error("Supply cap would be exceeded: {reason}")]
    SupplyCapExceeded { reason: String },
    #[error("Reorganization past depth limit: depth {depth} exceeds {limit}")]
    ReorgTooDeep { depth: u64, limit: u64 },
    #[error("Mempool rejected transaction: {0}")]
    Mempool(#[from] MempoolRejection),
    #[error("Envelope rejected: {0}")]
    Envelope(#[from] EnvelopeRejection),
    #[error("Persistence failure: {reason}")]
    Persistence { reason: String },
    #[error("Corrupted data: {reason}")]
    Corruption { reason: String },
    #[error("Network failure: {reason}")]
    Network { reason: String },
}

/// Why the mempool refused a transaction. Returned verbatim to the peer or
/// API caller, and used to pick the reputation penalty.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MempoolRejection {
    #[error("malformed transaction")]
    Malformed,
    #[error("signature verification failed")]
    BadSignature,
    #[error("input not found in UTXO set or mempool")]
    MissingInput,
    #[error("input spent twice within the transaction")]
    DuplicateInput,
    #[error("input and output values do not balance with the declared fee")]
    ValueMismatch,
    #[error("fee below the configured floor")]
    FeeTooLow,
    #[error("transaction already in the mempool")]
    AlreadyKnown,
    #[error("conflicts with a mempool transaction and does not pay for replacement")]
    Conflict,
    #[error("transaction exceeds the size cap")]
    TooLarge,
    #[error("mempool is full and the fee-rate does not beat the floor entry")]
    PoolFull,
    #[error("coinbase transactions are not relayed")]
    Coinbase,
}

/// Why an inbound signed envelope was dropped before its payload was
/// looked at.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeRejection {
    #[error("malformed envelope structure")]
    Malformed,
    #[error("envelope signature verification failed")]
    BadSignature,
    #[error("envelope timestamp outside the accepted clock-skew window")]
    StaleTimestamp,
    #[error("envelope nonce already seen from this sender")]
    ReplayedNonce,
    #[error("rate limit exceeded for this message kind")]
    RateLimited,
}

// Convenience methods for creating errors
impl NodeError {
    pub fn invalid_transaction<S: Into<String>>(reason: S) -> Self {
        NodeError::InvalidTransaction {
            reason: reason.into(),
        }
    }

    pub fn invalid_block<S: Into<String>>(reason: S) -> Self {
        NodeError::InvalidBlock {
            reason: reason.into(),
        }
    }

    pub fn invalid_block_header<S: Into<String>>(reason: S) -> Self {
        NodeError::InvalidBlockHeader {
            reason: reason.into(),
        }
    }

    pub fn invalid_hash<S: Into<String>>(reason: S) -> Self {
        NodeError::InvalidHash {
            reason: reason.into(),
        }
    }

    pub fn persistence<S: Into<String>>(reason: S) -> Self {
        NodeError::Persistence {
            reason: reason.into(),
        }
    }

    pub fn corruption<S: Into<String>>(reason: S) -> Self {
        NodeError::Corruption {
            reason: reason.into(),
        }
    }

    pub fn network<S: Into<String>>(reason: S) -> Self {
        NodeError::Network {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;
