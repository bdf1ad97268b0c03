//! Durable storage for chain state: checksummed atomic snapshots, rotated
//! backups, periodic checkpoints and an append-only block log that lets the
//! node rebuild after losing every snapshot.
//!
//! Every file is written body-then-SHA-256-footer to a temporary path,
//! fsynced and renamed over the target, so a crash leaves either the old
//! file or the new one, never a torn write. Loads verify the footer before
//! deserializing; a mismatch falls through the recovery ladder
//! (backups, then checkpoint replay) instead of poisoning memory.

use crate::crypto::PrivateKey;
use crate::error::{NodeError, Result};
use crate::fork::ForkManager;
use crate::sha256::Hash;
use crate::types::{Block, ChainState, Transaction};
use crate::util::Saveable;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CHECKSUM_LEN: usize = 32;

/// All persisted artifacts live under one data directory:
///
/// ```text
/// <root>/chain.dat            current state snapshot
/// <root>/backups/chain.dat.N  rotated older snapshots, N monotonic
/// <root>/checkpoints/<h>.snap state as of height h
/// <root>/blocks.log           append-only raw block journal
/// <root>/mempool.dat          warm-start dump, not authoritative
/// <root>/keys/signing_key.pem node identity, 0600
/// ```
#[derive(Clone, Debug)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in [
            root.clone(),
            root.join("backups"),
            root.join("checkpoints"),
            root.join("keys"),
        ] {
            fs::create_dir_all(&dir)
                .map_err(|e| NodeError::persistence(format!("create {}: {e}", dir.display())))?;
        }
        Ok(SnapshotStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn chain_path(&self) -> PathBuf {
        self.root.join("chain.dat")
    }

    fn block_log_path(&self) -> PathBuf {
        self.root.join("blocks.log")
    }

    fn mempool_path(&self) -> PathBuf {
        self.root.join("mempool.dat")
    }

    pub fn identity_path(&self) -> PathBuf {
        self.root.join("keys").join("signing_key.pem")
    }

    // ------------------------------------------------------------------
    // Checksummed atomic file primitives
    // ------------------------------------------------------------------

    fn write_atomic(&self, path: &Path, body: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        let digest = Hash::hash_bytes(body);
        {
            let mut file = File::create(&tmp)
                .map_err(|e| NodeError::persistence(format!("create {}: {e}", tmp.display())))?;
            restrict_permissions(&file)?;
            file.write_all(body)
                .and_then(|_| file.write_all(&digest.as_bytes()))
                .map_err(|e| NodeError::persistence(format!("write {}: {e}", tmp.display())))?;
            file.sync_all()
                .map_err(|e| NodeError::persistence(format!("fsync {}: {e}", tmp.display())))?;
        }
        fs::rename(&tmp, path)
            .map_err(|e| NodeError::persistence(format!("rename to {}: {e}", path.display())))
    }

    fn read_verified(&self, path: &Path) -> Result<Vec<u8>> {
        let mut raw = vec![];
        File::open(path)
            .and_then(|mut file| file.read_to_end(&mut raw))
            .map_err(|e| NodeError::persistence(format!("read {}: {e}", path.display())))?;
        if raw.len() < CHECKSUM_LEN {
            return Err(NodeError::corruption(format!(
                "{} shorter than its checksum",
                path.display()
            )));
        }
        let (body, footer) = raw.split_at(raw.len() - CHECKSUM_LEN);
        if Hash::hash_bytes(body).as_bytes() != footer {
            return Err(NodeError::corruption(format!(
                "checksum mismatch in {}",
                path.display()
            )));
        }
        Ok(body.to_vec())
    }

    fn write_state<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let mut body = vec![];
        ciborium::into_writer(value, &mut body)
            .map_err(|e| NodeError::persistence(format!("serialize: {e}")))?;
        self.write_atomic(path, &body)
    }

    fn read_state<T: DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let body = self.read_verified(path)?;
        ciborium::from_reader(&body[..])
            .map_err(|e| NodeError::corruption(format!("deserialize {}: {e}", path.display())))
    }

    // ------------------------------------------------------------------
    // Chain snapshots and backups
    // ------------------------------------------------------------------

    /// Persist the chain state. The previous snapshot is kept as a rotated
    /// backup; the oldest backups are reaped only after the new snapshot is
    /// read back and verified.
    pub fn save_chain(&self, chain: &ChainState) -> Result<()> {
        let path = self.chain_path();
        if path.exists() {
            let serial = self.newest_backup_serial()? + 1;
            let backup = self.root.join("backups").join(format!("chain.dat.{serial}"));
            fs::copy(&path, &backup)
                .map_err(|e| NodeError::persistence(format!("backup rotate: {e}")))?;
        }
        self.write_state(&path, chain)?;
        self.read_verified(&path)?;
        self.reap_old_backups()?;
        Ok(())
    }

    /// Load the chain state, walking the recovery ladder on corruption:
    /// current snapshot, then backups newest first, then a rebuild from the
    /// last good checkpoint and the raw block log.
    pub fn load_chain(&self) -> Result<ChainState> {
        match self.read_state::<ChainState>(&self.chain_path()) {
            Ok(chain) => return Ok(chain),
            Err(e) => warn!(error = %e, "chain snapshot unusable, trying backups"),
        }
        for serial in self.backup_serials()?.into_iter().rev() {
            let path = self.root.join("backups").join(format!("chain.dat.{serial}"));
            match self.read_state::<ChainState>(&path) {
                Ok(chain) => {
                    info!(backup = serial, "recovered chain state from backup");
                    return Ok(chain);
                }
                Err(e) => warn!(backup = serial, error = %e, "backup unusable"),
            }
        }
        self.rebuild_from_checkpoint()
    }

    pub fn chain_file_exists(&self) -> bool {
        self.chain_path().exists() || self.block_log_path().exists()
    }

    fn backup_serials(&self) -> Result<Vec<u64>> {
        let mut serials = vec![];
        let dir = self.root.join("backups");
        let entries = fs::read_dir(&dir)
            .map_err(|e| NodeError::persistence(format!("read {}: {e}", dir.display())))?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            if let Some(serial) = name
                .to_string_lossy()
                .strip_prefix("chain.dat.")
                .and_then(|suffix| suffix.parse::<u64>().ok())
            {
                serials.push(serial);
            }
        }
        serials.sort_unstable();
        Ok(serials)
    }

    fn newest_backup_serial(&self) -> Result<u64> {
        Ok(self.backup_serials()?.last().copied().unwrap_or(0))
    }

    fn reap_old_backups(&self) -> Result<()> {
        let keep = crate::config::BlockchainConfig::global().node.backup_rotation;
        let serials = self.backup_serials()?;
        if serials.len() <= keep {
            return Ok(());
        }
        for serial in &serials[..serials.len() - keep] {
            let path = self.root.join("backups").join(format!("chain.dat.{serial}"));
            if let Err(e) = fs::remove_file(&path) {
                warn!(backup = serial, error = %e, "failed to reap old backup");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// Write a checkpoint for the current height: the full state including
    /// the UTXO snapshot and tip header. Rotated like the backups.
    pub fn write_checkpoint(&self, chain: &ChainState) -> Result<()> {
        let height = chain.block_height();
        let path = self
            .root
            .join("checkpoints")
            .join(format!("{height}.snap"));
        self.write_state(&path, chain)?;
        debug!(height, "checkpoint written");

        let keep = crate::config::BlockchainConfig::global().node.backup_rotation;
        let mut heights = self.checkpoint_heights()?;
        if heights.len() > keep {
            heights.truncate(heights.len() - keep);
            for height in heights {
                let path = self
                    .root
                    .join("checkpoints")
                    .join(format!("{height}.snap"));
                let _ = fs::remove_file(path);
            }
        }
        Ok(())
    }

    fn checkpoint_heights(&self) -> Result<Vec<u64>> {
        let mut heights = vec![];
        let dir = self.root.join("checkpoints");
        let entries = fs::read_dir(&dir)
            .map_err(|e| NodeError::persistence(format!("read {}: {e}", dir.display())))?;
        for entry in entries.flatten() {
            if let Some(height) = entry
                .file_name()
                .to_string_lossy()
                .strip_suffix(".snap")
                .and_then(|stem| stem.parse::<u64>().ok())
            {
                heights.push(height);
            }
        }
        heights.sort_unstable();
        Ok(heights)
    }

    /// Last-ditch recovery: start from the newest checkpoint that verifies
    /// (or genesis when none does) and replay the retained raw blocks
    /// through normal validation.
    fn rebuild_from_checkpoint(&self) -> Result<ChainState> {
        let mut chain = ChainState::new();
        for height in self.checkpoint_heights()?.into_iter().rev() {
            let path = self
                .root
                .join("checkpoints")
                .join(format!("{height}.snap"));
            match self.read_state::<ChainState>(&path) {
                Ok(state) => {
                    info!(height, "replaying from checkpoint");
                    chain = state;
                    break;
                }
                Err(e) => warn!(height, error = %e, "checkpoint unusable"),
            }
        }

        let start_height = chain.block_height();
        let blocks = self.read_block_log()?;
        if start_height == 0 && blocks.is_empty() {
            return Err(NodeError::corruption(
                "no snapshot, backup, checkpoint or block log is usable",
            ));
        }
        let mut forks = ForkManager::new();
        let now = Utc::now();
        let mut replayed = 0usize;
        for block in blocks {
            if block.header.height < start_height {
                continue;
            }
            if forks.process_block(&mut chain, block, now).is_ok() {
                replayed += 1;
            }
        }
        info!(
            replayed,
            height = chain.block_height(),
            "chain state rebuilt from checkpoint and block log"
        );
        Ok(chain)
    }

    // ------------------------------------------------------------------
    // Append-only block log
    // ------------------------------------------------------------------

    /// Append an accepted block to the raw journal. Each record carries its
    /// own length prefix and checksum so a torn tail is detected and
    /// truncated on read.
    pub fn append_block(&self, block: &Block) -> Result<()> {
        let mut body = vec![];
        ciborium::into_writer(block, &mut body)
            .map_err(|e| NodeError::persistence(format!("serialize block: {e}")))?;
        let digest = Hash::hash_bytes(&body);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.block_log_path())
            .map_err(|e| NodeError::persistence(format!("open block log: {e}")))?;
        restrict_permissions(&file)?;
        file.write_all(&(body.len() as u32).to_be_bytes())
            .and_then(|_| file.write_all(&body))
            .and_then(|_| file.write_all(&digest.as_bytes()))
            .and_then(|_| file.sync_all())
            .map_err(|e| NodeError::persistence(format!("append block log: {e}")))
    }

    /// Read the block journal in order, stopping at the first record that
    /// fails its length or checksum (a torn tail after a crash).
    pub fn read_block_log(&self) -> Result<Vec<Block>> {
        let path = self.block_log_path();
        if !path.exists() {
            return Ok(vec![]);
        }
        let mut raw = vec![];
        File::open(&path)
            .and_then(|mut file| file.read_to_end(&mut raw))
            .map_err(|e| NodeError::persistence(format!("read block log: {e}")))?;

        let mut blocks = vec![];
        let mut offset = 0usize;
        while offset + 4 <= raw.len() {
            let len = u32::from_be_bytes(
                raw[offset..offset + 4]
                    .try_into()
                    .expect("BUG: slice length checked"),
            ) as usize;
            let body_end = offset + 4 + len;
            let record_end = body_end + CHECKSUM_LEN;
            if record_end > raw.len() {
                warn!("block log has a torn tail record, truncating");
                break;
            }
            let body = &raw[offset + 4..body_end];
            if Hash::hash_bytes(body).as_bytes() != raw[body_end..record_end] {
                warn!("block log record failed its checksum, truncating");
                break;
            }
            match ciborium::from_reader::<Block, _>(body) {
                Ok(block) => blocks.push(block),
                Err(e) => {
                    warn!(error = %e, "block log record failed to decode, truncating");
                    break;
                }
            }
            offset = record_end;
        }
        Ok(blocks)
    }

    // ------------------------------------------------------------------
    // Mempool warm start (not authoritative)
    // ------------------------------------------------------------------

    pub fn save_mempool(&self, transactions: &[Transaction]) -> Result<()> {
        self.write_state(&self.mempool_path(), &transactions.to_vec())
    }

    pub fn load_mempool(&self) -> Vec<Transaction> {
        match self.read_state::<Vec<Transaction>>(&self.mempool_path()) {
            Ok(transactions) => transactions,
            Err(_) => vec![],
        }
    }

    // ------------------------------------------------------------------
    // Node identity
    // ------------------------------------------------------------------

    /// Load the node's signing key, generating one on first boot. The key
    /// file is created with owner-only permissions.
    pub fn load_or_create_identity(&self) -> Result<PrivateKey> {
        let path = self.identity_path();
        if path.exists() {
            return PrivateKey::load_from_file(&path)
                .map_err(|e| NodeError::corruption(format!("identity key: {e}")));
        }
        let key = PrivateKey::new_key();
        let mut pem = vec![];
        key.save(&mut pem)
            .map_err(|e| NodeError::persistence(format!("encode identity key: {e}")))?;
        self.write_pem(&path, &pem)?;
        info!(path = %path.display(), "generated new node identity key");
        Ok(key)
    }

    fn write_pem(&self, path: &Path, pem: &[u8]) -> Result<()> {
        let mut file = File::create(path)
            .map_err(|e| NodeError::persistence(format!("create {}: {e}", path.display())))?;
        restrict_permissions(&file)?;
        file.write_all(pem)
            .and_then(|_| file.sync_all())
            .map_err(|e| NodeError::persistence(format!("write {}: {e}", path.display())))
    }
}

#[cfg(unix)]
fn restrict_permissions(file: &File) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o600))
        .map_err(|e| NodeError::persistence(format!("set permissions: {e}")))
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &File) -> Result<()> {
    Ok(())
}
