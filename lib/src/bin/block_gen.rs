//! Generate a mined genesis block file for bootstrapping a new network.
//!
//! Usage:
//!   cargo run --bin block_gen <block_file> [custom_target_hex]

use std::{env, process::exit};

use chrono::Utc;
use oxilib::{
    config,
    crypto::PrivateKey,
    sha256::Hash,
    types::{Block, BlockHeader, Transaction, TransactionOutput},
    util::{MerkleRoot, Saveable},
    U256,
};

fn main() {
    let path = if let Some(arg) = env::args().nth(1) {
        arg
    } else {
        eprintln!("Usage: block_gen <block_file> [custom_target_hex]");
        eprintln!("  custom_target_hex: optional hex string to set custom difficulty");
        exit(1);
    };

    // Check for optional custom target argument
    let target = if let Some(target_hex) = env::args().nth(2) {
        match U256::from_str_radix(&target_hex, 16) {
            Ok(t) => {
                println!("Using custom target: {:#x}", t);
                t
            }
            Err(_) => {
                eprintln!("Error: Invalid hex string for custom target");
                eprintln!("Expected format: 64 hex characters (0-9, a-f)");
                exit(1);
            }
        }
    } else {
        println!("Using configured minimum target: {:#x}", config::min_target());
        config::min_target()
    };

    let private_key = PrivateKey::new_key();
    let transactions = vec![Transaction::coinbase(TransactionOutput {
        value: config::initial_reward() * 10u64.pow(8),
        pubkey: private_key.public_key(),
    })];
    let merkle_root = MerkleRoot::calculate(&transactions);
    let mut block = Block::new(
        BlockHeader::new(Utc::now(), 0, Hash::zero(), merkle_root, target, 0),
        transactions,
    );
    while !block.header.hash().matches_target(block.header.target) {
        block.header.nonce += 1;
    }
    block.save_to_file(&path).expect("Failed to save block");
    let key_path = format!("{path}.miner.pem");
    private_key
        .save_to_file(&key_path)
        .expect("Failed to save miner key");
    println!("Genesis block written to {path}, funded key to {key_path}");
}
