//! Generate a default configuration file template.
//!
//! Usage:
//!   cargo run --bin config_gen [output_file]

use oxilib::config::BlockchainConfig;
use oxilib::util::Saveable;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let output_file = args
        .get(1)
        .map(|s| s.as_str())
        .unwrap_or("config.default.json");

    let config = BlockchainConfig::default();

    match config.save_to_file(output_file) {
        Ok(_) => {
            eprintln!("Generated default configuration: {output_file}");
            eprintln!();
            eprintln!("Values can still be overridden per-process with environment");
            eprintln!("variables or a .env file next to the binary.");
        }
        Err(e) => {
            eprintln!("Error generating config file: {e}");
            std::process::exit(1);
        }
    }
}
