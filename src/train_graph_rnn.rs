//! This is the entry point for a standalone application that trains a GraphRNN molecule
//! generator, by supervised pretraining or REINFORCE, and writes sampled molecules.
//!
//! Run `cargo r --release --bin train --features "train-bin" -- [config.json]`. Without a
//! config path, the defaults are used. Set `RUST_LOG=info` (or `debug`) for progress.

use std::{env, path::PathBuf};

use graph_gen::{GraphGenConfig, Result, run_training};

fn load_config() -> Result<GraphGenConfig> {
    match env::args().nth(1) {
        Some(path) => GraphGenConfig::from_json_file(&PathBuf::from(path)),
        None => Ok(GraphGenConfig::default()),
    }
}

fn main() {
    env_logger::init();

    let cfg = match load_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading config: {e}");
            return;
        }
    };

    if let Err(e) = run_training(&cfg) {
        eprintln!("Error training: {e}");
    }
}
