//! Error types shared across the crate.

use std::io;

use thiserror::Error;

/// Reasons a molecule graph can't be turned into a BFS step sequence.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinearizeError {
    #[error("graph has no atoms")]
    Empty,
    #[error("graph is disconnected; BFS reached {reached} of {total} atoms")]
    Disconnected { reached: usize, total: usize },
    #[error("edge spans {span} positions in BFS order; window is {window}")]
    BandwidthExceeded { span: usize, window: usize },
    #[error("graph has no atom of start class {0}")]
    NoStartAtom(usize),
    #[error("root index {root} out of range for {n_atoms} atoms")]
    InvalidRoot { root: usize, n_atoms: usize },
}

#[derive(Error, Debug)]
pub enum GenError {
    /// A raw chemistry value (atomic number, bond order) or a class index with no entry
    /// in the relabel map.
    #[error("unmapped {kind} value {value}")]
    UnknownLabel { kind: &'static str, value: String },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("linearization failed: {0}")]
    Linearize(#[from] LinearizeError),
    #[error("SMILES error: {0}")]
    Smiles(String),
    #[error("graph error: {0}")]
    Graph(String),
    #[error("checkpoint mismatch: missing {missing:?}, unexpected {unexpected:?}")]
    Checkpoint {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl GenError {
    pub fn config(descrip: impl Into<String>) -> Self {
        Self::Config(descrip.into())
    }

    pub(crate) fn unknown(kind: &'static str, value: impl std::fmt::Debug) -> Self {
        Self::UnknownLabel {
            kind,
            value: format!("{value:?}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, GenError>;
