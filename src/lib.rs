//! Molecule generation with a GraphRNN, tuned with REINFORCE toward drug-like, easily
//! synthesized molecules. The textual information here is informal, and aimed at code
//! maintenance.
//!
//! A molecule is generated one atom at a time. The node network reads the newest atom and
//! its bonds, and predicts the next atom's element. The edge network, seeded from the node
//! network's output, then decides the bond to each of the previous W atoms in BFS order
//! (W = 12 by default). An atom whose W bond slots all come out empty ends the molecule.
//!
//! Training data is linearized the same way: a breadth-first ordering of each molecule,
//! starting from a carbon, with every bond spanning at most W positions. See `linearize`.
//!
//! Rewards combine QED and SA score heuristics with an optional frozen graph-convolution
//! critic, which predicts a property (e.g. melting temperature) and is mapped through a
//! target shaping function. Sampled molecules that fail the valence check score a fixed
//! penalty.
//!
//! Valence budgets: each element class has a maximum bond-order sum. Edge choices that
//! would exceed it are masked, both in the supervised loss and when sampling. The no-edge
//! class is never masked.
//!
//! Classes: the networks only see dense class indices. `relabel` maps atomic numbers and
//! bond orders to classes and back; bond order 0 (no edge) is always class 0.

pub mod chem;
pub mod config;
pub mod dataset;
pub mod degree;
pub mod error;
pub mod files;
pub mod linearize;
pub mod loss;
pub mod model;
pub mod relabel;
pub mod reward;
pub mod sampler;
pub mod train;


use candle_core::Device;
use serde::{Deserialize, Serialize};

pub use crate::{
    config::GraphGenConfig,
    error::{GenError, Result},
    train::{Trainer, run_training},
};

/// Where tensors live. Chosen once, from config, and passed to constructors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum ComputationDevice {
    #[default]
    Cpu,
    /// A CUDA device ordinal.
    #[cfg(feature = "cuda")]
    Gpu(usize),
}

impl ComputationDevice {
    pub fn device(&self) -> Result<Device> {
        match self {
            Self::Cpu => Ok(Device::Cpu),
            #[cfg(feature = "cuda")]
            Self::Gpu(ordinal) => Ok(Device::new_cuda(*ordinal)?),
        }
    }
}
