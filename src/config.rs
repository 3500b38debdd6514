//! Run configuration. Built once at startup, from defaults or a JSON file, and passed by
//! reference into constructors. Defaults reproduce the reference GraphRNN + GCN critic
//! setup on small ChEMBL.

use std::{fs, path::Path, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    ComputationDevice,
    chem::{BondOrder, attributes::AtomFeaturizer},
    error::{GenError, Result},
    relabel::RelabelPolicy,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelabelConfig {
    /// `(atomic number, class)`
    pub node_table: Vec<(u8, usize)>,
    /// `(bond order, class)`. `BondOrder::None` must be class 0.
    pub edge_table: Vec<(BondOrder, usize)>,
    /// Atomic number every generated graph starts with.
    pub start_element: u8,
    pub policy: RelabelPolicy,
}

impl Default for RelabelConfig {
    fn default() -> Self {
        Self {
            node_table: vec![
                (6, 0),
                (7, 1),
                (8, 2),
                (9, 3),
                (15, 4),
                (16, 5),
                (17, 6),
                (35, 7),
                (53, 8),
            ],
            edge_table: vec![
                (BondOrder::None, 0),
                (BondOrder::Single, 1),
                (BondOrder::Double, 2),
                (BondOrder::Triple, 3),
            ],
            start_element: 6,
            policy: RelabelPolicy::Reject,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub path: PathBuf,
    /// The first column is SMILES; any others are numeric labels.
    pub cols_to_read: Vec<usize>,
    pub delimiter: char,
    pub has_header: bool,
    pub restrict_min_atoms: usize,
    pub restrict_max_atoms: usize,
    /// The BFS window, W: how many previous nodes each new node may bond to.
    pub max_prev_nodes: usize,
    /// Pick a random start-class root, and shuffle neighbour order, each time a sequence is
    /// drawn.
    pub random_order: bool,
    /// Random orderings to try before falling back to the deterministic one, if the random
    /// ones exceed the window.
    pub order_retries: usize,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./benchmark_datasets/chembl_small/small_chembl.smi"),
            cols_to_read: vec![0, 1],
            delimiter: ',',
            has_header: false,
            restrict_min_atoms: 10,
            restrict_max_atoms: 80,
            max_prev_nodes: 12,
            random_order: true,
            order_retries: 8,
        }
    }
}

/// A stacked GRU with input and output projections.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RnnConfig {
    /// Width of the input projection.
    pub embedding_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    /// If `None`, the network's output is the output projection's input (the top hidden state).
    pub output_size: Option<usize>,
    /// Apply a ReLU to the final output.
    pub has_output_nonlin: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub edge_embedding_dim: usize,
    /// Only used with more than 2 node classes.
    pub node_embedding_dim: usize,
    pub node_rnn: RnnConfig,
    /// The edge network's output size is set from the number of edge classes.
    pub edge_rnn: RnnConfig,
    pub node_mlp_hidden: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            edge_embedding_dim: 16,
            node_embedding_dim: 128,
            node_rnn: RnnConfig {
                embedding_size: 128,
                hidden_size: 256,
                num_layers: 4,
                output_size: Some(128),
                has_output_nonlin: false,
            },
            edge_rnn: RnnConfig {
                embedding_size: 64,
                hidden_size: 128,
                num_layers: 4,
                output_size: None,
                has_output_nonlin: false,
            },
            node_mlp_hidden: 128,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Softmax temperature for node and edge classes.
    pub temperature: f32,
    /// Trajectories sampled per policy-gradient step.
    pub episodes_per_step: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            temperature: 1.,
            episodes_per_step: 32,
        }
    }
}

/// Maps the critic's raw prediction onto a reward term.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum TargetShaping {
    Identity,
    /// Sigmoid rising through `center`: higher predictions score higher.
    Maximize { center: f32, scale: f32 },
    /// Gaussian around `target`.
    Proximity { target: f32, width: f32 },
}

impl TargetShaping {
    pub fn apply(self, v: f32) -> f32 {
        match self {
            Self::Identity => v,
            Self::Maximize { center, scale } => 1. / (1. + (-(v - center) / scale).exp()),
            Self::Proximity { target, width } => (-(v - target).powi(2) / (2. * width * width)).exp(),
        }
    }
}

/// How heuristic and critic terms combine into one reward.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum RewardCombination {
    Sum,
    WeightedBlend { heuristic: f32, critic: f32 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CriticConfig {
    /// A safetensors checkpoint written by a data-parallel trainer; each key carries a
    /// 7-character prefix. If `None`, rewards are heuristic only.
    pub checkpoint: Option<PathBuf>,
    /// Output width of each graph convolution.
    pub conv_hidden: Vec<usize>,
    /// Width of the dense layer between the convolutions and pooling.
    pub encoder_dim: usize,
    /// Widths of the MLP layers; the last is the prediction width, of which output 0 is used.
    pub mlp_hidden: Vec<usize>,
    pub featurizer: AtomFeaturizer,
}

impl Default for CriticConfig {
    fn default() -> Self {
        Self {
            checkpoint: None,
            conv_hidden: vec![128; 5],
            encoder_dim: 128,
            mlp_hidden: vec![128, 1],
            featurizer: AtomFeaturizer::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    pub qed_weight: f32,
    pub sa_weight: f32,
    /// Reward for molecules that fail sanitization.
    pub invalid_penalty: f32,
    pub shaping: TargetShaping,
    pub combination: RewardCombination,
    pub critic: CriticConfig,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            qed_weight: 1.,
            sa_weight: 1.,
            invalid_penalty: 0.,
            shaping: TargetShaping::Maximize {
                center: 0.,
                scale: 1.,
            },
            combination: RewardCombination::Sum,
            critic: CriticConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    pub gamma: f32,
    pub enable_supervised_loss: bool,
    pub policy_weight: f32,
    pub supervised_weight: f32,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            gamma: 0.97,
            enable_supervised_loss: true,
            policy_weight: 1.,
            supervised_weight: 1.,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainMode {
    /// Supervised next-step training only.
    Pretrain,
    /// Policy gradient on sampled molecules, plus the supervised term if enabled.
    #[default]
    Reinforce,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub mode: TrainMode,
    pub lr: f64,
    pub batch_size: usize,
    pub num_epochs: usize,
    pub random_seed: u64,
    pub logdir: PathBuf,
    pub print_every: usize,
    pub save_every: usize,
    /// Generator weights to start from, e.g. a pretraining checkpoint.
    pub init_checkpoint: Option<PathBuf>,
    /// Molecules sampled and written to `samples.csv` at the end of the run.
    pub num_final_samples: usize,
    pub device: ComputationDevice,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            mode: TrainMode::Reinforce,
            lr: 1e-5,
            batch_size: 1_000,
            num_epochs: 31,
            random_seed: 1_476,
            logdir: PathBuf::from("./logs/graphrnn_log"),
            print_every: 1,
            save_every: 1,
            init_checkpoint: None,
            num_final_samples: 100,
            device: ComputationDevice::Cpu,
        }
    }
}

/// Everything a training or sampling run needs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphGenConfig {
    pub relabel: RelabelConfig,
    pub dataset: DatasetConfig,
    pub model: ModelConfig,
    pub sampler: SamplerConfig,
    /// Maximum bond-order sum per node class, indexed by class. `None` disables degree
    /// masking.
    pub max_atom_bonds: Option<Vec<f32>>,
    pub reward: RewardConfig,
    pub loss: LossConfig,
    pub train: TrainConfig,
}

impl Default for GraphGenConfig {
    fn default() -> Self {
        Self {
            relabel: Default::default(),
            dataset: Default::default(),
            model: Default::default(),
            sampler: Default::default(),
            max_atom_bonds: Some(vec![4., 3., 2., 1., 5., 6., 1., 1., 1.]),
            reward: Default::default(),
            loss: Default::default(),
            train: Default::default(),
        }
    }
}

impl GraphGenConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks that don't need the dataset. Class-count-dependent checks happen when the
    /// model is built.
    pub fn validate(&self) -> Result<()> {
        let d = &self.dataset;
        if d.max_prev_nodes == 0 {
            return Err(GenError::config("max_prev_nodes must be at least 1"));
        }
        if d.restrict_min_atoms > d.restrict_max_atoms {
            return Err(GenError::config(format!(
                "restrict_min_atoms ({}) is above restrict_max_atoms ({})",
                d.restrict_min_atoms, d.restrict_max_atoms
            )));
        }
        if d.cols_to_read.is_empty() {
            return Err(GenError::config("cols_to_read needs at least the SMILES column"));
        }
        if !d.delimiter.is_ascii() {
            return Err(GenError::config("delimiter must be a single ASCII character"));
        }

        let m = &self.model;
        if m.node_rnn.output_size != Some(m.edge_rnn.hidden_size) {
            return Err(GenError::config(format!(
                "node_rnn output_size ({:?}) must equal edge_rnn hidden_size ({})",
                m.node_rnn.output_size, m.edge_rnn.hidden_size
            )));
        }
        for rnn in [&m.node_rnn, &m.edge_rnn] {
            if rnn.num_layers == 0 || rnn.hidden_size == 0 {
                return Err(GenError::config("RNNs need at least one layer, of nonzero width"));
            }
        }

        if !(self.sampler.temperature > 0.) {
            return Err(GenError::config("sampling temperature must be positive"));
        }
        if !(self.loss.gamma > 0. && self.loss.gamma <= 1.) {
            return Err(GenError::config("gamma must be in (0, 1]"));
        }
        if !(self.train.lr > 0.) {
            return Err(GenError::config("learning rate must be positive"));
        }
        if self.train.batch_size == 0 {
            return Err(GenError::config("batch_size must be at least 1"));
        }
        if let Some(bonds) = &self.max_atom_bonds {
            if bonds.iter().any(|&b| !(b >= 0.)) {
                return Err(GenError::config("max_atom_bonds entries must be non-negative"));
            }
        }
        if let Some(last) = self.reward.critic.mlp_hidden.last() {
            if *last == 0 {
                return Err(GenError::config("critic MLP output width must be nonzero"));
            }
        } else {
            return Err(GenError::config("critic MLP needs at least one layer"));
        }
        if self.reward.critic.conv_hidden.is_empty() {
            return Err(GenError::config("critic needs at least one graph convolution"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = GraphGenConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.dataset.max_prev_nodes, 12);
        assert_eq!(cfg.loss.gamma, 0.97);
        assert_eq!(cfg.train.random_seed, 1_476);
    }

    #[test]
    fn mismatched_rnn_sizes_rejected() {
        let mut cfg = GraphGenConfig::default();
        cfg.model.edge_rnn.hidden_size = 64;
        assert!(matches!(cfg.validate(), Err(GenError::Config(_))));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{ "dataset": { "max_prev_nodes": 8 }, "loss": { "gamma": 1.0 } }"#;
        let cfg: GraphGenConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.dataset.max_prev_nodes, 8);
        assert_eq!(cfg.dataset.restrict_max_atoms, 80);
        assert_eq!(cfg.loss.gamma, 1.);
        assert!(cfg.loss.enable_supervised_loss);
        cfg.validate().unwrap();
    }

    #[test]
    fn shaping() {
        let max = TargetShaping::Maximize {
            center: 300.,
            scale: 50.,
        };
        assert!((max.apply(300.) - 0.5).abs() < 1e-6);
        assert!(max.apply(400.) > max.apply(350.));

        let prox = TargetShaping::Proximity {
            target: 1.,
            width: 0.5,
        };
        assert!((prox.apply(1.) - 1.).abs() < 1e-6);
        assert!(prox.apply(2.) < prox.apply(1.5));
    }
}
