//! The two-level recurrent generator (GraphRNN). The node network reads one step per node
//! and produces a context vector; the node head predicts the next node's class from it,
//! and the edge network, seeded with it, emits the next node's edge window one slot at a
//! time.
//!
//! Position `t` of a training sequence predicts step `t + 1`; the last position predicts an
//! all no-edge window, which is the end-of-graph signal.

pub(crate) mod gru;

use candle_core::{D, DType, Device, IndexOp, Module, Tensor};
use candle_nn as nn;
use candle_nn::{Embedding, Linear, VarBuilder};
use log::debug;

use crate::{
    config::{ModelConfig, RnnConfig},
    dataset::SequenceBatch,
    error::{GenError, Result},
    model::gru::GruPlain,
};

/// Sizes fixed by the data rather than the architecture config.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ModelDims {
    pub num_node_classes: usize,
    pub num_edge_classes: usize,
    /// The BFS window, W.
    pub window: usize,
    pub max_num_nodes: usize,
}

impl ModelDims {
    /// Edges are a single present/absent bit.
    pub fn binary_edges(&self) -> bool {
        self.num_edge_classes <= 2
    }

    /// Node classes are predicted, rather than fixed at the start class.
    pub fn predicts_nodes(&self) -> bool {
        self.num_node_classes > 2
    }
}

struct NodeMlp {
    hidden: Linear,
    out: Linear,
}

impl NodeMlp {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        self.out.forward(&self.hidden.forward(x)?.relu()?)
    }
}

pub struct GraphRnn {
    pub dims: ModelDims,
    node_rnn: GruPlain,
    edge_rnn: GruPlain,
    /// Multi-class edges only. Row `num_edge_classes` is the start-of-window input.
    edge_emb: Option<Embedding>,
    node_emb: Option<Embedding>,
    node_mlp: Option<NodeMlp>,
    device: Device,
}

impl GraphRnn {
    pub fn new(vb: VarBuilder, cfg: &ModelConfig, dims: ModelDims) -> Result<Self> {
        if dims.num_node_classes == 0 || dims.num_edge_classes < 2 || dims.window == 0 {
            return Err(GenError::config(format!("invalid model dimensions: {dims:?}")));
        }
        let node_out = cfg.node_rnn.output_size.unwrap_or(cfg.node_rnn.hidden_size);
        if node_out != cfg.edge_rnn.hidden_size {
            return Err(GenError::config(format!(
                "node RNN output ({node_out}) must match edge RNN hidden size ({})",
                cfg.edge_rnn.hidden_size
            )));
        }

        let device = vb.device().clone();

        let (edge_emb, mut node_input, edge_input) = if dims.binary_edges() {
            (None, dims.window, 1)
        } else {
            let emb = nn::embedding(
                dims.num_edge_classes + 1,
                cfg.edge_embedding_dim,
                vb.pp("edge_emb"),
            )?;
            (Some(emb), cfg.edge_embedding_dim * dims.window, cfg.edge_embedding_dim)
        };

        let (node_emb, node_mlp) = if dims.predicts_nodes() {
            node_input += cfg.node_embedding_dim;
            let emb = nn::embedding(dims.num_node_classes, cfg.node_embedding_dim, vb.pp("node_emb"))?;
            let mlp = NodeMlp {
                hidden: nn::linear(node_out, cfg.node_mlp_hidden, vb.pp("node_mlp.hidden"))?,
                out: nn::linear(cfg.node_mlp_hidden, dims.num_node_classes, vb.pp("node_mlp.out"))?,
            };
            (Some(emb), Some(mlp))
        } else {
            (None, None)
        };

        let node_rnn = GruPlain::new(vb.pp("node_rnn"), node_input, &cfg.node_rnn)?;

        let edge_cfg = RnnConfig {
            output_size: Some(if dims.binary_edges() { 1 } else { dims.num_edge_classes }),
            ..cfg.edge_rnn.clone()
        };
        let edge_rnn = GruPlain::new(vb.pp("edge_rnn"), edge_input, &edge_cfg)?;

        Ok(Self {
            dims,
            node_rnn,
            edge_rnn,
            edge_emb,
            node_emb,
            node_mlp,
            device,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Input id standing for "no previous slot" in the edge network.
    pub fn edge_start_id(&self) -> u32 {
        if self.dims.binary_edges() {
            1
        } else {
            self.dims.num_edge_classes as u32
        }
    }

    pub fn zero_node_state(&self, batch: usize) -> Result<Vec<Tensor>> {
        Ok(self.node_rnn.zero_state(batch, &self.device)?)
    }

    /// Node network input for a batch of steps. `labels`: `[B]` u32; `windows`: `[B, W]` u32.
    fn node_input(&self, labels: &Tensor, windows: &Tensor) -> Result<Tensor> {
        let b = windows.dim(0)?;
        let mut x = match &self.edge_emb {
            Some(emb) => {
                let e = emb.forward(windows)?; // [B, W, E]
                let width = e.dim(1)? * e.dim(2)?;
                e.reshape((b, width))?
            }
            None => windows.to_dtype(DType::F32)?,
        };
        if let Some(emb) = &self.node_emb {
            x = Tensor::cat(&[x, emb.forward(labels)?], 1)?;
        }
        Ok(x)
    }

    /// One node-network step. Returns the context `[B, edge hidden]` and new hidden state.
    pub fn node_step(&self, labels: &Tensor, windows: &Tensor, h: &[Tensor]) -> Result<(Tensor, Vec<Tensor>)> {
        let x = self.node_input(labels, windows)?;
        Ok(self.node_rnn.step(&x, h)?)
    }

    /// Next-node class logits from a context, if node classes are predicted.
    pub fn node_logits(&self, context: &Tensor) -> Result<Option<Tensor>> {
        match &self.node_mlp {
            Some(mlp) => Ok(Some(mlp.forward(context)?)),
            None => Ok(None),
        }
    }

    /// Edge-network state seeded from node contexts: the first layer starts at the context,
    /// the rest at zero.
    pub fn edge_initial_state(&self, context: &Tensor) -> Result<Vec<Tensor>> {
        let n = context.dim(0)?;
        let mut h = self.edge_rnn.zero_state(n, &self.device)?;
        h[0] = context.clone();
        Ok(h)
    }

    /// One edge-network step. `prev`: `[N]` u32 class of the previous slot, or
    /// `edge_start_id()`. Returns logits `[N, classes]` (`[N, 1]` for binary edges).
    pub fn edge_step(&self, prev: &Tensor, h: &[Tensor]) -> Result<(Tensor, Vec<Tensor>)> {
        let x = match &self.edge_emb {
            Some(emb) => emb.forward(prev)?,
            None => prev.to_dtype(DType::F32)?.unsqueeze(1)?,
        };
        Ok(self.edge_rnn.step(&x, h)?)
    }

    /// Cross-entropy over next-node classes plus (binary) cross-entropy over every real edge
    /// slot, using ground truth as the previous-step inputs. Degree masks in the batch are
    /// added to the edge logits.
    pub fn supervised_loss(&self, batch: &SequenceBatch) -> Result<Tensor> {
        let dev = &self.device;
        let b = batch.batch_size;
        let w = batch.window;
        if w != self.dims.window {
            return Err(GenError::config(format!(
                "batch window {w} doesn't match model window {}",
                self.dims.window
            )));
        }

        let t_len = batch.max_len.min(self.dims.max_num_nodes);
        if t_len < batch.max_len {
            debug!(
                "Truncating sequences of length {} to the model's {} nodes",
                batch.max_len, t_len
            );
        }
        if b == 0 || t_len == 0 {
            return Err(GenError::config("supervised loss on an empty batch"));
        }
        let lengths: Vec<usize> = batch.lengths.iter().map(|&l| l.min(t_len)).collect();

        let labels = Tensor::from_slice(&batch.labels, (b, batch.max_len), dev)?;
        let windows = Tensor::from_slice(&batch.windows, (b, batch.max_len, w), dev)?;

        let mut h = self.zero_node_state(b)?;
        let mut contexts = Vec::with_capacity(t_len);
        for t in 0..t_len {
            let l_t = labels.i((.., t))?.contiguous()?;
            let w_t = windows.i((.., t, ..))?.contiguous()?;
            let (ctx, h_new) = self.node_step(&l_t, &w_t, &h)?;
            h = h_new;
            contexts.push(ctx);
        }
        let ctx = Tensor::stack(&contexts, 1)?; // [B, T, H]
        let hidden = ctx.dim(2)?;
        let ctx = ctx.reshape((b * t_len, hidden))?;

        // Rows into the flattened [B * T] context; `row = bi * t_len + t`.
        let row = |bi: usize, t: usize| (bi * t_len + t) as u32;
        let host = |bi: usize, t: usize| bi * batch.max_len + t;

        // Node classes: every position but each sequence's last.
        let mut node_loss = Tensor::zeros((), DType::F32, dev)?;
        if self.dims.predicts_nodes() {
            let mut rows = Vec::new();
            let mut targets = Vec::new();
            for (bi, &len) in lengths.iter().enumerate() {
                for t in 0..len.saturating_sub(1) {
                    rows.push(row(bi, t));
                    targets.push(batch.next_labels[host(bi, t)]);
                }
            }
            if !rows.is_empty() {
                let n = rows.len();
                let rows = Tensor::from_vec(rows, n, dev)?;
                let targets = Tensor::from_vec(targets, n, dev)?;
                if let Some(logits) = self.node_logits(&ctx.index_select(&rows, 0)?)? {
                    node_loss = nn::loss::cross_entropy(&logits, &targets)?;
                }
            }
        }

        // Edges: every position, including the end-of-graph one.
        let mut rows = Vec::new();
        let mut positions = Vec::new();
        for (bi, &len) in lengths.iter().enumerate() {
            for t in 0..len {
                rows.push(row(bi, t));
                positions.push((bi, t));
            }
        }
        let m = rows.len();
        let ctx_e = ctx.index_select(&Tensor::from_vec(rows, m, dev)?, 0)?;

        let mut slot_targets = vec![0u32; m * w];
        for (r, &(bi, t)) in positions.iter().enumerate() {
            let start = host(bi, t) * w;
            slot_targets[r * w..(r + 1) * w].copy_from_slice(&batch.next_windows[start..start + w]);
        }

        let mut h = self.edge_initial_state(&ctx_e)?;
        let mut prev = Tensor::full(self.edge_start_id(), m, dev)?;
        let mut slot_logits = Vec::with_capacity(w);
        for k in 0..w {
            let (logits, h_new) = self.edge_step(&prev, &h)?;
            h = h_new;
            slot_logits.push(logits);
            if k + 1 < w {
                let next: Vec<u32> = (0..m).map(|r| slot_targets[r * w + k]).collect();
                prev = Tensor::from_vec(next, m, dev)?;
            }
        }
        let out_dim = slot_logits[0].dim(1)?;
        let logits = Tensor::stack(&slot_logits, 1)?.reshape((m * w, out_dim))?;

        // Slot k at position t is node t - k, which exists only for k <= t.
        let mut valid = Vec::new();
        for (r, &(_, t)) in positions.iter().enumerate() {
            for k in 0..w.min(t + 1) {
                valid.push((r * w + k) as u32);
            }
        }
        let n_valid = valid.len();
        let targets: Vec<u32> = valid.iter().map(|&i| slot_targets[i as usize]).collect();
        let valid = Tensor::from_vec(valid, n_valid, dev)?;

        let k_classes = self.dims.num_edge_classes;
        let mask = match &batch.degree_masks {
            Some(masks) => {
                let mut flat = vec![0f32; m * w * k_classes];
                for (r, &(bi, t)) in positions.iter().enumerate() {
                    let start = host(bi, t) * w * k_classes;
                    flat[r * w * k_classes..(r + 1) * w * k_classes]
                        .copy_from_slice(&masks[start..start + w * k_classes]);
                }
                Some(Tensor::from_vec(flat, (m * w, k_classes), dev)?)
            }
            None => None,
        };

        let edge_loss = if self.dims.binary_edges() {
            let mut x = logits.squeeze(1)?;
            if let Some(mask) = mask {
                x = (x + mask.i((.., 1))?)?;
            }
            let x = x.index_select(&valid, 0)?;
            let y: Vec<f32> = targets.iter().map(|&c| c as f32).collect();
            let y = Tensor::from_vec(y, n_valid, dev)?;
            binary_cross_entropy_with_logits(&x, &y)?
        } else {
            let x = match mask {
                Some(mask) => (logits + mask)?,
                None => logits,
            };
            let x = x.index_select(&valid, 0)?;
            let y = Tensor::from_vec(targets, n_valid, dev)?;
            nn::loss::cross_entropy(&x, &y)?
        };

        Ok((node_loss + edge_loss)?)
    }
}

/// Mean of `max(x, 0) - x y + ln(1 + e^-|x|)`, which is stable for large `|x|`.
fn binary_cross_entropy_with_logits(x: &Tensor, y: &Tensor) -> candle_core::Result<Tensor> {
    let softplus = (x.abs()?.neg()?.exp()? + 1.)?.log()?;
    ((x.relu()? - (x * y)?)? + softplus)?.mean_all()
}

/// Log-probabilities over the last dimension, after temperature scaling.
pub fn log_probs(logits: &Tensor, temperature: f32) -> Result<Tensor> {
    let scaled = (logits / temperature as f64)?;
    Ok(nn::ops::log_softmax(&scaled, D::Minus1)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use candle_nn::{Optimizer, VarMap};
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::{
        chem::parse_smiles,
        config::{GraphGenConfig, RelabelConfig},
        dataset::SequenceBatch,
        degree::DegreeBudget,
        linearize::{RootChoice, linearize},
        relabel::LabelMaps,
    };

    pub(crate) fn small_config() -> ModelConfig {
        ModelConfig {
            edge_embedding_dim: 4,
            node_embedding_dim: 6,
            node_rnn: RnnConfig {
                embedding_size: 8,
                hidden_size: 12,
                num_layers: 2,
                output_size: Some(10),
                has_output_nonlin: false,
            },
            edge_rnn: RnnConfig {
                embedding_size: 8,
                hidden_size: 10,
                num_layers: 2,
                output_size: None,
                has_output_nonlin: false,
            },
            node_mlp_hidden: 8,
        }
    }

    fn batch(maps: &LabelMaps, window: usize, budget: Option<&DegreeBudget>) -> SequenceBatch {
        let mut rng = StdRng::seed_from_u64(1);
        let seqs: Vec<_> = ["CCO", "c1ccccc1C#N", "CC(=O)Oc1ccccc1"]
            .iter()
            .map(|s| {
                let g = parse_smiles(s).unwrap();
                linearize(&g, maps, window, RootChoice::FirstStart, false, &mut rng).unwrap()
            })
            .collect();
        SequenceBatch::new(&seqs, budget).unwrap()
    }

    #[test]
    fn supervised_loss_is_finite_and_decreases() {
        let dev = Device::Cpu;
        let maps = LabelMaps::new(&RelabelConfig::default()).unwrap();
        let budget = DegreeBudget::new(GraphGenConfig::default().max_atom_bonds.as_ref().unwrap(), &maps).unwrap();
        let dims = ModelDims {
            num_node_classes: maps.num_node_classes(),
            num_edge_classes: maps.num_edge_classes(),
            window: 6,
            max_num_nodes: 20,
        };

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = GraphRnn::new(vb, &small_config(), dims).unwrap();
        let batch = batch(&maps, 6, Some(&budget));

        let mut opt = nn::AdamW::new(
            varmap.all_vars(),
            nn::ParamsAdamW {
                lr: 1e-2,
                ..Default::default()
            },
        )
        .unwrap();

        let first = model.supervised_loss(&batch).unwrap();
        let first_val = first.to_scalar::<f32>().unwrap();
        assert!(first_val.is_finite() && first_val > 0.);

        for _ in 0..20 {
            let loss = model.supervised_loss(&batch).unwrap();
            opt.backward_step(&loss).unwrap();
        }
        let last = model.supervised_loss(&batch).unwrap().to_scalar::<f32>().unwrap();
        assert!(last < first_val);
    }

    #[test]
    fn long_sequences_are_truncated_to_max_nodes() {
        let dev = Device::Cpu;
        let maps = LabelMaps::new(&RelabelConfig::default()).unwrap();
        let budget = DegreeBudget::new(GraphGenConfig::default().max_atom_bonds.as_ref().unwrap(), &maps).unwrap();
        let batch = batch(&maps, 6, Some(&budget));
        assert!(batch.max_len > 4);

        let dims = ModelDims {
            num_node_classes: maps.num_node_classes(),
            num_edge_classes: maps.num_edge_classes(),
            window: 6,
            max_num_nodes: 4,
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = GraphRnn::new(vb, &small_config(), dims).unwrap();

        let loss = model.supervised_loss(&batch).unwrap().to_scalar::<f32>().unwrap();
        assert!(loss.is_finite() && loss > 0.);
    }

    #[test]
    fn binary_edges_and_fixed_nodes() {
        let dev = Device::Cpu;
        let cfg = RelabelConfig {
            node_table: vec![(6, 0)],
            edge_table: vec![(crate::chem::BondOrder::None, 0), (crate::chem::BondOrder::Single, 1)],
            ..Default::default()
        };
        let maps = LabelMaps::new(&cfg).unwrap();
        let dims = ModelDims {
            num_node_classes: 1,
            num_edge_classes: 2,
            window: 4,
            max_num_nodes: 10,
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = GraphRnn::new(vb, &small_config(), dims).unwrap();
        assert!(model.node_emb.is_none() && model.edge_emb.is_none());

        let mut rng = StdRng::seed_from_u64(1);
        let seqs: Vec<_> = ["CCCC", "C1CCCC1", "CC(C)C"]
            .iter()
            .map(|s| linearize(&parse_smiles(s).unwrap(), &maps, 4, RootChoice::FirstStart, false, &mut rng).unwrap())
            .collect();
        let batch = SequenceBatch::new(&seqs, None).unwrap();

        let loss = model.supervised_loss(&batch).unwrap().to_scalar::<f32>().unwrap();
        assert!(loss.is_finite() && loss > 0.);
    }

    #[test]
    fn mismatched_sizes_rejected() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let mut cfg = small_config();
        cfg.edge_rnn.hidden_size = 11;
        let dims = ModelDims {
            num_node_classes: 9,
            num_edge_classes: 4,
            window: 12,
            max_num_nodes: 20,
        };
        assert!(matches!(GraphRnn::new(vb, &cfg, dims), Err(GenError::Config(_))));
    }

    #[test]
    fn bce_matches_closed_form() {
        let dev = Device::Cpu;
        let x = Tensor::new(&[0f32, 2., -3.], &dev).unwrap();
        let y = Tensor::new(&[1f32, 0., 0.], &dev).unwrap();
        let loss = binary_cross_entropy_with_logits(&x, &y).unwrap().to_scalar::<f32>().unwrap();
        let expected = (2f32.ln() + (1. + 2f32.exp()).ln() + (1. + (-3f32).exp()).ln()) / 3.;
        assert!((loss - expected).abs() < 1e-5);
    }
}
