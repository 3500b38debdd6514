//! A frozen graph-classification network (Graph2Label: graph convolutions, max-pooling
//! over atoms, then an MLP), used as a learned reward term. Weights come from a safetensors
//! checkpoint whose keys carry a 7-character data-parallel prefix (`module.`).

use std::{
    collections::{BTreeSet, HashMap},
    path::Path,
};

use candle_core::{DType, Device, Module, Tensor};
use candle_nn as nn;
use candle_nn::{Linear, VarBuilder, VarMap};
use log::info;

use crate::{
    chem::{SanitizedMol, attributes::AtomFeaturizer},
    config::CriticConfig,
    error::{GenError, Result},
};

/// Characters dropped from the front of every checkpoint key.
pub const KEY_PREFIX_LEN: usize = 7;

/// `relu(adj · x · W + b)`, with `W` stored `[in, out]`.
struct GraphConvolution {
    weight: Tensor,
    bias: Tensor,
}

impl GraphConvolution {
    fn new(vb: VarBuilder, in_dim: usize, out_dim: usize) -> candle_core::Result<Self> {
        let weight = vb.get_with_hints((in_dim, out_dim), "weight", nn::init::DEFAULT_KAIMING_NORMAL)?;
        let bias = vb.get_with_hints(out_dim, "bias", nn::init::ZERO)?;
        Ok(Self { weight, bias })
    }

    fn forward(&self, x: &Tensor, adj: &Tensor) -> candle_core::Result<Tensor> {
        adj.matmul(&x.matmul(&self.weight)?)?
            .broadcast_add(&self.bias)?
            .relu()
    }
}

struct Graph2Label {
    convs: Vec<GraphConvolution>,
    dense: Linear,
    mlp: Vec<Linear>,
}

impl Graph2Label {
    fn new(vb: VarBuilder, cfg: &CriticConfig, num_features: usize) -> candle_core::Result<Self> {
        let enc = vb.pp("Encoder");

        let mut convs = Vec::with_capacity(cfg.conv_hidden.len());
        let mut in_dim = num_features;
        for (i, &out) in cfg.conv_hidden.iter().enumerate() {
            convs.push(GraphConvolution::new(
                enc.pp("graph_convolutions").pp(i.to_string()),
                in_dim,
                out,
            )?);
            in_dim = out;
        }
        let dense = nn::linear(in_dim, cfg.encoder_dim, enc.pp("dense"))?;

        let mut mlp = Vec::with_capacity(cfg.mlp_hidden.len());
        let mut in_dim = cfg.encoder_dim;
        for (i, &out) in cfg.mlp_hidden.iter().enumerate() {
            mlp.push(nn::linear(in_dim, out, vb.pp("MLP").pp("layers").pp(i.to_string()))?);
            in_dim = out;
        }

        Ok(Self { convs, dense, mlp })
    }

    /// `x`: `[atoms, features]`; `adj`: normalized `[atoms, atoms]`. Returns `[1, outputs]`.
    fn forward(&self, x: &Tensor, adj: &Tensor) -> candle_core::Result<Tensor> {
        let mut h = x.clone();
        for conv in &self.convs {
            h = conv.forward(&h, adj)?;
        }
        let h = self.dense.forward(&h)?.tanh()?;
        let mut out = h.max_keepdim(0)?; // [1, encoder_dim]

        let last = self.mlp.len().saturating_sub(1);
        for (i, layer) in self.mlp.iter().enumerate() {
            out = layer.forward(&out)?;
            if i < last {
                out = out.relu()?;
            }
        }
        Ok(out)
    }
}

/// `D^-1/2 (A + I) D^-1/2`, row-major.
pub fn normalized_adjacency(mol: &SanitizedMol) -> Vec<f32> {
    let n = mol.graph.num_atoms();
    let mut a = vec![0f32; n * n];
    for i in 0..n {
        a[i * n + i] = 1.;
    }
    for b in &mol.graph.bonds {
        a[b.atom_0 * n + b.atom_1] = 1.;
        a[b.atom_1 * n + b.atom_0] = 1.;
    }

    let inv_sqrt_deg: Vec<f32> = (0..n)
        .map(|i| 1. / a[i * n..(i + 1) * n].iter().sum::<f32>().sqrt())
        .collect();
    for i in 0..n {
        for j in 0..n {
            a[i * n + j] *= inv_sqrt_deg[i] * inv_sqrt_deg[j];
        }
    }
    a
}

/// Drop the data-parallel prefix from every key.
pub fn strip_key_prefix(tensors: HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> {
    let mut short = Vec::new();
    let mut out = HashMap::with_capacity(tensors.len());
    for (key, t) in tensors {
        match key.get(KEY_PREFIX_LEN..) {
            Some(rest) if !rest.is_empty() => {
                out.insert(rest.to_owned(), t);
            }
            _ => short.push(key),
        }
    }
    if !short.is_empty() {
        short.sort();
        return Err(GenError::Checkpoint {
            missing: Vec::new(),
            unexpected: short,
        });
    }
    Ok(out)
}

pub struct Critic {
    model: Graph2Label,
    featurizer: AtomFeaturizer,
    device: Device,
}

impl Critic {
    pub fn load(path: &Path, cfg: &CriticConfig, device: &Device) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path, device)?;
        let critic = Self::from_checkpoint_tensors(tensors, cfg, device)?;
        info!("Loaded critic from {}", path.display());
        Ok(critic)
    }

    /// Build from prefixed checkpoint tensors. The stripped key set must match the
    /// architecture's parameters exactly.
    pub fn from_checkpoint_tensors(
        tensors: HashMap<String, Tensor>,
        cfg: &CriticConfig,
        device: &Device,
    ) -> Result<Self> {
        let featurizer = cfg.featurizer.clone().validated()?;
        let num_features = featurizer.num_features();
        let tensors = strip_key_prefix(tensors)?;

        // Parameter names the architecture expects.
        let expected: BTreeSet<String> = {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
            Graph2Label::new(vb, cfg, num_features)?;
            let data = varmap
                .data()
                .lock()
                .map_err(|_| GenError::config("critic parameter map is poisoned"))?;
            let keys = data.keys().cloned().collect();
            keys
        };
        let found: BTreeSet<String> = tensors.keys().cloned().collect();

        let missing: Vec<String> = expected.difference(&found).cloned().collect();
        let unexpected: Vec<String> = found.difference(&expected).cloned().collect();
        if !missing.is_empty() || !unexpected.is_empty() {
            return Err(GenError::Checkpoint { missing, unexpected });
        }

        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        let model = Graph2Label::new(vb, cfg, num_features)?;

        Ok(Self {
            model,
            featurizer,
            device: device.clone(),
        })
    }

    /// The network's first output for one molecule.
    pub fn predict(&self, mol: &SanitizedMol) -> Result<f32> {
        let n = mol.graph.num_atoms();
        let f = self.featurizer.num_features();

        let x = Tensor::from_vec(self.featurizer.featurize(mol), (n, f), &self.device)?;
        let adj = Tensor::from_vec(normalized_adjacency(mol), (n, n), &self.device)?;

        let out: Vec<Vec<f32>> = self.model.forward(&x, &adj)?.to_vec2()?;
        out.first()
            .and_then(|row| row.first())
            .copied()
            .ok_or_else(|| GenError::config("critic produced no output"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chem::{parse_smiles, sanitize};

    fn small_cfg() -> CriticConfig {
        CriticConfig {
            conv_hidden: vec![8, 8],
            encoder_dim: 6,
            mlp_hidden: vec![4, 1],
            ..Default::default()
        }
    }

    /// Random parameters for `cfg`, keyed the way a data-parallel trainer saves them.
    fn prefixed_params(cfg: &CriticConfig, dev: &Device) -> HashMap<String, Tensor> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
        Graph2Label::new(vb, cfg, cfg.featurizer.num_features()).unwrap();
        let data = varmap.data().lock().unwrap();
        let params = data
            .iter()
            .map(|(k, v)| (format!("module.{k}"), v.as_tensor().clone()))
            .collect();
        params
    }

    #[test]
    fn loads_prefixed_safetensors() {
        let dev = Device::Cpu;
        let cfg = small_cfg();
        let params = prefixed_params(&cfg, &dev);
        assert!(params.contains_key("module.Encoder.graph_convolutions.0.weight"));
        assert!(params.contains_key("module.MLP.layers.1.bias"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("critic.safetensors");
        candle_core::safetensors::save(&params, &path).unwrap();

        let critic = Critic::load(&path, &cfg, &dev).unwrap();
        let mol = sanitize(&parse_smiles("CC(=O)Oc1ccccc1C(=O)O").unwrap()).unwrap();
        let a = critic.predict(&mol).unwrap();
        let b = critic.predict(&mol).unwrap();
        assert!(a.is_finite());
        assert_eq!(a, b);
    }

    #[test]
    fn key_mismatch_is_an_error() {
        let dev = Device::Cpu;
        let cfg = small_cfg();

        let mut params = prefixed_params(&cfg, &dev);
        params.remove("module.Encoder.dense.bias");
        params.insert("module.extra.weight".to_owned(), Tensor::zeros(2, DType::F32, &dev).unwrap());

        match Critic::from_checkpoint_tensors(params, &cfg, &dev) {
            Err(GenError::Checkpoint { missing, unexpected }) => {
                assert_eq!(missing, vec!["Encoder.dense.bias".to_owned()]);
                assert_eq!(unexpected, vec!["extra.weight".to_owned()]);
            }
            other => panic!("expected a checkpoint error, got {:?}", other.err()),
        }
    }

    #[test]
    fn short_keys_are_an_error() {
        let dev = Device::Cpu;
        let mut params = prefixed_params(&small_cfg(), &dev);
        params.insert("w".to_owned(), Tensor::zeros(1, DType::F32, &dev).unwrap());
        assert!(matches!(
            Critic::from_checkpoint_tensors(params, &small_cfg(), &dev),
            Err(GenError::Checkpoint { .. })
        ));
    }

    #[test]
    fn adjacency_is_symmetric_normalized() {
        let mol = sanitize(&parse_smiles("CCO").unwrap()).unwrap();
        let a = normalized_adjacency(&mol);
        // Degrees with self-loops: 2, 3, 2.
        assert!((a[0] - 0.5).abs() < 1e-6);
        assert!((a[1] - 1. / 6f32.sqrt()).abs() < 1e-6);
        assert_eq!(a[1], a[3]);
        assert_eq!(a[2], 0.);
    }
}
