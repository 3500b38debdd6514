//! Autoregressive decoding of new graphs from a trained generator.
//!
//! Each step runs the node network on the newest node, samples the next node's class, then
//! samples its edges to the previous `min(W, nodes)` nodes one slot at a time. A step whose
//! slots are all no-edge ends the graph.

use std::collections::VecDeque;

use candle_core::{DType, IndexOp, Tensor};
use rand::{Rng, distr::Distribution, distr::weighted::WeightedIndex};

use crate::{
    chem::{MolGraph, write_smiles},
    degree::DegreeBudget,
    error::{GenError, Result},
    linearize::{LinearizedSequence, reconstruct},
    model::{GraphRnn, log_probs},
    relabel::LabelMaps,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// The model emitted an all no-edge window.
    EndOfGraph,
    /// The graph reached `max_num_nodes`.
    MaxNodes,
}

/// Per-episode decoding state.
pub struct GenerationState {
    pub step: usize,
    /// Node-network hidden state, one tensor per layer.
    pub hidden: Vec<Tensor>,
    /// Classes of the newest nodes, newest first; at most W.
    pub recent_labels: VecDeque<usize>,
    /// Running bond-order sum of every node so far.
    pub degrees: Vec<f32>,
}

/// One sampled graph, as a sequence, with what's needed to train on it.
pub struct Trajectory {
    pub node_labels: Vec<usize>,
    pub edge_windows: Vec<Vec<usize>>,
    /// `[steps]`: log-probability of each step's sampled decisions. Differentiable with
    /// respect to the generator's parameters.
    pub log_probs: Tensor,
    pub termination: Termination,
    /// Atom count is within `[restrict_min_atoms, restrict_max_atoms]`.
    pub in_bounds: bool,
    window: usize,
}

impl Trajectory {
    pub fn num_nodes(&self) -> usize {
        self.node_labels.len()
    }

    pub fn num_steps(&self) -> usize {
        self.log_probs.dims1().unwrap_or(0)
    }

    pub fn sequence(&self) -> LinearizedSequence {
        LinearizedSequence {
            node_labels: self.node_labels.clone(),
            edge_windows: self.edge_windows.clone(),
            window: self.window,
            order: Vec::new(),
        }
    }

    pub fn to_graph(&self, maps: &LabelMaps) -> Result<MolGraph> {
        reconstruct(&self.sequence(), maps)
    }

    pub fn to_smiles(&self, maps: &LabelMaps) -> Result<String> {
        Ok(write_smiles(&self.to_graph(maps)?))
    }
}

pub struct Sampler<'a> {
    model: &'a GraphRnn,
    maps: &'a LabelMaps,
    budget: Option<&'a DegreeBudget>,
    temperature: f32,
    /// Inclusive atom-count bounds.
    atom_bounds: (usize, usize),
}

/// Draw a class from log-probabilities over `allowed` classes. Returns `None` if no allowed
/// class has nonzero probability.
fn draw<R: Rng + ?Sized>(logp: &[f32], allowed: &[bool], rng: &mut R) -> Option<usize> {
    let weights: Vec<f32> = logp
        .iter()
        .zip(allowed)
        .map(|(&lp, &ok)| if ok && lp.is_finite() { lp.exp() } else { 0. })
        .collect();
    let dist = WeightedIndex::new(&weights).ok()?;
    Some(dist.sample(rng))
}

impl<'a> Sampler<'a> {
    pub fn new(
        model: &'a GraphRnn,
        maps: &'a LabelMaps,
        budget: Option<&'a DegreeBudget>,
        temperature: f32,
        atom_bounds: (usize, usize),
    ) -> Result<Self> {
        if maps.num_node_classes() != model.dims.num_node_classes
            || maps.num_edge_classes() != model.dims.num_edge_classes
        {
            return Err(GenError::config(
                "relabel maps don't match the model's class counts",
            ));
        }
        if !(temperature > 0.) {
            return Err(GenError::config("sampling temperature must be positive"));
        }
        Ok(Self {
            model,
            maps,
            budget,
            temperature,
            atom_bounds,
        })
    }

    /// Sample one graph.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Trajectory> {
        let model = self.model;
        let dims = model.dims;
        let dev = model.device();
        let w = dims.window;
        let start = self.maps.start_node_label;

        let mut node_labels = vec![start];
        let mut edge_windows = vec![vec![0; w]];
        let mut state = GenerationState {
            step: 0,
            hidden: model.zero_node_state(1)?,
            recent_labels: VecDeque::from([start]),
            degrees: vec![0.],
        };
        let mut step_logps = Vec::new();

        let termination = loop {
            if node_labels.len() >= dims.max_num_nodes {
                break Termination::MaxNodes;
            }
            let t = state.step;

            let label_in = Tensor::new(&[node_labels[t] as u32], dev)?;
            let window_in: Vec<u32> = edge_windows[t].iter().map(|&c| c as u32).collect();
            let window_in = Tensor::from_vec(window_in, (1, w), dev)?;
            let (context, hidden) = model.node_step(&label_in, &window_in, &state.hidden)?;
            state.hidden = hidden;

            let (new_label, node_logp) = match model.node_logits(&context)? {
                Some(logits) => {
                    let logp = log_probs(&logits, self.temperature)?.squeeze(0)?;
                    let host: Vec<f32> = logp.to_vec1()?;
                    let label = draw(&host, &vec![true; host.len()], rng)
                        .ok_or_else(|| GenError::Graph("node class distribution is degenerate".to_owned()))?;
                    (label, Some(logp.i(label)?))
                }
                None => (start, None),
            };

            // Edge slots to the newest min(W, nodes) nodes.
            let n_slots = w.min(node_labels.len());
            let mut window = vec![0; w];
            let mut new_degree = 0.;
            let mut edge_logp: Option<Tensor> = None;
            let mut h = model.edge_initial_state(&context)?;
            let mut prev = Tensor::new(&[model.edge_start_id()], dev)?;

            for k in 0..n_slots {
                let (logits, h_new) = model.edge_step(&prev, &h)?;
                h = h_new;
                let j = node_labels.len() - 1 - k;

                let allowed = match self.budget {
                    Some(b) => b.allowed(new_label, new_degree, state.recent_labels[k], state.degrees[j]),
                    None => vec![true; dims.num_edge_classes],
                };

                let (class, logp) = if dims.binary_edges() {
                    // One logit: P(edge) = sigmoid(x / T).
                    let x = (logits.squeeze(0)? / self.temperature as f64)?;
                    let two = Tensor::cat(&[x.zeros_like()?, x], 0)?;
                    let logp = candle_nn::ops::log_softmax(&two, 0)?;
                    self.draw_edge(&logp, &allowed, rng)?
                } else {
                    let logp = log_probs(&logits, self.temperature)?.squeeze(0)?;
                    self.draw_edge(&logp, &allowed, rng)?
                };

                if let Some(lp) = logp {
                    edge_logp = Some(match edge_logp {
                        Some(acc) => (acc + lp)?,
                        None => lp,
                    });
                }

                window[k] = class;
                let order = self.maps.edges.unrelabel(class)?.as_f32();
                new_degree += order;
                state.degrees[j] += order;
                prev = Tensor::new(&[class as u32], dev)?;
            }

            let ends = window.iter().all(|&c| c == 0);

            // The end-of-graph step is scored by its edge decisions alone; its node class is
            // never used. Those decisions keep the masked distribution they were drawn from,
            // unlike the supervised loss, which leaves the end row unmasked. A slot forced to
            // no-edge contributes nothing.
            let step_logp = if ends {
                edge_logp
            } else {
                match (node_logp, edge_logp) {
                    (Some(a), Some(b)) => Some((a + b)?),
                    (a, b) => a.or(b),
                }
            };
            step_logps.push(match step_logp {
                Some(lp) => lp,
                None => Tensor::zeros((), DType::F32, dev)?,
            });

            if ends {
                break Termination::EndOfGraph;
            }

            node_labels.push(new_label);
            edge_windows.push(window);
            state.degrees.push(new_degree);
            state.recent_labels.push_front(new_label);
            state.recent_labels.truncate(w);
            state.step += 1;
        };

        let log_probs = if step_logps.is_empty() {
            Tensor::zeros(0, DType::F32, dev)?
        } else {
            Tensor::stack(&step_logps, 0)?
        };

        let n = node_labels.len();
        Ok(Trajectory {
            node_labels,
            edge_windows,
            log_probs,
            termination,
            in_bounds: n >= self.atom_bounds.0 && n <= self.atom_bounds.1,
            window: w,
        })
    }

    /// Sample `n` independent graphs.
    pub fn sample_batch<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Result<Vec<Trajectory>> {
        (0..n).map(|_| self.sample(rng)).collect()
    }

    /// Pick an edge class from `logp` (`[classes]`) restricted to `allowed`. If only the
    /// no-edge class is left, it's forced, and contributes no log-probability.
    fn draw_edge<R: Rng + ?Sized>(
        &self,
        logp: &Tensor,
        allowed: &[bool],
        rng: &mut R,
    ) -> Result<(usize, Option<Tensor>)> {
        if !allowed.iter().skip(1).any(|&a| a) {
            return Ok((0, None));
        }

        let host: Vec<f32> = logp.to_vec1()?;
        let class = draw(&host, allowed, rng).unwrap_or(0);

        // Renormalize over the allowed classes, matching the masked logits used in training.
        let mask: Vec<f32> = allowed
            .iter()
            .map(|&ok| if ok { 0. } else { crate::degree::MASKED_LOGIT })
            .collect();
        let mask = Tensor::from_vec(mask, allowed.len(), logp.device())?;
        let renorm = candle_nn::ops::log_softmax(&(logp + mask)?, 0)?;
        Ok((class, Some(renorm.i(class)?)))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;
    use candle_nn::{VarBuilder, VarMap};
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::{
        config::{GraphGenConfig, ModelConfig, RelabelConfig, RnnConfig},
        model::ModelDims,
    };

    fn tiny_model(varmap: &VarMap, maps: &LabelMaps, max_num_nodes: usize) -> GraphRnn {
        let cfg = ModelConfig {
            edge_embedding_dim: 4,
            node_embedding_dim: 4,
            node_rnn: RnnConfig {
                embedding_size: 8,
                hidden_size: 8,
                num_layers: 2,
                output_size: Some(8),
                has_output_nonlin: false,
            },
            edge_rnn: RnnConfig {
                embedding_size: 8,
                hidden_size: 8,
                num_layers: 2,
                output_size: None,
                has_output_nonlin: false,
            },
            node_mlp_hidden: 8,
        };
        let dims = ModelDims {
            num_node_classes: maps.num_node_classes(),
            num_edge_classes: maps.num_edge_classes(),
            window: 12,
            max_num_nodes,
        };
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        GraphRnn::new(vb, &cfg, dims).unwrap()
    }

    #[test]
    fn terminates_within_max_nodes() {
        let maps = LabelMaps::new(&RelabelConfig::default()).unwrap();
        for seed in 0..5 {
            let varmap = VarMap::new();
            let model = tiny_model(&varmap, &maps, 15);
            let sampler = Sampler::new(&model, &maps, None, 1., (1, 80)).unwrap();
            let mut rng = StdRng::seed_from_u64(seed);

            for traj in sampler.sample_batch(4, &mut rng).unwrap() {
                assert!(traj.num_nodes() >= 1 && traj.num_nodes() <= 15);
                assert_eq!(traj.node_labels[0], maps.start_node_label);
                assert!(traj.num_steps() >= 1);
                if traj.termination == Termination::MaxNodes {
                    assert_eq!(traj.num_nodes(), 15);
                }
                let lp: Vec<f32> = traj.log_probs.to_vec1().unwrap();
                assert!(lp.iter().all(|v| v.is_finite() && *v <= 1e-6));
                traj.to_graph(&maps).unwrap();
            }
        }
    }

    #[test]
    fn degree_masks_hold() {
        let maps = LabelMaps::new(&RelabelConfig::default()).unwrap();
        let bonds = GraphGenConfig::default().max_atom_bonds.unwrap();
        let budget = DegreeBudget::new(&bonds, &maps).unwrap();

        for seed in 0..5 {
            let varmap = VarMap::new();
            let model = tiny_model(&varmap, &maps, 25);
            let sampler = Sampler::new(&model, &maps, Some(&budget), 1., (1, 80)).unwrap();
            let mut rng = StdRng::seed_from_u64(100 + seed);

            for traj in sampler.sample_batch(4, &mut rng).unwrap() {
                assert!(budget.admits(&traj.sequence()));
                let g = traj.to_graph(&maps).unwrap();
                for i in 0..g.num_atoms() {
                    let class = maps.nodes.relabel(g.atoms[i].atomic_number).unwrap();
                    assert!(g.bond_order_sum(i) <= bonds[class] + 1e-6);
                }
            }
        }
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let maps = LabelMaps::new(&RelabelConfig::default()).unwrap();
        let varmap = VarMap::new();
        let model = tiny_model(&varmap, &maps, 20);
        let sampler = Sampler::new(&model, &maps, None, 1., (1, 80)).unwrap();

        let a = sampler.sample(&mut StdRng::seed_from_u64(9)).unwrap();
        let b = sampler.sample(&mut StdRng::seed_from_u64(9)).unwrap();
        assert_eq!(a.node_labels, b.node_labels);
        assert_eq!(a.edge_windows, b.edge_windows);
    }

    #[test]
    fn zero_budget_ends_at_the_first_step() {
        let maps = LabelMaps::new(&RelabelConfig::default()).unwrap();
        let budget = DegreeBudget::new(&[0.; 9], &maps).unwrap();
        let varmap = VarMap::new();
        let model = tiny_model(&varmap, &maps, 10);
        let sampler = Sampler::new(&model, &maps, Some(&budget), 1., (1, 80)).unwrap();
        let mut rng = StdRng::seed_from_u64(4);

        for traj in sampler.sample_batch(3, &mut rng).unwrap() {
            assert_eq!(traj.num_nodes(), 1);
            assert_eq!(traj.num_steps(), 1);
            assert_eq!(traj.termination, Termination::EndOfGraph);
            let lp: Vec<f32> = traj.log_probs.to_vec1().unwrap();
            assert_eq!(lp, vec![0.]);
        }
    }

    #[test]
    fn out_of_bounds_is_flagged() {
        let maps = LabelMaps::new(&RelabelConfig::default()).unwrap();
        let varmap = VarMap::new();
        let model = tiny_model(&varmap, &maps, 6);
        let sampler = Sampler::new(&model, &maps, None, 1., (7, 80)).unwrap();
        let traj = sampler.sample(&mut StdRng::seed_from_u64(0)).unwrap();
        assert!(!traj.in_bounds);
    }
}
