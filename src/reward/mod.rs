//! Scores completed molecule graphs. The heuristic part (QED and SA) runs per molecule on
//! the thread pool; the critic part runs sequentially on the execution device.
//!
//! A graph that fails sanitization, or whose reward comes out non-finite, scores the
//! configured `invalid_penalty`. It is still returned, so callers can log it.

pub mod critic;

use candle_core::Device;
use log::{debug, warn};
use rayon::prelude::*;

pub use critic::Critic;

use crate::{
    chem::{
        MolGraph, SanitizedMol,
        descriptors::{qed, sa_score},
        sanitize, write_smiles,
    },
    config::{RewardCombination, RewardConfig},
    error::Result,
};

#[derive(Clone, Debug)]
pub struct ScoredMolecule {
    pub graph: MolGraph,
    pub smiles: String,
    pub reward: f32,
    /// Passed sanitization and produced a finite reward.
    pub valid: bool,
    pub qed: Option<f32>,
    /// Raw SA score, 1 (easy) to 10 (hard).
    pub sa: Option<f32>,
    /// Raw critic prediction, before shaping.
    pub critic: Option<f32>,
}

pub struct RewardEvaluator {
    cfg: RewardConfig,
    critic: Option<Critic>,
}

impl RewardEvaluator {
    /// Loads the critic if the config names a checkpoint.
    pub fn new(cfg: &RewardConfig, device: &Device) -> Result<Self> {
        let critic = match &cfg.critic.checkpoint {
            Some(path) => Some(Critic::load(path, &cfg.critic, device)?),
            None => None,
        };

        Ok(Self {
            cfg: cfg.clone(),
            critic,
        })
    }

    pub fn with_critic(cfg: &RewardConfig, critic: Critic) -> Self {
        Self {
            cfg: cfg.clone(),
            critic: Some(critic),
        }
    }

    pub fn has_critic(&self) -> bool {
        self.critic.is_some()
    }

    /// Weighted QED plus SA, with SA mapped onto [0, 1] (1 = easiest to make).
    pub fn heuristic(&self, qed: f32, sa: f32) -> f32 {
        self.cfg.qed_weight * qed + self.cfg.sa_weight * (10. - sa) / 9.
    }

    fn combine(&self, heuristic: f32, critic: Option<f32>) -> f32 {
        let Some(raw) = critic else {
            return heuristic;
        };
        let shaped = self.cfg.shaping.apply(raw);

        match self.cfg.combination {
            RewardCombination::Sum => heuristic + shaped,
            RewardCombination::WeightedBlend {
                heuristic: w_h,
                critic: w_c,
            } => w_h * heuristic + w_c * shaped,
        }
    }

    fn invalid(&self, graph: &MolGraph, smiles: String) -> ScoredMolecule {
        ScoredMolecule {
            graph: graph.clone(),
            smiles,
            reward: self.cfg.invalid_penalty,
            valid: false,
            qed: None,
            sa: None,
            critic: None,
        }
    }

    /// One score per input graph, in order.
    pub fn evaluate(&self, graphs: &[MolGraph]) -> Result<Vec<ScoredMolecule>> {
        let prepared: Vec<(String, Option<(SanitizedMol, f32, f32)>)> = graphs
            .par_iter()
            .map(|g| {
                let smiles = write_smiles(g);
                match sanitize(g) {
                    Ok(mol) => {
                        let q = qed(&mol);
                        let sa = sa_score(&mol);
                        (smiles, Some((mol, q, sa)))
                    }
                    Err(e) => {
                        debug!("Invalid molecule {smiles}: {e}");
                        (smiles, None)
                    }
                }
            })
            .collect();

        let mut result = Vec::with_capacity(graphs.len());
        for (graph, (smiles, prep)) in graphs.iter().zip(prepared) {
            let Some((mol, q, sa)) = prep else {
                result.push(self.invalid(graph, smiles));
                continue;
            };

            let critic = match &self.critic {
                Some(c) => Some(c.predict(&mol)?),
                None => None,
            };
            let reward = self.combine(self.heuristic(q, sa), critic);

            if !reward.is_finite() {
                warn!("Non-finite reward for {smiles}; using the invalid penalty");
                result.push(self.invalid(graph, smiles));
                continue;
            }

            result.push(ScoredMolecule {
                graph: graph.clone(),
                smiles,
                reward,
                valid: true,
                qed: Some(q),
                sa: Some(sa),
                critic,
            });
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chem::{Atom, BondOrder, parse_smiles},
        config::TargetShaping,
    };

    fn evaluator(cfg: &RewardConfig) -> RewardEvaluator {
        RewardEvaluator::new(cfg, &Device::Cpu).unwrap()
    }

    #[test]
    fn invalid_molecule_gets_penalty() {
        let cfg = RewardConfig {
            invalid_penalty: -0.25,
            ..Default::default()
        };
        let ev = evaluator(&cfg);

        // Pentavalent carbon.
        let mut g = MolGraph::new();
        let c = g.add_atom(Atom::new(6));
        for _ in 0..5 {
            let f = g.add_atom(Atom::new(9));
            g.add_bond(c, f, BondOrder::Single).unwrap();
        }

        let scored = ev.evaluate(&[g]).unwrap();
        assert_eq!(scored.len(), 1);
        assert!(!scored[0].valid);
        assert!(scored[0].reward.is_finite());
        assert_eq!(scored[0].reward, -0.25);
    }

    #[test]
    fn disconnected_graph_is_invalid() {
        let ev = evaluator(&RewardConfig::default());
        let g = parse_smiles("CCO.CC").unwrap();
        let scored = ev.evaluate(&[g]).unwrap();
        assert!(!scored[0].valid);
        assert_eq!(scored[0].reward, 0.);
    }

    #[test]
    fn heuristic_only_without_critic() {
        let cfg = RewardConfig::default();
        let ev = evaluator(&cfg);
        assert!(!ev.has_critic());

        let graphs: Vec<_> = ["CC(=O)Oc1ccccc1C(=O)O", "c1ccccc1", "CCN(CC)CC"]
            .iter()
            .map(|s| parse_smiles(s).unwrap())
            .collect();
        let scored = ev.evaluate(&graphs).unwrap();
        assert_eq!(scored.len(), 3);

        for s in &scored {
            assert!(s.valid);
            let (q, sa) = (s.qed.unwrap(), s.sa.unwrap());
            assert!((0. ..=1.).contains(&q));
            assert!((1. ..=10.).contains(&sa));
            assert!((s.reward - ev.heuristic(q, sa)).abs() < 1e-6);
            assert!(s.critic.is_none());
        }
    }

    #[test]
    fn combination_policies() {
        let mut cfg = RewardConfig {
            shaping: TargetShaping::Identity,
            ..Default::default()
        };
        let ev = evaluator(&cfg);
        assert_eq!(ev.combine(0.5, None), 0.5);
        assert_eq!(ev.combine(0.5, Some(2.)), 2.5);

        cfg.combination = RewardCombination::WeightedBlend {
            heuristic: 0.25,
            critic: 0.5,
        };
        let ev = evaluator(&cfg);
        assert!((ev.combine(2., Some(3.)) - 2.).abs() < 1e-6);
    }

    #[test]
    fn maximize_shaping_is_monotonic() {
        let shaping = TargetShaping::Maximize {
            center: 300.,
            scale: 50.,
        };
        assert!((shaping.apply(300.) - 0.5).abs() < 1e-6);
        assert!(shaping.apply(400.) > shaping.apply(350.));
        assert!(shaping.apply(100.) < 0.05);
    }
}
