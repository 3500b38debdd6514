//! The training driver: supervised pretraining on dataset sequences, or REINFORCE on sampled
//! molecules with the supervised term mixed in. Checkpoints and final samples go under
//! `logdir`.

use std::{
    fs,
    path::{Path, PathBuf},
};

use candle_core::DType;
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use log::{debug, info, warn};
use rand::{SeedableRng, rngs::StdRng};
use serde::Serialize;

use crate::{
    config::{GraphGenConfig, TrainMode},
    dataset::GraphDataset,
    error::{GenError, Result},
    files::{SAMPLES_FILE, checkpoint_path, load_maps, maps_path, save_maps},
    loss::PolicyGradientLoss,
    model::{GraphRnn, ModelDims},
    reward::{RewardEvaluator, ScoredMolecule},
    sampler::{Sampler, Trajectory},
};

/// Averages over one REINFORCE step or epoch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepStats {
    pub loss: f32,
    pub policy_loss: f32,
    pub supervised_loss: Option<f32>,
    pub mean_reward: f32,
    pub valid_fraction: f32,
    pub mean_nodes: f32,
}

/// A sampled molecule with its score. A sample outside the configured atom-count range
/// scores the invalid penalty, and is marked not valid.
#[derive(Clone, Debug)]
pub struct Sample {
    pub scored: ScoredMolecule,
    pub in_bounds: bool,
    pub num_nodes: usize,
}

#[derive(Serialize)]
struct SampleRow<'a> {
    smiles: &'a str,
    reward: f32,
    valid: bool,
    in_bounds: bool,
    num_atoms: usize,
    qed: Option<f32>,
    sa: Option<f32>,
    critic: Option<f32>,
}

fn make_sampler<'a>(model: &'a GraphRnn, dataset: &'a GraphDataset, cfg: &GraphGenConfig) -> Result<Sampler<'a>> {
    Sampler::new(
        model,
        dataset.maps(),
        dataset.budget(),
        cfg.sampler.temperature,
        (cfg.dataset.restrict_min_atoms, cfg.dataset.restrict_max_atoms),
    )
}

pub struct Trainer {
    cfg: GraphGenConfig,
    varmap: VarMap,
    model: GraphRnn,
    opt: AdamW,
    rng: StdRng,
    dataset: GraphDataset,
    reward: RewardEvaluator,
    loss: PolicyGradientLoss,
}

impl Trainer {
    pub fn new(cfg: &GraphGenConfig, dataset: GraphDataset) -> Result<Self> {
        let device = cfg.train.device.device()?;

        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let maps = dataset.maps();
        let dims = ModelDims {
            num_node_classes: maps.num_node_classes(),
            num_edge_classes: maps.num_edge_classes(),
            window: dataset.window(),
            max_num_nodes: dataset.max_num_nodes(),
        };
        let model = GraphRnn::new(vb, &cfg.model, dims)?;

        if let Some(path) = &cfg.train.init_checkpoint {
            let saved_maps = maps_path(path);
            if saved_maps.exists() {
                if &load_maps(&saved_maps)? != maps {
                    return Err(GenError::config(format!(
                        "label maps in {} don't match the dataset's",
                        saved_maps.display()
                    )));
                }
            } else {
                warn!("No label maps next to {}; assuming they match the dataset", path.display());
            }
            varmap.load(path)?;
            info!("Loaded generator weights from {}", path.display());
        }

        let opt = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: cfg.train.lr,
                ..Default::default()
            },
        )?;

        let reward = RewardEvaluator::new(&cfg.reward, &device)?;

        info!(
            "Generator: {:?}, {} parameter tensors, device {device:?}",
            dims,
            varmap.all_vars().len()
        );

        Ok(Self {
            cfg: cfg.clone(),
            varmap,
            model,
            opt,
            rng: StdRng::seed_from_u64(cfg.train.random_seed),
            dataset,
            reward,
            loss: PolicyGradientLoss::from(&cfg.loss),
        })
    }

    pub fn model(&self) -> &GraphRnn {
        &self.model
    }

    pub fn dataset(&self) -> &GraphDataset {
        &self.dataset
    }

    /// One pass over the dataset. Returns the mean supervised loss per batch.
    pub fn pretrain_epoch(&mut self) -> Result<f32> {
        let batches = self.dataset.epoch_batches(self.cfg.train.batch_size, &mut self.rng);
        let mut total = 0.;

        for idxs in &batches {
            let batch = self.dataset.batch(idxs, &mut self.rng)?;
            let loss = self.model.supervised_loss(&batch)?;
            self.opt.backward_step(&loss)?;
            total += loss.to_scalar::<f32>()?;
        }

        Ok(total / batches.len().max(1) as f32)
    }

    /// Sample an episode batch, score it, and take one optimizer step on the policy loss,
    /// plus the supervised loss on `supervised_idxs` if that term is enabled.
    pub fn reinforce_step(&mut self, supervised_idxs: Option<&[usize]>) -> Result<StepStats> {
        let n = self.cfg.sampler.episodes_per_step;
        if n == 0 {
            return Err(GenError::config("episodes_per_step must be at least 1"));
        }

        let sampler = make_sampler(&self.model, &self.dataset, &self.cfg)?;
        let trajectories = sampler.sample_batch(n, &mut self.rng)?;
        let scored = self.score(&trajectories)?;

        let rewards: Vec<f32> = scored.iter().map(|s| s.scored.reward).collect();
        let log_probs: Vec<_> = trajectories.iter().map(|t| t.log_probs.clone()).collect();

        let policy = self.loss.policy_loss(&log_probs, &rewards, self.model.device())?;

        let supervised = match supervised_idxs {
            Some(idxs) if self.loss.enable_supervised_loss && !idxs.is_empty() => {
                let batch = self.dataset.batch(idxs, &mut self.rng)?;
                Some(self.model.supervised_loss(&batch)?)
            }
            _ => None,
        };

        let total = self.loss.total(&policy, supervised.as_ref())?;
        self.opt.backward_step(&total)?;

        let n = n as f32;
        Ok(StepStats {
            loss: total.to_scalar::<f32>()?,
            policy_loss: policy.to_scalar::<f32>()?,
            supervised_loss: supervised.map(|s| s.to_scalar::<f32>()).transpose()?,
            mean_reward: rewards.iter().sum::<f32>() / n,
            valid_fraction: scored.iter().filter(|s| s.scored.valid).count() as f32 / n,
            mean_nodes: scored.iter().map(|s| s.num_nodes as f32).sum::<f32>() / n,
        })
    }

    /// One REINFORCE step per dataset batch. Returns the per-step averages.
    pub fn reinforce_epoch(&mut self) -> Result<StepStats> {
        let batches = self.dataset.epoch_batches(self.cfg.train.batch_size, &mut self.rng);
        let mut sum = StepStats::default();
        let mut sup_sum = 0.;
        let mut sup_count = 0;

        for idxs in &batches {
            let s = self.reinforce_step(Some(idxs))?;
            debug!("REINFORCE step: {s:?}");

            sum.loss += s.loss;
            sum.policy_loss += s.policy_loss;
            sum.mean_reward += s.mean_reward;
            sum.valid_fraction += s.valid_fraction;
            sum.mean_nodes += s.mean_nodes;
            if let Some(v) = s.supervised_loss {
                sup_sum += v;
                sup_count += 1;
            }
        }

        let k = batches.len().max(1) as f32;
        Ok(StepStats {
            loss: sum.loss / k,
            policy_loss: sum.policy_loss / k,
            supervised_loss: (sup_count > 0).then(|| sup_sum / sup_count as f32),
            mean_reward: sum.mean_reward / k,
            valid_fraction: sum.valid_fraction / k,
            mean_nodes: sum.mean_nodes / k,
        })
    }

    /// Rewards for sampled trajectories. Out-of-bounds graphs are kept, but score the
    /// invalid penalty and count as invalid.
    fn score(&self, trajectories: &[Trajectory]) -> Result<Vec<Sample>> {
        let maps = self.dataset.maps();
        let graphs = trajectories
            .iter()
            .map(|t| t.to_graph(maps))
            .collect::<Result<Vec<_>>>()?;

        let scored = self.reward.evaluate(&graphs)?;

        Ok(scored
            .into_iter()
            .zip(trajectories)
            .map(|(mut scored, t)| {
                if !t.in_bounds {
                    scored.reward = self.cfg.reward.invalid_penalty;
                    scored.valid = false;
                }
                Sample {
                    scored,
                    in_bounds: t.in_bounds,
                    num_nodes: t.num_nodes(),
                }
            })
            .collect())
    }

    pub fn sample(&mut self, n: usize) -> Result<Vec<Sample>> {
        let sampler = make_sampler(&self.model, &self.dataset, &self.cfg)?;
        let trajectories = sampler.sample_batch(n, &mut self.rng)?;
        self.score(&trajectories)
    }

    /// Writes weights to `logdir/checkpoint/epoch_{epoch}.safetensors`, with the label maps
    /// alongside.
    pub fn save_checkpoint(&self, epoch: usize) -> Result<PathBuf> {
        let path = checkpoint_path(&self.cfg.train.logdir, epoch);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        self.varmap.save(&path)?;
        save_maps(&maps_path(&path), self.dataset.maps())?;
        Ok(path)
    }

    /// Train for the configured epochs, then sample and write the final molecules.
    pub fn run(&mut self) -> Result<()> {
        let t = self.cfg.train.clone();
        fs::create_dir_all(&t.logdir)?;

        info!("Training ({:?}) for {} epochs on {} molecules", t.mode, t.num_epochs, self.dataset.len());

        for epoch in 0..t.num_epochs {
            let print = t.print_every > 0 && epoch % t.print_every == 0;

            match t.mode {
                TrainMode::Pretrain => {
                    let loss = self.pretrain_epoch()?;
                    if print {
                        info!("Epoch {epoch} / {}. Supervised loss: {loss:.4}", t.num_epochs);
                    }
                }
                TrainMode::Reinforce => {
                    let s = self.reinforce_epoch()?;
                    if print {
                        info!(
                            "Epoch {epoch} / {}. Loss: {:.4} (policy {:.4}, supervised {:?}). \
                             Reward: {:.3}, valid: {:.1}%, nodes: {:.1}",
                            t.num_epochs,
                            s.loss,
                            s.policy_loss,
                            s.supervised_loss,
                            s.mean_reward,
                            100. * s.valid_fraction,
                            s.mean_nodes
                        );
                    }
                }
            }

            if t.save_every > 0 && (epoch + 1) % t.save_every == 0 {
                let path = self.save_checkpoint(epoch)?;
                debug!("Saved checkpoint to {}", path.display());
            }
        }

        if t.num_final_samples > 0 {
            let samples = self.sample(t.num_final_samples)?;
            let path = t.logdir.join(SAMPLES_FILE);
            write_samples(&path, &samples)?;

            let valid = samples.iter().filter(|s| s.scored.valid).count();
            info!("Wrote {} samples ({valid} valid) to {}", samples.len(), path.display());
            for s in samples.iter().filter(|s| s.scored.valid).take(10) {
                info!("{}  reward: {:.3}", s.scored.smiles, s.scored.reward);
            }
        }

        Ok(())
    }
}

pub fn write_samples(path: &Path, samples: &[Sample]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    for s in samples {
        wtr.serialize(SampleRow {
            smiles: &s.scored.smiles,
            reward: s.scored.reward,
            valid: s.scored.valid,
            in_bounds: s.in_bounds,
            num_atoms: s.num_nodes,
            qed: s.scored.qed,
            sa: s.scored.sa,
            critic: s.scored.critic,
        })?;
    }
    wtr.flush()?;
    Ok(())
}

/// This is the entry point for training a generator from a config.
pub fn run_training(cfg: &GraphGenConfig) -> Result<()> {
    cfg.validate()?;

    let dataset = GraphDataset::from_csv(cfg)?;
    let mut trainer = Trainer::new(cfg, dataset)?;
    trainer.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::small_config;

    const SMILES: [&str; 6] = [
        "CCO",
        "CC(=O)O",
        "c1ccccc1O",
        "CCN(CC)CC",
        "CC(=O)Oc1ccccc1C(=O)O",
        "OCC(O)CO",
    ];

    fn cfg(logdir: &Path) -> GraphGenConfig {
        let mut cfg = GraphGenConfig::default();
        cfg.model = small_config();
        cfg.dataset.restrict_min_atoms = 2;
        cfg.dataset.restrict_max_atoms = 30;
        cfg.sampler.episodes_per_step = 3;
        cfg.train.batch_size = 4;
        cfg.train.num_epochs = 1;
        cfg.train.lr = 1e-3;
        cfg.train.num_final_samples = 4;
        cfg.train.logdir = logdir.to_owned();
        cfg
    }

    fn trainer(cfg: &GraphGenConfig) -> Trainer {
        let ds = GraphDataset::from_smiles(&SMILES, cfg).unwrap();
        Trainer::new(cfg, ds).unwrap()
    }

    #[test]
    fn reinforce_step_is_finite() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = cfg(dir.path());
        let mut tr = trainer(&cfg);

        let idxs = [0, 1, 2];
        let s = tr.reinforce_step(Some(&idxs)).unwrap();
        assert!(s.loss.is_finite());
        assert!(s.policy_loss.is_finite());
        assert!(s.supervised_loss.unwrap().is_finite());
        assert!((0. ..=1.).contains(&s.valid_fraction));
        assert!(s.mean_nodes >= 1.);

        let s = tr.reinforce_step(None).unwrap();
        assert!(s.supervised_loss.is_none());
        assert_eq!(s.loss, s.policy_loss);
    }

    #[test]
    fn out_of_bounds_samples_count_as_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = cfg(dir.path());
        cfg.reward.invalid_penalty = -0.5;
        let mut tr = trainer(&cfg);
        tr.cfg.dataset.restrict_min_atoms = 1000;

        let s = tr.reinforce_step(None).unwrap();
        assert_eq!(s.valid_fraction, 0.);
        assert_eq!(s.mean_reward, -0.5);

        for sample in tr.sample(3).unwrap() {
            assert!(!sample.in_bounds);
            assert!(!sample.scored.valid);
            assert_eq!(sample.scored.reward, -0.5);
        }
    }

    #[test]
    fn pretraining_reduces_loss() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = cfg(dir.path());
        cfg.dataset.random_order = false;
        cfg.train.lr = 1e-2;
        let mut tr = trainer(&cfg);

        let first = tr.pretrain_epoch().unwrap();
        let mut last = first;
        for _ in 0..15 {
            last = tr.pretrain_epoch().unwrap();
        }
        assert!(first.is_finite());
        assert!(last < first);
    }

    #[test]
    fn checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = cfg(dir.path());
        let tr = trainer(&cfg);
        let path = tr.save_checkpoint(0).unwrap();
        assert!(path.exists());
        assert!(maps_path(&path).exists());

        // Same dataset: the maps match, and weights load.
        let mut cfg_b = cfg.clone();
        cfg_b.train.init_checkpoint = Some(path.clone());
        let tr_b = trainer(&cfg_b);
        let a = tr.varmap.all_vars().len();
        assert_eq!(a, tr_b.varmap.all_vars().len());

        // Different observed atoms under the extending policy: maps differ.
        let mut cfg_c = cfg_b.clone();
        cfg_c.relabel.policy = crate::relabel::RelabelPolicy::Extend;
        let ds = GraphDataset::from_smiles(&["CCO", "CC[Si](C)(C)C"], &cfg_c).unwrap();
        assert!(Trainer::new(&cfg_c, ds).is_err());
    }

    #[test]
    fn run_writes_samples() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = cfg(dir.path());
        let mut tr = trainer(&cfg);
        tr.run().unwrap();

        let mut rdr = csv::Reader::from_path(dir.path().join(SAMPLES_FILE)).unwrap();
        assert_eq!(rdr.records().count(), 4);
        assert!(checkpoint_path(dir.path(), 0).exists());
    }
}
