//! REINFORCE over sampled trajectories, optionally mixed with the supervised next-step loss.

use candle_core::{Device, Tensor};

use crate::{
    config::LossConfig,
    error::{GenError, Result},
};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PolicyGradientLoss {
    pub gamma: f32,
    pub enable_supervised_loss: bool,
    pub policy_weight: f32,
    pub supervised_weight: f32,
}

impl From<&LossConfig> for PolicyGradientLoss {
    fn from(cfg: &LossConfig) -> Self {
        Self {
            gamma: cfg.gamma,
            enable_supervised_loss: cfg.enable_supervised_loss,
            policy_weight: cfg.policy_weight,
            supervised_weight: cfg.supervised_weight,
        }
    }
}

impl PolicyGradientLoss {
    /// `reward · γ^(len-1-s)` for each step `s`. The last step gets the undiscounted reward.
    pub fn discounted_returns(&self, reward: f32, len: usize) -> Vec<f32> {
        let mut out = vec![0.; len];
        let mut ret = reward;
        for r in out.iter_mut().rev() {
            *r = ret;
            ret *= self.gamma;
        }
        out
    }

    /// `-Σ_batch Σ_steps logp · return / batch_size`. `log_probs` holds one 1-D tensor of
    /// step log-probabilities per trajectory.
    pub fn policy_loss(&self, log_probs: &[Tensor], rewards: &[f32], device: &Device) -> Result<Tensor> {
        if log_probs.is_empty() {
            return Err(GenError::config("policy loss needs at least one trajectory"));
        }
        if log_probs.len() != rewards.len() {
            return Err(GenError::config(format!(
                "{} trajectories but {} rewards",
                log_probs.len(),
                rewards.len()
            )));
        }

        let mut total = Tensor::zeros((), candle_core::DType::F32, device)?;
        for (lp, &reward) in log_probs.iter().zip(rewards) {
            let len = lp.elem_count();
            if len == 0 {
                continue;
            }
            let returns = Tensor::from_vec(self.discounted_returns(reward, len), len, lp.device())?;
            total = (total + (lp.flatten_all()? * returns)?.sum_all()?)?;
        }

        Ok((total.neg()? / log_probs.len() as f64)?)
    }

    /// Weighted sum when the supervised term is enabled and present; the bare policy loss
    /// otherwise.
    pub fn total(&self, policy: &Tensor, supervised: Option<&Tensor>) -> Result<Tensor> {
        match supervised {
            Some(sup) if self.enable_supervised_loss => {
                let p = (policy * self.policy_weight as f64)?;
                let s = (sup * self.supervised_weight as f64)?;
                Ok((p + s)?)
            }
            _ => Ok(policy.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loss(gamma: f32) -> PolicyGradientLoss {
        PolicyGradientLoss::from(&LossConfig {
            gamma,
            ..Default::default()
        })
    }

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn one_step_trajectory() {
        let dev = Device::Cpu;
        let lp = Tensor::new(&[-0.5f32], &dev).unwrap();
        let l = loss(0.97).policy_loss(&[lp], &[1.], &dev).unwrap();
        assert!((scalar(&l) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn returns_discount_toward_the_start() {
        let r = loss(0.5).discounted_returns(2., 3);
        assert_eq!(r, vec![0.5, 1., 2.]);

        let r = loss(1.).discounted_returns(3., 4);
        assert!(r.iter().all(|&v| v == 3.));
    }

    #[test]
    fn averages_over_batch_and_skips_empty() {
        let dev = Device::Cpu;
        let a = Tensor::new(&[-1f32, -2.], &dev).unwrap();
        let empty = Tensor::zeros(0, candle_core::DType::F32, &dev).unwrap();

        // γ = 1: -(-1 - 2) · 2 / 2 = 3
        let l = loss(1.).policy_loss(&[a, empty], &[2., 5.], &dev).unwrap();
        assert!((scalar(&l) - 3.).abs() < 1e-6);
    }

    #[test]
    fn empty_batch_is_an_error() {
        assert!(loss(0.97).policy_loss(&[], &[], &Device::Cpu).is_err());
    }

    #[test]
    fn supervised_term_weighting() {
        let dev = Device::Cpu;
        let p = Tensor::new(2f32, &dev).unwrap();
        let s = Tensor::new(10f32, &dev).unwrap();

        let mut pg = PolicyGradientLoss::from(&LossConfig {
            policy_weight: 0.5,
            supervised_weight: 0.1,
            ..Default::default()
        });
        assert!((scalar(&pg.total(&p, Some(&s)).unwrap()) - 2.).abs() < 1e-6);
        assert_eq!(scalar(&pg.total(&p, None).unwrap()), 2.);

        pg.enable_supervised_loss = false;
        assert_eq!(scalar(&pg.total(&p, Some(&s)).unwrap()), 2.);
    }

    #[test]
    fn gradient_flows_to_log_probs() {
        let dev = Device::Cpu;
        let v = candle_core::Var::new(&[-0.5f32, -0.25], &dev).unwrap();
        let l = loss(1.).policy_loss(&[v.as_tensor().clone()], &[2.], &dev).unwrap();
        let grads = l.backward().unwrap();
        let g: Vec<f32> = grads.get(v.as_tensor()).unwrap().to_vec1().unwrap();
        assert_eq!(g, vec![-2., -2.]);
    }
}
