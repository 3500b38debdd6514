//! Recurrent building blocks: a single GRU cell, and a stacked GRU with input and output
//! projections that steps one timestep at a time.

use candle_core::{Device, DType, Module, Tensor};
use candle_nn as nn;
use candle_nn::{Linear, VarBuilder, ops::sigmoid};

use crate::config::RnnConfig;

// -------- GRU cell (input_dim -> hidden_dim) --------

pub(crate) struct GruCell {
    w_ih: Linear, // in -> 3*h
    w_hh: Linear, // h -> 3*h
    hidden_dim: usize,
}

impl GruCell {
    pub fn new(vb: VarBuilder, input_dim: usize, hidden_dim: usize) -> candle_core::Result<Self> {
        let w_ih = nn::linear(input_dim, 3 * hidden_dim, vb.pp("w_ih"))?;
        let w_hh = nn::linear(hidden_dim, 3 * hidden_dim, vb.pp("w_hh"))?;
        Ok(Self {
            w_ih,
            w_hh,
            hidden_dim,
        })
    }

    pub fn forward(&self, x: &Tensor, h: &Tensor) -> candle_core::Result<Tensor> {
        // x: [N, in], h: [N, H]
        let ih = self.w_ih.forward(x)?; // [N, 3H]
        let hh = self.w_hh.forward(h)?; // [N, 3H]

        let hsize = self.hidden_dim;
        let i_r = ih.narrow(1, 0, hsize)?;
        let i_z = ih.narrow(1, hsize, hsize)?;
        let i_n = ih.narrow(1, 2 * hsize, hsize)?;

        let h_r = hh.narrow(1, 0, hsize)?;
        let h_z = hh.narrow(1, hsize, hsize)?;
        let h_n = hh.narrow(1, 2 * hsize, hsize)?;

        let r = sigmoid(&(i_r + h_r)?)?;
        let z = sigmoid(&(i_z + h_z)?)?;
        let n = (i_n + (r * h_n)?)?.tanh()?;

        let one_minus_z = Tensor::ones_like(&z)?.sub(&z)?;

        (&one_minus_z * n)? + (&z * h)?
    }
}

// -------- Stacked GRU --------

/// Input projection (Linear + ReLU), stacked GRU cells, and an optional output projection
/// (Linear, ReLU, Linear).
pub(crate) struct GruPlain {
    input: Linear,
    cells: Vec<GruCell>,
    output: Option<(Linear, Linear)>,
    has_output_nonlin: bool,
    hidden_size: usize,
}

impl GruPlain {
    pub fn new(vb: VarBuilder, input_size: usize, cfg: &RnnConfig) -> candle_core::Result<Self> {
        let input = nn::linear(input_size, cfg.embedding_size, vb.pp("input"))?;

        let mut cells = Vec::with_capacity(cfg.num_layers);
        for l in 0..cfg.num_layers {
            let in_dim = if l == 0 { cfg.embedding_size } else { cfg.hidden_size };
            cells.push(GruCell::new(vb.pp(format!("cell_{l}")), in_dim, cfg.hidden_size)?);
        }

        let output = match cfg.output_size {
            Some(out) => Some((
                nn::linear(cfg.hidden_size, cfg.embedding_size, vb.pp("output_0"))?,
                nn::linear(cfg.embedding_size, out, vb.pp("output_1"))?,
            )),
            None => None,
        };

        Ok(Self {
            input,
            cells,
            output,
            has_output_nonlin: cfg.has_output_nonlin,
            hidden_size: cfg.hidden_size,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.cells.len()
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn zero_state(&self, batch: usize, device: &Device) -> candle_core::Result<Vec<Tensor>> {
        (0..self.cells.len())
            .map(|_| Tensor::zeros((batch, self.hidden_size), DType::F32, device))
            .collect()
    }

    /// One timestep. `x`: `[N, input_size]`; `h`: one `[N, hidden]` tensor per layer.
    /// Returns the output and the new per-layer hidden state.
    pub fn step(&self, x: &Tensor, h: &[Tensor]) -> candle_core::Result<(Tensor, Vec<Tensor>)> {
        let mut x = self.input.forward(x)?.relu()?;
        let mut h_new = Vec::with_capacity(self.cells.len());

        for (cell, h_l) in self.cells.iter().zip(h) {
            x = cell.forward(&x, h_l)?;
            h_new.push(x.clone());
        }

        let mut out = match &self.output {
            Some((a, b)) => b.forward(&a.forward(&x)?.relu()?)?,
            None => x,
        };
        if self.has_output_nonlin {
            out = out.relu()?;
        }
        Ok((out, h_new))
    }
}
