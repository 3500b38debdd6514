//! Training data: delimited SMILES rows, filtered down to molecules the generator can
//! represent, and padded batches of their BFS sequences.

use std::{fs::File, io};

use log::{debug, info, warn};
use rand::{Rng, seq::SliceRandom};

use crate::{
    chem::{MolGraph, parse_smiles},
    config::GraphGenConfig,
    degree::DegreeBudget,
    error::{GenError, LinearizeError, Result},
    linearize::{LinearizedSequence, RootChoice, linearize},
    relabel::LabelMaps,
};

#[derive(Clone, Debug)]
pub struct MoleculeRecord {
    pub smiles: String,
    pub graph: MolGraph,
    /// Values from the extra columns in `cols_to_read`; NaN where a cell didn't parse.
    pub labels: Vec<f32>,
}

/// Why rows were dropped while building a dataset.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub rows: usize,
    pub unparsable: usize,
    pub out_of_range: usize,
    /// Disconnected, no start-class atom, or wider than the BFS window.
    pub not_linearizable: usize,
    pub over_budget: usize,
    pub kept: usize,
}

pub struct GraphDataset {
    pub records: Vec<MoleculeRecord>,
    maps: LabelMaps,
    budget: Option<DegreeBudget>,
    window: usize,
    random_order: bool,
    order_retries: usize,
    max_num_nodes: usize,
    pub stats: FilterStats,
}

impl GraphDataset {
    /// Load the file at `cfg.dataset.path`.
    pub fn from_csv(cfg: &GraphGenConfig) -> Result<Self> {
        let file = File::open(&cfg.dataset.path)?;
        Self::from_reader(file, cfg)
    }

    pub fn from_reader<R: io::Read>(rdr: R, cfg: &GraphGenConfig) -> Result<Self> {
        let d = &cfg.dataset;
        let Some((&smiles_col, label_cols)) = d.cols_to_read.split_first() else {
            return Err(GenError::config("cols_to_read is empty"));
        };

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(d.delimiter as u8)
            .has_headers(d.has_header)
            .flexible(true)
            .from_reader(rdr);

        let mut rows = Vec::new();
        for result in reader.records() {
            let record = result?;
            let Some(smiles) = record.get(smiles_col) else {
                debug!("Row {:?} has no column {smiles_col}", record.position());
                rows.push((String::new(), Vec::new()));
                continue;
            };
            let labels = label_cols
                .iter()
                .map(|&c| {
                    record
                        .get(c)
                        .and_then(|v| v.trim().parse::<f32>().ok())
                        .unwrap_or(f32::NAN)
                })
                .collect();
            rows.push((smiles.trim().to_owned(), labels));
        }

        Self::from_rows(rows, cfg)
    }

    pub fn from_smiles<S: AsRef<str>>(smiles: &[S], cfg: &GraphGenConfig) -> Result<Self> {
        let rows = smiles
            .iter()
            .map(|s| (s.as_ref().to_owned(), Vec::new()))
            .collect();
        Self::from_rows(rows, cfg)
    }

    fn from_rows(rows: Vec<(String, Vec<f32>)>, cfg: &GraphGenConfig) -> Result<Self> {
        let d = &cfg.dataset;
        let mut stats = FilterStats {
            rows: rows.len(),
            ..Default::default()
        };

        let mut parsed = Vec::new();
        for (smiles, labels) in rows {
            let graph = match parse_smiles(&smiles) {
                Ok(g) => g,
                Err(e) => {
                    warn!("Skipping unparsable SMILES {smiles:?}: {e}");
                    stats.unparsable += 1;
                    continue;
                }
            };
            let n = graph.num_atoms();
            if n < d.restrict_min_atoms || n > d.restrict_max_atoms {
                stats.out_of_range += 1;
                continue;
            }
            parsed.push(MoleculeRecord {
                smiles,
                graph,
                labels,
            });
        }

        // Raw values, in first-observed order.
        let mut atoms = Vec::new();
        let mut bonds = Vec::new();
        for rec in &parsed {
            for a in &rec.graph.atoms {
                if !atoms.contains(&a.atomic_number) {
                    atoms.push(a.atomic_number);
                }
            }
            for b in &rec.graph.bonds {
                if !bonds.contains(&b.order) {
                    bonds.push(b.order);
                }
            }
        }
        let maps = LabelMaps::with_observed(&cfg.relabel, atoms, bonds)?;

        let budget = match &cfg.max_atom_bonds {
            Some(max) => Some(DegreeBudget::new(max, &maps)?),
            None => None,
        };

        let mut rng = rand::rng();
        let mut records = Vec::with_capacity(parsed.len());
        for rec in parsed {
            // The deterministic ordering is the fallback for random ones, so it must work.
            let seq = match linearize(
                &rec.graph,
                &maps,
                d.max_prev_nodes,
                RootChoice::FirstStart,
                false,
                &mut rng,
            ) {
                Ok(s) => s,
                Err(GenError::Linearize(e)) => {
                    debug!("Skipping {}: {e}", rec.smiles);
                    stats.not_linearizable += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if let Some(b) = &budget {
                if !b.admits(&seq) {
                    debug!("Skipping {}: exceeds the valence budget", rec.smiles);
                    stats.over_budget += 1;
                    continue;
                }
            }
            records.push(rec);
        }
        stats.kept = records.len();

        let Some(max_num_nodes) = records.iter().map(|r| r.graph.num_atoms()).max() else {
            return Err(GenError::config(format!(
                "no usable molecules in the dataset: {stats:?}"
            )));
        };

        info!(
            "Loaded {} of {} molecules. {} node classes, {} edge classes, max {} nodes. Dropped: {:?}",
            stats.kept,
            stats.rows,
            maps.num_node_classes(),
            maps.num_edge_classes(),
            max_num_nodes,
            stats
        );

        Ok(Self {
            records,
            maps,
            budget,
            window: d.max_prev_nodes,
            random_order: d.random_order,
            order_retries: d.order_retries,
            max_num_nodes,
            stats,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn maps(&self) -> &LabelMaps {
        &self.maps
    }

    pub fn budget(&self) -> Option<&DegreeBudget> {
        self.budget.as_ref()
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Largest atom count in the dataset; the sampler stops there.
    pub fn max_num_nodes(&self) -> usize {
        self.max_num_nodes
    }

    /// The BFS sequence of record `i`. With random ordering, a few random roots and
    /// neighbour orders are tried before falling back to the deterministic order.
    pub fn sequence<R: Rng + ?Sized>(&self, i: usize, rng: &mut R) -> Result<LinearizedSequence> {
        let graph = &self.records[i].graph;

        if self.random_order {
            for _ in 0..self.order_retries.max(1) {
                match linearize(graph, &self.maps, self.window, RootChoice::RandomStart, true, rng) {
                    Ok(seq) => return Ok(seq),
                    Err(GenError::Linearize(LinearizeError::BandwidthExceeded { .. })) => continue,
                    Err(e) => return Err(e),
                }
            }
            debug!("Random orderings of record {i} exceed the window; using BFS from the first start atom");
        }
        linearize(graph, &self.maps, self.window, RootChoice::FirstStart, false, rng)
    }

    /// Shuffled record indices, split into batches.
    pub fn epoch_batches<R: Rng + ?Sized>(&self, batch_size: usize, rng: &mut R) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        order.chunks(batch_size.max(1)).map(|c| c.to_vec()).collect()
    }

    pub fn batch<R: Rng + ?Sized>(&self, idxs: &[usize], rng: &mut R) -> Result<SequenceBatch> {
        let seqs = idxs
            .iter()
            .map(|&i| self.sequence(i, rng))
            .collect::<Result<Vec<_>>>()?;
        SequenceBatch::new(&seqs, self.budget.as_ref())
    }
}

/// Padded, host-side supervised targets for a set of sequences. Arrays are row-major with
/// position `t` of sequence `b` at `b * max_len + t`. Position `t` reads step `t` and
/// predicts step `t + 1`; each sequence's last position predicts an all no-edge window.
#[derive(Clone, Debug)]
pub struct SequenceBatch {
    pub batch_size: usize,
    pub max_len: usize,
    pub window: usize,
    pub lengths: Vec<usize>,
    /// `[B, T]`: class of node `t`.
    pub labels: Vec<u32>,
    /// `[B, T, W]`: edge window of node `t`.
    pub windows: Vec<u32>,
    /// `[B, T]`: class of node `t + 1`; 0 at and past each sequence's last position.
    pub next_labels: Vec<u32>,
    /// `[B, T, W]`: edge window of node `t + 1`.
    pub next_windows: Vec<u32>,
    /// `[B, T, W, edge classes]` additive logit masks, if a degree budget is in use.
    pub degree_masks: Option<Vec<f32>>,
}

impl SequenceBatch {
    pub fn new(seqs: &[LinearizedSequence], budget: Option<&DegreeBudget>) -> Result<Self> {
        let Some(window) = seqs.first().map(|s| s.window) else {
            return Err(GenError::config("empty sequence batch"));
        };
        if seqs.iter().any(|s| s.window != window) {
            return Err(GenError::config("sequences in a batch must share a window"));
        }

        let b = seqs.len();
        let max_len = seqs.iter().map(|s| s.len()).max().unwrap_or(0);
        let w = window;

        let mut labels = vec![0; b * max_len];
        let mut windows = vec![0; b * max_len * w];
        let mut next_labels = vec![0; b * max_len];
        let mut next_windows = vec![0; b * max_len * w];

        for (bi, seq) in seqs.iter().enumerate() {
            for t in 0..seq.len() {
                let p = bi * max_len + t;
                labels[p] = seq.node_labels[t] as u32;
                for k in 0..w {
                    windows[p * w + k] = seq.edge_windows[t][k] as u32;
                }
                if t + 1 < seq.len() {
                    next_labels[p] = seq.node_labels[t + 1] as u32;
                    for k in 0..w {
                        next_windows[p * w + k] = seq.edge_windows[t + 1][k] as u32;
                    }
                }
            }
        }

        let degree_masks = budget.map(|budget| {
            let k = budget.num_edge_classes();
            let mut out = vec![0.; b * max_len * w * k];
            for (bi, seq) in seqs.iter().enumerate() {
                let m = budget.supervised_masks(seq);
                let start = bi * max_len * w * k;
                out[start..start + m.len()].copy_from_slice(&m);
            }
            out
        });

        Ok(Self {
            batch_size: b,
            max_len,
            window,
            lengths: seqs.iter().map(|s| s.len()).collect(),
            labels,
            windows,
            next_labels,
            next_windows,
            degree_masks,
        })
    }
}
