//! Valence budgets: a per-node-class limit on the sum of bond orders. The same masks are
//! used to restrict sampling, and to mask supervised edge logits from a ground-truth prefix,
//! so the two always agree.

use log::warn;

use crate::{
    error::{GenError, Result},
    linearize::LinearizedSequence,
    relabel::LabelMaps,
};

/// Added to the logit of a disallowed edge class.
pub const MASKED_LOGIT: f32 = -1e9;

const EPS: f32 = 1e-6;

#[derive(Clone, Debug, PartialEq)]
pub struct DegreeBudget {
    /// Indexed by node class.
    max_bonds: Vec<f32>,
    /// Bond order of each edge class. Class 0 is always the no-edge class, with order 0.
    edge_orders: Vec<f32>,
}

impl DegreeBudget {
    /// `max_bonds` is indexed by node class. Classes past its end are unlimited.
    pub fn new(max_bonds: &[f32], maps: &LabelMaps) -> Result<Self> {
        let n = maps.num_node_classes();
        if max_bonds.len() > n {
            return Err(GenError::config(format!(
                "max_atom_bonds has {} entries, for {n} node classes",
                max_bonds.len()
            )));
        }
        if max_bonds.len() < n {
            warn!(
                "max_atom_bonds covers {} of {n} node classes; the rest are unlimited",
                max_bonds.len()
            );
        }

        let mut max = max_bonds.to_vec();
        max.resize(n, f32::INFINITY);

        let edge_orders = maps
            .edges
            .raw_values()
            .iter()
            .map(|o| o.as_f32())
            .collect();

        Ok(Self {
            max_bonds: max,
            edge_orders,
        })
    }

    pub fn num_edge_classes(&self) -> usize {
        self.edge_orders.len()
    }

    fn fits(&self, node_class: usize, degree: f32, order: f32) -> bool {
        degree + order <= self.max_bonds[node_class] + EPS
    }

    /// Which edge classes may join a node of class `new_class` with bond-order sum
    /// `new_degree`, to one of class `prev_class` with sum `prev_degree`. Class 0 is always
    /// allowed.
    pub fn allowed(&self, new_class: usize, new_degree: f32, prev_class: usize, prev_degree: f32) -> Vec<bool> {
        self.edge_orders
            .iter()
            .enumerate()
            .map(|(c, &order)| {
                c == 0
                    || (self.fits(new_class, new_degree, order) && self.fits(prev_class, prev_degree, order))
            })
            .collect()
    }

    /// Additive logit mask: 0 for allowed classes, `MASKED_LOGIT` for the rest.
    pub fn logit_mask(&self, new_class: usize, new_degree: f32, prev_class: usize, prev_degree: f32) -> Vec<f32> {
        self.allowed(new_class, new_degree, prev_class, prev_degree)
            .into_iter()
            .map(|ok| if ok { 0. } else { MASKED_LOGIT })
            .collect()
    }

    /// Masks for supervised training on `seq`, laid out `[position, slot, class]`. Position
    /// `t` predicts the edges of node `t + 1`, with degrees from the ground-truth prefix
    /// built up slot by slot the way the sampler does. The final position predicts the end
    /// of the graph and is left unmasked.
    pub fn supervised_masks(&self, seq: &LinearizedSequence) -> Vec<f32> {
        let n = seq.len();
        let w = seq.window;
        let k_classes = self.num_edge_classes();
        let mut out = vec![0.; n * w * k_classes];
        let mut degree = vec![0.; n];

        for i in 1..n {
            let t = i - 1;
            let new_class = seq.node_labels[i];
            for k in 0..w.min(i) {
                let j = i - 1 - k;
                let mask = self.logit_mask(new_class, degree[i], seq.node_labels[j], degree[j]);
                let start = (t * w + k) * k_classes;
                out[start..start + k_classes].copy_from_slice(&mask);

                let order = self.edge_orders[seq.edge_windows[i][k]];
                degree[i] += order;
                degree[j] += order;
            }
        }
        out
    }

    /// Whether every node of `seq` stays within its class's budget.
    pub fn admits(&self, seq: &LinearizedSequence) -> bool {
        let mut degree = vec![0.; seq.len()];
        for (i, window) in seq.edge_windows.iter().enumerate() {
            for (k, &class) in window.iter().enumerate().take(i) {
                let order = self.edge_orders[class];
                degree[i] += order;
                degree[i - 1 - k] += order;
            }
        }
        degree
            .iter()
            .zip(&seq.node_labels)
            .all(|(&d, &c)| d <= self.max_bonds[c] + EPS)
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::{
        chem::parse_smiles,
        config::{GraphGenConfig, RelabelConfig},
        linearize::{RootChoice, linearize},
    };

    fn budget() -> (DegreeBudget, LabelMaps) {
        let maps = LabelMaps::new(&RelabelConfig::default()).unwrap();
        let cfg = GraphGenConfig::default();
        let budget = DegreeBudget::new(cfg.max_atom_bonds.as_ref().unwrap(), &maps).unwrap();
        (budget, maps)
    }

    #[test]
    fn allowed_classes() {
        let (b, _) = budget();
        // Fresh carbon to a carbon with 3 bonds already: only single or none.
        assert_eq!(b.allowed(0, 0., 0, 3.), vec![true, true, false, false]);
        // Fluorine takes one single bond, then nothing.
        assert_eq!(b.allowed(3, 0., 0, 0.), vec![true, true, false, false]);
        assert_eq!(b.allowed(3, 1., 0, 0.), vec![true, false, false, false]);
        // No-edge survives even when both nodes are saturated.
        assert_eq!(b.allowed(2, 2., 2, 2.), vec![true, false, false, false]);

        let m = b.logit_mask(3, 1., 0, 0.);
        assert_eq!(m[0], 0.);
        assert_eq!(m[1], MASKED_LOGIT);
    }

    #[test]
    fn budget_too_long_rejected() {
        let maps = LabelMaps::new(&RelabelConfig::default()).unwrap();
        assert!(DegreeBudget::new(&[4.; 10], &maps).is_err());
    }

    #[test]
    fn admits_real_molecules() {
        let (b, maps) = budget();
        let mut rng = StdRng::seed_from_u64(3);
        for smi in ["CC(=O)Oc1ccccc1C(=O)O", "CS(=O)(=O)c1ccc(F)cc1", "N#CCBr"] {
            let g = parse_smiles(smi).unwrap();
            let seq = linearize(&g, &maps, 12, RootChoice::FirstStart, false, &mut rng).unwrap();
            assert!(b.admits(&seq), "{smi}");
        }

        // A tetravalent oxygen breaks the budget.
        let g = parse_smiles("CO(C)(C)C").unwrap();
        let seq = linearize(&g, &maps, 12, RootChoice::FirstStart, false, &mut rng).unwrap();
        assert!(!b.admits(&seq));
    }

    #[test]
    fn supervised_masks_follow_prefix() {
        let (b, maps) = budget();
        let mut rng = StdRng::seed_from_u64(0);
        // C(0) - C(1) triple; then N(2) on C(1).
        let g = parse_smiles("C#CN").unwrap();
        let seq = linearize(&g, &maps, 2, RootChoice::Fixed(0), false, &mut rng).unwrap();
        let masks = b.supervised_masks(&seq);
        let k = b.num_edge_classes();
        let at = |t: usize, slot: usize| &masks[(t * 2 + slot) * k..(t * 2 + slot + 1) * k];

        // Position 0 predicts node 1: both fresh carbons, everything allowed.
        assert!(at(0, 0).iter().all(|&v| v == 0.));
        // Position 1 predicts node 2 (N). Slot 0 is node 1, already at 3 of 4.
        assert_eq!(at(1, 0), &[0., 0., MASKED_LOGIT, MASKED_LOGIT]);
        // Slot 1 is node 0, also at 3 of 4; N has 1 from slot 0.
        assert_eq!(at(1, 1), &[0., 0., MASKED_LOGIT, MASKED_LOGIT]);
        // Final position is unmasked.
        assert!(at(2, 0).iter().all(|&v| v == 0.));
    }
}
