//! Maps raw chemistry values (atomic numbers, bond orders) to dense, zero-based class indices
//! and back. The generator only ever sees classes; these maps are the only place raw values
//! and classes meet.

use std::{fmt::Debug, hash::Hash};

#[cfg(feature = "encode")]
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::{
    chem::BondOrder,
    config::RelabelConfig,
    error::{GenError, Result},
};

/// A raw value that can be relabeled.
pub trait Label: Copy + Eq + Hash + Debug {
    /// Used in error messages.
    const KIND: &'static str;
}

impl Label for u8 {
    const KIND: &'static str = "atomic number";
}

impl Label for BondOrder {
    const KIND: &'static str = "bond order";
}

/// How to treat raw values seen in data but absent from the explicit table.
#[cfg_attr(feature = "encode", derive(Encode, Decode))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelabelPolicy {
    /// An unseen value is an `UnknownLabel` error.
    #[default]
    Reject,
    /// Unseen values get fresh classes after the explicit ones, in first-observed order.
    Extend,
}

/// A bijection between raw values and classes `0..len()`. `classes[c]` is the raw value of
/// class `c`.
#[cfg_attr(feature = "encode", derive(Encode, Decode))]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelabelMap<K> {
    classes: Vec<K>,
}

impl<K: Label> RelabelMap<K> {
    /// Build from explicit `(raw, class)` pairs. Classes must be a permutation of `0..n`,
    /// and raw values must be unique.
    pub fn from_table(table: &[(K, usize)]) -> Result<Self> {
        let n = table.len();
        let mut classes: Vec<Option<K>> = vec![None; n];

        for &(raw, class) in table {
            if class >= n {
                return Err(GenError::config(format!(
                    "{} table: class {class} for {raw:?} is out of range for {n} entries",
                    K::KIND
                )));
            }
            if classes[class].is_some() {
                return Err(GenError::config(format!(
                    "{} table: class {class} assigned twice",
                    K::KIND
                )));
            }
            if classes.iter().flatten().any(|&r| r == raw) {
                return Err(GenError::config(format!(
                    "{} table: {raw:?} listed twice",
                    K::KIND
                )));
            }
            classes[class] = Some(raw);
        }

        // Every slot is filled: n distinct in-range classes for n entries.
        Ok(Self {
            classes: classes.into_iter().flatten().collect(),
        })
    }

    /// Apply `policy` to values observed in a dataset, given in first-observed order.
    pub fn observe(&mut self, observed: impl IntoIterator<Item = K>, policy: RelabelPolicy) -> Result<()> {
        for raw in observed {
            if self.classes.contains(&raw) {
                continue;
            }
            match policy {
                RelabelPolicy::Reject => return Err(GenError::unknown(K::KIND, raw)),
                RelabelPolicy::Extend => self.classes.push(raw),
            }
        }
        Ok(())
    }

    pub fn relabel(&self, raw: K) -> Result<usize> {
        self.classes
            .iter()
            .position(|&r| r == raw)
            .ok_or_else(|| GenError::unknown(K::KIND, raw))
    }

    pub fn unrelabel(&self, class: usize) -> Result<K> {
        self.classes
            .get(class)
            .copied()
            .ok_or_else(|| GenError::unknown(K::KIND, format!("class {class}")))
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Raw values, indexed by class.
    pub fn raw_values(&self) -> &[K] {
        &self.classes
    }
}

/// Node and edge maps for one dataset or model, and the class every graph starts with.
#[cfg_attr(feature = "encode", derive(Encode, Decode))]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LabelMaps {
    pub nodes: RelabelMap<u8>,
    pub edges: RelabelMap<BondOrder>,
    pub start_node_label: usize,
}

impl LabelMaps {
    /// Maps from the configured tables alone.
    pub fn new(cfg: &RelabelConfig) -> Result<Self> {
        Self::with_observed(cfg, [], [])
    }

    /// Maps from the configured tables, with the dataset's observed values applied under
    /// the configured policy.
    pub fn with_observed(
        cfg: &RelabelConfig,
        atoms: impl IntoIterator<Item = u8>,
        bonds: impl IntoIterator<Item = BondOrder>,
    ) -> Result<Self> {
        let mut nodes = RelabelMap::from_table(&cfg.node_table)?;
        let mut edges = RelabelMap::from_table(&cfg.edge_table)?;

        if edges.relabel(BondOrder::None).ok() != Some(0) {
            return Err(GenError::config("edge table must map the no-edge bond order to class 0"));
        }
        if edges.len() < 2 {
            return Err(GenError::config("edge table needs at least one bond class"));
        }

        nodes.observe(atoms, cfg.policy)?;
        edges.observe(bonds, cfg.policy)?;

        let start_node_label = nodes.relabel(cfg.start_element).map_err(|_| {
            GenError::config(format!(
                "start element {} isn't in the node relabel table",
                cfg.start_element
            ))
        })?;

        Ok(Self {
            nodes,
            edges,
            start_node_label,
        })
    }

    pub fn num_node_classes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_edge_classes(&self) -> usize {
        self.edges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tables_round_trip() {
        let maps = LabelMaps::new(&RelabelConfig::default()).unwrap();
        assert_eq!(maps.num_node_classes(), 9);
        assert_eq!(maps.num_edge_classes(), 4);
        assert_eq!(maps.start_node_label, 0);

        for c in 0..maps.num_node_classes() {
            let raw = maps.nodes.unrelabel(c).unwrap();
            assert_eq!(maps.nodes.relabel(raw).unwrap(), c);
        }
        for c in 0..maps.num_edge_classes() {
            let raw = maps.edges.unrelabel(c).unwrap();
            assert_eq!(maps.edges.relabel(raw).unwrap(), c);
        }
        for raw in [6, 7, 8, 9, 15, 16, 17, 35, 53] {
            let c = maps.nodes.relabel(raw).unwrap();
            assert_eq!(maps.nodes.unrelabel(c).unwrap(), raw);
        }

        assert_eq!(maps.nodes.relabel(35).unwrap(), 7);
        assert_eq!(maps.edges.relabel(BondOrder::Double).unwrap(), 2);
    }

    #[test]
    fn unmapped_values_fail() {
        let maps = LabelMaps::new(&RelabelConfig::default()).unwrap();
        assert!(matches!(maps.nodes.relabel(14), Err(GenError::UnknownLabel { .. })));
        assert!(maps.nodes.unrelabel(9).is_err());
        assert!(maps.edges.relabel(BondOrder::Aromatic).is_err());
    }

    #[test]
    fn reject_policy_fails_on_unseen() {
        let cfg = RelabelConfig::default();
        let result = LabelMaps::with_observed(&cfg, [6, 14], []);
        assert!(matches!(result, Err(GenError::UnknownLabel { .. })));
    }

    #[test]
    fn extend_policy_appends_in_observed_order() {
        let cfg = RelabelConfig {
            policy: RelabelPolicy::Extend,
            ..Default::default()
        };
        let maps = LabelMaps::with_observed(&cfg, [6, 34, 5, 34, 14], []).unwrap();
        assert_eq!(maps.num_node_classes(), 12);
        assert_eq!(maps.nodes.relabel(34).unwrap(), 9);
        assert_eq!(maps.nodes.relabel(5).unwrap(), 10);
        assert_eq!(maps.nodes.relabel(14).unwrap(), 11);
    }

    #[test]
    fn bad_tables_are_config_errors() {
        assert!(RelabelMap::from_table(&[(6u8, 0), (7, 0)]).is_err());
        assert!(RelabelMap::from_table(&[(6u8, 0), (6, 1)]).is_err());
        assert!(RelabelMap::from_table(&[(6u8, 0), (7, 2)]).is_err());

        let cfg = RelabelConfig {
            start_element: 14,
            ..Default::default()
        };
        assert!(matches!(LabelMaps::new(&cfg), Err(GenError::Config(_))));

        let cfg = RelabelConfig {
            edge_table: vec![(BondOrder::Single, 0), (BondOrder::None, 1)],
            ..Default::default()
        };
        assert!(matches!(LabelMaps::new(&cfg), Err(GenError::Config(_))));
    }
}
