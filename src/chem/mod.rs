//! Chemistry primitives: elements, bond orders, and the molecule graph the generator
//! reads and writes. Also holds SMILES I/O, kekulization, ring perception, sanitization,
//! and the heuristic descriptors used for rewards.
//!
//! Graphs here are hydrogen-suppressed: hydrogens are implicit, and filled in from
//! default valences by [`sanitize`].

pub mod attributes;
pub mod descriptors;
mod kekulize;
pub mod rings;
pub mod sanitize;
pub mod smiles;

use std::{collections::VecDeque, fmt};

#[cfg(feature = "encode")]
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

pub use kekulize::kekulize;
pub use sanitize::{SanitizeError, SanitizedMol, sanitize};
pub use smiles::{parse_smiles, write_smiles};

use crate::error::{GenError, Result};

/// Static data for the elements we handle. Valences are listed smallest first; the
/// smallest one that fits the explicit bonds is used to assign implicit hydrogens.
#[derive(Debug)]
pub struct ElementInfo {
    pub atomic_number: u8,
    pub symbol: &'static str,
    /// Average atomic mass, in Daltons.
    pub mass: f32,
    pub valences: &'static [u8],
}

pub const HYDROGEN_MASS: f32 = 1.008;

pub static ELEMENTS: &[ElementInfo] = &[
    ElementInfo { atomic_number: 1, symbol: "H", mass: HYDROGEN_MASS, valences: &[1] },
    ElementInfo { atomic_number: 4, symbol: "Be", mass: 9.012, valences: &[2] },
    ElementInfo { atomic_number: 5, symbol: "B", mass: 10.81, valences: &[3] },
    ElementInfo { atomic_number: 6, symbol: "C", mass: 12.011, valences: &[4] },
    ElementInfo { atomic_number: 7, symbol: "N", mass: 14.007, valences: &[3, 5] },
    ElementInfo { atomic_number: 8, symbol: "O", mass: 15.999, valences: &[2] },
    ElementInfo { atomic_number: 9, symbol: "F", mass: 18.998, valences: &[1] },
    ElementInfo { atomic_number: 14, symbol: "Si", mass: 28.085, valences: &[4] },
    ElementInfo { atomic_number: 15, symbol: "P", mass: 30.974, valences: &[3, 5] },
    ElementInfo { atomic_number: 16, symbol: "S", mass: 32.06, valences: &[2, 4, 6] },
    ElementInfo { atomic_number: 17, symbol: "Cl", mass: 35.45, valences: &[1] },
    ElementInfo { atomic_number: 33, symbol: "As", mass: 74.922, valences: &[3, 5] },
    ElementInfo { atomic_number: 34, symbol: "Se", mass: 78.971, valences: &[2, 4, 6] },
    ElementInfo { atomic_number: 35, symbol: "Br", mass: 79.904, valences: &[1] },
    ElementInfo { atomic_number: 53, symbol: "I", mass: 126.904, valences: &[1, 3, 5] },
];

pub fn element_by_number(atomic_number: u8) -> Option<&'static ElementInfo> {
    ELEMENTS.iter().find(|e| e.atomic_number == atomic_number)
}

pub fn element_by_symbol(symbol: &str) -> Option<&'static ElementInfo> {
    ELEMENTS.iter().find(|e| e.symbol == symbol)
}

/// Covalent bond order. `None` is the "no edge" value used by the linearizer and relabel
/// maps; it never appears on a stored bond.
#[cfg_attr(feature = "encode", derive(Encode, Decode))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BondOrder {
    None,
    Single,
    /// Only present transiently, between SMILES parsing and kekulization.
    Aromatic,
    Double,
    Triple,
}

impl BondOrder {
    /// The numeric order, as a chemistry toolkit reports it. (Aromatic is 1.5)
    pub fn as_f32(self) -> f32 {
        match self {
            Self::None => 0.,
            Self::Single => 1.,
            Self::Aromatic => 1.5,
            Self::Double => 2.,
            Self::Triple => 3.,
        }
    }

    pub fn smiles_symbol(self) -> &'static str {
        match self {
            Self::None | Self::Single => "",
            Self::Aromatic => ":",
            Self::Double => "=",
            Self::Triple => "#",
        }
    }
}

impl fmt::Display for BondOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_f32())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Atom {
    pub atomic_number: u8,
    pub charge: i8,
    /// Hydrogen count given explicitly, e.g. from a SMILES bracket atom. If `None`, it's
    /// derived from default valences.
    pub explicit_h: Option<u8>,
}

impl Atom {
    pub fn new(atomic_number: u8) -> Self {
        Self {
            atomic_number,
            charge: 0,
            explicit_h: None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        element_by_number(self.atomic_number)
            .map(|e| e.symbol)
            .unwrap_or("*")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bond {
    pub atom_0: usize,
    pub atom_1: usize,
    pub order: BondOrder,
}

impl Bond {
    /// The atom on the other end of this bond, if `atom` is one of its ends.
    pub fn partner(&self, atom: usize) -> Option<usize> {
        if self.atom_0 == atom {
            Some(self.atom_1)
        } else if self.atom_1 == atom {
            Some(self.atom_0)
        } else {
            None
        }
    }
}

/// An undirected, hydrogen-suppressed molecule graph. Atoms are indexed by position.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MolGraph {
    pub atoms: Vec<Atom>,
    pub bonds: Vec<Bond>,
}

impl MolGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the new atom's index.
    pub fn add_atom(&mut self, atom: Atom) -> usize {
        self.atoms.push(atom);
        self.atoms.len() - 1
    }

    /// Adds an undirected bond. Self-loops, duplicate bonds, `BondOrder::None`, and
    /// out-of-range indices are rejected.
    pub fn add_bond(&mut self, atom_0: usize, atom_1: usize, order: BondOrder) -> Result<()> {
        if atom_0 == atom_1 {
            return Err(GenError::Graph(format!("self-loop on atom {atom_0}")));
        }
        if atom_0 >= self.atoms.len() || atom_1 >= self.atoms.len() {
            return Err(GenError::Graph(format!(
                "bond {atom_0}-{atom_1} out of range for {} atoms",
                self.atoms.len()
            )));
        }
        if order == BondOrder::None {
            return Err(GenError::Graph("bond with order None".to_owned()));
        }
        if self.bond_index(atom_0, atom_1).is_some() {
            return Err(GenError::Graph(format!(
                "duplicate bond {atom_0}-{atom_1}"
            )));
        }

        self.bonds.push(Bond {
            atom_0,
            atom_1,
            order,
        });
        Ok(())
    }

    pub fn num_atoms(&self) -> usize {
        self.atoms.len()
    }

    pub fn bond_index(&self, a: usize, b: usize) -> Option<usize> {
        self.bonds
            .iter()
            .position(|bd| (bd.atom_0 == a && bd.atom_1 == b) || (bd.atom_0 == b && bd.atom_1 == a))
    }

    /// The order of the bond between two atoms, or `BondOrder::None`.
    pub fn bond_order(&self, a: usize, b: usize) -> BondOrder {
        self.bond_index(a, b)
            .map(|i| self.bonds[i].order)
            .unwrap_or(BondOrder::None)
    }

    /// For each atom index, the indices of atoms it's bonded to, in bond insertion order.
    pub fn adjacency_list(&self) -> Vec<Vec<usize>> {
        let mut result = vec![Vec::new(); self.atoms.len()];

        for bond in &self.bonds {
            result[bond.atom_0].push(bond.atom_1);
            result[bond.atom_1].push(bond.atom_0);
        }
        result
    }

    /// Sum of bond orders on an atom. (Its explicit valence, ignoring hydrogens)
    pub fn bond_order_sum(&self, atom: usize) -> f32 {
        self.bonds
            .iter()
            .filter(|b| b.partner(atom).is_some())
            .map(|b| b.order.as_f32())
            .sum()
    }

    pub fn degree(&self, atom: usize) -> usize {
        self.bonds.iter().filter(|b| b.partner(atom).is_some()).count()
    }

    /// Number of connected components. An empty graph has zero.
    pub fn num_components(&self) -> usize {
        let adj = self.adjacency_list();
        let mut seen = vec![false; self.atoms.len()];
        let mut count = 0;

        for start in 0..self.atoms.len() {
            if seen[start] {
                continue;
            }
            count += 1;
            seen[start] = true;
            let mut queue = VecDeque::from([start]);
            while let Some(i) = queue.pop_front() {
                for &j in &adj[i] {
                    if !seen[j] {
                        seen[j] = true;
                        queue.push_back(j);
                    }
                }
            }
        }
        count
    }

    pub fn is_connected(&self) -> bool {
        self.num_components() == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bond_rules() {
        let mut g = MolGraph::new();
        let a = g.add_atom(Atom::new(6));
        let b = g.add_atom(Atom::new(8));

        assert!(g.add_bond(a, a, BondOrder::Single).is_err());
        assert!(g.add_bond(a, b, BondOrder::None).is_err());
        g.add_bond(a, b, BondOrder::Double).unwrap();
        assert!(g.add_bond(b, a, BondOrder::Single).is_err());

        assert_eq!(g.bond_order(b, a), BondOrder::Double);
        assert_eq!(g.bond_order_sum(a), 2.);
        assert!(g.is_connected());
    }
}
