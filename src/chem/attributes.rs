//! Per-atom attribute records, and their one-hot encoding as node features for the critic
//! network.

use serde::{Deserialize, Serialize};

use crate::{
    chem::{BondOrder, SanitizedMol},
    error::{GenError, Result},
};

/// Hybridization, numbered the way common chemistry toolkits enumerate it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Hybridization {
    Unspecified = 0,
    S = 1,
    Sp = 2,
    Sp2 = 3,
    Sp3 = 4,
    Sp3d = 5,
    Sp3d2 = 6,
    Other = 7,
}

/// Fixed set of attributes computed for each atom.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AtomAttributes {
    /// Element class from `ELEMENT_CLASSES`; unlisted elements take the overflow class.
    pub element: i32,
    /// Total valence, hydrogens included.
    pub valence: i32,
    pub charge: i32,
    pub hybridization: Hybridization,
    pub aromatic: bool,
}

/// Atomic number to element class used by the critic's features. Anything else maps to
/// `ELEMENT_CLASSES.len()`.
pub const ELEMENT_CLASSES: [u8; 10] = [5, 7, 6, 8, 9, 15, 16, 17, 35, 53];

fn element_class(atomic_number: u8) -> i32 {
    ELEMENT_CLASSES
        .iter()
        .position(|&n| n == atomic_number)
        .unwrap_or(ELEMENT_CLASSES.len()) as i32
}

fn hybridization(mol: &SanitizedMol, atom: usize) -> Hybridization {
    let g = &mol.graph;
    let (mut doubles, mut triples) = (0, 0);
    for b in g.bonds.iter().filter(|b| b.partner(atom).is_some()) {
        match b.order {
            BondOrder::Double => doubles += 1,
            BondOrder::Triple => triples += 1,
            _ => (),
        }
    }

    let steric = g.degree(atom) + mol.implicit_h[atom] as usize;
    if steric == 0 {
        return Hybridization::S;
    }
    if steric > 4 {
        return if steric == 5 { Hybridization::Sp3d } else { Hybridization::Sp3d2 };
    }
    if triples > 0 || doubles > 1 {
        Hybridization::Sp
    } else if doubles == 1 || mol.aromatic[atom] {
        Hybridization::Sp2
    } else {
        Hybridization::Sp3
    }
}

impl AtomAttributes {
    pub fn new(mol: &SanitizedMol, atom: usize) -> Self {
        let a = &mol.graph.atoms[atom];
        Self {
            element: element_class(a.atomic_number),
            valence: mol.total_valence(atom) as i32,
            charge: a.charge as i32,
            hybridization: hybridization(mol, atom),
            aromatic: mol.aromatic[atom],
        }
    }
}

/// The value list for one attribute category. Values outside it encode as all zeros.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OneHot {
    pub values: Vec<i32>,
}

impl OneHot {
    pub fn new(values: Vec<i32>) -> Result<Self> {
        if values.is_empty() {
            return Err(GenError::config("one-hot attribute with no values"));
        }
        let mut sorted = values.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != values.len() {
            return Err(GenError::config(format!("duplicate one-hot values in {values:?}")));
        }
        Ok(Self { values })
    }

    fn encode(&self, v: i32, out: &mut Vec<f32>) {
        out.extend(self.values.iter().map(|&x| if x == v { 1. } else { 0. }));
    }
}

/// One-hot schema per attribute category.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AtomFeaturizer {
    pub element: OneHot,
    pub valence: OneHot,
    pub charge: OneHot,
    pub hybridization: OneHot,
    pub aromatic: OneHot,
}

impl Default for AtomFeaturizer {
    fn default() -> Self {
        Self {
            element: OneHot { values: (0..=ELEMENT_CLASSES.len() as i32).collect() },
            valence: OneHot { values: vec![1, 2, 3, 4, 5, 6] },
            charge: OneHot { values: vec![-1, 0, 1, 2, 3, 4] },
            hybridization: OneHot { values: (0..8).collect() },
            aromatic: OneHot { values: vec![0, 1] },
        }
    }
}

impl AtomFeaturizer {
    /// Re-validates every category; use on schemas loaded from config.
    pub fn validated(self) -> Result<Self> {
        Ok(Self {
            element: OneHot::new(self.element.values)?,
            valence: OneHot::new(self.valence.values)?,
            charge: OneHot::new(self.charge.values)?,
            hybridization: OneHot::new(self.hybridization.values)?,
            aromatic: OneHot::new(self.aromatic.values)?,
        })
    }

    pub fn num_features(&self) -> usize {
        self.element.values.len()
            + self.valence.values.len()
            + self.charge.values.len()
            + self.hybridization.values.len()
            + self.aromatic.values.len()
    }

    /// Row-major `[n_atoms, num_features]` feature matrix.
    pub fn featurize(&self, mol: &SanitizedMol) -> Vec<f32> {
        let mut out = Vec::with_capacity(mol.graph.atoms.len() * self.num_features());
        for i in 0..mol.graph.atoms.len() {
            let attrs = AtomAttributes::new(mol, i);
            self.element.encode(attrs.element, &mut out);
            self.valence.encode(attrs.valence, &mut out);
            self.charge.encode(attrs.charge, &mut out);
            self.hybridization.encode(attrs.hybridization as i32, &mut out);
            self.aromatic.encode(attrs.aromatic as i32, &mut out);
        }
        out
    }
}
