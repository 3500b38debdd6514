//! Structural sanity checks for molecule graphs, and implicit hydrogen assignment.
//!
//! A sampled graph may be chemically impossible (e.g. a pentavalent carbon). Those fail
//! here, and the reward evaluator turns the failure into its penalty value.

use thiserror::Error;

use crate::chem::{BondOrder, MolGraph, element_by_number, rings::RingInfo};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SanitizeError {
    #[error("molecule has no atoms")]
    Empty,
    #[error("molecule has {0} disconnected fragments")]
    Disconnected(usize),
    #[error("atom {atom} has unsupported atomic number {atomic_number}")]
    UnknownElement { atom: usize, atomic_number: u8 },
    #[error("bond {0} is still aromatic")]
    AromaticBond(usize),
    #[error("atom {atom} ({symbol}) has valence {valence}, above its maximum of {max}")]
    Valence {
        atom: usize,
        symbol: &'static str,
        valence: u8,
        max: u8,
    },
}

/// A graph that passed sanitization, with derived per-atom data.
#[derive(Clone, Debug)]
pub struct SanitizedMol {
    pub graph: MolGraph,
    pub implicit_h: Vec<u8>,
    pub rings: RingInfo,
    pub aromatic: Vec<bool>,
}

impl SanitizedMol {
    pub fn num_heavy_atoms(&self) -> usize {
        self.graph.atoms.len()
    }

    /// Bond orders plus hydrogens.
    pub fn total_valence(&self, atom: usize) -> u8 {
        self.graph.bond_order_sum(atom) as u8 + self.implicit_h[atom]
    }
}

/// Valences an element may take at a given formal charge, smallest first.
pub fn allowed_valences(atomic_number: u8, charge: i8) -> Vec<u8> {
    let Some(el) = element_by_number(atomic_number) else {
        return Vec::new();
    };

    // Pnictogens and chalcogens gain a bond per positive charge, and lose one per negative
    // charge; everything else loses one per unit of charge either way.
    let lone_pair_donor = matches!(atomic_number, 7 | 8 | 15 | 16 | 33 | 34);

    el.valences
        .iter()
        .filter_map(|&v| {
            let adjusted = if lone_pair_donor {
                v as i16 + charge as i16
            } else {
                v as i16 - (charge as i16).abs()
            };
            (adjusted >= 0).then_some(adjusted as u8)
        })
        .collect()
}

pub fn sanitize(graph: &MolGraph) -> Result<SanitizedMol, SanitizeError> {
    if graph.atoms.is_empty() {
        return Err(SanitizeError::Empty);
    }

    let components = graph.num_components();
    if components != 1 {
        return Err(SanitizeError::Disconnected(components));
    }

    if let Some(i) = graph.bonds.iter().position(|b| b.order == BondOrder::Aromatic) {
        return Err(SanitizeError::AromaticBond(i));
    }

    let mut implicit_h = Vec::with_capacity(graph.atoms.len());

    for (i, atom) in graph.atoms.iter().enumerate() {
        let Some(el) = element_by_number(atom.atomic_number) else {
            return Err(SanitizeError::UnknownElement {
                atom: i,
                atomic_number: atom.atomic_number,
            });
        };

        let explicit = graph.bond_order_sum(i).round() as u8;
        let allowed = allowed_valences(atom.atomic_number, atom.charge);
        let max = allowed.iter().copied().max().unwrap_or(0);

        let h = match atom.explicit_h {
            Some(h) => {
                if explicit + h > max {
                    return Err(SanitizeError::Valence {
                        atom: i,
                        symbol: el.symbol,
                        valence: explicit + h,
                        max,
                    });
                }
                h
            }
            None => match allowed.iter().find(|&&v| v >= explicit) {
                Some(v) => v - explicit,
                None => {
                    return Err(SanitizeError::Valence {
                        atom: i,
                        symbol: el.symbol,
                        valence: explicit,
                        max,
                    });
                }
            },
        };
        implicit_h.push(h);
    }

    let rings = RingInfo::new(graph);
    let aromatic = rings.aromatic_atoms(graph);

    Ok(SanitizedMol {
        graph: graph.clone(),
        implicit_h,
        rings,
        aromatic,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chem::{Atom, parse_smiles};

    #[test]
    fn implicit_hydrogens() {
        let mol = sanitize(&parse_smiles("CC(=O)N").unwrap()).unwrap();
        assert_eq!(mol.implicit_h, vec![3, 0, 0, 2]);
    }

    #[test]
    fn charged_atoms() {
        let mol = sanitize(&parse_smiles("C[N+](C)(C)C").unwrap()).unwrap();
        assert_eq!(mol.implicit_h[1], 0);

        let mol = sanitize(&parse_smiles("CC(=O)[O-]").unwrap()).unwrap();
        assert_eq!(mol.implicit_h[3], 0);
    }

    #[test]
    fn hypervalent_carbon_fails() {
        let mut g = MolGraph::new();
        let c = g.add_atom(Atom::new(6));
        for _ in 0..3 {
            let o = g.add_atom(Atom::new(8));
            g.add_bond(c, o, BondOrder::Double).unwrap();
        }
        assert!(matches!(sanitize(&g), Err(SanitizeError::Valence { atom: 0, .. })));
    }

    #[test]
    fn sulfur_expanded_valence() {
        let mol = sanitize(&parse_smiles("CS(=O)(=O)C").unwrap()).unwrap();
        assert_eq!(mol.implicit_h[1], 0);
        assert_eq!(mol.total_valence(1), 6);
    }

    #[test]
    fn disconnected_fails() {
        let g = parse_smiles("CC.O").unwrap();
        assert_eq!(sanitize(&g).unwrap_err(), SanitizeError::Disconnected(2));
    }
}
