//! Assigns alternating single and double bonds to aromatic systems read from SMILES.
//!
//! Each aromatic atom that must take part in a π double bond is matched to exactly one
//! aromatic neighbour; matched bonds become double, the rest single. Small organic
//! molecules keep this search tiny, so plain backtracking is used.

use crate::{
    chem::{BondOrder, MolGraph, rings::bond_in_ring},
    error::{GenError, Result},
};

/// Whether an aromatic atom needs a double bond within the aromatic system.
fn needs_double_bond(graph: &MolGraph, i: usize) -> bool {
    let atom = &graph.atoms[i];

    let has_explicit_double = graph
        .bonds
        .iter()
        .any(|b| b.partner(i).is_some() && matches!(b.order, BondOrder::Double | BondOrder::Triple));
    if has_explicit_double {
        return false;
    }

    let degree = graph.degree(i);
    let h = atom.explicit_h.unwrap_or(0);

    match atom.atomic_number {
        6 => atom.charge == 0,
        // N, P, As: pyridine-like with two connections, or a quaternized ring N.
        7 | 15 | 33 => (atom.charge == 0 && h == 0 && degree == 2) || (atom.charge == 1 && degree == 3),
        // O, S, Se donate a lone pair unless they're positively charged. (e.g. pyrylium)
        8 | 16 | 34 => atom.charge == 1 && degree == 2,
        _ => false,
    }
}

fn solve(needy: &[usize], candidates: &[Vec<usize>], partner: &mut [Option<usize>]) -> bool {
    let Some(&u) = needy.iter().find(|&&u| partner[u].is_none()) else {
        return true;
    };

    for &v in &candidates[u] {
        if partner[v].is_some() {
            continue;
        }
        partner[u] = Some(v);
        partner[v] = Some(u);
        if solve(needy, candidates, partner) {
            return true;
        }
        partner[u] = None;
        partner[v] = None;
    }
    false
}

/// Replace every aromatic bond with a single or double bond. `aromatic` flags atoms that
/// were written in aromatic form.
pub fn kekulize(graph: &mut MolGraph, aromatic: &[bool]) -> Result<()> {
    let n = graph.atoms.len();

    // Aromatic bonds outside any ring (e.g. biphenyl's link written without `-`) are single.
    for b in 0..graph.bonds.len() {
        if graph.bonds[b].order == BondOrder::Aromatic && !bond_in_ring(graph, b) {
            graph.bonds[b].order = BondOrder::Single;
        }
    }

    let needy_flags: Vec<bool> = (0..n)
        .map(|i| aromatic[i] && needs_double_bond(graph, i))
        .collect();
    let needy: Vec<usize> = (0..n).filter(|&i| needy_flags[i]).collect();

    let mut candidates = vec![Vec::new(); n];
    for bond in &graph.bonds {
        if bond.order == BondOrder::Aromatic && needy_flags[bond.atom_0] && needy_flags[bond.atom_1] {
            candidates[bond.atom_0].push(bond.atom_1);
            candidates[bond.atom_1].push(bond.atom_0);
        }
    }

    let mut partner = vec![None; n];
    if !solve(&needy, &candidates, &mut partner) {
        return Err(GenError::Smiles(
            "can't assign a Kekulé structure to the aromatic system".to_owned(),
        ));
    }

    for bond in graph.bonds.iter_mut() {
        if bond.order != BondOrder::Aromatic {
            continue;
        }
        bond.order = if partner[bond.atom_0] == Some(bond.atom_1) {
            BondOrder::Double
        } else {
            BondOrder::Single
        };
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::chem::{BondOrder, parse_smiles};

    fn doubles(smiles: &str) -> usize {
        parse_smiles(smiles)
            .unwrap()
            .bonds
            .iter()
            .filter(|b| b.order == BondOrder::Double)
            .count()
    }

    #[test]
    fn heteroaromatics() {
        assert_eq!(doubles("c1ccncc1"), 3); // pyridine
        assert_eq!(doubles("c1ccoc1"), 2); // furan
        assert_eq!(doubles("c1ccsc1"), 2); // thiophene
        assert_eq!(doubles("c1ncc[nH]1"), 2); // imidazole
        assert_eq!(doubles("O=c1cc[nH]cc1"), 3); // pyridone; exocyclic C=O counts
    }

    #[test]
    fn biphenyl_link_stays_single() {
        let g = parse_smiles("c1ccccc1c1ccccc1").unwrap();
        assert_eq!(g.bonds.iter().filter(|b| b.order == BondOrder::Double).count(), 6);
        assert_eq!(g.bond_order(5, 6), BondOrder::Single);
    }

    #[test]
    fn impossible_system_fails() {
        // Five aromatic carbons can't all be matched.
        assert!(parse_smiles("c1cccc1").is_err());
    }
}
