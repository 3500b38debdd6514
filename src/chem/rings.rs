//! Ring perception on molecule graphs.
//!
//! `ring_sizes` is the per-atom DFS used to find which ring sizes an atom takes part in.
//! `RingInfo` holds a smallest set of smallest rings (SSSR): candidate cycles come from
//! the shortest path around each bond, and are kept if they're independent over GF(2).

use std::collections::{BTreeSet, VecDeque};

use crate::chem::{BondOrder, MolGraph};

/// Whether a bond lies on any cycle, i.e. its atoms stay connected without it.
pub fn bond_in_ring(graph: &MolGraph, bond: usize) -> bool {
    let b = graph.bonds[bond];
    shortest_path_without(graph, b.atom_0, b.atom_1, bond).is_some()
}

/// BFS path from `from` to `to` that doesn't use bond `skip`. Includes both ends.
fn shortest_path_without(graph: &MolGraph, from: usize, to: usize, skip: usize) -> Option<Vec<usize>> {
    let n = graph.atoms.len();
    let mut adj = vec![Vec::new(); n];
    for (i, bond) in graph.bonds.iter().enumerate() {
        if i != skip {
            adj[bond.atom_0].push(bond.atom_1);
            adj[bond.atom_1].push(bond.atom_0);
        }
    }

    let mut prev = vec![None; n];
    let mut seen = vec![false; n];
    seen[from] = true;
    let mut queue = VecDeque::from([from]);

    while let Some(u) = queue.pop_front() {
        if u == to {
            let mut path = vec![to];
            let mut cur = to;
            while let Some(p) = prev[cur] {
                path.push(p);
                cur = p;
            }
            path.reverse();
            return Some(path);
        }
        for &v in &adj[u] {
            if !seen[v] {
                seen[v] = true;
                prev[v] = Some(u);
                queue.push_back(v);
            }
        }
    }
    None
}

/// Part of the ring size detection.
fn dfs_find_rings(
    start: usize,
    current: usize,
    depth: u8,
    max_size: u8,
    visited: &mut [bool],
    path: &mut Vec<usize>,
    adj: &[Vec<usize>],
    ring_sizes: &mut [Vec<u8>],
) {
    if depth >= max_size {
        return;
    }

    for &nbr in &adj[current] {
        if nbr == start && depth + 1 >= 3 {
            let size = depth + 1;
            for &idx in path.iter() {
                if !ring_sizes[idx].contains(&size) {
                    ring_sizes[idx].push(size);
                }
            }
        } else if !visited[nbr] {
            visited[nbr] = true;
            path.push(nbr);
            dfs_find_rings(start, nbr, depth + 1, max_size, visited, path, adj, ring_sizes);
            path.pop();
            visited[nbr] = false;
        }
    }
}

/// For each atom, the sizes of the simple cycles (up to `max_size`) passing through it.
pub fn ring_sizes(adj: &[Vec<usize>], max_size: u8) -> Vec<Vec<u8>> {
    let n = adj.len();
    let mut ring_sizes = vec![Vec::<u8>::new(); n];

    for start in 0..n {
        let mut visited = vec![false; n];
        visited[start] = true;
        let mut path = vec![start];
        dfs_find_rings(start, start, 0, max_size, &mut visited, &mut path, adj, &mut ring_sizes);
    }

    ring_sizes
}

/// A ring, as atom indices in cycle order, and the bond indices that close it.
#[derive(Clone, Debug, PartialEq)]
pub struct Ring {
    pub atoms: Vec<usize>,
    pub bonds: Vec<usize>,
}

impl Ring {
    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn contains(&self, atom: usize) -> bool {
        self.atoms.contains(&atom)
    }
}

#[derive(Clone, Debug, Default)]
pub struct RingInfo {
    pub rings: Vec<Ring>,
}

/// Bitset over bond indices, for GF(2) independence of cycles.
fn bond_bits(bonds: &[usize], n_bonds: usize) -> Vec<u64> {
    let mut bits = vec![0u64; n_bonds.div_ceil(64)];
    for &b in bonds {
        bits[b / 64] ^= 1 << (b % 64);
    }
    bits
}

/// Reduces `v` against the basis. Returns true, and extends the basis, if `v` is independent.
fn insert_independent(basis: &mut Vec<Vec<u64>>, mut v: Vec<u64>) -> bool {
    for row in basis.iter() {
        let pivot = leading_bit(row);
        if let Some(p) = pivot {
            if v[p / 64] & (1 << (p % 64)) != 0 {
                for (a, b) in v.iter_mut().zip(row) {
                    *a ^= b;
                }
            }
        }
    }
    if leading_bit(&v).is_none() {
        return false;
    }
    basis.push(v);
    // Keep pivots unique: eliminate the new pivot from earlier rows.
    let last = basis.len() - 1;
    if let Some(p) = leading_bit(&basis[last]) {
        let new_row = basis[last].clone();
        for row in basis.iter_mut().take(last) {
            if row[p / 64] & (1 << (p % 64)) != 0 {
                for (a, b) in row.iter_mut().zip(&new_row) {
                    *a ^= b;
                }
            }
        }
    }
    true
}

fn leading_bit(v: &[u64]) -> Option<usize> {
    v.iter()
        .enumerate()
        .find(|(_, w)| **w != 0)
        .map(|(i, w)| i * 64 + w.trailing_zeros() as usize)
}

impl RingInfo {
    pub fn new(graph: &MolGraph) -> Self {
        let n_bonds = graph.bonds.len();
        let n_atoms = graph.atoms.len();
        let rank = (n_bonds + graph.num_components()).saturating_sub(n_atoms);
        if rank == 0 {
            return Self::default();
        }

        let mut seen: BTreeSet<Vec<usize>> = BTreeSet::new();
        let mut candidates = Vec::new();

        for (i, bond) in graph.bonds.iter().enumerate() {
            let Some(path) = shortest_path_without(graph, bond.atom_0, bond.atom_1, i) else {
                continue;
            };
            let mut key = path.clone();
            key.sort_unstable();
            if !seen.insert(key) {
                continue;
            }

            let mut bonds = Vec::with_capacity(path.len());
            for w in path.windows(2) {
                if let Some(b) = graph.bond_index(w[0], w[1]) {
                    bonds.push(b);
                }
            }
            bonds.push(i);
            candidates.push(Ring { atoms: path, bonds });
        }

        candidates.sort_by_key(|r| r.len());

        let mut basis = Vec::new();
        let mut rings = Vec::new();
        for ring in candidates {
            if rings.len() == rank {
                break;
            }
            if insert_independent(&mut basis, bond_bits(&ring.bonds, n_bonds)) {
                rings.push(ring);
            }
        }

        Self { rings }
    }

    pub fn num_rings(&self) -> usize {
        self.rings.len()
    }

    /// Number of rings each atom belongs to.
    pub fn atom_ring_counts(&self, n_atoms: usize) -> Vec<usize> {
        let mut counts = vec![0; n_atoms];
        for ring in &self.rings {
            for &a in &ring.atoms {
                counts[a] += 1;
            }
        }
        counts
    }

    /// Atoms shared by exactly two rings that have only that one atom in common.
    pub fn num_spiro_atoms(&self) -> usize {
        let mut spiro = BTreeSet::new();
        for (i, a) in self.rings.iter().enumerate() {
            for b in &self.rings[i + 1..] {
                let shared: Vec<usize> = a.atoms.iter().copied().filter(|x| b.contains(*x)).collect();
                if shared.len() == 1 {
                    spiro.insert(shared[0]);
                }
            }
        }
        spiro.len()
    }

    /// Atoms at the ends of a bridge: rings sharing more than one bond have their
    /// shared path's end atoms counted.
    pub fn num_bridgehead_atoms(&self) -> usize {
        let mut heads = BTreeSet::new();
        for (i, a) in self.rings.iter().enumerate() {
            for b in &self.rings[i + 1..] {
                let shared_bonds = a.bonds.iter().filter(|x| b.bonds.contains(x)).count();
                if shared_bonds > 1 {
                    // The shared atoms with fewer than two shared neighbours are the ends.
                    let shared: Vec<usize> = a.atoms.iter().copied().filter(|x| b.contains(*x)).collect();
                    for &s in &shared {
                        let pos = a.atoms.iter().position(|&x| x == s).unwrap_or(0);
                        let len = a.atoms.len();
                        let before = a.atoms[(pos + len - 1) % len];
                        let after = a.atoms[(pos + 1) % len];
                        let inner = shared.contains(&before) as usize + shared.contains(&after) as usize;
                        if inner < 2 {
                            heads.insert(s);
                        }
                    }
                }
            }
        }
        heads.len()
    }

    /// Rings that read as aromatic in a kekulized graph. Every atom of a six-membered ring
    /// must carry one double bond that lies inside the ring system (so fused rings count
    /// whichever Kekulé form was assigned); a five-membered ring needs four such atoms plus
    /// one N, O, or S lone-pair donor.
    pub fn aromatic_rings(&self, graph: &MolGraph) -> Vec<&Ring> {
        let mut ring_bond = vec![false; graph.bonds.len()];
        for ring in &self.rings {
            for &b in &ring.bonds {
                ring_bond[b] = true;
            }
        }

        // Per atom: number of double bonds, and whether one is a ring bond.
        let mut n_double = vec![0usize; graph.atoms.len()];
        let mut endocyclic_double = vec![false; graph.atoms.len()];
        for (i, bond) in graph.bonds.iter().enumerate() {
            if bond.order == BondOrder::Double {
                for a in [bond.atom_0, bond.atom_1] {
                    n_double[a] += 1;
                    endocyclic_double[a] |= ring_bond[i];
                }
            }
        }
        let pi_atom = |a: usize| n_double[a] == 1 && endocyclic_double[a];

        self.rings
            .iter()
            .filter(|ring| match ring.len() {
                6 => ring.atoms.iter().all(|&a| pi_atom(a)),
                5 => {
                    let donors = ring
                        .atoms
                        .iter()
                        .filter(|&&a| {
                            matches!(graph.atoms[a].atomic_number, 7 | 8 | 16) && n_double[a] == 0
                        })
                        .count();
                    donors == 1 && ring.atoms.iter().filter(|&&a| pi_atom(a)).count() == 4
                }
                _ => false,
            })
            .collect()
    }

    /// Per-atom aromatic flag, from `aromatic_rings`.
    pub fn aromatic_atoms(&self, graph: &MolGraph) -> Vec<bool> {
        let mut result = vec![false; graph.atoms.len()];
        for ring in self.aromatic_rings(graph) {
            for &a in &ring.atoms {
                result[a] = true;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chem::parse_smiles;

    #[test]
    fn naphthalene_rings() {
        let g = parse_smiles("c1ccc2ccccc2c1").unwrap();
        let info = RingInfo::new(&g);
        assert_eq!(info.num_rings(), 2);
        assert!(info.rings.iter().all(|r| r.len() == 6));
        assert_eq!(info.aromatic_rings(&g).len(), 2);
        assert_eq!(info.num_spiro_atoms(), 0);
        assert_eq!(info.num_bridgehead_atoms(), 0);
    }

    #[test]
    fn spiro_and_bridged() {
        let spiro = parse_smiles("C1CCC2(C1)CCCC2").unwrap();
        let info = RingInfo::new(&spiro);
        assert_eq!(info.num_rings(), 2);
        assert_eq!(info.num_spiro_atoms(), 1);

        let norbornane = parse_smiles("C1CC2CCC1C2").unwrap();
        let info = RingInfo::new(&norbornane);
        assert_eq!(info.num_rings(), 2);
        assert_eq!(info.num_bridgehead_atoms(), 2);
    }

    #[test]
    fn acyclic_has_no_rings() {
        let g = parse_smiles("CCCCO").unwrap();
        assert_eq!(RingInfo::new(&g).num_rings(), 0);
        assert!(!bond_in_ring(&g, 0));
    }

    #[test]
    fn ring_sizes_per_atom() {
        let g = parse_smiles("C1CCC1C").unwrap();
        let sizes = ring_sizes(&g.adjacency_list(), 8);
        assert_eq!(sizes[0], vec![4]);
        assert!(sizes[4].is_empty());
    }
}
