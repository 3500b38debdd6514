//! Breadth-first linearization of molecule graphs into the step sequences the generator
//! learns, and reconstruction of graphs from them.
//!
//! Node `i` of a sequence is the `i`th node visited by BFS. Its step holds its class and a
//! window of edge classes to nodes `i-1, i-2, ..., i-W`. Slots before node 0 hold the
//! no-edge class, 0. A graph is representable only if every edge joins nodes at most `W`
//! apart in BFS order.

use std::collections::VecDeque;

use rand::{
    Rng,
    seq::{IndexedRandom, SliceRandom},
};

use crate::{
    chem::{Atom, MolGraph},
    error::{LinearizeError, Result},
    relabel::LabelMaps,
};

/// How the BFS root is chosen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RootChoice {
    Fixed(usize),
    /// Uniformly among atoms of the start class.
    RandomStart,
    /// The lowest-index atom of the start class.
    FirstStart,
}

/// A graph as a sequence of `(node class, edge window)` steps.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearizedSequence {
    pub node_labels: Vec<usize>,
    /// `edge_windows[i][k]` is the edge class between node `i` and node `i - 1 - k`.
    pub edge_windows: Vec<Vec<usize>>,
    pub window: usize,
    /// `order[i]` is the source-graph atom index of node `i`. Empty for sequences that
    /// didn't come from a graph, e.g. sampled ones.
    pub order: Vec<usize>,
}

impl LinearizedSequence {
    pub fn len(&self) -> usize {
        self.node_labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_labels.is_empty()
    }
}

/// BFS visit order from `root`. Neighbours are visited in ascending index order unless an
/// RNG is passed, in which case each node's neighbours are shuffled.
pub fn bfs_order<R: Rng + ?Sized>(
    graph: &MolGraph,
    root: usize,
    mut rng: Option<&mut R>,
) -> std::result::Result<Vec<usize>, LinearizeError> {
    let n = graph.num_atoms();
    if n == 0 {
        return Err(LinearizeError::Empty);
    }
    if root >= n {
        return Err(LinearizeError::InvalidRoot { root, n_atoms: n });
    }

    let mut adj = graph.adjacency_list();
    for nbrs in adj.iter_mut() {
        nbrs.sort_unstable();
    }

    let mut visited = vec![false; n];
    let mut order = Vec::with_capacity(n);
    let mut queue = VecDeque::from([root]);
    visited[root] = true;

    while let Some(i) = queue.pop_front() {
        order.push(i);

        let mut nbrs: Vec<usize> = adj[i].iter().copied().filter(|&j| !visited[j]).collect();
        if let Some(r) = rng.as_deref_mut() {
            nbrs.shuffle(r);
        }
        for j in nbrs {
            visited[j] = true;
            queue.push_back(j);
        }
    }

    if order.len() != n {
        return Err(LinearizeError::Disconnected {
            reached: order.len(),
            total: n,
        });
    }
    Ok(order)
}

fn pick_root<R: Rng + ?Sized>(
    graph: &MolGraph,
    maps: &LabelMaps,
    root: RootChoice,
    rng: &mut R,
) -> Result<usize> {
    let start_raw = maps.nodes.unrelabel(maps.start_node_label)?;
    let candidates: Vec<usize> = (0..graph.num_atoms())
        .filter(|&i| graph.atoms[i].atomic_number == start_raw)
        .collect();

    match root {
        RootChoice::Fixed(i) => {
            if i >= graph.num_atoms() {
                return Err(LinearizeError::InvalidRoot {
                    root: i,
                    n_atoms: graph.num_atoms(),
                }
                .into());
            }
            Ok(i)
        }
        RootChoice::FirstStart => candidates
            .first()
            .copied()
            .ok_or_else(|| LinearizeError::NoStartAtom(maps.start_node_label).into()),
        RootChoice::RandomStart => candidates
            .choose(rng)
            .copied()
            .ok_or_else(|| LinearizeError::NoStartAtom(maps.start_node_label).into()),
    }
}

/// Linearize a graph with window `window`. With `shuffle`, neighbour order is randomized.
pub fn linearize<R: Rng + ?Sized>(
    graph: &MolGraph,
    maps: &LabelMaps,
    window: usize,
    root: RootChoice,
    shuffle: bool,
    rng: &mut R,
) -> Result<LinearizedSequence> {
    if graph.num_atoms() == 0 {
        return Err(LinearizeError::Empty.into());
    }
    let root = pick_root(graph, maps, root, rng)?;

    let order = if shuffle {
        bfs_order(graph, root, Some(rng))?
    } else {
        bfs_order::<R>(graph, root, None)?
    };

    let n = order.len();
    let mut position = vec![0; n];
    for (pos, &atom) in order.iter().enumerate() {
        position[atom] = pos;
    }

    let mut edge_windows = vec![vec![0; window]; n];
    for bond in &graph.bonds {
        let (a, b) = (position[bond.atom_0], position[bond.atom_1]);
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let span = hi - lo;
        if span > window {
            return Err(LinearizeError::BandwidthExceeded { span, window }.into());
        }
        edge_windows[hi][span - 1] = maps.edges.relabel(bond.order)?;
    }

    let node_labels = order
        .iter()
        .map(|&i| maps.nodes.relabel(graph.atoms[i].atomic_number))
        .collect::<Result<Vec<_>>>()?;

    Ok(LinearizedSequence {
        node_labels,
        edge_windows,
        window,
        order,
    })
}

/// Rebuild a graph from a sequence. Node `i` of the result is node `i` of the sequence.
pub fn reconstruct(seq: &LinearizedSequence, maps: &LabelMaps) -> Result<MolGraph> {
    let mut graph = MolGraph::new();
    for &label in &seq.node_labels {
        graph.add_atom(Atom::new(maps.nodes.unrelabel(label)?));
    }

    for (i, window) in seq.edge_windows.iter().enumerate() {
        for (k, &class) in window.iter().enumerate() {
            if class == 0 {
                continue;
            }
            if k >= i {
                return Err(crate::error::GenError::Graph(format!(
                    "step {i} has an edge in slot {k}, before node 0"
                )));
            }
            let order = maps.edges.unrelabel(class)?;
            graph.add_bond(i, i - 1 - k, order)?;
        }
    }
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::{chem::parse_smiles, config::RelabelConfig, error::GenError};

    fn maps() -> LabelMaps {
        LabelMaps::new(&RelabelConfig::default()).unwrap()
    }

    /// Same atoms and bonds, under the BFS permutation.
    fn assert_isomorphic(graph: &MolGraph, seq: &LinearizedSequence, rebuilt: &MolGraph) {
        assert_eq!(rebuilt.num_atoms(), graph.num_atoms());
        assert_eq!(rebuilt.bonds.len(), graph.bonds.len());
        for (i, &src) in seq.order.iter().enumerate() {
            assert_eq!(rebuilt.atoms[i].atomic_number, graph.atoms[src].atomic_number);
        }
        for bond in &graph.bonds {
            let a = seq.order.iter().position(|&x| x == bond.atom_0).unwrap();
            let b = seq.order.iter().position(|&x| x == bond.atom_1).unwrap();
            assert_eq!(rebuilt.bond_order(a, b), bond.order);
        }
    }

    #[test]
    fn round_trip_isomorphism() {
        let maps = maps();
        let mut rng = StdRng::seed_from_u64(7);

        for smi in [
            "CCO",
            "c1ccccc1O",
            "CC(=O)Oc1ccccc1C(=O)O",
            "N#CC1CCN(CC1)C(=O)c1ccc(Cl)cc1",
            "FC(F)(F)c1ccc(S(=O)(=O)N)cc1Br",
        ] {
            let graph = parse_smiles(smi).unwrap();
            for shuffle in [false, true] {
                let seq = linearize(&graph, &maps, 12, RootChoice::RandomStart, shuffle, &mut rng).unwrap();
                assert_eq!(seq.len(), graph.num_atoms());
                assert_eq!(seq.node_labels[0], maps.start_node_label);

                let rebuilt = reconstruct(&seq, &maps).unwrap();
                assert_isomorphic(&graph, &seq, &rebuilt);
            }
        }
    }

    #[test]
    fn windows_and_padding() {
        let maps = maps();
        let mut rng = StdRng::seed_from_u64(0);
        let graph = parse_smiles("C=CO").unwrap();
        let seq = linearize(&graph, &maps, 4, RootChoice::Fixed(0), false, &mut rng).unwrap();

        assert_eq!(seq.order, vec![0, 1, 2]);
        assert_eq!(seq.edge_windows[0], vec![0, 0, 0, 0]);
        assert_eq!(seq.edge_windows[1], vec![2, 0, 0, 0]);
        assert_eq!(seq.edge_windows[2], vec![1, 0, 0, 0]);
    }

    #[test]
    fn bandwidth_exceeded() {
        let maps = maps();
        let mut rng = StdRng::seed_from_u64(0);
        // BFS from atom 0 visits the ring partner at position 2, pushing the first carbon's
        // branches out to positions 3 and 4.
        let graph = parse_smiles("C1C(C)(C)C(C)(C)C1").unwrap();
        let result = linearize(&graph, &maps, 2, RootChoice::Fixed(0), false, &mut rng);
        assert!(matches!(
            result,
            Err(GenError::Linearize(LinearizeError::BandwidthExceeded { window: 2, .. }))
        ));
        assert!(linearize(&graph, &maps, 12, RootChoice::Fixed(0), false, &mut rng).is_ok());
    }

    #[test]
    fn rejects() {
        let maps = maps();
        let mut rng = StdRng::seed_from_u64(0);

        let graph = parse_smiles("CC.O").unwrap();
        assert!(matches!(
            linearize(&graph, &maps, 12, RootChoice::FirstStart, false, &mut rng),
            Err(GenError::Linearize(LinearizeError::Disconnected { reached: 2, total: 3 }))
        ));

        let graph = parse_smiles("OO").unwrap();
        assert!(matches!(
            linearize(&graph, &maps, 12, RootChoice::RandomStart, false, &mut rng),
            Err(GenError::Linearize(LinearizeError::NoStartAtom(0)))
        ));

        assert!(matches!(
            linearize(&MolGraph::new(), &maps, 12, RootChoice::FirstStart, false, &mut rng),
            Err(GenError::Linearize(LinearizeError::Empty))
        ));
    }

    #[test]
    fn edge_before_first_node_fails() {
        let maps = maps();
        let seq = LinearizedSequence {
            node_labels: vec![0, 0],
            edge_windows: vec![vec![1, 0], vec![0, 1]],
            window: 2,
            order: Vec::new(),
        };
        assert!(reconstruct(&seq, &maps).is_err());
    }
}
