//! Heuristic scores used as reward terms: drug-likeness (QED) and synthetic accessibility.
//!
//! [QED paper](https://www.nature.com/articles/nchem.1243). The desirability functions and
//! weights are the published ones. The property inputs are estimated from the graph:
//! ALogP and PSA use simplified atom-contribution tables, and structural alerts are not
//! matched. (They contribute as zero alerts)
//!
//! [SA score paper](https://jcheminf.biomedcentral.com/articles/10.1186/1758-2946-1-8).
//! The complexity penalties (size, stereo centres, spiro, bridgeheads, macrocycles) follow
//! the paper; the fragment-frequency term is replaced by per-atom environment estimates, as
//! we don't ship the fragment table.

use crate::chem::{BondOrder, HYDROGEN_MASS, SanitizedMol, element_by_number, rings::ring_sizes};

/// Asymmetric double sigmoid parameters: A, B, C, D, E, F, DMAX.
type AdsParams = [f32; 7];

const ADS_MW: AdsParams = [2.817065973, 392.5754953, 290.7489764, 2.419764353, 49.22325677, 65.37051707, 104.9805561];
const ADS_ALOGP: AdsParams = [3.172690585, 137.8624751, 2.534937431, 4.581497897, 0.822739154, 0.576295591, 131.3186604];
const ADS_HBA: AdsParams = [2.948620388, 160.4605972, 3.615294657, 4.435986202, 0.290141953, 1.300669958, 148.7763046];
const ADS_HBD: AdsParams = [1.618662227, 1010.051101, 0.985094388, 0.000000001, 0.713820843, 0.920922555, 258.1632616];
const ADS_PSA: AdsParams = [1.876861559, 125.2232657, 62.90773554, 87.83366614, 12.01999824, 28.51324732, 104.5686167];
const ADS_ROTB: AdsParams = [0.010000000, 272.4121427, 2.558379970, 1.565547684, 1.271567166, 2.758063707, 105.4420403];
const ADS_AROM: AdsParams = [3.217788970, 957.7374108, 2.274627939, 0.000000001, 1.317690384, 0.375760881, 312.3372610];
const ADS_ALERTS: AdsParams = [0.010000000, 1199.094025, -0.09002883, 0.000000001, 0.185904477, 0.875193782, 417.7253140];

/// Mean weights: MW, ALogP, HBA, HBD, PSA, RotB, Arom, Alerts.
const QED_WEIGHTS: [f32; 8] = [0.66, 0.46, 0.05, 0.61, 0.06, 0.65, 0.48, 0.95];

const SA_MIN: f32 = -4.0;
const SA_MAX: f32 = 2.5;

fn ads(x: f32, p: &AdsParams) -> f32 {
    let [a, b, c, d, e, f, dmax] = *p;
    let v = a
        + b / (1. + (-(x - c + d / 2.) / e).exp()) * (1. - 1. / (1. + (-(x - c - d / 2.) / f).exp()));
    v / dmax
}

/// The raw QED properties of a molecule.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QedProperties {
    pub mw: f32,
    pub alogp: f32,
    pub hba: usize,
    pub hbd: usize,
    pub psa: f32,
    pub rotb: usize,
    pub arom: usize,
    pub alerts: usize,
}

pub fn molecular_weight(mol: &SanitizedMol) -> f32 {
    mol.graph
        .atoms
        .iter()
        .zip(&mol.implicit_h)
        .map(|(atom, &h)| {
            element_by_number(atom.atomic_number).map(|e| e.mass).unwrap_or(0.) + h as f32 * HYDROGEN_MASS
        })
        .sum()
}

fn has_double_to(mol: &SanitizedMol, atom: usize, heteroatom_only: bool) -> bool {
    mol.graph.bonds.iter().any(|b| {
        b.order == BondOrder::Double
            && b.partner(atom)
                .is_some_and(|p| !heteroatom_only || mol.graph.atoms[p].atomic_number != 6)
    })
}

fn hetero_neighbours(mol: &SanitizedMol, atom: usize) -> usize {
    mol.graph
        .bonds
        .iter()
        .filter_map(|b| b.partner(atom))
        .filter(|&p| !matches!(mol.graph.atoms[p].atomic_number, 1 | 6))
        .count()
}

/// Atom-contribution estimate of the octanol/water partition coefficient. A reduced
/// Wildman-Crippen style table keyed on element, aromaticity, and local environment.
pub fn alogp(mol: &SanitizedMol) -> f32 {
    let mut total = 0.;
    for (i, atom) in mol.graph.atoms.iter().enumerate() {
        let h = mol.implicit_h[i] as f32;
        let aromatic = mol.aromatic[i];
        let contrib = match atom.atomic_number {
            6 => {
                let polar = hetero_neighbours(mol, i) > 0;
                let c = match (aromatic, polar) {
                    (true, false) => 0.1581,
                    (true, true) => -0.0516,
                    (false, false) => 0.1441,
                    (false, true) => -0.2035,
                };
                c + 0.123 * h
            }
            7 => {
                let c = if aromatic {
                    -0.4806
                } else if has_double_to(mol, i, false) {
                    -0.3239
                } else {
                    -1.019 + 0.255 * (mol.graph.degree(i) as f32)
                };
                c + 0.2142 * h
            }
            8 => {
                let c = if aromatic {
                    0.1552
                } else if has_double_to(mol, i, false) {
                    -0.1526
                } else if h > 0. {
                    -0.2893
                } else {
                    -0.0684
                };
                c + 0.298 * h
            }
            9 => 0.4202,
            17 => 0.6895,
            35 => 0.8456,
            53 => 0.8857,
            16 => {
                if aromatic {
                    0.6237
                } else if has_double_to(mol, i, true) {
                    -0.0024
                } else {
                    0.6482
                }
            }
            15 => 0.8612,
            5 => -0.4,
            14 => 0.3,
            _ => 0.,
        };
        total += contrib;
    }
    total
}

/// Topological polar surface area from N and O contributions.
/// [Ertl 2000](https://pubs.acs.org/doi/10.1021/jm000942e)
pub fn polar_surface_area(mol: &SanitizedMol) -> f32 {
    let mut total = 0.;
    for (i, atom) in mol.graph.atoms.iter().enumerate() {
        let h = mol.implicit_h[i];
        let heavy = mol.graph.degree(i);
        let double = has_double_to(mol, i, false);
        let triple = mol
            .graph
            .bonds
            .iter()
            .any(|b| b.order == BondOrder::Triple && b.partner(i).is_some());

        total += match atom.atomic_number {
            7 => {
                if mol.aromatic[i] {
                    if h > 0 { 15.79 } else if heavy == 3 { 4.41 } else { 12.89 }
                } else if triple {
                    23.79
                } else if double {
                    if h > 0 { 23.85 } else if heavy == 3 { 11.68 } else { 12.36 }
                } else {
                    match h {
                        0 => 3.24,
                        1 => 12.03,
                        2 => 26.02,
                        _ => 27.64,
                    }
                }
            }
            8 => {
                if mol.aromatic[i] {
                    13.14
                } else if double {
                    17.07
                } else if h > 0 {
                    20.23
                } else {
                    9.23
                }
            }
            _ => 0.,
        };
    }
    total
}

/// N and O atoms not carrying a positive charge.
pub fn h_bond_acceptors(mol: &SanitizedMol) -> usize {
    mol.graph
        .atoms
        .iter()
        .filter(|a| matches!(a.atomic_number, 7 | 8) && a.charge <= 0)
        .count()
}

/// N and O atoms with at least one hydrogen.
pub fn h_bond_donors(mol: &SanitizedMol) -> usize {
    mol.graph
        .atoms
        .iter()
        .enumerate()
        .filter(|(i, a)| matches!(a.atomic_number, 7 | 8) && mol.implicit_h[*i] > 0)
        .count()
}

/// Acyclic single bonds between two non-terminal heavy atoms, excluding bonds next to a
/// triple bond.
pub fn rotatable_bonds(mol: &SanitizedMol) -> usize {
    let g = &mol.graph;
    let mut ring_bond = vec![false; g.bonds.len()];
    for ring in &mol.rings.rings {
        for &b in &ring.bonds {
            ring_bond[b] = true;
        }
    }
    let has_triple = |a: usize| {
        g.bonds
            .iter()
            .any(|b| b.order == BondOrder::Triple && b.partner(a).is_some())
    };

    g.bonds
        .iter()
        .enumerate()
        .filter(|(i, b)| {
            b.order == BondOrder::Single
                && !ring_bond[*i]
                && g.degree(b.atom_0) > 1
                && g.degree(b.atom_1) > 1
                && !has_triple(b.atom_0)
                && !has_triple(b.atom_1)
        })
        .count()
}

pub fn qed_properties(mol: &SanitizedMol) -> QedProperties {
    QedProperties {
        mw: molecular_weight(mol),
        alogp: alogp(mol),
        hba: h_bond_acceptors(mol),
        hbd: h_bond_donors(mol),
        psa: polar_surface_area(mol),
        rotb: rotatable_bonds(mol),
        arom: mol.rings.aromatic_rings(&mol.graph).len(),
        alerts: 0,
    }
}

/// Quantitative estimate of drug-likeness, in (0, 1]. Higher is more drug-like.
pub fn qed(mol: &SanitizedMol) -> f32 {
    let p = qed_properties(mol);
    let desirabilities = [
        ads(p.mw, &ADS_MW),
        ads(p.alogp, &ADS_ALOGP),
        ads(p.hba as f32, &ADS_HBA),
        ads(p.hbd as f32, &ADS_HBD),
        ads(p.psa, &ADS_PSA),
        ads(p.rotb as f32, &ADS_ROTB),
        ads(p.arom as f32, &ADS_AROM),
        ads(p.alerts as f32, &ADS_ALERTS),
    ];

    let weight_sum: f32 = QED_WEIGHTS.iter().sum();
    let log_sum: f32 = desirabilities
        .iter()
        .zip(QED_WEIGHTS)
        .map(|(d, w)| w * d.max(1e-6).ln())
        .sum();

    (log_sum / weight_sum).exp()
}

/// Estimated frequency score of an atom's environment: positive for environments common
/// in purchasable compounds, negative for rare ones.
fn environment_score(mol: &SanitizedMol, atom: usize, ring_counts: &[usize], small_rings: &[Vec<u8>]) -> f32 {
    let a = &mol.graph.atoms[atom];
    let mut score = match a.atomic_number {
        6 => 1.0,
        8 => 0.8,
        7 => 0.6,
        9 | 17 => 0.5,
        16 => 0.3,
        35 => 0.2,
        53 => 0.,
        15 => -0.5,
        _ => -1.,
    };
    if a.atomic_number == 6 && mol.graph.degree(atom) == 4 {
        score -= 0.7;
    }
    if a.charge != 0 {
        score -= 0.5;
    }
    if ring_counts[atom] >= 3 {
        score -= 0.3;
    }
    // Strained 3- and 4-membered rings.
    if !small_rings[atom].is_empty() {
        score -= 0.4;
    }
    score
}

/// Possible stereo centres: sp3 carbons with four distinct substituent environments,
/// approximated as having no hydrogen pair and no two identical terminal neighbours.
fn potential_stereo_centres(mol: &SanitizedMol) -> usize {
    let g = &mol.graph;
    let adj = g.adjacency_list();
    (0..g.atoms.len())
        .filter(|&i| {
            if g.atoms[i].atomic_number != 6 || has_double_to(mol, i, false) {
                return false;
            }
            let h = mol.implicit_h[i] as usize;
            if h > 1 || adj[i].len() + h != 4 {
                return false;
            }
            // Neighbour signature: element and heavy degree.
            let mut sigs: Vec<(u8, usize)> = adj[i]
                .iter()
                .map(|&n| (g.atoms[n].atomic_number, adj[n].len()))
                .collect();
            sigs.sort_unstable();
            sigs.dedup();
            sigs.len() == adj[i].len()
        })
        .count()
}

/// Synthetic accessibility score, from 1 (easy) to 10 (hard).
pub fn sa_score(mol: &SanitizedMol) -> f32 {
    let n_atoms = mol.num_heavy_atoms() as f32;
    if n_atoms == 0. {
        return 10.;
    }

    let ring_counts = mol.rings.atom_ring_counts(mol.graph.atoms.len());
    let small_rings = ring_sizes(&mol.graph.adjacency_list(), 4);

    let fragment_score: f32 = (0..mol.graph.atoms.len())
        .map(|i| environment_score(mol, i, &ring_counts, &small_rings))
        .sum::<f32>()
        / n_atoms;

    let size_penalty = n_atoms.powf(1.005) - n_atoms;
    let stereo_penalty = ((potential_stereo_centres(mol) + 1) as f32).log10();
    let spiro_penalty = ((mol.rings.num_spiro_atoms() + 1) as f32).log10();
    let bridge_penalty = ((mol.rings.num_bridgehead_atoms() + 1) as f32).log10();
    let macrocycle_penalty = if mol.rings.rings.iter().any(|r| r.len() > 8) {
        2f32.log10()
    } else {
        0.
    };

    let complexity = -size_penalty - stereo_penalty - spiro_penalty - bridge_penalty - macrocycle_penalty;

    let raw = fragment_score + complexity;

    let mut sa = 11. - (raw - SA_MIN + 1.) / (SA_MAX - SA_MIN) * 9.;
    // Smooth the upper end.
    if sa > 8. {
        sa = 8. + (sa + 1. - 9.).ln();
    }
    sa.clamp(1., 10.)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chem::{parse_smiles, sanitize};

    fn mol(smiles: &str) -> SanitizedMol {
        sanitize(&parse_smiles(smiles).unwrap()).unwrap()
    }

    #[test]
    fn molecular_weight_ethanol() {
        let mw = molecular_weight(&mol("CCO"));
        assert!((mw - 46.07).abs() < 0.05, "{mw}");
    }

    #[test]
    fn counts_aspirin() {
        let m = mol("CC(=O)Oc1ccccc1C(=O)O");
        let p = qed_properties(&m);
        assert_eq!(p.hbd, 1);
        assert_eq!(p.hba, 4);
        assert_eq!(p.arom, 1);
        assert!((p.mw - 180.16).abs() < 0.1, "{}", p.mw);
        assert!((p.psa - 63.6).abs() < 0.5, "{}", p.psa);
        assert_eq!(p.rotb, 3);
    }

    #[test]
    fn qed_in_range_and_ordered() {
        let aspirin = qed(&mol("CC(=O)Oc1ccccc1C(=O)O"));
        let methane = qed(&mol("C"));
        assert!(aspirin > 0. && aspirin <= 1.);
        assert!(methane > 0. && methane <= 1.);
        assert!(aspirin > methane);
    }

    #[test]
    fn sa_in_range_and_ordered() {
        let simple = sa_score(&mol("c1ccccc1O"));
        let complex = sa_score(&mol("C1CC2(CCC1)CC1CCC2C1P(I)(I)I"));
        assert!((1. ..=10.).contains(&simple));
        assert!((1. ..=10.).contains(&complex));
        assert!(complex > simple);
    }
}
