//! Reading and writing SMILES line notation.
//!
//! The reader handles the organic subset, bracket atoms (isotope and chirality are read and
//! dropped), branches, ring closures including `%nn`, explicit bond symbols, and
//! dot-disconnected fragments. Aromatic input is kekulized before it's returned, so graphs
//! only carry single, double, and triple bonds.
//!
//! The writer is a two-pass DFS: the first pass finds the spanning tree and ring closure
//! bonds, the second emits atoms, branches, and ring digits.

use std::collections::HashMap;

use crate::{
    chem::{Atom, BondOrder, MolGraph, element_by_symbol, kekulize},
    error::{GenError, Result},
};

const ORGANIC_SUBSET: [&str; 10] = ["B", "C", "N", "O", "P", "S", "F", "Cl", "Br", "I"];
const AROMATIC_TWO_LETTER: [&str; 2] = ["se", "as"];

fn err(smiles: &str, pos: usize, msg: &str) -> GenError {
    GenError::Smiles(format!("{msg} at position {pos} in {smiles:?}"))
}

/// Parse a SMILES string into a kekulized molecule graph.
pub fn parse_smiles(smiles: &str) -> Result<MolGraph> {
    let chars: Vec<char> = smiles.trim().chars().collect();

    let mut graph = MolGraph::new();
    let mut aromatic: Vec<bool> = Vec::new();

    let mut prev: Option<usize> = None;
    let mut branches: Vec<Option<usize>> = Vec::new();
    let mut pending_bond: Option<BondOrder> = None;
    let mut ring_opens: HashMap<u32, (usize, Option<BondOrder>, usize)> = HashMap::new();

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];

        // Atom tokens first; everything else is structure.
        let atom_token = match c {
            '[' => {
                let Some(close) = chars[i..].iter().position(|&ch| ch == ']') else {
                    return Err(err(smiles, i, "unclosed bracket"));
                };
                let content: String = chars[i + 1..i + close].iter().collect();
                let parsed = parse_bracket_atom(&content).map_err(|m| err(smiles, i, &m))?;
                i += close + 1;
                Some(parsed)
            }
            'C' | 'B' if i + 1 < chars.len() && matches!((c, chars[i + 1]), ('C', 'l') | ('B', 'r')) => {
                let sym: String = [c, chars[i + 1]].iter().collect();
                i += 2;
                Some(organic_atom(&sym, false).map_err(|m| err(smiles, i, &m))?)
            }
            'B' | 'C' | 'N' | 'O' | 'P' | 'S' | 'F' | 'I' => {
                i += 1;
                Some(organic_atom(&c.to_string(), false).map_err(|m| err(smiles, i, &m))?)
            }
            'b' | 'c' | 'n' | 'o' | 'p' | 's' => {
                i += 1;
                Some(organic_atom(&c.to_ascii_uppercase().to_string(), true).map_err(|m| err(smiles, i, &m))?)
            }
            _ => None,
        };

        if let Some((atom, is_aromatic)) = atom_token {
            let idx = graph.add_atom(atom);
            aromatic.push(is_aromatic);

            if let Some(p) = prev {
                let order = pending_bond.take().unwrap_or_else(|| default_bond(&aromatic, p, idx));
                graph.add_bond(p, idx, order)?;
            } else if pending_bond.is_some() {
                return Err(err(smiles, i, "bond symbol without a preceding atom"));
            }
            prev = Some(idx);
            continue;
        }

        match c {
            '(' => {
                if prev.is_none() {
                    return Err(err(smiles, i, "branch without a current atom"));
                }
                branches.push(prev);
            }
            ')' => {
                let Some(p) = branches.pop() else {
                    return Err(err(smiles, i, "branch end without a matching '('"));
                };
                prev = p;
            }
            '-' | '/' | '\\' => pending_bond = Some(BondOrder::Single),
            '=' => pending_bond = Some(BondOrder::Double),
            '#' => pending_bond = Some(BondOrder::Triple),
            ':' => pending_bond = Some(BondOrder::Aromatic),
            '.' => {
                prev = None;
                pending_bond = None;
            }
            '%' | '0'..='9' => {
                let (ring_num, width) = if c == '%' {
                    if i + 2 >= chars.len() || !chars[i + 1].is_ascii_digit() || !chars[i + 2].is_ascii_digit() {
                        return Err(err(smiles, i, "malformed %nn ring closure"));
                    }
                    let n = chars[i + 1].to_digit(10).unwrap_or(0) * 10 + chars[i + 2].to_digit(10).unwrap_or(0);
                    (n, 3)
                } else {
                    (c.to_digit(10).unwrap_or(0), 1)
                };

                let Some(current) = prev else {
                    return Err(err(smiles, i, "ring closure without a current atom"));
                };

                match ring_opens.remove(&ring_num) {
                    Some((open_atom, open_bond, _)) => {
                        let order = match (pending_bond.take(), open_bond) {
                            (Some(a), Some(b)) if a != b => {
                                return Err(err(smiles, i, "conflicting ring closure bonds"));
                            }
                            (Some(a), _) => a,
                            (None, Some(b)) => b,
                            (None, None) => default_bond(&aromatic, open_atom, current),
                        };
                        graph.add_bond(open_atom, current, order)?;
                    }
                    None => {
                        ring_opens.insert(ring_num, (current, pending_bond.take(), i));
                    }
                }
                i += width;
                continue;
            }
            c if c.is_whitespace() => break,
            '$' => return Err(err(smiles, i, "quadruple bonds are not supported")),
            _ => return Err(err(smiles, i, &format!("unexpected character {c:?}"))),
        }
        i += 1;
    }

    if let Some((_, _, pos)) = ring_opens.values().next() {
        return Err(err(smiles, *pos, "unclosed ring"));
    }
    if !branches.is_empty() {
        return Err(err(smiles, chars.len(), "unclosed branch"));
    }
    if graph.atoms.is_empty() {
        return Err(GenError::Smiles(format!("no atoms in {smiles:?}")));
    }

    if graph.bonds.iter().any(|b| b.order == BondOrder::Aromatic) {
        kekulize(&mut graph, &aromatic)?;
    }

    Ok(graph)
}

fn default_bond(aromatic: &[bool], a: usize, b: usize) -> BondOrder {
    if aromatic[a] && aromatic[b] {
        BondOrder::Aromatic
    } else {
        BondOrder::Single
    }
}

fn organic_atom(symbol: &str, aromatic: bool) -> std::result::Result<(Atom, bool), String> {
    let el = element_by_symbol(symbol).ok_or_else(|| format!("unknown element {symbol}"))?;
    Ok((Atom::new(el.atomic_number), aromatic))
}

/// Parses the text between `[` and `]`.
fn parse_bracket_atom(content: &str) -> std::result::Result<(Atom, bool), String> {
    let chars: Vec<char> = content.chars().collect();
    let mut i = 0;

    // Isotope; dropped.
    while i < chars.len() && chars[i].is_ascii_digit() {
        i += 1;
    }

    if i >= chars.len() {
        return Err(format!("empty bracket atom [{content}]"));
    }

    let (symbol, aromatic) = if chars[i].is_ascii_lowercase() {
        let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
        if AROMATIC_TWO_LETTER.contains(&two.as_str()) {
            i += 2;
            (capitalize(&two), true)
        } else {
            i += 1;
            (chars[i - 1].to_ascii_uppercase().to_string(), true)
        }
    } else if chars[i].is_ascii_uppercase() {
        let one = chars[i].to_string();
        if i + 1 < chars.len() && chars[i + 1].is_ascii_lowercase() {
            let two: String = chars[i..i + 2].iter().collect();
            if element_by_symbol(&two).is_some() {
                i += 2;
                (two, false)
            } else {
                i += 1;
                (one, false)
            }
        } else {
            i += 1;
            (one, false)
        }
    } else {
        return Err(format!("bad element in [{content}]"));
    };

    let el = element_by_symbol(&symbol).ok_or_else(|| format!("unknown element {symbol}"))?;

    // Chirality; dropped.
    while i < chars.len() && chars[i] == '@' {
        i += 1;
    }

    let mut h_count = 0;
    if i < chars.len() && chars[i] == 'H' {
        i += 1;
        h_count = 1;
        if i < chars.len() && chars[i].is_ascii_digit() {
            h_count = chars[i].to_digit(10).unwrap_or(1) as u8;
            i += 1;
        }
    }

    let mut charge: i8 = 0;
    if i < chars.len() && (chars[i] == '+' || chars[i] == '-') {
        let sign: i8 = if chars[i] == '+' { 1 } else { -1 };
        let sign_char = chars[i];
        i += 1;
        if i < chars.len() && chars[i].is_ascii_digit() {
            charge = sign * chars[i].to_digit(10).unwrap_or(1) as i8;
            i += 1;
        } else {
            let mut magnitude: i8 = 1;
            while i < chars.len() && chars[i] == sign_char {
                magnitude = magnitude
                    .checked_add(1)
                    .ok_or_else(|| format!("charge out of range in [{content}]"))?;
                i += 1;
            }
            charge = sign * magnitude;
        }
    }

    // Atom class; dropped.
    if i < chars.len() && chars[i] == ':' {
        i += 1;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
    }

    if i != chars.len() {
        return Err(format!("trailing characters in [{content}]"));
    }

    Ok((
        Atom {
            atomic_number: el.atomic_number,
            charge,
            explicit_h: Some(h_count),
        },
        aromatic,
    ))
}

fn capitalize(s: &str) -> String {
    let mut c = s.chars();
    match c.next() {
        Some(f) => f.to_ascii_uppercase().to_string() + c.as_str(),
        None => String::new(),
    }
}

/// Hands out the lowest free ring-closure digit, and takes them back once a ring closes.
struct DigitHeap {
    in_use: Vec<usize>,
}

impl DigitHeap {
    fn take(&mut self) -> usize {
        let mut digit = 1;
        while self.in_use.contains(&digit) {
            digit += 1;
        }
        self.in_use.push(digit);
        digit
    }

    fn release(&mut self, digit: usize) {
        self.in_use.retain(|&d| d != digit);
    }
}

fn format_ring_digit(digit: usize) -> String {
    if digit < 10 {
        digit.to_string()
    } else {
        format!("%{digit:02}")
    }
}

fn atom_token(atom: &Atom) -> String {
    let symbol = atom.symbol();
    if atom.charge == 0 && atom.explicit_h.is_none() && ORGANIC_SUBSET.contains(&symbol) {
        return symbol.to_owned();
    }

    let mut result = format!("[{symbol}");
    match atom.explicit_h {
        Some(1) => result.push('H'),
        Some(h) if h > 1 => result.push_str(&format!("H{h}")),
        _ => (),
    }
    match atom.charge {
        0 => (),
        1 => result.push('+'),
        -1 => result.push('-'),
        q if q > 0 => result.push_str(&format!("+{q}")),
        q => result.push_str(&format!("-{}", -q)),
    }
    result.push(']');
    result
}

/// Spanning tree and ring closures found by the first DFS pass.
struct Traversal {
    visited: Vec<bool>,
    bond_used: Vec<bool>,
    children: Vec<Vec<(usize, usize)>>,
    /// Ring closure bonds opened at each atom. (Bond indices)
    openings: Vec<Vec<usize>>,
    /// Ring closure bonds closed at each atom.
    closings: Vec<Vec<usize>>,
}

fn traverse(graph: &MolGraph, adj: &[Vec<usize>], u: usize, parent_bond: Option<usize>, t: &mut Traversal) {
    t.visited[u] = true;

    for &v in &adj[u] {
        let Some(b) = graph.bond_index(u, v) else {
            continue;
        };
        if Some(b) == parent_bond || t.bond_used[b] {
            continue;
        }
        t.bond_used[b] = true;

        if t.visited[v] {
            // Back edge to an ancestor: the digit opens there, and closes here.
            t.openings[v].push(b);
            t.closings[u].push(b);
        } else {
            t.children[u].push((v, b));
            traverse(graph, adj, v, Some(b), t);
        }
    }
}

fn emit(
    graph: &MolGraph,
    u: usize,
    t: &Traversal,
    digits: &mut DigitHeap,
    open_digits: &mut HashMap<usize, usize>,
    out: &mut String,
) {
    out.push_str(&atom_token(&graph.atoms[u]));

    for &b in &t.closings[u] {
        if let Some(digit) = open_digits.remove(&b) {
            out.push_str(graph.bonds[b].order.smiles_symbol());
            out.push_str(&format_ring_digit(digit));
            digits.release(digit);
        }
    }
    for &b in &t.openings[u] {
        let digit = digits.take();
        open_digits.insert(b, digit);
        out.push_str(&format_ring_digit(digit));
    }

    let n_children = t.children[u].len();
    for (i, &(v, b)) in t.children[u].iter().enumerate() {
        let branch = i + 1 < n_children;
        if branch {
            out.push('(');
        }
        out.push_str(graph.bonds[b].order.smiles_symbol());
        emit(graph, v, t, digits, open_digits, out);
        if branch {
            out.push(')');
        }
    }
}

/// Write a (non-canonical) SMILES string. Atoms are visited depth-first from the lowest
/// index of each fragment, neighbours in ascending index order. Fragments are joined
/// with `.`.
pub fn write_smiles(graph: &MolGraph) -> String {
    let mut adj = graph.adjacency_list();
    for nbrs in adj.iter_mut() {
        nbrs.sort_unstable();
    }

    let n = graph.atoms.len();
    let mut t = Traversal {
        visited: vec![false; n],
        bond_used: vec![false; graph.bonds.len()],
        children: vec![Vec::new(); n],
        openings: vec![Vec::new(); n],
        closings: vec![Vec::new(); n],
    };

    let mut roots = Vec::new();
    for start in 0..n {
        if !t.visited[start] {
            roots.push(start);
            traverse(graph, &adj, start, None, &mut t);
        }
    }

    let mut digits = DigitHeap { in_use: Vec::new() };
    let mut open_digits = HashMap::new();
    let mut fragments = Vec::with_capacity(roots.len());
    for root in roots {
        let mut out = String::new();
        emit(graph, root, &t, &mut digits, &mut open_digits, &mut out);
        fragments.push(out);
    }

    fragments.join(".")
}
