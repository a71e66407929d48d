//! UMI deduplication: per-class UMI graphs under the directional collapse
//! rule, reduced to arborescence roots, then mapped to gene-level classes.
//!
//! Neighbour candidates within the edit distance come from a BK-tree over
//! the 2-bit encoded UMIs, the same structure we use for approximate
//! barcode matching elsewhere.

use crate::eqclass::{GeneEqClass, TranscriptGroup, Tx2Gene, UmiGroup};
use crate::error::QuantError;
use crate::utils::hamming_dist;
use bktree::BkTree;
use fxhash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};

/// One edge of a cell's UMI graph, for the optional graph dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UmiEdge {
    /// Source UMI (2-bit encoded).
    pub from: u64,
    /// Target UMI (2-bit encoded).
    pub to: u64,
    /// Whether the collapse rule holds in both directions.
    pub bidirectional: bool,
}

/// Everything the deduplication step hands to the rest of the cell worker.
pub struct DedupOutput {
    /// Gene-level classes with deduplicated counts, canonical label order.
    pub classes: Vec<GeneEqClass>,
    /// Warm-start abundances from single-gene classes.
    pub gene_alphas: Vec<f64>,
    /// Evidence tier per gene (0 = unseen, 1 = seen, 2 = low confidence).
    pub tiers: Vec<u8>,
    /// Per class (parallel to `classes`), arborescence length histogram.
    /// Empty unless requested.
    pub arbo_counts: Vec<FxHashMap<u16, u32>>,
    /// Total deduplicated molecule count of the cell.
    pub total_count: f64,
    /// Number of vertices over all per-class UMI graphs.
    pub num_vertices: u64,
    /// Unidirectional collapse edges seen while building the graphs.
    pub uni_edges: u64,
    /// Bidirectional collapse edges seen while building the graphs.
    pub bi_edges: u64,
    /// Edge list for the optional graph dump. Empty unless requested.
    pub graph_edges: Vec<UmiEdge>,
}

/// Directed collapse rule: `u -> v` is allowed when
/// `count(u) >= 2 * count(v) - 1`.
fn directional(cu: u32, cv: u32) -> bool {
    cu as u64 >= 2 * cv as u64 - 1
}

fn umi_hamming(a: &u64, b: &u64) -> isize {
    hamming_dist(*a, *b) as isize
}

struct ClassCollapse {
    count: u32,
    arbo_lengths: Vec<u16>,
    uni_edges: u64,
    bi_edges: u64,
    edges: Vec<UmiEdge>,
}

/// Collapse one class's UMI multiset into arborescence roots.
///
/// Vertices are visited by decreasing read count (ties by UMI value), each
/// unvisited vertex roots a new arborescence and absorbs everything
/// reachable over directed collapse edges.
fn collapse_umis(umis: &UmiGroup, edit_distance: u32, want_edges: bool) -> ClassCollapse {
    let mut nodes: Vec<(u64, u32)> = umis.iter().map(|(&u, &c)| (u, c)).collect();
    nodes.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let n = nodes.len();

    let mut out: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut uni_edges = 0u64;
    let mut bi_edges = 0u64;
    let mut edges = Vec::new();

    if edit_distance > 0 && n > 1 {
        let mut tree: BkTree<u64> = BkTree::new(umi_hamming);
        tree.insert_all(nodes.iter().map(|(u, _)| *u));
        let index_of: FxHashMap<u64, usize> =
            nodes.iter().enumerate().map(|(i, (u, _))| (*u, i)).collect();

        for (i, &(u, cu)) in nodes.iter().enumerate() {
            for (v, _dist) in tree.find(u, edit_distance as isize) {
                if *v == u {
                    continue;
                }
                let j = index_of[v];
                let cv = nodes[j].1;
                let fwd = directional(cu, cv);
                if fwd {
                    out[i].push(j);
                }
                // classify each unordered pair exactly once
                if u < *v {
                    let rev = directional(cv, cu);
                    match (fwd, rev) {
                        (true, true) => bi_edges += 1,
                        (true, false) | (false, true) => uni_edges += 1,
                        (false, false) => continue,
                    }
                    if want_edges {
                        edges.push(UmiEdge { from: u, to: *v, bidirectional: fwd && rev });
                    }
                }
            }
        }
    }

    let mut visited = vec![false; n];
    let mut count = 0u32;
    let mut arbo_lengths = Vec::new();
    let mut stack = Vec::new();
    for root in 0..n {
        if visited[root] {
            continue;
        }
        visited[root] = true;
        let mut frags = nodes[root].1 as u64;
        stack.push(root);
        while let Some(x) = stack.pop() {
            for &y in &out[x] {
                if !visited[y] {
                    visited[y] = true;
                    frags += nodes[y].1 as u64;
                    stack.push(y);
                }
            }
        }
        count += 1;
        arbo_lengths.push(frags.min(u16::MAX as u64) as u16);
    }

    ClassCollapse { count, arbo_lengths, uni_edges, bi_edges, edges }
}

/// Deduplicate a cell's transcript-level classes into gene-level classes.
///
/// Single-gene classes seed `gene_alphas` as the EM warm start and stay in
/// the class list; classes resolving to the same gene-label set merge their
/// counts. Gene ids beyond the index and empty label sets abort the cell.
pub fn dedup_classes(
    groups: &[(&TranscriptGroup, &UmiGroup)],
    tx2gene: &Tx2Gene,
    edit_distance: u32,
    record_arbos: bool,
    record_graph: bool,
) -> Result<DedupOutput, QuantError> {
    let num_genes = tx2gene.num_genes() as usize;
    let mut gene_alphas = vec![0.0; num_genes];

    // merged gene classes: labels -> (count, arborescence histogram)
    let mut merged: BTreeMap<Vec<u32>, (u32, FxHashMap<u16, u32>)> = BTreeMap::new();

    let mut num_vertices = 0u64;
    let mut uni_edges = 0u64;
    let mut bi_edges = 0u64;
    let mut graph_edges = Vec::new();

    for &(group, umis) in groups {
        let collapse = collapse_umis(umis, edit_distance, record_graph);
        num_vertices += umis.len() as u64;
        uni_edges += collapse.uni_edges;
        bi_edges += collapse.bi_edges;
        graph_edges.extend(collapse.edges);
        if collapse.count == 0 {
            continue;
        }

        let mut labels = BTreeSet::new();
        for &tx in &group.0 {
            let gid = tx2gene.gene(tx).ok_or(QuantError::TranscriptOutOfRange {
                tx,
                num_transcripts: tx2gene.num_transcripts(),
            })?;
            if gid >= num_genes as u32 {
                return Err(QuantError::GeneOutOfRange { gid, num_genes: num_genes as u32 });
            }
            labels.insert(gid);
        }
        if labels.is_empty() {
            return Err(QuantError::EmptyLabels);
        }
        let labels: Vec<u32> = labels.into_iter().collect();

        if labels.len() == 1 {
            gene_alphas[labels[0] as usize] += collapse.count as f64;
        }

        let entry = merged.entry(labels).or_insert_with(|| (0, FxHashMap::default()));
        entry.0 += collapse.count;
        if record_arbos {
            for len in collapse.arbo_lengths {
                *entry.1.entry(len).or_insert(0) += 1;
            }
        }
    }

    // tier policy: every gene with evidence is tier 1; a gene whose entire
    // evidence consists of multi-gene classes with a deduplicated count of 1
    // is tier 2 (documented in DESIGN.md, stable per release)
    let mut seen = vec![false; num_genes];
    let mut unique_support = vec![false; num_genes];
    let mut solid_multi = vec![false; num_genes];
    let mut low_multi = vec![false; num_genes];
    for (labels, (count, _)) in &merged {
        for &g in labels {
            let g = g as usize;
            seen[g] = true;
            if labels.len() == 1 {
                unique_support[g] = true;
            } else if *count <= 1 {
                low_multi[g] = true;
            } else {
                solid_multi[g] = true;
            }
        }
    }
    let tiers: Vec<u8> = (0..num_genes)
        .map(|g| {
            if !seen[g] {
                0
            } else if low_multi[g] && !unique_support[g] && !solid_multi[g] {
                2
            } else {
                1
            }
        })
        .collect();

    let mut classes = Vec::with_capacity(merged.len());
    let mut arbo_counts = Vec::new();
    let mut total_count = 0.0;
    for (labels, (count, arbos)) in merged {
        total_count += count as f64;
        classes.push(GeneEqClass { labels, count });
        if record_arbos {
            arbo_counts.push(arbos);
        }
    }

    Ok(DedupOutput {
        classes,
        gene_alphas,
        tiers,
        arbo_counts,
        total_count,
        num_vertices,
        uni_edges,
        bi_edges,
        graph_edges,
    })
}

#[cfg(test)]
mod test {
    use super::{collapse_umis, dedup_classes};
    use crate::eqclass::{TranscriptGroup, Tx2Gene, UmiGroup};
    use crate::error::QuantError;
    use crate::utils::seq_to_int;
    use fxhash::FxHashMap;

    fn umis(pairs: &[(&str, u32)]) -> UmiGroup {
        let mut g = FxHashMap::default();
        for (seq, count) in pairs {
            g.insert(seq_to_int(seq), *count);
        }
        g
    }

    #[test]
    fn test_collapse_one_error_umi() {
        // AAAAAT is one sequencing error away from AAAAAA and under the
        // 2n-1 rule it collapses into it: one molecule, one directed edge
        let g = umis(&[("AAAAAA", 3), ("AAAAAT", 1)]);
        let c = collapse_umis(&g, 1, false);
        assert_eq!(c.count, 1);
        assert_eq!(c.uni_edges, 1);
        assert_eq!(c.bi_edges, 0);
        assert_eq!(c.arbo_lengths, vec![4]);
    }

    #[test]
    fn test_collapse_equal_counts_is_bidirectional() {
        let g = umis(&[("AAAAAA", 1), ("AAAAAT", 1)]);
        let c = collapse_umis(&g, 1, false);
        assert_eq!(c.count, 1);
        assert_eq!(c.uni_edges, 0);
        assert_eq!(c.bi_edges, 1);
    }

    #[test]
    fn test_collapse_rule_blocks_close_counts() {
        // 5 >= 2*4-1 fails in both directions: distance-1 neighbours with
        // comparable counts stay separate molecules
        let g = umis(&[("AAAAAA", 5), ("AAAAAT", 4)]);
        let c = collapse_umis(&g, 1, false);
        assert_eq!(c.count, 2);
        assert_eq!(c.uni_edges, 0);
        assert_eq!(c.bi_edges, 0);
        assert_eq!(c.arbo_lengths, vec![5, 4]);
    }

    #[test]
    fn test_collapse_distance_zero_keeps_distinct_umis() {
        let g = umis(&[("AAAAAA", 3), ("AAAAAT", 1), ("AAAATT", 9)]);
        let c = collapse_umis(&g, 0, false);
        assert_eq!(c.count, 3);
        assert_eq!(c.uni_edges + c.bi_edges, 0);
    }

    #[test]
    fn test_collapse_chain() {
        // 9 -> 4 -> 2: the whole chain folds into the highest-count root
        let g = umis(&[("AAAAAA", 9), ("AAAAAT", 4), ("AAAATT", 2)]);
        let c = collapse_umis(&g, 1, false);
        assert_eq!(c.count, 1);
        assert_eq!(c.arbo_lengths, vec![15]);
    }

    fn t2g(map: &[u32], num_genes: u32) -> Tx2Gene {
        Tx2Gene::new(map.to_vec(), num_genes)
    }

    #[test]
    fn test_dedup_merges_same_gene_set() {
        // two transcript classes, both resolving to gene set {0}
        let t2g = t2g(&[0, 0], 2);
        let g1 = TranscriptGroup::new(vec![0]);
        let g2 = TranscriptGroup::new(vec![0, 1]);
        let u1 = umis(&[("AAAA", 1), ("TTTT", 1)]);
        let u2 = umis(&[("GGGG", 1)]);
        let groups = vec![(&g1, &u1), (&g2, &u2)];

        let out = dedup_classes(&groups, &t2g, 1, false, false).unwrap();
        assert_eq!(out.classes.len(), 1);
        assert_eq!(out.classes[0].labels, vec![0]);
        assert_eq!(out.classes[0].count, 3);
        assert_eq!(out.gene_alphas, vec![3.0, 0.0]);
        assert_eq!(out.total_count, 3.0);
    }

    #[test]
    fn test_dedup_labels_sorted_unique() {
        let t2g = t2g(&[1, 0, 1], 2);
        let g = TranscriptGroup::new(vec![0, 1, 2]);
        let u = umis(&[("AAAA", 2)]);
        let groups = vec![(&g, &u)];

        let out = dedup_classes(&groups, &t2g, 1, false, false).unwrap();
        assert_eq!(out.classes[0].labels, vec![0, 1]);
        // ambiguous class: no warm start
        assert_eq!(out.gene_alphas, vec![0.0, 0.0]);
    }

    #[test]
    fn test_dedup_tiers() {
        // gene 0: unique support; gene 1: shares a solid multi-gene class;
        // gene 2: only a count-1 multi-gene class; gene 3: unseen
        let t2g = t2g(&[0, 1, 2], 4);
        let g01 = TranscriptGroup::new(vec![0, 1]);
        let u01 = umis(&[("AAAA", 1), ("TTTT", 1), ("CCGG", 1)]);
        let g0 = TranscriptGroup::new(vec![0]);
        let u0 = umis(&[("GGGG", 1)]);
        let g12 = TranscriptGroup::new(vec![1, 2]);
        let u12 = umis(&[("CCCC", 1)]);
        let groups = vec![(&g01, &u01), (&g0, &u0), (&g12, &u12)];

        let out = dedup_classes(&groups, &t2g, 1, false, false).unwrap();
        assert_eq!(out.tiers, vec![1, 1, 2, 0]);
    }

    #[test]
    fn test_dedup_gene_out_of_range() {
        let t2g = t2g(&[5], 2);
        let g = TranscriptGroup::new(vec![0]);
        let u = umis(&[("AAAA", 1)]);
        let groups = vec![(&g, &u)];
        match dedup_classes(&groups, &t2g, 1, false, false) {
            Err(QuantError::GeneOutOfRange { gid: 5, .. }) => {}
            other => panic!("expected GeneOutOfRange, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_dedup_arbo_histogram() {
        let t2g = t2g(&[0], 1);
        let g = TranscriptGroup::new(vec![0]);
        // two components: {AAAAAA:3 <- AAAAAT:1} and {TTTTTT:2}
        let u = umis(&[("AAAAAA", 3), ("AAAAAT", 1), ("TTTTTT", 2)]);
        let groups = vec![(&g, &u)];
        let out = dedup_classes(&groups, &t2g, 1, true, false).unwrap();
        assert_eq!(out.classes[0].count, 2);
        let hist = &out.arbo_counts[0];
        assert_eq!(hist.get(&4), Some(&1));
        assert_eq!(hist.get(&2), Some(&1));
    }
}
