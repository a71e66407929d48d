//! The per-cell worker: pulls one cell's slice out of the global index,
//! validates it, runs deduplication, EM and the bootstrap, assembles the
//! feature row and hands everything to the writer.

use crate::bootstrap::run_bootstraps;
use crate::dedup::{dedup_classes, DedupOutput, UmiEdge};
use crate::dispatch::QuantOpts;
use crate::em::run_per_cell_em;
use crate::eqclass::{EcIndex, GeneEqClass, TranscriptGroup, Tx2Gene, UmiGroup};
use crate::error::QuantError;
use crate::prior::CellPriors;
use crate::utils::int_to_seq;
use crate::writer::{BootstrapRow, CellRow, CellWriter};
use fxhash::{FxHashMap, FxHashSet};
use itertools::Itertools;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use tracing::warn;

/// Read-only state shared by every worker.
pub struct CellContext<'a> {
    /// The global equivalence-class index.
    pub ec_index: &'a EcIndex,
    /// Class keys in walk order (singletons first).
    pub ordered_keys: &'a [TranscriptGroup],
    /// Dense transcript-to-gene map.
    pub tx2gene: &'a Tx2Gene,
    /// Cell barcodes, index order.
    pub barcodes: &'a [String],
    /// Expected mapped-UMI total per cell.
    pub umi_count: &'a [u64],
    /// Raw-read counts per barcode, when a frequency table was given.
    pub freq: Option<&'a FxHashMap<String, u64>>,
    /// Per-cell VBEM priors, when VBEM is selected.
    pub priors: Option<&'a CellPriors>,
    /// Mitochondrial gene ids.
    pub mito_genes: &'a FxHashSet<u32>,
    /// Ribosomal gene ids.
    pub ribo_genes: &'a FxHashSet<u32>,
    /// Quantification options.
    pub opts: &'a QuantOpts,
    /// UMI length, for decoding sequences in dumps.
    pub umi_length: usize,
}

/// What became of one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellStatus {
    /// The cell contributed to every aggregate and (outside the naive
    /// path) emitted an abundance row.
    Quantified,
    /// No mapped UMIs; nothing was emitted.
    Inactive,
    /// The optimisation collapsed numerically; nothing was emitted.
    Failed,
}

/// Per-cell contributions to the global aggregates.
#[derive(Debug, Clone, Copy)]
pub struct CellResult {
    /// Outcome of the cell.
    pub status: CellStatus,
    /// Deduplicated molecule total (post-EM when EM ran).
    pub dedup_count: f64,
    /// Number of genes with positive abundance.
    pub expressed_genes: u64,
    /// Unidirectional UMI-graph edges seen for this cell.
    pub uni_edges: u64,
    /// Bidirectional UMI-graph edges seen for this cell.
    pub bi_edges: u64,
}

impl CellResult {
    fn inactive() -> Self {
        CellResult {
            status: CellStatus::Inactive,
            dedup_count: 0.0,
            expressed_genes: 0,
            uni_edges: 0,
            bi_edges: 0,
        }
    }

    fn failed(uni_edges: u64, bi_edges: u64) -> Self {
        CellResult { status: CellStatus::Failed, dedup_count: 0.0, expressed_genes: 0, uni_edges, bi_edges }
    }
}

/// Quantify one cell and emit its rows.
///
/// Numerical collapse is survivable and reported through
/// [`CellStatus::Failed`]; every other error aborts dispatch.
pub fn process_cell(
    ctx: &CellContext,
    cell_idx: usize,
    writer: &CellWriter,
) -> Result<CellResult, QuantError> {
    if ctx.umi_count[cell_idx] == 0 {
        return Ok(CellResult::inactive());
    }
    let barcode = &ctx.barcodes[cell_idx];
    let opts = ctx.opts;

    // pull this cell's slice of the index; a missing key is a bug upstream
    let mut groups: Vec<(&TranscriptGroup, &UmiGroup)> = Vec::new();
    let mut eq_counts: Vec<(u32, u32)> = Vec::new();
    let mut observed: u64 = 0;
    for (pos, key) in ctx.ordered_keys.iter().enumerate() {
        let cells = ctx.ec_index.lookup(key).ok_or(QuantError::MissingEcKey)?;
        if let Some(umis) = cells.get(&(cell_idx as u32)) {
            let frags: u64 = umis.values().map(|&c| c as u64).sum();
            observed += frags;
            groups.push((key, umis));
            if opts.dump_eq_counts {
                eq_counts.push((pos as u32, frags as u32));
            }
        }
    }
    if observed != ctx.umi_count[cell_idx] {
        return Err(QuantError::FragmentCountMismatch {
            barcode: barcode.clone(),
            observed,
            expected: ctx.umi_count[cell_idx],
        });
    }

    if opts.naive_eqclass {
        // distinct-UMI cardinality per class, nothing else
        let mut total = 0.0;
        for (i, (_key, umis)) in groups.iter().enumerate() {
            total += umis.len() as f64;
            if opts.dump_eq_counts {
                eq_counts[i].1 = umis.len() as u32;
            }
        }
        if opts.dump_eq_counts {
            writer.write_eq_counts(cell_idx as u32, &eq_counts)?;
        }
        return Ok(CellResult {
            status: CellStatus::Quantified,
            dedup_count: total,
            expressed_genes: 0,
            uni_edges: 0,
            bi_edges: 0,
        });
    }

    let mut rng = StdRng::seed_from_u64(opts.seed ^ cell_idx as u64);

    let DedupOutput {
        classes,
        gene_alphas,
        tiers,
        arbo_counts,
        total_count,
        num_vertices,
        uni_edges,
        bi_edges,
        graph_edges,
    } = dedup_classes(
        &groups,
        ctx.tx2gene,
        opts.umi_edit_distance,
        opts.dump_arborescences,
        opts.dump_umi_graph,
    )?;
    let mut classes = classes;
    let mut alphas = gene_alphas;
    let mut total_count = total_count;

    if !opts.no_em {
        let prior_vec: Option<Vec<f64>> = match (opts.use_vbem, ctx.priors) {
            (false, _) => None,
            (true, Some(priors)) => {
                let mut v = priors.matrix[cell_idx].clone();
                if !opts.init_uniform {
                    // down-weigh priors for tier-2 estimates
                    for (j, &tier) in tiers.iter().enumerate() {
                        if tier == 2 {
                            v[j] = priors.prior_weight * 1e-2;
                        }
                    }
                }
                Some(v)
            }
            (true, None) => {
                return Err(QuantError::OptionConflict(
                    "VBEM selected but no priors were loaded".to_string(),
                ))
            }
        };
        match run_per_cell_em(&mut alphas, prior_vec.as_deref(), &classes, opts.init_uniform) {
            Ok(total) => total_count = total,
            Err(QuantError::AlphaCollapse) => {
                warn!("cell {}: abundance sum collapsed, marking failed", barcode);
                return Ok(CellResult::failed(uni_edges, bi_edges));
            }
            Err(e) => return Err(e),
        }
    }

    let expressed_genes = alphas.iter().filter(|a| **a > 0.0).count() as u64;

    let arbo_block = if opts.dump_arborescences {
        Some(build_arbo_block(barcode, &classes, &arbo_counts, &alphas, &mut rng)?)
    } else {
        None
    };
    let features = if opts.dump_features {
        Some(build_features(ctx, cell_idx, barcode, &alphas)?)
    } else {
        None
    };
    let graph_block = if opts.dump_umi_graph {
        Some(build_graph_block(barcode, num_vertices, &graph_edges, ctx.umi_length))
    } else {
        None
    };

    // the bootstrap runs before emission so the whole cell lands in one
    // critical section, preserving the features/abundance/bootstrap order
    let boot = if opts.num_bootstraps > 0 {
        let mut boot_alphas = alphas.clone();
        match run_bootstraps(
            &mut boot_alphas,
            &mut classes,
            opts.num_bootstraps,
            opts.use_all_bootstraps,
            opts.init_uniform,
            &mut rng,
        ) {
            Ok(est) => {
                if opts.use_all_bootstraps && est.replicates.len() != opts.num_bootstraps as usize {
                    return Err(QuantError::ReplicateCountMismatch {
                        barcode: barcode.clone(),
                        observed: est.replicates.len(),
                        expected: opts.num_bootstraps as usize,
                    });
                }
                Some((boot_alphas, est))
            }
            Err(QuantError::AlphaCollapse) => {
                warn!("cell {}: bootstrap replicate collapsed, marking failed", barcode);
                return Ok(CellResult::failed(uni_edges, bi_edges));
            }
            Err(e) => return Err(e),
        }
    } else {
        None
    };

    writer.write_cell(&CellRow {
        barcode,
        features: features.as_deref(),
        arborescences: arbo_block.as_deref(),
        alphas: &alphas,
        tiers: &tiers,
        bootstrap: boot.as_ref().map(|(mean, est)| BootstrapRow {
            mean,
            variance: &est.variance,
            replicates: &est.replicates,
        }),
        eq_counts: if opts.dump_eq_counts {
            Some((cell_idx as u32, eq_counts.as_slice()))
        } else {
            None
        },
        umi_graph: graph_block.as_deref(),
    })?;

    Ok(CellResult {
        status: CellStatus::Quantified,
        dedup_count: total_count,
        expressed_genes,
        uni_edges,
        bi_edges,
    })
}

/// Assemble the tab-separated feature row (without the leading barcode).
fn build_features(
    ctx: &CellContext,
    cell_idx: usize,
    barcode: &str,
    alphas: &[f64],
) -> Result<String, QuantError> {
    let mut total_umi = 0.0;
    let mut expressed = 0u64;
    let mut max_umi = 0.0f64;
    for &a in alphas {
        if a > 0.0 {
            total_umi += a;
            expressed += 1;
            if a > max_umi {
                max_umi = a;
            }
        }
    }
    let mean_umi = if expressed > 0 { total_umi / expressed as f64 } else { 0.0 };
    let mean_by_max = if max_umi > 0.0 { mean_umi / max_umi } else { 0.0 };

    let mut genes_over_mean = 0u32;
    let mut mito_count = 0.0;
    let mut ribo_count = 0.0;
    for (j, &a) in alphas.iter().enumerate() {
        if a > mean_umi {
            genes_over_mean += 1;
        }
        if ctx.mito_genes.contains(&(j as u32)) {
            mito_count += a;
        }
        if ctx.ribo_genes.contains(&(j as u32)) {
            ribo_count += a;
        }
    }

    let num_mapped = ctx.umi_count[cell_idx];
    let num_raw = match ctx.freq {
        Some(table) => *table
            .get(barcode)
            .ok_or_else(|| QuantError::MissingFrequency(barcode.to_string()))?,
        None => num_mapped,
    };
    let mapping_rate = if num_raw > 0 { num_mapped as f64 / num_raw as f64 } else { 0.0 };
    let dedup_rate = if num_mapped > 0 { 1.0 - total_umi / num_mapped as f64 } else { 0.0 };

    let mut line = format!(
        "{}\t{}\t{}\t{:.6}\t{:.6}\t{:.6}\t{:.6}\t{}",
        num_raw, num_mapped, total_umi, mapping_rate, dedup_rate, mean_umi, mean_by_max,
        genes_over_mean
    );
    if !ctx.mito_genes.is_empty() {
        let frac = if total_umi > 0.0 { mito_count / total_umi } else { 0.0 };
        line.push_str(&format!("\t{:.6}", frac));
    }
    if !ctx.ribo_genes.is_empty() {
        let frac = if total_umi > 0.0 { ribo_count / total_umi } else { 0.0 };
        line.push_str(&format!("\t{:.6}", frac));
    }
    Ok(line)
}

/// Assemble the per-cell arborescence block. Ambiguous classes allocate
/// each molecule to a gene by drawing from the abundance-weighted
/// distribution over the class labels.
fn build_arbo_block(
    barcode: &str,
    classes: &[GeneEqClass],
    arbo_counts: &[FxHashMap<u16, u32>],
    alphas: &[f64],
    rng: &mut StdRng,
) -> Result<String, QuantError> {
    let mut gene_hists: Vec<BTreeMap<u16, u32>> = vec![BTreeMap::new(); alphas.len()];
    let mut total_cell_frags: u64 = 0;

    for (class, hist) in classes.iter().zip(arbo_counts) {
        let items: Vec<(u16, u32)> = hist.iter().map(|(&l, &c)| (l, c)).sorted().collect();

        if class.labels.len() == 1 {
            let gid = class.labels[0] as usize;
            for (len, count) in items {
                *gene_hists[gid].entry(len).or_insert(0) += count;
                total_cell_frags += len as u64 * count as u64;
            }
        } else {
            let mut lengths = Vec::with_capacity(items.len());
            let mut counts: Vec<u64> = Vec::with_capacity(items.len());
            let mut total_umis = 0u64;
            for (len, count) in items {
                lengths.push(len);
                counts.push(count as u64);
                total_umis += count as u64;
                total_cell_frags += len as u64 * count as u64;
            }
            if total_umis == 0 {
                continue;
            }

            let probs: Vec<f64> = class.labels.iter().map(|&g| alphas[g as usize]).collect();
            let gene_dist =
                if probs.iter().sum::<f64>() > 0.0 { WeightedIndex::new(&probs).ok() } else { None };
            let arbo_dist = WeightedIndex::new(&counts).map_err(|_| QuantError::AlphaCollapse)?;

            for _ in 0..total_umis {
                let gid = match &gene_dist {
                    Some(dist) => class.labels[dist.sample(rng)],
                    // all labels at zero abundance: fall back to uniform
                    None => class.labels[rng.gen_range(0..class.labels.len())],
                };
                let len = lengths[arbo_dist.sample(rng)];
                *gene_hists[gid as usize].entry(len).or_insert(0) += 1;
            }
        }
    }

    let mut gene_lines = String::new();
    let mut num_exp_genes = 0usize;
    for (gid, hist) in gene_hists.iter().enumerate() {
        if hist.is_empty() {
            continue;
        }
        num_exp_genes += 1;
        gene_lines.push_str(&format!("{}\t{}", gid, hist.len()));
        for (len, count) in hist {
            gene_lines.push_str(&format!("\t{}\t{}", len, count));
        }
        gene_lines.push('\n');
    }

    Ok(format!("{}\t{}\t{}\n{}", barcode, num_exp_genes, total_cell_frags, gene_lines))
}

fn build_graph_block(barcode: &str, num_vertices: u64, edges: &[UmiEdge], umi_length: usize) -> String {
    let mut block = format!("{}\t{}\t{}\n", barcode, num_vertices, edges.len());
    for edge in edges {
        block.push_str(&format!(
            "{}\t{}\t{}\n",
            int_to_seq(edge.from, umi_length),
            int_to_seq(edge.to, umi_length),
            if edge.bidirectional { "bi" } else { "uni" }
        ));
    }
    block
}

#[cfg(test)]
mod test {
    use super::{process_cell, CellContext, CellStatus};
    use crate::dispatch::QuantOpts;
    use crate::eqclass::{EcIndex, TranscriptGroup, Tx2Gene};
    use crate::error::QuantError;
    use crate::utils::seq_to_int;
    use crate::writer::{read_sparse_matrix, CellWriter, SinkConfig, QUANTS_MAT};
    use fxhash::FxHashSet;

    fn two_gene_index() -> (EcIndex, Tx2Gene, Vec<String>, Vec<u64>) {
        // cell 0: {tx0}=gene A with 3 well-separated UMIs, {tx1}=gene B with 1
        // cell 1: no evidence at all
        let mut idx = EcIndex::new();
        let ga = TranscriptGroup::new(vec![0]);
        for umi in ["AACC", "GGTT", "CCAA"] {
            idx.add_umi(ga.clone(), 0, seq_to_int(umi), 1);
        }
        idx.add_umi(TranscriptGroup::new(vec![1]), 0, seq_to_int("TTGG"), 2);
        let tx2gene = Tx2Gene::new(vec![0, 1], 2);
        let barcodes = vec!["CELLA".to_string(), "CELLB".to_string()];
        let umi_count = vec![5, 0];
        (idx, tx2gene, barcodes, umi_count)
    }

    fn context<'a>(
        idx: &'a EcIndex,
        keys: &'a [TranscriptGroup],
        tx2gene: &'a Tx2Gene,
        barcodes: &'a [String],
        umi_count: &'a [u64],
        opts: &'a QuantOpts,
        empty: &'a FxHashSet<u32>,
    ) -> CellContext<'a> {
        CellContext {
            ec_index: idx,
            ordered_keys: keys,
            tx2gene,
            barcodes,
            umi_count,
            freq: None,
            priors: None,
            mito_genes: empty,
            ribo_genes: empty,
            opts,
            umi_length: 4,
        }
    }

    #[test]
    fn test_inactive_cell_emits_nothing() {
        let (idx, tx2gene, barcodes, umi_count) = two_gene_index();
        let keys = idx.ordered_keys();
        let opts = QuantOpts::default();
        let empty = FxHashSet::default();
        let ctx = context(&idx, &keys, &tx2gene, &barcodes, &umi_count, &opts, &empty);

        let dir = tempfile::tempdir().unwrap();
        let writer = CellWriter::new(dir.path(), &SinkConfig::default()).unwrap();
        let result = process_cell(&ctx, 1, &writer).unwrap();
        assert_eq!(result.status, CellStatus::Inactive);
        writer.close_all().unwrap();

        let rows = read_sparse_matrix(&dir.path().join(QUANTS_MAT), 0, 2).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_quantified_cell_row() {
        let (idx, tx2gene, barcodes, umi_count) = two_gene_index();
        let keys = idx.ordered_keys();
        let opts = QuantOpts::default();
        let empty = FxHashSet::default();
        let ctx = context(&idx, &keys, &tx2gene, &barcodes, &umi_count, &opts, &empty);

        let dir = tempfile::tempdir().unwrap();
        let writer = CellWriter::new(dir.path(), &SinkConfig::default()).unwrap();
        let result = process_cell(&ctx, 0, &writer).unwrap();
        writer.close_all().unwrap();

        assert_eq!(result.status, CellStatus::Quantified);
        // UMIs are pairwise distance >= 2, nothing collapses: 3 + 1 molecules
        assert!((result.dedup_count - 4.0).abs() < 1e-6);
        assert_eq!(result.expressed_genes, 2);
        assert_eq!(result.uni_edges + result.bi_edges, 0);

        let rows = read_sparse_matrix(&dir.path().join(QUANTS_MAT), 1, 2).unwrap();
        assert_eq!(rows[0].len(), 2);
        assert!((rows[0][0].1 - 3.0).abs() < 1e-4);
        assert!((rows[0][1].1 - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_fragment_mismatch_is_fatal() {
        let (idx, tx2gene, barcodes, _) = two_gene_index();
        let keys = idx.ordered_keys();
        let opts = QuantOpts::default();
        let empty = FxHashSet::default();
        let umi_count = vec![99, 0];
        let ctx = context(&idx, &keys, &tx2gene, &barcodes, &umi_count, &opts, &empty);

        let dir = tempfile::tempdir().unwrap();
        let writer = CellWriter::new(dir.path(), &SinkConfig::default()).unwrap();
        match process_cell(&ctx, 0, &writer) {
            Err(QuantError::FragmentCountMismatch { observed: 5, expected: 99, .. }) => {}
            other => panic!("expected FragmentCountMismatch, got {:?}", other.map(|r| r.status)),
        }
    }

    #[test]
    fn test_naive_path_counts_distinct_umis() {
        let (idx, tx2gene, barcodes, umi_count) = two_gene_index();
        let keys = idx.ordered_keys();
        let opts = QuantOpts { naive_eqclass: true, ..QuantOpts::default() };
        let empty = FxHashSet::default();
        let ctx = context(&idx, &keys, &tx2gene, &barcodes, &umi_count, &opts, &empty);

        let dir = tempfile::tempdir().unwrap();
        let writer = CellWriter::new(dir.path(), &SinkConfig::default()).unwrap();
        let result = process_cell(&ctx, 0, &writer).unwrap();
        writer.close_all().unwrap();

        assert_eq!(result.status, CellStatus::Quantified);
        assert!((result.dedup_count - 4.0).abs() < 1e-9);
        // the naive path writes no abundance rows
        let rows = read_sparse_matrix(&dir.path().join(QUANTS_MAT), 0, 2).unwrap();
        assert!(rows.is_empty());
    }
}
