//! Dispatch: fans the cell list out over worker threads via a shared
//! atomic cursor, reduces the per-worker aggregates at join and performs
//! the shutdown bookkeeping (gene-name file, barcode remapping, optional
//! matrix repackaging).

use crate::cell::{process_cell, CellContext, CellStatus};
use crate::eqclass::{EcIndex, Tx2Gene};
use crate::error::QuantError;
use crate::prior::CellPriors;
use crate::utils::get_progressbar;
use crate::writer::{self, CellWriter, SinkConfig};
use fxhash::{FxHashMap, FxHashSet};
use indicatif::ProgressBar;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use tracing::{info, warn};

/// Quantification options, enumerated effects per the CLI help.
#[derive(Debug, Clone)]
pub struct QuantOpts {
    /// Total thread count; `max(1, num_threads - 1)` workers are spawned.
    pub num_threads: usize,
    /// Select VBEM over EM. Needs priors or `init_uniform`.
    pub use_vbem: bool,
    /// Initialise abundances uniformly instead of from unique evidence.
    pub init_uniform: bool,
    /// Number of bootstrap replicates; 0 disables resampling.
    pub num_bootstraps: u32,
    /// Keep and emit every bootstrap replicate.
    pub use_all_bootstraps: bool,
    /// Skip EM and emit the unique-evidence abundances directly.
    pub no_em: bool,
    /// Skip the UMI graph and count distinct UMIs per class.
    pub naive_eqclass: bool,
    /// UMI collapse edit distance, 0 or 1.
    pub umi_edit_distance: u32,
    /// Dump per-cell UMI graphs.
    pub dump_umi_graph: bool,
    /// Dump per-cell arborescence histograms.
    pub dump_arborescences: bool,
    /// Repackage the binary matrix as Matrix-Market after dispatch.
    pub dump_mtx: bool,
    /// Dump the per-cell feature rows.
    pub dump_features: bool,
    /// Dump per-cell equivalence-class count vectors.
    pub dump_eq_counts: bool,
    /// Prior value used under VBEM with uniform initialisation.
    pub vb_prior: f64,
    /// Total pseudo-molecule mass the prior matrix is rescaled to.
    pub vbem_norm: f64,
    /// Top-level seed; cell `i` draws from a PRNG seeded with `seed ^ i`.
    pub seed: u64,
    /// Suppress the progress bar.
    pub quiet: bool,
}

impl Default for QuantOpts {
    fn default() -> Self {
        QuantOpts {
            num_threads: 2,
            use_vbem: false,
            init_uniform: false,
            num_bootstraps: 0,
            use_all_bootstraps: false,
            no_em: false,
            naive_eqclass: false,
            umi_edit_distance: 1,
            dump_umi_graph: false,
            dump_arborescences: false,
            dump_mtx: false,
            dump_features: false,
            dump_eq_counts: false,
            vb_prior: 1e-2,
            vbem_norm: 1000.0,
            seed: 42,
            quiet: false,
        }
    }
}

/// Everything the dispatcher needs, loaded upstream.
pub struct QuantInputs {
    /// The global equivalence-class index; cleared after dispatch.
    pub ec_index: EcIndex,
    /// Dense transcript-to-gene map.
    pub tx2gene: Tx2Gene,
    /// Gene names in column-index order.
    pub gene_names: Vec<String>,
    /// Cell barcodes in index order.
    pub barcodes: Vec<String>,
    /// Per-cell mapped-UMI totals.
    pub umi_count: Vec<u64>,
    /// Optional raw-read counts per barcode.
    pub freq: Option<FxHashMap<String, u64>>,
    /// Mitochondrial gene ids (may be empty).
    pub mito_genes: FxHashSet<u32>,
    /// Ribosomal gene ids (may be empty).
    pub ribo_genes: FxHashSet<u32>,
    /// Per-cell VBEM priors, when VBEM is selected.
    pub priors: Option<CellPriors>,
    /// Common UMI length.
    pub umi_length: usize,
}

/// Global totals reported once at shutdown.
#[derive(Debug)]
pub struct QuantSummary {
    /// Sum of deduplicated molecule counts over all cells.
    pub total_dedup_counts: f64,
    /// Sum of expressed-gene counts over all cells.
    pub total_expressed_genes: u64,
    /// Unidirectional UMI-graph edges over all cells.
    pub uni_edges: u64,
    /// Bidirectional UMI-graph edges over all cells.
    pub bi_edges: u64,
    /// Cells skipped for having no mapped UMIs.
    pub skipped_cells: u64,
    /// Cells that failed numerically.
    pub failed_cells: u64,
    /// Cells that emitted a quantification row.
    pub quantified_cells: usize,
    /// Barcodes remaining after inactive and failed cells are dropped,
    /// input order.
    pub retained_barcodes: Vec<String>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Aggregates {
    total_dedup: f64,
    expressed: u64,
    uni_edges: u64,
    bi_edges: u64,
}

impl Aggregates {
    fn add(&mut self, result: &crate::cell::CellResult) {
        self.total_dedup += result.dedup_count;
        self.expressed += result.expressed_genes;
        self.uni_edges += result.uni_edges;
        self.bi_edges += result.bi_edges;
    }

    fn merge(&mut self, other: &Aggregates) {
        self.total_dedup += other.total_dedup;
        self.expressed += other.expressed;
        self.uni_edges += other.uni_edges;
        self.bi_edges += other.bi_edges;
    }
}

/// Reject option combinations the pipeline cannot honour.
pub fn validate_options(opts: &QuantOpts, has_priors: bool) -> Result<(), QuantError> {
    if opts.umi_edit_distance > 1 {
        return Err(QuantError::OptionConflict(
            "UMI edit distance must be 0 or 1".to_string(),
        ));
    }
    if opts.num_bootstraps > 0 && opts.no_em {
        return Err(QuantError::OptionConflict(
            "bootstrapping needs the EM; drop one of the two options".to_string(),
        ));
    }
    if opts.use_vbem && !opts.init_uniform && !has_priors {
        return Err(QuantError::OptionConflict(
            "VBEM needs a prior directory or uniform initialization".to_string(),
        ));
    }
    Ok(())
}

type WorkerOutcome = Result<(Aggregates, Vec<(usize, CellStatus)>), QuantError>;

/// Quantify every cell and write all outputs under `outdir`.
pub fn optimize(
    mut inputs: QuantInputs,
    opts: &QuantOpts,
    outdir: &Path,
) -> Result<QuantSummary, QuantError> {
    validate_options(opts, inputs.priors.is_some())?;
    let num_cells = inputs.barcodes.len();
    let num_genes = inputs.tx2gene.num_genes() as usize;

    if opts.no_em {
        warn!("not performing EM; ambiguous molecules will be discarded");
    }
    if opts.init_uniform {
        info!(
            "using uniform initialization for {}",
            if opts.use_vbem { "VBEM" } else { "EM" }
        );
    }

    let ordered_keys = inputs.ec_index.ordered_keys();
    let writer = CellWriter::new(
        outdir,
        &SinkConfig {
            features: opts.dump_features,
            bootstraps: opts.num_bootstraps > 0,
            arborescences: opts.dump_arborescences,
            eq_counts: opts.dump_eq_counts,
            umi_graphs: opts.dump_umi_graph,
        },
    )?;

    let ctx = CellContext {
        ec_index: &inputs.ec_index,
        ordered_keys: &ordered_keys,
        tx2gene: &inputs.tx2gene,
        barcodes: &inputs.barcodes,
        umi_count: &inputs.umi_count,
        freq: inputs.freq.as_ref(),
        priors: inputs.priors.as_ref(),
        mito_genes: &inputs.mito_genes,
        ribo_genes: &inputs.ribo_genes,
        opts,
        umi_length: inputs.umi_length,
    };

    let num_workers = opts.num_threads.saturating_sub(1).max(1);
    let cursor = AtomicUsize::new(0);
    let abort = AtomicBool::new(false);
    let bar = if opts.quiet { ProgressBar::hidden() } else { get_progressbar(num_cells as u64) };
    info!("dispatching {} cells over {} worker thread(s)", num_cells, num_workers);

    let worker_outcomes: Vec<WorkerOutcome> = thread::scope(|s| {
        let mut handles = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            handles.push(s.spawn(|| {
                let mut agg = Aggregates::default();
                let mut statuses = Vec::new();
                loop {
                    if abort.load(Ordering::Relaxed) {
                        break;
                    }
                    let idx = cursor.fetch_add(1, Ordering::Relaxed);
                    if idx >= num_cells {
                        break;
                    }
                    match process_cell(&ctx, idx, &writer) {
                        Ok(result) => {
                            agg.add(&result);
                            statuses.push((idx, result.status));
                            bar.inc(1);
                        }
                        Err(e) => {
                            abort.store(true, Ordering::Relaxed);
                            return Err(e);
                        }
                    }
                }
                Ok((agg, statuses))
            }));
        }
        handles
            .into_iter()
            .map(|handle| handle.join().expect("worker thread panicked"))
            .collect()
    });
    bar.finish_and_clear();

    let mut agg = Aggregates::default();
    let mut statuses = vec![CellStatus::Inactive; num_cells];
    for outcome in worker_outcomes {
        let (worker_agg, worker_statuses) = outcome?;
        agg.merge(&worker_agg);
        for (idx, status) in worker_statuses {
            statuses[idx] = status;
        }
    }

    info!("Total {:.2} UMIs after deduplication", agg.total_dedup);
    info!("Total {} BiDirected edges", agg.bi_edges);
    info!("Total {} UniDirected edges", agg.uni_edges);

    let skipped_cells = statuses.iter().filter(|s| **s == CellStatus::Inactive).count() as u64;
    let failed_cells = statuses.iter().filter(|s| **s == CellStatus::Failed).count() as u64;
    if skipped_cells > 0 {
        warn!("Skipped {} barcodes due to no mapped read", skipped_cells);
    }
    if failed_cells > 0 {
        warn!("{} cell(s) failed numerically and were dropped", failed_cells);
    }

    writer.close_all()?;

    info!("clearing the equivalence-class index");
    inputs.ec_index.clear();

    let mut cols = BufWriter::new(File::create(outdir.join(writer::QUANTS_COLS))?);
    for name in &inputs.gene_names {
        writeln!(cols, "{}", name)?;
    }
    cols.flush()?;

    let retained_barcodes: Vec<String> = inputs
        .barcodes
        .iter()
        .zip(&statuses)
        .filter(|(_, s)| **s == CellStatus::Quantified)
        .map(|(b, _)| b.clone())
        .collect();
    let quantified_cells = retained_barcodes.len();

    if opts.dump_mtx {
        if opts.naive_eqclass {
            warn!("naive deduplication writes no abundance matrix; skipping the mtx dump");
        } else {
            writer::dump_mtx(outdir, quantified_cells, num_genes, agg.expressed)?;
        }
    }

    Ok(QuantSummary {
        total_dedup_counts: agg.total_dedup,
        total_expressed_genes: agg.expressed,
        uni_edges: agg.uni_edges,
        bi_edges: agg.bi_edges,
        skipped_cells,
        failed_cells,
        quantified_cells,
        retained_barcodes,
    })
}
