//! # cellquant
//!
//! Command line interface for the per-cell quantifier: UMI deduplication
//! over equivalence classes, EM / VBEM disambiguation and bootstrap
//! uncertainty, run in parallel over all cells.
//!
//! # CLI
//! `cellquant -o <outdir> quant --hash <file> --tgmap <file> [options]`
//!
//! Check the CLI help for the full option list.
use anyhow::Context;
use cellquant::dispatch::{self, QuantInputs, QuantOpts};
use cellquant::error::QuantError;
use cellquant::io::{self, HashInput};
use cellquant::prior;
use cellquant::protocol::{Chromium, ChromiumV3, CustomProtocol, DropSeq, Gemcode, Protocol};
use clap::{self, Args, Parser, Subcommand};
use fxhash::FxHashSet;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Path to the output directory
    #[clap(short = 'o', long = "output")]
    output: PathBuf,

    #[clap(subcommand)]
    command: MyCommand,
}

#[allow(non_camel_case_types)]
#[derive(Subcommand)]
enum MyCommand {
    quant(QuantArgs),
}

/// Quantify per-cell gene abundances from a fragment-hash file
#[derive(Args)]
struct QuantArgs {
    /// Fragment-hash file with the per-cell equivalence-class state
    #[clap(long = "hash", short = 'i')]
    hash: PathBuf,

    /// Transcript-to-gene map tsv file
    #[clap(long = "tgmap")]
    tgmap: PathBuf,

    /// Barcode frequency table (barcode<TAB>raw reads)
    #[clap(long = "freq")]
    freq: Option<PathBuf>,

    /// Path to a file with one mito-RNA gene per line
    #[clap(long = "mrna")]
    mrna: Option<PathBuf>,

    /// Path to a file with one ribosomal-RNA gene per line
    #[clap(long = "rrna")]
    rrna: Option<PathBuf>,

    /// Number of threads (one is reserved for dispatch)
    #[clap(long = "threads", short = 'p', default_value_t = 2)]
    threads: usize,

    /// Number of bootstrap replicates per cell (0 disables)
    #[clap(long = "num-bootstraps", default_value_t = 0)]
    num_bootstraps: u32,

    /// Keep and emit every bootstrap replicate
    #[clap(long = "use-all-bootstraps")]
    use_all_bootstraps: bool,

    /// Do not run the EM; emit unique-evidence abundances directly
    #[clap(long = "no-em")]
    no_em: bool,

    /// Deduplicate by distinct UMIs per class, skipping the UMI graph
    #[clap(long = "naive-eqclass")]
    naive_eqclass: bool,

    /// UMI collapse edit distance (0 or 1)
    #[clap(long = "umi-edit-distance", default_value_t = 1)]
    umi_edit_distance: u32,

    /// Use VBEM instead of EM (needs --prior-dir or --init-uniform)
    #[clap(long = "use-vbem")]
    use_vbem: bool,

    /// Uniform abundance initialization instead of the unique-evidence warm start
    #[clap(long = "init-uniform")]
    init_uniform: bool,

    /// Directory holding a prior quantification (quants_mat.csv + rows/cols)
    #[clap(long = "prior-dir")]
    prior_dir: Option<PathBuf>,

    /// VBEM prior value under uniform initialization
    #[clap(long = "vb-prior", default_value_t = 1e-2)]
    vb_prior: f64,

    /// Pseudo-molecule mass the prior matrix is rescaled to
    #[clap(long = "vbem-norm", default_value_t = 1000.0)]
    vbem_norm: f64,

    /// Dump per-cell UMI graphs
    #[clap(long = "dump-umi-graph")]
    dump_umi_graph: bool,

    /// Dump per-cell arborescence histograms
    #[clap(long = "dump-arborescences")]
    dump_arborescences: bool,

    /// Repackage the count matrix in mtx format
    #[clap(long = "dump-mtx")]
    dump_mtx: bool,

    /// Dump per-cell feature rows
    #[clap(long = "dump-features")]
    dump_features: bool,

    /// Dump per-cell equivalence-class count vectors
    #[clap(long = "dump-eq-counts")]
    dump_eq_counts: bool,

    /// Top-level random seed (each cell derives its own stream)
    #[clap(long = "seed", default_value_t = 42)]
    seed: u64,

    /// Suppress the progress bar
    #[clap(long = "quiet")]
    quiet: bool,

    /// Reads follow the DropSeq layout (12+8)
    #[clap(long = "dropseq")]
    dropseq: bool,

    /// Reads follow the 10x Chromium v2 layout (16+10)
    #[clap(long = "chromium")]
    chromium: bool,

    /// Reads follow the 10x Chromium v3 layout (16+12)
    #[clap(long = "chromiumV3")]
    chromium_v3: bool,

    /// Reads follow the 10x GemCode layout (14+10)
    #[clap(long = "gemcode")]
    gemcode: bool,

    /// Barcode length of a custom layout (with --umi-length)
    #[clap(long = "barcode-length")]
    barcode_length: Option<usize>,

    /// UMI length of a custom layout (with --barcode-length)
    #[clap(long = "umi-length")]
    umi_length: Option<usize>,
}

fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        error!("{:#}", e);
        let code = e.downcast_ref::<QuantError>().map_or(1, QuantError::exit_code);
        std::process::exit(code);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        MyCommand::quant(args) => quant(args, &cli.output),
    }
}

fn resolve_protocol(args: &QuantArgs) -> anyhow::Result<Option<Box<dyn Protocol>>> {
    let mut protocols: Vec<Box<dyn Protocol>> = Vec::new();
    if args.dropseq {
        protocols.push(Box::new(DropSeq));
    }
    if args.chromium {
        protocols.push(Box::new(Chromium));
    }
    if args.chromium_v3 {
        protocols.push(Box::new(ChromiumV3));
    }
    if args.gemcode {
        protocols.push(Box::new(Gemcode));
    }
    match (args.barcode_length, args.umi_length) {
        (Some(barcode_length), Some(umi_length)) => {
            protocols.push(Box::new(CustomProtocol { barcode_length, umi_length }));
        }
        (None, None) => {}
        _ => {
            return Err(QuantError::OptionConflict(
                "--barcode-length and --umi-length must be given together".to_string(),
            )
            .into())
        }
    }
    if protocols.len() > 1 {
        return Err(
            QuantError::OptionConflict("more than one protocol selected".to_string()).into(),
        );
    }
    Ok(protocols.pop())
}

fn quant(args: QuantArgs, outdir: &Path) -> anyhow::Result<()> {
    let opts = QuantOpts {
        num_threads: args.threads,
        use_vbem: args.use_vbem,
        init_uniform: args.init_uniform,
        num_bootstraps: args.num_bootstraps,
        use_all_bootstraps: args.use_all_bootstraps,
        no_em: args.no_em,
        naive_eqclass: args.naive_eqclass,
        umi_edit_distance: args.umi_edit_distance,
        dump_umi_graph: args.dump_umi_graph,
        dump_arborescences: args.dump_arborescences,
        dump_mtx: args.dump_mtx,
        dump_features: args.dump_features,
        dump_eq_counts: args.dump_eq_counts,
        vb_prior: args.vb_prior,
        vbem_norm: args.vbem_norm,
        seed: args.seed,
        quiet: args.quiet,
    };
    // fail on option conflicts before any input is loaded
    dispatch::validate_options(&opts, args.init_uniform || args.prior_dir.is_some())?;
    let protocol = resolve_protocol(&args)?;

    let HashInput { transcripts, barcodes, ec_index, umi_count, umi_length } =
        io::read_fragment_hash(&args.hash).context("reading the fragment hash")?;

    if let Some(protocol) = &protocol {
        if protocol.umi_length() != umi_length {
            return Err(QuantError::invalid_input(
                &args.hash,
                format!(
                    "UMI length {} does not match the protocol's {}",
                    umi_length,
                    protocol.umi_length()
                ),
            )
            .into());
        }
        if let Some(bc) = barcodes.first() {
            if protocol.barcode_length() != bc.len() {
                return Err(QuantError::invalid_input(
                    &args.hash,
                    format!(
                        "barcode length {} does not match the protocol's {}",
                        bc.len(),
                        protocol.barcode_length()
                    ),
                )
                .into());
            }
        }
    }

    let (tx2gene, gene_names, gene_idx) =
        io::read_tx2gene(&args.tgmap, &transcripts).context("reading the tgMap")?;

    let freq = match &args.freq {
        Some(path) => Some(io::read_frequency_table(path).context("reading the frequency table")?),
        None => None,
    };

    let read_optional_genes =
        |path: &Option<PathBuf>, what: &str| -> anyhow::Result<FxHashSet<u32>> {
            match path {
                Some(path) if path.exists() => Ok(io::read_gene_list(path, &gene_idx)?),
                Some(path) => {
                    warn!("{} file {} not found; skipping the feature", what, path.display());
                    Ok(FxHashSet::default())
                }
                None => Ok(FxHashSet::default()),
            }
        };
    let mito_genes = read_optional_genes(&args.mrna, "mrna")?;
    let ribo_genes = read_optional_genes(&args.rrna, "rrna")?;

    let priors = if args.use_vbem {
        if args.init_uniform {
            Some(prior::uniform_priors(barcodes.len(), gene_names.len(), args.vb_prior))
        } else {
            match &args.prior_dir {
                Some(dir) => Some(
                    prior::load_priors(dir, &barcodes, &gene_idx, gene_names.len(), args.vbem_norm)
                        .context("reading the VBEM prior")?,
                ),
                // unreachable behind validate_options; kept as a guard
                None => {
                    return Err(QuantError::OptionConflict(
                        "VBEM needs a prior directory or --init-uniform".to_string(),
                    )
                    .into())
                }
            }
        }
    } else {
        None
    };

    let inputs = QuantInputs {
        ec_index,
        tx2gene,
        gene_names,
        barcodes,
        umi_count,
        freq,
        mito_genes,
        ribo_genes,
        priors,
        umi_length,
    };

    let summary = dispatch::optimize(inputs, &opts, outdir)?;
    info!(
        "quantified {} cells ({} skipped, {} failed)",
        summary.quantified_cells, summary.skipped_cells, summary.failed_cells
    );
    Ok(())
}
