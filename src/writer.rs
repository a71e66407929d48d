//! Compressed output sinks for per-cell quantification rows.
//!
//! The binary abundance schema per cell is a flag bitmap over all genes
//! (`ceil(G / 8)` bytes, MSB-first within each byte, bit `i` of byte `j`
//! marking gene `8 j + i`) followed by one little-endian `f32` per set bit.
//! The tier companion uses the same bitmap over `tier > 0` with one `u8`
//! per set bit.
//!
//! One mutex guards the whole sink set, so a cell's rows land contiguously
//! and in the order features, abundance, bootstrap. Across cells the files
//! share one completion order, recorded in `quants_mat_rows.txt`.

use crate::error::QuantError;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};

/// Binary abundance matrix.
pub const QUANTS_MAT: &str = "quants_mat.gz";
/// Binary tier matrix.
pub const QUANTS_TIER_MAT: &str = "quants_tier_mat.gz";
/// Barcodes in completion order.
pub const QUANTS_ROWS: &str = "quants_mat_rows.txt";
/// Gene names in column order.
pub const QUANTS_COLS: &str = "quants_mat_cols.txt";
/// Per-cell feature rows.
pub const FEATURE_DUMP: &str = "featureDump.txt";
/// Bootstrap mean/variance (and optional replicate) records.
pub const QUANTS_BOOT_MAT: &str = "quants_boot_mat.gz";
/// Per-cell arborescence length histograms.
pub const ARBO_DUMP: &str = "arborescences.txt.gz";
/// Per-cell raw equivalence-class count vectors.
pub const EQ_DUMP: &str = "cell_eq_counts.txt.gz";
/// Per-cell UMI graph edge lists.
pub const UMI_GRAPH_DUMP: &str = "umi_graphs.txt.gz";
/// Repackaged Matrix-Market matrix.
pub const QUANTS_MTX: &str = "quants_mat.mtx.gz";

/// Which optional sinks to open.
#[derive(Debug, Default, Clone)]
pub struct SinkConfig {
    /// Open the feature dump.
    pub features: bool,
    /// Open the bootstrap matrix.
    pub bootstraps: bool,
    /// Open the arborescence dump.
    pub arborescences: bool,
    /// Open the equivalence-class count dump.
    pub eq_counts: bool,
    /// Open the UMI graph dump.
    pub umi_graphs: bool,
}

type GzSink = GzEncoder<BufWriter<File>>;

struct Streams {
    quants: GzSink,
    tiers: GzSink,
    rows: BufWriter<File>,
    features: Option<BufWriter<File>>,
    bootstraps: Option<GzSink>,
    arborescences: Option<GzSink>,
    eq_counts: Option<GzSink>,
    umi_graphs: Option<GzSink>,
}

/// Bootstrap payload of one cell.
pub struct BootstrapRow<'a> {
    /// Per-gene bootstrap mean.
    pub mean: &'a [f64],
    /// Per-gene bootstrap variance.
    pub variance: &'a [f64],
    /// Raw replicate estimates, possibly empty.
    pub replicates: &'a [Vec<f64>],
}

/// Everything one quantified cell emits.
pub struct CellRow<'a> {
    /// The cell's barcode.
    pub barcode: &'a str,
    /// Feature line, without the leading barcode.
    pub features: Option<&'a str>,
    /// Preformatted arborescence block.
    pub arborescences: Option<&'a str>,
    /// Final abundances.
    pub alphas: &'a [f64],
    /// Per-gene tiers.
    pub tiers: &'a [u8],
    /// Bootstrap results.
    pub bootstrap: Option<BootstrapRow<'a>>,
    /// `(cell index, (class id, count) pairs)` for the eq-count dump.
    pub eq_counts: Option<(u32, &'a [(u32, u32)])>,
    /// Preformatted UMI graph block.
    pub umi_graph: Option<&'a str>,
}

/// The shared, mutex-guarded output writer.
pub struct CellWriter {
    streams: Mutex<Streams>,
}

fn gz_sink(path: &Path) -> Result<GzSink, QuantError> {
    Ok(GzEncoder::new(BufWriter::new(File::create(path)?), Compression::new(6)))
}

/// Serialise non-zero values as the flag bitmap plus `f32` payload.
pub fn sparse_record(values: &[f64]) -> Vec<u8> {
    let num_flags = values.len().div_ceil(8);
    let mut buf = vec![0u8; num_flags];
    let mut payload = Vec::new();
    for (i, &v) in values.iter().enumerate() {
        if v > 0.0 {
            buf[i / 8] |= 128 >> (i % 8);
            payload.extend_from_slice(&(v as f32).to_le_bytes());
        }
    }
    buf.extend_from_slice(&payload);
    buf
}

fn tier_record(tiers: &[u8]) -> Vec<u8> {
    let num_flags = tiers.len().div_ceil(8);
    let mut buf = vec![0u8; num_flags];
    let mut payload = Vec::new();
    for (i, &t) in tiers.iter().enumerate() {
        if t > 0 {
            buf[i / 8] |= 128 >> (i % 8);
            payload.push(t);
        }
    }
    buf.extend_from_slice(&payload);
    buf
}

impl CellWriter {
    /// Open all sinks under `outdir`.
    pub fn new(outdir: &Path, config: &SinkConfig) -> Result<CellWriter, QuantError> {
        std::fs::create_dir_all(outdir)?;
        let open_opt = |on: bool, name: &str| -> Result<Option<GzSink>, QuantError> {
            if on { Ok(Some(gz_sink(&outdir.join(name))?)) } else { Ok(None) }
        };
        let streams = Streams {
            quants: gz_sink(&outdir.join(QUANTS_MAT))?,
            tiers: gz_sink(&outdir.join(QUANTS_TIER_MAT))?,
            rows: BufWriter::new(File::create(outdir.join(QUANTS_ROWS))?),
            features: if config.features {
                Some(BufWriter::new(File::create(outdir.join(FEATURE_DUMP))?))
            } else {
                None
            },
            bootstraps: open_opt(config.bootstraps, QUANTS_BOOT_MAT)?,
            arborescences: open_opt(config.arborescences, ARBO_DUMP)?,
            eq_counts: open_opt(config.eq_counts, EQ_DUMP)?,
            umi_graphs: open_opt(config.umi_graphs, UMI_GRAPH_DUMP)?,
        };
        Ok(CellWriter { streams: Mutex::new(streams) })
    }

    /// Emit one quantified cell. The record buffers are assembled outside
    /// the critical section to keep the lock hold time short.
    pub fn write_cell(&self, row: &CellRow) -> Result<(), QuantError> {
        let quants_buf = sparse_record(row.alphas);
        let tier_buf = tier_record(row.tiers);
        let boot_buf = row.bootstrap.as_ref().map(|b| {
            let mut buf = sparse_record(b.mean);
            buf.extend_from_slice(&sparse_record(b.variance));
            for rep in b.replicates {
                buf.extend_from_slice(&sparse_record(rep));
            }
            buf
        });
        let eq_buf = row.eq_counts.map(|(idx, pairs)| format_eq_counts(idx, pairs));

        let mut streams = self.streams.lock().unwrap();
        if let (Some(sink), Some(features)) = (streams.features.as_mut(), row.features) {
            writeln!(sink, "{}\t{}", row.barcode, features)?;
        }
        writeln!(streams.rows, "{}", row.barcode)?;
        streams.quants.write_all(&quants_buf)?;
        streams.tiers.write_all(&tier_buf)?;
        if let (Some(sink), Some(buf)) = (streams.bootstraps.as_mut(), boot_buf) {
            sink.write_all(&buf)?;
        }
        if let (Some(sink), Some(block)) = (streams.arborescences.as_mut(), row.arborescences) {
            sink.write_all(block.as_bytes())?;
        }
        if let (Some(sink), Some(buf)) = (streams.eq_counts.as_mut(), eq_buf) {
            sink.write_all(buf.as_bytes())?;
        }
        if let (Some(sink), Some(block)) = (streams.umi_graphs.as_mut(), row.umi_graph) {
            sink.write_all(block.as_bytes())?;
        }
        Ok(())
    }

    /// Emit only the equivalence-class count vector (the naive path).
    pub fn write_eq_counts(&self, cell_idx: u32, pairs: &[(u32, u32)]) -> Result<(), QuantError> {
        let buf = format_eq_counts(cell_idx, pairs);
        let mut streams = self.streams.lock().unwrap();
        if let Some(sink) = streams.eq_counts.as_mut() {
            sink.write_all(buf.as_bytes())?;
        }
        Ok(())
    }

    /// Finish every gzip member and flush all sinks.
    pub fn close_all(self) -> Result<(), QuantError> {
        let streams = self.streams.into_inner().unwrap();
        streams.quants.finish()?.flush()?;
        streams.tiers.finish()?.flush()?;
        let mut rows = streams.rows;
        rows.flush()?;
        if let Some(mut sink) = streams.features {
            sink.flush()?;
        }
        for sink in [streams.bootstraps, streams.arborescences, streams.eq_counts, streams.umi_graphs]
            .into_iter()
            .flatten()
        {
            sink.finish()?.flush()?;
        }
        Ok(())
    }
}

fn format_eq_counts(cell_idx: u32, pairs: &[(u32, u32)]) -> String {
    let mut line = format!("{}\t{}", cell_idx, pairs.len());
    for (id, count) in pairs {
        line.push_str(&format!("\t{}:{}", id, count));
    }
    line.push('\n');
    line
}

/// Read the binary abundance matrix back, one sparse row per cell.
pub fn read_sparse_matrix(
    path: &Path,
    num_cells: usize,
    num_genes: usize,
) -> Result<Vec<Vec<(u32, f32)>>, QuantError> {
    let mut reader = MultiGzDecoder::new(BufReader::new(File::open(path)?));
    let num_flags = num_genes.div_ceil(8);
    let mut flags = vec![0u8; num_flags];
    let mut rows = Vec::with_capacity(num_cells);

    for _ in 0..num_cells {
        reader.read_exact(&mut flags)?;
        let mut indices = Vec::new();
        for (j, &flag) in flags.iter().enumerate() {
            for i in 0..8 {
                if flag & (128 >> i) != 0 {
                    indices.push((8 * j + i) as u32);
                }
            }
        }
        let mut payload = vec![0u8; 4 * indices.len()];
        reader.read_exact(&mut payload)?;
        let row = indices
            .into_iter()
            .zip(payload.chunks_exact(4))
            .map(|(gid, bytes)| (gid, f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

/// Repackage the binary matrix as 1-indexed Matrix-Market triplets.
///
/// `num_expressed` is the global expressed-gene aggregate reported in the
/// size header, matching the binary matrix written this run.
pub fn dump_mtx(
    outdir: &Path,
    num_cells: usize,
    num_genes: usize,
    num_expressed: u64,
) -> Result<(), QuantError> {
    info!("repackaging counts into {}", QUANTS_MTX);
    let rows = read_sparse_matrix(&outdir.join(QUANTS_MAT), num_cells, num_genes)?;

    let mut tri = sprs::TriMat::new((num_cells, num_genes));
    let mut zeroed_cells = 0usize;
    for (i, row) in rows.iter().enumerate() {
        let mut cell_total = 0.0f64;
        for &(gid, v) in row {
            tri.add_triplet(i, gid as usize, v);
            cell_total += v as f64;
        }
        if cell_total == 0.0 {
            zeroed_cells += 1;
        } else if cell_total > 1e6 {
            warn!("cell {} has more than 1M counts, possible error", i);
        }
    }
    let csr: sprs::CsMat<f32> = tri.to_csr();

    let mut sink = gz_sink(&outdir.join(QUANTS_MTX))?;
    writeln!(sink, "%%MatrixMarket matrix coordinate real general")?;
    writeln!(sink, "{} {} {}", num_cells, num_genes, num_expressed)?;
    for (value, (i, j)) in csr.iter() {
        writeln!(sink, "{} {} {:.6}", i + 1, j + 1, value)?;
    }
    sink.finish()?.flush()?;

    if zeroed_cells > 0 {
        warn!("found {} cell(s) with 0 counts", zeroed_cells);
    }
    info!("finished dumping counts into mtx");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::{
        dump_mtx, read_sparse_matrix, sparse_record, tier_record, BootstrapRow, CellRow,
        CellWriter, SinkConfig, QUANTS_BOOT_MAT, QUANTS_MAT, QUANTS_MTX, QUANTS_ROWS,
    };
    use flate2::read::MultiGzDecoder;
    use std::io::Read;

    #[test]
    fn test_sparse_record_layout() {
        // 9 genes: gene 1 and gene 8 expressed -> bits 6 and 15 (MSB-first)
        let mut values = vec![0.0; 9];
        values[1] = 1.5;
        values[8] = 2.5;
        let buf = sparse_record(&values);
        assert_eq!(buf[0], 128 >> 1);
        assert_eq!(buf[1], 128);
        assert_eq!(&buf[2..6], &1.5f32.to_le_bytes());
        assert_eq!(&buf[6..10], &2.5f32.to_le_bytes());
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn test_tier_record_layout() {
        let buf = tier_record(&[0, 2, 1]);
        assert_eq!(buf[0], (128 >> 1) | (128 >> 2));
        assert_eq!(&buf[1..], &[2, 1]);
    }

    fn write_two_cells(dir: &std::path::Path, config: &SinkConfig) {
        let writer = CellWriter::new(dir, config).unwrap();
        let alphas1 = vec![10.0, 0.0, 5.5];
        let alphas2 = vec![0.0, 3.25, 0.0];
        writer
            .write_cell(&CellRow {
                barcode: "CELL1",
                features: None,
                arborescences: None,
                alphas: &alphas1,
                tiers: &[1, 0, 2],
                bootstrap: None,
                eq_counts: None,
                umi_graph: None,
            })
            .unwrap();
        writer
            .write_cell(&CellRow {
                barcode: "CELL2",
                features: None,
                arborescences: None,
                alphas: &alphas2,
                tiers: &[0, 1, 0],
                bootstrap: Some(BootstrapRow {
                    mean: &alphas2,
                    variance: &[0.0, 0.5, 0.0],
                    replicates: &[],
                }),
                eq_counts: None,
                umi_graph: None,
            })
            .unwrap();
        writer.close_all().unwrap();
    }

    #[test]
    fn test_roundtrip_abundances() {
        let dir = tempfile::tempdir().unwrap();
        let config = SinkConfig { bootstraps: true, ..Default::default() };
        write_two_cells(dir.path(), &config);

        let rows = read_sparse_matrix(&dir.path().join(QUANTS_MAT), 2, 3).unwrap();
        assert_eq!(rows[0], vec![(0, 10.0), (2, 5.5)]);
        assert_eq!(rows[1], vec![(1, 3.25)]);

        let mut row_names = String::new();
        std::fs::File::open(dir.path().join(QUANTS_ROWS))
            .unwrap()
            .read_to_string(&mut row_names)
            .unwrap();
        assert_eq!(row_names, "CELL1\nCELL2\n");

        // the boot matrix holds mean then variance records per cell
        let boot = read_sparse_matrix(&dir.path().join(QUANTS_BOOT_MAT), 2, 3).unwrap();
        assert_eq!(boot[0], vec![(1, 3.25)]);
        assert_eq!(boot[1], vec![(1, 0.5)]);
    }

    #[test]
    fn test_readback_as_dense_matrix() {
        let dir = tempfile::tempdir().unwrap();
        write_two_cells(dir.path(), &SinkConfig::default());

        let rows = read_sparse_matrix(&dir.path().join(QUANTS_MAT), 2, 3).unwrap();
        let mut tri = sprs::TriMat::new((2, 3));
        for (i, row) in rows.iter().enumerate() {
            for &(gid, v) in row {
                tri.add_triplet(i, gid as usize, v);
            }
        }
        let csr: sprs::CsMat<f32> = tri.to_csr();
        let expected = ndarray::arr2(&[[10.0f32, 0.0, 5.5], [0.0, 3.25, 0.0]]);
        assert_eq!(csr.to_dense(), expected);
    }

    #[test]
    fn test_mtx_dump() {
        let dir = tempfile::tempdir().unwrap();
        write_two_cells(dir.path(), &SinkConfig::default());
        dump_mtx(dir.path(), 2, 3, 3).unwrap();

        let mut content = String::new();
        MultiGzDecoder::new(std::fs::File::open(dir.path().join(QUANTS_MTX)).unwrap())
            .read_to_string(&mut content)
            .unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "%%MatrixMarket matrix coordinate real general");
        assert_eq!(lines[1], "2 3 3");
        assert_eq!(lines[2], "1 1 10.000000");
        assert_eq!(lines[3], "1 3 5.500000");
        assert_eq!(lines[4], "2 2 3.250000");
    }
}
