//! Input readers: the fragment-hash file carrying the per-cell
//! equivalence-class state, the transcript-to-gene map, gene-name lists and
//! the barcode frequency table.
//!
//! The fragment-hash file is whitespace-tokenised text:
//!
//! ```text
//! T                   number of transcripts
//! B                   number of cell barcodes
//! E                   number of equivalence classes
//! <T transcript names>
//! <B barcode strings>
//! E class records, each:
//!   k tx_1 .. tx_k    transcript ids, 0-based, strictly increasing
//!   m                 number of cells with evidence in this class
//!   m groups:  bc_idx u  then u pairs  umi_seq count
//! ```
//!
//! All UMIs must share one length over {A,C,G,T}; per-cell mapped totals are
//! derived while reading and later re-validated by the workers.

use crate::eqclass::{EcIndex, TranscriptGroup, Tx2Gene};
use crate::error::QuantError;
use crate::utils::seq_to_int;
use fxhash::{FxHashMap, FxHashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tracing::{info, warn};

/// Everything the fragment-hash file provides.
pub struct HashInput {
    /// Transcript names, id order.
    pub transcripts: Vec<String>,
    /// Cell barcodes, id order.
    pub barcodes: Vec<String>,
    /// The global equivalence-class index.
    pub ec_index: EcIndex,
    /// Per-cell mapped-UMI totals.
    pub umi_count: Vec<u64>,
    /// Common UMI length observed in the file.
    pub umi_length: usize,
}

struct Tokens<'a> {
    path: &'a Path,
    iter: std::str::SplitAsciiWhitespace<'a>,
}

impl<'a> Tokens<'a> {
    fn next(&mut self) -> Result<&'a str, QuantError> {
        self.iter
            .next()
            .ok_or_else(|| QuantError::invalid_input(self.path, "unexpected end of file"))
    }

    fn next_usize(&mut self) -> Result<usize, QuantError> {
        let tok = self.next()?;
        tok.parse()
            .map_err(|_| QuantError::invalid_input(self.path, format!("expected a number, got {:?}", tok)))
    }
}

/// Read a fragment-hash file into the global index.
pub fn read_fragment_hash(path: &Path) -> Result<HashInput, QuantError> {
    let mut content = String::new();
    File::open(path)?.read_to_string(&mut content)?;
    let mut toks = Tokens { path, iter: content.split_ascii_whitespace() };

    let num_txps = toks.next_usize()?;
    let num_cells = toks.next_usize()?;
    let num_classes = toks.next_usize()?;

    let mut transcripts = Vec::with_capacity(num_txps);
    for _ in 0..num_txps {
        transcripts.push(toks.next()?.to_string());
    }
    let mut barcodes = Vec::with_capacity(num_cells);
    for _ in 0..num_cells {
        barcodes.push(toks.next()?.to_string());
    }

    let mut ec_index = EcIndex::new();
    let mut umi_count = vec![0u64; num_cells];
    let mut umi_length = 0usize;

    for _ in 0..num_classes {
        let k = toks.next_usize()?;
        if k == 0 {
            return Err(QuantError::invalid_input(path, "class with no transcripts"));
        }
        let mut txps = Vec::with_capacity(k);
        for _ in 0..k {
            let tx = toks.next_usize()?;
            if tx >= num_txps {
                return Err(QuantError::invalid_input(
                    path,
                    format!("transcript id {} out of range", tx),
                ));
            }
            if let Some(&prev) = txps.last() {
                if tx as u32 <= prev {
                    return Err(QuantError::invalid_input(
                        path,
                        "class transcript ids not strictly increasing",
                    ));
                }
            }
            txps.push(tx as u32);
        }
        let group = TranscriptGroup(txps);
        if ec_index.contains(&group) {
            return Err(QuantError::invalid_input(path, "duplicate equivalence-class key"));
        }

        let num_groups = toks.next_usize()?;
        if num_groups == 0 {
            return Err(QuantError::invalid_input(path, "class with no cell evidence"));
        }
        for _ in 0..num_groups {
            let bc = toks.next_usize()?;
            if bc >= num_cells {
                return Err(QuantError::invalid_input(
                    path,
                    format!("barcode index {} out of range", bc),
                ));
            }
            let num_umis = toks.next_usize()?;
            if num_umis == 0 {
                return Err(QuantError::invalid_input(path, "cell group with no UMIs"));
            }
            for _ in 0..num_umis {
                let umi = toks.next()?;
                if !umi.bytes().all(|c| matches!(c, b'A' | b'C' | b'G' | b'T')) {
                    return Err(QuantError::invalid_input(
                        path,
                        format!("UMI {:?} has non-ACGT bases", umi),
                    ));
                }
                if umi.len() > 32 {
                    return Err(QuantError::invalid_input(
                        path,
                        format!("UMI {:?} longer than 32 bases", umi),
                    ));
                }
                if umi_length == 0 {
                    umi_length = umi.len();
                } else if umi.len() != umi_length {
                    return Err(QuantError::invalid_input(
                        path,
                        format!("UMI length {} differs from {}", umi.len(), umi_length),
                    ));
                }
                let count = toks.next_usize()?;
                if count == 0 {
                    return Err(QuantError::invalid_input(path, "UMI with zero count"));
                }
                ec_index.add_umi(group.clone(), bc as u32, seq_to_int(umi), count as u32);
                umi_count[bc] += count as u64;
            }
        }
    }

    info!(
        "read fragment hash: {} transcripts, {} cells, {} classes",
        num_txps, num_cells, num_classes
    );

    Ok(HashInput { transcripts, barcodes, ec_index, umi_count, umi_length })
}

/// Read a `transcript<TAB>gene` map and resolve it against the transcripts
/// of the hash file. Gene ids are assigned by first appearance in the file;
/// `quants_mat_cols.txt` is written in that order.
///
/// Returns the dense map, gene names in id order, and the name-to-id index.
pub fn read_tx2gene(
    path: &Path,
    transcripts: &[String],
) -> Result<(Tx2Gene, Vec<String>, FxHashMap<String, u32>), QuantError> {
    let reader = BufReader::new(File::open(path)?);

    let mut tx_to_gene_name: FxHashMap<String, String> = FxHashMap::default();
    let mut gene_idx: FxHashMap<String, u32> = FxHashMap::default();
    let mut gene_names: Vec<String> = Vec::new();

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (tx, gene) = match (fields.next(), fields.next()) {
            (Some(t), Some(g)) => (t, g),
            _ => {
                return Err(QuantError::invalid_input(
                    path,
                    format!("expected `transcript<TAB>gene`, got {:?}", line),
                ))
            }
        };
        if !gene_idx.contains_key(gene) {
            gene_idx.insert(gene.to_string(), gene_names.len() as u32);
            gene_names.push(gene.to_string());
        }
        tx_to_gene_name.insert(tx.to_string(), gene.to_string());
    }

    let mut map = Vec::with_capacity(transcripts.len());
    for tx in transcripts {
        let gene = tx_to_gene_name.get(tx).ok_or_else(|| {
            QuantError::invalid_input(path, format!("transcript {} not in the map", tx))
        })?;
        map.push(gene_idx[gene]);
    }

    info!("{} genes over {} transcripts", gene_names.len(), transcripts.len());
    Ok((Tx2Gene::new(map, gene_names.len() as u32), gene_names, gene_idx))
}

/// Read a gene-name list (one name per line) into a gene-id set.
/// Names missing from the current index are skipped with one warning.
pub fn read_gene_list(
    path: &Path,
    gene_idx: &FxHashMap<String, u32>,
) -> Result<FxHashSet<u32>, QuantError> {
    let reader = BufReader::new(File::open(path)?);
    let mut genes = FxHashSet::default();
    let mut skipped = 0usize;
    for line in reader.lines() {
        let name = line?;
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        match gene_idx.get(name) {
            Some(&gid) => {
                genes.insert(gid);
            }
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!("{}: {} gene name(s) not in the current index", path.display(), skipped);
    }
    Ok(genes)
}

/// Read the `barcode<TAB>raw_read_count` frequency table.
pub fn read_frequency_table(path: &Path) -> Result<FxHashMap<String, u64>, QuantError> {
    let reader = BufReader::new(File::open(path)?);
    let mut freq = FxHashMap::default();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next().and_then(|c| c.parse::<u64>().ok())) {
            (Some(bc), Some(count)) => {
                freq.insert(bc.to_string(), count);
            }
            _ => {
                return Err(QuantError::invalid_input(
                    path,
                    format!("expected `barcode<TAB>count`, got {:?}", line),
                ))
            }
        }
    }
    Ok(freq)
}

#[cfg(test)]
mod test {
    use super::{read_fragment_hash, read_tx2gene};
    use std::io::Write;

    fn write_tmp(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_read_fragment_hash() {
        // two transcripts, two cells, two classes
        let f = write_tmp(
            "2\n2\n2\n\
             tA\ntB\n\
             CELL1\nCELL2\n\
             1 0 1 0 2 AAAA 3 AAAT 1\n\
             2 0 1 1 1 1 TTTT 2\n",
        );
        let input = read_fragment_hash(f.path()).unwrap();
        assert_eq!(input.transcripts, vec!["tA", "tB"]);
        assert_eq!(input.barcodes, vec!["CELL1", "CELL2"]);
        assert_eq!(input.umi_count, vec![4, 2]);
        assert_eq!(input.umi_length, 4);
        assert_eq!(input.ec_index.num_classes(), 2);
    }

    #[test]
    fn test_read_fragment_hash_rejects_bad_umi() {
        let f = write_tmp("1\n1\n1\ntA\nCELL1\n1 0 1 0 1 ANAA 1\n");
        assert!(read_fragment_hash(f.path()).is_err());
    }

    #[test]
    fn test_read_fragment_hash_rejects_mixed_umi_lengths() {
        let f = write_tmp("1\n1\n1\ntA\nCELL1\n1 0 1 0 2 AAAA 1 AAAAA 1\n");
        assert!(read_fragment_hash(f.path()).is_err());
    }

    #[test]
    fn test_read_tx2gene() {
        let f = write_tmp("tA\tG1\ntB\tG2\ntC\tG1\n");
        let transcripts = vec!["tA".to_string(), "tB".to_string(), "tC".to_string()];
        let (t2g, names, idx) = read_tx2gene(f.path(), &transcripts).unwrap();
        assert_eq!(names, vec!["G1", "G2"]);
        assert_eq!(t2g.gene(0), Some(0));
        assert_eq!(t2g.gene(1), Some(1));
        assert_eq!(t2g.gene(2), Some(0));
        assert_eq!(idx["G2"], 1);

        // a transcript the map does not know is an input error
        let transcripts = vec!["tA".to_string(), "tX".to_string()];
        assert!(read_tx2gene(f.path(), &transcripts).is_err());
    }
}
