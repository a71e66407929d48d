//! VBEM prior loading: turns a previously quantified matrix into per-cell
//! Dirichlet prior vectors aligned with the current gene index.
//!
//! The prior directory holds `quants_mat.csv` (cells by genes),
//! `quants_mat_cols.txt` (gene names) and `quants_mat_rows.txt` (cell
//! names). Genes unknown to the current index are dropped; cells without a
//! prior row fall back to a uniform floor.

use crate::error::QuantError;
use fxhash::FxHashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{info, warn};

/// Per-cell prior vectors plus the global weight used to rescale them.
pub struct CellPriors {
    /// One prior vector per current cell, each of gene-index length.
    pub matrix: Vec<Vec<f64>>,
    /// `vbem_norm / total prior molecule count`; tier-2 genes are reset to
    /// `prior_weight * 1e-2` inside the worker.
    pub prior_weight: f64,
}

/// Constant priors for every cell, used under uniform initialisation.
pub fn uniform_priors(num_cells: usize, num_genes: usize, value: f64) -> CellPriors {
    CellPriors {
        matrix: vec![vec![value; num_genes]; num_cells],
        prior_weight: 1.0,
    }
}

fn read_lines(path: &Path) -> Result<Vec<String>, QuantError> {
    let reader = BufReader::new(File::open(path).map_err(|e| {
        QuantError::invalid_input(path, format!("cannot open: {}", e))
    })?);
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            lines.push(line.trim().to_string());
        }
    }
    Ok(lines)
}

/// Load the prior directory and align it with the current cells and genes.
pub fn load_priors(
    dir: &Path,
    barcodes: &[String],
    gene_idx: &FxHashMap<String, u32>,
    num_genes: usize,
    vbem_norm: f64,
) -> Result<CellPriors, QuantError> {
    let cfile = dir.join("quants_mat_rows.txt");
    let gfile = dir.join("quants_mat_cols.txt");
    let mfile = dir.join("quants_mat.csv");

    let cnames = read_lines(&cfile)?;
    info!("prior: {} cell barcodes", cnames.len());

    let gnames = read_lines(&gfile)?;
    let prior_only_genes = gnames.iter().filter(|g| !gene_idx.contains_key(*g)).count();
    if prior_only_genes > 0 {
        warn!("prior has {} gene(s) not in the current index", prior_only_genes);
    }
    info!("prior: {} gene names", gnames.len());

    let mut prior_rows: Vec<Vec<f64>> = Vec::with_capacity(cnames.len());
    let mut prior_mol_counts = 0.0;
    let reader = BufReader::new(File::open(&mfile).map_err(|e| {
        QuantError::invalid_input(&mfile, format!("cannot open: {}", e))
    })?);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let mut row = Vec::with_capacity(gnames.len());
        for field in line.split(',') {
            let count: f64 = field.trim().parse().map_err(|_| {
                QuantError::invalid_input(&mfile, format!("non-numeric field {:?}", field))
            })?;
            prior_mol_counts += count;
            row.push(count);
        }
        if row.len() != gnames.len() {
            return Err(QuantError::invalid_input(
                &mfile,
                format!("row with {} fields, expected {}", row.len(), gnames.len()),
            ));
        }
        prior_rows.push(row);
    }
    if prior_rows.len() != cnames.len() {
        return Err(QuantError::invalid_input(
            &mfile,
            format!("{} rows for {} cell names", prior_rows.len(), cnames.len()),
        ));
    }
    if prior_mol_counts <= 0.0 {
        return Err(QuantError::invalid_input(&mfile, "prior matrix sums to zero"));
    }

    let prior_weight = vbem_norm / prior_mol_counts;
    info!("prior weight {} over {} molecules", prior_weight, prior_mol_counts);

    let cname_idx: FxHashMap<&str, usize> =
        cnames.iter().enumerate().map(|(i, c)| (c.as_str(), i)).collect();

    let fallback = prior_weight * 1e-2;
    let mut matrix = vec![vec![fallback; num_genes]; barcodes.len()];
    let mut no_prior_cells = 0usize;
    for (i, barcode) in barcodes.iter().enumerate() {
        match cname_idx.get(barcode.as_str()) {
            Some(&c_idx) => {
                for (j, gname) in gnames.iter().enumerate() {
                    if prior_rows[c_idx][j] > 0.0 {
                        if let Some(&g_idx) = gene_idx.get(gname) {
                            matrix[i][g_idx as usize] += prior_weight * prior_rows[c_idx][j];
                        }
                    }
                }
            }
            None => no_prior_cells += 1,
        }
    }
    if no_prior_cells > 0 {
        warn!("no prior found for {} cell(s), using the uniform floor", no_prior_cells);
    }

    Ok(CellPriors { matrix, prior_weight })
}

#[cfg(test)]
mod test {
    use super::{load_priors, uniform_priors};
    use fxhash::FxHashMap;
    use std::fs;

    fn gene_idx(names: &[&str]) -> FxHashMap<String, u32> {
        names.iter().enumerate().map(|(i, n)| (n.to_string(), i as u32)).collect()
    }

    #[test]
    fn test_uniform() {
        let p = uniform_priors(2, 3, 1e-2);
        assert_eq!(p.matrix.len(), 2);
        assert_eq!(p.matrix[0], vec![1e-2; 3]);
        assert_eq!(p.prior_weight, 1.0);
    }

    #[test]
    fn test_load_and_align() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("quants_mat_rows.txt"), "CELL1\nCELL2\n").unwrap();
        fs::write(dir.path().join("quants_mat_cols.txt"), "G1\nGX\nG2\n").unwrap();
        fs::write(dir.path().join("quants_mat.csv"), "4,1,0\n0,0,5\n").unwrap();

        // current run: CELL2 and CELL3 over genes G2, G1 (GX is unknown)
        let barcodes = vec!["CELL2".to_string(), "CELL3".to_string()];
        let gidx = gene_idx(&["G2", "G1"]);

        let p = load_priors(dir.path(), &barcodes, &gidx, 2, 10.0).unwrap();
        let w = 10.0 / 10.0;
        let floor = w * 1e-2;

        // CELL2's row is (0, 0, 5): G2 gets the matrix mass on top of the floor
        assert!((p.matrix[0][0] - (floor + w * 5.0)).abs() < 1e-12);
        assert!((p.matrix[0][1] - floor).abs() < 1e-12);
        // CELL3 has no prior row: uniform floor
        assert_eq!(p.matrix[1], vec![floor; 2]);
        assert_eq!(p.prior_weight, w);
    }

    #[test]
    fn test_malformed_matrix_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("quants_mat_rows.txt"), "CELL1\n").unwrap();
        fs::write(dir.path().join("quants_mat_cols.txt"), "G1\nG2\n").unwrap();
        fs::write(dir.path().join("quants_mat.csv"), "4,notanumber\n").unwrap();

        let barcodes = vec!["CELL1".to_string()];
        let gidx = gene_idx(&["G1", "G2"]);
        assert!(load_priors(dir.path(), &barcodes, &gidx, 2, 10.0).is_err());

        fs::write(dir.path().join("quants_mat.csv"), "4\n").unwrap();
        assert!(load_priors(dir.path(), &barcodes, &gidx, 2, 10.0).is_err());
    }
}
