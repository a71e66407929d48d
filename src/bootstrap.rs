//! Non-parametric bootstrap over the deduplicated class counts.
//!
//! Each replicate redraws the class counts from a multinomial with the
//! original counts as weights, re-runs the EM (never VBEM) and accumulates
//! the first two moments of the abundances.

use crate::em;
use crate::eqclass::GeneEqClass;
use crate::error::QuantError;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;

/// Moments and (optionally) the raw replicate estimates.
pub struct BootstrapEstimates {
    /// Per-gene variance over the replicates.
    pub variance: Vec<f64>,
    /// Every replicate's abundances, in draw order. Empty unless requested.
    pub replicates: Vec<Vec<f64>>,
}

/// Run `num_bootstraps` replicates.
///
/// `gene_alphas` carries the cell's post-EM abundances in (they warm-start
/// each replicate) and the bootstrap mean out. `classes` is scratch: its
/// counts are overwritten by each redraw. A replicate whose EM collapses
/// aborts the whole bootstrap for the cell.
pub fn run_bootstraps(
    gene_alphas: &mut [f64],
    classes: &mut [GeneEqClass],
    num_bootstraps: u32,
    keep_replicates: bool,
    init_uniform: bool,
    rng: &mut StdRng,
) -> Result<BootstrapEstimates, QuantError> {
    let num_genes = gene_alphas.len();

    let weights: Vec<u64> = classes.iter().map(|c| c.count as u64).collect();
    let total_frags: u64 = weights.iter().sum();
    let sampler = WeightedIndex::new(&weights).map_err(|_| QuantError::AlphaCollapse)?;

    let warm: Vec<f64> = gene_alphas.to_vec();
    let mut mean = vec![0.0; num_genes];
    let mut square_mean = vec![0.0; num_genes];
    let mut alphas = vec![0.0; num_genes];
    let mut replicates = Vec::new();

    for _ in 0..num_bootstraps {
        for class in classes.iter_mut() {
            class.count = 0;
        }
        for _ in 0..total_frags {
            classes[sampler.sample(rng)].count += 1;
        }

        for i in 0..num_genes {
            alphas[i] = if init_uniform {
                1.0 / num_genes as f64
            } else {
                (warm[i] + 0.5) * 1e-3
            };
        }

        em::run_iterations(classes, &mut alphas, None);
        let alpha_sum = em::truncate_alphas(&mut alphas, em::MIN_ALPHA);
        if alpha_sum < em::MIN_WEIGHT {
            return Err(QuantError::AlphaCollapse);
        }

        for i in 0..num_genes {
            mean[i] += alphas[i];
            square_mean[i] += alphas[i] * alphas[i];
        }
        if keep_replicates {
            replicates.push(alphas.clone());
        }
    }

    let mut variance = vec![0.0; num_genes];
    for i in 0..num_genes {
        let mean_alpha = mean[i] / num_bootstraps as f64;
        gene_alphas[i] = mean_alpha;
        variance[i] = square_mean[i] / num_bootstraps as f64 - mean_alpha * mean_alpha;
    }

    Ok(BootstrapEstimates { variance, replicates })
}
