//! The per-cell EM / VBEM kernel over gene equivalence classes.
//!
//! A fixed-point update distributes each class count over its gene labels
//! in proportion to the current abundances (EM) or to the digamma-
//! transformed expected log abundances (VBEM), iterated under the
//! termination criterion of Bray et al. 2016.

use crate::eqclass::GeneEqClass;
use crate::error::QuantError;
use statrs::function::gamma::digamma;

/// Iterations run unconditionally before convergence is considered.
pub const MIN_ITER: u32 = 50;
/// Hard iteration cap.
pub const MAX_ITER: u32 = 10_000;
/// Relative-change tolerance of the stopping rule.
pub const REL_DIFF_TOLERANCE: f64 = 0.01;
/// Abundances below this are checked for convergence no further.
pub const ALPHA_CHECK_CUTOFF: f64 = 1e-2;
/// Post-EM truncation floor.
pub const MIN_ALPHA: f64 = 1e-8;
/// Arguments at or below this floor skip the digamma transform.
pub const DIGAMMA_MIN: f64 = 1e-10;

/// Smallest positive weight a cell may end up with (the smallest positive
/// subnormal double).
pub(crate) const MIN_WEIGHT: f64 = 5e-324;

fn em_update(classes: &[GeneEqClass], alpha_in: &[f64], alpha_out: &mut [f64]) {
    for class in classes {
        let count = class.count as f64;
        if class.labels.len() > 1 {
            let denom: f64 = class.labels.iter().map(|&g| alpha_in[g as usize]).sum();
            if denom > 0.0 {
                let inv_denom = count / denom;
                for &g in &class.labels {
                    let v = alpha_in[g as usize];
                    if !v.is_nan() {
                        alpha_out[g as usize] += v * inv_denom;
                    }
                }
            }
        } else {
            alpha_out[class.labels[0] as usize] += count;
        }
    }
}

fn vbem_update(
    classes: &[GeneEqClass],
    alpha_in: &[f64],
    priors: &[f64],
    exp_theta: &mut [f64],
    alpha_out: &mut [f64],
) {
    let alpha_sum: f64 = alpha_in.iter().zip(priors).map(|(a, p)| a + p).sum();
    let log_norm = if alpha_sum > DIGAMMA_MIN { digamma(alpha_sum) } else { 0.0 };

    for i in 0..alpha_in.len() {
        let ap = alpha_in[i] + priors[i];
        exp_theta[i] = if ap > DIGAMMA_MIN { (digamma(ap) - log_norm).exp() } else { 0.0 };
    }

    for class in classes {
        let count = class.count as f64;
        if class.labels.len() > 1 {
            let denom: f64 = class
                .labels
                .iter()
                .map(|&g| exp_theta[g as usize])
                .filter(|&t| t > 0.0)
                .sum();
            if denom > 0.0 {
                let inv_denom = count / denom;
                for &g in &class.labels {
                    let t = exp_theta[g as usize];
                    if t > 0.0 {
                        alpha_out[g as usize] += t * inv_denom;
                    }
                }
            }
        } else {
            alpha_out[class.labels[0] as usize] += count;
        }
    }
}

/// Iterate the fixed point until the stopping rule fires. With `priors`
/// the VBEM update is used, otherwise plain EM.
pub(crate) fn run_iterations(classes: &[GeneEqClass], alphas: &mut [f64], priors: Option<&[f64]>) {
    let num_genes = alphas.len();
    let mut alphas_prime = vec![0.0; num_genes];
    let mut exp_theta = vec![0.0; if priors.is_some() { num_genes } else { 0 }];

    let mut converged = false;
    let mut it_num: u32 = 0;
    while it_num < MIN_ITER || (it_num < MAX_ITER && !converged) {
        match priors {
            Some(p) => vbem_update(classes, alphas, p, &mut exp_theta, &mut alphas_prime),
            None => em_update(classes, alphas, &mut alphas_prime),
        }

        converged = true;
        for i in 0..num_genes {
            if alphas_prime[i] > ALPHA_CHECK_CUTOFF {
                let rel_diff = (alphas[i] - alphas_prime[i]).abs() / alphas_prime[i];
                if rel_diff > REL_DIFF_TOLERANCE {
                    converged = false;
                }
            }
            alphas[i] = alphas_prime[i];
            alphas_prime[i] = 0.0;
        }
        it_num += 1;
    }
}

/// Zero every abundance below `cutoff` and return the remaining sum.
pub fn truncate_alphas(alphas: &mut [f64], cutoff: f64) -> f64 {
    let mut alpha_sum = 0.0;
    for a in alphas.iter_mut() {
        if *a < cutoff {
            *a = 0.0;
        }
        alpha_sum += *a;
    }
    alpha_sum
}

/// Run the full per-cell optimisation: initialise, iterate, truncate.
///
/// `alphas` carries the warm start in and the final abundances out.
/// Passing `priors` selects VBEM. Returns the post-truncation total, or
/// [`QuantError::AlphaCollapse`] when it vanishes entirely; the caller
/// treats that as a survivable per-cell failure.
pub fn run_per_cell_em(
    alphas: &mut [f64],
    priors: Option<&[f64]>,
    classes: &[GeneEqClass],
    init_uniform: bool,
) -> Result<f64, QuantError> {
    let num_genes = alphas.len();
    if init_uniform {
        alphas.fill(1.0 / num_genes as f64);
    }
    for a in alphas.iter_mut() {
        *a = (*a + 0.5) * 1e-3;
    }

    run_iterations(classes, alphas, priors);

    let total = truncate_alphas(alphas, MIN_ALPHA);
    if total < MIN_WEIGHT {
        return Err(QuantError::AlphaCollapse);
    }
    Ok(total)
}

#[cfg(test)]
mod test {
    use super::{
        run_per_cell_em, truncate_alphas, vbem_update, DIGAMMA_MIN, MIN_ALPHA,
    };
    use crate::eqclass::GeneEqClass;
    use statrs::assert_almost_eq;

    fn class(labels: &[u32], count: u32) -> GeneEqClass {
        GeneEqClass { labels: labels.to_vec(), count }
    }

    #[test]
    fn test_unique_classes_recover_counts() {
        // two genes with only unambiguous evidence: EM returns the counts
        let classes = vec![class(&[0], 10), class(&[1], 5)];
        let mut alphas = vec![10.0, 5.0];
        let total = run_per_cell_em(&mut alphas, None, &classes, false).unwrap();
        assert_almost_eq!(alphas[0], 10.0, 1e-6);
        assert_almost_eq!(alphas[1], 5.0, 1e-6);
        assert_almost_eq!(total, 15.0, 1e-6);

        // the warm start does not matter for unique classes
        let mut alphas = vec![0.0, 0.0];
        run_per_cell_em(&mut alphas, None, &classes, true).unwrap();
        assert_almost_eq!(alphas[0], 10.0, 1e-6);
        assert_almost_eq!(alphas[1], 5.0, 1e-6);
    }

    #[test]
    fn test_symmetric_ambiguity_splits_evenly() {
        let classes = vec![class(&[0, 1], 20)];
        let mut alphas = vec![0.0, 0.0];
        run_per_cell_em(&mut alphas, None, &classes, true).unwrap();
        assert_almost_eq!(alphas[0], 10.0, 1e-6);
        assert_almost_eq!(alphas[1], 10.0, 1e-6);
    }

    #[test]
    fn test_ambiguity_follows_unique_evidence() {
        // {A}x8, {B}x4, {A,B}x4: the shared count splits 2:1
        let classes = vec![class(&[0], 8), class(&[1], 4), class(&[0, 1], 4)];
        let mut alphas = vec![8.0, 4.0, 0.0];
        let total = run_per_cell_em(&mut alphas, None, &classes, false).unwrap();
        assert_almost_eq!(total, 16.0, 1e-6);
        assert_almost_eq!(alphas[0], 8.0 + 4.0 * 8.0 / 12.0, 0.1);
        assert_almost_eq!(alphas[1], 4.0 + 4.0 * 4.0 / 12.0, 0.1);
        // gene 2 has no evidence at all
        assert_eq!(alphas[2], 0.0);
    }

    #[test]
    fn test_mass_conservation_per_iteration() {
        let classes = vec![class(&[0], 3), class(&[0, 1], 7), class(&[1, 2], 2)];
        let alphas = vec![1.0, 1.0, 1.0];
        let mut alphas_prime = vec![0.0; 3];
        super::em_update(&classes, &alphas, &mut alphas_prime);
        let total: f64 = alphas_prime.iter().sum();
        assert_almost_eq!(total, 12.0, 1e-9);

        // and for VBEM
        alphas_prime.fill(0.0);
        let priors = vec![1.0, 1.0, 1.0];
        let mut exp_theta = vec![0.0; 3];
        vbem_update(&classes, &alphas, &priors, &mut exp_theta, &mut alphas_prime);
        let total: f64 = alphas_prime.iter().sum();
        assert_almost_eq!(total, 12.0, 1e-9);
    }

    #[test]
    fn test_single_gene_is_total_count() {
        let classes = vec![class(&[0], 42)];
        let mut alphas = vec![0.0];
        let total = run_per_cell_em(&mut alphas, None, &classes, true).unwrap();
        assert_almost_eq!(total, 42.0, 1e-9);
    }

    #[test]
    fn test_vbem_symmetric_prior_symmetric_fixed_point() {
        let classes = vec![class(&[0, 1], 20)];
        let priors = vec![1.0, 1.0];
        let mut alphas = vec![0.0, 0.0];
        run_per_cell_em(&mut alphas, Some(&priors), &classes, true).unwrap();
        assert_almost_eq!(alphas[0], 10.0, 1e-6);
        assert_almost_eq!(alphas[1], 10.0, 1e-6);
    }

    #[test]
    fn test_digamma_floor_is_exclusive() {
        // alpha + prior exactly at the floor is treated as below it
        let classes = vec![class(&[0, 1], 5)];
        let alphas = vec![DIGAMMA_MIN / 2.0, 1.0];
        let priors = vec![DIGAMMA_MIN / 2.0, 1.0];
        let mut exp_theta = vec![0.0; 2];
        let mut alphas_prime = vec![0.0; 2];
        vbem_update(&classes, &alphas, &priors, &mut exp_theta, &mut alphas_prime);
        assert_eq!(exp_theta[0], 0.0);
        // the whole count flows to the gene above the floor
        assert_almost_eq!(alphas_prime[1], 5.0, 1e-9);
    }

    #[test]
    fn test_truncate() {
        let mut alphas = vec![0.5, MIN_ALPHA / 10.0, 0.0, MIN_ALPHA];
        let total = truncate_alphas(&mut alphas, MIN_ALPHA);
        assert_eq!(alphas[1], 0.0);
        assert_eq!(alphas[3], MIN_ALPHA);
        for a in &alphas {
            assert!(*a == 0.0 || *a >= MIN_ALPHA);
        }
        assert_almost_eq!(total, 0.5 + MIN_ALPHA, 1e-12);
    }

    #[test]
    fn test_collapse_reported() {
        // no classes at all: everything truncates to zero
        let mut alphas = vec![0.0, 0.0];
        assert!(run_per_cell_em(&mut alphas, None, &[], false).is_err());
    }
}
