//! Small dense-matrix toolkit for the HMM engine.
//!
//! No external stats library needed — all probability math is inline. The
//! dimensions involved are tiny (observation dim d=4, regime count K up to a
//! couple dozen), so a hand-rolled `Vec<f64>` row-major matrix is plenty
//! fast and keeps the dependency surface small.

/// A square or rectangular row-major matrix.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Mat {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f64>,
}

impl Mat {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn identity(n: usize) -> Self {
        let mut m = Self::zeros(n, n);
        for i in 0..n {
            m.set(i, i, 1.0);
        }
        m
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> f64 {
        self.data[r * self.cols + c]
    }

    #[inline]
    pub fn set(&mut self, r: usize, c: usize, v: f64) {
        self.data[r * self.cols + c] = v;
    }

    pub fn is_symmetric(&self, tol: f64) -> bool {
        if self.rows != self.cols {
            return false;
        }
        for i in 0..self.rows {
            for j in (i + 1)..self.cols {
                if (self.get(i, j) - self.get(j, i)).abs() > tol {
                    return false;
                }
            }
        }
        true
    }

    /// Symmetrize by averaging with the transpose (cheap guard against
    /// floating-point drift after repeated weighted-scatter updates).
    pub fn symmetrize(&mut self) {
        assert_eq!(self.rows, self.cols);
        for i in 0..self.rows {
            for j in (i + 1)..self.cols {
                let avg = 0.5 * (self.get(i, j) + self.get(j, i));
                self.set(i, j, avg);
                self.set(j, i, avg);
            }
        }
    }
}

/// Lower-triangular Cholesky factor `L` such that `A = L * L^T`.
///
/// Returns `None` if `A` is not positive definite (a zero or negative
/// pivot is encountered), which the caller treats as a numerical fault
/// (spec §4.3: "On any numerical failure... revert to last-known-good").
pub fn cholesky(a: &Mat) -> Option<Mat> {
    assert_eq!(a.rows, a.cols);
    let n = a.rows;
    let mut l = Mat::zeros(n, n);
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a.get(i, j);
            for k in 0..j {
                sum -= l.get(i, k) * l.get(j, k);
            }
            if i == j {
                if sum <= 0.0 || !sum.is_finite() {
                    return None;
                }
                l.set(i, j, sum.sqrt());
            } else {
                let ljj = l.get(j, j);
                if ljj == 0.0 || !ljj.is_finite() {
                    return None;
                }
                l.set(i, j, sum / ljj);
            }
        }
    }
    Some(l)
}

/// Solve `L y = b` (forward substitution, L lower triangular).
fn forward_solve(l: &Mat, b: &[f64]) -> Vec<f64> {
    let n = l.rows;
    let mut y = vec![0.0; n];
    for i in 0..n {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l.get(i, k) * y[k];
        }
        y[i] = sum / l.get(i, i);
    }
    y
}

/// Solve `A x = b` given the Cholesky factor `L` of SPD `A`.
pub fn cholesky_solve(l: &Mat, b: &[f64]) -> Vec<f64> {
    let n = l.rows;
    // L y = b, then L^T x = y.
    let y = forward_solve(l, b);
    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let mut sum = y[i];
        for k in (i + 1)..n {
            sum -= l.get(k, i) * x[k];
        }
        x[i] = sum / l.get(i, i);
    }
    x
}

/// `log det(A)` from its Cholesky factor: `2 * sum(log(diag(L)))`.
pub fn log_det_from_cholesky(l: &Mat) -> f64 {
    (0..l.rows).map(|i| l.get(i, i).ln()).sum::<f64>() * 2.0
}

/// Squared Mahalanobis distance `(x - mu)^T Sigma^-1 (x - mu)` given the
/// Cholesky factor of `Sigma`.
pub fn mahalanobis_sq(l: &Mat, x: &[f64], mu: &[f64]) -> f64 {
    let diff: Vec<f64> = x.iter().zip(mu).map(|(a, b)| a - b).collect();
    let sol = cholesky_solve(l, &diff);
    diff.iter().zip(&sol).map(|(d, s)| d * s).sum()
}

/// Project a symmetric matrix onto the SPD cone by flooring its eigenvalues
/// at `eps` via Jacobi eigenvalue decomposition. Dimensions here are small
/// (d <= 4 observation dims), so a simple cyclic Jacobi sweep is fine.
pub fn project_spd(a: &Mat, eps: f64) -> Mat {
    let n = a.rows;
    let mut m = a.clone();
    m.symmetrize();
    let mut v = Mat::identity(n);

    for _sweep in 0..50 {
        let mut off_diag_max: f64 = 0.0;
        for p in 0..n {
            for q in (p + 1)..n {
                off_diag_max = off_diag_max.max(m.get(p, q).abs());
            }
        }
        if off_diag_max < 1e-12 {
            break;
        }
        for p in 0..n {
            for q in (p + 1)..n {
                let apq = m.get(p, q);
                if apq.abs() < 1e-14 {
                    continue;
                }
                let app = m.get(p, p);
                let aqq = m.get(q, q);
                let phi = 0.5 * (2.0 * apq).atan2(app - aqq);
                let (c, s) = (phi.cos(), phi.sin());
                jacobi_rotate(&mut m, p, q, c, s);
                jacobi_rotate(&mut v, p, q, c, s);
            }
        }
    }

    // Eigenvalues are now on the diagonal of m; eigenvectors are columns of v.
    let mut eigvals: Vec<f64> = (0..n).map(|i| m.get(i, i).max(eps)).collect();
    for e in eigvals.iter_mut() {
        if !e.is_finite() {
            *e = eps;
        }
    }

    // Reconstruct A' = V * diag(eigvals) * V^T.
    let mut out = Mat::zeros(n, n);
    for i in 0..n {
        for j in 0..n {
            let mut sum = 0.0;
            for k in 0..n {
                sum += v.get(i, k) * eigvals[k] * v.get(j, k);
            }
            out.set(i, j, sum);
        }
    }
    out.symmetrize();
    out
}

/// Apply a Jacobi rotation to symmetric `m` in-place for the column-vector
/// accumulation used in `project_spd`. Mutates both rows and columns
/// `p`/`q` consistently, as required to rotate `m` when `m` is square
/// (used both for the matrix being diagonalized and the eigenvector
/// accumulator, which are both n x n here).
fn jacobi_rotate(m: &mut Mat, p: usize, q: usize, c: f64, s: f64) {
    let n = m.rows;
    for i in 0..n {
        let mip = m.get(i, p);
        let miq = m.get(i, q);
        m.set(i, p, c * mip - s * miq);
        m.set(i, q, s * mip + c * miq);
    }
    for i in 0..n {
        let mpi = m.get(p, i);
        let mqi = m.get(q, i);
        m.set(p, i, c * mpi - s * mqi);
        m.set(q, i, s * mpi + c * mqi);
    }
}

/// Numerically stable log-sum-exp over a slice.
pub fn log_sum_exp(xs: &[f64]) -> f64 {
    let max = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = xs.iter().map(|&x| (x - max).exp()).sum();
    max + sum.ln()
}

/// Softmax over a slice (not in log-space).
pub fn softmax(xs: &[f64]) -> Vec<f64> {
    let max = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = xs.iter().map(|&x| (x - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.iter().map(|&e| e / sum).collect()
}

/// Shannon entropy (natural log) of a probability vector; 0 for a
/// degenerate distribution.
pub fn entropy(p: &[f64]) -> f64 {
    -p.iter()
        .filter(|&&x| x > 0.0)
        .map(|&x| x * x.ln())
        .sum::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cholesky_reconstructs_identity() {
        let i = Mat::identity(3);
        let l = cholesky(&i).unwrap();
        assert!((l.get(0, 0) - 1.0).abs() < 1e-12);
        assert!((l.get(1, 1) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn cholesky_rejects_non_spd() {
        let mut m = Mat::zeros(2, 2);
        m.set(0, 0, 1.0);
        m.set(1, 1, -1.0);
        assert!(cholesky(&m).is_none());
    }

    #[test]
    fn mahalanobis_zero_at_mean() {
        let sigma = Mat::identity(2);
        let l = cholesky(&sigma).unwrap();
        let mu = [1.0, 2.0];
        assert!(mahalanobis_sq(&l, &mu, &mu) < 1e-12);
    }

    #[test]
    fn project_spd_floors_negative_eigenvalues() {
        let mut m = Mat::zeros(2, 2);
        m.set(0, 0, -1.0);
        m.set(1, 1, 2.0);
        let out = project_spd(&m, 1e-8);
        assert!(out.is_symmetric(1e-9));
        // reconstructed matrix should now be Cholesky-factorizable (SPD).
        assert!(cholesky(&out).is_some());
    }

    #[test]
    fn log_sum_exp_matches_naive_on_well_conditioned_input() {
        let xs = [0.1, 0.2, -0.3, 0.05];
        let naive = xs.iter().map(|x| x.exp()).sum::<f64>().ln();
        assert!((log_sum_exp(&xs) - naive).abs() < 1e-9);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let p = softmax(&[1.0, 2.0, 3.0]);
        let sum: f64 = p.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }
}
