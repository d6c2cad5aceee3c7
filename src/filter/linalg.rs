//! Small dense linear algebra for the per-pixel regression, in f64.

use super::features::MAX_FEATURES;

/// Largest system size: intercept plus linear and quadratic terms per feature.
pub const MAX_DIM: usize = 1 + 2 * MAX_FEATURES;

type Square = [[f64; MAX_DIM]; MAX_DIM];

/// Symmetric `n × n` matrix accumulated from weighted outer products.
#[derive(Clone)]
pub struct SymMatrix {
    n: usize,
    a: Square,
}

impl SymMatrix {
    pub fn zeros(n: usize) -> Self {
        assert!(n <= MAX_DIM, "matrix dimension {} exceeds {}", n, MAX_DIM);
        SymMatrix { n, a: [[0.0; MAX_DIM]; MAX_DIM] }
    }

    pub fn dim(&self) -> usize {
        self.n
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.a[i][j]
    }

    /// `self += weight * row rowᵀ`.
    #[inline(always)]
    pub fn add_outer(&mut self, row: &[f64], weight: f64) {
        for i in 0..self.n {
            let wi = weight * row[i];
            for j in 0..=i {
                self.a[i][j] += wi * row[j];
            }
        }
        for i in 0..self.n {
            for j in 0..i {
                self.a[j][i] = self.a[i][j];
            }
        }
    }

    /// Cholesky factorization; `None` if a pivot is not clearly positive.
    pub fn cholesky(&self) -> Option<Cholesky> {
        let n = self.n;
        let max_diag = (0..n).map(|i| self.a[i][i]).fold(0.0f64, f64::max);
        if max_diag <= 0.0 {
            return None;
        }
        let tolerance = 1e-9 * max_diag;
        let mut l = [[0.0; MAX_DIM]; MAX_DIM];
        for j in 0..n {
            let mut d = self.a[j][j];
            for k in 0..j {
                d -= l[j][k] * l[j][k];
            }
            if d <= tolerance {
                return None;
            }
            let d = d.sqrt();
            l[j][j] = d;
            for i in j + 1..n {
                let mut s = self.a[i][j];
                for k in 0..j {
                    s -= l[i][k] * l[j][k];
                }
                l[i][j] = s / d;
            }
        }
        Some(Cholesky { n, l })
    }
}

/// Lower-triangular factor `L` with `A = L Lᵀ`.
pub struct Cholesky {
    n: usize,
    l: Square,
}

impl Cholesky {
    fn forward(&self, b: &[f64]) -> [f64; MAX_DIM] {
        let mut z = [0.0; MAX_DIM];
        for i in 0..self.n {
            let mut s = b[i];
            for k in 0..i {
                s -= self.l[i][k] * z[k];
            }
            z[i] = s / self.l[i][i];
        }
        z
    }

    /// Solves `A x = b`.
    pub fn solve(&self, b: &[f64]) -> [f64; MAX_DIM] {
        let mut x = self.forward(b);
        for i in (0..self.n).rev() {
            let mut s = x[i];
            for k in i + 1..self.n {
                s -= self.l[k][i] * x[k];
            }
            x[i] = s / self.l[i][i];
        }
        x
    }

    /// `vᵀ A⁻¹ v`.
    pub fn inverse_quadratic_form(&self, v: &[f64]) -> f64 {
        let z = self.forward(v);
        z[..self.n].iter().map(|z| z * z).sum()
    }
}

/// Eigen-decomposition of a symmetric matrix, largest eigenvalue first.
pub struct Eigen {
    pub values: [f64; MAX_DIM],
    /// `vectors[k]` is the unit eigenvector of `values[k]`.
    pub vectors: Square,
}

/// Cyclic Jacobi eigenvalue iteration.
pub fn symmetric_eigen(m: &SymMatrix) -> Eigen {
    let n = m.n;
    let mut a = m.a;
    let mut v = [[0.0; MAX_DIM]; MAX_DIM];
    for (i, row) in v.iter_mut().enumerate().take(n) {
        row[i] = 1.0;
    }

    for _sweep in 0..64 {
        let mut off = 0.0;
        for i in 0..n {
            for j in i + 1..n {
                off += a[i][j] * a[i][j];
            }
        }
        if off < 1e-22 {
            break;
        }
        for p in 0..n {
            for q in p + 1..n {
                if a[p][q].abs() < 1e-300 {
                    continue;
                }
                let theta = (a[q][q] - a[p][p]) / (2.0 * a[p][q]);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let t = if theta == 0.0 { 1.0 } else { t };
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;
                for k in 0..n {
                    let akp = a[k][p];
                    let akq = a[k][q];
                    a[k][p] = c * akp - s * akq;
                    a[k][q] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[p][k];
                    let aqk = a[q][k];
                    a[p][k] = c * apk - s * aqk;
                    a[q][k] = s * apk + c * aqk;
                }
                for row in v.iter_mut().take(n) {
                    let vkp = row[p];
                    let vkq = row[q];
                    row[p] = c * vkp - s * vkq;
                    row[q] = s * vkp + c * vkq;
                }
            }
        }
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| a[j][j].total_cmp(&a[i][i]));
    let mut eigen = Eigen { values: [0.0; MAX_DIM], vectors: [[0.0; MAX_DIM]; MAX_DIM] };
    for (k, &i) in order.iter().enumerate() {
        eigen.values[k] = a[i][i];
        for r in 0..n {
            eigen.vectors[k][r] = v[r][i];
        }
    }
    eigen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(rows: &[&[f64]]) -> SymMatrix {
        let mut m = SymMatrix::zeros(rows.len());
        for (i, r) in rows.iter().enumerate() {
            for (j, &x) in r.iter().enumerate() {
                m.a[i][j] = x;
            }
        }
        m
    }

    #[test]
    fn cholesky_solves_spd_system() {
        let m = matrix(&[&[4.0, 2.0, 0.6], &[2.0, 5.0, 1.0], &[0.6, 1.0, 3.0]]);
        let c = m.cholesky().unwrap();
        let x = c.solve(&[1.0, 2.0, 3.0]);
        for i in 0..3 {
            let lhs: f64 = (0..3).map(|j| m.get(i, j) * x[j]).sum();
            assert!((lhs - [1.0, 2.0, 3.0][i]).abs() < 1e-12);
        }
        let q = c.inverse_quadratic_form(&[1.0, 2.0, 3.0]);
        let direct: f64 = (0..3).map(|i| [1.0, 2.0, 3.0][i] * x[i]).sum();
        assert!((q - direct).abs() < 1e-12);
    }

    #[test]
    fn cholesky_rejects_singular_matrix() {
        let mut m = SymMatrix::zeros(2);
        m.add_outer(&[1.0, 2.0], 1.0);
        assert!(m.cholesky().is_none());
    }

    #[test]
    fn eigen_recovers_known_spectrum() {
        let m = matrix(&[&[2.0, 1.0, 0.0], &[1.0, 2.0, 0.0], &[0.0, 0.0, 5.0]]);
        let e = symmetric_eigen(&m);
        assert!((e.values[0] - 5.0).abs() < 1e-10);
        assert!((e.values[1] - 3.0).abs() < 1e-10);
        assert!((e.values[2] - 1.0).abs() < 1e-10);
        let v = e.vectors[1];
        let s = std::f64::consts::FRAC_1_SQRT_2;
        assert!((v[0].abs() - s).abs() < 1e-8 && (v[1].abs() - s).abs() < 1e-8);
        assert!(v[2].abs() < 1e-8);
    }
}
