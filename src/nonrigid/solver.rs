//! Sparse SPD solve
//!
//! Conjugate gradients with Jacobi preconditioning over a cached sparse base
//! plus a per-iteration diagonal addend. The deformer's system only changes
//! in its diagonal between iterations, so the expensive part (`αLᵀL`) is
//! assembled once and shared.

use rayon::prelude::*;

use super::laplacian::CsrMatrix;
use crate::error::{FaceForgeError, Result};

const CG_MAX_ITER: usize = 500;
const CG_TOLERANCE: f64 = 1e-10;

/// Solve `(base + diag(shift)) x = b` for an SPD system.
///
/// `x0` seeds the iteration; the solution and the iteration count are
/// returned. Fails with `SolverFailure` when the residual does not fall
/// below tolerance within the iteration cap.
pub fn solve_spd(
    base: &CsrMatrix,
    shift: &[f64],
    b: &[f64],
    x0: &[f64],
) -> Result<(Vec<f64>, usize)> {
    let n = b.len();
    debug_assert_eq!(base.n_rows, n);
    debug_assert_eq!(shift.len(), n);
    debug_assert_eq!(x0.len(), n);

    // Jacobi preconditioner from the full diagonal.
    let mut precond = base.diagonal();
    for (p, &s) in precond.iter_mut().zip(shift) {
        *p += s;
        if p.abs() < 1e-12 {
            *p = 1.0;
        }
    }

    let apply = |x: &[f64], y: &mut [f64]| {
        base.spmv(x, y);
        y.par_iter_mut()
            .zip(x.par_iter().zip(shift.par_iter()))
            .for_each(|(out, (&xi, &si))| *out += si * xi);
    };

    let b_norm = norm(b);
    if b_norm == 0.0 {
        return Ok((vec![0.0; n], 0));
    }
    let threshold = CG_TOLERANCE * b_norm;

    let mut x = x0.to_vec();
    let mut ax = vec![0.0; n];
    apply(&x, &mut ax);

    let mut r: Vec<f64> = b.iter().zip(&ax).map(|(&bi, &axi)| bi - axi).collect();
    if norm(&r) <= threshold {
        return Ok((x, 0));
    }

    let mut z: Vec<f64> = r.iter().zip(&precond).map(|(&ri, &mi)| ri / mi).collect();
    let mut p = z.clone();
    let mut rz = dot(&r, &z);
    let mut ap = vec![0.0; n];

    for iteration in 1..=CG_MAX_ITER {
        apply(&p, &mut ap);
        let pap = dot(&p, &ap);
        if pap <= 0.0 || !pap.is_finite() {
            return Err(FaceForgeError::SolverFailure(format!(
                "indefinite curvature at iteration {}",
                iteration
            )));
        }
        let alpha = rz / pap;

        x.par_iter_mut()
            .zip(p.par_iter())
            .for_each(|(xi, &pi)| *xi += alpha * pi);
        r.par_iter_mut()
            .zip(ap.par_iter())
            .for_each(|(ri, &api)| *ri -= alpha * api);

        if norm(&r) <= threshold {
            return Ok((x, iteration));
        }

        z.par_iter_mut()
            .zip(r.par_iter().zip(precond.par_iter()))
            .for_each(|(zi, (&ri, &mi))| *zi = ri / mi);
        let rz_next = dot(&r, &z);
        let beta = rz_next / rz;
        rz = rz_next;

        p.par_iter_mut()
            .zip(z.par_iter())
            .for_each(|(pi, &zi)| *pi = zi + beta * *pi);
    }

    Err(FaceForgeError::SolverFailure(format!(
        "no convergence in {} iterations (residual {:.3e})",
        CG_MAX_ITER,
        norm(&r) / b_norm
    )))
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.par_iter().zip(b.par_iter()).map(|(&x, &y)| x * y).sum()
}

fn norm(v: &[f64]) -> f64 {
    dot(v, v).sqrt()
}
