//! Small dense least squares for the Anderson mixing problem.
//!
//! `min_γ ‖A γ − b‖₂` is solved through a one-sided (Hestenes) Jacobi SVD of
//! the tall `n × k` matrix `A`: column pairs are rotated until mutually
//! orthogonal, so `A V = U Σ` with the rotations accumulated in `V`. The
//! minimum-norm solution is then
//!
//! ```text
//! γ = Σ_{σ_j > tol} v_j (a_jᵀ b) / σ_j²
//! ```
//!
//! where `a_j = σ_j u_j` are the rotated columns. Singular values below the
//! cutoff are dropped, which is the truncated pseudo-inverse; a rank-deficient
//! `A` therefore still gives a finite `γ`.

use ndarray::{s, ArrayView1, ArrayViewMut1, ArrayViewMut2, Zip};

const EPS: f64 = f64::EPSILON;
const MAX_SWEEPS: usize = 60;

/// Outcome of [`solve_min_norm`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct LstsqInfo {
    /// Number of singular values kept.
    pub rank: usize,
    /// Jacobi sweeps performed.
    pub sweeps: usize,
}

// a_p <- c a_p - s a_q, a_q <- s a_p + c a_q
fn rotate_columns(m: &mut ArrayViewMut2<'_, f64>, p: usize, q: usize, c: f64, s: f64) {
    let (mut col_p, mut col_q) = m.multi_slice_mut((s![.., p], s![.., q]));
    Zip::from(&mut col_p).and(&mut col_q).for_each(|ap, aq| {
        let (vp, vq) = (*ap, *aq);
        *ap = c * vp - s * vq;
        *aq = s * vp + c * vq;
    });
}

/// Solves `min ‖A x − b‖₂` for the minimum-norm `x`.
///
/// `a` is overwritten with `U Σ` and `v` (`k × k`) with the accumulated
/// right singular vectors; both are caller-owned scratch. `rcond` is the
/// relative cutoff on singular values, defaulting to `max(n, k) · ε`.
/// Callers size `b` to the rows of `a`, and `x` and `v` to its columns.
pub(crate) fn solve_min_norm(
    mut a: ArrayViewMut2<'_, f64>,
    mut v: ArrayViewMut2<'_, f64>,
    b: ArrayView1<'_, f64>,
    mut x: ArrayViewMut1<'_, f64>,
    rcond: Option<f64>,
) -> LstsqInfo {
    let (rows, k) = a.dim();

    v.fill(0.0);
    v.diag_mut().fill(1.0);

    let mut sweeps = 0;
    let mut converged = k < 2;
    while !converged && sweeps < MAX_SWEEPS {
        sweeps += 1;
        converged = true;
        for p in 0..k {
            for q in (p + 1)..k {
                let alpha = a.column(p).dot(&a.column(p));
                let beta = a.column(q).dot(&a.column(q));
                let gamma = a.column(p).dot(&a.column(q));
                if gamma == 0.0 || gamma.abs() <= EPS * (alpha * beta).sqrt() {
                    continue;
                }
                converged = false;
                let zeta = (beta - alpha) / (2.0 * gamma);
                // For huge zeta the quadratic formula overflows; t ~ 1/(2 zeta).
                let t = if zeta.abs() > 1e150 {
                    0.5 / zeta
                } else {
                    zeta.signum() / (zeta.abs() + (1.0 + zeta * zeta).sqrt())
                };
                let c = 1.0 / (1.0 + t * t).sqrt();
                let sn = c * t;
                rotate_columns(&mut a, p, q, c, sn);
                rotate_columns(&mut v, p, q, c, sn);
            }
        }
    }
    if !converged {
        log::warn!(
            "[lstsq] Jacobi SVD stopped after {} sweeps without full orthogonality.",
            sweeps
        );
    }

    let sigma_sq: Vec<f64> = (0..k).map(|j| a.column(j).dot(&a.column(j))).collect();
    let sigma_max = sigma_sq.iter().cloned().fold(0.0, f64::max).sqrt();
    let rel = rcond.unwrap_or(rows.max(k) as f64 * EPS);
    let cutoff = rel * sigma_max;

    x.fill(0.0);
    let mut rank = 0;
    for (j, &ssq) in sigma_sq.iter().enumerate() {
        if ssq == 0.0 || ssq.sqrt() <= cutoff {
            continue;
        }
        rank += 1;
        let coef = a.column(j).dot(&b) / ssq;
        x.scaled_add(coef, &v.slice(s![.., j]));
    }

    LstsqInfo { rank, sweeps }
}
