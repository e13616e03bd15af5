//! Limited-memory BFGS.
//!
//! The accelerator stores curvature pairs `(s, y, ρ = 1/yᵀs)` and applies the
//! implicit inverse-Jacobian approximation with the two-loop recursion. Pairs
//! are checked before they are stored; a pair that would break positive
//! definiteness is skipped, which is reported through the `bool` returned by
//! [`Lbfgs::update`] and is not an error.

use ndarray::{Array1, Zip};
use serde::{Deserialize, Serialize};

use crate::window::Window;
use crate::{check_dimension, check_len, check_tolerance, AccelError};

/// Orientation of `y` relative to the vector `p` passed to [`Lbfgs::update`].
///
/// Minimization callers pass gradients with [`Sign::Positive`]. Callers whose
/// `p` decreases along the step (for instance a negated residual) use
/// [`Sign::Negative`], so that `y = p_prev − p_new` still satisfies the
/// curvature condition. The same sign must be passed to [`Lbfgs::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Sign {
    #[default]
    Positive,
    Negative,
}

/// Cautious BFGS: pairs are only stored when `yᵀs / sᵀs ≥ ϵ ‖p_new‖^α`.
///
/// The check is disabled while `epsilon` is zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CbfgsParams {
    pub alpha: f64,
    pub epsilon: f64,
}

impl Default for CbfgsParams {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            epsilon: 0.0,
        }
    }
}

impl CbfgsParams {
    pub fn is_enabled(&self) -> bool {
        self.epsilon > 0.0
    }
}

/// Parameters for [`Lbfgs`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LbfgsParams {
    /// Number of curvature pairs kept.
    pub memory: usize,
    /// Reject a pair when `yᵀs ≤ min_div_fac · sᵀs`.
    pub min_div_fac: f64,
    /// Reject a pair when `sᵀs ≤ min_abs_s`.
    pub min_abs_s: f64,
    /// Compare the signed `yᵀs` against the threshold. When false, `|yᵀs|` is
    /// used, which admits indefinite curvature.
    pub force_pos_def: bool,
    pub cbfgs: CbfgsParams,
}

impl Default for LbfgsParams {
    fn default() -> Self {
        Self {
            memory: 10,
            min_div_fac: 1e-10,
            min_abs_s: 1e-32,
            force_pos_def: true,
            cbfgs: CbfgsParams::default(),
        }
    }
}

impl LbfgsParams {
    pub fn with_memory(mut self, memory: usize) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_min_div_fac(mut self, min_div_fac: f64) -> Self {
        self.min_div_fac = min_div_fac;
        self
    }

    pub fn with_min_abs_s(mut self, min_abs_s: f64) -> Self {
        self.min_abs_s = min_abs_s;
        self
    }

    pub fn with_force_pos_def(mut self, force_pos_def: bool) -> Self {
        self.force_pos_def = force_pos_def;
        self
    }

    /// Enables the cautious update `yᵀs / sᵀs ≥ epsilon · ‖p_new‖^alpha`.
    pub fn with_cbfgs(mut self, alpha: f64, epsilon: f64) -> Self {
        self.cbfgs = CbfgsParams { alpha, epsilon };
        self
    }

    fn validate(&self) -> Result<(), AccelError> {
        check_tolerance("min_div_fac", self.min_div_fac)?;
        check_tolerance("min_abs_s", self.min_abs_s)?;
        check_tolerance("cbfgs.epsilon", self.cbfgs.epsilon)?;
        if !self.cbfgs.alpha.is_finite() {
            return Err(AccelError::InvalidParameter {
                name: "cbfgs.alpha",
                reason: "must be finite",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct CurvaturePair {
    s: Array1<f64>,
    y: Array1<f64>,
    rho: f64,
}

/// Limited-memory BFGS state.
#[derive(Debug, Clone)]
pub struct Lbfgs {
    params: LbfgsParams,
    n: usize,
    history: Window<CurvaturePair>,
    // Two-loop coefficients, by logical window index.
    alpha: Vec<f64>,
    // ρ recomputed on an index subset; NaN marks a skipped pair.
    rho_masked: Vec<f64>,
}

impl Lbfgs {
    pub fn new(params: LbfgsParams, n: usize) -> Result<Self, AccelError> {
        check_dimension(n)?;
        params.validate()?;
        let m = params.memory;
        Ok(Self {
            params,
            n,
            history: Window::from_fn(m, || CurvaturePair {
                s: Array1::zeros(n),
                y: Array1::zeros(n),
                rho: 0.0,
            }),
            alpha: vec![0.0; m],
            rho_masked: vec![0.0; m],
        })
    }

    /// Whether a pair with the given inner products passes the curvature
    /// tests. `p_sq_norm` is `‖p_new‖²` and only matters for the cautious
    /// check.
    pub fn update_valid(params: &LbfgsParams, ys: f64, ss: f64, p_sq_norm: f64) -> bool {
        if !Self::curvature_valid(params, ys, ss) {
            return false;
        }
        if params.cbfgs.is_enabled() {
            let a_ys = if params.force_pos_def { ys } else { ys.abs() };
            let threshold = ss * params.cbfgs.epsilon * p_sq_norm.powf(params.cbfgs.alpha / 2.0);
            if a_ys < threshold {
                return false;
            }
        }
        true
    }

    // Step size, finiteness and curvature tests, without the cautious check.
    fn curvature_valid(params: &LbfgsParams, ys: f64, ss: f64) -> bool {
        if ss <= params.min_abs_s {
            return false;
        }
        if !ys.is_finite() {
            return false;
        }
        let a_ys = if params.force_pos_def { ys } else { ys.abs() };
        a_ys > params.min_div_fac * ss
    }

    /// Records the step from `x_prev` to `x_new`, with `p` evaluated at both
    /// points. Returns whether the pair was stored; with zero memory nothing
    /// ever is.
    pub fn update(
        &mut self,
        x_prev: &Array1<f64>,
        x_new: &Array1<f64>,
        p_prev: &Array1<f64>,
        p_new: &Array1<f64>,
        sign: Sign,
    ) -> Result<bool, AccelError> {
        self.record_step(x_prev, x_new, p_prev, p_new, sign, false)
    }

    /// Same as [`update`](Self::update), but stores the pair without the
    /// validity tests. `ρ = 1/yᵀs` is stored as computed.
    pub fn update_forced(
        &mut self,
        x_prev: &Array1<f64>,
        x_new: &Array1<f64>,
        p_prev: &Array1<f64>,
        p_new: &Array1<f64>,
        sign: Sign,
    ) -> Result<bool, AccelError> {
        self.record_step(x_prev, x_new, p_prev, p_new, sign, true)
    }

    fn record_step(
        &mut self,
        x_prev: &Array1<f64>,
        x_new: &Array1<f64>,
        p_prev: &Array1<f64>,
        p_new: &Array1<f64>,
        sign: Sign,
        forced: bool,
    ) -> Result<bool, AccelError> {
        check_len("x_prev", x_prev, self.n)?;
        check_len("x_new", x_new, self.n)?;
        check_len("p_prev", p_prev, self.n)?;
        check_len("p_new", p_new, self.n)?;

        let sgn = sign.factor();
        let (ys, ss) = Zip::from(x_prev).and(x_new).and(p_prev).and(p_new).fold(
            (0.0, 0.0),
            |(ys, ss), &xp, &xn, &pp, &pn| {
                let s = xn - xp;
                let y = sgn * (pn - pp);
                (ys + y * s, ss + s * s)
            },
        );
        let p_sq_norm = if self.params.cbfgs.is_enabled() {
            p_new.dot(p_new)
        } else {
            0.0
        };
        if !forced && !self.accepts(ys, ss, p_sq_norm) {
            return Ok(false);
        }

        let stored = self.history.push_with(|pair| {
            Zip::from(&mut pair.s)
                .and(&mut pair.y)
                .and(x_prev)
                .and(x_new)
                .and(p_prev)
                .and(p_new)
                .for_each(|s, y, &xp, &xn, &pp, &pn| {
                    *s = xn - xp;
                    *y = sgn * (pn - pp);
                });
            pair.rho = 1.0 / ys;
        });
        log::trace!(
            "[L-BFGS] {} of {} pairs stored.",
            self.history.len(),
            self.history.capacity()
        );
        Ok(stored)
    }

    /// Stores an explicit pair `(s, y)` after the same validity tests as
    /// [`update`](Self::update).
    pub fn update_sy(
        &mut self,
        s: &Array1<f64>,
        y: &Array1<f64>,
        p_new_sq_norm: f64,
    ) -> Result<bool, AccelError> {
        self.record_sy(s, y, p_new_sq_norm, false)
    }

    /// Stores `(s, y)` without the validity tests.
    pub fn update_sy_forced(
        &mut self,
        s: &Array1<f64>,
        y: &Array1<f64>,
    ) -> Result<bool, AccelError> {
        self.record_sy(s, y, 0.0, true)
    }

    fn record_sy(
        &mut self,
        s: &Array1<f64>,
        y: &Array1<f64>,
        p_new_sq_norm: f64,
        forced: bool,
    ) -> Result<bool, AccelError> {
        check_len("s", s, self.n)?;
        check_len("y", y, self.n)?;
        let ys = y.dot(s);
        let ss = s.dot(s);
        if !forced && !self.accepts(ys, ss, p_new_sq_norm) {
            return Ok(false);
        }
        Ok(self.history.push_with(|pair| {
            pair.s.assign(s);
            pair.y.assign(y);
            pair.rho = 1.0 / ys;
        }))
    }

    fn accepts(&self, ys: f64, ss: f64, p_sq_norm: f64) -> bool {
        let valid = Self::update_valid(&self.params, ys, ss, p_sq_norm);
        if !valid {
            log::debug!(
                "[L-BFGS] Rejected curvature pair: yᵀs = {:.3e}, sᵀs = {:.3e}.",
                ys,
                ss
            );
        }
        valid
    }

    /// Overwrites `q` with `H q`, where `H` is the current inverse-Jacobian
    /// approximation with initial scaling `γ = sᵀy / yᵀy` of the newest pair.
    ///
    /// Returns `false` and leaves `q` untouched when no pairs are stored.
    pub fn apply(&mut self, q: &mut Array1<f64>, sign: Sign) -> Result<bool, AccelError> {
        check_len("q", q, self.n)?;
        Ok(self.two_loop(q, None, sign))
    }

    /// Same as [`apply`](Self::apply) with an explicit `H₀ = γ I`.
    pub fn apply_scaled(
        &mut self,
        q: &mut Array1<f64>,
        gamma: f64,
        sign: Sign,
    ) -> Result<bool, AccelError> {
        check_len("q", q, self.n)?;
        check_gamma(gamma)?;
        Ok(self.two_loop(q, Some(gamma), sign))
    }

    fn two_loop(&mut self, q: &mut Array1<f64>, gamma: Option<f64>, sign: Sign) -> bool {
        let gamma = match (gamma, self.history.newest()) {
            (_, None) => return false,
            (Some(gamma), _) => gamma,
            (None, Some(newest)) => 1.0 / (newest.rho * newest.y.dot(&newest.y)),
        };

        for (i, pair) in self.history.iter().enumerate().rev() {
            let a = pair.rho * q.dot(&pair.s);
            q.scaled_add(-a, &pair.y);
            self.alpha[i] = a;
        }
        *q *= gamma;
        for (i, pair) in self.history.iter().enumerate() {
            let beta = pair.rho * q.dot(&pair.y);
            q.scaled_add(self.alpha[i] - beta, &pair.s);
        }
        if sign == Sign::Negative {
            q.mapv_inplace(|v| -v);
        }
        true
    }

    /// Applies the operator restricted to the coordinates in `indices`.
    ///
    /// Inner products only run over `indices`, `ρ` is recomputed on that
    /// subset and pairs that fail the validity test there are skipped. Entries
    /// of `q` outside `indices` are left untouched. With `gamma = None` the
    /// scaling comes from the newest valid pair. Returns `false` when no pair
    /// is usable. The cautious check is not applied here, since `‖p‖` on the
    /// subset is not known.
    ///
    /// `indices` should be distinct; a repeated index is counted once per
    /// occurrence in every inner product.
    pub fn apply_masked(
        &mut self,
        q: &mut Array1<f64>,
        gamma: Option<f64>,
        indices: &[usize],
        sign: Sign,
    ) -> Result<bool, AccelError> {
        check_len("q", q, self.n)?;
        if let Some(&index) = indices.iter().find(|&&j| j >= self.n) {
            return Err(AccelError::IndexOutOfBounds { index, n: self.n });
        }
        if let Some(gamma) = gamma {
            check_gamma(gamma)?;
        }
        if self.history.is_empty() {
            return Ok(false);
        }
        if indices.len() == self.n && indices.iter().enumerate().all(|(i, &j)| i == j) {
            // `0..n` in order gives the regular recursion, save for the
            // per-pair validity recheck.
            return Ok(self.masked_two_loop(q, gamma, None, sign));
        }
        Ok(self.masked_two_loop(q, gamma, Some(indices), sign))
    }

    fn masked_two_loop(
        &mut self,
        q: &mut Array1<f64>,
        mut gamma: Option<f64>,
        indices: Option<&[usize]>,
        sign: Sign,
    ) -> bool {
        let mut skipped = 0;
        for (i, pair) in self.history.iter().enumerate().rev() {
            let ys = masked_dot(indices, &pair.s, &pair.y);
            let ss = masked_dot(indices, &pair.s, &pair.s);
            if !Self::curvature_valid(&self.params, ys, ss) {
                self.rho_masked[i] = f64::NAN;
                skipped += 1;
                continue;
            }
            let rho = 1.0 / ys;
            self.rho_masked[i] = rho;
            let a = rho * masked_dot(indices, &pair.s, q);
            masked_axpy(indices, -a, &pair.y, q);
            self.alpha[i] = a;
            if gamma.is_none() {
                gamma = Some(1.0 / (rho * masked_dot(indices, &pair.y, &pair.y)));
            }
        }
        if skipped > 0 {
            log::debug!(
                "[L-BFGS] Masked apply skipped {} of {} pairs.",
                skipped,
                self.history.len()
            );
        }
        let gamma = match gamma {
            Some(gamma) if skipped < self.history.len() => gamma,
            _ => return false,
        };

        masked_scale(indices, gamma, q);
        for (i, pair) in self.history.iter().enumerate() {
            let rho = self.rho_masked[i];
            if rho.is_nan() {
                continue;
            }
            let beta = rho * masked_dot(indices, &pair.y, q);
            masked_axpy(indices, self.alpha[i] - beta, &pair.s, q);
        }
        if sign == Sign::Negative {
            masked_scale(indices, -1.0, q);
        }
        true
    }

    /// Multiplies every stored `y` by `factor`, for callers that rescale the
    /// problem between iterations.
    pub fn scale_y(&mut self, factor: f64) {
        for pair in self.history.iter_mut() {
            pair.y *= factor;
            pair.rho /= factor;
        }
    }

    /// Drops all stored pairs.
    pub fn reset(&mut self) {
        self.history.clear();
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn history(&self) -> usize {
        self.history.capacity()
    }

    pub fn current_history(&self) -> usize {
        self.history.len()
    }

    pub fn params(&self) -> &LbfgsParams {
        &self.params
    }
}

impl Sign {
    fn factor(self) -> f64 {
        match self {
            Sign::Positive => 1.0,
            Sign::Negative => -1.0,
        }
    }
}

// Inner product over `indices`, or over everything when `None`.
fn masked_dot(indices: Option<&[usize]>, a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    match indices {
        None => a.dot(b),
        Some(idx) => idx.iter().map(|&j| a[j] * b[j]).sum(),
    }
}

// y += a x on `indices`
fn masked_axpy(indices: Option<&[usize]>, a: f64, x: &Array1<f64>, y: &mut Array1<f64>) {
    match indices {
        None => y.scaled_add(a, x),
        Some(idx) => {
            for &j in idx {
                y[j] += a * x[j];
            }
        }
    }
}

fn masked_scale(indices: Option<&[usize]>, a: f64, x: &mut Array1<f64>) {
    match indices {
        None => *x *= a,
        Some(idx) => {
            for &j in idx {
                x[j] *= a;
            }
        }
    }
}

fn check_gamma(gamma: f64) -> Result<(), AccelError> {
    if gamma.is_finite() && gamma > 0.0 {
        Ok(())
    } else {
        Err(AccelError::InvalidParameter {
            name: "gamma",
            reason: "must be finite and positive",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Lbfgs, LbfgsParams, Sign};
    use crate::AccelError;
    use ndarray::{array, Array1, Array2};
    use spectral::prelude::*;

    // Dense inverse BFGS recursion, H ← (I − ρ s yᵀ) H (I − ρ y sᵀ) + ρ s sᵀ,
    // starting from γ I.
    fn dense_inverse_bfgs(pairs: &[(Array1<f64>, Array1<f64>)], gamma: f64) -> Array2<f64> {
        let n = pairs[0].0.len();
        let eye = Array2::<f64>::eye(n);
        let mut h = &eye * gamma;
        for (s, y) in pairs {
            let rho = 1.0 / y.dot(s);
            let s_col = s.view().insert_axis(ndarray::Axis(1));
            let y_col = y.view().insert_axis(ndarray::Axis(1));
            let left = &eye - &(rho * s_col.dot(&y_col.t()));
            let right = &eye - &(rho * y_col.dot(&s_col.t()));
            h = left.dot(&h).dot(&right) + rho * s_col.dot(&s_col.t());
        }
        h
    }

    fn max_abs_diff(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
        a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
    }

    fn sample_pairs() -> Vec<(Array1<f64>, Array1<f64>)> {
        vec![
            (array![1.0, 0.5, -0.2], array![2.0, 0.7, 0.1]),
            (array![-0.3, 1.0, 0.4], array![0.1, 1.5, 0.9]),
            (array![0.2, -0.1, 1.0], array![0.4, 0.2, 3.0]),
        ]
    }

    // --- Standard behaviour ---

    #[test]
    fn test_empty_history_is_identity() {
        let mut lb = Lbfgs::new(LbfgsParams::default(), 3).unwrap();
        let mut q = array![1.0, -2.0, 3.0];
        let applied = lb.apply(&mut q, Sign::Positive).unwrap();
        assert!(!applied);
        assert_eq!(q, array![1.0, -2.0, 3.0]);
    }

    #[test]
    fn test_two_loop_matches_dense_inverse_update() {
        let pairs = sample_pairs();
        let mut lb = Lbfgs::new(LbfgsParams::default(), 3).unwrap();
        for (s, y) in &pairs {
            assert!(lb.update_sy(s, y, 0.0).unwrap());
        }
        let (s_new, y_new) = &pairs[2];
        let gamma = s_new.dot(y_new) / y_new.dot(y_new);
        let h = dense_inverse_bfgs(&pairs, gamma);

        let q0 = array![0.3, -1.2, 0.8];
        let mut q = q0.clone();
        assert!(lb.apply(&mut q, Sign::Positive).unwrap());
        assert_that!(&max_abs_diff(&q, &h.dot(&q0))).is_less_than(1e-12);

        let mut q = q0.clone();
        assert!(lb.apply_scaled(&mut q, 0.5, Sign::Positive).unwrap());
        let h_half = dense_inverse_bfgs(&pairs, 0.5);
        assert_that!(&max_abs_diff(&q, &h_half.dot(&q0))).is_less_than(1e-12);
    }

    #[test]
    fn test_newest_pair_satisfies_secant_condition() {
        let pairs = sample_pairs();
        let mut lb = Lbfgs::new(LbfgsParams::default(), 3).unwrap();
        for (s, y) in &pairs {
            lb.update_sy(s, y, 0.0).unwrap();
        }
        let (s, y) = &pairs[2];
        let mut q = y.clone();
        lb.apply(&mut q, Sign::Positive).unwrap();
        assert_that!(&max_abs_diff(&q, s)).is_less_than(1e-12);
    }

    #[test]
    fn test_window_keeps_at_most_memory_pairs() {
        let mut lb = Lbfgs::new(LbfgsParams::default().with_memory(2), 3).unwrap();
        for (k, (s, y)) in sample_pairs().iter().enumerate() {
            lb.update_sy(s, y, 0.0).unwrap();
            assert_that!(&lb.current_history()).is_equal_to((k + 1).min(2));
        }
        // With the oldest pair evicted, the operator matches the two newest.
        let pairs = sample_pairs();
        let newest = &pairs[1..];
        let gamma = newest[1].0.dot(&newest[1].1) / newest[1].1.dot(&newest[1].1);
        let h = dense_inverse_bfgs(newest, gamma);
        let q0 = array![1.0, 1.0, 1.0];
        let mut q = q0.clone();
        lb.apply(&mut q, Sign::Positive).unwrap();
        assert_that!(&max_abs_diff(&q, &h.dot(&q0))).is_less_than(1e-12);
    }

    #[test]
    fn test_update_builds_pair_from_iterates() {
        let mut lb = Lbfgs::new(LbfgsParams::default(), 2).unwrap();
        let x0 = array![0.0, 0.0];
        let x1 = array![1.0, 2.0];
        let p0 = array![1.0, 1.0];
        let p1 = array![3.0, 2.0];
        assert!(lb.update(&x0, &x1, &p0, &p1, Sign::Positive).unwrap());
        // s = (1, 2), y = (2, 1): H y = s.
        let mut q = array![2.0, 1.0];
        lb.apply(&mut q, Sign::Positive).unwrap();
        assert_that!(&q[0]).is_close_to(1.0, 1e-14);
        assert_that!(&q[1]).is_close_to(2.0, 1e-14);
    }

    #[test]
    fn test_negative_sign_mirrors_positive_sign() {
        // Feeding −p with Sign::Negative stores the same pair, and applying to
        // −q with Sign::Negative gives the same step as applying to q.
        let a = array![[4.0, 1.0], [1.0, 3.0]];
        let x0 = array![1.0, -1.0];
        let x1 = array![0.5, 0.25];
        let p0 = a.dot(&x0);
        let p1 = a.dot(&x1);

        let mut pos = Lbfgs::new(LbfgsParams::default(), 2).unwrap();
        let mut neg = Lbfgs::new(LbfgsParams::default(), 2).unwrap();
        assert!(pos.update(&x0, &x1, &p0, &p1, Sign::Positive).unwrap());
        assert!(neg.update(&x0, &x1, &(-&p0), &(-&p1), Sign::Negative).unwrap());

        let mut q_pos = array![0.7, -0.2];
        let mut q_neg = -&q_pos;
        pos.apply(&mut q_pos, Sign::Positive).unwrap();
        neg.apply(&mut q_neg, Sign::Negative).unwrap();
        assert_that!(&max_abs_diff(&q_pos, &q_neg)).is_less_than(1e-14);
    }

    // --- Rejected pairs ---

    #[test]
    fn test_negative_curvature_is_rejected() {
        let mut lb = Lbfgs::new(LbfgsParams::default(), 2).unwrap();
        let s = array![1.0, 0.0];
        let y = array![-1.0, 0.5];
        assert!(!lb.update_sy(&s, &y, 0.0).unwrap());
        assert_that!(&lb.current_history()).is_equal_to(0);

        let mut indefinite =
            Lbfgs::new(LbfgsParams::default().with_force_pos_def(false), 2).unwrap();
        assert!(indefinite.update_sy(&s, &y, 0.0).unwrap());
        assert_that!(&indefinite.current_history()).is_equal_to(1);
    }

    #[test]
    fn test_degenerate_pairs_are_rejected() {
        let params = LbfgsParams::default();
        // Tiny step.
        assert!(!Lbfgs::update_valid(&params, 1.0, 1e-40, 0.0));
        // Non-finite curvature.
        assert!(!Lbfgs::update_valid(&params, f64::NAN, 1.0, 0.0));
        assert!(!Lbfgs::update_valid(&params, f64::INFINITY, 1.0, 0.0));
        // Curvature below min_div_fac · sᵀs.
        assert!(!Lbfgs::update_valid(&params, 1e-12, 1.0, 0.0));
        assert!(Lbfgs::update_valid(&params, 1e-8, 1.0, 0.0));
    }

    #[test]
    fn test_cautious_condition() {
        let params = LbfgsParams::default().with_cbfgs(1.0, 0.5);
        // yᵀs / sᵀs = 1 against 0.5 ‖p‖: passes for ‖p‖ = 1, fails for ‖p‖ = 4.
        assert!(Lbfgs::update_valid(&params, 1.0, 1.0, 1.0));
        assert!(!Lbfgs::update_valid(&params, 1.0, 1.0, 16.0));

        let mut lb = Lbfgs::new(params, 2).unwrap();
        let x0 = array![0.0, 0.0];
        let x1 = array![1.0, 0.0];
        let p0 = array![0.0, 4.0];
        let p1 = array![1.0, 4.0];
        // yᵀs = 1, sᵀs = 1, ‖p1‖ ≈ 4.12
        assert!(!lb.update(&x0, &x1, &p0, &p1, Sign::Positive).unwrap());
    }

    #[test]
    fn test_rejection_keeps_previous_operator() {
        let mut lb = Lbfgs::new(LbfgsParams::default(), 3).unwrap();
        let pairs = sample_pairs();
        lb.update_sy(&pairs[0].0, &pairs[0].1, 0.0).unwrap();
        let mut before = array![1.0, 2.0, 3.0];
        lb.apply(&mut before, Sign::Positive).unwrap();

        assert!(!lb.update_sy(&array![1.0, 0.0, 0.0], &array![-1.0, 0.0, 0.0], 0.0).unwrap());
        let mut after = array![1.0, 2.0, 3.0];
        lb.apply(&mut after, Sign::Positive).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_forced_update_stores_rejected_pair() {
        let mut lb = Lbfgs::new(LbfgsParams::default(), 2).unwrap();
        let s = array![1.0, 0.0];
        let y = array![-1.0, 0.5];
        assert!(!lb.update_sy(&s, &y, 0.0).unwrap());
        assert!(lb.update_sy_forced(&s, &y).unwrap());
        assert_that!(&lb.current_history()).is_equal_to(1);
        let mut q = y.clone();
        assert!(lb.apply(&mut q, Sign::Positive).unwrap());
        assert_that!(&max_abs_diff(&q, &s)).is_less_than(1e-14);

        // Same pair built from iterates: yᵀs = −1.
        let mut lb = Lbfgs::new(LbfgsParams::default(), 2).unwrap();
        let x0 = array![0.0, 0.0];
        let x1 = array![1.0, 0.0];
        let p0 = array![0.0, 0.0];
        let p1 = array![-1.0, 0.5];
        assert!(!lb.update(&x0, &x1, &p0, &p1, Sign::Positive).unwrap());
        assert!(lb.update_forced(&x0, &x1, &p0, &p1, Sign::Positive).unwrap());
        assert_that!(&lb.current_history()).is_equal_to(1);
    }

    // --- Masked application ---

    #[test]
    fn test_masked_apply_with_all_indices_matches_apply() {
        let mut lb = Lbfgs::new(LbfgsParams::default(), 3).unwrap();
        for (s, y) in sample_pairs() {
            lb.update_sy(&s, &y, 0.0).unwrap();
        }
        let mut full = array![0.4, 0.1, -0.9];
        let mut masked = full.clone();
        lb.apply(&mut full, Sign::Positive).unwrap();
        assert!(lb.apply_masked(&mut masked, None, &[0, 1, 2], Sign::Positive).unwrap());
        assert_that!(&max_abs_diff(&full, &masked)).is_less_than(1e-14);
    }

    #[test]
    fn test_masked_apply_matches_restricted_problem() {
        let pairs = sample_pairs();
        let indices = [0, 2];
        let restrict = |v: &Array1<f64>| Array1::from_iter(indices.iter().map(|&j| v[j]));

        let mut lb = Lbfgs::new(LbfgsParams::default(), 3).unwrap();
        let mut sub = Lbfgs::new(LbfgsParams::default(), 2).unwrap();
        for (s, y) in &pairs {
            lb.update_sy(s, y, 0.0).unwrap();
            sub.update_sy(&restrict(s), &restrict(y), 0.0).unwrap();
        }
        assert_that!(&sub.current_history()).is_equal_to(3);

        let mut q = array![0.5, 7.0, -1.5];
        assert!(lb.apply_masked(&mut q, None, &indices, Sign::Positive).unwrap());
        let mut q_sub = array![0.5, -1.5];
        sub.apply(&mut q_sub, Sign::Positive).unwrap();

        assert_that!(&q[0]).is_close_to(q_sub[0], 1e-13);
        assert_that!(&q[2]).is_close_to(q_sub[1], 1e-13);
        // Coordinates outside the mask are untouched.
        assert_that!(&q[1]).is_equal_to(7.0);
    }

    #[test]
    fn test_masked_apply_skips_pairs_invalid_on_subset() {
        // On index 1 alone, yᵀs < 0 for the first pair: only the second is used.
        let mut lb = Lbfgs::new(LbfgsParams::default(), 2).unwrap();
        lb.update_sy(&array![1.0, 1.0], &array![3.0, -1.0], 0.0).unwrap();
        lb.update_sy(&array![0.0, 2.0], &array![0.0, 1.0], 0.0).unwrap();
        let mut q = array![5.0, 4.0];
        assert!(lb.apply_masked(&mut q, None, &[1], Sign::Positive).unwrap());
        // One pair in one dimension: H = s / y = 2.
        assert_that!(&q[1]).is_close_to(8.0, 1e-14);
        assert_that!(&q[0]).is_equal_to(5.0);

        // No valid pair on index 0.
        let mut lb = Lbfgs::new(LbfgsParams::default(), 2).unwrap();
        lb.update_sy(&array![1.0, 1.0], &array![-1.0, 3.0], 0.0).unwrap();
        let mut q = array![5.0, 4.0];
        assert!(!lb.apply_masked(&mut q, None, &[0], Sign::Positive).unwrap());
    }

    #[test]
    fn test_masked_apply_ignores_cautious_condition() {
        // With alpha < 0 the cautious threshold at ‖p‖ = 0 is infinite, so the
        // masked path must not evaluate it.
        let mut lb = Lbfgs::new(LbfgsParams::default().with_cbfgs(-2.0, 1.0), 2).unwrap();
        // yᵀs / sᵀs = 2 against ‖p‖⁻² = 1.
        assert!(lb.update_sy(&array![1.0, 0.0], &array![2.0, 0.0], 1.0).unwrap());

        let mut full = array![3.0, 4.0];
        let mut masked = full.clone();
        assert!(lb.apply(&mut full, Sign::Positive).unwrap());
        assert!(lb.apply_masked(&mut masked, None, &[0, 1], Sign::Positive).unwrap());
        assert_that!(&max_abs_diff(&full, &masked)).is_less_than(1e-14);
        assert_that!(&full[0]).is_close_to(1.5, 1e-14);
        assert_that!(&full[1]).is_close_to(2.0, 1e-14);

        let mut q = array![3.0, 4.0];
        assert!(lb.apply_masked(&mut q, None, &[0], Sign::Positive).unwrap());
        assert_that!(&q[0]).is_close_to(1.5, 1e-14);
        assert_that!(&q[1]).is_equal_to(4.0);
    }

    #[test]
    fn test_masked_apply_with_repeated_index_keeps_other_entries() {
        // Three indices for n = 3, but not the full set: entry 2 stays put.
        let mut lb = Lbfgs::new(LbfgsParams::default(), 3).unwrap();
        for (s, y) in sample_pairs() {
            lb.update_sy(&s, &y, 0.0).unwrap();
        }
        let mut q = array![0.4, 0.1, -0.9];
        assert!(lb.apply_masked(&mut q, None, &[0, 0, 1], Sign::Positive).unwrap());
        assert_that!(&q[2]).is_equal_to(-0.9);
    }

    #[test]
    fn test_masked_apply_rejects_out_of_range_index() {
        let mut lb = Lbfgs::new(LbfgsParams::default(), 2).unwrap();
        let mut q = array![1.0, 2.0];
        assert_eq!(
            lb.apply_masked(&mut q, None, &[0, 2], Sign::Positive),
            Err(AccelError::IndexOutOfBounds { index: 2, n: 2 })
        );
    }

    // --- Lifecycle and configuration ---

    #[test]
    fn test_scale_y_rescales_operator() {
        let mut lb = Lbfgs::new(LbfgsParams::default(), 3).unwrap();
        for (s, y) in sample_pairs() {
            lb.update_sy(&s, &y, 0.0).unwrap();
        }
        let mut before = array![1.0, -1.0, 2.0];
        lb.apply(&mut before, Sign::Positive).unwrap();
        lb.scale_y(2.0);
        let mut after = array![1.0, -1.0, 2.0];
        lb.apply(&mut after, Sign::Positive).unwrap();
        assert_that!(&max_abs_diff(&after, &(0.5 * &before))).is_less_than(1e-13);
    }

    #[test]
    fn test_reset_and_errors() {
        let mut lb = Lbfgs::new(LbfgsParams::default(), 3).unwrap();
        for (s, y) in sample_pairs() {
            lb.update_sy(&s, &y, 0.0).unwrap();
        }
        lb.reset();
        assert_that!(&lb.current_history()).is_equal_to(0);
        let mut q = array![1.0, 2.0];
        assert!(matches!(
            lb.apply(&mut q, Sign::Positive),
            Err(AccelError::DimensionMismatch { name: "q", expected: 3, found: 2 })
        ));
        let mut q = array![1.0, 2.0, 3.0];
        assert!(matches!(
            lb.apply_scaled(&mut q, -1.0, Sign::Positive),
            Err(AccelError::InvalidParameter { name: "gamma", .. })
        ));
        assert!(matches!(
            Lbfgs::new(LbfgsParams::default().with_min_div_fac(f64::NAN), 3),
            Err(AccelError::InvalidParameter { name: "min_div_fac", .. })
        ));
    }

    #[test]
    fn test_zero_memory_stores_nothing() {
        let mut lb = Lbfgs::new(LbfgsParams::default().with_memory(0), 2).unwrap();
        assert!(!lb.update_sy(&array![1.0, 0.0], &array![1.0, 0.0], 0.0).unwrap());
        assert_that!(&lb.current_history()).is_equal_to(0);
        let mut q = array![3.0, 4.0];
        assert!(!lb.apply(&mut q, Sign::Positive).unwrap());
        assert_eq!(q, array![3.0, 4.0]);
    }

    #[test]
    fn test_params_deserialize_with_defaults() {
        let params: LbfgsParams =
            serde_json::from_str(r#"{"memory": 4, "cbfgs": {"epsilon": 1e-6}}"#).unwrap();
        assert_that!(&params.memory).is_equal_to(4);
        assert_that!(&params.cbfgs.alpha).is_equal_to(1.0);
        assert!(params.cbfgs.is_enabled());
        assert!(params.force_pos_def);
    }
}
