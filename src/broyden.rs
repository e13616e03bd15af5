//! Broyden's "good" method with a limited-memory inverse Jacobian.
//!
//! The inverse Jacobian estimate starts at `H₀ = I` and is updated by
//!
//! ```text
//! H⁺ = H + (s − H y) sᵀ H / sᵀ H y
//! ```
//!
//! Writing `s̃ = (s − H y) / sᵀ H y`, the product `H q` is the fold
//! `q ← q + s̃_i (s_iᵀ q)` over the stored terms, oldest first, so only the
//! pairs `(s_i, s̃_i)` are kept.
//!
//! Each `s̃` depends on the terms stored before it. When the window is full,
//! `H y` for the incoming pair is therefore computed without the term about
//! to be evicted, which keeps the secant condition `H⁺ y = s` exact for the
//! newest pair.

use ndarray::{Array1, Zip};
use serde::{Deserialize, Serialize};

use crate::window::Window;
use crate::{check_dimension, check_len, check_tolerance, AccelError};

/// Parameters for [`BroydenGood`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroydenParams {
    /// Number of rank-1 terms kept.
    pub memory: usize,
    /// Reject an update when `|sᵀHy| < min_div_abs`.
    pub min_div_abs: f64,
    /// Use the signed `sᵀHy` in the rejection test and in damping, keeping
    /// the estimate definite.
    pub force_pos_def: bool,
    /// Clear the window once it is full instead of evicting the oldest term.
    pub restarted: bool,
    /// Powell damping factor `θ̄ ∈ [0, 1)`. Zero disables damping.
    pub powell_damping_factor: f64,
    /// Lower bound on `|γ|` for the scaling used by
    /// [`BroydenGood::apply_scaled`].
    pub min_stepsize: f64,
}

impl Default for BroydenParams {
    fn default() -> Self {
        Self {
            memory: 10,
            min_div_abs: 1e-32,
            force_pos_def: false,
            restarted: false,
            powell_damping_factor: 0.0,
            min_stepsize: 1e-10,
        }
    }
}

impl BroydenParams {
    pub fn with_memory(mut self, memory: usize) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_min_div_abs(mut self, min_div_abs: f64) -> Self {
        self.min_div_abs = min_div_abs;
        self
    }

    pub fn with_force_pos_def(mut self, force_pos_def: bool) -> Self {
        self.force_pos_def = force_pos_def;
        self
    }

    pub fn with_restarted(mut self, restarted: bool) -> Self {
        self.restarted = restarted;
        self
    }

    pub fn with_powell_damping(mut self, factor: f64) -> Self {
        self.powell_damping_factor = factor;
        self
    }

    pub fn with_min_stepsize(mut self, min_stepsize: f64) -> Self {
        self.min_stepsize = min_stepsize;
        self
    }

    fn validate(&self) -> Result<(), AccelError> {
        check_tolerance("min_div_abs", self.min_div_abs)?;
        check_tolerance("min_stepsize", self.min_stepsize)?;
        check_tolerance("powell_damping_factor", self.powell_damping_factor)?;
        if self.powell_damping_factor >= 1.0 {
            return Err(AccelError::InvalidParameter {
                name: "powell_damping_factor",
                reason: "must be less than 1",
            });
        }
        Ok(())
    }

    // Scale applied to s − Hy, 1 / sᵀHy without damping.
    fn damping(&self, s_hy: f64, ss: f64) -> f64 {
        let theta_bar = self.powell_damping_factor;
        if theta_bar == 0.0 {
            return 1.0 / s_hy;
        }
        let gamma = s_hy / ss;
        let sgn = if gamma >= 0.0 { 1.0 } else { -1.0 };
        let (gamma_theta, a_gamma) = if self.force_pos_def {
            (gamma * theta_bar, gamma)
        } else {
            (sgn * theta_bar, gamma.abs())
        };
        let theta = if a_gamma >= theta_bar {
            1.0
        } else {
            (1.0 - gamma_theta) / (1.0 - gamma)
        };
        theta / (ss * (1.0 - theta + theta * gamma))
    }
}

#[derive(Debug, Clone)]
struct RankOneTerm {
    s: Array1<f64>,
    s_tilde: Array1<f64>,
}

/// Broyden "good" state.
#[derive(Debug, Clone)]
pub struct BroydenGood {
    params: BroydenParams,
    n: usize,
    history: Window<RankOneTerm>,
    // s of the pending update, and y folded into H y.
    step: Array1<f64>,
    work: Array1<f64>,
    // sᵀy / yᵀy of the newest stored pair.
    latest_gamma: Option<f64>,
}

impl BroydenGood {
    pub fn new(params: BroydenParams, n: usize) -> Result<Self, AccelError> {
        check_dimension(n)?;
        params.validate()?;
        Ok(Self {
            history: Window::from_fn(params.memory, || RankOneTerm {
                s: Array1::zeros(n),
                s_tilde: Array1::zeros(n),
            }),
            params,
            n,
            step: Array1::zeros(n),
            work: Array1::zeros(n),
            latest_gamma: None,
        })
    }

    /// Updates the estimate with `s = x_new − x_prev`, `y = p_new − p_prev`.
    /// Returns whether a term was stored.
    pub fn update(
        &mut self,
        x_prev: &Array1<f64>,
        x_new: &Array1<f64>,
        p_prev: &Array1<f64>,
        p_new: &Array1<f64>,
    ) -> Result<bool, AccelError> {
        self.load_step(x_prev, x_new, p_prev, p_new)?;
        Ok(self.store_step(false))
    }

    /// Same as [`update`](Self::update), but ignores `min_div_abs`. A
    /// non-finite or zero `sᵀHy` is still rejected.
    pub fn update_forced(
        &mut self,
        x_prev: &Array1<f64>,
        x_new: &Array1<f64>,
        p_prev: &Array1<f64>,
        p_new: &Array1<f64>,
    ) -> Result<bool, AccelError> {
        self.load_step(x_prev, x_new, p_prev, p_new)?;
        Ok(self.store_step(true))
    }

    /// Same as [`update`](Self::update) with the differences given directly.
    pub fn update_sy(&mut self, s: &Array1<f64>, y: &Array1<f64>) -> Result<bool, AccelError> {
        self.load_sy(s, y)?;
        Ok(self.store_step(false))
    }

    /// Same as [`update_forced`](Self::update_forced) with the differences
    /// given directly.
    pub fn update_sy_forced(
        &mut self,
        s: &Array1<f64>,
        y: &Array1<f64>,
    ) -> Result<bool, AccelError> {
        self.load_sy(s, y)?;
        Ok(self.store_step(true))
    }

    fn load_step(
        &mut self,
        x_prev: &Array1<f64>,
        x_new: &Array1<f64>,
        p_prev: &Array1<f64>,
        p_new: &Array1<f64>,
    ) -> Result<(), AccelError> {
        check_len("x_prev", x_prev, self.n)?;
        check_len("x_new", x_new, self.n)?;
        check_len("p_prev", p_prev, self.n)?;
        check_len("p_new", p_new, self.n)?;
        Zip::from(&mut self.step)
            .and(&mut self.work)
            .and(x_prev)
            .and(x_new)
            .and(p_prev)
            .and(p_new)
            .for_each(|s, y, &xp, &xn, &pp, &pn| {
                *s = xn - xp;
                *y = pn - pp;
            });
        Ok(())
    }

    fn load_sy(&mut self, s: &Array1<f64>, y: &Array1<f64>) -> Result<(), AccelError> {
        check_len("s", s, self.n)?;
        check_len("y", y, self.n)?;
        self.step.assign(s);
        self.work.assign(y);
        Ok(())
    }

    // Expects s in `step` and y in `work`.
    fn store_step(&mut self, forced: bool) -> bool {
        if self.history.capacity() == 0 {
            return false;
        }
        let gamma = self.step.dot(&self.work) / self.work.dot(&self.work);
        let mut skip = 0;
        if self.history.is_full() {
            if self.params.restarted {
                log::debug!(
                    "[Broyden] History full after {} terms; restarting from the identity.",
                    self.history.len()
                );
                self.history.clear();
            } else {
                skip = 1;
            }
        }

        for term in self.history.iter().skip(skip) {
            let c = self.work.dot(&term.s);
            self.work.scaled_add(c, &term.s_tilde);
        }
        let s_hy = self.step.dot(&self.work);
        let a_s_hy = if self.params.force_pos_def {
            s_hy
        } else {
            s_hy.abs()
        };
        let too_small = if forced {
            a_s_hy == 0.0
        } else {
            a_s_hy < self.params.min_div_abs
        };
        if !a_s_hy.is_finite() || too_small {
            log::debug!("[Broyden] Rejected update: sᵀHy = {:.3e}.", s_hy);
            return false;
        }

        let damp = self.params.damping(s_hy, self.step.dot(&self.step));
        let step = &self.step;
        let work = &self.work;
        self.history.push_with(|term| {
            term.s.assign(step);
            Zip::from(&mut term.s_tilde)
                .and(step)
                .and(work)
                .for_each(|t, &s, &hy| *t = damp * (s - hy));
        });
        if gamma.is_finite() {
            let min_stepsize = self.params.min_stepsize;
            self.latest_gamma = Some(if gamma.abs() < min_stepsize {
                min_stepsize.copysign(gamma)
            } else {
                gamma
            });
        }
        log::trace!(
            "[Broyden] {} of {} terms stored.",
            self.history.len(),
            self.history.capacity()
        );
        true
    }

    /// Overwrites `q` with `H q`. Returns `false` and leaves `q` untouched
    /// when no terms are stored.
    pub fn apply(&self, q: &mut Array1<f64>) -> Result<bool, AccelError> {
        check_len("q", q, self.n)?;
        if self.history.is_empty() {
            return Ok(false);
        }
        self.fold(q);
        Ok(true)
    }

    /// Same as [`apply`](Self::apply) with `H₀ = γ I`. With `gamma = None`,
    /// `γ = sᵀy / yᵀy` of the newest stored pair, bounded away from zero by
    /// `min_stepsize`.
    ///
    /// The terms were built from `H₀ = I`, so this rescales the input of the
    /// fold rather than rebuilding the estimate.
    pub fn apply_scaled(
        &self,
        q: &mut Array1<f64>,
        gamma: Option<f64>,
    ) -> Result<bool, AccelError> {
        check_len("q", q, self.n)?;
        if let Some(gamma) = gamma {
            if !gamma.is_finite() || gamma <= 0.0 {
                return Err(AccelError::InvalidParameter {
                    name: "gamma",
                    reason: "must be finite and positive",
                });
            }
        }
        if self.history.is_empty() {
            return Ok(false);
        }
        let gamma = gamma.or(self.latest_gamma).unwrap_or(1.0);
        if gamma != 1.0 {
            *q *= gamma;
        }
        self.fold(q);
        Ok(true)
    }

    fn fold(&self, q: &mut Array1<f64>) {
        for term in &self.history {
            let c = q.dot(&term.s);
            q.scaled_add(c, &term.s_tilde);
        }
    }

    /// Drops all stored terms, returning the estimate to the identity.
    pub fn reset(&mut self) {
        self.history.clear();
        self.latest_gamma = None;
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

    pub fn params(&self) -> &BroydenParams {
        &self.params
    }
}
