//! Anderson acceleration of fixed-point iterations.
//!
//! For a map `g` with fixed point `x* = g(x*)` and residual `r(x) = g(x) − x`
//! (or any residual that vanishes at the solution), each step mixes the
//! newest `g` with the previous `mk` map values:
//!
//! ```text
//! γ      = argmin ‖ΔR γ − r_k‖₂,   ΔR = [Δr_{k−mk+1} … Δr_k],  Δr_j = r_j − r_{j−1}
//! α_0    = γ_0
//! α_j    = γ_j − γ_{j−1}           0 < j < mk
//! α_mk   = 1 − γ_{mk−1}
//! x_k+1  = Σ_j α_j g_{k−mk+j}
//! ```
//!
//! which is the residual-difference form of minimizing `‖Σ α_j r_j‖` subject to
//! `Σ α_j = 1`.

use ndarray::{s, Array1, Array2, Zip};
use serde::{Deserialize, Serialize};

use crate::lstsq::solve_min_norm;
use crate::window::Window;
use crate::{check_dimension, check_len, check_tolerance, AccelError};

/// Parameters for [`AndersonAccel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AndersonParams {
    /// Number of residual differences kept. Values above the problem
    /// dimension are clamped to it, since the least-squares problem would be
    /// underdetermined.
    pub memory: usize,
    /// Relative cutoff on singular values of the residual-difference matrix.
    /// `None` uses `max(n, mk) · ε`.
    pub rcond: Option<f64>,
}

impl Default for AndersonParams {
    fn default() -> Self {
        Self {
            memory: 10,
            rcond: None,
        }
    }
}

impl AndersonParams {
    /// Sets the history length (default: 10).
    pub fn with_memory(mut self, memory: usize) -> Self {
        self.memory = memory;
        self
    }

    /// Sets the singular value cutoff of the least-squares solve.
    pub fn with_rcond(mut self, rcond: f64) -> Self {
        self.rcond = Some(rcond);
        self
    }
}

// One history entry: the map value that preceded a residual difference.
#[derive(Debug, Clone)]
struct MixEntry {
    g: Array1<f64>,
    dr: Array1<f64>,
}

/// Anderson acceleration state.
///
/// Call [`initialize`](Self::initialize) with the first map value and
/// residual, then [`compute`](Self::compute) once per iteration.
#[derive(Debug, Clone)]
pub struct AndersonAccel {
    params: AndersonParams,
    n: usize,
    history: Window<MixEntry>,
    g_last: Array1<f64>,
    r_last: Array1<f64>,
    initialized: bool,
    // Least-squares scratch: ΔR copy (n × m), rotations (m × m), γ (m).
    lhs: Array2<f64>,
    rot: Array2<f64>,
    gamma: Array1<f64>,
}

impl AndersonAccel {
    /// Creates an accelerator for vectors of length `n`.
    pub fn new(params: AndersonParams, n: usize) -> Result<Self, AccelError> {
        check_dimension(n)?;
        if let Some(rcond) = params.rcond {
            check_tolerance("rcond", rcond)?;
        }
        let m = params.memory.min(n);
        Ok(Self {
            params,
            n,
            history: Window::from_fn(m, || MixEntry {
                g: Array1::zeros(n),
                dr: Array1::zeros(n),
            }),
            g_last: Array1::zeros(n),
            r_last: Array1::zeros(n),
            initialized: false,
            lhs: Array2::zeros((n, m)),
            rot: Array2::zeros((m, m)),
            gamma: Array1::zeros(m),
        })
    }

    /// Starts a run at map value `g0` with residual `r0`, discarding any
    /// history from a previous run.
    pub fn initialize(&mut self, g0: &Array1<f64>, r0: &Array1<f64>) -> Result<(), AccelError> {
        check_len("g0", g0, self.n)?;
        check_len("r0", r0, self.n)?;
        self.history.clear();
        self.g_last.assign(g0);
        self.r_last.assign(r0);
        self.initialized = true;
        Ok(())
    }

    /// Returns the accelerated next iterate given `g = g(x_k)` and the
    /// residual `r` of the current iterate.
    pub fn compute(&mut self, g: &Array1<f64>, r: &Array1<f64>) -> Result<Array1<f64>, AccelError> {
        let mut out = Array1::zeros(self.n);
        self.compute_into(g, r, &mut out)?;
        Ok(out)
    }

    /// Same as [`compute`](Self::compute), writing the iterate into `out`.
    pub fn compute_into(
        &mut self,
        g: &Array1<f64>,
        r: &Array1<f64>,
        out: &mut Array1<f64>,
    ) -> Result<(), AccelError> {
        if !self.initialized {
            return Err(AccelError::NotInitialized);
        }
        check_len("g", g, self.n)?;
        check_len("r", r, self.n)?;
        check_len("out", out, self.n)?;

        let g_last = &self.g_last;
        let r_last = &self.r_last;
        self.history.push_with(|entry| {
            entry.g.assign(g_last);
            Zip::from(&mut entry.dr)
                .and(r)
                .and(r_last)
                .for_each(|d, &rk, &rp| *d = rk - rp);
        });

        let mk = self.history.len();
        if mk == 0 {
            out.assign(g);
        } else {
            self.mix(g, r, mk, out);
        }

        self.g_last.assign(g);
        self.r_last.assign(r);
        Ok(())
    }

    fn mix(&mut self, g: &Array1<f64>, r: &Array1<f64>, mk: usize, out: &mut Array1<f64>) {
        for (j, entry) in self.history.iter().enumerate() {
            self.lhs.column_mut(j).assign(&entry.dr);
        }
        let info = solve_min_norm(
            self.lhs.slice_mut(s![.., ..mk]),
            self.rot.slice_mut(s![..mk, ..mk]),
            r.view(),
            self.gamma.slice_mut(s![..mk]),
            self.params.rcond,
        );
        if info.rank < mk {
            log::debug!(
                "[Anderson] Residual differences are rank deficient (rank {} of {}); using the minimum-norm mix.",
                info.rank,
                mk
            );
        }
        log::trace!(
            "[Anderson] mk = {}, Jacobi sweeps = {}",
            mk,
            info.sweeps
        );

        let gamma = &self.gamma;
        out.assign(g);
        *out *= 1.0 - gamma[mk - 1];
        for (j, entry) in self.history.iter().enumerate() {
            let alpha = if j == 0 { gamma[0] } else { gamma[j] - gamma[j - 1] };
            out.scaled_add(alpha, &entry.g);
        }
    }

    /// Clears the history but keeps the last map value and residual, so the
    /// next [`compute`](Self::compute) continues from them without a call to
    /// [`initialize`](Self::initialize).
    pub fn reset(&mut self) {
        self.history.clear();
    }

    /// The problem dimension.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Maximum number of residual differences kept, after clamping to `n`.
    pub fn history(&self) -> usize {
        self.history.capacity()
    }

    /// Number of residual differences currently stored.
    pub fn current_history(&self) -> usize {
        self.history.len()
    }

    pub fn params(&self) -> &AndersonParams {
        &self.params
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}
