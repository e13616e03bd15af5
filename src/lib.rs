//! Limited-memory accelerators for fixed-point and quasi-Newton iterations.
//!
//! This crate provides the building blocks an outer solver loop needs to speed
//! up convergence without ever forming a Jacobian or Hessian:
//!
//! - [`AndersonAccel`]: Anderson acceleration of a fixed-point map `g`,
//!   mixing the last `m` iterates through a least-squares problem on residual
//!   differences.
//! - [`Lbfgs`]: limited-memory BFGS, applying the two-loop recursion to turn a
//!   residual or gradient into a quasi-Newton step.
//! - [`BroydenGood`]: Broyden's "good" method, with the inverse Jacobian kept
//!   as a sequence of rank-1 terms.
//!
//! Each accelerator is an incremental state machine: the caller owns the loop,
//! evaluates its own map/residual, and feeds vectors in. All history lives in
//! a fixed-capacity [`window::Window`] allocated at construction.
//!
//! # Features
//! - Strict sliding windows: at capacity the oldest entry is evicted.
//! - Rank-deficient Anderson least squares are solved in the minimum-norm
//!   sense through a truncated SVD.
//! - L-BFGS pairs failing the curvature (or cautious BFGS) test are skipped,
//!   and Broyden terms with a vanishing denominator are rejected; both report
//!   this through a `bool` rather than an error.
//! - Parameter structs are plain data with builder methods, and deserialize
//!   from partial configuration maps via `serde`.
//! - Diagnostics go through the `log` facade.
//!
//! # Example
//!
//! Solve the linear system `A x = b` with Anderson acceleration on the map
//! `g(x) = x + (A x − b)`.
//!
//! ```
//! use lm_accel::{AndersonAccel, AndersonParams};
//! use ndarray::{array, Array1};
//!
//! let a = array![[20.0, -10.0], [-10.0, 30.0]];
//! let b = array![10.0, 20.0];
//!
//! let mut aa = AndersonAccel::new(AndersonParams::default().with_memory(2), 2).unwrap();
//! let mut x: Array1<f64> = b.clone();
//! for k in 0..5 {
//!     let r = a.dot(&x) - &b;
//!     let g = &x + &r;
//!     x = if k == 0 {
//!         aa.initialize(&g, &r).unwrap();
//!         g
//!     } else {
//!         aa.compute(&g, &r).unwrap()
//!     };
//! }
//!
//! assert!((x[0] - 1.0).abs() < 1e-10);
//! assert!((x[1] - 1.0).abs() < 1e-10);
//! ```

use ndarray::Array1;

pub mod anderson;
pub mod broyden;
pub mod lbfgs;
mod lstsq;
pub mod window;

pub use anderson::{AndersonAccel, AndersonParams};
pub use broyden::{BroydenGood, BroydenParams};
pub use lbfgs::{CbfgsParams, Lbfgs, LbfgsParams, Sign};

/// An error type for contract violations by the caller.
///
/// Numerical trouble (rank deficiency, rejected curvature pairs) is never an
/// error; it is absorbed by the accelerator and reported through return values
/// and log records.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AccelError {
    #[error("The problem dimension must be at least 1.")]
    ZeroDimension,
    #[error("Vector `{name}` has {found} entries, but the accelerator was built for dimension {expected}.")]
    DimensionMismatch {
        /// The argument that had the wrong length.
        name: &'static str,
        /// The accelerator's dimension.
        expected: usize,
        /// The length that was passed.
        found: usize,
    },
    #[error("`compute` was called before `initialize`.")]
    NotInitialized,
    #[error("Index {index} is out of bounds for dimension {n}.")]
    IndexOutOfBounds { index: usize, n: usize },
    #[error("Invalid parameter `{name}`: {reason}")]
    InvalidParameter {
        name: &'static str,
        reason: &'static str,
    },
}

pub(crate) fn check_len(name: &'static str, v: &Array1<f64>, n: usize) -> Result<(), AccelError> {
    if v.len() == n {
        Ok(())
    } else {
        Err(AccelError::DimensionMismatch {
            name,
            expected: n,
            found: v.len(),
        })
    }
}

pub(crate) fn check_dimension(n: usize) -> Result<(), AccelError> {
    if n == 0 {
        Err(AccelError::ZeroDimension)
    } else {
        Ok(())
    }
}

// Tolerances must be finite and non-negative.
pub(crate) fn check_tolerance(name: &'static str, value: f64) -> Result<(), AccelError> {
    if !value.is_finite() {
        Err(AccelError::InvalidParameter {
            name,
            reason: "must be finite",
        })
    } else if value < 0.0 {
        Err(AccelError::InvalidParameter {
            name,
            reason: "must be non-negative",
        })
    } else {
        Ok(())
    }
}
