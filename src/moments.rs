//! Moment functions: maps from a sample value to a vector of basis
//! evaluations over a bounded domain.
//!
//! Every basis has the constant 1 as its first function; the estimators rely
//! on that to check their inputs.

use std::f64::consts::PI;
use std::fmt;

use ndarray::{Array1, Array2};

use crate::error::{EstimateError, Result};

/// A moment basis of fixed size over a domain `(a, b)`.
pub trait Moments: fmt::Debug + Send + Sync {
    /// Number of basis functions `R`.
    fn size(&self) -> usize;

    /// Support interval the basis is scaled to.
    fn domain(&self) -> (f64, f64);

    /// Evaluates all `R` basis functions at `value`.
    fn eval(&self, value: f64) -> Array1<f64>;

    /// Evaluates the basis at every value, one row per value.
    fn eval_all(&self, values: &[f64]) -> Array2<f64> {
        let mut out = Array2::zeros((values.len(), self.size()));
        for (mut row, &x) in out.rows_mut().into_iter().zip(values) {
            row.assign(&self.eval(x));
        }
        out
    }
}

/// Affine (optionally logarithmic) map from the user domain to the
/// reference interval of a basis.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Transform {
    domain: (f64, f64),
    log: bool,
}

impl Transform {
    fn new(domain: (f64, f64), log: bool) -> Result<Self> {
        let (a, b) = domain;
        if !(a.is_finite() && b.is_finite() && a < b) {
            return Err(EstimateError::InvalidParameter(format!(
                "moment domain ({}, {}) must be a finite non-empty interval",
                a, b
            )));
        }
        if log && a <= 0.0 {
            return Err(EstimateError::InvalidParameter(format!(
                "log-scaled moment domain must be positive, got ({}, {})",
                a, b
            )));
        }
        Ok(Self { domain, log })
    }

    fn scale(&self, value: f64) -> f64 {
        if self.log {
            value.max(f64::MIN_POSITIVE).ln()
        } else {
            value
        }
    }

    /// Position of `value` in the domain as a fraction in `[0, 1]` (outside
    /// for values off the domain).
    fn unit(&self, value: f64) -> f64 {
        let lo = self.scale(self.domain.0);
        let hi = self.scale(self.domain.1);
        (self.scale(value) - lo) / (hi - lo)
    }

    fn symmetric(&self, value: f64) -> f64 {
        2.0 * self.unit(value) - 1.0
    }
}

pub(crate) fn check_size(size: usize) -> Result<()> {
    if size == 0 {
        return Err(EstimateError::InvalidParameter(
            "moments need at least the constant function".to_string(),
        ));
    }
    Ok(())
}

macro_rules! domain_accessors {
    ($ty:ident) => {
        impl $ty {
            /// Basis on a log-scaled domain (the map is applied to `ln x`).
            pub fn with_log(size: usize, domain: (f64, f64)) -> Result<Self> {
                check_size(size)?;
                Ok(Self {
                    size,
                    transform: Transform::new(domain, true)?,
                })
            }

            /// Moves the basis to a new domain. Cached evaluations made with the
            /// old domain are no longer used by the levels.
            pub fn set_domain(&mut self, domain: (f64, f64)) -> Result<()> {
                self.transform = Transform::new(domain, self.transform.log)?;
                Ok(())
            }

            pub fn is_log(&self) -> bool {
                self.transform.log
            }
        }
    };
}

/// Legendre polynomials on the domain mapped to `[-1, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Legendre {
    size: usize,
    transform: Transform,
}

impl Legendre {
    pub fn new(size: usize, domain: (f64, f64)) -> Result<Self> {
        check_size(size)?;
        Ok(Self {
            size,
            transform: Transform::new(domain, false)?,
        })
    }
}

domain_accessors!(Legendre);

impl Moments for Legendre {
    fn size(&self) -> usize {
        self.size
    }

    fn domain(&self) -> (f64, f64) {
        self.transform.domain
    }

    fn eval(&self, value: f64) -> Array1<f64> {
        let t = self.transform.symmetric(value);
        let mut out = Array1::zeros(self.size);
        out[0] = 1.0;
        if self.size > 1 {
            out[1] = t;
        }
        // (k + 1) P_{k+1} = (2k + 1) t P_k - k P_{k-1}
        for k in 1..self.size.saturating_sub(1) {
            let kf = k as f64;
            out[k + 1] = ((2.0 * kf + 1.0) * t * out[k] - kf * out[k - 1]) / (kf + 1.0);
        }
        out
    }
}

/// Powers `t^r` of the value mapped to `[-1, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Monomial {
    size: usize,
    transform: Transform,
}

impl Monomial {
    pub fn new(size: usize, domain: (f64, f64)) -> Result<Self> {
        check_size(size)?;
        Ok(Self {
            size,
            transform: Transform::new(domain, false)?,
        })
    }
}

domain_accessors!(Monomial);

impl Moments for Monomial {
    fn size(&self) -> usize {
        self.size
    }

    fn domain(&self) -> (f64, f64) {
        self.transform.domain
    }

    fn eval(&self, value: f64) -> Array1<f64> {
        let t = self.transform.symmetric(value);
        let mut out = Array1::zeros(self.size);
        out[0] = 1.0;
        for r in 1..self.size {
            out[r] = out[r - 1] * t;
        }
        out
    }
}

/// Trigonometric basis `1, cos t, sin t, cos 2t, sin 2t, ...` with the
/// domain mapped to `[0, 2π]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Fourier {
    size: usize,
    transform: Transform,
}

impl Fourier {
    pub fn new(size: usize, domain: (f64, f64)) -> Result<Self> {
        check_size(size)?;
        Ok(Self {
            size,
            transform: Transform::new(domain, false)?,
        })
    }
}

domain_accessors!(Fourier);

impl Moments for Fourier {
    fn size(&self) -> usize {
        self.size
    }

    fn domain(&self) -> (f64, f64) {
        self.transform.domain
    }

    fn eval(&self, value: f64) -> Array1<f64> {
        let t = 2.0 * PI * self.transform.unit(value);
        let mut out = Array1::zeros(self.size);
        out[0] = 1.0;
        for r in 1..self.size {
            let k = ((r + 1) / 2) as f64;
            out[r] = if r % 2 == 1 { (k * t).cos() } else { (k * t).sin() };
        }
        out
    }
}
