//! Weight initialization schemes.
//!
//! Only `orthogonal`, `gaussian` and `uniform` are wired up. The remaining tags
//! are accepted by the parser so that configurations naming them are recognised,
//! but building a function with one of them fails with [`TPError::NotImplemented`].

use ndarray::Array2;
use ndarray_rand::rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;
use rand::Rng;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use super::{TPError, TPResult};
use crate::utils::orthonormalize_columns;

/// Standard deviation of the `gaussian` scheme.
pub const GAUSSIAN_STD: f32 = 1e-3;
/// Half-width of the `uniform` scheme.
pub const UNIFORM_LIMIT: f32 = 1e-2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Init {
    Orthogonal,
    Gaussian,
    Uniform,
    Eye,
    Constant,
    /// `rank-k`
    LowRank(usize),
    /// `same`: copy the peer function's weight
    CopyFromPeer,
    /// `orthogonal-k`, `eye-k`, ...: kept verbatim
    Indexed(String),
}

impl Init {
    /// Sample a weight matrix of shape `(rows, cols)`.
    pub fn weight<R: Rng + ?Sized>(
        &self,
        rows: usize,
        cols: usize,
        rng: &mut R,
    ) -> TPResult<Array2<f32>> {
        match self {
            Init::Orthogonal => orthogonal(rows, cols, rng),
            Init::Gaussian => {
                let dist = Normal::new(0.0f32, GAUSSIAN_STD)
                    .map_err(|e| TPError::Configuration(format!("gaussian init: {e}")))?;
                Ok(Array2::random_using((rows, cols), dist, rng))
            }
            Init::Uniform => Ok(Array2::random_using(
                (rows, cols),
                Uniform::new(-UNIFORM_LIMIT, UNIFORM_LIMIT),
                rng,
            )),
            other => Err(TPError::NotImplemented(format!(
                "initialization scheme '{other}'"
            ))),
        }
    }
}

/// Orthogonal initialization: orthonormal rows if `rows <= cols`, orthonormal
/// columns otherwise.
fn orthogonal<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> TPResult<Array2<f32>> {
    let normal = Normal::new(0.0f32, 1.0)
        .map_err(|e| TPError::Configuration(format!("orthogonal init: {e}")))?;
    let tall = rows >= cols;
    let (m, k) = if tall { (rows, cols) } else { (cols, rows) };
    let mut a = Array2::random_using((m, k), normal, rng);
    orthonormalize_columns(&mut a);
    if tall {
        Ok(a)
    } else {
        Ok(a.t().as_standard_layout().into_owned())
    }
}

impl fmt::Display for Init {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Init::Orthogonal => f.write_str("orthogonal"),
            Init::Gaussian => f.write_str("gaussian"),
            Init::Uniform => f.write_str("uniform"),
            Init::Eye => f.write_str("eye"),
            Init::Constant => f.write_str("constant"),
            Init::LowRank(k) => write!(f, "rank-{k}"),
            Init::CopyFromPeer => f.write_str("same"),
            Init::Indexed(tag) => f.write_str(tag),
        }
    }
}

impl Serialize for Init {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl FromStr for Init {
    type Err = TPError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unsupported = || TPError::Configuration(format!("initialization '{s}'"));
        match s {
            "orthogonal" => return Ok(Init::Orthogonal),
            "gaussian" => return Ok(Init::Gaussian),
            "uniform" => return Ok(Init::Uniform),
            "eye" => return Ok(Init::Eye),
            "constant" => return Ok(Init::Constant),
            "same" => return Ok(Init::CopyFromPeer),
            _ => {}
        }
        let (base, index) = s.rsplit_once('-').ok_or_else(unsupported)?;
        let index: usize = index.parse().map_err(|_| unsupported())?;
        match base {
            "rank" if index > 0 => Ok(Init::LowRank(index)),
            "orthogonal" | "gaussian" | "uniform" | "eye" | "constant" => {
                Ok(Init::Indexed(s.to_string()))
            }
            _ => Err(unsupported()),
        }
    }
}
