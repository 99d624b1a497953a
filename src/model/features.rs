use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::{BackboneError, Result};

/// Nominal stage whose last block ends each `res` level, `res1` first.
pub const FEATURE_STAGES: [usize; 5] = [0, 1, 2, 4, 6];

/// Named activation exposed to detection heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FeatureLevel {
    Stem,
    /// `res1` ..= `res5`
    Res(u8),
    Linear,
}

impl FeatureLevel {
    pub const ALL: [FeatureLevel; 7] = [
        FeatureLevel::Stem,
        FeatureLevel::Res(1),
        FeatureLevel::Res(2),
        FeatureLevel::Res(3),
        FeatureLevel::Res(4),
        FeatureLevel::Res(5),
        FeatureLevel::Linear,
    ];
}

impl fmt::Display for FeatureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureLevel::Stem => f.write_str("stem"),
            FeatureLevel::Res(n) => write!(f, "res{n}"),
            FeatureLevel::Linear => f.write_str("linear"),
        }
    }
}

impl FromStr for FeatureLevel {
    type Err = BackboneError;

    fn from_str(s: &str) -> Result<Self> {
        FeatureLevel::ALL
            .into_iter()
            .find(|l| l.to_string() == s)
            .ok_or_else(|| {
                BackboneError::InvalidConfiguration(format!(
                    "unknown feature level {s:?}, expected one of stem, res1..res5, linear"
                ))
            })
    }
}

impl TryFrom<String> for FeatureLevel {
    type Error = BackboneError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<FeatureLevel> for String {
    fn from(value: FeatureLevel) -> Self {
        value.to_string()
    }
}

pub fn parse_feature_levels<S: AsRef<str>>(names: &[S]) -> Result<Vec<FeatureLevel>> {
    names.iter().map(|n| n.as_ref().parse()).collect()
}

/// Channel count and downsampling factor of one feature level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShapeSpec {
    pub channels: usize,
    pub stride: usize,
}

pub type FeatureMaps = BTreeMap<FeatureLevel, Tensor>;
