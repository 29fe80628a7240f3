//! Summary statistics computed over the features of contained objects

use serde::{Deserialize, Serialize};
use std::fmt;

/// Statistic of an aggregate feature, encoded as the trailing `_{name}`
/// suffix of the feature name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Statistic {
    Min,
    Max,
    Sum,
    Mean,
    Count,
}

impl Statistic {
    pub const ALL: [Statistic; 5] = [
        Self::Min,
        Self::Max,
        Self::Sum,
        Self::Mean,
        Self::Count,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Min => "Min",
            Self::Max => "Max",
            Self::Sum => "Sum",
            Self::Mean => "Mean",
            Self::Count => "Count",
        }
    }

    /// Statistic encoded in the suffix of an aggregate feature name
    pub fn from_feature_name(name: &str) -> Option<Self> {
        let (_, suffix) = name.rsplit_once('_')?;
        Self::ALL.into_iter().find(|s| s.as_str() == suffix)
    }

    /// Computes the statistic, ignoring missing (NaN) values.
    ///
    /// `Count` is the number of rows. A sum over no values is zero, while
    /// min, max and mean are NaN.
    pub fn apply(&self, values: &[f64]) -> f64 {
        let present = values.iter().copied().filter(|v| !v.is_nan());
        match self {
            Self::Count => values.len() as f64,
            Self::Sum => present.sum(),
            Self::Min => present.reduce(f64::min).unwrap_or(f64::NAN),
            Self::Max => present.reduce(f64::max).unwrap_or(f64::NAN),
            Self::Mean => {
                let (sum, n) = present.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
                if n == 0 {
                    f64::NAN
                } else {
                    sum / n as f64
                }
            }
        }
    }

    /// Statistic re-applied when rolling an aggregate up one level: counts
    /// of the finer level are summed.
    pub fn rollup(&self) -> Self {
        match self {
            Self::Count => Self::Sum,
            other => *other,
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{feature}_{leaf}_{statistic}`
pub fn aggregate_feature_name(feature: &str, leaf_type: &str, statistic: Statistic) -> String {
    format!("{}_{}_{}", feature, leaf_type, statistic)
}

/// `{leaf}_Count`, used for leaf types without any features
pub fn count_feature_name(leaf_type: &str) -> String {
    format!("{}_{}", leaf_type, Statistic::Count)
}
