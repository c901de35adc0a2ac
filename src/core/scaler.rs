use crate::core::cluster::{check_dimensions, ClusterError};
use crate::core::features::FeatureMatrix;

/// Per-dimension statistics of one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnStats {
    pub mean: Vec<f64>,
    /// Population standard deviation.
    pub std: Vec<f64>,
}

impl ColumnStats {
    pub fn fit(rows: &[Vec<f32>]) -> Result<Self, ClusterError> {
        let k = check_dimensions(rows)?;
        let n = rows.len() as f64;
        let mut mean = vec![0.0; k];
        let mut std = vec![0.0; k];
        if rows.is_empty() {
            return Ok(Self { mean, std });
        }

        for row in rows {
            for (m, x) in mean.iter_mut().zip(row) {
                *m += f64::from(*x);
            }
        }
        mean.iter_mut().for_each(|m| *m /= n);

        for row in rows {
            for ((s, m), x) in std.iter_mut().zip(&mean).zip(row) {
                let d = f64::from(*x) - m;
                *s += d * d;
            }
        }
        std.iter_mut().for_each(|s| *s = (*s / n).sqrt());

        Ok(Self { mean, std })
    }

    /// `(x - mean) / std`, with zero-variance dimensions mapped to 0.
    pub fn transform_row(&self, row: &[f32]) -> Vec<f32> {
        row.iter()
            .zip(self.mean.iter().zip(&self.std))
            .map(|(x, (m, s))| {
                if *s == 0.0 {
                    0.0
                } else {
                    ((f64::from(*x) - m) / s) as f32
                }
            })
            .collect()
    }
}

/// Standardize a batch to zero mean and unit variance per dimension.
///
/// Statistics are fitted on this batch alone; nothing carries over between
/// runs. Identities keep their positions.
pub fn standardize(matrix: &FeatureMatrix) -> Result<FeatureMatrix, ClusterError> {
    let stats = ColumnStats::fit(matrix.rows())?;
    let rows = matrix
        .rows()
        .iter()
        .map(|row| stats.transform_row(row))
        .collect();
    Ok(matrix.with_rows(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn matrix(rows: Vec<Vec<f32>>) -> FeatureMatrix {
        let ids = (0..rows.len()).map(|i| i.to_string()).collect();
        FeatureMatrix::from_parts(ids, rows).unwrap()
    }

    #[test]
    fn test_standardize_columns() {
        let scaled = standardize(&matrix(vec![vec![1.0, 10.0], vec![3.0, 30.0]])).unwrap();
        assert_eq!(scaled.rows(), &[vec![-1.0, -1.0], vec![1.0, 1.0]]);
        assert_eq!(scaled.ids(), &["0".to_string(), "1".to_string()]);
    }

    #[test]
    fn test_zero_variance_column_is_zero() {
        let scaled = standardize(&matrix(vec![
            vec![5.0, 1.0],
            vec![5.0, 2.0],
            vec![5.0, 3.0],
        ]))
        .unwrap();
        assert!(scaled.rows().iter().all(|r| r[0] == 0.0));
        assert!(scaled.rows().iter().all(|r| r[1].is_finite()));
    }

    #[test]
    fn test_single_row_scales_to_zero() {
        let scaled = standardize(&matrix(vec![vec![7.0, -2.0, 0.5]])).unwrap();
        assert_eq!(scaled.rows(), &[vec![0.0, 0.0, 0.0]]);
    }

    #[test]
    fn test_empty_matrix() {
        let scaled = standardize(&FeatureMatrix::new()).unwrap();
        assert!(scaled.is_empty());
    }

    #[test]
    fn test_mismatched_rows_rejected() {
        let err = standardize(&matrix(vec![vec![1.0, 2.0], vec![1.0]])).unwrap_err();
        assert!(matches!(err, ClusterError::DimensionMismatch { index: 1, .. }));
    }

    proptest! {
        #[test]
        fn prop_rescaling_is_idempotent(
            rows in (2usize..5).prop_flat_map(|k| {
                prop::collection::vec(prop::collection::vec(-100.0f32..100.0, k), 2..12)
            })
        ) {
            let once = standardize(&matrix(rows)).unwrap();
            let twice = standardize(&once).unwrap();
            for (a, b) in once.rows().iter().zip(twice.rows()) {
                for (x, y) in a.iter().zip(b) {
                    prop_assert!((x - y).abs() < 1e-3, "{} vs {}", x, y);
                }
            }
        }
    }
}
