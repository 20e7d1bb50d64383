//! Joint embedding combination: weighted average over branch vectors.

use crate::EncoderError;

/// Combine branch vectors into one joint vector.
///
/// - `branches` pairs an optional branch vector with its configured weight.
/// - Missing branches (`None`) are skipped and the weight vector is
///   renormalised over the present ones.
/// - A single present branch degenerates to identity projection.
/// - All present branches must share one dim; mismatch is an error.
pub fn combine_joint(
    model_id: &str,
    branches: &[(Option<&[f32]>, f64)],
) -> Result<Vec<f32>, EncoderError> {
    let present: Vec<(&[f32], f64)> = branches
        .iter()
        .filter_map(|(v, w)| v.map(|v| (v, *w)))
        .collect();

    if present.is_empty() {
        return Err(EncoderError::EmptyWindow);
    }

    let dim = present[0].0.len();
    for (v, _) in &present {
        if v.len() != dim {
            return Err(EncoderError::DimMismatch {
                model_id: model_id.to_string(),
                expected: dim,
                actual: v.len(),
            });
        }
    }

    let weight_sum: f64 = present.iter().map(|(_, w)| w).sum();
    if weight_sum <= 0.0 || !weight_sum.is_finite() {
        return Err(EncoderError::NonFinite {
            model_id: model_id.to_string(),
            index: 0,
        });
    }

    let mut out = vec![0f32; dim];
    for (v, w) in &present {
        let w = w / weight_sum;
        for (slot, x) in out.iter_mut().zip(v.iter()) {
            *slot += (w * (*x as f64)) as f32;
        }
    }

    for (i, x) in out.iter().enumerate() {
        if !x.is_finite() {
            return Err(EncoderError::NonFinite {
                model_id: model_id.to_string(),
                index: i,
            });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_weights_average() {
        let a = [1.0f32, 0.0];
        let b = [0.0f32, 1.0];
        let out = combine_joint("joint-x-v1", &[(Some(&a), 1.0), (Some(&b), 1.0)]).unwrap();
        assert_eq!(out, vec![0.5, 0.5]);
    }

    #[test]
    fn missing_branch_renormalises() {
        let a = [1.0f32, 0.0];
        let out =
            combine_joint("joint-x-v1", &[(Some(&a), 0.25), (None, 0.75)]).unwrap();
        // Only branch a present: weight renormalises to 1.0 → identity.
        assert_eq!(out, vec![1.0, 0.0]);
    }

    #[test]
    fn all_branches_missing_is_an_error() {
        let err = combine_joint("joint-x-v1", &[(None, 0.5), (None, 0.5)]).unwrap_err();
        assert!(matches!(err, EncoderError::EmptyWindow));
    }

    #[test]
    fn dim_mismatch_is_an_error() {
        let a = [1.0f32, 0.0];
        let b = [0.0f32, 1.0, 2.0];
        let err =
            combine_joint("joint-x-v1", &[(Some(&a), 1.0), (Some(&b), 1.0)]).unwrap_err();
        assert!(matches!(err, EncoderError::DimMismatch { .. }));
    }

    #[test]
    fn zero_weight_sum_is_an_error() {
        let a = [1.0f32];
        let err = combine_joint("joint-x-v1", &[(Some(&a), 0.0)]).unwrap_err();
        assert!(matches!(err, EncoderError::NonFinite { .. }));
    }
}
