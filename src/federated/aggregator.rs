//! Sample-count-weighted aggregation for federated learning.
//!
//! Implements FedAvg over parameter vectors and the matching weighted mean
//! for losses and metrics. Every function here is pure and sums in input
//! order, so the same inputs in the same order give bit-identical output.

use crate::core::{Error, Result};
use crate::federated::participant::{EvaluationResult, MetricMap, Update};
use crate::federated::tensor::ParameterVector;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Aggregated evaluation of one round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationAggregate {
    /// Weighted mean loss
    pub loss: f64,
    /// Weighted mean of metrics reported by every result
    pub metrics: MetricMap,
    /// Total evaluation examples
    pub sample_count: u64,
}

/// Weighted mean of parameters, tensor by tensor:
/// `sum_i(n_i * p_i[t]) / sum_i(n_i)`.
///
/// All updates must share the first update's shapes.
pub fn aggregate_parameters(updates: &[Update]) -> Result<ParameterVector> {
    let first = updates.first().ok_or(Error::EmptyAggregationSet)?;
    let reference = first.parameters();

    for update in updates {
        check_sample_count(update.sample_count())?;
        reference.check_shapes(update.parameters())?;
    }

    let total_samples: f64 = updates.iter().map(|u| u.sample_count() as f64).sum();

    // Accumulate in f64 so large fleets don't lose precision.
    let mut accumulated: Vec<ArrayD<f64>> = reference
        .tensors()
        .iter()
        .map(|t| ArrayD::zeros(t.raw_dim()))
        .collect();

    for update in updates {
        let weight = update.sample_count() as f64;
        for (acc, tensor) in accumulated.iter_mut().zip(update.parameters().tensors()) {
            acc.zip_mut_with(tensor, |a, &v| *a += weight * v as f64);
        }
    }

    let tensors = accumulated
        .into_iter()
        .map(|acc| acc.mapv(|v| (v / total_samples) as f32))
        .collect();

    Ok(ParameterVector::new(tensors))
}

/// Weighted mean of losses and of the metrics present in every result.
///
/// A metric missing from any one result is left out, never defaulted.
pub fn aggregate_evaluations(results: &[EvaluationResult]) -> Result<EvaluationAggregate> {
    if results.is_empty() {
        return Err(Error::EmptyAggregationSet);
    }
    for result in results {
        check_sample_count(result.sample_count())?;
        check_finite_metrics(result.metrics())?;
        if !result.loss().is_finite() {
            return Err(Error::InvalidUpdate(format!(
                "loss must be finite, got {}",
                result.loss()
            )));
        }
    }

    let sample_count = total_sample_count(results.iter().map(|r| r.sample_count()))?;
    let total = sample_count as f64;
    let loss = results
        .iter()
        .map(|r| r.sample_count() as f64 * r.loss())
        .sum::<f64>()
        / total;

    let weighted: Vec<(u64, &MetricMap)> = results
        .iter()
        .map(|r| (r.sample_count(), r.metrics()))
        .collect();

    Ok(EvaluationAggregate {
        loss,
        metrics: weighted_metrics(&weighted),
        sample_count,
    })
}

/// Weighted mean of the metrics returned by fit.
pub fn aggregate_fit_metrics(updates: &[Update]) -> Result<MetricMap> {
    if updates.is_empty() {
        return Err(Error::EmptyAggregationSet);
    }
    for update in updates {
        check_sample_count(update.sample_count())?;
        check_finite_metrics(update.metrics())?;
    }
    let weighted: Vec<(u64, &MetricMap)> = updates
        .iter()
        .map(|u| (u.sample_count(), u.metrics()))
        .collect();
    Ok(weighted_metrics(&weighted))
}

/// Intersection of metric names, each weighted by sample count.
fn weighted_metrics(entries: &[(u64, &MetricMap)]) -> MetricMap {
    let Some((_, first)) = entries.first() else {
        return MetricMap::new();
    };

    let total: f64 = entries.iter().map(|(n, _)| *n as f64).sum();
    let mut aggregated = MetricMap::new();

    for name in first.keys() {
        if !entries.iter().all(|(_, m)| m.contains_key(name)) {
            continue;
        }
        let sum: f64 = entries
            .iter()
            .map(|(n, m)| *n as f64 * m.get(name).copied().unwrap_or_default())
            .sum();
        aggregated.insert(name.clone(), sum / total);
    }

    aggregated
}

fn check_sample_count(sample_count: u64) -> Result<()> {
    if sample_count == 0 {
        return Err(Error::InvalidUpdate(
            "sample_count must be positive".to_string(),
        ));
    }
    Ok(())
}

fn check_finite_metrics(metrics: &MetricMap) -> Result<()> {
    match metrics.iter().find(|(_, v)| !v.is_finite()) {
        Some((name, value)) => Err(Error::InvalidUpdate(format!(
            "metric {} must be finite, got {}",
            name, value
        ))),
        None => Ok(()),
    }
}

/// Sum of reported sample counts; participants can claim anything.
fn total_sample_count(mut counts: impl Iterator<Item = u64>) -> Result<u64> {
    counts.try_fold(0u64, |total, n| {
        total
            .checked_add(n)
            .ok_or_else(|| Error::InvalidUpdate("total sample_count overflows u64".to_string()))
    })
}

/// Combines fit updates into new global parameters.
pub type ParameterAggregateFn = Arc<dyn Fn(&[Update]) -> Result<ParameterVector> + Send + Sync>;
/// Combines fit metrics.
pub type FitMetricsAggregateFn = Arc<dyn Fn(&[Update]) -> Result<MetricMap> + Send + Sync>;
/// Combines evaluation results.
pub type EvaluationAggregateFn =
    Arc<dyn Fn(&[EvaluationResult]) -> Result<EvaluationAggregate> + Send + Sync>;

/// The aggregation functions a coordinator uses.
///
/// Each function can be swapped on its own; the default is the
/// sample-count-weighted mean for all three.
#[derive(Clone)]
pub struct Aggregation {
    parameters: ParameterAggregateFn,
    fit_metrics: FitMetricsAggregateFn,
    evaluations: EvaluationAggregateFn,
}

impl Aggregation {
    /// FedAvg for parameters, weighted mean for metrics and loss.
    pub fn weighted_average() -> Self {
        Self {
            parameters: Arc::new(aggregate_parameters),
            fit_metrics: Arc::new(aggregate_fit_metrics),
            evaluations: Arc::new(aggregate_evaluations),
        }
    }

    /// Replace parameter aggregation.
    pub fn with_parameters<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Update]) -> Result<ParameterVector> + Send + Sync + 'static,
    {
        self.parameters = Arc::new(f);
        self
    }

    /// Replace fit-metric aggregation.
    pub fn with_fit_metrics<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Update]) -> Result<MetricMap> + Send + Sync + 'static,
    {
        self.fit_metrics = Arc::new(f);
        self
    }

    /// Replace evaluation aggregation.
    pub fn with_evaluations<F>(mut self, f: F) -> Self
    where
        F: Fn(&[EvaluationResult]) -> Result<EvaluationAggregate> + Send + Sync + 'static,
    {
        self.evaluations = Arc::new(f);
        self
    }

    pub fn parameters(&self, updates: &[Update]) -> Result<ParameterVector> {
        (self.parameters)(updates)
    }

    pub fn fit_metrics(&self, updates: &[Update]) -> Result<MetricMap> {
        (self.fit_metrics)(updates)
    }

    pub fn evaluations(&self, results: &[EvaluationResult]) -> Result<EvaluationAggregate> {
        (self.evaluations)(results)
    }
}

impl Default for Aggregation {
    fn default() -> Self {
        Self::weighted_average()
    }
}

impl std::fmt::Debug for Aggregation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregation").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(values: &[f32], samples: u64) -> Update {
        Update::new(ParameterVector::from_scalars(values), samples, MetricMap::new())
    }

    fn metrics(pairs: &[(&str, f64)]) -> MetricMap {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_weighted_mean() {
        let updates = vec![update(&[2.0], 10), update(&[4.0], 30)];
        let aggregated = aggregate_parameters(&updates).unwrap();
        // (10 * 2.0 + 30 * 4.0) / 40 = 3.5
        assert_eq!(aggregated.tensors()[0][[0]], 3.5);
    }

    #[test]
    fn test_equal_weights_is_plain_mean() {
        let updates = vec![update(&[1.0, 2.0, 3.0], 5), update(&[3.0, 4.0, 5.0], 5)];
        let aggregated = aggregate_parameters(&updates).unwrap();
        let values: Vec<f32> = aggregated.tensors().iter().map(|t| t[[0]]).collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_multidimensional_tensors() {
        let a = ParameterVector::from_shaped(vec![(vec![2, 2], vec![0.0, 0.0, 0.0, 0.0])]).unwrap();
        let b = ParameterVector::from_shaped(vec![(vec![2, 2], vec![4.0, 8.0, 12.0, 16.0])]).unwrap();
        let updates = vec![
            Update::new(a, 3, MetricMap::new()),
            Update::new(b, 1, MetricMap::new()),
        ];
        let aggregated = aggregate_parameters(&updates).unwrap();
        assert_eq!(aggregated.shapes(), vec![vec![2, 2]]);
        assert_eq!(aggregated.tensors()[0][[1, 1]], 4.0);
    }

    #[test]
    fn test_tensor_count_mismatch() {
        let updates = vec![update(&[1.0, 2.0], 1), update(&[1.0], 1)];
        let err = aggregate_parameters(&updates).unwrap_err();
        assert!(matches!(
            err,
            Error::ShapeMismatch {
                index: 1,
                actual: None,
                ..
            }
        ));
        assert!(err.is_contract_violation());
    }

    #[test]
    fn test_shape_mismatch() {
        let a = ParameterVector::zeros(&[vec![2]]);
        let b = ParameterVector::zeros(&[vec![3]]);
        let updates = vec![
            Update::new(a, 1, MetricMap::new()),
            Update::new(b, 1, MetricMap::new()),
        ];
        assert!(matches!(
            aggregate_parameters(&updates),
            Err(Error::ShapeMismatch { index: 0, .. })
        ));
    }

    #[test]
    fn test_empty_set() {
        assert!(matches!(aggregate_parameters(&[]), Err(Error::EmptyAggregationSet)));
        assert!(matches!(aggregate_evaluations(&[]), Err(Error::EmptyAggregationSet)));
        assert!(matches!(aggregate_fit_metrics(&[]), Err(Error::EmptyAggregationSet)));
    }

    #[test]
    fn test_zero_sample_count_rejected() {
        let updates = vec![update(&[1.0], 0)];
        assert!(matches!(aggregate_parameters(&updates), Err(Error::InvalidUpdate(_))));
    }

    #[test]
    fn test_sample_count_overflow_rejected() {
        let huge = u64::MAX / 2 + 1;
        let results = vec![
            EvaluationResult::new(0.5, huge, MetricMap::new()),
            EvaluationResult::new(0.5, huge, MetricMap::new()),
        ];
        assert!(matches!(
            aggregate_evaluations(&results),
            Err(Error::InvalidUpdate(_))
        ));

        // Parameter averaging sums weights in f64 and stays well defined.
        let updates = vec![update(&[1.0], huge), update(&[3.0], huge)];
        let aggregated = aggregate_parameters(&updates).unwrap();
        assert_eq!(aggregated.tensors()[0][[0]], 2.0);
    }

    #[test]
    fn test_non_finite_loss_rejected() {
        let results = vec![
            EvaluationResult::new(0.5, 10, MetricMap::new()),
            EvaluationResult::new(f64::NAN, 10, MetricMap::new()),
        ];
        assert!(matches!(
            aggregate_evaluations(&results),
            Err(Error::InvalidUpdate(_))
        ));
    }

    #[test]
    fn test_non_finite_metric_rejected() {
        let results = vec![EvaluationResult::new(
            0.5,
            10,
            metrics(&[("accuracy", f64::INFINITY)]),
        )];
        assert!(matches!(
            aggregate_evaluations(&results),
            Err(Error::InvalidUpdate(_))
        ));

        let updates = vec![Update::new(
            ParameterVector::from_scalars(&[0.0]),
            1,
            metrics(&[("loss", f64::NAN)]),
        )];
        assert!(matches!(
            aggregate_fit_metrics(&updates),
            Err(Error::InvalidUpdate(_))
        ));
    }

    #[test]
    fn test_bit_identical_on_repeat() {
        let updates = vec![
            update(&[0.1, 0.7, -3.3], 7),
            update(&[0.2, 0.9, 1.1], 13),
            update(&[0.3, -0.4, 2.2], 29),
        ];
        let a = aggregate_parameters(&updates).unwrap();
        let b = aggregate_parameters(&updates).unwrap();
        let bits = |p: &ParameterVector| -> Vec<u32> {
            p.tensors().iter().flat_map(|t| t.iter().map(|v| v.to_bits())).collect()
        };
        assert_eq!(bits(&a), bits(&b));
    }

    #[test]
    fn test_metric_intersection() {
        let results = vec![
            EvaluationResult::new(1.0, 10, metrics(&[("accuracy", 0.5), ("recall", 0.9)])),
            EvaluationResult::new(3.0, 30, metrics(&[("accuracy", 0.9)])),
        ];
        let aggregate = aggregate_evaluations(&results).unwrap();
        assert!((aggregate.loss - 2.5).abs() < 1e-12);
        assert_eq!(aggregate.sample_count, 40);
        assert!(!aggregate.metrics.contains_key("recall"));
        // (10 * 0.5 + 30 * 0.9) / 40 = 0.8
        assert!((aggregate.metrics["accuracy"] - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_fit_metrics_intersection() {
        let updates = vec![
            Update::new(ParameterVector::from_scalars(&[0.0]), 1, metrics(&[("loss", 2.0)])),
            Update::new(ParameterVector::from_scalars(&[0.0]), 3, metrics(&[("loss", 6.0), ("extra", 1.0)])),
        ];
        let aggregated = aggregate_fit_metrics(&updates).unwrap();
        assert_eq!(aggregated.len(), 1);
        assert!((aggregated["loss"] - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_custom_parameter_function() {
        let aggregation = Aggregation::default()
            .with_parameters(|updates: &[Update]| Ok(updates[0].parameters().clone()));
        let updates = vec![update(&[1.0], 1), update(&[9.0], 100)];
        let result = aggregation.parameters(&updates).unwrap();
        assert_eq!(result.tensors()[0][[0]], 1.0);
        // The other functions keep their defaults.
        assert!(aggregation.fit_metrics(&updates).is_ok());
    }
}
