//! Horizontal scaling evaluation.
//!
//! Up and down use asymmetric rules: one metric above its high watermark is
//! enough to scale up, while scaling down needs every metric below its low
//! watermark for a run of consecutive evaluations.

use kiln_events::ScalingDirection;
use kiln_id::WorkloadId;
use kiln_reconcile::ConsecutiveCounter;
use serde::Serialize;

use crate::types::{MetricKind, MetricSamples, ScalingPolicy};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingDecision {
    pub workload_id: WorkloadId,
    pub current_replicas: u32,
    pub target_replicas: u32,
    pub direction: ScalingDirection,
    pub reason: String,
}

/// Mean of `metric` across instances that reported it.
fn mean_of(metric: MetricKind, samples: &[MetricSamples]) -> Option<f64> {
    let values: Vec<f64> = samples.iter().filter_map(|s| s.get(&metric)).copied().collect();
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Evaluates one workload against its policy. `streak` carries the
/// consecutive all-low count between evaluations.
pub(crate) fn evaluate(
    policy: &ScalingPolicy,
    current: u32,
    samples: &[MetricSamples],
    streak: &mut ConsecutiveCounter,
    cooldown: u32,
) -> (u32, ScalingDirection, String) {
    let hold = |reason: String| (policy.clamp(current), ScalingDirection::Hold, reason);

    if policy.targets.is_empty() {
        streak.reset();
        return hold("no scaling targets".to_string());
    }
    if samples.is_empty() {
        streak.reset();
        return hold("no metric samples".to_string());
    }

    let observed: Vec<_> = policy
        .targets
        .iter()
        .map(|t| (t, mean_of(t.metric, samples)))
        .collect();

    let pressure = observed
        .iter()
        .filter_map(|(t, mean)| mean.filter(|m| *m > t.high).map(|m| (t, m)))
        .map(|(t, m)| if t.high > 0.0 { m / t.high } else { f64::INFINITY })
        .fold(None, |acc: Option<f64>, r| Some(acc.map_or(r, |a| a.max(r))));

    if let Some(ratio) = pressure {
        streak.reset();
        let scaled = (f64::from(current) * ratio).ceil();
        let scaled = if scaled.is_finite() && scaled < f64::from(u32::MAX) {
            scaled as u32
        } else {
            u32::MAX
        };
        let target = policy.clamp(scaled.max(current.saturating_add(1)));
        let direction = if target > current {
            ScalingDirection::Up
        } else {
            ScalingDirection::Hold
        };
        return (
            target,
            direction,
            format!("metric above high watermark by {ratio:.2}x"),
        );
    }

    let all_low = observed
        .iter()
        .all(|(t, mean)| mean.is_some_and(|m| m < t.low));
    let run = streak.observe(all_low);

    if !all_low {
        return hold("metrics within watermarks".to_string());
    }
    if run < cooldown {
        return hold(format!("below low watermark ({run}/{cooldown})"));
    }

    streak.reset();
    let target = policy.clamp(current.saturating_sub(1));
    let direction = if target < current {
        ScalingDirection::Down
    } else {
        ScalingDirection::Hold
    };
    (
        target,
        direction,
        format!("all metrics below low watermark for {run} evaluations"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetricTarget;
    use proptest::prelude::*;

    fn policy(min: u32, max: u32) -> ScalingPolicy {
        ScalingPolicy {
            min_replicas: min,
            max_replicas: max,
            targets: vec![
                MetricTarget {
                    metric: MetricKind::CpuUtilization,
                    high: 0.8,
                    low: 0.3,
                },
                MetricTarget {
                    metric: MetricKind::RequestsPerSecond,
                    high: 100.0,
                    low: 20.0,
                },
            ],
        }
    }

    fn sample(cpu: f64, rps: f64) -> MetricSamples {
        MetricSamples::from([
            (MetricKind::CpuUtilization, cpu),
            (MetricKind::RequestsPerSecond, rps),
        ])
    }

    #[test]
    fn test_any_metric_above_high_scales_up_proportionally() {
        let mut streak = ConsecutiveCounter::default();
        let (target, dir, _) = evaluate(
            &policy(1, 10),
            2,
            &[sample(0.2, 250.0), sample(0.2, 150.0)],
            &mut streak,
            5,
        );
        // rps mean 200 against 100 doubles the count
        assert_eq!((target, dir), (4, ScalingDirection::Up));
    }

    #[test]
    fn test_scale_up_at_least_one_and_clamped() {
        let mut streak = ConsecutiveCounter::default();
        let (target, _, _) = evaluate(&policy(1, 10), 3, &[sample(0.81, 10.0)], &mut streak, 5);
        assert_eq!(target, 4);

        let (target, dir, _) = evaluate(&policy(1, 3), 3, &[sample(0.99, 10.0)], &mut streak, 5);
        assert_eq!((target, dir), (3, ScalingDirection::Hold));
    }

    #[test]
    fn test_scale_down_needs_all_metrics_low() {
        let mut streak = ConsecutiveCounter::default();
        for _ in 0..10 {
            let (target, _, _) = evaluate(&policy(1, 5), 3, &[sample(0.1, 50.0)], &mut streak, 5);
            assert_eq!(target, 3);
        }
        assert_eq!(streak.streak(), 0);
    }

    #[test]
    fn test_cooldown_counts_consecutive_low_readings() {
        let p = policy(1, 5);
        let mut streak = ConsecutiveCounter::default();
        let low = [sample(0.1, 5.0)];

        let (target, dir, _) = evaluate(&p, 3, &[sample(0.9, 5.0)], &mut streak, 5);
        assert_eq!((target, dir), (4, ScalingDirection::Up));

        for _ in 0..4 {
            let (target, dir, _) = evaluate(&p, 4, &low, &mut streak, 5);
            assert_eq!((target, dir), (4, ScalingDirection::Hold));
        }
        let (target, dir, _) = evaluate(&p, 4, &low, &mut streak, 5);
        assert_eq!((target, dir), (3, ScalingDirection::Down));
        assert_eq!(streak.streak(), 0);
    }

    #[test]
    fn test_missing_metric_blocks_scale_down() {
        let mut streak = ConsecutiveCounter::default();
        let only_cpu = MetricSamples::from([(MetricKind::CpuUtilization, 0.05)]);
        for _ in 0..6 {
            let (target, _, _) = evaluate(&policy(1, 5), 2, &[only_cpu.clone()], &mut streak, 5);
            assert_eq!(target, 2);
        }
    }

    proptest! {
        #[test]
        fn test_target_always_within_bounds(
            min in 0u32..5,
            span in 0u32..10,
            current in 0u32..30,
            readings in proptest::collection::vec((0.0f64..2.0, 0.0f64..400.0), 1..40),
        ) {
            let p = policy(min, (min + span).max(1));
            let mut streak = ConsecutiveCounter::default();
            let mut replicas = current;
            for (cpu, rps) in readings {
                let (target, _, _) = evaluate(&p, replicas, &[sample(cpu, rps)], &mut streak, 3);
                prop_assert!(target >= p.min_replicas && target <= p.max_replicas);
                replicas = target;
            }
        }
    }
}
