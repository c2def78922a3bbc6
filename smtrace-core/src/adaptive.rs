//! Adaptive constraints.
//!
//! An adaptive constraint (`latency < ?`, `latency ? ?`) cannot be decided
//! while events are streaming. Each evaluation records a sample in the
//! constraint's [`AdaptiveSlot`]; once the stream has ended the group asks an
//! [`AdaptiveStrategy`] for a [`Decision`] and every deferred verdict derives
//! its status from it.

use crate::constraint::{Constraint, ConstraintId, Direction, Operator, StatusValue};
use crate::error::CoreError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Learned operator and threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub operator: Operator,
    pub threshold: f64,
}

impl Decision {
    pub fn accepts(&self, sample: f64) -> bool {
        self.operator.holds(sample, self.threshold).unwrap_or(false)
    }
}

/// What a strategy decides from.
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveInput<'a> {
    /// Recorded samples, sorted ascending.
    pub samples: &'a [f64],
    /// Declared operator; `Operator::Adaptive` when it must be learned.
    pub operator: Operator,
    /// Declared threshold, when known.
    pub value: Option<f64>,
    /// Treat every observed run as valid.
    pub all_instances_valid: bool,
    /// Samples are integer counts.
    pub discrete: bool,
}

/// Decision procedure for adaptive constraints.
pub trait AdaptiveStrategy {
    fn name(&self) -> &'static str;

    /// Returns `None` when no decision can be learned from the samples.
    fn decide(&self, input: &AdaptiveInput<'_>) -> Option<Decision>;
}

impl<S: AdaptiveStrategy + ?Sized> AdaptiveStrategy for Box<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn decide(&self, input: &AdaptiveInput<'_>) -> Option<Decision> {
        (**self).decide(input)
    }
}

/// Gap-clustering strategy.
///
/// Samples are split into clusters wherever two neighbours are further
/// apart than a split value derived from the samples themselves. The
/// biggest cluster is taken as the normal behaviour.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClusterStrategy;

/// Relative gap separating two clusters of adjacent differences.
const DIFF_CLUSTER_GAP: f64 = 0.4;
/// Share of the mode above which equality is learned.
const MODE_SHARE: f64 = 0.8;
/// Share of the biggest cluster above which the side is picked by count.
const DOMINANT_CLUSTER_SHARE: f64 = 0.75;
/// Ratio between both sides above which one side is eliminated.
const SIDE_IMBALANCE: f64 = 1.4;
/// Gap ratio under which two neighbouring gaps count as equal.
const EQUAL_GAP_RATIO: f64 = 0.9;

impl AdaptiveStrategy for ClusterStrategy {
    fn name(&self) -> &'static str {
        "cluster"
    }

    fn decide(&self, input: &AdaptiveInput<'_>) -> Option<Decision> {
        if input.samples.is_empty() {
            return None;
        }

        match (input.operator, input.value) {
            (Operator::Adaptive, _) => self.learn_operator(input),
            (operator, Some(threshold)) => Some(Decision {
                operator,
                threshold,
            }),
            (operator, None) => self.learn_threshold(input).map(|threshold| Decision {
                operator,
                threshold,
            }),
        }
    }
}

impl ClusterStrategy {
    fn learn_threshold(&self, input: &AdaptiveInput<'_>) -> Option<f64> {
        let samples = input.samples;
        let strict = if input.operator.is_strict() { 1.0 } else { 0.0 };

        if input.all_instances_valid {
            let (min, max) = (samples[0], samples[samples.len() - 1]);
            return match input.operator.direction() {
                Direction::Over => Some(min - strict),
                Direction::Under => Some(max + strict),
                Direction::Equal => (min == max).then_some(min),
                Direction::Unknown => None,
            };
        }

        match input.operator.direction() {
            Direction::Equal => Some(mode(samples).0),
            Direction::Over => {
                let clusters = clusterize(samples, split_value(samples, input.discrete), false);
                let biggest = &clusters[biggest_cluster(&clusters)];
                Some(min_of(biggest) - strict)
            }
            Direction::Under => {
                let clusters = clusterize(samples, split_value(samples, input.discrete), false);
                let biggest = &clusters[biggest_cluster(&clusters)];
                Some(max_of(biggest) + strict)
            }
            Direction::Unknown => None,
        }
    }

    fn learn_operator(&self, input: &AdaptiveInput<'_>) -> Option<Decision> {
        let samples = input.samples;
        let (min, max) = (samples[0], samples[samples.len() - 1]);
        let distinct = min != max;

        if input.all_instances_valid {
            return match input.value {
                None if distinct => Some(Decision {
                    operator: Operator::Le,
                    threshold: max,
                }),
                None => Some(Decision {
                    operator: Operator::Eq,
                    threshold: min,
                }),
                Some(v) => {
                    let operator = if !distinct {
                        if v == min {
                            Operator::Eq
                        } else {
                            Operator::Ne
                        }
                    } else if v > max {
                        Operator::Lt
                    } else if v == max {
                        Operator::Le
                    } else if v < min {
                        Operator::Gt
                    } else if v == min {
                        Operator::Ge
                    } else {
                        return None;
                    };
                    Some(Decision {
                        operator,
                        threshold: v,
                    })
                }
            };
        }

        let (mode_value, mode_count) = mode(samples);

        if let Some(v) = input.value {
            let operator = if mode_value == v {
                Operator::Eq
            } else {
                let below = samples.iter().filter(|s| **s < v).count();
                let above = samples.iter().filter(|s| **s > v).count();
                if below < above {
                    Operator::Ge
                } else {
                    Operator::Le
                }
            };
            return Some(Decision {
                operator,
                threshold: v,
            });
        }

        if mode_count as f64 / samples.len() as f64 >= MODE_SHARE {
            return Some(Decision {
                operator: Operator::Eq,
                threshold: mode_value,
            });
        }

        let clusters = clusterize(samples, split_value(samples, input.discrete), false);
        merge_until_decided(clusters, samples.len())
    }
}

/// Grows the biggest cluster towards its closest neighbour until one side
/// of it can be discarded as outliers.
fn merge_until_decided(mut clusters: Vec<Vec<f64>>, total: usize) -> Option<Decision> {
    let mut biggest = biggest_cluster(&clusters);

    loop {
        let before: usize = clusters[..biggest].iter().map(Vec::len).sum();
        let after: usize = clusters[biggest + 1..].iter().map(Vec::len).sum();

        if before == 0 && after == 0 {
            return None;
        }

        let share = clusters[biggest].len() as f64 / total as f64;
        let (upper_bound, lower_bound) = if share >= DOMINANT_CLUSTER_SHARE {
            (
                before == 0 || before > after,
                after == 0 || after > before,
            )
        } else {
            (
                after > 0 && before as f64 / after as f64 >= SIDE_IMBALANCE,
                before > 0 && after as f64 / before as f64 >= SIDE_IMBALANCE,
            )
        };

        if upper_bound {
            return Some(Decision {
                operator: Operator::Le,
                threshold: max_of(&clusters[biggest]),
            });
        }
        if lower_bound {
            return Some(Decision {
                operator: Operator::Ge,
                threshold: min_of(&clusters[biggest]),
            });
        }

        let span = max_of(&clusters[biggest]) - min_of(&clusters[biggest]);
        let closest = if biggest == 0 {
            let gap = min_of(&clusters[1]) - max_of(&clusters[0]);
            if gap >= 3.0 * span + 1.0 {
                return Some(Decision {
                    operator: Operator::Le,
                    threshold: max_of(&clusters[0]),
                });
            }
            1
        } else if biggest == clusters.len() - 1 {
            let gap = min_of(&clusters[biggest]) - max_of(&clusters[biggest - 1]);
            if gap >= 3.0 * span + 1.0 {
                return Some(Decision {
                    operator: Operator::Ge,
                    threshold: min_of(&clusters[biggest]),
                });
            }
            biggest - 1
        } else {
            let gap_before = min_of(&clusters[biggest]) - max_of(&clusters[biggest - 1]);
            let gap_after = min_of(&clusters[biggest + 1]) - max_of(&clusters[biggest]);
            if gap_before.min(gap_after) / gap_before.max(gap_after) >= EQUAL_GAP_RATIO {
                if before >= after {
                    biggest - 1
                } else {
                    biggest + 1
                }
            } else if gap_before < gap_after {
                biggest - 1
            } else {
                biggest + 1
            }
        };

        let absorbed = clusters.remove(closest);
        let target = biggest.min(closest);
        clusters[target].extend(absorbed);
        biggest = target;
    }
}

/// Most frequent sample and its count; the smallest value wins ties.
fn mode(sorted: &[f64]) -> (f64, usize) {
    let mut best = (sorted[0], 0);
    let mut run = (sorted[0], 0);
    for &value in sorted {
        if value == run.0 {
            run.1 += 1;
        } else {
            run = (value, 1);
        }
        if run.1 > best.1 {
            best = run;
        }
    }
    best
}

/// Gap above which two neighbouring samples belong to different clusters.
fn split_value(sorted: &[f64], discrete: bool) -> f64 {
    if discrete {
        return 1.0;
    }

    let mut diffs: Vec<f64> = sorted.windows(2).map(|w| w[1] - w[0]).collect();
    diffs.sort_by(f64::total_cmp);
    diffs.dedup();
    if diffs.is_empty() {
        return f64::INFINITY;
    }

    let clusters = clusterize(&diffs, DIFF_CLUSTER_GAP, true);
    if clusters.len() > 1 {
        (max_of(&clusters[clusters.len() - 2]) + min_of(&clusters[clusters.len() - 1])) / 2.0
    } else {
        clusters[0].iter().sum::<f64>() / clusters[0].len() as f64
    }
}

/// Splits sorted data wherever the gap to the next value reaches
/// `threshold` (relative to the previous value when `relative`).
fn clusterize(sorted: &[f64], threshold: f64, relative: bool) -> Vec<Vec<f64>> {
    let mut clusters: Vec<Vec<f64>> = Vec::new();
    let mut current: Vec<f64> = Vec::new();

    for (i, &value) in sorted.iter().enumerate() {
        current.push(value);
        if let Some(&next) = sorted.get(i + 1) {
            let mut gap = next - value;
            if relative {
                gap /= value;
            }
            if gap >= threshold {
                clusters.push(std::mem::take(&mut current));
            }
        }
    }
    if !current.is_empty() {
        clusters.push(current);
    }
    clusters
}

/// Index of the biggest cluster; the first one wins ties.
fn biggest_cluster(clusters: &[Vec<f64>]) -> usize {
    let mut best = 0;
    for (i, cluster) in clusters.iter().enumerate() {
        if cluster.len() > clusters[best].len() {
            best = i;
        }
    }
    best
}

fn min_of(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::INFINITY, f64::min)
}

fn max_of(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

/// Nearest-rank percentile strategy.
///
/// Upper bounds sit at the configured percentile, lower bounds at its
/// complement. Operators are never learned.
#[derive(Debug, Clone, Copy)]
pub struct PercentileStrategy {
    pub percentile: f64,
}

impl PercentileStrategy {
    pub fn new(percentile: f64) -> Self {
        Self {
            percentile: percentile.clamp(0.0, 100.0),
        }
    }

    fn rank(sorted: &[f64], percentile: f64) -> f64 {
        let n = sorted.len();
        let rank = (percentile * n as f64 / 100.0).ceil() as usize;
        sorted[rank.clamp(1, n) - 1]
    }
}

impl AdaptiveStrategy for PercentileStrategy {
    fn name(&self) -> &'static str {
        "percentile"
    }

    fn decide(&self, input: &AdaptiveInput<'_>) -> Option<Decision> {
        if input.samples.is_empty() {
            return None;
        }
        let percentile = if input.all_instances_valid {
            100.0
        } else {
            self.percentile
        };
        let strict = if input.operator.is_strict() { 1.0 } else { 0.0 };

        if let Some(threshold) = input.value {
            return (input.operator != Operator::Adaptive).then_some(Decision {
                operator: input.operator,
                threshold,
            });
        }

        let threshold = match input.operator.direction() {
            Direction::Under => Self::rank(input.samples, percentile) + strict,
            Direction::Over => Self::rank(input.samples, 100.0 - percentile) - strict,
            Direction::Equal => mode(input.samples).0,
            Direction::Unknown => return None,
        };
        Some(Decision {
            operator: input.operator,
            threshold,
        })
    }
}

/// Samples and final decision of one adaptive constraint within a group.
#[derive(Debug)]
pub struct AdaptiveSlot {
    constraint: Arc<Constraint>,
    samples: Mutex<Vec<f64>>,
    decision: OnceLock<Option<Decision>>,
}

impl AdaptiveSlot {
    pub fn new(constraint: Arc<Constraint>) -> Self {
        Self {
            constraint,
            samples: Mutex::new(Vec::new()),
            decision: OnceLock::new(),
        }
    }

    pub fn constraint(&self) -> &Arc<Constraint> {
        &self.constraint
    }

    pub(crate) fn record(&self, sample: f64) {
        self.samples.lock().push(sample);
    }

    pub fn sample_count(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_finalized(&self) -> bool {
        self.decision.get().is_some()
    }

    /// Learned decision, once finalized and if one could be learned.
    pub fn decision(&self) -> Option<&Decision> {
        self.decision.get().and_then(Option::as_ref)
    }

    pub fn can_be_used(&self) -> bool {
        self.decision().is_some()
    }

    /// Status of a sample under the current decision.
    pub fn status_of(&self, sample: f64) -> StatusValue {
        match self.decision.get() {
            None => StatusValue::Pending,
            Some(None) => StatusValue::Uncertain,
            Some(Some(decision)) if decision.accepts(sample) => StatusValue::Valid,
            Some(Some(_)) => StatusValue::Invalid,
        }
    }

    /// Decides the constraint from the recorded samples. Runs once.
    pub fn revalidate(
        &self,
        strategy: &dyn AdaptiveStrategy,
        all_instances_valid: bool,
    ) -> Result<Option<Decision>, CoreError> {
        if self.is_finalized() {
            return Err(CoreError::AlreadyFinalized);
        }

        let decision = {
            let mut samples = self.samples.lock();
            samples.sort_by(f64::total_cmp);
            strategy.decide(&AdaptiveInput {
                samples: &samples,
                operator: self.constraint.operator(),
                value: self.constraint.reference_value(),
                all_instances_valid,
                discrete: self.constraint.is_discrete(),
            })
        };

        self.decision
            .set(decision)
            .map_err(|_| CoreError::AlreadyFinalized)?;

        debug!(
            constraint = %self.constraint,
            strategy = strategy.name(),
            samples = self.sample_count(),
            decided = %self.constraint.label(decision.as_ref()),
            "adaptive constraint finalized"
        );

        Ok(decision)
    }
}

/// Adaptive slots of a group, keyed by constraint identity.
#[derive(Debug, Default)]
pub struct AdaptiveRegistry {
    slots: HashMap<ConstraintId, Arc<AdaptiveSlot>>,
    order: Vec<ConstraintId>,
}

impl AdaptiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the slot of `constraint`, registering it on first use.
    pub fn slot_for(&mut self, constraint: &Arc<Constraint>) -> Arc<AdaptiveSlot> {
        let id = constraint.id();
        if let Some(slot) = self.slots.get(&id) {
            return Arc::clone(slot);
        }

        debug!(constraint = %constraint, id = %id, "registered adaptive constraint");
        let slot = Arc::new(AdaptiveSlot::new(Arc::clone(constraint)));
        self.slots.insert(id, Arc::clone(&slot));
        self.order.push(id);
        slot
    }

    pub fn get(&self, id: ConstraintId) -> Option<&Arc<AdaptiveSlot>> {
        self.slots.get(&id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Slots in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<AdaptiveSlot>> {
        self.order.iter().filter_map(|id| self.slots.get(id))
    }

    /// Finalizes every slot; returns how many reached a decision.
    pub fn finalize(
        &self,
        strategy: &dyn AdaptiveStrategy,
        all_instances_valid: bool,
    ) -> Result<usize, CoreError> {
        let mut decided = 0;
        for slot in self.iter() {
            if slot.revalidate(strategy, all_instances_valid)?.is_some() {
                decided += 1;
            }
        }
        Ok(decided)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(samples: &[f64], operator: Operator, value: Option<f64>) -> AdaptiveInput<'_> {
        AdaptiveInput {
            samples,
            operator,
            value,
            all_instances_valid: false,
            discrete: false,
        }
    }

    fn outlier_samples() -> Vec<f64> {
        let mut samples: Vec<f64> = (0..99).map(|i| 100.0 + (i % 10) as f64).collect();
        samples.push(5000.0);
        samples.sort_by(f64::total_cmp);
        samples
    }

    #[test]
    fn test_clusterize() {
        let clusters = clusterize(&[1.0, 2.0, 3.0, 10.0, 11.0], 5.0, false);
        assert_eq!(clusters, vec![vec![1.0, 2.0, 3.0], vec![10.0, 11.0]]);

        let clusters = clusterize(&[0.0, 1.0, 1.2, 10.0], 0.4, true);
        assert_eq!(clusters, vec![vec![0.0], vec![1.0, 1.2], vec![10.0]]);
    }

    #[test]
    fn test_split_value() {
        let samples = outlier_samples();
        // distinct gaps are 0, 1 and 4891
        assert_eq!(split_value(&samples, false), 2446.0);
        assert_eq!(split_value(&samples, true), 1.0);
        assert_eq!(split_value(&[4.0], false), f64::INFINITY);
    }

    #[test]
    fn test_mode() {
        assert_eq!(mode(&[1.0, 2.0, 2.0, 3.0, 3.0]), (2.0, 2));
        assert_eq!(mode(&[7.0]), (7.0, 1));
    }

    #[test]
    fn test_upper_bound_ignores_outlier() {
        let samples = outlier_samples();
        let decision = ClusterStrategy
            .decide(&input(&samples, Operator::Lt, None))
            .unwrap();
        assert_eq!(decision.operator, Operator::Lt);
        assert_eq!(decision.threshold, 110.0);
        assert!(decision.accepts(109.0));
        assert!(!decision.accepts(5000.0));
    }

    #[test]
    fn test_lower_bound() {
        let mut samples: Vec<f64> = vec![1.0];
        samples.extend((0..50).map(|i| 1000.0 + i as f64));
        let decision = ClusterStrategy
            .decide(&input(&samples, Operator::Ge, None))
            .unwrap();
        assert_eq!(decision.threshold, 1000.0);
        assert!(!decision.accepts(1.0));
    }

    #[test]
    fn test_all_instances_valid_envelope() {
        let samples = outlier_samples();
        let mut all_valid = input(&samples, Operator::Lt, None);
        all_valid.all_instances_valid = true;
        let decision = ClusterStrategy.decide(&all_valid).unwrap();
        assert_eq!(decision.threshold, 5001.0);

        all_valid.operator = Operator::Eq;
        assert_eq!(ClusterStrategy.decide(&all_valid), None);

        let same = [3.0, 3.0, 3.0];
        let mut eq = input(&same, Operator::Eq, None);
        eq.all_instances_valid = true;
        assert_eq!(ClusterStrategy.decide(&eq).unwrap().threshold, 3.0);
    }

    #[test]
    fn test_learn_operator_equality() {
        let mut samples = vec![5.0; 9];
        samples.push(8.0);
        let decision = ClusterStrategy
            .decide(&input(&samples, Operator::Adaptive, None))
            .unwrap();
        assert_eq!(decision.operator, Operator::Eq);
        assert_eq!(decision.threshold, 5.0);
    }

    #[test]
    fn test_learn_operator_upper_bound() {
        let samples = outlier_samples();
        let decision = ClusterStrategy
            .decide(&input(&samples, Operator::Adaptive, None))
            .unwrap();
        assert_eq!(decision.operator, Operator::Le);
        assert_eq!(decision.threshold, 109.0);
    }

    #[test]
    fn test_learn_operator_with_value() {
        let samples = [1.0, 2.0, 3.0, 50.0];
        let decision = ClusterStrategy
            .decide(&input(&samples, Operator::Adaptive, Some(10.0)))
            .unwrap();
        assert_eq!(decision.operator, Operator::Le);
        assert_eq!(decision.threshold, 10.0);

        let mut all_valid = input(&samples, Operator::Adaptive, Some(60.0));
        all_valid.all_instances_valid = true;
        assert_eq!(
            ClusterStrategy.decide(&all_valid).unwrap().operator,
            Operator::Lt
        );
    }

    #[test]
    fn test_no_samples_no_decision() {
        assert_eq!(ClusterStrategy.decide(&input(&[], Operator::Lt, None)), None);
        assert_eq!(
            PercentileStrategy::new(90.0).decide(&input(&[], Operator::Lt, None)),
            None
        );
    }

    #[test]
    fn test_percentile_strategy() {
        let samples: Vec<f64> = (1..=100).map(f64::from).collect();
        let strategy = PercentileStrategy::new(95.0);

        let upper = strategy
            .decide(&input(&samples, Operator::Le, None))
            .unwrap();
        assert_eq!(upper.threshold, 95.0);

        let lower = strategy
            .decide(&input(&samples, Operator::Ge, None))
            .unwrap();
        assert_eq!(lower.threshold, 5.0);

        assert_eq!(
            strategy.decide(&input(&samples, Operator::Adaptive, None)),
            None
        );
    }

    #[test]
    fn test_slot_lifecycle() {
        let constraint = Arc::new(
            Constraint::parse_guard("latency < ?")
                .unwrap()
                .remove(0)
                .with_id(ConstraintId(1)),
        );
        let mut registry = AdaptiveRegistry::new();
        let slot = registry.slot_for(&constraint);
        let again = registry.slot_for(&constraint);
        assert!(Arc::ptr_eq(&slot, &again));
        assert_eq!(registry.len(), 1);

        for sample in outlier_samples() {
            slot.record(sample);
        }
        assert_eq!(slot.status_of(5000.0), StatusValue::Pending);
        assert!(!slot.can_be_used());

        assert_eq!(registry.finalize(&ClusterStrategy, false).unwrap(), 1);
        assert_eq!(slot.status_of(5000.0), StatusValue::Invalid);
        assert_eq!(slot.status_of(105.0), StatusValue::Valid);
        assert!(slot.can_be_used());

        let err = slot.revalidate(&ClusterStrategy, false).unwrap_err();
        assert!(matches!(err, CoreError::AlreadyFinalized));
    }

    #[test]
    fn test_undecidable_slot_is_uncertain() {
        let constraint = Arc::new(Constraint::parse_guard("x != ?").unwrap().remove(0));
        let slot = AdaptiveSlot::new(constraint);
        slot.record(1.0);
        assert_eq!(slot.revalidate(&ClusterStrategy, false).unwrap(), None);
        assert_eq!(slot.status_of(1.0), StatusValue::Uncertain);
        assert!(!slot.can_be_used());
    }
}
