use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::calculator::{CalcError, CalculationResult, VarsityCalculator};

/// Upper bound on concurrently-running matching computations. Iteration
/// count scales independently of this width.
pub const MAX_COMPUTE_WORKERS: usize = 128;

/// Aggregated cutoff statistics for one heading across many randomized
/// drain iterations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainedResult {
    pub heading_code: String,
    pub drained_percent: u8,
    pub min_passing_score: i32,
    pub max_passing_score: i32,
    pub avg_passing_score: i32,
    pub med_passing_score: i32,
    pub min_last_admitted_rating_place: u32,
    pub max_last_admitted_rating_place: u32,
    pub avg_last_admitted_rating_place: u32,
    pub med_last_admitted_rating_place: u32,
    /// Number of iterations that contributed a usable value.
    pub iterations_counted: usize,
}

/// Monte Carlo drain simulator. Each iteration deep-clones the prototype,
/// randomly withdraws a percentage of not-yet-committed students, re-runs
/// the matching engine and feeds the cutoffs into the aggregate.
#[derive(Debug)]
pub struct Drainer {
    prototype: Arc<VarsityCalculator>,
    drain_percent: u8,
}

#[derive(Default)]
struct Samples {
    passing: Vec<i64>,
    rating: Vec<i64>,
}

/// Sorts in place and returns (min, max, truncating mean, lower median).
fn summarize(values: &mut Vec<i64>) -> Option<(i64, i64, i64, i64)> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    let min = values[0];
    let max = values[values.len() - 1];
    let avg = values.iter().sum::<i64>() / values.len() as i64;
    let med = values[(values.len() - 1) / 2];
    Some((min, max, avg, med))
}

impl Drainer {
    pub fn new(prototype: VarsityCalculator, drain_percent: u8) -> Result<Self, CalcError> {
        if drain_percent > 100 {
            return Err(CalcError::InvalidDrainPercent(drain_percent as i64));
        }
        Ok(Self {
            prototype: Arc::new(prototype),
            drain_percent,
        })
    }

    pub async fn run(&self, iterations: usize) -> Result<Vec<DrainedResult>, CalcError> {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        self.run_with_shutdown(iterations, shutdown_rx).await
    }

    /// Runs up to `iterations` randomized resimulations on a bounded worker
    /// pool. Workers stop pulling new iterations once `shutdown` flips to
    /// true; results already computed still drain into the aggregate.
    ///
    /// A failed iteration (internal-consistency error from the matching
    /// engine) aborts the whole run with that error.
    pub async fn run_with_shutdown(
        &self,
        iterations: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<DrainedResult>, CalcError> {
        if iterations == 0 {
            return Ok(Vec::new());
        }

        let worker_count = MAX_COMPUTE_WORKERS.min(iterations);
        let tickets = Arc::new(AtomicUsize::new(0));
        // Buffered to the full iteration count so a producer never waits on
        // the consumer.
        let (tx, mut rx) =
            mpsc::channel::<Result<Vec<CalculationResult>, CalcError>>(iterations);

        let mut handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let prototype = Arc::clone(&self.prototype);
            let tickets = Arc::clone(&tickets);
            let tx = tx.clone();
            let shutdown = shutdown.clone();
            let percent = self.drain_percent;
            handles.push(tokio::task::spawn_blocking(move || {
                let mut rng = StdRng::from_entropy();
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    if tickets.fetch_add(1, Ordering::Relaxed) >= iterations {
                        break;
                    }
                    let mut varsity = (*prototype).clone();
                    varsity.simulate_originals_drain(percent, &mut rng);
                    if tx.blocking_send(varsity.calculate_admissions()).is_err() {
                        // Receiver is gone; the run is over.
                        break;
                    }
                }
            }));
        }
        drop(tx);

        let mut samples: BTreeMap<String, Samples> = BTreeMap::new();
        let mut completed = 0usize;
        let mut run_error: Option<CalcError> = None;

        while let Some(outcome) = rx.recv().await {
            match outcome {
                Ok(results) => {
                    completed += 1;
                    for result in results {
                        let passing = match result.passing_score() {
                            Ok(value) => value,
                            Err(err) => {
                                debug!(heading_code = %result.heading_code, %err,
                                    "passing score unavailable for iteration");
                                continue;
                            }
                        };
                        let rating = match result.last_admitted_rating_place() {
                            Ok(value) => value,
                            Err(err) => {
                                debug!(heading_code = %result.heading_code, %err,
                                    "last admitted rating place unavailable for iteration");
                                continue;
                            }
                        };
                        let entry = samples.entry(result.heading_code).or_default();
                        entry.passing.push(passing as i64);
                        entry.rating.push(rating as i64);
                    }
                }
                Err(err) => {
                    run_error = Some(err);
                    break;
                }
            }
        }
        drop(rx);
        for handle in handles {
            let _ = handle.await;
        }

        if let Some(err) = run_error {
            return Err(err);
        }
        if completed < iterations {
            info!(
                completed,
                requested = iterations,
                "drain run finished before all iterations were simulated"
            );
        }

        let mut drained = Vec::with_capacity(samples.len());
        for heading in self.prototype.headings() {
            let stats = samples.remove(&heading.code).and_then(|mut s| {
                let passing = summarize(&mut s.passing)?;
                let rating = summarize(&mut s.rating)?;
                Some((passing, rating, s.passing.len()))
            });
            match stats {
                Some(((ps_min, ps_max, ps_avg, ps_med), (rt_min, rt_max, rt_avg, rt_med), n)) => {
                    drained.push(DrainedResult {
                        heading_code: heading.code.clone(),
                        drained_percent: self.drain_percent,
                        min_passing_score: ps_min as i32,
                        max_passing_score: ps_max as i32,
                        avg_passing_score: ps_avg as i32,
                        med_passing_score: ps_med as i32,
                        min_last_admitted_rating_place: rt_min as u32,
                        max_last_admitted_rating_place: rt_max as u32,
                        avg_last_admitted_rating_place: rt_avg as u32,
                        med_last_admitted_rating_place: rt_med as u32,
                        iterations_counted: n,
                    });
                }
                None => {
                    warn!(heading_code = %heading.code,
                        "no usable drained statistics for heading, omitting from results");
                }
            }
        }
        drained.sort_by(|a, b| a.heading_code.cmp(&b.heading_code));
        Ok(drained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Capacities, Competition};

    fn sid(i: u32) -> String {
        format!("student{}", i)
    }

    fn populated_varsity() -> VarsityCalculator {
        let mut v = VarsityCalculator::new("TEST", "Test Varsity");
        v.add_heading(
            "H1",
            Capacities {
                general: 3,
                ..Default::default()
            },
            "Heading 1",
        );
        v.add_heading(
            "H2",
            Capacities {
                general: 2,
                ..Default::default()
            },
            "Heading 2",
        );
        for i in 0..12u32 {
            v.add_application("H1", &sid(i), i + 1, 1, Competition::Regular, 260 - i as i32)
                .unwrap();
        }
        for i in 6..12u32 {
            v.add_application("H2", &sid(i), i - 5, 2, Competition::Regular, 260 - i as i32)
                .unwrap();
        }
        v
    }

    #[tokio::test]
    async fn zero_percent_drain_degenerates_to_primary_result() {
        let v = populated_varsity();
        let primary = v.calculate_admissions().unwrap();

        let drainer = Drainer::new(v, 0).unwrap();
        let drained = drainer.run(25).await.unwrap();

        for result in &drained {
            let primary_result = primary
                .iter()
                .find(|r| r.heading_code == result.heading_code)
                .unwrap();
            let passing = primary_result.passing_score().unwrap();
            let rating = primary_result.last_admitted_rating_place().unwrap();

            assert_eq!(result.min_passing_score, passing);
            assert_eq!(result.max_passing_score, passing);
            assert_eq!(result.avg_passing_score, passing);
            assert_eq!(result.med_passing_score, passing);
            assert_eq!(result.min_last_admitted_rating_place, rating);
            assert_eq!(result.max_last_admitted_rating_place, rating);
            assert_eq!(result.avg_last_admitted_rating_place, rating);
            assert_eq!(result.med_last_admitted_rating_place, rating);
            assert_eq!(result.iterations_counted, 25);
        }
    }

    #[tokio::test]
    async fn drained_statistics_are_internally_ordered() {
        let drainer = Drainer::new(populated_varsity(), 50).unwrap();
        let drained = drainer.run(200).await.unwrap();
        assert!(!drained.is_empty());

        for result in &drained {
            assert!(result.min_passing_score <= result.med_passing_score);
            assert!(result.med_passing_score <= result.max_passing_score);
            assert!(result.min_passing_score <= result.avg_passing_score);
            assert!(result.avg_passing_score <= result.max_passing_score);

            assert!(
                result.min_last_admitted_rating_place <= result.med_last_admitted_rating_place
            );
            assert!(
                result.med_last_admitted_rating_place <= result.max_last_admitted_rating_place
            );
            assert!(
                result.min_last_admitted_rating_place <= result.avg_last_admitted_rating_place
            );
            assert!(
                result.avg_last_admitted_rating_place <= result.max_last_admitted_rating_place
            );
            assert!(result.iterations_counted > 0);
        }
    }

    #[tokio::test]
    async fn heading_without_contributions_is_omitted() {
        let mut v = populated_varsity();
        v.add_heading(
            "H3",
            Capacities {
                general: 5,
                ..Default::default()
            },
            "Nobody applies here",
        );

        let drainer = Drainer::new(v, 0).unwrap();
        let drained = drainer.run(10).await.unwrap();
        assert!(drained.iter().all(|r| r.heading_code != "H3"));
        assert!(drained.iter().any(|r| r.heading_code == "H1"));
    }

    #[tokio::test]
    async fn shutdown_before_start_produces_no_results() {
        let drainer = Drainer::new(populated_varsity(), 10).unwrap();
        let (tx, rx) = watch::channel(true);
        let drained = drainer.run_with_shutdown(100, rx).await.unwrap();
        drop(tx);
        assert!(drained.is_empty());
    }

    #[test]
    fn out_of_range_percent_is_rejected() {
        let err = Drainer::new(populated_varsity(), 101).unwrap_err();
        assert!(matches!(err, CalcError::InvalidDrainPercent(101)));
    }
}
