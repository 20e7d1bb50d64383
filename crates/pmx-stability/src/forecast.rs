//! State-change risk forecast: empirical Markov chain over observed
//! soft-target class transitions.

use pmx_schemas::SoftTargetClass;

const N: usize = 5;

/// Row-stochastic 5×5 transition matrix over soft-target classes.
///
/// Rows with no observations default to "stay" (identity row), so a fresh
/// entity forecasts no spontaneous change.
#[derive(Clone, Debug, PartialEq)]
pub struct TransitionMatrix {
    p: [[f64; N]; N],
}

impl TransitionMatrix {
    pub fn identity() -> Self {
        let mut p = [[0.0; N]; N];
        for (i, row) in p.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        Self { p }
    }

    /// Fit from observed per-entity class sequences (each oldest→newest).
    /// Counts every adjacent pair; rows without observations stay identity.
    pub fn fit(sequences: &[Vec<SoftTargetClass>]) -> Self {
        let mut counts = [[0u64; N]; N];
        for seq in sequences {
            for w in seq.windows(2) {
                counts[w[0].index()][w[1].index()] += 1;
            }
        }

        let mut p = [[0.0; N]; N];
        for i in 0..N {
            let total: u64 = counts[i].iter().sum();
            if total == 0 {
                p[i][i] = 1.0;
            } else {
                for j in 0..N {
                    p[i][j] = counts[i][j] as f64 / total as f64;
                }
            }
        }
        Self { p }
    }

    pub fn prob(&self, from: SoftTargetClass, to: SoftTargetClass) -> f64 {
        self.p[from.index()][to.index()]
    }

    /// Probability of hitting any state in `targets` within `horizon` steps,
    /// starting from `from`. Target states are made absorbing, so this is a
    /// first-passage probability, monotone non-decreasing in the horizon.
    pub fn hit_probability(
        &self,
        from: SoftTargetClass,
        targets: &[SoftTargetClass],
        horizon: u32,
    ) -> f64 {
        let is_target = |i: usize| targets.iter().any(|t| t.index() == i);
        if is_target(from.index()) {
            return 1.0;
        }

        // Distribution over states with targets absorbing.
        let mut dist = [0.0f64; N];
        dist[from.index()] = 1.0;
        let mut absorbed = 0.0f64;

        for _ in 0..horizon {
            let mut next = [0.0f64; N];
            for i in 0..N {
                if dist[i] == 0.0 {
                    continue;
                }
                for j in 0..N {
                    let m = dist[i] * self.p[i][j];
                    if m == 0.0 {
                        continue;
                    }
                    if is_target(j) {
                        absorbed += m;
                    } else {
                        next[j] += m;
                    }
                }
            }
            dist = next;
        }
        absorbed.min(1.0)
    }
}

/// Forecast outputs for one entity at one date.
#[derive(Clone, Debug, PartialEq)]
pub struct StateChangeForecast {
    pub horizon_steps: u32,
    /// Probability of reaching any class worse than the current one within
    /// the horizon.
    pub p_worsen_any: f64,
    /// Probability of reaching Targetable or Breaker within the horizon.
    pub p_to_targetable_or_breaker: f64,
    /// `max(p_worsen_any, p_to_targetable_or_breaker)`; hitting
    /// probabilities are monotone in the horizon, so this is the max over
    /// horizons 1..H as well.
    pub risk_score: f64,
}

pub fn forecast(
    matrix: &TransitionMatrix,
    current: SoftTargetClass,
    horizon_steps: u32,
) -> StateChangeForecast {
    let worse: Vec<SoftTargetClass> = SoftTargetClass::ALL
        .iter()
        .copied()
        .filter(|c| c > &current)
        .collect();

    let p_worsen_any = if worse.is_empty() {
        // Breaker cannot worsen further.
        0.0
    } else {
        matrix.hit_probability(current, &worse, horizon_steps)
    };

    let p_to_targetable_or_breaker = matrix.hit_probability(
        current,
        &[SoftTargetClass::Targetable, SoftTargetClass::Breaker],
        horizon_steps,
    );

    StateChangeForecast {
        horizon_steps,
        p_worsen_any,
        p_to_targetable_or_breaker,
        risk_score: p_worsen_any.max(p_to_targetable_or_breaker).clamp(0.0, 1.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SoftTargetClass::*;

    #[test]
    fn identity_matrix_forecasts_no_change() {
        let m = TransitionMatrix::identity();
        let f = forecast(&m, Watch, 5);
        assert_eq!(f.p_worsen_any, 0.0);
        assert_eq!(f.p_to_targetable_or_breaker, 0.0);
        assert_eq!(f.risk_score, 0.0);
    }

    #[test]
    fn fit_counts_transitions() {
        let m = TransitionMatrix::fit(&[vec![Stable, Watch, Watch, Fragile]]);
        // Stable → Watch observed once out of one.
        assert_eq!(m.prob(Stable, Watch), 1.0);
        // Watch: one stay, one to Fragile.
        assert_eq!(m.prob(Watch, Watch), 0.5);
        assert_eq!(m.prob(Watch, Fragile), 0.5);
        // Unobserved rows are identity.
        assert_eq!(m.prob(Breaker, Breaker), 1.0);
    }

    #[test]
    fn hit_probability_is_monotone_in_horizon() {
        let m = TransitionMatrix::fit(&[vec![
            Watch, Fragile, Watch, Fragile, Targetable, Fragile, Watch,
        ]]);
        let mut prev = 0.0;
        for h in 1..=8 {
            let p = m.hit_probability(Watch, &[Targetable, Breaker], h);
            assert!(p >= prev - 1e-12, "horizon {h}: {p} < {prev}");
            prev = p;
        }
    }

    #[test]
    fn starting_in_target_state_is_certain() {
        let m = TransitionMatrix::identity();
        assert_eq!(m.hit_probability(Targetable, &[Targetable, Breaker], 1), 1.0);
    }

    #[test]
    fn breaker_cannot_worsen() {
        let m = TransitionMatrix::fit(&[vec![Breaker, Breaker, Targetable]]);
        let f = forecast(&m, Breaker, 5);
        assert_eq!(f.p_worsen_any, 0.0);
        // But it is already in the targetable-or-breaker set.
        assert_eq!(f.p_to_targetable_or_breaker, 1.0);
        assert_eq!(f.risk_score, 1.0);
    }

    #[test]
    fn risk_score_in_unit_interval() {
        let m = TransitionMatrix::fit(&[vec![Stable, Fragile, Targetable, Breaker]]);
        for c in SoftTargetClass::ALL {
            let f = forecast(&m, *c, 5);
            assert!((0.0..=1.0).contains(&f.risk_score));
        }
    }
}
