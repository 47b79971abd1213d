// ── Conjugate Model Math ─────────────────────────────────────────────────────
// Pure functions over ModelParams: seeding, posterior recursions, means,
// variances, intervals, and the delta scaling/capping applied before commit.
// No locking and no store access here; commit semantics live in repository.

use crate::atoms::error::{CoreError, CoreResult};
use crate::atoms::types::{CredibleInterval, Evidence, ModelKind, ModelParams};

// ── Constants ────────────────────────────────────────────────────────────────

/// Effective sample size at which derived confidence reaches 0.5.
pub const ESS_HALF: f64 = 10.0;

/// Credible-interval mass used by default reads.
pub const DEFAULT_INTERVAL_LEVEL: f64 = 0.95;

/// Pseudo-count weight of a reference prior before prior-strength scaling.
const SEED_WEIGHT: f64 = 1.0;

// ── Seeding ──────────────────────────────────────────────────────────────────

/// Reference prior for a freshly created belief.
///
/// The evidential weight is `strength_scale` pseudo-counts. For normal-gamma
/// the location is seeded from the creating batch's sample mean so the first
/// update does not have to fight an arbitrary default; beta and gamma seeds
/// are symmetric (uniform success rate, unit rate).
pub fn seed_params(
    kind: ModelKind,
    evidence: &Evidence,
    strength_scale: f64,
) -> CoreResult<ModelParams> {
    evidence.validate()?;
    let s = SEED_WEIGHT * strength_scale;
    let params = match kind {
        ModelKind::BetaBinomial => ModelParams::BetaBinomial { alpha: s, beta: s },
        ModelKind::NormalGamma => {
            let (_, mean, _) = continuous_stats(evidence)?;
            ModelParams::NormalGamma {
                mu: mean,
                kappa: s,
                alpha: s,
                beta: s,
            }
        }
        ModelKind::GammaPoisson => ModelParams::GammaPoisson { alpha: s, beta: s },
    };
    Ok(params)
}

/// Prior for a context-forked child: the parent's posterior mean at reset
/// evidential weight. The child starts where the parent points but must earn
/// its confidence from its own observations.
pub fn reseed_from_parent(parent: &ModelParams, strength_scale: f64) -> ModelParams {
    let s = SEED_WEIGHT * strength_scale;
    match *parent {
        ModelParams::BetaBinomial { alpha, beta } => {
            let m = alpha / (alpha + beta);
            let w = 2.0 * s;
            ModelParams::BetaBinomial {
                alpha: m * w,
                beta: (1.0 - m) * w,
            }
        }
        ModelParams::NormalGamma {
            mu, alpha, beta, ..
        } => ModelParams::NormalGamma {
            // Keep the location and the variance ratio; reset the weight.
            mu,
            kappa: s,
            alpha: s,
            beta: s * (beta / alpha),
        },
        ModelParams::GammaPoisson { alpha, beta } => ModelParams::GammaPoisson {
            alpha: s * (alpha / beta),
            beta: s,
        },
    }
}

// ── Posterior recursions ─────────────────────────────────────────────────────

/// Raw conjugate posterior for `params` absorbing `evidence`, before any
/// learning-rate scaling or movement capping.
pub fn posterior(params: &ModelParams, evidence: &Evidence) -> CoreResult<ModelParams> {
    evidence.validate()?;
    match (*params, evidence) {
        (
            ModelParams::BetaBinomial { alpha, beta },
            Evidence::Binary {
                successes,
                failures,
            },
        ) => Ok(ModelParams::BetaBinomial {
            alpha: alpha + *successes as f64,
            beta: beta + *failures as f64,
        }),
        (ModelParams::NormalGamma { mu, kappa, alpha, beta }, Evidence::Continuous { .. }) => {
            let (n, mean, ss) = continuous_stats(evidence)?;
            let kappa_n = kappa + n;
            Ok(ModelParams::NormalGamma {
                mu: (kappa * mu + n * mean) / kappa_n,
                kappa: kappa_n,
                alpha: alpha + n / 2.0,
                beta: beta + 0.5 * ss + (kappa * n * (mean - mu).powi(2)) / (2.0 * kappa_n),
            })
        }
        (ModelParams::GammaPoisson { alpha, beta }, Evidence::Counts { counts }) => {
            let total: u64 = counts.iter().sum();
            Ok(ModelParams::GammaPoisson {
                alpha: alpha + total as f64,
                beta: beta + counts.len() as f64,
            })
        }
        (p, e) => Err(CoreError::invalid_shape(format!(
            "{} evidence cannot update a {} model",
            e.implied_kind(),
            p.kind()
        ))),
    }
}

/// (n, sample mean, sum of squared deviations) for continuous evidence.
fn continuous_stats(evidence: &Evidence) -> CoreResult<(f64, f64, f64)> {
    match evidence {
        Evidence::Continuous { values } if !values.is_empty() => {
            let n = values.len() as f64;
            let mean = values.iter().sum::<f64>() / n;
            let ss = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>();
            Ok((n, mean, ss))
        }
        _ => Err(CoreError::invalid_shape("continuous evidence required")),
    }
}

// ── Delta scaling and movement capping ───────────────────────────────────────

/// Scale the movement from `current` toward `target` by `learning_rate`,
/// then cap the total (L1) movement at `cap` when one is given.
///
/// Capping scales all deltas proportionally, so the posterior direction is
/// preserved and no single parameter can move more than the cap. Returns the
/// blended parameters and whether the cap shortened the step.
pub fn apply_step(
    current: &ModelParams,
    target: &ModelParams,
    learning_rate: f64,
    cap: Option<f64>,
) -> (ModelParams, bool) {
    let cur = current.components();
    let tgt = target.components();
    let mut deltas: Vec<f64> = cur
        .iter()
        .zip(tgt.iter())
        .map(|(c, t)| (t.1 - c.1) * learning_rate)
        .collect();

    let mut clamped = false;
    if let Some(cap) = cap {
        let movement: f64 = deltas.iter().map(|d| d.abs()).sum();
        if movement > cap {
            let scale = cap / movement;
            for d in &mut deltas {
                *d *= scale;
            }
            clamped = true;
        }
    }

    (rebuild(current, &deltas), clamped)
}

/// Re-assemble params from deltas aligned with `components()` order.
fn rebuild(current: &ModelParams, deltas: &[f64]) -> ModelParams {
    match *current {
        ModelParams::BetaBinomial { alpha, beta } => ModelParams::BetaBinomial {
            alpha: alpha + deltas[0],
            beta: beta + deltas[1],
        },
        ModelParams::NormalGamma {
            mu,
            kappa,
            alpha,
            beta,
        } => ModelParams::NormalGamma {
            mu: mu + deltas[0],
            kappa: kappa + deltas[1],
            alpha: alpha + deltas[2],
            beta: beta + deltas[3],
        },
        ModelParams::GammaPoisson { alpha, beta } => ModelParams::GammaPoisson {
            alpha: alpha + deltas[0],
            beta: beta + deltas[1],
        },
    }
}

// ── Derived reads ────────────────────────────────────────────────────────────

/// Posterior mean of the modeled quantity.
pub fn mean(params: &ModelParams) -> f64 {
    match *params {
        ModelParams::BetaBinomial { alpha, beta } => alpha / (alpha + beta),
        ModelParams::NormalGamma { mu, .. } => mu,
        ModelParams::GammaPoisson { alpha, beta } => alpha / beta,
    }
}

/// Posterior variance of the modeled quantity.
///
/// Beta: αβ/((α+β)²(α+β+1)). Normal-gamma: marginal scale of the mean,
/// β/(κα). Gamma: α/β².
pub fn variance(params: &ModelParams) -> f64 {
    match *params {
        ModelParams::BetaBinomial { alpha, beta } => {
            let total = alpha + beta;
            (alpha * beta) / (total * total * (total + 1.0))
        }
        ModelParams::NormalGamma {
            kappa, alpha, beta, ..
        } => beta / (kappa * alpha),
        ModelParams::GammaPoisson { alpha, beta } => alpha / (beta * beta),
    }
}

/// Effective sample size: the pseudo-count weight behind the posterior mean.
pub fn effective_sample_size(params: &ModelParams) -> f64 {
    match *params {
        ModelParams::BetaBinomial { alpha, beta } => alpha + beta,
        ModelParams::NormalGamma { kappa, .. } => kappa,
        ModelParams::GammaPoisson { beta, .. } => beta,
    }
}

/// Confidence in [0, 1): effective-sample-size saturation, with the staleness
/// weight multiplied into the pseudo-counts first. Never cached anywhere.
pub fn confidence(params: &ModelParams, staleness_weight: f64) -> f64 {
    let ess = effective_sample_size(params) * staleness_weight.clamp(0.0, 1.0);
    ess / (ess + ESS_HALF)
}

/// Central credible interval via the normal approximation around the
/// posterior mean. Beta and gamma bounds are clamped to their supports.
pub fn credible_interval(params: &ModelParams, level: f64) -> CredibleInterval {
    discounted_interval(params, level, 1.0)
}

/// Credible interval with the evidence weight reduced for staleness: a
/// weight below 1.0 inflates the effective variance by 1/weight, widening
/// the bounds while the stored parameters stay untouched.
pub fn discounted_interval(
    params: &ModelParams,
    level: f64,
    staleness_weight: f64,
) -> CredibleInterval {
    let z = normal_quantile((1.0 + level) / 2.0);
    let m = mean(params);
    let weight = staleness_weight.clamp(f64::MIN_POSITIVE, 1.0);
    let sd = (variance(params) / weight).sqrt();
    let (lo, hi) = match params.kind() {
        ModelKind::BetaBinomial => ((m - z * sd).max(0.0), (m + z * sd).min(1.0)),
        ModelKind::GammaPoisson => ((m - z * sd).max(0.0), m + z * sd),
        ModelKind::NormalGamma => (m - z * sd, m + z * sd),
    };
    CredibleInterval { lo, hi, level }
}

/// Standard-normal quantile via the Abramowitz–Stegun 26.2.23 rational
/// approximation. Absolute error < 4.5e-4, plenty for interval bounds.
fn normal_quantile(p: f64) -> f64 {
    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    if (p - 0.5).abs() < 1e-12 {
        return 0.0;
    }

    let (tail, sign) = if p < 0.5 { (p, -1.0) } else { (1.0 - p, 1.0) };
    let t = (-2.0 * tail.ln()).sqrt();

    const C0: f64 = 2.515517;
    const C1: f64 = 0.802853;
    const C2: f64 = 0.010328;
    const D1: f64 = 1.432788;
    const D2: f64 = 0.189269;
    const D3: f64 = 0.001308;

    let numerator = C0 + t * (C1 + t * C2);
    let denominator = 1.0 + t * (D1 + t * (D2 + t * D3));
    sign * (t - numerator / denominator)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64, eps: f64) -> bool {
        (a - b).abs() < eps
    }

    #[test]
    fn test_beta_binomial_posterior_and_mean() {
        // Uniform prior plus 8 successes / 2 failures lands at 0.75.
        let prior = ModelParams::BetaBinomial {
            alpha: 1.0,
            beta: 1.0,
        };
        let evidence = Evidence::Binary {
            successes: 8,
            failures: 2,
        };
        let post = posterior(&prior, &evidence).unwrap();
        assert_eq!(
            post,
            ModelParams::BetaBinomial {
                alpha: 9.0,
                beta: 3.0
            }
        );
        assert!(approx(mean(&post), 0.75, 1e-12));
    }

    #[test]
    fn test_normal_gamma_recursion() {
        let prior = ModelParams::NormalGamma {
            mu: 0.0,
            kappa: 1.0,
            alpha: 1.0,
            beta: 1.0,
        };
        let evidence = Evidence::Continuous {
            values: vec![2.0, 2.0, 2.0],
        };
        let post = posterior(&prior, &evidence).unwrap();
        match post {
            ModelParams::NormalGamma {
                mu,
                kappa,
                alpha,
                beta,
            } => {
                assert!(approx(mu, 1.5, 1e-12));
                assert!(approx(kappa, 4.0, 1e-12));
                assert!(approx(alpha, 2.5, 1e-12));
                // SS = 0, so β grows only by the κn(x̄−μ₀)²/2(κ+n) term: 1.5.
                assert!(approx(beta, 2.5, 1e-12));
            }
            other => panic!("wrong variant: {:?}", other),
        }
        assert!(approx(mean(&post), 1.5, 1e-12));
    }

    #[test]
    fn test_gamma_poisson_recursion() {
        let prior = ModelParams::GammaPoisson {
            alpha: 1.0,
            beta: 1.0,
        };
        let evidence = Evidence::Counts { counts: vec![3, 5] };
        let post = posterior(&prior, &evidence).unwrap();
        assert_eq!(
            post,
            ModelParams::GammaPoisson {
                alpha: 9.0,
                beta: 3.0
            }
        );
        assert!(approx(mean(&post), 3.0, 1e-12));
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let prior = ModelParams::BetaBinomial {
            alpha: 1.0,
            beta: 1.0,
        };
        let err = posterior(&prior, &Evidence::count(4)).unwrap_err();
        assert_eq!(err.kind_label(), "invalid_shape");
    }

    #[test]
    fn test_learning_rate_scales_deltas() {
        let current = ModelParams::BetaBinomial {
            alpha: 1.0,
            beta: 1.0,
        };
        let target = ModelParams::BetaBinomial {
            alpha: 9.0,
            beta: 3.0,
        };
        let (half, clamped) = apply_step(&current, &target, 0.5, None);
        assert!(!clamped);
        assert_eq!(
            half,
            ModelParams::BetaBinomial {
                alpha: 5.0,
                beta: 2.0
            }
        );
    }

    #[test]
    fn test_movement_cap_scales_proportionally() {
        let current = ModelParams::BetaBinomial {
            alpha: 1.0,
            beta: 1.0,
        };
        let target = ModelParams::BetaBinomial {
            alpha: 901.0,
            beta: 101.0,
        };
        // Raw movement is 900 + 100 = 1000; cap to 10 → deltas (9, 1).
        let (capped, clamped) = apply_step(&current, &target, 1.0, Some(10.0));
        assert!(clamped);
        match capped {
            ModelParams::BetaBinomial { alpha, beta } => {
                assert!(approx(alpha, 10.0, 1e-9));
                assert!(approx(beta, 2.0, 1e-9));
                // No single parameter moved more than the cap.
                assert!((alpha - 1.0).abs() <= 10.0 + 1e-9);
                assert!((beta - 1.0).abs() <= 10.0 + 1e-9);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_cap_leaves_small_steps_alone() {
        let current = ModelParams::GammaPoisson {
            alpha: 2.0,
            beta: 2.0,
        };
        let target = ModelParams::GammaPoisson {
            alpha: 3.0,
            beta: 3.0,
        };
        let (stepped, clamped) = apply_step(&current, &target, 1.0, Some(50.0));
        assert!(!clamped);
        assert_eq!(stepped, target);
    }

    #[test]
    fn test_confidence_saturates_with_evidence() {
        let light = ModelParams::BetaBinomial {
            alpha: 1.0,
            beta: 1.0,
        };
        let heavy = ModelParams::BetaBinomial {
            alpha: 500.0,
            beta: 500.0,
        };
        let c_light = confidence(&light, 1.0);
        let c_heavy = confidence(&heavy, 1.0);
        assert!(c_light < c_heavy);
        assert!(c_heavy < 1.0);
        // ESS 10 at full weight is exactly the half-way point.
        let half = ModelParams::BetaBinomial {
            alpha: 5.0,
            beta: 5.0,
        };
        assert!(approx(confidence(&half, 1.0), 0.5, 1e-12));
    }

    #[test]
    fn test_staleness_weight_discounts_confidence() {
        let params = ModelParams::GammaPoisson {
            alpha: 40.0,
            beta: 40.0,
        };
        let fresh = confidence(&params, 1.0);
        let decayed = confidence(&params, 0.25);
        assert!(decayed < fresh);
        assert!(decayed > 0.0);
    }

    #[test]
    fn test_normal_quantile_known_points() {
        assert!(approx(normal_quantile(0.5), 0.0, 1e-9));
        assert!(approx(normal_quantile(0.975), 1.96, 0.01));
        assert!(approx(normal_quantile(0.025), -1.96, 0.01));
        assert!(normal_quantile(0.0) == f64::NEG_INFINITY);
        assert!(normal_quantile(1.0) == f64::INFINITY);
    }

    #[test]
    fn test_credible_interval_respects_support() {
        let p = ModelParams::BetaBinomial {
            alpha: 1.5,
            beta: 1.5,
        };
        let ci = credible_interval(&p, 0.95);
        assert!(ci.lo >= 0.0);
        assert!(ci.hi <= 1.0);
        assert!(ci.lo < ci.hi);

        let rate = ModelParams::GammaPoisson {
            alpha: 2.0,
            beta: 8.0,
        };
        let ci = credible_interval(&rate, 0.95);
        assert!(ci.lo >= 0.0);
        assert!(ci.hi > mean(&rate));
    }

    #[test]
    fn test_discounted_interval_widens_with_lower_weight() {
        let p = ModelParams::BetaBinomial {
            alpha: 10.0,
            beta: 2.0,
        };
        let full = credible_interval(&p, 0.95);
        let quarter = discounted_interval(&p, 0.95, 0.25);
        assert!(quarter.hi - quarter.lo > full.hi - full.lo);
        assert!(quarter.lo >= 0.0 && quarter.hi <= 1.0);
        // Full weight reproduces the plain interval.
        let same = discounted_interval(&p, 0.95, 1.0);
        assert!(approx(same.lo, full.lo, 1e-12) && approx(same.hi, full.hi, 1e-12));
    }

    #[test]
    fn test_seed_params_center_on_creating_batch() {
        let seeded = seed_params(
            ModelKind::NormalGamma,
            &Evidence::Continuous {
                values: vec![10.0, 14.0],
            },
            4.0,
        )
        .unwrap();
        match seeded {
            ModelParams::NormalGamma { mu, kappa, .. } => {
                assert!(approx(mu, 12.0, 1e-12));
                assert!(approx(kappa, 4.0, 1e-12));
            }
            other => panic!("wrong variant: {:?}", other),
        }

        let uniform = seed_params(ModelKind::BetaBinomial, &Evidence::success(), 1.0).unwrap();
        assert_eq!(
            uniform,
            ModelParams::BetaBinomial {
                alpha: 1.0,
                beta: 1.0
            }
        );
    }

    #[test]
    fn test_reseed_preserves_mean_at_reset_weight() {
        let parent = ModelParams::BetaBinomial {
            alpha: 30.0,
            beta: 10.0,
        };
        let child = reseed_from_parent(&parent, 4.0);
        assert!(approx(mean(&child), mean(&parent), 1e-12));
        assert!(approx(effective_sample_size(&child), 8.0, 1e-12));

        let rate_parent = ModelParams::GammaPoisson {
            alpha: 90.0,
            beta: 30.0,
        };
        let rate_child = reseed_from_parent(&rate_parent, 1.0);
        assert!(approx(mean(&rate_child), 3.0, 1e-12));
        assert!(rate_child.positivity_violation().is_none());
    }
}
