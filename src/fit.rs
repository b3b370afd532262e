//! Heavy-tail fits of engagement counts: power law, truncated power law,
//! exponential and lognormal, all fitted on the tail `x >= xmin`, plus Vuong
//! likelihood-ratio comparison.
//!
//! `xmin` is picked by minimising the Kolmogorov-Smirnov distance between the
//! tail and its power-law fit (Clauset, Shalizi & Newman 2009). Discrete data
//! uses the usual `xmin - 1/2` continuity approximation.

use anyhow::{bail, Result};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::f64::consts::{PI, SQRT_2};

#[derive(Clone, Copy, Debug, Default)]
pub struct FitOptions {
    /// Fixed lower cutoff; selected by KS distance when `None`.
    pub xmin: Option<f64>,
    /// Values above this are discarded before fitting.
    pub xmax: Option<f64>,
    pub discrete: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    PowerLaw,
    TruncatedPowerLaw,
    Exponential,
    LognormalPositive,
}

impl Distribution {
    pub const ALL: [Distribution; 4] = [
        Distribution::PowerLaw,
        Distribution::TruncatedPowerLaw,
        Distribution::Exponential,
        Distribution::LognormalPositive,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Distribution::PowerLaw => "power_law",
            Distribution::TruncatedPowerLaw => "truncated_power_law",
            Distribution::Exponential => "exponential",
            Distribution::LognormalPositive => "lognormal_positive",
        }
    }
}

/// Parameters fitted on one dataset.
#[derive(Clone, Debug)]
pub struct Fit {
    /// Tail values (`>= xmin`), ascending.
    tail: Vec<f64>,
    /// Largest value kept after the `xmax` cut.
    max: f64,
    pub xmin: f64,
    pub discrete: bool,
    pub alpha: f64,
    /// Truncated power law `x^-alpha e^(-lambda x)`.
    pub trunc_alpha: f64,
    pub trunc_lambda: f64,
    pub lambda: f64,
    pub mu: f64,
    pub sigma: f64,
    /// KS distance of the power-law fit at `xmin`.
    pub ks: f64,
}

impl Fit {
    pub fn new(data: &[f64], opts: FitOptions) -> Result<Self> {
        let mut xs: Vec<f64> = data
            .iter()
            .copied()
            .filter(|x| x.is_finite() && *x > 0.0)
            .filter(|x| opts.xmax.map_or(true, |m| *x <= m))
            .collect();
        if xs.is_empty() {
            bail!("no positive values to fit");
        }
        xs.sort_by(f64::total_cmp);
        let max = xs[xs.len() - 1];

        let (xmin, alpha, ks) = match opts.xmin {
            Some(xmin) => {
                let start = xs.partition_point(|x| *x < xmin);
                let tail = &xs[start..];
                if tail.is_empty() {
                    bail!("no values at or above xmin = {xmin}");
                }
                let alpha = power_law_alpha(tail, xmin, opts.discrete);
                (xmin, alpha, ks_distance(tail, xmin, alpha, opts.discrete))
            }
            None => select_xmin(&xs, opts.discrete)?,
        };

        let start = xs.partition_point(|x| *x < xmin);
        let tail = xs.split_off(start);
        let x0 = shifted(xmin, opts.discrete);

        let mean = tail.iter().sum::<f64>() / tail.len() as f64;
        let lambda = 1.0 / (mean - x0);
        let logs: Vec<f64> = tail.iter().map(|x| x.ln()).collect();
        let mu = logs.iter().sum::<f64>() / logs.len() as f64;
        let sigma = (logs.iter().map(|l| (l - mu) * (l - mu)).sum::<f64>() / logs.len() as f64).sqrt();
        let (trunc_alpha, trunc_lambda) = truncated_power_law_mle(mu, mean, x0, alpha, lambda);

        Ok(Self { tail, max, xmin, discrete: opts.discrete, alpha, trunc_alpha, trunc_lambda, lambda, mu, sigma, ks })
    }

    /// Number of values in the fitted tail.
    pub fn n_tail(&self) -> usize {
        self.tail.len()
    }

    /// Largest value the fit saw.
    pub fn xmax(&self) -> f64 {
        self.max
    }

    /// Pointwise log-likelihood of the tail under `dist`.
    pub fn loglikelihoods(&self, dist: Distribution) -> Vec<f64> {
        let x0 = shifted(self.xmin, self.discrete);
        match dist {
            Distribution::PowerLaw => {
                let c = (self.alpha - 1.0).ln() - x0.ln();
                self.tail.iter().map(|x| c - self.alpha * (x / x0).ln()).collect()
            }
            Distribution::TruncatedPowerLaw => {
                let c = -ln_truncated_norm(self.trunc_alpha, self.trunc_lambda, x0);
                self.tail.iter().map(|x| c - self.trunc_alpha * x.ln() - self.trunc_lambda * x).collect()
            }
            Distribution::Exponential => {
                let c = self.lambda.ln();
                self.tail.iter().map(|x| c - self.lambda * (x - x0)).collect()
            }
            Distribution::LognormalPositive => {
                // Normalised over [x0, inf).
                let survival = 0.5 * erfc((x0.ln() - self.mu) / (self.sigma * SQRT_2));
                let c = -self.sigma.ln() - 0.5 * (2.0 * PI).ln() - survival.ln();
                self.tail
                    .iter()
                    .map(|x| {
                        let z = x.ln() - self.mu;
                        c - x.ln() - z * z / (2.0 * self.sigma * self.sigma)
                    })
                    .collect()
            }
        }
    }

    /// Log-likelihood ratio `R` of `a` over `b` and its p-value.
    /// `R > 0` favours `a`; a small p means the sign of `R` is significant.
    ///
    /// The power law is nested in the truncated power law (`lambda = 0`), so that
    /// pair uses the chi-squared test on `2R` with one degree of freedom; every
    /// other pair uses Vuong's normalised test.
    pub fn compare(&self, a: Distribution, b: Distribution) -> (f64, f64) {
        let la = self.loglikelihoods(a);
        let lb = self.loglikelihoods(b);
        let diffs: Vec<f64> = la.iter().zip(&lb).map(|(x, y)| x - y).collect();
        if diffs.is_empty() || diffs.iter().any(|d| !d.is_finite()) {
            return (0.0, 1.0);
        }
        let n = diffs.len() as f64;
        let r: f64 = diffs.iter().sum();
        if is_nested(a, b) {
            // P(chi2_1 > 2|R|) = erfc(sqrt(|R|))
            return (r, erfc(r.abs().sqrt()));
        }
        let m = r / n;
        let sd = (diffs.iter().map(|d| (d - m) * (d - m)).sum::<f64>() / n).sqrt();
        if sd == 0.0 {
            return (r, if r == 0.0 { 1.0 } else { 0.0 });
        }
        (r, erfc(r.abs() / ((2.0 * n).sqrt() * sd)))
    }
}

/// Outcome of [`fit_compare`].
#[derive(Clone, Debug, Serialize)]
pub struct FitReport {
    /// Significant pairwise wins per distribution.
    pub scores: BTreeMap<&'static str, u32>,
    /// The distribution that won every comparison, if any.
    pub best_fit: Option<&'static str>,
    pub power_law_alpha: f64,
    pub power_law_xmin: f64,
    pub power_law_xmax: f64,
    /// Decades spanned by the fitted tail.
    pub power_law_orders: f64,
    pub truncated_power_law_alpha: f64,
    pub truncated_power_law_lambda: f64,
    pub truncated_power_law_xmin: f64,
    pub truncated_power_law_xmax: f64,
    pub truncated_power_law_orders: f64,
    pub exp_lambda: f64,
    pub lognormal_positive_mu: f64,
    pub lognormal_positive_sigma: f64,
}

/// Fit every distribution to `data` and compare all pairs at significance `p_lim`.
pub fn fit_compare(data: &[f64], discrete: bool, p_lim: f64) -> Result<FitReport> {
    let fit = Fit::new(data, FitOptions { discrete, ..FitOptions::default() })?;

    let mut scores: BTreeMap<&'static str, u32> = Distribution::ALL.iter().map(|d| (d.name(), 0)).collect();
    for (i, a) in Distribution::ALL.iter().enumerate() {
        for b in &Distribution::ALL[i + 1..] {
            let (r, p) = fit.compare(*a, *b);
            if p < p_lim {
                let winner = if r > 0.0 { a } else { b };
                *scores.entry(winner.name()).or_insert(0) += 1;
            }
        }
    }
    let rivals = (Distribution::ALL.len() - 1) as u32;
    let best_fit = Distribution::ALL.iter().map(|d| d.name()).find(|n| scores.get(n) == Some(&rivals));

    let (xmin, xmax) = (fit.xmin, fit.xmax());
    let orders = if xmax > xmin { xmax.log10() - xmin.log10() } else { 0.0 };
    Ok(FitReport {
        scores,
        best_fit,
        power_law_alpha: fit.alpha,
        power_law_xmin: xmin,
        power_law_xmax: xmax.max(xmin),
        power_law_orders: orders,
        truncated_power_law_alpha: fit.trunc_alpha,
        truncated_power_law_lambda: fit.trunc_lambda,
        truncated_power_law_xmin: xmin,
        truncated_power_law_xmax: xmax.max(xmin),
        truncated_power_law_orders: orders,
        exp_lambda: fit.lambda,
        lognormal_positive_mu: fit.mu,
        lognormal_positive_sigma: fit.sigma,
    })
}

fn is_nested(a: Distribution, b: Distribution) -> bool {
    use Distribution::{PowerLaw, TruncatedPowerLaw};
    matches!((a, b), (PowerLaw, TruncatedPowerLaw) | (TruncatedPowerLaw, PowerLaw))
}

fn shifted(xmin: f64, discrete: bool) -> f64 {
    if discrete {
        xmin - 0.5
    } else {
        xmin
    }
}

/// MLE exponent on a tail whose values are all `>= xmin`.
fn power_law_alpha(tail: &[f64], xmin: f64, discrete: bool) -> f64 {
    let x0 = shifted(xmin, discrete);
    let s: f64 = tail.iter().map(|x| (x / x0).ln()).sum();
    1.0 + tail.len() as f64 / s
}

/// `ln` of the normaliser `∫_x0^∞ x^-alpha e^(-lambda x) dx`, which is
/// `lambda^(alpha-1) Γ(1-alpha, lambda x0)` for `lambda > 0`.
fn ln_truncated_norm(alpha: f64, lambda: f64, x0: f64) -> f64 {
    if lambda > 0.0 {
        (alpha - 1.0) * lambda.ln() + ln_upper_gamma(1.0 - alpha, lambda * x0)
    } else if alpha > 1.0 {
        // Plain power law.
        (1.0 - alpha) * x0.ln() - (alpha - 1.0).ln()
    } else {
        f64::INFINITY
    }
}

/// `ln Γ(s, z)`, the upper incomplete gamma function, for any real `s` and `z > 0`.
///
/// With `t = z e^u`, `Γ(s, z) = z^s e^-z ∫_0^∞ exp(s u - z (e^u - 1)) du`; the
/// integrand starts at 1 and is integrated by Simpson's rule until it drops
/// below `e^-50`. Returns infinity when it never does (the integral diverges).
pub fn ln_upper_gamma(s: f64, z: f64) -> f64 {
    const STEPS: usize = 1024;
    if z.is_nan() || z <= 0.0 || !s.is_finite() {
        return f64::NAN;
    }
    let exponent = |u: f64| s * u - z * u.exp_m1();
    let mut upper = 1.0;
    while exponent(upper) > -50.0 {
        if upper >= 700.0 {
            return f64::INFINITY;
        }
        upper = (upper * 2.0).min(700.0);
    }
    let h = upper / STEPS as f64;
    let mut acc = exponent(0.0).exp() + exponent(upper).exp();
    for i in 1..STEPS {
        let w = if i % 2 == 1 { 4.0 } else { 2.0 };
        acc += w * exponent(i as f64 * h).exp();
    }
    s * z.ln() - z + (acc * h / 3.0).ln()
}

/// Maximum-likelihood `(alpha, lambda)` of the truncated power law, given the
/// tail's mean log `mean_ln` and mean `mean`.
///
/// The model is an exponential family in `(alpha, lambda)`, so the negative
/// log-likelihood is convex and a nested golden-section search finds the
/// optimum. `alpha` is kept above 1 and `lambda` between 0 and twice the
/// exponential rate.
fn truncated_power_law_mle(mean_ln: f64, mean: f64, x0: f64, alpha_pl: f64, lambda_exp: f64) -> (f64, f64) {
    let nll = |alpha: f64, lambda: f64| alpha * mean_ln + lambda * mean + ln_truncated_norm(alpha, lambda, x0);
    let alpha_hi = if alpha_pl.is_finite() { alpha_pl.max(1.0) + 1.0 } else { 5.0 };
    let lambda_hi = if lambda_exp.is_finite() && lambda_exp > 0.0 { 2.0 * lambda_exp } else { 1.0 / x0 };

    let best_alpha = |lambda: f64| golden_min(1.0, alpha_hi, |a| nll(a, lambda));
    let lambda = golden_min(0.0, lambda_hi, |l| nll(best_alpha(l), l));
    (best_alpha(lambda), lambda)
}

/// Minimiser of a unimodal `f` on `[lo, hi]`.
fn golden_min(mut lo: f64, mut hi: f64, f: impl Fn(f64) -> f64) -> f64 {
    const INV_PHI: f64 = 0.618_033_988_749_895;
    let mut c = hi - INV_PHI * (hi - lo);
    let mut d = lo + INV_PHI * (hi - lo);
    let (mut fc, mut fd) = (f(c), f(d));
    for _ in 0..60 {
        if fc <= fd {
            hi = d;
            d = c;
            fd = fc;
            c = hi - INV_PHI * (hi - lo);
            fc = f(c);
        } else {
            lo = c;
            c = d;
            fc = fd;
            d = lo + INV_PHI * (hi - lo);
            fd = f(d);
        }
    }
    0.5 * (lo + hi)
}

/// Largest gap between the tail's empirical CDF and the fitted power-law CDF.
fn ks_distance(tail: &[f64], xmin: f64, alpha: f64, discrete: bool) -> f64 {
    let x0 = shifted(xmin, discrete);
    let n = tail.len() as f64;
    let mut d: f64 = 0.0;
    for (i, x) in tail.iter().enumerate() {
        let model = 1.0 - (x / x0).powf(1.0 - alpha);
        let lo = i as f64 / n;
        let hi = (i + 1) as f64 / n;
        d = d.max((model - lo).abs()).max((hi - model).abs());
    }
    d
}

/// Scan every distinct value as a candidate `xmin`; keep the one with minimal KS
/// distance. Candidates whose tail cannot identify an exponent are skipped.
fn select_xmin(sorted: &[f64], discrete: bool) -> Result<(f64, f64, f64)> {
    let mut starts: Vec<usize> = Vec::new();
    for i in 0..sorted.len() {
        if i == 0 || sorted[i] != sorted[i - 1] {
            starts.push(i);
        }
    }
    let best = starts
        .par_iter()
        .filter_map(|&i| {
            let xmin = sorted[i];
            let tail = &sorted[i..];
            if tail.len() < 2 {
                return None;
            }
            let alpha = power_law_alpha(tail, xmin, discrete);
            if !alpha.is_finite() || alpha <= 1.0 {
                return None;
            }
            Some((xmin, alpha, ks_distance(tail, xmin, alpha, discrete)))
        })
        .min_by(|a, b| a.2.total_cmp(&b.2).then(a.0.total_cmp(&b.0)));
    match best {
        Some(b) => Ok(b),
        None => bail!("not enough distinct values to select xmin"),
    }
}

/// Complementary error function (Numerical Recipes `erfcc`, |error| < 1.2e-7).
pub fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let poly = -z * z - 1.265_512_23
        + t * (1.000_023_68
            + t * (0.374_091_96
                + t * (0.096_784_18
                    + t * (-0.186_288_06
                        + t * (0.278_868_07
                            + t * (-1.135_203_98 + t * (1.488_515_87 + t * (-0.822_152_23 + t * 0.170_872_77))))))));
    let r = t * poly.exp();
    if x >= 0.0 {
        r
    } else {
        2.0 - r
    }
}
