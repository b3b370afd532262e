//! Descriptive statistics over a set of submissions.

use crate::record::Record;
use ahash::AHashSet;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Summary {
    pub n_sub: usize,
    pub n_comm: i64,
    pub score_mean: f64,
    pub score_std: f64,
    /// Distinct authors; a missing author counts as one value.
    pub unique_authors: usize,
    pub comments_mean: f64,
    pub comments_std: f64,
    /// Mean comments per submission.
    pub r: f64,
}

/// Summary of `records`. Standard deviations are sample (n - 1) and NaN below two rows.
pub fn summarize(records: &[Record]) -> Summary {
    let scores: Vec<f64> = records.iter().map(|r| r.score as f64).collect();
    let comments: Vec<f64> = records.iter().map(|r| r.num_comments as f64).collect();
    let authors: AHashSet<Option<&str>> = records.iter().map(|r| r.author.as_deref()).collect();
    let comments_mean = mean(&comments);

    Summary {
        n_sub: records.len(),
        n_comm: records.iter().map(|r| r.num_comments).sum(),
        score_mean: mean(&scores),
        score_std: sample_std(&scores),
        unique_authors: authors.len(),
        comments_mean,
        comments_std: sample_std(&comments),
        r: comments_mean,
    }
}

pub fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return f64::NAN;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

pub fn sample_std(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return f64::NAN;
    }
    let m = mean(xs);
    let ss: f64 = xs.iter().map(|x| (x - m) * (x - m)).sum();
    (ss / (xs.len() - 1) as f64).sqrt()
}
