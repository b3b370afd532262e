//! Progress reporting: optional `indicatif` count bars plus percentage milestones
//! that always go to the log, for multi-hour unattended runs.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::{Arc, OnceLock};

/// Optional global MultiProgress that allows multiple bars to render concurrently.
static GLOBAL_MP: OnceLock<Arc<MultiProgress>> = OnceLock::new();

/// Install a global MultiProgress used by all subsequently created progress bars.
/// Safe to call once; additional calls are ignored.
pub fn set_global_multiprogress(mp: Arc<MultiProgress>) {
    let _ = GLOBAL_MP.set(mp);
}

fn new_bar(total: u64) -> ProgressBar {
    if let Some(mp) = GLOBAL_MP.get() {
        mp.add(ProgressBar::new(total))
    } else {
        ProgressBar::new(total)
    }
}

/// Count-style progress bar (items processed out of total), with an optional label.
pub fn make_count_progress(total: u64, label: &str) -> ProgressBar {
    let pb = new_bar(total);
    let style = ProgressStyle::with_template(
        "{spinner:.green} {msg} {pos}/{len} [{bar:.cyan/blue}] {percent:>3}%  \
         it/s: {per_sec}  elapsed: {elapsed_precise}  eta: {eta_precise}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ");
    pb.set_style(style);
    if !label.is_empty() {
        pb.set_message(label.to_string());
    }
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Open-ended counter for runs whose total is not known up front.
pub fn make_running_count(label: &str) -> ProgressBar {
    let pb = new_bar(0);
    let style = ProgressStyle::with_template("{spinner:.green} {msg} {pos}  it/s: {per_sec}  elapsed: {elapsed_precise}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_message(label.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Fires each configured percentage once, as completed work crosses it.
pub struct Milestones {
    label: String,
    total: u64,
    done: u64,
    pending: Vec<u8>,
    reached: Vec<u8>,
}

impl Milestones {
    pub const QUARTERS: [u8; 4] = [25, 50, 75, 100];

    pub fn new(label: impl Into<String>, total: u64, percents: &[u8]) -> Self {
        let mut pending: Vec<u8> = percents.iter().copied().filter(|p| *p <= 100).collect();
        pending.sort_unstable();
        pending.dedup();
        Self { label: label.into(), total, done: 0, pending, reached: Vec::new() }
    }

    pub fn quarters(label: impl Into<String>, total: u64) -> Self {
        Self::new(label, total, &Self::QUARTERS)
    }

    /// Record `n` more completed units; returns the milestones crossed by this step.
    pub fn advance(&mut self, n: u64) -> Vec<u8> {
        self.done = (self.done + n).min(self.total);
        let mut crossed = Vec::new();
        while let Some(&p) = self.pending.first() {
            // done/total >= p/100, in integers
            if self.total == 0 || self.done * 100 >= self.total * p as u64 {
                self.pending.remove(0);
                tracing::info!("{}: {}% ({}/{})", self.label, p, self.done, self.total);
                crossed.push(p);
            } else {
                break;
            }
        }
        self.reached.extend_from_slice(&crossed);
        crossed
    }

    pub fn reached(&self) -> &[u8] {
        &self.reached
    }
}
