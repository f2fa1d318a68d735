#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Terminal helpers for the ferry CLI.
//!
//! [`init_logger`] routes `log` output through `indicatif-log-bridge` so log
//! lines and the fetch progress bar share the terminal cleanly.

use std::sync::Arc;
use std::time::Duration;

use ferry_transport::progress::ProgressCallback;
use indicatif::{ProgressBar, ProgressStyle};

pub use indicatif::MultiProgress;

/// Redraw interval of the spinner shown while storages connect.
const SPINNER_TICK: Duration = Duration::from_millis(120);

/// Progress of a transport run, drawn with `indicatif`.
///
/// One unit is one completed fetch. Until the fetch count is known the bar
/// is a spinner showing the connection stage.
pub struct IndicatifProgress {
    bar: ProgressBar,
    counting: ProgressStyle,
}

impl IndicatifProgress {
    /// Adds a fetch bar to `multi`, labelled `message` until fetching starts.
    #[must_use]
    pub fn fetches_bar(multi: &MultiProgress, message: &str) -> Arc<dyn ProgressCallback> {
        let bar = multi.add(ProgressBar::new_spinner());
        bar.enable_steady_tick(SPINNER_TICK);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.green} {msg} [{elapsed}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(message.to_string());

        let counting = ProgressStyle::with_template(
            "{msg:>10} {wide_bar:.green/dim} {pos}/{len} fetches [{elapsed}<{eta}]",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");

        Arc::new(Self { bar, counting })
    }
}

impl ProgressCallback for IndicatifProgress {
    fn set_total(&self, total: u64) {
        self.bar.set_length(total);
        self.bar.set_position(0);
        self.bar.set_style(self.counting.clone());
    }

    fn inc(&self, delta: u64) {
        self.bar.inc(delta);
    }

    fn set_message(&self, msg: String) {
        self.bar.set_message(msg);
    }

    fn finish(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }
}

/// Sets up logging for the `ferry` binary.
///
/// `pretty_env_logger` honours `RUST_LOG` and writes through
/// `indicatif-log-bridge`, which hides the fetch bar while a line is
/// printed. The returned [`MultiProgress`] is the one [`IndicatifProgress`]
/// bars must be added to.
#[must_use]
pub fn init_logger() -> MultiProgress {
    let multi = MultiProgress::new();
    let logger = pretty_env_logger::formatted_timed_builder()
        .parse_env("RUST_LOG")
        .build();
    let max_level = logger.filter();

    if indicatif_log_bridge::LogWrapper::new(multi.clone(), logger)
        .try_init()
        .is_err()
    {
        log::debug!("Logger already installed, keeping it");
    }
    log::set_max_level(max_level);

    multi
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetches_bar_tracks_progress() {
        let multi = MultiProgress::with_draw_target(indicatif::ProgressDrawTarget::hidden());
        let progress = IndicatifProgress::fetches_bar(&multi, "Fetching");

        progress.set_total(5);
        progress.inc(2);
        progress.set_message("products".to_string());
        progress.finish("done".to_string());
    }

    #[test]
    fn init_logger_can_be_called_twice() {
        let _first = init_logger();
        let _second = init_logger();
    }
}
