//! Progress display running beside the contribution steps.

use crate::{
    timeout::{now_millis, TimeoutGuard},
    utils::format_duration,
};

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tokio::{
    task::JoinHandle,
    time::{sleep, Instant},
};

const REFRESH_INTERVAL: Duration = Duration::from_secs(1);
const SPINNER_TICK_MILLIS: u64 = 120;

///
/// A spinner describing the running step, refreshed in the background with
/// the elapsed time, the expected duration and the time left before the
/// deadline.
///
/// The refresh task is aborted when the handle is finished or dropped, so an
/// early return from a step never leaves it running.
///
pub struct StatusHandle {
    progress_bar: ProgressBar,
    refresher: JoinHandle<()>,
}

impl StatusHandle {
    pub fn start(message: String, expected: Option<Duration>, guard: TimeoutGuard, visible: bool) -> Self {
        let progress_bar = match visible {
            true => ProgressBar::new_spinner(),
            false => ProgressBar::hidden(),
        };
        progress_bar.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}"));
        progress_bar.enable_steady_tick(SPINNER_TICK_MILLIS);
        progress_bar.set_message(message.clone());

        let refreshed = progress_bar.clone();
        let refresher = tokio::spawn(async move {
            let started = Instant::now();
            loop {
                sleep(REFRESH_INTERVAL).await;
                refreshed.set_message(status_line(&message, started.elapsed(), expected, &guard));
            }
        });

        Self {
            progress_bar,
            refresher,
        }
    }

    ///
    /// Turns the spinner into a bar measuring `len` units of work.
    ///
    /// The refreshed message stays on the right of the bar.
    ///
    pub fn progress_bar(&self, len: u64) -> ProgressBar {
        self.progress_bar.set_length(len);
        self.progress_bar.set_style(
            ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}"),
        );
        self.progress_bar.clone()
    }

    pub fn finish(self, message: String) {
        self.refresher.abort();
        self.progress_bar.finish_with_message(message);
    }
}

impl Drop for StatusHandle {
    fn drop(&mut self) {
        self.refresher.abort();
        if !self.progress_bar.is_finished() {
            self.progress_bar.abandon();
        }
    }
}

fn status_line(message: &str, elapsed: Duration, expected: Option<Duration>, guard: &TimeoutGuard) -> String {
    let mut line = format!("{} (elapsed {}", message, format_duration(elapsed));
    if let Some(expected) = expected {
        line.push_str(&format!(", usually takes {}", format_duration(expected)));
    }
    if let Some(remaining) = guard.remaining_at(now_millis()) {
        line.push_str(&format!(", time left {}", remaining));
    }
    line.push(')');
    line
}
