//! Terminal progress bar sink.

use std::sync::Mutex;
use std::time::Duration;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use inferbench_core::ProgressSink;

/// Draws one progress bar per run; status lines are printed above it
#[derive(Debug, Default)]
pub struct TerminalSink {
    bar: Mutex<Option<ProgressBar>>,
    quiet: bool,
}

impl TerminalSink {
    pub fn new(quiet: bool) -> Self {
        Self {
            bar: Mutex::new(None),
            quiet,
        }
    }

    fn new_bar(name: &str, total: usize) -> ProgressBar {
        let bar = ProgressBar::new(total as u64);
        let style = ProgressStyle::with_template(
            "{spinner:.green} {prefix:.cyan.bold} [{bar:30.green/white}] {pos}/{len} {elapsed}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
        bar.set_style(style);
        bar.set_prefix(name.to_string());
        bar.enable_steady_tick(Duration::from_millis(120));
        bar
    }
}

impl ProgressSink for TerminalSink {
    fn progress(&self, name: &str, completed: usize, total: usize) {
        if self.quiet {
            return;
        }
        let Ok(mut slot) = self.bar.lock() else {
            return;
        };
        if completed == 0 || slot.is_none() {
            if let Some(old) = slot.take() {
                old.finish_and_clear();
            }
            *slot = Some(Self::new_bar(name, total));
        }
        let finished = match slot.as_ref() {
            Some(bar) => {
                bar.set_position(completed as u64);
                completed >= total
            }
            None => false,
        };
        if finished {
            if let Some(bar) = slot.take() {
                bar.finish_and_clear();
            }
        }
    }

    fn message(&self, line: &str) {
        if self.quiet {
            return;
        }
        let bar = self.bar.lock().ok().and_then(|slot| slot.clone());
        match bar {
            Some(bar) => bar.println(format!("{} {}", "•".bright_green(), line)),
            None => eprintln!("{} {}", "•".bright_green(), line),
        }
    }
}
