use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

pub static PROGRESS_TEMPLATE: &str = "[{elapsed_precise}] {bar:40.cyan/blue} {human_pos:>7}/{human_len:7} {msg}";
pub static SPINNER_TOTALS_TEMPLATE: &str = "{spinner:2.cyan/blue} {msg}: {human_pos}";


pub fn new_progress_bar(total: usize, message: &str) -> ProgressBar {
    let style = ProgressStyle::with_template(PROGRESS_TEMPLATE).expect("Invalid progress bar template");
    ProgressBar::new(total as u64)
        .with_message(message.to_string())
        .with_style(style)
}

pub fn new_spinner_totals(message: &str) -> ProgressBar {
    let style = ProgressStyle::with_template(SPINNER_TOTALS_TEMPLATE).expect("Invalid spinner template");
    let spinner = ProgressBar::new_spinner()
        .with_message(message.to_string())
        .with_style(style);

    spinner
}


/// Progress bars for one table pass: rows read, rows dropped, and winners
/// emitted after dedup.
#[derive(Clone)]
pub struct MergeBars {
    _bars: MultiProgress,
    pub rows: ProgressBar,
    pub dropped: ProgressBar,
    pub winners: ProgressBar,
}

impl MergeBars {
    pub fn new(label: &str) -> MergeBars {
        let bars = MultiProgress::new();
        let rows = new_spinner_totals(&format!("{label} read"));
        let dropped = new_spinner_totals(&format!("{label} dropped"));
        let winners = new_spinner_totals(&format!("{label} merged"));
        bars.add(rows.clone());
        bars.add(dropped.clone());
        bars.add(winners.clone());

        // the render target lives with the multiprogress so the tick can
        // only be enabled after adding, otherwise the screen corrupts
        rows.enable_steady_tick(Duration::from_millis(200));
        dropped.enable_steady_tick(Duration::from_millis(200));
        winners.enable_steady_tick(Duration::from_millis(200));

        MergeBars {
            _bars: bars,
            rows,
            dropped,
            winners,
        }
    }

    pub fn finish(&self) {
        self.rows.finish();
        self.dropped.finish();
        self.winners.finish();
    }
}


/// Cooperative cancellation flag shared by every worker. Checked at queue
/// waits and between rows; a cancelled run publishes no partial outputs.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<(), crate::errors::Error> {
        if self.is_cancelled() {
            Err(crate::errors::Error::Cancelled)
        }
        else {
            Ok(())
        }
    }
}
