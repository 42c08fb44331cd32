//! Terminal progress bars, one per task

use super::{FileUi, Ui, UiFactory};
use crate::core::task::Task;
use crate::storage::BoxedReader;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Bar width in columns
const BAR_WIDTH: usize = 64;
/// Redraws per second
const REFRESH_HZ: u8 = 5;

#[derive(Debug, Clone, Copy)]
enum BarState {
    Running,
    Done,
    Failed,
}

fn style(state: BarState) -> ProgressStyle {
    let template = match state {
        BarState::Running => format!(
            "{{prefix:.bold}} [{{bar:{BAR_WIDTH}.cyan/blue}}] {{bytes}}/{{total_bytes}} {{bytes_per_sec}}"
        ),
        BarState::Done => format!("{{prefix:.bold}} [{{bar:{BAR_WIDTH}.green/grey}}] {{total_bytes}} {{msg}}"),
        BarState::Failed => format!("{{prefix:.bold}} [{{bar:{BAR_WIDTH}.red/grey}}] {{msg}}"),
    };

    ProgressStyle::with_template(&template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// Renders tasks as indicatif bars on stderr, or nowhere when quiet.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressUiFactory {
    quiet: bool,
}

impl ProgressUiFactory {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl UiFactory for ProgressUiFactory {
    fn make(&self, tasks: TaskTracker, cancel: CancellationToken) -> Arc<dyn Ui> {
        let target = if self.quiet {
            ProgressDrawTarget::hidden()
        } else {
            ProgressDrawTarget::stderr_with_hz(REFRESH_HZ)
        };
        let multi = MultiProgress::with_draw_target(target);

        // Wipe half-drawn bars when the run is cancelled; otherwise stop
        // watching once every worker is done.
        let watched = multi.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = watched.clear();
                }
                _ = tasks.wait() => {}
            }
        });

        Arc::new(ProgressUi { multi })
    }
}

pub struct ProgressUi {
    multi: MultiProgress,
}

impl Ui for ProgressUi {
    fn add_task(&self, task: &Task) -> Box<dyn FileUi> {
        let bar = self.multi.add(ProgressBar::new(task.size));
        bar.set_style(style(BarState::Running));
        bar.set_prefix(task.to_string());
        Box::new(ProgressFileUi { bar })
    }
}

struct ProgressFileUi {
    bar: ProgressBar,
}

impl FileUi for ProgressFileUi {
    fn get_reader(&self, reader: BoxedReader) -> BoxedReader {
        Box::pin(self.bar.wrap_async_read(reader))
    }

    fn on_complete(&self) {
        // Nothing is read for empty files and deletes, so fill the bar here
        if let Some(len) = self.bar.length() {
            self.bar.set_position(len);
        }
        self.bar.set_style(style(BarState::Done));
        self.bar.finish_with_message("done");
    }

    fn on_error(&self) {
        self.bar.set_style(style(BarState::Failed));
        self.bar.abandon_with_message("failed");
    }
}
