use indicatif::{ProgressBar, ProgressStyle};

const TEMPLATE: &str = "{msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} @ {bytes_per_sec}";

/// Per-file progress bar for the sender.
///
/// Hidden when disabled; indicatif also stays silent when stderr is not a
/// terminal.
pub fn file_bar(enabled: bool, name: &str, size: u64) -> ProgressBar {
    if !enabled {
        return ProgressBar::hidden();
    }

    let style = ProgressStyle::with_template(TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");

    let bar = ProgressBar::new(size).with_style(style);
    bar.set_message(name.to_string());
    bar
}
