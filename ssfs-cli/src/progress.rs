//! Progress bars and spinners rendered while data is transferred
use std::{borrow::Cow, future::Future, time::Duration};

const TICK_STRINGS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

/// Display a spinner while some long-running but unmeasurable task is running, then hide the
/// spinner when it finishes
pub(crate) async fn with_spinner<S, F, T>(globals: &super::Globals, message: S, task: F) -> T
where
    S: Into<Cow<'static, str>>,
    F: Future<Output = T>,
{
    let spinner = if !hide_progress(globals) {
        indicatif::ProgressBar::new_spinner()
    } else {
        indicatif::ProgressBar::hidden()
    };

    spinner.set_style(
        indicatif::ProgressStyle::with_template("{spinner:.blue} {msg}")
            .unwrap()
            .tick_strings(TICK_STRINGS),
    );

    spinner.enable_steady_tick(Duration::from_millis(120));

    spinner.set_message(message);

    let result = task.await;

    spinner.finish_and_clear();

    result
}

/// Make a progress bar for a transfer of `total` bytes.
///
/// When the total isn't known in advance (stdin, or an archive) this is a spinner which counts the
/// bytes transferred so far.  Wrap the reader or writer being copied with the bar to drive it.
pub(crate) fn transfer_bar<S>(
    globals: &super::Globals,
    total: Option<u64>,
    message: S,
) -> indicatif::ProgressBar
where
    S: Into<Cow<'static, str>>,
{
    if hide_progress(globals) {
        return indicatif::ProgressBar::hidden();
    }

    let bar = match total {
        Some(total) => {
            let bar = indicatif::ProgressBar::new(total);
            bar.set_style(
                indicatif::ProgressStyle::with_template(
                    "{msg}\n[{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
                )
                .unwrap()
                .progress_chars("#>-"),
            );

            bar
        }
        None => {
            let bar = indicatif::ProgressBar::new_spinner();
            bar.set_style(
                indicatif::ProgressStyle::with_template(
                    "{spinner:.blue} {msg} [{elapsed_precise}] {bytes} ({bytes_per_sec})",
                )
                .unwrap()
                .tick_strings(TICK_STRINGS),
            );
            bar.enable_steady_tick(Duration::from_millis(120));

            bar
        }
    };

    bar.set_message(message);

    bar
}

/// Progress should be hidden for either of verbose mode (because there will be a flurry of log
/// messages and the progress bar rendering will be all messed up), or quiet mode (because
/// progress bars are not quiet).
fn hide_progress(globals: &super::Globals) -> bool {
    globals.verbose || globals.quiet
}
