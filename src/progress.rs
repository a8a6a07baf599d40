//! Terminal progress for long statements, with log lines routed above the
//! spinners so they don't tear the display

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::{self, Write};
use std::sync::OnceLock;
use std::time::Duration;
use tracing_subscriber::fmt::MakeWriter;

static TERMINAL: OnceLock<MultiProgress> = OnceLock::new();

fn terminal() -> &'static MultiProgress {
    TERMINAL.get_or_init(|| {
        let multi = MultiProgress::new();
        multi.set_draw_target(ProgressDrawTarget::stderr_with_hz(10));
        multi
    })
}

/// Spinner shown while a statement runs; hidden when stderr is not a terminal
pub fn statement_spinner(message: &str) -> ProgressBar {
    let spinner = terminal().add(ProgressBar::new_spinner());
    if let Ok(style) = ProgressStyle::with_template("{spinner:.green} {msg} ({elapsed})") {
        spinner.set_style(style);
    }
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner
}

/// One tick per due job in a `jobs run` sweep
pub fn sweep_bar(jobs: u64) -> ProgressBar {
    let bar = terminal().add(ProgressBar::new(jobs));
    if let Ok(style) = ProgressStyle::with_template("{prefix} [{bar:25}] {pos}/{len} {msg}") {
        bar.set_style(style);
    }
    bar.set_prefix("jobs");
    bar
}

/// `tracing` writer that prints whole lines through the progress display
#[derive(Default, Clone)]
pub struct LogWriterFactory;

pub struct LogWriter {
    pending: String,
}

impl LogWriter {
    fn emit(line: &str) {
        let line = line.trim_end_matches('\r');
        let multi = terminal();
        // A hidden display swallows println
        if multi.is_hidden() {
            let _ = writeln!(io::stderr(), "{}", line);
        } else {
            let _ = multi.println(line);
        }
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.push_str(&String::from_utf8_lossy(buf));
        while let Some(end) = self.pending.find('\n') {
            Self::emit(&self.pending[..end]);
            self.pending.drain(..=end);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            Self::emit(self.pending.trim_end_matches('\n'));
            self.pending.clear();
        }
        Ok(())
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

impl<'a> MakeWriter<'a> for LogWriterFactory {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            pending: String::new(),
        }
    }
}
