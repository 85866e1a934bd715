//! The `Reporter` collaborator spec §1 calls out as external to the core:
//! `progress(n,total)`, `log(fmt,...)`, `ask(prompt)->bool`. Kept as a
//! trait so the core never assumes a terminal is attached — mirrors the
//! teacher's split between `src/util.rs`'s TUI helpers and the commands
//! that drive them.

use std::io::Write;

use owo_colors::OwoColorize;

pub trait Reporter {
    fn progress(&mut self, n: u64, total: u64);
    fn log(&mut self, message: &str);
    fn ask(&mut self, prompt: &str) -> bool;
}

/// Human-facing reporter: colored log lines, a redrawn progress line.
pub struct TermReporter {
    assume_yes: bool,
    quiet: bool,
}

impl TermReporter {
    pub fn new(assume_yes: bool, quiet: bool) -> Self {
        TermReporter { assume_yes, quiet }
    }
}

impl Reporter for TermReporter {
    fn progress(&mut self, n: u64, total: u64) {
        if self.quiet || total == 0 {
            return;
        }
        let pct = (n * 100) / total;
        eprint!("\r{} {pct:>3}% ({n}/{total})", "progress:".dimmed());
        let _ = std::io::stderr().flush();
        if n == total {
            eprintln!();
        }
    }

    fn log(&mut self, message: &str) {
        if !self.quiet {
            println!("{message}");
        }
    }

    fn ask(&mut self, prompt: &str) -> bool {
        if self.assume_yes {
            println!("{prompt} (y)");
            return true;
        }
        print!("{prompt} (y/n)? ");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return false;
        }
        matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

/// Discards everything; `ask` always answers as configured at construction.
pub struct NullReporter {
    pub answer: bool,
}

impl Default for NullReporter {
    fn default() -> Self {
        NullReporter { answer: true }
    }
}

impl Reporter for NullReporter {
    fn progress(&mut self, _n: u64, _total: u64) {}
    fn log(&mut self, _message: &str) {}
    fn ask(&mut self, _prompt: &str) -> bool {
        self.answer
    }
}

/// Records every call for tests to assert against.
#[derive(Default)]
pub struct RecordingReporter {
    pub progress_calls: Vec<(u64, u64)>,
    pub logs: Vec<String>,
    pub asks: Vec<String>,
    pub answer: bool,
}

impl Reporter for RecordingReporter {
    fn progress(&mut self, n: u64, total: u64) {
        self.progress_calls.push((n, total));
    }

    fn log(&mut self, message: &str) {
        self.logs.push(message.to_string());
    }

    fn ask(&mut self, prompt: &str) -> bool {
        self.asks.push(prompt.to_string());
        self.answer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_reporter_tracks_calls() {
        let mut r = RecordingReporter { answer: true, ..Default::default() };
        r.progress(1, 10);
        r.log("hello");
        assert!(r.ask("relocate?"));
        assert_eq!(r.progress_calls, vec![(1, 10)]);
        assert_eq!(r.logs, vec!["hello".to_string()]);
        assert_eq!(r.asks, vec!["relocate?".to_string()]);
    }
}
