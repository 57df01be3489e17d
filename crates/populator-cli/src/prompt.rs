//! Interactive recovery prompt for rejected uploads.

use anyhow::Result;
use populator_upload::{RecoveryChoice, RecoveryDecider, Rejection, UploadUnit};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

const PROMPT: &str = "retry, skip or abort? [r/s/a] ";

/// Asks the operator what to do about each rejection.
///
/// Ctrl-C or end-of-input at the prompt counts as abort.
pub struct ConsoleDecider {
    editor: DefaultEditor,
}

impl ConsoleDecider {
    pub fn new() -> Result<Self> {
        let editor = DefaultEditor::new()?;
        Ok(Self { editor })
    }
}

impl RecoveryDecider for ConsoleDecider {
    fn decide(&mut self, unit: &UploadUnit, rejection: &Rejection) -> RecoveryChoice {
        eprintln!("upload of {} failed: {rejection}", unit.describe());
        loop {
            match self.editor.readline(PROMPT) {
                Ok(line) => match parse_choice(&line) {
                    Some(choice) => return choice,
                    None => eprintln!("unrecognized answer: {}", line.trim()),
                },
                Err(ReadlineError::Interrupted | ReadlineError::Eof) => {
                    return RecoveryChoice::Abort;
                }
                Err(e) => {
                    tracing::error!("prompt failed, aborting: {e}");
                    return RecoveryChoice::Abort;
                }
            }
        }
    }
}

fn parse_choice(line: &str) -> Option<RecoveryChoice> {
    match line.trim().to_ascii_lowercase().as_str() {
        "r" | "retry" => Some(RecoveryChoice::Retry),
        "s" | "skip" => Some(RecoveryChoice::Skip),
        "a" | "abort" => Some(RecoveryChoice::Abort),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_choice() {
        assert_eq!(parse_choice("r"), Some(RecoveryChoice::Retry));
        assert_eq!(parse_choice("  Skip "), Some(RecoveryChoice::Skip));
        assert_eq!(parse_choice("ABORT"), Some(RecoveryChoice::Abort));
        assert_eq!(parse_choice("yes"), None);
        assert_eq!(parse_choice(""), None);
    }
}
