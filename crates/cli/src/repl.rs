//! Interactive shell and pipe mode.
//!
//! Interactive mode: rustyline prompt with history. Pipe mode: one
//! command per stdin line. Both parse lines through the same clap tree as
//! shell mode.

use crate::actions::{execute, Flow};
use crate::commands::build_cli;
use crate::state::SessionState;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::Editor;
use std::io::BufRead;

enum LineResult {
    Ok,
    Failed,
    Exit,
}

fn run_line(state: &mut SessionState, line: &str) -> LineResult {
    let words = match shell_words(line) {
        Ok(words) => words,
        Err(e) => {
            eprintln!("error: {e}");
            return LineResult::Failed;
        }
    };
    let argv = std::iter::once("helio".to_string()).chain(words);
    match build_cli().try_get_matches_from(argv) {
        Ok(matches) => match execute(state, &matches) {
            Ok(Flow::Continue) => LineResult::Ok,
            Ok(Flow::Exit) => LineResult::Exit,
            Err(e) => {
                eprintln!("error: {e}");
                LineResult::Failed
            }
        },
        Err(e) => {
            // Clap renders its own help/usage output.
            let _ = e.print();
            LineResult::Failed
        }
    }
}

/// Split a command line on whitespace, honoring double quotes.
fn shell_words(line: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in line.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if quoted {
        return Err("unterminated quote".to_string());
    }
    if !current.is_empty() {
        words.push(current);
    }
    Ok(words)
}

/// Run the interactive shell.
pub fn run_repl(state: &mut SessionState) {
    let mut rl: Editor<(), DefaultHistory> = match Editor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("error: cannot start shell: {e}");
            return;
        }
    };
    loop {
        match rl.readline(&state.prompt()) {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(trimmed);
                if matches!(run_line(state, trimmed), LineResult::Exit) {
                    break;
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("error: {e}");
                break;
            }
        }
    }
}

/// Run commands piped line by line from stdin. Returns the number of
/// failed lines.
pub fn run_pipe(state: &mut SessionState) -> usize {
    let stdin = std::io::stdin();
    let mut failures = 0;
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match run_line(state, trimmed) {
            LineResult::Exit => break,
            LineResult::Ok => {}
            LineResult::Failed => failures += 1,
        }
    }
    failures
}
