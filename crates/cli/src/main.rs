//! HelioDB administration CLI.
//!
//! Three modes:
//! - **Shell mode**: `helio [--server HOST:PORT] COMMAND`: one command,
//!   then exit (0 on success, 1 on error)
//! - **REPL mode**: `helio` with a TTY: interactive prompt
//! - **Pipe mode**: `echo "status" | helio --server n1:7568`

mod actions;
mod commands;
mod repl;
mod state;

use actions::execute;
use commands::build_cli;
use state::SessionState;
use std::io::IsTerminal;
use std::process;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let matches = build_cli().get_matches();
    let server = matches.get_one::<String>("server").cloned();
    let mut state = match SessionState::new(server) {
        Ok(state) => state,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    };

    if matches.subcommand().is_some() {
        // Shell mode: one command.
        match execute(&mut state, &matches) {
            Ok(_) => process::exit(0),
            Err(e) => {
                eprintln!("error: {e}");
                process::exit(1);
            }
        }
    }

    if std::io::stdin().is_terminal() {
        repl::run_repl(&mut state);
        process::exit(0);
    }

    let failures = repl::run_pipe(&mut state);
    process::exit(if failures == 0 { 0 } else { 1 });
}
