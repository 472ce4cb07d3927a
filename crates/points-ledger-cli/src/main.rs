use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    points_ledger_cli::init_tracing();
    let cli = points_ledger_cli::Cli::parse();

    match points_ledger_cli::run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", points_ledger_cli::render_error(&err));
            ExitCode::FAILURE
        }
    }
}
