// Purpose: Binary entry for the cmpile command line.
// Inputs/Outputs: Forwards process args to the CLI dispatcher and exits with its code.
// Invariants: All argument and diagnostic handling lives in cli::run_cli.

fn main() {
    let code = cmpile::cli::run_cli(std::env::args().skip(1));
    std::process::exit(code);
}
