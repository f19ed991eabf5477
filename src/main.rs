use std::process::ExitCode;

fn main() -> ExitCode {
    rustfuse::cli::run()
}
