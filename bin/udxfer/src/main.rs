#![deny(unsafe_code)]

use std::env;
use std::process::ExitCode;

fn main() -> ExitCode {
    let code = cli::run(env::args_os());
    ExitCode::from(code as u8)
}
