use std::process::ExitCode;

fn main() -> ExitCode {
    match sensorcollect_lib::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            // Logging may not be up yet if settings failed to load.
            log::error!("{err:?}");
            eprintln!("sensorcollect: {err:#}");
            ExitCode::FAILURE
        }
    }
}
