use gsp_core::logging;

mod cli;

use crate::cli::Cli;

#[tokio::main]
async fn main() {
    if logging::init_logging().is_err() {
        logging::init_logging_stderr();
    }

    match Cli::run_from_args().await {
        Ok(()) => {}
        Err(err) => {
            if err.downcast_ref::<gsp_core::config::ConfigError>().is_some() {
                eprintln!("gsp: {err:#}");
                std::process::exit(2);
            }
            eprintln!("gsp error: {err:#}");
            std::process::exit(1);
        }
    }
}
