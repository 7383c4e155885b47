use clap::Parser;
use ruuvitag_relay::app::{Options, RunError};
use ruuvitag_relay::config::Config;
use std::panic::{self, PanicHookInfo};

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

#[cfg(feature = "bluer")]
async fn run(options: Options) -> Result<(), RunError> {
    use ruuvitag_relay::tracker::TrackerOptions;
    use ruuvitag_relay::tracker::bluer::BluerTransport;
    use std::sync::Arc;

    let config = Config::load(options.config.as_deref())?;
    let (transport, events) = BluerTransport::connect(&config.adapter).await?;
    ruuvitag_relay::app::run(&config, Arc::new(transport), events, TrackerOptions::default()).await
}

#[cfg(not(feature = "bluer"))]
async fn run(options: Options) -> Result<(), RunError> {
    Config::load(options.config.as_deref())?;
    Err(RunError::BackendNotAvailable(
        "compiled without the `bluer` feature",
    ))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    ruuvitag_relay::logging::init(options.log_time, options.verbose);

    match run(options).await {
        Ok(()) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            eprintln!("error: {why}");
            std::process::exit(EXIT_ERROR);
        }
    }
}
