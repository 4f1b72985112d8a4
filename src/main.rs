use anyhow::Result;
use ec_sensor::{cli, sensord};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse cli and handle clap errors
    let options = cli::parse_from_args();

    ec_sensor::init_logger(Some(options.log_level()));

    match sensord::sensor_daemon_run(&options).await {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            cli::report_error(&e);
            std::process::exit(1);
        }
    }
}
