use log::error;
use reconstructor::cli::ActionRunner;
use std::process::ExitCode;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Setup logger
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    match ActionRunner::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
