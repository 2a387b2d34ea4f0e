use phase2_contributor::{
    cli::{Command, Options},
    commands::start_contribution,
    errors::ContributeError,
};

use structopt::StructOpt;
use tracing::error;

const UNEXPECTED_FAILURE: i32 = 1;

fn report(error: &anyhow::Error) -> i32 {
    error!("{:#}", error);
    eprintln!("Error: {:#}", error);

    match error.downcast_ref::<ContributeError>() {
        Some(contribute_error) => {
            if let ContributeError::TimeoutExpired { remaining, .. } = contribute_error {
                if !remaining.is_zero() {
                    eprintln!("You may try again in {}", remaining);
                }
            }
            if contribute_error.is_retryable() {
                eprintln!("Run the same command again to resume the contribution.");
            }
            contribute_error.category().exit_code()
        }
        None => UNEXPECTED_FAILURE,
    }
}

#[tokio::main]
async fn main() {
    let opts = Options::from_args();

    let result = match opts.subcommand {
        Command::Contribute(contribute_opts) => start_contribution(contribute_opts).await,
    };

    match result {
        Ok(outcome) if outcome.is_valid() => {
            println!(
                "Contribution {} to circuit {} was verified",
                outcome.artifact, outcome.circuit_id
            );
        }
        Ok(outcome) => match outcome.verification {
            Some(_) => {
                eprintln!(
                    "Contribution {} to circuit {} was rejected by the verifier",
                    outcome.artifact, outcome.circuit_id
                );
                std::process::exit(UNEXPECTED_FAILURE);
            }
            None => println!("Circuit {} has no remaining step", outcome.circuit_id),
        },
        Err(error) => std::process::exit(report(&error)),
    }
}
