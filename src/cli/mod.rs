pub mod commands;

use clap::AppSettings;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
pub enum Command {
    Contribute(commands::contribute::ContributeOptions),
}

#[derive(StructOpt, Debug)]
#[structopt(
    name = "phase2-contributor",
    about = "Contributes randomness to per-circuit phase 2 ceremonies",
    setting(AppSettings::ColoredHelp),
    setting(AppSettings::DisableHelpSubcommand),
    setting(AppSettings::DisableVersion),
    setting(AppSettings::SubcommandRequiredElseHelp)
)]
pub struct Options {
    #[structopt(subcommand)]
    pub subcommand: Command,
}
