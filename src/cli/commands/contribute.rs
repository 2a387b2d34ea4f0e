use clap::AppSettings;
use std::path::PathBuf;
use structopt::StructOpt;
use url::Url;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "Contribute",
    about = "Contribute to one circuit of a phase 2 ceremony",
    setting(AppSettings::ColoredHelp),
    setting(AppSettings::DisableHelpSubcommand),
    setting(AppSettings::DisableVersion)
)]
pub struct ContributeOptions {
    /// Specify the ceremony to contribute to.
    #[structopt(long)]
    pub ceremony_id: String,

    /// Specify the circuit to contribute to.
    #[structopt(long)]
    pub circuit_id: String,

    /// Specify the participant id assigned by the coordinator.
    #[structopt(long)]
    pub participant_id: String,

    /// Specify the name recorded in the contribution.
    #[structopt(long)]
    pub contributor_name: String,

    /// Specify the program computing the contribution.
    #[structopt(long, parse(from_os_str))]
    pub computer: PathBuf,

    /// Specify the URL of the ceremony coordinator, overriding COORDINATOR_API_URL.
    #[structopt(long)]
    pub coordinator_api_url: Option<Url>,

    /// Use this text as entropy instead of prompting for it.
    #[structopt(long)]
    pub entropy: Option<String>,

    /// Finalize the circuit with this hex-encoded beacon value.
    #[structopt(long, conflicts_with = "entropy")]
    pub beacon: Option<String>,

    /// Write artifacts and transcripts to this directory, overriding CONTRIBUTOR_OUTPUT_DIR.
    #[structopt(long, parse(from_os_str))]
    pub output_directory: Option<PathBuf>,

    /// Transmit up to this many parts at once, overriding UPLOAD_CONCURRENCY.
    #[structopt(long)]
    pub upload_concurrency: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: [&str; 9] = [
        "contribute",
        "--ceremony-id",
        "ceremony",
        "--circuit-id",
        "circuit",
        "--participant-id",
        "participant",
        "--contributor-name",
        "alice",
    ];

    fn parse(extra: &[&str]) -> Result<ContributeOptions, clap::Error> {
        let args = REQUIRED.iter().chain(["--computer", "/usr/bin/contribute"].iter()).chain(extra.iter());
        ContributeOptions::from_iter_safe(args)
    }

    #[test]
    fn test_parse_contribute_options() {
        let options = parse(&["--upload-concurrency", "4"]).unwrap();
        assert_eq!("ceremony", options.ceremony_id);
        assert_eq!("alice", options.contributor_name);
        assert_eq!(PathBuf::from("/usr/bin/contribute"), options.computer);
        assert_eq!(Some(4), options.upload_concurrency);
        assert_eq!(None, options.beacon);
    }

    #[test]
    fn test_beacon_conflicts_with_entropy() {
        assert!(parse(&["--beacon", "00ff"]).is_ok());
        assert!(parse(&["--beacon", "00ff", "--entropy", "text"]).is_err());
    }
}
