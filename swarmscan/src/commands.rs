use crate::CLAP_STYLING;
use clap::{arg, command};
use url::Url;

pub(crate) fn command_argument_builder() -> clap::Command {
    clap::Command::new("swarmscan")
        .version(env!("CARGO_PKG_VERSION"))
        .bin_name("swarmscan")
        .styles(CLAP_STYLING)
        .arg(arg!(-q --"quiet" "Suppress banner and non-essential output").required(false))
        .subcommand_required(false)
        .subcommand(
            command!("scan")
                .about(
                    "Crawl and audit a host or collection of hosts, optionally splitting the \
                workload across local slave instances.",
                )
                .arg(
                    arg!(-u --"url" <URL>)
                        .required(false)
                        .help("The URL to scan")
                        .value_parser(clap::value_parser!(Url))
                        .conflicts_with("hosts-file"),
                )
                .arg(
                    arg!(-H --"hosts-file" <PATH>)
                        .required(false)
                        .help("Path to a newline-delimited file of URLs to scan")
                        .value_parser(clap::value_parser!(std::path::PathBuf))
                        .conflicts_with("url"),
                )
                .arg(
                    arg!(-c --"config" <PATH>)
                        .required(false)
                        .help("JSON scan configuration; flags override its values")
                        .value_parser(clap::value_parser!(std::path::PathBuf)),
                )
                .arg(
                    arg!(-l --"page-limit" <PAGES>)
                        .required(false)
                        .help("Stop after this many pages were audited")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(-d --"max-depth" <DEPTH>)
                        .required(false)
                        .help("Maximum link depth from the seed URLs")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(-s --"snapshot" <PATH>)
                        .required(false)
                        .help("Where Ctrl-C suspends the scan to (default: ./swarmscan-snapshot.json)")
                        .value_parser(clap::value_parser!(std::path::PathBuf)),
                )
                .arg(
                    arg!(--"slaves" <COUNT>)
                        .required(false)
                        .help("Number of local slave instances sharing the workload")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(--"follow")
                        .required(false)
                        .help("Follow links off the target domain (default: stay on the seed's domain)")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(
                    arg!(-o --"output" <PATH>)
                        .required(false)
                        .help("Save issues and statistics as JSON (default: display to screen only)")
                        .value_parser(clap::value_parser!(std::path::PathBuf)),
                ),
        )
        .subcommand(
            command!("restore")
                .about("Resume a scan previously suspended with Ctrl-C")
                .arg(
                    arg!(<SNAPSHOT>)
                        .required(true)
                        .help("Snapshot file written when the scan was suspended")
                        .value_parser(clap::value_parser!(std::path::PathBuf)),
                )
                .arg(
                    arg!(-o --"output" <PATH>)
                        .required(false)
                        .help("Save issues and statistics as JSON (default: display to screen only)")
                        .value_parser(clap::value_parser!(std::path::PathBuf)),
                ),
        )
}
