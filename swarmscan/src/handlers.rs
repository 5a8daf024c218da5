use clap::ArgMatches;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use swarmscan_core::distributed::{Handler, LocalConnector};
use swarmscan_core::{
    Checker, Fetcher, HttpFetcher, Instance, Issue, PassiveChecker, ScanOptions, Severity,
    Snapshot, Statistics, Status,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

const DEFAULT_SNAPSHOT: &str = "swarmscan-snapshot.json";

// Helper functions for scan handler

/// Load URLs from either a file or a single URL argument
pub fn load_urls_from_source(
    url: Option<&Url>,
    hosts_file: Option<&PathBuf>,
) -> Result<Vec<String>, String> {
    if let Some(hosts_file_path) = hosts_file {
        load_urls_from_file(hosts_file_path)
    } else if let Some(url) = url {
        Ok(vec![url.as_str().to_string()])
    } else {
        Err("Either --url or --hosts-file must be provided".to_string())
    }
}

/// Load and parse URLs from a file
pub fn load_urls_from_file(path: &PathBuf) -> Result<Vec<String>, String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read hosts file {}: {}", path.display(), e))?;

    let urls: Vec<String> = content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('#'))
        .filter_map(|line| parse_url_line(line.trim()))
        .collect();

    if urls.is_empty() {
        return Err(format!("No valid URLs found in {}", path.display()));
    }

    Ok(urls)
}

/// Parse a single line as a URL, trying to add http:// if needed
pub fn parse_url_line(line: &str) -> Option<String> {
    // Try to parse as-is
    if Url::parse(line).is_ok() {
        return Some(line.to_string());
    }

    // Try adding http://
    let with_scheme = format!("http://{}", line);
    if Url::parse(&with_scheme).is_ok() {
        return Some(with_scheme);
    }

    eprintln!("⚠️  Skipping invalid URL '{}'", line);
    None
}

pub fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}

/// Everything `scan` takes from the command line.
#[derive(Debug, Clone, Default)]
pub struct ScanArgs {
    pub urls: Vec<String>,
    pub config: Option<PathBuf>,
    pub page_limit: Option<usize>,
    pub max_depth: Option<usize>,
    pub snapshot: Option<PathBuf>,
    pub slaves: Option<usize>,
    pub follow: bool,
}

impl ScanArgs {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self, String> {
        let urls = load_urls_from_source(
            matches.get_one::<Url>("url"),
            matches.get_one::<PathBuf>("hosts-file"),
        )?;

        Ok(Self {
            urls,
            config: matches.get_one::<PathBuf>("config").cloned(),
            page_limit: matches.get_one::<usize>("page-limit").copied(),
            max_depth: matches.get_one::<usize>("max-depth").copied(),
            snapshot: matches.get_one::<PathBuf>("snapshot").cloned(),
            slaves: matches.get_one::<usize>("slaves").copied(),
            follow: matches.get_flag("follow"),
        })
    }
}

/// Merge the config file (if any) with the command line. Flags win.
///
/// Unless `follow` is set or the config names a domain, a single seed pins
/// the scan to its host.
pub fn build_options(args: &ScanArgs) -> Result<ScanOptions, String> {
    let mut options = match &args.config {
        Some(path) => {
            let path = expand_path(path);
            ScanOptions::load(&path)
                .map_err(|e| format!("Failed to load config {}: {}", path.display(), e))?
        }
        None => ScanOptions::default(),
    };

    options.seeds = args.urls.clone();
    if let Some(limit) = args.page_limit {
        options.scope.page_limit = Some(limit);
    }
    if let Some(depth) = args.max_depth {
        options.scope.max_depth = Some(depth);
    }
    if let Some(slaves) = args.slaves {
        options.distribution.spawns = slaves;
    }

    options.snapshot_path = match (&args.snapshot, &options.snapshot_path) {
        (Some(path), _) => Some(expand_path(path)),
        (None, Some(path)) => Some(expand_path(path)),
        (None, None) => Some(PathBuf::from(DEFAULT_SNAPSHOT)),
    };

    if !args.follow
        && options.scope.domain.is_none()
        && let [seed] = args.urls.as_slice()
        && let Some(host) = Url::parse(seed).ok().and_then(|u| u.host_str().map(String::from))
    {
        options.scope.domain = Some(host);
    }

    options.validate().map_err(|e| e.to_string())?;
    Ok(options)
}

pub fn print_banner() {
    println!(
        "{}",
        r#"
   ____ _    _____ __________ ___  ______________ _  __
  / __/| |/|/ / _ | / _ \/  |/  / / __/ ___/ _ | / |/ /
 _\ \  |__,__/ __ |/ , _/ /|_/ / _\ \/ /__/ __ |/    /
/___/  \_/\_/_/ |_/_/|_/_/  /_/ /___/\___/_/ |_/_/|_/
"#
        .bright_cyan()
        .bold()
    );
}

/// Log to stderr; `RUST_LOG` overrides the default level.
pub fn init_tracing(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_divider() {
    println!("{}", "═".repeat(60).bright_blue().bold());
}

fn severity_label(severity: Severity) -> String {
    let label = format!("{:<8}", severity.as_str().to_uppercase());
    match severity {
        Severity::Critical => label.red().bold().to_string(),
        Severity::High => label.red().to_string(),
        Severity::Medium => label.yellow().to_string(),
        Severity::Low => label.blue().to_string(),
        Severity::Info => label.white().to_string(),
    }
}

/// Console summary of a finished scan: outcome, statistics, then issues by
/// severity.
pub fn render_summary(status: Status, stats: &Statistics, issues: &[Issue]) -> String {
    let mut report = String::new();

    let outcome = match status {
        Status::Done => "SCAN COMPLETE".green().bold(),
        Status::Suspended => "SCAN SUSPENDED".yellow().bold(),
        _ => "SCAN ABORTED".red().bold(),
    };
    report.push_str(&format!("  {}\n\n", outcome));

    report.push_str("📊 Summary:\n");
    report.push_str(&format!("  Pages audited: {}\n", stats.pages_audited));
    report.push_str(&format!("  Elements audited: {}\n", stats.elements_audited));
    report.push_str(&format!("  URLs seen: {}\n", stats.urls_seen));
    report.push_str(&format!("  Fetch failures: {}\n", stats.fetch_failures));
    report.push_str(&format!("  Check errors: {}\n", stats.check_errors));
    report.push_str(&format!(
        "  Runtime: {:.1}s ({:.2} pages/s)\n",
        stats.runtime_secs, stats.pages_per_second
    ));
    report.push_str(&format!("  Issues: {}\n", issues.len()));

    if issues.is_empty() {
        return report;
    }

    let mut sorted: Vec<&Issue> = issues.iter().collect();
    sorted.sort_by(|a, b| a.severity.cmp(&b.severity).then_with(|| a.url.cmp(&b.url)));

    report.push_str("\n🔎 Issues:\n");
    for issue in sorted {
        report.push_str(&format!(
            "  {} {} {}\n",
            severity_label(issue.severity),
            issue.title.bright_white(),
            issue.url.dimmed()
        ));
    }
    report
}

fn write_report(path: &Path, stats: &Statistics, issues: &[Issue]) -> Result<(), String> {
    let report = serde_json::json!({
        "statistics": stats,
        "issues": issues,
    });
    let json = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
    fs::write(path, json).map_err(|e| format!("Failed to write {}: {}", path.display(), e))
}

fn progress_spinner(quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

async fn register(connector: &LocalConnector, instance: &Arc<Instance>) {
    let handler: Arc<dyn Handler> = instance.clone();
    connector.register(&instance.info().url, &handler).await;
}

/// Build the master and enslave `count` in-process slaves sharing its
/// fetcher and checker.
async fn assemble(
    options: ScanOptions,
    fetcher: Arc<dyn Fetcher>,
    checker: Arc<dyn Checker>,
) -> Result<(Arc<Instance>, Vec<Arc<Instance>>), String> {
    let count = options.distribution.spawns;
    let master = Instance::new(options, fetcher.clone(), checker.clone()).map_err(|e| e.to_string())?;
    if count == 0 {
        return Ok((Arc::new(master), Vec::new()));
    }

    let connector = LocalConnector::new();
    let master = Arc::new(master.with_connector(Arc::new(connector.clone())));
    register(&connector, &master).await;

    let mut slaves = Vec::with_capacity(count);
    for _ in 0..count {
        let slave = Instance::new(ScanOptions::default(), fetcher.clone(), checker.clone())
            .map_err(|e| e.to_string())?
            .with_connector(Arc::new(connector.clone()));
        let slave = Arc::new(slave);
        register(&connector, &slave).await;
        master
            .enslave(slave.info().clone())
            .await
            .map_err(|e| format!("Failed to enslave {}: {}", slave.info().url, e))?;
        slaves.push(slave);
    }
    info!("Enslaved {} local instances", slaves.len());
    Ok((master, slaves))
}

/// Run the master to completion while slaves serve. The first Ctrl-C
/// suspends (or aborts a distributed scan), the second aborts.
async fn drive(master: Arc<Instance>, slaves: Vec<Arc<Instance>>, quiet: bool) -> Result<Status, String> {
    let serving: Vec<JoinHandle<_>> = slaves
        .iter()
        .map(|slave| {
            let slave = slave.clone();
            tokio::spawn(async move { slave.serve().await })
        })
        .collect();

    let runner = master.clone();
    let mut run = tokio::spawn(async move { runner.run().await });
    let spinner = progress_spinner(quiet);
    let mut interrupts = 0;

    let outcome = loop {
        tokio::select! {
            joined = &mut run => {
                break joined
                    .map_err(|e| e.to_string())
                    .and_then(|result| result.map_err(|e| e.to_string()));
            }
            _ = tokio::signal::ctrl_c() => {
                interrupts += 1;
                if interrupts > 1 {
                    spinner.println(format!("{} Aborting scan", "✗".red().bold()));
                    master.abort(false).await;
                } else if master.suspend(false).await.is_ok() {
                    spinner.println(format!(
                        "{} Suspending scan, press Ctrl-C again to abort",
                        "→".yellow().bold()
                    ));
                } else {
                    spinner.println(format!(
                        "{} Distributed scans cannot be suspended, aborting",
                        "→".yellow().bold()
                    ));
                    master.abort(false).await;
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(250)) => {
                let report = master.status_report().await;
                spinner.set_message(format!(
                    "{} | {} pages audited | {} URLs queued | {} pages queued | {} issues",
                    report.status,
                    report.statistics.pages_audited,
                    report.url_queue,
                    report.page_queue,
                    report.statistics.issues
                ));
            }
        }
    };
    spinner.finish_and_clear();

    // A master that failed never released its slaves.
    for (slave, handle) in slaves.iter().zip(serving) {
        if !slave.status().is_finished() {
            slave.abort(false).await;
        }
        match handle.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Slave {} failed: {}", slave.info().url, e),
            Err(e) => warn!("Slave {} panicked: {}", slave.info().url, e),
        }
    }
    outcome
}

async fn finish(master: Arc<Instance>, slaves: Vec<Arc<Instance>>, output: Option<&PathBuf>, quiet: bool) {
    let status = match drive(master.clone(), slaves, quiet).await {
        Ok(status) => status,
        Err(e) => {
            eprintln!("{} Scan failed: {}", "✗".red().bold(), e);
            std::process::exit(1);
        }
    };

    let stats = master.statistics().await;
    let issues = master.issues().await;

    println!();
    print_divider();
    print!("{}", render_summary(status, &stats, &issues));
    print_divider();

    if status == Status::Suspended
        && let Some(path) = master.context().with(|s| s.options().snapshot_path.clone()).await
    {
        println!(
            "{} Resume with: swarmscan restore {}",
            "ℹ".blue(),
            path.display().to_string().bright_white()
        );
    }

    if let Some(path) = output {
        let path = expand_path(path);
        match write_report(&path, &stats, &issues) {
            Ok(()) => println!(
                "{} Report saved to {}",
                "✓".green().bold(),
                path.display().to_string().bright_white()
            ),
            Err(e) => {
                eprintln!("{} {}", "✗".red().bold(), e);
                std::process::exit(1);
            }
        }
    }

    if status == Status::Aborted {
        std::process::exit(1);
    }
}

fn collaborators(options: &ScanOptions) -> Result<(Arc<dyn Fetcher>, Arc<dyn Checker>), String> {
    let fetcher = HttpFetcher::new(&options.http).map_err(|e| e.to_string())?;
    Ok((Arc::new(fetcher), Arc::new(PassiveChecker)))
}

pub async fn handle_scan(sub_matches: &ArgMatches, quiet: bool) {
    let options = match ScanArgs::from_matches(sub_matches).and_then(|args| build_options(&args)) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("✗ {}", e);
            std::process::exit(1);
        }
    };

    // Print scan configuration
    println!("\n🕷️  Scanning {} host(s)", options.seeds.len());
    println!(
        "Max depth: {}",
        options
            .scope
            .max_depth
            .map_or("unlimited".to_string(), |d| d.to_string())
    );
    println!(
        "Page limit: {}",
        options
            .scope
            .page_limit
            .map_or("none".to_string(), |l| l.to_string())
    );
    println!(
        "Scope: {}",
        options.scope.domain.as_deref().unwrap_or("any domain")
    );
    println!("Slaves: {}\n", options.distribution.spawns);

    let assembled = match collaborators(&options) {
        Ok((fetcher, checker)) => assemble(options, fetcher, checker).await,
        Err(e) => Err(e),
    };
    let (master, slaves) = match assembled {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("✗ {}", e);
            std::process::exit(1);
        }
    };

    finish(master, slaves, sub_matches.get_one::<PathBuf>("output"), quiet).await;
}

pub async fn handle_restore(sub_matches: &ArgMatches, quiet: bool) {
    let Some(path) = sub_matches.get_one::<PathBuf>("SNAPSHOT") else {
        eprintln!("✗ A snapshot path is required");
        std::process::exit(1);
    };
    let path = expand_path(path);

    let snapshot = match Snapshot::load(&path).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            eprintln!("✗ Failed to load snapshot {}: {}", path.display(), e);
            std::process::exit(1);
        }
    };
    println!(
        "\n🕷️  Resuming scan {} ({} URLs and {} pages queued, {} pages audited)\n",
        snapshot.scan_id,
        snapshot.url_queue.len(),
        snapshot.page_queue.len(),
        snapshot.counters.pages_audited
    );

    let restored = collaborators(&snapshot.options).and_then(|(fetcher, checker)| {
        Instance::restore(snapshot, fetcher, checker).map_err(|e| e.to_string())
    });
    let instance = match restored {
        Ok(instance) => Arc::new(instance),
        Err(e) => {
            eprintln!("✗ {}", e);
            std::process::exit(1);
        }
    };

    finish(instance, Vec::new(), sub_matches.get_one::<PathBuf>("output"), quiet).await;
}
