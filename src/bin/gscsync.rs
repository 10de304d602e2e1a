use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use gscsync::{CampaignReport, Flow, FlowReport, GscSync, Month, SyncOptions};

#[derive(Parser)]
#[command(name = "gscsync", about = "Search Console performance warehouse CLI")]
struct Cli {
    /// Database path (default: ~/.gscsync/gscsync.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Progress reporter that writes to stderr.
struct StderrProgress;

impl gscsync::SyncProgress for StderrProgress {
    fn on_campaign_start(&self, campaign_id: &str, index: usize, total: usize) {
        eprintln!("[{}/{}] Syncing {}...", index + 1, total, campaign_id);
    }

    fn on_window(&self, campaign_id: &str, flow: Flow, window: &gscsync::sync::windows::DateWindow, skipped: bool) {
        if skipped {
            eprintln!("  {campaign_id} {flow} {window}: already complete");
        } else {
            eprintln!("  {campaign_id} {flow} {window}: fetched");
        }
    }

    fn on_campaign_complete(&self, report: &CampaignReport) {
        let status = if report.succeeded() { "ok" } else { "with errors" };
        eprintln!("  Done: {} ({status})", report.campaign_id);
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Sync Search Console data into the local warehouse
    Sync {
        #[command(subcommand)]
        target: SyncTarget,
    },
    /// Manage tracked campaigns
    Campaign {
        #[command(subcommand)]
        action: CampaignAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show stored metrics
    Metrics {
        #[command(subcommand)]
        target: MetricsTarget,
    },
    /// Aggregate an exported rows file offline
    Diagnose {
        /// JSON export of a searchAnalytics.query response
        #[arg(long)]
        rows: PathBuf,
        /// Newline-delimited keyword list
        #[arg(long)]
        keywords: PathBuf,
        /// Comma-separated months (e.g. 2025-01,2025-02)
        #[arg(long)]
        months: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show warehouse status and recent sync runs
    Status,
}

#[derive(Subcommand)]
enum SyncTarget {
    /// Sync one campaign
    Campaign {
        campaign_id: String,
        /// Only run these flows (daily, backfill, initial, traffic)
        #[arg(long = "flow")]
        flows: Vec<String>,
        /// Treat this date as today (YYYY-MM-DD)
        #[arg(long)]
        today: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Sync every enabled campaign
    All {
        #[arg(long = "flow")]
        flows: Vec<String>,
        #[arg(long)]
        today: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum CampaignAction {
    /// Add or update a campaign
    Add {
        campaign_id: String,
        /// Search Console property (e.g. sc-domain:example.com)
        #[arg(long)]
        site: String,
        /// Tracked keyword (repeatable)
        #[arg(long = "keyword")]
        keywords: Vec<String>,
        /// Read tracked keywords from a file, one per line
        #[arg(long)]
        keywords_file: Option<PathBuf>,
        /// Campaign start date (YYYY-MM-DD)
        #[arg(long)]
        start: Option<String>,
        /// Linked Search Console account
        #[arg(long)]
        account: Option<String>,
    },
    /// List campaigns
    List,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
}

#[derive(Subcommand)]
enum MetricsTarget {
    /// Per-keyword metrics for a month
    Keywords {
        campaign_id: String,
        /// Month (YYYY-MM, default: last month)
        #[arg(long)]
        month: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Site traffic by month plus the current month to date
    Traffic {
        campaign_id: String,
        #[arg(long)]
        json: bool,
    },
}

fn parse_date(s: Option<&str>) -> anyhow::Result<Option<chrono::NaiveDate>> {
    s.map(|s| {
        chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|e| anyhow::anyhow!("invalid date '{s}': {e}"))
    })
    .transpose()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let command = match cli.command {
        Commands::Diagnose {
            rows,
            keywords,
            months,
            json,
        } => return handle_diagnose(&rows, &keywords, &months, json),
        other => other,
    };

    let db = match &cli.db {
        Some(path) => gscsync::Database::open_at(path).await?,
        None => gscsync::Database::open().await?,
    };
    let app = GscSync::new(db);

    match command {
        Commands::Status => print_status(&app).await?,
        Commands::Config { action } => handle_config(&app, action).await?,
        Commands::Campaign { action } => handle_campaign(&app, action).await?,
        Commands::Metrics { target } => handle_metrics(&app, target).await?,
        Commands::Sync { target } => handle_sync(&app, target).await?,
        Commands::Diagnose { .. } => {}
    }

    Ok(())
}

async fn print_status(app: &GscSync) -> anyhow::Result<()> {
    let counts = app
        .db()
        .reader()
        .call(|conn| {
            let count = |sql: &str| conn.query_row(sql, [], |row| row.get::<_, i64>(0));
            Ok::<_, rusqlite::Error>((
                count("SELECT COUNT(*) FROM campaigns WHERE sync_enabled = 1")?,
                count("SELECT COUNT(*) FROM keyword_analytics")?,
                count("SELECT COUNT(*) FROM keyword_daily_stats")?,
                count("SELECT COUNT(*) FROM traffic_daily")?,
                count("SELECT COUNT(*) FROM sync_checkpoints")?,
            ))
        })
        .await?;

    let (campaigns, keywords, daily, traffic, checkpoints) = counts;
    println!("Warehouse Status");
    println!("  Campaigns:     {campaigns}");
    println!("  Keywords:      {keywords}");
    println!("  Keyword days:  {daily}");
    println!("  Traffic days:  {traffic}");
    println!("  Checkpoints:   {checkpoints}");

    let runs = app.recent_runs(10).await?;
    if runs.is_empty() {
        println!("  Last sync:     never");
    } else {
        println!("Recent runs");
        for run in runs {
            println!(
                "  {} {:<20} {:<16} {} fetched, {} skipped, {} failed{}",
                run.started_at,
                run.flow,
                run.status,
                run.windows_fetched,
                run.windows_skipped,
                run.windows_failed,
                run.error_message
                    .map(|e| format!(" ({e})"))
                    .unwrap_or_default()
            );
        }
    }
    Ok(())
}

async fn handle_config(app: &GscSync, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => match app.config_get(&key).await? {
            Some(v) => println!("{key} = {}", mask(&key, &v)),
            None => println!("{key} is not set"),
        },
        ConfigAction::Set { key, value } => {
            app.config_set(&key, &value).await?;
            println!("Config updated.");
        }
        ConfigAction::List => {
            let items = app.config_list().await?;
            if items.is_empty() {
                println!("No configuration set.");
            } else {
                for (k, v) in items {
                    println!("{k} = {}", mask(&k, &v));
                }
            }
        }
    }
    Ok(())
}

fn mask(key: &str, value: &str) -> String {
    if key == "access_token" {
        "********".to_string()
    } else {
        value.to_string()
    }
}

async fn handle_campaign(app: &GscSync, action: CampaignAction) -> anyhow::Result<()> {
    match action {
        CampaignAction::Add {
            campaign_id,
            site,
            mut keywords,
            keywords_file,
            start,
            account,
        } => {
            if let Some(path) = keywords_file {
                let raw = std::fs::read_to_string(&path)
                    .map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))?;
                keywords.extend(raw.lines().map(str::to_string));
            }
            let campaign = gscsync::Campaign {
                campaign_id: campaign_id.clone(),
                site_url: site,
                keywords_raw: keywords.join("\n"),
                start_date: parse_date(start.as_deref())?,
                linked_account: account,
            };
            let count = campaign.keywords().len();
            app.campaign_add(campaign).await?;
            println!("Added: {campaign_id} ({count} keywords)");
        }
        CampaignAction::List => {
            let campaigns = app.campaign_list().await?;
            if campaigns.is_empty() {
                println!("No campaigns.");
            }
            for c in campaigns {
                println!(
                    "{} {} start={} keywords={}",
                    c.campaign_id,
                    c.site_url,
                    c.start_date
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "unset".into()),
                    c.keywords().len()
                );
            }
        }
    }
    Ok(())
}

async fn handle_metrics(app: &GscSync, target: MetricsTarget) -> anyhow::Result<()> {
    let today = chrono::Local::now().date_naive();
    match target {
        MetricsTarget::Keywords {
            campaign_id,
            month,
            json,
        } => {
            let month = match month {
                Some(m) => Month::parse(&m)?,
                None => Month::of(today).pred(),
            };
            let report = app.keyword_report(&campaign_id, month).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }
            println!("Keywords: {} {} ({})", report.campaign_id, report.site_url, report.month);
            for k in &report.keywords {
                println!(
                    "  {:<32} rank {:>6} vol {:>7} clicks {:>6} ctr {:>5.1}% change {:>6}  {}",
                    k.keyword,
                    fmt_opt(k.avg_rank),
                    k.search_volume,
                    k.clicks,
                    k.ctr_pct,
                    fmt_opt(k.position_change),
                    k.top_page.as_deref().unwrap_or("")
                );
            }
            let t = &report.totals;
            println!(
                "  Total: {} impressions, {} clicks, {:.1}% ctr, avg position {:.1}",
                t.impressions, t.clicks, t.ctr_pct, t.avg_position
            );
        }
        MetricsTarget::Traffic { campaign_id, json } => {
            let report = app.traffic_report(&campaign_id, today).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }
            println!("Traffic: {}", report.site_url);
            for p in report.months.iter().chain(&report.current_month) {
                println!(
                    "  {:<10} clicks {:>7} impressions {:>9} ctr {:>5.1}% position {:>5.1}",
                    p.period_key, p.clicks, p.impressions, p.ctr_pct, p.position
                );
            }
            let t = &report.month_to_date;
            println!(
                "  Month to date: {} clicks, {} impressions, {:.1}% ctr, position {:.1}",
                t.clicks, t.impressions, t.ctr_pct, t.avg_position
            );
        }
    }
    Ok(())
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(|v| format!("{v:.1}")).unwrap_or_else(|| "-".into())
}

async fn handle_sync(app: &GscSync, target: SyncTarget) -> anyhow::Result<()> {
    let (flows, today, json) = match &target {
        SyncTarget::Campaign { flows, today, json, .. } | SyncTarget::All { flows, today, json } => {
            (flows, today, *json)
        }
    };
    let options = make_sync_options(flows, today.as_deref())?;

    let cancel = options.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling after the current month...");
            cancel.cancel();
        }
    });

    let reports = match &target {
        SyncTarget::Campaign { campaign_id, .. } => {
            vec![app.sync_campaign(campaign_id, &options, &StderrProgress).await]
        }
        SyncTarget::All { .. } => app.sync_all(&options, Arc::new(StderrProgress)).await?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else if reports.is_empty() {
        println!("No campaigns to sync. Use 'campaign add' first.");
    } else {
        for report in &reports {
            print_campaign_report(report);
            println!();
        }
    }

    let failed = reports.iter().filter(|r| !r.succeeded()).count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} campaigns did not sync cleanly", reports.len());
    }
    Ok(())
}

fn make_sync_options(flows: &[String], today: Option<&str>) -> anyhow::Result<SyncOptions> {
    let mut options = SyncOptions {
        today: parse_date(today)?,
        ..Default::default()
    };
    if !flows.is_empty() {
        options.flows = flows
            .iter()
            .map(|f| Flow::parse(f))
            .collect::<gscsync::Result<_>>()?;
    }
    Ok(options)
}

fn handle_diagnose(rows: &std::path::Path, keywords: &std::path::Path, months: &str, json: bool) -> anyhow::Result<()> {
    let out = gscsync::diagnose::diagnose_files(rows, keywords, months)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    for d in &out {
        println!(
            "{} {:<32} impressions {:>8} clicks {:>6} position {:>7.2} best page {}",
            d.month,
            d.query,
            d.impressions,
            d.clicks,
            d.position,
            d.best_page.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn print_campaign_report(report: &CampaignReport) {
    println!("Sync: {}", report.campaign_id);
    if let Some(ref err) = report.error {
        println!("  Error:   {err}");
    }
    for flow in &report.flows {
        print_flow_report(flow);
    }
}

fn print_flow_report(report: &FlowReport) {
    println!(
        "  {:<20} {:<16} {} fetched, {} skipped, {} failed, {} records",
        report.flow.as_str(),
        report.status.as_str(),
        report.windows_fetched,
        report.windows_skipped,
        report.windows_failed,
        report.records_written
    );
    if let Some(ref err) = report.error {
        println!("    Error: {err}");
    }
}
