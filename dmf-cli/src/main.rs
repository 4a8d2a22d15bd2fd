use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use dmf_audit::{tail, verify_log};
use dmf_core::demo::demo_warehouse;
use dmf_core::{sql_api_warehouse, ActionReport, ConsoleView, DmfConsole};
use dmf_settings::{init_tracing, ConsoleSettings};
use dmf_store::Warehouse;
use dmf_types::{ActionKind, ReconciledRow};

#[derive(Parser)]
#[command(name = "dmfctl", about = "Manage data metric functions from the DMF configuration table")]
struct Cli {
    /// YAML settings file; `DMF_*` environment variables override it.
    #[arg(long, env = "DMF_SETTINGS")]
    config: Option<PathBuf>,
    /// Use a seeded in-memory warehouse instead of the SQL API.
    #[arg(long)]
    demo: bool,
    /// Print JSON instead of tables.
    #[arg(long)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Every active config row and whether it is applied.
    Status,
    /// Attach configured DMFs that are not applied yet.
    Add(ActionArgs),
    /// Detach configured DMFs that are currently applied.
    Drop(ActionArgs),
    /// Execute configured DMFs to check they work.
    Validate(ActionArgs),
    Audit {
        #[command(subcommand)]
        action: AuditCommand,
    },
}

#[derive(Args)]
struct ActionArgs {
    /// 1-based row number from the listing; repeat to select several, in order.
    #[arg(long = "row", value_name = "N")]
    rows: Vec<usize>,
    /// One unfiltered procedure call covering every configured row.
    #[arg(long, conflicts_with = "rows")]
    all_rows: bool,
}

#[derive(Subcommand)]
enum AuditCommand {
    Tail {
        #[arg(long, default_value_t = 10)]
        lines: usize,
    },
    Verify,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = ConsoleSettings::load(cli.config.as_deref())?;
    init_tracing(&settings.log_level, std::io::stderr)?;
    tracing::debug!(?settings, "loaded settings");

    match cli.command {
        Command::Audit { action } => {
            let path = settings
                .audit_file
                .clone()
                .ok_or_else(|| anyhow::anyhow!("no audit_file configured (DMF_AUDIT_FILE)"))?;
            match action {
                AuditCommand::Tail { lines } => {
                    for record in tail(&path, lines)? {
                        println!("{}", serde_json::to_string(&record)?);
                    }
                }
                AuditCommand::Verify => {
                    let n = verify_log(&path)?;
                    println!("audit log ok ({n} records)");
                }
            }
            Ok(())
        }
        Command::Status => {
            let console = build_console(&settings, cli.demo).await?;
            let view = console.view().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else if !report_empty(&view) {
                print_rows(&view.rows().iter().collect::<Vec<_>>(), true);
                print_ambiguity(&view);
            }
            Ok(())
        }
        Command::Add(args) => run(&settings, cli.demo, cli.json, ActionKind::Add, args).await,
        Command::Drop(args) => run(&settings, cli.demo, cli.json, ActionKind::Drop, args).await,
        Command::Validate(args) => run(&settings, cli.demo, cli.json, ActionKind::Validate, args).await,
    }
}

async fn build_console(settings: &ConsoleSettings, demo: bool) -> anyhow::Result<DmfConsole> {
    let warehouse: Arc<dyn Warehouse> = if demo {
        demo_warehouse(&settings.config_table).await
    } else {
        sql_api_warehouse(settings)?
    };
    Ok(DmfConsole::new(warehouse, settings)?)
}

async fn run(
    settings: &ConsoleSettings,
    demo: bool,
    json: bool,
    action: ActionKind,
    args: ActionArgs,
) -> anyhow::Result<()> {
    let console = build_console(settings, demo).await?;

    if args.all_rows {
        let report = console.run_unfiltered(action).await;
        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            match &report.outcome {
                Ok(value) => println!("{action} (all rows): {}", value.as_deref().unwrap_or("(no result)")),
                Err(e) => println!("{action} (all rows): FAILED: {}", e.message),
            }
        }
        return report
            .outcome
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!(e));
    }

    let view = console.view().await?;
    if report_empty(&view) {
        return Ok(());
    }

    if args.rows.is_empty() {
        let queue = view.queue(action);
        if queue.is_empty() {
            println!("{}", nothing_to_do(action));
        } else {
            println!("{} row(s) available for {action}; select with --row N", queue.len());
            print_rows(&queue, action == ActionKind::Validate);
        }
        return Ok(());
    }

    let indices = args
        .rows
        .iter()
        .map(|&n| {
            n.checked_sub(1)
                .ok_or_else(|| anyhow::anyhow!("row numbers start at 1"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let selection = view.select_indices(action, &indices)?;
    let report = console.run_action(action, &selection).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if report.failed() > 0 {
        anyhow::bail!("{} of {} DMF action(s) failed", report.failed(), report.results.len());
    }
    Ok(())
}

fn report_empty(view: &ConsoleView) -> bool {
    if view.is_empty() {
        println!("No active DMF configurations found in {}", view.config_table);
    }
    view.is_empty()
}

fn nothing_to_do(action: ActionKind) -> &'static str {
    match action {
        ActionKind::Add => "All configured DMFs have already been applied!",
        ActionKind::Drop => "No DMFs are currently applied to drop.",
        ActionKind::Validate => "No DMFs configured to validate.",
    }
}

fn print_rows(rows: &[&ReconciledRow], with_applied: bool) {
    println!(
        "{:>4}  {:<40} {:<36} {:<24} {:<20}{}",
        "#",
        "TABLE",
        "DMF",
        "COLUMNS",
        "SCHEDULE",
        if with_applied { " APPLIED" } else { "" }
    );
    for (i, row) in rows.iter().enumerate() {
        let e = &row.entry;
        let applied = if !with_applied {
            ""
        } else if row.is_applied {
            " yes"
        } else {
            " no"
        };
        println!(
            "{:>4}  {:<40} {:<36} {:<24} {:<20}{}",
            i + 1,
            e.full_table_id(),
            e.dmf_name,
            e.column_names,
            e.schedule,
            applied
        );
    }
}

fn print_ambiguity(view: &ConsoleView) {
    for (key, rows) in &view.ambiguous_keys {
        println!("warning: {rows} config rows share {key}; they always show the same status");
    }
}

fn print_report(report: &ActionReport) {
    for result in &report.results {
        let e = &result.entry;
        println!(
            "{} {} {} [{}]: {}",
            result.action,
            e.full_table_id(),
            e.dmf_name,
            e.column_names,
            result.summary()
        );
    }
    println!(
        "{} succeeded, {} failed",
        report.succeeded(),
        report.failed()
    );
    match (&report.view, &report.reload_error) {
        (Some(view), _) => println!(
            "now: {} pending, {} applied",
            view.queue(ActionKind::Add).len(),
            view.queue(ActionKind::Drop).len()
        ),
        (None, Some(err)) => println!("reload failed: {err}"),
        (None, None) => {}
    }
}
