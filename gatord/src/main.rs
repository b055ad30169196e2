use gatord::daemon::{DaemonConfig, DaemonRuntime};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run,
    SyncOnce,
    Drain,
    Renew,
    SetTags { file_id: String, tags: Vec<String> },
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(first) = args.next() else {
        return Ok(CliMode::Run);
    };
    let mode = match first.as_str() {
        "run" => CliMode::Run,
        "sync-once" => CliMode::SyncOnce,
        "drain" => CliMode::Drain,
        "renew" => CliMode::Renew,
        "set-tags" => {
            let file_id = args
                .next()
                .ok_or_else(|| anyhow::anyhow!("set-tags requires a file id"))?;
            let tags = args
                .next()
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|tag| !tag.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            CliMode::SetTags { file_id, tags }
        }
        "--help" | "-h" | "help" => CliMode::Help,
        other => anyhow::bail!("unknown argument: {other}"),
    };
    if let Some(extra) = args.next() {
        anyhow::bail!("unexpected argument: {extra}");
    }
    Ok(mode)
}

fn print_help() {
    println!("Usage: gatord [COMMAND]");
    println!();
    println!("Commands:");
    println!("  run                          Run the daemon (default)");
    println!("  sync-once                    Run one change-feed pass and exit");
    println!("  drain                        Drain the download queue once and exit");
    println!("  renew                        Renew the notification lease once and exit");
    println!("  set-tags <file-id> <tags>    Reconcile a file's tags (comma-separated)");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        print_help();
        return Ok(());
    }

    let config = DaemonConfig::from_env()?;
    let runtime = DaemonRuntime::bootstrap(config).await?;
    match mode {
        CliMode::Run => runtime.run().await,
        CliMode::SyncOnce => {
            let enqueued = runtime.run_sync_once().await?;
            println!("enqueued {enqueued} file(s)");
            Ok(())
        }
        CliMode::Drain => {
            let stored = runtime.run_drain_once().await?;
            println!("stored {stored} file(s)");
            Ok(())
        }
        CliMode::Renew => {
            let next = runtime.run_renew_once().await?;
            println!("next renewal in {}s", next.as_secs());
            Ok(())
        }
        CliMode::SetTags { file_id, tags } => {
            let report = runtime.set_tags(&file_id, &tags).await?;
            println!(
                "created {} link(s), removed {} link(s)",
                report.links_created, report.links_removed
            );
            Ok(())
        }
        CliMode::Help => unreachable!(),
    }
}
