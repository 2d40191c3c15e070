mod config;

use anyhow::Context;
use clap::Parser;
use futures::{StreamExt, future::join_all};
use ironposh_pool_async::{PowerShell, PsItemStream};
use ironposh_pool_core::PsItem;
use ironposh_pool_tokio::ProcessRunspaceFactory;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use config::{Args, init_logging};

#[tokio::main]
#[instrument(name = "main", level = "info")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.verbose)?;
    info!("starting ironposh pool runner");

    let config = args.pool_config()?;
    info!(
        connection = config.connection.target(),
        shell = ?args.shell,
        max_size = config.max_size,
        parallel = args.parallel,
        "creating runspace pool"
    );
    let powershell = PowerShell::new(ProcessRunspaceFactory::new(args.shell), config)
        .context("failed to create runspace pool")?;

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling invocations");
                cancel.cancel();
            }
        })
    };

    let mut runs = Vec::with_capacity(args.parallel);
    for run in 0..args.parallel.max(1) {
        let ctx = args.invocation_context(cancel.clone());
        let items = powershell.invoke_with(args.pipeline()?, args.policy(), &ctx);
        runs.push(print_items(run, items, args.json));
    }

    let failures = join_all(runs).await.into_iter().filter(|ok| !ok).count();

    ctrl_c.abort();
    let status = powershell.pool().status();
    powershell.close();
    info!(failures, live = status.live, "all invocations finished");

    anyhow::ensure!(failures == 0, "{failures} invocation(s) failed");
    Ok(())
}

/// Prints one invocation's items; false when it ended with an error.
async fn print_items(run: usize, mut items: PsItemStream, json: bool) -> bool {
    while let Some(item) = items.next().await {
        match item {
            Ok(PsItem::Value(value)) if json => match serde_json::to_string(&value) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(run, error = %e, "failed to serialize value"),
            },
            Ok(PsItem::Value(value)) => println!("{value}"),
            Ok(PsItem::Error(record)) => eprintln!("{record}"),
            Err(e) => {
                error!(run, error = %e, "invocation failed");
                eprintln!("error: {e}");
                return false;
            }
        }
    }
    true
}
