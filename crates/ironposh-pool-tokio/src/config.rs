use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use ironposh_pool_async::{ErrorPolicy, InvocationContext, Pipeline};
use ironposh_pool_core::{ConnectionInfo, PipelineCommand, PipelineSpec, PoolConfig};
use ironposh_pool_tokio::ShellDialect;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, prelude::*, registry::Registry};

/// Runs shell pipelines on a bounded pool of reusable runspaces
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Most runspaces alive at once
    #[arg(long, default_value_t = 4, help = "Maximum number of runspaces")]
    pub max_size: usize,

    #[arg(long, default_value_t = 0, help = "Runspaces created up front")]
    pub min_size: usize,

    #[arg(
        long,
        default_value_t = 100,
        help = "Leases after which a runspace is retired"
    )]
    pub max_rent_count: u32,

    /// Remote host; runs locally when omitted
    #[arg(long, help = "SSH host to run pipelines on")]
    pub host: Option<String>,

    #[arg(short, long, requires = "host", help = "SSH user name")]
    pub user: Option<String>,

    #[arg(long, requires = "host", help = "SSH identity file")]
    pub key_file: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = ShellDialect::Sh, help = "Shell dialect")]
    pub shell: ShellDialect,

    #[arg(long, value_enum, default_value_t = PolicyArg::Pass, help = "How error records are handled")]
    pub policy: PolicyArg,

    #[arg(long, help = "Cancel each invocation after this many seconds")]
    pub timeout_secs: Option<u64>,

    #[arg(long, default_value_t = 1, help = "Run the pipeline this many times concurrently")]
    pub parallel: usize,

    #[arg(long, help = "Print output values as JSON lines")]
    pub json: bool,

    /// Verbose logging (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count, help = "Increase logging verbosity")]
    pub verbose: u8,

    /// Pipeline stages, joined in order
    #[arg(short = 'c', long = "command", help = "Pipeline stage (repeatable)")]
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
    /// Errors are passed through with the output
    Pass,
    /// The stream ends at the first error
    Terminate,
    /// The first error fails the invocation
    Fail,
}

impl Args {
    pub fn connection(&self) -> anyhow::Result<ConnectionInfo> {
        let Some(host) = &self.host else {
            return Ok(ConnectionInfo::Local);
        };

        let user = match &self.user {
            Some(user) => user.clone(),
            None => std::env::var("USER").context("--user not given and USER is not set")?,
        };
        ConnectionInfo::ssh(host.clone(), user, self.key_file.clone())
            .context("invalid connection arguments")
    }

    pub fn pool_config(&self) -> anyhow::Result<PoolConfig> {
        let config = PoolConfig::builder()
            .max_size(self.max_size)
            .min_size(self.min_size)
            .max_rent_count(self.max_rent_count)
            .connection(self.connection()?)
            .build();
        config.validate().context("invalid pool configuration")?;
        Ok(config)
    }

    pub fn policy(&self) -> ErrorPolicy {
        match self.policy {
            PolicyArg::Pass => ErrorPolicy::PassThrough,
            PolicyArg::Terminate => ErrorPolicy::terminate_on_error(),
            PolicyArg::Fail => ErrorPolicy::fail_on_error(),
        }
    }

    pub fn pipeline(&self) -> anyhow::Result<Pipeline> {
        anyhow::ensure!(!self.commands.is_empty(), "at least one -c/--command is required");

        let spec: PipelineSpec = self
            .commands
            .iter()
            .map(PipelineCommand::new_script)
            .collect();
        Ok(Pipeline::new(spec))
    }

    pub fn invocation_context(&self, cancel: CancellationToken) -> InvocationContext {
        match self.timeout_secs {
            Some(secs) => InvocationContext::builder()
                .cancel(cancel)
                .timeout(Duration::from_secs(secs))
                .build(),
            None => InvocationContext::with_cancel(cancel),
        }
    }
}

/// Initialize logging with file output and proper structured logging
pub fn init_logging(verbose_level: u8) -> anyhow::Result<()> {
    let log_file = std::fs::File::create("ironposh_pool.log")?;

    let log_level = match verbose_level {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let subscriber = Registry::default().with(EnvFilter::new(log_level)).with(
        fmt::layer()
            .with_writer(log_file)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false)
            .compact(),
    );

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
