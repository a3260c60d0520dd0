use std::path::PathBuf;
use std::process;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use permrec_reconcile::{
    summary_line, CheckOutcome, ReconcileConfig, ReconcilePipeline, DEFAULT_OUTPUT,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "permrec")]
#[command(about = "Reconcile scattered permission inserts into one upsert script")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write the consolidated script (default)
    Generate {
        #[command(flatten)]
        args: RunArgs,
        /// Also write a JSON run report (relative to --root unless absolute)
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Exit 1 when the script on disk differs from what would be generated
    Check {
        #[command(flatten)]
        args: RunArgs,
    },
}

#[derive(Debug, Clone, Args)]
struct RunArgs {
    /// Directory the source paths are relative to
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Output script, relative to --root
    #[arg(long, default_value = DEFAULT_OUTPUT)]
    output: PathBuf,

    /// Extra gap-fill permissions (YAML)
    #[arg(long)]
    manual: Option<PathBuf>,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            output: PathBuf::from(DEFAULT_OUTPUT),
            manual: None,
        }
    }
}

impl RunArgs {
    fn into_config(self, report_path: Option<PathBuf>) -> ReconcileConfig {
        ReconcileConfig {
            workspace_root: self.root,
            output_path: self.output,
            manual_file: self.manual,
            report_path,
            ..Default::default()
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Generate {
        args: RunArgs::default(),
        report: None,
    }) {
        Commands::Generate { args, report } => {
            let pipeline = ReconcilePipeline::new(args.into_config(report))?;
            let summary = pipeline.run()?;
            println!("{}", summary_line(summary.total_permissions));
        }
        Commands::Check { args } => {
            let pipeline = ReconcilePipeline::new(args.into_config(None))?;
            match pipeline.check()? {
                CheckOutcome::UpToDate => println!("up to date"),
                CheckOutcome::Stale { path } => {
                    println!("stale: {}", path.display());
                    process::exit(1);
                }
            }
        }
    }

    Ok(())
}
