use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

use unitplan::catalog::Catalog;
use unitplan::cli::{Cli, Command};

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    unitplan::logging::init().context("init logging")?;

    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    let catalog = Catalog::load_or_builtin(cli.catalog.as_deref()).context("load catalog")?;

    match cli.command {
        Command::Subjects => {
            unitplan::catalog::print_subjects(&catalog).context("subjects")?;
        }
        Command::Synthesize(args) => {
            unitplan::synth::run(args, &catalog)
                .await
                .context("synthesize")?;
        }
        Command::Render(args) => {
            tokio::task::block_in_place(|| unitplan::render::run(args, &catalog))
                .context("render")?;
        }
        Command::Objectives(args) => {
            unitplan::objectives::run(args, &catalog).context("objectives")?;
        }
        Command::Evaluate(args) => {
            unitplan::eval::run(args, &catalog)
                .await
                .context("evaluate")?;
        }
    }

    Ok(())
}
