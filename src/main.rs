use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, Subcommand};
use log::info;
use std::fs::OpenOptions;

mod boundary;
mod countmat;
mod density;
mod errors;
mod filter_density;
mod fit_lda;
mod hexgrid;
mod lda;
mod posterior;
mod regionfilter;
mod tsv;
mod unitloader;
mod vocabulary;

use filter_density::{run_filter_by_density, FilterArgs};
use fit_lda::{run_lda, run_transform, LdaArgs, TransformArgs};

#[derive(Parser, Debug)]
#[command(author, version, about, arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, help = "Append log messages to this file instead of stderr")]
    log: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Keep molecules in dense tissue regions",
        long_about = "Bin molecules into overlapping hexagons, split hexagon densities into\n\
                      tissue and background, build strict and lenient tissue boundaries and\n\
                      keep the molecules inside the lenient boundary."
    )]
    FilterByDensity(FilterArgs),

    #[command(
        about = "Fit a topic model by streaming online LDA",
        long_about = "Aggregate (unit, feature, count) rows into units, fit an LDA model with\n\
                      online variational updates (optionally seeded by a prior) and report\n\
                      per unit topic proportions and topic by feature posterior counts."
    )]
    Lda(LdaArgs),

    /// Apply an existing model and report posteriors
    Transform(TransformArgs),
}

fn init_logging(log: Option<&str>) -> anyhow::Result<()> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = log {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

// An unknown command gets the full command listing, not just the usage line.
fn parse_cli() -> Cli {
    match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if err.kind() == ErrorKind::InvalidSubcommand => {
            eprintln!("{}", err);
            eprintln!("{}", Cli::command().render_help());
            std::process::exit(2);
        }
        Err(err) => err.exit(),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = parse_cli();
    init_logging(cli.log.as_deref())?;

    match &cli.command {
        Commands::FilterByDensity(args) => {
            run_filter_by_density(args)?;
        }
        Commands::Lda(args) => {
            run_lda(args)?;
        }
        Commands::Transform(args) => {
            run_transform(args)?;
        }
    }

    info!("Done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_command_lists_commands() {
        let err = Cli::try_parse_from(["punkst", "foo"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);

        let help = Cli::command().render_help().to_string();
        for command in ["filter-by-density", "lda", "transform"] {
            assert!(help.contains(command), "{} missing from:\n{}", command, help);
        }
    }

    #[test]
    fn test_known_command_parses() {
        let cli = Cli::try_parse_from(["punkst", "transform", "--input", "a", "--output", "b", "--model", "m"]).unwrap();
        assert!(matches!(cli.command, Commands::Transform(_)));
    }
}
