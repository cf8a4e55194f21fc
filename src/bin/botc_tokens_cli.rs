//! botc-tokens CLI
//!
//! Commands: create, group, print
//! Logs go to stderr (RUST_LOG, default info); a JSON summary goes to stdout.
//! Returns non-zero on any fatal error, 2 for bad input.

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

use botc_tokens::compositor::OverflowPolicy;
use botc_tokens::export::{load_token_dir, write_pages, write_tokens};
use botc_tokens::manifest::RunManifest;
use botc_tokens::{
    Arrangement, ComponentResolver, EngineConfig, ErrorKind, PipelineError, RoleSet, Script,
    ScriptError, TokenPipeline,
};

#[derive(Parser)]
#[command(name = "botc-tokens")]
#[command(about = "Render Clocktower tokens and pack them onto printable pages")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Args)]
struct Overrides {
    /// Engine config JSON; flags below override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    dpi: Option<u32>,

    /// Printer margin in pixels
    #[arg(long, global = true)]
    margin: Option<u32>,

    /// Gap between tokens in pixels, both directions
    #[arg(long, global = true)]
    spacing: Option<u32>,

    #[arg(long, global = true, value_enum)]
    arrangement: Option<ArrangementArg>,

    #[arg(long, global = true, value_enum)]
    overflow: Option<OverflowArg>,

    /// Render threads (default: one per core)
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Stop at the first failing token instead of reporting all of them
    #[arg(long, global = true)]
    fail_fast: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum ArrangementArg {
    Rows,
    Staggered,
}

#[derive(Clone, Copy, ValueEnum)]
enum OverflowArg {
    Fail,
    Overlap,
    Truncate,
}

#[derive(Subcommand)]
enum Commands {
    /// Render one file per token from a directory of role definitions
    Create {
        /// Directory of role JSON files
        roles_dir: PathBuf,

        #[arg(short, long, default_value = "tokens")]
        output: PathBuf,

        /// Component directories, most specific first
        #[arg(long = "components", required = true, num_args = 1..)]
        components: Vec<PathBuf>,

        /// Only render the roles in this script (default: every role)
        #[arg(long)]
        script: Option<PathBuf>,

        /// JSON map of role id to character token count
        #[arg(long)]
        copies: Option<PathBuf>,
    },

    /// Pack previously rendered token files onto pages in script order
    Group {
        script: PathBuf,

        #[arg(long, default_value = "tokens")]
        token_dir: PathBuf,

        #[arg(short, long, default_value = "printables")]
        output: PathBuf,

        /// JSON map of role id to character token count
        #[arg(long)]
        copies: Option<PathBuf>,
    },

    /// Render a script straight to pages
    Print {
        script: PathBuf,

        /// Directory of role JSON files
        roles_dir: PathBuf,

        #[arg(long = "components", required = true, num_args = 1..)]
        components: Vec<PathBuf>,

        #[arg(short, long, default_value = "printables")]
        output: PathBuf,

        #[arg(long)]
        copies: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(summary) => {
            println!("{:#}", summary);
            ExitCode::SUCCESS
        }
        Err(e) => {
            let kind = e.kind();
            println!(
                "{}",
                json!({
                    "success": false,
                    "kind": format!("{:?}", kind).to_lowercase(),
                    "error": e.to_string(),
                })
            );
            if kind == ErrorKind::Input {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn run(cli: Cli) -> Result<serde_json::Value, PipelineError> {
    let config = load_config(&cli.overrides)?;

    match cli.command {
        Commands::Create {
            roles_dir,
            output,
            components,
            script,
            copies,
        } => {
            let roles = RoleSet::load_from_dir(&roles_dir)?;
            let mut script = match script {
                Some(path) => Script::load(&path)?,
                None => Script::from_ids(roles.iter_sorted().iter().map(|r| r.id())),
            };
            apply_copies(&mut script, copies.as_deref())?;

            let mut manifest = RunManifest::new(&config).map_err(to_export)?;
            let mut pipeline = TokenPipeline::new(ComponentResolver::new(components)?, config)?;
            let (specs, tokens) = pipeline.render_script(&script, &roles)?;
            let paths = write_tokens(&output, &specs, &tokens, &mut manifest)?;
            let manifest_path = manifest.write(&output)?;
            Ok(json!({
                "success": true,
                "tokens": paths.len(),
                "manifest": manifest_path,
            }))
        }

        Commands::Group {
            script,
            token_dir,
            output,
            copies,
        } => {
            let mut script = Script::load(&script)?;
            apply_copies(&mut script, copies.as_deref())?;
            let mut manifest = RunManifest::new(&config).map_err(to_export)?;
            let basename = config.page_basename.clone();
            let pipeline = TokenPipeline::new(ComponentResolver::new(vec![])?, config)?;
            let tokens = load_token_dir(&token_dir, &script)?;
            info!(tokens = tokens.len(), "loaded token files");
            let pages = pipeline.paginate(tokens)?;
            let paths = write_pages(&output, &basename, &pages, &mut manifest)?;
            let manifest_path = manifest.write(&output)?;
            Ok(json!({
                "success": true,
                "pages": paths,
                "manifest": manifest_path,
            }))
        }

        Commands::Print {
            script,
            roles_dir,
            components,
            output,
            copies,
        } => {
            let roles = RoleSet::load_from_dir(&roles_dir)?;
            let mut script = Script::load(&script)?;
            apply_copies(&mut script, copies.as_deref())?;

            let mut manifest = RunManifest::new(&config).map_err(to_export)?;
            let basename = config.page_basename.clone();
            let mut pipeline = TokenPipeline::new(ComponentResolver::new(components)?, config)?;
            let pages = pipeline.run(&script, &roles)?;
            let paths = write_pages(&output, &basename, &pages, &mut manifest)?;
            let manifest_path = manifest.write(&output)?;
            Ok(json!({
                "success": true,
                "pages": paths,
                "manifest": manifest_path,
            }))
        }
    }
}

fn load_config(overrides: &Overrides) -> Result<EngineConfig, PipelineError> {
    let mut config = match &overrides.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(dpi) = overrides.dpi {
        config.page.dpi = dpi;
    }
    if let Some(margin) = overrides.margin {
        config.page.margin = margin;
    }
    if let Some(spacing) = overrides.spacing {
        config.packer.spacing_x = spacing;
        config.packer.spacing_y = spacing;
    }
    if let Some(arrangement) = overrides.arrangement {
        config.packer.arrangement = match arrangement {
            ArrangementArg::Rows => Arrangement::Rows,
            ArrangementArg::Staggered => Arrangement::Staggered,
        };
    }
    if let Some(overflow) = overrides.overflow {
        config.token.overflow = match overflow {
            OverflowArg::Fail => OverflowPolicy::Fail,
            OverflowArg::Overlap => OverflowPolicy::Overlap,
            OverflowArg::Truncate => OverflowPolicy::Truncate,
        };
    }
    if overrides.workers.is_some() {
        config.workers = overrides.workers;
    }
    config.fail_fast |= overrides.fail_fast;
    config.validate()?;
    Ok(config)
}

fn apply_copies(script: &mut Script, path: Option<&Path>) -> Result<(), ScriptError> {
    let Some(path) = path else {
        return Ok(());
    };
    let text = fs::read_to_string(path).map_err(|source| ScriptError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let copies: HashMap<String, u32> = serde_json::from_str(&text)
        .map_err(|e| ScriptError::MalformedScript(format!("{}: {}", path.display(), e)))?;
    script.apply_copies(&copies)
}

fn to_export(e: serde_json::Error) -> PipelineError {
    PipelineError::Export(e.into())
}
