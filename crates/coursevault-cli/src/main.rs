//! CourseVault CLI: entry point.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing::info;
use tracing_subscriber::EnvFilter;

use coursevault::{
    cancel_pair, ArchiveConfig, ChromiumRenderer, CrawlDriver, ResourceFormat,
};
use coursevault_cli::login::login_flow;
use coursevault_cli::progress::spawn_progress_bar;
use coursevault_cli::report::{render_json, render_text};
use coursevault_cli::{is_config_error, resolve_config, Overrides};

#[derive(Parser)]
#[command(
    name = "coursevault",
    about = "CourseVault: archive Moodle and Roeselite courses to disk",
    version,
    after_help = "Run 'coursevault <command> --help' for details on each command."
)]
struct Cli {
    /// Output the report as JSON (machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Suppress progress and non-essential output
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error). Overrides RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Archive the course described by a course file
    Run {
        /// Path to the course YAML file
        course: PathBuf,
        #[command(flatten)]
        overrides: RunArgs,
    },
    /// Log in and store the session for later runs
    Login {
        /// Path to the course YAML file
        course: PathBuf,
        /// Show the browser window
        #[arg(long)]
        headed: bool,
    },
    /// Delete the stored session of a course
    Logout {
        /// Path to the course YAML file
        course: PathBuf,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish)
        shell: Shell,
    },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Run the browser without a window
    #[arg(long, conflicts_with = "headed")]
    headless: bool,
    /// Show the browser window
    #[arg(long)]
    headed: bool,
    /// Output base directory
    #[arg(long, short)]
    output: Option<PathBuf>,
    /// Replace files that already exist
    #[arg(long)]
    replace: bool,
    /// Enabled resource format (repeatable); replaces the course file's list
    #[arg(long = "format")]
    formats: Vec<ResourceFormat>,
    /// Include pattern over node paths (repeatable)
    #[arg(long)]
    include: Vec<String>,
    /// Exclude pattern over node paths (repeatable)
    #[arg(long)]
    exclude: Vec<String>,
}

impl RunArgs {
    fn overrides(&self) -> Overrides {
        let headless = match (self.headless, self.headed) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        };
        Overrides {
            headless,
            output_dir: self.output.clone(),
            replace_existing_files: self.replace,
            formats: self.formats.clone(),
            include: self.include.clone(),
            exclude: self.exclude.clone(),
        }
    }
}

fn init_tracing(cli: &Cli) {
    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(if cli.verbose {
                "debug"
            } else if cli.quiet {
                "error"
            } else {
                "warn"
            })
        }),
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cli.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Process exit code for a command error.
fn error_exit(cli: &Cli, err: &anyhow::Error) -> i32 {
    if cli.json {
        println!(
            "{}",
            serde_json::json!({
                "error": true,
                "message": format!("{err:#}"),
            })
        );
    } else if !cli.quiet || is_config_error(err) {
        eprintln!("  Error: {err:#}");
    }
    if is_config_error(err) {
        2
    } else {
        1
    }
}

async fn run_course(cli: &Cli, course: &Path, args: &RunArgs) -> Result<i32> {
    let config = resolve_config(course, &args.overrides())?;
    let driver = build_driver(config)?;

    let (handle, token) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("  Interrupted, finishing up...");
            handle.cancel();
        }
    });
    let mut driver = driver.with_cancel(token);

    let bar = if cli.json || cli.quiet {
        None
    } else {
        let (tx, rx) = coursevault::progress::channel();
        driver = driver.with_progress(tx);
        Some(spawn_progress_bar(rx))
    };

    info!(course = %course.display(), "starting run");
    let outcome = driver.run().await;
    if let Some(bar) = bar {
        let _ = bar.await;
    }

    if cli.json {
        println!("{}", render_json(&outcome));
    } else {
        print!("{}", render_text(&outcome, cli.quiet));
    }
    Ok(outcome.exit_code())
}

fn build_driver(config: ArchiveConfig) -> Result<CrawlDriver> {
    let login = login_flow(&config);
    let driver = CrawlDriver::new(config, Arc::new(ChromiumRenderer::new()), login)?;
    Ok(driver)
}

async fn login(cli: &Cli, course: &Path, headed: bool) -> Result<i32> {
    let overrides = Overrides {
        headless: headed.then_some(false),
        ..Default::default()
    };
    let config = resolve_config(course, &overrides)?;
    let profile_dir = config.session_profile_dir();
    let driver = build_driver(config)?;
    driver.login().await?;
    if cli.json {
        println!(
            "{}",
            serde_json::json!({ "logged_in": true, "profile_dir": profile_dir })
        );
    } else if !cli.quiet {
        println!("  Session stored in {}", profile_dir.display());
    }
    Ok(0)
}

fn logout(cli: &Cli, course: &Path) -> Result<i32> {
    let config = resolve_config(course, &Overrides::default())?;
    let profile_dir = config.session_profile_dir();
    build_driver(config)?.logout()?;
    if cli.json {
        println!(
            "{}",
            serde_json::json!({ "logged_out": true, "profile_dir": profile_dir })
        );
    } else if !cli.quiet {
        println!("  Removed stored session in {}", profile_dir.display());
    }
    Ok(0)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);

    let result = match &cli.command {
        Commands::Run { course, overrides } => run_course(&cli, course, overrides).await,
        Commands::Login { course, headed } => login(&cli, course, *headed).await,
        Commands::Logout { course } => logout(&cli, course),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "coursevault", &mut std::io::stdout());
            Ok(0)
        }
    };

    // 0 = clean run, 1 = failures or abort, 2 = configuration error
    let code = match result {
        Ok(code) => code,
        Err(e) => error_exit(&cli, &e),
    };
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags() {
        let cli = Cli::try_parse_from([
            "coursevault",
            "--json",
            "run",
            "course.yaml",
            "--headed",
            "--format",
            "pdf",
            "--format",
            "zip",
            "--include",
            "^Woche",
        ])
        .unwrap();
        assert!(cli.json);
        let Commands::Run { overrides, .. } = cli.command else {
            panic!("expected run");
        };
        let o = overrides.overrides();
        assert_eq!(o.headless, Some(false));
        assert_eq!(o.formats, vec![ResourceFormat::Pdf, ResourceFormat::Zip]);
        assert_eq!(o.include, vec!["^Woche"]);
        assert!(Cli::try_parse_from(["coursevault", "run", "c.yaml", "--headless", "--headed"]).is_err());
        assert!(Cli::try_parse_from(["coursevault", "run", "c.yaml", "--format", "docx"]).is_err());
    }
}
