use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use outline::core::{Document, Section};
use outline::format::render_document;
use outline::parser::{parse_with, Mode, ParseOptions};

#[derive(Debug, Parser)]
#[command(
    name = "outline",
    about = "Outline-markup tooling built on the outline crate",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse outline files and print their structure.
    Parse(ParseArgs),

    /// Print the section tree of outline files.
    Tree(TreeArgs),

    /// Parse a file and re-render it as canonical outline text.
    Render(RenderArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Outline files to parse.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
    /// Parse mode.
    #[arg(long, value_enum, default_value_t = ModeArg::Default)]
    mode: ModeArg,
}

#[derive(Debug, Args)]
struct TreeArgs {
    /// Outline files to summarize.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Show effective tags next to each heading.
    #[arg(long)]
    tags: bool,
}

#[derive(Debug, Args)]
struct RenderArgs {
    /// Outline file to render.
    input: PathBuf,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ModeArg {
    Default,
    Flexible,
    Strict,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Default => Mode::Default,
            ModeArg::Flexible => Mode::Flexible,
            ModeArg::Strict => Mode::Strict,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match cli.command {
        Commands::Parse(args) => handle_parse(args),
        Commands::Tree(args) => handle_tree(args),
        Commands::Render(args) => handle_render(args),
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .try_init();
}

fn load(path: &Path, mode: Mode) -> Result<Document> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {path:?}"))?;
    let options = ParseOptions {
        mode,
        ..ParseOptions::default()
    };
    parse_with(&text, options).with_context(|| format!("parsing {path:?}"))
}

fn handle_parse(args: ParseArgs) -> Result<()> {
    for path in &args.inputs {
        let doc = load(path, args.mode.into())?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&doc)?);
        } else {
            println!("{doc:#?}");
        }
    }
    Ok(())
}

fn handle_tree(args: TreeArgs) -> Result<()> {
    // tag display needs inheritance, which the default mode skips
    let mode = if args.tags {
        Mode::Flexible
    } else {
        Mode::Default
    };
    for path in &args.inputs {
        let doc = load(path, mode)?;
        if args.inputs.len() > 1 {
            println!("{}:", path.display());
        }
        for section in &doc.sections {
            print_section(section, 1, args.tags);
        }
    }
    Ok(())
}

fn print_section(section: &Section, depth: usize, tags: bool) {
    let mut line = String::new();
    for _ in 0..depth {
        line.push('*');
    }
    line.push(' ');
    if let Some(keyword) = &section.todo_keyword {
        line.push_str(keyword);
        line.push(' ');
    }
    line.push_str(&section.title);
    if tags {
        let effective = section.effective_tags();
        if !effective.is_empty() {
            line.push_str("  :");
            line.push_str(&effective.join(":"));
            line.push(':');
        }
    }
    println!("{line}");
    for child in &section.children {
        print_section(child, depth + 1, tags);
    }
}

fn handle_render(args: RenderArgs) -> Result<()> {
    let doc = load(&args.input, Mode::Default)?;
    print!("{}", render_document(&doc));
    Ok(())
}
