use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use image::DynamicImage;
use inlay_contracts::config::AppConfig;
use inlay_contracts::events::{new_session_id, EventLog};
use inlay_contracts::geometry::{AspectPreference, ModelClass};
use inlay_contracts::selection::SelectionRect;
use inlay_engine::{Engine, GenerateParams};

#[derive(Debug, Parser)]
#[command(name = "inlay", version, about = "Photo composition assistant")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compose the object into the background and run a generation.
    Generate(GenerateArgs),
    /// Describe the selected area and print a placement prompt.
    AutoPrompt(AutoPromptArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    background: Option<PathBuf>,
    #[arg(long)]
    object: Option<PathBuf>,
    /// Selection rectangle on the background as `left,top,right,bottom`.
    #[arg(long)]
    selection: Option<String>,
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    out: PathBuf,
    #[arg(long, default_value = "match")]
    aspect: String,
    /// `local`, `pro`, or `max`.
    #[arg(long, default_value = "pro")]
    model: String,
    #[arg(long, default_value_t = 28)]
    steps: u32,
    #[arg(long, default_value_t = 2.5)]
    guidance: f64,
    #[arg(long)]
    seed: Option<i64>,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct AutoPromptArgs {
    #[arg(long)]
    background: PathBuf,
    #[arg(long)]
    object: Option<PathBuf>,
    /// Selection rectangle on the background as `left,top,right,bottom`.
    #[arg(long)]
    selection: String,
    /// Vision provider id, e.g. `qwen-vl-max`.
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("inlay error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::AutoPrompt(args) => run_auto_prompt(args),
    }
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let config = load_config(args.config.as_deref())?;
    let engine = Engine::new(config, event_log(args.events.clone()));

    let background = args
        .background
        .as_deref()
        .map(|path| open_image(path))
        .transpose()?;
    let object = args
        .object
        .as_deref()
        .map(|path| open_image(path))
        .transpose()?;
    let selection = match (&args.selection, &background) {
        (Some(raw), Some(image)) => Some(parse_selection(raw, image.width(), image.height())?),
        (Some(_), None) => bail!("--selection requires --background"),
        (None, _) => None,
    };

    let mut params = GenerateParams::new(args.prompt);
    params.background = background;
    params.object = object;
    params.selection = selection;
    params.aspect = parse_aspect(&args.aspect)?;
    params.model_class = parse_model(&args.model)?;
    params.steps = args.steps;
    params.guidance = args.guidance;
    params.seed = args.seed;
    params.credential = args.api_key;

    let progress = |fraction: f64, stage: &str| {
        eprintln!("[{:>3.0}%] {stage}", fraction * 100.0);
    };
    let result = engine.generate_with_progress(&params, Some(&progress))?;

    result
        .image
        .save(&args.out)
        .with_context(|| format!("failed writing {}", args.out.display()))?;
    println!(
        "{} {}x{} -> {}",
        result.generation_id,
        result.image.width(),
        result.image.height(),
        args.out.display()
    );
    Ok(0)
}

fn run_auto_prompt(args: AutoPromptArgs) -> Result<i32> {
    let config = load_config(args.config.as_deref())?;
    let engine = Engine::new(config, event_log(args.events.clone()));

    let background = open_image(&args.background)?;
    let object = args
        .object
        .as_deref()
        .map(|path| open_image(path))
        .transpose()?;
    let selection = parse_selection(&args.selection, background.width(), background.height())?;

    let prompt = engine.auto_prompt(
        &background,
        object.as_ref(),
        selection,
        args.provider.as_deref(),
        args.api_key.as_deref(),
    );
    println!("{prompt}");
    Ok(0)
}

fn load_config(path: Option<&std::path::Path>) -> Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load(path),
        None => Ok(AppConfig::default().with_defaults()),
    }
}

fn event_log(path: Option<PathBuf>) -> EventLog {
    match path {
        Some(path) => EventLog::new(path, new_session_id()),
        None => EventLog::disabled(),
    }
}

fn open_image(path: &std::path::Path) -> Result<DynamicImage> {
    image::open(path).with_context(|| format!("failed opening image {}", path.display()))
}

fn parse_selection(raw: &str, image_width: u32, image_height: u32) -> Result<SelectionRect> {
    let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
    if parts.len() != 4 {
        bail!("selection must be 'left,top,right,bottom', got '{raw}'");
    }
    let mut values = [0u32; 4];
    for (slot, part) in values.iter_mut().zip(&parts) {
        *slot = part
            .parse()
            .with_context(|| format!("invalid selection coordinate '{part}'"))?;
    }
    let rect = SelectionRect::new(
        values[0],
        values[1],
        values[2],
        values[3],
        image_width,
        image_height,
    )?;
    Ok(rect)
}

fn parse_aspect(raw: &str) -> Result<AspectPreference> {
    raw.parse().map_err(|err: String| anyhow::anyhow!(err))
}

fn parse_model(raw: &str) -> Result<ModelClass> {
    raw.parse().map_err(|err: String| anyhow::anyhow!(err))
}
