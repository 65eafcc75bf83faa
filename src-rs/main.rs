use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;

use visual_pilot::capture::MonitorSource;
use visual_pilot::config::PilotConfig;
use visual_pilot::detect::{CancelFlag, Detector, Outcome};
use visual_pilot::plan::{ClickSink, EnigoSink, PlanExecutor};
use visual_pilot::recorder::DebugRecorder;
use visual_pilot::scorer::{HttpVisionScorer, KeywordQuery, KeywordScorer};
use visual_pilot::template::TemplateLibrary;

#[derive(Parser, Debug)]
#[command(
    name = "visual-pilot",
    version,
    about = "Locate game UI elements on screen and drive scripted clicks"
)]
struct Cli {
    /// Pilot configuration file
    #[arg(long, global = true, default_value = "pilot.json")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Locate templates on screen, optionally gated by chat keywords
    Find(FindArgs),
    /// Execute a named action plan from the configuration
    Run(RunArgs),
    /// List configured action plans
    Plans,
    /// List loaded templates and their categories
    Templates,
}

#[derive(Args, Debug)]
struct FindArgs {
    /// Template names to search, in priority order
    templates: Vec<String>,
    /// Search every template in this category instead of naming them
    #[arg(long)]
    category: Option<String>,
    /// Accept only candidates whose adjacent text mentions this keyword
    /// (repeatable)
    #[arg(long = "keyword")]
    keywords: Vec<String>,
    /// Minimum match confidence, overriding the configured value
    #[arg(long)]
    confidence: Option<f64>,
    /// Print the result as JSON
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
    /// Click the resolved point instead of only reporting it
    #[arg(long, action = ArgAction::SetTrue)]
    click: bool,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Plan name from the configuration's `plans` table
    plan: String,
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = PilotConfig::load(&cli.config)?;

    match cli.command {
        Commands::Find(args) => command_find(&config, args),
        Commands::Run(args) => command_run(&config, args),
        Commands::Plans => command_plans(&config),
        Commands::Templates => command_templates(&config),
    }
}

fn command_find(config: &PilotConfig, args: FindArgs) -> Result<()> {
    let library = TemplateLibrary::load_dir(&config.template_dir)?;

    let mut templates = args.templates.clone();
    if let Some(category) = &args.category {
        let members = library.names_in_category(category);
        if members.is_empty() {
            bail!("no templates in category {category:?}");
        }
        templates.extend(members);
    }
    if templates.is_empty() {
        bail!("name at least one template or pass --category");
    }
    for name in &templates {
        if library.get(name).is_none() {
            bail!("unknown template: {name}");
        }
    }

    let min_confidence = args.confidence.unwrap_or(config.min_confidence);
    let query = if args.keywords.is_empty() {
        None
    } else {
        Some(KeywordQuery::new(args.keywords.clone(), min_confidence)?)
    };
    let scorer: Option<HttpVisionScorer> = if query.is_some() {
        Some(HttpVisionScorer::from_env(
            config.scorer.endpoint.clone(),
            config.scorer.model.clone(),
            &config.scorer.api_key_env,
            config.scorer.timeout(),
        )?)
    } else {
        None
    };
    let recorder = DebugRecorder::new(config.debug_dir.clone());

    let source = MonitorSource;
    let mut detector = Detector::new(&source, &library);
    detector.scorer = scorer.as_ref().map(|s| s as &dyn KeywordScorer);
    detector.recorder = Some(&recorder);
    detector.capture_region = config.capture_region;
    detector.offsets = config.offsets;

    let outcome = detector.find_match(&templates, query.as_ref(), min_confidence, &CancelFlag::new());
    let resolved = match outcome {
        Outcome::Resolved(resolved) => resolved,
        Outcome::NotFound => bail!("no match for templates {templates:?}"),
        Outcome::Failed(err) => return Err(err.into()),
        Outcome::Cancelled => bail!("detection cancelled"),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&resolved)?);
    } else {
        println!(
            "{} at ({}, {}) confidence {:.2}",
            resolved.candidate.template,
            resolved.point.x,
            resolved.point.y,
            resolved.candidate.confidence
        );
        if let Some(verdict) = &resolved.verdict {
            println!(
                "keywords found: {} (confidence {:.2})",
                verdict.keywords_found.join(", "),
                verdict.confidence
            );
        }
    }

    if args.click {
        let mut sink = EnigoSink::new()?;
        sink.click(resolved.point)?;
    }
    Ok(())
}

fn command_run(config: &PilotConfig, args: RunArgs) -> Result<()> {
    let library = TemplateLibrary::load_dir(&config.template_dir)?;
    let scorer = if config
        .plans
        .get(&args.plan)
        .is_some_and(|steps| plan_needs_scorer(steps))
    {
        Some(HttpVisionScorer::from_env(
            config.scorer.endpoint.clone(),
            config.scorer.model.clone(),
            &config.scorer.api_key_env,
            config.scorer.timeout(),
        )?)
    } else {
        None
    };
    let recorder = DebugRecorder::new(config.debug_dir.clone());
    let source = MonitorSource;

    let executor = PlanExecutor {
        config,
        library: &library,
        source: &source,
        scorer: scorer.as_ref().map(|s| s as &dyn KeywordScorer),
        recorder: Some(&recorder),
    };
    let mut sink = EnigoSink::new()?;
    executor.run_plan(&args.plan, &mut sink, &CancelFlag::new())
}

fn plan_needs_scorer(steps: &[visual_pilot::plan::Step]) -> bool {
    steps.iter().any(|step| {
        matches!(
            step.kind,
            visual_pilot::plan::ActionKind::AvatarKeywordClick { .. }
        )
    })
}

fn command_plans(config: &PilotConfig) -> Result<()> {
    if config.plans.is_empty() {
        println!("no plans configured");
        return Ok(());
    }
    for (name, steps) in &config.plans {
        println!("{name} ({} steps)", steps.len());
        for step in steps {
            if let Some(description) = &step.description {
                println!("  - {description}");
            }
        }
    }
    Ok(())
}

fn command_templates(config: &PilotConfig) -> Result<()> {
    let library = TemplateLibrary::load_dir(&config.template_dir)
        .with_context(|| format!("templates under {}", config.template_dir.display()))?;
    let rows: Vec<_> = library
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "category": t.category,
                "width": t.image.width(),
                "height": t.image.height(),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}
