use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use clara_agent::config::AppConfig;
use clara_agent::conversations::TurnRequest;
use clara_agent::experiments::template_summaries;
use clara_agent::models::{NewExperiment, StreamEvent};
use clara_agent::orchestrator::EventSink;
use clara_agent::{init_tracing, Runtime};
use serde::Serialize;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "clara-agent", about = "Lead-qualification chat agent")]
struct Args {
    /// YAML configuration; environment variables override it.
    #[arg(long, env = "CLARA_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive conversation on stdin/stdout.
    Chat {
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        page: Option<String>,
        #[arg(long)]
        company: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },
    /// Re-evaluate outcomes of idle conversations once.
    Sweep,
    /// Active experiment and record counts.
    Status,
    /// Experiment report, or a period summary when no experiment is given.
    Report {
        #[arg(long)]
        experiment: Option<String>,
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
    #[command(subcommand)]
    Experiment(ExperimentCommand),
    /// Apply a scheduling webhook body read from a JSON file.
    Webhook { file: PathBuf },
}

#[derive(Subcommand, Debug)]
enum ExperimentCommand {
    List,
    Templates,
    Create {
        #[arg(long, conflicts_with = "file")]
        template: Option<String>,
        /// YAML or JSON experiment definition.
        #[arg(long)]
        file: Option<PathBuf>,
    },
    Activate { id: String },
    Pause { id: String },
    Complete { id: String },
    Delete { id: String },
}

/// Writes text as it streams and tool cards on their own lines.
struct TerminalSink;

impl EventSink for TerminalSink {
    fn emit(&mut self, event: StreamEvent) {
        let mut stdout = io::stdout().lock();
        let _ = match event {
            StreamEvent::Text { content } => write!(stdout, "{}", content),
            StreamEvent::ToolResult { tool } => writeln!(stdout, "\n[{}]", tool.message),
            StreamEvent::Done => writeln!(stdout),
        };
        let _ = stdout.flush();
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_experiment(path: &Path) -> anyhow::Result<NewExperiment> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let parsed = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(&raw)?,
        _ => serde_yaml::from_str(&raw)?,
    };
    Ok(parsed)
}

async fn chat(
    runtime: &Runtime,
    session: Option<String>,
    page: Option<String>,
    company: Option<String>,
    name: Option<String>,
) -> anyhow::Result<()> {
    let conversations = runtime.conversations(runtime.completion()?)?;
    let sweeper = runtime.sweeper.start();
    let mut session_id = session;
    let mut sink = TerminalSink;

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        if message == "/quit" {
            break;
        }
        if message == "/clear" {
            if let Some(current) = session_id.as_deref() {
                let cleared = conversations.clear(current).await?;
                println!("(new session {})", cleared.session_id);
                session_id = Some(cleared.session_id);
            }
            continue;
        }

        let request = TurnRequest {
            message: message.to_string(),
            session_id: session_id.clone(),
            current_page: page.clone(),
            company_name: company.clone(),
            visitor_name: name.clone(),
        };
        match conversations.handle_turn(request, &mut sink).await {
            Ok(summary) => session_id = Some(summary.session_id),
            Err(error) if error.is_upstream() => {
                eprintln!("\nAn error occurred while processing your message ({})", error);
            }
            Err(error) => return Err(error.into()),
        }
    }

    runtime.sweeper.shutdown();
    let _ = sweeper.await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref())?;
    init_tracing(config.log_dir.as_deref())?;
    let runtime = Runtime::new(config)?;

    match args.command {
        Command::Chat {
            session,
            page,
            company,
            name,
        } => chat(&runtime, session, page, company, name).await?,
        Command::Sweep => {
            let updated = runtime.sweeper.sweep_now().await?;
            println!("updated {} outcome(s)", updated);
        }
        Command::Status => print_json(&runtime.experiments.system_status()?)?,
        Command::Report { experiment, days } => match experiment {
            Some(id) => print_json(&runtime.analytics.experiment_report(&id)?)?,
            None => print_json(&runtime.analytics.period_summary(days, Utc::now())?)?,
        },
        Command::Experiment(command) => match command {
            ExperimentCommand::List => print_json(&runtime.analytics.experiment_overviews()?)?,
            ExperimentCommand::Templates => print_json(&template_summaries())?,
            ExperimentCommand::Create { template, file } => {
                let created = match (template, file) {
                    (Some(key), None) => runtime.experiments.create_from_template(&key)?,
                    (None, Some(path)) => runtime.experiments.create(&read_experiment(&path)?)?,
                    _ => bail!("pass exactly one of --template or --file"),
                };
                print_json(&created)?;
            }
            ExperimentCommand::Activate { id } => print_json(&runtime.experiments.activate(&id)?)?,
            ExperimentCommand::Pause { id } => print_json(&runtime.experiments.pause(&id)?)?,
            ExperimentCommand::Complete { id } => print_json(&runtime.experiments.complete(&id)?)?,
            ExperimentCommand::Delete { id } => {
                runtime.experiments.delete(&id)?;
                println!("deleted {}", id);
            }
        },
        Command::Webhook { file } => {
            let raw = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let body: serde_json::Value = serde_json::from_str(&raw)?;
            let effect = runtime.bookings.handle(&body)?;
            println!("{:?}", effect);
        }
    }
    Ok(())
}
