use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use dialoguer::{Confirm, Input, Select};
use jetctl::consumer::{
    parse_duration, ConfigBuilder, ConsumerAdmin, ConsumerConfig, ConsumerFlags, FetchOptions, MessageFetcher,
    NonInteractive, Prompter, Question, SubscribeOptions,
};
use jetctl::error::{ConsumerError, ConsumerResult};
use jetctl::{init_tracing, Session, Settings};
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::time::Duration;
use yansi::Paint;

#[derive(Parser)]
#[command(name = "jetctl", version, about = "JetStream consumer management")]
struct Cli {
    /// Broker URL
    #[arg(long, global = true)]
    server: Option<String>,

    /// Request timeout, for example 5s
    #[arg(long, global = true, value_parser = duration_arg)]
    timeout: Option<Duration>,

    /// Settings file
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Log JetStream API traffic
    #[arg(long, global = true)]
    trace: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Log level or filter directive
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new consumer
    #[command(visible_aliases = ["create", "new"])]
    Add(AddArgs),

    /// Create a new consumer based on an existing one
    #[command(visible_alias = "cp")]
    Copy(CopyArgs),

    /// Consumer information
    #[command(visible_alias = "nfo")]
    Info(InfoArgs),

    /// List known consumers
    #[command(visible_alias = "list")]
    Ls(LsArgs),

    /// Retrieve the next message from a pull consumer
    Next(NextArgs),

    /// Remove a consumer
    #[command(visible_aliases = ["delete", "del"])]
    Rm(RmArgs),

    /// Retrieve messages from a consumer
    Sub(SubArgs),

    /// Force a new leader election by standing down the current leader
    #[command(visible_aliases = ["elect", "down"])]
    StepDown(InfoArgs),

    /// Report on consumer metrics
    Report(ReportArgs),
}

#[derive(Args, Clone, Default)]
struct ConfigArgs {
    /// Push delivery subject
    #[arg(long = "target")]
    deliver_subject: Option<String>,

    /// Only deliver messages matching this subject
    #[arg(long = "filter")]
    filter_subject: Option<String>,

    /// Where to start: all, new, last, a sequence or a duration such as 1h
    #[arg(long = "deliver")]
    start_policy: Option<String>,

    /// Acknowledgement policy: none, all or explicit
    #[arg(long = "ack")]
    ack_policy: Option<String>,

    /// Replay policy: instant or original
    #[arg(long = "replay")]
    replay_policy: Option<String>,

    /// Acknowledgement wait
    #[arg(long, value_parser = duration_arg)]
    wait: Option<Duration>,

    /// Percentage of acknowledgements to sample
    #[arg(long = "sample")]
    sample_pct: Option<i64>,

    /// Maximum delivery attempts, -1 for unlimited
    #[arg(long = "max-deliver", allow_hyphen_values = true)]
    max_deliver: Option<i64>,

    /// Maximum outstanding acknowledgements
    #[arg(long = "max-pending", allow_hyphen_values = true)]
    max_ack_pending: Option<i64>,

    /// Rate limit in bits per second
    #[arg(long = "bps")]
    rate_limit_bps: Option<u64>,

    /// Pull mode
    #[arg(long)]
    pull: bool,

    /// Create an ephemeral consumer
    #[arg(long)]
    ephemeral: bool,
}

impl ConfigArgs {
    fn into_flags(self, name: Option<String>, config_file: Option<PathBuf>) -> ConsumerFlags {
        ConsumerFlags {
            name,
            ephemeral: self.ephemeral,
            pull: self.pull,
            deliver_subject: self.deliver_subject,
            filter_subject: self.filter_subject,
            start_policy: self.start_policy,
            ack_policy: self.ack_policy,
            replay_policy: self.replay_policy,
            ack_wait: self.wait,
            sample_pct: self.sample_pct,
            max_deliver: self.max_deliver,
            max_ack_pending: self.max_ack_pending,
            rate_limit_bps: self.rate_limit_bps,
            config_file,
        }
    }
}

#[derive(Args)]
struct AddArgs {
    /// Stream name
    stream: Option<String>,
    /// Consumer name
    consumer: Option<String>,
    /// JSON or YAML file to read the configuration from
    #[arg(long)]
    config: Option<PathBuf>,
    /// Only validate the configuration
    #[arg(long)]
    validate: bool,
    /// Save the configuration to a file instead of creating it
    #[arg(long)]
    output: Option<PathBuf>,
    #[command(flatten)]
    options: ConfigArgs,
}

#[derive(Args)]
struct CopyArgs {
    /// Stream name
    stream: String,
    /// Source consumer
    source: String,
    /// Destination consumer
    destination: String,
    #[command(flatten)]
    options: ConfigArgs,
}

#[derive(Args)]
struct InfoArgs {
    /// Stream name
    stream: Option<String>,
    /// Consumer name
    consumer: Option<String>,
    /// Produce JSON output
    #[arg(long, short = 'j')]
    json: bool,
}

#[derive(Args)]
struct LsArgs {
    /// Stream name
    stream: Option<String>,
    /// Produce JSON output
    #[arg(long, short = 'j')]
    json: bool,
}

#[derive(Args)]
struct RmArgs {
    /// Stream name
    stream: Option<String>,
    /// Consumer name
    consumer: Option<String>,
    /// Delete without confirmation
    #[arg(long, short = 'f')]
    force: bool,
}

#[derive(Args)]
struct NextArgs {
    /// Stream name
    stream: Option<String>,
    /// Consumer name
    consumer: Option<String>,
    /// Do not acknowledge the message
    #[arg(long)]
    no_ack: bool,
    /// Show only the message body
    #[arg(long)]
    raw: bool,
    /// Wait a random time up to this long before acknowledging
    #[arg(long, value_parser = duration_arg)]
    wait: Option<Duration>,
}

#[derive(Args)]
struct SubArgs {
    /// Stream name
    stream: Option<String>,
    /// Consumer name
    consumer: Option<String>,
    /// Do not acknowledge messages
    #[arg(long)]
    no_ack: bool,
    /// Show only message bodies
    #[arg(long)]
    raw: bool,
}

#[derive(Args)]
struct ReportArgs {
    /// Stream name
    stream: Option<String>,
    /// Show raw numbers
    #[arg(long)]
    raw: bool,
}

fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

/// Asks on the terminal for anything not given as a flag
struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn ask(&mut self, question: Question) -> ConsumerResult<String> {
        let prompt = question.message();
        let to_input = |e: dialoguer::Error| ConsumerError::input(e.to_string());

        if let Some(options) = question.options() {
            let default = question
                .default_answer()
                .and_then(|d| options.iter().position(|o| *o == d))
                .unwrap_or(0);
            let choice = Select::new()
                .with_prompt(prompt)
                .items(options)
                .default(default)
                .interact()
                .map_err(to_input)?;
            return Ok(options[choice].to_string());
        }

        let mut input = Input::<String>::new().with_prompt(prompt).allow_empty(!question.required());
        if let Some(default) = question.default_answer() {
            input = input.default(default.to_string()).show_default(!default.is_empty());
        }
        input.interact_text().map_err(to_input)
    }

    fn choose(&mut self, what: &str, options: &[String]) -> ConsumerResult<String> {
        let choice = Select::new()
            .with_prompt(format!("Select a {}", what))
            .items(options)
            .default(0)
            .interact()
            .map_err(|e| ConsumerError::input(e.to_string()))?;
        Ok(options[choice].clone())
    }
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = Settings::load(cli.settings.as_deref()).context("could not load settings")?;
    if let Some(server) = &cli.server {
        settings.server = server.clone();
    }
    if let Some(timeout) = cli.timeout {
        settings.timeout = timeout;
    }
    if let Some(level) = &cli.log_level {
        settings.log.level = level.clone();
    }
    settings.trace |= cli.trace;
    settings.log.json |= cli.json_logs;
    settings.validate()?;
    Ok(settings)
}

#[cfg(feature = "nats")]
async fn connect(settings: Settings) -> Result<Session> {
    Ok(Session::connect(settings).await?)
}

#[cfg(not(feature = "nats"))]
async fn connect(_settings: Settings) -> Result<Session> {
    bail!("jetctl was built without the nats feature and cannot reach a server")
}

fn prompter() -> Box<dyn Prompter> {
    if io::stdin().is_terminal() {
        Box::new(TerminalPrompter)
    } else {
        Box::new(NonInteractive)
    }
}

/// Resolve stream and consumer arguments, offering the broker's names for missing ones
async fn target(session: &Session, stream: Option<String>, consumer: Option<String>) -> Result<(String, String)> {
    let mut prompter = prompter();
    let stream = session.select_stream(stream, prompter.as_mut()).await?;
    let consumer = session.select_consumer(&stream, consumer, prompter.as_mut()).await?;
    Ok((stream, consumer))
}

async fn add(args: AddArgs, settings: Settings) -> Result<()> {
    let mut out = io::stdout();
    let flags = args.options.into_flags(args.consumer.clone(), args.config.clone());
    let mut prompter = prompter();
    let config: ConsumerConfig = ConfigBuilder::new(flags, prompter.as_mut())
        .normalize_file_configs(settings.normalize_file_configs)
        .build()?;

    if args.validate || args.output.is_some() {
        // Offline: nothing is sent to the broker.
        let session = Session::new(std::sync::Arc::new(jetctl::broker::MemoryBroker::new()), settings);
        let admin = ConsumerAdmin::new(&session);
        if args.validate {
            admin.validate_only(&config, &mut out)?;
        } else if let Some(path) = &args.output {
            admin.save(&config, path)?;
        }
        return Ok(());
    }

    let session = connect(settings).await?;
    let stream = session.select_stream(args.stream, prompter.as_mut()).await?;
    ConsumerAdmin::new(&session).create(&stream, &config, &mut out).await?;
    Ok(())
}

async fn run(cli: Cli, settings: Settings) -> Result<()> {
    let mut out = io::stdout();

    match cli.command {
        Command::Add(args) => add(args, settings).await,
        Command::Copy(args) => {
            let session = connect(settings).await?;
            let flags = args.options.into_flags(None, None);
            ConsumerAdmin::new(&session)
                .copy(&args.stream, &args.source, &args.destination, flags, &mut out)
                .await?;
            Ok(())
        }
        Command::Info(args) => {
            let session = connect(settings).await?;
            let (stream, consumer) = target(&session, args.stream, args.consumer).await?;
            ConsumerAdmin::new(&session)
                .info(&stream, &consumer, args.json, &mut out)
                .await?;
            Ok(())
        }
        Command::Ls(args) => {
            let session = connect(settings).await?;
            let stream = session.select_stream(args.stream, prompter().as_mut()).await?;
            ConsumerAdmin::new(&session).list(&stream, args.json, &mut out).await?;
            Ok(())
        }
        Command::Next(args) => {
            let expiry = settings.timeout;
            let session = connect(settings).await?;
            let (stream, consumer) = target(&session, args.stream, args.consumer).await?;
            let options = FetchOptions {
                ack: !args.no_ack,
                raw: args.raw,
                ack_wait: args.wait.unwrap_or_default(),
                expiry,
            };
            ConsumerAdmin::new(&session)
                .next(&mut MessageFetcher::new(), &stream, &consumer, options, &mut out)
                .await?;
            Ok(())
        }
        Command::Rm(args) => {
            if !args.force && !io::stdin().is_terminal() {
                bail!("use --force to delete without confirmation in non-interactive mode");
            }
            let session = connect(settings).await?;
            let (stream, consumer) = target(&session, args.stream, args.consumer).await?;
            if !args.force {
                let confirmed = Confirm::new()
                    .with_prompt(format!("Really delete Consumer {} > {}", stream, consumer))
                    .default(false)
                    .interact()?;
                if !confirmed {
                    return Ok(());
                }
            }
            ConsumerAdmin::new(&session).remove(&stream, &consumer).await?;
            Ok(())
        }
        Command::Sub(args) => {
            let session = connect(settings).await?;
            let (stream, consumer) = target(&session, args.stream, args.consumer).await?;
            let options = SubscribeOptions {
                ack: !args.no_ack,
                raw: args.raw,
            };
            let shutdown = async {
                let _ = tokio::signal::ctrl_c().await;
            };
            ConsumerAdmin::new(&session)
                .sub(&mut MessageFetcher::new(), &stream, &consumer, options, &mut out, shutdown)
                .await?;
            Ok(())
        }
        Command::StepDown(args) => {
            let session = connect(settings).await?;
            let (stream, consumer) = target(&session, args.stream, args.consumer).await?;
            ConsumerAdmin::new(&session)
                .step_down(&stream, &consumer, args.json, &mut out)
                .await?;
            Ok(())
        }
        Command::Report(args) => {
            let session = connect(settings).await?;
            let stream = session.select_stream(args.stream, prompter().as_mut()).await?;
            ConsumerAdmin::new(&session).report(&stream, args.raw, &mut out).await?;
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{}: {:#}", "error".red().bold(), e);
            std::process::exit(2);
        }
    };
    init_tracing(&settings.effective_log());

    if let Err(e) = run(cli, settings).await {
        tracing::debug!(error = ?e, "command failed");
        eprintln!("{}: {:#}", "error".red().bold(), e);
        std::process::exit(1);
    }
}
