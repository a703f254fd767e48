use clap::{Arg, Command};
use fence_relay::config::Config;
use fence_relay::message::InboundMessage;
use fence_relay::pipeline::{serve_lines, ProcessingReport, ProtectionPipeline};
use fence_relay::sweeper::Sweeper;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;

/// Allowance for analysis on top of the delivery budget when draining.
const SHUTDOWN_ANALYSIS_MARGIN: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let matches = Command::new("fence-relay")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Ephemeral protection relay for abusive or manipulative messages")
        .long_about(
            "fence-relay analyzes inbound person-to-person messages and forwards them\n\
             unchanged, with context, redacted, summarized, or not at all. Message\n\
             content only ever lives in memory.",
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/fence-relay.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test configuration validity")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-message")
                .long("test-message")
                .value_name("FILE")
                .help("Run one YAML or JSON message through the pipeline (always dry-run)")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("demo")
                .long("demo")
                .help("Run a scripted escalating conversation through the pipeline")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .help("Never hand messages to the sender")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/fence-relay.yaml");

    let (mut config, found) = match load_config(config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };

    let log_level = if matches.get_flag("verbose") {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    if !found {
        log::warn!("Configuration file '{config_path}' not found, using default configuration");
    }

    if matches.get_flag("dry-run") {
        config.delivery.dry_run = true;
    }

    if matches.get_flag("test-config") {
        test_config(&config);
        return;
    }

    if let Some(message_file) = matches.get_one::<String>("test-message") {
        config.delivery.dry_run = true;
        test_message_file(&config, message_file).await;
        return;
    }

    if matches.get_flag("demo") {
        config.delivery.dry_run = true;
        run_demo(&config).await;
        return;
    }

    if let Err(e) = config.validate() {
        log::error!("Invalid configuration: {e}");
        process::exit(1);
    }

    if let Err(e) = serve(config).await {
        log::error!("fence-relay stopped with an error: {e:#}");
        process::exit(1);
    }
}

fn load_config(path: &str) -> anyhow::Result<(Config, bool)> {
    if std::path::Path::new(path).exists() {
        Ok((Config::from_file(path)?, true))
    } else {
        Ok((Config::default(), false))
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e:#}");
            process::exit(1);
        }
    }
}

fn build_pipeline(config: &Config) -> ProtectionPipeline {
    match ProtectionPipeline::from_config(config) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            eprintln!("❌ Failed to build pipeline: {e:#}");
            process::exit(1);
        }
    }
}

fn test_config(config: &Config) {
    println!("🔍 Testing configuration...");
    println!();

    if let Err(e) = config.validate() {
        println!("❌ Configuration validation failed:");
        println!("Error: {e}");
        process::exit(1);
    }

    let thresholds = config.thresholds.resolve();
    println!("Store capacity: {}", config.store.capacity);
    println!("Default TTL: {}s", config.store.default_ttl_seconds);
    println!(
        "Sweeper: every {}s, grace {}s",
        config.sweeper.interval_seconds, config.sweeper.grace_period_seconds
    );
    println!(
        "Thresholds: context {:.2}, redact {:.2}, summarize {:.2}, block {:.2}",
        thresholds.forward_with_context,
        thresholds.redact_harmful,
        thresholds.summarize_only,
        thresholds.block_entirely
    );
    println!(
        "Oracle: {}",
        match &config.analysis.oracle {
            Some(oracle) => format!("{:?}", oracle.kind).to_lowercase(),
            None => "none (local fallbacks only)".to_string(),
        }
    );
    println!(
        "Delivery: {:?} sender, {} retries{}",
        config.delivery.sender,
        config.delivery.max_retries,
        if config.delivery.dry_run { ", dry-run" } else { "" }
    );

    build_pipeline(config);
    println!("✅ Configuration is valid");
}

async fn test_message_file(config: &Config, message_file: &str) {
    println!("🧪 Testing message file: {message_file}");
    println!();

    let content = match std::fs::read_to_string(message_file) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("❌ Error reading message file: {e}");
            process::exit(1);
        }
    };
    // YAML is a superset of JSON, so one parser covers both.
    let inbound: InboundMessage = match serde_yaml::from_str(&content) {
        Ok(inbound) => inbound,
        Err(e) => {
            eprintln!("❌ Error parsing message file: {e}");
            process::exit(1);
        }
    };

    let pipeline = build_pipeline(config);
    match pipeline.process(inbound).await {
        Ok(report) => {
            print_report(&report);
            println!();
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{json}"),
                Err(e) => eprintln!("❌ Could not render report: {e}"),
            }
        }
        Err(e) => {
            eprintln!("❌ Message rejected: {e}");
            process::exit(1);
        }
    }
}

fn print_report(report: &ProcessingReport) {
    let analysis = &report.analysis;
    println!("📊 Analysis");
    println!("  Toxicity: {:.2} ({:?})", analysis.toxicity_score, analysis.threat_level);
    println!("  Method: {:?}", analysis.method);
    println!("  Tone: {:?}", analysis.tone);
    println!("  Fact ratio: {:.2}", analysis.fact_ratio);
    if !analysis.hits.is_empty() {
        let categories: Vec<&str> = analysis.categories().iter().map(|c| c.label()).collect();
        println!("  Patterns: {}", categories.join(", "));
    }
    if analysis.escalation_detected {
        println!("  ⚠️  Escalation detected in this conversation");
    }
    println!();
    println!("🛡️  Decision: {}", report.decision.action);
    println!("  {}", report.decision.reasoning);
    println!(
        "📬 Delivery: success={} delivered={} dry_run={} attempts={}",
        report.outcome.success,
        report.outcome.delivered,
        report.outcome.dry_run,
        report.outcome.attempts
    );
}

const DEMO_CONVERSATION: &[(&str, &str)] = &[
    (
        "Saturday pickup",
        "Hi, pickup is at 5pm on Saturday at the school gate. Thanks for packing lunch.",
    ),
    (
        "Re: Saturday pickup",
        "You always change plans at the last minute. Whatever.",
    ),
    (
        "Re: Saturday pickup",
        "After everything I've done for this family, how could you? Everyone knows you never listen.",
    ),
    (
        "Re: Saturday pickup",
        "You are pathetic and worthless. Do what I say or you'll regret it. \
         I'll take the kids and everyone will know why.",
    ),
];

async fn run_demo(config: &Config) {
    println!("🎬 Demo: escalating conversation (dry-run)");
    println!("═══════════════════════════════════════");

    let pipeline = build_pipeline(config);
    for (i, (subject, body)) in DEMO_CONVERSATION.iter().enumerate() {
        let inbound = InboundMessage {
            id: None,
            sender: "ex-partner@example.org".to_string(),
            recipients: vec!["alias-7@relay.example.net".to_string()],
            subject: subject.to_string(),
            body: body.to_string(),
            html_body: None,
            real_user: "parent@example.com".to_string(),
            ttl_seconds: None,
        };

        match pipeline.process(inbound).await {
            Ok(report) => {
                println!();
                println!("✉️  Message {} of {}", i + 1, DEMO_CONVERSATION.len());
                print_report(&report);
                if report.decision.action.is_delivered() {
                    println!("  Delivered body:");
                    for line in report.decision.content.body.lines() {
                        println!("    | {line}");
                    }
                }
            }
            Err(e) => eprintln!("❌ Message {} rejected: {e}", i + 1),
        }
    }

    println!();
    let stats = pipeline.statistics().snapshot();
    println!(
        "📈 Processed {} messages, {} escalations, average score {:.2}",
        stats.total_messages,
        stats.escalations,
        stats.average_score()
    );
}

/// Read one JSON message per line from stdin until EOF or Ctrl-C.
async fn serve(config: Config) -> anyhow::Result<()> {
    let pipeline = Arc::new(ProtectionPipeline::from_config(&config)?);
    log::info!(
        "Starting fence-relay (capacity {}, dry_run={})",
        config.store.capacity,
        pipeline.delivery().is_dry_run()
    );

    let sweeper = Sweeper::new(
        pipeline.store().clone(),
        config.sweeper.grace_period(),
        config.sweeper.interval(),
    )
    .with_statistics(pipeline.statistics().clone())
    .spawn();

    let reporter = config.statistics.enabled.then(|| {
        pipeline
            .statistics()
            .clone()
            .spawn_reporter(Duration::from_secs(config.statistics.report_interval_seconds.max(1)))
    });

    let idle_timeout = Duration::from_secs(config.sessions.idle_timeout_seconds);
    let sessions = pipeline.sessions().clone();
    let session_cleanup = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(idle_timeout.max(Duration::from_secs(60)) / 4);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sessions.close_idle(idle_timeout);
        }
    });

    // Ingestion stops first; in-flight messages may still need their full retry budget.
    let drain_timeout = pipeline
        .delivery()
        .worst_case_duration()
        .saturating_add(SHUTDOWN_ANALYSIS_MARGIN);
    let served = serve_lines(
        pipeline.clone(),
        BufReader::new(tokio::io::stdin()),
        shutdown_signal(),
        drain_timeout,
    )
    .await;

    session_cleanup.abort();
    if let Some(reporter) = reporter {
        reporter.abort();
    }
    sweeper.shutdown().await;
    pipeline.statistics().log_summary();

    let summary = served?;
    log::info!(
        "Served {} message(s), skipped {} malformed, abandoned {}",
        summary.accepted,
        summary.malformed,
        summary.abandoned
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("Cannot listen for Ctrl-C ({e}); stopping at end of input only");
        std::future::pending::<()>().await;
    }
}
