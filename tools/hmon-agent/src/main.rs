// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! hmon-agent - host monitoring agent
//!
//! Runs the agent service in the foreground and provides the self tests used
//! when installing it on a new host.

mod probe;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::*;
use hmon::sections::render_sections;
use hmon::{
    AgentConfig, Commander, Device, ExternalPort, PortConfig, SectionRegistry, SectionSet,
    ServiceController, ServiceProcessor,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Password used by the realtime self test
const TEST_PASSWORD: &str = "axecerc";

/// Granularity of Ctrl-C checks
const TICK: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "hmon-agent")]
#[command(version)]
#[command(about = "Host monitoring agent: TCP pull snapshots and UDP realtime push")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// YAML configuration file (defaults apply when omitted)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the service in the foreground until Ctrl-C
    Exec,

    /// Self tests
    Test {
        #[command(subcommand)]
        target: TestTarget,
    },

    /// Stream realtime sections to a local receiver and print what arrives
    Realtime {
        /// Receiver port
        #[arg(short, long, default_value_t = 5555)]
        port: u16,

        /// Shared secret for the datagram bodies
        #[arg(long, default_value = TEST_PASSWORD)]
        password: String,

        /// Session liveness timeout in seconds
        #[arg(short, long, default_value_t = 30)]
        timeout: u64,
    },

    /// Render one section
    Section {
        /// Section name
        name: String,

        /// Number of renders
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,

        /// Pause between renders in milliseconds
        #[arg(short, long, default_value_t = 1000)]
        interval: u64,
    },

    /// Print the effective configuration (secret redacted)
    Config,
}

#[derive(Subcommand, Debug)]
enum TestTarget {
    /// Open the pull port with an empty reply for a while
    Port {
        /// Seconds to keep listening
        #[arg(default_value_t = 10)]
        seconds: u64,
    },

    /// Run the service and pull from it like a station would
    #[command(name = "self")]
    SelfCheck {
        /// Seconds between pulls
        #[arg(short, long, default_value_t = 5)]
        every: u64,
    },
}

fn main() {
    let args = Args::parse();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {:#}", "Error".red().bold(), e);
            std::process::exit(2);
        }
    };
    init_logging(&config.logging.level);

    if let Err(e) = run(args.command, config) {
        eprintln!("{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AgentConfig> {
    match path {
        Some(path) => AgentConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(AgentConfig::default()),
    }
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}

fn run(command: Command, config: AgentConfig) -> anyhow::Result<()> {
    match command {
        Command::Exec => run_exec(config),
        Command::Test {
            target: TestTarget::Port { seconds },
        } => run_test_port(&config, Duration::from_secs(seconds)),
        Command::Test {
            target: TestTarget::SelfCheck { every },
        } => run_self_test(config, Duration::from_secs(every.max(1))),
        Command::Realtime {
            port,
            password,
            timeout,
        } => run_realtime(&config, port, &password, Duration::from_secs(timeout)),
        Command::Section {
            name,
            count,
            interval,
        } => run_section(&name, count, Duration::from_millis(interval)),
        Command::Config => {
            print!("{}", config.redacted().to_yaml()?);
            Ok(())
        }
    }
}

fn ctrlc_flag() -> anyhow::Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;
    Ok(running)
}

/// Sleep up to `limit`, returning early once Ctrl-C is pressed. A limit past
/// the end of the clock sleeps until Ctrl-C.
fn sleep_while(running: &AtomicBool, limit: Duration) {
    let deadline = Instant::now().checked_add(limit);
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        match deadline {
            Some(deadline) if now >= deadline => break,
            Some(deadline) => thread::sleep(TICK.min(deadline - now)),
            None => thread::sleep(TICK),
        }
    }
}

fn run_exec(config: AgentConfig) -> anyhow::Result<()> {
    let service = Arc::new(ServiceProcessor::new(
        config,
        Arc::new(SectionSet::builtin()),
        |snapshot| {
            log::trace!(
                "[AGENT] generation {} ({} bytes)",
                snapshot.generation,
                snapshot.text.len()
            );
            Ok(true)
        },
    )?);

    let controller = ServiceController::new(service.clone());
    let handle = controller.handle();
    ctrlc::set_handler(move || {
        handle.stop();
    })?;

    match service.config().global.port {
        0 => println!("{} pull channel disabled", "Starting".green().bold()),
        port => println!("{} on port {}", "Starting".green().bold(), port),
    }
    println!("Press Ctrl-C to stop");

    let state = controller.run();
    println!("{} {:?}", "Service".green().bold(), state);
    Ok(())
}

fn run_test_port(config: &AgentConfig, duration: Duration) -> anyhow::Result<()> {
    let running = ctrlc_flag()?;
    let port = ExternalPort::new(PortConfig::from(&config.global));
    let addr = port.start_io(Arc::new(|_| Vec::new()))?;

    println!(
        "{} {} for {}s",
        "Listening".green().bold(),
        addr,
        duration.as_secs()
    );
    sleep_while(&running, duration);
    port.shutdown_io();

    println!(
        "{} {} connection(s) answered",
        "Done".green().bold(),
        port.replies_served()
    );
    Ok(())
}

fn run_self_test(config: AgentConfig, every: Duration) -> anyhow::Result<()> {
    let running = ctrlc_flag()?;
    let commander = config.global.secret().map(Commander::new);
    let service = ServiceProcessor::new(config, Arc::new(SectionSet::builtin()), |_| Ok(true))?;

    service.start_service();
    let addr = service
        .local_addr()
        .map(probe::dial_address)
        .context("pull channel is not listening")?;
    println!("{} pulling {} every {:?}", "Self test".cyan().bold(), addr, every);

    let mut failures = 0u32;
    while running.load(Ordering::SeqCst) {
        match probe::pull(addr, commander.as_ref(), Duration::from_secs(5)) {
            Ok(reply) => {
                let sections = reply.windows(3).filter(|w| *w == b"<<<").count();
                println!(
                    "{} {} bytes, {} section(s)",
                    "OK".green().bold(),
                    reply.len(),
                    sections
                );
            }
            Err(e) => {
                failures += 1;
                println!("{} {:#}", "FAIL".red().bold(), e);
            }
        }
        sleep_while(&running, every);
    }

    service.stop_service();
    if failures > 0 {
        anyhow::bail!("{} pull(s) failed", failures);
    }
    Ok(())
}

fn run_realtime(
    config: &AgentConfig,
    port: u16,
    password: &str,
    timeout: Duration,
) -> anyhow::Result<()> {
    let running = ctrlc_flag()?;
    let mut receiver = probe::Receiver::bind(port, Some(password), TICK)?;
    let port = receiver.port()?;

    let device = Device::new(Arc::new(SectionSet::builtin()))
        .with_interval(config.realtime.interval())
        .with_max_datagram(config.realtime.max_datagram);
    device.connect_from(
        "127.0.0.1",
        port,
        &config.realtime.sections,
        Some(password),
        timeout,
    )?;
    println!(
        "{} {:?} to 127.0.0.1:{} for {}s",
        "Streaming".cyan().bold(),
        config.realtime.sections,
        port,
        timeout.as_secs()
    );

    let deadline = Instant::now().checked_add(timeout);
    while running.load(Ordering::SeqCst) && deadline.map_or(true, |d| Instant::now() < d) {
        match receiver.next()? {
            Some(Ok(packet)) => {
                let text = String::from_utf8_lossy(&packet.payload);
                println!(
                    "{} ts={} {} bytes",
                    "<-".green(),
                    packet.timestamp,
                    packet.payload.len()
                );
                for line in text.lines().filter(|l| l.starts_with("<<<")) {
                    println!("   {}", line);
                }
            }
            Some(Err(e)) => println!("{} {}", "bad datagram".red(), e),
            None => {}
        }
    }

    device.stop();
    println!(
        "{} {} datagram(s) sent",
        "Done".green().bold(),
        device.datagrams_sent()
    );
    Ok(())
}

fn run_section(name: &str, count: u32, interval: Duration) -> anyhow::Result<()> {
    let sections = SectionSet::builtin();
    if let Err(e) = sections.render(name) {
        anyhow::bail!("{} (known: {})", e, sections.list_sections().join(", "));
    }

    for i in 0..count.max(1) {
        if i > 0 {
            thread::sleep(interval);
        }
        print!("{}", render_sections(&sections, &[name]));
    }
    Ok(())
}
