//! netaudit - network activity audit sensor
//!
//! Intercepts socket connect, accept, bind and close, and tails the shared
//! audit log to stdout.

use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use netaudit_core::{
    create_metrics, AddressFamily, ConfigLoader, ProcessIdentity, Protocol, SensorConfig,
    SENSOR_VERSION,
};
use netaudit_log::{AuditLog, LineFormat, ReadError, Session, SessionOptions, LINE_CAPACITY};
use netaudit_probes::{
    AllowNone, LocalInterceptor, LocalProcesses, LocalStack, ProbeCategory, ProbeError,
    ProbePoint, ProcfsInspector, StaticWhitelist, Task, CLOSE_CATEGORIES, PLANT_ORDER,
};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "netaudit")]
#[command(version)]
#[command(about = "Network activity audit sensor", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format for status (json, text)
    #[arg(short, long, default_value = "text")]
    format: String,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "NETAUDIT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Audit synthetic socket activity and tail the log to stdout
    Demo {
        /// Number of program runs to generate (0 = infinite)
        #[arg(long, default_value = "0")]
        count: u64,

        /// Interval between program runs in milliseconds
        #[arg(long, default_value = "500")]
        interval: u64,

        /// Probe categories to enable, comma separated (default: from config)
        #[arg(long)]
        categories: Option<String>,

        /// Terse lines without the syslog prefix
        #[arg(long)]
        simple: bool,

        /// Stop once the reader has caught up
        #[arg(long)]
        eof: bool,
    },

    /// Show sensor status, configuration and probe categories
    Status,

    /// Self-test the audit log and the probe controller
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration file
    let sensor_config = load_config(cli.config.clone());

    // Setup logging - CLI verbose flag takes precedence, then config, then default
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match sensor_config.sensor.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        }
    };

    // Audit lines go to stdout, diagnostics to stderr
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Demo {
            count,
            interval,
            categories,
            simple,
            eof,
        } => {
            demo_command(
                &sensor_config,
                DemoConfig {
                    run_count: count,
                    interval_ms: interval,
                    categories,
                    simple,
                    eof,
                },
            )
            .await
        }
        Commands::Status => status_command(&sensor_config, &cli.format).await,
        Commands::Check => check_command().await,
    }
}

fn load_config(cli_path: Option<PathBuf>) -> SensorConfig {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => {
            info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            warn!("Failed to load configuration: {}, using defaults", e);
            SensorConfig::default()
        }
    }
}

struct DemoConfig {
    run_count: u64,
    interval_ms: u64,
    categories: Option<String>,
    simple: bool,
    eof: bool,
}

/// A synthetic program exercising one kind of socket activity
#[derive(Debug, Clone, Copy)]
enum DemoProgram {
    /// TCP client: connect, then close
    Curl,
    /// TCP server: accept one connection, then close it
    Sshd,
    /// UDP client over IPv6: bind, connect, close
    Dig,
    /// UDP server: bind a fixed port, then close
    Ntpd,
    /// The sensor process itself, resolved through /proc
    Sensor,
}

const DEMO_PROGRAMS: [DemoProgram; 5] = [
    DemoProgram::Curl,
    DemoProgram::Sshd,
    DemoProgram::Dig,
    DemoProgram::Ntpd,
    DemoProgram::Sensor,
];

impl DemoProgram {
    fn task(&self) -> Task {
        match self {
            DemoProgram::Curl => Task::new(4101, 4101),
            DemoProgram::Sshd => Task::new(4102, 4102),
            DemoProgram::Dig => Task::new(4103, 4104),
            DemoProgram::Ntpd => Task::new(4105, 4105),
            DemoProgram::Sensor => Task::new(std::process::id(), 1),
        }
    }

    fn path(&self) -> Option<&'static str> {
        match self {
            DemoProgram::Curl => Some("/usr/bin/curl"),
            DemoProgram::Sshd => Some("/usr/sbin/sshd"),
            DemoProgram::Dig => Some("/usr/bin/dig"),
            DemoProgram::Ntpd => Some("/usr/sbin/ntpd"),
            DemoProgram::Sensor => None,
        }
    }

    fn argv(&self) -> &'static [&'static str] {
        match self {
            DemoProgram::Curl => &["curl", "-sS", "https://example.com/"],
            DemoProgram::Sshd => &["sshd", "-D"],
            DemoProgram::Dig => &["dig", "@2001:4860:4860::8888", "example.com"],
            DemoProgram::Ntpd => &["ntpd", "-n"],
            DemoProgram::Sensor => &["netaudit", "demo"],
        }
    }

    fn run(&self, interceptor: &LocalInterceptor, round: u64) -> io::Result<()> {
        let task = self.task();
        // Vary the last octet so consecutive lines differ
        let host = (round % 250 + 1) as u8;
        match self {
            DemoProgram::Curl => {
                let fd = interceptor.socket(task, AddressFamily::Inet, Protocol::Tcp);
                interceptor.connect(task, fd, addr(&format!("93.184.216.{host}:443"))?)?;
                interceptor.close(task, fd)
            }
            DemoProgram::Sshd => {
                let listener = interceptor.socket(task, AddressFamily::Inet, Protocol::Tcp);
                interceptor.bind(task, listener, addr("0.0.0.0:22")?)?;
                let peer = addr(&format!("203.0.113.{host}:51515"))?;
                let conn = interceptor.accept(task, listener, peer)?;
                interceptor.close(task, conn)?;
                interceptor.close(task, listener)
            }
            DemoProgram::Dig => {
                let fd = interceptor.socket(task, AddressFamily::Inet6, Protocol::Udp);
                interceptor.bind(task, fd, addr("[::]:0")?)?;
                interceptor.connect(task, fd, addr("[2001:4860:4860::8888]:53")?)?;
                interceptor.close(task, fd)
            }
            DemoProgram::Ntpd => {
                let fd = interceptor.socket(task, AddressFamily::Inet, Protocol::Udp);
                interceptor.bind(task, fd, addr("0.0.0.0:123")?)?;
                interceptor.close(task, fd)
            }
            DemoProgram::Sensor => {
                let fd = interceptor.socket(task, AddressFamily::Inet, Protocol::Tcp);
                interceptor.connect(task, fd, addr("127.0.0.1:9")?)?;
                interceptor.close(task, fd)
            }
        }
    }
}

fn addr(s: &str) -> io::Result<SocketAddr> {
    s.parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{s}: {e}")))
}

/// Demo mode - audits synthetic socket activity through the in-process backend
async fn demo_command(config: &SensorConfig, demo: DemoConfig) -> anyhow::Result<()> {
    let categories = match &demo.categories {
        Some(list) => ProbeCategory::parse_list(list)?,
        None => ProbeCategory::from_settings(&config.probes),
    };

    println!();
    println!("  netaudit v{} - DEMO MODE", SENSOR_VERSION);
    println!();
    println!("  Probes: {}", categories);
    println!("  Log capacity: {} bytes", config.log.capacity);
    if demo.run_count > 0 {
        println!(
            "  Will run {} programs, one every {}ms",
            demo.run_count, demo.interval_ms
        );
    } else {
        println!("  Running programs every {}ms indefinitely", demo.interval_ms);
    }
    println!();
    println!("  Press Ctrl+C to stop");
    println!();

    let metrics = create_metrics();
    let log = AuditLog::new(config.log.capacity, metrics.clone())?;
    log.set_options(SessionOptions {
        format: LineFormat::from_simple(demo.simple || config.log.simple_format),
        send_eof: demo.eof || config.log.send_eof,
    });

    let processes = LocalProcesses::new().with_fallback(Arc::new(ProcfsInspector::new()));
    for program in DEMO_PROGRAMS {
        if let Some(path) = program.path() {
            processes.register(program.task(), path);
        }
    }

    let whitelist = StaticWhitelist::from_rules(&config.whitelist);
    info!(rules = whitelist.len(), "whitelist loaded");
    let stack = Arc::new(LocalStack::new(
        log.clone(),
        Arc::new(processes),
        Arc::new(whitelist),
        config.probes.max_threads,
    ));
    stack.controller.enable(categories)?;

    let send_eof = log.options().send_eof;
    if send_eof && demo.run_count == 0 {
        anyhow::bail!("--eof needs --count, otherwise the reader never catches up for good");
    }

    // The first session sees the whole history, so nothing generated before
    // the reader starts is missed
    let session = log.open();
    let interrupt = session.interrupt_handle();

    let mut generator = {
        let stack = Arc::clone(&stack);
        let log = log.clone();
        tokio::spawn(async move {
            generate(&stack, &log, demo.run_count, demo.interval_ms).await;
        })
    };
    if send_eof {
        // End-of-stream is reported whenever the reader is caught up
        (&mut generator).await?;
    }

    let mut reader = tokio::task::spawn_blocking(move || tail(session));
    let finished = tokio::select! {
        joined = &mut reader => Some(joined),
        result = tokio::signal::ctrl_c() => {
            result?;
            None
        }
    };
    let lines = match finished {
        Some(joined) => joined??,
        None => {
            info!("Interrupted, stopping reader");
            // The interrupt cancels a read in progress; closing ends the
            // next one if the reader was busy printing
            interrupt.interrupt();
            log.close();
            reader.await??
        }
    };

    generator.abort();
    stack.controller.shutdown();
    log.close();

    let status = log.status();
    println!();
    println!(
        "  {} lines read, {} records written, {} retained",
        lines,
        log.records_written(),
        status.retained()
    );
    println!();
    print!("{}", metrics.to_prometheus());
    info!("Demo stopped");

    Ok(())
}

/// Run the demo programs round robin
async fn generate(stack: &LocalStack, log: &AuditLog, run_count: u64, interval_ms: u64) {
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    let mut round = 0u64;
    while run_count == 0 || round < run_count {
        ticker.tick().await;
        let program = DEMO_PROGRAMS[(round % DEMO_PROGRAMS.len() as u64) as usize];

        // First run of each program also records its execution
        if round < DEMO_PROGRAMS.len() as u64 {
            if let Some(path) = program.path() {
                let argv: Vec<u8> = program
                    .argv()
                    .iter()
                    .flat_map(|arg| arg.bytes().chain(std::iter::once(0)))
                    .collect();
                let identity = ProcessIdentity {
                    pid: program.task().pid,
                    tid: program.task().tid,
                    ppid: 1,
                    ..Default::default()
                };
                log.record_execution_event(identity, path, &argv);
            }
        }

        if let Err(e) = program.run(&stack.interceptor, round) {
            warn!(program = ?program, error = %e, "demo program failed");
        }
        round += 1;
    }
}

/// Print every line the session yields until end-of-stream or interruption
fn tail(mut session: Session) -> anyhow::Result<u64> {
    let mut lines = 0;
    loop {
        match session.read_line(LINE_CAPACITY) {
            Ok(Some(line)) => {
                let mut out = io::stdout().lock();
                out.write_all(line.as_bytes())?;
                out.flush()?;
                lines += 1;
            }
            Ok(None) => break,
            Err(ReadError::DataLost { resumed_at }) => {
                warn!(resumed_at, "Reader fell behind, records were overwritten");
            }
            Err(ReadError::Interrupted) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(lines)
}

async fn status_command(config: &SensorConfig, format: &str) -> anyhow::Result<()> {
    println!();
    println!("netaudit v{}", SENSOR_VERSION);
    println!();

    // Platform
    println!(
        "Platform: {} {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    if let Some(path) = ConfigLoader::default_config_path() {
        println!("Config path: {} (exists: {})", path.display(), path.exists());
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(release) = std::fs::read_to_string("/proc/sys/kernel/osrelease") {
            println!("Kernel: {}", release.trim());
        }
        let kprobes = std::path::Path::new("/sys/kernel/debug/kprobes").exists();
        println!("Kprobes debugfs: {}", kprobes);
    }

    println!();
    println!("Effective configuration:");
    println!("{}", serde_json::to_string_pretty(config)?);

    println!();
    println!("Probe categories:");
    let configured = ProbeCategory::from_settings(&config.probes);
    for category in PLANT_ORDER {
        let points: Vec<String> = category
            .own_points()
            .iter()
            .map(ProbePoint::to_string)
            .chain(
                CLOSE_CATEGORIES
                    .contains(category)
                    .then(|| ProbePoint::CloseEntry.to_string()),
            )
            .collect();
        println!(
            "  {:<12} {:<8} {}",
            category.to_string(),
            if configured.contains(category) { "enabled" } else { "disabled" },
            points.join(", ")
        );
    }

    println!();
    println!("Metrics:");
    let metrics = create_metrics();
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&metrics.to_json())?),
        _ => print!("{}", metrics.to_prometheus()),
    }
    println!();

    Ok(())
}

async fn check_command() -> anyhow::Result<()> {
    println!("Running sensor self-test...\n");
    let mut failures = 0;

    // Test 1: Ring buffer eviction and resync
    print!("  Testing ring buffer eviction... ");
    let log = AuditLog::new(4096, create_metrics())?;
    let mut session = log.open();
    session.set_nonblocking(true);
    for pid in 0..200 {
        let identity = ProcessIdentity {
            pid,
            ..Default::default()
        };
        log.record_execution_event(identity, "/bin/true", b"true\0");
    }
    let lost = matches!(session.read_line(LINE_CAPACITY), Err(ReadError::DataLost { .. }));
    let mut drained = 0;
    while let Ok(Some(_)) = session.read_line(LINE_CAPACITY) {
        drained += 1;
    }
    let passed = lost && drained == log.status().retained();
    report(passed, &mut failures, format!("{} of 200 retained", drained));

    // Test 2: Intercepted connect renders one line
    print!("  Testing connect interception... ");
    let log = AuditLog::new(8192, create_metrics())?;
    let processes = Arc::new(LocalProcesses::new());
    let curl = Task::new(100, 100);
    processes.register(curl, "/usr/bin/curl");
    let stack = LocalStack::new(log.clone(), processes, Arc::new(AllowNone), 1024);
    stack.controller.enable(ProbeCategory::TCP_CONNECT)?;
    let fd = stack.interceptor.socket(curl, AddressFamily::Inet, Protocol::Tcp);
    stack.interceptor.connect(curl, fd, addr("93.184.216.34:443")?)?;
    let mut session = log.open();
    session.set_nonblocking(true);
    let line = session.read_line(LINE_CAPACITY).ok().flatten().unwrap_or_default();
    let passed = line.contains("/usr/bin/curl CONNECT TCPv4") && line.contains("93.184.216.34:443");
    report(passed, &mut failures, line.trim_end().to_string());

    // Test 3: Shared close point
    print!("  Testing shared close probe... ");
    stack
        .controller
        .enable(ProbeCategory::TCP_CLOSE | ProbeCategory::UDP_CLOSE)?;
    stack.controller.disable(ProbeCategory::TCP_CLOSE);
    let held = stack.interceptor.is_attached(ProbePoint::CloseEntry);
    stack.controller.disable(ProbeCategory::UDP_CLOSE);
    let released = !stack.interceptor.is_attached(ProbePoint::CloseEntry);
    report(held && released, &mut failures, "attached once".to_string());

    // Test 4: Unwinding on a missing symbol
    print!("  Testing partial failure unwind... ");
    let stack = LocalStack::with_interceptor(
        AuditLog::new(4096, create_metrics())?,
        Arc::new(LocalProcesses::new()),
        Arc::new(AllowNone),
        16,
        |interceptor| interceptor.without_symbol("inet_dgram_connect"),
    );
    let failed = matches!(
        stack.controller.enable(ProbeCategory::all()),
        Err(ProbeError::ConnectProbeFailed(_))
    );
    let kept = stack.controller.loaded();
    let passed = failed
        && kept == ProbeCategory::TCP_CONNECT | ProbeCategory::TCP_ACCEPT | ProbeCategory::TCP_CLOSE;
    report(passed, &mut failures, format!("kept {}", kept));

    // Test 5: Default configuration validates
    print!("  Testing default configuration... ");
    let passed = ConfigLoader::new().validate(&SensorConfig::default()).is_ok();
    report(passed, &mut failures, "valid".to_string());

    if failures > 0 {
        anyhow::bail!("{} self-test(s) failed", failures);
    }
    println!("\nAll tests passed!\n");

    Ok(())
}

fn report(passed: bool, failures: &mut u32, detail: String) {
    if passed {
        println!("OK ({})", detail);
    } else {
        *failures += 1;
        println!("FAILED ({})", detail);
    }
}
