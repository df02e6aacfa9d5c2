// StudyShare Linux: chunk store, HTTP download, LAN discovery and transfer daemon.

mod config;
mod coordinator;
mod discovery;
mod downloader;
mod gate;
mod store;
mod transport;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use studyshare_core::{AssemblyState, ChunkIdentity, Keypair, PartStatus, SessionState};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Config;
use crate::coordinator::TransferCoordinator;
use crate::downloader::ChunkDownloader;
use crate::gate::ReceiveGate;
use crate::store::ChunkStore;
use crate::transport::{LanSettings, LanTransport, TransportEvent};

/// Share lecture video parts with classmates on the same network.
#[derive(Parser, Debug)]
#[command(name = "studyshare", version, about)]
struct Cli {
    /// Config file (default: ~/.config/studyshare/config.toml, then /etc/studyshare/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Session file listing the section's videos (overrides config)
    #[arg(short, long)]
    session: Option<PathBuf>,

    /// Log format (overrides config)
    #[arg(long)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Full,
    Compact,
    Json,
}

impl LogFormat {
    fn from_config(s: &str) -> Self {
        match s {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Full,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the sharing daemon; reads control lines from stdin
    Run,
    /// Download every missing part of a video over HTTP, then exit
    Fetch { video: String },
    /// Print local parts against the session
    Status,
    /// Delete stored parts
    Clear {
        /// Only this video
        #[arg(long)]
        video: Option<String>,
        /// Only this part of the video
        #[arg(long, requires = "video")]
        part: Option<u32>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(session) = cli.session {
        cfg.session_file = Some(session);
    }
    let format = cli
        .log_format
        .unwrap_or_else(|| LogFormat::from_config(&cfg.log_format));
    init_tracing(&cfg.log_level, format);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Run => run_daemon(cfg).await,
            Command::Fetch { video } => fetch(cfg, &video).await,
            Command::Status => status(&cfg),
            Command::Clear { video, part } => clear(&cfg, video.as_deref(), part),
        }
    })
}

/// `RUST_LOG` wins over the configured level. Logs go to stderr; stdout is for status output.
fn init_tracing(level: &str, format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    match format {
        LogFormat::Full => tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
            .with(env_filter)
            .init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr).compact())
            .with(env_filter)
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr).json())
            .with(env_filter)
            .init(),
    }
}

fn open_store(cfg: &Config) -> anyhow::Result<Arc<ChunkStore>> {
    let store = ChunkStore::open(&cfg.data_dir)
        .with_context(|| format!("opening store at {}", cfg.data_dir.display()))?;
    Ok(Arc::new(store))
}

/// The full stack: store, gate, downloader, LAN transport, coordinator.
async fn build(
    cfg: &Config,
    transport_port: u16,
) -> anyhow::Result<(Arc<TransferCoordinator>, mpsc::UnboundedReceiver<TransportEvent>)> {
    let store = open_store(cfg)?;
    let gate = Arc::new(ReceiveGate::new(
        store.clone(),
        cfg.max_payload_bytes,
        cfg.max_integrity_failures,
    ));
    let downloader = ChunkDownloader::new(
        store.clone(),
        Duration::from_secs(cfg.connect_timeout_secs),
        Duration::from_secs(cfg.read_timeout_secs),
    )?;
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let transport = LanTransport::start(
        LanSettings {
            display_name: cfg.display_name.clone(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], transport_port)),
            discovery_port: cfg.discovery_port,
        },
        Arc::new(Keypair::generate()),
        gate.clone(),
        events_tx,
    )
    .await?;
    let coordinator = Arc::new(TransferCoordinator::new(
        store,
        gate,
        Arc::new(downloader),
        Arc::new(transport),
        cfg.auto_connect,
    ));
    if let Some(path) = &cfg.session_file {
        let session = config::load_session(path)?;
        coordinator.load_session(&session.section_title, session.videos)?;
    }
    Ok((coordinator, events_rx))
}

async fn run_daemon(cfg: Config) -> anyhow::Result<()> {
    let (coordinator, events) = build(&cfg, cfg.transport_port).await?;
    info!(
        endpoint = %coordinator.local_id(),
        name = %cfg.display_name,
        data_dir = %cfg.data_dir.display(),
        "studyshare started"
    );

    let loop_coordinator = coordinator.clone();
    let event_loop = tokio::spawn(async move { loop_coordinator.run(events).await });
    let announcer = tokio::spawn(announce_ready(coordinator.subscribe()));
    coordinator.start_sharing().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            r = &mut shutdown => {
                if let Err(e) = r {
                    warn!(error = %e, "signal handler failed");
                }
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !control(&coordinator, &line).await {
                        break;
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "stdin closed");
                    stdin_open = false;
                }
            },
        }
    }

    info!("shutting down");
    coordinator.stop_sharing().await;
    event_loop.abort();
    announcer.abort();
    Ok(())
}

/// Log each video once it becomes playable.
async fn announce_ready(mut state: tokio::sync::watch::Receiver<SessionState>) {
    let mut announced: HashSet<String> = HashSet::new();
    loop {
        let ready: Vec<String> = state
            .borrow_and_update()
            .videos
            .iter()
            .filter(|v| v.ready)
            .map(|v| v.title.clone())
            .collect();
        announced.retain(|t| ready.contains(t));
        for title in ready {
            if announced.insert(title.clone()) {
                info!(video = %title, "all parts present, ready to play");
            }
        }
        if state.changed().await.is_err() {
            break;
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ControlCommand {
    Status,
    Download { video: String },
    Share { video: String, part: u32, endpoint: String },
    Connect { endpoint: String },
    Disconnect { endpoint: String },
    Delete { video: String, part: u32 },
    Clear { video: Option<String> },
    Quit,
}

impl ControlCommand {
    fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        match verb {
            "status" => Ok(ControlCommand::Status),
            "quit" | "exit" => Ok(ControlCommand::Quit),
            "download" if !rest.is_empty() => Ok(ControlCommand::Download {
                video: rest.to_string(),
            }),
            "connect" if !rest.is_empty() => Ok(ControlCommand::Connect {
                endpoint: rest.to_string(),
            }),
            "disconnect" if !rest.is_empty() => Ok(ControlCommand::Disconnect {
                endpoint: rest.to_string(),
            }),
            "clear" => Ok(ControlCommand::Clear {
                video: (!rest.is_empty()).then(|| rest.to_string()),
            }),
            "delete" => {
                let (video, part) = rest.rsplit_once(' ').ok_or("usage: delete <video> <part>")?;
                let part = part
                    .parse()
                    .map_err(|_| format!("not a part index: {}", part))?;
                Ok(ControlCommand::Delete {
                    video: video.trim().to_string(),
                    part,
                })
            }
            // Titles may contain spaces; part and endpoint are the last two words.
            "share" => {
                let (head, endpoint) = rest
                    .rsplit_once(' ')
                    .ok_or("usage: share <video> <part> <endpoint>")?;
                let (video, part) = head
                    .trim_end()
                    .rsplit_once(' ')
                    .ok_or("usage: share <video> <part> <endpoint>")?;
                let part = part
                    .parse()
                    .map_err(|_| format!("not a part index: {}", part))?;
                Ok(ControlCommand::Share {
                    video: video.trim().to_string(),
                    part,
                    endpoint: endpoint.to_string(),
                })
            }
            "" => Err("empty command".into()),
            _ => Err(format!(
                "unknown command {:?} (status, download, share, connect, disconnect, delete, clear, quit)",
                line
            )),
        }
    }
}

/// Returns false on quit. Downloads run in their own task so the next line is read at once.
async fn control(coordinator: &Arc<TransferCoordinator>, line: &str) -> bool {
    let command = match ControlCommand::parse(line) {
        Ok(c) => c,
        Err(msg) => {
            println!("{}", msg);
            return true;
        }
    };
    match command {
        ControlCommand::Quit => return false,
        ControlCommand::Status => print_state(&coordinator.state()),
        ControlCommand::Download { video } => {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                match coordinator.download_video(&video).await {
                    Ok(jobs) => {
                        for job in jobs {
                            println!("{}", describe_job(&job));
                        }
                    }
                    Err(e) => println!("{}", e),
                }
            });
        }
        ControlCommand::Share {
            video,
            part,
            endpoint,
        } => match coordinator.resolve_endpoint(&endpoint) {
            Ok(id) => {
                let job = coordinator
                    .share_part(&ChunkIdentity::new(video, part), id)
                    .await;
                println!("{}", describe_job(&job));
            }
            Err(e) => println!("{}", e),
        },
        ControlCommand::Connect { endpoint } => match coordinator.resolve_endpoint(&endpoint) {
            Ok(id) => coordinator.connect(id).await,
            Err(e) => println!("{}", e),
        },
        ControlCommand::Disconnect { endpoint } => match coordinator.resolve_endpoint(&endpoint) {
            Ok(id) => coordinator.disconnect(id).await,
            Err(e) => println!("{}", e),
        },
        ControlCommand::Delete { video, part } => {
            match coordinator.delete_part(&ChunkIdentity::new(video.as_str(), part)) {
                Ok(true) => {}
                Ok(false) => println!("{} part {} is not stored", video, part),
                Err(e) => println!("{}", e),
            }
        }
        ControlCommand::Clear { video } => {
            let cleared = match &video {
                Some(title) => coordinator.clear_video(title),
                None => coordinator.clear_all(),
            };
            if let Err(e) = cleared {
                println!("{}", e);
            }
        }
    }
    true
}

fn describe_job(job: &studyshare_core::TransferJob) -> String {
    let what = job
        .identity
        .as_ref()
        .map(|k| format!("{} part {}", k.video_title, k.part_index))
        .unwrap_or_else(|| "file".to_string());
    match &job.error {
        Some(e) if e.kind.is_retryable() => format!(
            "{}: {:?} ({:?}: {}, worth retrying)",
            what, job.state, e.kind, e.message
        ),
        Some(e) => format!("{}: {:?} ({:?}: {})", what, job.state, e.kind, e.message),
        None => format!("{}: {:?} [{}]", what, job.state, job.id),
    }
}

fn print_state(state: &SessionState) {
    if let Some(section) = &state.section_title {
        println!("section: {}", section);
    }
    println!(
        "advertising: {}  discovering: {}",
        state.advertising, state.discovering
    );
    for e in &state.discovered {
        println!("  {} {} ({:?})", e.id.short(), e.name, e.state);
    }
    for video in &state.videos {
        let marks: String = state
            .parts
            .iter()
            .filter(|(k, _)| k.video_title == video.title)
            .map(|(_, s)| match s {
                PartStatus::NotReceived => '.',
                PartStatus::InFlight { .. } => '~',
                PartStatus::Received { .. } => '#',
            })
            .collect();
        println!(
            "{} [{}] {}/{}{}",
            video.title,
            marks,
            video.acquired,
            video.total,
            if video.ready { " ready" } else { "" }
        );
    }
    for job in &state.transfers {
        println!(
            "  {} {:?} {}%",
            describe_job(job),
            job.direction,
            job.percent().map_or("?".to_string(), |p| p.to_string())
        );
    }
    for orphan in &state.orphans {
        println!("  orphan: {}", orphan.display());
    }
    if let Some(err) = &state.last_error {
        let hint = if err.needs_permission() {
            " (grant the permission and retry)"
        } else {
            ""
        };
        println!("last error: {:?}: {}{}", err.kind, err.message, hint);
    }
}

async fn fetch(cfg: Config, video: &str) -> anyhow::Result<()> {
    // Not sharing: the listener gets an ephemeral port nobody is told about.
    let (coordinator, _events) = build(&cfg, 0).await?;
    let jobs = coordinator.download_video(video).await?;
    let mut failed = 0;
    for job in &jobs {
        if job.error.is_some() {
            failed += 1;
        }
        println!("{}", describe_job(job));
    }
    if coordinator.is_ready(video) {
        for path in coordinator.playback_files(video) {
            println!("{}", path.display());
        }
    }
    if failed > 0 {
        error!(video = %video, failed, "some parts failed");
        anyhow::bail!("{} of {} parts failed", failed, jobs.len());
    }
    Ok(())
}

fn status(cfg: &Config) -> anyhow::Result<()> {
    let store = open_store(cfg)?;
    let Some(path) = &cfg.session_file else {
        for record in store.all_chunks() {
            println!(
                "{} part {} ({} bytes, {:?})",
                record.identity.video_title, record.identity.part_index, record.size, record.source
            );
        }
        return Ok(());
    };
    let session = config::load_session(path)?;
    println!("section: {}", session.section_title);
    for video in &session.videos {
        store.rescan(&video.title)?;
        let assembly = AssemblyState::compute(video, &store.list_chunks(&video.title));
        println!(
            "{} {}/{}{}",
            video.title,
            assembly.acquired(),
            assembly.total,
            if assembly.is_ready() { " ready" } else { "" }
        );
        let missing = assembly.missing();
        if !missing.is_empty() {
            println!("  missing parts: {:?}", missing);
        }
    }
    for orphan in store.orphans() {
        println!("orphan: {}", orphan.display());
    }
    Ok(())
}

fn clear(cfg: &Config, video: Option<&str>, part: Option<u32>) -> anyhow::Result<()> {
    let store = open_store(cfg)?;
    match (video, part) {
        (Some(title), Some(part)) => {
            if !store.delete_chunk(&ChunkIdentity::new(title, part))? {
                println!("{} part {} is not stored", title, part);
            }
        }
        (Some(title), None) => store.clear(title)?,
        (None, _) => store.clear_all()?,
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_control_lines() {
        assert_eq!(ControlCommand::parse(" status "), Ok(ControlCommand::Status));
        assert_eq!(ControlCommand::parse("quit"), Ok(ControlCommand::Quit));
        assert_eq!(
            ControlCommand::parse("download Dynamic Programming"),
            Ok(ControlCommand::Download {
                video: "Dynamic Programming".into()
            })
        );
        assert_eq!(
            ControlCommand::parse("share Dynamic Programming 2 a1b2"),
            Ok(ControlCommand::Share {
                video: "Dynamic Programming".into(),
                part: 2,
                endpoint: "a1b2".into()
            })
        );
        assert_eq!(
            ControlCommand::parse("connect a1b2"),
            Ok(ControlCommand::Connect {
                endpoint: "a1b2".into()
            })
        );
        assert_eq!(
            ControlCommand::parse("disconnect a1"),
            Ok(ControlCommand::Disconnect {
                endpoint: "a1".into()
            })
        );
        assert_eq!(
            ControlCommand::parse("delete Dynamic Programming 0"),
            Ok(ControlCommand::Delete {
                video: "Dynamic Programming".into(),
                part: 0
            })
        );
        assert_eq!(ControlCommand::parse("clear"), Ok(ControlCommand::Clear { video: None }));
        assert_eq!(
            ControlCommand::parse("clear Sorting"),
            Ok(ControlCommand::Clear {
                video: Some("Sorting".into())
            })
        );
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(ControlCommand::parse("").is_err());
        assert!(ControlCommand::parse("download").is_err());
        assert!(ControlCommand::parse("share Sorting x a1b2").is_err());
        assert!(ControlCommand::parse("share a1b2").is_err());
        assert!(ControlCommand::parse("dance").is_err());
        assert!(ControlCommand::parse("delete Sorting").is_err());
    }

    #[tokio::test]
    async fn download_line_does_not_hold_up_the_next_one() {
        // A source that accepts and then never answers.
        let source = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/part_0.mp4", source.local_addr().unwrap());
        let _hold = tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((stream, _)) = source.accept().await {
                open.push(stream);
            }
        });

        let dir = tempfile::TempDir::new().unwrap();
        let cfg = Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let (coordinator, _events) = build(&cfg, 0).await.unwrap();
        coordinator
            .load_session("Week 5", vec![studyshare_core::SectionVideo::new("Trees", vec![url])])
            .unwrap();

        let quick = Duration::from_secs(2);
        assert!(tokio::time::timeout(quick, control(&coordinator, "download Trees"))
            .await
            .unwrap());
        assert!(tokio::time::timeout(quick, control(&coordinator, "status"))
            .await
            .unwrap());

        // The fetch is still going in the background.
        tokio::time::timeout(quick, async {
            while coordinator.state().transfers.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!coordinator.is_ready("Trees"));
        assert!(!control(&coordinator, "quit").await);
    }

    #[test]
    fn log_format_falls_back_to_full() {
        assert!(matches!(LogFormat::from_config("json"), LogFormat::Json));
        assert!(matches!(LogFormat::from_config("compact"), LogFormat::Compact));
        assert!(matches!(LogFormat::from_config("pretty"), LogFormat::Full));
    }
}
