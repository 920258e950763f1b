use crate::export;
use crate::model::{ClientConfig, FileStatus, Group, Readiness, SessionSeed, UploadEvent};
use crate::orchestrator::{
    PollState, SessionController, SessionUpdate, UploadAggregate, UploadReport, UploadTracker,
};
use crate::prompt_store::{self, FilePromptStore, MemoryPromptStore, PromptStore};
use crate::render;
use crate::service::{AnalysisService, HttpService, UploadFile};
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

type OutputTx = mpsc::UnboundedSender<OutputLine>;

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (OutputTx, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

fn say(out: &OutputTx, lines: impl IntoIterator<Item = String>) {
    for line in lines {
        let _ = out.send(OutputLine::Stdout(line));
    }
}

fn note(out: &OutputTx, msg: impl Into<String>) {
    let _ = out.send(OutputLine::Stderr(msg.into()));
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "sortify",
    version,
    about = "Upload data files and group their rows with natural-language instructions"
)]
pub struct Cli {
    /// Base URL of the analysis and grouping service
    #[arg(long, env = "SORTIFY_BASE_URL", default_value = "http://localhost:8000")]
    pub base_url: String,

    /// Delay between readiness checks while a file is being analyzed
    #[arg(long, default_value = "2s")]
    pub poll_interval: humantime::Duration,

    /// Timeout for each request to the service
    #[arg(long, default_value = "30s")]
    pub request_timeout: humantime::Duration,

    /// Consecutive failed readiness checks tolerated before giving up
    #[arg(long, default_value_t = 5)]
    pub poll_retry_budget: u32,

    /// Files to upload; the first successful upload becomes the session
    pub files: Vec<PathBuf>,

    /// Attach to a file that was uploaded earlier instead of uploading
    #[arg(long, conflicts_with = "files")]
    pub file_id: Option<String>,

    /// List the files the service knows about and exit
    #[arg(long)]
    pub list_files: bool,

    /// Grouping instruction to send (repeatable); skips the interactive prompt
    #[arg(long = "instruction", short = 'i')]
    pub instructions: Vec<String>,

    /// Write every group as CSV into this directory when done
    #[arg(long)]
    pub export_dir: Option<PathBuf>,

    /// Print the final session (transcript and groups) as JSON
    #[arg(long)]
    pub json: bool,

    /// Where to remember that the feedback prompt was shown
    #[arg(long)]
    pub prompt_state: Option<PathBuf>,
}

/// Build a `ClientConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> ClientConfig {
    ClientConfig {
        base_url: args.base_url.clone(),
        poll_interval: Duration::from(args.poll_interval),
        request_timeout: Duration::from(args.request_timeout),
        poll_retry_budget: args.poll_retry_budget,
        ..Default::default()
    }
}

pub async fn run(args: Cli) -> Result<()> {
    let cfg = build_config(&args);
    tracing::debug!(?cfg, "starting");
    let service: Arc<dyn AnalysisService> = Arc::new(HttpService::new(&cfg)?);

    let (out, out_handle) = spawn_output_writer();
    let res = run_with(args, cfg, service, &out).await;
    drop(out);
    let _ = out_handle.await;
    res
}

async fn run_with(
    args: Cli,
    cfg: ClientConfig,
    service: Arc<dyn AnalysisService>,
    out: &OutputTx,
) -> Result<()> {
    if args.list_files {
        let files = service
            .list_file_statuses()
            .await
            .context("failed to list files")?;
        say(out, render::file_status_lines(&files));
        return Ok(());
    }

    let store = open_prompt_store(args.prompt_state.clone(), prompt_store::default_path);
    let mut ctrl = SessionController::new(service.clone(), cfg, store);
    let mut printed = 0usize;

    if !args.files.is_empty() {
        let report = upload_paths(service.clone(), &args.files, out).await?;
        let seed = first_seed(&report)?;
        ctrl.start_session(seed);
    } else if let Some(file_id) = args.file_id.as_deref() {
        let seed = attach(service.as_ref(), file_id).await?;
        ctrl.start_session(seed);
    } else if !args.instructions.is_empty() {
        bail!("--instruction needs a file to work on; pass FILES or --file-id");
    }
    print_new(&ctrl, &mut printed, out);

    if args.instructions.is_empty() {
        let input = BufReader::new(tokio::io::stdin());
        interactive(
            &mut ctrl,
            service,
            &mut printed,
            args.export_dir.as_deref(),
            input,
            out,
        )
        .await?;
    } else {
        scripted(&mut ctrl, &args.instructions, &mut printed, out).await?;
        if let Some(dir) = args.export_dir.as_deref() {
            export_groups(&ctrl, dir, out)?;
        }
    }

    if args.json {
        if let Some(session) = ctrl.session() {
            say(out, [serde_json::to_string_pretty(session)?]);
        }
    }
    Ok(())
}

/// Print transcript entries appended since the last call.
fn print_new(ctrl: &SessionController, printed: &mut usize, out: &OutputTx) {
    if let Some(session) = ctrl.session() {
        let fresh = session.transcript().since(*printed);
        say(out, render::transcript_lines(fresh));
        *printed = session.transcript().len();
    }
}

fn handle_update(update: &SessionUpdate, out: &OutputTx) {
    if let SessionUpdate::Grouped {
        prompt_feedback: true,
        ..
    } = update
    {
        note(out, render::feedback_prompt());
    }
}

/// Apply background events until polling has finished.
async fn wait_for_readiness(
    ctrl: &mut SessionController,
    printed: &mut usize,
    out: &OutputTx,
) -> Result<()> {
    while ctrl.poll_state() == PollState::Polling {
        let update = ctrl
            .next_update()
            .await
            .context("session event channel closed")?;
        handle_update(&update, out);
        print_new(ctrl, printed, out);
    }
    Ok(())
}

/// Send each instruction once analysis is done, waiting for every reply in turn.
async fn scripted(
    ctrl: &mut SessionController,
    instructions: &[String],
    printed: &mut usize,
    out: &OutputTx,
) -> Result<()> {
    wait_for_readiness(ctrl, printed, out).await?;
    for text in instructions {
        ctrl.submit_instruction(text)?;
        print_new(ctrl, printed, out);
        drain_pending(ctrl, printed, out).await?;
    }
    Ok(())
}

/// Apply events until no request or poll can report anything more.
async fn drain_pending(
    ctrl: &mut SessionController,
    printed: &mut usize,
    out: &OutputTx,
) -> Result<()> {
    while !ctrl.is_idle() {
        let update = ctrl
            .next_update()
            .await
            .context("session event channel closed")?;
        handle_update(&update, out);
        print_new(ctrl, printed, out);
    }
    Ok(())
}

async fn interactive<R>(
    ctrl: &mut SessionController,
    service: Arc<dyn AnalysisService>,
    printed: &mut usize,
    export_dir: Option<&Path>,
    input: R,
    out: &OutputTx,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    note(
        out,
        "Type a grouping instruction, or /groups, /export [dir], /export-group <name|number>, \
         /upload <path>..., /quit",
    );
    let mut lines = input.lines();

    loop {
        tokio::select! {
            update = ctrl.next_update(), if !ctrl.is_idle() => {
                if let Some(update) = update {
                    handle_update(&update, out);
                }
                print_new(ctrl, printed, out);
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    // Input closed; replies already requested still get applied and printed.
                    drain_pending(ctrl, printed, out).await?;
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match Command::parse(&line) {
                    Command::Quit => break,
                    Command::Groups => match ctrl.session() {
                        Some(s) => say(out, render::group_lines(s.groups())),
                        None => note(out, "No active session."),
                    },
                    Command::Export(dir) => {
                        let dir = dir
                            .or_else(|| export_dir.map(Path::to_path_buf))
                            .unwrap_or_else(|| PathBuf::from("."));
                        if let Err(e) = export_groups(ctrl, &dir, out) {
                            note(out, format!("Export failed: {e:#}"));
                        }
                    }
                    Command::ExportGroup("") => note(out, "Usage: /export-group <name|number>"),
                    Command::ExportGroup(key) => {
                        let dir = export_dir.unwrap_or_else(|| Path::new("."));
                        if let Err(e) = export_one(ctrl, key, dir, out) {
                            note(out, format!("Export failed: {e:#}"));
                        }
                    }
                    Command::Upload(paths) if paths.is_empty() => {
                        note(out, "Usage: /upload <path>...");
                    }
                    Command::Upload(paths) => {
                        match upload_paths(service.clone(), &paths, out).await.and_then(|r| first_seed(&r)) {
                            Ok(seed) => {
                                ctrl.start_session(seed);
                                *printed = 0;
                                print_new(ctrl, printed, out);
                            }
                            Err(e) => note(out, format!("{e:#}")),
                        }
                    }
                    Command::Instruction(text) => {
                        if let Err(e) = ctrl.submit_instruction(text) {
                            note(out, e.to_string());
                        }
                        print_new(ctrl, printed, out);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

#[derive(Debug, PartialEq)]
enum Command<'a> {
    Quit,
    Groups,
    Export(Option<PathBuf>),
    /// Group name or 1-based position, as listed by `/groups`.
    ExportGroup(&'a str),
    Upload(Vec<PathBuf>),
    Instruction(&'a str),
}

impl<'a> Command<'a> {
    fn parse(line: &'a str) -> Self {
        let mut words = line.split_whitespace();
        match words.next() {
            Some("/quit") | Some("/exit") => Command::Quit,
            Some("/groups") => Command::Groups,
            Some("/export") => Command::Export(words.next().map(PathBuf::from)),
            Some("/export-group") => {
                let rest = line.trim_start();
                Command::ExportGroup(rest["/export-group".len()..].trim())
            }
            Some("/upload") => Command::Upload(words.map(PathBuf::from).collect()),
            _ => Command::Instruction(line),
        }
    }
}

fn export_groups(ctrl: &SessionController, dir: &Path, out: &OutputTx) -> Result<()> {
    let Some(session) = ctrl.session() else {
        bail!("no active session to export");
    };
    if session.groups().is_empty() {
        note(out, "No groups to export.");
        return Ok(());
    }
    for path in export::write_all(dir, session.groups())? {
        note(out, format!("Wrote {}", path.display()));
    }
    Ok(())
}

/// Find a group by exact name, then case-insensitive name, then 1-based position.
fn find_group<'g>(groups: &'g [Group], key: &str) -> Option<&'g Group> {
    groups
        .iter()
        .find(|g| g.name == key)
        .or_else(|| groups.iter().find(|g| g.name.eq_ignore_ascii_case(key)))
        .or_else(|| {
            key.parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|i| groups.get(i))
        })
}

fn export_one(ctrl: &SessionController, key: &str, dir: &Path, out: &OutputTx) -> Result<()> {
    let Some(session) = ctrl.session() else {
        bail!("no active session to export");
    };
    let group = find_group(session.groups(), key).with_context(|| format!("no group named {key}"))?;
    let path = export::write_group(dir, group)?;
    note(out, format!("Wrote {}", path.display()));
    Ok(())
}

/// File-backed store, or an in-memory one when no location is available.
fn open_prompt_store(
    explicit: Option<PathBuf>,
    default_path: impl FnOnce() -> Result<PathBuf>,
) -> Box<dyn PromptStore> {
    match explicit.map(Ok).unwrap_or_else(default_path) {
        Ok(path) => Box::new(FilePromptStore::open(path)),
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "feedback prompt state will not be saved");
            Box::new(MemoryPromptStore::default())
        }
    }
}

/// Read `paths` and upload them concurrently, echoing progress to stderr.
async fn upload_paths(
    service: Arc<dyn AnalysisService>,
    paths: &[PathBuf],
    out: &OutputTx,
) -> Result<UploadReport> {
    let mut files = Vec::with_capacity(paths.len());
    for p in paths {
        let bytes = std::fs::read(p).with_context(|| format!("failed to read {}", p.display()))?;
        let name = p
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| p.display().to_string());
        files.push(UploadFile::new(name, bytes));
    }

    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel::<UploadEvent>();
    let progress_out = out.clone();
    let printer = tokio::spawn(async move {
        // Only print in quarter steps; chunks arrive far more often than that.
        let mut shown: HashMap<usize, u8> = HashMap::new();
        while let Some(ev) = ev_rx.recv().await {
            let show = match &ev {
                UploadEvent::Progress { index, percent, .. } => {
                    let bucket = percent / 25;
                    let last = shown.entry(*index).or_insert(0);
                    let moved = bucket > *last;
                    *last = (*last).max(bucket);
                    moved
                }
                UploadEvent::Finished { .. } => true,
            };
            if show {
                let _ = progress_out.send(OutputLine::Stderr(render::progress_line(&ev)));
            }
        }
    });

    let report = UploadTracker::new(service).with_events(ev_tx).submit(files).await;
    let _ = printer.await;

    for line in render::upload_report_lines(&report) {
        note(out, line);
    }
    Ok(report)
}

/// The first successful upload becomes the session.
fn first_seed(report: &UploadReport) -> Result<SessionSeed> {
    if report.aggregate() == UploadAggregate::AllFailed {
        bail!("no files were uploaded");
    }
    report
        .seeds()
        .next()
        .cloned()
        .context("no files were uploaded")
}

/// Build a session seed for a file uploaded in an earlier run.
async fn attach(service: &dyn AnalysisService, file_id: &str) -> Result<SessionSeed> {
    let files = service
        .list_file_statuses()
        .await
        .context("failed to look up file")?;
    let status = files
        .into_iter()
        .find(|f| f.file_id == file_id)
        .with_context(|| format!("unknown file id: {file_id}"))?;
    Ok(seed_from_status(status))
}

fn seed_from_status(status: FileStatus) -> SessionSeed {
    let readiness = if status.processed {
        Readiness::Ready
    } else {
        Readiness::Analyzing
    };
    SessionSeed {
        file_id: status.file_id,
        filename: status.filename,
        total_rows: if status.processed {
            status.total_rows
        } else {
            None
        },
        summary: None,
        readiness,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GroupingResult, Role};
    use crate::service::fake::{grouped, seed, FakeService};

    #[test]
    fn parses_commands() {
        assert_eq!(Command::parse("/quit"), Command::Quit);
        assert_eq!(Command::parse("/groups"), Command::Groups);
        assert_eq!(Command::parse("/export"), Command::Export(None));
        assert_eq!(
            Command::parse("/export out/dir"),
            Command::Export(Some(PathBuf::from("out/dir")))
        );
        assert_eq!(
            Command::parse("/upload a.csv b.csv"),
            Command::Upload(vec![PathBuf::from("a.csv"), PathBuf::from("b.csv")])
        );
        assert_eq!(
            Command::parse("Group by status"),
            Command::Instruction("Group by status")
        );
        assert_eq!(
            Command::parse("/export-group  High Scorers "),
            Command::ExportGroup("High Scorers")
        );
        assert_eq!(Command::parse("/export-group"), Command::ExportGroup(""));
        assert_eq!(
            Command::parse("  keep my spacing "),
            Command::Instruction("  keep my spacing ")
        );
    }

    fn named(name: &str) -> Group {
        Group {
            name: name.into(),
            description: None,
            items: vec![],
        }
    }

    #[test]
    fn finds_groups_by_name_or_position() {
        let groups = vec![named("High Scorers"), named("Others")];
        assert_eq!(find_group(&groups, "Others").unwrap().name, "Others");
        assert_eq!(find_group(&groups, "high scorers").unwrap().name, "High Scorers");
        assert_eq!(find_group(&groups, "2").unwrap().name, "Others");
        assert!(find_group(&groups, "0").is_none());
        assert!(find_group(&groups, "3").is_none());
        assert!(find_group(&groups, "missing").is_none());
    }

    #[test]
    fn missing_data_dir_falls_back_to_memory_store() {
        let mut store = open_prompt_store(None, || anyhow::bail!("no data directory"));
        assert!(!store.already_prompted());
        store.mark_prompted().unwrap();
        assert!(store.already_prompted());
    }

    #[test]
    fn explicit_prompt_state_path_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut store = open_prompt_store(Some(path.clone()), || unreachable!());
        store.mark_prompted().unwrap();
        assert!(path.exists());
    }

    fn stdout_lines(rx: &mut mpsc::UnboundedReceiver<OutputLine>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            if let OutputLine::Stdout(l) = line {
                lines.push(l);
            }
        }
        lines
    }

    fn controller(fake: &Arc<FakeService>) -> SessionController {
        SessionController::new(
            fake.clone(),
            ClientConfig::default(),
            Box::new(MemoryPromptStore::default()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn closed_input_still_applies_pending_replies() {
        let fake = Arc::new(FakeService::default());
        fake.push_grouping(
            Duration::from_secs(1),
            grouped(GroupingResult {
                explanation: Some("Done".into()),
                groups: vec![named("A")],
                total_rows: None,
                grouped_rows: None,
            }),
        );
        let mut ctrl = controller(&fake);
        ctrl.start_session(seed("f1", true, Some(2)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut printed = 0;
        print_new(&ctrl, &mut printed, &tx);

        interactive(&mut ctrl, fake.clone(), &mut printed, None, &b"Group by x\n"[..], &tx)
            .await
            .unwrap();

        assert!(ctrl.is_idle());
        let session = ctrl.session().unwrap();
        assert_eq!(session.transcript().last().unwrap().role(), Role::Assistant);
        assert_eq!(session.groups().len(), 1);
        let lines = stdout_lines(&mut rx);
        assert!(lines.iter().any(|l| l == "[You] Group by x"), "{lines:?}");
        assert!(lines.iter().any(|l| l == "[Sortify] Done"), "{lines:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn export_group_command_writes_one_file() {
        let fake = Arc::new(FakeService::default());
        fake.push_grouping(
            Duration::ZERO,
            grouped(GroupingResult {
                explanation: None,
                groups: vec![named("High Scorers"), named("Others")],
                total_rows: None,
                grouped_rows: None,
            }),
        );
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = controller(&fake);
        ctrl.start_session(seed("f1", true, Some(0)));
        ctrl.submit_instruction("split").unwrap();
        ctrl.next_update().await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut printed = 0;
        interactive(
            &mut ctrl,
            fake.clone(),
            &mut printed,
            Some(dir.path()),
            &b"/export-group high scorers\n"[..],
            &tx,
        )
        .await
        .unwrap();

        let written: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(written, vec!["High_Scorers.csv"]);
    }

    #[test]
    fn config_from_flags() {
        let args = Cli::parse_from([
            "sortify",
            "--base-url",
            "http://svc.test",
            "--poll-interval",
            "500ms",
            "--poll-retry-budget",
            "2",
            "data.csv",
        ]);
        let cfg = build_config(&args);
        assert_eq!(cfg.base_url, "http://svc.test");
        assert_eq!(cfg.poll_interval, Duration::from_millis(500));
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
        assert_eq!(cfg.poll_retry_budget, 2);
        assert_eq!(args.files, vec![PathBuf::from("data.csv")]);
    }

    #[test]
    fn file_id_conflicts_with_files() {
        let res = Cli::try_parse_from(["sortify", "--file-id", "f1", "data.csv"]);
        assert!(res.is_err());
    }

    #[test]
    fn attach_seed_drops_placeholder_rows() {
        let seed = seed_from_status(FileStatus {
            file_id: "f1".into(),
            filename: Some("a.csv".into()),
            processed: false,
            total_rows: Some(0),
        });
        assert_eq!(seed.readiness, Readiness::Analyzing);
        assert_eq!(seed.total_rows, None);
    }
}
