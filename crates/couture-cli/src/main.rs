use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use couture_contracts::commands::{parse_intent, Intent, EDIT_HELP_COMMANDS};
use couture_contracts::events::EventWriter;
use couture_contracts::prompt::PromptParams;
use couture_contracts::sessions::{GenerationSession, SlotState};
use couture_contracts::versions::{AspectRatio, CropSelection};
use couture_contracts::StudioError;
use couture_engine::{
    BackendKind, Backends, CancelToken, OperationOutcome, Studio, StudioConfig, TransformKind,
};
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(name = "couture", version, about = "Fashion image studio")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive editing session.
    Edit(EditArgs),
    /// One-shot generation from an image.
    Generate(GenerateArgs),
    /// Browse saved history records.
    History(HistoryArgs),
}

#[derive(Debug, Parser)]
struct WorkspaceArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    /// Overrides COUTURE_BACKEND.
    #[arg(long)]
    backend: Option<String>,
}

#[derive(Debug, Parser)]
struct EditArgs {
    #[arg(long)]
    image: Option<PathBuf>,
    #[command(flatten)]
    workspace: WorkspaceArgs,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long, default_value_t = 4)]
    count: usize,
    #[arg(long)]
    video: bool,
    /// Prompt parameter as key=value; repeatable.
    #[arg(long = "param")]
    params: Vec<String>,
    /// Manual prompt; replaces the one derived from --param.
    #[arg(long)]
    prompt: Option<String>,
    #[command(flatten)]
    workspace: WorkspaceArgs,
}

#[derive(Debug, Parser)]
struct HistoryArgs {
    #[arg(long, default_value_t = 1)]
    page: usize,
    #[arg(long, default_value_t = 20)]
    per_page: usize,
    /// Record id to restore and print.
    #[arg(long)]
    show: Option<String>,
    #[command(flatten)]
    workspace: WorkspaceArgs,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("couture error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Edit(args) => {
            run_edit(args)?;
            Ok(0)
        }
        Command::Generate(args) => run_generate(args),
        Command::History(args) => {
            run_history(args)?;
            Ok(0)
        }
    }
}

fn open_studio(args: &WorkspaceArgs) -> Result<Studio> {
    let mut config = StudioConfig::from_env()?;
    if let Some(raw) = args.backend.as_deref() {
        config.backend = BackendKind::parse(raw)?;
    }
    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed creating {}", args.out.display()))?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let workspace_id = args
        .out
        .file_name()
        .and_then(|value| value.to_str())
        .filter(|value| !value.is_empty())
        .unwrap_or("couture")
        .to_string();
    let backends = Backends::from_config(&config, &args.out)?;
    Ok(Studio::new(
        &config,
        backends,
        EventWriter::new(events_path, workspace_id),
    ))
}

fn run_edit(args: EditArgs) -> Result<()> {
    let studio = open_studio(&args.workspace)?;
    let mut stdout = io::stdout();
    if let Some(image) = args.image.as_deref() {
        load_image(&studio, image, &mut stdout)?;
    }

    let stdin = io::stdin();
    let mut line = String::new();
    writeln!(stdout, "Couture studio started. Type /help for commands.")?;
    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }
        let intent = parse_intent(line.trim_end_matches(['\n', '\r']));
        if handle_intent(&studio, &intent, &mut stdout)? == Flow::Quit {
            break;
        }
    }
    Ok(())
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let studio = open_studio(&args.workspace)?;
    let mut stdout = io::stdout();
    studio.load_image(&args.image)?;
    let mut params = PromptParams::new();
    let applied = params.apply_assignments(args.params.iter().map(String::as_str));
    if applied != args.params.len() {
        bail!("--param expects key=value pairs");
    }
    studio.set_params(params);
    if let Some(prompt) = args.prompt.as_deref() {
        studio.set_prompt_text(prompt);
    }
    writeln!(stdout, "Prompt: {}", studio.snapshot().prompt.text)?;

    let cancel = CancelToken::new();
    let session = if args.video {
        studio.generate_video(&cancel)?
    } else {
        studio.generate_images(args.count, &cancel)?
    };
    print_session(&session, &mut stdout)?;
    let record = studio.save_history()?;
    writeln!(stdout, "Saved history record {}", record.id)?;
    Ok(if session.urls().is_empty() { 2 } else { 0 })
}

fn run_history(args: HistoryArgs) -> Result<()> {
    let studio = open_studio(&args.workspace)?;
    let mut stdout = io::stdout();
    if let Some(id) = args.show.as_deref() {
        let record = studio.load_history(id)?;
        writeln!(stdout, "{}  {}", record.id, record.created_at)?;
        writeln!(stdout, "Prompt: {}", record.prompt)?;
        print_versions(&studio, &mut stdout)?;
        if let Some(session) = record.session.as_ref() {
            print_session(session, &mut stdout)?;
        }
        return Ok(());
    }

    let page = studio.list_history(args.page, args.per_page)?;
    if page.records.is_empty() {
        writeln!(stdout, "No history records.")?;
        return Ok(());
    }
    for summary in &page.records {
        writeln!(
            stdout,
            "{}  {}  {:<6}  {} output(s)  {}",
            summary.id,
            summary.created_at,
            summary.kind.as_deref().unwrap_or("edit"),
            summary.output_count,
            summary.prompt
        )?;
    }
    writeln!(
        stdout,
        "Page {}/{} ({} records)",
        page.page, page.total_pages, page.total
    )?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

fn handle_intent(studio: &Studio, intent: &Intent, out: &mut impl Write) -> Result<Flow> {
    match intent.action.as_str() {
        "noop" => {}
        "quit" => return Ok(Flow::Quit),
        "help" => {
            writeln!(out, "Commands: {}", EDIT_HELP_COMMANDS.join(" "))?;
        }
        "load_image" => match intent.arg_str("value") {
            Some(path) => load_image(studio, Path::new(path), out)?,
            None => writeln!(out, "/load requires a path")?,
        },
        "transform" => {
            let kind = intent.arg_str("kind").and_then(TransformKind::parse);
            match kind {
                Some(kind) => report_outcome(studio, studio.transform(kind), out)?,
                None => writeln!(out, "Unknown transform")?,
            }
        }
        "crop" => {
            let selection = CropSelection::from_percent(
                intent.arg_f64("x").unwrap_or_default(),
                intent.arg_f64("y").unwrap_or_default(),
                intent.arg_f64("width").unwrap_or_default(),
                intent.arg_f64("height").unwrap_or_default(),
            );
            if studio.set_crop_selection(Some(selection)) {
                report_outcome(studio, studio.crop_current(), out)?;
            } else {
                writeln!(out, "Load an image first.")?;
            }
        }
        "set_aspect" => match intent.arg_str("value").and_then(AspectRatio::parse) {
            Some(ratio) if studio.set_aspect_ratio(Some(ratio)) => {
                writeln!(out, "Aspect ratio: {}", ratio.label())?;
            }
            Some(_) => writeln!(out, "Load an image first.")?,
            None => writeln!(out, "/aspect expects free, 1:1, 4:5, 3:4, 9:16 or 16:9")?,
        },
        "undo" => {
            if studio.undo() {
                print_active(studio, out)?;
            } else {
                writeln!(out, "Nothing to undo.")?;
            }
        }
        "redo" => {
            if studio.redo() {
                print_active(studio, out)?;
            } else {
                writeln!(out, "Nothing to redo.")?;
            }
        }
        "select_version" => {
            let id = intent.arg_str("version_id").unwrap_or_default();
            if studio.select_version(id) {
                print_active(studio, out)?;
            } else {
                writeln!(out, "No selectable version '{id}'.")?;
            }
        }
        "compare" => {
            let left = intent.arg_str("left").unwrap_or_default();
            let right = intent.arg_str("right").unwrap_or_default();
            if studio.compare(left, right) {
                let graph = studio.snapshot().graph;
                let url = |id: &str| {
                    graph
                        .versions
                        .iter()
                        .find(|version| version.id == id)
                        .map(|version| version.image_url.clone())
                        .unwrap_or_default()
                };
                writeln!(out, "Left:  {left}  {}", url(left))?;
                writeln!(out, "Right: {right}  {}", url(right))?;
            } else {
                writeln!(out, "Both versions must exist and be complete.")?;
            }
        }
        "list_versions" => print_versions(studio, out)?,
        "set_params" => {
            let assignments = intent
                .command_args
                .get("assignments")
                .and_then(Value::as_array)
                .map(|values| {
                    values
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            if studio.apply_assignments(&assignments) == 0 {
                writeln!(out, "/set expects key=value pairs")?;
            } else {
                print_prompt(studio, out)?;
            }
        }
        "set_prompt" => {
            let text = intent.prompt.as_deref().unwrap_or_default().trim();
            if text.is_empty() {
                print_prompt(studio, out)?;
            } else {
                studio.set_prompt_text(text);
                writeln!(out, "Manual prompt set.")?;
            }
        }
        "reset_prompt" => {
            studio.reset_prompt();
            print_prompt(studio, out)?;
        }
        "generate_images" => {
            let count = intent.arg_u64("count").unwrap_or(4) as usize;
            match studio.generate_images(count, &CancelToken::new()) {
                Ok(session) => print_session(&session, out)?,
                Err(err) => {
                    report_error(&err, out)?;
                    print_session(&studio.snapshot().session, out)?;
                }
            }
        }
        "generate_video" => match studio.generate_video(&CancelToken::new()) {
            Ok(session) => print_session(&session, out)?,
            Err(err) => report_error(&err, out)?,
        },
        "save_history" => match studio.save_history() {
            Ok(record) => writeln!(out, "Saved history record {}", record.id)?,
            Err(err) => report_error(&err, out)?,
        },
        "load_history" => match intent.arg_str("value") {
            Some(id) => match studio.load_history(id) {
                Ok(record) => {
                    writeln!(out, "Restored {}", record.id)?;
                    print_active(studio, out)?;
                }
                Err(err) => report_error(&err, out)?,
            },
            None => writeln!(out, "/open requires a history record id")?,
        },
        "reset" => {
            studio.reset();
            writeln!(out, "Workspace cleared.")?;
        }
        "invalid" => {
            writeln!(
                out,
                "/{}: {}",
                intent.arg_str("command").unwrap_or("?"),
                intent.arg_str("reason").unwrap_or("invalid arguments")
            )?;
        }
        "unknown" => {
            writeln!(
                out,
                "Unknown command /{}. Type /help for commands.",
                intent.arg_str("command").unwrap_or_default()
            )?;
        }
        other => writeln!(out, "Unhandled action {other}")?,
    }
    Ok(Flow::Continue)
}

fn load_image(studio: &Studio, path: &Path, out: &mut impl Write) -> Result<()> {
    match studio.load_image(path) {
        Ok(_) => print_active(studio, out),
        Err(err) => report_error(&err, out),
    }
}

fn report_outcome(
    studio: &Studio,
    outcome: Result<OperationOutcome, StudioError>,
    out: &mut impl Write,
) -> Result<()> {
    match outcome {
        Ok(OperationOutcome::Committed { .. }) => print_active(studio, out),
        Ok(OperationOutcome::Abandoned) => {
            writeln!(out, "Result dropped: the image changed while the edit ran.")?;
            Ok(())
        }
        Err(err) => report_error(&err, out),
    }
}

/// Validation and remote failures are shown; inconsistent state is not.
fn report_error(err: &StudioError, out: &mut impl Write) -> Result<()> {
    match err {
        StudioError::Validation(message) => writeln!(out, "! {message}")?,
        StudioError::RemoteOperation { .. } => writeln!(out, "error: {err}")?,
        StudioError::InconsistentState(_) => {}
    }
    Ok(())
}

fn print_active(studio: &Studio, out: &mut impl Write) -> Result<()> {
    let graph = studio.snapshot().graph;
    match graph.active.as_ref() {
        Some(version) => {
            let size = version
                .dimensions
                .map(|dims| format!("{}x{}", dims.width, dims.height))
                .unwrap_or_else(|| "?".to_string());
            writeln!(
                out,
                "Active: {} [{}] {} {}",
                version.label, version.id, size, version.image_url
            )?;
        }
        None => writeln!(out, "No image loaded.")?,
    }
    Ok(())
}

fn print_versions(studio: &Studio, out: &mut impl Write) -> Result<()> {
    let graph = studio.snapshot().graph;
    if graph.versions.is_empty() {
        writeln!(out, "No versions.")?;
        return Ok(());
    }
    for version in &graph.versions {
        let marker = if graph.active_version_id() == Some(version.id.as_str()) {
            "*"
        } else if version.is_processing() {
            "~"
        } else {
            " "
        };
        let source = version.source_version_id.as_deref().unwrap_or("-");
        writeln!(
            out,
            "{marker} {:<40} {:<20} <- {}",
            version.id, version.label, source
        )?;
    }
    writeln!(
        out,
        "undo: {}  redo: {}",
        if graph.can_undo { "yes" } else { "no" },
        if graph.can_redo { "yes" } else { "no" }
    )?;
    Ok(())
}

fn print_prompt(studio: &Studio, out: &mut impl Write) -> Result<()> {
    let prompt = studio.snapshot().prompt;
    writeln!(out, "Prompt: {}", prompt.text)?;
    if prompt.stale {
        writeln!(out, "(manual prompt differs from the parameters; /auto to reset)")?;
        for line in studio.store().prompt().override_diff().unwrap_or_default() {
            writeln!(out, "  {line}")?;
        }
    }
    Ok(())
}

fn print_session(session: &GenerationSession, out: &mut impl Write) -> Result<()> {
    let (pending, succeeded, failed) = session.counts();
    writeln!(
        out,
        "Generation {:?}: {succeeded} ok, {failed} failed, {pending} pending",
        session.status
    )?;
    for (idx, slot) in session.slots.iter().enumerate() {
        match slot {
            SlotState::Pending => writeln!(out, "  [{idx}] pending")?,
            SlotState::Succeeded { url } => writeln!(out, "  [{idx}] {url}")?,
            SlotState::Failed { error } => writeln!(out, "  [{idx}] failed: {error}")?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn studio(dir: &Path) -> anyhow::Result<Studio> {
        open_studio(&WorkspaceArgs {
            out: dir.to_path_buf(),
            events: None,
            backend: Some("dryrun".to_string()),
        })
    }

    fn run_line(studio: &Studio, line: &str) -> anyhow::Result<(Flow, String)> {
        let mut out = Vec::new();
        let flow = handle_intent(studio, &parse_intent(line), &mut out)?;
        Ok((flow, String::from_utf8(out)?))
    }

    #[test]
    fn quit_and_help() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let studio = studio(temp.path())?;
        assert_eq!(run_line(&studio, "/quit")?.0, Flow::Quit);
        let (flow, text) = run_line(&studio, "/help")?;
        assert_eq!(flow, Flow::Continue);
        assert!(text.contains("/undo"));
        Ok(())
    }

    #[test]
    fn commands_without_image_explain_themselves() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let studio = studio(temp.path())?;
        assert_eq!(run_line(&studio, "/undo")?.1, "Nothing to undo.\n");
        assert_eq!(run_line(&studio, "/bg")?.1, "! Load an image first.\n");
        assert!(run_line(&studio, "/crop 1 2 3")?.1.starts_with("/crop:"));
        assert!(run_line(&studio, "/versions")?.1.contains("No versions."));
        assert!(run_line(&studio, "/magic")?.1.contains("Unknown command /magic"));
        assert!(run_line(&studio, "/save")?.1.starts_with("! "));
        Ok(())
    }

    #[test]
    fn set_and_manual_prompt_flow() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let studio = studio(temp.path())?;
        let (_, text) = run_line(&studio, "/set garment=\"denim jacket\" mood=moody")?;
        assert!(text.contains("denim jacket"));

        run_line(&studio, "a jacket on a bench")?;
        let (_, text) = run_line(&studio, "/set pose=seated")?;
        assert!(text.starts_with("Prompt: a jacket on a bench"));
        assert!(text.contains("/auto"));

        let (_, text) = run_line(&studio, "/auto")?;
        assert!(text.contains("seated"));
        Ok(())
    }

    #[test]
    fn events_land_in_the_out_dir() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        studio(temp.path())?;
        let raw = fs::read_to_string(temp.path().join("events.jsonl"))?;
        assert!(raw.contains("\"studio_started\""));
        Ok(())
    }
}
