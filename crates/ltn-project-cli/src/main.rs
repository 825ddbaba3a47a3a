use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ltn_project_core::{AppFocus, ProjectDocument, ProjectId, LATEST_SCHEMA_VERSION};
use ltn_project_store::{Database, ProjectStorage, SkippedEntry, StoreConfig};
use ltn_store_sqlite::SqliteBackend;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ltnp")]
#[command(about = "LTN project store CLI")]
struct Cli {
    #[arg(long, default_value = "./ltn_projects.sqlite3")]
    db: PathBuf,

    /// Key namespace inside the database.
    #[arg(long, default_value = ltn_project_store::DEFAULT_ROOT)]
    root: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Project {
        #[command(subcommand)]
        command: Box<ProjectCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum ProjectCommand {
    /// List projects grouped by study area.
    List(FocusArgs),
    Show(ProjectRefArgs),
    Create(ProjectCreateArgs),
    /// Import a GeoJSON FeatureCollection as a new project.
    Import(ProjectImportArgs),
    Rename(ProjectRenameArgs),
    Copy(ProjectRenameArgs),
    Remove(ProjectRefArgs),
    NextName(ProjectNextNameArgs),
    NextNeighbourhoodName(ProjectRefArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FocusArg {
    Global,
    Cnt,
    England,
}

impl From<FocusArg> for AppFocus {
    fn from(value: FocusArg) -> Self {
        match value {
            FocusArg::Global => Self::Global,
            FocusArg::Cnt => Self::Cnt,
            FocusArg::England => Self::England,
        }
    }
}

#[derive(Debug, Args)]
struct FocusArgs {
    #[arg(long, value_enum)]
    focus: FocusArg,
}

#[derive(Debug, Args)]
struct ProjectRefArgs {
    #[arg(long, value_enum)]
    focus: FocusArg,

    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct ProjectCreateArgs {
    #[arg(long, value_enum)]
    focus: FocusArg,

    #[arg(long)]
    name: String,

    #[arg(long)]
    study_area: Option<String>,
}

#[derive(Debug, Args)]
struct ProjectImportArgs {
    #[arg(long, value_enum)]
    focus: FocusArg,

    #[arg(long)]
    file: PathBuf,

    /// Defaults to the file's `project_name`, then to the file stem.
    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    study_area: Option<String>,
}

#[derive(Debug, Args)]
struct ProjectRenameArgs {
    #[arg(long, value_enum)]
    focus: FocusArg,

    #[arg(long)]
    id: String,

    #[arg(long)]
    name: String,
}

#[derive(Debug, Args)]
struct ProjectNextNameArgs {
    #[arg(long, value_enum)]
    focus: FocusArg,

    #[arg(long)]
    name: String,
}

/// Every stdout document carries the contract version next to the command's
/// own fields. Payloads must serialize as JSON objects.
#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    contract_version: &'static str,
    #[serde(flatten)]
    payload: &'a T,
}

fn emit_json<T: Serialize>(payload: &T) -> Result<()> {
    let envelope = Envelope { contract_version: CLI_CONTRACT_VERSION, payload };
    let rendered =
        serde_json::to_string_pretty(&envelope).context("failed to render command output")?;
    println!("{rendered}");
    Ok(())
}

#[derive(Serialize)]
struct MigrateOutput<'a> {
    dry_run: bool,
    before_version: u32,
    applied_versions: &'a [u32],
    after_version: u32,
    target_version: u32,
    up_to_date: bool,
    migrated_legacy_projects: usize,
    resumed_legacy_projects: usize,
    stamped_projects: usize,
    skipped: &'a [SkippedEntry],
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn open_database(db: &Path, root: &str) -> Result<Database<SqliteBackend>> {
    let config = StoreConfig::new(root)?;
    let backend = SqliteBackend::open(db)?;
    debug!(db = %db.display(), root, "opened project database");
    Ok(Database::with_config(backend, config))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let database = open_database(&cli.db, &cli.root)?;
    match cli.command {
        Command::Db { command } => run_db(command, &database),
        Command::Project { command } => run_project(*command, &database),
    }
}

fn run_db(command: DbCommand, database: &Database<SqliteBackend>) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(database),
        DbCommand::Migrate(args) => run_db_migrate(&args, database),
    }
}

fn run_db_schema_version(database: &Database<SqliteBackend>) -> Result<()> {
    let status = database.schema_status()?;
    emit_json(&json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty()
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, database: &Database<SqliteBackend>) -> Result<()> {
    let before = database.schema_status()?;
    if args.dry_run {
        emit_json(&json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }))?;
        return Ok(());
    }

    let report = database.ensure_migrated()?;
    let after = database.schema_status()?;
    emit_json(&MigrateOutput {
        dry_run: false,
        before_version: report.starting_version,
        applied_versions: &report.applied_versions,
        after_version: after.current_version,
        target_version: after.target_version,
        up_to_date: after.pending_versions.is_empty(),
        migrated_legacy_projects: report.migrated_legacy_projects,
        resumed_legacy_projects: report.resumed_legacy_projects,
        stamped_projects: report.stamped_projects,
        skipped: &report.skipped,
    })
}

fn storage(
    database: &Database<SqliteBackend>,
    focus: FocusArg,
) -> Result<ProjectStorage<SqliteBackend>> {
    Ok(database.project_storage(focus.into())?)
}

fn parse_id(raw: &str) -> Result<ProjectId> {
    ProjectId::parse(raw).with_context(|| format!("invalid project id {raw:?}"))
}

fn run_project(command: ProjectCommand, database: &Database<SqliteBackend>) -> Result<()> {
    match command {
        ProjectCommand::List(args) => {
            let storage = storage(database, args.focus)?;
            emit_json(&json!({
                "app_focus": storage.app_focus(),
                "groups": storage.study_area_projects()?
            }))
        }
        ProjectCommand::Show(args) => {
            let storage = storage(database, args.focus)?;
            let id = parse_id(&args.id)?;
            emit_json(&json!({ "id": id, "project": storage.project(&id)? }))
        }
        ProjectCommand::Create(args) => {
            let storage = storage(database, args.focus)?;
            let id = storage.create_empty_project(&args.name, args.study_area.as_deref())?;
            emit_json(&json!({ "id": id, "project_name": args.name }))
        }
        ProjectCommand::Import(args) => run_project_import(&args, database),
        ProjectCommand::Rename(args) => {
            let storage = storage(database, args.focus)?;
            let id = parse_id(&args.id)?;
            storage.rename_project(&id, &args.name)?;
            emit_json(&json!({ "id": id, "project_name": args.name }))
        }
        ProjectCommand::Copy(args) => {
            let storage = storage(database, args.focus)?;
            let source = parse_id(&args.id)?;
            let id = storage.copy_project(&source, &args.name)?;
            emit_json(&json!({ "id": id, "source_id": source, "project_name": args.name }))
        }
        ProjectCommand::Remove(args) => {
            let storage = storage(database, args.focus)?;
            let id = parse_id(&args.id)?;
            storage.remove_project(&id)?;
            emit_json(&json!({ "id": id, "removed": true }))
        }
        ProjectCommand::NextName(args) => {
            let storage = storage(database, args.focus)?;
            emit_json(&json!({ "project_name": storage.next_available_project_name(&args.name)? }))
        }
        ProjectCommand::NextNeighbourhoodName(args) => {
            let storage = storage(database, args.focus)?;
            let id = parse_id(&args.id)?;
            emit_json(&json!({
                "id": id,
                "neighbourhood_name": storage.next_available_neighbourhood_name(&id)?
            }))
        }
    }
}

/// Imported files are plain GeoJSON, possibly exported by an older release,
/// so store-owned metadata is filled in here and the name is de-duplicated.
fn run_project_import(args: &ProjectImportArgs, database: &Database<SqliteBackend>) -> Result<()> {
    let storage = storage(database, args.focus)?;
    let body = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read project file {}", args.file.display()))?;
    let Value::Object(mut object) = serde_json::from_str::<Value>(&body)
        .with_context(|| format!("project file {} is not valid JSON", args.file.display()))?
    else {
        return Err(anyhow!("project file {} must hold a JSON object", args.file.display()));
    };

    let base_name = match (&args.name, object.get("project_name").and_then(Value::as_str)) {
        (Some(name), _) => name.clone(),
        (None, Some(name)) if !name.trim().is_empty() => name.to_string(),
        _ => args
            .file
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("cannot derive a project name from {}", args.file.display()))?,
    };
    let project_name = storage.next_available_project_name(&base_name)?;

    object.insert("project_name".to_string(), Value::String(project_name.clone()));
    object.insert("app_focus".to_string(), json!(storage.app_focus()));
    object.insert("db_schema_version".to_string(), json!(LATEST_SCHEMA_VERSION));
    if let Some(study_area) = &args.study_area {
        object.insert("study_area_name".to_string(), Value::String(study_area.clone()));
    }

    let document = ProjectDocument::from_json(&Value::Object(object).to_string())
        .with_context(|| format!("project file {} is not a FeatureCollection", args.file.display()))?;
    let id = storage.create_project(document)?;
    emit_json(&json!({ "id": id, "project_name": project_name }))
}
