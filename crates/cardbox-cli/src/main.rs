use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cardbox_core::{FieldEdits, RecordController};
use cardbox_store_sqlite::SqliteMirror;
use cardbox_vcf::VcfEngine;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

type Controller = RecordController<VcfEngine, SqliteMirror>;

#[derive(Debug, Parser)]
#[command(name = "cardbox")]
#[command(about = "vCard directory manager with a relational mirror")]
struct Cli {
    #[arg(long, default_value = "./cardbox.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value = "./cards")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Scan,
    Show(ShowArgs),
    Create(CreateArgs),
    Update(UpdateArgs),
    Contacts,
    JuneBirthdays,
}

#[derive(Debug, Args)]
struct ShowArgs {
    filename: String,
}

#[derive(Debug, Args)]
struct CreateArgs {
    filename: String,
    #[arg(long)]
    name: String,
}

#[derive(Debug, Args)]
struct UpdateArgs {
    filename: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    birthday: Option<String>,
    #[arg(long)]
    anniversary: Option<String>,
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let store = SqliteMirror::open(&cli.db)
        .with_context(|| format!("failed to open mirror database {}", cli.db.display()))?;

    match cli.command {
        Command::Scan => run_scan(store, &cli.dir),
        Command::Show(args) => run_show(&args, store, &cli.dir),
        Command::Create(args) => run_create(&args, store, &cli.dir),
        Command::Update(args) => run_update(args, store, &cli.dir),
        Command::Contacts => run_contacts(store),
        Command::JuneBirthdays => run_june_birthdays(store),
    }
}

fn run_scan(store: SqliteMirror, dir: &Path) -> Result<()> {
    let mut controller = RecordController::new(VcfEngine, store, dir);
    let files = controller.scan_and_sync()?;
    emit_json(serde_json::to_value(&files)?)?;
    close(controller)
}

fn run_show(args: &ShowArgs, store: SqliteMirror, dir: &Path) -> Result<()> {
    let mut controller = RecordController::new(VcfEngine, store, dir);
    let record = controller.load_record(&args.filename)?;
    emit_json(serde_json::to_value(&record)?)?;
    close(controller)
}

fn run_create(args: &CreateArgs, store: SqliteMirror, dir: &Path) -> Result<()> {
    let mut controller = RecordController::new(VcfEngine, store, dir);
    let record = controller.create_record(&args.filename, &args.name)?;
    emit_json(serde_json::to_value(&record)?)?;
    close(controller)
}

fn run_update(args: UpdateArgs, store: SqliteMirror, dir: &Path) -> Result<()> {
    let mut controller = RecordController::new(VcfEngine, store, dir);
    let loaded = controller.load_record(&args.filename)?;

    // An omitted flag keeps the loaded value; an empty one clears the field.
    let edits = FieldEdits {
        display_name: args.name.unwrap_or_default(),
        birthday: args.birthday.unwrap_or(loaded.birthday),
        anniversary: args.anniversary.unwrap_or(loaded.anniversary),
    };
    let record = controller.update_record(&args.filename, &edits)?;
    emit_json(serde_json::to_value(&record)?)?;
    close(controller)
}

fn run_contacts(store: SqliteMirror) -> Result<()> {
    for row in store.all_contacts()? {
        println!("{row}");
    }
    store.close().context("failed to close the mirror database")
}

fn run_june_birthdays(store: SqliteMirror) -> Result<()> {
    for row in store.june_birthdays()? {
        println!("{row}");
    }
    store.close().context("failed to close the mirror database")
}

fn close(controller: Controller) -> Result<()> {
    controller
        .shutdown()
        .close()
        .context("failed to close the mirror database")
}
