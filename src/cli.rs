use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use ulid::Ulid;

use crate::config::Config;
use crate::engine::Engine;
use crate::hostel::HostelManager;
use crate::listener::ChangeListener;
use crate::model::*;
use crate::store::{MemoryStore, RecordStore};

pub type CliResult<T> = Result<T, Box<dyn Error>>;

#[derive(Debug, Parser)]
#[command(
    name = "roomledger",
    about = "Hostel room allocation with consistent occupancy tracking",
    version
)]
pub struct Cli {
    /// Directory holding the journal. Overrides ROOMLEDGER_DATA_DIR.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Hostel to operate on. Overrides ROOMLEDGER_HOSTEL.
    #[arg(long, global = true)]
    pub hostel: Option<String>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create, list and delete rooms.
    #[command(subcommand)]
    Room(RoomCommand),

    /// Create, list, seat and remove students.
    #[command(subcommand)]
    Student(StudentCommand),

    /// Occupancy of every room plus the student list.
    View,

    /// Hostel totals.
    Summary,

    /// Repair drifted occupancy and over-capacity rooms.
    Reconcile,

    /// Keep auditing every loaded hostel until interrupted.
    Audit,
}

#[derive(Debug, Subcommand)]
pub enum RoomCommand {
    Add { number: String, capacity: u32 },
    List {
        /// Only rooms with a free seat.
        #[arg(long)]
        available: bool,
    },
    Delete { number: String },
}

#[derive(Debug, Subcommand)]
pub enum StudentCommand {
    Add {
        name: String,
        contact: String,
        /// Room number to seat the student in.
        #[arg(long)]
        room: Option<String>,
    },
    List,
    Assign { student: Ulid, room: String },
    /// Move a seated student to another room.
    Move { student: Ulid, room: String },
    Release { student: Ulid },
    Delete { student: Ulid },
}

pub async fn run(cli: Cli, mut config: Config) -> CliResult<()> {
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(hostel) = cli.hostel {
        config.hostel = hostel;
    }
    std::fs::create_dir_all(&config.data_dir)?;
    let store = Arc::new(MemoryStore::open(&config.journal_path(), config.compact_threshold)?);
    let out = Output { json: cli.json };

    if let Commands::Audit = cli.command {
        return audit(store, &config, out).await;
    }

    let hostels = HostelManager::new(store, None);
    let engine = hostels.get_or_create(&config.hostel)?;
    match cli.command {
        Commands::Room(cmd) => room(&engine, cmd, out).await,
        Commands::Student(cmd) => student(&engine, cmd, out).await,
        Commands::View => {
            let rooms = engine.room_occupancy_view().await?;
            let students = engine.list_students().await?;
            if out.json {
                out.json(&serde_json::json!({ "rooms": rooms, "students": students }))
            } else {
                print_rooms(&rooms);
                println!();
                print_students(&students);
                Ok(())
            }
        }
        Commands::Summary => {
            let s = engine.summary().await?;
            out.show(&s, || {
                println!(
                    "{} rooms ({} full), {} students ({} unassigned), {}/{} beds taken",
                    s.rooms, s.full_rooms, s.students, s.unassigned_students, s.total_occupancy, s.total_capacity
                )
            })
        }
        Commands::Reconcile => {
            let report = engine.reconcile().await?;
            out.show(&report, || {
                println!(
                    "{} rooms checked, {} corrected, {} evicted, {} orphans cleared, {} failures",
                    report.rooms_checked,
                    report.rooms_corrected,
                    report.evicted.len(),
                    report.orphans_cleared.len(),
                    report.failures.len()
                );
                for (id, reason) in &report.failures {
                    println!("  {id}: {reason}");
                }
            })
        }
        Commands::Audit => Ok(()),
    }
}

async fn room(engine: &Engine, cmd: RoomCommand, out: Output) -> CliResult<()> {
    match cmd {
        RoomCommand::Add { number, capacity } => {
            let room = engine.create_room(&number, capacity).await?;
            out.show(&room, || println!("room {} created (capacity {}) {}", room.number, room.capacity, room.id))
        }
        RoomCommand::List { available } => {
            let rooms = if available {
                engine.available_rooms().await?
            } else {
                engine.room_occupancy_view().await?
            };
            out.show(&rooms, || print_rooms(&rooms))
        }
        RoomCommand::Delete { number } => {
            let room = resolve_room(engine, &number).await?;
            let deleted = engine.delete_room(room).await?;
            out.show(&deleted, || println!("room {} deleted", deleted.number))
        }
    }
}

async fn student(engine: &Engine, cmd: StudentCommand, out: Output) -> CliResult<()> {
    match cmd {
        StudentCommand::Add { name, contact, room } => {
            let room = match room {
                Some(number) => Some(resolve_room(engine, &number).await?),
                None => None,
            };
            let s = engine.create_student(&name, &contact, room).await?;
            out.show(&s, || println!("student {} created {}", s.name, s.id))
        }
        StudentCommand::List => {
            let students = engine.list_students().await?;
            out.show(&students, || print_students(&students))
        }
        StudentCommand::Assign { student, room } => {
            let room = resolve_room(engine, &room).await?;
            let a = engine.assign(student, room).await?;
            out.show(&a, || print_assignment(&a))
        }
        StudentCommand::Move { student, room } => {
            let room = resolve_room(engine, &room).await?;
            let a = engine.reassign(student, room).await?;
            out.show(&a, || print_assignment(&a))
        }
        StudentCommand::Release { student } => {
            let left = engine.deallocate(student).await?;
            out.show(&left, || match &left {
                Some(room) => println!("released from room {} ({}/{})", room.number, room.occupancy, room.capacity),
                None => println!("student had no room"),
            })
        }
        StudentCommand::Delete { student } => {
            let s = engine.delete_student(student).await?;
            out.show(&s, || println!("student {} deleted", s.name))
        }
    }
}

/// Run auditors for every hostel in the store (and the configured one),
/// printing occupancy of the configured hostel as it changes, until ctrl-c
/// or SIGTERM.
async fn audit(store: Arc<MemoryStore>, config: &Config, out: Output) -> CliResult<()> {
    crate::observability::init(config.metrics_port)?;
    let interval = config
        .audit_interval
        .ok_or("auditing disabled (ROOMLEDGER_AUDIT_INTERVAL_SECS=0)")?;

    let known = store.hostels();
    let shared: Arc<dyn RecordStore> = store;
    let hostels = HostelManager::new(shared, Some(interval));
    for name in &known {
        hostels.get_or_create(name)?;
    }
    let engine = hostels.get_or_create(&config.hostel)?;
    info!("auditing {} hostels every {interval:?}", hostels.hostels().len());

    let mut listener = ChangeListener::start(engine, config.coalesce_window).await?;
    let mut view = listener.subscribe();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        let p = view.borrow_and_update().clone();
        let summary = p.rooms.iter().fold((0u64, 0u64), |(occ, cap), r| {
            (occ + r.occupancy as u64, cap + r.capacity as u64)
        });
        out.show(&p.rooms, || {
            println!(
                "generation {}: {} rooms, {}/{} beds taken, {} students",
                p.generation,
                p.rooms.len(),
                summary.0,
                summary.1,
                p.students.len()
            )
        })?;
        tokio::select! {
            _ = &mut shutdown => break,
            changed = view.changed() => if changed.is_err() { break },
        }
    }

    info!("shutdown signal received, stopping auditors");
    listener.shutdown().await;
    hostels.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

async fn resolve_room(engine: &Engine, number: &str) -> CliResult<Ulid> {
    match engine.find_room_by_number(number).await? {
        Some(room) => Ok(room.id),
        None => Err(format!("no room numbered {number:?} in {}", engine.hostel()).into()),
    }
}

#[derive(Debug, Clone, Copy)]
struct Output {
    json: bool,
}

impl Output {
    fn show<T: Serialize>(&self, value: &T, text: impl FnOnce()) -> CliResult<()> {
        if self.json {
            self.json(value)
        } else {
            text();
            Ok(())
        }
    }

    fn json<T: Serialize>(&self, value: &T) -> CliResult<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

fn print_rooms(rooms: &[RoomOccupancy]) {
    println!("{:<10} {:>9} {:<10} id", "room", "occupancy", "status");
    for r in rooms {
        println!(
            "{:<10} {:>9} {:<10} {}",
            r.number,
            format!("{}/{}", r.occupancy, r.capacity),
            r.status,
            r.room_id
        );
    }
}

fn print_students(students: &[StudentView]) {
    println!("{:<24} {:<16} {:<10} id", "name", "contact", "room");
    for s in students {
        println!(
            "{:<24} {:<16} {:<10} {}",
            s.name,
            s.contact,
            s.room_number.as_deref().unwrap_or("-"),
            s.id
        );
    }
}

fn print_assignment(a: &Assignment) {
    println!(
        "{} seated in room {} ({}/{}, {})",
        a.student.name, a.room.number, a.room.occupancy, a.room.capacity, a.room.status
    );
}
