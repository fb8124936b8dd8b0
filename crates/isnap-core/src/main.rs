use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use isnap_core::prelude::*;
use isnap_kernel::error::Missing;
use isnap_kernel::test_harness::{run_registry_simulator, RegistrySimConfig, SimulatedArray, SimulatedCatalog};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Exit code for multi-snapshot operations that finished with per-snapshot failures
const PARTIAL_FAILURE_EXIT: i32 = 4;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Snap(#[from] SnapError),

    #[error("{0}")]
    Usage(String),
}

impl CliError {
    fn kind(&self) -> &'static str {
        match self {
            CliError::Snap(e) => e.kind().as_str(),
            CliError::Usage(_) => "config",
        }
    }

    fn exit_code(&self) -> i32 {
        match self {
            CliError::Snap(e) => e.exit_code(),
            CliError::Usage(_) => ErrorKind::Config.exit_code(),
        }
    }
}

/// What a successful command reports
struct Outcome {
    text: String,
    detail: Value,
    partial: bool,
}

impl Outcome {
    fn new(text: impl Into<String>, detail: Value) -> Self {
        Self {
            text: text.into(),
            detail,
            partial: false,
        }
    }
}

fn id_arg(name: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .required(true)
        .value_parser(value_parser!(u64))
        .help("Snapshot id")
}

fn copy_arg(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name).long(name).required(true).help(help)
}

fn cli() -> Command {
    Command::new("isnapctl")
        .version(isnap_core::VERSION)
        .about("IntelliSnap snapshot copy lifecycle")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Configuration file (default: $ISNAP_CONFIG, then ./isnapctl.toml)"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Print results as JSON"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs on stderr as JSON lines"),
        )
        .subcommand(
            Command::new("snapshot")
                .about("Snapshot operations")
                .subcommand_required(true)
                .subcommand(
                    Command::new("create")
                        .about("Run a snapshot backup of a volume onto a copy")
                        .arg(copy_arg("copy", "Copy id or name"))
                        .arg(Arg::new("volume").long("volume").required(true))
                        .arg(
                            Arg::new("level")
                                .long("level")
                                .default_value("full")
                                .value_parser(["full", "incremental", "differential", "synthetic_full"]),
                        )
                        .arg(Arg::new("subclient").long("subclient").default_value("default"))
                        .arg(
                            Arg::new("defer-catalog")
                                .long("defer-catalog")
                                .action(ArgAction::SetTrue)
                                .help("Leave the snapshot CREATED for a later `copy catalog`"),
                        ),
                )
                .subcommand(
                    Command::new("mount")
                        .about("Mount a snapshot on a destination host")
                        .arg(id_arg("id"))
                        .arg(Arg::new("destination").long("destination").required(true))
                        .arg(
                            Arg::new("access")
                                .long("access")
                                .default_value("ro")
                                .value_parser(["ro", "rw"]),
                        ),
                )
                .subcommand(
                    Command::new("unmount")
                        .about("Unmount a snapshot (no-op when not mounted)")
                        .arg(id_arg("id"))
                        .arg(Arg::new("destination").long("destination").required_unless_present("force"))
                        .arg(
                            Arg::new("force")
                                .long("force")
                                .action(ArgAction::SetTrue)
                                .help("Force unmount from every destination"),
                        ),
                )
                .subcommand(
                    Command::new("revert")
                        .about("Revert the source volume to a snapshot")
                        .arg(id_arg("id")),
                )
                .subcommand(
                    Command::new("delete")
                        .about("Delete a snapshot and verify its removal")
                        .arg(id_arg("id"))
                        .arg(
                            Arg::new("force")
                                .long("force")
                                .action(ArgAction::SetTrue)
                                .help("Force unmount first, then delete with force"),
                        ),
                )
                .subcommand(
                    Command::new("list")
                        .about("List snapshots")
                        .arg(Arg::new("copy").long("copy").help("Copy id or name")),
                )
                .subcommand(
                    Command::new("status")
                        .about("Show a snapshot and its mount points")
                        .arg(id_arg("id")),
                )
                .subcommand(
                    Command::new("reconcile")
                        .about("Retire registry entries whose array snapshot is gone")
                        .arg(copy_arg("copy", "Copy id or name")),
                ),
        )
        .subcommand(
            Command::new("copy")
                .about("Copy operations")
                .subcommand_required(true)
                .subcommand(
                    Command::new("aux-copy")
                        .about("Replicate snapshots to a vault or aux copy")
                        .arg(copy_arg("source", "Source copy id or name"))
                        .arg(copy_arg("destination", "Destination copy id or name"))
                        .arg(Arg::new("scale-out").long("scale-out").action(ArgAction::SetTrue)),
                )
                .subcommand(
                    Command::new("backup-copy")
                        .about("Materialize snapshots into the policy's backup copy")
                        .arg(Arg::new("policy").long("policy").required(true))
                        .arg(Arg::new("source").long("source").help("Source copy id or name")),
                )
                .subcommand(
                    Command::new("catalog")
                        .about("Catalog every CREATED snapshot of a copy")
                        .arg(copy_arg("copy", "Copy id or name")),
                )
                .subcommand(
                    Command::new("resolve")
                        .about("Pick the copy a restore reads from")
                        .arg(Arg::new("policy").long("policy").required(true))
                        .arg(Arg::new("preferred").long("preferred").help("Preferred copy id or name"))
                        .arg(Arg::new("as-of").long("as-of").help("RFC 3339 point in time")),
                ),
        )
        .subcommand(
            Command::new("aging").about("Data aging").subcommand_required(true).subcommand(
                Command::new("run")
                    .about("Run one data aging pass")
                    .arg(Arg::new("policy").long("policy").conflicts_with("copy"))
                    .arg(Arg::new("copy").long("copy")),
            ),
        )
        .subcommand(
            Command::new("audit")
                .about("Audit trail")
                .subcommand_required(true)
                .subcommand(Command::new("verify").about("Verify the transition hash chain")),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run the seeded registry simulator")
                .arg(
                    Arg::new("operations")
                        .long("operations")
                        .default_value("2000")
                        .value_parser(value_parser!(u64)),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64)),
                )
                .arg(
                    Arg::new("volumes")
                        .long("volumes")
                        .default_value("3")
                        .value_parser(value_parser!(usize)),
                ),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a String, CliError> {
    args.get_one::<String>(name)
        .ok_or_else(|| CliError::Usage(format!("--{name} is required")))
}

fn snapshot_id(args: &ArgMatches) -> Result<SnapshotId, CliError> {
    args.get_one::<u64>("id")
        .map(|id| SnapshotId(*id))
        .ok_or_else(|| CliError::Usage("--id is required".into()))
}

/// A copy given by numeric id or by (case-insensitive) name.
fn copy_ref(registry: &SnapshotRegistry, value: &str) -> Result<CopyId, CliError> {
    if let Ok(id) = value.parse::<u32>() {
        return Ok(registry.copy(CopyId(id))?.id);
    }
    let matches: Vec<CopyId> = registry
        .policies()
        .iter()
        .filter_map(|p| p.copy_by_name(value).map(|c| c.id))
        .collect();
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => Err(SnapError::NotFound(Missing::CopyName(value.to_string())).into()),
        _ => Err(CliError::Usage(format!(
            "copy name '{value}' is ambiguous; use the copy id"
        ))),
    }
}

fn policy_ref(registry: &SnapshotRegistry, value: &str) -> Result<StoragePolicyId, CliError> {
    match value.parse::<u32>() {
        Ok(id) => Ok(registry.policy(StoragePolicyId(id))?.id),
        Err(_) => Ok(registry.policy_by_name(value)?.id),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, CliError> {
    serde_json::to_value(value).map_err(|e| CliError::Snap(e.into()))
}

fn parse_level(value: &str) -> BackupLevel {
    match value {
        "incremental" => BackupLevel::Incremental,
        "differential" => BackupLevel::Differential,
        "synthetic_full" => BackupLevel::SyntheticFull,
        _ => BackupLevel::Full,
    }
}

async fn snapshot_command(
    lifecycle: &SnapLifecycle,
    ctx: &OperationContext,
    matches: &ArgMatches,
) -> Result<Outcome, CliError> {
    let registry = lifecycle.registry();
    match matches.subcommand() {
        Some(("create", args)) => {
            let copy = copy_ref(registry, required(args, "copy")?)?;
            let mut request = BackupRequest::new(copy, required(args, "volume")?.as_str())
                .with_level(parse_level(required(args, "level")?))
                .with_subclient(required(args, "subclient")?.as_str());
            if args.get_flag("defer-catalog") {
                request = request.deferred();
            }
            let snap = lifecycle.snap_backup(ctx, &request).await?;
            Ok(Outcome::new(
                format!("snapshot {} ({}) on copy {}", snap.id, snap.state, snap.copy),
                to_json(&snap)?,
            ))
        }
        Some(("mount", args)) => {
            let id = snapshot_id(args)?;
            let destination = Destination::new(required(args, "destination")?.as_str());
            let access = match required(args, "access")?.as_str() {
                "rw" => AccessMode::ReadWrite,
                _ => AccessMode::ReadOnly,
            };
            let mount = lifecycle.mount(ctx, id, &destination, access).await?;
            Ok(Outcome::new(
                format!("snapshot {id} mounted on {destination} at {}", mount.mount_path),
                to_json(&mount)?,
            ))
        }
        Some(("unmount", args)) => {
            let id = snapshot_id(args)?;
            if args.get_flag("force") {
                let count = lifecycle.force_unmount(ctx, id).await?;
                return Ok(Outcome::new(
                    format!("snapshot {id} force unmounted from {count} destination(s)"),
                    json!({ "snapshot": id, "unmounted": count }),
                ));
            }
            let destination = Destination::new(required(args, "destination")?.as_str());
            let snap = lifecycle.unmount(ctx, id, &destination).await?;
            let text = match &snap {
                Some(s) => format!("snapshot {id} unmounted from {destination} ({})", s.state),
                None => format!("snapshot {id} was not mounted on {destination}"),
            };
            Ok(Outcome::new(text, to_json(&snap)?))
        }
        Some(("revert", args)) => {
            let id = snapshot_id(args)?;
            let outcome = lifecycle.revert(ctx, id).await?;
            Ok(Outcome::new(
                format!(
                    "volume reverted to snapshot {id}; {} later snapshot(s) now STALE",
                    outcome.invalidated.len()
                ),
                json!({ "reverted": outcome.reverted, "invalidated": outcome.invalidated }),
            ))
        }
        Some(("delete", args)) => {
            let id = snapshot_id(args)?;
            let snap = if args.get_flag("force") {
                lifecycle.force_delete(ctx, id).await?
            } else {
                lifecycle.delete(ctx, id).await?
            };
            Ok(Outcome::new(format!("snapshot {id} {}", snap.state), to_json(&snap)?))
        }
        Some(("list", args)) => {
            let snapshots = match args.get_one::<String>("copy") {
                Some(copy) => registry.list_by_copy(copy_ref(registry, copy)?),
                None => registry.list_all(),
            };
            let text = snapshots
                .iter()
                .map(|s| {
                    format!(
                        "{:>6}  copy {:<4} job {:<6} {:<10} {}  {}",
                        s.id.to_string(),
                        s.copy.to_string(),
                        s.job.to_string(),
                        s.state.to_string(),
                        s.point_in_time.to_rfc3339(),
                        s.volume
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            Ok(Outcome::new(text, to_json(&snapshots)?))
        }
        Some(("status", args)) => {
            let id = snapshot_id(args)?;
            let snap = registry.get(id)?;
            let mounts = lifecycle.mount_status(id)?;
            let mut text = format!("snapshot {id}: {}", snap.state);
            for m in &mounts {
                text.push_str(&format!("\n  {} {} {:?} {:?}", m.destination, m.mount_path, m.access, m.lease));
            }
            Ok(Outcome::new(text, json!({ "snapshot": snap, "mounts": mounts })))
        }
        Some(("reconcile", args)) => {
            let copy = copy_ref(registry, required(args, "copy")?)?;
            let report = lifecycle.reconcile(ctx, copy).await?;
            let mut outcome = Outcome::new(
                format!(
                    "checked {} snapshot(s), retired {}, {} busy, {} failed",
                    report.checked,
                    report.retired.len(),
                    report.busy.len(),
                    report.failed.len()
                ),
                to_json(&report)?,
            );
            outcome.partial = !report.failed.is_empty();
            Ok(outcome)
        }
        _ => Err(CliError::Usage("unknown snapshot command".into())),
    }
}

fn copy_outcome(verb: &str, report: &CopyReport) -> Result<Outcome, CliError> {
    let mut outcome = Outcome::new(
        format!(
            "{verb} {} -> {}: {} copied, {} skipped, {} failed",
            report.source_copy,
            report.destination_copy,
            report.copied.len(),
            report.skipped,
            report.failed.len()
        ),
        to_json(report)?,
    );
    outcome.partial = !report.is_clean();
    Ok(outcome)
}

async fn copy_command(
    lifecycle: &SnapLifecycle,
    ctx: &OperationContext,
    matches: &ArgMatches,
) -> Result<Outcome, CliError> {
    let registry = lifecycle.registry();
    match matches.subcommand() {
        Some(("aux-copy", args)) => {
            let source = copy_ref(registry, required(args, "source")?)?;
            let destination = copy_ref(registry, required(args, "destination")?)?;
            let report = lifecycle
                .aux_copy(ctx, source, destination, args.get_flag("scale-out"))
                .await?;
            copy_outcome("aux copy", &report)
        }
        Some(("backup-copy", args)) => {
            let policy = policy_ref(registry, required(args, "policy")?)?;
            let source = args
                .get_one::<String>("source")
                .map(|s| copy_ref(registry, s))
                .transpose()?;
            let report = lifecycle.backup_copy(ctx, policy, source).await?;
            copy_outcome("backup copy", &report)
        }
        Some(("catalog", args)) => {
            let copy = copy_ref(registry, required(args, "copy")?)?;
            let cataloged = lifecycle.catalog_pending(ctx, copy).await?;
            let ids: Vec<SnapshotId> = cataloged.iter().map(|s| s.id).collect();
            Ok(Outcome::new(
                format!("cataloged {} snapshot(s) on copy {copy}", ids.len()),
                json!({ "copy": copy, "cataloged": ids }),
            ))
        }
        Some(("resolve", args)) => {
            let policy = policy_ref(registry, required(args, "policy")?)?;
            let preferred = args
                .get_one::<String>("preferred")
                .map(|s| copy_ref(registry, s))
                .transpose()?;
            let as_of = args
                .get_one::<String>("as-of")
                .map(|s| {
                    chrono::DateTime::parse_from_rfc3339(s)
                        .map(|t| t.with_timezone(&chrono::Utc))
                        .map_err(|e| CliError::Usage(format!("--as-of: {e}")))
                })
                .transpose()?;
            let ordered = lifecycle.resolve(policy, as_of)?;
            let chosen = lifecycle.resolve_for_restore(policy, preferred, as_of)?;
            Ok(Outcome::new(
                format!("restore from copy {chosen}"),
                json!({ "policy": policy, "copy": chosen, "eligible": ordered }),
            ))
        }
        _ => Err(CliError::Usage("unknown copy command".into())),
    }
}

async fn run(matches: &ArgMatches, correlation: &mut Option<uuid::Uuid>) -> Result<Outcome, CliError> {
    if let Some(("simulate", args)) = matches.subcommand() {
        let config = RegistrySimConfig {
            seed: args.get_one::<u64>("seed").copied().unwrap_or(42),
            total_operations: args.get_one::<u64>("operations").copied().unwrap_or(2_000),
            volumes: args.get_one::<usize>("volumes").copied().unwrap_or(3),
            stop_on_first_violation: true,
        };
        let report = run_registry_simulator(config);
        let passed = report.passed();
        let mut outcome = Outcome::new(
            report.generate_text(),
            json!({ "passed": passed, "violations": report.violations.len() }),
        );
        outcome.partial = !passed;
        return Ok(outcome);
    }

    let config = LifecycleConfig::discover(matches.get_one::<PathBuf>("config").map(PathBuf::as_path))?;
    // The vendor control plane is not linked in; the simulated array stands in.
    let array: Arc<dyn ArrayClient> = Arc::new(SimulatedArray::new());
    let catalog: Arc<dyn CatalogService> = Arc::new(SimulatedCatalog::new());
    let lifecycle = SnapLifecycle::open(config, array, catalog)?;
    let ctx = lifecycle.context();
    *correlation = Some(ctx.correlation);

    match matches.subcommand() {
        Some(("snapshot", args)) => snapshot_command(&lifecycle, &ctx, args).await,
        Some(("copy", args)) => copy_command(&lifecycle, &ctx, args).await,
        Some(("aging", args)) => {
            let Some(("run", args)) = args.subcommand() else {
                return Err(CliError::Usage("unknown aging command".into()));
            };
            let registry = lifecycle.registry();
            let scope = if let Some(policy) = args.get_one::<String>("policy") {
                AgingScope::Policy(policy_ref(registry, policy)?)
            } else if let Some(copy) = args.get_one::<String>("copy") {
                AgingScope::Copy(copy_ref(registry, copy)?)
            } else {
                AgingScope::All
            };
            let report = lifecycle.run_aging(&ctx, scope).await?;
            let mut outcome = Outcome::new(
                format!(
                    "aging: {} examined, {} deleted, {} blocked, {} failed",
                    report.examined,
                    report.deleted.len(),
                    report.blocked.len(),
                    report.failed.len()
                ),
                to_json(&report)?,
            );
            outcome.partial = !report.failed.is_empty();
            Ok(outcome)
        }
        Some(("audit", _)) => {
            let records = lifecycle.verify_audit()?;
            Ok(Outcome::new(
                format!("audit trail intact: {records} record(s)"),
                json!({ "records": records }),
            ))
        }
        _ => Err(CliError::Usage("unknown command".into())),
    }
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));
    let json_output = matches.get_flag("json");

    let mut correlation = None;
    match run(&matches, &mut correlation).await {
        Ok(outcome) => {
            let job_id = correlation.map(|c| c.to_string());
            let status = if outcome.partial { "partial" } else { "ok" };
            if json_output {
                println!(
                    "{}",
                    json!({ "status": status, "job_id": job_id, "result": outcome.detail })
                );
            } else {
                if let Some(job_id) = &job_id {
                    println!("job {job_id}");
                }
                println!("{}", outcome.text);
            }
            std::process::exit(if outcome.partial { PARTIAL_FAILURE_EXIT } else { 0 });
        }
        Err(err) => {
            tracing::error!(kind = err.kind(), error = %err, "Command failed");
            eprintln!(
                "{}",
                json!({ "status": "error", "kind": err.kind(), "reason": err.to_string() })
            );
            std::process::exit(err.exit_code());
        }
    }
}
