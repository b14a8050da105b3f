// SPDX-License-Identifier: MIT

use siteherd::{
    context::{Context, Mode},
    discover::discover,
    interrupt,
    ports::PortRegistry,
    sync::{
        repo::RepoError, BatchReport, Orchestrator, Outcome, SiteBranchAction, SyncError,
        SyncGroup, SyncHealth, SyncState,
    },
};

use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::ProgressBar;
use inquire::Confirm;
use std::{path::PathBuf, process::exit, time::Duration};
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  siteherd [options] <siteherd-command>\n  siteherd [options] ports <port-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Override mode detection.
    #[arg(long, global = true, value_enum, value_name = "mode")]
    pub mode: Option<Mode>,

    /// Override ecosystem root resolution.
    #[arg(long, global = true, value_name = "path")]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<i32> {
        let mode = Mode::detect(self.mode);
        let ctx = match &self.root {
            Some(root) => Context::with_root(root, mode),
            None => Context::resolve(self.mode),
        };

        let repos = discover(&ctx);
        let orchestrator: Orchestrator = Orchestrator::with_ecosystem(&ctx, repos);

        match self.command {
            Command::Status(opts) => run_status(&orchestrator, opts),
            Command::SyncHealth => run_sync_health(&orchestrator),
            Command::Branch(opts) => run_branch(&orchestrator, opts),
            Command::Commit(opts) => run_commit(&orchestrator, opts),
            Command::Push(opts) => run_push(&orchestrator, opts),
            Command::Pull(opts) => run_pull(&orchestrator, opts),
            Command::MergeToMain(opts) => run_merge_to_main(&orchestrator, opts),
            Command::Rebase(opts) => run_rebase(&orchestrator, opts),
            Command::SiteBranch(opts) => run_site_branch(&orchestrator, opts),
            Command::InitRepo(opts) => run_init_repo(&ctx, &orchestrator, opts),
            Command::Reset(opts) => run_reset(&orchestrator, opts),
            Command::Debug => run_debug(&ctx, &orchestrator),
            Command::Ports(command) => run_ports(&ctx, &orchestrator, command),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Per-repository branch, hash, change counts, and sync state.
    Status(StatusOptions),

    /// Compare every output repository against current engine state.
    SyncHealth,

    /// Switch, create, delete, or list engine-group branches.
    #[command(override_usage = "siteherd branch [options] [name]")]
    Branch(BranchOptions),

    /// Grouped commit: engine, then output, then content.
    #[command(override_usage = "siteherd commit [options] -m <msg>")]
    Commit(CommitOptions),

    /// Grouped push against each repository's required branch.
    Push(PushOptions),

    /// Grouped pull against each repository's required branch.
    Pull(PullOptions),

    /// Merge each engine repository's current branch into main.
    MergeToMain(MergeToMainOptions),

    /// Rebase engine repositories onto a target branch.
    Rebase(RebaseOptions),

    /// Manage the site branch across project repositories.
    SiteBranch(SiteBranchOptions),

    /// Initialize a fresh repository under the ecosystem root.
    #[command(override_usage = "siteherd init-repo <name>")]
    InitRepo(InitRepoOptions),

    /// Reset engine-group working trees.
    Reset(ResetOptions),

    /// Dump resolved context, discovered repositories, and port registry.
    Debug,

    /// Local preview port lifecycle.
    #[command(subcommand)]
    Ports(PortCommand),
}

#[derive(Parser, Clone, Debug)]
struct StatusOptions {
    /// One line per repository.
    #[arg(short, long, conflicts_with = "verbose")]
    pub short: bool,

    /// Include sync reference details.
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Parser, Clone, Debug)]
struct BranchOptions {
    #[arg(value_name = "name", required_unless_present = "list")]
    pub name: Option<String>,

    /// Create the branch if it does not exist.
    #[arg(short, long, conflicts_with_all = ["delete", "list"])]
    pub create: bool,

    /// Delete the branch instead of switching to it.
    #[arg(short, long, conflicts_with = "list")]
    pub delete: bool,

    /// List local branches of every engine repository.
    #[arg(short, long)]
    pub list: bool,
}

#[derive(Parser, Clone, Debug)]
struct CommitOptions {
    #[arg(short, long, value_name = "msg")]
    pub message: String,

    /// Amend the previous commit instead of creating a new one.
    #[arg(long)]
    pub amend: bool,
}

#[derive(Parser, Clone, Debug)]
struct PushOptions {
    /// Branch for engine and content repositories. Output repositories
    /// always push their required branch.
    #[arg(value_name = "branch")]
    pub branch: Option<String>,

    /// Force push. Always refused for protected branches.
    #[arg(short, long)]
    pub force: bool,

    /// Set the upstream tracking reference while pushing.
    #[arg(short = 'u', long)]
    pub set_upstream: bool,
}

#[derive(Parser, Clone, Debug)]
struct PullOptions {
    /// Branch for engine and content repositories. Output repositories
    /// always pull their required branch.
    #[arg(value_name = "branch")]
    pub branch: Option<String>,

    /// Rebase instead of merge.
    #[arg(short, long)]
    pub rebase: bool,
}

#[derive(Parser, Clone, Debug)]
struct MergeToMainOptions {
    /// Fast-forward only.
    #[arg(long)]
    pub fasttrack: bool,
}

#[derive(Parser, Clone, Debug)]
struct RebaseOptions {
    #[arg(value_name = "target", default_value = "main")]
    pub target: String,
}

#[derive(Parser, Clone, Debug)]
struct SiteBranchOptions {
    #[arg(value_enum, value_name = "action")]
    pub action: SiteBranchAction,
}

#[derive(Parser, Clone, Debug)]
struct InitRepoOptions {
    #[arg(value_name = "name")]
    pub name: String,
}

#[derive(Parser, Clone, Debug)]
struct ResetOptions {
    /// Discard working tree changes too. Asks for confirmation.
    #[arg(long)]
    pub hard: bool,
}

#[derive(Debug, Clone, Subcommand)]
enum PortCommand {
    /// Allocate a preview port for a domain.
    Allocate {
        #[arg(value_name = "domain")]
        domain: String,

        /// Replace a live allocation, terminating its owner.
        #[arg(short, long)]
        force: bool,
    },

    /// Release a domain's allocation.
    Release {
        #[arg(value_name = "domain")]
        domain: String,

        /// Terminate the owning process as well.
        #[arg(short, long)]
        kill: bool,
    },

    /// Show live allocations.
    List,

    /// Release every allocation, terminating the owners.
    Killall,

    /// Allocation status for one domain, or all.
    Status {
        #[arg(value_name = "domain")]
        domain: Option<String>,
    },

    /// Remove stale registry entries.
    Cleanup,
}

fn main() {
    let layer = fmt::layer().compact();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry().with(layer).with(filter).init();
    interrupt::install();

    match run() {
        Ok(code) => exit(code),
        Err(error) => {
            error!("{error:?}");
            exit(exit_code_for(&error));
        }
    }
}

fn run() -> Result<i32> {
    Cli::parse().run()
}

/// Map hard failures onto the documented exit codes.
///
/// 1 general, 2 invalid branch/command, 3 repository sync issue, 4 merge
/// conflict, 5 protected-branch violation.
fn exit_code_for(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<SyncError>() {
        Some(SyncError::InvalidBranch { .. } | SyncError::UnknownRepository { .. }) => 2,
        Some(SyncError::ProtectedBranch { .. }) => 5,
        Some(SyncError::Repo(RepoError::MergeConflict { .. })) => 4,
        _ => 1,
    }
}

/// Print per-repository outcome lines and the aggregate summary, and fold
/// the batch into an exit code.
fn report_batch(verb: &str, report: &BatchReport) -> i32 {
    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(Outcome::Done(detail)) => println!("  {}: {detail}", outcome.identifier),
            Ok(Outcome::Skipped(detail)) => println!("  {}: skipped ({detail})", outcome.identifier),
            Err(error) => println!("  {}: FAILED: {error}", outcome.identifier),
        }
    }

    let failed = report.failed();
    if report.is_noop() {
        println!("{verb}: nothing to do");
        0
    } else if failed == 0 {
        println!("{verb}: completed ({} repositories)", report.completed());
        0
    } else {
        println!("{verb}: {failed} of {} repositories failed", report.outcomes.len());
        if report.has_conflict() {
            4
        } else {
            3
        }
    }
}

fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_message(message.to_owned());
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

fn run_status(orchestrator: &Orchestrator, opts: StatusOptions) -> Result<i32> {
    for status in orchestrator.status(&SyncGroup::ALL) {
        let branch = status.branch.as_deref().unwrap_or("-");
        let hash = status.short_hash.as_deref().unwrap_or("-------");

        if opts.short {
            println!("{} {branch}@{hash}", status.identifier);
            continue;
        }

        let dirt = if status.counts.is_clean() {
            "clean".to_owned()
        } else {
            format!(
                "{} modified, {} untracked",
                status.counts.modified, status.counts.untracked
            )
        };
        let sync = match &status.sync {
            Some(SyncState::Synced(reference)) if opts.verbose => {
                format!("  synced [{reference}]")
            }
            Some(SyncState::Synced(_)) => "  synced".to_owned(),
            Some(SyncState::ManualCommit) => "  manual commit".to_owned(),
            Some(SyncState::SyncError) => "  sync error".to_owned(),
            Some(SyncState::Uninitialized) => "  uninitialized".to_owned(),
            None => String::new(),
        };

        println!("{} {branch}@{hash} ({dirt}){sync}", status.identifier);
    }

    Ok(0)
}

fn run_sync_health(orchestrator: &Orchestrator) -> Result<i32> {
    let mut unhealthy = false;
    for line in orchestrator.sync_health() {
        let label = match line.health {
            SyncHealth::InSync => "in sync",
            SyncHealth::Behind => "behind engine",
            SyncHealth::Manual => "manual commit",
            SyncHealth::Broken => "broken sync reference",
            SyncHealth::Uninitialized => "uninitialized",
        };
        unhealthy |= !matches!(line.health, SyncHealth::InSync);
        println!("  {}: {label}", line.identifier);
    }

    Ok(if unhealthy { 3 } else { 0 })
}

fn run_branch(orchestrator: &Orchestrator, opts: BranchOptions) -> Result<i32> {
    if opts.list {
        for (identifier, branches) in orchestrator.list_branches()? {
            println!("{identifier}:");
            for branch in branches {
                println!("  {branch}");
            }
        }
        return Ok(0);
    }

    // Clap guarantees the name is present when not listing.
    let name = opts.name.expect("branch name is required");
    let report = if opts.delete {
        orchestrator.delete_branch(&name)?
    } else {
        orchestrator.branch(&name, opts.create)?
    };

    Ok(report_batch("branch", &report))
}

fn run_commit(orchestrator: &Orchestrator, opts: CommitOptions) -> Result<i32> {
    let report = orchestrator.commit(&opts.message, opts.amend, &SyncGroup::ALL);
    Ok(report_batch("commit", &report))
}

fn run_push(orchestrator: &Orchestrator, opts: PushOptions) -> Result<i32> {
    let bar = spinner("pushing");
    let result = orchestrator.push(
        opts.branch.as_deref(),
        opts.force,
        opts.set_upstream,
        &SyncGroup::ALL,
    );
    bar.finish_and_clear();

    Ok(report_batch("push", &result?))
}

fn run_pull(orchestrator: &Orchestrator, opts: PullOptions) -> Result<i32> {
    let bar = spinner("pulling");
    let report = orchestrator.pull(opts.branch.as_deref(), opts.rebase, &SyncGroup::ALL);
    bar.finish_and_clear();

    Ok(report_batch("pull", &report))
}

fn run_merge_to_main(orchestrator: &Orchestrator, opts: MergeToMainOptions) -> Result<i32> {
    let report = orchestrator.merge_to_main(opts.fasttrack);
    Ok(report_batch("merge-to-main", &report))
}

fn run_rebase(orchestrator: &Orchestrator, opts: RebaseOptions) -> Result<i32> {
    let report = orchestrator.rebase(&opts.target);
    Ok(report_batch("rebase", &report))
}

fn run_site_branch(orchestrator: &Orchestrator, opts: SiteBranchOptions) -> Result<i32> {
    let report = orchestrator.site_branch(opts.action);
    Ok(report_batch("site-branch", &report))
}

fn run_init_repo(ctx: &Context, orchestrator: &Orchestrator, opts: InitRepoOptions) -> Result<i32> {
    let repo = orchestrator.init_repo(ctx.root(), &opts.name)?;
    println!(
        "initialized {} ({:?}) at {}",
        repo.identifier,
        repo.kind,
        repo.resolved_path.display()
    );

    Ok(0)
}

fn run_reset(orchestrator: &Orchestrator, opts: ResetOptions) -> Result<i32> {
    if opts.hard {
        let confirmed = Confirm::new("discard all uncommitted engine changes?")
            .with_default(false)
            .prompt()?;
        if !confirmed {
            println!("reset: aborted");
            return Ok(0);
        }
    }

    let report = orchestrator.reset(opts.hard);
    Ok(report_batch("reset", &report))
}

fn run_debug(ctx: &Context, orchestrator: &Orchestrator) -> Result<i32> {
    println!("root: {}", ctx.root().display());
    println!("mode: {:?}", ctx.mode());
    println!("registry: {}", ctx.registry_path().display());
    println!("repositories:");
    println!("{}", serde_json::to_string_pretty(orchestrator.repos())?);

    let registry = PortRegistry::new(ctx);
    match registry.list() {
        Ok(entries) => {
            println!("allocations:");
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        Err(error) => println!("allocations unavailable: {error}"),
    }

    Ok(0)
}

fn run_ports(ctx: &Context, orchestrator: &Orchestrator, command: PortCommand) -> Result<i32> {
    let registry = PortRegistry::new(ctx);

    match command {
        PortCommand::Allocate { domain, force } => {
            let port = registry.allocate(&domain, orchestrator.repos(), force, "serve")?;
            println!("{domain}: port {port} ({})", ctx.url_for(&domain));
        }
        PortCommand::Release { domain, kill } => {
            let entry = registry.release(&domain, kill)?;
            println!("{domain}: released port {}", entry.port);
        }
        PortCommand::List => {
            let entries = registry.list()?;
            if entries.is_empty() {
                println!("no live allocations");
            }
            for (domain, entry) in entries {
                println!(
                    "{domain}: port {} pid {} since {} ({})",
                    entry.port,
                    entry.pid,
                    entry.started_at.to_rfc3339(),
                    entry.command
                );
            }
        }
        PortCommand::Killall => {
            let released = registry.killall()?;
            println!("released {released} allocations");
        }
        PortCommand::Status { domain } => {
            let entries = registry.list()?;
            match domain {
                Some(domain) => match entries.get(&domain) {
                    Some(entry) => println!("{domain}: running on port {}", entry.port),
                    None => println!("{domain}: not running"),
                },
                None => {
                    for (domain, entry) in entries {
                        println!("{domain}: running on port {}", entry.port);
                    }
                }
            }
        }
        PortCommand::Cleanup => {
            let reclaimed = registry.reclaim()?;
            println!("reclaimed {reclaimed} stale entries");
        }
    }

    Ok(0)
}
