//! caseio CLI - Case directory inspection and packing
//!
//! This binary provides offline commands for decomposed case directories:
//! resolving object paths, packing and unpacking block containers, and
//! simulating a multi-rank read on threads of one process.

use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use caseio_comm::{Communicator, LocalTransport};
use caseio_common::config::IoStrategy;
use caseio_common::{CaseLayout, Config, ObjectIdentity, Rank};
use caseio_storage::{
    BlockCodec, BlockContainer, CONTAINER_CLASS, PathResolver, ResolveOptions, StoredObject,
    open_store, split_processor_path,
};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "caseio-cli")]
#[command(about = "caseio case directory tool")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "CASEIO_CONFIG")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

/// Where the case lives and how it is split
#[derive(ClapArgs, Debug)]
struct CaseArgs {
    /// Case root directory
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Rank count of a decomposed case; omit for an undecomposed case
    #[arg(long)]
    ranks: Option<u32>,
}

impl CaseArgs {
    fn layout(&self) -> CaseLayout {
        match self.ranks {
            Some(ranks) => CaseLayout::decomposed(&self.root, ranks),
            None => CaseLayout::undecomposed(&self.root),
        }
    }
}

/// Object address within a case
#[derive(ClapArgs, Debug)]
struct ObjectArgs {
    /// Instance label (time, `constant`, `system`) or absolute directory
    instance: String,

    /// Object name
    #[arg(default_value = "")]
    name: String,

    /// Region subdirectory
    #[arg(long, default_value = "")]
    region: String,

    /// Local subpath below the region
    #[arg(long, default_value = "")]
    local: String,
}

impl ObjectArgs {
    fn identity(&self) -> ObjectIdentity {
        ObjectIdentity::new(&self.instance, &self.name)
            .with_region(&self.region)
            .with_local(&self.local)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the path an object resolves to
    Resolve {
        #[command(flatten)]
        case: CaseArgs,
        #[command(flatten)]
        object: ObjectArgs,
        /// Rank doing the lookup
        #[arg(long, default_value_t = 0)]
        rank: u32,
        /// Do not fall back to the undecomposed root
        #[arg(long)]
        no_global_fallback: bool,
        /// Do not search for a close time directory
        #[arg(long)]
        exact_time: bool,
        /// Resolve a directory instead of a file
        #[arg(long)]
        dir: bool,
    },
    /// List objects in a resolved directory
    List {
        #[command(flatten)]
        case: CaseArgs,
        #[command(flatten)]
        object: ObjectArgs,
        /// Rank doing the lookup
        #[arg(long, default_value_t = 0)]
        rank: u32,
    },
    /// Pack one file per rank into a block container object
    Pack {
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
        /// Class recorded for every packed object
        #[arg(long)]
        class_name: String,
        /// First rank of the group
        #[arg(long, default_value_t = 0)]
        group_start: u32,
        /// Total ranks in the run; defaults to the end of the group
        #[arg(long)]
        total: Option<u32>,
        /// Payload files, one per rank in order
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
    /// Extract one rank's payload from an object file
    Unpack {
        /// Object file
        file: PathBuf,
        /// Rank whose slot to extract from a container
        #[arg(long, default_value_t = 0)]
        rank: u32,
        /// Output file; payload goes to stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Describe an object file
    Inspect {
        /// Object file
        file: PathBuf,
    },
    /// Run a master-only read on threads and report what every rank saw
    SimulateRead {
        #[command(flatten)]
        case: CaseArgs,
        #[command(flatten)]
        object: ObjectArgs,
        /// Storage strategy; overrides the configuration file
        #[arg(long)]
        strategy: Option<IoStrategy>,
        /// Read per rank instead of master-only
        #[arg(long)]
        per_rank: bool,
    },
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn read_object_file(path: &Path) -> Result<StoredObject> {
    let raw = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(StoredObject::decode(path, Bytes::from(raw))?)
}

fn resolve(
    case: &CaseArgs,
    object: &ObjectArgs,
    rank: u32,
    options: ResolveOptions,
) -> Result<()> {
    let resolver = PathResolver::new(case.layout(), Rank::new(rank));
    let id = object.identity();
    debug!(object = %id, rank, ?options, "Resolving");
    let path = resolver
        .resolve(&id, &options)
        .ok_or_else(|| anyhow!("{id} not found (would be {})", resolver.object_path(&id).display()))?;
    println!("{}", path.display());
    Ok(())
}

fn list(config: &Config, case: &CaseArgs, object: &ObjectArgs, rank: u32) -> Result<()> {
    let resolver = PathResolver::new(case.layout(), Rank::new(rank));
    let options = ResolveOptions::from_config(&config.resolver);
    let listing = resolver
        .list_objects(&object.identity(), &options)?
        .ok_or_else(|| anyhow!("{} not found", object.identity()))?;

    if listing.instance != object.instance {
        println!("# instance {} matched {}", object.instance, listing.instance);
    }
    println!("# {}", listing.path.display());
    for name in listing.names {
        println!("{name}");
    }
    Ok(())
}

fn pack(
    output: &Path,
    class_name: &str,
    group_start: u32,
    total: Option<u32>,
    inputs: &[PathBuf],
) -> Result<()> {
    let mut blocks = Vec::with_capacity(inputs.len());
    for input in inputs {
        let payload =
            std::fs::read(input).with_context(|| format!("Failed to read {}", input.display()))?;
        blocks.push(StoredObject::new(class_name, payload).encode()?);
    }

    let group_size = u32::try_from(blocks.len())?;
    let total = total.unwrap_or(group_start + group_size);
    let container = BlockCodec::encode(Rank::new(group_start), &blocks, total)?;
    let object = StoredObject::new(CONTAINER_CLASS, container).encode()?;
    std::fs::write(output, &object)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!(
        "Packed {group_size} blocks for ranks {group_start}..{} of {total} into {} ({} bytes)",
        group_start + group_size,
        output.display(),
        object.len()
    );
    Ok(())
}

fn unpack(file: &Path, rank: u32, output: Option<&Path>) -> Result<()> {
    let mut object = read_object_file(file)?;
    if object.class_name == CONTAINER_CLASS {
        let container = BlockContainer::parse(object.payload.clone())?;
        let header = container.header();
        if let Some(split) = split_processor_path(file).filter(|s| !s.group.is_per_rank()) {
            if split.group.group_start != header.group_start
                || split.group.group_size != header.group_size
            {
                bail!(
                    "{} holds ranks {}+{} but its directory names {}",
                    file.display(),
                    header.group_start,
                    header.group_size,
                    split.group.name
                );
            }
        }
        let block = container.block_for_rank(Rank::new(rank))?;
        object = StoredObject::decode(file, block)?;
    }

    match output {
        Some(path) => {
            std::fs::write(path, &object.payload)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("{}: {} bytes of {}", path.display(), object.payload.len(), object.class_name);
        }
        None => {
            use std::io::Write;
            std::io::stdout().write_all(&object.payload)?;
        }
    }
    Ok(())
}

fn inspect(file: &Path) -> Result<()> {
    let object = read_object_file(file)?;
    println!("File:    {}", file.display());
    println!("Class:   {}", object.class_name);
    if !object.note.is_empty() {
        println!("Note:    {}", object.note);
    }
    println!("Payload: {} bytes", object.payload.len());

    if object.class_name == CONTAINER_CLASS {
        let container = BlockContainer::parse(object.payload)?;
        let header = container.header();
        println!();
        println!(
            "Container: ranks {}..{} of {}",
            header.group_start,
            header.group_start.get() + header.group_size,
            header.total
        );
        println!("{:<8} {:>12} {:>12} {:>10}  CLASS", "RANK", "OFFSET", "LENGTH", "CRC32C");
        for slot in 0..header.group_size {
            let entry = container.entry(slot)?;
            let class = container
                .block(slot)
                .and_then(|block| StoredObject::decode(file, block))
                .map_or_else(|e| format!("<{e}>"), |inner| inner.class_name);
            println!(
                "{:<8} {:>12} {:>12} {:>10x}  {class}",
                header.group_start.get() + slot,
                entry.offset,
                entry.length,
                entry.checksum
            );
        }
    }
    Ok(())
}

fn simulate_read(
    mut config: Config,
    case: &CaseArgs,
    object: &ObjectArgs,
    strategy: Option<IoStrategy>,
    per_rank: bool,
) -> Result<()> {
    if let Some(strategy) = strategy {
        config.io.strategy = strategy;
    }
    let ranks = case.ranks.unwrap_or(1);
    let layout = case.layout();
    let id = object.identity();
    info!(ranks, strategy = config.io.strategy.as_str(), object = %id, "Simulating read");

    let outcomes = std::thread::scope(|s| {
        let handles: Vec<_> = LocalTransport::mesh(ranks)
            .into_iter()
            .map(|transport| {
                let (config, layout, id) = (&config, &layout, &id);
                s.spawn(move || {
                    let stats = transport.stats_handle();
                    let comm = Communicator::new(transport, &config.comm);
                    let store = open_store(layout.clone(), comm, config)?;
                    let result = if per_rank {
                        store.read_per_rank(id, None)
                    } else {
                        store.read_master_only(id, None)
                    };
                    let cache = store.directory_cache();
                    let listings = (cache.len(), cache.stats().hit_ratio());
                    Ok::<_, caseio_common::Error>((store.rank(), result, listings, stats))
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().map_err(|_| anyhow!("rank thread panicked")))
            .collect::<Result<Vec<_>>>()
    })?;

    println!(
        "{:<6} {:<10} {:>10} {:>9} {:>7} {:>9}  RESULT",
        "RANK", "STATUS", "BYTES", "LISTINGS", "HIT%", "MSGS"
    );
    let mut failures = 0;
    for outcome in outcomes {
        let (rank, result, (listings, hit_ratio), stats) = outcome?;
        let hit_pct = format!("{:.1}", hit_ratio * 100.0);
        let messages = stats.sent() + stats.received();
        match result {
            Ok(object) => println!(
                "{:<6} {:<10} {:>10} {:>9} {:>7} {:>9}  {}",
                rank,
                "ok",
                object.payload.len(),
                listings,
                hit_pct,
                messages,
                object.class_name
            ),
            Err(e) => {
                failures += 1;
                println!(
                    "{:<6} {:<10} {:>10} {:>9} {:>7} {:>9}  {e}",
                    rank, "failed", "-", listings, hit_pct, messages
                );
            }
        }
    }

    if failures > 0 {
        bail!("read failed on {failures} of {ranks} ranks");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    // Command line wins over the config file unless left at its default
    let log_level = if args.log_level == "warn" {
        config.logging.level.clone()
    } else {
        args.log_level.clone()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match args.command {
        Commands::Resolve {
            case,
            object,
            rank,
            no_global_fallback,
            exact_time,
            dir,
        } => {
            let mut options = ResolveOptions::from_config(&config.resolver);
            options.check_global_fallback &= !no_global_fallback;
            options.fuzzy_time &= !exact_time;
            if dir {
                options = options.dir();
            }
            resolve(&case, &object, rank, options)
        }
        Commands::List { case, object, rank } => list(&config, &case, &object, rank),
        Commands::Pack {
            output,
            class_name,
            group_start,
            total,
            inputs,
        } => pack(&output, &class_name, group_start, total, &inputs),
        Commands::Unpack { file, rank, output } => unpack(&file, rank, output.as_deref()),
        Commands::Inspect { file } => inspect(&file),
        Commands::SimulateRead {
            case,
            object,
            strategy,
            per_rank,
        } => simulate_read(config, &case, &object, strategy, per_rank),
    }
}
