//! Heaptrace Studio CLI
//!
//! Offline analysis of sampled heap allocation traces. Reconstructs
//! live memory at any point in time and renders flow graphs, flame
//! graphs, and usage-over-time plots.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use env_logger::Env;
use std::path::PathBuf;

use heaptrace_studio::timeplot::GroupBy;
use heaptrace_studio::trace::{StackTable, TraceWriter};
use heaptrace_studio::utils::config::{
    self, DEFAULT_DIGEST_INTERVAL, DEFAULT_MIN_EDGE_FRACTION, DEFAULT_MIN_NODE_FRACTION,
    DEFAULT_PLOT_GROUPS, DEFAULT_PLOT_INTERVAL,
};
use heaptrace_studio::utils::si::bytes_string;
use heaptrace_studio::Reader;

/// Heaptrace Studio - offline heap profile analysis
#[derive(Parser, Debug)]
#[command(name = "heaptrace")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum GroupByArg {
    Frame,
    File,
}

impl From<GroupByArg> for GroupBy {
    fn from(arg: GroupByArg) -> Self {
        match arg {
            GroupByArg::Frame => GroupBy::Frame,
            GroupByArg::File => GroupBy::File,
        }
    }
}

/// Available commands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Summarize a profile: span, events, usage at the end
    Info {
        /// Profile base path (without the .htrace suffix)
        base: PathBuf,
    },

    /// Build the checkpoint cache for fast point-in-time queries
    Digest {
        /// Profile base path
        base: PathBuf,

        /// Seconds between checkpoints
        #[arg(long, default_value_t = DEFAULT_DIGEST_INTERVAL)]
        interval: f64,

        /// Rebuild even if a valid digest exists
        #[arg(long)]
        force: bool,
    },

    /// Export a flame graph in collapsed-stack format
    Flame {
        /// Profile base path
        base: PathBuf,

        /// Time to snapshot, seconds since trace start (default: end)
        #[arg(long)]
        at: Option<f64>,

        /// Output path for the folded stacks
        #[arg(short, long, default_value = "flame.folded")]
        output: PathBuf,
    },

    /// Export a flow graph in Graphviz dot format
    Graph {
        /// Profile base path
        base: PathBuf,

        /// Time to snapshot, seconds since trace start (default: end)
        #[arg(long)]
        at: Option<f64>,

        /// Output path for the dot file
        #[arg(short, long, default_value = "flow.dot")]
        output: PathBuf,

        /// Hide nodes below this fraction of total usage
        #[arg(long, default_value_t = DEFAULT_MIN_NODE_FRACTION)]
        min_node: f64,

        /// Hide edges below this fraction of total usage
        #[arg(long, default_value_t = DEFAULT_MIN_EDGE_FRACTION)]
        min_edge: f64,
    },

    /// Flow-graph diff between two points in time
    Diff {
        /// Profile base path
        base: PathBuf,

        /// Baseline time, seconds since trace start
        from: f64,

        /// Comparison time, seconds since trace start
        to: f64,

        /// Output path for the dot file
        #[arg(short, long, default_value = "diff.dot")]
        output: PathBuf,

        /// Hide nodes below this fraction of the usage delta
        #[arg(long, default_value_t = DEFAULT_MIN_NODE_FRACTION)]
        min_node: f64,

        /// Hide edges below this fraction of the usage delta
        #[arg(long, default_value_t = DEFAULT_MIN_EDGE_FRACTION)]
        min_edge: f64,
    },

    /// Export usage-over-time series as CSV
    Plot {
        /// Profile base path
        base: PathBuf,

        /// Seconds between samples
        #[arg(long, default_value_t = DEFAULT_PLOT_INTERVAL)]
        interval: f64,

        /// Attribute usage by innermost frame or by file
        #[arg(long, value_enum, default_value_t = GroupByArg::Frame)]
        group_by: GroupByArg,

        /// Number of named series before bucketing into "other"
        #[arg(long, default_value_t = DEFAULT_PLOT_GROUPS)]
        top: usize,

        /// Output path for the CSV
        #[arg(short, long, default_value = "plot.csv")]
        output: PathBuf,
    },

    /// Record a small synthetic demo profile (for trying the tool out)
    Record {
        /// Profile base path to create
        base: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    match cli.command {
        Commands::Info { base } => info(base),
        Commands::Digest {
            base,
            interval,
            force,
        } => digest(base, interval, force),
        Commands::Flame { base, at, output } => flame(base, at, output),
        Commands::Graph {
            base,
            at,
            output,
            min_node,
            min_edge,
        } => graph(base, at, output, min_node, min_edge),
        Commands::Diff {
            base,
            from,
            to,
            output,
            min_node,
            min_edge,
        } => diff(base, from, to, output, min_node, min_edge),
        Commands::Plot {
            base,
            interval,
            group_by,
            top,
            output,
        } => plot(base, interval, group_by.into(), top, output),
        Commands::Record { base } => record(base),
    }
}

fn open(base: &PathBuf) -> Result<Reader> {
    Reader::open(base).with_context(|| format!("failed to open profile {}", base.display()))
}

fn info(base: PathBuf) -> Result<()> {
    let reader = open(&base)?;
    let summary = reader.summary()?;
    let final_usage = reader.usage_at(reader.final_time())?;

    println!("Profile: {}", summary.base.display());
    println!("  Duration:      {:.3} s", summary.duration);
    println!(
        "  Sampling:      rate {} / scale {}",
        summary.sampling_rate, summary.scale_factor
    );
    println!(
        "  Events:        {} in {} chunk(s)",
        summary.event_count, summary.chunk_count
    );
    println!(
        "  Stacks:        {} ({} distinct frames)",
        summary.stack_count, summary.frame_count
    );
    println!("  Final usage:   {}", bytes_string(final_usage));
    println!(
        "  Peak usage:    {} at t={:.3} s",
        bytes_string(summary.peak_usage),
        summary.peak_time
    );
    println!(
        "  Digest:        {}",
        if summary.has_digest { "present" } else { "absent" }
    );
    if summary.truncated {
        println!("  Note: trace ends mid-record; later data was ignored");
    }
    Ok(())
}

fn digest(base: PathBuf, interval: f64, force: bool) -> Result<()> {
    if interval <= 0.0 {
        bail!("digest interval must be positive, got {}", interval);
    }
    let reader = open(&base)?;
    reader.make_digest(interval, force)?;
    println!(
        "Digest ready: {}",
        config::digest_path(&base).display()
    );
    Ok(())
}

fn flame(base: PathBuf, at: Option<f64>, output: PathBuf) -> Result<()> {
    let reader = open(&base)?;
    reader.ensure_digest(DEFAULT_DIGEST_INTERVAL)?;
    let t = at.unwrap_or_else(|| reader.final_time());
    let graph = reader.flame_graph_at(t)?;
    graph.write_folded(&output, reader.stack_table())?;
    println!(
        "Flame graph at t={:.3}s ({}) written to {}",
        t,
        bytes_string(graph.total_usage()),
        output.display()
    );
    Ok(())
}

fn graph(
    base: PathBuf,
    at: Option<f64>,
    output: PathBuf,
    min_node: f64,
    min_edge: f64,
) -> Result<()> {
    let reader = open(&base)?;
    reader.ensure_digest(DEFAULT_DIGEST_INTERVAL)?;
    let t = at.unwrap_or_else(|| reader.final_time());
    let graph = reader.flow_graph_at(t)?.filtered(min_node, min_edge);
    let title = format!("{} at t={:.3}s", base.display(), t);
    graph.write_dot(&output, reader.stack_table(), &title)?;
    println!(
        "Flow graph at t={:.3}s ({}) written to {}",
        t,
        bytes_string(graph.root_cumulative()),
        output.display()
    );
    Ok(())
}

fn diff(
    base: PathBuf,
    from: f64,
    to: f64,
    output: PathBuf,
    min_node: f64,
    min_edge: f64,
) -> Result<()> {
    let reader = open(&base)?;
    reader.ensure_digest(DEFAULT_DIGEST_INTERVAL)?;
    let before = reader.flow_graph_at(from)?;
    let after = reader.flow_graph_at(to)?;
    let delta = after.compare(&before).filtered(min_node, min_edge);
    let title = format!("{}: t={:.3}s vs t={:.3}s", base.display(), to, from);
    delta.write_dot(&output, reader.stack_table(), &title)?;
    println!(
        "Usage changed by {} between t={:.3}s and t={:.3}s; graph written to {}",
        bytes_string(delta.root_cumulative()),
        from,
        to,
        output.display()
    );
    Ok(())
}

fn plot(base: PathBuf, interval: f64, group_by: GroupBy, top: usize, output: PathBuf) -> Result<()> {
    if interval <= 0.0 {
        bail!("plot interval must be positive, got {}", interval);
    }
    let reader = open(&base)?;
    // One pass per sample without a digest gets slow; warm once instead.
    reader.warm()?;
    let plot = reader.time_plot(interval, group_by, top)?;
    plot.write_csv(&output)?;
    println!(
        "{} samples, {} series (peak {}) written to {}",
        plot.sample_count(),
        plot.labels.len(),
        bytes_string(plot.peak_total()),
        output.display()
    );
    Ok(())
}

/// Write a small, deterministic demo profile: a steady base load, a
/// cache that grows and is then dropped, and a short-lived burst.
fn record(base: PathBuf) -> Result<()> {
    let mut stacks = StackTable::new();
    let base_load = stacks.add_stack_lines(&[("app.py", 10), ("startup.py", 4)]);
    let cache = stacks.add_stack_lines(&[("app.py", 10), ("cache.py", 77)]);
    let burst = stacks.add_stack_lines(&[("app.py", 10), ("worker.py", 31), ("codec.py", 5)]);

    let mut writer = TraceWriter::new(chrono::Utc::now().timestamp() as f64, 1.0, 1.0);
    writer.begin_chunk(0.0);
    writer.add_event(0.0, base_load, 4 << 20);
    for i in 0..20 {
        writer.add_event(i as f64 * 0.5, cache, 256 << 10);
    }
    writer.add_event(10.0, burst, 32 << 20);
    writer.add_event(12.0, burst, -(32 << 20));
    for i in 0..40 {
        writer.add_event(15.0 + i as f64 * 0.5, cache, 256 << 10);
    }
    writer.add_event(40.0, cache, -(10 << 20));
    writer.add_event(45.0, cache, 128 << 10);

    writer.write_to(config::trace_path(&base))?;
    stacks.save(config::stacks_path(&base))?;
    println!("Demo profile written to {}.htrace", base.display());
    println!("Try: heaptrace info {}", base.display());
    Ok(())
}
