use std::fs::File;
use std::io::{self, BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rebuildfs_core::export::{self, PartitionFilter};
use rebuildfs_core::{
	fs, open_session, parse_id, readable_summary, restore_node, BlockDevice, Engine, Partition,
	RebuildConfig, SaveState, StateManager, WarningSink,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rebuildfs", version, about = "RebuildFS - NTFS reconstruction from damaged disk images")]
struct Cli {
	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
	/// Scan an image, rebuild every NTFS partition found and open the shell
	Scan {
		/// Path to image file or raw device
		image: PathBuf,
		/// Save-state file, reused when it belongs to this image
		#[arg(short = 's', long = "savefile")]
		savefile: Option<PathBuf>,
		/// Ignore an existing save-state and overwrite it
		#[arg(short = 'w', long)]
		overwrite: bool,
		/// Directory receiving restored files and exports
		#[arg(short = 'o', long = "outdir", default_value = "recovered_files")]
		outdir: PathBuf,
		/// JSON configuration file
		#[arg(long)]
		config: Option<PathBuf>,
		/// Print the recoverable partitions and exit
		#[arg(long)]
		no_shell: bool,
	},
	/// List the boot sectors found in an image
	Detect {
		/// Path to image file
		image: PathBuf,
		/// Print the result as JSON
		#[arg(long)]
		json: bool,
	},
}

#[derive(Serialize)]
struct DetectedEntry {
	kind: String,
	sector: u64,
	offset_bytes: u64,
	consistent: bool,
}

fn main() -> Result<()> {
	// Initialize tracing, RUST_LOG overrides the default level
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.with_writer(io::stderr)
		.init();

	let cli = Cli::parse();
	match cli.command {
		Commands::Scan { image, savefile, overwrite, outdir, config, no_shell } => {
			let config = match config {
				Some(path) => RebuildConfig::from_json_file(&path)
					.with_context(|| format!("Failed to load configuration {}", path.display()))?,
				None => RebuildConfig::default(),
			};

			let device = BlockDevice::open(&image)
				.with_context(|| format!("Failed to open image {}", image.display()))?;
			let mut engine = Engine::new(device, config);

			let bar = progress_bar();
			if let Some(bar) = bar.clone() {
				engine.set_progress_callback(move |progress| {
					bar.set_position(progress.progress_percent as u64);
					bar.set_message(progress.current_operation);
				});
			}

			let report = open_session(&engine, savefile.as_deref(), overwrite)?;
			if let Some(bar) = bar {
				bar.finish_and_clear();
			}

			if !report.completed {
				println!("⚠️  Scan interrupted, results are partial");
			}
			if !report.warnings.is_empty() {
				println!("⚠️  {} warnings recorded", report.warnings.len());
			}
			println!("✅ {}", readable_summary(&report.state));

			if no_shell {
				print_listing(&report.state.partitions, PartitionFilter::Recoverable);
				return Ok(());
			}

			let mut shell = Shell {
				engine: &engine,
				state: report.state,
				outdir,
				manager: savefile.map(StateManager::new),
			};
			shell.run()?;
		}
		Commands::Detect { image, json } => {
			let device = BlockDevice::open(&image)
				.with_context(|| format!("Failed to open image {}", image.display()))?;
			let found = fs::detect_boot_sectors(&device);

			if json {
				let entries: Vec<DetectedEntry> = found
					.iter()
					.map(|boot| DetectedEntry {
						kind: boot.kind.to_string(),
						sector: boot.sector,
						offset_bytes: boot.sector * rebuildfs_core::SECTOR_SIZE,
						consistent: boot.consistent,
					})
					.collect();
				println!("{}", serde_json::to_string_pretty(&entries)?);
				return Ok(());
			}

			println!("🔍 Looking for boot sectors in: {}", image.display());
			if found.is_empty() {
				println!("❌ No NTFS boot sector found");
			}
			for boot in found {
				let label = if boot.consistent { "✅" } else { "⚠️ " };
				println!("{} {} boot sector at sector {}", label, boot.kind, boot.sector);
				if let Ok(info) = fs::get_filesystem_info(&device, boot.kind, boot.sector) {
					println!("{}", info);
					println!();
				}
			}
		}
	}
	Ok(())
}

/// Progress bar on stderr, only when it is a terminal
fn progress_bar() -> Option<ProgressBar> {
	if !atty::is(atty::Stream::Stderr) {
		return None;
	}
	let bar = ProgressBar::new(100);
	let style = ProgressStyle::with_template("{spinner} [{bar:40}] {pos:>3}% {msg}")
		.map(|s| s.progress_chars("=> "))
		.unwrap_or_else(|_| ProgressStyle::default_bar());
	bar.set_style(style);
	Some(bar)
}

fn print_listing(partitions: &[Partition], filter: PartitionFilter) {
	let lines = export::partition_listing(partitions, filter);
	if lines.is_empty() {
		println!("No partitions to show");
	}
	for line in lines {
		println!("{}", line);
	}
}

const HELP: &str = "\
Commands:
  help                      Show this message
  recoverable               List recoverable partitions
  other                     List partitions that are not recoverable
  allparts                  List every partition
  tree <part#>              Print the directory tree of a partition
  csv <part#> <file>        Export the records of a partition as CSV
  bodyfile <part#> <file>   Export a TSK 3.x body file
  tikzplot <part#> [<file>] LaTeX TikZ drawing of the directory tree
  restore <part#> <id>      Restore a node (5 = root, -1 = LostFiles)
  locate <part#> <text>     Find nodes whose path contains text
  traceback <part#> <id>    Show the ancestors of a node
  merge <part#> <part#>     Merge the second partition into the first
  quit                      Leave the shell";

struct Shell<'a> {
	engine: &'a Engine<BlockDevice>,
	state: SaveState,
	outdir: PathBuf,
	manager: Option<StateManager>,
}

impl Shell<'_> {
	fn run(&mut self) -> Result<()> {
		println!("Type 'help' for the list of commands");
		let stdin = io::stdin();
		let mut lines = stdin.lock().lines();
		loop {
			print!("rebuildfs> ");
			io::stdout().flush()?;

			let Some(line) = lines.next() else {
				println!();
				break;
			};
			let line = line?;
			let args: Vec<&str> = line.split_whitespace().collect();
			let Some((&command, rest)) = args.split_first() else {
				continue;
			};

			match command {
				"quit" | "exit" => break,
				_ => {
					if let Err(e) = self.dispatch(command, rest) {
						println!("❌ {:#}", e);
					}
				}
			}
		}
		Ok(())
	}

	fn dispatch(&mut self, command: &str, args: &[&str]) -> Result<()> {
		tracing::debug!("Shell command {} {:?}", command, args);
		match command {
			"help" => println!("{}", HELP),
			"recoverable" => print_listing(&self.state.partitions, PartitionFilter::Recoverable),
			"other" => print_listing(&self.state.partitions, PartitionFilter::Other),
			"allparts" => print_listing(&self.state.partitions, PartitionFilter::All),
			"tree" => {
				let partition = self.partition(args, 1)?;
				print!("{}", export::tree_listing(partition));
			}
			"csv" => {
				let path = output_arg(&self.outdir, args)?;
				let partition = self.partition(args, 2)?;
				let file = File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
				export::write_csv(partition, BufWriter::new(file))?;
				println!("📄 CSV written to {}", path.display());
			}
			"bodyfile" => {
				let path = output_arg(&self.outdir, args)?;
				let partition = self.partition(args, 2)?;
				let file = File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
				export::write_bodyfile(partition, BufWriter::new(file))?;
				println!("📄 Body file written to {}", path.display());
			}
			"tikzplot" => {
				let partition = self.partition(args, 1)?;
				let tikz = export::tikz_tree(partition);
				if args.len() > 1 {
					let path = output_arg(&self.outdir, args)?;
					std::fs::write(&path, tikz).with_context(|| format!("Failed to write {}", path.display()))?;
					println!("📄 TikZ code written to {}", path.display());
				} else {
					print!("{}", tikz);
				}
			}
			"restore" => {
				let partition = self.partition(args, 2)?;
				let id = id_arg(args)?;
				let report = restore_node(self.engine.image(), partition, id, &self.outdir, self.engine.config())?;
				println!(
					"💾 {} files ({}) and {} directories restored, {} partial, {} skipped",
					report.files_written,
					export::readable_bytes(report.bytes_written),
					report.directories_created,
					report.partial_files,
					report.skipped
				);
				for warning in &report.warnings {
					println!("  ⚠️  {}", warning);
				}
			}
			"locate" => {
				let partition = self.partition(args, 2)?;
				let text = args[1..].join(" ");
				for (id, path) in export::locate(partition, &text) {
					println!("{}: {}", rebuildfs_core::display_id(id), path);
				}
			}
			"traceback" => {
				let partition = self.partition(args, 2)?;
				let id = id_arg(args)?;
				for (ancestor, path) in export::traceback(partition, id)? {
					println!("{}: {}", rebuildfs_core::display_id(ancestor), path);
				}
			}
			"merge" => {
				let (into, from) = match args {
					[a, b] => (index_arg(a)?, index_arg(b)?),
					_ => bail!("usage: merge <part#> <part#>"),
				};
				let warnings = WarningSink::new();
				self.state.merge_partitions(into, from, self.engine.config(), &warnings)?;
				println!("🔗 Partition #{} merged into #{}", from, into);
				self.save()?;
			}
			other => println!("Unknown command '{}', type 'help'", other),
		}
		Ok(())
	}

	fn partition(&self, args: &[&str], needed: usize) -> Result<&Partition> {
		if args.len() < needed {
			bail!("missing argument, type 'help'");
		}
		let index = index_arg(args[0])?;
		Ok(self.state.partition(index)?)
	}

	fn save(&self) -> Result<()> {
		if let Some(manager) = &self.manager {
			manager
				.write_atomic(&self.state)
				.with_context(|| format!("Failed to write {}", manager.path().display()))?;
			println!("💾 State saved to {}", manager.path().display());
		}
		Ok(())
	}
}

fn index_arg(text: &str) -> Result<usize> {
	text.parse().map_err(|_| anyhow!("'{}' is not a partition number", text))
}

fn id_arg(args: &[&str]) -> Result<u64> {
	let text = args.get(1).ok_or_else(|| anyhow!("missing node id"))?;
	parse_id(text).ok_or_else(|| anyhow!("'{}' is not a node id", text))
}

/// Output file argument; relative paths land in the output directory
fn output_arg(outdir: &Path, args: &[&str]) -> Result<PathBuf> {
	let text = args.get(1).ok_or_else(|| anyhow!("missing output file"))?;
	let path = outdir.join(text);
	if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
		std::fs::create_dir_all(parent)?;
	}
	Ok(path)
}
