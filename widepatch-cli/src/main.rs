use clap::{Args, Parser, Subcommand};
use std::fs;
use std::path::PathBuf;

use widepatch_core::{
    convert, run, scan, ConvertSettings, MatchPolicy, PatchSettings, Resolution, WidepatchError,
};

#[derive(Debug, Parser)]
#[command(
    name = "widepatch",
    version,
    about = "Widescreen patcher for Age of Empires II: The Conquerors"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// More output; repeat for trace messages
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only report errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Patch the game binary and interface archive for new resolutions
    Patch(PatchArgs),

    /// Port a patch file to another build of the game binary
    Convert {
        /// Binary the existing patch file was written for
        #[arg(long)]
        root_exe: PathBuf,

        #[arg(long)]
        root_patch: PathBuf,

        #[arg(long)]
        target_exe: PathBuf,

        #[arg(long)]
        output: PathBuf,

        /// Disassembly listing of the root binary, for annotating records
        #[arg(long)]
        listing: Option<PathBuf>,

        /// Version string written into the new patch file
        #[arg(long, default_value = "")]
        version_tag: String,

        /// JSON file overriding the window search tunables
        #[arg(long)]
        policy: Option<PathBuf>,
    },

    /// List offsets of well-known resolution values in a binary
    Scan { exe: PathBuf },
}

#[derive(Debug, Args)]
struct PatchArgs {
    /// JSON settings file; flags given here override its values
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    game_dir: Option<PathBuf>,

    /// Directory searched for patch files (defaults to the game directory)
    #[arg(long)]
    patch_dir: Option<PathBuf>,

    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long)]
    patch_pattern: Option<String>,

    #[arg(long)]
    exe_pattern: Option<String>,

    #[arg(long)]
    archive_name: Option<String>,

    /// Target resolutions, e.g. 1920x1080
    #[arg(value_name = "WIDTHxHEIGHT")]
    targets: Vec<Resolution>,
}

impl PatchArgs {
    fn into_settings(self) -> Result<PatchSettings, WidepatchError> {
        let mut settings = match (&self.config, &self.game_dir) {
            (Some(path), _) => PatchSettings::load(path)?,
            (None, Some(dir)) => PatchSettings::new(dir),
            (None, None) => {
                return Err(WidepatchError::Config(
                    "either --config or --game-dir is required".to_string(),
                ))
            }
        };

        if let Some(dir) = self.game_dir {
            settings.game_dir = dir;
        }
        if self.patch_dir.is_some() {
            settings.patch_dir = self.patch_dir;
        }
        if self.output.is_some() {
            settings.output_dir = self.output;
        }
        if let Some(pattern) = self.patch_pattern {
            settings.patch_pattern = pattern;
        }
        if let Some(pattern) = self.exe_pattern {
            settings.exe_pattern = pattern;
        }
        if let Some(name) = self.archive_name {
            settings.archive_name = name;
        }
        if !self.targets.is_empty() {
            settings.targets = self.targets;
        }
        Ok(settings)
    }
}

fn execute(command: Command) -> Result<(), WidepatchError> {
    match command {
        Command::Patch(args) => {
            let settings = args.into_settings()?;
            let summary = run(&settings)?;
            for output in &summary.outputs {
                println!(
                    "{}: {} ({} patched, {} skipped)",
                    output.resolution,
                    output.exe_path.display(),
                    output.report.patched,
                    output.report.skipped
                );
                match &output.archive_path {
                    Some(path) => println!("{}: {}", output.resolution, path.display()),
                    None => println!("{}: interface archive not converted", output.resolution),
                }
            }
            for (target, reason) in &summary.skipped {
                println!("{target}: skipped ({reason})");
            }
        }
        Command::Convert {
            root_exe,
            root_patch,
            target_exe,
            output,
            listing,
            version_tag,
            policy,
        } => {
            let policy = match policy {
                Some(path) => serde_json::from_str::<MatchPolicy>(&fs::read_to_string(path)?)?,
                None => MatchPolicy::default(),
            };
            let settings = ConvertSettings {
                root_exe,
                root_patch,
                target_exe,
                output_patch: output,
                listing,
                version: version_tag,
                policy,
            };
            let patch = convert(&settings)?;
            let resolved = patch.records.iter().filter(|r| r.is_resolved()).count();
            println!(
                "{}: {} of {} records relocated",
                settings.output_patch.display(),
                resolved,
                patch.records.len()
            );
        }
        Command::Scan { exe } => {
            for (offset, value) in scan(&exe)? {
                println!("{offset:08X}  {value}");
            }
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(err) = execute(cli.command) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
