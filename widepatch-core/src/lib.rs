use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod apply;
pub mod archive;
pub mod layout_table;
pub mod locate;
pub mod patch_file;
pub mod relocate;
pub mod remap;
pub mod sprite;

pub use apply::{ApplyReport, PatchApplier};
pub use patch_file::{PatchFile, PatchKind, PatchRecord};
pub use relocate::{MatchPolicy, Relocator};
pub use remap::Resolution;

use locate::FileFilter;

#[derive(Debug, Error)]
pub enum WidepatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("invalid settings file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid file name pattern: {0}")]
    Pattern(#[from] glob::PatternError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("no file matching '{pattern}' under {}", root.display())]
    NotFound { pattern: String, root: PathBuf },
    #[error("none of the patch files matches a game binary under {}", root.display())]
    NoMatchingBinary { root: PathBuf },
    #[error("no archive reference at {position:#010X}; wrong binary for this patch")]
    ArchiveReference { position: i32 },
    #[error("patch file line {line}: {reason}")]
    PatchSyntax { line: usize, reason: String },
    #[error("archive layout error: {0}")]
    Layout(String),
    #[error("malformed sprite: {reason}")]
    Sprite { reason: String },
    #[error("archive item {id}: {source}")]
    ItemTransform {
        id: u32,
        #[source]
        source: Box<WidepatchError>,
    },
}

pub type Result<T> = std::result::Result<T, WidepatchError>;

fn default_patch_pattern() -> String {
    "*.patch".to_string()
}

fn default_exe_pattern() -> String {
    "age2_x1*.exe".to_string()
}

fn default_archive_name() -> String {
    "interfac.drs".to_string()
}

/// Inputs of one patching run. Loadable from JSON; every field except
/// `game_dir` has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchSettings {
    pub game_dir: PathBuf,
    /// Where patch files are looked up; the game directory when unset.
    #[serde(default)]
    pub patch_dir: Option<PathBuf>,
    /// Output location; each input's own directory when unset.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default = "default_patch_pattern")]
    pub patch_pattern: String,
    #[serde(default = "default_exe_pattern")]
    pub exe_pattern: String,
    #[serde(default = "default_archive_name")]
    pub archive_name: String,
    #[serde(default)]
    pub targets: Vec<Resolution>,
}

impl PatchSettings {
    pub fn new(game_dir: impl Into<PathBuf>) -> Self {
        Self {
            game_dir: game_dir.into(),
            patch_dir: None,
            output_dir: None,
            patch_pattern: default_patch_pattern(),
            exe_pattern: default_exe_pattern(),
            archive_name: default_archive_name(),
            targets: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Files written for one target resolution.
#[derive(Debug, Clone)]
pub struct TargetOutput {
    pub resolution: Resolution,
    pub source: Resolution,
    pub exe_path: PathBuf,
    /// None when the archive could not be converted.
    pub archive_path: Option<PathBuf>,
    pub report: ApplyReport,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub patch_path: PathBuf,
    pub binary_path: PathBuf,
    pub archive_path: PathBuf,
    pub outputs: Vec<TargetOutput>,
    /// Targets dropped with the reason they were dropped.
    pub skipped: Vec<(Resolution, String)>,
}

struct Binary {
    path: PathBuf,
    data: Vec<u8>,
    md5: String,
}

/// Finds the first patch file that targets one of the binaries under the
/// game directory.
fn match_patch_to_binary(settings: &PatchSettings) -> Result<(PathBuf, PatchFile, Binary)> {
    let patch_dir = settings.patch_dir.as_ref().unwrap_or(&settings.game_dir);
    let any = FileFilter::default();
    let patch_paths = locate::find_files(patch_dir, &settings.patch_pattern, &any)?;
    let exe_paths = locate::find_files(&settings.game_dir, &settings.exe_pattern, &any)?;
    log::debug!(
        "{} patch files, {} candidate binaries",
        patch_paths.len(),
        exe_paths.len()
    );

    let mut binaries = Vec::with_capacity(exe_paths.len());
    for path in exe_paths {
        let data = fs::read(&path)?;
        let md5 = locate::md5_hex(&data);
        log::trace!("{}: {} bytes, md5 {}", path.display(), data.len(), md5);
        binaries.push(Binary { path, data, md5 });
    }

    for patch_path in patch_paths {
        let patch = match PatchFile::load(&patch_path) {
            Ok(patch) => patch,
            Err(err) => {
                log::warn!("Ignoring {}: {err}", patch_path.display());
                continue;
            }
        };
        let found = binaries
            .iter()
            .position(|b| patch.matches_image(b.data.len() as u64, &b.md5));
        if let Some(index) = found {
            let binary = binaries.swap_remove(index);
            log::info!(
                "Using {} (version {}) for {}",
                patch_path.display(),
                patch.version,
                binary.path.display()
            );
            return Ok((patch_path, patch, binary));
        }
        log::debug!("{} matches no binary", patch_path.display());
    }

    Err(WidepatchError::NoMatchingBinary {
        root: settings.game_dir.clone(),
    })
}

fn output_dir_for<'a>(settings: &'a PatchSettings, input: &'a Path) -> &'a Path {
    match &settings.output_dir {
        Some(dir) => dir.as_path(),
        None => input.parent().unwrap_or_else(|| Path::new(".")),
    }
}

fn patch_target(
    settings: &PatchSettings,
    patch: &PatchFile,
    binary: &Binary,
    archive_path: &Path,
    archive_data: &[u8],
    target: Resolution,
) -> Result<TargetOutput> {
    let source = remap::source_resolution(target)?;
    log::info!("Patching for {target} from the {source} layout");

    let archive_name = apply::archive_file_name(target);
    let mut image = binary.data.clone();
    apply::patch_archive_references(&mut image, patch, &archive_name)?;
    let report = PatchApplier::new(source, target).apply(&mut image, &patch.records);

    let stem = binary
        .path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "game".to_string());
    let exe_path = output_dir_for(settings, &binary.path).join(format!("{stem}_{target}.exe"));
    locate::write_file(&exe_path, &image)?;
    log::info!("Wrote {}", exe_path.display());

    let archive_out = match archive::transcode(archive_data, source, target) {
        Ok(data) => {
            let path = output_dir_for(settings, archive_path).join(&archive_name);
            locate::write_file(&path, &data)?;
            log::info!("Wrote {}", path.display());
            Some(path)
        }
        Err(err) => {
            log::error!("Could not convert {}: {err}", archive_path.display());
            None
        }
    };

    Ok(TargetOutput {
        resolution: target,
        source,
        exe_path,
        archive_path: archive_out,
        report,
    })
}

/// Produces a patched binary and interface archive for every target
/// resolution in `settings`.
pub fn run(settings: &PatchSettings) -> Result<RunSummary> {
    if !settings.game_dir.is_dir() {
        return Err(WidepatchError::Config(format!(
            "Game directory does not exist: {}",
            settings.game_dir.display()
        )));
    }
    if settings.targets.is_empty() {
        return Err(WidepatchError::Config(
            "No target resolutions given".to_string(),
        ));
    }

    let (patch_path, patch, binary) = match_patch_to_binary(settings)?;

    let archive_path = locate::find_unique(
        &settings.game_dir,
        &settings.archive_name,
        &FileFilter::default(),
    )?;
    let archive_data = fs::read(&archive_path)?;

    let mut outputs = Vec::new();
    let mut skipped = Vec::new();
    for &target in &settings.targets {
        match patch_target(settings, &patch, &binary, &archive_path, &archive_data, target) {
            Ok(output) => outputs.push(output),
            Err(WidepatchError::Config(reason)) => {
                log::warn!("Skipping {target}: {reason}");
                skipped.push((target, reason));
            }
            Err(err) => return Err(err),
        }
    }

    Ok(RunSummary {
        patch_path,
        binary_path: binary.path,
        archive_path,
        outputs,
        skipped,
    })
}

/// Inputs for porting a patch file from one build of the binary to another.
#[derive(Debug, Clone)]
pub struct ConvertSettings {
    pub root_exe: PathBuf,
    pub root_patch: PathBuf,
    pub target_exe: PathBuf,
    pub output_patch: PathBuf,
    /// Disassembly listing of the root build, used to annotate records.
    pub listing: Option<PathBuf>,
    pub version: String,
    pub policy: MatchPolicy,
}

pub fn convert(settings: &ConvertSettings) -> Result<PatchFile> {
    let root = fs::read(&settings.root_exe)?;
    let target = fs::read(&settings.target_exe)?;
    let root_patch = PatchFile::load(&settings.root_patch)?;

    if !root_patch.matches_image(root.len() as u64, &locate::md5_hex(&root)) {
        log::warn!(
            "{} was not written for {}; relocated offsets may be wrong",
            settings.root_patch.display(),
            settings.root_exe.display()
        );
    }

    let mut converted =
        relocate::convert_patch(&root, &target, &root_patch, &settings.policy, &settings.version);

    if let Some(listing_path) = &settings.listing {
        let raw = fs::read(listing_path)?;
        let listing = patch_file::Listing::parse(&String::from_utf8_lossy(&raw));
        log::debug!("{} listing lines loaded", listing.len());
        patch_file::annotate(&mut converted.records, &listing);
    }

    converted.save(&settings.output_patch)?;
    log::info!("Wrote {}", settings.output_patch.display());
    Ok(converted)
}

/// Offsets of known resolution constants in the binary at `path`.
pub fn scan(path: &Path) -> Result<Vec<(usize, u32)>> {
    let image = fs::read(path)?;
    Ok(apply::scan_resolutions(&image))
}
