//! Resolution pipeline: reads data files, resolves name references, builds
//! a ready-to-run scenario.
//!
//! Provides format detection (RON/JSON/TOML), file discovery, and
//! deserialization helpers used by [`load_scenario`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use droplet_core::builder::ChipBuilder;
use droplet_core::chip::ChipError;
use droplet_core::config::SimulationConfig;
use droplet_core::droplet::ChannelPosition;
use droplet_core::id::{ChannelId, FluidId, NodeId};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::schema::ChipDescription;

// ===========================================================================
// Errors
// ===========================================================================

/// Errors that can occur during data loading.
#[derive(Debug, thiserror::Error)]
pub enum DataLoadError {
    /// A required data file was not found in the given directory.
    #[error("required file '{file}' not found in {dir}")]
    MissingRequired { file: &'static str, dir: PathBuf },

    /// The file has an extension we don't support.
    #[error("unsupported format for file: {file}")]
    UnsupportedFormat { file: PathBuf },

    /// Two files with the same base name but different formats exist.
    #[error("conflicting formats: {a} and {b}")]
    ConflictingFormats { a: PathBuf, b: PathBuf },

    #[error("parse error in {file}: {detail}")]
    Parse { file: PathBuf, detail: String },

    /// A name reference could not be resolved.
    #[error("unresolved {expected_kind} reference '{name}' in {file}")]
    UnresolvedRef {
        file: PathBuf,
        name: String,
        expected_kind: &'static str,
    },

    #[error("duplicate name '{name}' in {file}")]
    DuplicateName { file: PathBuf, name: String },

    /// The description names a valid layout that the builder refused.
    #[error(transparent)]
    Chip(#[from] ChipError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ===========================================================================
// Format detection
// ===========================================================================

/// Supported data file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Ron,
    Toml,
    Json,
}

/// Detect the format of a file based on its extension.
pub fn detect_format(path: &Path) -> Result<Format, DataLoadError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("ron") => Ok(Format::Ron),
        Some("toml") => Ok(Format::Toml),
        Some("json") => Ok(Format::Json),
        _ => Err(DataLoadError::UnsupportedFormat {
            file: path.to_path_buf(),
        }),
    }
}

// ===========================================================================
// File discovery
// ===========================================================================

/// Scan a directory for a data file with the given base name.
///
/// Looks for `{base_name}.ron`, `{base_name}.toml`, and `{base_name}.json`.
/// Returns `Ok(None)` if no file is found, or `Err(ConflictingFormats)` if
/// more than one format exists for the same base name.
pub fn find_data_file(dir: &Path, base_name: &str) -> Result<Option<PathBuf>, DataLoadError> {
    let mut found: Option<PathBuf> = None;

    for ext in ["ron", "toml", "json"] {
        let candidate = dir.join(format!("{base_name}.{ext}"));
        if candidate.exists() {
            if let Some(existing) = found {
                return Err(DataLoadError::ConflictingFormats {
                    a: existing,
                    b: candidate,
                });
            }
            found = Some(candidate);
        }
    }

    Ok(found)
}

/// Like [`find_data_file`], but returns an error if no file is found.
pub fn require_data_file(dir: &Path, base_name: &'static str) -> Result<PathBuf, DataLoadError> {
    find_data_file(dir, base_name)?.ok_or_else(|| DataLoadError::MissingRequired {
        file: base_name,
        dir: dir.to_path_buf(),
    })
}

// ===========================================================================
// Deserialization
// ===========================================================================

/// Read a file and deserialize it according to its format.
pub fn deserialize_file<T: DeserializeOwned>(path: &Path) -> Result<T, DataLoadError> {
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    let parse_error = |detail: String| DataLoadError::Parse {
        file: path.to_path_buf(),
        detail,
    };

    match format {
        Format::Ron => ron::from_str(&content).map_err(|e| parse_error(e.to_string())),
        Format::Json => serde_json::from_str(&content).map_err(|e| parse_error(e.to_string())),
        Format::Toml => toml::from_str(&content).map_err(|e| parse_error(e.to_string())),
    }
}

// ===========================================================================
// Name resolution helpers
// ===========================================================================

/// Look up a name in a map, returning an `UnresolvedRef` error if not found.
pub fn resolve_name<'a, V>(
    map: &'a HashMap<String, V>,
    name: &str,
    file: &Path,
    expected_kind: &'static str,
) -> Result<&'a V, DataLoadError> {
    map.get(name).ok_or_else(|| DataLoadError::UnresolvedRef {
        file: file.to_path_buf(),
        name: name.to_string(),
        expected_kind,
    })
}

/// Return a `DuplicateName` error if `name` is already in the map.
pub fn check_duplicate<V>(
    map: &HashMap<String, V>,
    name: &str,
    file: &Path,
) -> Result<(), DataLoadError> {
    if map.contains_key(name) {
        Err(DataLoadError::DuplicateName {
            file: file.to_path_buf(),
            name: name.to_string(),
        })
    } else {
        Ok(())
    }
}

// ===========================================================================
// Scenario
// ===========================================================================

/// A chip with its fluids and droplets, ready to simulate.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub builder: ChipBuilder,
    pub config: SimulationConfig,
    /// Ids assigned to the named channels of the chip file.
    pub channels: HashMap<String, ChannelId>,
    /// Ids assigned to the named fluids of the chip file.
    pub fluids: HashMap<String, FluidId>,
}

impl Scenario {
    pub fn channel(&self, name: &str) -> Option<ChannelId> {
        self.channels.get(name).copied()
    }

    pub fn fluid(&self, name: &str) -> Option<FluidId> {
        self.fluids.get(name).copied()
    }
}

/// Load a scenario from a directory.
///
/// `chip.{ron,toml,json}` is required. `simulation.{ron,toml,json}` is
/// optional and falls back to [`SimulationConfig::default`]. The
/// configuration is checked with [`SimulationConfig::validate`]; the chip
/// itself is not checked for validity, which happens when it runs.
pub fn load_scenario(dir: &Path) -> Result<Scenario, DataLoadError> {
    let chip_path = require_data_file(dir, "chip")?;
    let description: ChipDescription = deserialize_file(&chip_path)?;
    let (builder, channels, fluids) = build_chip(&description, &chip_path)?;

    let config = match find_data_file(dir, "simulation")? {
        Some(path) => {
            let config: SimulationConfig = deserialize_file(&path)?;
            config.validate()?;
            config
        }
        None => SimulationConfig::default(),
    };

    info!(
        chip = %description.name,
        channels = channels.len(),
        fluids = fluids.len(),
        droplets = description.droplets.len(),
        "loaded scenario"
    );

    Ok(Scenario {
        builder,
        config,
        channels,
        fluids,
    })
}

/// Load only a chip file.
pub fn load_chip(path: &Path) -> Result<ChipBuilder, DataLoadError> {
    let description: ChipDescription = deserialize_file(path)?;
    let (builder, _, _) = build_chip(&description, path)?;
    Ok(builder)
}

type BuiltChip = (
    ChipBuilder,
    HashMap<String, ChannelId>,
    HashMap<String, FluidId>,
);

/// Replay a description into builder calls, in file order: pumps, channels,
/// sinks and grounds, fluids, continuous phase, droplets.
///
/// Pumps come first so the reference layout keeps its ids (pump 0, then
/// channels from 1).
pub fn build_chip(description: &ChipDescription, file: &Path) -> Result<BuiltChip, DataLoadError> {
    let mut builder = ChipBuilder::new(description.name.clone());

    for pump in &description.flow_rate_pumps {
        builder.add_flow_rate_pump(NodeId(pump.node0), NodeId(pump.node1), pump.flow_rate)?;
    }
    for pump in &description.pressure_pumps {
        builder.add_pressure_pump(NodeId(pump.node0), NodeId(pump.node1), pump.pressure)?;
    }

    let mut channels = HashMap::new();
    for data in &description.channels {
        check_duplicate(&channels, &data.name, file)?;
        let id = builder.add_channel(
            NodeId(data.node0),
            NodeId(data.node1),
            data.height,
            data.width,
            data.length,
            data.channel_type,
        )?;
        debug!(channel = id.0, name = %data.name, "channel");
        channels.insert(data.name.clone(), id);
    }

    for &node in &description.sinks {
        builder.add_sink(NodeId(node));
    }
    for &node in &description.grounds {
        builder.add_ground(NodeId(node));
    }

    let mut fluids = HashMap::new();
    for data in &description.fluids {
        check_duplicate(&fluids, &data.name, file)?;
        let id = builder.add_fluid(data.viscosity, data.density, data.concentration)?;
        fluids.insert(data.name.clone(), id);
    }

    if let Some(name) = &description.continuous_phase {
        let id = *resolve_name(&fluids, name, file, "fluid")?;
        builder.set_continuous_phase(id)?;
    }

    for data in &description.droplets {
        let fluid = *resolve_name(&fluids, &data.fluid, file, "fluid")?;
        let channel = *resolve_name(&channels, &data.channel, file, "channel")?;
        builder.add_droplet(
            fluid,
            data.volume,
            data.time,
            ChannelPosition::new(channel, data.position),
        )?;
    }

    Ok((builder, channels, fluids))
}

// ===========================================================================
// Tests
// ===========================================================================
