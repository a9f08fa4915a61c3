//! Hydraulic resistance models.
//!
//! A model maps channel geometry to a resistance and, optionally, adds a
//! contribution for every droplet inside a channel. Models are selected by a
//! numeric selector kept in the simulation result for interoperability.
//!
//! # Variants
//!
//! - `0` -- [`RectangularDuct`]: 1-D Hagen–Poiseuille approximation for a
//!   rectangular cross-section with the series correction factor
//!   `a = 12 / (1 - 192 h tanh(πw / 2h) / (π⁵ w))`.
//! - `1` -- [`VolumeModel`]: resistance equal to the channel volume. Handy for
//!   tests because the numbers are easy to predict.

use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::chip::{Channel, Chip};
use crate::id::ChannelId;

/// Maps channel geometry to hydraulic resistance.
pub trait ResistanceModel: fmt::Debug {
    /// Resistance of the channel filled with continuous phase.
    fn channel_resistance(&self, channel: &Channel) -> f64;

    /// Extra resistance caused by `volume_inside` of droplet in the channel.
    fn droplet_resistance(&self, channel: &Channel, volume_inside: f64) -> f64;
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

/// Unknown numeric resistance-model selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown resistance model selector: {0}")]
pub struct UnknownResistanceModel(pub u8);

/// Numeric selector of the active resistance model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ResistanceModelKind {
    #[default]
    RectangularDuct,
    Volume,
}

impl From<ResistanceModelKind> for u8 {
    fn from(kind: ResistanceModelKind) -> u8 {
        match kind {
            ResistanceModelKind::RectangularDuct => 0,
            ResistanceModelKind::Volume => 1,
        }
    }
}

impl TryFrom<u8> for ResistanceModelKind {
    type Error = UnknownResistanceModel;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ResistanceModelKind::RectangularDuct),
            1 => Ok(ResistanceModelKind::Volume),
            other => Err(UnknownResistanceModel(other)),
        }
    }
}

impl ResistanceModelKind {
    /// Instantiate the model for a continuous phase of the given viscosity.
    pub fn build(self, continuous_viscosity: f64) -> Box<dyn ResistanceModel> {
        match self {
            ResistanceModelKind::RectangularDuct => {
                Box::new(RectangularDuct::new(continuous_viscosity))
            }
            ResistanceModelKind::Volume => Box::new(VolumeModel),
        }
    }
}

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

/// 1-D rectangular duct model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RectangularDuct {
    pub viscosity: f64,
}

impl RectangularDuct {
    pub fn new(viscosity: f64) -> Self {
        Self { viscosity }
    }

    /// Shape factor of a `width` × `height` cross-section.
    pub fn factor(width: f64, height: f64) -> f64 {
        12.0 / (1.0 - 192.0 * height * (PI * width / (2.0 * height)).tanh() / (PI.powi(5) * width))
    }

    fn per_length(&self, channel: &Channel) -> f64 {
        Self::factor(channel.width, channel.height) * self.viscosity
            / (channel.width * channel.height.powi(3))
    }
}

impl ResistanceModel for RectangularDuct {
    fn channel_resistance(&self, channel: &Channel) -> f64 {
        channel.length * self.per_length(channel)
    }

    fn droplet_resistance(&self, channel: &Channel, volume_inside: f64) -> f64 {
        let droplet_length = volume_inside / channel.area();
        3.0 * droplet_length * self.per_length(channel)
    }
}

/// Test model: resistance equals channel volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VolumeModel;

impl ResistanceModel for VolumeModel {
    fn channel_resistance(&self, channel: &Channel) -> f64 {
        channel.volume()
    }

    fn droplet_resistance(&self, channel: &Channel, volume_inside: f64) -> f64 {
        3.0 * channel.area() * volume_inside
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Total resistance of every channel: geometric resistance plus the
/// contribution of each `(channel, droplet volume inside)` entry.
pub fn channel_resistances(
    chip: &Chip,
    model: &dyn ResistanceModel,
    droplet_volumes: impl IntoIterator<Item = (ChannelId, f64)>,
) -> BTreeMap<ChannelId, f64> {
    let mut resistances: BTreeMap<ChannelId, f64> = chip
        .channels()
        .map(|c| (c.id, model.channel_resistance(c)))
        .collect();
    for (id, volume) in droplet_volumes {
        if let (Some(channel), Some(r)) = (chip.channel(id), resistances.get_mut(&id)) {
            *r += model.droplet_resistance(channel, volume);
        }
    }
    resistances
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{channel_width, reference_chip};

    fn relative_eq(a: f64, b: f64, tol: f64) -> bool {
        ((a - b) / b).abs() < tol
    }

    // -----------------------------------------------------------------------
    // Test 1: Duct resistance for the reference geometry
    // -----------------------------------------------------------------------
    #[test]
    fn duct_resistance_reference_geometry() {
        let chip = reference_chip();
        let model = RectangularDuct::new(1e-3);
        let channel = chip.channel(ChannelId(1)).unwrap();
        // q * R of the terminal channel gives the 164.2466 Pa of node 4.
        let r = model.channel_resistance(channel);
        assert!(relative_eq(3e-11 * r, 164.246601, 1e-6), "R = {r}");
    }

    // -----------------------------------------------------------------------
    // Test 2: Droplet contribution is three channel-lengths per droplet length
    // -----------------------------------------------------------------------
    #[test]
    fn duct_droplet_resistance_scales_with_length() {
        let chip = reference_chip();
        let model = RectangularDuct::new(1e-3);
        let channel = chip.channel(ChannelId(1)).unwrap();
        let w = channel_width();
        let volume = 1.5 * w * w * channel.height;
        let r_drop = model.droplet_resistance(channel, volume);
        let r_chan = model.channel_resistance(channel);
        assert!(relative_eq(r_drop, 0.45 * r_chan, 1e-12));
    }

    // -----------------------------------------------------------------------
    // Test 3: Volume model
    // -----------------------------------------------------------------------
    #[test]
    fn volume_model_matches_volume() {
        let chip = reference_chip();
        let channel = chip.channel(ChannelId(2)).unwrap();
        assert_eq!(VolumeModel.channel_resistance(channel), channel.volume());
        assert_eq!(
            VolumeModel.droplet_resistance(channel, 2.0),
            3.0 * channel.area() * 2.0
        );
    }

    // -----------------------------------------------------------------------
    // Test 4: Selector round trip
    // -----------------------------------------------------------------------
    #[test]
    fn selector_is_numeric() {
        assert_eq!(serde_json::to_string(&ResistanceModelKind::Volume).unwrap(), "1");
        let kind: ResistanceModelKind = serde_json::from_str("0").unwrap();
        assert_eq!(kind, ResistanceModelKind::RectangularDuct);
        assert!(serde_json::from_str::<ResistanceModelKind>("7").is_err());
        assert_eq!(ResistanceModelKind::try_from(7), Err(UnknownResistanceModel(7)));
    }

    // -----------------------------------------------------------------------
    // Test 5: Aggregation adds droplet contributions per channel
    // -----------------------------------------------------------------------
    #[test]
    fn aggregation_adds_droplets() {
        let chip = reference_chip();
        let base = channel_resistances(&chip, &VolumeModel, []);
        let loaded = channel_resistances(
            &chip,
            &VolumeModel,
            [(ChannelId(1), 1e-13), (ChannelId(1), 1e-13), (ChannelId(99), 1.0)],
        );
        let channel = chip.channel(ChannelId(1)).unwrap();
        let expected = base[&ChannelId(1)] + 2.0 * 3.0 * channel.area() * 1e-13;
        assert!(relative_eq(loaded[&ChannelId(1)], expected, 1e-12));
        assert_eq!(loaded[&ChannelId(2)], base[&ChannelId(2)]);
        assert_eq!(loaded.len(), chip.channel_count());
    }

    // -----------------------------------------------------------------------
    // Test 6: Resistance is strictly positive for valid geometry
    // -----------------------------------------------------------------------
    #[test]
    fn duct_resistance_positive_across_aspect_ratios() {
        let model = RectangularDuct::new(1e-3);
        for (w, h) in [(1e-4, 1e-6), (1e-4, 1e-4), (1e-6, 1e-4), (5e-5, 3e-5)] {
            let channel = Channel {
                id: ChannelId(0),
                name: String::new(),
                node0_id: crate::id::NodeId(0),
                node1_id: crate::id::NodeId(1),
                width: w,
                height: h,
                length: 1e-3,
                channel_type: crate::chip::ChannelType::Normal,
            };
            let r = model.channel_resistance(&channel);
            assert!(r.is_finite() && r > 0.0, "w={w} h={h} r={r}");
        }
    }
}
