//! Declarative channel layout and feature lists.
//!
//! Classifiers are order-sensitive, so a feature list is an ordered list of specs;
//! it is resolved once against the channel layout at startup.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Unknown channel '{0}' (not in the configured layout)")]
    UnknownChannel(String),

    #[error("Feature list is empty")]
    Empty,

    #[error("freeze_index needs at least one channel")]
    EmptyGroup,

    #[error("Duplicate channel name '{0}' in layout")]
    DuplicateChannel(String),
}

/// Names of the numeric fields carried by each sample, in wire order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelLayout {
    pub channels: Vec<String>,
    /// Whether text samples carry a trailing ground-truth label field
    #[serde(default)]
    pub has_label: bool,
}

impl ChannelLayout {
    /// Left/right foot angular velocity + acceleration, with ground truth
    pub fn dual_foot() -> Self {
        let channels = [
            "lwx", "lwy", "lwz", "lax", "lay", "laz", "rwx", "rwy", "rwz", "rax", "ray", "raz",
        ];
        Self {
            channels: channels.iter().map(|c| c.to_string()).collect(),
            has_label: true,
        }
    }

    /// Single 9-axis IMU as carried by the binary frames
    pub fn single_imu() -> Self {
        let channels = ["ax", "ay", "az", "gx", "gy", "gz", "mx", "my", "mz"];
        Self {
            channels: channels.iter().map(|c| c.to_string()).collect(),
            has_label: false,
        }
    }

    pub fn index_of(&self, name: &str) -> Result<usize, SchemaError> {
        self.channels
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| SchemaError::UnknownChannel(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        for (i, name) in self.channels.iter().enumerate() {
            if self.channels[..i].contains(name) {
                return Err(SchemaError::DuplicateChannel(name.clone()));
            }
        }
        Ok(())
    }
}

impl Default for ChannelLayout {
    fn default() -> Self {
        Self::dual_foot()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    Locomotion,
    Freeze,
}

/// One named scalar of a feature vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureSpec {
    Min { channel: String },
    Max { channel: String },
    Median { channel: String },
    Mean { channel: String },
    Rms { channel: String },
    StdDev { channel: String },
    Variance { channel: String },
    BandPower { channel: String, band: Band },
    FreezeIndex { channels: Vec<String> },
    DwtApproxVariance { channel: String },
    DwtApproxMean { channel: String },
    DwtDetailKurtosis { channel: String },
}

/// A [`FeatureSpec`] with channel names replaced by sample indices
#[derive(Debug, Clone, PartialEq)]
pub enum Feature {
    Min(usize),
    Max(usize),
    Median(usize),
    Mean(usize),
    Rms(usize),
    StdDev(usize),
    Variance(usize),
    BandPower(usize, Band),
    FreezeIndex(Vec<usize>),
    DwtApproxVariance(usize),
    DwtApproxMean(usize),
    DwtDetailKurtosis(usize),
}

impl FeatureSpec {
    fn resolve(&self, layout: &ChannelLayout) -> Result<Feature, SchemaError> {
        let idx = |name: &String| layout.index_of(name);
        Ok(match self {
            FeatureSpec::Min { channel } => Feature::Min(idx(channel)?),
            FeatureSpec::Max { channel } => Feature::Max(idx(channel)?),
            FeatureSpec::Median { channel } => Feature::Median(idx(channel)?),
            FeatureSpec::Mean { channel } => Feature::Mean(idx(channel)?),
            FeatureSpec::Rms { channel } => Feature::Rms(idx(channel)?),
            FeatureSpec::StdDev { channel } => Feature::StdDev(idx(channel)?),
            FeatureSpec::Variance { channel } => Feature::Variance(idx(channel)?),
            FeatureSpec::BandPower { channel, band } => Feature::BandPower(idx(channel)?, *band),
            FeatureSpec::FreezeIndex { channels } => {
                if channels.is_empty() {
                    return Err(SchemaError::EmptyGroup);
                }
                Feature::FreezeIndex(channels.iter().map(idx).collect::<Result<_, _>>()?)
            }
            FeatureSpec::DwtApproxVariance { channel } => {
                Feature::DwtApproxVariance(idx(channel)?)
            }
            FeatureSpec::DwtApproxMean { channel } => Feature::DwtApproxMean(idx(channel)?),
            FeatureSpec::DwtDetailKurtosis { channel } => {
                Feature::DwtDetailKurtosis(idx(channel)?)
            }
        })
    }
}

impl fmt::Display for FeatureSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureSpec::Min { channel } => write!(f, "min({channel})"),
            FeatureSpec::Max { channel } => write!(f, "max({channel})"),
            FeatureSpec::Median { channel } => write!(f, "median({channel})"),
            FeatureSpec::Mean { channel } => write!(f, "mean({channel})"),
            FeatureSpec::Rms { channel } => write!(f, "rms({channel})"),
            FeatureSpec::StdDev { channel } => write!(f, "std_dev({channel})"),
            FeatureSpec::Variance { channel } => write!(f, "variance({channel})"),
            FeatureSpec::BandPower { channel, band } => {
                let band = match band {
                    Band::Locomotion => "locomotion",
                    Band::Freeze => "freeze",
                };
                write!(f, "band_power({channel}, {band})")
            }
            FeatureSpec::FreezeIndex { channels } => {
                write!(f, "freeze_index({})", channels.join(", "))
            }
            FeatureSpec::DwtApproxVariance { channel } => {
                write!(f, "dwt_approx_variance({channel})")
            }
            FeatureSpec::DwtApproxMean { channel } => write!(f, "dwt_approx_mean({channel})"),
            FeatureSpec::DwtDetailKurtosis { channel } => {
                write!(f, "dwt_detail_kurtosis({channel})")
            }
        }
    }
}

/// Resolved, ordered feature list
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSchema {
    features: Vec<Feature>,
    names: Vec<String>,
}

impl FeatureSchema {
    pub fn compile(specs: &[FeatureSpec], layout: &ChannelLayout) -> Result<Self, SchemaError> {
        if specs.is_empty() {
            return Err(SchemaError::Empty);
        }
        let features = specs
            .iter()
            .map(|spec| spec.resolve(layout))
            .collect::<Result<Vec<_>, _>>()?;
        let names = specs.iter().map(|spec| spec.to_string()).collect();
        Ok(Self { features, names })
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Cheap time-domain set for the pre-freeze classifier: nine features per foot,
/// left then right.
pub fn default_pre_fog_features() -> Vec<FeatureSpec> {
    ["l", "r"]
        .iter()
        .flat_map(|side| {
            let ch = |axis: &str| format!("{side}{axis}");
            vec![
                FeatureSpec::Min { channel: ch("az") },
                FeatureSpec::Max { channel: ch("az") },
                FeatureSpec::Min { channel: ch("ax") },
                FeatureSpec::Max { channel: ch("wx") },
                FeatureSpec::Max { channel: ch("wy") },
                FeatureSpec::Max { channel: ch("ay") },
                FeatureSpec::Median { channel: ch("ay") },
                FeatureSpec::Max { channel: ch("ax") },
                FeatureSpec::Min { channel: ch("ay") },
            ]
        })
        .collect()
}

/// Spectral/wavelet set for the freeze classifier: nine features per foot,
/// left then right.
pub fn default_fog_features() -> Vec<FeatureSpec> {
    ["l", "r"]
        .iter()
        .flat_map(|side| {
            let ch = |axis: &str| format!("{side}{axis}");
            vec![
                FeatureSpec::BandPower {
                    channel: ch("wy"),
                    band: Band::Locomotion,
                },
                FeatureSpec::FreezeIndex {
                    channels: vec![ch("wx"), ch("wy"), ch("wz")],
                },
                FeatureSpec::DwtApproxVariance { channel: ch("wy") },
                FeatureSpec::BandPower {
                    channel: ch("wz"),
                    band: Band::Locomotion,
                },
                FeatureSpec::FreezeIndex {
                    channels: vec![ch("ax"), ch("ay"), ch("az")],
                },
                FeatureSpec::Variance { channel: ch("wy") },
                FeatureSpec::DwtApproxMean { channel: ch("ay") },
                FeatureSpec::DwtDetailKurtosis { channel: ch("az") },
                FeatureSpec::BandPower {
                    channel: ch("wx"),
                    band: Band::Locomotion,
                },
            ]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schemas_resolve_against_dual_foot_layout() {
        let layout = ChannelLayout::dual_foot();
        let pre = FeatureSchema::compile(&default_pre_fog_features(), &layout).unwrap();
        let fog = FeatureSchema::compile(&default_fog_features(), &layout).unwrap();

        assert_eq!(pre.len(), 18);
        assert_eq!(fog.len(), 18);
        assert_eq!(pre.features()[0], Feature::Min(5));
        assert_eq!(pre.features()[9], Feature::Min(11));
        assert_eq!(fog.features()[1], Feature::FreezeIndex(vec![0, 1, 2]));
        assert_eq!(fog.names()[13], "freeze_index(rax, ray, raz)");
    }

    #[test]
    fn unknown_channel_is_rejected() {
        let specs = vec![FeatureSpec::Max {
            channel: "lwx".into(),
        }];
        let err = FeatureSchema::compile(&specs, &ChannelLayout::single_imu()).unwrap_err();
        assert_eq!(err, SchemaError::UnknownChannel("lwx".into()));
    }

    #[test]
    fn empty_lists_are_rejected() {
        let layout = ChannelLayout::single_imu();
        assert_eq!(
            FeatureSchema::compile(&[], &layout).unwrap_err(),
            SchemaError::Empty
        );
        let specs = vec![FeatureSpec::FreezeIndex { channels: vec![] }];
        assert_eq!(
            FeatureSchema::compile(&specs, &layout).unwrap_err(),
            SchemaError::EmptyGroup
        );
    }

    #[test]
    fn duplicate_layout_channels() {
        let layout = ChannelLayout {
            channels: vec!["ax".into(), "ay".into(), "ax".into()],
            has_label: false,
        };
        assert_eq!(
            layout.validate(),
            Err(SchemaError::DuplicateChannel("ax".into()))
        );
    }

    #[test]
    fn specs_deserialize_from_tagged_tables() {
        #[derive(Deserialize)]
        struct Wrapper {
            features: Vec<FeatureSpec>,
        }

        let parsed: Wrapper = toml::from_str(
            r#"
            [[features]]
            kind = "band_power"
            channel = "gy"
            band = "freeze"

            [[features]]
            kind = "freeze_index"
            channels = ["ax", "ay", "az"]
            "#,
        )
        .unwrap();

        assert_eq!(
            parsed.features[0],
            FeatureSpec::BandPower {
                channel: "gy".into(),
                band: Band::Freeze
            }
        );
        assert_eq!(parsed.features[1].to_string(), "freeze_index(ax, ay, az)");
    }
}
