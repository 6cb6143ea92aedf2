use std::fmt;

/// Sentinel byte that opens every sensor frame
pub const START_BYTE: u8 = 0xFF;

/// Default length of a sensor frame: start byte + 9 floats + CRC
pub const MSG_LEN: usize = 38;

/// Width of a single encoded field (little-endian f32)
pub const FIELD_LEN: usize = 4;

/// Default deployment constants
pub const WIN_SIZE: usize = 100;
pub const SAMPLE_RATE: f64 = 50.0; // Hz
pub const TEST_RATE: f64 = 10.0; // decisions per second

/// One sample of every configured sensor axis, plus the ground-truth label when the
/// source carries one. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    values: Box<[f64]>,
    label: Option<f64>,
}

impl RawSample {
    pub fn new(values: Vec<f64>) -> Self {
        Self {
            values: values.into_boxed_slice(),
            label: None,
        }
    }

    pub fn with_label(values: Vec<f64>, label: f64) -> Self {
        Self {
            values: values.into_boxed_slice(),
            label: Some(label),
        }
    }

    /// Builds a sample from decoded frame fields
    pub fn from_f32(fields: &[f32]) -> Self {
        Self::new(fields.iter().map(|&v| f64::from(v)).collect())
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Value of one channel; `None` when the index is outside this sample's arity
    pub fn get(&self, channel: usize) -> Option<f64> {
        self.values.get(channel).copied()
    }

    pub fn label(&self) -> Option<f64> {
        self.label
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Tri-state gait decision published once per completed cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    Walk,
    PreFog,
    Fog,
}

impl Decision {
    /// Severity scalar consumed by the actuation side
    pub fn severity(self) -> f64 {
        match self {
            Decision::Walk => 0.0,
            Decision::PreFog => 0.5,
            Decision::Fog => 1.0,
        }
    }

    /// Inverse of [`Decision::severity`], used when comparing against recorded labels
    pub fn from_severity(severity: f64) -> Option<Self> {
        if severity == 0.0 {
            Some(Decision::Walk)
        } else if severity == 0.5 {
            Some(Decision::PreFog)
        } else if severity == 1.0 {
            Some(Decision::Fog)
        } else {
            None
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Decision::Walk => "walk",
            Decision::PreFog => "pre-fog",
            Decision::Fog => "fog",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_encoding() {
        assert_eq!(Decision::Walk.severity(), 0.0);
        assert_eq!(Decision::PreFog.severity(), 0.5);
        assert_eq!(Decision::Fog.severity(), 1.0);
        assert_eq!(Decision::from_severity(0.5), Some(Decision::PreFog));
        assert_eq!(Decision::from_severity(0.25), None);
    }

    #[test]
    fn sample_from_frame_fields() {
        let sample = RawSample::from_f32(&[1.5, -2.0, 0.25]);
        assert_eq!(sample.values(), &[1.5, -2.0, 0.25]);
        assert_eq!(sample.get(1), Some(-2.0));
        assert_eq!(sample.get(3), None);
        assert_eq!(sample.label(), None);
    }
}
