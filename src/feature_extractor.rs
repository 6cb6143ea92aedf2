use std::collections::HashMap;

use crate::schema::{Band, Feature, FeatureSchema};
use crate::spectral::{band_power, bin_range, freeze_index, BandLimits, BinRange, SpectrumAnalyzer};
use crate::stats::{self, Welford};
use crate::wavelet::{haar_dwt, HaarLevel};
use crate::window_buffer::Window;

/// Ordered feature values for one classifier, rebuilt every cycle
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector(Vec<f64>);

impl FeatureVector {
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.0
    }
}

impl AsRef<[f64]> for FeatureVector {
    fn as_ref(&self) -> &[f64] {
        &self.0
    }
}

pub struct FeatureExtractor {
    analyzer: SpectrumAnalyzer,
    sample_rate: f64,
    locomotion: BandLimits,
    freeze: BandLimits,
}

impl FeatureExtractor {
    pub fn new(sample_rate: f64, locomotion: BandLimits, freeze: BandLimits) -> Self {
        Self {
            analyzer: SpectrumAnalyzer::new(),
            sample_rate,
            locomotion,
            freeze,
        }
    }

    /// Starts a cycle over `window`. Channel series, spectra and wavelet levels are
    /// computed on first use and shared by every schema extracted from the cycle.
    pub fn cycle<'a, 'w>(&'a mut self, window: Window<'w>) -> CycleFeatures<'a, 'w> {
        let locomotion = bin_range(self.locomotion, self.sample_rate, window.len());
        let freeze = bin_range(self.freeze, self.sample_rate, window.len());
        CycleFeatures {
            analyzer: &mut self.analyzer,
            window,
            locomotion,
            freeze,
            channels: HashMap::new(),
        }
    }

    /// One-shot extraction of a single schema
    pub fn extract(&mut self, window: Window<'_>, schema: &FeatureSchema) -> FeatureVector {
        self.cycle(window).extract(schema)
    }
}

#[derive(Default)]
struct ChannelCache {
    series: Vec<f64>,
    power: Option<Vec<f64>>,
    dwt: Option<HaarLevel>,
}

/// Per-cycle feature state; dropped at the end of the cycle
pub struct CycleFeatures<'a, 'w> {
    analyzer: &'a mut SpectrumAnalyzer,
    window: Window<'w>,
    locomotion: BinRange,
    freeze: BinRange,
    channels: HashMap<usize, ChannelCache>,
}

impl CycleFeatures<'_, '_> {
    pub fn extract(&mut self, schema: &FeatureSchema) -> FeatureVector {
        FeatureVector(
            schema
                .features()
                .iter()
                .map(|feature| self.evaluate(feature))
                .collect(),
        )
    }

    fn evaluate(&mut self, feature: &Feature) -> f64 {
        match feature {
            Feature::Min(ch) => stats::min_max(self.series(*ch)).map_or(0.0, |(lo, _)| lo),
            Feature::Max(ch) => stats::min_max(self.series(*ch)).map_or(0.0, |(_, hi)| hi),
            Feature::Median(ch) => stats::median(self.series(*ch)),
            Feature::Mean(ch) => stats::mean(self.series(*ch)),
            Feature::Rms(ch) => stats::rms(self.series(*ch)),
            Feature::StdDev(ch) => Welford::from_slice(self.series(*ch))
                .sample_std()
                .unwrap_or(0.0),
            Feature::Variance(ch) => Welford::from_slice(self.series(*ch)).population_variance(),
            Feature::BandPower(ch, band) => {
                let range = match band {
                    Band::Locomotion => self.locomotion,
                    Band::Freeze => self.freeze,
                };
                band_power(self.power(*ch), range)
            }
            Feature::FreezeIndex(group) => {
                for &ch in group {
                    self.power(ch);
                }
                let spectra: Vec<&[f64]> = group
                    .iter()
                    .map(|ch| {
                        self.channels
                            .get(ch)
                            .and_then(|c| c.power.as_deref())
                            .unwrap_or_default()
                    })
                    .collect();
                freeze_index(&spectra, self.locomotion, self.freeze)
            }
            Feature::DwtApproxVariance(ch) => {
                Welford::from_slice(&self.dwt(*ch).approx).population_variance()
            }
            Feature::DwtApproxMean(ch) => stats::mean(&self.dwt(*ch).approx),
            Feature::DwtDetailKurtosis(ch) => stats::kurtosis(&self.dwt(*ch).detail),
        }
    }

    fn cache(&mut self, ch: usize) -> &mut ChannelCache {
        let window = self.window;
        self.channels.entry(ch).or_insert_with(|| ChannelCache {
            series: window.column(ch),
            ..Default::default()
        })
    }

    fn series(&mut self, ch: usize) -> &[f64] {
        &self.cache(ch).series
    }

    fn power(&mut self, ch: usize) -> &[f64] {
        let window = self.window;
        // Not via cache(): the analyzer borrow must stay disjoint from the map's.
        let cache = self.channels.entry(ch).or_insert_with(|| ChannelCache {
            series: window.column(ch),
            ..Default::default()
        });
        if cache.power.is_none() {
            cache.power = Some(self.analyzer.power_spectrum(&cache.series));
        }
        cache.power.as_deref().unwrap_or_default()
    }

    fn dwt(&mut self, ch: usize) -> &HaarLevel {
        let cache = self.cache(ch);
        cache.dwt.get_or_insert_with(|| haar_dwt(&cache.series))
    }
}
