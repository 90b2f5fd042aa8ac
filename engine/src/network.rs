//! Network quality classification.

use crate::Timestamp;
use serde::{Deserialize, Serialize};

/// Effective connection type as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EffectiveType {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

impl EffectiveType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectiveType::Slow2g => "slow-2g",
            EffectiveType::TwoG => "2g",
            EffectiveType::ThreeG => "3g",
            EffectiveType::FourG => "4g",
            EffectiveType::Unknown => "unknown",
        }
    }

    /// Parse a platform string. Anything unrecognized is `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "slow-2g" => EffectiveType::Slow2g,
            "2g" => EffectiveType::TwoG,
            "3g" => EffectiveType::ThreeG,
            "4g" => EffectiveType::FourG,
            _ => EffectiveType::Unknown,
        }
    }

    /// Typical downlink in Mbps for samples without a usable throughput
    /// measurement.
    pub fn nominal_downlink(&self) -> f64 {
        match self {
            EffectiveType::FourG => 20.0,
            EffectiveType::ThreeG => 1.5,
            EffectiveType::TwoG => 0.25,
            EffectiveType::Slow2g => 0.05,
            EffectiveType::Unknown => 0.0,
        }
    }

    /// Rough type for a measured round trip time.
    pub fn from_rtt(rtt_ms: u64) -> Self {
        match rtt_ms {
            0..=100 => EffectiveType::FourG,
            101..=400 => EffectiveType::ThreeG,
            401..=1400 => EffectiveType::TwoG,
            _ => EffectiveType::Slow2g,
        }
    }
}

/// Link characteristics of one sample. Replaced wholesale on each sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkQualityMetrics {
    /// Mbps
    pub downlink: f64,
    pub effective_type: EffectiveType,
    /// Milliseconds
    pub rtt: u64,
    pub save_data: bool,
    pub timestamp: Timestamp,
}

/// Coarse network quality. Ordered from worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkQuality {
    #[default]
    Offline,
    Poor,
    Good,
    Excellent,
}

impl NetworkQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkQuality::Offline => "OFFLINE",
            NetworkQuality::Poor => "POOR",
            NetworkQuality::Good => "GOOD",
            NetworkQuality::Excellent => "EXCELLENT",
        }
    }

    pub fn is_online(&self) -> bool {
        *self != NetworkQuality::Offline
    }
}

impl std::fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One connectivity observation from the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivitySample {
    pub online: bool,
    pub metrics: Option<NetworkQualityMetrics>,
}

impl ConnectivitySample {
    pub fn offline() -> Self {
        Self {
            online: false,
            metrics: None,
        }
    }

    /// Online without link metrics.
    pub fn online() -> Self {
        Self {
            online: true,
            metrics: None,
        }
    }

    pub fn with_metrics(metrics: NetworkQualityMetrics) -> Self {
        Self {
            online: true,
            metrics: Some(metrics),
        }
    }
}

/// Classify a sample.
pub fn classify(online: bool, metrics: Option<&NetworkQualityMetrics>) -> NetworkQuality {
    if !online {
        return NetworkQuality::Offline;
    }
    let Some(m) = metrics else {
        return NetworkQuality::Good;
    };
    match m.effective_type {
        EffectiveType::FourG if m.downlink > 10.0 => NetworkQuality::Excellent,
        EffectiveType::FourG => NetworkQuality::Good,
        EffectiveType::ThreeG if m.downlink > 1.0 => NetworkQuality::Good,
        _ => NetworkQuality::Poor,
    }
}

/// A change of classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityTransition {
    pub from: NetworkQuality,
    pub to: NetworkQuality,
}

impl QualityTransition {
    /// Offline to any online state.
    pub fn came_online(&self) -> bool {
        !self.from.is_online() && self.to.is_online()
    }

    pub fn went_offline(&self) -> bool {
        self.from.is_online() && !self.to.is_online()
    }
}

/// Tracks the latest sample and its classification.
///
/// Starts `Offline` until the first sample arrives.
#[derive(Debug, Clone, Default)]
pub struct NetworkMonitor {
    online: bool,
    metrics: Option<NetworkQualityMetrics>,
    quality: NetworkQuality,
}

impl NetworkMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample. Returns the transition if the quality changed.
    pub fn observe(&mut self, sample: ConnectivitySample) -> Option<QualityTransition> {
        let quality = classify(sample.online, sample.metrics.as_ref());
        self.online = sample.online;
        self.metrics = sample.metrics;

        let from = std::mem::replace(&mut self.quality, quality);
        (from != quality).then_some(QualityTransition { from, to: quality })
    }

    pub fn quality(&self) -> NetworkQuality {
        self.quality
    }

    pub fn is_online(&self) -> bool {
        self.quality.is_online()
    }

    pub fn metrics(&self) -> Option<&NetworkQualityMetrics> {
        self.metrics.as_ref()
    }

    /// Whether the platform asked to save data.
    pub fn save_data(&self) -> bool {
        self.metrics.as_ref().is_some_and(|m| m.save_data)
    }
}
