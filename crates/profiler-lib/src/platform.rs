//! Cloud platform profiles
//!
//! The platform is chosen once at startup from configuration; everything that
//! differs between platforms hangs off the returned [`PlatformProfile`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Aws,
    CoreWeave,
    Azure,
    Gcp,
    #[default]
    Local,
}

const COREWEAVE_REGIONS: &[&str] = &["ORD1", "LGA1", "LAS1"];
const COREWEAVE_CPU_TYPES: &[&str] = &[
    "intel-xeon-v3",
    "intel-xeon-v4",
    "intel-xeon-scalable",
    "amd-epyc-rome",
    "amd-epyc-milan",
];
const COREWEAVE_GPU_TYPES: &[&str] = &[
    "A40",
    "RTX_A6000",
    "RTX_A5000",
    "RTX_A4000",
    "Quadro_RTX_5000",
    "Quadro_RTX_4000",
];

/// Static per-platform tables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformProfile {
    pub platform: Platform,
    pub regions: &'static [&'static str],
    pub cpu_types: &'static [&'static str],
    pub gpu_types: &'static [&'static str],
    /// API group/version used for HorizontalPodAutoscaler objects
    pub autoscaling_api_version: &'static str,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Aws => "aws",
            Platform::CoreWeave => "coreweave",
            Platform::Azure => "azure",
            Platform::Gcp => "gcp",
            Platform::Local => "local",
        }
    }

    pub fn profile(&self) -> PlatformProfile {
        match self {
            // CoreWeave clusters lag behind upstream and still serve v2beta2
            Platform::CoreWeave => PlatformProfile {
                platform: *self,
                regions: COREWEAVE_REGIONS,
                cpu_types: COREWEAVE_CPU_TYPES,
                gpu_types: COREWEAVE_GPU_TYPES,
                autoscaling_api_version: "autoscaling/v2beta2",
            },
            Platform::Local => PlatformProfile {
                platform: *self,
                regions: COREWEAVE_REGIONS,
                cpu_types: COREWEAVE_CPU_TYPES,
                gpu_types: COREWEAVE_GPU_TYPES,
                autoscaling_api_version: "autoscaling/v2",
            },
            Platform::Aws | Platform::Azure | Platform::Gcp => PlatformProfile {
                platform: *self,
                regions: &[],
                cpu_types: &[],
                gpu_types: &[],
                autoscaling_api_version: "autoscaling/v2",
            },
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aws" => Ok(Platform::Aws),
            "coreweave" => Ok(Platform::CoreWeave),
            "azure" => Ok(Platform::Azure),
            "gcp" => Ok(Platform::Gcp),
            "local" | "" => Ok(Platform::Local),
            other => Err(format!("unknown platform '{}'", other)),
        }
    }
}

impl PlatformProfile {
    pub fn is_valid_region(&self, region: &str) -> bool {
        self.regions.is_empty() || self.regions.contains(&region)
    }
}
