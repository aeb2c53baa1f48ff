use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::app::adb::paths::sanitize_filename_component;
use crate::app::classifier::{DeviceType, DeviceTypeClassifier};
use crate::app::error::AppError;
use crate::app::models::Device;

pub const NUM_SHARDS_ARG: &str = "numShards";
pub const SHARD_INDEX_ARG: &str = "shardIndex";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardArguments {
    pub serial: String,
    pub shard_index: usize,
    pub shard_count: usize,
    pub device_type: DeviceType,
}

impl ShardArguments {
    /// `AndroidJUnitRunner` arguments. A single-device group runs everything,
    /// so no sharding arguments are emitted for it.
    pub fn to_instrumentation_args(&self) -> BTreeMap<String, String> {
        let mut args = BTreeMap::new();
        if self.shard_count > 1 {
            args.insert(NUM_SHARDS_ARG.to_string(), self.shard_count.to_string());
            args.insert(SHARD_INDEX_ARG.to_string(), self.shard_index.to_string());
        }
        args
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShardPolicy {
    /// Every device is one shard of a single partition.
    #[default]
    Uniform,
    /// Each device type gets its own partition of the full suite.
    PerDeviceType,
}

pub struct ShardArgumentsBuilder {
    classifier: Arc<dyn DeviceTypeClassifier>,
    policy: ShardPolicy,
}

impl ShardArgumentsBuilder {
    pub fn new(classifier: Arc<dyn DeviceTypeClassifier>, policy: ShardPolicy) -> Self {
        Self { classifier, policy }
    }

    pub fn build(&self, devices: &[Device], trace_id: &str) -> Result<Vec<ShardArguments>, AppError> {
        if devices.is_empty() {
            return Err(AppError::configuration(
                "No devices available to shard instrumentation tests across",
                trace_id,
            ));
        }
        ensure_distinct_devices(devices, trace_id)?;

        let types = devices
            .iter()
            .map(|device| self.classifier.classify(device))
            .collect::<Vec<_>>();

        let group_of = |device_type: DeviceType| match self.policy {
            ShardPolicy::Uniform => None,
            ShardPolicy::PerDeviceType => Some(device_type),
        };

        let mut group_sizes: HashMap<Option<DeviceType>, usize> = HashMap::new();
        for device_type in &types {
            *group_sizes.entry(group_of(*device_type)).or_default() += 1;
        }

        let mut next_index: HashMap<Option<DeviceType>, usize> = HashMap::new();
        let shards = devices
            .iter()
            .zip(types)
            .map(|(device, device_type)| {
                let group = group_of(device_type);
                let index = next_index.entry(group).or_default();
                let shard = ShardArguments {
                    serial: device.serial.clone(),
                    shard_index: *index,
                    shard_count: group_sizes[&group],
                    device_type,
                };
                *index += 1;
                shard
            })
            .collect();
        Ok(shards)
    }
}

/// Rejects repeated serials and serials whose per-device output directories
/// (named after the sanitized serial) would coincide.
pub fn ensure_distinct_devices(devices: &[Device], trace_id: &str) -> Result<(), AppError> {
    let mut seen = HashSet::new();
    let mut output_dirs: HashMap<String, &str> = HashMap::new();
    for device in devices {
        if !seen.insert(device.serial.as_str()) {
            return Err(AppError::configuration(
                format!("Device {} is listed more than once", device.serial),
                trace_id,
            ));
        }
        let dir = sanitize_filename_component(&device.serial);
        if let Some(other) = output_dirs.insert(dir.clone(), device.serial.as_str()) {
            return Err(AppError::configuration(
                format!(
                    "Devices {other} and {} would share the output directory {dir}",
                    device.serial
                ),
                trace_id,
            ));
        }
    }
    Ok(())
}

/// Shard assignments for one run, looked up by device serial.
#[derive(Debug, Clone, Default)]
pub struct ShardPlan {
    by_serial: HashMap<String, ShardArguments>,
    ordered: Vec<String>,
}

impl ShardPlan {
    pub fn new(shards: Vec<ShardArguments>) -> Self {
        let ordered = shards.iter().map(|shard| shard.serial.clone()).collect();
        let by_serial = shards
            .into_iter()
            .map(|shard| (shard.serial.clone(), shard))
            .collect();
        Self { by_serial, ordered }
    }

    pub fn for_serial(&self, serial: &str) -> Option<&ShardArguments> {
        self.by_serial.get(serial)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ShardArguments> {
        self.ordered.iter().filter_map(|serial| self.by_serial.get(serial))
    }
}
