//! Plugin loader interface.
//!
//! Format adapters turn a target (file path or identifier) into plugin
//! descriptions and live instances. The validator only talks to plugins
//! through [`PluginFormat`] and [`PluginInstance`].

mod reference;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use reference::{ReferenceFormat, REFERENCE_PREFIX};

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("No plugin format can load {0}")]
    NoFormat(String),

    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Failed to create instance of {name}: {reason}")]
    CreateFailed { name: String, reason: String },

    #[error("{operation} failed: {reason}")]
    Operation {
        operation: &'static str,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One loadable plugin type found in a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescription {
    pub name: String,
    pub format: String,
    /// Target the description was discovered in.
    pub identifier: String,
    pub manufacturer: String,
    pub version: String,
    pub input_channels: u32,
    pub output_channels: u32,
}

impl fmt::Display for PluginDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} v{} by {} ({})",
            self.name, self.version, self.manufacturer, self.format
        )
    }
}

/// Channel counts of the main input and output buses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusLayout {
    pub input_channels: u32,
    pub output_channels: u32,
}

impl BusLayout {
    pub const MONO: Self = Self::symmetric(1);
    pub const STEREO: Self = Self::symmetric(2);

    pub const fn symmetric(channels: u32) -> Self {
        Self {
            input_channels: channels,
            output_channels: channels,
        }
    }

    /// Channels the processing buffer must carry.
    pub fn buffer_channels(&self) -> usize {
        self.input_channels.max(self.output_channels) as usize
    }
}

impl fmt::Display for BusLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in / {} out", self.input_channels, self.output_channels)
    }
}

/// Non-interleaved audio block handed to [`PluginInstance::process`].
///
/// Allocated up front so processing itself never needs the heap.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    channels: Vec<Vec<f32>>,
    frames: usize,
}

impl AudioBuffer {
    pub fn new(channels: usize, frames: usize) -> Self {
        Self {
            channels: vec![vec![0.0; frames]; channels],
            frames,
        }
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        &mut self.channels[index]
    }

    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut [f32]> {
        self.channels.iter_mut().map(Vec::as_mut_slice)
    }

    pub fn fill(&mut self, value: f32) {
        for channel in &mut self.channels {
            channel.fill(value);
        }
    }

    /// Absolute peak across all channels.
    pub fn peak(&self) -> f32 {
        self.channels
            .iter()
            .flat_map(|c| c.iter())
            .fold(0.0_f32, |peak, s| peak.max(s.abs()))
    }

    /// True if no sample is NaN or infinite.
    pub fn all_finite(&self) -> bool {
        self.channels.iter().flat_map(|c| c.iter()).all(|s| s.is_finite())
    }
}

/// A live plugin instance. Owned by exactly one session.
pub trait PluginInstance: Send {
    fn name(&self) -> &str;

    /// Allocate processing resources. Called before any `process`.
    fn prepare(&mut self, sample_rate: f64, block_size: usize) -> Result<(), LoaderError>;

    fn release(&mut self);

    /// Process one block in place. Must be real-time safe.
    fn process(&mut self, buffer: &mut AudioBuffer);

    fn latency_samples(&self) -> usize {
        0
    }

    fn parameter_count(&self) -> usize;

    fn parameter_name(&self, index: usize) -> String;

    /// Normalised value in `0.0..=1.0`.
    fn parameter(&self, index: usize) -> f32;

    fn set_parameter(&mut self, index: usize, value: f32);

    fn state(&self) -> Vec<u8>;

    fn set_state(&mut self, data: &[u8]) -> Result<(), LoaderError>;

    fn bus_layout(&self) -> BusLayout;

    /// Request a new main bus layout. Returns false if unsupported, in which
    /// case the current layout is unchanged.
    fn set_bus_layout(&mut self, layout: BusLayout) -> bool;

    fn has_editor(&self) -> bool;

    fn open_editor(&mut self) -> Result<(), LoaderError>;

    fn close_editor(&mut self);
}

/// A format adapter.
pub trait PluginFormat: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this format claims the target.
    fn handles(&self, target: &str) -> bool;

    fn find_types(&self, target: &str) -> Result<Vec<PluginDescription>, LoaderError>;

    fn create_instance(
        &self,
        description: &PluginDescription,
        sample_rate: f64,
        block_size: usize,
    ) -> Result<Box<dyn PluginInstance>, LoaderError>;
}

/// Dispatches targets to the registered formats, first match wins.
pub struct FormatManager {
    formats: Vec<Box<dyn PluginFormat>>,
}

impl FormatManager {
    pub fn new() -> Self {
        Self {
            formats: Vec::new(),
        }
    }

    /// Manager with every format built into this crate.
    pub fn with_builtin_formats() -> Self {
        let mut manager = Self::new();
        manager.register(Box::new(ReferenceFormat));
        manager
    }

    pub fn register(&mut self, format: Box<dyn PluginFormat>) {
        self.formats.push(format);
    }

    pub fn format_names(&self) -> Vec<&'static str> {
        self.formats.iter().map(|f| f.name()).collect()
    }

    fn format_for(&self, target: &str) -> Result<&dyn PluginFormat, LoaderError> {
        self.formats
            .iter()
            .find(|f| f.handles(target))
            .map(|f| f.as_ref())
            .ok_or_else(|| LoaderError::NoFormat(target.to_string()))
    }

    pub fn find_types(&self, target: &str) -> Result<Vec<PluginDescription>, LoaderError> {
        self.format_for(target)?.find_types(target)
    }

    pub fn create_instance(
        &self,
        description: &PluginDescription,
        sample_rate: f64,
        block_size: usize,
    ) -> Result<Box<dyn PluginInstance>, LoaderError> {
        let format = self
            .formats
            .iter()
            .find(|f| f.name() == description.format)
            .ok_or_else(|| LoaderError::NoFormat(description.identifier.clone()))?;
        format.create_instance(description, sample_rate, block_size)
    }
}

impl Default for FormatManager {
    fn default() -> Self {
        Self::with_builtin_formats()
    }
}
