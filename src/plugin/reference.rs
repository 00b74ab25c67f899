//! Built-in reference plugins.
//!
//! Addressed as `reference:<kind>`. `gain` is well behaved; the others each
//! misbehave in one specific way so the validator's failure paths can be
//! exercised without third-party binaries.

use std::time::Duration;

use super::{
    AudioBuffer, BusLayout, LoaderError, PluginDescription, PluginFormat, PluginInstance,
};

pub const REFERENCE_PREFIX: &str = "reference:";

const FORMAT_NAME: &str = "Reference";
const STATE_MAGIC: &[u8; 4] = b"PCRF";
const PARAMETER_NAMES: [&str; 2] = ["Gain", "Mix"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behaviour {
    /// Clean gain stage.
    Gain,
    /// Allocates on every processed block.
    Alloc,
    /// Faults inside the audio callback.
    Crash,
    /// Never returns from the audio callback.
    Hang,
    /// Exits the process from the audio callback.
    Exit,
    /// Produces NaN output.
    Nan,
}

impl Behaviour {
    fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "gain" => Some(Self::Gain),
            "alloc" => Some(Self::Alloc),
            "crash" => Some(Self::Crash),
            "hang" => Some(Self::Hang),
            "exit" => Some(Self::Exit),
            "nan" => Some(Self::Nan),
            _ => None,
        }
    }
}

/// Format adapter for the reference plugins.
pub struct ReferenceFormat;

impl ReferenceFormat {
    fn kind(target: &str) -> Option<&str> {
        target.strip_prefix(REFERENCE_PREFIX)
    }
}

impl PluginFormat for ReferenceFormat {
    fn name(&self) -> &'static str {
        FORMAT_NAME
    }

    fn handles(&self, target: &str) -> bool {
        target.starts_with(REFERENCE_PREFIX)
    }

    fn find_types(&self, target: &str) -> Result<Vec<PluginDescription>, LoaderError> {
        let kind = Self::kind(target).ok_or_else(|| LoaderError::NotFound(target.to_string()))?;
        // A target that exists but exposes nothing.
        if kind == "empty" {
            return Ok(Vec::new());
        }
        if Behaviour::from_kind(kind).is_none() {
            return Err(LoaderError::NotFound(target.to_string()));
        }

        Ok(vec![PluginDescription {
            name: format!("Reference {kind}"),
            format: FORMAT_NAME.to_string(),
            identifier: target.to_string(),
            manufacturer: "plugcheck".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            input_channels: 2,
            output_channels: 2,
        }])
    }

    fn create_instance(
        &self,
        description: &PluginDescription,
        sample_rate: f64,
        block_size: usize,
    ) -> Result<Box<dyn PluginInstance>, LoaderError> {
        if !(sample_rate.is_finite() && sample_rate > 0.0) || block_size == 0 {
            return Err(LoaderError::CreateFailed {
                name: description.name.clone(),
                reason: format!("unsupported configuration {sample_rate} Hz / {block_size}"),
            });
        }
        let behaviour = Self::kind(&description.identifier)
            .and_then(Behaviour::from_kind)
            .ok_or_else(|| LoaderError::CreateFailed {
                name: description.name.clone(),
                reason: "unknown reference plugin".to_string(),
            })?;

        Ok(Box::new(ReferencePlugin {
            name: description.name.clone(),
            behaviour,
            parameters: [0.5, 1.0],
            layout: BusLayout::STEREO,
            prepared: false,
            editor_open: false,
        }))
    }
}

struct ReferencePlugin {
    name: String,
    behaviour: Behaviour,
    parameters: [f32; 2],
    layout: BusLayout,
    prepared: bool,
    editor_open: bool,
}

impl ReferencePlugin {
    fn linear_gain(&self) -> f32 {
        let gain = self.parameters[0] * 2.0;
        let mix = self.parameters[1];
        gain * mix + (1.0 - mix)
    }
}

impl PluginInstance for ReferencePlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&mut self, sample_rate: f64, block_size: usize) -> Result<(), LoaderError> {
        if !(sample_rate.is_finite() && sample_rate > 0.0) || block_size == 0 {
            return Err(LoaderError::Operation {
                operation: "prepare",
                reason: format!("unsupported configuration {sample_rate} Hz / {block_size}"),
            });
        }
        self.prepared = true;
        Ok(())
    }

    fn release(&mut self) {
        self.prepared = false;
    }

    fn process(&mut self, buffer: &mut AudioBuffer) {
        match self.behaviour {
            Behaviour::Crash => fault(),
            Behaviour::Hang => loop {
                std::thread::park_timeout(Duration::from_secs(1));
            },
            Behaviour::Exit => std::process::exit(3),
            Behaviour::Nan => {
                buffer.fill(f32::NAN);
                return;
            }
            Behaviour::Alloc => {
                let scratch = std::hint::black_box(vec![0.0_f32; buffer.frames()]);
                drop(scratch);
            }
            Behaviour::Gain => {}
        }

        if !self.prepared {
            buffer.fill(0.0);
            return;
        }

        let gain = self.linear_gain();
        for channel in buffer.channels_mut() {
            for sample in channel {
                *sample *= gain;
            }
        }
    }

    fn parameter_count(&self) -> usize {
        self.parameters.len()
    }

    fn parameter_name(&self, index: usize) -> String {
        PARAMETER_NAMES
            .get(index)
            .map(|name| name.to_string())
            .unwrap_or_default()
    }

    fn parameter(&self, index: usize) -> f32 {
        self.parameters.get(index).copied().unwrap_or(0.0)
    }

    fn set_parameter(&mut self, index: usize, value: f32) {
        if let Some(slot) = self.parameters.get_mut(index) {
            *slot = if value.is_finite() {
                value.clamp(0.0, 1.0)
            } else {
                0.0
            };
        }
    }

    fn state(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(STATE_MAGIC.len() + self.parameters.len() * 4);
        data.extend_from_slice(STATE_MAGIC);
        for value in self.parameters {
            data.extend_from_slice(&value.to_le_bytes());
        }
        data
    }

    fn set_state(&mut self, data: &[u8]) -> Result<(), LoaderError> {
        let body = data
            .strip_prefix(STATE_MAGIC.as_slice())
            .filter(|body| body.len() == self.parameters.len() * 4)
            .ok_or_else(|| LoaderError::Operation {
                operation: "set_state",
                reason: format!("unrecognised state blob of {} bytes", data.len()),
            })?;

        for (slot, chunk) in self.parameters.iter_mut().zip(body.chunks_exact(4)) {
            *slot = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(())
    }

    fn bus_layout(&self) -> BusLayout {
        self.layout
    }

    fn set_bus_layout(&mut self, layout: BusLayout) -> bool {
        if layout == BusLayout::MONO || layout == BusLayout::STEREO {
            self.layout = layout;
            true
        } else {
            false
        }
    }

    fn has_editor(&self) -> bool {
        true
    }

    fn open_editor(&mut self) -> Result<(), LoaderError> {
        if self.editor_open {
            return Err(LoaderError::Operation {
                operation: "open_editor",
                reason: "editor already open".to_string(),
            });
        }
        self.editor_open = true;
        Ok(())
    }

    fn close_editor(&mut self) {
        self.editor_open = false;
    }
}

#[cfg(unix)]
fn fault() -> ! {
    // SAFETY: raising a signal has no memory-safety preconditions.
    unsafe {
        libc::raise(libc::SIGSEGV);
    }
    std::process::abort()
}

#[cfg(not(unix))]
fn fault() -> ! {
    std::process::abort()
}
