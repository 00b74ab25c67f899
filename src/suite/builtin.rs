//! The built-in validation suite.

use std::f32::consts::TAU;
use std::sync::Arc;

use rand::Rng;

use super::{PluginTestCase, RegistryError, TestRegistry};
use crate::engine::TestContext;
use crate::plugin::{AudioBuffer, BusLayout, PluginInstance};

const PROCESS_BLOCKS: usize = 32;
const REALTIME_BLOCKS: usize = 64;

/// Register every built-in case in the order they should run.
pub fn register_builtin(registry: &mut TestRegistry) -> Result<(), RegistryError> {
    let cases: [Arc<dyn PluginTestCase>; 8] = [
        Arc::new(PluginInfo),
        Arc::new(BasicBus),
        Arc::new(PluginState),
        Arc::new(EditorLifecycle),
        Arc::new(AudioProcessing),
        Arc::new(Automation),
        Arc::new(FuzzParameters),
        Arc::new(RealtimeAllocations),
    ];
    for case in cases {
        registry.register(case)?;
    }
    Ok(())
}

fn fill_sine(buffer: &mut AudioBuffer, sample_rate: f64, offset: usize) {
    let step = 440.0 / sample_rate as f32;
    for channel in buffer.channels_mut() {
        for (i, sample) in channel.iter_mut().enumerate() {
            *sample = 0.5 * (TAU * step * (offset + i) as f32).sin();
        }
    }
}

fn prepare_or_fail(plugin: &mut dyn PluginInstance, ctx: &mut TestContext) -> bool {
    match plugin.prepare(ctx.sample_rate(), ctx.block_size()) {
        Ok(()) => true,
        Err(e) => {
            ctx.fail(format!("Failed to prepare plugin: {e}"));
            false
        }
    }
}

fn process_buffer(plugin: &dyn PluginInstance, ctx: &TestContext) -> AudioBuffer {
    let channels = plugin.bus_layout().buffer_channels().max(1);
    AudioBuffer::new(channels, ctx.block_size())
}

/// Logs the plugin's basic properties.
pub struct PluginInfo;

impl PluginTestCase for PluginInfo {
    fn name(&self) -> &str {
        "Plugin info"
    }

    fn min_strictness(&self) -> u8 {
        1
    }

    fn run(&self, plugin: &mut dyn PluginInstance, ctx: &mut TestContext) {
        ctx.log(format!("Plugin name: {}", plugin.name()));
        ctx.log(format!("Bus layout: {}", plugin.bus_layout()));
        ctx.log(format!("Latency: {} samples", plugin.latency_samples()));
        ctx.log(format!("Parameters: {}", plugin.parameter_count()));
        ctx.expect(!plugin.name().trim().is_empty(), "Plugin name is empty");

        for index in 0..plugin.parameter_count() {
            let name = plugin.parameter_name(index);
            ctx.log(format!("  {index}: {name} = {}", plugin.parameter(index)));
            ctx.expect(!name.trim().is_empty(), format!("Parameter {index} has no name"));
        }
    }
}

/// Queries the bus layout and requests mono and stereo.
pub struct BasicBus;

impl PluginTestCase for BasicBus {
    fn name(&self) -> &str {
        "Basic bus"
    }

    fn min_strictness(&self) -> u8 {
        1
    }

    fn run(&self, plugin: &mut dyn PluginInstance, ctx: &mut TestContext) {
        let original = plugin.bus_layout();
        ctx.expect(original.output_channels > 0, "Plugin has no output channels");

        for candidate in [BusLayout::MONO, BusLayout::STEREO] {
            let before = plugin.bus_layout();
            if plugin.set_bus_layout(candidate) {
                ctx.log(format!("Accepted layout {candidate}"));
                ctx.expect_eq(plugin.bus_layout(), candidate, "layout after accepted change");
            } else {
                ctx.log(format!("Rejected layout {candidate}"));
                ctx.expect_eq(plugin.bus_layout(), before, "layout after rejected change");
            }
        }

        if plugin.bus_layout() != original {
            ctx.expect(
                plugin.set_bus_layout(original),
                format!("Could not restore original layout {original}"),
            );
        }
    }
}

/// Saves state, scrambles parameters and checks the state restores them.
pub struct PluginState;

impl PluginTestCase for PluginState {
    fn name(&self) -> &str {
        "Plugin state"
    }

    fn min_strictness(&self) -> u8 {
        2
    }

    fn run(&self, plugin: &mut dyn PluginInstance, ctx: &mut TestContext) {
        let saved = plugin.state();
        let expected: Vec<f32> = (0..plugin.parameter_count())
            .map(|i| plugin.parameter(i))
            .collect();
        ctx.log(format!("State size: {} bytes", saved.len()));

        for index in 0..plugin.parameter_count() {
            let value = ctx.rng().gen_range(0.0..=1.0);
            plugin.set_parameter(index, value);
        }

        if let Err(e) = plugin.set_state(&saved) {
            ctx.fail(format!("Failed to restore saved state: {e}"));
            return;
        }
        for (index, want) in expected.iter().enumerate() {
            let got = plugin.parameter(index);
            ctx.expect(
                (got - want).abs() < 1e-4,
                format!("Parameter {index} restored as {got}, expected {want}"),
            );
        }

        let Some(path) = ctx.data_file().map(|p| p.to_path_buf()) else {
            return;
        };
        match std::fs::read(&path) {
            Ok(data) => {
                ctx.log(format!("Loading {} bytes from {}", data.len(), path.display()));
                match plugin.set_state(&data) {
                    Ok(()) => ctx.log("Data file accepted as state"),
                    Err(e) => ctx.log(format!("Data file rejected: {e}")),
                }
                ctx.expect(
                    plugin.set_state(&saved).is_ok(),
                    "State could not be restored after loading the data file",
                );
            }
            Err(e) => ctx.fail(format!("Could not read data file {}: {e}", path.display())),
        }
    }
}

/// Opens and closes the editor twice.
pub struct EditorLifecycle;

impl PluginTestCase for EditorLifecycle {
    fn name(&self) -> &str {
        "Editor"
    }

    fn min_strictness(&self) -> u8 {
        2
    }

    fn requires_gui(&self) -> bool {
        true
    }

    fn run(&self, plugin: &mut dyn PluginInstance, ctx: &mut TestContext) {
        if !plugin.has_editor() {
            ctx.log("No editor");
            return;
        }
        for attempt in 1..=2 {
            match plugin.open_editor() {
                Ok(()) => {
                    ctx.log(format!("Editor opened ({attempt})"));
                    ctx.pass();
                    plugin.close_editor();
                }
                Err(e) => {
                    ctx.fail(format!("Failed to open editor: {e}"));
                    return;
                }
            }
        }
    }
}

/// Processes a sine signal and checks the output stays finite.
pub struct AudioProcessing;

impl PluginTestCase for AudioProcessing {
    fn name(&self) -> &str {
        "Audio processing"
    }

    fn min_strictness(&self) -> u8 {
        3
    }

    fn run(&self, plugin: &mut dyn PluginInstance, ctx: &mut TestContext) {
        if !prepare_or_fail(plugin, ctx) {
            return;
        }
        let mut buffer = process_buffer(plugin, ctx);
        let sample_rate = ctx.sample_rate();
        let block_size = ctx.block_size();
        ctx.log(format!("Processing {PROCESS_BLOCKS} blocks of {block_size} samples"));

        let mut bad_block = None;
        for block in 0..PROCESS_BLOCKS {
            fill_sine(&mut buffer, sample_rate, block * block_size);
            {
                let _window = ctx.realtime_window();
                plugin.process(&mut buffer);
            }
            if !buffer.all_finite() {
                bad_block = Some(block);
                break;
            }
        }
        match bad_block {
            Some(block) => ctx.fail(format!("Non-finite output in block {block}")),
            None => {
                ctx.pass();
                ctx.log(format!("Output peak: {:.3}", buffer.peak()));
            }
        }

        buffer.fill(0.0);
        plugin.process(&mut buffer);
        ctx.expect(buffer.all_finite(), "Non-finite output for silent input");
        plugin.release();
    }
}

/// Changes parameters between blocks while processing.
pub struct Automation;

impl PluginTestCase for Automation {
    fn name(&self) -> &str {
        "Automation"
    }

    fn min_strictness(&self) -> u8 {
        3
    }

    fn run(&self, plugin: &mut dyn PluginInstance, ctx: &mut TestContext) {
        let count = plugin.parameter_count();
        if count == 0 {
            ctx.log("No parameters to automate");
            return;
        }
        if !prepare_or_fail(plugin, ctx) {
            return;
        }
        let mut buffer = process_buffer(plugin, ctx);
        let sample_rate = ctx.sample_rate();
        let block_size = ctx.block_size();

        let mut bad_block = None;
        for block in 0..PROCESS_BLOCKS {
            let index = ctx.rng().gen_range(0..count);
            let value: f32 = ctx.rng().gen_range(0.0..=1.0);
            fill_sine(&mut buffer, sample_rate, block * block_size);
            {
                let _window = ctx.realtime_window();
                plugin.set_parameter(index, value);
                plugin.process(&mut buffer);
            }
            if !buffer.all_finite() {
                bad_block = Some((block, index, value));
                break;
            }
        }
        match bad_block {
            Some((block, index, value)) => ctx.fail(format!(
                "Non-finite output in block {block} after setting parameter {index} to {value}"
            )),
            None => ctx.pass(),
        }
        plugin.release();
    }
}

/// Feeds extreme and random parameter values.
pub struct FuzzParameters;

const EXTREME_VALUES: [f32; 7] = [0.0, 1.0, 0.5, -1.0, 2.0, f32::NAN, f32::INFINITY];

impl PluginTestCase for FuzzParameters {
    fn name(&self) -> &str {
        "Fuzz parameters"
    }

    fn min_strictness(&self) -> u8 {
        5
    }

    fn run(&self, plugin: &mut dyn PluginInstance, ctx: &mut TestContext) {
        for index in 0..plugin.parameter_count() {
            let name = plugin.parameter_name(index);
            let random: [f32; 3] = [
                ctx.rng().gen_range(0.0..=1.0),
                ctx.rng().gen_range(0.0..=1.0),
                ctx.rng().gen_range(0.0..=1.0),
            ];
            for value in EXTREME_VALUES.into_iter().chain(random) {
                plugin.set_parameter(index, value);
                let read_back = plugin.parameter(index);
                ctx.expect(
                    read_back.is_finite() && (0.0..=1.0).contains(&read_back),
                    format!("{name}: setting {value} read back as {read_back}"),
                );
            }
        }

        if !prepare_or_fail(plugin, ctx) {
            return;
        }
        let mut buffer = process_buffer(plugin, ctx);
        fill_sine(&mut buffer, ctx.sample_rate(), 0);
        {
            let _window = ctx.realtime_window();
            plugin.process(&mut buffer);
        }
        ctx.expect(buffer.all_finite(), "Non-finite output after parameter fuzzing");
        plugin.release();
    }
}

/// Runs the audio path under allocation checks.
pub struct RealtimeAllocations;

impl PluginTestCase for RealtimeAllocations {
    fn name(&self) -> &str {
        "Real-time allocations"
    }

    fn min_strictness(&self) -> u8 {
        10
    }

    fn run(&self, plugin: &mut dyn PluginInstance, ctx: &mut TestContext) {
        if !ctx.realtime_checks_enabled() {
            ctx.log("Allocation checks are disabled at this strictness level");
            return;
        }
        if !prepare_or_fail(plugin, ctx) {
            return;
        }
        let mut buffer = process_buffer(plugin, ctx);
        let count = plugin.parameter_count();
        ctx.log(format!("Processing {REALTIME_BLOCKS} blocks with allocations disallowed"));

        for block in 0..REALTIME_BLOCKS {
            let automation = if count > 0 {
                Some((ctx.rng().gen_range(0..count), ctx.rng().gen_range(0.0..=1.0)))
            } else {
                None
            };
            fill_sine(&mut buffer, ctx.sample_rate(), block * ctx.block_size());
            let _window = ctx.realtime_window();
            if let Some((index, value)) = automation {
                plugin.set_parameter(index, value);
            }
            plugin.process(&mut buffer);
        }
        ctx.pass();
        plugin.release();
    }
}
