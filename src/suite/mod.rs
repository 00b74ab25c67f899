//! Test cases and the registry that holds them.

mod builtin;
mod registry;

pub use builtin::{
    register_builtin, AudioProcessing, Automation, BasicBus, EditorLifecycle, FuzzParameters,
    PluginInfo, PluginState, RealtimeAllocations,
};
pub use registry::{RegistryError, TestRegistry};

use crate::engine::TestContext;
use crate::plugin::PluginInstance;

/// One unit of validation.
pub trait PluginTestCase: Send + Sync {
    /// Unique within a registry.
    fn name(&self) -> &str;

    /// Lowest strictness level at which the case runs.
    fn min_strictness(&self) -> u8;

    /// Whether the case opens an editor and so needs GUI support.
    fn requires_gui(&self) -> bool {
        false
    }

    /// Whether the case must run on the message thread.
    fn needs_message_thread(&self) -> bool {
        self.requires_gui()
    }

    fn run(&self, plugin: &mut dyn PluginInstance, ctx: &mut TestContext);
}
