//! The timeline-model glue: one [`StackModel`] per timeline owns the
//! hosts aligned to it and routes delivered activations to them.

use netloom::{Activation, EventTarget, SchedContext, TimelineModel};

use crate::host::Host;

/// The model partition of one timeline.
pub struct StackModel {
    pub hosts: Vec<Host>,
}

impl Default for StackModel {
    fn default() -> Self {
        Self::new()
    }
}

impl StackModel {
    pub fn new() -> Self {
        StackModel { hosts: Vec::new() }
    }

    pub fn host(&self, index: usize) -> &Host {
        &self.hosts[index]
    }

    /// The host with the given textual NHI, if it lives on this timeline.
    pub fn host_by_nhi(&self, nhi: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.nhi.to_string() == nhi)
    }
}

impl TimelineModel for StackModel {
    fn init(&mut self, ctx: &mut SchedContext<'_>) {
        for host in &mut self.hosts {
            host.init(ctx);
        }
    }

    fn deliver(&mut self, target: EventTarget, ac: Activation, ctx: &mut SchedContext<'_>) {
        match self.hosts.get_mut(target.host) {
            Some(host) => host.handle_activation(target.process, ac, ctx),
            None => log::warn!("activation for unknown host {}", target.host),
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
