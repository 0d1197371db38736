//! Per-session capability cache
//!
//! Tool, resource, and prompt listings are cached with no TTL. Each kind has
//! a generation counter; an entry is served only while the generation it was
//! stored under is still current. Invalidation bumps the counter, so a fetch
//! that was in flight across an invalidation stores a stale entry that is
//! never served.

use std::sync::Mutex;

use crate::mcp::types::{McpTool, Prompt, Resource};

/// Which capability listing an operation touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    Tools,
    Resources,
    Prompts,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 3] = [
        CapabilityKind::Tools,
        CapabilityKind::Resources,
        CapabilityKind::Prompts,
    ];
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CapabilityKind::Tools => "tools",
            CapabilityKind::Resources => "resources",
            CapabilityKind::Prompts => "prompts",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u64,
    entry: Option<(u64, Vec<T>)>,
}

impl<T: Clone> Slot<T> {
    fn new() -> Self {
        Self {
            generation: 0,
            entry: None,
        }
    }

    fn get(&self) -> Option<Vec<T>> {
        match &self.entry {
            Some((stored, items)) if *stored == self.generation => Some(items.clone()),
            _ => None,
        }
    }

    fn put(&mut self, generation: u64, items: Vec<T>) -> bool {
        self.entry = Some((generation, items));
        generation == self.generation
    }

    fn bump(&mut self) {
        self.generation += 1;
    }
}

#[derive(Debug)]
struct Slots {
    tools: Slot<McpTool>,
    resources: Slot<Resource>,
    prompts: Slot<Prompt>,
}

/// Generation-checked cache of one server's capability listings.
///
/// # Examples
///
/// ```
/// use conduit::mcp::cache::{CapabilityCache, CapabilityKind};
///
/// let cache = CapabilityCache::default();
/// let gen = cache.generation(CapabilityKind::Tools);
/// cache.put_tools(gen, vec![]);
/// assert!(cache.tools().is_some());
///
/// cache.invalidate(CapabilityKind::Tools);
/// assert!(cache.tools().is_none());
/// ```
#[derive(Debug)]
pub struct CapabilityCache {
    slots: Mutex<Slots>,
}

impl Default for CapabilityCache {
    fn default() -> Self {
        Self {
            slots: Mutex::new(Slots {
                tools: Slot::new(),
                resources: Slot::new(),
                prompts: Slot::new(),
            }),
        }
    }
}

impl CapabilityCache {
    fn slots(&self) -> std::sync::MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Current generation for `kind`. Capture it before fetching.
    pub fn generation(&self, kind: CapabilityKind) -> u64 {
        let slots = self.slots();
        match kind {
            CapabilityKind::Tools => slots.tools.generation,
            CapabilityKind::Resources => slots.resources.generation,
            CapabilityKind::Prompts => slots.prompts.generation,
        }
    }

    /// Mark the `kind` listing stale.
    pub fn invalidate(&self, kind: CapabilityKind) {
        let mut slots = self.slots();
        match kind {
            CapabilityKind::Tools => slots.tools.bump(),
            CapabilityKind::Resources => slots.resources.bump(),
            CapabilityKind::Prompts => slots.prompts.bump(),
        }
        tracing::trace!(kind = %kind, "capability cache invalidated");
    }

    /// Mark every listing stale.
    pub fn invalidate_all(&self) {
        for kind in CapabilityKind::ALL {
            self.invalidate(kind);
        }
    }

    pub fn tools(&self) -> Option<Vec<McpTool>> {
        self.slots().tools.get()
    }

    pub fn resources(&self) -> Option<Vec<Resource>> {
        self.slots().resources.get()
    }

    pub fn prompts(&self) -> Option<Vec<Prompt>> {
        self.slots().prompts.get()
    }

    /// Store tools fetched under `generation`. Returns whether the entry is
    /// current (false if an invalidation happened meanwhile).
    pub fn put_tools(&self, generation: u64, tools: Vec<McpTool>) -> bool {
        self.slots().tools.put(generation, tools)
    }

    pub fn put_resources(&self, generation: u64, resources: Vec<Resource>) -> bool {
        self.slots().resources.put(generation, resources)
    }

    pub fn put_prompts(&self, generation: u64, prompts: Vec<Prompt>) -> bool {
        self.slots().prompts.put(generation, prompts)
    }
}
