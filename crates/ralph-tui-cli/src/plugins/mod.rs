//! Concrete plugin implementations this binary wires by default. The engine
//! only ever depends on the `TrackerPlugin`/`AgentPlugin` traits (components
//! A/B, external collaborators per spec.md §1); these are the CLI's own
//! choice of backend, swappable by a future registry (spec.md §9's
//! "dynamic plugin registries" design note) without touching core.

pub mod json_tracker;
pub mod subprocess_agent;

pub use json_tracker::JsonFileTrackerPlugin;
pub use subprocess_agent::SubprocessAgentPlugin;
