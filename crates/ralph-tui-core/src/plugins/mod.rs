//! Plugin contracts (components A, B, C of spec.md §2): [`agent::AgentPlugin`],
//! [`tracker::TrackerPlugin`], [`sandbox::SandboxWrapper`]. These are the only
//! seams through which the core talks to concrete agent CLIs, tracker
//! backends, and sandbox tooling — all external collaborators per spec.md §1.

pub mod agent;
pub mod sandbox;
pub mod tracker;

pub use agent::AgentPlugin;
pub use sandbox::SandboxWrapper;
pub use tracker::TrackerPlugin;
