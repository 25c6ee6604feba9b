//! Explicit state machine for the onboarding approval lifecycle.
//!
//! The design separates:
//! - **State**: what the store knows (`OnboardingStatus`, `MemberRecord`)
//! - **Decisions**: pure function `(status, action) -> Decision`
//! - **Effects**: what to do (`SideEffect`), as data
//! - **Rendering**: deterministic `VisualSpec` for the approval message
//!
//! The interpreter executes effects against the chat gateway and never
//! feeds back into the decision: a transition out of `Pending` is terminal
//! per submission cycle, and the atomic conditional write in the repository
//! is the only mutual-exclusion primitive.

pub mod decision;
pub mod effect;
pub mod interpreter;
pub mod render;
pub mod repository;
pub mod state;

pub use decision::*;
pub use effect::*;
pub use render::*;
pub use state::*;
