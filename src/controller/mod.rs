//! Controller that distributes the root certificate to selected namespaces
//!
//! The controller observes namespaces, existing root certificate ConfigMaps,
//! the selection policy and the trust bundle, and turns every relevant change
//! into an enqueue of the affected namespace. A single reconcile path then
//! writes the current bundle into that namespace.

mod namespace;

pub use namespace::{is_terminating, Context, ContextBuilder, NamespaceController};
