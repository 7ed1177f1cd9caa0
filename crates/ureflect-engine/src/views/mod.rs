//! Struct and array views
//!
//! A view is `(descriptor, address, owner token)`. The token decides who
//! releases the memory: views built by the runtime own their block, views of
//! host objects borrow it. Views derived from a view (nested structs, arrays,
//! returned structs) clone the token, so the block outlives the variable that
//! created it for as long as any derived view is alive.

mod array;
mod owner;
mod structure;

pub use array::{ArrayIter, ArrayView};
pub use owner::Owner;
pub use structure::StructView;
